//! GDT and TSS, one pair per CPU.
//!
//! Selector layout is ABI for SYSCALL/SYSRET (STAR): kernel code 0x08,
//! kernel data 0x10, user data 0x18, user code 0x20, TSS 0x28.

use x86_64::instructions::segmentation::{Segment, CS, SS};
use x86_64::instructions::tables::load_tss;
use x86_64::structures::gdt::{Descriptor, GlobalDescriptorTable};

use super::percpu::CpuLocal;

pub const KERNEL_CS: u16 = 0x08;
pub const KERNEL_SS: u16 = 0x10;
pub const USER_SS: u16 = 0x18 | 3;
pub const USER_CS: u16 = 0x20 | 3;

/// Build and load this CPU's GDT and TSS.
///
/// # Safety
/// `cpu` must be this CPU's static block, and GS must already point at it.
pub unsafe fn init(cpu: &'static mut CpuLocal) {
    let mut gdt = GlobalDescriptorTable::new();
    let kernel_cs = gdt.append(Descriptor::kernel_code_segment());
    let kernel_ss = gdt.append(Descriptor::kernel_data_segment());
    let user_ss = gdt.append(Descriptor::user_data_segment());
    let user_cs = gdt.append(Descriptor::user_code_segment());
    debug_assert_eq!(kernel_cs.0, KERNEL_CS);
    debug_assert_eq!(kernel_ss.0, KERNEL_SS);
    debug_assert_eq!(user_ss.0, USER_SS);
    debug_assert_eq!(user_cs.0, USER_CS);

    cpu.gdt = Some(gdt);
    let gdt_ref = cpu.gdt.as_mut().unwrap();
    // The TSS lives in the same static block as the GDT.
    let tss_sel = gdt_ref.append(Descriptor::tss_segment(unsafe {
        &*(&cpu.tss as *const _)
    }));

    gdt_ref.load();
    unsafe {
        CS::set_reg(kernel_cs);
        SS::set_reg(kernel_ss);
        load_tss(tss_sel);
    }
}

/// Update the stack interrupts/syscalls land on for the running thread.
pub fn set_kernel_stack(cpu: &mut CpuLocal, stack_top: u64) {
    cpu.kernel_rsp = stack_top;
    cpu.tss.privilege_stack_table[0] = x86_64::VirtAddr::new(stack_top);
}
