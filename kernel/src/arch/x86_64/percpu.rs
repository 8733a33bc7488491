//! Per-CPU state, reachable through the GS segment base.
//!
//! The block's first word is a self pointer so `gs:[0]` recovers the
//! block; the syscall entry stub uses fixed offsets into it (user RSP at
//! +8, kernel RSP at +16), so the layout here is ABI for that stub.

use core::ptr::addr_of_mut;

use x86_64::registers::model_specific::{GsBase, KernelGsBase};
use x86_64::structures::gdt::GlobalDescriptorTable;
use x86_64::structures::tss::TaskStateSegment;
use x86_64::VirtAddr;

use crate::sched::Thread;

pub const MAX_CPUS: usize = 32;

/// Per-CPU block. Offsets of the first four fields are relied upon by
/// `syscall_entry`.
#[repr(C)]
pub struct CpuLocal {
    pub self_ptr: *mut CpuLocal,     // gs:[0]
    pub user_rsp: u64,               // gs:[8], syscall scratch
    pub kernel_rsp: u64,             // gs:[16], stack SYSCALL lands on
    pub current_thread: *const Thread, // gs:[24]
    pub lapic_id: u32,
    pub tss: TaskStateSegment,
    pub gdt: Option<GlobalDescriptorTable>,
}

const EMPTY: CpuLocal = CpuLocal {
    self_ptr: core::ptr::null_mut(),
    user_rsp: 0,
    kernel_rsp: 0,
    current_thread: core::ptr::null(),
    lapic_id: 0,
    tss: TaskStateSegment::new(),
    gdt: None,
};

static mut CPUS: [CpuLocal; MAX_CPUS] = [EMPTY; MAX_CPUS];

/// The block for CPU `index`; valid for the lifetime of the kernel.
pub fn cpu_block(index: usize) -> *mut CpuLocal {
    assert!(index < MAX_CPUS);
    unsafe { addr_of_mut!(CPUS[index]) }
}

/// Point GS (and the kernel GS swap slot) at CPU `index`'s block.
///
/// # Safety
/// Must run once per CPU, on that CPU, before anything reads `gs:`.
pub unsafe fn install(index: usize, lapic_id: u32) -> *mut CpuLocal {
    let block = cpu_block(index);
    unsafe {
        (*block).self_ptr = block;
        (*block).lapic_id = lapic_id;
        // Null GS/FS selectors so the MSR base is authoritative.
        core::arch::asm!(
            "xor eax, eax",
            "mov gs, eax",
            "mov fs, eax",
            out("eax") _,
        );
        GsBase::write(VirtAddr::new(block as u64));
        KernelGsBase::write(VirtAddr::new(block as u64));
    }
    block
}

/// The calling CPU's block.
pub fn get() -> &'static mut CpuLocal {
    let block: *mut CpuLocal;
    unsafe {
        core::arch::asm!("mov {}, gs:[0]", out(reg) block, options(nostack, preserves_flags));
        &mut *block
    }
}
