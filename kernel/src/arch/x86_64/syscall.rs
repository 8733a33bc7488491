//! SYSCALL/SYSRET plumbing.
//!
//! Entry: mask IF via SFMASK, swap GS to reach the per-CPU block, park the
//! user RSP in the scratch slot, load the kernel RSP, push the full user
//! register image, and call the dispatcher. RCX/R11 carry the return RIP
//! and RFLAGS and are restored by the register image pops.

use core::arch::naked_asm;

use x86_64::registers::model_specific::{Efer, EferFlags, LStar, SFMask, Star};
use x86_64::registers::rflags::RFlags;
use x86_64::registers::segmentation::SegmentSelector;
use x86_64::PrivilegeLevel;
use x86_64::VirtAddr;

use super::gdt;
use super::percpu;

/// Program the syscall MSRs on the calling CPU.
pub fn init() {
    unsafe {
        Efer::update(|flags| flags.insert(EferFlags::SYSTEM_CALL_EXTENSIONS));
        Star::write(
            SegmentSelector::new(gdt::USER_CS >> 3, PrivilegeLevel::Ring3),
            SegmentSelector::new(gdt::USER_SS >> 3, PrivilegeLevel::Ring3),
            SegmentSelector::new(gdt::KERNEL_CS >> 3, PrivilegeLevel::Ring0),
            SegmentSelector::new(gdt::KERNEL_SS >> 3, PrivilegeLevel::Ring0),
        )
        .expect("STAR selector layout");
        LStar::write(VirtAddr::new(syscall_entry as usize as u64));
        SFMask::write(RFlags::INTERRUPT_FLAG);
    }
}

/// Point SYSCALL and ring-0 interrupts at `stack_top`.
pub fn set_stack(stack_top: u64) {
    let cpu = percpu::get();
    gdt::set_kernel_stack(cpu, stack_top);
}

/// The SYSCALL target. Builds a `SyscallRegs` frame and calls
/// `syscall_handler(nr, a1, a2, a3, &regs)`; the handler's RAX lands back
/// in the frame so the pops deliver it to user space.
#[unsafe(naked)]
pub unsafe extern "C" fn syscall_entry() {
    naked_asm!(
        "swapgs",
        "mov gs:[8], rsp",  // save user RSP
        "mov rsp, gs:[16]", // switch to the kernel stack
        // Push the user register image (SyscallRegs, rax highest).
        "push rax",
        "push rbx",
        "push rcx",
        "push rdx",
        "push rsi",
        "push rdi",
        "push rbp",
        "push r8",
        "push r9",
        "push r10",
        "push r11",
        "push r12",
        "push r13",
        "push r14",
        "push r15",
        // Arguments: nr, a1, a2, a3, &regs.
        "mov rdi, [rsp + 112]", // saved rax
        "mov rsi, [rsp + 72]",  // saved rdi
        "mov rdx, [rsp + 80]",  // saved rsi
        "mov rcx, [rsp + 88]",  // saved rdx
        "mov r8, rsp",
        "sub rsp, 8", // alignment for the call
        "call {handler}",
        "add rsp, 8",
        "mov [rsp + 112], rax", // return value into the frame's rax
        "cli",
        "pop r15",
        "pop r14",
        "pop r13",
        "pop r12",
        "pop r11",
        "pop r10",
        "pop r9",
        "pop r8",
        "pop rbp",
        "pop rdi",
        "pop rsi",
        "pop rdx",
        "pop rcx",
        "pop rbx",
        "pop rax",
        "mov rsp, gs:[8]", // back to the user stack
        "swapgs",
        "sysretq",
        handler = sym crate::syscall::syscall_handler,
    );
}
