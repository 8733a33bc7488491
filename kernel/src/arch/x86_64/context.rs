//! Context switch and SIMD state primitives.
//!
//! The kernel context is the callee-saved register set plus the return
//! address, stored on the outgoing thread's kernel stack; the saved stack
//! pointer *is* the context. FPU/SIMD state uses XSAVE/XSAVEOPT when the
//! CPU has them, falling back to the 512-byte FXSAVE area.

use core::arch::asm;
use core::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use crate::sched::FpuState;

/// Callee-saved register image at the top of a fresh thread's stack.
/// Field order matches the push/pop sequence in [`switch_context`].
#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct Context {
    pub r15: u64,
    pub r14: u64,
    pub r13: u64,
    pub r12: u64,
    pub rbx: u64,
    pub rbp: u64,
    pub rip: u64,
}

/// Save the current kernel context into `*prev_slot` and resume `next`.
///
/// # Safety
/// `prev_slot` must be the outgoing thread's context slot and `next` a
/// stack pointer previously produced by this function (or a fresh
/// [`Context`] image).
#[unsafe(naked)]
pub unsafe extern "C" fn switch_context(prev_slot: *mut u64, next: u64) {
    core::arch::naked_asm!(
        "push rbp",
        "push rbx",
        "push r12",
        "push r13",
        "push r14",
        "push r15",
        "mov [rdi], rsp",
        "mov rsp, rsi",
        "pop r15",
        "pop r14",
        "pop r13",
        "pop r12",
        "pop rbx",
        "pop rbp",
        "ret",
    );
}

static USE_XSAVE: AtomicBool = AtomicBool::new(false);
static USE_XSAVEOPT: AtomicBool = AtomicBool::new(false);
static XSAVE_MASK: AtomicU64 = AtomicU64::new(0x3); // x87 | SSE

fn cpuid(leaf: u32, subleaf: u32) -> (u32, u32, u32, u32) {
    let eax: u32;
    let ebx: u32;
    let ecx: u32;
    let edx: u32;
    unsafe {
        asm!(
            "push rbx",
            "cpuid",
            "mov {ebx_out:e}, ebx",
            "pop rbx",
            ebx_out = out(reg) ebx,
            inout("eax") leaf => eax,
            inout("ecx") subleaf => ecx,
            out("edx") edx,
        );
    }
    (eax, ebx, ecx, edx)
}

/// Enable SSE/AVX state handling on the calling CPU.
pub fn enable_simd() {
    unsafe {
        use x86_64::registers::control::{Cr0, Cr0Flags, Cr4, Cr4Flags};
        let mut cr0 = Cr0::read();
        cr0.remove(Cr0Flags::EMULATE_COPROCESSOR);
        cr0.remove(Cr0Flags::TASK_SWITCHED);
        cr0.insert(Cr0Flags::MONITOR_COPROCESSOR);
        Cr0::write(cr0);

        let mut cr4 = Cr4::read();
        cr4.insert(Cr4Flags::OSFXSR);
        cr4.insert(Cr4Flags::OSXMMEXCPT_ENABLE);

        let (_, _, ecx, _) = cpuid(1, 0);
        let has_xsave = ecx & (1 << 26) != 0;
        let has_avx = ecx & (1 << 28) != 0;

        if has_xsave {
            cr4.insert(Cr4Flags::OSXSAVE);
        }
        Cr4::write(cr4);

        if has_xsave {
            let mut mask = 0x3u64; // x87 | SSE
            let (eax, _, _, edx) = cpuid(0xD, 0);
            let supported = ((edx as u64) << 32) | eax as u64;
            if has_avx && supported & 0x4 != 0 {
                mask |= 0x4; // AVX
            }
            mask &= supported;

            // XSETBV: enable the chosen state components.
            asm!(
                "xsetbv",
                in("ecx") 0u32,
                in("eax") (mask & 0xFFFF_FFFF) as u32,
                in("edx") (mask >> 32) as u32,
            );

            let (eax1, _, _, _) = cpuid(0xD, 1);
            USE_XSAVEOPT.store(eax1 & 1 != 0, Ordering::Release);
            USE_XSAVE.store(true, Ordering::Release);
            XSAVE_MASK.store(mask, Ordering::Release);
        }

        asm!("fninit");
        let mxcsr: u32 = 0x1F80;
        asm!("ldmxcsr [{}]", in(reg) &mxcsr);
    }
}

/// Save the SIMD/FPU state of the current thread.
pub fn save_fpu(state: &mut FpuState) {
    let ptr = state.0.as_mut_ptr();
    unsafe {
        if USE_XSAVE.load(Ordering::Acquire) {
            let mask = XSAVE_MASK.load(Ordering::Acquire);
            // XSAVE header lives at offset 512; already zeroed at init.
            if USE_XSAVEOPT.load(Ordering::Acquire) {
                asm!(
                    "xsaveopt [{}]",
                    in(reg) ptr,
                    in("eax") (mask & 0xFFFF_FFFF) as u32,
                    in("edx") (mask >> 32) as u32,
                    options(nostack),
                );
            } else {
                asm!(
                    "xsave [{}]",
                    in(reg) ptr,
                    in("eax") (mask & 0xFFFF_FFFF) as u32,
                    in("edx") (mask >> 32) as u32,
                    options(nostack),
                );
            }
        } else {
            asm!("fxsave [{}]", in(reg) ptr, options(nostack));
        }
    }
}

/// Restore the SIMD/FPU state of the incoming thread.
pub fn restore_fpu(state: &FpuState) {
    let ptr = state.0.as_ptr();
    unsafe {
        if USE_XSAVE.load(Ordering::Acquire) {
            let mask = XSAVE_MASK.load(Ordering::Acquire);
            asm!(
                "xrstor [{}]",
                in(reg) ptr,
                in("eax") (mask & 0xFFFF_FFFF) as u32,
                in("edx") (mask >> 32) as u32,
                options(nostack),
            );
        } else {
            asm!("fxrstor [{}]", in(reg) ptr, options(nostack));
        }
    }
}
