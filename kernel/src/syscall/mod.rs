//! System call dispatch.
//!
//! Entry is via the `SYSCALL` instruction (see `arch::x86_64::syscall`);
//! the number arrives in RAX and arguments in RDI/RSI/RDX/R10/R8/R9. The
//! number selects a handler from a fixed table; every handler validates
//! user pointers against the user/kernel split before touching them.
//! Recoverable failures surface as -1; unknown numbers log and return -1.

pub mod fs;
pub mod memory;
#[cfg(all(target_arch = "x86_64", target_os = "none"))]
pub mod proc;

use crate::error::{KernelError, KernelResult};

/// User addresses must lie strictly below the canonical user/kernel split.
pub const USER_TOP: u64 = 0x8000_0000_0000;

/// System call numbers (the user ABI).
#[repr(u64)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Syscall {
    Write = 0,
    Read = 1,
    Exec = 2,
    Exit = 3,
    Fork = 4,
    Wait = 5,
    GetPid = 6,
    Yield = 7,
    Spawn = 8,
    Sbrk = 9,
    Open = 10,
    Close = 11,
    ReadDir = 12,
    Chdir = 13,
    Sleep = 14,
    MkNod = 15,
    Ioctl = 16,
    Mmap = 17,
    Munmap = 18,
    Execve = 19,
    Stat = 20,
    Fstat = 21,
    Link = 22,
    Unlink = 23,
    GetCwd = 24,
    GetTimeOfDay = 25,
    Usleep = 26,
    Pipe = 27,
    Lseek = 28,
    Dup = 29,
    Kill = 30,
    Shutdown = 31,
    Reboot = 32,
}

impl TryFrom<u64> for Syscall {
    type Error = KernelError;

    fn try_from(value: u64) -> Result<Self, Self::Error> {
        Ok(match value {
            0 => Syscall::Write,
            1 => Syscall::Read,
            2 => Syscall::Exec,
            3 => Syscall::Exit,
            4 => Syscall::Fork,
            5 => Syscall::Wait,
            6 => Syscall::GetPid,
            7 => Syscall::Yield,
            8 => Syscall::Spawn,
            9 => Syscall::Sbrk,
            10 => Syscall::Open,
            11 => Syscall::Close,
            12 => Syscall::ReadDir,
            13 => Syscall::Chdir,
            14 => Syscall::Sleep,
            15 => Syscall::MkNod,
            16 => Syscall::Ioctl,
            17 => Syscall::Mmap,
            18 => Syscall::Munmap,
            19 => Syscall::Execve,
            20 => Syscall::Stat,
            21 => Syscall::Fstat,
            22 => Syscall::Link,
            23 => Syscall::Unlink,
            24 => Syscall::GetCwd,
            25 => Syscall::GetTimeOfDay,
            26 => Syscall::Usleep,
            27 => Syscall::Pipe,
            28 => Syscall::Lseek,
            29 => Syscall::Dup,
            30 => Syscall::Kill,
            31 => Syscall::Shutdown,
            32 => Syscall::Reboot,
            nr => return Err(KernelError::UnknownSyscall(nr)),
        })
    }
}

/// Check that `[addr, addr + len)` is a plausible user range: below the
/// split, non-wrapping, and (with `kasan`) not poisoned.
pub fn validate_user_range(addr: u64, len: usize) -> KernelResult<()> {
    if len == 0 {
        return Ok(());
    }
    let end = addr
        .checked_add(len as u64)
        .ok_or(KernelError::BadAddress(addr))?;
    if addr == 0 || end > USER_TOP {
        return Err(KernelError::BadAddress(addr));
    }
    #[cfg(feature = "kasan")]
    if !crate::mm::kasan::check_range(addr as *const u8, len) {
        return Err(KernelError::BadAddress(addr));
    }
    Ok(())
}

/// Saved user register image pushed by the syscall entry stub. Field order
/// matches the push sequence (r15 at the lowest address).
#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct SyscallRegs {
    pub r15: u64,
    pub r14: u64,
    pub r13: u64,
    pub r12: u64,
    pub r11: u64,
    pub r10: u64,
    pub r9: u64,
    pub r8: u64,
    pub rbp: u64,
    pub rdi: u64,
    pub rsi: u64,
    pub rdx: u64,
    pub rcx: u64,
    pub rbx: u64,
    pub rax: u64,
}

#[cfg(all(target_arch = "x86_64", target_os = "none"))]
mod dispatch;
#[cfg(all(target_arch = "x86_64", target_os = "none"))]
pub use dispatch::syscall_handler;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn numbers_round_trip() {
        for nr in 0..=32u64 {
            let call = Syscall::try_from(nr).unwrap();
            assert_eq!(call as u64, nr);
        }
    }

    #[test]
    fn unknown_numbers_are_rejected() {
        assert!(matches!(
            Syscall::try_from(33),
            Err(KernelError::UnknownSyscall(33))
        ));
        assert!(matches!(
            Syscall::try_from(u64::MAX),
            Err(KernelError::UnknownSyscall(_))
        ));
    }

    #[test]
    fn user_range_validation_enforces_the_split() {
        assert!(validate_user_range(0x1000, 64).is_ok());
        assert!(validate_user_range(USER_TOP - 64, 64).is_ok());
        assert!(validate_user_range(USER_TOP - 63, 64).is_err());
        assert!(validate_user_range(USER_TOP, 1).is_err());
        assert!(validate_user_range(0xFFFF_8000_0000_0000, 8).is_err());
        assert!(validate_user_range(0, 8).is_err(), "NULL is never valid");
        assert!(validate_user_range(u64::MAX - 2, 8).is_err(), "wraps");
        // Zero-length accesses are vacuously fine.
        assert!(validate_user_range(USER_TOP + 5, 0).is_ok());
    }

    #[test]
    fn regs_layout_matches_the_push_order() {
        assert_eq!(core::mem::size_of::<SyscallRegs>(), 15 * 8);
        assert_eq!(core::mem::offset_of!(SyscallRegs, r15), 0);
        assert_eq!(core::mem::offset_of!(SyscallRegs, rdi), 9 * 8);
        assert_eq!(core::mem::offset_of!(SyscallRegs, rax), 14 * 8);
    }
}
