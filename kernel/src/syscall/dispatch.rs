//! The kernel-side syscall dispatcher (bare metal).
//!
//! Pointer arguments are validated against the user/kernel split and then
//! used in place: user memory is mapped in the live address space, so the
//! kernel reads and writes it directly after validation.

use alloc::string::String;
use alloc::vec::Vec;

use crate::error::{KernelError, KernelResult};
use crate::fs::{self, DirEntry, IoctlValue, Stat};
use crate::sched;

use super::{fs as fs_calls, memory, proc, validate_user_range, Syscall, SyscallRegs};

/// The user-facing dirent record (`readdir`).
#[repr(C)]
struct UserDirent {
    name: [u8; 128],
    inode: u32,
}

/// The user-facing stat record.
#[repr(C)]
struct UserStat {
    dev: i32,
    ino: i32,
    kind: i32,
    nlink: i32,
    size: i64,
    atime: u32,
    ctime: u32,
    mtime: u32,
    dtime: u32,
}

impl From<Stat> for UserStat {
    fn from(st: Stat) -> Self {
        UserStat {
            dev: 0,
            ino: st.ino as i32,
            kind: st.kind_raw as i32,
            nlink: st.nlink as i32,
            size: st.size as i64,
            atime: st.atime,
            ctime: st.ctime,
            mtime: st.mtime,
            dtime: st.dtime,
        }
    }
}

/// The user-facing timeval pair for gettimeofday.
#[repr(C)]
struct UserTimeval {
    tv_sec: i64,
    tv_usec: i64,
}

fn user_slice(addr: u64, len: usize) -> KernelResult<&'static [u8]> {
    validate_user_range(addr, len)?;
    Ok(unsafe { core::slice::from_raw_parts(addr as *const u8, len) })
}

fn user_slice_mut(addr: u64, len: usize) -> KernelResult<&'static mut [u8]> {
    validate_user_range(addr, len)?;
    Ok(unsafe { core::slice::from_raw_parts_mut(addr as *mut u8, len) })
}

/// Copy a NUL-terminated user string, bounded by PATH_MAX.
fn copy_user_str(addr: u64) -> KernelResult<String> {
    validate_user_range(addr, 1)?;
    let mut bytes = Vec::new();
    for i in 0..fs::PATH_MAX as u64 {
        validate_user_range(addr + i, 1)?;
        let b = unsafe { *((addr + i) as *const u8) };
        if b == 0 {
            return Ok(String::from_utf8_lossy(&bytes).into_owned());
        }
        bytes.push(b);
    }
    Err(KernelError::InvalidPath)
}

fn copy_out<T: Copy>(addr: u64, value: &T) -> KernelResult<()> {
    validate_user_range(addr, core::mem::size_of::<T>())?;
    unsafe { core::ptr::write_unaligned(addr as *mut T, *value) };
    Ok(())
}

/// Read the argv pointer array for execve (NULL-terminated, bounded).
fn copy_user_args(argv_addr: u64) -> KernelResult<Vec<String>> {
    let mut args = Vec::new();
    if argv_addr == 0 {
        return Ok(args);
    }
    for i in 0..crate::sched::exec::EXEC_MAX_ARGS as u64 {
        let slot = argv_addr + i * 8;
        validate_user_range(slot, 8)?;
        let ptr = unsafe { *(slot as *const u64) };
        if ptr == 0 {
            return Ok(args);
        }
        let arg = copy_user_str(ptr)?;
        if arg.len() + 1 > crate::sched::exec::EXEC_MAX_ARG_LEN {
            return Err(KernelError::InvalidArgument);
        }
        args.push(arg);
    }
    Ok(args)
}

fn ioctl_copy_out(addr: u64, value: IoctlValue) -> KernelResult<()> {
    match value {
        IoctlValue::U32(v) => copy_out(addr, &v),
        IoctlValue::U64(v) => copy_out(addr, &v),
        IoctlValue::WinSize {
            rows,
            cols,
            xpixel,
            ypixel,
        } => {
            #[repr(C)]
            #[derive(Clone, Copy)]
            struct WinSize {
                ws_row: u16,
                ws_col: u16,
                ws_xpixel: u16,
                ws_ypixel: u16,
            }
            copy_out(
                addr,
                &WinSize {
                    ws_row: rows,
                    ws_col: cols,
                    ws_xpixel: xpixel,
                    ws_ypixel: ypixel,
                },
            )
        }
    }
}

fn dispatch(call: Syscall, a1: u64, a2: u64, a3: u64, regs: &mut SyscallRegs) -> KernelResult<u64> {
    let ns = fs::ns();
    let a4 = regs.r10;
    let a5 = regs.r8;
    let a6 = regs.r9;

    match call {
        Syscall::Write => {
            let proc = sched::current_process().ok_or(KernelError::NoSuchProcess)?;
            let buf = user_slice(a2, a3 as usize)?;
            fs_calls::write(&proc, a1 as usize, buf).map(|n| n as u64)
        }
        Syscall::Read => {
            let proc = sched::current_process().ok_or(KernelError::NoSuchProcess)?;
            let buf = user_slice_mut(a2, a3 as usize)?;
            fs_calls::read(&proc, a1 as usize, buf).map(|n| n as u64)
        }
        Syscall::Exec => {
            let path = copy_user_str(a1)?;
            proc::sys_execve(&path, &[path.as_str()], regs)
        }
        Syscall::Exit => proc::sys_exit(a1 as i32),
        Syscall::Fork => proc::sys_fork(regs),
        Syscall::Wait => {
            let (pid, code) = proc::sys_wait()?;
            if a1 != 0 {
                copy_out(a1, &code)?;
            }
            Ok(pid)
        }
        Syscall::GetPid => proc::sys_getpid(),
        Syscall::Yield => {
            sched::yield_now();
            Ok(0)
        }
        Syscall::Spawn => {
            let path = copy_user_str(a1)?;
            proc::sys_spawn(&path)
        }
        Syscall::Sbrk => {
            let proc = sched::current_process().ok_or(KernelError::NoSuchProcess)?;
            memory::sbrk(&proc, a1 as i64)
        }
        Syscall::Open => {
            let proc = sched::current_process().ok_or(KernelError::NoSuchProcess)?;
            let path = copy_user_str(a1)?;
            fs_calls::open(ns, &proc, &path, a2 as u32).map(|fd| fd as u64)
        }
        Syscall::Close => {
            let proc = sched::current_process().ok_or(KernelError::NoSuchProcess)?;
            fs_calls::close(&proc, a1 as usize).map(|_| 0)
        }
        Syscall::ReadDir => {
            let proc = sched::current_process().ok_or(KernelError::NoSuchProcess)?;
            let mut entry = DirEntry {
                name: String::new(),
                ino: 0,
            };
            if !fs_calls::readdir(&proc, a1 as usize, &mut entry)? {
                return Ok(0);
            }
            let mut out = UserDirent {
                name: [0; 128],
                inode: entry.ino as u32,
            };
            let n = entry.name.len().min(127);
            out.name[..n].copy_from_slice(&entry.name.as_bytes()[..n]);
            validate_user_range(a2, core::mem::size_of::<UserDirent>())?;
            unsafe { core::ptr::write_unaligned(a2 as *mut UserDirent, out) };
            Ok(1)
        }
        Syscall::Chdir => {
            let proc = sched::current_process().ok_or(KernelError::NoSuchProcess)?;
            let path = copy_user_str(a1)?;
            fs_calls::chdir(ns, &proc, &path).map(|_| 0)
        }
        Syscall::Sleep => proc::sys_sleep(a1),
        Syscall::MkNod => {
            let proc = sched::current_process().ok_or(KernelError::NoSuchProcess)?;
            let path = copy_user_str(a1)?;
            fs_calls::mknod(ns, &proc, &path, a2 as u32, a3 as u32).map(|_| 0)
        }
        Syscall::Ioctl => {
            let proc = sched::current_process().ok_or(KernelError::NoSuchProcess)?;
            let value = fs_calls::ioctl(&proc, a1 as usize, a2 as u32)?;
            ioctl_copy_out(a3, value)?;
            Ok(0)
        }
        Syscall::Mmap => {
            let proc = sched::current_process().ok_or(KernelError::NoSuchProcess)?;
            let fd = a5 as usize;
            let file = proc.files.lock().get(fd)?;
            let node = file.lock().node.clone();
            memory::mmap(&proc, a1, a2, a4 as u32, &node, a6)
        }
        Syscall::Munmap => {
            let proc = sched::current_process().ok_or(KernelError::NoSuchProcess)?;
            memory::munmap(&proc, a1, a2).map(|_| 0)
        }
        Syscall::Execve => {
            let path = copy_user_str(a1)?;
            let args = copy_user_args(a2)?;
            let mut arg_refs: Vec<&str> = args.iter().map(String::as_str).collect();
            if arg_refs.is_empty() {
                arg_refs.push(&path);
            }
            proc::sys_execve(&path, &arg_refs, regs)
        }
        Syscall::Stat => {
            let proc = sched::current_process().ok_or(KernelError::NoSuchProcess)?;
            let path = copy_user_str(a1)?;
            let st = fs_calls::stat(ns, &proc, &path)?;
            copy_out(a2, &UserStat::from(st))?;
            Ok(0)
        }
        Syscall::Fstat => {
            let proc = sched::current_process().ok_or(KernelError::NoSuchProcess)?;
            let st = fs_calls::fstat(&proc, a1 as usize)?;
            copy_out(a2, &UserStat::from(st))?;
            Ok(0)
        }
        Syscall::Link => {
            let proc = sched::current_process().ok_or(KernelError::NoSuchProcess)?;
            let old = copy_user_str(a1)?;
            let new = copy_user_str(a2)?;
            fs_calls::link(ns, &proc, &old, &new).map(|_| 0)
        }
        Syscall::Unlink => {
            let proc = sched::current_process().ok_or(KernelError::NoSuchProcess)?;
            let path = copy_user_str(a1)?;
            fs_calls::unlink(ns, &proc, &path).map(|_| 0)
        }
        Syscall::GetCwd => {
            let proc = sched::current_process().ok_or(KernelError::NoSuchProcess)?;
            let buf = user_slice_mut(a1, a2 as usize)?;
            fs_calls::getcwd(&proc, buf).map(|_| 0)
        }
        Syscall::GetTimeOfDay => {
            let ns_now = proc::time_nanos();
            if a1 != 0 {
                copy_out(
                    a1,
                    &UserTimeval {
                        tv_sec: (ns_now / 1_000_000_000) as i64,
                        tv_usec: ((ns_now % 1_000_000_000) / 1_000) as i64,
                    },
                )?;
            }
            if a2 != 0 {
                copy_out(a2, &[0i32, 0i32])?;
            }
            Ok(0)
        }
        Syscall::Usleep => proc::sys_usleep(a1),
        Syscall::Pipe => {
            let proc = sched::current_process().ok_or(KernelError::NoSuchProcess)?;
            let (r, w) = fs_calls::make_pipe(&proc)?;
            copy_out(a1, &[r as i32, w as i32])?;
            Ok(0)
        }
        Syscall::Lseek => {
            let proc = sched::current_process().ok_or(KernelError::NoSuchProcess)?;
            fs_calls::lseek(&proc, a1 as usize, a2 as i64, a3 as u32).map(|off| off as u64)
        }
        Syscall::Dup => {
            let proc = sched::current_process().ok_or(KernelError::NoSuchProcess)?;
            fs_calls::dup(&proc, a1 as usize).map(|fd| fd as u64)
        }
        Syscall::Kill => proc::sys_kill(a1 as i32, a2 as i32),
        Syscall::Shutdown => crate::shutdown(),
        Syscall::Reboot => crate::reboot(),
    }
}

/// C-ABI entry called from the syscall stub.
#[no_mangle]
pub extern "C" fn syscall_handler(
    nr: u64,
    a1: u64,
    a2: u64,
    a3: u64,
    regs: *mut SyscallRegs,
) -> u64 {
    // Interrupts were masked by SFMASK; long syscalls may block, so allow
    // preemption while in kernel context.
    x86_64::instructions::interrupts::enable();

    let regs = unsafe { &mut *regs };
    let result = match Syscall::try_from(nr) {
        Ok(call) => dispatch(call, a1, a2, a3, regs),
        Err(e) => {
            log::warn!("syscall: unknown number {}", nr);
            Err(e)
        }
    };

    match result {
        Ok(value) => value,
        Err(e) => e.as_sysret() as u64,
    }
}

const _: () = {
    // The dispatcher assumes the regs pointer fits the frame the entry
    // stub pushes.
    assert!(core::mem::size_of::<SyscallRegs>() == 120);
};
