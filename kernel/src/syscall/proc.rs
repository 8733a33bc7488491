//! Process system calls: fork, exec, spawn, wait, exit, kill, sleep.
//!
//! Bare-metal only: these manipulate the current thread, kernel stacks,
//! and user register frames.

use alloc::sync::Arc;
use alloc::vec::Vec;

use core::sync::atomic::Ordering;

use crate::arch::x86_64::{context, gdt, percpu, tsc};
use crate::error::{KernelError, KernelResult};
use crate::fs::{self, OpenFile, OpenFlags};
use crate::mm::vma::VmaFlags;
use crate::mm::vmm::{AddressSpace, PteFlags};
use crate::mm::{pmm, VirtAddr, PAGE_SIZE};
use crate::sched::exec::{exec_image, set_name_from_path, USER_STACK_SIZE, USER_STACK_TOP};
use crate::sched::{
    self, exit_process, fork_bookkeeping, kill, wait_scan, Process, ThreadState, WaitScan,
};

use super::SyscallRegs;

/// Read a whole file through the VFS (for exec/spawn images).
fn read_file(ns: &fs::Namespace, proc: &Arc<Process>, path: &str) -> KernelResult<Vec<u8>> {
    let abs = fs::path::absolute(&proc.cwd.lock(), path);
    let node = ns.resolve(&abs)?;
    let size = node.size() as usize;
    let mut data = alloc::vec![0u8; size];
    let mut off = 0usize;
    while off < size {
        let n = node.read(off as u64, &mut data[off..])?;
        if n == 0 {
            break;
        }
        off += n;
    }
    data.truncate(off);
    Ok(data)
}

pub fn sys_getpid() -> KernelResult<u64> {
    sched::current_pid()
        .map(|pid| pid as u64)
        .ok_or(KernelError::NoSuchProcess)
}

/// Fork: one syscall that returns twice. The child's kernel stack is laid
/// out so the first switch into it lands in a trampoline that replays the
/// parent's user register image with RAX forced to zero.
pub fn sys_fork(regs: &SyscallRegs) -> KernelResult<u64> {
    let parent = sched::current_process().ok_or(KernelError::NoSuchProcess)?;

    let (child, thread) = sched::with_table(|t| fork_bookkeeping(t, &parent))?;

    // Child stack: [regs image][context -> fork_child_trampoline].
    let top = thread.kstack_top();
    let regs_at = top - core::mem::size_of::<SyscallRegs>() as u64;
    let mut child_regs = *regs;
    child_regs.rax = 0;
    unsafe { core::ptr::write(regs_at as *mut SyscallRegs, child_regs) };

    let ctx_at = regs_at - core::mem::size_of::<context::Context>() as u64;
    let ctx = context::Context {
        rip: fork_child_trampoline as usize as u64,
        ..context::Context::default()
    };
    unsafe { core::ptr::write(ctx_at as *mut context::Context, ctx) };
    thread.context.store(ctx_at, Ordering::Release);

    // The child resumes on the parent's current user stack pointer.
    thread
        .saved_user_rsp
        .store(percpu::get().user_rsp, Ordering::Release);
    thread.set_state(ThreadState::Ready);

    Ok(child.pid as u64)
}

/// First instructions of a forked child: release the scheduler lock
/// inherited from the switch, then replay the saved user registers and
/// sysret with RAX = 0.
#[unsafe(naked)]
unsafe extern "C" fn fork_child_trampoline() {
    core::arch::naked_asm!(
        "call {release}",
        // RSP now points at the SyscallRegs image.
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
        "mov rsp, gs:[8]",
        "swapgs",
        "sysretq",
        release = sym crate::sched::trampoline_unlock,
    );
}

/// Exec: replace the current image. On success the saved RCX (the sysret
/// RIP) is retargeted at the new entry point and the user RSP scratch at
/// the fresh stack.
pub fn sys_execve(path: &str, args: &[&str], regs: &mut SyscallRegs) -> KernelResult<u64> {
    let proc = sched::current_process().ok_or(KernelError::NoSuchProcess)?;
    let image = read_file(fs::ns(), &proc, path)?;

    let outcome = exec_image(&proc, &image, args)?;
    set_name_from_path(&proc, path);

    // Run on the new tables before tearing the old ones down.
    unsafe {
        crate::mm::vmm::switch_root(crate::mm::PhysAddr::new(
            proc.cr3.load(Ordering::Acquire),
        ));
    }
    if let Some(old) = outcome.old_space {
        old.destroy();
    }

    regs.rcx = outcome.entry;
    percpu::get().user_rsp = outcome.user_rsp;
    Ok(0)
}

/// Spawn: fork+exec in one call. Builds a fresh process running `path`
/// without touching the caller's image.
pub fn sys_spawn(path: &str) -> KernelResult<u64> {
    let parent = sched::current_process().ok_or(KernelError::NoSuchProcess)?;
    let image = read_file(fs::ns(), &parent, path)?;

    let space = AddressSpace::new()?;
    let loaded = match crate::elf::load_bytes(&image, &space) {
        Ok(l) => l,
        Err(e) => {
            space.destroy();
            return Err(e);
        }
    };

    // User stack.
    let stack_base = USER_STACK_TOP - USER_STACK_SIZE;
    let mut va = stack_base;
    while va < USER_STACK_TOP {
        let phys = pmm::alloc_zeroed_page().ok_or(KernelError::OutOfMemory)?;
        space.map(
            VirtAddr::new(va),
            phys,
            PteFlags::PRESENT | PteFlags::WRITABLE | PteFlags::USER | PteFlags::NX,
        )?;
        va += PAGE_SIZE as u64;
    }

    let (child, thread) = sched::with_table(|t| {
        let cwd = parent.cwd.lock().clone();
        let child = t.create_process(path, Some(parent.pid), cwd);
        let thread = t.create_thread(&child, false);
        // Not runnable until the kernel stack is laid out.
        thread.set_state(ThreadState::Blocked);
        (child, thread)
    });
    set_name_from_path(&child, path);
    child.install_addr_space(space);
    child.heap_end.store(loaded.max_vaddr, Ordering::Release);
    *child.files.lock() = parent.files.lock().clone_for_fork();
    child.vmas.lock().add(
        stack_base,
        USER_STACK_TOP,
        VmaFlags::READ | VmaFlags::WRITE | VmaFlags::USER | VmaFlags::STACK,
    );

    thread.user_entry.store(loaded.entry, Ordering::Release);
    thread.user_stack.store(USER_STACK_TOP, Ordering::Release);
    sched::init_thread_stack(&thread, user_entry_trampoline);
    thread.set_state(ThreadState::Ready);

    Ok(child.pid as u64)
}

/// Kernel-side entry of spawned user threads: drop to ring 3 at the
/// recorded entry/stack.
pub extern "C" fn user_entry_trampoline() -> ! {
    let thread = sched::current_thread().expect("user trampoline without thread");
    let entry = thread.user_entry.load(Ordering::Acquire);
    let stack = thread.user_stack.load(Ordering::Acquire);
    unsafe { enter_user(entry, stack) }
}

/// IRETQ into ring 3.
///
/// # Safety
/// `entry`/`stack` must be mapped user-accessible in the live space.
pub unsafe fn enter_user(entry: u64, stack: u64) -> ! {
    let user_cs = gdt::USER_CS as u64;
    let user_ss = gdt::USER_SS as u64;
    let rflags: u64 = 0x202; // IF set
    unsafe {
        core::arch::asm!(
            "cli",
            "swapgs",
            "push {ss}",
            "push {stack}",
            "push {rflags}",
            "push {cs}",
            "push {entry}",
            "xor edi, edi",
            "xor esi, esi",
            "iretq",
            ss = in(reg) user_ss,
            stack = in(reg) stack,
            rflags = in(reg) rflags,
            cs = in(reg) user_cs,
            entry = in(reg) entry,
            options(noreturn),
        );
    }
}

/// Wait: reap a terminated child, blocking on this process's wait channel
/// until one exits.
pub fn sys_wait() -> KernelResult<(u64, i32)> {
    let proc = sched::current_process().ok_or(KernelError::NoSuchProcess)?;
    loop {
        let outcome = sched::with_table(|t| wait_scan(t, proc.pid));
        match outcome {
            WaitScan::Reaped { pid, code } => return Ok((pid as u64, code)),
            WaitScan::NoChildren => return Err(KernelError::NoSuchProcess),
            WaitScan::ShouldBlock => {
                sched::sleep_with(proc.wait_channel(), || {});
            }
        }
    }
}

/// Exit: mark the process terminated, wake a waiting parent, and never
/// come back.
pub fn sys_exit(code: i32) -> ! {
    if let Some(pid) = sched::current_pid() {
        let chan = sched::with_table(|t| exit_process(t, pid, code));
        if let Some(chan) = chan {
            sched::wakeup(chan);
        }
    }
    sched::schedule();
    unreachable!("terminated thread was scheduled again");
}

pub fn sys_kill(pid: i32, sig: i32) -> KernelResult<u64> {
    let chan = sched::with_table(|t| kill(t, pid, sig))?;
    if let Some(chan) = chan {
        sched::wakeup(chan);
    }
    if sched::current_pid() == Some(pid) {
        sched::schedule();
    }
    Ok(0)
}

/// Millisecond sleep in scheduler ticks.
pub fn sys_sleep(ms: u64) -> KernelResult<u64> {
    let ticks = (ms / crate::arch::x86_64::timer::TICK_MS).max(1);
    sched::sleep_ticks(ticks);
    Ok(0)
}

/// Microsecond sleep: tick-based when long enough, TSC busy-wait below a
/// tick.
pub fn sys_usleep(us: u64) -> KernelResult<u64> {
    if us == 0 {
        return Ok(0);
    }
    let tick_us = crate::arch::x86_64::timer::TICK_MS * 1000;
    if us >= tick_us {
        sys_sleep(us.div_ceil(1000))
    } else {
        tsc::sleep_ns(us * 1000);
        Ok(0)
    }
}

/// Nanoseconds since boot: TSC when calibrated, scheduler ticks otherwise.
pub fn time_nanos() -> u64 {
    let ns = tsc::nanos();
    if ns != 0 {
        ns
    } else {
        sched::ticks() * crate::arch::x86_64::timer::TICK_MS * 1_000_000
    }
}

/// Wire fds 0-2 of `proc` to `/dev/console` (used for init).
pub fn wire_stdio(proc: &Arc<Process>) {
    if let Ok(console) = fs::ns().resolve("/dev/console") {
        let mut files = proc.files.lock();
        for fd in 0..3 {
            let file = Arc::new(spin::Mutex::new(OpenFile::open(
                console.clone(),
                OpenFlags::new(OpenFlags::RDWR),
            )));
            let _ = files.install_at(fd, file);
        }
    } else {
        log::warn!("init: /dev/console missing, stdio unwired");
    }
}

/// Launch `/bin/init` as the first user process.
pub fn spawn_init(kproc: &Arc<Process>) {
    let (init_proc, thread) = sched::with_table(|t| {
        let cwd = alloc::string::String::from("/");
        let proc = t.create_process("init", Some(kproc.pid), cwd);
        let thread = t.create_thread(&proc, false);
        thread.set_state(ThreadState::Blocked);
        (proc, thread)
    });

    let image = match read_file(fs::ns(), &init_proc, "/bin/init") {
        Ok(image) => image,
        Err(e) => {
            log::error!("init: cannot read /bin/init: {}", e);
            thread.set_state(ThreadState::Terminated);
            return;
        }
    };
    match exec_image(&init_proc, &image, &["init"]) {
        Ok(outcome) => {
            wire_stdio(&init_proc);
            thread.user_entry.store(outcome.entry, Ordering::Release);
            thread.user_stack.store(outcome.user_rsp, Ordering::Release);
            sched::init_thread_stack(&thread, user_entry_trampoline);
            thread.set_state(ThreadState::Ready);
            log::info!("init: pid {} ready", init_proc.pid);
        }
        Err(e) => {
            thread.set_state(ThreadState::Terminated);
            log::error!("init: exec failed: {}", e);
        }
    }
}
