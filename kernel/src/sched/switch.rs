//! The running half of the scheduler: current-thread tracking, context
//! switching, wait-channel sleeps, and thread start trampolines.
//!
//! The process-table lock is held across `switch_context`; whichever
//! thread resumes on the other side releases it (fresh threads do so in
//! their trampoline). Interrupts are disabled for the whole window.

use alloc::string::String;
use alloc::sync::Arc;

use core::sync::atomic::Ordering;

use spin::MutexGuard;

use crate::arch::x86_64::{context, gdt, percpu};
use crate::sync::IrqGuard;

use super::{Pid, ProcTable, Process, Thread, ThreadState, SCHED, TIME_SLICE_TICKS};

/// The thread running on this CPU, if the scheduler has started.
pub fn current_thread() -> Option<&'static Thread> {
    let ptr = percpu::get().current_thread;
    if ptr.is_null() {
        None
    } else {
        // Threads are owned by their process, which stays in the table
        // until reaped; a reaped process is never current.
        Some(unsafe { &*ptr })
    }
}

pub fn current_pid() -> Option<Pid> {
    current_thread().map(|t| t.process)
}

/// The process of the current thread.
pub fn current_process() -> Option<Arc<Process>> {
    let pid = current_pid()?;
    super::with_table(|t| t.process(pid))
}

/// Prepare a fresh thread's kernel stack so that switching to it lands in
/// `thread_trampoline` with the entry function in r12.
pub fn init_thread_stack(thread: &Thread, entry: extern "C" fn() -> !) {
    let top = thread.kstack_top();
    let ctx_at = top - core::mem::size_of::<context::Context>() as u64;
    let ctx = context::Context {
        r12: entry as usize as u64,
        rip: thread_trampoline as usize as u64,
        ..context::Context::default()
    };
    unsafe { core::ptr::write(ctx_at as *mut context::Context, ctx) };
    thread.context.store(ctx_at, Ordering::Release);
}

/// First instructions of every fresh kernel thread: inherit the scheduler
/// lock from the switch, release it, enable interrupts, and jump to the
/// entry function left in r12.
#[unsafe(naked)]
unsafe extern "C" fn thread_trampoline() {
    core::arch::naked_asm!(
        "call {init}",
        "sti",
        "jmp r12",
        init = sym trampoline_unlock,
    );
}

/// Release the process-table lock a fresh thread inherits from the switch
/// that started it. Also the first step of the fork trampoline.
pub extern "C" fn trampoline_unlock() {
    unsafe { SCHED.force_unlock() };
}

/// Pick and switch to the next thread. The table guard travels across the
/// switch and comes back when this thread is resumed.
fn resched(table: MutexGuard<'static, ProcTable>) -> MutexGuard<'static, ProcTable> {
    let Some(cur) = current_thread() else {
        return table;
    };

    let next = match table.pick_next((cur.process, cur.tid)) {
        Some(t) => t,
        None => match table.idle_thread() {
            Some(idle) if idle.tid != cur.tid => idle,
            _ => return table,
        },
    };
    if next.tid == cur.tid {
        return table;
    }

    let cpu = percpu::get();

    // Swap address spaces when crossing processes, via the lock-free CR3
    // mirror (a preempted thread may hold its own addr_space lock).
    // Processes without a private space (the kernel) keep whatever is live.
    if cur.process != next.process {
        if let Some(proc) = table.process(next.process) {
            let root = proc.cr3.load(Ordering::Acquire);
            if root != 0 {
                unsafe { crate::mm::vmm::switch_root(crate::mm::PhysAddr::new(root)) };
            }
        }
    }

    // SYSCALL and ring transitions land on the incoming thread's stack.
    gdt::set_kernel_stack(cpu, next.kstack_top());

    // Per-CPU user RSP scratch follows the thread.
    cur.saved_user_rsp.store(cpu.user_rsp, Ordering::Release);
    cpu.user_rsp = next.saved_user_rsp.load(Ordering::Acquire);

    // SIMD state.
    context::save_fpu(&mut cur.fpu.lock());
    context::restore_fpu(&next.fpu.lock());

    next.set_state(ThreadState::Running);
    next.ticks_remaining.store(TIME_SLICE_TICKS, Ordering::Release);
    if cur.state() == ThreadState::Running {
        cur.set_state(ThreadState::Ready);
    }
    cpu.current_thread = Arc::as_ptr(&next);

    let prev_slot = &cur.context as *const _ as *mut u64;
    let next_rsp = next.context.load(Ordering::Acquire);
    drop(next);
    unsafe { context::switch_context(prev_slot, next_rsp) };

    // Back on this thread; the lock came back with us.
    table
}

/// Voluntarily give up the CPU.
pub fn schedule() {
    let _irq = IrqGuard::new();
    if current_thread().is_none() {
        return;
    }
    let table = SCHED.lock();
    let table = resched(table);
    drop(table);
}

/// Alias for the syscall surface.
pub fn yield_now() {
    schedule();
}

/// Atomically release a caller-held lock and sleep on `chan`. On wakeup
/// the caller reacquires its lock itself.
pub fn sleep_with(chan: usize, release: impl FnOnce()) {
    let _irq = IrqGuard::new();
    let Some(cur) = current_thread() else {
        release();
        return;
    };
    let table = SCHED.lock();
    release();

    cur.chan.store(chan, Ordering::Release);
    cur.set_state(ThreadState::Blocked);

    let table = resched(table);
    cur.chan.store(0, Ordering::Release);
    drop(table);
}

/// Tick-based sleep: reschedule in a loop until the deadline passes.
pub fn sleep_ticks(ticks: u64) {
    let target = super::ticks() + ticks.max(1);
    while super::ticks() < target {
        schedule();
    }
}

/// Create a kernel-context thread in `proc` running `entry`.
pub fn spawn_thread_in(proc: &Arc<Process>, entry: extern "C" fn() -> !, is_idle: bool) -> Arc<Thread> {
    super::with_table(|t| {
        let thread = t.create_thread(proc, is_idle);
        init_thread_stack(&thread, entry);
        thread
    })
}

/// Create a kernel thread in the kernel process.
pub fn spawn_kernel_thread(entry: extern "C" fn() -> !) -> Option<Arc<Thread>> {
    let kproc = super::with_table(|t| t.process(1))?;
    Some(spawn_thread_in(&kproc, entry, false))
}

extern "C" fn idle_main() -> ! {
    loop {
        crate::arch::x86_64::idle_halt();
    }
}

/// Install the boot flow as process 1 ("kernel") plus the idle thread,
/// and mark the scheduler live. Returns the kernel process.
pub fn start() -> Arc<Process> {
    let kproc = super::with_table(|t| {
        let kproc = t.create_process("kernel", None, String::from("/"));
        let boot_thread = t.create_thread(&kproc, false);
        boot_thread.set_state(ThreadState::Running);
        percpu::get().current_thread = Arc::as_ptr(&boot_thread);
        kproc
    });

    spawn_thread_in(&kproc, idle_main, true);
    super::with_table(|t| t.ready = true);
    log::info!("sched: scheduler online, kernel pid {}", kproc.pid);
    kproc
}
