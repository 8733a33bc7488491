//! Processes, threads, and the scheduler.
//!
//! One lock — the global process table — serializes every thread state
//! transition and list membership change. Selection is round-robin across
//! all threads of all processes in table order: remaining siblings of the
//! current thread first, then later processes, wrapping to earlier ones,
//! and finally earlier siblings. The first non-idle READY thread wins; if
//! none exists the dedicated idle thread runs.
//!
//! Wait channels: any address-sized token works; sleepers park with the
//! token and `wakeup` readies every thread whose token matches. A wakeup
//! only makes threads READY, it does not schedule them.

pub mod exec;
mod lifecycle;
#[cfg(all(target_arch = "x86_64", target_os = "none"))]
mod switch;

pub use lifecycle::{destroy_process, exit_process, fork_bookkeeping, kill, wait_scan, WaitScan};
#[cfg(all(target_arch = "x86_64", target_os = "none"))]
pub use switch::{
    current_pid, current_process, current_thread, init_thread_stack, schedule, sleep_ticks,
    sleep_with, spawn_kernel_thread, spawn_thread_in, start, trampoline_unlock, yield_now,
};

use alloc::string::String;
use alloc::sync::Arc;
use alloc::vec::Vec;

use core::sync::atomic::{AtomicBool, AtomicI32, AtomicU32, AtomicU64, AtomicU8, AtomicUsize, Ordering};

use spin::Mutex;

use crate::fs::FdTable;
use crate::mm::vma::VmaList;
use crate::mm::vmm::AddressSpace;
use crate::sync::IrqGuard;

pub type Pid = i32;
pub type Tid = i32;

/// Timer tick period is ~10 ms; a slice is 50 ms.
pub const TIME_SLICE_TICKS: u32 = 5;

/// Kernel stack size per thread.
pub const KSTACK_SIZE: usize = 16 * 1024;

/// Per-thread kernel stack, kept 16-byte aligned for the switch path.
#[repr(C, align(16))]
pub struct KernelStack(pub [u8; KSTACK_SIZE]);

/// SIMD/FPU save area: 512-byte legacy region plus XSAVE header and AVX
/// state, 64-byte aligned for XSAVE.
#[repr(C, align(64))]
pub struct FpuState(pub [u8; 1024]);

impl FpuState {
    pub fn new() -> Self {
        let mut state = FpuState([0; 1024]);
        // MXCSR: all exceptions masked. FCW: default control word.
        state.0[24..28].copy_from_slice(&0x1F80u32.to_le_bytes());
        state.0[0..2].copy_from_slice(&0x037Fu16.to_le_bytes());
        state
    }
}

impl Default for FpuState {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ThreadState {
    Ready = 0,
    Running = 1,
    Blocked = 2,
    Terminated = 3,
}

impl ThreadState {
    fn from_raw(raw: u8) -> ThreadState {
        match raw {
            0 => ThreadState::Ready,
            1 => ThreadState::Running,
            2 => ThreadState::Blocked,
            _ => ThreadState::Terminated,
        }
    }
}

/// One kernel-schedulable thread.
pub struct Thread {
    pub tid: Tid,
    pub process: Pid,
    pub is_idle: bool,
    state: AtomicU8,
    /// Wait channel token; meaningful only while Blocked.
    pub chan: AtomicUsize,
    /// Tick number to wake at (timed sleep), 0 = none.
    pub sleep_until: AtomicU64,
    pub ticks_remaining: AtomicU32,
    /// User RSP parked here while the thread is in a syscall.
    pub saved_user_rsp: AtomicU64,
    /// Entry/stack for the spawn trampoline.
    pub user_entry: AtomicU64,
    pub user_stack: AtomicU64,
    /// Saved kernel stack pointer (the thread's context).
    pub context: AtomicU64,
    pub kstack: Mutex<alloc::boxed::Box<KernelStack>>,
    pub fpu: Mutex<alloc::boxed::Box<FpuState>>,
}

impl Thread {
    pub fn state(&self) -> ThreadState {
        ThreadState::from_raw(self.state.load(Ordering::Acquire))
    }

    pub fn set_state(&self, state: ThreadState) {
        self.state.store(state as u8, Ordering::Release);
    }

    /// Top of the kernel stack (grows down).
    pub fn kstack_top(&self) -> u64 {
        let stack = self.kstack.lock();
        stack.0.as_ptr() as u64 + KSTACK_SIZE as u64
    }
}

/// One process: an address space plus at least one thread.
pub struct Process {
    pub pid: Pid,
    pub name: Mutex<String>,
    pub parent: Option<Pid>,
    pub terminated: AtomicBool,
    pub exit_code: AtomicI32,
    /// Current program break.
    pub heap_end: AtomicU64,
    /// Physical root of `addr_space`, readable without its lock (the
    /// context switch must not contend with a preempted holder). 0 means
    /// "keep whatever is live" (kernel process).
    pub cr3: AtomicU64,
    pub addr_space: Mutex<Option<AddressSpace>>,
    pub files: Mutex<FdTable>,
    pub cwd: Mutex<String>,
    pub vmas: Mutex<VmaList>,
    pub threads: Mutex<Vec<Arc<Thread>>>,
}

impl Process {
    /// The wait-channel token both `wait` and `exit` agree on: the address
    /// of the parent's process record.
    pub fn wait_channel(self: &Arc<Self>) -> usize {
        Arc::as_ptr(self) as usize
    }

    /// Install a new address space, keeping the lock-free CR3 mirror in
    /// sync. Returns the previous space.
    pub fn install_addr_space(&self, space: AddressSpace) -> Option<AddressSpace> {
        let mut slot = self.addr_space.lock();
        self.cr3.store(space.root().as_u64(), Ordering::Release);
        slot.replace(space)
    }
}

/// The process table; the single scheduler lock guards it.
pub struct ProcTable {
    procs: Vec<Arc<Process>>,
    next_pid: Pid,
    next_tid: Tid,
    /// Timer ticks are ignored until the first process exists.
    pub ready: bool,
}

impl ProcTable {
    pub const fn new() -> Self {
        Self {
            procs: Vec::new(),
            next_pid: 1,
            next_tid: 1,
            ready: false,
        }
    }

    pub fn create_process(&mut self, name: &str, parent: Option<Pid>, cwd: String) -> Arc<Process> {
        let pid = self.next_pid;
        self.next_pid += 1;
        let proc = Arc::new(Process {
            pid,
            name: Mutex::new(String::from(name)),
            parent,
            terminated: AtomicBool::new(false),
            exit_code: AtomicI32::new(0),
            heap_end: AtomicU64::new(0),
            cr3: AtomicU64::new(0),
            addr_space: Mutex::new(None),
            files: Mutex::new(FdTable::new()),
            cwd: Mutex::new(cwd),
            vmas: Mutex::new(VmaList::new()),
            threads: Mutex::new(Vec::new()),
        });
        self.procs.push(proc.clone());
        proc
    }

    pub fn create_thread(&mut self, proc: &Arc<Process>, is_idle: bool) -> Arc<Thread> {
        let tid = self.next_tid;
        self.next_tid += 1;
        let thread = Arc::new(Thread {
            tid,
            process: proc.pid,
            is_idle,
            state: AtomicU8::new(ThreadState::Ready as u8),
            chan: AtomicUsize::new(0),
            sleep_until: AtomicU64::new(0),
            ticks_remaining: AtomicU32::new(TIME_SLICE_TICKS),
            saved_user_rsp: AtomicU64::new(0),
            user_entry: AtomicU64::new(0),
            user_stack: AtomicU64::new(0),
            context: AtomicU64::new(0),
            kstack: Mutex::new(alloc::boxed::Box::new(KernelStack([0; KSTACK_SIZE]))),
            fpu: Mutex::new(alloc::boxed::Box::new(FpuState::new())),
        });
        proc.threads.lock().push(thread.clone());
        thread
    }

    pub fn process(&self, pid: Pid) -> Option<Arc<Process>> {
        self.procs.iter().find(|p| p.pid == pid).cloned()
    }

    pub fn remove_process(&mut self, pid: Pid) -> Option<Arc<Process>> {
        let idx = self.procs.iter().position(|p| p.pid == pid)?;
        Some(self.procs.remove(idx))
    }

    pub fn processes(&self) -> &[Arc<Process>] {
        &self.procs
    }

    /// The dedicated idle thread.
    pub fn idle_thread(&self) -> Option<Arc<Thread>> {
        for proc in &self.procs {
            if let Some(t) = proc.threads.lock().iter().find(|t| t.is_idle) {
                return Some(t.clone());
            }
        }
        None
    }

    fn thread_in(proc: &Arc<Process>, pick: impl Fn(&Arc<Thread>) -> bool) -> Option<Arc<Thread>> {
        proc.threads.lock().iter().find(|t| pick(t)).cloned()
    }

    fn runnable(t: &Arc<Thread>) -> bool {
        t.state() == ThreadState::Ready && !t.is_idle
    }

    /// Round-robin selection relative to the current thread, in four
    /// phases: later siblings, later processes, earlier processes, earlier
    /// siblings. Returns None when only the idle thread is runnable.
    pub fn pick_next(&self, current: (Pid, Tid)) -> Option<Arc<Thread>> {
        let (cur_pid, cur_tid) = current;
        let cur_idx = self.procs.iter().position(|p| p.pid == cur_pid)?;
        let cur_proc = &self.procs[cur_idx];

        // Later siblings in the current process.
        {
            let threads = cur_proc.threads.lock();
            if let Some(pos) = threads.iter().position(|t| t.tid == cur_tid) {
                if let Some(t) = threads[pos + 1..].iter().find(|t| Self::runnable(t)) {
                    return Some(t.clone());
                }
            }
        }

        // Later processes.
        for proc in &self.procs[cur_idx + 1..] {
            if let Some(t) = Self::thread_in(proc, Self::runnable) {
                return Some(t);
            }
        }

        // Wrap to processes before the current one.
        for proc in &self.procs[..cur_idx] {
            if let Some(t) = Self::thread_in(proc, Self::runnable) {
                return Some(t);
            }
        }

        // Earlier siblings (including the current slot if it is READY
        // again, which closes the rotation).
        {
            let threads = cur_proc.threads.lock();
            if let Some(pos) = threads.iter().position(|t| t.tid == cur_tid) {
                if let Some(t) = threads[..pos].iter().find(|t| Self::runnable(t)) {
                    return Some(t.clone());
                }
            }
        }

        None
    }

    /// Transition every sleeper on `chan` back to READY.
    pub fn wakeup(&self, chan: usize) {
        for proc in &self.procs {
            for t in proc.threads.lock().iter() {
                if t.state() == ThreadState::Blocked && t.chan.load(Ordering::Acquire) == chan {
                    t.chan.store(0, Ordering::Release);
                    t.set_state(ThreadState::Ready);
                }
            }
        }
    }

    /// Timer tick bookkeeping: wake expired timed sleepers and charge the
    /// current thread's quantum. Returns true when a resched is due.
    pub fn tick(&self, now: u64, current: Option<&Thread>) -> bool {
        if !self.ready {
            return false;
        }
        let mut need_resched = false;

        for proc in &self.procs {
            for t in proc.threads.lock().iter() {
                let deadline = t.sleep_until.load(Ordering::Acquire);
                if t.state() == ThreadState::Blocked && deadline != 0 && deadline <= now {
                    t.sleep_until.store(0, Ordering::Release);
                    t.set_state(ThreadState::Ready);
                    need_resched = true;
                }
            }
        }

        if let Some(curr) = current {
            if curr.is_idle {
                need_resched = true;
            } else if curr.state() == ThreadState::Running {
                let left = curr.ticks_remaining.load(Ordering::Acquire);
                if left > 0 {
                    curr.ticks_remaining.store(left - 1, Ordering::Release);
                }
                if curr.ticks_remaining.load(Ordering::Acquire) == 0 {
                    need_resched = true;
                }
            }
        }

        need_resched
    }
}

impl Default for ProcTable {
    fn default() -> Self {
        Self::new()
    }
}

static SCHED: Mutex<ProcTable> = Mutex::new(ProcTable::new());

/// Global tick counter, advanced by the timer interrupt.
pub static SCHEDULER_TICKS: AtomicU64 = AtomicU64::new(0);

/// Run `f` with the process table locked and interrupts masked.
pub fn with_table<R>(f: impl FnOnce(&mut ProcTable) -> R) -> R {
    let _irq = IrqGuard::new();
    let mut table = SCHED.lock();
    f(&mut table)
}

/// Transition all sleepers on `chan` to READY.
pub fn wakeup(chan: usize) {
    with_table(|t| t.wakeup(chan));
}

pub fn ticks() -> u64 {
    SCHEDULER_TICKS.load(Ordering::Acquire)
}
