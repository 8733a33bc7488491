//! Process lifecycle: fork bookkeeping, exit, kill, wait, teardown.
//!
//! All of it operates on the process table; the caller holds the table
//! lock (via `with_table`) and performs any wakeups with the channel
//! tokens returned from here.

use alloc::sync::Arc;

use core::sync::atomic::Ordering;

use crate::error::{KernelError, KernelResult};

use super::{Pid, ProcTable, Process, Thread, ThreadState};

/// Result of one `wait` scan over the table.
#[derive(Debug, PartialEq, Eq)]
pub enum WaitScan {
    /// A terminated child was reaped; its resources are gone.
    Reaped { pid: Pid, code: i32 },
    /// The process has no children at all.
    NoChildren,
    /// Children exist but none terminated; sleep on the wait channel.
    ShouldBlock,
}

/// Mark `pid` terminated with `code`; none of its threads will run again.
/// Returns the parent's wait channel for the caller to wake.
pub fn exit_process(table: &ProcTable, pid: Pid, code: i32) -> Option<usize> {
    let proc = table.process(pid)?;
    proc.exit_code.store(code, Ordering::Release);
    proc.terminated.store(true, Ordering::Release);
    for t in proc.threads.lock().iter() {
        t.set_state(ThreadState::Terminated);
    }
    proc.parent
        .and_then(|ppid| table.process(ppid))
        .map(|parent| parent.wait_channel())
}

/// Terminate `pid` with signal semantics: exit code `128 + sig`. The
/// signal number is advisory (no handlers run) but must be a plausible
/// one, and pid 0/1 are protected.
pub fn kill(table: &ProcTable, pid: Pid, sig: i32) -> KernelResult<Option<usize>> {
    if !(1..=31).contains(&sig) {
        return Err(KernelError::InvalidArgument);
    }
    if pid <= 1 {
        return Err(KernelError::PermissionDenied);
    }
    if table.process(pid).is_none() {
        return Err(KernelError::NoSuchProcess);
    }
    Ok(exit_process(table, pid, 128 + sig))
}

/// Release everything a process owns: descriptors, VMAs, and its address
/// space (with all user pages). The process must already be out of the
/// table so a second reap cannot find it.
pub fn destroy_process(proc: Arc<Process>) {
    proc.files.lock().close_all();
    proc.vmas.lock().clear();
    if let Some(space) = proc.addr_space.lock().take() {
        space.destroy();
    }
}

/// One pass of the `wait` loop for `parent`.
pub fn wait_scan(table: &mut ProcTable, parent: Pid) -> WaitScan {
    let mut has_children = false;
    let mut reap = None;
    for p in table.processes() {
        if p.parent == Some(parent) {
            has_children = true;
            if p.terminated.load(Ordering::Acquire) {
                reap = Some(p.pid);
                break;
            }
        }
    }

    if let Some(pid) = reap {
        let proc = table.remove_process(pid).expect("reaped pid vanished");
        let code = proc.exit_code.load(Ordering::Acquire);
        destroy_process(proc);
        return WaitScan::Reaped { pid, code };
    }
    if has_children {
        WaitScan::ShouldBlock
    } else {
        WaitScan::NoChildren
    }
}

/// Everything `fork` does short of building the child's kernel stack:
/// deep-clone the address space, copy the VMA list and descriptor table,
/// inherit cwd/heap break, and create the child's single thread.
pub fn fork_bookkeeping(
    table: &mut ProcTable,
    parent: &Arc<Process>,
) -> KernelResult<(Arc<Process>, Arc<Thread>)> {
    let child_space = {
        let space = parent.addr_space.lock();
        match space.as_ref() {
            Some(s) => Some(s.clone_user()?),
            None => None,
        }
    };

    let name = parent.name.lock().clone();
    let cwd = parent.cwd.lock().clone();
    let child = table.create_process(&name, Some(parent.pid), cwd);
    if let Some(space) = child_space {
        child.install_addr_space(space);
    }
    child
        .heap_end
        .store(parent.heap_end.load(Ordering::Acquire), Ordering::Release);
    *child.files.lock() = parent.files.lock().clone_for_fork();
    *child.vmas.lock() = parent.vmas.lock().clone();

    let thread = table.create_thread(&child, false);
    // Not runnable until the caller finishes the kernel stack image.
    thread.set_state(ThreadState::Blocked);
    Ok((child, thread))
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::string::String;
    use crate::mm::vma::VmaFlags;
    use crate::mm::vmm::{AddressSpace, PteFlags};
    use crate::mm::{phys_to_virt, pmm, test_support, VirtAddr};

    fn table() -> ProcTable {
        let mut t = ProcTable::new();
        let k = t.create_process("kernel", None, String::from("/"));
        let kt = t.create_thread(&k, false);
        kt.set_state(ThreadState::Running);
        t.ready = true;
        t
    }

    #[test]
    fn exit_marks_every_thread_terminated_once() {
        let mut t = table();
        let parent = t.process(1).unwrap();
        let child = t.create_process("child", Some(1), String::from("/"));
        let a = t.create_thread(&child, false);
        let b = t.create_thread(&child, false);

        let chan = exit_process(&t, child.pid, 42).unwrap();
        assert_eq!(chan, parent.wait_channel());
        assert!(child.terminated.load(Ordering::Acquire));
        assert_eq!(a.state(), ThreadState::Terminated);
        assert_eq!(b.state(), ThreadState::Terminated);
        assert_eq!(child.exit_code.load(Ordering::Acquire), 42);
    }

    #[test]
    fn wait_reaps_exactly_once() {
        let mut t = table();
        let child = t.create_process("child", Some(1), String::from("/"));
        t.create_thread(&child, false);

        assert_eq!(wait_scan(&mut t, 1), WaitScan::ShouldBlock);
        exit_process(&t, child.pid, 100);
        assert_eq!(
            wait_scan(&mut t, 1),
            WaitScan::Reaped {
                pid: child.pid,
                code: 100
            }
        );
        // The child is gone; nothing left to wait for.
        assert_eq!(wait_scan(&mut t, 1), WaitScan::NoChildren);
    }

    #[test]
    fn wait_ignores_other_parents_children() {
        let mut t = table();
        let other = t.create_process("other", None, String::from("/"));
        let orphan = t.create_process("orphan", Some(other.pid), String::from("/"));
        exit_process(&t, orphan.pid, 1);

        assert_eq!(wait_scan(&mut t, 1), WaitScan::NoChildren);
        assert!(matches!(
            wait_scan(&mut t, other.pid),
            WaitScan::Reaped { code: 1, .. }
        ));
    }

    #[test]
    fn kill_validates_target_and_signal() {
        let mut t = table();
        let victim = t.create_process("victim", Some(1), String::from("/"));
        t.create_thread(&victim, false);

        assert_eq!(kill(&t, 1, 9), Err(KernelError::PermissionDenied));
        assert_eq!(kill(&t, victim.pid, 0), Err(KernelError::InvalidArgument));
        assert_eq!(kill(&t, victim.pid, 64), Err(KernelError::InvalidArgument));
        assert_eq!(kill(&t, 999, 9), Err(KernelError::NoSuchProcess));

        kill(&t, victim.pid, 9).unwrap();
        assert_eq!(victim.exit_code.load(Ordering::Acquire), 128 + 9);
        assert!(victim
            .threads
            .lock()
            .iter()
            .all(|th| th.state() == ThreadState::Terminated));
    }

    #[test]
    fn fork_copies_break_vmas_and_descriptor_offsets() {
        test_support::init_test_memory();
        let mut t = table();
        let parent = t.process(1).unwrap();
        parent.heap_end.store(0x5000_0000, Ordering::Release);
        parent
            .vmas
            .lock()
            .add(0x1000, 0x4000, VmaFlags::READ | VmaFlags::USER);

        let (child, thread) = fork_bookkeeping(&mut t, &parent).unwrap();
        assert_eq!(child.parent, Some(parent.pid));
        assert_eq!(child.heap_end.load(Ordering::Acquire), 0x5000_0000);
        assert_eq!(child.vmas.lock().len(), 1);
        assert_eq!(thread.process, child.pid);
        assert_eq!(*child.cwd.lock(), "/");
    }

    #[test]
    fn forked_address_space_is_a_deep_copy() {
        test_support::init_test_memory();
        let mut t = table();
        let parent = t.process(1).unwrap();

        let space = AddressSpace::new().unwrap();
        let page = pmm::alloc_zeroed_page().unwrap();
        unsafe { *phys_to_virt(page) = 0xA5 };
        let va = VirtAddr::new(0x70_0000);
        space
            .map(va, page, PteFlags::PRESENT | PteFlags::WRITABLE | PteFlags::USER)
            .unwrap();
        *parent.addr_space.lock() = Some(space);

        let (child, _thread) = fork_bookkeeping(&mut t, &parent).unwrap();
        let guard = child.addr_space.lock();
        let child_space = guard.as_ref().unwrap();
        let child_phys = child_space.translate(va).unwrap();
        assert_ne!(child_phys, page);
        unsafe {
            assert_eq!(*phys_to_virt(child_phys), 0xA5);
            *phys_to_virt(child_phys) = 0x3C;
            assert_eq!(*phys_to_virt(page), 0xA5, "parent page unchanged");
        }
        drop(guard);

        // Reaping the child returns its pages to the allocator.
        exit_process(&t, child.pid, 0);
        assert!(matches!(wait_scan(&mut t, 1), WaitScan::Reaped { .. }));
        assert!(!pmm::page_is_used(child_phys));
        assert!(pmm::page_is_used(page), "parent keeps its frame");
    }

    #[test]
    fn destroy_releases_the_address_space() {
        test_support::init_test_memory();
        let mut t = table();
        let p = t.create_process("doomed", Some(1), String::from("/"));
        let space = AddressSpace::new().unwrap();
        let page = pmm::alloc_zeroed_page().unwrap();
        space
            .map(
                VirtAddr::new(0x90_0000),
                page,
                PteFlags::PRESENT | PteFlags::USER,
            )
            .unwrap();
        *p.addr_space.lock() = Some(space);

        let removed = t.remove_process(p.pid).unwrap();
        destroy_process(removed);
        assert!(!pmm::page_is_used(page));
        assert!(p.addr_space.lock().is_none());
    }
}
