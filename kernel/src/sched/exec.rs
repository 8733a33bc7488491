//! `exec`: replace a process image.
//!
//! Builds a fresh address space, loads the ELF, materializes a 16 KiB user
//! stack at a fixed high address with argv in the conventional layout
//! (strings top-down, aligned pointer array, argc last), and hands back
//! the old space so the caller can destroy it after switching.

use alloc::string::String;
use alloc::sync::Arc;
use alloc::vec::Vec;

use core::sync::atomic::Ordering;

use crate::elf;
use crate::error::{KernelError, KernelResult};
use crate::mm::vma::VmaFlags;
use crate::mm::vmm::{AddressSpace, PteFlags};
use crate::mm::{phys_to_virt, pmm, VirtAddr, PAGE_SIZE};

use super::Process;

/// Argument limits for exec.
pub const EXEC_MAX_ARGS: usize = 16;
pub const EXEC_MAX_ARG_LEN: usize = 128;

/// Top of the user stack; the stack grows down from here.
pub const USER_STACK_TOP: u64 = 0x7FFF_FFFF_F000;

/// User stack size (16 KiB).
pub const USER_STACK_SIZE: u64 = 4 * PAGE_SIZE as u64;

/// What the syscall layer needs to resume the process in its new image.
pub struct ExecOutcome {
    pub entry: u64,
    pub user_rsp: u64,
    /// The replaced address space; destroy after switching off of it.
    pub old_space: Option<AddressSpace>,
}

/// Byte image of the initial stack region and the resulting RSP.
///
/// Layout from the top down: the argument strings (NUL-terminated), then
/// padding to 16 bytes, a NULL argv terminator, argc pointers, and argc
/// itself at the final stack top.
pub fn build_argv_stack(stack_top: u64, args: &[&str]) -> KernelResult<(Vec<u8>, u64)> {
    if args.len() > EXEC_MAX_ARGS {
        return Err(KernelError::InvalidArgument);
    }
    for arg in args {
        if arg.len() + 1 > EXEC_MAX_ARG_LEN {
            return Err(KernelError::InvalidArgument);
        }
    }

    // Total: strings, alignment slack, (argc + argv[] + NULL) words.
    let strings_len: usize = args.iter().map(|a| a.len() + 1).sum();
    let words = args.len() + 2;
    let region = strings_len + 16 + words * 8;
    let mut image = alloc::vec![0u8; region];

    // Strings, last argument nearest the top.
    let mut sp = stack_top;
    let mut arg_ptrs = [0u64; EXEC_MAX_ARGS];
    for (i, arg) in args.iter().enumerate().rev() {
        let len = arg.len() + 1;
        sp -= len as u64;
        let off = (sp - (stack_top - region as u64)) as usize;
        image[off..off + arg.len()].copy_from_slice(arg.as_bytes());
        image[off + arg.len()] = 0;
        arg_ptrs[i] = sp;
    }

    sp &= !0xF;

    // NULL terminator, argv pointers, argc.
    let base = stack_top - region as u64;
    let mut push = |sp: &mut u64, value: u64, image: &mut [u8]| {
        *sp -= 8;
        let off = (*sp - base) as usize;
        image[off..off + 8].copy_from_slice(&value.to_le_bytes());
    };
    push(&mut sp, 0, &mut image);
    for i in (0..args.len()).rev() {
        push(&mut sp, arg_ptrs[i], &mut image);
    }
    push(&mut sp, args.len() as u64, &mut image);

    // Trim the unused front of the region.
    let used_from = (sp - base) as usize;
    Ok((image[used_from..].to_vec(), sp))
}

/// Copy `bytes` into `space` at virtual address `va` (which must already
/// be mapped), page by page through the direct map.
fn copy_into_space(space: &AddressSpace, va: u64, bytes: &[u8]) -> KernelResult<()> {
    let mut done = 0usize;
    while done < bytes.len() {
        let at = va + done as u64;
        let phys = space
            .translate(VirtAddr::new(at))
            .ok_or(KernelError::BadAddress(at))?;
        let in_page = (at as usize) % PAGE_SIZE;
        let chunk = (bytes.len() - done).min(PAGE_SIZE - in_page);
        unsafe {
            core::ptr::copy_nonoverlapping(bytes[done..].as_ptr(), phys_to_virt(phys), chunk);
        }
        done += chunk;
    }
    Ok(())
}

/// Replace `proc`'s image with the ELF in `image`, passing `args`.
pub fn exec_image(proc: &Arc<Process>, image: &[u8], args: &[&str]) -> KernelResult<ExecOutcome> {
    let space = AddressSpace::new()?;
    let loaded = match elf::load_bytes(image, &space) {
        Ok(loaded) => loaded,
        Err(e) => {
            space.destroy();
            return Err(e);
        }
    };

    // The user stack: fixed high placement, zeroed, user-writable.
    let stack_base = USER_STACK_TOP - USER_STACK_SIZE;
    let mut va = stack_base;
    while va < USER_STACK_TOP {
        let phys = match pmm::alloc_zeroed_page() {
            Some(p) => p,
            None => {
                space.destroy();
                return Err(KernelError::OutOfMemory);
            }
        };
        space.map(
            VirtAddr::new(va),
            phys,
            PteFlags::PRESENT | PteFlags::WRITABLE | PteFlags::USER | PteFlags::NX,
        )?;
        va += PAGE_SIZE as u64;
    }

    let (stack_bytes, user_rsp) = build_argv_stack(USER_STACK_TOP, args)?;
    copy_into_space(&space, user_rsp, &stack_bytes)?;

    // Swap the image under the process.
    let old_space = proc.install_addr_space(space);
    proc.heap_end.store(loaded.max_vaddr, Ordering::Release);
    {
        let mut vmas = proc.vmas.lock();
        vmas.clear();
        vmas.add(
            stack_base,
            USER_STACK_TOP,
            VmaFlags::READ | VmaFlags::WRITE | VmaFlags::USER | VmaFlags::STACK,
        );
    }

    Ok(ExecOutcome {
        entry: loaded.entry,
        user_rsp,
        old_space,
    })
}

/// Derive the process name from the path's final component.
pub fn set_name_from_path(proc: &Process, path: &str) {
    *proc.name.lock() = String::from(crate::fs::path::file_name(path));
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mm::test_support;
    use crate::sched::ProcTable;

    fn read_u64(bytes: &[u8], off: usize) -> u64 {
        u64::from_le_bytes(bytes[off..off + 8].try_into().unwrap())
    }

    #[test]
    fn argv_stack_layout_is_conventional() {
        let top = 0x7FFF_FFFF_F000u64;
        let (bytes, rsp) = build_argv_stack(top, &["init", "-s"]).unwrap();
        assert_eq!(rsp % 8, 0);
        assert_eq!(rsp + bytes.len() as u64, top);

        // argc first.
        assert_eq!(read_u64(&bytes, 0), 2);
        // argv pointers, then NULL.
        let argv0 = read_u64(&bytes, 8);
        let argv1 = read_u64(&bytes, 16);
        assert_eq!(read_u64(&bytes, 24), 0);
        assert!(argv0 > rsp && argv0 < top);
        assert!(argv1 > rsp && argv1 < top);

        // The pointers reach the NUL-terminated strings.
        let s0 = (argv0 - rsp) as usize;
        assert_eq!(&bytes[s0..s0 + 5], b"init\0");
        let s1 = (argv1 - rsp) as usize;
        assert_eq!(&bytes[s1..s1 + 3], b"-s\0");
    }

    #[test]
    fn argv_limits_are_enforced() {
        let top = 0x7FFF_FFFF_F000u64;
        let long = "x".repeat(EXEC_MAX_ARG_LEN);
        assert!(build_argv_stack(top, &[long.as_str()]).is_err());

        let many: Vec<&str> = (0..EXEC_MAX_ARGS + 1).map(|_| "a").collect();
        assert!(build_argv_stack(top, &many).is_err());

        // Zero arguments still yields a well-formed frame.
        let (bytes, _rsp) = build_argv_stack(top, &[]).unwrap();
        assert_eq!(read_u64(&bytes, 0), 0);
        assert_eq!(read_u64(&bytes, 8), 0);
    }

    #[test]
    fn exec_builds_a_runnable_image() {
        test_support::init_test_memory();
        let mut t = ProcTable::new();
        let proc = t.create_process("init", None, alloc::string::String::from("/"));

        // Borrow the ELF fixture from the loader tests via a local copy.
        let image = crate::elf::tests_fixture();
        let outcome = exec_image(&proc, &image, &["init"]).unwrap();
        assert_eq!(outcome.entry, 0x40_0000);
        assert!(outcome.old_space.is_none(), "first exec has nothing to drop");
        assert_eq!(proc.heap_end.load(Ordering::Acquire), 0x40_3000);

        // The stack region is mapped and argc landed at RSP.
        let guard = proc.addr_space.lock();
        let space = guard.as_ref().unwrap();
        let rsp_phys = space.translate(VirtAddr::new(outcome.user_rsp)).unwrap();
        let argc = unsafe { *(phys_to_virt(rsp_phys) as *const u64) };
        assert_eq!(argc, 1);

        // Stack VMA recorded.
        drop(guard);
        let vmas = proc.vmas.lock();
        assert!(vmas.find(USER_STACK_TOP - 1).is_some());
        assert!(vmas.find(USER_STACK_TOP - USER_STACK_SIZE).is_some());
    }

    #[test]
    fn exec_replaces_an_existing_image() {
        test_support::init_test_memory();
        let mut t = ProcTable::new();
        let proc = t.create_process("sh", None, alloc::string::String::from("/"));
        let image = crate::elf::tests_fixture();

        let first = exec_image(&proc, &image, &[]).unwrap();
        assert!(first.old_space.is_none());
        let second = exec_image(&proc, &image, &[]).unwrap();
        let old = second.old_space.expect("second exec must yield the old space");
        old.destroy();
    }
}
