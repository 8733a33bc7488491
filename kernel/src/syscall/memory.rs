//! Memory system calls: `sbrk`, `mmap`, `munmap`.
//!
//! `mmap` honors only `MAP_SHARED` mappings of device nodes that expose a
//! physical target (the framebuffer); everything else is refused.
//! Placement is overlap-free against the process's VMA list with
//! page-granular rounding.

use alloc::sync::Arc;

use core::sync::atomic::Ordering;

use crate::error::{KernelError, KernelResult};
use crate::fs::NodeRef;
use crate::mm::vma::VmaFlags;
use crate::mm::vmm::PteFlags;
use crate::mm::{align_down, align_up, pmm, VirtAddr, PAGE_SIZE};
use crate::sched::Process;

pub const MAP_SHARED: u32 = 0x01;

/// Default search base when the caller passes no address hint.
const MMAP_SEARCH_BASE: u64 = 0x40_0000_0000;

/// Highest usable user address for placements.
const MMAP_LIMIT: u64 = 0x7FFF_FFFF_F000;

/// Grow or shrink the program break. New pages are zero-filled and mapped
/// user-writable; shrinking only moves the break. Returns the old break.
pub fn sbrk(proc: &Arc<Process>, increment: i64) -> KernelResult<u64> {
    let old_brk = proc.heap_end.load(Ordering::Acquire);
    let new_brk = old_brk
        .checked_add_signed(increment)
        .ok_or(KernelError::InvalidArgument)?;

    if increment > 0 {
        let space = proc.addr_space.lock();
        let space = space.as_ref().ok_or(KernelError::InvalidArgument)?;
        let old_page_end = align_up(old_brk, PAGE_SIZE as u64);
        let new_page_end = align_up(new_brk, PAGE_SIZE as u64);
        let mut addr = old_page_end;
        while addr < new_page_end {
            let phys = pmm::alloc_zeroed_page().ok_or(KernelError::OutOfMemory)?;
            space.map(
                VirtAddr::new(addr),
                phys,
                PteFlags::PRESENT | PteFlags::WRITABLE | PteFlags::USER | PteFlags::NX,
            )?;
            addr += PAGE_SIZE as u64;
        }
    }

    proc.heap_end.store(new_brk, Ordering::Release);
    Ok(old_brk)
}

/// Map a device's physical range into the process. Only `MAP_SHARED` of a
/// node with an mmap target (the framebuffer) is honored.
pub fn mmap(
    proc: &Arc<Process>,
    addr_hint: u64,
    length: u64,
    flags: u32,
    node: &NodeRef,
    offset: u64,
) -> KernelResult<u64> {
    if length == 0 {
        return Err(KernelError::InvalidArgument);
    }
    if flags & MAP_SHARED == 0 {
        return Err(KernelError::PermissionDenied);
    }
    let target = node.mmap_target().ok_or(KernelError::PermissionDenied)?;
    if offset >= target.len {
        return Err(KernelError::InvalidArgument);
    }

    let map_len = length.min(target.len - offset);
    let page_offset = align_down(offset, PAGE_SIZE as u64);
    let in_page_delta = offset - page_offset;
    let total_len = align_up(map_len, PAGE_SIZE as u64) + {
        if in_page_delta > 0 {
            PAGE_SIZE as u64
        } else {
            0
        }
    };

    let base_hint = if addr_hint == 0 {
        MMAP_SEARCH_BASE
    } else {
        addr_hint
    };

    let mut vmas = proc.vmas.lock();
    let base = vmas
        .find_gap(base_hint, total_len, PAGE_SIZE as u64, MMAP_LIMIT)
        .ok_or(KernelError::OutOfMemory)?;

    {
        let space = proc.addr_space.lock();
        let space = space.as_ref().ok_or(KernelError::InvalidArgument)?;
        let mut virt = base;
        let mut phys = target.phys_base + page_offset;
        while virt < base + total_len {
            space.map(
                VirtAddr::new(virt),
                crate::mm::PhysAddr::new(phys),
                PteFlags::PRESENT | PteFlags::WRITABLE | PteFlags::USER | PteFlags::WRITE_COMBINING,
            )?;
            virt += PAGE_SIZE as u64;
            phys += PAGE_SIZE as u64;
        }
    }

    vmas.add(
        base,
        base + total_len,
        VmaFlags::READ | VmaFlags::WRITE | VmaFlags::USER | VmaFlags::MMAP,
    )
    .ok_or(KernelError::InvalidArgument)?;

    Ok(base + in_page_delta)
}

/// Undo an `mmap`: the range must exactly match a previous MMAP area.
pub fn munmap(proc: &Arc<Process>, addr: u64, length: u64) -> KernelResult<()> {
    if addr == 0 || length == 0 {
        return Err(KernelError::InvalidArgument);
    }
    let start = align_down(addr, PAGE_SIZE as u64);
    let end = start + align_up(length, PAGE_SIZE as u64);

    let mut vmas = proc.vmas.lock();
    vmas.remove_exact(start, end, VmaFlags::MMAP)
        .ok_or(KernelError::InvalidArgument)?;

    let space = proc.addr_space.lock();
    let space = space.as_ref().ok_or(KernelError::InvalidArgument)?;
    let mut va = start;
    while va < end {
        space.unmap(VirtAddr::new(va));
        va += PAGE_SIZE as u64;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::string::ToString;
    use crate::error::FsError;
    use crate::fs::{MmapTarget, NodeType, VfsNode};
    use crate::mm::vmm::AddressSpace;
    use crate::mm::{phys_to_virt, test_support};
    use crate::sched::ProcTable;

    struct FakeFb {
        phys: u64,
        len: u64,
    }

    impl VfsNode for FakeFb {
        fn kind(&self) -> NodeType {
            NodeType::CharDevice
        }

        fn mmap_target(&self) -> Option<MmapTarget> {
            Some(MmapTarget {
                phys_base: self.phys,
                len: self.len,
            })
        }
    }

    struct PlainFile;

    impl VfsNode for PlainFile {
        fn kind(&self) -> NodeType {
            NodeType::File
        }

        fn read(&self, _o: u64, _b: &mut [u8]) -> Result<usize, FsError> {
            Ok(0)
        }
    }

    fn proc_with_space() -> Arc<Process> {
        test_support::init_test_memory();
        let mut t = ProcTable::new();
        let proc = t.create_process("mm-test", None, "/".to_string());
        *proc.addr_space.lock() = Some(AddressSpace::new().unwrap());
        proc
    }

    #[test]
    fn sbrk_grows_by_pages_and_zero_fills() {
        let proc = proc_with_space();
        proc.heap_end.store(0x40_2000, Ordering::Release);

        let old = sbrk(&proc, 0x3000).unwrap();
        assert_eq!(old, 0x40_2000);
        assert_eq!(proc.heap_end.load(Ordering::Acquire), 0x40_5000);

        let guard = proc.addr_space.lock();
        let space = guard.as_ref().unwrap();
        for page in [0x40_2000u64, 0x40_3000, 0x40_4000] {
            let phys = space.translate(VirtAddr::new(page)).unwrap();
            unsafe { assert_eq!(*phys_to_virt(phys), 0, "page {:x} zeroed", page) };
        }
        assert!(space.translate(VirtAddr::new(0x40_5000)).is_none());
    }

    #[test]
    fn sbrk_shrink_moves_the_break_only() {
        let proc = proc_with_space();
        proc.heap_end.store(0x50_0000, Ordering::Release);
        let old = sbrk(&proc, -0x1000).unwrap();
        assert_eq!(old, 0x50_0000);
        assert_eq!(proc.heap_end.load(Ordering::Acquire), 0x4F_F000);
    }

    #[test]
    fn mmap_maps_the_framebuffer_physically() {
        let proc = proc_with_space();
        let fb: NodeRef = Arc::new(FakeFb {
            phys: 0xE000_0000,
            len: 8 * PAGE_SIZE as u64,
        });

        let va = mmap(&proc, 0, 2 * PAGE_SIZE as u64, MAP_SHARED, &fb, 0).unwrap();
        assert_eq!(va % PAGE_SIZE as u64, 0);

        let guard = proc.addr_space.lock();
        let space = guard.as_ref().unwrap();
        // Translation equals the framebuffer base plus the offset.
        assert_eq!(
            space.translate(VirtAddr::new(va)).unwrap().as_u64(),
            0xE000_0000
        );
        assert_eq!(
            space
                .translate(VirtAddr::new(va + PAGE_SIZE as u64))
                .unwrap()
                .as_u64(),
            0xE000_0000 + PAGE_SIZE as u64
        );
    }

    #[test]
    fn mmap_honors_the_page_offset() {
        let proc = proc_with_space();
        let fb: NodeRef = Arc::new(FakeFb {
            phys: 0xE000_0000,
            len: 8 * PAGE_SIZE as u64,
        });
        let off = PAGE_SIZE as u64 + 0x40;
        let va = mmap(&proc, 0, PAGE_SIZE as u64, MAP_SHARED, &fb, off).unwrap();
        assert_eq!(va % PAGE_SIZE as u64, 0x40);

        let guard = proc.addr_space.lock();
        let space = guard.as_ref().unwrap();
        assert_eq!(
            space.translate(VirtAddr::new(va)).unwrap().as_u64(),
            0xE000_0000 + off
        );
    }

    #[test]
    fn mmap_rejects_private_and_ordinary_files() {
        let proc = proc_with_space();
        let file: NodeRef = Arc::new(PlainFile);
        let fb: NodeRef = Arc::new(FakeFb {
            phys: 0xE000_0000,
            len: PAGE_SIZE as u64,
        });

        assert_eq!(
            mmap(&proc, 0, 64, 0, &fb, 0),
            Err(KernelError::PermissionDenied),
            "non-shared mappings are refused"
        );
        assert_eq!(
            mmap(&proc, 0, 64, MAP_SHARED, &file, 0),
            Err(KernelError::PermissionDenied),
            "only mmap-capable devices work"
        );
    }

    #[test]
    fn mmap_placement_avoids_existing_areas() {
        let proc = proc_with_space();
        let fb: NodeRef = Arc::new(FakeFb {
            phys: 0xE000_0000,
            len: 16 * PAGE_SIZE as u64,
        });
        let a = mmap(&proc, 0, PAGE_SIZE as u64, MAP_SHARED, &fb, 0).unwrap();
        let b = mmap(&proc, 0, PAGE_SIZE as u64, MAP_SHARED, &fb, 0).unwrap();
        assert_ne!(a, b);
        assert_eq!(proc.vmas.lock().len(), 2);
    }

    #[test]
    fn munmap_requires_an_exact_mmap_area() {
        let proc = proc_with_space();
        let fb: NodeRef = Arc::new(FakeFb {
            phys: 0xE000_0000,
            len: 4 * PAGE_SIZE as u64,
        });
        let va = mmap(&proc, 0, 2 * PAGE_SIZE as u64, MAP_SHARED, &fb, 0).unwrap();

        assert!(munmap(&proc, va, PAGE_SIZE as u64).is_err(), "partial ranges fail");
        munmap(&proc, va, 2 * PAGE_SIZE as u64).unwrap();
        assert!(proc.vmas.lock().is_empty());

        let guard = proc.addr_space.lock();
        assert!(guard
            .as_ref()
            .unwrap()
            .translate(VirtAddr::new(va))
            .is_none());
    }
}
