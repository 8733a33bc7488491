//! Virtual memory manager: 4-level, 4 KiB-grain page tables.
//!
//! Tables are walked through the direct map, so every operation works on
//! any address space, not just the live one. The upper 256 root entries
//! (the kernel half) are copied from a reference root when a space is
//! created and are never modified or freed per-space afterwards; only the
//! user half diverges between processes.

use core::sync::atomic::{AtomicU64, Ordering};

use bitflags::bitflags;

use super::{phys_to_virt, pmm, PhysAddr, VirtAddr, PAGE_SIZE};
use crate::error::KernelError;

bitflags! {
    /// Page table entry flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct PteFlags: u64 {
        const PRESENT       = 1 << 0;
        const WRITABLE      = 1 << 1;
        const USER          = 1 << 2;
        const WRITE_THROUGH = 1 << 3;
        const NO_CACHE      = 1 << 4;
        const HUGE          = 1 << 7;
        const NX            = 1 << 63;
    }
}

impl PteFlags {
    /// PAT index 1 is reprogrammed to write-combining at boot, selected by
    /// the PWT bit alone (PAT=0, PCD=0, PWT=1).
    pub const WRITE_COMBINING: PteFlags = PteFlags::WRITE_THROUGH;
}

const ENTRIES: usize = 512;
const ADDR_MASK: u64 = 0x000F_FFFF_FFFF_F000;
/// Flag bits preserved when cloning an entry.
const FLAG_MASK: u64 = 0xFFF | PteFlags::NX.bits();

/// Physical root of the reference (kernel) address space; the source of
/// kernel-half entries for every new space.
static KERNEL_TEMPLATE: AtomicU64 = AtomicU64::new(0);

/// Record the reference root table.
pub fn set_kernel_template(root: PhysAddr) {
    KERNEL_TEMPLATE.store(root.as_u64(), Ordering::Release);
}

fn kernel_template() -> PhysAddr {
    PhysAddr::new(KERNEL_TEMPLATE.load(Ordering::Acquire))
}

/// View a physical frame as a page table.
///
/// # Safety
/// `phys` must point at a live page-table frame.
unsafe fn table<'a>(phys: PhysAddr) -> &'a mut [u64; ENTRIES] {
    unsafe { &mut *(phys_to_virt(phys) as *mut [u64; ENTRIES]) }
}

fn index(virt: u64, shift: u32) -> usize {
    ((virt >> shift) & 0x1FF) as usize
}

/// Walk one level down, optionally creating a missing intermediate table.
/// Intermediate entries are created PRESENT|WRITABLE|USER so leaf flags
/// alone decide access.
fn next_level(current: &mut [u64; ENTRIES], idx: usize, allocate: bool) -> Option<PhysAddr> {
    let entry = current[idx];
    if entry & PteFlags::PRESENT.bits() != 0 {
        return Some(PhysAddr::new(entry & ADDR_MASK));
    }
    if !allocate {
        return None;
    }
    let fresh = pmm::alloc_zeroed_page()?;
    current[idx] = fresh.as_u64()
        | (PteFlags::PRESENT | PteFlags::WRITABLE | PteFlags::USER).bits();
    Some(fresh)
}

#[inline]
fn flush_tlb(virt: u64) {
    #[cfg(all(target_arch = "x86_64", target_os = "none"))]
    x86_64::instructions::tlb::flush(x86_64::VirtAddr::new(virt));
    #[cfg(not(all(target_arch = "x86_64", target_os = "none")))]
    let _ = virt;
}

/// One address space: a root table plus everything below it.
#[derive(Debug, PartialEq, Eq)]
pub struct AddressSpace {
    root: PhysAddr,
}

impl AddressSpace {
    /// Adopt an existing root table (the boot space).
    ///
    /// # Safety
    /// `root` must be a live PML4.
    pub const unsafe fn from_root(root: PhysAddr) -> Self {
        Self { root }
    }

    pub fn root(&self) -> PhysAddr {
        self.root
    }

    /// Allocate a fresh space whose kernel half mirrors the reference root.
    pub fn new() -> Result<Self, KernelError> {
        let root = pmm::alloc_zeroed_page().ok_or(KernelError::OutOfMemory)?;
        let template = kernel_template();
        if !template.is_null() {
            let src = unsafe { table(template) };
            let dst = unsafe { table(root) };
            dst[ENTRIES / 2..].copy_from_slice(&src[ENTRIES / 2..]);
        }
        Ok(Self { root })
    }

    /// Set or replace the leaf entry for `virt`.
    pub fn map(&self, virt: VirtAddr, phys: PhysAddr, flags: PteFlags) -> Result<(), KernelError> {
        let v = virt.as_u64();
        let root = unsafe { table(self.root) };
        let pdpt = next_level(root, index(v, 39), true).ok_or(KernelError::OutOfMemory)?;
        let pdpt = unsafe { table(pdpt) };
        let pd = next_level(pdpt, index(v, 30), true).ok_or(KernelError::OutOfMemory)?;
        let pd = unsafe { table(pd) };
        let pt = next_level(pd, index(v, 21), true).ok_or(KernelError::OutOfMemory)?;
        let pt = unsafe { table(pt) };
        pt[index(v, 12)] = phys.as_u64() | flags.bits();
        flush_tlb(v);
        Ok(())
    }

    /// Clear the leaf entry for `virt`. Intermediate tables stay in place.
    pub fn unmap(&self, virt: VirtAddr) {
        let v = virt.as_u64();
        let root = unsafe { table(self.root) };
        let Some(pdpt) = next_level(root, index(v, 39), false) else {
            return;
        };
        let pdpt = unsafe { table(pdpt) };
        let Some(pd) = next_level(pdpt, index(v, 30), false) else {
            return;
        };
        let pd = unsafe { table(pd) };
        let Some(pt) = next_level(pd, index(v, 21), false) else {
            return;
        };
        let pt = unsafe { table(pt) };
        pt[index(v, 12)] = 0;
        flush_tlb(v);
    }

    /// Walk without allocating; returns the physical address including the
    /// page offset.
    pub fn translate(&self, virt: VirtAddr) -> Option<PhysAddr> {
        let v = virt.as_u64();
        let root = unsafe { table(self.root) };
        let pdpt = next_level(root, index(v, 39), false)?;
        let pdpt = unsafe { table(pdpt) };
        let pd = next_level(pdpt, index(v, 30), false)?;
        let pd = unsafe { table(pd) };
        let pt = next_level(pd, index(v, 21), false)?;
        let pt = unsafe { table(pt) };
        let entry = pt[index(v, 12)];
        if entry & PteFlags::PRESENT.bits() == 0 {
            return None;
        }
        Some(PhysAddr::new((entry & ADDR_MASK) + (v & 0xFFF)))
    }

    /// Deep copy of the user half. Terminal pages are duplicated byte for
    /// byte; huge-page entries (bootloader identity maps) are skipped.
    pub fn clone_user(&self) -> Result<Self, KernelError> {
        let new_space = Self::new()?;
        let src_root = unsafe { table(self.root) };
        let dst_root = unsafe { table(new_space.root) };

        for i in 0..ENTRIES / 2 {
            let entry = src_root[i];
            if entry & PteFlags::PRESENT.bits() == 0 {
                continue;
            }
            let child = pmm::alloc_zeroed_page().ok_or(KernelError::OutOfMemory)?;
            dst_root[i] = child.as_u64() | (entry & FLAG_MASK);
            copy_subtree(child, PhysAddr::new(entry & ADDR_MASK), 3)?;
        }
        Ok(new_space)
    }

    /// Recursively free the user half, including the physical pages its
    /// leaves point at, then the root itself. The kernel half is shared
    /// and never freed.
    pub fn destroy(self) {
        let root = unsafe { table(self.root) };
        for entry in root.iter().take(ENTRIES / 2) {
            if entry & PteFlags::PRESENT.bits() != 0 {
                let child = PhysAddr::new(entry & ADDR_MASK);
                free_subtree(child, 3);
                pmm::free_page(child);
            }
        }
        pmm::free_page(self.root);
    }

    /// Load this space into CR3.
    ///
    /// # Safety
    /// The space must map the executing kernel.
    #[cfg(all(target_arch = "x86_64", target_os = "none"))]
    pub unsafe fn switch(&self) {
        unsafe { switch_root(self.root) };
    }

    /// Root entry, for invariant checks.
    pub fn root_entry(&self, idx: usize) -> u64 {
        let root = unsafe { table(self.root) };
        root[idx]
    }
}

fn copy_subtree(dst: PhysAddr, src: PhysAddr, level: u8) -> Result<(), KernelError> {
    let src_table = unsafe { table(src) };
    let dst_table = unsafe { table(dst) };
    for i in 0..ENTRIES {
        let entry = src_table[i];
        if entry & PteFlags::PRESENT.bits() == 0 {
            continue;
        }
        if level > 1 && entry & PteFlags::HUGE.bits() != 0 {
            continue;
        }
        if level == 1 {
            let page = pmm::alloc_page().ok_or(KernelError::OutOfMemory)?;
            unsafe {
                core::ptr::copy_nonoverlapping(
                    phys_to_virt(PhysAddr::new(entry & ADDR_MASK)),
                    phys_to_virt(page),
                    PAGE_SIZE,
                );
            }
            dst_table[i] = page.as_u64() | (entry & FLAG_MASK);
        } else {
            let child = pmm::alloc_zeroed_page().ok_or(KernelError::OutOfMemory)?;
            dst_table[i] = child.as_u64() | (entry & FLAG_MASK);
            copy_subtree(child, PhysAddr::new(entry & ADDR_MASK), level - 1)?;
        }
    }
    Ok(())
}

fn free_subtree(node: PhysAddr, level: u8) {
    let node_table = unsafe { table(node) };
    for i in 0..ENTRIES {
        let entry = node_table[i];
        if entry & PteFlags::PRESENT.bits() == 0 {
            continue;
        }
        if level > 1 && entry & PteFlags::HUGE.bits() != 0 {
            continue;
        }
        let child = PhysAddr::new(entry & ADDR_MASK);
        if level > 1 {
            free_subtree(child, level - 1);
        }
        pmm::free_page(child);
    }
}

/// Load an address-space root into CR3.
///
/// # Safety
/// The root must map the executing kernel.
#[cfg(all(target_arch = "x86_64", target_os = "none"))]
pub unsafe fn switch_root(root: PhysAddr) {
    use x86_64::registers::control::{Cr3, Cr3Flags};
    use x86_64::structures::paging::PhysFrame;
    let frame = PhysFrame::containing_address(x86_64::PhysAddr::new(root.as_u64()));
    unsafe { Cr3::write(frame, Cr3Flags::empty()) };
}

/// Bare-metal init: record the direct map offset and adopt the boot CR3 as
/// the reference root.
#[cfg(all(target_arch = "x86_64", target_os = "none"))]
pub fn init(direct_map_offset: u64) {
    use x86_64::registers::control::Cr3;
    super::set_direct_map_offset(direct_map_offset);
    let (frame, _) = Cr3::read();
    set_kernel_template(PhysAddr::new(frame.start_address().as_u64()));
    log::info!("VMM: direct map at 0x{:x}", direct_map_offset);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mm::test_support;

    fn fill_page(phys: PhysAddr, byte: u8) {
        unsafe { core::ptr::write_bytes(phys_to_virt(phys), byte, PAGE_SIZE) };
    }

    fn page_byte(phys: PhysAddr, off: usize) -> u8 {
        unsafe { *phys_to_virt(phys).add(off) }
    }

    #[test]
    fn map_translate_roundtrip() {
        test_support::init_test_memory();
        let space = AddressSpace::new().unwrap();
        let page = pmm::alloc_zeroed_page().unwrap();
        space
            .map(
                VirtAddr::new(0x40_0000),
                page,
                PteFlags::PRESENT | PteFlags::WRITABLE | PteFlags::USER,
            )
            .unwrap();
        assert_eq!(space.translate(VirtAddr::new(0x40_0000)).unwrap(), page);
        assert_eq!(
            space.translate(VirtAddr::new(0x40_0123)).unwrap().as_u64(),
            page.as_u64() + 0x123
        );
        assert!(space.translate(VirtAddr::new(0x41_0000)).is_none());
        space.unmap(VirtAddr::new(0x40_0000));
        assert!(space.translate(VirtAddr::new(0x40_0000)).is_none());
        space.destroy();
    }

    #[test]
    fn kernel_half_is_identical_across_spaces() {
        test_support::init_test_memory();
        // Plant a recognizable kernel-half entry in the reference root.
        let template = kernel_template();
        unsafe {
            table(template)[300] = 0xDEAD_B000 | PteFlags::PRESENT.bits();
        }
        let a = AddressSpace::new().unwrap();
        let b = AddressSpace::new().unwrap();
        for i in ENTRIES / 2..ENTRIES {
            assert_eq!(a.root_entry(i), b.root_entry(i));
        }
        assert_eq!(a.root_entry(300), 0xDEAD_B000 | PteFlags::PRESENT.bits());
        let c = a.clone_user().unwrap();
        assert_eq!(c.root_entry(300), a.root_entry(300));
        a.destroy();
        b.destroy();
        c.destroy();
    }

    #[test]
    fn deep_clone_is_independent() {
        test_support::init_test_memory();
        let a = AddressSpace::new().unwrap();
        let page = pmm::alloc_page().unwrap();
        fill_page(page, 0xA5);
        let va = VirtAddr::new(0x4_0000_0000);
        a.map(va, page, PteFlags::PRESENT | PteFlags::WRITABLE | PteFlags::USER)
            .unwrap();

        let b = a.clone_user().unwrap();
        let b_phys = b.translate(va).unwrap();
        assert_ne!(b_phys, page, "clone must duplicate terminal pages");
        assert_eq!(page_byte(b_phys, 0), 0xA5);

        // Mutate the clone; the source must not see it.
        unsafe { *phys_to_virt(b_phys) = 0x3C };
        assert_eq!(page_byte(a.translate(va).unwrap(), 0), 0xA5);

        // Unmapping in the clone leaves the source translation intact.
        b.unmap(va);
        assert!(b.translate(va).is_none());
        assert_eq!(a.translate(va).unwrap(), page);

        a.destroy();
        b.destroy();
    }

    #[test]
    fn destroy_reclaims_user_frames() {
        test_support::init_test_memory();
        let space = AddressSpace::new().unwrap();
        let page = pmm::alloc_zeroed_page().unwrap();
        let va = VirtAddr::new(0x80_0000);
        space
            .map(va, page, PteFlags::PRESENT | PteFlags::WRITABLE | PteFlags::USER)
            .unwrap();
        assert!(pmm::page_is_used(page));
        space.destroy();
        assert!(!pmm::page_is_used(page));
    }

    #[test]
    fn clone_skips_huge_entries() {
        test_support::init_test_memory();
        let a = AddressSpace::new().unwrap();
        let va = VirtAddr::new(0x20_0000);
        let page = pmm::alloc_zeroed_page().unwrap();
        a.map(va, page, PteFlags::PRESENT | PteFlags::WRITABLE | PteFlags::USER)
            .unwrap();

        // Fabricate a huge-page PD entry next to the real one.
        let v = va.as_u64();
        let root = unsafe { table(a.root()) };
        let pdpt = next_level(root, index(v, 39), false).unwrap();
        let pdpt = unsafe { table(pdpt) };
        let pd_phys = next_level(pdpt, index(v, 30), false).unwrap();
        let pd = unsafe { table(pd_phys) };
        let huge_idx = index(v, 21) + 1;
        pd[huge_idx] = 0x4000_0000 | (PteFlags::PRESENT | PteFlags::HUGE).bits();

        let b = a.clone_user().unwrap();
        let b_pdpt = next_level(unsafe { table(b.root()) }, index(v, 39), false).unwrap();
        let b_pd_phys = next_level(unsafe { table(b_pdpt) }, index(v, 30), false).unwrap();
        let b_pd = unsafe { table(b_pd_phys) };
        assert_eq!(b_pd[huge_idx], 0, "huge entry must not be cloned");
        assert!(b.translate(va).is_some());

        // Clear the fake entry before destroying so teardown doesn't free a
        // frame it doesn't own.
        pd[huge_idx] = 0;
        a.destroy();
        b.destroy();
    }

    #[test]
    fn nx_flag_survives_clone() {
        test_support::init_test_memory();
        let a = AddressSpace::new().unwrap();
        let page = pmm::alloc_zeroed_page().unwrap();
        let va = VirtAddr::new(0x900_0000);
        a.map(va, page, PteFlags::PRESENT | PteFlags::USER | PteFlags::NX)
            .unwrap();
        let b = a.clone_user().unwrap();
        let v = va.as_u64();
        let root = unsafe { table(b.root()) };
        let pdpt = next_level(root, index(v, 39), false).unwrap();
        let pdpt = unsafe { table(pdpt) };
        let pd = next_level(pdpt, index(v, 30), false).unwrap();
        let pd = unsafe { table(pd) };
        let pt = next_level(pd, index(v, 21), false).unwrap();
        let pt = unsafe { table(pt) };
        assert!(pt[index(v, 12)] & PteFlags::NX.bits() != 0);
        a.destroy();
        b.destroy();
    }
}
