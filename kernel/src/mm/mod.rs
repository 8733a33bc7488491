//! Memory management.
//!
//! Layering, bottom up: the physical frame allocator ([`pmm`]), the
//! 4-level virtual memory manager ([`vmm`]), the slab kernel heap
//! ([`heap`]), and per-process virtual memory areas ([`vma`]).
//!
//! All physical memory is reachable through the boot loader's high-half
//! direct map; [`phys_to_virt`] is the only way code here dereferences a
//! physical address.

pub mod heap;
#[cfg(feature = "kasan")]
pub mod kasan;
pub mod pmm;
pub mod vma;
pub mod vmm;

use core::sync::atomic::{AtomicU64, Ordering};

/// Size of a physical page / frame (4 KiB)
pub const PAGE_SIZE: usize = 4096;

/// Physical memory address
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct PhysAddr(pub u64);

impl PhysAddr {
    pub const fn new(addr: u64) -> Self {
        Self(addr)
    }

    pub const fn as_u64(&self) -> u64 {
        self.0
    }

    pub const fn is_null(&self) -> bool {
        self.0 == 0
    }

    pub const fn page_index(&self) -> usize {
        (self.0 as usize) / PAGE_SIZE
    }
}

/// Virtual memory address
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct VirtAddr(pub u64);

impl VirtAddr {
    pub const fn new(addr: u64) -> Self {
        Self(addr)
    }

    pub const fn as_u64(&self) -> u64 {
        self.0
    }
}

/// Round `value` up to the next multiple of `align` (a power of two).
pub const fn align_up(value: u64, align: u64) -> u64 {
    (value + align - 1) & !(align - 1)
}

/// Round `value` down to a multiple of `align` (a power of two).
pub const fn align_down(value: u64, align: u64) -> u64 {
    value & !(align - 1)
}

/// One entry of the boot-time physical memory map.
#[derive(Debug, Clone, Copy)]
pub struct MemoryRegion {
    pub base: u64,
    pub length: u64,
    pub usable: bool,
}

static DIRECT_MAP_OFFSET: AtomicU64 = AtomicU64::new(0);

/// Record the high-half direct map offset provided by the boot loader.
pub fn set_direct_map_offset(offset: u64) {
    DIRECT_MAP_OFFSET.store(offset, Ordering::Release);
}

/// The high-half direct map offset.
pub fn direct_map_offset() -> u64 {
    DIRECT_MAP_OFFSET.load(Ordering::Acquire)
}

/// Dereferenceable pointer for a physical address, via the direct map.
pub fn phys_to_virt(phys: PhysAddr) -> *mut u8 {
    (phys.as_u64() + direct_map_offset()) as *mut u8
}

/// Inverse of [`phys_to_virt`] for pointers that live in the direct map.
pub fn virt_to_phys_direct(ptr: *const u8) -> PhysAddr {
    PhysAddr::new(ptr as u64 - direct_map_offset())
}

/// Host-test scaffolding: a leaked, page-aligned arena standing in for
/// physical RAM. `init_test_memory` is idempotent and shared by every test
/// in the process; individual allocations never collide because they all
/// come from the one global frame allocator.
#[cfg(not(target_os = "none"))]
pub mod test_support {
    use super::*;

    /// 64 MiB of fake physical memory.
    pub const TEST_ARENA_BYTES: usize = 64 * 1024 * 1024;

    static INIT: ::std::sync::Once = ::std::sync::Once::new();

    pub fn init_test_memory() {
        INIT.call_once(|| {
            let layout =
                ::std::alloc::Layout::from_size_align(TEST_ARENA_BYTES, PAGE_SIZE).unwrap();
            let arena = unsafe { ::std::alloc::alloc_zeroed(layout) };
            assert!(!arena.is_null());

            // "Physical" address 0 is the start of the arena.
            set_direct_map_offset(arena as u64);

            let regions = [MemoryRegion {
                base: 0,
                length: TEST_ARENA_BYTES as u64,
                usable: true,
            }];
            pmm::init(&regions);

            // An empty reference root for kernel-half propagation.
            let root = pmm::alloc_page().expect("test root table");
            unsafe {
                core::ptr::write_bytes(phys_to_virt(root), 0, PAGE_SIZE);
            }
            vmm::set_kernel_template(root);
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn alignment_helpers() {
        assert_eq!(align_up(1, 4096), 4096);
        assert_eq!(align_up(4096, 4096), 4096);
        assert_eq!(align_down(4097, 4096), 4096);
        assert_eq!(align_down(4095, 4096), 0);
    }

    #[test]
    fn phys_addr_page_index() {
        assert_eq!(PhysAddr::new(0x3000).page_index(), 3);
        assert!(PhysAddr::new(0).is_null());
    }
}
