//! Physical memory manager.
//!
//! A bitmap over every page up to the highest usable address. The bitmap
//! itself is carved out of the first usable region large enough to hold
//! it. Bit set = page reserved or in use.

use spin::Mutex;

use super::{phys_to_virt, MemoryRegion, PhysAddr, PAGE_SIZE};

/// Bitmap frame allocator state.
pub struct FrameBitmap {
    bitmap: *mut u8,
    bitmap_bytes: usize,
    highest_page: usize,
}

// The raw bitmap pointer aliases nothing else once init() claims it.
unsafe impl Send for FrameBitmap {}

impl FrameBitmap {
    /// Build the allocator from the boot memory map.
    ///
    /// The direct map offset must already be installed so the bitmap
    /// storage can be written through it.
    ///
    /// # Safety
    /// `regions` must describe RAM that is otherwise unused, and the
    /// direct map must cover it.
    pub unsafe fn init(regions: &[MemoryRegion]) -> Option<FrameBitmap> {
        let mut highest_addr = 0u64;
        for region in regions.iter().filter(|r| r.usable) {
            let top = region.base + region.length;
            if top > highest_addr {
                highest_addr = top;
            }
        }
        if highest_addr == 0 {
            return None;
        }

        let highest_page = (highest_addr as usize) / PAGE_SIZE;
        let bitmap_bytes = highest_page / 8 + 1;

        // Place the bitmap in the first usable region that fits it.
        let mut bitmap_phys = None;
        for region in regions.iter().filter(|r| r.usable) {
            if region.length as usize >= bitmap_bytes {
                bitmap_phys = Some(PhysAddr::new(region.base));
                break;
            }
        }
        let bitmap_phys = bitmap_phys?;
        let bitmap = phys_to_virt(bitmap_phys);

        // Everything starts out used.
        unsafe { core::ptr::write_bytes(bitmap, 0xFF, bitmap_bytes) };

        let mut alloc = FrameBitmap {
            bitmap,
            bitmap_bytes,
            highest_page,
        };

        // Usable regions become free.
        for region in regions.iter().filter(|r| r.usable) {
            let mut offset = 0;
            while offset < region.length {
                alloc.clear_bit(((region.base + offset) as usize) / PAGE_SIZE);
                offset += PAGE_SIZE as u64;
            }
        }

        // The bitmap's own pages are in use.
        let bitmap_start_page = bitmap_phys.page_index();
        let bitmap_pages = (bitmap_bytes + PAGE_SIZE - 1) / PAGE_SIZE;
        for i in 0..bitmap_pages {
            alloc.set_bit(bitmap_start_page + i);
        }

        // Keep page zero out of circulation.
        alloc.set_bit(0);

        Some(alloc)
    }

    fn set_bit(&mut self, bit: usize) {
        debug_assert!(bit / 8 < self.bitmap_bytes);
        unsafe { *self.bitmap.add(bit / 8) |= 1 << (bit % 8) };
    }

    fn clear_bit(&mut self, bit: usize) {
        debug_assert!(bit / 8 < self.bitmap_bytes);
        unsafe { *self.bitmap.add(bit / 8) &= !(1 << (bit % 8)) };
    }

    fn test_bit(&self, bit: usize) -> bool {
        unsafe { *self.bitmap.add(bit / 8) & (1 << (bit % 8)) != 0 }
    }

    /// First-fit single page allocation.
    pub fn alloc_page(&mut self) -> Option<PhysAddr> {
        for i in 0..self.highest_page {
            if !self.test_bit(i) {
                self.set_bit(i);
                return Some(PhysAddr::new((i * PAGE_SIZE) as u64));
            }
        }
        None
    }

    pub fn free_page(&mut self, addr: PhysAddr) {
        self.clear_bit(addr.page_index());
    }

    /// First-fit run of `count` contiguous pages; all-or-nothing.
    pub fn alloc_pages(&mut self, count: usize) -> Option<PhysAddr> {
        if count == 0 {
            return None;
        }
        let mut i = 0;
        while i < self.highest_page {
            if !self.test_bit(i) {
                let mut run = 0;
                while run < count && i + run < self.highest_page && !self.test_bit(i + run) {
                    run += 1;
                }
                if run == count {
                    for j in 0..count {
                        self.set_bit(i + j);
                    }
                    return Some(PhysAddr::new((i * PAGE_SIZE) as u64));
                }
                i += run + 1;
            } else {
                i += 1;
            }
        }
        None
    }

    pub fn free_pages(&mut self, addr: PhysAddr, count: usize) {
        let page = addr.page_index();
        for i in 0..count {
            self.clear_bit(page + i);
        }
    }

    /// Whether the page holding `addr` is currently marked used.
    pub fn page_is_used(&self, addr: PhysAddr) -> bool {
        self.test_bit(addr.page_index())
    }
}

static PMM: Mutex<Option<FrameBitmap>> = Mutex::new(None);

/// Install the global frame allocator from the boot memory map.
pub fn init(regions: &[MemoryRegion]) {
    let alloc = unsafe { FrameBitmap::init(regions) }.expect("PMM: no usable memory");
    let mut pmm = PMM.lock();
    if pmm.is_none() {
        log::info!(
            "PMM: {} pages tracked, bitmap {} bytes",
            alloc.highest_page,
            alloc.bitmap_bytes
        );
        *pmm = Some(alloc);
    }
}

pub fn alloc_page() -> Option<PhysAddr> {
    PMM.lock().as_mut().and_then(FrameBitmap::alloc_page)
}

pub fn free_page(addr: PhysAddr) {
    if let Some(pmm) = PMM.lock().as_mut() {
        pmm.free_page(addr);
    }
}

pub fn alloc_pages(count: usize) -> Option<PhysAddr> {
    PMM.lock().as_mut().and_then(|p| p.alloc_pages(count))
}

pub fn free_pages(addr: PhysAddr, count: usize) {
    if let Some(pmm) = PMM.lock().as_mut() {
        pmm.free_pages(addr, count);
    }
}

/// Allocate a page and zero it through the direct map.
pub fn alloc_zeroed_page() -> Option<PhysAddr> {
    let page = alloc_page()?;
    unsafe { core::ptr::write_bytes(phys_to_virt(page), 0, PAGE_SIZE) };
    Some(page)
}

/// Test/diagnostic hook: is the page containing `addr` allocated?
pub fn page_is_used(addr: PhysAddr) -> bool {
    PMM.lock()
        .as_ref()
        .map(|p| p.page_is_used(addr))
        .unwrap_or(false)
}
