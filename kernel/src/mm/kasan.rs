//! Opt-in poison tracking for heap memory (`kasan` feature).
//!
//! A shadow byte covers each 16-byte granule of a window of the direct
//! map. The slab heap poisons free slots and red zones and unpoisons live
//! objects; user-buffer validation consults [`check_range`] before copies.
//! This is a reduced overlay, not a full shadow engine: only the window
//! registered at init is tracked, and kasan builds give up the heap's
//! large-alignment guarantees.

use core::sync::atomic::{AtomicBool, Ordering};

use spin::Mutex;

/// Bytes of red zone on each side of a heap object.
pub const REDZONE_SIZE: usize = 16;

const GRANULE: usize = 16;

const POISON_FREE: u8 = 0xFD;
const POISON_REDZONE: u8 = 0xFA;

struct Shadow {
    window_base: u64,
    window_len: usize,
    shadow: *mut u8,
}

unsafe impl Send for Shadow {}

static READY: AtomicBool = AtomicBool::new(false);
static SHADOW: Mutex<Option<Shadow>> = Mutex::new(None);

/// Install shadow coverage for `[window_base, window_base + window_len)`
/// (virtual addresses). The shadow itself comes from the PMM.
pub fn init(window_base: u64, window_len: usize) {
    let shadow_bytes = window_len / GRANULE + 1;
    let pages = (shadow_bytes + super::PAGE_SIZE - 1) / super::PAGE_SIZE;
    let Some(phys) = super::pmm::alloc_pages(pages) else {
        log::warn!("kasan: no memory for shadow, disabled");
        return;
    };
    let shadow = super::phys_to_virt(phys);
    unsafe { core::ptr::write_bytes(shadow, 0, shadow_bytes) };
    *SHADOW.lock() = Some(Shadow {
        window_base,
        window_len,
        shadow,
    });
    READY.store(true, Ordering::Release);
    log::info!(
        "kasan: shadowing 0x{:x}..0x{:x}",
        window_base,
        window_base + window_len as u64
    );
}

pub fn is_ready() -> bool {
    READY.load(Ordering::Acquire)
}

fn apply(ptr: *const u8, len: usize, value: u8) {
    if !is_ready() || len == 0 {
        return;
    }
    let guard = SHADOW.lock();
    let Some(ref s) = *guard else { return };
    let addr = ptr as u64;
    if addr < s.window_base || addr + len as u64 > s.window_base + s.window_len as u64 {
        return;
    }
    let start = ((addr - s.window_base) as usize) / GRANULE;
    let end = ((addr - s.window_base) as usize + len + GRANULE - 1) / GRANULE;
    for i in start..end {
        unsafe { *s.shadow.add(i) = value };
    }
}

/// Mark a range as freed memory.
pub fn poison_range(ptr: *const u8, len: usize) {
    apply(ptr, len, POISON_FREE);
}

/// Mark a range as a red zone.
pub fn poison_redzone(ptr: *const u8, len: usize) {
    apply(ptr, len, POISON_REDZONE);
}

/// Mark a range addressable.
pub fn unpoison_range(ptr: *const u8, len: usize) {
    apply(ptr, len, 0);
}

/// True when every granule of the range is addressable (or the range is
/// outside the shadowed window).
pub fn check_range(ptr: *const u8, len: usize) -> bool {
    if !is_ready() || len == 0 {
        return true;
    }
    let guard = SHADOW.lock();
    let Some(ref s) = *guard else { return true };
    let addr = ptr as u64;
    if addr < s.window_base || addr + len as u64 > s.window_base + s.window_len as u64 {
        return true;
    }
    let start = ((addr - s.window_base) as usize) / GRANULE;
    let end = ((addr - s.window_base) as usize + len + GRANULE - 1) / GRANULE;
    (start..end).all(|i| unsafe { *s.shadow.add(i) } == 0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mm::test_support;

    #[test]
    fn poison_and_unpoison_round_trip() {
        test_support::init_test_memory();
        let page = crate::mm::pmm::alloc_zeroed_page().unwrap();
        let base = crate::mm::phys_to_virt(page);
        init(base as u64, crate::mm::PAGE_SIZE);

        assert!(check_range(base, 64));
        poison_range(base, 64);
        assert!(!check_range(base, 64));
        assert!(!check_range(base, 1));
        unpoison_range(base, 64);
        assert!(check_range(base, 64));

        // Outside the window nothing is tracked.
        assert!(check_range(0x1000 as *const u8, 16));
    }
}
