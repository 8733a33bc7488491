//! Per-process virtual memory areas.
//!
//! Half-open `[start, end)` intervals. A process's areas never overlap;
//! insertion enforces that.

use alloc::vec::Vec;

use bitflags::bitflags;

bitflags! {
    /// Access/category flags for one area.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct VmaFlags: u32 {
        const READ  = 1 << 0;
        const WRITE = 1 << 1;
        const USER  = 1 << 2;
        const STACK = 1 << 3;
        const MMAP  = 1 << 4;
    }
}

/// One mapped interval.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Vma {
    pub start: u64,
    pub end: u64,
    pub flags: VmaFlags,
}

/// The set of areas owned by one process.
#[derive(Debug, Default, Clone)]
pub struct VmaList {
    areas: Vec<Vma>,
}

impl VmaList {
    pub const fn new() -> Self {
        Self { areas: Vec::new() }
    }

    /// Insert an area. Fails on an empty interval or any overlap.
    pub fn add(&mut self, start: u64, end: u64, flags: VmaFlags) -> Option<Vma> {
        if start >= end {
            return None;
        }
        if self
            .areas
            .iter()
            .any(|a| !(end <= a.start || start >= a.end))
        {
            return None;
        }
        let area = Vma { start, end, flags };
        self.areas.push(area);
        Some(area)
    }

    /// Remove the area exactly matching `[start, end)` with all `required`
    /// flags set. Returns the removed area.
    pub fn remove_exact(&mut self, start: u64, end: u64, required: VmaFlags) -> Option<Vma> {
        let idx = self
            .areas
            .iter()
            .position(|a| a.start == start && a.end == end && a.flags.contains(required))?;
        Some(self.areas.remove(idx))
    }

    /// The area containing `addr`, if any.
    pub fn find(&self, addr: u64) -> Option<&Vma> {
        self.areas.iter().find(|a| a.start <= addr && addr < a.end)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Vma> {
        self.areas.iter()
    }

    pub fn len(&self) -> usize {
        self.areas.len()
    }

    pub fn is_empty(&self) -> bool {
        self.areas.is_empty()
    }

    pub fn clear(&mut self) {
        self.areas.clear();
    }

    /// First gap of `len` bytes at or above `from`, aligned to `align`.
    /// Used by mmap placement.
    pub fn find_gap(&self, from: u64, len: u64, align: u64, limit: u64) -> Option<u64> {
        let mut base = super::align_up(from, align);
        loop {
            if base + len > limit {
                return None;
            }
            match self
                .areas
                .iter()
                .find(|a| !(base + len <= a.start || base >= a.end))
            {
                None => return Some(base),
                Some(hit) => base = super::align_up(hit.end, align),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn overlapping_areas_are_rejected() {
        let mut l = VmaList::new();
        assert!(l.add(0x1000, 0x3000, VmaFlags::READ).is_some());
        assert!(l.add(0x2000, 0x4000, VmaFlags::READ).is_none());
        assert!(l.add(0x0, 0x1001, VmaFlags::READ).is_none());
        // Touching intervals are fine.
        assert!(l.add(0x3000, 0x4000, VmaFlags::READ).is_some());
        assert_eq!(l.len(), 2);
    }

    #[test]
    fn empty_interval_rejected() {
        let mut l = VmaList::new();
        assert!(l.add(0x1000, 0x1000, VmaFlags::READ).is_none());
        assert!(l.add(0x2000, 0x1000, VmaFlags::READ).is_none());
    }

    #[test]
    fn remove_requires_exact_match_and_flags() {
        let mut l = VmaList::new();
        l.add(0x1000, 0x2000, VmaFlags::MMAP | VmaFlags::USER);
        assert!(l.remove_exact(0x1000, 0x2000, VmaFlags::STACK).is_none());
        assert!(l
            .remove_exact(0x1000, 0x2000, VmaFlags::MMAP)
            .is_some());
        assert!(l.is_empty());
    }

    #[test]
    fn gap_search_skips_existing_areas() {
        let mut l = VmaList::new();
        l.add(0x4000_0000, 0x4000_3000, VmaFlags::MMAP);
        let base = l
            .find_gap(0x4000_0000, 0x2000, 0x1000, 0x7FFF_FFFF_F000)
            .unwrap();
        assert_eq!(base, 0x4000_3000);
        assert!(l.find_gap(0x4000_0000, 0x1000, 0x1000, 0x4000_1000).is_none());
    }

    #[test]
    fn clone_preserves_areas() {
        let mut l = VmaList::new();
        l.add(0x1000, 0x2000, VmaFlags::READ | VmaFlags::WRITE);
        let c = l.clone();
        assert_eq!(c.find(0x1800).unwrap().start, 0x1000);
    }
}
