//! ELF64 executable loading.
//!
//! Parses the header and program headers and maps every `PT_LOAD` segment
//! into a target address space at page granularity, zero-filling the BSS
//! tail (`memsz > filesz`). Writes go through the direct map after
//! translating each freshly mapped page, so loading works on any address
//! space, not just the live one.

use crate::error::{KernelError, KernelResult};
use crate::mm::vmm::{AddressSpace, PteFlags};
use crate::mm::{align_down, align_up, phys_to_virt, pmm, VirtAddr, PAGE_SIZE};

const ELF_MAGIC: [u8; 4] = [0x7F, b'E', b'L', b'F'];

const PT_LOAD: u32 = 1;
const PF_X: u32 = 1;
const PF_W: u32 = 2;

fn le16(buf: &[u8], off: usize) -> u16 {
    u16::from_le_bytes(buf[off..off + 2].try_into().unwrap())
}

fn le32(buf: &[u8], off: usize) -> u32 {
    u32::from_le_bytes(buf[off..off + 4].try_into().unwrap())
}

fn le64(buf: &[u8], off: usize) -> u64 {
    u64::from_le_bytes(buf[off..off + 8].try_into().unwrap())
}

/// One parsed program header.
#[derive(Debug, Clone, Copy)]
pub struct Segment {
    pub vaddr: u64,
    pub offset: u64,
    pub filesz: u64,
    pub memsz: u64,
    pub writable: bool,
    pub executable: bool,
}

/// Result of loading an image.
#[derive(Debug, Clone, Copy)]
pub struct LoadedImage {
    pub entry: u64,
    /// Page-aligned end of the highest segment; the initial program break.
    pub max_vaddr: u64,
}

/// Validate the header and collect the `PT_LOAD` segments.
pub fn parse_segments(image: &[u8]) -> KernelResult<(u64, alloc::vec::Vec<Segment>)> {
    if image.len() < 64 || image[0..4] != ELF_MAGIC {
        return Err(KernelError::InvalidArgument);
    }
    let entry = le64(image, 24);
    let phoff = le64(image, 32) as usize;
    let phentsize = le16(image, 54) as usize;
    let phnum = le16(image, 56) as usize;
    if phentsize < 56 || phoff + phnum * phentsize > image.len() {
        return Err(KernelError::InvalidArgument);
    }

    let mut segments = alloc::vec::Vec::new();
    for i in 0..phnum {
        let ph = &image[phoff + i * phentsize..];
        if le32(ph, 0) != PT_LOAD {
            continue;
        }
        let flags = le32(ph, 4);
        let seg = Segment {
            offset: le64(ph, 8),
            vaddr: le64(ph, 16),
            filesz: le64(ph, 32),
            memsz: le64(ph, 40),
            writable: flags & PF_W != 0,
            executable: flags & PF_X != 0,
        };
        if seg.filesz > seg.memsz || seg.offset + seg.filesz > image.len() as u64 {
            return Err(KernelError::InvalidArgument);
        }
        segments.push(seg);
    }
    Ok((entry, segments))
}

/// Map every `PT_LOAD` segment of `image` into `space`.
pub fn load_bytes(image: &[u8], space: &AddressSpace) -> KernelResult<LoadedImage> {
    let (entry, segments) = parse_segments(image)?;
    let mut max_vaddr = 0u64;

    for seg in &segments {
        let mut flags = PteFlags::PRESENT | PteFlags::USER;
        if seg.writable {
            flags |= PteFlags::WRITABLE;
        }
        if !seg.executable {
            flags |= PteFlags::NX;
        }

        let page_start = align_down(seg.vaddr, PAGE_SIZE as u64);
        let page_end = align_up(seg.vaddr + seg.memsz, PAGE_SIZE as u64);
        if page_end > max_vaddr {
            max_vaddr = page_end;
        }

        let mut page_va = page_start;
        while page_va < page_end {
            let phys = pmm::alloc_zeroed_page().ok_or(KernelError::OutOfMemory)?;
            space.map(VirtAddr::new(page_va), phys, flags)?;

            // Copy the slice of file bytes that lands in this page.
            let file_lo = seg.vaddr.max(page_va);
            let file_hi = (seg.vaddr + seg.filesz).min(page_va + PAGE_SIZE as u64);
            if file_lo < file_hi {
                let src_off = (seg.offset + (file_lo - seg.vaddr)) as usize;
                let len = (file_hi - file_lo) as usize;
                let dst_off = (file_lo - page_va) as usize;
                unsafe {
                    core::ptr::copy_nonoverlapping(
                        image[src_off..src_off + len].as_ptr(),
                        phys_to_virt(phys).add(dst_off),
                        len,
                    );
                }
            }
            page_va += PAGE_SIZE as u64;
        }
    }

    Ok(LoadedImage { entry, max_vaddr })
}

/// Test fixture: a minimal ELF64 with one PT_LOAD — 8 code bytes at
/// 0x400000 plus a 0x2000-byte BSS tail. Shared with the exec tests.
#[cfg(test)]
pub fn tests_fixture() -> alloc::vec::Vec<u8> {
    let mut img = alloc::vec![0u8; 0x200];
    img[0..4].copy_from_slice(&ELF_MAGIC);
    img[4] = 2; // 64-bit
    img[5] = 1; // little-endian
    img[24..32].copy_from_slice(&0x40_0000u64.to_le_bytes()); // e_entry
    img[32..40].copy_from_slice(&64u64.to_le_bytes()); // e_phoff
    img[54..56].copy_from_slice(&56u16.to_le_bytes()); // e_phentsize
    img[56..58].copy_from_slice(&1u16.to_le_bytes()); // e_phnum

    let ph = 64;
    img[ph..ph + 4].copy_from_slice(&PT_LOAD.to_le_bytes());
    img[ph + 4..ph + 8].copy_from_slice(&(PF_X | PF_W | 4).to_le_bytes());
    img[ph + 8..ph + 16].copy_from_slice(&0x180u64.to_le_bytes()); // p_offset
    img[ph + 16..ph + 24].copy_from_slice(&0x40_0000u64.to_le_bytes()); // p_vaddr
    img[ph + 32..ph + 40].copy_from_slice(&8u64.to_le_bytes()); // p_filesz
    img[ph + 40..ph + 48].copy_from_slice(&0x2008u64.to_le_bytes()); // p_memsz

    img[0x180..0x188].copy_from_slice(b"codebyte");
    img
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mm::test_support;
    use alloc::vec::Vec;

    fn tiny_elf() -> Vec<u8> {
        tests_fixture()
    }

    #[test]
    fn rejects_non_elf_input() {
        assert!(parse_segments(b"not an elf file, nope").is_err());
        assert!(parse_segments(&[0u8; 10]).is_err());
    }

    #[test]
    fn parses_entry_and_segments() {
        let (entry, segs) = parse_segments(&tiny_elf()).unwrap();
        assert_eq!(entry, 0x40_0000);
        assert_eq!(segs.len(), 1);
        assert_eq!(segs[0].vaddr, 0x40_0000);
        assert_eq!(segs[0].filesz, 8);
        assert_eq!(segs[0].memsz, 0x2008);
        assert!(segs[0].writable);
    }

    #[test]
    fn load_maps_code_and_zero_fills_bss() {
        test_support::init_test_memory();
        let space = AddressSpace::new().unwrap();
        let loaded = load_bytes(&tiny_elf(), &space).unwrap();
        assert_eq!(loaded.entry, 0x40_0000);
        assert_eq!(loaded.max_vaddr, 0x40_3000, "memsz rounds to three pages");

        let code = space.translate(VirtAddr::new(0x40_0000)).unwrap();
        let mut bytes = [0u8; 8];
        unsafe {
            core::ptr::copy_nonoverlapping(phys_to_virt(code), bytes.as_mut_ptr(), 8)
        };
        assert_eq!(&bytes, b"codebyte");

        // BSS pages are mapped and zero.
        let bss = space.translate(VirtAddr::new(0x40_2000)).unwrap();
        unsafe {
            assert_eq!(*phys_to_virt(bss), 0);
        }
        // Past the segment nothing is mapped.
        assert!(space.translate(VirtAddr::new(0x40_3000)).is_none());
        space.destroy();
    }

    #[test]
    fn truncated_segment_is_rejected() {
        let mut img = tiny_elf();
        // filesz beyond the file.
        img[64 + 32..64 + 40].copy_from_slice(&0x10_0000u64.to_le_bytes());
        img[64 + 40..64 + 48].copy_from_slice(&0x10_0000u64.to_le_bytes());
        assert!(parse_segments(&img).is_err());
    }
}
