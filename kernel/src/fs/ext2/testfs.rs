//! Test fixture: build minimal rev-0 EXT2 images in memory.
//!
//! Layout with 1 KiB blocks: block 0 boot, block 1 superblock, block 2
//! group descriptor table, then per group a block bitmap, an inode bitmap
//! and the inode table. Root (inode 2) is an empty directory.

use alloc::vec;
use alloc::vec::Vec;

use super::{EXT2_BSIZE, EXT2_MAGIC};

pub struct ImageSpec {
    pub blocks_per_group: u32,
    pub groups: u32,
    pub inodes_per_group: u32,
    /// Extra group-0 block-bitmap bits to pre-mark used (after metadata).
    pub prefill_group0_bits: u32,
}

impl Default for ImageSpec {
    fn default() -> Self {
        Self {
            blocks_per_group: 2048,
            groups: 1,
            inodes_per_group: 64,
            prefill_group0_bits: 0,
        }
    }
}

fn put16(img: &mut [u8], off: usize, v: u16) {
    img[off..off + 2].copy_from_slice(&v.to_le_bytes());
}

fn put32(img: &mut [u8], off: usize, v: u32) {
    img[off..off + 4].copy_from_slice(&v.to_le_bytes());
}

fn set_bit(bitmap: &mut [u8], bit: u32) {
    bitmap[(bit / 8) as usize] |= 1 << (bit % 8);
}

pub fn build(spec: &ImageSpec) -> Vec<u8> {
    assert_eq!(spec.inodes_per_group % 8, 0);
    let bpg = spec.blocks_per_group;
    let ipg = spec.inodes_per_group;
    let itable_blocks = ipg * 128 / EXT2_BSIZE as u32;
    assert!(itable_blocks >= 1);

    let total_blocks = 1 + spec.groups * bpg;
    let mut img = vec![0u8; total_blocks as usize * EXT2_BSIZE];

    // Superblock (block 1).
    let sb = EXT2_BSIZE;
    put32(&mut img, sb, spec.groups * ipg); // s_inodes_count
    put32(&mut img, sb + 4, total_blocks); // s_blocks_count
    put32(&mut img, sb + 20, 1); // s_first_data_block
    put32(&mut img, sb + 24, 0); // s_log_block_size (1 KiB)
    put32(&mut img, sb + 32, bpg); // s_blocks_per_group
    put32(&mut img, sb + 40, ipg); // s_inodes_per_group
    put16(&mut img, sb + 56, EXT2_MAGIC);
    put16(&mut img, sb + 88, 128); // s_inode_size

    for g in 0..spec.groups {
        // Metadata block numbers for this group.
        let (bbitmap, ibitmap, itable, meta_bits) = if g == 0 {
            (3u32, 4u32, 5u32, 4 + itable_blocks)
        } else {
            let base = 1 + g * bpg;
            (base, base + 1, base + 2, 2 + itable_blocks)
        };

        // Group descriptor.
        let gd = 2 * EXT2_BSIZE + g as usize * 32;
        put32(&mut img, gd, bbitmap);
        put32(&mut img, gd + 4, ibitmap);
        put32(&mut img, gd + 8, itable);

        // Block bitmap: metadata blocks are used.
        {
            let at = bbitmap as usize * EXT2_BSIZE;
            let bitmap = &mut img[at..at + EXT2_BSIZE];
            for bit in 0..meta_bits {
                set_bit(bitmap, bit);
            }
            if g == 0 {
                for bit in meta_bits..meta_bits + spec.prefill_group0_bits {
                    set_bit(bitmap, bit);
                }
            }
        }

        // Inode bitmap: group 0 reserves inode 1 and the root inode 2.
        if g == 0 {
            let at = ibitmap as usize * EXT2_BSIZE;
            let bitmap = &mut img[at..at + EXT2_BSIZE];
            set_bit(bitmap, 0);
            set_bit(bitmap, 1);
        }
    }

    // Root inode: group 0, table index 1.
    let root = 5 * EXT2_BSIZE + 128;
    put16(&mut img, root, 0o040000); // S_IFDIR
    put16(&mut img, root + 26, 2); // links: itself + "."

    img
}

/// Mount a fresh image as storage device `dev` on `io`.
pub fn mount_image(
    io: &alloc::sync::Arc<crate::block::bio::BlockIo>,
    dev: u8,
    spec: &ImageSpec,
) -> alloc::sync::Arc<super::Ext2Volume> {
    use alloc::format;
    use alloc::sync::Arc;
    use crate::block::storage::RamDisk;

    io.storage().register(
        dev,
        Arc::new(RamDisk::from_image(format!("ext2-{}", dev), build(spec))),
    );
    super::Ext2Volume::mount(io.clone(), dev, 0).expect("mount test image")
}
