//! EXT2 filesystem (rev 0, 1 KiB blocks, little-endian on disk).
//!
//! Each mounted device gets its own [`Ext2Volume`] carrying its own
//! superblock and inode cache; nothing is shared between devices, so block
//! bitmaps, group descriptors, and inode tables are always indexed through
//! the right device's superblock.
//!
//! Block bitmaps are 1 KiB (one filesystem block = two sectors); every
//! bitmap operation reads and writes the full 1024 bytes, because a group
//! holds up to 8192 blocks and the interesting bits freely live beyond the
//! first sector.

mod inode;
mod node;

pub use inode::InodeHandle;
pub use node::Ext2Node;

use alloc::sync::Arc;

use crate::block::bio::BlockIo;
use crate::error::{FsError, KernelError, KernelResult};
use crate::fs::NodeRef;

use inode::InodeCache;

/// Filesystem block size.
pub const EXT2_BSIZE: usize = 1024;

/// Superblock magic.
pub const EXT2_MAGIC: u16 = 0xEF53;

/// Root directory inode number.
pub const ROOT_INUM: u32 = 2;

pub(crate) const SECTORS_PER_BLOCK: u32 = (EXT2_BSIZE / 512) as u32;
pub(crate) const NDIR_BLOCKS: usize = 12;
pub(crate) const IND_BLOCK: usize = NDIR_BLOCKS;
pub(crate) const DIND_BLOCK: usize = IND_BLOCK + 1;
pub(crate) const TIND_BLOCK: usize = DIND_BLOCK + 1;
pub(crate) const N_BLOCKS: usize = TIND_BLOCK + 1;
pub(crate) const PTRS_PER_BLOCK: u32 = (EXT2_BSIZE / 4) as u32;
pub(crate) const PTRS_PER_SECTOR: u32 = 128;

/// Largest mappable file in blocks: 12 direct + 1 tier each of single,
/// double and triple indirection.
pub(crate) const MAX_FILE_BLOCKS: u64 = NDIR_BLOCKS as u64
    + PTRS_PER_BLOCK as u64
    + (PTRS_PER_BLOCK as u64 * PTRS_PER_BLOCK as u64)
    + (PTRS_PER_BLOCK as u64 * PTRS_PER_BLOCK as u64 * PTRS_PER_BLOCK as u64);

// On-disk i_mode type bits.
pub(crate) const S_IFMT: u16 = 0o170000;
pub(crate) const S_IFREG: u16 = 0o100000;
pub(crate) const S_IFDIR: u16 = 0o040000;
pub(crate) const S_IFCHR: u16 = 0o020000;

// In-memory inode kinds (match the directory-entry file_type codes).
pub(crate) const KIND_NONE: u16 = 0;
pub(crate) const KIND_FILE: u16 = 1;
pub(crate) const KIND_DIR: u16 = 2;
pub(crate) const KIND_CHARDEV: u16 = 3;
pub(crate) const KIND_BLOCKDEV: u16 = 4;

fn le16(buf: &[u8], off: usize) -> u16 {
    u16::from_le_bytes(buf[off..off + 2].try_into().unwrap())
}

fn le32(buf: &[u8], off: usize) -> u32 {
    u32::from_le_bytes(buf[off..off + 4].try_into().unwrap())
}

fn put16(buf: &mut [u8], off: usize, v: u16) {
    buf[off..off + 2].copy_from_slice(&v.to_le_bytes());
}

fn put32(buf: &mut [u8], off: usize, v: u32) {
    buf[off..off + 4].copy_from_slice(&v.to_le_bytes());
}

/// The fields of the on-disk superblock this driver uses.
#[derive(Debug, Clone, Copy)]
pub struct Superblock {
    pub inodes_count: u32,
    pub blocks_count: u32,
    pub first_data_block: u32,
    pub log_block_size: u32,
    pub blocks_per_group: u32,
    pub inodes_per_group: u32,
    pub magic: u16,
    pub inode_size: u16,
}

impl Superblock {
    /// Decode from the raw 1024-byte superblock.
    pub fn parse(raw: &[u8]) -> Superblock {
        let mut inode_size = le16(raw, 88);
        if inode_size == 0 {
            inode_size = 128;
        }
        Superblock {
            inodes_count: le32(raw, 0),
            blocks_count: le32(raw, 4),
            first_data_block: le32(raw, 20),
            log_block_size: le32(raw, 24),
            blocks_per_group: le32(raw, 32),
            inodes_per_group: le32(raw, 40),
            magic: le16(raw, 56),
            inode_size,
        }
    }
}

/// One block group descriptor.
#[derive(Debug, Clone, Copy)]
pub(crate) struct GroupDesc {
    pub block_bitmap: u32,
    pub inode_bitmap: u32,
    pub inode_table: u32,
}

/// One mounted EXT2 filesystem.
pub struct Ext2Volume {
    io: Arc<BlockIo>,
    dev: u8,
    part_start: u32,
    sb: Superblock,
    cache: InodeCache,
}

impl Ext2Volume {
    /// Mount the filesystem on storage device `dev` starting at sector
    /// `part_lba`.
    pub fn mount(io: Arc<BlockIo>, dev: u8, part_lba: u32) -> KernelResult<Arc<Ext2Volume>> {
        let mut raw = [0u8; EXT2_BSIZE];
        {
            // Superblock lives at byte 1024: sectors 2 and 3 of the partition.
            let bp = io.bread(dev, part_lba + 2)?;
            raw[..512].copy_from_slice(bp.data());
        }
        {
            let bp = io.bread(dev, part_lba + 3)?;
            raw[512..].copy_from_slice(bp.data());
        }
        let sb = Superblock::parse(&raw);
        if sb.magic != EXT2_MAGIC {
            log::warn!("ext2: bad magic 0x{:x} on device {}", sb.magic, dev);
            return Err(KernelError::Fs(FsError::Io));
        }
        if sb.blocks_per_group == 0 || sb.inodes_per_group == 0 {
            return Err(KernelError::Fs(FsError::Io));
        }
        log::info!(
            "ext2: dev {} block_size {} blocks {} inodes {} inode_size {}",
            dev,
            1024u32 << sb.log_block_size,
            sb.blocks_count,
            sb.inodes_count,
            sb.inode_size
        );
        Ok(Arc::new(Ext2Volume {
            io,
            dev,
            part_start: part_lba,
            sb,
            cache: InodeCache::new(),
        }))
    }

    pub fn device(&self) -> u8 {
        self.dev
    }

    pub fn superblock(&self) -> &Superblock {
        &self.sb
    }

    /// The root directory as a VFS node.
    pub fn root(self: &Arc<Self>) -> KernelResult<NodeRef> {
        let handle = inode::iget(self, ROOT_INUM)?;
        let node = Ext2Node::from_handle(handle)?;
        Ok(node)
    }

    /// Absolute sector of a filesystem block.
    pub(crate) fn sector_of_block(&self, block: u32) -> u32 {
        block * SECTORS_PER_BLOCK + self.part_start
    }

    pub(crate) fn io(&self) -> &BlockIo {
        &self.io
    }

    pub(crate) fn icache(&self) -> &InodeCache {
        &self.cache
    }

    /// Read a whole 1 KiB filesystem block.
    pub(crate) fn read_block(&self, block: u32, out: &mut [u8; EXT2_BSIZE]) -> Result<(), FsError> {
        let sector = self.sector_of_block(block);
        for i in 0..SECTORS_PER_BLOCK {
            let bp = self.io.bread(self.dev, sector + i).map_err(|_| FsError::Io)?;
            let at = i as usize * 512;
            out[at..at + 512].copy_from_slice(bp.data());
        }
        Ok(())
    }

    /// Write a whole 1 KiB filesystem block through the cache.
    pub(crate) fn write_block(&self, block: u32, data: &[u8; EXT2_BSIZE]) -> Result<(), FsError> {
        let sector = self.sector_of_block(block);
        for i in 0..SECTORS_PER_BLOCK {
            let mut bp = self.io.bread(self.dev, sector + i).map_err(|_| FsError::Io)?;
            let at = i as usize * 512;
            bp.data_mut().copy_from_slice(&data[at..at + 512]);
            bp.write().map_err(|_| FsError::Io)?;
        }
        Ok(())
    }

    /// Number of block groups (last group may be partial).
    pub(crate) fn group_count(&self) -> u32 {
        self.sb.blocks_count / self.sb.blocks_per_group + 1
    }

    /// Group descriptor `gno`; the descriptor table starts at block 2.
    pub(crate) fn read_group_desc(&self, gno: u32) -> Result<GroupDesc, FsError> {
        let byte = gno as usize * 32;
        let sector = self.sector_of_block(2) + (byte / 512) as u32;
        let off = byte % 512;
        let bp = self.io.bread(self.dev, sector).map_err(|_| FsError::Io)?;
        let data = bp.data();
        Ok(GroupDesc {
            block_bitmap: le32(data, off),
            inode_bitmap: le32(data, off + 4),
            inode_table: le32(data, off + 8),
        })
    }

    /// First clear bit below `nbits`, set in place.
    fn take_free_bit(bitmap: &mut [u8; EXT2_BSIZE], nbits: u32) -> Option<u32> {
        let bytes = ((nbits as usize) + 7) / 8;
        for i in 0..bytes.min(EXT2_BSIZE) {
            if bitmap[i] == 0xFF {
                continue;
            }
            for j in 0..8 {
                let bit = (i * 8 + j) as u32;
                if bit >= nbits {
                    break;
                }
                let mask = 1u8 << j;
                if bitmap[i] & mask == 0 {
                    bitmap[i] |= mask;
                    return Some(bit);
                }
            }
        }
        None
    }

    /// Allocate a zeroed data block, preferring the group of `inum` and
    /// falling back to the following groups when one is full.
    pub(crate) fn balloc(&self, inum: u32) -> Result<u32, FsError> {
        let groups = self.group_count();
        let start = (inum.saturating_sub(1)) / self.sb.inodes_per_group;
        for i in 0..groups {
            let gno = (start + i) % groups;
            let desc = self.read_group_desc(gno)?;
            if desc.block_bitmap == 0 {
                continue;
            }
            let mut bitmap = [0u8; EXT2_BSIZE];
            self.read_block(desc.block_bitmap, &mut bitmap)?;
            let Some(bit) = Self::take_free_bit(&mut bitmap, self.sb.blocks_per_group) else {
                continue;
            };
            self.write_block(desc.block_bitmap, &bitmap)?;
            let block = self.sb.first_data_block + gno * self.sb.blocks_per_group + bit;
            self.bzero(block)?;
            return Ok(block);
        }
        log::error!("ext2: dev {} out of blocks", self.dev);
        Err(FsError::NoSpace)
    }

    /// Release a data block. Corrupt bitmaps are fail-stop.
    pub(crate) fn bfree(&self, block: u32) -> Result<(), FsError> {
        if block < self.sb.first_data_block {
            panic!("ext2: bfree of reserved block {}", block);
        }
        let index = block - self.sb.first_data_block;
        let gno = index / self.sb.blocks_per_group;
        let offset = index % self.sb.blocks_per_group;

        let desc = self.read_group_desc(gno)?;
        let mut bitmap = [0u8; EXT2_BSIZE];
        self.read_block(desc.block_bitmap, &mut bitmap)?;

        let byte = (offset / 8) as usize;
        if byte >= EXT2_BSIZE {
            panic!("ext2: bfree bitmap overflow (block {})", block);
        }
        let mask = 1u8 << (offset % 8);
        if bitmap[byte] & mask == 0 {
            panic!("ext2: block {} already free", block);
        }
        bitmap[byte] &= !mask;
        self.write_block(desc.block_bitmap, &bitmap)
    }

    /// Zero every sector of a block.
    pub(crate) fn bzero(&self, block: u32) -> Result<(), FsError> {
        let sector = self.sector_of_block(block);
        for i in 0..SECTORS_PER_BLOCK {
            let mut bp = self
                .io
                .bread(self.dev, sector + i)
                .map_err(|_| FsError::Io)?;
            bp.data_mut().fill(0);
            bp.write().map_err(|_| FsError::Io)?;
        }
        Ok(())
    }

    /// Read slot `slot` of the pointer table in `block`, allocating and
    /// persisting a fresh block there when the slot is empty.
    pub(crate) fn ensure_ptr(&self, block: u32, slot: u32, inum: u32) -> Result<u32, FsError> {
        let sector = self.sector_of_block(block) + slot / PTRS_PER_SECTOR;
        let off = ((slot % PTRS_PER_SECTOR) * 4) as usize;
        let mut bp = self.io.bread(self.dev, sector).map_err(|_| FsError::Io)?;
        let current = le32(bp.data(), off);
        if current != 0 {
            return Ok(current);
        }
        drop(bp);
        let fresh = self.balloc(inum)?;
        bp = self.io.bread(self.dev, sector).map_err(|_| FsError::Io)?;
        put32(bp.data_mut(), off, fresh);
        bp.write().map_err(|_| FsError::Io)?;
        Ok(fresh)
    }

    /// Free an indirect tree. Depth 1/2/3 = single/double/triple indirect.
    pub(crate) fn free_indirect(&self, block: u32, depth: u32) -> Result<(), FsError> {
        if block == 0 || depth == 0 {
            return Ok(());
        }
        let mut table = [0u8; EXT2_BSIZE];
        self.read_block(block, &mut table)?;
        for slot in 0..PTRS_PER_BLOCK {
            let ptr = le32(&table, (slot * 4) as usize);
            if ptr == 0 {
                continue;
            }
            if depth > 1 {
                self.free_indirect(ptr, depth - 1)?;
            } else {
                self.bfree(ptr)?;
            }
        }
        self.bfree(block)
    }

    /// Sector and in-sector byte offset of `inum`'s slot in its group's
    /// inode table.
    pub(crate) fn inode_loc(&self, inum: u32) -> Result<(u32, usize), FsError> {
        let gno = (inum - 1) / self.sb.inodes_per_group;
        let index = (inum - 1) % self.sb.inodes_per_group;
        let desc = self.read_group_desc(gno)?;

        let inode_size = self.sb.inode_size as u32;
        let inodes_per_block = EXT2_BSIZE as u32 / inode_size;
        let block = desc.inode_table + index / inodes_per_block;
        let block_off = (index % inodes_per_block) * inode_size;
        let sector = self.sector_of_block(block) + block_off / 512;
        Ok((sector, (block_off % 512) as usize))
    }

    /// Allocate a fresh on-disk inode of `kind`, scanning every group's
    /// inode bitmap. Returns the inode number.
    pub(crate) fn ialloc(&self, kind: u16) -> Result<u32, FsError> {
        for gno in 0..self.group_count() {
            let desc = self.read_group_desc(gno)?;
            if desc.inode_bitmap == 0 {
                continue;
            }
            let mut bitmap = [0u8; EXT2_BSIZE];
            self.read_block(desc.inode_bitmap, &mut bitmap)?;
            let Some(bit) = Self::take_free_bit(&mut bitmap, self.sb.inodes_per_group) else {
                continue;
            };

            let inum = gno * self.sb.inodes_per_group + bit + 1;
            let (sector, off) = self.inode_loc(inum)?;
            let mode = match kind {
                KIND_DIR => S_IFDIR,
                KIND_CHARDEV => S_IFCHR,
                _ => S_IFREG,
            };
            let mut bp = self.io.bread(self.dev, sector).map_err(|_| FsError::Io)?;
            let data = bp.data_mut();
            data[off..off + self.sb.inode_size as usize].fill(0);
            put16(data, off, mode);
            bp.write().map_err(|_| FsError::Io)?;
            drop(bp);

            self.write_block(desc.inode_bitmap, &bitmap)?;
            return Ok(inum);
        }
        log::error!("ext2: dev {} out of inodes", self.dev);
        Err(FsError::NoSpace)
    }

    /// Clear `inum`'s bit in its group's inode bitmap. Double-free is
    /// fail-stop.
    pub(crate) fn free_inode_bit(&self, inum: u32) -> Result<(), FsError> {
        let gno = (inum - 1) / self.sb.inodes_per_group;
        let index = (inum - 1) % self.sb.inodes_per_group;
        let desc = self.read_group_desc(gno)?;
        let mut bitmap = [0u8; EXT2_BSIZE];
        self.read_block(desc.inode_bitmap, &mut bitmap)?;
        let byte = (index / 8) as usize;
        if byte >= EXT2_BSIZE {
            panic!("ext2: inode bitmap overflow (inum {})", inum);
        }
        let mask = 1u8 << (index % 8);
        if bitmap[byte] & mask == 0 {
            panic!("ext2: inode {} already free", inum);
        }
        bitmap[byte] &= !mask;
        self.write_block(desc.inode_bitmap, &bitmap)
    }

    /// Test hook: is `inum`'s bit set on disk?
    #[cfg(test)]
    pub(crate) fn inode_bit_is_set(&self, inum: u32) -> bool {
        let gno = (inum - 1) / self.sb.inodes_per_group;
        let index = (inum - 1) % self.sb.inodes_per_group;
        let desc = self.read_group_desc(gno).unwrap();
        let mut bitmap = [0u8; EXT2_BSIZE];
        self.read_block(desc.inode_bitmap, &mut bitmap).unwrap();
        bitmap[(index / 8) as usize] & (1 << (index % 8)) != 0
    }
}

#[cfg(test)]
pub(crate) mod testfs;

#[cfg(test)]
mod tests;
