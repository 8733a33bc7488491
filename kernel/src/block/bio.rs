//! Buffer cache: 128 cached 512-byte blocks with LRU recycling.
//!
//! One spinlock orders the slot metadata and the LRU list; a sleeplock per
//! slot serializes access to the block bytes. A buffer returned by
//! [`BlockIo::bread`] is pinned (refcount) and locked until the guard
//! drops. Dirty slots are written back before recycling.

use alloc::sync::Arc;
use alloc::vec::Vec;

use spin::Mutex;

use super::storage::{StorageSet, SECTOR_SIZE};
use crate::error::{KernelError, KernelResult};
use crate::sync::{SleepLock, SleepLockGuard};

/// Number of cache slots.
pub const BIO_CACHE_SIZE: usize = 128;

/// Cached block size; equal to one sector.
pub const BLOCK_SIZE: usize = SECTOR_SIZE;

#[derive(Clone, Copy, PartialEq, Eq)]
struct BlockId {
    dev: u8,
    block: u32,
}

struct SlotMeta {
    id: BlockId,
    refs: u32,
}

/// Bytes plus validity, guarded by the slot sleeplock. `owner` names the
/// block the bytes belong to; a recycled slot is detected by an owner
/// mismatch under the sleeplock.
struct SlotData {
    owner: BlockId,
    valid: bool,
    dirty: bool,
    bytes: [u8; BLOCK_SIZE],
}

struct CacheState {
    meta: Vec<SlotMeta>,
    /// Slot indices, most recently used first.
    lru: Vec<usize>,
}

/// The buffer cache plus its storage backends.
pub struct BlockIo {
    state: Mutex<CacheState>,
    slots: Vec<SleepLock<SlotData>>,
    storage: StorageSet,
}

/// A pinned, locked cache block. Dropping releases the lock and unpins.
pub struct BufGuard<'a> {
    io: &'a BlockIo,
    idx: usize,
    id: BlockId,
    data: SleepLockGuard<'a, SlotData>,
}

impl BlockIo {
    pub fn new() -> Arc<Self> {
        const NONE: BlockId = BlockId { dev: 0xFF, block: 0 };
        let mut meta = Vec::with_capacity(BIO_CACHE_SIZE);
        let mut slots = Vec::with_capacity(BIO_CACHE_SIZE);
        let mut lru = Vec::with_capacity(BIO_CACHE_SIZE);
        for i in 0..BIO_CACHE_SIZE {
            meta.push(SlotMeta { id: NONE, refs: 0 });
            slots.push(SleepLock::new(
                "bio_buffer",
                SlotData {
                    owner: NONE,
                    valid: false,
                    dirty: false,
                    bytes: [0; BLOCK_SIZE],
                },
            ));
            lru.push(i);
        }
        Arc::new(Self {
            state: Mutex::new(CacheState { meta, lru }),
            slots,
            storage: StorageSet::new(),
        })
    }

    /// The backend table, for registration and raw access (GPT scan).
    pub fn storage(&self) -> &StorageSet {
        &self.storage
    }

    fn touch(lru: &mut Vec<usize>, idx: usize) {
        if let Some(pos) = lru.iter().position(|&i| i == idx) {
            lru.remove(pos);
        }
        lru.insert(0, idx);
    }

    /// Find or recycle a slot for `(dev, block)`, pinning it. Called and
    /// returns with the state lock released.
    fn get_slot(&self, id: BlockId) -> KernelResult<usize> {
        let mut state = self.state.lock();
        let state = &mut *state;

        // Cached?
        for (idx, m) in state.meta.iter_mut().enumerate() {
            if m.refs > 0 && m.id == id {
                m.refs += 1;
                Self::touch(&mut state.lru, idx);
                return Ok(idx);
            }
        }
        // Unpinned slots may also still hold the block.
        for (idx, m) in state.meta.iter_mut().enumerate() {
            if m.refs == 0 && m.id == id {
                m.refs = 1;
                Self::touch(&mut state.lru, idx);
                return Ok(idx);
            }
        }

        // Recycle the least recently used unpinned slot.
        for lru_pos in (0..state.lru.len()).rev() {
            let idx = state.lru[lru_pos];
            if state.meta[idx].refs == 0 {
                state.meta[idx].id = id;
                state.meta[idx].refs = 1;
                Self::touch(&mut state.lru, idx);
                return Ok(idx);
            }
        }

        log::error!("bio: no free buffers");
        Err(KernelError::IoError)
    }

    fn unpin(&self, idx: usize) {
        let mut state = self.state.lock();
        if state.meta[idx].refs > 0 {
            state.meta[idx].refs -= 1;
        }
    }

    /// Return a locked buffer holding the contents of `block` on `dev`.
    pub fn bread(&self, dev: u8, block: u32) -> KernelResult<BufGuard<'_>> {
        let id = BlockId { dev, block };
        let idx = self.get_slot(id)?;

        let mut data = self.slots[idx].lock();

        // A recycled slot still carries the previous block's bytes; write
        // them back if dirty before claiming it.
        if data.owner != id {
            if data.valid && data.dirty {
                let owner = data.owner;
                self.storage
                    .write(owner.dev, owner.block as u64, 1, &data.bytes)?;
            }
            data.owner = id;
            data.valid = false;
            data.dirty = false;
        }

        if !data.valid {
            if let Err(e) = self
                .storage
                .read(dev, block as u64, 1, &mut data.bytes)
            {
                drop(data);
                self.unpin(idx);
                return Err(e);
            }
            data.valid = true;
        }

        Ok(BufGuard {
            io: self,
            idx,
            id,
            data,
        })
    }

    /// Cache residency probe, for diagnostics and tests.
    pub fn cached_slot(&self, dev: u8, block: u32) -> Option<usize> {
        let state = self.state.lock();
        let id = BlockId { dev, block };
        state.meta.iter().position(|m| m.id == id)
    }
}

impl BufGuard<'_> {
    pub fn device(&self) -> u8 {
        self.id.dev
    }

    pub fn block(&self) -> u32 {
        self.id.block
    }

    pub fn data(&self) -> &[u8; BLOCK_SIZE] {
        &self.data.bytes
    }

    /// Mutable access marks the buffer dirty until written back.
    pub fn data_mut(&mut self) -> &mut [u8; BLOCK_SIZE] {
        self.data.dirty = true;
        &mut self.data.bytes
    }

    /// Write the buffer through to storage and clear the dirty mark.
    pub fn write(&mut self) -> KernelResult<()> {
        self.io
            .storage
            .write(self.id.dev, self.id.block as u64, 1, &self.data.bytes)?;
        self.data.dirty = false;
        Ok(())
    }
}

impl Drop for BufGuard<'_> {
    fn drop(&mut self) {
        self.io.unpin(self.idx);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::storage::RamDisk;
    use alloc::string::ToString;

    fn io_with_disk(sectors: u64) -> Arc<BlockIo> {
        let io = BlockIo::new();
        io.storage()
            .register(0, Arc::new(RamDisk::new("ram0".to_string(), sectors)));
        io
    }

    #[test]
    fn read_write_read_round_trip() {
        let io = io_with_disk(64);
        {
            let mut buf = io.bread(0, 7).unwrap();
            buf.data_mut()[0..4].copy_from_slice(b"obsd");
            buf.write().unwrap();
        }
        let buf = io.bread(0, 7).unwrap();
        assert_eq!(&buf.data()[0..4], b"obsd");
    }

    #[test]
    fn repeated_bread_hits_the_same_slot() {
        let io = io_with_disk(64);
        let first = {
            let _buf = io.bread(0, 3).unwrap();
            io.cached_slot(0, 3).unwrap()
        };
        let second = {
            let _buf = io.bread(0, 3).unwrap();
            io.cached_slot(0, 3).unwrap()
        };
        assert_eq!(first, second);
    }

    #[test]
    fn one_slot_per_device_block_pair() {
        let io = io_with_disk(64);
        let a = io.bread(0, 9).unwrap();
        drop(a);
        let _b = io.bread(0, 9).unwrap();
        let state = io.state.lock();
        let hits = state
            .meta
            .iter()
            .filter(|m| m.id == BlockId { dev: 0, block: 9 })
            .count();
        assert_eq!(hits, 1);
    }

    #[test]
    fn eviction_writes_back_dirty_blocks() {
        let io = io_with_disk(4096);
        {
            // Dirty block 5 without writing it through.
            let mut buf = io.bread(0, 5).unwrap();
            buf.data_mut()[0] = 0x77;
        }
        // Cycle enough other blocks through to evict it.
        for b in 100..100 + BIO_CACHE_SIZE as u32 + 8 {
            let _ = io.bread(0, b).unwrap();
        }
        assert!(io.cached_slot(0, 5).is_none(), "block 5 should be evicted");
        // The dirty byte must have reached the disk.
        let buf = io.bread(0, 5).unwrap();
        assert_eq!(buf.data()[0], 0x77);
    }

    #[test]
    fn devices_do_not_cross_contaminate() {
        let io = io_with_disk(64);
        io.storage()
            .register(1, Arc::new(RamDisk::new("ram1".to_string(), 64)));
        {
            let mut buf = io.bread(0, 2).unwrap();
            buf.data_mut()[0] = 0xAA;
            buf.write().unwrap();
        }
        {
            let mut buf = io.bread(1, 2).unwrap();
            buf.data_mut()[0] = 0xBB;
            buf.write().unwrap();
        }
        assert_eq!(io.bread(0, 2).unwrap().data()[0], 0xAA);
        assert_eq!(io.bread(1, 2).unwrap().data()[0], 0xBB);
    }

    #[test]
    fn pinned_buffers_survive_pressure() {
        let io = io_with_disk(4096);
        let pinned = io.bread(0, 1).unwrap();
        for b in 200..200 + BIO_CACHE_SIZE as u32 {
            let _ = io.bread(0, b).unwrap();
        }
        // Still resident and readable.
        assert_eq!(pinned.block(), 1);
        assert!(io.cached_slot(0, 1).is_some());
    }

    #[test]
    fn read_error_unpins_the_slot() {
        let io = io_with_disk(8);
        assert!(io.bread(0, 9999).is_err());
        let state = io.state.lock();
        assert!(state.meta.iter().all(|m| m.refs == 0));
    }
}
