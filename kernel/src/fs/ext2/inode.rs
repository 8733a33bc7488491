//! EXT2 in-memory inodes: the per-volume cache, handles, and locked
//! inode operations (file I/O, block mapping, directories).
//!
//! A cache entry is claimed by `iget` and stays "invalid" until the first
//! `lock`, which reads the on-disk inode lazily. The last handle to an
//! unlinked inode frees its blocks and its bitmap bit on drop.

use alloc::string::String;
use alloc::sync::Arc;
use alloc::vec::Vec;

use spin::Mutex;

use crate::error::{FsError, KernelResult};
use crate::fs::DirEntry;
use crate::sync::{SleepLock, SleepLockGuard};

use super::{
    le16, le32, put16, put32, Ext2Volume, DIND_BLOCK, EXT2_BSIZE, IND_BLOCK, KIND_CHARDEV,
    KIND_DIR, KIND_FILE, KIND_NONE, MAX_FILE_BLOCKS, NDIR_BLOCKS, N_BLOCKS, PTRS_PER_BLOCK,
    S_IFCHR, S_IFDIR, S_IFMT, S_IFREG, TIND_BLOCK,
};

/// Inode cache capacity per volume.
pub(super) const NINODE: usize = 50;

/// Longest directory entry name.
pub(super) const EXT2_NAME_LEN: usize = 255;

/// The cached, mutable image of one on-disk inode.
pub(super) struct InodeState {
    pub valid: bool,
    pub kind: u16,
    pub major: u16,
    pub minor: u16,
    pub nlink: u16,
    pub size: u32,
    pub addrs: [u32; N_BLOCKS],
    pub atime: u32,
    pub ctime: u32,
    pub mtime: u32,
    pub dtime: u32,
}

impl InodeState {
    const fn empty() -> Self {
        Self {
            valid: false,
            kind: KIND_NONE,
            major: 0,
            minor: 0,
            nlink: 0,
            size: 0,
            addrs: [0; N_BLOCKS],
            atime: 0,
            ctime: 0,
            mtime: 0,
            dtime: 0,
        }
    }
}

struct MetaSlot {
    inum: u32,
    refs: u32,
}

/// Fixed-size inode cache; one per volume.
pub(super) struct InodeCache {
    meta: Mutex<Vec<MetaSlot>>,
    slots: Vec<SleepLock<InodeState>>,
}

impl InodeCache {
    pub(super) fn new() -> Self {
        let mut meta = Vec::with_capacity(NINODE);
        let mut slots = Vec::with_capacity(NINODE);
        for _ in 0..NINODE {
            meta.push(MetaSlot { inum: 0, refs: 0 });
            slots.push(SleepLock::new("inode", InodeState::empty()));
        }
        Self {
            meta: Mutex::new(meta),
            slots,
        }
    }
}

/// A counted reference to a cached inode.
pub struct InodeHandle {
    vol: Arc<Ext2Volume>,
    slot: usize,
    inum: u32,
}

/// Look up or claim a cache entry for `(volume, inum)`.
pub(super) fn iget(vol: &Arc<Ext2Volume>, inum: u32) -> KernelResult<InodeHandle> {
    let cache = vol.icache();
    let mut meta = cache.meta.lock();

    for (slot, m) in meta.iter_mut().enumerate() {
        if m.refs > 0 && m.inum == inum {
            m.refs += 1;
            return Ok(InodeHandle {
                vol: vol.clone(),
                slot,
                inum,
            });
        }
    }

    let slot = meta
        .iter()
        .position(|m| m.refs == 0)
        .unwrap_or_else(|| panic!("ext2: inode cache exhausted"));
    meta[slot].inum = inum;
    meta[slot].refs = 1;
    // refs was zero, so no guard exists and none can appear while we hold
    // the cache lock; reset the slot in place.
    unsafe {
        *cache.slots[slot].data_ptr() = InodeState::empty();
    }
    Ok(InodeHandle {
        vol: vol.clone(),
        slot,
        inum,
    })
}

impl Clone for InodeHandle {
    fn clone(&self) -> Self {
        let cache = self.vol.icache();
        cache.meta.lock()[self.slot].refs += 1;
        Self {
            vol: self.vol.clone(),
            slot: self.slot,
            inum: self.inum,
        }
    }
}

impl InodeHandle {
    pub fn inum(&self) -> u32 {
        self.inum
    }

    pub(super) fn volume(&self) -> &Arc<Ext2Volume> {
        &self.vol
    }

    /// Lock the inode, reading it from disk on first use.
    pub(super) fn lock(&self) -> Result<InodeGuard<'_>, FsError> {
        let mut state = self.vol.icache().slots[self.slot].lock();
        if !state.valid {
            read_disk_inode(&self.vol, self.inum, &mut state)?;
            state.valid = true;
        }
        if state.kind == KIND_NONE {
            return Err(FsError::Io);
        }
        Ok(InodeGuard {
            handle: self,
            state,
        })
    }
}

impl Drop for InodeHandle {
    fn drop(&mut self) {
        let cache = self.vol.icache();
        {
            let mut state = cache.slots[self.slot].lock();
            if state.valid && state.nlink == 0 {
                let last = cache.meta.lock()[self.slot].refs == 1;
                if last {
                    // No links and no other holders: give the inode and its
                    // blocks back to the filesystem.
                    let _ = self.vol.free_inode_bit(self.inum);
                    let _ = itrunc_state(&self.vol, self.inum, &mut state);
                    state.kind = KIND_NONE;
                    let _ = write_disk_inode(&self.vol, self.inum, &state);
                    state.valid = false;
                }
            }
        }
        cache.meta.lock()[self.slot].refs -= 1;
    }
}

/// Exclusive, loaded access to an inode.
pub(super) struct InodeGuard<'a> {
    handle: &'a InodeHandle,
    state: SleepLockGuard<'a, InodeState>,
}

fn read_disk_inode(vol: &Ext2Volume, inum: u32, state: &mut InodeState) -> Result<(), FsError> {
    let (sector, off) = vol.inode_loc(inum)?;
    let bp = vol.io().bread(vol.device(), sector).map_err(|_| FsError::Io)?;
    let raw = &bp.data()[off..off + vol.superblock().inode_size.min(128) as usize];

    let mode = le16(raw, 0);
    state.kind = if mode & S_IFMT == S_IFDIR {
        KIND_DIR
    } else if mode & S_IFMT == S_IFREG {
        KIND_FILE
    } else if mode & S_IFMT == S_IFCHR {
        KIND_CHARDEV
    } else {
        KIND_NONE
    };
    state.size = le32(raw, 4);
    state.atime = le32(raw, 8);
    state.ctime = le32(raw, 12);
    state.mtime = le32(raw, 16);
    state.dtime = le32(raw, 20);
    state.nlink = le16(raw, 26);
    for (i, addr) in state.addrs.iter_mut().enumerate() {
        *addr = le32(raw, 40 + i * 4);
    }
    if state.kind == KIND_CHARDEV {
        state.major = ((state.addrs[0] >> 8) & 0xFF) as u16;
        state.minor = (state.addrs[0] & 0xFF) as u16;
    }
    Ok(())
}

fn write_disk_inode(vol: &Ext2Volume, inum: u32, state: &InodeState) -> Result<(), FsError> {
    let (sector, off) = vol.inode_loc(inum)?;
    let mut bp = vol.io().bread(vol.device(), sector).map_err(|_| FsError::Io)?;
    let raw = &mut bp.data_mut()[off..];

    let mode = match state.kind {
        KIND_DIR => S_IFDIR,
        KIND_CHARDEV => S_IFCHR,
        _ => S_IFREG,
    };
    put16(raw, 0, mode);
    put16(raw, 2, 0); // uid
    put32(raw, 4, state.size);
    put32(raw, 8, state.atime);
    put32(raw, 12, state.ctime);
    put32(raw, 16, state.mtime);
    put32(raw, 20, 0); // dtime
    put16(raw, 24, 0); // gid
    put16(raw, 26, state.nlink);
    for (i, addr) in state.addrs.iter().enumerate() {
        put32(raw, 40 + i * 4, *addr);
    }
    if state.kind == KIND_CHARDEV {
        put32(raw, 40, ((state.major as u32) << 8) | state.minor as u32);
    }
    bp.write().map_err(|_| FsError::Io)
}

/// Free every data block of an inode and zero its pointer set.
fn itrunc_state(vol: &Ext2Volume, inum: u32, state: &mut InodeState) -> Result<(), FsError> {
    for i in 0..NDIR_BLOCKS {
        if state.addrs[i] != 0 {
            vol.bfree(state.addrs[i])?;
            state.addrs[i] = 0;
        }
    }
    for (slot, depth) in [(IND_BLOCK, 1), (DIND_BLOCK, 2), (TIND_BLOCK, 3)] {
        if state.addrs[slot] != 0 {
            vol.free_indirect(state.addrs[slot], depth)?;
            state.addrs[slot] = 0;
        }
    }
    state.size = 0;
    write_disk_inode(vol, inum, state)
}

impl InodeGuard<'_> {
    pub fn kind(&self) -> u16 {
        self.state.kind
    }

    pub fn size(&self) -> u32 {
        self.state.size
    }

    pub fn nlink(&self) -> u16 {
        self.state.nlink
    }

    pub fn set_nlink(&mut self, nlink: u16) {
        self.state.nlink = nlink;
    }

    pub fn set_device(&mut self, major: u16, minor: u16) {
        self.state.major = major;
        self.state.minor = minor;
    }

    pub fn times(&self) -> (u32, u32, u32, u32) {
        (
            self.state.atime,
            self.state.ctime,
            self.state.mtime,
            self.state.dtime,
        )
    }

    /// Persist the in-memory inode to disk.
    pub fn update(&mut self) -> Result<(), FsError> {
        let vol = self.handle.vol.clone();
        write_disk_inode(&vol, self.handle.inum, &self.state)
    }

    /// Absolute sector holding logical file block `bn`, allocating the
    /// block (and any missing indirect tables) on the way.
    pub fn bmap(&mut self, bn: u32) -> Result<u32, FsError> {
        let vol = self.handle.vol.clone();
        let inum = self.handle.inum;
        let mut bn = bn;

        if (bn as usize) < NDIR_BLOCKS {
            if self.state.addrs[bn as usize] == 0 {
                self.state.addrs[bn as usize] = vol.balloc(inum)?;
            }
            return Ok(vol.sector_of_block(self.state.addrs[bn as usize]));
        }
        bn -= NDIR_BLOCKS as u32;

        if bn < PTRS_PER_BLOCK {
            if self.state.addrs[IND_BLOCK] == 0 {
                self.state.addrs[IND_BLOCK] = vol.balloc(inum)?;
            }
            let leaf = vol.ensure_ptr(self.state.addrs[IND_BLOCK], bn, inum)?;
            return Ok(vol.sector_of_block(leaf));
        }
        bn -= PTRS_PER_BLOCK;

        if bn < PTRS_PER_BLOCK * PTRS_PER_BLOCK {
            if self.state.addrs[DIND_BLOCK] == 0 {
                self.state.addrs[DIND_BLOCK] = vol.balloc(inum)?;
            }
            let mid = vol.ensure_ptr(self.state.addrs[DIND_BLOCK], bn / PTRS_PER_BLOCK, inum)?;
            let leaf = vol.ensure_ptr(mid, bn % PTRS_PER_BLOCK, inum)?;
            return Ok(vol.sector_of_block(leaf));
        }
        bn -= PTRS_PER_BLOCK * PTRS_PER_BLOCK;

        if (bn as u64) < PTRS_PER_BLOCK as u64 * PTRS_PER_BLOCK as u64 * PTRS_PER_BLOCK as u64 {
            if self.state.addrs[TIND_BLOCK] == 0 {
                self.state.addrs[TIND_BLOCK] = vol.balloc(inum)?;
            }
            let l1 = vol.ensure_ptr(
                self.state.addrs[TIND_BLOCK],
                bn / (PTRS_PER_BLOCK * PTRS_PER_BLOCK),
                inum,
            )?;
            let rem = bn % (PTRS_PER_BLOCK * PTRS_PER_BLOCK);
            let l2 = vol.ensure_ptr(l1, rem / PTRS_PER_BLOCK, inum)?;
            let leaf = vol.ensure_ptr(l2, rem % PTRS_PER_BLOCK, inum)?;
            return Ok(vol.sector_of_block(leaf));
        }

        panic!("ext2: block number out of range");
    }

    /// Read file bytes. Returns 0 at or past EOF.
    pub fn read(&mut self, mut off: u32, dst: &mut [u8]) -> Result<usize, FsError> {
        if self.state.kind == KIND_CHARDEV {
            return Err(FsError::NotSupported);
        }
        let size = self.state.size;
        if off >= size {
            return Ok(0);
        }
        let mut n = dst.len() as u32;
        if off.checked_add(n).is_none() {
            return Ok(0);
        }
        if off + n > size {
            n = size - off;
        }

        let vol = self.handle.vol.clone();
        let mut total = 0u32;
        while total < n {
            let sector_start = self.bmap(off / EXT2_BSIZE as u32)?;
            let in_block = off % EXT2_BSIZE as u32;
            let sector = sector_start + in_block / 512;
            let in_sector = (in_block % 512) as usize;
            let chunk = ((n - total) as usize).min(512 - in_sector);

            let bp = vol
                .io()
                .bread(vol.device(), sector)
                .map_err(|_| FsError::Io)?;
            dst[total as usize..total as usize + chunk]
                .copy_from_slice(&bp.data()[in_sector..in_sector + chunk]);

            total += chunk as u32;
            off += chunk as u32;
        }
        Ok(n as usize)
    }

    /// Write file bytes, growing the file (and its size) as needed.
    pub fn write(&mut self, mut off: u32, src: &[u8]) -> Result<usize, FsError> {
        if self.state.kind == KIND_CHARDEV {
            return Err(FsError::NotSupported);
        }
        let n = src.len() as u32;
        if off > self.state.size || off.checked_add(n).is_none() {
            return Err(FsError::FileTooLarge);
        }
        if off as u64 + n as u64 > MAX_FILE_BLOCKS * EXT2_BSIZE as u64 {
            return Err(FsError::FileTooLarge);
        }

        let vol = self.handle.vol.clone();
        let mut total = 0u32;
        while total < n {
            let sector_start = self.bmap(off / EXT2_BSIZE as u32)?;
            let in_block = off % EXT2_BSIZE as u32;
            let sector = sector_start + in_block / 512;
            let in_sector = (in_block % 512) as usize;
            let chunk = ((n - total) as usize).min(512 - in_sector);

            let mut bp = vol
                .io()
                .bread(vol.device(), sector)
                .map_err(|_| FsError::Io)?;
            bp.data_mut()[in_sector..in_sector + chunk]
                .copy_from_slice(&src[total as usize..total as usize + chunk]);
            bp.write().map_err(|_| FsError::Io)?;

            total += chunk as u32;
            off += chunk as u32;
        }

        if n > 0 {
            if off > self.state.size {
                self.state.size = off;
            }
            self.update()?;
        }
        Ok(n as usize)
    }

    /// Discard all contents.
    pub fn truncate(&mut self) -> Result<(), FsError> {
        let vol = self.handle.vol.clone();
        let inum = self.handle.inum;
        itrunc_state(&vol, inum, &mut self.state)
    }

    fn read_dirent_header(&mut self, off: u32) -> Result<Option<(u32, u16, u8)>, FsError> {
        if off + 8 > self.state.size {
            return Ok(None);
        }
        let mut header = [0u8; 8];
        if self.read(off, &mut header)? != 8 {
            return Ok(None);
        }
        let inum = le32(&header, 0);
        let rec_len = le16(&header, 4);
        let name_len = header[6];
        if rec_len < 8
            || rec_len as usize > EXT2_BSIZE
            || off + rec_len as u32 > self.state.size
        {
            panic!("ext2: bad directory rec_len {}", rec_len);
        }
        Ok(Some((inum, rec_len, name_len)))
    }

    fn read_dirent_name(&mut self, off: u32, name_len: u8) -> Result<String, FsError> {
        let len = (name_len as usize).min(EXT2_NAME_LEN);
        let mut raw = [0u8; EXT2_NAME_LEN];
        if len > 0 && self.read(off + 8, &mut raw[..len])? != len {
            panic!("ext2: truncated directory entry name");
        }
        Ok(String::from_utf8_lossy(&raw[..len]).into_owned())
    }

    /// Find `name` in this directory; returns the entry's inode number and
    /// byte offset.
    pub fn dirlookup(&mut self, name: &str) -> Result<Option<(u32, u32)>, FsError> {
        let mut off = 0u32;
        while off + 8 <= self.state.size {
            let Some((inum, rec_len, name_len)) = self.read_dirent_header(off)? else {
                break;
            };
            if inum != 0 {
                let entry_name = self.read_dirent_name(off, name_len)?;
                if entry_name == name {
                    return Ok(Some((inum, off)));
                }
            }
            off += rec_len as u32;
        }
        Ok(None)
    }

    /// The `index`-th live entry of this directory.
    pub fn readdir_at(&mut self, index: usize) -> Result<Option<DirEntry>, FsError> {
        let mut off = 0u32;
        let mut count = 0usize;
        while off + 8 <= self.state.size {
            let Some((inum, rec_len, name_len)) = self.read_dirent_header(off)? else {
                break;
            };
            if inum != 0 {
                if count == index {
                    let name = self.read_dirent_name(off, name_len)?;
                    return Ok(Some(DirEntry {
                        name,
                        ino: inum as u64,
                    }));
                }
                count += 1;
            }
            off += rec_len as u32;
        }
        Ok(None)
    }

    /// Append a directory entry for `name` -> `inum`. The directory's size
    /// grows to cover the new record.
    pub fn dirlink(&mut self, name: &str, inum: u32) -> Result<(), FsError> {
        let name_len = name.len();
        if name_len == 0 || name_len > EXT2_NAME_LEN {
            return Err(FsError::NameTooLong);
        }
        if self.dirlookup(name)?.is_some() {
            return Err(FsError::AlreadyExists);
        }

        let rec_len = ((8 + name_len + 3) & !3) as u16;
        let mut entry = [0u8; 8 + EXT2_NAME_LEN + 3];
        put32(&mut entry, 0, inum);
        put16(&mut entry, 4, rec_len);
        entry[6] = name_len as u8;
        entry[7] = 0; // file_type: unknown
        entry[8..8 + name_len].copy_from_slice(name.as_bytes());

        let off = self.state.size;
        let written = self.write(off, &entry[..rec_len as usize])?;
        if written != rec_len as usize {
            return Err(FsError::Io);
        }
        Ok(())
    }

    /// Logically delete the entry at `off` by zeroing its inode field.
    pub fn dir_erase_at(&mut self, off: u32) -> Result<(), FsError> {
        let zero = [0u8; 4];
        if self.write(off, &zero)? != 4 {
            return Err(FsError::Io);
        }
        Ok(())
    }
}

impl core::fmt::Debug for InodeHandle {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "InodeHandle(dev={}, inum={})", self.vol.device(), self.inum)
    }
}
