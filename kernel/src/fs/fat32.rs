//! FAT32 filesystem.
//!
//! Cluster-chain based, sharing only the VFS contract with EXT2. FAT
//! entries are 28-bit (the top four bits are reserved and masked off);
//! a chain ends at any value >= 0x0FFF_FFF8. Long-file-name entries are
//! not supported: the directory iterator skips attribute 0x0F entries and
//! exposes 8.3 names only.

use alloc::string::String;
use alloc::sync::Arc;
use alloc::vec;

use spin::Mutex;

use crate::block::bio::BlockIo;
use crate::error::{FsError, KernelError, KernelResult};
use crate::fs::{DirEntry, NodeRef, NodeType, VfsNode};

/// End-of-chain sentinel (any masked value at or above this).
const FAT_EOC: u32 = 0x0FFF_FFF8;
const FAT_ENTRY_MASK: u32 = 0x0FFF_FFFF;

const ATTR_DIRECTORY: u8 = 0x10;
const ATTR_VOLUME_ID: u8 = 0x08;
const ATTR_LFN: u8 = 0x0F;

const DIRENT_SIZE: usize = 32;
const DELETED_MARK: u8 = 0xE5;

fn le16(buf: &[u8], off: usize) -> u16 {
    u16::from_le_bytes(buf[off..off + 2].try_into().unwrap())
}

fn le32(buf: &[u8], off: usize) -> u32 {
    u32::from_le_bytes(buf[off..off + 4].try_into().unwrap())
}

/// One mounted FAT32 filesystem.
pub struct Fat32Volume {
    io: Arc<BlockIo>,
    dev: u8,
    root_cluster: u32,
    sectors_per_cluster: u32,
    bytes_per_cluster: u32,
    fat_start_lba: u32,
    first_data_sector: u32,
    total_clusters: u32,
    /// Serializes cluster allocation and directory mutation.
    alloc_lock: Mutex<()>,
}

impl Fat32Volume {
    /// Mount from the BPB at `partition_lba`.
    pub fn mount(io: Arc<BlockIo>, dev: u8, partition_lba: u32) -> KernelResult<Arc<Fat32Volume>> {
        let bpb = io.bread(dev, partition_lba)?;
        let raw = bpb.data();

        let bytes_per_sector = le16(raw, 11) as u32;
        if bytes_per_sector != 512 {
            log::warn!("fat32: unsupported sector size {}", bytes_per_sector);
            return Err(KernelError::Fs(FsError::Io));
        }
        let sectors_per_cluster = raw[13] as u32;
        let reserved = le16(raw, 14) as u32;
        let num_fats = raw[16] as u32;
        let root_entry_count = le16(raw, 17) as u32;
        let mut fat_size = le32(raw, 36);
        if fat_size == 0 {
            fat_size = le16(raw, 22) as u32;
        }
        let mut total_sectors = le32(raw, 32);
        if total_sectors == 0 {
            total_sectors = le16(raw, 19) as u32;
        }
        let root_cluster = le32(raw, 44);
        drop(bpb);

        if sectors_per_cluster == 0 || fat_size == 0 {
            return Err(KernelError::Fs(FsError::Io));
        }

        let root_dir_sectors = (root_entry_count * 32).div_ceil(512);
        let data_start = reserved + num_fats * fat_size + root_dir_sectors;
        let vol = Fat32Volume {
            io,
            dev,
            root_cluster,
            sectors_per_cluster,
            bytes_per_cluster: sectors_per_cluster * 512,
            fat_start_lba: partition_lba + reserved,
            first_data_sector: partition_lba + data_start,
            total_clusters: (total_sectors.saturating_sub(data_start)) / sectors_per_cluster,
            alloc_lock: Mutex::new(()),
        };
        log::info!(
            "fat32: dev {} root cluster {} spc {} clusters {}",
            dev,
            vol.root_cluster,
            vol.sectors_per_cluster,
            vol.total_clusters
        );
        Ok(Arc::new(vol))
    }

    /// The root directory as a VFS node.
    pub fn root(self: &Arc<Self>) -> NodeRef {
        Arc::new(Fat32Node {
            vol: self.clone(),
            kind: NodeType::Directory,
            state: Mutex::new(NodeState {
                first_cluster: self.root_cluster,
                size: 0,
                dir_entry: None,
            }),
        })
    }

    fn cluster_to_lba(&self, cluster: u32) -> u32 {
        self.first_data_sector + (cluster - 2) * self.sectors_per_cluster
    }

    fn read_fat(&self, cluster: u32) -> Result<u32, FsError> {
        let off = cluster * 4;
        let sector = self.fat_start_lba + off / 512;
        let bp = self.io.bread(self.dev, sector).map_err(|_| FsError::Io)?;
        Ok(le32(bp.data(), (off % 512) as usize) & FAT_ENTRY_MASK)
    }

    fn write_fat(&self, cluster: u32, value: u32) -> Result<(), FsError> {
        let off = cluster * 4;
        let sector = self.fat_start_lba + off / 512;
        let mut bp = self.io.bread(self.dev, sector).map_err(|_| FsError::Io)?;
        let at = (off % 512) as usize;
        bp.data_mut()[at..at + 4].copy_from_slice(&value.to_le_bytes());
        bp.write().map_err(|_| FsError::Io)
    }

    fn find_free_cluster(&self) -> Result<u32, FsError> {
        for cluster in 2..self.total_clusters + 2 {
            if self.read_fat(cluster)? == 0 {
                return Ok(cluster);
            }
        }
        Err(FsError::NoSpace)
    }

    /// Allocate a cluster, chaining it after `tail` when given.
    fn alloc_cluster(&self, tail: Option<u32>) -> Result<u32, FsError> {
        let fresh = self.find_free_cluster()?;
        self.write_fat(fresh, FAT_EOC)?;
        if let Some(tail) = tail {
            self.write_fat(tail, fresh)?;
        }
        // Fresh clusters start zeroed.
        let lba = self.cluster_to_lba(fresh);
        for i in 0..self.sectors_per_cluster {
            let mut bp = self.io.bread(self.dev, lba + i).map_err(|_| FsError::Io)?;
            bp.data_mut().fill(0);
            bp.write().map_err(|_| FsError::Io)?;
        }
        Ok(fresh)
    }

    fn free_chain(&self, mut cluster: u32) -> Result<(), FsError> {
        while cluster >= 2 && cluster < FAT_EOC {
            let next = self.read_fat(cluster)?;
            self.write_fat(cluster, 0)?;
            cluster = next;
        }
        Ok(())
    }

    /// Cluster `n` steps into the chain starting at `start`, optionally
    /// growing the chain.
    fn walk_chain(&self, start: u32, steps: u32, grow: bool) -> Result<u32, FsError> {
        let mut cluster = start;
        for _ in 0..steps {
            let next = self.read_fat(cluster)?;
            cluster = if next >= FAT_EOC || next == 0 {
                if !grow {
                    return Err(FsError::Io);
                }
                self.alloc_cluster(Some(cluster))?
            } else {
                next
            };
        }
        Ok(cluster)
    }

    fn read_at_cluster(
        &self,
        cluster: u32,
        offset: u32,
        buf: &mut [u8],
    ) -> Result<(), FsError> {
        let lba = self.cluster_to_lba(cluster) + offset / 512;
        let in_sector = (offset % 512) as usize;
        debug_assert!(in_sector + buf.len() <= 512);
        let bp = self.io.bread(self.dev, lba).map_err(|_| FsError::Io)?;
        buf.copy_from_slice(&bp.data()[in_sector..in_sector + buf.len()]);
        Ok(())
    }

    fn write_at_cluster(&self, cluster: u32, offset: u32, buf: &[u8]) -> Result<(), FsError> {
        let lba = self.cluster_to_lba(cluster) + offset / 512;
        let in_sector = (offset % 512) as usize;
        debug_assert!(in_sector + buf.len() <= 512);
        let mut bp = self.io.bread(self.dev, lba).map_err(|_| FsError::Io)?;
        bp.data_mut()[in_sector..in_sector + buf.len()].copy_from_slice(buf);
        bp.write().map_err(|_| FsError::Io)
    }
}

/// Convert an on-disk 8.3 name ("FILE    TXT") to "file.txt" form,
/// preserving the stored case.
fn fat_name_to_string(raw: &[u8; 11]) -> String {
    let mut out = String::new();
    for &b in raw[..8].iter() {
        if b == b' ' {
            break;
        }
        out.push(b as char);
    }
    if raw[8] != b' ' {
        out.push('.');
        for &b in raw[8..].iter() {
            if b == b' ' {
                break;
            }
            out.push(b as char);
        }
    }
    out
}

/// Convert "name.ext" into the padded, upper-cased 11-byte form.
fn string_to_fat_name(name: &str) -> Option<[u8; 11]> {
    let mut out = [b' '; 11];
    let (stem, ext) = match name.rfind('.') {
        Some(pos) => (&name[..pos], &name[pos + 1..]),
        None => (name, ""),
    };
    if stem.is_empty() || stem.len() > 8 || ext.len() > 3 {
        return None;
    }
    for (i, c) in stem.chars().enumerate() {
        if c == '/' || c == '\\' {
            return None;
        }
        out[i] = c.to_ascii_uppercase() as u8;
    }
    for (i, c) in ext.chars().enumerate() {
        out[8 + i] = c.to_ascii_uppercase() as u8;
    }
    Some(out)
}

/// Case-folded comparison of a lookup name against an on-disk 8.3 name.
fn name_matches(wanted: &str, raw: &[u8; 11]) -> bool {
    match string_to_fat_name(wanted) {
        Some(converted) => converted == *raw,
        None => false,
    }
}

/// Location of a directory entry: (cluster, byte offset inside cluster).
#[derive(Debug, Clone, Copy)]
struct EntryLoc {
    cluster: u32,
    offset: u32,
}

struct NodeState {
    first_cluster: u32,
    size: u32,
    /// Where this node's directory entry lives (None for the root).
    dir_entry: Option<EntryLoc>,
}

/// A FAT32 file or directory exposed through the VFS.
pub struct Fat32Node {
    vol: Arc<Fat32Volume>,
    kind: NodeType,
    state: Mutex<NodeState>,
}

impl Fat32Node {
    /// Iterate raw directory entries, calling `f` with (loc, entry bytes).
    /// Stops when `f` returns Some or the directory ends.
    fn scan_dir<R>(
        &self,
        mut f: impl FnMut(EntryLoc, &[u8; DIRENT_SIZE]) -> Option<R>,
    ) -> Result<Option<R>, FsError> {
        let vol = &self.vol;
        let mut cluster = self.state.lock().first_cluster;
        let mut buf = vec![0u8; vol.bytes_per_cluster as usize];
        while cluster >= 2 && cluster < FAT_EOC {
            let lba = vol.cluster_to_lba(cluster);
            for s in 0..vol.sectors_per_cluster {
                let bp = vol.io.bread(vol.dev, lba + s).map_err(|_| FsError::Io)?;
                let at = s as usize * 512;
                buf[at..at + 512].copy_from_slice(bp.data());
            }
            for i in (0..vol.bytes_per_cluster as usize).step_by(DIRENT_SIZE) {
                let entry: &[u8; DIRENT_SIZE] = buf[i..i + DIRENT_SIZE].try_into().unwrap();
                if entry[0] == 0 {
                    return Ok(None); // end of directory
                }
                let loc = EntryLoc {
                    cluster,
                    offset: i as u32,
                };
                if let Some(r) = f(loc, entry) {
                    return Ok(Some(r));
                }
            }
            cluster = vol.read_fat(cluster)?;
        }
        Ok(None)
    }

    fn node_from_entry(&self, entry: &[u8; DIRENT_SIZE], loc: EntryLoc) -> NodeRef {
        let first_cluster = ((le16(entry, 20) as u32) << 16) | le16(entry, 26) as u32;
        let kind = if entry[11] & ATTR_DIRECTORY != 0 {
            NodeType::Directory
        } else {
            NodeType::File
        };
        Arc::new(Fat32Node {
            vol: self.vol.clone(),
            kind,
            state: Mutex::new(NodeState {
                first_cluster,
                size: le32(entry, 28),
                dir_entry: Some(loc),
            }),
        })
    }

    /// Rewrite this node's directory entry with the current cluster/size.
    fn sync_dir_entry(&self) -> Result<(), FsError> {
        let state = self.state.lock();
        let Some(loc) = state.dir_entry else {
            return Ok(()); // root directory has no entry
        };
        let vol = &self.vol;
        let mut entry = [0u8; DIRENT_SIZE];
        vol.read_at_cluster(loc.cluster, loc.offset, &mut entry)?;
        entry[20..22].copy_from_slice(&((state.first_cluster >> 16) as u16).to_le_bytes());
        entry[26..28].copy_from_slice(&(state.first_cluster as u16).to_le_bytes());
        entry[28..32].copy_from_slice(&state.size.to_le_bytes());
        vol.write_at_cluster(loc.cluster, loc.offset, &entry)
    }

    /// Append a fresh directory entry, extending the directory when full.
    fn add_entry(&self, raw_name: [u8; 11], attr: u8) -> Result<EntryLoc, FsError> {
        // Reuse a deleted slot or take the terminator slot.
        let found = self.scan_dir(|loc, entry| {
            if entry[0] == DELETED_MARK {
                Some(loc)
            } else {
                None
            }
        })?;

        let loc = match found {
            Some(loc) => loc,
            None => match self.find_terminator_slot()? {
                Some(loc) => loc,
                None => {
                    // Directory is full: grow the chain by one cluster.
                    let mut cluster = self.state.lock().first_cluster;
                    loop {
                        let next = self.vol.read_fat(cluster)?;
                        if next >= FAT_EOC || next == 0 {
                            break;
                        }
                        cluster = next;
                    }
                    let fresh = self.vol.alloc_cluster(Some(cluster))?;
                    EntryLoc {
                        cluster: fresh,
                        offset: 0,
                    }
                }
            },
        };

        let mut entry = [0u8; DIRENT_SIZE];
        entry[..11].copy_from_slice(&raw_name);
        entry[11] = attr;
        self.vol.write_at_cluster(loc.cluster, loc.offset, &entry)?;
        Ok(loc)
    }

    /// First all-zero (terminator) slot in the directory, if any.
    fn find_terminator_slot(&self) -> Result<Option<EntryLoc>, FsError> {
        let vol = &self.vol;
        let mut cluster = self.state.lock().first_cluster;
        while cluster >= 2 && cluster < FAT_EOC {
            let lba = vol.cluster_to_lba(cluster);
            for s in 0..vol.sectors_per_cluster {
                let bp = vol.io.bread(vol.dev, lba + s).map_err(|_| FsError::Io)?;
                for i in (0..512).step_by(DIRENT_SIZE) {
                    if bp.data()[i] == 0 {
                        return Ok(Some(EntryLoc {
                            cluster,
                            offset: s * 512 + i as u32,
                        }));
                    }
                }
            }
            cluster = vol.read_fat(cluster)?;
        }
        Ok(None)
    }
}

impl VfsNode for Fat32Node {
    fn kind(&self) -> NodeType {
        self.kind
    }

    fn size(&self) -> u64 {
        self.state.lock().size as u64
    }

    fn device_id(&self) -> Option<u8> {
        Some(self.vol.dev)
    }

    fn read(&self, offset: u64, buf: &mut [u8]) -> Result<usize, FsError> {
        if self.kind == NodeType::Directory {
            return Err(FsError::IsADirectory);
        }
        let (first_cluster, size) = {
            let state = self.state.lock();
            (state.first_cluster, state.size)
        };
        if offset >= size as u64 || first_cluster < 2 {
            return Ok(0);
        }
        let mut off = offset as u32;
        let n = (buf.len() as u32).min(size - off);

        let vol = &self.vol;
        let mut total = 0u32;
        while total < n {
            let cluster = vol.walk_chain(first_cluster, off / vol.bytes_per_cluster, false)?;
            let in_cluster = off % vol.bytes_per_cluster;
            let chunk = (n - total)
                .min(512 - (in_cluster % 512))
                .min(vol.bytes_per_cluster - in_cluster);
            vol.read_at_cluster(
                cluster,
                in_cluster,
                &mut buf[total as usize..(total + chunk) as usize],
            )?;
            total += chunk;
            off += chunk;
        }
        Ok(n as usize)
    }

    fn write(&self, offset: u64, buf: &[u8]) -> Result<usize, FsError> {
        if self.kind == NodeType::Directory {
            return Err(FsError::IsADirectory);
        }
        let _guard = self.vol.alloc_lock.lock();
        if offset > self.state.lock().size as u64 {
            return Err(FsError::FileTooLarge);
        }
        let vol = &self.vol;

        // Make sure the file has a first cluster.
        {
            let mut state = self.state.lock();
            if state.first_cluster < 2 {
                state.first_cluster = vol.alloc_cluster(None)?;
            }
        }
        let first_cluster = self.state.lock().first_cluster;

        let mut off = offset as u32;
        let n = buf.len() as u32;
        let mut total = 0u32;
        while total < n {
            let cluster = vol.walk_chain(first_cluster, off / vol.bytes_per_cluster, true)?;
            let in_cluster = off % vol.bytes_per_cluster;
            let chunk = (n - total)
                .min(512 - (in_cluster % 512))
                .min(vol.bytes_per_cluster - in_cluster);
            vol.write_at_cluster(
                cluster,
                in_cluster,
                &buf[total as usize..(total + chunk) as usize],
            )?;
            total += chunk;
            off += chunk;
        }

        {
            let mut state = self.state.lock();
            if off > state.size {
                state.size = off;
            }
        }
        self.sync_dir_entry()?;
        Ok(n as usize)
    }

    fn truncate(&self) -> Result<(), FsError> {
        if self.kind == NodeType::Directory {
            return Err(FsError::IsADirectory);
        }
        let _guard = self.vol.alloc_lock.lock();
        let first = {
            let mut state = self.state.lock();
            let first = state.first_cluster;
            state.first_cluster = 0;
            state.size = 0;
            first
        };
        if first >= 2 {
            self.vol.free_chain(first)?;
        }
        self.sync_dir_entry()
    }

    fn readdir(&self, index: usize) -> Result<Option<DirEntry>, FsError> {
        if self.kind != NodeType::Directory {
            return Err(FsError::NotADirectory);
        }
        let mut count = 0usize;
        self.scan_dir(|_, entry| {
            if entry[0] == DELETED_MARK
                || entry[11] & ATTR_LFN == ATTR_LFN
                || entry[11] & ATTR_VOLUME_ID != 0
            {
                return None;
            }
            if count == index {
                let raw: &[u8; 11] = entry[..11].try_into().unwrap();
                return Some(DirEntry {
                    name: fat_name_to_string(raw),
                    ino: ((le16(entry, 20) as u64) << 16) | le16(entry, 26) as u64,
                });
            }
            count += 1;
            None
        })
    }

    fn finddir(&self, name: &str) -> Result<NodeRef, FsError> {
        if self.kind != NodeType::Directory {
            return Err(FsError::NotADirectory);
        }
        let found = self.scan_dir(|loc, entry| {
            if entry[0] == DELETED_MARK
                || entry[11] & ATTR_LFN == ATTR_LFN
                || entry[11] & ATTR_VOLUME_ID != 0
            {
                return None;
            }
            let raw: &[u8; 11] = entry[..11].try_into().unwrap();
            if name_matches(name, raw) {
                Some((*entry, loc))
            } else {
                None
            }
        })?;
        match found {
            Some((entry, loc)) => Ok(self.node_from_entry(&entry, loc)),
            None => Err(FsError::NotFound),
        }
    }

    fn mknod(&self, name: &str, kind: NodeType, _dev: u32) -> Result<(), FsError> {
        if self.kind != NodeType::Directory {
            return Err(FsError::NotADirectory);
        }
        let raw = string_to_fat_name(name).ok_or(FsError::NameTooLong)?;
        let _guard = self.vol.alloc_lock.lock();
        if self.finddir(name).is_ok() {
            return Err(FsError::AlreadyExists);
        }
        let attr = if kind == NodeType::Directory {
            ATTR_DIRECTORY
        } else {
            0
        };
        let loc = self.add_entry(raw, attr)?;
        if kind == NodeType::Directory {
            // Directories need a cluster up front for their entries.
            let cluster = self.vol.alloc_cluster(None)?;
            let mut entry = [0u8; DIRENT_SIZE];
            self.vol.read_at_cluster(loc.cluster, loc.offset, &mut entry)?;
            entry[20..22].copy_from_slice(&((cluster >> 16) as u16).to_le_bytes());
            entry[26..28].copy_from_slice(&(cluster as u16).to_le_bytes());
            self.vol.write_at_cluster(loc.cluster, loc.offset, &entry)?;
        }
        Ok(())
    }

    fn unlink(&self, name: &str) -> Result<(), FsError> {
        if self.kind != NodeType::Directory {
            return Err(FsError::NotADirectory);
        }
        let _guard = self.vol.alloc_lock.lock();
        let found = self.scan_dir(|loc, entry| {
            if entry[0] == DELETED_MARK || entry[11] & ATTR_LFN == ATTR_LFN {
                return None;
            }
            let raw: &[u8; 11] = entry[..11].try_into().unwrap();
            if name_matches(name, raw) {
                Some((*entry, loc))
            } else {
                None
            }
        })?;
        let Some((entry, loc)) = found else {
            return Err(FsError::NotFound);
        };
        if entry[11] & ATTR_DIRECTORY != 0 {
            return Err(FsError::IsADirectory);
        }

        let first_cluster = ((le16(&entry, 20) as u32) << 16) | le16(&entry, 26) as u32;
        let mut patched = entry;
        patched[0] = DELETED_MARK;
        self.vol.write_at_cluster(loc.cluster, loc.offset, &patched)?;
        if first_cluster >= 2 {
            self.vol.free_chain(first_cluster)?;
        }
        Ok(())
    }
}
