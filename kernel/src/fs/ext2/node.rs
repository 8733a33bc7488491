//! VFS adapter for EXT2 inodes.

use alloc::sync::Arc;

use crate::error::{FsError, KernelError, KernelResult};
use crate::fs::{DirEntry, NodeRef, NodeType, Stat, VfsNode};

use super::inode::{iget, InodeHandle};
use super::{KIND_BLOCKDEV, KIND_CHARDEV, KIND_DIR, KIND_FILE};

/// One EXT2 inode exposed through the VFS.
pub struct Ext2Node {
    handle: InodeHandle,
    kind: NodeType,
}

fn node_type(kind: u16) -> NodeType {
    match kind {
        KIND_DIR => NodeType::Directory,
        KIND_CHARDEV => NodeType::CharDevice,
        KIND_BLOCKDEV => NodeType::BlockDevice,
        _ => NodeType::File,
    }
}

fn vfs_kind_to_ext2(kind: NodeType) -> u16 {
    match kind {
        NodeType::Directory => KIND_DIR,
        NodeType::CharDevice => KIND_CHARDEV,
        NodeType::BlockDevice => KIND_BLOCKDEV,
        _ => KIND_FILE,
    }
}

impl Ext2Node {
    /// Wrap a handle, loading the inode once to learn its type.
    pub(super) fn from_handle(handle: InodeHandle) -> KernelResult<NodeRef> {
        let kind = {
            let guard = handle.lock().map_err(KernelError::Fs)?;
            node_type(guard.kind())
        };
        Ok(Arc::new(Ext2Node { handle, kind }))
    }
}

impl VfsNode for Ext2Node {
    fn kind(&self) -> NodeType {
        self.kind
    }

    fn ino(&self) -> u64 {
        self.handle.inum() as u64
    }

    fn size(&self) -> u64 {
        self.handle.lock().map(|g| g.size() as u64).unwrap_or(0)
    }

    fn device_id(&self) -> Option<u8> {
        Some(self.handle.volume().device())
    }

    fn read(&self, offset: u64, buf: &mut [u8]) -> Result<usize, FsError> {
        if offset > u32::MAX as u64 {
            return Ok(0);
        }
        let mut guard = self.handle.lock()?;
        guard.read(offset as u32, buf)
    }

    fn write(&self, offset: u64, buf: &[u8]) -> Result<usize, FsError> {
        if offset > u32::MAX as u64 {
            return Err(FsError::FileTooLarge);
        }
        let mut guard = self.handle.lock()?;
        guard.write(offset as u32, buf)
    }

    fn truncate(&self) -> Result<(), FsError> {
        let mut guard = self.handle.lock()?;
        guard.truncate()
    }

    fn readdir(&self, index: usize) -> Result<Option<DirEntry>, FsError> {
        if self.kind != NodeType::Directory {
            return Err(FsError::NotADirectory);
        }
        let mut guard = self.handle.lock()?;
        guard.readdir_at(index)
    }

    fn finddir(&self, name: &str) -> Result<NodeRef, FsError> {
        if self.kind != NodeType::Directory {
            return Err(FsError::NotADirectory);
        }
        let inum = {
            let mut guard = self.handle.lock()?;
            match guard.dirlookup(name)? {
                Some((inum, _)) => inum,
                None => return Err(FsError::NotFound),
            }
        };
        let handle = iget(self.handle.volume(), inum).map_err(|_| FsError::Io)?;
        Ext2Node::from_handle(handle).map_err(|_| FsError::Io)
    }

    fn mknod(&self, name: &str, kind: NodeType, dev: u32) -> Result<(), FsError> {
        if self.kind != NodeType::Directory {
            return Err(FsError::NotADirectory);
        }
        let vol = self.handle.volume().clone();
        let mut parent = self.handle.lock()?;
        if parent.dirlookup(name)?.is_some() {
            return Err(FsError::AlreadyExists);
        }

        let inum = vol.ialloc(vfs_kind_to_ext2(kind))?;
        let child = iget(&vol, inum).map_err(|_| FsError::Io)?;
        {
            let mut guard = child.lock()?;
            guard.set_nlink(1);
            guard.set_device(((dev >> 8) & 0xFF) as u16, (dev & 0xFF) as u16);
            guard.update()?;
        }
        parent.dirlink(name, inum)
    }

    fn link(&self, name: &str, target: &NodeRef) -> Result<(), FsError> {
        if self.kind != NodeType::Directory {
            return Err(FsError::NotADirectory);
        }
        // Hard links must stay on this filesystem.
        if target.device_id() != Some(self.handle.volume().device()) {
            return Err(FsError::NotSupported);
        }
        let inum = target.ino() as u32;
        {
            let mut parent = self.handle.lock()?;
            parent.dirlink(name, inum)?;
        }
        let child = iget(self.handle.volume(), inum).map_err(|_| FsError::Io)?;
        let mut guard = child.lock()?;
        let nlink = guard.nlink();
        guard.set_nlink(nlink + 1);
        guard.update()
    }

    fn unlink(&self, name: &str) -> Result<(), FsError> {
        if self.kind != NodeType::Directory {
            return Err(FsError::NotADirectory);
        }
        let (inum, off) = {
            let mut parent = self.handle.lock()?;
            let Some(found) = parent.dirlookup(name)? else {
                return Err(FsError::NotFound);
            };
            found
        };

        let child = iget(self.handle.volume(), inum).map_err(|_| FsError::Io)?;
        {
            let guard = child.lock()?;
            // Directories cannot be unlinked.
            if guard.kind() == KIND_DIR {
                return Err(FsError::IsADirectory);
            }
        }

        {
            let mut parent = self.handle.lock()?;
            parent.dir_erase_at(off)?;
        }

        let mut guard = child.lock()?;
        let nlink = guard.nlink();
        if nlink > 0 {
            guard.set_nlink(nlink - 1);
        }
        guard.update()
        // `child` drops here; with nlink now zero and no other holders its
        // blocks and inode bit go back to the filesystem.
    }

    fn stat(&self) -> Stat {
        match self.handle.lock() {
            Ok(guard) => {
                let (atime, ctime, mtime, dtime) = guard.times();
                Stat {
                    ino: self.handle.inum() as u64,
                    kind_raw: self.kind.as_raw(),
                    size: guard.size() as u64,
                    nlink: guard.nlink() as u32,
                    atime,
                    ctime,
                    mtime,
                    dtime,
                }
            }
            Err(_) => Stat::default(),
        }
    }
}
