//! Open files and the per-process descriptor table.
//!
//! An [`OpenFile`] is one logical open of a node and owns the file offset.
//! `dup` installs the same `Arc` in a second slot (shared offset); `fork`
//! copies the table into fresh `OpenFile`s (independent offsets, another
//! logical open of each node).

use alloc::sync::Arc;

use spin::Mutex;

use crate::error::{KernelError, KernelResult};

use super::{NodeRef, NodeType};

/// Per-process file descriptor capacity.
pub const MAX_FDS: usize = 16;

/// Open flags, matching the user ABI.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OpenFlags(pub u32);

impl OpenFlags {
    pub const RDONLY: u32 = 0x000;
    pub const WRONLY: u32 = 0x001;
    pub const RDWR: u32 = 0x002;
    pub const CREATE: u32 = 0x200;
    pub const TRUNC: u32 = 0x400;
    pub const APPEND: u32 = 0x800;

    pub const fn new(bits: u32) -> Self {
        Self(bits)
    }

    pub fn readable(&self) -> bool {
        self.0 & (Self::WRONLY | Self::RDWR) != Self::WRONLY
    }

    pub fn writable(&self) -> bool {
        let mode = self.0 & (Self::WRONLY | Self::RDWR);
        mode == Self::WRONLY || mode & Self::RDWR != 0
    }

    pub fn create(&self) -> bool {
        self.0 & Self::CREATE != 0
    }

    pub fn truncate(&self) -> bool {
        self.0 & Self::TRUNC != 0
    }

    pub fn append(&self) -> bool {
        self.0 & Self::APPEND != 0
    }
}

/// One logical open of a node.
pub struct OpenFile {
    pub node: NodeRef,
    pub offset: u64,
    pub flags: OpenFlags,
}

impl OpenFile {
    /// Wrap `node`, counting a logical open on it.
    pub fn open(node: NodeRef, flags: OpenFlags) -> Self {
        node.open();
        Self {
            node,
            offset: 0,
            flags,
        }
    }
}

/// Shared open-file handle; `dup` clones this.
pub type FileRef = Arc<Mutex<OpenFile>>;

/// Fixed-capacity descriptor table.
pub struct FdTable {
    slots: [Option<FileRef>; MAX_FDS],
}

impl FdTable {
    pub const fn new() -> Self {
        const EMPTY: Option<FileRef> = None;
        Self {
            slots: [EMPTY; MAX_FDS],
        }
    }

    pub fn get(&self, fd: usize) -> KernelResult<FileRef> {
        self.slots
            .get(fd)
            .and_then(Clone::clone)
            .ok_or(KernelError::InvalidFd)
    }

    pub fn slot_is_free(&self, fd: usize) -> bool {
        fd < MAX_FDS && self.slots[fd].is_none()
    }

    /// Install `file` in the lowest free slot at or above `min`.
    pub fn install_lowest(&mut self, file: FileRef, min: usize) -> KernelResult<usize> {
        for fd in min..MAX_FDS {
            if self.slots[fd].is_none() {
                self.slots[fd] = Some(file);
                return Ok(fd);
            }
        }
        Err(KernelError::InvalidFd)
    }

    /// Install `file` at a specific slot (stdio wiring).
    pub fn install_at(&mut self, fd: usize, file: FileRef) -> KernelResult<()> {
        if fd >= MAX_FDS {
            return Err(KernelError::InvalidFd);
        }
        self.slots[fd] = Some(file);
        Ok(())
    }

    /// `dup`: share the descriptor (common offset) at the lowest free fd.
    pub fn dup(&mut self, fd: usize) -> KernelResult<usize> {
        let file = self.get(fd)?;
        self.install_lowest(file, 0)
    }

    /// Close a descriptor. The node's close hook runs when the last slot
    /// sharing this open drops it.
    pub fn close(&mut self, fd: usize) -> KernelResult<()> {
        let file = self
            .slots
            .get_mut(fd)
            .and_then(Option::take)
            .ok_or(KernelError::InvalidFd)?;
        if Arc::strong_count(&file) == 1 {
            file.lock().node.close();
        }
        Ok(())
    }

    /// Drop every descriptor, running close hooks (process teardown).
    pub fn close_all(&mut self) {
        for fd in 0..MAX_FDS {
            let _ = self.close(fd);
        }
    }

    /// Copy for `fork`: fresh `OpenFile` per slot with the same offset and
    /// flags, each counting a new logical open of its node.
    pub fn clone_for_fork(&self) -> FdTable {
        let mut table = FdTable::new();
        for (fd, slot) in self.slots.iter().enumerate() {
            if let Some(file) = slot {
                let file = file.lock();
                file.node.open();
                table.slots[fd] = Some(Arc::new(Mutex::new(OpenFile {
                    node: file.node.clone(),
                    offset: file.offset,
                    flags: file.flags,
                })));
            }
        }
        table
    }

    /// Whether `fd` refers to a pipe end (pipes reject lseek).
    pub fn is_pipe(&self, fd: usize) -> bool {
        self.slots
            .get(fd)
            .and_then(Option::as_ref)
            .map(|f| f.lock().node.kind() == NodeType::Pipe)
            .unwrap_or(false)
    }
}

impl Default for FdTable {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::FsError;
    use crate::fs::VfsNode;
    use core::sync::atomic::{AtomicU32, Ordering};

    /// Node that counts open/close calls.
    struct Counted {
        opens: AtomicU32,
        closes: AtomicU32,
    }

    impl Counted {
        fn new() -> Arc<Counted> {
            Arc::new(Counted {
                opens: AtomicU32::new(0),
                closes: AtomicU32::new(0),
            })
        }
    }

    impl VfsNode for Counted {
        fn kind(&self) -> NodeType {
            NodeType::File
        }

        fn open(&self) {
            self.opens.fetch_add(1, Ordering::SeqCst);
        }

        fn close(&self) {
            self.closes.fetch_add(1, Ordering::SeqCst);
        }

        fn read(&self, _offset: u64, _buf: &mut [u8]) -> Result<usize, FsError> {
            Ok(0)
        }
    }

    fn open_file(node: NodeRef) -> FileRef {
        Arc::new(Mutex::new(OpenFile::open(node, OpenFlags::new(0))))
    }

    #[test]
    fn install_uses_lowest_free_slot() {
        let node = Counted::new();
        let mut t = FdTable::new();
        assert_eq!(t.install_lowest(open_file(node.clone()), 3).unwrap(), 3);
        assert_eq!(t.install_lowest(open_file(node.clone()), 3).unwrap(), 4);
        t.close(3).unwrap();
        assert_eq!(t.install_lowest(open_file(node), 3).unwrap(), 3);
    }

    #[test]
    fn dup_shares_the_offset() {
        let node = Counted::new();
        let mut t = FdTable::new();
        let fd = t.install_lowest(open_file(node), 3).unwrap();
        let dup_fd = t.dup(fd).unwrap();
        assert_eq!(dup_fd, 0, "dup takes the lowest free fd");

        t.get(fd).unwrap().lock().offset = 42;
        assert_eq!(t.get(dup_fd).unwrap().lock().offset, 42);
    }

    #[test]
    fn close_runs_hook_only_on_last_reference() {
        let node = Counted::new();
        let mut t = FdTable::new();
        let fd = t.install_lowest(open_file(node.clone()), 3).unwrap();
        let dup_fd = t.dup(fd).unwrap();

        t.close(fd).unwrap();
        assert_eq!(node.closes.load(Ordering::SeqCst), 0);
        t.close(dup_fd).unwrap();
        assert_eq!(node.closes.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn double_close_fails() {
        let node = Counted::new();
        let mut t = FdTable::new();
        let fd = t.install_lowest(open_file(node), 3).unwrap();
        assert!(t.close(fd).is_ok());
        assert_eq!(t.close(fd), Err(KernelError::InvalidFd));
        assert_eq!(t.close(MAX_FDS), Err(KernelError::InvalidFd));
    }

    #[test]
    fn fork_copy_counts_new_opens_with_independent_offsets() {
        let node = Counted::new();
        let mut t = FdTable::new();
        let fd = t.install_lowest(open_file(node.clone()), 3).unwrap();
        t.get(fd).unwrap().lock().offset = 7;

        let mut child = t.clone_for_fork();
        assert_eq!(node.opens.load(Ordering::SeqCst), 2);
        assert_eq!(child.get(fd).unwrap().lock().offset, 7);

        // Offsets diverge after the copy.
        child.get(fd).unwrap().lock().offset = 99;
        assert_eq!(t.get(fd).unwrap().lock().offset, 7);

        // Each copy closes its own logical open.
        child.close(fd).unwrap();
        t.close(fd).unwrap();
        assert_eq!(node.closes.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn table_exhaustion_is_reported() {
        let node = Counted::new();
        let mut t = FdTable::new();
        for _ in 0..MAX_FDS {
            t.install_lowest(open_file(node.clone()), 0).unwrap();
        }
        assert!(t.install_lowest(open_file(node), 0).is_err());
    }
}
