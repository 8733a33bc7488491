//! Virtual filesystem layer.
//!
//! Every filesystem and device driver exposes nodes implementing
//! [`VfsNode`]; directories hand out further nodes from `finddir`. The
//! [`Namespace`] stitches mounted filesystems together and resolves paths.

pub mod devfs;
pub mod ext2;
pub mod fat32;
pub mod file;
pub mod path;
pub mod pipe;

use alloc::collections::BTreeMap;
use alloc::string::{String, ToString};
use alloc::sync::Arc;

use spin::{Once, RwLock};

use crate::error::FsError;

pub use file::{FdTable, FileRef, OpenFile, OpenFlags, MAX_FDS};

/// Maximum path length accepted from user space.
pub const PATH_MAX: usize = 256;

/// Maximum file name length.
pub const NAME_MAX: usize = 255;

/// Filesystem node types
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeType {
    File,
    Directory,
    CharDevice,
    BlockDevice,
    Pipe,
    Symlink,
    MountPoint,
}

impl NodeType {
    /// Numeric tag used by the stat ABI and mknod argument.
    pub fn as_raw(&self) -> u32 {
        match self {
            NodeType::File => 1,
            NodeType::Directory => 2,
            NodeType::CharDevice => 3,
            NodeType::BlockDevice => 4,
            NodeType::Pipe => 5,
            NodeType::Symlink => 6,
            NodeType::MountPoint => 8,
        }
    }

    pub fn from_raw(raw: u32) -> Option<NodeType> {
        Some(match raw {
            1 => NodeType::File,
            2 => NodeType::Directory,
            3 => NodeType::CharDevice,
            4 => NodeType::BlockDevice,
            5 => NodeType::Pipe,
            6 => NodeType::Symlink,
            8 => NodeType::MountPoint,
            _ => return None,
        })
    }
}

/// One directory entry as returned by `readdir`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirEntry {
    pub name: String,
    pub ino: u64,
}

/// Metadata snapshot for `stat`/`fstat`.
#[derive(Debug, Clone, Copy, Default)]
pub struct Stat {
    pub ino: u64,
    pub kind_raw: u32,
    pub size: u64,
    pub nlink: u32,
    pub atime: u32,
    pub ctime: u32,
    pub mtime: u32,
    pub dtime: u32,
}

/// Typed result of an ioctl; the syscall layer copies it out.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IoctlValue {
    U32(u32),
    U64(u64),
    WinSize {
        rows: u16,
        cols: u16,
        xpixel: u16,
        ypixel: u16,
    },
}

/// Physical target for device mmap (`/dev/fb0`).
#[derive(Debug, Clone, Copy)]
pub struct MmapTarget {
    pub phys_base: u64,
    pub len: u64,
}

/// Shared handle to a filesystem node.
pub type NodeRef = Arc<dyn VfsNode>;

/// The node interface every filesystem and device implements. Defaults
/// reject operations the node type does not support.
pub trait VfsNode: Send + Sync {
    fn kind(&self) -> NodeType;

    fn ino(&self) -> u64 {
        0
    }

    fn size(&self) -> u64 {
        0
    }

    /// Backing storage device, when the node lives on one. Used to check
    /// that hard links stay on a single filesystem.
    fn device_id(&self) -> Option<u8> {
        None
    }

    /// A logical open of this node (descriptor installed).
    fn open(&self) {}

    /// A logical close (last descriptor referencing one open dropped).
    fn close(&self) {}

    fn read(&self, _offset: u64, _buf: &mut [u8]) -> Result<usize, FsError> {
        Err(FsError::NotSupported)
    }

    fn write(&self, _offset: u64, _buf: &[u8]) -> Result<usize, FsError> {
        Err(FsError::NotSupported)
    }

    fn truncate(&self) -> Result<(), FsError> {
        Err(FsError::NotSupported)
    }

    fn ioctl(&self, _request: u32) -> Result<IoctlValue, FsError> {
        Err(FsError::BadIoctl)
    }

    /// Entry at `index`, or Ok(None) past the end.
    fn readdir(&self, _index: usize) -> Result<Option<DirEntry>, FsError> {
        Err(FsError::NotADirectory)
    }

    fn finddir(&self, _name: &str) -> Result<NodeRef, FsError> {
        Err(FsError::NotADirectory)
    }

    fn mknod(&self, _name: &str, _kind: NodeType, _dev: u32) -> Result<(), FsError> {
        Err(FsError::NotSupported)
    }

    fn link(&self, _name: &str, _target: &NodeRef) -> Result<(), FsError> {
        Err(FsError::NotSupported)
    }

    fn unlink(&self, _name: &str) -> Result<(), FsError> {
        Err(FsError::NotSupported)
    }

    fn stat(&self) -> Stat {
        Stat {
            ino: self.ino(),
            kind_raw: self.kind().as_raw(),
            size: self.size(),
            nlink: 1,
            ..Stat::default()
        }
    }

    fn mmap_target(&self) -> Option<MmapTarget> {
        None
    }
}

/// A mount namespace: the root filesystem plus first-level grafts.
pub struct Namespace {
    root: RwLock<Option<NodeRef>>,
    mounts: RwLock<BTreeMap<String, NodeRef>>,
}

impl Namespace {
    pub const fn new() -> Self {
        Self {
            root: RwLock::new(None),
            mounts: RwLock::new(BTreeMap::new()),
        }
    }

    /// Install the root filesystem's root directory.
    pub fn mount_root(&self, node: NodeRef) {
        *self.root.write() = Some(node);
    }

    /// Graft `node` at `/<name>` (shadowing any same-named entry of the
    /// root filesystem).
    pub fn register_mount(&self, name: &str, node: NodeRef) {
        self.mounts.write().insert(name.to_string(), node);
    }

    pub fn root(&self) -> Result<NodeRef, FsError> {
        self.root.read().clone().ok_or(FsError::NotFound)
    }

    /// Resolve an absolute path to a node. `..` and `.` are expected to be
    /// gone already (paths come through [`path::absolute`]).
    pub fn resolve(&self, p: &str) -> Result<NodeRef, FsError> {
        let mut current = self.root()?;
        for (depth, component) in p.split('/').filter(|c| !c.is_empty() && *c != ".").enumerate() {
            if depth == 0 {
                if let Some(mounted) = self.mounts.read().get(component) {
                    current = mounted.clone();
                    continue;
                }
            }
            current = current.finddir(component)?;
        }
        Ok(current)
    }

    /// Resolve `p` relative to `cwd` when it is not absolute.
    pub fn resolve_at(&self, cwd: &str, p: &str) -> Result<NodeRef, FsError> {
        self.resolve(&path::absolute(cwd, p))
    }

    /// Resolve the parent directory of `p`, returning it plus the final
    /// name component.
    pub fn resolve_parent(&self, p: &str) -> Result<(NodeRef, String), FsError> {
        let (parent, name) = path::split_parent(p).ok_or(FsError::NotFound)?;
        if name.is_empty() {
            return Err(FsError::NotFound);
        }
        Ok((self.resolve(parent)?, name.to_string()))
    }

    /// Create a node at absolute path `p`.
    pub fn mknod(&self, p: &str, kind: NodeType, dev: u32) -> Result<(), FsError> {
        let (parent, name) = self.resolve_parent(p)?;
        parent.mknod(&name, kind, dev)
    }

    /// Hard-link `new_path` to the node at `old_path`.
    pub fn link(&self, old_path: &str, new_path: &str) -> Result<(), FsError> {
        let target = self.resolve(old_path)?;
        let (parent, name) = self.resolve_parent(new_path)?;
        parent.link(&name, &target)
    }

    /// Remove the entry at absolute path `p`. Unlinking "/" is refused.
    pub fn unlink(&self, p: &str) -> Result<(), FsError> {
        if p == "/" {
            return Err(FsError::NotSupported);
        }
        let (parent, name) = self.resolve_parent(p)?;
        parent.unlink(&name)
    }
}

impl Default for Namespace {
    fn default() -> Self {
        Self::new()
    }
}

static NS: Once<Namespace> = Once::new();

/// The kernel's global namespace.
pub fn ns() -> &'static Namespace {
    NS.call_once(Namespace::new)
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::vec::Vec;
    use spin::Mutex;

    /// In-memory directory node used to exercise resolution.
    struct TestDir {
        entries: Mutex<Vec<(String, NodeRef)>>,
    }

    impl TestDir {
        fn new() -> Arc<TestDir> {
            Arc::new(TestDir {
                entries: Mutex::new(Vec::new()),
            })
        }

        fn add(self: &Arc<Self>, name: &str, node: NodeRef) {
            self.entries.lock().push((name.to_string(), node));
        }
    }

    impl VfsNode for TestDir {
        fn kind(&self) -> NodeType {
            NodeType::Directory
        }

        fn finddir(&self, name: &str) -> Result<NodeRef, FsError> {
            self.entries
                .lock()
                .iter()
                .find(|(n, _)| n == name)
                .map(|(_, node)| node.clone())
                .ok_or(FsError::NotFound)
        }

        fn readdir(&self, index: usize) -> Result<Option<DirEntry>, FsError> {
            Ok(self.entries.lock().get(index).map(|(n, _)| DirEntry {
                name: n.clone(),
                ino: 0,
            }))
        }
    }

    struct TestFile;

    impl VfsNode for TestFile {
        fn kind(&self) -> NodeType {
            NodeType::File
        }

        fn size(&self) -> u64 {
            11
        }
    }

    fn sample_ns() -> Namespace {
        let ns = Namespace::new();
        let root = TestDir::new();
        let sub = TestDir::new();
        sub.add("note.txt", Arc::new(TestFile));
        root.add("docs", sub.clone());
        ns.mount_root(root);

        let extra = TestDir::new();
        extra.add("iso.txt", Arc::new(TestFile));
        ns.register_mount("disk1", extra);
        ns
    }

    #[test]
    fn resolves_nested_paths() {
        let ns = sample_ns();
        let node = ns.resolve("/docs/note.txt").unwrap();
        assert_eq!(node.kind(), NodeType::File);
        assert_eq!(node.size(), 11);
        assert!(ns.resolve("/docs/missing").is_err());
    }

    #[test]
    fn root_resolves_to_root() {
        let ns = sample_ns();
        assert_eq!(ns.resolve("/").unwrap().kind(), NodeType::Directory);
        assert_eq!(ns.resolve("").unwrap().kind(), NodeType::Directory);
    }

    #[test]
    fn mounts_shadow_the_root_fs() {
        let ns = sample_ns();
        let node = ns.resolve("/disk1/iso.txt").unwrap();
        assert_eq!(node.kind(), NodeType::File);
    }

    #[test]
    fn relative_resolution_uses_cwd() {
        let ns = sample_ns();
        let node = ns.resolve_at("/docs", "note.txt").unwrap();
        assert_eq!(node.kind(), NodeType::File);
    }

    #[test]
    fn unlink_of_root_is_refused() {
        let ns = sample_ns();
        assert_eq!(ns.unlink("/"), Err(FsError::NotSupported));
    }

    #[test]
    fn parent_resolution_splits_final_component() {
        let ns = sample_ns();
        let (parent, name) = ns.resolve_parent("/docs/note.txt").unwrap();
        assert_eq!(parent.kind(), NodeType::Directory);
        assert_eq!(name, "note.txt");
    }

    #[test]
    fn stat_defaults_reflect_node() {
        let st = TestFile.stat();
        assert_eq!(st.kind_raw, NodeType::File.as_raw());
        assert_eq!(st.size, 11);
    }
}
