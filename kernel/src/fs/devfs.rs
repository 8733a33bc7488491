//! Device filesystem.
//!
//! A synthetic directory. Drivers register nodes under short names; lookup
//! hands the registered node back. Entries are kept sorted so directory
//! listings are stable.

use alloc::string::{String, ToString};
use alloc::sync::Arc;
use alloc::vec::Vec;

use spin::{Once, RwLock};

use crate::error::FsError;

use super::{DirEntry, NodeRef, NodeType, VfsNode};

/// The `/dev` directory node.
pub struct DevFs {
    entries: RwLock<Vec<(String, NodeRef)>>,
}

impl DevFs {
    pub fn new() -> Arc<DevFs> {
        Arc::new(DevFs {
            entries: RwLock::new(Vec::new()),
        })
    }

    /// Register `node` as `/dev/<name>`, keeping lexicographic order.
    pub fn register(&self, name: &str, node: NodeRef) {
        let mut entries = self.entries.write();
        let pos = entries
            .iter()
            .position(|(n, _)| name < n.as_str())
            .unwrap_or(entries.len());
        entries.insert(pos, (name.to_string(), node));
    }
}

impl VfsNode for DevFs {
    fn kind(&self) -> NodeType {
        NodeType::Directory
    }

    fn finddir(&self, name: &str) -> Result<NodeRef, FsError> {
        self.entries
            .read()
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, node)| node.clone())
            .ok_or(FsError::NotFound)
    }

    fn readdir(&self, index: usize) -> Result<Option<DirEntry>, FsError> {
        Ok(self.entries.read().get(index).map(|(name, node)| DirEntry {
            name: name.clone(),
            ino: node.ino(),
        }))
    }
}

static DEVFS: Once<Arc<DevFs>> = Once::new();

/// The kernel's `/dev`, grafted into the namespace on first use.
pub fn devfs() -> Arc<DevFs> {
    DEVFS
        .call_once(|| {
            let fs = DevFs::new();
            super::ns().register_mount("dev", fs.clone());
            fs
        })
        .clone()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs::IoctlValue;

    struct FakeDev(u32);

    impl VfsNode for FakeDev {
        fn kind(&self) -> NodeType {
            NodeType::CharDevice
        }

        fn ioctl(&self, _request: u32) -> Result<IoctlValue, FsError> {
            Ok(IoctlValue::U32(self.0))
        }
    }

    #[test]
    fn registered_devices_resolve_by_name() {
        let dev = DevFs::new();
        dev.register("console", Arc::new(FakeDev(1)));
        dev.register("fb0", Arc::new(FakeDev(2)));

        let fb = dev.finddir("fb0").unwrap();
        assert_eq!(fb.kind(), NodeType::CharDevice);
        assert_eq!(fb.ioctl(0).unwrap(), IoctlValue::U32(2));
        assert!(dev.finddir("mouse").is_err());
    }

    #[test]
    fn listing_is_sorted_and_bounded() {
        let dev = DevFs::new();
        dev.register("keyboard", Arc::new(FakeDev(0)));
        dev.register("console", Arc::new(FakeDev(0)));
        dev.register("fb0", Arc::new(FakeDev(0)));

        let names: Vec<String> = (0..)
            .map_while(|i| dev.readdir(i).unwrap())
            .map(|e| e.name)
            .collect();
        assert_eq!(names, ["console", "fb0", "keyboard"]);
    }
}
