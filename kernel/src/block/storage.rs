//! Storage backends and the two-device selector.
//!
//! Device 0 prefers the AHCI port when one came up, else IDE drive 0;
//! device 1 takes the next IDE drive not already claimed. Registration
//! happens at boot after the drivers probed; the selection itself lives in
//! `drivers` because it needs both driver states.

use alloc::string::String;
use alloc::sync::Arc;
use alloc::vec;
use alloc::vec::Vec;

use spin::{Mutex, RwLock};

use crate::error::{KernelError, KernelResult};

/// Bytes per sector everywhere in the block stack.
pub const SECTOR_SIZE: usize = 512;

/// Number of selectable storage devices.
pub const MAX_DEVICES: usize = 2;

/// A random-access sector device.
pub trait DiskDevice: Send + Sync {
    /// Short human-readable name for logs.
    fn name(&self) -> &str;

    /// Total sectors on the device.
    fn sector_count(&self) -> u64;

    /// Read `count` sectors starting at `lba` into `buf`.
    fn read_sectors(&self, lba: u64, count: u32, buf: &mut [u8]) -> KernelResult<()>;

    /// Write `count` sectors starting at `lba` from `buf`.
    fn write_sectors(&self, lba: u64, count: u32, buf: &[u8]) -> KernelResult<()>;
}

/// The per-device backend table.
pub struct StorageSet {
    devices: RwLock<[Option<Arc<dyn DiskDevice>>; MAX_DEVICES]>,
}

impl StorageSet {
    pub const fn new() -> Self {
        Self {
            devices: RwLock::new([None, None]),
        }
    }

    /// Install `dev` as storage device `slot`.
    pub fn register(&self, slot: u8, dev: Arc<dyn DiskDevice>) {
        let mut devices = self.devices.write();
        if (slot as usize) < MAX_DEVICES {
            log::info!("storage: device {} -> {}", slot, dev.name());
            devices[slot as usize] = Some(dev);
        }
    }

    pub fn device(&self, slot: u8) -> Option<Arc<dyn DiskDevice>> {
        self.devices.read().get(slot as usize)?.clone()
    }

    pub fn read(&self, slot: u8, lba: u64, count: u32, buf: &mut [u8]) -> KernelResult<()> {
        if count == 0 || buf.len() < count as usize * SECTOR_SIZE {
            return Err(KernelError::InvalidArgument);
        }
        self.device(slot)
            .ok_or(KernelError::IoError)?
            .read_sectors(lba, count, buf)
    }

    pub fn write(&self, slot: u8, lba: u64, count: u32, buf: &[u8]) -> KernelResult<()> {
        if count == 0 || buf.len() < count as usize * SECTOR_SIZE {
            return Err(KernelError::InvalidArgument);
        }
        self.device(slot)
            .ok_or(KernelError::IoError)?
            .write_sectors(lba, count, buf)
    }
}

impl Default for StorageSet {
    fn default() -> Self {
        Self::new()
    }
}

/// Memory-backed disk. Stands in for real hardware in tests and doubles as
/// a ramdisk device.
pub struct RamDisk {
    name: String,
    data: Mutex<Vec<u8>>,
}

impl RamDisk {
    pub fn new(name: String, sectors: u64) -> Self {
        Self {
            name,
            data: Mutex::new(vec![0u8; sectors as usize * SECTOR_SIZE]),
        }
    }

    /// Build a disk over an existing image.
    pub fn from_image(name: String, image: Vec<u8>) -> Self {
        assert_eq!(image.len() % SECTOR_SIZE, 0);
        Self {
            name,
            data: Mutex::new(image),
        }
    }
}

impl DiskDevice for RamDisk {
    fn name(&self) -> &str {
        &self.name
    }

    fn sector_count(&self) -> u64 {
        (self.data.lock().len() / SECTOR_SIZE) as u64
    }

    fn read_sectors(&self, lba: u64, count: u32, buf: &mut [u8]) -> KernelResult<()> {
        let data = self.data.lock();
        let start = lba as usize * SECTOR_SIZE;
        let len = count as usize * SECTOR_SIZE;
        if start + len > data.len() {
            return Err(KernelError::IoError);
        }
        buf[..len].copy_from_slice(&data[start..start + len]);
        Ok(())
    }

    fn write_sectors(&self, lba: u64, count: u32, buf: &[u8]) -> KernelResult<()> {
        let mut data = self.data.lock();
        let start = lba as usize * SECTOR_SIZE;
        let len = count as usize * SECTOR_SIZE;
        if start + len > data.len() {
            return Err(KernelError::IoError);
        }
        data[start..start + len].copy_from_slice(&buf[..len]);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::string::ToString;

    #[test]
    fn ramdisk_round_trip() {
        let disk = RamDisk::new("ram0".to_string(), 16);
        let pattern = [0x42u8; SECTOR_SIZE];
        disk.write_sectors(3, 1, &pattern).unwrap();
        let mut out = [0u8; SECTOR_SIZE];
        disk.read_sectors(3, 1, &mut out).unwrap();
        assert_eq!(out, pattern);
    }

    #[test]
    fn out_of_range_access_fails() {
        let disk = RamDisk::new("tiny".to_string(), 2);
        let mut buf = [0u8; SECTOR_SIZE];
        assert!(disk.read_sectors(2, 1, &mut buf).is_err());
        assert!(disk.write_sectors(1, 2, &[0; 2 * SECTOR_SIZE]).is_err());
    }

    #[test]
    fn selector_dispatches_by_slot() {
        let set = StorageSet::new();
        set.register(0, Arc::new(RamDisk::new("a".to_string(), 8)));
        set.register(1, Arc::new(RamDisk::new("b".to_string(), 8)));

        let sector = [0xAAu8; SECTOR_SIZE];
        set.write(0, 0, 1, &sector).unwrap();
        let mut out = [0u8; SECTOR_SIZE];
        set.read(1, 0, 1, &mut out).unwrap();
        assert_eq!(out[0], 0, "devices must not alias");
        set.read(0, 0, 1, &mut out).unwrap();
        assert_eq!(out[0], 0xAA);
    }

    #[test]
    fn missing_device_is_io_error() {
        let set = StorageSet::new();
        let mut buf = [0u8; SECTOR_SIZE];
        assert_eq!(set.read(0, 0, 1, &mut buf), Err(KernelError::IoError));
        assert_eq!(
            set.read(5, 0, 1, &mut buf),
            Err(KernelError::IoError),
            "slot out of range has no device"
        );
    }
}
