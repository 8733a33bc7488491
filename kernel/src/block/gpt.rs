//! GPT partition table parsing.
//!
//! Primary header at LBA 1, entries at `partition_entries_lba`. Only the
//! fields the mount path needs are decoded; type GUIDs are matched against
//! the few we recognize by name.

use alloc::vec;

use super::bio::BlockIo;
use crate::error::{KernelError, KernelResult};

const GPT_SIGNATURE: u64 = 0x5452_4150_2049_4645; // "EFI PART"

const EFI_SYSTEM_PARTITION_GUID: [u8; 16] = [
    0x28, 0x73, 0x2A, 0xC1, 0x1F, 0xF8, 0xD2, 0x11, 0xBA, 0x4B, 0x00, 0xA0, 0xC9, 0x3E, 0xC9,
    0x3B,
];

const MICROSOFT_BASIC_DATA_GUID: [u8; 16] = [
    0xA2, 0xA0, 0xD0, 0xEB, 0xE5, 0xB9, 0x33, 0x44, 0x87, 0xC0, 0x68, 0xB6, 0xB7, 0x26, 0x99,
    0xC7,
];

const LINUX_FILESYSTEM_GUID: [u8; 16] = [
    0xAF, 0x3D, 0xC6, 0x0F, 0x83, 0x84, 0x72, 0x47, 0x8E, 0x79, 0x3D, 0x69, 0xD8, 0x47, 0x7D,
    0xE4,
];

/// One discovered partition.
#[derive(Debug, Clone)]
pub struct PartitionInfo {
    pub drive: u8,
    pub start_lba: u64,
    pub end_lba: u64,
    pub type_guid: [u8; 16],
}

impl PartitionInfo {
    /// Recognized type GUIDs by name.
    pub fn type_name(&self) -> &'static str {
        guid_name(&self.type_guid)
    }
}

/// Name for a partition type GUID.
pub fn guid_name(guid: &[u8; 16]) -> &'static str {
    if *guid == EFI_SYSTEM_PARTITION_GUID {
        "EFI System Partition"
    } else if *guid == MICROSOFT_BASIC_DATA_GUID {
        "Microsoft Basic Data"
    } else if *guid == LINUX_FILESYSTEM_GUID {
        "Linux Filesystem"
    } else {
        "Unknown"
    }
}

fn le32(buf: &[u8], off: usize) -> u32 {
    u32::from_le_bytes(buf[off..off + 4].try_into().unwrap())
}

fn le64(buf: &[u8], off: usize) -> u64 {
    u64::from_le_bytes(buf[off..off + 8].try_into().unwrap())
}

/// Enumerate the partitions of `drive`, invoking `callback` per used entry.
pub fn read_partitions(
    io: &BlockIo,
    drive: u8,
    mut callback: impl FnMut(&PartitionInfo),
) -> KernelResult<()> {
    let (entries_lba, num_entries, entry_size) = {
        let header = io.bread(drive, 1)?;
        let data = header.data();
        if le64(data, 0) != GPT_SIGNATURE {
            log::warn!("gpt: invalid signature on drive {}", drive);
            return Err(KernelError::IoError);
        }
        (le64(data, 72), le32(data, 80), le32(data, 84))
    };

    if entry_size == 0 || entry_size > 512 || num_entries > 1024 {
        return Err(KernelError::IoError);
    }

    let total = num_entries as usize * entry_size as usize;
    let sectors = (total + 511) / 512;
    let mut entries = vec![0u8; sectors * 512];
    for i in 0..sectors {
        let sector = io.bread(drive, (entries_lba + i as u64) as u32)?;
        entries[i * 512..(i + 1) * 512].copy_from_slice(sector.data());
    }

    for i in 0..num_entries as usize {
        let entry = &entries[i * entry_size as usize..(i + 1) * entry_size as usize];
        let type_guid: [u8; 16] = entry[0..16].try_into().unwrap();
        if type_guid == [0u8; 16] {
            continue;
        }
        let info = PartitionInfo {
            drive,
            start_lba: le64(entry, 32),
            end_lba: le64(entry, 40),
            type_guid,
        };
        callback(&info);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::storage::{RamDisk, SECTOR_SIZE};
    use alloc::string::ToString;
    use alloc::sync::Arc;
    use alloc::vec::Vec;

    /// A tiny two-partition GPT disk image.
    fn gpt_image() -> Vec<u8> {
        let mut img = vec![0u8; 64 * SECTOR_SIZE];

        // Header at LBA 1.
        let h = SECTOR_SIZE;
        img[h..h + 8].copy_from_slice(&GPT_SIGNATURE.to_le_bytes());
        img[h + 72..h + 80].copy_from_slice(&2u64.to_le_bytes()); // entries at LBA 2
        img[h + 80..h + 84].copy_from_slice(&4u32.to_le_bytes()); // 4 entries
        img[h + 84..h + 88].copy_from_slice(&128u32.to_le_bytes()); // 128 B each

        // Entry 0: Linux Filesystem at LBA 2048.
        let e0 = 2 * SECTOR_SIZE;
        img[e0..e0 + 16].copy_from_slice(&LINUX_FILESYSTEM_GUID);
        img[e0 + 32..e0 + 40].copy_from_slice(&2048u64.to_le_bytes());
        img[e0 + 40..e0 + 48].copy_from_slice(&4095u64.to_le_bytes());

        // Entry 1: Microsoft Basic Data at LBA 4096.
        let e1 = e0 + 128;
        img[e1..e1 + 16].copy_from_slice(&MICROSOFT_BASIC_DATA_GUID);
        img[e1 + 32..e1 + 40].copy_from_slice(&4096u64.to_le_bytes());
        img[e1 + 40..e1 + 48].copy_from_slice(&8191u64.to_le_bytes());

        img
    }

    #[test]
    fn enumerates_used_entries_with_names() {
        let io = BlockIo::new();
        io.storage().register(
            0,
            Arc::new(RamDisk::from_image("gpt".to_string(), gpt_image())),
        );

        let mut found = Vec::new();
        read_partitions(&io, 0, |p| {
            found.push((p.type_name(), p.start_lba, p.end_lba))
        })
        .unwrap();

        assert_eq!(
            found,
            vec![
                ("Linux Filesystem", 2048, 4095),
                ("Microsoft Basic Data", 4096, 8191)
            ]
        );
    }

    #[test]
    fn bad_signature_is_rejected() {
        let io = BlockIo::new();
        io.storage().register(
            0,
            Arc::new(RamDisk::new("blank".to_string(), 8)),
        );
        assert!(read_partitions(&io, 0, |_| ()).is_err());
    }

    #[test]
    fn unknown_guid_named_unknown() {
        assert_eq!(guid_name(&[9u8; 16]), "Unknown");
        assert_eq!(
            guid_name(&EFI_SYSTEM_PARTITION_GUID),
            "EFI System Partition"
        );
    }
}
