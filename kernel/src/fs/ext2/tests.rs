//! EXT2 behavior tests over in-memory images.

use alloc::string::String;
use alloc::sync::Arc;
use alloc::vec;
use alloc::vec::Vec;

use super::testfs::{mount_image, ImageSpec};
use super::{Ext2Volume, EXT2_BSIZE};
use crate::block::bio::BlockIo;
use crate::error::FsError;
use crate::fs::{Namespace, NodeRef, NodeType, VfsNode};

fn fresh_volume() -> (Arc<BlockIo>, Arc<Ext2Volume>) {
    let io = BlockIo::new();
    let vol = mount_image(&io, 0, &ImageSpec::default());
    (io, vol)
}

fn create_file(root: &NodeRef, name: &str) -> NodeRef {
    root.mknod(name, NodeType::File, 0).unwrap();
    root.finddir(name).unwrap()
}

#[test]
fn mount_decodes_the_superblock() {
    let (_io, vol) = fresh_volume();
    let sb = vol.superblock();
    assert_eq!(sb.magic, super::EXT2_MAGIC);
    assert_eq!(sb.first_data_block, 1);
    assert_eq!(sb.blocks_per_group, 2048);
    assert_eq!(sb.inode_size, 128);
}

#[test]
fn root_is_an_empty_directory() {
    let (_io, vol) = fresh_volume();
    let root = vol.root().unwrap();
    assert_eq!(root.kind(), NodeType::Directory);
    assert_eq!(root.readdir(0).unwrap(), None);
    assert!(matches!(root.finddir("nope"), Err(FsError::NotFound)));
}

#[test]
fn write_then_read_returns_identical_bytes() {
    let (_io, vol) = fresh_volume();
    let root = vol.root().unwrap();
    let file = create_file(&root, "data.bin");

    // Crosses sector and block boundaries.
    let payload: Vec<u8> = (0..3000u32).map(|i| (i % 251) as u8).collect();
    assert_eq!(file.write(0, &payload).unwrap(), payload.len());
    assert_eq!(file.size(), payload.len() as u64);

    let mut back = vec![0u8; payload.len()];
    assert_eq!(file.read(0, &mut back).unwrap(), payload.len());
    assert_eq!(back, payload);

    // Unaligned window inside the file.
    let mut window = [0u8; 700];
    assert_eq!(file.read(513, &mut window).unwrap(), 700);
    assert_eq!(&window[..], &payload[513..513 + 700]);

    // Reads at EOF return zero bytes.
    let mut past = [0u8; 16];
    assert_eq!(file.read(payload.len() as u64, &mut past).unwrap(), 0);
}

#[test]
fn overwrite_in_place_keeps_surroundings() {
    let (_io, vol) = fresh_volume();
    let root = vol.root().unwrap();
    let file = create_file(&root, "patch.bin");

    file.write(0, &[0xAA; 2048]).unwrap();
    file.write(1000, b"PATCH").unwrap();

    let mut back = [0u8; 2048];
    file.read(0, &mut back).unwrap();
    assert_eq!(back[999], 0xAA);
    assert_eq!(&back[1000..1005], b"PATCH");
    assert_eq!(back[1005], 0xAA);
    assert_eq!(file.size(), 2048, "in-place writes must not grow the file");
}

#[test]
fn balloc_stays_inside_the_group_and_zeroes_the_block() {
    let (_io, vol) = fresh_volume();
    let sb = *vol.superblock();
    let block = vol.balloc(2).unwrap();
    assert!(block >= sb.first_data_block);
    let bit = block - sb.first_data_block;
    assert!(bit < sb.blocks_per_group);

    let mut data = [0u8; EXT2_BSIZE];
    vol.read_block(block, &mut data).unwrap();
    assert!(data.iter().all(|&b| b == 0));

    vol.bfree(block).unwrap();
}

#[test]
fn balloc_falls_back_to_the_next_group_when_full() {
    let io = BlockIo::new();
    // Group 0's data area is entirely pre-marked used.
    let bpg = 64;
    let itable_blocks = 1; // 8 inodes
    let meta0 = 4 + itable_blocks;
    let vol = mount_image(
        &io,
        0,
        &ImageSpec {
            blocks_per_group: bpg,
            groups: 2,
            inodes_per_group: 8,
            prefill_group0_bits: bpg - meta0,
        },
    );

    // Inode 2 lives in group 0, but the block must come from group 1.
    let block = vol.balloc(2).unwrap();
    assert!(
        block >= 1 + bpg,
        "block {} should come from the second group",
        block
    );
    vol.bfree(block).unwrap();
}

#[test]
fn bitmap_bits_beyond_4096_are_reachable() {
    let io = BlockIo::new();
    // 8192 blocks per group; everything below bit 4100 is taken, so the
    // next allocation must land in the second sector of the bitmap.
    let meta0 = 4 + 64; // 512 inodes -> 64 table blocks
    let vol = mount_image(
        &io,
        0,
        &ImageSpec {
            blocks_per_group: 8192,
            groups: 1,
            inodes_per_group: 512,
            prefill_group0_bits: 4100 - meta0,
        },
    );

    let block = vol.balloc(2).unwrap();
    let bit = block - vol.superblock().first_data_block;
    assert!(bit >= 4100, "bit {} must spill into the second sector", bit);

    // And the file path works on top of such blocks.
    let root = vol.root().unwrap();
    let file = create_file(&root, "spill.bin");
    let payload = [0x42u8; 1024];
    file.write(0, &payload).unwrap();
    let mut back = [0u8; 1024];
    file.read(0, &mut back).unwrap();
    assert_eq!(back, payload);

    vol.bfree(block).unwrap();
}

#[test]
#[should_panic(expected = "already free")]
fn double_free_of_a_block_is_fail_stop() {
    let (_io, vol) = fresh_volume();
    let block = vol.balloc(2).unwrap();
    vol.bfree(block).unwrap();
    let _ = vol.bfree(block);
}

#[test]
fn eight_patterned_files_round_trip_and_delete() {
    let (_io, vol) = fresh_volume();
    let root = vol.root().unwrap();

    let mut names = Vec::new();
    for k in 0..8u32 {
        let name = alloc::format!("alloc_{}", k);
        let file = create_file(&root, &name);
        let mut payload = [0u8; 1024];
        payload.fill(b'A' + (k % 26) as u8);
        payload[0] = b'0' + (k % 10) as u8;
        file.write(0, &payload).unwrap();
        names.push((name, payload));
    }

    for (name, payload) in &names {
        let file = root.finddir(name).unwrap();
        let mut back = [0u8; 1024];
        assert_eq!(file.read(0, &mut back).unwrap(), 1024);
        assert_eq!(&back[..], &payload[..]);
    }

    for (name, _) in &names {
        root.unlink(name).unwrap();
        assert!(matches!(root.finddir(name), Err(FsError::NotFound)));
    }
}

#[test]
fn large_file_reaches_indirect_blocks() {
    let (_io, vol) = fresh_volume();
    let root = vol.root().unwrap();
    let file = create_file(&root, "large.bin");

    // Eight 1 KiB blocks where block b carries (b*7 + i) & 0xFF.
    for b in 0..8u32 {
        let chunk: [u8; 1024] = core::array::from_fn(|i| ((b * 7) as usize + i) as u8 & 0xFF);
        file.write(b as u64 * 1024, &chunk).unwrap();
    }
    for b in 0..8u32 {
        let mut back = [0u8; 1024];
        file.read(b as u64 * 1024, &mut back).unwrap();
        for (i, &byte) in back.iter().enumerate() {
            assert_eq!(byte, ((b * 7) as usize + i) as u8 & 0xFF, "block {} byte {}", b, i);
        }
    }

    // Grow past the 12 direct blocks into the single-indirect tier.
    let tail: Vec<u8> = (0..8 * EXT2_BSIZE).map(|i| (i * 13 % 256) as u8).collect();
    file.write(8 * 1024, &tail).unwrap();
    assert_eq!(file.size(), 16 * 1024);

    let mut back = vec![0u8; tail.len()];
    file.read(8 * 1024, &mut back).unwrap();
    assert_eq!(back, tail);
}

#[test]
fn double_indirect_mapping_is_reachable() {
    let (_io, vol) = fresh_volume();
    let root = vol.root().unwrap();
    let file = create_file(&root, "huge.bin");

    // 12 + 256 blocks of direct + single-indirect coverage, plus a little
    // more to cross into the double-indirect tier.
    let blocks = 12 + 256 + 4;
    let chunk = [0x11u8; EXT2_BSIZE];
    for b in 0..blocks {
        file.write(b as u64 * EXT2_BSIZE as u64, &chunk).unwrap();
    }

    // A recognizable pattern in the double-indirect range survives.
    let off = (12 + 256 + 2) as u64 * EXT2_BSIZE as u64 + 100;
    file.write(off, b"deep-block").unwrap();
    let mut back = [0u8; 10];
    file.read(off, &mut back).unwrap();
    assert_eq!(&back, b"deep-block");
}

#[test]
fn unlink_releases_the_inode_bit() {
    let (_io, vol) = fresh_volume();
    let root = vol.root().unwrap();
    let file = create_file(&root, "gone.txt");
    let inum = file.ino() as u32;
    assert!(vol.inode_bit_is_set(inum));
    file.write(0, &[7u8; 3000]).unwrap();
    drop(file);

    root.unlink("gone.txt").unwrap();
    assert!(
        !vol.inode_bit_is_set(inum),
        "inode bit must clear once the last reference drops"
    );

    // The freed space is reusable.
    let again = create_file(&root, "fresh.txt");
    again.write(0, &[9u8; 3000]).unwrap();
}

#[test]
fn readdir_skips_deleted_entries() {
    let (_io, vol) = fresh_volume();
    let root = vol.root().unwrap();
    for name in ["a", "b", "c"] {
        create_file(&root, name);
    }
    root.unlink("b").unwrap();

    let names: Vec<String> = (0..)
        .map_while(|i| root.readdir(i).unwrap())
        .map(|e| e.name)
        .collect();
    assert_eq!(names, ["a", "c"]);
}

#[test]
fn link_shares_the_inode_and_bumps_nlink() {
    let (_io, vol) = fresh_volume();
    let root = vol.root().unwrap();
    let file = create_file(&root, "orig");
    file.write(0, b"shared-bytes").unwrap();

    root.link("alias", &file).unwrap();
    let alias = root.finddir("alias").unwrap();
    assert_eq!(alias.ino(), file.ino());
    let mut back = [0u8; 12];
    alias.read(0, &mut back).unwrap();
    assert_eq!(&back, b"shared-bytes");
    assert_eq!(alias.stat().nlink, 2);

    // Dropping one name keeps the data alive through the other.
    root.unlink("orig").unwrap();
    let mut back2 = [0u8; 12];
    root.finddir("alias").unwrap().read(0, &mut back2).unwrap();
    assert_eq!(&back2, b"shared-bytes");
}

#[test]
fn data_survives_buffer_cache_eviction() {
    let (_io, vol) = fresh_volume();
    let root = vol.root().unwrap();
    let file = create_file(&root, "big-roundtrip");

    // Well past the 128-slot * 512-byte cache footprint.
    let payload: Vec<u8> = (0..96 * 1024).map(|i| (i * 31 % 256) as u8).collect();
    file.write(0, &payload).unwrap();

    let mut back = vec![0u8; payload.len()];
    file.read(0, &mut back).unwrap();
    assert_eq!(back, payload);
}

#[test]
fn multi_device_isolation() {
    let io = BlockIo::new();
    let vol0 = mount_image(&io, 0, &ImageSpec::default());
    let vol1 = mount_image(&io, 1, &ImageSpec::default());

    let root0 = vol0.root().unwrap();
    let root1 = vol1.root().unwrap();

    let f0 = create_file(&root0, "iso.txt");
    f0.write(0, b"root_partition_data").unwrap();
    let f1 = create_file(&root1, "iso.txt");
    f1.write(0, b"disk1_partition_data").unwrap();

    let mut b0 = [0u8; 19];
    assert_eq!(root0.finddir("iso.txt").unwrap().read(0, &mut b0).unwrap(), 19);
    assert_eq!(&b0, b"root_partition_data");

    let mut b1 = [0u8; 20];
    assert_eq!(root1.finddir("iso.txt").unwrap().read(0, &mut b1).unwrap(), 20);
    assert_eq!(&b1, b"disk1_partition_data");
}

#[test]
fn namespace_integration_mkdir_stat_and_disk1() {
    let io = BlockIo::new();
    let vol0 = mount_image(&io, 0, &ImageSpec::default());
    let vol1 = mount_image(&io, 1, &ImageSpec::default());

    let ns = Namespace::new();
    ns.mount_root(vol0.root().unwrap());
    ns.register_mount("disk1", vol1.root().unwrap());

    // mknod(DIR) then stat reports a directory.
    ns.mknod("/subdir", NodeType::Directory, 0).unwrap();
    let st = ns.resolve("/subdir").unwrap().stat();
    assert_eq!(st.kind_raw, NodeType::Directory.as_raw());

    // Files under the grafted mount land on device 1.
    ns.mknod("/disk1/iso.txt", NodeType::File, 0).unwrap();
    let node = ns.resolve("/disk1/iso.txt").unwrap();
    node.write(0, b"disk1_partition_data").unwrap();
    assert_eq!(node.device_id(), Some(1));

    // And they do not exist on the root device.
    assert!(ns.resolve("/iso.txt").is_err());
}

#[test]
fn files_inside_subdirectories_work() {
    let (_io, vol) = fresh_volume();
    let root = vol.root().unwrap();
    root.mknod("dir", NodeType::Directory, 0).unwrap();
    let dir = root.finddir("dir").unwrap();
    assert_eq!(dir.kind(), NodeType::Directory);

    dir.mknod("nested.txt", NodeType::File, 0).unwrap();
    let nested = dir.finddir("nested.txt").unwrap();
    nested.write(0, b"below").unwrap();

    let mut back = [0u8; 5];
    dir.finddir("nested.txt").unwrap().read(0, &mut back).unwrap();
    assert_eq!(&back, b"below");
}

#[test]
fn mknod_rejects_existing_names() {
    let (_io, vol) = fresh_volume();
    let root = vol.root().unwrap();
    create_file(&root, "dup");
    assert!(matches!(
        root.mknod("dup", NodeType::File, 0),
        Err(FsError::AlreadyExists)
    ));
}

#[test]
fn truncate_empties_the_file() {
    let (_io, vol) = fresh_volume();
    let root = vol.root().unwrap();
    let file = create_file(&root, "trunc.me");
    file.write(0, &[1u8; 5000]).unwrap();
    assert_eq!(file.size(), 5000);
    file.truncate().unwrap();
    assert_eq!(file.size(), 0);
    let mut buf = [0u8; 8];
    assert_eq!(file.read(0, &mut buf).unwrap(), 0);

    // The file is usable again afterwards.
    file.write(0, b"anew").unwrap();
    assert_eq!(file.size(), 4);
}

#[test]
fn unlinking_directories_is_refused() {
    let (_io, vol) = fresh_volume();
    let root = vol.root().unwrap();
    root.mknod("d", NodeType::Directory, 0).unwrap();
    assert!(matches!(root.unlink("d"), Err(FsError::IsADirectory)));
}
