//! Hardware drivers and the storage/mount bring-up glue.

pub mod ahci;
pub mod console;
pub mod fb;
pub mod ide;
pub mod keyboard;
pub mod pci;

use alloc::sync::Arc;

use crate::block::{self, gpt};
use crate::fs::{self, devfs};

/// Select the storage backends: device 0 prefers the AHCI port if one is
/// ready, else IDE drive 0; device 1 takes the next IDE drive not already
/// used. `ide::init` must have populated the drive table first.
pub fn storage_init() {
    assert!(ide::probed(), "storage_init before ide::init");
    let io = block::bio();

    let mut dev0_ide: Option<u8> = None;
    if ahci::port_ready() {
        io.storage().register(0, Arc::new(ahci::AhciDisk));
    } else {
        io.storage().register(0, Arc::new(ide::IdeDisk::new(0)));
        dev0_ide = Some(0);
    }

    for drive in 0..ide::MAX_DRIVES as u8 {
        if Some(drive) == dev0_ide {
            continue;
        }
        if ide::drive_present(drive) {
            io.storage().register(1, Arc::new(ide::IdeDisk::new(drive)));
            break;
        }
    }
}

/// Mount filesystems: prefer GPT-discovered partitions (Linux Filesystem
/// -> EXT2, Microsoft Basic Data -> FAT32), fall back to a fixed LBA.
/// A second storage device gets grafted at /disk1.
pub fn mount_filesystems() {
    let io = block::bio();
    let ns = fs::ns();

    for dev in 0..2u8 {
        if io.storage().device(dev).is_none() {
            continue;
        }
        let mut mounted = false;

        let _ = gpt::read_partitions(&io, dev, |part| {
            if mounted {
                return;
            }
            let root = match part.type_name() {
                "Linux Filesystem" => {
                    fs::ext2::Ext2Volume::mount(io.clone(), dev, part.start_lba as u32)
                        .ok()
                        .and_then(|vol| vol.root().ok())
                }
                "Microsoft Basic Data" | "EFI System Partition" => {
                    fs::fat32::Fat32Volume::mount(io.clone(), dev, part.start_lba as u32)
                        .ok()
                        .map(|vol| vol.root())
                }
                _ => None,
            };
            if let Some(root) = root {
                if dev == 0 {
                    ns.mount_root(root);
                } else {
                    ns.register_mount("disk1", root);
                }
                mounted = true;
            }
        });

        if !mounted {
            // No GPT (or nothing usable): try the conventional offsets.
            let root = fs::ext2::Ext2Volume::mount(io.clone(), dev, 2048)
                .ok()
                .and_then(|vol| vol.root().ok())
                .or_else(|| {
                    fs::fat32::Fat32Volume::mount(io.clone(), dev, 2048)
                        .ok()
                        .map(|vol| vol.root())
                });
            match root {
                Some(root) => {
                    if dev == 0 {
                        ns.mount_root(root);
                    } else {
                        ns.register_mount("disk1", root);
                    }
                }
                None => log::warn!("mount: no filesystem found on device {}", dev),
            }
        }
    }
}

/// Register the device nodes: console, fb0, keyboard.
pub fn devices_init(fb_info: Option<fb::FramebufferInfo>) {
    let dev = devfs::devfs();
    dev.register("console", Arc::new(console::ConsoleNode));
    dev.register("keyboard", Arc::new(keyboard::KeyboardNode));
    match fb_info {
        Some(info) => {
            log::info!("devfs: console, keyboard, fb0 ({}x{})", info.width, info.height);
            dev.register("fb0", Arc::new(fb::FbNode::new(info)));
        }
        None => log::info!("devfs: console, keyboard (no framebuffer)"),
    }
}
