//! Legacy IDE (PIO) driver: IDENTIFY plus 28-bit LBA sector access on the
//! two standard channels. The slow but dependable fallback behind AHCI.

use alloc::string::String;

use spin::Mutex;

use core::sync::atomic::{AtomicBool, Ordering};

use x86_64::instructions::port::Port;

use crate::block::storage::{DiskDevice, SECTOR_SIZE};
use crate::error::{KernelError, KernelResult};

pub const MAX_DRIVES: usize = 4;

const CHANNELS: [u16; 2] = [0x1F0, 0x170];

const REG_DATA: u16 = 0;
const REG_SECCOUNT: u16 = 2;
const REG_LBA0: u16 = 3;
const REG_LBA1: u16 = 4;
const REG_LBA2: u16 = 5;
const REG_DRIVE: u16 = 6;
const REG_COMMAND: u16 = 7;
const REG_STATUS: u16 = 7;

const CMD_READ: u8 = 0x20;
const CMD_WRITE: u8 = 0x30;
const CMD_IDENTIFY: u8 = 0xEC;

const STATUS_ERR: u8 = 0x01;
const STATUS_DRQ: u8 = 0x08;
const STATUS_BSY: u8 = 0x80;

#[derive(Debug, Clone, Default)]
pub struct IdeDriveInfo {
    pub exists: bool,
    pub channel: u8,
    pub drive: u8,
    pub sectors: u32,
    pub model: String,
}

static DRIVES: Mutex<[IdeDriveInfo; MAX_DRIVES]> = Mutex::new([
    IdeDriveInfo {
        exists: false,
        channel: 0,
        drive: 0,
        sectors: 0,
        model: String::new(),
    },
    IdeDriveInfo {
        exists: false,
        channel: 0,
        drive: 0,
        sectors: 0,
        model: String::new(),
    },
    IdeDriveInfo {
        exists: false,
        channel: 0,
        drive: 0,
        sectors: 0,
        model: String::new(),
    },
    IdeDriveInfo {
        exists: false,
        channel: 0,
        drive: 0,
        sectors: 0,
        model: String::new(),
    },
]);

static PROBED: AtomicBool = AtomicBool::new(false);
static IDE_LOCK: Mutex<()> = Mutex::new(());

fn reg(channel: u8, offset: u16) -> u16 {
    CHANNELS[channel as usize] + offset
}

fn wait_not_busy(channel: u8) -> KernelResult<u8> {
    let mut status_port: Port<u8> = Port::new(reg(channel, REG_STATUS));
    for _ in 0..1_000_000 {
        let status = unsafe { status_port.read() };
        if status & STATUS_BSY == 0 {
            return Ok(status);
        }
        core::hint::spin_loop();
    }
    Err(KernelError::IoError)
}

fn wait_drq(channel: u8) -> KernelResult<()> {
    let mut status_port: Port<u8> = Port::new(reg(channel, REG_STATUS));
    for _ in 0..1_000_000 {
        let status = unsafe { status_port.read() };
        if status & STATUS_ERR != 0 {
            return Err(KernelError::IoError);
        }
        if status & STATUS_BSY == 0 && status & STATUS_DRQ != 0 {
            return Ok(());
        }
        core::hint::spin_loop();
    }
    Err(KernelError::IoError)
}

/// Probe all four drive positions with IDENTIFY.
pub fn init() {
    let mut drives = DRIVES.lock();
    for idx in 0..MAX_DRIVES {
        let channel = (idx / 2) as u8;
        let drive = (idx % 2) as u8;

        unsafe {
            Port::<u8>::new(reg(channel, REG_DRIVE)).write(0xA0 | (drive << 4));
            Port::<u8>::new(reg(channel, REG_SECCOUNT)).write(0);
            Port::<u8>::new(reg(channel, REG_LBA0)).write(0);
            Port::<u8>::new(reg(channel, REG_LBA1)).write(0);
            Port::<u8>::new(reg(channel, REG_LBA2)).write(0);
            Port::<u8>::new(reg(channel, REG_COMMAND)).write(CMD_IDENTIFY);
        }

        let status = unsafe { Port::<u8>::new(reg(channel, REG_STATUS)).read() };
        if status == 0 {
            continue; // no drive
        }
        if wait_not_busy(channel).is_err() {
            continue;
        }
        // Non-ATA devices set LBA1/LBA2.
        let sig1 = unsafe { Port::<u8>::new(reg(channel, REG_LBA1)).read() };
        let sig2 = unsafe { Port::<u8>::new(reg(channel, REG_LBA2)).read() };
        if sig1 != 0 || sig2 != 0 {
            continue;
        }
        if wait_drq(channel).is_err() {
            continue;
        }

        let mut identify = [0u16; 256];
        let mut data: Port<u16> = Port::new(reg(channel, REG_DATA));
        for word in identify.iter_mut() {
            *word = unsafe { data.read() };
        }

        let sectors = (identify[61] as u32) << 16 | identify[60] as u32;
        let mut model = String::new();
        for w in &identify[27..47] {
            model.push((w >> 8) as u8 as char);
            model.push((w & 0xFF) as u8 as char);
        }
        let model = String::from(model.trim_end());

        log::info!("ide: drive {} \"{}\" {} sectors", idx, model, sectors);
        drives[idx] = IdeDriveInfo {
            exists: true,
            channel,
            drive,
            sectors,
            model,
        };
    }
    PROBED.store(true, Ordering::Release);
}

pub fn probed() -> bool {
    PROBED.load(Ordering::Acquire)
}

pub fn drive_present(index: u8) -> bool {
    DRIVES
        .lock()
        .get(index as usize)
        .map(|d| d.exists)
        .unwrap_or(false)
}

fn setup_transfer(channel: u8, drive: u8, lba: u32, count: u8) -> KernelResult<()> {
    wait_not_busy(channel)?;
    unsafe {
        Port::<u8>::new(reg(channel, REG_DRIVE))
            .write(0xE0 | (drive << 4) | ((lba >> 24) & 0x0F) as u8);
        Port::<u8>::new(reg(channel, REG_SECCOUNT)).write(count);
        Port::<u8>::new(reg(channel, REG_LBA0)).write(lba as u8);
        Port::<u8>::new(reg(channel, REG_LBA1)).write((lba >> 8) as u8);
        Port::<u8>::new(reg(channel, REG_LBA2)).write((lba >> 16) as u8);
    }
    Ok(())
}

/// PIO read of `count` sectors.
pub fn read_sectors(index: u8, lba: u32, count: u8, buf: &mut [u8]) -> KernelResult<()> {
    if count == 0 || buf.len() < count as usize * SECTOR_SIZE {
        return Err(KernelError::InvalidArgument);
    }
    let _guard = IDE_LOCK.lock();
    let (channel, drive) = {
        let drives = DRIVES.lock();
        let d = drives
            .get(index as usize)
            .filter(|d| d.exists)
            .ok_or(KernelError::IoError)?;
        (d.channel, d.drive)
    };

    setup_transfer(channel, drive, lba, count)?;
    unsafe { Port::<u8>::new(reg(channel, REG_COMMAND)).write(CMD_READ) };

    let mut data: Port<u16> = Port::new(reg(channel, REG_DATA));
    for sector in 0..count as usize {
        wait_drq(channel)?;
        for i in 0..SECTOR_SIZE / 2 {
            let word = unsafe { data.read() };
            let at = sector * SECTOR_SIZE + i * 2;
            buf[at] = word as u8;
            buf[at + 1] = (word >> 8) as u8;
        }
    }
    Ok(())
}

/// PIO write of `count` sectors.
pub fn write_sectors(index: u8, lba: u32, count: u8, buf: &[u8]) -> KernelResult<()> {
    if count == 0 || buf.len() < count as usize * SECTOR_SIZE {
        return Err(KernelError::InvalidArgument);
    }
    let _guard = IDE_LOCK.lock();
    let (channel, drive) = {
        let drives = DRIVES.lock();
        let d = drives
            .get(index as usize)
            .filter(|d| d.exists)
            .ok_or(KernelError::IoError)?;
        (d.channel, d.drive)
    };

    setup_transfer(channel, drive, lba, count)?;
    unsafe { Port::<u8>::new(reg(channel, REG_COMMAND)).write(CMD_WRITE) };

    let mut data: Port<u16> = Port::new(reg(channel, REG_DATA));
    for sector in 0..count as usize {
        wait_drq(channel)?;
        for i in 0..SECTOR_SIZE / 2 {
            let at = sector * SECTOR_SIZE + i * 2;
            let word = buf[at] as u16 | (buf[at + 1] as u16) << 8;
            unsafe { data.write(word) };
        }
    }
    wait_not_busy(channel)?;
    Ok(())
}

/// Block-layer adapter for one IDE drive.
pub struct IdeDisk {
    index: u8,
}

impl IdeDisk {
    pub fn new(index: u8) -> Self {
        Self { index }
    }
}

impl DiskDevice for IdeDisk {
    fn name(&self) -> &str {
        "ide"
    }

    fn sector_count(&self) -> u64 {
        DRIVES
            .lock()
            .get(self.index as usize)
            .map(|d| d.sectors as u64)
            .unwrap_or(0)
    }

    fn read_sectors(&self, lba: u64, count: u32, buf: &mut [u8]) -> KernelResult<()> {
        let mut done = 0u32;
        while done < count {
            let chunk = (count - done).min(255) as u8;
            read_sectors(
                self.index,
                (lba + done as u64) as u32,
                chunk,
                &mut buf[done as usize * SECTOR_SIZE..],
            )?;
            done += chunk as u32;
        }
        Ok(())
    }

    fn write_sectors(&self, lba: u64, count: u32, buf: &[u8]) -> KernelResult<()> {
        let mut done = 0u32;
        while done < count {
            let chunk = (count - done).min(255) as u8;
            write_sectors(
                self.index,
                (lba + done as u64) as u32,
                chunk,
                &buf[done as usize * SECTOR_SIZE..],
            )?;
            done += chunk as u32;
        }
        Ok(())
    }
}
