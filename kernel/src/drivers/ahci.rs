//! AHCI (SATA) DMA transport.
//!
//! The HBA is found over PCI (class 0x01, subclass 0x06), configured from
//! ABAR, and the first port whose SATA status reports a present device
//! with an active link is claimed. Transfers use READ/WRITE DMA EXT with
//! a single-entry PRDT per command; buffers that are not DMA-addressable
//! go through a one-sector bounce buffer.

use spin::Mutex;

use core::sync::atomic::{AtomicBool, Ordering};

use crate::block::storage::{DiskDevice, SECTOR_SIZE};
use crate::error::{KernelError, KernelResult};
use crate::mm::{direct_map_offset, phys_to_virt, pmm, PhysAddr, PAGE_SIZE};

use super::pci::{self, PciDevice};

const AHCI_GHC_ENABLE: u32 = 1 << 31;

const DET_PRESENT: u8 = 0x1;
const DET_PRESENT_ACTIVE: u8 = 0x3;
const IPM_ACTIVE: u8 = 0x1;

const PXCMD_ST: u32 = 1 << 0;
const PXCMD_FRE: u32 = 1 << 4;
const PXCMD_FR: u32 = 1 << 14;
const PXCMD_CR: u32 = 1 << 15;

const PORT_IS_TFES: u32 = 1 << 30;

const TFD_ERR: u32 = 0x01;
const TFD_DRQ: u32 = 0x08;
const TFD_BSY: u32 = 0x80;

const FIS_TYPE_REG_H2D: u8 = 0x27;
const ATA_READ_DMA_EXT: u8 = 0x25;
const ATA_WRITE_DMA_EXT: u8 = 0x35;

const PRDT_MAX_BYTES: u64 = 4 * 1024 * 1024;
const MAX_SECTORS_PER_CMD: u32 = (PRDT_MAX_BYTES / SECTOR_SIZE as u64) as u32;
const CMD_SLOT: u32 = 0;
const TIMEOUT: u32 = 1_000_000;

// Generic HBA registers.
const HBA_GHC: u64 = 0x04;
const HBA_PI: u64 = 0x0C;
const HBA_VS: u64 = 0x10;
const HBA_CAP: u64 = 0x00;

// Per-port register offsets (base: 0x100 + port * 0x80).
const PX_CLB: u64 = 0x00;
const PX_CLBU: u64 = 0x04;
const PX_FB: u64 = 0x08;
const PX_FBU: u64 = 0x0C;
const PX_IS: u64 = 0x10;
const PX_CMD: u64 = 0x18;
const PX_TFD: u64 = 0x20;
const PX_SIG: u64 = 0x24;
const PX_SSTS: u64 = 0x28;
const PX_SERR: u64 = 0x30;
const PX_CI: u64 = 0x38;

struct PortState {
    hba_virt: u64,
    port: u32,
    /// Physical page carved into command list / received FIS / command
    /// table / bounce buffer.
    dma_page: PhysAddr,
}

static PORT: Mutex<Option<PortState>> = Mutex::new(None);
static READY: AtomicBool = AtomicBool::new(false);

// Layout of the DMA page.
const OFF_CMD_LIST: u64 = 0; // 1024 bytes, 1 KiB aligned
const OFF_FIS: u64 = 1024; // 256 bytes, 256-byte aligned
const OFF_CMD_TABLE: u64 = 1280; // 128 + 16 PRDT bytes, 128-byte aligned
const OFF_BOUNCE: u64 = 2048; // one sector

fn mmio_read(base: u64, off: u64) -> u32 {
    unsafe { core::ptr::read_volatile((base + off) as *const u32) }
}

fn mmio_write(base: u64, off: u64, value: u32) {
    unsafe { core::ptr::write_volatile((base + off) as *mut u32, value) }
}

fn port_base(hba_virt: u64, port: u32) -> u64 {
    hba_virt + 0x100 + port as u64 * 0x80
}

fn det_name(det: u8) -> &'static str {
    match det {
        0 => "no device",
        DET_PRESENT => "device present",
        DET_PRESENT_ACTIVE => "device active",
        _ => "reserved",
    }
}

fn port_stop(base: u64) -> KernelResult<()> {
    mmio_write(base, PX_CMD, mmio_read(base, PX_CMD) & !PXCMD_ST);
    let mut timeout = TIMEOUT;
    while mmio_read(base, PX_CMD) & PXCMD_CR != 0 && timeout > 0 {
        timeout -= 1;
    }
    if timeout == 0 {
        return Err(KernelError::IoError);
    }

    mmio_write(base, PX_CMD, mmio_read(base, PX_CMD) & !PXCMD_FRE);
    let mut timeout = TIMEOUT;
    while mmio_read(base, PX_CMD) & PXCMD_FR != 0 && timeout > 0 {
        timeout -= 1;
    }
    if timeout == 0 {
        return Err(KernelError::IoError);
    }
    Ok(())
}

fn port_start(base: u64) -> KernelResult<()> {
    let mut timeout = TIMEOUT;
    while mmio_read(base, PX_CMD) & (PXCMD_CR | PXCMD_FR) != 0 && timeout > 0 {
        timeout -= 1;
    }
    if timeout == 0 {
        return Err(KernelError::IoError);
    }
    mmio_write(base, PX_CMD, mmio_read(base, PX_CMD) | PXCMD_FRE);
    mmio_write(base, PX_CMD, mmio_read(base, PX_CMD) | PXCMD_ST);
    Ok(())
}

fn configure_port(hba_virt: u64, port: u32) -> KernelResult<()> {
    let base = port_base(hba_virt, port);
    port_stop(base)?;

    let dma_page = pmm::alloc_zeroed_page().ok_or(KernelError::OutOfMemory)?;
    let clb_phys = dma_page.as_u64() + OFF_CMD_LIST;
    let fb_phys = dma_page.as_u64() + OFF_FIS;
    let ct_phys = dma_page.as_u64() + OFF_CMD_TABLE;

    mmio_write(base, PX_CLB, clb_phys as u32);
    mmio_write(base, PX_CLBU, (clb_phys >> 32) as u32);
    mmio_write(base, PX_FB, fb_phys as u32);
    mmio_write(base, PX_FBU, (fb_phys >> 32) as u32);

    // Command header 0: CTBA set up once, PRDT length 1.
    let header = phys_to_virt(PhysAddr::new(clb_phys));
    unsafe {
        // prdtl (u16 at offset 2) = 1
        core::ptr::write_volatile(header.add(2) as *mut u16, 1);
        core::ptr::write_volatile(header.add(8) as *mut u32, ct_phys as u32);
        core::ptr::write_volatile(header.add(12) as *mut u32, (ct_phys >> 32) as u32);
    }

    mmio_write(base, PX_SERR, 0xFFFF_FFFF);
    mmio_write(base, PX_IS, 0xFFFF_FFFF);

    port_start(base)?;

    *PORT.lock() = Some(PortState {
        hba_virt,
        port,
        dma_page,
    });
    READY.store(true, Ordering::Release);
    log::info!("ahci: using port {} for DMA transfers", port);
    Ok(())
}

/// Find and configure the AHCI controller, if any.
pub fn init() {
    // Mass storage / SATA.
    let Some(dev) = pci::find_by_class(0x01, 0x06) else {
        log::info!("ahci: no controller found");
        return;
    };
    init_device(&dev);
}

fn init_device(dev: &PciDevice) {
    log::info!(
        "ahci: controller {:04x}:{:04x} at {}:{}.{}",
        dev.vendor_id,
        dev.device_id,
        dev.bus,
        dev.slot,
        dev.function
    );
    if dev.prog_if != 0x01 {
        log::warn!("ahci: controller not in AHCI mode (prog_if {:#x})", dev.prog_if);
        return;
    }

    pci::enable_bus_mastering(dev);

    let abar = (dev.bars[5] & !0x0F) as u64;
    if abar == 0 {
        log::error!("ahci: controller missing ABAR");
        return;
    }
    let hba_virt = abar + direct_map_offset();

    mmio_write(hba_virt, HBA_GHC, mmio_read(hba_virt, HBA_GHC) | AHCI_GHC_ENABLE);

    let version = mmio_read(hba_virt, HBA_VS);
    let cap = mmio_read(hba_virt, HBA_CAP);
    let mut port_mask = mmio_read(hba_virt, HBA_PI);
    log::info!(
        "ahci: ABAR {:#x} version {}.{} cap {:#x} ports {:#x}",
        abar,
        version >> 16,
        version & 0xFFFF,
        cap,
        port_mask
    );
    if port_mask == 0 {
        let count = (cap & 0x1F) + 1;
        port_mask = if count >= 32 { u32::MAX } else { (1 << count) - 1 };
    }

    for port in 0..32u32 {
        if port_mask & (1 << port) == 0 {
            continue;
        }
        let base = port_base(hba_virt, port);
        let ssts = mmio_read(base, PX_SSTS);
        let det = (ssts & 0x0F) as u8;
        let ipm = ((ssts >> 8) & 0x0F) as u8;
        let link_active = det == DET_PRESENT_ACTIVE && ipm == IPM_ACTIVE;

        log::info!(
            "ahci: port {}: {} (det {}, ipm {}) sig {:#x}{}",
            port,
            det_name(det),
            det,
            ipm,
            mmio_read(base, PX_SIG),
            if link_active { " [link-up]" } else { "" }
        );

        if link_active && !READY.load(Ordering::Acquire) {
            if let Err(e) = configure_port(hba_virt, port) {
                log::error!("ahci: failed to configure port {}: {}", port, e);
            }
        }
    }

    if !READY.load(Ordering::Acquire) {
        log::warn!("ahci: no active SATA link found");
    }
}

/// True when a port has been configured for DMA.
pub fn port_ready() -> bool {
    READY.load(Ordering::Acquire)
}

/// Resolve a kernel-virtual buffer to its physical address, splitting at
/// page boundaries. Falls back to the bounce buffer for odd addresses.
fn calculate_chunk(
    state: &PortState,
    buffer: *const u8,
    requested_sectors: u32,
) -> (PhysAddr, u32, bool) {
    let virt = buffer as u64;
    let dmo = direct_map_offset();
    if virt < dmo {
        return (PhysAddr::new(state.dma_page.as_u64() + OFF_BOUNCE), 1, true);
    }
    let phys = virt - dmo;
    let offset = phys & (PAGE_SIZE as u64 - 1);
    let contiguous = PAGE_SIZE as u64 - offset;
    if contiguous < SECTOR_SIZE as u64 {
        return (PhysAddr::new(state.dma_page.as_u64() + OFF_BOUNCE), 1, true);
    }
    let sectors = (contiguous / SECTOR_SIZE as u64)
        .min(requested_sectors as u64)
        .min(MAX_SECTORS_PER_CMD as u64) as u32;
    (PhysAddr::new(phys), sectors.max(1), false)
}

fn issue_dma(state: &PortState, lba: u64, phys: PhysAddr, sectors: u32, write: bool) -> KernelResult<()> {
    let base = port_base(state.hba_virt, state.port);

    let mut timeout = TIMEOUT;
    while mmio_read(base, PX_TFD) & (TFD_BSY | TFD_DRQ) != 0 && timeout > 0 {
        timeout -= 1;
    }
    if timeout == 0 {
        return Err(KernelError::IoError);
    }

    mmio_write(base, PX_SERR, 0xFFFF_FFFF);
    mmio_write(base, PX_IS, 0xFFFF_FFFF);

    let header = phys_to_virt(PhysAddr::new(state.dma_page.as_u64() + OFF_CMD_LIST));
    let table = phys_to_virt(PhysAddr::new(state.dma_page.as_u64() + OFF_CMD_TABLE));
    let bytes = sectors * SECTOR_SIZE as u32;

    unsafe {
        // Header flags: CFL = 5 dwords, write bit as needed.
        let mut flags: u16 = 5;
        if write {
            flags |= 1 << 6;
        }
        core::ptr::write_volatile(header as *mut u16, flags);
        core::ptr::write_volatile(header.add(2) as *mut u16, 1); // prdtl
        core::ptr::write_volatile(header.add(4) as *mut u32, 0); // prdbc

        // Command table: CFIS then one PRDT entry at offset 0x80.
        core::ptr::write_bytes(table, 0, 0x90);
        let cfis = table;
        *cfis = FIS_TYPE_REG_H2D;
        *cfis.add(1) = 1 << 7; // command register update
        *cfis.add(2) = if write { ATA_WRITE_DMA_EXT } else { ATA_READ_DMA_EXT };
        *cfis.add(4) = lba as u8;
        *cfis.add(5) = (lba >> 8) as u8;
        *cfis.add(6) = (lba >> 16) as u8;
        *cfis.add(7) = 0x40 | ((lba >> 24) & 0x0F) as u8;
        *cfis.add(8) = (lba >> 24) as u8;
        *cfis.add(9) = (lba >> 32) as u8;
        *cfis.add(10) = (lba >> 40) as u8;
        *cfis.add(12) = sectors as u8;
        *cfis.add(13) = (sectors >> 8) as u8;

        let prdt = table.add(0x80);
        core::ptr::write_volatile(prdt as *mut u32, phys.as_u64() as u32);
        core::ptr::write_volatile(prdt.add(4) as *mut u32, (phys.as_u64() >> 32) as u32);
        core::ptr::write_volatile(prdt.add(12) as *mut u32, (bytes - 1) | (1 << 31));
    }

    mmio_write(base, PX_CI, 1 << CMD_SLOT);

    let mut timeout = TIMEOUT;
    while mmio_read(base, PX_CI) & (1 << CMD_SLOT) != 0 && timeout > 0 {
        if mmio_read(base, PX_IS) & PORT_IS_TFES != 0 {
            log::error!(
                "ahci: taskfile error during {}: lba={} count={} IS={:#x} SERR={:#x} TFD={:#x}",
                if write { "write" } else { "read" },
                lba,
                sectors,
                mmio_read(base, PX_IS),
                mmio_read(base, PX_SERR),
                mmio_read(base, PX_TFD)
            );
            mmio_write(base, PX_IS, PORT_IS_TFES);
            return Err(KernelError::IoError);
        }
        timeout -= 1;
    }
    if timeout == 0 || mmio_read(base, PX_TFD) & TFD_ERR != 0 {
        log::error!(
            "ahci: DMA {} failed: lba={} count={} IS={:#x} SERR={:#x} TFD={:#x}",
            if write { "write" } else { "read" },
            lba,
            sectors,
            mmio_read(base, PX_IS),
            mmio_read(base, PX_SERR),
            mmio_read(base, PX_TFD)
        );
        mmio_write(base, PX_IS, 0xFFFF_FFFF);
        return Err(KernelError::IoError);
    }
    Ok(())
}

/// Read `sector_count` sectors starting at `lba`.
pub fn read(lba: u64, sector_count: u32, buf: &mut [u8]) -> KernelResult<()> {
    if sector_count == 0 || buf.len() < sector_count as usize * SECTOR_SIZE {
        return Err(KernelError::InvalidArgument);
    }
    let guard = PORT.lock();
    let state = guard.as_ref().ok_or(KernelError::IoError)?;

    let mut lba = lba;
    let mut remaining = sector_count;
    let mut at = 0usize;
    while remaining > 0 {
        let (phys, chunk, bounce) = calculate_chunk(state, buf[at..].as_ptr(), remaining);
        issue_dma(state, lba, phys, chunk, false)?;
        if bounce {
            let src = phys_to_virt(PhysAddr::new(state.dma_page.as_u64() + OFF_BOUNCE));
            unsafe {
                core::ptr::copy_nonoverlapping(src, buf[at..].as_mut_ptr(), SECTOR_SIZE);
            }
        }
        lba += chunk as u64;
        at += chunk as usize * SECTOR_SIZE;
        remaining -= chunk;
    }
    Ok(())
}

/// Write `sector_count` sectors starting at `lba`.
pub fn write(lba: u64, sector_count: u32, buf: &[u8]) -> KernelResult<()> {
    if sector_count == 0 || buf.len() < sector_count as usize * SECTOR_SIZE {
        return Err(KernelError::InvalidArgument);
    }
    let guard = PORT.lock();
    let state = guard.as_ref().ok_or(KernelError::IoError)?;

    let mut lba = lba;
    let mut remaining = sector_count;
    let mut at = 0usize;
    while remaining > 0 {
        let (phys, chunk, bounce) = calculate_chunk(state, buf[at..].as_ptr(), remaining);
        if bounce {
            let dst = phys_to_virt(PhysAddr::new(state.dma_page.as_u64() + OFF_BOUNCE));
            unsafe {
                core::ptr::copy_nonoverlapping(buf[at..].as_ptr(), dst, SECTOR_SIZE);
            }
        }
        issue_dma(state, lba, phys, chunk, true)?;
        lba += chunk as u64;
        at += chunk as usize * SECTOR_SIZE;
        remaining -= chunk;
    }
    Ok(())
}

/// Block-layer adapter for the configured AHCI port.
pub struct AhciDisk;

impl DiskDevice for AhciDisk {
    fn name(&self) -> &str {
        "ahci"
    }

    fn sector_count(&self) -> u64 {
        // Not tracked; the filesystems bound their own geometry.
        u64::MAX
    }

    fn read_sectors(&self, lba: u64, count: u32, buf: &mut [u8]) -> KernelResult<()> {
        read(lba, count, buf)
    }

    fn write_sectors(&self, lba: u64, count: u32, buf: &[u8]) -> KernelResult<()> {
        write(lba, count, buf)
    }
}
