//! Minimal ACPI table walk: RSDP -> (R|X)SDT -> MADT.
//!
//! The MADT supplies the I/O APIC base and the interrupt source
//! overrides; polarity and trigger mode are decoded from the
//! bus-compatible flag bits.

use alloc::vec::Vec;

use crate::mm::{phys_to_virt, PhysAddr};

/// One interrupt source override (legacy IRQ -> GSI).
#[derive(Debug, Clone, Copy)]
pub struct InterruptOverride {
    pub source_irq: u8,
    pub gsi: u32,
    pub active_low: bool,
    pub level_triggered: bool,
}

/// What the rest of the kernel needs from the MADT.
#[derive(Debug, Default)]
pub struct MadtInfo {
    pub lapic_base: u64,
    pub ioapic_base: u64,
    pub ioapic_gsi_base: u32,
    pub overrides: Vec<InterruptOverride>,
}

unsafe fn read<T: Copy>(phys: u64) -> T {
    unsafe { core::ptr::read_unaligned(phys_to_virt(PhysAddr::new(phys)) as *const T) }
}

fn table_signature(phys: u64) -> [u8; 4] {
    unsafe { read::<[u8; 4]>(phys) }
}

fn table_length(phys: u64) -> u32 {
    unsafe { read::<u32>(phys + 4) }
}

/// Parse the MADT starting from the RSDP physical address.
pub fn parse_madt(rsdp_phys: u64) -> Option<MadtInfo> {
    // RSDP: signature(8) checksum(1) oem(6) revision(1) rsdt(4) [xsdt(8)]
    let revision: u8 = unsafe { read(rsdp_phys + 15) };
    let (sdt_phys, wide) = if revision >= 2 {
        (unsafe { read::<u64>(rsdp_phys + 24) }, true)
    } else {
        (unsafe { read::<u32>(rsdp_phys + 16) } as u64, false)
    };
    if sdt_phys == 0 {
        return None;
    }

    // Walk the root table's pointer array for the APIC signature.
    let len = table_length(sdt_phys) as u64;
    let entry_size = if wide { 8 } else { 4 };
    let mut at = sdt_phys + 36;
    let end = sdt_phys + len;
    let mut madt_phys = 0u64;
    while at + entry_size <= end {
        let ptr = if wide {
            unsafe { read::<u64>(at) }
        } else {
            unsafe { read::<u32>(at) } as u64
        };
        if ptr != 0 && table_signature(ptr) == *b"APIC" {
            madt_phys = ptr;
            break;
        }
        at += entry_size;
    }
    if madt_phys == 0 {
        return None;
    }

    let mut info = MadtInfo {
        lapic_base: unsafe { read::<u32>(madt_phys + 36) } as u64,
        ..MadtInfo::default()
    };

    // MADT entries follow the 44-byte header.
    let madt_len = table_length(madt_phys) as u64;
    let mut at = madt_phys + 44;
    while at + 2 <= madt_phys + madt_len {
        let kind: u8 = unsafe { read(at) };
        let len: u8 = unsafe { read(at + 1) };
        if len < 2 {
            break;
        }
        match kind {
            1 => {
                // I/O APIC
                if info.ioapic_base == 0 {
                    info.ioapic_base = unsafe { read::<u32>(at + 4) } as u64;
                    info.ioapic_gsi_base = unsafe { read::<u32>(at + 8) };
                }
            }
            2 => {
                // Interrupt source override
                let flags: u16 = unsafe { read(at + 8) };
                info.overrides.push(InterruptOverride {
                    source_irq: unsafe { read(at + 3) },
                    gsi: unsafe { read::<u32>(at + 4) },
                    // Bus-compatible (0) keeps ISA defaults: high, edge.
                    active_low: flags & 0x3 == 0x3,
                    level_triggered: (flags >> 2) & 0x3 == 0x3,
                });
            }
            _ => {}
        }
        at += len as u64;
    }

    Some(info)
}
