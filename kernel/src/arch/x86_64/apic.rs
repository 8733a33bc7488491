//! Local APIC and I/O APIC.
//!
//! The legacy PIC is remapped and fully masked first; external IRQs are
//! steered through the I/O APIC with MADT interrupt source overrides
//! applied. The local APIC timer is armed separately by `timer`.

use core::sync::atomic::{AtomicU64, Ordering};

use pic8259::ChainedPics;
use spin::Mutex;

use crate::mm::{phys_to_virt, PhysAddr};

use super::acpi::MadtInfo;
use super::idt::{VECTOR_KEYBOARD, VECTOR_SPURIOUS};

const LAPIC_DEFAULT_BASE: u64 = 0xFEE0_0000;

// Local APIC register offsets.
const LAPIC_ID: u64 = 0x20;
const LAPIC_EOI: u64 = 0xB0;
const LAPIC_SVR: u64 = 0xF0;
const LAPIC_LVT_TIMER: u64 = 0x320;
const LAPIC_TIMER_INIT: u64 = 0x380;
const LAPIC_TIMER_CURRENT: u64 = 0x390;
const LAPIC_TIMER_DIVIDE: u64 = 0x3E0;

pub const TIMER_PERIODIC: u32 = 1 << 17;

static LAPIC_BASE: AtomicU64 = AtomicU64::new(LAPIC_DEFAULT_BASE);
static IOAPIC_BASE: AtomicU64 = AtomicU64::new(0);

static PICS: Mutex<ChainedPics> = Mutex::new(unsafe { ChainedPics::new(0x20, 0x28) });

fn lapic_ptr(reg: u64) -> *mut u32 {
    phys_to_virt(PhysAddr::new(LAPIC_BASE.load(Ordering::Relaxed) + reg)) as *mut u32
}

pub fn lapic_read(reg: u64) -> u32 {
    unsafe { core::ptr::read_volatile(lapic_ptr(reg)) }
}

pub fn lapic_write(reg: u64, value: u32) {
    unsafe { core::ptr::write_volatile(lapic_ptr(reg), value) }
}

pub fn lapic_id() -> u32 {
    lapic_read(LAPIC_ID) >> 24
}

/// Signal end-of-interrupt.
pub fn eoi() {
    lapic_write(LAPIC_EOI, 0);
}

/// Enable this CPU's local APIC (spurious vector + software enable).
pub fn lapic_enable() {
    lapic_write(LAPIC_SVR, 0x100 | VECTOR_SPURIOUS as u32);
}

/// Arm the local APIC timer.
pub fn lapic_timer_arm(vector: u8, mode: u32, divide: u32, initial: u32) {
    lapic_write(LAPIC_TIMER_DIVIDE, divide);
    lapic_write(LAPIC_LVT_TIMER, vector as u32 | mode);
    lapic_write(LAPIC_TIMER_INIT, initial);
}

pub fn lapic_timer_current() -> u32 {
    lapic_read(LAPIC_TIMER_CURRENT)
}

fn ioapic_read(reg: u32) -> u32 {
    let base = phys_to_virt(PhysAddr::new(IOAPIC_BASE.load(Ordering::Relaxed)));
    unsafe {
        core::ptr::write_volatile(base as *mut u32, reg);
        core::ptr::read_volatile(base.add(0x10) as *const u32)
    }
}

fn ioapic_write(reg: u32, value: u32) {
    let base = phys_to_virt(PhysAddr::new(IOAPIC_BASE.load(Ordering::Relaxed)));
    unsafe {
        core::ptr::write_volatile(base as *mut u32, reg);
        core::ptr::write_volatile(base.add(0x10) as *mut u32, value);
    }
}

/// Route one GSI to a vector on the given LAPIC.
fn ioapic_route(gsi: u32, vector: u8, dest_lapic: u32, active_low: bool, level: bool) {
    let reg = 0x10 + gsi * 2;
    let mut low = vector as u32;
    if active_low {
        low |= 1 << 13;
    }
    if level {
        low |= 1 << 15;
    }
    ioapic_write(reg + 1, dest_lapic << 24);
    ioapic_write(reg, low);
}

/// Legacy IRQ -> GSI with overrides applied.
fn irq_to_gsi(madt: &MadtInfo, irq: u8) -> (u32, bool, bool) {
    for ov in &madt.overrides {
        if ov.source_irq == irq {
            return (ov.gsi, ov.active_low, ov.level_triggered);
        }
    }
    (irq as u32, false, false)
}

/// Mask the PIC, enable the LAPIC, and route the IRQs this kernel uses
/// (keyboard) through the I/O APIC.
pub fn init(madt: &MadtInfo) {
    // Remap then fully mask the legacy PIC; the I/O APIC takes over.
    unsafe {
        let mut pics = PICS.lock();
        pics.initialize();
        pics.write_masks(0xFF, 0xFF);
    }

    if madt.lapic_base != 0 {
        LAPIC_BASE.store(madt.lapic_base, Ordering::Relaxed);
    }
    if madt.ioapic_base != 0 {
        IOAPIC_BASE.store(madt.ioapic_base, Ordering::Relaxed);
    }

    lapic_enable();
    let bsp = lapic_id();

    if IOAPIC_BASE.load(Ordering::Relaxed) != 0 {
        let max_redirs = (ioapic_read(1) >> 16) & 0xFF;
        let (kbd_gsi, low, level) = irq_to_gsi(madt, 1);
        if kbd_gsi <= max_redirs {
            ioapic_route(kbd_gsi, VECTOR_KEYBOARD, bsp, low, level);
        }
        log::info!(
            "apic: lapic {} ioapic at 0x{:x}, keyboard gsi {}",
            bsp,
            IOAPIC_BASE.load(Ordering::Relaxed),
            kbd_gsi
        );
    } else {
        log::warn!("apic: no I/O APIC found in MADT");
    }
}
