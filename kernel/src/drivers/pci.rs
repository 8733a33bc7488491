//! PCI configuration space access (legacy CAM via ports 0xCF8/0xCFC).

use x86_64::instructions::port::Port;

use crate::sync::with_irqs_disabled;

const CONFIG_ADDRESS: u16 = 0xCF8;
const CONFIG_DATA: u16 = 0xCFC;

/// One discovered PCI function.
#[derive(Debug, Clone, Copy)]
pub struct PciDevice {
    pub bus: u8,
    pub slot: u8,
    pub function: u8,
    pub vendor_id: u16,
    pub device_id: u16,
    pub class: u8,
    pub subclass: u8,
    pub prog_if: u8,
    pub bars: [u32; 6],
}

fn config_read32(bus: u8, slot: u8, function: u8, offset: u8) -> u32 {
    let address = 0x8000_0000u32
        | (bus as u32) << 16
        | (slot as u32) << 11
        | (function as u32) << 8
        | (offset as u32 & 0xFC);
    with_irqs_disabled(|| unsafe {
        Port::<u32>::new(CONFIG_ADDRESS).write(address);
        Port::<u32>::new(CONFIG_DATA).read()
    })
}

fn config_write32(bus: u8, slot: u8, function: u8, offset: u8, value: u32) {
    let address = 0x8000_0000u32
        | (bus as u32) << 16
        | (slot as u32) << 11
        | (function as u32) << 8
        | (offset as u32 & 0xFC);
    with_irqs_disabled(|| unsafe {
        Port::<u32>::new(CONFIG_ADDRESS).write(address);
        Port::<u32>::new(CONFIG_DATA).write(value);
    })
}

fn probe(bus: u8, slot: u8, function: u8) -> Option<PciDevice> {
    let id = config_read32(bus, slot, function, 0);
    let vendor_id = (id & 0xFFFF) as u16;
    if vendor_id == 0xFFFF {
        return None;
    }
    let class_reg = config_read32(bus, slot, function, 0x08);
    let mut bars = [0u32; 6];
    for (i, bar) in bars.iter_mut().enumerate() {
        *bar = config_read32(bus, slot, function, 0x10 + (i as u8) * 4);
    }
    Some(PciDevice {
        bus,
        slot,
        function,
        vendor_id,
        device_id: (id >> 16) as u16,
        class: (class_reg >> 24) as u8,
        subclass: (class_reg >> 16) as u8,
        prog_if: (class_reg >> 8) as u8,
        bars,
    })
}

/// First device matching `(class, subclass)`.
pub fn find_by_class(class: u8, subclass: u8) -> Option<PciDevice> {
    for bus in 0..=255u8 {
        for slot in 0..32u8 {
            let Some(dev) = probe(bus, slot, 0) else {
                continue;
            };
            // Multi-function devices expose more functions.
            let header = config_read32(bus, slot, 0, 0x0C);
            let functions = if header & 0x0080_0000 != 0 { 8 } else { 1 };
            for function in 0..functions {
                if let Some(dev) = probe(bus, slot, function) {
                    if dev.class == class && dev.subclass == subclass {
                        return Some(dev);
                    }
                }
            }
            let _ = dev;
        }
    }
    None
}

/// Set the bus-master bit in the command register.
pub fn enable_bus_mastering(dev: &PciDevice) {
    let cmd = config_read32(dev.bus, dev.slot, dev.function, 0x04);
    config_write32(dev.bus, dev.slot, dev.function, 0x04, cmd | 0x4);
}
