//! Scheduler timer: the local APIC timer calibrated against the PIT,
//! armed periodic at ~10 ms.

use x86_64::instructions::port::Port;

use super::apic;
use super::idt::VECTOR_TIMER;

/// Scheduler tick period.
pub const TICK_MS: u64 = 10;

/// Divide-by-16 encoding for the LAPIC timer divide register.
const DIVIDE_BY_16: u32 = 0x3;

/// Busy-wait `ms` milliseconds on PIT channel 2 (one-shot, gate via port
/// 0x61). Only used during calibration.
fn pit_wait_ms(ms: u16) {
    let ticks = 1193u32 * ms as u32;
    unsafe {
        let mut gate: Port<u8> = Port::new(0x61);
        let mut cmd: Port<u8> = Port::new(0x43);
        let mut ch2: Port<u8> = Port::new(0x42);

        let old = gate.read();
        gate.write((old & !0x02) | 0x01);
        cmd.write(0xB2u8); // channel 2, lo/hi, one-shot
        ch2.write((ticks & 0xFF) as u8);
        ch2.write((ticks >> 8) as u8);

        // Pulse the gate to start the countdown.
        let v = gate.read();
        gate.write(v & !0x01);
        gate.write(v | 0x01);

        while gate.read() & 0x20 == 0 {
            core::hint::spin_loop();
        }
        gate.write(old);
    }
}

/// Calibrate the LAPIC timer and arm it periodic at [`TICK_MS`].
pub fn init() {
    // Count how far the LAPIC timer falls in 10 ms.
    apic::lapic_timer_arm(VECTOR_TIMER, 0x10000 /* masked */, DIVIDE_BY_16, u32::MAX);
    pit_wait_ms(TICK_MS as u16);
    let elapsed = u32::MAX - apic::lapic_timer_current();

    apic::lapic_timer_arm(VECTOR_TIMER, apic::TIMER_PERIODIC, DIVIDE_BY_16, elapsed);
    log::info!("timer: lapic periodic, {} counts per {} ms", elapsed, TICK_MS);
}
