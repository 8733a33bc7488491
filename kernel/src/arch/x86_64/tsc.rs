//! TSC-based time: nanoseconds since calibration, with the scheduler tick
//! as the calibration heartbeat.

use core::sync::atomic::{AtomicU64, Ordering};

/// TSC increments per scheduler tick (measured), 0 until calibrated.
static TSC_PER_TICK: AtomicU64 = AtomicU64::new(0);
static TSC_AT_BOOT: AtomicU64 = AtomicU64::new(0);
static LAST_TICK_TSC: AtomicU64 = AtomicU64::new(0);

pub fn read() -> u64 {
    let lo: u32;
    let hi: u32;
    unsafe {
        core::arch::asm!("rdtsc", out("eax") lo, out("edx") hi, options(nomem, nostack));
    }
    ((hi as u64) << 32) | lo as u64
}

/// Called from the timer interrupt; measures the TSC rate after a few
/// ticks have elapsed.
pub fn note_tick(tick: u64) {
    let now = read();
    let prev = LAST_TICK_TSC.swap(now, Ordering::AcqRel);
    if tick == 1 {
        TSC_AT_BOOT.store(now, Ordering::Release);
    } else if prev != 0 && TSC_PER_TICK.load(Ordering::Acquire) == 0 && tick > 4 {
        TSC_PER_TICK.store(now.wrapping_sub(prev), Ordering::Release);
    }
}

/// Nanoseconds since boot per the TSC, or 0 before calibration.
pub fn nanos() -> u64 {
    let per_tick = TSC_PER_TICK.load(Ordering::Acquire);
    if per_tick == 0 {
        return 0;
    }
    let base = TSC_AT_BOOT.load(Ordering::Acquire);
    let elapsed = read().wrapping_sub(base);
    // per_tick counts cover TICK_MS milliseconds.
    elapsed.saturating_mul(super::timer::TICK_MS * 1_000_000) / per_tick
}

/// Busy-wait for `ns` nanoseconds (sub-tick sleeps).
pub fn sleep_ns(ns: u64) {
    let per_tick = TSC_PER_TICK.load(Ordering::Acquire);
    if per_tick == 0 {
        // Uncalibrated: crude spin.
        for _ in 0..ns / 10 {
            core::hint::spin_loop();
        }
        return;
    }
    let cycles = ns.saturating_mul(per_tick) / (super::timer::TICK_MS * 1_000_000);
    let start = read();
    while read().wrapping_sub(start) < cycles {
        core::hint::spin_loop();
    }
}
