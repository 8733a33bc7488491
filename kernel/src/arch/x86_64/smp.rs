//! SMP bring-up.
//!
//! The bootstrap processor installs its per-CPU block and keeps running;
//! application processors get a per-CPU block through the boot protocol's
//! extra-argument word, install their descriptors and local APIC, and
//! halt — no user work is scheduled on them in this release.

use core::sync::atomic::{AtomicUsize, Ordering};

use limine::mp::Cpu;

use super::{apic, gdt, idt, percpu, syscall};

static CPUS_STARTED: AtomicUsize = AtomicUsize::new(0);

pub fn started_count() -> usize {
    CPUS_STARTED.load(Ordering::Acquire)
}

/// Install per-CPU state on the bootstrap processor.
///
/// # Safety
/// Call once, early, on the BSP.
pub unsafe fn init_bsp(lapic_id: u32) {
    unsafe {
        let block = percpu::install(0, lapic_id);
        gdt::init(&mut *block);
    }
    CPUS_STARTED.fetch_add(1, Ordering::AcqRel);
}

/// AP entry: descriptors, local APIC, syscall MSRs, then halt.
pub extern "C" fn ap_main(cpu: &Cpu) -> ! {
    super::context::enable_simd();
    let index = cpu.extra.load(Ordering::Acquire) as usize;
    unsafe {
        let block = percpu::install(index, cpu.lapic_id);
        gdt::init(&mut *block);
    }
    idt::init();
    apic::lapic_enable();
    syscall::init();

    CPUS_STARTED.fetch_add(1, Ordering::AcqRel);
    super::halt_loop();
}

/// Hand every AP its trampoline and per-CPU block.
pub fn boot_aps(cpus: &[&Cpu], bsp_lapic_id: u32) {
    let mut index = 1usize;
    for cpu in cpus {
        if cpu.lapic_id == bsp_lapic_id {
            continue;
        }
        if index >= percpu::MAX_CPUS {
            log::warn!("smp: more CPUs than MAX_CPUS, ignoring the rest");
            break;
        }
        cpu.extra.store(index as u64, Ordering::Release);
        cpu.goto_address.write(ap_main);
        index += 1;
    }
    log::info!("smp: released {} application processor(s)", index - 1);
}
