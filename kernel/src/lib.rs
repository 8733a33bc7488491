//! ObsidianOS kernel library.
//!
//! Builds two ways: for `x86_64-unknown-none` this is the kernel proper;
//! on the host triple the hardware-independent subsystems (allocators,
//! page-table logic, buffer cache, filesystems, scheduler bookkeeping,
//! syscall validation) compile against std so `cargo test` exercises
//! them directly.

#![no_std]
#![cfg_attr(target_os = "none", feature(abi_x86_interrupt))]

extern crate alloc;

// Host target: the system allocator backs test code.
#[cfg(not(target_os = "none"))]
extern crate std;
#[cfg(not(target_os = "none"))]
#[global_allocator]
static SYSTEM_ALLOCATOR: std::alloc::System = std::alloc::System;

// Bare metal: the slab heap is the allocator.
#[cfg(all(target_arch = "x86_64", target_os = "none"))]
#[global_allocator]
static ALLOCATOR: mm::heap::LockedHeap = mm::heap::LockedHeap::new();

#[macro_use]
pub mod print;

pub mod arch;
pub mod block;
#[cfg(all(target_arch = "x86_64", target_os = "none"))]
pub mod boot;
#[cfg(all(target_arch = "x86_64", target_os = "none"))]
pub mod drivers;
pub mod elf;
pub mod error;
pub mod fs;
#[cfg(any(all(target_arch = "x86_64", target_os = "none"), test))]
pub mod ksyms;
pub mod logger;
pub mod mm;
pub mod sched;
pub mod sync;
pub mod syscall;

/// Kernel entry, called by the binary once boot information is gathered.
///
/// Initialization order is deliberate: memory first (PMM, VMM, heap),
/// then CPU tables and interrupt routing, then storage (IDE probes
/// before the backend selection), the block cache, filesystems, and
/// finally the scheduler and the first user process. The timer is armed
/// last so nothing is preempted half-initialized.
#[cfg(all(target_arch = "x86_64", target_os = "none"))]
pub fn kmain(
    info: &boot::BootInfo,
    mp: Option<&'static limine::response::MpResponse>,
) -> ! {
    use arch::x86_64 as cpu;

    logger::init();
    log::info!("obsidian: kernel starting");

    // Memory.
    mm::set_direct_map_offset(info.hhdm_offset);
    mm::pmm::init(info.memory_map());
    mm::vmm::init(info.hhdm_offset);
    mm::heap::init();
    cpu::pat::init();

    // Take over from the bootloader's page tables with our own copy of
    // the kernel half; this root becomes the template for every process.
    match mm::vmm::AddressSpace::new() {
        Ok(kernel_space) => {
            unsafe { kernel_space.switch() };
            mm::vmm::set_kernel_template(kernel_space.root());
            // The boot space stays live as the kernel's; never destroyed.
            core::mem::forget(kernel_space);
        }
        Err(e) => panic!("cannot build the kernel address space: {}", e),
    }

    #[cfg(feature = "kasan")]
    {
        // Shadow the first stretch of the direct map (heap territory).
        let window = 64 * 1024 * 1024;
        mm::kasan::init(info.hhdm_offset, window);
    }

    if let Some(kernel_elf) = info.kernel_file {
        ksyms::init(kernel_elf);
    }

    // CPU tables and interrupts.
    cpu::context::enable_simd();
    unsafe { cpu::smp::init_bsp(info.bsp_lapic_id) };
    cpu::idt::init();
    cpu::syscall::init();

    let madt = info
        .rsdp
        .and_then(cpu::acpi::parse_madt)
        .unwrap_or_default();
    cpu::apic::init(&madt);

    if let Some(mp) = mp {
        cpu::smp::boot_aps(mp.cpus(), info.bsp_lapic_id);
    }

    // Devices and storage. IDE probing must precede backend selection.
    drivers::keyboard::init();
    block::init();
    drivers::ide::init();
    drivers::ahci::init();
    drivers::storage_init();
    drivers::devices_init(info.framebuffer);
    drivers::mount_filesystems();

    // Processes.
    let kproc = sched::start();
    syscall::proc::spawn_init(&kproc);

    // Preemption on.
    cpu::timer::init();
    x86_64::instructions::interrupts::enable();

    log::info!("obsidian: boot complete");
    loop {
        cpu::idle_halt();
    }
}

/// Power off through the common hypervisor ports.
#[cfg(all(target_arch = "x86_64", target_os = "none"))]
pub fn shutdown() -> ! {
    use x86_64::instructions::port::Port;
    unsafe {
        Port::<u16>::new(0x604).write(0x2000u16); // QEMU
        Port::<u16>::new(0x4004).write(0x3400u16); // VirtualBox
        Port::<u16>::new(0xB004).write(0x2000u16); // Bochs
        Port::<u16>::new(0x600).write(0x34u16); // cloud hypervisors
    }
    arch::x86_64::halt_loop();
}

/// Reset through the 8042 controller.
#[cfg(all(target_arch = "x86_64", target_os = "none"))]
pub fn reboot() -> ! {
    use x86_64::instructions::port::Port;
    unsafe {
        let mut status: Port<u8> = Port::new(0x64);
        while status.read() & 0x02 != 0 {
            core::hint::spin_loop();
        }
        status.write(0xFEu8);
    }
    arch::x86_64::halt_loop();
}

/// Fail-stop: report, trace, and halt. Under the `qemu-exit` feature the
/// ISA debug-exit device reports the failure to CI instead of hanging it.
#[cfg(all(target_arch = "x86_64", target_os = "none"))]
#[panic_handler]
fn panic(info: &core::panic::PanicInfo) -> ! {
    x86_64::instructions::interrupts::disable();
    println!("\nKERNEL PANIC: {}", info);
    ksyms::print_backtrace();

    #[cfg(feature = "qemu-exit")]
    unsafe {
        use x86_64::instructions::port::Port;
        Port::<u32>::new(0xF4).write(0x11u32);
    }

    arch::x86_64::halt_loop();
}
