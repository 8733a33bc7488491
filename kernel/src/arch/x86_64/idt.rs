//! Interrupt descriptor table: 256 gates, CPU exceptions in 0-31,
//! external vectors from 32 up. Gates are interrupt-type, so handlers run
//! with IF cleared.

use lazy_static::lazy_static;
use x86_64::structures::idt::{InterruptDescriptorTable, InterruptStackFrame, PageFaultErrorCode};

use core::sync::atomic::Ordering;

/// External interrupt vectors.
pub const VECTOR_TIMER: u8 = 32;
pub const VECTOR_KEYBOARD: u8 = 33;
pub const VECTOR_SPURIOUS: u8 = 0xFF;

lazy_static! {
    static ref IDT: InterruptDescriptorTable = {
        let mut idt = InterruptDescriptorTable::new();
        idt.breakpoint.set_handler_fn(breakpoint_handler);
        idt.page_fault.set_handler_fn(page_fault_handler);
        idt.general_protection_fault
            .set_handler_fn(general_protection_handler);
        idt.invalid_opcode.set_handler_fn(invalid_opcode_handler);
        idt.double_fault.set_handler_fn(double_fault_handler);
        idt[VECTOR_TIMER].set_handler_fn(timer_handler);
        idt[VECTOR_KEYBOARD].set_handler_fn(keyboard_handler);
        idt[VECTOR_SPURIOUS].set_handler_fn(spurious_handler);
        idt
    };
}

/// Load the IDT on the calling CPU.
pub fn init() {
    IDT.load();
}

extern "x86-interrupt" fn breakpoint_handler(frame: InterruptStackFrame) {
    log::warn!("breakpoint at {:?}", frame.instruction_pointer);
}

extern "x86-interrupt" fn invalid_opcode_handler(frame: InterruptStackFrame) {
    panic!("invalid opcode at {:?}", frame.instruction_pointer);
}

extern "x86-interrupt" fn general_protection_handler(frame: InterruptStackFrame, code: u64) {
    panic!(
        "general protection fault (code {:#x}) at {:?}",
        code, frame.instruction_pointer
    );
}

extern "x86-interrupt" fn page_fault_handler(
    frame: InterruptStackFrame,
    code: PageFaultErrorCode,
) {
    let addr = x86_64::registers::control::Cr2::read();
    panic!(
        "page fault at {:?} accessing {:?} ({:?})",
        frame.instruction_pointer, addr, code
    );
}

extern "x86-interrupt" fn double_fault_handler(frame: InterruptStackFrame, _code: u64) -> ! {
    panic!("double fault at {:?}", frame.instruction_pointer);
}

extern "x86-interrupt" fn timer_handler(_frame: InterruptStackFrame) {
    super::apic::eoi();
    let now = crate::sched::SCHEDULER_TICKS.fetch_add(1, Ordering::AcqRel) + 1;
    super::tsc::note_tick(now);

    let need_resched = crate::sched::with_table(|t| {
        let current = crate::sched::current_thread();
        t.tick(now, current)
    });
    if need_resched {
        crate::sched::schedule();
    }
}

extern "x86-interrupt" fn keyboard_handler(_frame: InterruptStackFrame) {
    crate::drivers::keyboard::irq();
    super::apic::eoi();
}

extern "x86-interrupt" fn spurious_handler(_frame: InterruptStackFrame) {}
