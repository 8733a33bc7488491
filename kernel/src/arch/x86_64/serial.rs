//! COM1 serial output; the sink for `print!` and the logger.

use core::fmt;

use lazy_static::lazy_static;
use spin::Mutex;
use uart_16550::SerialPort;

lazy_static! {
    static ref COM1: Mutex<SerialPort> = {
        let mut port = unsafe { SerialPort::new(0x3F8) };
        port.init();
        Mutex::new(port)
    };
}

#[doc(hidden)]
pub fn _print(args: fmt::Arguments) {
    use fmt::Write;
    // Interrupt handlers print too; keep the lock irq-safe.
    crate::sync::with_irqs_disabled(|| {
        let _ = COM1.lock().write_fmt(args);
    });
}
