// Print macros for kernel output

#[cfg(all(target_arch = "x86_64", target_os = "none"))]
#[macro_export]
macro_rules! print {
    ($($arg:tt)*) => ($crate::arch::x86_64::serial::_print(format_args!($($arg)*)));
}

#[cfg(all(target_arch = "x86_64", target_os = "none"))]
#[macro_export]
macro_rules! println {
    () => ($crate::print!("\n"));
    ($($arg:tt)*) => ($crate::print!("{}\n", format_args!($($arg)*)));
}

// Host builds route kernel output to the process stdout so unit tests can
// print diagnostics.
#[cfg(not(all(target_arch = "x86_64", target_os = "none")))]
#[macro_export]
macro_rules! print {
    ($($arg:tt)*) => (::std::print!($($arg)*));
}

#[cfg(not(all(target_arch = "x86_64", target_os = "none")))]
#[macro_export]
macro_rules! println {
    () => (::std::println!());
    ($($arg:tt)*) => (::std::println!($($arg)*));
}
