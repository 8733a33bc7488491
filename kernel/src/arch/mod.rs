//! Architecture support. Only x86-64 bare metal is populated; host builds
//! compile none of this.

#[cfg(all(target_arch = "x86_64", target_os = "none"))]
pub mod x86_64;
