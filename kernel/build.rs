fn main() {
    // Bare-metal links need the higher-half layout and the Limine request
    // sections; host builds (tests) use the default linker.
    let target_os = std::env::var("CARGO_CFG_TARGET_OS").unwrap_or_default();
    if target_os == "none" {
        let dir = std::env::var("CARGO_MANIFEST_DIR").unwrap();
        println!("cargo:rustc-link-arg=-T{}/linker.ld", dir);
        println!("cargo:rerun-if-changed=linker.ld");
    }
}
