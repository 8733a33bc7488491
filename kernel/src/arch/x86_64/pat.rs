//! Page attribute table setup.
//!
//! PAT index 1 (selected by PWT alone) is reprogrammed from write-through
//! to write-combining, so framebuffer mappings can use
//! `PteFlags::WRITE_COMBINING` without touching MTRRs.

use x86_64::registers::model_specific::Msr;

const IA32_PAT: u32 = 0x277;
const PAT_WC: u64 = 0x01;

pub fn init() {
    let mut msr = Msr::new(IA32_PAT);
    unsafe {
        let mut pat = msr.read();
        pat = (pat & !0xFF00) | (PAT_WC << 8);
        msr.write(pat);
    }
    log::info!("pat: index 1 set to write-combining");
}
