//! Kernel symbol table, recovered from the boot-provided kernel ELF, and
//! the frame-pointer walker the panic path uses to print a stack trace.

use alloc::string::String;
use alloc::vec::Vec;

use spin::Once;

struct Symbol {
    addr: u64,
    size: u64,
    name: String,
}

static SYMBOLS: Once<Vec<Symbol>> = Once::new();

fn le16(b: &[u8], off: usize) -> u16 {
    u16::from_le_bytes(b[off..off + 2].try_into().unwrap())
}

fn le32(b: &[u8], off: usize) -> u32 {
    u32::from_le_bytes(b[off..off + 4].try_into().unwrap())
}

fn le64(b: &[u8], off: usize) -> u64 {
    u64::from_le_bytes(b[off..off + 8].try_into().unwrap())
}

/// Parse the `.symtab` of the kernel's own image.
pub fn init(kernel_elf: &[u8]) {
    SYMBOLS.call_once(|| {
        let mut symbols = Vec::new();
        if kernel_elf.len() < 64 || &kernel_elf[0..4] != b"\x7FELF" {
            return symbols;
        }
        let shoff = le64(kernel_elf, 40) as usize;
        let shentsize = le16(kernel_elf, 58) as usize;
        let shnum = le16(kernel_elf, 60) as usize;
        if shentsize < 64 || shoff + shnum * shentsize > kernel_elf.len() {
            return symbols;
        }

        for i in 0..shnum {
            let sh = &kernel_elf[shoff + i * shentsize..];
            if le32(sh, 4) != 2 {
                continue; // SHT_SYMTAB
            }
            let sym_off = le64(sh, 24) as usize;
            let sym_size = le64(sh, 32) as usize;
            let strtab_idx = le32(sh, 40) as usize;
            let entsize = le64(sh, 56) as usize;
            if entsize < 24 || strtab_idx >= shnum {
                continue;
            }
            let str_sh = &kernel_elf[shoff + strtab_idx * shentsize..];
            let str_off = le64(str_sh, 24) as usize;
            let str_size = le64(str_sh, 32) as usize;
            if str_off + str_size > kernel_elf.len() || sym_off + sym_size > kernel_elf.len() {
                continue;
            }
            let strtab = &kernel_elf[str_off..str_off + str_size];

            for s in (0..sym_size / entsize).map(|k| &kernel_elf[sym_off + k * entsize..]) {
                if s[4] & 0xF != 2 {
                    continue; // STT_FUNC
                }
                let name_off = le32(s, 0) as usize;
                if name_off >= strtab.len() {
                    continue;
                }
                let name_end = strtab[name_off..]
                    .iter()
                    .position(|&c| c == 0)
                    .map(|p| name_off + p)
                    .unwrap_or(strtab.len());
                symbols.push(Symbol {
                    addr: le64(s, 8),
                    size: le64(s, 16),
                    name: String::from_utf8_lossy(&strtab[name_off..name_end]).into_owned(),
                });
            }
        }
        symbols.sort_by_key(|s| s.addr);
        symbols
    });
    log::info!(
        "ksyms: {} function symbols",
        SYMBOLS.get().map(Vec::len).unwrap_or(0)
    );
}

/// The symbol containing `addr`, with the offset into it.
pub fn resolve(addr: u64) -> Option<(&'static str, u64)> {
    let symbols = SYMBOLS.get()?;
    let idx = symbols.partition_point(|s| s.addr <= addr).checked_sub(1)?;
    let sym = &symbols[idx];
    if sym.size != 0 && addr >= sym.addr + sym.size {
        return None;
    }
    Some((&sym.name, addr - sym.addr))
}

/// Print a frame-pointer backtrace starting from the caller.
#[cfg(all(target_arch = "x86_64", target_os = "none"))]
pub fn print_backtrace() {
    let mut rbp: u64;
    unsafe { core::arch::asm!("mov {}, rbp", out(reg) rbp, options(nostack)) };

    crate::println!("backtrace:");
    for depth in 0..16 {
        if rbp == 0 || rbp & 0x7 != 0 {
            break;
        }
        let ret = unsafe { *((rbp + 8) as *const u64) };
        if ret == 0 {
            break;
        }
        match resolve(ret) {
            Some((name, off)) => {
                crate::println!("  #{:02} {:#018x} {} + {:#x}", depth, ret, name, off)
            }
            None => crate::println!("  #{:02} {:#018x} ???", depth, ret),
        }
        rbp = unsafe { *(rbp as *const u64) };
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolves_symbols_from_a_crafted_symtab() {
        // ELF with one symtab section of one function symbol.
        let mut img = alloc::vec![0u8; 0x300];
        img[0..4].copy_from_slice(b"\x7FELF");
        img[40..48].copy_from_slice(&0x100u64.to_le_bytes()); // e_shoff
        img[58..60].copy_from_slice(&64u16.to_le_bytes()); // e_shentsize
        img[60..62].copy_from_slice(&2u16.to_le_bytes()); // e_shnum

        // Section 0: symtab.
        let sh0 = 0x100;
        img[sh0 + 4..sh0 + 8].copy_from_slice(&2u32.to_le_bytes()); // SHT_SYMTAB
        img[sh0 + 24..sh0 + 32].copy_from_slice(&0x200u64.to_le_bytes()); // offset
        img[sh0 + 32..sh0 + 40].copy_from_slice(&24u64.to_le_bytes()); // size
        img[sh0 + 40..sh0 + 44].copy_from_slice(&1u32.to_le_bytes()); // strtab link
        img[sh0 + 56..sh0 + 64].copy_from_slice(&24u64.to_le_bytes()); // entsize

        // Section 1: strtab at 0x240.
        let sh1 = 0x140;
        img[sh1 + 4..sh1 + 8].copy_from_slice(&3u32.to_le_bytes());
        img[sh1 + 24..sh1 + 32].copy_from_slice(&0x240u64.to_le_bytes());
        img[sh1 + 32..sh1 + 40].copy_from_slice(&16u64.to_le_bytes());

        // Symbol: "kmain" at 0xffffffff80001000, size 0x40.
        let sym = 0x200;
        img[sym..sym + 4].copy_from_slice(&1u32.to_le_bytes()); // name offset
        img[sym + 4] = 2; // STT_FUNC
        img[sym + 8..sym + 16].copy_from_slice(&0xFFFF_FFFF_8000_1000u64.to_le_bytes());
        img[sym + 16..sym + 24].copy_from_slice(&0x40u64.to_le_bytes());
        img[0x241..0x246].copy_from_slice(b"kmain");

        init(&img);
        let (name, off) = resolve(0xFFFF_FFFF_8000_1010).unwrap();
        assert_eq!(name, "kmain");
        assert_eq!(off, 0x10);
        assert!(resolve(0xFFFF_FFFF_8000_2000).is_none());
    }
}
