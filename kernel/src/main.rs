//! Kernel binary entry: Limine boot protocol requests and the jump into
//! `obsidian_kernel::kmain`.

#![cfg_attr(target_os = "none", no_std)]
#![cfg_attr(target_os = "none", no_main)]

#[cfg(all(target_arch = "x86_64", target_os = "none"))]
mod limine_boot {
    use limine::request::{
        ExecutableFileRequest, FramebufferRequest, HhdmRequest, MemoryMapRequest, MpRequest,
        RequestsEndMarker, RequestsStartMarker, RsdpRequest,
    };
    use limine::BaseRevision;

    use obsidian_kernel::boot::BootInfo;
    use obsidian_kernel::drivers::fb::FramebufferInfo;
    use obsidian_kernel::mm::MemoryRegion;

    #[used]
    #[link_section = ".requests_start_marker"]
    static START_MARKER: RequestsStartMarker = RequestsStartMarker::new();

    #[used]
    #[link_section = ".requests"]
    static BASE_REVISION: BaseRevision = BaseRevision::new();

    #[used]
    #[link_section = ".requests"]
    static FRAMEBUFFER: FramebufferRequest = FramebufferRequest::new();

    #[used]
    #[link_section = ".requests"]
    static HHDM: HhdmRequest = HhdmRequest::new();

    #[used]
    #[link_section = ".requests"]
    static MEMMAP: MemoryMapRequest = MemoryMapRequest::new();

    #[used]
    #[link_section = ".requests"]
    static RSDP: RsdpRequest = RsdpRequest::new();

    #[used]
    #[link_section = ".requests"]
    static MP: MpRequest = MpRequest::new();

    #[used]
    #[link_section = ".requests"]
    static EXECUTABLE: ExecutableFileRequest = ExecutableFileRequest::new();

    #[used]
    #[link_section = ".requests_end_marker"]
    static END_MARKER: RequestsEndMarker = RequestsEndMarker::new();

    #[no_mangle]
    extern "C" fn _start() -> ! {
        assert!(BASE_REVISION.is_supported());

        let hhdm = HHDM
            .get_response()
            .expect("boot: no HHDM response")
            .offset();

        let mut info = BootInfo::empty();
        info.hhdm_offset = hhdm;

        let memmap = MEMMAP.get_response().expect("boot: no memory map");
        for entry in memmap.entries() {
            info.push_region(MemoryRegion {
                base: entry.base,
                length: entry.length,
                usable: entry.entry_type == limine::memory_map::EntryType::USABLE,
            });
        }

        if let Some(fb_response) = FRAMEBUFFER.get_response() {
            if let Some(fb) = fb_response.framebuffers().next() {
                let virt = fb.addr() as u64;
                let phys = if virt >= hhdm { virt - hhdm } else { virt };
                info.framebuffer = Some(FramebufferInfo {
                    phys_base: phys,
                    width: fb.width() as u32,
                    height: fb.height() as u32,
                    pitch: fb.pitch() as u32,
                    bpp: fb.bpp(),
                });
            }
        }

        if let Some(rsdp) = RSDP.get_response() {
            let addr = rsdp.address() as u64;
            // Older revisions hand out a direct-map pointer; newer ones
            // the physical address.
            info.rsdp = Some(if addr >= hhdm { addr - hhdm } else { addr });
        }

        let mp = MP.get_response();
        if let Some(mp) = mp {
            info.bsp_lapic_id = mp.bsp_lapic_id();
        }

        if let Some(exec) = EXECUTABLE.get_response() {
            let file = exec.file();
            info.kernel_file = Some(unsafe {
                core::slice::from_raw_parts(file.addr(), file.size() as usize)
            });
        }

        obsidian_kernel::kmain(&info, mp)
    }
}

#[cfg(not(target_os = "none"))]
fn main() {
    println!("obsidian-kernel only runs on bare metal; use `cargo test` on the host.");
}
