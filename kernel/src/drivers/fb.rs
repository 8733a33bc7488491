//! `/dev/fb0`: the linear framebuffer as a device node.
//!
//! Exposes the geometry through ioctls and the physical base through the
//! mmap target so user programs can map the framebuffer `MAP_SHARED`.

use crate::error::FsError;
use crate::fs::{IoctlValue, MmapTarget, NodeType, VfsNode};

pub const FB_IOCTL_GET_WIDTH: u32 = 0x4600;
pub const FB_IOCTL_GET_HEIGHT: u32 = 0x4601;
pub const FB_IOCTL_GET_FBADDR: u32 = 0x4602;
pub const FB_IOCTL_GET_PITCH: u32 = 0x4603;

/// Boot-provided framebuffer description.
#[derive(Debug, Clone, Copy)]
pub struct FramebufferInfo {
    pub phys_base: u64,
    pub width: u32,
    pub height: u32,
    pub pitch: u32,
    pub bpp: u16,
}

pub struct FbNode {
    info: FramebufferInfo,
}

impl FbNode {
    pub fn new(info: FramebufferInfo) -> Self {
        Self { info }
    }
}

impl VfsNode for FbNode {
    fn kind(&self) -> NodeType {
        NodeType::CharDevice
    }

    fn size(&self) -> u64 {
        self.info.pitch as u64 * self.info.height as u64
    }

    fn write(&self, offset: u64, buf: &[u8]) -> Result<usize, FsError> {
        let len = self.size();
        if offset >= len {
            return Ok(0);
        }
        let n = buf.len().min((len - offset) as usize);
        let base = crate::mm::phys_to_virt(crate::mm::PhysAddr::new(self.info.phys_base));
        unsafe {
            core::ptr::copy_nonoverlapping(buf.as_ptr(), base.add(offset as usize), n);
        }
        Ok(n)
    }

    fn read(&self, offset: u64, buf: &mut [u8]) -> Result<usize, FsError> {
        let len = self.size();
        if offset >= len {
            return Ok(0);
        }
        let n = buf.len().min((len - offset) as usize);
        let base = crate::mm::phys_to_virt(crate::mm::PhysAddr::new(self.info.phys_base));
        unsafe {
            core::ptr::copy_nonoverlapping(base.add(offset as usize), buf.as_mut_ptr(), n);
        }
        Ok(n)
    }

    fn ioctl(&self, request: u32) -> Result<IoctlValue, FsError> {
        match request {
            FB_IOCTL_GET_WIDTH => Ok(IoctlValue::U32(self.info.width)),
            FB_IOCTL_GET_HEIGHT => Ok(IoctlValue::U32(self.info.height)),
            FB_IOCTL_GET_PITCH => Ok(IoctlValue::U32(self.info.pitch)),
            FB_IOCTL_GET_FBADDR => Ok(IoctlValue::U64(self.info.phys_base)),
            _ => Err(FsError::BadIoctl),
        }
    }

    fn mmap_target(&self) -> Option<MmapTarget> {
        Some(MmapTarget {
            phys_base: self.info.phys_base,
            len: self.size(),
        })
    }
}
