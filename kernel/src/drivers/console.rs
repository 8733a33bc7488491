//! `/dev/console`: writes go to the kernel terminal (serial), reads come
//! from the decoded keyboard stream.

use crate::error::FsError;
use crate::fs::{IoctlValue, NodeType, VfsNode};

/// `TIOCGWINSZ`
pub const TIOCGWINSZ: u32 = 0x5413;

/// Nominal text geometry reported for the console.
const ROWS: u16 = 25;
const COLS: u16 = 80;

/// Write bytes to the terminal (also the FD-1/2 fallback path).
pub fn write_bytes(buf: &[u8]) {
    crate::print!("{}", alloc::string::String::from_utf8_lossy(buf));
}

pub struct ConsoleNode;

impl VfsNode for ConsoleNode {
    fn kind(&self) -> NodeType {
        NodeType::CharDevice
    }

    fn read(&self, _offset: u64, buf: &mut [u8]) -> Result<usize, FsError> {
        Ok(super::keyboard::read_line(buf))
    }

    fn write(&self, _offset: u64, buf: &[u8]) -> Result<usize, FsError> {
        write_bytes(buf);
        Ok(buf.len())
    }

    fn ioctl(&self, request: u32) -> Result<IoctlValue, FsError> {
        match request {
            TIOCGWINSZ => Ok(IoctlValue::WinSize {
                rows: ROWS,
                cols: COLS,
                xpixel: 0,
                ypixel: 0,
            }),
            _ => Err(FsError::BadIoctl),
        }
    }
}
