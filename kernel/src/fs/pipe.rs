//! In-kernel pipes.
//!
//! A bounded ring buffer shared by a read end and a write end, each a VFS
//! node. Readers block (yielding) while the pipe is empty and a writer is
//! still open; writers block while it is full and a reader remains. A
//! write after the last reader closed returns 0 (broken pipe). The ring
//! is freed when the last handle to either end drops.

use alloc::sync::Arc;

use spin::Mutex;

use crate::error::FsError;

use super::{NodeRef, NodeType, VfsNode};

/// Ring capacity in bytes.
pub const PIPE_BUF_SIZE: usize = 4096;

struct PipeInner {
    buf: [u8; PIPE_BUF_SIZE],
    read_pos: usize,
    write_pos: usize,
    count: usize,
    read_open: u32,
    write_open: u32,
}

struct Pipe {
    inner: Mutex<PipeInner>,
}

impl Pipe {
    fn new() -> Arc<Pipe> {
        Arc::new(Pipe {
            inner: Mutex::new(PipeInner {
                buf: [0; PIPE_BUF_SIZE],
                read_pos: 0,
                write_pos: 0,
                count: 0,
                read_open: 0,
                write_open: 0,
            }),
        })
    }
}

fn pipe_yield() {
    #[cfg(all(target_arch = "x86_64", target_os = "none"))]
    crate::sched::yield_now();
    #[cfg(not(all(target_arch = "x86_64", target_os = "none")))]
    ::std::thread::yield_now();
}

/// One end of a pipe.
pub struct PipeEnd {
    pipe: Arc<Pipe>,
    writable: bool,
}

/// Create a connected `(read_end, write_end)` pair. End counters start at
/// zero; each descriptor install runs the `open` hook.
pub fn create() -> (NodeRef, NodeRef) {
    let pipe = Pipe::new();
    let read_end: NodeRef = Arc::new(PipeEnd {
        pipe: pipe.clone(),
        writable: false,
    });
    let write_end: NodeRef = Arc::new(PipeEnd {
        pipe,
        writable: true,
    });
    (read_end, write_end)
}

impl VfsNode for PipeEnd {
    fn kind(&self) -> NodeType {
        NodeType::Pipe
    }

    fn open(&self) {
        let mut inner = self.pipe.inner.lock();
        if self.writable {
            inner.write_open += 1;
        } else {
            inner.read_open += 1;
        }
    }

    fn close(&self) {
        let mut inner = self.pipe.inner.lock();
        if self.writable {
            inner.write_open = inner.write_open.saturating_sub(1);
        } else {
            inner.read_open = inner.read_open.saturating_sub(1);
        }
    }

    fn read(&self, _offset: u64, buf: &mut [u8]) -> Result<usize, FsError> {
        if self.writable {
            return Err(FsError::NotSupported);
        }
        if buf.is_empty() {
            return Ok(0);
        }
        loop {
            {
                let mut inner = self.pipe.inner.lock();
                if inner.count > 0 {
                    let mut n = 0;
                    while n < buf.len() && inner.count > 0 {
                        buf[n] = inner.buf[inner.read_pos];
                        inner.read_pos = (inner.read_pos + 1) % PIPE_BUF_SIZE;
                        inner.count -= 1;
                        n += 1;
                    }
                    return Ok(n);
                }
                if inner.write_open == 0 {
                    return Ok(0); // EOF
                }
            }
            pipe_yield();
        }
    }

    fn write(&self, _offset: u64, buf: &[u8]) -> Result<usize, FsError> {
        if !self.writable {
            return Err(FsError::NotSupported);
        }
        if buf.is_empty() {
            return Ok(0);
        }
        let mut written = 0;
        loop {
            {
                let mut inner = self.pipe.inner.lock();
                if inner.read_open == 0 {
                    // Broken pipe: the bytes have nowhere to go.
                    return Ok(written);
                }
                while written < buf.len() && inner.count < PIPE_BUF_SIZE {
                    let pos = inner.write_pos;
                    inner.buf[pos] = buf[written];
                    inner.write_pos = (pos + 1) % PIPE_BUF_SIZE;
                    inner.count += 1;
                    written += 1;
                }
                if written == buf.len() {
                    return Ok(written);
                }
            }
            pipe_yield();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pair() -> (NodeRef, NodeRef) {
        let (r, w) = create();
        r.open();
        w.open();
        (r, w)
    }

    #[test]
    fn bytes_cross_the_pipe_in_order() {
        let (r, w) = pair();
        assert_eq!(w.write(0, b"Hello, pipe\n").unwrap(), 12);
        let mut out = [0u8; 12];
        assert_eq!(r.read(0, &mut out).unwrap(), 12);
        assert_eq!(&out, b"Hello, pipe\n");
    }

    #[test]
    fn read_after_writer_close_is_eof() {
        let (r, w) = pair();
        w.write(0, b"tail").unwrap();
        w.close();
        let mut out = [0u8; 8];
        assert_eq!(r.read(0, &mut out).unwrap(), 4);
        assert_eq!(r.read(0, &mut out).unwrap(), 0, "EOF after drain");
    }

    #[test]
    fn write_after_reader_close_is_broken_pipe() {
        let (r, w) = pair();
        r.close();
        assert_eq!(w.write(0, b"lost").unwrap(), 0);
    }

    #[test]
    fn ring_wraps_around() {
        let (r, w) = pair();
        let chunk = [0xABu8; PIPE_BUF_SIZE - 10];
        assert_eq!(w.write(0, &chunk).unwrap(), chunk.len());
        let mut sink = [0u8; PIPE_BUF_SIZE - 10];
        r.read(0, &mut sink).unwrap();

        // Positions are now deep into the ring; this write wraps.
        let tagged: [u8; 64] = core::array::from_fn(|i| i as u8);
        assert_eq!(w.write(0, &tagged).unwrap(), 64);
        let mut out = [0u8; 64];
        assert_eq!(r.read(0, &mut out).unwrap(), 64);
        assert_eq!(out, tagged);
    }

    #[test]
    fn writer_blocks_until_reader_drains() {
        let (r, w) = pair();
        let big = ::std::vec![0x5Au8; PIPE_BUF_SIZE + 100];

        let writer = {
            let w = w.clone();
            ::std::thread::spawn(move || w.write(0, &big).unwrap())
        };

        let mut got = 0;
        let mut out = [0u8; 512];
        while got < PIPE_BUF_SIZE + 100 {
            got += r.read(0, &mut out).unwrap();
        }
        assert_eq!(writer.join().unwrap(), PIPE_BUF_SIZE + 100);
        assert_eq!(got, PIPE_BUF_SIZE + 100);
    }

    #[test]
    fn reader_sees_writer_from_another_thread() {
        let (r, w) = pair();
        let t = ::std::thread::spawn(move || {
            w.write(0, b"Hello, pipe\n").unwrap();
            w.close();
        });
        let mut out = [0u8; 12];
        assert_eq!(r.read(0, &mut out).unwrap(), 12);
        assert_eq!(&out, b"Hello, pipe\n");
        t.join().unwrap();
    }
}
