//! File and filesystem system calls.
//!
//! Handlers take the namespace and the calling process explicitly; the
//! dispatcher passes the globals. Buffers arrive as kernel-visible slices
//! that the dispatcher has already validated.

use alloc::string::String;
use alloc::sync::Arc;

use spin::Mutex;

use crate::error::{FsError, KernelError, KernelResult};
use crate::fs::{
    path, pipe, DirEntry, Namespace, NodeType, OpenFile, OpenFlags, Stat,
};
use crate::fs::IoctlValue;
use crate::sched::Process;

/// Resolve `p` against the process cwd into a normalized absolute path.
fn absolute(proc: &Process, p: &str) -> String {
    let cwd = proc.cwd.lock();
    path::absolute(&cwd, p)
}

pub fn open(ns: &Namespace, proc: &Arc<Process>, p: &str, flags: u32) -> KernelResult<usize> {
    if p.is_empty() {
        return Err(KernelError::InvalidPath);
    }
    let flags = OpenFlags::new(flags);
    let abs = absolute(proc, p);

    let node = match ns.resolve(&abs) {
        Ok(node) => node,
        Err(_) if flags.create() => {
            ns.mknod(&abs, NodeType::File, 0)?;
            ns.resolve(&abs)?
        }
        Err(e) => return Err(e.into()),
    };

    if flags.truncate() && node.kind() == NodeType::File {
        if !flags.writable() {
            return Err(KernelError::PermissionDenied);
        }
        node.truncate()?;
    }

    let mut file = OpenFile::open(node, flags);
    if flags.append() {
        file.offset = file.node.size();
    }
    proc.files
        .lock()
        .install_lowest(Arc::new(Mutex::new(file)), 3)
}

pub fn close(proc: &Arc<Process>, fd: usize) -> KernelResult<()> {
    proc.files.lock().close(fd)
}

pub fn dup(proc: &Arc<Process>, fd: usize) -> KernelResult<usize> {
    proc.files.lock().dup(fd)
}

/// Allocate a pipe pair into the two lowest free descriptors, read end
/// first.
pub fn make_pipe(proc: &Arc<Process>) -> KernelResult<(usize, usize)> {
    let (read_end, write_end) = pipe::create();
    let mut files = proc.files.lock();
    let read_fd = files.install_lowest(
        Arc::new(Mutex::new(OpenFile::open(read_end, OpenFlags::new(OpenFlags::RDONLY)))),
        3,
    )?;
    let write_fd = match files.install_lowest(
        Arc::new(Mutex::new(OpenFile::open(write_end, OpenFlags::new(OpenFlags::WRONLY)))),
        3,
    ) {
        Ok(fd) => fd,
        Err(e) => {
            let _ = files.close(read_fd);
            return Err(e);
        }
    };
    Ok((read_fd, write_fd))
}

pub fn read(proc: &Arc<Process>, fd: usize, buf: &mut [u8]) -> KernelResult<usize> {
    let file = match proc.files.lock().get(fd) {
        Ok(file) => file,
        Err(e) => {
            // FD 0 without a descriptor falls back to the keyboard.
            if fd == 0 {
                return Ok(read_keyboard(buf));
            }
            return Err(e);
        }
    };

    let (node, offset, flags) = {
        let f = file.lock();
        (f.node.clone(), f.offset, f.flags)
    };
    if !flags.readable() {
        return Err(KernelError::PermissionDenied);
    }
    let n = node.read(offset, buf)?;
    file.lock().offset += n as u64;
    Ok(n)
}

pub fn write(proc: &Arc<Process>, fd: usize, buf: &[u8]) -> KernelResult<usize> {
    let file = match proc.files.lock().get(fd) {
        Ok(file) => file,
        Err(e) => {
            // FD 1/2 without a descriptor go to the terminal.
            if fd == 1 || fd == 2 {
                return Ok(write_terminal(buf));
            }
            return Err(e);
        }
    };

    let (node, mut offset, flags) = {
        let f = file.lock();
        (f.node.clone(), f.offset, f.flags)
    };
    if !flags.writable() {
        return Err(KernelError::PermissionDenied);
    }
    if flags.append() {
        offset = node.size();
    }
    let n = node.write(offset, buf)?;
    file.lock().offset = offset + n as u64;
    Ok(n)
}

/// One directory entry at the descriptor's offset; advances the offset.
pub fn readdir(proc: &Arc<Process>, fd: usize, out: &mut DirEntry) -> KernelResult<bool> {
    let file = proc.files.lock().get(fd)?;
    let (node, index) = {
        let f = file.lock();
        (f.node.clone(), f.offset as usize)
    };
    match node.readdir(index)? {
        Some(entry) => {
            *out = entry;
            file.lock().offset += 1;
            Ok(true)
        }
        None => Ok(false),
    }
}

pub fn stat(ns: &Namespace, proc: &Arc<Process>, p: &str) -> KernelResult<Stat> {
    let abs = absolute(proc, p);
    let node = ns.resolve(&abs)?;
    Ok(node.stat())
}

pub fn fstat(proc: &Arc<Process>, fd: usize) -> KernelResult<Stat> {
    let file = proc.files.lock().get(fd)?;
    let node = file.lock().node.clone();
    Ok(node.stat())
}

pub fn link(ns: &Namespace, proc: &Arc<Process>, old: &str, new: &str) -> KernelResult<()> {
    if old.is_empty() || new.is_empty() {
        return Err(KernelError::InvalidPath);
    }
    ns.link(&absolute(proc, old), &absolute(proc, new))
        .map_err(Into::into)
}

pub fn unlink(ns: &Namespace, proc: &Arc<Process>, p: &str) -> KernelResult<()> {
    if p.is_empty() {
        return Err(KernelError::InvalidPath);
    }
    let abs = absolute(proc, p);
    if abs == "/" {
        return Err(KernelError::PermissionDenied);
    }
    ns.unlink(&abs).map_err(Into::into)
}

pub fn chdir(ns: &Namespace, proc: &Arc<Process>, p: &str) -> KernelResult<()> {
    if p.is_empty() {
        return Err(KernelError::InvalidPath);
    }
    let abs = absolute(proc, p);
    let node = ns.resolve(&abs)?;
    if node.kind() != NodeType::Directory {
        return Err(KernelError::Fs(FsError::NotADirectory));
    }
    *proc.cwd.lock() = abs;
    Ok(())
}

pub fn getcwd(proc: &Arc<Process>, out: &mut [u8]) -> KernelResult<usize> {
    let cwd = proc.cwd.lock();
    let bytes = cwd.as_bytes();
    if bytes.len() + 1 > out.len() {
        return Err(KernelError::InvalidArgument);
    }
    out[..bytes.len()].copy_from_slice(bytes);
    out[bytes.len()] = 0;
    Ok(bytes.len())
}

pub fn mknod(ns: &Namespace, proc: &Arc<Process>, p: &str, kind: u32, dev: u32) -> KernelResult<()> {
    let kind = NodeType::from_raw(kind).ok_or(KernelError::InvalidArgument)?;
    ns.mknod(&absolute(proc, p), kind, dev).map_err(Into::into)
}

pub fn ioctl(proc: &Arc<Process>, fd: usize, request: u32) -> KernelResult<IoctlValue> {
    let file = proc.files.lock().get(fd)?;
    let node = file.lock().node.clone();
    node.ioctl(request).map_err(Into::into)
}

/// `lseek`. Descriptors 0-2 and pipes are not seekable.
pub fn lseek(proc: &Arc<Process>, fd: usize, offset: i64, whence: u32) -> KernelResult<i64> {
    if fd < 3 {
        return Err(KernelError::InvalidFd);
    }
    let file = proc.files.lock().get(fd)?;
    let mut f = file.lock();
    if f.node.kind() == NodeType::Pipe {
        return Err(KernelError::Fs(FsError::NotSupported));
    }
    let base: i64 = match whence {
        0 => 0,                     // SEEK_SET
        1 => f.offset as i64,       // SEEK_CUR
        2 => f.node.size() as i64,  // SEEK_END
        _ => return Err(KernelError::InvalidArgument),
    };
    let target = base + offset;
    if target < 0 {
        return Err(KernelError::InvalidArgument);
    }
    f.offset = target as u64;
    Ok(target)
}

fn read_keyboard(buf: &mut [u8]) -> usize {
    #[cfg(all(target_arch = "x86_64", target_os = "none"))]
    {
        crate::drivers::keyboard::read_line(buf)
    }
    #[cfg(not(all(target_arch = "x86_64", target_os = "none")))]
    {
        let _ = buf;
        0
    }
}

fn write_terminal(buf: &[u8]) -> usize {
    #[cfg(all(target_arch = "x86_64", target_os = "none"))]
    {
        crate::drivers::console::write_bytes(buf);
    }
    #[cfg(not(all(target_arch = "x86_64", target_os = "none")))]
    {
        crate::print!("{}", String::from_utf8_lossy(buf));
    }
    buf.len()
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::string::ToString;
    use crate::block::bio::BlockIo;
    use crate::fs::ext2::testfs::{mount_image, ImageSpec};
    use crate::sched::ProcTable;

    fn setup() -> (Namespace, Arc<Process>) {
        let io = BlockIo::new();
        let vol = mount_image(&io, 0, &ImageSpec::default());
        let ns = Namespace::new();
        ns.mount_root(vol.root().unwrap());

        let mut table = ProcTable::new();
        let proc = table.create_process("test", None, "/".to_string());
        (ns, proc)
    }

    #[test]
    fn open_create_write_read_close() {
        let (ns, proc) = setup();
        let fd = open(
            &ns,
            &proc,
            "/notes.txt",
            OpenFlags::RDWR | OpenFlags::CREATE,
        )
        .unwrap();
        assert!(fd >= 3);

        assert_eq!(write(&proc, fd, b"first line\n").unwrap(), 11);
        // The descriptor offset advanced; rewind through lseek.
        assert_eq!(lseek(&proc, fd, 0, 0).unwrap(), 0);
        let mut back = [0u8; 11];
        assert_eq!(read(&proc, fd, &mut back).unwrap(), 11);
        assert_eq!(&back, b"first line\n");

        close(&proc, fd).unwrap();
        assert_eq!(close(&proc, fd), Err(KernelError::InvalidFd));
    }

    #[test]
    fn open_without_create_fails_on_missing_files() {
        let (ns, proc) = setup();
        assert!(open(&ns, &proc, "/missing", OpenFlags::RDONLY).is_err());
    }

    #[test]
    fn append_mode_writes_at_the_end() {
        let (ns, proc) = setup();
        let fd = open(&ns, &proc, "/log", OpenFlags::RDWR | OpenFlags::CREATE).unwrap();
        write(&proc, fd, b"aaa").unwrap();
        close(&proc, fd).unwrap();

        let fd = open(
            &ns,
            &proc,
            "/log",
            OpenFlags::WRONLY | OpenFlags::APPEND,
        )
        .unwrap();
        write(&proc, fd, b"bbb").unwrap();
        close(&proc, fd).unwrap();

        let fd = open(&ns, &proc, "/log", OpenFlags::RDONLY).unwrap();
        let mut back = [0u8; 6];
        read(&proc, fd, &mut back).unwrap();
        assert_eq!(&back, b"aaabbb");
    }

    #[test]
    fn truncate_requires_write_access() {
        let (ns, proc) = setup();
        let fd = open(&ns, &proc, "/t", OpenFlags::RDWR | OpenFlags::CREATE).unwrap();
        write(&proc, fd, b"body").unwrap();
        close(&proc, fd).unwrap();

        assert_eq!(
            open(&ns, &proc, "/t", OpenFlags::RDONLY | OpenFlags::TRUNC),
            Err(KernelError::PermissionDenied)
        );
        let fd = open(&ns, &proc, "/t", OpenFlags::RDWR | OpenFlags::TRUNC).unwrap();
        assert_eq!(fstat(&proc, fd).unwrap().size, 0);
    }

    #[test]
    fn pipe_pair_crosses_data_between_descriptors() {
        let (_ns, proc) = setup();
        let (r, w) = make_pipe(&proc).unwrap();
        assert!(r >= 3 && w > r);

        assert_eq!(write(&proc, w, b"Hello, pipe\n").unwrap(), 12);
        let mut back = [0u8; 12];
        assert_eq!(read(&proc, r, &mut back).unwrap(), 12);
        assert_eq!(&back, b"Hello, pipe\n");

        // Pipes refuse lseek.
        assert!(lseek(&proc, r, 0, 0).is_err());

        close(&proc, w).unwrap();
        assert_eq!(read(&proc, r, &mut back).unwrap(), 0, "EOF after close");
    }

    #[test]
    fn dup_shares_offset_between_descriptors() {
        let (ns, proc) = setup();
        let fd = open(&ns, &proc, "/d", OpenFlags::RDWR | OpenFlags::CREATE).unwrap();
        write(&proc, fd, b"0123456789").unwrap();
        lseek(&proc, fd, 4, 0).unwrap();

        let dup_fd = dup(&proc, fd).unwrap();
        let mut one = [0u8; 2];
        read(&proc, dup_fd, &mut one).unwrap();
        assert_eq!(&one, b"45");
        // The original descriptor sees the shared advance.
        read(&proc, fd, &mut one).unwrap();
        assert_eq!(&one, b"67");
    }

    #[test]
    fn readdir_walks_entries_in_order() {
        let (ns, proc) = setup();
        for name in ["/a", "/b"] {
            let fd = open(&ns, &proc, name, OpenFlags::RDWR | OpenFlags::CREATE).unwrap();
            close(&proc, fd).unwrap();
        }
        let dirfd = open(&ns, &proc, "/", OpenFlags::RDONLY).unwrap();
        let mut entry = DirEntry {
            name: String::new(),
            ino: 0,
        };
        assert!(readdir(&proc, dirfd, &mut entry).unwrap());
        assert_eq!(entry.name, "a");
        assert!(readdir(&proc, dirfd, &mut entry).unwrap());
        assert_eq!(entry.name, "b");
        assert!(!readdir(&proc, dirfd, &mut entry).unwrap());
    }

    #[test]
    fn chdir_and_getcwd_round_trip() {
        let (ns, proc) = setup();
        ns.mknod("/home", NodeType::Directory, 0).unwrap();
        chdir(&ns, &proc, "/home").unwrap();

        let mut buf = [0u8; 32];
        let n = getcwd(&proc, &mut buf).unwrap();
        assert_eq!(&buf[..n], b"/home");
        assert_eq!(buf[n], 0);

        // Relative resolution now happens under /home.
        let fd = open(&ns, &proc, "file", OpenFlags::RDWR | OpenFlags::CREATE).unwrap();
        close(&proc, fd).unwrap();
        assert!(ns.resolve("/home/file").is_ok());

        // A too-small buffer is refused.
        let mut tiny = [0u8; 4];
        assert!(getcwd(&proc, &mut tiny).is_err());

        // chdir to a file fails.
        assert!(chdir(&ns, &proc, "/home/file").is_err());
    }

    #[test]
    fn unlink_refuses_the_root() {
        let (ns, proc) = setup();
        assert_eq!(
            unlink(&ns, &proc, "/"),
            Err(KernelError::PermissionDenied)
        );
    }

    #[test]
    fn stat_reports_directory_for_mknod_dir() {
        let (ns, proc) = setup();
        mknod(&ns, &proc, "/subdir", NodeType::Directory.as_raw(), 0).unwrap();
        let st = stat(&ns, &proc, "/subdir").unwrap();
        assert_eq!(st.kind_raw, NodeType::Directory.as_raw());
    }

    #[test]
    fn fd_exhaustion_surfaces_as_error() {
        let (ns, proc) = setup();
        let mut fds = alloc::vec::Vec::new();
        loop {
            match open(&ns, &proc, "/fill", OpenFlags::RDWR | OpenFlags::CREATE) {
                Ok(fd) => fds.push(fd),
                Err(e) => {
                    assert_eq!(e, KernelError::InvalidFd);
                    break;
                }
            }
        }
        assert_eq!(fds.len(), crate::fs::MAX_FDS - 3);
    }
}
