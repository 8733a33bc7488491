//! Kernel error types.
//!
//! Recoverable failures travel through these enums and are flattened to -1
//! at the syscall boundary. Structural invariant violations do not come
//! through here at all; they panic (fail-stop).

use core::fmt;

/// Main kernel error type
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[must_use = "kernel errors must be handled, not silently discarded"]
pub enum KernelError {
    /// Physical, virtual, or heap allocation failed
    OutOfMemory,
    /// A path did not resolve to a node
    InvalidPath,
    /// File descriptor out of range or not open
    InvalidFd,
    /// `kill`/`wait` target does not exist
    NoSuchProcess,
    /// Storage transport reported an unrecoverable error
    IoError,
    /// Syscall number outside the dispatch table
    UnknownSyscall(u64),
    /// Operation refused (unlink "/", kill pid <= 1, unsupported mmap target)
    PermissionDenied,
    /// A user pointer failed validation
    BadAddress(u64),
    /// Argument outside the accepted range
    InvalidArgument,
    /// Filesystem-level failure
    Fs(FsError),
    /// The operation cannot complete right now
    WouldBlock,
    /// Write end of a pipe with no readers left
    BrokenPipe,
}

/// Filesystem-specific errors
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FsError {
    /// File or directory not found
    NotFound,
    /// Name already exists in the directory
    AlreadyExists,
    /// Target is not a directory
    NotADirectory,
    /// Target is a directory (when a file was expected)
    IsADirectory,
    /// Operation not supported on this node type
    NotSupported,
    /// Name longer than the on-disk format allows
    NameTooLong,
    /// I/O error from the block layer
    Io,
    /// No free blocks/inodes/clusters left
    NoSpace,
    /// Offset/size outside the representable file range
    FileTooLarge,
    /// Unknown ioctl request for this node
    BadIoctl,
}

/// Result type alias for kernel operations
pub type KernelResult<T> = Result<T, KernelError>;

impl From<FsError> for KernelError {
    fn from(err: FsError) -> Self {
        match err {
            FsError::NotFound => Self::InvalidPath,
            FsError::NoSpace => Self::OutOfMemory,
            _ => Self::Fs(err),
        }
    }
}

impl KernelError {
    /// The value handed back through RAX for a failed syscall.
    pub fn as_sysret(&self) -> i64 {
        -1
    }
}

impl fmt::Display for KernelError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::OutOfMemory => write!(f, "out of memory"),
            Self::InvalidPath => write!(f, "invalid path"),
            Self::InvalidFd => write!(f, "invalid file descriptor"),
            Self::NoSuchProcess => write!(f, "no such process"),
            Self::IoError => write!(f, "I/O error"),
            Self::UnknownSyscall(nr) => write!(f, "unknown syscall {}", nr),
            Self::PermissionDenied => write!(f, "permission denied"),
            Self::BadAddress(addr) => write!(f, "bad user address 0x{:x}", addr),
            Self::InvalidArgument => write!(f, "invalid argument"),
            Self::Fs(e) => write!(f, "filesystem error: {:?}", e),
            Self::WouldBlock => write!(f, "operation would block"),
            Self::BrokenPipe => write!(f, "broken pipe"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fs_not_found_maps_to_invalid_path() {
        let e: KernelError = FsError::NotFound.into();
        assert_eq!(e, KernelError::InvalidPath);
    }

    #[test]
    fn every_error_surfaces_as_minus_one() {
        assert_eq!(KernelError::InvalidFd.as_sysret(), -1);
        assert_eq!(KernelError::UnknownSyscall(999).as_sysret(), -1);
    }
}
