//! The one error type every fallible core API returns, and its mapping to
//! the wire-level errno values `libs/sys` defines for the syscall ABI.

use quark_sys::errno;

#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum KernelError {
    NotFound,
    PermissionDenied,
    InvalidArgument,
    NotADirectory,
    IsADirectory,
    BadFileDescriptor,
    WouldBlock,
    BrokenPipe,
    NoSpace,
    OutOfMemory,
    IOError,
    NotSupported,
    AlreadyExists,
    ExecFormatError,
}

pub type KResult<T> = Result<T, KernelError>;

impl KernelError {
    /// The negative `eax` value a syscall returns on failure.
    pub fn errno(self) -> i32 {
        match self {
            KernelError::NotFound => errno::ENOENT,
            KernelError::PermissionDenied => errno::EACCES,
            KernelError::InvalidArgument => errno::EINVAL,
            KernelError::NotADirectory => errno::ENOTDIR,
            KernelError::IsADirectory => errno::EISDIR,
            KernelError::BadFileDescriptor => errno::EBADF,
            KernelError::WouldBlock => errno::EAGAIN,
            KernelError::BrokenPipe => errno::EPIPE,
            KernelError::NoSpace => errno::ENOSPC,
            KernelError::OutOfMemory => errno::ENOMEM,
            KernelError::IOError => errno::EIO,
            KernelError::NotSupported => errno::ENOSYS,
            KernelError::AlreadyExists => errno::EEXIST,
            KernelError::ExecFormatError => errno::ENOEXEC,
        }
    }
}

impl core::fmt::Display for KernelError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let s = match self {
            KernelError::NotFound => "not found",
            KernelError::PermissionDenied => "permission denied",
            KernelError::InvalidArgument => "invalid argument",
            KernelError::NotADirectory => "not a directory",
            KernelError::IsADirectory => "is a directory",
            KernelError::BadFileDescriptor => "bad file descriptor",
            KernelError::WouldBlock => "would block",
            KernelError::BrokenPipe => "broken pipe",
            KernelError::NoSpace => "no space left",
            KernelError::OutOfMemory => "out of memory",
            KernelError::IOError => "I/O error",
            KernelError::NotSupported => "not supported",
            KernelError::AlreadyExists => "already exists",
            KernelError::ExecFormatError => "exec format error",
        };
        f.write_str(s)
    }
}
