#![no_std]
//! Wire-level contract shared between the kernel's syscall dispatcher and
//! user-space binaries: call numbers, the `int 0x80` argument convention,
//! and the errno values a failed call reports in `eax`.

/// Call numbers for the single `int 0x80` gate (eax = number, ebx/ecx/edx = args).
pub mod syscall {
    pub const OPEN: u32 = 1;
    pub const CLOSE: u32 = 2;
    pub const READ: u32 = 3;
    pub const WRITE: u32 = 4;
    pub const SEEK: u32 = 5;
    pub const STAT: u32 = 6;
    pub const GETDENTS: u32 = 7;
    pub const IOCTL: u32 = 8;
    pub const FORK: u32 = 9;
    pub const EXECVE: u32 = 10;
    pub const EXIT: u32 = 11;
    pub const WAITPID: u32 = 12;
    pub const CHDIR: u32 = 13;
    pub const GETCWD: u32 = 14;
    pub const PIPE: u32 = 15;
    pub const SBRK: u32 = 16;
    pub const GETPID: u32 = 17;
    pub const KILL: u32 = 18;
    pub const ACCESS: u32 = 19;
    pub const CHMOD: u32 = 20;
}

/// Software interrupt vector the syscall gate is installed at.
pub const SYSCALL_INT: u8 = 0x80;

/// errno values returned in `eax` (as a negative count, i.e. `eax == -errno`)
/// when a syscall fails. Mirrors [`KernelError`] one-to-one; kept as a flat
/// module of `i32` constants (rather than the enum itself) so this crate
/// stays usable from user-space binaries that have no reason to link the
/// richer kernel-side error type.
pub mod errno {
    pub const ENOENT: i32 = 1;
    pub const EACCES: i32 = 2;
    pub const EINVAL: i32 = 3;
    pub const ENOTDIR: i32 = 4;
    pub const EISDIR: i32 = 5;
    pub const EBADF: i32 = 6;
    pub const EAGAIN: i32 = 7;
    pub const EPIPE: i32 = 8;
    pub const ENOSPC: i32 = 9;
    pub const ENOMEM: i32 = 10;
    pub const EIO: i32 = 11;
    pub const ENOSYS: i32 = 12;
    pub const EEXIST: i32 = 13;
    pub const ENOEXEC: i32 = 14;
}

/// Standard i386 SysV initial-stack layout flags, named here so both the
/// kernel's `task_set_initial_state` and `init`'s `_start` agree on them.
pub const AT_ARGC_ALIGN: usize = 4;

/// Open flags, shared between the VFS and user space (`open(2)`-style).
pub mod open_flags {
    pub const O_RDONLY: u32 = 0x0000;
    pub const O_WRONLY: u32 = 0x0001;
    pub const O_RDWR: u32 = 0x0002;
    pub const O_CREAT: u32 = 0x0040;
    pub const O_NONBLOCK: u32 = 0x0800;
}
