//! Minimal virtual filesystem: a mount table resolved by longest-prefix
//! match, path normalization, and the per-descriptor `Stat`/operation
//! surface every open file goes through. Grounded on the reference
//! `vfs.c`'s nullable callback-table design; reimplemented here as trait
//! objects with default (`NotSupported`) methods, which is this crate's
//! idiomatic equivalent of "the callback pointer was null" — the same
//! narrow-trait-isolates-a-backend pattern [`crate::ide::BlockDevice`]
//! already uses for the disk.
//!
//! File descriptors themselves live in each [`crate::task::Task`]'s fd
//! table, not here; this module only supplies the `VfsFile` record type
//! and the mount table `open` resolves against.

use alloc::string::{String, ToString};
use alloc::sync::Arc;
use alloc::vec::Vec;

use crate::error::{KernelError, KResult};
use crate::lock::BoundedSpinlock;

/// `stat`-equivalent, matching the fields the reference `ext2_stat` copies
/// (§4.9): mode, ownership, size, link count, timestamps, block count, plus
/// the two fields every backing filesystem sets the same way.
#[repr(C)]
#[derive(Copy, Clone, Debug, Default)]
pub struct Stat {
    pub mode: u32,
    pub uid: u32,
    pub gid: u32,
    pub size: u64,
    pub nlink: u32,
    pub atime: u32,
    pub mtime: u32,
    pub ctime: u32,
    pub blocks: u32,
    pub st_dev: u32,
    pub st_blksize: u32,
}

pub const S_IFMT: u32 = 0xF000;
pub const S_IFDIR: u32 = 0x4000;
pub const S_IFREG: u32 = 0x8000;
pub const S_IFLNK: u32 = 0xA000;

/// Operations a backing object (an ext2 inode, a pipe end, the console)
/// supports. Every method defaults to `NotSupported`, the trait-object
/// equivalent of a null entry in the reference callback table — a type
/// overrides only the operations its backend actually implements.
pub trait FileOps: Send + Sync {
    fn read(&self, _offset: u64, _buf: &mut [u8]) -> KResult<usize> {
        Err(KernelError::NotSupported)
    }
    fn write(&self, _offset: u64, _buf: &[u8]) -> KResult<usize> {
        Err(KernelError::NotSupported)
    }
    fn stat(&self) -> KResult<Stat> {
        Err(KernelError::NotSupported)
    }
    fn getdents(&self, _offset: u64, _buf: &mut [u8]) -> KResult<usize> {
        Err(KernelError::NotSupported)
    }
    fn ioctl(&self, _request: u32, _arg: u32) -> KResult<u32> {
        Err(KernelError::NotSupported)
    }
    fn chmod(&self, _mode: u32) -> KResult<()> {
        Err(KernelError::NotSupported)
    }
    fn access(&self) -> KResult<()> {
        Ok(())
    }
}

/// A filesystem implementation mountable at some path. `open` resolves a
/// path relative to the mount's own root and returns the backing object a
/// file descriptor will dispatch through.
pub trait FileSystem: Send + Sync {
    fn open(&self, path: &str, flags: u32) -> KResult<Arc<dyn FileOps>>;
}

struct Mount {
    mount_point: String,
    fs: Arc<dyn FileSystem>,
}

static MOUNTS: BoundedSpinlock<Vec<Mount>> = BoundedSpinlock::new(Vec::new());

pub fn mount(mount_point: &str, fs: Arc<dyn FileSystem>) -> KResult<()> {
    let mut mounts = MOUNTS.lock().ok_or(KernelError::WouldBlock)?;
    mounts.push(Mount { mount_point: mount_point.to_string(), fs });
    Ok(())
}

/// Longest mount-point-prefix match over the resolved (absolute) path.
fn resolve_mount(path: &str) -> KResult<Arc<dyn FileSystem>> {
    let mounts = MOUNTS.lock().ok_or(KernelError::WouldBlock)?;
    mounts
        .iter()
        .filter(|m| path.starts_with(m.mount_point.as_str()))
        .max_by_key(|m| m.mount_point.len())
        .map(|m| m.fs.clone())
        .ok_or(KernelError::NotFound)
}

/// One entry of a task's fd table: the backing object plus the file
/// position every `read`/`write`/`getdents` call advances.
pub struct VfsFile {
    pub ops: Arc<dyn FileOps>,
    pub offset: u64,
    pub flags: u32,
}

impl VfsFile {
    pub fn new(ops: Arc<dyn FileOps>, flags: u32) -> Self {
        VfsFile { ops, offset: 0, flags }
    }
}

/// Resolves `path` against the mount table and opens it. `path` must
/// already be normalized (absolute, no `.`/`..`) — callers go through
/// [`normalize_path`] first.
pub fn open(path: &str, flags: u32) -> KResult<VfsFile> {
    let fs = resolve_mount(path)?;
    let ops = fs.open(path, flags)?;
    Ok(VfsFile::new(ops, flags))
}

pub fn read(file: &mut VfsFile, buf: &mut [u8]) -> KResult<usize> {
    let n = file.ops.read(file.offset, buf)?;
    file.offset += n as u64;
    Ok(n)
}

pub fn write(file: &mut VfsFile, buf: &[u8]) -> KResult<usize> {
    let n = file.ops.write(file.offset, buf)?;
    file.offset += n as u64;
    Ok(n)
}

pub fn seek(file: &mut VfsFile, offset: i64, whence: i32) -> KResult<u64> {
    const SEEK_SET: i32 = 0;
    const SEEK_CUR: i32 = 1;
    const SEEK_END: i32 = 2;
    let base = match whence {
        SEEK_SET => 0,
        SEEK_CUR => file.offset as i64,
        SEEK_END => file.ops.stat()?.size as i64,
        _ => return Err(KernelError::InvalidArgument),
    };
    let new_offset = base + offset;
    if new_offset < 0 {
        return Err(KernelError::InvalidArgument);
    }
    file.offset = new_offset as u64;
    Ok(file.offset)
}

pub fn stat(file: &VfsFile) -> KResult<Stat> {
    file.ops.stat()
}

pub fn getdents(file: &mut VfsFile, buf: &mut [u8]) -> KResult<usize> {
    if buf.len() % 1024 != 0 {
        return Err(KernelError::InvalidArgument);
    }
    let n = file.ops.getdents(file.offset, buf)?;
    file.offset += n as u64;
    Ok(n)
}

pub fn ioctl(file: &VfsFile, request: u32, arg: u32) -> KResult<u32> {
    file.ops.ioctl(request, arg)
}

pub fn access(path: &str) -> KResult<()> {
    let fs = resolve_mount(path)?;
    fs.open(path, 0)?.access()
}

pub fn chmod(file: &VfsFile, mode: u32) -> KResult<()> {
    file.ops.chmod(mode)
}

/// Collapses `.`, `..`, and duplicate slashes in `path`, resolving it
/// against `base` when relative, per §8's exact test vectors.
pub fn normalize_path(path: &str, base: &str) -> String {
    let joined: String;
    let full: &str = if path.starts_with('/') {
        path
    } else if base.ends_with('/') {
        joined = alloc::format!("{}{}", base, path);
        &joined
    } else {
        joined = alloc::format!("{}/{}", base, path);
        &joined
    };

    let mut components: Vec<&str> = Vec::new();
    for part in full.split('/') {
        match part {
            "" | "." => {}
            ".." => {
                components.pop();
            }
            other => components.push(other),
        }
    }

    if components.is_empty() {
        "/".to_string()
    } else {
        let mut out = String::new();
        for c in components {
            out.push('/');
            out.push_str(c);
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_collapses_dot_and_dotdot() {
        assert_eq!(normalize_path("/a/./b/../c", "/"), "/a/c");
    }

    #[test]
    fn normalize_resolves_relative_against_base() {
        assert_eq!(normalize_path("x/y", "/u/v"), "/u/v/x/y");
    }

    #[test]
    fn normalize_root_is_idempotent() {
        assert_eq!(normalize_path("/", "/"), "/");
    }

    #[test]
    fn normalize_collapses_duplicate_slashes() {
        assert_eq!(normalize_path("/a//b///c", "/"), "/a/b/c");
    }

    #[test]
    fn normalize_dotdot_past_root_stays_at_root() {
        assert_eq!(normalize_path("/../../a", "/"), "/a");
    }

    struct EchoFs;
    struct EchoFile;
    impl FileOps for EchoFile {
        fn read(&self, _offset: u64, buf: &mut [u8]) -> KResult<usize> {
            for b in buf.iter_mut() {
                *b = b'x';
            }
            Ok(buf.len())
        }
    }
    impl FileSystem for EchoFs {
        fn open(&self, _path: &str, _flags: u32) -> KResult<Arc<dyn FileOps>> {
            Ok(Arc::new(EchoFile))
        }
    }

    #[test]
    fn default_ops_are_not_supported() {
        let f = VfsFile::new(Arc::new(EchoFile), 0);
        assert_eq!(f.ops.stat().unwrap_err(), KernelError::NotSupported);
        assert_eq!(f.ops.chmod(0).unwrap_err(), KernelError::NotSupported);
    }

    #[test]
    fn longest_prefix_mount_wins() {
        mount("/", Arc::new(EchoFs)).unwrap();
        mount("/mnt", Arc::new(EchoFs)).unwrap();
        // Both mounts answer identically here; this only exercises that
        // resolution does not error for a path under the deeper mount.
        let mut f = open("/mnt/data", 0).unwrap();
        let mut buf = [0u8; 4];
        assert_eq!(read(&mut f, &mut buf).unwrap(), 4);
        assert_eq!(&buf, b"xxxx");
    }
}
