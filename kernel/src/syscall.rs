//! The `int 0x80` syscall table. Grounded on the reference syscall
//! dispatcher's shape (read the call number and three argument slots out of
//! the trapframe, dispatch to a fixed table, write the result or `-1` with
//! an errno back into the same register) — the registers it reads from are
//! this kernel's [`CpuState`] rather than the reference's `regs_t`, and the
//! "no syscall blocks the whole machine" constraint is met the same way
//! [`crate::pipe`] meets it: a `sti; hlt` spin rather than a real wait queue.
//!
//! Every user pointer argument is copied into (or out of) a kernel-owned
//! buffer via [`isr::user_copy_in`]/[`isr::user_copy_out`] before the VFS or
//! task APIs ever see it — nothing here dereferences a user address
//! directly.

use alloc::string::String;
use alloc::vec::Vec;

use quark_sys::{open_flags, syscall as nr};

use crate::arch::x86::isr::{self, CpuState};
use crate::config;
use crate::error::{KernelError, KResult};
use crate::task::{self, MemRegionFlags, Section};
use crate::valloc::{self, VallocFlags};
use crate::vfs;

/// Longest path or `getcwd` buffer this dispatcher will copy in one shot.
/// Anything longer is rejected with `InvalidArgument` rather than grown
/// unboundedly from user-controlled input.
const MAX_PATH: usize = 256;
/// Largest single `read`/`write`/`getdents` transfer copied through a
/// kernel-side staging buffer per call.
const MAX_IO_CHUNK: usize = 4096;

fn copy_user_cstr(ptr: u32) -> KResult<String> {
    let mut out = Vec::new();
    for i in 0..MAX_PATH as u32 {
        let mut byte = [0u8];
        isr::user_copy_in(&mut byte, ptr + i).ok_or(KernelError::InvalidArgument)?;
        if byte[0] == 0 {
            return String::from_utf8(out).map_err(|_| KernelError::InvalidArgument);
        }
        out.push(byte[0]);
    }
    Err(KernelError::InvalidArgument)
}

fn copy_user_in(ptr: u32, len: usize) -> KResult<Vec<u8>> {
    if len > MAX_IO_CHUNK {
        return Err(KernelError::InvalidArgument);
    }
    let mut buf = alloc::vec![0u8; len];
    isr::user_copy_in(&mut buf, ptr).ok_or(KernelError::InvalidArgument)?;
    Ok(buf)
}

fn copy_user_out(ptr: u32, data: &[u8]) -> KResult<()> {
    isr::user_copy_out(ptr, data).ok_or(KernelError::InvalidArgument)
}

fn current() -> KResult<u32> {
    task::current_pid().ok_or(KernelError::NotFound)
}

/// Entry point `isr::syscall_dispatch` calls on every `int 0x80`. Reads
/// `eax`/`ebx`/`ecx`/`edx`, runs the call, and writes the outcome back into
/// `state.eax` — `-1` with the calling task's `errno` field set on failure,
/// the call's return value on success. `execve`/`exit` never reach the
/// success path here: they replace or tear down the trapframe themselves.
pub fn dispatch(state: &mut CpuState) {
    let number = state.eax;
    let a0 = state.ebx;
    let a1 = state.ecx;
    let a2 = state.edx;

    let result = run(number, a0, a1, a2, state);
    match result {
        Ok(value) => state.eax = value,
        Err(Outcome::Handled) => {}
        Err(Outcome::Error(err)) => {
            if let Some(pid) = task::current_pid() {
                let _ = task::with_task(pid, |t| {
                    t.errno = err.errno();
                    Ok(())
                });
            }
            state.eax = (-1i32) as u32;
        }
    }
}

/// `execve`/`exit` take over `state` directly (a new entry trapframe, or no
/// return at all) instead of producing a plain return value; this sentinel
/// tells `dispatch` not to overwrite what they already did.
enum Outcome {
    Handled,
    Error(KernelError),
}

impl From<KernelError> for Outcome {
    fn from(e: KernelError) -> Self {
        Outcome::Error(e)
    }
}

fn run(number: u32, a0: u32, a1: u32, a2: u32, state: &mut CpuState) -> Result<u32, Outcome> {
    match number {
        nr::OPEN => sys_open(a0, a1),
        nr::CLOSE => sys_close(a0),
        nr::READ => sys_read(a0, a1, a2),
        nr::WRITE => sys_write(a0, a1, a2),
        nr::SEEK => sys_seek(a0, a1, a2),
        nr::STAT => sys_stat(a0, a1),
        nr::GETDENTS => sys_getdents(a0, a1, a2),
        nr::IOCTL => sys_ioctl(a0, a1, a2),
        nr::FORK => sys_fork(state),
        nr::EXECVE => sys_execve(a0, a1, a2, state),
        nr::EXIT => sys_exit(a0, state),
        nr::WAITPID => sys_waitpid(a0, a1),
        nr::CHDIR => sys_chdir(a0),
        nr::GETCWD => sys_getcwd(a0, a1),
        nr::PIPE => sys_pipe(a0),
        nr::SBRK => sys_sbrk(a0 as i32),
        nr::GETPID => sys_getpid(),
        nr::KILL => sys_kill(a0, a1),
        nr::ACCESS => sys_access(a0),
        nr::CHMOD => sys_chmod(a0, a1),
        _ => Err(KernelError::NotSupported.into()),
    }
}

fn sys_open(path_ptr: u32, flags: u32) -> Result<u32, Outcome> {
    let pid = current()?;
    let path = copy_user_cstr(path_ptr)?;
    let cwd = task::with_task(pid, |t| Ok(t.cwd.clone()))?;
    let full = vfs::normalize_path(&path, &cwd);
    let file = vfs::open(&full, flags)?;
    let fd = task::with_task(pid, |t| t.alloc_fd(file))?;
    Ok(fd)
}

fn sys_close(fd: u32) -> Result<u32, Outcome> {
    let pid = current()?;
    task::with_task(pid, |t| {
        let slot = t.fd_table.get_mut(fd as usize).ok_or(KernelError::BadFileDescriptor)?;
        if slot.take().is_none() {
            return Err(KernelError::BadFileDescriptor);
        }
        Ok(0)
    })
    .map_err(Outcome::from)
}

fn sys_read(fd: u32, buf_ptr: u32, len: u32) -> Result<u32, Outcome> {
    let pid = current()?;
    let len = (len as usize).min(MAX_IO_CHUNK);
    let mut staging = alloc::vec![0u8; len];
    let n = task::with_task(pid, |t| {
        let file = t.fd_table.get_mut(fd as usize).and_then(|s| s.as_mut()).ok_or(KernelError::BadFileDescriptor)?;
        vfs::read(file, &mut staging)
    })?;
    copy_user_out(buf_ptr, &staging[..n])?;
    Ok(n as u32)
}

fn sys_write(fd: u32, buf_ptr: u32, len: u32) -> Result<u32, Outcome> {
    let pid = current()?;
    let staging = copy_user_in(buf_ptr, len as usize)?;
    let n = task::with_task(pid, |t| {
        let file = t.fd_table.get_mut(fd as usize).and_then(|s| s.as_mut()).ok_or(KernelError::BadFileDescriptor)?;
        vfs::write(file, &staging)
    })?;
    Ok(n as u32)
}

fn sys_seek(fd: u32, offset: u32, whence: u32) -> Result<u32, Outcome> {
    let pid = current()?;
    let offset = offset as i32 as i64;
    let new_off = task::with_task(pid, |t| {
        let file = t.fd_table.get_mut(fd as usize).and_then(|s| s.as_mut()).ok_or(KernelError::BadFileDescriptor)?;
        vfs::seek(file, offset, whence as i32)
    })?;
    Ok(new_off as u32)
}

fn sys_stat(fd: u32, statbuf_ptr: u32) -> Result<u32, Outcome> {
    let pid = current()?;
    let stat = task::with_task(pid, |t| {
        let file = t.fd_table.get(fd as usize).and_then(|s| s.as_ref()).ok_or(KernelError::BadFileDescriptor)?;
        vfs::stat(file)
    })?;
    let bytes = unsafe {
        core::slice::from_raw_parts(
            (&stat as *const vfs::Stat) as *const u8,
            core::mem::size_of::<vfs::Stat>(),
        )
    };
    copy_user_out(statbuf_ptr, bytes)?;
    Ok(0)
}

fn sys_getdents(fd: u32, buf_ptr: u32, len: u32) -> Result<u32, Outcome> {
    let pid = current()?;
    let len = (len as usize).min(MAX_IO_CHUNK);
    let mut staging = alloc::vec![0u8; len];
    let n = task::with_task(pid, |t| {
        let file = t.fd_table.get_mut(fd as usize).and_then(|s| s.as_mut()).ok_or(KernelError::BadFileDescriptor)?;
        vfs::getdents(file, &mut staging)
    })?;
    copy_user_out(buf_ptr, &staging[..n])?;
    Ok(n as u32)
}

fn sys_ioctl(fd: u32, request: u32, arg: u32) -> Result<u32, Outcome> {
    let pid = current()?;
    let value = task::with_task(pid, |t| {
        let file = t.fd_table.get(fd as usize).and_then(|s| s.as_ref()).ok_or(KernelError::BadFileDescriptor)?;
        vfs::ioctl(file, request, arg)
    })?;
    Ok(value)
}

fn sys_fork(state: &mut CpuState) -> Result<u32, Outcome> {
    let pid = current()?;
    let snapshot = *state;
    let child = task::task_fork(pid, &snapshot)?;
    Ok(child)
}

/// Loads a fresh program image into the *calling* task (replacing its
/// segments wholesale is not implemented — only a never-yet-executed task
/// is supported, matching the boot path's own use of `elf::load_into_task`).
/// On success this overwrites `state` with the new entry trapframe in
/// place; `dispatch` must not touch `state.eax` afterward.
fn sys_execve(path_ptr: u32, argv_ptr: u32, envp_ptr: u32, state: &mut CpuState) -> Result<u32, Outcome> {
    let pid = current()?;
    let path = copy_user_cstr(path_ptr)?;
    let cwd = task::with_task(pid, |t| Ok(t.cwd.clone()))?;
    let full = vfs::normalize_path(&path, &cwd);

    let mut file = vfs::open(&full, open_flags::O_RDONLY)?;
    let stat = vfs::stat(&file)?;
    let mut data = alloc::vec![0u8; stat.size as usize];
    let mut off = 0usize;
    while off < data.len() {
        let n = vfs::read(&mut file, &mut data[off..])?;
        if n == 0 {
            break;
        }
        off += n;
    }
    data.truncate(off);

    let argv = read_user_strv(argv_ptr)?;
    let envp = read_user_strv(envp_ptr)?;
    let argv_refs: Vec<&str> = argv.iter().map(|s| s.as_str()).collect();
    let envp_refs: Vec<&str> = envp.iter().map(|s| s.as_str()).collect();

    crate::elf::load_into_task(pid, &data, &argv_refs, &envp_refs)?;
    task::with_task(pid, |t| {
        t.binary_path = full.clone();
        *state = t.cpu_state;
        Ok(())
    })?;
    Err(Outcome::Handled)
}

fn read_user_strv(ptr: u32) -> KResult<Vec<String>> {
    if ptr == 0 {
        return Ok(Vec::new());
    }
    let mut out = Vec::new();
    for i in 0u32.. {
        let mut word = [0u8; 4];
        isr::user_copy_in(&mut word, ptr + i * 4).ok_or(KernelError::InvalidArgument)?;
        let entry = u32::from_le_bytes(word);
        if entry == 0 {
            break;
        }
        out.push(copy_user_cstr(entry)?);
        if out.len() > 64 {
            return Err(KernelError::InvalidArgument);
        }
    }
    Ok(out)
}

fn sys_exit(code: u32, state: &mut CpuState) -> Result<u32, Outcome> {
    let pid = current()?;
    task::task_exit(pid, code as i32);
    crate::sched::force_switch(state);
}

fn sys_waitpid(pid_arg: u32, status_ptr: u32) -> Result<u32, Outcome> {
    let parent = current()?;
    loop {
        let found = task::with_task(pid_arg, |t| {
            if t.parent != Some(parent) {
                return Err(KernelError::NotFound);
            }
            Ok(t.state == task::TaskState::Terminated)
        })?;
        if found {
            let code = task::exit_code(pid_arg)?;
            if status_ptr != 0 {
                copy_user_out(status_ptr, &code.to_le_bytes())?;
            }
            return Ok(pid_arg);
        }
        unsafe {
            core::arch::asm!("sti", "hlt", options(nostack, preserves_flags));
        }
    }
}

fn sys_chdir(path_ptr: u32) -> Result<u32, Outcome> {
    let pid = current()?;
    let path = copy_user_cstr(path_ptr)?;
    let full = task::with_task(pid, |t| Ok(vfs::normalize_path(&path, &t.cwd)))?;
    vfs::access(&full)?;
    task::with_task(pid, |t| {
        t.cwd = full.clone();
        Ok(())
    })?;
    Ok(0)
}

fn sys_getcwd(buf_ptr: u32, len: u32) -> Result<u32, Outcome> {
    let pid = current()?;
    let cwd = task::with_task(pid, |t| Ok(t.cwd.clone()))?;
    if cwd.len() + 1 > len as usize {
        return Err(KernelError::InvalidArgument.into());
    }
    let mut bytes = cwd.into_bytes();
    bytes.push(0);
    copy_user_out(buf_ptr, &bytes)?;
    Ok(bytes.len() as u32 - 1)
}

fn sys_pipe(fds_ptr: u32) -> Result<u32, Outcome> {
    let pid = current()?;
    let (read_ops, write_ops) = crate::pipe::pipe_create(0);
    let (rfd, wfd) = task::with_task(pid, |t| {
        let rfd = t.alloc_fd(vfs::VfsFile::new(read_ops.clone(), open_flags::O_RDONLY))?;
        let wfd = t.alloc_fd(vfs::VfsFile::new(write_ops.clone(), open_flags::O_WRONLY))?;
        Ok((rfd, wfd))
    })?;
    let mut bytes = [0u8; 8];
    bytes[0..4].copy_from_slice(&rfd.to_le_bytes());
    bytes[4..8].copy_from_slice(&wfd.to_le_bytes());
    copy_user_out(fds_ptr, &bytes)?;
    Ok(0)
}

/// Grows the heap region upward from the task's current break. Shrinking is
/// not supported (no demand paging to reclaim partial pages into) — a
/// negative increment is rejected with `InvalidArgument`.
fn sys_sbrk(increment: i32) -> Result<u32, Outcome> {
    let pid = current()?;
    let old_brk = task::with_task(pid, |t| Ok(t.sbrk))?;
    if increment == 0 {
        return Ok(old_brk);
    }
    if increment < 0 {
        return Err(KernelError::InvalidArgument.into());
    }
    let grow = increment as u32;
    let new_brk_unaligned = old_brk.checked_add(grow).ok_or(KernelError::OutOfMemory)?;
    let aligned_old = (old_brk + config::PAGE_SIZE - 1) & !(config::PAGE_SIZE - 1);
    let aligned_new = (new_brk_unaligned + config::PAGE_SIZE - 1) & !(config::PAGE_SIZE - 1);

    if aligned_new > aligned_old {
        let pages = ((aligned_new - aligned_old) / config::PAGE_SIZE) as usize;
        let handle = task::with_task(pid, |t| {
            valloc::valloc(
                &t.valloc_ctx,
                pages,
                Some(aligned_old),
                None,
                VallocFlags::RW | VallocFlags::USER | VallocFlags::ZERO | VallocFlags::FREE_ON_RELEASE,
            )
        })?;
        task::task_add_mem(
            pid,
            handle,
            aligned_old,
            pages as u32 * config::PAGE_SIZE,
            Section::Heap,
            MemRegionFlags::FORK_COPY | MemRegionFlags::FREE_ON_EXIT,
        )?;
    }

    task::with_task(pid, |t| {
        t.sbrk = new_brk_unaligned;
        Ok(())
    })?;
    Ok(old_brk)
}

fn sys_getpid() -> Result<u32, Outcome> {
    Ok(current()?)
}

/// Only the termination effect of a signal is modeled (§7's non-goal:
/// "POSIX signal delivery beyond process termination"); any signal number
/// just tears the target task down.
fn sys_kill(pid: u32, _sig: u32) -> Result<u32, Outcome> {
    fd_for_task_exists(pid)?;
    task::task_exit(pid, -1);
    Ok(0)
}

fn fd_for_task_exists(pid: u32) -> KResult<()> {
    task::with_task(pid, |_| Ok(()))
}

fn sys_access(path_ptr: u32) -> Result<u32, Outcome> {
    let pid = current()?;
    let path = copy_user_cstr(path_ptr)?;
    let cwd = task::with_task(pid, |t| Ok(t.cwd.clone()))?;
    let full = vfs::normalize_path(&path, &cwd);
    vfs::access(&full)?;
    Ok(0)
}

fn sys_chmod(path_ptr: u32, mode: u32) -> Result<u32, Outcome> {
    let pid = current()?;
    let path = copy_user_cstr(path_ptr)?;
    let cwd = task::with_task(pid, |t| Ok(t.cwd.clone()))?;
    let full = vfs::normalize_path(&path, &cwd);
    let file = vfs::open(&full, open_flags::O_RDONLY)?;
    vfs::chmod(&file, mode)?;
    Ok(0)
}
