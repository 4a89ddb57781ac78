//! Process/task model: the fixed-size task table, per-task address space
//! and file descriptors, and the SysV i386 initial-stack layout `execve`
//! and the boot path hand a freshly loaded program. Grounded on the
//! reference `task.c`/`proc.c` pair — `pid == index` into the table, same
//! as [`crate::valloc`]'s own indexed-slab style.
//!
//! [`crate::sched`] owns scheduling policy (who runs next); this module
//! owns task lifecycle (creation, address space, fds, exit) and the two
//! entry points [`crate::arch::x86::isr`] and
//! [`crate::arch::x86::paging::handle_page_fault`] call directly when a
//! user task faults.

use alloc::string::String;
use alloc::sync::Arc;
use alloc::vec::Vec;

use crate::arch::x86::gdt;
use crate::arch::x86::isr::CpuState;
use crate::arch::x86::paging;
use crate::config;
use crate::error::{KernelError, KResult};
use crate::lock::BoundedSpinlock;
use crate::valloc::{self, Context, RangeHandle, VallocFlags};
use crate::vfs::VfsFile;

bitflags::bitflags! {
    /// Per-region flags `fork`/`exit` consult — orthogonal to
    /// [`VallocFlags`], which only concerns the page-table mapping itself.
    #[derive(Clone, Copy)]
    pub struct MemRegionFlags: u32 {
        /// Duplicated (fresh frames, contents copied) into a forked child.
        const FORK_COPY    = 1 << 0;
        /// Its backing frames are returned to the allocator on task exit.
        const FREE_ON_EXIT = 1 << 1;
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Section {
    Code,
    Data,
    Stack,
    Heap,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TaskState {
    Running,
    Ready,
    Blocked,
    Stopped,
    Terminated,
}

pub struct MemRegion {
    pub handle: RangeHandle,
    pub virt: u32,
    pub size: u32,
    pub section: Section,
    pub flags: MemRegionFlags,
}

pub struct Task {
    pub pid: u32,
    pub parent: Option<u32>,
    pub state: TaskState,
    pub cpu_state: CpuState,
    pub valloc_ctx: BoundedSpinlock<Context>,
    pub memory_regions: Vec<MemRegion>,
    pub fd_table: Vec<Option<VfsFile>>,
    pub cwd: String,
    pub binary_path: String,
    pub entry: u32,
    pub sbrk: u32,
    pub exit_code: i32,
    pub kernel_stack_top: u32,
    kernel_stack_range: RangeHandle,
    pub errno: i32,
}

impl Task {
    /// Installs `file` in the lowest-numbered free descriptor slot.
    pub fn alloc_fd(&mut self, file: VfsFile) -> KResult<u32> {
        for (i, slot) in self.fd_table.iter_mut().enumerate() {
            if slot.is_none() {
                *slot = Some(file);
                return Ok(i as u32);
            }
        }
        Err(KernelError::NoSpace)
    }
}

static TASKS: BoundedSpinlock<Vec<Option<Task>>> = BoundedSpinlock::new(Vec::new());

/// The kernel's own address-space bookkeeping context: not mapped anywhere
/// itself (its page directory is the kernel's, already installed by
/// `paging::init`), used only so kernel stacks can be carved out of virtual
/// address space the same way user segments are. Set once, from
/// `main`, after the heap is up — this is exactly the one-time
/// runtime-computed global the design calls out `spin::Once` for.
static KERNEL_CTX: spin::Once<BoundedSpinlock<Context>> = spin::Once::new();

pub fn init_kernel_ctx(kernel_pd_phys: u32) {
    KERNEL_CTX.call_once(|| BoundedSpinlock::new(Context::new(Some(kernel_pd_phys))));
}

fn kernel_ctx() -> &'static BoundedSpinlock<Context> {
    KERNEL_CTX.get().expect("task: kernel_ctx used before init_kernel_ctx")
}

use core::sync::atomic::{AtomicUsize, Ordering};

static CURRENT: AtomicUsize = AtomicUsize::new(usize::MAX);

pub fn current_pid() -> Option<u32> {
    match CURRENT.load(Ordering::Relaxed) {
        usize::MAX => None,
        pid => Some(pid as u32),
    }
}

pub fn set_current_pid(pid: u32) {
    CURRENT.store(pid as usize, Ordering::Relaxed);
}

/// Runs `f` against the task at `pid` under the table lock. The one way
/// every other module (syscall dispatch, the scheduler, the ELF loader)
/// reaches into a task's fields.
pub fn with_task<R>(pid: u32, f: impl FnOnce(&mut Task) -> KResult<R>) -> KResult<R> {
    let mut tasks = TASKS.lock().ok_or(KernelError::WouldBlock)?;
    let task = tasks.get_mut(pid as usize).and_then(|t| t.as_mut()).ok_or(KernelError::NotFound)?;
    f(task)
}

/// Creates a new task: fresh page directory (sharing the kernel's own
/// low-memory entries, per `clone_kernel_entries`), fresh valloc context,
/// and its own kernel stack. The task starts `Ready` with no code mapped —
/// callers add segments with [`task_add_mem`] and finish with
/// [`task_set_initial_state`] before it is ever scheduled.
pub fn task_new(parent: Option<u32>) -> KResult<u32> {
    let pd_phys = paging::new_page_directory()?;
    paging::clone_kernel_entries(pd_phys);

    let ctx = BoundedSpinlock::new(Context::new(Some(pd_phys)));
    let kstack_handle = valloc::valloc(
        kernel_ctx(),
        config::KERNEL_STACK_PAGES as usize,
        None,
        None,
        VallocFlags::RW | VallocFlags::ZERO | VallocFlags::FREE_ON_RELEASE,
    )?;
    let kstack_top = {
        let k = kernel_ctx().lock().ok_or(KernelError::WouldBlock)?;
        let range = k.range(kstack_handle).ok_or(KernelError::NotFound)?;
        range.addr + range.size
    };

    let task = Task {
        pid: 0,
        parent,
        state: TaskState::Ready,
        cpu_state: CpuState::default(),
        valloc_ctx: ctx,
        memory_regions: Vec::new(),
        fd_table: (0..config::MAX_FDS).map(|_| None).collect(),
        cwd: String::from("/"),
        binary_path: String::new(),
        entry: 0,
        sbrk: config::USER_IMAGE_BASE,
        exit_code: 0,
        kernel_stack_top: kstack_top,
        kernel_stack_range: kstack_handle,
        errno: 0,
    };

    let mut tasks = TASKS.lock().ok_or(KernelError::WouldBlock)?;
    let pid = match tasks.iter().position(|s| s.is_none()) {
        Some(i) => i,
        None => {
            if tasks.len() >= config::MAX_TASKS {
                return Err(KernelError::NoSpace);
            }
            tasks.push(None);
            tasks.len() - 1
        }
    };
    let mut task = task;
    task.pid = pid as u32;
    tasks[pid] = Some(task);
    Ok(pid as u32)
}

/// Records a mapped region so `fork` and `exit` know what to do with it.
/// The mapping itself must already have been installed (via `valloc`
/// against the task's own `valloc_ctx`) before calling this.
pub fn task_add_mem(
    pid: u32,
    handle: RangeHandle,
    virt: u32,
    size: u32,
    section: Section,
    flags: MemRegionFlags,
) -> KResult<()> {
    with_task(pid, |task| {
        task.memory_regions.push(MemRegion { handle, virt, size, section, flags });
        Ok(())
    })
}

fn push_bytes(cursor: &mut u32, writes: &mut Vec<(u32, Vec<u8>)>, bytes: &[u8]) -> u32 {
    *cursor -= bytes.len() as u32;
    writes.push((*cursor, bytes.to_vec()));
    *cursor
}

fn push_u32(cursor: &mut u32, writes: &mut Vec<(u32, Vec<u8>)>, value: u32) -> u32 {
    push_bytes(cursor, writes, &value.to_le_bytes())
}

/// Pure layout computation for the SysV i386 initial stack: `argc`,
/// `argv[]`, a NULL, `envp[]`, a NULL, then the string data those arrays
/// point into, built downward from `stack_top`. Returns the final `esp`
/// and the list of `(virtual address, bytes)` writes needed to realize it;
/// kept free of any actual memory access so it can be exercised on its own.
fn build_initial_stack_writes(stack_top: u32, argv: &[&str], envp: &[&str]) -> (u32, Vec<(u32, Vec<u8>)>) {
    let mut cursor = stack_top;
    let mut writes: Vec<(u32, Vec<u8>)> = Vec::new();

    let mut argv_ptrs = Vec::with_capacity(argv.len());
    for s in argv.iter().rev() {
        push_bytes(&mut cursor, &mut writes, &[0u8]);
        push_bytes(&mut cursor, &mut writes, s.as_bytes());
        argv_ptrs.push(cursor);
    }
    argv_ptrs.reverse();

    let mut envp_ptrs = Vec::with_capacity(envp.len());
    for s in envp.iter().rev() {
        push_bytes(&mut cursor, &mut writes, &[0u8]);
        push_bytes(&mut cursor, &mut writes, s.as_bytes());
        envp_ptrs.push(cursor);
    }
    envp_ptrs.reverse();

    cursor &= !0x3;

    push_u32(&mut cursor, &mut writes, 0);
    for &p in envp_ptrs.iter().rev() {
        push_u32(&mut cursor, &mut writes, p);
    }
    push_u32(&mut cursor, &mut writes, 0);
    for &p in argv_ptrs.iter().rev() {
        push_u32(&mut cursor, &mut writes, p);
    }
    push_u32(&mut cursor, &mut writes, argv.len() as u32);

    (cursor, writes)
}

/// Builds the initial user stack (argv/envp per the SysV i386 contract)
/// and the resident trapframe a first `iret` into this task will pop.
/// Must run after the task's `Stack` region has been added via
/// [`task_add_mem`] and `entry` has been set.
pub fn task_set_initial_state(pid: u32, argv: &[&str], envp: &[&str]) -> KResult<()> {
    let (stack_virt_base, stack_phys_base, stack_size, entry) = with_task(pid, |task| {
        let region = task
            .memory_regions
            .iter()
            .rev()
            .find(|r| r.section == Section::Stack)
            .ok_or(KernelError::InvalidArgument)?;
        let ctx = task.valloc_ctx.lock().ok_or(KernelError::WouldBlock)?;
        let range = ctx.range(region.handle).ok_or(KernelError::NotFound)?;
        let phys = range.phys.ok_or(KernelError::InvalidArgument)?;
        Ok((range.addr, phys, range.size, task.entry))
    })?;

    let stack_top_virt = stack_virt_base + stack_size;
    let (final_esp, writes) = build_initial_stack_writes(stack_top_virt, argv, envp);

    for (addr, bytes) in &writes {
        let offset = *addr - stack_virt_base;
        if offset as usize + bytes.len() > stack_size as usize {
            return Err(KernelError::InvalidArgument);
        }
        let phys = stack_phys_base + offset;
        unsafe {
            core::ptr::copy_nonoverlapping(bytes.as_ptr(), paging::phys_to_virt_ptr::<u8>(phys), bytes.len());
        }
    }

    with_task(pid, |task| {
        task.cpu_state = CpuState {
            eip: entry,
            cs: gdt::UCODE_SEL as u32,
            eflags: 0x202,
            user_esp: final_esp,
            user_ss: gdt::UDATA_SEL as u32,
            ..Default::default()
        };
        let frame_ptr = (task.kernel_stack_top - core::mem::size_of::<CpuState>() as u32) as *mut CpuState;
        unsafe { core::ptr::write_volatile(frame_ptr, task.cpu_state) };
        Ok(())
    })
}

/// Duplicates `parent_pid` into a new child: every `FORK_COPY` region gets
/// fresh frames with parent contents copied, the fd table is duplicated
/// (backing objects shared via `Arc`, each with its own offset), and
/// `parent_state` becomes the child's saved trapframe with `eax` zeroed —
/// the return-value convention `fork()` relies on. The parent's own `eax`
/// (the child pid) is set by the syscall dispatcher, not here.
pub fn task_fork(parent_pid: u32, parent_state: &CpuState) -> KResult<u32> {
    let (regions, fds, cwd, binary_path, entry, sbrk) = with_task(parent_pid, |p| {
        Ok((
            p.memory_regions.iter().map(|r| (r.virt, r.size, r.section, r.flags)).collect::<Vec<_>>(),
            p.fd_table
                .iter()
                .map(|f| f.as_ref().map(|f| (f.ops.clone(), f.offset, f.flags)))
                .collect::<Vec<_>>(),
            p.cwd.clone(),
            p.binary_path.clone(),
            p.entry,
            p.sbrk,
        ))
    })?;

    let child_pid = task_new(Some(parent_pid))?;

    for (virt, size, section, flags) in regions {
        if !flags.contains(MemRegionFlags::FORK_COPY) {
            continue;
        }
        let pages = (size / config::PAGE_SIZE) as usize;
        let child_handle = with_task(child_pid, |c| {
            valloc::valloc(
                &c.valloc_ctx,
                pages,
                Some(virt),
                None,
                VallocFlags::RW | VallocFlags::USER | VallocFlags::FREE_ON_RELEASE,
            )
        })?;

        let src_phys = with_task(parent_pid, |p| {
            let ctx = p.valloc_ctx.lock().ok_or(KernelError::WouldBlock)?;
            ctx.get_range(virt, false).and_then(|r| r.phys).ok_or(KernelError::NotFound)
        })?;
        let dst_phys = with_task(child_pid, |c| {
            let ctx = c.valloc_ctx.lock().ok_or(KernelError::WouldBlock)?;
            ctx.range(child_handle).and_then(|r| r.phys).ok_or(KernelError::NotFound)
        })?;

        unsafe {
            core::ptr::copy_nonoverlapping(
                paging::phys_to_virt_ptr::<u8>(src_phys),
                paging::phys_to_virt_ptr::<u8>(dst_phys),
                size as usize,
            );
        }

        task_add_mem(child_pid, child_handle, virt, size, section, flags)?;
    }

    with_task(child_pid, |c| {
        c.fd_table = fds
            .iter()
            .map(|f| f.as_ref().map(|(ops, offset, flags)| VfsFile { ops: ops.clone(), offset: *offset, flags: *flags }))
            .collect();
        c.cwd = cwd.clone();
        c.binary_path = binary_path.clone();
        c.entry = entry;
        c.sbrk = sbrk;
        c.cpu_state = *parent_state;
        c.cpu_state.eax = 0;
        let frame_ptr = (c.kernel_stack_top - core::mem::size_of::<CpuState>() as u32) as *mut CpuState;
        unsafe { core::ptr::write_volatile(frame_ptr, c.cpu_state) };
        Ok(())
    })?;

    Ok(child_pid)
}

/// Tears a task down: marks it `Terminated`, drops every open descriptor
/// (closing pipes, releasing ext2 inode references), frees every
/// `FREE_ON_RELEASE` range in its address space and the directory itself,
/// and reclaims its kernel stack from `kernel_ctx`.
pub fn task_exit(pid: u32, code: i32) {
    let kstack_range = {
        let mut tasks = match TASKS.lock() {
            Some(t) => t,
            None => return,
        };
        let Some(task) = tasks.get_mut(pid as usize).and_then(|t| t.as_mut()) else {
            return;
        };
        task.exit_code = code;
        task.state = TaskState::Terminated;
        for slot in task.fd_table.iter_mut() {
            *slot = None;
        }
        if let Some(mut ctx) = task.valloc_ctx.lock() {
            valloc::cleanup(&mut ctx);
        }
        task.kernel_stack_range
    };
    let _ = valloc::vfree(kernel_ctx(), kstack_range);
}

/// Marks `pid`'s direct child (if any known parent relationship matches)
/// — stub hook for a future `waitpid`; exit codes are already retained on
/// the (now-`Terminated`) task record for [`crate::syscall`] to read.
pub fn exit_code(pid: u32) -> KResult<i32> {
    with_task(pid, |t| Ok(t.exit_code))
}

pub fn pick_next_ready(after_pid: u32, requeue_self: bool) -> Option<u32> {
    let mut tasks = TASKS.lock()?;
    if requeue_self {
        if let Some(t) = tasks.get_mut(after_pid as usize).and_then(|t| t.as_mut()) {
            if t.state == TaskState::Running {
                t.state = TaskState::Ready;
            }
        }
    }
    let n = tasks.len();
    for offset in 1..=n {
        let idx = (after_pid as usize + offset) % n;
        if let Some(t) = tasks.get_mut(idx).and_then(|t| t.as_mut()) {
            if t.state == TaskState::Ready {
                t.state = TaskState::Running;
                return Some(idx as u32);
            }
        }
    }
    if requeue_self {
        if let Some(t) = tasks.get_mut(after_pid as usize).and_then(|t| t.as_mut()) {
            if t.state == TaskState::Ready {
                t.state = TaskState::Running;
            }
        }
    }
    None
}

pub fn pick_next_ready_any() -> Option<u32> {
    let mut tasks = TASKS.lock()?;
    for (idx, slot) in tasks.iter_mut().enumerate() {
        if let Some(t) = slot {
            if t.state == TaskState::Ready {
                t.state = TaskState::Running;
                return Some(idx as u32);
            }
        }
    }
    None
}

/// `(page directory physical address, kernel stack top)` for `pid` — the
/// two values the scheduler needs to resume a task it has already picked.
pub fn task_switch_info(pid: u32) -> Option<(u32, u32)> {
    let tasks = TASKS.lock()?;
    let t = tasks.get(pid as usize)?.as_ref()?;
    let pd = t.valloc_ctx.lock()?.page_dir()?;
    Some((pd, t.kernel_stack_top))
}

pub fn terminate_current_on_fault(name: &str, state: &mut CpuState) {
    if let Some(pid) = current_pid() {
        log::error!("task: pid {} hit {} (eip={:#x}) — terminating", pid, name, state.eip);
        task_exit(pid, -1);
    }
    crate::sched::force_switch(state);
}

pub fn terminate_current_on_page_fault(cr2: u32, state: &mut CpuState) {
    if let Some(pid) = current_pid() {
        log::error!("task: pid {} page fault at {:#x} (eip={:#x}) — terminating", pid, cr2, state.eip);
        task_exit(pid, -1);
    }
    crate::sched::force_switch(state);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stack_layout_places_argc_at_the_bottom() {
        let (esp, writes) = build_initial_stack_writes(0x1000, &["/sbin/init", "-v"], &["HOME=/"]);
        assert_eq!(esp % 4, 0);

        let find = |addr: u32| writes.iter().find(|(a, _)| *a == addr).map(|(_, b)| b.clone());
        let argc_bytes = find(esp).expect("argc missing");
        assert_eq!(u32::from_le_bytes(argc_bytes.try_into().unwrap()), 2);

        let argv0_ptr_bytes = find(esp + 4).expect("argv[0] missing");
        let argv0_ptr = u32::from_le_bytes(argv0_ptr_bytes.try_into().unwrap());
        let argv0_str = find(argv0_ptr).expect("argv[0] string missing");
        assert_eq!(&argv0_str[..], b"/sbin/init");

        let argv1_ptr_bytes = find(esp + 8).expect("argv[1] missing");
        let argv_null_bytes = find(esp + 12).expect("argv NULL missing");
        assert_eq!(u32::from_le_bytes(argv_null_bytes.try_into().unwrap()), 0);
        let argv1_ptr = u32::from_le_bytes(argv1_ptr_bytes.try_into().unwrap());
        assert_eq!(&find(argv1_ptr).unwrap()[..], b"-v");

        let envp0_ptr_bytes = find(esp + 16).expect("envp[0] missing");
        let envp0_ptr = u32::from_le_bytes(envp0_ptr_bytes.try_into().unwrap());
        assert_eq!(&find(envp0_ptr).unwrap()[..], b"HOME=/");
        let envp_null_bytes = find(esp + 20).expect("envp NULL missing");
        assert_eq!(u32::from_le_bytes(envp_null_bytes.try_into().unwrap()), 0);
    }

    #[test]
    fn stack_layout_with_no_args_is_just_argc_zero() {
        let (esp, writes) = build_initial_stack_writes(0x2000, &[], &[]);
        let bytes = writes.iter().find(|(a, _)| *a == esp).unwrap().1.clone();
        assert_eq!(u32::from_le_bytes(bytes.try_into().unwrap()), 0);
    }

    #[test]
    fn mem_region_flags_are_independent_bits() {
        let f = MemRegionFlags::FORK_COPY | MemRegionFlags::FREE_ON_EXIT;
        assert!(f.contains(MemRegionFlags::FORK_COPY));
        assert!(f.contains(MemRegionFlags::FREE_ON_EXIT));
        assert!(!MemRegionFlags::FORK_COPY.contains(MemRegionFlags::FREE_ON_EXIT));
    }
}
