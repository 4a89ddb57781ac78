//! Compile-time constants named by the design: every magic number the rest
//! of the kernel would otherwise scatter as a literal lives here instead,
//! so each module cites `config::WHATEVER` rather than repeating it.

pub const PAGE_SIZE: u32 = 4096;

/// PIT frequency driving the monotonic tick counter and scheduler preemption.
pub const PIT_RATE_HZ: u32 = 100;

/// Upper bound on live tasks; the task table is a fixed-size array sized to this.
pub const MAX_TASKS: usize = 64;

/// Fixed pipe buffer capacity (20 KiB), matching the reference FIFO size.
pub const PIPE_CAPACITY: usize = 0x5000;

/// Minimum kmalloc block content size: large enough to hold a free block's
/// intrusive `{prev, next}` pointers.
pub const KMALLOC_MIN_FREE_BLOCK: usize = core::mem::size_of::<usize>() * 2;

/// Path to the first user program, loaded from the mounted ext2 volume.
pub const INIT_PATH: &str = "/sbin/init";

/// Minimum installed RAM the boot contract requires, in MiB.
pub const MULTIBOOT_MIN_RAM_MIB: u64 = 60;

/// Primary ATA/IDE channel I/O base port.
pub const ATA_PRIMARY_IO_BASE: u16 = 0x1F0;
pub const ATA_PRIMARY_CONTROL_BASE: u16 = 0x3F6;

/// Default max level for the `log` facade; raised with `RUST_LOG`-style
/// builds is not available freestanding, so this is the only knob.
pub const LOG_LEVEL: log::LevelFilter = log::LevelFilter::Info;

/// Default kernel stack size per task.
pub const KERNEL_STACK_PAGES: u32 = 4;

/// Default user stack size per task.
pub const USER_STACK_PAGES: u32 = 16;

/// Upper bound on open file descriptors per task.
pub const MAX_FDS: usize = 32;

/// Base virtual address the user stack is carved down from in every task's
/// address space.
pub const USER_STACK_TOP: u32 = 0xC000_0000;

/// Base virtual address `PT_LOAD` segments and `sbrk` grow from.
pub const USER_IMAGE_BASE: u32 = 0x0804_8000;
