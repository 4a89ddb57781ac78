#![no_std]
#![no_main]
#![feature(alloc_error_handler)]

extern crate alloc;

use alloc::sync::Arc;
use core::arch::global_asm;
use core::panic::PanicInfo;

use quark_bootinfo::{InfoFlags, MultibootInfo, BOOTLOADER_MAGIC};

mod arch;
mod config;
mod elf;
mod error;
mod ext2;
mod heap;
mod ide;
mod lock;
mod logger;
mod pipe;
mod pmm;
mod sched;
mod serial;
mod syscall;
mod task;
mod tick;
mod valloc;
mod vfs;

extern "C" {
    static _kernel_end: u8;
}

// Multiboot-loaded entry: GRUB (or any multiboot 0.6.96 loader) jumps here
// with `eax = BOOTLOADER_MAGIC`, `ebx = &MultibootInfo`, and no stack of its
// own guaranteed usable, so the first job is to stand up a private one and
// hand off to Rust with both registers preserved as arguments (cdecl: the
// value that becomes `rust_main`'s first parameter is pushed last).
global_asm!(
    r#"
.section .multiboot_header
.align 4
.long 0x1BADB002
.long 0x3
.long -(0x1BADB002 + 0x3)

.section .bss
.align 16
boot_stack_bottom:
.skip 65536
boot_stack_top:

.section .text
.global _start
_start:
    mov esp, boot_stack_top
    push ebx
    push eax
    call rust_main
_start.hang:
    hlt
    jmp _start.hang
"#
);

/// Panics unless the boot contract holds: correct magic, memory info
/// present, at least [`config::MULTIBOOT_MIN_RAM_MIB`] of RAM, and a memory
/// map present. Returns the validated `MultibootInfo` reference and total
/// RAM in bytes.
fn validate_boot_contract(magic: u32, mbi_ptr: u32) -> (&'static MultibootInfo, u64) {
    if magic != BOOTLOADER_MAGIC {
        panic!("boot: bad multiboot magic {:#x}", magic);
    }
    let info = unsafe { &*(mbi_ptr as *const MultibootInfo) };
    let flags = info.flags();
    if !flags.contains(InfoFlags::MEM_INFO) {
        panic!("boot: multiboot info missing MEM_INFO");
    }
    if !flags.contains(InfoFlags::MMAP) {
        panic!("boot: multiboot info missing MMAP");
    }
    let total_kib = info.total_mem_kib();
    let min_kib = config::MULTIBOOT_MIN_RAM_MIB * 1024;
    if total_kib < min_kib {
        panic!("boot: only {} KiB RAM, need at least {} KiB", total_kib, min_kib);
    }
    (info, total_kib * 1024)
}

#[no_mangle]
pub extern "C" fn rust_main(magic: u32, mbi_ptr: u32) -> ! {
    serial::init();
    logger::init();

    let (info, total_ram_bytes) = validate_boot_contract(magic, mbi_ptr);
    log::info!("boot: multiboot ok, {} MiB RAM", total_ram_bytes / (1024 * 1024));

    pmm::init(total_ram_bytes);

    // Reserve the kernel's own image (1 MiB load address through
    // `_kernel_end`) and the BIOS/real-mode low memory below it so the
    // frame allocator never hands back memory the running kernel occupies.
    let kernel_end = unsafe { core::ptr::addr_of!(_kernel_end) as u32 };
    let reserved_frames = kernel_end.div_ceil(config::PAGE_SIZE);
    for frame in 0..reserved_frames {
        pmm::reserve(frame as usize);
    }

    arch::init();

    let max_phys = (total_ram_bytes as u32).saturating_sub(1);
    let kernel_pd_phys = arch::init_paging(max_phys);

    heap::init(4096);
    task::init_kernel_ctx(kernel_pd_phys);

    arch::x86::isr::register_handler(32, tick::on_timer);

    ide::init();
    let ext2 = ext2::Ext2Mount::new(ide::primary()).expect("boot: failed to mount ext2 root");
    vfs::mount("/", Arc::new(ext2)).expect("boot: failed to register root mount");

    let init_bytes = load_init_image();

    let init_pid = task::task_new(None).expect("boot: failed to create init task");
    elf::load_into_task(init_pid, &init_bytes, &[config::INIT_PATH], &[])
        .expect("boot: init binary failed to load");

    let _ = info;
    arch::enable_interrupts();
    sched::enter(init_pid);
}

fn load_init_image() -> alloc::vec::Vec<u8> {
    let mut file = vfs::open(config::INIT_PATH, 0).expect("boot: init binary not found");
    let stat = vfs::stat(&file).expect("boot: could not stat init binary");
    let mut data = alloc::vec![0u8; stat.size as usize];
    let mut off = 0usize;
    while off < data.len() {
        let n = vfs::read(&mut file, &mut data[off..]).expect("boot: read of init binary failed");
        if n == 0 {
            break;
        }
        off += n;
    }
    data.truncate(off);
    data
}

#[panic_handler]
fn panic(info: &PanicInfo) -> ! {
    log::error!("panic: {}", info);
    loop {
        unsafe {
            core::arch::asm!("cli", "hlt", options(nomem, nostack, preserves_flags));
        }
    }
}

#[alloc_error_handler]
fn oom(layout: core::alloc::Layout) -> ! {
    log::error!("out of memory: requested {} bytes, align {}", layout.size(), layout.align());
    loop {
        unsafe {
            core::arch::asm!("cli", "hlt", options(nomem, nostack, preserves_flags));
        }
    }
}
