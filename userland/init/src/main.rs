#![no_std]
#![no_main]

//! The first user task the kernel loads (`/sbin/init`). Grounded on the
//! reference's `_start` shape — pull `argc`/`argv` off the stack the
//! loader built, then drop into a small syscall-driven body — reworked
//! against the 32-bit `int 0x80` ABI in `quark_sys::syscall` instead of the
//! reference's 64-bit register-passed role/endpoint convention, since this
//! kernel has no IPC/capability layer to demo against.

use core::arch::{asm, global_asm};
use core::panic::PanicInfo;

use quark_sys::syscall;

// The stack `task_set_initial_state` builds places `argc` at the top of the
// stack with `argv[0..argc]`, a NULL, `envp[0..]`, and a final NULL above
// it — the standard i386 crt0 contract. `_start` has no parameters of its
// own (the loader jumps here with nothing but that stack), so a tiny asm
// shim reads `argc`/`argv` off it and calls into Rust with a normal cdecl
// argument list.
global_asm!(
    r#"
.section .text
.global _start
_start:
    mov eax, [esp]
    lea ecx, [esp + 4]
    push ecx
    push eax
    call rust_start
_start.hang:
    hlt
    jmp _start.hang
"#
);

#[inline(always)]
unsafe fn syscall3(n: u32, a0: u32, a1: u32, a2: u32) -> i32 {
    let ret: u32;
    asm!(
        "int 0x80",
        inout("eax") n => ret,
        in("ebx") a0,
        in("ecx") a1,
        in("edx") a2,
        options(nostack)
    );
    ret as i32
}

fn write(fd: u32, buf: &[u8]) -> i32 {
    unsafe { syscall3(syscall::WRITE, fd, buf.as_ptr() as u32, buf.len() as u32) }
}

fn exit(code: i32) -> ! {
    unsafe {
        syscall3(syscall::EXIT, code as u32, 0, 0);
    }
    // exit() never returns control to its caller; spin in case it somehow did.
    loop {
        unsafe { asm!("hlt", options(nomem, nostack, preserves_flags)) };
    }
}

#[no_mangle]
pub extern "C" fn rust_start(_argc: u32, _argv: *const *const u8) -> ! {
    let wrote = write(1, b"ok\n");
    exit(if wrote >= 0 { 0 } else { 1 });
}

#[panic_handler]
fn panic(_info: &PanicInfo) -> ! {
    exit(1);
}
