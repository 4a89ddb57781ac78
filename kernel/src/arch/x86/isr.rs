//! Interrupt/trap entry machinery: per-vector assembly trampolines that
//! save a uniform [`CpuState`], call into Rust, and — for the timer and
//! syscall gates, which may provoke a task switch — conditionally resume
//! a different task's saved stack before `iret`ing.
//!
//! Every stub assumes the trap was taken from ring3 (the one case this
//! kernel cares about: a user task either faulting, ticking, or trapping
//! via `int 0x80`), so the CPU always pushes the full five-dword
//! privilege-change frame (`eip, cs, eflags, esp, ss`). A kernel-mode
//! timer tick during the scheduler's empty-ready-queue idle spin would
//! violate that assumption; this reimplementation accepts that narrowing
//! (see DESIGN.md) since the idle loop is reached only when every task has
//! exited, at which point there is nothing left to preempt.

use core::arch::global_asm;

use super::{gdt, paging, pic};
use crate::{sched, syscall};

/// Registers saved by every trampoline, in push order, followed by the
/// CPU-pushed exception frame. This is the `cpu_state` the spec's Task
/// carries and the pointer every Rust-side handler receives.
#[repr(C)]
#[derive(Copy, Clone, Debug, Default)]
pub struct CpuState {
    pub edi: u32,
    pub esi: u32,
    pub ebp: u32,
    /// Original ESP as recorded by `pushad`; ignored on `popad`, kept here
    /// only so the field offsets line up with what the CPU actually wrote.
    pub _pushad_esp: u32,
    pub ebx: u32,
    pub edx: u32,
    pub ecx: u32,
    pub eax: u32,

    pub vector: u32,
    pub error_code: u32,

    pub eip: u32,
    pub cs: u32,
    pub eflags: u32,
    pub user_esp: u32,
    pub user_ss: u32,
}

type HandlerFn = fn(&mut CpuState);
static mut HANDLERS: [Option<HandlerFn>; 256] = [None; 256];

pub fn register_handler(vector: u8, handler: HandlerFn) {
    unsafe {
        HANDLERS[vector as usize] = Some(handler);
    }
}

static mut IN_INTERRUPT: bool = false;

/// Physical address of the next task's page directory, set by
/// [`crate::sched::on_timer_tick`] immediately before it returns a nonzero
/// saved-stack pointer; read by `isr_common` only on the task-switch path.
#[no_mangle]
static mut NEXT_CR3: u32 = 0;

pub fn set_next_cr3(phys: u32) {
    unsafe {
        NEXT_CR3 = phys;
    }
}

/// Common dispatcher for every exception/IRQ stub. Implements the
/// re-entrancy guard and EOI ordering from the interrupt design: nested
/// interrupts are dropped, EOI goes to the slave PIC first for vectors
/// >= 40 and always to the master for any IRQ (vector >= 32).
#[no_mangle]
extern "C" fn common_interrupt_dispatch(state: *mut CpuState) -> u32 {
    let state = unsafe { &mut *state };

    unsafe {
        if IN_INTERRUPT {
            return 0;
        }
        IN_INTERRUPT = true;
    }

    if state.vector >= 32 {
        if state.vector >= 40 {
            pic::eoi(8);
        }
        pic::eoi(0);
    }

    if (0..32).contains(&state.vector) && state.vector != 14 {
        fault::handle(state);
    } else {
        let handler = unsafe { HANDLERS[state.vector as usize] };
        if let Some(handler) = handler {
            handler(state);
        }
    }

    let switch_to = if state.vector == 32 {
        sched::on_timer_tick(state)
    } else {
        0
    };

    unsafe {
        IN_INTERRUPT = false;
    }
    switch_to
}

#[no_mangle]
extern "C" fn syscall_dispatch(state: *mut CpuState) {
    let state = unsafe { &mut *state };
    syscall::dispatch(state);
}

mod fault {
    use super::CpuState;
    use crate::arch::x86::idt::EXCEPTION_NAMES;

    pub fn handle(state: &mut CpuState) {
        if state.vector == 14 {
            super::paging::handle_page_fault(state);
            return;
        }

        let name = EXCEPTION_NAMES
            .get(state.vector as usize)
            .copied()
            .unwrap_or("Unknown CPU error");

        if state.cs & 0x3 != 0 {
            // Fault in a user task: terminate it, don't take down the kernel.
            crate::task::terminate_current_on_fault(name, state);
        } else {
            panic!(
                "fatal CPU exception: {} (vector={}, error_code={:#x}, eip={:#x})",
                name, state.vector, state.error_code, state.eip
            );
        }
    }
}

macro_rules! exception_stub {
    ($name:ident, $vector:literal, no_err) => {
        global_asm!(
            concat!(
                ".global ", stringify!($name), "\n",
                stringify!($name), ":\n",
                "push 0\n",
                "push ", stringify!($vector), "\n",
                "jmp isr_common\n",
            )
        );
    };
    ($name:ident, $vector:literal, err) => {
        global_asm!(
            concat!(
                ".global ", stringify!($name), "\n",
                stringify!($name), ":\n",
                "push ", stringify!($vector), "\n",
                "jmp isr_common\n",
            )
        );
    };
}

extern "C" {
    fn isr0();
    fn isr1();
    fn isr2();
    fn isr3();
    fn isr4();
    fn isr5();
    fn isr6();
    fn isr7();
    fn isr8();
    fn isr9();
    fn isr10();
    fn isr11();
    fn isr12();
    fn isr13();
    fn isr14();
    fn isr15();
    fn isr16();
    fn isr17();
    fn isr18();
    fn isr19();
    fn isr20();
    fn isr21();
    fn isr22();
    fn isr23();
    fn isr24();
    fn isr25();
    fn isr26();
    fn isr27();
    fn isr28();
    fn isr29();
    fn isr30();
    fn isr31();
    fn irq0_timer();
    fn syscall_stub();
}

pub static EXCEPTION_STUBS: [unsafe extern "C" fn(); 32] = [
    isr0, isr1, isr2, isr3, isr4, isr5, isr6, isr7, isr8, isr9, isr10, isr11, isr12, isr13, isr14,
    isr15, isr16, isr17, isr18, isr19, isr20, isr21, isr22, isr23, isr24, isr25, isr26, isr27,
    isr28, isr29, isr30, isr31,
];

pub static IRQ_STUBS: [unsafe extern "C" fn(); 1] = [irq0_timer];

exception_stub!(isr0, 0, no_err);
exception_stub!(isr1, 1, no_err);
exception_stub!(isr2, 2, no_err);
exception_stub!(isr3, 3, no_err);
exception_stub!(isr4, 4, no_err);
exception_stub!(isr5, 5, no_err);
exception_stub!(isr6, 6, no_err);
exception_stub!(isr7, 7, no_err);
exception_stub!(isr8, 8, err);
exception_stub!(isr9, 9, no_err);
exception_stub!(isr10, 10, err);
exception_stub!(isr11, 11, err);
exception_stub!(isr12, 12, err);
exception_stub!(isr13, 13, err);
exception_stub!(isr14, 14, err);
exception_stub!(isr15, 15, no_err);
exception_stub!(isr16, 16, no_err);
exception_stub!(isr17, 17, err);
exception_stub!(isr18, 18, no_err);
exception_stub!(isr19, 19, no_err);
exception_stub!(isr20, 20, no_err);
exception_stub!(isr21, 21, no_err);
exception_stub!(isr22, 22, no_err);
exception_stub!(isr23, 23, no_err);
exception_stub!(isr24, 24, no_err);
exception_stub!(isr25, 25, no_err);
exception_stub!(isr26, 26, no_err);
exception_stub!(isr27, 27, no_err);
exception_stub!(isr28, 28, no_err);
exception_stub!(isr29, 29, no_err);
exception_stub!(isr30, 30, err);
exception_stub!(isr31, 31, no_err);

global_asm!(
    r#"
.global irq0_timer
irq0_timer:
    push 0
    push 32
    jmp isr_common

.global isr_common
isr_common:
    pushad
    push esp
    call common_interrupt_dispatch
    add esp, 4
    test eax, eax
    jz 1f
    mov esp, eax
    mov ecx, [NEXT_CR3]
    mov cr3, ecx
1:
    popad
    add esp, 8
    iretd

.global syscall_stub
syscall_stub:
    push 0
    push 0x80
    pushad
    push esp
    call syscall_dispatch
    add esp, 4
    popad
    add esp, 8
    iretd
"#
);

/// Walk the current task's page directory to translate a user virtual
/// address, enforcing the `U` bit at every level (mirrors `set_range`'s
/// flag propagation in reverse). `None` means the pointer does not belong
/// to the calling task.
pub fn user_virt_to_phys(virt: u32) -> Option<u32> {
    let cr3 = unsafe {
        let v: u32;
        core::arch::asm!("mov {0}, cr3", out(reg) v, options(nomem, nostack, preserves_flags));
        v
    };
    paging::translate_user(cr3, virt)
}

pub fn user_copy_in(dst: &mut [u8], user_ptr: u32) -> Option<()> {
    for (i, b) in dst.iter_mut().enumerate() {
        let p = user_virt_to_phys(user_ptr.wrapping_add(i as u32))?;
        *b = unsafe { core::ptr::read_volatile(paging::phys_to_virt_ptr::<u8>(p)) };
    }
    Some(())
}

pub fn user_copy_out(user_ptr: u32, src: &[u8]) -> Option<()> {
    for (i, b) in src.iter().enumerate() {
        let p = user_virt_to_phys(user_ptr.wrapping_add(i as u32))?;
        unsafe { core::ptr::write_volatile(paging::phys_to_virt_ptr::<u8>(p), *b) };
    }
    Some(())
}

pub fn set_kernel_stack(esp0: u32) {
    gdt::set_kernel_stack(esp0);
}
