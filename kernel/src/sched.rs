//! Round-robin preemptive scheduler. Grounded on the reference scheduler's
//! tick-driven `switch_from` shape (save the outgoing task, pick the next
//! runnable one, install its address space and kernel stack, hand back its
//! saved stack pointer or zero to keep running) — reworked against
//! [`crate::task`]'s indexed task table instead of a flat `Proc` array,
//! since task lifecycle here is owned entirely by `task.rs`.
//!
//! This module owns only *who runs next*; `task.rs` owns task state itself,
//! and [`crate::arch::x86::isr`]'s trampolines are what actually move `esp`
//! and `cr3` once this module has decided.

use core::sync::atomic::{AtomicU64, Ordering};

use crate::arch::x86::gdt;
use crate::arch::x86::isr::{self, CpuState};
use crate::task;

static TICKS: AtomicU64 = AtomicU64::new(0);

/// Copies `state` into `pid`'s resident trapframe (the top of its kernel
/// stack), points the TSS and `NEXT_CR3` at it, and returns the frame's
/// address together with `pid`'s page-directory physical address — the
/// frame is what `isr_common` loads into `esp` to resume it, and callers
/// that resume a task directly (rather than returning into `isr_common`,
/// which reloads `cr3` itself from `NEXT_CR3`) must switch to the latter
/// themselves.
fn install(pid: u32, state: &CpuState) -> Option<(u32, u32)> {
    let (pd_phys, kstack_top) = task::task_switch_info(pid)?;
    let frame_ptr = (kstack_top - core::mem::size_of::<CpuState>() as u32) as *mut CpuState;
    unsafe { core::ptr::write_volatile(frame_ptr, *state) };
    gdt::set_kernel_stack(kstack_top);
    isr::set_next_cr3(pd_phys);
    Some((frame_ptr as u32, pd_phys))
}

/// Called on every vector-32 (PIT) tick with the interrupted task's saved
/// state. Requeues the current task as `Ready`, picks the next `Ready` task
/// in pid order after it, and returns its saved-stack pointer — or `0`,
/// telling the trampoline to resume the current task untouched, when no
/// other task is ready (including very early ticks before any task has
/// been installed).
pub fn on_timer_tick(state: *mut CpuState) -> u32 {
    TICKS.fetch_add(1, Ordering::Relaxed);

    let Some(current) = task::current_pid() else {
        return 0;
    };
    let state = unsafe { &mut *state };

    let Some(next) = task::pick_next_ready(current, true) else {
        return 0;
    };
    if next == current {
        return 0;
    }

    // Persist the outgoing task's trapframe in its own resident slot before
    // handing control elsewhere: whichever tick next picks it again needs
    // its saved state still there.
    install(current, state);
    task::set_current_pid(next);
    install(next, state).map(|(frame, _pd_phys)| frame).unwrap_or(0)
}

/// Invoked after the current task has already been torn down by
/// `task_exit` (a fatal fault or page fault). Picks any ready task — there
/// is no outgoing task left to requeue — and resumes it immediately rather
/// than waiting for the next tick. Never returns: either it hands off to a
/// task via `iret`, or it halts waiting for one to become ready.
pub fn force_switch(state: &mut CpuState) -> ! {
    loop {
        if let Some(next) = task::pick_next_ready_any() {
            task::set_current_pid(next);
            if let Some((frame, pd_phys)) = install(next, state) {
                // Unlike `on_timer_tick`, this path never returns into
                // `isr_common` (which would reload `cr3` from `NEXT_CR3`
                // itself) — it `iret`s straight out of Rust, so the page
                // directory switch has to happen here, same as `enter()`.
                paging_switch(pd_phys);
                unsafe {
                    core::arch::asm!(
                        "mov esp, {0}",
                        "popad",
                        "add esp, 8",
                        "iretd",
                        in(reg) frame,
                        options(noreturn),
                    );
                }
            }
        }
        unsafe {
            core::arch::asm!("sti", "hlt", options(nostack, preserves_flags));
        }
    }
}

pub fn ticks() -> u64 {
    TICKS.load(Ordering::Relaxed)
}

/// Jumps into `pid` for the very first time after boot. `pid` must already
/// carry a resident trapframe (built by
/// [`crate::task::task_set_initial_state`]); there is no outgoing task to
/// save, unlike `on_timer_tick`/`force_switch`. Never returns.
pub fn enter(pid: u32) -> ! {
    task::set_current_pid(pid);
    let (pd_phys, kstack_top) =
        task::task_switch_info(pid).expect("sched::enter: task has no switch info");
    gdt::set_kernel_stack(kstack_top);
    isr::set_next_cr3(pd_phys);
    paging_switch(pd_phys);
    let frame = kstack_top - core::mem::size_of::<CpuState>() as u32;
    unsafe {
        core::arch::asm!(
            "mov esp, {0}",
            "popad",
            "add esp, 8",
            "iretd",
            in(reg) frame,
            options(noreturn),
        );
    }
}

fn paging_switch(pd_phys: u32) {
    crate::arch::x86::paging::switch_to(pd_phys);
}
