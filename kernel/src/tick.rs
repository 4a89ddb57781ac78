//! Monotonic tick counter driven off the PIT's IRQ0, per the reference
//! `pit.c`/`sleep.c` pair: one global counter incremented on every timer
//! interrupt, and `sleep_ticks` halt-spinning until it catches up.
//! [`crate::sched`] reads the same interrupt to drive preemption; this
//! module only owns the counter and the sleep primitive.

use core::sync::atomic::{AtomicU64, Ordering};

use crate::arch::x86::isr::CpuState;
use crate::config::PIT_RATE_HZ;

static TICKS: AtomicU64 = AtomicU64::new(0);

/// Registered at vector 32 alongside the scheduler's own timer hook; both
/// run on every IRQ0, this one just advances the counter.
pub fn on_timer(_state: &mut CpuState) {
    TICKS.fetch_add(1, Ordering::Relaxed);
}

pub fn now() -> u64 {
    TICKS.load(Ordering::Relaxed)
}

/// Halts in a loop until at least `seconds` have elapsed. One of the three
/// suspension points the design allows outside of `pipe_read` and the idle
/// loop; interrupts must be enabled for the halt to ever wake up.
pub fn sleep_ticks(ticks: u64) {
    let target = now().saturating_add(ticks);
    while now() < target {
        unsafe {
            core::arch::asm!("sti", "hlt", options(nostack, preserves_flags));
        }
    }
}

pub fn sleep_seconds(seconds: u64) {
    sleep_ticks(seconds * PIT_RATE_HZ as u64);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn now_starts_at_some_value_and_is_monotonic() {
        let a = now();
        TICKS.fetch_add(1, Ordering::Relaxed);
        let b = now();
        assert!(b > a);
    }
}
