//! 32-bit Interrupt Descriptor Table: 256 eight-byte gates. Gates 0-31 are
//! CPU exceptions, 32-47 are the PIC-remapped IRQs, 0x80 is the syscall
//! gate (the only one with DPL=3, since it's the one ring3 is allowed to
//! invoke via `int`).

use core::mem::size_of;

use super::isr;

#[repr(C, packed)]
#[derive(Copy, Clone)]
struct IdtEntry {
    offset_low: u16,
    selector: u16,
    zero: u8,
    type_attr: u8,
    offset_high: u16,
}

impl IdtEntry {
    const fn missing() -> Self {
        IdtEntry { offset_low: 0, selector: 0, zero: 0, type_attr: 0, offset_high: 0 }
    }

    fn new(handler: u32, selector: u16, type_attr: u8) -> Self {
        IdtEntry {
            offset_low: (handler & 0xFFFF) as u16,
            selector,
            zero: 0,
            type_attr,
            offset_high: ((handler >> 16) & 0xFFFF) as u16,
        }
    }
}

#[repr(C, packed)]
struct Idtr {
    limit: u16,
    base: u32,
}

const GATE_INTERRUPT_RING0: u8 = 0x8E;
const GATE_INTERRUPT_RING3: u8 = 0xEE;
const KCODE_SEL: u16 = super::gdt::KCODE_SEL;

const IDT_ENTRIES: usize = 256;
static mut IDT: [IdtEntry; IDT_ENTRIES] = [IdtEntry::missing(); IDT_ENTRIES];

/// Names for vectors 0-31, used by the fault handler's panic message.
pub const EXCEPTION_NAMES: [&str; 32] = [
    "Division by zero",
    "Debug",
    "Non-maskable interrupt",
    "Breakpoint",
    "Overflow",
    "Bound range exceeded",
    "Invalid opcode",
    "Device not available",
    "Double fault",
    "Coprocessor segment overrun",
    "Invalid TSS",
    "Segment not present",
    "Stack-segment fault",
    "General protection fault",
    "Page fault",
    "Reserved",
    "x87 floating-point exception",
    "Alignment check",
    "Machine check",
    "SIMD floating-point exception",
    "Virtualization exception",
    "Control protection exception",
    "Reserved",
    "Reserved",
    "Reserved",
    "Reserved",
    "Reserved",
    "Reserved",
    "Hypervisor injection exception",
    "VMM communication exception",
    "Security exception",
    "Reserved",
];

pub fn init() {
    unsafe {
        for (vector, stub) in isr::EXCEPTION_STUBS.iter().enumerate() {
            IDT[vector] = IdtEntry::new(*stub as u32, KCODE_SEL, GATE_INTERRUPT_RING0);
        }
        for (i, stub) in isr::IRQ_STUBS.iter().enumerate() {
            IDT[32 + i] = IdtEntry::new(*stub as u32, KCODE_SEL, GATE_INTERRUPT_RING0);
        }
        IDT[0x80] = IdtEntry::new(isr::syscall_stub as u32, KCODE_SEL, GATE_INTERRUPT_RING3);

        let idtr = Idtr {
            limit: (size_of::<[IdtEntry; IDT_ENTRIES]>() - 1) as u16,
            base: core::ptr::addr_of!(IDT) as u32,
        };
        core::arch::asm!("lidt [{0}]", in(reg) &idtr, options(nostack, preserves_flags));
    }
}

pub fn enable_interrupts() {
    unsafe {
        core::arch::asm!("sti", options(nostack, preserves_flags));
    }
}

pub fn disable_interrupts() {
    unsafe {
        core::arch::asm!("cli", options(nostack, preserves_flags));
    }
}
