pub mod gdt;
pub mod idt;
pub mod isr;
pub mod paging;
mod pic;
mod pit;
mod port;

pub use port::{inb, inw, outb, outw};

pub fn init() {
    gdt::init();
    idt::init();
    pic::init();
    pit::init(crate::config::PIT_RATE_HZ);
}

pub fn enable_interrupts() {
    idt::enable_interrupts();
}
