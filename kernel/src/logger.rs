//! `log` facade backed by the serial UART. Installed once at boot; every
//! other module logs through `log::{info, warn, ...}` rather than writing
//! to serial directly, so verbosity is controlled in one place
//! ([`config::LOG_LEVEL`]).

use core::fmt::Write;

use log::{Level, Log, Metadata, Record};
use spin::Mutex;

use crate::serial::SerialPort;

struct SerialLogger {
    port: Mutex<SerialPort>,
}

static LOGGER: SerialLogger = SerialLogger { port: Mutex::new(SerialPort) };

impl Log for SerialLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= crate::config::LOG_LEVEL
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }
        let level_tag = match record.level() {
            Level::Error => "ERROR",
            Level::Warn => "WARN ",
            Level::Info => "INFO ",
            Level::Debug => "DEBUG",
            Level::Trace => "TRACE",
        };
        let mut port = self.port.lock();
        let _ = writeln!(port, "[{}] {}: {}", level_tag, record.target(), record.args());
    }

    fn flush(&self) {}
}

pub fn init() {
    log::set_logger(&LOGGER).expect("logger already installed");
    log::set_max_level(crate::config::LOG_LEVEL);
}
