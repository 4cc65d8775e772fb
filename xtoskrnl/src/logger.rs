//! `log` facade backend for the kernel side of the boot handoff.
//!
//! Grounded on `kernel/src/out/uart.rs`'s `UART_COM1` port and `print!`
//! macro: the loader initializes logging through `uefi_services::init`
//! (`bl/src/main.rs`), which has no counterpart once boot services are
//! gone, so the kernel installs its own minimal `log::Log` writing through
//! the same serial sink `out::__print` already uses.

use core::fmt::Write;

use log::{Level, LevelFilter, Log, Metadata, Record};

use crate::out::uart::UART_COM1;

struct SerialLogger;

impl Log for SerialLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= Level::Info
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }
        let _ = writeln!(
            UART_COM1.0.lock(),
            "[{}] {}",
            record.level(),
            record.args()
        );
    }

    fn flush(&self) {}
}

static LOGGER: SerialLogger = SerialLogger;

/// Installs the serial-backed logger as the `log` crate's global logger.
/// Idempotent: `log::set_logger` failing because it was already called is
/// not treated as an error.
pub fn init() {
    let _ = log::set_logger(&LOGGER);
    log::set_max_level(LevelFilter::Info);
}
