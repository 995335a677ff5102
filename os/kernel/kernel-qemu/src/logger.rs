use crate::qemu_trace;
use core::fmt;
use log::{LevelFilter, Log, Metadata, Record, SetLoggerError};

/// `log::Log` implementation writing to the QEMU debug port.
pub struct QemuLogger;

static LOGGER: QemuLogger = QemuLogger;

/// Install the logger. Call once during early init.
///
/// # Errors
/// Fails if another logger was installed first.
pub fn init(max_level: LevelFilter) -> Result<(), SetLoggerError> {
    log::set_logger(&LOGGER)?;
    log::set_max_level(max_level);
    Ok(())
}

/// Render a record as `[LEVEL] target: message\n`.
///
/// # Errors
/// Propagates errors of the underlying writer.
pub fn write_record(out: &mut impl fmt::Write, record: &Record<'_>) -> fmt::Result {
    writeln!(out, "[{}] {}: {}", record.level(), record.target(), record.args())
}

impl Log for QemuLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= log::max_level()
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }
        qemu_trace!("{}", Rendered(record));
    }

    fn flush(&self) {}
}

struct Rendered<'a, 'r>(&'a Record<'r>);

impl fmt::Display for Rendered<'_, '_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write_record(f, self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use log::Level;

    #[test]
    fn record_format() {
        let mut out = String::new();
        write_record(
            &mut out,
            &Record::builder()
                .level(Level::Info)
                .target("kernel_alloc::heap")
                .args(format_args!("grew by {} pages", 4))
                .build(),
        )
        .unwrap();
        assert_eq!(out, "[INFO] kernel_alloc::heap: grew by 4 pages\n");
    }
}
