//! Captures log records for tests.

use log::{Level, LevelFilter, Log, Metadata, Record};
use parking_lot::{const_mutex, Mutex};

static RECORDS: Mutex<Vec<(Level, String)>> = const_mutex(Vec::new());

struct CaptureLogger;

impl Log for CaptureLogger {
    fn enabled(&self, _: &Metadata) -> bool {
        true
    }
    fn log(&self, record: &Record) {
        RECORDS
            .lock()
            .push((record.level(), record.args().to_string()));
    }
    fn flush(&self) {}
}

static LOGGER: CaptureLogger = CaptureLogger;

/// Installs the capture logger, once per process.
pub(crate) fn init() {
    if log::set_logger(&LOGGER).is_ok() {
        log::set_max_level(LevelFilter::Trace);
    }
}

/// Number of records at `level` containing `needle`.
pub(crate) fn count(level: Level, needle: &str) -> usize {
    RECORDS
        .lock()
        .iter()
        .filter(|(l, message)| *l == level && message.contains(needle))
        .count()
}
