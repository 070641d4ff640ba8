use crate::debug_trace;
use log::{LevelFilter, Log, Metadata, Record, SetLoggerError};
use tephra_sync::SyncOnceCell;

/// `log` backend writing to the QEMU debug console.
pub struct DebugconLogger {
    max_level: LevelFilter,
}

static LOGGER: SyncOnceCell<DebugconLogger> = SyncOnceCell::new();

impl DebugconLogger {
    #[must_use]
    pub const fn new(max_level: LevelFilter) -> Self {
        Self { max_level }
    }

    /// Install as the global logger. Call once, early.
    pub fn init(self) -> Result<(), SetLoggerError> {
        let max_level = self.max_level;
        let logger = LOGGER.get_or_init(|| self);
        log::set_logger(logger)?;
        log::set_max_level(max_level);
        Ok(())
    }
}

impl Log for DebugconLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= self.max_level
    }

    fn log(&self, record: &Record) {
        if self.enabled(record.metadata()) {
            debug_trace!("[{}] {}: {}\n", record.level(), record.target(), record.args());
        }
    }

    fn flush(&self) {}
}
