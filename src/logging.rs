use chrono::Local;
use log::{Level, LevelFilter, Log, Metadata, Record, SetLoggerError};

// ── Console logger ──────────────────────────────────────────────────────────

/// Minimal console logger used by the fabric binaries and tests.
///
/// Lines look like `2026-08-26 14:03:11.042 INFO  [watchalong_fabric::swarm]
/// Peer -WA0001-… connected`. Messages below the configured level are
/// filtered before formatting.
struct ConsoleLogger {
    level: LevelFilter,
}

impl Log for ConsoleLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= self.level
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }
        eprintln!("{}", format_record(record));
    }

    fn flush(&self) {}
}

fn format_record(record: &Record) -> String {
    let ts = Local::now().format("%Y-%m-%d %H:%M:%S%.3f");
    format!(
        "{ts} {:<5} [{}] {}",
        level_tag(record.level()),
        record.target(),
        record.args()
    )
}

fn level_tag(level: Level) -> &'static str {
    match level {
        Level::Error => "ERROR",
        Level::Warn => "WARN",
        Level::Info => "INFO",
        Level::Debug => "DEBUG",
        Level::Trace => "TRACE",
    }
}

/// Install the console logger as the global `log` backend.
///
/// Calling this twice returns an error from the `log` facade; callers that
/// may race (tests) should ignore the result.
pub fn init(level: LevelFilter) -> Result<(), SetLoggerError> {
    log::set_boxed_logger(Box::new(ConsoleLogger { level }))?;
    log::set_max_level(level);
    Ok(())
}
