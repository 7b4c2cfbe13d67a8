use std::{fmt, io::Write as _, sync::OnceLock, thread, time::Instant};

use log::{Level, LevelFilter, Log, Metadata, Record};

static LOGGER: Logger = Logger {
    start: OnceLock::new(),
};

struct Logger {
    start: OnceLock<Instant>,
}

pub(crate) fn init(max_level: LevelFilter) -> Result<(), log::SetLoggerError> {
    LOGGER.start.get_or_init(Instant::now);
    log::set_logger(&LOGGER)?;
    log::set_max_level(max_level);
    Ok(())
}

impl Log for Logger {
    fn enabled(&self, metadata: &Metadata<'_>) -> bool {
        metadata.level() <= log::max_level()
    }

    fn log(&self, record: &Record<'_>) {
        if !self.enabled(record.metadata()) {
            return;
        }
        let now = self.start.get().map(Instant::elapsed).unwrap_or_default();
        let current = thread::current();
        let name = current.name().unwrap_or("?");
        let mut stderr = std::io::stderr().lock();
        let _ = writeln!(
            stderr,
            "{now:?} [{name}] {} {}",
            LevelFormat(record.level()),
            record.args()
        );
    }

    fn flush(&self) {
        let _ = std::io::stderr().flush();
    }
}

struct LevelFormat(Level);

impl fmt::Display for LevelFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let color = match self.0 {
            Level::Trace => 35,
            Level::Debug => 34,
            Level::Info => 32,
            Level::Warn => 33,
            Level::Error => 31,
        };
        let msg = match self.0 {
            Level::Trace => "TRACE",
            Level::Debug => "DEBUG",
            Level::Info => " INFO",
            Level::Warn => " WARN",
            Level::Error => "ERROR",
        };
        write!(f, "\x1B[{color};1m{msg}\x1B[0m")
    }
}
