//! Console output
//!
//! The console is the sink for everything a user process prints (fd 1 and
//! the `exit(N)` line) and, through `ConsoleLogger`, for kernel
//! diagnostics. The device behind it is supplied by the platform.

use core::fmt::{self, Write};

use log::{LevelFilter, Log, Metadata, Record};

/// A byte sink the kernel can print to.
pub trait Console: Send + Sync {
    /// Write `bytes` to the console as one unit (`putbuf`).
    fn put_bytes(&self, bytes: &[u8]);
}

/// `core::fmt::Write` adapter over a console.
pub struct ConsoleWriter<'a>(pub &'a dyn Console);

impl Write for ConsoleWriter<'_> {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        self.0.put_bytes(s.as_bytes());
        Ok(())
    }
}

/// `log` backend printing `[LEVEL] target: message` lines on a console.
pub struct ConsoleLogger<C: Console> {
    console: C,
    level: LevelFilter,
}

impl<C: Console> ConsoleLogger<C> {
    pub const fn new(console: C, level: LevelFilter) -> Self {
        Self { console, level }
    }

    /// Install this logger as the global `log` backend.
    pub fn install(&'static self) -> Result<(), log::SetLoggerError> {
        log::set_logger(self)?;
        log::set_max_level(self.level);
        Ok(())
    }
}

impl<C: Console> Log for ConsoleLogger<C> {
    fn enabled(&self, metadata: &Metadata<'_>) -> bool {
        metadata.level() <= self.level
    }

    fn log(&self, record: &Record<'_>) {
        if !self.enabled(record.metadata()) {
            return;
        }
        let mut out = ConsoleWriter(&self.console);
        let _ = writeln!(out, "[{}] {}: {}", record.level(), record.target(), record.args());
    }

    fn flush(&self) {}
}
