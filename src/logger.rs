//! Logging backend usable from signal handlers.
//!
//! Formats into a stack buffer and emits with a single `write(2)` to stderr;
//! no allocation, no locks, so the FP-trap and break-trap handlers can log
//! without deadlocking the target. Lines carry the calling thread id since
//! every interesting event here is per-thread.

use core::fmt::{self, Write};

use log::{Level, LevelFilter, Log, Metadata, Record};

const LINE_CAP: usize = 512;

struct LineBuf {
    buf: [u8; LINE_CAP],
    len: usize,
}

impl LineBuf {
    const fn new() -> Self {
        Self { buf: [0; LINE_CAP], len: 0 }
    }
}

impl fmt::Write for LineBuf {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        let room = LINE_CAP - self.len;
        let n = s.len().min(room);
        self.buf[self.len..self.len + n].copy_from_slice(&s.as_bytes()[..n]);
        self.len += n;
        Ok(())
    }
}

struct StderrLogger;

static LOGGER: StderrLogger = StderrLogger;

impl Log for StderrLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= log::max_level()
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }
        let tag = match record.level() {
            Level::Error => "ERROR",
            Level::Warn => "warn",
            Level::Info => "info",
            _ => "debug",
        };
        let tid = unsafe { libc::gettid() };
        let mut line = LineBuf::new();
        let _ = writeln!(line, "fpspy: {tag}({tid:8}): {}", record.args());
        unsafe {
            libc::write(
                libc::STDERR_FILENO,
                line.buf.as_ptr() as *const libc::c_void,
                line.len,
            );
        }
    }

    fn flush(&self) {}
}

/// Installs the backend. Debug output stays on until the configured level
/// arrives via [`set_debug_level`].
pub fn init() {
    let _ = log::set_logger(&LOGGER);
    log::set_max_level(LevelFilter::Debug);
}

/// Levels 0 and 1 silence `debug!`; the default level (2) keeps it.
pub fn set_debug_level(level: u8) {
    log::set_max_level(if level > 1 {
        LevelFilter::Debug
    } else {
        LevelFilter::Info
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn line_buffer_truncates_instead_of_overflowing() {
        let mut line = LineBuf::new();
        let long = "x".repeat(2 * LINE_CAP);
        let _ = line.write_str(&long);
        assert_eq!(line.len, LINE_CAP);
        let _ = line.write_str("more");
        assert_eq!(line.len, LINE_CAP);
    }
}
