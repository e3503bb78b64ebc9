//! The kernel logger.
//!
//! Lines are formatted into a fixed-size buffer and handed to a [`LogSink`]
//! in chunks, so logging never allocates.

use core::fmt::{self, Write};

use log::{LevelFilter, Log, Metadata, Record};

use crate::spin::once::Once;

/// The destination of formatted log lines, e.g. a serial port.
pub trait LogSink: Send + Sync {
    fn write(&self, bytes: &[u8]);
}

static SINK: Once<&'static dyn LogSink> = Once::new();

/// Install the kernel logger. Only the first call has an effect.
pub fn init(sink: &'static dyn LogSink) {
    if cfg!(feature = "harden") {
        return;
    }

    SINK.call_once(|| sink);
    let _ = log::set_logger(&KernelLogger);
    log::set_max_level(LevelFilter::Trace);
}

pub struct KernelLogger;

impl Log for KernelLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        !matches!(metadata.target(), "process_core::spin::mutex")
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }
        let Some(sink) = SINK.get() else {
            return;
        };

        let level_color = match record.level() {
            log::Level::Error => "\x1b[31;101m",
            log::Level::Warn => "\x1b[33;103m",
            log::Level::Info => "\x1b[34;104m",
            log::Level::Debug => "\x1b[32;102m",
            log::Level::Trace => "\x1b[35;105m",
        };
        let reset_color = "\x1b[0m";

        let mut buffer = Buffer::new(*sink);
        let _ = writeln!(
            buffer,
            "{level_color}[{:<5} {}:{}]{reset_color} {}",
            record.level(),
            record.file().unwrap_or("<unknown>"),
            record.line().unwrap_or(0),
            record.args(),
        );
        buffer.flush();
    }

    fn flush(&self) {}
}

struct Buffer {
    sink: &'static dyn LogSink,
    buffer: [u8; 256],
    len: usize,
}

impl Buffer {
    fn new(sink: &'static dyn LogSink) -> Self {
        Self {
            sink,
            buffer: [0; 256],
            len: 0,
        }
    }

    fn flush(&mut self) {
        if self.len == 0 {
            return;
        }
        self.sink.write(&self.buffer[..self.len]);
        self.len = 0;
    }
}

impl Write for Buffer {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        s.chars().try_for_each(|c| self.write_char(c))
    }

    fn write_char(&mut self, c: char) -> fmt::Result {
        // Make sure that the next character fits.
        if self.len + 4 >= self.buffer.len() {
            self.flush();
        }

        let encoded = c.encode_utf8(&mut self.buffer[self.len..]);
        self.len += encoded.len();

        Ok(())
    }
}

/// Writes log lines to the host's standard error.
#[cfg(any(test, feature = "std"))]
pub struct StderrSink;

#[cfg(any(test, feature = "std"))]
impl LogSink for StderrSink {
    fn write(&self, bytes: &[u8]) {
        use std::io::Write as _;

        let _ = std::io::stderr().write_all(bytes);
    }
}
