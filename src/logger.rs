//! Run log.
//!
//! Every run writes a plain-text log of what it did and how long the
//! pipeline stages took. Each line carries the time since startup. Logging
//! never aborts a run: write failures are swallowed, losing log lines is
//! preferable to losing output files.

use std::fmt;
use std::fs::File;
use std::io::{self, Write};
use std::path::Path;
use std::time::Instant;

/// Writes timestamped lines into the run log.
pub struct Logger {
    sink: File,
    started: Instant,
}

impl Logger {
    /// Opens the log file, truncating a previous one.
    pub fn create<P: AsRef<Path>>(path: P) -> io::Result<Self> {
        Ok(Logger {
            sink: File::create(path)?,
            started: Instant::now(),
        })
    }

    pub fn info<M: fmt::Display>(&mut self, message: M) {
        self.line("info", &message);
    }

    pub fn warn<M: fmt::Display>(&mut self, message: M) {
        self.line("warn", &message);
    }

    /// Runs one pipeline stage, recording how long it took under the given
    /// label.
    pub fn stage<T>(&mut self, label: &str, work: impl FnOnce() -> T) -> T {
        let begun = Instant::now();
        let result = work();
        let took = begun.elapsed();
        self.line(
            "perf",
            &format!("{} took {}.{:03} s", label, took.as_secs(), took.subsec_millis()),
        );
        result
    }

    fn line(&mut self, level: &str, message: &dyn fmt::Display) {
        let elapsed = self.started.elapsed();
        let _ = writeln!(
            self.sink,
            "{:>5}.{:03} {:<4} {}",
            elapsed.as_secs(),
            elapsed.subsec_millis(),
            level,
            message
        );
    }
}
