//! Per-command run log.
//!
//! Each command execution carries a [`RunLog`]: lines are emitted through
//! `tracing` as they happen and buffered so the handler can append the
//! full history to the result comment when `--verbose` was requested.

use std::fmt::Write as _;
use std::sync::{Arc, Mutex};

/// Severity of a buffered log line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Level {
    Debug,
    Info,
    Error,
}

/// A cloneable handle to one command's log.
#[derive(Debug, Clone, Default)]
pub struct RunLog {
    /// `repo#pull` prefix identifying the run.
    source: String,
    history: Arc<Mutex<Vec<(Level, String)>>>,
}

impl RunLog {
    /// Creates a log for the run identified by `source` (ex.
    /// `owner/repo#12`).
    #[must_use]
    pub fn new(source: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            history: Arc::new(Mutex::new(Vec::new())),
        }
    }

    fn push(&self, level: Level, line: String) {
        let mut history = self
            .history
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        history.push((level, line));
    }

    /// Records a debug line.
    pub fn debug(&self, line: impl Into<String>) {
        let line = line.into();
        tracing::debug!(source = %self.source, "{line}");
        self.push(Level::Debug, line);
    }

    /// Records an info line.
    pub fn info(&self, line: impl Into<String>) {
        let line = line.into();
        tracing::info!(source = %self.source, "{line}");
        self.push(Level::Info, line);
    }

    /// Records an error line.
    pub fn err(&self, line: impl Into<String>) {
        let line = line.into();
        tracing::error!(source = %self.source, "{line}");
        self.push(Level::Error, line);
    }

    /// The buffered history, one line per entry, oldest first.
    #[must_use]
    pub fn history(&self) -> String {
        let history = self
            .history
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        let mut out = String::new();
        for (level, line) in history.iter() {
            let tag = match level {
                Level::Debug => "DBUG",
                Level::Info => "INFO",
                Level::Error => "EROR",
            };
            let _ = writeln!(out, "[{tag}] {}: {line}", self.source);
        }
        out
    }
}
