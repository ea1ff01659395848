//! Error types.
//!
//! Script-level failures are statuses, not errors: a command that fails
//! reports through `tracing` and returns `false`.  The types here cover the
//! embedder-facing calls that can fail outright.

use std::io;
use std::path::PathBuf;

use thiserror::Error;

use crate::script::command::SourcePosition;
use crate::script::fiber::FiberId;
use crate::script::store::ObjectId;

/// A syntax error with the position it was found at and the surrounding
/// source lines.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{position}: {message}")]
pub struct ParseError {
    pub message: String,
    pub position: SourcePosition,
    /// Source lines leading up to the error, the last one followed by a
    /// caret line pointing at the column.
    pub context: Vec<String>,
}

impl ParseError {
    pub fn new(message: impl Into<String>, position: SourcePosition) -> Self {
        Self {
            message: message.into(),
            position,
            context: Vec::new(),
        }
    }

    /// Attach up to two lines of `source` ending at the error line.
    pub fn with_context(mut self, source: &str) -> Self {
        let line = self.position.line;
        if line == 0 {
            return self;
        }
        let first = line.saturating_sub(2);
        self.context = source
            .lines()
            .enumerate()
            .skip(first)
            .take(line - first)
            .map(|(_, l)| l.to_owned())
            .collect();
        if !self.context.is_empty() {
            let pad = " ".repeat(self.position.column.saturating_sub(1));
            self.context.push(format!("{pad}^"));
        }
        self
    }

    /// Re-base the position onto an enclosing file.
    pub fn offset(mut self, filename: &str, line_offset: usize, column_offset: usize) -> Self {
        self.position = self.position.offset(line_offset, column_offset);
        if !filename.is_empty() {
            self.position.filename = filename.to_owned();
        }
        self
    }
}

/// Object store failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum StoreError {
    #[error("object {0} is not in the store")]
    UnknownObject(ObjectId),
}

/// Failure to load a script from disk.
#[derive(Debug, Error)]
pub enum LoadError {
    #[error("cannot read {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// Failure to start a fiber.
#[derive(Debug, Error)]
pub enum FiberError {
    #[error("cannot start fiber {id}: {source}")]
    Spawn {
        id: FiberId,
        #[source]
        source: io::Error,
    },
    #[error("fiber body is a forward declaration of {0}")]
    Forward(String),
}

/// Invalid configuration value.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("{var}: expected a number of milliseconds, got {value:?}")]
    InvalidTimeout { var: &'static str, value: String },
}
