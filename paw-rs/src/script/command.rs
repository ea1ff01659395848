//! Parsed command sequences.
//!
//! A script or macro body becomes a flat list of [`Command`]s.  Each command
//! carries the separator that links it to the one before it, which is how
//! `then` (`&`) and `else` (`|`) branching is represented.  The engine never
//! mutates a sequence once parsed; suspended continuations share it through
//! an `Arc`.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use super::value::Value;

/// Where a command (or error) came from.  Lines and columns are 1-based.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SourcePosition {
    pub filename: String,
    pub line: usize,
    pub column: usize,
}

impl SourcePosition {
    pub fn new(filename: impl Into<String>, line: usize, column: usize) -> Self {
        Self {
            filename: filename.into(),
            line,
            column,
        }
    }

    /// Shift a position parsed from embedded text so that it is relative to
    /// the enclosing file.  The column offset only applies to the first
    /// line of the embedded text.
    pub fn offset(&self, line_offset: usize, column_offset: usize) -> Self {
        let mut p = self.clone();
        if p.line == 1 {
            p.column += column_offset;
        }
        p.line += line_offset;
        p
    }
}

impl fmt::Display for SourcePosition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let file = if self.filename.is_empty() {
            "<input>"
        } else {
            &self.filename
        };
        write!(f, "{file}:{}:{}", self.line, self.column)
    }
}

/// How a command is linked to the previous one.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Separator {
    /// `;` or newline: always runs.
    #[default]
    Sequence,
    /// `&` / `then`: runs only if the previous command succeeded.
    Then,
    /// `|` / `else`: runs only if the previous command failed.
    Else,
}

/// One named operation invocation.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Command {
    pub name: String,
    pub args: Vec<Value>,
    pub named_args: BTreeMap<String, Value>,
    /// Argument text as written, in source order.
    pub raw_args: Vec<String>,
    pub position: SourcePosition,
    pub separator: Separator,
}

impl Command {
    pub fn new(name: impl Into<String>, position: SourcePosition) -> Self {
        Self {
            name: name.into(),
            position,
            ..Default::default()
        }
    }

    /// Whether this command runs given the status of the one before it.
    pub fn should_run(&self, last_status: bool) -> bool {
        match self.separator {
            Separator::Sequence => true,
            Separator::Then => last_status,
            Separator::Else => !last_status,
        }
    }
}

/// An immutable, shareable command sequence.
pub type CommandSequence = Arc<[Command]>;
