//! Categorised diagnostics.
//!
//! The engine reports through `tracing` and never writes to a sink itself;
//! the host decides where events go by installing a subscriber.  Every
//! event carries a `category` field, plus `file`/`line`/`column` when a
//! source position is known.  Inside a macro the message is followed by the
//! macro call chain.

use std::fmt;

use crate::error::ParseError;
use crate::script::command::SourcePosition;
use crate::script::macros::MacroContext;

/// What part of the runtime a diagnostic concerns.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Category {
    Parse,
    Command,
    Variable,
    Argument,
    Io,
    Macro,
    Async,
    Memory,
    List,
    Type,
    Flow,
    System,
    User,
}

impl Category {
    pub fn as_str(self) -> &'static str {
        match self {
            Category::Parse => "parse",
            Category::Command => "command",
            Category::Variable => "variable",
            Category::Argument => "argument",
            Category::Io => "io",
            Category::Macro => "macro",
            Category::Async => "async",
            Category::Memory => "memory",
            Category::List => "list",
            Category::Type => "type",
            Category::Flow => "flow",
            Category::System => "system",
            Category::User => "user",
        }
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Severity of a handler-reported diagnostic.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Level {
    Debug,
    Warn,
    Error,
}

/// Report a syntax error together with its source context.
pub fn parse_error(err: &ParseError) {
    let p = &err.position;
    let context = if err.context.is_empty() {
        String::new()
    } else {
        format!("\n{}", err.context.join("\n"))
    };
    tracing::error!(
        category = %Category::Parse,
        file = %p.filename,
        line = p.line,
        column = p.column,
        "{}{context}",
        err.message
    );
}

/// Report a command name that resolved to neither a macro nor a handler.
pub fn unknown_command(
    name: &str,
    position: Option<&SourcePosition>,
    macro_context: Option<&MacroContext>,
) {
    emit(
        Level::Error,
        Category::Command,
        &format!("unknown command: {name}"),
        position,
        macro_context,
    );
}

/// Report at `level` with optional position and macro chain.
pub fn emit(
    level: Level,
    category: Category,
    message: &str,
    position: Option<&SourcePosition>,
    macro_context: Option<&MacroContext>,
) {
    let trace = macro_context.map(MacroContext::stack_trace).unwrap_or_default();
    let (file, line, column) = match position {
        Some(p) => (p.filename.as_str(), p.line, p.column),
        None => ("", 0, 0),
    };
    match level {
        Level::Debug => tracing::debug!(
            category = %category, file, line, column, "{message}{trace}"
        ),
        Level::Warn => tracing::warn!(
            category = %category, file, line, column, "{message}{trace}"
        ),
        Level::Error => tracing::error!(
            category = %category, file, line, column, "{message}{trace}"
        ),
    }
}
