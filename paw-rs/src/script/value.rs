//! Runtime value type for paw scripts.
//!
//! Values are plain data.  Anything composite (lists, channels, macros,
//! fibers) lives in the [object store](crate::script::store) and travels
//! inside ordinary values as a marker string.

use std::fmt;

/// Text of the symbolic "undefined" result.
const UNDEFINED: &str = "\x00UNDEFINED\x00";

/// A paw runtime value.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    /// A bare word, including marker strings.
    Symbol(String),
    /// Unevaluated source between parentheses, e.g. a macro body.
    Block(String),
}

impl Default for Value {
    fn default() -> Self {
        Value::Str(String::new())
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Bool(b) => write!(f, "{b}"),
            Value::Int(n) => write!(f, "{n}"),
            Value::Float(x) => {
                if x.fract() == 0.0 && x.abs() < 1e15 {
                    write!(f, "{x:.1}")
                } else {
                    write!(f, "{x}")
                }
            }
            Value::Str(s) | Value::Symbol(s) => write!(f, "{s}"),
            Value::Block(s) => write!(f, "({s})"),
        }
    }
}

impl Value {
    /// The symbolic "undefined" marker used as the result of failed lookups.
    pub fn undefined() -> Self {
        Value::Symbol(UNDEFINED.to_owned())
    }

    pub fn is_undefined(&self) -> bool {
        matches!(self, Value::Symbol(s) if s == UNDEFINED)
    }

    /// Coerce to boolean: `false`, `0`, `""`, `"0"`, `"false"` and
    /// undefined are falsy.
    pub fn as_bool(&self) -> bool {
        match self {
            Value::Bool(b) => *b,
            Value::Int(n) => *n != 0,
            Value::Float(x) => *x != 0.0,
            Value::Str(s) | Value::Symbol(s) => {
                !s.is_empty() && s != "0" && s != "false" && s != UNDEFINED
            }
            Value::Block(_) => true,
        }
    }

    /// Coerce to `i64` (0 when the text is not numeric).
    pub fn as_int(&self) -> i64 {
        self.to_int().unwrap_or(0)
    }

    /// Strict integer conversion.
    pub fn to_int(&self) -> Option<i64> {
        match self {
            Value::Bool(b) => Some(i64::from(*b)),
            Value::Int(n) => Some(*n),
            Value::Float(x) => Some(*x as i64),
            Value::Str(s) | Value::Symbol(s) => {
                let t = s.trim();
                t.parse()
                    .ok()
                    .or_else(|| t.parse::<f64>().ok().map(|x| x as i64))
            }
            Value::Block(_) => None,
        }
    }

    /// Coerce to `f64` (0.0 when the text is not numeric).
    pub fn as_float(&self) -> f64 {
        match self {
            Value::Bool(b) => f64::from(u8::from(*b)),
            Value::Int(n) => *n as f64,
            Value::Float(x) => *x,
            Value::Str(s) | Value::Symbol(s) => s.trim().parse().unwrap_or(0.0),
            Value::Block(_) => 0.0,
        }
    }

    /// Borrow the text of string-like variants.
    pub fn text(&self) -> Option<&str> {
        match self {
            Value::Str(s) | Value::Symbol(s) | Value::Block(s) => Some(s),
            _ => None,
        }
    }

    /// Name of the type, as reported in diagnostics.
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Bool(_) => "bool",
            Value::Int(_) => "int",
            Value::Float(_) => "float",
            Value::Str(_) => "string",
            Value::Symbol(s) if s == UNDEFINED => "undefined",
            Value::Symbol(_) => "symbol",
            Value::Block(_) => "block",
        }
    }
}

impl From<i64> for Value {
    fn from(n: i64) -> Self {
        Value::Int(n)
    }
}

impl From<f64> for Value {
    fn from(x: f64) -> Self {
        Value::Float(x)
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::Str(s)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::Str(s.to_owned())
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
