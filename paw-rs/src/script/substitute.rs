//! Argument substitution.
//!
//! Before a command runs, each argument passes through [`substitute`]:
//!
//! | form        | becomes                                         |
//! |-------------|-------------------------------------------------|
//! | `~name`     | the variable `name` (undefined with a warning)  |
//! | `$1`, `$2`… | the positional argument, undefined if missing   |
//! | `$#`        | number of positional arguments                  |
//! | `$*`        | positional arguments joined by a space          |
//! | `$@`        | the argument list marker                        |
//!
//! The `$` forms are whole-argument substitutions that keep the argument's
//! type.  Inside string text `$N`, `$#` and `$*` are replaced textually and
//! `$$` stands for a literal dollar sign.  Blocks are left alone: they are
//! substituted when (and if) they run.

use std::collections::BTreeMap;
use std::sync::Arc;

use crate::diag::{self, Category, Level};

use super::command::SourcePosition;
use super::macros::{MacroContext, ARGS_VARIABLE};
use super::state::ExecutionState;
use super::value::Value;

/// Arguments and source anchoring of the activation a command runs in.
#[derive(Debug, Clone, Default)]
pub struct SubstitutionContext {
    pub args: Vec<Value>,
    pub named: BTreeMap<String, Value>,
    /// File that positions inside the body are reported against.
    pub filename: String,
    pub line_offset: usize,
    pub column_offset: usize,
    pub macro_context: Option<Arc<MacroContext>>,
}

impl SubstitutionContext {
    pub fn with_args(args: Vec<Value>) -> Self {
        Self {
            args,
            ..Self::default()
        }
    }

    /// 1-based positional argument.
    pub fn arg(&self, n: usize) -> Option<&Value> {
        n.checked_sub(1).and_then(|i| self.args.get(i))
    }

    fn joined(&self) -> String {
        self.args
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join(" ")
    }
}

/// Substitute one argument value.
pub fn substitute(
    value: &Value,
    subst: Option<&SubstitutionContext>,
    state: &ExecutionState,
    position: Option<&SourcePosition>,
) -> Value {
    match value {
        Value::Symbol(s) => {
            if let Some(name) = s.strip_prefix('~').filter(|n| !n.is_empty()) {
                return lookup_variable(name, state, position);
            }
            if let Some(whole) = subst.and_then(|sc| whole_argument(s, sc, state)) {
                return whole;
            }
            match subst {
                Some(sc) if s.contains('$') => Value::Symbol(replace_in_text(s, sc)),
                _ => value.clone(),
            }
        }
        Value::Str(s) => match subst {
            Some(sc) if s.contains('$') => Value::Str(replace_in_text(s, sc)),
            _ => value.clone(),
        },
        _ => value.clone(),
    }
}

fn lookup_variable(name: &str, state: &ExecutionState, position: Option<&SourcePosition>) -> Value {
    match state.variable(name) {
        Some(v) => v,
        None => {
            let ctx = state.macro_context();
            diag::emit(
                Level::Warn,
                Category::Variable,
                &format!("unknown variable: {name}"),
                position,
                ctx.as_deref(),
            );
            Value::undefined()
        }
    }
}

fn whole_argument(s: &str, sc: &SubstitutionContext, state: &ExecutionState) -> Option<Value> {
    let rest = s.strip_prefix('$')?;
    match rest {
        "@" => Some(state.variable(ARGS_VARIABLE).unwrap_or_else(Value::undefined)),
        "#" => Some(Value::Int(sc.args.len() as i64)),
        "*" => Some(Value::Str(sc.joined())),
        _ if !rest.is_empty() && rest.bytes().all(|b| b.is_ascii_digit()) => {
            let n: usize = rest.parse().ok()?;
            Some(sc.arg(n).cloned().unwrap_or_else(Value::undefined))
        }
        _ => None,
    }
}

/// Textual `$` replacement inside string contents.
pub fn replace_in_text(text: &str, sc: &SubstitutionContext) -> String {
    let mut out = String::with_capacity(text.len());
    let mut chars = text.chars().peekable();
    while let Some(ch) = chars.next() {
        if ch != '$' {
            out.push(ch);
            continue;
        }
        match chars.peek().copied() {
            Some('$') => {
                chars.next();
                out.push('$');
            }
            Some('#') => {
                chars.next();
                out.push_str(&sc.args.len().to_string());
            }
            Some('*') => {
                chars.next();
                out.push_str(&sc.joined());
            }
            Some(c) if c.is_ascii_digit() => {
                let mut digits = String::new();
                while let Some(&d) = chars.peek() {
                    if !d.is_ascii_digit() {
                        break;
                    }
                    digits.push(d);
                    chars.next();
                }
                let arg = digits.parse().ok().and_then(|n| sc.arg(n));
                if let Some(v) = arg {
                    out.push_str(&v.to_string());
                }
            }
            _ => out.push('$'),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::script::store::ObjectStore;

    fn ctx() -> SubstitutionContext {
        SubstitutionContext::with_args(vec![Value::Int(5), Value::Str("two".into())])
    }

    fn state() -> Arc<ExecutionState> {
        ExecutionState::new(Arc::new(ObjectStore::new()), 0)
    }

    fn sym(s: &str) -> Value {
        Value::Symbol(s.into())
    }

    #[test]
    fn whole_argument_keeps_type() {
        let st = state();
        let sc = ctx();
        assert_eq!(substitute(&sym("$1"), Some(&sc), &st, None), Value::Int(5));
        assert_eq!(substitute(&sym("$#"), Some(&sc), &st, None), Value::Int(2));
        assert_eq!(substitute(&sym("$*"), Some(&sc), &st, None), Value::Str("5 two".into()));
        assert!(substitute(&sym("$3"), Some(&sc), &st, None).is_undefined());
        assert!(substitute(&sym("$0"), Some(&sc), &st, None).is_undefined());
    }

    #[test]
    fn variables() {
        let st = state();
        st.set_variable("x", Value::Float(1.5));
        assert_eq!(substitute(&sym("~x"), None, &st, None), Value::Float(1.5));
        assert!(substitute(&sym("~missing"), None, &st, None).is_undefined());
        assert_eq!(substitute(&sym("~"), None, &st, None), sym("~"));
    }

    #[test]
    fn text_replacement() {
        let sc = ctx();
        assert_eq!(replace_in_text("got $1 and $2!", &sc), "got 5 and two!");
        assert_eq!(replace_in_text("$# args: $*", &sc), "2 args: 5 two");
        assert_eq!(replace_in_text("cost $$3, $9 gone, $x", &sc), "cost $3,  gone, $x");
    }

    #[test]
    fn without_context_only_variables_apply() {
        let st = state();
        assert_eq!(substitute(&sym("$1"), None, &st, None), sym("$1"));
        let s = Value::Str("$1".into());
        assert_eq!(substitute(&s, None, &st, None), s);
    }

    #[test]
    fn blocks_untouched() {
        let st = state();
        let b = Value::Block("echo $1".into());
        assert_eq!(substitute(&b, Some(&ctx()), &st, None), b);
    }
}
