//! Macros and the macro executor.
//!
//! A [`Macro`] is a named (or anonymous) body of script text together with
//! where it was defined.  Bodies are parsed on first use and the parse is
//! cached; a macro that only has a name is a *forward declaration* and
//! refuses to run.
//!
//! [`MacroExecutor::run`] performs one activation:
//!
//! 1. refuse forward declarations;
//! 2. attach a [`MacroContext`] to the new state for stack traces;
//! 3. point the state's default export module at `exports`;
//! 4. bind the arguments as a list object under `$@`;
//! 5. build a substitution context anchored at the macro's own definition;
//! 6. run the body through the caller's callback;
//! 7. merge exports, result and bubbles into the parent;
//! 8. release everything the activation still holds.
//!
//! Steps 7 and 8 live in [`MacroFrame`] so that a suspended activation can
//! queue them on its token and finish later.  Step 8 runs on every path,
//! including a token being swept.

use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::sync::{Arc, OnceLock};

use crate::diag::{self, Category, Level};
use crate::error::ParseError;

use super::command::{Command, CommandSequence, SourcePosition};
use super::context::CmdResult;
use super::fiber::ROOT_FIBER;
use super::module::DEFAULT_EXPORT_MODULE;
use super::state::ExecutionState;
use super::store::{marker_value, ObjectKind, ObjectStore, ObjectValue, StoredList};
use super::substitute::SubstitutionContext;
use super::token::{Step, TokenTable};
use super::value::Value;

/// Variable holding the argument list of the current activation.
pub const ARGS_VARIABLE: &str = "$@";

/// Activations nested deeper than this fail instead of recursing further.
pub const MAX_MACRO_DEPTH: usize = 256;

// ── Macro ─────────────────────────────────────────────────────────────────────

#[derive(Debug)]
pub struct Macro {
    name: Option<String>,
    body: String,
    definition: SourcePosition,
    forward: bool,
    parsed: OnceLock<Result<CommandSequence, ParseError>>,
}

impl Macro {
    pub fn new(name: Option<&str>, body: impl Into<String>, definition: SourcePosition) -> Self {
        Self {
            name: name.map(str::to_owned),
            body: body.into(),
            definition,
            forward: false,
            parsed: OnceLock::new(),
        }
    }

    /// A name with no body yet.  Invoking it is an error.
    pub fn forward(name: &str, definition: SourcePosition) -> Self {
        Self {
            forward: true,
            ..Self::new(Some(name), String::new(), definition)
        }
    }

    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    /// Name for diagnostics.
    pub fn display_name(&self) -> &str {
        self.name.as_deref().unwrap_or("anonymous")
    }

    pub fn body(&self) -> &str {
        &self.body
    }

    pub fn definition(&self) -> &SourcePosition {
        &self.definition
    }

    pub fn is_forward(&self) -> bool {
        self.forward
    }

    /// The parsed body.  `parse` only runs the first time; later calls
    /// return the cached outcome, errors included.
    pub fn commands_with<F>(&self, parse: F) -> Result<CommandSequence, ParseError>
    where
        F: FnOnce(&str) -> Result<Vec<Command>, ParseError>,
    {
        self.parsed
            .get_or_init(|| parse(&self.body).map(CommandSequence::from))
            .clone()
    }
}

// ── MacroContext ──────────────────────────────────────────────────────────────

/// One link of the macro call chain, kept for diagnostics.
#[derive(Debug, Clone)]
pub struct MacroContext {
    pub name: String,
    pub definition: SourcePosition,
    pub invocation: Option<SourcePosition>,
    pub parent: Option<Arc<MacroContext>>,
}

impl MacroContext {
    /// Number of activations in the chain, this one included.
    pub fn depth(&self) -> usize {
        1 + self.parent.as_ref().map_or(0, |p| p.depth())
    }

    /// Innermost first, one line per activation.
    pub fn stack_trace(&self) -> String {
        let mut out = String::new();
        let mut link = Some(self);
        while let Some(ctx) = link {
            let _ = write!(out, "\n  in macro {} (defined at {}", ctx.name, ctx.definition);
            if let Some(at) = &ctx.invocation {
                let _ = write!(out, ", called at {at}");
            }
            out.push(')');
            link = ctx.parent.as_deref();
        }
        out
    }
}

// ── MacroExecutor ─────────────────────────────────────────────────────────────

/// Everything needed to start one activation.
pub(crate) struct MacroCall {
    pub mac: Arc<Macro>,
    pub args: Vec<Value>,
    pub named: BTreeMap<String, Value>,
    pub invocation: Option<SourcePosition>,
    /// State the activation reports back into.  `None` for a detached run.
    pub parent: Option<Arc<ExecutionState>>,
}

pub(crate) struct MacroExecutor<'a> {
    store: &'a Arc<ObjectStore>,
    tokens: &'a TokenTable,
}

impl<'a> MacroExecutor<'a> {
    pub(crate) fn new(store: &'a Arc<ObjectStore>, tokens: &'a TokenTable) -> Self {
        Self { store, tokens }
    }

    /// Run one activation.  `execute` runs the body against the new state;
    /// it is injected so this module does not depend on the dispatcher.
    pub(crate) fn run<F>(&self, call: MacroCall, execute: F) -> CmdResult
    where
        F: FnOnce(&Macro, &Arc<ExecutionState>, &SubstitutionContext) -> CmdResult,
    {
        let MacroCall {
            mac,
            args,
            named,
            invocation,
            parent,
        } = call;
        let parent_ctx = parent.as_ref().and_then(|p| p.macro_context());

        if mac.is_forward() {
            diag::emit(
                Level::Error,
                Category::Macro,
                &format!("macro {} is declared but has no body", mac.display_name()),
                invocation.as_ref(),
                parent_ctx.as_deref(),
            );
            if let Some(parent) = &parent {
                parent.set_result(Value::undefined());
            }
            return CmdResult::Status(false);
        }

        let ctx = Arc::new(MacroContext {
            name: mac.display_name().to_owned(),
            definition: mac.definition().clone(),
            invocation,
            parent: parent_ctx,
        });
        if ctx.depth() > MAX_MACRO_DEPTH {
            diag::emit(
                Level::Error,
                Category::Flow,
                &format!("macro nesting deeper than {MAX_MACRO_DEPTH}"),
                ctx.invocation.as_ref(),
                ctx.parent.as_deref(),
            );
            return CmdResult::Status(false);
        }

        let state = match &parent {
            Some(p) => ExecutionState::new_child(p),
            None => ExecutionState::new(Arc::clone(self.store), ROOT_FIBER),
        };
        state.set_macro_context(Arc::clone(&ctx));
        state.module_mut().default_name = DEFAULT_EXPORT_MODULE.to_owned();

        let list = state.store_object(ObjectValue::List(Arc::new(StoredList::new(
            args.clone(),
            named.clone(),
        ))));
        state.set_variable(ARGS_VARIABLE, marker_value(ObjectKind::List, list));
        state.release(list);

        let def = mac.definition();
        let subst = SubstitutionContext {
            args,
            named,
            filename: def.filename.clone(),
            line_offset: def.line.saturating_sub(1),
            column_offset: def.column.saturating_sub(1),
            macro_context: Some(ctx),
        };
        tracing::debug!(
            category = %Category::Macro,
            name = mac.display_name(),
            depth = subst.macro_context.as_ref().map_or(0, |c| c.depth()),
            "enter macro"
        );

        let frame = MacroFrame {
            name: mac.display_name().to_owned(),
            state: Arc::clone(&state),
            parent,
        };
        match execute(&mac, &state, &subst) {
            CmdResult::Suspended(token) => {
                match self.tokens.push_step(token, Step::MacroReturn(frame)) {
                    Ok(()) => CmdResult::Suspended(token),
                    Err(Step::MacroReturn(frame)) => {
                        tracing::warn!(%token, "suspension token vanished before macro return was queued");
                        CmdResult::Status(frame.finish(false))
                    }
                    Err(other) => {
                        other.abandon();
                        CmdResult::Status(false)
                    }
                }
            }
            other => CmdResult::Status(frame.finish(other.is_success())),
        }
    }
}

// ── MacroFrame ────────────────────────────────────────────────────────────────

/// The return half of an activation.
pub(crate) struct MacroFrame {
    name: String,
    state: Arc<ExecutionState>,
    parent: Option<Arc<ExecutionState>>,
}

impl MacroFrame {
    /// Merge into the parent, then tear down.  Returns `status`.
    pub(crate) fn finish(self, status: bool) -> bool {
        if let Some(parent) = &self.parent {
            let exports = self.state.module().export_section(DEFAULT_EXPORT_MODULE);
            if !exports.is_empty() {
                let reexport = parent.macro_context().is_some();
                let mut env = parent.module_mut();
                env.inherit(DEFAULT_EXPORT_MODULE, &exports);
                if reexport {
                    env.reexport(DEFAULT_EXPORT_MODULE, &exports);
                }
            }
            if let Some(result) = self.state.result() {
                parent.set_result(result);
            }
            parent.push_bubbles(self.state.take_bubbles());
        }
        tracing::debug!(category = %Category::Macro, name = %self.name, status, "leave macro");
        self.teardown();
        status
    }

    /// Tear down without merging anything back.
    pub(crate) fn abort(self) {
        tracing::debug!(category = %Category::Macro, name = %self.name, "macro abandoned");
        self.teardown();
    }

    fn teardown(&self) {
        self.state.release_variables();
        self.state.release_all_references();
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
