//! The handler-facing view of one command invocation.
//!
//! A registered command is a [`Handler`]: a function from a [`Context`] to a
//! [`CmdResult`].  The context carries the already-substituted arguments
//! and exposes the running state, the object store and the token calls a
//! handler needs to suspend itself.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use crate::diag::{self, Category, Level};

use super::command::SourcePosition;
use super::executor::Executor;
use super::fiber::FiberId;
use super::macros::MacroContext;
use super::state::ExecutionState;
use super::store::{parse_marker, ObjectId, ObjectKind, ObjectValue};
use super::substitute::SubstitutionContext;
use super::token::{Cleanup, TokenId};
use super::value::Value;

/// A registered command.
pub type Handler = Arc<dyn Fn(&mut Context<'_>) -> CmdResult + Send + Sync>;

/// Outcome of running a command or a sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CmdResult {
    Status(bool),
    /// The handler asked for a token and will be resumed through it.
    Suspended(TokenId),
    /// Stop the enclosing macro (or script) with this status.
    Return(bool),
}

impl CmdResult {
    pub fn is_success(self) -> bool {
        match self {
            CmdResult::Status(s) | CmdResult::Return(s) => s,
            CmdResult::Suspended(_) => true,
        }
    }

    pub fn token(self) -> Option<TokenId> {
        match self {
            CmdResult::Suspended(t) => Some(t),
            _ => None,
        }
    }

    pub fn is_suspended(self) -> bool {
        matches!(self, CmdResult::Suspended(_))
    }
}

impl From<bool> for CmdResult {
    fn from(status: bool) -> Self {
        CmdResult::Status(status)
    }
}

pub struct Context<'a> {
    pub args: Vec<Value>,
    pub named_args: BTreeMap<String, Value>,
    pub raw_args: Vec<String>,
    pub position: Option<SourcePosition>,
    state: &'a Arc<ExecutionState>,
    executor: &'a Executor,
    subst: Option<&'a SubstitutionContext>,
    requested: Vec<TokenId>,
}

impl<'a> Context<'a> {
    pub(crate) fn new(
        executor: &'a Executor,
        state: &'a Arc<ExecutionState>,
        subst: Option<&'a SubstitutionContext>,
    ) -> Self {
        Self {
            args: Vec::new(),
            named_args: BTreeMap::new(),
            raw_args: Vec::new(),
            position: None,
            state,
            executor,
            subst,
            requested: Vec::new(),
        }
    }

    // ── Arguments ─────────────────────────────────────────────────────────────

    /// Positional argument, 0-based.
    pub fn arg(&self, i: usize) -> Option<&Value> {
        self.args.get(i)
    }

    pub fn named(&self, key: &str) -> Option<&Value> {
        self.named_args.get(key)
    }

    pub fn substitution(&self) -> Option<&SubstitutionContext> {
        self.subst
    }

    // ── State ─────────────────────────────────────────────────────────────────

    pub fn state(&self) -> &Arc<ExecutionState> {
        self.state
    }

    pub fn executor(&self) -> &Executor {
        self.executor
    }

    pub fn fiber_id(&self) -> FiberId {
        self.state.fiber_id()
    }

    pub fn macro_context(&self) -> Option<Arc<MacroContext>> {
        self.state.macro_context()
    }

    pub fn set_result(&self, value: Value) {
        self.state.set_result(value);
    }

    pub fn result(&self) -> Option<Value> {
        self.state.result()
    }

    pub fn has_result(&self) -> bool {
        self.state.has_result()
    }

    pub fn clear_result(&self) {
        self.state.clear_result();
    }

    pub fn variable(&self, name: &str) -> Option<Value> {
        self.state.variable(name)
    }

    pub fn set_variable(&self, name: &str, value: Value) {
        self.state.set_variable(name, value);
    }

    // ── Diagnostics ───────────────────────────────────────────────────────────

    pub fn log_error(&self, category: Category, message: &str) {
        self.log(Level::Error, category, message);
    }

    pub fn log_warning(&self, category: Category, message: &str) {
        self.log(Level::Warn, category, message);
    }

    pub fn log_debug(&self, category: Category, message: &str) {
        self.log(Level::Debug, category, message);
    }

    fn log(&self, level: Level, category: Category, message: &str) {
        let ctx = self.state.macro_context();
        diag::emit(level, category, message, self.position.as_ref(), ctx.as_deref());
    }

    // ── Tokens ────────────────────────────────────────────────────────────────

    /// Ask for a token with the executor's default deadline.  Return
    /// `CmdResult::Suspended(token)` to suspend; the rest of the sequence
    /// runs when someone calls `resume_token`.
    pub fn request_token(&mut self, cleanup: Option<Cleanup>) -> TokenId {
        let timeout = self.executor.config().token_timeout;
        self.request_token_with_timeout(cleanup, timeout)
    }

    /// Same, with an explicit deadline (`None` never expires).
    pub fn request_token_with_timeout(
        &mut self,
        cleanup: Option<Cleanup>,
        timeout: Option<Duration>,
    ) -> TokenId {
        let id = self
            .executor
            .request_token_for(self.state, cleanup, timeout, self.position.clone());
        self.requested.push(id);
        id
    }

    pub fn resume_token(&self, id: TokenId, status: bool) -> bool {
        self.executor.resume_token(id, status)
    }

    pub(crate) fn take_requested(&mut self) -> Vec<TokenId> {
        std::mem::take(&mut self.requested)
    }

    // ── Objects ───────────────────────────────────────────────────────────────

    /// Store an object; the running state holds the creator's claim.
    pub fn store_object(&self, value: ObjectValue) -> ObjectId {
        self.state.store_object(value)
    }

    pub fn claim_object(&self, id: ObjectId) -> bool {
        self.state.claim(id)
    }

    pub fn release_object(&self, id: ObjectId) {
        self.state.release(id);
    }

    pub fn object(&self, id: ObjectId) -> Option<ObjectValue> {
        self.state.store().get(id)
    }

    /// The object a marker value refers to.
    pub fn object_for(&self, value: &Value) -> Option<(ObjectKind, ObjectId, ObjectValue)> {
        let (kind, id) = parse_marker(value)?;
        let obj = self.object(id)?;
        Some((kind, id, obj))
    }
}
