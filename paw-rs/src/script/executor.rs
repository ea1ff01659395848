//! The top-level engine.
//!
//! An [`Executor`] owns everything activations share: the command table,
//! the global macro table, the token table, the object store, the fiber
//! table and the orphaned-bubble table.  It is cheap to clone (all clones
//! drive the same engine) and safe to call from any thread.
//!
//! ## Dispatch
//!
//! A command name resolves, in order, to a macro visible in the running
//! state, a global macro, a registered command, or, for `~var`/`$N`
//! names holding a `MACRO` marker, that anonymous macro.  Anything else is
//! reported and fails with an undefined result.
//!
//! ## Ownership
//!
//! A top-level run owns its root state.  When it completes, the result is
//! captured and every claim the state holds is released.  When it suspends,
//! the release is queued on the token and happens when the resumed chain
//! finishes (or the token is swept).

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::fmt;
use std::fs;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{mpsc, Arc, RwLock};
use std::thread;
use std::time::{Duration, Instant};

use crate::config::EngineConfig;
use crate::diag::{self, Category, Level};
use crate::error::{FiberError, LoadError, ParseError};
use crate::sync::{read, write};

use super::command::{Command, CommandSequence, SourcePosition};
use super::context::{CmdResult, Context, Handler};
use super::fiber::{Bubble, FiberHandle, FiberId, OrphanTable, ROOT_FIBER};
use super::macros::{Macro, MacroCall, MacroExecutor, ARGS_VARIABLE};
use super::parser::{CommandParser, Parse};
use super::state::ExecutionState;
use super::store::{
    marker_value, parse_marker, scan_markers, ObjectId, ObjectKind, ObjectStore, ObjectValue,
    StoredList,
};
use super::substitute::{substitute, SubstitutionContext};
use super::token::{Cleanup, Continuation, Resume, Step, Token, TokenId, TokenStatus, TokenTable};
use super::value::Value;

/// How often `wait_for_all_fibers` wakes up to sweep expired tokens.
const FIBER_POLL: Duration = Duration::from_millis(25);

/// Outcome of a top-level run.
#[derive(Debug, Clone, PartialEq)]
pub struct Execution {
    pub status: CmdResult,
    /// Result of the run, captured before the root state was released.
    /// `None` when the run suspended or produced no result.
    pub result: Option<Value>,
}

impl Execution {
    pub fn is_success(&self) -> bool {
        self.status.is_success()
    }
}

/// Read a script file, mapping failures to [`LoadError::Io`].
pub fn read_script(path: &Path) -> Result<String, LoadError> {
    fs::read_to_string(path).map_err(|source| LoadError::Io {
        path: path.to_path_buf(),
        source,
    })
}

/// Substituted arguments for a direct handler call.
#[derive(Debug, Clone, Default)]
pub struct CommandCall {
    pub args: Vec<Value>,
    pub named: BTreeMap<String, Value>,
    pub raw_args: Vec<String>,
    pub position: Option<SourcePosition>,
}

/// A freshly started fiber.
#[derive(Debug, Clone)]
pub struct SpawnedFiber {
    pub id: FiberId,
    /// Store id of the `FIBER` object.  The spawning state (or, without
    /// one, the caller) holds its creator claim.
    pub object: ObjectId,
    pub handle: Arc<FiberHandle>,
}

struct Shared {
    commands: RwLock<HashMap<String, Handler>>,
    macros: RwLock<HashMap<String, Arc<Macro>>>,
    tokens: TokenTable,
    store: Arc<ObjectStore>,
    fibers: RwLock<HashMap<FiberId, Arc<FiberHandle>>>,
    orphans: Arc<OrphanTable>,
    next_fiber: AtomicUsize,
    /// Resumptions currently replaying their steps.
    resuming: AtomicUsize,
    parser: Arc<dyn Parse>,
    config: EngineConfig,
}

#[derive(Clone)]
pub struct Executor {
    shared: Arc<Shared>,
}

impl fmt::Debug for Executor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Executor")
            .field("commands", &read(&self.shared.commands).len())
            .field("objects", &self.shared.store.len())
            .field("tokens", &self.shared.tokens)
            .field("fibers", &read(&self.shared.fibers).len())
            .finish()
    }
}

impl Default for Executor {
    fn default() -> Self {
        Self::new()
    }
}

impl Executor {
    pub fn new() -> Self {
        Self::with_config(EngineConfig::default())
    }

    pub fn with_config(config: EngineConfig) -> Self {
        Self::with_parser(config, Arc::new(CommandParser))
    }

    /// An executor using a caller-supplied parser.
    pub fn with_parser(config: EngineConfig, parser: Arc<dyn Parse>) -> Self {
        Self {
            shared: Arc::new(Shared {
                commands: RwLock::new(HashMap::new()),
                macros: RwLock::new(HashMap::new()),
                tokens: TokenTable::default(),
                store: Arc::new(ObjectStore::new()),
                fibers: RwLock::new(HashMap::new()),
                orphans: Arc::new(OrphanTable::default()),
                next_fiber: AtomicUsize::new(ROOT_FIBER),
                resuming: AtomicUsize::new(0),
                parser,
                config,
            }),
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.shared.config
    }

    pub fn store(&self) -> &Arc<ObjectStore> {
        &self.shared.store
    }

    /// Number of live objects in the store.
    pub fn object_count(&self) -> usize {
        self.shared.store.len()
    }

    /// Give back a claim the caller holds directly (e.g. on a fiber spawned
    /// without a parent state).
    pub fn release_object(&self, id: ObjectId) -> bool {
        self.shared.store.release(id).is_ok()
    }

    // ── Command registry ──────────────────────────────────────────────────────

    /// Bind `name` to `handler`, replacing any previous binding.
    pub fn register_command<F>(&self, name: &str, handler: F)
    where
        F: Fn(&mut Context<'_>) -> CmdResult + Send + Sync + 'static,
    {
        write(&self.shared.commands).insert(name.to_owned(), Arc::new(handler));
    }

    pub fn unregister_command(&self, name: &str) -> bool {
        write(&self.shared.commands).remove(name).is_some()
    }

    pub fn has_command(&self, name: &str) -> bool {
        read(&self.shared.commands).contains_key(name)
    }

    pub fn command_names(&self) -> Vec<String> {
        let mut names: Vec<String> = read(&self.shared.commands).keys().cloned().collect();
        names.sort();
        names
    }

    fn handler(&self, name: &str) -> Option<Handler> {
        read(&self.shared.commands).get(name).cloned()
    }

    // ── Top-level execution ───────────────────────────────────────────────────

    pub fn new_root_state(&self) -> Arc<ExecutionState> {
        ExecutionState::new(Arc::clone(&self.shared.store), ROOT_FIBER)
    }

    /// Run script text.  With `args`, `text` is instead taken as the exact
    /// name of a command or macro and invoked directly with them.
    pub fn execute(&self, text: &str, args: &[Value]) -> Execution {
        if args.is_empty() {
            return self.execute_script(text, "", &[]);
        }
        let root = self.new_root_state();
        let mut cmd = Command::new(text.trim(), SourcePosition::default());
        cmd.args = args.to_vec();
        cmd.raw_args = args.iter().map(ToString::to_string).collect();
        let status = self.dispatch(&root, &cmd, None);
        self.finish_top_level(&root, status)
    }

    /// Run script text in a fresh root state with `$1..$n` and `$@` bound
    /// to `args`.
    pub fn execute_script(&self, text: &str, filename: &str, args: &[Value]) -> Execution {
        let root = self.new_root_state();
        let subst = (!args.is_empty()).then(|| {
            bind_args(&root, args, &BTreeMap::new());
            SubstitutionContext {
                args: args.to_vec(),
                filename: filename.to_owned(),
                ..SubstitutionContext::default()
            }
        });
        let status = self.execute_with_state(text, &root, subst.as_ref(), filename, 0, 0);
        self.finish_top_level(&root, status)
    }

    /// Read and run a script file.
    pub fn execute_file(&self, path: impl AsRef<Path>, args: &[Value]) -> Result<Execution, LoadError> {
        let path = path.as_ref();
        let text = read_script(path)?;
        tracing::debug!(category = %Category::Io, path = %path.display(), "executing file");
        Ok(self.execute_script(&text, &path.display().to_string(), args))
    }

    /// Run against a caller-owned state that outlives the run.  Nothing is
    /// released afterwards.
    pub fn execute_in(&self, state: &Arc<ExecutionState>, text: &str, filename: &str) -> CmdResult {
        self.execute_in_with_args(state, text, filename, &[])
    }

    /// [`execute_in`](Self::execute_in) with `$1..$n` and `$@` bound to
    /// `args`.  Rebinding replaces any earlier `$@` of the state.
    pub fn execute_in_with_args(
        &self,
        state: &Arc<ExecutionState>,
        text: &str,
        filename: &str,
        args: &[Value],
    ) -> CmdResult {
        let subst = (!args.is_empty()).then(|| {
            bind_args(state, args, &BTreeMap::new());
            SubstitutionContext {
                args: args.to_vec(),
                filename: filename.to_owned(),
                ..SubstitutionContext::default()
            }
        });
        let status = self.execute_with_state(text, state, subst.as_ref(), filename, 0, 0);
        if let CmdResult::Suspended(token) = status {
            self.arm(token);
        }
        status
    }

    /// Parse `text`, shift every position by the offsets, and run the
    /// sequence against `state`.  A suspension is returned as is; the
    /// caller owns arming the token.
    pub fn execute_with_state(
        &self,
        text: &str,
        state: &Arc<ExecutionState>,
        subst: Option<&SubstitutionContext>,
        filename: &str,
        line_offset: usize,
        column_offset: usize,
    ) -> CmdResult {
        let commands = match self.parse_with_offsets(text, filename, line_offset, column_offset) {
            Ok(c) => c,
            Err(e) => {
                diag::parse_error(&e);
                return CmdResult::Status(false);
            }
        };
        if commands.is_empty() {
            return CmdResult::Status(true);
        }
        let commands = CommandSequence::from(commands);
        self.run_commands(state, &commands, 0, subst)
    }

    fn parse_with_offsets(
        &self,
        text: &str,
        filename: &str,
        line_offset: usize,
        column_offset: usize,
    ) -> Result<Vec<Command>, ParseError> {
        let mut commands = self
            .shared
            .parser
            .parse(text, filename)
            .map_err(|e| e.offset(filename, line_offset, column_offset))?;
        if line_offset > 0 || column_offset > 0 {
            for cmd in &mut commands {
                cmd.position = cmd.position.offset(line_offset, column_offset);
            }
        }
        Ok(commands)
    }

    fn finish_top_level(&self, root: &Arc<ExecutionState>, status: CmdResult) -> Execution {
        if let CmdResult::Suspended(token) = status {
            if let Err(step) = self.shared.tokens.push_step(token, Step::Release(Arc::clone(root))) {
                step.abandon();
                return Execution {
                    status: CmdResult::Status(false),
                    result: None,
                };
            }
            self.arm(token);
            return Execution { status, result: None };
        }
        let result = root.result();
        root.release_all_references();
        Execution {
            status: CmdResult::Status(status.is_success()),
            result,
        }
    }

    // ── Dispatch ──────────────────────────────────────────────────────────────

    /// Walk `commands` from `start`, honouring `then`/`else` links.
    fn run_commands(
        &self,
        state: &Arc<ExecutionState>,
        commands: &CommandSequence,
        start: usize,
        subst: Option<&SubstitutionContext>,
    ) -> CmdResult {
        let mut next = start;
        while let Some(cmd) = commands.get(next) {
            next += 1;
            if !cmd.should_run(state.last_status()) {
                continue;
            }
            match self.dispatch(state, cmd, subst) {
                CmdResult::Status(s) => state.set_last_status(s),
                CmdResult::Return(s) => {
                    state.set_last_status(s);
                    return CmdResult::Return(s);
                }
                CmdResult::Suspended(token) => {
                    let step = Step::Sequence {
                        state: Arc::clone(state),
                        continuation: Continuation {
                            commands: Arc::clone(commands),
                            next,
                            subst: subst.cloned(),
                        },
                    };
                    if self.shared.tokens.push_step(token, step).is_ok() {
                        return CmdResult::Suspended(token);
                    }
                    tracing::warn!(category = %Category::Async, %token, "token disappeared while suspending");
                    state.set_last_status(false);
                }
            }
        }
        CmdResult::Status(state.last_status())
    }

    fn dispatch(
        &self,
        state: &Arc<ExecutionState>,
        cmd: &Command,
        subst: Option<&SubstitutionContext>,
    ) -> CmdResult {
        let args: Vec<Value> = cmd
            .args
            .iter()
            .map(|a| substitute(a, subst, state, Some(&cmd.position)))
            .collect();
        let named: BTreeMap<String, Value> = cmd
            .named_args
            .iter()
            .map(|(k, v)| (k.clone(), substitute(v, subst, state, Some(&cmd.position))))
            .collect();

        if let Some(mac) = self.resolve_macro(state, &cmd.name, subst, &cmd.position) {
            return self.call_macro(mac, args, named, Some(cmd.position.clone()), state);
        }

        let call = CommandCall {
            args,
            named,
            raw_args: cmd.raw_args.clone(),
            position: Some(cmd.position.clone()),
        };
        if let Some(result) = self.invoke_command(&cmd.name, call, state, subst) {
            return result;
        }

        let ctx = state.macro_context();
        diag::unknown_command(&cmd.name, Some(&cmd.position), ctx.as_deref());
        state.set_result(Value::undefined());
        CmdResult::Status(false)
    }

    /// Run the handler registered as `name` with already-substituted
    /// arguments.  `None` if no such command exists.
    pub fn invoke_command(
        &self,
        name: &str,
        call: CommandCall,
        state: &Arc<ExecutionState>,
        subst: Option<&SubstitutionContext>,
    ) -> Option<CmdResult> {
        let handler = self.handler(name)?;
        let mut ctx = Context::new(self, state, subst);
        ctx.args = call.args;
        ctx.named_args = call.named;
        ctx.raw_args = call.raw_args;
        ctx.position = call.position;
        let result = handler(&mut ctx);
        // tokens the handler asked for but is not suspending on
        for token in ctx.take_requested() {
            if result.token() != Some(token) {
                self.arm(token);
            }
        }
        Some(result)
    }

    fn resolve_macro(
        &self,
        state: &Arc<ExecutionState>,
        name: &str,
        subst: Option<&SubstitutionContext>,
        position: &SourcePosition,
    ) -> Option<Arc<Macro>> {
        if let Some(m) = state.lookup_macro(name) {
            return Some(m);
        }
        if let Some(m) = read(&self.shared.macros).get(name) {
            return Some(Arc::clone(m));
        }
        if name.starts_with('~') || name.starts_with('$') {
            let value = substitute(&Value::Symbol(name.to_owned()), subst, state, Some(position));
            if let Some((ObjectKind::Macro, id)) = parse_marker(&value) {
                return self.shared.store.macro_object(id);
            }
        }
        None
    }

    /// Invoke `mac` as a child activation of `parent`.
    pub fn call_macro(
        &self,
        mac: Arc<Macro>,
        args: Vec<Value>,
        named: BTreeMap<String, Value>,
        invocation: Option<SourcePosition>,
        parent: &Arc<ExecutionState>,
    ) -> CmdResult {
        let call = MacroCall {
            mac,
            args,
            named,
            invocation,
            parent: Some(Arc::clone(parent)),
        };
        MacroExecutor::new(&self.shared.store, &self.shared.tokens)
            .run(call, |m, state, subst| self.run_macro_body(m, state, subst))
    }

    fn run_macro_body(
        &self,
        mac: &Macro,
        state: &Arc<ExecutionState>,
        subst: &SubstitutionContext,
    ) -> CmdResult {
        let parsed = mac.commands_with(|body| {
            self.parse_with_offsets(body, &subst.filename, subst.line_offset, subst.column_offset)
        });
        match parsed {
            Ok(commands) if commands.is_empty() => CmdResult::Status(true),
            Ok(commands) => self.run_commands(state, &commands, 0, Some(subst)),
            Err(e) => {
                diag::parse_error(&e);
                CmdResult::Status(false)
            }
        }
    }

    // ── Macro registry ────────────────────────────────────────────────────────

    /// Define a macro.  With a state it is local to that activation;
    /// without one it goes into the global table.
    pub fn define_macro(
        &self,
        state: Option<&ExecutionState>,
        name: &str,
        body: &str,
        definition: SourcePosition,
    ) -> Arc<Macro> {
        let mac = Arc::new(Macro::new(Some(name), body, definition));
        self.install_macro(state, name, Arc::clone(&mac));
        mac
    }

    /// Declare a name whose body comes later.
    pub fn declare_macro(&self, state: Option<&ExecutionState>, name: &str, definition: SourcePosition) {
        self.install_macro(state, name, Arc::new(Macro::forward(name, definition)));
    }

    fn install_macro(&self, state: Option<&ExecutionState>, name: &str, mac: Arc<Macro>) {
        tracing::debug!(category = %Category::Macro, name, forward = mac.is_forward(), "define macro");
        match state {
            Some(state) => state.define_macro(name, mac),
            None => {
                write(&self.shared.macros).insert(name.to_owned(), mac);
            }
        }
    }

    pub fn has_macro(&self, name: &str) -> bool {
        read(&self.shared.macros).contains_key(name)
    }

    pub fn global_macro(&self, name: &str) -> Option<Arc<Macro>> {
        read(&self.shared.macros).get(name).cloned()
    }

    pub fn list_macros(&self) -> Vec<String> {
        let mut names: Vec<String> = read(&self.shared.macros).keys().cloned().collect();
        names.sort();
        names
    }

    pub fn delete_macro(&self, name: &str) -> bool {
        write(&self.shared.macros).remove(name).is_some()
    }

    /// Run a global macro as a top-level activation.
    pub fn execute_macro(&self, name: &str, args: &[Value]) -> Execution {
        let root = self.new_root_state();
        let found = read(&self.shared.macros).get(name).cloned();
        let status = match found {
            Some(mac) => self.call_macro(mac, args.to_vec(), BTreeMap::new(), None, &root),
            None => {
                diag::unknown_command(name, None, None);
                root.set_result(Value::undefined());
                CmdResult::Status(false)
            }
        };
        self.finish_top_level(&root, status)
    }

    // ── Tokens ────────────────────────────────────────────────────────────────

    pub(crate) fn request_token_for(
        &self,
        state: &Arc<ExecutionState>,
        cleanup: Option<Cleanup>,
        timeout: Option<Duration>,
        position: Option<SourcePosition>,
    ) -> TokenId {
        self.sweep_expired_tokens();
        self.shared
            .tokens
            .request(Arc::clone(state), cleanup, timeout, position)
    }

    /// Register a token bound to `state` outside of any command.  It is
    /// ready to be resumed immediately.
    pub fn request_token(&self, state: &Arc<ExecutionState>, cleanup: Option<Cleanup>) -> TokenId {
        let id = self.request_token_for(state, cleanup, self.shared.config.token_timeout, None);
        self.arm(id);
        id
    }

    /// Resume a suspended token with `status`.  The queued work runs on the
    /// calling thread.  Returns `false` for unknown or already resumed ids.
    pub fn resume_token(&self, id: TokenId, status: bool) -> bool {
        self.sweep_expired_tokens();
        let _resuming = Resuming::enter(&self.shared.resuming);
        match self.shared.tokens.take_for_resume(id, status) {
            Resume::Unknown => {
                diag::emit(
                    Level::Warn,
                    Category::Async,
                    &format!("resume of unknown or already resumed token {id}"),
                    None,
                    None,
                );
                false
            }
            Resume::Deferred => {
                tracing::debug!(category = %Category::Async, %id, status, "resume deferred until armed");
                true
            }
            Resume::Ready(token) => {
                self.run_token(token, status);
                true
            }
        }
    }

    /// Discard a token without resuming it: its cleanup runs and whatever
    /// it was holding is released.
    pub fn force_cleanup_token(&self, id: TokenId) -> bool {
        match self.shared.tokens.take(id) {
            Some(token) => {
                tracing::debug!(category = %Category::Async, %id, "forced token cleanup");
                token.discard();
                true
            }
            None => false,
        }
    }

    /// Discard every token whose deadline has passed.  Returns how many.
    pub fn sweep_expired_tokens(&self) -> usize {
        let expired = self.shared.tokens.take_expired(Instant::now());
        let count = expired.len();
        for token in expired {
            diag::emit(
                Level::Warn,
                Category::Async,
                &format!("token {} expired without being resumed", token.id),
                None,
                None,
            );
            token.discard();
        }
        count
    }

    pub fn token_status(&self) -> TokenStatus {
        self.shared.tokens.status()
    }

    pub fn next_token_deadline(&self) -> Option<Instant> {
        self.shared.tokens.next_deadline()
    }

    /// Whether any token, resumption in progress or fiber is still
    /// outstanding.
    pub fn has_pending_work(&self) -> bool {
        !self.shared.tokens.is_empty()
            || self.shared.resuming.load(Ordering::Acquire) > 0
            || self.fiber_count() > 0
    }

    /// Mark a token fully queued, running it at once if a resume already
    /// came in.
    fn arm(&self, id: TokenId) {
        if let Some((token, status)) = self.shared.tokens.arm(id) {
            self.run_token(token, status);
        }
    }

    fn run_token(&self, token: Token, status: bool) {
        tracing::debug!(category = %Category::Async, id = %token.id, status, steps = token.steps.len(), "resuming token");
        self.run_steps(token.steps, status);
    }

    /// Replay queued steps in order, threading the status through.  If a
    /// sequence suspends again, the rest of the queue moves to the new token.
    fn run_steps(&self, mut steps: VecDeque<Step>, status: bool) {
        let mut result = CmdResult::Status(status);
        while let Some(step) = steps.pop_front() {
            match step {
                Step::Sequence {
                    state,
                    continuation,
                } => {
                    state.set_last_status(result.is_success());
                    result = self.run_commands(
                        &state,
                        &continuation.commands,
                        continuation.next,
                        continuation.subst.as_ref(),
                    );
                    if let CmdResult::Suspended(next) = result {
                        if let Err(rest) = self.shared.tokens.append_steps(next, steps) {
                            rest.into_iter().for_each(Step::abandon);
                        } else {
                            self.arm(next);
                        }
                        return;
                    }
                }
                Step::MacroReturn(frame) => {
                    result = CmdResult::Status(frame.finish(result.is_success()));
                }
                Step::Release(state) => {
                    tracing::debug!(category = %Category::Async, status = result.is_success(), "suspended run finished");
                    state.release_all_references();
                    result = CmdResult::Status(result.is_success());
                }
                Step::Notify(tx) => {
                    // the fiber may already have given up waiting
                    let _ = tx.send(result.is_success());
                }
            }
        }
    }

    // ── Fibers ────────────────────────────────────────────────────────────────

    /// Start `mac` on a new fiber.  The fiber reports into a holder state
    /// whose module environment is copied from `parent`.
    pub fn spawn_fiber(
        &self,
        mac: Arc<Macro>,
        args: Vec<Value>,
        named: BTreeMap<String, Value>,
        parent: Option<&Arc<ExecutionState>>,
    ) -> Result<SpawnedFiber, FiberError> {
        if mac.is_forward() {
            return Err(FiberError::Forward(mac.display_name().to_owned()));
        }
        let id = self.shared.next_fiber.fetch_add(1, Ordering::Relaxed) + 1;
        let module = parent.map(|p| p.module().child()).unwrap_or_default();
        let holder = ExecutionState::with_module(Arc::clone(&self.shared.store), id, module);
        let handle = Arc::new(FiberHandle::new(id, holder, Arc::clone(&self.shared.orphans)));
        let fiber_object = ObjectValue::Fiber(Arc::clone(&handle));
        let object = match parent {
            Some(p) => p.store_object(fiber_object),
            None => self.shared.store.store(fiber_object),
        };
        write(&self.shared.fibers).insert(id, Arc::clone(&handle));

        // The inputs stay alive until the fiber has bound them.
        let held: Vec<ObjectId> = args
            .iter()
            .chain(named.values())
            .flat_map(scan_markers)
            .filter(|&obj| self.shared.store.claim(obj).is_ok())
            .collect();

        let executor = self.clone();
        let thread_handle = Arc::clone(&handle);
        let thread_held = held.clone();
        let spawned = thread::Builder::new()
            .name(format!("fiber-{id}"))
            .spawn(move || executor.run_fiber(thread_handle, mac, args, named, thread_held));
        if let Err(source) = spawned {
            self.shared.store.release_all(held);
            write(&self.shared.fibers).remove(&id);
            match parent {
                Some(p) => p.release(object),
                None => {
                    self.shared.store.release_all([object]);
                }
            }
            return Err(FiberError::Spawn { id, source });
        }
        tracing::debug!(category = %Category::Async, fiber = id, "fiber spawned");
        Ok(SpawnedFiber { id, object, handle })
    }

    fn run_fiber(
        &self,
        handle: Arc<FiberHandle>,
        mac: Arc<Macro>,
        args: Vec<Value>,
        named: BTreeMap<String, Value>,
        held: Vec<ObjectId>,
    ) {
        let call = MacroCall {
            mac,
            args,
            named,
            invocation: None,
            parent: Some(Arc::clone(handle.holder())),
        };
        let result = MacroExecutor::new(&self.shared.store, &self.shared.tokens)
            .run(call, |m, state, subst| self.run_macro_body(m, state, subst));
        self.shared.store.release_all(held);
        let status = match result {
            CmdResult::Suspended(token) => {
                let (tx, rx) = mpsc::channel();
                match self.shared.tokens.push_step(token, Step::Notify(tx)) {
                    Ok(()) => {
                        handle.set_suspended(Some(token));
                        self.arm(token);
                        // a swept token drops the sender
                        rx.recv().unwrap_or(false)
                    }
                    Err(step) => {
                        step.abandon();
                        false
                    }
                }
            }
            other => other.is_success(),
        };
        handle.finish(status);
        write(&self.shared.fibers).remove(&handle.id());
        tracing::debug!(category = %Category::Async, fiber = handle.id(), status, "fiber finished");
    }

    /// Block until a running fiber finishes.  `None` if no fiber with that
    /// id is running.
    pub fn wait_for_fiber(&self, id: FiberId) -> Option<bool> {
        let handle = read(&self.shared.fibers).get(&id).cloned();
        handle.map(|h| h.join())
    }

    /// Wait until no fiber is running, sweeping expired tokens meanwhile.
    /// Returns `false` if `timeout` passed first.
    pub fn wait_for_all_fibers(&self, timeout: Option<Duration>) -> bool {
        let deadline = timeout.map(|t| Instant::now() + t);
        loop {
            let running: Vec<Arc<FiberHandle>> = read(&self.shared.fibers).values().cloned().collect();
            if running.is_empty() {
                return true;
            }
            for handle in running {
                handle.join_timeout(FIBER_POLL);
            }
            self.sweep_expired_tokens();
            if deadline.is_some_and(|d| Instant::now() >= d) {
                return read(&self.shared.fibers).is_empty();
            }
        }
    }

    /// Number of fibers still running.
    pub fn fiber_count(&self) -> usize {
        read(&self.shared.fibers).len()
    }

    /// Running fibers parked on a token, with that token.
    pub fn suspended_fibers(&self) -> Vec<(FiberId, TokenId)> {
        let mut parked: Vec<(FiberId, TokenId)> = read(&self.shared.fibers)
            .values()
            .filter_map(|h| h.suspended_on().map(|t| (h.id(), t)))
            .collect();
        parked.sort();
        parked
    }

    // ── Orphaned bubbles ──────────────────────────────────────────────────────

    /// Hand bubbles (and their claims) to the orphan table.
    pub fn add_orphaned_bubbles(&self, bubbles: BTreeMap<String, Vec<Bubble>>) {
        self.shared.orphans.add(bubbles);
    }

    /// Copy of the orphan table.  Does not drain it.
    pub fn get_orphaned_bubbles(&self) -> BTreeMap<String, Vec<Bubble>> {
        self.shared.orphans.snapshot()
    }

    /// Drain the table, releasing every drained bubble's claims.  Returns
    /// how many bubbles were dropped.
    pub fn clear_orphaned_bubbles(&self) -> usize {
        let drained = self.shared.orphans.take();
        let mut count = 0;
        for bubble in drained.into_values().flatten() {
            bubble.release(&self.shared.store);
            count += 1;
        }
        count
    }

    /// Drain the table, handing the bubbles' claims to the caller.
    pub fn take_orphaned_bubbles(&self) -> BTreeMap<String, Vec<Bubble>> {
        self.shared.orphans.take()
    }
}

/// Counts a resumption for as long as it is alive.  The token leaves the
/// table before its steps run.
struct Resuming<'a>(&'a AtomicUsize);

impl<'a> Resuming<'a> {
    fn enter(count: &'a AtomicUsize) -> Self {
        count.fetch_add(1, Ordering::AcqRel);
        Resuming(count)
    }
}

impl Drop for Resuming<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::AcqRel);
    }
}

/// Bind `args` as the `$@` list of `state`.
fn bind_args(state: &ExecutionState, args: &[Value], named: &BTreeMap<String, Value>) {
    let list = state.store_object(ObjectValue::List(Arc::new(StoredList::new(
        args.to_vec(),
        named.clone(),
    ))));
    state.set_variable(ARGS_VARIABLE, marker_value(ObjectKind::List, list));
    state.release(list);
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    fn recorder(exec: &Executor) -> Arc<Mutex<Vec<String>>> {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let log = Arc::clone(&seen);
        exec.register_command("note", move |ctx| {
            let text = ctx.args.iter().map(ToString::to_string).collect::<Vec<_>>().join(" ");
            log.lock().unwrap().push(text);
            CmdResult::Status(true)
        });
        exec.register_command("fail", |_| CmdResult::Status(false));
        seen
    }

    #[test]
    fn branches_follow_status() {
        let exec = Executor::new();
        let seen = recorder(&exec);
        let run = exec.execute("fail then note a else note b; note c & note d | note e", &[]);
        assert!(run.is_success());
        assert_eq!(*seen.lock().unwrap(), vec!["b", "c", "d"]);
    }

    #[test]
    fn direct_invocation_with_args() {
        let exec = Executor::new();
        exec.register_command("add", |ctx| {
            let sum = ctx.args.iter().map(Value::as_int).sum::<i64>();
            ctx.set_result(Value::Int(sum));
            CmdResult::Status(true)
        });
        let run = exec.execute("add", &[Value::Int(2), Value::Int(3)]);
        assert!(run.is_success());
        assert_eq!(run.result, Some(Value::Int(5)));
    }

    #[test]
    fn unknown_command_is_undefined() {
        let exec = Executor::new();
        let run = exec.execute("nope", &[Value::Int(1)]);
        assert!(!run.is_success());
        assert!(run.result.is_some_and(|r| r.is_undefined()));
        let run = exec.execute("nope 1", &[]);
        assert!(!run.is_success());
    }

    #[test]
    fn registry_overwrites_and_unregisters() {
        let exec = Executor::new();
        exec.register_command("x", |_| CmdResult::Status(false));
        exec.register_command("x", |_| CmdResult::Status(true));
        assert!(exec.execute("x", &[]).is_success());
        assert!(exec.unregister_command("x"));
        assert!(!exec.unregister_command("x"));
        assert!(!exec.has_command("x"));
    }

    #[test]
    fn parse_error_fails_and_empty_succeeds() {
        let exec = Executor::new();
        assert!(!exec.execute("echo (", &[]).is_success());
        assert!(exec.execute("  # nothing\n", &[]).is_success());
    }

    #[test]
    fn embedded_positions_are_offset() {
        let exec = Executor::new();
        let seen = Arc::new(Mutex::new(None));
        let slot = Arc::clone(&seen);
        exec.register_command("where", move |ctx| {
            *slot.lock().unwrap() = ctx.position.clone();
            CmdResult::Status(true)
        });
        let root = exec.new_root_state();
        exec.execute_with_state("  where", &root, None, "outer.paw", 4, 10);
        assert_eq!(
            seen.lock().unwrap().clone(),
            Some(SourcePosition::new("outer.paw", 5, 13))
        );
    }

    #[test]
    fn global_macro_with_args() {
        let exec = Executor::new();
        let seen = recorder(&exec);
        exec.define_macro(None, "greet", "note \"hi $1\", $#", SourcePosition::default());
        assert!(exec.has_macro("greet"));
        let run = exec.execute_macro("greet", &[Value::Str("bob".into())]);
        assert!(run.is_success());
        assert_eq!(*seen.lock().unwrap(), vec!["hi bob 1"]);
        assert_eq!(exec.object_count(), 0);
        assert!(exec.delete_macro("greet"));
        assert!(!exec.execute_macro("greet", &[]).is_success());
    }

    #[test]
    fn request_token_outside_commands_is_armed() {
        let exec = Executor::new();
        let root = exec.new_root_state();
        let ran = Arc::new(Mutex::new(false));
        let flag = Arc::clone(&ran);
        let id = exec.request_token(&root, Some(Box::new(move |_| *flag.lock().unwrap() = true)));
        assert!(exec.token_status().tokens[0].armed);
        assert!(exec.resume_token(id, true));
        assert!(!exec.resume_token(id, true));
        // resumed tokens never run their cleanup
        assert!(!*ran.lock().unwrap());
        assert!(!exec.has_pending_work());
    }

    #[test]
    fn missing_script_reports_its_path() {
        let err = read_script(Path::new("/nonexistent/run.paw")).unwrap_err();
        assert!(err.to_string().contains("/nonexistent/run.paw"));
        let exec = Executor::new();
        assert!(exec.execute_file("/nonexistent/run.paw", &[]).is_err());
    }
}
