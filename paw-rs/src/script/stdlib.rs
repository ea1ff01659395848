//! Core commands.
//!
//! Just enough for scripts to drive the engine: variables, macros, lists,
//! channels, bubbles, fibers and a timer.  Output goes to an injected
//! [`OutputSink`].
//!
//! | command        | arguments                          | result            |
//! |----------------|------------------------------------|-------------------|
//! | `true`/`false` |                                    |                   |
//! | `echo`         | values…                            |                   |
//! | `set`          | name[, value]                      |                   |
//! | `get`          | name                               | the value         |
//! | `unset`        | name                               |                   |
//! | `ret`          | [value][, status: bool]            | the value         |
//! | `macro`        | [name][, (body)]                   | marker if unnamed |
//! | `call`         | name \| marker \| (body), args…    | callee's result   |
//! | `export`       | name                               |                   |
//! | `list`         | items…, key: value…                | list marker       |
//! | `len`          | list \| text                       | length            |
//! | `bubble`       | flavor, value                      |                   |
//! | `channel`      |                                    | channel marker    |
//! | `send`         | channel, value                     |                   |
//! | `recv`         | channel                            | the value         |
//! | `close`        | channel                            |                   |
//! | `fiber_spawn`  | name \| marker \| (body), args…    | fiber marker      |
//! | `fiber_wait`   | fiber                              | fiber's result    |
//! | `msleep`       | milliseconds                       |                   |
//!
//! `set name` without a value binds the current result, which is how a
//! script keeps what a command produced.

use std::collections::BTreeMap;
use std::io::Write;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use crate::diag::Category;
use crate::sync::lock;

use super::context::{CmdResult, Context};
use super::executor::{CommandCall, Executor};
use super::macros::Macro;
use super::module::ModuleItem;
use super::store::{
    marker_value, parse_marker, Channel, ObjectKind, ObjectStore, ObjectValue, StoredList,
};
use super::value::Value;

// ── Output ────────────────────────────────────────────────────────────────────

/// Where `echo` writes.
pub trait OutputSink: Send + Sync {
    fn write_line(&self, line: &str);
}

/// Writes to the process's standard output.
#[derive(Debug, Default, Clone, Copy)]
pub struct Stdout;

impl OutputSink for Stdout {
    fn write_line(&self, line: &str) {
        let mut out = std::io::stdout().lock();
        let _ = writeln!(out, "{line}");
    }
}

/// Collects lines in memory.
#[derive(Debug, Default)]
pub struct CaptureSink {
    lines: Mutex<Vec<String>>,
}

impl CaptureSink {
    pub fn lines(&self) -> Vec<String> {
        lock(&self.lines).clone()
    }

    pub fn take(&self) -> Vec<String> {
        std::mem::take(&mut *lock(&self.lines))
    }
}

impl OutputSink for CaptureSink {
    fn write_line(&self, line: &str) {
        lock(&self.lines).push(line.to_owned());
    }
}

/// Human-readable text for a value, following list markers.
pub fn render(value: &Value, store: &ObjectStore) -> String {
    let Some((kind, id)) = parse_marker(value) else {
        return value.to_string();
    };
    match store.get(id) {
        Some(ObjectValue::List(list)) => {
            let mut parts: Vec<String> = list.items.iter().map(|v| render(v, store)).collect();
            parts.extend(
                list.named
                    .iter()
                    .map(|(k, v)| format!("{k}: {}", render(v, store))),
            );
            format!("[{}]", parts.join(", "))
        }
        Some(ObjectValue::Str(s)) => s.to_string(),
        Some(_) => format!("<{} {id}>", kind.tag().to_lowercase()),
        None => format!("<stale {} {id}>", kind.tag().to_lowercase()),
    }
}

// ── Registration ──────────────────────────────────────────────────────────────

/// Register every core command on `executor`.
pub fn register(executor: &Executor, sink: Arc<dyn OutputSink>) {
    executor.register_command("true", |_| CmdResult::Status(true));
    executor.register_command("false", |_| CmdResult::Status(false));
    executor.register_command("echo", move |ctx| cmd_echo(ctx, sink.as_ref()));
    executor.register_command("set", cmd_set);
    executor.register_command("get", cmd_get);
    executor.register_command("unset", cmd_unset);
    executor.register_command("ret", cmd_ret);
    executor.register_command("macro", cmd_macro);
    executor.register_command("call", cmd_call);
    executor.register_command("export", cmd_export);
    executor.register_command("list", cmd_list);
    executor.register_command("len", cmd_len);
    executor.register_command("bubble", cmd_bubble);
    executor.register_command("channel", cmd_channel);
    executor.register_command("send", cmd_send);
    executor.register_command("recv", cmd_recv);
    executor.register_command("close", cmd_close);
    executor.register_command("fiber_spawn", cmd_fiber_spawn);
    executor.register_command("fiber_wait", cmd_fiber_wait);
    executor.register_command("msleep", cmd_msleep);
}

fn usage(ctx: &Context<'_>, text: &str) -> CmdResult {
    ctx.log_error(Category::Argument, &format!("usage: {text}"));
    CmdResult::Status(false)
}

/// Argument text usable as a name.
fn name_arg(ctx: &Context<'_>, i: usize) -> Option<String> {
    match ctx.arg(i)? {
        Value::Symbol(s) | Value::Str(s) if !s.is_empty() => Some(s.clone()),
        _ => None,
    }
}

/// Put a fresh object in the store and make it the command's result.  The
/// result ends up holding the only claim.
fn store_as_result(ctx: &Context<'_>, value: ObjectValue) {
    let kind = value.kind();
    let id = ctx.store_object(value);
    ctx.set_result(marker_value(kind, id));
    ctx.release_object(id);
}

// ── Values ────────────────────────────────────────────────────────────────────

fn cmd_echo(ctx: &mut Context<'_>, sink: &dyn OutputSink) -> CmdResult {
    let store = ctx.state().store();
    let line = ctx
        .args
        .iter()
        .map(|v| render(v, store))
        .collect::<Vec<_>>()
        .join(" ");
    sink.write_line(&line);
    CmdResult::Status(true)
}

fn cmd_set(ctx: &mut Context<'_>) -> CmdResult {
    let Some(name) = name_arg(ctx, 0) else {
        return usage(ctx, "set name[, value]");
    };
    let value = match ctx.arg(1) {
        Some(v) => v.clone(),
        None => ctx.result().unwrap_or_else(Value::undefined),
    };
    ctx.set_variable(&name, value);
    CmdResult::Status(true)
}

fn cmd_get(ctx: &mut Context<'_>) -> CmdResult {
    let Some(name) = name_arg(ctx, 0) else {
        return usage(ctx, "get name");
    };
    match ctx.variable(&name) {
        Some(v) => {
            ctx.set_result(v);
            CmdResult::Status(true)
        }
        None => {
            ctx.log_warning(Category::Variable, &format!("unknown variable: {name}"));
            ctx.set_result(Value::undefined());
            CmdResult::Status(false)
        }
    }
}

fn cmd_unset(ctx: &mut Context<'_>) -> CmdResult {
    let Some(name) = name_arg(ctx, 0) else {
        return usage(ctx, "unset name");
    };
    CmdResult::Status(ctx.state().delete_variable(&name))
}

fn cmd_ret(ctx: &mut Context<'_>) -> CmdResult {
    if let Some(v) = ctx.arg(0) {
        ctx.set_result(v.clone());
    }
    let status = ctx.named("status").map_or(true, Value::as_bool);
    CmdResult::Return(status)
}

// ── Macros and modules ────────────────────────────────────────────────────────

fn cmd_macro(ctx: &mut Context<'_>) -> CmdResult {
    let position = ctx.position.clone().unwrap_or_default();
    match (ctx.arg(0).cloned(), ctx.arg(1).cloned()) {
        (Some(Value::Block(body)), None) => {
            let mac = Macro::new(None, body, position);
            store_as_result(ctx, ObjectValue::Macro(Arc::new(mac)));
            CmdResult::Status(true)
        }
        (Some(_), body) => {
            let Some(name) = name_arg(ctx, 0) else {
                return usage(ctx, "macro [name][, (body)]");
            };
            // top-level definitions are global, macro-local ones stay local
            let local = ctx.macro_context().is_some().then(|| Arc::clone(ctx.state()));
            let exec = ctx.executor();
            match body {
                Some(Value::Block(body)) => {
                    exec.define_macro(local.as_deref(), &name, &body, position);
                }
                Some(Value::Str(body)) => {
                    exec.define_macro(local.as_deref(), &name, &body, position);
                }
                None => exec.declare_macro(local.as_deref(), &name, position),
                Some(other) => {
                    ctx.log_error(
                        Category::Type,
                        &format!("macro body must be a block, got {}", other.type_name()),
                    );
                    return CmdResult::Status(false);
                }
            }
            CmdResult::Status(true)
        }
        (None, _) => usage(ctx, "macro [name][, (body)]"),
    }
}

/// Resolve a callable argument: a block, a `MACRO` marker, or a macro name
/// visible from the running state.
fn callable(ctx: &Context<'_>, target: &Value) -> Option<Arc<Macro>> {
    match target {
        Value::Block(body) => Some(Arc::new(Macro::new(
            None,
            body.clone(),
            ctx.position.clone().unwrap_or_default(),
        ))),
        v => {
            if let Some((ObjectKind::Macro, id)) = parse_marker(v) {
                return ctx.state().store().macro_object(id);
            }
            let name = v.text()?;
            ctx.state()
                .lookup_macro(name)
                .or_else(|| ctx.executor().global_macro(name))
        }
    }
}

fn cmd_call(ctx: &mut Context<'_>) -> CmdResult {
    let Some(target) = ctx.arg(0).cloned() else {
        return usage(ctx, "call name|macro|(body), args...");
    };
    let args = ctx.args[1..].to_vec();
    let named = std::mem::take(&mut ctx.named_args);
    if let Some(mac) = callable(ctx, &target) {
        return ctx
            .executor()
            .call_macro(mac, args, named, ctx.position.clone(), ctx.state());
    }
    // fall back to a registered command
    let name = target.text().unwrap_or_default().to_owned();
    let call = CommandCall {
        args,
        named,
        raw_args: ctx.raw_args.iter().skip(1).cloned().collect(),
        position: ctx.position.clone(),
    };
    let executor = ctx.executor().clone();
    match executor.invoke_command(&name, call, ctx.state(), ctx.substitution()) {
        Some(result) => result,
        None => {
            ctx.log_error(Category::Command, &format!("call: nothing callable named {target}"));
            ctx.set_result(Value::undefined());
            CmdResult::Status(false)
        }
    }
}

fn cmd_export(ctx: &mut Context<'_>) -> CmdResult {
    let Some(name) = name_arg(ctx, 0) else {
        return usage(ctx, "export name");
    };
    let item = match ctx.variable(&name) {
        Some(v) => ModuleItem::Value(v),
        None => match ctx.state().lookup_macro(&name) {
            Some(m) => ModuleItem::Macro(m),
            None => {
                ctx.log_error(Category::Variable, &format!("export: nothing named {name}"));
                return CmdResult::Status(false);
            }
        },
    };
    if !ctx.state().export(&name, item) {
        ctx.log_error(Category::Macro, "export outside of a macro");
        return CmdResult::Status(false);
    }
    CmdResult::Status(true)
}

// ── Lists ─────────────────────────────────────────────────────────────────────

fn cmd_list(ctx: &mut Context<'_>) -> CmdResult {
    let list = StoredList::new(ctx.args.clone(), ctx.named_args.clone());
    store_as_result(ctx, ObjectValue::List(Arc::new(list)));
    CmdResult::Status(true)
}

fn cmd_len(ctx: &mut Context<'_>) -> CmdResult {
    let Some(target) = ctx.arg(0).cloned() else {
        return usage(ctx, "len list|text");
    };
    let len = match ctx.object_for(&target) {
        Some((_, _, ObjectValue::List(l))) => l.len(),
        Some((_, _, ObjectValue::Str(s))) => s.chars().count(),
        Some((_, _, ObjectValue::Bytes(b))) => b.len(),
        Some((_, _, ObjectValue::Channel(c))) => c.len(),
        Some((kind, ..)) => {
            ctx.log_error(Category::Type, &format!("len: {} has no length", kind.tag()));
            return CmdResult::Status(false);
        }
        None => target.to_string().chars().count(),
    };
    ctx.set_result(Value::Int(len as i64));
    CmdResult::Status(true)
}

fn cmd_bubble(ctx: &mut Context<'_>) -> CmdResult {
    let (Some(flavor), Some(content)) = (name_arg(ctx, 0), ctx.arg(1).cloned()) else {
        return usage(ctx, "bubble flavor, value");
    };
    ctx.state().add_bubble(&flavor, content);
    CmdResult::Status(true)
}

// ── Channels ──────────────────────────────────────────────────────────────────

fn channel_arg(ctx: &Context<'_>) -> Option<Arc<Channel>> {
    match ctx.object_for(ctx.arg(0)?)? {
        (_, _, ObjectValue::Channel(c)) => Some(c),
        _ => None,
    }
}

fn cmd_channel(ctx: &mut Context<'_>) -> CmdResult {
    store_as_result(ctx, ObjectValue::Channel(Arc::new(Channel::default())));
    CmdResult::Status(true)
}

fn cmd_send(ctx: &mut Context<'_>) -> CmdResult {
    let (Some(chan), Some(value)) = (channel_arg(ctx), ctx.arg(1).cloned()) else {
        return usage(ctx, "send channel, value");
    };
    // queued values hold their own claims until received
    let store = Arc::clone(ctx.state().store());
    let refs = super::store::scan_markers(&value);
    let claimed: Vec<_> = refs.into_iter().filter(|id| store.claim(*id).is_ok()).collect();
    match chan.send(value) {
        Ok(()) => CmdResult::Status(true),
        Err(_) => {
            store.release_all(claimed);
            ctx.log_warning(Category::Io, "send on a closed channel");
            CmdResult::Status(false)
        }
    }
}

fn cmd_recv(ctx: &mut Context<'_>) -> CmdResult {
    let Some(chan) = channel_arg(ctx) else {
        return usage(ctx, "recv channel");
    };
    match chan.recv() {
        Some(value) => {
            ctx.set_result(value.clone());
            ctx.state()
                .store()
                .release_all(super::store::scan_markers(&value));
            CmdResult::Status(true)
        }
        None => {
            ctx.set_result(Value::undefined());
            CmdResult::Status(false)
        }
    }
}

fn cmd_close(ctx: &mut Context<'_>) -> CmdResult {
    let Some(chan) = channel_arg(ctx) else {
        return usage(ctx, "close channel");
    };
    let pending = chan.close();
    let store = ctx.state().store();
    for value in &pending {
        store.release_all(super::store::scan_markers(value));
    }
    CmdResult::Status(true)
}

// ── Fibers and time ───────────────────────────────────────────────────────────

fn cmd_fiber_spawn(ctx: &mut Context<'_>) -> CmdResult {
    let Some(target) = ctx.arg(0).cloned() else {
        return usage(ctx, "fiber_spawn name|macro|(body), args...");
    };
    let Some(mac) = callable(ctx, &target) else {
        ctx.log_error(Category::Macro, &format!("fiber_spawn: no macro {target}"));
        return CmdResult::Status(false);
    };
    let args = ctx.args[1..].to_vec();
    let named: BTreeMap<String, Value> = ctx.named_args.clone();
    match ctx.executor().spawn_fiber(mac, args, named, Some(ctx.state())) {
        Ok(fiber) => {
            ctx.set_result(marker_value(ObjectKind::Fiber, fiber.object));
            ctx.release_object(fiber.object);
            CmdResult::Status(true)
        }
        Err(e) => {
            ctx.log_error(Category::Async, &e.to_string());
            CmdResult::Status(false)
        }
    }
}

fn cmd_fiber_wait(ctx: &mut Context<'_>) -> CmdResult {
    let handle = match ctx.arg(0).and_then(|v| ctx.object_for(v)) {
        Some((_, _, ObjectValue::Fiber(h))) => h,
        _ => return usage(ctx, "fiber_wait fiber"),
    };
    let status = handle.consume_into(ctx.state());
    CmdResult::Status(status)
}

fn cmd_msleep(ctx: &mut Context<'_>) -> CmdResult {
    let Some(ms) = ctx.arg(0).and_then(Value::to_int).filter(|ms| *ms >= 0) else {
        return usage(ctx, "msleep milliseconds");
    };
    let token = ctx.request_token(None);
    let exec = ctx.executor().clone();
    let spawned = thread::Builder::new()
        .name(format!("msleep-{token}"))
        .spawn(move || {
            thread::sleep(Duration::from_millis(ms as u64));
            exec.resume_token(token, true);
        });
    if let Err(e) = spawned {
        ctx.log_error(Category::System, &format!("msleep: {e}"));
        ctx.executor().force_cleanup_token(token);
        return CmdResult::Status(false);
    }
    CmdResult::Suspended(token)
}

// ── Tests ─────────────────────────────────────────────────────────────────────
