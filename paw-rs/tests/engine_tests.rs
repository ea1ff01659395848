//! End-to-end behaviour of the engine through its public API.

use std::collections::BTreeMap;
use std::sync::{Arc, Barrier, Mutex};
use std::thread;
use std::time::Duration;

use paw::config::EngineConfig;
use paw::script::fiber::RESULT_FLAVOR;
use paw::script::module::ModuleItem;
use paw::script::stdlib::{self, CaptureSink};
use paw::script::store::parse_marker;
use paw::script::{CmdResult, Executor, SourcePosition, TokenId, Value};

// ── Helpers ───────────────────────────────────────────────────────────────────

struct Harness {
    exec: Executor,
    seen: Arc<Mutex<Vec<String>>>,
    parked: Arc<Mutex<Vec<TokenId>>>,
    cleaned: Arc<Mutex<Vec<TokenId>>>,
}

/// An executor with `note` (records its args), `park` (suspends on a token
/// with a recording cleanup) and `now` (suspends and resumes before
/// returning).
fn harness(config: EngineConfig) -> Harness {
    let exec = Executor::with_config(config);
    let seen = Arc::new(Mutex::new(Vec::new()));
    let parked = Arc::new(Mutex::new(Vec::new()));
    let cleaned = Arc::new(Mutex::new(Vec::new()));

    let log = Arc::clone(&seen);
    exec.register_command("note", move |ctx| {
        let text = ctx.args.iter().map(ToString::to_string).collect::<Vec<_>>().join(" ");
        log.lock().unwrap().push(text);
        CmdResult::Status(true)
    });

    let tokens = Arc::clone(&parked);
    let cleanups = Arc::clone(&cleaned);
    exec.register_command("park", move |ctx| {
        let cleanups = Arc::clone(&cleanups);
        let id = ctx.request_token(Some(Box::new(move |id| cleanups.lock().unwrap().push(id))));
        tokens.lock().unwrap().push(id);
        CmdResult::Suspended(id)
    });

    exec.register_command("now", |ctx| {
        let id = ctx.request_token(None);
        assert!(ctx.resume_token(id, true));
        CmdResult::Suspended(id)
    });

    Harness {
        exec,
        seen,
        parked,
        cleaned,
    }
}

impl Harness {
    fn seen(&self) -> Vec<String> {
        self.seen.lock().unwrap().clone()
    }

    fn last_parked(&self) -> TokenId {
        *self.parked.lock().unwrap().last().expect("nothing parked")
    }
}

fn pos() -> SourcePosition {
    SourcePosition::new("test.paw", 1, 1)
}

// ── Dispatch ──────────────────────────────────────────────────────────────────

#[test]
fn registered_command_with_direct_args() {
    let exec = Executor::new();
    exec.register_command("add", |ctx| {
        let sum: i64 = ctx.args.iter().map(Value::as_int).sum();
        ctx.set_result(Value::Int(sum));
        CmdResult::Status(true)
    });
    let run = exec.execute("add", &[Value::Int(2), Value::Int(3)]);
    assert!(run.is_success());
    assert_eq!(run.result, Some(Value::Int(5)));
}

#[test]
fn unknown_command_yields_undefined() {
    let exec = Executor::new();
    let run = exec.execute("no_such_thing", &[Value::Int(1)]);
    assert!(!run.is_success());
    assert!(run.result.is_some_and(|r| r.is_undefined()));
}

// ── Suspension ────────────────────────────────────────────────────────────────

#[test]
fn commands_after_suspension_wait_for_resume() {
    let h = harness(EngineConfig::default());
    let run = h.exec.execute("note a; park; note b; note c", &[]);
    assert!(run.status.is_suspended());
    assert_eq!(h.seen(), vec!["a"]);

    let token = h.last_parked();
    assert!(h.exec.resume_token(token, true));
    assert_eq!(h.seen(), vec!["a", "b", "c"]);
    assert!(!h.exec.has_pending_work());
}

#[test]
fn token_resumes_at_most_once() {
    let h = harness(EngineConfig::default());
    h.exec.execute("park; note once", &[]);
    let token = h.last_parked();
    assert!(h.exec.resume_token(token, true));
    assert!(!h.exec.resume_token(token, true));
    assert!(!h.exec.resume_token(token, false));
    assert_eq!(h.seen(), vec!["once"]);
    assert!(h.cleaned.lock().unwrap().is_empty());
}

#[test]
fn resume_status_drives_branches() {
    let h = harness(EngineConfig::default());
    h.exec.execute("park then note yes else note no", &[]);
    h.exec.resume_token(h.last_parked(), false);
    assert_eq!(h.seen(), vec!["no"]);
}

#[test]
fn resume_before_return_runs_on_arm() {
    let h = harness(EngineConfig::default());
    let run = h.exec.execute("now; note after", &[]);
    assert!(run.status.is_suspended());
    assert_eq!(h.seen(), vec!["after"]);
    assert!(!h.exec.has_pending_work());
}

#[test]
fn expired_token_runs_cleanup_and_releases() {
    let h = harness(EngineConfig {
        token_timeout: Some(Duration::from_millis(10)),
    });
    stdlib::register(&h.exec, Arc::new(CaptureSink::default()));
    h.exec.execute("list 1, 2; set keep; park; note never", &[]);
    assert_eq!(h.exec.object_count(), 1);

    thread::sleep(Duration::from_millis(40));
    assert_eq!(h.exec.sweep_expired_tokens(), 1);
    assert_eq!(*h.cleaned.lock().unwrap(), vec![h.last_parked()]);
    assert_eq!(h.exec.object_count(), 0);
    assert!(h.seen().is_empty());
    assert!(!h.exec.resume_token(h.last_parked(), true));
}

#[test]
fn forced_cleanup_discards_token() {
    let h = harness(EngineConfig::default());
    h.exec.execute("park; note never", &[]);
    let token = h.last_parked();
    assert!(h.exec.force_cleanup_token(token));
    assert!(!h.exec.force_cleanup_token(token));
    assert_eq!(*h.cleaned.lock().unwrap(), vec![token]);
    assert!(h.seen().is_empty());
}

#[test]
fn second_resume_leaves_other_tokens_alone() {
    let h = harness(EngineConfig::default());
    h.exec.execute("park; note first", &[]);
    h.exec.execute("park; note second", &[]);
    let (first, second) = {
        let parked = h.parked.lock().unwrap();
        (parked[0], parked[1])
    };

    assert!(h.exec.resume_token(first, true));
    assert!(!h.exec.resume_token(first, true));
    let listed: Vec<TokenId> = h.exec.token_status().tokens.iter().map(|t| t.id).collect();
    assert_eq!(listed, vec![second]);

    assert!(h.exec.resume_token(second, true));
    assert_eq!(h.seen(), vec!["first", "second"]);
    assert!(h.cleaned.lock().unwrap().is_empty());
}

// ── Concurrency ───────────────────────────────────────────────────────────────

#[test]
fn concurrent_resumes_have_one_winner() {
    const CALLERS: usize = 8;
    for _ in 0..20 {
        let h = harness(EngineConfig::default());
        h.exec.execute("park; note resumed", &[]);
        let token = h.last_parked();

        let barrier = Arc::new(Barrier::new(CALLERS));
        let callers: Vec<_> = (0..CALLERS)
            .map(|_| {
                let exec = h.exec.clone();
                let barrier = Arc::clone(&barrier);
                thread::spawn(move || {
                    barrier.wait();
                    exec.resume_token(token, true)
                })
            })
            .collect();
        let wins = callers
            .into_iter()
            .map(|c| c.join().unwrap())
            .filter(|&won| won)
            .count();

        assert_eq!(wins, 1);
        assert_eq!(h.seen(), vec!["resumed"]);
        assert!(!h.exec.has_pending_work());
    }
}

#[test]
fn resume_racing_sweep_settles_once() {
    for round in 0..20u64 {
        let h = harness(EngineConfig {
            token_timeout: Some(Duration::from_millis(5)),
        });
        stdlib::register(&h.exec, Arc::new(CaptureSink::default()));
        h.exec.execute("list 1, 2; set keep; park; note late", &[]);
        let token = h.last_parked();
        thread::sleep(Duration::from_millis(round % 8));

        let barrier = Arc::new(Barrier::new(2));
        let resumer = {
            let exec = h.exec.clone();
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                barrier.wait();
                exec.resume_token(token, true)
            })
        };
        let sweeper = {
            let exec = h.exec.clone();
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                barrier.wait();
                exec.sweep_expired_tokens()
            })
        };
        let resumed = resumer.join().unwrap();
        sweeper.join().unwrap();

        let cleaned = h.cleaned.lock().unwrap().clone();
        if resumed {
            assert_eq!(h.seen(), vec!["late"]);
            assert!(cleaned.is_empty());
        } else {
            assert!(h.seen().is_empty());
            assert_eq!(cleaned, vec![token]);
        }
        assert!(h.exec.token_status().tokens.is_empty());
        assert_eq!(h.exec.object_count(), 0);
    }
}

// ── Macros ────────────────────────────────────────────────────────────────────

#[test]
fn macro_runs_leave_no_objects() {
    let h = harness(EngineConfig::default());
    stdlib::register(&h.exec, Arc::new(CaptureSink::default()));
    h.exec.define_macro(None, "build", "list $1, $2; set l; len ~l; note ~l", pos());

    let run = h.exec.execute_macro("build", &[Value::Int(1), Value::Int(2)]);
    assert!(run.is_success());
    assert_eq!(h.seen().len(), 1);
    assert_eq!(h.exec.object_count(), 0);
}

#[test]
fn suspended_macro_leaves_no_objects() {
    let h = harness(EngineConfig::default());
    stdlib::register(&h.exec, Arc::new(CaptureSink::default()));
    h.exec.define_macro(None, "slow", "list $1; set l; park; len ~l; note done", pos());

    let run = h.exec.execute("slow 5; note outer", &[]);
    assert!(run.status.is_suspended());
    assert!(h.exec.object_count() > 0);

    h.exec.resume_token(h.last_parked(), true);
    assert_eq!(h.seen(), vec!["done", "outer"]);
    assert_eq!(h.exec.object_count(), 0);
}

#[test]
fn forward_declaration_never_runs() {
    let h = harness(EngineConfig::default());
    h.exec.declare_macro(None, "later", pos());
    assert!(h.exec.has_macro("later"));
    let run = h.exec.execute("later", &[]);
    assert!(!run.is_success());
    assert!(run.result.is_some_and(|r| r.is_undefined()));

    h.exec.execute("later | note failed; note after", &[]);
    assert_eq!(h.seen(), vec!["failed", "after"]);
}

#[test]
fn innermost_export_wins() {
    let h = harness(EngineConfig::default());
    stdlib::register(&h.exec, Arc::new(CaptureSink::default()));
    let root = h.exec.new_root_state();
    let status = h.exec.execute_in(
        &root,
        "macro inner, (set v, 2; export v)\n\
         macro outer, (set v, 1; export v; inner)\n\
         outer",
        "exports.paw",
    );
    assert!(status.is_success());
    match root.inherited_item("exports", "v") {
        Some(ModuleItem::Value(v)) => assert_eq!(v, Value::Int(2)),
        other => panic!("unexpected export: {other:?}"),
    }
    root.release_all_references();
}

#[test]
fn runaway_recursion_is_stopped() {
    // deep recursion needs more stack than the default test thread has
    let done = thread::Builder::new()
        .stack_size(256 * 1024 * 1024)
        .spawn(|| {
            let h = harness(EngineConfig::default());
            h.exec.define_macro(None, "down", "down", pos());
            let run = h.exec.execute("down", &[]);
            (run.is_success(), h.exec.object_count())
        })
        .unwrap()
        .join()
        .unwrap();
    assert_eq!(done, (false, 0));
}

// ── Fibers ────────────────────────────────────────────────────────────────────

#[test]
fn fiber_result_reaches_waiter() {
    let exec = Executor::new();
    let sink = Arc::new(CaptureSink::default());
    stdlib::register(&exec, sink.clone());
    let run = exec.execute(
        "fiber_spawn (msleep 10; ret 7); set f; fiber_wait ~f; set r; echo ~r",
        &[],
    );
    assert!(run.is_success());
    assert_eq!(sink.take(), vec!["7"]);
    assert!(exec.wait_for_all_fibers(Some(Duration::from_secs(5))));
    assert_eq!(exec.object_count(), 0);
}

#[test]
fn fiber_inputs_survive_unset_after_spawn() {
    let exec = Executor::new();
    let sink = Arc::new(CaptureSink::default());
    stdlib::register(&exec, sink.clone());
    for _ in 0..50 {
        let run = exec.execute(
            "list 1, 2, 3; set l; fiber_spawn (echo $1), ~l; set f; unset l; fiber_wait ~f",
            &[],
        );
        assert!(run.is_success());
        assert_eq!(sink.take(), vec!["[1, 2, 3]"]);
    }
    assert!(exec.wait_for_all_fibers(Some(Duration::from_secs(5))));
    assert_eq!(exec.object_count(), 0);
}

#[test]
fn abandoned_fiber_orphans_its_result() {
    let exec = Executor::new();
    stdlib::register(&exec, Arc::new(CaptureSink::default()));
    let mac = exec.define_macro(None, "produce", "bubble log, \"done\"; list 1, 2", pos());

    let fiber = exec
        .spawn_fiber(mac, Vec::new(), BTreeMap::new(), None)
        .unwrap();
    assert!(fiber.handle.join());
    assert!(exec.wait_for_all_fibers(Some(Duration::from_secs(5))));
    assert!(exec.get_orphaned_bubbles().is_empty());

    // dropping the only handle abandons the fiber
    assert!(exec.release_object(fiber.object));
    let orphans = exec.get_orphaned_bubbles();
    let result = &orphans[RESULT_FLAVOR][0];
    let (_, x) = parse_marker(&result.content).expect("list marker");
    assert_eq!(result.refs, vec![x]);
    assert_eq!(exec.store().ref_count(x), Some(1));
    assert_eq!(orphans["log"][0].content, Value::Str("done".into()));
    assert_eq!(orphans["log"][0].fiber, fiber.id);

    assert_eq!(exec.clear_orphaned_bubbles(), 2);
    assert!(exec.get_orphaned_bubbles().is_empty());
    assert_eq!(exec.object_count(), 0);
}

#[test]
fn fiber_parked_on_token_is_listed() {
    let h = harness(EngineConfig::default());
    let mac = h.exec.define_macro(None, "waiter", "park; note woke", pos());
    let fiber = h.exec.spawn_fiber(mac, Vec::new(), BTreeMap::new(), None).unwrap();

    let mut parked = Vec::new();
    for _ in 0..200 {
        parked = h.exec.suspended_fibers();
        if !parked.is_empty() {
            break;
        }
        thread::sleep(Duration::from_millis(5));
    }
    assert_eq!(parked, vec![(fiber.id, h.last_parked())]);

    h.exec.resume_token(h.last_parked(), true);
    assert!(fiber.handle.join());
    assert_eq!(h.seen(), vec!["woke"]);
    assert!(h.exec.wait_for_all_fibers(Some(Duration::from_secs(5))));
    h.exec.release_object(fiber.object);
    h.exec.clear_orphaned_bubbles();
    assert_eq!(h.exec.object_count(), 0);
}
