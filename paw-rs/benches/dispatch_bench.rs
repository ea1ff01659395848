use std::sync::Arc;

use criterion::{black_box, criterion_group, criterion_main, Criterion};

use paw::script::parser::{CommandParser, Parse};
use paw::script::stdlib::{self, CaptureSink};
use paw::script::store::{ObjectStore, ObjectValue, StoredList};
use paw::script::{CmdResult, Executor, SourcePosition, Value};

fn make_script(statements: usize) -> String {
    (0..statements)
        .map(|i| format!("set v{i}, {i}; get v{i} then true else false"))
        .collect::<Vec<_>>()
        .join("\n")
}

fn engine() -> Executor {
    let exec = Executor::new();
    stdlib::register(&exec, Arc::new(CaptureSink::default()));
    exec.register_command("add", |ctx| {
        let sum: i64 = ctx.args.iter().map(Value::as_int).sum();
        ctx.set_result(Value::Int(sum));
        CmdResult::Status(true)
    });
    exec
}

fn bench_dispatch(c: &mut Criterion) {
    let exec = engine();
    exec.define_macro(
        None,
        "build",
        "list $1, $2, $3; set l; len ~l",
        SourcePosition::default(),
    );
    let small = make_script(10);
    let large = make_script(500);
    let args = [Value::Int(2), Value::Int(3)];

    let mut g = c.benchmark_group("dispatch");

    g.bench_function("direct_command", |b| {
        b.iter(|| exec.execute(black_box("add"), black_box(&args)))
    });
    g.bench_function("parse_small", |b| {
        b.iter(|| CommandParser.parse(black_box(&small), "bench.paw"))
    });
    g.bench_function("parse_large", |b| {
        b.iter(|| CommandParser.parse(black_box(&large), "bench.paw"))
    });
    g.bench_function("script_small", |b| {
        b.iter(|| exec.execute(black_box(&small), &[]))
    });
    g.bench_function("macro_call", |b| {
        b.iter(|| {
            exec.execute_macro(
                black_box("build"),
                &[Value::Int(1), Value::Int(2), Value::Int(3)],
            )
        })
    });

    g.finish();
}

fn bench_store(c: &mut Criterion) {
    let store = ObjectStore::new();
    let held = store.store(ObjectValue::List(Arc::new(StoredList::default())));

    let mut g = c.benchmark_group("store");

    g.bench_function("claim_release", |b| {
        b.iter(|| {
            store.claim(black_box(held)).ok();
            store.release(black_box(held)).ok();
        })
    });
    g.bench_function("store_evict", |b| {
        b.iter(|| {
            let id = store.store(ObjectValue::List(Arc::new(StoredList::new(
                vec![Value::Int(1), Value::Int(2)],
                Default::default(),
            ))));
            store.release(black_box(id)).ok();
        })
    });

    g.finish();
}

criterion_group!(benches, bench_dispatch, bench_store);
criterion_main!(benches);
