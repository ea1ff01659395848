use std::sync::Arc;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use paw::cli::{self, CliArgs, Mode};
use paw::config::{Config, InitScript};
use paw::diag::Category;
use paw::event_loop::{EventLoop, Outcome};
use paw::script::stdlib::{self, Stdout};
use paw::script::{read_script, CmdResult, Executor, Value};

const EXIT_OK: i32 = 0;
const EXIT_FAILURE: i32 = 1;
const EXIT_USAGE: i32 = 2;

#[tokio::main]
async fn main() {
    let args = CliArgs::parse();

    // ── Configuration: defaults → environment → flags ────────────────────────
    let mut config = match Config::from_env() {
        Ok(c) => c,
        Err(e) => {
            eprintln!("paw: {e}");
            std::process::exit(EXIT_USAGE);
        }
    };
    if let Err(e) = args.apply(&mut config) {
        eprintln!("paw: {e}");
        std::process::exit(EXIT_USAGE);
    }

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(config.effective_log_filter(args.debug)))
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();

    std::process::exit(run(args, config).await);
}

async fn run(args: CliArgs, config: Config) -> i32 {
    let executor = Executor::with_config(config.engine.clone());
    stdlib::register(&executor, Arc::new(Stdout));

    let libdir = cli::resolve_libdir(config.lib_dir.as_deref());
    tracing::debug!(category = %Category::Io, libdir = %libdir.display(), "library directory");

    // ── Init script ──────────────────────────────────────────────────────────
    let init = match &config.init {
        InitScript::Skip => None,
        InitScript::Explicit(path) => Some(path.clone()),
        InitScript::Search => cli::find_user_config(),
    };
    if let Some(path) = init {
        // Macros it defines at top level are global and outlive its state.
        match executor.execute_file(&path, &[]) {
            Ok(run) if !run.is_success() => {
                tracing::warn!(category = %Category::Io, path = %path.display(), "init script failed");
            }
            Ok(_) => {}
            Err(e) => eprintln!("paw: warning: {e}"),
        }
    }

    // ── Main activation ──────────────────────────────────────────────────────
    let root = executor.new_root_state();
    root.set_variable("PAWLIB", Value::Str(libdir.display().to_string()));

    let is_tty = unsafe {
        libc::isatty(libc::STDIN_FILENO) != 0 && libc::isatty(libc::STDOUT_FILENO) != 0
    };
    let mut event_loop = EventLoop::new(executor.clone()).with_prompt(is_tty);
    let script_args = args.script_args();

    // Status of a run that finished synchronously; a suspended one reports
    // through the root state's last status once resumed.
    let mut finished: Option<bool> = None;
    let outcome = match args.mode() {
        Mode::Eval(code) => {
            // Handlers may block (fiber_wait), so keep them off the reactor.
            let status = tokio::task::block_in_place(|| {
                executor.execute_in_with_args(&root, &code, "<eval>", &script_args)
            });
            finished = (!status.is_suspended()).then(|| status.is_success());
            event_loop.run_until_idle().await
        }
        Mode::File(path) => {
            let text = match read_script(&path) {
                Ok(t) => t,
                Err(e) => {
                    eprintln!("paw: {e}");
                    return EXIT_USAGE;
                }
            };
            let filename = path.display().to_string();
            let status = tokio::task::block_in_place(|| {
                executor.execute_in_with_args(&root, &text, &filename, &script_args)
            });
            match status {
                CmdResult::Suspended(token) => {
                    tracing::debug!(category = %Category::Async, %token, "script suspended");
                }
                status => finished = Some(status.is_success()),
            }
            event_loop.run_until_idle().await
        }
        Mode::Stdin => event_loop.repl(&root).await,
    };

    let code = match outcome {
        Ok(Outcome::Idle) if finished.unwrap_or_else(|| root.last_status()) => EXIT_OK,
        Ok(_) => EXIT_FAILURE,
        Err(e) => {
            eprintln!("paw: {e}");
            EXIT_FAILURE
        }
    };

    root.release_all_references();
    let leftover = executor.clear_orphaned_bubbles();
    if leftover > 0 {
        tracing::debug!(category = %Category::Memory, leftover, "dropped orphaned bubbles");
    }
    code
}
