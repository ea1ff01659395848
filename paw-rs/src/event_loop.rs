//! Async driver for the `paw` binary.
//!
//! The engine itself is synchronous: commands run on whichever thread
//! calls into the [`Executor`] and resumptions arrive from sleeper threads
//! or fibers.  What the binary still needs is someone to sweep expired
//! tokens, keep the process alive while work is outstanding, react to
//! signals and (in REPL mode) feed stdin lines in.  [`EventLoop`] does that
//! in one `tokio::select!` loop:
//!
//! ```text
//!   stdin thread ──lines──▶ ┌──────────────────────────┐
//!                           │ tokio::select! over:     │
//!   SIGINT / SIGTERM ─────▶ │   line | signal | timer  │ ──▶ Executor
//!                           │ timer = next deadline    │
//!                           └──────────────────────────┘
//! ```

use std::io::{self, BufRead, Write};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::mpsc;
use tokio::time::sleep_until;

use crate::diag::Category;
use crate::script::context::CmdResult;
use crate::script::executor::Executor;
use crate::script::state::ExecutionState;

/// Longest the loop sleeps without checking for finished work.
pub const POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Filename reported for statements typed at the REPL.
pub const STDIN_NAME: &str = "<stdin>";

const PROMPT: &str = "paw> ";
const CONTINUATION_PROMPT: &str = "...> ";

// ── Outcome ───────────────────────────────────────────────────────────────────

/// Why a loop returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// No token or fiber left.
    Idle,
    /// SIGINT or SIGTERM; outstanding tokens were discarded.
    Interrupted,
}

// ── Line assembly ─────────────────────────────────────────────────────────────

/// Joins input lines until every `(` block is closed.
#[derive(Debug, Default)]
pub struct LineBuffer {
    text: String,
    depth: usize,
    in_quote: bool,
}

impl LineBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one line.  Returns the complete statement text once no block
    /// or string is left open.
    pub fn push(&mut self, line: &str) -> Option<String> {
        let mut escaped = false;
        for ch in line.chars() {
            if self.in_quote {
                match ch {
                    _ if escaped => escaped = false,
                    '\\' => escaped = true,
                    '"' => self.in_quote = false,
                    _ => {}
                }
                continue;
            }
            match ch {
                '"' => self.in_quote = true,
                '(' => self.depth += 1,
                ')' => self.depth = self.depth.saturating_sub(1),
                _ => {}
            }
        }
        if !self.text.is_empty() {
            self.text.push('\n');
        }
        self.text.push_str(line);
        if self.depth > 0 || self.in_quote {
            return None;
        }
        Some(std::mem::take(&mut self.text))
    }

    pub fn is_pending(&self) -> bool {
        !self.text.is_empty()
    }
}

// ── EventLoop ─────────────────────────────────────────────────────────────────

pub struct EventLoop {
    executor: Executor,
    poll: Duration,
    prompt: bool,
}

impl EventLoop {
    pub fn new(executor: Executor) -> Self {
        Self {
            executor,
            poll: POLL_INTERVAL,
            prompt: false,
        }
    }

    /// Print a prompt before each REPL line.
    pub fn with_prompt(mut self, prompt: bool) -> Self {
        self.prompt = prompt;
        self
    }

    pub fn executor(&self) -> &Executor {
        &self.executor
    }

    /// When the timer branch should next fire.
    fn next_wakeup(&self) -> Instant {
        let fallback = Instant::now() + self.poll;
        self.executor
            .next_token_deadline()
            .map_or(fallback, |d| d.min(fallback))
    }

    /// Sweep expired tokens and wait until no token or fiber is left.
    pub async fn run_until_idle(&mut self) -> io::Result<Outcome> {
        let mut sigterm = signal(SignalKind::terminate())?;
        let mut sigint = signal(SignalKind::interrupt())?;

        loop {
            self.executor.sweep_expired_tokens();
            if !self.executor.has_pending_work() {
                return Ok(Outcome::Idle);
            }

            let timer = sleep_until(self.next_wakeup().into());
            tokio::pin!(timer);

            tokio::select! {
                _ = sigint.recv() => return Ok(self.interrupt("SIGINT")),
                _ = sigterm.recv() => return Ok(self.interrupt("SIGTERM")),
                _ = &mut timer => {}
            }
        }
    }

    /// Read statements from stdin and run each against `state`, then wait
    /// for outstanding work once stdin is exhausted.
    pub async fn repl(&mut self, state: &Arc<ExecutionState>) -> io::Result<Outcome> {
        let mut sigterm = signal(SignalKind::terminate())?;
        let mut sigint = signal(SignalKind::interrupt())?;

        // A dedicated thread owns stdin.  `tokio::io::stdin` would leave a
        // blocking read behind every time select! drops its future.
        let (line_tx, mut line_rx) = mpsc::channel::<String>(16);
        std::thread::spawn(move || {
            let stdin = io::stdin();
            for line in stdin.lock().lines() {
                let Ok(line) = line else { break };
                if line_tx.blocking_send(line).is_err() {
                    break;
                }
            }
        });

        let mut buffer = LineBuffer::new();
        self.show_prompt(&buffer);
        loop {
            let timer = sleep_until(self.next_wakeup().into());
            tokio::pin!(timer);

            tokio::select! {
                line = line_rx.recv() => match line {
                    Some(line) => {
                        if let Some(text) = buffer.push(&line) {
                            self.run_line(state, &text);
                        }
                        self.show_prompt(&buffer);
                    }
                    None => {
                        if buffer.is_pending() {
                            tracing::warn!(category = %Category::Parse, "unterminated input at end of stdin");
                        }
                        break;
                    }
                },
                _ = sigint.recv() => return Ok(self.interrupt("SIGINT")),
                _ = sigterm.recv() => return Ok(self.interrupt("SIGTERM")),
                _ = &mut timer => {
                    self.executor.sweep_expired_tokens();
                }
            }
        }

        self.run_until_idle().await
    }

    fn run_line(&self, state: &Arc<ExecutionState>, text: &str) {
        if text.trim().is_empty() {
            return;
        }
        // Handlers may block (fiber_wait), so keep them off the reactor.
        let status = tokio::task::block_in_place(|| self.executor.execute_in(state, text, STDIN_NAME));
        if let CmdResult::Suspended(token) = status {
            tracing::debug!(category = %Category::Async, %token, "statement suspended");
        }
    }

    fn show_prompt(&self, buffer: &LineBuffer) {
        if !self.prompt {
            return;
        }
        let prompt = if buffer.is_pending() { CONTINUATION_PROMPT } else { PROMPT };
        let mut out = io::stdout().lock();
        let _ = out.write_all(prompt.as_bytes());
        let _ = out.flush();
    }

    /// Discard every outstanding token.  Parked fibers wake with `false`.
    fn interrupt(&self, signal: &str) -> Outcome {
        let ids: Vec<_> = self.executor.token_status().tokens.iter().map(|t| t.id).collect();
        tracing::info!(category = %Category::Async, signal, tokens = ids.len(), "interrupted");
        for id in ids {
            self.executor.force_cleanup_token(id);
        }
        Outcome::Interrupted
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
