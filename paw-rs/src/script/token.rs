//! Suspension tokens.
//!
//! A command handler that cannot finish right away asks for a token and
//! returns [`CmdResult::Suspended`](super::context::CmdResult::Suspended).
//! Every dispatcher level the suspension passes through on its way out
//! queues what it still has to do as a [`Step`] on that token: the rest of
//! its command sequence, a macro's return bookkeeping, the top-level
//! release.  Resuming the token replays the queue in order on the resuming
//! thread.
//!
//! A token is *arming* until the outermost dispatcher has finished queueing
//! and *armed* afterwards.  A resume that arrives while arming is recorded
//! and replayed by whoever arms the token, so a fast producer can never
//! overtake the dispatcher.  Deadlines only apply to armed tokens.
//!
//! Like the process scheduler it is modelled on, the table never sleeps on
//! its own: hosts call [`TokenTable::next_deadline`] to know when to wake
//! and the executor's sweep to discard what has expired.

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::Sender;
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};

use crate::sync::{read, write};

use super::command::{CommandSequence, SourcePosition};
use super::fiber::FiberId;
use super::macros::MacroFrame;
use super::state::ExecutionState;
use super::substitute::SubstitutionContext;

/// Identifier handed out by [`TokenTable::request`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TokenId {
    pub fiber: FiberId,
    pub seq: u64,
}

impl fmt::Display for TokenId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "fiber-{}-token-{}", self.fiber, self.seq)
    }
}

/// Runs if a token is discarded without being resumed.
pub type Cleanup = Box<dyn FnOnce(TokenId) + Send + Sync>;

/// Where to pick a command sequence back up.
#[derive(Clone)]
pub(crate) struct Continuation {
    pub commands: CommandSequence,
    pub next: usize,
    pub subst: Option<SubstitutionContext>,
}

/// One piece of deferred work queued on a token.
pub(crate) enum Step {
    /// Continue a command sequence against a state.
    Sequence {
        state: Arc<ExecutionState>,
        continuation: Continuation,
    },
    /// Export merge, result transfer and teardown of a macro activation.
    MacroReturn(MacroFrame),
    /// Top-level release of a state's references.
    Release(Arc<ExecutionState>),
    /// Wake a parked fiber with the final status.
    Notify(Sender<bool>),
}

impl Step {
    /// Give up on the step: run whatever teardown it owns.
    pub(crate) fn abandon(self) {
        match self {
            Step::MacroReturn(frame) => frame.abort(),
            Step::Release(state) => state.release_all_references(),
            Step::Sequence { .. } | Step::Notify(_) => {}
        }
    }
}

enum Phase {
    Arming { early: Option<bool> },
    Armed,
}

pub(crate) struct Token {
    pub id: TokenId,
    pub state: Arc<ExecutionState>,
    pub steps: VecDeque<Step>,
    cleanup: Option<Cleanup>,
    deadline: Option<Instant>,
    created: Instant,
    position: Option<SourcePosition>,
    phase: Phase,
}

impl Token {
    /// Drop the token unresumed: cleanup callback first, then the teardown
    /// owned by each queued step.
    pub(crate) fn discard(mut self) {
        if let Some(cleanup) = self.cleanup.take() {
            cleanup(self.id);
        }
        for step in self.steps.drain(..) {
            step.abandon();
        }
    }
}

/// Outcome of asking to resume a token.
pub(crate) enum Resume {
    Unknown,
    Deferred,
    Ready(Token),
}

/// Summary for hosts asking whether suspended work is outstanding.
#[derive(Debug, Clone, PartialEq)]
pub struct TokenStatus {
    pub active: usize,
    pub tokens: Vec<TokenInfo>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TokenInfo {
    pub id: TokenId,
    pub fiber: FiberId,
    pub age: Duration,
    pub pending_steps: usize,
    pub deadline: Option<Instant>,
    pub position: Option<SourcePosition>,
    pub armed: bool,
}

// ── TokenTable ────────────────────────────────────────────────────────────────

#[derive(Default)]
pub struct TokenTable {
    tokens: RwLock<HashMap<TokenId, Token>>,
    next_seq: AtomicU64,
}

impl fmt::Debug for TokenTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TokenTable").field("active", &self.len()).finish()
    }
}

impl TokenTable {
    /// Register a new, still arming, token bound to `state`.
    pub(crate) fn request(
        &self,
        state: Arc<ExecutionState>,
        cleanup: Option<Cleanup>,
        timeout: Option<Duration>,
        position: Option<SourcePosition>,
    ) -> TokenId {
        let id = TokenId {
            fiber: state.fiber_id(),
            seq: self.next_seq.fetch_add(1, Ordering::Relaxed) + 1,
        };
        let now = Instant::now();
        let token = Token {
            id,
            state,
            steps: VecDeque::new(),
            cleanup,
            deadline: timeout.map(|t| now + t),
            created: now,
            position,
            phase: Phase::Arming { early: None },
        };
        write(&self.tokens).insert(id, token);
        tracing::debug!(%id, "token requested");
        id
    }

    /// Queue a step at the end of a token's work.  Hands the step back if
    /// the token no longer exists.
    pub(crate) fn push_step(&self, id: TokenId, step: Step) -> Result<(), Step> {
        match write(&self.tokens).get_mut(&id) {
            Some(token) => {
                token.steps.push_back(step);
                Ok(())
            }
            None => Err(step),
        }
    }

    /// Move the unfinished steps of a resumed token onto a new one.
    pub(crate) fn append_steps(
        &self,
        id: TokenId,
        mut steps: VecDeque<Step>,
    ) -> Result<(), VecDeque<Step>> {
        match write(&self.tokens).get_mut(&id) {
            Some(token) => {
                token.steps.append(&mut steps);
                Ok(())
            }
            None => Err(steps),
        }
    }

    /// Finish queueing.  If a resume already arrived, the token is removed
    /// and returned together with the status it was resumed with.
    pub(crate) fn arm(&self, id: TokenId) -> Option<(Token, bool)> {
        let mut tokens = write(&self.tokens);
        let token = tokens.get_mut(&id)?;
        let early = match token.phase {
            Phase::Armed => return None,
            Phase::Arming { early } => early,
        };
        match early {
            Some(status) => tokens.remove(&id).map(|t| (t, status)),
            None => {
                token.phase = Phase::Armed;
                None
            }
        }
    }

    pub(crate) fn take_for_resume(&self, id: TokenId, status: bool) -> Resume {
        let mut tokens = write(&self.tokens);
        let Some(token) = tokens.get_mut(&id) else {
            return Resume::Unknown;
        };
        match token.phase {
            Phase::Armed => tokens.remove(&id).map_or(Resume::Unknown, Resume::Ready),
            Phase::Arming { early: Some(_) } => Resume::Unknown,
            Phase::Arming { early: None } => {
                token.phase = Phase::Arming {
                    early: Some(status),
                };
                Resume::Deferred
            }
        }
    }

    /// Remove a token regardless of phase.
    pub(crate) fn take(&self, id: TokenId) -> Option<Token> {
        write(&self.tokens).remove(&id)
    }

    /// Remove every armed token whose deadline is at or before `now`.
    pub(crate) fn take_expired(&self, now: Instant) -> Vec<Token> {
        let mut tokens = write(&self.tokens);
        let expired: Vec<TokenId> = tokens
            .values()
            .filter(|t| matches!(t.phase, Phase::Armed) && t.deadline.is_some_and(|d| d <= now))
            .map(|t| t.id)
            .collect();
        expired.iter().filter_map(|id| tokens.remove(id)).collect()
    }

    /// Earliest deadline among armed tokens, for `sleep_until`.
    pub fn next_deadline(&self) -> Option<Instant> {
        read(&self.tokens)
            .values()
            .filter(|t| matches!(t.phase, Phase::Armed))
            .filter_map(|t| t.deadline)
            .min()
    }

    pub fn status(&self) -> TokenStatus {
        let now = Instant::now();
        let tokens = read(&self.tokens);
        let mut infos: Vec<TokenInfo> = tokens
            .values()
            .map(|t| TokenInfo {
                id: t.id,
                fiber: t.state.fiber_id(),
                age: now.saturating_duration_since(t.created),
                pending_steps: t.steps.len(),
                deadline: t.deadline,
                position: t.position.clone(),
                armed: matches!(t.phase, Phase::Armed),
            })
            .collect();
        infos.sort_by_key(|i| i.id);
        TokenStatus {
            active: infos.len(),
            tokens: infos,
        }
    }

    pub fn contains(&self, id: TokenId) -> bool {
        read(&self.tokens).contains_key(&id)
    }

    pub fn len(&self) -> usize {
        read(&self.tokens).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
