//! Fibers and orphaned bubbles.
//!
//! A fiber is a macro activation running on its own OS thread, sharing the
//! executor's object store with whoever spawned it.  Fiber 0 is the root
//! activation; spawned fibers are numbered from 1.
//!
//! Each fiber reports into a private *holder* state: when the body returns,
//! its result (with a claim) and any bubbles it queued move into the
//! holder, where they wait for a consumer (`fiber_wait`).  If the fiber
//! handle is abandoned, that is, its store object is evicted, everything
//! still in the holder is transferred to the executor's [`OrphanTable`]
//! instead of being released.  Nothing a fiber leaves behind is dropped
//! silently.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Arc, Condvar, Mutex, PoisonError, RwLock};
use std::time::Duration;

use crate::sync::{lock, read, write};

use super::state::ExecutionState;
use super::store::{ObjectId, ObjectStore};
use super::token::TokenId;
use super::value::Value;

pub type FiberId = usize;

/// Fiber id of the root activation.
pub const ROOT_FIBER: FiberId = 0;

/// Flavor under which an abandoned fiber's leftover result is parked.
pub const RESULT_FLAVOR: &str = "result";

// ── Bubbles ───────────────────────────────────────────────────────────────────

/// An event payload queued by an activation for some later consumer.
///
/// `refs` are claims owned by the bubble itself.  A bubble obtained from a
/// snapshot is a copy and owns nothing.
#[derive(Debug, Clone, PartialEq)]
pub struct Bubble {
    /// Opaque, caller-defined category.
    pub flavor: String,
    pub content: Value,
    pub refs: Vec<ObjectId>,
    /// Fiber that produced it.
    pub fiber: FiberId,
}

impl Bubble {
    /// Give back the bubble's claims.
    pub fn release(self, store: &ObjectStore) {
        store.release_all(self.refs);
    }
}

/// Bubbles abandoned by terminated fibers, keyed by flavor.
#[derive(Debug, Default)]
pub struct OrphanTable {
    bubbles: RwLock<BTreeMap<String, Vec<Bubble>>>,
}

impl OrphanTable {
    /// Take ownership of `bubbles`, appending per flavor.
    pub fn add(&self, bubbles: BTreeMap<String, Vec<Bubble>>) {
        let mut table = write(&self.bubbles);
        for (flavor, list) in bubbles {
            tracing::debug!(%flavor, count = list.len(), "orphaned bubbles");
            table.entry(flavor).or_default().extend(list);
        }
    }

    /// Copy of the table.  The table is left as is.
    pub fn snapshot(&self) -> BTreeMap<String, Vec<Bubble>> {
        read(&self.bubbles).clone()
    }

    /// Empty the table, handing the bubbles (and their claims) to the caller.
    pub fn take(&self) -> BTreeMap<String, Vec<Bubble>> {
        std::mem::take(&mut *write(&self.bubbles))
    }

    /// Number of bubbles across all flavors.
    pub fn len(&self) -> usize {
        read(&self.bubbles).values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

// ── FiberHandle ───────────────────────────────────────────────────────────────

/// Shared view of one running or finished fiber.
pub struct FiberHandle {
    id: FiberId,
    holder: Arc<ExecutionState>,
    orphans: Arc<OrphanTable>,
    inner: Mutex<FiberInner>,
    done: Condvar,
}

#[derive(Default)]
struct FiberInner {
    completed: bool,
    abandoned: bool,
    status: bool,
    result: Option<Value>,
    suspended_on: Option<TokenId>,
}

impl fmt::Debug for FiberHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = lock(&self.inner);
        f.debug_struct("FiberHandle")
            .field("id", &self.id)
            .field("completed", &inner.completed)
            .field("abandoned", &inner.abandoned)
            .field("suspended_on", &inner.suspended_on)
            .finish()
    }
}

impl FiberHandle {
    pub(crate) fn new(id: FiberId, holder: Arc<ExecutionState>, orphans: Arc<OrphanTable>) -> Self {
        Self {
            id,
            holder,
            orphans,
            inner: Mutex::new(FiberInner::default()),
            done: Condvar::new(),
        }
    }

    pub fn id(&self) -> FiberId {
        self.id
    }

    pub(crate) fn holder(&self) -> &Arc<ExecutionState> {
        &self.holder
    }

    pub fn is_complete(&self) -> bool {
        lock(&self.inner).completed
    }

    pub fn is_abandoned(&self) -> bool {
        lock(&self.inner).abandoned
    }

    /// Final status, or `None` while still running.
    pub fn status(&self) -> Option<bool> {
        let inner = lock(&self.inner);
        inner.completed.then_some(inner.status)
    }

    pub fn result(&self) -> Option<Value> {
        lock(&self.inner).result.clone()
    }

    /// Token the fiber is parked on, if any.
    pub fn suspended_on(&self) -> Option<TokenId> {
        lock(&self.inner).suspended_on
    }

    pub(crate) fn set_suspended(&self, token: Option<TokenId>) {
        lock(&self.inner).suspended_on = token;
    }

    /// Block until the fiber finishes and return its status.
    pub fn join(&self) -> bool {
        let mut inner = lock(&self.inner);
        while !inner.completed {
            inner = self.done.wait(inner).unwrap_or_else(PoisonError::into_inner);
        }
        inner.status
    }

    /// Like [`join`](Self::join) but gives up after `timeout`.
    pub fn join_timeout(&self, timeout: Duration) -> Option<bool> {
        let inner = lock(&self.inner);
        let (inner, _) = self
            .done
            .wait_timeout_while(inner, timeout, |i| !i.completed)
            .unwrap_or_else(PoisonError::into_inner);
        inner.completed.then_some(inner.status)
    }

    /// Wait for the fiber, then move its result and bubbles into `waiter`.
    pub fn consume_into(&self, waiter: &ExecutionState) -> bool {
        let status = self.join();
        let result = lock(&self.inner).result.clone();
        if let Some(result) = result {
            waiter.set_result(result);
        }
        waiter.push_bubbles(self.holder.take_bubbles());
        self.holder.release_all_references();
        status
    }

    /// Record completion.  Leftovers go straight to the orphan table if the
    /// handle was already abandoned.
    pub(crate) fn finish(&self, status: bool) {
        let mut inner = lock(&self.inner);
        inner.completed = true;
        inner.status = status;
        inner.result = self.holder.result();
        inner.suspended_on = None;
        if inner.abandoned {
            self.orphan_leftovers(&inner);
        }
        self.done.notify_all();
    }

    /// Called when the fiber's store object is evicted: nobody can consume
    /// its output any more.
    pub(crate) fn abandon(&self) {
        let mut inner = lock(&self.inner);
        inner.abandoned = true;
        tracing::debug!(fiber = self.id, completed = inner.completed, "fiber abandoned");
        if inner.completed {
            self.orphan_leftovers(&inner);
        }
    }

    fn orphan_leftovers(&self, inner: &FiberInner) {
        let mut bubbles = self.holder.take_bubbles();
        let claims = self.holder.detach_claims();
        if !claims.is_empty() {
            let refs = claims
                .into_iter()
                .flat_map(|(id, n)| std::iter::repeat(id).take(n))
                .collect();
            bubbles
                .entry(RESULT_FLAVOR.to_owned())
                .or_default()
                .push(Bubble {
                    flavor: RESULT_FLAVOR.to_owned(),
                    content: inner.result.clone().unwrap_or_else(Value::undefined),
                    refs,
                    fiber: self.id,
                });
        }
        if !bubbles.is_empty() {
            self.orphans.add(bubbles);
        }
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::script::store::{marker_value, ObjectKind, ObjectValue, StoredList};

    fn setup() -> (Arc<ObjectStore>, Arc<OrphanTable>, FiberHandle) {
        let store = Arc::new(ObjectStore::new());
        let orphans = Arc::new(OrphanTable::default());
        let holder = ExecutionState::new(Arc::clone(&store), 1);
        let handle = FiberHandle::new(1, holder, Arc::clone(&orphans));
        (store, orphans, handle)
    }

    fn give_result(store: &ObjectStore, handle: &FiberHandle) -> ObjectId {
        let id = store.store(ObjectValue::List(Arc::new(StoredList::default())));
        handle.holder().set_result(marker_value(ObjectKind::List, id));
        store.release(id).unwrap();
        id
    }

    #[test]
    fn abandon_after_finish_orphans_result() {
        let (store, orphans, handle) = setup();
        let x = give_result(&store, &handle);
        handle.finish(true);
        assert!(orphans.is_empty());
        handle.abandon();
        let snap = orphans.snapshot();
        assert_eq!(snap[RESULT_FLAVOR][0].refs, vec![x]);
        assert_eq!(store.ref_count(x), Some(1));
        // a snapshot does not drain
        assert_eq!(orphans.len(), 1);
    }

    #[test]
    fn abandon_before_finish_orphans_on_completion() {
        let (store, orphans, handle) = setup();
        handle.abandon();
        handle.holder().add_bubble("log", Value::Str("done".into()));
        let x = give_result(&store, &handle);
        handle.finish(false);
        let taken = orphans.take();
        assert_eq!(taken["log"].len(), 1);
        assert_eq!(taken[RESULT_FLAVOR][0].refs, vec![x]);
        assert!(orphans.is_empty());
        for bubble in taken.into_values().flatten() {
            bubble.release(&store);
        }
        assert!(store.is_empty());
    }

    #[test]
    fn consumed_fiber_leaves_nothing_behind() {
        let (store, orphans, handle) = setup();
        let x = give_result(&store, &handle);
        handle.finish(true);
        let waiter = ExecutionState::new(Arc::clone(&store), 0);
        assert!(handle.consume_into(&waiter));
        assert_eq!(waiter.claims_on(x), 1);
        handle.abandon();
        assert!(orphans.is_empty());
        waiter.release_all_references();
        assert!(store.is_empty());
    }

    #[test]
    fn join_timeout_on_running_fiber() {
        let (_store, _orphans, handle) = setup();
        assert_eq!(handle.join_timeout(Duration::from_millis(5)), None);
        assert_eq!(handle.status(), None);
        handle.finish(true);
        assert_eq!(handle.join_timeout(Duration::from_millis(5)), Some(true));
    }
}
