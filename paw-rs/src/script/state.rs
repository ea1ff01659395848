//! Per-activation execution state.
//!
//! An [`ExecutionState`] is what one running script, macro call or fiber
//! works against: its variables, its current result, its module environment
//! and the set of object claims it owns.  Every marker bound to a variable
//! or held as the result is backed by a claim recorded here, so tearing the
//! state down gives back exactly what it took.
//!
//! States are shared as `Arc<ExecutionState>` because a suspended state is
//! parked in a token and picked up later by whichever thread resumes it.
//! Only one activity runs against a state at a time; the interior locks
//! exist for that handoff, not for concurrent mutation.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::sync::{lock, read, write};

use super::fiber::{Bubble, FiberId};
use super::macros::{Macro, MacroContext};
use super::module::{ModuleEnv, ModuleItem};
use super::store::{scan_markers, ObjectId, ObjectStore, ObjectValue};
use super::value::Value;

pub struct ExecutionState {
    store: Arc<ObjectStore>,
    fiber_id: FiberId,
    inner: Mutex<StateInner>,
    module: RwLock<ModuleEnv>,
}

struct StateInner {
    variables: HashMap<String, Value>,
    result: Option<Value>,
    last_status: bool,
    /// Object id → number of claims this state holds on it.
    owned: HashMap<ObjectId, usize>,
    macro_context: Option<Arc<MacroContext>>,
    bubbles: BTreeMap<String, Vec<Bubble>>,
}

impl StateInner {
    fn new() -> Self {
        Self {
            variables: HashMap::new(),
            result: None,
            last_status: true,
            owned: HashMap::new(),
            macro_context: None,
            bubbles: BTreeMap::new(),
        }
    }
}

impl fmt::Debug for ExecutionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = lock(&self.inner);
        f.debug_struct("ExecutionState")
            .field("fiber_id", &self.fiber_id)
            .field("variables", &inner.variables.len())
            .field("owned", &inner.owned.len())
            .field("has_result", &inner.result.is_some())
            .finish()
    }
}

impl ExecutionState {
    /// A fresh top-level state.
    pub fn new(store: Arc<ObjectStore>, fiber_id: FiberId) -> Arc<Self> {
        Self::with_module(store, fiber_id, ModuleEnv::default())
    }

    pub fn with_module(store: Arc<ObjectStore>, fiber_id: FiberId, module: ModuleEnv) -> Arc<Self> {
        Arc::new(Self {
            store,
            fiber_id,
            inner: Mutex::new(StateInner::new()),
            module: RwLock::new(module),
        })
    }

    /// A state for an activation started from `parent`: fresh variables,
    /// a copy of the parent's visible macros and library.
    pub fn new_child(parent: &ExecutionState) -> Arc<Self> {
        let module = read(&parent.module).child();
        Self::with_module(Arc::clone(&parent.store), parent.fiber_id, module)
    }

    pub fn fiber_id(&self) -> FiberId {
        self.fiber_id
    }

    pub fn store(&self) -> &Arc<ObjectStore> {
        &self.store
    }

    // ── Variables ─────────────────────────────────────────────────────────────

    /// Bind a variable.  Markers in the new value are claimed before the
    /// old value's markers are released, so rebinding to the same object
    /// never evicts it in between.
    pub fn set_variable(&self, name: &str, value: Value) {
        for id in scan_markers(&value) {
            self.claim(id);
        }
        let old = lock(&self.inner).variables.insert(name.to_owned(), value);
        if let Some(old) = old {
            self.release_markers(&old);
        }
    }

    pub fn variable(&self, name: &str) -> Option<Value> {
        lock(&self.inner).variables.get(name).cloned()
    }

    pub fn has_variable(&self, name: &str) -> bool {
        lock(&self.inner).variables.contains_key(name)
    }

    /// Unbind a variable, releasing its markers.  Returns whether it existed.
    pub fn delete_variable(&self, name: &str) -> bool {
        let old = lock(&self.inner).variables.remove(name);
        match old {
            Some(old) => {
                self.release_markers(&old);
                true
            }
            None => false,
        }
    }

    pub fn variable_names(&self) -> Vec<String> {
        let mut names: Vec<String> = lock(&self.inner).variables.keys().cloned().collect();
        names.sort();
        names
    }

    // ── Result and status ─────────────────────────────────────────────────────

    /// Replace the result, claiming its markers.  The bare symbol
    /// `undefined` clears the result instead.
    pub fn set_result(&self, value: Value) {
        if matches!(&value, Value::Symbol(s) if s == "undefined") {
            self.clear_result();
            return;
        }
        for id in scan_markers(&value) {
            self.claim(id);
        }
        let old = lock(&self.inner).result.replace(value);
        if let Some(old) = old {
            self.release_markers(&old);
        }
    }

    pub fn result(&self) -> Option<Value> {
        lock(&self.inner).result.clone()
    }

    pub fn has_result(&self) -> bool {
        lock(&self.inner).result.is_some()
    }

    pub fn clear_result(&self) {
        let old = lock(&self.inner).result.take();
        if let Some(old) = old {
            self.release_markers(&old);
        }
    }

    pub fn last_status(&self) -> bool {
        lock(&self.inner).last_status
    }

    pub fn set_last_status(&self, status: bool) {
        lock(&self.inner).last_status = status;
    }

    // ── Ownership ─────────────────────────────────────────────────────────────

    /// Put an object in the store; this state holds the creator's claim.
    pub fn store_object(&self, value: ObjectValue) -> ObjectId {
        let id = self.store.store(value);
        *lock(&self.inner).owned.entry(id).or_insert(0) += 1;
        id
    }

    /// Claim an object on behalf of this state.  Fails for ids that are not
    /// (or no longer) in the store.
    pub fn claim(&self, id: ObjectId) -> bool {
        match self.store.claim(id) {
            Ok(_) => {
                *lock(&self.inner).owned.entry(id).or_insert(0) += 1;
                true
            }
            Err(e) => {
                tracing::debug!(fiber = self.fiber_id, "claim skipped: {e}");
                false
            }
        }
    }

    /// Give back one claim.  Releasing a live object this state never
    /// claimed is a bookkeeping defect and is reported as such.
    pub fn release(&self, id: ObjectId) {
        let held = {
            let mut inner = lock(&self.inner);
            match inner.owned.get_mut(&id) {
                Some(n) => {
                    *n -= 1;
                    if *n == 0 {
                        inner.owned.remove(&id);
                    }
                    true
                }
                None => false,
            }
        };
        if !held {
            if self.store.contains(id) {
                tracing::error!(%id, fiber = self.fiber_id, "release without a matching claim");
                debug_assert!(false, "unbalanced release of object {id}");
            }
            return;
        }
        if let Err(e) = self.store.release(id) {
            tracing::debug!(%id, "{e}");
        }
    }

    /// Claims this state holds on `id`.
    pub fn claims_on(&self, id: ObjectId) -> usize {
        lock(&self.inner).owned.get(&id).copied().unwrap_or(0)
    }

    /// Total claims held.
    pub fn claim_count(&self) -> usize {
        lock(&self.inner).owned.values().sum()
    }

    fn release_markers(&self, value: &Value) {
        for id in scan_markers(value) {
            self.release(id);
        }
    }

    /// Unbind every variable, releasing each binding's markers.
    pub fn release_variables(&self) {
        let vars: Vec<Value> = lock(&self.inner).variables.drain().map(|(_, v)| v).collect();
        for value in &vars {
            self.release_markers(value);
        }
    }

    /// Tear down: drop variables, the result and pending bubbles, and give
    /// back every claim still held.  Safe to call more than once.
    pub fn release_all_references(&self) {
        let (claims, bubbles) = {
            let mut inner = lock(&self.inner);
            inner.variables.clear();
            inner.result = None;
            (
                std::mem::take(&mut inner.owned),
                std::mem::take(&mut inner.bubbles),
            )
        };
        release_claims(&self.store, claims, bubbles);
    }

    /// Remove all claims without releasing them, for handing them to a new
    /// owner.  Bindings that relied on them are dropped.
    pub(crate) fn detach_claims(&self) -> HashMap<ObjectId, usize> {
        let mut inner = lock(&self.inner);
        inner.variables.clear();
        inner.result = None;
        std::mem::take(&mut inner.owned)
    }

    // ── Macro context ─────────────────────────────────────────────────────────

    pub fn macro_context(&self) -> Option<Arc<MacroContext>> {
        lock(&self.inner).macro_context.clone()
    }

    pub fn set_macro_context(&self, ctx: Arc<MacroContext>) {
        lock(&self.inner).macro_context = Some(ctx);
    }

    // ── Module environment ────────────────────────────────────────────────────

    pub fn module(&self) -> RwLockReadGuard<'_, ModuleEnv> {
        read(&self.module)
    }

    pub fn module_mut(&self) -> RwLockWriteGuard<'_, ModuleEnv> {
        write(&self.module)
    }

    pub fn define_macro(&self, name: &str, mac: Arc<Macro>) {
        self.module_mut().macros.insert(name.to_owned(), mac);
    }

    pub fn lookup_macro(&self, name: &str) -> Option<Arc<Macro>> {
        self.module().lookup_macro(name)
    }

    pub fn delete_macro(&self, name: &str) -> bool {
        self.module_mut().macros.remove(name).is_some()
    }

    pub fn macro_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.module().macros.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn export(&self, name: &str, item: ModuleItem) -> bool {
        self.module_mut().export(name, item)
    }

    pub fn inherited_item(&self, module: &str, name: &str) -> Option<ModuleItem> {
        self.module().inherited_item(module, name).cloned()
    }

    // ── Bubbles ───────────────────────────────────────────────────────────────

    /// Queue an event payload.  The bubble takes its own claims on the
    /// markers inside `content`.
    pub fn add_bubble(&self, flavor: &str, content: Value) {
        let refs = scan_markers(&content)
            .into_iter()
            .filter(|id| self.store.claim(*id).is_ok())
            .collect();
        let bubble = Bubble {
            flavor: flavor.to_owned(),
            content,
            refs,
            fiber: self.fiber_id,
        };
        lock(&self.inner)
            .bubbles
            .entry(flavor.to_owned())
            .or_default()
            .push(bubble);
    }

    /// Adopt bubbles from another owner, claims included.
    pub fn push_bubbles(&self, bubbles: BTreeMap<String, Vec<Bubble>>) {
        let mut inner = lock(&self.inner);
        for (flavor, list) in bubbles {
            inner.bubbles.entry(flavor).or_default().extend(list);
        }
    }

    /// Remove and return every pending bubble, claims included.
    pub fn take_bubbles(&self) -> BTreeMap<String, Vec<Bubble>> {
        std::mem::take(&mut lock(&self.inner).bubbles)
    }

    /// Snapshot of pending bubbles; the copies own nothing.
    pub fn bubbles(&self) -> BTreeMap<String, Vec<Bubble>> {
        lock(&self.inner).bubbles.clone()
    }
}

impl Drop for ExecutionState {
    fn drop(&mut self) {
        let inner = self.inner.get_mut().unwrap_or_else(PoisonError::into_inner);
        if inner.owned.is_empty() && inner.bubbles.is_empty() {
            return;
        }
        tracing::debug!(
            fiber = self.fiber_id,
            claims = inner.owned.values().sum::<usize>(),
            "state dropped while holding claims"
        );
        let claims = std::mem::take(&mut inner.owned);
        let bubbles = std::mem::take(&mut inner.bubbles);
        release_claims(&self.store, claims, bubbles);
    }
}

fn release_claims(
    store: &ObjectStore,
    claims: HashMap<ObjectId, usize>,
    bubbles: BTreeMap<String, Vec<Bubble>>,
) {
    let owned = claims
        .into_iter()
        .flat_map(|(id, n)| std::iter::repeat(id).take(n));
    store.release_all(owned);
    for bubble in bubbles.into_values().flatten() {
        store.release_all(bubble.refs);
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::script::store::{marker_value, ObjectKind, StoredList};

    fn root() -> (Arc<ObjectStore>, Arc<ExecutionState>) {
        let store = Arc::new(ObjectStore::new());
        let state = ExecutionState::new(Arc::clone(&store), 0);
        (store, state)
    }

    fn new_list(state: &ExecutionState) -> ObjectId {
        state.store_object(ObjectValue::List(Arc::new(StoredList::default())))
    }

    #[test]
    fn bindings_track_claims() {
        let (store, state) = root();
        let id = new_list(&state);
        state.set_variable("a", marker_value(ObjectKind::List, id));
        state.set_variable("b", marker_value(ObjectKind::List, id));
        assert_eq!(store.ref_count(id), Some(3));
        assert_eq!(state.claims_on(id), 3);

        state.set_variable("a", Value::Int(1));
        assert_eq!(store.ref_count(id), Some(2));
        assert!(state.delete_variable("b"));
        assert!(!state.delete_variable("b"));
        assert_eq!(store.ref_count(id), Some(1));

        state.release_all_references();
        assert!(store.is_empty());
        assert_eq!(state.claim_count(), 0);
    }

    #[test]
    fn rebinding_same_object_keeps_it_alive() {
        let (store, state) = root();
        let id = new_list(&state);
        let m = marker_value(ObjectKind::List, id);
        state.set_variable("a", m.clone());
        state.release(id);
        state.set_variable("a", m);
        assert_eq!(store.ref_count(id), Some(1));
    }

    #[test]
    fn result_claims_and_clears() {
        let (store, state) = root();
        let id = new_list(&state);
        state.set_result(marker_value(ObjectKind::List, id));
        assert_eq!(store.ref_count(id), Some(2));
        state.set_result(Value::Symbol("undefined".into()));
        assert!(!state.has_result());
        assert_eq!(store.ref_count(id), Some(1));
    }

    #[test]
    fn stale_markers_are_ignored() {
        let (store, state) = root();
        let id = new_list(&state);
        state.release(id);
        assert!(store.is_empty());
        state.set_variable("x", marker_value(ObjectKind::List, id));
        state.delete_variable("x");
        assert_eq!(state.claim_count(), 0);
    }

    #[test]
    fn drop_releases_leftovers() {
        let (store, state) = root();
        let id = new_list(&state);
        state.set_variable("keep", marker_value(ObjectKind::List, id));
        drop(state);
        assert!(!store.contains(id));
    }

    #[test]
    fn bubbles_hold_their_own_claims() {
        let (store, state) = root();
        let id = new_list(&state);
        state.add_bubble("event", marker_value(ObjectKind::List, id));
        state.release(id);
        assert_eq!(store.ref_count(id), Some(1));

        let taken = state.take_bubbles();
        assert_eq!(taken["event"][0].refs, vec![id]);
        let other = ExecutionState::new(Arc::clone(&store), 0);
        other.push_bubbles(taken);
        other.release_all_references();
        assert!(store.is_empty());
    }

    #[test]
    fn child_starts_empty_with_copied_macros() {
        let (_store, parent) = root();
        parent.set_variable("x", Value::Int(1));
        parent.define_macro("m", Arc::new(Macro::new(Some("m"), "true", Default::default())));
        let child = ExecutionState::new_child(&parent);
        assert!(child.variable("x").is_none());
        assert!(child.lookup_macro("m").is_some());
        child.delete_macro("m");
        assert!(parent.lookup_macro("m").is_some());
    }
}
