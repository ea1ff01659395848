//! Reference-counted object store.
//!
//! Composite values live here under integer ids.  Scripts never hold them
//! directly: they hold *markers* (`\x00LIST:7\x00`) embedded in ordinary
//! values.  Every binding of a marker is backed by one claim, and an object
//! is evicted, with type-specific teardown, the moment its last claim is
//! released.
//!
//! The store itself does not know who holds a claim.  Ownership is tracked
//! by [`ExecutionState`](super::state::ExecutionState), which records each
//! claim it takes and gives them all back when it is torn down.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, LazyLock, Mutex, RwLock};

use regex::Regex;

use crate::error::StoreError;
use crate::sync::{lock, read, write};

use super::fiber::FiberHandle;
use super::macros::Macro;
use super::value::Value;

// ── Ids and markers ───────────────────────────────────────────────────────────

/// Store address.  Ids start at 1 and are never reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectId(pub usize);

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ObjectKind {
    List,
    Str,
    Bytes,
    Channel,
    Macro,
    Fiber,
}

impl ObjectKind {
    /// Tag used inside markers.
    pub fn tag(self) -> &'static str {
        match self {
            ObjectKind::List => "LIST",
            ObjectKind::Str => "STR",
            ObjectKind::Bytes => "BYTES",
            ObjectKind::Channel => "CHANNEL",
            ObjectKind::Macro => "MACRO",
            ObjectKind::Fiber => "FIBER",
        }
    }

    fn from_tag(tag: &str) -> Option<Self> {
        Some(match tag {
            "LIST" => ObjectKind::List,
            "STR" => ObjectKind::Str,
            "BYTES" => ObjectKind::Bytes,
            "CHANNEL" => ObjectKind::Channel,
            "MACRO" => ObjectKind::Macro,
            "FIBER" => ObjectKind::Fiber,
            _ => return None,
        })
    }
}

static MARKER_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\x00(LIST|STR|BYTES|CHANNEL|MACRO|FIBER):(\d+)\x00")
        .expect("marker pattern is a valid regex")
});

/// Marker text for an object.
pub fn marker(kind: ObjectKind, id: ObjectId) -> String {
    format!("\x00{}:{}\x00", kind.tag(), id.0)
}

/// A value consisting of exactly one marker.
pub fn marker_value(kind: ObjectKind, id: ObjectId) -> Value {
    Value::Symbol(marker(kind, id))
}

/// If the whole value is a single marker, return what it refers to.
pub fn parse_marker(value: &Value) -> Option<(ObjectKind, ObjectId)> {
    let text = match value {
        Value::Str(s) | Value::Symbol(s) => s,
        _ => return None,
    };
    let caps = MARKER_RE.captures(text)?;
    let whole = caps.get(0)?;
    if whole.start() != 0 || whole.end() != text.len() {
        return None;
    }
    let kind = ObjectKind::from_tag(caps.get(1)?.as_str())?;
    let id = caps.get(2)?.as_str().parse().ok()?;
    Some((kind, ObjectId(id)))
}

/// Every object id referenced by markers anywhere inside the value.  An id
/// appears once per occurrence.
pub fn scan_markers(value: &Value) -> Vec<ObjectId> {
    let text = match value {
        Value::Str(s) | Value::Symbol(s) => s,
        _ => return Vec::new(),
    };
    if !text.contains('\0') {
        return Vec::new();
    }
    MARKER_RE
        .captures_iter(text)
        .filter_map(|c| c.get(2)?.as_str().parse().ok().map(ObjectId))
        .collect()
}

// ── Object payloads ───────────────────────────────────────────────────────────

/// A list object.  The list holds its own claim on every marker among its
/// items, released when the list is evicted.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StoredList {
    pub items: Vec<Value>,
    pub named: BTreeMap<String, Value>,
}

impl StoredList {
    pub fn new(items: Vec<Value>, named: BTreeMap<String, Value>) -> Self {
        Self { items, named }
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    fn nested_refs(&self) -> Vec<ObjectId> {
        self.items
            .iter()
            .chain(self.named.values())
            .flat_map(scan_markers)
            .collect()
    }
}

/// An unbounded FIFO shared between activities.
#[derive(Debug, Default)]
pub struct Channel {
    inner: Mutex<ChannelInner>,
    ready: Condvar,
}

#[derive(Debug, Default)]
struct ChannelInner {
    queue: VecDeque<Value>,
    closed: bool,
}

impl Channel {
    /// Queue a value.  Once closed the value is handed back.
    pub fn send(&self, value: Value) -> Result<(), Value> {
        let mut inner = lock(&self.inner);
        if inner.closed {
            return Err(value);
        }
        inner.queue.push_back(value);
        self.ready.notify_one();
        Ok(())
    }

    /// Block until a value arrives.  `None` once closed and drained.
    pub fn recv(&self) -> Option<Value> {
        let mut inner = lock(&self.inner);
        loop {
            if let Some(v) = inner.queue.pop_front() {
                return Some(v);
            }
            if inner.closed {
                return None;
            }
            inner = self
                .ready
                .wait(inner)
                .unwrap_or_else(std::sync::PoisonError::into_inner);
        }
    }

    pub fn try_recv(&self) -> Option<Value> {
        lock(&self.inner).queue.pop_front()
    }

    /// Close and hand back whatever was still queued.
    pub fn close(&self) -> Vec<Value> {
        let mut inner = lock(&self.inner);
        inner.closed = true;
        self.ready.notify_all();
        inner.queue.drain(..).collect()
    }

    pub fn is_closed(&self) -> bool {
        lock(&self.inner).closed
    }

    pub fn len(&self) -> usize {
        lock(&self.inner).queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// What a store slot holds.  Cloning is cheap.
#[derive(Debug, Clone)]
pub enum ObjectValue {
    List(Arc<StoredList>),
    Str(Arc<str>),
    Bytes(Arc<[u8]>),
    Channel(Arc<Channel>),
    Macro(Arc<Macro>),
    Fiber(Arc<FiberHandle>),
}

impl ObjectValue {
    pub fn kind(&self) -> ObjectKind {
        match self {
            ObjectValue::List(_) => ObjectKind::List,
            ObjectValue::Str(_) => ObjectKind::Str,
            ObjectValue::Bytes(_) => ObjectKind::Bytes,
            ObjectValue::Channel(_) => ObjectKind::Channel,
            ObjectValue::Macro(_) => ObjectKind::Macro,
            ObjectValue::Fiber(_) => ObjectKind::Fiber,
        }
    }
}

#[derive(Debug)]
struct StoredObject {
    value: ObjectValue,
    ref_count: usize,
}

// ── ObjectStore ───────────────────────────────────────────────────────────────

/// The global object heap shared by every activation of one executor.
#[derive(Debug, Default)]
pub struct ObjectStore {
    objects: RwLock<HashMap<ObjectId, StoredObject>>,
    next_id: AtomicUsize,
}

impl ObjectStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert an object.  The caller holds the first claim on it.
    pub fn store(&self, value: ObjectValue) -> ObjectId {
        if let ObjectValue::List(list) = &value {
            for nested in list.nested_refs() {
                if self.claim(nested).is_err() {
                    tracing::debug!(%nested, "list item refers to an evicted object");
                }
            }
        }
        let id = ObjectId(self.next_id.fetch_add(1, Ordering::Relaxed) + 1);
        let kind = value.kind();
        write(&self.objects).insert(id, StoredObject { value, ref_count: 1 });
        tracing::debug!(%id, kind = kind.tag(), "stored object");
        id
    }

    /// Add a claim.  Returns the new count.
    pub fn claim(&self, id: ObjectId) -> Result<usize, StoreError> {
        let mut objects = write(&self.objects);
        let obj = objects.get_mut(&id).ok_or(StoreError::UnknownObject(id))?;
        obj.ref_count += 1;
        tracing::trace!(%id, refs = obj.ref_count, "claim");
        Ok(obj.ref_count)
    }

    /// Drop a claim.  At zero the object is evicted and torn down; the
    /// teardown runs after the store lock is released.
    pub fn release(&self, id: ObjectId) -> Result<usize, StoreError> {
        let evicted = {
            let mut objects = write(&self.objects);
            let obj = objects.get_mut(&id).ok_or(StoreError::UnknownObject(id))?;
            obj.ref_count -= 1;
            tracing::trace!(%id, refs = obj.ref_count, "release");
            if obj.ref_count > 0 {
                return Ok(obj.ref_count);
            }
            objects.remove(&id)
        };
        if let Some(obj) = evicted {
            tracing::debug!(%id, kind = obj.value.kind().tag(), "evicted object");
            self.teardown(obj.value);
        }
        Ok(0)
    }

    fn teardown(&self, value: ObjectValue) {
        match value {
            ObjectValue::List(list) => self.release_all(list.nested_refs()),
            ObjectValue::Channel(channel) => {
                let pending = channel.close();
                self.release_all(pending.iter().flat_map(scan_markers));
            }
            ObjectValue::Fiber(handle) => handle.abandon(),
            ObjectValue::Str(_) | ObjectValue::Bytes(_) | ObjectValue::Macro(_) => {}
        }
    }

    /// Release a batch of claims, ignoring ids that are already gone.
    pub(crate) fn release_all(&self, ids: impl IntoIterator<Item = ObjectId>) {
        for id in ids {
            if let Err(e) = self.release(id) {
                tracing::debug!(%id, "{e}");
            }
        }
    }

    pub fn get(&self, id: ObjectId) -> Option<ObjectValue> {
        read(&self.objects).get(&id).map(|o| o.value.clone())
    }

    pub fn ref_count(&self, id: ObjectId) -> Option<usize> {
        read(&self.objects).get(&id).map(|o| o.ref_count)
    }

    pub fn kind(&self, id: ObjectId) -> Option<ObjectKind> {
        read(&self.objects).get(&id).map(|o| o.value.kind())
    }

    pub fn contains(&self, id: ObjectId) -> bool {
        read(&self.objects).contains_key(&id)
    }

    /// Number of live objects.
    pub fn len(&self) -> usize {
        read(&self.objects).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn list(&self, id: ObjectId) -> Option<Arc<StoredList>> {
        match self.get(id)? {
            ObjectValue::List(l) => Some(l),
            _ => None,
        }
    }

    pub fn channel(&self, id: ObjectId) -> Option<Arc<Channel>> {
        match self.get(id)? {
            ObjectValue::Channel(c) => Some(c),
            _ => None,
        }
    }

    pub fn macro_object(&self, id: ObjectId) -> Option<Arc<Macro>> {
        match self.get(id)? {
            ObjectValue::Macro(m) => Some(m),
            _ => None,
        }
    }

    pub fn fiber(&self, id: ObjectId) -> Option<Arc<FiberHandle>> {
        match self.get(id)? {
            ObjectValue::Fiber(f) => Some(f),
            _ => None,
        }
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn list(items: Vec<Value>) -> ObjectValue {
        ObjectValue::List(Arc::new(StoredList::new(items, BTreeMap::new())))
    }

    #[test]
    fn evicted_when_claims_balance() {
        let store = ObjectStore::new();
        let id = store.store(ObjectValue::Str("x".into()));
        assert_eq!(store.ref_count(id), Some(1));
        assert_eq!(store.claim(id), Ok(2));
        assert_eq!(store.release(id), Ok(1));
        assert!(store.contains(id));
        assert_eq!(store.release(id), Ok(0));
        assert!(!store.contains(id));
        assert_eq!(store.release(id), Err(StoreError::UnknownObject(id)));
        assert_eq!(store.claim(id), Err(StoreError::UnknownObject(id)));
    }

    #[test]
    fn ids_are_not_reused() {
        let store = ObjectStore::new();
        let a = store.store(ObjectValue::Str("a".into()));
        store.release(a).unwrap();
        let b = store.store(ObjectValue::Str("b".into()));
        assert_ne!(a, b);
    }

    #[test]
    fn list_teardown_releases_items() {
        let store = ObjectStore::new();
        let inner = store.store(list(vec![Value::Int(1)]));
        let outer = store.store(list(vec![marker_value(ObjectKind::List, inner), Value::Int(2)]));
        assert_eq!(store.ref_count(inner), Some(2));
        store.release(inner).unwrap();
        assert!(store.contains(inner));
        store.release(outer).unwrap();
        assert!(!store.contains(inner));
        assert!(store.is_empty());
    }

    #[test]
    fn channel_closed_on_eviction() {
        let store = ObjectStore::new();
        let held = store.store(ObjectValue::Str("payload".into()));
        let chan = Arc::new(Channel::default());
        chan.send(marker_value(ObjectKind::Str, held)).unwrap();
        let id = store.store(ObjectValue::Channel(Arc::clone(&chan)));
        store.release(id).unwrap();
        assert!(chan.is_closed());
        assert!(chan.send(Value::Int(1)).is_err());
        // the queued marker's claim went with the channel
        assert!(!store.contains(held));
    }

    #[test]
    fn channel_recv_after_close_drains() {
        let chan = Channel::default();
        chan.send(Value::Int(1)).unwrap();
        assert_eq!(chan.recv(), Some(Value::Int(1)));
        assert!(chan.close().is_empty());
        assert_eq!(chan.recv(), None);
    }

    #[test]
    fn marker_parsing() {
        let m = marker_value(ObjectKind::List, ObjectId(12));
        assert_eq!(parse_marker(&m), Some((ObjectKind::List, ObjectId(12))));
        assert_eq!(parse_marker(&Value::Str("x\x00LIST:1\x00".into())), None);
        assert_eq!(parse_marker(&Value::Int(1)), None);

        let text = format!("{} and {}", marker(ObjectKind::Str, ObjectId(3)), marker(ObjectKind::Fiber, ObjectId(4)));
        assert_eq!(scan_markers(&Value::Str(text)), vec![ObjectId(3), ObjectId(4)]);
        assert!(scan_markers(&Value::Block("\x00LIST:1\x00".into())).is_empty());
    }
}
