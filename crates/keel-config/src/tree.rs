use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use keel_domain::TimestampMs;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::debug;

use crate::error::ConfigTreeError;
use crate::path::TopicPath;
use crate::persist::{Journal, TlogEntry, TlogOp};

// ── Nodes ─────────────────────────────────────────────────────────────────────

/// One node of the config tree. Interior nodes carry children ("topics"),
/// leaves carry a scalar value; both carry the modtime of their newest write.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct TopicNode {
    #[serde(default)]
    pub modtime: TimestampMs,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<Value>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub children: BTreeMap<String, TopicNode>,
}

impl TopicNode {
    /// Render the subtree as plain JSON, dropping modtimes. Interior nodes
    /// become objects; leaves become their value.
    pub fn render(&self) -> Value {
        if self.children.is_empty() {
            self.value.clone().unwrap_or(Value::Null)
        } else {
            Value::Object(
                self.children
                    .iter()
                    .map(|(k, v)| (k.clone(), v.render()))
                    .collect(),
            )
        }
    }
}

/// Read-only view of a single node, returned by [`ConfigTree::lookup`].
#[derive(Debug, Clone, PartialEq)]
pub struct NodeView {
    pub modtime: TimestampMs,
    pub value: Option<Value>,
    pub children: Vec<String>,
}

// ── Change events ─────────────────────────────────────────────────────────────

/// A committed mutation, delivered to subscribers on the dispatch task.
#[derive(Debug, Clone)]
pub struct ChangeEvent {
    pub path: TopicPath,
    /// `None` when the node (and its subtree) was removed.
    pub value: Option<Value>,
    pub ts: TimestampMs,
}

pub type ChangeHandler = Arc<dyn Fn(&ChangeEvent) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

struct Subscriber {
    id: SubscriptionId,
    prefix: TopicPath,
    handler: ChangeHandler,
}

// ── ConfigTree ────────────────────────────────────────────────────────────────

/// The process-global hierarchical key/value store.
///
/// Writers mutate under a single `RwLock`; committed changes are posted to
/// a channel feeding one dispatch task, so subscriber latency never stalls
/// a writer. Every mutation is appended to the transaction log before it
/// becomes visible to readers.
#[derive(Clone)]
pub struct ConfigTree {
    inner: Arc<Inner>,
}

struct Inner {
    root: RwLock<TopicNode>,
    journal: Mutex<Option<Journal>>,
    subscribers: RwLock<Vec<Subscriber>>,
    next_sub: AtomicU64,
    events: mpsc::UnboundedSender<ChangeEvent>,
}

impl ConfigTree {
    /// In-memory tree with no persistence. Requires a tokio runtime (the
    /// subscriber dispatch task is spawned here).
    pub fn new() -> Self {
        Self::with_journal(None, TopicNode::default())
    }

    pub(crate) fn with_journal(journal: Option<Journal>, root: TopicNode) -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel::<ChangeEvent>();
        let inner = Arc::new(Inner {
            root: RwLock::new(root),
            journal: Mutex::new(journal),
            subscribers: RwLock::new(Vec::new()),
            next_sub: AtomicU64::new(1),
            events: tx,
        });
        let dispatch = inner.clone();
        tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                let subs = dispatch.subscribers.read();
                for sub in subs.iter() {
                    if event.path.starts_with(&sub.prefix) || sub.prefix.starts_with(&event.path) {
                        (sub.handler)(&event);
                    }
                }
            }
        });
        ConfigTree { inner }
    }

    // ── Reads ─────────────────────────────────────────────────────────────────

    pub fn read(&self, path: &TopicPath) -> Option<Value> {
        let root = self.inner.root.read();
        find(&root, path.segments()).and_then(|n| n.value.clone())
    }

    pub fn modtime(&self, path: &TopicPath) -> Option<TimestampMs> {
        let root = self.inner.root.read();
        find(&root, path.segments()).map(|n| n.modtime)
    }

    pub fn exists(&self, path: &TopicPath) -> bool {
        let root = self.inner.root.read();
        find(&root, path.segments()).is_some()
    }

    pub fn children(&self, path: &TopicPath) -> Vec<String> {
        let root = self.inner.root.read();
        find(&root, path.segments())
            .map(|n| n.children.keys().cloned().collect())
            .unwrap_or_default()
    }

    /// Render the subtree at `path` as plain JSON (no modtimes).
    pub fn subtree(&self, path: &TopicPath) -> Option<Value> {
        let root = self.inner.root.read();
        find(&root, path.segments()).map(TopicNode::render)
    }

    /// Return the node at `path`, creating interior nodes on the way if
    /// absent. Creation of empty nodes is not journaled; only value writes
    /// are mutations.
    pub fn lookup(&self, path: &TopicPath) -> NodeView {
        let mut root = self.inner.root.write();
        let node = ensure(&mut root, path.segments());
        NodeView {
            modtime: node.modtime,
            value: node.value.clone(),
            children: node.children.keys().cloned().collect(),
        }
    }

    // ── Writes ────────────────────────────────────────────────────────────────

    /// Set the leaf at `path`. A write with `ts` ≤ the stored modtime is a
    /// no-op; returns whether the tree changed.
    pub fn write(
        &self,
        path: &TopicPath,
        value: Value,
        ts: TimestampMs,
    ) -> Result<bool, ConfigTreeError> {
        if path.is_root() {
            return Err(ConfigTreeError::InvalidPath("cannot write the root".into()));
        }
        let event = {
            let mut root = self.inner.root.write();
            if let Some(existing) = find(&root, path.segments()) {
                if ts <= existing.modtime && existing.value.is_some() {
                    debug!(path = %path, ts, "stale write dropped");
                    return Ok(false);
                }
            }
            self.journal(TlogEntry {
                ts,
                path: path.to_string(),
                op: TlogOp::Write,
                value: Some(value.clone()),
            })?;
            apply_write(&mut root, path.segments(), &value, ts);
            ChangeEvent {
                path: path.clone(),
                value: Some(value),
                ts,
            }
        };
        let _ = self.inner.events.send(event);
        Ok(true)
    }

    /// Remove the subtree at `path`. A removal with `ts` older than the
    /// node's own modtime is a no-op; returns whether the tree changed.
    pub fn remove(&self, path: &TopicPath, ts: TimestampMs) -> Result<bool, ConfigTreeError> {
        if path.is_root() {
            return Err(ConfigTreeError::InvalidPath("cannot remove the root".into()));
        }
        let event = {
            let mut root = self.inner.root.write();
            match find(&root, path.segments()) {
                None => return Ok(false),
                Some(node) if ts < node.modtime => {
                    debug!(path = %path, ts, "stale remove dropped");
                    return Ok(false);
                }
                Some(_) => {}
            }
            self.journal(TlogEntry {
                ts,
                path: path.to_string(),
                op: TlogOp::Remove,
                value: None,
            })?;
            apply_remove(&mut root, path.segments(), ts);
            ChangeEvent {
                path: path.clone(),
                value: None,
                ts,
            }
        };
        let _ = self.inner.events.send(event);
        Ok(true)
    }

    /// Apply a deployment merge as one unit: all writes and removals are
    /// stamped with the same timestamp, journaled together, and applied
    /// under a single write lock.
    pub fn merge_batch(
        &self,
        writes: Vec<(TopicPath, Value)>,
        removes: Vec<TopicPath>,
        ts: TimestampMs,
    ) -> Result<(), ConfigTreeError> {
        let mut events = Vec::with_capacity(writes.len() + removes.len());
        {
            let mut root = self.inner.root.write();
            for (path, value) in writes {
                let stale = find(&root, path.segments())
                    .map(|n| ts <= n.modtime && n.value.is_some())
                    .unwrap_or(false);
                if stale {
                    continue;
                }
                self.journal(TlogEntry {
                    ts,
                    path: path.to_string(),
                    op: TlogOp::Write,
                    value: Some(value.clone()),
                })?;
                apply_write(&mut root, path.segments(), &value, ts);
                events.push(ChangeEvent {
                    path,
                    value: Some(value),
                    ts,
                });
            }
            for path in removes {
                let gone = find(&root, path.segments()).is_none();
                if gone {
                    continue;
                }
                self.journal(TlogEntry {
                    ts,
                    path: path.to_string(),
                    op: TlogOp::Remove,
                    value: None,
                })?;
                apply_remove(&mut root, path.segments(), ts);
                events.push(ChangeEvent {
                    path,
                    value: None,
                    ts,
                });
            }
        }
        for event in events {
            let _ = self.inner.events.send(event);
        }
        Ok(())
    }

    fn journal(&self, entry: TlogEntry) -> Result<(), ConfigTreeError> {
        let mut journal = self.inner.journal.lock();
        if let Some(j) = journal.as_mut() {
            j.append(&entry)?;
        }
        Ok(())
    }

    // ── Subscriptions ─────────────────────────────────────────────────────────

    /// Register a handler fired after every committed change at or below
    /// `prefix`. Handlers run on the dispatch task, never inside the
    /// writer's critical section.
    pub fn subscribe(&self, prefix: TopicPath, handler: ChangeHandler) -> SubscriptionId {
        let id = SubscriptionId(self.inner.next_sub.fetch_add(1, Ordering::Relaxed));
        self.inner.subscribers.write().push(Subscriber {
            id,
            prefix,
            handler,
        });
        id
    }

    pub fn unsubscribe(&self, id: SubscriptionId) {
        self.inner.subscribers.write().retain(|s| s.id != id);
    }

    // ── Snapshot / restore ────────────────────────────────────────────────────

    /// Deterministic serialization of the whole tree, modtimes included.
    pub fn snapshot_bytes(&self) -> Result<Vec<u8>, ConfigTreeError> {
        let root = self.inner.root.read();
        Ok(serde_json::to_vec_pretty(&*root)?)
    }

    /// Replace the whole tree from a snapshot, replaying modtimes. Emits a
    /// single coalesced change event at the root.
    pub fn restore_bytes(&self, bytes: &[u8]) -> Result<(), ConfigTreeError> {
        let new_root: TopicNode =
            serde_json::from_slice(bytes).map_err(|e| ConfigTreeError::CorruptSnapshot {
                path: "<bytes>".into(),
                message: e.to_string(),
            })?;
        let ts = new_root.modtime;
        {
            let mut root = self.inner.root.write();
            *root = new_root;
        }
        let _ = self.inner.events.send(ChangeEvent {
            path: TopicPath::root(),
            value: None,
            ts,
        });
        Ok(())
    }

    pub(crate) fn replace_journal(&self, journal: Option<Journal>) {
        *self.inner.journal.lock() = journal;
    }

    /// Apply a replayed tlog entry without journaling it again.
    pub(crate) fn apply_replayed(&self, entry: &TlogEntry) {
        let mut root = self.inner.root.write();
        let path = TopicPath::parse(&entry.path);
        match entry.op {
            TlogOp::Write => {
                if let Some(value) = &entry.value {
                    let stale = find(&root, path.segments())
                        .map(|n| entry.ts <= n.modtime && n.value.is_some())
                        .unwrap_or(false);
                    if !stale {
                        apply_write(&mut root, path.segments(), value, entry.ts);
                    }
                }
            }
            TlogOp::Remove => {
                apply_remove(&mut root, path.segments(), entry.ts);
            }
        }
    }
}

impl Default for ConfigTree {
    fn default() -> Self {
        Self::new()
    }
}

// ── Tree walking ──────────────────────────────────────────────────────────────

fn find<'a>(node: &'a TopicNode, segments: &[String]) -> Option<&'a TopicNode> {
    match segments.split_first() {
        None => Some(node),
        Some((head, rest)) => node.children.get(head).and_then(|c| find(c, rest)),
    }
}

fn ensure<'a>(node: &'a mut TopicNode, segments: &[String]) -> &'a mut TopicNode {
    match segments.split_first() {
        None => node,
        Some((head, rest)) => {
            let child = node.children.entry(head.clone()).or_default();
            ensure(child, rest)
        }
    }
}

fn apply_write(node: &mut TopicNode, segments: &[String], value: &Value, ts: TimestampMs) {
    node.modtime = node.modtime.max(ts);
    match segments.split_first() {
        None => {
            node.value = Some(value.clone());
            node.modtime = ts;
        }
        Some((head, rest)) => {
            let child = node.children.entry(head.clone()).or_default();
            apply_write(child, rest, value, ts);
        }
    }
}

fn apply_remove(node: &mut TopicNode, segments: &[String], ts: TimestampMs) {
    node.modtime = node.modtime.max(ts);
    match segments.split_first() {
        None => {}
        Some((head, rest)) => {
            if rest.is_empty() {
                node.children.remove(head.as_str());
            } else if let Some(child) = node.children.get_mut(head.as_str()) {
                apply_remove(child, rest, ts);
            }
        }
    }
}
