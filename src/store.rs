//! In-memory replicated store: the committed, versioned side of the
//! system that the consensus manager feeds and follows.
//!
//! The store assigns one [`Event`] per slot, in seqn order, each carrying
//! the committed mutation bytes and a snapshot of the tree after applying
//! them. Consensus only needs three things from it: an ordered event
//! stream from any retained seqn (`wait`), read-only projection of a
//! snapshot (`getdir`/`get_string`), and tolerance for duplicate commits —
//! a fill and a real proposal can both decide a slot the store has already
//! sealed.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex};

use anyhow::Result;
use crossbeam_channel::{unbounded, Receiver, Sender};
use serde::{Deserialize, Serialize};
use tracing::debug;

/// A decided slot on its way from a learner into the store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Op {
    pub seqn: u64,
    pub mutation: Vec<u8>,
}

/// Mutations the store knows how to apply. Anything else commits as an
/// opaque blob with no tree change, so consensus can stay value-agnostic.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Mutation {
    /// The no-op sentinel: a commit that changes nothing. Gap fills
    /// propose this to close idle slots.
    Nop,
    Assign { path: String, value: String },
}

impl Mutation {
    pub fn encode(&self) -> Result<Vec<u8>> {
        Ok(bincode::serialize(self)?)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        Ok(bincode::deserialize(bytes)?)
    }
}

/// Errors surfaced by the store contract.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    /// The slot precedes the compaction frontier and cannot be replayed.
    #[error("seqn {0} is too old to reconstruct")]
    TooLate(u64),
}

/// Immutable view of the tree as of one rev.
#[derive(Debug, Clone)]
pub struct Snapshot {
    rev: u64,
    tree: Arc<BTreeMap<String, String>>,
}

impl Snapshot {
    pub fn rev(&self) -> u64 {
        self.rev
    }

    /// Immediate children of `path`, deduplicated, in sorted order.
    pub fn getdir(&self, path: &str) -> Vec<String> {
        let prefix = format!("{}/", path.trim_end_matches('/'));
        let mut children = BTreeSet::new();
        for key in self.tree.keys() {
            if let Some(rest) = key.strip_prefix(&prefix) {
                let child = rest.split('/').next().unwrap_or(rest);
                if !child.is_empty() {
                    children.insert(child.to_string());
                }
            }
        }
        children.into_iter().collect()
    }

    /// The value at `path`, or the empty string when absent.
    pub fn get_string(&self, path: &str) -> String {
        self.tree.get(path).cloned().unwrap_or_default()
    }
}

/// One committed slot: the mutation bytes and the tree after them.
#[derive(Debug, Clone)]
pub struct Event {
    pub seqn: u64,
    pub mutation: Vec<u8>,
    pub snapshot: Snapshot,
}

impl Event {
    pub fn getdir(&self, path: &str) -> Vec<String> {
        self.snapshot.getdir(path)
    }

    pub fn get_string(&self, path: &str) -> String {
        self.snapshot.get_string(path)
    }
}

struct Waiter {
    next: u64,
    tx: Sender<Event>,
}

struct Inner {
    rev: u64,
    frontier: u64,
    tree: BTreeMap<String, String>,
    events: BTreeMap<u64, Event>,
    pending: BTreeMap<u64, Vec<u8>>,
    waiters: Vec<Waiter>,
    closed: bool,
}

/// Shared handle to one in-memory store. Clones observe the same state.
#[derive(Clone)]
pub struct Store {
    inner: Arc<Mutex<Inner>>,
}

impl Store {
    /// A store whose rev 0 holds `initial` as its seeded snapshot.
    pub fn new(initial: BTreeMap<String, String>) -> Store {
        let tree = Arc::new(initial.clone());
        let genesis = Event {
            seqn: 0,
            mutation: Mutation::Nop.encode().unwrap_or_default(),
            snapshot: Snapshot { rev: 0, tree },
        };
        Store {
            inner: Arc::new(Mutex::new(Inner {
                rev: 0,
                frontier: 0,
                tree: initial,
                events: BTreeMap::from([(0, genesis)]),
                pending: BTreeMap::new(),
                waiters: Vec::new(),
                closed: false,
            })),
        }
    }

    /// The highest committed seqn.
    pub fn rev(&self) -> u64 {
        self.inner.lock().unwrap().rev
    }

    /// An ordered stream of committed events starting at `seqn`. Events
    /// already committed are delivered immediately; later ones arrive as
    /// they commit. The channel closes when the store does.
    pub fn wait(&self, seqn: u64) -> Result<Receiver<Event>, StoreError> {
        let mut inner = self.inner.lock().unwrap();
        if seqn < inner.frontier {
            return Err(StoreError::TooLate(seqn));
        }

        let (tx, rx) = unbounded();
        for event in inner.events.range(seqn..).map(|(_, e)| e.clone()) {
            let _ = tx.send(event);
        }
        if !inner.closed {
            let next = seqn.max(inner.rev + 1);
            inner.waiters.push(Waiter { next, tx });
        }
        Ok(rx)
    }

    /// Record the decided mutation for `seqn`. Out-of-order commits are
    /// buffered until the gap before them closes; commits at or below the
    /// current rev are duplicates and ignored.
    pub fn commit(&self, seqn: u64, mutation: Vec<u8>) {
        let mut inner = self.inner.lock().unwrap();
        if inner.closed || seqn <= inner.rev {
            return;
        }
        inner.pending.insert(seqn, mutation);

        loop {
            let next = inner.rev + 1;
            let Some(mutation) = inner.pending.remove(&next) else {
                break;
            };
            if let Ok(Mutation::Assign { path, value }) = Mutation::decode(&mutation) {
                inner.tree.insert(path, value);
            }
            inner.rev = next;

            let event = Event {
                seqn: next,
                mutation,
                snapshot: Snapshot {
                    rev: next,
                    tree: Arc::new(inner.tree.clone()),
                },
            };
            inner.events.insert(next, event.clone());
            inner.waiters.retain_mut(|w| {
                if w.next != next {
                    return true;
                }
                w.next += 1;
                w.tx.send(event.clone()).is_ok()
            });
            debug!(seqn = next, "committed");
        }
    }

    /// Drop retained events below `before` and raise the replay frontier.
    pub fn compact(&self, before: u64) {
        let mut inner = self.inner.lock().unwrap();
        inner.frontier = inner.frontier.max(before);
        let kept = inner.events.split_off(&before);
        inner.events = kept;
    }

    /// Shut down: every open event stream sees end-of-stream.
    pub fn close(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.closed = true;
        inner.waiters.clear();
    }
}
