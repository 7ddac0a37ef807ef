//! Shared store adapter.
//!
//! The election lives in a JSON tree that every station can see. Stations
//! only talk to it through [`Store`]: plain reads and writes, an atomic
//! multi-path [`WriteBatch`] with optional preconditions, push
//! subscriptions and a liveness signal.

mod memory;
mod notify;
mod sqlite;
pub mod tree;

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use log::info;
use serde_json::Value;
use thiserror::Error;
use tokio::sync::{mpsc, watch};

pub use memory::MemoryStore;
pub use sqlite::SqliteStore;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store unavailable: {0}")]
    Unavailable(String),
    #[error("write conflict at {0}")]
    Conflict(StorePath),
    /// Another process holds the database lock.
    #[error("database busy: {0}")]
    Busy(String),
    #[error("malformed value: {0}")]
    Codec(#[from] serde_json::Error),
    #[error("database error: {0}")]
    Backend(#[from] sqlx::Error),
}

impl StoreError {
    pub fn is_conflict(&self) -> bool {
        matches!(self, StoreError::Conflict(_) | StoreError::Busy(_))
    }
}

/// `/`-separated address of a node in the tree. The empty path is the root.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StorePath(Vec<String>);

impl StorePath {
    pub fn root() -> Self {
        Self(Vec::new())
    }

    pub fn parse(path: &str) -> Self {
        Self(
            path.split('/')
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect(),
        )
    }

    pub fn child(&self, segment: impl Into<String>) -> Self {
        let mut segments = self.0.clone();
        segments.push(segment.into());
        Self(segments)
    }

    pub fn segments(&self) -> &[String] {
        &self.0
    }

    pub fn is_root(&self) -> bool {
        self.0.is_empty()
    }

    /// True when `self` is `other` or one of its ancestors.
    pub fn contains(&self, other: &StorePath) -> bool {
        other.0.len() >= self.0.len() && other.0[..self.0.len()] == self.0[..]
    }

    /// True when a change at one path is visible from the other.
    pub fn overlaps(&self, other: &StorePath) -> bool {
        self.contains(other) || other.contains(self)
    }
}

impl fmt::Display for StorePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.join("/"))
    }
}

/// A set of writes that lands all together or not at all.
///
/// Preconditions are checked at commit time against the stored values;
/// `None` means the path must be absent. If any of them fails the store
/// rejects the whole batch with [`StoreError::Conflict`].
#[derive(Debug, Clone, Default)]
pub struct WriteBatch {
    preconditions: Vec<(StorePath, Option<Value>)>,
    updates: Vec<(StorePath, Value)>,
}

impl WriteBatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&mut self, path: StorePath, value: Value) {
        self.updates.push((path, value));
    }

    pub fn remove(&mut self, path: StorePath) {
        self.updates.push((path, Value::Null));
    }

    pub fn expect(&mut self, path: StorePath, value: Option<Value>) {
        let value = value.filter(|v| !v.is_null());
        self.preconditions.push((path, value));
    }

    pub fn is_empty(&self) -> bool {
        self.updates.is_empty()
    }

    pub fn len(&self) -> usize {
        self.updates.len()
    }

    pub fn preconditions(&self) -> &[(StorePath, Option<Value>)] {
        &self.preconditions
    }

    pub fn updates(&self) -> &[(StorePath, Value)] {
        &self.updates
    }

    pub fn touched_paths(&self) -> Vec<StorePath> {
        self.updates.iter().map(|(p, _)| p.clone()).collect()
    }
}

/// Push feed for one subtree. The first message is the current value, each
/// later one is the subtree after a commit that touched it. Dropping the
/// subscription unsubscribes.
pub struct Subscription {
    rx: mpsc::UnboundedReceiver<Option<Value>>,
}

impl Subscription {
    pub(crate) fn new(rx: mpsc::UnboundedReceiver<Option<Value>>) -> Self {
        Self { rx }
    }

    /// Next pushed value; `None` once the store has gone away.
    pub async fn recv(&mut self) -> Option<Option<Value>> {
        self.rx.recv().await
    }
}

#[async_trait]
pub trait Store: Send + Sync {
    async fn read(&self, path: &StorePath) -> Result<Option<Value>, StoreError>;

    async fn commit(&self, batch: WriteBatch) -> Result<(), StoreError>;

    async fn subscribe(&self, path: &StorePath) -> Result<Subscription, StoreError>;

    fn connectivity(&self) -> watch::Receiver<bool>;

    /// Last-writer-wins write of a single subtree.
    async fn write(&self, path: &StorePath, value: Value) -> Result<(), StoreError> {
        let mut batch = WriteBatch::new();
        batch.set(path.clone(), value);
        self.commit(batch).await
    }
}

/// Opens the store named by a database URL. `memory:` gives a fresh
/// in-process store, anything else is handed to SQLite.
pub async fn connect(url: &str) -> Result<Arc<dyn Store>, StoreError> {
    if url == "memory:" {
        info!("Using in-memory store");
        return Ok(Arc::new(MemoryStore::new()));
    }
    let store = SqliteStore::connect(url).await?;
    info!("Connected to {}", url);
    Ok(Arc::new(store))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn paths_parse_and_compare() {
        let groups = StorePath::parse("election/groups");
        let votes = groups.child("finance").child("candidates");
        assert_eq!(votes.to_string(), "election/groups/finance/candidates");
        assert_eq!(StorePath::parse("/election//groups/"), groups);
        assert!(groups.contains(&votes));
        assert!(!votes.contains(&groups));
        assert!(votes.overlaps(&groups));
        assert!(StorePath::root().contains(&groups));
        assert!(!groups.overlaps(&StorePath::parse("election/voteLog")));
    }

    #[test]
    fn null_expectation_means_absent() {
        let mut batch = WriteBatch::new();
        batch.expect(StorePath::parse("a"), Some(Value::Null));
        batch.remove(StorePath::parse("b"));
        assert_eq!(batch.preconditions()[0].1, None);
        assert_eq!(batch.len(), 1);
        assert_eq!(batch.touched_paths(), vec![StorePath::parse("b")]);
    }
}
