use async_trait::async_trait;
use log::{debug, warn};
use serde_json::Value;
use tokio::sync::{watch, Mutex};

use super::notify::SubscriberHub;
use super::{tree, Store, StoreError, StorePath, Subscription, WriteBatch};

/// In-process store. Every station sharing the same `Arc<MemoryStore>`
/// sees the same tree.
pub struct MemoryStore {
    root: Mutex<Value>,
    hub: SubscriberHub,
    online: watch::Sender<bool>,
}

impl MemoryStore {
    pub fn new() -> Self {
        let (online, _) = watch::channel(true);
        Self {
            root: Mutex::new(Value::Null),
            hub: SubscriberHub::default(),
            online,
        }
    }

    /// Simulates losing (or regaining) the store. While offline every
    /// operation fails with [`StoreError::Unavailable`].
    pub fn set_online(&self, online: bool) {
        if !online {
            warn!("Memory store switched offline");
        }
        self.online.send_replace(online);
    }

    fn ensure_online(&self) -> Result<(), StoreError> {
        if *self.online.borrow() {
            Ok(())
        } else {
            Err(StoreError::Unavailable("store is offline".to_string()))
        }
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn read(&self, path: &StorePath) -> Result<Option<Value>, StoreError> {
        self.ensure_online()?;
        let root = self.root.lock().await;
        Ok(tree::get(&root, path).cloned())
    }

    async fn commit(&self, batch: WriteBatch) -> Result<(), StoreError> {
        self.ensure_online()?;
        let mut root = self.root.lock().await;

        for (path, expected) in batch.preconditions() {
            if tree::get(&root, path) != expected.as_ref() {
                debug!("Precondition failed at {}", path);
                return Err(StoreError::Conflict(path.clone()));
            }
        }
        for (path, value) in batch.updates() {
            tree::set(&mut root, path, value.clone());
        }

        // Notify while still holding the tree so subscribers see commits in order.
        for path in self.hub.watched_paths(Some(&batch.touched_paths())).await {
            self.hub.publish(&path, tree::get(&root, &path).cloned()).await;
        }
        Ok(())
    }

    async fn subscribe(&self, path: &StorePath) -> Result<Subscription, StoreError> {
        self.ensure_online()?;
        let root = self.root.lock().await;
        let initial = tree::get(&root, path).cloned();
        Ok(self.hub.register(path, initial).await)
    }

    fn connectivity(&self) -> watch::Receiver<bool> {
        self.online.subscribe()
    }
}
