//! Sync registry — the seam between the controller sync transport and the
//! caches.
//!
//! Receive caches accept `update`/`delete` messages from the controller.
//! Send caches hold CRM-owned status objects that the transport pushes
//! back out. The transport itself only ever sees `SyncMessage`s and JSON
//! snapshots.

use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crm_core::{CacheObject, ObjectKind};

use crate::cache::Cache;
use crate::error::{StateError, StateResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncAction {
    Update,
    Delete,
}

/// One object change on the sync wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncMessage {
    pub kind: ObjectKind,
    pub action: SyncAction,
    #[serde(default)]
    pub revision: i64,
    pub object: serde_json::Value,
}

impl SyncMessage {
    pub fn update<T: CacheObject>(obj: &T, revision: i64) -> StateResult<Self> {
        Ok(Self {
            kind: T::KIND,
            action: SyncAction::Update,
            revision,
            object: serde_json::to_value(obj).map_err(|e| StateError::Serialize(e.to_string()))?,
        })
    }

    pub fn delete<T: CacheObject>(obj: &T, revision: i64) -> StateResult<Self> {
        Ok(Self {
            action: SyncAction::Delete,
            ..Self::update(obj, revision)?
        })
    }
}

/// Type-erased view of a cache, as seen by the sync transport.
pub trait SyncCache: Send + Sync {
    fn kind(&self) -> ObjectKind;
    fn apply(&self, action: SyncAction, revision: i64, object: serde_json::Value)
    -> StateResult<()>;
    fn snapshot(&self) -> StateResult<Vec<serde_json::Value>>;
    fn len(&self) -> usize;
}

impl<T: CacheObject> SyncCache for Cache<T> {
    fn kind(&self) -> ObjectKind {
        T::KIND
    }

    fn apply(
        &self,
        action: SyncAction,
        revision: i64,
        object: serde_json::Value,
    ) -> StateResult<()> {
        let obj: T = serde_json::from_value(object)
            .map_err(|e| StateError::Deserialize(format!("{}: {e}", T::KIND)))?;
        match action {
            SyncAction::Update => {
                self.update(obj, revision);
            }
            SyncAction::Delete => {
                self.delete(&obj, revision);
            }
        }
        Ok(())
    }

    fn snapshot(&self) -> StateResult<Vec<serde_json::Value>> {
        self.list()
            .iter()
            .map(|o| serde_json::to_value(o).map_err(|e| StateError::Serialize(e.to_string())))
            .collect()
    }

    fn len(&self) -> usize {
        self.count()
    }
}

/// Registered receive and send caches, keyed by object kind.
#[derive(Clone, Default)]
pub struct SyncRegistry {
    recv: HashMap<ObjectKind, Arc<dyn SyncCache>>,
    send: HashMap<ObjectKind, Arc<dyn SyncCache>>,
}

impl SyncRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Accept controller updates for `T` into `cache`.
    pub fn register_recv<T: CacheObject>(&mut self, cache: &Cache<T>) {
        self.recv.insert(T::KIND, Arc::new(cache.clone()));
    }

    /// Publish CRM-owned `T` objects from `cache`.
    pub fn register_send<T: CacheObject>(&mut self, cache: &Cache<T>) {
        self.send.insert(T::KIND, Arc::new(cache.clone()));
    }

    /// Route one controller message to its receive cache.
    pub fn apply(&self, msg: SyncMessage) -> StateResult<()> {
        let Some(cache) = self.recv.get(&msg.kind) else {
            if self.send.contains_key(&msg.kind) {
                return Err(StateError::NotAccepted(msg.kind.to_string()));
            }
            return Err(StateError::UnknownKind(msg.kind.to_string()));
        };
        debug!(kind = %msg.kind, action = ?msg.action, revision = msg.revision, "sync message");
        cache.apply(msg.action, msg.revision, msg.object)
    }

    /// Apply a batch in order, stopping at the first failure.
    pub fn apply_all(&self, msgs: Vec<SyncMessage>) -> StateResult<usize> {
        let n = msgs.len();
        for msg in msgs {
            self.apply(msg)?;
        }
        Ok(n)
    }

    /// JSON snapshot of any registered cache, receive or send.
    pub fn snapshot(&self, kind: ObjectKind) -> StateResult<Vec<serde_json::Value>> {
        self.recv
            .get(&kind)
            .or_else(|| self.send.get(&kind))
            .ok_or_else(|| StateError::UnknownKind(kind.to_string()))?
            .snapshot()
    }

    pub fn recv_kinds(&self) -> Vec<ObjectKind> {
        let mut kinds: Vec<ObjectKind> = self.recv.keys().copied().collect();
        kinds.sort();
        kinds
    }

    pub fn send_kinds(&self) -> Vec<ObjectKind> {
        let mut kinds: Vec<ObjectKind> = self.send.keys().copied().collect();
        kinds.sort();
        kinds
    }

    /// Object counts per registered kind.
    pub fn counts(&self) -> Vec<(ObjectKind, usize)> {
        let mut counts: Vec<(ObjectKind, usize)> = self
            .recv
            .iter()
            .chain(self.send.iter())
            .map(|(k, c)| (*k, c.len()))
            .collect();
        counts.sort();
        counts
    }
}
