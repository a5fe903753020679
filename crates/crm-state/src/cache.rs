//! Cache — a key-indexed, mutex-guarded table of one object type.
//!
//! Every call takes the table lock only for the in-memory mutation and
//! clones out what it returns, so readers never observe a partially
//! applied update. Change callbacks run after the table lock is released
//! but under the cache's writer lock, so callbacks see changes in the
//! order they were stored. A callback may read the cache it is registered
//! on; it must not write to it.

use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};

use tracing::debug;

use crm_core::{CacheObject, CloudletKey};

/// A change observed by a cache.
#[derive(Debug, Clone)]
pub enum CacheEvent<T: CacheObject> {
    Updated {
        old: Option<T>,
        new: T,
        revision: i64,
    },
    Deleted {
        old: T,
        revision: i64,
    },
}

impl<T: CacheObject> CacheEvent<T> {
    pub fn key(&self) -> T::Key {
        match self {
            CacheEvent::Updated { new, .. } => new.key(),
            CacheEvent::Deleted { old, .. } => old.key(),
        }
    }
}

/// Callback invoked after every update or delete.
pub type ChangeCallback<T> = Arc<dyn Fn(&CacheEvent<T>) + Send + Sync>;

struct Entry<T> {
    obj: T,
    revision: i64,
}

struct Inner<T: CacheObject> {
    objs: Mutex<HashMap<T::Key, Entry<T>>>,
    /// Held from mutation through notification.
    writer: Mutex<()>,
    callbacks: RwLock<Vec<ChangeCallback<T>>>,
    last_revision: AtomicI64,
}

/// Thread-safe cache for one object type. Cheap to clone.
pub struct Cache<T: CacheObject> {
    inner: Arc<Inner<T>>,
}

impl<T: CacheObject> Clone for Cache<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T: CacheObject> Default for Cache<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: CacheObject> Cache<T> {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                objs: Mutex::new(HashMap::new()),
                writer: Mutex::new(()),
                callbacks: RwLock::new(Vec::new()),
                last_revision: AtomicI64::new(0),
            }),
        }
    }

    fn objs(&self) -> MutexGuard<'_, HashMap<T::Key, Entry<T>>> {
        self.inner.objs.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn writer(&self) -> MutexGuard<'_, ()> {
        self.inner.writer.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register a callback for every subsequent change.
    pub fn on_change(&self, callback: ChangeCallback<T>) {
        self.inner
            .callbacks
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(callback);
    }

    fn notify(&self, event: CacheEvent<T>) {
        let callbacks: Vec<ChangeCallback<T>> = self
            .inner
            .callbacks
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        for cb in &callbacks {
            cb(&event);
        }
    }

    /// Insert or replace an object. Returns the previous copy, if any.
    pub fn update(&self, obj: T, revision: i64) -> Option<T> {
        let key = obj.key();
        let _writer = self.writer();
        let old = {
            let mut objs = self.objs();
            objs.insert(
                key.clone(),
                Entry {
                    obj: obj.clone(),
                    revision,
                },
            )
            .map(|e| e.obj)
        };
        self.inner.last_revision.fetch_max(revision, Ordering::SeqCst);
        debug!(kind = %T::KIND, %key, revision, "cache update");
        self.notify(CacheEvent::Updated {
            old: old.clone(),
            new: obj,
            revision,
        });
        old
    }

    /// Remove the object with `obj`'s key. Deleting an absent object is
    /// not an error; returns whether something was removed.
    pub fn delete(&self, obj: &T, revision: i64) -> bool {
        self.delete_key(&obj.key(), revision)
    }

    pub fn delete_key(&self, key: &T::Key, revision: i64) -> bool {
        let _writer = self.writer();
        let old = self.objs().remove(key).map(|e| e.obj);
        self.inner.last_revision.fetch_max(revision, Ordering::SeqCst);
        match old {
            Some(old) => {
                debug!(kind = %T::KIND, %key, revision, "cache delete");
                self.notify(CacheEvent::Deleted { old, revision });
                true
            }
            None => false,
        }
    }

    /// Apply `f` to the cached copy under the lock and notify with the
    /// result. Returns `None` if the key is absent.
    pub fn modify<F>(&self, key: &T::Key, revision: i64, f: F) -> Option<T>
    where
        F: FnOnce(&mut T),
    {
        let _writer = self.writer();
        let (old, new) = {
            let mut objs = self.objs();
            let entry = objs.get_mut(key)?;
            let old = entry.obj.clone();
            f(&mut entry.obj);
            entry.revision = revision;
            (old, entry.obj.clone())
        };
        self.notify(CacheEvent::Updated {
            old: Some(old),
            new: new.clone(),
            revision,
        });
        Some(new)
    }

    pub fn get(&self, key: &T::Key) -> Option<T> {
        self.objs().get(key).map(|e| e.obj.clone())
    }

    pub fn get_with_revision(&self, key: &T::Key) -> Option<(T, i64)> {
        self.objs().get(key).map(|e| (e.obj.clone(), e.revision))
    }

    pub fn contains(&self, key: &T::Key) -> bool {
        self.objs().contains_key(key)
    }

    /// All objects matching `filter`, ordered by key.
    pub fn show<F>(&self, filter: F) -> Vec<T>
    where
        F: Fn(&T) -> bool,
    {
        let mut out: Vec<T> = self
            .objs()
            .values()
            .filter(|e| filter(&e.obj))
            .map(|e| e.obj.clone())
            .collect();
        out.sort_by_key(|o| o.key());
        out
    }

    pub fn list(&self) -> Vec<T> {
        self.show(|_| true)
    }

    pub fn keys(&self) -> Vec<T::Key> {
        let mut keys: Vec<T::Key> = self.objs().keys().cloned().collect();
        keys.sort();
        keys
    }

    pub fn count(&self) -> usize {
        self.objs().len()
    }

    /// Objects scoped to `cloudlet`.
    pub fn show_for_cloudlet(&self, cloudlet: &CloudletKey) -> Vec<T> {
        self.show(|o| o.cloudlet_key() == Some(cloudlet))
    }

    pub fn count_for_cloudlet(&self, cloudlet: &CloudletKey) -> usize {
        self.objs()
            .values()
            .filter(|e| e.obj.cloudlet_key() == Some(cloudlet))
            .count()
    }

    /// Highest revision seen by this cache.
    pub fn last_revision(&self) -> i64 {
        self.inner.last_revision.load(Ordering::SeqCst)
    }
}
