//! Lease stores — the shared record the redundant pair competes for.
//!
//! Only two mutations are allowed on a lease: set-if-absent and
//! set-with-expiry. Both are atomic within a store, so the manager never
//! read-modify-writes a lease.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use redb::{Database, ReadableTable, TableDefinition};
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::debug;

use crate::error::{HaError, HaResult};

/// Shared coordination store holding expiring leases.
#[async_trait]
pub trait LeaseStore: Send + Sync {
    /// Check the store is reachable.
    async fn ping(&self) -> HaResult<()>;

    /// Set `key` to `holder` with a TTL unless an unexpired value exists.
    /// Returns whether the value was set.
    async fn set_if_absent(&self, key: &str, holder: &str, ttl: Duration) -> HaResult<bool>;

    /// Unconditionally set `key` to `holder` with a TTL.
    async fn set_with_expiry(&self, key: &str, holder: &str, ttl: Duration) -> HaResult<()>;

    /// Current unexpired holder of `key`.
    async fn get(&self, key: &str) -> HaResult<Option<String>>;
}

// ── In-memory store ────────────────────────────────────────────────

/// Process-local lease store. Clones share the same leases.
///
/// Expiry uses `tokio::time::Instant`, so tests can drive it with a
/// paused clock. `set_reachable(false)` simulates a store outage.
#[derive(Clone, Default)]
pub struct MemoryLeaseStore {
    leases: Arc<Mutex<HashMap<String, (String, Instant)>>>,
    unreachable: Arc<AtomicBool>,
}

impl MemoryLeaseStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_reachable(&self, reachable: bool) {
        self.unreachable.store(!reachable, Ordering::SeqCst);
    }

    fn check_reachable(&self) -> HaResult<()> {
        if self.unreachable.load(Ordering::SeqCst) {
            return Err(HaError::Unreachable("memory store offline".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl LeaseStore for MemoryLeaseStore {
    async fn ping(&self) -> HaResult<()> {
        self.check_reachable()
    }

    async fn set_if_absent(&self, key: &str, holder: &str, ttl: Duration) -> HaResult<bool> {
        self.check_reachable()?;
        let now = Instant::now();
        let mut leases = self.leases.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some((_, expires)) = leases.get(key)
            && *expires > now
        {
            return Ok(false);
        }
        leases.insert(key.to_string(), (holder.to_string(), now + ttl));
        Ok(true)
    }

    async fn set_with_expiry(&self, key: &str, holder: &str, ttl: Duration) -> HaResult<()> {
        self.check_reachable()?;
        let mut leases = self.leases.lock().unwrap_or_else(PoisonError::into_inner);
        leases.insert(key.to_string(), (holder.to_string(), Instant::now() + ttl));
        Ok(())
    }

    async fn get(&self, key: &str) -> HaResult<Option<String>> {
        self.check_reachable()?;
        let leases = self.leases.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(leases
            .get(key)
            .filter(|(_, expires)| *expires > Instant::now())
            .map(|(holder, _)| holder.clone()))
    }
}

// ── File store (redb) ──────────────────────────────────────────────

/// Leases keyed by node group key.
const LEASES: TableDefinition<&str, &[u8]> = TableDefinition::new("leases");

#[derive(Debug, Serialize, Deserialize)]
struct LeaseRecord {
    holder: String,
    /// Wall-clock expiry in unix millis; both processes share the clock.
    expires_at_ms: u64,
}

/// Convert any `Display` error into a `HaError` variant via a closure factory.
macro_rules! map_err {
    ($variant:ident) => {
        |e| HaError::$variant(e.to_string())
    };
}

/// Lease store in a redb file shared by a primary and secondary on the
/// same host (or a shared volume).
///
/// The database is opened per operation. While the other process holds
/// the file, the open fails and the store reports itself unreachable, so
/// the manager's retry handling applies unchanged.
#[derive(Debug, Clone)]
pub struct FileLeaseStore {
    path: PathBuf,
}

impl FileLeaseStore {
    pub fn new(path: &Path) -> Self {
        Self {
            path: path.to_path_buf(),
        }
    }

    async fn with_db<R, F>(&self, f: F) -> HaResult<R>
    where
        R: Send + 'static,
        F: FnOnce(&Database) -> HaResult<R> + Send + 'static,
    {
        let path = self.path.clone();
        tokio::task::spawn_blocking(move || {
            let db = Database::create(&path).map_err(map_err!(Unreachable))?;
            f(&db)
        })
        .await
        .map_err(map_err!(Store))?
    }
}

fn epoch_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

fn decode(bytes: &[u8]) -> HaResult<LeaseRecord> {
    serde_json::from_slice(bytes).map_err(map_err!(Store))
}

fn write_record(db: &Database, key: &str, holder: &str, ttl: Duration) -> HaResult<()> {
    let record = LeaseRecord {
        holder: holder.to_string(),
        expires_at_ms: epoch_millis() + ttl.as_millis() as u64,
    };
    let value = serde_json::to_vec(&record).map_err(map_err!(Store))?;
    let txn = db.begin_write().map_err(map_err!(Store))?;
    {
        let mut table = txn.open_table(LEASES).map_err(map_err!(Store))?;
        table
            .insert(key, value.as_slice())
            .map_err(map_err!(Store))?;
    }
    txn.commit().map_err(map_err!(Store))?;
    Ok(())
}

#[async_trait]
impl LeaseStore for FileLeaseStore {
    async fn ping(&self) -> HaResult<()> {
        self.with_db(|_| Ok(())).await
    }

    async fn set_if_absent(&self, key: &str, holder: &str, ttl: Duration) -> HaResult<bool> {
        let key = key.to_string();
        let holder = holder.to_string();
        self.with_db(move |db| {
            // The check and the insert share one write transaction.
            let txn = db.begin_write().map_err(map_err!(Store))?;
            let set = {
                let mut table = txn.open_table(LEASES).map_err(map_err!(Store))?;
                let current = match table.get(key.as_str()).map_err(map_err!(Store))? {
                    Some(guard) => Some(decode(guard.value())?),
                    None => None,
                };
                match current {
                    Some(rec) if rec.expires_at_ms > epoch_millis() => false,
                    _ => {
                        let record = LeaseRecord {
                            holder: holder.clone(),
                            expires_at_ms: epoch_millis() + ttl.as_millis() as u64,
                        };
                        let value = serde_json::to_vec(&record).map_err(map_err!(Store))?;
                        table
                            .insert(key.as_str(), value.as_slice())
                            .map_err(map_err!(Store))?;
                        true
                    }
                }
            };
            if set {
                txn.commit().map_err(map_err!(Store))?;
            } else {
                txn.abort().map_err(map_err!(Store))?;
            }
            debug!(%key, %holder, set, "lease set-if-absent");
            Ok(set)
        })
        .await
    }

    async fn set_with_expiry(&self, key: &str, holder: &str, ttl: Duration) -> HaResult<()> {
        let key = key.to_string();
        let holder = holder.to_string();
        self.with_db(move |db| write_record(db, &key, &holder, ttl))
            .await
    }

    async fn get(&self, key: &str) -> HaResult<Option<String>> {
        let key = key.to_string();
        self.with_db(move |db| {
            // Opening the table in a write transaction creates it if absent.
            let txn = db.begin_write().map_err(map_err!(Store))?;
            let current = {
                let table = txn.open_table(LEASES).map_err(map_err!(Store))?;
                match table.get(key.as_str()).map_err(map_err!(Store))? {
                    Some(guard) => Some(decode(guard.value())?),
                    None => None,
                }
            };
            txn.commit().map_err(map_err!(Store))?;
            Ok(current
                .filter(|rec| rec.expires_at_ms > epoch_millis())
                .map(|rec| rec.holder))
        })
        .await
    }
}
