//! crm-state — desired-state and status caches for the CRM.
//!
//! # Architecture
//!
//! ```text
//! controller ──SyncMessage──▶ SyncRegistry ──▶ Cache<T> (recv)
//!                                                 │ on_change
//!                                                 ▼
//!                                           orchestrator / exec
//!                                                 │
//! controller ◀──snapshot / push── Cache<T> (send: *Info objects)
//! ```
//!
//! Each `Cache<T>` is `Clone` + `Send` + `Sync` and guards its table with a
//! single mutex held only for the in-memory mutation.

pub mod cache;
pub mod error;
pub mod set;
pub mod sync;

pub use cache::{Cache, CacheEvent, ChangeCallback};
pub use error::{StateError, StateResult};
pub use set::CacheSet;
pub use sync::{SyncAction, SyncCache, SyncMessage, SyncRegistry};
