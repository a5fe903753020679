//! crm-ha — leader election between a redundant pair of CRMs.
//!
//! Both instances compete for one lease record in a shared store. The
//! holder is active and may drive the infrastructure; the other waits.
//!
//! # Architecture
//!
//! ```text
//! HighAvailabilityManager (primary)      HighAvailabilityManager (secondary)
//!   ├── try_active()  ──set_if_absent──▶ LeaseStore ◀── try_active()
//!   ├── bump_active_expire() ──set_with_expiry──┘
//!   ├── transition table (state.rs)
//!   └── watch::Sender<HaState> ──▶ ActiveHandle (orchestrator, exec, certs)
//! ```
//!
//! Losing a held lease is fatal: `run` returns `HaError::Fatal` and the
//! daemon exits so a supervisor can restart it.

pub mod error;
pub mod lease;
pub mod manager;
pub mod state;

pub use error::{HaError, HaResult};
pub use lease::{FileLeaseStore, LeaseStore, MemoryLeaseStore};
pub use manager::{ActiveHandle, HaWatcher, HighAvailabilityManager};
pub use state::{HaEvent, HaState, Hook, Transition, transition};
