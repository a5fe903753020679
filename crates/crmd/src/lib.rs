//! crmd — the CRM daemon.
//!
//! One process per cloudlet (two with HA) that:
//! - takes desired state from the controller over the sync API
//! - reconciles ClusterInsts and AppInsts onto the platform
//! - keeps the load balancers' TLS certs fresh
//! - pushes CloudletInfo, ClusterInstInfo and AppInstInfo back
//! - serves exec sessions into running AppInsts
//!
//! Only the active instance does any of the above that touches
//! infrastructure; the standby keeps its caches in sync and waits.

pub mod daemon;
pub mod publisher;
pub mod watcher;

pub use daemon::{DaemonOptions, run};
pub use publisher::{StatusPublisher, post_json};
pub use watcher::CrmWatcher;
