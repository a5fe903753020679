//! crm-core — shared types for the cloudlet resource manager.
//!
//! Holds the controller and status object model, the `crmd.toml`
//! configuration, and the pure naming functions (`KubeNames`, sanitizers)
//! every other CRM crate derives identifiers from.

pub mod config;
pub mod error;
pub mod kubenames;
pub mod sanitize;
pub mod types;

pub use config::{CertsConfig, CrmConfig, DegradedPolicy, HaConfig, HaRole, OrchestratorConfig, PlatformConfig};
pub use error::{CoreError, CoreResult};
pub use kubenames::{KubeNames, Workload};
pub use types::*;
