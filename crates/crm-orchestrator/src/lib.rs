//! crm-orchestrator — turns desired state into infrastructure operations.
//!
//! # Architecture
//!
//! ```text
//!   CacheSet (desired) ──▶ Orchestrator ──▶ AppInstDeployer ──┬─▶ Proxy (nginx/envoy)
//!          ▲                  │                               ├─▶ KubeDeployment
//!          │                  │                               ├─▶ HelmDeployment
//!   CacheSet (status) ◀───────┘                               └─▶ DockerDeployment
//!
//!   ExecRouter ──▶ Platform::container_command ──▶ session (stdin/stdout/stderr)
//!   CertManager ──▶ load balancers (cert.pem / key.pem)
//! ```
//!
//! Everything runs against `crm_platform::Platform`, so the same code
//! drives kind, dind and the in-memory fake.

pub mod appinst;
pub mod certs;
pub mod docker;
pub mod error;
pub mod exec;
pub mod helm;
pub mod k8s;
pub mod network_policy;
pub mod proxy;
pub mod vars;
pub mod worker;

pub use appinst::AppInstDeployer;
pub use certs::{CertManager, TlsCert};
pub use error::{OrchestratorError, OrchestratorResult};
pub use exec::{ExecRouter, ExecSession};
pub use network_policy::network_policy;
pub use vars::{DeploymentVars, replace_deployment_vars};
pub use worker::Orchestrator;
