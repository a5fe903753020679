//! crm-platform — the infrastructure backends the CRM drives.
//!
//! # Architecture
//!
//! ```text
//! new_platform(name) ──▶ Arc<dyn Platform>
//!                          ├── FakePlatform ── FakeClient (in-memory)
//!                          ├── KindPlatform ─┐
//!                          └── DindPlatform ─┴─ Xind ── LocalClient (bash)
//!
//! Platform::client() ──▶ Arc<dyn PlatformClient>  (LocalClient | FakeClient)
//! ```
//!
//! The orchestrator only talks to `Platform` and `PlatformClient`; it
//! never knows which backend it runs against.

pub mod client;
pub mod container;
pub mod dind;
pub mod error;
pub mod fake;
pub mod kind;
pub mod platform;
pub mod registry;
pub mod xind;

pub use client::{BoxReader, BoxWriter, Exit, LocalClient, PlatformClient, ShellIo, Started};
pub use error::{PlatformError, PlatformResult};
pub use fake::{FakeClient, FakeFixture, FakePlatform};
pub use platform::{Features, Platform};
pub use registry::{PlatformInit, new_platform, normalize_name, platform_names};
