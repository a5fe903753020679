//! Subsystem assembly for the daemon.
//!
//! ```text
//!   controller ──POST /api/v1/sync──▶ crm-api ──▶ CacheSet ──▶ Orchestrator ──▶ Platform
//!        ▲                                           │
//!        └──────POST /api/v1/status── StatusPublisher┘
//!
//!   HighAvailabilityManager ──ActiveHandle──▶ Orchestrator, CertManager,
//!                                             ExecRouter, StatusPublisher
//! ```

use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, anyhow, bail};
use crm_api::{ApiState, build_router};
use crm_core::{CloudletKey, CrmConfig, HaRole};
use crm_ha::{FileLeaseStore, HighAvailabilityManager};
use crm_orchestrator::{CertManager, ExecRouter, Orchestrator};
use crm_platform::{PlatformInit, new_platform};
use crm_state::CacheSet;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{error, info, warn};

use crate::publisher::StatusPublisher;
use crate::watcher::CrmWatcher;

/// Everything the daemon needs beyond its listener.
#[derive(Debug, Clone, Default)]
pub struct DaemonOptions {
    pub config: CrmConfig,
    pub cloudlet_key: CloudletKey,
    /// `None` runs without HA: always active, no lease.
    pub ha_role: Option<HaRole>,
    /// Lease file shared by the primary and the secondary.
    pub lease_path: Option<PathBuf>,
    /// Controller addresses that receive status.
    pub notify_addrs: Vec<String>,
    pub access_key: Option<String>,
}

/// Election for `opts.ha_role`. A primary or secondary needs a lease
/// store shared with its peer; without one both would go active.
pub(crate) fn ha_manager(opts: &DaemonOptions) -> anyhow::Result<HighAvailabilityManager> {
    let Some(role) = opts.ha_role else {
        return Ok(HighAvailabilityManager::disabled());
    };
    let Some(path) = &opts.lease_path else {
        bail!(
            "--ha-role {} needs --lease-path shared with the other instance; use --ha-role disabled to run without HA",
            role.as_str()
        );
    };
    let mut ha = opts.config.ha.clone();
    if ha.node_group_key.is_empty() {
        ha.node_group_key = opts.cloudlet_key.to_string();
    }
    info!(lease = %path.display(), node_group = %ha.node_group_key, "using shared lease file");
    Ok(HighAvailabilityManager::new(role, ha, Arc::new(FileLeaseStore::new(path))))
}

/// Run every subsystem until `shutdown` resolves.
///
/// Returns an error when HA reports that exclusivity was lost; the
/// supervisor should restart the process.
pub async fn run(
    opts: DaemonOptions,
    listener: TcpListener,
    shutdown: impl Future<Output = ()>,
) -> anyhow::Result<()> {
    let config = opts.config.clone();
    config.validate()?;
    info!(
        cloudlet = %opts.cloudlet_key,
        platform = %config.platform.name,
        role = opts.ha_role.map_or("disabled", |r| r.as_str()),
        "CRM daemon starting"
    );

    // ── Initialize subsystems ──────────────────────────────────

    let caches = CacheSet::new();
    let platform = new_platform(
        &config.platform.name,
        PlatformInit {
            config: config.platform.clone(),
            caches: caches.clone(),
            cloudlet_key: opts.cloudlet_key.clone(),
        },
    )?;

    let ha = ha_manager(&opts)?;
    let active = ha.handle();

    let orchestrator = Orchestrator::new(caches.clone(), platform.clone(), config.clone(), active.clone())?;
    orchestrator.attach();

    let certs = Arc::new(CertManager::new(platform.clone(), config.clone(), active.clone()));
    let exec = ExecRouter::new(caches.clone(), platform.clone(), active.clone());

    let publisher = Arc::new(StatusPublisher::new(opts.notify_addrs.clone(), active.clone()));
    publisher.watch(&caches);

    let watcher = Arc::new(CrmWatcher::new(
        platform.clone(),
        orchestrator.clone(),
        certs.clone(),
        opts.cloudlet_key.clone(),
        ha.role(),
    ));

    // ── Background tasks ───────────────────────────────────────

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let mut ha_task = tokio::spawn(ha.run(watcher, shutdown_rx.clone()));
    let certs_task = tokio::spawn({
        let certs = certs.clone();
        let rx = shutdown_rx.clone();
        async move { certs.run(rx).await }
    });
    let publisher_task = tokio::spawn({
        let publisher = publisher.clone();
        let rx = shutdown_rx.clone();
        async move { publisher.run(rx).await }
    });

    // ── API server ─────────────────────────────────────────────

    let mut state = ApiState::new(caches, exec);
    if let Some(key) = &opts.access_key {
        state = state.with_access_key(key.clone());
    }
    let addr = listener.local_addr()?;
    info!(%addr, "API server starting");
    let mut server_rx = shutdown_rx.clone();
    let server = axum::serve(listener, build_router(state)).with_graceful_shutdown(async move {
        let _ = server_rx.wait_for(|stop| *stop).await;
    });
    let server_task = tokio::spawn(async move { server.await });

    let mut ha_done = false;
    let outcome = tokio::select! {
        _ = shutdown => {
            info!("shutdown signal received");
            Ok(())
        }
        res = &mut ha_task => {
            ha_done = true;
            match res {
                Ok(Ok(())) => Ok(()),
                Ok(Err(e)) => {
                    error!(error = %e, "high availability failure, stopping");
                    Err(anyhow!(e))
                }
                Err(e) => Err(anyhow!(e).context("HA task panicked")),
            }
        }
    };

    let _ = shutdown_tx.send(true);
    server_task.await?.context("API server failed")?;
    let _ = certs_task.await;
    let _ = publisher_task.await;
    if !ha_done {
        match ha_task.await {
            Ok(Err(e)) => warn!(error = %e, "HA stopped with an error"),
            Err(e) => warn!(error = %e, "HA task panicked"),
            Ok(Ok(())) => {}
        }
    }

    info!("CRM daemon stopped");
    outcome
}

#[cfg(test)]
mod tests {
    use super::*;

    fn opts(role: HaRole, lease_path: Option<PathBuf>) -> DaemonOptions {
        DaemonOptions {
            cloudlet_key: CloudletKey::new("TMUS", "cloud2"),
            ha_role: Some(role),
            lease_path,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn ha_roles_require_a_shared_lease() {
        for role in [HaRole::Primary, HaRole::Secondary] {
            let err = ha_manager(&opts(role, None)).err().unwrap();
            assert!(err.to_string().contains("needs --lease-path"), "{err}");
        }
        let disabled = DaemonOptions::default();
        assert!(ha_manager(&disabled).unwrap().handle().is_active());
    }

    #[tokio::test]
    async fn pair_on_one_lease_file_has_one_active() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("lease.redb");
        let mut primary = ha_manager(&opts(HaRole::Primary, Some(path.clone()))).unwrap();
        let mut secondary = ha_manager(&opts(HaRole::Secondary, Some(path))).unwrap();
        assert_eq!(primary.role(), HaRole::Primary);

        let primary_won = primary.try_active().await.unwrap();
        let secondary_won = secondary.try_active().await.unwrap();
        assert!(primary_won);
        assert!(!secondary_won);
    }

    #[tokio::test]
    async fn run_fails_fast_without_a_lease() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let err = run(opts(HaRole::Secondary, None), listener, async {}).await.unwrap_err();
        assert!(err.to_string().contains("needs --lease-path"));
    }
}
