//! HA hooks for the daemon.
//!
//! Taking over means: let the platform prepare, republish this cloudlet's
//! info with our role, push certs, then replay desired state so anything
//! the previous active left half-done gets finished.

use std::sync::Arc;

use anyhow::Context;
use async_trait::async_trait;
use crm_core::{CloudletKey, HaRole};
use crm_ha::HaWatcher;
use crm_orchestrator::{CertManager, Orchestrator};
use crm_platform::Platform;
use tracing::{info, warn};

pub struct CrmWatcher {
    platform: Arc<dyn Platform>,
    orchestrator: Orchestrator,
    certs: Arc<CertManager>,
    cloudlet_key: CloudletKey,
    role: HaRole,
}

impl CrmWatcher {
    pub fn new(
        platform: Arc<dyn Platform>,
        orchestrator: Orchestrator,
        certs: Arc<CertManager>,
        cloudlet_key: CloudletKey,
        role: HaRole,
    ) -> Self {
        Self {
            platform,
            orchestrator,
            certs,
            cloudlet_key,
            role,
        }
    }

    async fn publish_info(&self) {
        match self
            .orchestrator
            .publish_cloudlet_info(&self.cloudlet_key, self.role.as_str())
            .await
        {
            Ok(info) => info!(cloudlet = %self.cloudlet_key, state = ?info.state, "cloudlet info published"),
            Err(e) => warn!(cloudlet = %self.cloudlet_key, error = %e, "cloudlet info not published"),
        }
    }
}

#[async_trait]
impl HaWatcher for CrmWatcher {
    async fn active_changed_pre_switch(&self) -> anyhow::Result<()> {
        self.platform
            .become_active()
            .await
            .with_context(|| format!("platform {} could not become active", self.platform.name()))
    }

    async fn active_changed_post_switch(&self) -> anyhow::Result<()> {
        info!(role = %self.role.as_str(), "took over as active CRM");
        self.publish_info().await;
        let installed = self.certs.refresh_now().await.context("refreshing certs after switchover")?;
        info!(installed, "certs refreshed after switchover");
        self.orchestrator.reconcile_all();
        Ok(())
    }

    async fn platform_active_on_startup(&self) {
        info!(role = %self.role.as_str(), "active on startup");
        self.publish_info().await;
        if let Err(e) = self.certs.ensure_installed().await {
            warn!(error = %e, "initial cert install failed");
        }
        self.orchestrator.reconcile_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crm_core::*;
    use crm_ha::ActiveHandle;
    use crm_platform::{FakeFixture, FakePlatform};
    use crm_state::CacheSet;

    fn watcher(caches: &CacheSet) -> (Arc<FakePlatform>, CrmWatcher) {
        let platform = Arc::new(FakePlatform::new(FakeFixture::default()));
        let config = CrmConfig::default();
        let active = ActiveHandle::always_active();
        let orchestrator =
            Orchestrator::new(caches.clone(), platform.clone(), config.clone(), active.clone()).unwrap();
        orchestrator.attach();
        let certs = Arc::new(CertManager::new(platform.clone(), config, active));
        let watcher = CrmWatcher::new(
            platform.clone(),
            orchestrator,
            certs,
            CloudletKey::new("TMUS", "cloud2"),
            HaRole::Secondary,
        );
        (platform, watcher)
    }

    #[tokio::test]
    async fn takeover_publishes_role_and_installs_certs() {
        let caches = CacheSet::new();
        let (_platform, watcher) = watcher(&caches);
        watcher.active_changed_pre_switch().await.unwrap();
        watcher.active_changed_post_switch().await.unwrap();

        let info = caches.cloudlet_infos.get(&CloudletKey::new("TMUS", "cloud2")).unwrap();
        assert_eq!(info.active_crm_role, "secondary");
        assert_eq!(info.state, CloudletState::Ready);
        assert!(watcher.certs.current().await.is_some());
    }

    #[tokio::test]
    async fn startup_replays_desired_state() {
        let caches = CacheSet::new();
        let (_platform, watcher) = watcher(&caches);
        let ci = ClusterInst {
            key: ClusterInstKey::new("c1", CloudletKey::new("TMUS", "cloud2"), "dev"),
            deployment: DeploymentType::Kubernetes,
            state: TrackedState::CreateRequested,
            ..Default::default()
        };
        caches.cluster_insts.update(ci.clone(), 1);
        watcher.orchestrator.wait_idle().await;
        caches.cluster_inst_infos.delete_key(&ci.key, 2);

        watcher.platform_active_on_startup().await;
        watcher.orchestrator.wait_idle().await;
        let info = caches.cluster_inst_infos.get(&ci.key).unwrap();
        assert_eq!(info.state, TrackedState::Ready);
    }
}
