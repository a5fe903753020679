//! Shared base for the container-in-container backends (kind, dind).
//!
//! Both run everything on the CRM host through one client, report the
//! flavors the controller sent as the cloudlet's flavors, and serve load
//! balancing from the host itself.

use std::sync::Arc;

use crm_core::config::PlatformConfig;
use crm_core::sanitize::k8s_sanitize;
use crm_core::{CloudletInfo, ClusterInst};
use crm_state::CacheSet;
use tracing::debug;

use crate::client::PlatformClient;
use crate::error::PlatformResult;
use crate::platform::Features;

/// Name of the only load balancer an xind cloudlet has.
pub const LOCAL_LOAD_BALANCER: &str = "localhost";

pub struct Xind {
    client: Arc<dyn PlatformClient>,
    caches: CacheSet,
    config: PlatformConfig,
}

impl Xind {
    pub fn new(client: Arc<dyn PlatformClient>, caches: CacheSet, config: PlatformConfig) -> Self {
        Self {
            client,
            caches,
            config,
        }
    }

    pub fn client(&self) -> Arc<dyn PlatformClient> {
        self.client.clone()
    }

    pub fn config(&self) -> &PlatformConfig {
        &self.config
    }

    pub fn features(&self) -> Features {
        Features {
            supports_multi_tenant_cluster: true,
            supports_kubernetes_only: false,
            cloudlet_services_local: true,
            is_fake: false,
        }
    }

    pub fn gather_cloudlet_info(&self, info: &mut CloudletInfo) -> PlatformResult<()> {
        info.flavors = self.caches.flavor_infos();
        debug!(flavors = info.flavors.len(), "xind cloudlet info");
        Ok(())
    }

    /// Management nodes are not tracked for local clusters.
    pub fn list_mgmt_nodes(&self) -> Vec<String> {
        Vec::new()
    }

    pub fn list_load_balancers(&self) -> Vec<String> {
        vec![LOCAL_LOAD_BALANCER.to_string()]
    }
}

/// Cluster name shared by kind and dind: cluster name plus org, sanitized.
pub fn cluster_name(cluster_inst: &ClusterInst) -> String {
    k8s_sanitize(&format!(
        "{}{}",
        cluster_inst.key.cluster_key.name, cluster_inst.key.organization
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crm_core::{Flavor, FlavorKey};

    use crate::fake::FakeClient;

    #[test]
    fn flavors_come_from_the_cache() {
        let caches = CacheSet::new();
        caches.flavors.update(
            Flavor {
                key: FlavorKey {
                    name: "m4.small".to_string(),
                },
                ram: 2048,
                vcpus: 2,
                disk: 20,
            },
            1,
        );
        let xind = Xind::new(Arc::new(FakeClient::new()), caches, PlatformConfig::default());
        let mut info = CloudletInfo::default();
        xind.gather_cloudlet_info(&mut info).unwrap();
        assert_eq!(info.flavors.len(), 1);
        assert_eq!(info.flavors[0].name, "m4.small");
        assert!(xind.list_mgmt_nodes().is_empty());
        assert_eq!(xind.list_load_balancers(), vec!["localhost".to_string()]);
    }
}
