//! The `Platform` trait every infrastructure backend implements.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use crm_core::sanitize::dns_sanitize;
use crm_core::{App, AppInst, AppInstRuntime, CloudletInfo, ClusterInst, DeploymentType, ExecRequest, KubeNames};
use serde::Serialize;

use crate::client::PlatformClient;
use crate::container;
use crate::error::{PlatformError, PlatformResult};

/// Capabilities a backend advertises to the orchestrator and controller.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Features {
    pub supports_multi_tenant_cluster: bool,
    pub supports_kubernetes_only: bool,
    /// Cloudlet services (proxies, shepherd) run on the CRM host itself.
    pub cloudlet_services_local: bool,
    pub is_fake: bool,
}

#[async_trait]
pub trait Platform: Send + Sync {
    fn name(&self) -> &str;

    fn features(&self) -> Features;

    /// Fill in capacity and flavors for this cloudlet.
    async fn gather_cloudlet_info(&self, info: &mut CloudletInfo) -> PlatformResult<()>;

    async fn create_cluster_inst(&self, cluster_inst: &ClusterInst, timeout: Duration) -> PlatformResult<()>;

    async fn update_cluster_inst(&self, cluster_inst: &ClusterInst) -> PlatformResult<()>;

    /// Succeeds when the cluster is already gone.
    async fn delete_cluster_inst(&self, cluster_inst: &ClusterInst) -> PlatformResult<()>;

    /// Client for the host that runs platform-level commands.
    fn client(&self) -> Arc<dyn PlatformClient>;

    /// Client with access to a cluster's kubeconfig.
    async fn cluster_client(&self, _cluster_inst: &ClusterInst) -> PlatformResult<Arc<dyn PlatformClient>> {
        Ok(self.client())
    }

    async fn master_ip(&self, names: &KubeNames) -> PlatformResult<String>;

    async fn docker_network_name(&self, names: &KubeNames) -> PlatformResult<String>;

    /// Shell command that serves an exec request inside the AppInst.
    async fn container_command(
        &self,
        cluster_inst: &ClusterInst,
        app: &App,
        app_inst: &AppInst,
        req: &ExecRequest,
    ) -> PlatformResult<String> {
        let names = KubeNames::new(cluster_inst, app, app_inst)?;
        container::container_command(app, app_inst, &names, req)
    }

    async fn app_inst_runtime(
        &self,
        cluster_inst: &ClusterInst,
        app: &App,
        app_inst: &AppInst,
    ) -> PlatformResult<AppInstRuntime> {
        let client = self.cluster_client(cluster_inst).await?;
        match app.deployment {
            DeploymentType::Kubernetes | DeploymentType::Helm => {
                let names = KubeNames::new(cluster_inst, app, app_inst)?;
                container::k8s_runtime(client.as_ref(), &names, app).await
            }
            DeploymentType::Docker => container::docker_runtime(client.as_ref(), app).await,
            DeploymentType::Vm => Ok(AppInstRuntime::default()),
        }
    }

    /// Called before this instance is published as active.
    async fn become_active(&self) -> PlatformResult<()> {
        Ok(())
    }

    /// Hosts that run reverse proxies and hold TLS certs.
    async fn list_load_balancers(&self) -> PlatformResult<Vec<String>>;

    async fn load_balancer_client(&self, name: &str) -> PlatformResult<Arc<dyn PlatformClient>> {
        if self.list_load_balancers().await?.iter().any(|lb| lb == name) {
            Ok(self.client())
        } else {
            Err(PlatformError::NotFound(format!("load balancer {name}")))
        }
    }

    /// Make `name` acceptable as an infrastructure resource name.
    fn name_sanitize(&self, name: &str) -> String {
        dns_sanitize(name)
    }
}
