//! AppInst create, update and delete across deployment types.
//!
//! ```text
//! create ──▶ docker? ──yes──▶ docker run / compose up
//!              │no
//!              ▼
//!         KubeNames ─▶ master ip, network ─▶ proxy ─▶ render ─▶ apply/install
//!                                                               ─▶ wait pods
//!                                                               ─▶ patch svc IPs
//! ```
//!
//! Anything that fails after the proxy exists is undone: the workload is
//! deleted, then the proxy. Undo errors are logged; the caller sees the
//! error that caused the undo.

use std::sync::Arc;

use crm_core::config::CrmConfig;
use crm_core::{App, AppInst, ClusterInst, DeploymentType, KubeNames};
use crm_platform::container::docker_container_name;
use crm_platform::{Platform, PlatformClient};
use tracing::{info, warn};

use crate::docker::DockerDeployment;
use crate::error::{OrchestratorError, OrchestratorResult};
use crate::helm::HelmDeployment;
use crate::k8s::{KubeDeployment, render_manifest};
use crate::proxy::{Proxy, ProxyOptions};
use crate::vars::DeploymentVars;

/// Drives AppInst lifecycles against one platform.
#[derive(Clone)]
pub struct AppInstDeployer {
    platform: Arc<dyn Platform>,
    config: CrmConfig,
}

/// Proxy container suffix. AppInsts on a multi-tenant cluster share the
/// load balancer, so they are told apart by namespace.
fn proxy_name(names: &KubeNames, app: &App) -> String {
    match &names.multitenant_namespace {
        Some(ns) => ns.clone(),
        None => docker_container_name(&app.key),
    }
}

impl AppInstDeployer {
    pub fn new(platform: Arc<dyn Platform>, config: CrmConfig) -> Self {
        Self { platform, config }
    }

    pub fn platform(&self) -> &Arc<dyn Platform> {
        &self.platform
    }

    fn proxy_options(&self, docker_network: &str) -> ProxyOptions {
        ProxyOptions {
            docker_network: docker_network.to_string(),
            publish_ports: docker_network != "host",
            certs_dir: self.config.certs.certs_dir.clone(),
        }
    }

    fn vars(&self, cluster_inst: &ClusterInst, app: &App, master_ip: &str) -> DeploymentVars {
        DeploymentVars::new(cluster_inst, app, master_ip, &self.config.platform.app_dns_root)
    }

    pub async fn create(&self, cluster_inst: &ClusterInst, app: &App, app_inst: &AppInst) -> OrchestratorResult<()> {
        info!(app_inst = %app_inst.key, deployment = %app.deployment, "creating app inst");
        let client = self.platform.cluster_client(cluster_inst).await?;
        match app.deployment {
            DeploymentType::Docker => {
                return DockerDeployment::new(client.as_ref(), cluster_inst, app, &self.config.platform.config_dir)
                    .create()
                    .await;
            }
            DeploymentType::Vm => {
                return Err(OrchestratorError::Unsupported(format!(
                    "unsupported deployment type {} for app inst",
                    app.deployment
                )));
            }
            DeploymentType::Kubernetes | DeploymentType::Helm => {}
        }

        let names = KubeNames::new(cluster_inst, app, app_inst)?;
        let master_ip = self.platform.master_ip(&names).await?;
        let network = self.platform.docker_network_name(&names).await?;
        let lb = self.platform.client();
        let proxy = Proxy::new(lb.as_ref(), &proxy_name(&names, app), self.proxy_options(&network));
        if !app_inst.mapped_ports.is_empty() {
            proxy.create(&master_ip, &app_inst.mapped_ports).await?;
        }

        let deployed = self
            .deploy_workload(client.as_ref(), cluster_inst, app, app_inst, &names, &master_ip)
            .await;
        if let Err(e) = deployed {
            warn!(app_inst = %app_inst.key, error = %e, "app inst create failed, undoing");
            if let Err(undo) = self.delete_workload(client.as_ref(), app, &names).await {
                warn!(app_inst = %app_inst.key, error = %undo, "undo of workload failed");
            }
            if !app_inst.mapped_ports.is_empty() {
                if let Err(undo) = proxy.delete().await {
                    warn!(app_inst = %app_inst.key, error = %undo, "undo of proxy failed");
                }
            }
            return Err(e);
        }
        info!(app_inst = %app_inst.key, "app inst created");
        Ok(())
    }

    async fn deploy_workload(
        &self,
        client: &dyn PlatformClient,
        cluster_inst: &ClusterInst,
        app: &App,
        app_inst: &AppInst,
        names: &KubeNames,
        master_ip: &str,
    ) -> OrchestratorResult<()> {
        let vars = self.vars(cluster_inst, app, master_ip);
        let kube = KubeDeployment::new(
            client,
            names,
            &self.config.orchestrator,
            &self.config.platform.config_dir,
        );
        match app.deployment {
            DeploymentType::Kubernetes => {
                let manifest = render_manifest(app, names, &app_inst.mapped_ports, &vars)?;
                kube.create(&manifest).await?;
            }
            DeploymentType::Helm => {
                HelmDeployment::new(client, names, &self.config.platform.config_dir)
                    .install(app, &vars)
                    .await?;
            }
            other => {
                return Err(OrchestratorError::Unsupported(format!(
                    "unsupported deployment type {other} for app inst"
                )));
            }
        }
        kube.patch_external_ips(master_ip).await
    }

    async fn delete_workload(&self, client: &dyn PlatformClient, app: &App, names: &KubeNames) -> OrchestratorResult<()> {
        let config_dir = &self.config.platform.config_dir;
        match app.deployment {
            DeploymentType::Kubernetes => {
                KubeDeployment::new(client, names, &self.config.orchestrator, config_dir)
                    .delete()
                    .await
            }
            DeploymentType::Helm => HelmDeployment::new(client, names, config_dir).delete().await,
            DeploymentType::Docker | DeploymentType::Vm => Ok(()),
        }
    }

    /// Remove the workload, then its proxy. Parts already gone are skipped.
    pub async fn delete(&self, cluster_inst: &ClusterInst, app: &App, app_inst: &AppInst) -> OrchestratorResult<()> {
        info!(app_inst = %app_inst.key, "deleting app inst");
        let client = self.platform.cluster_client(cluster_inst).await?;
        if app.deployment == DeploymentType::Docker {
            return DockerDeployment::new(client.as_ref(), cluster_inst, app, &self.config.platform.config_dir)
                .delete()
                .await;
        }
        let names = KubeNames::new(cluster_inst, app, app_inst)?;
        self.delete_workload(client.as_ref(), app, &names)
            .await?;

        if !app_inst.mapped_ports.is_empty() {
            let network = self.platform.docker_network_name(&names).await?;
            let lb = self.platform.client();
            Proxy::new(lb.as_ref(), &proxy_name(&names, app), self.proxy_options(&network))
                .delete()
                .await?;
        }
        Ok(())
    }

    /// Re-render and re-apply. Only Kubernetes and Helm AppInsts update in
    /// place.
    pub async fn update(&self, cluster_inst: &ClusterInst, app: &App, app_inst: &AppInst) -> OrchestratorResult<()> {
        if !matches!(app.deployment, DeploymentType::Kubernetes | DeploymentType::Helm) {
            return Err(OrchestratorError::Unsupported(format!(
                "UpdateAppInst not supported for deployment: {}",
                app.deployment
            )));
        }
        info!(app_inst = %app_inst.key, "updating app inst");
        let client = self.platform.cluster_client(cluster_inst).await?;
        let names = KubeNames::new(cluster_inst, app, app_inst)?;
        let master_ip = self.platform.master_ip(&names).await?;
        let vars = self.vars(cluster_inst, app, &master_ip);

        if app.deployment == DeploymentType::Helm {
            return HelmDeployment::new(client.as_ref(), &names, &self.config.platform.config_dir)
                .upgrade(app, &vars)
                .await;
        }
        let manifest = render_manifest(app, &names, &app_inst.mapped_ports, &vars)?;
        KubeDeployment::new(
            client.as_ref(),
            &names,
            &self.config.orchestrator,
            &self.config.platform.config_dir,
        )
        .update(&manifest)
        .await
    }
}
