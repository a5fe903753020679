//! dind backend: each Kubernetes ClusterInst gets its own docker network
//! `kubeadm-dind-net-{name}-{id}` with a master container at
//! `10.192.{id}.2`.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use crm_core::kubenames::kconf_name;
use crm_core::{CloudletInfo, ClusterInst, DeploymentType, KubeNames};
use regex::Regex;
use tracing::{debug, info};

use crate::client::PlatformClient;
use crate::error::{PlatformError, PlatformResult};
use crate::platform::{Features, Platform};
use crate::xind::{Xind, cluster_name};

pub const DIND_IMAGE: &str = "mirantis/kubeadm-dind-cluster:v1.14";

const MAX_CLUSTER_ID: u32 = 254;

/// A running dind cluster.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DindCluster {
    pub name: String,
    pub id: u32,
}

impl DindCluster {
    pub fn network(&self) -> String {
        format!("kubeadm-dind-net-{}-{}", self.name, self.id)
    }

    pub fn master(&self) -> String {
        format!("kube-master-{}-{}", self.name, self.id)
    }

    pub fn master_addr(&self) -> String {
        format!("10.192.{}.2", self.id)
    }
}

pub struct DindPlatform {
    base: Xind,
    networks: Regex,
    masters: Regex,
}

fn tolerate_missing(result: PlatformResult<()>) -> PlatformResult<()> {
    match result {
        Err(e) if e.output_contains("No such") => {
            debug!(error = %e, "already removed");
            Ok(())
        }
        other => other,
    }
}

impl DindPlatform {
    pub fn new(base: Xind) -> PlatformResult<Self> {
        let compile = |re: &str| Regex::new(re).map_err(|e| PlatformError::Invalid(e.to_string()));
        Ok(Self {
            base,
            networks: compile(r"^kubeadm-dind-net-(\S+)-(\d+)$")?,
            masters: compile(r"^kube-master-(\S+)-(\d+)$")?,
        })
    }

    fn parse(re: &Regex, out: &str) -> Vec<DindCluster> {
        out.lines()
            .filter_map(|line| re.captures(line.trim()))
            .filter_map(|caps| {
                Some(DindCluster {
                    name: caps.get(1)?.as_str().to_string(),
                    id: caps.get(2)?.as_str().parse().ok()?,
                })
            })
            .collect()
    }

    /// Clusters that have a network, whether or not the master runs.
    pub async fn clusters(&self) -> PlatformResult<Vec<DindCluster>> {
        let out = self
            .base
            .client()
            .output("docker network ls --format \"{{.Name}}\"")
            .await?;
        Ok(Self::parse(&self.networks, &out))
    }

    async fn find(&self, name: &str) -> PlatformResult<Option<DindCluster>> {
        Ok(self.clusters().await?.into_iter().find(|c| c.name == name))
    }

    async fn running_master(&self, name: &str) -> PlatformResult<DindCluster> {
        let out = self
            .base
            .client()
            .output("docker ps --format \"{{.Names}}\"")
            .await?;
        Self::parse(&self.masters, &out)
            .into_iter()
            .find(|c| c.name == name)
            .ok_or_else(|| PlatformError::NotFound(format!("dind cluster {name}")))
    }

    async fn create(&self, cluster_inst: &ClusterInst) -> PlatformResult<()> {
        let name = cluster_name(cluster_inst);
        let existing = self.clusters().await?;
        if existing.iter().any(|c| c.name == name) {
            return Err(PlatformError::Invalid(format!("dind cluster {name} already exists")));
        }
        let used: BTreeSet<u32> = existing.iter().map(|c| c.id).collect();
        let id = (1..=MAX_CLUSTER_ID)
            .find(|id| !used.contains(id))
            .ok_or_else(|| PlatformError::Invalid("no free dind cluster ids".into()))?;
        let cluster = DindCluster { name, id };

        let client = self.base.client();
        info!(name = %cluster.name, id, "creating dind cluster");
        client
            .run(&format!(
                "docker network create --driver bridge --subnet 10.192.{id}.0/24 {}",
                cluster.network()
            ))
            .await?;

        let started = client
            .run(&format!(
                "docker run -d --privileged --name={} --hostname kube-master --network={} --ip={} {DIND_IMAGE}",
                cluster.master(),
                cluster.network(),
                cluster.master_addr()
            ))
            .await;
        if let Err(e) = started {
            if let Err(undo) = client.run(&format!("docker network rm {}", cluster.network())).await {
                debug!(error = %undo, "undo dind network failed");
            }
            return Err(e);
        }

        client
            .run(&format!(
                "docker exec {} cat /etc/kubernetes/admin.conf > {}",
                cluster.master(),
                kconf_name(cluster_inst)
            ))
            .await?;
        Ok(())
    }
}

#[async_trait]
impl Platform for DindPlatform {
    fn name(&self) -> &str {
        "dind"
    }

    fn features(&self) -> Features {
        self.base.features()
    }

    async fn gather_cloudlet_info(&self, info: &mut CloudletInfo) -> PlatformResult<()> {
        self.base.gather_cloudlet_info(info)
    }

    async fn create_cluster_inst(&self, cluster_inst: &ClusterInst, timeout: Duration) -> PlatformResult<()> {
        if cluster_inst.deployment == DeploymentType::Docker {
            return Ok(());
        }
        tokio::time::timeout(timeout, self.create(cluster_inst))
            .await
            .map_err(|_| {
                PlatformError::Invalid(format!(
                    "timed out creating dind cluster {} after {timeout:?}",
                    cluster_inst.key
                ))
            })?
    }

    async fn update_cluster_inst(&self, _cluster_inst: &ClusterInst) -> PlatformResult<()> {
        Err(PlatformError::Unsupported("update cluster not supported for DIND".into()))
    }

    async fn delete_cluster_inst(&self, cluster_inst: &ClusterInst) -> PlatformResult<()> {
        if cluster_inst.deployment == DeploymentType::Docker {
            return Ok(());
        }
        let name = cluster_name(cluster_inst);
        let Some(cluster) = self.find(&name).await? else {
            info!(%name, "dind cluster already gone");
            return Ok(());
        };
        let client = self.base.client();
        tolerate_missing(client.run(&format!("docker rm -f {}", cluster.master())).await)?;
        tolerate_missing(client.run(&format!("docker network rm {}", cluster.network())).await)?;
        client
            .run(&format!("rm -f {}", kconf_name(cluster_inst)))
            .await?;
        Ok(())
    }

    fn client(&self) -> Arc<dyn PlatformClient> {
        self.base.client()
    }

    async fn master_ip(&self, names: &KubeNames) -> PlatformResult<String> {
        Ok(self.running_master(&names.cluster_name).await?.master_addr())
    }

    async fn docker_network_name(&self, names: &KubeNames) -> PlatformResult<String> {
        Ok(self.running_master(&names.cluster_name).await?.network())
    }

    async fn list_load_balancers(&self) -> PlatformResult<Vec<String>> {
        Ok(self.base.list_load_balancers())
    }
}
