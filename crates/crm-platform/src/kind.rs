//! kind backend: one kind cluster per Kubernetes ClusterInst.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use crm_core::kubenames::{k8s_node_name_suffix, kconf_name};
use crm_core::{CloudletInfo, ClusterInst, DeploymentType, KubeNames};
use tracing::{info, warn};

use crate::client::PlatformClient;
use crate::error::{PlatformError, PlatformResult};
use crate::platform::{Features, Platform};
use crate::xind::Xind;

pub const DEFAULT_KIND_IMAGE: &str = "kindest/node:v1.17.17";

const NO_CLUSTERS: &str = "No kind clusters found";

pub struct KindPlatform {
    base: Xind,
    image: String,
}

impl KindPlatform {
    /// Node image comes from `KIND_IMAGE` when set.
    pub fn new(base: Xind) -> Self {
        let image = std::env::var("KIND_IMAGE").unwrap_or_else(|_| DEFAULT_KIND_IMAGE.to_string());
        Self { base, image }
    }

    pub fn with_image(mut self, image: &str) -> Self {
        self.image = image.to_string();
        self
    }

    /// kind cluster config with one entry per master and worker.
    pub fn cluster_config(&self, cluster_inst: &ClusterInst) -> String {
        let mut config = String::from(
            "kind: Cluster\napiVersion: kind.x-k8s.io/v1alpha4\nnetworking:\n  disableDefaultCNI: true\nnodes:\n",
        );
        for _ in 0..cluster_inst.num_masters.max(1) {
            config.push_str(&format!("- role: control-plane\n  image: {}\n", self.image));
        }
        for _ in 0..cluster_inst.num_nodes {
            config.push_str(&format!("- role: worker\n  image: {}\n", self.image));
        }
        config
    }

    async fn clusters(&self) -> PlatformResult<Vec<String>> {
        let out = self.base.client().output("kind get clusters").await?;
        if out.contains(NO_CLUSTERS) {
            return Ok(Vec::new());
        }
        Ok(out
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .map(String::from)
            .collect())
    }

    async fn create(&self, cluster_inst: &ClusterInst) -> PlatformResult<()> {
        let client = self.base.client();
        let name = k8s_node_name_suffix(&cluster_inst.key);
        let kconf = kconf_name(cluster_inst);
        let config_file = format!("{name}-config.yaml");

        client
            .write_file(&config_file, &self.cluster_config(cluster_inst), "kind config", false)
            .await?;
        info!(%name, image = %self.image, "creating kind cluster");
        client
            .run(&format!(
                "kind create cluster --config={config_file} --kubeconfig={kconf} --name={name}"
            ))
            .await?;

        // kind comes up without a CNI; install weave.
        client
            .run(&format!(
                "KUBECONFIG={kconf} kubectl apply -f \"https://cloud.weave.works/k8s/net?k8s-version=$(KUBECONFIG={kconf} kubectl version | base64 | tr -d '\\n')\""
            ))
            .await?;
        Ok(())
    }

    async fn control_plane_inspect(&self, names: &KubeNames, format: &str) -> PlatformResult<String> {
        let out = self
            .base
            .client()
            .output(&format!(
                "docker inspect -f '{format}' {}-control-plane",
                names.k8s_node_name_suffix
            ))
            .await?;
        out.lines()
            .map(str::trim)
            .find(|l| !l.is_empty())
            .map(String::from)
            .ok_or_else(|| {
                PlatformError::NotFound(format!("control plane of {}", names.k8s_node_name_suffix))
            })
    }
}

#[async_trait]
impl Platform for KindPlatform {
    fn name(&self) -> &str {
        "kind"
    }

    fn features(&self) -> Features {
        self.base.features()
    }

    async fn gather_cloudlet_info(&self, info: &mut CloudletInfo) -> PlatformResult<()> {
        self.base.gather_cloudlet_info(info)
    }

    async fn create_cluster_inst(&self, cluster_inst: &ClusterInst, timeout: Duration) -> PlatformResult<()> {
        match cluster_inst.deployment {
            DeploymentType::Docker => return Ok(()),
            DeploymentType::Kubernetes => {}
            _ => {
                return Err(PlatformError::Unsupported(
                    "Only K8s and Docker clusters are supported on KIND".into(),
                ));
            }
        }
        tokio::time::timeout(timeout, self.create(cluster_inst))
            .await
            .map_err(|_| {
                PlatformError::Invalid(format!(
                    "timed out creating kind cluster {} after {timeout:?}",
                    cluster_inst.key
                ))
            })?
    }

    async fn update_cluster_inst(&self, _cluster_inst: &ClusterInst) -> PlatformResult<()> {
        Err(PlatformError::Unsupported("update cluster not supported for KIND".into()))
    }

    async fn delete_cluster_inst(&self, cluster_inst: &ClusterInst) -> PlatformResult<()> {
        if cluster_inst.deployment == DeploymentType::Docker {
            return Ok(());
        }
        let name = k8s_node_name_suffix(&cluster_inst.key);
        if !self.clusters().await?.contains(&name) {
            info!(%name, "kind cluster already gone");
            return Ok(());
        }
        let client = self.base.client();
        if let Err(e) = client.run(&format!("kind delete cluster --name={name}")).await {
            if !e.output_contains("not found") {
                return Err(e);
            }
            warn!(%name, "kind cluster vanished during delete");
        }
        client
            .run(&format!("rm -f {name}-config.yaml {}", kconf_name(cluster_inst)))
            .await?;
        Ok(())
    }

    fn client(&self) -> Arc<dyn PlatformClient> {
        self.base.client()
    }

    async fn master_ip(&self, names: &KubeNames) -> PlatformResult<String> {
        self.control_plane_inspect(names, "{{range .NetworkSettings.Networks}}{{.IPAddress}}{{end}}")
            .await
    }

    async fn docker_network_name(&self, names: &KubeNames) -> PlatformResult<String> {
        self.control_plane_inspect(names, "{{.HostConfig.NetworkMode}}")
            .await
    }

    async fn list_load_balancers(&self) -> PlatformResult<Vec<String>> {
        Ok(self.base.list_load_balancers())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crm_core::config::PlatformConfig;
    use crm_core::{CloudletKey, ClusterInstKey};
    use crm_state::CacheSet;

    use crate::fake::FakeClient;

    fn platform(client: &FakeClient) -> KindPlatform {
        let base = Xind::new(Arc::new(client.clone()), CacheSet::new(), PlatformConfig::default());
        KindPlatform::new(base).with_image("kindest/node:test")
    }

    fn cluster() -> ClusterInst {
        ClusterInst {
            key: ClusterInstKey::new("c1", CloudletKey::new("TMUS", "cloud2"), "dev"),
            num_masters: 1,
            num_nodes: 2,
            ..Default::default()
        }
    }

    #[test]
    fn config_lists_masters_then_workers() {
        let config = platform(&FakeClient::new()).cluster_config(&cluster());
        assert!(config.starts_with("kind: Cluster\napiVersion: kind.x-k8s.io/v1alpha4\n"));
        assert!(config.contains("disableDefaultCNI: true"));
        assert_eq!(config.matches("- role: control-plane").count(), 1);
        assert_eq!(config.matches("- role: worker").count(), 2);
        assert_eq!(config.matches("image: kindest/node:test").count(), 3);
    }

    #[tokio::test]
    async fn create_runs_kind_then_cni() {
        let client = FakeClient::new();
        let kind = platform(&client);
        kind.create_cluster_inst(&cluster(), Duration::from_secs(60))
            .await
            .unwrap();

        let cmds = client.commands();
        let create = cmds
            .iter()
            .position(|c| {
                c == "kind create cluster --config=cloud2-c1-dev-config.yaml \
                      --kubeconfig=c1.TMUS.kubeconfig --name=cloud2-c1-dev"
            })
            .unwrap();
        assert!(cmds[create + 1].contains("cloud.weave.works"));
        assert!(client.file("cloud2-c1-dev-config.yaml").is_some());
    }

    #[tokio::test]
    async fn docker_clusters_are_a_noop_and_others_rejected() {
        let client = FakeClient::new();
        let kind = platform(&client);
        let mut ci = cluster();
        ci.deployment = DeploymentType::Docker;
        kind.create_cluster_inst(&ci, Duration::from_secs(1)).await.unwrap();
        assert!(client.commands().is_empty());

        ci.deployment = DeploymentType::Helm;
        let err = kind.create_cluster_inst(&ci, Duration::from_secs(1)).await.unwrap_err();
        assert!(err.to_string().contains("Only K8s and Docker"));
        assert!(kind.update_cluster_inst(&ci).await.is_err());
    }

    #[tokio::test]
    async fn delete_of_missing_cluster_succeeds() {
        let client = FakeClient::new();
        client.respond_to("kind get clusters", "No kind clusters found.\n");
        let kind = platform(&client);
        kind.delete_cluster_inst(&cluster()).await.unwrap();
        assert!(!client.ran("kind delete"));
    }

    #[tokio::test]
    async fn delete_existing_cluster() {
        let client = FakeClient::new();
        client.respond_to("kind get clusters", "cloud2-c1-dev\n");
        let kind = platform(&client);
        kind.delete_cluster_inst(&cluster()).await.unwrap();
        assert!(client.ran("kind delete cluster --name=cloud2-c1-dev"));
    }

    #[tokio::test]
    async fn master_ip_from_control_plane() {
        let client = FakeClient::new();
        client.respond_to("NetworkSettings", "172.18.0.2\n");
        let kind = platform(&client);
        let names = KubeNames {
            k8s_node_name_suffix: "cloud2-c1-dev".to_string(),
            ..Default::default()
        };
        assert_eq!(kind.master_ip(&names).await.unwrap(), "172.18.0.2");
        assert!(client.ran("cloud2-c1-dev-control-plane"));
    }
}
