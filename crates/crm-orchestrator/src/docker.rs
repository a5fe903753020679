//! Docker AppInsts: a single container, or a docker-compose project.

use std::path::Path;

use crm_core::sanitize::docker_sanitize;
use crm_core::{App, AppPort, ClusterInst};
use crm_platform::PlatformClient;
use crm_platform::container::docker_container_name;
use tracing::{debug, info};

use crate::error::{OrchestratorError, OrchestratorResult};

/// `-p` arguments publishing `ports`. With `use_public` the container
/// listens on the public ports as well, otherwise host public ports map
/// onto internal ones.
pub fn docker_port_args(ports: &[AppPort], use_public: bool, listen_ip: Option<&str>) -> Vec<String> {
    let ip = listen_ip.map(|ip| format!("{ip}:")).unwrap_or_default();
    ports
        .iter()
        .map(|port| {
            let proto = port.proto.k8s_name().to_ascii_lowercase();
            let (host, host_end) = (port.public_port, port.public_port + port.count() - 1);
            let (inner, inner_end) = if use_public {
                (host, host_end)
            } else {
                (port.internal_port, port.internal_end_port())
            };
            if port.is_range() {
                format!("-p {ip}{host}-{host_end}:{inner}-{inner_end}/{proto}")
            } else {
                format!("-p {ip}{host}:{inner}/{proto}")
            }
        })
        .collect()
}

fn remove_tolerated(e: &crm_platform::PlatformError) -> bool {
    e.output_contains("No such container") || e.output_contains("No such file")
}

pub struct DockerDeployment<'a> {
    client: &'a dyn PlatformClient,
    cluster_inst: &'a ClusterInst,
    app: &'a App,
    config_dir: String,
    network: String,
}

impl<'a> DockerDeployment<'a> {
    pub fn new(
        client: &'a dyn PlatformClient,
        cluster_inst: &'a ClusterInst,
        app: &'a App,
        config_dir: &Path,
    ) -> Self {
        Self {
            client,
            cluster_inst,
            app,
            config_dir: config_dir.display().to_string(),
            network: "host".to_string(),
        }
    }

    /// Run on `network` instead of the host network.
    pub fn with_network(mut self, network: &str) -> Self {
        self.network = network.to_string();
        self
    }

    /// Name of the app's container, or of its compose project directory.
    pub fn container_name(&self) -> String {
        docker_container_name(&self.app.key)
    }

    fn is_compose(&self) -> bool {
        !self.app.deployment_manifest.trim().is_empty()
    }

    fn compose_file(&self) -> String {
        format!("{}/{}/docker-compose.yml", self.config_dir, self.container_name())
    }

    /// The `docker run` command for a single-container app. On the host
    /// network the app's ports are reachable without publishing.
    pub fn run_command(&self) -> String {
        let key = &self.cluster_inst.key;
        let mut cmd = format!(
            "docker run -d -l edge-cloud -l cloudlet={} -l cluster={} -l mexAppName={} -l mexAppVersion={} \
             --restart=unless-stopped --network={} --name={}",
            docker_sanitize(&key.cloudlet_key.name),
            docker_sanitize(&key.cluster_key.name),
            docker_sanitize(&self.app.key.name),
            docker_sanitize(&self.app.key.version),
            self.network,
            self.container_name(),
        );
        cmd.push(' ');
        cmd.push_str(&self.app.image_path);
        if !self.app.command.trim().is_empty() {
            cmd.push(' ');
            cmd.push_str(self.app.command.trim());
        }
        cmd
    }

    pub async fn create(&self) -> OrchestratorResult<()> {
        if self.app.deployment_manifest.ends_with(".zip") {
            return Err(OrchestratorError::Unsupported(
                "zipped docker-compose manifests are not supported".into(),
            ));
        }
        if self.is_compose() {
            let file = self.compose_file();
            self.client
                .run(&format!("mkdir -p {}/{}", self.config_dir, self.container_name()))
                .await?;
            self.client
                .write_file(&file, &self.app.deployment_manifest, "docker compose", false)
                .await?;
            info!(app = %self.app.key, %file, "docker-compose up");
            self.client
                .run(&format!("docker-compose -f {file} up -d"))
                .await?;
            return Ok(());
        }
        if self.app.image_path.is_empty() {
            return Err(OrchestratorError::Invalid(format!(
                "docker app {} has no image path",
                self.app.key
            )));
        }
        info!(app = %self.app.key, name = %self.container_name(), "docker run");
        self.client.run(&self.run_command()).await?;
        Ok(())
    }

    /// Stop and remove the app. Missing containers are skipped.
    pub async fn delete(&self) -> OrchestratorResult<()> {
        if self.is_compose() {
            let file = self.compose_file();
            match self.client.run(&format!("docker-compose -f {file} down")).await {
                Ok(()) => {}
                Err(e) if remove_tolerated(&e) => debug!(%file, "compose project already down"),
                Err(e) => return Err(e.into()),
            }
            self.client
                .delete_dir(&format!("{}/{}", self.config_dir, self.container_name()))
                .await?;
            return Ok(());
        }

        let name = self.container_name();
        for verb in ["stop", "rm"] {
            match self.client.run(&format!("docker {verb} {name}")).await {
                Ok(()) => {}
                Err(e) if remove_tolerated(&e) => {
                    debug!(%name, "container already removed");
                    break;
                }
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crm_core::*;
    use crm_platform::FakeClient;

    fn fixtures() -> (ClusterInst, App) {
        let ci = ClusterInst {
            key: ClusterInstKey::new("dock1", CloudletKey::new("TMUS", "cloud2"), "dev"),
            deployment: DeploymentType::Docker,
            ..Default::default()
        };
        let app = App {
            key: AppKey::new("dev", "web", "1.0"),
            deployment: DeploymentType::Docker,
            image_path: "docker.io/library/nginx:1".to_string(),
            command: "nginx -g 'daemon off;'".to_string(),
            ..Default::default()
        };
        (ci, app)
    }

    #[test]
    fn port_args() {
        let ports = vec![
            AppPort {
                proto: LProto::Tcp,
                internal_port: 80,
                public_port: 10080,
                ..Default::default()
            },
            AppPort {
                proto: LProto::Udp,
                internal_port: 5000,
                public_port: 5000,
                end_port: 5010,
                ..Default::default()
            },
        ];
        assert_eq!(
            docker_port_args(&ports, false, Some("127.0.0.1")),
            vec!["-p 127.0.0.1:10080:80/tcp", "-p 127.0.0.1:5000-5010:5000-5010/udp"]
        );
        assert_eq!(docker_port_args(&ports[..1], true, None), vec!["-p 10080:10080/tcp"]);
    }

    #[test]
    fn run_command_labels_the_container() {
        let (ci, app) = fixtures();
        let client = FakeClient::new();
        let deploy = DockerDeployment::new(&client, &ci, &app, Path::new("/cfg")).with_network("bridge");
        assert_eq!(
            deploy.run_command(),
            "docker run -d -l edge-cloud -l cloudlet=cloud2 -l cluster=dock1 -l mexAppName=web \
             -l mexAppVersion=1.0 --restart=unless-stopped --network=bridge --name=web10 \
             docker.io/library/nginx:1 nginx -g 'daemon off;'"
        );
    }

    #[tokio::test]
    async fn create_then_delete_twice() {
        let (ci, app) = fixtures();
        let client = FakeClient::new();
        let deploy = DockerDeployment::new(&client, &ci, &app, Path::new("/cfg"));

        deploy.create().await.unwrap();
        assert!(client.has_container("web10"));
        assert!(client.ran("--network=host --name=web10"));

        deploy.delete().await.unwrap();
        assert!(!client.has_container("web10"));
        deploy.delete().await.unwrap();
    }

    #[tokio::test]
    async fn compose_projects() {
        let (ci, mut app) = fixtures();
        app.deployment_manifest = "services:\n  web:\n    image: nginx:1\n".to_string();
        let client = FakeClient::new();
        let deploy = DockerDeployment::new(&client, &ci, &app, Path::new("/cfg"));

        deploy.create().await.unwrap();
        assert!(client.file("/cfg/web10/docker-compose.yml").is_some());
        assert!(client.ran("docker-compose -f /cfg/web10/docker-compose.yml up -d"));

        deploy.delete().await.unwrap();
        assert!(client.files().is_empty());

        app.deployment_manifest = "https://example.net/compose.zip".to_string();
        let deploy = DockerDeployment::new(&client, &ci, &app, Path::new("/cfg"));
        assert!(matches!(
            deploy.create().await.unwrap_err(),
            OrchestratorError::Unsupported(_)
        ));
    }
}
