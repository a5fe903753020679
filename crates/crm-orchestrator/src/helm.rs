//! Helm AppInsts.
//!
//! Chart values come from the App's deployment manifest, rendered with the
//! same deployment variables as Kubernetes manifests, and are written next
//! to the cluster's other configs.

use std::path::Path;

use crm_core::{App, KubeNames};
use crm_platform::PlatformClient;
use tracing::{debug, info};

use crate::error::OrchestratorResult;
use crate::vars::{DeploymentVars, replace_deployment_vars};

pub struct HelmDeployment<'a> {
    client: &'a dyn PlatformClient,
    names: &'a KubeNames,
    config_dir: String,
}

impl<'a> HelmDeployment<'a> {
    pub fn new(client: &'a dyn PlatformClient, names: &'a KubeNames, config_dir: &Path) -> Self {
        Self {
            client,
            names,
            config_dir: config_dir.display().to_string(),
        }
    }

    fn values_path(&self) -> String {
        let (dir, _) = self.names.config_dir_name();
        format!("{}/{dir}/{}-values.yaml", self.config_dir, self.names.helm_app_name)
    }

    fn namespace_arg(&self) -> String {
        match &self.names.multitenant_namespace {
            Some(ns) => format!(" --namespace {ns} --create-namespace"),
            None => String::new(),
        }
    }

    /// `-f {values}` when the App carries chart values.
    async fn write_values(&self, app: &App, vars: &DeploymentVars) -> OrchestratorResult<String> {
        if app.deployment_manifest.trim().is_empty() {
            return Ok(String::new());
        }
        let values = replace_deployment_vars(&app.deployment_manifest, &app.template_delimiter, vars)?;
        let path = self.values_path();
        if let Some(dir) = Path::new(&path).parent() {
            self.client.run(&format!("mkdir -p {}", dir.display())).await?;
        }
        self.client.write_file(&path, &values, "helm values", false).await?;
        Ok(format!(" -f {path}"))
    }

    pub async fn install(&self, app: &App, vars: &DeploymentVars) -> OrchestratorResult<()> {
        let values = self.write_values(app, vars).await?;
        info!(chart = %app.image_path, release = %self.names.helm_app_name, "helm install");
        self.client
            .run(&format!(
                "{} helm install {} {}{values}{}",
                self.names.kconf_env,
                self.names.helm_app_name,
                app.image_path,
                self.namespace_arg()
            ))
            .await?;
        Ok(())
    }

    pub async fn upgrade(&self, app: &App, vars: &DeploymentVars) -> OrchestratorResult<()> {
        let values = self.write_values(app, vars).await?;
        info!(chart = %app.image_path, release = %self.names.helm_app_name, "helm upgrade");
        self.client
            .run(&format!(
                "{} helm upgrade {} {}{values}{}",
                self.names.kconf_env,
                self.names.helm_app_name,
                app.image_path,
                self.namespace_arg()
            ))
            .await?;
        Ok(())
    }

    /// Delete the release. A release that is already gone is not an error.
    pub async fn delete(&self) -> OrchestratorResult<()> {
        let ns = match &self.names.multitenant_namespace {
            Some(ns) => format!(" --namespace {ns}"),
            None => String::new(),
        };
        match self
            .client
            .run(&format!(
                "{} helm delete {}{ns}",
                self.names.kconf_env, self.names.helm_app_name
            ))
            .await
        {
            Ok(()) => {}
            Err(e) if e.output_contains("not found") => {
                debug!(release = %self.names.helm_app_name, "helm release already deleted");
            }
            Err(e) => return Err(e.into()),
        }
        self.client.run(&format!("rm -f {}", self.values_path())).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crm_core::*;
    use crm_platform::FakeClient;

    fn fixtures() -> (App, KubeNames) {
        let cloudlet = CloudletKey::new("operorg", "cloudlet1");
        let ci = ClusterInst {
            key: ClusterInstKey::new("c1", cloudlet.clone(), "dev"),
            ..Default::default()
        };
        let app = App {
            key: AppKey::new("dev", "chart", "2.1"),
            deployment: DeploymentType::Helm,
            image_path: "stable/redis".to_string(),
            deployment_manifest: "master:\n  host: \"{{ .CRM.ClusterIp }}\"\n".to_string(),
            ..Default::default()
        };
        let inst = AppInst {
            key: AppInstKey {
                app_key: app.key.clone(),
                cluster_inst_key: ci.key.clone(),
            },
            ..Default::default()
        };
        let names = KubeNames::new(&ci, &app, &inst).unwrap();
        (app, names)
    }

    #[tokio::test]
    async fn install_writes_rendered_values() {
        let client = FakeClient::new();
        let (app, names) = fixtures();
        let helm = HelmDeployment::new(&client, &names, Path::new("/cfg"));
        let vars = DeploymentVars {
            cluster_ip: "10.1.1.1".to_string(),
            ..Default::default()
        };

        helm.install(&app, &vars).await.unwrap();
        let values = client.file("/cfg/c1dev/chartv21-values.yaml").unwrap();
        assert!(values.contains("10.1.1.1"));
        assert!(client.ran(
            "KUBECONFIG=c1.operorg.kubeconfig helm install chartv21 stable/redis -f /cfg/c1dev/chartv21-values.yaml"
        ));

        helm.upgrade(&app, &vars).await.unwrap();
        assert!(client.ran("helm upgrade chartv21 stable/redis"));
    }

    #[tokio::test]
    async fn delete_removes_values_and_propagates_failures() {
        let client = FakeClient::new();
        let (app, names) = fixtures();
        let helm = HelmDeployment::new(&client, &names, Path::new("/cfg"));
        helm.install(&app, &DeploymentVars {
            cluster_ip: "10.1.1.1".to_string(),
            ..Default::default()
        })
        .await
        .unwrap();
        helm.delete().await.unwrap();
        assert!(client.files().is_empty());

        let failing = FakeClient::new();
        failing.fail_on("helm delete");
        let helm = HelmDeployment::new(&failing, &names, Path::new("/cfg"));
        // Injected failures do not say "not found".
        assert!(helm.delete().await.is_err());
    }
}
