//! KubeNames — Kubernetes/Helm identifiers derived from an AppInst.
//!
//! A pure projection of (ClusterInst, App, AppInst). Nothing here is
//! persisted; callers recompute it whenever they need it.

use serde::{Deserialize, Serialize};
use serde_yaml::Value;

use crate::error::{CoreError, CoreResult};
use crate::sanitize::{dns_sanitize, k8s_sanitize};
use crate::types::{App, AppInst, ClusterInst, ClusterInstKey, DeploymentType};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct KubeNames {
    pub app_name: String,
    pub app_version: String,
    pub app_org: String,
    pub helm_app_name: String,
    pub app_uri: String,
    pub app_image: String,
    pub app_revision: String,
    pub app_inst_revision: String,
    pub cluster_name: String,
    pub k8s_node_name_suffix: String,
    pub operator_name: String,
    pub service_names: Vec<String>,
    pub kconf_name: String,
    pub kconf_env: String,
    pub deployment_type: DeploymentType,
    pub image_paths: Vec<String>,
    /// Set only for AppInsts on multi-tenant clusters.
    pub multitenant_namespace: Option<String>,
}

/// A pod-owning object found in a manifest.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Workload {
    pub name: String,
    pub namespace: String,
}

/// `{cluster}.{cloudlet org}.kubeconfig`
pub fn kconf_name(cluster_inst: &ClusterInst) -> String {
    format!(
        "{}.{}.kubeconfig",
        cluster_inst.key.cluster_key.name, cluster_inst.key.cloudlet_key.organization
    )
}

/// Suffix shared by all node names of a cluster.
pub fn k8s_node_name_suffix(key: &ClusterInstKey) -> String {
    let cloudlet = &key.cloudlet_key.name;
    let cluster = &key.cluster_key.name;
    if key.organization.is_empty() {
        k8s_sanitize(&format!("{cloudlet}-{cluster}"))
    } else {
        k8s_sanitize(&format!("{cloudlet}-{cluster}-{}", key.organization))
    }
}

impl KubeNames {
    pub fn new(cluster_inst: &ClusterInst, app: &App, app_inst: &AppInst) -> CoreResult<Self> {
        let mut names = KubeNames {
            cluster_name: k8s_sanitize(&format!(
                "{}{}",
                cluster_inst.key.cluster_key.name, cluster_inst.key.organization
            )),
            k8s_node_name_suffix: k8s_node_name_suffix(&cluster_inst.key),
            app_name: k8s_sanitize(&app.key.name),
            app_version: k8s_sanitize(&app.key.version),
            app_org: k8s_sanitize(&app.key.organization),
            helm_app_name: dns_sanitize(&format!("{}v{}", app.key.name, app.key.version)),
            app_uri: app_inst.uri.clone(),
            app_image: k8s_sanitize(&app.image_path),
            app_revision: app.revision.clone(),
            app_inst_revision: app_inst.revision.clone(),
            operator_name: k8s_sanitize(&cluster_inst.key.cloudlet_key.organization),
            kconf_name: kconf_name(cluster_inst),
            deployment_type: app.deployment,
            ..Default::default()
        };
        names.kconf_env = format!("KUBECONFIG={}", names.kconf_name);

        if cluster_inst.multi_tenant {
            // The AppInst key carries the virtual cluster name.
            names.multitenant_namespace = Some(k8s_sanitize(&format!(
                "{}-{}-{}-{}",
                app.key.organization,
                app.key.name,
                app.key.version,
                app_inst.key.cluster_inst_key.cluster_key.name
            )));
        }

        if !app.image_path.is_empty() {
            names.image_paths.push(app.image_path.clone());
        }

        match app.deployment {
            DeploymentType::Kubernetes => {
                let docs = decode_yaml_docs(&app.deployment_manifest, "kubernetes deployment")?;
                for doc in &docs {
                    names.collect_k8s_object(doc);
                }
                // Generated manifests name their services after the app.
                if docs.is_empty() {
                    names.service_names.push(names.app_name.clone());
                }
            }
            DeploymentType::Helm => {
                names.service_names.push(names.app_name.clone());
            }
            DeploymentType::Docker => {
                names.service_names.push(names.app_name.clone());
                if !app.deployment_manifest.is_empty()
                    && !app.deployment_manifest.ends_with(".zip")
                {
                    let docs = decode_yaml_docs(&app.deployment_manifest, "docker compose")?;
                    for doc in &docs {
                        names.collect_compose_images(doc);
                    }
                }
            }
            DeploymentType::Vm => {}
        }
        Ok(names)
    }

    /// Namespace workloads are deployed into.
    pub fn namespace(&self) -> &str {
        self.multitenant_namespace.as_deref().unwrap_or("default")
    }

    /// Whether `svc` belongs to this app. Service names may carry
    /// generated suffixes, so this is a prefix match.
    pub fn contains_service(&self, svc: &str) -> bool {
        self.service_names.iter().any(|s| svc.starts_with(s.as_str()))
    }

    /// Label value marking objects applied from this cluster's (or
    /// namespace's) config directory. Used as the `--prune` selector.
    pub fn config_label(&self) -> &str {
        self.multitenant_namespace
            .as_deref()
            .unwrap_or(&self.cluster_name)
    }

    /// Config directory name and manifest file name for this AppInst.
    pub fn config_dir_name(&self) -> (String, String) {
        let mut dir = self.cluster_name.clone();
        if let Some(ns) = &self.multitenant_namespace {
            dir.push('.');
            dir.push_str(ns);
        }
        let file = format!("{}{}{}.yaml", self.app_name, self.app_org, self.app_version);
        (dir, file)
    }

    /// Deployments, DaemonSets and StatefulSets in `manifest`, with their
    /// effective namespace.
    pub fn workloads(&self, manifest: &str) -> CoreResult<Vec<Workload>> {
        let docs = decode_yaml_docs(manifest, "kubernetes deployment")?;
        let mut out = Vec::new();
        for doc in &docs {
            let kind = doc.get("kind").and_then(Value::as_str).unwrap_or_default();
            if !matches!(kind, "Deployment" | "DaemonSet" | "StatefulSet") {
                continue;
            }
            let meta = doc.get("metadata");
            let Some(name) = meta.and_then(|m| m.get("name")).and_then(Value::as_str) else {
                continue;
            };
            let namespace = meta
                .and_then(|m| m.get("namespace"))
                .and_then(Value::as_str)
                .unwrap_or(self.namespace());
            out.push(Workload {
                name: name.to_string(),
                namespace: namespace.to_string(),
            });
        }
        Ok(out)
    }

    fn collect_k8s_object(&mut self, doc: &Value) {
        let kind = doc.get("kind").and_then(Value::as_str).unwrap_or_default();
        match kind {
            "Service" => {
                if let Some(name) = doc
                    .get("metadata")
                    .and_then(|m| m.get("name"))
                    .and_then(Value::as_str)
                {
                    self.service_names.push(name.to_string());
                }
            }
            "Deployment" | "DaemonSet" | "StatefulSet" => {
                let Some(pod_spec) = doc
                    .get("spec")
                    .and_then(|s| s.get("template"))
                    .and_then(|t| t.get("spec"))
                else {
                    return;
                };
                for field in ["initContainers", "containers"] {
                    let Some(containers) = pod_spec.get(field).and_then(Value::as_sequence) else {
                        continue;
                    };
                    for container in containers {
                        match container.get("image").and_then(Value::as_str) {
                            Some(image) if !image.is_empty() => {
                                self.image_paths.push(image.to_string())
                            }
                            _ => {}
                        }
                    }
                }
            }
            _ => {}
        }
    }

    fn collect_compose_images(&mut self, doc: &Value) {
        let Some(services) = doc.get("services").and_then(Value::as_mapping) else {
            return;
        };
        for (_, service) in services {
            if let Some(image) = service.get("image").and_then(Value::as_str) {
                self.image_paths.push(image.to_string());
            }
        }
    }
}

/// Split a multi-document YAML string into values, skipping empty documents.
pub fn decode_yaml_docs(manifest: &str, kind: &'static str) -> CoreResult<Vec<Value>> {
    let mut docs = Vec::new();
    for de in serde_yaml::Deserializer::from_str(manifest) {
        let value = Value::deserialize(de).map_err(|e| CoreError::InvalidManifest {
            kind,
            reason: e.to_string(),
        })?;
        if !value.is_null() {
            docs.push(value);
        }
    }
    Ok(docs)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::*;

    const MANIFEST: &str = r#"apiVersion: v1
kind: Service
metadata:
  name: myapp-tcp
spec:
  ports:
  - port: 443
---
apiVersion: apps/v1
kind: Deployment
metadata:
  name: myapp-deployment
spec:
  template:
    spec:
      initContainers:
      - name: init
        image: docker.example.net/init:1
      containers:
      - name: myapp
        image: docker.example.net/devorg/myapp:1.0
"#;

    fn fixtures() -> (ClusterInst, App, AppInst) {
        let cloudlet = CloudletKey::new("operorg", "cloudlet1");
        let cluster_inst = ClusterInst {
            key: ClusterInstKey::new("defaultmtclust", cloudlet.clone(), "MobiledgeX"),
            multi_tenant: true,
            ..Default::default()
        };
        let app = App {
            key: AppKey::new("devorg", "myapp", "1.0"),
            image_path: "docker.example.net/devorg/myapp:1.0".to_string(),
            deployment: DeploymentType::Kubernetes,
            deployment_manifest: MANIFEST.to_string(),
            ..Default::default()
        };
        let app_inst = AppInst {
            key: AppInstKey {
                app_key: app.key.clone(),
                cluster_inst_key: ClusterInstKey::new("autocluster1", cloudlet, "MobiledgeX"),
            },
            real_cluster_name: "defaultmtclust".to_string(),
            ..Default::default()
        };
        (cluster_inst, app, app_inst)
    }

    #[test]
    fn derives_names_from_objects() {
        let (ci, app, inst) = fixtures();
        let names = KubeNames::new(&ci, &app, &inst).unwrap();

        assert_eq!(names.cluster_name, "defaultmtclustmobiledgex");
        assert_eq!(names.k8s_node_name_suffix, "cloudlet1-defaultmtclust-mobiledgex");
        assert_eq!(names.app_version, "10");
        assert_eq!(names.helm_app_name, "myappv10");
        assert_eq!(names.kconf_name, "defaultmtclust.operorg.kubeconfig");
        assert_eq!(names.kconf_env, "KUBECONFIG=defaultmtclust.operorg.kubeconfig");
        assert_eq!(names.namespace(), "devorg-myapp-10-autocluster1");
    }

    #[test]
    fn collects_services_and_images() {
        let (ci, app, inst) = fixtures();
        let names = KubeNames::new(&ci, &app, &inst).unwrap();

        assert_eq!(names.service_names, vec!["myapp-tcp".to_string()]);
        assert_eq!(names.image_paths.len(), 3);
        assert!(names.contains_service("myapp-tcp-xyz"));
        assert!(!names.contains_service("other"));
    }

    #[test]
    fn single_tenant_uses_default_namespace() {
        let (mut ci, app, inst) = fixtures();
        ci.multi_tenant = false;
        let names = KubeNames::new(&ci, &app, &inst).unwrap();
        assert!(names.multitenant_namespace.is_none());
        assert_eq!(names.namespace(), "default");
    }

    #[test]
    fn helm_and_docker_use_app_name_as_service() {
        let (ci, mut app, inst) = fixtures();
        app.deployment = DeploymentType::Helm;
        let names = KubeNames::new(&ci, &app, &inst).unwrap();
        assert_eq!(names.service_names, vec!["myapp".to_string()]);

        app.deployment = DeploymentType::Docker;
        app.deployment_manifest = "services:\n  web:\n    image: nginx:1\n".to_string();
        let names = KubeNames::new(&ci, &app, &inst).unwrap();
        assert_eq!(names.service_names, vec!["myapp".to_string()]);
        assert!(names.image_paths.contains(&"nginx:1".to_string()));
    }

    #[test]
    fn workloads_take_the_app_namespace() {
        let (ci, app, inst) = fixtures();
        let names = KubeNames::new(&ci, &app, &inst).unwrap();
        let workloads = names.workloads(&app.deployment_manifest).unwrap();
        assert_eq!(
            workloads,
            vec![Workload {
                name: "myapp-deployment".to_string(),
                namespace: "devorg-myapp-10-autocluster1".to_string(),
            }]
        );
        assert_eq!(names.config_label(), "devorg-myapp-10-autocluster1");

        let (dir, file) = names.config_dir_name();
        assert_eq!(dir, "defaultmtclustmobiledgex.devorg-myapp-10-autocluster1");
        assert_eq!(file, "myappdevorg10.yaml");
    }

    #[test]
    fn invalid_manifest_is_an_error() {
        let (ci, mut app, inst) = fixtures();
        app.deployment_manifest = "kind: [unterminated".to_string();
        let err = KubeNames::new(&ci, &app, &inst).unwrap_err();
        assert!(err.to_string().contains("invalid kubernetes deployment yaml"));
    }
}
