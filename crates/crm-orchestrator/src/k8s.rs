//! Kubernetes AppInsts: manifest rendering, apply, readiness and teardown.
//!
//! Manifests live on the platform host under
//! `{config_dir}/{cluster}[.{namespace}]/{app}{org}{version}.yaml` and are
//! applied per directory with `--prune`, so the directory is the source of
//! truth for what runs in a cluster (or namespace).

use std::fmt::Write;
use std::path::Path;

use crm_core::config::OrchestratorConfig;
use crm_core::kubenames::decode_yaml_docs;
use crm_core::{App, AppPort, KubeNames, LProto, Workload, parse_app_ports};
use crm_platform::PlatformClient;
use regex::Regex;
use serde_yaml::{Mapping, Value};
use tokio::time::{Instant, sleep};
use tracing::{debug, info, warn};

use crate::error::{OrchestratorError, OrchestratorResult};
use crate::network_policy::network_policy;
use crate::vars::{DeploymentVars, replace_deployment_vars};

/// Label carrying the config directory's prune selector.
pub const CONFIG_LABEL: &str = "config";
/// Pod label used to find a workload's pods.
pub const APP_LABEL: &str = "mex-app";

// ── Rendering ──────────────────────────────────────────────────────

/// Final manifest for an AppInst: variables substituted, objects
/// labeled, and the network policy appended on multi-tenant clusters.
pub fn render_manifest(
    app: &App,
    names: &KubeNames,
    mapped_ports: &[AppPort],
    vars: &DeploymentVars,
) -> OrchestratorResult<String> {
    let base = if app.deployment_manifest.trim().is_empty() {
        default_manifest(app, names)?
    } else {
        app.deployment_manifest.clone()
    };
    let text = replace_deployment_vars(&base, &app.template_delimiter, vars)?;
    let mut out = decorate_manifest(names, &text)?;
    if names.multitenant_namespace.is_some() {
        out.push_str("---\n");
        out.push_str(&network_policy(names, mapped_ports)?);
    }
    Ok(out)
}

fn child<'a>(value: &'a mut Value, key: &str) -> &'a mut Value {
    if !value.is_mapping() {
        *value = Value::Mapping(Mapping::new());
    }
    match value {
        Value::Mapping(map) => map.entry(Value::from(key)).or_insert(Value::Null),
        _ => unreachable!("value was just made a mapping"),
    }
}

fn set(value: &mut Value, key: &str, to: &str) {
    *child(value, key) = Value::from(to);
}

/// Label every object with the prune selector, label workload pods with
/// the workload name, and pin objects to the AppInst namespace.
fn decorate_manifest(names: &KubeNames, manifest: &str) -> OrchestratorResult<String> {
    let mut docs = decode_yaml_docs(manifest, "kubernetes deployment")?;
    let mut out = String::new();
    for (i, doc) in docs.iter_mut().enumerate() {
        let kind = doc
            .get("kind")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        let name = doc
            .get("metadata")
            .and_then(|m| m.get("name"))
            .and_then(Value::as_str)
            .map(String::from);

        let meta = child(doc, "metadata");
        set(child(meta, "labels"), CONFIG_LABEL, names.config_label());
        if let Some(ns) = &names.multitenant_namespace {
            if kind != "Namespace" {
                set(meta, "namespace", ns);
            }
        }

        let is_workload = matches!(kind.as_str(), "Deployment" | "DaemonSet" | "StatefulSet");
        if let Some(name) = name.filter(|_| is_workload) {
            let template = child(child(doc, "spec"), "template");
            set(child(child(template, "metadata"), "labels"), APP_LABEL, &name);
        }

        if i > 0 {
            out.push_str("---\n");
        }
        out.push_str(&serde_yaml::to_string(&*doc)?);
    }
    Ok(out)
}

/// Deployment plus LoadBalancer services for an App without a manifest.
pub fn default_manifest(app: &App, names: &KubeNames) -> OrchestratorResult<String> {
    if app.image_path.is_empty() {
        return Err(OrchestratorError::Invalid(format!(
            "app {} has neither a deployment manifest nor an image path",
            app.key
        )));
    }
    let ports = parse_app_ports(&app.access_ports)?;
    let name = &names.app_name;
    let mut mf = String::new();

    for proto in [LProto::Tcp, LProto::Udp] {
        let matching: Vec<&AppPort> = ports
            .iter()
            .filter(|p| p.proto.k8s_name() == proto.k8s_name())
            .collect();
        if matching.is_empty() {
            continue;
        }
        let suffix = proto.k8s_name().to_ascii_lowercase();
        let _ = write!(
            mf,
            "apiVersion: v1
kind: Service
metadata:
  name: {name}-{suffix}
  labels:
    run: {name}
spec:
  type: LoadBalancer
  selector:
    run: {name}
  ports:
"
        );
        for port in matching {
            for p in port.internal_port..=port.internal_end_port() {
                let _ = write!(
                    mf,
                    "  - name: {suffix}{p}\n    protocol: {}\n    port: {p}\n    targetPort: {p}\n",
                    proto.k8s_name()
                );
            }
        }
        mf.push_str("---\n");
    }

    let _ = write!(
        mf,
        "apiVersion: apps/v1
kind: Deployment
metadata:
  name: {name}-deployment
spec:
  replicas: 1
  selector:
    matchLabels:
      run: {name}
  template:
    metadata:
      labels:
        run: {name}
    spec:
      containers:
      - name: {name}
        image: {}
        imagePullPolicy: Always
",
        app.image_path
    );
    if !app.command.trim().is_empty() {
        mf.push_str("        command:\n");
        for arg in app.command.split_whitespace() {
            let _ = writeln!(mf, "        - {arg:?}");
        }
    }
    if !ports.is_empty() {
        mf.push_str("        ports:\n");
        for port in &ports {
            for p in port.internal_port..=port.internal_end_port() {
                let _ = write!(
                    mf,
                    "        - containerPort: {p}\n          protocol: {}\n",
                    port.proto.k8s_name()
                );
            }
        }
    }
    Ok(mf)
}

// ── Cluster operations ─────────────────────────────────────────────

/// Pod phase a wait is looking for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PodTarget {
    Running,
    Gone,
}

/// Kubernetes operations for one AppInst.
pub struct KubeDeployment<'a> {
    client: &'a dyn PlatformClient,
    names: &'a KubeNames,
    config: &'a OrchestratorConfig,
    config_dir: String,
}

impl<'a> KubeDeployment<'a> {
    pub fn new(
        client: &'a dyn PlatformClient,
        names: &'a KubeNames,
        config: &'a OrchestratorConfig,
        config_dir: &Path,
    ) -> Self {
        Self {
            client,
            names,
            config,
            config_dir: config_dir.display().to_string(),
        }
    }

    fn dir(&self) -> String {
        let (dir, _) = self.names.config_dir_name();
        format!("{}/{dir}", self.config_dir)
    }

    /// Where this AppInst's manifest is written.
    pub fn manifest_path(&self) -> String {
        let (_, file) = self.names.config_dir_name();
        format!("{}/{file}", self.dir())
    }

    fn kubectl(&self, args: &str) -> String {
        format!("{} kubectl {args}", self.names.kconf_env)
    }

    pub async fn create(&self, manifest: &str) -> OrchestratorResult<()> {
        if let Some(ns) = &self.names.multitenant_namespace {
            self.ensure_namespace(ns).await?;
        }
        self.apply(manifest).await?;
        let workloads = self.names.workloads(manifest)?;
        self.wait_for_pods(&workloads, PodTarget::Running).await
    }

    pub async fn update(&self, manifest: &str) -> OrchestratorResult<()> {
        self.apply(manifest).await?;
        let workloads = self.names.workloads(manifest)?;
        self.wait_for_pods(&workloads, PodTarget::Running).await
    }

    /// Remove the AppInst's objects. Everything already gone is skipped.
    pub async fn delete(&self) -> OrchestratorResult<()> {
        let path = self.manifest_path();
        let applied = match self.client.output(&format!("cat {path}")).await {
            Ok(text) => Some(text),
            Err(e) if e.output_contains("No such file") => None,
            Err(e) => return Err(e.into()),
        };

        match self.client.run(&self.kubectl(&format!("delete -f {path}"))).await {
            Ok(()) => {}
            Err(e)
                if e.output_contains("not found")
                    || e.output_contains("No such file")
                    || e.output_contains("does not exist") =>
            {
                debug!(%path, "manifest objects already deleted");
            }
            Err(e) => return Err(e.into()),
        }
        self.client.run(&format!("rm -f {path}")).await?;

        if let Some(text) = applied {
            let workloads = self.names.workloads(&text)?;
            self.wait_for_pods(&workloads, PodTarget::Gone).await?;
        }

        if let Some(ns) = &self.names.multitenant_namespace {
            match self.client.run(&self.kubectl(&format!("delete namespace {ns}"))).await {
                Ok(()) => {}
                Err(e) if e.output_contains("not found") => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }

    async fn ensure_namespace(&self, ns: &str) -> OrchestratorResult<()> {
        match self.client.run(&self.kubectl(&format!("create namespace {ns}"))).await {
            Ok(()) => {}
            Err(e) if e.output_contains("AlreadyExists") => {}
            Err(e) => return Err(e.into()),
        }
        // The network policy selects its own namespace by this label.
        self.client
            .run(&self.kubectl(&format!("label namespace {ns} name={ns} --overwrite")))
            .await?;
        Ok(())
    }

    async fn apply(&self, manifest: &str) -> OrchestratorResult<()> {
        let dir = self.dir();
        let path = self.manifest_path();
        self.client.run(&format!("mkdir -p {dir}")).await?;
        self.client
            .write_file(&path, manifest, "k8s manifest", false)
            .await?;
        info!(app = %self.names.app_name, %path, "applying manifest");
        self.client
            .run(&self.kubectl(&format!(
                "apply -f {dir} --prune -l {CONFIG_LABEL}={}",
                self.names.config_label()
            )))
            .await?;
        Ok(())
    }

    /// Poll until every workload's pods reach `target`.
    pub async fn wait_for_pods(&self, workloads: &[Workload], target: PodTarget) -> OrchestratorResult<()> {
        for workload in workloads {
            self.wait_for_workload(workload, target).await?;
        }
        Ok(())
    }

    async fn wait_for_workload(&self, workload: &Workload, target: PodTarget) -> OrchestratorResult<()> {
        let re = Regex::new(r"^(\S+)\s+\S+\s+(\S+)\s+\d+")
            .map_err(|e| OrchestratorError::Invalid(e.to_string()))?;
        let cmd = self.kubectl(&format!(
            "get pods --no-headers -n {} --selector={APP_LABEL}={}",
            workload.namespace, workload.name
        ));
        let started = Instant::now();

        loop {
            let out = self.client.output(&cmd).await?;
            if out.contains("No resources found") || out.trim().is_empty() {
                match target {
                    PodTarget::Gone => return Ok(()),
                    PodTarget::Running if started.elapsed() >= self.config.no_resources_grace => {
                        return Err(OrchestratorError::NotFound(format!(
                            "no pods found for {} in namespace {}",
                            workload.name, workload.namespace
                        )));
                    }
                    PodTarget::Running => {}
                }
            } else if target == PodTarget::Running && self.all_running(&re, &out).await? {
                info!(workload = %workload.name, namespace = %workload.namespace, "pods running");
                return Ok(());
            }

            if started.elapsed() >= self.config.pod_wait_timeout {
                let what = match target {
                    PodTarget::Running => "running",
                    PodTarget::Gone => "deleted",
                };
                return Err(OrchestratorError::Timeout(format!(
                    "waiting for pods of {} to be {what}",
                    workload.name
                )));
            }
            sleep(self.config.pod_poll_interval).await;
        }
    }

    /// Whether every listed pod is up. Pods in a terminal failure state
    /// abort the wait with the pod description.
    async fn all_running(&self, re: &Regex, out: &str) -> OrchestratorResult<bool> {
        let mut running = true;
        for caps in out.lines().filter_map(|line| re.captures(line)) {
            let pod = &caps[1];
            let state = &caps[2];
            match state {
                "Running" => {}
                // An old replica on its way out.
                "Terminating" => {}
                "Pending" | "ContainerCreating" | "CreateContainerConfigError" => running = false,
                s if s.starts_with("Init") => running = false,
                other => {
                    warn!(%pod, state = %other, "pod failed");
                    let output = self
                        .client
                        .output(&self.kubectl(&format!(
                            "describe pod -n {} {pod}",
                            self.names.namespace()
                        )))
                        .await
                        .unwrap_or_else(|e| e.to_string());
                    return Err(OrchestratorError::PodFailed {
                        state: other.to_string(),
                        output,
                    });
                }
            }
        }
        Ok(running)
    }

    /// Point the AppInst's services at the cluster master.
    pub async fn patch_external_ips(&self, master_ip: &str) -> OrchestratorResult<()> {
        let ns = self.names.namespace();
        let out = self
            .client
            .output(&self.kubectl(&format!(
                "get svc -n {ns} --no-headers -o custom-columns=NAME:.metadata.name"
            )))
            .await?;
        for svc in out.lines().map(str::trim).filter(|s| !s.is_empty()) {
            if !self.names.contains_service(svc) {
                continue;
            }
            debug!(%svc, %master_ip, "patching external ip");
            let patch = format!(r#"'{{"spec":{{"externalIPs":["{master_ip}"]}}}}'"#);
            self.client
                .run(&self.kubectl(&format!("patch svc {svc} -n {ns} -p {patch}")))
                .await?;
        }
        Ok(())
    }
}
