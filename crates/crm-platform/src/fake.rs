//! Simulation backend.
//!
//! `FakePlatform` keeps clusters in memory and runs every command through
//! a [`FakeClient`], which interprets the handful of shell commands the
//! orchestrator issues (docker containers and networks, base64 file
//! writes, `mv`/`rm`/`cat`, kubectl apply/delete/get pods). Tests use the
//! client to inspect what ran and to inject failures.

use std::collections::{BTreeMap, BTreeSet};
use std::io::Cursor;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use crm_core::{
    CloudletInfo, ClusterInst, ClusterInstKey, FlavorInfo, InfraResource, IpAccess, KubeNames,
};
use tokio::io::AsyncWriteExt;
use tracing::{debug, info};

use crate::client::{Exit, PlatformClient, ShellIo, Started};
use crate::error::{PlatformError, PlatformResult};
use crate::platform::{Features, Platform};

pub const FAKE_RAM_MAX: u64 = 40960;
pub const FAKE_VCPUS_MAX: u64 = 50;
pub const FAKE_DISK_MAX: u64 = 5000;
pub const FAKE_EXTERNAL_IPS_MAX: u64 = 30;

/// Everything the fake backend reports, passed in explicitly.
#[derive(Debug, Clone)]
pub struct FakeFixture {
    pub flavors: Vec<FlavorInfo>,
    pub ram_max: u64,
    pub vcpus_max: u64,
    pub disk_max: u64,
    pub external_ips_max: u64,
    pub app_dns_root: String,
    pub master_ip: String,
    pub docker_network: String,
    pub load_balancers: Vec<String>,
}

impl Default for FakeFixture {
    fn default() -> Self {
        Self {
            flavors: vec![
                FlavorInfo {
                    name: "x1.tiny".to_string(),
                    vcpus: 1,
                    ram: 1024,
                    disk: 20,
                },
                FlavorInfo {
                    name: "x1.small".to_string(),
                    vcpus: 2,
                    ram: 4096,
                    disk: 40,
                },
            ],
            ram_max: FAKE_RAM_MAX,
            vcpus_max: FAKE_VCPUS_MAX,
            disk_max: FAKE_DISK_MAX,
            external_ips_max: FAKE_EXTERNAL_IPS_MAX,
            app_dns_root: "fake.net".to_string(),
            master_ip: "10.1.1.1".to_string(),
            docker_network: "bridge".to_string(),
            load_balancers: vec!["fake-lb".to_string()],
        }
    }
}

// ── FakeClient ─────────────────────────────────────────────────────

#[derive(Default)]
struct FakeState {
    commands: Vec<String>,
    failures: Vec<String>,
    responses: Vec<(String, String)>,
    containers: BTreeSet<String>,
    networks: BTreeSet<String>,
    files: BTreeMap<String, String>,
    /// Manifest files currently applied with kubectl.
    applied: BTreeSet<String>,
}

/// Command-level test double. Clones share state.
#[derive(Clone, Default)]
pub struct FakeClient {
    state: Arc<Mutex<FakeState>>,
}

fn failed(cmd: &str, output: String) -> PlatformError {
    PlatformError::Command {
        cmd: cmd.to_string(),
        output,
        reason: "exit status: 1".to_string(),
    }
}

/// Value of `--name=X` or `--name X`.
fn name_flag<'a>(tokens: &[&'a str]) -> Option<&'a str> {
    tokens.iter().enumerate().find_map(|(i, t)| {
        if let Some(name) = t.strip_prefix("--name=") {
            Some(name)
        } else if *t == "--name" {
            tokens.get(i + 1).copied()
        } else {
            None
        }
    })
}

/// Positional arguments after `verb`, skipping flags.
fn args_after<'a>(tokens: &[&'a str], verb: &str) -> Vec<&'a str> {
    tokens
        .iter()
        .skip_while(|t| **t != verb)
        .skip(1)
        .filter(|t| !t.starts_with('-'))
        .copied()
        .collect()
}

fn flag_value<'a>(tokens: &[&'a str], flag: &str) -> Option<&'a str> {
    tokens
        .iter()
        .position(|t| *t == flag)
        .and_then(|i| tokens.get(i + 1).copied())
}

impl FakeClient {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, FakeState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Fail every later command containing `pattern`.
    pub fn fail_on(&self, pattern: &str) {
        self.lock().failures.push(pattern.to_string());
    }

    pub fn clear_failures(&self) {
        self.lock().failures.clear();
    }

    /// Answer commands containing `pattern` with `output`.
    pub fn respond_to(&self, pattern: &str, output: &str) {
        self.lock()
            .responses
            .push((pattern.to_string(), output.to_string()));
    }

    /// Every command run so far, in order.
    pub fn commands(&self) -> Vec<String> {
        self.lock().commands.clone()
    }

    pub fn ran(&self, pattern: &str) -> bool {
        self.lock().commands.iter().any(|c| c.contains(pattern))
    }

    pub fn containers(&self) -> Vec<String> {
        self.lock().containers.iter().cloned().collect()
    }

    pub fn has_container(&self, name: &str) -> bool {
        self.lock().containers.contains(name)
    }

    pub fn networks(&self) -> Vec<String> {
        self.lock().networks.iter().cloned().collect()
    }

    pub fn file(&self, path: &str) -> Option<String> {
        self.lock().files.get(path).cloned()
    }

    pub fn files(&self) -> Vec<String> {
        self.lock().files.keys().cloned().collect()
    }

    fn exec(&self, cmd: &str) -> PlatformResult<String> {
        let mut state = self.lock();
        state.commands.push(cmd.to_string());
        if state.failures.iter().any(|f| cmd.contains(f.as_str())) {
            return Err(failed(cmd, "injected failure".to_string()));
        }
        if let Some((_, out)) = state.responses.iter().find(|(p, _)| cmd.contains(p.as_str())) {
            return Ok(out.clone());
        }
        let mut out = String::new();
        for part in cmd.split(" && ") {
            out.push_str(&state.exec_one(part)?);
        }
        Ok(out)
    }
}

impl FakeState {
    fn exec_one(&mut self, cmd: &str) -> PlatformResult<String> {
        let cmd = cmd.trim();
        if let Some(pos) = cmd.find("base64 -d <<< ") {
            return self.write_file(cmd, &cmd[pos + "base64 -d <<< ".len()..]);
        }
        let tokens: Vec<&str> = cmd.split_whitespace().collect();
        let program = tokens
            .iter()
            .find(|t| !t.contains('=') && **t != "sudo")
            .copied()
            .unwrap_or_default();

        match program {
            "docker" => self.docker(cmd, &tokens),
            "kubectl" => self.kubectl(cmd, &tokens),
            "mv" => {
                let args = args_after(&tokens, "mv");
                let [from, to] = args.as_slice() else {
                    return Err(failed(cmd, "usage: mv FROM TO".into()));
                };
                let data = self
                    .files
                    .remove(*from)
                    .ok_or_else(|| failed(cmd, format!("mv: cannot stat '{from}': No such file or directory")))?;
                self.files.insert(to.to_string(), data);
                Ok(String::new())
            }
            "cat" => {
                let path = args_after(&tokens, "cat").first().copied().unwrap_or_default();
                self.files
                    .get(path)
                    .cloned()
                    .ok_or_else(|| failed(cmd, format!("cat: {path}: No such file or directory")))
            }
            "rm" => {
                let recursive = tokens.iter().any(|t| t.starts_with('-') && t.contains('r'));
                let force = tokens.iter().any(|t| t.starts_with('-') && t.contains('f'));
                for path in args_after(&tokens, "rm") {
                    if recursive {
                        let prefix = format!("{}/", path.trim_end_matches('/'));
                        self.files.retain(|f, _| f != path && !f.starts_with(&prefix));
                    } else if self.files.remove(path).is_none() && !force {
                        return Err(failed(
                            cmd,
                            format!("rm: cannot remove '{path}': No such file or directory"),
                        ));
                    }
                }
                Ok(String::new())
            }
            _ => Ok(String::new()),
        }
    }

    fn write_file(&mut self, cmd: &str, rest: &str) -> PlatformResult<String> {
        let Some((data, path)) = rest.split_once(" > ") else {
            return Err(failed(cmd, "missing redirect".into()));
        };
        let path = path.trim().trim_end_matches('\'');
        let bytes = STANDARD
            .decode(data.trim())
            .map_err(|e| failed(cmd, format!("base64: invalid input: {e}")))?;
        self.files
            .insert(path.to_string(), String::from_utf8_lossy(&bytes).into_owned());
        Ok(String::new())
    }

    fn docker(&mut self, cmd: &str, tokens: &[&str]) -> PlatformResult<String> {
        let verb = tokens
            .iter()
            .skip_while(|t| **t != "docker")
            .nth(1)
            .copied()
            .unwrap_or_default();
        match verb {
            "run" => {
                let Some(name) = name_flag(tokens) else {
                    return Ok(String::new());
                };
                if !self.containers.insert(name.to_string()) {
                    return Err(failed(
                        cmd,
                        format!("Conflict. The container name \"/{name}\" is already in use"),
                    ));
                }
                Ok(format!("{name}\n"))
            }
            "rm" | "stop" | "kill" => {
                for name in args_after(tokens, verb) {
                    if !self.containers.contains(name) {
                        return Err(failed(cmd, format!("Error: No such container: {name}")));
                    }
                    if verb == "rm" {
                        self.containers.remove(name);
                    }
                }
                Ok(String::new())
            }
            "ps" => {
                let filter = tokens
                    .iter()
                    .find_map(|t| t.strip_prefix("name="))
                    .unwrap_or_default();
                Ok(self
                    .containers
                    .iter()
                    .filter(|c| c.contains(filter))
                    .map(|c| format!("{c}\n"))
                    .collect())
            }
            "network" => {
                let args = args_after(tokens, "network");
                match args.as_slice() {
                    ["create", .., name] => {
                        if !self.networks.insert(name.to_string()) {
                            return Err(failed(
                                cmd,
                                format!("Error response from daemon: network with name {name} already exists"),
                            ));
                        }
                        Ok(String::new())
                    }
                    ["rm", name] => {
                        if !self.networks.remove(*name) {
                            return Err(failed(cmd, format!("Error: No such network: {name}")));
                        }
                        Ok(String::new())
                    }
                    _ => Ok(self.networks.iter().map(|n| format!("{n}\n")).collect()),
                }
            }
            _ => Ok(String::new()),
        }
    }

    fn kubectl(&mut self, cmd: &str, tokens: &[&str]) -> PlatformResult<String> {
        let verb = args_after(tokens, "kubectl").first().copied().unwrap_or_default();
        match verb {
            "apply" => {
                let target = flag_value(tokens, "-f").unwrap_or_default();
                let prefix = format!("{}/", target.trim_end_matches('/'));
                let in_dir: Vec<String> = self
                    .files
                    .keys()
                    .filter(|f| *f == target || f.starts_with(&prefix))
                    .cloned()
                    .collect();
                if tokens.contains(&"--prune") {
                    self.applied.retain(|f| f != target && !f.starts_with(&prefix));
                }
                self.applied.extend(in_dir);
                Ok(String::new())
            }
            "delete" => {
                if let Some(file) = flag_value(tokens, "-f") {
                    if !self.applied.remove(file) {
                        return Err(failed(cmd, format!("Error from server (NotFound): {file} not found")));
                    }
                }
                Ok(String::new())
            }
            "get" if tokens.contains(&"pods") => {
                let ns = flag_value(tokens, "-n").unwrap_or("default");
                let app = tokens
                    .iter()
                    .find_map(|t| t.strip_prefix("--selector=mex-app="))
                    .unwrap_or_default();
                let needle = format!("name: {app}");
                let running = self
                    .applied
                    .iter()
                    .filter_map(|f| self.files.get(f))
                    .any(|body| body.contains(&needle));
                if !running {
                    return Ok(format!("No resources found in {ns} namespace.\n"));
                }
                if cmd.contains("awk") {
                    Ok(format!("{app}-0\n"))
                } else {
                    Ok(format!("{app}-0   1/1   Running   0   1m\n"))
                }
            }
            "get" if tokens.contains(&"pod") => Ok("main".to_string()),
            _ => Ok(String::new()),
        }
    }
}

#[async_trait]
impl PlatformClient for FakeClient {
    async fn output(&self, cmd: &str) -> PlatformResult<String> {
        debug!(%cmd, "fake command");
        self.exec(cmd)
    }

    async fn shell(&self, cmd: &str, io: ShellIo) -> PlatformResult<()> {
        self.exec(cmd)?;
        let ShellIo {
            mut stdin,
            mut stdout,
            stderr: _,
        } = io;
        stdout.write_all(format!("$ {cmd}\n").as_bytes()).await?;
        tokio::io::copy(&mut stdin, &mut stdout).await?;
        stdout.shutdown().await?;
        Ok(())
    }

    async fn start(&self, cmd: &str) -> PlatformResult<Started> {
        self.exec(cmd)?;
        let lines = format!("fake log line 1 for {cmd}\nfake log line 2 for {cmd}\n");
        let (tx, exit) = Exit::channel();
        let _ = tx.send(Ok(()));
        Ok(Started {
            stdin: Box::new(tokio::io::sink()),
            stdout: Box::new(Cursor::new(lines.into_bytes())),
            stderr: Box::new(Cursor::new(Vec::new())),
            exit,
        })
    }
}

// ── FakePlatform ───────────────────────────────────────────────────

pub struct FakePlatform {
    fixture: FakeFixture,
    client: FakeClient,
    clusters: Mutex<BTreeMap<ClusterInstKey, ClusterInst>>,
    active: AtomicBool,
}

impl FakePlatform {
    pub fn new(fixture: FakeFixture) -> Self {
        Self::with_client(fixture, FakeClient::new())
    }

    pub fn with_client(fixture: FakeFixture, client: FakeClient) -> Self {
        Self {
            fixture,
            client,
            clusters: Mutex::new(BTreeMap::new()),
            active: AtomicBool::new(false),
        }
    }

    pub fn fixture(&self) -> &FakeFixture {
        &self.fixture
    }

    pub fn fake_client(&self) -> &FakeClient {
        &self.client
    }

    pub fn has_cluster(&self, key: &ClusterInstKey) -> bool {
        self.clusters().contains_key(key)
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    fn clusters(&self) -> MutexGuard<'_, BTreeMap<ClusterInstKey, ClusterInst>> {
        self.clusters.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl Platform for FakePlatform {
    fn name(&self) -> &str {
        "fake"
    }

    fn features(&self) -> Features {
        Features {
            supports_multi_tenant_cluster: true,
            supports_kubernetes_only: false,
            cloudlet_services_local: true,
            is_fake: true,
        }
    }

    async fn gather_cloudlet_info(&self, info: &mut CloudletInfo) -> PlatformResult<()> {
        let fx = &self.fixture;
        info.os_max_ram = fx.ram_max;
        info.os_max_vcores = fx.vcpus_max;
        info.os_max_vol_gb = fx.disk_max;
        info.flavors = fx.flavors.clone();

        let clusters = self.clusters();
        let dedicated = clusters
            .values()
            .filter(|c| c.ip_access == IpAccess::Dedicated)
            .count() as u64;
        let (mut ram, mut vcpus, mut disk) = (0, 0, 0);
        for ci in clusters.values() {
            if let Some(flavor) = fx.flavors.iter().find(|f| f.name == ci.flavor.name) {
                let nodes = u64::from(ci.num_masters + ci.num_nodes).max(1);
                ram += flavor.ram * nodes;
                vcpus += flavor.vcpus * nodes;
                disk += flavor.disk * nodes;
            }
        }
        info.resources = vec![
            resource("RAM", ram, fx.ram_max, "MB"),
            resource("vCPUs", vcpus, fx.vcpus_max, ""),
            resource("Disk", disk, fx.disk_max, "GB"),
            resource("External IPs", dedicated, fx.external_ips_max, ""),
        ];
        Ok(())
    }

    async fn create_cluster_inst(&self, cluster_inst: &ClusterInst, _timeout: Duration) -> PlatformResult<()> {
        info!(cluster = %cluster_inst.key, "fake cluster created");
        self.clusters()
            .insert(cluster_inst.key.clone(), cluster_inst.clone());
        Ok(())
    }

    async fn update_cluster_inst(&self, cluster_inst: &ClusterInst) -> PlatformResult<()> {
        let mut clusters = self.clusters();
        let Some(existing) = clusters.get_mut(&cluster_inst.key) else {
            return Err(PlatformError::NotFound(format!("cluster {}", cluster_inst.key)));
        };
        *existing = cluster_inst.clone();
        Ok(())
    }

    async fn delete_cluster_inst(&self, cluster_inst: &ClusterInst) -> PlatformResult<()> {
        if self.clusters().remove(&cluster_inst.key).is_none() {
            debug!(cluster = %cluster_inst.key, "fake cluster already gone");
        }
        Ok(())
    }

    fn client(&self) -> Arc<dyn PlatformClient> {
        Arc::new(self.client.clone())
    }

    async fn master_ip(&self, _names: &KubeNames) -> PlatformResult<String> {
        Ok(self.fixture.master_ip.clone())
    }

    async fn docker_network_name(&self, _names: &KubeNames) -> PlatformResult<String> {
        Ok(self.fixture.docker_network.clone())
    }

    async fn become_active(&self) -> PlatformResult<()> {
        self.active.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn list_load_balancers(&self) -> PlatformResult<Vec<String>> {
        Ok(self.fixture.load_balancers.clone())
    }
}

fn resource(name: &str, value: u64, max: u64, units: &str) -> InfraResource {
    InfraResource {
        name: name.to_string(),
        value,
        infra_max_value: max,
        units: units.to_string(),
    }
}
