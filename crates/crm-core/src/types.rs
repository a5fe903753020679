//! Controller objects, status objects, and their keys.
//!
//! Every object that travels between the controller and the CRM is keyed by
//! a composite, immutable key. Keys render to a canonical string form via
//! `Display`, which is what the caches and the sync API index on.

use std::fmt;
use std::hash::Hash;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::{CoreError, CoreResult};

/// An object that can live in a desired-state or status cache.
pub trait CacheObject: Clone + Send + Sync + Serialize + DeserializeOwned + 'static {
    type Key: Clone + Eq + Hash + Ord + fmt::Display + fmt::Debug + Send + Sync + 'static;

    /// Object kind, as used on the sync wire.
    const KIND: ObjectKind;

    fn key(&self) -> Self::Key;

    /// The cloudlet this object belongs to, if it is cloudlet-scoped.
    fn cloudlet_key(&self) -> Option<&CloudletKey> {
        None
    }
}

/// Object kinds known to the sync layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ObjectKind {
    Cloudlet,
    Flavor,
    App,
    AppInst,
    ClusterInst,
    TrustPolicy,
    VmPool,
    CloudletInfo,
    ClusterInstInfo,
    AppInstInfo,
}

impl ObjectKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ObjectKind::Cloudlet => "cloudlet",
            ObjectKind::Flavor => "flavor",
            ObjectKind::App => "app",
            ObjectKind::AppInst => "app_inst",
            ObjectKind::ClusterInst => "cluster_inst",
            ObjectKind::TrustPolicy => "trust_policy",
            ObjectKind::VmPool => "vm_pool",
            ObjectKind::CloudletInfo => "cloudlet_info",
            ObjectKind::ClusterInstInfo => "cluster_inst_info",
            ObjectKind::AppInstInfo => "app_inst_info",
        }
    }
}

impl fmt::Display for ObjectKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ── Keys ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CloudletKey {
    pub organization: String,
    pub name: String,
}

impl CloudletKey {
    pub fn new(organization: &str, name: &str) -> Self {
        Self {
            organization: organization.to_string(),
            name: name.to_string(),
        }
    }
}

impl fmt::Display for CloudletKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.organization, self.name)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ClusterKey {
    pub name: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ClusterInstKey {
    pub cluster_key: ClusterKey,
    pub cloudlet_key: CloudletKey,
    /// Developer organization owning the cluster.
    pub organization: String,
}

impl ClusterInstKey {
    pub fn new(cluster: &str, cloudlet_key: CloudletKey, organization: &str) -> Self {
        Self {
            cluster_key: ClusterKey {
                name: cluster.to_string(),
            },
            cloudlet_key,
            organization: organization.to_string(),
        }
    }

    /// Same cluster instance addressed under a different cluster name.
    ///
    /// App instances on a multi-tenant cluster carry a virtual cluster
    /// name that differs from the real cluster they run on.
    pub fn with_cluster_name(&self, name: &str) -> Self {
        let mut key = self.clone();
        key.cluster_key.name = name.to_string();
        key
    }
}

impl fmt::Display for ClusterInstKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{}@{}",
            self.organization, self.cluster_key.name, self.cloudlet_key
        )
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct AppKey {
    pub organization: String,
    pub name: String,
    pub version: String,
}

impl AppKey {
    pub fn new(organization: &str, name: &str, version: &str) -> Self {
        Self {
            organization: organization.to_string(),
            name: name.to_string(),
            version: version.to_string(),
        }
    }
}

impl fmt::Display for AppKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}:{}", self.organization, self.name, self.version)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct AppInstKey {
    pub app_key: AppKey,
    pub cluster_inst_key: ClusterInstKey,
}

impl fmt::Display for AppInstKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.app_key, self.cluster_inst_key)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct FlavorKey {
    pub name: String,
}

impl fmt::Display for FlavorKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)
    }
}

/// Key for organization-scoped policies and pools.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PolicyKey {
    pub organization: String,
    pub name: String,
}

impl fmt::Display for PolicyKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.organization, self.name)
    }
}

// ── Enums ──────────────────────────────────────────────────────────

/// Lifecycle state of a controller-managed object.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TrackedState {
    #[default]
    Unknown,
    NotPresent,
    CreateRequested,
    Creating,
    CreateError,
    Ready,
    UpdateRequested,
    Updating,
    UpdateError,
    DeleteRequested,
    Deleting,
    DeleteError,
    DeleteDone,
    CrmInitok,
}

impl TrackedState {
    /// States that ask the CRM to do work.
    pub fn is_request(&self) -> bool {
        matches!(
            self,
            TrackedState::CreateRequested
                | TrackedState::UpdateRequested
                | TrackedState::DeleteRequested
        )
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeploymentType {
    #[default]
    Kubernetes,
    Helm,
    Docker,
    Vm,
}

impl DeploymentType {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeploymentType::Kubernetes => "kubernetes",
            DeploymentType::Helm => "helm",
            DeploymentType::Docker => "docker",
            DeploymentType::Vm => "vm",
        }
    }
}

impl fmt::Display for DeploymentType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IpAccess {
    #[default]
    Shared,
    Dedicated,
}

/// Layer-4 protocol of an exposed port.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum LProto {
    #[default]
    Tcp,
    Udp,
    Http,
}

impl LProto {
    /// Protocol name as used in Kubernetes and docker port specs.
    pub fn k8s_name(&self) -> &'static str {
        match self {
            LProto::Tcp | LProto::Http => "TCP",
            LProto::Udp => "UDP",
        }
    }
}

/// A port exposed by an AppInst.
///
/// `end_port` is zero for single ports. For ranges it is the last public
/// port, and internal ports must equal public ports.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AppPort {
    pub proto: LProto,
    pub internal_port: u32,
    pub public_port: u32,
    #[serde(default)]
    pub end_port: u32,
    #[serde(default)]
    pub tls: bool,
    /// Force nginx for this port even when envoy could serve it.
    #[serde(default)]
    pub nginx: bool,
}

impl AppPort {
    pub fn is_range(&self) -> bool {
        self.end_port != 0 && self.end_port != self.public_port
    }

    /// Number of ports covered by this entry.
    pub fn count(&self) -> u32 {
        if self.end_port == 0 {
            1
        } else {
            self.end_port.saturating_sub(self.public_port) + 1
        }
    }

    /// Last internal port of the entry.
    pub fn internal_end_port(&self) -> u32 {
        self.internal_port + self.count() - 1
    }
}

/// Parse an App's `access_ports`, e.g. `tcp:443,udp:10101,tcp:5000-5010:tls`.
///
/// Internal and public ports start out equal; the controller remaps public
/// ports when it builds the AppInst.
pub fn parse_app_ports(access_ports: &str) -> CoreResult<Vec<AppPort>> {
    let mut ports = Vec::new();
    for spec in access_ports.split(',').map(str::trim).filter(|s| !s.is_empty()) {
        let mut parts = spec.split(':');
        let proto = match parts.next().map(str::to_ascii_lowercase).as_deref() {
            Some("tcp") => LProto::Tcp,
            Some("udp") => LProto::Udp,
            Some("http") => LProto::Http,
            _ => return Err(CoreError::InvalidPort(format!("{spec}: unsupported protocol"))),
        };
        let range = parts
            .next()
            .ok_or_else(|| CoreError::InvalidPort(format!("{spec}: missing port")))?;
        let (start, end) = match range.split_once('-') {
            Some((a, b)) => (parse_port(spec, a)?, parse_port(spec, b)?),
            None => (parse_port(spec, range)?, 0),
        };
        if end != 0 && end < start {
            return Err(CoreError::InvalidPort(format!("{spec}: end port before start port")));
        }
        let mut port = AppPort {
            proto,
            internal_port: start,
            public_port: start,
            end_port: if end == start { 0 } else { end },
            ..Default::default()
        };
        for flag in parts {
            match flag.to_ascii_lowercase().as_str() {
                "tls" => port.tls = true,
                "nginx" => port.nginx = true,
                other => {
                    return Err(CoreError::InvalidPort(format!("{spec}: unknown option {other:?}")));
                }
            }
        }
        ports.push(port);
    }
    Ok(ports)
}

fn parse_port(spec: &str, raw: &str) -> CoreResult<u32> {
    match raw.trim().parse::<u32>() {
        Ok(p) if (1..=65535).contains(&p) => Ok(p),
        _ => Err(CoreError::InvalidPort(format!("{spec}: invalid port {raw:?}"))),
    }
}

// ── Desired-state objects ──────────────────────────────────────────

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Cloudlet {
    pub key: CloudletKey,
    #[serde(default)]
    pub state: TrackedState,
    #[serde(default)]
    pub platform_type: String,
    #[serde(default)]
    pub physical_name: String,
    #[serde(default)]
    pub container_version: String,
}

impl CacheObject for Cloudlet {
    type Key = CloudletKey;
    const KIND: ObjectKind = ObjectKind::Cloudlet;

    fn key(&self) -> CloudletKey {
        self.key.clone()
    }

    fn cloudlet_key(&self) -> Option<&CloudletKey> {
        Some(&self.key)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Flavor {
    pub key: FlavorKey,
    /// RAM in MB.
    pub ram: u64,
    pub vcpus: u64,
    /// Disk in GB.
    pub disk: u64,
}

impl CacheObject for Flavor {
    type Key = FlavorKey;
    const KIND: ObjectKind = ObjectKind::Flavor;

    fn key(&self) -> FlavorKey {
        self.key.clone()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct App {
    pub key: AppKey,
    #[serde(default)]
    pub image_path: String,
    #[serde(default)]
    pub deployment: DeploymentType,
    #[serde(default)]
    pub deployment_manifest: String,
    /// Comma separated, e.g. `tcp:443,udp:10101`.
    #[serde(default)]
    pub access_ports: String,
    #[serde(default)]
    pub annotations: String,
    /// Delimiter pair for deployment variables, e.g. `[[ ]]`.
    #[serde(default)]
    pub template_delimiter: String,
    #[serde(default)]
    pub command: String,
    #[serde(default)]
    pub revision: String,
}

impl CacheObject for App {
    type Key = AppKey;
    const KIND: ObjectKind = ObjectKind::App;

    fn key(&self) -> AppKey {
        self.key.clone()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ClusterInst {
    pub key: ClusterInstKey,
    #[serde(default)]
    pub flavor: FlavorKey,
    #[serde(default)]
    pub num_masters: u32,
    #[serde(default)]
    pub num_nodes: u32,
    /// `kubernetes` or `docker`.
    #[serde(default)]
    pub deployment: DeploymentType,
    #[serde(default)]
    pub ip_access: IpAccess,
    #[serde(default)]
    pub multi_tenant: bool,
    #[serde(default)]
    pub state: TrackedState,
}

impl CacheObject for ClusterInst {
    type Key = ClusterInstKey;
    const KIND: ObjectKind = ObjectKind::ClusterInst;

    fn key(&self) -> ClusterInstKey {
        self.key.clone()
    }

    fn cloudlet_key(&self) -> Option<&CloudletKey> {
        Some(&self.key.cloudlet_key)
    }
}

/// Runtime facts about a running AppInst.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AppInstRuntime {
    #[serde(default)]
    pub container_ids: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AppInst {
    pub key: AppInstKey,
    /// Real cluster name when `key` names a virtual cluster on a
    /// multi-tenant cluster. Empty otherwise.
    #[serde(default)]
    pub real_cluster_name: String,
    #[serde(default)]
    pub uri: String,
    #[serde(default)]
    pub mapped_ports: Vec<AppPort>,
    #[serde(default)]
    pub flavor: FlavorKey,
    #[serde(default)]
    pub state: TrackedState,
    #[serde(default)]
    pub runtime_info: AppInstRuntime,
    #[serde(default)]
    pub revision: String,
}

impl AppInst {
    /// Key of the ClusterInst this AppInst actually runs on.
    pub fn real_cluster_inst_key(&self) -> ClusterInstKey {
        if self.real_cluster_name.is_empty() {
            self.key.cluster_inst_key.clone()
        } else {
            self.key
                .cluster_inst_key
                .with_cluster_name(&self.real_cluster_name)
        }
    }
}

impl CacheObject for AppInst {
    type Key = AppInstKey;
    const KIND: ObjectKind = ObjectKind::AppInst;

    fn key(&self) -> AppInstKey {
        self.key.clone()
    }

    fn cloudlet_key(&self) -> Option<&CloudletKey> {
        Some(&self.key.cluster_inst_key.cloudlet_key)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SecurityRule {
    pub protocol: String,
    pub port_range_min: u32,
    pub port_range_max: u32,
    pub remote_cidr: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TrustPolicy {
    pub key: PolicyKey,
    #[serde(default)]
    pub outbound_security_rules: Vec<SecurityRule>,
}

impl CacheObject for TrustPolicy {
    type Key = PolicyKey;
    const KIND: ObjectKind = ObjectKind::TrustPolicy;

    fn key(&self) -> PolicyKey {
        self.key.clone()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Vm {
    pub name: String,
    #[serde(default)]
    pub external_ip: String,
    #[serde(default)]
    pub internal_ip: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct VmPool {
    pub key: PolicyKey,
    #[serde(default)]
    pub vms: Vec<Vm>,
}

impl CacheObject for VmPool {
    type Key = PolicyKey;
    const KIND: ObjectKind = ObjectKind::VmPool;

    fn key(&self) -> PolicyKey {
        self.key.clone()
    }
}

// ── Status objects ─────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CloudletState {
    #[default]
    Unknown,
    Init,
    Ready,
    Errors,
    Offline,
    NeedSync,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FlavorInfo {
    pub name: String,
    pub vcpus: u64,
    pub ram: u64,
    pub disk: u64,
}

impl From<&Flavor> for FlavorInfo {
    fn from(flavor: &Flavor) -> Self {
        Self {
            name: flavor.key.name.clone(),
            vcpus: flavor.vcpus,
            ram: flavor.ram,
            disk: flavor.disk,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct InfraResource {
    pub name: String,
    pub value: u64,
    pub infra_max_value: u64,
    pub units: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CloudletInfo {
    pub key: CloudletKey,
    #[serde(default)]
    pub state: CloudletState,
    #[serde(default)]
    pub container_version: String,
    #[serde(default)]
    pub os_max_ram: u64,
    #[serde(default)]
    pub os_max_vcores: u64,
    #[serde(default)]
    pub os_max_vol_gb: u64,
    #[serde(default)]
    pub flavors: Vec<FlavorInfo>,
    #[serde(default)]
    pub resources: Vec<InfraResource>,
    /// Role of the CRM that last published this info.
    #[serde(default)]
    pub active_crm_role: String,
    #[serde(default)]
    pub errors: Vec<String>,
}

impl CacheObject for CloudletInfo {
    type Key = CloudletKey;
    const KIND: ObjectKind = ObjectKind::CloudletInfo;

    fn key(&self) -> CloudletKey {
        self.key.clone()
    }

    fn cloudlet_key(&self) -> Option<&CloudletKey> {
        Some(&self.key)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ClusterInstInfo {
    pub key: ClusterInstKey,
    #[serde(default)]
    pub state: TrackedState,
    #[serde(default)]
    pub errors: Vec<String>,
    #[serde(default)]
    pub status: String,
}

impl CacheObject for ClusterInstInfo {
    type Key = ClusterInstKey;
    const KIND: ObjectKind = ObjectKind::ClusterInstInfo;

    fn key(&self) -> ClusterInstKey {
        self.key.clone()
    }

    fn cloudlet_key(&self) -> Option<&CloudletKey> {
        Some(&self.key.cloudlet_key)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AppInstInfo {
    pub key: AppInstKey,
    #[serde(default)]
    pub state: TrackedState,
    #[serde(default)]
    pub errors: Vec<String>,
    #[serde(default)]
    pub runtime_info: AppInstRuntime,
    #[serde(default)]
    pub status: String,
}

impl CacheObject for AppInstInfo {
    type Key = AppInstKey;
    const KIND: ObjectKind = ObjectKind::AppInstInfo;

    fn key(&self) -> AppInstKey {
        self.key.clone()
    }

    fn cloudlet_key(&self) -> Option<&CloudletKey> {
        Some(&self.key.cluster_inst_key.cloudlet_key)
    }
}

// ── Exec ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RunCmd {
    pub command: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ShowLog {
    #[serde(default)]
    pub since: String,
    #[serde(default)]
    pub tail: u32,
    #[serde(default)]
    pub timestamps: bool,
    #[serde(default)]
    pub follow: bool,
}

/// Request to run a command, or stream logs, inside an AppInst.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExecRequest {
    pub app_inst_key: AppInstKey,
    /// `[namespace/]pod[/container]` for Kubernetes, container name for docker.
    #[serde(default)]
    pub container_id: String,
    #[serde(default)]
    pub cmd: Option<RunCmd>,
    #[serde(default)]
    pub log: Option<ShowLog>,
    /// Caller's session offer.
    #[serde(default)]
    pub offer: String,
    /// Session answer, filled in by the CRM.
    #[serde(default)]
    pub answer: String,
    #[serde(default)]
    pub err: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_app_inst() -> AppInst {
        AppInst {
            key: AppInstKey {
                app_key: AppKey::new("devorg", "myapp", "1.0"),
                cluster_inst_key: ClusterInstKey::new(
                    "autocluster1",
                    CloudletKey::new("operorg", "cloudlet1"),
                    "MobiledgeX",
                ),
            },
            real_cluster_name: "defaultmtclust".to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn key_display_is_stable() {
        let inst = test_app_inst();
        assert_eq!(
            inst.key.to_string(),
            "devorg/myapp:1.0#MobiledgeX/autocluster1@operorg/cloudlet1"
        );
    }

    #[test]
    fn real_cluster_key_swaps_virtual_name() {
        let inst = test_app_inst();
        let real = inst.real_cluster_inst_key();
        assert_eq!(real.cluster_key.name, "defaultmtclust");
        assert_eq!(real.cloudlet_key, inst.key.cluster_inst_key.cloudlet_key);

        let mut plain = inst.clone();
        plain.real_cluster_name.clear();
        assert_eq!(plain.real_cluster_inst_key(), plain.key.cluster_inst_key);
    }

    #[test]
    fn port_range_counts() {
        let single = AppPort {
            proto: LProto::Tcp,
            internal_port: 443,
            public_port: 443,
            ..Default::default()
        };
        assert!(!single.is_range());
        assert_eq!(single.count(), 1);

        let range = AppPort {
            proto: LProto::Tcp,
            internal_port: 51000,
            public_port: 51000,
            end_port: 52000,
            ..Default::default()
        };
        assert!(range.is_range());
        assert_eq!(range.count(), 1001);
        assert_eq!(range.internal_end_port(), 52000);
    }

    #[test]
    fn access_ports_parse() {
        let ports = parse_app_ports("tcp:443:tls, udp:10101,tcp:51000-52000").unwrap();
        assert_eq!(ports.len(), 3);
        assert!(ports[0].tls);
        assert_eq!(ports[1].proto, LProto::Udp);
        assert_eq!(ports[2].end_port, 52000);
        assert!(ports[2].is_range());

        assert!(parse_app_ports("").unwrap().is_empty());
        let err = parse_app_ports("sctp:80").unwrap_err();
        assert!(err.to_string().contains("unsupported protocol"));
        assert!(parse_app_ports("tcp:70000").is_err());
        assert!(parse_app_ports("tcp:90-80").is_err());
    }

    #[test]
    fn tracked_state_wire_format() {
        let json = serde_json::to_string(&TrackedState::CreateRequested).unwrap();
        assert_eq!(json, "\"CREATE_REQUESTED\"");
        assert!(TrackedState::DeleteRequested.is_request());
        assert!(!TrackedState::Ready.is_request());
    }

    #[test]
    fn app_inst_deserializes_with_defaults() {
        let json = r#"{"key":{"app_key":{"organization":"o","name":"n","version":"1"},
            "cluster_inst_key":{"cluster_key":{"name":"c"},
            "cloudlet_key":{"organization":"op","name":"cl"},"organization":"o"}}}"#;
        let inst: AppInst = serde_json::from_str(json).unwrap();
        assert_eq!(inst.state, TrackedState::Unknown);
        assert!(inst.mapped_ports.is_empty());
        assert_eq!(inst.cloudlet_key().unwrap().name, "cl");
    }
}
