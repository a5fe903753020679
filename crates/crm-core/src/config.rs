//! crmd.toml configuration parser.
//!
//! Every section is optional; missing values fall back to the defaults
//! below. Durations are written in humanized form: `"500ms"`, `"3s"`,
//! `"15m"`, `"2h"`, `"30d"`.

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{CoreError, CoreResult};

/// Role of this instance in a redundant pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HaRole {
    Primary,
    Secondary,
}

impl HaRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            HaRole::Primary => "primary",
            HaRole::Secondary => "secondary",
        }
    }
}

impl fmt::Display for HaRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for HaRole {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "primary" => Ok(HaRole::Primary),
            "secondary" => Ok(HaRole::Secondary),
            other => Err(CoreError::Config(format!(
                "invalid HA role {other:?}, expected primary or secondary"
            ))),
        }
    }
}

/// What to do when the lease store cannot be reached.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DegradedPolicy {
    /// The primary goes active, the secondary stays standby.
    #[default]
    PrimaryActive,
    /// Either role goes active.
    AlwaysActive,
    /// Nobody activates without the store.
    StayStandby,
}

impl DegradedPolicy {
    /// Whether `role` may go active while the store is unreachable.
    pub fn allows(&self, role: HaRole) -> bool {
        match self {
            DegradedPolicy::PrimaryActive => role == HaRole::Primary,
            DegradedPolicy::AlwaysActive => true,
            DegradedPolicy::StayStandby => false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct HaConfig {
    /// Lease key shared by the redundant pair.
    pub node_group_key: String,
    #[serde(with = "humanized")]
    pub active_duration: Duration,
    #[serde(with = "humanized")]
    pub poll_interval: Duration,
    #[serde(with = "humanized")]
    pub initial_connect_timeout: Duration,
    pub degraded_policy: DegradedPolicy,
}

impl Default for HaConfig {
    fn default() -> Self {
        Self {
            node_group_key: String::new(),
            active_duration: Duration::from_secs(10),
            poll_interval: Duration::from_secs(3),
            initial_connect_timeout: Duration::from_secs(30),
            degraded_policy: DegradedPolicy::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct CertsConfig {
    #[serde(with = "humanized")]
    pub refresh_interval: Duration,
    /// Defaults to `*.{app_dns_root}` when empty.
    pub common_name: String,
    /// Directory on each load balancer that holds `cert.pem`/`key.pem`.
    pub certs_dir: String,
    #[serde(with = "humanized")]
    pub cert_ttl: Duration,
}

impl Default for CertsConfig {
    fn default() -> Self {
        Self {
            refresh_interval: Duration::from_secs(30 * 24 * 3600),
            common_name: String::new(),
            certs_dir: "/root/envoy/certs".to_string(),
            cert_ttl: Duration::from_secs(90 * 24 * 3600),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct PlatformConfig {
    pub name: String,
    pub app_dns_root: String,
    /// Where manifests and cluster configs are written.
    pub config_dir: PathBuf,
    /// Working directory for local command execution.
    pub working_dir: PathBuf,
}

impl Default for PlatformConfig {
    fn default() -> Self {
        Self {
            name: "fake".to_string(),
            app_dns_root: "mobiledgex.net".to_string(),
            config_dir: PathBuf::from("/tmp/crm/config"),
            working_dir: PathBuf::from("/tmp"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct OrchestratorConfig {
    #[serde(with = "humanized")]
    pub pod_wait_timeout: Duration,
    #[serde(with = "humanized")]
    pub pod_poll_interval: Duration,
    /// How long "No resources found" is tolerated while creating.
    #[serde(with = "humanized")]
    pub no_resources_grace: Duration,
    /// Upper bound for a platform cluster create.
    #[serde(with = "humanized")]
    pub cluster_timeout: Duration,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            pod_wait_timeout: Duration::from_secs(15 * 60),
            pod_poll_interval: Duration::from_secs(1),
            no_resources_grace: Duration::from_secs(10),
            cluster_timeout: Duration::from_secs(30 * 60),
        }
    }
}

/// Top-level CRM configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct CrmConfig {
    pub ha: HaConfig,
    pub certs: CertsConfig,
    pub platform: PlatformConfig,
    pub orchestrator: OrchestratorConfig,
}

impl CrmConfig {
    pub fn from_file(path: &Path) -> CoreResult<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: CrmConfig = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_toml_string(&self) -> CoreResult<String> {
        toml::to_string_pretty(self).map_err(|e| CoreError::Config(e.to_string()))
    }

    /// Reject combinations that break the lease timing contract.
    pub fn validate(&self) -> CoreResult<()> {
        let ha = &self.ha;
        if ha.poll_interval.is_zero() {
            return Err(CoreError::Config("ha.poll_interval must be non-zero".into()));
        }
        if ha.poll_interval * 3 > ha.active_duration {
            return Err(CoreError::Config(format!(
                "ha.poll_interval ({:?}) must be at most a third of ha.active_duration ({:?})",
                ha.poll_interval, ha.active_duration
            )));
        }
        if self.orchestrator.pod_poll_interval.is_zero() {
            return Err(CoreError::Config(
                "orchestrator.pod_poll_interval must be non-zero".into(),
            ));
        }
        Ok(())
    }
}

/// Parse a duration string like "5s", "500ms", "15m", "2h", "30d".
pub fn parse_duration(s: &str) -> Option<Duration> {
    let s = s.trim();
    if let Some(ms) = s.strip_suffix("ms") {
        ms.parse::<u64>().ok().map(Duration::from_millis)
    } else if let Some(secs) = s.strip_suffix('s') {
        secs.parse::<u64>().ok().map(Duration::from_secs)
    } else if let Some(mins) = s.strip_suffix('m') {
        mins.parse::<u64>().ok().map(|m| Duration::from_secs(m * 60))
    } else if let Some(hours) = s.strip_suffix('h') {
        hours.parse::<u64>().ok().map(|h| Duration::from_secs(h * 3600))
    } else if let Some(days) = s.strip_suffix('d') {
        days.parse::<u64>().ok().map(|d| Duration::from_secs(d * 86400))
    } else {
        s.parse::<u64>().ok().map(Duration::from_secs)
    }
}

/// Render a duration in the largest unit that divides it evenly.
pub fn format_duration(d: Duration) -> String {
    let millis = d.as_millis();
    if millis % 1000 != 0 {
        return format!("{millis}ms");
    }
    let secs = d.as_secs();
    match secs {
        0 => "0s".to_string(),
        s if s % 86400 == 0 => format!("{}d", s / 86400),
        s if s % 3600 == 0 => format!("{}h", s / 3600),
        s if s % 60 == 0 => format!("{}m", s / 60),
        s => format!("{s}s"),
    }
}

mod humanized {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&super::format_duration(*d))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        let raw = String::deserialize(d)?;
        super::parse_duration(&raw)
            .ok_or_else(|| serde::de::Error::custom(format!("invalid duration {raw:?}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let config = CrmConfig::default();
        config.validate().unwrap();
        assert_eq!(config.ha.degraded_policy, DegradedPolicy::PrimaryActive);
    }

    #[test]
    fn parse_partial_file() {
        let toml_str = r#"
[ha]
node_group_key = "cloud2/TMUS"
active_duration = "9s"
poll_interval = "3s"
degraded_policy = "stay-standby"

[certs]
refresh_interval = "30d"
"#;
        let config: CrmConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.ha.active_duration, Duration::from_secs(9));
        assert_eq!(config.ha.degraded_policy, DegradedPolicy::StayStandby);
        assert_eq!(config.certs.refresh_interval, Duration::from_secs(30 * 86400));
        assert_eq!(config.platform.name, "fake");
        config.validate().unwrap();
    }

    #[test]
    fn poll_interval_must_leave_margin() {
        let mut config = CrmConfig::default();
        config.ha.poll_interval = Duration::from_secs(5);
        config.ha.active_duration = Duration::from_secs(10);
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("poll_interval"));
    }

    #[test]
    fn from_file_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("crmd.toml");
        let mut config = CrmConfig::default();
        config.platform.name = "kind".to_string();
        std::fs::write(&path, config.to_toml_string().unwrap()).unwrap();

        let loaded = CrmConfig::from_file(&path).unwrap();
        assert_eq!(loaded, config);
    }

    #[test]
    fn duration_strings() {
        assert_eq!(parse_duration("500ms"), Some(Duration::from_millis(500)));
        assert_eq!(parse_duration("2h"), Some(Duration::from_secs(7200)));
        assert_eq!(parse_duration("soon"), None);
        assert_eq!(format_duration(Duration::from_secs(90)), "90s");
        assert_eq!(format_duration(Duration::from_secs(180)), "3m");
    }

    #[test]
    fn role_parsing() {
        assert_eq!("secondary".parse::<HaRole>().unwrap(), HaRole::Secondary);
        assert!("tertiary".parse::<HaRole>().is_err());
        assert!(DegradedPolicy::PrimaryActive.allows(HaRole::Primary));
        assert!(!DegradedPolicy::PrimaryActive.allows(HaRole::Secondary));
    }
}
