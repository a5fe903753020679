//! crmd — the CRM daemon.
//!
//! # Usage
//!
//! ```text
//! crmd --cloudlet-key '{"organization":"TMUS","name":"cloud2"}' \
//!      --notify-addrs 10.0.0.2:37001 --platform PLATFORM_TYPE_FAKEINFRA \
//!      --ha-role primary --lease-path /var/lib/crm/lease.redb
//! ```

use std::net::SocketAddr;
use std::path::PathBuf;

use anyhow::Context;
use clap::{Parser, ValueEnum};
use crm_core::{CloudletKey, CrmConfig, HaRole};
use crmd::DaemonOptions;
use tracing::info;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum RoleArg {
    Primary,
    Secondary,
    /// No election; this instance is always active.
    Disabled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Parser, Debug)]
#[command(name = "crmd", about = "Cloudlet resource manager daemon")]
struct Cli {
    /// Address the sync and exec API listens on.
    #[arg(long, default_value = "0.0.0.0:55099")]
    bind: SocketAddr,

    /// Controller addresses that receive status, comma separated.
    #[arg(long, value_delimiter = ',')]
    notify_addrs: Vec<String>,

    /// Cloudlet this CRM manages, as JSON.
    #[arg(long)]
    cloudlet_key: String,

    /// Primary and secondary need `--lease-path`.
    #[arg(long, value_enum, default_value = "primary")]
    ha_role: RoleArg,

    /// Lease file shared with the other HA instance.
    #[arg(long)]
    lease_path: Option<PathBuf>,

    /// File holding the key API clients must present.
    #[arg(long)]
    access_key_file: Option<PathBuf>,

    /// Platform backend; overrides the config file.
    #[arg(long)]
    platform: Option<String>,

    /// TOML config file.
    #[arg(long)]
    config: Option<PathBuf>,

    #[arg(long, value_enum, default_value = "text")]
    log_format: LogFormat,
}

fn init_tracing(format: LogFormat) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info,crmd=debug,crm=debug"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    match format {
        LogFormat::Text => builder.init(),
        LogFormat::Json => builder.json().init(),
    }
}

fn options(cli: &Cli) -> anyhow::Result<DaemonOptions> {
    let mut config = match &cli.config {
        Some(path) => CrmConfig::from_file(path).with_context(|| format!("loading {}", path.display()))?,
        None => CrmConfig::default(),
    };
    if let Some(platform) = &cli.platform {
        config.platform.name = platform.clone();
    }
    config.validate()?;

    let cloudlet_key: CloudletKey =
        serde_json::from_str(&cli.cloudlet_key).context("parsing --cloudlet-key")?;
    if cloudlet_key.organization.is_empty() || cloudlet_key.name.is_empty() {
        anyhow::bail!("--cloudlet-key needs both organization and name");
    }

    let access_key = match &cli.access_key_file {
        Some(path) => Some(
            std::fs::read_to_string(path)
                .with_context(|| format!("reading access key {}", path.display()))?
                .trim()
                .to_string(),
        ),
        None => None,
    };

    Ok(DaemonOptions {
        config,
        cloudlet_key,
        ha_role: match cli.ha_role {
            RoleArg::Primary => Some(HaRole::Primary),
            RoleArg::Secondary => Some(HaRole::Secondary),
            RoleArg::Disabled => None,
        },
        lease_path: cli.lease_path.clone(),
        notify_addrs: cli.notify_addrs.clone(),
        access_key,
    })
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_format);

    let opts = options(&cli)?;
    let listener = tokio::net::TcpListener::bind(cli.bind)
        .await
        .with_context(|| format!("binding {}", cli.bind))?;

    crmd::run(opts, listener, async {
        let _ = tokio::signal::ctrl_c().await;
    })
    .await?;

    info!("exiting");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flags_override_the_config() {
        let cli = Cli::parse_from([
            "crmd",
            "--cloudlet-key",
            r#"{"organization":"TMUS","name":"cloud2"}"#,
            "--notify-addrs",
            "10.0.0.2:37001,10.0.0.3:37001",
            "--platform",
            "kind",
            "--ha-role",
            "disabled",
        ]);
        let opts = options(&cli).unwrap();
        assert_eq!(opts.cloudlet_key, CloudletKey::new("TMUS", "cloud2"));
        assert_eq!(opts.notify_addrs.len(), 2);
        assert_eq!(opts.config.platform.name, "kind");
        assert_eq!(opts.ha_role, None);
    }

    #[test]
    fn cloudlet_key_is_required_in_full() {
        let cli = Cli::parse_from(["crmd", "--cloudlet-key", r#"{"organization":"TMUS","name":""}"#]);
        assert!(options(&cli).is_err());
        let cli = Cli::parse_from(["crmd", "--cloudlet-key", "cloud2"]);
        assert!(options(&cli).is_err());
    }
}
