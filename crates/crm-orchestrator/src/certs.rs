//! TLS certificate refresh for load balancers.
//!
//! One wildcard certificate covers every app behind the cloudlet's load
//! balancers. The active instance issues it, writes it to each load
//! balancer's certs directory, and checks it every `refresh_interval`.
//! The certificate is kept until it would expire before the next check,
//! then reissued. A standby instance never writes.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{Datelike, NaiveDate, Utc};
use crm_core::config::CrmConfig;
use crm_ha::ActiveHandle;
use crm_platform::{Platform, PlatformClient};
use rcgen::{CertificateParams, DistinguishedName, DnType, KeyPair};
use sha2::{Digest, Sha256};
use tokio::sync::{Mutex, watch};
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::error::{OrchestratorError, OrchestratorResult};

/// PEM-encoded certificate and key for one common name.
#[derive(Debug, Clone)]
pub struct TlsCert {
    pub common_name: String,
    pub cert_pem: String,
    pub key_pem: String,
    pub ttl: Duration,
    pub issued: Instant,
}

impl PartialEq for TlsCert {
    fn eq(&self, other: &Self) -> bool {
        self.fingerprint() == other.fingerprint()
    }
}

impl TlsCert {
    /// Hex SHA-256 over both PEMs.
    pub fn fingerprint(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.cert_pem.as_bytes());
        hasher.update(self.key_pem.as_bytes());
        hex::encode(hasher.finalize())
    }

    /// Issue a self-signed certificate valid from today for `ttl`.
    pub fn self_signed(common_name: &str, ttl: Duration) -> OrchestratorResult<Self> {
        let cert_err = |e: rcgen::Error| OrchestratorError::Cert(e.to_string());
        let mut params = CertificateParams::new(vec![common_name.to_string()]).map_err(cert_err)?;
        let mut dn = DistinguishedName::new();
        dn.push(DnType::OrganizationName, "Edge Cloud CRM");
        dn.push(DnType::CommonName, common_name);
        params.distinguished_name = dn;

        let today = Utc::now().date_naive();
        let ttl_days = chrono::Duration::days((ttl.as_secs() / 86_400).max(1) as i64);
        let expires = today.checked_add_signed(ttl_days).unwrap_or(NaiveDate::MAX);
        params.not_before = rcgen::date_time_ymd(today.year(), today.month() as u8, today.day() as u8);
        params.not_after = rcgen::date_time_ymd(expires.year(), expires.month() as u8, expires.day() as u8);

        let key = KeyPair::generate().map_err(cert_err)?;
        let cert = params.self_signed(&key).map_err(cert_err)?;
        Ok(Self {
            common_name: common_name.to_string(),
            cert_pem: cert.pem(),
            key_pem: key.serialize_pem(),
            ttl,
            issued: Instant::now(),
        })
    }

    /// Whether the certificate is still valid `margin` from now.
    pub fn outlasts(&self, margin: Duration) -> bool {
        self.issued.elapsed().saturating_add(margin) < self.ttl
    }
}

#[derive(Default)]
struct CertState {
    current: Option<TlsCert>,
    /// Fingerprint installed on each load balancer.
    installed: HashMap<String, String>,
    /// Load balancers added at runtime, beyond what the platform lists.
    added: HashMap<String, Arc<dyn PlatformClient>>,
}

pub struct CertManager {
    platform: Arc<dyn Platform>,
    config: CrmConfig,
    active: ActiveHandle,
    state: Mutex<CertState>,
}

impl CertManager {
    pub fn new(platform: Arc<dyn Platform>, config: CrmConfig, active: ActiveHandle) -> Self {
        Self {
            platform,
            config,
            active,
            state: Mutex::default(),
        }
    }

    pub fn common_name(&self) -> String {
        if self.config.certs.common_name.is_empty() {
            format!("*.{}", self.config.platform.app_dns_root)
        } else {
            self.config.certs.common_name.clone()
        }
    }

    pub async fn current(&self) -> Option<TlsCert> {
        self.state.lock().await.current.clone()
    }

    /// Reissue the certificate if it would expire before the next refresh,
    /// then install it wherever it is missing. Returns the number of load
    /// balancers written.
    pub async fn refresh_now(&self) -> OrchestratorResult<usize> {
        if !self.active.is_active() {
            debug!("not active, skipping cert refresh");
            return Ok(0);
        }
        let mut state = self.state.lock().await;
        let fresh = state
            .current
            .as_ref()
            .is_some_and(|cert| cert.outlasts(self.config.certs.refresh_interval));
        if fresh {
            debug!("tls cert still valid past the next refresh, reusing it");
        } else {
            let cert = TlsCert::self_signed(&self.common_name(), self.config.certs.cert_ttl)?;
            info!(common_name = %cert.common_name, fingerprint = %cert.fingerprint(), "issued tls cert");
            state.current = Some(cert);
        }
        self.install_all(&mut state).await
    }

    /// Install the current certificate wherever it is missing, issuing
    /// one first if needed.
    pub async fn ensure_installed(&self) -> OrchestratorResult<usize> {
        if !self.active.is_active() {
            return Ok(0);
        }
        let mut state = self.state.lock().await;
        if state.current.is_none() {
            state.current = Some(TlsCert::self_signed(&self.common_name(), self.config.certs.cert_ttl)?);
        }
        self.install_all(&mut state).await
    }

    /// Register a load balancer created after startup and give it the
    /// current certificate.
    pub async fn add_load_balancer(&self, name: &str, client: Arc<dyn PlatformClient>) -> OrchestratorResult<()> {
        let mut state = self.state.lock().await;
        state.added.insert(name.to_string(), client.clone());
        if !self.active.is_active() {
            return Ok(());
        }
        if state.current.is_none() {
            state.current = Some(TlsCert::self_signed(&self.common_name(), self.config.certs.cert_ttl)?);
        }
        if let Some(cert) = state.current.clone() {
            self.install(name, client.as_ref(), &cert).await?;
            state.installed.insert(name.to_string(), cert.fingerprint());
        }
        Ok(())
    }

    async fn install_all(&self, state: &mut CertState) -> OrchestratorResult<usize> {
        let Some(cert) = state.current.clone() else {
            return Ok(0);
        };
        let fingerprint = cert.fingerprint();
        let mut targets: Vec<(String, Arc<dyn PlatformClient>)> = Vec::new();
        for name in self.platform.list_load_balancers().await? {
            if !state.added.contains_key(&name) {
                let client = self.platform.load_balancer_client(&name).await?;
                targets.push((name, client));
            }
        }
        targets.extend(state.added.iter().map(|(n, c)| (n.clone(), c.clone())));

        let mut written = 0;
        for (name, client) in targets {
            if state.installed.get(&name) == Some(&fingerprint) {
                continue;
            }
            match self.install(&name, client.as_ref(), &cert).await {
                Ok(()) => {
                    state.installed.insert(name, fingerprint.clone());
                    written += 1;
                }
                // One unreachable load balancer must not block the others.
                Err(e) => warn!(lb = %name, error = %e, "cert install failed"),
            }
        }
        Ok(written)
    }

    async fn install(&self, lb: &str, client: &dyn PlatformClient, cert: &TlsCert) -> OrchestratorResult<()> {
        let features = self.platform.features();
        let dir = &self.config.certs.certs_dir;
        let sudo = !features.cloudlet_services_local;
        let prefix = if sudo { "sudo " } else { "" };
        client.run(&format!("{prefix}mkdir -p {dir}")).await?;
        if features.is_fake {
            client.write_file(&format!("{dir}/cert.pem"), &cert.cert_pem, "tls cert", sudo).await?;
            client.write_file(&format!("{dir}/key.pem"), &cert.key_pem, "tls key", sudo).await?;
        } else {
            write_atomic(client, dir, cert, sudo).await?;
        }
        info!(%lb, %dir, "installed tls cert");
        Ok(())
    }

    /// Refresh every `refresh_interval` while active, until `shutdown`.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        let mut interval = tokio::time::interval(self.config.certs.refresh_interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    if let Err(e) = self.refresh_now().await {
                        warn!(error = %e, "cert refresh failed");
                    }
                }
                _ = shutdown.changed() => {
                    info!("cert refresh loop shutting down");
                    return;
                }
            }
        }
    }
}

/// Write `*.new` files, then move both into place in one command.
async fn write_atomic(client: &dyn PlatformClient, dir: &str, cert: &TlsCert, sudo: bool) -> OrchestratorResult<()> {
    client.write_file(&format!("{dir}/cert.new"), &cert.cert_pem, "tls cert", sudo).await?;
    client.write_file(&format!("{dir}/key.new"), &cert.key_pem, "tls key", sudo).await?;
    let mv = if sudo { "sudo mv" } else { "mv" };
    client
        .run(&format!(
            "{mv} {dir}/cert.new {dir}/cert.pem && {mv} {dir}/key.new {dir}/key.pem"
        ))
        .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crm_ha::HaState;
    use crm_platform::{FakeClient, FakeFixture, FakePlatform};

    fn manager(active: ActiveHandle) -> (Arc<FakePlatform>, CertManager) {
        let platform = Arc::new(FakePlatform::new(FakeFixture::default()));
        let mut config = CrmConfig::default();
        config.platform.app_dns_root = "fake.net".to_string();
        let mgr = CertManager::new(platform.clone(), config, active);
        (platform, mgr)
    }

    #[test]
    fn self_signed_cert_is_pem_with_stable_fingerprint() {
        let cert = TlsCert::self_signed("*.fake.net", Duration::from_secs(90 * 86_400)).unwrap();
        assert!(cert.cert_pem.contains("BEGIN CERTIFICATE"));
        assert!(cert.key_pem.contains("BEGIN PRIVATE KEY"));
        assert_eq!(cert.fingerprint().len(), 64);
        assert_eq!(cert, cert.clone());

        let other = TlsCert::self_signed("*.fake.net", Duration::from_secs(86_400)).unwrap();
        assert_ne!(cert, other);
    }

    #[tokio::test]
    async fn refresh_writes_every_load_balancer() {
        let (platform, mgr) = manager(ActiveHandle::always_active());
        assert_eq!(mgr.common_name(), "*.fake.net");
        assert_eq!(mgr.refresh_now().await.unwrap(), 1);

        let client = platform.fake_client();
        let cert = mgr.current().await.unwrap();
        assert_eq!(client.file("/root/envoy/certs/cert.pem").unwrap(), cert.cert_pem);
        assert_eq!(client.file("/root/envoy/certs/key.pem").unwrap(), cert.key_pem);

        // Already installed: nothing to write.
        assert_eq!(mgr.ensure_installed().await.unwrap(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn refresh_reuses_a_cert_that_outlasts_the_next_tick() {
        // 90 day ttl, checked every 30 days.
        let (platform, mgr) = manager(ActiveHandle::always_active());
        assert_eq!(mgr.refresh_now().await.unwrap(), 1);
        let first = mgr.current().await.unwrap();

        assert_eq!(mgr.refresh_now().await.unwrap(), 0);
        assert_eq!(mgr.current().await.unwrap(), first);

        tokio::time::advance(Duration::from_secs(30 * 86_400)).await;
        assert_eq!(mgr.refresh_now().await.unwrap(), 0);
        assert_eq!(mgr.current().await.unwrap(), first);

        // Another 30 days would reach the ttl.
        tokio::time::advance(Duration::from_secs(30 * 86_400)).await;
        assert_eq!(mgr.refresh_now().await.unwrap(), 1);
        let second = mgr.current().await.unwrap();
        assert_ne!(second, first);
        assert_eq!(platform.fake_client().file("/root/envoy/certs/cert.pem").unwrap(), second.cert_pem);
    }

    #[tokio::test]
    async fn standby_never_writes() {
        let (_tx, handle) = ActiveHandle::channel(HaState::Standby);
        let (platform, mgr) = manager(handle);
        assert_eq!(mgr.refresh_now().await.unwrap(), 0);
        mgr.add_load_balancer("lb2", Arc::new(FakeClient::new())).await.unwrap();
        assert!(platform.fake_client().files().is_empty());
        assert!(mgr.current().await.is_none());
    }

    #[tokio::test]
    async fn added_load_balancer_gets_the_current_cert() {
        let (_, mgr) = manager(ActiveHandle::always_active());
        mgr.refresh_now().await.unwrap();
        let lb2 = FakeClient::new();
        mgr.add_load_balancer("lb2", Arc::new(lb2.clone())).await.unwrap();
        let cert = mgr.current().await.unwrap();
        assert_eq!(lb2.file("/root/envoy/certs/cert.pem").unwrap(), cert.cert_pem);
    }

    #[tokio::test]
    async fn atomic_write_moves_new_files_into_place() {
        let client = FakeClient::new();
        let cert = TlsCert::self_signed("*.example.net", Duration::from_secs(86_400)).unwrap();
        write_atomic(&client, "/certs", &cert, false).await.unwrap();
        assert_eq!(client.file("/certs/cert.pem").unwrap(), cert.cert_pem);
        assert_eq!(client.file("/certs/key.pem").unwrap(), cert.key_pem);
        assert!(client.file("/certs/cert.new").is_none());
        assert!(client.ran("mv /certs/cert.new /certs/cert.pem && mv /certs/key.new /certs/key.pem"));
    }

    #[tokio::test(start_paused = true)]
    async fn run_refreshes_until_shutdown() {
        let (platform, mgr) = manager(ActiveHandle::always_active());
        let mgr = Arc::new(mgr);
        let (tx, rx) = watch::channel(false);
        let task = tokio::spawn({
            let mgr = mgr.clone();
            async move { mgr.run(rx).await }
        });
        // First tick fires immediately.
        tokio::time::sleep(Duration::from_secs(1)).await;
        let first = mgr.current().await.unwrap();
        tokio::time::sleep(Duration::from_secs(30 * 86_400)).await;
        assert_eq!(mgr.current().await.unwrap(), first);
        tokio::time::sleep(Duration::from_secs(30 * 86_400)).await;
        assert_ne!(mgr.current().await.unwrap(), first);

        tx.send(true).unwrap();
        task.await.unwrap();
        assert!(platform.fake_client().ran("mkdir -p /root/envoy/certs"));
    }
}
