//! HighAvailabilityManager — lease-based election between a primary and a
//! secondary CRM.
//!
//! Each poll cycle produces one [`HaEvent`]; the [`transition`] table decides
//! the next state and which hook runs. The active flag is only published
//! after the PreSwitch hook has succeeded.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crm_core::{HaConfig, HaRole};

use crate::error::{HaError, HaResult};
use crate::lease::LeaseStore;
use crate::state::{HaEvent, HaState, Hook, transition};

/// Attempts per cycle for a lease write before the cycle counts as failed.
const LEASE_ATTEMPTS: u32 = 3;
/// Consecutive failed renewal cycles tolerated while holding the lease.
const RENEW_FAILURE_LIMIT: u32 = 2;
/// Minimum gap between "still standby/active" debug lines.
const STATUS_LOG_INTERVAL: Duration = Duration::from_secs(10);
const CONNECT_BACKOFF_START: Duration = Duration::from_millis(250);
const CONNECT_BACKOFF_MAX: Duration = Duration::from_secs(5);

/// Callbacks run around an activation.
#[async_trait]
pub trait HaWatcher: Send + Sync {
    /// Runs before the active flag is published. An error is fatal.
    async fn active_changed_pre_switch(&self) -> anyhow::Result<()>;

    /// Runs after the active flag is published.
    async fn active_changed_post_switch(&self) -> anyhow::Result<()>;

    /// Runs once when the instance is active straight from startup.
    async fn platform_active_on_startup(&self) {}
}

/// Read side of the published HA state. Cheap to clone.
#[derive(Debug, Clone)]
pub struct ActiveHandle {
    rx: watch::Receiver<HaState>,
}

impl ActiveHandle {
    /// A sender/handle pair outside any manager, for callers that drive
    /// the state themselves.
    pub fn channel(initial: HaState) -> (watch::Sender<HaState>, Self) {
        let (tx, rx) = watch::channel(initial);
        (tx, Self { rx })
    }

    /// A handle that always reports active.
    pub fn always_active() -> Self {
        Self::channel(HaState::Disabled).1
    }

    pub fn is_active(&self) -> bool {
        self.rx.borrow().is_active()
    }

    pub fn state(&self) -> HaState {
        *self.rx.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<HaState> {
        self.rx.clone()
    }
}

pub struct HighAvailabilityManager {
    role: HaRole,
    config: HaConfig,
    store: Option<Arc<dyn LeaseStore>>,
    state_tx: watch::Sender<HaState>,

    store_failed: bool,
    store_recovered_at: Option<Instant>,
    last_bump: Option<Instant>,
    last_check: Instant,
    renew_failures: u32,
    last_status_log: Option<Instant>,
}

impl HighAvailabilityManager {
    pub fn new(role: HaRole, config: HaConfig, store: Arc<dyn LeaseStore>) -> Self {
        let (state_tx, _) = watch::channel(HaState::Standby);
        Self {
            role,
            config,
            store: Some(store),
            state_tx,
            store_failed: false,
            store_recovered_at: None,
            last_bump: None,
            last_check: Instant::now(),
            renew_failures: 0,
            last_status_log: None,
        }
    }

    /// A manager with HA turned off. The instance is always active.
    pub fn disabled() -> Self {
        warn!("high availability disabled, this CRM is unconditionally active");
        let (state_tx, _) = watch::channel(HaState::Disabled);
        Self {
            role: HaRole::Primary,
            config: HaConfig::default(),
            store: None,
            state_tx,
            store_failed: false,
            store_recovered_at: None,
            last_bump: None,
            last_check: Instant::now(),
            renew_failures: 0,
            last_status_log: None,
        }
    }

    pub fn role(&self) -> HaRole {
        self.role
    }

    pub fn handle(&self) -> ActiveHandle {
        ActiveHandle {
            rx: self.state_tx.subscribe(),
        }
    }

    pub fn state(&self) -> HaState {
        *self.state_tx.borrow()
    }

    fn store(&self) -> HaResult<Arc<dyn LeaseStore>> {
        self.store.clone().ok_or(HaError::Disabled)
    }

    fn publish(&self, state: HaState) {
        self.state_tx.send_replace(state);
    }

    /// Take the lease if nobody holds it. A lease already held by this
    /// role (for example after a restart) is renewed.
    pub async fn try_active(&mut self) -> HaResult<bool> {
        let store = self.store()?;
        let key = &self.config.node_group_key;
        let role = self.role.as_str();

        if store
            .set_if_absent(key, role, self.config.active_duration)
            .await?
        {
            self.last_bump = Some(Instant::now());
            info!(%key, %role, "acquired HA lease");
            return Ok(true);
        }
        match store.get(key).await? {
            Some(holder) if holder == role => {
                self.bump_active_expire().await?;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    /// Extend the lease unconditionally.
    pub async fn bump_active_expire(&mut self) -> HaResult<()> {
        let store = self.store()?;
        store
            .set_with_expiry(
                &self.config.node_group_key,
                self.role.as_str(),
                self.config.active_duration,
            )
            .await?;
        self.last_bump = Some(Instant::now());
        Ok(())
    }

    /// Run the election loop until `shutdown` fires or exclusivity is lost.
    ///
    /// Returns `Err(HaError::Fatal)` when the lease is lost while active;
    /// the caller must stop acting on the infrastructure.
    pub async fn run(
        mut self,
        watcher: Arc<dyn HaWatcher>,
        mut shutdown: watch::Receiver<bool>,
    ) -> HaResult<()> {
        if self.store.is_none() {
            watcher.platform_active_on_startup().await;
            let _ = shutdown.changed().await;
            return Ok(());
        }

        self.connect().await;
        self.startup(watcher.as_ref()).await;

        loop {
            tokio::select! {
                _ = tokio::time::sleep(self.config.poll_interval) => {
                    self.cycle(watcher.as_ref()).await?;
                }
                _ = shutdown.changed() => {
                    info!(role = %self.role, "HA loop shutting down");
                    self.publish(HaState::Standby);
                    return Ok(());
                }
            }
        }
    }

    /// Ping the store with doubling backoff until it answers or the
    /// initial connect timeout passes.
    async fn connect(&mut self) {
        let Ok(store) = self.store() else { return };
        let deadline = Instant::now() + self.config.initial_connect_timeout;
        let mut backoff = CONNECT_BACKOFF_START;

        loop {
            match store.ping().await {
                Ok(()) => {
                    debug!("lease store reachable");
                    return;
                }
                Err(e) if Instant::now() + backoff < deadline => {
                    debug!(error = %e, ?backoff, "lease store not reachable yet");
                    tokio::time::sleep(backoff).await;
                    backoff = (backoff * 2).min(CONNECT_BACKOFF_MAX);
                }
                Err(e) => {
                    warn!(
                        error = %e,
                        policy = ?self.config.degraded_policy,
                        "lease store unreachable after initial connect timeout"
                    );
                    self.store_failed = true;
                    return;
                }
            }
        }
    }

    /// Startup activation skips the switch hooks.
    async fn startup(&mut self, watcher: &dyn HaWatcher) {
        let active = if self.store_failed {
            self.config.degraded_policy.allows(self.role)
        } else {
            match self.try_active().await {
                Ok(active) => active,
                Err(e) => {
                    warn!(error = %e, "initial lease attempt failed");
                    self.store_failed = true;
                    self.config.degraded_policy.allows(self.role)
                }
            }
        };

        if active {
            info!(role = %self.role, degraded = self.store_failed, "active on startup");
            self.publish(HaState::Active);
            watcher.platform_active_on_startup().await;
        } else {
            info!(role = %self.role, "standby on startup");
            self.publish(HaState::Standby);
        }
    }

    async fn cycle(&mut self, watcher: &dyn HaWatcher) -> HaResult<()> {
        let event = match self.state() {
            HaState::Standby => self.standby_cycle().await,
            HaState::Active => self.active_cycle().await,
            _ => return Ok(()),
        };
        self.apply(event, watcher).await
    }

    /// Feed `event` through the transition table, running hooks as the
    /// table asks.
    async fn apply(&mut self, mut event: HaEvent, watcher: &dyn HaWatcher) -> HaResult<()> {
        loop {
            let from = self.state();
            let Some(t) = transition(from, event) else {
                warn!(%from, ?event, "event not valid in current HA state");
                return Ok(());
            };
            if t.to != from {
                info!(role = %self.role, %from, to = %t.to, ?event, "HA transition");
            }
            self.publish(t.to);

            if t.to == HaState::Fatal {
                error!(role = %self.role, ?event, "HA exclusivity lost");
                return Err(HaError::Fatal(format!("{event:?} while {from}")));
            }

            match t.hook {
                Hook::None => return Ok(()),
                Hook::PreSwitch => {
                    event = match watcher.active_changed_pre_switch().await {
                        Ok(()) => HaEvent::PreSwitchDone,
                        Err(e) => {
                            error!(error = %e, "PreSwitch hook failed");
                            HaEvent::PreSwitchFailed
                        }
                    };
                }
                Hook::PublishActive => {
                    self.renew_failures = 0;
                    self.last_check = Instant::now();
                    if let Err(e) = watcher.active_changed_post_switch().await {
                        warn!(error = %e, "PostSwitch hook failed");
                    }
                    return Ok(());
                }
            }
        }
    }

    async fn standby_cycle(&mut self) -> HaEvent {
        let policy = self.config.degraded_policy;

        if self.store_failed {
            let Ok(store) = self.store() else {
                return HaEvent::LeaseHeldElsewhere;
            };
            if let Err(e) = store.ping().await {
                self.log_status("still standby, lease store unreachable");
                debug!(error = %e, "lease store ping failed");
                return HaEvent::StoreUnreachable {
                    degraded_allowed: policy.allows(self.role),
                };
            }
            info!("lease store reachable again");
            self.store_failed = false;
            self.store_recovered_at = Some(Instant::now());
        }

        // After an outage the secondary gives the primary two polls to
        // reclaim the lease first.
        if self.role == HaRole::Secondary
            && let Some(at) = self.store_recovered_at
        {
            if at.elapsed() < self.config.poll_interval * 2 {
                return HaEvent::LeaseHeldElsewhere;
            }
            self.store_recovered_at = None;
        }

        let mut last_err = None;
        for attempt in 1..=LEASE_ATTEMPTS {
            match self.try_active().await {
                Ok(true) => return HaEvent::LeaseAcquired,
                Ok(false) => {
                    self.log_status("still standby, lease held elsewhere");
                    return HaEvent::LeaseHeldElsewhere;
                }
                Err(e) => {
                    debug!(attempt, error = %e, "lease attempt failed");
                    last_err = Some(e);
                    if attempt < LEASE_ATTEMPTS {
                        tokio::time::sleep(self.config.poll_interval / LEASE_ATTEMPTS).await;
                    }
                }
            }
        }

        if let Some(e) = last_err {
            warn!(error = %e, policy = ?policy, "lease store unreachable from standby");
        }
        self.store_failed = true;
        HaEvent::StoreUnreachable {
            degraded_allowed: policy.allows(self.role),
        }
    }

    async fn active_cycle(&mut self) -> HaEvent {
        if self.store_failed {
            return match self.try_active().await {
                Ok(true) => {
                    info!("lease store reachable again, lease reclaimed");
                    self.store_failed = false;
                    HaEvent::Renewed
                }
                Ok(false) => HaEvent::LeaseLost,
                Err(_) => {
                    self.log_status("still active in degraded mode");
                    HaEvent::StoreUnreachable {
                        degraded_allowed: true,
                    }
                }
            };
        }

        let Ok(store) = self.store() else {
            return HaEvent::Renewed;
        };
        let now = Instant::now();
        let stale_bump = self
            .last_bump
            .is_none_or(|at| now.duration_since(at) > self.config.poll_interval * 2);
        let check_due = now.duration_since(self.last_check) > self.config.active_duration;

        if stale_bump || check_due {
            self.last_check = now;
            let key = self.config.node_group_key.clone();
            match store.get(&key).await {
                Ok(Some(holder)) if holder == self.role.as_str() => {}
                Ok(Some(holder)) => {
                    error!(%key, %holder, role = %self.role, "lease held by the other instance");
                    return HaEvent::LeaseHeldElsewhere;
                }
                Ok(None) => {
                    match store
                        .set_if_absent(&key, self.role.as_str(), self.config.active_duration)
                        .await
                    {
                        Ok(true) => {}
                        Ok(false) => return HaEvent::LeaseLost,
                        Err(e) => return self.renew_failed(e),
                    }
                }
                Err(e) => return self.renew_failed(e),
            }
        }

        let mut last_err = HaError::Store("no renewal attempted".to_string());
        for attempt in 1..=LEASE_ATTEMPTS {
            match self.bump_active_expire().await {
                Ok(()) => {
                    self.renew_failures = 0;
                    self.log_status("still active");
                    return HaEvent::Renewed;
                }
                Err(e) => {
                    debug!(attempt, error = %e, "lease renewal failed");
                    last_err = e;
                }
            }
        }
        self.renew_failed(last_err)
    }

    fn renew_failed(&mut self, err: HaError) -> HaEvent {
        self.renew_failures += 1;
        warn!(
            error = %err,
            failures = self.renew_failures,
            limit = RENEW_FAILURE_LIMIT,
            "lease renewal cycle failed"
        );
        HaEvent::RenewFailed {
            limit_reached: self.renew_failures >= RENEW_FAILURE_LIMIT,
        }
    }

    fn log_status(&mut self, msg: &str) {
        let now = Instant::now();
        if self
            .last_status_log
            .is_none_or(|at| now.duration_since(at) >= STATUS_LOG_INTERVAL)
        {
            self.last_status_log = Some(now);
            debug!(role = %self.role, "{msg}");
        }
    }
}
