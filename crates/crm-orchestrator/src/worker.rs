//! Orchestrator — turns tracked-state requests in the desired-state caches
//! into platform work and reports progress through the info caches.
//!
//! # Architecture
//!
//! ```text
//! Cache<AppInst> ─on_change─┐
//!                           ├─▶ submit(key, job) ──▶ per-key FIFO worker ──▶ AppInstDeployer
//! Cache<ClusterInst> ───────┘                                           └──▶ Platform
//!                                                        │
//!                                   AppInstInfo / ClusterInstInfo ◀──────┘
//! ```
//!
//! Jobs for the same object key run one at a time in submission order.
//! Jobs for different keys run in parallel. Each key's worker task exits
//! once its queue drains.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use crm_core::config::CrmConfig;
use crm_core::*;
use crm_ha::ActiveHandle;
use crm_platform::Platform;
use crm_state::{CacheEvent, CacheSet};
use futures::future::BoxFuture;
use tokio::runtime::Handle;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use crate::appinst::AppInstDeployer;
use crate::error::{OrchestratorError, OrchestratorResult};

type Job = BoxFuture<'static, ()>;

struct Inner {
    caches: CacheSet,
    platform: Arc<dyn Platform>,
    deployer: AppInstDeployer,
    config: CrmConfig,
    active: ActiveHandle,
    runtime: Handle,
    queues: Mutex<HashMap<String, mpsc::UnboundedSender<Job>>>,
    pending: watch::Sender<usize>,
}

/// Reconciles AppInsts and ClusterInsts. Cheap to clone.
#[derive(Clone)]
pub struct Orchestrator {
    inner: Arc<Inner>,
}

impl Orchestrator {
    /// Must be called inside a tokio runtime; jobs are spawned on it.
    pub fn new(
        caches: CacheSet,
        platform: Arc<dyn Platform>,
        config: CrmConfig,
        active: ActiveHandle,
    ) -> OrchestratorResult<Self> {
        let runtime = Handle::try_current()
            .map_err(|e| OrchestratorError::Invalid(format!("orchestrator needs a tokio runtime: {e}")))?;
        let (pending, _) = watch::channel(0);
        Ok(Self {
            inner: Arc::new(Inner {
                deployer: AppInstDeployer::new(platform.clone(), config.clone()),
                caches,
                platform,
                config,
                active,
                runtime,
                queues: Mutex::new(HashMap::new()),
                pending,
            }),
        })
    }

    pub fn caches(&self) -> &CacheSet {
        &self.inner.caches
    }

    pub fn platform(&self) -> &Arc<dyn Platform> {
        &self.inner.platform
    }

    /// Start reacting to AppInst and ClusterInst changes.
    pub fn attach(&self) {
        let weak = Arc::downgrade(&self.inner);
        self.inner.caches.app_insts.on_change(Arc::new(move |event| {
            if let Some(this) = upgrade(&weak) {
                this.app_inst_changed(event);
            }
        }));
        let weak = Arc::downgrade(&self.inner);
        self.inner.caches.cluster_insts.on_change(Arc::new(move |event| {
            if let Some(this) = upgrade(&weak) {
                this.cluster_inst_changed(event);
            }
        }));
    }

    /// Replay every cached ClusterInst and AppInst as if first seen. Run
    /// after taking over from the other instance, which may have left
    /// requests unserved.
    pub fn reconcile_all(&self) {
        let caches = &self.inner.caches;
        let clusters = caches.cluster_insts.list();
        let insts = caches.app_insts.list();
        info!(cluster_insts = clusters.len(), app_insts = insts.len(), "reconciling cached state");
        for ci in clusters {
            self.cluster_inst_changed(&CacheEvent::Updated {
                old: None,
                new: ci,
                revision: 0,
            });
        }
        for inst in insts {
            self.app_inst_changed(&CacheEvent::Updated {
                old: None,
                new: inst,
                revision: 0,
            });
        }
    }

    /// Resolves once every submitted job has finished.
    pub async fn wait_idle(&self) {
        let mut rx = self.inner.pending.subscribe();
        let _ = rx.wait_for(|n| *n == 0).await;
    }

    /// Number of jobs queued or running.
    pub fn pending(&self) -> usize {
        *self.inner.pending.borrow()
    }

    // ── Keyed queue ────────────────────────────────────────────────

    fn queues(&self) -> MutexGuard<'_, HashMap<String, mpsc::UnboundedSender<Job>>> {
        self.inner.queues.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Queue `job` behind earlier jobs for `key`.
    pub fn submit(&self, key: String, job: Job) {
        self.inner.pending.send_modify(|n| *n += 1);
        let mut queues = self.queues();
        let job = match queues.get(&key) {
            Some(tx) => match tx.send(job) {
                Ok(()) => return,
                // Worker already gone; start a new one below.
                Err(mpsc::error::SendError(job)) => job,
            },
            None => job,
        };
        let (tx, rx) = mpsc::unbounded_channel();
        let _ = tx.send(job);
        queues.insert(key.clone(), tx);
        drop(queues);
        let this = self.clone();
        self.inner.runtime.spawn(async move { this.drain(key, rx).await });
    }

    async fn drain(self, key: String, mut rx: mpsc::UnboundedReceiver<Job>) {
        loop {
            let job = match rx.try_recv() {
                Ok(job) => job,
                Err(_) => {
                    // Re-check under the lock so a concurrent submit either
                    // lands in this queue or starts a fresh worker.
                    let mut queues = self.queues();
                    match rx.try_recv() {
                        Ok(job) => job,
                        Err(_) => {
                            queues.remove(&key);
                            return;
                        }
                    }
                }
            };
            job.await;
            self.inner.pending.send_modify(|n| *n = n.saturating_sub(1));
        }
    }

    // ── Event routing ──────────────────────────────────────────────

    fn app_inst_changed(&self, event: &CacheEvent<AppInst>) {
        if !self.inner.active.is_active() {
            debug!(app_inst = %event.key(), "not active, ignoring app inst change");
            return;
        }
        let queue = format!("appinst:{}", event.key());
        let this = self.clone();
        match event {
            CacheEvent::Updated { old, new, .. } => {
                let inst = new.clone();
                match inst.state {
                    TrackedState::CreateRequested => {
                        self.submit(queue, Box::pin(async move { this.create_app_inst(inst).await }))
                    }
                    TrackedState::UpdateRequested => {
                        self.submit(queue, Box::pin(async move { this.update_app_inst(inst).await }))
                    }
                    TrackedState::DeleteRequested => {
                        self.submit(queue, Box::pin(async move { this.delete_app_inst(inst).await }))
                    }
                    TrackedState::Ready if old.is_none() => {
                        self.submit(queue, Box::pin(async move { this.refresh_app_inst(inst).await }))
                    }
                    _ => {}
                }
            }
            CacheEvent::Deleted { old, .. } => {
                let key = old.key.clone();
                self.submit(
                    queue,
                    Box::pin(async move {
                        this.inner.caches.app_inst_infos.delete_key(&key, 0);
                    }),
                );
            }
        }
    }

    fn cluster_inst_changed(&self, event: &CacheEvent<ClusterInst>) {
        if !self.inner.active.is_active() {
            debug!(cluster_inst = %event.key(), "not active, ignoring cluster inst change");
            return;
        }
        let queue = format!("clusterinst:{}", event.key());
        let this = self.clone();
        match event {
            CacheEvent::Updated { old, new, .. } => {
                let ci = new.clone();
                match ci.state {
                    TrackedState::CreateRequested => {
                        self.submit(queue, Box::pin(async move { this.create_cluster_inst(ci).await }))
                    }
                    TrackedState::UpdateRequested => {
                        self.submit(queue, Box::pin(async move { this.update_cluster_inst(ci).await }))
                    }
                    TrackedState::DeleteRequested => {
                        self.submit(queue, Box::pin(async move { this.delete_cluster_inst(ci).await }))
                    }
                    TrackedState::Ready if old.is_none() => {
                        let key = ci.key.clone();
                        self.submit(
                            queue,
                            Box::pin(async move {
                                this.set_cluster_inst_state(&key, TrackedState::Ready, None);
                            }),
                        )
                    }
                    _ => {}
                }
            }
            CacheEvent::Deleted { old, .. } => {
                let key = old.key.clone();
                self.submit(
                    queue,
                    Box::pin(async move {
                        this.inner.caches.cluster_inst_infos.delete_key(&key, 0);
                    }),
                );
            }
        }
    }

    // ── Status reporting ───────────────────────────────────────────

    fn set_app_inst_state(
        &self,
        key: &AppInstKey,
        state: TrackedState,
        error: Option<&OrchestratorError>,
        runtime: Option<AppInstRuntime>,
    ) {
        let cache = &self.inner.caches.app_inst_infos;
        let mut info = cache.get(key).unwrap_or_else(|| AppInstInfo {
            key: key.clone(),
            ..Default::default()
        });
        info.state = state;
        info.errors = error.map(|e| vec![e.to_string()]).unwrap_or_default();
        if let Some(runtime) = runtime {
            info.runtime_info = runtime;
        }
        cache.update(info, cache.last_revision() + 1);
    }

    fn set_cluster_inst_state(&self, key: &ClusterInstKey, state: TrackedState, error: Option<&OrchestratorError>) {
        let cache = &self.inner.caches.cluster_inst_infos;
        let mut info = cache.get(key).unwrap_or_else(|| ClusterInstInfo {
            key: key.clone(),
            ..Default::default()
        });
        info.state = state;
        info.errors = error.map(|e| vec![e.to_string()]).unwrap_or_default();
        cache.update(info, cache.last_revision() + 1);
    }

    /// Gather capacity from the platform and publish it as this cloudlet's
    /// CloudletInfo.
    pub async fn publish_cloudlet_info(&self, key: &CloudletKey, role: &str) -> OrchestratorResult<CloudletInfo> {
        let mut info = self
            .inner
            .caches
            .cloudlet_infos
            .get(key)
            .unwrap_or_else(|| CloudletInfo {
                key: key.clone(),
                ..Default::default()
            });
        match self.inner.platform.gather_cloudlet_info(&mut info).await {
            Ok(()) => {
                info.state = CloudletState::Ready;
                info.errors.clear();
            }
            Err(e) => {
                warn!(cloudlet = %key, error = %e, "gather cloudlet info failed");
                info.state = CloudletState::Errors;
                info.errors = vec![e.to_string()];
            }
        }
        info.active_crm_role = role.to_string();
        let cache = &self.inner.caches.cloudlet_infos;
        cache.update(info.clone(), cache.last_revision() + 1);
        Ok(info)
    }

    // ── AppInst jobs ───────────────────────────────────────────────

    fn resolve(&self, inst: &AppInst) -> OrchestratorResult<(ClusterInst, App)> {
        let caches = &self.inner.caches;
        let app = caches
            .apps
            .get(&inst.key.app_key)
            .ok_or_else(|| OrchestratorError::NotFound(format!("app {} not found", inst.key.app_key)))?;
        let ci_key = inst.real_cluster_inst_key();
        let ci = caches
            .cluster_insts
            .get(&ci_key)
            .ok_or_else(|| OrchestratorError::NotFound(format!("cluster inst {ci_key} not found")))?;
        Ok((ci, app))
    }

    async fn create_app_inst(&self, inst: AppInst) {
        self.set_app_inst_state(&inst.key, TrackedState::Creating, None, None);
        let result = async {
            let (ci, app) = self.resolve(&inst)?;
            self.inner.deployer.create(&ci, &app, &inst).await?;
            let runtime = match self.inner.platform.app_inst_runtime(&ci, &app, &inst).await {
                Ok(runtime) => runtime,
                Err(e) => {
                    warn!(app_inst = %inst.key, error = %e, "runtime info unavailable");
                    AppInstRuntime::default()
                }
            };
            Ok::<_, OrchestratorError>(runtime)
        }
        .await;
        match result {
            Ok(runtime) => {
                info!(app_inst = %inst.key, "app inst ready");
                self.set_app_inst_state(&inst.key, TrackedState::Ready, None, Some(runtime));
            }
            Err(e) => {
                warn!(app_inst = %inst.key, error = %e, "app inst create failed");
                self.set_app_inst_state(&inst.key, TrackedState::CreateError, Some(&e), None);
            }
        }
    }

    async fn update_app_inst(&self, inst: AppInst) {
        self.set_app_inst_state(&inst.key, TrackedState::Updating, None, None);
        let result = async {
            let (ci, app) = self.resolve(&inst)?;
            self.inner.deployer.update(&ci, &app, &inst).await
        }
        .await;
        match result {
            Ok(()) => self.set_app_inst_state(&inst.key, TrackedState::Ready, None, None),
            Err(e) => {
                warn!(app_inst = %inst.key, error = %e, "app inst update failed");
                self.set_app_inst_state(&inst.key, TrackedState::UpdateError, Some(&e), None);
            }
        }
    }

    async fn delete_app_inst(&self, inst: AppInst) {
        self.set_app_inst_state(&inst.key, TrackedState::Deleting, None, None);
        let result = async {
            let (ci, app) = self.resolve(&inst)?;
            self.inner.deployer.delete(&ci, &app, &inst).await
        }
        .await;
        match result {
            Ok(()) => self.set_app_inst_state(&inst.key, TrackedState::DeleteDone, None, None),
            Err(e) => {
                warn!(app_inst = %inst.key, error = %e, "app inst delete failed");
                self.set_app_inst_state(&inst.key, TrackedState::DeleteError, Some(&e), None);
            }
        }
    }

    /// An AppInst that is already Ready when first seen, e.g. after a
    /// restart or switchover.
    async fn refresh_app_inst(&self, inst: AppInst) {
        let runtime = match self.resolve(&inst) {
            Ok((ci, app)) => self
                .inner
                .platform
                .app_inst_runtime(&ci, &app, &inst)
                .await
                .ok(),
            Err(_) => None,
        };
        self.set_app_inst_state(&inst.key, TrackedState::Ready, None, runtime);
    }

    // ── ClusterInst jobs ───────────────────────────────────────────

    async fn create_cluster_inst(&self, ci: ClusterInst) {
        self.set_cluster_inst_state(&ci.key, TrackedState::Creating, None);
        let timeout = self.inner.config.orchestrator.cluster_timeout;
        match self.inner.platform.create_cluster_inst(&ci, timeout).await {
            Ok(()) => {
                info!(cluster_inst = %ci.key, "cluster inst ready");
                self.set_cluster_inst_state(&ci.key, TrackedState::Ready, None);
            }
            Err(e) => {
                let e = OrchestratorError::from(e);
                warn!(cluster_inst = %ci.key, error = %e, "cluster inst create failed");
                self.set_cluster_inst_state(&ci.key, TrackedState::CreateError, Some(&e));
            }
        }
    }

    async fn update_cluster_inst(&self, ci: ClusterInst) {
        self.set_cluster_inst_state(&ci.key, TrackedState::Updating, None);
        match self.inner.platform.update_cluster_inst(&ci).await {
            Ok(()) => self.set_cluster_inst_state(&ci.key, TrackedState::Ready, None),
            Err(e) => {
                let e = OrchestratorError::from(e);
                warn!(cluster_inst = %ci.key, error = %e, "cluster inst update failed");
                self.set_cluster_inst_state(&ci.key, TrackedState::UpdateError, Some(&e));
            }
        }
    }

    async fn delete_cluster_inst(&self, ci: ClusterInst) {
        self.set_cluster_inst_state(&ci.key, TrackedState::Deleting, None);
        let remaining = self
            .inner
            .caches
            .app_insts_on_cluster(&ci.key)
            .into_iter()
            .filter(|inst| inst.state != TrackedState::DeleteDone)
            .count();
        let result = if remaining > 0 {
            Err(OrchestratorError::Invalid(format!(
                "cluster inst {} still has {remaining} app insts",
                ci.key
            )))
        } else {
            self.inner
                .platform
                .delete_cluster_inst(&ci)
                .await
                .map_err(OrchestratorError::from)
        };
        match result {
            Ok(()) => self.set_cluster_inst_state(&ci.key, TrackedState::DeleteDone, None),
            Err(e) => {
                warn!(cluster_inst = %ci.key, error = %e, "cluster inst delete failed");
                self.set_cluster_inst_state(&ci.key, TrackedState::DeleteError, Some(&e));
            }
        }
    }
}

fn upgrade(weak: &Weak<Inner>) -> Option<Orchestrator> {
    weak.upgrade().map(|inner| Orchestrator { inner })
}
