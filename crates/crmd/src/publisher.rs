//! Status publisher — pushes CRM-owned status objects to the controller.
//!
//! Every change to a send cache becomes a `SyncMessage` on an in-memory
//! queue. The publisher drains the queue and POSTs it as one batch to
//! `http://{addr}/api/v1/status` on every notify address. A failed post
//! puts the batch back at the front of the queue and is retried.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use anyhow::{Context, bail};
use bytes::Bytes;
use crm_core::CacheObject;
use crm_ha::ActiveHandle;
use crm_state::{Cache, CacheEvent, CacheSet, SyncMessage};
use http_body_util::Full;
use tokio::sync::{Notify, watch};
use tracing::{debug, info, warn};

const DEFAULT_RETRY: Duration = Duration::from_secs(5);
const POST_TIMEOUT: Duration = Duration::from_secs(10);

pub struct StatusPublisher {
    addrs: Vec<String>,
    active: ActiveHandle,
    queue: Arc<Mutex<Vec<SyncMessage>>>,
    notify: Arc<Notify>,
    retry: Duration,
}

impl StatusPublisher {
    pub fn new(addrs: Vec<String>, active: ActiveHandle) -> Self {
        Self {
            addrs,
            active,
            queue: Arc::default(),
            notify: Arc::new(Notify::new()),
            retry: DEFAULT_RETRY,
        }
    }

    pub fn with_retry(mut self, retry: Duration) -> Self {
        self.retry = retry;
        self
    }

    fn queue(&self) -> MutexGuard<'_, Vec<SyncMessage>> {
        self.queue.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Queue changes from every send cache in `caches`.
    pub fn watch(&self, caches: &CacheSet) {
        self.watch_cache(&caches.cloudlet_infos);
        self.watch_cache(&caches.cluster_inst_infos);
        self.watch_cache(&caches.app_inst_infos);
    }

    fn watch_cache<T: CacheObject>(&self, cache: &Cache<T>) {
        let queue = self.queue.clone();
        let notify = self.notify.clone();
        cache.on_change(Arc::new(move |event: &CacheEvent<T>| {
            let msg = match event {
                CacheEvent::Updated { new, revision, .. } => SyncMessage::update(new, *revision),
                CacheEvent::Deleted { old, revision } => SyncMessage::delete(old, *revision),
            };
            match msg {
                Ok(msg) => {
                    queue.lock().unwrap_or_else(PoisonError::into_inner).push(msg);
                    notify.notify_one();
                }
                Err(e) => warn!(kind = %T::KIND, error = %e, "status not queued"),
            }
        }));
    }

    pub fn pending(&self) -> usize {
        self.queue().len()
    }

    /// Send everything queued. Returns the number of messages sent.
    pub async fn flush(&self) -> anyhow::Result<usize> {
        if !self.active.is_active() {
            return Ok(0);
        }
        let batch: Vec<SyncMessage> = std::mem::take(&mut *self.queue());
        if batch.is_empty() || self.addrs.is_empty() {
            return Ok(batch.len());
        }
        let body = serde_json::to_vec(&batch)?;
        for addr in &self.addrs {
            if let Err(e) = post_json(addr, "/api/v1/status", body.clone()).await {
                let mut queue = self.queue();
                let newer = std::mem::take(&mut *queue);
                *queue = batch;
                queue.extend(newer);
                return Err(e.context(format!("publishing status to {addr}")));
            }
        }
        debug!(sent = batch.len(), "status published");
        Ok(batch.len())
    }

    /// Publish on every change, retrying failed batches, until `shutdown`.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!(addrs = ?self.addrs, "status publisher started");
        loop {
            let retry = self.pending() > 0;
            tokio::select! {
                _ = self.notify.notified() => {}
                _ = tokio::time::sleep(self.retry), if retry => {}
                _ = shutdown.changed() => {
                    if let Err(e) = self.flush().await {
                        warn!(error = %e, "final status flush failed");
                    }
                    info!("status publisher shutting down");
                    return;
                }
            }
            if let Err(e) = self.flush().await {
                warn!(error = %e, "status publish failed, will retry");
            }
        }
    }
}

/// POST `body` as JSON to `http://{addr}{path}` over a fresh HTTP/1
/// connection.
pub async fn post_json(addr: &str, path: &str, body: Vec<u8>) -> anyhow::Result<()> {
    let uri = format!("http://{addr}{path}");
    tokio::time::timeout(POST_TIMEOUT, async {
        let stream = tokio::net::TcpStream::connect(addr)
            .await
            .with_context(|| format!("connecting to {addr}"))?;
        let io = hyper_util::rt::TokioIo::new(stream);
        let (mut sender, conn) = hyper::client::conn::http1::handshake(io).await?;
        tokio::spawn(async move {
            let _ = conn.await;
        });

        let req = http::Request::builder()
            .method("POST")
            .uri(&uri)
            .header("host", addr)
            .header("content-type", "application/json")
            .header("user-agent", "crmd/0.1")
            .body(Full::new(Bytes::from(body)))?;
        let resp = sender.send_request(req).await?;
        if !resp.status().is_success() {
            bail!("{uri} answered {}", resp.status());
        }
        Ok(())
    })
    .await
    .with_context(|| format!("{uri} timed out"))?
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::Json;
    use axum::Router;
    use axum::extract::State;
    use axum::http::StatusCode;
    use axum::routing::post;
    use crm_core::*;

    type Received = Arc<Mutex<Vec<SyncMessage>>>;

    async fn controller(status: StatusCode) -> (String, Received) {
        let received: Received = Arc::default();
        let app = Router::new()
            .route(
                "/api/v1/status",
                post(move |State(rx): State<Received>, Json(batch): Json<Vec<SyncMessage>>| async move {
                    if status.is_success() {
                        rx.lock().unwrap().extend(batch);
                    }
                    status
                }),
            )
            .with_state(received.clone());
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        tokio::spawn(async move { axum::serve(listener, app).await.unwrap() });
        (addr, received)
    }

    fn info(name: &str) -> CloudletInfo {
        CloudletInfo {
            key: CloudletKey::new("TMUS", name),
            state: CloudletState::Ready,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn changes_are_posted_in_order() {
        let (addr, received) = controller(StatusCode::OK).await;
        let caches = CacheSet::new();
        let publisher = StatusPublisher::new(vec![addr], ActiveHandle::always_active());
        publisher.watch(&caches);

        caches.cloudlet_infos.update(info("cloud1"), 1);
        caches.cloudlet_infos.update(info("cloud2"), 2);
        caches.cloudlet_infos.delete(&info("cloud1"), 3);
        assert_eq!(publisher.pending(), 3);

        assert_eq!(publisher.flush().await.unwrap(), 3);
        let got = received.lock().unwrap().clone();
        let revisions: Vec<i64> = got.iter().map(|m| m.revision).collect();
        assert_eq!(revisions, vec![1, 2, 3]);
        assert_eq!(got[2].action, crm_state::SyncAction::Delete);
        assert_eq!(publisher.pending(), 0);
    }

    #[tokio::test]
    async fn failed_batches_are_kept_for_retry() {
        let (addr, _) = controller(StatusCode::SERVICE_UNAVAILABLE).await;
        let caches = CacheSet::new();
        let publisher = StatusPublisher::new(vec![addr], ActiveHandle::always_active());
        publisher.watch(&caches);

        caches.cloudlet_infos.update(info("cloud1"), 1);
        assert!(publisher.flush().await.is_err());
        caches.cloudlet_infos.update(info("cloud2"), 2);
        assert_eq!(publisher.pending(), 2);
        assert_eq!(publisher.queue()[0].revision, 1);
    }

    #[tokio::test]
    async fn standby_holds_its_queue() {
        let (_tx, handle) = ActiveHandle::channel(crm_ha::HaState::Standby);
        let caches = CacheSet::new();
        let publisher = StatusPublisher::new(vec!["127.0.0.1:1".to_string()], handle);
        publisher.watch(&caches);
        caches.cloudlet_infos.update(info("cloud1"), 1);
        assert_eq!(publisher.flush().await.unwrap(), 0);
        assert_eq!(publisher.pending(), 1);
    }

    #[tokio::test]
    async fn run_publishes_until_shutdown() {
        let (addr, received) = controller(StatusCode::OK).await;
        let caches = CacheSet::new();
        let publisher = Arc::new(
            StatusPublisher::new(vec![addr], ActiveHandle::always_active())
                .with_retry(Duration::from_millis(10)),
        );
        publisher.watch(&caches);
        let (tx, rx) = watch::channel(false);
        let task = tokio::spawn({
            let publisher = publisher.clone();
            async move { publisher.run(rx).await }
        });

        caches.cloudlet_infos.update(info("cloud1"), 1);
        for _ in 0..200 {
            if !received.lock().unwrap().is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(received.lock().unwrap().len(), 1);
        tx.send(true).unwrap();
        task.await.unwrap();
    }
}
