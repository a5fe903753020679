//! Exec request routing.
//!
//! A request names an AppInst and either a command or a log request. The
//! router resolves the AppInst's App and ClusterInst, asks the platform for
//! the command line, answers the caller's offer with a session id and runs
//! the command in its own task. The session's three streams are in-memory
//! pipes; closing the session aborts the task, which drops the far ends of
//! every pipe at once.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crm_core::{AppInst, ExecRequest};
use crm_ha::ActiveHandle;
use crm_platform::{Platform, PlatformClient, ShellIo, Started};
use crm_state::CacheSet;
use tokio::io::{AsyncWriteExt, DuplexStream};
use tokio::task::{AbortHandle, JoinHandle};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::{OrchestratorError, OrchestratorResult};

const PIPE_CAPACITY: usize = 64 * 1024;

/// Caller's side of a running exec session.
pub struct ExecSession {
    pub id: String,
    /// Bytes written here reach the command's stdin. Shut it down to send EOF.
    pub stdin: DuplexStream,
    pub stdout: DuplexStream,
    pub stderr: DuplexStream,
    /// Resolves when the command exits or the session is closed.
    pub finished: JoinHandle<OrchestratorResult<()>>,
}

#[derive(Clone)]
pub struct ExecRouter {
    caches: CacheSet,
    platform: Arc<dyn Platform>,
    active: ActiveHandle,
    sessions: Arc<Mutex<HashMap<String, AbortHandle>>>,
}

impl ExecRouter {
    pub fn new(caches: CacheSet, platform: Arc<dyn Platform>, active: ActiveHandle) -> Self {
        Self {
            caches,
            platform,
            active,
            sessions: Arc::default(),
        }
    }

    fn sessions(&self) -> MutexGuard<'_, HashMap<String, AbortHandle>> {
        self.sessions.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Ids of sessions still running.
    pub fn open_sessions(&self) -> Vec<String> {
        self.sessions().keys().cloned().collect()
    }

    /// Start serving `req`. Returns the request with its `answer` filled in
    /// and the caller's end of the session.
    pub async fn handle(&self, mut req: ExecRequest) -> OrchestratorResult<(ExecRequest, ExecSession)> {
        if !self.active.is_active() {
            return Err(OrchestratorError::Inactive);
        }
        let key = req.app_inst_key.clone();
        let mut inst = self
            .caches
            .app_insts
            .get(&key)
            .ok_or_else(|| OrchestratorError::NotFound(format!("app inst {key} not found")))?;
        let app = self
            .caches
            .apps
            .get(&key.app_key)
            .ok_or_else(|| OrchestratorError::NotFound(format!("app {} not found", key.app_key)))?;
        let ci_key = inst.real_cluster_inst_key();
        let ci = self
            .caches
            .cluster_insts
            .get(&ci_key)
            .ok_or_else(|| OrchestratorError::NotFound(format!("cluster inst {ci_key} not found")))?;
        self.fill_runtime(&mut inst);

        let cmd = self.platform.container_command(&ci, &app, &inst, &req).await?;
        let client = self.platform.cluster_client(&ci).await?;

        let id = Uuid::new_v4().to_string();
        req.answer = id.clone();

        let (stdin, task_stdin) = tokio::io::duplex(PIPE_CAPACITY);
        let (task_stdout, stdout) = tokio::io::duplex(PIPE_CAPACITY);
        let (task_stderr, stderr) = tokio::io::duplex(PIPE_CAPACITY);
        let io = ShellIo {
            stdin: Box::new(task_stdin),
            stdout: Box::new(task_stdout),
            stderr: Box::new(task_stderr),
        };

        info!(app_inst = %key, session = %id, %cmd, "exec session starting");
        let is_log = req.cmd.is_none();
        let sessions = self.sessions.clone();
        let session_id = id.clone();
        // Hold the lock until the abort handle is registered so a command
        // that exits immediately still finds its entry to remove.
        let mut open = self.sessions();
        let finished = tokio::spawn(async move {
            let result = if is_log {
                stream_logs(client.as_ref(), &cmd, io).await
            } else {
                client.shell(&cmd, io).await.map_err(OrchestratorError::from)
            };
            if let Err(e) = &result {
                warn!(session = %session_id, error = %e, "exec session failed");
            }
            sessions
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .remove(&session_id);
            debug!(session = %session_id, "exec session finished");
            result
        });
        open.insert(id.clone(), finished.abort_handle());
        drop(open);

        Ok((
            req,
            ExecSession {
                id,
                stdin,
                stdout,
                stderr,
                finished,
            },
        ))
    }

    /// Tear a session down. Returns false if it had already finished.
    pub fn close(&self, id: &str) -> bool {
        match self.sessions().remove(id) {
            Some(handle) => {
                handle.abort();
                info!(session = %id, "exec session closed");
                true
            }
            None => false,
        }
    }

    /// The cached AppInst may predate its runtime info; prefer what the
    /// status cache reports.
    fn fill_runtime(&self, inst: &mut AppInst) {
        if let Some(info) = self.caches.app_inst_infos.get(&inst.key) {
            if !info.runtime_info.container_ids.is_empty() {
                inst.runtime_info = info.runtime_info;
            }
        }
    }
}

async fn stream_logs(client: &dyn PlatformClient, cmd: &str, io: ShellIo) -> OrchestratorResult<()> {
    let ShellIo {
        stdin: _,
        mut stdout,
        mut stderr,
    } = io;
    let Started {
        stdout: mut out_src,
        stderr: mut err_src,
        exit,
        ..
    } = client.start(cmd).await?;
    let out = async {
        tokio::io::copy(&mut out_src, &mut stdout).await?;
        stdout.shutdown().await
    };
    let err = async {
        tokio::io::copy(&mut err_src, &mut stderr).await?;
        stderr.shutdown().await
    };
    tokio::try_join!(out, err)?;
    client.wait(exit).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crm_core::*;
    use crm_ha::HaState;
    use crm_platform::{FakeFixture, FakePlatform};
    use tokio::io::AsyncReadExt;

    fn router(active: ActiveHandle) -> (CacheSet, Arc<FakePlatform>, ExecRouter) {
        let caches = CacheSet::new();
        let platform = Arc::new(FakePlatform::new(FakeFixture::default()));
        let router = ExecRouter::new(caches.clone(), platform.clone(), active);
        (caches, platform, router)
    }

    fn seed(caches: &CacheSet) -> AppInstKey {
        let ci = ClusterInst {
            key: ClusterInstKey::new("c1", CloudletKey::new("TMUS", "cloud2"), "dev"),
            deployment: DeploymentType::Kubernetes,
            ..Default::default()
        };
        let app = App {
            key: AppKey::new("dev", "web", "1.0"),
            deployment: DeploymentType::Kubernetes,
            ..Default::default()
        };
        let inst = AppInst {
            key: AppInstKey {
                app_key: app.key.clone(),
                cluster_inst_key: ci.key.clone(),
            },
            ..Default::default()
        };
        caches.cluster_insts.update(ci, 1);
        caches.apps.update(app, 2);
        caches.app_insts.update(inst.clone(), 3);
        caches.app_inst_infos.update(
            AppInstInfo {
                key: inst.key.clone(),
                state: TrackedState::Ready,
                runtime_info: AppInstRuntime {
                    container_ids: vec!["web-0".to_string()],
                },
                ..Default::default()
            },
            1,
        );
        inst.key
    }

    fn request(key: AppInstKey) -> ExecRequest {
        ExecRequest {
            app_inst_key: key,
            cmd: Some(RunCmd {
                command: "sh".to_string(),
            }),
            offer: "offer".to_string(),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn command_session_pipes_stdin_to_stdout() {
        let (caches, platform, router) = router(ActiveHandle::always_active());
        let key = seed(&caches);

        let (answered, mut session) = router.handle(request(key)).await.unwrap();
        assert_eq!(answered.answer, session.id);
        assert!(Uuid::parse_str(&session.id).is_ok());

        session.stdin.write_all(b"ls\n").await.unwrap();
        session.stdin.shutdown().await.unwrap();
        let mut out = String::new();
        session.stdout.read_to_string(&mut out).await.unwrap();
        session.finished.await.unwrap().unwrap();

        assert!(out.contains("kubectl exec -n default -it web-0 -- sh"), "{out}");
        assert!(out.ends_with("ls\n"));
        assert!(platform.fake_client().ran("kubectl exec"));
        assert!(router.open_sessions().is_empty());
    }

    #[tokio::test]
    async fn log_session_streams_output() {
        let (caches, _, router) = router(ActiveHandle::always_active());
        let key = seed(&caches);
        let req = ExecRequest {
            cmd: None,
            log: Some(ShowLog {
                tail: 10,
                ..Default::default()
            }),
            ..request(key)
        };
        let (_, mut session) = router.handle(req).await.unwrap();
        let mut out = String::new();
        session.stdout.read_to_string(&mut out).await.unwrap();
        session.finished.await.unwrap().unwrap();
        assert_eq!(out.lines().count(), 2);
        assert!(out.contains("--tail=10"));
    }

    #[tokio::test]
    async fn unresolved_requests_are_rejected_in_order() {
        let (caches, _, router) = router(ActiveHandle::always_active());
        let key = AppInstKey {
            app_key: AppKey::new("dev", "web", "1.0"),
            cluster_inst_key: ClusterInstKey::new("c1", CloudletKey::new("TMUS", "cloud2"), "dev"),
        };
        let err = router.handle(request(key.clone())).await.err().unwrap();
        assert_eq!(err.to_string(), format!("app inst {key} not found"));

        caches.app_insts.update(
            AppInst {
                key: key.clone(),
                ..Default::default()
            },
            1,
        );
        let err = router.handle(request(key.clone())).await.err().unwrap();
        assert_eq!(err.to_string(), "app dev/web:1.0 not found");

        caches.apps.update(
            App {
                key: key.app_key.clone(),
                ..Default::default()
            },
            2,
        );
        let err = router.handle(request(key.clone())).await.err().unwrap();
        assert_eq!(
            err.to_string(),
            format!("cluster inst {} not found", key.cluster_inst_key)
        );
    }

    #[tokio::test]
    async fn inactive_instance_ignores_requests() {
        let (_tx, handle) = ActiveHandle::channel(HaState::Standby);
        let (caches, _, router) = router(handle);
        let key = seed(&caches);
        let err = router.handle(request(key)).await.err().unwrap();
        assert_eq!(err.to_string(), "ExecRequestIgnoredPlatformInactive");
    }

    #[tokio::test]
    async fn close_tears_the_session_down() {
        let (caches, _, router) = router(ActiveHandle::always_active());
        let key = seed(&caches);
        // stdin stays open, so the command keeps running.
        let (_, mut session) = router.handle(request(key)).await.unwrap();
        assert_eq!(router.open_sessions(), vec![session.id.clone()]);

        assert!(router.close(&session.id));
        assert!(session.finished.await.unwrap_err().is_cancelled());
        let mut out = Vec::new();
        session.stdout.read_to_end(&mut out).await.unwrap();
        assert!(router.open_sessions().is_empty());
        assert!(!router.close(&session.id));
    }
}
