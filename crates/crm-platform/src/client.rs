//! Platform clients — run shell commands on the infrastructure.
//!
//! Every backend drives its hosts through a [`PlatformClient`]. The daemon
//! runs on the cloudlet controller node, so `LocalClient` executes there;
//! tests swap in `FakeClient`. Callers build command strings; clients only
//! execute them.

use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};

use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::process::Command;
use tokio::sync::oneshot;
use tracing::debug;

use crate::error::{PlatformError, PlatformResult};

pub type BoxReader = Box<dyn AsyncRead + Send + Unpin>;
pub type BoxWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Streams attached to an interactive command.
pub struct ShellIo {
    pub stdin: BoxReader,
    pub stdout: BoxWriter,
    pub stderr: BoxWriter,
}

/// Completion of a command launched with [`PlatformClient::start`].
pub struct Exit(oneshot::Receiver<PlatformResult<()>>);

impl Exit {
    pub fn channel() -> (oneshot::Sender<PlatformResult<()>>, Exit) {
        let (tx, rx) = oneshot::channel();
        (tx, Exit(rx))
    }
}

/// A command running in the background.
pub struct Started {
    pub stdin: BoxWriter,
    pub stdout: BoxReader,
    pub stderr: BoxReader,
    pub exit: Exit,
}

#[async_trait]
pub trait PlatformClient: Send + Sync {
    /// Run `cmd` to completion and return its combined stdout and stderr.
    async fn output(&self, cmd: &str) -> PlatformResult<String>;

    /// Run `cmd` with the given streams attached until it exits.
    async fn shell(&self, cmd: &str, io: ShellIo) -> PlatformResult<()>;

    /// Launch `cmd` without waiting for it.
    async fn start(&self, cmd: &str) -> PlatformResult<Started>;

    /// Wait for a command launched with `start`.
    async fn wait(&self, exit: Exit) -> PlatformResult<()> {
        exit.0
            .await
            .unwrap_or_else(|_| Err(PlatformError::Invalid("command exited without status".into())))
    }

    /// Write `contents` to `path`. The payload travels base64 encoded so
    /// quotes and `$vars` survive the shell.
    async fn write_file(&self, path: &str, contents: &str, kind: &str, sudo: bool) -> PlatformResult<()> {
        debug!(%path, %kind, sudo, "write file");
        let data = STANDARD.encode(contents.as_bytes());
        let mut cmd = format!("base64 -d <<< {data} > {path}");
        if sudo {
            cmd = format!("sudo bash -c '{cmd}'");
        }
        self.output(&cmd).await?;
        Ok(())
    }

    /// Run `cmd`, discarding its output.
    async fn run(&self, cmd: &str) -> PlatformResult<()> {
        self.output(cmd).await.map(|_| ())
    }

    async fn delete_dir(&self, dir: &str) -> PlatformResult<()> {
        debug!(%dir, "deleting directory");
        self.run(&format!("rm -rf {dir}")).await
    }
}

// ── Process plumbing ───────────────────────────────────────────────

fn command_failed(cmd: &str, output: String, status: ExitStatus) -> PlatformError {
    PlatformError::Command {
        cmd: cmd.to_string(),
        output,
        reason: status.to_string(),
    }
}

fn missing_pipe(name: &str) -> PlatformError {
    PlatformError::Invalid(format!("child process has no {name} pipe"))
}

async fn run_output(cmd: &str, mut command: Command) -> PlatformResult<String> {
    let out = command.stdin(Stdio::null()).output().await?;
    let mut text = String::from_utf8_lossy(&out.stdout).into_owned();
    text.push_str(&String::from_utf8_lossy(&out.stderr));
    if !out.status.success() {
        return Err(command_failed(cmd, text, out.status));
    }
    Ok(text)
}

async fn run_shell(cmd: &str, mut command: Command, io: ShellIo) -> PlatformResult<()> {
    let mut child = command
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()?;
    let mut child_in = child.stdin.take().ok_or_else(|| missing_pipe("stdin"))?;
    let mut child_out = child.stdout.take().ok_or_else(|| missing_pipe("stdout"))?;
    let mut child_err = child.stderr.take().ok_or_else(|| missing_pipe("stderr"))?;

    let ShellIo {
        mut stdin,
        mut stdout,
        mut stderr,
    } = io;
    let input = tokio::spawn(async move {
        let _ = tokio::io::copy(&mut stdin, &mut child_in).await;
    });
    let (out, err) = tokio::join!(
        tokio::io::copy(&mut child_out, &mut stdout),
        tokio::io::copy(&mut child_err, &mut stderr),
    );
    let status = child.wait().await?;
    input.abort();
    out?;
    err?;
    if !status.success() {
        return Err(command_failed(cmd, String::new(), status));
    }
    Ok(())
}

fn run_start(cmd: &str, mut command: Command) -> PlatformResult<Started> {
    let mut child = command
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()?;
    let stdin = child.stdin.take().ok_or_else(|| missing_pipe("stdin"))?;
    let stdout = child.stdout.take().ok_or_else(|| missing_pipe("stdout"))?;
    let stderr = child.stderr.take().ok_or_else(|| missing_pipe("stderr"))?;

    let (tx, exit) = Exit::channel();
    let cmd = cmd.to_string();
    tokio::spawn(async move {
        let result = match child.wait().await {
            Ok(status) if status.success() => Ok(()),
            Ok(status) => Err(command_failed(&cmd, String::new(), status)),
            Err(e) => Err(e.into()),
        };
        let _ = tx.send(result);
    });

    Ok(Started {
        stdin: Box::new(stdin),
        stdout: Box::new(stdout),
        stderr: Box::new(stderr),
        exit,
    })
}

// ── Local ──────────────────────────────────────────────────────────

/// Runs commands with `bash -c` on this host.
#[derive(Debug, Clone)]
pub struct LocalClient {
    working_dir: PathBuf,
}

impl LocalClient {
    pub fn new(working_dir: &Path) -> Self {
        Self {
            working_dir: working_dir.to_path_buf(),
        }
    }

    fn command(&self, cmd: &str) -> Command {
        let mut command = Command::new("bash");
        command
            .arg("-c")
            .arg(cmd)
            .current_dir(&self.working_dir)
            .kill_on_drop(true);
        command
    }
}

#[async_trait]
impl PlatformClient for LocalClient {
    async fn output(&self, cmd: &str) -> PlatformResult<String> {
        debug!(%cmd, "local command");
        run_output(cmd, self.command(cmd)).await
    }

    async fn shell(&self, cmd: &str, io: ShellIo) -> PlatformResult<()> {
        run_shell(cmd, self.command(cmd), io).await
    }

    async fn start(&self, cmd: &str) -> PlatformResult<Started> {
        run_start(cmd, self.command(cmd))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;

    #[tokio::test]
    async fn local_output_combines_streams() {
        let dir = tempfile::tempdir().unwrap();
        let client = LocalClient::new(dir.path());
        let out = client.output("echo out; echo err 1>&2").await.unwrap();
        assert!(out.contains("out"));
        assert!(out.contains("err"));
    }

    #[tokio::test]
    async fn local_failure_carries_command_and_output() {
        let dir = tempfile::tempdir().unwrap();
        let client = LocalClient::new(dir.path());
        let err = client.output("echo nope; exit 3").await.unwrap_err();
        assert!(err.output_contains("nope"));
        assert!(err.to_string().contains("exit 3"));
    }

    #[tokio::test]
    async fn write_file_survives_shell_metacharacters() {
        let dir = tempfile::tempdir().unwrap();
        let client = LocalClient::new(dir.path());
        let contents = "name: '$HOME' \"quoted\" `tick`\n";
        client
            .write_file("conf.yaml", contents, "test config", false)
            .await
            .unwrap();
        let written = std::fs::read_to_string(dir.path().join("conf.yaml")).unwrap();
        assert_eq!(written, contents);

        client.run("mkdir -p sub && touch sub/x").await.unwrap();
        client.delete_dir("sub").await.unwrap();
        assert!(!dir.path().join("sub").exists());
    }

    #[tokio::test]
    async fn shell_pipes_stdin_through() {
        let dir = tempfile::tempdir().unwrap();
        let client = LocalClient::new(dir.path());
        let (out_w, mut out_r) = tokio::io::duplex(1024);
        let io = ShellIo {
            stdin: Box::new(&b"hello\n"[..]),
            stdout: Box::new(out_w),
            stderr: Box::new(tokio::io::sink()),
        };
        client.shell("cat", io).await.unwrap();
        let mut got = String::new();
        out_r.read_to_string(&mut got).await.unwrap();
        assert_eq!(got, "hello\n");
    }

    #[tokio::test]
    async fn start_then_wait_reports_exit() {
        let dir = tempfile::tempdir().unwrap();
        let client = LocalClient::new(dir.path());
        let mut started = client.start("echo started").await.unwrap();
        let mut out = String::new();
        started.stdout.read_to_string(&mut out).await.unwrap();
        assert_eq!(out.trim(), "started");
        client.wait(started.exit).await.unwrap();

        let failing = client.start("exit 1").await.unwrap();
        assert!(client.wait(failing.exit).await.is_err());
    }
}
