//! Runtime abstraction over supervised child processes.
//!
//! The manager's algorithm only needs `spawn`, `signal`, and `wait`; the
//! local-process runtime is the one shipped implementation, and container or
//! remote variants can slot in behind the same traits.

use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;

use async_trait::async_trait;
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use tokio::process::{Child, Command};
use tracing::{info, warn};
use uuid::Uuid;

/// Environment variable carrying the runner identifier into the child.
pub const ENV_RUNNER_ID: &str = "STRATAVORE_RUNNER_ID";
/// Environment variable carrying the daemon API endpoint into the child.
pub const ENV_API_ENDPOINT: &str = "STRATAVORE_API_ENDPOINT";

#[derive(Debug, thiserror::Error)]
pub enum RuntimeError {
    #[error("failed to spawn process: {0}")]
    Spawn(#[source] std::io::Error),

    #[error("failed to signal process: {0}")]
    Signal(String),

    #[error("failed to wait on process: {0}")]
    Wait(#[source] std::io::Error),
}

/// Polite first, forcible on escalation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopSignal {
    Graceful,
    Forcible,
}

#[derive(Debug, Clone, Copy)]
pub struct ExitStatusInfo {
    pub code: Option<i32>,
    pub success: bool,
}

/// Everything needed to start one runner child.
#[derive(Debug, Clone)]
pub struct LaunchSpec {
    pub runner_id: Uuid,
    /// Child working directory; the owning project's filesystem path.
    pub workdir: PathBuf,
    /// Executable and arguments, no shell interpretation.
    pub command: Vec<String>,
    pub env: HashMap<String, String>,
    /// Attach the child's stdio to the daemon's (visible in daemon logs)
    /// instead of discarding it.
    pub attach_stdio: bool,
}

#[async_trait]
pub trait Runtime: Send + Sync {
    async fn spawn(&self, spec: &LaunchSpec) -> Result<Box<dyn RuntimeHandle>, RuntimeError>;
}

#[async_trait]
pub trait RuntimeHandle: Send {
    fn pid(&self) -> Option<u32>;
    fn signal(&mut self, signal: StopSignal) -> Result<(), RuntimeError>;
    /// Wait for the child to exit; also reaps the zombie.
    async fn wait(&mut self) -> Result<ExitStatusInfo, RuntimeError>;
}

/// Spawns runners as local child processes.
pub struct LocalProcessRuntime;

impl LocalProcessRuntime {
    pub fn new() -> Self {
        Self
    }
}

impl Default for LocalProcessRuntime {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Runtime for LocalProcessRuntime {
    async fn spawn(&self, spec: &LaunchSpec) -> Result<Box<dyn RuntimeHandle>, RuntimeError> {
        let executable = spec
            .command
            .first()
            .ok_or_else(|| RuntimeError::Signal("empty command".to_string()))?;

        let mut cmd = Command::new(executable);
        cmd.args(&spec.command[1..]);
        cmd.current_dir(&spec.workdir);
        cmd.envs(&spec.env);

        if spec.attach_stdio {
            cmd.stdin(Stdio::null());
            cmd.stdout(Stdio::inherit());
            cmd.stderr(Stdio::inherit());
        } else {
            cmd.stdin(Stdio::null());
            cmd.stdout(Stdio::null());
            cmd.stderr(Stdio::null());
        }

        // An orphaned handle must not leak a live child.
        cmd.kill_on_drop(true);

        let child = cmd.spawn().map_err(RuntimeError::Spawn)?;

        info!(
            runner_id = %spec.runner_id,
            executable = %executable,
            pid = ?child.id(),
            workdir = %spec.workdir.display(),
            "runner process spawned"
        );

        Ok(Box::new(LocalProcessHandle { child }))
    }
}

struct LocalProcessHandle {
    child: Child,
}

#[async_trait]
impl RuntimeHandle for LocalProcessHandle {
    fn pid(&self) -> Option<u32> {
        self.child.id()
    }

    fn signal(&mut self, signal: StopSignal) -> Result<(), RuntimeError> {
        match signal {
            StopSignal::Graceful => {
                let pid = self
                    .child
                    .id()
                    .ok_or_else(|| RuntimeError::Signal("process already exited".to_string()))?;
                kill(Pid::from_raw(pid as i32), Signal::SIGTERM)
                    .map_err(|e| RuntimeError::Signal(e.to_string()))
            }
            StopSignal::Forcible => self
                .child
                .start_kill()
                .map_err(|e| RuntimeError::Signal(e.to_string())),
        }
    }

    async fn wait(&mut self) -> Result<ExitStatusInfo, RuntimeError> {
        let status = self.child.wait().await.map_err(RuntimeError::Wait)?;
        if !status.success() {
            warn!(pid = ?self.child.id(), code = ?status.code(), "runner process exited nonzero");
        }
        Ok(ExitStatusInfo {
            code: status.code(),
            success: status.success(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec(command: &[&str]) -> LaunchSpec {
        LaunchSpec {
            runner_id: Uuid::new_v4(),
            workdir: PathBuf::from("/tmp"),
            command: command.iter().map(|s| s.to_string()).collect(),
            env: HashMap::new(),
            attach_stdio: false,
        }
    }

    #[tokio::test]
    async fn spawn_and_wait_reports_exit_code() {
        let runtime = LocalProcessRuntime::new();
        let mut handle = runtime.spawn(&spec(&["sh", "-c", "exit 7"])).await.unwrap();
        let status = handle.wait().await.unwrap();
        assert!(!status.success);
        assert_eq!(status.code, Some(7));
    }

    #[tokio::test]
    async fn spawn_success_exit_zero() {
        let runtime = LocalProcessRuntime::new();
        let mut handle = runtime.spawn(&spec(&["true"])).await.unwrap();
        let status = handle.wait().await.unwrap();
        assert!(status.success);
        assert_eq!(status.code, Some(0));
    }

    #[tokio::test]
    async fn graceful_signal_terminates_sleeping_child() {
        let runtime = LocalProcessRuntime::new();
        let mut handle = runtime.spawn(&spec(&["sleep", "30"])).await.unwrap();
        assert!(handle.pid().is_some());

        handle.signal(StopSignal::Graceful).unwrap();
        let status = handle.wait().await.unwrap();
        assert!(!status.success);
        // Killed by signal: no exit code on unix.
        assert_eq!(status.code, None);
    }

    #[tokio::test]
    async fn spawn_missing_binary_fails() {
        let runtime = LocalProcessRuntime::new();
        let result = runtime
            .spawn(&spec(&["definitely-not-a-real-binary-5481"]))
            .await;
        assert!(matches!(result, Err(RuntimeError::Spawn(_))));
    }
}
