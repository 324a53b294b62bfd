use anyhow::Result;
use async_trait::async_trait;
use std::collections::HashMap;
use std::fmt;
use std::path::Path;
use std::process::ExitStatus;
use std::time::Duration;
use tokio::process::{ChildStderr, ChildStdin, ChildStdout};
use tracing::{debug, info, warn};

/// OS process id of a backend or one of its descendants
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ProcessId(pub u32);

impl From<u32> for ProcessId {
    fn from(pid: u32) -> Self {
        ProcessId(pid)
    }
}

impl fmt::Display for ProcessId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// How a stop request went
#[derive(Debug, Clone, PartialEq)]
pub enum TerminationResult {
    Success,
    /// Nothing left to signal, the process is already gone
    ProcessNotFound,
    /// Insufficient privileges to signal the process
    AccessDenied,
    Timeout,
    Failed(String),
}

#[derive(Debug, thiserror::Error)]
pub enum ProcessError {
    #[error("Failed to spawn process: {0}")]
    SpawnFailed(String),
    #[error("Process not found: {0}")]
    ProcessNotFound(ProcessId),
    #[error("Timed out waiting for process exit")]
    Timeout,
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}

/// Starting backends and watching them run
#[async_trait]
pub trait ProcessLifecycle: Send + Sync {
    type Handle: ProcessHandle + 'static;

    /// Spawn a new process with piped stdin, stdout and stderr
    async fn spawn_process(
        &self,
        command: &str,
        args: &[String],
        working_dir: Option<&Path>,
        env: &HashMap<String, String>,
    ) -> Result<Self::Handle, ProcessError>;

    async fn is_process_healthy(&self, handle: &dyn ProcessHandle) -> bool {
        handle.is_running().await
    }

    /// Reap the process, giving up after `timeout` when one is set
    async fn wait_for_exit(
        &self,
        handle: &mut dyn ProcessHandle,
        timeout: Option<Duration>,
    ) -> Result<ExitStatus, ProcessError> {
        match timeout {
            Some(duration) => tokio::time::timeout(duration, handle.wait())
                .await
                .map_err(|_| ProcessError::Timeout)?,
            None => handle.wait().await,
        }
    }
}

/// Stopping backends along with anything they forked
#[async_trait]
pub trait ProcessTermination: Send + Sync {
    /// Send a graceful stop signal to a single process (SIGTERM on Unix)
    async fn terminate_gracefully(&self, handle: &mut dyn ProcessHandle) -> TerminationResult;

    /// Force kill a single process and reap it (SIGKILL on Unix)
    async fn force_kill(&self, handle: &mut dyn ProcessHandle) -> TerminationResult;

    /// Every descendant of `pid`, deepest first
    async fn find_child_processes(&self, pid: ProcessId) -> Result<Vec<ProcessId>>;

    /// Signal the process group led by `pid`
    async fn signal_process_group(&self, pid: ProcessId, force: bool) -> TerminationResult;

    /// Signal a process tree, descendants first
    async fn signal_process_tree(&self, root_pid: ProcessId, force: bool) -> TerminationResult;

    /// Complete termination strategy.
    ///
    /// Sends a graceful stop to the process group, falling back to the
    /// process tree and then the process itself. If the process has not
    /// exited after `grace`, it is force killed. The handle is reaped on
    /// every path that returns `Success`.
    async fn terminate_completely(
        &self,
        handle: &mut dyn ProcessHandle,
        grace: Duration,
    ) -> TerminationResult {
        let Some(pid) = handle.get_pid() else {
            // tokio clears the pid once the child has been reaped
            return TerminationResult::ProcessNotFound;
        };

        let graceful = match self.signal_process_group(pid, false).await {
            TerminationResult::Success => TerminationResult::Success,
            group => {
                debug!("Process group signal for {} failed: {:?}", pid, group);
                match self.signal_process_tree(pid, false).await {
                    TerminationResult::Success => TerminationResult::Success,
                    _ => self.terminate_gracefully(handle).await,
                }
            }
        };

        if let TerminationResult::Failed(reason) = &graceful {
            warn!("Graceful stop of process {} failed: {}", pid, reason);
            return self.force_kill(handle).await;
        }

        match tokio::time::timeout(grace, handle.wait()).await {
            Ok(Ok(status)) => {
                info!("Process {} exited after stop signal: {:?}", pid, status);
                TerminationResult::Success
            }
            Ok(Err(e)) => TerminationResult::Failed(format!("wait failed: {e}")),
            Err(_) => {
                warn!(
                    "Process {} did not exit within {:?}, killing it",
                    pid, grace
                );
                let _ = self.signal_process_group(pid, true).await;
                self.force_kill(handle).await
            }
        }
    }
}

/// A spawned backend whose stdio is still owned by the bridge until taken
#[async_trait]
pub trait ProcessHandle: Send + Sync {
    /// `None` once the process has been reaped
    fn get_pid(&self) -> Option<ProcessId>;

    fn get_command(&self) -> &str;

    fn take_stdin(&mut self) -> Option<ChildStdin>;
    fn take_stdout(&mut self) -> Option<ChildStdout>;
    fn take_stderr(&mut self) -> Option<ChildStderr>;

    async fn is_running(&self) -> bool;

    async fn try_wait(&mut self) -> Result<Option<ExitStatus>, ProcessError>;

    async fn wait(&mut self) -> Result<ExitStatus, ProcessError>;

    /// Kill the process and reap it
    async fn kill(&mut self) -> Result<(), ProcessError>;
}

#[async_trait]
pub trait ProcessManager: ProcessLifecycle + ProcessTermination {
    fn new() -> Self
    where
        Self: Sized;

    /// Release whatever the manager caches between calls
    async fn cleanup(&self) -> Result<()>;
}

/// Picks the process manager for the platform the bridge was built for
pub trait ProcessManagerFactory {
    type Manager: ProcessManager;

    fn create_process_manager() -> Self::Manager;

    /// Shown in startup logs
    fn platform_name() -> &'static str;
}
