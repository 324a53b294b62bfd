use mcp_bridge_core::{
    BridgeConfig, BridgeError, ProcessError, ProcessHandle, ProcessId, ProcessLifecycle,
    ProcessManager, ProcessManagerFactory, ProcessTermination, TerminationResult,
};
use std::collections::HashMap;
use std::path::Path;
use std::process::ExitStatus;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::process::{ChildStderr, ChildStdin, ChildStdout};
use tracing::{debug, error, info, warn};

#[cfg(unix)]
type PlatformFactory = mcp_bridge_unix::UnixProcessManagerFactory;

type PlatformManager = <PlatformFactory as ProcessManagerFactory>::Manager;
type PlatformHandle = <PlatformManager as ProcessLifecycle>::Handle;

type ActiveProcesses = Arc<Mutex<HashMap<ProcessId, String>>>;

fn lock(active: &ActiveProcesses) -> MutexGuard<'_, HashMap<ProcessId, String>> {
    // the map stays consistent even if a holder panicked
    active.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Emergency SIGTERM for whatever is still tracked when the last launcher
/// clone goes away.
struct Registry {
    active: ActiveProcesses,
}

impl Drop for Registry {
    fn drop(&mut self) {
        let active_processes = lock(&self.active).keys().copied().collect::<Vec<_>>();

        if !active_processes.is_empty() {
            warn!(
                "Launcher dropped with {} active backends - attempting emergency cleanup",
                active_processes.len()
            );

            // no async in Drop, so signal synchronously and let the owners reap
            for pid in active_processes {
                #[cfg(unix)]
                {
                    use nix::sys::signal::{self, Signal};
                    use nix::unistd::Pid as NixPid;

                    let nix_pid = NixPid::from_raw(pid.0 as i32);
                    if let Err(e) = signal::kill(nix_pid, Signal::SIGTERM) {
                        warn!("Emergency cleanup failed for process {}: {}", pid, e);
                    }
                }
            }
        }
    }
}

/// Spawns backend processes and keeps track of the ones still alive.
///
/// Cloning is cheap; clones share the same platform manager and tracking.
#[derive(Clone)]
pub struct BackendLauncher {
    platform_manager: Arc<PlatformManager>,
    registry: Arc<Registry>,
    config: Arc<BridgeConfig>,
}

impl BackendLauncher {
    pub fn new(config: BridgeConfig) -> Self {
        let platform_manager = PlatformFactory::create_process_manager();
        info!(
            "Created backend launcher with platform: {}",
            PlatformFactory::platform_name()
        );

        Self {
            platform_manager: Arc::new(platform_manager),
            registry: Arc::new(Registry {
                active: Arc::new(Mutex::new(HashMap::new())),
            }),
            config: Arc::new(config),
        }
    }

    pub fn config(&self) -> &BridgeConfig {
        &self.config
    }

    /// Start a backend from the launcher's configuration.
    pub async fn spawn(&self) -> Result<BackendProcess, BridgeError> {
        let config = &self.config;
        self.spawn_process(
            &config.command,
            &config.args,
            config.working_directory(),
            &config.env,
        )
        .await
    }

    /// Spawn an arbitrary command and track it.
    pub async fn spawn_process(
        &self,
        command: &str,
        args: &[String],
        working_dir: Option<&Path>,
        env: &HashMap<String, String>,
    ) -> Result<BackendProcess, BridgeError> {
        debug!("Spawning backend: {} with args: {:?}", command, args);

        let handle = self
            .platform_manager
            .spawn_process(command, args, working_dir, env)
            .await?;

        let pid = handle.get_pid();
        if let Some(pid) = pid {
            lock(&self.registry.active).insert(pid, command.to_string());
            info!("Tracking new backend: {} (PID: {})", command, pid);
        }

        Ok(BackendProcess {
            handle,
            pid,
            platform_manager: self.platform_manager.clone(),
            active: self.registry.active.clone(),
            grace_period: self.config.grace_period(),
        })
    }

    pub fn active_process_count(&self) -> usize {
        lock(&self.registry.active).len()
    }

    pub fn tracked_processes(&self) -> Vec<(ProcessId, String)> {
        let mut tracked: Vec<_> = lock(&self.registry.active)
            .iter()
            .map(|(pid, command)| (*pid, command.clone()))
            .collect();
        tracked.sort();
        tracked
    }

    /// Stop every tracked backend and clear the tracking.
    ///
    /// Owners of the handles still reap their processes.
    pub async fn cleanup(&self) -> anyhow::Result<()> {
        info!("Starting launcher cleanup");

        let active_processes = lock(&self.registry.active)
            .keys()
            .copied()
            .collect::<Vec<_>>();

        if !active_processes.is_empty() {
            warn!("Cleaning up {} active backends", active_processes.len());

            for pid in active_processes {
                let result = match self.platform_manager.signal_process_group(pid, false).await {
                    TerminationResult::Success => TerminationResult::Success,
                    _ => self.platform_manager.signal_process_tree(pid, false).await,
                };
                match result {
                    TerminationResult::Success | TerminationResult::ProcessNotFound => {
                        debug!("Successfully cleaned up process {}", pid);
                    }
                    result => {
                        error!("Failed to cleanup process {}: {:?}", pid, result);
                    }
                }
            }
        }

        lock(&self.registry.active).clear();

        self.platform_manager.cleanup().await?;

        info!("Launcher cleanup completed");
        Ok(())
    }
}

/// A running backend, exclusively owned by one session.
///
/// Dropping it without [`terminate`](Self::terminate) still kills the child,
/// since backends are spawned with kill-on-drop.
pub struct BackendProcess {
    handle: PlatformHandle,
    pid: Option<ProcessId>,
    platform_manager: Arc<PlatformManager>,
    active: ActiveProcesses,
    grace_period: Duration,
}

impl BackendProcess {
    pub fn pid(&self) -> Option<ProcessId> {
        self.pid
    }

    pub fn command(&self) -> &str {
        self.handle.get_command()
    }

    pub fn take_stdin(&mut self) -> Option<ChildStdin> {
        self.handle.take_stdin()
    }

    pub fn take_stdout(&mut self) -> Option<ChildStdout> {
        self.handle.take_stdout()
    }

    pub fn take_stderr(&mut self) -> Option<ChildStderr> {
        self.handle.take_stderr()
    }

    pub async fn is_running(&self) -> bool {
        self.platform_manager.is_process_healthy(&self.handle).await
    }

    /// SIGTERM the backend and its process group, then SIGKILL once the grace
    /// period runs out. The process is reaped before this returns `Success`.
    pub async fn terminate(&mut self) -> TerminationResult {
        let result = self
            .platform_manager
            .terminate_completely(&mut self.handle, self.grace_period)
            .await;
        self.untrack();
        result
    }

    pub async fn wait(&mut self, timeout: Option<Duration>) -> Result<ExitStatus, ProcessError> {
        let status = self
            .platform_manager
            .wait_for_exit(&mut self.handle, timeout)
            .await?;
        self.untrack();
        Ok(status)
    }

    pub async fn kill(&mut self) -> Result<(), ProcessError> {
        if let Some(pid) = self.pid {
            let _ = self.platform_manager.signal_process_group(pid, true).await;
        }
        self.handle.kill().await?;
        self.untrack();
        Ok(())
    }

    fn untrack(&mut self) {
        if let Some(pid) = self.pid.take() {
            lock(&self.active).remove(&pid);
            debug!("Stopped tracking backend {}", pid);
        }
    }
}

impl Drop for BackendProcess {
    fn drop(&mut self) {
        self.untrack();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    fn config(command: &str, args: &[&str]) -> BridgeConfig {
        BridgeConfig::builder()
            .name("test")
            .command(command)
            .args(args.iter().copied())
            .grace_period_ms(2_000u64)
            .build()
            .unwrap()
    }

    #[tokio::test]
    async fn test_spawn_tracks_until_terminated() {
        let launcher = BackendLauncher::new(config("sleep", &["30"]));

        let mut backend = launcher.spawn().await.unwrap();
        let pid = backend.pid().unwrap();
        assert_eq!(launcher.active_process_count(), 1);
        assert_eq!(launcher.tracked_processes(), vec![(pid, "sleep".to_string())]);
        assert!(backend.is_running().await);

        assert_eq!(backend.terminate().await, TerminationResult::Success);
        assert_eq!(launcher.active_process_count(), 0);
    }

    #[tokio::test]
    async fn test_spawn_failure_is_launch_error() {
        let launcher = BackendLauncher::new(config("/nonexistent/backend", &[]));

        let err = launcher.spawn().await.err().unwrap();
        assert!(matches!(err, BridgeError::Launch(ProcessError::SpawnFailed(_))));
        assert_eq!(launcher.active_process_count(), 0);
    }

    #[tokio::test]
    async fn test_backend_streams_are_piped() {
        let launcher = BackendLauncher::new(config("cat", &[]));
        let mut backend = launcher.spawn().await.unwrap();

        let mut stdin = backend.take_stdin().unwrap();
        let mut stdout = backend.take_stdout().unwrap();
        stdin.write_all(b"ping\n").await.unwrap();
        drop(stdin);

        let mut echoed = String::new();
        stdout.read_to_string(&mut echoed).await.unwrap();
        assert_eq!(echoed, "ping\n");

        backend.wait(Some(Duration::from_secs(5))).await.unwrap();
        assert_eq!(launcher.active_process_count(), 0);
    }

    #[tokio::test]
    async fn test_dropping_backend_untracks_it() {
        let launcher = BackendLauncher::new(config("sleep", &["30"]));
        let backend = launcher.spawn().await.unwrap();
        assert_eq!(launcher.active_process_count(), 1);

        drop(backend);
        assert_eq!(launcher.active_process_count(), 0);
    }

    #[tokio::test]
    async fn test_kill_reaps_backend() {
        let launcher = BackendLauncher::new(config("sleep", &["30"]));
        let mut backend = launcher.spawn().await.unwrap();

        backend.kill().await.unwrap();
        assert!(!backend.is_running().await);
        assert_eq!(launcher.active_process_count(), 0);
    }

    #[tokio::test]
    async fn test_cleanup_signals_tracked_backends() {
        let launcher = BackendLauncher::new(config("sleep", &["30"]));
        let mut backend = launcher.spawn().await.unwrap();

        launcher.cleanup().await.unwrap();
        assert_eq!(launcher.active_process_count(), 0);

        let status = backend.wait(Some(Duration::from_secs(5))).await.unwrap();
        assert!(!status.success());
    }
}
