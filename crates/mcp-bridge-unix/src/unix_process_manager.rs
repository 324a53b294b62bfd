use anyhow::Result;
use async_trait::async_trait;
use mcp_bridge_core::{
    ProcessError, ProcessHandle, ProcessId, ProcessLifecycle, ProcessManager,
    ProcessTermination, TerminationResult,
};
use nix::errno::Errno;
use nix::sys::signal::{self, Signal};
use nix::unistd::Pid as NixPid;
use std::collections::HashMap;
use std::path::Path;
use std::process::{ExitStatus, Stdio};
use sysinfo::{ProcessRefreshKind, ProcessesToUpdate, System};
use tokio::process::{Child, ChildStderr, ChildStdin, ChildStdout, Command};
use tracing::{debug, info, warn};

/// Handle to a backend spawned with all three stdio streams piped.
pub struct UnixProcessHandle {
    child: Child,
    command: String,
}

impl UnixProcessHandle {
    pub fn new(child: Child, command: String) -> Self {
        Self { child, command }
    }
}

#[async_trait]
impl ProcessHandle for UnixProcessHandle {
    fn get_pid(&self) -> Option<ProcessId> {
        self.child.id().map(ProcessId::from)
    }

    fn get_command(&self) -> &str {
        &self.command
    }

    fn take_stdin(&mut self) -> Option<ChildStdin> {
        self.child.stdin.take()
    }

    fn take_stdout(&mut self) -> Option<ChildStdout> {
        self.child.stdout.take()
    }

    fn take_stderr(&mut self) -> Option<ChildStderr> {
        self.child.stderr.take()
    }

    async fn is_running(&self) -> bool {
        match self.get_pid() {
            // signal 0 only probes for existence
            Some(pid) => signal::kill(nix_pid(pid), None).is_ok(),
            None => false,
        }
    }

    async fn try_wait(&mut self) -> Result<Option<ExitStatus>, ProcessError> {
        Ok(self.child.try_wait()?)
    }

    async fn wait(&mut self) -> Result<ExitStatus, ProcessError> {
        Ok(self.child.wait().await?)
    }

    async fn kill(&mut self) -> Result<(), ProcessError> {
        self.child.kill().await.map_err(ProcessError::from)
    }
}

/// Unix process manager with process group and process tree termination.
pub struct UnixProcessManager {
    system: std::sync::Mutex<System>,
}

impl Default for UnixProcessManager {
    fn default() -> Self {
        <Self as ProcessManager>::new()
    }
}

fn nix_pid(pid: ProcessId) -> NixPid {
    NixPid::from_raw(pid.0 as i32)
}

fn stop_signal(force: bool) -> Signal {
    if force { Signal::SIGKILL } else { Signal::SIGTERM }
}

fn signal_result(
    target: &str,
    pid: ProcessId,
    signal: Signal,
    result: nix::Result<()>,
) -> TerminationResult {
    match result {
        Ok(()) => {
            debug!("Sent {} to {} {}", signal, target, pid);
            TerminationResult::Success
        }
        Err(Errno::ESRCH) => {
            debug!("{} {} not found (already exited)", target, pid);
            TerminationResult::ProcessNotFound
        }
        Err(Errno::EPERM) => {
            warn!("Permission denied to signal {} {}", target, pid);
            TerminationResult::AccessDenied
        }
        Err(e) => {
            warn!("Failed to send {} to {} {}: {}", signal, target, pid, e);
            TerminationResult::Failed(format!("{signal} failed: {e}"))
        }
    }
}

#[async_trait]
impl ProcessLifecycle for UnixProcessManager {
    type Handle = UnixProcessHandle;

    async fn spawn_process(
        &self,
        command: &str,
        args: &[String],
        working_dir: Option<&Path>,
        env: &HashMap<String, String>,
    ) -> Result<Self::Handle, ProcessError> {
        let mut cmd = Command::new(command);
        cmd.args(args)
            .envs(env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        if let Some(dir) = working_dir {
            cmd.current_dir(dir);
        }

        // Own process group so helpers the backend forks are stopped with it
        cmd.process_group(0);

        let child = cmd
            .spawn()
            .map_err(|e| ProcessError::SpawnFailed(format!("{command}: {e}")))?;

        if let Some(pid) = child.id() {
            info!(
                "Spawned backend process: {} (PID: {}) with args: {:?}",
                command, pid, args
            );
        }

        Ok(UnixProcessHandle::new(child, command.to_string()))
    }
}

#[async_trait]
impl ProcessTermination for UnixProcessManager {
    async fn terminate_gracefully(&self, handle: &mut dyn ProcessHandle) -> TerminationResult {
        match handle.get_pid() {
            Some(pid) => signal_result(
                "process",
                pid,
                Signal::SIGTERM,
                signal::kill(nix_pid(pid), Signal::SIGTERM),
            ),
            None => TerminationResult::ProcessNotFound,
        }
    }

    async fn force_kill(&self, handle: &mut dyn ProcessHandle) -> TerminationResult {
        if handle.get_pid().is_none() {
            return TerminationResult::ProcessNotFound;
        }

        // Child::kill sends SIGKILL and reaps the process
        match handle.kill().await {
            Ok(()) => {
                info!("Killed process {}", handle.get_command());
                TerminationResult::Success
            }
            Err(e) => {
                warn!("Failed to kill process {}: {}", handle.get_command(), e);
                TerminationResult::Failed(format!("SIGKILL failed: {e}"))
            }
        }
    }

    async fn find_child_processes(&self, parent_pid: ProcessId) -> Result<Vec<ProcessId>> {
        let mut system = self
            .system
            .lock()
            .map_err(|_| anyhow::anyhow!("process table lock poisoned"))?;
        system.refresh_processes_specifics(
            ProcessesToUpdate::All,
            true,
            ProcessRefreshKind::default(),
        );

        let mut children = Vec::new();
        Self::find_children_recursive(&system, parent_pid.0, &mut children);

        Ok(children.into_iter().map(ProcessId::from).collect())
    }

    async fn signal_process_group(&self, pid: ProcessId, force: bool) -> TerminationResult {
        let signal = stop_signal(force);
        signal_result(
            "process group",
            pid,
            signal,
            signal::killpg(nix_pid(pid), signal),
        )
    }

    async fn signal_process_tree(&self, root_pid: ProcessId, force: bool) -> TerminationResult {
        let signal = stop_signal(force);

        let children = match self.find_child_processes(root_pid).await {
            Ok(children) => children,
            Err(e) => {
                warn!("Failed to find child processes for PID {}: {}", root_pid, e);
                return TerminationResult::Failed(format!("Failed to enumerate children: {e}"));
            }
        };

        if !children.is_empty() {
            debug!("Signalling {} descendants of {}", children.len(), root_pid);
        }

        // Descendants are listed deepest first
        for child_pid in children {
            let sent = signal::kill(nix_pid(child_pid), signal);
            match signal_result("process", child_pid, signal, sent) {
                TerminationResult::Success | TerminationResult::ProcessNotFound => {}
                result => warn!("Failed to signal child process {}: {:?}", child_pid, result),
            }
        }

        let sent = signal::kill(nix_pid(root_pid), signal);
        signal_result("process", root_pid, signal, sent)
    }
}

impl UnixProcessManager {
    fn find_children_recursive(system: &System, parent_pid: u32, result: &mut Vec<u32>) {
        for (pid, process) in system.processes() {
            if process.parent().map(|p| p.as_u32()) == Some(parent_pid) {
                let child_pid = pid.as_u32();
                Self::find_children_recursive(system, child_pid, result);
                result.push(child_pid);
            }
        }
    }
}

#[async_trait]
impl ProcessManager for UnixProcessManager {
    fn new() -> Self {
        debug!("Initializing Unix process manager");
        Self {
            system: std::sync::Mutex::new(System::new()),
        }
    }

    async fn cleanup(&self) -> Result<()> {
        Ok(())
    }
}
