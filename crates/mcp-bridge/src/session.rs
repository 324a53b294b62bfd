//! One relay session: a client connection bound to its own backend process.

use crate::launcher::BackendLauncher;
use mcp_bridge_core::{BridgeError, DiagnosticSink, RelayOutcome, TracingSink, drain, relay};
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, info, info_span, warn};

/// How long the stderr drain may outlive its backend before it is abandoned.
/// Grandchildren that inherited the pipe can keep it open indefinitely.
const DRAIN_LINGER: Duration = Duration::from_secs(1);

static NEXT_SESSION: AtomicU64 = AtomicU64::new(1);

pub fn next_session_id() -> u64 {
    NEXT_SESSION.fetch_add(1, Ordering::Relaxed)
}

/// Pairs client connections with freshly spawned backends.
///
/// Every call to [`run`](Self::run) owns exactly one backend, which is
/// terminated before the call returns, whatever ended the session.
#[derive(Clone)]
pub struct Bridge {
    launcher: BackendLauncher,
    sink: Option<Arc<dyn DiagnosticSink>>,
}

impl fmt::Debug for Bridge {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Bridge")
            .field("command", &self.launcher.config().command)
            .field("shared_sink", &self.sink.is_some())
            .finish()
    }
}

impl Bridge {
    pub fn new(launcher: BackendLauncher) -> Self {
        Self {
            launcher,
            sink: None,
        }
    }

    /// Send backend stderr to `sink` instead of a per-session tracing sink.
    pub fn with_diagnostic_sink(mut self, sink: Arc<dyn DiagnosticSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    pub fn launcher(&self) -> &BackendLauncher {
        &self.launcher
    }

    /// Relay between a client and a new backend until either side ends.
    ///
    /// A launch failure is returned before any byte is read from the client;
    /// the caller drops the client streams, which closes the connection.
    pub async fn run<I, O>(
        &self,
        client_in: I,
        client_out: O,
        peer: &str,
        cancel: CancellationToken,
    ) -> Result<RelayOutcome, BridgeError>
    where
        I: AsyncRead + Unpin + Send,
        O: AsyncWrite + Unpin + Send,
    {
        let id = next_session_id();
        let span = info_span!("session", session = id, %peer);
        self.run_session(id, client_in, client_out, cancel)
            .instrument(span)
            .await
    }

    async fn run_session<I, O>(
        &self,
        id: u64,
        client_in: I,
        client_out: O,
        cancel: CancellationToken,
    ) -> Result<RelayOutcome, BridgeError>
    where
        I: AsyncRead + Unpin + Send,
        O: AsyncWrite + Unpin + Send,
    {
        let buffer_size = self.launcher.config().buffer_size;

        let mut backend = match self.launcher.spawn().await {
            Ok(backend) => backend,
            Err(e) => {
                warn!(error = %e, "Backend failed to launch, closing connection");
                return Err(e);
            }
        };
        info!(pid = ?backend.pid(), "Session started");

        let streams = (
            backend.take_stdin(),
            backend.take_stdout(),
            backend.take_stderr(),
        );
        let (Some(stdin), Some(stdout), Some(stderr)) = streams else {
            backend.terminate().await;
            return Err(BridgeError::Other(anyhow::anyhow!(
                "backend was spawned without piped stdio"
            )));
        };

        let sink = self
            .sink
            .clone()
            .unwrap_or_else(|| Arc::new(TracingSink::new(id)));
        let drain_task = tokio::spawn(
            async move { drain(stderr, sink.as_ref(), buffer_size).await }.in_current_span(),
        );

        let outcome = relay(client_in, client_out, stdin, stdout, buffer_size, &cancel).await;

        let termination = backend.terminate().await;
        debug!(?termination, "Backend terminated");

        let mut drain_task = drain_task;
        match tokio::time::timeout(DRAIN_LINGER, &mut drain_task).await {
            Ok(Ok(lines)) => debug!(lines, "Diagnostic drain finished"),
            Ok(Err(e)) => warn!(error = %e, "Diagnostic drain task failed"),
            Err(_) => {
                debug!("Diagnostic stream still open after backend exit, abandoning it");
                drain_task.abort();
            }
        }

        info!(
            end = ?outcome.end,
            to_backend = outcome.to_backend,
            to_client = outcome.to_client,
            "Session closed"
        );
        Ok(outcome)
    }
}
