//! Streaming listener: one persistent relay session per TCP connection.

use crate::session::Bridge;
use mcp_bridge_core::BridgeError;
use std::io;
use std::net::SocketAddr;
use tokio::net::{TcpListener, TcpStream};
use tokio_stream::wrappers::TcpListenerStream;
use tokio_stream::{Stream, StreamExt};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

/// An accepted client connection.
#[derive(Debug)]
pub struct Connection {
    pub stream: TcpStream,
    pub peer: SocketAddr,
}

pub async fn listen(host: &str, port: u16) -> Result<TcpListener, BridgeError> {
    let listener = TcpListener::bind((host, port))
        .await
        .map_err(|e| BridgeError::Configuration(format!("cannot bind {host}:{port}: {e}")))?;

    if let Ok(addr) = listener.local_addr() {
        info!(%addr, "Listening for stream connections");
    }
    Ok(listener)
}

/// Lazily accept connections, one item per client, for as long as the
/// listener lives.
///
/// Only listener failures are yielded as errors. A client that is gone
/// before its connection could be set up is logged and skipped.
pub fn incoming(listener: TcpListener) -> impl Stream<Item = io::Result<Connection>> {
    TcpListenerStream::new(listener).filter_map(|accepted| match accepted {
        Ok(stream) => prepare(stream).map(Ok),
        Err(e) if is_client_failure(&e) => {
            warn!(error = %e, "Client connection failed during accept");
            None
        }
        Err(e) => Some(Err(e)),
    })
}

fn prepare(stream: TcpStream) -> Option<Connection> {
    let peer = match stream.peer_addr() {
        Ok(peer) => peer,
        Err(e) => {
            warn!(error = %e, "Client disconnected before its session started");
            return None;
        }
    };
    // requests are small and latency bound
    if let Err(e) = stream.set_nodelay(true) {
        debug!(%peer, error = %e, "Cannot set TCP_NODELAY");
    }
    Some(Connection { stream, peer })
}

/// Accept errors caused by one client rather than by the listener.
fn is_client_failure(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::ConnectionAborted
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::NotConnected
            | io::ErrorKind::Interrupted
    )
}

/// Accept connections until `shutdown` fires, running a session for each.
///
/// Sessions run independently; a failing session or a client that drops
/// during accept never affects the accept loop. A listener error is fatal:
/// every live session is cancelled and the error is returned once they have
/// torn down.
pub async fn serve(
    listener: TcpListener,
    bridge: Bridge,
    shutdown: CancellationToken,
) -> Result<(), BridgeError> {
    let tracker = TaskTracker::new();
    let sessions = shutdown.child_token();
    let connections = incoming(listener);
    tokio::pin!(connections);

    let result = loop {
        tokio::select! {
            _ = shutdown.cancelled() => {
                info!("Shutdown requested, no longer accepting connections");
                break Ok(());
            }
            next = connections.next() => match next {
                Some(Ok(connection)) => {
                    debug!(peer = %connection.peer, "Accepted connection");
                    let bridge = bridge.clone();
                    let cancel = sessions.child_token();
                    tracker.spawn(async move {
                        serve_connection(&bridge, connection, cancel).await;
                    });
                }
                Some(Err(e)) => {
                    error!(error = %e, "Accepting a connection failed");
                    break Err(BridgeError::Other(anyhow::Error::new(e).context("accept failed")));
                }
                None => break Ok(()),
            },
        }
    };

    sessions.cancel();
    tracker.close();
    if !tracker.is_empty() {
        info!(sessions = tracker.len(), "Waiting for sessions to finish");
    }
    tracker.wait().await;

    result
}

/// Run one session over an accepted connection. Errors stay inside the
/// session.
pub async fn serve_connection(bridge: &Bridge, connection: Connection, cancel: CancellationToken) {
    let Connection { stream, peer } = connection;
    let (reader, writer) = stream.into_split();

    // launch failures were already logged by the session
    let _ = bridge.run(reader, writer, &peer.to_string(), cancel).await;
}
