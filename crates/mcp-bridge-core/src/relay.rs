//! Opaque byte relay between a client transport and a backend's stdio.
//!
//! Two pumps run concurrently, one per direction. Each reads a bounded chunk,
//! writes it verbatim and flushes before reading again, so a slow reader on
//! either side throttles its producer instead of growing a buffer. The relay
//! completes as soon as either pump ends; the other pump is dropped with it.

use std::fmt;
use std::io;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

pub const DEFAULT_BUFFER_SIZE: usize = 8 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    ClientToBackend,
    BackendToClient,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::ClientToBackend => f.write_str("client->backend"),
            Direction::BackendToClient => f.write_str("backend->client"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamOperation {
    Read,
    Write,
}

impl fmt::Display for StreamOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StreamOperation::Read => f.write_str("read"),
            StreamOperation::Write => f.write_str("write"),
        }
    }
}

/// A read or write failure in one relay direction.
#[derive(Debug, thiserror::Error)]
#[error("{operation} failed on {direction}: {source}")]
pub struct StreamError {
    pub direction: Direction,
    pub operation: StreamOperation,
    #[source]
    pub source: io::Error,
}

impl StreamError {
    fn read(direction: Direction, source: io::Error) -> Self {
        Self {
            direction,
            operation: StreamOperation::Read,
            source,
        }
    }

    fn write(direction: Direction, source: io::Error) -> Self {
        Self {
            direction,
            operation: StreamOperation::Write,
            source,
        }
    }
}

/// Why a relay session stopped.
#[derive(Debug)]
pub enum RelayEnd {
    /// The client reached end-of-stream
    ClientClosed,
    /// The backend's output reached end-of-stream
    BackendClosed,
    /// A read or write failed in one direction
    Failed(StreamError),
    /// The session was cancelled from outside
    Cancelled,
}

#[derive(Debug)]
pub struct RelayOutcome {
    pub end: RelayEnd,
    /// Bytes delivered to the backend's input
    pub to_backend: u64,
    /// Bytes delivered to the client
    pub to_client: u64,
}

impl RelayOutcome {
    /// True when the session ended by end-of-stream rather than by an error.
    pub fn is_clean(&self) -> bool {
        !matches!(self.end, RelayEnd::Failed(_))
    }

    pub fn into_result(self) -> Result<Self, StreamError> {
        match self.end {
            RelayEnd::Failed(e) => Err(e),
            _ => Ok(self),
        }
    }
}

/// Relay bytes between a client and a backend until either side ends.
///
/// All four streams are consumed. When the relay returns they are dropped,
/// which closes the backend's stdin pipe and the client's write half.
pub async fn relay<CI, CO, BI, BO>(
    client_in: CI,
    client_out: CO,
    backend_in: BI,
    backend_out: BO,
    buffer_size: usize,
    cancel: &CancellationToken,
) -> RelayOutcome
where
    CI: AsyncRead + Unpin,
    CO: AsyncWrite + Unpin,
    BI: AsyncWrite + Unpin,
    BO: AsyncRead + Unpin,
{
    let (mut client_in, mut client_out) = (client_in, client_out);
    let (mut backend_in, mut backend_out) = (backend_in, backend_out);
    let buffer_size = buffer_size.max(1);
    let mut to_backend = 0u64;
    let mut to_client = 0u64;

    let end = {
        let inbound = pump(
            &mut client_in,
            &mut backend_in,
            Direction::ClientToBackend,
            buffer_size,
            &mut to_backend,
        );
        let outbound = pump(
            &mut backend_out,
            &mut client_out,
            Direction::BackendToClient,
            buffer_size,
            &mut to_client,
        );

        tokio::select! {
            result = inbound => match result {
                Ok(()) => RelayEnd::ClientClosed,
                Err(e) => RelayEnd::Failed(e),
            },
            result = outbound => match result {
                Ok(()) => RelayEnd::BackendClosed,
                Err(e) => RelayEnd::Failed(e),
            },
            _ = cancel.cancelled() => RelayEnd::Cancelled,
        }
    };

    match &end {
        RelayEnd::Failed(e) => warn!(error = %e, "Relay ended with stream error"),
        other => debug!(end = ?other, to_backend, to_client, "Relay finished"),
    }

    RelayOutcome {
        end,
        to_backend,
        to_client,
    }
}

/// Copy chunks from `reader` to `writer` until end-of-stream.
///
/// Every chunk is flushed before the next read. End-of-stream is propagated
/// with `shutdown` so the destination sees its input close.
pub async fn pump<R, W>(
    reader: &mut R,
    writer: &mut W,
    direction: Direction,
    buffer_size: usize,
    relayed: &mut u64,
) -> Result<(), StreamError>
where
    R: AsyncRead + Unpin + ?Sized,
    W: AsyncWrite + Unpin + ?Sized,
{
    let mut buf = vec![0u8; buffer_size.max(1)];

    loop {
        let n = reader
            .read(&mut buf)
            .await
            .map_err(|e| StreamError::read(direction, e))?;

        if n == 0 {
            if let Err(e) = writer.shutdown().await {
                debug!(%direction, error = %e, "Shutdown after end-of-stream failed");
            }
            return Ok(());
        }

        writer
            .write_all(&buf[..n])
            .await
            .map_err(|e| StreamError::write(direction, e))?;
        writer
            .flush()
            .await
            .map_err(|e| StreamError::write(direction, e))?;

        *relayed += n as u64;
        trace!(%direction, bytes = n, "Relayed chunk");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::pin::Pin;
    use std::task::{Context, Poll};
    use tokio::io::{AsyncReadExt, AsyncWriteExt, duplex};

    /// Writer that rejects every write, like a socket whose peer went away.
    struct BrokenPipe;

    impl AsyncWrite for BrokenPipe {
        fn poll_write(
            self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
            _buf: &[u8],
        ) -> Poll<io::Result<usize>> {
            Poll::Ready(Err(io::Error::new(io::ErrorKind::BrokenPipe, "peer gone")))
        }

        fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
            Poll::Ready(Ok(()))
        }

        fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
            Poll::Ready(Ok(()))
        }
    }

    #[tokio::test]
    async fn test_pump_forwards_bytes_in_order() {
        let payload: Vec<u8> = (0..50_000u32).map(|i| (i % 251) as u8).collect();
        let mut reader = &payload[..];
        let mut sink = Vec::new();
        let mut relayed = 0;

        pump(&mut reader, &mut sink, Direction::ClientToBackend, 1024, &mut relayed)
            .await
            .unwrap();

        assert_eq!(sink, payload);
        assert_eq!(relayed, payload.len() as u64);
    }

    #[tokio::test]
    async fn test_pump_reports_write_failure() {
        let mut reader = &b"{\"jsonrpc\":\"2.0\"}\n"[..];
        let mut relayed = 0;

        let err = pump(
            &mut reader,
            &mut BrokenPipe,
            Direction::BackendToClient,
            64,
            &mut relayed,
        )
        .await
        .unwrap_err();

        assert_eq!(err.direction, Direction::BackendToClient);
        assert_eq!(err.operation, StreamOperation::Write);
        assert_eq!(relayed, 0);
    }

    #[tokio::test]
    async fn test_partial_line_is_forwarded_without_waiting_for_newline() {
        let (client, mut client_peer) = duplex(64);
        let (backend, mut backend_peer) = duplex(64);
        let (client_in, client_out) = tokio::io::split(client);
        let (backend_out, backend_in) = tokio::io::split(backend);
        let cancel = CancellationToken::new();

        let relay_task = tokio::spawn(async move {
            relay(client_in, client_out, backend_in, backend_out, 16, &cancel).await
        });

        client_peer.write_all(b"{\"id\":1,").await.unwrap();
        let mut buf = [0u8; 8];
        backend_peer.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"{\"id\":1,");

        drop(client_peer);
        let outcome = relay_task.await.unwrap();
        assert!(matches!(outcome.end, RelayEnd::ClientClosed));
        assert_eq!(outcome.to_backend, 8);
    }

    #[tokio::test]
    async fn test_backend_eof_ends_relay_after_delivering_output() {
        let (client, mut client_peer) = duplex(1024);
        let (backend, mut backend_peer) = duplex(1024);
        let (client_in, client_out) = tokio::io::split(client);
        let (backend_out, backend_in) = tokio::io::split(backend);
        let cancel = CancellationToken::new();

        let relay_task = tokio::spawn(async move {
            relay(client_in, client_out, backend_in, backend_out, 8, &cancel).await
        });

        backend_peer
            .write_all(b"{\"jsonrpc\":\"2.0\",\"id\":1,\"result\":{}}\n")
            .await
            .unwrap();
        backend_peer.shutdown().await.unwrap();

        let outcome = relay_task.await.unwrap();
        assert!(matches!(outcome.end, RelayEnd::BackendClosed));

        let mut received = Vec::new();
        client_peer.read_to_end(&mut received).await.unwrap();
        assert_eq!(received, b"{\"jsonrpc\":\"2.0\",\"id\":1,\"result\":{}}\n");
        assert_eq!(outcome.to_client, received.len() as u64);
    }

    #[tokio::test]
    async fn test_cancellation_stops_idle_relay() {
        let (client, _client_peer) = duplex(64);
        let (backend, _backend_peer) = duplex(64);
        let (client_in, client_out) = tokio::io::split(client);
        let (backend_out, backend_in) = tokio::io::split(backend);
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();

        let relay_task = tokio::spawn(async move {
            relay(client_in, client_out, backend_in, backend_out, 64, &cancel).await
        });

        trigger.cancel();
        let outcome = tokio::time::timeout(std::time::Duration::from_secs(2), relay_task)
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(outcome.end, RelayEnd::Cancelled));
        assert!(outcome.is_clean());
    }

    #[tokio::test]
    async fn test_write_failure_ends_relay() {
        let (client, mut client_peer) = duplex(64);
        let (client_in, client_out) = tokio::io::split(client);
        // backend stays silent so only the failed write can end the relay
        let (backend_out, _backend_peer) = duplex(64);
        let cancel = CancellationToken::new();

        client_peer.write_all(b"payload").await.unwrap();

        let outcome = relay(client_in, client_out, BrokenPipe, backend_out, 64, &cancel).await;

        match outcome.end {
            RelayEnd::Failed(ref e) => {
                assert_eq!(e.direction, Direction::ClientToBackend);
                assert_eq!(e.operation, StreamOperation::Write);
            }
            ref other => panic!("unexpected end: {other:?}"),
        }
        assert!(!outcome.is_clean());
        assert!(outcome.into_result().is_err());
    }
}
