//! The bridge's own stdin and stdout as the single client connection.

use crate::session::Bridge;
use mcp_bridge_core::{BridgeError, RelayOutcome};
use tokio_util::sync::CancellationToken;

/// Relay between this process's stdio and one backend until either side
/// closes or `shutdown` fires.
///
/// Reading stdin occupies a blocking thread that cannot be interrupted, so a
/// binary should exit the process once this returns rather than wait for the
/// runtime to wind down.
pub async fn serve(bridge: &Bridge, shutdown: CancellationToken) -> Result<RelayOutcome, BridgeError> {
    bridge
        .run(tokio::io::stdin(), tokio::io::stdout(), "stdio", shutdown)
        .await
}
