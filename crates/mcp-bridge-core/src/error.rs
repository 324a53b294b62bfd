use crate::process::ProcessError;
use crate::relay::StreamError;
use thiserror::Error;

/// Errors raised by a tool-dispatch collaborator.
#[derive(Error, Debug)]
pub enum DispatchError {
    #[error("Unknown tool: {0}")]
    UnknownTool(String),

    #[error("Dispatch backend unavailable: {0}")]
    Unavailable(String),

    #[error("{0}")]
    Failed(String),
}

/// Error taxonomy shared by every bridge variant.
///
/// Errors that belong to one connection never escape that connection's
/// session; only listener-level failures such as a broken `accept` are
/// returned to the caller of a listener.
#[derive(Error, Debug)]
pub enum BridgeError {
    #[error("Failed to launch backend: {0}")]
    Launch(#[from] ProcessError),

    #[error("Stream error: {0}")]
    Stream(#[from] StreamError),

    #[error("Malformed request body: {0}")]
    ProtocolDecode(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error(transparent)]
    Dispatch(#[from] DispatchError),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Timeout occurred: {0}")]
    Timeout(String),

    #[error("Other error: {0}")]
    Other(#[from] anyhow::Error),
}

impl BridgeError {
    /// Whether establishing a connection again may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            BridgeError::Launch(_)
                | BridgeError::Timeout(_)
                | BridgeError::Dispatch(DispatchError::Unavailable(_))
        )
    }

    /// Errors caused by the caller's input rather than by the bridge.
    pub fn is_client_error(&self) -> bool {
        matches!(self, BridgeError::InvalidRequest(_))
    }
}

impl From<serde_json::Error> for BridgeError {
    fn from(e: serde_json::Error) -> Self {
        BridgeError::ProtocolDecode(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let error = BridgeError::Launch(ProcessError::SpawnFailed("python: not found".into()));
        assert!(format!("{error}").contains("Failed to launch backend"));

        let error = BridgeError::from(DispatchError::UnknownTool("frobnicate".into()));
        assert_eq!(format!("{error}"), "Unknown tool: frobnicate");
    }

    #[test]
    fn test_error_categorization() {
        assert!(BridgeError::Timeout("init".into()).is_retryable());
        assert!(BridgeError::from(DispatchError::Unavailable("gone".into())).is_retryable());

        assert!(!BridgeError::from(DispatchError::Failed("boom".into())).is_retryable());
        assert!(!BridgeError::Configuration("bad".into()).is_retryable());
        assert!(!BridgeError::ProtocolDecode("eof".into()).is_retryable());

        assert!(BridgeError::InvalidRequest("Command is required".into()).is_client_error());
        assert!(!BridgeError::ProtocolDecode("eof".into()).is_client_error());
    }

    #[test]
    fn test_json_errors_are_decode_errors() {
        let parse = serde_json::from_str::<serde_json::Value>("{not json").unwrap_err();
        let error = BridgeError::from(parse);
        assert!(matches!(error, BridgeError::ProtocolDecode(_)));
    }
}
