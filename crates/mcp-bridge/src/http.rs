//! Transactional listener: one JSON tool call per HTTP request.

use crate::dispatch::ToolDispatcher;
use axum::body::Bytes;
use axum::extract::State;
use axum::http::{HeaderValue, StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use mcp_bridge_core::{BridgeError, DispatchError};
use serde::Serialize;
use serde_json::{Map, Value, json};
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::set_header::SetResponseHeaderLayer;
use tracing::{error, info, warn};

#[derive(Clone)]
struct HttpState {
    service_name: Arc<str>,
    dispatcher: Arc<dyn ToolDispatcher>,
}

#[derive(Serialize)]
struct Health {
    status: &'static str,
    service: String,
}

/// Error returned to HTTP callers as `{"error": "<message>"}`.
pub struct ApiError(BridgeError);

impl From<BridgeError> for ApiError {
    fn from(e: BridgeError) -> Self {
        ApiError(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = if self.0.is_client_error() {
            StatusCode::BAD_REQUEST
        } else {
            StatusCode::INTERNAL_SERVER_ERROR
        };
        let message = match &self.0 {
            BridgeError::InvalidRequest(message) => message.clone(),
            other => other.to_string(),
        };
        (status, Json(json!({ "error": message }))).into_response()
    }
}

/// Build the router: `GET /health`, `POST /` and a 404 for everything else.
/// Every response allows any origin.
pub fn router(service_name: &str, dispatcher: Arc<dyn ToolDispatcher>) -> Router {
    let state = HttpState {
        service_name: Arc::from(service_name),
        dispatcher,
    };

    Router::new()
        .route("/health", get(health))
        .route("/", post(call_tool))
        .fallback(not_found)
        .layer(SetResponseHeaderLayer::overriding(
            header::ACCESS_CONTROL_ALLOW_ORIGIN,
            HeaderValue::from_static("*"),
        ))
        .with_state(state)
}

/// Serve `router` until `shutdown` fires, letting in-flight requests finish.
pub async fn serve(
    listener: TcpListener,
    router: Router,
    shutdown: CancellationToken,
) -> Result<(), BridgeError> {
    if let Ok(addr) = listener.local_addr() {
        info!(%addr, "HTTP bridge listening");
    }

    axum::serve(listener, router)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
        .map_err(|e| BridgeError::Other(anyhow::Error::new(e).context("HTTP server failed")))
}

async fn health(State(state): State<HttpState>) -> Json<Health> {
    Json(Health {
        status: "healthy",
        service: state.service_name.to_string(),
    })
}

async fn not_found() -> StatusCode {
    StatusCode::NOT_FOUND
}

/// Pull `command` and `arguments` out of a request body.
fn parse_call(body: &[u8]) -> Result<(String, Map<String, Value>), BridgeError> {
    let request: Value = serde_json::from_slice(body)?;

    let command = match request.get("command") {
        Some(Value::String(command)) if !command.is_empty() => command.clone(),
        _ => return Err(BridgeError::InvalidRequest("Command is required".to_string())),
    };

    let arguments = match request.get("arguments") {
        None | Some(Value::Null) => Map::new(),
        Some(Value::Object(arguments)) => arguments.clone(),
        Some(_) => {
            return Err(BridgeError::InvalidRequest(
                "arguments must be an object".to_string(),
            ));
        }
    };

    Ok((command, arguments))
}

async fn call_tool(State(state): State<HttpState>, body: Bytes) -> Result<Json<Value>, ApiError> {
    let (command, arguments) = parse_call(&body).inspect_err(|e| {
        warn!(error = %e, "Rejected tool request");
    })?;

    match state.dispatcher.call(&command, arguments).await {
        Ok(result) => Ok(Json(result)),
        // unknown tools are answered with 200 and an error object
        Err(DispatchError::UnknownTool(tool)) => {
            warn!(tool = %tool, "Unknown tool requested");
            Ok(Json(json!({ "error": format!("Unknown tool: {tool}") })))
        }
        Err(e) => {
            error!(tool = %command, error = %e, "Tool call failed");
            Err(BridgeError::from(e).into())
        }
    }
}
