use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use mcp_bridge::probe::{self, ProbeConfig};
use mcp_bridge::{
    BackendLauncher, Bridge, BridgeConfig, McpToolDispatcher, ToolDispatcher, http, logging,
    stdio, tcp,
};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::signal::unix::{SignalKind, signal};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

#[derive(Parser, Debug)]
#[command(name = "mcp-bridge", version, about = "Expose a stdio MCP server over TCP or HTTP")]
struct Cli {
    #[command(flatten)]
    backend: BackendArgs,

    /// Messages database checked at startup
    #[arg(long, env = "MESSAGES_DB_PATH", global = true)]
    messages_db: Option<PathBuf>,

    /// Base URL of the messaging API checked at startup
    #[arg(long, env = "WHATSAPP_API_URL", global = true)]
    api_url: Option<String>,

    /// Emit logs as JSON lines
    #[arg(long, env = "MCP_BRIDGE_LOG_JSON", global = true)]
    log_json: bool,

    #[command(subcommand)]
    mode: Option<Mode>,
}

#[derive(Args, Debug)]
struct BackendArgs {
    /// Backend executable
    #[arg(long, env = "MCP_BACKEND_COMMAND", default_value = "python", global = true)]
    command: String,

    /// Backend argument, repeat for several
    #[arg(
        long = "arg",
        default_values_t = ["/app/main.py".to_string()],
        allow_hyphen_values = true,
        global = true
    )]
    args: Vec<String>,

    /// Directory the backend runs in
    #[arg(long, env = "MCP_BACKEND_DIR", default_value = "/app", global = true)]
    working_dir: PathBuf,

    /// Time between SIGTERM and SIGKILL when stopping a backend
    #[arg(long, default_value_t = 5_000, global = true)]
    grace_period_ms: u64,

    /// Relay chunk size in bytes
    #[arg(long, default_value_t = 8 * 1024, global = true)]
    buffer_size: usize,

    /// Tool whose HTTP result is always a JSON array, repeat for several.
    /// Only consulted when the backend advertises no output schema for it.
    #[arg(
        long = "sequence-tool",
        default_values_t = [
            "list_chats".to_string(),
            "list_messages".to_string(),
            "search_contacts".to_string(),
        ],
        global = true
    )]
    sequence_tools: Vec<String>,

    /// Name reported by the health endpoint
    #[arg(
        long,
        env = "MCP_BRIDGE_SERVICE_NAME",
        default_value = "whatsapp-mcp-bridge",
        global = true
    )]
    service_name: String,
}

#[derive(Subcommand, Debug)]
enum Mode {
    /// One backend per TCP connection, bytes relayed verbatim (default)
    Tcp {
        #[arg(long, env = "MCP_BRIDGE_HOST", default_value = "0.0.0.0")]
        host: String,
        #[arg(long, env = "MCP_BRIDGE_PORT", default_value_t = 9000)]
        port: u16,
    },
    /// Relay this process's stdin and stdout to one backend
    Stdio,
    /// JSON tool calls over HTTP against a shared backend
    Http {
        #[arg(long, env = "MCP_BRIDGE_HOST", default_value = "0.0.0.0")]
        host: String,
        #[arg(long, env = "MCP_BRIDGE_HTTP_PORT", default_value_t = 8090)]
        port: u16,
    },
}

impl BackendArgs {
    fn to_config(&self) -> Result<BridgeConfig> {
        let config = BridgeConfig::builder()
            .name(self.service_name.as_str())
            .command(self.command.as_str())
            .args(&self.args)
            .working_directory(self.working_dir.clone())
            .grace_period_ms(self.grace_period_ms)
            .buffer_size(self.buffer_size)
            .sequence_tools(&self.sequence_tools)
            .build()
            .context("incomplete backend configuration")?;
        config.validate()?;
        Ok(config)
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    logging::init_tracing(cli.log_json)?;

    let config = cli.backend.to_config()?;
    info!(
        command = %config.command,
        args = ?config.args,
        "Starting {} {}",
        config.name,
        config.version
    );

    probe::probe_environment(&ProbeConfig {
        messages_db: cli.messages_db.clone(),
        api_url: cli.api_url.clone(),
        ..Default::default()
    })
    .await;

    let shutdown = CancellationToken::new();
    tokio::spawn(watch_signals(shutdown.clone()));

    let mode = cli.mode.unwrap_or(Mode::Tcp {
        host: "0.0.0.0".to_string(),
        port: 9000,
    });

    match mode {
        Mode::Tcp { host, port } => {
            let listener = tcp::listen(&host, port).await?;
            let bridge = Bridge::new(BackendLauncher::new(config));
            let served = tcp::serve(listener, bridge.clone(), shutdown).await;
            bridge.launcher().cleanup().await?;
            served.context("stream listener stopped")?;
        }
        Mode::Stdio => {
            let bridge = Bridge::new(BackendLauncher::new(config));
            let code = match stdio::serve(&bridge, shutdown).await {
                Ok(outcome) if outcome.is_clean() => 0,
                Ok(outcome) => {
                    warn!(end = ?outcome.end, "Stdio session ended with an error");
                    1
                }
                Err(e) => {
                    error!(error = %e, "Stdio session failed");
                    1
                }
            };
            // the blocking stdin reader would keep the runtime from shutting down
            std::process::exit(code);
        }
        Mode::Http { host, port } => {
            let dispatcher = Arc::new(McpToolDispatcher::new(config.clone()));
            if let Err(e) = dispatcher.connect().await {
                warn!(error = %e, "Dispatch backend not ready, connecting on first request");
            }

            let tools: Arc<dyn ToolDispatcher> = dispatcher.clone();
            let router = http::router(&config.name, tools);
            let listener = tokio::net::TcpListener::bind((host.as_str(), port))
                .await
                .with_context(|| format!("cannot bind {host}:{port}"))?;
            let served = http::serve(listener, router, shutdown).await;
            dispatcher.close().await;
            served.context("HTTP listener stopped")?;
        }
    }

    info!("Bridge stopped");
    Ok(())
}

/// Cancel `shutdown` on Ctrl-C or SIGTERM.
async fn watch_signals(shutdown: CancellationToken) {
    let terminate = async {
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Cannot listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "Cannot listen for Ctrl-C");
            std::future::pending::<()>().await;
        }
    };

    tokio::select! {
        _ = ctrl_c => info!("Received Ctrl-C, shutting down"),
        _ = terminate => info!("Received SIGTERM, shutting down"),
    }

    shutdown.cancel();
}
