use tracing_subscriber::EnvFilter;

/// Used when `RUST_LOG` is unset. `backend` carries the backends' stderr.
pub const DEFAULT_FILTER: &str = "mcp_bridge=info,backend=info";

/// Install the global subscriber. Output always goes to stderr because stdout
/// carries protocol bytes in stdio mode.
pub fn init_tracing(json: bool) -> anyhow::Result<()> {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr);

    let installed = if json {
        builder.json().try_init()
    } else {
        builder.try_init()
    };

    installed.map_err(|e| anyhow::anyhow!("failed to install tracing subscriber: {e}"))
}
