//! Startup checks of the backend's environment. Results are logged only and
//! never stop the bridge from starting.

use std::path::PathBuf;
use std::time::Duration;
use tracing::{info, warn};

pub const DEFAULT_PROBE_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone)]
pub struct ProbeConfig {
    /// Data store the backend reads, e.g. its messages database
    pub messages_db: Option<PathBuf>,
    /// Base URL of the external API; `/health` is appended
    pub api_url: Option<String>,
    pub timeout: Duration,
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self {
            messages_db: None,
            api_url: None,
            timeout: DEFAULT_PROBE_TIMEOUT,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ApiStatus {
    /// The API answered with this HTTP status
    Responded(u16),
    Unreachable(String),
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProbeReport {
    /// `None` when no data store was configured
    pub database_found: Option<bool>,
    /// `None` when no API was configured
    pub api: Option<ApiStatus>,
}

pub async fn probe_environment(config: &ProbeConfig) -> ProbeReport {
    let mut report = ProbeReport::default();

    if let Some(path) = &config.messages_db {
        let found = tokio::fs::try_exists(path).await.unwrap_or(false);
        if found {
            info!(path = %path.display(), "Database found");
        } else {
            warn!(path = %path.display(), "Database file not found");
        }
        report.database_found = Some(found);
    }

    if let Some(api_url) = &config.api_url {
        let status = probe_api(api_url, config.timeout).await;
        match &status {
            ApiStatus::Responded(code) => {
                info!(api = %api_url, status = code, "API connection test")
            }
            ApiStatus::Unreachable(e) => {
                warn!(api = %api_url, error = %e, "API connection failed")
            }
        }
        report.api = Some(status);
    }

    report
}

async fn probe_api(api_url: &str, timeout: Duration) -> ApiStatus {
    // the API is a sibling service, reached directly rather than through a proxy
    let client = match reqwest::Client::builder()
        .timeout(timeout)
        .no_proxy()
        .build()
    {
        Ok(client) => client,
        Err(e) => return ApiStatus::Unreachable(e.to_string()),
    };

    let url = format!("{}/health", api_url.trim_end_matches('/'));
    match client.get(url).send().await {
        Ok(response) => ApiStatus::Responded(response.status().as_u16()),
        Err(e) => ApiStatus::Unreachable(e.to_string()),
    }
}
