use crate::error::BridgeError;
use derive_builder::Builder;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

const MAX_CONNECT_ATTEMPTS: u32 = 10;
const MAX_WAIT_MS: u64 = 60_000;

/// Retry policy for establishing connections to a dispatch backend.
///
/// Only connection setup is retried. A tool call that reached the backend is
/// never replayed.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RetryConfig {
    /// Backoff starts here and doubles per attempt
    #[serde(default = "default_min_delay_ms")]
    pub min_delay_ms: u64,
    /// Cap on a single backoff delay
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    /// Total connection attempts, the first one included
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_jitter")]
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            min_delay_ms: default_min_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            max_attempts: default_max_attempts(),
            jitter: default_jitter(),
        }
    }
}

impl RetryConfig {
    /// For a backend that takes a while to boot: short first delays, many tries.
    pub fn aggressive() -> Self {
        Self {
            min_delay_ms: 50,
            max_delay_ms: 10_000,
            max_attempts: 5,
            jitter: true,
        }
    }

    pub fn conservative() -> Self {
        Self {
            min_delay_ms: 500,
            max_delay_ms: 2_000,
            max_attempts: 2,
            jitter: false,
        }
    }

    pub fn no_retry() -> Self {
        Self {
            min_delay_ms: 0,
            max_delay_ms: 0,
            max_attempts: 1,
            jitter: false,
        }
    }

    pub fn validate(&self) -> Result<(), BridgeError> {
        let problem = if self.min_delay_ms > self.max_delay_ms {
            "retry min_delay_ms is above max_delay_ms"
        } else if !(1..=MAX_CONNECT_ATTEMPTS).contains(&self.max_attempts) {
            "retry max_attempts must be between 1 and 10"
        } else if self.max_delay_ms > MAX_WAIT_MS {
            "retry max_delay_ms is above 60 seconds"
        } else {
            return Ok(());
        };
        Err(BridgeError::Configuration(problem.to_string()))
    }

    pub fn min_delay(&self) -> Duration {
        Duration::from_millis(self.min_delay_ms)
    }

    pub fn max_delay(&self) -> Duration {
        Duration::from_millis(self.max_delay_ms)
    }

    pub fn retries_enabled(&self) -> bool {
        self.max_attempts > 1
    }
}

/// Describes the backend process a bridge spawns and how sessions treat it.
#[derive(Debug, Clone, PartialEq, Builder, Serialize, Deserialize)]
#[builder(setter(into, strip_option))]
#[serde(rename_all = "camelCase")]
pub struct BridgeConfig {
    /// Service name reported by the health endpoint and used in logs
    pub name: String,
    #[builder(default = "default_version()")]
    #[serde(default = "default_version")]
    pub version: String,
    /// Executable of the backend, e.g. an interpreter
    pub command: String,
    #[builder(default)]
    #[builder(setter(custom))]
    #[serde(default)]
    pub args: Vec<String>,
    #[builder(default)]
    #[builder(setter(custom))]
    #[serde(default)]
    pub env: HashMap<String, String>,
    /// Directory the backend is started in, normally its installation root
    #[builder(default)]
    #[serde(default)]
    pub working_directory: Option<PathBuf>,
    /// How long a backend gets between SIGTERM and SIGKILL
    #[builder(default = "default_grace_period_ms()")]
    #[serde(default = "default_grace_period_ms")]
    pub grace_period_ms: u64,
    /// Size of the chunk buffer used by each relay direction
    #[builder(default = "default_buffer_size()")]
    #[serde(default = "default_buffer_size")]
    pub buffer_size: usize,
    #[builder(default)]
    #[serde(default)]
    pub retry_config: RetryConfig,
    /// Tools whose result is always a list, for backends that do not
    /// advertise an output schema
    #[builder(default)]
    #[builder(setter(custom))]
    #[serde(default)]
    pub sequence_tools: Vec<String>,
}

impl BridgeConfig {
    pub fn builder() -> BridgeConfigBuilder {
        BridgeConfigBuilder::default()
    }

    pub fn grace_period(&self) -> Duration {
        Duration::from_millis(self.grace_period_ms)
    }

    pub fn working_directory(&self) -> Option<&Path> {
        self.working_directory.as_deref()
    }

    pub fn validate(&self) -> Result<(), BridgeError> {
        if self.command.trim().is_empty() {
            return Err(BridgeError::Configuration(
                "backend command must not be empty".to_string(),
            ));
        }

        if self.buffer_size == 0 {
            return Err(BridgeError::Configuration(
                "buffer_size must be greater than zero".to_string(),
            ));
        }

        if self.grace_period_ms > MAX_WAIT_MS {
            return Err(BridgeError::Configuration(
                "grace_period_ms is above 60 seconds".to_string(),
            ));
        }

        self.retry_config.validate()
    }
}

impl BridgeConfigBuilder {
    pub fn args<S: ToString, I: IntoIterator<Item = S>>(&mut self, iter: I) -> &mut Self {
        let args: Vec<String> = iter.into_iter().map(|s| s.to_string()).collect();
        self.args = Some(args);
        self
    }

    pub fn env<T: ToString>(&mut self, key: T, value: T) -> &mut Self {
        let map = self.env.get_or_insert_with(HashMap::new);
        map.insert(key.to_string(), value.to_string());
        self
    }

    pub fn env_multi<T: ToString, I: IntoIterator<Item = (T, T)>>(&mut self, iter: I) -> &mut Self {
        let env = self.env.get_or_insert_with(HashMap::new);
        for (key, value) in iter {
            env.insert(key.to_string(), value.to_string());
        }
        self
    }

    pub fn sequence_tools<S: ToString, I: IntoIterator<Item = S>>(&mut self, iter: I) -> &mut Self {
        self.sequence_tools = Some(iter.into_iter().map(|s| s.to_string()).collect());
        self
    }
}

fn default_version() -> String {
    env!("CARGO_PKG_VERSION").to_string()
}
fn default_grace_period_ms() -> u64 {
    5_000
}
fn default_buffer_size() -> usize {
    8 * 1024
}
fn default_min_delay_ms() -> u64 {
    100
}
fn default_max_delay_ms() -> u64 {
    5_000
}
fn default_max_attempts() -> u32 {
    3
}
fn default_jitter() -> bool {
    true
}
