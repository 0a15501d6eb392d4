use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::{collections::HashMap, fs::File, io::BufReader, path::Path, time::Duration};

use crate::{Error, SaitenResult};

/// Runtime configuration for the evaluation orchestrator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvaluationConfig {
    /// Upper bound on how long one frontier level waits for its callbacks.
    /// A dropped provider request must not stall the file forever.
    #[serde(default = "default_level_timeout", with = "duration_ms")]
    pub level_timeout: Duration,

    #[serde(default)]
    pub retry: RetryConfig,

    /// Buffer size of the per-run callback channel.
    #[serde(default = "default_callback_capacity")]
    pub callback_capacity: usize,

    #[serde(default)]
    pub provider: ProviderEndpointConfig,
}

impl Default for EvaluationConfig {
    fn default() -> Self {
        Self {
            level_timeout: default_level_timeout(),
            retry: RetryConfig::default(),
            callback_capacity: default_callback_capacity(),
            provider: ProviderEndpointConfig::default(),
        }
    }
}

impl EvaluationConfig {
    pub fn from_file(path: impl AsRef<Path>) -> SaitenResult<Self> {
        from_file(path)
    }
}

/// Retry budget for infrastructure steps (catalog reads, store upserts).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    #[serde(default = "default_initial_backoff", with = "duration_ms")]
    pub initial_backoff: Duration,

    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: u32,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            initial_backoff: default_initial_backoff(),
            backoff_multiplier: default_backoff_multiplier(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderEndpointConfig {
    #[serde(default = "default_base_url")]
    pub base_url: String,

    /// Where the provider posts per-item completion callbacks. The run id is
    /// appended as a query parameter at dispatch time.
    #[serde(default = "default_callback_url")]
    pub callback_url: String,

    /// Provider-side resource the batch is routed against.
    #[serde(default = "default_resource")]
    pub resource: String,
}

impl Default for ProviderEndpointConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            callback_url: default_callback_url(),
            resource: default_resource(),
        }
    }
}

/// Provider credentials, loaded separately from the main config file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SecretConfig {
    #[serde(default)]
    pub api_key: String,

    #[serde(default)]
    pub additional_auth: HashMap<String, String>,
}

pub fn from_file<T: DeserializeOwned>(path: impl AsRef<Path>) -> SaitenResult<T> {
    let file = File::open(path.as_ref())
        .map_err(|e| Error::Config(format!("{}: {}", path.as_ref().display(), e)))?;
    let reader = BufReader::new(file);
    serde_json::from_reader(reader)
        .map_err(|e| Error::Config(format!("{}: {}", path.as_ref().display(), e)))
}

fn default_level_timeout() -> Duration {
    Duration::from_secs(300)
}

fn default_callback_capacity() -> usize {
    64
}

fn default_max_attempts() -> u32 {
    3
}

fn default_initial_backoff() -> Duration {
    Duration::from_millis(500)
}

fn default_backoff_multiplier() -> u32 {
    2
}

fn default_base_url() -> String {
    "http://localhost:9100".to_string()
}

fn default_callback_url() -> String {
    "http://localhost:8080/callbacks/evaluation".to_string()
}

fn default_resource() -> String {
    "default".to_string()
}

mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(duration.as_millis() as u64)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}
