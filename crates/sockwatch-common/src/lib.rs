use serde::Deserialize;
use std::fs;
use std::path::Path;
use std::time::Duration;

/// Top-level harness configuration.
///
/// Every section falls back to its compiled-in defaults, so an empty (or
/// absent) YAML document yields the stock experiment.
#[derive(Debug, Deserialize, Clone, Default, PartialEq)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub client: ClientConfig,
    pub census: CensusConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse config: {0}")]
    Parse(#[from] serde_yaml::Error),
}

impl Config {
    pub fn from_yaml_str(data: &str) -> Result<Self, ConfigError> {
        if data.trim().is_empty() {
            return Ok(Self::default());
        }
        Ok(serde_yaml::from_str(data)?)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let data = fs::read_to_string(path)?;
        Self::from_yaml_str(&data)
    }
}

#[derive(Debug, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct ServerConfig {
    pub listen_address: String,
    /// Simulated processing time applied to every request.
    pub delay_ms: u64,
    /// Advertised in the `Keep-Alive: timeout=..` response header.
    pub keep_alive_timeout_secs: u64,
    /// Advertised in the `Keep-Alive: max=..` response header.
    pub keep_alive_max: u32,
    pub census_interval_secs: u64,
    /// Release the in-flight slot when a client disconnects during the delay.
    /// When false, aborted requests are never subtracted and the counter
    /// drifts upwards.
    pub release_on_abort: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_address: "0.0.0.0:8080".to_string(),
            delay_ms: 20_000,
            keep_alive_timeout_secs: 120,
            keep_alive_max: 100,
            census_interval_secs: 5,
            release_on_abort: true,
        }
    }
}

impl ServerConfig {
    pub fn delay(&self) -> Duration {
        Duration::from_millis(self.delay_ms)
    }

    pub fn census_interval(&self) -> Duration {
        Duration::from_secs(self.census_interval_secs)
    }
}

#[derive(Debug, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct ClientConfig {
    pub target_url: String,
    pub interval_secs: u64,
    /// Pause between two body reads while a response is being drained.
    pub read_pause_ms: u64,
    pub chunk_size: usize,
    pub extra_probability: f64,
    /// Upper bound (exclusive) of the random delay before an "Extra" request.
    pub extra_max_delay_secs: u64,
    /// Optional admission limit for concurrently running requests.
    /// Unset keeps the fan-out unbounded.
    pub max_in_flight: Option<usize>,
    /// Drop every idle connection of the shared pool once a drain ends.
    pub close_idle_on_stream_end: bool,
    pub pooled_transport: TransportConfig,
    pub leaky_transport: TransportConfig,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            target_url: "http://localhost:8080".to_string(),
            interval_secs: 20,
            read_pause_ms: 5_000,
            chunk_size: 1024,
            extra_probability: 0.5,
            extra_max_delay_secs: 20,
            max_in_flight: None,
            close_idle_on_stream_end: true,
            pooled_transport: TransportConfig::pooled(),
            leaky_transport: TransportConfig::leaky(),
        }
    }
}

impl ClientConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    pub fn read_pause(&self) -> Duration {
        Duration::from_millis(self.read_pause_ms)
    }
}

/// Connection-reuse knobs of one client transport.
#[derive(Debug, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct TransportConfig {
    pub keep_alive: bool,
    /// 0 means no limit on the total number of idle connections.
    pub max_idle_total: usize,
    pub max_idle_per_host: usize,
    /// 0 means idle connections never expire.
    pub idle_timeout_secs: u64,
    pub request_timeout_secs: u64,
}

impl TransportConfig {
    /// The bounded, shared transport of the fixed client.
    pub fn pooled() -> Self {
        Self {
            keep_alive: true,
            max_idle_total: 5,
            max_idle_per_host: 2,
            idle_timeout_secs: 30,
            request_timeout_secs: 30,
        }
    }

    /// A stock transport with no idle expiry, created afresh per request.
    pub fn leaky() -> Self {
        Self {
            keep_alive: true,
            max_idle_total: 0,
            max_idle_per_host: 2,
            idle_timeout_secs: 0,
            request_timeout_secs: 30,
        }
    }
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self::pooled()
    }
}

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum CensusBackend {
    /// Parse `/proc/net/tcp` and `/proc/net/tcp6`.
    Procfs,
    /// Shell out to `netstat -tn`.
    Netstat,
}

#[derive(Debug, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct CensusConfig {
    pub backend: CensusBackend,
    /// Port to count sockets on. Unset follows the role: the server's listen
    /// port, or the client's target port.
    pub port: Option<u16>,
}

impl Default for CensusConfig {
    fn default() -> Self {
        Self {
            backend: CensusBackend::Procfs,
            port: None,
        }
    }
}

#[derive(Debug, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct LoggingConfig {
    /// Structured JSON output; plain text when false.
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self { json: true }
    }
}
