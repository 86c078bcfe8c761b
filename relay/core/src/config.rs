//! Relay Configuration
//!
//! Configuration is layered, later layers winning:
//!
//! 1. Built-in defaults
//! 2. Optional TOML file (`--config relay.toml`)
//! 3. Environment variables (`RELAY_*`)
//! 4. Command-line overrides ([`ConfigOverrides`])
//!
//! # Example
//!
//! ```toml
//! [server]
//! host = "127.0.0.1"
//! port = 9600
//!
//! [engine]
//! command = "./chat"
//! args = ["-m", "gpt4all-lora-quantized.bin"]
//!
//! [generation]
//! temp = 0.1
//! n_predict = 128
//!
//! [streaming]
//! initial_timeout_ms = 15000
//! idle_timeout_ms = 1000
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors loading configuration
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The file could not be read
    #[error("failed to read config file {path}: {source}")]
    Read {
        /// File that was requested
        path: PathBuf,
        /// Underlying error
        source: std::io::Error,
    },
    /// The file is not valid TOML for [`RelayConfig`]
    #[error("failed to parse config file {path}: {source}")]
    Parse {
        /// File that was requested
        path: PathBuf,
        /// Underlying error
        source: toml::de::Error,
    },
}

/// Where the configuration was loaded from
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ConfigSource {
    /// Built-in defaults only
    Defaults,
    /// A TOML file
    File(PathBuf),
}

/// Complete relay configuration
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    /// HTTP listener
    pub server: ServerConfig,
    /// Generation engine process
    pub engine: EngineConfig,
    /// Parameters passed through to the engine
    pub generation: GenerationParams,
    /// Streaming pipeline tuning
    pub streaming: StreamingConfig,
    /// Conversation store
    pub store: StoreConfig,
}

/// HTTP listener configuration
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Hostname to listen on
    pub host: String,
    /// Port to listen on
    pub port: u16,
    /// Verbose logging
    pub debug: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 9600,
            debug: false,
        }
    }
}

/// Generation engine process configuration
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Executable to launch
    pub command: PathBuf,
    /// Extra arguments placed before the generation flags
    pub args: Vec<String>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            command: PathBuf::from("./chat"),
            args: Vec::new(),
        }
    }
}

/// Numeric generation parameters, passed to the engine unchanged
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GenerationParams {
    /// Sampling temperature
    pub temp: f32,
    /// Token budget per response
    pub n_predict: u32,
    /// Top-k sampling
    pub top_k: u32,
    /// Top-p (nucleus) sampling
    pub top_p: f32,
    /// Penalty applied to repeated tokens
    pub repeat_penalty: f32,
    /// Window of previous tokens considered for the repeat penalty
    pub repeat_last_n: u32,
    /// Context window size
    pub ctx_size: u32,
}

impl Default for GenerationParams {
    fn default() -> Self {
        Self {
            temp: 0.1,
            n_predict: 128,
            top_k: 40,
            top_p: 0.95,
            repeat_penalty: 1.3,
            repeat_last_n: 64,
            ctx_size: 2048,
        }
    }
}

impl GenerationParams {
    /// Render as engine command-line flags
    #[must_use]
    pub fn to_args(&self) -> Vec<String> {
        vec![
            "--temp".to_string(),
            self.temp.to_string(),
            "--n_predict".to_string(),
            self.n_predict.to_string(),
            "--top_k".to_string(),
            self.top_k.to_string(),
            "--top_p".to_string(),
            self.top_p.to_string(),
            "--repeat_penalty".to_string(),
            self.repeat_penalty.to_string(),
            "--repeat_last_n".to_string(),
            self.repeat_last_n.to_string(),
            "--ctx_size".to_string(),
            self.ctx_size.to_string(),
        ]
    }
}

/// Streaming pipeline tuning
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamingConfig {
    /// Wait for the first byte of a response (engine startup latency)
    pub initial_timeout_ms: u64,
    /// Silence after which a flowing response is considered finished
    pub idle_timeout_ms: u64,
    /// Silence that ends the discard of output left over from a preempted response
    ///
    /// Defaults to the idle timeout: anything shorter can mistake a pause
    /// inside the old response for its end.
    pub drain_timeout_ms: Option<u64>,
    /// Character the engine emits to mark end of response, if it has one
    pub end_marker: Option<char>,
}

impl Default for StreamingConfig {
    fn default() -> Self {
        Self {
            initial_timeout_ms: 15_000,
            idle_timeout_ms: 1_000,
            drain_timeout_ms: None,
            end_marker: None,
        }
    }
}

impl StreamingConfig {
    /// Startup timeout as a `Duration`
    #[must_use]
    pub fn initial_timeout(&self) -> Duration {
        Duration::from_millis(self.initial_timeout_ms)
    }

    /// Idle timeout as a `Duration`
    #[must_use]
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_millis(self.idle_timeout_ms)
    }

    /// Drain timeout as a `Duration`, falling back to the idle timeout
    #[must_use]
    pub fn drain_timeout(&self) -> Duration {
        self.drain_timeout_ms
            .map_or_else(|| self.idle_timeout(), Duration::from_millis)
    }
}

/// Conversation store configuration
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// SQLite database file
    pub db_path: PathBuf,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            db_path: PathBuf::from("database.db"),
        }
    }
}

/// Values supplied on the command line
///
/// `None` leaves the underlying layer untouched.
#[derive(Clone, Debug, Default)]
pub struct ConfigOverrides {
    /// Listen host
    pub host: Option<String>,
    /// Listen port
    pub port: Option<u16>,
    /// Debug logging
    pub debug: Option<bool>,
    /// Engine executable
    pub engine_command: Option<PathBuf>,
    /// Database file
    pub db_path: Option<PathBuf>,
    /// Sampling temperature
    pub temp: Option<f32>,
    /// Token budget
    pub n_predict: Option<u32>,
    /// Top-k sampling
    pub top_k: Option<u32>,
    /// Top-p sampling
    pub top_p: Option<f32>,
    /// Repeat penalty
    pub repeat_penalty: Option<f32>,
    /// Repeat penalty window
    pub repeat_last_n: Option<u32>,
    /// Context size
    pub ctx_size: Option<u32>,
}

impl RelayConfig {
    /// Apply `RELAY_*` environment variables
    ///
    /// - `RELAY_HOST`, `RELAY_PORT`
    /// - `RELAY_ENGINE_COMMAND`
    /// - `RELAY_DB_PATH`
    /// - `RELAY_IDLE_TIMEOUT_MS`, `RELAY_INITIAL_TIMEOUT_MS`
    #[must_use]
    pub fn with_env(self) -> Self {
        self.with_vars(|key| std::env::var(key).ok())
    }

    fn with_vars(mut self, var: impl Fn(&str) -> Option<String>) -> Self {
        if let Some(host) = var("RELAY_HOST") {
            self.server.host = host;
        }
        if let Some(port) = var("RELAY_PORT").and_then(|v| v.parse().ok()) {
            self.server.port = port;
        }
        if let Some(command) = var("RELAY_ENGINE_COMMAND") {
            self.engine.command = PathBuf::from(command);
        }
        if let Some(path) = var("RELAY_DB_PATH") {
            self.store.db_path = PathBuf::from(path);
        }
        if let Some(ms) = var("RELAY_INITIAL_TIMEOUT_MS").and_then(|v| v.parse().ok()) {
            self.streaming.initial_timeout_ms = ms;
        }
        if let Some(ms) = var("RELAY_IDLE_TIMEOUT_MS").and_then(|v| v.parse().ok()) {
            self.streaming.idle_timeout_ms = ms;
        }
        self
    }

    /// Apply command-line overrides
    #[must_use]
    pub fn with_overrides(mut self, overrides: ConfigOverrides) -> Self {
        if let Some(host) = overrides.host {
            self.server.host = host;
        }
        if let Some(port) = overrides.port {
            self.server.port = port;
        }
        if let Some(debug) = overrides.debug {
            self.server.debug = debug;
        }
        if let Some(command) = overrides.engine_command {
            self.engine.command = command;
        }
        if let Some(path) = overrides.db_path {
            self.store.db_path = path;
        }

        let generation = &mut self.generation;
        if let Some(v) = overrides.temp {
            generation.temp = v;
        }
        if let Some(v) = overrides.n_predict {
            generation.n_predict = v;
        }
        if let Some(v) = overrides.top_k {
            generation.top_k = v;
        }
        if let Some(v) = overrides.top_p {
            generation.top_p = v;
        }
        if let Some(v) = overrides.repeat_penalty {
            generation.repeat_penalty = v;
        }
        if let Some(v) = overrides.repeat_last_n {
            generation.repeat_last_n = v;
        }
        if let Some(v) = overrides.ctx_size {
            generation.ctx_size = v;
        }
        self
    }
}

/// Load configuration from a TOML file
pub fn load_config_from_path(path: &Path) -> Result<RelayConfig, ConfigError> {
    let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    toml::from_str(&content).map_err(|source| ConfigError::Parse {
        path: path.to_path_buf(),
        source,
    })
}

/// Load configuration from an optional file, falling back to defaults
pub fn load_config(path: Option<&Path>) -> Result<(RelayConfig, ConfigSource), ConfigError> {
    match path {
        Some(path) => {
            let config = load_config_from_path(path)?;
            tracing::debug!(path = %path.display(), "Loaded config file");
            Ok((config, ConfigSource::File(path.to_path_buf())))
        }
        None => Ok((RelayConfig::default(), ConfigSource::Defaults)),
    }
}
