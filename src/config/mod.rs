//! Configuration module for the voicelink client
//!
//! This module handles client configuration from various sources: .env files, YAML files,
//! and environment variables. Priority: YAML > ENV vars > .env values > defaults.
//!
//! # Modules
//! - `yaml`: YAML configuration file loading
//! - `env`: Environment variable loading
//! - `merge`: Applying YAML overrides on top of the environment
//!
//! # Example
//! ```rust,no_run
//! use voicelink::config::ClientConfig;
//! use std::path::PathBuf;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! // Load from environment variables only
//! let config = ClientConfig::from_env()?;
//!
//! // Load from YAML file with environment variable base
//! let config_path = PathBuf::from("voicelink.yaml");
//! let config = ClientConfig::from_file(&config_path)?;
//!
//! println!("Agent: {}", config.agent_id);
//! # Ok(())
//! # }
//! ```

use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

mod env;
mod merge;
mod yaml;

pub use yaml::YamlConfig;

use crate::core::base::{ClientError, ClientResult};
use crate::core::playback::SchedulerConfig;
use crate::utils::{validate_api_url, validate_socket_url};

/// Default agent API base URL
pub const DEFAULT_API_URL: &str = "https://api.primvoices.com";

/// Client log verbosity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    #[default]
    Error,
}

impl LogLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Debug => "DEBUG",
            LogLevel::Info => "INFO",
            LogLevel::Warn => "WARN",
            LogLevel::Error => "ERROR",
        }
    }

    /// Parse a level name, case-insensitive.
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_uppercase().as_str() {
            "DEBUG" => Some(LogLevel::Debug),
            "INFO" => Some(LogLevel::Info),
            "WARN" | "WARNING" => Some(LogLevel::Warn),
            "ERROR" => Some(LogLevel::Error),
            _ => None,
        }
    }

    pub fn to_tracing_level(self) -> tracing::Level {
        match self {
            LogLevel::Debug => tracing::Level::DEBUG,
            LogLevel::Info => tracing::Level::INFO,
            LogLevel::Warn => tracing::Level::WARN,
            LogLevel::Error => tracing::Level::ERROR,
        }
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Audio pipeline tuning
#[derive(Debug, Clone, PartialEq)]
pub struct AudioConfig {
    /// Rate of outbound narrowband audio (Hz)
    pub input_sample_rate: u32,
    /// Rate of inbound PCM16 media frames (Hz)
    pub output_sample_rate: u32,
    pub prebuffer_ms: u64,
    pub schedule_interval_ms: u64,
    pub schedule_horizon_ms: u64,
    pub stats_interval_ms: u64,
    /// Normalized level above which audio counts as speech
    pub speaking_threshold: f32,
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            input_sample_rate: 16000,
            output_sample_rate: 24000,
            prebuffer_ms: 250,
            schedule_interval_ms: 50,
            schedule_horizon_ms: 1000,
            stats_interval_ms: 100,
            speaking_threshold: 0.1,
        }
    }
}

/// Client configuration
#[derive(Debug, Clone, PartialEq)]
pub struct ClientConfig {
    pub agent_id: String,
    pub environment: Option<String>,
    /// Explicit socket endpoint; skips the agent lookup when set
    pub server_url: Option<String>,
    /// Agent lookup API base URL
    pub api_url: String,
    pub custom_parameters: HashMap<String, String>,
    pub log_level: LogLevel,
    pub experimental: bool,
    pub tracing_enabled: bool,
    pub connect_timeout_ms: u64,
    pub audio: AudioConfig,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            agent_id: String::new(),
            environment: None,
            server_url: None,
            api_url: DEFAULT_API_URL.to_string(),
            custom_parameters: HashMap::new(),
            log_level: LogLevel::default(),
            experimental: false,
            tracing_enabled: false,
            connect_timeout_ms: 10_000,
            audio: AudioConfig::default(),
        }
    }
}

impl ClientConfig {
    /// Defaults targeting the given agent.
    pub fn new(agent_id: impl Into<String>) -> Self {
        Self {
            agent_id: agent_id.into(),
            ..Default::default()
        }
    }

    /// Load configuration from environment variables
    ///
    /// `.env` is expected to be loaded by the caller (the binary does this at startup).
    pub fn from_env() -> Result<Self, Box<dyn std::error::Error>> {
        env::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load configuration from a YAML file with environment variable base
    ///
    /// Priority order (highest to lowest):
    /// 1. YAML file values
    /// 2. Environment variables (actual ENV vars override .env values)
    /// 3. .env file values
    /// 4. Default values
    ///
    /// # Errors
    /// Returns an error if:
    /// - The YAML file cannot be read or is malformed
    /// - Environment variables have invalid formats
    pub fn from_file(path: &PathBuf) -> Result<Self, Box<dyn std::error::Error>> {
        let yaml_config = YamlConfig::from_file(path)?;
        let mut config = Self::from_env()?;
        merge::apply_yaml(&mut config, yaml_config)?;
        Ok(config)
    }

    /// Check the configuration before a client is built from it.
    pub fn validate(&self) -> ClientResult<()> {
        if self.agent_id.trim().is_empty() {
            return Err(ClientError::InvalidConfiguration(
                "agent id must not be empty".to_string(),
            ));
        }

        if let Some(server_url) = &self.server_url {
            validate_socket_url(server_url).map_err(|e| {
                ClientError::InvalidConfiguration(format!("server_url: {e}"))
            })?;
        }

        validate_api_url(&self.api_url)
            .map_err(|e| ClientError::InvalidConfiguration(format!("api_url: {e}")))?;

        if self.audio.input_sample_rate == 0 || self.audio.output_sample_rate == 0 {
            return Err(ClientError::InvalidConfiguration(
                "sample rates must be positive".to_string(),
            ));
        }

        if self.audio.schedule_interval_ms == 0 || self.audio.stats_interval_ms == 0 {
            return Err(ClientError::InvalidConfiguration(
                "timer intervals must be positive".to_string(),
            ));
        }

        if !(0.0..=1.0).contains(&self.audio.speaking_threshold) {
            return Err(ClientError::InvalidConfiguration(format!(
                "speaking threshold must be within [0, 1], got {}",
                self.audio.speaking_threshold
            )));
        }

        Ok(())
    }

    pub fn scheduler_config(&self) -> SchedulerConfig {
        SchedulerConfig {
            prebuffer: Duration::from_millis(self.audio.prebuffer_ms),
            tick_interval: Duration::from_millis(self.audio.schedule_interval_ms),
            horizon: Duration::from_millis(self.audio.schedule_horizon_ms),
        }
    }

    pub fn stats_interval(&self) -> Duration {
        Duration::from_millis(self.audio.stats_interval_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }
}
