use std::collections::HashMap;
use std::path::PathBuf;

use serde::Deserialize;

/// Complete YAML configuration structure
///
/// Every field is optional so a file can override only what it names. Values
/// present here take priority over environment variables.
///
/// # Example YAML structure
/// ```yaml
/// agent:
///   id: "agent-123"
///   environment: "staging"
///   server_url: "wss://agent.example.com/ws"
///   api_url: "https://api.primvoices.com"
///   connect_timeout_ms: 10000
///   custom_parameters:
///     caller: "demo"
///
/// logging:
///   level: "INFO"
///
/// features:
///   experimental: false
///   tracing: true
///
/// audio:
///   input_sample_rate: 16000
///   output_sample_rate: 24000
///   prebuffer_ms: 250
///   schedule_interval_ms: 50
///   schedule_horizon_ms: 1000
///   stats_interval_ms: 100
///   speaking_threshold: 0.1
/// ```
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct YamlConfig {
    pub agent: Option<AgentYaml>,
    pub logging: Option<LoggingYaml>,
    pub features: Option<FeaturesYaml>,
    pub audio: Option<AudioYaml>,
}

/// Agent target from YAML
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct AgentYaml {
    pub id: Option<String>,
    pub environment: Option<String>,
    pub server_url: Option<String>,
    pub api_url: Option<String>,
    pub connect_timeout_ms: Option<u64>,
    pub custom_parameters: Option<HashMap<String, String>>,
}

/// Logging configuration from YAML
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct LoggingYaml {
    pub level: Option<String>,
}

/// Feature flags from YAML
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct FeaturesYaml {
    pub experimental: Option<bool>,
    pub tracing: Option<bool>,
}

/// Audio pipeline tuning from YAML
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct AudioYaml {
    pub input_sample_rate: Option<u32>,
    pub output_sample_rate: Option<u32>,
    pub prebuffer_ms: Option<u64>,
    pub schedule_interval_ms: Option<u64>,
    pub schedule_horizon_ms: Option<u64>,
    pub stats_interval_ms: Option<u64>,
    pub speaking_threshold: Option<f32>,
}

impl YamlConfig {
    /// Load YAML configuration from a file
    pub fn from_file(path: &PathBuf) -> Result<Self, Box<dyn std::error::Error>> {
        let contents = std::fs::read_to_string(path)
            .map_err(|e| format!("Failed to read config file {}: {e}", path.display()))?;

        let config: YamlConfig = serde_yaml::from_str(&contents)
            .map_err(|e| format!("Failed to parse YAML config: {e}"))?;

        Ok(config)
    }
}
