//! Environment variable loading
//!
//! Parsing goes through a key lookup function so it can be exercised without
//! touching the process environment.

use std::collections::HashMap;
use std::str::FromStr;

use super::{ClientConfig, LogLevel};

pub(super) fn from_lookup<F>(get: F) -> Result<ClientConfig, Box<dyn std::error::Error>>
where
    F: Fn(&str) -> Option<String>,
{
    let mut config = ClientConfig::default();
    let read = |key: &str| get(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

    if let Some(agent_id) = read("AGENT_ID") {
        config.agent_id = agent_id;
    }
    config.environment = read("AGENT_ENVIRONMENT");
    config.server_url = read("SERVER_URL");
    if let Some(api_url) = read("API_URL") {
        config.api_url = api_url;
    }
    if let Some(raw) = read("CUSTOM_PARAMETERS") {
        config.custom_parameters = parse_custom_parameters(&raw)?;
    }
    if let Some(level) = read("LOG_LEVEL") {
        config.log_level = LogLevel::parse(&level)
            .ok_or_else(|| format!("Invalid value for LOG_LEVEL: {level}"))?;
    }
    if let Some(value) = read("EXPERIMENTAL") {
        config.experimental = parse_bool("EXPERIMENTAL", &value)?;
    }
    if let Some(value) = read("TRACING") {
        config.tracing_enabled = parse_bool("TRACING", &value)?;
    }
    if let Some(value) = read("INPUT_SAMPLE_RATE") {
        config.audio.input_sample_rate = parse_number("INPUT_SAMPLE_RATE", &value)?;
    }
    if let Some(value) = read("OUTPUT_SAMPLE_RATE") {
        config.audio.output_sample_rate = parse_number("OUTPUT_SAMPLE_RATE", &value)?;
    }
    if let Some(value) = read("PREBUFFER_MS") {
        config.audio.prebuffer_ms = parse_number("PREBUFFER_MS", &value)?;
    }
    if let Some(value) = read("CONNECT_TIMEOUT_MS") {
        config.connect_timeout_ms = parse_number("CONNECT_TIMEOUT_MS", &value)?;
    }

    Ok(config)
}

/// Parse `k=v,k2=v2` into a map. Empty segments are skipped.
fn parse_custom_parameters(
    raw: &str,
) -> Result<HashMap<String, String>, Box<dyn std::error::Error>> {
    let mut parameters = HashMap::new();
    for pair in raw.split(',').map(str::trim).filter(|p| !p.is_empty()) {
        let (key, value) = pair
            .split_once('=')
            .ok_or_else(|| format!("Invalid CUSTOM_PARAMETERS entry (expected key=value): {pair}"))?;
        let key = key.trim();
        if key.is_empty() {
            return Err(format!("Invalid CUSTOM_PARAMETERS entry (empty key): {pair}").into());
        }
        parameters.insert(key.to_string(), value.trim().to_string());
    }
    Ok(parameters)
}

fn parse_bool(key: &str, value: &str) -> Result<bool, Box<dyn std::error::Error>> {
    match value.to_ascii_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Ok(true),
        "false" | "0" | "no" | "off" => Ok(false),
        _ => Err(format!("Invalid value for {key}: {value}").into()),
    }
}

fn parse_number<T>(key: &str, value: &str) -> Result<T, Box<dyn std::error::Error>>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    value
        .parse::<T>()
        .map_err(|e| format!("Invalid value for {key}: {e}").into())
}
