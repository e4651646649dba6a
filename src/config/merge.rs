//! Applies YAML overrides on top of an environment-derived configuration.

use super::yaml::YamlConfig;
use super::{ClientConfig, LogLevel};

pub(super) fn apply_yaml(
    config: &mut ClientConfig,
    yaml: YamlConfig,
) -> Result<(), Box<dyn std::error::Error>> {
    if let Some(agent) = yaml.agent {
        if let Some(id) = agent.id {
            config.agent_id = id;
        }
        if agent.environment.is_some() {
            config.environment = agent.environment;
        }
        if agent.server_url.is_some() {
            config.server_url = agent.server_url;
        }
        if let Some(api_url) = agent.api_url {
            config.api_url = api_url;
        }
        if let Some(timeout) = agent.connect_timeout_ms {
            config.connect_timeout_ms = timeout;
        }
        if let Some(parameters) = agent.custom_parameters {
            config.custom_parameters = parameters;
        }
    }

    if let Some(level) = yaml.logging.and_then(|l| l.level) {
        config.log_level = LogLevel::parse(&level)
            .ok_or_else(|| format!("Invalid logging.level in YAML config: {level}"))?;
    }

    if let Some(features) = yaml.features {
        if let Some(experimental) = features.experimental {
            config.experimental = experimental;
        }
        if let Some(tracing) = features.tracing {
            config.tracing_enabled = tracing;
        }
    }

    if let Some(audio) = yaml.audio {
        let target = &mut config.audio;
        if let Some(v) = audio.input_sample_rate {
            target.input_sample_rate = v;
        }
        if let Some(v) = audio.output_sample_rate {
            target.output_sample_rate = v;
        }
        if let Some(v) = audio.prebuffer_ms {
            target.prebuffer_ms = v;
        }
        if let Some(v) = audio.schedule_interval_ms {
            target.schedule_interval_ms = v;
        }
        if let Some(v) = audio.schedule_horizon_ms {
            target.schedule_horizon_ms = v;
        }
        if let Some(v) = audio.stats_interval_ms {
            target.stats_interval_ms = v;
        }
        if let Some(v) = audio.speaking_threshold {
            target.speaking_threshold = v;
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_yaml_replaces_custom_parameters() {
        let mut config = ClientConfig::new("a");
        config
            .custom_parameters
            .insert("from_env".to_string(), "1".to_string());

        let yaml: YamlConfig =
            serde_yaml::from_str("agent:\n  custom_parameters:\n    from_yaml: \"2\"\n").unwrap();
        apply_yaml(&mut config, yaml).unwrap();

        assert!(!config.custom_parameters.contains_key("from_env"));
        assert_eq!(
            config.custom_parameters.get("from_yaml").map(String::as_str),
            Some("2")
        );
    }

    #[test]
    fn test_absent_sections_keep_values() {
        let mut config = ClientConfig::new("a");
        config.environment = Some("prod".to_string());
        config.tracing_enabled = true;

        apply_yaml(&mut config, YamlConfig::default()).unwrap();
        assert_eq!(config.environment.as_deref(), Some("prod"));
        assert!(config.tracing_enabled);
    }

    #[test]
    fn test_invalid_log_level() {
        let mut config = ClientConfig::new("a");
        let yaml: YamlConfig = serde_yaml::from_str("logging:\n  level: \"chatty\"\n").unwrap();
        assert!(apply_yaml(&mut config, yaml).is_err());
    }

    #[test]
    fn test_features_and_audio() {
        let mut config = ClientConfig::new("a");
        let yaml: YamlConfig = serde_yaml::from_str(
            "features:\n  tracing: true\naudio:\n  stats_interval_ms: 200\n  schedule_horizon_ms: 500\n",
        )
        .unwrap();
        apply_yaml(&mut config, yaml).unwrap();
        assert!(config.tracing_enabled);
        assert!(!config.experimental);
        assert_eq!(config.audio.stats_interval_ms, 200);
        assert_eq!(config.audio.schedule_horizon_ms, 500);
    }
}
