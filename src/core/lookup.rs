//! Agent endpoint resolution.
//!
//! When no explicit socket endpoint is configured, every connect asks the
//! agent API which socket URL to use for the agent and which parameters to
//! send in the handshake.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;

use super::base::{ClientError, ClientResult};

/// Input type reported to the agent API and in the handshake.
pub const INPUT_TYPE_MIC: &str = "mic";

/// What the lookup needs to know about the call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LookupRequest {
    pub agent_id: String,
    pub environment: Option<String>,
    pub custom_parameters: HashMap<String, String>,
    pub experimental: bool,
}

/// Socket endpoint returned by the lookup.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct AgentEndpoint {
    pub url: String,
    #[serde(default)]
    pub parameters: HashMap<String, String>,
}

#[derive(Debug, Deserialize)]
struct LookupEnvelope {
    data: AgentEndpoint,
}

/// Resolves an agent identifier to a socket endpoint.
#[async_trait]
pub trait AgentLookup: Send + Sync {
    async fn resolve(&self, request: &LookupRequest) -> ClientResult<AgentEndpoint>;
}

/// Default lookup against the agent HTTP API.
#[derive(Debug, Clone)]
pub struct HttpAgentLookup {
    client: reqwest::Client,
    api_url: String,
}

impl HttpAgentLookup {
    pub fn new(api_url: impl Into<String>) -> Self {
        Self::with_client(reqwest::Client::new(), api_url)
    }

    pub fn with_timeout(api_url: impl Into<String>, timeout: Duration) -> ClientResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| ClientError::InternalError(format!("Failed to build HTTP client: {e}")))?;
        Ok(Self::with_client(client, api_url))
    }

    pub fn with_client(client: reqwest::Client, api_url: impl Into<String>) -> Self {
        Self {
            client,
            api_url: api_url.into().trim_end_matches('/').to_string(),
        }
    }

    pub fn api_url(&self) -> &str {
        &self.api_url
    }

    fn call_url(&self, agent_id: &str) -> String {
        format!("{}/v1/agents/{}/call", self.api_url, agent_id)
    }

    fn query_pairs(request: &LookupRequest) -> Vec<(String, String)> {
        let mut pairs = vec![
            ("inputType".to_string(), INPUT_TYPE_MIC.to_string()),
            (
                "environment".to_string(),
                request.environment.clone().unwrap_or_default(),
            ),
        ];

        let mut custom: Vec<_> = request.custom_parameters.iter().collect();
        custom.sort();
        pairs.extend(
            custom
                .into_iter()
                .map(|(k, v)| (format!("custom_{k}"), v.clone())),
        );

        if request.experimental {
            pairs.push(("experimental".to_string(), "true".to_string()));
        }
        pairs
    }
}

#[async_trait]
impl AgentLookup for HttpAgentLookup {
    async fn resolve(&self, request: &LookupRequest) -> ClientResult<AgentEndpoint> {
        let url = self.call_url(&request.agent_id);
        tracing::debug!("Resolving agent endpoint via {}", url);

        let response = self
            .client
            .post(&url)
            .query(&Self::query_pairs(request))
            .json(&serde_json::json!({}))
            .send()
            .await
            .map_err(|e| ClientError::LookupFailed(format!("Request failed: {}", e)))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(ClientError::LookupFailed(format!(
                "Agent API returned {}: {}",
                status, body
            )));
        }

        let envelope: LookupEnvelope = response
            .json()
            .await
            .map_err(|e| ClientError::LookupFailed(format!("Invalid response body: {}", e)))?;

        tracing::info!("Agent configuration resolved: {}", envelope.data.url);
        Ok(envelope.data)
    }
}
