use reqwest::header::USER_AGENT;
use reqwest::{StatusCode, Url};
use std::time::Duration;

use crate::models::{CollectPayload, QueuedEvent};

const COLLECT_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, thiserror::Error)]
pub enum CollectorError {
    #[error("invalid collector url: {0}")]
    Url(String),
    #[error("collector request failed: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("collector answered {0}")]
    Status(StatusCode),
}

// Credentials for the Measurement Protocol endpoint
#[derive(Debug, Clone)]
pub struct CollectorConfig {
    pub url: String,
    pub measurement_id: Option<String>,
    pub api_secret: Option<String>,
    pub enabled: bool,
    pub forward_client_ip: bool,
    pub forward_user_agent: bool,
}

// Forwards events to the analytics collector
#[derive(Clone)]
pub struct Collector {
    client: reqwest::Client,
    config: CollectorConfig,
}

impl Collector {
    pub fn new(client: reqwest::Client, config: CollectorConfig) -> Self {
        Self { client, config }
    }

    pub fn config(&self) -> &CollectorConfig {
        &self.config
    }

    // Enabled and both credentials present
    pub fn is_configured(&self) -> bool {
        self.config.enabled
            && self.config.measurement_id.as_deref().is_some_and(|s| !s.is_empty())
            && self.config.api_secret.as_deref().is_some_and(|s| !s.is_empty())
    }

    pub fn endpoint(&self, client_ip: Option<&str>) -> Result<Url, CollectorError> {
        let mut params = vec![
            ("measurement_id", self.config.measurement_id.as_deref().unwrap_or_default()),
            ("api_secret", self.config.api_secret.as_deref().unwrap_or_default()),
        ];
        if let Some(ip) = client_ip.filter(|_| self.config.forward_client_ip) {
            params.push(("user_ip", ip));
        }
        Url::parse_with_params(&self.config.url, &params).map_err(|e| CollectorError::Url(e.to_string()))
    }

    /// Sends one event. Returns `Ok(false)` when forwarding is turned off.
    pub async fn send(&self, queued: &QueuedEvent) -> Result<bool, CollectorError> {
        if !self.is_configured() {
            return Ok(false);
        }

        let endpoint = self.endpoint(queued.client_ip.as_deref())?;
        let mut request = self
            .client
            .post(endpoint)
            .timeout(COLLECT_TIMEOUT)
            .json(&CollectPayload::from_queued(queued));
        if let Some(agent) = queued.user_agent.as_deref().filter(|_| self.config.forward_user_agent) {
            request = request.header(USER_AGENT, agent);
        }

        let res = request.send().await?;
        if !res.status().is_success() {
            return Err(CollectorError::Status(res.status()));
        }
        Ok(true)
    }
}
