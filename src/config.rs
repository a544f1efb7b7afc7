use axum::http::HeaderName;
use clap::{ArgAction, Parser};
use std::time::Duration;

use crate::client_ip::{ClientIpResolver, RateLimits};
use crate::rate_limit::RateLimitConfig;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("rate limit window must be at least one second")]
    ZeroWindow,
    #[error("rate limits must allow at least one request per window")]
    ZeroLimit,
    #[error("unknown-client limit ({unknown}) must be lower than the per-client limit ({identified})")]
    UnknownLimitNotLower { unknown: u32, identified: u32 },
    #[error("max tracked clients and cleanup batch must be at least 1")]
    ZeroCapacity,
    #[error("invalid client IP header name: {0:?}")]
    InvalidHeader(String),
}

// CLI argument structure
#[derive(Parser, Debug, Clone)]
#[command(name = "analytics-relay")]
#[command(about = "First-party analytics relay with per-client rate limiting")]
pub struct Args {
    // Port to run the server on
    #[arg(short, long, env = "PORT", default_value_t = 3000)]
    pub port: u16,

    #[arg(long, env = "HOST", default_value = "0.0.0.0")]
    pub host: String,

    // Rate limit window in seconds
    #[arg(long, env = "RATE_LIMIT_WINDOW", default_value_t = 60)]
    pub rate_window: u64,

    // Max requests per window for an identified client
    #[arg(long, env = "RATE_LIMIT_MAX_REQUESTS", default_value_t = 60)]
    pub rate_limit: u32,

    // Max requests per window for the shared "unknown" bucket
    #[arg(long, env = "RATE_LIMIT_UNKNOWN_MAX_REQUESTS", default_value_t = 10)]
    pub unknown_rate_limit: u32,

    #[arg(long, env = "RATE_LIMIT_MAX_ENTRIES", default_value_t = 5000)]
    pub max_tracked_clients: usize,

    #[arg(long, env = "RATE_LIMIT_CLEANUP_BATCH", default_value_t = 100)]
    pub cleanup_batch: usize,

    // Full expiry sweep interval in seconds
    #[arg(long, env = "RATE_LIMIT_SWEEP_INTERVAL", default_value_t = 300)]
    pub sweep_interval: u64,

    // Believe client IP headers set by a reverse proxy
    #[arg(long, env = "TRUST_PROXY", action = ArgAction::Set, value_parser = parse_flag,
          num_args = 0..=1, default_value = "false", default_missing_value = "true")]
    pub trust_proxy: bool,

    // Client IP headers in priority order (comma-separated)
    #[arg(long, env = "CLIENT_IP_HEADERS", value_delimiter = ',',
          default_value = "cf-connecting-ip,x-real-ip,x-forwarded-for")]
    pub ip_headers: Vec<String>,

    // Expected site origin, e.g. https://example.com
    #[arg(long, env = "SITE_ORIGIN")]
    pub site_origin: Option<String>,

    #[arg(long, env = "GA_COLLECTOR_URL", default_value = "https://www.google-analytics.com/mp/collect")]
    pub collector_url: String,

    #[arg(long, env = "GA_MEASUREMENT_ID")]
    pub measurement_id: Option<String>,

    #[arg(long, env = "GA_API_SECRET", hide_env_values = true)]
    pub api_secret: Option<String>,

    #[arg(long, env = "ANALYTICS_ENABLED", action = ArgAction::Set, value_parser = parse_flag,
          num_args = 0..=1, default_value = "true", default_missing_value = "true")]
    pub analytics_enabled: bool,

    // Send the client IP to the collector for geolocation
    #[arg(long, env = "FORWARD_CLIENT_IP", action = ArgAction::Set, value_parser = parse_flag,
          num_args = 0..=1, default_value = "false", default_missing_value = "true")]
    pub forward_client_ip: bool,

    #[arg(long, env = "FORWARD_USER_AGENT", action = ArgAction::Set, value_parser = parse_flag,
          num_args = 0..=1, default_value = "false", default_missing_value = "true")]
    pub forward_user_agent: bool,
}

/// Parses the usual spellings of a boolean switch.
pub fn parse_flag(raw: &str) -> Result<bool, String> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "true" | "1" | "yes" | "y" | "on" | "enable" | "enabled" => Ok(true),
        "" | "false" | "0" | "no" | "n" | "off" | "disable" | "disabled" => Ok(false),
        other => Err(format!("expected a boolean, got {other:?}")),
    }
}

impl Args {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.rate_window == 0 {
            return Err(ConfigError::ZeroWindow);
        }
        if self.rate_limit == 0 || self.unknown_rate_limit == 0 {
            return Err(ConfigError::ZeroLimit);
        }
        if self.unknown_rate_limit >= self.rate_limit {
            return Err(ConfigError::UnknownLimitNotLower {
                unknown: self.unknown_rate_limit,
                identified: self.rate_limit,
            });
        }
        if self.max_tracked_clients == 0 || self.cleanup_batch == 0 {
            return Err(ConfigError::ZeroCapacity);
        }
        self.header_names().map(|_| ())
    }

    pub fn rate_limit_config(&self) -> RateLimitConfig {
        RateLimitConfig {
            window: Duration::from_secs(self.rate_window),
            max_entries: self.max_tracked_clients,
            cleanup_batch: self.cleanup_batch,
        }
    }

    pub fn limits(&self) -> RateLimits {
        RateLimits {
            identified: self.rate_limit,
            unknown: self.unknown_rate_limit,
        }
    }

    pub fn resolver(&self) -> Result<ClientIpResolver, ConfigError> {
        Ok(ClientIpResolver::new(self.trust_proxy, self.header_names()?))
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval.max(1))
    }

    fn header_names(&self) -> Result<Vec<HeaderName>, ConfigError> {
        self.ip_headers
            .iter()
            .map(|h| h.trim())
            .filter(|h| !h.is_empty())
            .map(|h| {
                HeaderName::from_bytes(h.to_ascii_lowercase().as_bytes())
                    .map_err(|_| ConfigError::InvalidHeader(h.to_string()))
            })
            .collect()
    }
}
