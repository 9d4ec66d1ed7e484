use super::models::Config;
use reqwest::Url;
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ValidationError {
    #[error("pool size must be at least 1")]
    ZeroPoolSize,

    #[error("idle_poll_interval_ms must be positive")]
    ZeroPollInterval,

    #[error("{field} must be positive")]
    ZeroTimeout { field: &'static str },

    #[error("user agent must not be empty")]
    EmptyUserAgent,

    #[error("invalid proxy URL '{proxy}': {reason}")]
    InvalidProxy { proxy: String, reason: String },
}

/// Validate the entire configuration
pub fn validate(config: &Config) -> Result<(), ValidationError> {
    validate_pool(config)?;
    validate_http(config)?;
    Ok(())
}

fn validate_pool(config: &Config) -> Result<(), ValidationError> {
    if config.pool.size == 0 {
        return Err(ValidationError::ZeroPoolSize);
    }
    if config.pool.idle_poll_interval_ms == 0 {
        return Err(ValidationError::ZeroPollInterval);
    }
    Ok(())
}

fn validate_http(config: &Config) -> Result<(), ValidationError> {
    let http = &config.http;

    if http.connect_timeout_ms == 0 {
        return Err(ValidationError::ZeroTimeout {
            field: "connect_timeout_ms",
        });
    }
    if http.request_timeout_ms == Some(0) {
        return Err(ValidationError::ZeroTimeout {
            field: "request_timeout_ms",
        });
    }
    if http.user_agent.trim().is_empty() {
        return Err(ValidationError::EmptyUserAgent);
    }

    if let Some(proxy) = &http.proxy {
        let url = Url::parse(proxy).map_err(|e| ValidationError::InvalidProxy {
            proxy: proxy.clone(),
            reason: e.to_string(),
        })?;
        if !matches!(url.scheme(), "http" | "https" | "socks5" | "socks5h") {
            return Err(ValidationError::InvalidProxy {
                proxy: proxy.clone(),
                reason: format!("unsupported scheme '{}'", url.scheme()),
            });
        }
    }

    Ok(())
}
