use crate::executor::HttpConfig;
use crate::humanize::ByteSize;
use crate::job::JobConfig;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Top-level configuration
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub pool: PoolSettings,
    #[serde(default)]
    pub http: HttpSettings,
}

/// Worker pool settings
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct PoolSettings {
    #[serde(default = "default_size")]
    pub size: usize,
    /// Backoff between dispatcher polls while a worker has nothing to do
    #[serde(default = "default_idle_poll_interval_ms")]
    pub idle_poll_interval_ms: u64,
    /// Default body cap for jobs created from this configuration
    #[serde(default)]
    pub max_body_size: Option<ByteSize>,
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self {
            size: default_size(),
            idle_poll_interval_ms: default_idle_poll_interval_ms(),
            max_body_size: None,
        }
    }
}

impl PoolSettings {
    pub fn idle_poll_interval(&self) -> Duration {
        Duration::from_millis(self.idle_poll_interval_ms)
    }

    pub fn job_config(&self) -> JobConfig {
        JobConfig {
            max_body_size: self.max_body_size,
        }
    }
}

fn default_size() -> usize {
    4
}

fn default_idle_poll_interval_ms() -> u64 {
    1000
}

/// Transport settings for the reqwest executor
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct HttpSettings {
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: Option<u64>,
    #[serde(default = "default_user_agent")]
    pub user_agent: String,
    #[serde(default = "default_max_redirects")]
    pub max_redirects: usize,
    pub proxy: Option<String>,
}

impl Default for HttpSettings {
    fn default() -> Self {
        Self {
            connect_timeout_ms: default_connect_timeout_ms(),
            request_timeout_ms: default_request_timeout_ms(),
            user_agent: default_user_agent(),
            max_redirects: default_max_redirects(),
            proxy: None,
        }
    }
}

impl HttpSettings {
    pub fn to_http_config(&self) -> HttpConfig {
        HttpConfig {
            connect_timeout: Duration::from_millis(self.connect_timeout_ms),
            request_timeout: self.request_timeout_ms.map(Duration::from_millis),
            user_agent: self.user_agent.clone(),
            max_redirects: self.max_redirects,
            proxy: self.proxy.clone(),
        }
    }
}

fn default_connect_timeout_ms() -> u64 {
    10_000
}

fn default_request_timeout_ms() -> Option<u64> {
    Some(60_000)
}

fn default_user_agent() -> String {
    HttpConfig::default().user_agent
}

fn default_max_redirects() -> usize {
    10
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_http_config() {
        let config = Config::default();
        assert_eq!(config.pool.size, 4);
        assert_eq!(config.pool.idle_poll_interval(), Duration::from_secs(1));
        assert_eq!(config.http.to_http_config(), HttpConfig::default());
    }

    #[test]
    fn test_parse_toml_sections() {
        let config: Config = toml::from_str(
            r#"
[pool]
size = 16
max_body_size = "256KB"

[http]
request_timeout_ms = 5000
proxy = "http://proxy:3128"
            "#,
        )
        .unwrap();

        assert_eq!(config.pool.size, 16);
        assert_eq!(config.pool.job_config().max_body_size, Some(ByteSize::kib(256)));
        assert_eq!(config.http.request_timeout_ms, Some(5000));
        assert_eq!(config.http.connect_timeout_ms, 10_000);
        assert_eq!(
            config.http.to_http_config().proxy.as_deref(),
            Some("http://proxy:3128")
        );
    }
}
