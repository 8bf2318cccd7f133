//! Service configuration

use anyhow::{bail, Result};
use serde::Deserialize;
use std::collections::HashMap;
use std::fmt;
use std::time::Duration;

/// Service configuration, read from unprefixed environment variables
#[derive(Clone, Deserialize)]
pub struct ApiConfig {
    /// HTTP listen port (`PORT`)
    #[serde(default = "default_port")]
    pub port: u16,

    /// Bearer token required on protected endpoints (`EXPECTED_AUTH_TOKEN`)
    #[serde(default)]
    pub expected_auth_token: String,

    /// Fallback log filter when `RUST_LOG` is unset (`LOG_LEVEL`)
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Wall-clock budget for one poll (`POLL_TIMEOUT_SECS`)
    #[serde(default = "default_poll_timeout")]
    pub poll_timeout_secs: u64,

    /// Poll before answering `/prometheus` (`SCRAPE_TRIGGERS_POLL`)
    #[serde(default)]
    pub scrape_triggers_poll: bool,

    /// Objects requested per listing page (`LIST_PAGE_SIZE`)
    #[serde(default = "default_list_page_size")]
    pub list_page_size: u32,
}

fn default_port() -> u16 {
    8080
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_poll_timeout() -> u64 {
    15
}

/// Upper bound for `POLL_TIMEOUT_SECS`
pub const MAX_POLL_TIMEOUT_SECS: u64 = 3600;

fn default_list_page_size() -> u32 {
    500
}

impl fmt::Debug for ApiConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ApiConfig")
            .field("port", &self.port)
            .field("expected_auth_token", &"<redacted>")
            .field("log_level", &self.log_level)
            .field("poll_timeout_secs", &self.poll_timeout_secs)
            .field("scrape_triggers_poll", &self.scrape_triggers_poll)
            .field("list_page_size", &self.list_page_size)
            .finish()
    }
}

impl ApiConfig {
    /// Load configuration from the process environment
    ///
    /// Values stay strings until serde reads them into typed fields, so a
    /// token such as `007` is kept verbatim.
    pub fn load() -> Result<Self> {
        Self::from_environment(config::Environment::default())
    }

    /// Load configuration from an explicit variable map instead of the process environment
    pub fn from_vars<K, V>(vars: impl IntoIterator<Item = (K, V)>) -> Result<Self>
    where
        K: Into<String>,
        V: Into<String>,
    {
        let vars: HashMap<String, String> = vars
            .into_iter()
            .map(|(key, value)| (key.into(), value.into()))
            .collect();
        Self::from_environment(config::Environment::default().source(Some(vars)))
    }

    fn from_environment(environment: config::Environment) -> Result<Self> {
        let mut config: ApiConfig = config::Config::builder()
            .add_source(environment)
            .build()?
            .try_deserialize()?;

        config.expected_auth_token = config.expected_auth_token.trim().to_string();
        if config.expected_auth_token.is_empty() {
            bail!("EXPECTED_AUTH_TOKEN must be set");
        }
        if config.poll_timeout_secs == 0 {
            bail!("POLL_TIMEOUT_SECS must be greater than zero");
        }
        if config.poll_timeout_secs > MAX_POLL_TIMEOUT_SECS {
            bail!("POLL_TIMEOUT_SECS must be at most {MAX_POLL_TIMEOUT_SECS}");
        }

        Ok(config)
    }

    pub fn poll_budget(&self) -> Duration {
        Duration::from_secs(self.poll_timeout_secs)
    }
}
