//! Client configuration.
//!
//! [`QueryConfig`] controls cache freshness. [`ClientConfig`] describes the
//! remote API and can be loaded from the environment:
//!
//! - `SLIDE_SYNC_BASE_URL`: base URL every request path is appended to
//! - `SLIDE_SYNC_TIMEOUT_SECS`: per-request timeout in seconds
//! - `SLIDE_SYNC_STALE_SECS`: default stale time in seconds

use std::time::Duration;

use crate::error::ConfigError;

const DEFAULT_BASE_URL: &str = "http://localhost:8000/api/v1";

/// Configuration for query behavior.
///
/// This controls how long fetched data is considered fresh.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueryConfig {
    /// How long data is considered fresh before becoming stale.
    ///
    /// When data is fresh, queries will use cached data without refetching.
    /// Once stale, queries will refetch in the background while still showing cached data.
    pub stale_time: Duration,
}

impl Default for QueryConfig {
    fn default() -> Self {
        Self {
            stale_time: Duration::from_secs(5 * 60),
        }
    }
}

impl QueryConfig {
    /// Creates a new query configuration with the given stale time.
    #[must_use]
    pub const fn new(stale_time: Duration) -> Self {
        Self { stale_time }
    }
}

/// Connection settings for the remote API.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientConfig {
    pub base_url: String,
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub query: QueryConfig,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_BASE_URL.to_string(),
            timeout: Duration::from_secs(30),
            user_agent: None,
            query: QueryConfig::default(),
        }
    }
}

impl ClientConfig {
    /// Creates a configuration pointing at `base_url` with default settings.
    #[must_use]
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            ..Self::default()
        }
    }

    /// Loads configuration from `SLIDE_SYNC_*` environment variables.
    ///
    /// Unset variables keep their defaults.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::InvalidVar`] if a variable is set but malformed.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Some(url) = lookup("SLIDE_SYNC_BASE_URL") {
            let url = url.trim().trim_end_matches('/').to_string();
            if url.is_empty() {
                return Err(ConfigError::InvalidVar {
                    name: "SLIDE_SYNC_BASE_URL",
                    reason: "must not be empty".to_string(),
                });
            }
            config.base_url = url;
        }
        if let Some(secs) = lookup("SLIDE_SYNC_TIMEOUT_SECS") {
            config.timeout = parse_secs("SLIDE_SYNC_TIMEOUT_SECS", &secs)?;
        }
        if let Some(secs) = lookup("SLIDE_SYNC_STALE_SECS") {
            config.query.stale_time = parse_secs("SLIDE_SYNC_STALE_SECS", &secs)?;
        }

        tracing::debug!(base_url = %config.base_url, "client configuration loaded");
        Ok(config)
    }
}

fn parse_secs(name: &'static str, value: &str) -> Result<Duration, ConfigError> {
    value
        .trim()
        .parse::<u64>()
        .map(Duration::from_secs)
        .map_err(|e| ConfigError::InvalidVar {
            name,
            reason: e.to_string(),
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        move |name| vars.get(name).cloned()
    }

    #[test]
    fn test_default_config() {
        let config = QueryConfig::default();
        assert_eq!(config.stale_time, Duration::from_secs(5 * 60));

        let config = ClientConfig::default();
        assert_eq!(config.base_url, "http://localhost:8000/api/v1");
        assert_eq!(config.timeout, Duration::from_secs(30));
    }

    #[test]
    fn test_new_config() {
        let config = QueryConfig::new(Duration::from_secs(30));
        assert_eq!(config.stale_time, Duration::from_secs(30));
    }

    #[test]
    fn test_from_lookup_overrides() {
        let config = ClientConfig::from_lookup(lookup(&[
            ("SLIDE_SYNC_BASE_URL", "https://slides.example.com/api/v1/"),
            ("SLIDE_SYNC_TIMEOUT_SECS", "5"),
            ("SLIDE_SYNC_STALE_SECS", "60"),
        ]))
        .unwrap();

        assert_eq!(config.base_url, "https://slides.example.com/api/v1");
        assert_eq!(config.timeout, Duration::from_secs(5));
        assert_eq!(config.query.stale_time, Duration::from_secs(60));
    }

    #[test]
    fn test_from_lookup_empty_uses_defaults() {
        let config = ClientConfig::from_lookup(lookup(&[])).unwrap();
        assert_eq!(config, ClientConfig::default());
    }

    #[test]
    fn test_from_lookup_rejects_malformed() {
        let err = ClientConfig::from_lookup(lookup(&[("SLIDE_SYNC_TIMEOUT_SECS", "soon")]))
            .unwrap_err();
        assert!(matches!(
            err,
            ConfigError::InvalidVar {
                name: "SLIDE_SYNC_TIMEOUT_SECS",
                ..
            }
        ));

        let err = ClientConfig::from_lookup(lookup(&[("SLIDE_SYNC_BASE_URL", "  ")])).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidVar { .. }));
    }
}
