// src/config/mod.rs
use anyhow::{bail, Context, Result};
use std::str::FromStr;
use std::time::Duration;
use url::Url;

/// Gateway configuration, loaded from the environment.
#[derive(Debug, Clone)]
pub struct Config {
    pub port: u16,
    pub backend_servers: Vec<Url>,
    pub max_sessions_per_server: usize,
    pub request_timeout_ms: u64,
    pub health_check_interval_ms: u64,
    pub session_cache_ttl_ms: u64,
    pub max_retries: u32,
    pub retry_delay_ms: u64,
    pub pair_trailing_slash: bool,
    pub metrics: MetricsConfig,
}

#[derive(Debug, Clone)]
pub struct MetricsConfig {
    pub enabled: bool,
    pub port: u16,
    pub path: String,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            port: 9100,
            path: "/metrics".to_string(),
        }
    }
}

impl Config {
    pub fn from_env() -> Result<Self> {
        let raw_backends = env_var("BACKEND_SERVERS")
            .context("BACKEND_SERVERS must list at least one backend URL")?;

        let config = Self {
            port: env_parse("PORT", 3000)?,
            backend_servers: parse_backend_list(&raw_backends)?,
            max_sessions_per_server: env_parse("MAX_SESSIONS_PER_SERVER", 25)?,
            request_timeout_ms: env_parse("REQUEST_TIMEOUT", 5000)?,
            health_check_interval_ms: env_parse("HEALTH_CHECK_INTERVAL", 10_000)?,
            session_cache_ttl_ms: env_parse("SESSION_CACHE_TTL", 5000)?,
            max_retries: env_parse("MAX_RETRIES", 3)?,
            retry_delay_ms: env_parse("RETRY_DELAY", 1000)?,
            pair_trailing_slash: env_parse("PAIR_TRAILING_SLASH", true)?,
            metrics: MetricsConfig {
                enabled: env_parse("METRICS_ENABLED", false)?,
                port: env_parse("METRICS_PORT", 9100)?,
                path: env_var("METRICS_PATH").unwrap_or_else(|| "/metrics".to_string()),
            },
        };

        config.validate()?;
        Ok(config)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn health_check_interval(&self) -> Duration {
        Duration::from_millis(self.health_check_interval_ms)
    }

    pub fn session_cache_ttl(&self) -> Duration {
        Duration::from_millis(self.session_cache_ttl_ms)
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }

    pub fn validate(&self) -> Result<()> {
        if self.backend_servers.is_empty() {
            bail!("at least one backend server is required");
        }
        if self.max_sessions_per_server == 0 {
            bail!("MAX_SESSIONS_PER_SERVER must be positive");
        }
        if self.request_timeout_ms == 0 {
            bail!("REQUEST_TIMEOUT must be positive");
        }
        if self.health_check_interval_ms == 0 {
            bail!("HEALTH_CHECK_INTERVAL must be positive");
        }
        Ok(())
    }
}

/// Parses a comma-separated list of absolute backend origins.
pub fn parse_backend_list(raw: &str) -> Result<Vec<Url>> {
    let mut backends = Vec::new();
    for part in raw.split(',') {
        let part = part.trim().trim_end_matches('/');
        if part.is_empty() {
            continue;
        }
        let url: Url = part
            .parse()
            .with_context(|| format!("invalid backend URL: {part}"))?;
        if !matches!(url.scheme(), "http" | "https") {
            bail!("backend URL must be http(s): {part}");
        }
        if url.host_str().is_none() {
            bail!("backend URL must carry a host: {part}");
        }
        backends.push(url);
    }
    Ok(backends)
}

fn env_var(name: &str) -> Option<String> {
    std::env::var(name)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn env_parse<T: FromStr>(name: &str, default: T) -> Result<T>
where
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match env_var(name) {
        Some(raw) => raw
            .parse()
            .with_context(|| format!("invalid value for {name}")),
        None => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config(backends: Vec<Url>) -> Config {
        Config {
            port: 3000,
            backend_servers: backends,
            max_sessions_per_server: 25,
            request_timeout_ms: 5000,
            health_check_interval_ms: 10_000,
            session_cache_ttl_ms: 5000,
            max_retries: 3,
            retry_delay_ms: 1000,
            pair_trailing_slash: true,
            metrics: MetricsConfig::default(),
        }
    }

    #[test]
    fn parses_comma_separated_backends() {
        let backends =
            parse_backend_list("http://10.0.0.1:3001, http://10.0.0.2:3001/ ,").unwrap();
        assert_eq!(backends.len(), 2);
        assert_eq!(backends[0].as_str(), "http://10.0.0.1:3001/");
    }

    #[test]
    fn rejects_non_http_backends() {
        assert!(parse_backend_list("ftp://10.0.0.1").is_err());
        assert!(parse_backend_list("not a url").is_err());
    }

    #[test]
    fn validate_requires_backends() {
        let config = test_config(vec![]);
        assert!(config.validate().is_err());

        let config = test_config(vec!["http://127.0.0.1:3001".parse().unwrap()]);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn duration_accessors_are_milliseconds() {
        let config = test_config(vec!["http://127.0.0.1:3001".parse().unwrap()]);
        assert_eq!(config.request_timeout(), Duration::from_secs(5));
        assert_eq!(config.retry_delay(), Duration::from_secs(1));
        assert_eq!(config.session_cache_ttl(), Duration::from_millis(5000));
    }
}
