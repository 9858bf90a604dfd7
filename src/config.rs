//! Environment configuration for both surfaces

use crate::retry::{RetryPolicy, DEFAULT_BASE_DELAY, DEFAULT_MAX_ATTEMPTS};
use std::path::PathBuf;
use std::time::Duration;

pub const DEFAULT_PORT: u16 = 3000;
pub const DEFAULT_UPSTREAM_URL: &str = "https://router.huggingface.co/v1";
pub const DEFAULT_MODEL: &str = "zai-org/GLM-4.7-Flash";
const DEFAULT_USER: &str = "local";
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

fn data_dir(lookup: &impl Fn(&str) -> Option<String>) -> PathBuf {
    let home = lookup("HOME").unwrap_or_else(|| "/tmp".to_string());
    PathBuf::from(home).join(".kacademyx")
}

fn parsed<T: std::str::FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Option<T> {
    let raw = lookup(key)?;
    match raw.trim().parse() {
        Ok(value) => Some(value),
        Err(_) => {
            tracing::warn!(key, value = %raw, "Ignoring unparsable setting");
            None
        }
    }
}

fn non_empty(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Option<String> {
    lookup(key).filter(|v| !v.trim().is_empty())
}

/// Settings for `kacademyx chat`
#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub endpoint: String,
    pub db_path: PathBuf,
    pub settings_path: PathBuf,
    pub user_id: String,
    pub retry: RetryPolicy,
    pub connect_timeout: Duration,
}

impl ClientConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let dir = data_dir(&lookup);
        let port = parsed(&lookup, "KACADEMYX_PORT").unwrap_or(DEFAULT_PORT);
        let max_attempts = parsed(&lookup, "KACADEMYX_MAX_ATTEMPTS").unwrap_or(DEFAULT_MAX_ATTEMPTS);
        let base_delay = parsed(&lookup, "KACADEMYX_BASE_DELAY_MS")
            .map_or(DEFAULT_BASE_DELAY, Duration::from_millis);

        Self {
            endpoint: non_empty(&lookup, "KACADEMYX_ENDPOINT")
                .unwrap_or_else(|| format!("http://127.0.0.1:{port}/api/chat")),
            db_path: non_empty(&lookup, "KACADEMYX_DB_PATH")
                .map_or_else(|| dir.join("kacademyx.db"), PathBuf::from),
            settings_path: non_empty(&lookup, "KACADEMYX_SETTINGS_PATH")
                .map_or_else(|| dir.join("settings.json"), PathBuf::from),
            user_id: non_empty(&lookup, "KACADEMYX_USER").unwrap_or_else(|| DEFAULT_USER.to_string()),
            retry: RetryPolicy::new(max_attempts, base_delay),
            connect_timeout: CONNECT_TIMEOUT,
        }
    }
}

/// Settings for `kacademyx serve`
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub port: u16,
    pub upstream_url: String,
    pub model: String,
    /// Missing key is reported per request, not at start
    pub api_key: Option<String>,
}

impl ServerConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        Self {
            port: parsed(&lookup, "KACADEMYX_PORT").unwrap_or(DEFAULT_PORT),
            upstream_url: non_empty(&lookup, "KACADEMYX_UPSTREAM_URL")
                .unwrap_or_else(|| DEFAULT_UPSTREAM_URL.to_string()),
            model: non_empty(&lookup, "KACADEMYX_MODEL").unwrap_or_else(|| DEFAULT_MODEL.to_string()),
            api_key: non_empty(&lookup, "HUGGINGFACE_API_KEY")
                .or_else(|| non_empty(&lookup, "HF_TOKEN")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn client_defaults() {
        let config = ClientConfig::from_lookup(env(&[("HOME", "/home/student")]));
        assert_eq!(config.endpoint, "http://127.0.0.1:3000/api/chat");
        assert_eq!(config.db_path, PathBuf::from("/home/student/.kacademyx/kacademyx.db"));
        assert_eq!(config.user_id, "local");
        assert_eq!(config.retry, RetryPolicy::default());
    }

    #[test]
    fn client_overrides() {
        let config = ClientConfig::from_lookup(env(&[
            ("KACADEMYX_ENDPOINT", "http://tutor.local/api/chat"),
            ("KACADEMYX_MAX_ATTEMPTS", "5"),
            ("KACADEMYX_BASE_DELAY_MS", "250"),
            ("KACADEMYX_USER", "ada"),
            ("KACADEMYX_DB_PATH", "/data/k.db"),
        ]));
        assert_eq!(config.endpoint, "http://tutor.local/api/chat");
        assert_eq!(config.retry, RetryPolicy::new(5, Duration::from_millis(250)));
        assert_eq!(config.user_id, "ada");
        assert_eq!(config.db_path, PathBuf::from("/data/k.db"));
    }

    #[test]
    fn bad_numbers_fall_back() {
        let config = ClientConfig::from_lookup(env(&[("KACADEMYX_MAX_ATTEMPTS", "lots")]));
        assert_eq!(config.retry.max_attempts, DEFAULT_MAX_ATTEMPTS);
    }

    #[test]
    fn server_key_fallback() {
        let config = ServerConfig::from_lookup(env(&[("HF_TOKEN", "hf_abc")]));
        assert_eq!(config.api_key.as_deref(), Some("hf_abc"));
        assert_eq!(config.model, DEFAULT_MODEL);
        assert_eq!(config.port, DEFAULT_PORT);

        let config = ServerConfig::from_lookup(env(&[
            ("HUGGINGFACE_API_KEY", "primary"),
            ("HF_TOKEN", "secondary"),
            ("KACADEMYX_PORT", "8080"),
        ]));
        assert_eq!(config.api_key.as_deref(), Some("primary"));
        assert_eq!(config.port, 8080);

        assert!(ServerConfig::from_lookup(env(&[("HF_TOKEN", "  ")])).api_key.is_none());
    }
}
