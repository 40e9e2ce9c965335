//! # Configuration Management
//!
//! Loads application configuration from multiple sources:
//! - TOML configuration files (config.toml)
//! - Environment variables (with APP_ prefix)
//! - Default values (built into the code)
//!
//! ## Configuration Priority (highest to lowest):
//! 1. Environment variables, `APP_` prefix with `__` between nesting levels
//!    (APP_SERVER__HOST, APP_RELAY__MAX_CONCURRENT_SESSIONS, ...); the double
//!    underscore keeps multi-word field names like `max_concurrent_sessions`
//!    parseable
//! 2. Configuration file (config.toml)
//! 3. Default values (defined in the Default impl)
//!
//! `HOST` and `PORT` without the prefix are honored too, for deployment
//! platforms that inject them.

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::env;

/// Main application configuration that contains all settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub recognizer: RecognizerConfig,
    pub relay: RelayConfig,
}

/// Server bind address.
///
/// `host = "127.0.0.1"` accepts localhost only; use `"0.0.0.0"` to accept
/// connections from any interface.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

/// Remote recognition backend settings.
///
/// ## Fields:
/// - `url`: WebSocket endpoint of the streaming recognition service
/// - `credentials_path`: filesystem path of the API token, with an optional
///   `file:` prefix
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecognizerConfig {
    pub url: String,
    pub credentials_path: String,
}

/// Relay-wide limits.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelayConfig {
    /// Maximum number of simultaneously active streaming sessions.
    pub max_concurrent_sessions: usize,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig {
                host: "127.0.0.1".to_string(),
                port: 8080,
            },
            recognizer: RecognizerConfig {
                url: "wss://recognizer.example.com/v1/stream".to_string(),
                credentials_path: "credentials/api-token".to_string(),
            },
            relay: RelayConfig {
                max_concurrent_sessions: 32,
            },
        }
    }
}

impl AppConfig {
    /// Load configuration from defaults, config.toml and the environment, in
    /// that order of increasing priority.
    pub fn load() -> Result<Self> {
        let mut settings = config::Config::builder()
            .add_source(config::Config::try_from(&AppConfig::default())?)
            .add_source(config::File::with_name("config").required(false))
            .add_source(
                config::Environment::with_prefix("APP")
                    .prefix_separator("_")
                    .separator("__"),
            );

        // Deployment platforms commonly inject these without the APP_ prefix.
        if let Ok(host) = env::var("HOST") {
            settings = settings.set_override("server.host", host)?;
        }

        if let Ok(port) = env::var("PORT") {
            settings = settings.set_override("server.port", port)?;
        }

        let config = settings.build()?.try_deserialize()?;
        Ok(config)
    }

    /// Reject configurations that cannot possibly serve traffic.
    pub fn validate(&self) -> Result<()> {
        if self.server.port == 0 {
            return Err(anyhow::anyhow!("Server port cannot be 0"));
        }

        if self.relay.max_concurrent_sessions == 0 {
            return Err(anyhow::anyhow!(
                "Max concurrent sessions must be greater than 0"
            ));
        }

        if !self.recognizer.url.starts_with("ws://") && !self.recognizer.url.starts_with("wss://") {
            return Err(anyhow::anyhow!(
                "Recognizer URL must be a ws:// or wss:// endpoint, got '{}'",
                self.recognizer.url
            ));
        }

        Ok(())
    }

    /// Apply a partial update from a JSON document, used for runtime config
    /// updates over the REST surface. Only fields present in the JSON change;
    /// the result is re-validated before being accepted.
    ///
    /// Sessions already running keep the settings they started with.
    pub fn update_from_json(&mut self, json_str: &str) -> Result<()> {
        let partial_config: serde_json::Value = serde_json::from_str(json_str)?;

        if let Some(server) = partial_config.get("server") {
            if let Some(host) = server.get("host").and_then(|v| v.as_str()) {
                self.server.host = host.to_string();
            }
            if let Some(port) = server.get("port").and_then(|v| v.as_u64()) {
                self.server.port = port as u16;
            }
        }

        if let Some(recognizer) = partial_config.get("recognizer") {
            if let Some(url) = recognizer.get("url").and_then(|v| v.as_str()) {
                self.recognizer.url = url.to_string();
            }
            if let Some(path) = recognizer.get("credentials_path").and_then(|v| v.as_str()) {
                self.recognizer.credentials_path = path.to_string();
            }
        }

        if let Some(relay) = partial_config.get("relay") {
            if let Some(sessions) = relay
                .get("max_concurrent_sessions")
                .and_then(|v| v.as_u64())
            {
                self.relay.max_concurrent_sessions = sessions as usize;
            }
        }

        self.validate()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = AppConfig::default();
        assert_eq!(config.server.host, "127.0.0.1");
        assert_eq!(config.server.port, 8080);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_validation() {
        let mut config = AppConfig::default();
        config.server.port = 0;
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.relay.max_concurrent_sessions = 0;
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.recognizer.url = "https://not-a-socket.example".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_config_update() {
        let mut config = AppConfig::default();
        let json = r#"{"server": {"port": 9090}, "relay": {"max_concurrent_sessions": 4}}"#;
        assert!(config.update_from_json(json).is_ok());
        assert_eq!(config.server.port, 9090);
        assert_eq!(config.relay.max_concurrent_sessions, 4);
        // Untouched fields keep their values.
        assert_eq!(config.server.host, "127.0.0.1");
    }

    #[test]
    fn test_env_override_reaches_nested_multi_word_field() {
        std::env::set_var("APP_RELAY__MAX_CONCURRENT_SESSIONS", "5");
        let config = AppConfig::load().unwrap();
        std::env::remove_var("APP_RELAY__MAX_CONCURRENT_SESSIONS");

        assert_eq!(config.relay.max_concurrent_sessions, 5);
    }

    #[test]
    fn test_config_update_rejects_invalid_result() {
        let mut config = AppConfig::default();
        let json = r#"{"recognizer": {"url": "ftp://nope"}}"#;
        assert!(config.update_from_json(json).is_err());
    }
}
