// Copyright (c) 2021 Xu Shaohua <shaohua@biofan.org>. All rights reserved.
// Use of this source is governed by Affero General Public License that can be found
// in the LICENSE file.

use std::fs;
use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::error::Error;

/// Default TCP port the broker listens on when no config file is supplied.
pub const DEFAULT_PORT: u16 = 1883;

/// Keepalive applied when `CONNECT.KeepAlive == 0`.
pub const DEFAULT_KEEP_ALIVE: u64 = 30;

/// Capacity of the lifecycle event channel; overflow drops events.
pub const EVENT_CHANNEL_CAPACITY: usize = 100;

/// Capacity of a client's per-connection delivery channel.
pub const DELIVERY_CHANNEL_CAPACITY: usize = 64;

/// Maximum number of `Session::start` retries before a QoS 1/2 flow fails.
pub const MAX_SESSION_RETRIES: u32 = 5;

/// Seconds to wait for a session ack before retrying or failing.
pub const SESSION_ACK_TIMEOUT_SECS: u64 = 10;

/// Seconds to back off between retries of an unacknowledged packet.
pub const SESSION_RETRY_DELAY_SECS: u64 = 3;

/// Seconds allowed for a client to send CONNECT after the socket is accepted.
pub const HANDSHAKE_TIMEOUT_SECS: u64 = 10;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BasicAuthConfig {
    pub username: String,
    pub password: String,
}

impl Default for BasicAuthConfig {
    fn default() -> Self {
        Self {
            username: String::new(),
            password: String::new(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LoginAuthConfig {
    pub username: String,
    pub password: String,
}

impl Default for LoginAuthConfig {
    fn default() -> Self {
        Self {
            username: String::new(),
            password: String::new(),
        }
    }
}

/// Broker runtime configuration, loaded from a TOML file (see `--config`).
///
/// Every option here corresponds to a row in the external interfaces table;
/// anything not listed there (TLS cert rotation, clustering, persisted
/// sessions) is intentionally absent.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    pub listen_address: String,
    pub default_keep_alive: u64,
    pub event_channel_capacity: usize,
    pub max_session_retries: u32,
    pub session_ack_timeout_secs: u64,
    pub session_retry_delay_secs: u64,
    pub handshake_timeout_secs: u64,
    pub allow_empty_client_id: bool,
    pub basic_auth: Option<BasicAuthConfig>,
    pub login_auth: Option<LoginAuthConfig>,
    /// PEM certificate chain; when set together with `tls_key_path`, `serve()` terminates TLS
    /// instead of speaking plain MQTT.
    pub tls_cert_path: Option<PathBuf>,
    /// PEM private key matching `tls_cert_path`.
    pub tls_key_path: Option<PathBuf>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen_address: format!("0.0.0.0:{DEFAULT_PORT}"),
            default_keep_alive: DEFAULT_KEEP_ALIVE,
            event_channel_capacity: EVENT_CHANNEL_CAPACITY,
            max_session_retries: MAX_SESSION_RETRIES,
            session_ack_timeout_secs: SESSION_ACK_TIMEOUT_SECS,
            session_retry_delay_secs: SESSION_RETRY_DELAY_SECS,
            handshake_timeout_secs: HANDSHAKE_TIMEOUT_SECS,
            allow_empty_client_id: true,
            basic_auth: None,
            login_auth: None,
            tls_cert_path: None,
            tls_key_path: None,
        }
    }
}

impl Config {
    /// Load configuration from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns error if the file cannot be read or fails to parse.
    pub fn load(path: &Path) -> Result<Self, Error> {
        let content = fs::read_to_string(path)?;
        let config: Self = toml::from_str(&content)?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::Config;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.default_keep_alive, 30);
        assert_eq!(config.event_channel_capacity, 100);
        assert_eq!(config.max_session_retries, 5);
    }

    #[test]
    fn test_parse_minimal_toml() {
        let toml_str = r#"
            listen_address = "127.0.0.1:9999"

            [basic_auth]
            username = "user"
            password = "pass"
        "#;
        let config: Config = toml::from_str(toml_str).unwrap();
        assert_eq!(config.listen_address, "127.0.0.1:9999");
        assert_eq!(config.default_keep_alive, 30);
        assert!(config.basic_auth.is_some());
    }
}
