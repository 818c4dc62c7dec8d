// SPDX-FileCopyrightText: 2026 Mattia Egloff <mattia.egloff@pm.me>
//
// SPDX-License-Identifier: GPL-3.0-or-later

//! Relay Configuration
//!
//! Server location, credentials and the tunables of the socket, receiver
//! and account manager.

use std::time::Duration;

use crate::error::{RelayError, RelayResult};
use crate::network::{KeepaliveOptions, SocketOptions, TransportConfig};

/// Environment variable names read by [`RelayConfig::from_env`].
pub mod env_vars {
    pub const SERVER_URL: &str = "RELAY_SERVER_URL";
    pub const USERNAME: &str = "RELAY_USERNAME";
    pub const PASSWORD: &str = "RELAY_PASSWORD";
    pub const LAST_RESORT_KEY: &str = "RELAY_LAST_RESORT_KEY";
}

/// Configuration shared by every component through the
/// [`RelayContext`](crate::RelayContext).
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// HTTP(S) base URL of the relay server.
    pub server_url: String,
    /// `addr.deviceId` login, once registered.
    pub username: Option<String>,
    pub password: Option<String>,
    /// Keepalive path of the message socket.
    pub keepalive_path: String,
    /// Keepalive path of the provisioning socket.
    pub provisioning_keepalive_path: String,
    /// Regenerate prekeys when the server holds this many or fewer.
    pub pre_key_low_water: u32,
    /// Number of one-time prekeys per generation.
    pub pre_key_high_water: u32,
    /// Publish a fixed-id fallback prekey alongside the one-time pool.
    pub last_resort_key: bool,
    /// Delay after the last processed envelope before the receiver goes idle.
    pub idle_debounce: Duration,
    /// Sent inside provisioning messages when linking a device.
    pub user_agent: String,
    /// Scheme of the provisioning link shown to the primary device.
    pub provisioning_scheme: String,
    /// Socket connect timeout.
    pub connect_timeout_ms: u64,
}

impl Default for RelayConfig {
    fn default() -> Self {
        RelayConfig {
            server_url: "https://relay.example.com".to_string(),
            username: None,
            password: None,
            keepalive_path: "/v1/keepalive".to_string(),
            provisioning_keepalive_path: "/v1/keepalive/provisioning".to_string(),
            pre_key_low_water: 10,
            pre_key_high_water: 100,
            last_resort_key: false,
            idle_debounce: Duration::from_millis(1000),
            user_agent: concat!("relay-core/", env!("CARGO_PKG_VERSION")).to_string(),
            provisioning_scheme: "tsdevice".to_string(),
            connect_timeout_ms: 10_000,
        }
    }
}

impl RelayConfig {
    pub fn builder() -> RelayConfigBuilder {
        RelayConfigBuilder::new()
    }

    /// Defaults overridden by `RELAY_*` environment variables.
    pub fn from_env() -> RelayResult<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Like [`from_env`](Self::from_env) with an injectable lookup.
    pub fn from_lookup<F>(lookup: F) -> RelayResult<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = RelayConfig::default();
        if let Some(url) = lookup(env_vars::SERVER_URL) {
            config.server_url = url;
        }
        config.username = lookup(env_vars::USERNAME);
        config.password = lookup(env_vars::PASSWORD);
        if let Some(flag) = lookup(env_vars::LAST_RESORT_KEY) {
            config.last_resort_key = parse_flag(&flag).ok_or_else(|| {
                RelayError::Validation(format!(
                    "{} must be a boolean, got {flag:?}",
                    env_vars::LAST_RESORT_KEY
                ))
            })?;
        }
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> RelayResult<()> {
        let url = url::Url::parse(&self.server_url)
            .map_err(|e| RelayError::Validation(format!("invalid server url: {e}")))?;
        if !matches!(url.scheme(), "http" | "https") {
            return Err(RelayError::Validation(format!(
                "server url must be http(s), got {}",
                url.scheme()
            )));
        }
        if self.pre_key_high_water == 0 {
            return Err(RelayError::Validation(
                "pre_key_high_water must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    fn socket_base(&self) -> String {
        let base = self.server_url.trim_end_matches('/');
        if let Some(rest) = base.strip_prefix("https://") {
            format!("wss://{rest}")
        } else if let Some(rest) = base.strip_prefix("http://") {
            format!("ws://{rest}")
        } else {
            base.to_string()
        }
    }

    /// Authenticated URL of the message socket.
    pub fn message_socket_url(&self) -> RelayResult<String> {
        let (username, password) = self.credentials()?;
        let query = url::form_urlencoded::Serializer::new(String::new())
            .append_pair("login", username)
            .append_pair("password", password)
            .finish();
        Ok(format!("{}/v1/websocket/?{}", self.socket_base(), query))
    }

    /// Unauthenticated URL of the provisioning socket.
    pub fn provisioning_socket_url(&self) -> String {
        format!("{}/v1/websocket/provisioning/", self.socket_base())
    }

    pub fn credentials(&self) -> RelayResult<(&str, &str)> {
        match (&self.username, &self.password) {
            (Some(username), Some(password)) => Ok((username, password)),
            _ => Err(RelayError::InvalidState(
                "no credentials configured".to_string(),
            )),
        }
    }

    /// Socket options for the message socket.
    pub fn message_socket_options(&self) -> RelayResult<SocketOptions> {
        Ok(self.socket_options(&self.message_socket_url()?, &self.keepalive_path))
    }

    /// Socket options for the provisioning socket.
    pub fn provisioning_socket_options(&self) -> SocketOptions {
        let url = self.provisioning_socket_url();
        self.socket_options(&url, &self.provisioning_keepalive_path)
    }

    fn socket_options(&self, url: &str, keepalive_path: &str) -> SocketOptions {
        SocketOptions {
            transport: TransportConfig {
                server_url: url.to_string(),
                connect_timeout_ms: self.connect_timeout_ms,
            },
            keepalive: Some(KeepaliveOptions::with_path(keepalive_path)),
            ..Default::default()
        }
    }
}

fn parse_flag(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" | "" => Some(false),
        _ => None,
    }
}

/// Builder for [`RelayConfig`].
#[derive(Debug, Clone, Default)]
pub struct RelayConfigBuilder {
    config: RelayConfig,
}

impl RelayConfigBuilder {
    /// Creates a new builder with default configuration.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the server URL.
    pub fn server_url(mut self, url: impl Into<String>) -> Self {
        self.config.server_url = url.into();
        self
    }

    /// Sets the login credentials.
    pub fn credentials(mut self, username: impl Into<String>, password: impl Into<String>) -> Self {
        self.config.username = Some(username.into());
        self.config.password = Some(password.into());
        self
    }

    pub fn pre_key_water_marks(mut self, low: u32, high: u32) -> Self {
        self.config.pre_key_low_water = low;
        self.config.pre_key_high_water = high;
        self
    }

    pub fn last_resort_key(mut self, enabled: bool) -> Self {
        self.config.last_resort_key = enabled;
        self
    }

    pub fn idle_debounce(mut self, debounce: Duration) -> Self {
        self.config.idle_debounce = debounce;
        self
    }

    pub fn user_agent(mut self, user_agent: impl Into<String>) -> Self {
        self.config.user_agent = user_agent.into();
        self
    }

    pub fn provisioning_scheme(mut self, scheme: impl Into<String>) -> Self {
        self.config.provisioning_scheme = scheme.into();
        self
    }

    /// Builds and validates the configuration.
    pub fn build(self) -> RelayResult<RelayConfig> {
        self.config.validate()?;
        Ok(self.config)
    }
}
