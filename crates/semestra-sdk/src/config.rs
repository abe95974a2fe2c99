// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Client configuration.

const DEFAULT_PORT: u16 = 7201;

/// Connection and retry tunables for a [`SemestraClient`](crate::SemestraClient).
#[derive(Debug, Clone)]
pub struct SdkConfig {
    pub host: String,
    pub port: u16,
    /// Credentials replayed on every (re)connect
    pub email: String,
    pub password: String,
    /// TCP connect deadline (milliseconds)
    pub connect_timeout_ms: u64,
    /// Per-request response deadline (milliseconds)
    pub request_timeout_ms: u64,
    /// Gap between heartbeat health calls (milliseconds)
    pub heartbeat_interval_ms: u64,
    /// First reconnect backoff delay; doubles per failed attempt
    pub reconnect_base_delay_ms: u64,
    /// Backoff ceiling (milliseconds)
    pub reconnect_max_delay_ms: u64,
}

impl Default for SdkConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: DEFAULT_PORT,
            email: String::new(),
            password: String::new(),
            connect_timeout_ms: 5_000,
            request_timeout_ms: 30_000,
            heartbeat_interval_ms: 30_000,
            reconnect_base_delay_ms: 1_000,
            reconnect_max_delay_ms: 60_000,
        }
    }
}

impl SdkConfig {
    /// Config pointed at a local server. Intended for tests and development.
    pub fn localhost() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            ..Self::default()
        }
    }

    /// Build a config from `SEMESTRA_*` environment variables, falling back
    /// to defaults for anything unset or unparseable.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            host: std::env::var("SEMESTRA_HOST").unwrap_or(defaults.host),
            port: env_parse("SEMESTRA_PORT", defaults.port),
            email: std::env::var("SEMESTRA_EMAIL").unwrap_or(defaults.email),
            password: std::env::var("SEMESTRA_PASSWORD").unwrap_or(defaults.password),
            connect_timeout_ms: env_parse("SEMESTRA_CONNECT_TIMEOUT_MS", defaults.connect_timeout_ms),
            request_timeout_ms: env_parse("SEMESTRA_REQUEST_TIMEOUT_MS", defaults.request_timeout_ms),
            heartbeat_interval_ms: env_parse(
                "SEMESTRA_HEARTBEAT_INTERVAL_MS",
                defaults.heartbeat_interval_ms,
            ),
            reconnect_base_delay_ms: env_parse(
                "SEMESTRA_RECONNECT_BASE_DELAY_MS",
                defaults.reconnect_base_delay_ms,
            ),
            reconnect_max_delay_ms: env_parse(
                "SEMESTRA_RECONNECT_MAX_DELAY_MS",
                defaults.reconnect_max_delay_ms,
            ),
        }
    }

    pub fn with_addr(mut self, host: impl Into<String>, port: u16) -> Self {
        self.host = host.into();
        self.port = port;
        self
    }

    pub fn with_credentials(mut self, email: impl Into<String>, password: impl Into<String>) -> Self {
        self.email = email.into();
        self.password = password.into();
        self
    }

    pub fn with_heartbeat_interval_ms(mut self, interval_ms: u64) -> Self {
        self.heartbeat_interval_ms = interval_ms;
        self
    }

    pub fn with_request_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.request_timeout_ms = timeout_ms;
        self
    }

    pub fn with_reconnect_delays_ms(mut self, base_ms: u64, max_ms: u64) -> Self {
        self.reconnect_base_delay_ms = base_ms;
        self.reconnect_max_delay_ms = max_ms;
        self
    }
}

fn env_parse<T: std::str::FromStr>(name: &str, default: T) -> T {
    std::env::var(name)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}
