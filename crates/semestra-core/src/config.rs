// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Server configuration.

const DEFAULT_BIND_ADDR: &str = "0.0.0.0:7201";

/// Tunables for a [`Server`](crate::Server) instance.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address the TCP listener binds to
    pub bind_addr: String,
    /// How long a fresh connection gets to send its auth request before
    /// being dropped (milliseconds)
    pub handshake_timeout_ms: u64,
    /// Per-request handler deadline passed down to each connection
    pub handler_timeout_ms: u64,
    /// Timeout for server-initiated requests (broadcasts)
    pub request_timeout_ms: u64,
    /// A session with no heartbeat for this long is expired (milliseconds)
    pub session_ttl_ms: i64,
    /// How often clients are expected to heartbeat; the sweeper treats a
    /// session quiet for more than twice this as half-open (milliseconds)
    pub heartbeat_interval_ms: u64,
    /// How often the session sweeper runs
    pub session_sweep_interval_ms: u64,
    /// New connections allowed per source IP per rate window
    pub admission_limit: u32,
    /// Requests allowed per session (or per IP pre-auth) per rate window
    pub request_limit: u32,
    /// Width of both rate-limit windows (milliseconds)
    pub rate_window_ms: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: DEFAULT_BIND_ADDR.to_string(),
            handshake_timeout_ms: 30_000,
            handler_timeout_ms: 30_000,
            request_timeout_ms: 30_000,
            session_ttl_ms: 90_000,
            heartbeat_interval_ms: 30_000,
            session_sweep_interval_ms: 60_000,
            admission_limit: 32,
            request_limit: 120,
            rate_window_ms: 60_000,
        }
    }
}

impl ServerConfig {
    /// Config bound to an ephemeral localhost port. Intended for tests.
    pub fn localhost() -> Self {
        Self {
            bind_addr: "127.0.0.1:0".to_string(),
            ..Self::default()
        }
    }

    /// Build a config from `SEMESTRA_*` environment variables, falling back
    /// to defaults for anything unset or unparseable.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            bind_addr: std::env::var("SEMESTRA_BIND_ADDR").unwrap_or(defaults.bind_addr),
            handshake_timeout_ms: env_u64(
                "SEMESTRA_HANDSHAKE_TIMEOUT_MS",
                defaults.handshake_timeout_ms,
            ),
            handler_timeout_ms: env_u64("SEMESTRA_HANDLER_TIMEOUT_MS", defaults.handler_timeout_ms),
            request_timeout_ms: env_u64("SEMESTRA_REQUEST_TIMEOUT_MS", defaults.request_timeout_ms),
            session_ttl_ms: env_u64("SEMESTRA_SESSION_TTL_MS", defaults.session_ttl_ms as u64)
                as i64,
            heartbeat_interval_ms: env_u64(
                "SEMESTRA_HEARTBEAT_INTERVAL_MS",
                defaults.heartbeat_interval_ms,
            ),
            session_sweep_interval_ms: env_u64(
                "SEMESTRA_SESSION_SWEEP_INTERVAL_MS",
                defaults.session_sweep_interval_ms,
            ),
            admission_limit: env_u32("SEMESTRA_ADMISSION_LIMIT", defaults.admission_limit),
            request_limit: env_u32("SEMESTRA_REQUEST_LIMIT", defaults.request_limit),
            rate_window_ms: env_u64("SEMESTRA_RATE_WINDOW_MS", defaults.rate_window_ms),
        }
    }

    pub fn with_bind_addr(mut self, addr: impl Into<String>) -> Self {
        self.bind_addr = addr.into();
        self
    }

    pub fn with_session_ttl_ms(mut self, ttl_ms: i64) -> Self {
        self.session_ttl_ms = ttl_ms;
        self
    }

    pub fn with_rate_limits(mut self, admission: u32, request: u32) -> Self {
        self.admission_limit = admission;
        self.request_limit = request;
        self
    }

    pub fn with_rate_window_ms(mut self, window_ms: u64) -> Self {
        self.rate_window_ms = window_ms;
        self
    }
}

fn env_u64(name: &str, default: u64) -> u64 {
    std::env::var(name)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_u32(name: &str, default: u32) -> u32 {
    std::env::var(name)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}
