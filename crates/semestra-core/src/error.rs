// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Server-side error types.

use semestra_protocol::ConnectionError;

/// Errors produced by the server runtime and by method handlers.
///
/// Variants that reach a client are rendered through `Display`, so the
/// messages here are part of the wire contract.
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error("failed to bind listener: {0}")]
    Bind(#[from] std::io::Error),

    #[error(transparent)]
    Connection(#[from] ConnectionError),

    /// Application-level handler failure. Rendered bare so handlers control
    /// the exact message the client sees (e.g. "Invalid password").
    #[error("{0}")]
    Handler(String),

    #[error("Unknown method: {0}")]
    UnknownMethod(String),

    #[error("Invalid session")]
    InvalidSession,

    #[error("Rate limited")]
    RateLimited,

    #[error("server is not running")]
    NotRunning,
}

impl ServerError {
    /// Convenience constructor for handler failures.
    pub fn handler(message: impl Into<String>) -> Self {
        Self::Handler(message.into())
    }
}
