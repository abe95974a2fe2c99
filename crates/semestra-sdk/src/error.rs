// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! SDK error types.

use semestra_protocol::ConnectionError;

#[derive(Debug, thiserror::Error)]
pub enum SdkError {
    #[error("connection error: {0}")]
    Connection(#[from] ConnectionError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("connect timed out")]
    ConnectTimeout,

    #[error("not connected")]
    NotConnected,

    #[error("not authenticated")]
    NotAuthenticated,

    /// The server rejected the credentials themselves. Retrying with the
    /// same credentials cannot succeed.
    #[error("authentication rejected: {0}")]
    AuthRejected(String),

    #[error("a connection attempt is already in progress")]
    AlreadyConnecting,

    /// An error response from the server for an otherwise healthy call.
    #[error("server error: {0}")]
    Server(String),
}

impl SdkError {
    /// Whether the reconnect loop should keep retrying after this failure.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, SdkError::AuthRejected(_) | SdkError::AlreadyConnecting)
    }
}
