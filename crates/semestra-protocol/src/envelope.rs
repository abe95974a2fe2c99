// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Message envelope for the semestra wire protocol.
//!
//! Every frame on the wire carries exactly one [`Message`]: a request or a
//! response, discriminated by the `type` field (`"req"` / `"res"`). Responses
//! copy the originating request's `id`, which is how the connection layer
//! correlates them; ids are unique per sender direction.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Protocol version carried in every envelope.
pub const PROTOCOL_VERSION: &str = "1.0";

/// Wire-level message union. The `type` discriminator is read first to select
/// request vs response decoding.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Message {
    /// Client-to-server (or broadcast server-to-client) call
    #[serde(rename = "req")]
    Request(Request),
    /// Terminal answer for a request id
    #[serde(rename = "res")]
    Response(Response),
}

impl Message {
    /// The correlation id of the wrapped message.
    pub fn id(&self) -> u64 {
        match self {
            Message::Request(req) => req.id,
            Message::Response(res) => res.id,
        }
    }
}

/// A typed request. `session_token` is absent only for the initial `"auth"`
/// call on a fresh connection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Request {
    pub id: u64,
    /// Milliseconds since epoch at send time
    pub timestamp: i64,
    pub version: String,
    pub method: String,
    pub params: Value,
    #[serde(
        rename = "sessionToken",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub session_token: Option<String>,
}

impl Request {
    /// Create an unauthenticated request (handshake use).
    pub fn new(id: u64, method: impl Into<String>, params: Value) -> Self {
        Self {
            id,
            timestamp: chrono::Utc::now().timestamp_millis(),
            version: PROTOCOL_VERSION.to_string(),
            method: method.into(),
            params,
            session_token: None,
        }
    }

    /// Create a session-bound request.
    pub fn with_session(
        id: u64,
        method: impl Into<String>,
        params: Value,
        session_token: impl Into<String>,
    ) -> Self {
        Self {
            session_token: Some(session_token.into()),
            ..Self::new(id, method, params)
        }
    }
}

/// A response. `method` is `"success"` or `"error"`; error params carry a
/// `message` field with a human-readable reason.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Response {
    pub id: u64,
    /// Milliseconds since epoch at send time
    pub timestamp: i64,
    pub version: String,
    pub method: String,
    pub params: Value,
}

impl Response {
    /// Create a success response for the given request id.
    pub fn success(id: u64, params: Value) -> Self {
        Self {
            id,
            timestamp: chrono::Utc::now().timestamp_millis(),
            version: PROTOCOL_VERSION.to_string(),
            method: "success".to_string(),
            params,
        }
    }

    /// Create an error response carrying the given message.
    pub fn error(id: u64, message: impl Into<String>) -> Self {
        Self {
            id,
            timestamp: chrono::Utc::now().timestamp_millis(),
            version: PROTOCOL_VERSION.to_string(),
            method: "error".to_string(),
            params: serde_json::json!({ "message": message.into() }),
        }
    }

    pub fn is_success(&self) -> bool {
        self.method == "success"
    }

    /// The error message, if this is an error response.
    pub fn error_message(&self) -> Option<&str> {
        if self.is_success() {
            return None;
        }
        self.params.get("message").and_then(Value::as_str)
    }
}
