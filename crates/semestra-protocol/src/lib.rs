// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Semestra Protocol - TCP + JSON communication layer
//!
//! This crate provides the wire protocol used between enrollment clients and
//! semestra-core:
//! - Message envelope (request/response union with correlation ids)
//! - Length-prefixed framing over a TCP stream
//! - Full-duplex framed connections with a pending-request table
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                    semestra-protocol                        │
//! ├─────────────────────────────────────────────────────────────┤
//! │  RPC layer: correlated Request/Response, bidirectional      │
//! ├─────────────────────────────────────────────────────────────┤
//! │  Serialization: JSON (serde_json)                           │
//! ├─────────────────────────────────────────────────────────────┤
//! │  Transport: TCP with 4-byte big-endian length prefix        │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Wire format
//!
//! One frame per message: `[4-byte big-endian length][UTF-8 JSON payload]`.
//! The payload object carries `id`, `timestamp`, `version`, `type`
//! (`"req"` or `"res"`), `method`, `params` and, for requests, an optional
//! `sessionToken`. Frames above 8 MiB (or with a zero length prefix) are a
//! fatal protocol error.
//!
//! # Usage
//!
//! ```ignore
//! use semestra_protocol::{Connection, ConnectionConfig, Request};
//!
//! let stream = tokio::net::TcpStream::connect("127.0.0.1:7201").await?;
//! let conn = std::sync::Arc::new(Connection::new(stream, ConnectionConfig::default())?);
//! conn.start(events);
//!
//! let request = Request::new(conn.next_request_id(), "health", serde_json::json!({}));
//! let response = conn.send_request(request).await?;
//! ```

pub mod connection;
pub mod envelope;
pub mod frame;

// Re-export main types
pub use connection::{Connection, ConnectionConfig, ConnectionError, ConnectionEvents};
pub use envelope::{Message, Request, Response, PROTOCOL_VERSION};
pub use frame::{FrameError, HEADER_SIZE, MAX_FRAME_SIZE, read_frame, write_frame};
