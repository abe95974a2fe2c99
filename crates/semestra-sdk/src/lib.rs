// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Client SDK for Semestra enrollment servers.
//!
//! The SDK wraps `semestra-protocol` in a self-healing client: one call to
//! [`SemestraClient::connect`] establishes the connection, authenticates, and
//! from then on the client keeps itself alive with heartbeats and automatic
//! reconnection. Application code only sees [`SemestraClient::call`] and the
//! broadcast channel.
//!
//! ## Example
//!
//! ```no_run
//! use semestra_sdk::{SdkConfig, SemestraClient};
//! use serde_json::json;
//!
//! # async fn run() -> Result<(), semestra_sdk::SdkError> {
//! let config = SdkConfig::localhost().with_credentials("studentA", "pw");
//! let client = SemestraClient::new(config);
//! client.connect().await?;
//!
//! let result = client.call("enroll", json!({ "course": "CS-101" })).await?;
//! println!("enrolled: {result}");
//!
//! client.logout().await;
//! # Ok(())
//! # }
//! ```

pub mod client;
pub mod config;
pub mod error;

pub use client::{SemestraClient, SessionIdentity};
pub use config::SdkConfig;
pub use error::SdkError;
