// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Semestra server runtime.
//!
//! Hosts the enrollment RPC surface on top of `semestra-protocol`:
//!
//! ```text
//!   TcpListener
//!       |  accept (per-IP admission limiting)
//!       v
//!   auth handshake ---- auth handler ----> session minted
//!       |                                      |
//!       v                                      v
//!   Connection read loop --> method registry   SessionManager (TTL sweeps)
//!       |                        |
//!       v                        v
//!   request limiter          handlers(params, RequestContext)
//! ```
//!
//! Applications register async handlers by method name and must provide an
//! `auth` handler that validates credentials and returns the user's `uuid`
//! and `userType`. The runtime mints the session token itself.
//!
//! ## Example
//!
//! ```no_run
//! use semestra_core::{Server, ServerConfig, ServerError};
//! use serde_json::json;
//!
//! # async fn run() -> Result<(), ServerError> {
//! let server = Server::new(ServerConfig::default());
//! server.register("auth", |params, _ctx| async move {
//!     let email = params["email"].as_str().unwrap_or_default();
//!     if email.is_empty() {
//!         return Err(ServerError::handler("User not found"));
//!     }
//!     Ok(json!({ "uuid": email, "userType": "student" }))
//! });
//! server.start().await?;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod error;
pub mod rate_limit;
pub mod server;
pub mod session;

pub use config::ServerConfig;
pub use error::ServerError;
pub use rate_limit::RateLimiter;
pub use server::{MethodHandler, RequestContext, Server};
pub use session::{SessionInfo, SessionManager};
