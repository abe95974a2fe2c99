// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Shared harness: a real server with a small credential table.

#![allow(dead_code)]

use semestra_core::{Server, ServerConfig, ServerError};
use semestra_sdk::SdkConfig;
use serde_json::json;

/// Start a server that knows two users: `studentA`/`pw` and `lecturerB`/`pw`.
pub async fn start_server(config: ServerConfig) -> Server {
    let server = Server::new(config);
    server.register("auth", |params, _ctx| async move {
        let email = params["email"].as_str().unwrap_or_default();
        let password = params["password"].as_str().unwrap_or_default();
        let (uuid, user_type) = match email {
            "studentA" => ("u-student-a", "student"),
            "lecturerB" => ("u-lecturer-b", "lecturer"),
            _ => return Err(ServerError::handler("User not found")),
        };
        if password != "pw" {
            return Err(ServerError::handler("Invalid password"));
        }
        Ok(json!({ "uuid": uuid, "userType": user_type }))
    });
    server.register("enroll", |params, ctx| async move {
        let session = ctx.session.ok_or(ServerError::InvalidSession)?;
        Ok(json!({ "enrolled": params["course"], "by": session.uuid }))
    });
    server.start().await.unwrap();
    server
}

/// Client config pointed at a started server, with fast retries for tests.
pub fn client_config_for(server: &Server) -> SdkConfig {
    let addr = server.local_addr().unwrap();
    SdkConfig::localhost()
        .with_addr(addr.ip().to_string(), addr.port())
        .with_credentials("studentA", "pw")
        .with_reconnect_delays_ms(100, 800)
}
