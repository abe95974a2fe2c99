// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! End-to-end tests for the server runtime, driven by raw protocol
//! connections.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;
use tokio::net::TcpStream;
use tokio::sync::mpsc;

use semestra_core::{Server, ServerConfig, ServerError};
use semestra_protocol::{
    Connection, ConnectionConfig, ConnectionEvents, Request, Response, frame,
};

/// Client-side events: acknowledges every server-initiated request and
/// forwards it to a channel for inspection.
struct CollectingEvents {
    inbound: mpsc::UnboundedSender<Request>,
}

#[async_trait]
impl ConnectionEvents for CollectingEvents {
    async fn handle_request(
        &self,
        _conn: Arc<Connection>,
        request: Request,
    ) -> Result<serde_json::Value, String> {
        let _ = self.inbound.send(request);
        Ok(json!({}))
    }

    async fn on_disconnect(&self, _conn: Arc<Connection>) {}
}

/// Start a server with a two-user credential table.
async fn start_test_server(config: ServerConfig) -> Server {
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
        Ok(json!({
            "enrolled": params["course"],
            "by": session.uuid,
        }))
    });
    server.start().await.unwrap();
    server
}

/// Connect, start the read loop, and authenticate. Returns the connection,
/// the session token, and a receiver of server-initiated requests.
async fn connect_and_auth(
    server: &Server,
    email: &str,
    password: &str,
) -> (Arc<Connection>, String, mpsc::UnboundedReceiver<Request>) {
    let addr = server.local_addr().unwrap();
    let stream = TcpStream::connect(addr).await.unwrap();
    let conn = Arc::new(Connection::new(stream, ConnectionConfig::default()).unwrap());
    let (tx, rx) = mpsc::unbounded_channel();
    conn.start(Arc::new(CollectingEvents { inbound: tx }));

    let response = conn
        .send_request(Request::new(
            conn.next_request_id(),
            "auth",
            json!({ "email": email, "password": password }),
        ))
        .await
        .unwrap();
    assert!(response.is_success(), "auth failed: {:?}", response.error_message());
    let token = response.params["sessionToken"].as_str().unwrap().to_string();
    (conn, token, rx)
}

async fn call(
    conn: &Arc<Connection>,
    token: &str,
    method: &str,
    params: serde_json::Value,
) -> Response {
    conn.send_request(Request::with_session(
        conn.next_request_id(),
        method,
        params,
        token,
    ))
    .await
    .unwrap()
}

#[tokio::test]
async fn test_auth_handshake_mints_session() {
    let server = start_test_server(ServerConfig::localhost()).await;
    let addr = server.local_addr().unwrap();
    let stream = TcpStream::connect(addr).await.unwrap();
    let conn = Arc::new(Connection::new(stream, ConnectionConfig::default()).unwrap());
    let (tx, _rx) = mpsc::unbounded_channel();
    conn.start(Arc::new(CollectingEvents { inbound: tx }));

    let response = conn
        .send_request(Request::new(
            conn.next_request_id(),
            "auth",
            json!({ "email": "studentA", "password": "pw" }),
        ))
        .await
        .unwrap();

    assert!(response.is_success());
    assert_eq!(response.params["uuid"], "u-student-a");
    assert_eq!(response.params["userType"], "student");
    assert!(!response.params["sessionToken"].as_str().unwrap().is_empty());
    assert_eq!(server.sessions().len(), 1);
    server.close().await;
}

#[tokio::test]
async fn test_auth_rejects_bad_credentials() {
    let server = start_test_server(ServerConfig::localhost()).await;
    let addr = server.local_addr().unwrap();

    for (email, password, expected) in [
        ("nobody", "pw", "User not found"),
        ("studentA", "wrong", "Invalid password"),
    ] {
        let stream = TcpStream::connect(addr).await.unwrap();
        let conn = Arc::new(Connection::new(stream, ConnectionConfig::default()).unwrap());
        let (tx, _rx) = mpsc::unbounded_channel();
        conn.start(Arc::new(CollectingEvents { inbound: tx }));

        let response = conn
            .send_request(Request::new(
                conn.next_request_id(),
                "auth",
                json!({ "email": email, "password": password }),
            ))
            .await
            .unwrap();
        assert!(!response.is_success());
        assert_eq!(response.error_message(), Some(expected));
    }
    assert_eq!(server.sessions().len(), 0);
    server.close().await;
}

#[tokio::test]
async fn test_health_returns_server_time() {
    let server = start_test_server(ServerConfig::localhost()).await;
    let (conn, token, _rx) = connect_and_auth(&server, "studentA", "pw").await;

    let response = call(&conn, &token, "health", json!({})).await;
    assert!(response.is_success());
    assert_eq!(response.params["status"], "ok");
    assert!(response.params["serverTime"].as_i64().unwrap() > 0);
    server.close().await;
}

#[tokio::test]
async fn test_registered_handler_sees_session_context() {
    let server = start_test_server(ServerConfig::localhost()).await;
    let (conn, token, _rx) = connect_and_auth(&server, "studentA", "pw").await;

    let response = call(&conn, &token, "enroll", json!({ "course": "CS-101" })).await;
    assert!(response.is_success());
    assert_eq!(response.params["enrolled"], "CS-101");
    assert_eq!(response.params["by"], "u-student-a");
    server.close().await;
}

#[tokio::test]
async fn test_missing_or_bogus_token_rejected() {
    let server = start_test_server(ServerConfig::localhost()).await;
    let (conn, _token, _rx) = connect_and_auth(&server, "studentA", "pw").await;

    // No token at all.
    let response = conn
        .send_request(Request::new(conn.next_request_id(), "health", json!({})))
        .await
        .unwrap();
    assert_eq!(response.error_message(), Some("Invalid session"));

    // A token the server never minted.
    let response = call(&conn, "deadbeef", "health", json!({})).await;
    assert_eq!(response.error_message(), Some("Invalid session"));
    server.close().await;
}

#[tokio::test]
async fn test_expired_session_is_not_renewed_by_failing_request() {
    let config = ServerConfig::localhost().with_session_ttl_ms(150);
    let server = start_test_server(config).await;
    let (conn, token, _rx) = connect_and_auth(&server, "studentA", "pw").await;

    tokio::time::sleep(Duration::from_millis(300)).await;
    let response = call(&conn, &token, "health", json!({})).await;
    assert_eq!(response.error_message(), Some("Invalid session"));

    // The failed request must not have refreshed the heartbeat.
    let response = call(&conn, &token, "health", json!({})).await;
    assert_eq!(response.error_message(), Some("Invalid session"));
    server.close().await;
}

#[tokio::test]
async fn test_unknown_method() {
    let server = start_test_server(ServerConfig::localhost()).await;
    let (conn, token, _rx) = connect_and_auth(&server, "studentA", "pw").await;

    let response = call(&conn, &token, "dropAllCourses", json!({})).await;
    assert_eq!(
        response.error_message(),
        Some("Unknown method: dropAllCourses")
    );
    server.close().await;
}

#[tokio::test]
async fn test_request_rate_limit() {
    let config = ServerConfig::localhost().with_rate_limits(32, 3);
    let server = start_test_server(config).await;
    let (conn, token, _rx) = connect_and_auth(&server, "studentA", "pw").await;

    for _ in 0..3 {
        let response = call(&conn, &token, "health", json!({})).await;
        assert!(response.is_success());
    }
    let response = call(&conn, &token, "health", json!({})).await;
    assert_eq!(response.error_message(), Some("Rate limited"));
    server.close().await;
}

#[tokio::test]
async fn test_admission_rate_limit_drops_connection() {
    let config = ServerConfig::localhost().with_rate_limits(2, 120);
    let server = start_test_server(config).await;
    let addr = server.local_addr().unwrap();

    let _first = TcpStream::connect(addr).await.unwrap();
    let _second = TcpStream::connect(addr).await.unwrap();
    let mut third = TcpStream::connect(addr).await.unwrap();

    // The third connection is dropped before any handshake; reading from it
    // sees a closed stream.
    frame::write_frame(
        &mut third,
        &semestra_protocol::Message::Request(Request::new(1, "auth", json!({}))),
    )
    .await
    .ok();
    let result = tokio::time::timeout(Duration::from_secs(2), frame::read_frame(&mut third)).await;
    match result {
        Ok(Err(_)) => {}
        other => panic!("expected closed stream, got {:?}", other.is_ok()),
    }
    server.close().await;
}

#[tokio::test]
async fn test_broadcast_respects_tags() {
    let server = start_test_server(ServerConfig::localhost()).await;
    let (_conn_a, token_a, mut rx_a) = connect_and_auth(&server, "studentA", "pw").await;
    let (_conn_b, _token_b, mut rx_b) = connect_and_auth(&server, "lecturerB", "pw").await;

    server
        .sessions()
        .add_tags(&token_a, &["cs-101".to_string()]);

    let targeted = server.broadcast(
        "courseUpdated",
        json!({ "course": "CS-101", "seats": 3 }),
        &["cs-101".to_string()],
    );
    assert_eq!(targeted, 1);

    let received = tokio::time::timeout(Duration::from_secs(2), rx_a.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(received.method, "courseUpdated");
    assert_eq!(received.params["seats"], 3);

    // The untagged client must see nothing.
    let nothing = tokio::time::timeout(Duration::from_millis(200), rx_b.recv()).await;
    assert!(nothing.is_err());
    server.close().await;
}

#[tokio::test]
async fn test_broadcast_without_tags_reaches_everyone() {
    let server = start_test_server(ServerConfig::localhost()).await;
    let (_conn_a, _token_a, mut rx_a) = connect_and_auth(&server, "studentA", "pw").await;
    let (_conn_b, _token_b, mut rx_b) = connect_and_auth(&server, "lecturerB", "pw").await;

    let targeted = server.broadcast("maintenance", json!({ "at": "02:00" }), &[]);
    assert_eq!(targeted, 2);

    for rx in [&mut rx_a, &mut rx_b] {
        let received = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(received.method, "maintenance");
    }
    server.close().await;
}

#[tokio::test]
async fn test_logout_invalidates_session() {
    let server = start_test_server(ServerConfig::localhost()).await;
    let (conn, token, _rx) = connect_and_auth(&server, "studentA", "pw").await;

    let response = call(&conn, &token, "logout", json!({})).await;
    assert!(response.is_success());
    assert_eq!(server.sessions().len(), 0);

    let response = call(&conn, &token, "health", json!({})).await;
    assert_eq!(response.error_message(), Some("Invalid session"));
    server.close().await;
}

#[tokio::test]
async fn test_reauth_replaces_session() {
    let server = start_test_server(ServerConfig::localhost()).await;
    let (conn, old_token, _rx) = connect_and_auth(&server, "studentA", "pw").await;

    let response = call(
        &conn,
        &old_token,
        "auth",
        json!({ "email": "lecturerB", "password": "pw" }),
    )
    .await;
    assert!(response.is_success());
    let new_token = response.params["sessionToken"].as_str().unwrap().to_string();
    assert_ne!(new_token, old_token);
    assert_eq!(server.sessions().len(), 1);

    let response = call(&conn, &old_token, "health", json!({})).await;
    assert_eq!(response.error_message(), Some("Invalid session"));
    let response = call(&conn, &new_token, "health", json!({})).await;
    assert!(response.is_success());
    server.close().await;
}

#[tokio::test]
async fn test_disconnect_cleans_up_session() {
    let server = start_test_server(ServerConfig::localhost()).await;
    let (conn, _token, _rx) = connect_and_auth(&server, "studentA", "pw").await;
    assert_eq!(server.sessions().len(), 1);

    conn.close().await;
    drop(conn);

    // Give the server's read loop a moment to observe the disconnect.
    for _ in 0..50 {
        if server.sessions().is_empty() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert!(server.sessions().is_empty());
    assert_eq!(server.connection_count(), 0);
    server.close().await;
}
