// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! The client runtime.
//!
//! A [`SemestraClient`] owns one connection to an enrollment server and keeps
//! it alive: it authenticates on connect, sends periodic health heartbeats,
//! and when the connection drops it re-dials with doubling backoff and
//! re-authenticates with the configured credentials. Server-initiated
//! requests (broadcasts) are acknowledged automatically and surfaced through
//! a channel.
//!
//! Reconnection stops only for credential rejections; network failures retry
//! forever until [`SemestraClient::close`].

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use semestra_protocol::{
    Connection, ConnectionConfig, ConnectionEvents, Request,
};
use serde_json::{Value, json};
use tokio::net::TcpStream;
use tokio::sync::{RwLock, mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::SdkConfig;
use crate::error::SdkError;

/// Who the server says we are, as of the last successful auth.
#[derive(Debug, Clone)]
pub struct SessionIdentity {
    pub token: String,
    pub user_id: String,
    pub user_type: String,
}

struct ClientInner {
    config: SdkConfig,
    connection: RwLock<Option<Arc<Connection>>>,
    identity: std::sync::RwLock<Option<SessionIdentity>>,
    auth_tx: watch::Sender<bool>,
    running: AtomicBool,
    reconnecting: AtomicBool,
    heartbeat_task: std::sync::Mutex<Option<JoinHandle<()>>>,
    broadcast_tx: mpsc::UnboundedSender<Request>,
    broadcast_rx: std::sync::Mutex<Option<mpsc::UnboundedReceiver<Request>>>,
}

/// Client handle. Cheap to clone; clones share one connection.
#[derive(Clone)]
pub struct SemestraClient {
    inner: Arc<ClientInner>,
}

impl SemestraClient {
    pub fn new(config: SdkConfig) -> Self {
        let (auth_tx, _) = watch::channel(false);
        let (broadcast_tx, broadcast_rx) = mpsc::unbounded_channel();
        Self {
            inner: Arc::new(ClientInner {
                config,
                connection: RwLock::new(None),
                identity: std::sync::RwLock::new(None),
                auth_tx,
                running: AtomicBool::new(false),
                reconnecting: AtomicBool::new(false),
                heartbeat_task: std::sync::Mutex::new(None),
                broadcast_tx,
                broadcast_rx: std::sync::Mutex::new(Some(broadcast_rx)),
            }),
        }
    }

    /// Dial and authenticate, retrying with backoff until either succeeds
    /// or the server rejects the credentials outright.
    pub async fn connect(&self) -> Result<(), SdkError> {
        self.inner.running.store(true, Ordering::SeqCst);
        if self
            .inner
            .reconnecting
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(SdkError::AlreadyConnecting);
        }
        connect_loop(Arc::clone(&self.inner)).await
    }

    /// Watchable authentication state. `true` while a live authenticated
    /// connection exists.
    pub fn auth_state(&self) -> watch::Receiver<bool> {
        self.inner.auth_tx.subscribe()
    }

    pub fn is_authenticated(&self) -> bool {
        *self.inner.auth_tx.borrow()
    }

    pub fn identity(&self) -> Option<SessionIdentity> {
        self.inner.identity.read().ok().and_then(|g| g.clone())
    }

    /// Receiver of server-initiated requests. Can be taken once.
    pub fn broadcasts(&self) -> Option<mpsc::UnboundedReceiver<Request>> {
        self.inner.broadcast_rx.lock().ok().and_then(|mut g| g.take())
    }

    /// Invoke a method on the server with the current session attached.
    pub async fn call(&self, method: &str, params: Value) -> Result<Value, SdkError> {
        client_call(&self.inner, method, params).await
    }

    /// Tell the server to drop our session, then disconnect. The logout
    /// request is best-effort.
    pub async fn logout(&self) {
        if let Err(e) = self.call("logout", json!({})).await {
            debug!(error = %e, "logout request failed");
        }
        self.close().await;
    }

    /// Disconnect and stop all background work. Idempotent.
    pub async fn close(&self) {
        self.inner.running.store(false, Ordering::SeqCst);
        if let Ok(mut guard) = self.inner.heartbeat_task.lock()
            && let Some(handle) = guard.take()
        {
            handle.abort();
        }
        if let Some(conn) = self.inner.connection.write().await.take() {
            conn.close().await;
        }
        if let Ok(mut guard) = self.inner.identity.write() {
            *guard = None;
        }
        self.inner.auth_tx.send_replace(false);
        info!("client closed");
    }
}

async fn client_call(
    inner: &Arc<ClientInner>,
    method: &str,
    params: Value,
) -> Result<Value, SdkError> {
    let conn = inner
        .connection
        .read()
        .await
        .clone()
        .ok_or(SdkError::NotConnected)?;
    let token = inner
        .identity
        .read()
        .ok()
        .and_then(|g| g.as_ref().map(|i| i.token.clone()))
        .ok_or(SdkError::NotAuthenticated)?;

    let request = Request::with_session(conn.next_request_id(), method, params, token);
    let response = conn.send_request(request).await?;
    if response.is_success() {
        Ok(response.params)
    } else {
        let message = response
            .error_message()
            .unwrap_or("unknown server error")
            .to_string();
        Err(SdkError::Server(message))
    }
}

/// Retry `attempt_connect` with doubling backoff. Returns on success, on a
/// terminal credential rejection, or once the client is closed.
async fn connect_loop(inner: Arc<ClientInner>) -> Result<(), SdkError> {
    let mut delay = Duration::from_millis(inner.config.reconnect_base_delay_ms);
    let max_delay = Duration::from_millis(inner.config.reconnect_max_delay_ms);
    loop {
        if !inner.running.load(Ordering::SeqCst) {
            inner.reconnecting.store(false, Ordering::SeqCst);
            return Err(SdkError::NotConnected);
        }
        match attempt_connect(&inner).await {
            Ok(()) => {
                inner.reconnecting.store(false, Ordering::SeqCst);
                return Ok(());
            }
            Err(e) if !e.is_retryable() => {
                inner.reconnecting.store(false, Ordering::SeqCst);
                return Err(e);
            }
            Err(e) => {
                warn!(error = %e, delay_ms = delay.as_millis() as u64, "connect attempt failed, retrying");
                tokio::time::sleep(delay).await;
                delay = (delay * 2).min(max_delay);
            }
        }
    }
}

/// One dial-and-auth attempt.
async fn attempt_connect(inner: &Arc<ClientInner>) -> Result<(), SdkError> {
    if let Some(old) = inner.connection.write().await.take() {
        old.close().await;
    }

    let addr = format!("{}:{}", inner.config.host, inner.config.port);
    let stream = tokio::time::timeout(
        Duration::from_millis(inner.config.connect_timeout_ms),
        TcpStream::connect(&addr),
    )
    .await
    .map_err(|_| SdkError::ConnectTimeout)??;

    let conn_config = ConnectionConfig {
        request_timeout_ms: inner.config.request_timeout_ms,
        handler_timeout_ms: inner.config.request_timeout_ms,
    };
    let conn = Arc::new(Connection::new(stream, conn_config)?);
    let events: Arc<dyn ConnectionEvents> = Arc::new(ClientEvents {
        inner: Arc::downgrade(inner),
    });
    conn.start(events);

    // The connect deadline covers the whole attempt: a server that accepts
    // the socket but never answers the auth request must not stall the
    // retry loop for the full request timeout.
    let auth_request = Request::new(
        conn.next_request_id(),
        "auth",
        json!({
            "email": inner.config.email,
            "password": inner.config.password,
        }),
    );
    let response = match tokio::time::timeout(
        Duration::from_millis(inner.config.connect_timeout_ms),
        conn.send_request(auth_request),
    )
    .await
    {
        Ok(result) => result?,
        Err(_) => {
            conn.close().await;
            return Err(SdkError::ConnectTimeout);
        }
    };

    if !response.is_success() {
        let message = response
            .error_message()
            .unwrap_or("authentication failed")
            .to_string();
        conn.close().await;
        if message == "User not found" || message == "Invalid password" {
            return Err(SdkError::AuthRejected(message));
        }
        return Err(SdkError::Server(message));
    }

    let token = response.params["sessionToken"]
        .as_str()
        .ok_or_else(|| SdkError::Server("auth response missing sessionToken".to_string()))?
        .to_string();
    let identity = SessionIdentity {
        token,
        user_id: response.params["uuid"].as_str().unwrap_or_default().to_string(),
        user_type: response.params["userType"]
            .as_str()
            .unwrap_or_default()
            .to_string(),
    };

    *inner.connection.write().await = Some(Arc::clone(&conn));
    if let Ok(mut guard) = inner.identity.write() {
        *guard = Some(identity);
    }
    inner.auth_tx.send_replace(true);
    start_heartbeat(inner);
    info!(%addr, "connected and authenticated");
    Ok(())
}

/// (Re)start the heartbeat loop. A failed heartbeat tears the session state
/// down and kicks off reconnection.
fn start_heartbeat(inner: &Arc<ClientInner>) {
    let interval = Duration::from_millis(inner.config.heartbeat_interval_ms);
    let task_inner = Arc::clone(inner);
    let handle = tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.tick().await;
        loop {
            ticker.tick().await;
            if !task_inner.running.load(Ordering::SeqCst) {
                break;
            }
            match client_call(&task_inner, "health", json!({})).await {
                Ok(_) => debug!("heartbeat ok"),
                Err(e) => {
                    warn!(error = %e, "heartbeat failed");
                    schedule_reconnect(&task_inner);
                    break;
                }
            }
        }
    });
    if let Ok(mut guard) = inner.heartbeat_task.lock() {
        if let Some(old) = guard.replace(handle) {
            old.abort();
        }
    }
}

/// Clear session state and spawn the reconnect loop, unless one is already
/// running or the client is closed.
fn schedule_reconnect(inner: &Arc<ClientInner>) {
    if !inner.running.load(Ordering::SeqCst) {
        return;
    }
    if inner
        .reconnecting
        .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
        .is_err()
    {
        return;
    }
    inner.auth_tx.send_replace(false);
    if let Ok(mut guard) = inner.identity.write() {
        *guard = None;
    }
    let task_inner = Arc::clone(inner);
    tokio::spawn(async move {
        if let Err(e) = connect_loop(task_inner).await {
            warn!(error = %e, "reconnection abandoned");
        }
    });
}

/// Connection callbacks: acknowledge broadcasts, trigger reconnection on
/// loss. Holds the client weakly so a dropped client tears down cleanly.
struct ClientEvents {
    inner: std::sync::Weak<ClientInner>,
}

#[async_trait]
impl ConnectionEvents for ClientEvents {
    async fn handle_request(
        &self,
        _conn: Arc<Connection>,
        request: Request,
    ) -> Result<Value, String> {
        if let Some(inner) = self.inner.upgrade() {
            debug!(method = %request.method, "broadcast received");
            let _ = inner.broadcast_tx.send(request);
        }
        Ok(json!({}))
    }

    async fn on_disconnect(&self, conn: Arc<Connection>) {
        let Some(inner) = self.inner.upgrade() else {
            return;
        };
        if !inner.running.load(Ordering::SeqCst) {
            return;
        }
        {
            let mut guard = inner.connection.write().await;
            match guard.as_ref() {
                // A stale connection from before a reconnect; ignore it.
                Some(current) if !Arc::ptr_eq(current, &conn) => return,
                _ => {
                    guard.take();
                }
            }
        }
        warn!("connection lost");
        schedule_reconnect(&inner);
    }
}
