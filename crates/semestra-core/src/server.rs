// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Enrollment server runtime.
//!
//! A [`Server`] accepts TCP connections, requires an `auth` handshake before
//! anything else, and then routes inbound requests through its method
//! registry. Sessions mint on successful auth and carry the token clients
//! must attach to every later request. The server can also push requests the
//! other way: [`Server::broadcast`] delivers one request to every session
//! matching a tag set.
//!
//! All state lives in the instance. Two servers in one process do not share
//! sessions, handlers, or limiters.

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use futures::future::BoxFuture;
use semestra_protocol::{
    Connection, ConnectionConfig, ConnectionEvents, Request, Response,
};
use serde_json::{Value, json};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument, warn};

use crate::config::ServerConfig;
use crate::error::ServerError;
use crate::rate_limit::RateLimiter;
use crate::session::{SessionInfo, SessionManager};

/// Boxed async method handler stored in the registry.
pub type MethodHandler = Arc<
    dyn Fn(Value, RequestContext) -> BoxFuture<'static, Result<Value, ServerError>> + Send + Sync,
>;

/// Everything a handler may want to know about the request it is serving.
#[derive(Clone)]
pub struct RequestContext {
    pub peer_addr: SocketAddr,
    /// `None` only while serving the `auth` handshake itself
    pub session: Option<SessionInfo>,
    pub connection: Arc<Connection>,
}

struct ServerInner {
    config: ServerConfig,
    handlers: DashMap<String, MethodHandler>,
    sessions: Arc<SessionManager>,
    admission_limiter: Arc<RateLimiter>,
    request_limiter: Arc<RateLimiter>,
    connections: DashMap<SocketAddr, Arc<Connection>>,
    local_addr: std::sync::Mutex<Option<SocketAddr>>,
    accept_task: std::sync::Mutex<Option<JoinHandle<()>>>,
    shutdown: Notify,
    running: AtomicBool,
}

/// The server runtime. Cheap to clone; clones share one instance.
#[derive(Clone)]
pub struct Server {
    inner: Arc<ServerInner>,
}

impl Server {
    pub fn new(config: ServerConfig) -> Self {
        let sessions = Arc::new(SessionManager::new(
            config.session_ttl_ms,
            config.heartbeat_interval_ms,
            config.session_sweep_interval_ms,
        ));
        let admission_limiter =
            Arc::new(RateLimiter::new(config.admission_limit, config.rate_window_ms));
        let request_limiter =
            Arc::new(RateLimiter::new(config.request_limit, config.rate_window_ms));
        let server = Self {
            inner: Arc::new(ServerInner {
                config,
                handlers: DashMap::new(),
                sessions,
                admission_limiter,
                request_limiter,
                connections: DashMap::new(),
                local_addr: std::sync::Mutex::new(None),
                accept_task: std::sync::Mutex::new(None),
                shutdown: Notify::new(),
                running: AtomicBool::new(false),
            }),
        };
        server.register_builtins();
        server
    }

    /// Register a method handler. Replaces any existing handler for the same
    /// method name.
    pub fn register<F, Fut>(&self, method: impl Into<String>, handler: F)
    where
        F: Fn(Value, RequestContext) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Result<Value, ServerError>> + Send + 'static,
    {
        let boxed: MethodHandler = Arc::new(move |params, ctx| Box::pin(handler(params, ctx)));
        self.inner.handlers.insert(method.into(), boxed);
    }

    fn register_builtins(&self) {
        self.register("health", |_params, _ctx| async move {
            Ok(json!({
                "status": "ok",
                "serverTime": chrono::Utc::now().timestamp_millis(),
            }))
        });

        let sessions = Arc::clone(&self.inner.sessions);
        self.register("logout", move |_params, ctx| {
            let sessions = Arc::clone(&sessions);
            async move {
                if let Some(session) = ctx.session {
                    sessions.remove(&session.token);
                }
                Ok(json!({ "loggedOut": true }))
            }
        });
    }

    /// Bind the listener and start accepting connections. Returns once the
    /// listener is up; accepting runs in the background.
    pub async fn start(&self) -> Result<(), ServerError> {
        let listener = TcpListener::bind(&self.inner.config.bind_addr).await?;
        let addr = listener.local_addr()?;
        if let Ok(mut guard) = self.inner.local_addr.lock() {
            *guard = Some(addr);
        }
        self.inner.running.store(true, Ordering::SeqCst);
        self.inner.sessions.start_sweeper();
        self.inner.admission_limiter.start();
        self.inner.request_limiter.start();
        info!(%addr, "server listening");

        let inner = Arc::clone(&self.inner);
        let handle = tokio::spawn(accept_loop(inner, listener));
        if let Ok(mut guard) = self.inner.accept_task.lock() {
            *guard = Some(handle);
        }
        Ok(())
    }

    /// Address the listener actually bound to. `None` before `start`.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.inner.local_addr.lock().ok().and_then(|guard| *guard)
    }

    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::SeqCst)
    }

    /// The session registry, for tagging and inspection.
    pub fn sessions(&self) -> Arc<SessionManager> {
        Arc::clone(&self.inner.sessions)
    }

    pub fn connection_count(&self) -> usize {
        self.inner.connections.len()
    }

    /// Push one request to every session whose tags are a superset of
    /// `tags` (an empty list targets everyone). Delivery is fire-and-forget;
    /// the return value is the number of sessions targeted.
    pub fn broadcast(&self, method: &str, params: Value, tags: &[String]) -> usize {
        let targets = self.inner.sessions.sessions_with_tags(tags);
        let mut count = 0;
        for session in targets {
            let Some(conn) = session.connection() else {
                continue;
            };
            if !conn.is_active() {
                continue;
            }
            count += 1;
            let request = Request::new(conn.next_request_id(), method, params.clone());
            let method = method.to_string();
            tokio::spawn(async move {
                match conn.send_request(request).await {
                    Ok(response) if !response.is_success() => {
                        debug!(method, error = ?response.error_message(), "broadcast rejected by client");
                    }
                    Err(e) => {
                        debug!(method, error = %e, "broadcast delivery failed");
                    }
                    Ok(_) => {}
                }
            });
        }
        debug!(method, count, "broadcast dispatched");
        count
    }

    /// Stop accepting, close every connection, and clear all sessions.
    /// Idempotent.
    pub async fn close(&self) {
        if !self.inner.running.swap(false, Ordering::SeqCst) {
            return;
        }
        self.inner.shutdown.notify_waiters();
        if let Ok(mut guard) = self.inner.accept_task.lock()
            && let Some(handle) = guard.take()
        {
            handle.abort();
        }

        let conns: Vec<Arc<Connection>> = self
            .inner
            .connections
            .iter()
            .map(|entry| Arc::clone(&entry))
            .collect();
        for conn in conns {
            conn.close().await;
        }
        self.inner.connections.clear();
        self.inner.sessions.shutdown();
        self.inner.admission_limiter.shutdown();
        self.inner.request_limiter.shutdown();
        info!("server closed");
    }
}

async fn accept_loop(inner: Arc<ServerInner>, listener: TcpListener) {
    loop {
        let accepted = tokio::select! {
            _ = inner.shutdown.notified() => break,
            accepted = listener.accept() => accepted,
        };
        match accepted {
            Ok((stream, peer)) => {
                if !inner.admission_limiter.check(&peer.ip().to_string()) {
                    warn!(%peer, "admission limit exceeded, dropping connection");
                    continue;
                }
                let inner = Arc::clone(&inner);
                tokio::spawn(async move {
                    if let Err(e) = handle_connection(inner, stream, peer).await {
                        warn!(%peer, error = %e, "connection setup failed");
                    }
                });
            }
            Err(e) => {
                warn!(error = %e, "accept failed");
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
        }
    }
}

/// Drive one fresh connection through the auth handshake, then hand it to
/// the routing events.
#[instrument(skip(inner, stream), fields(peer = %peer))]
async fn handle_connection(
    inner: Arc<ServerInner>,
    stream: TcpStream,
    peer: SocketAddr,
) -> Result<(), ServerError> {
    let conn_config = ConnectionConfig {
        request_timeout_ms: inner.config.request_timeout_ms,
        handler_timeout_ms: inner.config.handler_timeout_ms,
    };
    let conn = Arc::new(Connection::new(stream, conn_config)?);
    let auth = conn
        .wait_for_request(
            "auth",
            Duration::from_millis(inner.config.handshake_timeout_ms),
        )
        .await?;

    match authenticate(&inner, &conn, auth.params).await {
        Ok(result) => {
            conn.send_response(Response::success(auth.id, result)).await?;
            inner.connections.insert(conn.peer_addr(), Arc::clone(&conn));
            let events: Arc<dyn ConnectionEvents> = Arc::new(ServerEvents {
                inner: Arc::clone(&inner),
            });
            conn.start(events);
            info!("connection authenticated");
        }
        Err(message) => {
            warn!(error = %message, "authentication failed");
            let _ = conn.send_response(Response::error(auth.id, message)).await;
            conn.close().await;
        }
    }
    Ok(())
}

/// Run the registered `auth` handler, mint a session on success, and inject
/// the token into the handler's result. Replaces any session previously
/// bound to the connection.
async fn authenticate(
    inner: &Arc<ServerInner>,
    conn: &Arc<Connection>,
    params: Value,
) -> Result<Value, String> {
    let handler = inner
        .handlers
        .get("auth")
        .map(|h| h.value().clone())
        .ok_or_else(|| ServerError::UnknownMethod("auth".to_string()).to_string())?;
    let ctx = RequestContext {
        peer_addr: conn.peer_addr(),
        session: None,
        connection: Arc::clone(conn),
    };
    let mut result = handler(params, ctx).await.map_err(|e| e.to_string())?;

    let uuid = result
        .get("uuid")
        .and_then(|v| v.as_str())
        .unwrap_or_default()
        .to_string();
    let user_type = result
        .get("userType")
        .and_then(|v| v.as_str())
        .unwrap_or("student")
        .to_string();

    inner.sessions.remove_by_connection(conn);
    let session = inner.sessions.create(&uuid, &user_type, conn);
    if let Value::Object(map) = &mut result {
        map.insert("sessionToken".to_string(), json!(session.token));
    }
    Ok(result)
}

/// Per-connection routing after the handshake.
struct ServerEvents {
    inner: Arc<ServerInner>,
}

#[async_trait]
impl ConnectionEvents for ServerEvents {
    async fn handle_request(
        &self,
        conn: Arc<Connection>,
        request: Request,
    ) -> Result<Value, String> {
        let inner = &self.inner;

        // Authenticated traffic is throttled per session token, everything
        // else per source IP.
        let rate_key = request
            .session_token
            .clone()
            .unwrap_or_else(|| conn.peer_addr().ip().to_string());
        if !inner.request_limiter.check(&rate_key) {
            return Err(ServerError::RateLimited.to_string());
        }

        // Re-authentication replaces the connection's session.
        if request.method == "auth" {
            return authenticate(inner, &conn, request.params).await;
        }

        let token = request
            .session_token
            .as_deref()
            .ok_or_else(|| ServerError::InvalidSession.to_string())?;
        if !inner.sessions.validate(token) {
            // An expired session does not get renewed by the request that
            // finds it expired.
            return Err(ServerError::InvalidSession.to_string());
        }
        inner.sessions.touch(token);
        let session = inner.sessions.get(token);

        let handler = inner
            .handlers
            .get(&request.method)
            .map(|h| h.value().clone())
            .ok_or_else(|| ServerError::UnknownMethod(request.method.clone()).to_string())?;
        let ctx = RequestContext {
            peer_addr: conn.peer_addr(),
            session,
            connection: Arc::clone(&conn),
        };
        handler(request.params, ctx).await.map_err(|e| e.to_string())
    }

    async fn on_disconnect(&self, conn: Arc<Connection>) {
        self.inner.connections.remove(&conn.peer_addr());
        match self.inner.sessions.remove_by_connection(&conn) {
            Some(session) => {
                info!(uuid = %session.uuid, peer = %conn.peer_addr(), "client disconnected");
            }
            None => {
                debug!(peer = %conn.peer_addr(), "connection without session dropped");
            }
        }
    }
}
