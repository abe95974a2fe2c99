// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Full-duplex framed connection over one TCP socket.
//!
//! A [`Connection`] exclusively owns its socket halves for its lifetime. It
//! keeps a table of in-flight request ids awaiting responses, serializes all
//! writers through a single lock so frames never interleave, and reports
//! life-cycle events (request arrival, disconnect) to a pluggable
//! [`ConnectionEvents`] handler. Responses are matched to requests purely by
//! id, so out-of-order completions from a pipelining peer are correct.
//!
//! Exactly one of the following resolves each in-flight request: a matching
//! response frame, the per-request timeout, or connection closure.

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::{Mutex, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::envelope::{Message, Request, Response};
use crate::frame::{self, FrameError};

/// Errors that can occur on a framed connection
#[derive(Debug, thiserror::Error)]
pub enum ConnectionError {
    #[error("frame error: {0}")]
    Frame(#[from] FrameError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("connection closed")]
    Closed,

    #[error("timed out waiting for \"{method}\" request")]
    HandshakeTimeout { method: String },
}

/// Timeouts applied by a connection.
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// How long `send_request` waits for a response before synthesizing a
    /// `"Request timed out"` error response (milliseconds)
    pub request_timeout_ms: u64,
    /// How long an inbound request's handler may run before the connection
    /// answers `"processing timed out"` on its behalf (milliseconds)
    pub handler_timeout_ms: u64,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            request_timeout_ms: 30_000,
            handler_timeout_ms: 30_000,
        }
    }
}

/// Life-cycle callbacks owned by whoever drives the connection.
#[async_trait]
pub trait ConnectionEvents: Send + Sync {
    /// Handle one inbound request. The returned value becomes a success
    /// response; an `Err` becomes an error response with the given message.
    async fn handle_request(
        &self,
        conn: Arc<Connection>,
        request: Request,
    ) -> Result<serde_json::Value, String>;

    /// Called at most once, when the connection fails or the peer disconnects.
    /// Not called for an explicit local `close()`.
    async fn on_disconnect(&self, conn: Arc<Connection>);
}

/// One framed, full-duplex connection. Not reusable after closing.
pub struct Connection {
    peer_addr: SocketAddr,
    writer: Mutex<OwnedWriteHalf>,
    /// Taken by `start()` (or borrowed by `wait_for_request` before it)
    reader: Mutex<Option<OwnedReadHalf>>,
    pending: DashMap<u64, oneshot::Sender<Response>>,
    active: AtomicBool,
    next_id: AtomicU64,
    read_task: std::sync::Mutex<Option<JoinHandle<()>>>,
    config: ConnectionConfig,
}

impl Connection {
    /// Wrap an established TCP stream.
    pub fn new(stream: TcpStream, config: ConnectionConfig) -> Result<Self, ConnectionError> {
        let peer_addr = stream.peer_addr()?;
        let (read_half, write_half) = stream.into_split();
        Ok(Self {
            peer_addr,
            writer: Mutex::new(write_half),
            reader: Mutex::new(Some(read_half)),
            pending: DashMap::new(),
            active: AtomicBool::new(true),
            next_id: AtomicU64::new(1),
            read_task: std::sync::Mutex::new(None),
            config,
        })
    }

    /// Remote address of the peer.
    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    /// Whether the connection has not been closed yet.
    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    /// Next request id for this sender direction (monotonic, starts at 1).
    pub fn next_request_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::SeqCst)
    }

    /// Number of in-flight requests awaiting responses.
    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// Consume inbound frames until a request with the given method arrives,
    /// or the timeout elapses. Server handshake use only; must be called
    /// before [`Connection::start`]. Other messages received meanwhile are
    /// logged and dropped.
    pub async fn wait_for_request(
        &self,
        method: &str,
        timeout: Duration,
    ) -> Result<Request, ConnectionError> {
        let mut guard = self.reader.lock().await;
        let reader = guard.as_mut().ok_or(ConnectionError::Closed)?;

        let wait = async {
            loop {
                match frame::read_frame(reader).await? {
                    Message::Request(req) if req.method == method => return Ok(req),
                    other => {
                        debug!(peer = %self.peer_addr, id = other.id(), "dropping unexpected pre-handshake message");
                    }
                }
            }
        };

        match tokio::time::timeout(timeout, wait).await {
            Ok(result) => result,
            Err(_) => Err(ConnectionError::HandshakeTimeout {
                method: method.to_string(),
            }),
        }
    }

    /// Start the read loop. Inbound requests are dispatched to the handler on
    /// their own task; inbound responses complete their pending entry. Any
    /// read failure is connection-fatal and fires `on_disconnect` exactly
    /// once.
    pub fn start(self: &Arc<Self>, events: Arc<dyn ConnectionEvents>) {
        let conn = Arc::clone(self);
        let handle = tokio::spawn(async move {
            let mut reader = {
                let mut guard = conn.reader.lock().await;
                match guard.take() {
                    Some(reader) => reader,
                    None => return,
                }
            };

            loop {
                match frame::read_frame(&mut reader).await {
                    Ok(Message::Request(request)) => {
                        conn.dispatch_request(request, Arc::clone(&events));
                    }
                    Ok(Message::Response(response)) => {
                        conn.complete_pending(response);
                    }
                    Err(FrameError::ConnectionClosed) => {
                        debug!(peer = %conn.peer_addr, "peer disconnected");
                        break;
                    }
                    Err(e) => {
                        warn!(peer = %conn.peer_addr, error = %e, "fatal read error");
                        break;
                    }
                }
            }

            conn.fail(&events).await;
        });

        if let Ok(mut guard) = self.read_task.lock() {
            *guard = Some(handle);
        }
    }

    /// Send a request and wait for its matching response.
    ///
    /// The pending entry is registered before the write, so a fast peer
    /// cannot race the registration. A timeout resolves the call with a
    /// synthetic `"Request timed out"` error response without closing the
    /// connection.
    pub async fn send_request(&self, request: Request) -> Result<Response, ConnectionError> {
        if !self.is_active() {
            return Err(ConnectionError::Closed);
        }

        let id = request.id;
        let (tx, rx) = oneshot::channel();
        self.pending.insert(id, tx);

        if let Err(e) = self.write_message(&Message::Request(request)).await {
            self.pending.remove(&id);
            return Err(e);
        }

        let timeout = Duration::from_millis(self.config.request_timeout_ms);
        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(response)) => Ok(response),
            // Sender dropped without completing: the connection went away
            // between registration and resolution.
            Ok(Err(_)) => Ok(Response::error(id, "Connection closed")),
            Err(_) => {
                self.pending.remove(&id);
                debug!(peer = %self.peer_addr, id, "request timed out");
                Ok(Response::error(id, "Request timed out"))
            }
        }
    }

    /// Send a response frame. A write failure here is connection-fatal for
    /// the caller to handle; the read loop observes the same broken socket.
    pub async fn send_response(&self, response: Response) -> Result<(), ConnectionError> {
        if !self.is_active() {
            return Err(ConnectionError::Closed);
        }
        self.write_message(&Message::Response(response)).await
    }

    /// Close the connection. Idempotent and safe from any task: the first
    /// call completes every pending request with a `"Connection closed"`
    /// error, stops the read loop, and shuts the socket down. The disconnect
    /// callback is not fired for an explicit close.
    pub async fn close(&self) {
        if !self.begin_close() {
            return;
        }

        self.fail_pending();
        if let Ok(mut guard) = self.read_task.lock()
            && let Some(handle) = guard.take()
        {
            handle.abort();
        }
        self.shutdown_socket().await;
        debug!(peer = %self.peer_addr, "connection closed");
    }

    async fn write_message(&self, message: &Message) -> Result<(), ConnectionError> {
        let mut writer = self.writer.lock().await;
        frame::write_frame(&mut *writer, message).await?;
        Ok(())
    }

    fn dispatch_request(self: &Arc<Self>, request: Request, events: Arc<dyn ConnectionEvents>) {
        let conn = Arc::clone(self);
        tokio::spawn(async move {
            let id = request.id;
            let timeout = Duration::from_millis(conn.config.handler_timeout_ms);
            let outcome =
                tokio::time::timeout(timeout, events.handle_request(Arc::clone(&conn), request))
                    .await;

            let response = match outcome {
                Ok(Ok(params)) => Response::success(id, params),
                Ok(Err(message)) => Response::error(id, message),
                Err(_) => Response::error(id, "processing timed out"),
            };

            if let Err(e) = conn.send_response(response).await {
                warn!(peer = %conn.peer_addr, id, error = %e, "failed to write response");
                conn.fail(&events).await;
            }
        });
    }

    fn complete_pending(&self, response: Response) {
        match self.pending.remove(&response.id) {
            Some((id, tx)) => {
                if tx.send(response).is_err() {
                    // Caller already gave up (timed out); drop the late reply.
                    debug!(peer = %self.peer_addr, id, "response arrived after caller went away");
                }
            }
            None => {
                debug!(peer = %self.peer_addr, id = response.id, "dropping response with no pending request");
            }
        }
    }

    /// Connection-fatal teardown. Atomic `active` swap guarantees the
    /// pending-table drain and the disconnect callback run at most once even
    /// when concurrent read and write failures race.
    async fn fail(self: &Arc<Self>, events: &Arc<dyn ConnectionEvents>) {
        if !self.begin_close() {
            return;
        }
        self.fail_pending();
        self.shutdown_socket().await;
        events.on_disconnect(Arc::clone(self)).await;
    }

    fn begin_close(&self) -> bool {
        self.active.swap(false, Ordering::SeqCst)
    }

    fn fail_pending(&self) {
        let ids: Vec<u64> = self.pending.iter().map(|entry| *entry.key()).collect();
        for id in ids {
            if let Some((_, tx)) = self.pending.remove(&id) {
                let _ = tx.send(Response::error(id, "Connection closed"));
            }
        }
    }

    async fn shutdown_socket(&self) {
        use tokio::io::AsyncWriteExt;
        let mut writer = self.writer.lock().await;
        let _ = writer.shutdown().await;
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("peer_addr", &self.peer_addr)
            .field("active", &self.is_active())
            .field("pending", &self.pending.len())
            .finish()
    }
}
