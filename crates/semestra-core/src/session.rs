// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Authenticated session registry.
//!
//! Sessions are keyed by an opaque random token minted at authentication.
//! Each one holds a weak handle to its connection so a dead connection never
//! keeps socket resources alive through the registry. A background sweeper
//! evicts sessions that are expired or have missed more than two expected
//! heartbeats; the second condition catches a half-open connection before
//! its TTL runs out. Validation also checks the TTL directly, so an expired
//! session is rejected even between sweeps.

use std::sync::{Arc, Weak};
use std::time::Duration;

use dashmap::DashMap;
use rand::RngCore;
use semestra_protocol::Connection;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, info};

fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

fn mint_token() -> String {
    let mut bytes = [0u8; 32];
    rand::rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}

/// One authenticated session.
#[derive(Debug, Clone)]
pub struct SessionInfo {
    pub token: String,
    pub uuid: String,
    pub user_type: String,
    pub created_at: i64,
    pub last_heartbeat: i64,
    pub tags: Vec<String>,
    connection: Weak<Connection>,
}

impl SessionInfo {
    /// The session's connection, if it is still alive.
    pub fn connection(&self) -> Option<Arc<Connection>> {
        self.connection.upgrade()
    }
}

/// In-memory session store with TTL-based expiry.
pub struct SessionManager {
    sessions: DashMap<String, SessionInfo>,
    ttl_ms: i64,
    heartbeat_interval_ms: i64,
    sweep_interval: Duration,
    shutdown: Notify,
    sweep_task: std::sync::Mutex<Option<JoinHandle<()>>>,
}

impl SessionManager {
    pub fn new(ttl_ms: i64, heartbeat_interval_ms: u64, sweep_interval_ms: u64) -> Self {
        Self {
            sessions: DashMap::new(),
            ttl_ms,
            heartbeat_interval_ms: heartbeat_interval_ms as i64,
            sweep_interval: Duration::from_millis(sweep_interval_ms),
            shutdown: Notify::new(),
            sweep_task: std::sync::Mutex::new(None),
        }
    }

    /// Start the background expiry sweeper.
    pub fn start_sweeper(self: &Arc<Self>) {
        let manager = Arc::clone(self);
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(manager.sweep_interval);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = manager.shutdown.notified() => break,
                    _ = ticker.tick() => manager.sweep(),
                }
            }
        });
        if let Ok(mut guard) = self.sweep_task.lock() {
            *guard = Some(handle);
        }
    }

    /// Mint a session for an authenticated user on the given connection.
    pub fn create(&self, uuid: &str, user_type: &str, conn: &Arc<Connection>) -> SessionInfo {
        let now = now_ms();
        let session = SessionInfo {
            token: mint_token(),
            uuid: uuid.to_string(),
            user_type: user_type.to_string(),
            created_at: now,
            last_heartbeat: now,
            tags: Vec::new(),
            connection: Arc::downgrade(conn),
        };
        info!(uuid, user_type, "session created");
        self.sessions
            .insert(session.token.clone(), session.clone());
        session
    }

    /// Whether a token names a live, unexpired session. Does not refresh the
    /// heartbeat.
    pub fn validate(&self, token: &str) -> bool {
        match self.sessions.get(token) {
            Some(session) => now_ms() - session.last_heartbeat <= self.ttl_ms,
            None => false,
        }
    }

    /// Refresh a session's heartbeat timestamp.
    pub fn touch(&self, token: &str) {
        if let Some(mut session) = self.sessions.get_mut(token) {
            session.last_heartbeat = now_ms();
        }
    }

    pub fn get(&self, token: &str) -> Option<SessionInfo> {
        self.sessions.get(token).map(|s| s.clone())
    }

    pub fn remove(&self, token: &str) -> Option<SessionInfo> {
        self.sessions.remove(token).map(|(_, session)| {
            info!(uuid = %session.uuid, "session removed");
            session
        })
    }

    /// Remove the session bound to the given connection, if any.
    pub fn remove_by_connection(&self, conn: &Arc<Connection>) -> Option<SessionInfo> {
        let token = self.sessions.iter().find_map(|entry| {
            entry
                .connection
                .upgrade()
                .filter(|c| Arc::ptr_eq(c, conn))
                .map(|_| entry.token.clone())
        })?;
        self.remove(&token)
    }

    /// Attach tags to a session for targeted broadcasts. Duplicates are
    /// ignored.
    pub fn add_tags(&self, token: &str, tags: &[String]) -> bool {
        match self.sessions.get_mut(token) {
            Some(mut session) => {
                for tag in tags {
                    if !session.tags.contains(tag) {
                        session.tags.push(tag.clone());
                    }
                }
                true
            }
            None => false,
        }
    }

    /// Sessions carrying every one of the given tags. An empty tag list
    /// matches all sessions.
    pub fn sessions_with_tags(&self, tags: &[String]) -> Vec<SessionInfo> {
        self.sessions
            .iter()
            .filter(|entry| tags.iter().all(|tag| entry.tags.contains(tag)))
            .map(|entry| entry.clone())
            .collect()
    }

    /// Live connection behind a token, if the session exists and the
    /// connection has not been dropped.
    pub fn connection_for(&self, token: &str) -> Option<Arc<Connection>> {
        self.sessions.get(token)?.connection.upgrade()
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Drop every session that is expired or has missed more than two
    /// expected heartbeats.
    pub fn sweep(&self) {
        let now = now_ms();
        let expired_cutoff = now - self.ttl_ms;
        let half_open_cutoff = now - 2 * self.heartbeat_interval_ms;
        let expired: Vec<String> = self
            .sessions
            .iter()
            .filter(|entry| {
                entry.last_heartbeat < expired_cutoff || entry.last_heartbeat < half_open_cutoff
            })
            .map(|entry| entry.token.clone())
            .collect();
        for token in &expired {
            if let Some((_, session)) = self.sessions.remove(token) {
                debug!(uuid = %session.uuid, "expired session swept");
            }
        }
        if !expired.is_empty() {
            info!(count = expired.len(), "session sweep complete");
        }
    }

    /// Stop the sweeper and clear all sessions.
    pub fn shutdown(&self) {
        self.shutdown.notify_waiters();
        if let Ok(mut guard) = self.sweep_task.lock()
            && let Some(handle) = guard.take()
        {
            handle.abort();
        }
        self.sessions.clear();
    }
}
