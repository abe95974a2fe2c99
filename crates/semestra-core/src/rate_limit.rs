// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Fixed-window rate limiting.
//!
//! Counters are kept per key and wiped wholesale when the window rolls over,
//! so a burst straddling a boundary can briefly see up to twice the limit.
//! That coarseness is acceptable for admission control and request throttling
//! here.

use std::time::Duration;

use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::debug;

/// Per-key fixed-window counter.
pub struct RateLimiter {
    counts: DashMap<String, u32>,
    limit: u32,
    window: Duration,
    shutdown: Notify,
    reset_task: std::sync::Mutex<Option<JoinHandle<()>>>,
}

impl RateLimiter {
    pub fn new(limit: u32, window_ms: u64) -> Self {
        Self {
            counts: DashMap::new(),
            limit,
            window: Duration::from_millis(window_ms),
            shutdown: Notify::new(),
            reset_task: std::sync::Mutex::new(None),
        }
    }

    /// Start the window-reset task.
    pub fn start(self: &Arc<Self>) {
        let limiter = Arc::clone(self);
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(limiter.window);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = limiter.shutdown.notified() => break,
                    _ = ticker.tick() => {
                        debug!(keys = limiter.counts.len(), "rate window reset");
                        limiter.counts.clear();
                    }
                }
            }
        });
        if let Ok(mut guard) = self.reset_task.lock() {
            *guard = Some(handle);
        }
    }

    /// Count one event against the key. Returns false once the key has
    /// exceeded the limit inside the current window.
    pub fn check(&self, key: &str) -> bool {
        let mut count = self.counts.entry(key.to_string()).or_insert(0);
        *count += 1;
        *count <= self.limit
    }

    /// Wipe every counter immediately.
    pub fn reset(&self) {
        self.counts.clear();
    }

    pub fn shutdown(&self) {
        self.shutdown.notify_waiters();
        if let Ok(mut guard) = self.reset_task.lock()
            && let Some(handle) = guard.take()
        {
            handle.abort();
        }
    }
}
