//! Sliding-window rate limiting.
//!
//! One generic limiter covers both uses in the subsystem: connection
//! attempts keyed by player id and message traffic keyed by connection id.
//! Exceeding a window is a synchronous rejection; nothing is ever queued
//! here.

use crate::types::current_timestamp_millis;
use serde::Serialize;
use std::collections::HashMap;
use std::hash::Hash;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::debug;

/// Snapshot of one key's window, returned by [`SlidingWindowLimiter::get_info`].
#[derive(Debug, Clone, Serialize)]
pub struct RateLimitInfo {
    /// Entries currently inside the window.
    pub current: u32,
    /// Configured maximum for the window.
    pub max: u32,
    /// Attempts left before rejection.
    pub remaining: u32,
    /// Unix millis at which the oldest entry leaves the window, if any.
    pub reset_at: Option<u64>,
}

/// Aggregate limiter metrics for the statistics report.
#[derive(Debug, Clone, Default, Serialize)]
pub struct RateLimiterStats {
    pub tracked_keys: usize,
    pub total_entries: usize,
    pub max_attempts: u32,
    pub window_millis: u64,
}

/// A keyed sliding-window limiter.
///
/// Each key owns a list of attempt timestamps bounded to the window. Entries
/// are pruned lazily on every check; periodic cleanup bounds memory for keys
/// that stop checking.
pub struct SlidingWindowLimiter<K> {
    max_attempts: u32,
    window: Duration,
    windows: RwLock<HashMap<K, Vec<u64>>>,
}

impl<K: Eq + Hash + Clone + std::fmt::Debug> SlidingWindowLimiter<K> {
    /// Creates a limiter admitting `max_attempts` per `window`.
    pub fn new(max_attempts: u32, window: Duration) -> Self {
        Self {
            max_attempts,
            window,
            windows: RwLock::new(HashMap::new()),
        }
    }

    /// Checks and records one attempt for `key`.
    ///
    /// Prune, count and append happen under a single lock acquisition, so two
    /// concurrent callers can never both slip in as the final allowed
    /// attempt.
    pub async fn check(&self, key: &K) -> bool {
        self.check_at(key, current_timestamp_millis()).await
    }

    /// Clock-explicit form of [`check`](Self::check).
    pub async fn check_at(&self, key: &K, now_millis: u64) -> bool {
        let window_millis = self.window.as_millis() as u64;
        let cutoff = now_millis.saturating_sub(window_millis);

        let mut windows = self.windows.write().await;
        let entries = windows.entry(key.clone()).or_default();
        entries.retain(|&t| t > cutoff);

        if entries.len() >= self.max_attempts as usize {
            debug!("Rate limit hit for {:?}: {} in window", key, entries.len());
            return false;
        }
        entries.push(now_millis);
        true
    }

    /// Reports the key's window state without mutating it.
    pub async fn get_info(&self, key: &K) -> RateLimitInfo {
        self.get_info_at(key, current_timestamp_millis()).await
    }

    /// Clock-explicit form of [`get_info`](Self::get_info).
    pub async fn get_info_at(&self, key: &K, now_millis: u64) -> RateLimitInfo {
        let window_millis = self.window.as_millis() as u64;
        let cutoff = now_millis.saturating_sub(window_millis);

        let windows = self.windows.read().await;
        let live: Vec<u64> = windows
            .get(key)
            .map(|entries| entries.iter().copied().filter(|&t| t > cutoff).collect())
            .unwrap_or_default();

        let current = live.len() as u32;
        RateLimitInfo {
            current,
            max: self.max_attempts,
            remaining: self.max_attempts.saturating_sub(current),
            reset_at: live.iter().min().map(|&oldest| oldest + window_millis),
        }
    }

    /// Drops entries older than `max_age` across every key and deletes keys
    /// left empty.
    pub async fn cleanup_old(&self, max_age: Duration) -> usize {
        self.cleanup_old_at(max_age, current_timestamp_millis()).await
    }

    /// Clock-explicit form of [`cleanup_old`](Self::cleanup_old).
    pub async fn cleanup_old_at(&self, max_age: Duration, now_millis: u64) -> usize {
        let cutoff = now_millis.saturating_sub(max_age.as_millis() as u64);
        let mut removed = 0;

        let mut windows = self.windows.write().await;
        windows.retain(|_, entries| {
            let before = entries.len();
            entries.retain(|&t| t > cutoff);
            removed += before - entries.len();
            !entries.is_empty()
        });
        removed
    }

    /// Trims any key's list to its most recent `max_entries`, independent of
    /// age.
    pub async fn cleanup_large(&self, max_entries: usize) -> usize {
        let mut trimmed = 0;
        let mut windows = self.windows.write().await;
        for entries in windows.values_mut() {
            if entries.len() > max_entries {
                trimmed += entries.len() - max_entries;
                let keep_from = entries.len() - max_entries;
                entries.drain(..keep_from);
            }
        }
        trimmed
    }

    /// Deletes a key's window outright. Used on player/connection teardown.
    pub async fn remove(&self, key: &K) {
        self.windows.write().await.remove(key);
    }

    /// Aggregate metrics for the statistics report.
    pub async fn stats(&self) -> RateLimiterStats {
        let windows = self.windows.read().await;
        RateLimiterStats {
            tracked_keys: windows.len(),
            total_entries: windows.values().map(|v| v.len()).sum(),
            max_attempts: self.max_attempts,
            window_millis: self.window.as_millis() as u64,
        }
    }
}
