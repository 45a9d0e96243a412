//! Per-player pending-message storage for offline delivery.
//!
//! When a player has no live connection (or every send fails), events land
//! here and are handed back in order on the next successful retrieval. Queues
//! are bounded per player and individual messages expire by age.

use crate::types::{current_timestamp, PlayerId};
use chrono::{DateTime, NaiveDateTime};
use serde::Serialize;
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::warn;

/// Aggregate queue metrics for the statistics report.
#[derive(Debug, Clone, Default, Serialize)]
pub struct MessageQueueStats {
    pub players_with_pending: usize,
    pub total_pending: usize,
    pub per_player_cap: usize,
}

/// Bounded, TTL'd pending-message queues, one per player.
///
/// Messages keep their insertion stamp inside the payload itself (a
/// `timestamp` field added on enqueue when absent), so age survives a restart
/// of whatever drains them.
pub struct MessageQueue {
    per_player_cap: usize,
    queues: RwLock<HashMap<PlayerId, Vec<serde_json::Value>>>,
}

impl MessageQueue {
    /// Creates a queue store capping each player at `per_player_cap` messages.
    pub fn new(per_player_cap: usize) -> Self {
        Self {
            per_player_cap,
            queues: RwLock::new(HashMap::new()),
        }
    }

    /// Appends a message to the player's queue.
    ///
    /// The payload is stamped with the current Unix time if it has no
    /// `timestamp` field. Exceeding the per-player cap drops the oldest
    /// message first; that loses data for the player, so it is logged, but
    /// it is not an error.
    pub async fn add(&self, player_id: PlayerId, message: serde_json::Value) {
        self.add_at(player_id, message, current_timestamp()).await
    }

    /// Clock-explicit form of [`add`](Self::add).
    pub async fn add_at(&self, player_id: PlayerId, mut message: serde_json::Value, now: u64) {
        if let Some(obj) = message.as_object_mut() {
            obj.entry("timestamp".to_string())
                .or_insert_with(|| serde_json::json!(now));
        }

        let mut queues = self.queues.write().await;
        let queue = queues.entry(player_id).or_default();
        queue.push(message);
        if queue.len() > self.per_player_cap {
            let overflow = queue.len() - self.per_player_cap;
            queue.drain(..overflow);
            warn!(
                "Pending queue for {} over cap {}; dropped {} oldest message(s)",
                player_id, self.per_player_cap, overflow
            );
        }
    }

    /// Returns and clears the player's entire queue.
    ///
    /// At-most-once per drain: a disconnect before the client acknowledges
    /// what it received is not redelivered.
    pub async fn drain(&self, player_id: PlayerId) -> Vec<serde_json::Value> {
        self.queues
            .write()
            .await
            .remove(&player_id)
            .unwrap_or_default()
    }

    /// Whether the player has anything pending.
    pub async fn has(&self, player_id: PlayerId) -> bool {
        self.queues
            .read()
            .await
            .get(&player_id)
            .map(|q| !q.is_empty())
            .unwrap_or(false)
    }

    /// Number of messages pending for the player.
    pub async fn count(&self, player_id: PlayerId) -> usize {
        self.queues
            .read()
            .await
            .get(&player_id)
            .map(|q| q.len())
            .unwrap_or(0)
    }

    /// Deletes a player's queue entirely.
    pub async fn remove(&self, player_id: PlayerId) {
        self.queues.write().await.remove(&player_id);
    }

    /// Drops messages older than `max_age` and deletes any player key left
    /// empty. Returns the number of messages dropped.
    pub async fn cleanup_old(&self, max_age: Duration) -> usize {
        self.cleanup_old_at(max_age, current_timestamp()).await
    }

    /// Clock-explicit form of [`cleanup_old`](Self::cleanup_old).
    pub async fn cleanup_old_at(&self, max_age: Duration, now: u64) -> usize {
        let max_age_secs = max_age.as_secs();
        let mut dropped = 0;

        let mut queues = self.queues.write().await;
        queues.retain(|_, queue| {
            let before = queue.len();
            queue.retain(|message| message_age_secs(message, now) <= max_age_secs);
            dropped += before - queue.len();
            !queue.is_empty()
        });
        dropped
    }

    /// Hard-trims every player's queue to its most recent `max_entries`
    /// messages. Returns the number of messages dropped.
    pub async fn cleanup_large(&self, max_entries: usize) -> usize {
        let mut dropped = 0;
        let mut queues = self.queues.write().await;
        for queue in queues.values_mut() {
            if queue.len() > max_entries {
                let overflow = queue.len() - max_entries;
                queue.drain(..overflow);
                dropped += overflow;
            }
        }
        dropped
    }

    /// Aggregate metrics for the statistics report.
    pub async fn stats(&self) -> MessageQueueStats {
        let queues = self.queues.read().await;
        MessageQueueStats {
            players_with_pending: queues.len(),
            total_pending: queues.values().map(|q| q.len()).sum(),
            per_player_cap: self.per_player_cap,
        }
    }
}

/// Age in seconds of a queued message, derived from its `timestamp` field.
///
/// Accepts a numeric Unix timestamp or an ISO-8601 string, with or without a
/// trailing zone marker. A missing or unparsable stamp yields `u64::MAX` so
/// the message is expired rather than retained forever.
fn message_age_secs(message: &serde_json::Value, now: u64) -> u64 {
    let stamp = match message.get("timestamp") {
        Some(serde_json::Value::Number(n)) => n.as_f64().map(|secs| secs as u64),
        Some(serde_json::Value::String(s)) => parse_iso8601_secs(s),
        _ => None,
    };
    match stamp {
        Some(t) => now.saturating_sub(t),
        None => u64::MAX,
    }
}

fn parse_iso8601_secs(s: &str) -> Option<u64> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return u64::try_from(dt.timestamp()).ok();
    }
    // No zone marker: interpret as UTC.
    NaiveDateTime::parse_from_str(s, "%Y-%m-%dT%H:%M:%S%.f")
        .ok()
        .and_then(|naive| u64::try_from(naive.and_utc().timestamp()).ok())
}
