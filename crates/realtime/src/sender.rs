//! Single-target event delivery.
//!
//! The sender is the one place an event crosses from the registry to a
//! transport. Everything above it (broadcasts, direct tells, system notices)
//! funnels through [`PersonalMessageSender::send`], which owns the
//! oversized-payload substitution, per-connection teardown on failure and
//! the offline-queue fallback.

use crate::connection::ConnectionTable;
use crate::message_queue::MessageQueue;
use crate::traits::{DeadConnectionSink, Transport};
use crate::types::PlayerId;
use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, warn};

/// Result of one delivery attempt to a player.
#[derive(Debug, Clone, Serialize)]
pub struct DeliveryStatus {
    /// True when at least one connection took the event, or when the player
    /// was fully offline and the event was queued. A player whose
    /// connections all failed gets `false` even though the event was queued;
    /// the message is not lost, the attempt failed.
    pub success: bool,
    /// Connections that accepted the payload.
    pub delivered_count: usize,
    /// Connections torn down because they were closed or their send failed.
    pub failed_count: usize,
    /// Connections the player owned when the send started.
    pub total_connections: usize,
    /// Connections that were open at the transport layer when checked.
    pub active_connections: usize,
}

/// Delivers one event to one player across all of their live connections.
pub struct PersonalMessageSender {
    table: Arc<ConnectionTable>,
    transport: Arc<dyn Transport>,
    queue: Arc<MessageQueue>,
    dead: Arc<dyn DeadConnectionSink>,
    max_payload_bytes: usize,
}

impl PersonalMessageSender {
    pub fn new(
        table: Arc<ConnectionTable>,
        transport: Arc<dyn Transport>,
        queue: Arc<MessageQueue>,
        dead: Arc<dyn DeadConnectionSink>,
        max_payload_bytes: usize,
    ) -> Self {
        Self {
            table,
            transport,
            queue,
            dead,
            max_payload_bytes,
        }
    }

    /// Sends `event` to every live connection the player owns.
    ///
    /// Oversized payloads are replaced with an error envelope and delivery
    /// proceeds with the substitute. A connection that is closed or whose
    /// send fails is torn down through the dead-connection sink and the
    /// remaining connections still get the event. If nothing was delivered
    /// the (possibly substituted) event is queued for later retrieval.
    pub async fn send(&self, player_id: PlayerId, event: &serde_json::Value) -> DeliveryStatus {
        let payload = self.bounded_payload(event);

        let connection_ids = self.table.connection_ids_for(player_id).await;
        let total_connections = connection_ids.len();
        let mut delivered_count = 0;
        let mut failed_count = 0;
        let mut active_connections = 0;

        for connection_id in connection_ids {
            if !self.transport.is_open(connection_id).await {
                debug!("Connection {} for {} closed at transport; removing", connection_id, player_id);
                self.dead.cleanup_dead_connection(player_id, connection_id).await;
                failed_count += 1;
                continue;
            }
            active_connections += 1;

            match self.transport.send(connection_id, &payload).await {
                Ok(()) => delivered_count += 1,
                Err(e) => {
                    warn!("Send to {} on {} failed: {}; removing connection", player_id, connection_id, e);
                    self.dead.cleanup_dead_connection(player_id, connection_id).await;
                    failed_count += 1;
                }
            }
        }

        if delivered_count == 0 {
            self.queue.add(player_id, payload).await;
        }

        DeliveryStatus {
            // Queueing for a fully offline player counts as success; queueing
            // because every connection failed does not.
            success: delivered_count > 0 || total_connections == 0,
            delivered_count,
            failed_count,
            total_connections,
            active_connections,
        }
    }

    /// The event itself, or the `payload_too_large` error envelope when the
    /// serialized form exceeds the configured maximum.
    fn bounded_payload(&self, event: &serde_json::Value) -> serde_json::Value {
        let size = serde_json::to_vec(event).map(|v| v.len()).unwrap_or(usize::MAX);
        if size <= self.max_payload_bytes {
            return event.clone();
        }
        warn!(
            "Event payload of {} bytes exceeds {}-byte cap; substituting error envelope",
            size, self.max_payload_bytes
        );
        serde_json::json!({
            "type": "error",
            "error_type": "payload_too_large",
            "message": format!("Event payload of {} bytes exceeds the delivery limit", size),
            "details": {"max_size": self.max_payload_bytes},
        })
    }
}
