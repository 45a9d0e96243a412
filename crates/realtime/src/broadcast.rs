//! Concurrent event fan-out to room and global audiences.
//!
//! One broadcast launches every per-target delivery together and awaits them
//! together, so tail latency is bounded by the slowest single target rather
//! than the sum. Targets whose spawned delivery never completes (a panicked
//! or cancelled task) are retried individually and sequentially; an
//! infrastructure hiccup degrades one broadcast, it never silently drops it.

use crate::rooms::RoomManager;
use crate::sender::{DeliveryStatus, PersonalMessageSender};
use crate::types::{PlayerId, RoomId};
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::task::JoinSet;
use tracing::{error, info};

/// Structured result of one broadcast call.
#[derive(Debug, Clone, Serialize)]
pub struct BroadcastOutcome {
    /// Audience size before exclusion.
    pub total_targets: usize,
    /// Targets removed by the exclusion id.
    pub excluded_players: usize,
    /// Targets whose delivery reported success.
    pub successful_deliveries: usize,
    /// Targets whose delivery reported failure.
    pub failed_deliveries: usize,
    /// Per-target delivery status.
    pub delivery_details: HashMap<PlayerId, DeliveryStatus>,
}

/// Fans one event out to many players through the personal sender.
///
/// No per-target retry happens here; a failed target's event is already in
/// the offline queue courtesy of the sender.
pub struct MessageBroadcaster {
    rooms: Arc<RoomManager>,
    sender: Arc<PersonalMessageSender>,
}

impl MessageBroadcaster {
    pub fn new(rooms: Arc<RoomManager>, sender: Arc<PersonalMessageSender>) -> Self {
        Self { rooms, sender }
    }

    /// Delivers `event` to every subscriber of the room except `exclude`.
    pub async fn broadcast_to_room(
        &self,
        room_id: &RoomId,
        event: &serde_json::Value,
        exclude: Option<PlayerId>,
    ) -> BroadcastOutcome {
        let subscribers = self.rooms.get_subscribers(room_id).await;
        let outcome = self.fan_out(subscribers, event, exclude).await;
        info!(
            "Room {} broadcast: {}/{} delivered",
            room_id,
            outcome.successful_deliveries,
            outcome.total_targets - outcome.excluded_players
        );
        outcome
    }

    /// Delivers `event` to every connected player except `exclude`.
    ///
    /// The caller supplies the connected-player snapshot; the broadcaster
    /// does not own presence.
    pub async fn broadcast_global(
        &self,
        event: &serde_json::Value,
        exclude: Option<PlayerId>,
        all_connected_players: HashSet<PlayerId>,
    ) -> BroadcastOutcome {
        let outcome = self.fan_out(all_connected_players, event, exclude).await;
        info!(
            "Global broadcast: {}/{} delivered",
            outcome.successful_deliveries,
            outcome.total_targets - outcome.excluded_players
        );
        outcome
    }

    async fn fan_out(
        &self,
        targets: HashSet<PlayerId>,
        event: &serde_json::Value,
        exclude: Option<PlayerId>,
    ) -> BroadcastOutcome {
        let total_targets = targets.len();
        let recipients: Vec<PlayerId> = targets
            .into_iter()
            .filter(|player| Some(*player) != exclude)
            .collect();
        let excluded_players = total_targets - recipients.len();

        let mut delivery_details: HashMap<PlayerId, DeliveryStatus> =
            HashMap::with_capacity(recipients.len());

        let mut batch = JoinSet::new();
        for player in &recipients {
            let player = *player;
            let sender = self.sender.clone();
            let event = event.clone();
            batch.spawn(async move { (player, sender.send(player, &event).await) });
        }
        while let Some(joined) = batch.join_next().await {
            match joined {
                Ok((player, status)) => {
                    delivery_details.insert(player, status);
                }
                Err(e) => {
                    // The target is recovered below by the sequential pass.
                    error!("Broadcast dispatch task failed: {}", e);
                }
            }
        }

        let dropped: Vec<PlayerId> = recipients
            .iter()
            .copied()
            .filter(|player| !delivery_details.contains_key(player))
            .collect();
        for player in dropped {
            let status = self.sender.send(player, event).await;
            delivery_details.insert(player, status);
        }

        let successful_deliveries = delivery_details
            .values()
            .filter(|status| status.success)
            .count();
        BroadcastOutcome {
            total_targets,
            excluded_players,
            successful_deliveries,
            failed_deliveries: delivery_details.len() - successful_deliveries,
            delivery_details,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::{Connection, ConnectionTable};
    use crate::error::{DirectoryError, TransportError};
    use crate::message_queue::MessageQueue;
    use crate::traits::{DeadConnectionSink, Transport, WorldDirectory};
    use crate::types::{ConnectionId, SessionId};
    use async_trait::async_trait;
    use serde_json::json;
    use tokio::sync::Mutex;

    struct PassthroughDirectory;

    #[async_trait]
    impl WorldDirectory for PassthroughDirectory {
        async fn resolve_canonical_room_id(
            &self,
            room_id: &RoomId,
        ) -> Result<RoomId, DirectoryError> {
            Ok(room_id.clone())
        }

        async fn list_rooms(&self) -> Result<Vec<RoomId>, DirectoryError> {
            Ok(Vec::new())
        }

        async fn room_players(&self, _room_id: &RoomId) -> Result<Vec<PlayerId>, DirectoryError> {
            Ok(Vec::new())
        }
    }

    #[derive(Default)]
    struct FakeTransport {
        sent: Mutex<Vec<(ConnectionId, serde_json::Value)>>,
        failing: Mutex<std::collections::HashSet<ConnectionId>>,
    }

    #[async_trait]
    impl Transport for FakeTransport {
        async fn send(
            &self,
            connection_id: ConnectionId,
            payload: &serde_json::Value,
        ) -> Result<(), TransportError> {
            if self.failing.lock().await.contains(&connection_id) {
                return Err(TransportError::Closed(connection_id));
            }
            self.sent.lock().await.push((connection_id, payload.clone()));
            Ok(())
        }

        async fn is_open(&self, _connection_id: ConnectionId) -> bool {
            true
        }

        async fn close(&self, _connection_id: ConnectionId, _code: u16, _reason: &str) {}
    }

    struct TableSink(Arc<ConnectionTable>);

    #[async_trait]
    impl DeadConnectionSink for TableSink {
        async fn cleanup_dead_connection(&self, _player_id: PlayerId, connection_id: ConnectionId) {
            self.0.remove(connection_id).await;
        }
    }

    struct Fixture {
        table: Arc<ConnectionTable>,
        transport: Arc<FakeTransport>,
        queue: Arc<MessageQueue>,
        rooms: Arc<RoomManager>,
        broadcaster: MessageBroadcaster,
    }

    fn fixture() -> Fixture {
        let table = Arc::new(ConnectionTable::new());
        let transport = Arc::new(FakeTransport::default());
        let queue = Arc::new(MessageQueue::new(50));
        let rooms = Arc::new(RoomManager::new(Arc::new(PassthroughDirectory)));
        let sender = Arc::new(PersonalMessageSender::new(
            table.clone(),
            transport.clone(),
            queue.clone(),
            Arc::new(TableSink(table.clone())),
            1024,
        ));
        let broadcaster = MessageBroadcaster::new(rooms.clone(), sender);
        Fixture {
            table,
            transport,
            queue,
            rooms,
            broadcaster,
        }
    }

    async fn connect(fx: &Fixture, player: PlayerId) -> ConnectionId {
        let connection = Connection::new(player, SessionId::new(), None);
        let id = connection.id;
        fx.table.insert(connection).await;
        id
    }

    #[tokio::test]
    async fn test_room_broadcast_excludes_sender() {
        let fx = fixture();
        let room = RoomId::new("town_square");
        let a = PlayerId::new();
        let b = PlayerId::new();
        let c = PlayerId::new();
        for player in [a, b, c] {
            connect(&fx, player).await;
            fx.rooms.subscribe(player, &room).await;
        }

        let outcome = fx
            .broadcaster
            .broadcast_to_room(&room, &json!({"type": "say", "text": "hi"}), Some(b))
            .await;

        assert_eq!(outcome.total_targets, 3);
        assert_eq!(outcome.excluded_players, 1);
        assert_eq!(outcome.successful_deliveries, 2);
        assert_eq!(outcome.failed_deliveries, 0);
        assert!(outcome.delivery_details.contains_key(&a));
        assert!(outcome.delivery_details.contains_key(&c));
        assert!(!outcome.delivery_details.contains_key(&b));
        assert_eq!(fx.transport.sent.lock().await.len(), 2);
    }

    #[tokio::test]
    async fn test_exclude_of_non_subscriber_counts_nothing() {
        let fx = fixture();
        let room = RoomId::new("cellar");
        let a = PlayerId::new();
        connect(&fx, a).await;
        fx.rooms.subscribe(a, &room).await;

        let outcome = fx
            .broadcaster
            .broadcast_to_room(&room, &json!({"type": "say"}), Some(PlayerId::new()))
            .await;
        assert_eq!(outcome.total_targets, 1);
        assert_eq!(outcome.excluded_players, 0);
        assert_eq!(outcome.successful_deliveries, 1);
    }

    #[tokio::test]
    async fn test_partial_failure_is_reported_per_target() {
        let fx = fixture();
        let room = RoomId::new("cellar");
        let healthy = PlayerId::new();
        let broken = PlayerId::new();
        connect(&fx, healthy).await;
        let broken_conn = connect(&fx, broken).await;
        fx.transport.failing.lock().await.insert(broken_conn);
        for player in [healthy, broken] {
            fx.rooms.subscribe(player, &room).await;
        }

        let outcome = fx
            .broadcaster
            .broadcast_to_room(&room, &json!({"type": "say"}), None)
            .await;

        assert_eq!(outcome.successful_deliveries, 1);
        assert_eq!(outcome.failed_deliveries, 1);
        assert!(outcome.delivery_details[&healthy].success);
        assert!(!outcome.delivery_details[&broken].success);
        // The failed target's event is waiting in the offline queue.
        assert!(fx.queue.has(broken).await);
    }

    #[tokio::test]
    async fn test_global_broadcast_reaches_supplied_players() {
        let fx = fixture();
        let a = PlayerId::new();
        let b = PlayerId::new();
        connect(&fx, a).await;
        connect(&fx, b).await;

        let outcome = fx
            .broadcaster
            .broadcast_global(
                &json!({"type": "shutdown_notice"}),
                Some(a),
                HashSet::from([a, b]),
            )
            .await;

        assert_eq!(outcome.total_targets, 2);
        assert_eq!(outcome.excluded_players, 1);
        assert_eq!(outcome.successful_deliveries, 1);
        assert!(outcome.delivery_details.contains_key(&b));
    }

    #[tokio::test]
    async fn test_empty_room_broadcast_is_harmless() {
        let fx = fixture();
        let outcome = fx
            .broadcaster
            .broadcast_to_room(&RoomId::new("void"), &json!({"type": "say"}), None)
            .await;
        assert_eq!(outcome.total_targets, 0);
        assert_eq!(outcome.successful_deliveries, 0);
        assert!(outcome.delivery_details.is_empty());
    }
}
