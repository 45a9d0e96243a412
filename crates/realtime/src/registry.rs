//! The connection registry: composition root of the realtime subsystem.
//!
//! Owns the shared connection table and wires the rate limiters, queues,
//! room manager, sender, broadcaster and background loops together. Every
//! collaborator (transport, token validation, world directory) is injected
//! at construction; nothing in here reaches for process-wide state.

use crate::broadcast::{BroadcastOutcome, MessageBroadcaster};
use crate::cleaner::{CleanupReport, ConnectionCleaner};
use crate::config::RealtimeConfig;
use crate::connection::{Connection, ConnectionTable};
use crate::error::RealtimeError;
use crate::health::HealthMonitor;
use crate::memory::MemoryMonitor;
use crate::message_queue::MessageQueue;
use crate::rate_limit::SlidingWindowLimiter;
use crate::rooms::RoomManager;
use crate::sender::{DeliveryStatus, PersonalMessageSender};
use crate::stats::{RealtimeStats, StatisticsAggregator};
use crate::traits::{DeadConnectionSink, TokenValidator, Transport, WorldDirectory};
use crate::types::{current_timestamp, ConnectionId, PlayerId, RoomId, SessionId};
use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Removal path for connections discovered dead anywhere in the subsystem.
///
/// Narrow by design: the sender, broadcaster and health monitor hold this
/// rather than the whole registry.
pub struct ConnectionReaper {
    table: Arc<ConnectionTable>,
    transport: Arc<dyn Transport>,
    message_limiter: Arc<SlidingWindowLimiter<ConnectionId>>,
}

#[async_trait]
impl DeadConnectionSink for ConnectionReaper {
    async fn cleanup_dead_connection(&self, player_id: PlayerId, connection_id: ConnectionId) {
        if self.table.remove(connection_id).await.is_some() {
            debug!("Reaped dead connection {} for {}", connection_id, player_id);
        }
        self.message_limiter.remove(&connection_id).await;
        // Best effort; the transport may already have dropped the socket.
        self.transport
            .close(connection_id, 1011, "connection reaped")
            .await;
    }
}

/// Orchestrates connection lifecycle, presence, delivery and cleanup.
pub struct ConnectionRegistry {
    config: RealtimeConfig,
    table: Arc<ConnectionTable>,
    rooms: Arc<RoomManager>,
    queue: Arc<MessageQueue>,
    connection_limiter: Arc<SlidingWindowLimiter<PlayerId>>,
    message_limiter: Arc<SlidingWindowLimiter<ConnectionId>>,
    transport: Arc<dyn Transport>,
    sender: Arc<PersonalMessageSender>,
    broadcaster: MessageBroadcaster,
    health: Arc<HealthMonitor>,
    cleaner: Arc<ConnectionCleaner>,
    aggregator: StatisticsAggregator,
    shutdown: broadcast::Sender<()>,
}

impl ConnectionRegistry {
    /// Builds the whole subsystem around the injected collaborators.
    pub fn new(
        config: RealtimeConfig,
        transport: Arc<dyn Transport>,
        validator: Arc<dyn TokenValidator>,
        directory: Arc<dyn WorldDirectory>,
    ) -> Self {
        let table = Arc::new(ConnectionTable::new());
        let rooms = Arc::new(RoomManager::new(directory.clone()));
        let queue = Arc::new(MessageQueue::new(config.max_messages_per_player));
        let connection_limiter = Arc::new(SlidingWindowLimiter::new(
            config.max_connection_attempts,
            config.connection_window(),
        ));
        let message_limiter = Arc::new(SlidingWindowLimiter::new(
            config.max_messages_per_minute,
            config.message_window(),
        ));
        let memory = Arc::new(MemoryMonitor::new(
            config.cleanup_interval(),
            config.memory_threshold,
        ));

        let reaper: Arc<dyn DeadConnectionSink> = Arc::new(ConnectionReaper {
            table: table.clone(),
            transport: transport.clone(),
            message_limiter: message_limiter.clone(),
        });
        let sender = Arc::new(PersonalMessageSender::new(
            table.clone(),
            transport.clone(),
            queue.clone(),
            reaper.clone(),
            config.max_payload_bytes,
        ));
        let broadcaster = MessageBroadcaster::new(rooms.clone(), sender.clone());
        let health = Arc::new(HealthMonitor::new(
            table.clone(),
            transport.clone(),
            validator,
            reaper.clone(),
            config.clone(),
        ));
        let cleaner = Arc::new(ConnectionCleaner::new(
            table.clone(),
            rooms.clone(),
            queue.clone(),
            connection_limiter.clone(),
            message_limiter.clone(),
            memory.clone(),
            transport.clone(),
            directory,
            reaper,
            config.clone(),
        ));
        let aggregator = StatisticsAggregator::new(
            table.clone(),
            rooms.clone(),
            queue.clone(),
            connection_limiter.clone(),
            message_limiter.clone(),
            memory,
        );
        let (shutdown, _) = broadcast::channel(1);

        Self {
            config,
            table,
            rooms,
            queue,
            connection_limiter,
            message_limiter,
            transport,
            sender,
            broadcaster,
            health,
            cleaner,
            aggregator,
            shutdown,
        }
    }

    /// Registers a new connection for a player, subject to the
    /// connection-attempt limiter.
    pub async fn register_connection(
        &self,
        player_id: PlayerId,
        session_id: SessionId,
        auth_token: Option<String>,
    ) -> Result<ConnectionId, RealtimeError> {
        if !self.connection_limiter.check(&player_id).await {
            warn!("Connection attempt by {} rate limited", player_id);
            return Err(RealtimeError::RateLimited(player_id.to_string()));
        }
        let connection = Connection::new(player_id, session_id, auth_token);
        let connection_id = connection.id;
        self.table.insert(connection).await;
        info!("Player {} connected on {}", player_id, connection_id);
        Ok(connection_id)
    }

    /// Updates last-seen bookkeeping for inbound activity.
    pub async fn record_activity(&self, connection_id: ConnectionId) -> bool {
        self.table.touch(connection_id, current_timestamp()).await
    }

    /// Admits or rejects one inbound message on the connection's sliding
    /// window. Rejection is the caller's signal to drop the message.
    pub async fn check_message_rate(&self, connection_id: ConnectionId) -> bool {
        self.message_limiter.check(&connection_id).await
    }

    /// Closes and deregisters a connection.
    pub async fn disconnect(&self, connection_id: ConnectionId, reason: &str) {
        self.transport.close(connection_id, 1000, reason).await;
        if let Some(connection) = self.table.remove(connection_id).await {
            info!(
                "Player {} disconnected from {} ({})",
                connection.player_id, connection_id, reason
            );
        }
        self.message_limiter.remove(&connection_id).await;
    }

    /// Delivers everything queued while the player was offline, in order.
    ///
    /// Each message goes back through the normal send path, so anything that
    /// fails again simply returns to the queue.
    pub async fn flush_pending(&self, player_id: PlayerId) -> usize {
        let pending = self.queue.drain(player_id).await;
        let count = pending.len();
        for message in pending {
            self.sender.send(player_id, &message).await;
        }
        if count > 0 {
            info!("Flushed {} pending message(s) to {}", count, player_id);
        }
        count
    }

    /// Sends one event to one player.
    pub async fn send_to_player(
        &self,
        player_id: PlayerId,
        event: &serde_json::Value,
    ) -> DeliveryStatus {
        self.sender.send(player_id, event).await
    }

    /// Broadcasts to a room's subscribers.
    pub async fn broadcast_to_room(
        &self,
        room_id: &RoomId,
        event: &serde_json::Value,
        exclude: Option<PlayerId>,
    ) -> BroadcastOutcome {
        self.broadcaster.broadcast_to_room(room_id, event, exclude).await
    }

    /// Broadcasts to every connected player.
    pub async fn broadcast_global(
        &self,
        event: &serde_json::Value,
        exclude: Option<PlayerId>,
    ) -> BroadcastOutcome {
        let online = self.table.online_players().await;
        self.broadcaster.broadcast_global(event, exclude, online).await
    }

    pub async fn subscribe_room(&self, player_id: PlayerId, room_id: &RoomId) {
        self.rooms.subscribe(player_id, room_id).await;
    }

    pub async fn unsubscribe_room(&self, player_id: PlayerId, room_id: &RoomId) {
        self.rooms.unsubscribe(player_id, room_id).await;
    }

    pub async fn enter_room(&self, player_id: PlayerId, room_id: &RoomId) {
        self.rooms.add_occupant(player_id, room_id).await;
    }

    pub async fn leave_room(&self, player_id: PlayerId, room_id: &RoomId) {
        self.rooms.remove_occupant(player_id, room_id).await;
    }

    /// Removes a player from every room, e.g. on character logout.
    pub async fn remove_player_from_all_rooms(&self, player_id: PlayerId) {
        self.rooms.remove_player_from_all_rooms(player_id).await;
    }

    pub async fn has_pending(&self, player_id: PlayerId) -> bool {
        self.queue.has(player_id).await
    }

    pub async fn connection_count(&self) -> usize {
        self.table.connection_count().await
    }

    pub async fn online_players(&self) -> std::collections::HashSet<PlayerId> {
        self.table.online_players().await
    }

    /// Spawns the health-monitor and cleanup loops. They stop when
    /// [`shutdown`](Self::shutdown) is called.
    pub fn start_background_tasks(&self) -> Vec<JoinHandle<()>> {
        vec![
            tokio::spawn(self.health.clone().run(self.shutdown.subscribe())),
            tokio::spawn(self.cleaner.clone().run(self.shutdown.subscribe())),
        ]
    }

    /// Administrative immediate cleanup.
    pub async fn force_cleanup(&self) -> CleanupReport {
        self.cleaner.force_cleanup().await
    }

    /// One full cleanup pass (stale players, orphaned data, ghosts) outside
    /// the periodic loop.
    pub async fn run_cleanup_cycle(&self) -> CleanupReport {
        self.cleaner.cleanup_cycle().await
    }

    /// One health sweep outside the periodic loop.
    pub async fn run_health_cycle(&self) -> usize {
        self.health.run_cycle().await
    }

    /// Combined metrics snapshot.
    pub async fn stats(&self) -> RealtimeStats {
        self.aggregator.collect().await
    }

    /// Signals the background loops to stop.
    pub fn shutdown(&self) {
        info!("Realtime registry shutting down");
        let _ = self.shutdown.send(());
    }

    pub fn config(&self) -> &RealtimeConfig {
        &self.config
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{DirectoryError, TransportError};
    use async_trait::async_trait;
    use serde_json::json;
    use std::collections::HashSet;
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

    struct AlwaysValid;

    #[async_trait]
    impl TokenValidator for AlwaysValid {
        async fn validate_token(&self, _token: &str, _player_id: PlayerId) -> bool {
            true
        }
    }

    #[derive(Default)]
    struct FakeTransport {
        sent: Mutex<Vec<(ConnectionId, serde_json::Value)>>,
        closed: Mutex<HashSet<ConnectionId>>,
    }

    #[async_trait]
    impl Transport for FakeTransport {
        async fn send(
            &self,
            connection_id: ConnectionId,
            payload: &serde_json::Value,
        ) -> Result<(), TransportError> {
            if self.closed.lock().await.contains(&connection_id) {
                return Err(TransportError::Closed(connection_id));
            }
            self.sent.lock().await.push((connection_id, payload.clone()));
            Ok(())
        }

        async fn is_open(&self, connection_id: ConnectionId) -> bool {
            !self.closed.lock().await.contains(&connection_id)
        }

        async fn close(&self, connection_id: ConnectionId, _code: u16, _reason: &str) {
            self.closed.lock().await.insert(connection_id);
        }
    }

    fn registry_with(transport: Arc<FakeTransport>, config: RealtimeConfig) -> ConnectionRegistry {
        ConnectionRegistry::new(
            config,
            transport,
            Arc::new(AlwaysValid),
            Arc::new(PassthroughDirectory),
        )
    }

    #[tokio::test]
    async fn test_register_and_disconnect_lifecycle() {
        let transport = Arc::new(FakeTransport::default());
        let registry = registry_with(transport.clone(), RealtimeConfig::default());
        let player = PlayerId::new();

        let id = registry
            .register_connection(player, SessionId::new(), None)
            .await
            .unwrap();
        assert_eq!(registry.connection_count().await, 1);
        assert!(registry.record_activity(id).await);

        registry.disconnect(id, "client quit").await;
        assert_eq!(registry.connection_count().await, 0);
        assert!(transport.closed.lock().await.contains(&id));
    }

    #[tokio::test]
    async fn test_connection_attempts_are_rate_limited() {
        let transport = Arc::new(FakeTransport::default());
        let config = RealtimeConfig {
            max_connection_attempts: 2,
            ..RealtimeConfig::default()
        };
        let registry = registry_with(transport, config);
        let player = PlayerId::new();

        for _ in 0..2 {
            registry
                .register_connection(player, SessionId::new(), None)
                .await
                .unwrap();
        }
        let err = registry
            .register_connection(player, SessionId::new(), None)
            .await
            .unwrap_err();
        assert!(matches!(err, RealtimeError::RateLimited(_)));
        // The rejected attempt left no partial state behind.
        assert_eq!(registry.connection_count().await, 2);
    }

    #[tokio::test]
    async fn test_offline_send_queues_then_flushes_on_reconnect() {
        let transport = Arc::new(FakeTransport::default());
        let registry = registry_with(transport.clone(), RealtimeConfig::default());
        let player = PlayerId::new();

        let status = registry
            .send_to_player(player, &json!({"type": "tell", "text": "hello"}))
            .await;
        assert!(status.success);
        assert!(registry.has_pending(player).await);

        registry
            .register_connection(player, SessionId::new(), None)
            .await
            .unwrap();
        assert_eq!(registry.flush_pending(player).await, 1);
        assert!(!registry.has_pending(player).await);

        let sent = transport.sent.lock().await;
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].1["text"], "hello");
    }

    #[tokio::test]
    async fn test_global_broadcast_uses_online_snapshot() {
        let transport = Arc::new(FakeTransport::default());
        let registry = registry_with(transport, RealtimeConfig::default());
        let a = PlayerId::new();
        let b = PlayerId::new();
        registry.register_connection(a, SessionId::new(), None).await.unwrap();
        registry.register_connection(b, SessionId::new(), None).await.unwrap();

        let outcome = registry
            .broadcast_global(&json!({"type": "notice"}), Some(a))
            .await;
        assert_eq!(outcome.total_targets, 2);
        assert_eq!(outcome.excluded_players, 1);
        assert_eq!(outcome.successful_deliveries, 1);
    }

    #[tokio::test]
    async fn test_message_rate_check_delegates_to_limiter() {
        let transport = Arc::new(FakeTransport::default());
        let config = RealtimeConfig {
            max_messages_per_minute: 1,
            ..RealtimeConfig::default()
        };
        let registry = registry_with(transport, config);
        let id = ConnectionId::new();
        assert!(registry.check_message_rate(id).await);
        assert!(!registry.check_message_rate(id).await);
    }

    #[tokio::test]
    async fn test_background_tasks_stop_on_shutdown() {
        let transport = Arc::new(FakeTransport::default());
        let registry = registry_with(transport, RealtimeConfig::default());
        let handles = registry.start_background_tasks();
        registry.shutdown();
        for handle in handles {
            tokio::time::timeout(std::time::Duration::from_secs(1), handle)
                .await
                .expect("background task did not stop")
                .unwrap();
        }
    }

    #[tokio::test]
    async fn test_stats_reflect_registry_state() {
        let transport = Arc::new(FakeTransport::default());
        let registry = registry_with(transport, RealtimeConfig::default());
        let player = PlayerId::new();
        registry.register_connection(player, SessionId::new(), None).await.unwrap();
        registry.subscribe_room(player, &RoomId::new("town_square")).await;

        let stats = registry.stats().await;
        assert_eq!(stats.connections.total_connections, 1);
        assert_eq!(stats.rooms.rooms_with_subscribers, 1);
        assert_eq!(stats.connection_attempts.tracked_keys, 1);
    }
}
