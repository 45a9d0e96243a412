//! Read-only composition of metrics from every realtime component.

use crate::connection::{ConnectionHealthStats, ConnectionTable};
use crate::memory::{MemoryMonitor, MemoryStats};
use crate::message_queue::{MessageQueue, MessageQueueStats};
use crate::rate_limit::{RateLimiterStats, SlidingWindowLimiter};
use crate::rooms::{RoomManager, RoomStats};
use crate::types::{current_timestamp, ConnectionId, PlayerId};
use serde::Serialize;
use std::sync::Arc;

/// Combined metrics snapshot of the realtime subsystem.
#[derive(Debug, Clone, Serialize)]
pub struct RealtimeStats {
    pub collected_at: u64,
    pub memory: MemoryStats,
    pub connection_attempts: RateLimiterStats,
    pub message_rate: RateLimiterStats,
    pub pending_messages: MessageQueueStats,
    pub rooms: RoomStats,
    pub connections: ConnectionHealthStats,
}

/// Collects a [`RealtimeStats`] snapshot without mutating any component.
pub struct StatisticsAggregator {
    table: Arc<ConnectionTable>,
    rooms: Arc<RoomManager>,
    queue: Arc<MessageQueue>,
    connection_limiter: Arc<SlidingWindowLimiter<PlayerId>>,
    message_limiter: Arc<SlidingWindowLimiter<ConnectionId>>,
    memory: Arc<MemoryMonitor>,
}

impl StatisticsAggregator {
    pub fn new(
        table: Arc<ConnectionTable>,
        rooms: Arc<RoomManager>,
        queue: Arc<MessageQueue>,
        connection_limiter: Arc<SlidingWindowLimiter<PlayerId>>,
        message_limiter: Arc<SlidingWindowLimiter<ConnectionId>>,
        memory: Arc<MemoryMonitor>,
    ) -> Self {
        Self {
            table,
            rooms,
            queue,
            connection_limiter,
            message_limiter,
            memory,
        }
    }

    /// One pass over every component's stats surface.
    pub async fn collect(&self) -> RealtimeStats {
        let now = current_timestamp();
        RealtimeStats {
            collected_at: now,
            memory: self.memory.get_memory_stats().await,
            connection_attempts: self.connection_limiter.stats().await,
            message_rate: self.message_limiter.stats().await,
            pending_messages: self.queue.stats().await,
            rooms: self.rooms.stats().await,
            connections: self.table.health_stats(now).await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RealtimeConfig;
    use crate::connection::Connection;
    use crate::error::DirectoryError;
    use crate::traits::WorldDirectory;
    use crate::types::{RoomId, SessionId};
    use async_trait::async_trait;
    use serde_json::json;

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

    #[tokio::test]
    async fn test_collect_composes_all_components() {
        let config = RealtimeConfig::default();
        let table = Arc::new(ConnectionTable::new());
        let rooms = Arc::new(RoomManager::new(Arc::new(PassthroughDirectory)));
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

        let player = PlayerId::new();
        table.insert(Connection::new(player, SessionId::new(), None)).await;
        rooms.subscribe(player, &RoomId::new("cellar")).await;
        queue.add(player, json!({"type": "tell"})).await;
        connection_limiter.check(&player).await;

        let aggregator = StatisticsAggregator::new(
            table,
            rooms,
            queue,
            connection_limiter,
            message_limiter,
            memory,
        );
        let stats = aggregator.collect().await;

        assert_eq!(stats.connections.total_connections, 1);
        assert_eq!(stats.connections.online_players, 1);
        assert_eq!(stats.rooms.total_subscriptions, 1);
        assert_eq!(stats.pending_messages.total_pending, 1);
        assert_eq!(stats.connection_attempts.total_entries, 1);
        assert_eq!(stats.message_rate.total_entries, 0);
        assert!(stats.memory.total_bytes > 0);
    }
}
