//! Stale-state pruning and orphaned-data cleanup.
//!
//! The cleaner repairs the drift that accumulates under churn: players who
//! vanished without a clean disconnect, rate windows and queues for ids
//! nobody will touch again, connections past their maximum age, and ghost
//! occupants left in rooms. It runs when the memory monitor says so, or on
//! demand through [`ConnectionCleaner::force_cleanup`].

use crate::config::RealtimeConfig;
use crate::connection::ConnectionTable;
use crate::memory::MemoryMonitor;
use crate::message_queue::MessageQueue;
use crate::rate_limit::SlidingWindowLimiter;
use crate::rooms::RoomManager;
use crate::traits::{DeadConnectionSink, Transport, WorldDirectory};
use crate::types::{current_timestamp, ConnectionId, PlayerId, RoomId};
use serde::Serialize;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::time::interval;
use tracing::{debug, info, warn};

/// What one cleanup pass removed.
#[derive(Debug, Clone, Default, Serialize)]
pub struct CleanupReport {
    pub stale_players_pruned: usize,
    pub aged_connections_closed: usize,
    pub rate_entries_dropped: usize,
    pub pending_messages_dropped: usize,
    pub ghost_occupants_removed: usize,
}

/// Periodic and on-demand cleanup over every stateful component.
pub struct ConnectionCleaner {
    table: Arc<ConnectionTable>,
    rooms: Arc<RoomManager>,
    queue: Arc<MessageQueue>,
    connection_limiter: Arc<SlidingWindowLimiter<PlayerId>>,
    message_limiter: Arc<SlidingWindowLimiter<ConnectionId>>,
    memory: Arc<MemoryMonitor>,
    transport: Arc<dyn Transport>,
    directory: Arc<dyn WorldDirectory>,
    dead: Arc<dyn DeadConnectionSink>,
    config: RealtimeConfig,
}

impl ConnectionCleaner {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        table: Arc<ConnectionTable>,
        rooms: Arc<RoomManager>,
        queue: Arc<MessageQueue>,
        connection_limiter: Arc<SlidingWindowLimiter<PlayerId>>,
        message_limiter: Arc<SlidingWindowLimiter<ConnectionId>>,
        memory: Arc<MemoryMonitor>,
        transport: Arc<dyn Transport>,
        directory: Arc<dyn WorldDirectory>,
        dead: Arc<dyn DeadConnectionSink>,
        config: RealtimeConfig,
    ) -> Self {
        Self {
            table,
            rooms,
            queue,
            connection_limiter,
            message_limiter,
            memory,
            transport,
            directory,
            dead,
            config,
        }
    }

    /// Runs the cleanup loop until the shutdown channel fires.
    ///
    /// The loop polls well below the cleanup interval so the memory-pressure
    /// trigger can fire early; each tick asks the monitor whether a pass is
    /// actually due.
    pub async fn run(self: Arc<Self>, mut shutdown: broadcast::Receiver<()>) {
        let poll = self
            .config
            .cleanup_interval()
            .min(Duration::from_secs(30))
            .max(Duration::from_secs(1));
        let mut ticker = interval(poll);
        info!(
            "Cleanup loop polling every {}s (cleanup interval {}s)",
            poll.as_secs(),
            self.config.cleanup_interval
        );
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if self.memory.should_cleanup().await {
                        let report = self.cleanup_cycle().await;
                        self.memory.mark_cleanup().await;
                        debug!("Cleanup pass: {:?}", report);
                    }
                }
                _ = shutdown.recv() => {
                    info!("Cleanup loop stopping");
                    break;
                }
            }
        }
    }

    /// One full cleanup pass: stale players, orphaned data, ghost occupants.
    pub async fn cleanup_cycle(&self) -> CleanupReport {
        self.cleanup_cycle_at(current_timestamp()).await
    }

    /// Clock-explicit form of [`cleanup_cycle`](Self::cleanup_cycle).
    pub async fn cleanup_cycle_at(&self, now: u64) -> CleanupReport {
        let mut report = CleanupReport::default();
        self.prune_stale_players(now, &mut report).await;
        self.cleanup_orphaned_data(now, &mut report).await;
        self.remove_ghost_occupants(&mut report).await;
        if report.stale_players_pruned + report.ghost_occupants_removed > 0 {
            info!(
                "Cleanup removed {} stale player(s), {} ghost occupant(s)",
                report.stale_players_pruned, report.ghost_occupants_removed
            );
        }
        report
    }

    /// Immediate administrative cleanup plus a garbage-collection request.
    pub async fn force_cleanup(&self) -> CleanupReport {
        let now = current_timestamp();
        let mut report = CleanupReport::default();
        self.prune_stale_players(now, &mut report).await;
        self.cleanup_orphaned_data(now, &mut report).await;
        self.memory.force_gc().await;
        self.memory.mark_cleanup().await;
        info!("Forced cleanup: {:?}", report);
        report
    }

    /// Removes every trace of players idle past the cleanup interval with no
    /// live connections.
    async fn prune_stale_players(&self, now: u64, report: &mut CleanupReport) {
        let threshold = self.config.cleanup_interval;
        for (player_id, last_seen, live_connections) in self.table.presence_ages().await {
            if live_connections > 0 || now.saturating_sub(last_seen) <= threshold {
                continue;
            }
            debug!(
                "Pruning stale player {} (idle {}s)",
                player_id,
                now.saturating_sub(last_seen)
            );
            self.table.remove_player(player_id).await;
            self.rooms.remove_player_from_all_rooms(player_id).await;
            self.connection_limiter.remove(&player_id).await;
            self.queue.remove(player_id).await;
            report.stale_players_pruned += 1;
        }
    }

    /// Trims limiter windows and pending queues, and retires connections
    /// past the maximum age.
    async fn cleanup_orphaned_data(&self, now: u64, report: &mut CleanupReport) {
        report.rate_entries_dropped += self
            .connection_limiter
            .cleanup_old(self.config.connection_window())
            .await;
        report.rate_entries_dropped += self
            .message_limiter
            .cleanup_old(self.config.message_window())
            .await;
        report.rate_entries_dropped += self
            .connection_limiter
            .cleanup_large(self.config.max_rate_limit_entries)
            .await;
        report.rate_entries_dropped += self
            .message_limiter
            .cleanup_large(self.config.max_rate_limit_entries)
            .await;

        report.pending_messages_dropped += self
            .queue
            .cleanup_old_at(Duration::from_secs(self.config.max_connection_age), now)
            .await;
        report.pending_messages_dropped += self
            .queue
            .cleanup_large(self.config.max_pending_messages)
            .await;

        for connection in self.table.snapshot().await {
            let age = now.saturating_sub(connection.established_at);
            if age > self.config.max_connection_age {
                debug!(
                    "Closing connection {} for {}: {}s old",
                    connection.id, connection.player_id, age
                );
                self.transport
                    .close(connection.id, 1000, "connection exceeded maximum age")
                    .await;
                self.dead
                    .cleanup_dead_connection(connection.player_id, connection.id)
                    .await;
                report.aged_connections_closed += 1;
            }
        }
    }

    /// Removes occupants no longer online, double-checking each candidate
    /// still has zero live connections so a player mid-reconnect survives.
    ///
    /// The sweep covers every room the world directory lists plus any room
    /// carrying occupants under a raw id. A directory failure skips the
    /// sweep for this cycle; it never fails the cleanup pass.
    async fn remove_ghost_occupants(&self, report: &mut CleanupReport) {
        let mut rooms: HashSet<RoomId> = match self.directory.list_rooms().await {
            Ok(listed) => listed.into_iter().collect(),
            Err(e) => {
                warn!("Room listing failed: {}; skipping ghost sweep this cycle", e);
                return;
            }
        };
        rooms.extend(self.rooms.rooms_with_occupants().await);

        let online = self.table.online_players().await;
        for room_id in rooms {
            for candidate in self.rooms.ghost_candidates(&room_id, &online).await {
                if self.table.live_connection_count(candidate).await > 0 {
                    // Connected but missing from the snapshot: mid-reconnect.
                    continue;
                }
                debug!("Removing ghost occupant {} from {}", candidate, room_id);
                self.rooms.remove_occupant(candidate, &room_id).await;
                report.ghost_occupants_removed += 1;
            }
        }
    }
}
