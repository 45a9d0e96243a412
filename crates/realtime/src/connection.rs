//! Connection records and the shared presence table.
//!
//! The table owns the three registry maps (connections, player presence,
//! session index). Each map sits behind its own short-held lock and no
//! operation takes two locks at once, so compound updates are sequences of
//! single-lock steps rather than one wide critical section.

use crate::types::{current_timestamp, ConnectionId, PlayerId, SessionId};
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use tokio::sync::RwLock;

/// One live transport connection.
#[derive(Debug, Clone)]
pub struct Connection {
    pub id: ConnectionId,
    pub player_id: PlayerId,
    pub session_id: SessionId,
    pub established_at: u64,
    pub last_seen: u64,
    pub healthy: bool,
    pub auth_token: Option<String>,
    pub last_token_validation: u64,
}

impl Connection {
    /// Creates a fresh connection record for a player.
    pub fn new(player_id: PlayerId, session_id: SessionId, auth_token: Option<String>) -> Self {
        let now = current_timestamp();
        Self {
            id: ConnectionId::new(),
            player_id,
            session_id,
            established_at: now,
            last_seen: now,
            healthy: true,
            auth_token,
            last_token_validation: now,
        }
    }
}

/// A player's presence record: their live connections, current session and
/// last activity.
#[derive(Debug, Clone)]
pub struct PlayerPresence {
    pub connections: HashSet<ConnectionId>,
    pub session_id: SessionId,
    pub last_seen: u64,
}

/// Connection age distribution for the health report.
#[derive(Debug, Clone, Default, Serialize)]
pub struct AgeDistribution {
    pub under_minute: usize,
    pub under_hour: usize,
    pub under_day: usize,
    pub over_day: usize,
}

/// Connection-level health metrics for the statistics report.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ConnectionHealthStats {
    pub total_connections: usize,
    pub online_players: usize,
    pub tracked_players: usize,
    pub sessions: usize,
    pub healthy: usize,
    pub unhealthy: usize,
    pub age_distribution: AgeDistribution,
    pub connections_per_session: HashMap<String, usize>,
}

/// The shared connection/presence/session maps.
///
/// Invariant: a connection id lives in exactly one player's presence set,
/// guaranteed by ids being minted inside [`Connection::new`] and inserted
/// exactly once.
pub struct ConnectionTable {
    connections: RwLock<HashMap<ConnectionId, Connection>>,
    presence: RwLock<HashMap<PlayerId, PlayerPresence>>,
    sessions: RwLock<HashMap<SessionId, ConnectionId>>,
}

impl ConnectionTable {
    pub fn new() -> Self {
        Self {
            connections: RwLock::new(HashMap::new()),
            presence: RwLock::new(HashMap::new()),
            sessions: RwLock::new(HashMap::new()),
        }
    }

    /// Registers a connection in all three maps.
    pub async fn insert(&self, connection: Connection) {
        let id = connection.id;
        let player_id = connection.player_id;
        let session_id = connection.session_id;
        let last_seen = connection.last_seen;

        self.connections.write().await.insert(id, connection);
        {
            let mut presence = self.presence.write().await;
            let entry = presence.entry(player_id).or_insert_with(|| PlayerPresence {
                connections: HashSet::new(),
                session_id,
                last_seen,
            });
            entry.connections.insert(id);
            entry.session_id = session_id;
            entry.last_seen = last_seen;
        }
        self.sessions.write().await.insert(session_id, id);
    }

    /// Removes a connection from all three maps, returning its record.
    ///
    /// The player's presence entry stays behind even with zero connections;
    /// stale-player pruning owns its removal.
    pub async fn remove(&self, connection_id: ConnectionId) -> Option<Connection> {
        let connection = self.connections.write().await.remove(&connection_id)?;
        {
            let mut presence = self.presence.write().await;
            if let Some(entry) = presence.get_mut(&connection.player_id) {
                entry.connections.remove(&connection_id);
            }
        }
        {
            let mut sessions = self.sessions.write().await;
            if sessions.get(&connection.session_id) == Some(&connection_id) {
                sessions.remove(&connection.session_id);
            }
        }
        Some(connection)
    }

    /// Fetches a clone of a connection record.
    pub async fn get(&self, connection_id: ConnectionId) -> Option<Connection> {
        self.connections.read().await.get(&connection_id).cloned()
    }

    /// Updates last-seen bookkeeping for inbound activity on a connection.
    pub async fn touch(&self, connection_id: ConnectionId, now: u64) -> bool {
        let player_id = {
            let mut connections = self.connections.write().await;
            match connections.get_mut(&connection_id) {
                Some(connection) => {
                    connection.last_seen = now;
                    connection.player_id
                }
                None => return false,
            }
        };
        if let Some(entry) = self.presence.write().await.get_mut(&player_id) {
            entry.last_seen = now;
        }
        true
    }

    /// Marks a connection unhealthy.
    pub async fn mark_unhealthy(&self, connection_id: ConnectionId) {
        if let Some(connection) = self.connections.write().await.get_mut(&connection_id) {
            connection.healthy = false;
        }
    }

    /// Records a successful token revalidation.
    pub async fn set_token_validated(&self, connection_id: ConnectionId, now: u64) {
        if let Some(connection) = self.connections.write().await.get_mut(&connection_id) {
            connection.last_token_validation = now;
        }
    }

    /// Defensive copy of the player's connection ids.
    pub async fn connection_ids_for(&self, player_id: PlayerId) -> Vec<ConnectionId> {
        self.presence
            .read()
            .await
            .get(&player_id)
            .map(|entry| entry.connections.iter().copied().collect())
            .unwrap_or_default()
    }

    /// Number of live connections the player holds right now.
    pub async fn live_connection_count(&self, player_id: PlayerId) -> usize {
        self.presence
            .read()
            .await
            .get(&player_id)
            .map(|entry| entry.connections.len())
            .unwrap_or(0)
    }

    /// Players with at least one live connection.
    pub async fn online_players(&self) -> HashSet<PlayerId> {
        self.presence
            .read()
            .await
            .iter()
            .filter(|(_, entry)| !entry.connections.is_empty())
            .map(|(player_id, _)| *player_id)
            .collect()
    }

    /// Clone of every connection record, for sweep loops.
    pub async fn snapshot(&self) -> Vec<Connection> {
        self.connections.read().await.values().cloned().collect()
    }

    /// Per-player (last_seen, live connection count) pairs for pruning.
    pub async fn presence_ages(&self) -> Vec<(PlayerId, u64, usize)> {
        self.presence
            .read()
            .await
            .iter()
            .map(|(player_id, entry)| (*player_id, entry.last_seen, entry.connections.len()))
            .collect()
    }

    /// Removes a player's presence record entirely.
    pub async fn remove_player(&self, player_id: PlayerId) -> Option<PlayerPresence> {
        self.presence.write().await.remove(&player_id)
    }

    pub async fn connection_count(&self) -> usize {
        self.connections.read().await.len()
    }

    pub async fn player_count(&self) -> usize {
        self.presence.read().await.len()
    }

    /// Connection health metrics for the statistics report.
    pub async fn health_stats(&self, now: u64) -> ConnectionHealthStats {
        let mut stats = ConnectionHealthStats::default();
        {
            let connections = self.connections.read().await;
            stats.total_connections = connections.len();
            for connection in connections.values() {
                if connection.healthy {
                    stats.healthy += 1;
                } else {
                    stats.unhealthy += 1;
                }
                let age = now.saturating_sub(connection.established_at);
                if age < 60 {
                    stats.age_distribution.under_minute += 1;
                } else if age < 3_600 {
                    stats.age_distribution.under_hour += 1;
                } else if age < 86_400 {
                    stats.age_distribution.under_day += 1;
                } else {
                    stats.age_distribution.over_day += 1;
                }
                *stats
                    .connections_per_session
                    .entry(connection.session_id.to_string())
                    .or_insert(0) += 1;
            }
        }
        {
            let presence = self.presence.read().await;
            stats.tracked_players = presence.len();
            stats.online_players = presence
                .values()
                .filter(|entry| !entry.connections.is_empty())
                .count();
        }
        stats.sessions = self.sessions.read().await.len();
        stats
    }
}

impl Default for ConnectionTable {
    fn default() -> Self {
        Self::new()
    }
}
