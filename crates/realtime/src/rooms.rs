//! Room subscription and occupancy tracking.
//!
//! Every room carries two independent player sets: *subscribers* are the
//! explicit broadcast audience, *occupants* are the authoritative in-room
//! presence used for ghost detection. The two are reconciled periodically
//! rather than kept consistent by construction.

use crate::traits::WorldDirectory;
use crate::types::{PlayerId, RoomId};
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::debug;

/// Aggregate room metrics for the statistics report.
#[derive(Debug, Clone, Default, Serialize)]
pub struct RoomStats {
    pub rooms_with_subscribers: usize,
    pub total_subscriptions: usize,
    pub rooms_with_occupants: usize,
    pub total_occupants: usize,
}

/// Tracks per-room subscriber and occupant sets.
///
/// All room ids pass through the world directory's canonicalization first so
/// aliases and the canonical name address the same sets. A failed lookup
/// degrades to the raw id instead of failing the operation.
pub struct RoomManager {
    directory: Arc<dyn WorldDirectory>,
    subscribers: RwLock<HashMap<RoomId, HashSet<PlayerId>>>,
    occupants: RwLock<HashMap<RoomId, HashSet<PlayerId>>>,
}

impl RoomManager {
    pub fn new(directory: Arc<dyn WorldDirectory>) -> Self {
        Self {
            directory,
            subscribers: RwLock::new(HashMap::new()),
            occupants: RwLock::new(HashMap::new()),
        }
    }

    /// Resolves a room id to its canonical form, falling back to the raw id
    /// when the directory cannot answer.
    pub async fn canonical(&self, room_id: &RoomId) -> RoomId {
        match self.directory.resolve_canonical_room_id(room_id).await {
            Ok(canonical) => canonical,
            Err(e) => {
                debug!("Room canonicalization failed for {}: {}; using raw id", room_id, e);
                room_id.clone()
            }
        }
    }

    /// Adds the player to the room's subscriber set.
    pub async fn subscribe(&self, player_id: PlayerId, room_id: &RoomId) {
        let room = self.canonical(room_id).await;
        self.subscribers
            .write()
            .await
            .entry(room)
            .or_default()
            .insert(player_id);
    }

    /// Removes the player from the room's subscriber set, deleting the set if
    /// it empties.
    pub async fn unsubscribe(&self, player_id: PlayerId, room_id: &RoomId) {
        let room = self.canonical(room_id).await;
        let mut subscribers = self.subscribers.write().await;
        if let Some(set) = subscribers.get_mut(&room) {
            set.remove(&player_id);
            if set.is_empty() {
                subscribers.remove(&room);
            }
        }
    }

    /// Adds the player to the room's occupant set.
    pub async fn add_occupant(&self, player_id: PlayerId, room_id: &RoomId) {
        let room = self.canonical(room_id).await;
        self.occupants
            .write()
            .await
            .entry(room)
            .or_default()
            .insert(player_id);
    }

    /// Removes the player from the room's occupant set, deleting the set if
    /// it empties.
    pub async fn remove_occupant(&self, player_id: PlayerId, room_id: &RoomId) {
        let room = self.canonical(room_id).await;
        let mut occupants = self.occupants.write().await;
        if let Some(set) = occupants.get_mut(&room) {
            set.remove(&player_id);
            if set.is_empty() {
                occupants.remove(&room);
            }
        }
    }

    /// Returns a defensive copy of the room's subscriber set.
    ///
    /// Callers iterate this while deliveries mutate the real sets; they must
    /// never observe a half-mutated set.
    pub async fn get_subscribers(&self, room_id: &RoomId) -> HashSet<PlayerId> {
        let room = self.canonical(room_id).await;
        self.subscribers
            .read()
            .await
            .get(&room)
            .cloned()
            .unwrap_or_default()
    }

    /// The room's occupants filtered to ids present in the supplied online
    /// snapshot.
    pub async fn get_occupants(
        &self,
        room_id: &RoomId,
        online_players: &HashSet<PlayerId>,
    ) -> HashSet<PlayerId> {
        let room = self.canonical(room_id).await;
        self.occupants
            .read()
            .await
            .get(&room)
            .map(|set| set.intersection(online_players).copied().collect())
            .unwrap_or_default()
    }

    /// Occupants recorded in the room but absent from the online snapshot.
    ///
    /// These are ghost *candidates* only; the cleaner confirms each one has
    /// zero live connections before removal, so a player mid-reconnect is
    /// never deleted.
    pub async fn ghost_candidates(
        &self,
        room_id: &RoomId,
        online_players: &HashSet<PlayerId>,
    ) -> HashSet<PlayerId> {
        let room = self.canonical(room_id).await;
        self.occupants
            .read()
            .await
            .get(&room)
            .map(|set| set.difference(online_players).copied().collect())
            .unwrap_or_default()
    }

    /// Replaces the room's occupant set with its intersection against the
    /// online snapshot, returning the displaced players.
    pub async fn reconcile(
        &self,
        room_id: &RoomId,
        online_players: &HashSet<PlayerId>,
    ) -> HashSet<PlayerId> {
        let room = self.canonical(room_id).await;
        let mut occupants = self.occupants.write().await;
        let Some(set) = occupants.get_mut(&room) else {
            return HashSet::new();
        };
        let displaced: HashSet<PlayerId> = set.difference(online_players).copied().collect();
        set.retain(|p| online_players.contains(p));
        if set.is_empty() {
            occupants.remove(&room);
        }
        displaced
    }

    /// Removes the player from every room's subscriber and occupant sets,
    /// pruning rooms left empty.
    pub async fn remove_player_from_all_rooms(&self, player_id: PlayerId) {
        {
            let mut subscribers = self.subscribers.write().await;
            subscribers.retain(|_, set| {
                set.remove(&player_id);
                !set.is_empty()
            });
        }
        {
            let mut occupants = self.occupants.write().await;
            occupants.retain(|_, set| {
                set.remove(&player_id);
                !set.is_empty()
            });
        }
    }

    /// Rooms that currently have at least one recorded occupant.
    pub async fn rooms_with_occupants(&self) -> Vec<RoomId> {
        self.occupants.read().await.keys().cloned().collect()
    }

    /// Aggregate metrics for the statistics report.
    pub async fn stats(&self) -> RoomStats {
        let subscribers = self.subscribers.read().await;
        let total_subscriptions = subscribers.values().map(|s| s.len()).sum();
        let rooms_with_subscribers = subscribers.len();
        drop(subscribers);

        let occupants = self.occupants.read().await;
        RoomStats {
            rooms_with_subscribers,
            total_subscriptions,
            rooms_with_occupants: occupants.len(),
            total_occupants: occupants.values().map(|s| s.len()).sum(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::DirectoryError;
    use async_trait::async_trait;

    /// Directory that resolves "plaza" to "town_square" and errors on ids
    /// starting with "broken".
    struct AliasDirectory;

    #[async_trait]
    impl WorldDirectory for AliasDirectory {
        async fn resolve_canonical_room_id(
            &self,
            room_id: &RoomId,
        ) -> Result<RoomId, DirectoryError> {
            if room_id.as_str().starts_with("broken") {
                return Err(DirectoryError::Unavailable("store offline".into()));
            }
            if room_id.as_str() == "plaza" {
                return Ok(RoomId::new("town_square"));
            }
            Ok(room_id.clone())
        }

        async fn list_rooms(&self) -> Result<Vec<RoomId>, DirectoryError> {
            Ok(vec![RoomId::new("town_square")])
        }

        async fn room_players(&self, _room_id: &RoomId) -> Result<Vec<PlayerId>, DirectoryError> {
            Ok(Vec::new())
        }
    }

    fn manager() -> RoomManager {
        RoomManager::new(Arc::new(AliasDirectory))
    }

    #[tokio::test]
    async fn test_subscribe_resolves_aliases() {
        let rooms = manager();
        let player = PlayerId::new();
        rooms.subscribe(player, &RoomId::new("plaza")).await;

        let subs = rooms.get_subscribers(&RoomId::new("town_square")).await;
        assert!(subs.contains(&player));
    }

    #[tokio::test]
    async fn test_lookup_failure_falls_back_to_raw_id() {
        let rooms = manager();
        let player = PlayerId::new();
        rooms.subscribe(player, &RoomId::new("broken_vault")).await;

        let subs = rooms.get_subscribers(&RoomId::new("broken_vault")).await;
        assert!(subs.contains(&player));
    }

    #[tokio::test]
    async fn test_unsubscribe_deletes_empty_set() {
        let rooms = manager();
        let player = PlayerId::new();
        let room = RoomId::new("cellar");
        rooms.subscribe(player, &room).await;
        rooms.unsubscribe(player, &room).await;

        assert_eq!(rooms.stats().await.rooms_with_subscribers, 0);
    }

    #[tokio::test]
    async fn test_subscribers_and_occupants_are_independent() {
        let rooms = manager();
        let player = PlayerId::new();
        let room = RoomId::new("cellar");
        rooms.subscribe(player, &room).await;

        let online = HashSet::from([player]);
        assert!(rooms.get_occupants(&room, &online).await.is_empty());

        rooms.add_occupant(player, &room).await;
        rooms.unsubscribe(player, &room).await;
        assert!(rooms.get_occupants(&room, &online).await.contains(&player));
    }

    #[tokio::test]
    async fn test_get_occupants_filters_to_online() {
        let rooms = manager();
        let online_player = PlayerId::new();
        let offline_player = PlayerId::new();
        let room = RoomId::new("cellar");
        rooms.add_occupant(online_player, &room).await;
        rooms.add_occupant(offline_player, &room).await;

        let online = HashSet::from([online_player]);
        let occupants = rooms.get_occupants(&room, &online).await;
        assert_eq!(occupants, HashSet::from([online_player]));
    }

    #[tokio::test]
    async fn test_ghost_candidates_are_offline_occupants() {
        let rooms = manager();
        let p1 = PlayerId::new();
        let p2 = PlayerId::new();
        let room = RoomId::new("cellar");
        rooms.add_occupant(p1, &room).await;
        rooms.add_occupant(p2, &room).await;

        let online = HashSet::from([p1]);
        assert_eq!(rooms.ghost_candidates(&room, &online).await, HashSet::from([p2]));
    }

    #[tokio::test]
    async fn test_reconcile_replaces_occupants_and_reports_displaced() {
        let rooms = manager();
        let p1 = PlayerId::new();
        let p2 = PlayerId::new();
        let room = RoomId::new("cellar");
        rooms.add_occupant(p1, &room).await;
        rooms.add_occupant(p2, &room).await;

        let online = HashSet::from([p1]);
        let displaced = rooms.reconcile(&room, &online).await;
        assert_eq!(displaced, HashSet::from([p2]));

        let occupants = rooms.get_occupants(&room, &online).await;
        assert_eq!(occupants, HashSet::from([p1]));
    }

    #[tokio::test]
    async fn test_remove_player_from_all_rooms() {
        let rooms = manager();
        let player = PlayerId::new();
        let other = PlayerId::new();
        rooms.subscribe(player, &RoomId::new("cellar")).await;
        rooms.subscribe(other, &RoomId::new("cellar")).await;
        rooms.add_occupant(player, &RoomId::new("attic")).await;

        rooms.remove_player_from_all_rooms(player).await;

        assert!(!rooms.get_subscribers(&RoomId::new("cellar")).await.contains(&player));
        assert!(rooms.get_subscribers(&RoomId::new("cellar")).await.contains(&other));
        assert!(rooms.rooms_with_occupants().await.is_empty());
    }
}
