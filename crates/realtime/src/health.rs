//! Periodic connection liveness, staleness and token-revalidation sweeps.
//!
//! The monitor runs as a long-lived background task. Each cycle inspects
//! every active connection independently; a problem with one connection is
//! logged and never aborts the rest of the cycle or the loop. Only an
//! explicit shutdown signal stops rescheduling.

use crate::config::RealtimeConfig;
use crate::connection::{Connection, ConnectionTable};
use crate::traits::{DeadConnectionSink, TokenValidator, Transport};
use crate::types::current_timestamp;
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio::time::interval;
use tracing::{debug, info, warn};

/// Sweeps active connections for staleness, closed transports and expired
/// token validations.
pub struct HealthMonitor {
    table: Arc<ConnectionTable>,
    transport: Arc<dyn Transport>,
    validator: Arc<dyn TokenValidator>,
    dead: Arc<dyn DeadConnectionSink>,
    config: RealtimeConfig,
}

impl HealthMonitor {
    pub fn new(
        table: Arc<ConnectionTable>,
        transport: Arc<dyn Transport>,
        validator: Arc<dyn TokenValidator>,
        dead: Arc<dyn DeadConnectionSink>,
        config: RealtimeConfig,
    ) -> Self {
        Self {
            table,
            transport,
            validator,
            dead,
            config,
        }
    }

    /// Runs the sweep loop until the shutdown channel fires.
    pub async fn run(self: Arc<Self>, mut shutdown: broadcast::Receiver<()>) {
        let mut ticker = interval(self.config.health_check_interval());
        info!(
            "Health monitor running every {}s",
            self.config.health_check_interval
        );
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.run_cycle().await;
                }
                _ = shutdown.recv() => {
                    info!("Health monitor stopping");
                    break;
                }
            }
        }
    }

    /// One sweep over every active connection.
    pub async fn run_cycle(&self) -> usize {
        self.run_cycle_at(current_timestamp()).await
    }

    /// Clock-explicit form of [`run_cycle`](Self::run_cycle).
    pub async fn run_cycle_at(&self, now: u64) -> usize {
        let connections = self.table.snapshot().await;
        let mut torn_down = 0;
        for connection in connections {
            if self.is_stale(&connection, now).await {
                self.table.mark_unhealthy(connection.id).await;
                self.dead
                    .cleanup_dead_connection(connection.player_id, connection.id)
                    .await;
                torn_down += 1;
            }
        }
        if torn_down > 0 {
            info!("Health sweep removed {} stale connection(s)", torn_down);
        }
        torn_down
    }

    /// Applies the three staleness checks to one connection.
    async fn is_stale(&self, connection: &Connection, now: u64) -> bool {
        let idle = now.saturating_sub(connection.last_seen);
        if idle > self.config.connection_timeout {
            warn!(
                "Connection {} for {} idle {}s, over {}s timeout",
                connection.id, connection.player_id, idle, self.config.connection_timeout
            );
            return true;
        }

        if !self.transport.is_open(connection.id).await {
            warn!(
                "Connection {} for {} reported closed by transport",
                connection.id, connection.player_id
            );
            return true;
        }

        if let Some(token) = &connection.auth_token {
            let since_validation = now.saturating_sub(connection.last_token_validation);
            if since_validation >= self.config.token_revalidation_interval {
                if self
                    .validator
                    .validate_token(token, connection.player_id)
                    .await
                {
                    // Success refreshes the stamp; failure deliberately
                    // leaves it untouched.
                    self.table.set_token_validated(connection.id, now).await;
                    debug!("Token revalidated for {}", connection.player_id);
                } else {
                    warn!(
                        "Token revalidation failed for {} on {}",
                        connection.player_id, connection.id
                    );
                    return true;
                }
            }
        }
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::Connection;
    use crate::error::TransportError;
    use crate::types::{ConnectionId, PlayerId, SessionId};
    use async_trait::async_trait;
    use std::collections::HashSet;
    use tokio::sync::Mutex;

    struct FakeTransport {
        closed: Mutex<HashSet<ConnectionId>>,
    }

    #[async_trait]
    impl Transport for FakeTransport {
        async fn send(
            &self,
            _connection_id: ConnectionId,
            _payload: &serde_json::Value,
        ) -> Result<(), TransportError> {
            Ok(())
        }

        async fn is_open(&self, connection_id: ConnectionId) -> bool {
            !self.closed.lock().await.contains(&connection_id)
        }

        async fn close(&self, connection_id: ConnectionId, _code: u16, _reason: &str) {
            self.closed.lock().await.insert(connection_id);
        }
    }

    struct FakeValidator {
        valid: bool,
        calls: Mutex<u32>,
    }

    #[async_trait]
    impl TokenValidator for FakeValidator {
        async fn validate_token(&self, _token: &str, _player_id: PlayerId) -> bool {
            *self.calls.lock().await += 1;
            self.valid
        }
    }

    struct TableSink(Arc<ConnectionTable>);

    #[async_trait]
    impl DeadConnectionSink for TableSink {
        async fn cleanup_dead_connection(&self, _player_id: PlayerId, connection_id: ConnectionId) {
            self.0.remove(connection_id).await;
        }
    }

    fn monitor(
        table: Arc<ConnectionTable>,
        transport: Arc<FakeTransport>,
        validator: Arc<FakeValidator>,
    ) -> HealthMonitor {
        let config = RealtimeConfig {
            connection_timeout: 90,
            token_revalidation_interval: 300,
            ..RealtimeConfig::default()
        };
        HealthMonitor::new(
            table.clone(),
            transport,
            validator,
            Arc::new(TableSink(table)),
            config,
        )
    }

    fn fresh_parts() -> (Arc<ConnectionTable>, Arc<FakeTransport>, Arc<FakeValidator>) {
        (
            Arc::new(ConnectionTable::new()),
            Arc::new(FakeTransport {
                closed: Mutex::new(HashSet::new()),
            }),
            Arc::new(FakeValidator {
                valid: true,
                calls: Mutex::new(0),
            }),
        )
    }

    async fn insert_connection(
        table: &ConnectionTable,
        last_seen: u64,
        token: Option<&str>,
        last_validation: u64,
    ) -> ConnectionId {
        let mut connection =
            Connection::new(PlayerId::new(), SessionId::new(), token.map(String::from));
        connection.last_seen = last_seen;
        connection.last_token_validation = last_validation;
        let id = connection.id;
        table.insert(connection).await;
        id
    }

    #[tokio::test]
    async fn test_idle_connection_is_torn_down() {
        let (table, transport, validator) = fresh_parts();
        let monitor = monitor(table.clone(), transport, validator);
        let now = 10_000;
        insert_connection(&table, now - 91, None, now).await;
        insert_connection(&table, now - 10, None, now).await;

        assert_eq!(monitor.run_cycle_at(now).await, 1);
        assert_eq!(table.connection_count().await, 1);
    }

    #[tokio::test]
    async fn test_transport_closed_connection_is_torn_down() {
        let (table, transport, validator) = fresh_parts();
        let monitor = monitor(table.clone(), transport.clone(), validator);
        let now = 10_000;
        let id = insert_connection(&table, now, None, now).await;
        transport.closed.lock().await.insert(id);

        assert_eq!(monitor.run_cycle_at(now).await, 1);
        assert_eq!(table.connection_count().await, 0);
    }

    #[tokio::test]
    async fn test_token_revalidation_success_refreshes_stamp() {
        let (table, transport, validator) = fresh_parts();
        let monitor = monitor(table.clone(), transport, validator.clone());
        let now = 10_000;
        let id = insert_connection(&table, now, Some("tok"), now - 301).await;

        assert_eq!(monitor.run_cycle_at(now).await, 0);
        assert_eq!(*validator.calls.lock().await, 1);
        assert_eq!(table.get(id).await.unwrap().last_token_validation, now);

        // Freshly validated: the next cycle does not consult the validator.
        assert_eq!(monitor.run_cycle_at(now + 1).await, 0);
        assert_eq!(*validator.calls.lock().await, 1);
    }

    #[tokio::test]
    async fn test_token_revalidation_failure_tears_down_without_refresh() {
        let (table, transport, _) = fresh_parts();
        let validator = Arc::new(FakeValidator {
            valid: false,
            calls: Mutex::new(0),
        });
        let monitor = monitor(table.clone(), transport, validator.clone());
        let now = 10_000;
        insert_connection(&table, now, Some("tok"), now - 301).await;

        assert_eq!(monitor.run_cycle_at(now).await, 1);
        assert_eq!(table.connection_count().await, 0);
        assert_eq!(*validator.calls.lock().await, 1);
    }

    #[tokio::test]
    async fn test_recent_validation_is_trusted() {
        let (table, transport, _) = fresh_parts();
        let validator = Arc::new(FakeValidator {
            valid: false,
            calls: Mutex::new(0),
        });
        let monitor = monitor(table.clone(), transport, validator.clone());
        let now = 10_000;
        insert_connection(&table, now, Some("tok"), now - 10).await;

        // Inside the revalidation interval even an invalid token is not
        // consulted.
        assert_eq!(monitor.run_cycle_at(now).await, 0);
        assert_eq!(*validator.calls.lock().await, 0);
    }

    #[tokio::test]
    async fn test_shutdown_stops_loop() {
        let (table, transport, validator) = fresh_parts();
        let monitor = Arc::new(monitor(table, transport, validator));
        let (tx, rx) = broadcast::channel(1);

        let handle = tokio::spawn(monitor.run(rx));
        tx.send(()).unwrap();
        tokio::time::timeout(std::time::Duration::from_secs(1), handle)
            .await
            .expect("loop did not stop on shutdown")
            .unwrap();
    }
}
