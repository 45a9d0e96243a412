//! Application configuration loaded from TOML.

use realtime::RealtimeConfig;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Root configuration object for the server binary.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    /// Network settings
    pub server: ServerSettings,
    /// Realtime subsystem tunables
    #[serde(default)]
    pub realtime: RealtimeConfig,
    /// World rooms served by this instance
    #[serde(default)]
    pub rooms: Vec<RoomEntry>,
    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingSettings,
}

/// Network configuration for the WebSocket listener.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerSettings {
    /// Address to bind, "IP:PORT"
    pub bind_address: String,
    /// Maximum concurrent connections accepted
    pub max_connections: usize,
}

/// One room definition: its canonical id and the aliases that resolve to it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoomEntry {
    pub id: String,
    #[serde(default)]
    pub aliases: Vec<String>,
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingSettings {
    /// Level filter: "trace", "debug", "info", "warn", "error"
    pub level: String,
    /// Emit structured JSON log lines
    pub json_format: bool,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json_format: false,
        }
    }
}

impl Default for AppConfig {
    /// Defaults suitable for local development.
    fn default() -> Self {
        Self {
            server: ServerSettings {
                bind_address: "127.0.0.1:4000".to_string(),
                max_connections: 2_000,
            },
            realtime: RealtimeConfig::default(),
            rooms: vec![RoomEntry {
                id: "town_square".to_string(),
                aliases: vec!["plaza".to_string(), "square".to_string()],
            }],
            logging: LoggingSettings::default(),
        }
    }
}

impl AppConfig {
    /// Loads configuration from a TOML file, or defaults when the file does
    /// not exist.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        if !path.exists() {
            tracing::info!("No config file at {}; using defaults", path.display());
            return Ok(Self::default());
        }
        let raw = std::fs::read_to_string(path)?;
        let config = toml::from_str(&raw)?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = AppConfig::default();
        assert_eq!(config.server.bind_address, "127.0.0.1:4000");
        assert!(!config.rooms.is_empty());
        assert_eq!(config.logging.level, "info");
    }

    #[test]
    fn test_config_roundtrip() {
        let config = AppConfig::default();
        let toml_str = toml::to_string(&config).unwrap();
        let parsed: AppConfig = toml::from_str(&toml_str).unwrap();
        assert_eq!(config.server.bind_address, parsed.server.bind_address);
        assert_eq!(config.realtime.connection_timeout, parsed.realtime.connection_timeout);
        assert_eq!(config.rooms.len(), parsed.rooms.len());
    }

    #[test]
    fn test_toml_parsing_with_partial_sections() {
        let toml_str = r#"
[server]
bind_address = "0.0.0.0:4000"
max_connections = 500

[[rooms]]
id = "tavern"
aliases = ["inn"]
        "#;

        let config: AppConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.server.max_connections, 500);
        assert_eq!(config.rooms[0].id, "tavern");
        // Omitted sections fall back to defaults.
        assert_eq!(config.realtime.max_messages_per_minute, 100);
        assert!(!config.logging.json_format);
    }

    #[test]
    fn test_load_missing_file_uses_defaults() {
        let config = AppConfig::load(Path::new("/nonexistent/thornmoor.toml")).unwrap();
        assert_eq!(config.server.bind_address, "127.0.0.1:4000");
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("thornmoor.toml");
        std::fs::write(
            &path,
            r#"
[server]
bind_address = "0.0.0.0:5000"
max_connections = 64

[realtime]
health_check_interval = 10
connection_timeout = 30
token_revalidation_interval = 120
max_connection_attempts = 3
connection_window = 60
max_messages_per_minute = 50
message_window = 60
max_messages_per_player = 20
cleanup_interval = 120
memory_threshold = 0.8
max_connection_age = 7200
max_pending_messages = 40
max_rate_limit_entries = 500
max_reconnect_attempts = 4
max_payload_bytes = 32768
            "#,
        )
        .unwrap();

        let config = AppConfig::load(&path).unwrap();
        assert_eq!(config.server.max_connections, 64);
        assert_eq!(config.realtime.max_messages_per_minute, 50);
        assert_eq!(config.realtime.memory_threshold, 0.8);
    }
}
