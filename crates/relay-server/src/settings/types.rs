use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use relay_bus::BusConfig;
use relay_store::StoreConfig;

use super::loader::relay_home;

/// Store path value that keeps history in memory.
pub const IN_MEMORY_STORE: &str = ":memory:";

/// Root settings type for the relay.
///
/// Loaded from `~/.relay/settings.json` (or `--config`) with defaults applied
/// for missing fields. Example:
///
/// ```json
/// { "bus": { "host": "localhost" }, "presence": { "counterparts": { "alice": "bob" } } }
/// ```
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RelaySettings {
    pub server: ServerSettings,
    pub bus: BusSettings,
    pub store: StoreSettings,
    pub presence: PresenceSettings,
    pub telemetry: TelemetrySettings,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerSettings {
    /// Bind address.
    pub host: String,
    pub port: u16,
    /// Outbound frames buffered per connection before sends start failing.
    pub max_send_queue: usize,
    /// WebSocket ping interval.
    pub heartbeat_interval_secs: u64,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 5000,
            max_send_queue: 256,
            heartbeat_interval_secs: 30,
        }
    }
}

impl ServerSettings {
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs.max(1))
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct BusSettings {
    /// `false` runs with an in-process bus (single instance only).
    pub enabled: bool,
    pub host: String,
    pub port: u16,
    pub channel: String,
    pub max_retries: u32,
    pub retry_delay_secs: u64,
    /// Interval between resubscribe attempts while the listener is down.
    pub resubscribe_interval_secs: u64,
    /// Pause after a failed read before the listener retries.
    pub error_backoff_ms: u64,
}

impl Default for BusSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            host: "redis".to_string(),
            port: 6379,
            channel: "chat_messages".to_string(),
            max_retries: 5,
            retry_delay_secs: 5,
            resubscribe_interval_secs: 10,
            error_backoff_ms: 1000,
        }
    }
}

impl BusSettings {
    pub fn connect_config(&self) -> BusConfig {
        BusConfig {
            host: self.host.clone(),
            port: self.port,
            max_retries: self.max_retries,
            retry_delay: Duration::from_secs(self.retry_delay_secs),
        }
    }

    pub fn resubscribe_interval(&self) -> Duration {
        Duration::from_secs(self.resubscribe_interval_secs)
    }

    pub fn error_backoff(&self) -> Duration {
        Duration::from_millis(self.error_backoff_ms)
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreSettings {
    pub enabled: bool,
    /// Kept for deployments that still export `MONGO_HOST`; unused by SQLite.
    pub host: String,
    pub port: u16,
    /// Database file, or `:memory:`.
    pub path: String,
    pub max_retries: u32,
    pub retry_delay_secs: u64,
    /// Maximum records returned by a history query.
    pub history_limit: u32,
}

impl Default for StoreSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            host: "mongodb".to_string(),
            port: 27017,
            path: relay_home()
                .join("database")
                .join("history.db")
                .to_string_lossy()
                .into_owned(),
            max_retries: 5,
            retry_delay_secs: 5,
            history_limit: 100,
        }
    }
}

impl StoreSettings {
    pub fn connect_config(&self) -> StoreConfig {
        let path = match self.path.trim() {
            "" | IN_MEMORY_STORE => None,
            p => Some(PathBuf::from(p)),
        };
        StoreConfig {
            path,
            max_retries: self.max_retries,
            retry_delay: Duration::from_secs(self.retry_delay_secs),
        }
    }
}

/// Who gets told when an identity comes online or goes offline.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct PresenceSettings {
    pub counterparts: BTreeMap<String, String>,
    /// Counterpart for identities missing from `counterparts`.
    pub default_counterpart: Option<String>,
}

impl Default for PresenceSettings {
    fn default() -> Self {
        let counterparts = [("A", "B")]
            .into_iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Self {
            counterparts,
            default_counterpart: Some("A".to_string()),
        }
    }
}

impl PresenceSettings {
    /// Mapped counterpart, else the default. Never `user_id` itself.
    pub fn counterpart_of(&self, user_id: &str) -> Option<&str> {
        self.counterparts
            .get(user_id)
            .or(self.default_counterpart.as_ref())
            .map(String::as_str)
            .filter(|c| *c != user_id)
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct TelemetrySettings {
    pub level: String,
    pub json: bool,
    /// Per-module level overrides, e.g. `{"relay_bus": "debug"}`.
    pub module_levels: BTreeMap<String, String>,
}

impl Default for TelemetrySettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: true,
            module_levels: BTreeMap::new(),
        }
    }
}

impl TelemetrySettings {
    pub fn module_level_pairs(&self) -> Vec<(String, String)> {
        self.module_levels
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let s = RelaySettings::default();
        assert_eq!(s.server.port, 5000);
        assert_eq!(s.server.bind_addr(), "0.0.0.0:5000");
        assert_eq!(s.bus.channel, "chat_messages");
        assert_eq!(s.bus.resubscribe_interval(), Duration::from_secs(10));
        assert_eq!(s.store.history_limit, 100);
        assert!(s.store.path.ends_with("history.db"));
        assert_eq!(s.telemetry.level, "info");
    }

    #[test]
    fn default_counterparts_pair_a_and_b() {
        let p = PresenceSettings::default();
        assert_eq!(p.counterpart_of("A"), Some("B"));
        assert_eq!(p.counterpart_of("B"), Some("A"));
    }

    #[test]
    fn unmapped_identities_announce_to_default() {
        let p = PresenceSettings::default();
        assert_eq!(p.counterpart_of("C"), Some("A"));
        assert_eq!(p.counterpart_of("zoe"), Some("A"));

        let none = PresenceSettings {
            default_counterpart: None,
            ..PresenceSettings::default()
        };
        assert_eq!(none.counterpart_of("C"), None);
        assert_eq!(none.counterpart_of("A"), Some("B"));
    }

    #[test]
    fn counterpart_is_never_self() {
        let p = PresenceSettings {
            counterparts: [("X".to_string(), "X".to_string())].into_iter().collect(),
            default_counterpart: Some("A".to_string()),
        };
        assert_eq!(p.counterpart_of("X"), None);
        assert_eq!(p.counterpart_of("A"), None);
    }

    #[test]
    fn partial_json_fills_defaults() {
        let s: RelaySettings =
            serde_json::from_str(r#"{"server": {"port": 9000}, "bus": {"enabled": false}}"#).unwrap();
        assert_eq!(s.server.port, 9000);
        assert_eq!(s.server.host, "0.0.0.0");
        assert!(!s.bus.enabled);
        assert_eq!(s.bus.port, 6379);
    }

    #[test]
    fn memory_store_path_maps_to_none() {
        let store = StoreSettings {
            path: IN_MEMORY_STORE.to_string(),
            ..StoreSettings::default()
        };
        assert!(store.connect_config().path.is_none());

        let store = StoreSettings {
            path: "/var/lib/relay/history.db".to_string(),
            ..StoreSettings::default()
        };
        assert_eq!(
            store.connect_config().path,
            Some(PathBuf::from("/var/lib/relay/history.db"))
        );
    }

    #[test]
    fn bus_connect_config_copies_retry_policy() {
        let bus = BusSettings {
            max_retries: 2,
            retry_delay_secs: 1,
            ..BusSettings::default()
        };
        let config = bus.connect_config();
        assert_eq!(config.max_retries, 2);
        assert_eq!(config.retry_delay, Duration::from_secs(1));
        assert_eq!(config.url(), "redis://redis:6379/");
    }

    #[test]
    fn heartbeat_never_zero() {
        let server = ServerSettings {
            heartbeat_interval_secs: 0,
            ..ServerSettings::default()
        };
        assert_eq!(server.heartbeat_interval(), Duration::from_secs(1));
    }
}
