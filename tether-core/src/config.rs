//! TOML configuration for servers and clients.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::TetherError;
use crate::queue::QueueConfig;

// ── Server ───────────────────────────────────────────────────────

/// Top-level server configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub network: NetworkConfig,
    pub queue: QueueSection,
    pub security: SecurityConfig,
    pub maintenance: MaintenanceConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// Address to bind.
    pub ip: String,
    pub port: u16,
    /// Live connections beyond this are refused at accept time.
    pub max_connections: usize,
    /// Listen backlog.
    pub backlog: u32,
}

/// Queue pool tuning. Zero means "use the built-in default".
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueSection {
    pub max_channels: usize,
    pub max_queue_size: usize,
    pub default_delay_ms: u64,
    pub item_timeout_ms: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SecurityConfig {
    /// Packet encryption key; empty sends plaintext packets.
    pub key: String,
    /// JSON ban file; empty keeps bans in memory only.
    pub ban_file: String,
    /// Peer IPs that are always refused.
    pub blacklist: Vec<String>,
    /// When non-empty, only these peer IPs are admitted.
    pub whitelist: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MaintenanceConfig {
    /// Connections silent for longer than this are dropped.
    pub idle_timeout_secs: u64,
    pub verify_interval_secs: u64,
    pub ban_check_interval_secs: u64,
    /// Answer heartbeats and run the idle check.
    pub heartbeat: bool,
    /// Dispatch `command` packets.
    pub commands: bool,
    /// Periodically enforce and expire bans.
    pub ban_check: bool,
    /// How long `stop` lets queued packets drain.
    pub stop_grace_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level: "trace", "debug", "info", "warn", "error".
    pub level: String,
}

// ── Client ───────────────────────────────────────────────────────

/// Top-level client configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    pub network: ClientNetworkConfig,
    pub security: ClientSecurityConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientNetworkConfig {
    pub ip: String,
    pub port: u16,
    /// Zero waits for the OS connect timeout.
    pub connect_timeout_ms: u64,
    /// Default wait for a correlated reply; zero waits forever.
    pub request_timeout_ms: u64,
    pub http_timeout_ms: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientSecurityConfig {
    pub key: String,
}

// ── Defaults ─────────────────────────────────────────────────────

pub const DEFAULT_PORT: u16 = 8463;

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            ip: "0.0.0.0".into(),
            port: DEFAULT_PORT,
            max_connections: 1024,
            backlog: 1024,
        }
    }
}

impl Default for QueueSection {
    fn default() -> Self {
        Self {
            max_channels: 0,
            max_queue_size: 1024,
            default_delay_ms: 0,
            item_timeout_ms: 0,
        }
    }
}

impl Default for MaintenanceConfig {
    fn default() -> Self {
        Self {
            idle_timeout_secs: 300,
            verify_interval_secs: 60,
            ban_check_interval_secs: 60,
            heartbeat: true,
            commands: true,
            ban_check: true,
            stop_grace_ms: 5_000,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".into(),
        }
    }
}

impl Default for ClientNetworkConfig {
    fn default() -> Self {
        Self {
            ip: "127.0.0.1".into(),
            port: DEFAULT_PORT,
            connect_timeout_ms: 5_000,
            request_timeout_ms: 10_000,
            http_timeout_ms: 10_000,
        }
    }
}

// ── Derived settings ─────────────────────────────────────────────

fn non_zero_ms(ms: u64) -> Option<Duration> {
    (ms > 0).then(|| Duration::from_millis(ms))
}

impl QueueSection {
    pub fn to_queue_config(&self) -> QueueConfig {
        let defaults = QueueConfig::default();
        QueueConfig {
            max_channels: if self.max_channels == 0 {
                defaults.max_channels
            } else {
                self.max_channels
            },
            max_queue_size: if self.max_queue_size == 0 {
                defaults.max_queue_size
            } else {
                self.max_queue_size
            },
            default_delay: Duration::from_millis(self.default_delay_ms),
            item_timeout: non_zero_ms(self.item_timeout_ms),
        }
    }
}

impl MaintenanceConfig {
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }

    pub fn verify_interval(&self) -> Duration {
        Duration::from_secs(self.verify_interval_secs.max(1))
    }

    pub fn ban_check_interval(&self) -> Duration {
        Duration::from_secs(self.ban_check_interval_secs.max(1))
    }

    pub fn stop_grace(&self) -> Duration {
        Duration::from_millis(self.stop_grace_ms)
    }
}

impl ClientNetworkConfig {
    pub fn connect_timeout(&self) -> Option<Duration> {
        non_zero_ms(self.connect_timeout_ms)
    }

    pub fn request_timeout(&self) -> Option<Duration> {
        non_zero_ms(self.request_timeout_ms)
    }

    pub fn http_timeout(&self) -> Duration {
        non_zero_ms(self.http_timeout_ms).unwrap_or(Duration::from_secs(30))
    }
}

// ── Loading ──────────────────────────────────────────────────────

macro_rules! impl_toml_file {
    ($config:ty) => {
        impl $config {
            /// Parse a TOML file strictly.
            pub fn try_load(path: &Path) -> Result<Self, TetherError> {
                let contents = std::fs::read_to_string(path)?;
                Ok(toml::from_str(&contents)?)
            }

            /// Load configuration from a TOML file, falling back to defaults.
            pub fn load(path: &Path) -> Self {
                match std::fs::read_to_string(path) {
                    Ok(contents) => toml::from_str(&contents).unwrap_or_else(|e| {
                        tracing::warn!("invalid config {}: {e}; using defaults", path.display());
                        Self::default()
                    }),
                    Err(_) => {
                        tracing::info!("no config at {}; using defaults", path.display());
                        Self::default()
                    }
                }
            }

            /// Write the default configuration to a file (for bootstrapping).
            pub fn write_default(path: &Path) -> Result<(), TetherError> {
                let text = toml::to_string_pretty(&Self::default())
                    .map_err(|e| TetherError::Config(e.to_string()))?;
                std::fs::write(path, text)?;
                Ok(())
            }
        }
    };
}

impl_toml_file!(ServerConfig);
impl_toml_file!(ClientConfig);

// ── Tests ────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_serializes() {
        let text = toml::to_string_pretty(&ServerConfig::default()).unwrap();
        assert!(text.contains("idle_timeout_secs"));
        assert!(text.contains("max_queue_size"));
    }

    #[test]
    fn partial_file_keeps_defaults() {
        let cfg: ServerConfig = toml::from_str("[network]\nport = 9000\n").unwrap();
        assert_eq!(cfg.network.port, 9000);
        assert_eq!(cfg.network.ip, "0.0.0.0");
        assert_eq!(cfg.maintenance.idle_timeout(), Duration::from_secs(300));
    }

    #[test]
    fn zero_queue_values_fall_back() {
        let section = QueueSection {
            max_channels: 0,
            max_queue_size: 0,
            default_delay_ms: 0,
            item_timeout_ms: 0,
        };
        let queue = section.to_queue_config();
        assert!(queue.max_channels >= 1);
        assert_eq!(queue.max_queue_size, 1024);
        assert!(queue.item_timeout.is_none());
    }

    #[test]
    fn write_then_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("client.toml");
        ClientConfig::write_default(&path).unwrap();
        let cfg = ClientConfig::try_load(&path).unwrap();
        assert_eq!(cfg, ClientConfig::default());
        assert_eq!(cfg.network.connect_timeout(), Some(Duration::from_secs(5)));
    }

    #[test]
    fn missing_or_broken_file_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("nope.toml");
        assert_eq!(ServerConfig::load(&missing), ServerConfig::default());

        let broken = dir.path().join("broken.toml");
        std::fs::write(&broken, "network = 5").unwrap();
        assert_eq!(ServerConfig::load(&broken), ServerConfig::default());
        assert!(matches!(
            ServerConfig::try_load(&broken),
            Err(TetherError::Config(_))
        ));
    }
}
