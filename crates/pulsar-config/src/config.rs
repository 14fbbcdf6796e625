//! Configuration structs with sensible defaults and RON persistence.

use std::path::{Path, PathBuf};

use pulsar_proto::CompressionKind;
use serde::{Deserialize, Serialize};

/// Failure modes of config persistence, each naming the file involved.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("could not read {}: {source}", path.display())]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("could not write {}: {source}", path.display())]
    Write {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("{} is not valid RON: {source}", path.display())]
    Parse {
        path: PathBuf,
        source: ron::error::SpannedError,
    },

    #[error("config could not be serialized: {0}")]
    Serialize(#[from] ron::Error),
}

/// Top-level Pulsar configuration, shared by server and client binaries.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct Config {
    /// Socket and wire settings.
    pub transport: TransportConfig,
    /// Session, keep-alive, and capacity settings.
    pub session: SessionConfig,
    /// Debug/development settings.
    pub debug: DebugConfig,
}

/// Socket and wire configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct TransportConfig {
    /// Address the server binds, or the client connects to.
    pub address: String,
    /// Port for the reliable stream listener.
    pub tcp_port: u16,
    /// Port for the datagram socket.
    pub udp_port: u16,
    /// Maximum payload size on the reliable stream, in bytes.
    pub max_frame_bytes: u32,
    /// Whole-payload compression codec. Must match on both ends.
    pub compression: CompressionKind,
    /// Ingress queue depth before transport readers block.
    pub ingress_queue_capacity: usize,
}

/// Session, keep-alive, and capacity configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SessionConfig {
    /// Maximum concurrently connected peers; bounds the id pool.
    pub max_peers: u16,
    /// Application token a client must present at handshake.
    pub app_token: String,
    /// Seconds between reliable-stream keep-alives.
    pub reliable_keepalive_secs: u64,
    /// Seconds between datagram keep-alives.
    pub unreliable_keepalive_secs: u64,
    /// Seconds of silence before the server drops a peer.
    pub activity_timeout_secs: u64,
    /// Width of the datagram loss-counter window, in seconds.
    pub loss_window_secs: u64,
    /// Maximum retained append-mode cache entries.
    pub append_cache_cap: usize,
    /// Datagrams fired during the post-handshake rendezvous burst.
    pub rendezvous_burst: u32,
    /// Milliseconds granted for in-flight work during shutdown.
    pub shutdown_grace_ms: u64,
    /// Channels created at startup.
    pub channels: Vec<ChannelSpec>,
}

/// One configured channel.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ChannelSpec {
    /// Stable channel id. Must stay below 1000; ids from there up are
    /// reserved for runtime rooms.
    pub id: u32,
    /// Display name in the directory.
    pub name: String,
    /// Member cap, 0 for unlimited.
    pub max_peers: u16,
}

/// Debug/development configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct DebugConfig {
    /// Log level override (e.g., "debug", "info", "warn").
    pub log_level: String,
}

// --- Default implementations ---

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            address: "127.0.0.1".to_string(),
            tcp_port: 5055,
            udp_port: 5055,
            max_frame_bytes: 1_048_576,
            compression: CompressionKind::Deflate,
            ingress_queue_capacity: 1024,
        }
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            max_peers: 256,
            app_token: "pulsar-dev".to_string(),
            reliable_keepalive_secs: 15,
            unreliable_keepalive_secs: 1,
            activity_timeout_secs: 30,
            loss_window_secs: 10,
            append_cache_cap: 512,
            rendezvous_burst: 15,
            shutdown_grace_ms: 50,
            channels: vec![ChannelSpec::default()],
        }
    }
}

impl Default for ChannelSpec {
    fn default() -> Self {
        Self {
            id: 0,
            name: "lobby".to_string(),
            max_peers: 0,
        }
    }
}

impl Default for DebugConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
        }
    }
}

// --- Load / Save / Reload ---

impl Config {
    /// Load config from the given directory, or create a default config file.
    pub fn load_or_create(config_dir: &Path) -> Result<Self, ConfigError> {
        let config_path = config_dir.join("pulsar.ron");

        if config_path.exists() {
            let contents =
                std::fs::read_to_string(&config_path).map_err(|source| ConfigError::Read {
                    path: config_path.clone(),
                    source,
                })?;
            let config: Config = ron::from_str(&contents).map_err(|source| ConfigError::Parse {
                path: config_path.clone(),
                source,
            })?;
            log::info!("Loaded config from {}", config_path.display());
            Ok(config)
        } else {
            let config = Config::default();
            config.save(config_dir)?;
            log::info!("Created default config at {}", config_path.display());
            Ok(config)
        }
    }

    /// Save config to the given directory as `pulsar.ron`.
    pub fn save(&self, config_dir: &Path) -> Result<(), ConfigError> {
        std::fs::create_dir_all(config_dir).map_err(|source| ConfigError::Write {
            path: config_dir.to_path_buf(),
            source,
        })?;

        let config_path = config_dir.join("pulsar.ron");
        let pretty = ron::ser::PrettyConfig::new()
            .depth_limit(3)
            .separate_tuple_members(true)
            .enumerate_arrays(false);

        let serialized = ron::ser::to_string_pretty(self, pretty)?;

        std::fs::write(&config_path, serialized).map_err(|source| ConfigError::Write {
            path: config_path.clone(),
            source,
        })?;
        Ok(())
    }

    /// Hot-reload: returns `Some(new_config)` if the file changed, `None` otherwise.
    pub fn reload(&self, config_dir: &Path) -> Result<Option<Self>, ConfigError> {
        let config_path = config_dir.join("pulsar.ron");
        let contents =
            std::fs::read_to_string(&config_path).map_err(|source| ConfigError::Read {
                path: config_path.clone(),
                source,
            })?;
        let new_config: Config = ron::from_str(&contents).map_err(|source| ConfigError::Parse {
            path: config_path.clone(),
            source,
        })?;

        if &new_config != self {
            log::info!("Config reloaded with changes");
            Ok(Some(new_config))
        } else {
            Ok(None)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_serializes() {
        let config = Config::default();
        let ron_str =
            ron::ser::to_string_pretty(&config, ron::ser::PrettyConfig::new().depth_limit(3))
                .unwrap();
        assert!(!ron_str.is_empty());
        assert!(ron_str.contains("tcp_port: 5055"));
        assert!(ron_str.contains("max_peers: 256"));
    }

    #[test]
    fn test_config_roundtrip() {
        let config = Config::default();
        let ron_str = ron::to_string(&config).unwrap();
        let deserialized: Config = ron::from_str(&ron_str).unwrap();
        assert_eq!(config, deserialized);
    }

    #[test]
    fn test_missing_section_uses_default() {
        // Config missing the `session` section entirely
        let ron_str = "(transport: (), debug: ())";
        let config: Config = ron::from_str(ron_str).unwrap();
        assert_eq!(config.session, SessionConfig::default());
    }

    #[test]
    fn test_extra_field_ignored() {
        let ron_str = "(future_setting: true)";
        let result: Result<Config, _> = ron::from_str(ron_str);
        assert!(result.is_ok());
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = Config::default();
        config.transport.tcp_port = 9000;
        config.session.max_peers = 8;
        config.session.app_token = "staging".to_string();

        config.save(dir.path()).unwrap();
        let loaded = Config::load_or_create(dir.path()).unwrap();
        assert_eq!(config, loaded);
    }

    #[test]
    fn test_reload_detects_changes() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::default();
        config.save(dir.path()).unwrap();

        let mut modified = config.clone();
        modified.transport.tcp_port = 9000;
        modified.save(dir.path()).unwrap();

        let result = config.reload(dir.path()).unwrap();
        assert!(result.is_some());
        assert_eq!(result.unwrap().transport.tcp_port, 9000);
    }

    #[test]
    fn test_reload_no_changes() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::default();
        config.save(dir.path()).unwrap();

        let result = config.reload(dir.path()).unwrap();
        assert!(result.is_none());
    }

    #[test]
    fn test_invalid_ron_produces_error() {
        let result: Result<Config, _> = ron::from_str("{{not valid}}");
        assert!(result.is_err());
    }

    #[test]
    fn test_load_errors_name_the_file() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("nowhere");
        let err = Config::default().reload(&missing).unwrap_err();
        assert!(matches!(err, ConfigError::Read { .. }));
        assert!(err.to_string().contains("pulsar.ron"));
    }

    #[test]
    fn test_default_channels_include_a_lobby() {
        let config = Config::default();
        assert_eq!(config.session.channels.len(), 1);
        assert_eq!(config.session.channels[0].name, "lobby");
    }
}
