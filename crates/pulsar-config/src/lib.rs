//! Configuration system for Pulsar.
//!
//! Provides runtime-configurable settings that persist to disk as RON files.
//! Supports hot-reload detection and forward/backward compatible
//! serialization.

mod config;

pub use config::{
    ChannelSpec, Config, ConfigError, DebugConfig, SessionConfig, TransportConfig,
};
