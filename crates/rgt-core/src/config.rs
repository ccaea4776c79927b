//! `RgtConfig` — resolved runtime configuration (§1.1, §6).
//!
//! Resolution order, poorest to richest precedence: hardcoded defaults,
//! then the TOML file (if one is found), then individual environment
//! variable overrides. File location resolution is `$RGT_CONFIG` (an exact
//! path) → `$XDG_CONFIG_HOME/rgt/config.toml` → `~/.config/rgt/config.toml`.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

/// Top-level resolved configuration.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct RgtConfig {
    pub network: NetworkConfig,
    pub reliability: ReliabilityConfig,
}

impl Default for RgtConfig {
    fn default() -> Self {
        Self {
            network: NetworkConfig::default(),
            reliability: ReliabilityConfig::default(),
        }
    }
}

/// Transport + rate controller knobs.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// 0 = ephemeral port.
    pub port: u16,
    pub bind_address: String,
    /// Bytes per chunk. `None` derives from object size per §6's MTU-class rule.
    pub chunk_size: Option<u32>,
    pub initial_exposure_rate: f64,
    pub rate_min: f64,
    pub rate_max: f64,
    /// Scheduling tick for the rate controller, in milliseconds.
    pub rate_tick_ms: u64,
    /// Known receiver to push to unsolicited when `reliability.eager_push`
    /// is set (§9 "push vs pull"). Ignored in the (default) pull-driven mode.
    pub eager_push_peer: Option<String>,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            port: 0,
            bind_address: "0.0.0.0".to_string(),
            chunk_size: None,
            initial_exposure_rate: 200.0,
            rate_min: 10.0,
            rate_max: 20_000.0,
            rate_tick_ms: 10,
            eager_push_peer: None,
        }
    }
}

impl NetworkConfig {
    /// MTU-class chunk size derivation referenced by §6: single-MTU for
    /// objects under 64 KiB, 4×MTU under 1 MiB, 16×MTU beyond that.
    pub fn derive_chunk_size(&self, total_size: u64) -> u32 {
        if let Some(explicit) = self.chunk_size {
            return explicit;
        }
        const MTU: u32 = 1400;
        if total_size < 64 * 1024 {
            MTU
        } else if total_size < 1024 * 1024 {
            4 * MTU
        } else {
            16 * MTU
        }
    }

    /// Parse `eager_push_peer`, if set.
    pub fn resolved_eager_push_peer(&self) -> Result<Option<std::net::SocketAddr>, ConfigError> {
        self.eager_push_peer
            .as_ref()
            .map(|raw| {
                raw.parse()
                    .map_err(|e| ConfigError::ParseFailed(format!("eager_push_peer: {e}")))
            })
            .transpose()
    }
}

/// Integrity / timeout / retry knobs.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct ReliabilityConfig {
    pub integrity_mode: String, // "none" | "per_chunk_hash"
    pub cipher_mode: String,    // "none" | "stream_xor"
    /// Hex-encoded 32-byte pre-shared key; all-zero default if absent.
    pub pre_shared_key: Option<String>,
    pub handshake_timeout_ms: u64,
    pub nack_threshold_ms: u64,
    pub ack_interval_ms: u64,
    pub session_deadline_ms: u64,
    pub cancel_grace_ms: u64,
    pub base_backoff_ns: u64,
    pub max_retries: u32,
    pub recovery_scan_interval_ms: u64,
    /// §9 "push vs pull": when set, a sender may push EXPOSE_MANIFEST and
    /// CHUNK_DATA to a known peer without waiting for its EXPOSE_REQUEST /
    /// PULL_REQUEST first. Off by default — pull-driven emission is the
    /// spec's default mode; this is for loopback/benchmark use.
    pub eager_push: bool,
}

impl Default for ReliabilityConfig {
    fn default() -> Self {
        Self {
            integrity_mode: "per_chunk_hash".to_string(),
            cipher_mode: "none".to_string(),
            pre_shared_key: None,
            handshake_timeout_ms: 5_000,
            nack_threshold_ms: 250,
            ack_interval_ms: 100,
            session_deadline_ms: 300_000,
            cancel_grace_ms: 500,
            base_backoff_ns: 50_000_000, // 50ms
            max_retries: 8,
            recovery_scan_interval_ms: 100,
            eager_push: false,
        }
    }
}

impl ReliabilityConfig {
    /// Decode `pre_shared_key`, falling back to the all-zero default key.
    pub fn resolved_key(&self) -> Result<[u8; 32], ConfigError> {
        match &self.pre_shared_key {
            None => Ok(crate::crypto::DEFAULT_KEY),
            Some(hex_key) => {
                let bytes = hex::decode(hex_key)
                    .map_err(|e| ConfigError::ParseFailed(format!("pre_shared_key: {e}")))?;
                bytes.try_into().map_err(|v: Vec<u8>| {
                    ConfigError::ParseFailed(format!(
                        "pre_shared_key must be 32 bytes, got {}",
                        v.len()
                    ))
                })
            }
        }
    }

    /// Parse `integrity_mode` into the wire-level enum.
    pub fn resolved_integrity_mode(&self) -> Result<crate::manifest::IntegrityMode, ConfigError> {
        match self.integrity_mode.as_str() {
            "none" => Ok(crate::manifest::IntegrityMode::None),
            "per_chunk_hash" => Ok(crate::manifest::IntegrityMode::PerChunkHash),
            other => Err(ConfigError::ParseFailed(format!("unknown integrity_mode: {other}"))),
        }
    }

    /// Parse `cipher_mode` into the wire-level enum.
    pub fn resolved_cipher_mode(&self) -> Result<crate::manifest::CipherMode, ConfigError> {
        match self.cipher_mode.as_str() {
            "none" => Ok(crate::manifest::CipherMode::None),
            "stream_xor" => Ok(crate::manifest::CipherMode::StreamXor),
            other => Err(ConfigError::ParseFailed(format!("unknown cipher_mode: {other}"))),
        }
    }
}

impl RgtConfig {
    /// Resolve the configuration file path: `$RGT_CONFIG` if set, else the
    /// first of `$XDG_CONFIG_HOME/rgt/config.toml` or `~/.config/rgt/config.toml`
    /// that can be formed from available environment variables.
    pub fn file_path() -> Option<PathBuf> {
        if let Ok(explicit) = std::env::var("RGT_CONFIG") {
            return Some(PathBuf::from(explicit));
        }
        if let Ok(xdg) = std::env::var("XDG_CONFIG_HOME") {
            return Some(Path::new(&xdg).join("rgt").join("config.toml"));
        }
        std::env::var("HOME")
            .ok()
            .map(|home| Path::new(&home).join(".config").join("rgt").join("config.toml"))
    }

    /// Load the configuration: defaults, overlaid with the TOML file (if any
    /// is found and exists), overlaid with environment variable overrides.
    pub fn load() -> Result<Self, ConfigError> {
        let mut config = match Self::file_path() {
            Some(path) if path.exists() => Self::read_file(&path)?,
            _ => Self::default(),
        };
        config.apply_env_overrides();
        Ok(config)
    }

    fn read_file(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::ReadFailed(path.display().to_string(), e.to_string()))?;
        toml::from_str(&raw)
            .map_err(|e| ConfigError::ParseFailed(format!("{}: {e}", path.display())))
    }

    /// Write the current config to `path` if no file exists there yet.
    pub fn write_default_if_missing(path: &Path) -> Result<(), ConfigError> {
        if path.exists() {
            return Ok(());
        }
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| ConfigError::WriteFailed(path.display().to_string(), e.to_string()))?;
        }
        let serialized = toml::to_string_pretty(&Self::default())
            .map_err(|e| ConfigError::SerializeFailed(e.to_string()))?;
        std::fs::write(path, serialized)
            .map_err(|e| ConfigError::WriteFailed(path.display().to_string(), e.to_string()))
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(v) = std::env::var("RGT_PORT") {
            if let Ok(port) = v.parse() {
                self.network.port = port;
            }
        }
        if let Ok(v) = std::env::var("RGT_BIND_ADDRESS") {
            self.network.bind_address = v;
        }
        if let Ok(v) = std::env::var("RGT_CHUNK_SIZE") {
            if let Ok(size) = v.parse() {
                self.network.chunk_size = Some(size);
            }
        }
        if let Ok(v) = std::env::var("RGT_RATE_MIN") {
            if let Ok(rate) = v.parse() {
                self.network.rate_min = rate;
            }
        }
        if let Ok(v) = std::env::var("RGT_RATE_MAX") {
            if let Ok(rate) = v.parse() {
                self.network.rate_max = rate;
            }
        }
        if let Ok(v) = std::env::var("RGT_INTEGRITY_MODE") {
            self.reliability.integrity_mode = v;
        }
        if let Ok(v) = std::env::var("RGT_CIPHER_MODE") {
            self.reliability.cipher_mode = v;
        }
        if let Ok(v) = std::env::var("RGT_PRE_SHARED_KEY") {
            self.reliability.pre_shared_key = Some(v);
        }
        if let Ok(v) = std::env::var("RGT_SESSION_DEADLINE_MS") {
            if let Ok(ms) = v.parse() {
                self.reliability.session_deadline_ms = ms;
            }
        }
    }
}

/// Configuration-layer errors.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file {0}: {1}")]
    ReadFailed(String, String),
    #[error("failed to parse config: {0}")]
    ParseFailed(String),
    #[error("failed to write config file {0}: {1}")]
    WriteFailed(String, String),
    #[error("failed to serialize config: {0}")]
    SerializeFailed(String),
}
