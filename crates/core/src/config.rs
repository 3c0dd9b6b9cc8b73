//! Configuration for peers and the relay
//!
//! Loaded from a TOML file. Every key is optional and falls back to its
//! default, so an absent file and an empty file behave the same.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::features::BinaryType;

/// Chunk size used by the transfer protocol unless configured otherwise
pub const DEFAULT_CHUNK_SIZE: usize = 8192;

/// Default relay port
pub const DEFAULT_RELAY_PORT: u16 = 7340;

/// Top-level configuration file
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TandemConfig {
    pub peer: PeerConfig,
    pub relay: RelayConfig,
}

/// Per-peer negotiation and transfer settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PeerConfig {
    /// Payload bytes per chunk on a file channel
    pub chunk_size: usize,
    /// Preferred binary representation advertised on the feature channel
    pub binary_type: BinaryType,
    /// Consecutive resets tolerated before negotiation is declared failed
    pub max_reset_attempts: u32,
    /// Delay before the first retry; doubled for each consecutive reset
    pub reset_backoff_ms: u64,
    /// Upper bound for the reset delay
    pub max_reset_backoff_ms: u64,
    /// Inbound transfers with no traffic for this long are evicted
    pub transfer_idle_timeout_secs: u64,
    /// Sender pauses once this many bytes are queued on a channel
    pub buffered_amount_high: usize,
    /// Sender resumes once the queue drains below this
    pub buffered_amount_low: usize,
}

impl Default for PeerConfig {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
            binary_type: BinaryType::ArrayBuffer,
            max_reset_attempts: 8,
            reset_backoff_ms: 250,
            max_reset_backoff_ms: 8000,
            transfer_idle_timeout_secs: 30,
            buffered_amount_high: 1024 * 1024,
            buffered_amount_low: 256 * 1024,
        }
    }
}

impl PeerConfig {
    /// Backoff before the given (1-based) consecutive reset attempt
    pub fn reset_backoff(&self, attempt: u32) -> Duration {
        if attempt == 0 || self.reset_backoff_ms == 0 {
            return Duration::ZERO;
        }
        let factor = 1u64.checked_shl(attempt - 1).unwrap_or(u64::MAX);
        let millis = self
            .reset_backoff_ms
            .saturating_mul(factor)
            .min(self.max_reset_backoff_ms);
        Duration::from_millis(millis)
    }

    /// Idle eviction window for inbound transfers; zero disables eviction
    pub fn transfer_idle_timeout(&self) -> Option<Duration> {
        (self.transfer_idle_timeout_secs > 0)
            .then(|| Duration::from_secs(self.transfer_idle_timeout_secs))
    }
}

/// Relay server settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    pub port: u16,
    /// Members allowed in one room
    pub max_room_peers: usize,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            port: DEFAULT_RELAY_PORT,
            max_room_peers: 2,
        }
    }
}

impl TandemConfig {
    /// Parse a config from TOML text
    pub fn from_toml(text: &str) -> Result<Self> {
        Ok(toml::from_str(text)?)
    }

    /// Load a config file, returning defaults if it does not exist
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            tracing::debug!(path = %path.display(), "No config file, using defaults");
            return Ok(Self::default());
        }
        let text = std::fs::read_to_string(path)?;
        Self::from_toml(&text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = TandemConfig::default();
        assert_eq!(config.peer.chunk_size, 8192);
        assert_eq!(config.relay.max_room_peers, 2);
    }

    #[test]
    fn test_partial_toml() {
        let config = TandemConfig::from_toml(
            r#"
            [peer]
            chunk_size = 4096
            binary_type = "blob"

            [relay]
            port = 9000
            "#,
        )
        .unwrap();

        assert_eq!(config.peer.chunk_size, 4096);
        assert_eq!(config.peer.binary_type, BinaryType::Blob);
        assert_eq!(config.peer.max_reset_attempts, 8);
        assert_eq!(config.relay.port, 9000);
        assert_eq!(config.relay.max_room_peers, 2);
    }

    #[test]
    fn test_invalid_toml_rejected() {
        assert!(TandemConfig::from_toml("[peer]\nchunk_size = \"big\"").is_err());
    }

    #[test]
    fn test_load_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let config = TandemConfig::load(&dir.path().join("tandem.toml")).unwrap();
        assert_eq!(config, TandemConfig::default());
    }

    #[test]
    fn test_load_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tandem.toml");
        std::fs::write(&path, "[relay]\nmax_room_peers = 4\n").unwrap();

        let config = TandemConfig::load(&path).unwrap();
        assert_eq!(config.relay.max_room_peers, 4);
    }

    #[test]
    fn test_reset_backoff_doubles_and_caps() {
        let config = PeerConfig {
            reset_backoff_ms: 100,
            max_reset_backoff_ms: 500,
            ..PeerConfig::default()
        };
        assert_eq!(config.reset_backoff(0), Duration::ZERO);
        assert_eq!(config.reset_backoff(1), Duration::from_millis(100));
        assert_eq!(config.reset_backoff(2), Duration::from_millis(200));
        assert_eq!(config.reset_backoff(3), Duration::from_millis(400));
        assert_eq!(config.reset_backoff(4), Duration::from_millis(500));
        assert_eq!(config.reset_backoff(80), Duration::from_millis(500));
    }

    #[test]
    fn test_zero_idle_timeout_disables_eviction() {
        let config = PeerConfig {
            transfer_idle_timeout_secs: 0,
            ..PeerConfig::default()
        };
        assert_eq!(config.transfer_idle_timeout(), None);
        assert_eq!(
            PeerConfig::default().transfer_idle_timeout(),
            Some(Duration::from_secs(30))
        );
    }
}
