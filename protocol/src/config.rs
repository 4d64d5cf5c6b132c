use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

use crate::error::{ProtocolError, Result};

/// Process-wide message exchange settings.
///
/// Never mutated in place: a reload builds a new value and swaps it in
/// through [`ConfigHandle`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// Fraction of outbound share messages silently dropped, for testing
    /// behavior under loss. Must lie in `[0, 1]`.
    pub message_drop_percentage: f64,
    /// Use the compact binary serializer instead of the verbose one.
    pub use_compact_serialization: bool,
    /// Deflate encoded objects before they are framed.
    pub use_compression: bool,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            message_drop_percentage: 0.0,
            use_compact_serialization: true,
            use_compression: false,
        }
    }
}

impl NetworkConfig {
    pub fn validate(&self) -> Result<()> {
        let p = self.message_drop_percentage;
        if !(0.0..=1.0).contains(&p) {
            return Err(ProtocolError::Config(format!(
                "message_drop_percentage must be within [0, 1], got {p}"
            )));
        }
        Ok(())
    }

    pub fn from_toml_str(contents: &str) -> Result<Self> {
        let config: NetworkConfig =
            toml::from_str(contents).map_err(|e| ProtocolError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path).map_err(|e| {
            ProtocolError::Config(format!("failed to read {}: {e}", path.display()))
        })?;
        Self::from_toml_str(&contents)
    }
}

/// Shared, atomically swappable reference to the current [`NetworkConfig`].
///
/// Readers take an `Arc` snapshot and keep using it for the whole
/// operation, so a concurrent reload is never observed half-applied.
#[derive(Clone)]
pub struct ConfigHandle {
    tx: Arc<watch::Sender<Arc<NetworkConfig>>>,
}

impl ConfigHandle {
    /// Wrap an initial configuration. Invalid values are rejected.
    pub fn new(config: NetworkConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self::from_valid(config))
    }

    fn from_valid(config: NetworkConfig) -> Self {
        let (tx, _rx) = watch::channel(Arc::new(config));
        Self { tx: Arc::new(tx) }
    }

    pub fn current(&self) -> Arc<NetworkConfig> {
        self.tx.borrow().clone()
    }

    /// Swap in a new configuration. Invalid values are rejected and the
    /// previous configuration stays active.
    pub fn replace(&self, config: NetworkConfig) -> Result<()> {
        config.validate()?;
        self.tx.send_replace(Arc::new(config));
        Ok(())
    }

    pub fn reload_from(&self, path: impl AsRef<Path>) -> Result<()> {
        let config = NetworkConfig::load(path)?;
        tracing::info!(
            drop = config.message_drop_percentage,
            compact = config.use_compact_serialization,
            compression = config.use_compression,
            "Network configuration reloaded"
        );
        self.replace(config)
    }
}

impl Default for ConfigHandle {
    fn default() -> Self {
        Self::from_valid(NetworkConfig::default())
    }
}

/// Settings for one node's neighbor connection manager.
#[derive(Debug, Clone)]
pub struct ManagerConfig {
    /// Upper bound on the HELLO exchange for a new connection.
    pub handshake_timeout: Duration,
    /// Connection attempts per known neighbor during the start-up sweep.
    pub dial_attempts: u32,
    /// Pause between failed connection attempts.
    pub dial_backoff: Duration,
    /// How long a best-effort close frame may take before it is abandoned.
    pub close_timeout: Duration,
    /// A link with no inbound message for this long is reported as stale.
    pub stale_after: Duration,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            handshake_timeout: Duration::from_secs(10),
            dial_attempts: 30,
            dial_backoff: Duration::from_secs(1),
            close_timeout: Duration::from_secs(1),
            stale_after: Duration::from_secs(30),
        }
    }
}
