//! Client configuration.
//!
//! Loaded from TOML; every field has a default. Relay entries are normalized on the way
//! in, so anything that is not a valid `wss://` endpoint silently disappears.

use crate::error::{ClientError, Result};
use crate::pool::PoolConfig;
use crate::registry::RegistryConfig;
use crate::relay::RelayConfig;
use crate::relay_url::{parse_relay_list, parse_relays};
use crate::remote_signer::RemoteSignerConfig;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Overrides the relay list when set (comma or whitespace separated).
pub const ENV_RELAYS: &str = "NOSTR_MUX_RELAYS";

pub const DEFAULT_RELAYS: &[&str] = &["wss://relay.damus.io", "wss://nos.lol"];

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MuxConfig {
    pub relays: Vec<String>,
    pub connect_timeout_ms: u64,
    pub publish_timeout_ms: u64,
    pub reconnect_base_delay_ms: u64,
    pub reconnect_max_delay_ms: u64,
    /// 0 means unlimited.
    pub max_reconnect_attempts: u32,
    /// 0 disables keepalive pings.
    pub ping_interval_secs: u64,
    pub max_relays: usize,
    pub seen_capacity: usize,
    pub remote_signer_timeout_ms: u64,
    pub client_name: String,
    /// HTTP endpoint that receives a plain copy of submitted reports.
    pub report_mirror_url: Option<String>,
    /// Let the pool dial `ws://` relays. Relay lists read from files and the
    /// environment are still normalized to `wss://`.
    pub allow_insecure_relays: bool,
}

impl Default for MuxConfig {
    fn default() -> Self {
        Self {
            relays: DEFAULT_RELAYS.iter().map(ToString::to_string).collect(),
            connect_timeout_ms: 10_000,
            publish_timeout_ms: 10_000,
            reconnect_base_delay_ms: 1_000,
            reconnect_max_delay_ms: 60_000,
            max_reconnect_attempts: 0,
            ping_interval_secs: 30,
            max_relays: 16,
            seen_capacity: 10_000,
            remote_signer_timeout_ms: 5_000,
            client_name: "nostr-mux".to_string(),
            report_mirror_url: None,
            allow_insecure_relays: false,
        }
    }
}

impl MuxConfig {
    pub fn from_toml_str(raw: &str) -> Result<Self> {
        let mut config: Self =
            toml::from_str(raw).map_err(|error| ClientError::Config(error.to_string()))?;
        config.relays = parse_relays(&config.relays);
        Ok(config)
    }

    /// Read a TOML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|error| {
            ClientError::Config(format!("cannot read {}: {}", path.display(), error))
        })?;
        Self::from_toml_str(&raw)
    }

    /// Read `path` if given, else use defaults; then apply the environment override.
    pub fn load_or_default(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(path) => Self::load(path)?,
            None => Self::default(),
        };
        config.apply_env();
        Ok(config)
    }

    pub fn to_toml_string(&self) -> Result<String> {
        toml::to_string_pretty(self).map_err(|error| ClientError::Config(error.to_string()))
    }

    /// Apply `NOSTR_MUX_RELAYS` if it is set.
    pub fn apply_env(&mut self) {
        if let Ok(raw) = std::env::var(ENV_RELAYS) {
            self.apply_relay_override(&raw);
        }
    }

    /// Replace the relay list with the entries of `raw` that survive normalization.
    pub fn apply_relay_override(&mut self, raw: &str) {
        self.relays = parse_relay_list(raw);
    }

    pub fn with_relays<I, S>(mut self, relays: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.relays = parse_relays(relays);
        self
    }

    pub fn relay_config(&self) -> RelayConfig {
        RelayConfig {
            connect_timeout: Duration::from_millis(self.connect_timeout_ms),
            reconnect_base_delay: Duration::from_millis(self.reconnect_base_delay_ms),
            reconnect_max_delay: Duration::from_millis(self.reconnect_max_delay_ms),
            max_reconnect_attempts: self.max_reconnect_attempts,
            ping_interval: (self.ping_interval_secs > 0)
                .then(|| Duration::from_secs(self.ping_interval_secs)),
        }
    }

    pub fn pool_config(&self) -> PoolConfig {
        PoolConfig {
            max_relays: self.max_relays,
            publish_timeout: Duration::from_millis(self.publish_timeout_ms),
            relay_config: self.relay_config(),
            allow_insecure: self.allow_insecure_relays,
        }
    }

    pub fn registry_config(&self) -> RegistryConfig {
        RegistryConfig {
            seen_capacity: self.seen_capacity,
        }
    }

    pub fn remote_signer_config(&self) -> RemoteSignerConfig {
        RemoteSignerConfig {
            timeout: Duration::from_millis(self.remote_signer_timeout_ms),
            client_name: self.client_name.clone(),
        }
    }
}
