//! Server configuration module
//!
//! Parses and manages connection server configuration from YAML files.
//! Every field except `listen_address` has a serde default, so a config file
//! only needs to name what it changes.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::time::Duration;

/// Largest CRC footer the filter can produce.
pub const MAX_CRC_LENGTH: u8 = 4;

/// Smallest datagram size that still leaves room for headers, filter
/// overhead and a fragment size prefix.
pub const MIN_UDP_SIZE: u32 = 64;

/// Sequence windows wider than half the u16 space make wrap-around
/// comparisons ambiguous.
pub const MAX_WINDOW_SIZE: u16 = 0x7FFF;

/// Main server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    // ============================================
    // Listener
    // ============================================
    /// Address the connection server binds to
    pub listen_address: String,

    #[serde(default = "default_listen_port")]
    pub listen_port: u16,

    /// UDP echo port used by the client's latency display
    #[serde(default = "default_ping_port")]
    pub ping_port: u16,

    #[serde(default = "default_max_sessions")]
    pub max_sessions: usize,

    // ============================================
    // Galaxy
    // ============================================
    /// Reported in ClientPermissionsMessage (1 = available)
    #[serde(default = "default_galaxy_status")]
    pub galaxy_status: u8,

    // ============================================
    // Transport
    // ============================================
    #[serde(default)]
    pub protocol: ProtocolConfig,

    // ============================================
    // Development accounts (in-memory providers)
    // ============================================
    #[serde(default)]
    pub dev_accounts: Vec<DevAccount>,
}

/// Tunables for the SOE reliable transport.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProtocolConfig {
    /// Largest datagram either side will send
    #[serde(default = "default_max_udp_size")]
    pub max_udp_size: u32,

    /// Bytes of CRC footer (0 disables it)
    #[serde(default = "default_crc_length")]
    pub crc_length: u8,

    #[serde(default = "default_compression")]
    pub compression: bool,

    /// Bodies shorter than this are never compressed
    #[serde(default = "default_compression_threshold")]
    pub compression_threshold: usize,

    /// Session maintenance tick in milliseconds
    #[serde(default = "default_update_interval_ms")]
    pub update_interval_ms: u64,

    #[serde(default = "default_resend_delay_ms")]
    pub resend_delay_ms: u64,

    /// Resends of one packet before the session is dropped
    #[serde(default = "default_max_resends")]
    pub max_resends: u32,

    /// Idle time before a session is timed out
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,

    /// Sequences accepted ahead of the expected one, and unacknowledged
    /// packets allowed in flight
    #[serde(default = "default_window_size")]
    pub window_size: u16,
}

/// A login that the in-memory providers accept.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DevAccount {
    pub session_key: String,
    pub account_id: u32,
    pub player_id: u64,
    #[serde(default = "default_max_characters")]
    pub max_characters: u32,
}

// ============================================
// Default value functions
// These are called by serde when a field is missing
// ============================================

fn default_listen_port() -> u16 {
    44463
}

fn default_ping_port() -> u16 {
    44462
}

fn default_max_sessions() -> usize {
    1024
}

fn default_galaxy_status() -> u8 {
    1
}

fn default_max_udp_size() -> u32 {
    496
}

fn default_crc_length() -> u8 {
    2
}

fn default_compression() -> bool {
    true
}

fn default_compression_threshold() -> usize {
    32
}

fn default_update_interval_ms() -> u64 {
    5
}

fn default_resend_delay_ms() -> u64 {
    1000
}

fn default_max_resends() -> u32 {
    30
}

fn default_timeout_secs() -> u64 {
    60
}

fn default_window_size() -> u16 {
    128
}

fn default_max_characters() -> u32 {
    2
}

impl Default for ProtocolConfig {
    fn default() -> Self {
        Self {
            max_udp_size: default_max_udp_size(),
            crc_length: default_crc_length(),
            compression: default_compression(),
            compression_threshold: default_compression_threshold(),
            update_interval_ms: default_update_interval_ms(),
            resend_delay_ms: default_resend_delay_ms(),
            max_resends: default_max_resends(),
            timeout_secs: default_timeout_secs(),
            window_size: default_window_size(),
        }
    }
}

impl ProtocolConfig {
    pub fn update_interval(&self) -> Duration {
        Duration::from_millis(self.update_interval_ms)
    }

    pub fn resend_delay(&self) -> Duration {
        Duration::from_millis(self.resend_delay_ms)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    fn validate(&self) -> Result<()> {
        anyhow::ensure!(
            self.max_udp_size >= MIN_UDP_SIZE,
            "max_udp_size too small: {} (min {})",
            self.max_udp_size,
            MIN_UDP_SIZE
        );
        anyhow::ensure!(
            self.crc_length <= MAX_CRC_LENGTH,
            "crc_length too large: {} (max {})",
            self.crc_length,
            MAX_CRC_LENGTH
        );
        anyhow::ensure!(self.update_interval_ms > 0, "update_interval_ms cannot be 0");
        anyhow::ensure!(self.timeout_secs > 0, "timeout_secs cannot be 0");
        anyhow::ensure!(
            self.window_size > 0 && self.window_size <= MAX_WINDOW_SIZE,
            "window_size out of range: {} (1..={})",
            self.window_size,
            MAX_WINDOW_SIZE
        );
        Ok(())
    }
}

impl ServerConfig {
    /// Load configuration from a YAML file
    ///
    /// # Example
    /// ```no_run
    /// use soe_server::config::ServerConfig;
    ///
    /// let config = ServerConfig::from_file("conf/connection.yaml")
    ///     .expect("Failed to load config");
    /// println!("Listening on {}:{}", config.listen_address, config.listen_port);
    /// ```
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let config: ServerConfig = serde_yaml::from_str(&contents)
            .with_context(|| format!("Failed to parse YAML in {}", path.display()))?;

        config.validate()?;

        Ok(config)
    }

    /// Parse configuration from a YAML string
    ///
    /// Useful for testing
    pub fn from_str(contents: &str) -> Result<Self> {
        let config: ServerConfig = serde_yaml::from_str(contents)
            .context("Failed to parse YAML")?;

        config.validate()?;

        Ok(config)
    }

    /// Checks that required fields are set and values are usable
    fn validate(&self) -> Result<()> {
        anyhow::ensure!(!self.listen_address.is_empty(), "listen_address cannot be empty");
        anyhow::ensure!(self.max_sessions > 0, "max_sessions cannot be 0");
        anyhow::ensure!(
            self.listen_port == 0 || self.listen_port != self.ping_port,
            "listen_port and ping_port must differ"
        );

        for account in &self.dev_accounts {
            anyhow::ensure!(
                !account.session_key.is_empty(),
                "dev account {} has an empty session_key",
                account.account_id
            );
        }

        self.protocol.validate().context("Invalid protocol section")?;

        Ok(())
    }

    /// Save configuration to a YAML file
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let yaml = serde_yaml::to_string(&self)
            .context("Failed to serialize config to YAML")?;

        fs::write(path.as_ref(), yaml)
            .with_context(|| format!("Failed to write config to {}", path.as_ref().display()))?;

        Ok(())
    }
}
