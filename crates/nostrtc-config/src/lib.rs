//! Shared configuration for nostrtc tools
//!
//! Reads from ~/.nostrtc/config.toml

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::PathBuf;
use std::time::Duration;

/// Default signaling relays
pub const DEFAULT_RELAYS: &[&str] = &[
    "wss://relay.damus.io",
    "wss://nos.lol",
    "wss://relay.primal.net",
];

/// Public STUN servers usable without credentials
pub const PUBLIC_STUN_SERVERS: &[&str] = &[
    "stun.cloudflare.com:3478",
    "stun.l.google.com:19302",
    "stun.l.google.com:5349",
    "stun1.l.google.com:3478",
    "stun1.l.google.com:5349",
    "stun2.l.google.com:19302",
    "stun2.l.google.com:5349",
    "stun3.l.google.com:3478",
    "stun3.l.google.com:5349",
    "stun4.l.google.com:19302",
    "stun4.l.google.com:5349",
    "stunserver2024.stunprotocol.org:3478",
];

/// Event kind used for signaling and fallback traffic
pub const DEFAULT_KIND: u16 = 29999;

/// Top-level config structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub signaling: SignalingConfig,
    #[serde(default)]
    pub rtc: RtcSettings,
    #[serde(default)]
    pub turn: TurnSettings,
    #[serde(default)]
    pub log: LogConfig,
}

/// Relays, room key and server lists
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignalingConfig {
    #[serde(default = "default_relays")]
    pub relays: Vec<String>,
    /// Shared room secret (hex or nsec). Everyone holding it joins the same room.
    #[serde(default)]
    pub channel_key: Option<String>,
    #[serde(default = "default_stun_servers")]
    pub stun_servers: Vec<String>,
    /// Relays we advertise for fallback traffic addressed to us
    #[serde(default)]
    pub fallback_relays: Vec<String>,
    /// Merge `stun` entries from relay information documents
    #[serde(default = "default_true")]
    pub use_relay_stun: bool,
    /// Merge `turn` entries from relay information documents
    #[serde(default = "default_true")]
    pub use_relay_fallback: bool,
}

impl Default for SignalingConfig {
    fn default() -> Self {
        Self {
            relays: default_relays(),
            channel_key: None,
            stun_servers: default_stun_servers(),
            fallback_relays: vec![],
            use_relay_stun: true,
            use_relay_fallback: true,
        }
    }
}

fn default_relays() -> Vec<String> {
    DEFAULT_RELAYS.iter().map(|s| s.to_string()).collect()
}

fn default_stun_servers() -> Vec<String> {
    PUBLIC_STUN_SERVERS.iter().map(|s| s.to_string()).collect()
}

fn default_true() -> bool {
    true
}

/// Timing policy for discovery, connection attempts and signaling.
///
/// All durations are stored in milliseconds so the TOML stays flat.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RtcSettings {
    pub announce_interval_ms: u64,
    pub peer_expiration_ms: u64,
    pub gc_interval_ms: u64,
    pub autoconnect_interval_ms: u64,
    pub kind: u16,
    /// A connection still `connecting` after this long reads as disconnected
    pub connection_attempt_timeout_ms: u64,
    /// Time the direct path gets to open once both descriptions are applied
    pub p2p_attempt_timeout_ms: u64,
    /// Lifetime requested from relays for signaling events
    pub signal_expiration_ms: u64,
    pub candidate_debounce_ms: u64,
    pub candidate_reemit_interval_ms: u64,
}

impl Default for RtcSettings {
    fn default() -> Self {
        Self {
            announce_interval_ms: 10_000,
            peer_expiration_ms: 5 * 60 * 1000,
            gc_interval_ms: 60_000,
            autoconnect_interval_ms: 1_000,
            kind: DEFAULT_KIND,
            connection_attempt_timeout_ms: 2 * 60 * 1000,
            p2p_attempt_timeout_ms: 60_000,
            signal_expiration_ms: 21 * 60 * 1000,
            candidate_debounce_ms: 1_000,
            candidate_reemit_interval_ms: 10_000,
        }
    }
}

impl RtcSettings {
    pub fn announce_interval(&self) -> Duration {
        Duration::from_millis(self.announce_interval_ms)
    }

    pub fn peer_expiration(&self) -> Duration {
        Duration::from_millis(self.peer_expiration_ms)
    }

    pub fn gc_interval(&self) -> Duration {
        Duration::from_millis(self.gc_interval_ms)
    }

    pub fn autoconnect_interval(&self) -> Duration {
        Duration::from_millis(self.autoconnect_interval_ms)
    }

    pub fn connection_attempt_timeout(&self) -> Duration {
        Duration::from_millis(self.connection_attempt_timeout_ms)
    }

    pub fn p2p_attempt_timeout(&self) -> Duration {
        Duration::from_millis(self.p2p_attempt_timeout_ms)
    }

    pub fn signal_expiration(&self) -> Duration {
        Duration::from_millis(self.signal_expiration_ms)
    }

    pub fn candidate_debounce(&self) -> Duration {
        Duration::from_millis(self.candidate_debounce_ms)
    }

    pub fn candidate_reemit_interval(&self) -> Duration {
        Duration::from_millis(self.candidate_reemit_interval_ms)
    }
}

/// Tuning for the chunked fallback channel
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TurnSettings {
    /// Characters of encoded payload per chunk
    pub chunk_length: usize,
    pub packet_timeout_ms: u64,
    /// A chunk is not resent until this long after its last attempt
    pub max_latency_ms: u64,
    pub loop_interval_ms: u64,
    /// Largest encoded packet accepted or sent, in characters
    pub max_packet_size: usize,
    pub kind: u16,
}

impl Default for TurnSettings {
    fn default() -> Self {
        Self {
            chunk_length: 1024,
            packet_timeout_ms: 10_000,
            max_latency_ms: 2_000,
            loop_interval_ms: 1,
            max_packet_size: 16 * 1024 * 1024,
            kind: DEFAULT_KIND,
        }
    }
}

impl TurnSettings {
    pub fn packet_timeout(&self) -> Duration {
        Duration::from_millis(self.packet_timeout_ms)
    }

    pub fn max_latency(&self) -> Duration {
        Duration::from_millis(self.max_latency_ms)
    }

    pub fn loop_interval(&self) -> Duration {
        Duration::from_millis(self.loop_interval_ms.max(1))
    }

    /// Most chunks a packet may declare
    pub fn max_chunks(&self) -> usize {
        self.max_packet_size.div_ceil(self.chunk_length.max(1)).max(1)
    }
}

/// Logging setup, applied once by the binary that owns the process
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    /// Default level when RUST_LOG is unset
    #[serde(default = "default_log_level")]
    pub level: String,
    /// Extra filter directives, e.g. "nostr_relay_pool=off"
    #[serde(default = "default_log_directives")]
    pub directives: Vec<String>,
    /// Emit JSON lines instead of human readable output
    #[serde(default)]
    pub json: bool,
    /// Static fields attached to every log line
    #[serde(default)]
    pub tags: BTreeMap<String, String>,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            directives: default_log_directives(),
            json: false,
            tags: BTreeMap::new(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_directives() -> Vec<String> {
    vec!["nostr_relay_pool=off".to_string()]
}

impl Config {
    /// Load config from file, or create default if doesn't exist
    pub fn load() -> Result<Self> {
        Self::load_from(&get_config_path())
    }

    /// Load config from an explicit path, creating it with defaults if missing
    pub fn load_from(config_path: &PathBuf) -> Result<Self> {
        if config_path.exists() {
            let content = fs::read_to_string(config_path).context("Failed to read config file")?;
            toml::from_str(&content).context("Failed to parse config file")
        } else {
            let config = Config::default();
            config.save_to(config_path)?;
            Ok(config)
        }
    }

    /// Load config, returning default on any error (no panic)
    pub fn load_or_default() -> Self {
        Self::load().unwrap_or_default()
    }

    /// Save config to file
    pub fn save(&self) -> Result<()> {
        self.save_to(&get_config_path())
    }

    pub fn save_to(&self, config_path: &PathBuf) -> Result<()> {
        if let Some(parent) = config_path.parent() {
            fs::create_dir_all(parent)?;
        }

        let content = toml::to_string_pretty(self)?;
        fs::write(config_path, content)?;

        Ok(())
    }
}

/// Get the nostrtc directory (~/.nostrtc)
pub fn get_nostrtc_dir() -> PathBuf {
    if let Ok(dir) = std::env::var("NOSTRTC_CONFIG_DIR") {
        return PathBuf::from(dir);
    }
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".nostrtc")
}

/// Get the config file path (~/.nostrtc/config.toml)
pub fn get_config_path() -> PathBuf {
    get_nostrtc_dir().join("config.toml")
}

/// Get the keys file path (~/.nostrtc/keys)
pub fn get_keys_path() -> PathBuf {
    get_nostrtc_dir().join("keys")
}

/// A stored key entry from the keys file
#[derive(Debug, Clone)]
pub struct KeyEntry {
    /// The nsec or hex secret key
    pub secret: String,
    /// Optional alias/petname
    pub alias: Option<String>,
}

/// Parse the keys file content into key entries
/// Format: `nsec1... [alias]` or `hex... [alias]` per line
/// Lines starting with # are comments
pub fn parse_keys_file(content: &str) -> Vec<KeyEntry> {
    let mut entries = Vec::new();
    for line in content.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let mut parts = line.splitn(2, ' ');
        let secret = parts.next().unwrap_or_default().to_string();
        let alias = parts.next().map(|s| s.trim().to_string());
        entries.push(KeyEntry { secret, alias });
    }
    entries
}

/// Read and parse keys file, returning the first key's secret
/// Returns None if file doesn't exist or is empty
pub fn read_first_key() -> Option<String> {
    let content = fs::read_to_string(get_keys_path()).ok()?;
    parse_keys_file(&content).into_iter().next().map(|e| e.secret)
}

/// Look up a key by alias, falling back to the first entry when alias is None
pub fn read_key(alias: Option<&str>) -> Option<String> {
    let content = fs::read_to_string(get_keys_path()).ok()?;
    let entries = parse_keys_file(&content);
    match alias {
        Some(alias) => entries
            .into_iter()
            .find(|e| e.alias.as_deref() == Some(alias))
            .map(|e| e.secret),
        None => entries.into_iter().next().map(|e| e.secret),
    }
}
