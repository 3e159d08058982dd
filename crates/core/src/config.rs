use std::env;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::wire::{NodeCapabilities, PROTOCOL_VERSION};

/// Load .env file (silently ignores if missing).
pub fn load_dotenv() {
    dotenvy::dotenv().ok();
}

fn env_or(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_opt(key: &str) -> Option<String> {
    env::var(key).ok().filter(|s| !s.is_empty())
}

/// Read a profiled env var: tries {PROFILE}_{KEY} first, falls back to {KEY}.
fn profiled_env_opt(profile: &str, key: &str) -> Option<String> {
    if !profile.is_empty() {
        let prefixed = format!("{}_{}", profile, key);
        if let Some(v) = env_opt(&prefixed) {
            return Some(v);
        }
    }
    env_opt(key)
}

fn profiled_env_or(profile: &str, key: &str, default: &str) -> String {
    profiled_env_opt(profile, key).unwrap_or_else(|| default.to_string())
}

fn profiled_env_parse<T: std::str::FromStr>(profile: &str, key: &str) -> Option<T> {
    profiled_env_opt(profile, key).and_then(|v| v.parse().ok())
}

fn profiled_env_u32(profile: &str, key: &str, default: u32) -> u32 {
    profiled_env_parse(profile, key).unwrap_or(default)
}

fn profiled_env_secs(profile: &str, key: &str, default: u64) -> Duration {
    Duration::from_secs(profiled_env_parse(profile, key).unwrap_or(default))
}

// ── Top-level config ──────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Active profile name (empty = default).
    pub profile: String,
    pub server: ServerConfig,
    pub client: ClientConfig,
}

impl Config {
    /// Build config from environment variables (call `load_dotenv()` first).
    /// Profile is read from `WEFT_PROFILE`. When set (e.g. `STAGING`), every
    /// key is first looked up as `{PROFILE}_{KEY}`, falling back to `{KEY}`.
    pub fn from_env() -> Self {
        let profile = env_or("WEFT_PROFILE", "").to_uppercase();
        Self::for_profile(&profile)
    }

    /// Build config for a specific named profile (empty string = default).
    pub fn for_profile(profile: &str) -> Self {
        let p = profile.to_uppercase();
        let p = p.as_str();
        Self {
            profile: p.to_string(),
            server: ServerConfig::from_env_profiled(p),
            client: ClientConfig::from_env_profiled(p),
        }
    }

    pub fn profile_label(&self) -> &str {
        if self.profile.is_empty() { "default" } else { &self.profile }
    }

    /// Print a summary for startup logs.
    pub fn log_summary(&self) {
        tracing::info!("Config loaded (profile: {}):", self.profile_label());
        tracing::info!(
            "  server:  listen={}, version={}, node_timeout={:?}",
            self.server.listen,
            self.server.version,
            self.server.node_timeout
        );
        tracing::info!(
            "  client:  server_url={}, version={}, resync={:?}",
            self.client.server_url,
            self.client.version,
            self.client.resync_interval
        );
        if self.server.node_timeout <= self.client.resync_interval {
            tracing::warn!(
                node_timeout = ?self.server.node_timeout,
                resync_interval = ?self.client.resync_interval,
                "node timeout does not exceed the client resync interval; live nodes may be evicted"
            );
        }
    }
}

// ── Server ────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Socket address the sync endpoint binds to.
    pub listen: String,
    pub version: u32,
    /// A node silent for this long is dropped and its task requeued.
    pub node_timeout: Duration,
    /// Fixed server identity; random per process when unset.
    pub server_id: Option<u64>,
    /// Buffer size of the node-event and recovered-task feeds.
    pub feed_capacity: usize,
}

impl ServerConfig {
    fn from_env_profiled(p: &str) -> Self {
        Self {
            listen: profiled_env_or(p, "WEFT_LISTEN", "0.0.0.0:7070"),
            version: profiled_env_u32(p, "WEFT_PROTOCOL_VERSION", PROTOCOL_VERSION),
            node_timeout: profiled_env_secs(p, "WEFT_NODE_TIMEOUT_SECS", 60),
            server_id: profiled_env_parse(p, "WEFT_SERVER_ID"),
            feed_capacity: profiled_env_parse(p, "WEFT_FEED_CAPACITY").unwrap_or(64),
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: "0.0.0.0:7070".into(),
            version: PROTOCOL_VERSION,
            node_timeout: Duration::from_secs(60),
            server_id: None,
            feed_capacity: 64,
        }
    }
}

// ── Client ────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientConfig {
    /// Base URL of the coordinator, without the `/sync` path.
    pub server_url: String,
    pub version: u32,
    /// Heartbeat cadence when the running task is slow to checkpoint.
    pub resync_interval: Duration,
    pub capabilities: NodeCapabilities,
}

impl ClientConfig {
    fn from_env_profiled(p: &str) -> Self {
        let cpus = std::thread::available_parallelism()
            .map(|n| n.get() as u32)
            .unwrap_or(1);
        Self {
            server_url: profiled_env_or(p, "WEFT_SERVER_URL", "http://127.0.0.1:7070"),
            version: profiled_env_u32(p, "WEFT_PROTOCOL_VERSION", PROTOCOL_VERSION),
            resync_interval: profiled_env_secs(p, "WEFT_RESYNC_SECS", 30),
            capabilities: NodeCapabilities {
                node_id: None,
                sites: profiled_env_u32(p, "WEFT_CAP_SITES", 1),
                memory_mb: profiled_env_parse(p, "WEFT_CAP_MEMORY_MB").unwrap_or(0),
                cpus: profiled_env_u32(p, "WEFT_CAP_CPUS", cpus),
                lifetime: profiled_env_parse::<u64>(p, "WEFT_CAP_LIFETIME_SECS")
                    .map(Duration::from_secs),
            },
        }
    }
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            server_url: "http://127.0.0.1:7070".into(),
            version: PROTOCOL_VERSION,
            resync_interval: Duration::from_secs(30),
            capabilities: NodeCapabilities::default(),
        }
    }
}
