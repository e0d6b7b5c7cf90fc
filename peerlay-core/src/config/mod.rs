//! Settings records for the HTTP server and the peer cache
//!
//! Plain structs with explicit defaults, the full knob set in one place,
//! and a single `validate()` that rejects inconsistent combinations at
//! startup rather than at request time.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Configuration validation error
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigError(pub String);

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "invalid configuration: {}", self.0)
    }
}

impl std::error::Error for ConfigError {}

/// Interface selection filter applied when picking the discovery interface
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct InterfaceFilter {
    /// Only consider wired ethernet interfaces
    pub ethernet_only: bool,
    /// Only consider interfaces with a private (RFC 1918) address
    pub local_only: bool,
    /// Skip interfaces without a usable broadcast address
    pub require_broadcast: bool,
    /// Ignore the gateway when ranking candidates
    pub ignore_gateway: bool,
    /// Ignore the hardware kind when ranking candidates
    pub ignore_kind: bool,
    /// Ignore the link speed when ranking candidates
    pub ignore_speed: bool,
}

/// Behavior switches of the peer cache
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct CacheOptions {
    /// Shard cache folders 16 ways on the first digest nibble
    pub sub_folders: bool,
    /// Stop waiting for broadcast responses after the first one
    pub first_response: bool,
    /// Retry the previously successful peer before broadcasting
    pub try_last_peer: bool,
    /// Walk all responding peers instead of only the best one
    pub try_all_peers: bool,
    /// After an unanswered broadcast, stay silent for about a second
    pub broadcast_not_alone: bool,
    /// Run as a pure client: no HTTP peer server
    pub no_server: bool,
    /// Disable the UDP-level IP ban set
    pub no_ban_ip: bool,
    /// Accept self-signed certificates on direct-mode fetches
    pub self_signed_https: bool,
    /// Log at debug level
    pub verbose_log: bool,
    /// Accept localhost direct-mode (`/http/…`, `/https/…`) requests
    pub http_direct: bool,
}

impl Default for CacheOptions {
    fn default() -> Self {
        Self {
            sub_folders: false,
            first_response: false,
            try_last_peer: true,
            try_all_peers: false,
            broadcast_not_alone: false,
            no_server: false,
            no_ban_ip: false,
            self_signed_https: false,
            verbose_log: false,
            http_direct: false,
        }
    }
}

/// The peer cache settings record
///
/// One record covers both sides of a node: the UDP discovery exchange and
/// the HTTP peer server share `port`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeerCacheSettings {
    /// UDP and TCP port of the peer plane
    /// Default: 8089
    pub port: u16,
    /// Interface selection filter
    pub interface_filter: InterfaceFilter,
    /// Explicit interface name override; `None` picks automatically
    pub interface_name: Option<String>,
    /// Behavior switches
    pub options: CacheOptions,
    /// Outbound transfer clamp per peer request, in MB/s; 0 disables
    /// Default: 10
    pub limit_mbps: u32,
    /// Maximum concurrent peer HTTP connections before answering Overloaded
    /// Default: 32
    pub limit_client_count: u32,
    /// How long a broadcast round waits for responses
    /// Default: 10 ms
    pub broadcast_timeout_ms: u32,
    /// Stop collecting after this many responses
    /// Default: 24
    pub broadcast_max_responses: u32,
    /// How many responding peers to try before giving up
    /// Default: 4
    pub try_all_peers_count: u32,
    /// Per-request timeout of peer HTTP downloads once connected
    /// Default: 5000 ms
    pub http_timeout_ms: u32,
    /// TTL of UDP-level IP bans, in minutes
    /// Default: 4
    pub ban_minutes: u32,
    /// Temporary cache directory (TTL + size cap + LRU-by-access)
    pub cache_temp_path: PathBuf,
    /// Size cap of the temporary store, in MB
    /// Default: 1000
    pub cache_temp_max_mb: u32,
    /// TTL of temporary entries, in minutes
    /// Default: 60
    pub cache_temp_max_min: u32,
    /// Smallest file worth caching in the temporary store
    /// Default: 2048
    pub cache_temp_min_bytes: u64,
    /// Permanent cache directory (no TTL)
    pub cache_perm_path: PathBuf,
    /// Smallest file worth caching in the permanent store
    /// Default: 0
    pub cache_perm_min_bytes: u64,
    /// Fixed instance UUID; `None` generates a fresh one per start
    pub uuid: Option<uuid::Uuid>,
}

impl Default for PeerCacheSettings {
    fn default() -> Self {
        Self {
            port: 8089,
            interface_filter: InterfaceFilter::default(),
            interface_name: None,
            options: CacheOptions::default(),
            limit_mbps: 10,
            limit_client_count: 32,
            broadcast_timeout_ms: 10,
            broadcast_max_responses: 24,
            try_all_peers_count: 4,
            http_timeout_ms: 5000,
            ban_minutes: 4,
            cache_temp_path: PathBuf::from("peerlay-cache/temp"),
            cache_temp_max_mb: 1000,
            cache_temp_max_min: 60,
            cache_temp_min_bytes: 2048,
            cache_perm_path: PathBuf::from("peerlay-cache/perm"),
            cache_perm_min_bytes: 0,
            uuid: None,
        }
    }
}

impl PeerCacheSettings {
    /// Reject combinations that cannot work together.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.port == 0 {
            return Err(ConfigError("port must be non-zero".into()));
        }
        if self.broadcast_max_responses == 0 {
            return Err(ConfigError("broadcast_max_responses must be at least 1".into()));
        }
        if self.options.first_response && self.options.try_all_peers {
            return Err(ConfigError(
                "first_response and try_all_peers are mutually exclusive".into(),
            ));
        }
        if self.options.no_server && self.options.http_direct {
            return Err(ConfigError("http_direct needs the HTTP server (no_server set)".into()));
        }
        if self.cache_temp_path == self.cache_perm_path {
            return Err(ConfigError("temp and permanent stores must be distinct paths".into()));
        }
        if self.cache_temp_max_mb == 0 {
            return Err(ConfigError("cache_temp_max_mb must be non-zero".into()));
        }
        Ok(())
    }

    /// Broadcast wait as a `Duration`
    pub fn broadcast_timeout(&self) -> Duration {
        Duration::from_millis(u64::from(self.broadcast_timeout_ms))
    }

    /// Peer HTTP request timeout as a `Duration`
    pub fn http_timeout(&self) -> Duration {
        Duration::from_millis(u64::from(self.http_timeout_ms))
    }
}

/// HTTP server tuning knobs
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Worker pool size: < 0 serves on the accept thread, 0 spawns a thread
    /// per connection, > 0 runs a bounded pool
    /// Default: 4
    pub pool_size: i32,
    /// Pending-connection queue capacity when the pool is bounded
    /// Default: 64
    pub queue_capacity: usize,
    /// Cap on dedicated long-lived workers (keep-alive, large bodies)
    /// Default: 128
    pub max_dedicated_workers: usize,
    /// Keep-alive idle timeout
    /// Default: 30 s
    pub keep_alive_timeout: Duration,
    /// Header-read timeout; `None` disables
    /// Default: 10 s
    pub header_timeout: Option<Duration>,
    /// Maximum request body size
    /// Default: 16 MB
    pub max_body_size: usize,
    /// Chunk size of streamed file bodies
    /// Default: 256 KB
    pub send_buffer_size: usize,
    /// Request bodies above this move the connection to a dedicated worker
    /// Default: 1 MB
    pub large_body_threshold: usize,
    /// Maximum number of header lines per request
    /// Default: 128
    pub max_header_lines: usize,
    /// Value of the `Server:` response header
    pub server_name: String,
    /// Optional `X-Powered-By:` response header
    pub x_powered_by: Option<String>,
    /// Emit a `Date:` response header
    pub emit_date: bool,
    /// Trust this request header for the real client IP (proxy setups)
    pub remote_ip_header: Option<String>,
    /// Trust this request header for the upstream connection ID
    pub connection_id_header: Option<String>,
    /// Ban IPs that provoke non-auth 4xx responses for a few seconds
    pub ban_40x: bool,
    /// Compress eligible in-memory response bodies with gzip
    pub gzip_responses: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            pool_size: 4,
            queue_capacity: 64,
            max_dedicated_workers: 128,
            keep_alive_timeout: Duration::from_secs(30),
            header_timeout: Some(Duration::from_secs(10)),
            max_body_size: 16 * 1024 * 1024,
            send_buffer_size: 256 * 1024,
            large_body_threshold: 1024 * 1024,
            max_header_lines: 128,
            server_name: format!("Peerlay/{}", env!("CARGO_PKG_VERSION")),
            x_powered_by: None,
            emit_date: true,
            remote_ip_header: None,
            connection_id_header: None,
            ban_40x: false,
            gzip_responses: false,
        }
    }
}
