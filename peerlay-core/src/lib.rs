//! Peerlay Core
//!
//! A subnet-local peer-to-peer content distribution plane layered over
//! HTTP/1.1. Nodes that share a secret discover each other with
//! authenticated UDP broadcasts and serve cached file chunks to one another
//! before any of them falls back to the origin server.
//!
//! # Architecture
//!
//! - [`http`] - From-scratch blocking HTTP/1.1 server: radix URI router,
//!   connection state machine, worker pool, authentication, IP bans
//! - [`peer`] - The peer plane: AES-GCM message framing, UDP discovery,
//!   the cache coordinator and the partial-file registry
//! - [`config`] - Settings records with validation
//! - [`logging`] - `log`-facade backend with a plain line formatter
//!
//! # Quick start
//!
//! ```rust,no_run
//! use peerlay_core::config::PeerCacheSettings;
//! use peerlay_core::peer::HttpPeerCache;
//!
//! let settings = PeerCacheSettings::default();
//! let node = HttpPeerCache::start(settings, b"shared-subnet-secret")?;
//! // ... node serves peers and answers local downloads ...
//! node.shutdown();
//! # Ok::<(), peerlay_core::Error>(())
//! ```

pub mod config;
pub mod http;
pub mod logging;
pub mod peer;

/// Result type used across the crate
pub type Result<T> = std::result::Result<T, Error>;

/// Top-level error type aggregating the module-level errors
#[derive(Debug)]
pub enum Error {
    /// HTTP parsing, connection or server errors
    Http(http::HttpError),
    /// Route registration errors (raised at setup time only)
    Router(http::RouterError),
    /// Peer frame encode/decode errors
    Frame(peer::DecodeError),
    /// Cache coordinator errors
    Cache(peer::CacheError),
    /// Inconsistent settings combinations
    Config(config::ConfigError),
    /// Generic I/O errors
    Io(std::io::Error),
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Error::Http(e) => write!(f, "http: {}", e),
            Error::Router(e) => write!(f, "router: {}", e),
            Error::Frame(e) => write!(f, "frame: {}", e),
            Error::Cache(e) => write!(f, "cache: {}", e),
            Error::Config(e) => write!(f, "config: {}", e),
            Error::Io(e) => write!(f, "io: {}", e),
        }
    }
}

impl std::error::Error for Error {}

impl From<http::HttpError> for Error {
    fn from(e: http::HttpError) -> Self {
        Error::Http(e)
    }
}

impl From<http::RouterError> for Error {
    fn from(e: http::RouterError) -> Self {
        Error::Router(e)
    }
}

impl From<peer::DecodeError> for Error {
    fn from(e: peer::DecodeError) -> Self {
        Error::Frame(e)
    }
}

impl From<peer::CacheError> for Error {
    fn from(e: peer::CacheError) -> Self {
        Error::Cache(e)
    }
}

impl From<config::ConfigError> for Error {
    fn from(e: config::ConfigError) -> Self {
        Error::Config(e)
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Error::Io(e)
    }
}
