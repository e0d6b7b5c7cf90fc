//! From-scratch HTTP/1.1 server over blocking `std::net` sockets
//!
//! # Architecture
//!
//! - [`router`] - Radix URI tree with typed placeholders, rewrites, callbacks
//! - [`context`] - Per-request mutable state shared with handlers
//! - [`request`] - Request-line and header parsing
//! - [`response`] - Status lines, body sources, response heads
//! - [`conn`] - Per-socket connection state machine
//! - [`server`] - Accept loop, worker pool, dedicated workers
//! - [`auth`] - Basic / Digest / Negotiate engine
//! - [`ban`] - Second-bucketed IP ban sets
//! - [`compress`] - Content-coding registry (gzip)

pub mod auth;
pub mod ban;
pub mod compress;
pub mod conn;
pub mod context;
pub mod request;
pub mod response;
pub mod router;
pub mod server;

pub use auth::{AuthEngine, AuthMode, AuthOutcome, CredentialStore, NegotiateBinding, SecretStore};
pub use ban::BanList;
pub use compress::CompressRegistry;
pub use conn::{BodyState, ProgressivePoll, ProgressiveSource};
pub use context::{ConnectionFlags, RequestContext};
pub use request::{HttpMethod, HttpVersion, ParsedHead, RangeSpec};
pub use response::{reason_phrase, ResponseHead};
pub use router::{ParamKind, RouteCallback, Router, RouterError};
pub use server::{
    HttpServerRuntime, RequestHandler, ServerHooks, ServerMetrics, TcpHttpServer,
};

/// Result type for HTTP operations
pub type HttpResult<T> = std::result::Result<T, HttpError>;

/// HTTP-specific error types
#[derive(Debug, Clone)]
pub enum HttpError {
    /// Malformed request line or headers
    InvalidRequest(String),
    /// Method outside the supported set
    UnsupportedMethod(String),
    /// `Transfer-Encoding` or another unsupported framing
    UnsupportedEncoding(String),
    /// Request body larger than the configured maximum
    BodyTooLarge(usize),
    /// Socket-level failures
    ConnectionError(String),
    /// Socket read deadline expired
    Timeout,
    /// Bind or startup failures
    ServerError(String),
}

impl std::fmt::Display for HttpError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HttpError::InvalidRequest(msg) => write!(f, "invalid HTTP request: {}", msg),
            HttpError::UnsupportedMethod(m) => write!(f, "unsupported HTTP method: {}", m),
            HttpError::UnsupportedEncoding(e) => write!(f, "unsupported encoding: {}", e),
            HttpError::BodyTooLarge(size) => write!(f, "request body too large: {} bytes", size),
            HttpError::ConnectionError(msg) => write!(f, "connection error: {}", msg),
            HttpError::Timeout => write!(f, "socket read timed out"),
            HttpError::ServerError(msg) => write!(f, "server error: {}", msg),
        }
    }
}

impl std::error::Error for HttpError {}

impl From<std::io::Error> for HttpError {
    fn from(err: std::io::Error) -> Self {
        match err.kind() {
            std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut => HttpError::Timeout,
            _ => HttpError::ConnectionError(err.to_string()),
        }
    }
}

/// Protocol constants
pub mod constants {
    /// Content type marking "the body is a filename, stream that file"
    pub const STATIC_FILE_CONTENT_TYPE: &str = "!STATICFILE";
    /// Content type marking "no body at all"
    pub const NO_RESPONSE_CONTENT_TYPE: &str = "!NORESPONSE";
    /// Custom response header carrying the expected final size of a
    /// progressive (still growing) file
    pub const EXPECTED_SIZE_HEADER: &str = "X-Expected-Size";

    pub const CRLF: &str = "\r\n";
    pub const CRLF_BYTES: &[u8] = b"\r\n";

    /// Body sent to banned IPs before the socket is closed
    pub const TEAPOT_BODY: &[u8] =
        b"HTTP/1.0 418 I'm a teapot\r\nContent-Length: 0\r\nConnection: close\r\n\r\n";
}
