//! HTTP request-line and header parsing
//!
//! Parsing is incremental: the connection reads the command line, then
//! header lines until the empty line, recognizing on the way the handful
//! of headers the server acts on itself.

use std::collections::HashMap;
use std::io::BufRead;
use std::str::FromStr;

use super::{HttpError, HttpResult};

/// HTTP methods supported by the server
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HttpMethod {
    GET,
    POST,
    PUT,
    DELETE,
    OPTIONS,
    HEAD,
    PATCH,
}

/// Number of distinct methods; used to size per-method tables
pub const METHOD_COUNT: usize = 7;

impl HttpMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            HttpMethod::GET => "GET",
            HttpMethod::POST => "POST",
            HttpMethod::PUT => "PUT",
            HttpMethod::DELETE => "DELETE",
            HttpMethod::OPTIONS => "OPTIONS",
            HttpMethod::HEAD => "HEAD",
            HttpMethod::PATCH => "PATCH",
        }
    }

    /// Index into per-method tables (router trees, counters)
    pub fn index(&self) -> usize {
        match self {
            HttpMethod::GET => 0,
            HttpMethod::POST => 1,
            HttpMethod::PUT => 2,
            HttpMethod::DELETE => 3,
            HttpMethod::OPTIONS => 4,
            HttpMethod::HEAD => 5,
            HttpMethod::PATCH => 6,
        }
    }

    /// Methods that never carry a request body
    pub fn is_bodyless(&self) -> bool {
        matches!(
            self,
            HttpMethod::GET | HttpMethod::HEAD | HttpMethod::OPTIONS | HttpMethod::DELETE
        )
    }
}

impl FromStr for HttpMethod {
    type Err = HttpError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "GET" => Ok(HttpMethod::GET),
            "POST" => Ok(HttpMethod::POST),
            "PUT" => Ok(HttpMethod::PUT),
            "DELETE" => Ok(HttpMethod::DELETE),
            "OPTIONS" => Ok(HttpMethod::OPTIONS),
            "HEAD" => Ok(HttpMethod::HEAD),
            "PATCH" => Ok(HttpMethod::PATCH),
            _ => Err(HttpError::UnsupportedMethod(s.to_string())),
        }
    }
}

impl std::fmt::Display for HttpMethod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// HTTP protocol versions understood by the server
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HttpVersion {
    Http1_0,
    Http1_1,
}

impl HttpVersion {
    pub fn as_str(&self) -> &'static str {
        match self {
            HttpVersion::Http1_0 => "HTTP/1.0",
            HttpVersion::Http1_1 => "HTTP/1.1",
        }
    }
}

/// A parsed `Range: bytes=start-[end]` header
///
/// Only single byte ranges are supported; `end` is inclusive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RangeSpec {
    pub start: u64,
    pub end: Option<u64>,
}

impl RangeSpec {
    /// Parse the value of a `Range` header. Returns `None` for any form the
    /// server does not support (suffix ranges, multiple ranges, other units).
    pub fn parse(value: &str) -> Option<Self> {
        let ranges = value.trim().strip_prefix("bytes=")?;
        if ranges.contains(',') {
            return None;
        }
        let (start, end) = ranges.split_once('-')?;
        let start: u64 = start.trim().parse().ok()?;
        let end = end.trim();
        let end = if end.is_empty() { None } else { Some(end.parse::<u64>().ok()?) };
        if let Some(e) = end {
            if e < start {
                return None;
            }
        }
        Some(Self { start, end })
    }

    /// Resolve against a concrete resource size. `None` means the range is
    /// unsatisfiable (416); otherwise both bounds are inclusive and clamped.
    pub fn resolve(&self, size: u64) -> Option<(u64, u64)> {
        if self.start >= size {
            return None;
        }
        let end = self.end.map_or(size - 1, |e| e.min(size - 1));
        Some((self.start, end))
    }
}

/// The parsed command line plus the headers the server itself acts on
#[derive(Debug, Clone, Default)]
pub struct ParsedHead {
    pub method: Option<HttpMethod>,
    pub uri: String,
    pub http10: bool,
    /// All headers, keys lowercased, last occurrence wins
    pub headers: HashMap<String, String>,
    pub content_length: usize,
    pub content_type: String,
    pub content_encoding: Option<String>,
    pub connection_close: bool,
    pub connection_keep_alive: bool,
    pub connection_upgrade: bool,
    pub authorization: Option<String>,
    pub accept_encoding: Option<String>,
    pub host: Option<String>,
    pub user_agent: Option<String>,
    pub referer: Option<String>,
    pub expect_continue: bool,
    pub range: Option<RangeSpec>,
    pub if_none_match: Option<String>,
}

impl ParsedHead {
    pub fn version(&self) -> HttpVersion {
        if self.http10 {
            HttpVersion::Http1_0
        } else {
            HttpVersion::Http1_1
        }
    }

    /// Keep-alive per protocol defaults and explicit `Connection` values
    pub fn wants_keep_alive(&self) -> bool {
        if self.connection_close {
            return false;
        }
        !self.http10 || self.connection_keep_alive
    }

    /// Read and parse one request head from the stream.
    ///
    /// Returns `Ok(None)` when the peer closed the connection cleanly before
    /// sending anything (the normal end of a keep-alive exchange).
    pub fn read<R: BufRead>(reader: &mut R, max_header_lines: usize) -> HttpResult<Option<Self>> {
        let mut line = String::new();
        if reader.read_line(&mut line)? == 0 {
            return Ok(None);
        }
        let mut head = Self::default();
        head.parse_command_line(line.trim_end_matches(['\r', '\n']))?;

        let mut lines = 0usize;
        loop {
            line.clear();
            if reader.read_line(&mut line)? == 0 {
                return Err(HttpError::InvalidRequest("connection closed mid-headers".into()));
            }
            let trimmed = line.trim_end_matches(['\r', '\n']);
            if trimmed.is_empty() {
                break;
            }
            lines += 1;
            if lines > max_header_lines {
                return Err(HttpError::InvalidRequest("too many header lines".into()));
            }
            head.parse_header_line(trimmed)?;
        }
        Ok(Some(head))
    }

    fn parse_command_line(&mut self, line: &str) -> HttpResult<()> {
        if line.bytes().any(|b| !(0x20..0x7f).contains(&b)) {
            return Err(HttpError::InvalidRequest("non-ASCII byte in request line".into()));
        }
        let mut parts = line.split(' ');
        let method = parts.next().unwrap_or("");
        let uri = parts.next().unwrap_or("");
        let proto = parts.next().unwrap_or("");
        if parts.next().is_some() || uri.is_empty() {
            return Err(HttpError::InvalidRequest(format!("malformed request line: {:?}", line)));
        }
        self.method = Some(method.parse()?);
        let rest = proto
            .strip_prefix("HTTP/")
            .ok_or_else(|| HttpError::InvalidRequest(format!("not an HTTP protocol: {}", proto)))?;
        match rest {
            "1.0" => self.http10 = true,
            "1.1" => self.http10 = false,
            other => {
                return Err(HttpError::InvalidRequest(format!("unsupported version: {}", other)))
            }
        }
        self.uri = uri.to_string();
        Ok(())
    }

    fn parse_header_line(&mut self, line: &str) -> HttpResult<()> {
        if line.bytes().any(|b| b < 0x09) {
            return Err(HttpError::InvalidRequest("control byte in header".into()));
        }
        let (name, value) = line
            .split_once(':')
            .ok_or_else(|| HttpError::InvalidRequest(format!("header without colon: {}", line)))?;
        let name = name.trim().to_ascii_lowercase();
        let value = value.trim();

        match name.as_str() {
            "content-length" => {
                self.content_length = value
                    .parse()
                    .map_err(|_| HttpError::InvalidRequest("bad Content-Length".into()))?;
            }
            "transfer-encoding" => {
                return Err(HttpError::UnsupportedEncoding(value.to_string()));
            }
            "content-type" => self.content_type = value.to_string(),
            "content-encoding" => self.content_encoding = Some(value.to_ascii_lowercase()),
            "connection" => {
                for token in value.split(',') {
                    match token.trim().to_ascii_lowercase().as_str() {
                        "close" => self.connection_close = true,
                        "keep-alive" => self.connection_keep_alive = true,
                        "upgrade" => self.connection_upgrade = true,
                        _ => {}
                    }
                }
            }
            "authorization" => self.authorization = Some(value.to_string()),
            "accept-encoding" => self.accept_encoding = Some(value.to_ascii_lowercase()),
            "host" => self.host = Some(value.to_string()),
            "user-agent" => self.user_agent = Some(value.to_string()),
            "referer" => self.referer = Some(value.to_string()),
            "expect" => {
                if value.eq_ignore_ascii_case("100-continue") {
                    self.expect_continue = true;
                }
            }
            "range" => self.range = RangeSpec::parse(value),
            "if-none-match" => self.if_none_match = Some(value.to_string()),
            _ => {}
        }
        self.headers.insert(name, value.to_string());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::BufReader;

    fn parse(raw: &str) -> HttpResult<Option<ParsedHead>> {
        ParsedHead::read(&mut BufReader::new(raw.as_bytes()), 128)
    }

    #[test]
    fn parses_simple_get() {
        let head = parse("GET /info HTTP/1.1\r\nHost: localhost\r\n\r\n").unwrap().unwrap();
        assert_eq!(head.method, Some(HttpMethod::GET));
        assert_eq!(head.uri, "/info");
        assert!(!head.http10);
        assert_eq!(head.host.as_deref(), Some("localhost"));
        assert!(head.wants_keep_alive());
    }

    #[test]
    fn detects_http10_close_default() {
        let head = parse("GET / HTTP/1.0\r\n\r\n").unwrap().unwrap();
        assert!(head.http10);
        assert!(!head.wants_keep_alive());
    }

    #[test]
    fn http10_keep_alive_opt_in() {
        let head = parse("GET / HTTP/1.0\r\nConnection: keep-alive\r\n\r\n").unwrap().unwrap();
        assert!(head.wants_keep_alive());
    }

    #[test]
    fn connection_close_overrides() {
        let head = parse("GET / HTTP/1.1\r\nConnection: close\r\n\r\n").unwrap().unwrap();
        assert!(!head.wants_keep_alive());
    }

    #[test]
    fn rejects_transfer_encoding() {
        assert!(matches!(
            parse("POST / HTTP/1.1\r\nTransfer-Encoding: chunked\r\n\r\n"),
            Err(HttpError::UnsupportedEncoding(_))
        ));
    }

    #[test]
    fn rejects_garbage_request_line() {
        assert!(parse("GET\r\n\r\n").is_err());
        assert!(parse("GET / SPDY/3\r\n\r\n").is_err());
        assert!(parse("G\u{7f}T / HTTP/1.1\r\n\r\n").is_err());
    }

    #[test]
    fn empty_stream_is_clean_close() {
        assert!(parse("").unwrap().is_none());
    }

    #[test]
    fn range_parsing() {
        assert_eq!(
            RangeSpec::parse("bytes=100-199"),
            Some(RangeSpec { start: 100, end: Some(199) })
        );
        assert_eq!(RangeSpec::parse("bytes=100-"), Some(RangeSpec { start: 100, end: None }));
        assert_eq!(RangeSpec::parse("bytes=5-2"), None);
        assert_eq!(RangeSpec::parse("bytes=1-2,4-5"), None);
        assert_eq!(RangeSpec::parse("items=0-1"), None);
    }

    #[test]
    fn range_resolution_clamps_and_rejects() {
        let r = RangeSpec { start: 100, end: Some(10_000) };
        assert_eq!(r.resolve(200), Some((100, 199)));
        let r = RangeSpec { start: 100, end: None };
        assert_eq!(r.resolve(200), Some((100, 199)));
        let r = RangeSpec { start: 200, end: None };
        assert_eq!(r.resolve(200), None);
    }

    #[test]
    fn expect_continue_detected() {
        let head =
            parse("PUT /u HTTP/1.1\r\nExpect: 100-continue\r\nContent-Length: 3\r\n\r\n")
                .unwrap()
                .unwrap();
        assert!(head.expect_continue);
        assert_eq!(head.content_length, 3);
    }
}
