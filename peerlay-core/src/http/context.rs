//! Per-request mutable context
//!
//! One `RequestContext` travels through the whole exchange: the parsed
//! inputs, the router's captures (byte ranges into the URL, never copies),
//! the authentication outcome, and everything the handler sets on the
//! response side. Contexts are recycled between keep-alive exchanges, so
//! `reset` must clear every field.

use std::any::Any;
use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Arc;

use super::request::{HttpMethod, RangeSpec};

/// Connection-level flags carried by the context
#[derive(Debug, Clone, Copy, Default)]
pub struct ConnectionFlags {
    pub tls: bool,
    pub upgrade: bool,
    pub http10: bool,
    pub authorized: bool,
    pub url_params_set: bool,
}

/// Mutable state of one HTTP exchange
pub struct RequestContext {
    /// Request method; a rewrite rule may change it
    pub method: HttpMethod,
    /// Request URL; a rewrite rule may replace it
    pub url: String,
    /// All request headers, keys lowercased
    pub headers: HashMap<String, String>,
    /// Request body after Content-Length read and content decoding
    pub body: Vec<u8>,
    /// Client address, after any trusted proxy-header override
    pub remote_ip: IpAddr,
    /// Connection sequence, after any trusted header override
    pub connection_id: u32,
    pub flags: ConnectionFlags,

    /// Response status the handler decided on
    pub status: u16,
    /// Response body, or the filename when `resp_content_type` is the
    /// static-file marker
    pub resp_body: Vec<u8>,
    pub resp_content_type: String,
    /// Extra response headers, one per line, CRLF or LF separated
    pub resp_custom_headers: String,

    /// User name once authentication succeeded
    pub auth_user: String,
    /// Raw bearer token of the request, when one was presented
    pub bearer: String,
    /// Handler-readable error description for 4xx/5xx decisions
    pub error_message: String,

    /// Parsed `Range` header, if any
    pub range: Option<RangeSpec>,
    /// Byte offset of `?` in `url`, when the URL carries a query
    pub query_offset: Option<usize>,
    /// Partial-registry handle backing a progressive response; 0 when the
    /// response is not progressive
    pub partial_id: u64,
    /// Final size a progressive response will reach; 0 when not progressive
    pub progressive_expected: u64,

    captures: Vec<(usize, usize)>,
    capture_names: Vec<Arc<str>>,
    route_opaque: Option<Arc<dyn Any + Send + Sync>>,
}

impl RequestContext {
    pub fn new(method: HttpMethod, url: String, remote_ip: IpAddr, connection_id: u32) -> Self {
        Self {
            method,
            url,
            headers: HashMap::new(),
            body: Vec::new(),
            remote_ip,
            connection_id,
            flags: ConnectionFlags::default(),
            status: 0,
            resp_body: Vec::new(),
            resp_content_type: String::new(),
            resp_custom_headers: String::new(),
            auth_user: String::new(),
            bearer: String::new(),
            error_message: String::new(),
            range: None,
            query_offset: None,
            partial_id: 0,
            progressive_expected: 0,
            captures: Vec::new(),
            capture_names: Vec::new(),
            route_opaque: None,
        }
    }

    /// Clear everything so the allocation can serve the next exchange.
    pub fn reset(&mut self) {
        self.method = HttpMethod::GET;
        self.url.clear();
        self.headers.clear();
        self.body.clear();
        self.flags = ConnectionFlags::default();
        self.status = 0;
        self.resp_body.clear();
        self.resp_content_type.clear();
        self.resp_custom_headers.clear();
        self.auth_user.clear();
        self.bearer.clear();
        self.error_message.clear();
        self.range = None;
        self.query_offset = None;
        self.partial_id = 0;
        self.progressive_expected = 0;
        self.captures.clear();
        self.capture_names.clear();
        self.route_opaque = None;
    }

    /// URL without its query part
    pub fn path(&self) -> &str {
        match self.query_offset {
            Some(off) => &self.url[..off],
            None => &self.url,
        }
    }

    /// Raw query string after `?`, if present
    pub fn query(&self) -> Option<&str> {
        self.query_offset.map(|off| &self.url[off + 1..])
    }

    /// Called by the router for each captured parameter.
    pub(crate) fn push_capture(&mut self, offset: usize, len: usize, name: Arc<str>) {
        self.captures.push((offset, len));
        self.capture_names.push(name);
        self.flags.url_params_set = true;
    }

    pub(crate) fn clear_captures(&mut self) {
        self.captures.clear();
        self.capture_names.clear();
        self.flags.url_params_set = false;
    }

    pub(crate) fn set_route_opaque(&mut self, opaque: Option<Arc<dyn Any + Send + Sync>>) {
        self.route_opaque = opaque;
    }

    /// Opaque value attached to the matched route at registration time
    pub fn route_opaque(&self) -> Option<&Arc<dyn Any + Send + Sync>> {
        self.route_opaque.as_ref()
    }

    /// Number of captured route parameters
    pub fn param_count(&self) -> usize {
        self.captures.len()
    }

    /// Captured parameter by position, as the exact byte range of the URL
    pub fn param_at(&self, index: usize) -> Option<&str> {
        let (off, len) = *self.captures.get(index)?;
        self.url.get(off..off + len)
    }

    /// Captured parameter by name
    pub fn param(&self, name: &str) -> Option<&str> {
        let idx = self.capture_names.iter().position(|n| n.as_ref() == name)?;
        self.param_at(idx)
    }

    /// Captured parameter parsed as an integer
    pub fn param_int(&self, name: &str) -> Option<i64> {
        self.param(name)?.parse().ok()
    }

    /// Set an in-memory response in one call.
    pub fn respond(&mut self, status: u16, content_type: &str, body: impl Into<Vec<u8>>) -> u16 {
        self.status = status;
        self.resp_content_type.clear();
        self.resp_content_type.push_str(content_type);
        self.resp_body = body.into();
        status
    }

    /// Respond with a file streamed from disk.
    pub fn respond_file(&mut self, path: &std::path::Path) -> u16 {
        self.respond(200, super::constants::STATIC_FILE_CONTENT_TYPE, {
            path.to_string_lossy().into_owned().into_bytes()
        })
    }

    /// Respond with a still-growing file registered as `partial_id`;
    /// `expected` is the size the file will reach.
    pub fn respond_progressive_file(
        &mut self,
        path: &std::path::Path,
        expected: u64,
        partial_id: u64,
    ) -> u16 {
        if !self.resp_custom_headers.is_empty() {
            self.resp_custom_headers.push_str("\r\n");
        }
        self.resp_custom_headers
            .push_str(&format!("{}: {}", super::constants::EXPECTED_SIZE_HEADER, expected));
        self.partial_id = partial_id;
        self.progressive_expected = expected;
        self.respond_file(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    fn ctx(url: &str) -> RequestContext {
        RequestContext::new(
            HttpMethod::GET,
            url.to_string(),
            IpAddr::V4(Ipv4Addr::LOCALHOST),
            1,
        )
    }

    #[test]
    fn captures_reference_url_bytes() {
        let mut c = ctx("/user/42/pic");
        c.push_capture(6, 2, Arc::from("id"));
        assert_eq!(c.param("id"), Some("42"));
        assert_eq!(c.param_int("id"), Some(42));
        assert_eq!(c.param_at(0), Some("42"));
        assert!(c.flags.url_params_set);
    }

    #[test]
    fn query_split() {
        let mut c = ctx("/search?q=1");
        c.query_offset = Some(7);
        assert_eq!(c.path(), "/search");
        assert_eq!(c.query(), Some("q=1"));
    }

    #[test]
    fn reset_clears_all_request_state() {
        let mut c = ctx("/a");
        c.push_capture(0, 1, Arc::from("x"));
        c.status = 200;
        c.auth_user.push_str("alice");
        c.body.extend_from_slice(b"data");
        c.reset();
        assert_eq!(c.param_count(), 0);
        assert_eq!(c.status, 0);
        assert!(c.auth_user.is_empty());
        assert!(c.body.is_empty());
        assert!(!c.flags.url_params_set);
    }

    #[test]
    fn progressive_response_sets_expected_header() {
        let mut c = ctx("/f");
        let status = c.respond_progressive_file(std::path::Path::new("/tmp/x.cache"), 1024, 3);
        assert_eq!(status, 200);
        assert!(c.resp_custom_headers.contains("X-Expected-Size: 1024"));
        assert_eq!(c.partial_id, 3);
        assert_eq!(c.progressive_expected, 1024);
        assert_eq!(c.resp_content_type, super::super::constants::STATIC_FILE_CONTENT_TYPE);
    }
}
