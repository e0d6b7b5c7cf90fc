//! Response head composition
//!
//! Builds the status line and header block that precede any body. The
//! two hot statuses (200, 206) use dedicated literals; everything else is
//! formatted from the RFC reason table.

use std::fmt::Write;

use crate::config::ServerConfig;

use super::constants::CRLF;

/// Reason phrase for an HTTP status code
pub fn reason_phrase(status: u16) -> &'static str {
    match status {
        100 => "Continue",
        101 => "Switching Protocols",
        200 => "OK",
        201 => "Created",
        202 => "Accepted",
        203 => "Non-Authoritative Information",
        204 => "No Content",
        206 => "Partial Content",
        301 => "Moved Permanently",
        302 => "Found",
        303 => "See Other",
        304 => "Not Modified",
        307 => "Temporary Redirect",
        308 => "Permanent Redirect",
        400 => "Bad Request",
        401 => "Unauthorized",
        403 => "Forbidden",
        404 => "Not Found",
        405 => "Method Not Allowed",
        406 => "Not Acceptable",
        408 => "Request Timeout",
        409 => "Conflict",
        410 => "Gone",
        411 => "Length Required",
        412 => "Precondition Failed",
        413 => "Payload Too Large",
        414 => "URI Too Long",
        415 => "Unsupported Media Type",
        416 => "Range Not Satisfiable",
        417 => "Expectation Failed",
        418 => "I'm a teapot",
        421 => "Misdirected Request",
        426 => "Upgrade Required",
        429 => "Too Many Requests",
        431 => "Request Header Fields Too Large",
        500 => "Internal Server Error",
        501 => "Not Implemented",
        502 => "Bad Gateway",
        503 => "Service Unavailable",
        504 => "Gateway Timeout",
        505 => "HTTP Version Not Supported",
        _ => "Unknown",
    }
}

/// Head builder for a single response
pub struct ResponseHead {
    buf: Vec<u8>,
    /// Set when the handler's custom headers already carry a
    /// `Content-Encoding`, which disables server-side compression
    pub content_encoding_set: bool,
}

impl ResponseHead {
    /// Compose the full head, CRLF-terminated, ready to prepend to the body.
    #[allow(clippy::too_many_arguments)]
    pub fn compose(
        status: u16,
        http10: bool,
        config: &ServerConfig,
        content_type: &str,
        content_length: u64,
        custom_headers: &str,
        extra: &[(&str, String)],
        keep_alive: bool,
    ) -> Self {
        let mut head = String::with_capacity(256);
        match (status, http10) {
            (200, false) => head.push_str("HTTP/1.1 200 OK\r\n"),
            (206, false) => head.push_str("HTTP/1.1 206 Partial Content\r\n"),
            _ => {
                let proto = if http10 { "HTTP/1.0" } else { "HTTP/1.1" };
                write!(&mut head, "{} {} {}{}", proto, status, reason_phrase(status), CRLF)
                    .expect("write to String is infallible");
            }
        }

        let mut content_encoding_set = false;
        for line in custom_headers.lines() {
            let line = line.trim_end_matches('\r');
            if line.is_empty() {
                continue;
            }
            if line.len() >= 17 && line[..17].eq_ignore_ascii_case("content-encoding:") {
                content_encoding_set = true;
            }
            head.push_str(line);
            head.push_str(CRLF);
        }
        for (name, value) in extra {
            write!(&mut head, "{}: {}{}", name, value, CRLF)
                .expect("write to String is infallible");
        }

        if !content_type.is_empty() {
            write!(&mut head, "Content-Type: {}{}", content_type, CRLF)
                .expect("write to String is infallible");
        }
        write!(&mut head, "Content-Length: {}{}", content_length, CRLF)
            .expect("write to String is infallible");
        write!(&mut head, "Server: {}{}", config.server_name, CRLF)
            .expect("write to String is infallible");
        if let Some(powered) = &config.x_powered_by {
            write!(&mut head, "X-Powered-By: {}{}", powered, CRLF)
                .expect("write to String is infallible");
        }
        if config.emit_date {
            write!(
                &mut head,
                "Date: {}{}",
                chrono::Utc::now().format("%a, %d %b %Y %H:%M:%S GMT"),
                CRLF
            )
            .expect("write to String is infallible");
        }
        let connection = if keep_alive { "keep-alive" } else { "close" };
        write!(&mut head, "Connection: {}{}{}", connection, CRLF, CRLF)
            .expect("write to String is infallible");

        Self { buf: head.into_bytes(), content_encoding_set }
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.buf
    }
}

/// Generic HTML body for statuses the handler produced no content for
pub fn html_error_body(status: u16, detail: &str) -> Vec<u8> {
    format!(
        "<!DOCTYPE html><html><body><h1>{} {}</h1><p>{}</p></body></html>",
        status,
        reason_phrase(status),
        detail
    )
    .into_bytes()
}
