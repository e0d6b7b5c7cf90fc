//! Per-socket connection state machine
//!
//! One exchange walks ReadingHeaders → admission checks → ReadingBody →
//! Dispatching → SendingHeaders → SendingBody. The body phase has its own
//! sub-states (`Send`, `Wait`, `Done`, `Abort`) because a progressive
//! source may not yet hold the bytes the head promised: `Wait` sleeps
//! ~10 ms and re-polls the partial registry until the file caught up, the
//! download aborted, or the server shut down.

use std::fs::File;
use std::io::{BufReader, Read, Seek, SeekFrom, Write};
use std::net::{IpAddr, SocketAddr, TcpStream};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::path::PathBuf;
use std::sync::atomic::Ordering;
use std::time::{Duration, Instant};

use super::auth::AuthOutcome;
use super::compress::MIN_COMPRESS_SIZE;
use super::constants::{NO_RESPONSE_CONTENT_TYPE, STATIC_FILE_CONTENT_TYPE};
use super::context::RequestContext;
use super::request::{HttpMethod, ParsedHead};
use super::response::{html_error_body, ResponseHead};
use super::server::ServerShared;
use super::HttpError;

/// Sub-states of the body-sending phase
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BodyState {
    Send,
    Wait,
    Done,
    Abort,
}

/// Verdict of the partial registry about an in-flight progressive source
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProgressivePoll {
    /// The download is alive; more bytes will arrive
    Growing,
    /// The download was aborted; streaming must stop
    Aborted,
    /// The registry no longer tracks this id (completed or promoted)
    Unknown,
}

/// Seam between the HTTP server and whatever tracks in-flight downloads
pub trait ProgressiveSource: Send + Sync {
    fn poll(&self, id: u64) -> ProgressivePoll;
    /// A progressive response finished streaming.
    fn completed(&self, id: u64);
}

/// A connection that finished one exchange and wants more
pub(crate) struct OpenConnection {
    pub stream: TcpStream,
    pub reader: BufReader<TcpStream>,
    pub peer: SocketAddr,
}

enum ExchangeEnd {
    KeepAlive,
    Close,
}

/// Serve the first exchange. Returns the still-open connection when the
/// client negotiated keep-alive, so the caller can decide where the rest
/// of its lifetime runs (same thread or a dedicated worker).
pub(crate) fn serve_first(
    shared: &ServerShared,
    stream: TcpStream,
    peer: SocketAddr,
) -> Option<OpenConnection> {
    let reader_stream = match stream.try_clone() {
        Ok(s) => s,
        Err(e) => {
            log::debug!("connection clone failed for {}: {}", peer, e);
            return None;
        }
    };
    let mut open = OpenConnection { stream, reader: BufReader::new(reader_stream), peer };
    match serve_exchange(shared, &mut open, true) {
        ExchangeEnd::KeepAlive => Some(open),
        ExchangeEnd::Close => None,
    }
}

/// Keep-alive loop after the first exchange.
pub(crate) fn serve_rest(shared: &ServerShared, mut open: OpenConnection) {
    loop {
        if shared.terminated.load(Ordering::Relaxed) {
            return;
        }
        match serve_exchange(shared, &mut open, false) {
            ExchangeEnd::KeepAlive => {}
            ExchangeEnd::Close => return,
        }
    }
}

fn serve_exchange(shared: &ServerShared, open: &mut OpenConnection, first: bool) -> ExchangeEnd {
    let config = &shared.config;
    let started = Instant::now();

    // Idle wait between keep-alive exchanges uses the keep-alive deadline;
    // the first head read uses the (usually shorter) header deadline.
    let timeout = if first { config.header_timeout } else { Some(config.keep_alive_timeout) };
    if open.stream.set_read_timeout(timeout).is_err() {
        return ExchangeEnd::Close;
    }

    let head = match ParsedHead::read(&mut open.reader, config.max_header_lines) {
        Ok(Some(head)) => head,
        Ok(None) => return ExchangeEnd::Close,
        Err(HttpError::Timeout) => {
            if first && config.ban_40x {
                shared.ban.ban(open.peer.ip());
            }
            return ExchangeEnd::Close;
        }
        Err(HttpError::UnsupportedMethod(m)) => {
            log::debug!("{} sent unknown method {:?}", open.peer, m);
            let _ = send_simple(shared, open, 404, false, &[], false);
            return ExchangeEnd::Close;
        }
        Err(e) => {
            log::debug!("{} sent a malformed request: {}", open.peer, e);
            if config.ban_40x {
                shared.ban.ban(open.peer.ip());
            }
            let _ = send_simple(shared, open, 400, false, &[], false);
            return ExchangeEnd::Close;
        }
    };

    let method = head.method.expect("set by a successful parse");
    let keep_alive = head.wants_keep_alive();

    // Real client IP and connection ID, header overrides first
    let remote_ip: IpAddr = config
        .remote_ip_header
        .as_deref()
        .and_then(|h| head.headers.get(&h.to_ascii_lowercase()))
        .and_then(|v| v.parse().ok())
        .unwrap_or_else(|| open.peer.ip());
    let connection_id: u32 = config
        .connection_id_header
        .as_deref()
        .and_then(|h| head.headers.get(&h.to_ascii_lowercase()))
        .and_then(|v| v.parse().ok())
        .unwrap_or_else(|| shared.next_connection_id());

    shared.metrics.requests.fetch_add(1, Ordering::Relaxed);

    if let Some(hook) = shared.hook_on_header_parsed() {
        if let Some(status) = hook(&head, remote_ip) {
            let sent = send_simple(shared, open, status, head.http10, &[], keep_alive).is_ok();
            return if sent && keep_alive { ExchangeEnd::KeepAlive } else { ExchangeEnd::Close };
        }
    }

    if head.content_length > config.max_body_size {
        let _ = send_simple(shared, open, 413, head.http10, &[], false);
        return ExchangeEnd::Close;
    }

    let mut auth_user = String::new();
    if shared.auth.enabled() {
        match shared.auth.check(
            head.authorization.as_deref(),
            method,
            &head.uri,
            connection_id,
            remote_ip,
        ) {
            AuthOutcome::Authorized(user) => auth_user = user,
            AuthOutcome::Challenge(challenge) => {
                let extra = [("WWW-Authenticate", challenge)];
                let sent = send_simple(shared, open, 401, head.http10, &extra, keep_alive).is_ok();
                return if sent && keep_alive { ExchangeEnd::KeepAlive } else { ExchangeEnd::Close };
            }
            AuthOutcome::Reject => {
                let _ = send_simple(shared, open, 403, head.http10, &[], false);
                return ExchangeEnd::Close;
            }
        }
    }

    let mut ctx = RequestContext::new(method, head.uri.clone(), remote_ip, connection_id);
    ctx.flags.http10 = head.http10;
    ctx.flags.upgrade = head.connection_upgrade;
    ctx.flags.authorized = !auth_user.is_empty();
    ctx.auth_user = auth_user;
    ctx.range = head.range;
    ctx.headers = head.headers.clone();
    if let Some(auth) = &head.authorization {
        if let Some(token) = auth.strip_prefix("Bearer ") {
            ctx.bearer = token.trim().to_string();
        }
    }

    if let Some(hook) = shared.hook_on_before_body() {
        let verdict = hook(&mut ctx, &head);
        if verdict != 0 && verdict != 202 {
            if config.ban_40x && (400..500).contains(&verdict) && verdict != 401 && verdict != 403 {
                shared.ban.ban(remote_ip);
            }
            let sent = send_simple(shared, open, verdict, head.http10, &[], keep_alive).is_ok();
            return if sent && keep_alive { ExchangeEnd::KeepAlive } else { ExchangeEnd::Close };
        }
    }

    if head.expect_continue && !head.http10 {
        if open.stream.write_all(b"HTTP/1.1 100 Continue\r\n\r\n").is_err() {
            return ExchangeEnd::Close;
        }
    }

    if !method.is_bodyless() && head.content_length > 0 {
        ctx.body.resize(head.content_length, 0);
        if let Err(e) = open.reader.read_exact(&mut ctx.body) {
            log::debug!("{} body read failed: {}", open.peer, e);
            return ExchangeEnd::Close;
        }
        if let Some(coding) = &head.content_encoding {
            match shared.compress.decode(coding, &ctx.body) {
                Some(Ok(decoded)) => ctx.body = decoded,
                Some(Err(e)) => {
                    log::debug!("{} sent an undecodable {} body: {}", open.peer, coding, e);
                    let _ = send_simple(shared, open, 400, head.http10, &[], false);
                    return ExchangeEnd::Close;
                }
                None => {}
            }
        }
    }

    // Router first; a rewrite mutates the context and falls through to the
    // default handler with the new method and URL. Panics anywhere in the
    // dispatch become a 500 at this single boundary.
    let dispatched = catch_unwind(AssertUnwindSafe(|| {
        let mut status = shared.router.process(&mut ctx);
        if status == 0 {
            if let Some(handler) = shared.handler() {
                status = handler(&mut ctx);
            }
        }
        status
    }));
    let mut status = match dispatched {
        Ok(status) => status,
        Err(_) => {
            log::error!("handler panicked for {} {}", method, head.uri);
            ctx.resp_body = html_error_body(500, "unhandled server error");
            ctx.resp_content_type = "text/html; charset=utf-8".to_string();
            ctx.partial_id = 0;
            let extra: Vec<(&str, String)> = Vec::new();
            let _ = send_response(shared, open, &ctx, 500, &head, &extra, false);
            return ExchangeEnd::Close;
        }
    };
    if status == 0 {
        status = 404;
    }

    if config.ban_40x && (400..500).contains(&status) && status != 401 && status != 403 {
        shared.ban.ban(remote_ip);
    }

    let extra: Vec<(&str, String)> = Vec::new();
    let keep_alive = keep_alive && !shared.terminated.load(Ordering::Relaxed);
    let result = send_response(shared, open, &ctx, status, &head, &extra, keep_alive);

    let (bytes, end) = match result {
        Ok(sent) => sent,
        Err(e) => {
            log::debug!("{} response write failed: {}", open.peer, e);
            return ExchangeEnd::Close;
        }
    };
    shared.metrics.bytes_out.fetch_add(bytes, Ordering::Relaxed);
    log::debug!(
        "{} {} {} -> {} {}B in {:?}",
        remote_ip,
        method,
        head.uri,
        status,
        bytes,
        started.elapsed()
    );
    end
}

/// A headers-only response with an optional generated HTML body for errors.
fn send_simple(
    shared: &ServerShared,
    open: &mut OpenConnection,
    status: u16,
    http10: bool,
    extra: &[(&str, String)],
    keep_alive: bool,
) -> std::io::Result<u64> {
    let body = if status >= 400 { html_error_body(status, "") } else { Vec::new() };
    let content_type = if body.is_empty() { "" } else { "text/html; charset=utf-8" };
    let head = ResponseHead::compose(
        status,
        http10,
        &shared.config,
        content_type,
        body.len() as u64,
        "",
        extra,
        keep_alive,
    );
    open.stream.write_all(head.as_bytes())?;
    if !body.is_empty() {
        open.stream.write_all(&body)?;
    }
    open.stream.flush()?;
    Ok((head.as_bytes().len() + body.len()) as u64)
}

/// Send the handler's response: in-memory bytes, the no-response sentinel,
/// a static file (with ranges) or a progressive file.
///
/// Returns the bytes written and whether the connection survives.
fn send_response(
    shared: &ServerShared,
    open: &mut OpenConnection,
    ctx: &RequestContext,
    status: u16,
    head: &ParsedHead,
    extra: &[(&str, String)],
    keep_alive: bool,
) -> std::io::Result<(u64, ExchangeEnd)> {
    let is_head = head.method == Some(HttpMethod::HEAD);
    let mut extra: Vec<(&str, String)> = extra.to_vec();

    if ctx.resp_content_type == STATIC_FILE_CONTENT_TYPE {
        return send_file_response(shared, open, ctx, status, head, extra, keep_alive, is_head);
    }

    let mut body: Vec<u8>;
    let mut content_type = ctx.resp_content_type.as_str();
    if ctx.resp_content_type == NO_RESPONSE_CONTENT_TYPE {
        body = Vec::new();
        content_type = "";
    } else if ctx.resp_body.is_empty() && status >= 400 {
        body = html_error_body(status, &ctx.error_message);
        content_type = "text/html; charset=utf-8";
    } else {
        body = ctx.resp_body.clone();
        if content_type.is_empty() && !body.is_empty() {
            content_type = "text/plain; charset=utf-8";
        }
    }

    // Opportunistic gzip for larger in-memory bodies. A Content-Encoding
    // line among the handler's custom headers disables this.
    let handler_encoded = ctx
        .resp_custom_headers
        .lines()
        .any(|l| l.len() >= 17 && l[..17].eq_ignore_ascii_case("content-encoding:"));
    if shared.config.gzip_responses
        && status == 200
        && !handler_encoded
        && body.len() >= MIN_COMPRESS_SIZE
    {
        if let Some(accept) = &head.accept_encoding {
            if let Some(coding) = shared.compress.negotiate(accept) {
                if let Ok(packed) = (coding.compress)(&body) {
                    if packed.len() < body.len() {
                        extra.push(("Content-Encoding", coding.name.to_string()));
                        body = packed;
                    }
                }
            }
        }
    }

    let response_head = ResponseHead::compose(
        status,
        head.http10,
        &shared.config,
        content_type,
        body.len() as u64,
        &ctx.resp_custom_headers,
        &extra,
        keep_alive,
    );
    let mut bytes = response_head.as_bytes().len() as u64;
    open.stream.write_all(response_head.as_bytes())?;
    if !is_head && !body.is_empty() {
        open.stream.write_all(&body)?;
        bytes += body.len() as u64;
    }
    open.stream.flush()?;
    let end = if keep_alive { ExchangeEnd::KeepAlive } else { ExchangeEnd::Close };
    Ok((bytes, end))
}

#[allow(clippy::too_many_arguments)]
fn send_file_response(
    shared: &ServerShared,
    open: &mut OpenConnection,
    ctx: &RequestContext,
    status: u16,
    head: &ParsedHead,
    mut extra: Vec<(&str, String)>,
    keep_alive: bool,
    is_head: bool,
) -> std::io::Result<(u64, ExchangeEnd)> {
    let path = PathBuf::from(String::from_utf8_lossy(&ctx.resp_body).into_owned());
    let mut file = match File::open(&path) {
        Ok(f) => f,
        Err(e) => {
            log::warn!("static file {} unreadable: {}", path.display(), e);
            let bytes = send_simple(shared, open, 404, head.http10, &[], keep_alive)?;
            let end = if keep_alive { ExchangeEnd::KeepAlive } else { ExchangeEnd::Close };
            return Ok((bytes, end));
        }
    };
    let meta = file.metadata()?;
    let progressive = ctx.partial_id != 0;
    let total = if progressive { ctx.progressive_expected } else { meta.len() };

    extra.push(("Accept-Ranges", "bytes".to_string()));
    if !progressive {
        if let Ok(mtime) = meta.modified() {
            let mtime: chrono::DateTime<chrono::Utc> = mtime.into();
            extra.push((
                "Last-Modified",
                mtime.format("%a, %d %b %Y %H:%M:%S GMT").to_string(),
            ));
            let etag = format!("W/\"{:x}-{:x}\"", total, mtime.timestamp());
            if head.if_none_match.as_deref().is_some_and(|inm| inm.contains(&etag)) {
                let bytes = send_simple(shared, open, 304, head.http10, &[], keep_alive)?;
                let end = if keep_alive { ExchangeEnd::KeepAlive } else { ExchangeEnd::Close };
                return Ok((bytes, end));
            }
            extra.push(("ETag", etag));
        }
    }

    // Resolve the requested range against the (expected) total size
    let (start, end_incl, status) = match ctx.range {
        Some(range) => match range.resolve(total) {
            Some((a, b)) => {
                extra.push(("Content-Range", format!("bytes {}-{}/{}", a, b, total)));
                (a, b, 206)
            }
            None => {
                extra.push(("Content-Range", format!("bytes */{}", total)));
                let bytes = send_simple(shared, open, 416, head.http10, &extra, keep_alive)?;
                let end = if keep_alive { ExchangeEnd::KeepAlive } else { ExchangeEnd::Close };
                return Ok((bytes, end));
            }
        },
        None => {
            if total == 0 {
                let bytes = send_simple(shared, open, status, head.http10, &extra, keep_alive)?;
                let end = if keep_alive { ExchangeEnd::KeepAlive } else { ExchangeEnd::Close };
                return Ok((bytes, end));
            }
            (0, total - 1, status)
        }
    };
    let promised = end_incl - start + 1;

    let response_head = ResponseHead::compose(
        status,
        head.http10,
        &shared.config,
        "application/octet-stream",
        promised,
        &ctx.resp_custom_headers,
        &extra,
        keep_alive,
    );
    open.stream.write_all(response_head.as_bytes())?;
    let mut bytes = response_head.as_bytes().len() as u64;
    if is_head {
        open.stream.flush()?;
        let end = if keep_alive { ExchangeEnd::KeepAlive } else { ExchangeEnd::Close };
        return Ok((bytes, end));
    }

    // Stream the body through the Send/Wait machine
    let mut buf = vec![0u8; shared.config.send_buffer_size.clamp(4096, 1 << 20)];
    let mut pos = start;
    let mut state = BodyState::Send;
    while state != BodyState::Done && state != BodyState::Abort {
        match state {
            BodyState::Send => {
                let len = file.metadata()?.len();
                let avail = len.min(end_incl + 1);
                if pos < avail {
                    let want = ((avail - pos) as usize).min(buf.len());
                    file.seek(SeekFrom::Start(pos))?;
                    let n = file.read(&mut buf[..want])?;
                    if n == 0 {
                        state = BodyState::Wait;
                        continue;
                    }
                    open.stream.write_all(&buf[..n])?;
                    pos += n as u64;
                    bytes += n as u64;
                } else if pos > end_incl {
                    state = BodyState::Done;
                } else {
                    state = BodyState::Wait;
                }
                if pos > end_incl {
                    state = BodyState::Done;
                }
            }
            BodyState::Wait => {
                if !progressive {
                    // A plain file that shrank under us; nothing to wait for
                    log::warn!("static file {} truncated mid-send", path.display());
                    state = BodyState::Abort;
                    continue;
                }
                if shared.terminated.load(Ordering::Relaxed) {
                    state = BodyState::Abort;
                    continue;
                }
                match shared.poll_progressive(ctx.partial_id) {
                    ProgressivePoll::Growing => {
                        std::thread::sleep(Duration::from_millis(10));
                        state = BodyState::Send;
                    }
                    ProgressivePoll::Aborted => state = BodyState::Abort,
                    ProgressivePoll::Unknown => {
                        // The entry left the registry; if the file reached
                        // its promised size we can finish from disk
                        if file.metadata()?.len() >= ctx.progressive_expected {
                            state = BodyState::Send;
                        } else {
                            state = BodyState::Abort;
                        }
                    }
                }
            }
            BodyState::Done | BodyState::Abort => unreachable!("loop exits first"),
        }
    }
    open.stream.flush()?;

    if progressive {
        shared.notify_progressive_done(ctx.partial_id);
    }
    if state == BodyState::Abort {
        return Ok((bytes, ExchangeEnd::Close));
    }
    let end = if keep_alive { ExchangeEnd::KeepAlive } else { ExchangeEnd::Close };
    Ok((bytes, end))
}
