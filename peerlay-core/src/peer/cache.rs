//! Peer cache coordinator
//!
//! One `HttpPeerCache` is a whole node: the local file stores (temporary
//! with TTL, size cap and LRU-by-access; permanent without TTL), the UDP
//! discovery exchange, the peer HTTP server routes, and the download
//! orchestration that prefers the best subnet peer over the origin.

use std::fs;
use std::io::{Read, Seek, SeekFrom, Write};
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, Weak};
use std::time::{Duration, Instant, SystemTime};

use uuid::Uuid;

use crate::config::{PeerCacheSettings, ServerConfig};
use crate::http::{
    AuthMode, HttpMethod, HttpServerRuntime, ParsedHead, RequestContext, Router, ServerHooks,
    TcpHttpServer,
};
use crate::logging::{init_logging, LoggingConfig};

use super::client::PeerClient;
use super::crypt::{crc63, PeerCrypt};
use super::discovery::{ConsultResult, RequestConsult, UdpPeerServer};
use super::net::{self, NetInterface};
use super::partial::PartialFileRegistry;
use super::{CacheError, CacheMessage, ContentHash, MessageKind};

/// Where a peer download lands. Seekable so failed peers can be retried
/// from the same starting offset.
pub trait DownloadSink: Write + Seek + Send {}

impl<T: Write + Seek + Send> DownloadSink for T {}

/// One file-with-known-hash the embedding client wants
#[derive(Debug, Clone)]
pub struct ContentRequest {
    /// Origin URL, used for logging and direct mode
    pub url: String,
    pub hash: ContentHash,
    /// Expected full size; 0 when unknown
    pub size: u64,
    /// Optional byte range, inclusive bounds
    pub range: Option<(u64, u64)>,
    /// Store class: permanent survives TTL purges
    pub permanent: bool,
}

struct IdleState {
    last_rotate: Instant,
    last_purge: Instant,
}

struct LastPeer {
    ip: Ipv4Addr,
    port: u16,
    uuid: Uuid,
}

pub struct HttpPeerCache {
    settings: PeerCacheSettings,
    crypt: Arc<PeerCrypt>,
    udp: Arc<UdpPeerServer>,
    http: Option<Arc<TcpHttpServer>>,
    partials: Arc<PartialFileRegistry>,
    client: PeerClient,
    uuid: Uuid,
    iface: NetInterface,
    /// Serializes local cache-file mutations (copy-in, purge, touch)
    files_lock: Mutex<()>,
    last_peer: Mutex<Option<LastPeer>>,
    idle: Mutex<IdleState>,
}

impl HttpPeerCache {
    /// Start a node on the automatically selected interface.
    pub fn start(settings: PeerCacheSettings, secret: &[u8]) -> crate::Result<Arc<Self>> {
        let candidates = [net::default_interface()];
        let iface = net::select_interface(&candidates, &settings.interface_filter, None)
            .unwrap_or_else(net::default_interface);
        Self::start_with_interface(settings, secret, iface)
    }

    /// Start a node on an explicit interface (tests, multi-homed hosts).
    pub fn start_with_interface(
        settings: PeerCacheSettings,
        secret: &[u8],
        iface: NetInterface,
    ) -> crate::Result<Arc<Self>> {
        settings.validate()?;
        if settings.options.verbose_log {
            let _ = init_logging(&LoggingConfig::verbose());
        }
        fs::create_dir_all(&settings.cache_temp_path)?;
        fs::create_dir_all(&settings.cache_perm_path)?;

        let uuid = settings.uuid.unwrap_or_else(Uuid::new_v4);
        let crypt = Arc::new(PeerCrypt::new(secret));
        let partials = Arc::new(PartialFileRegistry::new());
        let client = PeerClient::new(&settings)?;
        let udp = UdpPeerServer::new(crypt.clone(), iface.clone(), uuid, &settings)?;

        let http = if settings.options.no_server {
            None
        } else {
            let router = Arc::new(Router::new());
            let bind = format!("{}:{}", iface.ip, settings.port);
            Some(TcpHttpServer::start(&bind, ServerConfig::default(), router, AuthMode::None)?)
        };

        let node = Arc::new(Self {
            crypt,
            udp,
            http,
            partials,
            client,
            uuid,
            iface,
            files_lock: Mutex::new(()),
            last_peer: Mutex::new(None),
            idle: Mutex::new(IdleState {
                last_rotate: Instant::now(),
                last_purge: Instant::now(),
            }),
            settings,
        });

        if let Some(server) = &node.http {
            let on_request = Arc::downgrade(&node);
            server.router().run(
                &[HttpMethod::GET],
                "/peerlay/<hash>",
                Arc::new(move |ctx: &mut RequestContext| {
                    on_request.upgrade().map_or(500, |n| n.on_request(ctx))
                }),
                None,
            )?;
            if node.settings.options.http_direct {
                for scheme in ["/http/<path:rest>", "/https/<path:rest>"] {
                    let direct = Arc::downgrade(&node);
                    server.router().run(
                        &[HttpMethod::GET],
                        scheme,
                        Arc::new(move |ctx: &mut RequestContext| {
                            direct.upgrade().map_or(500, |n| n.on_request_direct(ctx))
                        }),
                        None,
                    )?;
                }
            }
            let before = Arc::downgrade(&node);
            let idle = Arc::downgrade(&node);
            server.set_hooks(ServerHooks {
                on_header_parsed: None,
                on_before_body: Some(Arc::new(move |ctx: &mut RequestContext, head: &ParsedHead| {
                    before.upgrade().map_or(500, |n| n.on_before_body(ctx, head))
                })),
                on_idle: Some(Arc::new(move || {
                    if let Some(n) = idle.upgrade() {
                        n.on_idle();
                    }
                })),
            });
            server.set_progressive_source(node.partials.clone());
        }

        let consult: Weak<dyn RequestConsult> = Arc::downgrade(&node) as Weak<dyn RequestConsult>;
        node.udp.set_consult(consult);
        node.udp.start()?;

        log::info!(
            "peer cache node {} on {} (udp {}, http {:?})",
            node.uuid,
            node.iface.ip,
            node.udp.local_port(),
            node.http.as_ref().map(|s| s.local_addr())
        );
        Ok(node)
    }

    pub fn uuid(&self) -> Uuid {
        self.uuid
    }

    pub fn settings(&self) -> &PeerCacheSettings {
        &self.settings
    }

    pub fn udp(&self) -> &Arc<UdpPeerServer> {
        &self.udp
    }

    pub fn http(&self) -> Option<&Arc<TcpHttpServer>> {
        self.http.as_ref()
    }

    pub fn partials(&self) -> &Arc<PartialFileRegistry> {
        &self.partials
    }

    pub fn shutdown(&self) {
        self.udp.shutdown();
        if let Some(server) = &self.http {
            server.shutdown();
        }
    }

    // ---- local stores -----------------------------------------------------

    /// On-disk location of a hash in one of the stores.
    pub fn cache_file_path(&self, hash: &ContentHash, permanent: bool) -> PathBuf {
        let dir = if permanent {
            &self.settings.cache_perm_path
        } else {
            &self.settings.cache_temp_path
        };
        let name = hash.cache_file_name();
        if self.settings.options.sub_folders {
            dir.join(hash.shard_nibble().to_string()).join(name)
        } else {
            dir.join(name)
        }
    }

    /// Permanent store first, then temporary; a temp hit refreshes the
    /// modification time so LRU-by-access sees it.
    fn local_lookup(&self, hash: &ContentHash) -> Option<(PathBuf, u64)> {
        for permanent in [true, false] {
            let path = self.cache_file_path(hash, permanent);
            if let Ok(meta) = fs::metadata(&path) {
                if !permanent {
                    let _guard = self.files_lock.lock().expect("files lock poisoned");
                    touch(&path);
                }
                return Some((path, meta.len()));
            }
        }
        None
    }

    fn store_min_bytes(&self, permanent: bool) -> u64 {
        if permanent {
            self.settings.cache_perm_min_bytes
        } else {
            self.settings.cache_temp_min_bytes
        }
    }

    // ---- download orchestration ------------------------------------------

    /// Satisfy a download from the local stores or the best peer.
    ///
    /// Returns the HTTP-like status of the transfer, or 0 when the caller
    /// should fall back to the origin.
    pub fn on_download(
        &self,
        req: &ContentRequest,
        out: &mut dyn DownloadSink,
    ) -> Result<u16, CacheError> {
        if req.hash.is_zero() {
            return Err(CacheError::MissingHash);
        }

        // Local hit short-circuits everything, including the broadcast
        if let Some((path, size)) = self.local_lookup(&req.hash) {
            log::debug!("local hit for {} at {}", req.hash.to_hex(), path.display());
            return self.stream_local(&path, size, req.range, out);
        }

        if req.size > 0 && req.size < self.store_min_bytes(req.permanent) {
            return Ok(0);
        }

        if self.settings.options.try_last_peer {
            let remembered =
                self.last_peer.lock().expect("last peer lock poisoned").as_ref().map(
                    |p| (p.ip, p.port, p.uuid),
                );
            if let Some((ip, port, _uuid)) = remembered {
                let rewind = out.stream_position().map_err(CacheError::Io)?;
                // The zero UUID marks the no-rebroadcast shortcut
                match self.fetch_from_peer(ip, port, Uuid::nil(), req, req.size, out) {
                    Ok(status) if status == 200 || status == 206 => return Ok(status),
                    _ => {
                        *self.last_peer.lock().expect("last peer lock poisoned") = None;
                        out.seek(SeekFrom::Start(rewind)).map_err(CacheError::Io)?;
                    }
                }
            }
        }

        let mut msg = self.udp.new_message(MessageKind::Request);
        msg.hash = req.hash;
        msg.size = req.size;
        if let Some((start, end)) = req.range {
            msg.range_start = start;
            msg.range_end = end;
        } else if req.size > 0 {
            msg.range_end = req.size - 1;
        }
        let responses = self.udp.broadcast(&mut msg);

        let mut candidates: Vec<&CacheMessage> = responses
            .iter()
            .filter(|r| {
                matches!(r.kind, MessageKind::ResponseFull | MessageKind::ResponsePartial)
            })
            .collect();
        if candidates.is_empty() {
            return Ok(0);
        }
        // Full beats partial, wire beats wifi, fast beats slow, idle beats
        // busy; arrival order breaks the rest (stable sort)
        candidates.sort_by_key(|r| {
            (
                u8::from(r.kind != MessageKind::ResponseFull),
                r.hardware.preference_rank(),
                u32::MAX - r.speed_mbits,
                r.connections,
            )
        });

        let attempts = if self.settings.options.try_all_peers {
            self.settings.try_all_peers_count.max(1) as usize
        } else {
            1
        };
        let rewind = out.stream_position().map_err(CacheError::Io)?;
        for resp in candidates.iter().take(attempts) {
            out.seek(SeekFrom::Start(rewind)).map_err(CacheError::Io)?;
            let port = resp.opaque as u16;
            let port = if port != 0 { port } else { self.settings.port };
            match self.fetch_from_peer(resp.sender_ip, port, resp.uuid, req, resp.size, out) {
                Ok(status) if status == 200 || status == 206 => {
                    *self.last_peer.lock().expect("last peer lock poisoned") =
                        Some(LastPeer { ip: resp.sender_ip, port, uuid: resp.uuid });
                    return Ok(status);
                }
                Ok(status) => {
                    log::debug!("peer {} answered {} for {}", resp.sender_ip, status, req.url);
                }
                Err(e) => {
                    log::debug!("peer {} failed for {}: {}", resp.sender_ip, req.url, e);
                }
            }
        }
        Ok(0)
    }

    fn stream_local(
        &self,
        path: &Path,
        size: u64,
        range: Option<(u64, u64)>,
        out: &mut dyn DownloadSink,
    ) -> Result<u16, CacheError> {
        let mut file = fs::File::open(path)?;
        let (start, end) = match range {
            Some((a, b)) => {
                if a >= size {
                    return Ok(416);
                }
                (a, b.min(size.saturating_sub(1)))
            }
            None => (0, size.saturating_sub(1)),
        };
        if size > 0 {
            file.seek(SeekFrom::Start(start))?;
            let mut remaining = end - start + 1;
            let mut buf = vec![0u8; 64 * 1024];
            while remaining > 0 {
                let want = (remaining as usize).min(buf.len());
                let n = file.read(&mut buf[..want])?;
                if n == 0 {
                    break;
                }
                out.write_all(&buf[..n]).map_err(CacheError::Io)?;
                remaining -= n as u64;
            }
            out.flush().map_err(CacheError::Io)?;
        }
        Ok(if range.is_some() { 206 } else { 200 })
    }

    fn fetch_from_peer(
        &self,
        ip: Ipv4Addr,
        port: u16,
        target_uuid: Uuid,
        req: &ContentRequest,
        expected_size: u64,
        out: &mut dyn DownloadSink,
    ) -> Result<u16, CacheError> {
        let mut bearer_msg = self.udp.new_message(MessageKind::RequestBearer);
        bearer_msg.seq = self.crypt.next_sequence();
        bearer_msg.uuid = target_uuid;
        bearer_msg.dest_ip = ip;
        bearer_msg.hash = req.hash;
        bearer_msg.size = expected_size;
        if let Some((start, end)) = req.range {
            bearer_msg.range_start = start;
            bearer_msg.range_end = end;
        } else if expected_size > 0 {
            bearer_msg.range_end = expected_size - 1;
        }
        let bearer = self.crypt.encode_bearer(&bearer_msg);
        let url = format!("http://{}:{}/peerlay/{}", ip, port, req.hash.to_hex());
        let (status, bytes) = self.client.fetch(&url, &bearer, req.range, out)?;
        log::debug!("peer GET {} -> {} ({} bytes)", url, status, bytes);
        Ok(status)
    }

    // ---- completion hooks -------------------------------------------------

    /// Promote a finished partial download into its store.
    ///
    /// Returns the final cache path, or `None` when the file was not worth
    /// keeping (below the store minimum, or larger than the whole cap).
    pub fn on_downloaded(
        &self,
        partial_path: &Path,
        hash: &ContentHash,
        permanent: bool,
        partial_id: u64,
    ) -> Result<Option<PathBuf>, CacheError> {
        let size = fs::metadata(partial_path)?.len();
        if size < self.store_min_bytes(permanent) {
            return Ok(None);
        }
        let final_path = self.cache_file_path(hash, permanent);
        let _guard = self.files_lock.lock().expect("files lock poisoned");

        if let Ok(existing) = fs::metadata(&final_path) {
            if existing.len() != size {
                log::warn!(
                    "cache file {} exists with size {} (incoming {}), keeping the existing copy",
                    final_path.display(),
                    existing.len(),
                    size
                );
            }
        } else {
            if !permanent {
                let cap = u64::from(self.settings.cache_temp_max_mb) * 1_000_000;
                if size > cap {
                    log::warn!("{} byte file exceeds the whole temp cap, dropping", size);
                    return Ok(None);
                }
                self.purge_until_fits(size, cap);
            }
            if let Some(parent) = final_path.parent() {
                fs::create_dir_all(parent)?;
            }
            fs::copy(partial_path, &final_path)?;
            // LRU-by-access starts counting from now
            touch(&final_path);
        }

        if partial_id != 0 {
            self.partials.change_file(partial_id, &final_path);
        }
        Ok(Some(final_path))
    }

    /// Drop whatever half-written artifact a failed download left behind.
    pub fn on_download_failed(&self, hash: &ContentHash) {
        let _guard = self.files_lock.lock().expect("files lock poisoned");
        for permanent in [false, true] {
            let path = self.cache_file_path(hash, permanent);
            if path.exists() {
                log::info!("removing possibly corrupt {}", path.display());
                let _ = fs::remove_file(path);
            }
        }
    }

    /// Periodic maintenance, safe to call often; throttles internally.
    pub fn on_idle(&self) {
        let mut idle = self.idle.lock().expect("idle lock poisoned");
        if idle.last_rotate.elapsed() >= Duration::from_secs(65) {
            self.udp.rotate_ban();
            idle.last_rotate = Instant::now();
        }
        let purge_every = Duration::from_secs(u64::from(self.settings.cache_temp_max_min) * 60);
        if idle.last_purge.elapsed() >= purge_every {
            idle.last_purge = Instant::now();
            drop(idle);
            self.purge_expired();
        }
    }

    fn purge_expired(&self) {
        let ttl = Duration::from_secs(u64::from(self.settings.cache_temp_max_min) * 60);
        let now = SystemTime::now();
        let _guard = self.files_lock.lock().expect("files lock poisoned");
        for (path, mtime, _) in scan_store(&self.settings.cache_temp_path) {
            let expired = now.duration_since(mtime).map_or(false, |age| age > ttl);
            if expired {
                log::debug!("temp cache entry {} expired", path.display());
                let _ = fs::remove_file(path);
            }
        }
    }

    /// Delete oldest temp entries until `incoming` more bytes fit the cap.
    /// Caller holds the files lock.
    fn purge_until_fits(&self, incoming: u64, cap: u64) {
        let mut entries = scan_store(&self.settings.cache_temp_path);
        let mut total: u64 = entries.iter().map(|(_, _, len)| len).sum();
        if total + incoming <= cap {
            return;
        }
        entries.sort_by_key(|(_, mtime, _)| *mtime);
        for (path, _, len) in entries {
            if total + incoming <= cap {
                break;
            }
            if fs::remove_file(&path).is_ok() {
                log::debug!("evicted {} ({} bytes) for cap", path.display(), len);
                total -= len;
            }
        }
    }

    // ---- HTTP server integration -----------------------------------------

    /// Gate every request before its body is read.
    fn on_before_body(&self, ctx: &mut RequestContext, _head: &ParsedHead) -> u16 {
        if ctx.method != HttpMethod::GET {
            return 405;
        }
        if ctx.url.is_empty() {
            return 400;
        }
        if ctx.bearer.is_empty() {
            return 401;
        }
        let direct = ctx.url.starts_with("/http/") || ctx.url.starts_with("/https/");
        if direct {
            if !self.settings.options.http_direct {
                return 403;
            }
            if !ctx.remote_ip.is_loopback() {
                return 403;
            }
            match self.crypt.decode_bearer(&ctx.bearer, MessageKind::DirectBearer) {
                Ok(msg) if msg.opaque == crc63(ctx.url.as_bytes()) => 0,
                Ok(_) => {
                    log::debug!("direct bearer bound to another URL, rejecting");
                    403
                }
                Err(e) => {
                    log::debug!("direct bearer rejected: {}", e);
                    403
                }
            }
        } else {
            match self.crypt.decode_bearer(&ctx.bearer, MessageKind::RequestBearer) {
                Ok(_) => 0,
                Err(e) => {
                    log::debug!("peer bearer rejected from {}: {}", ctx.remote_ip, e);
                    403
                }
            }
        }
    }

    /// Serve `GET /peerlay/<hash>` for a sibling peer.
    fn on_request(&self, ctx: &mut RequestContext) -> u16 {
        let Some(hex) = ctx.param("hash") else {
            return 400;
        };
        let Some(hash) = ContentHash::from_hex(hex) else {
            return 400;
        };
        let msg = match self.crypt.decode_bearer(&ctx.bearer, MessageKind::RequestBearer) {
            Ok(msg) => msg,
            Err(_) => return 403,
        };
        if msg.hash != hash {
            return 403;
        }
        if msg.dest_ip != self.iface.ip {
            return 403;
        }
        if !msg.uuid.is_nil() && msg.uuid != self.uuid {
            return 403;
        }

        if let Some((path, _size)) = self.local_lookup(&hash) {
            return ctx.respond_file(&path);
        }
        if let Some((id, path, _current, expected)) = self.partials.find(&hash) {
            return ctx.respond_progressive_file(&path, expected, id);
        }
        // 204 tells the requester to broadcast again rather than fail
        ctx.respond(204, crate::http::constants::NO_RESPONSE_CONTENT_TYPE, Vec::new())
    }

    /// Serve `/http/…` and `/https/…` for the localhost direct mode.
    fn on_request_direct(&self, ctx: &mut RequestContext) -> u16 {
        if !self.settings.options.http_direct || !ctx.remote_ip.is_loopback() {
            return 403;
        }
        let msg = match self.crypt.decode_bearer(&ctx.bearer, MessageKind::DirectBearer) {
            Ok(msg) => msg,
            Err(_) => return 403,
        };
        if msg.opaque != crc63(ctx.url.as_bytes()) {
            return 403;
        }
        if !msg.hash.is_zero() {
            if let Some((path, _)) = self.local_lookup(&msg.hash) {
                return ctx.respond_file(&path);
            }
        }
        let Some(origin) = parse_direct_url(ctx.path()) else {
            return 400;
        };
        // Fetch on the client's behalf into the temp store, then serve it
        let staging = self
            .settings
            .cache_temp_path
            .join(format!("direct-{}.part", self.crypt.next_sequence()));
        let fetched = (|| -> Result<u64, CacheError> {
            let mut file = fs::File::create(&staging)?;
            let (status, bytes) = self.client.fetch_direct(&origin, &mut file)?;
            if status != 200 {
                return Err(CacheError::Transport(format!("origin answered {}", status)));
            }
            Ok(bytes)
        })();
        match fetched {
            Ok(_) => {
                let hash = match hash_file(&staging) {
                    Ok(hash) => hash,
                    Err(_) => return 500,
                };
                let final_path = match self.on_downloaded(&staging, &hash, false, 0) {
                    Ok(Some(path)) => path,
                    _ => staging.clone(),
                };
                let _ = fs::remove_file(&staging);
                ctx.respond_file(&final_path)
            }
            Err(e) => {
                log::debug!("direct fetch of {} failed: {}", origin, e);
                let _ = fs::remove_file(&staging);
                502
            }
        }
    }
}

impl RequestConsult for HttpPeerCache {
    fn consult(&self, msg: &CacheMessage) -> ConsultResult {
        let active = self.active_connections();
        if u32::from(active) > self.settings.limit_client_count {
            return ConsultResult::Overloaded;
        }
        for permanent in [true, false] {
            let path = self.cache_file_path(&msg.hash, permanent);
            if let Ok(meta) = fs::metadata(&path) {
                return ConsultResult::Full(meta.len());
            }
        }
        if let Some((_, _, current, _)) = self.partials.find(&msg.hash) {
            return ConsultResult::Partial(current);
        }
        ConsultResult::None
    }

    fn active_connections(&self) -> u16 {
        self.http.as_ref().map_or(0, |s| s.active_connections().min(usize::from(u16::MAX)) as u16)
    }

    fn http_port(&self) -> u16 {
        self.http.as_ref().map_or(0, |s| s.local_addr().port())
    }
}

fn touch(path: &Path) {
    if let Ok(file) = fs::OpenOptions::new().write(true).open(path) {
        let _ = file.set_modified(SystemTime::now());
    }
}

fn hash_file(path: &Path) -> std::io::Result<ContentHash> {
    let mut file = fs::File::open(path)?;
    ContentHash::sha256_of_reader(&mut file)
}

/// Collect `(path, mtime, size)` of the store's files, shard folders
/// included.
fn scan_store(dir: &Path) -> Vec<(PathBuf, SystemTime, u64)> {
    let mut out = Vec::new();
    let Ok(entries) = fs::read_dir(dir) else {
        return out;
    };
    for entry in entries.flatten() {
        let path = entry.path();
        let Ok(meta) = entry.metadata() else { continue };
        if meta.is_dir() {
            out.extend(scan_store(&path));
        } else if path.extension().is_some_and(|e| e == "cache") {
            let mtime = meta.modified().unwrap_or(SystemTime::UNIX_EPOCH);
            out.push((path, mtime, meta.len()));
        }
    }
    out
}

/// `/<scheme>/<host>[_<port>]/<path>` → `scheme://host[:port]/path`
fn parse_direct_url(path: &str) -> Option<String> {
    let (scheme, rest) = if let Some(rest) = path.strip_prefix("/https/") {
        ("https", rest)
    } else if let Some(rest) = path.strip_prefix("/http/") {
        ("http", rest)
    } else {
        return None;
    };
    let (host, tail) = match rest.split_once('/') {
        Some((host, tail)) => (host, tail),
        None => (rest, ""),
    };
    if host.is_empty() {
        return None;
    }
    let host = host.replace('_', ":");
    Some(format!("{}://{}/{}", scheme, host, tail))
}
