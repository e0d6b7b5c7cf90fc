//! TCP accept loop and worker scheduling
//!
//! One accept thread owns the listener and the once-per-second ban-set
//! rotation. Short exchanges run on a bounded worker pool; connections
//! that negotiate keep-alive are promoted to dedicated workers drawn from
//! a size-capped set. A pool size below zero serves everything on the
//! accept thread (enough for a low-volume redirector), zero spawns one
//! thread per connection.

use std::io::Write;
use std::net::{IpAddr, SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::mpsc::{sync_channel, Receiver, SyncSender, TrySendError};
use std::sync::{Arc, Mutex, RwLock};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crate::config::ServerConfig;

use super::auth::{AuthEngine, AuthMode};
use super::ban::BanList;
use super::compress::CompressRegistry;
use super::conn::{serve_first, serve_rest, ProgressivePoll, ProgressiveSource};
use super::constants::TEAPOT_BODY;
use super::context::RequestContext;
use super::request::ParsedHead;
use super::router::Router;
use super::{HttpError, HttpResult};

/// Fallback handler invoked when no route matched
pub type RequestHandler = Arc<dyn Fn(&mut RequestContext) -> u16 + Send + Sync>;
/// Early hook running right after header parse; `Some(status)` ends the
/// exchange with that status
pub type HeaderParsedHook = Arc<dyn Fn(&ParsedHead, IpAddr) -> Option<u16> + Send + Sync>;
/// Hook running before the body is read; 0 or 202 accept, anything else
/// rejects with that status
pub type BeforeBodyHook = Arc<dyn Fn(&mut RequestContext, &ParsedHead) -> u16 + Send + Sync>;
/// Invoked from the accept thread roughly once per second while idle
pub type IdleHook = Arc<dyn Fn() + Send + Sync>;

#[derive(Default, Clone)]
pub struct ServerHooks {
    pub on_header_parsed: Option<HeaderParsedHook>,
    pub on_before_body: Option<BeforeBodyHook>,
    pub on_idle: Option<IdleHook>,
}

/// Atomic counters surfaced from the server handle
#[derive(Default)]
pub struct ServerMetrics {
    pub accepted: AtomicU64,
    pub active_connections: AtomicUsize,
    pub requests: AtomicU64,
    pub bytes_out: AtomicU64,
}

/// State shared between the accept thread, the workers and the handle
pub(crate) struct ServerShared {
    pub config: ServerConfig,
    pub router: Arc<Router>,
    pub auth: AuthEngine,
    pub compress: CompressRegistry,
    pub metrics: ServerMetrics,
    pub ban: BanList,
    pub terminated: AtomicBool,
    handler: RwLock<Option<RequestHandler>>,
    hooks: RwLock<ServerHooks>,
    progressive: RwLock<Option<Arc<dyn ProgressiveSource>>>,
    conn_seq: AtomicU32,
    queued: AtomicUsize,
}

impl ServerShared {
    /// Monotonic 31-bit connection sequence
    pub fn next_connection_id(&self) -> u32 {
        self.conn_seq.fetch_add(1, Ordering::Relaxed) & 0x7fff_ffff
    }

    pub fn handler(&self) -> Option<RequestHandler> {
        self.handler.read().expect("handler lock poisoned").clone()
    }

    pub fn hook_on_header_parsed(&self) -> Option<HeaderParsedHook> {
        self.hooks.read().expect("hooks lock poisoned").on_header_parsed.clone()
    }

    pub fn hook_on_before_body(&self) -> Option<BeforeBodyHook> {
        self.hooks.read().expect("hooks lock poisoned").on_before_body.clone()
    }

    fn hook_on_idle(&self) -> Option<IdleHook> {
        self.hooks.read().expect("hooks lock poisoned").on_idle.clone()
    }

    pub fn poll_progressive(&self, id: u64) -> ProgressivePoll {
        match self.progressive.read().expect("progressive lock poisoned").as_ref() {
            Some(source) => source.poll(id),
            None => ProgressivePoll::Unknown,
        }
    }

    pub fn notify_progressive_done(&self, id: u64) {
        if let Some(source) = self.progressive.read().expect("progressive lock poisoned").as_ref()
        {
            source.completed(id);
        }
    }
}

/// Capability surface the peer cache consumes instead of the concrete type
pub trait HttpServerRuntime: Send + Sync {
    fn request_queue_length(&self) -> usize;
    fn active_connections(&self) -> usize;
    fn set_hooks(&self, hooks: ServerHooks);
    fn set_progressive_source(&self, source: Arc<dyn ProgressiveSource>);
    fn shutdown(&self);
}

/// The blocking-socket HTTP/1.1 server
pub struct TcpHttpServer {
    shared: Arc<ServerShared>,
    local_addr: SocketAddr,
    accept_handle: Mutex<Option<JoinHandle<()>>>,
    dedicated: Arc<AtomicUsize>,
}

impl TcpHttpServer {
    /// Bind `addr` and start the accept loop plus the worker pool.
    pub fn start(
        addr: &str,
        config: ServerConfig,
        router: Arc<Router>,
        auth: AuthMode,
    ) -> HttpResult<Arc<Self>> {
        let listener = TcpListener::bind(addr)
            .map_err(|e| HttpError::ServerError(format!("bind {} failed: {}", addr, e)))?;
        let local_addr = listener
            .local_addr()
            .map_err(|e| HttpError::ServerError(format!("local_addr failed: {}", e)))?;
        listener
            .set_nonblocking(true)
            .map_err(|e| HttpError::ServerError(format!("nonblocking failed: {}", e)))?;

        let shared = Arc::new(ServerShared {
            router,
            auth: AuthEngine::new(auth),
            compress: CompressRegistry::default(),
            metrics: ServerMetrics::default(),
            // HTTP-level bans expire after a few seconds
            ban: BanList::new(4),
            terminated: AtomicBool::new(false),
            handler: RwLock::new(None),
            hooks: RwLock::new(ServerHooks::default()),
            progressive: RwLock::new(None),
            conn_seq: AtomicU32::new(1),
            queued: AtomicUsize::new(0),
            config,
        });

        let dedicated = Arc::new(AtomicUsize::new(0));
        let pool = if shared.config.pool_size > 0 {
            let (tx, rx) = sync_channel(shared.config.queue_capacity);
            let rx = Arc::new(Mutex::new(rx));
            for i in 0..shared.config.pool_size as usize {
                let shared = shared.clone();
                let rx = rx.clone();
                let dedicated = dedicated.clone();
                std::thread::Builder::new()
                    .name(format!("http-pool-{}", i))
                    .spawn(move || pool_worker(shared, rx, dedicated))
                    .map_err(|e| HttpError::ServerError(format!("pool spawn failed: {}", e)))?;
            }
            Some(tx)
        } else {
            None
        };

        let server = Arc::new(Self {
            shared: shared.clone(),
            local_addr,
            accept_handle: Mutex::new(None),
            dedicated: dedicated.clone(),
        });

        let handle = std::thread::Builder::new()
            .name("http-accept".to_string())
            .spawn(move || accept_loop(shared, listener, pool))
            .map_err(|e| HttpError::ServerError(format!("accept spawn failed: {}", e)))?;
        *server.accept_handle.lock().expect("accept handle lock poisoned") = Some(handle);

        log::info!("http server listening on {}", local_addr);
        Ok(server)
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn metrics(&self) -> &ServerMetrics {
        &self.shared.metrics
    }

    /// Install the fallback handler running after the router.
    pub fn set_handler(&self, handler: RequestHandler) {
        *self.shared.handler.write().expect("handler lock poisoned") = Some(handler);
    }

    pub fn router(&self) -> &Arc<Router> {
        &self.shared.router
    }

    /// Ban an address at the HTTP level (teapot + close on its next accept).
    pub fn ban_ip(&self, ip: IpAddr) {
        self.shared.ban.ban(ip);
    }

    /// Block until all workers drained or `timeout` elapsed.
    pub fn wait_finished(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            if self.shared.metrics.active_connections.load(Ordering::Relaxed) == 0
                && self.shared.queued.load(Ordering::Relaxed) == 0
            {
                return true;
            }
            std::thread::sleep(Duration::from_millis(1));
        }
        false
    }
}

impl HttpServerRuntime for TcpHttpServer {
    fn request_queue_length(&self) -> usize {
        self.shared.queued.load(Ordering::Relaxed)
    }

    fn active_connections(&self) -> usize {
        // Dedicated workers keep their ActiveGuard, so the metric covers
        // both pool exchanges and promoted connections
        self.shared.metrics.active_connections.load(Ordering::Relaxed)
    }

    fn set_hooks(&self, hooks: ServerHooks) {
        *self.shared.hooks.write().expect("hooks lock poisoned") = hooks;
    }

    fn set_progressive_source(&self, source: Arc<dyn ProgressiveSource>) {
        *self.shared.progressive.write().expect("progressive lock poisoned") = Some(source);
    }

    fn shutdown(&self) {
        if self.shared.terminated.swap(true, Ordering::SeqCst) {
            return;
        }
        // Nudge kernels that keep accept parked despite the flag
        let _ = TcpStream::connect_timeout(&self.local_addr, Duration::from_millis(100));
        if let Some(handle) = self.accept_handle.lock().expect("accept handle lock poisoned").take()
        {
            let _ = handle.join();
        }
        log::info!("http server on {} stopped", self.local_addr);
    }
}

impl Drop for TcpHttpServer {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Decrements a counter when the connection's work is done
struct ActiveGuard(Arc<ServerShared>);

impl ActiveGuard {
    fn enter(shared: &Arc<ServerShared>) -> Self {
        shared.metrics.active_connections.fetch_add(1, Ordering::Relaxed);
        Self(shared.clone())
    }
}

impl Drop for ActiveGuard {
    fn drop(&mut self) {
        self.0.metrics.active_connections.fetch_sub(1, Ordering::Relaxed);
    }
}

fn accept_loop(
    shared: Arc<ServerShared>,
    listener: TcpListener,
    pool: Option<SyncSender<(TcpStream, SocketAddr)>>,
) {
    let mut last_rotate = Instant::now();
    loop {
        if shared.terminated.load(Ordering::Relaxed) {
            break;
        }
        match listener.accept() {
            Ok((mut stream, peer)) => {
                shared.metrics.accepted.fetch_add(1, Ordering::Relaxed);
                if shared.ban.is_banned(&peer.ip()) {
                    let _ = stream.write_all(TEAPOT_BODY);
                    continue;
                }
                let _ = stream.set_nodelay(true);
                match (&pool, shared.config.pool_size) {
                    (Some(tx), _) => {
                        shared.queued.fetch_add(1, Ordering::Relaxed);
                        match tx.try_send((stream, peer)) {
                            Ok(()) => {}
                            Err(TrySendError::Full(_)) | Err(TrySendError::Disconnected(_)) => {
                                // Backpressure: drop the socket on the floor
                                shared.queued.fetch_sub(1, Ordering::Relaxed);
                                log::debug!("pool queue full, dropping {}", peer);
                            }
                        }
                    }
                    (None, 0) => {
                        let shared = shared.clone();
                        let spawned = std::thread::Builder::new()
                            .name("http-conn".to_string())
                            .spawn(move || {
                                let _guard = ActiveGuard::enter(&shared);
                                if let Some(open) = serve_first(&shared, stream, peer) {
                                    serve_rest(&shared, open);
                                }
                            });
                        if let Err(e) = spawned {
                            log::warn!("connection thread spawn failed: {}", e);
                        }
                    }
                    (None, _) => {
                        // Single-thread mode: serve on the accept thread
                        let _guard = ActiveGuard::enter(&shared);
                        if let Some(open) = serve_first(&shared, stream, peer) {
                            serve_rest(&shared, open);
                        }
                    }
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                std::thread::sleep(Duration::from_millis(50));
            }
            Err(e) => {
                if shared.terminated.load(Ordering::Relaxed) {
                    break;
                }
                log::warn!("accept failed: {}", e);
                std::thread::sleep(Duration::from_millis(10));
            }
        }
        if last_rotate.elapsed() >= Duration::from_secs(1) {
            shared.ban.rotate();
            if let Some(idle) = shared.hook_on_idle() {
                idle();
            }
            last_rotate = Instant::now();
        }
    }
    drop(pool);
}

fn pool_worker(
    shared: Arc<ServerShared>,
    rx: Arc<Mutex<Receiver<(TcpStream, SocketAddr)>>>,
    dedicated: Arc<AtomicUsize>,
) {
    loop {
        let item = {
            let rx = rx.lock().expect("pool receiver lock poisoned");
            rx.recv_timeout(Duration::from_millis(500))
        };
        match item {
            Ok((stream, peer)) => {
                shared.queued.fetch_sub(1, Ordering::Relaxed);
                let guard = ActiveGuard::enter(&shared);
                if let Some(open) = serve_first(&shared, stream, peer) {
                    // Keep-alive survived the first exchange: promote to a
                    // dedicated worker so this thread returns to the pool
                    if dedicated.fetch_add(1, Ordering::Relaxed)
                        < shared.config.max_dedicated_workers
                    {
                        let thread_shared = shared.clone();
                        let thread_dedicated = dedicated.clone();
                        let spawned = std::thread::Builder::new()
                            .name("http-keepalive".to_string())
                            .spawn(move || {
                                serve_rest(&thread_shared, open);
                                thread_dedicated.fetch_sub(1, Ordering::Relaxed);
                                drop(guard);
                            });
                        if spawned.is_err() {
                            dedicated.fetch_sub(1, Ordering::Relaxed);
                        }
                    } else {
                        // Dedicated set exhausted; close instead of pinning
                        // a pool thread on one client
                        dedicated.fetch_sub(1, Ordering::Relaxed);
                    }
                }
            }
            Err(std::sync::mpsc::RecvTimeoutError::Timeout) => {
                if shared.terminated.load(Ordering::Relaxed) {
                    break;
                }
            }
            Err(std::sync::mpsc::RecvTimeoutError::Disconnected) => break,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::HttpMethod;
    use std::io::{BufRead, BufReader, Read, Write};

    fn start_test_server(config: ServerConfig) -> Arc<TcpHttpServer> {
        let router = Arc::new(Router::new());
        router
            .run(
                &[HttpMethod::GET],
                "/hello",
                Arc::new(|ctx: &mut RequestContext| ctx.respond(200, "text/plain", "hi")),
                None,
            )
            .unwrap();
        TcpHttpServer::start("127.0.0.1:0", config, router, AuthMode::None).unwrap()
    }

    fn read_response(stream: &mut TcpStream) -> (u16, String, Vec<u8>) {
        let mut reader = BufReader::new(stream.try_clone().unwrap());
        let mut status_line = String::new();
        reader.read_line(&mut status_line).unwrap();
        let status: u16 = status_line.split(' ').nth(1).unwrap().parse().unwrap();
        let mut headers = String::new();
        let mut content_length = 0usize;
        loop {
            let mut line = String::new();
            reader.read_line(&mut line).unwrap();
            if line.trim().is_empty() {
                break;
            }
            if let Some(v) = line.to_ascii_lowercase().strip_prefix("content-length:") {
                content_length = v.trim().parse().unwrap();
            }
            headers.push_str(&line);
        }
        let mut body = vec![0u8; content_length];
        reader.read_exact(&mut body).unwrap();
        (status, headers, body)
    }

    #[test]
    fn serves_routed_callback() {
        let server = start_test_server(ServerConfig::default());
        let mut stream = TcpStream::connect(server.local_addr()).unwrap();
        stream.write_all(b"GET /hello HTTP/1.1\r\nHost: t\r\n\r\n").unwrap();
        let (status, _, body) = read_response(&mut stream);
        assert_eq!(status, 200);
        assert_eq!(body, b"hi");
        server.shutdown();
    }

    #[test]
    fn unmatched_route_is_404() {
        let server = start_test_server(ServerConfig::default());
        let mut stream = TcpStream::connect(server.local_addr()).unwrap();
        stream.write_all(b"GET /nope HTTP/1.1\r\nHost: t\r\n\r\n").unwrap();
        let (status, _, _) = read_response(&mut stream);
        assert_eq!(status, 404);
        server.shutdown();
    }

    #[test]
    fn keep_alive_serves_two_requests_on_one_connection() {
        let server = start_test_server(ServerConfig::default());
        let mut stream = TcpStream::connect(server.local_addr()).unwrap();
        for _ in 0..2 {
            stream.write_all(b"GET /hello HTTP/1.1\r\nHost: t\r\n\r\n").unwrap();
            let (status, _, body) = read_response(&mut stream);
            assert_eq!(status, 200);
            assert_eq!(body, b"hi");
        }
        server.shutdown();
    }

    #[test]
    fn banned_ip_gets_teapot() {
        let server = start_test_server(ServerConfig::default());
        server.ban_ip(IpAddr::V4(std::net::Ipv4Addr::LOCALHOST));
        let mut stream = TcpStream::connect(server.local_addr()).unwrap();
        let mut buf = Vec::new();
        stream.read_to_end(&mut buf).unwrap();
        let text = String::from_utf8_lossy(&buf);
        assert!(text.contains("418"), "got: {}", text);
        server.shutdown();
    }

    #[test]
    fn single_thread_mode_works() {
        let server = start_test_server(ServerConfig { pool_size: -1, ..ServerConfig::default() });
        let mut stream = TcpStream::connect(server.local_addr()).unwrap();
        stream
            .write_all(b"GET /hello HTTP/1.1\r\nConnection: close\r\nHost: t\r\n\r\n")
            .unwrap();
        let (status, _, body) = read_response(&mut stream);
        assert_eq!(status, 200);
        assert_eq!(body, b"hi");
        server.shutdown();
    }

    #[test]
    fn shutdown_unblocks_accept() {
        let server = start_test_server(ServerConfig::default());
        let addr = server.local_addr();
        server.shutdown();
        // After shutdown, new connections are refused or dropped
        std::thread::sleep(Duration::from_millis(50));
        let result = TcpStream::connect_timeout(&addr, Duration::from_millis(200));
        if let Ok(mut s) = result {
            let mut buf = [0u8; 1];
            let _ = s.set_read_timeout(Some(Duration::from_millis(200)));
            assert!(matches!(s.read(&mut buf), Ok(0) | Err(_)));
        }
    }
}
