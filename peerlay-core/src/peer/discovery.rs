//! UDP discovery server
//!
//! A single datagram socket carries the whole peer exchange: encrypted
//! 192-byte frames, `Ping`/`Request` out, `Pong`/`Response*` back. On
//! POSIX the socket binds the interface's broadcast address so inbound
//! broadcasts are received; on Windows it binds the interface address.
//! Loopback interfaces (single-host and test setups) fall back to unicast
//! addressing on both sides.
//!
//! Broadcast rounds are strictly serialized by a non-reentrant lock: one
//! sequence slot, one waiter, responses with stale sequences are logged as
//! late and dropped.

use std::net::{IpAddr, SocketAddr, SocketAddrV4, UdpSocket};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, RwLock, Weak};
use std::thread::JoinHandle;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use uuid::Uuid;

use crate::config::PeerCacheSettings;
use crate::http::BanList;

use super::crypt::PeerCrypt;
use super::message::{current_os, unix_time_minimal};
use super::net::NetInterface;
use super::{CacheMessage, MessageKind};

/// What the cache coordinator answers for one inbound `Request`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsultResult {
    /// Nothing local for this hash
    None,
    /// Active connections exceed the serving limit
    Overloaded,
    /// An in-flight download holds this many bytes so far
    Partial(u64),
    /// The file is fully cached at this size
    Full(u64),
}

/// Seam between the UDP server and the cache coordinator
pub trait RequestConsult: Send + Sync {
    fn consult(&self, msg: &CacheMessage) -> ConsultResult;
    /// Active peer-HTTP connections, echoed in responses for peer ranking
    fn active_connections(&self) -> u16 {
        0
    }
    /// TCP port of the answering peer's HTTP server, carried in the
    /// response's opaque field so requesters need no port convention
    fn http_port(&self) -> u16 {
        0
    }
}

struct BroadcastRound {
    seq: u32,
    responses: Vec<CacheMessage>,
    done: bool,
}

pub struct UdpPeerServer {
    socket: UdpSocket,
    crypt: Arc<PeerCrypt>,
    iface: NetInterface,
    local_port: u16,
    uuid: Uuid,
    max_responses: usize,
    first_response: bool,
    broadcast_timeout: Duration,
    not_alone_opt: bool,
    no_ban: bool,
    ban: BanList,
    consult: RwLock<Option<Weak<dyn RequestConsult>>>,
    round: Mutex<BroadcastRound>,
    round_cv: Condvar,
    broadcast_lock: Mutex<()>,
    target_override: RwLock<Option<SocketAddr>>,
    /// Second-granularity tick until which broadcasts stay suppressed
    not_alone_until: AtomicU64,
    terminated: AtomicBool,
    recv_handle: Mutex<Option<JoinHandle<()>>>,
    unicast_replies: bool,
}

fn tick_seconds() -> u64 {
    SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_secs()
}

impl UdpPeerServer {
    pub fn new(
        crypt: Arc<PeerCrypt>,
        iface: NetInterface,
        uuid: Uuid,
        settings: &PeerCacheSettings,
    ) -> std::io::Result<Arc<Self>> {
        let unicast = cfg!(windows) || iface.is_loopback();
        let bind_ip = if unicast { iface.ip } else { iface.broadcast() };
        let socket = UdpSocket::bind(SocketAddrV4::new(bind_ip, settings.port))?;
        socket.set_broadcast(true)?;
        socket.set_read_timeout(Some(Duration::from_secs(1)))?;
        let local_port = socket.local_addr()?.port();

        // Rotated from the coordinator's ~65 s idle hook
        let ban_ticks = ((u64::from(settings.ban_minutes) * 60) / 65).max(1) as usize;

        Ok(Arc::new(Self {
            socket,
            crypt,
            iface,
            local_port,
            uuid,
            max_responses: settings.broadcast_max_responses.max(1) as usize,
            first_response: settings.options.first_response,
            broadcast_timeout: settings.broadcast_timeout(),
            not_alone_opt: settings.options.broadcast_not_alone,
            no_ban: settings.options.no_ban_ip,
            ban: BanList::new(ban_ticks),
            consult: RwLock::new(None),
            round: Mutex::new(BroadcastRound { seq: 0, responses: Vec::new(), done: false }),
            round_cv: Condvar::new(),
            broadcast_lock: Mutex::new(()),
            target_override: RwLock::new(None),
            not_alone_until: AtomicU64::new(0),
            terminated: AtomicBool::new(false),
            recv_handle: Mutex::new(None),
            unicast_replies: unicast,
        }))
    }

    /// Spawn the receive thread. Call once after wiring the consult seam.
    pub fn start(self: &Arc<Self>) -> std::io::Result<()> {
        let weak = Arc::downgrade(self);
        let handle = std::thread::Builder::new()
            .name("udp-peer".to_string())
            .spawn(move || {
                let mut buf = vec![0u8; 64 * 1024];
                loop {
                    let Some(this) = weak.upgrade() else { break };
                    if this.terminated.load(Ordering::Relaxed) {
                        break;
                    }
                    match this.socket.recv_from(&mut buf) {
                        Ok((n, src)) => this.handle_datagram(&buf[..n], src),
                        Err(e)
                            if e.kind() == std::io::ErrorKind::WouldBlock
                                || e.kind() == std::io::ErrorKind::TimedOut => {}
                        Err(e) => {
                            if this.terminated.load(Ordering::Relaxed) {
                                break;
                            }
                            log::warn!("udp receive failed: {}", e);
                        }
                    }
                }
            })?;
        *self.recv_handle.lock().expect("recv handle lock poisoned") = Some(handle);
        log::info!(
            "udp peer server on {}:{} ({} replies)",
            self.iface.ip,
            self.local_port,
            if self.unicast_replies { "unicast" } else { "broadcast" }
        );
        Ok(())
    }

    pub fn local_port(&self) -> u16 {
        self.local_port
    }

    pub fn interface(&self) -> &NetInterface {
        &self.iface
    }

    pub fn set_consult(&self, consult: Weak<dyn RequestConsult>) {
        *self.consult.write().expect("consult lock poisoned") = Some(consult);
    }

    /// Redirect outbound requests to a fixed address instead of the subnet
    /// broadcast. Used on loopback setups and in tests.
    pub fn set_target_override(&self, target: SocketAddr) {
        *self.target_override.write().expect("target lock poisoned") = Some(target);
    }

    /// Rotate the UDP-level ban buckets (driven by the idle hook).
    pub fn rotate_ban(&self) {
        self.ban.rotate();
    }

    pub fn banned_count(&self) -> usize {
        self.ban.len()
    }

    /// A message with this node's identity filled in
    pub fn new_message(&self, kind: MessageKind) -> CacheMessage {
        let connections = self
            .consult
            .read()
            .expect("consult lock poisoned")
            .as_ref()
            .and_then(Weak::upgrade)
            .map_or(0, |c| c.active_connections());
        CacheMessage {
            kind,
            seq: 0,
            uuid: self.uuid,
            os: current_os(),
            sender_ip: self.iface.ip,
            mask: self.iface.mask,
            broadcast: self.iface.broadcast(),
            speed_mbits: self.iface.speed_mbits,
            hardware: self.iface.kind,
            timestamp: unix_time_minimal(),
            connections,
            ..CacheMessage::default()
        }
    }

    fn target(&self) -> SocketAddr {
        self.target_override
            .read()
            .expect("target lock poisoned")
            .unwrap_or_else(|| SocketAddr::V4(SocketAddrV4::new(self.iface.broadcast(), self.local_port)))
    }

    /// Send one request frame and collect responses for the round.
    ///
    /// At most one broadcast is outstanding; concurrent callers serialize
    /// on the (non-reentrant) broadcast lock. Returns the responses whose
    /// sequence matched the round's slot.
    pub fn broadcast(&self, msg: &mut CacheMessage) -> Vec<CacheMessage> {
        let _serial = self.broadcast_lock.lock().expect("broadcast lock poisoned");

        let now = tick_seconds();
        if self.not_alone_opt && now < self.not_alone_until.load(Ordering::Relaxed) {
            log::debug!("broadcast suppressed: subnet looked empty a moment ago");
            return Vec::new();
        }

        let seq = self.crypt.next_sequence();
        msg.seq = seq;
        {
            let mut round = self.round.lock().expect("round lock poisoned");
            *round = BroadcastRound { seq, responses: Vec::new(), done: false };
        }

        let frame = self.crypt.encode_frame(msg);
        if let Err(e) = self.socket.send_to(&frame, self.target()) {
            log::warn!("broadcast send failed: {}", e);
            return Vec::new();
        }

        let started = Instant::now();
        let mut round = self.round.lock().expect("round lock poisoned");
        while !round.done {
            let Some(remaining) = self.broadcast_timeout.checked_sub(started.elapsed()) else {
                break;
            };
            let (guard, result) = self
                .round_cv
                .wait_timeout(round, remaining)
                .expect("round lock poisoned");
            round = guard;
            if result.timed_out() {
                break;
            }
        }
        let responses = std::mem::take(&mut round.responses);
        round.seq = 0;
        drop(round);

        if responses.is_empty() && self.not_alone_opt {
            self.not_alone_until.store(now + 1, Ordering::Relaxed);
        }
        responses
    }

    /// Wind down the receive thread.
    pub fn shutdown(&self) {
        if self.terminated.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(handle) = self.recv_handle.lock().expect("recv handle lock poisoned").take() {
            let _ = handle.join();
        }
    }

    fn handle_datagram(&self, data: &[u8], src: SocketAddr) {
        let SocketAddr::V4(src4) = src else { return };
        let src_ip = *src4.ip();
        // Our own broadcast loops back with our address and port
        if src_ip == self.iface.ip && src4.port() == self.local_port {
            return;
        }
        if !self.no_ban && self.ban.is_banned(&IpAddr::V4(src_ip)) {
            return;
        }

        let msg = match self.crypt.decode_frame(data) {
            Ok(msg) => msg,
            Err(e) => {
                log::debug!("dropping frame from {}: {}", src, e);
                if !self.no_ban {
                    self.ban.ban(IpAddr::V4(src_ip));
                }
                return;
            }
        };

        match msg.kind {
            MessageKind::Ping => {
                let mut pong = self.new_message(MessageKind::Pong);
                pong.seq = msg.seq;
                pong.dest_ip = msg.sender_ip;
                self.reply(&pong, src4);
            }
            MessageKind::Request => {
                let consult = self
                    .consult
                    .read()
                    .expect("consult lock poisoned")
                    .as_ref()
                    .and_then(Weak::upgrade);
                let verdict = match &consult {
                    Some(c) => c.consult(&msg),
                    None => ConsultResult::None,
                };
                let (kind, size) = match verdict {
                    ConsultResult::None => (MessageKind::ResponseNone, 0),
                    ConsultResult::Overloaded => (MessageKind::ResponseOverloaded, 0),
                    ConsultResult::Partial(size) => (MessageKind::ResponsePartial, size),
                    ConsultResult::Full(size) => (MessageKind::ResponseFull, size),
                };
                let mut resp = self.new_message(kind);
                resp.seq = msg.seq;
                resp.dest_ip = msg.sender_ip;
                resp.hash = msg.hash;
                resp.size = size;
                resp.range_start = msg.range_start;
                resp.range_end = msg.range_end;
                resp.opaque = u64::from(consult.map_or(0, |c| c.http_port()));
                self.reply(&resp, src4);
            }
            kind if kind.is_response() => {
                if msg.dest_ip != self.iface.ip {
                    // Catches unexpected NAT or promiscuous listeners
                    log::debug!(
                        "response from {} addressed to {}, not us ({})",
                        src,
                        msg.dest_ip,
                        self.iface.ip
                    );
                    return;
                }
                let mut round = self.round.lock().expect("round lock poisoned");
                if round.seq != 0 && round.seq == msg.seq && !round.done {
                    round.responses.push(msg);
                    if self.first_response || round.responses.len() >= self.max_responses {
                        round.done = true;
                    }
                    self.round_cv.notify_all();
                } else {
                    log::debug!("late response from {} (seq {})", src, msg.seq);
                }
            }
            _ => {
                // Bearer kinds never travel as datagrams
                log::debug!("unexpected {:?} datagram from {}", msg.kind, src);
            }
        }
    }

    fn reply(&self, msg: &CacheMessage, src: SocketAddrV4) {
        let frame = self.crypt.encode_frame(msg);
        let dest: SocketAddr = if self.unicast_replies {
            SocketAddr::V4(src)
        } else {
            // The requester listens on the broadcast address
            SocketAddr::V4(SocketAddrV4::new(self.iface.broadcast(), self.local_port))
        };
        if let Err(e) = self.socket.send_to(&frame, dest) {
            log::debug!("reply to {} failed: {}", dest, e);
        }
    }
}

impl Drop for UdpPeerServer {
    fn drop(&mut self) {
        self.terminated.store(true, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::peer::ContentHash;

    struct FixedConsult(ConsultResult);

    impl RequestConsult for FixedConsult {
        fn consult(&self, _msg: &CacheMessage) -> ConsultResult {
            self.0
        }
        fn active_connections(&self) -> u16 {
            2
        }
    }

    fn test_settings() -> PeerCacheSettings {
        let mut settings = PeerCacheSettings::default();
        settings.port = 0; // ephemeral
        settings.broadcast_timeout_ms = 500;
        settings
    }

    fn pair(
        secret: &[u8],
        consult: Arc<dyn RequestConsult>,
    ) -> (Arc<UdpPeerServer>, Arc<UdpPeerServer>) {
        let settings = test_settings();
        let a = UdpPeerServer::new(
            Arc::new(PeerCrypt::new(secret)),
            NetInterface::loopback(),
            Uuid::new_v4(),
            &settings,
        )
        .unwrap();
        let b = UdpPeerServer::new(
            Arc::new(PeerCrypt::new(secret)),
            NetInterface::loopback(),
            Uuid::new_v4(),
            &settings,
        )
        .unwrap();
        b.set_consult(Arc::downgrade(&consult));
        a.set_target_override(SocketAddr::V4(SocketAddrV4::new(
            std::net::Ipv4Addr::LOCALHOST,
            b.local_port(),
        )));
        a.start().unwrap();
        b.start().unwrap();
        (a, b)
    }

    #[test]
    fn ping_pong_round_trip() {
        let consult: Arc<dyn RequestConsult> = Arc::new(FixedConsult(ConsultResult::None));
        let (a, b) = pair(b"ping secret", consult);
        let mut ping = a.new_message(MessageKind::Ping);
        let responses = a.broadcast(&mut ping);
        assert_eq!(responses.len(), 1);
        assert_eq!(responses[0].kind, MessageKind::Pong);
        assert_eq!(responses[0].seq, ping.seq);
        a.shutdown();
        b.shutdown();
    }

    #[test]
    fn request_gets_consulted_response() {
        let consult: Arc<dyn RequestConsult> =
            Arc::new(FixedConsult(ConsultResult::Full(1_048_576)));
        let (a, b) = pair(b"req secret", consult);
        let mut req = a.new_message(MessageKind::Request);
        req.hash = ContentHash::sha256(b"wanted");
        let responses = a.broadcast(&mut req);
        assert_eq!(responses.len(), 1);
        assert_eq!(responses[0].kind, MessageKind::ResponseFull);
        assert_eq!(responses[0].size, 1_048_576);
        assert_eq!(responses[0].hash, req.hash);
        assert_eq!(responses[0].connections, 2);
        a.shutdown();
        b.shutdown();
    }

    #[test]
    fn overloaded_and_none_verdicts() {
        for (verdict, kind) in [
            (ConsultResult::Overloaded, MessageKind::ResponseOverloaded),
            (ConsultResult::None, MessageKind::ResponseNone),
            (ConsultResult::Partial(600), MessageKind::ResponsePartial),
        ] {
            let consult: Arc<dyn RequestConsult> = Arc::new(FixedConsult(verdict));
            let (a, b) = pair(b"verdict secret", consult);
            let mut req = a.new_message(MessageKind::Request);
            let responses = a.broadcast(&mut req);
            assert_eq!(responses.len(), 1);
            assert_eq!(responses[0].kind, kind);
            a.shutdown();
            b.shutdown();
        }
    }

    #[test]
    fn malformed_frames_ban_the_sender() {
        let consult: Arc<dyn RequestConsult> = Arc::new(FixedConsult(ConsultResult::None));
        let (a, b) = pair(b"ban secret", consult);

        // Hand-rolled garbage with a plausible frame length
        let rogue = UdpSocket::bind("127.0.0.1:0").unwrap();
        let dest = SocketAddrV4::new(std::net::Ipv4Addr::LOCALHOST, b.local_port());
        for _ in 0..5 {
            rogue.send_to(&[0u8; super::super::crypt::FRAME_LEN], dest).unwrap();
        }
        // Give the receive thread a moment
        std::thread::sleep(Duration::from_millis(200));
        assert!(b.banned_count() > 0, "garbage sender should be banned");

        // A well-formed request from the banned address is now ignored
        let mut req = a.new_message(MessageKind::Request);
        let responses = a.broadcast(&mut req);
        assert!(responses.is_empty(), "banned IP must be ignored");
        a.shutdown();
        b.shutdown();
    }

    #[test]
    fn not_alone_suppresses_next_broadcast() {
        let settings = {
            let mut s = test_settings();
            s.broadcast_timeout_ms = 50;
            s.options.broadcast_not_alone = true;
            s
        };
        let a = UdpPeerServer::new(
            Arc::new(PeerCrypt::new(b"alone secret")),
            NetInterface::loopback(),
            Uuid::new_v4(),
            &settings,
        )
        .unwrap();
        // Point at a dead port so nothing answers
        a.set_target_override("127.0.0.1:9".parse().unwrap());
        a.start().unwrap();
        let mut msg = a.new_message(MessageKind::Request);
        assert!(a.broadcast(&mut msg).is_empty());
        // Second broadcast inside the same second window is suppressed and
        // does not wait the full timeout
        let started = Instant::now();
        let mut msg2 = a.new_message(MessageKind::Request);
        assert!(a.broadcast(&mut msg2).is_empty());
        assert!(started.elapsed() < Duration::from_millis(40));
        a.shutdown();
    }
}
