//! Two-node peer cache scenarios on the loopback interface
//!
//! Loopback peers cannot share a broadcast address, so the requester's UDP
//! target is pinned to the responder's concrete port; everything else runs
//! the real code paths: encrypted discovery, bearer-authenticated HTTP
//! transfers, progressive streaming from a partial file.

use std::fs;
use std::io::{Cursor, Read, Write};
use std::net::{SocketAddr, SocketAddrV4, TcpStream};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use peerlay_core::config::{CacheOptions, PeerCacheSettings};
use peerlay_core::peer::{ContentHash, ContentRequest, HttpPeerCache, NetInterface};

const SECRET: &[u8] = b"integration subnet secret";

fn node_settings(dir: &Path, server: bool) -> PeerCacheSettings {
    PeerCacheSettings {
        port: 0,
        broadcast_timeout_ms: 500,
        cache_temp_path: dir.join("temp"),
        cache_perm_path: dir.join("perm"),
        cache_temp_min_bytes: 0,
        options: CacheOptions {
            no_server: !server,
            try_last_peer: false,
            ..CacheOptions::default()
        },
        ..PeerCacheSettings::default()
    }
}

/// Requester `a` pointed at responder `b`
fn linked_pair(
    dir_a: &Path,
    dir_b: &Path,
) -> (Arc<HttpPeerCache>, Arc<HttpPeerCache>) {
    let a = HttpPeerCache::start_with_interface(
        node_settings(dir_a, false),
        SECRET,
        NetInterface::loopback(),
    )
    .unwrap();
    let b = HttpPeerCache::start_with_interface(
        node_settings(dir_b, true),
        SECRET,
        NetInterface::loopback(),
    )
    .unwrap();
    a.udp().set_target_override(SocketAddr::V4(SocketAddrV4::new(
        std::net::Ipv4Addr::LOCALHOST,
        b.udp().local_port(),
    )));
    (a, b)
}

fn seed_file(node: &HttpPeerCache, dir: &Path, data: &[u8]) -> ContentHash {
    let hash = ContentHash::sha256(data);
    let partial = dir.join("seed.part");
    fs::write(&partial, data).unwrap();
    node.on_downloaded(&partial, &hash, false, 0).unwrap().unwrap();
    hash
}

#[test]
fn broadcast_hit_downloads_from_the_peer() {
    let dir_a = tempfile::tempdir().unwrap();
    let dir_b = tempfile::tempdir().unwrap();
    let (a, b) = linked_pair(dir_a.path(), dir_b.path());

    let data: Vec<u8> = (0..1_048_576u32).map(|i| (i % 249) as u8).collect();
    let hash = seed_file(&b, dir_b.path(), &data);

    let req = ContentRequest {
        url: "http://origin/big.bin".into(),
        hash,
        size: data.len() as u64,
        range: None,
        permanent: false,
    };
    let mut out = Cursor::new(Vec::new());
    let status = a.on_download(&req, &mut out).unwrap();
    assert_eq!(status, 200);
    let body = out.into_inner();
    assert_eq!(body.len(), data.len());
    assert_eq!(ContentHash::sha256(&body), hash, "content hash must verify");

    a.shutdown();
    b.shutdown();
}

#[test]
fn ranged_peer_download() {
    let dir_a = tempfile::tempdir().unwrap();
    let dir_b = tempfile::tempdir().unwrap();
    let (a, b) = linked_pair(dir_a.path(), dir_b.path());

    let data: Vec<u8> = (0..100_000u32).map(|i| (i % 241) as u8).collect();
    let hash = seed_file(&b, dir_b.path(), &data);

    let req = ContentRequest {
        url: "http://origin/slice.bin".into(),
        hash,
        size: data.len() as u64,
        range: Some((1000, 1999)),
        permanent: false,
    };
    let mut out = Cursor::new(Vec::new());
    let status = a.on_download(&req, &mut out).unwrap();
    assert_eq!(status, 206);
    assert_eq!(out.into_inner(), data[1000..2000].to_vec());

    a.shutdown();
    b.shutdown();
}

#[test]
fn no_peer_response_falls_back_to_origin() {
    let dir_a = tempfile::tempdir().unwrap();
    let dir_b = tempfile::tempdir().unwrap();
    let (a, b) = linked_pair(dir_a.path(), dir_b.path());

    let req = ContentRequest {
        url: "http://origin/absent.bin".into(),
        hash: ContentHash::sha256(b"nobody has this"),
        size: 4096,
        range: None,
        permanent: false,
    };
    let mut out = Cursor::new(Vec::new());
    // B answers ResponseNone, which is not a download candidate
    assert_eq!(a.on_download(&req, &mut out).unwrap(), 0);
    assert!(out.into_inner().is_empty());

    a.shutdown();
    b.shutdown();
}

#[test]
fn local_hit_short_circuits_the_broadcast() {
    let dir_a = tempfile::tempdir().unwrap();
    let dir_b = tempfile::tempdir().unwrap();
    let (a, b) = linked_pair(dir_a.path(), dir_b.path());

    let data = b"locally cached content".repeat(512);
    let hash = seed_file(&a, dir_a.path(), &data);
    // With the responder gone, only a local hit can succeed
    b.shutdown();

    let req = ContentRequest {
        url: "http://origin/local.bin".into(),
        hash,
        size: data.len() as u64,
        range: None,
        permanent: false,
    };
    let mut out = Cursor::new(Vec::new());
    assert_eq!(a.on_download(&req, &mut out).unwrap(), 200);
    assert_eq!(out.into_inner(), data);
    a.shutdown();
}

#[test]
fn progressive_streaming_completes_as_the_partial_grows() {
    let dir_a = tempfile::tempdir().unwrap();
    let dir_b = tempfile::tempdir().unwrap();
    let (a, b) = linked_pair(dir_a.path(), dir_b.path());

    let data: Vec<u8> = (0..1_048_576u32).map(|i| (i % 239) as u8).collect();
    let hash = ContentHash::sha256(&data);
    let expected = data.len() as u64;

    // B is mid-download: 600 KiB of the partial exist
    let partial_path = dir_b.path().join("inflight.part");
    fs::write(&partial_path, &data[..614_400]).unwrap();
    let partial_id = b.partials().add(&partial_path, expected, hash);

    // B keeps downloading in the background
    let writer_path = partial_path.clone();
    let writer_data = data.clone();
    let writer = std::thread::spawn(move || {
        let mut file = fs::OpenOptions::new().append(true).open(&writer_path).unwrap();
        let mut written = 614_400usize;
        while written < writer_data.len() {
            std::thread::sleep(Duration::from_millis(10));
            let next = (written + 131_072).min(writer_data.len());
            file.write_all(&writer_data[written..next]).unwrap();
            file.flush().unwrap();
            written = next;
        }
    });

    let req = ContentRequest {
        url: "http://origin/growing.bin".into(),
        hash,
        size: expected,
        range: None,
        permanent: false,
    };
    let mut out = Cursor::new(Vec::new());
    let status = a.on_download(&req, &mut out).unwrap();
    writer.join().unwrap();

    assert_eq!(status, 200);
    let body = out.into_inner();
    assert_eq!(body.len(), data.len());
    assert_eq!(ContentHash::sha256(&body), hash);

    b.partials().remove(partial_id);
    a.shutdown();
    b.shutdown();
}

#[test]
fn partial_registry_is_visible_to_peers() {
    let dir_a = tempfile::tempdir().unwrap();
    let dir_b = tempfile::tempdir().unwrap();
    let (a, b) = linked_pair(dir_a.path(), dir_b.path());

    let hash = ContentHash::sha256(b"big planned download");
    let partial_path = dir_b.path().join("announced.part");
    fs::write(&partial_path, vec![1u8; 614_400]).unwrap();
    b.partials().add(&partial_path, 1_048_576, hash);

    use peerlay_core::peer::MessageKind;
    let mut msg = a.udp().new_message(MessageKind::Request);
    msg.hash = hash;
    let responses = a.udp().broadcast(&mut msg);
    assert_eq!(responses.len(), 1);
    assert_eq!(responses[0].kind, MessageKind::ResponsePartial);
    assert_eq!(responses[0].size, 614_400);
    assert!(responses[0].size <= 1_048_576);

    a.shutdown();
    b.shutdown();
}

#[test]
fn peer_requests_need_a_valid_bearer() {
    let dir_a = tempfile::tempdir().unwrap();
    let dir_b = tempfile::tempdir().unwrap();
    let (a, b) = linked_pair(dir_a.path(), dir_b.path());
    let data = b"guarded content".repeat(64);
    let hash = seed_file(&b, dir_b.path(), &data);

    let addr = b.http().unwrap().local_addr();
    let path = format!("/peerlay/{}", hash.to_hex());

    // No bearer at all
    let mut stream = TcpStream::connect(addr).unwrap();
    stream
        .write_all(format!("GET {} HTTP/1.1\r\nHost: t\r\nConnection: close\r\n\r\n", path).as_bytes())
        .unwrap();
    let mut raw = String::new();
    stream.read_to_string(&mut raw).unwrap();
    assert!(raw.starts_with("HTTP/1.1 401"), "got {}", raw);

    // A syntactically valid bearer sealed with the wrong secret
    let rogue = peerlay_core::peer::PeerCrypt::new(b"wrong secret");
    let mut msg = a.udp().new_message(peerlay_core::peer::MessageKind::RequestBearer);
    msg.hash = hash;
    let bad_bearer = rogue.encode_bearer(&msg);
    let mut stream = TcpStream::connect(addr).unwrap();
    stream
        .write_all(
            format!(
                "GET {} HTTP/1.1\r\nHost: t\r\nAuthorization: Bearer {}\r\nConnection: close\r\n\r\n",
                path, bad_bearer
            )
            .as_bytes(),
        )
        .unwrap();
    let mut raw = String::new();
    stream.read_to_string(&mut raw).unwrap();
    assert!(raw.starts_with("HTTP/1.1 403"), "got {}", raw);

    a.shutdown();
    b.shutdown();
}

#[test]
fn last_peer_shortcut_skips_the_broadcast() {
    let dir_a = tempfile::tempdir().unwrap();
    let dir_b = tempfile::tempdir().unwrap();
    let a = HttpPeerCache::start_with_interface(
        {
            let mut s = node_settings(dir_a.path(), false);
            s.options.try_last_peer = true;
            s
        },
        SECRET,
        NetInterface::loopback(),
    )
    .unwrap();
    let b = HttpPeerCache::start_with_interface(
        node_settings(dir_b.path(), true),
        SECRET,
        NetInterface::loopback(),
    )
    .unwrap();
    a.udp().set_target_override(SocketAddr::V4(SocketAddrV4::new(
        std::net::Ipv4Addr::LOCALHOST,
        b.udp().local_port(),
    )));

    let first = b"first download".repeat(400);
    let first_hash = seed_file(&b, dir_b.path(), &first);
    let req = ContentRequest {
        url: "http://origin/1.bin".into(),
        hash: first_hash,
        size: first.len() as u64,
        range: None,
        permanent: false,
    };
    let mut out = Cursor::new(Vec::new());
    assert_eq!(a.on_download(&req, &mut out).unwrap(), 200);

    // Second file: the shortcut GET should find B directly even with the
    // broadcast target pointed at a dead port
    let second = b"second download".repeat(400);
    let second_hash = {
        let partial = dir_b.path().join("second.part");
        fs::write(&partial, &second).unwrap();
        let hash = ContentHash::sha256(&second);
        b.on_downloaded(&partial, &hash, false, 0).unwrap().unwrap();
        hash
    };
    a.udp().set_target_override("127.0.0.1:9".parse().unwrap());
    let req = ContentRequest {
        url: "http://origin/2.bin".into(),
        hash: second_hash,
        size: second.len() as u64,
        range: None,
        permanent: false,
    };
    let mut out = Cursor::new(Vec::new());
    assert_eq!(a.on_download(&req, &mut out).unwrap(), 200);
    assert_eq!(out.into_inner(), second);

    a.shutdown();
    b.shutdown();
}

#[test]
fn peer_miss_returns_204_to_the_requester() {
    let dir_a = tempfile::tempdir().unwrap();
    let dir_b = tempfile::tempdir().unwrap();
    let (a, b) = linked_pair(dir_a.path(), dir_b.path());

    // Craft a bearer for a hash B does not hold and GET it directly
    let hash = ContentHash::sha256(b"vanished between broadcast and fetch");
    let mut msg = a.udp().new_message(peerlay_core::peer::MessageKind::RequestBearer);
    msg.hash = hash;
    msg.dest_ip = std::net::Ipv4Addr::LOCALHOST;
    // The zero UUID is the "any server" form used by the last-peer shortcut
    msg.uuid = uuid::Uuid::nil();
    let bearer = peerlay_core::peer::PeerCrypt::new(SECRET).encode_bearer(&msg);

    let addr = b.http().unwrap().local_addr();
    let mut stream = TcpStream::connect(addr).unwrap();
    stream
        .write_all(
            format!(
                "GET /peerlay/{} HTTP/1.1\r\nHost: t\r\nAuthorization: Bearer {}\r\nConnection: close\r\n\r\n",
                hash.to_hex(),
                bearer
            )
            .as_bytes(),
        )
        .unwrap();
    let mut raw = String::new();
    stream.read_to_string(&mut raw).unwrap();
    assert!(raw.starts_with("HTTP/1.1 204"), "got {}", raw);

    a.shutdown();
    b.shutdown();
}
