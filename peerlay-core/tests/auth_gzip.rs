//! Authentication flows and response encoding over real connections

use std::io::{BufRead, BufReader, Read, Write};
use std::net::TcpStream;
use std::sync::Arc;

use base64::engine::general_purpose::STANDARD as BASE64_STANDARD;
use base64::Engine as _;
use peerlay_core::config::ServerConfig;
use peerlay_core::http::{
    AuthMode, CredentialStore, HttpMethod, HttpServerRuntime, RequestContext, Router, SecretStore,
    TcpHttpServer,
};

struct Accounts;

impl CredentialStore for Accounts {
    fn check(&self, user: &str, password: &str) -> bool {
        user == "peer" && password == "s3cret"
    }
}

impl SecretStore for Accounts {
    fn password(&self, user: &str) -> Option<String> {
        (user == "peer").then(|| "s3cret".to_string())
    }
}

struct Response {
    status: u16,
    headers: Vec<(String, String)>,
    body: Vec<u8>,
}

impl Response {
    fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

fn exchange(stream: &mut TcpStream, raw: &str) -> Response {
    stream.write_all(raw.as_bytes()).unwrap();
    let mut reader = BufReader::new(stream.try_clone().unwrap());
    let mut status_line = String::new();
    reader.read_line(&mut status_line).unwrap();
    let status: u16 = status_line.split(' ').nth(1).expect("status").parse().unwrap();
    let mut headers = Vec::new();
    loop {
        let mut line = String::new();
        reader.read_line(&mut line).unwrap();
        let line = line.trim_end();
        if line.is_empty() {
            break;
        }
        if let Some((n, v)) = line.split_once(':') {
            headers.push((n.trim().to_string(), v.trim().to_string()));
        }
    }
    let len: usize = headers
        .iter()
        .find(|(n, _)| n.eq_ignore_ascii_case("content-length"))
        .map(|(_, v)| v.parse().unwrap())
        .unwrap_or(0);
    let mut body = vec![0u8; len];
    reader.read_exact(&mut body).unwrap();
    Response { status, headers, body }
}

fn hello_server(auth: AuthMode, config: ServerConfig) -> Arc<TcpHttpServer> {
    let router = Arc::new(Router::new());
    router
        .run(
            &[HttpMethod::GET],
            "/hello",
            Arc::new(|ctx: &mut RequestContext| {
                let user = ctx.auth_user.clone();
                ctx.respond(200, "text/plain", format!("hi {}", user))
            }),
            None,
        )
        .unwrap();
    TcpHttpServer::start("127.0.0.1:0", config, router, auth).unwrap()
}

#[test]
fn basic_auth_challenge_then_success() {
    let server = hello_server(
        AuthMode::BasicStore { realm: "peers".into(), store: Arc::new(Accounts) },
        ServerConfig::default(),
    );
    let mut stream = TcpStream::connect(server.local_addr()).unwrap();

    let resp = exchange(&mut stream, "GET /hello HTTP/1.1\r\nHost: t\r\n\r\n");
    assert_eq!(resp.status, 401);
    assert_eq!(resp.header("WWW-Authenticate"), Some("Basic realm=\"peers\""));

    // Valid credentials on the same kept-alive connection
    let credentials = BASE64_STANDARD.encode("peer:s3cret");
    let resp = exchange(
        &mut stream,
        &format!(
            "GET /hello HTTP/1.1\r\nHost: t\r\nAuthorization: Basic {}\r\nConnection: close\r\n\r\n",
            credentials
        ),
    );
    assert_eq!(resp.status, 200);
    assert_eq!(resp.body, b"hi peer");
    server.shutdown();
}

#[test]
fn basic_auth_hammering_is_cut_off_with_403() {
    let server = hello_server(
        AuthMode::BasicStore { realm: "peers".into(), store: Arc::new(Accounts) },
        ServerConfig::default(),
    );
    let bad = BASE64_STANDARD.encode("peer:wrong");

    let mut stream = TcpStream::connect(server.local_addr()).unwrap();
    let resp = exchange(
        &mut stream,
        &format!("GET /hello HTTP/1.1\r\nHost: t\r\nAuthorization: Basic {}\r\n\r\n", bad),
    );
    assert_eq!(resp.status, 401);

    // Immediate retry with still-bad credentials inside the cooldown bucket
    let mut stream = TcpStream::connect(server.local_addr()).unwrap();
    let resp = exchange(
        &mut stream,
        &format!(
            "GET /hello HTTP/1.1\r\nHost: t\r\nAuthorization: Basic {}\r\nConnection: close\r\n\r\n",
            bad
        ),
    );
    assert_eq!(resp.status, 403);
    server.shutdown();
}

#[test]
fn digest_auth_round_trip_over_the_wire() {
    use sha2::{Digest, Sha256};
    fn h(parts: &[&str]) -> String {
        let mut hasher = Sha256::new();
        hasher.update(parts.join(":").as_bytes());
        hasher.finalize().iter().map(|b| format!("{:02x}", b)).collect()
    }

    let server = hello_server(
        AuthMode::Digest { realm: "peers".into(), secrets: Arc::new(Accounts) },
        // Pin the connection ID so the nonce matches across exchanges
        ServerConfig { connection_id_header: Some("X-Conn".into()), ..ServerConfig::default() },
    );
    let mut stream = TcpStream::connect(server.local_addr()).unwrap();

    let resp = exchange(&mut stream, "GET /hello HTTP/1.1\r\nHost: t\r\nX-Conn: 7\r\n\r\n");
    assert_eq!(resp.status, 401);
    let challenge = resp.header("WWW-Authenticate").expect("digest challenge").to_string();
    assert!(challenge.starts_with("Digest realm=\"peers\""));
    let nonce = challenge
        .split("nonce=\"")
        .nth(1)
        .and_then(|s| s.split('"').next())
        .expect("nonce field")
        .to_string();

    let ha1 = h(&["peer", "peers", "s3cret"]);
    let ha2 = h(&["GET", "/hello"]);
    let response = h(&[&ha1, &nonce, &ha2]);
    let authorization = format!(
        "Digest username=\"peer\", realm=\"peers\", nonce=\"{}\", uri=\"/hello\", response=\"{}\"",
        nonce, response
    );
    let resp = exchange(
        &mut stream,
        &format!(
            "GET /hello HTTP/1.1\r\nHost: t\r\nX-Conn: 7\r\nAuthorization: {}\r\nConnection: close\r\n\r\n",
            authorization
        ),
    );
    assert_eq!(resp.status, 200);
    assert_eq!(resp.body, b"hi peer");
    server.shutdown();
}

#[test]
fn gzip_applies_only_when_negotiated_and_worthwhile() {
    let router = Arc::new(Router::new());
    let big = "the quick brown fox jumps over the lazy dog ".repeat(200);
    let body = big.clone();
    router
        .run(
            &[HttpMethod::GET],
            "/big",
            Arc::new(move |ctx: &mut RequestContext| {
                ctx.respond(200, "text/plain", body.clone())
            }),
            None,
        )
        .unwrap();
    router
        .run(
            &[HttpMethod::GET],
            "/small",
            Arc::new(|ctx: &mut RequestContext| ctx.respond(200, "text/plain", "tiny")),
            None,
        )
        .unwrap();
    let server = TcpHttpServer::start(
        "127.0.0.1:0",
        ServerConfig { gzip_responses: true, ..ServerConfig::default() },
        router,
        AuthMode::None,
    )
    .unwrap();

    // Negotiated: body arrives gzip-encoded and smaller
    let mut stream = TcpStream::connect(server.local_addr()).unwrap();
    let resp = exchange(
        &mut stream,
        "GET /big HTTP/1.1\r\nHost: t\r\nAccept-Encoding: gzip\r\nConnection: close\r\n\r\n",
    );
    assert_eq!(resp.status, 200);
    assert_eq!(resp.header("Content-Encoding"), Some("gzip"));
    assert!(resp.body.len() < big.len());
    let mut unpacked = String::new();
    flate2::read::GzDecoder::new(&resp.body[..]).read_to_string(&mut unpacked).unwrap();
    assert_eq!(unpacked, big);

    // Not advertised: identity body
    let mut stream = TcpStream::connect(server.local_addr()).unwrap();
    let resp = exchange(&mut stream, "GET /big HTTP/1.1\r\nHost: t\r\nConnection: close\r\n\r\n");
    assert_eq!(resp.header("Content-Encoding"), None);
    assert_eq!(resp.body, big.as_bytes());

    // Too small to bother
    let mut stream = TcpStream::connect(server.local_addr()).unwrap();
    let resp = exchange(
        &mut stream,
        "GET /small HTTP/1.1\r\nHost: t\r\nAccept-Encoding: gzip\r\nConnection: close\r\n\r\n",
    );
    assert_eq!(resp.header("Content-Encoding"), None);
    assert_eq!(resp.body, b"tiny");
    server.shutdown();
}

#[test]
fn gzip_request_body_is_decoded_before_dispatch() {
    use flate2::write::GzEncoder;
    use flate2::Compression;

    let router = Arc::new(Router::new());
    router
        .run(
            &[HttpMethod::POST],
            "/echo-len",
            Arc::new(|ctx: &mut RequestContext| {
                let len = ctx.body.len().to_string();
                ctx.respond(200, "text/plain", len)
            }),
            None,
        )
        .unwrap();
    let server = TcpHttpServer::start(
        "127.0.0.1:0",
        ServerConfig::default(),
        router,
        AuthMode::None,
    )
    .unwrap();

    let plain = b"abcdefgh".repeat(100);
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(&plain).unwrap();
    let packed = encoder.finish().unwrap();

    let mut stream = TcpStream::connect(server.local_addr()).unwrap();
    stream
        .write_all(
            format!(
                "POST /echo-len HTTP/1.1\r\nHost: t\r\nContent-Encoding: gzip\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
                packed.len()
            )
            .as_bytes(),
        )
        .unwrap();
    stream.write_all(&packed).unwrap();
    let resp = exchange(&mut stream, "");
    assert_eq!(resp.status, 200);
    assert_eq!(resp.body, plain.len().to_string().as_bytes());
    server.shutdown();
}

#[test]
fn status_rewrite_answers_without_a_handler() {
    let router = Arc::new(Router::new());
    router.rewrite_same(HttpMethod::GET, "/retired", "410").unwrap();
    let server = TcpHttpServer::start(
        "127.0.0.1:0",
        ServerConfig::default(),
        router,
        AuthMode::None,
    )
    .unwrap();
    let mut stream = TcpStream::connect(server.local_addr()).unwrap();
    let resp = exchange(
        &mut stream,
        "GET /retired HTTP/1.1\r\nHost: t\r\nConnection: close\r\n\r\n",
    );
    assert_eq!(resp.status, 410);
    server.shutdown();
}

#[test]
fn header_parsed_hook_intercepts_early() {
    let router = Arc::new(Router::new());
    let server = TcpHttpServer::start(
        "127.0.0.1:0",
        ServerConfig::default(),
        router,
        AuthMode::None,
    )
    .unwrap();
    server.set_hooks(peerlay_core::http::ServerHooks {
        on_header_parsed: Some(Arc::new(|head, _ip| {
            head.user_agent.as_deref().filter(|ua| ua.contains("bad-bot")).map(|_| 503)
        })),
        on_before_body: None,
        on_idle: None,
    });

    let mut stream = TcpStream::connect(server.local_addr()).unwrap();
    let resp = exchange(
        &mut stream,
        "GET /x HTTP/1.1\r\nHost: t\r\nUser-Agent: bad-bot/1.0\r\nConnection: close\r\n\r\n",
    );
    assert_eq!(resp.status, 503);

    let mut stream = TcpStream::connect(server.local_addr()).unwrap();
    let resp = exchange(
        &mut stream,
        "GET /x HTTP/1.1\r\nHost: t\r\nUser-Agent: curl/8\r\nConnection: close\r\n\r\n",
    );
    assert_eq!(resp.status, 404);
    server.shutdown();
}
