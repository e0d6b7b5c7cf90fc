//! Server-side authentication engine
//!
//! One process-wide mode: none, Basic (callback or credential store),
//! Digest, or Negotiate through a pluggable platform binding. Challenges
//! are issued as `WWW-Authenticate` values; verification fills the
//! context's authorized user. Repeated failures inside one cooldown bucket
//! are cut off with 403.
//!
//! Digest uses SHA-256 (RFC 7616 syntax); both ends of the exchange live
//! in this crate, so MD5 interop is not carried.

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::{Arc, Mutex};
use std::time::{SystemTime, UNIX_EPOCH};

use base64::engine::general_purpose::STANDARD as BASE64_STANDARD;
use base64::Engine as _;
use sha2::{Digest, Sha256};

use super::request::HttpMethod;

/// Password verification backend for Basic authentication
pub trait CredentialStore: Send + Sync {
    fn check(&self, user: &str, password: &str) -> bool;
}

/// Cleartext secret lookup for Digest authentication
pub trait SecretStore: Send + Sync {
    fn password(&self, user: &str) -> Option<String>;
}

/// Platform GSS/SSPI binding for Negotiate. `accept_token` consumes the
/// client token and returns the server token plus, once the exchange is
/// complete, the authenticated principal.
pub trait NegotiateBinding: Send + Sync {
    fn accept_token(&self, input: &[u8]) -> Option<(Vec<u8>, Option<String>)>;
}

/// Basic verification callback
pub type BasicVerifier = Arc<dyn Fn(&str, &str) -> bool + Send + Sync>;

/// Process-wide authentication mode
#[derive(Clone)]
pub enum AuthMode {
    None,
    BasicCallback { realm: String, verify: BasicVerifier },
    BasicStore { realm: String, store: Arc<dyn CredentialStore> },
    Digest { realm: String, secrets: Arc<dyn SecretStore> },
    Negotiate(Arc<dyn NegotiateBinding>),
}

/// Outcome of one authentication check
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthOutcome {
    /// No authentication configured, or credentials accepted
    Authorized(String),
    /// Respond 401 with this `WWW-Authenticate` value
    Challenge(String),
    /// Respond 403 and close: the client is hammering inside the cooldown
    Reject,
}

pub struct AuthEngine {
    mode: AuthMode,
    /// Per-process nonce salt; ties Digest nonces to this server lifetime
    boot_salt: [u8; 16],
    challenged: Mutex<HashMap<IpAddr, u64>>,
}

/// 4 KiB-granularity epoch bucket (~4.1 s) used for the 401 cooldown
fn cooldown_bucket() -> u64 {
    let ms = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64;
    ms >> 12
}

fn hex(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        out.push_str(&format!("{:02x}", b));
    }
    out
}

fn sha256_hex(parts: &[&str]) -> String {
    let mut h = Sha256::new();
    for (i, p) in parts.iter().enumerate() {
        if i > 0 {
            h.update(b":");
        }
        h.update(p.as_bytes());
    }
    hex(&h.finalize())
}

impl AuthEngine {
    pub fn new(mode: AuthMode) -> Self {
        let mut boot_salt = [0u8; 16];
        rand::Rng::fill(&mut rand::rng(), &mut boot_salt[..]);
        Self { mode, boot_salt, challenged: Mutex::new(HashMap::new()) }
    }

    pub fn enabled(&self) -> bool {
        !matches!(self.mode, AuthMode::None)
    }

    /// Digest nonce bound to the connection and this server lifetime
    fn nonce(&self, connection_id: u32) -> String {
        let mut h = Sha256::new();
        h.update(self.boot_salt);
        h.update(connection_id.to_le_bytes());
        hex(&h.finalize()[..16])
    }

    fn opaque(&self, connection_id: u32) -> String {
        let mut h = Sha256::new();
        h.update(connection_id.to_le_bytes());
        h.update(self.boot_salt);
        hex(&h.finalize()[..8])
    }

    fn challenge_value(&self, connection_id: u32) -> String {
        match &self.mode {
            AuthMode::None => String::new(),
            AuthMode::BasicCallback { realm, .. } | AuthMode::BasicStore { realm, .. } => {
                format!("Basic realm=\"{}\"", realm)
            }
            AuthMode::Digest { realm, .. } => format!(
                "Digest realm=\"{}\", qop=\"auth\", algorithm=SHA-256, nonce=\"{}\", opaque=\"{}\"",
                realm,
                self.nonce(connection_id),
                self.opaque(connection_id)
            ),
            AuthMode::Negotiate(_) => "Negotiate".to_string(),
        }
    }

    /// Run the configured flow against the request's `Authorization` header.
    pub fn check(
        &self,
        authorization: Option<&str>,
        method: HttpMethod,
        url: &str,
        connection_id: u32,
        remote_ip: IpAddr,
    ) -> AuthOutcome {
        let verified = match &self.mode {
            AuthMode::None => return AuthOutcome::Authorized(String::new()),
            AuthMode::BasicCallback { verify, .. } => {
                authorization.and_then(|a| Self::verify_basic(a, |u, p| verify(u, p)))
            }
            AuthMode::BasicStore { store, .. } => {
                authorization.and_then(|a| Self::verify_basic(a, |u, p| store.check(u, p)))
            }
            AuthMode::Digest { realm, secrets } => authorization
                .and_then(|a| self.verify_digest(a, realm, secrets.as_ref(), method, url, connection_id)),
            AuthMode::Negotiate(binding) => {
                match authorization.and_then(|a| Self::verify_negotiate(a, binding.as_ref())) {
                    Some(NegotiateStep::Done(user)) => Some(user),
                    Some(NegotiateStep::Continue(token)) => {
                        return AuthOutcome::Challenge(format!("Negotiate {}", token));
                    }
                    None => None,
                }
            }
        };

        match verified {
            Some(user) => {
                self.challenged.lock().expect("auth lock poisoned").remove(&remote_ip);
                AuthOutcome::Authorized(user)
            }
            None => {
                let bucket = cooldown_bucket();
                let mut challenged = self.challenged.lock().expect("auth lock poisoned");
                match challenged.get(&remote_ip) {
                    // A challenge already went out in this bucket and the
                    // client came back still invalid
                    Some(&prev) if prev == bucket && authorization.is_some() => AuthOutcome::Reject,
                    _ => {
                        challenged.insert(remote_ip, bucket);
                        AuthOutcome::Challenge(self.challenge_value(connection_id))
                    }
                }
            }
        }
    }

    fn verify_basic(authorization: &str, check: impl Fn(&str, &str) -> bool) -> Option<String> {
        let b64 = authorization.strip_prefix("Basic ")?;
        let decoded = BASE64_STANDARD.decode(b64.trim()).ok()?;
        let decoded = String::from_utf8(decoded).ok()?;
        let (user, password) = decoded.split_once(':')?;
        check(user, password).then(|| user.to_string())
    }

    fn verify_digest(
        &self,
        authorization: &str,
        realm: &str,
        secrets: &dyn SecretStore,
        method: HttpMethod,
        url: &str,
        connection_id: u32,
    ) -> Option<String> {
        let fields = parse_digest_fields(authorization.strip_prefix("Digest ")?);
        let user = fields.get("username")?;
        let uri = fields.get("uri")?;
        let nonce = fields.get("nonce")?;
        let response = fields.get("response")?;
        // The signed URI must be the one from the command line
        if uri != url || *nonce != self.nonce(connection_id) {
            return None;
        }
        let password = secrets.password(user)?;
        let ha1 = sha256_hex(&[user, realm, &password]);
        let ha2 = sha256_hex(&[method.as_str(), uri]);
        let expected = match (fields.get("qop"), fields.get("nc"), fields.get("cnonce")) {
            (Some(qop), Some(nc), Some(cnonce)) => {
                sha256_hex(&[&ha1, nonce, nc, cnonce, qop, &ha2])
            }
            _ => sha256_hex(&[&ha1, nonce, &ha2]),
        };
        expected.eq_ignore_ascii_case(response).then(|| user.to_string())
    }

    fn verify_negotiate(authorization: &str, binding: &dyn NegotiateBinding) -> Option<NegotiateStep> {
        let b64 = authorization.strip_prefix("Negotiate ")?;
        let input = BASE64_STANDARD.decode(b64.trim()).ok()?;
        let (output, user) = binding.accept_token(&input)?;
        Some(match user {
            Some(user) => NegotiateStep::Done(user),
            None => NegotiateStep::Continue(BASE64_STANDARD.encode(output)),
        })
    }
}

enum NegotiateStep {
    Done(String),
    Continue(String),
}

/// Parse `k=v, k="v"` pairs of a Digest header value.
fn parse_digest_fields(value: &str) -> HashMap<String, String> {
    let mut fields = HashMap::new();
    let mut rest = value.trim();
    while !rest.is_empty() {
        let Some(eq) = rest.find('=') else { break };
        let key = rest[..eq].trim().to_ascii_lowercase();
        rest = &rest[eq + 1..];
        let val;
        if let Some(stripped) = rest.strip_prefix('"') {
            let Some(close) = stripped.find('"') else { break };
            val = stripped[..close].to_string();
            rest = stripped[close + 1..].trim_start_matches(',').trim_start();
        } else {
            let end = rest.find(',').unwrap_or(rest.len());
            val = rest[..end].trim().to_string();
            rest = rest[end..].trim_start_matches(',').trim_start();
        }
        fields.insert(key, val);
    }
    fields
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    struct FixedStore;

    impl CredentialStore for FixedStore {
        fn check(&self, user: &str, password: &str) -> bool {
            user == "alice" && password == "secret"
        }
    }

    impl SecretStore for FixedStore {
        fn password(&self, user: &str) -> Option<String> {
            (user == "alice").then(|| "secret".to_string())
        }
    }

    fn ip() -> IpAddr {
        IpAddr::V4(Ipv4Addr::new(192, 168, 1, 10))
    }

    fn basic_header(user: &str, password: &str) -> String {
        format!("Basic {}", BASE64_STANDARD.encode(format!("{}:{}", user, password)))
    }

    #[test]
    fn none_mode_authorizes_everything() {
        let engine = AuthEngine::new(AuthMode::None);
        assert_eq!(
            engine.check(None, HttpMethod::GET, "/", 1, ip()),
            AuthOutcome::Authorized(String::new())
        );
    }

    #[test]
    fn basic_store_accepts_valid_credentials() {
        let engine = AuthEngine::new(AuthMode::BasicStore {
            realm: "peers".into(),
            store: Arc::new(FixedStore),
        });
        let header = basic_header("alice", "secret");
        assert_eq!(
            engine.check(Some(&header), HttpMethod::GET, "/", 1, ip()),
            AuthOutcome::Authorized("alice".into())
        );
    }

    #[test]
    fn missing_credentials_get_basic_challenge() {
        let engine = AuthEngine::new(AuthMode::BasicStore {
            realm: "peers".into(),
            store: Arc::new(FixedStore),
        });
        match engine.check(None, HttpMethod::GET, "/", 1, ip()) {
            AuthOutcome::Challenge(c) => assert_eq!(c, "Basic realm=\"peers\""),
            other => panic!("expected challenge, got {:?}", other),
        }
    }

    #[test]
    fn retry_with_bad_credentials_in_same_bucket_rejects() {
        let engine = AuthEngine::new(AuthMode::BasicCallback {
            realm: "peers".into(),
            verify: Arc::new(|_, _| false),
        });
        let header = basic_header("eve", "wrong");
        // First failure issues the challenge
        assert!(matches!(
            engine.check(Some(&header), HttpMethod::GET, "/", 1, ip()),
            AuthOutcome::Challenge(_)
        ));
        // Immediate retry with still-bad credentials is cut off
        assert_eq!(
            engine.check(Some(&header), HttpMethod::GET, "/", 1, ip()),
            AuthOutcome::Reject
        );
    }

    #[test]
    fn success_clears_the_cooldown() {
        let engine = AuthEngine::new(AuthMode::BasicStore {
            realm: "peers".into(),
            store: Arc::new(FixedStore),
        });
        let bad = basic_header("alice", "nope");
        let good = basic_header("alice", "secret");
        assert!(matches!(
            engine.check(Some(&bad), HttpMethod::GET, "/", 1, ip()),
            AuthOutcome::Challenge(_)
        ));
        assert_eq!(
            engine.check(Some(&good), HttpMethod::GET, "/", 1, ip()),
            AuthOutcome::Authorized("alice".into())
        );
        // Failing again right away challenges instead of rejecting
        assert!(matches!(
            engine.check(Some(&bad), HttpMethod::GET, "/", 1, ip()),
            AuthOutcome::Challenge(_)
        ));
    }

    #[test]
    fn digest_round_trip() {
        let engine = AuthEngine::new(AuthMode::Digest {
            realm: "peers".into(),
            secrets: Arc::new(FixedStore),
        });
        let challenge = match engine.check(None, HttpMethod::GET, "/file", 7, ip()) {
            AuthOutcome::Challenge(c) => c,
            other => panic!("expected challenge, got {:?}", other),
        };
        assert!(challenge.starts_with("Digest realm=\"peers\""));
        let fields = parse_digest_fields(challenge.strip_prefix("Digest ").unwrap());
        let nonce = &fields["nonce"];

        // Client-side computation, qop-less variant
        let ha1 = sha256_hex(&["alice", "peers", "secret"]);
        let ha2 = sha256_hex(&["GET", "/file"]);
        let response = sha256_hex(&[&ha1, nonce, &ha2]);
        let header = format!(
            "Digest username=\"alice\", realm=\"peers\", nonce=\"{}\", uri=\"/file\", response=\"{}\"",
            nonce, response
        );
        assert_eq!(
            engine.check(Some(&header), HttpMethod::GET, "/file", 7, ip()),
            AuthOutcome::Authorized("alice".into())
        );
        // Same credentials signed for a different URL are rejected
        assert!(matches!(
            engine.check(Some(&header), HttpMethod::GET, "/other", 7, ip()),
            AuthOutcome::Challenge(_) | AuthOutcome::Reject
        ));
    }

    #[test]
    fn digest_nonce_is_per_connection() {
        let engine = AuthEngine::new(AuthMode::Digest {
            realm: "peers".into(),
            secrets: Arc::new(FixedStore),
        });
        assert_ne!(engine.nonce(1), engine.nonce(2));
        assert_eq!(engine.nonce(1), engine.nonce(1));
    }

    struct EchoBinding;

    impl NegotiateBinding for EchoBinding {
        fn accept_token(&self, input: &[u8]) -> Option<(Vec<u8>, Option<String>)> {
            if input == b"final" {
                Some((Vec::new(), Some("DOMAIN\\user".into())))
            } else {
                Some((b"server-token".to_vec(), None))
            }
        }
    }

    #[test]
    fn negotiate_two_way_exchange() {
        let engine = AuthEngine::new(AuthMode::Negotiate(Arc::new(EchoBinding)));
        let first = format!("Negotiate {}", BASE64_STANDARD.encode(b"hello"));
        match engine.check(Some(&first), HttpMethod::GET, "/", 1, ip()) {
            AuthOutcome::Challenge(c) => {
                assert_eq!(c, format!("Negotiate {}", BASE64_STANDARD.encode(b"server-token")));
            }
            other => panic!("expected continue challenge, got {:?}", other),
        }
        let second = format!("Negotiate {}", BASE64_STANDARD.encode(b"final"));
        assert_eq!(
            engine.check(Some(&second), HttpMethod::GET, "/", 1, ip()),
            AuthOutcome::Authorized("DOMAIN\\user".into())
        );
    }

    #[test]
    fn digest_field_parsing_handles_quotes_and_commas() {
        let fields = parse_digest_fields(
            "username=\"a,b\", realm=\"r\", qop=auth, nc=00000001, uri=\"/x\"",
        );
        assert_eq!(fields["username"], "a,b");
        assert_eq!(fields["qop"], "auth");
        assert_eq!(fields["nc"], "00000001");
    }
}
