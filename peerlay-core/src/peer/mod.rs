//! The peer plane: discovery, framing, cache coordination
//!
//! # Architecture
//!
//! - [`message`] - The fixed 192-byte cache message
//! - [`crypt`] - Key derivation, AES-GCM framing, bearers, sequence window
//! - [`net`] - Interface descriptors and selection
//! - [`discovery`] - UDP broadcast request/response exchange
//! - [`partial`] - Registry of in-flight downloads
//! - [`client`] - Peer HTTP download client
//! - [`cache`] - The coordinator tying everything to the HTTP server

pub mod cache;
pub mod client;
pub mod crypt;
pub mod discovery;
pub mod message;
pub mod net;
pub mod partial;

pub use cache::{ContentRequest, DownloadSink, HttpPeerCache};
pub use client::PeerClient;
pub use crypt::{crc63, PeerCrypt};
pub use discovery::{ConsultResult, RequestConsult, UdpPeerServer};
pub use message::{CacheMessage, MESSAGE_LEN};
pub use net::NetInterface;
pub use partial::PartialFileRegistry;

/// Message kinds on the UDP wire and inside bearers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MessageKind {
    Ping = 0,
    Pong = 1,
    Request = 2,
    ResponseNone = 3,
    ResponseOverloaded = 4,
    ResponsePartial = 5,
    ResponseFull = 6,
    /// Proves a peer HTTP GET came from a secret holder
    RequestBearer = 7,
    /// Localhost-only outbound-fetch authorization
    DirectBearer = 8,
}

impl MessageKind {
    pub fn from_u8(v: u8) -> Option<Self> {
        Some(match v {
            0 => MessageKind::Ping,
            1 => MessageKind::Pong,
            2 => MessageKind::Request,
            3 => MessageKind::ResponseNone,
            4 => MessageKind::ResponseOverloaded,
            5 => MessageKind::ResponsePartial,
            6 => MessageKind::ResponseFull,
            7 => MessageKind::RequestBearer,
            8 => MessageKind::DirectBearer,
            _ => return None,
        })
    }

    /// Kinds whose sequence must fall inside the receiver's window
    pub fn is_response(&self) -> bool {
        matches!(
            self,
            MessageKind::Pong
                | MessageKind::ResponseNone
                | MessageKind::ResponseOverloaded
                | MessageKind::ResponsePartial
                | MessageKind::ResponseFull
        )
    }
}

/// Physical medium of an interface; doubles as the peer preference order
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum HardwareKind {
    Unknown = 0,
    Ethernet = 1,
    Wifi = 2,
    Cellular = 3,
    Loopback = 4,
    Virtual = 5,
}

impl HardwareKind {
    pub fn from_u8(v: u8) -> Option<Self> {
        Some(match v {
            0 => HardwareKind::Unknown,
            1 => HardwareKind::Ethernet,
            2 => HardwareKind::Wifi,
            3 => HardwareKind::Cellular,
            4 => HardwareKind::Loopback,
            5 => HardwareKind::Virtual,
            _ => return None,
        })
    }

    /// Lower ranks are preferred when picking among responding peers
    pub fn preference_rank(&self) -> u8 {
        match self {
            HardwareKind::Ethernet => 0,
            HardwareKind::Wifi => 1,
            HardwareKind::Loopback => 2,
            HardwareKind::Virtual => 3,
            HardwareKind::Cellular => 4,
            HardwareKind::Unknown => 5,
        }
    }
}

/// Content hash algorithms carried in messages
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum HashAlgo {
    Sha256 = 0,
    Sha512 = 1,
}

impl HashAlgo {
    pub fn from_u8(v: u8) -> Option<Self> {
        Some(match v {
            0 => HashAlgo::Sha256,
            1 => HashAlgo::Sha512,
            _ => return None,
        })
    }

    pub fn digest_len(&self) -> usize {
        match self {
            HashAlgo::Sha256 => 32,
            HashAlgo::Sha512 => 64,
        }
    }
}

/// An algorithm tag plus its digest, fixed storage for the largest digest
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ContentHash {
    pub algo: HashAlgo,
    pub digest: [u8; 64],
}

impl ContentHash {
    pub fn new(algo: HashAlgo, digest: &[u8]) -> Option<Self> {
        if digest.len() != algo.digest_len() {
            return None;
        }
        let mut fixed = [0u8; 64];
        fixed[..digest.len()].copy_from_slice(digest);
        Some(Self { algo, digest: fixed })
    }

    /// SHA-256 of a whole byte slice
    pub fn sha256(data: &[u8]) -> Self {
        use sha2::Digest;
        let digest = sha2::Sha256::digest(data);
        Self::new(HashAlgo::Sha256, &digest).expect("digest length matches algorithm")
    }

    /// SHA-256 of everything a reader yields
    pub fn sha256_of_reader<R: std::io::Read>(reader: &mut R) -> std::io::Result<Self> {
        use sha2::Digest;
        let mut hasher = sha2::Sha256::new();
        let mut buf = [0u8; 64 * 1024];
        loop {
            let n = reader.read(&mut buf)?;
            if n == 0 {
                break;
            }
            hasher.update(&buf[..n]);
        }
        Ok(Self::new(HashAlgo::Sha256, &hasher.finalize()).expect("digest length matches"))
    }

    /// A hash with a zero digest means "no hash" on the wire.
    pub fn is_zero(&self) -> bool {
        self.digest.iter().all(|&b| b == 0)
    }

    /// `hex(algo || digest)`, the cache filename stem
    pub fn to_hex(&self) -> String {
        let mut out = String::with_capacity(2 + self.algo.digest_len() * 2);
        out.push_str(&format!("{:02x}", self.algo as u8));
        for b in &self.digest[..self.algo.digest_len()] {
            out.push_str(&format!("{:02x}", b));
        }
        out
    }

    pub fn from_hex(hex: &str) -> Option<Self> {
        if hex.len() < 2 || hex.len() % 2 != 0 {
            return None;
        }
        let mut bytes = Vec::with_capacity(hex.len() / 2);
        for i in (0..hex.len()).step_by(2) {
            bytes.push(u8::from_str_radix(&hex[i..i + 2], 16).ok()?);
        }
        let algo = HashAlgo::from_u8(bytes[0])?;
        Self::new(algo, &bytes[1..])
    }

    /// `<hex>.cache`, the on-disk name in both stores
    pub fn cache_file_name(&self) -> String {
        format!("{}.cache", self.to_hex())
    }

    /// First hex nibble of the digest, used for 16-way sharding
    pub fn shard_nibble(&self) -> char {
        char::from_digit(u32::from(self.digest[0] >> 4), 16).expect("nibble is a hex digit")
    }
}

impl Default for ContentHash {
    fn default() -> Self {
        Self { algo: HashAlgo::Sha256, digest: [0u8; 64] }
    }
}

/// Frame and bearer decode failures, from the outermost check inward
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecodeError {
    /// Bearer text length out of bounds
    BearerLen,
    /// Bearer base64url decode failure
    Base64,
    /// Bearer carried an unexpected message kind
    BearerKind,
    /// Frame shorter or longer than the fixed wire size
    Len,
    /// Salted checksum mismatch (fast pre-filter)
    Crc,
    /// AES-GCM authentication failure
    Aes,
    /// Response sequence outside the replay window
    Seq,
    /// Unknown message kind byte
    Kind,
    /// Unknown hardware byte
    Hardware,
    /// Unknown hash-algorithm byte
    Algo,
}

impl std::fmt::Display for DecodeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let tag = match self {
            DecodeError::BearerLen => "bearer length",
            DecodeError::Base64 => "bearer base64",
            DecodeError::BearerKind => "bearer kind",
            DecodeError::Len => "frame length",
            DecodeError::Crc => "checksum",
            DecodeError::Aes => "aes-gcm",
            DecodeError::Seq => "sequence window",
            DecodeError::Kind => "message kind",
            DecodeError::Hardware => "hardware kind",
            DecodeError::Algo => "hash algorithm",
        };
        write!(f, "frame decode failed: {}", tag)
    }
}

impl std::error::Error for DecodeError {}

/// Cache coordinator errors
#[derive(Debug)]
pub enum CacheError {
    /// A download request without a usable hash
    MissingHash,
    /// Request validation failures
    Invalid(String),
    /// Local store I/O failures
    Io(std::io::Error),
    /// Peer HTTP transport failures
    Transport(String),
}

impl std::fmt::Display for CacheError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CacheError::MissingHash => write!(f, "download request carries no hash"),
            CacheError::Invalid(msg) => write!(f, "invalid request: {}", msg),
            CacheError::Io(e) => write!(f, "cache i/o: {}", e),
            CacheError::Transport(msg) => write!(f, "peer transport: {}", msg),
        }
    }
}

impl std::error::Error for CacheError {}

impl From<std::io::Error> for CacheError {
    fn from(e: std::io::Error) -> Self {
        CacheError::Io(e)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hash_hex_round_trip() {
        let hash = ContentHash::sha256(b"payload");
        let hex = hash.to_hex();
        assert_eq!(hex.len(), 2 + 64);
        assert!(hex.starts_with("00"));
        assert_eq!(ContentHash::from_hex(&hex), Some(hash));
        assert!(hash.cache_file_name().ends_with(".cache"));
    }

    #[test]
    fn zero_hash_detection() {
        assert!(ContentHash::default().is_zero());
        assert!(!ContentHash::sha256(b"x").is_zero());
    }

    #[test]
    fn kind_and_hardware_ranges() {
        assert_eq!(MessageKind::from_u8(6), Some(MessageKind::ResponseFull));
        assert_eq!(MessageKind::from_u8(9), None);
        assert!(MessageKind::Pong.is_response());
        assert!(!MessageKind::Request.is_response());
        assert_eq!(HardwareKind::from_u8(2), Some(HardwareKind::Wifi));
        assert_eq!(HardwareKind::from_u8(6), None);
        assert!(HardwareKind::Ethernet.preference_rank() < HardwareKind::Wifi.preference_rank());
    }

    #[test]
    fn reader_hash_matches_slice_hash() {
        let data = vec![7u8; 200_000];
        let a = ContentHash::sha256(&data);
        let b = ContentHash::sha256_of_reader(&mut &data[..]).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn shard_nibble_is_first_digest_nibble() {
        let mut hash = ContentHash::default();
        hash.digest[0] = 0xAB;
        assert_eq!(hash.shard_nibble(), 'a');
    }
}
