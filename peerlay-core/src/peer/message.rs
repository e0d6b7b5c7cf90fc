//! The fixed 192-byte cache message
//!
//! Hand-packed little-endian layout, identical on every platform. The tail
//! is filled with fresh random padding on every encode so two messages with
//! equal fields never produce equal plaintext blocks under the frame
//! cipher. The padding-version byte is written as zero and only the length
//! is checked on decode.

use std::net::Ipv4Addr;

use uuid::Uuid;

use super::{ContentHash, DecodeError, HardwareKind, HashAlgo, MessageKind};

/// Exact serialized size of every message
pub const MESSAGE_LEN: usize = 192;

/// Random filler after the last field
pub const PADDING_LEN: usize = 42;

/// Unix epoch of 2022-01-01, the zero point of the 32-bit timestamp field
pub const MINIMAL_EPOCH_UNIX: u64 = 1_640_995_200;

/// Seconds since [`MINIMAL_EPOCH_UNIX`]
pub fn unix_time_minimal() -> u32 {
    let now = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs();
    now.saturating_sub(MINIMAL_EPOCH_UNIX) as u32
}

/// Numeric operating-system descriptor carried for diagnostics
pub fn current_os() -> u32 {
    if cfg!(target_os = "linux") {
        1
    } else if cfg!(target_os = "macos") {
        2
    } else if cfg!(windows) {
        3
    } else {
        0
    }
}

/// One discovery or bearer message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheMessage {
    pub kind: MessageKind,
    pub seq: u32,
    pub uuid: Uuid,
    pub os: u32,
    pub sender_ip: Ipv4Addr,
    /// Zero means broadcast
    pub dest_ip: Ipv4Addr,
    pub mask: Ipv4Addr,
    pub broadcast: Ipv4Addr,
    pub speed_mbits: u32,
    pub hardware: HardwareKind,
    /// Seconds since the minimal epoch
    pub timestamp: u32,
    /// Sender's active peer-HTTP connections
    pub connections: u16,
    pub hash: ContentHash,
    pub size: u64,
    pub range_start: u64,
    /// Inclusive
    pub range_end: u64,
    pub opaque: u64,
}

impl Default for CacheMessage {
    fn default() -> Self {
        Self {
            kind: MessageKind::Ping,
            seq: 0,
            uuid: Uuid::nil(),
            os: current_os(),
            sender_ip: Ipv4Addr::UNSPECIFIED,
            dest_ip: Ipv4Addr::UNSPECIFIED,
            mask: Ipv4Addr::UNSPECIFIED,
            broadcast: Ipv4Addr::UNSPECIFIED,
            speed_mbits: 0,
            hardware: HardwareKind::Unknown,
            timestamp: unix_time_minimal(),
            connections: 0,
            hash: ContentHash::default(),
            size: 0,
            range_start: 0,
            range_end: 0,
            opaque: 0,
        }
    }
}

impl CacheMessage {
    /// Serialize into the fixed wire layout, re-rolling the random padding.
    pub fn encode(&self) -> [u8; MESSAGE_LEN] {
        let mut buf = [0u8; MESSAGE_LEN];
        buf[0] = self.kind as u8;
        buf[1..5].copy_from_slice(&self.seq.to_le_bytes());
        buf[5..21].copy_from_slice(self.uuid.as_bytes());
        buf[21..25].copy_from_slice(&self.os.to_le_bytes());
        buf[25..29].copy_from_slice(&self.sender_ip.octets());
        buf[29..33].copy_from_slice(&self.dest_ip.octets());
        buf[33..37].copy_from_slice(&self.mask.octets());
        buf[37..41].copy_from_slice(&self.broadcast.octets());
        buf[41..45].copy_from_slice(&self.speed_mbits.to_le_bytes());
        buf[45] = self.hardware as u8;
        buf[46..50].copy_from_slice(&self.timestamp.to_le_bytes());
        buf[50..52].copy_from_slice(&self.connections.to_le_bytes());
        buf[52] = self.hash.algo as u8;
        buf[53..117].copy_from_slice(&self.hash.digest);
        buf[117..125].copy_from_slice(&self.size.to_le_bytes());
        buf[125..133].copy_from_slice(&self.range_start.to_le_bytes());
        buf[133..141].copy_from_slice(&self.range_end.to_le_bytes());
        buf[141..149].copy_from_slice(&self.opaque.to_le_bytes());
        buf[149] = 0; // padding version
        rand::RngCore::fill_bytes(&mut rand::rng(), &mut buf[150..]);
        buf
    }

    /// Parse the fixed layout, validating every enum-tagged field.
    pub fn decode(buf: &[u8]) -> Result<Self, DecodeError> {
        if buf.len() != MESSAGE_LEN {
            return Err(DecodeError::Len);
        }
        let kind = MessageKind::from_u8(buf[0]).ok_or(DecodeError::Kind)?;
        let hardware = HardwareKind::from_u8(buf[45]).ok_or(DecodeError::Hardware)?;
        let algo = HashAlgo::from_u8(buf[52]).ok_or(DecodeError::Algo)?;
        let mut digest = [0u8; 64];
        digest.copy_from_slice(&buf[53..117]);
        let mut uuid = [0u8; 16];
        uuid.copy_from_slice(&buf[5..21]);

        Ok(Self {
            kind,
            seq: u32::from_le_bytes(buf[1..5].try_into().expect("4 bytes")),
            uuid: Uuid::from_bytes(uuid),
            os: u32::from_le_bytes(buf[21..25].try_into().expect("4 bytes")),
            sender_ip: ip_at(buf, 25),
            dest_ip: ip_at(buf, 29),
            mask: ip_at(buf, 33),
            broadcast: ip_at(buf, 37),
            speed_mbits: u32::from_le_bytes(buf[41..45].try_into().expect("4 bytes")),
            hardware,
            timestamp: u32::from_le_bytes(buf[46..50].try_into().expect("4 bytes")),
            connections: u16::from_le_bytes(buf[50..52].try_into().expect("2 bytes")),
            hash: ContentHash { algo, digest },
            size: u64::from_le_bytes(buf[117..125].try_into().expect("8 bytes")),
            range_start: u64::from_le_bytes(buf[125..133].try_into().expect("8 bytes")),
            range_end: u64::from_le_bytes(buf[133..141].try_into().expect("8 bytes")),
            opaque: u64::from_le_bytes(buf[141..149].try_into().expect("8 bytes")),
        })
    }
}

fn ip_at(buf: &[u8], off: usize) -> Ipv4Addr {
    Ipv4Addr::new(buf[off], buf[off + 1], buf[off + 2], buf[off + 3])
}
