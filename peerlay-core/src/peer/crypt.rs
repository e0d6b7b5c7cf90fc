//! Authenticated frame crypto for the peer plane
//!
//! A shared subnet secret is stretched with HMAC-SHA-256 into an
//! AES-128-GCM key and a 32-bit salt for the checksum pre-filter. The wire
//! frame is `iv:16 || ciphertext:192 || tag:16 || crc:4`; the GCM nonce is
//! the first 12 bytes of the IV field, the salted CRC-32 over
//! `ciphertext || iv || tag` rejects fuzzed frames before any AES work.
//!
//! Sequence numbers anchor a replay window: a random 31-bit `startup_low`
//! is drawn per process, outgoing frames count up from it, and inbound
//! response frames must fall inside `[startup_low, current]`. Exhausting
//! the 31-bit space re-anchors at a fresh random low.

use aes_gcm::aead::Aead;
use aes_gcm::{Aes128Gcm, Key, KeyInit, Nonce};
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use hmac::{Hmac, Mac};
use sha2::Sha256;
use std::sync::atomic::{AtomicU32, Ordering};

use super::message::MESSAGE_LEN;
use super::{CacheMessage, DecodeError, MessageKind};

type HmacSha256 = Hmac<Sha256>;

/// Domain-separation label of the frame key derivation
const KEY_LABEL: &[u8] = b"peerlay frame key v1";
/// Label of the second iteration yielding the checksum salt
const MAGIC_LABEL: &[u8] = b"peerlay frame magic v1";

const IV_LEN: usize = 16;
const TAG_LEN: usize = 16;
const CRC_LEN: usize = 4;
/// Full frame size on the wire
pub const FRAME_LEN: usize = IV_LEN + MESSAGE_LEN + TAG_LEN + CRC_LEN;
/// Exact base64url length of a bearer (192 + 36 bytes, no padding)
pub const BEARER_LEN: usize = FRAME_LEN.div_ceil(3) * 4;

fn hmac_256(key: &[u8], label: &[u8]) -> [u8; 32] {
    let mut mac = <HmacSha256 as Mac>::new_from_slice(key).expect("HMAC accepts any key length");
    mac.update(label);
    mac.finalize().into_bytes().into()
}

fn salted_crc(magic: u32, parts: &[&[u8]]) -> u32 {
    let mut hasher = crc32fast::Hasher::new_with_initial(magic);
    for part in parts {
        hasher.update(part);
    }
    hasher.finalize()
}

/// 63-bit URL binding used by direct-mode bearers: two differently seeded
/// CRC-32 passes packed into a `u64` with the top bit cleared. Collision
/// resistance against URL swaps is all it provides; authenticity comes
/// from the surrounding AES-GCM frame.
pub fn crc63(data: &[u8]) -> u64 {
    let lo = salted_crc(0x79ae_5cb1, &[data]);
    let hi = salted_crc(0x2f3d_8e91, &[data]);
    (u64::from(hi) << 32 | u64::from(lo)) & 0x7fff_ffff_ffff_ffff
}

fn random_low31() -> u32 {
    rand::Rng::random::<u32>(&mut rand::rng()) & 0x7fff_ffff
}

pub struct PeerCrypt {
    cipher: Aes128Gcm,
    magic: u32,
    startup_low: AtomicU32,
    current: AtomicU32,
}

impl PeerCrypt {
    pub fn new(secret: &[u8]) -> Self {
        let derived = hmac_256(secret, KEY_LABEL);
        let magic_bytes = hmac_256(&derived, MAGIC_LABEL);
        let magic = u32::from_le_bytes(magic_bytes[28..32].try_into().expect("4 bytes"));
        let cipher = Aes128Gcm::new(Key::<Aes128Gcm>::from_slice(&derived[..16]));
        let low = random_low31();
        Self {
            cipher,
            magic,
            startup_low: AtomicU32::new(low),
            current: AtomicU32::new(low),
        }
    }

    /// Allocate the next outgoing sequence, re-anchoring on 31-bit overflow.
    pub fn next_sequence(&self) -> u32 {
        let seq = self.current.fetch_add(1, Ordering::AcqRel).wrapping_add(1);
        if seq & 0x8000_0000 != 0 {
            let fresh = random_low31();
            self.startup_low.store(fresh, Ordering::SeqCst);
            self.current.store(fresh, Ordering::SeqCst);
            return fresh;
        }
        seq
    }

    /// Whether an inbound response sequence falls inside the replay window.
    pub fn sequence_in_window(&self, seq: u32) -> bool {
        let low = self.startup_low.load(Ordering::Acquire);
        let cur = self.current.load(Ordering::Acquire);
        low <= seq && seq <= cur
    }

    /// Encrypt one message into a wire frame.
    pub fn encode_frame(&self, msg: &CacheMessage) -> Vec<u8> {
        let plain = msg.encode();
        let mut iv = [0u8; IV_LEN];
        rand::RngCore::fill_bytes(&mut rand::rng(), &mut iv);
        let sealed = self
            .cipher
            .encrypt(Nonce::from_slice(&iv[..12]), plain.as_ref())
            .expect("AES-GCM encryption cannot fail for fixed-size input");
        debug_assert_eq!(sealed.len(), MESSAGE_LEN + TAG_LEN);
        let (ciphertext, tag) = sealed.split_at(MESSAGE_LEN);

        let crc = salted_crc(self.magic, &[ciphertext, &iv, tag]);
        let mut frame = Vec::with_capacity(FRAME_LEN);
        frame.extend_from_slice(&iv);
        frame.extend_from_slice(ciphertext);
        frame.extend_from_slice(tag);
        frame.extend_from_slice(&crc.to_le_bytes());
        frame
    }

    /// Verify and decrypt a wire frame: length, checksum, AES-GCM, field
    /// ranges, then the sequence window for response kinds.
    pub fn decode_frame(&self, frame: &[u8]) -> Result<CacheMessage, DecodeError> {
        if frame.len() != FRAME_LEN {
            return Err(DecodeError::Len);
        }
        let iv = &frame[..IV_LEN];
        let ciphertext = &frame[IV_LEN..IV_LEN + MESSAGE_LEN];
        let tag = &frame[IV_LEN + MESSAGE_LEN..IV_LEN + MESSAGE_LEN + TAG_LEN];
        let crc = u32::from_le_bytes(frame[FRAME_LEN - CRC_LEN..].try_into().expect("4 bytes"));
        if salted_crc(self.magic, &[ciphertext, iv, tag]) != crc {
            return Err(DecodeError::Crc);
        }
        let plain = self
            .cipher
            .decrypt(Nonce::from_slice(&iv[..12]), &frame[IV_LEN..IV_LEN + MESSAGE_LEN + TAG_LEN])
            .map_err(|_| DecodeError::Aes)?;
        let msg = CacheMessage::decode(&plain)?;
        if msg.kind.is_response() && !self.sequence_in_window(msg.seq) {
            return Err(DecodeError::Seq);
        }
        Ok(msg)
    }

    /// Encode a message as an `Authorization: Bearer` value.
    pub fn encode_bearer(&self, msg: &CacheMessage) -> String {
        URL_SAFE_NO_PAD.encode(self.encode_frame(msg))
    }

    /// Decode a bearer, requiring the embedded kind to match `expected`.
    pub fn decode_bearer(
        &self,
        bearer: &str,
        expected: MessageKind,
    ) -> Result<CacheMessage, DecodeError> {
        if bearer.len() != BEARER_LEN {
            return Err(DecodeError::BearerLen);
        }
        let frame = URL_SAFE_NO_PAD.decode(bearer).map_err(|_| DecodeError::Base64)?;
        let msg = self.decode_frame(&frame)?;
        if msg.kind != expected {
            return Err(DecodeError::BearerKind);
        }
        Ok(msg)
    }
}
