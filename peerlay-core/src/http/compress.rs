//! Content-coding registry
//!
//! Request bodies arriving with a recognized `Content-Encoding` are decoded
//! in place before dispatch; eligible in-memory response bodies are encoded
//! when the client advertised support. Only gzip ships by default; callers
//! may register additional codings.

use std::io::{Read, Write};

use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;

/// Response bodies below this many bytes are never compressed
pub const MIN_COMPRESS_SIZE: usize = 1024;

type CodecFn = fn(&[u8]) -> std::io::Result<Vec<u8>>;

/// One registered content coding
pub struct ContentCoding {
    pub name: &'static str,
    pub compress: CodecFn,
    pub decompress: CodecFn,
}

fn gzip_compress(data: &[u8]) -> std::io::Result<Vec<u8>> {
    let mut encoder = GzEncoder::new(Vec::with_capacity(data.len() / 2), Compression::fast());
    encoder.write_all(data)?;
    encoder.finish()
}

fn gzip_decompress(data: &[u8]) -> std::io::Result<Vec<u8>> {
    let mut out = Vec::with_capacity(data.len() * 2);
    GzDecoder::new(data).read_to_end(&mut out)?;
    Ok(out)
}

pub struct CompressRegistry {
    codings: Vec<ContentCoding>,
}

impl Default for CompressRegistry {
    fn default() -> Self {
        Self {
            codings: vec![ContentCoding {
                name: "gzip",
                compress: gzip_compress,
                decompress: gzip_decompress,
            }],
        }
    }
}

impl CompressRegistry {
    pub fn register(&mut self, coding: ContentCoding) {
        self.codings.retain(|c| c.name != coding.name);
        self.codings.push(coding);
    }

    fn find(&self, name: &str) -> Option<&ContentCoding> {
        self.codings.iter().find(|c| c.name.eq_ignore_ascii_case(name))
    }

    /// Decode a request body. `None` means the coding is unknown and the
    /// body should be left untouched.
    pub fn decode(&self, coding: &str, body: &[u8]) -> Option<std::io::Result<Vec<u8>>> {
        self.find(coding).map(|c| (c.decompress)(body))
    }

    /// Pick the first registered coding the client's `Accept-Encoding`
    /// value advertises.
    pub fn negotiate(&self, accept_encoding: &str) -> Option<&ContentCoding> {
        for token in accept_encoding.split(',') {
            let token = token.trim();
            let name = token.split(';').next().unwrap_or(token).trim();
            if let Some(c) = self.find(name) {
                return Some(c);
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gzip_round_trip() {
        let reg = CompressRegistry::default();
        let data = b"the same line repeated ".repeat(64);
        let packed = gzip_compress(&data).unwrap();
        assert!(packed.len() < data.len());
        let unpacked = reg.decode("gzip", &packed).unwrap().unwrap();
        assert_eq!(unpacked, data);
    }

    #[test]
    fn unknown_coding_is_none() {
        let reg = CompressRegistry::default();
        assert!(reg.decode("zstd", b"x").is_none());
    }

    #[test]
    fn negotiation_parses_qvalues_and_case() {
        let reg = CompressRegistry::default();
        assert!(reg.negotiate("br;q=1.0, GZIP;q=0.8").is_some());
        assert!(reg.negotiate("br, deflate").is_none());
        assert!(reg.negotiate("identity").is_none());
    }

    #[test]
    fn corrupt_gzip_reports_error() {
        let reg = CompressRegistry::default();
        assert!(reg.decode("gzip", b"not gzip at all").unwrap().is_err());
    }
}
