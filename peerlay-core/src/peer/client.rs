//! Peer HTTP download client
//!
//! Thin wrapper over a blocking `reqwest` client tuned for subnet
//! neighbors: 500 ms to connect, a few seconds for the whole request,
//! streamed body reads, and a caller-configured byte-per-second clamp so
//! one transfer cannot saturate the link.

use std::io::{Read, Write};
use std::time::{Duration, Instant};

use crate::config::PeerCacheSettings;

use super::CacheError;

pub struct PeerClient {
    http: reqwest::blocking::Client,
    /// Outbound clamp in bytes per second; 0 disables pacing
    limit_bps: u64,
}

impl PeerClient {
    pub fn new(settings: &PeerCacheSettings) -> Result<Self, CacheError> {
        let http = reqwest::blocking::Client::builder()
            .connect_timeout(Duration::from_millis(500))
            .timeout(settings.http_timeout())
            .danger_accept_invalid_certs(settings.options.self_signed_https)
            .build()
            .map_err(|e| CacheError::Transport(e.to_string()))?;
        Ok(Self { http, limit_bps: u64::from(settings.limit_mbps) * 1_000_000 })
    }

    /// GET `url` with a peer bearer, streaming the body into `out`.
    ///
    /// Returns the HTTP status and the bytes copied. Non-2xx statuses
    /// return without touching `out`.
    pub fn fetch(
        &self,
        url: &str,
        bearer: &str,
        range: Option<(u64, u64)>,
        out: &mut dyn Write,
    ) -> Result<(u16, u64), CacheError> {
        let mut request = self.http.get(url).header("Authorization", format!("Bearer {}", bearer));
        if let Some((start, end)) = range {
            request = request.header("Range", format!("bytes={}-{}", start, end));
        }
        let response = request.send().map_err(|e| CacheError::Transport(e.to_string()))?;
        let status = response.status().as_u16();
        if status != 200 && status != 206 {
            return Ok((status, 0));
        }
        let copied = self.copy_paced(response, out)?;
        Ok((status, copied))
    }

    /// Plain GET without a bearer, for direct-mode origin fetches.
    pub fn fetch_direct(&self, url: &str, out: &mut dyn Write) -> Result<(u16, u64), CacheError> {
        let response =
            self.http.get(url).send().map_err(|e| CacheError::Transport(e.to_string()))?;
        let status = response.status().as_u16();
        if status != 200 && status != 206 {
            return Ok((status, 0));
        }
        let copied = self.copy_paced(response, out)?;
        Ok((status, copied))
    }

    fn copy_paced<R: Read>(&self, mut source: R, out: &mut dyn Write) -> Result<u64, CacheError> {
        let mut buf = vec![0u8; 64 * 1024];
        let mut copied = 0u64;
        let started = Instant::now();
        loop {
            let n = source.read(&mut buf).map_err(CacheError::Io)?;
            if n == 0 {
                break;
            }
            out.write_all(&buf[..n]).map_err(CacheError::Io)?;
            copied += n as u64;
            if self.limit_bps > 0 {
                // Sleep off any head start over the configured rate
                let due = Duration::from_secs_f64(copied as f64 / self.limit_bps as f64);
                let elapsed = started.elapsed();
                if due > elapsed {
                    std::thread::sleep(due - elapsed);
                }
            }
        }
        out.flush().map_err(CacheError::Io)?;
        Ok(copied)
    }
}
