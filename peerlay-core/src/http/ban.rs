//! Time-bucketed IP ban sets
//!
//! A ring of buckets, one per rotation tick. Banning inserts the address
//! into the current bucket; each `rotate` advances the ring and clears the
//! bucket that falls off, so every entry survives between `ttl_ticks - 1`
//! and `ttl_ticks` rotations. Two instances run in a node: the HTTP-level
//! set is rotated once per second by the accept loop, the UDP-level set is
//! rotated by the coordinator's idle hook.

use std::collections::HashSet;
use std::net::IpAddr;
use std::sync::Mutex;

pub struct BanList {
    inner: Mutex<Inner>,
}

struct Inner {
    buckets: Vec<HashSet<IpAddr>>,
    cursor: usize,
}

impl BanList {
    /// `ttl_ticks` is the number of rotations an entry survives.
    pub fn new(ttl_ticks: usize) -> Self {
        let count = ttl_ticks.max(1) + 1;
        Self {
            inner: Mutex::new(Inner { buckets: vec![HashSet::new(); count], cursor: 0 }),
        }
    }

    /// Add `ip` to the current bucket.
    pub fn ban(&self, ip: IpAddr) {
        let mut inner = self.inner.lock().expect("ban list lock poisoned");
        let cursor = inner.cursor;
        inner.buckets[cursor].insert(ip);
    }

    pub fn is_banned(&self, ip: &IpAddr) -> bool {
        let inner = self.inner.lock().expect("ban list lock poisoned");
        inner.buckets.iter().any(|b| b.contains(ip))
    }

    /// Advance the ring by one tick, expiring the oldest bucket.
    pub fn rotate(&self) {
        let mut inner = self.inner.lock().expect("ban list lock poisoned");
        let next = (inner.cursor + 1) % inner.buckets.len();
        inner.buckets[next].clear();
        inner.cursor = next;
    }

    /// Number of currently banned addresses (across all buckets)
    pub fn len(&self) -> usize {
        let inner = self.inner.lock().expect("ban list lock poisoned");
        inner.buckets.iter().map(HashSet::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        let mut inner = self.inner.lock().expect("ban list lock poisoned");
        for bucket in &mut inner.buckets {
            bucket.clear();
        }
    }
}
