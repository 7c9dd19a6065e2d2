//! Discovery server selection at handshake time.
//!
//! The client's /24 picks a bucket of candidates (keyed through HMAC so
//! bucket membership cannot be precomputed) and the current hour picks one
//! server within it. Only one server is ever handed out.

use hmac::{Hmac, Mac};
use sha2::Sha256;
use std::fmt;
use std::net::Ipv4Addr;
use std::ops::Range;
use std::time::{SystemTime, UNIX_EPOCH};

type HmacSha256 = Hmac<Sha256>;

const FALLBACK_KEY: &str = "3f1c9a0e7b5d42f8a6c1e9d0b7f35a2c8e4d1b6f09a7c3e5d2f8b1a4c6e0d9f7";

/// Deployment-wide HMAC key. Set `DISCOVERY_HMAC_KEY` at build time to
/// override the built-in value. Never printed.
#[derive(Clone, Copy)]
pub struct DiscoveryKey(&'static [u8]);

impl DiscoveryKey {
    pub const fn new(key: &'static [u8]) -> Self {
        DiscoveryKey(key)
    }

    pub fn deployment() -> Self {
        let key = option_env!("DISCOVERY_HMAC_KEY").unwrap_or(FALLBACK_KEY);
        DiscoveryKey(key.as_bytes())
    }
}

impl fmt::Debug for DiscoveryKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("DiscoveryKey(<redacted>)")
    }
}

/// First byte of the keyed hash of the client's /24 network address.
/// Unparseable addresses are treated as `0.0.0.0`.
pub fn ip_value(key: &DiscoveryKey, client_ip: &str) -> u8 {
    let octets = client_ip
        .trim()
        .parse::<Ipv4Addr>()
        .map(|ip| ip.octets())
        .unwrap_or([0, 0, 0, 0]);
    let network = format!("{}.{}.{}.0", octets[0], octets[1], octets[2]);

    let mut mac = match HmacSha256::new_from_slice(key.0) {
        Ok(mac) => mac,
        // HMAC takes keys of any length.
        Err(_) => return 0,
    };
    mac.update(network.as_bytes());
    mac.finalize().into_bytes()[0]
}

pub fn bucket_count(candidates: usize) -> usize {
    (candidates as f64).sqrt().ceil() as usize
}

/// Contiguous, nearly equal slices with rounded proportional bounds.
pub fn partition(len: usize, buckets: usize) -> Vec<Range<usize>> {
    let division = len as f64 / buckets as f64;
    (0..buckets)
        .map(|i| {
            let start = (division * i as f64).round() as usize;
            let end = (division * (i + 1) as f64).round() as usize;
            start.min(len)..end.min(len)
        })
        .collect()
}

/// Index of the bucket a client is assigned to for `candidates` servers.
pub fn assigned_bucket(key: &DiscoveryKey, client_ip: &str, candidates: usize) -> Option<usize> {
    if candidates == 0 {
        return None;
    }
    Some(ip_value(key, client_ip) as usize % bucket_count(candidates))
}

fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// Picks at most one server for `client_ip`. `time_in_seconds` defaults to
/// the wall clock.
pub fn select_servers_with_key<T: Clone>(
    key: &DiscoveryKey,
    servers: &[T],
    client_ip: &str,
    time_in_seconds: Option<u64>,
) -> Vec<T> {
    let Some(bucket_index) = assigned_bucket(key, client_ip, servers.len()) else {
        return Vec::new();
    };
    let time_value = time_in_seconds.unwrap_or_else(now_secs) / 3600;

    let buckets = partition(servers.len(), bucket_count(servers.len()));
    let bucket = &servers[buckets[bucket_index].clone()];
    if bucket.is_empty() {
        return Vec::new();
    }
    let item = (time_value % bucket.len() as u64) as usize;
    vec![bucket[item].clone()]
}

pub fn select_servers<T: Clone>(
    servers: &[T],
    client_ip: &str,
    time_in_seconds: Option<u64>,
) -> Vec<T> {
    select_servers_with_key(&DiscoveryKey::deployment(), servers, client_ip, time_in_seconds)
}
