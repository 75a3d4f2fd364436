//! Per-source-IP strike counter
//!
//! Every accepted connection from an IP records one strike; once the count
//! passes the configured threshold, further connections from that IP are
//! dropped before any bytes are read. Counts never decay.

use dashmap::DashMap;
use std::net::IpAddr;

pub struct BanTracker {
    strikes: DashMap<IpAddr, u64>,
    threshold: u64,
}

impl BanTracker {
    pub fn new(threshold: u64) -> Self {
        Self {
            strikes: DashMap::new(),
            threshold,
        }
    }

    /// Record a strike for `ip` and return whether it is now banned.
    pub fn tick(&self, ip: IpAddr) -> bool {
        let mut count = self.strikes.entry(ip).or_insert(0);
        *count += 1;
        *count > self.threshold
    }

    /// Strikes recorded so far for `ip`.
    pub fn strikes(&self, ip: IpAddr) -> u64 {
        self.strikes.get(&ip).map(|c| *c).unwrap_or(0)
    }
}
