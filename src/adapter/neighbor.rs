//! IPv4 → MAC table used by the adapter in TUN mode.

use parking_lot::RwLock;
use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;

use crate::packet::{format_mac, MacAddr};

/// Age at which an entry is dropped.
pub const NEIGHBOR_TIMEOUT: Duration = Duration::from_secs(180);

/// Lead time before expiry at which refresh probes start.
pub const NEIGHBOR_INTERVAL: Duration = Duration::from_secs(60);

/// Period of the expiry/probe ticker.
pub const NEIGHBOR_TICK: Duration = Duration::from_secs(5);

/// A learned neighbor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Neighbor {
    pub hw_addr: MacAddr,
    pub ip_addr: Ipv4Addr,
    /// Last time the entry was confirmed.
    pub uptime: Instant,
    /// First time the entry was learned.
    pub learned: Instant,
}

/// Neighbor table with expiry and refresh probing.
///
/// All methods take an explicit `now` so callers decide the clock.
#[derive(Debug)]
pub struct NeighborCache {
    entries: RwLock<HashMap<Ipv4Addr, Neighbor>>,
    timeout: Duration,
    interval: Duration,
}

impl Default for NeighborCache {
    fn default() -> Self {
        Self::new(NEIGHBOR_TIMEOUT, NEIGHBOR_INTERVAL)
    }
}

impl NeighborCache {
    pub fn new(timeout: Duration, interval: Duration) -> Self {
        Self {
            entries: RwLock::new(HashMap::with_capacity(1024)),
            timeout,
            interval,
        }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Learn or refresh `ip` → `mac`.
    pub fn add(&self, ip: Ipv4Addr, mac: MacAddr, now: Instant) {
        let mut entries = self.entries.write();
        entries
            .entry(ip)
            .and_modify(|n| {
                n.hw_addr = mac;
                n.uptime = now;
            })
            .or_insert(Neighbor {
                hw_addr: mac,
                ip_addr: ip,
                uptime: now,
                learned: now,
            });
    }

    /// Look up a live entry. Entries past the timeout are treated as absent
    /// even before the ticker removes them.
    pub fn get(&self, ip: Ipv4Addr, now: Instant) -> Option<Neighbor> {
        let entries = self.entries.read();
        entries
            .get(&ip)
            .filter(|n| now.duration_since(n.uptime) < self.timeout)
            .copied()
    }

    /// Addresses whose entries are close enough to expiry to be probed.
    pub fn probes(&self, now: Instant) -> Vec<Ipv4Addr> {
        let threshold = self.timeout.saturating_sub(self.interval);
        let entries = self.entries.read();
        entries
            .values()
            .filter(|n| {
                let age = now.duration_since(n.uptime);
                age >= threshold && age < self.timeout
            })
            .map(|n| n.ip_addr)
            .collect()
    }

    /// Drop expired entries and return how many were removed.
    pub fn expire(&self, now: Instant) -> usize {
        let mut entries = self.entries.write();
        let before = entries.len();
        entries.retain(|_, n| {
            let keep = now.duration_since(n.uptime) < self.timeout;
            if !keep {
                debug!(ip = %n.ip_addr, mac = %format_mac(&n.hw_addr), "Neighbor expired");
            }
            keep
        });
        before - entries.len()
    }

    pub fn clear(&self) {
        self.entries.write().clear();
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    pub fn list(&self) -> Vec<Neighbor> {
        let mut list: Vec<Neighbor> = self.entries.read().values().copied().collect();
        list.sort_by_key(|n| n.ip_addr);
        list
    }
}
