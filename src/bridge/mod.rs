//! Learning Ethernet bridge used by the switch.
//!
//! Each tenant network gets one [`LearningBridge`]; authenticated clients
//! are attached to it as [`Port`]s. The bridge learns source MACs, forwards
//! known unicast destinations to their port and floods everything else.

mod registry;

pub use registry::Registry;

use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, info_span, trace, warn, Instrument};

use crate::error::Result;
use crate::packet::{format_mac, is_multicast, MacAddr, HEADER_SIZE};

/// Forwarding table aging.
pub const MAC_TIMEOUT: Duration = Duration::from_secs(300);

/// Period of the aging sweep.
pub const AGING_TICK: Duration = Duration::from_secs(5);

pub type PortId = u64;

/// Something the bridge can deliver frames to.
///
/// `send` must not block: a full or closed port returns an error and the
/// frame is dropped.
pub trait Port: Send + Sync {
    fn id(&self) -> PortId;

    fn is_up(&self) -> bool;

    fn send(&self, frame: Bytes) -> Result<()>;
}

/// One forwarding table entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FdbEntry {
    pub mac: MacAddr,
    pub port: PortId,
    /// Last time the MAC was seen.
    pub uptime: Instant,
    pub learned: Instant,
}

/// Bridge counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct BridgeStats {
    pub recv: u64,
    pub sent: u64,
    pub drops: u64,
}

#[derive(Default)]
struct Tables {
    ports: HashMap<PortId, Arc<dyn Port>>,
    fdb: HashMap<MacAddr, FdbEntry>,
}

#[derive(Default)]
struct Counters {
    recv: AtomicU64,
    sent: AtomicU64,
    drops: AtomicU64,
}

pub struct LearningBridge {
    name: String,
    mac_timeout: Duration,
    tables: RwLock<Tables>,
    stats: Counters,
    done: watch::Sender<bool>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl LearningBridge {
    pub fn new(name: &str, mac_timeout: Duration) -> Self {
        let (done, _) = watch::channel(false);
        Self {
            name: name.to_string(),
            mac_timeout,
            tables: RwLock::new(Tables::default()),
            stats: Counters::default(),
            done,
            task: Mutex::new(None),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Spawn the aging sweep.
    pub fn start(self: &Arc<Self>) {
        let mut task = self.task.lock();
        if task.is_some() {
            return;
        }
        let bridge = Arc::clone(self);
        let mut done = self.done.subscribe();
        let span = info_span!("bridge", name = %self.name);
        *task = Some(tokio::spawn(
            async move {
                let mut ticker = tokio::time::interval(AGING_TICK);
                ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
                loop {
                    tokio::select! {
                        _ = done.changed() => break,
                        _ = ticker.tick() => {
                            bridge.expire(Instant::now());
                        }
                    }
                }
                debug!("Aging stopped");
            }
            .instrument(span),
        ));
    }

    pub async fn stop(&self) {
        let _ = self.done.send(true);
        let task = self.task.lock().take();
        if let Some(task) = task {
            let _ = task.await;
        }
    }

    pub fn add_port(&self, port: Arc<dyn Port>) {
        let id = port.id();
        self.tables.write().ports.insert(id, port);
        info!(bridge = %self.name, port = id, "Port added");
    }

    /// Detach a port and forget the MACs learned on it.
    pub fn remove_port(&self, id: PortId) {
        let mut tables = self.tables.write();
        if tables.ports.remove(&id).is_none() {
            return;
        }
        tables.fdb.retain(|_, entry| entry.port != id);
        info!(bridge = %self.name, port = id, "Port removed");
    }

    pub fn port_count(&self) -> usize {
        self.tables.read().ports.len()
    }

    /// Learn from and forward one Ethernet frame received on `ingress`.
    pub fn input(&self, frame: &Bytes, ingress: PortId) {
        self.stats.recv.fetch_add(1, Ordering::Relaxed);
        if frame.len() < HEADER_SIZE {
            self.stats.drops.fetch_add(1, Ordering::Relaxed);
            trace!(bridge = %self.name, len = frame.len(), "Runt frame");
            return;
        }
        self.learn(frame, ingress, Instant::now());
        self.forward(frame, ingress);
    }

    fn learn(&self, frame: &[u8], ingress: PortId, now: Instant) {
        let mut src: MacAddr = [0; 6];
        src.copy_from_slice(&frame[6..12]);
        if is_multicast(&src) {
            return;
        }

        let mut tables = self.tables.write();
        match tables.fdb.get_mut(&src) {
            Some(entry) => {
                entry.uptime = now;
                entry.port = ingress;
            }
            None => {
                debug!(bridge = %self.name, mac = %format_mac(&src), port = ingress, "Learned");
                tables.fdb.insert(
                    src,
                    FdbEntry {
                        mac: src,
                        port: ingress,
                        uptime: now,
                        learned: now,
                    },
                );
            }
        }
    }

    fn forward(&self, frame: &Bytes, ingress: PortId) {
        let mut dst: MacAddr = [0; 6];
        dst.copy_from_slice(&frame[0..6]);

        let (unicast, flood) = {
            let tables = self.tables.read();
            let target = tables
                .fdb
                .get(&dst)
                .and_then(|entry| tables.ports.get(&entry.port))
                .filter(|port| port.id() != ingress && port.is_up())
                .cloned();
            match target {
                Some(port) => (Some(port), Vec::new()),
                None => {
                    let others: Vec<Arc<dyn Port>> = tables
                        .ports
                        .values()
                        .filter(|port| port.id() != ingress)
                        .cloned()
                        .collect();
                    (None, others)
                }
            }
        };

        if let Some(port) = unicast {
            match port.send(frame.clone()) {
                Ok(()) => {
                    self.stats.sent.fetch_add(1, Ordering::Relaxed);
                }
                Err(e) => {
                    self.stats.drops.fetch_add(1, Ordering::Relaxed);
                    debug!(bridge = %self.name, port = port.id(), error = %e, "Unicast dropped");
                }
            }
            return;
        }

        for port in flood {
            match port.send(frame.clone()) {
                Ok(()) => {
                    self.stats.sent.fetch_add(1, Ordering::Relaxed);
                }
                Err(e) => warn!(bridge = %self.name, port = port.id(), error = %e, "Flood failed"),
            }
        }
    }

    /// Evict entries unseen for longer than the MAC timeout.
    pub fn expire(&self, now: Instant) -> usize {
        let mut tables = self.tables.write();
        let before = tables.fdb.len();
        tables
            .fdb
            .retain(|_, entry| now.duration_since(entry.uptime) <= self.mac_timeout);
        let removed = before - tables.fdb.len();
        if removed > 0 {
            debug!(bridge = %self.name, removed, "Expired forwarding entries");
        }
        removed
    }

    pub fn lookup(&self, mac: &MacAddr) -> Option<FdbEntry> {
        self.tables.read().fdb.get(mac).copied()
    }

    /// Snapshot of the forwarding table.
    pub fn fdb(&self) -> Vec<FdbEntry> {
        let mut entries: Vec<FdbEntry> = self.tables.read().fdb.values().copied().collect();
        entries.sort_by_key(|e| e.mac);
        entries
    }

    pub fn stats(&self) -> BridgeStats {
        BridgeStats {
            recv: self.stats.recv.load(Ordering::Relaxed),
            sent: self.stats.sent.load(Ordering::Relaxed),
            drops: self.stats.drops.load(Ordering::Relaxed),
        }
    }
}
