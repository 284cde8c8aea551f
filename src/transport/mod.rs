//! Frame transports.
//!
//! A session only needs an object that can connect, close and move whole
//! frames; how those frames travel is up to the implementation:
//! - [`TcpTransport`]: stream transport, frames reassembled by `FrameCodec`
//! - [`UdpTransport`]: one frame per datagram with a read idle timeout
//! - [`MemoryTransport`]: channel-backed, for tests and in-process wiring

mod memory;
mod tcp;
mod udp;

pub use memory::{MemoryConn, MemoryPeer, MemoryTransport};
pub use tcp::TcpTransport;
pub use udp::UdpTransport;

use async_trait::async_trait;
use serde::Serialize;
use std::fmt;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

use crate::config::TransportProtocol;
use crate::error::Result;
use crate::protocol::Frame;

/// Connection state of a transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportStatus {
    Init,
    Connecting,
    Connected,
    Closed,
    Terminated,
}

impl fmt::Display for TransportStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportStatus::Init => write!(f, "init"),
            TransportStatus::Connecting => write!(f, "connecting"),
            TransportStatus::Connected => write!(f, "connected"),
            TransportStatus::Closed => write!(f, "closed"),
            TransportStatus::Terminated => write!(f, "terminated"),
        }
    }
}

impl TransportStatus {
    fn from_u8(v: u8) -> Self {
        match v {
            1 => Self::Connecting,
            2 => Self::Connected,
            3 => Self::Closed,
            4 => Self::Terminated,
            _ => Self::Init,
        }
    }
}

/// Traffic counters of a transport.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct TransportStats {
    pub send_bytes: u64,
    pub recv_bytes: u64,
    pub send_errors: u64,
    pub drops: u64,
}

/// A connection that moves whole frames.
///
/// Methods take `&self`: one task reads while another writes, and `close`
/// must unblock a pending `read_frame`.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Establish a fresh connection, replacing any previous one.
    async fn connect(&self) -> Result<()>;

    /// Close the current connection. A later `connect` may reopen it.
    async fn close(&self);

    /// Close for good.
    async fn terminate(&self);

    /// Wait for the next frame.
    async fn read_frame(&self) -> Result<Frame>;

    /// Send one frame.
    async fn write_frame(&self, frame: &Frame) -> Result<()>;

    fn status(&self) -> TransportStatus;

    fn local_addr(&self) -> String;

    fn remote_addr(&self) -> String;

    fn statistics(&self) -> TransportStats;
}

/// Build the client transport selected by configuration.
pub fn connector(
    protocol: TransportProtocol,
    remote: &str,
    timeout: Duration,
    max_frame: usize,
) -> Arc<dyn Transport> {
    match protocol {
        TransportProtocol::Tcp => Arc::new(TcpTransport::new(remote, timeout, max_frame)),
        TransportProtocol::Udp => Arc::new(UdpTransport::new(remote, timeout, max_frame)),
    }
}

/// State and counters shared by the transport implementations.
#[derive(Debug)]
pub(crate) struct TransportCore {
    status: AtomicU8,
    send_bytes: AtomicU64,
    recv_bytes: AtomicU64,
    send_errors: AtomicU64,
    drops: AtomicU64,
    /// Bumped on every close; readers holding an older value give up.
    epoch: watch::Sender<u64>,
}

impl TransportCore {
    pub(crate) fn new() -> Self {
        let (epoch, _) = watch::channel(0);
        Self {
            status: AtomicU8::new(TransportStatus::Init as u8),
            send_bytes: AtomicU64::new(0),
            recv_bytes: AtomicU64::new(0),
            send_errors: AtomicU64::new(0),
            drops: AtomicU64::new(0),
            epoch,
        }
    }

    pub(crate) fn status(&self) -> TransportStatus {
        TransportStatus::from_u8(self.status.load(Ordering::Acquire))
    }

    pub(crate) fn set_status(&self, status: TransportStatus) {
        self.status.store(status as u8, Ordering::Release);
    }

    pub(crate) fn is_terminated(&self) -> bool {
        self.status() == TransportStatus::Terminated
    }

    pub(crate) fn epoch(&self) -> u64 {
        *self.epoch.borrow()
    }

    pub(crate) fn bump_epoch(&self) -> u64 {
        self.epoch.send_modify(|e| *e += 1);
        self.epoch()
    }

    pub(crate) fn watch_epoch(&self) -> watch::Receiver<u64> {
        self.epoch.subscribe()
    }

    pub(crate) fn on_send(&self, bytes: usize) {
        self.send_bytes.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub(crate) fn on_recv(&self, bytes: usize) {
        self.recv_bytes.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub(crate) fn on_send_error(&self) {
        self.send_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn on_drop(&self) {
        self.drops.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn stats(&self) -> TransportStats {
        TransportStats {
            send_bytes: self.send_bytes.load(Ordering::Relaxed),
            recv_bytes: self.recv_bytes.load(Ordering::Relaxed),
            send_errors: self.send_errors.load(Ordering::Relaxed),
            drops: self.drops.load(Ordering::Relaxed),
        }
    }
}

/// Resolve when the epoch moves away from `seen`.
pub(crate) async fn closed(rx: &mut watch::Receiver<u64>, seen: u64) {
    loop {
        if *rx.borrow_and_update() != seen {
            return;
        }
        if rx.changed().await.is_err() {
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_display() {
        assert_eq!(TransportStatus::Connected.to_string(), "connected");
        assert_eq!(TransportStatus::from_u8(4), TransportStatus::Terminated);
        assert_eq!(TransportStatus::from_u8(200), TransportStatus::Init);
    }

    #[test]
    fn test_core_counters() {
        let core = TransportCore::new();
        core.on_send(10);
        core.on_send(5);
        core.on_recv(7);
        core.on_send_error();
        core.on_drop();
        let stats = core.stats();
        assert_eq!(stats.send_bytes, 15);
        assert_eq!(stats.recv_bytes, 7);
        assert_eq!(stats.send_errors, 1);
        assert_eq!(stats.drops, 1);
    }

    #[tokio::test]
    async fn test_epoch_wakes_reader() {
        let core = Arc::new(TransportCore::new());
        let seen = core.epoch();
        let mut rx = core.watch_epoch();

        let waiter = tokio::spawn(async move { closed(&mut rx, seen).await });
        tokio::task::yield_now().await;
        assert_eq!(core.bump_epoch(), seen + 1);
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
    }
}
