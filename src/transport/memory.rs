//! Channel-backed transport.
//!
//! Every successful `connect` hands a fresh [`MemoryConn`] to the paired
//! [`MemoryPeer`], which plays the remote side.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;

use super::{closed, Transport, TransportCore, TransportStats, TransportStatus};
use crate::error::{Error, Result};
use crate::protocol::Frame;

const CONN_CAPACITY: usize = 256;

#[derive(Default)]
struct PeerShared {
    refuse: AtomicBool,
    connects: AtomicU64,
}

/// The local end of an in-memory connection.
pub struct MemoryTransport {
    name: String,
    core: TransportCore,
    shared: Arc<PeerShared>,
    accept_tx: mpsc::UnboundedSender<MemoryConn>,
    tx: Mutex<Option<mpsc::Sender<Frame>>>,
    rx: tokio::sync::Mutex<Option<(u64, mpsc::Receiver<Frame>)>>,
}

/// Remote control for a [`MemoryTransport`].
pub struct MemoryPeer {
    shared: Arc<PeerShared>,
    accept_rx: mpsc::UnboundedReceiver<MemoryConn>,
}

/// The remote end of one connection.
pub struct MemoryConn {
    pub tx: mpsc::Sender<Frame>,
    pub rx: mpsc::Receiver<Frame>,
}

impl MemoryTransport {
    pub fn new(name: &str) -> (Self, MemoryPeer) {
        let shared = Arc::new(PeerShared::default());
        let (accept_tx, accept_rx) = mpsc::unbounded_channel();
        let transport = Self {
            name: name.to_string(),
            core: TransportCore::new(),
            shared: shared.clone(),
            accept_tx,
            tx: Mutex::new(None),
            rx: tokio::sync::Mutex::new(None),
        };
        (transport, MemoryPeer { shared, accept_rx })
    }
}

impl MemoryPeer {
    /// Wait for the next connection.
    pub async fn accept(&mut self) -> Option<MemoryConn> {
        self.accept_rx.recv().await
    }

    /// Make subsequent connects fail.
    pub fn set_refuse(&self, refuse: bool) {
        self.shared.refuse.store(refuse, Ordering::SeqCst);
    }

    /// Number of connect attempts, failed ones included.
    pub fn connect_attempts(&self) -> u64 {
        self.shared.connects.load(Ordering::SeqCst)
    }
}

impl MemoryConn {
    pub async fn send(&self, frame: Frame) -> bool {
        self.tx.send(frame).await.is_ok()
    }

    pub async fn recv(&mut self) -> Option<Frame> {
        self.rx.recv().await
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn connect(&self) -> Result<()> {
        if self.core.is_terminated() {
            return Err(Error::Terminated);
        }
        self.close().await;
        self.core.set_status(TransportStatus::Connecting);
        self.shared.connects.fetch_add(1, Ordering::SeqCst);
        if self.shared.refuse.load(Ordering::SeqCst) {
            return Err(Error::connection(format!("{} refused", self.name)));
        }

        let (local_tx, remote_rx) = mpsc::channel(CONN_CAPACITY);
        let (remote_tx, local_rx) = mpsc::channel(CONN_CAPACITY);
        self.accept_tx
            .send(MemoryConn {
                tx: remote_tx,
                rx: remote_rx,
            })
            .map_err(|_| Error::connection(format!("{} has no peer", self.name)))?;

        *self.tx.lock() = Some(local_tx);
        *self.rx.lock().await = Some((self.core.epoch(), local_rx));
        self.core.set_status(TransportStatus::Connected);
        Ok(())
    }

    async fn close(&self) {
        if !self.core.is_terminated() {
            self.core.set_status(TransportStatus::Closed);
        }
        self.core.bump_epoch();
        self.tx.lock().take();
        self.rx.lock().await.take();
    }

    async fn terminate(&self) {
        self.close().await;
        self.core.set_status(TransportStatus::Terminated);
    }

    async fn read_frame(&self) -> Result<Frame> {
        let mut cancel = self.core.watch_epoch();
        let mut guard = self.rx.lock().await;
        let (epoch, rx) = guard.as_mut().ok_or(Error::NotConnected)?;
        let epoch = *epoch;
        if epoch != self.core.epoch() {
            return Err(Error::NotConnected);
        }
        tokio::select! {
            frame = rx.recv() => {
                let frame = frame.ok_or_else(|| Error::connection("peer closed"))?;
                self.core.on_recv(frame.encoded_len());
                Ok(frame)
            }
            _ = closed(&mut cancel, epoch) => Err(Error::NotConnected),
        }
    }

    async fn write_frame(&self, frame: &Frame) -> Result<()> {
        let tx = self.tx.lock().clone().ok_or(Error::NotConnected)?;
        if tx.send(frame.clone()).await.is_err() {
            self.core.on_send_error();
            return Err(Error::connection("peer closed"));
        }
        self.core.on_send(frame.encoded_len());
        Ok(())
    }

    fn status(&self) -> TransportStatus {
        self.core.status()
    }

    fn local_addr(&self) -> String {
        format!("{}:local", self.name)
    }

    fn remote_addr(&self) -> String {
        format!("{}:remote", self.name)
    }

    fn statistics(&self) -> TransportStats {
        self.core.stats()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_connect_hands_out_conn() {
        let (t, mut peer) = MemoryTransport::new("mem");
        t.connect().await.unwrap();
        let mut conn = peer.accept().await.unwrap();

        t.write_frame(&Frame::data(vec![1, 2, 3])).await.unwrap();
        assert_eq!(conn.recv().await, Some(Frame::data(vec![1, 2, 3])));

        assert!(conn.send(Frame::data(vec![9])).await);
        assert_eq!(t.read_frame().await.unwrap(), Frame::data(vec![9]));

        // Peer hang-up surfaces as a read error
        drop(conn);
        assert!(t.read_frame().await.is_err());
    }

    #[tokio::test]
    async fn test_refuse_counts_attempts() {
        let (t, peer) = MemoryTransport::new("mem");
        peer.set_refuse(true);
        assert!(t.connect().await.is_err());
        assert!(t.connect().await.is_err());
        assert_eq!(peer.connect_attempts(), 2);
        assert_eq!(t.status(), TransportStatus::Connecting);
    }
}
