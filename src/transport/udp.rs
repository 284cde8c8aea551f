//! UDP datagram transport.
//!
//! Each datagram carries exactly one encoded frame. There is no connection
//! handshake, so liveness is approximated with a read idle timeout.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::UdpSocket;
use tracing::{debug, trace};

use super::{closed, Transport, TransportCore, TransportStats, TransportStatus};
use crate::error::{Error, Result};
use crate::protocol::{Frame, HEADER_SIZE};

/// Idle timeout used when none is configured.
const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(120);

pub struct UdpTransport {
    remote: String,
    idle_timeout: Duration,
    max_frame: usize,
    core: TransportCore,
    socket: Mutex<Option<(u64, Arc<UdpSocket>)>>,
}

impl UdpTransport {
    /// `timeout` doubles as the read idle timeout; zero selects the default.
    pub fn new(remote: &str, timeout: Duration, max_frame: usize) -> Self {
        let idle_timeout = if timeout.is_zero() {
            DEFAULT_IDLE_TIMEOUT
        } else {
            timeout
        };
        Self {
            remote: remote.to_string(),
            idle_timeout,
            max_frame,
            core: TransportCore::new(),
            socket: Mutex::new(None),
        }
    }

    fn current(&self) -> Result<(u64, Arc<UdpSocket>)> {
        let guard = self.socket.lock();
        let (epoch, sock) = guard.as_ref().ok_or(Error::NotConnected)?;
        Ok((*epoch, sock.clone()))
    }
}

#[async_trait]
impl Transport for UdpTransport {
    async fn connect(&self) -> Result<()> {
        if self.core.is_terminated() {
            return Err(Error::Terminated);
        }
        self.close().await;
        self.core.set_status(TransportStatus::Connecting);

        let remote = tokio::net::lookup_host(self.remote.as_str())
            .await?
            .next()
            .ok_or_else(|| Error::connection(format!("no address for {}", self.remote)))?;
        let bind = if remote.is_ipv4() { "0.0.0.0:0" } else { "[::]:0" };
        let socket = UdpSocket::bind(bind).await?;
        socket
            .connect(remote)
            .await
            .map_err(|e| Error::connection(format!("UDP connect to {} failed: {}", remote, e)))?;

        debug!(remote = %remote, local = ?socket.local_addr().ok(), "UDP socket ready");
        *self.socket.lock() = Some((self.core.epoch(), Arc::new(socket)));
        self.core.set_status(TransportStatus::Connected);
        Ok(())
    }

    async fn close(&self) {
        if !self.core.is_terminated() {
            self.core.set_status(TransportStatus::Closed);
        }
        self.core.bump_epoch();
        self.socket.lock().take();
    }

    async fn terminate(&self) {
        self.core.set_status(TransportStatus::Terminated);
        self.core.bump_epoch();
        self.socket.lock().take();
    }

    async fn read_frame(&self) -> Result<Frame> {
        let mut cancel = self.core.watch_epoch();
        let (epoch, socket) = self.current()?;
        if epoch != self.core.epoch() {
            return Err(Error::NotConnected);
        }

        let mut buf = vec![0u8; HEADER_SIZE + self.max_frame + 1];
        loop {
            let n = tokio::select! {
                res = tokio::time::timeout(self.idle_timeout, socket.recv(&mut buf)) => {
                    res.map_err(|_| Error::Timeout)??
                }
                _ = closed(&mut cancel, epoch) => return Err(Error::NotConnected),
            };
            self.core.on_recv(n);
            match Frame::decode(&buf[..n], self.max_frame) {
                Ok(frame) => return Ok(frame),
                Err(e) => {
                    // A bad datagram only costs itself.
                    self.core.on_drop();
                    trace!(error = %e, bytes = n, "Dropping malformed datagram");
                }
            }
        }
    }

    async fn write_frame(&self, frame: &Frame) -> Result<()> {
        let mut encoded = bytes::BytesMut::with_capacity(frame.encoded_len());
        frame.encode_into(&mut encoded, self.max_frame)?;
        let (_, socket) = self.current()?;
        match socket.send(&encoded).await {
            Ok(n) => {
                self.core.on_send(n);
                Ok(())
            }
            Err(e) => {
                self.core.on_send_error();
                Err(e.into())
            }
        }
    }

    fn status(&self) -> TransportStatus {
        self.core.status()
    }

    fn local_addr(&self) -> String {
        self.socket
            .lock()
            .as_ref()
            .and_then(|(_, s)| s.local_addr().ok())
            .map(|a| a.to_string())
            .unwrap_or_default()
    }

    fn remote_addr(&self) -> String {
        self.remote.clone()
    }

    fn statistics(&self) -> TransportStats {
        self.core.stats()
    }
}
