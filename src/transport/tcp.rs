//! TCP stream transport.

use async_trait::async_trait;
use bytes::BytesMut;
use parking_lot::Mutex;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tracing::{debug, trace};

use super::{closed, Transport, TransportCore, TransportStats, TransportStatus};
use crate::error::{Error, Result};
use crate::protocol::{Frame, FrameCodec};

/// Receive buffer size for a single socket read.
const READ_CHUNK: usize = 16 * 1024;

struct ReadSide {
    epoch: u64,
    stream: OwnedReadHalf,
    codec: FrameCodec,
    pending: std::collections::VecDeque<Frame>,
}

/// A frame transport over one TCP connection.
///
/// A client transport (`new`) can reconnect; a server-side transport
/// (`from_stream`) wraps an accepted socket and cannot.
pub struct TcpTransport {
    remote: String,
    timeout: Duration,
    max_frame: usize,
    core: TransportCore,
    reader: tokio::sync::Mutex<Option<ReadSide>>,
    writer: tokio::sync::Mutex<Option<OwnedWriteHalf>>,
    local_addr: Mutex<String>,
}

impl TcpTransport {
    /// Create an unconnected client transport for `remote` (`host:port`).
    pub fn new(remote: &str, timeout: Duration, max_frame: usize) -> Self {
        Self {
            remote: remote.to_string(),
            timeout,
            max_frame,
            core: TransportCore::new(),
            reader: tokio::sync::Mutex::new(None),
            writer: tokio::sync::Mutex::new(None),
            local_addr: Mutex::new(String::new()),
        }
    }

    /// Wrap an already connected stream.
    pub fn from_stream(stream: TcpStream, max_frame: usize) -> Result<Self> {
        let remote = stream.peer_addr()?.to_string();
        let mut transport = Self::new(&remote, Duration::ZERO, max_frame);
        let (reader, writer) = transport.split(stream)?;
        transport.reader = tokio::sync::Mutex::new(Some(reader));
        transport.writer = tokio::sync::Mutex::new(Some(writer));
        transport.core.set_status(TransportStatus::Connected);
        Ok(transport)
    }

    fn split(&self, stream: TcpStream) -> Result<(ReadSide, OwnedWriteHalf)> {
        stream.set_nodelay(true)?;
        *self.local_addr.lock() = stream.local_addr()?.to_string();

        let (rd, wr) = stream.into_split();
        let reader = ReadSide {
            epoch: self.core.epoch(),
            stream: rd,
            codec: FrameCodec::new(self.max_frame),
            pending: Default::default(),
        };
        Ok((reader, wr))
    }

    async fn drop_halves(&self) {
        if let Some(mut wr) = self.writer.lock().await.take() {
            let _ = wr.shutdown().await;
        }
        self.reader.lock().await.take();
    }
}

#[async_trait]
impl Transport for TcpTransport {
    async fn connect(&self) -> Result<()> {
        if self.core.is_terminated() {
            return Err(Error::Terminated);
        }
        self.close().await;
        self.core.set_status(TransportStatus::Connecting);
        debug!(remote = %self.remote, "Connecting");

        let connect = TcpStream::connect(self.remote.as_str());
        let stream = if self.timeout.is_zero() {
            connect.await
        } else {
            tokio::time::timeout(self.timeout, connect)
                .await
                .map_err(|_| Error::Timeout)?
        }
        .map_err(|e| Error::connection(format!("TCP connect to {} failed: {}", self.remote, e)))?;

        let (reader, writer) = self.split(stream)?;
        *self.reader.lock().await = Some(reader);
        *self.writer.lock().await = Some(writer);
        self.core.set_status(TransportStatus::Connected);
        debug!(remote = %self.remote, local = %self.local_addr(), "Connected");
        Ok(())
    }

    async fn close(&self) {
        if !self.core.is_terminated() {
            self.core.set_status(TransportStatus::Closed);
        }
        self.core.bump_epoch();
        self.drop_halves().await;
    }

    async fn terminate(&self) {
        self.core.set_status(TransportStatus::Terminated);
        self.core.bump_epoch();
        self.drop_halves().await;
    }

    async fn read_frame(&self) -> Result<Frame> {
        let mut cancel = self.core.watch_epoch();
        let mut guard = self.reader.lock().await;
        let side = guard.as_mut().ok_or(Error::NotConnected)?;
        if side.epoch != self.core.epoch() {
            return Err(Error::NotConnected);
        }
        let epoch = side.epoch;

        let mut buf = BytesMut::with_capacity(READ_CHUNK);
        loop {
            if let Some(frame) = side.pending.pop_front() {
                return Ok(frame);
            }
            buf.clear();
            let n = tokio::select! {
                res = side.stream.read_buf(&mut buf) => res?,
                _ = closed(&mut cancel, epoch) => return Err(Error::NotConnected),
            };
            if n == 0 {
                return Err(Error::connection("connection closed by peer"));
            }
            self.core.on_recv(n);
            let frames = side.codec.feed(&buf[..n])?;
            for _ in 0..side.codec.take_dropped() {
                self.core.on_drop();
            }
            trace!(bytes = n, frames = frames.len(), "Read from socket");
            side.pending.extend(frames);
        }
    }

    async fn write_frame(&self, frame: &Frame) -> Result<()> {
        let mut encoded = BytesMut::with_capacity(frame.encoded_len());
        frame.encode_into(&mut encoded, self.max_frame)?;

        let mut guard = self.writer.lock().await;
        let wr = guard.as_mut().ok_or(Error::NotConnected)?;
        match wr.write_all(&encoded).await {
            Ok(()) => {
                self.core.on_send(encoded.len());
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
        self.local_addr.lock().clone()
    }

    fn remote_addr(&self) -> String {
        self.remote.clone()
    }

    fn statistics(&self) -> TransportStats {
        self.core.stats()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{Action, DEFAULT_MAX_SIZE};
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn test_frames_over_loopback() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();

        let server = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let t = TcpTransport::from_stream(stream, DEFAULT_MAX_SIZE).unwrap();
            let frame = t.read_frame().await.unwrap();
            t.write_frame(&frame).await.unwrap();
            t.write_frame(&Frame::data(vec![1u8; 300])).await.unwrap();
            t
        });

        let client = TcpTransport::new(&addr, Duration::from_secs(5), DEFAULT_MAX_SIZE);
        client.connect().await.unwrap();
        assert_eq!(client.status(), TransportStatus::Connected);

        let ping = Frame::control(Action::PingReq, &b"{}"[..]);
        client.write_frame(&ping).await.unwrap();
        assert_eq!(client.read_frame().await.unwrap(), ping);
        assert_eq!(client.read_frame().await.unwrap(), Frame::data(vec![1u8; 300]));

        let stats = client.statistics();
        assert_eq!(stats.send_bytes, ping.encoded_len() as u64);
        assert!(stats.recv_bytes >= 300);
        let _server = server.await.unwrap();
    }

    #[tokio::test]
    async fn test_unknown_action_keeps_stream_usable() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();

        let data = Frame::data(vec![3u8; 20]);
        let pong = Frame::control(Action::PongResp, &b"{}"[..]);
        let mut wire = Vec::new();
        wire.extend_from_slice(&data.encode().unwrap());
        wire.extend_from_slice(&[0x00, 0x08, crate::protocol::FLAG_CONTROL]);
        wire.extend_from_slice(b"nego= {}");
        wire.extend_from_slice(&pong.encode().unwrap());

        let server = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            stream.write_all(&wire).await.unwrap();
            stream
        });

        let client = TcpTransport::new(&addr, Duration::from_secs(5), DEFAULT_MAX_SIZE);
        client.connect().await.unwrap();
        let _peer = server.await.unwrap();

        assert_eq!(client.read_frame().await.unwrap(), data);
        assert_eq!(client.read_frame().await.unwrap(), pong);
        assert_eq!(client.status(), TransportStatus::Connected);
        assert_eq!(client.statistics().drops, 1);
    }

    #[tokio::test]
    async fn test_close_unblocks_reader() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let accept = tokio::spawn(async move { listener.accept().await.unwrap() });

        let client = std::sync::Arc::new(TcpTransport::new(
            &addr,
            Duration::from_secs(5),
            DEFAULT_MAX_SIZE,
        ));
        client.connect().await.unwrap();
        let _peer = accept.await.unwrap();

        let reader = {
            let client = client.clone();
            tokio::spawn(async move { client.read_frame().await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        client.close().await;

        let res = tokio::time::timeout(Duration::from_secs(2), reader)
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(res, Err(Error::NotConnected)));
        assert_eq!(client.status(), TransportStatus::Closed);
        assert!(client.write_frame(&Frame::data(vec![1])).await.is_err());
    }

    #[tokio::test]
    async fn test_connect_refused() {
        // Bind then drop to get a port nobody listens on
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        drop(listener);

        let client = TcpTransport::new(&addr, Duration::from_secs(2), DEFAULT_MAX_SIZE);
        let err = client.connect().await.unwrap_err();
        assert!(err.is_retriable());
    }

    #[tokio::test]
    async fn test_terminated_refuses_connect() {
        let client = TcpTransport::new("127.0.0.1:1", Duration::from_secs(1), DEFAULT_MAX_SIZE);
        client.terminate().await;
        assert!(matches!(client.connect().await, Err(Error::Terminated)));
    }
}
