//! Channel-backed device for tests and embedding.

use async_trait::async_trait;
use bytes::Bytes;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, watch};

use super::{Device, DeviceConfig, DeviceFactory, DeviceKind};
use crate::error::{Error, Result};

const DEVICE_CAPACITY: usize = 256;

/// A device whose "kernel side" is a pair of channels.
pub struct MemoryDevice {
    name: String,
    kind: DeviceKind,
    inbound: tokio::sync::Mutex<mpsc::Receiver<Bytes>>,
    outbound: mpsc::Sender<Bytes>,
    closed: watch::Sender<bool>,
}

/// The far side of a [`MemoryDevice`].
pub struct MemoryDeviceHandle {
    pub name: String,
    /// Packets sent here come out of `Device::read`.
    pub tx: mpsc::Sender<Bytes>,
    /// Packets passed to `Device::write` arrive here.
    pub rx: mpsc::Receiver<Bytes>,
    closed: watch::Receiver<bool>,
}

impl MemoryDevice {
    pub fn new(name: &str, kind: DeviceKind) -> (Self, MemoryDeviceHandle) {
        let (in_tx, in_rx) = mpsc::channel(DEVICE_CAPACITY);
        let (out_tx, out_rx) = mpsc::channel(DEVICE_CAPACITY);
        let (closed, closed_rx) = watch::channel(false);
        let device = Self {
            name: name.to_string(),
            kind,
            inbound: tokio::sync::Mutex::new(in_rx),
            outbound: out_tx,
            closed,
        };
        let handle = MemoryDeviceHandle {
            name: name.to_string(),
            tx: in_tx,
            rx: out_rx,
            closed: closed_rx,
        };
        (device, handle)
    }

    fn closed_error(&self) -> Error {
        Error::device(format!("{} is closed", self.name))
    }
}

impl MemoryDeviceHandle {
    pub fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }
}

#[async_trait]
impl Device for MemoryDevice {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> DeviceKind {
        self.kind
    }

    async fn read(&self, buf: &mut [u8]) -> Result<usize> {
        let mut closed = self.closed.subscribe();
        if *closed.borrow() {
            return Err(self.closed_error());
        }
        let mut inbound = self.inbound.lock().await;
        let packet = tokio::select! {
            packet = inbound.recv() => packet.ok_or_else(|| self.closed_error())?,
            _ = closed.changed() => return Err(self.closed_error()),
        };
        let n = packet.len().min(buf.len());
        buf[..n].copy_from_slice(&packet[..n]);
        Ok(n)
    }

    async fn write(&self, buf: &[u8]) -> Result<usize> {
        if *self.closed.borrow() {
            return Err(self.closed_error());
        }
        self.outbound
            .send(Bytes::copy_from_slice(buf))
            .await
            .map_err(|_| self.closed_error())?;
        Ok(buf.len())
    }

    async fn close(&self) {
        self.closed.send_replace(true);
    }
}

/// Factory producing [`MemoryDevice`]s and handing their far sides out.
pub struct MemoryFactory {
    handles: mpsc::UnboundedSender<MemoryDeviceHandle>,
    fail: AtomicBool,
    opens: AtomicUsize,
}

impl MemoryFactory {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<MemoryDeviceHandle>) {
        let (handles, rx) = mpsc::unbounded_channel();
        let factory = Self {
            handles,
            fail: AtomicBool::new(false),
            opens: AtomicUsize::new(0),
        };
        (factory, rx)
    }

    /// Make subsequent opens fail.
    pub fn set_fail(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }

    /// Open attempts, failed ones included.
    pub fn opens(&self) -> usize {
        self.opens.load(Ordering::SeqCst)
    }
}

impl DeviceFactory for MemoryFactory {
    fn open(&self, config: &DeviceConfig) -> Result<Arc<dyn Device>> {
        let attempt = self.opens.fetch_add(1, Ordering::SeqCst);
        if self.fail.load(Ordering::SeqCst) {
            return Err(Error::device("no such device"));
        }
        let name = if config.name.is_empty() {
            format!("mem{}", attempt)
        } else {
            config.name.clone()
        };
        let (device, handle) = MemoryDevice::new(&name, config.kind);
        // Nobody listening is fine; the device still works.
        let _ = self.handles.send(handle);
        Ok(Arc::new(device))
    }
}
