//! Tap adapter: device lifecycle plus Ethernet synthesis for TUN mode.
//!
//! In TAP mode frames pass through untouched. In TUN mode the kernel speaks
//! IP while the overlay speaks Ethernet, so the adapter plays a small ARP
//! stack with a synthetic MAC:
//!
//! - outbound IP packets get an Ethernet header addressed to the next hop's
//!   learned MAC; on a miss an ARP request goes out instead and the packet
//!   is dropped
//! - inbound ARP requests for our address are answered locally, inbound ARP
//!   replies to our MAC are learned, and every other non-IPv4 frame is dropped

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use std::fmt;
use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, info_span, trace, warn, Instrument};

use super::{Device, DeviceConfig, DeviceFactory, DeviceKind, NeighborCache, NEIGHBOR_TICK};
use crate::error::{Error, Result};
use crate::packet::{
    format_mac, random_mac, wrap_ip_in_ethernet, ArpOperation, ArpPacket, EtherType,
    EthernetHeader, Ipv4Header, MacAddr, HEADER_SIZE,
};

/// Delay before reopening a failed device.
pub const REOPEN_DELAY: Duration = Duration::from_secs(2);

const EVENT_QUEUE: usize = 32;
const READ_BUFFER: usize = 65536;

/// Events consumed by the adapter loop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TapEvent {
    ReadErr(String),
    OpenErr(String),
    /// Close and reopen the device.
    Reset,
    /// New interface address in CIDR form.
    IpAddr(String),
}

impl fmt::Display for TapEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TapEvent::ReadErr(reason) => write!(f, "read-err: {}", reason),
            TapEvent::OpenErr(reason) => write!(f, "open-err: {}", reason),
            TapEvent::Reset => write!(f, "reset"),
            TapEvent::IpAddr(addr) => write!(f, "ip-addr: {}", addr),
        }
    }
}

#[derive(Debug, Clone)]
pub struct TapConfig {
    pub device: DeviceConfig,
    /// Interface address in CIDR form, used as the ARP sender in TUN mode.
    pub address: Option<String>,
    pub write_queue: usize,
}

/// Callbacks fired by the adapter.
#[async_trait]
pub trait TapListener: Send + Sync {
    /// A device was (re)opened.
    async fn on_open(&self, _device: &str) {}

    /// A frame headed for the overlay: read from the device, or a synthesized
    /// ARP packet.
    async fn on_frame(&self, frame: Bytes);

    /// Map a destination to the address whose MAC should be used.
    fn find_next(&self, dest: Ipv4Addr) -> Ipv4Addr {
        dest
    }
}

struct TapCore {
    device: Option<Arc<dyn Device>>,
    generation: u64,
    /// Normalized CIDR of the current address.
    if_addr: String,
}

struct Inner {
    config: TapConfig,
    factory: Arc<dyn DeviceFactory>,
    listener: Arc<dyn TapListener>,
    neighbors: NeighborCache,
    hw_addr: MacAddr,
    ip_addr: Mutex<Ipv4Addr>,
    core: tokio::sync::Mutex<TapCore>,
    events_tx: mpsc::Sender<TapEvent>,
    write_tx: mpsc::Sender<Bytes>,
    queues: Mutex<Option<(mpsc::Receiver<TapEvent>, mpsc::Receiver<Bytes>)>>,
    done: watch::Sender<bool>,
    stopped: AtomicBool,
    task: Mutex<Option<JoinHandle<()>>>,
}

/// Handle to a tap adapter. Clones share the same adapter.
#[derive(Clone)]
pub struct TapAdapter {
    inner: Arc<Inner>,
}

/// Split `addr` into its IPv4 address and a normalized `ip/prefix` string.
fn normalize_addr(addr: &str) -> Option<(Ipv4Addr, String)> {
    let (ip, prefix) = match addr.trim().split_once('/') {
        Some((ip, prefix)) => (ip, prefix.parse::<u8>().ok().filter(|p| *p <= 32)?),
        None => (addr.trim(), 32),
    };
    let ip: Ipv4Addr = ip.parse().ok()?;
    Some((ip, format!("{}/{}", ip, prefix)))
}

impl TapAdapter {
    pub fn new(
        config: TapConfig,
        factory: Arc<dyn DeviceFactory>,
        listener: Arc<dyn TapListener>,
    ) -> Self {
        let (events_tx, events_rx) = mpsc::channel(EVENT_QUEUE);
        let (write_tx, write_rx) = mpsc::channel(config.write_queue.max(1));
        let (done, _) = watch::channel(false);

        let (ip_addr, if_addr) = config
            .address
            .as_deref()
            .and_then(normalize_addr)
            .unwrap_or((Ipv4Addr::UNSPECIFIED, String::new()));
        let hw_addr = random_mac();
        if config.device.kind == DeviceKind::Tun {
            info!(mac = %format_mac(&hw_addr), ip = %ip_addr, "Synthetic Ethernet address");
        }

        Self {
            inner: Arc::new(Inner {
                config,
                factory,
                listener,
                neighbors: NeighborCache::default(),
                hw_addr,
                ip_addr: Mutex::new(ip_addr),
                core: tokio::sync::Mutex::new(TapCore {
                    device: None,
                    generation: 0,
                    if_addr,
                }),
                events_tx,
                write_tx,
                queues: Mutex::new(Some((events_rx, write_rx))),
                done,
                stopped: AtomicBool::new(false),
                task: Mutex::new(None),
            }),
        }
    }

    /// Open the device and start the adapter loop.
    ///
    /// An open failure is not returned; the loop keeps retrying.
    pub fn start(&self) -> Result<()> {
        let (events, writes) = self
            .inner
            .queues
            .lock()
            .take()
            .ok_or_else(|| Error::device("adapter already started"))?;
        let span = info_span!(
            "tap",
            device = %self.inner.config.device.name,
            kind = %self.inner.config.device.kind
        );
        let done = self.inner.done.subscribe();
        let inner = self.inner.clone();
        let task = tokio::spawn(inner.run(events, writes, done).instrument(span));
        *self.inner.task.lock() = Some(task);
        Ok(())
    }

    /// Close the device and stop the loop. In-flight frames are dropped.
    pub async fn stop(&self) {
        let inner = &self.inner;
        if inner.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        info!(device = %inner.config.device.name, "Stopping adapter");
        {
            let mut core = inner.core.lock().await;
            inner.close_locked(&mut core).await;
        }
        let _ = inner.done.send(true);
        let task = inner.task.lock().take();
        if let Some(task) = task {
            let _ = task.await;
        }
    }

    /// Queue a frame for the device; waits while the queue is full.
    pub async fn write(&self, frame: Bytes) -> Result<()> {
        if self.inner.is_stopped() {
            return Err(Error::Terminated);
        }
        self.inner
            .write_tx
            .send(frame)
            .await
            .map_err(|_| Error::ChannelClosed)
    }

    /// Announce a new interface address (CIDR). A change reopens the device.
    pub async fn set_addr(&self, addr: &str) {
        if self
            .inner
            .events_tx
            .send(TapEvent::IpAddr(addr.to_string()))
            .await
            .is_err()
        {
            debug!(addr, "Adapter loop gone, address ignored");
        }
    }

    pub async fn device_name(&self) -> Option<String> {
        let core = self.inner.core.lock().await;
        core.device.as_ref().map(|d| d.name().to_string())
    }

    pub fn kind(&self) -> DeviceKind {
        self.inner.config.device.kind
    }

    pub fn is_tun(&self) -> bool {
        self.inner.is_tun()
    }

    /// Synthetic MAC used in TUN mode.
    pub fn hw_addr(&self) -> MacAddr {
        self.inner.hw_addr
    }

    pub fn ip_addr(&self) -> Ipv4Addr {
        *self.inner.ip_addr.lock()
    }

    pub fn neighbors(&self) -> &NeighborCache {
        &self.inner.neighbors
    }
}

impl Inner {
    fn is_tun(&self) -> bool {
        self.config.device.kind == DeviceKind::Tun
    }

    fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    fn raise(&self, event: TapEvent) {
        if let Err(e) = self.events_tx.try_send(event) {
            warn!(event = %e.into_inner(), "Event queue full, dropping event");
        }
    }

    /// Post `event` after `delay` unless the adapter stops first.
    fn raise_later(self: &Arc<Self>, event: TapEvent, delay: Duration) {
        let inner = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if !inner.is_stopped() {
                let _ = inner.events_tx.send(event).await;
            }
        });
    }

    async fn run(
        self: Arc<Self>,
        mut events: mpsc::Receiver<TapEvent>,
        mut writes: mpsc::Receiver<Bytes>,
        mut done: watch::Receiver<bool>,
    ) {
        self.reopen().await;

        let mut ticker = tokio::time::interval(NEIGHBOR_TICK);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = done.changed() => break,
                Some(event) = events.recv() => self.dispatch(event).await,
                Some(frame) = writes.recv() => self.do_write(frame).await,
                _ = ticker.tick() => self.on_tick().await,
            }
        }
        debug!("Adapter loop stopped");
    }

    async fn dispatch(self: &Arc<Self>, event: TapEvent) {
        debug!(%event, "Dispatch");
        match event {
            TapEvent::ReadErr(_) | TapEvent::OpenErr(_) | TapEvent::Reset => self.reopen().await,
            TapEvent::IpAddr(addr) => self.set_addr(&addr).await,
        }
    }

    async fn reopen(self: &Arc<Self>) {
        if let Err(e) = self.open().await {
            if self.is_stopped() {
                return;
            }
            error!(error = %e, "Failed to open device");
            self.raise_later(TapEvent::OpenErr(e.to_string()), REOPEN_DELAY);
        }
    }

    async fn open(self: &Arc<Self>) -> Result<()> {
        let name = {
            let mut core = self.core.lock().await;
            self.close_locked(&mut core).await;
            if self.is_stopped() {
                return Err(Error::Terminated);
            }
            let device = self.factory.open(&self.config.device)?;
            core.generation += 1;
            core.device = Some(device.clone());

            let reader = self.clone().read_loop(device.clone(), core.generation);
            tokio::spawn(reader.instrument(tracing::Span::current()));
            device.name().to_string()
        };
        info!(device = %name, "Device opened");
        self.listener.on_open(&name).await;
        Ok(())
    }

    async fn close_locked(&self, core: &mut TapCore) {
        if let Some(device) = core.device.take() {
            debug!(device = %device.name(), "Closing device");
            device.close().await;
        }
    }

    async fn set_addr(&self, addr: &str) {
        self.neighbors.clear();
        let Some((ip, normalized)) = normalize_addr(addr) else {
            warn!(addr, "Invalid interface address");
            return;
        };
        *self.ip_addr.lock() = ip;
        info!(%ip, "Interface address set");

        let mut core = self.core.lock().await;
        if !core.if_addr.is_empty() && core.if_addr != normalized {
            warn!(from = %core.if_addr, to = %normalized, "Address changed, reopening device");
            self.raise(TapEvent::Reset);
        }
        core.if_addr = normalized;
    }

    async fn read_loop(self: Arc<Self>, device: Arc<dyn Device>, generation: u64) {
        let mut buf = vec![0u8; READ_BUFFER];
        let err = loop {
            match device.read(&mut buf).await {
                Ok(0) => continue,
                Ok(n) => {
                    trace!(bytes = n, "Device read");
                    if let Some(frame) = self.on_read(&buf[..n]).await {
                        self.listener.on_frame(frame).await;
                    }
                }
                Err(e) => break e,
            }
        };

        {
            let core = self.core.lock().await;
            if core.generation != generation || self.is_stopped() {
                return;
            }
        }
        error!(device = %device.name(), error = %err, "Device read failed");
        self.raise_later(TapEvent::ReadErr(err.to_string()), REOPEN_DELAY);
    }

    /// Turn a packet read from the device into an overlay frame.
    async fn on_read(&self, data: &[u8]) -> Option<Bytes> {
        if !self.is_tun() {
            return Some(Bytes::copy_from_slice(data));
        }
        let Some(header) = Ipv4Header::parse(data) else {
            trace!(bytes = data.len(), "Dropping non-IPv4 packet");
            return None;
        };
        let next = self.listener.find_next(header.destination);
        match self.neighbors.get(next, Instant::now()) {
            Some(neighbor) => wrap_ip_in_ethernet(data, &neighbor.hw_addr, &self.hw_addr),
            None => {
                debug!(dest = %header.destination, %next, "Neighbor miss");
                self.send_arp_request(next).await;
                None
            }
        }
    }

    async fn send_arp_request(&self, target: Ipv4Addr) {
        let sender_ip = *self.ip_addr.lock();
        let request = ArpPacket::request(self.hw_addr, sender_ip, target);
        self.listener.on_frame(request.to_frame()).await;
    }

    async fn do_write(&self, frame: Bytes) {
        let device = self.core.lock().await.device.clone();
        let Some(device) = device else {
            debug!("No device, dropping frame");
            return;
        };

        let payload = if self.is_tun() {
            if self.proxy_arp(&frame).await {
                return;
            }
            match EthernetHeader::parse(&frame) {
                Some(eth) if eth.is(EtherType::Ipv4) => frame.slice(HEADER_SIZE..),
                Some(eth) => {
                    trace!(ethertype = eth.ethertype, "Dropping non-IPv4 frame");
                    return;
                }
                None => {
                    warn!(bytes = frame.len(), "Dropping runt frame");
                    return;
                }
            }
        } else {
            frame
        };

        if let Err(e) = device.write(&payload).await {
            error!(device = %device.name(), error = %e, "Device write failed");
        }
    }

    /// Handle ARP in TUN mode. Returns true when the frame was consumed.
    async fn proxy_arp(&self, frame: &[u8]) -> bool {
        if EtherType::from_frame(frame) != Some(EtherType::Arp) {
            return false;
        }
        let Some(arp) = ArpPacket::parse(frame) else {
            debug!(bytes = frame.len(), "Dropping malformed ARP");
            return true;
        };
        if arp.eth_src != arp.sender_mac {
            warn!(sender = %arp.sender_ip, "ARP sender does not match Ethernet source");
            return true;
        }

        match arp.operation {
            ArpOperation::Request => {
                let own_ip = *self.ip_addr.lock();
                if arp.target_ip == own_ip {
                    debug!(to = %arp.sender_ip, "Answering ARP request");
                    let reply = ArpPacket::reply_to(&arp, self.hw_addr);
                    self.listener.on_frame(reply.to_frame()).await;
                }
            }
            ArpOperation::Reply => {
                if arp.target_mac == self.hw_addr {
                    self.neighbors.add(arp.sender_ip, arp.sender_mac, Instant::now());
                    debug!(ip = %arp.sender_ip, mac = %format_mac(&arp.sender_mac), "Learned neighbor");
                }
            }
        }
        true
    }

    async fn on_tick(&self) {
        let now = Instant::now();
        for target in self.neighbors.probes(now) {
            trace!(%target, "Refreshing neighbor");
            self.send_arp_request(target).await;
        }
        let expired = self.neighbors.expire(now);
        if expired > 0 {
            debug!(expired, "Neighbors expired");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::{MemoryDeviceHandle, MemoryFactory};
    use crate::packet::ipv4::test_packet;

    const PEER_MAC: MacAddr = [0x02, 0, 0, 0, 0, 0x09];
    const OWN_IP: Ipv4Addr = Ipv4Addr::new(10, 0, 0, 5);
    const PEER_IP: Ipv4Addr = Ipv4Addr::new(10, 0, 0, 9);

    #[derive(Default)]
    struct Recorder {
        frames: Mutex<Vec<Bytes>>,
        opens: Mutex<Vec<String>>,
        gateway: Option<Ipv4Addr>,
    }

    impl Recorder {
        fn take(&self) -> Vec<Bytes> {
            std::mem::take(&mut *self.frames.lock())
        }
    }

    #[async_trait]
    impl TapListener for Recorder {
        async fn on_open(&self, device: &str) {
            self.opens.lock().push(device.to_string());
        }

        async fn on_frame(&self, frame: Bytes) {
            self.frames.lock().push(frame);
        }

        fn find_next(&self, dest: Ipv4Addr) -> Ipv4Addr {
            self.gateway.unwrap_or(dest)
        }
    }

    struct Harness {
        adapter: TapAdapter,
        recorder: Arc<Recorder>,
        factory: Arc<MemoryFactory>,
        handles: mpsc::UnboundedReceiver<MemoryDeviceHandle>,
    }

    fn harness(kind: DeviceKind, recorder: Recorder) -> Harness {
        let (factory, handles) = MemoryFactory::new();
        let factory = Arc::new(factory);
        let recorder = Arc::new(recorder);
        let config = TapConfig {
            device: DeviceConfig {
                name: "tun0".into(),
                kind,
                mtu: 1500,
            },
            address: Some("10.0.0.5/24".into()),
            write_queue: 16,
        };
        let adapter = TapAdapter::new(config, factory.clone(), recorder.clone());
        Harness {
            adapter,
            recorder,
            factory,
            handles,
        }
    }

    async fn settle() {
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    fn arp_of(frame: &Bytes) -> ArpPacket {
        ArpPacket::parse(frame).expect("not an ARP frame")
    }

    #[tokio::test(start_paused = true)]
    async fn test_tun_miss_then_learn() {
        let mut h = harness(DeviceKind::Tun, Recorder::default());
        h.adapter.start().unwrap();
        let mut dev = h.handles.recv().await.unwrap();
        let own_mac = h.adapter.hw_addr();

        // Unknown next hop: ARP request goes out, the packet does not
        let packet = test_packet(OWN_IP, PEER_IP, b"hello");
        dev.tx.send(Bytes::from(packet.clone())).await.unwrap();
        settle().await;
        let frames = h.recorder.take();
        assert_eq!(frames.len(), 1);
        let request = arp_of(&frames[0]);
        assert_eq!(request.operation, ArpOperation::Request);
        assert_eq!(request.sender_ip, OWN_IP);
        assert_eq!(request.sender_mac, own_mac);
        assert_eq!(request.target_ip, PEER_IP);

        // The reply is consumed and learned
        let reply = ArpPacket::reply_to(&request, PEER_MAC);
        h.adapter.write(reply.to_frame()).await.unwrap();
        settle().await;
        assert!(dev.rx.try_recv().is_err());
        assert_eq!(h.adapter.neighbors().len(), 1);

        dev.tx.send(Bytes::from(packet.clone())).await.unwrap();
        settle().await;
        let frames = h.recorder.take();
        assert_eq!(frames.len(), 1);
        let eth = EthernetHeader::parse(&frames[0]).unwrap();
        assert_eq!(eth.dst, PEER_MAC);
        assert_eq!(eth.src, own_mac);
        assert!(eth.is(EtherType::Ipv4));
        assert_eq!(&frames[0][HEADER_SIZE..], &packet[..]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_find_next_targets_gateway() {
        let recorder = Recorder {
            gateway: Some(Ipv4Addr::new(10, 0, 0, 1)),
            ..Default::default()
        };
        let mut h = harness(DeviceKind::Tun, recorder);
        h.adapter.start().unwrap();
        let dev = h.handles.recv().await.unwrap();

        let packet = test_packet(OWN_IP, Ipv4Addr::new(192, 168, 1, 1), b"x");
        dev.tx.send(Bytes::from(packet)).await.unwrap();
        settle().await;
        let frames = h.recorder.take();
        assert_eq!(arp_of(&frames[0]).target_ip, Ipv4Addr::new(10, 0, 0, 1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_proxy_arp_answers_own_address() {
        let mut h = harness(DeviceKind::Tun, Recorder::default());
        h.adapter.start().unwrap();
        let mut dev = h.handles.recv().await.unwrap();
        let own_mac = h.adapter.hw_addr();

        let request = ArpPacket::request(PEER_MAC, PEER_IP, OWN_IP);
        h.adapter.write(request.to_frame()).await.unwrap();
        settle().await;
        let frames = h.recorder.take();
        assert_eq!(frames.len(), 1);
        let reply = arp_of(&frames[0]);
        assert_eq!(reply.operation, ArpOperation::Reply);
        assert_eq!(reply.sender_ip, OWN_IP);
        assert_eq!(reply.sender_mac, own_mac);
        assert_eq!(reply.target_mac, PEER_MAC);
        assert_eq!(reply.eth_dst, PEER_MAC);

        // Someone else's address: consumed, no answer
        let other = ArpPacket::request(PEER_MAC, PEER_IP, Ipv4Addr::new(10, 0, 0, 7));
        h.adapter.write(other.to_frame()).await.unwrap();

        // Ethernet source disagreeing with the ARP sender: dropped
        let mut spoofed = ArpPacket::request(PEER_MAC, PEER_IP, OWN_IP);
        spoofed.eth_src = [0x02, 0, 0, 0, 0, 0x66];
        h.adapter.write(spoofed.to_frame()).await.unwrap();
        settle().await;

        assert!(h.recorder.take().is_empty());
        assert!(dev.rx.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_tun_write_strips_ethernet() {
        let mut h = harness(DeviceKind::Tun, Recorder::default());
        h.adapter.start().unwrap();
        let mut dev = h.handles.recv().await.unwrap();
        let own_mac = h.adapter.hw_addr();

        let ipv4 = test_packet(PEER_IP, OWN_IP, b"one");
        let mut ipv6 = wrap_ip_in_ethernet(&ipv4, &own_mac, &PEER_MAC).unwrap().to_vec();
        ipv6[12..14].copy_from_slice(&[0x86, 0xDD]);
        h.adapter.write(Bytes::from(ipv6)).await.unwrap();

        let frame = wrap_ip_in_ethernet(&ipv4, &own_mac, &PEER_MAC).unwrap();
        h.adapter.write(frame).await.unwrap();

        assert_eq!(&dev.rx.recv().await.unwrap()[..], &ipv4[..]);
        settle().await;
        assert!(dev.rx.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_tap_mode_passes_frames() {
        let mut h = harness(DeviceKind::Tap, Recorder::default());
        h.adapter.start().unwrap();
        let mut dev = h.handles.recv().await.unwrap();

        let frame = ArpPacket::request(PEER_MAC, PEER_IP, OWN_IP).to_frame();
        dev.tx.send(frame.clone()).await.unwrap();
        settle().await;
        assert_eq!(h.recorder.take(), vec![frame.clone()]);

        h.adapter.write(frame.clone()).await.unwrap();
        assert_eq!(dev.rx.recv().await.unwrap(), frame);
    }

    #[tokio::test(start_paused = true)]
    async fn test_open_failure_retried_after_delay() {
        let h = harness(DeviceKind::Tun, Recorder::default());
        let start = Instant::now();
        h.factory.set_fail(true);
        h.adapter.start().unwrap();

        tokio::time::sleep_until(start + Duration::from_secs(1)).await;
        assert_eq!(h.factory.opens(), 1);
        tokio::time::sleep_until(start + Duration::from_secs(3)).await;
        assert_eq!(h.factory.opens(), 2);
        assert!(h.adapter.device_name().await.is_none());

        h.factory.set_fail(false);
        tokio::time::sleep_until(start + Duration::from_secs(5)).await;
        assert_eq!(h.factory.opens(), 3);
        assert_eq!(h.adapter.device_name().await.as_deref(), Some("tun0"));
        assert_eq!(h.recorder.opens.lock().clone(), vec!["tun0".to_string()]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_read_error_reopens() {
        let mut h = harness(DeviceKind::Tun, Recorder::default());
        h.adapter.start().unwrap();
        let dev = h.handles.recv().await.unwrap();
        drop(dev);

        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(h.factory.opens(), 1);
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(h.factory.opens(), 2);
        assert!(h.handles.recv().await.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_address_change_reopens() {
        let mut h = harness(DeviceKind::Tun, Recorder::default());
        h.adapter.start().unwrap();
        let first = h.handles.recv().await.unwrap();

        h.adapter.set_addr("10.0.0.5/24").await;
        settle().await;
        assert_eq!(h.factory.opens(), 1);

        h.adapter.set_addr("10.0.0.6/24").await;
        let _second = h.handles.recv().await.unwrap();
        assert_eq!(h.factory.opens(), 2);
        assert!(first.is_closed());
        assert_eq!(h.adapter.ip_addr(), Ipv4Addr::new(10, 0, 0, 6));
    }

    #[tokio::test(start_paused = true)]
    async fn test_neighbor_probe_and_expiry() {
        let mut h = harness(DeviceKind::Tun, Recorder::default());
        h.adapter.start().unwrap();
        let _dev = h.handles.recv().await.unwrap();
        let own_mac = h.adapter.hw_addr();

        let request = ArpPacket::request(own_mac, OWN_IP, PEER_IP);
        h.adapter
            .write(ArpPacket::reply_to(&request, PEER_MAC).to_frame())
            .await
            .unwrap();
        settle().await;
        assert_eq!(h.adapter.neighbors().len(), 1);
        h.recorder.take();

        tokio::time::sleep(Duration::from_secs(115)).await;
        assert!(h.recorder.take().is_empty());

        tokio::time::sleep(Duration::from_secs(11)).await;
        let probes = h.recorder.take();
        assert!(!probes.is_empty());
        assert!(probes.iter().all(|f| arp_of(f).target_ip == PEER_IP));

        tokio::time::sleep(Duration::from_secs(60)).await;
        assert!(h.adapter.neighbors().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_closes_device() {
        let mut h = harness(DeviceKind::Tun, Recorder::default());
        h.adapter.start().unwrap();
        let dev = h.handles.recv().await.unwrap();

        h.adapter.stop().await;
        assert!(dev.is_closed());
        assert!(matches!(
            h.adapter.write(Bytes::from_static(b"x")).await,
            Err(Error::Terminated)
        ));

        // No reopen after stop
        tokio::time::sleep(REOPEN_DELAY * 3).await;
        assert_eq!(h.factory.opens(), 1);
    }
}
