//! TCP front end of the switch.
//!
//! Every accepted connection runs its own task: control frames go through
//! the [`RequestHandler`], data frames go to the learning bridge of the
//! client's network once it has logged in.

use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::sync::watch;
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, info, info_span, trace, warn, Instrument, Span};

use super::handler::{ClientRecord, Outcome, RequestHandler};
use crate::bridge::{LearningBridge, Port, PortId, Registry};
use crate::config::SwitchConfig;
use crate::error::{Error, Result};
use crate::protocol::Frame;
use crate::transport::{TcpTransport, Transport};

/// Bridge port backed by a client's write queue.
struct ClientPort {
    id: PortId,
    tx: mpsc::Sender<Frame>,
    up: AtomicBool,
}

impl Port for ClientPort {
    fn id(&self) -> PortId {
        self.id
    }

    fn is_up(&self) -> bool {
        self.up.load(Ordering::Relaxed)
    }

    fn send(&self, frame: Bytes) -> Result<()> {
        self.tx.try_send(Frame::Data(frame)).map_err(|e| match e {
            TrySendError::Full(_) => Error::protocol("write queue full"),
            TrySendError::Closed(_) => Error::ChannelClosed,
        })
    }
}

struct ClientEntry {
    record: ClientRecord,
    kick: watch::Sender<bool>,
}

struct ServerInner {
    config: SwitchConfig,
    handler: RequestHandler,
    registry: Registry,
    clients: RwLock<HashMap<u64, ClientEntry>>,
    next_id: AtomicU64,
}

pub struct SwitchServer {
    inner: Arc<ServerInner>,
    local_addr: SocketAddr,
    done: watch::Sender<bool>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl SwitchServer {
    /// Bind the listener and start accepting.
    pub async fn bind(config: SwitchConfig) -> Result<Self> {
        let listener = TcpListener::bind(&config.listen)
            .await
            .map_err(|e| Error::connection(format!("bind {}: {}", config.listen, e)))?;
        let local_addr = listener.local_addr()?;
        info!(%local_addr, networks = config.networks.len(), users = config.users.len(), "Switch listening");

        let inner = Arc::new(ServerInner {
            handler: RequestHandler::new(&config),
            registry: Registry::new(Duration::from_secs(config.mac_timeout)),
            clients: RwLock::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            config,
        });
        let (done, done_rx) = watch::channel(false);
        let span = info_span!("switch", listen = %local_addr);
        let task = tokio::spawn(inner.clone().accept_loop(listener, done_rx).instrument(span));

        Ok(Self {
            inner,
            local_addr,
            done,
            task: Mutex::new(Some(task)),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Side table of connected clients, ordered by connection id.
    pub fn clients(&self) -> Vec<ClientRecord> {
        let mut list: Vec<ClientRecord> = self
            .inner
            .clients
            .read()
            .values()
            .map(|e| e.record.clone())
            .collect();
        list.sort_by_key(|r| r.id);
        list
    }

    pub fn registry(&self) -> &Registry {
        &self.inner.registry
    }

    pub fn handler(&self) -> &RequestHandler {
        &self.inner.handler
    }

    /// Stop accepting, disconnect every client and drop the bridges.
    pub async fn stop(&self) {
        let _ = self.done.send(true);
        let task = self.task.lock().take();
        if let Some(task) = task {
            let _ = task.await;
        }
        self.inner.registry.shutdown().await;
    }
}

impl ServerInner {
    async fn accept_loop(self: Arc<Self>, listener: TcpListener, mut done: watch::Receiver<bool>) {
        let mut tasks = JoinSet::new();
        loop {
            tokio::select! {
                _ = done.changed() => break,
                res = listener.accept() => match res {
                    Ok((stream, peer)) => {
                        let _ = stream.set_nodelay(true);
                        let transport = match TcpTransport::from_stream(stream, self.config.max_frame) {
                            Ok(t) => Arc::new(t),
                            Err(e) => {
                                warn!(%peer, error = %e, "Failed to set up connection");
                                continue;
                            }
                        };
                        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
                        let span = info_span!("client", id, %peer);
                        tasks.spawn(self.clone().serve(id, transport).instrument(span));
                    }
                    Err(e) => {
                        warn!(error = %e, "Accept failed");
                        tokio::time::sleep(Duration::from_millis(100)).await;
                    }
                },
                Some(_) = tasks.join_next(), if !tasks.is_empty() => {}
            }
        }

        for entry in self.clients.read().values() {
            let _ = entry.kick.send(true);
        }
        while tasks.join_next().await.is_some() {}
        info!("Switch stopped");
    }

    async fn serve(self: Arc<Self>, id: u64, transport: Arc<TcpTransport>) {
        let (kick_tx, mut kick) = watch::channel(false);
        let (tx, mut rx) = mpsc::channel::<Frame>(self.config.queue.sock_wr.max(1));
        let port = Arc::new(ClientPort {
            id,
            tx,
            up: AtomicBool::new(true),
        });
        let mut record = ClientRecord::new(id, &transport.remote_addr());
        self.clients.write().insert(
            id,
            ClientEntry {
                record: record.clone(),
                kick: kick_tx,
            },
        );
        info!("Client connected");

        let writer = {
            let transport = transport.clone();
            tokio::spawn(
                async move {
                    while let Some(frame) = rx.recv().await {
                        if let Err(e) = transport.write_frame(&frame).await {
                            debug!(error = %e, "Write failed");
                            break;
                        }
                    }
                }
                .instrument(Span::current()),
            )
        };

        let idle = Duration::from_secs(self.config.timeout);
        let mut bridge: Option<Arc<LearningBridge>> = None;
        loop {
            let frame = tokio::select! {
                _ = kick.changed() => {
                    info!("Client kicked");
                    break;
                }
                res = tokio::time::timeout(idle, transport.read_frame()) => match res {
                    Err(_) => {
                        info!("Client idle, closing");
                        break;
                    }
                    Ok(Err(e)) => {
                        debug!(error = %e, "Read failed");
                        break;
                    }
                    Ok(Ok(frame)) => frame,
                },
            };

            match frame {
                Frame::Data(data) => match &bridge {
                    Some(bridge) => {
                        self.handler.learn_arp(&record, &data);
                        bridge.input(&data, id);
                    }
                    None => trace!(len = data.len(), "Dropping data before login"),
                },
                Frame::Control { action, body } => {
                    match self.handler.handle(&record, action, &body) {
                        Outcome::Reply(reply) => reply_to(&port, reply).await,
                        Outcome::LoggedIn { user, reply } => {
                            self.kick_duplicates(id, &user.uuid);
                            let joined = self.registry.get_or_create(&user.network);
                            joined.add_port(port.clone());
                            bridge = Some(joined);
                            record.user = Some(user);
                            self.update(&record);
                            reply_to(&port, reply).await;
                        }
                        Outcome::Leased { reply, address } => {
                            record.address = address;
                            self.update(&record);
                            reply_to(&port, reply).await;
                        }
                        Outcome::Leave => break,
                        Outcome::Ignore => {}
                    }
                }
            }
        }

        port.up.store(false, Ordering::Relaxed);
        if let Some(bridge) = bridge {
            bridge.remove_port(id);
        }
        self.clients.write().remove(&id);
        self.handler.forget(id);
        if let Some(user) = &record.user {
            if !self.alias_online(&user.network, &user.alias) {
                self.handler.release(user);
            }
        }
        transport.close().await;
        writer.abort();
        info!("Client disconnected");
    }

    fn update(&self, record: &ClientRecord) {
        if let Some(entry) = self.clients.write().get_mut(&record.id) {
            entry.record = record.clone();
        }
    }

    /// Drop older connections that logged in with the same uuid.
    fn kick_duplicates(&self, id: u64, uuid: &str) {
        if uuid.is_empty() {
            return;
        }
        for (other, entry) in self.clients.read().iter() {
            let same = entry.record.user.as_ref().map(|u| u.uuid == uuid);
            if *other != id && same == Some(true) {
                info!(uuid, old = other, "Kicking previous connection");
                let _ = entry.kick.send(true);
            }
        }
    }

    fn alias_online(&self, network: &str, alias: &str) -> bool {
        self.clients.read().values().any(|e| {
            e.record
                .user
                .as_ref()
                .map_or(false, |u| u.network == network && u.alias == alias)
        })
    }
}

async fn reply_to(port: &ClientPort, frame: Frame) {
    if port.tx.send(frame).await.is_err() {
        debug!("Writer gone, reply dropped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_client_port_reports_full_and_closed() {
        let (tx, mut rx) = mpsc::channel(1);
        let port = ClientPort {
            id: 7,
            tx,
            up: AtomicBool::new(true),
        };
        port.send(Bytes::from_static(b"one")).unwrap();
        assert!(matches!(
            port.send(Bytes::from_static(b"two")),
            Err(Error::Protocol(_))
        ));
        assert_eq!(rx.recv().await, Some(Frame::Data(Bytes::from_static(b"one"))));

        drop(rx);
        assert!(matches!(
            port.send(Bytes::from_static(b"three")),
            Err(Error::ChannelClosed)
        ));
    }
}
