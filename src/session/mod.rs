//! Authenticated, self-healing tunnel to one switch.
//!
//! A session owns one [`Transport`] and drives it through
//! connect → login → keepalive, reconnecting with linear backoff whenever the
//! transport fails or goes quiet. Two tasks cooperate:
//!
//! - the event loop, which owns the write queue, the event queue and a
//!   2 second ticker, and serializes all state changes under the session lock
//! - a reader task per connection, which decodes frames off the transport,
//!   handles control frames under the same lock and hands data frames to the
//!   [`SessionListener`]
//!
//! Timestamps are `tokio::time::Instant`s so tests can drive the clock.

mod state;

pub use state::{SessionEvent, SessionState};

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, info_span, trace, warn, Instrument};

use crate::error::{Error, Result};
use crate::protocol::{unix_nanos, Action, Frame, Network, PingMessage, User, LOGIN_OKAY};
use crate::transport::{Transport, TransportStats, TransportStatus};

/// Interval between keepalive rounds.
pub const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(15);

/// Period of the session ticker.
pub const TICK_INTERVAL: Duration = Duration::from_secs(2);

/// Reconnect delay added per consecutive failure.
pub const RECONNECT_UNIT: Duration = Duration::from_secs(5);

/// Failures after which the reconnect delay stops growing.
pub const MAX_BACKOFF_STEPS: u32 = 20;

const EVENT_QUEUE: usize = 32;

const LEAVE_TIMEOUT: Duration = Duration::from_secs(1);

/// Session parameters.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Name used in logs and listener callbacks.
    pub name: String,
    pub user: User,
    /// Ask the switch for an address lease and apply its answer.
    pub request_addr: bool,
    /// Statically configured address, advertised to the switch.
    pub address: Option<Network>,
    /// Liveness timeout.
    pub timeout: Duration,
    /// Outbound data queue capacity.
    pub write_queue: usize,
}

impl SessionConfig {
    pub fn new(name: &str, user: User) -> Self {
        Self {
            name: name.to_string(),
            user,
            request_addr: true,
            address: None,
            timeout: Duration::from_secs(60),
            write_queue: 1024,
        }
    }
}

/// Callbacks fired by a session.
///
/// They run outside the session lock, so implementations may call back into
/// the session.
#[async_trait]
pub trait SessionListener: Send + Sync {
    /// Login accepted.
    async fn on_success(&self, _session: &str) {}

    /// The switch assigned a network.
    async fn on_ip_addr(&self, _session: &str, _network: &Network) {}

    /// The transport was lost.
    async fn on_close(&self, _session: &str) {}

    /// A data frame arrived.
    async fn on_frame(&self, _session: &str, _frame: Bytes) {}
}

/// Point-in-time view of a session.
#[derive(Debug, Clone, Serialize)]
pub struct SessionStatus {
    pub name: String,
    pub state: SessionState,
    pub transport: TransportStatus,
    pub remote: String,
    pub local: String,
    /// Seconds since the session was created.
    pub uptime: u64,
    /// Seconds since the current connection was established.
    pub alive_time: u64,
    pub connects: u64,
    pub latency_ms: i64,
    pub statistics: TransportStats,
    pub network: Option<Network>,
    /// Reason given by the switch for the last rejected login.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rejection: Option<String>,
}

enum Notice {
    Success,
    IpAddr(Network),
    Close,
}

/// Timestamps and counters.
///
/// `*_seq` fields are stamps from one monotonic counter so that "happened
/// after" is exact even when two events share an `Instant`.
struct Records {
    seq: u64,
    connected_seq: u64,
    reconnect_seq: u64,
    success_seq: u64,
    addr_seq: u64,
    connected_at: Option<Instant>,
    last_at: Instant,
    live_at: Instant,
    reconnect_at: Instant,
    sleeps: u32,
    connects: u64,
    latency_ms: i64,
}

impl Records {
    fn new(now: Instant) -> Self {
        Self {
            seq: 0,
            connected_seq: 0,
            reconnect_seq: 0,
            success_seq: 0,
            addr_seq: 0,
            connected_at: None,
            last_at: now,
            live_at: now,
            reconnect_at: now,
            sleeps: 0,
            connects: 0,
            latency_ms: 0,
        }
    }

    fn stamp(&mut self) -> u64 {
        self.seq += 1;
        self.seq
    }
}

/// One-shot reconnect timer.
struct Job {
    at: Instant,
}

/// State guarded by the session lock.
struct Core {
    user: User,
    network: Option<Network>,
    rec: Records,
    jobs: Vec<Job>,
    keepalive_at: Instant,
    generation: u64,
}

struct Inner {
    config: SessionConfig,
    transport: Arc<dyn Transport>,
    listener: Arc<dyn SessionListener>,
    core: tokio::sync::Mutex<Core>,
    state: Mutex<SessionState>,
    rejection: Mutex<Option<String>>,
    started_at: Instant,
    events_tx: mpsc::Sender<SessionEvent>,
    write_tx: mpsc::Sender<Bytes>,
    queues: Mutex<Option<(mpsc::Receiver<SessionEvent>, mpsc::Receiver<Bytes>)>>,
    done: watch::Sender<bool>,
    task: Mutex<Option<JoinHandle<()>>>,
}

/// Handle to a session. Clones share the same session.
#[derive(Clone)]
pub struct Session {
    inner: Arc<Inner>,
}

impl Session {
    pub fn new(
        config: SessionConfig,
        transport: Arc<dyn Transport>,
        listener: Arc<dyn SessionListener>,
    ) -> Self {
        let now = Instant::now();
        let (events_tx, events_rx) = mpsc::channel(EVENT_QUEUE);
        let (write_tx, write_rx) = mpsc::channel(config.write_queue.max(1));
        let (done, _) = watch::channel(false);

        let core = Core {
            user: config.user.clone(),
            network: config.address.clone(),
            rec: Records::new(now),
            jobs: Vec::new(),
            keepalive_at: now + KEEPALIVE_INTERVAL,
            generation: 0,
        };

        Self {
            inner: Arc::new(Inner {
                config,
                transport,
                listener,
                core: tokio::sync::Mutex::new(core),
                state: Mutex::new(SessionState::Disconnected),
                rejection: Mutex::new(None),
                started_at: now,
                events_tx,
                write_tx,
                queues: Mutex::new(Some((events_rx, write_rx))),
                done,
                task: Mutex::new(None),
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.config.name
    }

    pub fn state(&self) -> SessionState {
        self.inner.state()
    }

    pub fn is_authenticated(&self) -> bool {
        self.inner.state().is_authenticated()
    }

    /// Start the session, or force a fresh connection if already started.
    pub fn connect(&self) -> Result<()> {
        if self.inner.state().is_terminated() {
            return Err(Error::Terminated);
        }
        let queues = self.inner.queues.lock().take();
        match queues {
            Some((events, writes)) => {
                let span = info_span!(
                    "session",
                    name = %self.inner.config.name,
                    remote = %self.inner.transport.remote_addr()
                );
                let done = self.inner.done.subscribe();
                let inner = self.inner.clone();
                let task = tokio::spawn(inner.run(events, writes, done).instrument(span));
                *self.inner.task.lock() = Some(task);
                Ok(())
            }
            None => self.force_reconnect(),
        }
    }

    /// Reconnect immediately, skipping the backoff delay.
    pub fn force_reconnect(&self) -> Result<()> {
        if self.inner.state().is_terminated() {
            return Err(Error::Terminated);
        }
        self.inner
            .events_tx
            .try_send(SessionEvent::ForceReconnect)
            .map_err(|_| Error::ChannelClosed)
    }

    /// Leave the switch and stop for good.
    ///
    /// The leave notice is best effort; failing to deliver it is not an error.
    pub async fn disconnect(&self) {
        let inner = &self.inner;
        if inner.state().is_terminated() {
            return;
        }
        info!(session = %inner.config.name, "Disconnecting");
        {
            let core = inner.core.lock().await;
            if inner.transport.status() == TransportStatus::Connected {
                match Frame::control_json(Action::LeftReq, &inner.ping_message(&core)) {
                    Ok(frame) => {
                        let sent =
                            tokio::time::timeout(LEAVE_TIMEOUT, inner.transport.write_frame(&frame))
                                .await;
                        if !matches!(sent, Ok(Ok(()))) {
                            debug!(session = %inner.config.name, "Leave notice not delivered");
                        }
                    }
                    Err(e) => debug!(error = %e, "Failed to encode leave notice"),
                }
            }
            *inner.state.lock() = SessionState::Terminated;
            inner.transport.terminate().await;
        }
        let _ = inner.done.send(true);
        let task = inner.task.lock().take();
        if let Some(task) = task {
            let _ = task.await;
        }
    }

    /// Queue a data frame for the switch.
    ///
    /// Waits while the write queue is full. Frames offered while the session
    /// is not authenticated are dropped; after a rejected login the rejection
    /// is returned instead.
    pub async fn send(&self, data: Bytes) -> Result<()> {
        match self.inner.state() {
            SessionState::Terminated => Err(Error::Terminated),
            SessionState::Unauthenticated => {
                let reason = self.inner.rejection.lock().clone().unwrap_or_default();
                Err(Error::auth(reason))
            }
            SessionState::Authenticated => self
                .inner
                .write_tx
                .send(data)
                .await
                .map_err(|_| Error::ChannelClosed),
            state => {
                trace!(session = %self.inner.config.name, %state, "Dropping frame while unauthenticated");
                Ok(())
            }
        }
    }

    /// Replace the login credentials used from the next login on.
    pub async fn set_credentials(&self, name: &str, password: &str) {
        let mut core = self.inner.core.lock().await;
        core.user.name = name.to_string();
        core.user.password = password.to_string();
    }

    pub async fn user(&self) -> User {
        self.inner.core.lock().await.user.clone()
    }

    /// The network last assigned by (or advertised to) the switch.
    pub async fn network(&self) -> Option<Network> {
        self.inner.core.lock().await.network.clone()
    }

    pub fn uptime(&self) -> Duration {
        self.inner.started_at.elapsed()
    }

    pub fn statistics(&self) -> TransportStats {
        self.inner.transport.statistics()
    }

    pub async fn status(&self) -> SessionStatus {
        let inner = &self.inner;
        let core = inner.core.lock().await;
        SessionStatus {
            name: inner.config.name.clone(),
            state: inner.state(),
            transport: inner.transport.status(),
            remote: inner.transport.remote_addr(),
            local: inner.transport.local_addr(),
            uptime: inner.started_at.elapsed().as_secs(),
            alive_time: core
                .rec
                .connected_at
                .map(|at| at.elapsed().as_secs())
                .unwrap_or(0),
            connects: core.rec.connects,
            latency_ms: core.rec.latency_ms,
            statistics: inner.transport.statistics(),
            network: core.network.clone(),
            rejection: inner.rejection.lock().clone(),
        }
    }
}

impl Inner {
    fn state(&self) -> SessionState {
        *self.state.lock()
    }

    fn set_state(&self, next: SessionState) {
        let mut state = self.state.lock();
        if !state.is_terminated() {
            *state = next;
        }
    }

    /// Post an event from inside the loop; never waits on the queue.
    fn raise(&self, event: SessionEvent) {
        if self.events_tx.try_send(event).is_err() {
            warn!(%event, "Event queue full, dropping event");
        }
    }

    async fn run(
        self: Arc<Self>,
        mut events: mpsc::Receiver<SessionEvent>,
        mut writes: mpsc::Receiver<Bytes>,
        mut done: watch::Receiver<bool>,
    ) {
        info!("Session started");
        {
            let mut core = self.core.lock().await;
            self.connect_locked(&mut core).await;
        }

        let mut ticker = tokio::time::interval(TICK_INTERVAL);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = done.changed() => break,
                Some(event) = events.recv() => self.dispatch(event).await,
                Some(data) = writes.recv() => self.do_write(data).await,
                _ = ticker.tick() => self.on_tick().await,
            }
        }
        info!("Session stopped");
    }

    /// Close any stale connection and open a fresh one.
    async fn connect_locked(self: &Arc<Self>, core: &mut Core) {
        if self.state().is_terminated() {
            return;
        }
        self.set_state(SessionState::Connecting);
        core.generation += 1;
        core.rec.connects += 1;

        match self.transport.connect().await {
            Ok(()) => {
                let now = Instant::now();
                core.rec.connected_seq = core.rec.stamp();
                core.rec.connected_at = Some(now);
                core.rec.last_at = now;
                self.set_state(SessionState::Authenticating);
                info!(local = %self.transport.local_addr(), "Connected");
                self.spawn_reader(core.generation);
                self.raise(SessionEvent::Connected);
            }
            Err(e) => {
                warn!(error = %e, attempt = core.rec.connects, "Connect failed");
                self.set_state(SessionState::Disconnected);
                self.raise(SessionEvent::Reconnect);
            }
        }
    }

    fn spawn_reader(self: &Arc<Self>, generation: u64) {
        let inner = self.clone();
        tokio::spawn(inner.read_loop(generation).instrument(tracing::Span::current()));
    }

    async fn read_loop(self: Arc<Self>, generation: u64) {
        loop {
            match self.transport.read_frame().await {
                Ok(Frame::Control { action, body }) => {
                    debug!(%action, bytes = body.len(), "Control frame received");
                    let notices = {
                        let mut core = self.core.lock().await;
                        if core.generation != generation {
                            return;
                        }
                        self.on_control(&mut core, action, &body).await
                    };
                    self.notify(notices).await;
                }
                Ok(Frame::Data(data)) => {
                    if data.is_empty() {
                        continue;
                    }
                    self.core.lock().await.rec.last_at = Instant::now();
                    self.listener.on_frame(&self.config.name, data).await;
                }
                Err(Error::NotConnected) => break,
                Err(e) => {
                    warn!(error = %e, "Read failed");
                    break;
                }
            }
        }

        {
            let mut core = self.core.lock().await;
            if core.generation != generation || self.state().is_terminated() {
                return;
            }
            self.transport.close().await;
            self.set_state(SessionState::Disconnected);
            self.reconnect(&mut core);
        }
        self.notify(vec![Notice::Close]).await;
    }

    async fn dispatch(self: &Arc<Self>, event: SessionEvent) {
        debug!(%event, "Dispatch");
        let mut core = self.core.lock().await;
        match event {
            SessionEvent::Connected | SessionEvent::SignIn | SessionEvent::Login => {
                self.send_login(&core).await
            }
            SessionEvent::Success => {
                if self.can_request_addr(&core) {
                    self.send_ip_addr(&core).await;
                }
                self.send_ping(&core).await;
            }
            SessionEvent::Reconnect => self.reconnect(&mut core),
            SessionEvent::ForceReconnect => {
                core.rec.sleeps = 0;
                self.connect_locked(&mut core).await;
            }
        }
    }

    async fn do_write(&self, data: Bytes) {
        if !self.state().is_authenticated() {
            trace!("Dropping queued frame while unauthenticated");
            return;
        }
        if let Err(e) = self.transport.write_frame(&Frame::Data(data)).await {
            debug!(error = %e, "Write failed");
        }
    }

    async fn on_tick(self: &Arc<Self>) {
        let mut core = self.core.lock().await;
        self.check_alive(&core);
        self.keep_alive(&mut core).await;
        self.check_jobs(&mut core).await;
    }

    /// Schedule a reconnect after the current backoff delay.
    fn reconnect(&self, core: &mut Core) {
        if self.state().is_terminated() {
            return;
        }
        let now = Instant::now();
        core.rec.reconnect_seq = core.rec.stamp();
        core.rec.reconnect_at = now;
        if core.rec.sleeps < MAX_BACKOFF_STEPS {
            core.rec.sleeps += 1;
        }
        let delay = RECONNECT_UNIT * core.rec.sleeps;
        core.jobs.push(Job { at: now + delay });
        info!(delay_secs = delay.as_secs(), "Reconnect scheduled");
    }

    async fn check_jobs(self: &Arc<Self>, core: &mut Core) {
        let now = Instant::now();
        let (due, pending): (Vec<Job>, Vec<Job>) =
            core.jobs.drain(..).partition(|job| now >= job.at);
        core.jobs = pending;

        for _ in due {
            if core.rec.connected_seq >= core.rec.reconnect_seq {
                debug!("Reconnect superseded by a newer connection");
                continue;
            }
            self.connect_locked(core).await;
        }
    }

    /// Raise a reconnect when neither data nor pong arrived within the timeout.
    fn check_alive(&self, core: &Core) {
        let timeout = self.config.timeout;
        let now = Instant::now();
        if now.duration_since(core.rec.last_at) < timeout
            || now.duration_since(core.rec.live_at) < timeout
        {
            return;
        }
        if now.duration_since(core.rec.reconnect_at) < timeout {
            trace!("Reconnect already requested recently");
            return;
        }
        info!(timeout_secs = timeout.as_secs(), "Switch went quiet");
        self.raise(SessionEvent::Reconnect);
    }

    async fn keep_alive(&self, core: &mut Core) {
        let now = Instant::now();
        if now < core.keepalive_at {
            return;
        }
        core.keepalive_at = now + KEEPALIVE_INTERVAL;

        match self.state() {
            SessionState::Authenticated => {
                if self.can_request_addr(core) && core.rec.addr_seq < core.rec.success_seq {
                    self.send_ip_addr(core).await;
                }
                self.send_ping(core).await;
            }
            SessionState::Terminated => {}
            _ => {
                if self.transport.status() == TransportStatus::Connected {
                    self.send_login(core).await;
                }
            }
        }
    }

    fn can_request_addr(&self, core: &Core) -> bool {
        self.config.request_addr
            || core
                .network
                .as_ref()
                .map(|n| !n.address.is_empty())
                .unwrap_or(false)
    }

    async fn on_control(&self, core: &mut Core, action: Action, body: &[u8]) -> Vec<Notice> {
        match action {
            Action::LoginResp => self.on_login(core, body).into_iter().collect(),
            Action::IpAddrResp => {
                core.rec.addr_seq = core.rec.stamp();
                self.on_ip_addr(core, body).into_iter().collect()
            }
            Action::PongResp => {
                core.rec.live_at = Instant::now();
                self.on_pong(core, body);
                Vec::new()
            }
            Action::SignReq => {
                info!("Switch requested a new login");
                self.raise(SessionEvent::SignIn);
                Vec::new()
            }
            Action::LeftReq => {
                info!("Switch closed the session");
                self.transport.close().await;
                Vec::new()
            }
            other => {
                warn!(action = %other, "Unexpected control frame");
                Vec::new()
            }
        }
    }

    fn on_login(&self, core: &mut Core, body: &[u8]) -> Option<Notice> {
        if self.state().is_authenticated() {
            debug!("Duplicate login response ignored");
            return None;
        }
        let text = String::from_utf8_lossy(body);
        if text.starts_with(LOGIN_OKAY) {
            self.set_state(SessionState::Authenticated);
            self.rejection.lock().take();
            core.rec.sleeps = 0;
            core.rec.addr_seq = 0;
            core.rec.success_seq = core.rec.stamp();
            self.raise(SessionEvent::Success);
            info!(user = %core.user.id(), "Login succeeded");
            Some(Notice::Success)
        } else {
            self.set_state(SessionState::Unauthenticated);
            *self.rejection.lock() = Some(text.trim().to_string());
            error!(user = %core.user.id(), reason = %text.trim(), "Login rejected");
            None
        }
    }

    fn on_ip_addr(&self, core: &mut Core, body: &[u8]) -> Option<Notice> {
        if !self.config.request_addr {
            info!("Ignoring address lease that was not requested");
            return None;
        }
        match serde_json::from_slice::<Network>(body) {
            Ok(network) => {
                debug!(%network, "Address lease received");
                core.network = Some(network.clone());
                Some(Notice::IpAddr(network))
            }
            Err(e) => {
                warn!(error = %e, "Invalid address lease");
                None
            }
        }
    }

    fn on_pong(&self, core: &mut Core, body: &[u8]) {
        match serde_json::from_slice::<PingMessage>(body) {
            Ok(pong) => {
                core.rec.latency_ms = (unix_nanos() - pong.datetime) / 1_000_000;
                trace!(latency_ms = core.rec.latency_ms, "Pong");
            }
            Err(e) => warn!(error = %e, "Invalid pong"),
        }
    }

    fn ping_message(&self, core: &Core) -> PingMessage {
        PingMessage {
            datetime: unix_nanos(),
            uuid: core.user.uuid.clone(),
            alias: core.user.alias.clone(),
            connection: self.transport.remote_addr(),
            address: self.transport.local_addr(),
        }
    }

    async fn write_control(&self, frame: Result<Frame>) {
        let frame = match frame {
            Ok(frame) => frame,
            Err(e) => {
                warn!(error = %e, "Failed to encode control frame");
                return;
            }
        };
        trace!(%frame, "Sending control frame");
        if let Err(e) = self.transport.write_frame(&frame).await {
            debug!(error = %e, %frame, "Control write failed");
        }
    }

    async fn send_login(&self, core: &Core) {
        debug!(user = %core.user.id(), "Sending login");
        self.write_control(Frame::control_json(Action::LoginReq, &core.user))
            .await;
    }

    async fn send_ip_addr(&self, core: &Core) {
        let network = core.network.clone().unwrap_or_else(|| Network {
            name: core.user.network.clone(),
            ..Default::default()
        });
        self.write_control(Frame::control_json(Action::IpAddrReq, &network))
            .await;
    }

    async fn send_ping(&self, core: &Core) {
        self.write_control(Frame::control_json(Action::PingReq, &self.ping_message(core)))
            .await;
    }

    async fn notify(&self, notices: Vec<Notice>) {
        let name = &self.config.name;
        for notice in notices {
            match notice {
                Notice::Success => self.listener.on_success(name).await,
                Notice::IpAddr(network) => self.listener.on_ip_addr(name, &network).await,
                Notice::Close => self.listener.on_close(name).await,
            }
        }
    }
}
