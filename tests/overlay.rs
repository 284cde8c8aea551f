//! Endpoint sessions talking to a switch over loopback TCP.

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;

use lanlink::config::{NetworkConfig, RangeConfig, SwitchConfig, UserConfig};
use lanlink::packet::ArpPacket;
use lanlink::protocol::{
    unix_nanos, Action, Frame, FrameCodec, Network, PingMessage, User, DEFAULT_MAX_SIZE,
    FLAG_CONTROL,
};
use lanlink::session::{Session, SessionConfig, SessionListener, SessionState};
use lanlink::transport::TcpTransport;
use lanlink::SwitchServer;

const WAIT: Duration = Duration::from_secs(5);

enum Event {
    Success,
    IpAddr(Network),
    Frame(Bytes),
}

struct Recorder {
    tx: mpsc::UnboundedSender<Event>,
}

#[async_trait]
impl SessionListener for Recorder {
    async fn on_success(&self, _session: &str) {
        let _ = self.tx.send(Event::Success);
    }

    async fn on_ip_addr(&self, _session: &str, network: &Network) {
        let _ = self.tx.send(Event::IpAddr(network.clone()));
    }

    async fn on_frame(&self, _session: &str, frame: Bytes) {
        let _ = self.tx.send(Event::Frame(frame));
    }
}

struct Endpoint {
    session: Session,
    events: mpsc::UnboundedReceiver<Event>,
}

impl Endpoint {
    fn new(server: &SwitchServer, name: &str, password: &str, alias: &str) -> Self {
        let mut user = User::new(name, "corp", password);
        user.alias = alias.into();
        user.uuid = alias.into();
        let transport = TcpTransport::new(
            &server.local_addr().to_string(),
            Duration::from_secs(5),
            DEFAULT_MAX_SIZE,
        );
        let (tx, events) = mpsc::unbounded_channel();
        let session = Session::new(
            SessionConfig::new(alias, user),
            Arc::new(transport),
            Arc::new(Recorder { tx }),
        );
        session.connect().unwrap();
        Self { session, events }
    }

    async fn next(&mut self) -> Event {
        tokio::time::timeout(WAIT, self.events.recv())
            .await
            .expect("timed out")
            .expect("listener dropped")
    }

    async fn leased(&mut self) -> Network {
        loop {
            if let Event::IpAddr(network) = self.next().await {
                return network;
            }
        }
    }

    async fn frame(&mut self) -> Bytes {
        loop {
            if let Event::Frame(frame) = self.next().await {
                return frame;
            }
        }
    }
}

fn switch_config() -> SwitchConfig {
    SwitchConfig {
        listen: "127.0.0.1:0".into(),
        networks: vec![NetworkConfig {
            name: "corp".into(),
            netmask: "255.255.255.0".into(),
            gateway: "10.0.0.1".into(),
            range: Some(RangeConfig {
                start: Ipv4Addr::new(10, 0, 0, 100),
                end: Ipv4Addr::new(10, 0, 0, 110),
            }),
            routes: Vec::new(),
            static_leases: Vec::new(),
        }],
        users: ["alice", "bob"]
            .iter()
            .map(|name| UserConfig {
                name: name.to_string(),
                network: "corp".into(),
                password: "secret".into(),
                role: "guest".into(),
            })
            .collect(),
        ..Default::default()
    }
}

fn ethernet(dst: [u8; 6], src: [u8; 6], payload: &[u8]) -> Bytes {
    let mut frame = Vec::with_capacity(14 + payload.len());
    frame.extend_from_slice(&dst);
    frame.extend_from_slice(&src);
    frame.extend_from_slice(&[0x08, 0x00]);
    frame.extend_from_slice(payload);
    Bytes::from(frame)
}

async fn wait_for(mut check: impl FnMut() -> bool) {
    for _ in 0..50 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    panic!("condition not reached");
}

#[tokio::test]
async fn endpoints_lease_and_exchange_frames() {
    let server = SwitchServer::bind(switch_config()).await.unwrap();
    let mut a = Endpoint::new(&server, "alice", "secret", "laptop");
    let mut b = Endpoint::new(&server, "bob", "secret", "desktop");

    let lease_a = a.leased().await;
    let lease_b = b.leased().await;
    assert_eq!(lease_a.netmask, "255.255.255.0");
    assert_eq!(lease_a.gateway, "10.0.0.1");
    assert_ne!(lease_a.address, lease_b.address);
    assert!(a.session.is_authenticated());

    let mac_a = [0x02, 0, 0, 0, 0, 0x0a];
    let mac_b = [0x02, 0, 0, 0, 0, 0x0b];

    // Broadcast floods to the other endpoint
    let hello = ethernet([0xff; 6], mac_a, b"hello");
    a.session.send(hello.clone()).await.unwrap();
    assert_eq!(b.frame().await, hello);

    // The reply is unicast back to the learned port
    let reply = ethernet(mac_a, mac_b, b"world");
    b.session.send(reply.clone()).await.unwrap();
    assert_eq!(a.frame().await, reply);

    // ARP senders become neighbors of the switch
    let arp = ArpPacket::request(mac_a, Ipv4Addr::new(10, 0, 0, 50), Ipv4Addr::new(10, 0, 0, 1));
    a.session.send(arp.to_frame()).await.unwrap();
    b.frame().await;
    assert_eq!(server.handler().neighbors().len(), 1);

    let clients = server.clients();
    assert_eq!(clients.len(), 2);
    assert!(clients.iter().all(|c| c.address.is_some()));
    let bridge = server.registry().get("corp").unwrap();
    assert_eq!(bridge.port_count(), 2);

    // Leaving releases the port, the lease and the learned neighbors
    a.session.disconnect().await;
    wait_for(|| server.clients().len() == 1).await;
    assert_eq!(bridge.port_count(), 1);
    assert_eq!(server.handler().leases("corp").len(), 1);
    assert!(server.handler().neighbors().is_empty());

    b.session.disconnect().await;
    server.stop().await;
}

#[tokio::test]
async fn wrong_password_is_rejected() {
    let server = SwitchServer::bind(switch_config()).await.unwrap();
    let mut intruder = Endpoint::new(&server, "alice", "guess", "intruder");

    wait_for(|| server.clients().len() == 1).await;
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert!(!intruder.session.is_authenticated());
    assert!(server.clients()[0].user.is_none());
    assert!(intruder.events.try_recv().is_err());

    // Data from an unauthenticated client never reaches a bridge
    assert!(server.registry().get("corp").is_none());

    intruder.session.disconnect().await;
    server.stop().await;
}

#[tokio::test]
async fn same_uuid_kicks_previous_connection() {
    let server = SwitchServer::bind(switch_config()).await.unwrap();
    let mut first = Endpoint::new(&server, "alice", "secret", "laptop");
    first.leased().await;
    let first_id = server.clients()[0].id;

    let mut second = Endpoint::new(&server, "alice", "secret", "laptop");
    second.leased().await;

    wait_for(|| {
        let clients = server.clients();
        clients.len() == 1 && clients[0].id != first_id
    })
    .await;

    first.session.disconnect().await;
    second.session.disconnect().await;
    server.stop().await;
}

/// Read from a raw switch-side socket until the endpoint's login arrives.
async fn read_login(stream: &mut TcpStream) {
    let mut codec = FrameCodec::default();
    let mut buf = vec![0u8; 4096];
    loop {
        let n = tokio::time::timeout(WAIT, stream.read(&mut buf))
            .await
            .expect("timed out")
            .unwrap();
        assert!(n > 0, "endpoint hung up before login");
        let frames = codec.feed(&buf[..n]).unwrap();
        if frames.iter().any(|f| f.action() == Some(Action::LoginReq)) {
            return;
        }
    }
}

#[tokio::test]
async fn unknown_control_frame_keeps_session_up() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap().to_string();

    let (tx, mut events) = mpsc::unbounded_channel();
    let transport = TcpTransport::new(&addr, Duration::from_secs(5), DEFAULT_MAX_SIZE);
    let session = Session::new(
        SessionConfig::new("raw", User::new("alice", "corp", "secret")),
        Arc::new(transport),
        Arc::new(Recorder { tx }),
    );
    session.connect().unwrap();

    let (mut stream, _) = tokio::time::timeout(WAIT, listener.accept())
        .await
        .expect("timed out")
        .unwrap();
    read_login(&mut stream).await;

    let data = Bytes::from_static(b"payload");
    let pong = PingMessage {
        datetime: unix_nanos() - 50_000_000,
        ..Default::default()
    };
    let mut wire = BytesMut::new();
    wire.extend_from_slice(&Frame::control(Action::LoginResp, &b"okay"[..]).encode().unwrap());
    wire.extend_from_slice(&Frame::Data(data.clone()).encode().unwrap());
    wire.extend_from_slice(&[0x00, 0x08, FLAG_CONTROL]);
    wire.extend_from_slice(b"nego= {}");
    wire.extend_from_slice(&Frame::control_json(Action::PongResp, &pong).unwrap().encode().unwrap());
    stream.write_all(&wire).await.unwrap();

    let mut got_success = false;
    let mut frames = Vec::new();
    while !got_success || frames.is_empty() {
        match tokio::time::timeout(WAIT, events.recv()).await.expect("timed out") {
            Some(Event::Success) => got_success = true,
            Some(Event::Frame(frame)) => frames.push(frame),
            Some(Event::IpAddr(_)) => {}
            None => panic!("listener dropped"),
        }
    }
    assert_eq!(frames, vec![data]);

    // The pong after the bad frame was still processed
    let mut latency = 0;
    for _ in 0..50 {
        latency = session.status().await.latency_ms;
        if latency > 0 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    assert!(latency >= 50, "latency {latency}");

    let status = session.status().await;
    assert_eq!(status.state, SessionState::Authenticated);
    assert_eq!(status.connects, 1);
    assert_eq!(status.statistics.drops, 1);

    session.disconnect().await;
}
