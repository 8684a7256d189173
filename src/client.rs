//! Client-side connection manager: the dial state machine.
//!
//! `Idle -[connect]-> Connecting -[success]-> Connected -[disconnect]-> Idle`,
//! with `Connecting` falling back to `Idle` on timeout, failure or
//! cancellation. Only one attempt is ever in flight.
//!
//! The caller drives the machine by invoking [`Client::update`] at a steady
//! cadence; that is the only place transport events are dequeued. The
//! hole-punch loop runs on a helper thread but never polls the transport, it
//! only fires unconnected datagrams and watches the cancellation flag.

use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use bytes::Bytes;
use parking_lot::Mutex;

use crate::endpoint::{self, ConnectionType};
use crate::error::{Error, Result};
use crate::event::{DisconnectReason, PeerEvent, PeerEventBus};
use crate::public_ip::{HttpIpResolver, PublicIpResolver};
use crate::server_code::ServerCode;
use crate::transport::{
    Admission, DeliveryMode, PeerHandle, TransportListener, TransportSession, PUNCH, PUNCH_ACK,
};

/// Round budget and cadence of the hole-punch loop.
pub const PUNCH_ROUNDS: u32 = 100;
pub const PUNCH_INTERVAL: Duration = Duration::from_millis(100);

/// Deadline for a direct connect attempt.
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Idle,
    Connecting,
    Connected,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DialStrategy {
    Direct,
    HolePunch,
}

/// One traversal strategy in progress.
struct DialAttempt {
    strategy: DialStrategy,
    target: SocketAddr,
    key: String,
    deadline: Instant,
    /// Guards the ACK-triggered connect: a second ACK must not fire a second
    /// connect while one is outstanding.
    connect_issued: bool,
    cancel: Arc<AtomicBool>,
}

struct ClientState {
    phase: ConnectionState,
    server_peer: Option<PeerHandle>,
    /// Peer we told the transport to close; its terminal Disconnected event
    /// is still owed to the subscriber.
    closing_peer: Option<PeerHandle>,
    attempt: Option<DialAttempt>,
}

struct TransportCell {
    session: Box<dyn TransportSession>,
    started: bool,
}

impl TransportCell {
    fn ensure_started(&mut self) -> Result<()> {
        if !self.started {
            self.session.start(0)?;
            self.started = true;
        }
        Ok(())
    }
}

pub struct Client {
    transport: Arc<Mutex<TransportCell>>,
    state: Mutex<ClientState>,
    events: PeerEventBus,
    resolver: Box<dyn PublicIpResolver>,
    local_ip: Option<Ipv4Addr>,
    punch_rounds: u32,
    punch_interval: Duration,
    punch_thread: Mutex<Option<thread::JoinHandle<()>>>,
}

impl Client {
    pub fn new(transport: Box<dyn TransportSession>) -> Client {
        Client {
            transport: Arc::new(Mutex::new(TransportCell {
                session: transport,
                started: false,
            })),
            state: Mutex::new(ClientState {
                phase: ConnectionState::Idle,
                server_peer: None,
                closing_peer: None,
                attempt: None,
            }),
            events: PeerEventBus::new(),
            resolver: Box::new(HttpIpResolver::new()),
            local_ip: endpoint::local_ipv4().ok(),
            punch_rounds: PUNCH_ROUNDS,
            punch_interval: PUNCH_INTERVAL,
            punch_thread: Mutex::new(None),
        }
    }

    pub fn set_resolver(mut self, resolver: Box<dyn PublicIpResolver>) -> Self {
        self.resolver = resolver;
        self
    }

    pub fn set_local_ip(mut self, local_ip: Option<Ipv4Addr>) -> Self {
        self.local_ip = local_ip;
        self
    }

    pub fn set_punch_schedule(mut self, rounds: u32, interval: Duration) -> Self {
        self.punch_rounds = rounds;
        self.punch_interval = interval;
        self
    }

    pub fn events(&self) -> &PeerEventBus {
        &self.events
    }

    /// Install the event subscriber, replacing any previous one.
    pub fn subscribe<F: FnMut(PeerEvent) + Send + 'static>(&self, subscriber: F) {
        self.events.subscribe(subscriber);
    }

    pub fn state(&self) -> ConnectionState {
        self.state.lock().phase
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    pub fn is_connecting(&self) -> bool {
        self.state() == ConnectionState::Connecting
    }

    /// Start dialing `target`: either a literal `host:port` endpoint or an
    /// encoded server code. `key` is attached to the connect handshake.
    ///
    /// While already connecting or connected this is a no-op that emits one
    /// `NetworkError` and returns `AlreadyConnectedOrConnecting`.
    pub fn connect(&self, target: &str, key: &str) -> Result<()> {
        {
            let mut state = self.state.lock();
            if state.phase != ConnectionState::Idle {
                drop(state);
                self.events.publish(PeerEvent::NetworkError {
                    peer: None,
                    detail: "already connected or connecting".to_string(),
                });
                return Err(Error::AlreadyConnectedOrConnecting);
            }
            // Reserve the attempt slot before the blocking work below.
            state.phase = ConnectionState::Connecting;
        }
        match self.begin_dial(target, key) {
            Ok(()) => Ok(()),
            Err(e) => {
                {
                    let mut state = self.state.lock();
                    state.phase = ConnectionState::Idle;
                    state.attempt = None;
                }
                self.events.publish(PeerEvent::NetworkError {
                    peer: None,
                    detail: e.to_string(),
                });
                Err(e)
            }
        }
    }

    /// `connect` with the endpoint given as separate host and port.
    pub fn connect_to(&self, host: &str, port: u16, key: &str) -> Result<()> {
        self.connect(&format!("{host}:{port}"), key)
    }

    fn begin_dial(&self, target: &str, key: &str) -> Result<()> {
        self.transport.lock().ensure_started()?;
        // Best-effort: an unknown public address only degrades classification.
        let public_ip = self.resolver.resolve().ok();
        let addr = self.resolve_target(target, public_ip)?;
        let connection_type = endpoint::classify(*addr.ip(), self.local_ip, public_ip);
        let target = SocketAddr::V4(addr);
        let cancel = Arc::new(AtomicBool::new(false));
        let (strategy, deadline, connect_issued) = match connection_type {
            ConnectionType::Loopback | ConnectionType::Lan => {
                log::debug!("dialing {target} directly ({connection_type:?})");
                self.transport.lock().session.connect(target, key)?;
                (DialStrategy::Direct, Instant::now() + CONNECT_TIMEOUT, true)
            }
            ConnectionType::Internet => {
                log::debug!(
                    "dialing {target} via hole punch, {} rounds at {:?}",
                    self.punch_rounds,
                    self.punch_interval
                );
                self.spawn_punch_loop(target, cancel.clone());
                let budget = self.punch_interval * self.punch_rounds;
                (DialStrategy::HolePunch, Instant::now() + budget, false)
            }
        };
        let mut state = self.state.lock();
        state.attempt = Some(DialAttempt {
            strategy,
            target,
            key: key.to_string(),
            deadline,
            connect_issued,
            cancel,
        });
        Ok(())
    }

    fn resolve_target(&self, target: &str, public_ip: Option<Ipv4Addr>) -> Result<SocketAddrV4> {
        if let Ok(addr) = endpoint::parse_endpoint(target) {
            return Ok(addr);
        }
        let code = ServerCode::decode(target)?;
        Ok(endpoint::select_best_endpoint(
            &code,
            self.local_ip,
            public_ip,
        ))
    }

    fn spawn_punch_loop(&self, target: SocketAddr, cancel: Arc<AtomicBool>) {
        // A previous loop is already cancelled; reap it before starting anew.
        if let Some(handle) = self.punch_thread.lock().take() {
            let _ = handle.join();
        }
        let transport = self.transport.clone();
        let rounds = self.punch_rounds;
        let interval = self.punch_interval;
        let handle = thread::spawn(move || {
            for _ in 0..rounds {
                if cancel.load(Ordering::Acquire) {
                    return;
                }
                if let Err(e) = transport.lock().session.send_unconnected(target, PUNCH) {
                    log::debug!("punch datagram to {target} failed: {e}");
                }
                thread::sleep(interval);
            }
        });
        *self.punch_thread.lock() = Some(handle);
    }

    /// Ask a facilitator both peers already talk to for a NAT introduction.
    pub fn connect_via_introducer(&self, facilitator: &str, token: &str) -> Result<()> {
        let addr = SocketAddr::V4(endpoint::parse_endpoint(facilitator)?);
        {
            let mut cell = self.transport.lock();
            cell.ensure_started()?;
            cell.session
                .send_unconnected(addr, format!("INTRODUCE {token}").as_bytes())?;
        }
        self.events.publish(PeerEvent::NetworkInfo {
            detail: format!("nat introduction requested for token {token}"),
        });
        Ok(())
    }

    /// Advance the state machine: drain transport events and check deadlines.
    /// Call at a steady cadence; never blocks.
    pub fn update(&self) {
        let mut listener = ClientListener {
            state: &self.state,
            pending: Vec::new(),
            actions: Vec::new(),
        };
        {
            let mut cell = self.transport.lock();
            if cell.started {
                cell.session.poll(&mut listener);
            }
        }
        // Events go out only after the transport lock is released so a
        // subscriber may call back into this client from its callback.
        for event in listener.pending {
            self.events.publish(event);
        }
        for action in listener.actions {
            self.apply(action);
        }
        self.check_deadline();
    }

    fn apply(&self, action: DeferredAction) {
        match action {
            DeferredAction::Connect { target, key } => {
                let result = self.transport.lock().session.connect(target, &key);
                if let Err(e) = result {
                    {
                        let mut state = self.state.lock();
                        if let Some(attempt) = state.attempt.take() {
                            attempt.cancel.store(true, Ordering::Release);
                        }
                        state.phase = ConnectionState::Idle;
                    }
                    self.events.publish(PeerEvent::NetworkError {
                        peer: None,
                        detail: format!("connect to {target} failed: {e}"),
                    });
                }
            }
            DeferredAction::ReplyAck { to } => {
                if let Err(e) = self.transport.lock().session.send_unconnected(to, PUNCH_ACK) {
                    log::debug!("punch ack to {to} failed: {e}");
                }
            }
            DeferredAction::Drop { peer } => {
                self.transport.lock().session.disconnect_peer(&peer);
            }
        }
    }

    fn check_deadline(&self) {
        let expired = {
            let mut state = self.state.lock();
            let due = state.phase == ConnectionState::Connecting
                && state
                    .attempt
                    .as_ref()
                    .is_some_and(|a| Instant::now() >= a.deadline);
            if due {
                state.phase = ConnectionState::Idle;
                state.attempt.take().map(|attempt| {
                    attempt.cancel.store(true, Ordering::Release);
                    attempt.strategy
                })
            } else {
                None
            }
        };
        if let Some(strategy) = expired {
            let error = match strategy {
                DialStrategy::HolePunch => Error::HolePunchTimeout {
                    rounds: self.punch_rounds,
                },
                DialStrategy::Direct => Error::ConnectTimeout,
            };
            log::debug!("dial attempt expired: {error}");
            self.events.publish(PeerEvent::NetworkError {
                peer: None,
                detail: error.to_string(),
            });
        }
    }

    /// Idempotent; cancels any outstanding attempt and closes the server peer
    /// if one exists. The terminal `Disconnected` event arrives through a
    /// later `update` once the transport confirms the close.
    pub fn disconnect(&self) {
        let peer = {
            let mut state = self.state.lock();
            if let Some(attempt) = state.attempt.take() {
                attempt.cancel.store(true, Ordering::Release);
            }
            state.phase = ConnectionState::Idle;
            let peer = state.server_peer.take();
            let prev_closing = state.closing_peer.take();
            state.closing_peer = peer.clone().or(prev_closing);
            peer
        };
        // The loop re-checks the flag within one interval, so this is bounded.
        if let Some(handle) = self.punch_thread.lock().take() {
            let _ = handle.join();
        }
        if let Some(peer) = peer {
            self.transport.lock().session.disconnect_peer(&peer);
        }
    }

    /// Send to the server. Silent no-op when not connected: send call sites
    /// run every frame and are not expected to track connection state.
    pub fn send_to_server(&self, payload: &[u8], mode: DeliveryMode) {
        let peer = {
            let state = self.state.lock();
            if state.phase != ConnectionState::Connected {
                return;
            }
            state.server_peer.clone()
        };
        if let Some(peer) = peer {
            if let Err(e) = self.transport.lock().session.send(&peer, payload, mode) {
                log::debug!("send to server failed: {e}");
            }
        }
    }

    /// Round-trip latency to the server, `None` unless connected.
    pub fn server_latency(&self) -> Option<Duration> {
        let peer = {
            let state = self.state.lock();
            if state.phase != ConnectionState::Connected {
                return None;
            }
            state.server_peer.clone()
        }?;
        self.transport.lock().session.latency(&peer)
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        self.disconnect();
        let mut cell = self.transport.lock();
        if cell.started {
            cell.session.stop();
        }
    }
}

enum DeferredAction {
    Connect { target: SocketAddr, key: String },
    ReplyAck { to: SocketAddr },
    Drop { peer: PeerHandle },
}

/// Translates transport events into state transitions and peer events.
/// Both actions that would re-enter the transport and the peer events
/// themselves are deferred until `poll` returns and the transport lock is
/// released.
struct ClientListener<'a> {
    state: &'a Mutex<ClientState>,
    pending: Vec<PeerEvent>,
    actions: Vec<DeferredAction>,
}

impl TransportListener for ClientListener<'_> {
    fn on_connection_request(&mut self, from: SocketAddr, _key: &str) -> Admission {
        log::debug!("rejecting inbound connection request from {from} on client transport");
        Admission::Reject("not accepting connections")
    }

    fn on_connected(&mut self, peer: PeerHandle) {
        let mut state = self.state.lock();
        if state.phase == ConnectionState::Connected {
            // A second completion for the same attempt lost the race; keep
            // exactly one active server peer.
            log::debug!("superseded connect completion from {peer}, dropping");
            self.actions.push(DeferredAction::Drop { peer });
            return;
        }
        if let Some(attempt) = state.attempt.take() {
            attempt.cancel.store(true, Ordering::Release);
        }
        state.phase = ConnectionState::Connected;
        state.server_peer = Some(peer.clone());
        drop(state);
        self.pending.push(PeerEvent::Connected { peer });
    }

    fn on_disconnected(&mut self, peer: PeerHandle, reason: DisconnectReason) {
        let mut state = self.state.lock();
        // A close confirmation for a peer we already let go must not touch
        // whatever attempt has started since.
        if state.closing_peer.as_ref() == Some(&peer) {
            state.closing_peer = None;
            drop(state);
            self.pending.push(PeerEvent::Disconnected { peer, reason });
            return;
        }
        let was_server = state.server_peer.as_ref() == Some(&peer);
        let failed_dial = state.phase == ConnectionState::Connecting
            && state
                .attempt
                .as_ref()
                .is_some_and(|attempt| attempt.target == peer.addr);
        if !(was_server || failed_dial) {
            log::debug!("disconnect for unknown peer {peer} ignored");
            return;
        }
        if let Some(attempt) = state.attempt.take() {
            attempt.cancel.store(true, Ordering::Release);
        }
        state.phase = ConnectionState::Idle;
        state.server_peer = None;
        drop(state);
        self.pending.push(PeerEvent::Disconnected { peer, reason });
    }

    fn on_receive(&mut self, peer: &PeerHandle, payload: &[u8]) {
        self.pending.push(PeerEvent::MessageReceived {
            peer: peer.clone(),
            payload: Bytes::copy_from_slice(payload),
        });
    }

    fn on_unconnected_receive(&mut self, from: SocketAddr, payload: &[u8]) {
        if payload == PUNCH {
            // The peer is punching toward us; answer so its loop can connect.
            self.actions.push(DeferredAction::ReplyAck { to: from });
            return;
        }
        if payload == PUNCH_ACK {
            let mut state = self.state.lock();
            if let Some(attempt) = state.attempt.as_mut() {
                if attempt.strategy == DialStrategy::HolePunch
                    && attempt.target == from
                    && !attempt.connect_issued
                {
                    attempt.connect_issued = true;
                    self.actions.push(DeferredAction::Connect {
                        target: attempt.target,
                        key: attempt.key.clone(),
                    });
                }
            }
            return;
        }
        self.pending.push(PeerEvent::NetworkInfo {
            detail: format!("unconnected message from {from}"),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::{FakeTransport, Inbound};
    use crate::public_ip::StaticIpResolver;

    const LOCAL_IP: &str = "192.168.0.2";
    const PUBLIC_IP: &str = "198.51.100.1";

    fn test_client(fake: &FakeTransport) -> Client {
        Client::new(Box::new(fake.clone()))
            .set_local_ip(Some(LOCAL_IP.parse().unwrap()))
            .set_resolver(Box::new(StaticIpResolver(Some(PUBLIC_IP.parse().unwrap()))))
            .set_punch_schedule(3, Duration::from_millis(5))
    }

    fn collect_events(client: &Client) -> Arc<Mutex<Vec<PeerEvent>>> {
        let events = Arc::new(Mutex::new(Vec::new()));
        let sink = events.clone();
        client.subscribe(move |event| sink.lock().push(event));
        events
    }

    fn error_count(events: &Mutex<Vec<PeerEvent>>) -> usize {
        events
            .lock()
            .iter()
            .filter(|e| matches!(e, PeerEvent::NetworkError { .. }))
            .count()
    }

    fn addr(s: &str) -> SocketAddr {
        s.parse().unwrap()
    }

    #[test]
    fn lan_target_connects_directly() {
        let fake = FakeTransport::new();
        let client = test_client(&fake);

        client.connect("192.168.0.50:7777", "key").unwrap();
        assert!(client.is_connecting());
        let inner = fake.inner.lock();
        assert_eq!(inner.connects.len(), 1);
        assert_eq!(inner.connects[0], (addr("192.168.0.50:7777"), "key".into()));
        assert!(inner.unconnected_sent.is_empty());
    }

    #[test]
    fn extraneous_connect_calls_emit_one_error_each() {
        let fake = FakeTransport::new();
        let client = test_client(&fake);
        let events = collect_events(&client);

        client.connect("192.168.0.50:7777", "key").unwrap();
        for _ in 0..3 {
            assert!(matches!(
                client.connect("192.168.0.50:7777", "key"),
                Err(Error::AlreadyConnectedOrConnecting)
            ));
        }

        assert_eq!(error_count(&events), 3);
        assert_eq!(fake.inner.lock().connects.len(), 1);
    }

    #[test]
    fn invalid_target_resets_to_idle() {
        let fake = FakeTransport::new();
        let client = test_client(&fake);
        let events = collect_events(&client);

        assert!(client.connect("complete nonsense", "key").is_err());
        assert_eq!(client.state(), ConnectionState::Idle);
        assert_eq!(error_count(&events), 1);

        // The slot is free again.
        client.connect("192.168.0.50:7777", "key").unwrap();
    }

    #[test]
    fn internet_target_punches_then_times_out() {
        let _ = env_logger::builder().is_test(true).try_init();
        let fake = FakeTransport::new();
        let client = test_client(&fake);
        let events = collect_events(&client);

        client.connect("8.8.8.8:7777", "key").unwrap();
        assert!(client.is_connecting());

        // Round budget is 3 x 5ms; wait well past it.
        thread::sleep(Duration::from_millis(60));
        client.update();

        assert_eq!(client.state(), ConnectionState::Idle);
        let inner = fake.inner.lock();
        assert!(inner.connects.is_empty());
        assert!(inner.unconnected_sent.len() <= 3);
        assert!(!inner.unconnected_sent.is_empty());
        for (target, payload) in &inner.unconnected_sent {
            assert_eq!(*target, addr("8.8.8.8:7777"));
            assert_eq!(payload.as_slice(), PUNCH);
        }
        drop(inner);
        let events = events.lock();
        assert!(events.iter().any(|e| matches!(
            e,
            PeerEvent::NetworkError { detail, .. } if detail.contains("hole punch")
        )));
    }

    #[test]
    fn punch_ack_triggers_exactly_one_connect() {
        let fake = FakeTransport::new();
        let client = Client::new(Box::new(fake.clone()))
            .set_local_ip(Some(LOCAL_IP.parse().unwrap()))
            .set_resolver(Box::new(StaticIpResolver(Some(PUBLIC_IP.parse().unwrap()))))
            .set_punch_schedule(50, Duration::from_millis(10));

        client.connect("8.8.8.8:7777", "key").unwrap();
        for _ in 0..2 {
            fake.push(Inbound::Unconnected {
                from: addr("8.8.8.8:7777"),
                payload: PUNCH_ACK.to_vec(),
            });
        }
        client.update();
        assert_eq!(fake.inner.lock().connects.len(), 1);

        // A late ACK after the connect is still ignored.
        fake.push(Inbound::Unconnected {
            from: addr("8.8.8.8:7777"),
            payload: PUNCH_ACK.to_vec(),
        });
        client.update();
        assert_eq!(fake.inner.lock().connects.len(), 1);

        client.disconnect();
    }

    #[test]
    fn ack_from_wrong_source_is_ignored() {
        let fake = FakeTransport::new();
        let client = Client::new(Box::new(fake.clone()))
            .set_local_ip(Some(LOCAL_IP.parse().unwrap()))
            .set_resolver(Box::new(StaticIpResolver(Some(PUBLIC_IP.parse().unwrap()))))
            .set_punch_schedule(50, Duration::from_millis(10));

        client.connect("8.8.8.8:7777", "key").unwrap();
        fake.push(Inbound::Unconnected {
            from: addr("203.0.113.99:7777"),
            payload: PUNCH_ACK.to_vec(),
        });
        client.update();
        assert!(fake.inner.lock().connects.is_empty());

        client.disconnect();
    }

    #[test]
    fn inbound_punch_is_answered_with_ack() {
        let fake = FakeTransport::new();
        let client = test_client(&fake);
        client.connect("192.168.0.50:7777", "key").unwrap();

        fake.push(Inbound::Unconnected {
            from: addr("203.0.113.5:6000"),
            payload: PUNCH.to_vec(),
        });
        client.update();

        let inner = fake.inner.lock();
        assert!(inner
            .unconnected_sent
            .iter()
            .any(|(to, payload)| *to == addr("203.0.113.5:6000") && payload == PUNCH_ACK));
    }

    #[test]
    fn second_success_is_superseded() {
        let fake = FakeTransport::new();
        let client = test_client(&fake);
        let events = collect_events(&client);

        client.connect("192.168.0.50:7777", "key").unwrap();
        let winner = fake.peer(addr("192.168.0.50:7777"));
        let loser = fake.peer(addr("192.168.0.50:7777"));
        fake.push(Inbound::Connected {
            peer: winner.clone(),
        });
        fake.push(Inbound::Connected { peer: loser.clone() });
        client.update();

        assert!(client.is_connected());
        assert_eq!(fake.inner.lock().disconnect_calls, vec![loser]);

        // The loser's close confirmation must not disturb the winner.
        client.update();
        assert!(client.is_connected());
        let events = events.lock();
        let connected = events
            .iter()
            .filter(|e| matches!(e, PeerEvent::Connected { .. }))
            .count();
        let disconnected = events
            .iter()
            .filter(|e| matches!(e, PeerEvent::Disconnected { .. }))
            .count();
        assert_eq!(connected, 1);
        assert_eq!(disconnected, 0);
        let _ = winner;
    }

    #[test]
    fn connected_peer_gets_one_terminal_disconnected_event() {
        let fake = FakeTransport::new();
        let client = test_client(&fake);
        let events = collect_events(&client);

        client.connect("192.168.0.50:7777", "key").unwrap();
        let peer = fake.peer(addr("192.168.0.50:7777"));
        fake.push(Inbound::Connected { peer: peer.clone() });
        client.update();
        assert!(client.is_connected());

        client.disconnect();
        assert_eq!(client.state(), ConnectionState::Idle);
        client.update();
        client.update();

        let events = events.lock();
        let disconnected: Vec<_> = events
            .iter()
            .filter(|e| matches!(e, PeerEvent::Disconnected { .. }))
            .collect();
        assert_eq!(disconnected.len(), 1);
    }

    #[test]
    fn disconnect_is_idempotent() {
        let fake = FakeTransport::new();
        let client = test_client(&fake);
        client.disconnect();
        client.disconnect();
        assert_eq!(client.state(), ConnectionState::Idle);
    }

    #[test]
    fn disconnect_cancels_punch_loop_quickly() {
        let fake = FakeTransport::new();
        let client = Client::new(Box::new(fake.clone()))
            .set_local_ip(Some(LOCAL_IP.parse().unwrap()))
            .set_resolver(Box::new(StaticIpResolver(Some(PUBLIC_IP.parse().unwrap()))))
            .set_punch_schedule(1000, Duration::from_millis(5));

        client.connect("8.8.8.8:7777", "key").unwrap();
        client.disconnect();

        let sent_at_disconnect = fake.inner.lock().unconnected_sent.len();
        thread::sleep(Duration::from_millis(30));
        assert_eq!(fake.inner.lock().unconnected_sent.len(), sent_at_disconnect);
        assert!(fake.inner.lock().connects.is_empty());
        assert_eq!(client.state(), ConnectionState::Idle);
    }

    #[test]
    fn failed_dial_surfaces_disconnected_and_resets() {
        let fake = FakeTransport::new();
        let client = test_client(&fake);
        let events = collect_events(&client);

        client.connect("192.168.0.50:7777", "key").unwrap();
        let peer = fake.peer(addr("192.168.0.50:7777"));
        fake.push(Inbound::Disconnected {
            peer,
            reason: DisconnectReason::ConnectionFailed,
        });
        client.update();

        assert_eq!(client.state(), ConnectionState::Idle);
        assert!(events.lock().iter().any(|e| matches!(
            e,
            PeerEvent::Disconnected {
                reason: DisconnectReason::ConnectionFailed,
                ..
            }
        )));
    }

    #[test]
    fn direct_dial_times_out() {
        let fake = FakeTransport::new();
        let client = test_client(&fake);
        let events = collect_events(&client);

        client.connect("192.168.0.50:7777", "key").unwrap();
        // Simulate the deadline having passed.
        {
            let mut state = client.state.lock();
            if let Some(attempt) = state.attempt.as_mut() {
                attempt.deadline = Instant::now() - Duration::from_millis(1);
            }
        }
        client.update();

        assert_eq!(client.state(), ConnectionState::Idle);
        assert!(events.lock().iter().any(|e| matches!(
            e,
            PeerEvent::NetworkError { detail, .. } if detail.contains("timed out")
        )));
    }

    #[test]
    fn send_is_a_noop_unless_connected() {
        let fake = FakeTransport::new();
        let client = test_client(&fake);

        client.send_to_server(b"hello", DeliveryMode::ReliableOrdered);
        assert!(fake.inner.lock().sent.is_empty());

        client.connect("192.168.0.50:7777", "key").unwrap();
        let peer = fake.peer(addr("192.168.0.50:7777"));
        fake.push(Inbound::Connected { peer: peer.clone() });
        client.update();

        client.send_to_server(b"hello", DeliveryMode::ReliableOrdered);
        let inner = fake.inner.lock();
        assert_eq!(inner.sent.len(), 1);
        assert_eq!(inner.sent[0].0, peer);
    }

    #[test]
    fn server_code_target_selects_loopback_on_same_machine() {
        let fake = FakeTransport::new();
        let client = test_client(&fake);
        let code = ServerCode {
            port: 7777,
            lan_ip: LOCAL_IP.parse().unwrap(),
            public_ip: "203.0.113.9".parse().unwrap(),
        };

        client.connect(&code.encode(), "key").unwrap();
        let inner = fake.inner.lock();
        assert_eq!(inner.connects.len(), 1);
        assert_eq!(inner.connects[0].0, addr("127.0.0.1:7777"));
    }

    #[test]
    fn messages_and_latency_flow_through() {
        let fake = FakeTransport::new();
        fake.inner.lock().latency = Some(Duration::from_millis(42));
        let client = test_client(&fake);
        let events = collect_events(&client);

        assert_eq!(client.server_latency(), None);

        client.connect("192.168.0.50:7777", "key").unwrap();
        let peer = fake.peer(addr("192.168.0.50:7777"));
        fake.push(Inbound::Connected { peer: peer.clone() });
        fake.push(Inbound::Message {
            peer,
            payload: b"state".to_vec(),
        });
        client.update();

        assert_eq!(client.server_latency(), Some(Duration::from_millis(42)));
        assert!(events.lock().iter().any(|e| matches!(
            e,
            PeerEvent::MessageReceived { payload, .. } if payload.as_ref() == b"state"
        )));
    }

    #[test]
    fn subscriber_may_send_from_the_message_callback() {
        let fake = FakeTransport::new();
        let client = Arc::new(test_client(&fake));
        let handle = client.clone();
        client.subscribe(move |event| {
            if matches!(event, PeerEvent::MessageReceived { .. }) {
                handle.send_to_server(b"reply", DeliveryMode::ReliableOrdered);
            }
        });

        client.connect("192.168.0.50:7777", "key").unwrap();
        let peer = fake.peer(addr("192.168.0.50:7777"));
        fake.push(Inbound::Connected { peer: peer.clone() });
        fake.push(Inbound::Message {
            peer,
            payload: b"ping".to_vec(),
        });
        client.update();

        assert!(fake
            .inner
            .lock()
            .sent
            .iter()
            .any(|(_, payload, _)| payload.as_slice() == b"reply"));
    }

    #[test]
    fn reconnect_while_close_pending_keeps_the_new_attempt() {
        let fake = FakeTransport::new();
        let client = test_client(&fake);
        let events = collect_events(&client);

        client.connect("192.168.0.50:7777", "key").unwrap();
        let old = fake.peer(addr("192.168.0.50:7777"));
        fake.push(Inbound::Connected { peer: old });
        client.update();
        client.disconnect();

        // The old peer's close confirmation is still queued when the next
        // dial starts; it must not cancel the fresh attempt.
        client.connect("192.168.0.60:7777", "key").unwrap();
        client.update();
        assert!(client.is_connecting());
        assert_eq!(fake.inner.lock().connects.len(), 2);

        let new_peer = fake.peer(addr("192.168.0.60:7777"));
        fake.push(Inbound::Connected { peer: new_peer });
        client.update();
        assert!(client.is_connected());

        let events = events.lock();
        let disconnected = events
            .iter()
            .filter(|e| matches!(e, PeerEvent::Disconnected { .. }))
            .count();
        assert_eq!(disconnected, 1);
    }
}
