//! Server-side connection manager: listen, admit, track peers.
//!
//! `start` binds the transport and spawns a polling thread that ticks at the
//! configured rate; `stop` tears everything down in order (shutdown notice,
//! port mapping, thread, transport). Admission is decided inside the poll
//! callback: capacity first, then the connection key.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use bytes::Bytes;
use dashmap::DashMap;
use parking_lot::Mutex;

use crate::config::ServerConfig;
use crate::endpoint;
use crate::error::{Error, Result};
use crate::event::{PeerEvent, PeerEventBus};
use crate::public_ip::PublicIpResolver;
use crate::server_code::ServerCode;
use crate::transport::{
    Admission, DeliveryMode, PeerHandle, TransportListener, TransportSession, PUNCH, PUNCH_ACK,
};
use crate::upnp::PortMapping;

/// Bound on waiting for the polling thread during `stop`; past it the thread
/// is detached and left to finish on its own.
pub const STOP_JOIN_TIMEOUT: Duration = Duration::from_secs(5);

const HEARTBEAT_PAYLOAD: &[u8] = b"heartbeat";
const SHUTDOWN_NOTICE: &[u8] = b"Server is shutting down";

#[derive(Default)]
struct Lifecycle {
    thread: Option<thread::JoinHandle<()>>,
    mapping: Option<PortMapping>,
}

pub struct Server {
    config: ServerConfig,
    transport: Arc<Mutex<Box<dyn TransportSession>>>,
    peers: Arc<DashMap<u64, PeerHandle>>,
    events: PeerEventBus,
    running: Arc<AtomicBool>,
    lifecycle: Mutex<Lifecycle>,
}

impl Server {
    pub fn new(config: ServerConfig, transport: Box<dyn TransportSession>) -> Server {
        Server {
            config,
            transport: Arc::new(Mutex::new(transport)),
            peers: Arc::new(DashMap::new()),
            events: PeerEventBus::new(),
            running: Arc::new(AtomicBool::new(false)),
            lifecycle: Mutex::new(Lifecycle::default()),
        }
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn events(&self) -> &PeerEventBus {
        &self.events
    }

    /// Install the event subscriber, replacing any previous one.
    pub fn subscribe<F: FnMut(PeerEvent) + Send + 'static>(&self, subscriber: F) {
        self.events.subscribe(subscriber);
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Bind the transport and spawn the polling thread. No-op when already
    /// running. A failed UPnP mapping is reported but does not abort startup.
    pub fn start(&self) -> Result<()> {
        let mut lifecycle = self.lifecycle.lock();
        if self.running.load(Ordering::Acquire) {
            return Ok(());
        }
        if self.config.tick_rate == 0 {
            return Err(Error::Config("tickRate must be at least 1".to_string()));
        }
        self.transport.lock().start(self.config.server_port)?;
        if self.config.enable_upnp {
            match PortMapping::establish(self.config.server_port) {
                Ok(mapping) => {
                    self.events.publish(PeerEvent::NetworkInfo {
                        detail: format!(
                            "UPnP mapping established on port {}",
                            self.config.server_port
                        ),
                    });
                    lifecycle.mapping = Some(mapping);
                }
                Err(e) => {
                    log::warn!("UPnP mapping failed, relying on manual forwarding: {e}");
                    self.events.publish(PeerEvent::NetworkError {
                        peer: None,
                        detail: format!("UPnP mapping failed: {e}"),
                    });
                }
            }
        }
        self.running.store(true, Ordering::Release);
        let tick_interval = Duration::from_millis((1000 / self.config.tick_rate).max(1) as u64);
        let transport = self.transport.clone();
        let peers = self.peers.clone();
        let events = self.events.clone();
        let running = self.running.clone();
        let config = self.config.clone();
        lifecycle.thread = Some(thread::spawn(move || {
            poll_loop(transport, peers, events, running, config, tick_interval);
        }));
        log::info!(
            "server '{}' listening on port {} ({} slots)",
            self.config.server_name,
            self.config.server_port,
            self.config.max_players
        );
        Ok(())
    }

    /// Stop listening. Idempotent. Connected peers get a shutdown notice, the
    /// port mapping is removed, then the polling thread is joined with a
    /// bounded wait before the transport is closed.
    pub fn stop(&self) {
        let mut lifecycle = self.lifecycle.lock();
        if !self.running.swap(false, Ordering::AcqRel) {
            return;
        }
        if !self.peers.is_empty() {
            let mut transport = self.transport.lock();
            for entry in self.peers.iter() {
                if let Err(e) =
                    transport.send(entry.value(), SHUTDOWN_NOTICE, DeliveryMode::ReliableOrdered)
                {
                    log::debug!("shutdown notice to {} failed: {e}", entry.value());
                }
            }
            drop(transport);
            self.events.publish(PeerEvent::NetworkInfo {
                detail: "shutdown notice sent to connected peers".to_string(),
            });
            // Give the transport a moment to flush the notices.
            thread::sleep(Duration::from_millis(50));
        }
        if let Some(mapping) = lifecycle.mapping.take() {
            mapping.remove();
        }
        if let Some(handle) = lifecycle.thread.take() {
            let deadline = Instant::now() + STOP_JOIN_TIMEOUT;
            while !handle.is_finished() && Instant::now() < deadline {
                thread::sleep(Duration::from_millis(10));
            }
            if handle.is_finished() {
                let _ = handle.join();
            } else {
                log::warn!("polling thread did not stop in time, detaching");
            }
        }
        self.transport.lock().stop();
        self.peers.clear();
        log::info!("server '{}' stopped", self.config.server_name);
    }

    /// Send to every connected peer. Silent no-op while stopped.
    pub fn broadcast(&self, payload: &[u8], mode: DeliveryMode) {
        if !self.is_running() {
            return;
        }
        let mut transport = self.transport.lock();
        for entry in self.peers.iter() {
            if let Err(e) = transport.send(entry.value(), payload, mode) {
                log::debug!("broadcast to {} failed: {e}", entry.value());
            }
        }
    }

    /// Send to one peer. Silent no-op while stopped or for a departed peer.
    pub fn send_to_peer(&self, peer: &PeerHandle, payload: &[u8], mode: DeliveryMode) {
        if !self.is_running() || !self.peers.contains_key(&peer.id) {
            return;
        }
        if let Err(e) = self.transport.lock().send(peer, payload, mode) {
            log::debug!("send to {peer} failed: {e}");
        }
    }

    /// Kick a peer: deliver `reason` reliably, then close the connection. The
    /// registry entry is removed once the transport confirms the close.
    pub fn disconnect_peer(&self, peer: &PeerHandle, reason: &str) {
        if !self.is_running() || !self.peers.contains_key(&peer.id) {
            return;
        }
        let mut transport = self.transport.lock();
        if let Err(e) = transport.send(peer, reason.as_bytes(), DeliveryMode::ReliableOrdered) {
            log::debug!("kick notice to {peer} failed: {e}");
        }
        transport.disconnect_peer(peer);
        log::info!("kicked {peer}: {reason}");
    }

    pub fn connected_peer_count(&self) -> usize {
        self.peers.len()
    }

    pub fn connected_peers(&self) -> Vec<PeerHandle> {
        self.peers.iter().map(|e| e.value().clone()).collect()
    }

    pub fn peer_latency(&self, peer: &PeerHandle) -> Option<Duration> {
        self.transport.lock().latency(peer)
    }

    /// Build the shareable server code from the LAN address and the public
    /// address reported by `resolver`.
    pub fn server_code(&self, resolver: &dyn PublicIpResolver) -> Result<String> {
        let lan_ip = endpoint::local_ipv4()?;
        let public_ip = resolver.resolve()?;
        Ok(ServerCode {
            port: self.config.server_port,
            lan_ip,
            public_ip,
        }
        .encode())
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        self.stop();
    }
}

fn poll_loop(
    transport: Arc<Mutex<Box<dyn TransportSession>>>,
    peers: Arc<DashMap<u64, PeerHandle>>,
    events: PeerEventBus,
    running: Arc<AtomicBool>,
    config: ServerConfig,
    tick_interval: Duration,
) {
    let mut last_heartbeat = Instant::now();
    while running.load(Ordering::Acquire) {
        let mut listener = ServerListener {
            peers: &peers,
            pending: Vec::new(),
            config: &config,
            actions: Vec::new(),
        };
        {
            let mut transport = transport.lock();
            transport.poll(&mut listener);
            // Deferred so the transport is never re-entered mid-poll.
            for action in listener.actions.drain(..) {
                match action {
                    ServerAction::ReplyAck { to } => {
                        if let Err(e) = transport.send_unconnected(to, PUNCH_ACK) {
                            log::debug!("punch ack to {to} failed: {e}");
                        }
                    }
                }
            }
            if config.enable_heartbeat
                && last_heartbeat.elapsed() >= Duration::from_millis(config.heartbeat_interval_ms)
            {
                last_heartbeat = Instant::now();
                for entry in peers.iter() {
                    if let Err(e) =
                        transport.send(entry.value(), HEARTBEAT_PAYLOAD, DeliveryMode::Unreliable)
                    {
                        log::debug!("heartbeat to {} failed: {e}", entry.value());
                    }
                }
            }
        }
        // Events go out only after the transport lock is released so a
        // subscriber may call back into the server from its callback.
        for event in listener.pending {
            events.publish(event);
        }
        thread::sleep(tick_interval);
    }
}

enum ServerAction {
    ReplyAck { to: std::net::SocketAddr },
}

/// Applies admission control and keeps the peer registry in sync with the
/// transport. Peer events are buffered and published by the poll loop after
/// the transport lock is released.
struct ServerListener<'a> {
    peers: &'a DashMap<u64, PeerHandle>,
    pending: Vec<PeerEvent>,
    config: &'a ServerConfig,
    actions: Vec<ServerAction>,
}

impl TransportListener for ServerListener<'_> {
    fn on_connection_request(&mut self, from: std::net::SocketAddr, key: &str) -> Admission {
        self.pending.push(PeerEvent::ConnectionRequested { from });
        // Capacity is checked before the key so a full server reads as full
        // even to clients holding a bad key.
        if self.peers.len() >= self.config.max_players {
            log::info!(
                "rejecting {from}: server full ({}/{})",
                self.peers.len(),
                self.config.max_players
            );
            self.pending.push(PeerEvent::NetworkError {
                peer: None,
                detail: format!("rejected {from}: server full"),
            });
            return Admission::Reject("server full");
        }
        if key != self.config.connection_key {
            log::info!("rejecting {from}: invalid connection key");
            self.pending.push(PeerEvent::NetworkError {
                peer: None,
                detail: format!("rejected {from}: invalid key"),
            });
            return Admission::Reject("invalid key");
        }
        Admission::Accept
    }

    fn on_connected(&mut self, peer: PeerHandle) {
        self.peers.insert(peer.id, peer.clone());
        log::info!(
            "{peer} joined ({}/{})",
            self.peers.len(),
            self.config.max_players
        );
        self.pending.push(PeerEvent::Connected { peer });
    }

    fn on_disconnected(&mut self, peer: PeerHandle, reason: crate::event::DisconnectReason) {
        self.peers.remove(&peer.id);
        log::info!("{peer} left: {reason}");
        self.pending.push(PeerEvent::Disconnected { peer, reason });
    }

    fn on_receive(&mut self, peer: &PeerHandle, payload: &[u8]) {
        self.pending.push(PeerEvent::MessageReceived {
            peer: peer.clone(),
            payload: Bytes::copy_from_slice(payload),
        });
    }

    fn on_unconnected_receive(&mut self, from: std::net::SocketAddr, payload: &[u8]) {
        if payload == PUNCH {
            self.actions.push(ServerAction::ReplyAck { to: from });
            return;
        }
        self.pending.push(PeerEvent::NetworkInfo {
            detail: format!("unconnected message from {from}"),
        });
    }
}
