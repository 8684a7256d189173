//! In-memory transport used by unit tests.

use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use crate::error::Result;
use crate::event::DisconnectReason;
use crate::transport::{Admission, DeliveryMode, PeerHandle, TransportListener, TransportSession};

/// An event the test scripts into the transport; `poll` replays them against
/// the listener in order.
pub enum Inbound {
    Request { from: SocketAddr, key: String },
    Connected { peer: PeerHandle },
    Disconnected { peer: PeerHandle, reason: DisconnectReason },
    Message { peer: PeerHandle, payload: Vec<u8> },
    Unconnected { from: SocketAddr, payload: Vec<u8> },
}

#[derive(Default)]
pub struct FakeInner {
    pub started_port: Option<u16>,
    pub stopped: bool,
    pub connects: Vec<(SocketAddr, String)>,
    pub unconnected_sent: Vec<(SocketAddr, Vec<u8>)>,
    pub sent: Vec<(PeerHandle, Vec<u8>, DeliveryMode)>,
    pub disconnect_calls: Vec<PeerHandle>,
    pub rejections: Vec<(SocketAddr, &'static str)>,
    pub latency: Option<Duration>,
    inbound: VecDeque<Inbound>,
    next_peer_id: u64,
}

/// Scriptable `TransportSession`. Clones share state, so the test keeps one
/// handle for scripting and inspection while the manager under test owns the
/// other.
#[derive(Clone, Default)]
pub struct FakeTransport {
    pub inner: Arc<Mutex<FakeInner>>,
}

impl FakeTransport {
    pub fn new() -> FakeTransport {
        FakeTransport::default()
    }

    pub fn push(&self, event: Inbound) {
        self.inner.lock().inbound.push_back(event);
    }

    /// Allocate a peer handle the way the transport would on accept.
    pub fn peer(&self, addr: SocketAddr) -> PeerHandle {
        let mut inner = self.inner.lock();
        inner.next_peer_id += 1;
        PeerHandle {
            id: inner.next_peer_id,
            addr,
        }
    }
}

impl TransportSession for FakeTransport {
    fn start(&mut self, port: u16) -> Result<()> {
        let mut inner = self.inner.lock();
        inner.started_port = Some(port);
        inner.stopped = false;
        Ok(())
    }

    fn stop(&mut self) {
        self.inner.lock().stopped = true;
    }

    fn connect(&mut self, target: SocketAddr, key: &str) -> Result<()> {
        self.inner.lock().connects.push((target, key.to_string()));
        Ok(())
    }

    fn disconnect_peer(&mut self, peer: &PeerHandle) {
        let mut inner = self.inner.lock();
        inner.disconnect_calls.push(peer.clone());
        inner.inbound.push_back(Inbound::Disconnected {
            peer: peer.clone(),
            reason: DisconnectReason::DisconnectCalled,
        });
    }

    fn send(&mut self, peer: &PeerHandle, payload: &[u8], mode: DeliveryMode) -> Result<()> {
        self.inner
            .lock()
            .sent
            .push((peer.clone(), payload.to_vec(), mode));
        Ok(())
    }

    fn send_unconnected(&mut self, target: SocketAddr, payload: &[u8]) -> Result<()> {
        self.inner
            .lock()
            .unconnected_sent
            .push((target, payload.to_vec()));
        Ok(())
    }

    fn poll(&mut self, listener: &mut dyn TransportListener) {
        loop {
            // Pop before dispatching so listener callbacks may script more
            // events without deadlocking on the inner lock.
            let event = self.inner.lock().inbound.pop_front();
            let Some(event) = event else { break };
            match event {
                Inbound::Request { from, key } => {
                    match listener.on_connection_request(from, &key) {
                        Admission::Accept => {
                            let peer = self.peer(from);
                            listener.on_connected(peer);
                        }
                        Admission::Reject(reason) => {
                            self.inner.lock().rejections.push((from, reason));
                        }
                    }
                }
                Inbound::Connected { peer } => listener.on_connected(peer),
                Inbound::Disconnected { peer, reason } => listener.on_disconnected(peer, reason),
                Inbound::Message { peer, payload } => listener.on_receive(&peer, &payload),
                Inbound::Unconnected { from, payload } => {
                    listener.on_unconnected_receive(from, &payload)
                }
            }
        }
    }

    fn latency(&self, _peer: &PeerHandle) -> Option<Duration> {
        self.inner.lock().latency
    }
}
