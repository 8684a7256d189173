//! The seam between the connection managers and the UDP transport library.
//!
//! The transport owns sockets, framing, retransmission and ordering. The
//! managers drive it through [`TransportSession`] and consume its events
//! through [`TransportListener`], which makes the whole dial/accept logic
//! testable against an in-memory fake.

use std::fmt;
use std::net::SocketAddr;
use std::time::Duration;

use crate::error::Result;
use crate::event::DisconnectReason;

/// Wire-level unconnected datagrams used during hole punching.
pub const PUNCH: &[u8] = b"PUNCH";
pub const PUNCH_ACK: &[u8] = b"PUNCH_ACK";

/// Delivery guarantee requested for an outgoing message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryMode {
    ReliableOrdered,
    Unreliable,
}

/// Identifier of a live transport connection.
///
/// Cheap to clone. The transport owns the connection itself; round-trip
/// latency is queried through [`TransportSession::latency`], never cached
/// here.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PeerHandle {
    /// Per-connection sequence id assigned by the transport.
    pub id: u64,
    pub addr: SocketAddr,
}

impl fmt::Display for PeerHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "peer#{}@{}", self.id, self.addr)
    }
}

/// Verdict on an inbound connection request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Accept,
    Reject(&'static str),
}

/// Callbacks raised while the transport is polled.
///
/// Implementations must not call back into the session that is being polled;
/// they record deferred actions instead and apply them after `poll` returns.
pub trait TransportListener {
    /// Decide on an inbound connection request carrying `key` as its
    /// handshake payload.
    fn on_connection_request(&mut self, from: SocketAddr, key: &str) -> Admission;
    fn on_connected(&mut self, peer: PeerHandle);
    fn on_disconnected(&mut self, peer: PeerHandle, reason: DisconnectReason);
    fn on_receive(&mut self, peer: &PeerHandle, payload: &[u8]);
    /// Datagram received outside any connection (hole punching traffic).
    fn on_unconnected_receive(&mut self, from: SocketAddr, payload: &[u8]);
}

/// The underlying reliable/unreliable UDP transport.
///
/// Exactly one connection manager owns a session. `poll` drains the event
/// queue into the listener and must never block; implementations may return
/// [`crate::Error::TransportNotInitialized`] from operations invoked before
/// `start`.
pub trait TransportSession: Send {
    /// Bind the transport. Port 0 picks an ephemeral port (client side).
    fn start(&mut self, port: u16) -> Result<()>;
    fn stop(&mut self);
    /// Open an outbound connection, attaching `key` as the handshake payload.
    fn connect(&mut self, target: SocketAddr, key: &str) -> Result<()>;
    fn disconnect_peer(&mut self, peer: &PeerHandle);
    fn send(&mut self, peer: &PeerHandle, payload: &[u8], mode: DeliveryMode) -> Result<()>;
    /// Send a raw datagram outside any connection.
    fn send_unconnected(&mut self, target: SocketAddr, payload: &[u8]) -> Result<()>;
    /// Drain pending transport events into `listener`.
    fn poll(&mut self, listener: &mut dyn TransportListener);
    /// Last round-trip latency sample for `peer`, if connected.
    fn latency(&self, peer: &PeerHandle) -> Option<Duration>;
}
