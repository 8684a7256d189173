use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;

use crate::transport::PeerHandle;

/// Why a peer went away.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisconnectReason {
    Timeout,
    RemoteClose,
    DisconnectCalled,
    ConnectionFailed,
    NetworkUnreachable,
    Unknown,
}

impl fmt::Display for DisconnectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            DisconnectReason::Timeout => "Connection timeout",
            DisconnectReason::RemoteClose => "Client disconnected",
            DisconnectReason::DisconnectCalled => "Disconnected by server",
            DisconnectReason::ConnectionFailed => "Connection failed",
            DisconnectReason::NetworkUnreachable => "Network error",
            DisconnectReason::Unknown => "Unknown reason",
        };
        write!(f, "{text}")
    }
}

/// Everything a connection manager reports to the embedding application.
///
/// A `Connected` event is always followed by exactly one terminal
/// `Disconnected` for the same peer once that peer eventually goes away.
#[derive(Debug, Clone)]
pub enum PeerEvent {
    ConnectionRequested { from: SocketAddr },
    Connected { peer: PeerHandle },
    Disconnected { peer: PeerHandle, reason: DisconnectReason },
    MessageReceived { peer: PeerHandle, payload: Bytes },
    NetworkError { peer: Option<PeerHandle>, detail: String },
    NetworkInfo { detail: String },
}

/// Single-subscriber broadcast point.
///
/// Delivery is synchronous with respect to `update()`/the polling thread, so
/// the subscriber must not block for long.
#[derive(Clone, Default)]
pub struct PeerEventBus {
    subscriber: Arc<Mutex<Option<Box<dyn FnMut(PeerEvent) + Send>>>>,
}

impl PeerEventBus {
    pub fn new() -> PeerEventBus {
        PeerEventBus::default()
    }

    /// Install the subscriber, replacing any previous one.
    pub fn subscribe<F: FnMut(PeerEvent) + Send + 'static>(&self, subscriber: F) {
        *self.subscriber.lock() = Some(Box::new(subscriber));
    }

    pub(crate) fn publish(&self, event: PeerEvent) {
        if let Some(subscriber) = self.subscriber.lock().as_mut() {
            subscriber(event);
        }
    }
}
