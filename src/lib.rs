//! Peer connection layer for client/server game transports.
//!
//! Dials and accepts UDP connections, traversing NAT boundaries with direct
//! connects, hole punching and UPnP port mapping. The transport itself
//! (framing, retransmission, ordering) lives behind [`TransportSession`].

pub mod client;
pub mod config;
pub mod endpoint;
pub mod error;
pub mod event;
pub mod public_ip;
pub mod server;
pub mod server_code;
pub mod transport;
pub mod upnp;

#[cfg(test)]
pub(crate) mod mock;

pub use client::{Client, ConnectionState};
pub use config::ServerConfig;
pub use error::{Error, Result};
pub use event::{DisconnectReason, PeerEvent, PeerEventBus};
pub use public_ip::{HttpIpResolver, PublicIpResolver, StaticIpResolver};
pub use server::Server;
pub use server_code::ServerCode;
pub use transport::{Admission, DeliveryMode, PeerHandle, TransportListener, TransportSession};
