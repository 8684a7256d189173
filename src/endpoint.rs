//! Pure endpoint classification and selection.

use std::io;
use std::net::{IpAddr, Ipv4Addr, SocketAddrV4, UdpSocket};

use crate::error::{Error, Result};
use crate::server_code::ServerCode;

/// Where an address lives relative to the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionType {
    Loopback,
    Lan,
    Internet,
}

/// RFC 1918 private ranges.
pub fn is_lan_ip(ip: Ipv4Addr) -> bool {
    let octets = ip.octets();
    octets[0] == 10
        || (octets[0] == 172 && (16..=31).contains(&octets[1]))
        || (octets[0] == 192 && octets[1] == 168)
}

/// Classify `addr` relative to the caller's own addresses.
///
/// A peer that presents the same public address as us sits behind the same
/// NAT and is reachable over the LAN. Both `local_ip` and `public_ip` are
/// optional; missing knowledge only degrades the answer toward `Internet`.
pub fn classify(
    addr: Ipv4Addr,
    local_ip: Option<Ipv4Addr>,
    public_ip: Option<Ipv4Addr>,
) -> ConnectionType {
    if addr.is_loopback() || Some(addr) == local_ip {
        return ConnectionType::Loopback;
    }
    if is_lan_ip(addr) || Some(addr) == public_ip {
        return ConnectionType::Lan;
    }
    ConnectionType::Internet
}

/// Parse a literal `host:port` endpoint.
pub fn parse_endpoint(s: &str) -> Result<SocketAddrV4> {
    let (host, port) = s
        .rsplit_once(':')
        .ok_or_else(|| Error::InvalidEndpointFormat(s.to_string()))?;
    let ip: Ipv4Addr = host
        .parse()
        .map_err(|_| Error::InvalidAddress(host.to_string()))?;
    let port: u16 = port
        .parse()
        .map_err(|_| Error::InvalidEndpointFormat(s.to_string()))?;
    Ok(SocketAddrV4::new(ip, port))
}

/// Pick the best reachable endpoint from a server code's candidate set.
///
/// Ties resolve toward the cheapest path: loopback (same machine) beats the
/// LAN address (same network or same NAT) beats the internet address.
pub fn select_best_endpoint(
    code: &ServerCode,
    local_ip: Option<Ipv4Addr>,
    public_ip: Option<Ipv4Addr>,
) -> SocketAddrV4 {
    if local_ip.is_some() && Some(code.lan_ip) == local_ip {
        return SocketAddrV4::new(Ipv4Addr::LOCALHOST, code.port);
    }
    if classify(code.public_ip, local_ip, public_ip) != ConnectionType::Internet {
        return SocketAddrV4::new(code.lan_ip, code.port);
    }
    SocketAddrV4::new(code.public_ip, code.port)
}

/// Local IPv4 address of the default route interface.
///
/// Connecting a UDP socket never sends anything; it only selects a route.
pub fn local_ipv4() -> io::Result<Ipv4Addr> {
    let socket = UdpSocket::bind("0.0.0.0:0")?;
    socket.connect("8.8.8.8:80")?;
    match socket.local_addr()?.ip() {
        IpAddr::V4(ip) => Ok(ip),
        IpAddr::V6(_) => Ok(Ipv4Addr::LOCALHOST),
    }
}
