//! UPnP port-mapping lifecycle.

use std::net::{IpAddr, SocketAddr, SocketAddrV4};
use std::time::Duration;

use igd_next::{search_gateway, PortMappingProtocol, SearchOptions};

use crate::endpoint;
use crate::error::{Error, Result};

/// Bounded gateway discovery; a LAN without an IGD answers with silence.
pub const DISCOVERY_TIMEOUT: Duration = Duration::from_secs(5);

/// Mappings are leased so one that is never removed expires on its own.
const LEASE_SECS: u32 = 3600;
const MAPPING_DESCRIPTION: &str = "gamelink";

/// A live UDP port mapping on the local gateway.
pub struct PortMapping {
    pub external_ip: Option<IpAddr>,
    pub port: u16,
}

impl PortMapping {
    /// Discover the gateway and map external `port` to this host.
    pub fn establish(port: u16) -> Result<PortMapping> {
        let options = SearchOptions {
            timeout: Some(DISCOVERY_TIMEOUT),
            ..Default::default()
        };
        let gateway = search_gateway(options).map_err(|e| Error::UpnpUnavailable(e.to_string()))?;
        let local_ip =
            endpoint::local_ipv4().map_err(|e| Error::UpnpMappingFailed(e.to_string()))?;
        let local_addr = SocketAddr::V4(SocketAddrV4::new(local_ip, port));
        gateway
            .add_port(
                PortMappingProtocol::UDP,
                port,
                local_addr,
                LEASE_SECS,
                MAPPING_DESCRIPTION,
            )
            .map_err(|e| Error::UpnpMappingFailed(e.to_string()))?;
        let external_ip = gateway.get_external_ip().ok();
        log::info!("UPnP mapping added: external port {port} -> {local_addr}");
        Ok(PortMapping { external_ip, port })
    }

    /// Best-effort removal; errors are swallowed and the lease expires on its
    /// own.
    pub fn remove(self) {
        let options = SearchOptions {
            timeout: Some(DISCOVERY_TIMEOUT),
            ..Default::default()
        };
        if let Ok(gateway) = search_gateway(options) {
            let _ = gateway.remove_port(PortMappingProtocol::UDP, self.port);
            log::info!("UPnP mapping removed for port {}", self.port);
        }
    }
}
