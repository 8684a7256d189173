//! Best-effort public IP discovery via IP-echo services.

use std::net::Ipv4Addr;
use std::time::Duration;

use crate::error::{Error, Result};

/// Ordered list of services; the first parseable answer wins.
const PUBLIC_IP_SERVICES: &[&str] = &[
    "https://checkip.amazonaws.com",
    "https://api.ipify.org",
    "https://icanhazip.com",
];

const LOOKUP_TIMEOUT: Duration = Duration::from_secs(5);

/// Resolves the caller's public IPv4 address.
///
/// Failure is soft for callers in this crate: an unresolvable public address
/// only degrades LAN/Internet classification, it never aborts a connection
/// attempt.
pub trait PublicIpResolver: Send + Sync {
    fn resolve(&self) -> Result<Ipv4Addr>;
}

/// Default resolver backed by public IP-echo services.
pub struct HttpIpResolver {
    services: Vec<String>,
    timeout: Duration,
}

impl Default for HttpIpResolver {
    fn default() -> Self {
        HttpIpResolver {
            services: PUBLIC_IP_SERVICES.iter().map(|s| s.to_string()).collect(),
            timeout: LOOKUP_TIMEOUT,
        }
    }
}

impl HttpIpResolver {
    pub fn new() -> HttpIpResolver {
        HttpIpResolver::default()
    }

    pub fn set_services(mut self, services: Vec<String>) -> Self {
        self.services = services;
        self
    }

    pub fn set_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

impl PublicIpResolver for HttpIpResolver {
    fn resolve(&self) -> Result<Ipv4Addr> {
        let client = reqwest::blocking::Client::builder()
            .timeout(self.timeout)
            .build()
            .map_err(|_| Error::PublicIpUnresolvable)?;
        for service in &self.services {
            match client.get(service).send().and_then(|r| r.text()) {
                Ok(body) => {
                    if let Ok(ip) = body.trim().parse::<Ipv4Addr>() {
                        log::debug!("public ip {ip} resolved via {service}");
                        return Ok(ip);
                    }
                    log::debug!("unparseable answer from {service}: {:?}", body.trim());
                }
                Err(e) => log::debug!("public ip lookup via {service} failed: {e}"),
            }
        }
        log::info!("unable to determine public ip; classification degrades");
        Err(Error::PublicIpUnresolvable)
    }
}

/// Resolver with a fixed answer, for servers with a known address and for
/// tests.
pub struct StaticIpResolver(pub Option<Ipv4Addr>);

impl PublicIpResolver for StaticIpResolver {
    fn resolve(&self) -> Result<Ipv4Addr> {
        self.0.ok_or(Error::PublicIpUnresolvable)
    }
}
