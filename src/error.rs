use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("already connected or connecting")]
    AlreadyConnectedOrConnecting,
    #[error("invalid endpoint format: {0}")]
    InvalidEndpointFormat(String),
    #[error("invalid address: {0}")]
    InvalidAddress(String),
    #[error("hole punch timed out after {rounds} rounds")]
    HolePunchTimeout { rounds: u32 },
    #[error("connect attempt timed out")]
    ConnectTimeout,
    /// Reserved for `TransportSession` implementations: operation invoked
    /// before `start`.
    #[error("transport not initialized")]
    TransportNotInitialized,
    /// Reserved for `TransportSession` implementations: connect refused by
    /// the remote listener.
    #[error("admission rejected: {0}")]
    AdmissionRejected(&'static str),
    #[error("no UPnP gateway available: {0}")]
    UpnpUnavailable(String),
    #[error("UPnP port mapping failed: {0}")]
    UpnpMappingFailed(String),
    #[error("unable to determine public ip")]
    PublicIpUnresolvable,
    #[error("config error: {0}")]
    Config(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
