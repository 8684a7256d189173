//! Reversible obfuscation of server endpoints.
//!
//! A server code hides the literal `"port|lanIP|internetIP"` string from end
//! users: byte-wise XOR with a fixed key, then base64. Not a security
//! boundary.

use std::net::Ipv4Addr;

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;

use crate::error::{Error, Result};

const CODE_KEY: &[u8] = b"gamelink";

fn xor_with_key(bytes: &mut [u8]) {
    for (i, byte) in bytes.iter_mut().enumerate() {
        *byte ^= CODE_KEY[i % CODE_KEY.len()];
    }
}

/// Obfuscate an arbitrary string; `decode_raw(encode_raw(s)) == s`.
pub fn encode_raw(plain: &str) -> String {
    let mut bytes = plain.as_bytes().to_vec();
    xor_with_key(&mut bytes);
    STANDARD.encode(bytes)
}

pub fn decode_raw(code: &str) -> Result<String> {
    let mut bytes = STANDARD
        .decode(code)
        .map_err(|_| Error::InvalidEndpointFormat(code.to_string()))?;
    xor_with_key(&mut bytes);
    String::from_utf8(bytes).map_err(|_| Error::InvalidEndpointFormat(code.to_string()))
}

/// Decoded contents of a server code: the candidate endpoints a client picks
/// from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerCode {
    pub port: u16,
    pub lan_ip: Ipv4Addr,
    pub public_ip: Ipv4Addr,
}

impl ServerCode {
    pub fn encode(&self) -> String {
        encode_raw(&format!("{}|{}|{}", self.port, self.lan_ip, self.public_ip))
    }

    pub fn decode(code: &str) -> Result<ServerCode> {
        let plain = decode_raw(code)?;
        let mut parts = plain.split('|');
        let (Some(port), Some(lan), Some(public), None) =
            (parts.next(), parts.next(), parts.next(), parts.next())
        else {
            return Err(Error::InvalidEndpointFormat(code.to_string()));
        };
        Ok(ServerCode {
            port: port
                .parse()
                .map_err(|_| Error::InvalidEndpointFormat(code.to_string()))?,
            lan_ip: lan
                .parse()
                .map_err(|_| Error::InvalidAddress(lan.to_string()))?,
            public_ip: public
                .parse()
                .map_err(|_| Error::InvalidAddress(public.to_string()))?,
        })
    }
}
