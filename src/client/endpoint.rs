use std::{
    fmt,
    net::{IpAddr, SocketAddr},
    str::FromStr,
};

use super::error::{Error, Result};

/// Names a remote peer. Immutable and cheap to copy, so it is used directly
/// as a map key by the connection pool and the subscription registry.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Endpoint {
    addr: IpAddr,
    port: u16,
}

impl Endpoint {
    pub fn new(addr: IpAddr, port: u16) -> Self {
        Self { addr, port }
    }

    /// Parses a textual IP address. Host names are not resolved.
    pub fn parse(addr: &str, port: u16) -> Result<Self> {
        let addr = addr.trim();
        if addr.is_empty() {
            Err(Error::invalid_argument("endpoint address is empty"))?
        }
        let addr = IpAddr::from_str(addr).map_err(|_| {
            Error::invalid_argument(format!("{addr:?} is not an IP address"))
        })?;
        Ok(Self::new(addr, port))
    }

    pub fn address(&self) -> IpAddr {
        self.addr
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn socket_addr(&self) -> SocketAddr {
        ip_addr_to_socket_addr(self.addr, self.port)
    }
}

/// Converts an IP address and port to a socket address.
fn ip_addr_to_socket_addr(ip: IpAddr, port: u16) -> SocketAddr {
    match ip {
        IpAddr::V4(ip) => SocketAddr::from((ip, port)),
        IpAddr::V6(ip) => SocketAddr::from((ip, port)),
    }
}

impl From<SocketAddr> for Endpoint {
    fn from(addr: SocketAddr) -> Self {
        Self::new(addr.ip(), addr.port())
    }
}

impl FromStr for Endpoint {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        SocketAddr::from_str(s.trim())
            .map(Self::from)
            .map_err(|_| Error::invalid_argument(format!("bad endpoint {s:?}")))
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.socket_addr().fmt(f)
    }
}
