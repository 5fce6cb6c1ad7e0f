//! Socket addresses that may be given as host names.
//!
//! The server tells each registering node the address its update queue listens on, so
//! the listener is bound to the host nodes will reach, which is often known only by
//! name (`cachestore-server:7000` in a container network, `localhost:7000` locally).

use std::{net::ToSocketAddrs, ops::Deref};

/// A socket address parsed from `host:port`. A host name is resolved once, at parse
/// time, and the first address found is used.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SocketAddr(std::net::SocketAddr);

impl Deref for SocketAddr {
    type Target = std::net::SocketAddr;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl std::fmt::Display for SocketAddr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

impl std::str::FromStr for SocketAddr {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut addrs = s
            .to_socket_addrs()
            .map_err(|e| format!("cannot parse socket address '{s}': {e}"))?;
        addrs
            .next()
            .map(Self)
            .ok_or_else(|| format!("found no addresses for '{s}'"))
    }
}

impl From<SocketAddr> for std::net::SocketAddr {
    fn from(addr: SocketAddr) -> Self {
        addr.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::str::FromStr;

    #[test]
    fn parses_addresses() {
        let addr: std::net::SocketAddr = SocketAddr::from_str("127.0.0.1:1234").unwrap().into();
        assert_eq!(addr, std::net::SocketAddr::from(([127, 0, 0, 1], 1234)));

        let addr = SocketAddr::from_str("localhost:1234").unwrap();
        assert!(addr.ip().is_loopback());
        assert_eq!(addr.port(), 1234);

        assert_eq!(
            SocketAddr::from_str("no port").unwrap_err(),
            "cannot parse socket address 'no port': invalid socket address",
        );
    }
}
