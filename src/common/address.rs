//! Address type for network connections

use std::net::{IpAddr, Ipv4Addr, SocketAddr};

use crate::error::{Error, Result};

/// Network address representation
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Address {
    /// IP socket address (IP + port)
    Socket(SocketAddr),
    /// Domain name with port
    Domain(String, u16),
    /// Unix domain socket path (empty for unnamed peers)
    Unix(String),
}

impl Address {
    /// Create an unspecified address (0.0.0.0:0)
    pub fn unspecified() -> Self {
        Address::Socket(SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0))
    }

    /// Create from domain and port
    pub fn domain(domain: impl Into<String>, port: u16) -> Self {
        Address::Domain(domain.into(), port)
    }

    /// Parse `host:port`, `[v6]:port` or `:port`.
    ///
    /// An empty host means every interface, the same as `0.0.0.0`.
    pub fn parse(s: &str) -> Result<Self> {
        if let Ok(addr) = s.parse::<SocketAddr>() {
            return Ok(Address::Socket(addr));
        }

        let (host, port) = s
            .rsplit_once(':')
            .ok_or_else(|| Error::InvalidAddress(s.to_string()))?;
        let port: u16 = port
            .parse()
            .map_err(|_| Error::InvalidAddress(format!("invalid port in {}", s)))?;

        let host = host.trim_start_matches('[').trim_end_matches(']');
        if host.is_empty() {
            return Ok(Address::Socket(SocketAddr::new(
                IpAddr::V4(Ipv4Addr::UNSPECIFIED),
                port,
            )));
        }
        if let Ok(ip) = host.parse::<IpAddr>() {
            return Ok(Address::Socket(SocketAddr::new(ip, port)));
        }
        Ok(Address::Domain(host.to_string(), port))
    }

    /// Get the port (0 for unix sockets)
    pub fn port(&self) -> u16 {
        match self {
            Address::Socket(addr) => addr.port(),
            Address::Domain(_, port) => *port,
            Address::Unix(_) => 0,
        }
    }

    /// Get the host part as string
    pub fn host(&self) -> String {
        match self {
            Address::Socket(addr) => addr.ip().to_string(),
            Address::Domain(domain, _) => domain.clone(),
            Address::Unix(path) => path.clone(),
        }
    }

    /// IP of a socket address
    pub fn ip(&self) -> Option<IpAddr> {
        self.as_socket().map(|a| a.ip())
    }

    /// Try to get as socket address (fails for domain and unix)
    pub fn as_socket(&self) -> Option<SocketAddr> {
        match self {
            Address::Socket(addr) => Some(*addr),
            _ => None,
        }
    }

    /// Resolve to a socket address, looking up domains.
    pub async fn resolve(&self) -> Result<SocketAddr> {
        match self {
            Address::Socket(addr) => Ok(*addr),
            Address::Domain(domain, port) => tokio::net::lookup_host((domain.as_str(), *port))
                .await?
                .next()
                .ok_or_else(|| Error::InvalidAddress(format!("{} did not resolve", self))),
            Address::Unix(path) => Err(Error::InvalidAddress(format!(
                "unix socket {} has no IP address",
                path
            ))),
        }
    }
}

impl std::fmt::Display for Address {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Address::Socket(addr) => write!(f, "{}", addr),
            Address::Domain(domain, port) => write!(f, "{}:{}", domain, port),
            Address::Unix(path) if path.is_empty() => write!(f, "@"),
            Address::Unix(path) => write!(f, "{}", path),
        }
    }
}

impl From<SocketAddr> for Address {
    fn from(addr: SocketAddr) -> Self {
        Address::Socket(addr)
    }
}

impl From<(String, u16)> for Address {
    fn from((domain, port): (String, u16)) -> Self {
        Address::Domain(domain, port)
    }
}

impl From<(&str, u16)> for Address {
    fn from((domain, port): (&str, u16)) -> Self {
        Address::Domain(domain.to_string(), port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_socket() {
        let addr = Address::parse("127.0.0.1:1080").unwrap();
        assert_eq!(addr, Address::Socket("127.0.0.1:1080".parse().unwrap()));
    }

    #[test]
    fn test_parse_port_only() {
        let addr = Address::parse(":8080").unwrap();
        assert_eq!(addr.to_string(), "0.0.0.0:8080");
    }

    #[test]
    fn test_parse_domain() {
        let addr = Address::parse("example.com:443").unwrap();
        assert_eq!(addr, Address::domain("example.com", 443));
        assert_eq!(addr.host(), "example.com");
    }

    #[test]
    fn test_parse_invalid() {
        assert!(Address::parse("nonsense").is_err());
        assert!(Address::parse("host:99999").is_err());
    }
}
