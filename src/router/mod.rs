//! Router Layer
//!
//! Responsibilities:
//! - Resolve a destination IP to a [`Route`] through a plugin
//! - Dial outbound connections for handlers ([`Dialer`])
//!
//! Proxy chaining is not done here: the only dialer is [`DirectDialer`],
//! which consults the optional resolver and connects straight out.

mod plugin;

pub use plugin::{new_plugin, GrpcPlugin, HttpPlugin, PluginOptions};

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::Arc;

use async_trait::async_trait;
use ipnet::IpNet;
use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::{TcpStream, UdpSocket};
use tracing::debug;

use crate::common::{Address, Network, Result, Stream};
use crate::transport::PacketConn;

/// A resolved `(destination network, gateway)` pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Route {
    pub net: IpNet,
    pub gateway: IpAddr,
}

impl std::fmt::Display for Route {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} via {}", self.net, self.gateway)
    }
}

/// Build a route from its textual parts.
///
/// `net` may be a CIDR or a bare IP (host route). Anything unparsable
/// gives `None`, which callers treat as "use the default route".
pub fn parse_route(net: &str, gateway: &str) -> Option<Route> {
    let net = net.trim();
    let net = match net.parse::<IpNet>() {
        Ok(n) => n,
        Err(_) => IpNet::from(net.parse::<IpAddr>().ok()?),
    };
    let gateway = gateway.trim().parse::<IpAddr>().ok()?;
    Some(Route { net, gateway })
}

/// Looks up the route for a destination.
///
/// Lookups never fail: transport errors are logged by the implementation
/// and reported as `None`.
#[async_trait]
pub trait RouteResolver: Send + Sync {
    async fn resolve(&self, dst: IpAddr) -> Option<Route>;
}

/// What a dial produced: a byte stream or a datagram conduit.
pub enum Outbound {
    Stream(Stream),
    Packet(Box<dyn PacketConn>),
}

impl Outbound {
    pub fn kind(&self) -> &'static str {
        match self {
            Outbound::Stream(_) => "stream",
            Outbound::Packet(_) => "packet",
        }
    }
}

impl std::fmt::Debug for Outbound {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Outbound({})", self.kind())
    }
}

/// Outbound connection factory used by handlers.
#[async_trait]
pub trait Dialer: Send + Sync {
    /// Dial `addr` over `network`.
    ///
    /// For [`Network::Udp`] an empty `addr` asks for an unconnected
    /// association whose destinations are given per datagram.
    async fn dial(&self, network: Network, addr: &str) -> Result<Outbound>;
}

/// Dials straight out of this host.
#[derive(Default, Clone)]
pub struct DirectDialer {
    resolver: Option<Arc<dyn RouteResolver>>,
}

impl DirectDialer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder: consult `resolver` before each dial
    pub fn with_resolver(mut self, resolver: Arc<dyn RouteResolver>) -> Self {
        self.resolver = Some(resolver);
        self
    }

    async fn lookup_route(&self, target: SocketAddr) {
        let Some(resolver) = &self.resolver else {
            return;
        };
        match resolver.resolve(target.ip()).await {
            Some(route) => debug!(dst = %target, route = %route, "route resolved"),
            None => debug!(dst = %target, "no route, using default"),
        }
    }
}

#[async_trait]
impl Dialer for DirectDialer {
    async fn dial(&self, network: Network, addr: &str) -> Result<Outbound> {
        match network {
            Network::Tcp => {
                let target = Address::parse(addr)?.resolve().await?;
                self.lookup_route(target).await;
                let stream = TcpStream::connect(target).await?;
                stream.set_nodelay(true)?;
                Ok(Outbound::Stream(Box::new(stream)))
            }
            Network::Udp if addr.is_empty() => {
                let socket = match bind_dual_stack() {
                    Ok(s) => s,
                    Err(e) => {
                        debug!("ipv6 unavailable, udp association is ipv4 only: {}", e);
                        UdpSocket::bind(SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0)).await?
                    }
                };
                Ok(Outbound::Packet(Box::new(socket)))
            }
            Network::Udp => {
                let target = Address::parse(addr)?.resolve().await?;
                self.lookup_route(target).await;
                let local = match target {
                    SocketAddr::V4(_) => SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0),
                    SocketAddr::V6(_) => SocketAddr::new(IpAddr::V6(Ipv6Addr::UNSPECIFIED), 0),
                };
                let socket = UdpSocket::bind(local).await?;
                socket.connect(target).await?;
                Ok(Outbound::Packet(Box::new(socket)))
            }
        }
    }
}

/// Wildcard `[::]:0` socket that also carries IPv4.
fn bind_dual_stack() -> std::io::Result<UdpSocket> {
    let socket = Socket::new(Domain::IPV6, Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_only_v6(false)?;
    socket.bind(&SocketAddr::new(IpAddr::V6(Ipv6Addr::UNSPECIFIED), 0).into())?;
    socket.set_nonblocking(true)?;
    UdpSocket::from_std(socket.into())
}
