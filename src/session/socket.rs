use std::io;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4, UdpSocket};
use std::time::Duration;
#[cfg(test)] use mockall::automock;
use socket2::{Domain, Protocol, Socket, Type};
use tracing::info;
use crate::config::BenchConfig;

/// Bound on a blocking completion wait; the stop condition is re-checked at
/// least this often even with no traffic.
pub const COMPLETION_WAIT: Duration = Duration::from_millis(100);

/// Abstraction over the datagram socket the completion pump drives,
/// introduced to mock the I/O part away for testing.
#[cfg_attr(test, automock)]
pub trait CompletionSocket: Send + Sync + 'static {
    /// Receive one datagram into `buf`. Returns `None` when nothing arrived
    /// within the read timeout (blocking mode) or right now (non-blocking
    /// mode); both are a completion-wait timeout, not an error.
    fn recv_into(&self, buf: &mut [u8]) -> io::Result<Option<(usize, SocketAddr)>>;

    fn send_to(&self, buf: &[u8], to: SocketAddr) -> io::Result<usize>;

    /// Switch between the blocking first-fulfilment wait and the non-blocking
    /// batch drain.
    fn set_nonblocking(&self, nonblocking: bool) -> io::Result<()>;

    fn local_addr(&self) -> io::Result<SocketAddr>;
}

impl CompletionSocket for UdpSocket {
    fn recv_into(&self, buf: &mut [u8]) -> io::Result<Option<(usize, SocketAddr)>> {
        match self.recv_from(buf) {
            Ok(x) => Ok(Some(x)),
            Err(e) if matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut) => {
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    fn send_to(&self, buf: &[u8], to: SocketAddr) -> io::Result<usize> {
        UdpSocket::send_to(self, buf, to)
    }

    fn set_nonblocking(&self, nonblocking: bool) -> io::Result<()> {
        UdpSocket::set_nonblocking(self, nonblocking)
    }

    fn local_addr(&self) -> io::Result<SocketAddr> {
        UdpSocket::local_addr(self)
    }
}

/// Consumer socket: bound to the multicast port on the wildcard address,
/// member of every configured group on the configured interface, read timeout
/// set to the completion-wait bound.
pub fn bind_consumer_socket(config: &BenchConfig) -> anyhow::Result<UdpSocket> {
    let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_reuse_address(true)?;

    // binding the interface's unicast address would filter out multicast
    // delivery on Linux; membership is scoped via the interface in the join
    let bind_addr = SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, config.port);
    socket.bind(&SocketAddr::from(bind_addr).into())?;

    for group in &config.groups {
        socket.join_multicast_v4(group, &config.interface_addr)?;
        info!("joined multicast group {} on {}", group, config.interface_addr);
    }

    socket.set_read_timeout(Some(COMPLETION_WAIT))?;

    let socket: UdpSocket = socket.into();
    info!("consumer socket bound to {:?}", CompletionSocket::local_addr(&socket)?);
    Ok(socket)
}

/// Producer socket: bound to an ephemeral port on the configured interface,
/// outbound multicast routed through that interface.
pub fn bind_producer_socket(config: &BenchConfig) -> anyhow::Result<UdpSocket> {
    let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;

    let bind_addr = SocketAddrV4::new(config.interface_addr, 0);
    socket.bind(&SocketAddr::from(bind_addr).into())?;
    socket.set_multicast_if_v4(&config.interface_addr)?;
    socket.set_multicast_ttl_v4(1)?;

    let socket: UdpSocket = socket.into();
    info!("producer socket bound to {:?}", CompletionSocket::local_addr(&socket)?);
    Ok(socket)
}
