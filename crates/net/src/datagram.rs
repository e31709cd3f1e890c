use std::collections::VecDeque;
use std::fmt;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};

use mio::net::UdpSocket;
use socket2::{Domain, Protocol, Socket, Type};

use crate::error::{NetError, Result};
use crate::reactor::{Reactor, Readiness};
use crate::table::SlotId;

/// Admin-local multicast group used in place of broadcast on IPv6.
pub const IPV6_DISCOVERY_GROUP: Ipv6Addr =
    Ipv6Addr::new(0xff04, 0, 0, 0, 0x696f, 0x7175, 0x616b, 0x6533);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DatagramId(pub(crate) SlotId);

impl DatagramId {
    pub fn index(&self) -> usize {
        self.0.index()
    }
}

impl fmt::Display for DatagramId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "datagram socket {}", self.0)
    }
}

/// Called once per received packet.
pub trait DatagramHandler {
    fn on_datagram(&mut self, net: &mut Reactor, socket: DatagramId, payload: &[u8], from: SocketAddr);
}

impl<F> DatagramHandler for F
where
    F: FnMut(&mut Reactor, DatagramId, &[u8], SocketAddr),
{
    fn on_datagram(&mut self, net: &mut Reactor, socket: DatagramId, payload: &[u8], from: SocketAddr) {
        self(net, socket, payload, from)
    }
}

#[derive(Debug)]
pub(crate) struct Datagram {
    pub(crate) payload: Vec<u8>,
    pub(crate) to: SocketAddr,
}

pub(crate) struct DatagramEndpoint {
    pub(crate) socket: UdpSocket,
    pub(crate) local_addr: SocketAddr,
    pub(crate) queue: VecDeque<Datagram>,
    pub(crate) handler: Option<Box<dyn DatagramHandler>>,
    pub(crate) readiness: Readiness,
}

impl DatagramEndpoint {
    pub(crate) fn new(socket: UdpSocket, handler: Box<dyn DatagramHandler>) -> Result<Self> {
        let local_addr = socket
            .local_addr()
            .map_err(|e| NetError::socket("local address", e))?;

        Ok(Self {
            socket,
            local_addr,
            queue: VecDeque::new(),
            handler: Some(handler),
            readiness: Readiness::default(),
        })
    }

    pub(crate) fn enqueue(&mut self, payload: &[u8], to: SocketAddr) {
        self.queue.push_back(Datagram {
            payload: payload.to_vec(),
            to,
        });
    }

    pub(crate) fn has_work(&self) -> bool {
        self.readiness.readable || (self.readiness.writable && !self.queue.is_empty())
    }
}

/// Destination that reaches every host on the local segment for the
/// endpoint's address family.
pub fn broadcast_addr(local: SocketAddr, port: u16) -> SocketAddr {
    match local {
        SocketAddr::V4(_) => SocketAddr::new(Ipv4Addr::BROADCAST.into(), port),
        SocketAddr::V6(_) => SocketAddr::new(IPV6_DISCOVERY_GROUP.into(), port),
    }
}

pub(crate) fn bind_socket(addr: SocketAddr) -> Result<UdpSocket> {
    let socket = Socket::new(Domain::for_address(addr), Type::DGRAM, Some(Protocol::UDP))
        .map_err(|e| NetError::socket("create", e))?;

    socket
        .set_nonblocking(true)
        .map_err(|e| NetError::socket("set non-blocking", e))?;
    socket
        .set_reuse_address(true)
        .map_err(|e| NetError::socket("set SO_REUSEADDR", e))?;
    if addr.is_ipv4() {
        socket
            .set_broadcast(true)
            .map_err(|e| NetError::socket("set SO_BROADCAST", e))?;
    }
    socket
        .bind(&addr.into())
        .map_err(|e| NetError::socket("bind", e))?;

    Ok(UdpSocket::from_std(socket.into()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn broadcast_follows_family() {
        let v4: SocketAddr = "192.168.1.4:5000".parse().unwrap();
        assert_eq!(
            broadcast_addr(v4, 27910),
            "255.255.255.255:27910".parse().unwrap()
        );

        let v6: SocketAddr = "[::1]:5000".parse().unwrap();
        let target = broadcast_addr(v6, 27910);
        assert_eq!(target.ip(), IPV6_DISCOVERY_GROUP);
        assert!(IPV6_DISCOVERY_GROUP.is_multicast());
        assert_eq!(IPV6_DISCOVERY_GROUP.to_string(), "ff04::696f:7175:616b:6533");
    }

    #[test]
    fn queue_is_fifo() {
        let socket = bind_socket("127.0.0.1:0".parse().unwrap()).unwrap();
        let noop = |_: &mut Reactor, _: DatagramId, _: &[u8], _: SocketAddr| {};
        let mut endpoint = DatagramEndpoint::new(socket, Box::new(noop)).unwrap();

        let to: SocketAddr = "127.0.0.1:9".parse().unwrap();
        endpoint.enqueue(b"first", to);
        endpoint.enqueue(b"second", to);
        assert!(!endpoint.has_work());

        endpoint.readiness.writable = true;
        assert!(endpoint.has_work());
        assert_eq!(endpoint.queue.pop_front().unwrap().payload, b"first");
    }
}
