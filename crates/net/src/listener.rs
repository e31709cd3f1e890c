use std::net::SocketAddr;

use mio::net::TcpListener;
use socket2::{Domain, Protocol, Socket, Type};

use crate::error::{NetError, Result};
use crate::reactor::Reactor;
use crate::stream::StreamId;

const LISTEN_BACKLOG: i32 = 1024;

/// Called once for every inbound stream: accepted sockets and the server
/// end of each loopback pair. Install a [`crate::StreamHandler`] on the
/// new stream from here to receive its data.
pub trait AcceptHandler {
    fn on_accept(&mut self, net: &mut Reactor, stream: StreamId);
}

impl<F> AcceptHandler for F
where
    F: FnMut(&mut Reactor, StreamId),
{
    fn on_accept(&mut self, net: &mut Reactor, stream: StreamId) {
        self(net, stream)
    }
}

/// Active server. Without a socket it only takes loopback connections.
pub(crate) struct Listener {
    pub(crate) socket: Option<TcpListener>,
    pub(crate) local_addr: Option<SocketAddr>,
    pub(crate) handler: Option<Box<dyn AcceptHandler>>,
    pub(crate) readable: bool,
}

impl Listener {
    pub(crate) fn loopback_only(handler: Box<dyn AcceptHandler>) -> Self {
        Self {
            socket: None,
            local_addr: None,
            handler: Some(handler),
            readable: false,
        }
    }

    pub(crate) fn with_socket(socket: TcpListener, handler: Box<dyn AcceptHandler>) -> Self {
        let local_addr = socket.local_addr().ok();
        Self {
            socket: Some(socket),
            local_addr,
            handler: Some(handler),
            readable: false,
        }
    }
}

pub(crate) fn bind_listener(addr: SocketAddr) -> Result<TcpListener> {
    let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))
        .map_err(|e| NetError::socket("create", e))?;

    socket
        .set_nonblocking(true)
        .map_err(|e| NetError::socket("set non-blocking", e))?;
    socket
        .set_reuse_address(true)
        .map_err(|e| NetError::socket("set SO_REUSEADDR", e))?;
    socket
        .bind(&addr.into())
        .map_err(|e| NetError::socket("bind", e))?;
    socket
        .listen(LISTEN_BACKLOG)
        .map_err(|e| NetError::socket("listen", e))?;

    Ok(TcpListener::from_std(socket.into()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn binds_ephemeral_port() {
        let listener = bind_listener("127.0.0.1:0".parse().unwrap()).unwrap();
        let addr = listener.local_addr().unwrap();
        assert_ne!(addr.port(), 0);
    }

    #[test]
    fn loopback_only_has_no_address() {
        let noop = |_: &mut Reactor, _: StreamId| {};
        let listener = Listener::loopback_only(Box::new(noop));
        assert!(listener.socket.is_none());
        assert!(listener.local_addr.is_none());
        assert!(listener.handler.is_some());
    }
}
