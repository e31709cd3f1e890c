use std::cell::RefCell;
use std::fmt;
use std::net::SocketAddr;
use std::rc::Rc;

use bitflags::bitflags;
use mio::net::TcpStream;

use crate::buffer::ByteQueue;
use crate::reactor::{Reactor, Readiness};
use crate::table::SlotId;

/// Queue shared between the two ends of a loopback pair. Real-socket
/// streams hold the only reference to theirs.
pub(crate) type SharedQueue = Rc<RefCell<ByteQueue>>;

pub(crate) fn shared_queue() -> SharedQueue {
    Rc::new(RefCell::new(ByteQueue::new()))
}

/// Stable handle to a stream. Goes stale once the stream is released.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct StreamId(pub(crate) SlotId);

impl StreamId {
    pub fn index(&self) -> usize {
        self.0.index()
    }
}

impl fmt::Display for StreamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "stream {}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    NotConnected,
    Connecting,
    Connected,
    Finishing,
    Closed,
}

impl StreamState {
    pub fn as_str(&self) -> &'static str {
        match self {
            StreamState::NotConnected => "not connected",
            StreamState::Connecting => "connecting",
            StreamState::Connected => "connected",
            StreamState::Finishing => "finishing",
            StreamState::Closed => "closed",
        }
    }
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct StreamFlags: u8 {
        const LOOPBACK = 1 << 0;
        /// Loopback data is waiting and the handler has not run yet.
        const READY = 1 << 1;
        /// Socket released.
        const CLOSED = 1 << 2;
        /// No more writes wanted; outbound may still be draining.
        const FINISHED = 1 << 3;
    }
}

/// Receives stream events from the reactor.
///
/// The handler is detached from its stream while it runs, so it may call
/// anything on the reactor, including freeing the stream it was called for.
pub trait StreamHandler {
    /// New inbound data is available.
    fn on_data(&mut self, net: &mut Reactor, stream: StreamId);

    /// The stream closed without the owner asking for it. Remaining inbound
    /// bytes can still be read here; the handle is released on return.
    fn on_closed(&mut self, net: &mut Reactor, stream: StreamId) {
        let _ = (net, stream);
    }

    /// A stream the owner finished or freed has been torn down. For a
    /// finished stream this means its pending output was flushed. The
    /// handle is already stale.
    fn on_released(&mut self, net: &mut Reactor, stream: StreamId) {
        let _ = (net, stream);
    }
}

impl<F> StreamHandler for F
where
    F: FnMut(&mut Reactor, StreamId),
{
    fn on_data(&mut self, net: &mut Reactor, stream: StreamId) {
        self(net, stream)
    }

    fn on_closed(&mut self, net: &mut Reactor, stream: StreamId) {
        self(net, stream)
    }
}

pub(crate) struct Stream {
    pub(crate) state: StreamState,
    pub(crate) flags: StreamFlags,
    pub(crate) socket: Option<TcpStream>,
    /// Name the caller connected to, kept for diagnostics.
    pub(crate) remote_name: Option<String>,
    pub(crate) inbound: Option<SharedQueue>,
    pub(crate) outbound: Option<SharedQueue>,
    pub(crate) loopback_peer: Option<StreamId>,
    pub(crate) handler: Option<Box<dyn StreamHandler>>,
    pub(crate) readiness: Readiness,
    pub(crate) want_write: bool,
}

impl Stream {
    pub(crate) fn new() -> Self {
        Self {
            state: StreamState::NotConnected,
            flags: StreamFlags::empty(),
            socket: None,
            remote_name: None,
            inbound: Some(shared_queue()),
            outbound: Some(shared_queue()),
            loopback_peer: None,
            handler: None,
            readiness: Readiness::default(),
            want_write: false,
        }
    }

    pub(crate) fn with_socket(socket: TcpStream, state: StreamState) -> Self {
        Self {
            state,
            socket: Some(socket),
            ..Self::new()
        }
    }

    pub(crate) fn is_loopback(&self) -> bool {
        self.flags.contains(StreamFlags::LOOPBACK)
    }

    pub(crate) fn is_finished(&self) -> bool {
        self.flags.contains(StreamFlags::FINISHED)
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.flags
            .intersects(StreamFlags::CLOSED | StreamFlags::FINISHED)
    }

    pub(crate) fn inbound_len(&self) -> usize {
        self.inbound.as_ref().map_or(0, |q| q.borrow().len())
    }

    pub(crate) fn outbound_len(&self) -> usize {
        self.outbound.as_ref().map_or(0, |q| q.borrow().len())
    }

    pub(crate) fn peer_addr(&self) -> Option<SocketAddr> {
        self.socket.as_ref().and_then(|s| s.peer_addr().ok())
    }

    pub(crate) fn peer_name(&self, numeric: bool, with_port: bool) -> String {
        if self.is_loopback() {
            return String::from("loopback connection");
        }

        let Some(addr) = self.peer_addr() else {
            return String::from("(error)");
        };

        let host = match (&self.remote_name, numeric) {
            (Some(name), false) => name.clone(),
            _ => addr.ip().to_string(),
        };

        if with_port {
            format!("{} {}", host, addr.port())
        } else {
            host
        }
    }
}
