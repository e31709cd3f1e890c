//! Single-threaded readiness loop.
//!
//! One [`Reactor::wait`] call is one pass: poll the OS once, then service
//! the listener, every socket stream, every datagram endpoint and finally
//! every loopback stream with pending data. Handlers run synchronously
//! inside the pass and receive the reactor itself, so they may open, write,
//! finish or free streams, including the one they were called for.
//!
//! mio reports readiness edge-triggered. Each socket therefore carries its
//! own [`Readiness`] flags: set from events, cleared only when an operation
//! returns `WouldBlock`. Work that is still flagged makes the next pass poll
//! with a zero timeout, which gives the level-triggered "one read buffer per
//! pass" behaviour the rest of the engine expects.

use std::io::{self, Read, Write};
use std::net::SocketAddr;
use std::time::Duration;

use mio::net::TcpStream;
use mio::{Events, Interest, Poll, Token};

use crate::config::NetConfig;
use crate::datagram::{self, DatagramEndpoint, DatagramHandler, DatagramId};
use crate::error::{NetError, Result};
use crate::listener::{self, AcceptHandler, Listener};
use crate::loopback;
use crate::resolve;
use crate::stats::{NetworkStats, StreamInfo};
use crate::stream::{Stream, StreamFlags, StreamHandler, StreamId, StreamState};
use crate::table::SlotTable;

const LISTENER_TOKEN: Token = Token(1 << 30);
const DATAGRAM_TOKEN_BASE: usize = 1 << 20;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub(crate) struct Readiness {
    pub(crate) readable: bool,
    pub(crate) writable: bool,
}

impl Readiness {
    fn merge(&mut self, other: Readiness) {
        self.readable |= other.readable;
        self.writable |= other.writable;
    }
}

enum ConnectProgress {
    Established,
    Pending,
    Failed,
}

enum ReadOutcome {
    Data(usize),
    Blocked,
    Eof,
    Failed(io::Error),
}

pub struct Reactor {
    poll: Poll,
    events: Events,
    config: NetConfig,
    streams: SlotTable<Stream>,
    datagrams: SlotTable<DatagramEndpoint>,
    listener: Option<Listener>,
    loopback_pending: bool,
    /// Owner-closed streams whose handler was running when they went away.
    released: Vec<StreamId>,
    io_buffer: Vec<u8>,
    stats: NetworkStats,
}

impl Reactor {
    pub fn new(config: NetConfig) -> Result<Self> {
        let poll = Poll::new().map_err(|e| NetError::socket("create poll", e))?;
        let io_buffer = vec![0u8; config.read_chunk.max(config.datagram_buffer_size).max(1)];

        Ok(Self {
            poll,
            events: Events::with_capacity(config.events_capacity.max(1)),
            streams: SlotTable::with_capacity(config.max_streams.min(DATAGRAM_TOKEN_BASE)),
            datagrams: SlotTable::with_capacity(config.max_datagram_sockets),
            listener: None,
            loopback_pending: false,
            released: Vec::new(),
            io_buffer,
            stats: NetworkStats::default(),
            config,
        })
    }

    pub fn config(&self) -> &NetConfig {
        &self.config
    }

    pub fn stats(&self) -> &NetworkStats {
        &self.stats
    }

    pub fn stream_count(&self) -> usize {
        self.streams.len()
    }

    pub fn datagram_count(&self) -> usize {
        self.datagrams.len()
    }

    /// Handles of every open stream in table order.
    pub fn stream_ids(&self) -> Vec<StreamId> {
        self.streams.ids().into_iter().map(StreamId).collect()
    }

    // Streams

    /// Starts a non-blocking connection to `host:service`.
    ///
    /// The stream is returned in [`StreamState::Connecting`]; data may be
    /// enqueued right away and is sent once the connection completes.
    pub fn connect(&mut self, host: &str, service: &str) -> Result<StreamId> {
        let addr = resolve::resolve(host, service, self.config.ipv4_only)?;

        if self.streams.is_full() {
            log::warn!(
                "Failed to connect to host {}:{}, too many streams open",
                host,
                service
            );
            return Err(NetError::TooManyStreams);
        }

        let socket = TcpStream::connect(addr).map_err(|e| {
            log::warn!("Failed to start connection to {}:{}: {}", host, service, e);
            NetError::socket("connect", e)
        })?;

        let mut stream = Stream::with_socket(socket, StreamState::Connecting);
        stream.remote_name = Some(host.to_string());

        let id = self.insert_stream(stream)?;
        log::debug!("Connecting {} to {}:{} ({})", id, host, service, addr);
        Ok(id)
    }

    /// Opens an in-process connection to the running server.
    ///
    /// The server end is handed to the accept handler before this returns.
    pub fn connect_loopback(&mut self) -> Result<StreamId> {
        if self.listener.is_none() {
            return Err(NetError::NoServerRunning);
        }

        if self.streams.free_slots() < 2 {
            log::warn!("Failed to connect to loopback server, too many streams open");
            return Err(NetError::TooManyStreams);
        }

        let (client, server) = loopback::pair();
        let client = self
            .streams
            .insert(client)
            .map(StreamId)
            .ok_or(NetError::TooManyStreams)?;
        let server = match self.streams.insert(server) {
            Some(id) => StreamId(id),
            None => {
                self.streams.remove(client.0);
                return Err(NetError::TooManyStreams);
            }
        };

        loopback::link(&mut self.streams, client, server);
        self.stats.streams_opened += 2;
        log::debug!("Loopback pair {} <-> {}", client, server);

        self.notify_accept(server);
        Ok(client)
    }

    /// Queues `data` for the peer.
    ///
    /// Writes to closed, finished or stale streams are silently dropped.
    /// Fails only when the configured outbound cap would be exceeded, in
    /// which case nothing is queued.
    pub fn enqueue(&mut self, id: StreamId, data: &[u8]) -> Result<()> {
        if data.is_empty() {
            return Ok(());
        }

        let Some(stream) = self.streams.get_mut(id.0) else {
            return Ok(());
        };
        if stream.is_closed() {
            return Ok(());
        }

        let Some(outbound) = &stream.outbound else {
            return Ok(());
        };

        {
            let mut queue = outbound.borrow_mut();
            if let Some(limit) = self.config.max_outbound_bytes {
                if queue.len() + data.len() > limit {
                    return Err(NetError::Backpressure {
                        queued: queue.len(),
                        limit,
                    });
                }
            }
            queue.append(data);
        }

        if stream.socket.is_some() {
            stream.want_write = true;
        }

        if let Some(peer) = stream.loopback_peer {
            if let Some(peer) = self.streams.get_mut(peer.0) {
                peer.flags.insert(StreamFlags::READY);
            }
            self.loopback_pending = true;
        }

        Ok(())
    }

    /// Moves up to `out.len()` inbound bytes into `out`.
    pub fn dequeue(&mut self, id: StreamId, out: &mut [u8]) -> usize {
        match self.streams.get(id.0) {
            Some(stream) if !stream.is_finished() => stream
                .inbound
                .as_ref()
                .map_or(0, |q| q.borrow_mut().extract(out)),
            _ => 0,
        }
    }

    pub fn peek(&self, id: StreamId, out: &mut [u8]) -> usize {
        self.streams
            .get(id.0)
            .and_then(|s| s.inbound.as_ref())
            .map_or(0, |q| q.borrow().peek(out))
    }

    /// Inbound bytes waiting to be dequeued.
    pub fn pending_length(&self, id: StreamId) -> usize {
        match self.streams.get(id.0) {
            Some(stream) if !stream.is_finished() => stream.inbound_len(),
            _ => 0,
        }
    }

    /// Outbound bytes not yet handed to the OS or read by the loopback peer.
    pub fn outbound_len(&self, id: StreamId) -> usize {
        self.streams.get(id.0).map_or(0, Stream::outbound_len)
    }

    /// True once the stream is closed, finished, or the handle is stale.
    pub fn is_closed(&self, id: StreamId) -> bool {
        self.streams.get(id.0).is_none_or(Stream::is_closed)
    }

    pub fn is_loopback(&self, id: StreamId) -> bool {
        self.streams.get(id.0).is_some_and(Stream::is_loopback)
    }

    pub fn state(&self, id: StreamId) -> StreamState {
        self.streams
            .get(id.0)
            .map_or(StreamState::Closed, |s| s.state)
    }

    pub fn register_handler<H>(&mut self, id: StreamId, handler: H)
    where
        H: StreamHandler + 'static,
    {
        if let Some(stream) = self.streams.get_mut(id.0) {
            stream.handler = Some(Box::new(handler));
        }
    }

    /// Graceful close: no more reads or writes, pending output is still
    /// delivered. The handle reads as closed from now on and is released
    /// once the outbound queue has drained.
    pub fn finish(&mut self, id: StreamId) {
        let Some(stream) = self.streams.get_mut(id.0) else {
            return;
        };
        if stream.is_closed() {
            return;
        }

        stream.flags.insert(StreamFlags::FINISHED);
        if stream.state != StreamState::Connecting {
            stream.state = StreamState::Finishing;
        }
        stream.inbound = None;
        stream.readiness.readable = false;

        let peer = stream.loopback_peer;
        let drained = stream.outbound_len() == 0;

        if let Some(socket) = stream.socket.as_mut() {
            if let Err(e) =
                self.poll
                    .registry()
                    .reregister(socket, Token(id.index()), Interest::WRITABLE)
            {
                log::debug!("Failed to drop read interest for {}: {}", id, e);
            }
        }

        if let Some(peer) = peer {
            loopback::stop_writes_from(&mut self.streams, peer);
        }

        if drained {
            self.close_stream(id);
        }
    }

    /// Immediate teardown. Undelivered output is discarded. Safe to call
    /// from the stream's own handler.
    pub fn free(&mut self, id: StreamId) {
        let Some(stream) = self.streams.get_mut(id.0) else {
            return;
        };
        stream.flags.insert(StreamFlags::FINISHED);

        self.close_stream(id);
        self.streams.remove(id.0);
    }

    /// Peer address for diagnostics. `numeric` selects the IP over the name
    /// the stream was opened with; `with_port` appends the port.
    ///
    /// No reverse lookup is done: accepted streams have no name, so they
    /// report the IP either way.
    pub fn peer_address_string(&self, id: StreamId, numeric: bool, with_port: bool) -> String {
        self.streams
            .get(id.0)
            .map_or_else(|| String::from("(error)"), |s| s.peer_name(numeric, with_port))
    }

    pub fn peer_addr(&self, id: StreamId) -> Option<SocketAddr> {
        self.streams.get(id.0).and_then(Stream::peer_addr)
    }

    // Listener

    /// Starts accepting connections. Without a `service` only loopback
    /// connections are accepted.
    pub fn listen<H>(&mut self, host: Option<&str>, service: Option<&str>, handler: H) -> Result<()>
    where
        H: AcceptHandler + 'static,
    {
        if self.listener.is_some() {
            log::warn!("Server is still running - stop it before listening again");
            return Err(NetError::ServerAlreadyRunning);
        }

        let handler: Box<dyn AcceptHandler> = Box::new(handler);

        let listener = match service {
            Some(service) => {
                let addr = resolve::resolve_passive(host, service, self.config.ipv4_only)?;
                let mut socket = listener::bind_listener(addr).inspect_err(|e| {
                    log::warn!(
                        "Failed to start server on {}:{}: {}",
                        host.unwrap_or("*"),
                        service,
                        e
                    );
                })?;
                self.poll
                    .registry()
                    .register(&mut socket, LISTENER_TOKEN, Interest::READABLE)
                    .map_err(|e| NetError::socket("register", e))?;

                let listener = Listener::with_socket(socket, handler);
                if let Some(addr) = listener.local_addr {
                    log::info!("Listening on {}", addr);
                }
                listener
            }
            None => {
                log::info!("Listening for loopback connections only");
                Listener::loopback_only(handler)
            }
        };

        self.listener = Some(listener);
        Ok(())
    }

    pub fn stop_listening(&mut self) {
        let Some(listener) = self.listener.take() else {
            return;
        };

        if let Some(mut socket) = listener.socket {
            if let Err(e) = self.poll.registry().deregister(&mut socket) {
                log::debug!("Failed to deregister listener: {}", e);
            }
        }
        log::info!("Server stopped");
    }

    pub fn is_listening(&self) -> bool {
        self.listener.is_some()
    }

    pub fn listen_addr(&self) -> Option<SocketAddr> {
        self.listener.as_ref().and_then(|l| l.local_addr)
    }

    // Datagrams

    pub fn datagram_bind<H>(&mut self, host: Option<&str>, service: &str, handler: H) -> Result<DatagramId>
    where
        H: DatagramHandler + 'static,
    {
        if self.datagrams.is_full() {
            log::warn!("Too many datagram sockets open");
            return Err(NetError::TooManyDatagramSockets);
        }

        let addr = resolve::resolve_passive(host, service, self.config.ipv4_only)?;
        let socket = datagram::bind_socket(addr)
            .inspect_err(|e| log::warn!("Failed to open datagram socket on {}: {}", addr, e))?;
        let endpoint = DatagramEndpoint::new(socket, Box::new(handler))?;
        let local_addr = endpoint.local_addr;

        let id = self
            .datagrams
            .insert(endpoint)
            .map(DatagramId)
            .ok_or(NetError::TooManyDatagramSockets)?;

        let token = Token(DATAGRAM_TOKEN_BASE + id.index());
        let registered = match self.datagrams.get_mut(id.0) {
            Some(endpoint) => self.poll.registry().register(
                &mut endpoint.socket,
                token,
                Interest::READABLE | Interest::WRITABLE,
            ),
            None => Ok(()),
        };
        if let Err(e) = registered {
            self.datagrams.remove(id.0);
            return Err(NetError::socket("register", e));
        }

        log::debug!("Opened {} on {}", id, local_addr);
        Ok(id)
    }

    /// Queues one datagram. It is sent on a later pass, one per pass.
    pub fn datagram_send(&mut self, id: DatagramId, payload: &[u8], to: SocketAddr) {
        if payload.is_empty() {
            return;
        }
        if let Some(endpoint) = self.datagrams.get_mut(id.0) {
            endpoint.enqueue(payload, to);
        }
    }

    pub fn datagram_broadcast(&mut self, id: DatagramId, payload: &[u8], port: u16) {
        let Some(endpoint) = self.datagrams.get(id.0) else {
            return;
        };
        let to = datagram::broadcast_addr(endpoint.local_addr, port);
        self.datagram_send(id, payload, to);
    }

    pub fn datagram_close(&mut self, id: DatagramId) {
        let Some(mut endpoint) = self.datagrams.remove(id.0) else {
            return;
        };

        if let Err(e) = self.poll.registry().deregister(&mut endpoint.socket) {
            log::debug!("Failed to deregister {}: {}", id, e);
        }
        if !endpoint.queue.is_empty() {
            log::debug!(
                "Dropping {} queued datagrams on {}",
                endpoint.queue.len(),
                id
            );
        }
    }

    pub fn datagram_queued(&self, id: DatagramId) -> usize {
        self.datagrams.get(id.0).map_or(0, |d| d.queue.len())
    }

    pub fn datagram_local_addr(&self, id: DatagramId) -> Option<SocketAddr> {
        self.datagrams.get(id.0).map(|d| d.local_addr)
    }

    // Diagnostics

    pub fn stream_infos(&self) -> Vec<StreamInfo> {
        self.streams
            .iter()
            .map(|(id, stream)| StreamInfo {
                index: id.index(),
                peer: stream.peer_name(true, true),
                state: stream.state,
                loopback: stream.is_loopback(),
                closed: stream.flags.contains(StreamFlags::CLOSED),
                finished: stream.is_finished(),
                inbound_len: stream.inbound_len(),
                outbound_len: stream.outbound_len(),
            })
            .collect()
    }

    pub fn log_streams(&self) {
        for info in self.stream_infos() {
            log::info!(
                "Stream {} is open: {} ({}, closed: {}, finished: {}, outbound: {}, inbound: {})",
                info.index,
                info.peer,
                info.state.as_str(),
                info.closed,
                info.finished,
                info.outbound_len,
                info.inbound_len
            );
        }
        log::info!(
            "{}/{} streams open",
            self.streams.len(),
            self.streams.capacity()
        );
    }

    // Dispatch

    /// Runs one pass. Blocks for at most `timeout`, and not at all when
    /// loopback data or flagged socket work is already pending.
    pub fn wait(&mut self, timeout: Duration) {
        self.released.clear();
        let timeout = if self.has_pending_work() {
            Duration::ZERO
        } else {
            timeout
        };

        if let Err(e) = self.poll.poll(&mut self.events, Some(timeout)) {
            if e.kind() != io::ErrorKind::Interrupted {
                log::warn!("poll failed: {}", e);
            }
            self.events.clear();
        }

        let ready: Vec<(Token, Readiness)> = self
            .events
            .iter()
            .map(|event| {
                let error = event.is_error();
                (
                    event.token(),
                    Readiness {
                        readable: event.is_readable() || event.is_read_closed() || error,
                        writable: event.is_writable() || event.is_write_closed() || error,
                    },
                )
            })
            .collect();

        for (token, readiness) in ready {
            self.mark_ready(token, readiness);
        }

        self.accept_pending();

        for id in self.streams.ids() {
            self.service_stream(StreamId(id));
        }

        for id in self.datagrams.ids() {
            self.service_datagram(DatagramId(id));
        }

        self.deliver_loopback();
    }

    fn has_pending_work(&self) -> bool {
        self.loopback_pending
            || self.listener.as_ref().is_some_and(|l| l.readable)
            || self.streams.iter().any(|(_, s)| {
                let connecting = s.state == StreamState::Connecting;
                s.socket.is_some()
                    && ((s.readiness.readable && !connecting && !s.is_finished())
                        || (s.readiness.writable && (s.want_write || connecting)))
            })
            || self.datagrams.iter().any(|(_, d)| d.has_work())
    }

    fn mark_ready(&mut self, token: Token, readiness: Readiness) {
        if token == LISTENER_TOKEN {
            if let Some(listener) = self.listener.as_mut() {
                listener.readable |= readiness.readable;
            }
            return;
        }

        if token.0 >= DATAGRAM_TOKEN_BASE {
            let index = token.0 - DATAGRAM_TOKEN_BASE;
            if let Some(endpoint) = self
                .datagrams
                .id_at(index)
                .and_then(|id| self.datagrams.get_mut(id))
            {
                endpoint.readiness.merge(readiness);
            }
            return;
        }

        if let Some(stream) = self
            .streams
            .id_at(token.0)
            .and_then(|id| self.streams.get_mut(id))
        {
            stream.readiness.merge(readiness);
        }
    }

    fn accept_pending(&mut self) {
        let accepted = match self.listener.as_mut() {
            Some(listener) if listener.readable => match listener.socket.as_ref() {
                Some(socket) => match socket.accept() {
                    Ok(accepted) => Some(accepted),
                    Err(e) => {
                        if e.kind() != io::ErrorKind::WouldBlock {
                            log::warn!("accept failed: {}", e);
                        }
                        listener.readable = false;
                        None
                    }
                },
                None => None,
            },
            _ => None,
        };

        if let Some((socket, addr)) = accepted {
            self.do_accept(socket, addr);
        }
    }

    fn do_accept(&mut self, socket: TcpStream, addr: SocketAddr) {
        if self.streams.is_full() {
            log::warn!(
                "Too many streams open, rejecting inbound connection from {}",
                addr
            );
            self.stats.connections_rejected += 1;
            return;
        }

        let id = match self.insert_stream(Stream::with_socket(socket, StreamState::Connected)) {
            Ok(id) => id,
            Err(e) => {
                log::warn!("Failed to accept connection from {}: {}", addr, e);
                return;
            }
        };

        self.stats.streams_accepted += 1;
        log::debug!("Accepted {} from {}", id, addr);
        self.notify_accept(id);
    }

    fn insert_stream(&mut self, stream: Stream) -> Result<StreamId> {
        let id = self
            .streams
            .insert(stream)
            .map(StreamId)
            .ok_or(NetError::TooManyStreams)?;

        let registered = match self.streams.get_mut(id.0).and_then(|s| s.socket.as_mut()) {
            Some(socket) => self.poll.registry().register(
                socket,
                Token(id.index()),
                Interest::READABLE | Interest::WRITABLE,
            ),
            None => Ok(()),
        };
        if let Err(e) = registered {
            self.streams.remove(id.0);
            return Err(NetError::socket("register", e));
        }

        self.stats.streams_opened += 1;
        Ok(id)
    }

    fn service_stream(&mut self, id: StreamId) {
        let Some(stream) = self.streams.get(id.0) else {
            return;
        };
        if stream.is_loopback() || stream.socket.is_none() {
            return;
        }

        let readiness = stream.readiness;
        let wants_write = stream.want_write
            || stream.is_finished()
            || stream.state == StreamState::Connecting;

        if readiness.writable && wants_write {
            self.flush_stream(id);
        }

        let connected = self
            .streams
            .get(id.0)
            .is_some_and(|s| s.state != StreamState::Connecting);
        if readiness.readable && connected {
            self.read_stream(id);
        }
    }

    fn check_connect(&mut self, id: StreamId) -> ConnectProgress {
        let Some(stream) = self.streams.get_mut(id.0) else {
            return ConnectProgress::Failed;
        };
        if stream.state != StreamState::Connecting {
            return ConnectProgress::Established;
        }
        let Some(socket) = stream.socket.as_ref() else {
            return ConnectProgress::Failed;
        };

        let error = match socket.take_error() {
            Ok(Some(e)) | Err(e) => Some(e),
            Ok(None) => None,
        };
        if let Some(e) = error {
            log::warn!("Connection for {} failed: {}", id, e);
            self.close_stream(id);
            return ConnectProgress::Failed;
        }

        match socket.peer_addr() {
            Ok(addr) => {
                stream.state = if stream.is_finished() {
                    StreamState::Finishing
                } else {
                    StreamState::Connected
                };
                log::debug!("{} connected to {}", id, addr);
                ConnectProgress::Established
            }
            Err(e)
                if e.kind() == io::ErrorKind::NotConnected
                    || e.kind() == io::ErrorKind::WouldBlock =>
            {
                stream.readiness.writable = false;
                ConnectProgress::Pending
            }
            Err(e) => {
                log::warn!("Connection for {} failed: {}", id, e);
                self.close_stream(id);
                ConnectProgress::Failed
            }
        }
    }

    fn flush_stream(&mut self, id: StreamId) {
        match self.check_connect(id) {
            ConnectProgress::Established => {}
            ConnectProgress::Pending | ConnectProgress::Failed => return,
        }

        let chunk = self.config.read_chunk.max(1);
        let mut buf = self.take_buffer(chunk);
        let result = self.write_outbound(id, &mut buf[..chunk]);
        self.io_buffer = buf;

        match result {
            Ok(0) => {}
            Ok(written) => {
                log::debug!(
                    "wrote {} bytes to {} ({})",
                    written,
                    id,
                    self.peer_address_string(id, true, true)
                );
            }
            Err(e) => {
                log::warn!("write on {} failed: {}", id, e);
                self.close_stream(id);
                return;
            }
        }

        let Some(stream) = self.streams.get_mut(id.0) else {
            return;
        };
        if stream.outbound_len() == 0 {
            stream.want_write = false;
            // Finished streams close once their outbound queue empties.
            if stream.is_finished() {
                self.close_stream(id);
            }
        }
    }

    fn write_outbound(&mut self, id: StreamId, buf: &mut [u8]) -> io::Result<usize> {
        let Some(stream) = self.streams.get_mut(id.0) else {
            return Ok(0);
        };
        let Some(outbound) = stream.outbound.clone() else {
            return Ok(0);
        };
        let Some(socket) = stream.socket.as_mut() else {
            return Ok(0);
        };

        let mut written = 0;
        loop {
            let n = outbound.borrow().peek(buf);
            if n == 0 {
                break;
            }

            match socket.write(&buf[..n]) {
                Ok(0) => return Err(io::ErrorKind::WriteZero.into()),
                Ok(sent) => {
                    outbound.borrow_mut().consume(sent);
                    written += sent;
                    self.stats.bytes_sent += sent as u64;
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    stream.readiness.writable = false;
                    break;
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }

        Ok(written)
    }

    fn read_stream(&mut self, id: StreamId) {
        let chunk = self.config.read_chunk.max(1);
        let mut buf = self.take_buffer(chunk);
        let outcome = self.read_inbound(id, &mut buf[..chunk]);
        self.io_buffer = buf;

        match outcome {
            ReadOutcome::Data(n) => {
                log::debug!(
                    "read {} bytes from {} ({})",
                    n,
                    id,
                    self.peer_address_string(id, true, true)
                );
                self.notify_data(id);
            }
            ReadOutcome::Blocked => {}
            ReadOutcome::Eof => {
                log::debug!("{} closed by peer", id);
                self.close_stream(id);
            }
            ReadOutcome::Failed(e) => {
                log::warn!("read on {} failed: {}", id, e);
                self.close_stream(id);
            }
        }
    }

    fn read_inbound(&mut self, id: StreamId, buf: &mut [u8]) -> ReadOutcome {
        let Some(stream) = self.streams.get_mut(id.0) else {
            return ReadOutcome::Blocked;
        };
        if stream.is_finished() {
            stream.readiness.readable = false;
            return ReadOutcome::Blocked;
        }
        let Some(socket) = stream.socket.as_mut() else {
            return ReadOutcome::Blocked;
        };

        loop {
            match socket.read(buf) {
                Ok(0) => return ReadOutcome::Eof,
                Ok(n) => {
                    if let Some(inbound) = &stream.inbound {
                        inbound.borrow_mut().append(&buf[..n]);
                    }
                    self.stats.bytes_received += n as u64;
                    return ReadOutcome::Data(n);
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    stream.readiness.readable = false;
                    return ReadOutcome::Blocked;
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return ReadOutcome::Failed(e),
            }
        }
    }

    fn service_datagram(&mut self, id: DatagramId) {
        self.send_datagram(id);
        self.receive_datagram(id);
    }

    fn send_datagram(&mut self, id: DatagramId) {
        let Some(endpoint) = self.datagrams.get_mut(id.0) else {
            return;
        };
        if !endpoint.readiness.writable {
            return;
        }
        let Some(datagram) = endpoint.queue.pop_front() else {
            return;
        };

        match endpoint.socket.send_to(&datagram.payload, datagram.to) {
            Ok(n) => {
                self.stats.packets_sent += 1;
                self.stats.bytes_sent += n as u64;
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                // Nothing reached the OS; keep the datagram for the next write event.
                endpoint.readiness.writable = false;
                endpoint.queue.push_front(datagram);
            }
            Err(e) => {
                // Datagrams are never retried.
                log::warn!("sendto {} on {} failed: {}", datagram.to, id, e);
                self.stats.packets_dropped += 1;
            }
        }
    }

    fn receive_datagram(&mut self, id: DatagramId) {
        let size = self.config.datagram_buffer_size.max(1);
        let mut buf = self.take_buffer(size);

        let received = match self.datagrams.get_mut(id.0) {
            Some(endpoint) if endpoint.readiness.readable => {
                match endpoint.socket.recv_from(&mut buf[..size]) {
                    Ok(received) => Some(received),
                    Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                        endpoint.readiness.readable = false;
                        None
                    }
                    Err(e) => {
                        log::warn!("recvfrom on {} failed: {}", id, e);
                        None
                    }
                }
            }
            _ => None,
        };

        if let Some((n, from)) = received {
            self.stats.packets_received += 1;
            self.stats.bytes_received += n as u64;

            let handler = self.datagrams.get_mut(id.0).and_then(|d| d.handler.take());
            if let Some(mut handler) = handler {
                handler.on_datagram(self, id, &buf[..n], from);
                if let Some(endpoint) = self.datagrams.get_mut(id.0) {
                    if endpoint.handler.is_none() {
                        endpoint.handler = Some(handler);
                    }
                }
            }
        }

        self.io_buffer = buf;
    }

    fn deliver_loopback(&mut self) {
        self.loopback_pending = false;

        let loopback: Vec<StreamId> = self
            .streams
            .iter()
            .filter(|(_, s)| s.is_loopback())
            .map(|(id, _)| StreamId(id))
            .collect();

        for id in loopback {
            let Some(stream) = self.streams.get_mut(id.0) else {
                continue;
            };

            if loopback::is_spent(stream) {
                self.close_stream(id);
                continue;
            }

            if stream.flags.contains(StreamFlags::READY) {
                stream.flags.remove(StreamFlags::READY);
                if !stream.is_finished() {
                    self.notify_data(id);
                }
            }
        }
    }

    /// Releases the socket and detaches any loopback peer. Streams the owner
    /// has finished or freed get `on_released` after the slot is gone;
    /// otherwise the handler sees the closed state once before release.
    fn close_stream(&mut self, id: StreamId) {
        let Some(stream) = self.streams.get_mut(id.0) else {
            return;
        };
        if stream.flags.contains(StreamFlags::CLOSED) {
            return;
        }

        if let Some(mut socket) = stream.socket.take() {
            if stream.outbound_len() > 0 {
                log::warn!("The outbound buffer for {} is not empty", id);
            } else if stream.inbound_len() > 0 {
                log::warn!("The inbound buffer for {} is not empty", id);
            }
            if let Err(e) = self.poll.registry().deregister(&mut socket) {
                log::debug!("Failed to deregister {}: {}", id, e);
            }
        }

        stream.flags.insert(StreamFlags::CLOSED);
        stream.flags.remove(StreamFlags::READY);
        stream.state = StreamState::Closed;
        stream.outbound = None;
        stream.want_write = false;
        stream.readiness = Readiness::default();

        let finished = stream.is_finished();
        let peer = stream.loopback_peer.take();

        if let Some(peer) = peer {
            loopback::detach(&mut self.streams, peer);
            self.loopback_pending = true;
        }

        self.stats.streams_closed += 1;
        log::debug!("Closed {}", id);

        if finished {
            let handler = self.take_stream_handler(id);
            self.streams.remove(id.0);
            match handler {
                Some(mut handler) => handler.on_released(self, id),
                None => self.released.push(id),
            }
        } else {
            self.notify_closed(id);
            self.streams.remove(id.0);
        }
    }

    fn notify_accept(&mut self, id: StreamId) {
        let Some(mut handler) = self.listener.as_mut().and_then(|l| l.handler.take()) else {
            return;
        };

        handler.on_accept(self, id);

        if let Some(listener) = self.listener.as_mut() {
            if listener.handler.is_none() {
                listener.handler = Some(handler);
            }
        }
    }

    fn notify_data(&mut self, id: StreamId) {
        let Some(mut handler) = self.take_stream_handler(id) else {
            return;
        };
        handler.on_data(self, id);

        // Finished or freed from inside its own handler.
        if let Some(pos) = self.released.iter().position(|r| *r == id) {
            self.released.swap_remove(pos);
            handler.on_released(self, id);
            return;
        }
        self.restore_stream_handler(id, handler);
    }

    fn notify_closed(&mut self, id: StreamId) {
        let Some(mut handler) = self.take_stream_handler(id) else {
            return;
        };
        handler.on_closed(self, id);
    }

    fn take_stream_handler(&mut self, id: StreamId) -> Option<Box<dyn StreamHandler>> {
        self.streams.get_mut(id.0).and_then(|s| s.handler.take())
    }

    fn restore_stream_handler(&mut self, id: StreamId, handler: Box<dyn StreamHandler>) {
        // The handler may have freed the stream or installed a replacement.
        if let Some(stream) = self.streams.get_mut(id.0) {
            if stream.handler.is_none() {
                stream.handler = Some(handler);
            }
        }
    }

    fn take_buffer(&mut self, size: usize) -> Vec<u8> {
        let mut buf = std::mem::take(&mut self.io_buffer);
        if buf.len() < size {
            buf.resize(size, 0);
        }
        buf
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::rc::Rc;

    fn reactor() -> Reactor {
        Reactor::new(NetConfig::default()).unwrap()
    }

    fn pass(net: &mut Reactor) {
        net.wait(Duration::from_millis(5));
    }

    fn dequeue_all(net: &mut Reactor, id: StreamId) -> Vec<u8> {
        let mut out = vec![0u8; net.pending_length(id)];
        let n = net.dequeue(id, &mut out);
        out.truncate(n);
        out
    }

    #[test]
    fn loopback_without_server_fails() {
        let mut net = reactor();
        let err = net.connect_loopback().unwrap_err();
        assert!(matches!(err, NetError::NoServerRunning));
        assert_eq!(net.stream_count(), 0);
    }

    #[test]
    fn loopback_accept_runs_once_synchronously() {
        let mut net = reactor();
        let accepted = Rc::new(RefCell::new(Vec::new()));
        let sink = Rc::clone(&accepted);
        net.listen(None, None, move |_: &mut Reactor, stream: StreamId| {
            sink.borrow_mut().push(stream);
        })
        .unwrap();

        let client = net.connect_loopback().unwrap();
        assert_eq!(accepted.borrow().len(), 1);
        let server = accepted.borrow()[0];
        assert_ne!(client, server);
        assert!(net.is_loopback(client));
        assert!(net.is_loopback(server));
        assert_eq!(net.state(server), StreamState::Connected);

        pass(&mut net);
        assert_eq!(accepted.borrow().len(), 1);
    }

    #[test]
    fn loopback_delivery_fires_handler_next_pass() {
        let mut net = reactor();
        let received = Rc::new(RefCell::new(Vec::new()));
        let calls = Rc::new(RefCell::new(0));

        let sink = Rc::clone(&received);
        let counter = Rc::clone(&calls);
        net.listen(None, None, move |net: &mut Reactor, stream: StreamId| {
            let sink = Rc::clone(&sink);
            let counter = Rc::clone(&counter);
            net.register_handler(stream, move |net: &mut Reactor, stream: StreamId| {
                *counter.borrow_mut() += 1;
                let data = dequeue_all(net, stream);
                sink.borrow_mut().extend_from_slice(&data);
            });
        })
        .unwrap();

        let client = net.connect_loopback().unwrap();
        net.enqueue(client, b"hello ").unwrap();
        net.enqueue(client, b"world").unwrap();
        assert!(received.borrow().is_empty());

        // Pending loopback data makes the pass return immediately.
        let start = std::time::Instant::now();
        net.wait(Duration::from_secs(5));
        assert!(start.elapsed() < Duration::from_secs(1));

        assert_eq!(received.borrow().as_slice(), b"hello world");
        assert_eq!(*calls.borrow(), 1);

        pass(&mut net);
        assert_eq!(*calls.borrow(), 1);
    }

    #[test]
    fn survivor_keeps_delivered_bytes_after_peer_frees() {
        let mut net = reactor();
        let server = Rc::new(RefCell::new(None));
        let slot = Rc::clone(&server);
        net.listen(None, None, move |_: &mut Reactor, stream: StreamId| {
            *slot.borrow_mut() = Some(stream);
        })
        .unwrap();

        let client = net.connect_loopback().unwrap();
        let server = server.borrow().unwrap();

        net.enqueue(client, b"parting words").unwrap();
        net.free(client);
        assert!(net.is_closed(client));

        net.enqueue(server, b"into the void").unwrap();
        assert_eq!(net.outbound_len(server), 0);

        assert_eq!(dequeue_all(&mut net, server), b"parting words");
        assert!(!net.is_closed(server));

        // No peer and nothing left to read: closed on the next pass.
        pass(&mut net);
        assert!(net.is_closed(server));
        assert_eq!(net.stream_count(), 0);
    }

    #[test]
    fn passive_close_notifies_survivor_once() {
        let mut net = reactor();
        let events = Rc::new(RefCell::new(Vec::new()));
        let log = Rc::clone(&events);
        net.listen(None, None, move |net: &mut Reactor, stream: StreamId| {
            let log = Rc::clone(&log);
            net.register_handler(stream, move |net: &mut Reactor, stream: StreamId| {
                log.borrow_mut().push(net.is_closed(stream));
            });
        })
        .unwrap();

        let client = net.connect_loopback().unwrap();
        net.free(client);

        pass(&mut net);
        pass(&mut net);
        assert_eq!(events.borrow().as_slice(), &[true]);
    }

    #[test]
    fn finish_defers_close_until_peer_drains() {
        let mut net = reactor();
        let server = Rc::new(RefCell::new(None));
        let slot = Rc::clone(&server);
        net.listen(None, None, move |_: &mut Reactor, stream: StreamId| {
            *slot.borrow_mut() = Some(stream);
        })
        .unwrap();

        let client = net.connect_loopback().unwrap();
        let server = server.borrow().unwrap();

        net.enqueue(client, b"last words").unwrap();
        net.finish(client);
        assert!(net.is_closed(client));
        assert_eq!(net.stream_count(), 2);

        // The peer can no longer write to the finished side.
        net.enqueue(server, b"ignored").unwrap();

        pass(&mut net);
        assert_eq!(net.stream_count(), 2);

        assert_eq!(dequeue_all(&mut net, server), b"last words");
        pass(&mut net);
        pass(&mut net);
        assert_eq!(net.stream_count(), 0);
    }

    /// Records which callbacks ran, draining inbound on every data event.
    struct Recorder {
        log: Rc<RefCell<Vec<&'static str>>>,
        finish_on_data: bool,
    }

    impl StreamHandler for Recorder {
        fn on_data(&mut self, net: &mut Reactor, stream: StreamId) {
            self.log.borrow_mut().push("data");
            dequeue_all(net, stream);
            if self.finish_on_data {
                net.finish(stream);
            }
        }

        fn on_closed(&mut self, _: &mut Reactor, _: StreamId) {
            self.log.borrow_mut().push("closed");
        }

        fn on_released(&mut self, net: &mut Reactor, stream: StreamId) {
            assert!(net.is_closed(stream));
            self.log.borrow_mut().push("released");
        }
    }

    #[test]
    fn finished_stream_reports_release_after_flush() {
        let mut net = reactor();
        let server = Rc::new(RefCell::new(None));
        let slot = Rc::clone(&server);
        net.listen(None, None, move |_: &mut Reactor, stream: StreamId| {
            *slot.borrow_mut() = Some(stream);
        })
        .unwrap();

        let client = net.connect_loopback().unwrap();
        let server = server.borrow().unwrap();
        let log = Rc::new(RefCell::new(Vec::new()));
        net.register_handler(
            client,
            Recorder {
                log: Rc::clone(&log),
                finish_on_data: false,
            },
        );

        net.enqueue(client, b"flush me").unwrap();
        net.finish(client);
        pass(&mut net);
        assert!(log.borrow().is_empty());

        assert_eq!(dequeue_all(&mut net, server), b"flush me");
        pass(&mut net);
        assert_eq!(log.borrow().as_slice(), &["released"]);

        pass(&mut net);
        assert_eq!(log.borrow().len(), 1);
    }

    #[test]
    fn finishing_from_own_handler_reports_release() {
        let mut net = reactor();
        let log = Rc::new(RefCell::new(Vec::new()));
        let server_log = Rc::clone(&log);
        net.listen(None, None, move |net: &mut Reactor, stream: StreamId| {
            net.register_handler(
                stream,
                Recorder {
                    log: Rc::clone(&server_log),
                    finish_on_data: true,
                },
            );
        })
        .unwrap();

        let client = net.connect_loopback().unwrap();
        net.enqueue(client, b"one shot").unwrap();
        pass(&mut net);

        assert_eq!(log.borrow().as_slice(), &["data", "released"]);
        assert_eq!(net.stream_count(), 1);
    }

    #[test]
    fn freeing_reports_release_not_close() {
        let mut net = reactor();
        net.listen(None, None, |_: &mut Reactor, _: StreamId| {}).unwrap();

        let client = net.connect_loopback().unwrap();
        let log = Rc::new(RefCell::new(Vec::new()));
        net.register_handler(
            client,
            Recorder {
                log: Rc::clone(&log),
                finish_on_data: false,
            },
        );

        net.free(client);
        assert_eq!(log.borrow().as_slice(), &["released"]);
        pass(&mut net);
        assert_eq!(log.borrow().len(), 1);
    }

    #[test]
    fn handler_may_free_its_own_stream() {
        let mut net = reactor();
        net.listen(None, None, |net: &mut Reactor, stream: StreamId| {
            net.register_handler(stream, |net: &mut Reactor, stream: StreamId| {
                net.free(stream);
            });
        })
        .unwrap();

        let client = net.connect_loopback().unwrap();
        net.enqueue(client, b"bye").unwrap();
        pass(&mut net);
        pass(&mut net);

        assert!(net.is_closed(client));
        assert_eq!(net.stream_count(), 0);
    }

    #[test]
    fn backpressure_rejects_without_queueing() {
        let config = NetConfig {
            max_outbound_bytes: Some(8),
            ..Default::default()
        };
        let mut net = Reactor::new(config).unwrap();
        net.listen(None, None, |_: &mut Reactor, _: StreamId| {}).unwrap();

        let client = net.connect_loopback().unwrap();
        net.enqueue(client, b"12345").unwrap();
        let err = net.enqueue(client, b"6789").unwrap_err();
        assert!(matches!(err, NetError::Backpressure { queued: 5, limit: 8 }));
        assert_eq!(net.outbound_len(client), 5);
    }

    #[test]
    fn table_exhaustion_is_reported() {
        let config = NetConfig {
            max_streams: 3,
            ..Default::default()
        };
        let mut net = Reactor::new(config).unwrap();
        net.listen(None, None, |_: &mut Reactor, _: StreamId| {}).unwrap();

        net.connect_loopback().unwrap();
        let err = net.connect_loopback().unwrap_err();
        assert!(err.is_capacity());
        assert_eq!(net.stream_count(), 2);
    }

    #[test]
    fn stale_handles_are_inert() {
        let mut net = reactor();
        net.listen(None, None, |_: &mut Reactor, _: StreamId| {}).unwrap();

        let client = net.connect_loopback().unwrap();
        net.free(client);

        assert!(net.is_closed(client));
        assert_eq!(net.state(client), StreamState::Closed);
        assert_eq!(net.peer_address_string(client, true, false), "(error)");
        assert!(net.enqueue(client, b"x").is_ok());
        assert_eq!(net.dequeue(client, &mut [0u8; 4]), 0);
        net.finish(client);
        net.free(client);
    }

    #[test]
    fn second_listen_is_refused() {
        let mut net = reactor();
        net.listen(None, None, |_: &mut Reactor, _: StreamId| {}).unwrap();
        let err = net
            .listen(None, None, |_: &mut Reactor, _: StreamId| {})
            .unwrap_err();
        assert!(matches!(err, NetError::ServerAlreadyRunning));

        net.stop_listening();
        assert!(!net.is_listening());
        assert!(matches!(
            net.connect_loopback(),
            Err(NetError::NoServerRunning)
        ));
    }

    #[test]
    fn stream_listing_reports_loopback_rows() {
        let mut net = reactor();
        net.listen(None, None, |_: &mut Reactor, _: StreamId| {}).unwrap();
        let client = net.connect_loopback().unwrap();
        net.enqueue(client, b"abc").unwrap();

        let infos = net.stream_infos();
        assert_eq!(infos.len(), 2);
        assert!(infos.iter().all(|i| i.loopback && i.peer == "loopback connection"));
        assert_eq!(infos.iter().map(|i| i.inbound_len).sum::<usize>(), 3);
    }
}
