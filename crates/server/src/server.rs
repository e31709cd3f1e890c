use std::cell::RefCell;
use std::collections::VecDeque;
use std::net::SocketAddr;
use std::rc::Rc;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use streamnet::{DatagramId, NetworkStats, Reactor, StreamHandler, StreamId, StreamInfo};

use crate::config::ServerConfig;
use crate::events::{CloseReason, ServerEvent};

pub const DISCOVERY_REQUEST: &[u8] = b"streamnet?";
const PROBE_PAYLOAD: &[u8] = b"loopback probe\n";
const SHUTDOWN_GRACE: Duration = Duration::from_secs(1);

type EventLog = Rc<RefCell<VecDeque<ServerEvent>>>;

#[derive(Debug, Clone)]
pub struct ServerStats {
    pub uptime_secs: u64,
    pub stream_count: usize,
    pub max_streams: usize,
    pub listen_addr: Option<SocketAddr>,
    pub network: NetworkStats,
}

/// Writes every inbound byte straight back to the sender.
struct EchoHandler {
    events: EventLog,
    buf: Vec<u8>,
}

impl EchoHandler {
    fn new(events: EventLog) -> Self {
        Self {
            events,
            buf: vec![0u8; streamnet::config::DEFAULT_READ_CHUNK],
        }
    }
}

impl StreamHandler for EchoHandler {
    fn on_data(&mut self, net: &mut Reactor, stream: StreamId) {
        loop {
            let n = net.dequeue(stream, &mut self.buf);
            if n == 0 {
                break;
            }

            if let Err(e) = net.enqueue(stream, &self.buf[..n]) {
                log::warn!("Dropping {}: {}", stream, e);
                self.events.borrow_mut().push_back(ServerEvent::StreamClosed {
                    stream: stream.index(),
                    reason: CloseReason::Backpressure,
                });
                net.free(stream);
                return;
            }
        }
    }

    fn on_closed(&mut self, net: &mut Reactor, stream: StreamId) {
        let unread = net.pending_length(stream);
        if unread > 0 {
            log::debug!("{} closed with {} unread bytes", stream, unread);
        }
        log::info!("{} closed by peer", stream);
        self.events.borrow_mut().push_back(ServerEvent::StreamClosed {
            stream: stream.index(),
            reason: CloseReason::Remote,
        });
    }
}

/// Client side of the loopback probe: waits for its payload to come back
/// and then finishes the stream.
struct ProbeHandler {
    events: EventLog,
    received: usize,
}

impl StreamHandler for ProbeHandler {
    fn on_data(&mut self, net: &mut Reactor, stream: StreamId) {
        let mut buf = [0u8; 256];
        loop {
            let n = net.dequeue(stream, &mut buf);
            if n == 0 {
                break;
            }
            self.received += n;
        }

        if self.received >= PROBE_PAYLOAD.len() {
            log::info!("Loopback probe echoed {} bytes", self.received);
            self.events.borrow_mut().push_back(ServerEvent::ProbeEchoed {
                bytes: self.received,
            });
            net.finish(stream);
        }
    }

    fn on_released(&mut self, _: &mut Reactor, stream: StreamId) {
        log::debug!("Loopback probe {} released", stream);
    }
}

pub struct EchoServer {
    net: Reactor,
    config: ServerConfig,
    discovery: Option<DatagramId>,
    events: EventLog,
    running: Arc<AtomicBool>,
    start_time: Instant,
}

impl EchoServer {
    pub fn new(bind: &str, port: u16, config: ServerConfig) -> streamnet::Result<Self> {
        let mut net = Reactor::new(config.net_config())?;
        let events: EventLog = Rc::default();

        let accepted = Rc::clone(&events);
        net.listen(
            Some(bind),
            Some(&port.to_string()),
            move |net: &mut Reactor, stream: StreamId| {
                let peer = net.peer_address_string(stream, true, true);
                log::info!("{} opened from {}", stream, peer);
                accepted.borrow_mut().push_back(ServerEvent::StreamOpened {
                    stream: stream.index(),
                    peer,
                });
                net.register_handler(stream, EchoHandler::new(Rc::clone(&accepted)));
            },
        )?;

        let discovery = match config.discovery_port {
            Some(port) => Some(bind_discovery(&mut net, bind, port, Rc::clone(&events))?),
            None => None,
        };

        Ok(Self {
            net,
            config,
            discovery,
            events,
            running: Arc::new(AtomicBool::new(true)),
            start_time: Instant::now(),
        })
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.net.listen_addr()
    }

    pub fn discovery_addr(&self) -> Option<SocketAddr> {
        self.discovery
            .and_then(|id| self.net.datagram_local_addr(id))
    }

    pub fn running(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.running)
    }

    pub fn drain_events(&mut self) -> Vec<ServerEvent> {
        self.events.borrow_mut().drain(..).collect()
    }

    pub fn run(&mut self) {
        while self.running.load(Ordering::SeqCst) {
            self.tick_once();
            // Nobody consumes events here; everything was already logged.
            self.events.borrow_mut().clear();
        }
        self.shutdown_connections();
    }

    pub fn tick_once(&mut self) {
        self.net.wait(Duration::from_millis(self.config.tick_ms));
    }

    /// Opens a loopback stream through the server and checks that the echo
    /// comes back.
    pub fn probe_loopback(&mut self) {
        let stream = match self.net.connect_loopback() {
            Ok(stream) => stream,
            Err(e) => {
                self.push_error(format!("Loopback probe failed: {}", e));
                return;
            }
        };

        self.net.register_handler(
            stream,
            ProbeHandler {
                events: Rc::clone(&self.events),
                received: 0,
            },
        );
        if let Err(e) = self.net.enqueue(stream, PROBE_PAYLOAD) {
            self.push_error(format!("Loopback probe failed: {}", e));
            self.net.free(stream);
        }
    }

    /// Broadcasts the server status on the discovery port.
    pub fn announce(&mut self) {
        let (Some(id), Some(port)) = (self.discovery, self.config.discovery_port) else {
            return;
        };
        let status = status_line(&self.net);
        self.net.datagram_broadcast(id, status.as_bytes(), port);
    }

    pub fn kick(&mut self, index: usize) {
        let Some(stream) = self
            .net
            .stream_ids()
            .into_iter()
            .find(|id| id.index() == index)
        else {
            return;
        };

        log::info!("Kicking {}", stream);
        self.net.free(stream);
        self.events.borrow_mut().push_back(ServerEvent::StreamClosed {
            stream: index,
            reason: CloseReason::Kicked,
        });
    }

    /// Finishes every stream and keeps servicing them until their output is
    /// flushed or the grace period runs out.
    pub fn shutdown_connections(&mut self) {
        for stream in self.net.stream_ids() {
            self.net.finish(stream);
        }

        let start = Instant::now();
        while self.net.stream_count() > 0 && start.elapsed() < SHUTDOWN_GRACE {
            self.tick_once();
        }
        for stream in self.net.stream_ids() {
            self.net.free(stream);
        }

        self.net.stop_listening();
        if let Some(id) = self.discovery.take() {
            self.net.datagram_close(id);
        }
    }

    pub fn stats(&self) -> ServerStats {
        ServerStats {
            uptime_secs: self.start_time.elapsed().as_secs(),
            stream_count: self.net.stream_count(),
            max_streams: self.net.config().max_streams,
            listen_addr: self.net.listen_addr(),
            network: self.net.stats().clone(),
        }
    }

    pub fn stream_infos(&self) -> Vec<StreamInfo> {
        self.net.stream_infos()
    }

    pub fn log_streams(&self) {
        self.net.log_streams();
    }

    fn push_error(&mut self, message: String) {
        log::warn!("{}", message);
        self.events
            .borrow_mut()
            .push_back(ServerEvent::Error { message });
    }
}

fn status_line(net: &Reactor) -> String {
    format!(
        "streamnet {}/{}",
        net.stream_count(),
        net.config().max_streams
    )
}

fn bind_discovery(
    net: &mut Reactor,
    bind: &str,
    port: u16,
    events: EventLog,
) -> streamnet::Result<DatagramId> {
    net.datagram_bind(
        Some(bind),
        &port.to_string(),
        move |net: &mut Reactor, socket: DatagramId, payload: &[u8], from: SocketAddr| {
            if payload != DISCOVERY_REQUEST {
                log::debug!("Ignoring {} byte datagram from {}", payload.len(), from);
                return;
            }

            log::debug!("Discovery request from {}", from);
            events
                .borrow_mut()
                .push_back(ServerEvent::DiscoveryPing { from });
            let status = status_line(net);
            net.datagram_send(socket, status.as_bytes(), from);
        },
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_server(discovery_port: Option<u16>) -> EchoServer {
        let config = ServerConfig {
            tick_ms: 5,
            discovery_port,
            ..Default::default()
        };
        EchoServer::new("127.0.0.1", 0, config).unwrap()
    }

    #[test]
    fn test_loopback_probe_round_trip() {
        let mut server = test_server(None);
        server.probe_loopback();
        assert_eq!(server.stats().stream_count, 2);

        let mut events = server.drain_events();
        for _ in 0..10 {
            server.tick_once();
            events.extend(server.drain_events());
        }

        assert!(matches!(events[0], ServerEvent::StreamOpened { .. }));
        assert!(events.iter().any(|e| matches!(
            e,
            ServerEvent::ProbeEchoed { bytes } if *bytes == PROBE_PAYLOAD.len()
        )));
        assert_eq!(server.stats().stream_count, 0);
    }

    #[test]
    fn test_kick_frees_stream() {
        let mut server = test_server(None);
        server.probe_loopback();

        let server_end = server
            .stream_infos()
            .iter()
            .map(|info| info.index)
            .max()
            .unwrap();
        server.kick(server_end);

        let events = server.drain_events();
        assert!(events.iter().any(|e| matches!(
            e,
            ServerEvent::StreamClosed { reason: CloseReason::Kicked, .. }
        )));
        assert_eq!(server.stats().stream_count, 1);
    }

    #[test]
    fn test_discovery_reply() {
        let mut server = test_server(Some(0));
        let target = server.discovery_addr().unwrap();

        let probe = std::net::UdpSocket::bind("127.0.0.1:0").unwrap();
        probe.set_read_timeout(Some(Duration::from_millis(20))).unwrap();
        probe.send_to(DISCOVERY_REQUEST, target).unwrap();

        let mut buf = [0u8; 64];
        let mut reply = None;
        for _ in 0..100 {
            server.tick_once();
            if let Ok((n, _)) = probe.recv_from(&mut buf) {
                reply = Some(buf[..n].to_vec());
                break;
            }
        }

        assert_eq!(reply.as_deref(), Some(&b"streamnet 0/63"[..]));
        let events = server.drain_events();
        assert!(events.iter().any(|e| matches!(e, ServerEvent::DiscoveryPing { .. })));
    }

    #[test]
    fn test_shutdown_releases_everything() {
        let mut server = test_server(Some(0));
        server.probe_loopback();
        server.shutdown_connections();

        let stats = server.stats();
        assert_eq!(stats.stream_count, 0);
        assert!(stats.listen_addr.is_none());
        assert!(server.discovery_addr().is_none());
    }
}
