use std::net::SocketAddr;

#[derive(Debug, Clone)]
pub enum ServerEvent {
    StreamOpened {
        stream: usize,
        peer: String,
    },
    StreamClosed {
        stream: usize,
        reason: CloseReason,
    },
    DiscoveryPing {
        from: SocketAddr,
    },
    ProbeEchoed {
        bytes: usize,
    },
    Error {
        message: String,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    Remote,
    Kicked,
    Backpressure,
}

impl CloseReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            CloseReason::Remote => "closed by peer",
            CloseReason::Kicked => "kicked",
            CloseReason::Backpressure => "dropped, peer not reading",
        }
    }
}
