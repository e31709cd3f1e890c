use std::io;

pub type Result<T> = std::result::Result<T, NetError>;

#[derive(Debug, thiserror::Error)]
pub enum NetError {
    #[error("failed to resolve {host}:{service}: {source}")]
    Resolution {
        host: String,
        service: String,
        #[source]
        source: io::Error,
    },
    #[error("too many streams open")]
    TooManyStreams,
    #[error("too many datagram sockets open")]
    TooManyDatagramSockets,
    #[error("socket {op} failed: {source}")]
    Socket {
        op: &'static str,
        #[source]
        source: io::Error,
    },
    #[error("no server running")]
    NoServerRunning,
    #[error("server is already running")]
    ServerAlreadyRunning,
    #[error("outbound buffer full ({queued} bytes queued, limit {limit})")]
    Backpressure { queued: usize, limit: usize },
}

impl NetError {
    pub(crate) fn socket(op: &'static str, source: io::Error) -> Self {
        NetError::Socket { op, source }
    }

    /// True for errors caused by a fixed-capacity table being exhausted.
    pub fn is_capacity(&self) -> bool {
        matches!(
            self,
            NetError::TooManyStreams | NetError::TooManyDatagramSockets
        )
    }
}
