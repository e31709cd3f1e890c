pub const DEFAULT_MAX_STREAMS: usize = 63;
pub const DEFAULT_MAX_DATAGRAM_SOCKETS: usize = 7;
pub const DEFAULT_READ_CHUNK: usize = 4096;
pub const DEFAULT_DATAGRAM_BUFFER: usize = 1200;

#[derive(Debug, Clone)]
pub struct NetConfig {
    pub max_streams: usize,
    pub max_datagram_sockets: usize,
    /// Bytes moved per socket read or write call.
    pub read_chunk: usize,
    /// Largest datagram payload delivered to a receive handler; longer packets are truncated.
    pub datagram_buffer_size: usize,
    /// Only resolve to IPv4 addresses.
    pub ipv4_only: bool,
    /// Cap on bytes queued in a stream's outbound buffer. `None` leaves it unbounded.
    pub max_outbound_bytes: Option<usize>,
    pub events_capacity: usize,
}

impl Default for NetConfig {
    fn default() -> Self {
        Self {
            max_streams: DEFAULT_MAX_STREAMS,
            max_datagram_sockets: DEFAULT_MAX_DATAGRAM_SOCKETS,
            read_chunk: DEFAULT_READ_CHUNK,
            datagram_buffer_size: DEFAULT_DATAGRAM_BUFFER,
            ipv4_only: true,
            max_outbound_bytes: None,
            events_capacity: 256,
        }
    }
}
