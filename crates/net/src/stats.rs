use crate::stream::StreamState;

#[derive(Debug, Clone, Default)]
pub struct NetworkStats {
    pub packets_sent: u64,
    pub packets_received: u64,
    pub packets_dropped: u64,
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub streams_opened: u64,
    pub streams_accepted: u64,
    pub streams_closed: u64,
    pub connections_rejected: u64,
}

impl NetworkStats {
    pub fn total_bytes(&self) -> u64 {
        self.bytes_sent + self.bytes_received
    }
}

/// One row of the open-stream listing.
#[derive(Debug, Clone)]
pub struct StreamInfo {
    pub index: usize,
    pub peer: String,
    pub state: StreamState,
    pub loopback: bool,
    pub closed: bool,
    pub finished: bool,
    pub inbound_len: usize,
    pub outbound_len: usize,
}
