use streamnet::NetConfig;

pub const DEFAULT_PORT: u16 = 27910;
pub const DEFAULT_DISCOVERY_PORT: u16 = 27911;

#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Upper bound on how long one pass may block.
    pub tick_ms: u64,
    pub max_streams: usize,
    pub max_outbound_bytes: Option<usize>,
    pub ipv4_only: bool,
    pub discovery_port: Option<u16>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            tick_ms: 10,
            max_streams: streamnet::config::DEFAULT_MAX_STREAMS,
            max_outbound_bytes: Some(1024 * 1024),
            ipv4_only: true,
            discovery_port: Some(DEFAULT_DISCOVERY_PORT),
        }
    }
}

impl ServerConfig {
    pub fn net_config(&self) -> NetConfig {
        NetConfig {
            max_streams: self.max_streams,
            max_outbound_bytes: self.max_outbound_bytes,
            ipv4_only: self.ipv4_only,
            ..Default::default()
        }
    }
}
