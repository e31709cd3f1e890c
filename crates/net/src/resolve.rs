use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr, ToSocketAddrs};

use crate::error::{NetError, Result};

fn parse_service(service: &str) -> io::Result<u16> {
    service.trim().parse::<u16>().map_err(|e| {
        io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("invalid service '{}': {}", service, e),
        )
    })
}

fn resolution_error(host: &str, service: &str, source: io::Error) -> NetError {
    log::warn!("Failed to resolve host {}:{}: {}", host, service, source);
    NetError::Resolution {
        host: host.to_string(),
        service: service.to_string(),
        source,
    }
}

/// Resolves `host:service` to the first usable address.
pub fn resolve(host: &str, service: &str, ipv4_only: bool) -> Result<SocketAddr> {
    let port = parse_service(service).map_err(|e| resolution_error(host, service, e))?;

    let mut addrs = (host, port)
        .to_socket_addrs()
        .map_err(|e| resolution_error(host, service, e))?;

    addrs
        .find(|addr| !ipv4_only || addr.is_ipv4())
        .ok_or_else(|| {
            resolution_error(
                host,
                service,
                io::Error::new(io::ErrorKind::AddrNotAvailable, "no usable address"),
            )
        })
}

/// Resolves a local address to bind to. Without a host this is the
/// unspecified address of the configured family.
pub fn resolve_passive(host: Option<&str>, service: &str, ipv4_only: bool) -> Result<SocketAddr> {
    match host {
        Some(host) => resolve(host, service, ipv4_only),
        None => {
            let port = parse_service(service).map_err(|e| resolution_error("*", service, e))?;
            let ip = if ipv4_only {
                IpAddr::V4(Ipv4Addr::UNSPECIFIED)
            } else {
                IpAddr::V6(Ipv6Addr::UNSPECIFIED)
            };
            Ok(SocketAddr::new(ip, port))
        }
    }
}

/// First IPv4 address of `node` in dotted form.
pub fn resolve_node(node: &str) -> Option<String> {
    (node, 0)
        .to_socket_addrs()
        .ok()?
        .find(|addr| addr.is_ipv4())
        .map(|addr| addr.ip().to_string())
}

/// Numeric `(node, service)` strings for an address.
pub fn sockaddr_to_strings(addr: &SocketAddr) -> (String, String) {
    (addr.ip().to_string(), addr.port().to_string())
}
