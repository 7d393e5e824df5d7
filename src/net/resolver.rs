//! Hostname resolution

use crate::{Error, Result};
use std::net::{IpAddr, ToSocketAddrs};
use tracing::debug;

/// Resolves a hostname to an ordered list of addresses
pub trait AddressResolver: Send + Sync {
    /// Resolve `host`; fails with [`Error::UnknownHost`] when nothing is found
    fn resolve(&self, host: &str) -> Result<Vec<IpAddr>>;
}

/// Resolver backed by the system's `getaddrinfo`
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemResolver;

impl AddressResolver for SystemResolver {
    fn resolve(&self, host: &str) -> Result<Vec<IpAddr>> {
        if let Some(ip) = parse_ip_literal(host) {
            return Ok(vec![ip]);
        }

        let addrs = (host, 0u16).to_socket_addrs().map_err(|e| Error::UnknownHost {
            host: host.to_string(),
            detail: e.to_string(),
        })?;

        let mut ips: Vec<IpAddr> = Vec::new();
        for addr in addrs {
            if !ips.contains(&addr.ip()) {
                ips.push(addr.ip());
            }
        }

        if ips.is_empty() {
            return Err(Error::UnknownHost {
                host: host.to_string(),
                detail: "no addresses found".to_string(),
            });
        }

        debug!(host, count = ips.len(), "resolved host");
        Ok(ips)
    }
}

/// Parse `host` as an IP literal, accepting bracketed IPv6 (`[::1]`)
pub fn parse_ip_literal(host: &str) -> Option<IpAddr> {
    let trimmed = host
        .strip_prefix('[')
        .and_then(|h| h.strip_suffix(']'))
        .unwrap_or(host);
    trimmed.parse().ok()
}
