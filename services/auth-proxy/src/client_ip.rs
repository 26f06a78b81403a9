//! Client address resolution behind forwarding proxies.
//!
//! A forwarded-address claim is only honoured when the directly connected
//! peer sits inside one of the trusted subnets (or when no subnets are
//! configured at all). The first public address in the claim wins; the
//! transport port is always kept.

use std::net::{IpAddr, Ipv6Addr, SocketAddr};

use http::HeaderMap;
use ipnet::IpNet;
use tracing::debug;

pub const X_FORWARDED_FOR: &str = "x-forwarded-for";

#[derive(Debug, Clone, Default)]
pub struct ClientIpResolver {
    trusted: Vec<IpNet>,
}

impl ClientIpResolver {
    pub fn new(trusted: Vec<IpNet>) -> Self {
        Self { trusted }
    }

    /// An empty trusted set trusts every peer.
    pub fn is_trusted(&self, peer: IpAddr) -> bool {
        if self.trusted.is_empty() {
            return true;
        }
        let peer = normalize_ip(peer);
        self.trusted.iter().any(|net| net.contains(&peer))
    }

    /// Resolve the address used for logging and authorization decisions.
    pub fn resolve(&self, peer: SocketAddr, headers: &HeaderMap) -> SocketAddr {
        if !self.is_trusted(peer.ip()) {
            debug!(peer = %peer, "peer not trusted, ignoring forwarded address");
            return peer;
        }

        let Some(forwarded) = forwarded_for(headers) else {
            return peer;
        };

        match first_public_address(&forwarded) {
            Some(ip) => SocketAddr::new(ip, peer.port()),
            None => peer,
        }
    }
}

/// The forwarded-address chain with the direct peer's own entries removed.
///
/// Used for audit annotation only, so it ignores the trusted-subnet check.
/// Returns an empty string when nothing remains.
pub fn forwarded_by(peer: SocketAddr, headers: &HeaderMap) -> String {
    let Some(forwarded) = forwarded_for(headers) else {
        return String::new();
    };

    let peer_ip = normalize_ip(peer.ip());
    forwarded
        .split(',')
        .map(str::trim)
        .filter(|entry| !entry.is_empty())
        .filter(|entry| match entry.parse::<IpAddr>() {
            Ok(ip) => normalize_ip(ip) != peer_ip,
            Err(_) => *entry != peer_ip.to_string(),
        })
        .collect::<Vec<_>>()
        .join(", ")
}

/// All `X-Forwarded-For` values joined in arrival order.
fn forwarded_for(headers: &HeaderMap) -> Option<String> {
    let values: Vec<&str> = headers
        .get_all(X_FORWARDED_FOR)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .collect();

    if values.is_empty() {
        None
    } else {
        Some(values.join(","))
    }
}

fn first_public_address(forwarded: &str) -> Option<IpAddr> {
    forwarded
        .split(',')
        .map(str::trim)
        .filter_map(|entry| entry.parse::<IpAddr>().ok())
        .map(normalize_ip)
        .find(|ip| !is_private(*ip))
}

/// Private, loopback, or link-local.
pub fn is_private(ip: IpAddr) -> bool {
    match normalize_ip(ip) {
        IpAddr::V4(v4) => v4.is_private() || v4.is_loopback() || v4.is_link_local(),
        IpAddr::V6(v6) => v6.is_loopback() || is_unique_local(&v6) || is_link_local_v6(&v6),
    }
}

// fc00::/7
fn is_unique_local(ip: &Ipv6Addr) -> bool {
    (ip.segments()[0] & 0xfe00) == 0xfc00
}

// fe80::/10
fn is_link_local_v6(ip: &Ipv6Addr) -> bool {
    (ip.segments()[0] & 0xffc0) == 0xfe80
}

/// IPv4-mapped IPv6 addresses are compared as IPv4.
fn normalize_ip(ip: IpAddr) -> IpAddr {
    match ip {
        IpAddr::V6(v6) => v6.to_ipv4_mapped().map_or(IpAddr::V6(v6), IpAddr::V4),
        IpAddr::V4(_) => ip,
    }
}
