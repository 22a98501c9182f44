//! Client address resolution for rate-limit keys and access records.
//!
//! # Resolution Order
//!
//! 1. First entry of `X-Forwarded-For`, when the direct peer is a trusted
//!    proxy (or no trusted proxies are configured)
//! 2. The direct peer address from axum's `ConnectInfo`
//! 3. [`UNKNOWN_IP`]
//!
//! # Security Warning: IP Spoofing Risk
//!
//! With an empty `TRUSTED_PROXIES` list every `X-Forwarded-For` header is
//! believed, so a client talking to the gateway directly can pick its own
//! rate-limit bucket. In production, list the CIDRs of the load balancers in
//! front of the gateway; headers from any other peer are then ignored and
//! the peer address is used instead.
//!
//! All requests without an identifiable address share the `"unknown"` key.

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use axum::extract::ConnectInfo;
use axum::http::Request;
use tracing::{debug, warn};

/// Fallback value when no client address can be determined.
pub const UNKNOWN_IP: &str = "unknown";

/// Header carrying the original client address through proxies.
pub const FORWARDED_FOR_HEADER: &str = "x-forwarded-for";

// =============================================================================
// Trusted Proxy CIDR Matching
// =============================================================================

/// Parsed CIDR network range for trusted proxy validation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CidrRange {
    network: IpAddr,
    prefix_len: u8,
}

impl CidrRange {
    /// Parse CIDR notation ("10.0.0.0/8", "::1/128") or a bare address.
    ///
    /// Returns `None` if the format is invalid.
    pub fn parse(cidr: &str) -> Option<Self> {
        let cidr = cidr.trim();
        let (ip, prefix_len) = match cidr.split_once('/') {
            Some((ip, prefix)) => {
                let ip: IpAddr = ip.parse().ok()?;
                let prefix_len: u8 = prefix.parse().ok()?;
                (ip, prefix_len)
            }
            None => {
                let ip: IpAddr = cidr.parse().ok()?;
                (ip, max_prefix(&ip))
            }
        };

        if prefix_len > max_prefix(&ip) {
            return None;
        }

        Some(Self {
            network: ip,
            prefix_len,
        })
    }

    /// Check if an IP address is contained within this CIDR range.
    pub fn contains(&self, ip: &IpAddr) -> bool {
        match (&self.network, ip) {
            (IpAddr::V4(net), IpAddr::V4(addr)) => {
                let mask = if self.prefix_len == 0 {
                    0
                } else {
                    u32::MAX << (32 - self.prefix_len)
                };
                (u32::from(*net) & mask) == (u32::from(*addr) & mask)
            }
            (IpAddr::V6(net), IpAddr::V6(addr)) => {
                let mask = if self.prefix_len == 0 {
                    0
                } else {
                    u128::MAX << (128 - self.prefix_len)
                };
                (u128::from(*net) & mask) == (u128::from(*addr) & mask)
            }
            _ => false,
        }
    }
}

fn max_prefix(ip: &IpAddr) -> u8 {
    match ip {
        IpAddr::V4(_) => 32,
        IpAddr::V6(_) => 128,
    }
}

/// Proxies allowed to supply `X-Forwarded-For`.
#[derive(Debug, Clone, Default)]
pub struct TrustedProxyConfig {
    ranges: Vec<CidrRange>,
}

impl TrustedProxyConfig {
    /// Build from CIDR strings. Invalid entries are logged and skipped.
    pub fn new(cidrs: &[String]) -> Self {
        let ranges: Vec<CidrRange> = cidrs
            .iter()
            .filter_map(|cidr| {
                let parsed = CidrRange::parse(cidr);
                if parsed.is_none() {
                    warn!(cidr = %cidr, "Invalid CIDR range in TRUSTED_PROXIES, skipping");
                }
                parsed
            })
            .collect();

        if !ranges.is_empty() {
            debug!(count = ranges.len(), "Trusted proxy validation enabled");
        }

        Self { ranges }
    }

    pub fn is_enabled(&self) -> bool {
        !self.ranges.is_empty()
    }

    /// Whether `peer` may supply forwarded headers.
    ///
    /// Everything is trusted when no ranges are configured; an unknown peer
    /// is trusted only in that case.
    pub fn is_trusted(&self, peer: Option<IpAddr>) -> bool {
        if self.ranges.is_empty() {
            return true;
        }
        match peer {
            Some(ip) => self.ranges.iter().any(|range| range.contains(&ip)),
            None => false,
        }
    }
}

// =============================================================================
// Resolution
// =============================================================================

/// Resolves the client address of a request.
#[derive(Debug, Clone, Default)]
pub struct ClientIpResolver {
    trusted: Arc<TrustedProxyConfig>,
}

impl ClientIpResolver {
    pub fn new(trusted: TrustedProxyConfig) -> Self {
        Self {
            trusted: Arc::new(trusted),
        }
    }

    pub fn resolve<B>(&self, req: &Request<B>) -> String {
        let peer = req
            .extensions()
            .get::<ConnectInfo<SocketAddr>>()
            .map(|ConnectInfo(addr)| addr.ip());

        if let Some(forwarded) = forwarded_for(req) {
            if self.trusted.is_trusted(peer) {
                return forwarded.to_string();
            }
            debug!(peer = ?peer, "Ignoring X-Forwarded-For from untrusted peer");
        }

        peer.map_or_else(|| UNKNOWN_IP.to_string(), |ip| ip.to_string())
    }
}

/// First non-empty entry of `X-Forwarded-For`.
fn forwarded_for<B>(req: &Request<B>) -> Option<&str> {
    req.headers()
        .get(FORWARDED_FOR_HEADER)?
        .to_str()
        .ok()?
        .split(',')
        .next()
        .map(str::trim)
        .filter(|ip| !ip.is_empty())
}
