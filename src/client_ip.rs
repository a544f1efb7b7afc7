use axum::http::{HeaderMap, HeaderName};
use std::borrow::Cow;
use std::fmt;
use std::net::IpAddr;

// Longest raw header value we are willing to look at
const MAX_HEADER_LEN: usize = 256;
// Longest textual IPv6 address (IPv4-mapped form)
const MAX_IP_LEN: usize = 45;

pub const UNKNOWN_BUCKET: &str = "unknown";

pub const DEFAULT_IP_HEADERS: &[&str] = &["cf-connecting-ip", "x-real-ip", "x-forwarded-for"];

// Who a request is counted against
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientKey {
    Ip(IpAddr),
    Unknown,
}

impl ClientKey {
    // Key used in the rate table
    pub fn bucket(&self) -> Cow<'static, str> {
        match self {
            ClientKey::Ip(ip) => Cow::Owned(ip.to_string()),
            ClientKey::Unknown => Cow::Borrowed(UNKNOWN_BUCKET),
        }
    }

    pub fn ip(&self) -> Option<IpAddr> {
        match self {
            ClientKey::Ip(ip) => Some(*ip),
            ClientKey::Unknown => None,
        }
    }
}

impl fmt::Display for ClientKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.bucket())
    }
}

// Per-window limits for identified clients and the shared fallback bucket
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimits {
    pub identified: u32,
    pub unknown: u32,
}

impl Default for RateLimits {
    fn default() -> Self {
        Self {
            identified: 60,
            unknown: 10,
        }
    }
}

impl RateLimits {
    pub fn limit_for(&self, key: &ClientKey) -> u32 {
        match key {
            ClientKey::Ip(_) => self.identified,
            ClientKey::Unknown => self.unknown,
        }
    }
}

/// Resolves the client address a request should be rate limited under.
///
/// Forwarding headers are only believed when `trust_proxy` is set; otherwise
/// anyone could pick their own bucket. Header values are length-bounded and
/// must parse as an IP address, so arbitrary strings never become rate keys.
#[derive(Debug, Clone)]
pub struct ClientIpResolver {
    trust_proxy: bool,
    headers: Vec<HeaderName>,
}

impl Default for ClientIpResolver {
    fn default() -> Self {
        Self {
            trust_proxy: false,
            headers: DEFAULT_IP_HEADERS
                .iter()
                .map(|h| HeaderName::from_static(*h))
                .collect(),
        }
    }
}

impl ClientIpResolver {
    pub fn new(trust_proxy: bool, headers: Vec<HeaderName>) -> Self {
        Self {
            trust_proxy,
            headers,
        }
    }

    pub fn trust_proxy(&self) -> bool {
        self.trust_proxy
    }

    pub fn resolve(&self, headers: &HeaderMap, peer: Option<IpAddr>) -> ClientKey {
        let ip = if self.trust_proxy {
            self.headers
                .iter()
                .find_map(|name| headers.get(name).and_then(|v| v.to_str().ok()).and_then(first_valid_ip))
        } else {
            peer
        };

        match ip {
            Some(ip) => ClientKey::Ip(canonical(ip)),
            None => ClientKey::Unknown,
        }
    }
}

// First element of a (possibly comma-separated) header value
fn first_valid_ip(raw: &str) -> Option<IpAddr> {
    if raw.len() > MAX_HEADER_LEN {
        return None;
    }
    let candidate = raw.split(',').next()?.trim();
    if candidate.is_empty() || candidate.len() > MAX_IP_LEN {
        return None;
    }
    candidate.parse().ok()
}

fn canonical(ip: IpAddr) -> IpAddr {
    match ip {
        IpAddr::V6(v6) => v6.to_ipv4_mapped().map(IpAddr::V4).unwrap_or(ip),
        v4 => v4,
    }
}
