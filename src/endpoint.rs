//! # Wire Endpoints and Address Policy
//!
//! The endpoint value type shared by every bind implementation, plus the
//! address-family plumbing around it: dual-stack URL resolution and the
//! private/non-routable IP policy that gates endpoint admission and roaming.
//!
//! The private-IP decision is made purely from the address bytes — DNS never
//! participates — so the policy is total and cannot be confused by resolver
//! tricks. IPv4-mapped IPv6 addresses are unwrapped to their embedded IPv4
//! address before the check.

use std::net::{IpAddr, SocketAddr, ToSocketAddrs};

use tokio::net::lookup_host;
use tracing::trace;

// ----------------------------------------------------------------------------
// Errors
// ----------------------------------------------------------------------------

/// Failures of endpoint parsing and resolution.
#[derive(Debug)]
pub enum EndpointError {
    /// The string is not a `host:port` form we understand.
    Invalid(String),
    /// DNS yielded no usable address for the enabled families.
    Unresolvable(String),
    /// Resolver I/O failure.
    Io(std::io::Error),
}

impl std::fmt::Display for EndpointError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EndpointError::Invalid(s) => write!(f, "invalid endpoint {s:?}"),
            EndpointError::Unresolvable(s) => write!(f, "no usable address for {s:?}"),
            EndpointError::Io(e) => write!(f, "resolver error: {e}"),
        }
    }
}

impl std::error::Error for EndpointError {}

impl From<std::io::Error> for EndpointError {
    fn from(e: std::io::Error) -> Self {
        EndpointError::Io(e)
    }
}

// ----------------------------------------------------------------------------
// Endpoint
// ----------------------------------------------------------------------------

/// Destination of a wire packet, with the optional source address a UDP bind
/// learned from the kernel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Endpoint {
    dst: SocketAddr,
    src: Option<IpAddr>,
}

impl Endpoint {
    pub fn new(dst: SocketAddr) -> Self {
        Self { dst, src: None }
    }

    pub fn with_src(dst: SocketAddr, src: IpAddr) -> Self {
        Self { dst, src: Some(src) }
    }

    pub fn dst(&self) -> SocketAddr {
        self.dst
    }

    pub fn dst_ip(&self) -> IpAddr {
        self.dst.ip()
    }

    pub fn src_ip(&self) -> Option<IpAddr> {
        self.src
    }

    /// Forget the learned source address (forces the kernel to re-pick).
    pub fn clear_src(&mut self) {
        self.src = None;
    }

    /// Compact form used for session indexing: IP octets followed by the
    /// port in little-endian.
    pub fn dst_to_bytes(&self) -> Vec<u8> {
        let mut out = match self.dst.ip() {
            IpAddr::V4(ip) => ip.octets().to_vec(),
            IpAddr::V6(ip) => ip.octets().to_vec(),
        };
        out.extend_from_slice(&self.dst.port().to_le_bytes());
        out
    }
}

impl std::fmt::Display for Endpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // SocketAddr renders IPv6 with brackets, which is the canonical form.
        write!(f, "{}", self.dst)
    }
}

/// Parse `host:port`, resolving a hostname if needed.
pub fn parse_endpoint(s: &str) -> Result<Endpoint, EndpointError> {
    if let Ok(addr) = s.parse::<SocketAddr>() {
        return Ok(Endpoint::new(addr));
    }
    let mut addrs = s
        .to_socket_addrs()
        .map_err(|_| EndpointError::Invalid(s.to_string()))?;
    addrs
        .next()
        .map(Endpoint::new)
        .ok_or_else(|| EndpointError::Unresolvable(s.to_string()))
}

// ----------------------------------------------------------------------------
// Address families
// ----------------------------------------------------------------------------

/// Which address families a bind is willing to use.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EnabledAf {
    pub v4: bool,
    pub v6: bool,
}

impl EnabledAf {
    pub const BOTH: EnabledAf = EnabledAf { v4: true, v6: true };
    pub const V4_ONLY: EnabledAf = EnabledAf { v4: true, v6: false };
    pub const V6_ONLY: EnabledAf = EnabledAf { v4: false, v6: true };

    pub fn dual_stack(&self) -> bool {
        self.v4 && self.v6
    }
}

/// Result of resolving a connect URL, split by family.
#[derive(Debug, Clone, Copy, Default)]
pub struct Resolved {
    pub v4: Option<SocketAddr>,
    pub v6: Option<SocketAddr>,
}

impl Resolved {
    /// The family the send path should start with, honoring the preference
    /// when that family actually resolved.
    pub fn primary_af(&self, af_prefer: u8) -> u8 {
        match af_prefer {
            6 if self.v6.is_some() => 6,
            4 if self.v4.is_some() => 4,
            _ => {
                if self.v6.is_some() {
                    6
                } else {
                    4
                }
            }
        }
    }
}

/// Resolve a `host:port` URL into at most one address per enabled family.
///
/// Literal addresses never touch DNS. A URL that resolves to nothing usable
/// for the enabled families is an error, not an empty result.
pub async fn resolve_url(url: &str, af: EnabledAf) -> Result<Resolved, EndpointError> {
    if url.is_empty() {
        return Err(EndpointError::Invalid(url.to_string()));
    }

    let mut resolved = Resolved::default();

    // Fast path: a literal address needs no resolver round trip.
    if let Ok(addr) = url.parse::<SocketAddr>() {
        match addr {
            SocketAddr::V4(_) if af.v4 => resolved.v4 = Some(addr),
            SocketAddr::V6(_) if af.v6 => resolved.v6 = Some(addr),
            _ => return Err(EndpointError::Unresolvable(url.to_string())),
        }
        return Ok(resolved);
    }

    let addrs = lookup_host(url)
        .await
        .map_err(|_| EndpointError::Invalid(url.to_string()))?;
    for addr in addrs {
        match addr {
            SocketAddr::V4(_) if af.v4 && resolved.v4.is_none() => resolved.v4 = Some(addr),
            SocketAddr::V6(_) if af.v6 && resolved.v6.is_none() => resolved.v6 = Some(addr),
            _ => {}
        }
    }

    if resolved.v4.is_none() && resolved.v6.is_none() {
        trace!(url, "resolution yielded no address for the enabled families");
        return Err(EndpointError::Unresolvable(url.to_string()));
    }
    Ok(resolved)
}

// ----------------------------------------------------------------------------
// Private-IP policy
// ----------------------------------------------------------------------------

/// True for private, link-local, loopback, multicast, reserved, benchmark
/// and documentation ranges — everything that should never be a mesh
/// endpoint on the public internet.
///
/// IPv4-mapped IPv6 addresses are judged by their embedded IPv4 address.
pub fn is_private_ip(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => {
            let [a, b, c, _] = v4.octets();
            match a {
                0 => true,                         // 0.0.0.0/8 current network
                10 => true,                        // 10.0.0.0/8
                127 => true,                       // 127.0.0.0/8 loopback
                100 if (64..=127).contains(&b) => true, // 100.64.0.0/10 CGNAT
                169 if b == 254 => true,           // 169.254.0.0/16 link-local
                172 if (16..=31).contains(&b) => true, // 172.16.0.0/12
                192 if b == 168 => true,           // 192.168.0.0/16
                192 if b == 0 && c == 0 => true,   // 192.0.0.0/24 IETF protocol
                192 if b == 0 && c == 2 => true,   // 192.0.2.0/24 TEST-NET-1
                198 if b == 51 && c == 100 => true, // 198.51.100.0/24 TEST-NET-2
                203 if b == 0 && c == 113 => true, // 203.0.113.0/24 TEST-NET-3
                198 if b == 18 || b == 19 => true, // 198.18.0.0/15 benchmarking
                224..=239 => true,                 // 224.0.0.0/4 multicast
                240..=255 => true,                 // 240.0.0.0/4 reserved + broadcast
                _ => false,
            }
        }
        IpAddr::V6(v6) => {
            if let Some(mapped) = v6.to_ipv4_mapped() {
                return is_private_ip(IpAddr::V4(mapped));
            }
            let seg = v6.segments();
            v6.is_loopback()                       // ::1/128
                || v6.is_unspecified()             // ::/128
                || (seg[0] & 0xFFC0) == 0xFE80     // fe80::/10 link-local
                || (seg[0] & 0xFE00) == 0xFC00     // fc00::/7 ULA
                || (seg[0] & 0xFF00) == 0xFF00     // ff00::/8 multicast
                || (seg[0] == 0x2001 && seg[1] == 0x0DB8) // 2001:db8::/32 documentation
        }
    }
}

/// Complement of [`is_private_ip`] for routable addresses.
pub fn is_public_ip(ip: IpAddr) -> bool {
    !is_private_ip(ip)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{Ipv4Addr, Ipv6Addr};

    #[test]
    fn private_ip_table() {
        let cases: &[(&str, bool)] = &[
            // IPv4 private ranges
            ("10.0.0.1", true),
            ("172.16.0.1", true),
            ("172.31.255.255", true),
            ("192.168.1.1", true),
            ("127.0.0.1", true),
            ("169.254.1.1", true),
            ("100.64.0.1", true),
            ("224.0.0.1", true),
            ("240.0.0.1", true),
            ("255.255.255.255", true),
            ("0.0.0.0", true),
            ("192.0.0.1", true),
            ("192.0.2.1", true),
            ("198.51.100.1", true),
            ("203.0.113.1", true),
            ("198.18.0.1", true),
            ("198.19.255.1", true),
            // IPv4 public ranges
            ("8.8.8.8", false),
            ("1.1.1.1", false),
            ("172.15.0.1", false),
            ("172.32.0.1", false),
            ("192.167.1.1", false),
            ("192.169.1.1", false),
            ("100.63.0.1", false),
            ("100.128.0.1", false),
            ("198.20.0.1", false),
            // IPv6 private/special ranges
            ("::1", true),
            ("fe80::1", true),
            ("fc00::1", true),
            ("fd00::1", true),
            ("ff02::1", true),
            ("::", true),
            ("2001:db8::1", true),
            // IPv6 public ranges
            ("2001:4860:4860::8888", false),
            ("2606:4700:4700::1111", false),
        ];

        for (s, expected) in cases {
            let ip: IpAddr = s.parse().expect("test address parses");
            assert_eq!(is_private_ip(ip), *expected, "is_private_ip({s})");
            assert_eq!(is_public_ip(ip), !*expected, "is_public_ip({s})");
        }
    }

    #[test]
    fn mapped_v6_uses_embedded_v4() {
        let mapped: IpAddr = "::ffff:192.168.1.5".parse().unwrap();
        assert!(is_private_ip(mapped));
        let mapped: IpAddr = "::ffff:8.8.8.8".parse().unwrap();
        assert!(!is_private_ip(mapped));
    }

    #[test]
    fn dst_to_bytes_is_octets_then_le_port() {
        let ep = Endpoint::new(SocketAddr::new(
            IpAddr::V4(Ipv4Addr::new(1, 2, 3, 4)),
            0x1234,
        ));
        assert_eq!(ep.dst_to_bytes(), vec![1, 2, 3, 4, 0x34, 0x12]);

        let ep = Endpoint::new(SocketAddr::new(
            IpAddr::V6(Ipv6Addr::LOCALHOST),
            443,
        ));
        let bytes = ep.dst_to_bytes();
        assert_eq!(bytes.len(), 18);
        assert_eq!(&bytes[..16], &Ipv6Addr::LOCALHOST.octets());
        assert_eq!(&bytes[16..], &443u16.to_le_bytes());
    }

    #[test]
    fn display_brackets_ipv6() {
        let ep = parse_endpoint("[2001:db8::1]:3001").unwrap();
        assert_eq!(ep.to_string(), "[2001:db8::1]:3001");
        let ep = parse_endpoint("192.0.2.1:3001").unwrap();
        assert_eq!(ep.to_string(), "192.0.2.1:3001");
    }

    #[test]
    fn parse_rejects_garbage() {
        assert!(parse_endpoint("not an endpoint").is_err());
        assert!(parse_endpoint("").is_err());
    }

    #[tokio::test]
    async fn resolve_literal_addresses_without_dns() {
        let r = resolve_url("192.0.2.7:3001", EnabledAf::BOTH).await.unwrap();
        assert_eq!(r.v4.unwrap().to_string(), "192.0.2.7:3001");
        assert!(r.v6.is_none());
        assert_eq!(r.primary_af(6), 4);
        assert_eq!(r.primary_af(4), 4);

        let r = resolve_url("[2001:db8::1]:3001", EnabledAf::BOTH).await.unwrap();
        assert!(r.v4.is_none());
        assert_eq!(r.primary_af(4), 6);
    }

    #[tokio::test]
    async fn resolve_honors_enabled_families() {
        let err = resolve_url("192.0.2.7:3001", EnabledAf::V6_ONLY).await;
        assert!(err.is_err(), "v4 literal with v6-only must fail");
        let err = resolve_url("", EnabledAf::BOTH).await;
        assert!(err.is_err());
    }
}
