//! Derives a peer's "nearness" key from connection metadata.
//!
//! Private addresses group by their /24 (three leading parts), public ones
//! by their /16 (two leading parts). Loopback counts as private so local
//! peers find each other.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

use tokio_tungstenite::tungstenite::http::HeaderMap;

/// Identity used for every loopback or private peer.
const LOOPBACK_IDENTITY: &str = "127.0.0.1";

/// Nearness key. Two peers are nearby only if their groups are equal.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct AddressGroup {
    pub private: bool,
    pub prefix: String,
}

/// Classified origin of a peer connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerAddress {
    /// Normalised address: loopback and private peers all report
    /// `127.0.0.1`.
    pub ip: String,
    pub private: bool,
    /// `None` when the address could not be parsed; such peers are never
    /// nearby anyone.
    pub group: Option<AddressGroup>,
}

impl PeerAddress {
    /// Classifies a connection from its upgrade headers and socket address.
    pub fn from_request(headers: &HeaderMap, remote: SocketAddr) -> Self {
        Self::classify(&client_ip(headers, remote))
    }

    /// Classifies a textual address.
    pub fn classify(raw: &str) -> Self {
        let trimmed = raw.trim();
        let stripped = trimmed
            .strip_prefix("::ffff:")
            .or_else(|| trimmed.strip_prefix("::FFFF:"))
            .unwrap_or(trimmed);

        let Ok(ip) = stripped.parse::<IpAddr>() else {
            return Self {
                ip: stripped.to_owned(),
                private: false,
                group: None,
            };
        };

        let (private, parts) = match ip {
            IpAddr::V4(v4) => (is_private_v4(v4), v4_parts(v4)),
            IpAddr::V6(v6) => match v6.to_ipv4_mapped() {
                Some(v4) => (is_private_v4(v4), v4_parts(v4)),
                None => (is_private_v6(v6), v6_parts(v6)),
            },
        };

        let take = if private { 3 } else { 2 };
        let sep = if parts.len() == 4 { "." } else { ":" };
        let prefix = parts[..take].join(sep);

        Self {
            ip: if private {
                LOOPBACK_IDENTITY.to_owned()
            } else {
                ip.to_string()
            },
            private,
            group: Some(AddressGroup { private, prefix }),
        }
    }

    /// Returns `true` if both peers share privateness and prefix.
    pub fn is_nearby(&self, other: &PeerAddress) -> bool {
        matches!((&self.group, &other.group), (Some(a), Some(b)) if a == b)
    }
}

/// Picks the client address: `cf-connecting-ip`, then the first
/// `x-forwarded-for` entry, then the socket address.
pub fn client_ip(headers: &HeaderMap, remote: SocketAddr) -> String {
    ["cf-connecting-ip", "x-forwarded-for"]
        .iter()
        .filter_map(|name| headers.get(*name))
        .filter_map(|value| value.to_str().ok())
        .filter_map(|value| value.split(',').next())
        .map(str::trim)
        .find(|value| !value.is_empty())
        .map(str::to_owned)
        .unwrap_or_else(|| remote.ip().to_string())
}

fn is_private_v4(ip: Ipv4Addr) -> bool {
    ip.is_loopback() || ip.is_private()
}

fn is_private_v6(ip: Ipv6Addr) -> bool {
    let first = ip.segments()[0];
    ip.is_loopback()
        // fc00::/7
        || first & 0xfe00 == 0xfc00
        // fe80::/10
        || first & 0xffc0 == 0xfe80
}

fn v4_parts(ip: Ipv4Addr) -> Vec<String> {
    if ip.is_loopback() {
        return LOOPBACK_IDENTITY.split('.').map(str::to_owned).collect();
    }
    ip.octets().iter().map(u8::to_string).collect()
}

fn v6_parts(ip: Ipv6Addr) -> Vec<String> {
    if ip.is_loopback() {
        return v4_parts(Ipv4Addr::LOCALHOST);
    }
    ip.segments().iter().map(|s| format!("{s:x}")).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_tungstenite::tungstenite::http::HeaderValue;

    fn remote(ip: &str) -> SocketAddr {
        SocketAddr::new(ip.parse().unwrap(), 40000)
    }

    #[test]
    fn same_lan_subnet_is_nearby() {
        let a = PeerAddress::classify("192.168.1.5");
        let b = PeerAddress::classify("192.168.1.9");
        assert!(a.private);
        assert_eq!(a.ip, "127.0.0.1");
        assert!(a.is_nearby(&b));
    }

    #[test]
    fn different_lan_subnet_is_not_nearby() {
        let a = PeerAddress::classify("192.168.1.5");
        let b = PeerAddress::classify("192.168.2.9");
        assert!(!a.is_nearby(&b));
    }

    #[test]
    fn public_groups_by_slash_16() {
        let a = PeerAddress::classify("45.250.48.206");
        let b = PeerAddress::classify("45.250.7.1");
        assert!(!a.private);
        assert_eq!(a.ip, "45.250.48.206");
        assert_eq!(a.group.as_ref().unwrap().prefix, "45.250");
        assert!(a.is_nearby(&b));
        assert!(!a.is_nearby(&PeerAddress::classify("45.251.48.206")));
    }

    #[test]
    fn public_never_matches_private() {
        // Same leading parts, different privateness.
        let private = PeerAddress::classify("10.0.0.1");
        let public = PeerAddress::classify("11.0.0.1");
        assert!(!private.is_nearby(&public));
        assert!(!public.is_nearby(&private));
    }

    #[test]
    fn private_ranges() {
        for ip in ["10.1.2.3", "172.16.0.1", "172.31.255.1", "192.168.0.1", "127.0.0.1"] {
            assert!(PeerAddress::classify(ip).private, "{ip}");
        }
        for ip in ["172.15.0.1", "172.32.0.1", "8.8.8.8"] {
            assert!(!PeerAddress::classify(ip).private, "{ip}");
        }
    }

    #[test]
    fn ipv6_private_ranges() {
        assert!(PeerAddress::classify("fd12:3456:789a::1").private);
        assert!(PeerAddress::classify("fc00::1").private);
        assert!(PeerAddress::classify("fe80::1").private);
        assert!(!PeerAddress::classify("2001:db8::1").private);
    }

    #[test]
    fn loopbacks_share_one_identity() {
        let v4 = PeerAddress::classify("127.0.0.1");
        let v6 = PeerAddress::classify("::1");
        assert_eq!(v4.ip, "127.0.0.1");
        assert_eq!(v6.ip, "127.0.0.1");
        assert!(v4.is_nearby(&v6));
    }

    #[test]
    fn mapped_ipv4_is_unwrapped() {
        let a = PeerAddress::classify("::ffff:192.168.1.5");
        assert!(a.private);
        assert!(a.is_nearby(&PeerAddress::classify("192.168.1.77")));
    }

    #[test]
    fn garbage_has_no_group() {
        let a = PeerAddress::classify("not-an-ip");
        assert!(a.group.is_none());
        assert!(!a.is_nearby(&a.clone()));
    }

    #[test]
    fn header_priority() {
        let mut headers = HeaderMap::new();
        assert_eq!(client_ip(&headers, remote("10.0.0.1")), "10.0.0.1");

        headers.insert("x-forwarded-for", HeaderValue::from_static("203.0.113.7, 10.0.0.2"));
        assert_eq!(client_ip(&headers, remote("10.0.0.1")), "203.0.113.7");

        headers.insert("cf-connecting-ip", HeaderValue::from_static("198.51.100.1"));
        assert_eq!(client_ip(&headers, remote("10.0.0.1")), "198.51.100.1");
    }

    #[test]
    fn from_request_classifies_header_address() {
        let mut headers = HeaderMap::new();
        headers.insert("x-forwarded-for", HeaderValue::from_static("192.168.4.20"));
        let addr = PeerAddress::from_request(&headers, remote("127.0.0.1"));
        assert_eq!(addr.group.unwrap().prefix, "192.168.4");
    }
}
