//! Peer addresses and their wire encoding.
//!
//! ## Wire format
//!
//! ```text
//! +----------------+-------+----------+----------+---------------------+
//! | id (20 bytes)  | flags | tcp (BE) | udp (BE) | ip (4 or 16 bytes)  |
//! +----------------+-------+----------+----------+---------------------+
//! ```
//!
//! Flag bits: `0x01` IPv6, `0x02` firewalled UDP, `0x04` firewalled TCP.
//! A full record is 29 bytes for IPv4 and 41 bytes for IPv6.

use std::cmp::Ordering;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

use serde::{Deserialize, Serialize};

use crate::{Id, Result, TypesError};

const FLAG_NET6: u8 = 0x01;
const FLAG_FIREWALLED_UDP: u8 = 0x02;
const FLAG_FIREWALLED_TCP: u8 = 0x04;

/// Socket part of an IPv4 record: flags + two ports + 4 address bytes.
pub const SOCKET_SIZE_IPV4: usize = 1 + 4 + 4;
/// Socket part of an IPv6 record: flags + two ports + 16 address bytes.
pub const SOCKET_SIZE_IPV6: usize = 1 + 4 + 16;
/// Full IPv4 record including the identifier.
pub const SIZE_IPV4: usize = SOCKET_SIZE_IPV4 + Id::BYTES;
/// Full IPv6 record including the identifier.
pub const SIZE_IPV6: usize = SOCKET_SIZE_IPV6 + Id::BYTES;

/// An immutable peer record.
///
/// Equality, hashing and ordering only look at the identifier: two records
/// with the same id but different endpoints describe the same peer at a new
/// address.
#[derive(Clone, Serialize, Deserialize)]
pub struct PeerAddress {
    id: Id,
    ip: IpAddr,
    tcp_port: u16,
    udp_port: u16,
    firewalled_udp: bool,
    firewalled_tcp: bool,
}

impl PeerAddress {
    /// Create a reachable peer address.
    pub fn new(id: Id, ip: IpAddr, tcp_port: u16, udp_port: u16) -> Self {
        Self {
            id,
            ip,
            tcp_port,
            udp_port,
            firewalled_udp: false,
            firewalled_tcp: false,
        }
    }

    /// Create a peer address using the same port for TCP and UDP.
    pub fn from_socket(id: Id, socket: SocketAddr) -> Self {
        Self::new(id, socket.ip(), socket.port(), socket.port())
    }

    /// A placeholder address on the IPv4 unspecified address; used for peers
    /// only known by identifier.
    pub fn from_id(id: Id) -> Self {
        Self::new(id, IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0, 0)
    }

    pub fn id(&self) -> Id {
        self.id
    }

    pub fn ip(&self) -> IpAddr {
        self.ip
    }

    pub fn tcp_port(&self) -> u16 {
        self.tcp_port
    }

    pub fn udp_port(&self) -> u16 {
        self.udp_port
    }

    pub fn is_ipv6(&self) -> bool {
        self.ip.is_ipv6()
    }

    pub fn is_firewalled_udp(&self) -> bool {
        self.firewalled_udp
    }

    pub fn is_firewalled_tcp(&self) -> bool {
        self.firewalled_tcp
    }

    pub fn tcp_socket(&self) -> SocketAddr {
        SocketAddr::new(self.ip, self.tcp_port)
    }

    pub fn udp_socket(&self) -> SocketAddr {
        SocketAddr::new(self.ip, self.udp_port)
    }

    /// Same peer on a different IP.
    pub fn with_ip(&self, ip: IpAddr) -> Self {
        Self { ip, ..self.clone() }
    }

    /// Same peer on different ports.
    pub fn with_ports(&self, tcp_port: u16, udp_port: u16) -> Self {
        Self {
            tcp_port,
            udp_port,
            ..self.clone()
        }
    }

    pub fn with_firewalled_tcp(&self, firewalled: bool) -> Self {
        Self {
            firewalled_tcp: firewalled,
            ..self.clone()
        }
    }

    pub fn with_firewalled_udp(&self, firewalled: bool) -> Self {
        Self {
            firewalled_udp: firewalled,
            ..self.clone()
        }
    }

    /// Same endpoint under another identifier.
    pub fn with_id(&self, id: Id) -> Self {
        Self { id, ..self.clone() }
    }

    /// Whether the endpoint, ports and flags all match `other`. Unlike `==`
    /// this compares more than the identifier.
    pub fn same_endpoint(&self, other: &PeerAddress) -> bool {
        self.ip == other.ip
            && self.tcp_port == other.tcp_port
            && self.udp_port == other.udp_port
            && self.firewalled_tcp == other.firewalled_tcp
            && self.firewalled_udp == other.firewalled_udp
    }

    /// The flag byte.
    pub fn options(&self) -> u8 {
        let mut flags = 0u8;
        if self.is_ipv6() {
            flags |= FLAG_NET6;
        }
        if self.firewalled_udp {
            flags |= FLAG_FIREWALLED_UDP;
        }
        if self.firewalled_tcp {
            flags |= FLAG_FIREWALLED_TCP;
        }
        flags
    }

    /// Full record length announced by a flag byte.
    pub fn expected_len(flags: u8) -> usize {
        if flags & FLAG_NET6 != 0 {
            SIZE_IPV6
        } else {
            SIZE_IPV4
        }
    }

    /// Socket-part length announced by a flag byte.
    pub fn expected_socket_len(flags: u8) -> usize {
        if flags & FLAG_NET6 != 0 {
            SOCKET_SIZE_IPV6
        } else {
            SOCKET_SIZE_IPV4
        }
    }

    /// Length of this record when encoded.
    pub fn encoded_len(&self) -> usize {
        Self::expected_len(self.options())
    }

    /// Encode the full record (identifier first).
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.encoded_len());
        out.extend_from_slice(self.id.as_bytes());
        self.write_socket(&mut out);
        out
    }

    /// Encode only flags, ports and IP.
    pub fn encode_socket(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(Self::expected_socket_len(self.options()));
        self.write_socket(&mut out);
        out
    }

    fn write_socket(&self, out: &mut Vec<u8>) {
        out.push(self.options());
        out.extend_from_slice(&self.tcp_port.to_be_bytes());
        out.extend_from_slice(&self.udp_port.to_be_bytes());
        match self.ip {
            IpAddr::V4(v4) => out.extend_from_slice(&v4.octets()),
            IpAddr::V6(v6) => out.extend_from_slice(&v6.octets()),
        }
    }

    /// Decode a full record from the start of `buf`.
    ///
    /// Returns the address and the number of bytes consumed.
    pub fn decode(buf: &[u8]) -> Result<(PeerAddress, usize)> {
        if buf.len() < Id::BYTES + 1 {
            return Err(TypesError::TruncatedAddress {
                needed: SIZE_IPV4,
                got: buf.len(),
            });
        }
        let id = Id::from_slice(&buf[..Id::BYTES])?;
        let (address, consumed) = Self::decode_socket(id, &buf[Id::BYTES..])?;
        Ok((address, consumed + Id::BYTES))
    }

    /// Decode the socket part for a known identifier.
    pub fn decode_socket(id: Id, buf: &[u8]) -> Result<(PeerAddress, usize)> {
        let flags = *buf.first().ok_or(TypesError::TruncatedAddress {
            needed: SOCKET_SIZE_IPV4,
            got: 0,
        })?;
        let needed = Self::expected_socket_len(flags);
        if buf.len() < needed {
            return Err(TypesError::TruncatedAddress {
                needed,
                got: buf.len(),
            });
        }
        let tcp_port = u16::from_be_bytes([buf[1], buf[2]]);
        let udp_port = u16::from_be_bytes([buf[3], buf[4]]);
        let ip = if flags & FLAG_NET6 != 0 {
            let mut octets = [0u8; 16];
            octets.copy_from_slice(&buf[5..21]);
            IpAddr::V6(Ipv6Addr::from(octets))
        } else {
            IpAddr::V4(Ipv4Addr::new(buf[5], buf[6], buf[7], buf[8]))
        };
        let address = PeerAddress {
            id,
            ip,
            tcp_port,
            udp_port,
            firewalled_udp: flags & FLAG_FIREWALLED_UDP != 0,
            firewalled_tcp: flags & FLAG_FIREWALLED_TCP != 0,
        };
        Ok((address, needed))
    }
}

impl PartialEq for PeerAddress {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for PeerAddress {}

impl Hash for PeerAddress {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

impl PartialOrd for PeerAddress {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for PeerAddress {
    fn cmp(&self, other: &Self) -> Ordering {
        self.id.cmp(&other.id)
    }
}

impl fmt::Display for PeerAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "PeerAddr[{},tcp:{},udp:{},ID:{}]",
            self.ip, self.tcp_port, self.udp_port, self.id
        )
    }
}

impl fmt::Debug for PeerAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use super::*;

    fn v4_peer() -> PeerAddress {
        PeerAddress::new(
            Id::from_u64(0xbeef),
            IpAddr::V4(Ipv4Addr::new(192, 168, 1, 20)),
            4000,
            4001,
        )
    }

    #[test]
    fn test_equality_by_id_only() {
        let a = v4_peer();
        let b = a.with_ports(5000, 5001).with_firewalled_tcp(true);
        assert_eq!(a, b);
        assert!(!a.same_endpoint(&b));

        let mut set = HashSet::new();
        set.insert(a.clone());
        assert!(!set.insert(b));
        assert_ne!(a, a.with_id(Id::from_u64(1)));
    }

    #[test]
    fn test_encode_ipv4_layout() {
        let peer = v4_peer().with_firewalled_udp(true);
        let bytes = peer.encode();
        assert_eq!(bytes.len(), SIZE_IPV4);
        assert_eq!(bytes.len(), 29);
        assert_eq!(&bytes[..20], peer.id().as_bytes());
        assert_eq!(bytes[20], FLAG_FIREWALLED_UDP);
        assert_eq!(&bytes[21..23], &4000u16.to_be_bytes());
        assert_eq!(&bytes[23..25], &4001u16.to_be_bytes());
        assert_eq!(&bytes[25..29], &[192, 168, 1, 20]);
    }

    #[test]
    fn test_decode_ipv6_with_flags() {
        let peer = PeerAddress::new(Id::from_u64(7), IpAddr::V6(Ipv6Addr::LOCALHOST), 1, 2)
            .with_firewalled_tcp(true);
        let bytes = peer.encode();
        assert_eq!(bytes.len(), 41);
        assert_eq!(bytes[20], FLAG_NET6 | FLAG_FIREWALLED_TCP);

        let (decoded, consumed) = PeerAddress::decode(&bytes).expect("decode");
        assert_eq!(consumed, 41);
        assert!(decoded.same_endpoint(&peer));
        assert!(decoded.is_firewalled_tcp());
        assert!(!decoded.is_firewalled_udp());
    }

    #[test]
    fn test_decode_reports_consumed_with_trailing_bytes() {
        let mut bytes = v4_peer().encode();
        bytes.extend_from_slice(&[0xAA, 0xBB]);
        let (_, consumed) = PeerAddress::decode(&bytes).expect("decode");
        assert_eq!(consumed, 29);
    }

    #[test]
    fn test_decode_truncated() {
        let bytes = v4_peer().encode();
        assert!(matches!(
            PeerAddress::decode(&bytes[..10]),
            Err(TypesError::TruncatedAddress { .. })
        ));
        assert_eq!(
            PeerAddress::decode(&bytes[..25]),
            Err(TypesError::TruncatedAddress { needed: 9, got: 5 })
        );

        let mut v6_header = bytes[..21].to_vec();
        v6_header[20] = FLAG_NET6;
        v6_header.extend_from_slice(&[0u8; 8]);
        assert!(PeerAddress::decode(&v6_header).is_err());
    }

    #[test]
    fn test_expected_lengths() {
        assert_eq!(PeerAddress::expected_len(0), 29);
        assert_eq!(PeerAddress::expected_len(FLAG_NET6), 41);
        assert_eq!(PeerAddress::expected_socket_len(FLAG_FIREWALLED_TCP), 9);
        assert_eq!(v4_peer().encode_socket().len(), 9);
    }
}
