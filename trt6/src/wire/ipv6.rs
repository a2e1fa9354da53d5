//! IPv6 base header and addressing.
use core::fmt;
use core::str::FromStr;
use byteorder::{ByteOrder, NetworkEndian};

use super::{Error, Result};

/// Length of the fixed IPv6 base header.
pub const HEADER_LEN: usize = 40;

/// Minimum MTU required of all links supporting IPv6. See [RFC 8200 § 5].
///
/// [RFC 8200 § 5]: https://tools.ietf.org/html/rfc8200#section-5
pub const MIN_MTU: usize = 1280;

/// A sixteen-octet IPv6 address.
#[derive(Debug, Hash, PartialEq, Eq, PartialOrd, Ord, Clone, Copy, Default)]
pub struct Address(pub [u8; 16]);

impl Address {
    /// The [unspecified address].
    ///
    /// [unspecified address]: https://tools.ietf.org/html/rfc4291#section-2.5.2
    pub const UNSPECIFIED: Address = Address([0x00; 16]);

    /// Construct an IPv6 address from a sequence of octets, in big-endian.
    ///
    /// # Panics
    /// The function panics if `data` is not sixteen octets long.
    pub fn from_bytes(data: &[u8]) -> Address {
        let mut bytes = [0; 16];
        bytes.copy_from_slice(data);
        Address(bytes)
    }

    /// Return the address octets.
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// Query whether this is the unspecified address.
    pub fn is_unspecified(&self) -> bool {
        self.0 == [0x00; 16]
    }

    /// The IPv4 address occupying the last four octets.
    ///
    /// A translation prefix carries the real destination in the low bits of
    /// the IPv6 destination address; this recovers it.
    pub fn trailing_ipv4(&self) -> [u8; 4] {
        let mut addr = [0; 4];
        addr.copy_from_slice(&self.0[12..16]);
        addr
    }
}

impl From<std::net::Ipv6Addr> for Address {
    fn from(addr: std::net::Ipv6Addr) -> Address {
        Address(addr.octets())
    }
}

impl From<Address> for std::net::Ipv6Addr {
    fn from(addr: Address) -> std::net::Ipv6Addr {
        addr.0.into()
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        std::net::Ipv6Addr::from(*self).fmt(f)
    }
}

impl FromStr for Address {
    type Err = std::net::AddrParseError;

    fn from_str(s: &str) -> core::result::Result<Self, Self::Err> {
        std::net::Ipv6Addr::from_str(s).map(Into::into)
    }
}

/// An IPv6 address prefix.
#[derive(Debug, Hash, PartialEq, Eq, Clone, Copy)]
pub struct Cidr {
    address: Address,
    prefix_len: u8,
}

impl Cidr {
    /// Create a prefix from an address and a prefix length.
    ///
    /// # Panics
    /// The function panics if the length is larger than 128.
    pub fn new(address: Address, prefix_len: u8) -> Cidr {
        assert!(prefix_len <= 128);
        Cidr { address, prefix_len }
    }

    /// The base address of the prefix.
    pub fn address(&self) -> Address {
        self.address
    }

    /// The number of prefix bits.
    pub fn prefix_len(&self) -> u8 {
        self.prefix_len
    }

    /// Whether the prefix covers the given address.
    pub fn contains(&self, addr: &Address) -> bool {
        let whole = usize::from(self.prefix_len / 8);
        let rest = self.prefix_len % 8;

        if self.address.0[..whole] != addr.0[..whole] {
            return false;
        }
        if rest == 0 {
            return true;
        }
        let mask = !(0xffu8 >> rest);
        self.address.0[whole] & mask == addr.0[whole] & mask
    }
}

impl fmt::Display for Cidr {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}/{}", self.address, self.prefix_len)
    }
}

impl FromStr for Cidr {
    type Err = Error;

    fn from_str(s: &str) -> core::result::Result<Self, Self::Err> {
        let mut parts = s.splitn(2, '/');
        let addr = parts.next().ok_or(Error::Malformed)?;
        let len = parts.next().ok_or(Error::Malformed)?;
        let address = Address::from_str(addr).map_err(|_| Error::Malformed)?;
        let prefix_len = len.parse::<u8>().map_err(|_| Error::Malformed)?;
        if prefix_len > 128 {
            return Err(Error::Malformed);
        }
        Ok(Cidr { address, prefix_len })
    }
}

/// Upper-layer protocols the relay distinguishes.
#[derive(Debug, PartialEq, Eq, PartialOrd, Ord, Clone, Copy, Hash)]
pub enum Protocol {
    /// Transmission Control Protocol, next-header 6.
    Tcp,
    /// User Datagram Protocol, next-header 17.
    Udp,
    /// ICMP for IPv6, next-header 58.
    Icmpv6,
    /// Any other next-header value.
    Unknown(u8),
}

impl From<u8> for Protocol {
    fn from(value: u8) -> Protocol {
        match value {
            6 => Protocol::Tcp,
            17 => Protocol::Udp,
            58 => Protocol::Icmpv6,
            other => Protocol::Unknown(other),
        }
    }
}

impl From<Protocol> for u8 {
    fn from(value: Protocol) -> u8 {
        match value {
            Protocol::Tcp => 6,
            Protocol::Udp => 17,
            Protocol::Icmpv6 => 58,
            Protocol::Unknown(other) => other,
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Protocol::Tcp => write!(f, "tcp"),
            Protocol::Udp => write!(f, "udp"),
            Protocol::Icmpv6 => write!(f, "icmpv6"),
            Protocol::Unknown(value) => write!(f, "next-header {}", value),
        }
    }
}

mod field {
    use crate::wire::field::Field;

    pub const VER_TC_FLOW: Field = 0..4;
    pub const LENGTH: Field = 4..6;
    pub const NXT_HDR: usize = 6;
    pub const HOP_LIMIT: usize = 7;
    pub const SRC_ADDR: Field = 8..24;
    pub const DST_ADDR: Field = 24..40;
}

/// A read/write wrapper around an IPv6 packet buffer.
#[derive(Debug, PartialEq, Clone)]
pub struct Packet<T> {
    buffer: T,
}

impl<T: AsRef<[u8]>> Packet<T> {
    /// Imbue a raw octet buffer with IPv6 packet structure.
    pub fn new_unchecked(buffer: T) -> Packet<T> {
        Packet { buffer }
    }

    /// Shorthand for a combination of [new_unchecked] and [check_len].
    ///
    /// [new_unchecked]: #method.new_unchecked
    /// [check_len]: #method.check_len
    pub fn new_checked(buffer: T) -> Result<Packet<T>> {
        let packet = Packet::new_unchecked(buffer);
        packet.check_len()?;
        Ok(packet)
    }

    /// Ensure that no accessor method will panic if called.
    ///
    /// Returns `Err(Error::Truncated)` if the buffer is shorter than the base
    /// header or the payload length claims more octets than are present, and
    /// `Err(Error::Malformed)` if the version field is not 6.
    pub fn check_len(&self) -> Result<()> {
        let data = self.buffer.as_ref();
        if data.len() < HEADER_LEN {
            return Err(Error::Truncated);
        }
        if data[0] >> 4 != 6 {
            return Err(Error::Malformed);
        }
        if data.len() < HEADER_LEN + self.payload_len() as usize {
            return Err(Error::Truncated);
        }
        Ok(())
    }

    /// Consume the packet, returning the underlying buffer.
    pub fn into_inner(self) -> T {
        self.buffer
    }

    /// Return the payload length field.
    #[inline]
    pub fn payload_len(&self) -> u16 {
        let data = self.buffer.as_ref();
        NetworkEndian::read_u16(&data[field::LENGTH])
    }

    /// Return the next header field.
    #[inline]
    pub fn next_header(&self) -> Protocol {
        let data = self.buffer.as_ref();
        Protocol::from(data[field::NXT_HDR])
    }

    /// Return the hop limit field.
    #[inline]
    pub fn hop_limit(&self) -> u8 {
        let data = self.buffer.as_ref();
        data[field::HOP_LIMIT]
    }

    /// Return the source address field.
    pub fn src_addr(&self) -> Address {
        let data = self.buffer.as_ref();
        Address::from_bytes(&data[field::SRC_ADDR])
    }

    /// Return the destination address field.
    pub fn dst_addr(&self) -> Address {
        let data = self.buffer.as_ref();
        Address::from_bytes(&data[field::DST_ADDR])
    }

    /// Return the payload octets, bounded by the payload length field.
    pub fn payload(&self) -> &[u8] {
        let data = self.buffer.as_ref();
        let len = self.payload_len() as usize;
        &data[HEADER_LEN..HEADER_LEN + len]
    }
}

impl<T: AsRef<[u8]> + AsMut<[u8]>> Packet<T> {
    /// Set version 6, traffic class and flow label to their fixed values.
    pub fn set_version(&mut self) {
        let data = self.buffer.as_mut();
        NetworkEndian::write_u32(&mut data[field::VER_TC_FLOW], 6 << 28);
    }

    /// Set the payload length field.
    #[inline]
    pub fn set_payload_len(&mut self, value: u16) {
        let data = self.buffer.as_mut();
        NetworkEndian::write_u16(&mut data[field::LENGTH], value)
    }

    /// Set the next header field.
    #[inline]
    pub fn set_next_header(&mut self, value: Protocol) {
        let data = self.buffer.as_mut();
        data[field::NXT_HDR] = value.into();
    }

    /// Set the hop limit field.
    #[inline]
    pub fn set_hop_limit(&mut self, value: u8) {
        let data = self.buffer.as_mut();
        data[field::HOP_LIMIT] = value;
    }

    /// Set the source address field.
    pub fn set_src_addr(&mut self, value: Address) {
        let data = self.buffer.as_mut();
        data[field::SRC_ADDR].copy_from_slice(value.as_bytes())
    }

    /// Set the destination address field.
    pub fn set_dst_addr(&mut self, value: Address) {
        let data = self.buffer.as_mut();
        data[field::DST_ADDR].copy_from_slice(value.as_bytes())
    }

    /// Return a mutable reference to the payload octets.
    pub fn payload_mut(&mut self) -> &mut [u8] {
        let data = self.buffer.as_mut();
        &mut data[HEADER_LEN..]
    }
}

/// A high-level representation of an IPv6 header.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub struct Repr {
    /// The source address.
    pub src_addr: Address,
    /// The destination address.
    pub dst_addr: Address,
    /// The upper-layer protocol.
    pub next_header: Protocol,
    /// The length of the payload following the base header.
    pub payload_len: usize,
    /// The hop limit.
    pub hop_limit: u8,
}

impl Repr {
    /// Parse an IPv6 packet into a high-level representation.
    pub fn parse<T: AsRef<[u8]>>(packet: &Packet<T>) -> Repr {
        Repr {
            src_addr: packet.src_addr(),
            dst_addr: packet.dst_addr(),
            next_header: packet.next_header(),
            payload_len: packet.payload_len() as usize,
            hop_limit: packet.hop_limit(),
        }
    }

    /// Emit this representation into a packet buffer.
    pub fn emit<T: AsRef<[u8]> + AsMut<[u8]>>(&self, packet: &mut Packet<T>) {
        packet.set_version();
        packet.set_payload_len(self.payload_len as u16);
        packet.set_next_header(self.next_header);
        packet.set_hop_limit(self.hop_limit);
        packet.set_src_addr(self.src_addr);
        packet.set_dst_addr(self.dst_addr);
    }
}

pub(crate) mod checksum {
    use byteorder::{ByteOrder, NetworkEndian};
    use super::{Address, Protocol};

    fn propagate_carries(word: u32) -> u16 {
        let sum = (word >> 16) + (word & 0xffff);
        ((sum >> 16) as u16) + (sum as u16)
    }

    /// Compute an RFC 1071 compliant checksum (without the final complement).
    pub(crate) fn data(mut data: &[u8]) -> u16 {
        let mut accum: u32 = 0;

        while data.len() >= 2 {
            accum += NetworkEndian::read_u16(data) as u32;
            data = &data[2..];
        }

        if let Some(&value) = data.first() {
            accum += (value as u32) << 8;
        }

        propagate_carries(accum)
    }

    /// Combine several RFC 1071 compliant checksums.
    pub(crate) fn combine(checksums: &[u16]) -> u16 {
        let mut accum: u32 = 0;
        for &word in checksums {
            accum += word as u32;
        }
        propagate_carries(accum)
    }

    /// Compute the IPv6 pseudo-header checksum.
    pub(crate) fn pseudo_header(
        src_addr: &Address,
        dst_addr: &Address,
        protocol: Protocol,
        length: u32,
    ) -> u16 {
        let mut proto_len = [0u8; 8];
        proto_len[7] = protocol.into();
        NetworkEndian::write_u32(&mut proto_len[0..4], length);

        combine(&[
            data(src_addr.as_bytes()),
            data(dst_addr.as_bytes()),
            data(&proto_len[..]),
        ])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    static REPR: Repr = Repr {
        src_addr: Address([0xfe, 0x80, 0, 0, 0, 0, 0, 0,
                           0, 0, 0, 0, 0, 0, 0, 0x01]),
        dst_addr: Address([0xfe, 0xc0, 0, 0, 0, 0, 0xff, 0xff,
                           0, 0, 0, 0, 10, 0, 0, 0x02]),
        next_header: Protocol::Tcp,
        payload_len: 12,
        hop_limit: 64,
    };

    #[test]
    fn emit_parse_roundtrip() {
        let mut buffer = vec![0u8; HEADER_LEN + 12];
        let mut packet = Packet::new_unchecked(&mut buffer[..]);
        REPR.emit(&mut packet);

        let packet = Packet::new_checked(&buffer[..]).expect("emitted packet parses");
        assert_eq!(Repr::parse(&packet), REPR);
        assert_eq!(packet.payload().len(), 12);
    }

    #[test]
    fn version_check() {
        let mut buffer = vec![0u8; HEADER_LEN];
        buffer[0] = 0x40;
        assert_eq!(Packet::new_checked(&buffer[..]).unwrap_err(), Error::Malformed);
    }

    #[test]
    fn truncation() {
        let buffer = vec![0u8; HEADER_LEN - 1];
        assert_eq!(Packet::new_checked(&buffer[..]).unwrap_err(), Error::Truncated);

        let mut buffer = vec![0u8; HEADER_LEN];
        buffer[0] = 0x60;
        buffer[5] = 10;
        assert_eq!(Packet::new_checked(&buffer[..]).unwrap_err(), Error::Truncated);
    }

    #[test]
    fn trailing_ipv4() {
        assert_eq!(REPR.dst_addr.trailing_ipv4(), [10, 0, 0, 2]);
    }

    #[test]
    fn cidr_contains() {
        let prefix: Cidr = "fec0:0:0:ffff::/64".parse().unwrap();
        assert!(prefix.contains(&REPR.dst_addr));
        assert!(!prefix.contains(&REPR.src_addr));

        let prefix: Cidr = "fec0::/10".parse().unwrap();
        assert!(prefix.contains(&REPR.dst_addr));
        assert!(!prefix.contains(&Address::UNSPECIFIED));
    }

    #[test]
    fn cidr_parse_display() {
        let prefix: Cidr = "fec0:0:0:ffff::/64".parse().unwrap();
        assert_eq!(prefix.prefix_len(), 64);
        assert_eq!(format!("{}", prefix), "fec0:0:0:ffff::/64");
        assert!("fec0::/200".parse::<Cidr>().is_err());
        assert!("fec0::".parse::<Cidr>().is_err());
    }
}
