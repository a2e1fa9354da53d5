//! TCP header access and sequence number arithmetic.
use core::{cmp, fmt, ops};
use byteorder::{ByteOrder, NetworkEndian};

use super::{Error, Result};
use super::ipv6::{self, checksum};

/// Length of the TCP header without options.
pub const HEADER_LEN: usize = 20;

/// A TCP sequence number.
///
/// A sequence number is a monotonically advancing integer modulo
/// 2<sup>32</sup>. Sequence numbers do not have a discontiguity when compared
/// pairwise across an unsigned overflow.
#[derive(Debug, PartialEq, Eq, Clone, Copy, Default, Hash)]
pub struct SeqNumber(pub u32);

impl fmt::Display for SeqNumber {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

impl ops::Add<usize> for SeqNumber {
    type Output = SeqNumber;

    fn add(self, rhs: usize) -> SeqNumber {
        if rhs > i32::max_value() as usize {
            panic!("attempt to add to sequence number with unsigned overflow")
        }
        SeqNumber(self.0.wrapping_add(rhs as u32))
    }
}

impl ops::AddAssign<usize> for SeqNumber {
    fn add_assign(&mut self, rhs: usize) {
        *self = *self + rhs;
    }
}

impl ops::Sub<usize> for SeqNumber {
    type Output = SeqNumber;

    fn sub(self, rhs: usize) -> SeqNumber {
        if rhs > i32::max_value() as usize {
            panic!("attempt to subtract from sequence number with unsigned overflow")
        }
        SeqNumber(self.0.wrapping_sub(rhs as u32))
    }
}

impl ops::Sub for SeqNumber {
    /// The signed distance from `rhs` to `self`.
    ///
    /// Negative when `self` lies before `rhs` in sequence space. Callers use
    /// this both for retained-byte counts and for the sentinel `-1` that
    /// marks a consumed FIN.
    type Output = i32;

    fn sub(self, rhs: SeqNumber) -> i32 {
        self.0.wrapping_sub(rhs.0) as i32
    }
}

impl cmp::PartialOrd for SeqNumber {
    fn partial_cmp(&self, other: &SeqNumber) -> Option<cmp::Ordering> {
        (self.0.wrapping_sub(other.0) as i32).partial_cmp(&0)
    }
}

/// A set of TCP flags.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Flags(pub u16);

macro_rules! flag_accessors {
    ($($get:ident, $set:ident, $mask:expr;)*) => {
        $(
        #[doc = "Query the flag."]
        pub fn $get(&self) -> bool {
            self.0 & $mask != 0
        }

        #[doc = "Set or clear the flag."]
        pub fn $set(&mut self, value: bool) {
            if value {
                self.0 |= $mask;
            } else {
                self.0 &= !$mask;
            }
        }
        )*
    }
}

impl Flags {
    flag_accessors! {
        fin, set_fin, field::FLG_FIN;
        syn, set_syn, field::FLG_SYN;
        rst, set_rst, field::FLG_RST;
        psh, set_psh, field::FLG_PSH;
        ack, set_ack, field::FLG_ACK;
        urg, set_urg, field::FLG_URG;
    }

    /// The six low flag bits, as used for exact-match tests.
    pub fn basic(&self) -> u16 {
        self.0 & 0x3f
    }

    /// Sequence space occupied by the flags (SYN and FIN count for one).
    pub fn sequence_len(&self) -> usize {
        usize::from(self.syn()) + usize::from(self.fin())
    }
}

mod field {
    #![allow(non_snake_case)]

    use crate::wire::field::Field;

    pub const SRC_PORT: Field = 0..2;
    pub const DST_PORT: Field = 2..4;
    pub const SEQ_NUM:  Field = 4..8;
    pub const ACK_NUM:  Field = 8..12;
    pub const FLAGS:    Field = 12..14;
    pub const WIN_SIZE: Field = 14..16;
    pub const CHECKSUM: Field = 16..18;
    pub const URGENT:   Field = 18..20;

    pub fn OPTIONS(length: u8) -> Field {
        URGENT.end..(length as usize)
    }

    pub const FLG_FIN: u16 = 0x001;
    pub const FLG_SYN: u16 = 0x002;
    pub const FLG_RST: u16 = 0x004;
    pub const FLG_PSH: u16 = 0x008;
    pub const FLG_ACK: u16 = 0x010;
    pub const FLG_URG: u16 = 0x020;

    pub const OPT_END: u8 = 0x00;
    pub const OPT_NOP: u8 = 0x01;
    pub const OPT_MSS: u8 = 0x02;
}

/// A read/write wrapper around a TCP segment buffer.
#[derive(Debug, PartialEq, Clone)]
pub struct Packet<T> {
    buffer: T,
}

impl<T: AsRef<[u8]>> Packet<T> {
    /// Imbue a raw octet buffer with TCP segment structure.
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
    /// Returns `Err(Error::Truncated)` if the buffer is too short and
    /// `Err(Error::Malformed)` if the header length field has a value smaller
    /// than the minimal header length or extends past the buffer.
    pub fn check_len(&self) -> Result<()> {
        let len = self.buffer.as_ref().len();
        if len < field::URGENT.end {
            return Err(Error::Truncated);
        }
        let header_len = self.header_len() as usize;
        if header_len < field::URGENT.end {
            return Err(Error::Malformed);
        }
        if len < header_len {
            return Err(Error::Truncated);
        }
        Ok(())
    }

    /// Consume the packet, returning the underlying buffer.
    pub fn into_inner(self) -> T {
        self.buffer
    }

    /// Return the source port field.
    #[inline]
    pub fn src_port(&self) -> u16 {
        let data = self.buffer.as_ref();
        NetworkEndian::read_u16(&data[field::SRC_PORT])
    }

    /// Return the destination port field.
    #[inline]
    pub fn dst_port(&self) -> u16 {
        let data = self.buffer.as_ref();
        NetworkEndian::read_u16(&data[field::DST_PORT])
    }

    /// Return the sequence number field.
    #[inline]
    pub fn seq_number(&self) -> SeqNumber {
        let data = self.buffer.as_ref();
        SeqNumber(NetworkEndian::read_u32(&data[field::SEQ_NUM]))
    }

    /// Return the acknowledgement number field.
    #[inline]
    pub fn ack_number(&self) -> SeqNumber {
        let data = self.buffer.as_ref();
        SeqNumber(NetworkEndian::read_u32(&data[field::ACK_NUM]))
    }

    /// Read all flags at once.
    pub fn flags(&self) -> Flags {
        let data = self.buffer.as_ref();
        Flags(NetworkEndian::read_u16(&data[field::FLAGS]) & 0x1ff)
    }

    /// Return the header length, in octets.
    #[inline]
    pub fn header_len(&self) -> u8 {
        let data = self.buffer.as_ref();
        let raw = NetworkEndian::read_u16(&data[field::FLAGS]);
        ((raw >> 12) * 4) as u8
    }

    /// Return the window size field.
    #[inline]
    pub fn window_len(&self) -> u16 {
        let data = self.buffer.as_ref();
        NetworkEndian::read_u16(&data[field::WIN_SIZE])
    }

    /// Return the checksum field.
    #[inline]
    pub fn checksum(&self) -> u16 {
        let data = self.buffer.as_ref();
        NetworkEndian::read_u16(&data[field::CHECKSUM])
    }

    /// Return the length of the segment in terms of sequence space.
    pub fn sequence_len(&self) -> usize {
        self.payload().len() + self.flags().sequence_len()
    }

    /// Return the advertised maximum segment size, if the option is present.
    ///
    /// Unknown options are skipped over; a malformed option list yields an
    /// error rather than a misparse.
    pub fn max_seg_size(&self) -> Result<Option<u16>> {
        let data = self.buffer.as_ref();
        let mut options = &data[field::OPTIONS(self.header_len())];
        while let Some((&kind, rest)) = options.split_first() {
            match kind {
                field::OPT_END => break,
                field::OPT_NOP => options = rest,
                field::OPT_MSS => {
                    if rest.len() < 3 || rest[0] != 4 {
                        return Err(Error::Malformed);
                    }
                    return Ok(Some(NetworkEndian::read_u16(&rest[1..3])));
                }
                _ => {
                    let (&len, rest) = rest.split_first().ok_or(Error::Truncated)?;
                    if len < 2 || rest.len() < len as usize - 2 {
                        return Err(Error::Malformed);
                    }
                    options = &rest[len as usize - 2..];
                }
            }
        }
        Ok(None)
    }

    /// Return the payload octets.
    pub fn payload(&self) -> &[u8] {
        let data = self.buffer.as_ref();
        &data[self.header_len() as usize..]
    }
}

impl<T: AsRef<[u8]> + AsMut<[u8]>> Packet<T> {
    /// Set the source port field.
    #[inline]
    pub fn set_src_port(&mut self, value: u16) {
        let data = self.buffer.as_mut();
        NetworkEndian::write_u16(&mut data[field::SRC_PORT], value)
    }

    /// Set the destination port field.
    #[inline]
    pub fn set_dst_port(&mut self, value: u16) {
        let data = self.buffer.as_mut();
        NetworkEndian::write_u16(&mut data[field::DST_PORT], value)
    }

    /// Set the sequence number field.
    #[inline]
    pub fn set_seq_number(&mut self, value: SeqNumber) {
        let data = self.buffer.as_mut();
        NetworkEndian::write_u32(&mut data[field::SEQ_NUM], value.0)
    }

    /// Set the acknowledgement number field.
    #[inline]
    pub fn set_ack_number(&mut self, value: SeqNumber) {
        let data = self.buffer.as_mut();
        NetworkEndian::write_u32(&mut data[field::ACK_NUM], value.0)
    }

    /// Write the flag bits and the header length in one go.
    pub fn set_flags_and_header_len(&mut self, flags: Flags, header_len: u8) {
        let data = self.buffer.as_mut();
        let raw = (flags.0 & 0x1ff) | ((header_len as u16 / 4) << 12);
        NetworkEndian::write_u16(&mut data[field::FLAGS], raw)
    }

    /// Set the window size field.
    #[inline]
    pub fn set_window_len(&mut self, value: u16) {
        let data = self.buffer.as_mut();
        NetworkEndian::write_u16(&mut data[field::WIN_SIZE], value)
    }

    /// Set the checksum field.
    #[inline]
    pub fn set_checksum(&mut self, value: u16) {
        let data = self.buffer.as_mut();
        NetworkEndian::write_u16(&mut data[field::CHECKSUM], value)
    }

    /// Set the urgent pointer field.
    #[inline]
    pub fn set_urgent_at(&mut self, value: u16) {
        let data = self.buffer.as_mut();
        NetworkEndian::write_u16(&mut data[field::URGENT], value)
    }

    /// Return a mutable reference to the payload octets.
    ///
    /// Only meaningful once the header length field has been written.
    pub fn payload_mut(&mut self) -> &mut [u8] {
        let header_len = self.header_len() as usize;
        let data = self.buffer.as_mut();
        &mut data[header_len..]
    }

    /// Write a maximum segment size option at the start of the option space.
    pub fn set_max_seg_size(&mut self, value: u16) {
        let header_len = self.header_len();
        let data = self.buffer.as_mut();
        let option = &mut data[field::OPTIONS(header_len)];
        option[0] = field::OPT_MSS;
        option[1] = 4;
        NetworkEndian::write_u16(&mut option[2..4], value);
    }
}

/// A high-level representation of a TCP header.
///
/// The only understood option is the maximum segment size, carried on SYN
/// segments.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub struct Repr {
    /// The source port.
    pub src_port: u16,
    /// The destination port.
    pub dst_port: u16,
    /// The sequence number.
    pub seq_number: SeqNumber,
    /// The acknowledgment number.
    pub ack_number: SeqNumber,
    /// The flag bits.
    pub flags: Flags,
    /// The advertised receive window.
    pub window: u16,
    /// The maximum segment size option.
    pub max_seg_size: Option<u16>,
}

impl Repr {
    /// Header length required to emit this representation.
    pub fn header_len(&self) -> usize {
        if self.max_seg_size.is_some() {
            HEADER_LEN + 4
        } else {
            HEADER_LEN
        }
    }

    /// Parse a TCP segment into a high-level representation.
    pub fn parse<T: AsRef<[u8]>>(packet: &Packet<T>) -> Result<Repr> {
        Ok(Repr {
            src_port: packet.src_port(),
            dst_port: packet.dst_port(),
            seq_number: packet.seq_number(),
            ack_number: packet.ack_number(),
            flags: packet.flags(),
            window: packet.window_len(),
            max_seg_size: packet.max_seg_size()?,
        })
    }

    /// Emit this representation into a segment buffer.
    ///
    /// The checksum field is zeroed; follow up with [`fill_checksum`] once
    /// the payload is in place.
    ///
    /// [`fill_checksum`]: fn.fill_checksum.html
    pub fn emit<T: AsRef<[u8]> + AsMut<[u8]>>(&self, packet: &mut Packet<T>) {
        packet.set_src_port(self.src_port);
        packet.set_dst_port(self.dst_port);
        packet.set_seq_number(self.seq_number);
        packet.set_ack_number(self.ack_number);
        packet.set_flags_and_header_len(self.flags, self.header_len() as u8);
        packet.set_window_len(self.window);
        packet.set_checksum(0);
        packet.set_urgent_at(0);
        if let Some(mss) = self.max_seg_size {
            packet.set_max_seg_size(mss);
        }
    }
}

/// Compute and store the checksum of a complete segment.
///
/// The sum covers the IPv6 pseudo-header and the entire segment buffer, with
/// end-around carry folding, stored in ones-complement form.
pub fn fill_checksum<T: AsRef<[u8]> + AsMut<[u8]>>(
    packet: &mut Packet<T>,
    src_addr: &ipv6::Address,
    dst_addr: &ipv6::Address,
) {
    packet.set_checksum(0);
    let sum = segment_checksum(packet.buffer.as_ref(), src_addr, dst_addr);
    packet.set_checksum(sum);
}

/// The ones-complement checksum of a segment between the given addresses.
pub fn segment_checksum(segment: &[u8], src_addr: &ipv6::Address, dst_addr: &ipv6::Address) -> u16 {
    !checksum::combine(&[
        checksum::pseudo_header(src_addr, dst_addr, ipv6::Protocol::Tcp, segment.len() as u32),
        checksum::data(segment),
    ])
}

#[cfg(test)]
mod tests {
    use super::*;

    const SRC: ipv6::Address = ipv6::Address([0xfe, 0xc0, 0, 0, 0, 0, 0xff, 0xff,
                                              0, 0, 0, 0, 10, 0, 0, 1]);
    const DST: ipv6::Address = ipv6::Address([0xfe, 0x80, 0, 0, 0, 0, 0, 0,
                                              0, 0, 0, 0, 0, 0, 0, 5]);

    fn syn_ack_repr() -> Repr {
        Repr {
            src_port: 80,
            dst_port: 49500,
            seq_number: SeqNumber(0x10000),
            ack_number: SeqNumber(1001),
            flags: {
                let mut flags = Flags::default();
                flags.set_syn(true);
                flags.set_ack(true);
                flags
            },
            window: 16384,
            max_seg_size: Some(1216),
        }
    }

    #[test]
    fn emit_parse_roundtrip() {
        let repr = syn_ack_repr();
        let mut buffer = vec![0u8; repr.header_len()];
        let mut packet = Packet::new_unchecked(&mut buffer[..]);
        repr.emit(&mut packet);
        fill_checksum(&mut packet, &SRC, &DST);

        let packet = Packet::new_checked(&buffer[..]).expect("emitted packet parses");
        assert_eq!(packet.header_len(), 24);
        assert_eq!(Repr::parse(&packet).unwrap(), repr);
        assert_eq!(packet.sequence_len(), 1);
    }

    #[test]
    fn checksum_validates() {
        let repr = syn_ack_repr();
        let mut buffer = vec![0u8; repr.header_len()];
        let mut packet = Packet::new_unchecked(&mut buffer[..]);
        repr.emit(&mut packet);
        fill_checksum(&mut packet, &SRC, &DST);

        // Summing a correctly checksummed segment, pseudo-header included,
        // yields all ones.
        let total = checksum::combine(&[
            checksum::pseudo_header(&SRC, &DST, ipv6::Protocol::Tcp, buffer.len() as u32),
            checksum::data(&buffer),
        ]);
        assert_eq!(total, 0xffff);
    }

    #[test]
    fn options_skipped() {
        let repr = syn_ack_repr();
        let mut buffer = vec![0u8; HEADER_LEN + 8];
        let mut packet = Packet::new_unchecked(&mut buffer[..]);
        repr.emit(&mut packet);
        packet.set_flags_and_header_len(repr.flags, (HEADER_LEN + 8) as u8);
        // A no-op, an unknown option, then the MSS.
        {
            let data = packet.buffer.as_mut();
            data[20] = 0x01;
            data[21] = 0x09;
            data[22] = 0x03;
            data[23] = 0x00;
            data[24] = 0x02;
            data[25] = 0x04;
            data[26] = 0x04;
            data[27] = 0xc4;
        }
        assert_eq!(packet.max_seg_size().unwrap(), Some(1220));
    }

    #[test]
    fn sequence_ordering() {
        assert!(SeqNumber(1) < SeqNumber(2));
        assert!(SeqNumber(0xffff_fff0) < SeqNumber(0x10));
        assert_eq!(SeqNumber(0x10) - SeqNumber(0xffff_fff0), 0x20);
        assert_eq!(SeqNumber(0xffff_fff0) - SeqNumber(0x10), -0x20);
        assert_eq!(SeqNumber(0xffff_ffff) + 2, SeqNumber(1));
        assert_eq!(SeqNumber(1) - 2usize, SeqNumber(0xffff_ffff));
    }
}
