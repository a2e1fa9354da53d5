//! Virtual network interface drivers.
//!
//! The protocol engine depends only on the [`LinkInterface`] capability:
//! allocate a transmit buffer with headroom for whatever framing the driver
//! needs, and hand off a built IPv6 datagram for transmission. Next-hop
//! resolution is the driver's concern (for the tun driver there is none —
//! the kernel routes the datagram).
//!
//! Drivers are chosen through an enumerated factory registry rather than by
//! name string; the daemon parses `driver:name` arguments into a
//! [`LinkSpec`].
//!
//! [`LinkInterface`]: trait.LinkInterface.html
//! [`LinkSpec`]: struct.LinkSpec.html
use core::fmt;
use core::str::FromStr;
use std::os::unix::io::RawFd;

use crate::sys::Errno;

mod loopback;
mod tuntap;

pub use loopback::{Loopback, LoopbackHandle};
pub use tuntap::TunInterface;

/// A transmit buffer with reserved headroom.
///
/// The payload region is where upper layers build the IPv6 datagram; the
/// driver that allocated the buffer may later expose part of the headroom to
/// prepend its framing.
#[derive(Debug)]
pub struct PacketBuf {
    buf: Vec<u8>,
    offset: usize,
    len: usize,
}

impl PacketBuf {
    /// Allocate a buffer with the given headroom and payload capacity.
    pub fn with_headroom(headroom: usize, capacity: usize) -> PacketBuf {
        PacketBuf {
            buf: vec![0; headroom + capacity],
            offset: headroom,
            len: 0,
        }
    }

    /// The finished frame, headroom excluded.
    pub fn payload(&self) -> &[u8] {
        &self.buf[self.offset..self.offset + self.len]
    }

    /// The writable payload region, full capacity.
    pub fn payload_mut(&mut self) -> &mut [u8] {
        &mut self.buf[self.offset..]
    }

    /// Set the length of the finished payload.
    ///
    /// # Panics
    /// Panics if `len` exceeds the payload capacity.
    pub fn set_len(&mut self, len: usize) {
        assert!(self.offset + len <= self.buf.len());
        self.len = len;
    }

    /// Expose `count` octets of headroom in front of the payload.
    ///
    /// # Panics
    /// Panics if the buffer does not have that much headroom left.
    pub fn raise(&mut self, count: usize) {
        assert!(count <= self.offset);
        self.offset -= count;
        self.len += count;
    }
}

/// Capability provided by every interface driver.
pub trait LinkInterface {
    /// The device name, as configured on the host.
    fn name(&self) -> &str;

    /// Maximum transmission unit of the link.
    fn mtu(&self) -> usize;

    /// Hardware address, for drivers whose framing carries one.
    fn hwaddr(&self) -> Option<[u8; 6]> {
        None
    }

    /// Allocate a transmit buffer able to hold `size` payload octets, with
    /// headroom for the driver's framing reserved in front.
    fn get_buffer(&mut self, size: usize) -> PacketBuf;

    /// Transmit a built datagram to its (already resolved) next hop.
    fn send_unicast(&mut self, pkt: PacketBuf) -> Result<(), Errno>;

    /// Transmit a built datagram to a multicast group.
    fn send_multicast(&mut self, pkt: PacketBuf) -> Result<(), Errno> {
        self.send_unicast(pkt)
    }

    /// The pollable descriptor delivering inbound datagrams, if any.
    fn fd(&self) -> Option<RawFd>;

    /// Receive one IPv6 datagram into `buf`.
    ///
    /// `Ok(None)` means nothing is pending or the frame was not an IPv6
    /// datagram; real transport failures surface as errors.
    fn recv(&mut self, buf: &mut [u8]) -> Result<Option<usize>, Errno>;
}

/// The interface drivers the registry can construct.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DriverKind {
    /// The Linux tun device, carrying raw IPv6 datagrams.
    Tun,
    /// An in-memory pair of queues, for tests and loop-through setups.
    Loopback,
}

/// A parsed interface argument: driver kind plus device name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkSpec {
    /// Which driver to construct.
    pub kind: DriverKind,
    /// The device name handed to the driver; may be empty to let the kernel
    /// choose.
    pub name: String,
}

impl FromStr for LinkSpec {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (kind, name) = match s.find(':') {
            Some(split) => (&s[..split], &s[split + 1..]),
            None => (s, ""),
        };
        let kind = match kind {
            "tun" => DriverKind::Tun,
            "loopback" => DriverKind::Loopback,
            other => return Err(format!("unknown interface driver `{}`", other)),
        };
        Ok(LinkSpec { kind, name: name.into() })
    }
}

impl fmt::Display for LinkSpec {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let kind = match self.kind {
            DriverKind::Tun => "tun",
            DriverKind::Loopback => "loopback",
        };
        write!(f, "{}:{}", kind, self.name)
    }
}

/// Construct the driver described by `spec`.
pub fn create(spec: &LinkSpec) -> Result<Box<dyn LinkInterface>, Errno> {
    match spec.kind {
        DriverKind::Tun => {
            let tun = TunInterface::open(&spec.name)?;
            log::info!("attached tun interface {}", tun.name());
            Ok(Box::new(tun))
        }
        DriverKind::Loopback => Ok(Box::new(Loopback::new())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn spec_parsing() {
        let spec: LinkSpec = "tun:trt0".parse().unwrap();
        assert_eq!(spec, LinkSpec { kind: DriverKind::Tun, name: "trt0".into() });
        assert_eq!(format!("{}", spec), "tun:trt0");

        let spec: LinkSpec = "tun".parse().unwrap();
        assert_eq!(spec.kind, DriverKind::Tun);
        assert_eq!(spec.name, "");

        assert!("tap:x".parse::<LinkSpec>().is_err());
    }

    #[test]
    fn headroom_handling() {
        let mut pkt = PacketBuf::with_headroom(4, 60);
        pkt.payload_mut()[..3].copy_from_slice(&[1, 2, 3]);
        pkt.set_len(3);
        assert_eq!(pkt.payload(), &[1, 2, 3]);

        pkt.raise(4);
        assert_eq!(pkt.payload().len(), 7);
        assert_eq!(&pkt.payload()[4..], &[1, 2, 3]);
    }
}
