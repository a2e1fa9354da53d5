//! The Linux tun driver.
//!
//! The descriptor delivers raw IP datagrams prefixed with the 4-byte packet
//! information header (two flag octets and the ethertype). Frames whose
//! ethertype is not IPv6 are discarded on receive; transmitted datagrams get
//! the header prepended into the buffer headroom.
use byteorder::{ByteOrder, NetworkEndian};
use std::os::unix::io::RawFd;

use crate::sys::{self, Errno};
use crate::wire::ipv6;
use super::{LinkInterface, PacketBuf};

const PI_LEN: usize = 4;
const ETH_P_IPV6: u16 = 0x86dd;

/// A tun device usable as the relay's virtual interface.
#[derive(Debug)]
pub struct TunInterface {
    fd: RawFd,
    name: String,
    scratch: Vec<u8>,
}

impl TunInterface {
    /// Open the tun device and attach to the named interface.
    ///
    /// An empty name lets the kernel pick one.
    pub fn open(name: &str) -> Result<TunInterface, Errno> {
        let (fd, name) = sys::open_tun(name)?;
        Ok(TunInterface {
            fd,
            name,
            scratch: vec![0; ipv6::MIN_MTU + PI_LEN],
        })
    }
}

impl LinkInterface for TunInterface {
    fn name(&self) -> &str {
        &self.name
    }

    fn mtu(&self) -> usize {
        ipv6::MIN_MTU
    }

    fn get_buffer(&mut self, size: usize) -> PacketBuf {
        PacketBuf::with_headroom(PI_LEN, size)
    }

    fn send_unicast(&mut self, mut pkt: PacketBuf) -> Result<(), Errno> {
        pkt.raise(PI_LEN);
        {
            let frame = pkt.payload_mut();
            frame[0] = 0;
            frame[1] = 0;
            NetworkEndian::write_u16(&mut frame[2..4], ETH_P_IPV6);
        }
        sys::write_fd(self.fd, pkt.payload()).map(drop)
    }

    fn fd(&self) -> Option<RawFd> {
        Some(self.fd)
    }

    fn recv(&mut self, buf: &mut [u8]) -> Result<Option<usize>, Errno> {
        let len = match sys::read_fd(self.fd, &mut self.scratch) {
            Ok(len) => len,
            Err(ref err) if err.is_would_block() => return Ok(None),
            Err(err) => return Err(err),
        };

        if len <= PI_LEN {
            return Ok(None);
        }
        if NetworkEndian::read_u16(&self.scratch[2..4]) != ETH_P_IPV6 {
            return Ok(None);
        }

        let datagram = &self.scratch[PI_LEN..len];
        let count = datagram.len().min(buf.len());
        buf[..count].copy_from_slice(&datagram[..count]);
        Ok(Some(count))
    }
}

impl Drop for TunInterface {
    fn drop(&mut self) {
        sys::close_fd(self.fd);
    }
}
