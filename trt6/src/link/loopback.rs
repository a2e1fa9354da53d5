//! An in-memory interface that queues frames instead of transmitting them.
//!
//! Transmitted datagrams land in a queue the owner of a [`LoopbackHandle`]
//! can drain and inspect; injected datagrams are handed out by `recv`. Used
//! by the protocol tests to drive the engine without a real device.
//!
//! [`LoopbackHandle`]: struct.LoopbackHandle.html
use std::cell::RefCell;
use std::collections::VecDeque;
use std::os::unix::io::RawFd;
use std::rc::Rc;

use crate::sys::Errno;
use super::{LinkInterface, PacketBuf};

#[derive(Default)]
struct Queues {
    transmitted: VecDeque<Vec<u8>>,
    inbound: VecDeque<Vec<u8>>,
}

/// The loopback driver.
#[derive(Default)]
pub struct Loopback {
    queues: Rc<RefCell<Queues>>,
}

/// A shared view on a loopback's queues.
#[derive(Clone)]
pub struct LoopbackHandle {
    queues: Rc<RefCell<Queues>>,
}

impl Loopback {
    /// Create a loopback interface with empty queues.
    pub fn new() -> Loopback {
        Loopback::default()
    }

    /// A handle for inspecting transmissions and injecting datagrams.
    pub fn handle(&self) -> LoopbackHandle {
        LoopbackHandle { queues: self.queues.clone() }
    }
}

impl LoopbackHandle {
    /// Pop the oldest transmitted datagram.
    pub fn transmitted(&self) -> Option<Vec<u8>> {
        self.queues.borrow_mut().transmitted.pop_front()
    }

    /// Number of queued transmissions.
    pub fn transmitted_len(&self) -> usize {
        self.queues.borrow().transmitted.len()
    }

    /// Queue a datagram for the next `recv` call.
    pub fn inject(&self, datagram: Vec<u8>) {
        self.queues.borrow_mut().inbound.push_back(datagram);
    }
}

impl LinkInterface for Loopback {
    fn name(&self) -> &str {
        "loopback"
    }

    fn mtu(&self) -> usize {
        crate::wire::ipv6::MIN_MTU
    }

    fn get_buffer(&mut self, size: usize) -> PacketBuf {
        PacketBuf::with_headroom(0, size)
    }

    fn send_unicast(&mut self, pkt: PacketBuf) -> Result<(), Errno> {
        self.queues.borrow_mut().transmitted.push_back(pkt.payload().to_vec());
        Ok(())
    }

    fn fd(&self) -> Option<RawFd> {
        None
    }

    fn recv(&mut self, buf: &mut [u8]) -> Result<Option<usize>, Errno> {
        match self.queues.borrow_mut().inbound.pop_front() {
            Some(datagram) => {
                let count = datagram.len().min(buf.len());
                buf[..count].copy_from_slice(&datagram[..count]);
                Ok(Some(count))
            }
            None => Ok(None),
        }
    }
}
