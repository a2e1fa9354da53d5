//! A transport relay translator core.
//!
//! The relay terminates inbound IPv6 TCP connections arriving over a virtual
//! network interface by running a complete TCP engine itself, then carries
//! the payload to an IPv4 destination over the host's native sockets. The
//! destination is recovered from the translated IPv6 address: the last four
//! octets of the datagram's destination are the real IPv4 address, the
//! destination port carries over unchanged.
//!
//! ## Table of contents
//!
//! 1. [The wire module](wire/index.html) — IPv6/TCP parsing and emission.
//! 2. [The storage module](storage/index.html) — the sequence-indexed ring
//!    buffer connections buffer payload in.
//! 3. [The event module](event/index.html) — the cooperative scheduler
//!    everything runs on.
//! 4. [The tcp module](tcp/index.html) — connection table, state machine,
//!    retransmission.
//! 5. [The relay module](relay/index.html) — the bridge from connection
//!    buffers to native sockets.
//! 6. [The link module](link/index.html) — virtual interface drivers.
//!
//! ## Design
//!
//! A single thread owns everything. One [`Relay`] value groups the protocol
//! engine, the interface driver and the application collaborator; it is the
//! context object threaded through every scheduler callback, so independent
//! relay instances can coexist and tests can drive one deterministically.
//! Nothing is locked: suspension only happens in the scheduler's readiness
//! wait, and callbacks run to completion.
//!
//! [`Relay`]: struct.Relay.html
#![warn(missing_docs)]
#![warn(unreachable_pub)]

pub mod event;
pub mod link;
pub mod managed;
pub mod relay;
pub mod storage;
pub mod sys;
pub mod tcp;
pub mod time;
pub mod wire;

use event::{EventId, Interest, Scheduler};
use tcp::SessionHandler;
use wire::ipv6;

/// One relay instance: engine, interface and application collaborator.
///
/// This is the context object every scheduler callback receives. The
/// application side `H` observes connections through the
/// [`tcp::SessionHandler`] notifications; the stock collaborator is
/// [`relay::TcpRelay`], which bridges each connection to a native socket.
///
/// [`tcp::SessionHandler`]: tcp/trait.SessionHandler.html
/// [`relay::TcpRelay`]: relay/struct.TcpRelay.html
pub struct Relay<H: SessionHandler> {
    /// The TCP protocol engine.
    pub tcp: tcp::Engine,
    /// The virtual interface datagrams arrive on and leave through.
    pub link: Box<dyn link::LinkInterface>,
    /// The application collaborator receiving session notifications.
    pub app: H,
}

/// The scheduler type driving a relay instance.
pub type Sched<H> = Scheduler<Relay<H>>;

impl<H: SessionHandler> Relay<H> {
    /// Group an interface and a collaborator into a relay instance.
    pub fn new(link: Box<dyn link::LinkInterface>, app: H) -> Self {
        Relay {
            tcp: tcp::Engine::new(),
            link,
            app,
        }
    }

    /// Demultiplex one decapsulated IPv6 datagram.
    ///
    /// TCP goes to the engine. UDP and ICMPv6 relaying are handled by
    /// external collaborators when configured; this core drops them.
    pub fn handle_packet(&mut self, sched: &mut Sched<H>, datagram: &[u8]) {
        let packet = match ipv6::Packet::new_checked(datagram) {
            Ok(packet) => packet,
            Err(err) => {
                log::trace!("dropping inbound datagram: {}", err);
                return;
            }
        };
        let repr = ipv6::Repr::parse(&packet);

        match repr.next_header {
            ipv6::Protocol::Tcp => {
                tcp::segment_arrives(self, sched, &repr, packet.payload())
            }
            other => {
                log::trace!("dropping {} datagram from {}", other, repr.src_addr)
            }
        }
    }

    /// Register the interface's receive callback with the scheduler.
    ///
    /// One datagram is read and demultiplexed per callback invocation, so a
    /// busy interface cannot starve timers or bridge sockets. Returns `None`
    /// for drivers without a pollable descriptor (packets are then injected
    /// by hand, as the tests do).
    pub fn register_link_rx(&self, sched: &mut Sched<H>) -> Option<EventId> {
        let fd = self.link.fd()?;
        let mut scratch = vec![0u8; self.link.mtu() + 64];

        Some(sched.on_readable(fd, move |sched, relay: &mut Relay<H>, _| {
            match relay.link.recv(&mut scratch) {
                Ok(Some(len)) => {
                    let datagram = &scratch[..len];
                    relay.handle_packet(sched, datagram);
                }
                Ok(None) => (),
                Err(err) => log::warn!("interface receive failed: {}", err),
            }
            Interest::Keep
        }))
    }
}
