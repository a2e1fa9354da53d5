//! Connection records and the connection table.
use std::collections::BTreeMap;

use crate::event::EventId;
use crate::managed::{Arena, Key};
use crate::storage::Ring;
use crate::time::Instant;
use crate::wire::ipv6::Address;
use crate::wire::tcp::SeqNumber;

/// Receive and send buffer capacity of a connection.
pub(crate) const BUFFER_SIZE: usize = 16 * 1024;

/// State of the connection state machine.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum State {
    /// Marker state for an uninitialized connection record.
    Closed,
    /// A listening template record; never consumed by a connection.
    Listen,
    /// An open connection request. Unused by this inbound-only relay.
    SynSent,
    /// Connection request we intend to answer, waiting on the peer ack.
    SynReceived,
    /// An open connection.
    Established,
    /// Closed our side of the connection.
    FinWait1,
    /// Closing nicely, initiated by us and acknowledged.
    FinWait2,
    /// Closed both sides but we don't know the other side knows.
    Closing,
    /// Both sides recognized the connection as closed.
    TimeWait,
    /// The other side closed its direction.
    CloseWait,
    /// Connection closed after the other side closed its own already.
    LastAck,
}

impl Default for State {
    fn default() -> Self {
        State::Closed
    }
}

impl core::fmt::Display for State {
    fn fmt(&self, f: &mut core::fmt::Formatter) -> core::fmt::Result {
        let name = match self {
            State::Closed => "CLOSED",
            State::Listen => "LISTEN",
            State::SynSent => "SYN_SENT",
            State::SynReceived => "SYN_RECVD",
            State::Established => "ESTABLISHED",
            State::FinWait1 => "FIN_WAIT_1",
            State::FinWait2 => "FIN_WAIT_2",
            State::Closing => "CLOSING",
            State::TimeWait => "TIME_WAIT",
            State::CloseWait => "CLOSE_WAIT",
            State::LastAck => "LAST_ACK",
        };
        f.write_str(name)
    }
}

/// Stable identifier of a connection record.
///
/// Timers and bridge sessions refer to connections through this key; a key
/// whose record has been deleted simply stops resolving.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct TcbKey(pub(crate) Key);

/// Token chosen by the application collaborator for one of its sessions.
///
/// Returned from the incoming-session notification and passed back verbatim
/// with every later notification for that connection.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct AppToken(pub Key);

/// A connection record.
///
/// Holds the full protocol state of one connection: identity, state machine
/// state, the two sequence-indexed buffers, window and congestion bookkeeping
/// and the round-trip estimator.
pub struct Tcb {
    pub(crate) state: State,

    pub(crate) laddr: Address,
    pub(crate) lport: u16,
    pub(crate) raddr: Address,
    pub(crate) rport: u16,

    /// Payload received from the peer, drained by the application.
    pub(crate) inbuf: Ring,
    /// Payload queued by the application, drained by acknowledgements.
    pub(crate) outbuf: Ring,

    /// Application session token; `None` once notifications stop.
    pub(crate) app: Option<AppToken>,

    pub(crate) snd_una: SeqNumber,
    pub(crate) snd_nxt: SeqNumber,
    pub(crate) snd_wnd: u32,
    pub(crate) snd_cwnd: u32,
    pub(crate) snd_max: SeqNumber,
    pub(crate) iss: SeqNumber,
    pub(crate) mss: u32,
    pub(crate) rcv_nxt: SeqNumber,
    pub(crate) rcv_wnd: u32,
    pub(crate) irs: SeqNumber,

    /// Receive sequence acknowledged by our last emitted segment.
    pub(crate) last_acked: SeqNumber,
    /// Emit one redundant ACK even if nothing else calls for a segment.
    pub(crate) force_ack: bool,

    /// Next sequence the application reads at.
    pub(crate) read_seq: SeqNumber,

    /// Sequence the armed retransmit timer watches for.
    pub(crate) timeout_mark: SeqNumber,

    /// Sequence being used to measure the round trip.
    pub(crate) rtt_mark: SeqNumber,
    /// Smallest sequence eligible for a round-trip sample; excludes
    /// retransmitted ranges from the estimate.
    pub(crate) rtt_limit: SeqNumber,
    /// When the segment carrying `rtt_mark` was sent.
    pub(crate) rtt_time: Instant,
    /// Smoothed round-trip time, in milliseconds.
    pub(crate) srtt: i64,
    /// Smoothed round-trip mean deviation, in milliseconds.
    pub(crate) sdev: i64,

    pub(crate) e_send: Option<EventId>,
    pub(crate) e_timer: Option<EventId>,

    pub(crate) packets: u64,
    pub(crate) start_time: Instant,
    pub(crate) last_activity: Instant,
}

impl Tcb {
    pub(crate) fn new(
        laddr: Address,
        lport: u16,
        raddr: Address,
        rport: u16,
        now: Instant,
    ) -> Tcb {
        Tcb {
            state: State::Closed,
            laddr,
            lport,
            raddr,
            rport,
            inbuf: Ring::new(BUFFER_SIZE),
            outbuf: Ring::new(BUFFER_SIZE),
            app: None,
            snd_una: SeqNumber::default(),
            snd_nxt: SeqNumber::default(),
            snd_wnd: 0,
            snd_cwnd: 0,
            snd_max: SeqNumber::default(),
            iss: SeqNumber::default(),
            mss: 0,
            rcv_nxt: SeqNumber::default(),
            rcv_wnd: 0,
            irs: SeqNumber::default(),
            last_acked: SeqNumber::default(),
            force_ack: false,
            read_seq: SeqNumber::default(),
            timeout_mark: SeqNumber::default(),
            rtt_mark: SeqNumber::default(),
            rtt_limit: SeqNumber::default(),
            rtt_time: now,
            srtt: 0,
            sdev: 0,
            e_send: None,
            e_timer: None,
            packets: 0,
            start_time: now,
            last_activity: now,
        }
    }

    pub(crate) fn tuple(&self) -> TupleKey {
        TupleKey {
            remote_port: self.rport,
            local_port: self.lport,
            remote_addr: self.raddr,
        }
    }

    /// Octets we may still place on the wire: `snd_max - snd_nxt`.
    pub(crate) fn window_size(&self) -> i32 {
        self.snd_max - self.snd_nxt
    }

    /// Recompute `snd_max` from the congestion and peer windows.
    ///
    /// The congestion window floors at one MSS and is capped by the peer
    /// window. Returns the resulting usable window.
    pub(crate) fn window_update(&mut self) -> i32 {
        if self.snd_cwnd == 0 {
            self.snd_cwnd = self.mss;
        }
        if self.snd_cwnd > self.snd_wnd {
            self.snd_cwnd = self.snd_wnd;
        }
        self.snd_max = self.snd_una + self.snd_cwnd as usize;
        self.window_size()
    }

    /// Fold a measured round trip into the smoothed estimate.
    ///
    /// New samples weigh 2/10 against the history for the mean and 25/100
    /// for the deviation, with the original's rounding.
    pub(crate) fn rtt_sample(&mut self, diff_ms: i64) {
        if self.srtt > 0 {
            self.srtt = (2 * diff_ms + 8 * self.srtt + 5) / 10;
        } else {
            self.srtt = diff_ms;
        }
        let deviation = (diff_ms - self.srtt).abs();
        self.sdev = (75 * self.sdev + 25 * deviation + 50) / 100;
    }

    /// The retransmission timeout derived from the estimator, in
    /// milliseconds, clamped to [500, 30000].
    pub(crate) fn rto_millis(&self) -> i64 {
        (self.srtt + 4 * self.sdev).max(500).min(30_000)
    }
}

/// Composite lookup key: remote port, local port, remote address.
///
/// The derived ordering makes the table an ordered index with exactly that
/// priority, so wildcard records (zero port, unspecified address) sort
/// together and are found by the degraded probes.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub(crate) struct TupleKey {
    pub(crate) remote_port: u16,
    pub(crate) local_port: u16,
    pub(crate) remote_addr: Address,
}

/// The table of connection records.
///
/// Records live in an arena addressed by [`TcbKey`]; an ordered index over
/// the composite tuple serves wire lookups, degrading towards wildcard
/// entries until something matches.
///
/// [`TcbKey`]: struct.TcbKey.html
#[derive(Default)]
pub struct ConnTable {
    arena: Arena<Tcb>,
    index: BTreeMap<TupleKey, Key>,
}

impl ConnTable {
    pub(crate) fn new() -> ConnTable {
        ConnTable::default()
    }

    /// Number of records, listeners included.
    pub fn len(&self) -> usize {
        self.arena.len()
    }

    /// Whether the table holds no records.
    pub fn is_empty(&self) -> bool {
        self.arena.is_empty()
    }

    pub(crate) fn insert(&mut self, tcb: Tcb) -> TcbKey {
        let tuple = tcb.tuple();
        let key = self.arena.insert(tcb);
        self.index.insert(tuple, key);
        TcbKey(key)
    }

    pub(crate) fn get(&self, key: TcbKey) -> Option<&Tcb> {
        self.arena.get(key.0)
    }

    pub(crate) fn get_mut(&mut self, key: TcbKey) -> Option<&mut Tcb> {
        self.arena.get_mut(key.0)
    }

    pub(crate) fn remove(&mut self, key: TcbKey) -> Option<Tcb> {
        let tcb = self.arena.remove(key.0)?;
        if self.index.get(&tcb.tuple()) == Some(&key.0) {
            self.index.remove(&tcb.tuple());
        }
        Some(tcb)
    }

    /// Find the record for a segment, degrading towards wildcards.
    ///
    /// Probes the exact tuple first, then clears the remote side, then the
    /// local port, so a full-wildcard listener catches whatever remains.
    pub(crate) fn lookup(&self, raddr: Address, rport: u16, lport: u16) -> Option<TcbKey> {
        let probes = [
            TupleKey { remote_port: rport, local_port: lport, remote_addr: raddr },
            TupleKey { remote_port: 0, local_port: lport, remote_addr: Address::UNSPECIFIED },
            TupleKey { remote_port: 0, local_port: 0, remote_addr: Address::UNSPECIFIED },
        ];

        probes.iter()
            .find_map(|probe| self.index.get(probe))
            .map(|&key| TcbKey(key))
    }

}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sys;

    fn addr(last: u8) -> Address {
        let mut bytes = [0; 16];
        bytes[0] = 0xfe;
        bytes[15] = last;
        Address(bytes)
    }

    fn record(laddr: Address, lport: u16, raddr: Address, rport: u16) -> Tcb {
        Tcb::new(laddr, lport, raddr, rport, sys::now())
    }

    #[test]
    fn exact_and_degraded_lookup() {
        let mut table = ConnTable::new();

        let listener = table.insert(record(Address::UNSPECIFIED, 0, Address::UNSPECIFIED, 0));
        let exact = table.insert(record(addr(1), 80, addr(2), 4000));

        assert_eq!(table.lookup(addr(2), 4000, 80), Some(exact));
        // Unknown tuples degrade to the full-wildcard listener.
        assert_eq!(table.lookup(addr(9), 999, 80), Some(listener));
        assert_eq!(table.lookup(addr(2), 4001, 81), Some(listener));
    }

    #[test]
    fn port_wildcard_preferred_over_full() {
        let mut table = ConnTable::new();

        let any = table.insert(record(Address::UNSPECIFIED, 0, Address::UNSPECIFIED, 0));
        let port80 = table.insert(record(Address::UNSPECIFIED, 80, Address::UNSPECIFIED, 0));

        assert_eq!(table.lookup(addr(5), 1234, 80), Some(port80));
        assert_eq!(table.lookup(addr(5), 1234, 81), Some(any));
    }

    #[test]
    fn removal_clears_index() {
        let mut table = ConnTable::new();
        let key = table.insert(record(addr(1), 80, addr(2), 4000));
        assert!(table.remove(key).is_some());
        assert_eq!(table.lookup(addr(2), 4000, 80), None);
        assert!(table.remove(key).is_none());
        assert!(table.is_empty());
    }

    #[test]
    fn window_arithmetic() {
        let mut tcb = record(addr(1), 80, addr(2), 4000);
        tcb.mss = 1220;
        tcb.snd_una = SeqNumber(1000);
        tcb.snd_nxt = SeqNumber(1000);
        tcb.snd_wnd = 60_000;

        assert_eq!(tcb.window_update(), 1220);
        assert_eq!(tcb.snd_max, SeqNumber(2220));

        // The peer window caps the congestion window.
        tcb.snd_cwnd = 5000;
        tcb.snd_wnd = 2000;
        assert_eq!(tcb.window_update(), 2000);
    }

    #[test]
    fn rto_clamps() {
        let mut tcb = record(addr(1), 80, addr(2), 4000);
        assert_eq!(tcb.rto_millis(), 500);

        tcb.rtt_sample(100);
        assert_eq!(tcb.srtt, 100);
        assert!(tcb.rto_millis() >= 500);

        tcb.srtt = 40_000;
        assert_eq!(tcb.rto_millis(), 30_000);
    }
}
