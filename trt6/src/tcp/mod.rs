//! The TCP protocol engine.
//!
//! Everything required to speak TCP on the virtual interface lives here:
//! segment intake with wildcard connection lookup, the server-side state
//! machine, segment emission with flow control, and the retransmission and
//! round-trip machinery. The engine never opens connections of its own — the
//! relay only answers inbound connection attempts.
//!
//! Relevant material for reading:
//! Main TCP rfc (skip if confident): https://tools.ietf.org/html/rfc793
//! Errata and comments: https://tools.ietf.org/html/rfc1122#section-4.2
//!
//! ## Structure
//!
//! Connection records are owned by the [`ConnTable`] and referred to by
//! [`TcbKey`] everywhere else — timers, send markers and bridge sessions all
//! hold keys, never references, so a record can be deleted from within any
//! callback. The application side of a connection is addressed through the
//! [`SessionHandler`] callback set; the engine stores the handler's
//! [`AppToken`] in the record and hands it back with every notification.
//!
//! ## Emission
//!
//! Outgoing segments are not written directly from the intake path. Instead
//! a per-iteration send marker is armed whenever buffered data, an opened
//! window, a pending FIN or a forced acknowledgement exists; the marker
//! emits one segment per scheduler iteration and keeps itself registered
//! while more can be sent. At most one marker per connection is armed at a
//! time.
//!
//! ## Retransmission
//!
//! Go-back-N: on a retransmit timeout `snd_nxt` rewinds to `snd_una` and the
//! congestion window restarts from one MSS. The retransmitted range is
//! excluded from round-trip sampling so a retransmission cannot corrupt the
//! estimate. Retries are unbounded; an unresponsive peer keeps its record
//! until it answers or resets.
use log::{debug, info, trace, warn};

use crate::event::{Interest, Reschedule, Scheduler};
use crate::link::LinkInterface;
use crate::sys;
use crate::time::Duration;
use crate::wire::ipv6::{self, Address};
use crate::wire::tcp::{self, Flags, SeqNumber};
use crate::Relay;

mod tcb;
#[cfg(test)]
mod tests;

pub use tcb::{AppToken, ConnTable, State, TcbKey};
use tcb::Tcb;

/// Largest payload placed in one segment.
pub(crate) const MSS: u32 = 1220;

/// Maximum segment size advertised in our SYN+ACK.
const ADVERTISED_MSS: u16 = 1216;

/// Hop limit of emitted datagrams.
const HOP_LIMIT: u8 = 64;

/// How long a TIME_WAIT record lingers before deletion.
const TIME_WAIT_DELAY: Duration = Duration::from_secs(120);

/// Receive window forced open on local close so in-flight data drains.
const DRAIN_WINDOW: u32 = 1000;

/// Initial sequence number generator.
///
/// A monotonically increasing counter, deliberately not cryptographically
/// unpredictable: the relay sits on a private virtual interface.
struct IsnGenerator {
    counter: u32,
}

impl IsnGenerator {
    fn next_isn(&mut self) -> SeqNumber {
        self.counter = self.counter.wrapping_add(1);
        SeqNumber(self.counter << 16)
    }
}

/// The engine: connection table plus initial sequence number state.
pub struct Engine {
    pub(crate) table: ConnTable,
    isn: IsnGenerator,
}

/// The callback set a collaborator provides when listening.
///
/// Handler methods receive a [`View`] of the engine and its collaborators,
/// so a notification may call back into engine operations directly — an
/// incoming-session handler typically calls [`View::accept`] (or
/// [`View::close`]) before it returns.
///
/// [`View`]: struct.View.html
/// [`View::accept`]: struct.View.html#method.accept
/// [`View::close`]: struct.View.html#method.close
pub trait SessionHandler: Sized + 'static {
    /// A connection request arrived on a listener.
    ///
    /// The returned token is stored in the record and passed back with every
    /// later notification. Returning `None` detaches the connection: payload
    /// is then discarded and no further notifications are raised.
    fn incoming_session(&mut self, view: View<'_, Self>, conn: TcbKey) -> Option<AppToken>;

    /// Space opened up in the send buffer; `bytes` may now be written.
    fn send_space_available(&mut self, view: View<'_, Self>, app: AppToken, bytes: usize);

    /// Payload arrived; `bytes` can be read out of the receive buffer.
    fn data_available(&mut self, view: View<'_, Self>, app: AppToken, bytes: usize);

    /// The connection is going away. `hard` distinguishes an abortive reset
    /// from an orderly close.
    fn closing(&mut self, view: View<'_, Self>, app: AppToken, hard: bool);
}

/// Mutable view of the engine and the collaborators an operation may touch.
pub struct View<'a, H: SessionHandler> {
    /// The scheduler, for arming markers and timers.
    pub sched: &'a mut Scheduler<Relay<H>>,
    /// The engine itself.
    pub tcp: &'a mut Engine,
    /// The interface datagrams are emitted through.
    pub link: &'a mut dyn LinkInterface,
}

impl Engine {
    /// Create an engine with an empty connection table.
    pub fn new() -> Engine {
        Engine {
            table: ConnTable::new(),
            isn: IsnGenerator { counter: 0 },
        }
    }

    /// Create a listening record.
    ///
    /// The record is a template: a matching SYN spawns a fresh connection
    /// and the listener stays in place. An unspecified address and zero port
    /// accept any destination, which is how the relay catches traffic for
    /// the whole translation prefix.
    pub fn listen(&mut self, laddr: Option<Address>, lport: u16) -> TcbKey {
        let mut tcb = Tcb::new(
            laddr.unwrap_or(Address::UNSPECIFIED),
            lport,
            Address::UNSPECIFIED,
            0,
            sys::now(),
        );
        tcb.state = State::Listen;
        info!("listening on port {}", lport);
        self.table.insert(tcb)
    }

    /// Number of records, listeners included.
    pub fn connections(&self) -> usize {
        self.table.len()
    }

    /// Current state of a connection.
    pub fn state(&self, conn: TcbKey) -> Option<State> {
        self.table.get(conn).map(|t| t.state)
    }

    /// Local (translated destination) address and port.
    pub fn local_endpoint(&self, conn: TcbKey) -> Option<(Address, u16)> {
        self.table.get(conn).map(|t| (t.laddr, t.lport))
    }

    /// Remote (IPv6 client) address and port.
    pub fn remote_endpoint(&self, conn: TcbKey) -> Option<(Address, u16)> {
        self.table.get(conn).map(|t| (t.raddr, t.rport))
    }

    /// Free space in the send buffer.
    pub fn output_space(&self, conn: TcbKey) -> usize {
        self.table.get(conn).map_or(0, |t| t.outbuf.left())
    }

    /// Received bytes ready to be read.
    pub fn readable(&self, conn: TcbKey) -> usize {
        self.table.get(conn).map_or(0, |t| {
            (t.inbuf.write_seq() - t.read_seq).max(0) as usize
        })
    }

    /// Copy received bytes into `buf` without consuming them.
    ///
    /// Follow up with [`View::consume`] for however much was actually
    /// processed; unconsumed bytes are returned again by the next call.
    ///
    /// [`View::consume`]: struct.View.html#method.consume
    pub fn peek(&self, conn: TcbKey, buf: &mut [u8]) -> usize {
        match self.table.get(conn) {
            Some(t) => {
                let avail = (t.inbuf.write_seq() - t.read_seq).max(0) as usize;
                let want = avail.min(buf.len());
                t.inbuf.read(t.read_seq, &mut buf[..want])
            }
            None => 0,
        }
    }
}

impl Default for Engine {
    fn default() -> Self {
        Engine::new()
    }
}

impl<'a, H: SessionHandler> View<'a, H> {
    /// Accept a connection in SYN_RECVD, starting the handshake answer.
    pub fn accept(&mut self, conn: TcbKey) {
        mark_for_send(self.sched, self.tcp, conn);
    }

    /// Queue payload for transmission; returns the count actually buffered.
    pub fn send(&mut self, conn: TcbKey, data: &[u8]) -> usize {
        let written = match self.tcp.table.get_mut(conn) {
            Some(t) => {
                let written = t.outbuf.write(data);
                if t.window_size() <= 0 {
                    return written;
                }
                written
            }
            None => return 0,
        };
        mark_for_send(self.sched, self.tcp, conn);
        written
    }

    /// Consume `count` bytes previously returned by [`Engine::peek`].
    ///
    /// Reopening a receive buffer that had filled up forces a window update
    /// segment so the peer learns it may transmit again.
    ///
    /// [`Engine::peek`]: struct.Engine.html#method.peek
    pub fn consume(&mut self, conn: TcbKey, count: usize) {
        let blocked = match self.tcp.table.get_mut(conn) {
            Some(t) => {
                let blocked = t.inbuf.left() == 0;
                t.read_seq += count;
                t.inbuf.advance(t.read_seq);
                t.rcv_wnd = t.inbuf.left() as u32;
                if blocked {
                    t.force_ack = true;
                }
                blocked
            }
            None => return,
        };
        if blocked {
            mark_for_send(self.sched, self.tcp, conn);
        }
    }

    /// Close a connection.
    ///
    /// A hard close (or any close of a half-open SYN_RECVD record) emits an
    /// RST and deletes the record immediately. An orderly close stops
    /// notifications, forces the receive window open so in-flight data
    /// drains, and hands the record to the FIN exchange.
    pub fn close(&mut self, conn: TcbKey, hard: bool) {
        close_conn(self.sched, self.tcp, self.link, conn, hard);
    }
}

fn mark_for_send<H: SessionHandler>(
    sched: &mut Scheduler<Relay<H>>,
    tcp: &mut Engine,
    conn: TcbKey,
) {
    let t = match tcp.table.get_mut(conn) {
        Some(t) => t,
        None => return,
    };
    if t.e_send.is_some() {
        return;
    }
    let id = sched.always(move |sched, relay: &mut Relay<H>, _| {
        emit_pending(relay, sched, conn)
    });
    t.e_send = Some(id);
}

fn set_timeout<H: SessionHandler>(
    sched: &mut Scheduler<Relay<H>>,
    t: &mut Tcb,
    conn: TcbKey,
) {
    let rto = Duration::from_millis(t.rto_millis() as u64);
    t.e_timer = Some(sched.timer_after(rto, move |sched, relay: &mut Relay<H>, _| {
        retransmit_timeout(relay, sched, conn)
    }));
    t.timeout_mark = t.snd_nxt;
    trace!("retransmit timer set for {}", t.timeout_mark);
}

fn enter_time_wait<H: SessionHandler>(
    sched: &mut Scheduler<Relay<H>>,
    t: &mut Tcb,
    conn: TcbKey,
) {
    if let Some(id) = t.e_timer.take() {
        sched.cancel(id);
    }
    t.state = State::TimeWait;
    t.e_timer = Some(sched.timer_after(TIME_WAIT_DELAY, move |sched, relay: &mut Relay<H>, _| {
        time_wait_expired(relay, sched, conn);
        Reschedule::Done
    }));
}

fn delete<H: SessionHandler>(
    sched: &mut Scheduler<Relay<H>>,
    tcp: &mut Engine,
    conn: TcbKey,
) {
    if let Some(tcb) = tcp.table.remove(conn) {
        if let Some(id) = tcb.e_send {
            sched.cancel(id);
        }
        if let Some(id) = tcb.e_timer {
            sched.cancel(id);
        }
        debug!(
            "removed connection {} port {} after {} packets",
            tcb.raddr, tcb.rport, tcb.packets);
    }
}

fn close_conn<H: SessionHandler>(
    sched: &mut Scheduler<Relay<H>>,
    tcp: &mut Engine,
    link: &mut dyn LinkInterface,
    conn: TcbKey,
    hard: bool,
) {
    let t = match tcp.table.get_mut(conn) {
        Some(t) => t,
        None => return,
    };
    debug!("closing connection to port {} ({})", t.rport,
        if hard { "hard" } else { "orderly" });

    if hard || t.state == State::SynReceived {
        send_rst(link, t);
        delete(sched, tcp, conn);
        return;
    }

    t.app = None;
    t.rcv_wnd = DRAIN_WINDOW;
    t.state = if t.state == State::Established {
        State::FinWait1
    } else {
        State::LastAck
    };
    mark_for_send(sched, tcp, conn);
}

fn retransmit_timeout<H: SessionHandler>(
    relay: &mut Relay<H>,
    sched: &mut Scheduler<Relay<H>>,
    conn: TcbKey,
) -> Reschedule {
    {
        let t = match relay.tcp.table.get_mut(conn) {
            Some(t) => t,
            None => return Reschedule::Done,
        };
        debug!("retransmit timeout on port {}, rewinding to {}", t.rport, t.snd_una);
        t.e_timer = None;
        t.snd_nxt = t.snd_una;
        // Lost packets must not contribute round-trip samples.
        t.rtt_mark = t.snd_una - 1usize;
        t.snd_cwnd = 0;
        t.window_update();
    }
    mark_for_send(sched, &mut relay.tcp, conn);
    Reschedule::Done
}

fn time_wait_expired<H: SessionHandler>(
    relay: &mut Relay<H>,
    sched: &mut Scheduler<Relay<H>>,
    conn: TcbKey,
) {
    delete(sched, &mut relay.tcp, conn);
}

fn notify_incoming<H: SessionHandler>(
    relay: &mut Relay<H>,
    sched: &mut Scheduler<Relay<H>>,
    conn: TcbKey,
) -> Option<AppToken> {
    let Relay { tcp, link, app } = relay;
    app.incoming_session(View { sched, tcp, link: link.as_mut() }, conn)
}

fn notify_space<H: SessionHandler>(
    relay: &mut Relay<H>,
    sched: &mut Scheduler<Relay<H>>,
    token: AppToken,
    bytes: usize,
) {
    let Relay { tcp, link, app } = relay;
    app.send_space_available(View { sched, tcp, link: link.as_mut() }, token, bytes);
}

fn notify_data<H: SessionHandler>(
    relay: &mut Relay<H>,
    sched: &mut Scheduler<Relay<H>>,
    token: AppToken,
    bytes: usize,
) {
    let Relay { tcp, link, app } = relay;
    app.data_available(View { sched, tcp, link: link.as_mut() }, token, bytes);
}

fn notify_closing<H: SessionHandler>(
    relay: &mut Relay<H>,
    sched: &mut Scheduler<Relay<H>>,
    token: AppToken,
    hard: bool,
) {
    let Relay { tcp, link, app } = relay;
    app.closing(View { sched, tcp, link: link.as_mut() }, token, hard);
}

/// Process one TCP segment delivered by the demultiplexer.
pub(crate) fn segment_arrives<H: SessionHandler>(
    relay: &mut Relay<H>,
    sched: &mut Scheduler<Relay<H>>,
    ip: &ipv6::Repr,
    segment: &[u8],
) {
    let packet = match tcp::Packet::new_checked(segment) {
        Ok(packet) => packet,
        Err(err) => {
            debug!("dropping tcp segment: {}", err);
            return;
        }
    };
    let repr = match tcp::Repr::parse(&packet) {
        Ok(repr) => repr,
        Err(err) => {
            debug!("dropping tcp segment: {}", err);
            return;
        }
    };
    let payload = packet.payload();

    let conn = match relay.tcp.table.lookup(ip.src_addr, repr.src_port, repr.dst_port) {
        Some(conn) => conn,
        None => {
            warn!("no matching connection for port {}", repr.dst_port);
            fabricate_rst(relay.link.as_mut(), ip, &repr);
            return;
        }
    };

    let state = {
        let t = match relay.tcp.table.get_mut(conn) {
            Some(t) => t,
            None => return,
        };
        t.last_activity = sys::now();
        trace!(
            "port {} seq={} ack={} state={} len={}",
            repr.src_port, repr.seq_number, repr.ack_number, t.state, payload.len());
        t.state
    };

    if state == State::Listen {
        if repr.flags.basic() == 0x02 {
            accept_on_listener(relay, sched, ip, &repr);
        } else {
            fabricate_rst(relay.link.as_mut(), ip, &repr);
        }
        return;
    }

    if repr.flags.rst() {
        debug!("connection to port {} reset by peer", repr.src_port);
        let token = relay.tcp.table.get(conn).and_then(|t| t.app);
        if let Some(token) = token {
            notify_closing(relay, sched, token, true);
        }
        delete(sched, &mut relay.tcp, conn);
        return;
    }

    if repr.flags.ack() {
        match process_ack(relay, sched, conn, &repr) {
            AckOutcome::Continue => (),
            AckOutcome::Stop => return,
        }
    }

    // Duplicates and keepalives force one immediate redundant ACK; there is
    // no out-of-order reassembly, so anything older than rcv_nxt was seen.
    {
        let t = match relay.tcp.table.get_mut(conn) {
            Some(t) => t,
            None => return,
        };
        if repr.seq_number < t.rcv_nxt {
            if t.state != State::SynReceived {
                debug!("acknowledging duplicate segment on port {}", t.rport);
                t.force_ack = true;
                mark_for_send(sched, &mut relay.tcp, conn);
            }
            return;
        }

        // Start sending again if the peer window went from zero to nonzero.
        t.snd_wnd = repr.window as u32;
        let reopened = if t.window_size() <= 0 {
            t.window_update() > 0
        } else {
            t.window_update();
            false
        };
        if reopened {
            debug!("send window to port {} reopened", t.rport);
            mark_for_send(sched, &mut relay.tcp, conn);
        }
    }

    match relay.tcp.table.get(conn).map(|t| t.state) {
        Some(State::FinWait2) => {
            if recv_data(relay, sched, conn, &repr, payload) {
                debug!("connection to port {} closed", repr.src_port);
                if let Some(t) = relay.tcp.table.get_mut(conn) {
                    enter_time_wait(sched, t, conn);
                }
            }
        }
        Some(State::FinWait1) => {
            if recv_data(relay, sched, conn, &repr, payload) {
                if let Some(t) = relay.tcp.table.get_mut(conn) {
                    t.state = State::Closing;
                }
            }
        }
        Some(State::Established) => {
            if recv_data(relay, sched, conn, &repr, payload) {
                // No half-open support: the peer closing its direction takes
                // the whole session down.
                let token = match relay.tcp.table.get_mut(conn) {
                    Some(t) => {
                        t.state = State::CloseWait;
                        t.app
                    }
                    None => return,
                };
                if let Some(token) = token {
                    notify_closing(relay, sched, token, false);
                }
                close_conn(sched, &mut relay.tcp, relay.link.as_mut(), conn, false);
            }
        }
        _ => (),
    }
}

fn accept_on_listener<H: SessionHandler>(
    relay: &mut Relay<H>,
    sched: &mut Scheduler<Relay<H>>,
    ip: &ipv6::Repr,
    repr: &tcp::Repr,
) {
    let now = sys::now();
    let mut t = Tcb::new(ip.dst_addr, repr.dst_port, ip.src_addr, repr.src_port, now);

    t.state = State::SynReceived;
    t.irs = repr.seq_number;
    t.rcv_wnd = t.inbuf.left() as u32;
    t.rcv_nxt = repr.seq_number + 1;
    t.read_seq = t.rcv_nxt;
    t.last_acked = t.rcv_nxt;
    t.inbuf.set(t.rcv_nxt);

    let iss = relay.tcp.isn.next_isn();
    t.iss = iss;
    t.snd_una = iss;
    t.snd_nxt = iss;
    t.rtt_mark = iss - 1usize;
    t.rtt_limit = iss + 1;
    // The SYN occupies one sequence slot in front of the buffered stream.
    t.outbuf.set(iss + 1);

    t.mss = MSS;
    t.snd_cwnd = 0;
    t.snd_wnd = repr.window as u32;
    t.window_update();

    debug!(
        "connection request from {} port {} for {} port {}, iss={}",
        t.raddr, t.rport, t.laddr, t.lport, iss);

    let conn = relay.tcp.table.insert(t);

    // The handler may call accept directly, or even close immediately.
    let token = notify_incoming(relay, sched, conn);
    if let Some(t) = relay.tcp.table.get_mut(conn) {
        t.app = token;
    }
}

enum AckOutcome {
    Continue,
    Stop,
}

fn process_ack<H: SessionHandler>(
    relay: &mut Relay<H>,
    sched: &mut Scheduler<Relay<H>>,
    conn: TcbKey,
    repr: &tcp::Repr,
) -> AckOutcome {
    let ack = repr.ack_number;
    let now = sys::now();

    let mut space_update = None;
    let mut delete_now = false;
    let mut outcome = AckOutcome::Continue;

    {
        let t = match relay.tcp.table.get_mut(conn) {
            Some(t) => t,
            None => return AckOutcome::Stop,
        };

        if ack > t.snd_una {
            if t.snd_una <= t.rtt_mark && ack > t.rtt_mark {
                let sample = t.rtt_time.millis_until(now);
                t.rtt_sample(sample);
                trace!("rtt={}ms srtt={}ms dev={}ms", sample, t.srtt, t.sdev);
            }

            t.snd_una = ack;
            if ack > t.snd_nxt {
                t.snd_nxt = ack;
            }

            if t.state == State::Established {
                t.outbuf.advance(ack);
                if let Some(token) = t.app {
                    space_update = Some((token, t.outbuf.left()));
                }
            }

            match t.state {
                State::Established
                | State::FinWait1
                | State::Closing
                | State::LastAck => {
                    if t.e_timer.is_some() && ack >= t.timeout_mark {
                        if let Some(id) = t.e_timer.take() {
                            sched.cancel(id);
                        }
                        if t.snd_una < t.snd_nxt {
                            set_timeout(sched, t, conn);
                        }
                        trace!("retransmit timer reset on port {}", t.rport);
                        // A fully acknowledged window grows the congestion
                        // window by one MSS. Additive only, no slow start.
                        t.snd_cwnd += t.mss;
                    }
                }
                _ => (),
            }
        }

        if t.snd_una == t.snd_nxt {
            match t.state {
                State::SynReceived => {
                    t.state = State::Established;
                    debug!("connection from {} port {} accepted", t.raddr, t.rport);
                    if let Some(token) = t.app {
                        space_update = Some((token, t.outbuf.left()));
                    }
                }
                State::LastAck => {
                    debug!("connection to port {} closed", t.rport);
                    delete_now = true;
                    outcome = AckOutcome::Stop;
                }
                State::FinWait1 => {
                    if t.outbuf.write_seq() - t.snd_nxt == -1 {
                        t.state = State::FinWait2;
                    }
                }
                State::Closing => {
                    if t.outbuf.write_seq() - t.snd_nxt == -1 {
                        enter_time_wait(sched, t, conn);
                    }
                    outcome = AckOutcome::Stop;
                }
                _ => (),
            }
        }
    }

    if delete_now {
        delete(sched, &mut relay.tcp, conn);
        return AckOutcome::Stop;
    }

    if let Some((token, bytes)) = space_update {
        notify_space(relay, sched, token, bytes);
        if relay.tcp.table.get(conn).is_none() {
            return AckOutcome::Stop;
        }
    }

    outcome
}

/// Append in-order payload and process a FIN; returns whether a FIN was
/// consumed.
fn recv_data<H: SessionHandler>(
    relay: &mut Relay<H>,
    sched: &mut Scheduler<Relay<H>>,
    conn: TcbKey,
    repr: &tcp::Repr,
    payload: &[u8],
) -> bool {
    let mut available = None;
    let mut ack_needed = false;
    let mut fin = false;

    {
        let t = match relay.tcp.table.get_mut(conn) {
            Some(t) => t,
            None => return false,
        };

        if !payload.is_empty() {
            ack_needed = true;
            match t.app {
                Some(token) => {
                    let written = t.inbuf.write(payload);
                    if written < payload.len() {
                        debug!(
                            "peer on port {} overran the receive window by {} bytes",
                            t.rport, payload.len() - written);
                    }
                    t.rcv_nxt += written;
                    t.rcv_wnd = t.inbuf.left() as u32;
                    available = Some((token, (t.inbuf.write_seq() - t.read_seq).max(0) as usize));
                }
                None => {
                    // Nobody is reading; the payload is acknowledged and
                    // discarded.
                    t.rcv_nxt += payload.len();
                    t.inbuf.advance(t.rcv_nxt);
                    t.read_seq = t.rcv_nxt;
                }
            }
        }

        if repr.flags.fin() {
            t.rcv_nxt += 1;
            ack_needed = true;
            fin = true;
        }
    }

    if ack_needed {
        mark_for_send(sched, &mut relay.tcp, conn);
    }
    if let Some((token, bytes)) = available {
        notify_data(relay, sched, token, bytes);
    }

    fin
}

/// Service the send marker of one connection: emit at most one segment.
fn emit_pending<H: SessionHandler>(
    relay: &mut Relay<H>,
    sched: &mut Scheduler<Relay<H>>,
    conn: TcbKey,
) -> Interest {
    let Relay { tcp, link, .. } = relay;
    let t = match tcp.table.get_mut(conn) {
        Some(t) => t,
        None => return Interest::Done,
    };

    if t.state == State::SynReceived {
        send_syn_ack(link.as_mut(), t);
        t.e_send = None;
        return Interest::Done;
    }

    if send_and_ack(sched, link.as_mut(), t, conn) {
        Interest::Keep
    } else {
        t.e_send = None;
        Interest::Done
    }
}

/// Emit one data/ACK segment; returns whether another can follow.
fn send_and_ack<H: SessionHandler>(
    sched: &mut Scheduler<Relay<H>>,
    link: &mut dyn LinkInterface,
    t: &mut Tcb,
    conn: TcbKey,
) -> bool {
    let wnd = t.window_size();
    let mut payload = [0u8; MSS as usize];
    let mut len = 0usize;
    let mut flags = Flags::default();
    flags.set_ack(true);

    if wnd > 0 {
        let avail = t.outbuf.write_seq() - t.snd_nxt;
        if avail > 0 {
            let want = (avail as usize).min(t.mss as usize).min(wnd as usize);
            len = t.outbuf.read(t.snd_nxt, &mut payload[..want]);
            if t.outbuf.write_seq() - (t.snd_nxt + len) == 0 {
                flags.set_psh(true);
            }
        }

        // With room left in the window and the buffer drained, a closing
        // connection appends its FIN.
        let drained = t.outbuf.write_seq() - (t.snd_nxt + len) == 0;
        let wants_fin = match t.state {
            State::FinWait1 | State::Closing | State::LastAck => true,
            _ => false,
        };
        if (len as i32) < wnd && drained && wants_fin {
            flags.set_fin(true);
        }
    } else {
        trace!("no data to send on port {}, window is zero", t.rport);
    }

    if len == 0 && !flags.fin() && !t.force_ack && t.last_acked == t.rcv_nxt {
        trace!("send marker on port {} found nothing to do", t.rport);
        return false;
    }

    if t.e_timer.is_none() && len > 0 {
        set_timeout(sched, t, conn);
    }

    if len > 0 && t.rtt_mark < t.snd_una && t.snd_nxt >= t.rtt_limit {
        t.rtt_mark = t.snd_nxt;
        t.rtt_time = sys::now();
        trace!("sampling round trip at {}", t.rtt_mark);
    }

    trace!(
        "sending to port {} seq={} ack={} len={} fin={}",
        t.rport, t.snd_nxt, t.rcv_nxt, len, flags.fin());

    emit_segment(link, t, flags, &payload[..len], None);

    t.snd_nxt += len;
    if flags.fin() {
        t.snd_nxt += 1;
    }
    if t.rtt_limit < t.snd_nxt {
        t.rtt_limit = t.snd_nxt;
    }

    let wnd = t.window_size();
    let avail = t.outbuf.write_seq() - t.snd_nxt;
    match t.state {
        State::Established => wnd > 0 && avail > 0,
        State::FinWait1 | State::Closing | State::LastAck => wnd > 0 && avail > -1,
        _ => false,
    }
}

fn send_syn_ack(link: &mut dyn LinkInterface, t: &mut Tcb) {
    let mut flags = Flags::default();
    flags.set_syn(true);
    flags.set_ack(true);

    debug!(
        "sending syn+ack to port {} seq={} ack={}",
        t.rport, t.snd_nxt, t.rcv_nxt);

    emit_segment(link, t, flags, &[], Some(ADVERTISED_MSS));
    t.snd_nxt += 1;
}

fn send_rst(link: &mut dyn LinkInterface, t: &mut Tcb) {
    let mut flags = Flags::default();
    flags.set_rst(true);
    flags.set_ack(true);

    debug!("sending reset to port {}", t.rport);
    emit_segment(link, t, flags, &[], None);
}

/// Build one IPv6/TCP segment for `t` and hand it to the link.
fn emit_segment(
    link: &mut dyn LinkInterface,
    t: &mut Tcb,
    flags: Flags,
    payload: &[u8],
    max_seg_size: Option<u16>,
) {
    let repr = tcp::Repr {
        src_port: t.lport,
        dst_port: t.rport,
        seq_number: t.snd_nxt,
        ack_number: t.rcv_nxt,
        flags,
        window: t.rcv_wnd.min(0xffff) as u16,
        max_seg_size,
    };

    let segment_len = repr.header_len() + payload.len();
    let total = ipv6::HEADER_LEN + segment_len;

    let mut pkt = link.get_buffer(total);
    {
        let buf = pkt.payload_mut();

        let ip = ipv6::Repr {
            src_addr: t.laddr,
            dst_addr: t.raddr,
            next_header: ipv6::Protocol::Tcp,
            payload_len: segment_len,
            hop_limit: HOP_LIMIT,
        };
        ip.emit(&mut ipv6::Packet::new_unchecked(&mut buf[..total]));

        let mut segment = tcp::Packet::new_unchecked(&mut buf[ipv6::HEADER_LEN..total]);
        repr.emit(&mut segment);
        segment.payload_mut()[..payload.len()].copy_from_slice(payload);
        tcp::fill_checksum(&mut segment, &t.laddr, &t.raddr);
    }
    pkt.set_len(total);

    if let Err(err) = link.send_unicast(pkt) {
        warn!("transmit to port {} failed: {}", t.rport, err);
    }

    t.last_acked = t.rcv_nxt;
    t.force_ack = false;
    t.packets += 1;
}

/// Answer a segment that matched no connection with a fabricated reset.
fn fabricate_rst(link: &mut dyn LinkInterface, ip: &ipv6::Repr, offending: &tcp::Repr) {
    info!("sending reset for unknown connection, port {}", offending.dst_port);

    let mut flags = Flags::default();
    flags.set_rst(true);
    flags.set_ack(true);

    let repr = tcp::Repr {
        src_port: offending.dst_port,
        dst_port: offending.src_port,
        seq_number: offending.ack_number,
        ack_number: offending.seq_number + 1,
        flags,
        window: 0,
        max_seg_size: None,
    };

    let total = ipv6::HEADER_LEN + repr.header_len();
    let mut pkt = link.get_buffer(total);
    {
        let buf = pkt.payload_mut();

        let header = ipv6::Repr {
            src_addr: ip.dst_addr,
            dst_addr: ip.src_addr,
            next_header: ipv6::Protocol::Tcp,
            payload_len: repr.header_len(),
            hop_limit: HOP_LIMIT,
        };
        header.emit(&mut ipv6::Packet::new_unchecked(&mut buf[..total]));

        let mut segment = tcp::Packet::new_unchecked(&mut buf[ipv6::HEADER_LEN..total]);
        repr.emit(&mut segment);
        tcp::fill_checksum(&mut segment, &ip.dst_addr, &ip.src_addr);
    }
    pkt.set_len(total);

    if let Err(err) = link.send_unicast(pkt) {
        warn!("transmit of reset failed: {}", err);
    }
}
