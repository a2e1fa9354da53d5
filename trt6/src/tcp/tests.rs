//! Protocol engine tests.
//!
//! Segments are injected straight into the demultiplexer over a loopback
//! interface; emitted frames are collected from the loopback's transmit
//! queue. A recording handler stands in for the bridge so notifications can
//! be asserted without any sockets.
use super::*;
use crate::event::Scheduler;
use crate::link::Loopback;
use crate::managed::Arena;
use crate::wire::ipv6;
use crate::wire::tcp::{self as segment, SeqNumber};

const CLIENT: Address = Address([0xfe, 0x80, 0, 0, 0, 0, 0, 0,
                                 0, 0, 0, 0, 0, 0, 0, 0x05]);
const TARGET: Address = Address([0xfe, 0xc0, 0, 0, 0, 0, 0xff, 0xff,
                                 0, 0, 0, 0, 127, 0, 0, 0x01]);
const CLIENT_PORT: u16 = 49152;
const TARGET_PORT: u16 = 8080;

#[derive(Default)]
struct Recorder {
    tokens: Arena<()>,
    incoming: Vec<TcbKey>,
    space: Vec<usize>,
    data: Vec<usize>,
    closed: Vec<bool>,
}

impl SessionHandler for Recorder {
    fn incoming_session(&mut self, mut view: View<'_, Self>, conn: TcbKey) -> Option<AppToken> {
        self.incoming.push(conn);
        view.accept(conn);
        Some(AppToken(self.tokens.insert(())))
    }

    fn send_space_available(&mut self, _: View<'_, Self>, _: AppToken, bytes: usize) {
        self.space.push(bytes);
    }

    fn data_available(&mut self, _: View<'_, Self>, _: AppToken, bytes: usize) {
        self.data.push(bytes);
    }

    fn closing(&mut self, _: View<'_, Self>, _: AppToken, hard: bool) {
        self.closed.push(hard);
    }
}

struct Harness {
    relay: Relay<Recorder>,
    sched: Scheduler<Relay<Recorder>>,
    wire: crate::link::LoopbackHandle,
}

fn harness_listening_on(port: u16) -> Harness {
    let loopback = Loopback::new();
    let wire = loopback.handle();
    let mut relay = Relay::new(Box::new(loopback), Recorder::default());
    relay.tcp.listen(None, port);
    Harness {
        relay,
        sched: Scheduler::new(),
        wire,
    }
}

fn harness() -> Harness {
    harness_listening_on(0)
}

impl Harness {
    fn inject(&mut self, datagram: Vec<u8>) {
        self.relay.handle_packet(&mut self.sched, &datagram);
    }

    /// Run scheduler iterations until no send marker remains armed.
    fn pump(&mut self) {
        let mut rounds = 0;
        while self.sched.has_always() {
            self.sched.step(&mut self.relay);
            rounds += 1;
            assert!(rounds < 256, "send markers never went idle");
        }
    }

    fn view(&mut self) -> View<'_, Recorder> {
        let Relay { tcp, link, .. } = &mut self.relay;
        View {
            sched: &mut self.sched,
            tcp,
            link: link.as_mut(),
        }
    }

    fn conn(&self) -> TcbKey {
        *self.relay.app.incoming.last().expect("no connection spawned")
    }

    fn assert_send_invariants(&self, conn: TcbKey) {
        let t = self.relay.tcp.table.get(conn).expect("connection exists");
        assert!(t.snd_una <= t.snd_nxt, "snd_una {} > snd_nxt {}", t.snd_una, t.snd_nxt);
        assert!(t.snd_nxt <= t.snd_max, "snd_nxt {} > snd_max {}", t.snd_nxt, t.snd_max);
        assert_eq!(t.inbuf.write_seq(), t.rcv_nxt, "receive ring out of step");
    }

    /// Complete the handshake: SYN in, SYN+ACK out, final ACK in.
    ///
    /// Returns the connection key and the server's initial sequence number.
    fn establish(&mut self, client_window: u16) -> (TcbKey, SeqNumber) {
        self.inject(build(CLIENT_ISN, 0, syn(), client_window, &[]));
        let conn = self.conn();
        assert_eq!(self.relay.tcp.state(conn), Some(State::SynReceived));

        self.pump();
        let (_, reply, _) = parse(&self.wire.transmitted().expect("no syn+ack emitted"));
        assert!(reply.flags.syn() && reply.flags.ack());
        let iss = reply.seq_number;

        self.inject(build(CLIENT_ISN + 1, (iss + 1).0, ack(), client_window, &[]));
        assert_eq!(self.relay.tcp.state(conn), Some(State::Established));
        self.assert_send_invariants(conn);
        (conn, iss)
    }
}

const CLIENT_ISN: u32 = 1000;

fn syn() -> Flags {
    let mut flags = Flags::default();
    flags.set_syn(true);
    flags
}

fn ack() -> Flags {
    let mut flags = Flags::default();
    flags.set_ack(true);
    flags
}

fn fin_ack() -> Flags {
    let mut flags = ack();
    flags.set_fin(true);
    flags
}

/// Build a client datagram towards the relay.
fn build(seq: u32, ack: u32, flags: Flags, window: u16, payload: &[u8]) -> Vec<u8> {
    let repr = segment::Repr {
        src_port: CLIENT_PORT,
        dst_port: TARGET_PORT,
        seq_number: SeqNumber(seq),
        ack_number: SeqNumber(ack),
        flags,
        window,
        max_seg_size: None,
    };

    let seg_len = repr.header_len() + payload.len();
    let mut buf = vec![0u8; ipv6::HEADER_LEN + seg_len];

    let ip = ipv6::Repr {
        src_addr: CLIENT,
        dst_addr: TARGET,
        next_header: ipv6::Protocol::Tcp,
        payload_len: seg_len,
        hop_limit: 64,
    };
    ip.emit(&mut ipv6::Packet::new_unchecked(&mut buf[..]));

    let mut seg = segment::Packet::new_unchecked(&mut buf[ipv6::HEADER_LEN..]);
    repr.emit(&mut seg);
    seg.payload_mut()[..payload.len()].copy_from_slice(payload);
    segment::fill_checksum(&mut seg, &CLIENT, &TARGET);

    buf
}

/// Split an emitted frame into its header representations and payload.
fn parse(frame: &[u8]) -> (ipv6::Repr, segment::Repr, Vec<u8>) {
    let ip = ipv6::Packet::new_checked(frame).expect("emitted frame parses");
    let ip_repr = ipv6::Repr::parse(&ip);
    let seg = segment::Packet::new_checked(ip.payload()).expect("emitted segment parses");
    let repr = segment::Repr::parse(&seg).expect("emitted options parse");
    let payload = seg.payload().to_vec();
    (ip_repr, repr, payload)
}

#[test]
fn handshake() {
    let mut h = harness();

    h.inject(build(CLIENT_ISN, 0, syn(), 65535, &[]));
    let conn = h.conn();
    assert_eq!(h.relay.tcp.state(conn), Some(State::SynReceived));
    assert_eq!(h.relay.tcp.remote_endpoint(conn), Some((CLIENT, CLIENT_PORT)));
    assert_eq!(h.relay.tcp.local_endpoint(conn), Some((TARGET, TARGET_PORT)));

    h.pump();
    let (ip, reply, payload) = parse(&h.wire.transmitted().expect("no syn+ack"));
    assert!(payload.is_empty());
    assert_eq!(ip.src_addr, TARGET);
    assert_eq!(ip.dst_addr, CLIENT);
    assert!(reply.flags.syn() && reply.flags.ack());
    assert_eq!(reply.ack_number, SeqNumber(CLIENT_ISN + 1));
    assert_eq!(reply.max_seg_size, Some(1216));
    // The first connection draws the first counter value.
    assert_eq!(reply.seq_number, SeqNumber(1 << 16));

    h.inject(build(CLIENT_ISN + 1, (reply.seq_number + 1).0, ack(), 65535, &[]));
    assert_eq!(h.relay.tcp.state(conn), Some(State::Established));
    h.assert_send_invariants(conn);

    // Establishment reports the whole empty send buffer.
    assert_eq!(h.relay.app.space.last().copied(), Some(16 * 1024));
}

#[test]
fn isn_counter_advances() {
    let mut h = harness();
    h.inject(build(CLIENT_ISN, 0, syn(), 65535, &[]));
    h.pump();
    let (_, first, _) = parse(&h.wire.transmitted().unwrap());

    // A second connection from a different client port.
    let mut other = build(CLIENT_ISN, 0, syn(), 65535, &[]);
    {
        let mut seg = segment::Packet::new_unchecked(&mut other[ipv6::HEADER_LEN..]);
        seg.set_src_port(CLIENT_PORT + 1);
        segment::fill_checksum(&mut seg, &CLIENT, &TARGET);
    }
    h.inject(other);
    h.pump();
    let (_, second, _) = parse(&h.wire.transmitted().unwrap());

    assert!(second.seq_number > first.seq_number);
}

#[test]
fn payload_is_delivered_and_acked() {
    let mut h = harness();
    let (conn, _) = h.establish(65535);

    h.inject(build(CLIENT_ISN + 1, 0, ack(), 65535, b"hello relay"));
    assert_eq!(h.relay.app.data.last().copied(), Some(11));
    h.assert_send_invariants(conn);

    h.pump();
    let (_, reply, payload) = parse(&h.wire.transmitted().expect("no ack emitted"));
    assert!(payload.is_empty());
    assert_eq!(reply.ack_number, SeqNumber(CLIENT_ISN + 1 + 11));

    let mut out = [0u8; 32];
    assert_eq!(h.relay.tcp.peek(conn, &mut out), 11);
    assert_eq!(&out[..11], b"hello relay");

    // Peeking does not consume.
    assert_eq!(h.relay.tcp.peek(conn, &mut out), 11);
    h.view().consume(conn, 11);
    assert_eq!(h.relay.tcp.peek(conn, &mut out), 0);
}

#[test]
fn send_respects_mss_and_window() {
    let mut h = harness();
    // The client advertises exactly one MSS of window.
    let (conn, iss) = h.establish(1220);

    let payload: Vec<u8> = (0..16 * 1024usize).map(|i| i as u8).collect();
    assert_eq!(h.view().send(conn, &payload), 16 * 1024);

    let mut segments = 0usize;
    let mut received = Vec::new();
    let mut expect_seq = iss + 1;
    let mut rounds = 0;

    loop {
        h.pump();
        let mut progressed = false;
        while let Some(frame) = h.wire.transmitted() {
            let (_, repr, data) = parse(&frame);
            assert!(data.len() <= 1220, "segment larger than mss");
            assert_eq!(repr.seq_number, expect_seq, "go-back-n stream out of order");
            if data.is_empty() {
                continue;
            }
            segments += 1;
            progressed = true;
            expect_seq = repr.seq_number + data.len();
            received.extend_from_slice(&data);
            // Acknowledge, keeping the window at one segment.
            h.inject(build(CLIENT_ISN + 1, expect_seq.0, ack(), 1220, &[]));
            h.assert_send_invariants(conn);
        }
        if received.len() >= payload.len() {
            break;
        }
        assert!(progressed, "transfer stalled after {} segments", segments);
        rounds += 1;
        assert!(rounds < 64, "transfer did not finish");
    }

    assert_eq!(received, payload);
    assert!(segments >= (16 * 1024 + 1219) / 1220);
}

#[test]
fn retransmit_rewinds_to_unacknowledged() {
    let mut h = harness();
    let (conn, iss) = h.establish(65535);

    h.view().send(conn, b"important bytes");
    h.pump();

    let (_, first, data) = parse(&h.wire.transmitted().expect("no data segment"));
    assert_eq!(data, b"important bytes");
    assert_eq!(first.seq_number, iss + 1);

    // No acknowledgment arrives within the timeout.
    retransmit_timeout(&mut h.relay, &mut h.sched, conn);
    {
        let t = h.relay.tcp.table.get(conn).unwrap();
        assert_eq!(t.snd_nxt, t.snd_una);
        // The congestion window restarted from one mss.
        assert_eq!(t.snd_max - t.snd_una, 1220);
    }

    h.pump();
    let (_, again, data) = parse(&h.wire.transmitted().expect("no retransmission"));
    assert_eq!(again.seq_number, first.seq_number);
    assert_eq!(data, b"important bytes");
    h.assert_send_invariants(conn);
}

#[test]
fn duplicate_segment_forces_one_ack() {
    let mut h = harness();
    let (conn, _) = h.establish(65535);

    h.inject(build(CLIENT_ISN + 1, 0, ack(), 65535, b"payload"));
    h.pump();
    let _ = h.wire.transmitted().expect("ack for payload");
    let notifications = h.relay.app.data.len();

    // The same segment again: old sequence, no reassembly, answered with a
    // redundant ACK and nothing delivered twice.
    h.inject(build(CLIENT_ISN + 1, 0, ack(), 65535, b"payload"));
    assert_eq!(h.relay.app.data.len(), notifications);
    {
        let t = h.relay.tcp.table.get(conn).unwrap();
        assert_eq!(t.rcv_nxt, SeqNumber(CLIENT_ISN + 1 + 7));
    }

    h.pump();
    let (_, reply, payload) = parse(&h.wire.transmitted().expect("no duplicate ack"));
    assert!(payload.is_empty());
    assert!(reply.flags.ack());
    assert_eq!(reply.ack_number, SeqNumber(CLIENT_ISN + 1 + 7));
}

#[test]
fn unknown_connection_draws_reset() {
    let mut h = harness_listening_on(80);

    // Port 81 matches neither the exact tuple nor any wildcard.
    h.inject(build(5000, 7777, ack(), 512, b"stray"));

    let (ip, reply, _) = parse(&h.wire.transmitted().expect("no reset emitted"));
    assert_eq!(ip.dst_addr, CLIENT);
    assert!(reply.flags.rst() && reply.flags.ack());
    assert_eq!(reply.src_port, TARGET_PORT);
    assert_eq!(reply.dst_port, CLIENT_PORT);
    // Sequence mirrors the offending segment per the reset generation rules.
    assert_eq!(reply.seq_number, SeqNumber(7777));
    assert_eq!(reply.ack_number, SeqNumber(5001));
    assert!(h.relay.app.incoming.is_empty());
}

#[test]
fn peer_fin_closes_both_directions() {
    let mut h = harness();
    let (conn, iss) = h.establish(65535);

    h.inject(build(CLIENT_ISN + 1, (iss + 1).0, fin_ack(), 65535, &[]));

    // The bridge saw an orderly close, not an abort.
    assert_eq!(h.relay.app.closed.as_slice(), &[false]);

    // Our FIN goes out (no half-open support, the whole session closes).
    h.pump();
    let (_, reply, _) = parse(&h.wire.transmitted().expect("no fin emitted"));
    assert!(reply.flags.fin());
    assert_eq!(reply.ack_number, SeqNumber(CLIENT_ISN + 2));
    assert_eq!(h.relay.tcp.state(conn), Some(State::LastAck));

    // The final ACK deletes the record; only the listener remains.
    h.inject(build(CLIENT_ISN + 2, (iss + 2).0, ack(), 65535, &[]));
    assert_eq!(h.relay.tcp.state(conn), None);
    assert_eq!(h.relay.tcp.connections(), 1);
}

#[test]
fn reset_aborts_immediately() {
    let mut h = harness();
    let (conn, _) = h.establish(65535);

    let mut rst = Flags::default();
    rst.set_rst(true);
    h.inject(build(CLIENT_ISN + 1, 0, rst, 65535, &[]));

    assert_eq!(h.relay.app.closed.as_slice(), &[true]);
    assert_eq!(h.relay.tcp.state(conn), None);
    assert_eq!(h.relay.tcp.connections(), 1);
}

#[test]
fn local_close_runs_fin_handshake() {
    let mut h = harness();
    let (conn, iss) = h.establish(65535);

    h.view().close(conn, false);
    assert_eq!(h.relay.tcp.state(conn), Some(State::FinWait1));

    h.pump();
    let (_, reply, _) = parse(&h.wire.transmitted().expect("no fin emitted"));
    assert!(reply.flags.fin());

    // FIN acknowledged: half way closed.
    h.inject(build(CLIENT_ISN + 1, (iss + 2).0, ack(), 65535, &[]));
    assert_eq!(h.relay.tcp.state(conn), Some(State::FinWait2));

    // The peer's own FIN moves the record into its linger period.
    h.inject(build(CLIENT_ISN + 1, (iss + 2).0, fin_ack(), 65535, &[]));
    assert_eq!(h.relay.tcp.state(conn), Some(State::TimeWait));
}

#[test]
fn listener_rejects_non_syn() {
    let mut h = harness();

    // A bare ACK for a connection the listener never saw.
    h.inject(build(4000, 123, ack(), 512, &[]));
    let (_, reply, _) = parse(&h.wire.transmitted().expect("no reset emitted"));
    assert!(reply.flags.rst());
    assert!(h.relay.app.incoming.is_empty());
    assert_eq!(h.relay.tcp.connections(), 1);
}

#[test]
fn zero_window_pauses_sending() {
    let mut h = harness();
    let (conn, _) = h.establish(65535);

    h.view().send(conn, &[0x55; 2048]);
    h.pump();
    while h.wire.transmitted().is_some() {}

    // The peer closes its window entirely.
    let t_nxt = {
        let t = h.relay.tcp.table.get(conn).unwrap();
        t.snd_nxt
    };
    h.inject(build(CLIENT_ISN + 1, t_nxt.0, ack(), 0, &[]));

    h.view().send(conn, &[0xaa; 512]);
    h.pump();
    // Nothing fits the window, nothing is emitted.
    assert_eq!(h.wire.transmitted_len(), 0);

    // The window reopens and transmission resumes by itself with a full
    // segment of the leftover plus the new bytes.
    h.inject(build(CLIENT_ISN + 1, t_nxt.0, ack(), 4096, &[]));
    h.pump();
    let (_, _, payload) = parse(&h.wire.transmitted().expect("window reopen did not resume"));
    assert_eq!(payload.len(), 1220);
}
