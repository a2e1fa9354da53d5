//! End-to-end bridge test.
//!
//! A fake IPv6 client speaks TCP to the relay over the loopback interface
//! driver while a real IPv4 listener on 127.0.0.1 plays the destination.
//! Payload must come out on the socket exactly as sent over the virtual
//! wire, and the other way around.
use std::io::{Read, Write};
use std::net::TcpListener;

use trt6::event::{Reschedule, Scheduler};
use trt6::link::Loopback;
use trt6::relay::TcpRelay;
use trt6::time::Duration;
use trt6::wire::ipv6;
use trt6::wire::tcp::{self, Flags, SeqNumber};
use trt6::{Relay, Sched};

const CLIENT: ipv6::Address = ipv6::Address([0xfe, 0x80, 0, 0, 0, 0, 0, 0,
                                             0, 0, 0, 0, 0, 0, 0, 0x05]);
const CLIENT_PORT: u16 = 52000;
const CLIENT_ISN: u32 = 7000;

/// The translated destination: the prefix carries 127.0.0.1 in its tail.
fn target_addr() -> ipv6::Address {
    let mut bytes = [0u8; 16];
    bytes[..8].copy_from_slice(&[0xfe, 0xc0, 0, 0, 0, 0, 0xff, 0xff]);
    bytes[12..].copy_from_slice(&[127, 0, 0, 1]);
    ipv6::Address(bytes)
}

fn build(target: ipv6::Address, port: u16, seq: u32, ack: u32, flags: Flags, payload: &[u8]) -> Vec<u8> {
    let repr = tcp::Repr {
        src_port: CLIENT_PORT,
        dst_port: port,
        seq_number: SeqNumber(seq),
        ack_number: SeqNumber(ack),
        flags,
        window: 65535,
        max_seg_size: None,
    };

    let seg_len = repr.header_len() + payload.len();
    let mut buf = vec![0u8; ipv6::HEADER_LEN + seg_len];

    let ip = ipv6::Repr {
        src_addr: CLIENT,
        dst_addr: target,
        next_header: ipv6::Protocol::Tcp,
        payload_len: seg_len,
        hop_limit: 64,
    };
    ip.emit(&mut ipv6::Packet::new_unchecked(&mut buf[..]));

    let mut seg = tcp::Packet::new_unchecked(&mut buf[ipv6::HEADER_LEN..]);
    repr.emit(&mut seg);
    seg.payload_mut()[..payload.len()].copy_from_slice(payload);
    tcp::fill_checksum(&mut seg, &CLIENT, &target);

    buf
}

fn parse(frame: &[u8]) -> (tcp::Repr, Vec<u8>) {
    let ip = ipv6::Packet::new_checked(frame).expect("relay emitted a valid datagram");
    let seg = tcp::Packet::new_checked(ip.payload()).expect("relay emitted a valid segment");
    let repr = tcp::Repr::parse(&seg).expect("relay emitted valid options");
    (repr, seg.payload().to_vec())
}

fn flags(syn: bool, ack: bool, fin: bool) -> Flags {
    let mut flags = Flags::default();
    flags.set_syn(syn);
    flags.set_ack(ack);
    flags.set_fin(fin);
    flags
}

/// Step the scheduler until the wire yields a frame.
fn wait_for_frame(
    sched: &mut Sched<TcpRelay>,
    relay: &mut Relay<TcpRelay>,
    wire: &trt6::link::LoopbackHandle,
) -> Vec<u8> {
    for _ in 0..400 {
        if let Some(frame) = wire.transmitted() {
            return frame;
        }
        sched.step(relay);
    }
    panic!("relay never emitted a frame");
}

#[test]
fn relays_payload_both_ways() {
    let listener = TcpListener::bind("127.0.0.1:0").expect("bind destination listener");
    listener.set_nonblocking(true).expect("nonblocking listener");
    let port = listener.local_addr().unwrap().port();
    let target = target_addr();

    let loopback = Loopback::new();
    let wire = loopback.handle();
    let mut relay = Relay::new(Box::new(loopback), TcpRelay::new());
    relay.tcp.listen(None, 0);

    let mut sched: Sched<TcpRelay> = Scheduler::new();
    // A heartbeat keeps every iteration's readiness wait short, so the test
    // can interleave socket polling with scheduler steps.
    sched.timer_after(Duration::from_millis(5), |_, _: &mut Relay<TcpRelay>, _| {
        Reschedule::After(Duration::from_millis(5))
    });

    // Connection request: the bridge dials 127.0.0.1 behind the scenes.
    relay.handle_packet(&mut sched, &build(target, port, CLIENT_ISN, 0, flags(true, false, false), &[]));
    assert_eq!(relay.app.session_count(), 1);

    // The destination accepts while the relay completes its connect.
    let mut server = None;
    for _ in 0..400 {
        sched.step(&mut relay);
        match listener.accept() {
            Ok((stream, _)) => {
                server = Some(stream);
                break;
            }
            Err(ref err) if err.kind() == std::io::ErrorKind::WouldBlock => continue,
            Err(err) => panic!("accept failed: {}", err),
        }
    }
    let mut server = server.expect("destination never saw the connection");
    server.set_nonblocking(true).unwrap();

    // Once the socket is up the relay answers the handshake.
    let (syn_ack, _) = parse(&wait_for_frame(&mut sched, &mut relay, &wire));
    assert!(syn_ack.flags.syn() && syn_ack.flags.ack());
    assert_eq!(syn_ack.ack_number, SeqNumber(CLIENT_ISN + 1));
    let iss = syn_ack.seq_number;

    relay.handle_packet(&mut sched, &build(
        target, port, CLIENT_ISN + 1, (iss + 1).0, flags(false, true, false), &[]));

    // Client payload must surface on the destination socket.
    relay.handle_packet(&mut sched, &build(
        target, port, CLIENT_ISN + 1, (iss + 1).0, flags(false, true, false), b"ping from v6"));

    let mut received = Vec::new();
    for _ in 0..400 {
        sched.step(&mut relay);
        let mut chunk = [0u8; 256];
        match server.read(&mut chunk) {
            Ok(0) => panic!("destination socket closed early"),
            Ok(n) => {
                received.extend_from_slice(&chunk[..n]);
                if received.len() >= 12 {
                    break;
                }
            }
            Err(ref err) if err.kind() == std::io::ErrorKind::WouldBlock => continue,
            Err(err) => panic!("destination read failed: {}", err),
        }
    }
    assert_eq!(received, b"ping from v6");

    // Drain the relay's acknowledgements before the reverse direction.
    while wire.transmitted().is_some() {}

    // Destination response travels back over the virtual wire.
    server.write_all(b"pong from v4").unwrap();
    let (reply, payload) = loop {
        let (repr, payload) = parse(&wait_for_frame(&mut sched, &mut relay, &wire));
        if !payload.is_empty() {
            break (repr, payload);
        }
    };
    assert_eq!(payload, b"pong from v4");
    assert_eq!(reply.seq_number, iss + 1);

    // Acknowledge the response, then close from the client side.
    let client_seq = CLIENT_ISN + 1 + 12;
    let relay_seq = (reply.seq_number + payload.len()).0;
    relay.handle_packet(&mut sched, &build(
        target, port, client_seq, relay_seq, flags(false, true, false), &[]));
    relay.handle_packet(&mut sched, &build(
        target, port, client_seq, relay_seq, flags(false, true, true), &[]));

    // The bridge tears its session down and the destination sees EOF.
    assert_eq!(relay.app.session_count(), 0);
    let mut saw_eof = false;
    for _ in 0..400 {
        sched.step(&mut relay);
        let mut chunk = [0u8; 16];
        match server.read(&mut chunk) {
            Ok(0) => {
                saw_eof = true;
                break;
            }
            Ok(_) => continue,
            Err(ref err) if err.kind() == std::io::ErrorKind::WouldBlock => continue,
            Err(_) => {
                saw_eof = true;
                break;
            }
        }
    }
    assert!(saw_eof, "destination never saw the close");
}
