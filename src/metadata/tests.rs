use super::*;
use crate::bencode::{decode_prefix, dict, encode, Value};
use crate::constants::{METADATA_PIECE_SIZE, STEP_TIMEOUT};
use crate::dht::NodeId;
use crate::info_hash::InfoHash;
use crate::reactor::Reactor;
use bytes::Bytes;
use sha1::{Digest, Sha1};
use std::cell::{Cell, RefCell};
use std::io::{Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::rc::Rc;
use std::time::{Duration, Instant};

const SERVER_UT_ID: u8 = 3;

fn metadata_blob(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i * 31 + 7) as u8).collect()
}

fn read_exact(stream: &mut TcpStream, n: usize) -> Vec<u8> {
    let mut buf = vec![0u8; n];
    stream.read_exact(&mut buf).unwrap();
    buf
}

fn read_wire_frame(stream: &mut TcpStream) -> Vec<u8> {
    let len_buf = read_exact(stream, 4);
    let len = u32::from_be_bytes([len_buf[0], len_buf[1], len_buf[2], len_buf[3]]) as usize;
    read_exact(stream, len)
}

fn write_wire_frame(stream: &mut TcpStream, ext_id: u8, payload: &[u8]) {
    let mut out = Vec::with_capacity(payload.len() + 6);
    out.extend_from_slice(&(payload.len() as u32 + 2).to_be_bytes());
    out.push(0x14);
    out.push(ext_id);
    out.extend_from_slice(payload);
    stream.write_all(&out).unwrap();
}

/// Blocking mock peer speaking just enough BEP-10/BEP-9 to serve one
/// metadata blob.
fn serve_metadata(listener: TcpListener, metadata: Vec<u8>, corrupt: bool) {
    let (mut stream, _) = listener.accept().unwrap();

    // Peer-wire handshake: echo the client's own 68 bytes back.
    let handshake = read_exact(&mut stream, 68);
    stream.write_all(&handshake).unwrap();

    // Client's extension handshake, then ours.
    let _client_ext = read_wire_frame(&mut stream);
    let hello = encode(&dict([
        (
            b"m",
            dict([(b"ut_metadata", Value::Int(SERVER_UT_ID as i64))]),
        ),
        (b"metadata_size", Value::Int(metadata.len() as i64)),
    ]));
    write_wire_frame(&mut stream, 0, &hello);

    let piece_count = metadata.len().div_ceil(METADATA_PIECE_SIZE);
    for _ in 0..piece_count {
        let request = read_wire_frame(&mut stream);
        assert_eq!(request[0], 0x14);
        assert_eq!(request[1], SERVER_UT_ID);
        let (header, _) = decode_prefix(&request[2..]).unwrap();
        assert_eq!(header.get_int("msg_type"), Some(0));
        let piece = header.get_int("piece").unwrap() as usize;

        let start = piece * METADATA_PIECE_SIZE;
        let end = (start + METADATA_PIECE_SIZE).min(metadata.len());
        let mut data = metadata[start..end].to_vec();
        if corrupt {
            data[0] ^= 0xFF;
        }
        let mut payload = encode(&dict([
            (b"msg_type", Value::Int(1)),
            (b"piece", Value::Int(piece as i64)),
            (b"total_size", Value::Int(metadata.len() as i64)),
        ]))
        .to_vec();
        payload.extend_from_slice(&data);
        write_wire_frame(&mut stream, 1, &payload);
    }

    // Give the client time to finish its last read before the socket drops.
    std::thread::sleep(Duration::from_millis(300));
}

#[derive(Default, Clone)]
struct Outcome {
    completed: Rc<RefCell<Option<(InfoHash, Bytes)>>>,
    closed: Rc<RefCell<Option<Progress>>>,
    timeouts: Rc<Cell<u32>>,
    failures: Rc<Cell<u32>>,
}

impl Outcome {
    fn events(&self) -> ExchangeEvents {
        let completed = self.completed.clone();
        let closed = self.closed.clone();
        let timeouts = self.timeouts.clone();
        let failures = self.failures.clone();
        ExchangeEvents {
            on_complete: Some(Box::new(move |_, hash, bytes| {
                *completed.borrow_mut() = Some((hash, bytes));
            })),
            on_failed: Some(Box::new(move |_, _, _| failures.set(failures.get() + 1))),
            on_timeout: Some(Box::new(move |_, _| timeouts.set(timeouts.get() + 1))),
            on_close: Some(Box::new(move |_, progress| {
                *closed.borrow_mut() = Some(progress);
            })),
        }
    }
}

fn drive(reactor: &mut Reactor, limit: Duration, until: impl Fn() -> bool) {
    let deadline = Instant::now() + limit;
    while !until() && Instant::now() < deadline {
        reactor.turn().unwrap();
    }
    assert!(until(), "test condition not reached before deadline");
}

fn start_against_mock(
    metadata: Vec<u8>,
    corrupt: bool,
) -> (Reactor, GroupRef, Outcome, std::thread::JoinHandle<()>) {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr: SocketAddr = listener.local_addr().unwrap();
    let hash = InfoHash(Sha1::digest(&metadata).into());
    let server = std::thread::spawn(move || serve_metadata(listener, metadata, corrupt));

    let mut reactor = Reactor::new().unwrap();
    let group = DownloadGroup::new(Instant::now(), hash, NodeId::generate());
    let outcome = Outcome::default();
    MetadataExchange::start(&mut reactor, group.clone(), addr, outcome.events());
    (reactor, group, outcome, server)
}

#[test]
fn downloads_three_piece_metadata_to_completion() {
    let metadata = metadata_blob(40_000);
    let (mut reactor, group, outcome, server) = start_against_mock(metadata.clone(), false);

    drive(&mut reactor, Duration::from_secs(10), || {
        outcome.closed.borrow().is_some()
    });

    let (hash, bytes) = outcome.completed.borrow().clone().expect("completed");
    assert_eq!(&bytes[..], &metadata[..]);
    assert_eq!(hash.as_bytes(), &<[u8; 20]>::from(Sha1::digest(&metadata)));
    assert_eq!(*outcome.closed.borrow(), Some(Progress::Completed));
    assert_eq!(outcome.timeouts.get(), 0);
    assert_eq!(outcome.failures.get(), 0);

    // Completion kills the group and releases the attempt slot.
    assert!(!group.borrow().is_alive(Instant::now()));
    assert_eq!(group.borrow().attempts(), 0);
    server.join().unwrap();
}

#[test]
fn corrupted_metadata_ends_in_check_failed() {
    let metadata = metadata_blob(40_000);
    let (mut reactor, group, outcome, server) = start_against_mock(metadata, true);

    drive(&mut reactor, Duration::from_secs(10), || {
        outcome.closed.borrow().is_some()
    });

    assert_eq!(*outcome.closed.borrow(), Some(Progress::CheckFailed));
    assert!(outcome.completed.borrow().is_none());
    // A failed check is a normal outcome, not an error, and leaves the
    // group alive for other peers.
    assert_eq!(outcome.failures.get(), 0);
    assert!(group.borrow().is_alive(Instant::now()));
    server.join().unwrap();
}

#[test]
fn silent_peer_times_out_within_bound_not_before() {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr: SocketAddr = listener.local_addr().unwrap();
    // Accept and go silent: never completes the handshake exchange.
    std::thread::spawn(move || {
        let (stream, _) = listener.accept().unwrap();
        std::thread::sleep(Duration::from_secs(20));
        drop(stream);
    });

    let mut reactor = Reactor::new().unwrap();
    let group = DownloadGroup::new(
        Instant::now(),
        InfoHash([9u8; 20]),
        NodeId::generate(),
    );
    let outcome = Outcome::default();
    let started = Instant::now();
    MetadataExchange::start(&mut reactor, group, addr, outcome.events());

    drive(&mut reactor, STEP_TIMEOUT + Duration::from_secs(5), || {
        outcome.closed.borrow().is_some()
    });

    assert_eq!(outcome.timeouts.get(), 1);
    assert!(outcome.completed.borrow().is_none());
    // Not before the configured budget (give the wheel a tick of slack).
    assert!(started.elapsed() >= STEP_TIMEOUT - Duration::from_millis(200));
}

#[test]
fn dead_group_aborts_attempt_at_next_readiness() {
    let metadata = metadata_blob(1000);
    let (mut reactor, group, outcome, server) = start_against_mock(metadata, false);

    group.borrow_mut().stop();
    drive(&mut reactor, Duration::from_secs(10), || {
        outcome.closed.borrow().is_some()
    });

    assert!(outcome.completed.borrow().is_none());
    assert_eq!(group.borrow().attempts(), 0);
    // The mock server may be mid-protocol when the client bails; it only
    // matters that it was accepted, so let it finish on its own thread.
    drop(server);
}
