use super::error::ExchangeError;
use super::group::GroupRef;
use super::piece::PieceBuffer;
use crate::bencode::{decode, decode_prefix, dict, encode, Value};
use crate::constants::{
    CONNECT_TIMEOUT, EXTENDED_MSG_ID, MAX_METADATA_SIZE, MAX_WIRE_FRAME, PIECE_TIMEOUT,
    STEP_TIMEOUT, TASK_TIMEOUT,
};
use crate::info_hash::InfoHash;
use crate::reactor::Reactor;
use crate::tcp::{ConnState, Setting, TcpConnection};
use crate::timer::TimerHandle;
use bytes::{BufMut, Bytes, BytesMut};
use sha1::{Digest, Sha1};
use std::cell::RefCell;
use std::net::SocketAddr;
use std::rc::Rc;
use std::time::{Duration, Instant};
use tracing::{debug, trace};

const PROTOCOL: &[u8] = b"BitTorrent protocol";

/// Extension id we advertise for ut_metadata in our handshake.
const LOCAL_UT_METADATA: u8 = 1;

/// Where an exchange is in its life. `CheckFailed` and `Completed` are
/// terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Progress {
    Connecting,
    Handshaking,
    GettingPeerInfo,
    Downloading,
    CheckFailed,
    Completed,
}

/// Per-attempt notification callbacks, all optional, each fired at most
/// once. `on_close` fires for every attempt, whatever its fate.
#[derive(Default)]
pub struct ExchangeEvents {
    pub on_complete: Option<Box<dyn FnOnce(&mut Reactor, InfoHash, Bytes)>>,
    pub on_failed: Option<Box<dyn FnOnce(&mut Reactor, Progress, ExchangeError)>>,
    pub on_timeout: Option<Box<dyn FnOnce(&mut Reactor, Progress)>>,
    pub on_close: Option<Box<dyn FnOnce(&mut Reactor, Progress)>>,
}

type Conn = TcpConnection<MetadataExchange>;
type FrameHandler = fn(&mut Conn, &mut Reactor, BytesMut) -> Result<(), ExchangeError>;

/// One attempt to download one info-hash's metadata from one peer.
///
/// Lives inside its [`TcpConnection`] as the protocol setting; every state
/// transition is a connection callback. Three timers bound the attempt: a
/// connect timer, a per-step timer reset on every forward step, and an
/// overall task timer armed once.
pub struct MetadataExchange {
    group: GroupRef,
    peer: SocketAddr,
    progress: Progress,
    piece: Option<PieceBuffer>,
    peer_ut_metadata: u8,
    step_timer: Option<TimerHandle>,
    task_timer: Option<TimerHandle>,
    events: ExchangeEvents,
}

impl MetadataExchange {
    /// Opens the connection and drives the exchange to one of its terminal
    /// outcomes, reported through `events`.
    pub fn start(
        reactor: &mut Reactor,
        group: GroupRef,
        peer: SocketAddr,
        events: ExchangeEvents,
    ) -> Rc<RefCell<Conn>> {
        group.borrow_mut().attempt_started();
        let task = Self {
            group,
            peer,
            progress: Progress::Connecting,
            piece: None,
            peer_ut_metadata: 0,
            step_timer: None,
            task_timer: None,
            events,
        };
        trace!(peer = %peer, "metadata exchange starting");
        let conn = TcpConnection::open(reactor, peer, task, Self::on_connected);
        {
            let mut conn = conn.borrow_mut();
            if conn.state() != ConnState::Closed {
                Self::reset_step_timer(&mut conn, reactor, CONNECT_TIMEOUT);
                let handle = Self::schedule_timeout(&mut conn, reactor, TASK_TIMEOUT);
                conn.setting_mut().task_timer = handle;
            }
        }
        conn
    }

    pub fn progress(&self) -> Progress {
        self.progress
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    // ------------------------------------------------------------------
    // state transitions
    // ------------------------------------------------------------------

    fn on_connected(conn: &mut Conn, reactor: &mut Reactor) -> Result<(), ExchangeError> {
        conn.setting_mut().progress = Progress::Handshaking;
        Self::reset_step_timer(conn, reactor, STEP_TIMEOUT);

        let (info_hash, self_id) = {
            let group = conn.setting().group.borrow();
            (group.info_hash(), group.self_id())
        };
        let mut hs = BytesMut::with_capacity(68);
        hs.put_u8(PROTOCOL.len() as u8);
        hs.put_slice(PROTOCOL);
        // Reserved bits: extension protocol (BEP-10) and DHT.
        hs.put_slice(&[0, 0, 0, 0, 0, 0x10, 0, 0x01]);
        hs.put_slice(info_hash.as_bytes());
        hs.put_slice(self_id.as_bytes());
        conn.send(hs.freeze(), Self::recv_handshake);
        Ok(())
    }

    fn recv_handshake(conn: &mut Conn, reactor: &mut Reactor) -> Result<(), ExchangeError> {
        Self::reset_step_timer(conn, reactor, STEP_TIMEOUT);
        conn.read(BytesMut::with_capacity(68), 68, Self::send_extension_handshake);
        Ok(())
    }

    fn send_extension_handshake(conn: &mut Conn, reactor: &mut Reactor) -> Result<(), ExchangeError> {
        // The peer's 68 bytes are validated by length only; metadata
        // integrity rests on the final hash check.
        let _ = conn.take_read_buf();
        conn.setting_mut().progress = Progress::GettingPeerInfo;
        Self::reset_step_timer(conn, reactor, STEP_TIMEOUT);

        let payload = encode(&dict([(
            b"m",
            dict([(b"ut_metadata", Value::Int(LOCAL_UT_METADATA as i64))]),
        )]));
        conn.send(extension_frame(0, &payload), |conn, _reactor| {
            Self::read_frame(conn, Self::on_peer_info);
            Ok(())
        });
        Ok(())
    }

    fn on_peer_info(conn: &mut Conn, reactor: &mut Reactor, frame: BytesMut) -> Result<(), ExchangeError> {
        let info = decode(&frame[2..])?;
        let ut_metadata = info
            .get_dict("m")
            .and_then(|m| m.get(b"ut_metadata".as_slice()))
            .and_then(|v| v.as_int())
            .ok_or(ExchangeError::Protocol("no ut_metadata"))?;
        let size = info
            .get_int("metadata_size")
            .ok_or(ExchangeError::Protocol("no metadata_size"))?;
        if size <= 0 {
            return Err(ExchangeError::Protocol("metadata_size <= 0"));
        }
        if size as usize > MAX_METADATA_SIZE {
            return Err(ExchangeError::Protocol("metadata_size too large"));
        }

        let task = conn.setting_mut();
        task.peer_ut_metadata = ut_metadata as u8;
        task.piece = Some(PieceBuffer::new(size as usize));
        task.progress = Progress::Downloading;
        debug!(peer = %task.peer, size, "peer advertised metadata");
        Self::request_next_piece(conn, reactor)
    }

    fn request_next_piece(conn: &mut Conn, reactor: &mut Reactor) -> Result<(), ExchangeError> {
        Self::reset_step_timer(conn, reactor, PIECE_TIMEOUT);
        let task = conn.setting_mut();
        let piece = task.piece.as_ref().expect("piece buffer after peer info");
        if piece.is_complete() {
            return Self::finish(conn, reactor);
        }

        let request = encode(&dict([
            (b"msg_type", Value::Int(0)),
            (b"piece", Value::Int(piece.next_piece() as i64)),
        ]));
        let frame = extension_frame(task.peer_ut_metadata, &request);
        conn.send(frame, |conn, _reactor| {
            Self::read_frame(conn, Self::on_piece_data);
            Ok(())
        });
        Ok(())
    }

    fn on_piece_data(conn: &mut Conn, reactor: &mut Reactor, frame: BytesMut) -> Result<(), ExchangeError> {
        let payload = &frame[2..];
        let (header, used) = decode_prefix(payload)?;
        match header.get_int("msg_type") {
            Some(1) => {}
            Some(2) => return Err(ExchangeError::Protocol("piece request rejected")),
            _ => return Err(ExchangeError::Protocol("unexpected ut_metadata message")),
        }
        let data = &payload[used..];
        conn.setting_mut()
            .piece
            .as_mut()
            .expect("piece buffer while downloading")
            .write_piece(data)?;
        Self::request_next_piece(conn, reactor)
    }

    fn finish(conn: &mut Conn, reactor: &mut Reactor) -> Result<(), ExchangeError> {
        let task = conn.setting_mut();
        let bytes = task
            .piece
            .take()
            .expect("piece buffer at completion")
            .into_bytes();
        let info_hash = task.group.borrow().info_hash();

        let digest = Sha1::digest(&bytes);
        if digest.as_slice() != info_hash.as_bytes() {
            debug!(peer = %task.peer, "metadata hash mismatch");
            task.progress = Progress::CheckFailed;
            conn.close(reactor);
            return Ok(());
        }

        task.progress = Progress::Completed;
        task.group.borrow_mut().stop();
        if let Some(on_complete) = task.events.on_complete.take() {
            on_complete(reactor, info_hash, bytes);
        }
        conn.close(reactor);
        Ok(())
    }

    // ------------------------------------------------------------------
    // framing
    // ------------------------------------------------------------------

    /// Reads peer-wire frames until an extension-protocol message arrives,
    /// discarding keepalives and unrelated message types along the way.
    fn read_frame(conn: &mut Conn, handler: FrameHandler) {
        conn.read(BytesMut::with_capacity(4), 4, move |conn, _reactor| {
            let len_buf = conn.take_read_buf();
            let len = u32::from_be_bytes([len_buf[0], len_buf[1], len_buf[2], len_buf[3]]) as usize;
            if len == 0 {
                // Keepalive.
                Self::read_frame(conn, handler);
                return Ok(());
            }
            if len > MAX_WIRE_FRAME {
                return Err(ExchangeError::Protocol("frame too large"));
            }
            conn.read(BytesMut::with_capacity(len), len, move |conn, reactor| {
                let frame = conn.take_read_buf();
                if frame.len() < 2 || frame[0] != EXTENDED_MSG_ID {
                    // Bitfields, haves, anything else: not ours, skip.
                    Self::read_frame(conn, handler);
                    return Ok(());
                }
                handler(conn, reactor, frame)
            });
            Ok(())
        });
    }

    // ------------------------------------------------------------------
    // timers
    // ------------------------------------------------------------------

    fn schedule_timeout(
        conn: &mut Conn,
        reactor: &mut Reactor,
        delay: Duration,
    ) -> Option<TimerHandle> {
        let weak = conn.weak();
        reactor.schedule(delay, move |reactor| {
            if let Some(conn) = weak.upgrade() {
                let mut conn = conn.borrow_mut();
                if conn.state() != ConnState::Closed {
                    Self::on_timeout(&mut conn, reactor);
                }
            }
        })
    }

    fn reset_step_timer(conn: &mut Conn, reactor: &mut Reactor, delay: Duration) {
        if let Some(handle) = conn.setting_mut().step_timer.take() {
            reactor.cancel(handle);
        }
        let handle = Self::schedule_timeout(conn, reactor, delay);
        conn.setting_mut().step_timer = handle;
    }

    fn on_timeout(conn: &mut Conn, reactor: &mut Reactor) {
        let progress = conn.setting().progress;
        trace!(peer = %conn.setting().peer, ?progress, "exchange timed out");
        if let Some(on_timeout) = conn.setting_mut().events.on_timeout.take() {
            on_timeout(reactor, progress);
        }
        conn.close(reactor);
    }
}

impl Setting for MetadataExchange {
    type Error = ExchangeError;

    fn before_ready(&mut self) -> bool {
        // The group died (someone else finished, or the clock ran out):
        // abandon this attempt at the next readiness instead of keeping a
        // doomed socket alive.
        self.group.borrow().is_alive(Instant::now())
    }

    fn handle_error(&mut self, reactor: &mut Reactor, error: ExchangeError) {
        let progress = self.progress;
        trace!(peer = %self.peer, ?progress, error = %error, "exchange failed");
        if let Some(on_failed) = self.events.on_failed.take() {
            on_failed(reactor, progress, error);
        }
    }

    fn on_close(&mut self, reactor: &mut Reactor) {
        if let Some(handle) = self.step_timer.take() {
            reactor.cancel(handle);
        }
        if let Some(handle) = self.task_timer.take() {
            reactor.cancel(handle);
        }
        self.group.borrow_mut().attempt_finished();
        let progress = self.progress;
        if let Some(on_close) = self.events.on_close.take() {
            on_close(reactor, progress);
        }
    }
}

/// Frames one extension-protocol message:
/// `u32 length | 0x14 | extended id | payload`.
fn extension_frame(extended_id: u8, payload: &[u8]) -> Bytes {
    let mut frame = BytesMut::with_capacity(4 + 2 + payload.len());
    frame.put_u32(payload.len() as u32 + 2);
    frame.put_u8(EXTENDED_MSG_ID);
    frame.put_u8(extended_id);
    frame.put_slice(payload);
    frame.freeze()
}
