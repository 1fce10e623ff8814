//! Non-blocking TCP client connection with explicit callback chaining.
//!
//! [`TcpConnection`] is a per-socket state machine
//! (`NotConnected → Connecting → Idle ⇄ ReadOrWrite → Closed`) driven by the
//! [`Reactor`]. Protocol code never blocks: it asks for "invoke this once
//! `n` bytes are buffered" or "invoke this once the write buffer drains",
//! and the connection loops partial reads and writes across however many
//! readiness events it takes.
//!
//! The `S: Setting` parameter is the protocol state carried inside the
//! connection. Callbacks receive the connection itself (and through it the
//! setting), so a protocol step can issue the next read or write on the
//! spot. Errors returned from a callback are caught at the connection
//! boundary: the socket is closed and the setting's error hook runs; they
//! never reach the reactor.
//!
//! A connection with no pending read, no pending write, and nothing queued
//! is idle; by default it closes itself. Idle sockets held open are a
//! resource leak unless the setting opts out.

use crate::reactor::{EventSink, Reactor};
use bytes::{Buf, Bytes, BytesMut};
use mio::event::Event;
use mio::net::TcpStream;
use mio::{Interest, Token};
use std::cell::RefCell;
use std::io::{self, Read, Write};
use std::net::SocketAddr;
use std::rc::{Rc, Weak};
use tracing::trace;

const READ_CHUNK: usize = 4096;

/// Connection lifecycle state. `Closed` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    NotConnected,
    Connecting,
    Idle,
    ReadOrWrite,
    Closed,
}

/// Protocol hooks and policy carried by a [`TcpConnection`].
pub trait Setting: Sized + 'static {
    /// Error type surfaced by protocol callbacks; connection-level I/O
    /// errors are converted into it.
    type Error: From<io::Error>;

    /// Gate checked before each readiness dispatch; returning `false`
    /// closes the connection without running callbacks.
    fn before_ready(&mut self) -> bool {
        true
    }

    fn auto_close_on_idle(&self) -> bool {
        true
    }

    fn auto_close_on_eof(&self) -> bool {
        true
    }

    /// The peer closed its end.
    fn on_eof(&mut self) {}

    /// A callback returned an error, or the socket failed. The connection
    /// is already closed when this runs.
    fn handle_error(&mut self, reactor: &mut Reactor, error: Self::Error);

    /// The connection closed, for any reason. Runs exactly once.
    fn on_close(&mut self, reactor: &mut Reactor);
}

/// A chained protocol step.
pub type Callback<S> =
    Box<dyn FnOnce(&mut TcpConnection<S>, &mut Reactor) -> Result<(), <S as Setting>::Error>>;

pub struct TcpConnection<S: Setting> {
    setting: S,
    state: ConnState,
    stream: Option<TcpStream>,
    token: Option<Token>,
    weak: Weak<RefCell<TcpConnection<S>>>,
    connect_cb: Option<Callback<S>>,
    read_cb: Option<Callback<S>>,
    write_cb: Option<Callback<S>>,
    read_buf: Option<BytesMut>,
    read_target: usize,
    write_buf: Bytes,
    close_notified: bool,
}

impl<S: Setting> TcpConnection<S> {
    /// Opens a non-blocking connection to `addr`. `on_connected` runs once
    /// the socket is writable and connected; a failure to even start the
    /// connect is routed to the setting's error hook instead.
    pub fn open(
        reactor: &mut Reactor,
        addr: SocketAddr,
        setting: S,
        on_connected: impl FnOnce(&mut TcpConnection<S>, &mut Reactor) -> Result<(), S::Error> + 'static,
    ) -> Rc<RefCell<Self>> {
        let conn = Rc::new_cyclic(|weak| {
            RefCell::new(Self {
                setting,
                state: ConnState::NotConnected,
                stream: None,
                token: None,
                weak: weak.clone(),
                connect_cb: None,
                read_cb: None,
                write_cb: None,
                read_buf: None,
                read_target: 0,
                write_buf: Bytes::new(),
                close_notified: false,
            })
        });

        let started = conn
            .borrow_mut()
            .start_connect(reactor, addr, Box::new(on_connected), &conn);
        if let Err(error) = started {
            let mut this = conn.borrow_mut();
            this.close(reactor);
            this.setting.handle_error(reactor, error);
        }
        conn
    }

    fn start_connect(
        &mut self,
        reactor: &mut Reactor,
        addr: SocketAddr,
        callback: Callback<S>,
        rc: &Rc<RefCell<Self>>,
    ) -> Result<(), S::Error> {
        let mut stream = TcpStream::connect(addr).map_err(S::Error::from)?;
        let token = reactor
            .register(&mut stream, Interest::WRITABLE, rc.clone())
            .map_err(|e| S::Error::from(io::Error::other(e)))?;
        self.stream = Some(stream);
        self.token = Some(token);
        self.connect_cb = Some(callback);
        self.state = ConnState::Connecting;
        Ok(())
    }

    pub fn state(&self) -> ConnState {
        self.state
    }

    pub fn setting(&self) -> &S {
        &self.setting
    }

    pub fn setting_mut(&mut self) -> &mut S {
        &mut self.setting
    }

    /// Weak handle for timers that need to reach this connection later.
    pub fn weak(&self) -> Weak<RefCell<Self>> {
        self.weak.clone()
    }

    /// Requests that `callback` run once `buffer` holds at least `target`
    /// bytes, reading across as many readiness events as needed. The filled
    /// buffer is retrieved inside the callback with
    /// [`take_read_buf`](Self::take_read_buf).
    ///
    /// # Panics
    ///
    /// Panics on a zero target, a read while one is already pending, or a
    /// connection not in `Idle`/`ReadOrWrite`; all programming errors.
    pub fn read(
        &mut self,
        buffer: BytesMut,
        target: usize,
        callback: impl FnOnce(&mut TcpConnection<S>, &mut Reactor) -> Result<(), S::Error> + 'static,
    ) {
        assert!(target > 0, "read target must be positive");
        assert!(self.read_cb.is_none(), "a read is already pending");
        self.check_open_for_io();
        self.read_buf = Some(buffer);
        self.read_target = target;
        self.read_cb = Some(Box::new(callback));
        self.state = ConnState::ReadOrWrite;
    }

    /// Takes the buffer a completed read filled. Call from the read
    /// callback.
    pub fn take_read_buf(&mut self) -> BytesMut {
        self.read_target = 0;
        self.read_buf.take().expect("completed read buffer present")
    }

    /// Queues `buffer` to be written out. Draining starts with the next
    /// readiness dispatch and continues across events until empty.
    pub fn set_write_buffer(&mut self, buffer: Bytes) {
        self.check_open_for_io();
        self.write_buf = buffer;
        self.state = ConnState::ReadOrWrite;
    }

    /// Requests that `callback` run once the write buffer is fully drained.
    pub fn on_write_complete(
        &mut self,
        callback: impl FnOnce(&mut TcpConnection<S>, &mut Reactor) -> Result<(), S::Error> + 'static,
    ) {
        assert!(self.write_cb.is_none(), "a write completion is already pending");
        self.check_open_for_io();
        self.write_cb = Some(Box::new(callback));
        self.state = ConnState::ReadOrWrite;
    }

    /// `set_write_buffer` + `on_write_complete` in one call.
    pub fn send(
        &mut self,
        buffer: Bytes,
        callback: impl FnOnce(&mut TcpConnection<S>, &mut Reactor) -> Result<(), S::Error> + 'static,
    ) {
        self.set_write_buffer(buffer);
        self.on_write_complete(callback);
    }

    /// Closes the connection. Idempotent; the setting's `on_close` runs
    /// once, and pending callbacks are dropped without firing.
    pub fn close(&mut self, reactor: &mut Reactor) {
        if self.state == ConnState::Closed {
            return;
        }
        let never_connected = self.state == ConnState::NotConnected;
        self.state = ConnState::Closed;
        self.connect_cb = None;
        self.read_cb = None;
        self.write_cb = None;
        self.read_buf = None;
        self.write_buf = Bytes::new();

        if let Some(mut stream) = self.stream.take() {
            if let Some(token) = self.token.take() {
                reactor.deregister(&mut stream, token);
            }
        }
        if !never_connected && !self.close_notified {
            self.close_notified = true;
            self.setting.on_close(reactor);
        }
    }

    fn check_open_for_io(&self) {
        assert!(
            matches!(self.state, ConnState::Idle | ConnState::ReadOrWrite),
            "connection not open for read/write: {:?}",
            self.state
        );
    }

    fn fail(&mut self, reactor: &mut Reactor, error: S::Error) {
        self.close(reactor);
        self.setting.handle_error(reactor, error);
    }

    fn handle_eof(&mut self, reactor: &mut Reactor) {
        trace!("eof from peer");
        if self.setting.auto_close_on_eof() {
            self.close(reactor);
        }
        self.setting.on_eof();
    }

    /// Reads toward the target, never past it, until satisfied or the
    /// socket would block. Returns `true` on EOF.
    fn fill_read(&mut self) -> io::Result<bool> {
        let (Some(stream), Some(buf)) = (self.stream.as_mut(), self.read_buf.as_mut()) else {
            return Ok(false);
        };
        let mut chunk = [0u8; READ_CHUNK];
        while buf.len() < self.read_target {
            let want = (self.read_target - buf.len()).min(chunk.len());
            match stream.read(&mut chunk[..want]) {
                Ok(0) => return Ok(true),
                Ok(n) => buf.extend_from_slice(&chunk[..n]),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
        Ok(false)
    }

    /// Drains the write buffer until empty or the socket would block.
    fn flush_write(&mut self) -> io::Result<()> {
        let Some(stream) = self.stream.as_mut() else {
            return Ok(());
        };
        while self.write_buf.has_remaining() {
            match stream.write(self.write_buf.chunk()) {
                Ok(0) => return Err(io::ErrorKind::WriteZero.into()),
                Ok(n) => self.write_buf.advance(n),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    fn take_read_complete(&mut self) -> Option<Callback<S>> {
        let done = self
            .read_buf
            .as_ref()
            .is_some_and(|b| b.len() >= self.read_target);
        if done {
            self.read_cb.take()
        } else {
            None
        }
    }

    fn take_write_complete(&mut self) -> Option<Callback<S>> {
        if self.write_buf.has_remaining() {
            None
        } else {
            self.write_cb.take()
        }
    }

    /// A callback that became runnable without another readiness event:
    /// the bounce that keeps long chains off the call stack.
    fn more_callback(&mut self) -> Option<Callback<S>> {
        self.take_read_complete().or_else(|| self.take_write_complete())
    }

    /// `Ok(true)` when the TCP connect finished, `Ok(false)` when the
    /// readiness was spurious and the connect is still in flight.
    fn finish_connect(&mut self) -> io::Result<bool> {
        let stream = self.stream.as_ref().expect("connecting stream present");
        if let Some(e) = stream.take_error()? {
            return Err(e);
        }
        match stream.peer_addr() {
            Ok(_) => Ok(true),
            Err(e) if e.kind() == io::ErrorKind::NotConnected => Ok(false),
            Err(e) => Err(e),
        }
    }

    fn handle_event(
        &mut self,
        reactor: &mut Reactor,
        event: &Event,
    ) -> Result<Option<Callback<S>>, S::Error> {
        match self.state {
            ConnState::Connecting => {
                if !self.finish_connect().map_err(S::Error::from)? {
                    return Ok(None);
                }
                self.state = ConnState::Idle;
                Ok(self.connect_cb.take())
            }
            ConnState::ReadOrWrite => {
                if event.is_readable() && self.read_cb.is_some() {
                    if self.fill_read().map_err(S::Error::from)? {
                        self.handle_eof(reactor);
                        return Ok(None);
                    }
                }
                if event.is_writable() && self.write_buf.has_remaining() {
                    self.flush_write().map_err(S::Error::from)?;
                }
                Ok(self.more_callback())
            }
            // Stale readiness for a connection that went idle or closed
            // earlier in this poll batch.
            _ => Ok(None),
        }
    }

    fn dispatch(&mut self, reactor: &mut Reactor, event: &Event) -> Result<(), S::Error> {
        let mut callback = self.handle_event(reactor, event)?;
        while let Some(cb) = callback {
            cb(self, reactor)?;
            if self.state == ConnState::Closed {
                return Ok(());
            }
            callback = self.more_callback();
        }
        self.update_interest(reactor).map_err(S::Error::from)
    }

    /// Recomputes interest from what is still outstanding. With nothing
    /// outstanding the connection is idle and, by default, closes.
    fn update_interest(&mut self, reactor: &mut Reactor) -> io::Result<()> {
        match self.state {
            ConnState::Closed | ConnState::NotConnected | ConnState::Connecting => Ok(()),
            ConnState::Idle | ConnState::ReadOrWrite => {
                let mut interest = None;
                if self.read_cb.is_some() {
                    interest = Some(Interest::READABLE);
                }
                if self.write_buf.has_remaining() {
                    interest = Some(interest.map_or(Interest::WRITABLE, |i: Interest| {
                        i | Interest::WRITABLE
                    }));
                }
                match interest {
                    Some(interest) => {
                        self.state = ConnState::ReadOrWrite;
                        let stream = self.stream.as_mut().expect("open stream present");
                        match self.token {
                            Some(token) => reactor.reregister(stream, token, interest),
                            None => {
                                let rc = self.weak.upgrade().expect("connection alive");
                                self.token = Some(reactor.register(stream, interest, rc).map_err(
                                    |e| match e {
                                        crate::reactor::ReactorError::Channel(io) => io,
                                        other => io::Error::other(other),
                                    },
                                )?);
                                Ok(())
                            }
                        }
                    }
                    None => {
                        self.state = ConnState::Idle;
                        if self.setting.auto_close_on_idle() {
                            self.close(reactor);
                        } else if let (Some(stream), Some(token)) =
                            (self.stream.as_mut(), self.token.take())
                        {
                            // mio has no empty interest set; an idle
                            // connection parks deregistered until the next
                            // read/write re-registers it.
                            reactor.deregister(stream, token);
                        }
                        Ok(())
                    }
                }
            }
        }
    }
}

impl<S: Setting> EventSink for TcpConnection<S> {
    fn on_ready(&mut self, reactor: &mut Reactor, event: &Event) {
        if self.state == ConnState::Closed {
            return;
        }
        if !self.setting.before_ready() {
            self.close(reactor);
            return;
        }
        if let Err(error) = self.dispatch(reactor, event) {
            self.fail(reactor, error);
        }
    }

    fn on_shutdown(&mut self) -> io::Result<()> {
        self.state = ConnState::Closed;
        if let Some(stream) = self.stream.take() {
            match stream.shutdown(std::net::Shutdown::Both) {
                Err(e) if e.kind() != io::ErrorKind::NotConnected => return Err(e),
                _ => {}
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;
    use std::io::Write as _;
    use std::net::TcpListener;
    use std::sync::mpsc;
    use std::time::{Duration, Instant};

    /// Setting that records what happened to it.
    struct Probe {
        errors: Rc<Cell<u32>>,
        closes: Rc<Cell<u32>>,
        eofs: Rc<Cell<u32>>,
    }

    #[derive(Default)]
    struct ProbeCounters {
        errors: Rc<Cell<u32>>,
        closes: Rc<Cell<u32>>,
        eofs: Rc<Cell<u32>>,
    }

    impl ProbeCounters {
        fn probe(&self) -> Probe {
            Probe {
                errors: self.errors.clone(),
                closes: self.closes.clone(),
                eofs: self.eofs.clone(),
            }
        }
    }

    impl Setting for Probe {
        type Error = io::Error;

        fn handle_error(&mut self, _reactor: &mut Reactor, _error: io::Error) {
            self.errors.set(self.errors.get() + 1);
        }

        fn on_close(&mut self, _reactor: &mut Reactor) {
            self.closes.set(self.closes.get() + 1);
        }

        fn on_eof(&mut self) {
            self.eofs.set(self.eofs.get() + 1);
        }
    }

    fn drive(reactor: &mut Reactor, until: impl Fn() -> bool) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while !until() && Instant::now() < deadline {
            reactor.turn().unwrap();
        }
        assert!(until(), "test condition not reached before deadline");
    }

    #[test]
    fn read_completes_once_after_byte_by_byte_delivery() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let server = std::thread::spawn(move || {
            let (mut peer, _) = listener.accept().unwrap();
            for byte in b"0123456789" {
                peer.write_all(&[*byte]).unwrap();
                peer.flush().unwrap();
                std::thread::sleep(Duration::from_millis(2));
            }
            // Hold the socket open until the client is done reading.
            std::thread::sleep(Duration::from_millis(200));
        });

        let mut reactor = Reactor::new().unwrap();
        let counters = ProbeCounters::default();
        let fired = Rc::new(Cell::new(0u32));
        let got = Rc::new(RefCell::new(Vec::new()));

        let fired_in = fired.clone();
        let got_in = got.clone();
        let _conn = TcpConnection::open(&mut reactor, addr, counters.probe(), move |conn, _| {
            conn.read(BytesMut::new(), 10, move |conn, reactor| {
                fired_in.set(fired_in.get() + 1);
                got_in.borrow_mut().extend_from_slice(&conn.take_read_buf());
                conn.close(reactor);
                Ok(())
            });
            Ok(())
        });

        drive(&mut reactor, || fired.get() > 0);
        assert_eq!(fired.get(), 1);
        assert_eq!(got.borrow().as_slice(), b"0123456789");
        assert_eq!(counters.closes.get(), 1);
        assert_eq!(counters.errors.get(), 0);
        server.join().unwrap();
    }

    #[test]
    fn write_drains_fully_then_connection_autocloses() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let (tx, rx) = mpsc::channel();
        let server = std::thread::spawn(move || {
            let (mut peer, _) = listener.accept().unwrap();
            let mut total = Vec::new();
            std::io::Read::read_to_end(&mut peer, &mut total).unwrap();
            tx.send(total.len()).unwrap();
        });

        let mut reactor = Reactor::new().unwrap();
        let counters = ProbeCounters::default();
        let sent = Rc::new(Cell::new(false));

        let payload = Bytes::from(vec![0xAB; 256 * 1024]);
        let sent_in = sent.clone();
        let _conn = TcpConnection::open(&mut reactor, addr, counters.probe(), move |conn, _| {
            conn.send(payload, move |_, _| {
                sent_in.set(true);
                Ok(())
            });
            Ok(())
        });

        drive(&mut reactor, || sent.get());
        // Write complete and nothing else pending: idle auto-close.
        drive(&mut reactor, || counters.closes.get() > 0);
        assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap(), 256 * 1024);
        assert_eq!(counters.errors.get(), 0);
        server.join().unwrap();
    }

    #[test]
    fn eof_closes_and_read_callback_never_fires() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let server = std::thread::spawn(move || {
            let (peer, _) = listener.accept().unwrap();
            drop(peer);
        });

        let mut reactor = Reactor::new().unwrap();
        let counters = ProbeCounters::default();
        let fired = Rc::new(Cell::new(false));

        let fired_in = fired.clone();
        let _conn = TcpConnection::open(&mut reactor, addr, counters.probe(), move |conn, _| {
            conn.read(BytesMut::new(), 5, move |_, _| {
                fired_in.set(true);
                Ok(())
            });
            Ok(())
        });

        drive(&mut reactor, || counters.eofs.get() > 0);
        assert!(!fired.get());
        assert_eq!(counters.closes.get(), 1);
        server.join().unwrap();
    }

    #[test]
    fn connection_refused_routes_to_error_hook() {
        // Bind then drop to get a port with (very likely) no listener.
        let addr = {
            let listener = TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap()
        };

        let mut reactor = Reactor::new().unwrap();
        let counters = ProbeCounters::default();
        let _conn = TcpConnection::open(&mut reactor, addr, counters.probe(), |_, _| Ok(()));

        drive(&mut reactor, || counters.errors.get() > 0);
        assert_eq!(counters.errors.get(), 1);
    }

    #[test]
    fn callback_error_closes_connection_and_reaches_error_hook() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let server = std::thread::spawn(move || {
            let (mut peer, _) = listener.accept().unwrap();
            peer.write_all(b"xxxx").unwrap();
            std::thread::sleep(Duration::from_millis(200));
        });

        let mut reactor = Reactor::new().unwrap();
        let counters = ProbeCounters::default();
        let _conn = TcpConnection::open(&mut reactor, addr, counters.probe(), |conn, _| {
            conn.read(BytesMut::new(), 4, |_, _| {
                Err(io::Error::other("protocol violation"))
            });
            Ok(())
        });

        drive(&mut reactor, || counters.errors.get() > 0);
        assert_eq!(counters.closes.get(), 1);
        server.join().unwrap();
    }
}
