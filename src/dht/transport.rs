use super::error::DhtError;
use super::message::{DhtMessage, DhtPayload, DhtQuery};
use crate::reactor::{EventSink, Reactor};
use mio::event::Event;
use mio::net::UdpSocket;
use mio::{Interest, Token};
use std::cell::RefCell;
use std::collections::VecDeque;
use std::io;
use std::net::{Ipv4Addr, SocketAddr};
use std::rc::Rc;
use tracing::{debug, trace, warn};

const RECV_BUF_LEN: usize = 32 * 1024;

/// Observer of DHT traffic. Every observer sees every message; dispatch is
/// broadcast, not first-match.
///
/// Hooks fire from inside the endpoint's readiness handling, so they get a
/// [`DhtContext`] to queue outgoing traffic and reach the reactor without
/// re-borrowing the endpoint.
pub trait DhtObserver {
    /// A query datagram was written to the socket.
    fn query_sent(&mut self, _msg: &DhtMessage, _ctx: &mut DhtContext<'_>) {}

    /// A response datagram was written to the socket.
    fn response_sent(&mut self, _msg: &DhtMessage, _ctx: &mut DhtContext<'_>) {}

    /// Any decodable inbound message, before kind-specific hooks.
    fn message_received(&mut self, _msg: &DhtMessage, _ctx: &mut DhtContext<'_>) {}

    fn response_received(&mut self, _msg: &DhtMessage, _ctx: &mut DhtContext<'_>) {}

    fn query_received(&mut self, _msg: &DhtMessage, _query: &DhtQuery, _ctx: &mut DhtContext<'_>) {}

    fn error_received(&mut self, _msg: &DhtMessage, _code: i64, _text: &str, _ctx: &mut DhtContext<'_>) {
    }

    fn unknown_received(&mut self, _msg: &DhtMessage, _ctx: &mut DhtContext<'_>) {}

    /// A datagram failed to decode, or socket I/O failed for one message.
    fn failure(&mut self, _addr: Option<SocketAddr>, _error: &DhtError) {}
}

/// What observers may do while handling a message: queue outgoing traffic
/// and use the reactor (timers, connections).
pub struct DhtContext<'a> {
    pub reactor: &'a mut Reactor,
    queries: &'a mut VecDeque<DhtMessage>,
    responses: &'a mut VecDeque<DhtMessage>,
}

impl DhtContext<'_> {
    pub fn send_query(&mut self, msg: DhtMessage) {
        self.queries.push_back(msg);
    }

    pub fn send_response(&mut self, msg: DhtMessage) {
        self.responses.push_back(msg);
    }
}

/// The crawler's single UDP socket, bound to the reactor.
///
/// Outgoing messages are queued and drained on write readiness, responses
/// before queries; inbound datagrams are decoded and fanned out. Send-side
/// observer hooks (`query_sent` et al.) fire when the datagram actually
/// leaves, which is also when response-time measurement should start.
pub struct DhtEndpoint {
    socket: UdpSocket,
    token: Token,
    observers: Vec<Rc<RefCell<dyn DhtObserver>>>,
    queries: VecDeque<DhtMessage>,
    responses: VecDeque<DhtMessage>,
    recv_buf: Vec<u8>,
}

impl DhtEndpoint {
    /// Binds the UDP socket and registers it with the reactor.
    pub fn bind(reactor: &mut Reactor, port: u16) -> Result<Rc<RefCell<Self>>, DhtError> {
        let addr = SocketAddr::from((Ipv4Addr::UNSPECIFIED, port));
        let socket = UdpSocket::bind(addr)?;
        debug!(%addr, "dht endpoint bound");

        let endpoint = Rc::new(RefCell::new(Self {
            socket,
            token: Token(usize::MAX),
            observers: Vec::new(),
            queries: VecDeque::new(),
            responses: VecDeque::new(),
            recv_buf: vec![0u8; RECV_BUF_LEN],
        }));
        {
            let mut this = endpoint.borrow_mut();
            let sink: Rc<RefCell<dyn EventSink>> = endpoint.clone();
            let this = &mut *this;
            this.token = reactor
                .register(&mut this.socket, Interest::READABLE, sink)
                .map_err(|e| DhtError::Io(io::Error::other(e)))?;
        }
        Ok(endpoint)
    }

    /// Observers are notified in registration order, each seeing every
    /// message.
    pub fn add_observer(&mut self, observer: Rc<RefCell<dyn DhtObserver>>) {
        self.observers.push(observer);
    }

    /// Queues a query for sending and arms write interest.
    pub fn queue_query(&mut self, reactor: &mut Reactor, msg: DhtMessage) {
        self.queries.push_back(msg);
        self.update_interest(reactor);
    }

    /// Queues a response for sending; responses drain before queries.
    pub fn queue_response(&mut self, reactor: &mut Reactor, msg: DhtMessage) {
        self.responses.push_back(msg);
        self.update_interest(reactor);
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    fn has_outgoing(&self) -> bool {
        !self.queries.is_empty() || !self.responses.is_empty()
    }

    fn update_interest(&mut self, reactor: &mut Reactor) {
        let interest = if self.has_outgoing() {
            Interest::READABLE | Interest::WRITABLE
        } else {
            Interest::READABLE
        };
        if let Err(e) = reactor.reregister(&mut self.socket, self.token, interest) {
            warn!(error = %e, "dht endpoint reregister failed");
        }
    }

    fn drain_incoming(&mut self, reactor: &mut Reactor) {
        loop {
            let (len, from) = match self.socket.recv_from(&mut self.recv_buf) {
                Ok(ok) => ok,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                // Linux surfaces ICMP port-unreachable of earlier sends
                // here; it concerns one peer, not the socket.
                Err(e) => {
                    self.fan_failure(reactor, None, &DhtError::Io(e));
                    continue;
                }
            };
            match DhtMessage::parse(from, &self.recv_buf[..len]) {
                Ok(msg) => self.dispatch(reactor, &msg),
                Err(e) => {
                    trace!(addr = %from, error = %e, "undecodable datagram");
                    self.fan_failure(reactor, Some(from), &e);
                }
            }
        }
    }

    fn drain_outgoing(&mut self, reactor: &mut Reactor) {
        loop {
            let from_responses = !self.responses.is_empty();
            let Some(msg) = self
                .responses
                .front()
                .or_else(|| self.queries.front())
                .cloned()
            else {
                break;
            };
            match self.socket.send_to(&msg.encode(), msg.addr) {
                Ok(_) => {
                    if from_responses {
                        self.responses.pop_front();
                        self.fan_out(reactor, |obs, msg, ctx| obs.response_sent(msg, ctx), &msg);
                    } else {
                        self.queries.pop_front();
                        self.fan_out(reactor, |obs, msg, ctx| obs.query_sent(msg, ctx), &msg);
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    // Drop the undeliverable message, keep the socket.
                    if from_responses {
                        self.responses.pop_front();
                    } else {
                        self.queries.pop_front();
                    }
                    self.fan_failure(reactor, Some(msg.addr), &DhtError::Io(e));
                }
            }
        }
    }

    fn dispatch(&mut self, reactor: &mut Reactor, msg: &DhtMessage) {
        self.fan_out(reactor, |obs, msg, ctx| obs.message_received(msg, ctx), msg);
        match &msg.payload {
            DhtPayload::Response(_) => {
                self.fan_out(reactor, |obs, msg, ctx| obs.response_received(msg, ctx), msg);
            }
            DhtPayload::Query(query) => {
                let query = query.clone();
                self.fan_out(
                    reactor,
                    move |obs, msg, ctx| obs.query_received(msg, &query, ctx),
                    msg,
                );
            }
            DhtPayload::Error { code, message } => {
                let (code, text) = (*code, message.clone());
                self.fan_out(
                    reactor,
                    move |obs, msg, ctx| obs.error_received(msg, code, &text, ctx),
                    msg,
                );
            }
            DhtPayload::Unknown => {
                self.fan_out(reactor, |obs, msg, ctx| obs.unknown_received(msg, ctx), msg);
            }
        }
    }

    fn fan_out(
        &mut self,
        reactor: &mut Reactor,
        hook: impl Fn(&mut dyn DhtObserver, &DhtMessage, &mut DhtContext<'_>),
        msg: &DhtMessage,
    ) {
        let Self {
            observers,
            queries,
            responses,
            ..
        } = self;
        let mut ctx = DhtContext {
            reactor,
            queries,
            responses,
        };
        for observer in observers.iter() {
            hook(&mut *observer.borrow_mut(), msg, &mut ctx);
        }
    }

    fn fan_failure(&mut self, _reactor: &mut Reactor, addr: Option<SocketAddr>, error: &DhtError) {
        for observer in self.observers.iter() {
            observer.borrow_mut().failure(addr, error);
        }
    }
}

impl EventSink for DhtEndpoint {
    fn on_ready(&mut self, reactor: &mut Reactor, event: &Event) {
        if event.is_readable() {
            self.drain_incoming(reactor);
        }
        if event.is_writable() {
            self.drain_outgoing(reactor);
        }
        self.update_interest(reactor);
    }

    fn on_shutdown(&mut self) -> io::Result<()> {
        // Dropping the socket closes it; UDP has nothing to flush.
        Ok(())
    }
}
