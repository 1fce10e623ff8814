use super::message::DhtMessage;
use super::transport::{DhtContext, DhtObserver};
use crate::constants::QUERY_TTL;
use crate::expire::TimeoutMap;
use std::net::SocketAddr;
use std::time::Instant;

/// Callback for the response to a single outgoing query. Dropped unfired if
/// the query times out.
pub type ResponseCallback = Box<dyn FnOnce(&DhtMessage, &mut DhtContext<'_>)>;

/// Matches outgoing queries to whatever next arrives from the queried
/// address.
///
/// Keyed by address, so each address has at most one pending query;
/// registering again displaces the earlier callback. KRPC transaction ids
/// would allow finer matching, but for a crawler that never has two
/// in-flight queries to one node the address is enough, and it is the same
/// key the routing table's timeout bookkeeping uses.
pub struct QueryCorrelator {
    pending: TimeoutMap<SocketAddr, ResponseCallback>,
}

impl QueryCorrelator {
    pub fn new() -> Self {
        Self {
            pending: TimeoutMap::new(),
        }
    }

    /// Registers the callback for the next message from `addr`. Queue the
    /// query itself on the endpoint separately.
    pub fn expect(&mut self, now: Instant, addr: SocketAddr, callback: ResponseCallback) {
        self.pending.put(now, addr, callback, QUERY_TTL);
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// Drops expired callbacks; run on a fixed interval.
    pub fn refresh(&mut self, now: Instant) {
        self.pending.refresh(now);
    }
}

impl Default for QueryCorrelator {
    fn default() -> Self {
        Self::new()
    }
}

impl DhtObserver for QueryCorrelator {
    fn message_received(&mut self, msg: &DhtMessage, ctx: &mut DhtContext<'_>) {
        if let Some(callback) = self.pending.take(Instant::now(), &msg.addr) {
            callback(msg, ctx);
        }
    }
}
