use super::message::{DhtMessage, DhtPayload};
use super::node::{DhtNode, NodeId, NodeRecord};
use super::transport::{DhtContext, DhtObserver};
use crate::constants::{BLACKLIST_TTL, QUERY_TTL, ROUTING_KEEP_NODES, ROUTING_MAX_NODES};
use crate::expire::TimeoutMap;
use std::cell::RefCell;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::rc::Rc;
use std::time::{Duration, Instant};
use tracing::{debug, info};

/// Shared handle to a node's liveness record.
///
/// The table, the pending-query map, and the pending map's expiry callback
/// all touch the same record; on one thread `Rc<RefCell<_>>` is exactly the
/// shared-mutation shape that needs, with no locking.
type RecordRef = Rc<RefCell<NodeRecord>>;

struct NodeEntry {
    node: DhtNode,
    record: RecordRef,
}

/// A query we sent and still expect an answer to, pinned to the identity we
/// believed the node had at send time.
struct PendingQuery {
    id: NodeId,
    record: RecordRef,
}

/// Flat, capacity-bounded view of the DHT as this crawler has experienced
/// it: one entry per address, ranked by behavior, plus a TTL blacklist of
/// addresses caught answering under a different identity.
pub struct RoutingTable {
    nodes: HashMap<SocketAddr, NodeEntry>,
    pending: TimeoutMap<SocketAddr, PendingQuery>,
    blacklist: TimeoutMap<SocketAddr, ()>,
}

impl RoutingTable {
    pub fn new() -> Self {
        Self {
            nodes: HashMap::new(),
            pending: TimeoutMap::new(),
            blacklist: TimeoutMap::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Inserts if absent; idempotent for a known address.
    pub fn put_node(&mut self, now: Instant, node: DhtNode) {
        self.nodes
            .entry(node.addr)
            .or_insert_with(|| NodeEntry {
                node,
                record: Rc::new(RefCell::new(NodeRecord::new(now))),
            });
    }

    /// Insert-if-absent plus a response event, for nodes learned by hearing
    /// from them directly.
    pub fn put_node_with_response(&mut self, now: Instant, node: DhtNode) {
        self.put_node(now, node.clone());
        if let Some(entry) = self.nodes.get(&node.addr) {
            entry.record.borrow_mut().on_response(now);
        }
    }

    pub fn is_blacklisted(&mut self, now: Instant, addr: &SocketAddr) -> bool {
        self.blacklist.contains(now, addr)
    }

    /// Nodes with no traffic either way since `now - min_idle`, up to
    /// `limit`, in no particular order beyond the filter.
    pub fn cold_down_nodes(&self, now: Instant, min_idle: Duration, limit: usize) -> Vec<DhtNode> {
        // `Instant` has no epoch: early in process life `now - min_idle`
        // underflows, and then only never-contacted nodes qualify.
        let threshold = now.checked_sub(min_idle);
        self.nodes
            .values()
            .filter(|e| {
                let record = e.record.borrow();
                match threshold {
                    Some(t) => record.is_cold(t),
                    None => record.queries() == 0 && record.responses() == 0,
                }
            })
            .take(limit)
            .map(|e| e.node.clone())
            .collect()
    }

    /// All known nodes with at least one recent success, for persistence.
    pub fn good_nodes(&self) -> Vec<DhtNode> {
        self.nodes
            .values()
            .filter(|e| e.record.borrow().recent_successes() > 0)
            .map(|e| e.node.clone())
            .collect()
    }

    /// Lazy-expiry sweep plus overflow eviction; run on a fixed interval.
    pub fn refresh(&mut self, now: Instant) {
        self.pending.refresh(now);
        self.blacklist.refresh(now);
        self.evict_overflow();
    }

    fn evict_overflow(&mut self) {
        if self.nodes.len() <= ROUTING_MAX_NODES {
            return;
        }
        let mut ranked: Vec<(SocketAddr, (u32, std::cmp::Reverse<u32>, Instant))> = self
            .nodes
            .iter()
            .map(|(addr, entry)| (*addr, entry.record.borrow().eviction_rank()))
            .collect();
        ranked.sort_by(|a, b| a.1.cmp(&b.1));
        ranked.truncate(ROUTING_KEEP_NODES);
        let keep: std::collections::HashSet<SocketAddr> =
            ranked.into_iter().map(|(addr, _)| addr).collect();
        let before = self.nodes.len();
        self.nodes.retain(|addr, _| keep.contains(addr));
        info!(before, after = self.nodes.len(), "routing table eviction");
    }

    fn handle_query_sent(&mut self, now: Instant, addr: SocketAddr) {
        let Some(entry) = self.nodes.get(&addr) else {
            return;
        };
        entry.record.borrow_mut().on_query(now);
        let pending = PendingQuery {
            id: entry.node.id,
            record: entry.record.clone(),
        };
        // Expiry of the pending entry IS the timeout event.
        self.pending.put_with(now, addr, pending, QUERY_TTL, |_, p| {
            p.record.borrow_mut().on_timeout();
        });
    }

    fn handle_response(&mut self, now: Instant, msg: &DhtMessage) {
        // Unsolicited, duplicate, or too late: nothing pending, ignore.
        let Some(pending) = self.pending.take(now, &msg.addr) else {
            return;
        };

        // A different id answering for a known address is identity
        // spoofing; drop the node and refuse the address for a while.
        let responder_id = msg.sender_id();
        if responder_id != Some(pending.id) {
            debug!(addr = %msg.addr, "responder id changed, blacklisting");
            self.nodes.remove(&msg.addr);
            self.blacklist.put(now, msg.addr, (), BLACKLIST_TTL);
            return;
        }

        pending.record.borrow_mut().on_response(now);

        if let DhtPayload::Response(response) = &msg.payload {
            for node in &response.nodes {
                if !self.blacklist.contains(now, &node.addr) {
                    self.put_node(now, node.clone());
                }
            }
        }
    }
}

impl Default for RoutingTable {
    fn default() -> Self {
        Self::new()
    }
}

impl DhtObserver for RoutingTable {
    fn query_sent(&mut self, msg: &DhtMessage, _ctx: &mut DhtContext<'_>) {
        self.handle_query_sent(Instant::now(), msg.addr);
    }

    fn response_received(&mut self, msg: &DhtMessage, _ctx: &mut DhtContext<'_>) {
        self.handle_response(Instant::now(), msg);
    }
}

#[cfg(test)]
impl RoutingTable {
    pub(crate) fn record(&self, addr: &SocketAddr) -> Option<RecordRef> {
        self.nodes.get(addr).map(|e| e.record.clone())
    }

    pub(crate) fn contains(&self, addr: &SocketAddr) -> bool {
        self.nodes.contains_key(addr)
    }

    pub(crate) fn query_sent_at(&mut self, now: Instant, addr: SocketAddr) {
        self.handle_query_sent(now, addr);
    }

    pub(crate) fn response_received_at(&mut self, now: Instant, msg: &DhtMessage) {
        self.handle_response(now, msg);
    }
}
