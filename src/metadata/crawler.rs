use super::group::{DownloadGroup, GroupRef};
use super::task::{ExchangeEvents, MetadataExchange, Progress};
use crate::constants::{NODE_COLD_DOWN, SCHEDULE_INTERVAL};
use crate::dht::{
    DhtContext, DhtEndpoint, DhtMessage, DhtPayload, NodeId, QueryCorrelator, RoutingTable,
};
use crate::info_hash::InfoHash;
use crate::reactor::Reactor;
use bytes::Bytes;
use std::cell::RefCell;
use std::collections::{HashSet, VecDeque};
use std::net::SocketAddr;
use std::rc::Rc;
use std::time::Instant;
use tracing::{debug, info, trace};

/// Outcome counters across all groups and attempts.
#[derive(Debug, Default)]
pub struct CrawlStats {
    pub groups_started: u64,
    pub queries_sent: u64,
    pub peers_attempted: u64,
    pub completed: u64,
    pub check_failed: u64,
    pub timeouts: u64,
    pub failures: u64,
    pub closes: u64,
}

impl CrawlStats {
    pub fn log_summary(&self, queued: usize, active_groups: usize) {
        info!(
            queued,
            active_groups,
            groups_started = self.groups_started,
            get_peers_sent = self.queries_sent,
            peers_attempted = self.peers_attempted,
            completed = self.completed,
            check_failed = self.check_failed,
            timeouts = self.timeouts,
            failures = self.failures,
            "crawl progress"
        );
    }
}

/// Hook receiving every successfully downloaded metadata blob; the
/// persistence layer lives behind it.
pub type CompleteHook = Box<dyn FnMut(&mut Reactor, &InfoHash, &Bytes)>;

/// One in-flight info-hash: its group plus the addresses already used, so
/// no node is asked for peers twice and no peer is attempted twice.
struct TaskSlot {
    group: GroupRef,
    visited_peers: HashSet<SocketAddr>,
    visited_download: HashSet<SocketAddr>,
}

struct CrawlerCore {
    routing: Rc<RefCell<RoutingTable>>,
    endpoint: Rc<RefCell<DhtEndpoint>>,
    correlator: Rc<RefCell<QueryCorrelator>>,
    self_id: NodeId,
    queue: VecDeque<InfoHash>,
    slots: Vec<Option<TaskSlot>>,
    stats: CrawlStats,
    on_complete: CompleteHook,
    drained_logged: bool,
}

/// Drives the download pipeline: a queue of info-hashes, a fixed number of
/// concurrent task slots, and a scheduler tick that keeps slots fed.
///
/// Cloning yields another handle to the same crawl.
#[derive(Clone)]
pub struct Crawler {
    core: Rc<RefCell<CrawlerCore>>,
}

impl Crawler {
    pub fn new(
        routing: Rc<RefCell<RoutingTable>>,
        endpoint: Rc<RefCell<DhtEndpoint>>,
        correlator: Rc<RefCell<QueryCorrelator>>,
        self_id: NodeId,
        info_hashes: Vec<InfoHash>,
        slots: usize,
        on_complete: CompleteHook,
    ) -> Self {
        let mut empty_slots = Vec::new();
        empty_slots.resize_with(slots.max(1), || None);
        Self {
            core: Rc::new(RefCell::new(CrawlerCore {
                routing,
                endpoint,
                correlator,
                self_id,
                queue: info_hashes.into(),
                slots: empty_slots,
                stats: CrawlStats::default(),
                on_complete,
                drained_logged: false,
            })),
        }
    }

    /// Arms the scheduler tick. The crawler keeps serving until the
    /// reactor stops, even once the queue drains; the DHT side stays
    /// useful to others.
    pub fn start(&self, reactor: &mut Reactor) {
        let core = self.core.clone();
        reactor.interval(SCHEDULE_INTERVAL, move |reactor| {
            CrawlerCore::tick(&core, reactor);
            true
        });
    }

    pub fn log_summary(&self) {
        let core = self.core.borrow();
        let active = core.slots.iter().flatten().count();
        core.stats.log_summary(core.queue.len(), active);
    }

    pub fn is_finished(&self) -> bool {
        let core = self.core.borrow();
        core.queue.is_empty() && core.slots.iter().all(Option::is_none)
    }
}

impl CrawlerCore {
    fn tick(core: &Rc<RefCell<CrawlerCore>>, reactor: &mut Reactor) {
        let now = Instant::now();
        let mut this = core.borrow_mut();

        // Replace slots whose group completed or ran out its clock.
        for i in 0..this.slots.len() {
            let stale = match &this.slots[i] {
                Some(slot) => !slot.group.borrow().is_alive(now),
                None => this.queue.front().is_some(),
            };
            if !stale {
                continue;
            }
            if let Some(old) = this.slots[i].take() {
                old.group.borrow_mut().stop();
                trace!(hash = %old.group.borrow().info_hash(), "group retired");
            }
            let self_id = this.self_id;
            this.slots[i] = this.queue.pop_front().map(|hash| {
                this.stats.groups_started += 1;
                debug!(%hash, "group started");
                TaskSlot {
                    group: DownloadGroup::new(now, hash, self_id),
                    visited_peers: HashSet::new(),
                    visited_download: HashSet::new(),
                }
            });
        }

        if this.queue.is_empty()
            && this.slots.iter().all(Option::is_none)
            && !this.drained_logged
        {
            this.drained_logged = true;
            info!("info-hash queue drained, crawl idle");
        }

        // One get_peers per active slot per tick, aimed at the cold node
        // XOR-closest to the slot's info-hash.
        for i in 0..this.slots.len() {
            let Some((node_addr, info_hash, group)) = ({
                let slot = this.slots[i].as_ref();
                slot.and_then(|slot| {
                    let info_hash = slot.group.borrow().info_hash();
                    this.routing
                        .borrow()
                        .cold_down_nodes(now, NODE_COLD_DOWN, usize::MAX)
                        .into_iter()
                        .filter(|n| !slot.visited_peers.contains(&n.addr))
                        .min_by_key(|n| n.id.distance(info_hash.as_bytes()))
                        .map(|n| (n.addr, info_hash, slot.group.clone()))
                })
            }) else {
                continue;
            };

            if let Some(slot) = this.slots[i].as_mut() {
                slot.visited_peers.insert(node_addr);
            }
            this.stats.queries_sent += 1;

            let msg = DhtMessage::get_peers(node_addr, this.self_id, info_hash);
            let callback_core = core.clone();
            this.correlator.borrow_mut().expect(
                now,
                node_addr,
                Box::new(move |msg, ctx| {
                    CrawlerCore::on_peers_response(&callback_core, &group, msg, ctx);
                }),
            );
            this.endpoint.borrow_mut().queue_query(reactor, msg);
        }
    }

    /// A queried node answered our `get_peers`: start an exchange for each
    /// peer address we have not tried yet.
    fn on_peers_response(
        core: &Rc<RefCell<CrawlerCore>>,
        group: &GroupRef,
        msg: &DhtMessage,
        ctx: &mut DhtContext<'_>,
    ) {
        let now = Instant::now();
        if !group.borrow().is_alive(now) {
            return;
        }
        let DhtPayload::Response(response) = &msg.payload else {
            return;
        };
        if response.peers.is_empty() {
            return;
        }

        let fresh: Vec<SocketAddr> = {
            let mut this = core.borrow_mut();
            let Some(slot) = this
                .slots
                .iter_mut()
                .flatten()
                .find(|s| Rc::ptr_eq(&s.group, group))
            else {
                return;
            };
            let fresh: Vec<SocketAddr> = response
                .peers
                .iter()
                .copied()
                .filter(|p| slot.visited_download.insert(*p))
                .collect();
            this.stats.peers_attempted += fresh.len() as u64;
            fresh
        };

        trace!(hash = %group.borrow().info_hash(), peers = fresh.len(), "starting exchanges");
        for peer in fresh {
            Self::start_exchange(core, ctx.reactor, group.clone(), peer);
        }
    }

    fn start_exchange(
        core: &Rc<RefCell<CrawlerCore>>,
        reactor: &mut Reactor,
        group: GroupRef,
        peer: SocketAddr,
    ) {
        let events = ExchangeEvents {
            on_complete: Some(Box::new({
                let core = core.clone();
                move |reactor, hash, bytes| {
                    let mut this = core.borrow_mut();
                    this.stats.completed += 1;
                    info!(%hash, len = bytes.len(), "metadata downloaded");
                    (this.on_complete)(reactor, &hash, &bytes);
                }
            })),
            on_failed: Some(Box::new({
                let core = core.clone();
                move |_reactor, progress, error| {
                    core.borrow_mut().stats.failures += 1;
                    trace!(?progress, %error, "exchange failed");
                }
            })),
            on_timeout: Some(Box::new({
                let core = core.clone();
                move |_reactor, progress| {
                    core.borrow_mut().stats.timeouts += 1;
                    trace!(?progress, "exchange timed out");
                }
            })),
            on_close: Some(Box::new({
                let core = core.clone();
                move |_reactor, progress| {
                    let mut this = core.borrow_mut();
                    this.stats.closes += 1;
                    if progress == Progress::CheckFailed {
                        this.stats.check_failed += 1;
                    }
                }
            })),
        };
        MetadataExchange::start(reactor, group, peer, events);
    }
}
