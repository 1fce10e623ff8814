//! Wiring: builds the reactor, the DHT side, and the crawler from a
//! [`Config`], then runs the loop until shutdown.

use crate::config::Config;
use crate::console::Console;
use crate::constants::{BOOTSTRAP_ROUTERS, REFRESH_INTERVAL};
use crate::dht::{
    load_nodes, save_nodes, DhtEndpoint, DhtError, DhtMessage, DhtNode, DhtPayload, DhtResponder,
    DhtStats, NodeId, QueryCorrelator, RoutingTable,
};
use crate::info_hash::InfoHash;
use crate::metadata::Crawler;
use crate::reactor::{Reactor, ReactorError};
use bytes::Bytes;
use rand::seq::SliceRandom as _;
use std::cell::RefCell;
use std::collections::HashSet;
use std::fs;
use std::net::{SocketAddr, ToSocketAddrs as _};
use std::path::Path;
use std::rc::Rc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{info, warn};

const STATS_INTERVAL: Duration = Duration::from_secs(30);

#[derive(Debug, Error)]
pub enum AppError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Dht(#[from] DhtError),

    #[error(transparent)]
    Reactor(#[from] ReactorError),

    #[error("{0}")]
    InvalidConfig(String),
}

pub fn run(config: Config) -> Result<(), AppError> {
    let self_id = config.self_id();
    fs::create_dir_all(&config.metadata_dir)?;
    let info_hashes = load_info_hash_queue(&config.info_hashes, &config.metadata_dir)?;
    if info_hashes.is_empty() {
        warn!("nothing to download: every queued info-hash already has metadata");
    }

    let mut reactor = Reactor::new()?;
    let endpoint = DhtEndpoint::bind(&mut reactor, config.port)?;
    let routing = Rc::new(RefCell::new(RoutingTable::new()));
    let correlator = Rc::new(RefCell::new(QueryCorrelator::new()));
    let dht_stats = Rc::new(RefCell::new(DhtStats::new()));
    {
        let mut ep = endpoint.borrow_mut();
        ep.add_observer(routing.clone());
        ep.add_observer(correlator.clone());
        ep.add_observer(Rc::new(RefCell::new(DhtResponder::new(self_id))));
        ep.add_observer(dht_stats.clone());
    }

    bootstrap(
        &mut reactor,
        &config,
        self_id,
        &routing,
        &correlator,
        &endpoint,
    )?;

    // Lazy-expiry sweeps: pending queries, blacklist, table overflow.
    {
        let routing = routing.clone();
        let correlator = correlator.clone();
        reactor.interval(REFRESH_INTERVAL, move |_| {
            let now = Instant::now();
            routing.borrow_mut().refresh(now);
            correlator.borrow_mut().refresh(now);
            true
        });
    }

    let metadata_dir = config.metadata_dir.clone();
    let crawler = Crawler::new(
        routing.clone(),
        endpoint.clone(),
        correlator.clone(),
        self_id,
        info_hashes,
        config.tasks,
        Box::new(move |_reactor, hash, bytes| {
            if let Err(e) = save_metadata(&metadata_dir, hash, bytes) {
                warn!(%hash, error = %e, "failed to persist metadata");
            }
        }),
    );
    crawler.start(&mut reactor);

    {
        let dht_stats = dht_stats.clone();
        let crawler = crawler.clone();
        let routing = routing.clone();
        reactor.interval(STATS_INTERVAL, move |_| {
            dht_stats.borrow().log_summary();
            crawler.log_summary();
            info!(nodes = routing.borrow().len(), "routing table");
            true
        });
    }

    if config.console {
        install_console(&mut reactor, &routing, &crawler, &dht_stats);
    }

    info!(port = config.port, "btfetch running");
    reactor.run()?;
    Ok(())
}

/// Seeds the routing table, either by trusting persisted node ids or by
/// querying the addresses and believing only what they answer. Without a
/// node file the well-known routers are queried, never inserted directly,
/// since their ids are unknown and a made-up id would be "spoofed" at the
/// first response.
fn bootstrap(
    reactor: &mut Reactor,
    config: &Config,
    self_id: NodeId,
    routing: &Rc<RefCell<RoutingTable>>,
    correlator: &Rc<RefCell<QueryCorrelator>>,
    endpoint: &Rc<RefCell<DhtEndpoint>>,
) -> Result<(), AppError> {
    let now = Instant::now();
    let (known_nodes, query_addrs): (Vec<DhtNode>, Vec<SocketAddr>) = match &config.node_file {
        Some(path) => {
            let nodes = load_nodes(path)?;
            if config.bootstrap_query {
                let addrs = nodes.iter().map(|n| n.addr).collect();
                (Vec::new(), addrs)
            } else {
                (nodes, Vec::new())
            }
        }
        None => (Vec::new(), resolve_routers()),
    };

    if known_nodes.is_empty() && query_addrs.is_empty() {
        return Err(AppError::InvalidConfig("no bootstrap nodes".into()));
    }
    info!(
        direct = known_nodes.len(),
        queried = query_addrs.len(),
        "bootstrapping routing table"
    );

    for node in known_nodes {
        routing.borrow_mut().put_node(now, node);
    }

    for addr in query_addrs {
        let msg = DhtMessage::find_node(addr, self_id, NodeId::generate());
        let routing = routing.clone();
        correlator.borrow_mut().expect(
            now,
            addr,
            Box::new(move |msg, _ctx| {
                let DhtPayload::Response(response) = &msg.payload else {
                    return;
                };
                let now = Instant::now();
                let mut table = routing.borrow_mut();
                if let Some(id) = response.id {
                    table.put_node_with_response(now, DhtNode::new(id, msg.addr));
                }
                for node in &response.nodes {
                    table.put_node(now, node.clone());
                }
            }),
        );
        endpoint.borrow_mut().queue_query(reactor, msg);
    }
    Ok(())
}

fn install_console(
    reactor: &mut Reactor,
    routing: &Rc<RefCell<RoutingTable>>,
    crawler: &Crawler,
    dht_stats: &Rc<RefCell<DhtStats>>,
) {
    let stats_crawler = crawler.clone();
    let stats_dht = dht_stats.clone();
    let stats_routing = routing.clone();
    let save_routing = routing.clone();

    Console::new()
        .command("stats", "stats", "dump crawl and dht counters", move |_, _| {
            stats_dht.borrow().log_summary();
            stats_crawler.log_summary();
            println!("routing table: {} nodes", stats_routing.borrow().len());
        })
        .command(
            "save-nodes",
            "save-nodes <path>",
            "write known-good nodes as a compact node file",
            move |_, arg| {
                if arg.is_empty() {
                    println!("usage: save-nodes <path>");
                    return;
                }
                let nodes = save_routing.borrow().good_nodes();
                match save_nodes(Path::new(arg), &nodes) {
                    Ok(()) => println!("saved {} nodes to {arg}", nodes.len()),
                    Err(e) => println!("save failed: {e}"),
                }
            },
        )
        .command("quit", "quit", "shut down", |reactor, _| {
            reactor.shutdown();
        })
        .start(reactor);
}

fn resolve_routers() -> Vec<SocketAddr> {
    let mut addrs = Vec::new();
    for host in BOOTSTRAP_ROUTERS {
        match host.to_socket_addrs() {
            Ok(resolved) => addrs.extend(resolved.filter(|a| a.is_ipv4())),
            Err(e) => warn!(host, error = %e, "bootstrap router did not resolve"),
        }
    }
    addrs
}

/// Loads the work queue: hex info-hashes, one per line, minus the ones
/// whose metadata already sits in the output directory. Shuffled so
/// restarts do not hammer the same prefix of the file.
fn load_info_hash_queue(path: &Path, metadata_dir: &Path) -> Result<Vec<InfoHash>, AppError> {
    let text = fs::read_to_string(path)?;

    let mut downloaded = HashSet::new();
    if let Ok(entries) = fs::read_dir(metadata_dir) {
        for entry in entries.flatten() {
            let name = entry.file_name();
            if let Some(stem) = name.to_string_lossy().split('.').next() {
                downloaded.insert(stem.to_string());
            }
        }
    }

    let mut hashes = Vec::new();
    for line in text.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        match InfoHash::from_hex(line) {
            Ok(hash) => {
                if !downloaded.contains(&hash.to_hex()) {
                    hashes.push(hash);
                }
            }
            Err(_) => warn!(line, "skipping unparsable info-hash"),
        }
    }
    hashes.shuffle(&mut rand::rng());
    info!(
        path = %path.display(),
        queued = hashes.len(),
        skipped = downloaded.len(),
        "loaded info-hash queue"
    );
    Ok(hashes)
}

fn save_metadata(dir: &Path, hash: &InfoHash, bytes: &Bytes) -> std::io::Result<()> {
    let path = dir.join(format!("{}.torrent", hash.to_hex()));
    fs::write(path, bytes)
}
