//! btfetch - trackerless torrent metadata retrieval
//!
//! This library resolves info-hashes into torrent metadata without
//! trackers: it walks the BitTorrent Mainline DHT ([BEP-5]) to find peers
//! holding an info-hash, then pulls the metadata from those peers over TCP
//! with the extension protocol ([BEP-10]) and metadata exchange ([BEP-9]).
//!
//! Everything runs cooperatively on a single thread. The foundation is a
//! small non-blocking runtime: [`reactor`] (a mio poll loop), [`timer`] (a
//! hashed timing wheel), [`expire`] (lazily-expiring maps) and [`tcp`] (an
//! explicit read/write-chaining connection state machine), with the DHT
//! client ([`dht`]) and the BEP-9 downloader ([`metadata`]) built on top.
//!
//! # Modules
//!
//! - [`bencode`] - BEP-3 bencode encoding/decoding
//! - [`timer`] - hashed timing wheel and slot storage
//! - [`reactor`] - the single-threaded event loop
//! - [`expire`] - TTL map for request correlation and blacklists
//! - [`tcp`] - non-blocking TCP connection state machine
//! - [`dht`] - KRPC messages, routing table, UDP endpoint, observers
//! - [`metadata`] - BEP-9 exchange state machine and crawl orchestration
//!
//! [BEP-5]: http://bittorrent.org/beps/bep_0005.html
//! [BEP-9]: http://bittorrent.org/beps/bep_0009.html
//! [BEP-10]: http://bittorrent.org/beps/bep_0010.html

pub mod app;
pub mod bencode;
pub mod config;
pub mod console;
pub mod constants;
pub mod dht;
pub mod expire;
pub mod info_hash;
pub mod metadata;
pub mod reactor;
pub mod tcp;
pub mod timer;

pub use config::Config;
pub use dht::{DhtEndpoint, DhtError, DhtMessage, DhtNode, NodeId, RoutingTable};
pub use expire::TimeoutMap;
pub use info_hash::InfoHash;
pub use metadata::{Crawler, DownloadGroup, MetadataExchange};
pub use reactor::{EventSink, Reactor, ReactorError};
pub use tcp::{ConnState, Setting, TcpConnection};
pub use timer::{SlotSpace, TimerHandle, TimingWheel};
