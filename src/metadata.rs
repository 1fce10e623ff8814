//! BEP-9 metadata exchange and its per-info-hash orchestration.
//!
//! [`MetadataExchange`] is the protocol state machine for pulling one
//! torrent's metadata from one peer over TCP
//! (`Connecting → Handshaking → GettingPeerInfo → Downloading` ending in
//! `Completed` or `CheckFailed`), built entirely on the non-blocking
//! read/write chaining of [`crate::tcp::TcpConnection`].
//!
//! [`Crawler`] turns a queue of info-hashes into exchanges: each scheduler
//! tick it walks its task slots, replaces finished groups, sends `get_peers`
//! toward the XOR-closest cold node, and starts an exchange per fresh peer a
//! response yields. A group dies on its first completed exchange or when its
//! wall-clock budget runs out, whichever comes first.

mod crawler;
mod error;
mod group;
mod piece;
mod task;

pub use crawler::{CompleteHook, CrawlStats, Crawler};
pub use error::ExchangeError;
pub use group::{DownloadGroup, GroupRef};
pub use piece::PieceBuffer;
pub use task::{ExchangeEvents, MetadataExchange, Progress};

#[cfg(test)]
mod tests;
