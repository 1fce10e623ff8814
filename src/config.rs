//! Runtime configuration, resolved from CLI arguments.

use crate::constants::{DEFAULT_DHT_PORT, DEFAULT_TASK_SLOTS};
use crate::dht::NodeId;
use crate::info_hash::InfoHash;
use clap::Parser;
use std::path::PathBuf;

/// Trackerless torrent metadata crawler.
///
/// Reads hex info-hashes from a file, resolves them to peers through the
/// Mainline DHT, downloads their metadata (BEP-9), and writes each blob to
/// `<metadata-dir>/<hex>.torrent`.
#[derive(Debug, Parser)]
#[command(name = "btfetch", version, about)]
pub struct Config {
    /// UDP port for the DHT endpoint.
    #[arg(long, default_value_t = DEFAULT_DHT_PORT)]
    pub port: u16,

    /// File with one hex info-hash per line.
    #[arg(long)]
    pub info_hashes: PathBuf,

    /// Output directory for downloaded metadata.
    #[arg(long, default_value = "metadata")]
    pub metadata_dir: PathBuf,

    /// Bootstrap node file: flat 26-byte compact records, or a bencoded
    /// client state file with a `nodes` key. Falls back to the well-known
    /// routers when absent.
    #[arg(long)]
    pub node_file: Option<PathBuf>,

    /// Seed the table by sending find_node to the loaded addresses instead
    /// of trusting their persisted ids.
    #[arg(long)]
    pub bootstrap_query: bool,

    /// Our DHT node id as 40 hex chars; random when omitted.
    #[arg(long, value_parser = parse_node_id)]
    pub node_id: Option<NodeId>,

    /// Concurrent info-hash task slots.
    #[arg(long, default_value_t = DEFAULT_TASK_SLOTS)]
    pub tasks: usize,

    /// Read commands from stdin (help, stats, save-nodes, quit).
    #[arg(long)]
    pub console: bool,
}

impl Config {
    pub fn self_id(&self) -> NodeId {
        self.node_id.unwrap_or_else(NodeId::generate)
    }
}

fn parse_node_id(s: &str) -> Result<NodeId, String> {
    let hash = InfoHash::from_hex(s).map_err(|e| e.to_string())?;
    Ok(NodeId(hash.0))
}
