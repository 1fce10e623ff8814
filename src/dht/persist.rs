//! Node list persistence.
//!
//! Two formats are accepted when loading: a flat file of 26-byte compact
//! node records (what [`save_nodes`] writes), and a bencoded dictionary
//! with a `nodes` key holding the same encoding, the shape common clients
//! use for their DHT state files. Saving always writes the flat form.

use super::error::DhtError;
use super::message::{encode_compact_nodes, parse_compact_nodes};
use super::node::DhtNode;
use crate::bencode::decode;
use std::fs;
use std::path::Path;
use tracing::debug;

pub fn load_nodes(path: &Path) -> Result<Vec<DhtNode>, DhtError> {
    let data = fs::read(path)?;
    let nodes = if data.first() == Some(&b'd') {
        let value = decode(&data)
            .map_err(|e| DhtError::InvalidNodeFile(format!("bencode state file: {e}")))?;
        let blob = value
            .get_bytes("nodes")
            .ok_or_else(|| DhtError::InvalidNodeFile("state file has no 'nodes' key".into()))?;
        parse_compact_nodes(blob)
    } else {
        if data.len() % 26 != 0 {
            return Err(DhtError::InvalidNodeFile(format!(
                "flat node file length {} not a multiple of 26",
                data.len()
            )));
        }
        parse_compact_nodes(&data)
    };
    debug!(path = %path.display(), count = nodes.len(), "loaded node file");
    Ok(nodes)
}

pub fn save_nodes(path: &Path, nodes: &[DhtNode]) -> Result<(), DhtError> {
    let blob = encode_compact_nodes(nodes);
    fs::write(path, &blob)?;
    debug!(path = %path.display(), count = nodes.len(), "saved node file");
    Ok(())
}
