//! Protocol constants and tuning parameters.

use std::time::Duration;

// ============================================================================
// DHT
// ============================================================================

/// Default UDP port for the DHT endpoint.
pub const DEFAULT_DHT_PORT: u16 = 6881;

/// Well-known bootstrap routers, used when no node file is available.
pub const BOOTSTRAP_ROUTERS: &[&str] = &[
    "router.bittorrent.com:6881",
    "dht.transmissionbt.com:6881",
    "router.utorrent.com:6881",
];

/// How long an outgoing query waits for its response.
pub const QUERY_TTL: Duration = Duration::from_secs(3);

/// How long a spoofing address stays blacklisted.
pub const BLACKLIST_TTL: Duration = Duration::from_secs(3600);

/// Routing table soft cap; crossing it triggers eviction down to
/// [`ROUTING_KEEP_NODES`].
pub const ROUTING_MAX_NODES: usize = 20_000;

/// Survivor count after an overflow eviction.
pub const ROUTING_KEEP_NODES: usize = ROUTING_MAX_NODES / 2;

/// Nodes contacted more recently than this are not lookup candidates.
pub const NODE_COLD_DOWN: Duration = Duration::from_secs(120);

/// Cadence of routing-table / correlator lazy-expiry sweeps.
pub const REFRESH_INTERVAL: Duration = Duration::from_secs(3);

// ============================================================================
// BitTorrent wire (BEP-3 / BEP-10 / BEP-9)
// ============================================================================

/// Length of the fixed peer-wire handshake.
pub const HANDSHAKE_LEN: usize = 68;

/// Peer-wire message id of extension-protocol messages (BEP-10).
pub const EXTENDED_MSG_ID: u8 = 0x14;

/// Size of one ut_metadata piece (BEP-9).
pub const METADATA_PIECE_SIZE: usize = 16384;

/// Upper bound accepted for `metadata_size`; larger advertisements are
/// treated as a protocol error before any allocation happens.
pub const MAX_METADATA_SIZE: usize = 16 * 1024 * 1024;

/// Largest extension frame accepted from a peer.
pub const MAX_WIRE_FRAME: usize = METADATA_PIECE_SIZE + 1024;

// ============================================================================
// Metadata download scheduling
// ============================================================================

/// Wall-clock budget for one info-hash before its group is abandoned.
pub const GROUP_TTL: Duration = Duration::from_secs(120);

/// Cadence of the download scheduler tick.
pub const SCHEDULE_INTERVAL: Duration = Duration::from_secs(4);

/// TCP connect budget for one peer.
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(9);

/// Budget for each handshake / extension-handshake step.
pub const STEP_TIMEOUT: Duration = Duration::from_secs(5);

/// Budget for each requested metadata piece.
pub const PIECE_TIMEOUT: Duration = Duration::from_secs(8);

/// Overall budget for a single exchange attempt, connect included.
pub const TASK_TIMEOUT: Duration = Duration::from_secs(45);

/// Concurrent download task slots driven by the scheduler.
pub const DEFAULT_TASK_SLOTS: usize = 64;
