use super::error::DhtError;
use rand::Rng as _;
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::{Duration, Instant};

/// Recent-timeout counts above this all rank the same in eviction.
const TIMEOUT_RANK_CAP: u32 = 3;

/// A 20-byte DHT node identity.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct NodeId(pub [u8; 20]);

impl NodeId {
    pub fn generate() -> Self {
        let mut id = [0u8; 20];
        rand::rng().fill(&mut id);
        Self(id)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, DhtError> {
        let arr: [u8; 20] = bytes.try_into().map_err(|_| DhtError::InvalidNodeId)?;
        Ok(Self(arr))
    }

    pub fn as_bytes(&self) -> &[u8; 20] {
        &self.0
    }

    /// Kademlia XOR distance to an arbitrary 20-byte key, comparable as an
    /// unsigned big-endian byte array.
    pub fn distance(&self, key: &[u8; 20]) -> [u8; 20] {
        let mut dist = [0u8; 20];
        for (i, d) in dist.iter_mut().enumerate() {
            *d = self.0[i] ^ key[i];
        }
        dist
    }
}

impl fmt::Debug for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NodeId({:02x}{:02x}..)", self.0[0], self.0[1])
    }
}

/// An address/identity pair as learned from the network or a node file.
///
/// The address is normalized to plain ip+port on construction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DhtNode {
    pub id: NodeId,
    pub addr: SocketAddr,
}

impl DhtNode {
    pub fn new(id: NodeId, addr: SocketAddr) -> Self {
        Self {
            id,
            addr: SocketAddr::new(addr.ip(), addr.port()),
        }
    }

    /// Parses one 26-byte compact record: 20-byte id, IPv4, big-endian port.
    pub fn from_compact(data: &[u8]) -> Option<Self> {
        if data.len() != 26 {
            return None;
        }
        let id = NodeId::from_bytes(&data[..20]).ok()?;
        let ip = Ipv4Addr::new(data[20], data[21], data[22], data[23]);
        let port = u16::from_be_bytes([data[24], data[25]]);
        Some(Self::new(id, SocketAddr::new(IpAddr::V4(ip), port)))
    }

    /// Compact form; `None` for IPv6 addresses, which the format cannot
    /// carry.
    pub fn to_compact(&self) -> Option<[u8; 26]> {
        let mut compact = [0u8; 26];
        compact[..20].copy_from_slice(&self.id.0);
        match self.addr {
            SocketAddr::V4(v4) => {
                compact[20..24].copy_from_slice(&v4.ip().octets());
                compact[24..26].copy_from_slice(&v4.port().to_be_bytes());
                Some(compact)
            }
            SocketAddr::V6(_) => None,
        }
    }
}

/// Liveness statistics for one known node.
///
/// `recent_successes` resets on any timeout and `recent_timeouts` resets on
/// any response, so each streak measures the current run, not history.
#[derive(Debug, Clone)]
pub struct NodeRecord {
    created_at: Instant,
    last_query: Option<Instant>,
    last_response: Option<Instant>,
    queries: u32,
    responses: u32,
    recent_timeouts: u32,
    recent_successes: u32,
    last_delay: Duration,
    weighted_delay: Duration,
}

impl NodeRecord {
    pub fn new(now: Instant) -> Self {
        Self {
            created_at: now,
            last_query: None,
            last_response: None,
            queries: 0,
            responses: 0,
            recent_timeouts: 0,
            recent_successes: 0,
            last_delay: Duration::ZERO,
            weighted_delay: Duration::ZERO,
        }
    }

    pub fn on_query(&mut self, now: Instant) {
        self.last_query = Some(now);
        self.queries += 1;
    }

    pub fn on_timeout(&mut self) {
        self.recent_timeouts += 1;
        self.recent_successes = 0;
    }

    pub fn on_response(&mut self, now: Instant) {
        self.last_response = Some(now);
        self.responses += 1;
        self.recent_timeouts = 0;
        self.recent_successes += 1;
        self.last_delay = self
            .last_query
            .map_or(Duration::ZERO, |q| now.saturating_duration_since(q));
        self.weighted_delay = if self.weighted_delay.is_zero() {
            self.last_delay
        } else {
            (self.weighted_delay + self.last_delay) / 2
        };
    }

    /// True when neither direction saw traffic since `threshold`.
    pub fn is_cold(&self, threshold: Instant) -> bool {
        self.last_query.is_none_or(|t| t < threshold)
            && self.last_response.is_none_or(|t| t < threshold)
    }

    /// Eviction sort key: fewer recent timeouts (capped), more recent
    /// successes, older creation. Lower sorts better.
    pub fn eviction_rank(&self) -> (u32, std::cmp::Reverse<u32>, Instant) {
        (
            self.recent_timeouts.min(TIMEOUT_RANK_CAP),
            std::cmp::Reverse(self.recent_successes),
            self.created_at,
        )
    }

    pub fn recent_successes(&self) -> u32 {
        self.recent_successes
    }

    pub fn recent_timeouts(&self) -> u32 {
        self.recent_timeouts
    }

    pub fn queries(&self) -> u32 {
        self.queries
    }

    pub fn responses(&self) -> u32 {
        self.responses
    }

    pub fn weighted_delay(&self) -> Duration {
        self.weighted_delay
    }

    #[cfg(test)]
    pub(crate) fn force_streaks(&mut self, timeouts: u32, successes: u32) {
        self.recent_timeouts = timeouts;
        self.recent_successes = successes;
    }
}
