use super::error::DhtError;
use super::node::{DhtNode, NodeId};
use crate::bencode::{decode, dict, encode, Value};
use crate::info_hash::InfoHash;
use bytes::Bytes;
use rand::Rng as _;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};

pub type TransactionId = Bytes;

/// A query as it appears on the wire, tagged by name.
#[derive(Debug, Clone)]
pub enum DhtQuery {
    Ping {
        id: NodeId,
    },
    FindNode {
        id: NodeId,
        target: NodeId,
    },
    GetPeers {
        id: NodeId,
        info_hash: InfoHash,
    },
    AnnouncePeer {
        id: NodeId,
        info_hash: InfoHash,
        port: u16,
        token: Bytes,
    },
    /// A query name this crawler does not speak; kept so observers still
    /// see the message.
    Unknown {
        name: String,
    },
}

/// The `r` dictionary of a response, with compact fields already parsed.
/// Malformed `nodes`/`values` blobs decode to empty collections rather than
/// failing the whole message.
#[derive(Debug, Clone, Default)]
pub struct DhtResponse {
    pub id: Option<NodeId>,
    pub nodes: Vec<DhtNode>,
    pub peers: Vec<SocketAddr>,
    pub token: Option<Bytes>,
}

#[derive(Debug, Clone)]
pub enum DhtPayload {
    Query(DhtQuery),
    Response(DhtResponse),
    Error { code: i64, message: String },
    /// Parseable bencode that is not a recognizable KRPC message.
    Unknown,
}

/// One KRPC message plus the address it came from or goes to.
#[derive(Debug, Clone)]
pub struct DhtMessage {
    pub addr: SocketAddr,
    pub transaction: TransactionId,
    pub payload: DhtPayload,
}

impl DhtMessage {
    pub fn ping(addr: SocketAddr, self_id: NodeId) -> Self {
        Self::query(addr, DhtQuery::Ping { id: self_id })
    }

    pub fn find_node(addr: SocketAddr, self_id: NodeId, target: NodeId) -> Self {
        Self::query(
            addr,
            DhtQuery::FindNode {
                id: self_id,
                target,
            },
        )
    }

    pub fn get_peers(addr: SocketAddr, self_id: NodeId, info_hash: InfoHash) -> Self {
        Self::query(
            addr,
            DhtQuery::GetPeers {
                id: self_id,
                info_hash,
            },
        )
    }

    fn query(addr: SocketAddr, query: DhtQuery) -> Self {
        Self {
            addr,
            transaction: random_transaction(),
            payload: DhtPayload::Query(query),
        }
    }

    /// Response builder used by the responder; compact fields are already
    /// encoded by the caller.
    pub fn response(addr: SocketAddr, transaction: TransactionId, response: DhtResponse) -> Self {
        Self {
            addr,
            transaction,
            payload: DhtPayload::Response(response),
        }
    }

    /// Sender id field regardless of message kind, when present.
    pub fn sender_id(&self) -> Option<NodeId> {
        match &self.payload {
            DhtPayload::Response(r) => r.id,
            DhtPayload::Query(q) => match q {
                DhtQuery::Ping { id }
                | DhtQuery::FindNode { id, .. }
                | DhtQuery::GetPeers { id, .. }
                | DhtQuery::AnnouncePeer { id, .. } => Some(*id),
                DhtQuery::Unknown { .. } => None,
            },
            _ => None,
        }
    }

    pub fn encode(&self) -> Bytes {
        let value = match &self.payload {
            DhtPayload::Query(query) => {
                let (name, args) = encode_query(query);
                dict([
                    (b"a", args),
                    (b"q", Value::str(name)),
                    (b"t", Value::Bytes(self.transaction.clone())),
                    (b"y", Value::str("q")),
                ])
            }
            DhtPayload::Response(response) => dict([
                (b"r", encode_response(response)),
                (b"t", Value::Bytes(self.transaction.clone())),
                (b"y", Value::str("r")),
            ]),
            DhtPayload::Error { code, message } => dict([
                (
                    b"e",
                    Value::List(vec![Value::Int(*code), Value::str(message)]),
                ),
                (b"t", Value::Bytes(self.transaction.clone())),
                (b"y", Value::str("e")),
            ]),
            DhtPayload::Unknown => dict([(b"t", Value::Bytes(self.transaction.clone()))]),
        };
        encode(&value)
    }

    pub fn parse(addr: SocketAddr, data: &[u8]) -> Result<Self, DhtError> {
        let value = decode(data)?;
        if value.as_dict().is_none() {
            return Err(DhtError::InvalidMessage("not a dict".into()));
        }

        let transaction = value
            .get_bytes("t")
            .cloned()
            .ok_or_else(|| DhtError::InvalidMessage("missing transaction".into()))?;

        let payload = match value.get_str("y") {
            Some("q") => parse_query(&value)?,
            Some("r") => DhtPayload::Response(parse_response(&value)),
            Some("e") => parse_error(&value),
            _ => DhtPayload::Unknown,
        };

        Ok(Self {
            addr,
            transaction,
            payload,
        })
    }
}

fn random_transaction() -> TransactionId {
    let mut t = [0u8; 2];
    rand::rng().fill(&mut t);
    Bytes::copy_from_slice(&t)
}

fn encode_query(query: &DhtQuery) -> (&'static str, Value) {
    match query {
        DhtQuery::Ping { id } => ("ping", dict([(b"id", Value::from(&id.0[..]))])),
        DhtQuery::FindNode { id, target } => (
            "find_node",
            dict([
                (b"id", Value::from(&id.0[..])),
                (b"target", Value::from(&target.0[..])),
            ]),
        ),
        DhtQuery::GetPeers { id, info_hash } => (
            "get_peers",
            dict([
                (b"id", Value::from(&id.0[..])),
                (b"info_hash", Value::from(&info_hash.0[..])),
            ]),
        ),
        DhtQuery::AnnouncePeer {
            id,
            info_hash,
            port,
            token,
        } => (
            "announce_peer",
            dict([
                (b"id", Value::from(&id.0[..])),
                (b"info_hash", Value::from(&info_hash.0[..])),
                (b"port", Value::Int(*port as i64)),
                (b"token", Value::Bytes(token.clone())),
            ]),
        ),
        DhtQuery::Unknown { name } => ("unknown", dict([(b"q", Value::str(name))])),
    }
}

fn encode_response(response: &DhtResponse) -> Value {
    let mut map = std::collections::BTreeMap::new();
    if let Some(id) = response.id {
        map.insert(Bytes::from_static(b"id"), Value::from(&id.0[..]));
    }
    map.insert(
        Bytes::from_static(b"nodes"),
        Value::Bytes(encode_compact_nodes(&response.nodes)),
    );
    if let Some(token) = &response.token {
        map.insert(Bytes::from_static(b"token"), Value::Bytes(token.clone()));
    }
    if !response.peers.is_empty() {
        let values = response
            .peers
            .iter()
            .filter_map(|addr| encode_compact_peer(addr))
            .map(|b| Value::Bytes(Bytes::copy_from_slice(&b)))
            .collect();
        map.insert(Bytes::from_static(b"values"), Value::List(values));
    }
    Value::Dict(map)
}

fn parse_query(value: &Value) -> Result<DhtPayload, DhtError> {
    let name = value
        .get_str("q")
        .ok_or_else(|| DhtError::InvalidMessage("missing query name".into()))?;
    let args = value
        .get("a")
        .ok_or_else(|| DhtError::InvalidMessage("missing query args".into()))?;

    let id = args
        .get_bytes("id")
        .and_then(|b| NodeId::from_bytes(b).ok())
        .ok_or_else(|| DhtError::InvalidMessage("missing sender id".into()));

    let query = match name {
        "ping" => DhtQuery::Ping { id: id? },
        "find_node" => {
            let target = args
                .get_bytes("target")
                .and_then(|b| NodeId::from_bytes(b).ok())
                .ok_or_else(|| DhtError::InvalidMessage("missing target".into()))?;
            DhtQuery::FindNode { id: id?, target }
        }
        "get_peers" => {
            let info_hash = parse_info_hash(args)?;
            DhtQuery::GetPeers {
                id: id?,
                info_hash,
            }
        }
        "announce_peer" => {
            let info_hash = parse_info_hash(args)?;
            let port = args
                .get_int("port")
                .ok_or_else(|| DhtError::InvalidMessage("missing port".into()))?
                as u16;
            let token = args.get_bytes("token").cloned().unwrap_or_default();
            DhtQuery::AnnouncePeer {
                id: id?,
                info_hash,
                port,
                token,
            }
        }
        other => DhtQuery::Unknown {
            name: other.to_string(),
        },
    };
    Ok(DhtPayload::Query(query))
}

fn parse_info_hash(args: &Value) -> Result<InfoHash, DhtError> {
    args.get_bytes("info_hash")
        .and_then(|b| InfoHash::from_bytes(b).ok())
        .ok_or_else(|| DhtError::InvalidMessage("missing info_hash".into()))
}

fn parse_response(value: &Value) -> DhtResponse {
    let Some(r) = value.get("r") else {
        return DhtResponse::default();
    };
    DhtResponse {
        id: r.get_bytes("id").and_then(|b| NodeId::from_bytes(b).ok()),
        nodes: r
            .get_bytes("nodes")
            .map(|b| parse_compact_nodes(b))
            .unwrap_or_default(),
        peers: r
            .get_list("values")
            .map(parse_compact_peers)
            .unwrap_or_default(),
        token: r.get_bytes("token").cloned(),
    }
}

fn parse_error(value: &Value) -> DhtPayload {
    let (code, message) = match value.get_list("e") {
        Some([code, message, ..]) => (
            code.as_int().unwrap_or(0),
            message.as_str().unwrap_or("").to_string(),
        ),
        _ => (0, String::new()),
    };
    DhtPayload::Error { code, message }
}

/// Parses a flat byte string of 26-byte node records. A blob that is not a
/// multiple of 26 bytes yields nothing: a truncated list is not trusted.
pub fn parse_compact_nodes(data: &[u8]) -> Vec<DhtNode> {
    if data.is_empty() || data.len() % 26 != 0 {
        return Vec::new();
    }
    data.chunks_exact(26)
        .filter_map(DhtNode::from_compact)
        .collect()
}

pub fn encode_compact_nodes(nodes: &[DhtNode]) -> Bytes {
    let mut out = Vec::with_capacity(nodes.len() * 26);
    for node in nodes {
        if let Some(compact) = node.to_compact() {
            out.extend_from_slice(&compact);
        }
    }
    Bytes::from(out)
}

/// Parses the `values` list of 6-byte peer records; malformed entries void
/// the whole list, as with nodes.
pub fn parse_compact_peers(values: &[Value]) -> Vec<SocketAddr> {
    let mut peers = Vec::with_capacity(values.len());
    for value in values {
        let Some(b) = value.as_bytes().filter(|b| b.len() == 6) else {
            return Vec::new();
        };
        let ip = Ipv4Addr::new(b[0], b[1], b[2], b[3]);
        let port = u16::from_be_bytes([b[4], b[5]]);
        peers.push(SocketAddr::new(IpAddr::V4(ip), port));
    }
    peers
}

fn encode_compact_peer(addr: &SocketAddr) -> Option<[u8; 6]> {
    match addr {
        SocketAddr::V4(v4) => {
            let mut b = [0u8; 6];
            b[..4].copy_from_slice(&v4.ip().octets());
            b[4..].copy_from_slice(&v4.port().to_be_bytes());
            Some(b)
        }
        SocketAddr::V6(_) => None,
    }
}
