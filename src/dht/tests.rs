use super::message::parse_compact_nodes;
use super::*;
use crate::bencode::{encode, Value};
use crate::constants::{NODE_COLD_DOWN, ROUTING_KEEP_NODES, ROUTING_MAX_NODES};
use crate::info_hash::InfoHash;
use bytes::Bytes;
use std::collections::BTreeMap;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::{Duration, Instant};

fn addr(a: u8, b: u8, c: u8, d: u8) -> SocketAddr {
    SocketAddr::new(IpAddr::V4(Ipv4Addr::new(a, b, c, d)), 6881)
}

fn response_from(from: SocketAddr, id: NodeId, nodes: Vec<DhtNode>) -> DhtMessage {
    DhtMessage::response(
        from,
        Bytes::from_static(b"aa"),
        DhtResponse {
            id: Some(id),
            nodes,
            peers: Vec::new(),
            token: None,
        },
    )
}

// ---------------------------------------------------------------------------
// messages
// ---------------------------------------------------------------------------

#[test]
fn get_peers_query_roundtrip() {
    let self_id = NodeId([1u8; 20]);
    let hash = InfoHash([2u8; 20]);
    let msg = DhtMessage::get_peers(addr(1, 2, 3, 4), self_id, hash);
    let parsed = DhtMessage::parse(msg.addr, &msg.encode()).unwrap();

    assert_eq!(parsed.transaction, msg.transaction);
    match parsed.payload {
        DhtPayload::Query(DhtQuery::GetPeers { id, info_hash }) => {
            assert_eq!(id, self_id);
            assert_eq!(info_hash, hash);
        }
        other => panic!("unexpected payload: {other:?}"),
    }
}

#[test]
fn find_node_query_roundtrip() {
    let msg = DhtMessage::find_node(addr(1, 2, 3, 4), NodeId([1u8; 20]), NodeId([9u8; 20]));
    let parsed = DhtMessage::parse(msg.addr, &msg.encode()).unwrap();
    assert!(matches!(
        parsed.payload,
        DhtPayload::Query(DhtQuery::FindNode { target, .. }) if target == NodeId([9u8; 20])
    ));
}

#[test]
fn response_parses_compact_nodes_and_peers() {
    let node = DhtNode::new(NodeId([7u8; 20]), addr(9, 9, 9, 9));
    let mut r = BTreeMap::new();
    r.insert(Bytes::from_static(b"id"), Value::from(&[3u8; 20][..]));
    r.insert(
        Bytes::from_static(b"nodes"),
        Value::from(&node.to_compact().unwrap()[..]),
    );
    r.insert(
        Bytes::from_static(b"values"),
        Value::List(vec![Value::from(&[10, 0, 0, 1, 0x1f, 0x90][..])]),
    );
    let mut top = BTreeMap::new();
    top.insert(Bytes::from_static(b"r"), Value::Dict(r));
    top.insert(Bytes::from_static(b"t"), Value::from(&b"xy"[..]));
    top.insert(Bytes::from_static(b"y"), Value::str("r"));
    let raw = encode(&Value::Dict(top));

    let parsed = DhtMessage::parse(addr(1, 1, 1, 1), &raw).unwrap();
    let DhtPayload::Response(response) = parsed.payload else {
        panic!("expected response");
    };
    assert_eq!(response.id, Some(NodeId([3u8; 20])));
    assert_eq!(response.nodes, vec![node]);
    assert_eq!(
        response.peers,
        vec![SocketAddr::new(IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1)), 8080)]
    );
}

#[test]
fn malformed_compact_blobs_parse_to_empty() {
    assert!(parse_compact_nodes(&[0u8; 25]).is_empty());
    assert!(parse_compact_nodes(&[0u8; 27]).is_empty());
    assert_eq!(parse_compact_nodes(&[0u8; 52]).len(), 2);
}

#[test]
fn error_message_parses() {
    let raw = b"d1:eli201e23:A Generic Error Ocurrede1:t2:aa1:y1:ee";
    let parsed = DhtMessage::parse(addr(1, 1, 1, 1), raw).unwrap();
    assert!(matches!(
        parsed.payload,
        DhtPayload::Error { code: 201, .. }
    ));
}

#[test]
fn missing_transaction_is_invalid() {
    let raw = b"d1:y1:qe";
    assert!(DhtMessage::parse(addr(1, 1, 1, 1), raw).is_err());
}

#[test]
fn unknown_message_type_still_parses() {
    let raw = b"d1:t2:aa1:y1:ze";
    let parsed = DhtMessage::parse(addr(1, 1, 1, 1), raw).unwrap();
    assert!(matches!(parsed.payload, DhtPayload::Unknown));
}

// ---------------------------------------------------------------------------
// node records
// ---------------------------------------------------------------------------

#[test]
fn streaks_reset_each_other() {
    let now = Instant::now();
    let mut record = NodeRecord::new(now);

    record.on_query(now);
    record.on_timeout();
    record.on_timeout();
    assert_eq!(record.recent_timeouts(), 2);
    assert_eq!(record.recent_successes(), 0);

    record.on_query(now + Duration::from_secs(1));
    record.on_response(now + Duration::from_secs(2));
    assert_eq!(record.recent_timeouts(), 0);
    assert_eq!(record.recent_successes(), 1);
    assert_eq!(record.weighted_delay(), Duration::from_secs(1));

    // EMA: (1s + 3s) / 2.
    record.on_query(now + Duration::from_secs(10));
    record.on_response(now + Duration::from_secs(13));
    assert_eq!(record.weighted_delay(), Duration::from_secs(2));
}

// ---------------------------------------------------------------------------
// routing table
// ---------------------------------------------------------------------------

#[test]
fn response_with_changed_id_blacklists_address() {
    let now = Instant::now();
    let mut table = RoutingTable::new();
    let victim = addr(10, 0, 0, 1);
    table.put_node(now, DhtNode::new(NodeId([1u8; 20]), victim));

    table.query_sent_at(now, victim);
    let spoofed = response_from(victim, NodeId([2u8; 20]), Vec::new());
    table.response_received_at(now + Duration::from_millis(50), &spoofed);

    assert!(!table.contains(&victim));
    assert!(table.is_blacklisted(now + Duration::from_secs(1), &victim));

    // Re-discovery of the blacklisted address through another node's
    // response is rejected.
    let other = addr(10, 0, 0, 2);
    table.put_node(now, DhtNode::new(NodeId([3u8; 20]), other));
    table.query_sent_at(now + Duration::from_secs(1), other);
    let gossip = response_from(
        other,
        NodeId([3u8; 20]),
        vec![
            DhtNode::new(NodeId([4u8; 20]), victim),
            DhtNode::new(NodeId([5u8; 20]), addr(10, 0, 0, 3)),
        ],
    );
    table.response_received_at(now + Duration::from_secs(2), &gossip);

    assert!(!table.contains(&victim));
    assert!(table.contains(&addr(10, 0, 0, 3)));
}

#[test]
fn unsolicited_response_is_ignored() {
    let now = Instant::now();
    let mut table = RoutingTable::new();
    let node = addr(10, 0, 0, 1);
    table.put_node(now, DhtNode::new(NodeId([1u8; 20]), node));

    // No pending query: nothing changes, not even for a spoofed id.
    let msg = response_from(node, NodeId([2u8; 20]), Vec::new());
    table.response_received_at(now, &msg);
    assert!(table.contains(&node));
    assert!(!table.is_blacklisted(now, &node));
}

#[test]
fn pending_query_expiry_marks_timeout() {
    let now = Instant::now();
    let mut table = RoutingTable::new();
    let node = addr(10, 0, 0, 1);
    table.put_node(now, DhtNode::new(NodeId([1u8; 20]), node));

    table.query_sent_at(now, node);
    table.refresh(now + Duration::from_secs(4));

    let record = table.record(&node).unwrap();
    assert_eq!(record.borrow().recent_timeouts(), 1);

    // A response arriving after the expiry is unsolicited and ignored.
    let late = response_from(node, NodeId([1u8; 20]), Vec::new());
    table.response_received_at(now + Duration::from_secs(5), &late);
    assert_eq!(record.borrow().responses(), 0);
}

#[test]
fn matched_response_updates_record_and_ingests_nodes() {
    let now = Instant::now();
    let mut table = RoutingTable::new();
    let node = addr(10, 0, 0, 1);
    table.put_node(now, DhtNode::new(NodeId([1u8; 20]), node));

    table.query_sent_at(now, node);
    let msg = response_from(
        node,
        NodeId([1u8; 20]),
        vec![DhtNode::new(NodeId([6u8; 20]), addr(10, 0, 0, 9))],
    );
    table.response_received_at(now + Duration::from_millis(20), &msg);

    let record = table.record(&node).unwrap();
    assert_eq!(record.borrow().responses(), 1);
    assert_eq!(record.borrow().recent_successes(), 1);
    assert!(table.contains(&addr(10, 0, 0, 9)));
}

#[test]
fn overflow_eviction_keeps_best_ranked_half() {
    let now = Instant::now();
    let mut table = RoutingTable::new();

    let count = ROUTING_MAX_NODES + 1;
    for i in 0..count {
        let ip = Ipv4Addr::new(10, (i >> 16) as u8, (i >> 8) as u8, i as u8);
        let node_addr = SocketAddr::new(IpAddr::V4(ip), 6881);
        table.put_node(now, DhtNode::new(NodeId::generate(), node_addr));
        // Mark a majority as clearly bad and a minority as proven good.
        let record = table.record(&node_addr).unwrap();
        if i % 4 == 0 {
            record.borrow_mut().force_streaks(0, 2);
        } else {
            record.borrow_mut().force_streaks(5, 0);
        }
    }

    table.refresh(now);
    assert_eq!(table.len(), ROUTING_KEEP_NODES);

    // Every proven-good node (a quarter of the population) survived; no
    // discarded node outranked a kept one.
    for i in (0..count).step_by(4) {
        let ip = Ipv4Addr::new(10, (i >> 16) as u8, (i >> 8) as u8, i as u8);
        let node_addr = SocketAddr::new(IpAddr::V4(ip), 6881);
        assert!(table.contains(&node_addr), "good node {i} was evicted");
    }
}

#[test]
fn cold_down_selection_skips_recently_contacted() {
    let start = Instant::now();
    let mut table = RoutingTable::new();
    let cold = addr(10, 0, 0, 1);
    let hot = addr(10, 0, 0, 2);
    table.put_node(start, DhtNode::new(NodeId([1u8; 20]), cold));
    table.put_node(start, DhtNode::new(NodeId([2u8; 20]), hot));

    let later = start + NODE_COLD_DOWN * 2;
    table.query_sent_at(later, hot);

    let picked = table.cold_down_nodes(later + Duration::from_secs(10), NODE_COLD_DOWN, 10);
    let addrs: Vec<SocketAddr> = picked.iter().map(|n| n.addr).collect();
    assert!(addrs.contains(&cold));
    assert!(!addrs.contains(&hot));

    // Long enough later the hot node cools back down.
    let picked = table.cold_down_nodes(later + NODE_COLD_DOWN * 2, NODE_COLD_DOWN, 10);
    assert_eq!(picked.len(), 2);
}

// ---------------------------------------------------------------------------
// persistence
// ---------------------------------------------------------------------------

#[test]
fn node_file_roundtrip() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("nodes.dat");
    let nodes = vec![
        DhtNode::new(NodeId([1u8; 20]), addr(1, 2, 3, 4)),
        DhtNode::new(NodeId([2u8; 20]), addr(5, 6, 7, 8)),
    ];

    save_nodes(&path, &nodes).unwrap();
    assert_eq!(load_nodes(&path).unwrap(), nodes);
}

#[test]
fn bencoded_state_file_loads() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("dht.dat");
    let node = DhtNode::new(NodeId([7u8; 20]), addr(1, 2, 3, 4));

    let mut top = BTreeMap::new();
    top.insert(
        Bytes::from_static(b"nodes"),
        Value::from(&node.to_compact().unwrap()[..]),
    );
    std::fs::write(&path, encode(&Value::Dict(top))).unwrap();

    assert_eq!(load_nodes(&path).unwrap(), vec![node]);
}

#[test]
fn truncated_flat_file_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("nodes.dat");
    std::fs::write(&path, [0u8; 30]).unwrap();
    assert!(load_nodes(&path).is_err());
}
