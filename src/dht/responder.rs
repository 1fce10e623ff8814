use super::message::{DhtMessage, DhtQuery, DhtResponse};
use super::node::NodeId;
use super::transport::{DhtContext, DhtObserver};
use bytes::Bytes;
use rand::Rng as _;

/// Answers incoming queries so the crawler stays a well-behaved DHT
/// citizen.
///
/// Replies are minimal: our id, an empty node list, and a throwaway token.
/// The crawler stores nothing for other nodes, so there is nothing better
/// to say, and announce tokens are never validated because announces are
/// never stored.
pub struct DhtResponder {
    self_id: NodeId,
}

impl DhtResponder {
    pub fn new(self_id: NodeId) -> Self {
        Self { self_id }
    }

    fn base(&self) -> DhtResponse {
        DhtResponse {
            id: Some(self.self_id),
            ..DhtResponse::default()
        }
    }

    fn token() -> Bytes {
        let mut t = [0u8; 2];
        rand::rng().fill(&mut t);
        Bytes::copy_from_slice(&t)
    }
}

impl DhtObserver for DhtResponder {
    fn query_received(&mut self, msg: &DhtMessage, query: &DhtQuery, ctx: &mut DhtContext<'_>) {
        let response = match query {
            DhtQuery::Ping { .. } | DhtQuery::AnnouncePeer { .. } => self.base(),
            DhtQuery::FindNode { .. } => self.base(),
            DhtQuery::GetPeers { .. } => DhtResponse {
                token: Some(Self::token()),
                ..self.base()
            },
            DhtQuery::Unknown { .. } => return,
        };
        ctx.send_response(DhtMessage::response(
            msg.addr,
            msg.transaction.clone(),
            response,
        ));
    }
}
