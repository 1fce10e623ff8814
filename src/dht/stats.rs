use super::error::DhtError;
use super::message::{DhtMessage, DhtQuery};
use super::transport::{DhtContext, DhtObserver};
use std::net::SocketAddr;
use tracing::info;

/// Message counters, attached to the endpoint as one more observer.
#[derive(Debug, Default)]
pub struct DhtStats {
    pub queries_sent: u64,
    pub responses_sent: u64,
    pub responses_received: u64,
    pub pings_received: u64,
    pub find_nodes_received: u64,
    pub get_peers_received: u64,
    pub announces_received: u64,
    pub unknown_queries_received: u64,
    pub errors_received: u64,
    pub unknown_received: u64,
    pub failures: u64,
}

impl DhtStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn log_summary(&self) {
        info!(
            queries_sent = self.queries_sent,
            responses_received = self.responses_received,
            responses_sent = self.responses_sent,
            queries_received = self.pings_received
                + self.find_nodes_received
                + self.get_peers_received
                + self.announces_received
                + self.unknown_queries_received,
            errors_received = self.errors_received,
            failures = self.failures,
            "dht traffic"
        );
    }
}

impl DhtObserver for DhtStats {
    fn query_sent(&mut self, _msg: &DhtMessage, _ctx: &mut DhtContext<'_>) {
        self.queries_sent += 1;
    }

    fn response_sent(&mut self, _msg: &DhtMessage, _ctx: &mut DhtContext<'_>) {
        self.responses_sent += 1;
    }

    fn response_received(&mut self, _msg: &DhtMessage, _ctx: &mut DhtContext<'_>) {
        self.responses_received += 1;
    }

    fn query_received(&mut self, _msg: &DhtMessage, query: &DhtQuery, _ctx: &mut DhtContext<'_>) {
        match query {
            DhtQuery::Ping { .. } => self.pings_received += 1,
            DhtQuery::FindNode { .. } => self.find_nodes_received += 1,
            DhtQuery::GetPeers { .. } => self.get_peers_received += 1,
            DhtQuery::AnnouncePeer { .. } => self.announces_received += 1,
            DhtQuery::Unknown { .. } => self.unknown_queries_received += 1,
        }
    }

    fn error_received(&mut self, _msg: &DhtMessage, _code: i64, _text: &str, _ctx: &mut DhtContext<'_>) {
        self.errors_received += 1;
    }

    fn unknown_received(&mut self, _msg: &DhtMessage, _ctx: &mut DhtContext<'_>) {
        self.unknown_received += 1;
    }

    fn failure(&mut self, _addr: Option<SocketAddr>, _error: &DhtError) {
        self.failures += 1;
    }
}
