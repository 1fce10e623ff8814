//! Mainline DHT client side ([BEP-5]): KRPC messages, node bookkeeping,
//! and the UDP endpoint that fans decoded traffic out to observers.
//!
//! The crawler's DHT role is deliberately shallow: it queries aggressively,
//! answers the minimum needed to stay a polite citizen
//! ([`DhtResponder`]), and keeps a flat capacity-bounded table of addresses
//! ranked by observed behavior ([`RoutingTable`]) rather than a Kademlia
//! bucket tree. Everything runs on the reactor thread.
//!
//! [BEP-5]: http://bittorrent.org/beps/bep_0005.html

mod correlator;
mod error;
mod message;
mod node;
mod persist;
mod responder;
mod routing;
mod stats;
mod transport;

pub use correlator::{QueryCorrelator, ResponseCallback};
pub use error::DhtError;
pub use message::{DhtMessage, DhtPayload, DhtQuery, DhtResponse, TransactionId};
pub use node::{DhtNode, NodeId, NodeRecord};
pub use persist::{load_nodes, save_nodes};
pub use responder::DhtResponder;
pub use routing::RoutingTable;
pub use stats::DhtStats;
pub use transport::{DhtContext, DhtEndpoint, DhtObserver};

#[cfg(test)]
mod tests;
