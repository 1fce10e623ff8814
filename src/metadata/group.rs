use crate::constants::GROUP_TTL;
use crate::dht::NodeId;
use crate::info_hash::InfoHash;
use std::cell::RefCell;
use std::rc::Rc;
use std::time::Instant;

/// Shared handle to a group. The crawler owns the group's lifecycle; each
/// exchange holds a clone to consult the alive flag and bump the attempt
/// counter: shared state, not ownership transfer.
pub type GroupRef = Rc<RefCell<DownloadGroup>>;

/// Context for all download attempts of one info-hash.
///
/// A group stops being alive when any attempt completes or when its
/// wall-clock budget expires, whichever comes first; in-flight attempts
/// notice at their next readiness dispatch and abort.
#[derive(Debug)]
pub struct DownloadGroup {
    info_hash: InfoHash,
    self_id: NodeId,
    created_at: Instant,
    alive: bool,
    attempts: u32,
}

impl DownloadGroup {
    pub fn new(now: Instant, info_hash: InfoHash, self_id: NodeId) -> GroupRef {
        Rc::new(RefCell::new(Self {
            info_hash,
            self_id,
            created_at: now,
            alive: true,
            attempts: 0,
        }))
    }

    pub fn info_hash(&self) -> InfoHash {
        self.info_hash
    }

    pub fn self_id(&self) -> NodeId {
        self.self_id
    }

    pub fn created_at(&self) -> Instant {
        self.created_at
    }

    pub fn is_alive(&self, now: Instant) -> bool {
        self.alive && now.duration_since(self.created_at) < GROUP_TTL
    }

    pub fn stop(&mut self) {
        self.alive = false;
    }

    /// Live connection attempts currently referencing this group.
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub(crate) fn attempt_started(&mut self) {
        self.attempts += 1;
    }

    pub(crate) fn attempt_finished(&mut self) {
        self.attempts = self.attempts.saturating_sub(1);
    }
}
