//! In-memory registry of randomness requests being coordinated.
//!
//! Nothing here is persisted: after a restart the registry is rebuilt from
//! on-chain state by the reconciliation sweep.

use std::collections::{HashMap, HashSet, VecDeque};
use std::fmt;
use tokio::task::AbortHandle;

use crate::ledger::Address;

/// How many served keys are remembered to drop late duplicate deliveries.
const COMPLETED_CAPACITY: usize = 4096;

/// Identifies one randomness request across its lifecycle.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RequestKey {
    pub consumer: Address,
    pub request_id: u64,
}

impl RequestKey {
    pub fn new(consumer: Address, request_id: u64) -> Self {
        Self { consumer, request_id }
    }
}

impl fmt::Display for RequestKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.consumer, self.request_id)
    }
}

/// A scheduled wake-up. Dropping it cancels the wake-up.
#[derive(Debug)]
pub struct DeadlineTimer {
    pub generation: u64,
    handle: AbortHandle,
}

impl Drop for DeadlineTimer {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

#[derive(Debug, Default)]
pub struct PendingRequest {
    /// Peers observed to have posted a proof for this request.
    pub posted_providers: HashSet<Address>,
    pub deadline_timer: Option<DeadlineTimer>,
}

/// Result of recording a peer's proof.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Posted {
    /// First proof from this peer; carries the distinct count so far.
    New(usize),
    /// This peer was already recorded.
    Duplicate(usize),
    /// We already submitted the final proof for this request.
    Completed,
}

#[derive(Debug)]
pub struct Registry {
    pending: HashMap<RequestKey, PendingRequest>,
    /// Keys whose submission has passed the getter check and is not yet
    /// reflected in upcoming state.
    in_flight: HashSet<RequestKey>,
    /// Recently served keys, oldest first in `completed_order`.
    completed: HashSet<RequestKey>,
    completed_order: VecDeque<RequestKey>,
    completed_capacity: usize,
    next_generation: u64,
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

impl Registry {
    pub fn new() -> Self {
        Self::with_completed_capacity(COMPLETED_CAPACITY)
    }

    fn with_completed_capacity(completed_capacity: usize) -> Self {
        Self {
            pending: HashMap::new(),
            in_flight: HashSet::new(),
            completed: HashSet::new(),
            completed_order: VecDeque::new(),
            completed_capacity,
            next_generation: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn get(&self, key: &RequestKey) -> Option<&PendingRequest> {
        self.pending.get(key)
    }

    /// Look up the entry for `key`, creating it on first observation.
    pub fn entry(&mut self, key: &RequestKey) -> &mut PendingRequest {
        self.pending.entry(key.clone()).or_default()
    }

    /// Record a peer's proof. Served keys are not tracked again.
    pub fn record_posted(&mut self, key: &RequestKey, provider: Address) -> Posted {
        if self.completed.contains(key) {
            return Posted::Completed;
        }
        let entry = self.entry(key);
        let new = entry.posted_providers.insert(provider);
        let count = entry.posted_providers.len();
        if new {
            Posted::New(count)
        } else {
            Posted::Duplicate(count)
        }
    }

    /// Generation of the currently armed timer for `key`, if any.
    pub fn timer_generation(&self, key: &RequestKey) -> Option<u64> {
        self.pending
            .get(key)
            .and_then(|p| p.deadline_timer.as_ref())
            .map(|t| t.generation)
    }

    pub fn next_generation(&mut self) -> u64 {
        self.next_generation += 1;
        self.next_generation
    }

    /// Install a timer for `key`, cancelling the previous one.
    pub fn arm_timer(&mut self, key: &RequestKey, generation: u64, handle: AbortHandle) {
        self.entry(key).deadline_timer = Some(DeadlineTimer { generation, handle });
    }

    /// Delete the entry for `key`; its timer, if any, is cancelled.
    pub fn remove(&mut self, key: &RequestKey) -> Option<PendingRequest> {
        self.pending.remove(key)
    }

    /// Mark `key` as being submitted. Returns `false` if it already was.
    pub fn begin_submission(&mut self, key: &RequestKey) -> bool {
        self.in_flight.insert(key.clone())
    }

    pub fn finish_submission(&mut self, key: &RequestKey) {
        self.in_flight.remove(key);
    }

    /// Our final proof for `key` was sent. Drops its entry (and timer) and
    /// remembers the key, evicting the oldest once over capacity.
    pub fn complete(&mut self, key: &RequestKey) {
        self.pending.remove(key);
        if !self.completed.insert(key.clone()) {
            return;
        }
        self.completed_order.push_back(key.clone());
        if self.completed_order.len() > self.completed_capacity {
            if let Some(oldest) = self.completed_order.pop_front() {
                self.completed.remove(&oldest);
            }
        }
    }

    pub fn is_completed(&self, key: &RequestKey) -> bool {
        self.completed.contains(key)
    }
}
