//! Deferred work.
//!
//! Continuous-flow formation can leave more work behind than it performs (a
//! tier still holding a full group of winners, leftovers to promote). Rather
//! than recursing, the engine enqueues a [`FollowUp`] and a scheduler drains
//! the queue through [`Engine::run_follow_ups`].

use std::collections::VecDeque;

use parking_lot::Mutex;
use tracing::{debug, warn};

use chant_core::error::ChantError;
use chant_core::types::DeliberationId;

use crate::engine::Engine;

/// A unit of deferred engine work.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum FollowUp {
    /// Re-attempt continuous-flow formation from winners of `tier`.
    FormCells { deliberation: DeliberationId, tier: u32 },
    /// Re-run synchronized tier completion.
    CheckTier { deliberation: DeliberationId, tier: u32 },
}

/// Bounded FIFO of follow-ups. Duplicates of a queued item are dropped.
pub struct FollowUpQueue {
    items: Mutex<VecDeque<FollowUp>>,
    capacity: usize,
}

impl FollowUpQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            items: Mutex::new(VecDeque::new()),
            capacity,
        }
    }

    /// Enqueue unless already queued. Returns `false` if dropped.
    pub fn push(&self, item: FollowUp) -> bool {
        let mut items = self.items.lock();
        if items.contains(&item) {
            return true;
        }
        if items.len() >= self.capacity {
            warn!(?item, capacity = self.capacity, "follow-up queue full, dropping");
            return false;
        }
        items.push_back(item);
        true
    }

    pub fn pop(&self) -> Option<FollowUp> {
        self.items.lock().pop_front()
    }

    pub fn len(&self) -> usize {
        self.items.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.lock().is_empty()
    }
}

impl Engine {
    /// Drain queued follow-ups, including ones enqueued while draining.
    ///
    /// Processes at most the queue capacity per call so a pathological
    /// producer cannot pin the caller. A follow-up that fails on the store
    /// is queued again for the next call; one that fails a precondition is
    /// dropped. Returns the number processed.
    pub fn run_follow_ups(&self) -> Result<usize, ChantError> {
        let mut processed = 0;
        let mut retry = Vec::new();
        while processed < self.config().follow_up_capacity {
            let Some(item) = self.follow_ups().pop() else {
                break;
            };
            processed += 1;
            let result = match item {
                FollowUp::FormCells { deliberation, tier } => self
                    .advance_continuous(deliberation, tier)
                    .map(|outcome| debug!(deliberation = %deliberation, tier, ?outcome, "follow-up formation")),
                FollowUp::CheckTier { deliberation, tier } => self
                    .check_tier_completion(deliberation, tier)
                    .map(|outcome| debug!(deliberation = %deliberation, tier, ?outcome, "follow-up tier check")),
            };
            match result {
                Ok(()) => {}
                Err(ChantError::Store(err)) => {
                    warn!(?item, %err, "follow-up failed, will retry");
                    retry.push(item);
                }
                Err(err) => warn!(?item, %err, "follow-up dropped"),
            }
        }
        for item in retry {
            self.follow_ups().push(item);
        }
        Ok(processed)
    }

    /// Number of follow-ups waiting.
    pub fn pending_follow_ups(&self) -> usize {
        self.follow_ups().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn form(d: u64, tier: u32) -> FollowUp {
        FollowUp::FormCells {
            deliberation: DeliberationId(d),
            tier,
        }
    }

    #[test]
    fn fifo_order() {
        let q = FollowUpQueue::new(8);
        q.push(form(1, 1));
        q.push(form(1, 2));
        assert_eq!(q.pop(), Some(form(1, 1)));
        assert_eq!(q.pop(), Some(form(1, 2)));
        assert_eq!(q.pop(), None);
    }

    #[test]
    fn duplicates_collapse() {
        let q = FollowUpQueue::new(8);
        assert!(q.push(form(1, 1)));
        assert!(q.push(form(1, 1)));
        assert_eq!(q.len(), 1);
    }

    #[test]
    fn failed_precondition_drops_the_follow_up() {
        let h = crate::harness::Harness::new();
        h.engine.follow_ups().push(form(404, 1));
        assert_eq!(h.engine.run_follow_ups().unwrap(), 1);
        assert_eq!(h.engine.pending_follow_ups(), 0);
    }

    #[test]
    fn full_queue_drops() {
        let q = FollowUpQueue::new(1);
        assert!(q.push(form(1, 1)));
        assert!(!q.push(form(2, 1)));
        assert_eq!(q.len(), 1);
        assert!(!q.is_empty());
    }
}
