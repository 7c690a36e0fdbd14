//! Response barrier over the live workers

use std::collections::BTreeSet;

use crate::error::{MechanicError, Result};
use crate::protocol::WorkerId;

/// Progress of a barrier after a reply was recorded
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BarrierProgress {
    /// More replies are outstanding
    Pending {
        /// Replies received so far
        received: usize,
        /// Replies expected in total
        expected: usize,
    },
    /// Every worker replied; the barrier has been cleared
    Complete,
}

/// Collects one reply per live worker for the in-flight command
#[derive(Debug, Default)]
pub struct ResponseBarrier {
    received: BTreeSet<WorkerId>,
}

impl ResponseBarrier {
    /// Create an empty barrier
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a reply of `worker`
    ///
    /// Replies from unknown workers, a second reply of the same worker and
    /// any reply beyond the expected count are protocol violations; the
    /// barrier is left untouched in that case.
    pub fn record(&mut self, worker: WorkerId, live: &BTreeSet<WorkerId>) -> Result<BarrierProgress> {
        let expected = live.len();
        if !live.contains(&worker) {
            return Err(MechanicError::protocol(format!(
                "reply from unknown {worker}"
            )));
        }
        if self.received.contains(&worker) {
            return Err(MechanicError::protocol(format!(
                "duplicate reply from {worker}"
            )));
        }
        if self.received.len() >= expected {
            return Err(MechanicError::protocol(format!(
                "received more replies than the expected [{expected}]"
            )));
        }

        self.received.insert(worker);
        let received = self.received.len();
        if received == expected {
            self.received.clear();
            Ok(BarrierProgress::Complete)
        } else {
            Ok(BarrierProgress::Pending { received, expected })
        }
    }

    /// Number of replies collected so far
    pub fn len(&self) -> usize {
        self.received.len()
    }

    /// Whether no reply is collected
    pub fn is_empty(&self) -> bool {
        self.received.is_empty()
    }

    /// Drop all collected replies
    pub fn clear(&mut self) {
        self.received.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn live(n: usize) -> BTreeSet<WorkerId> {
        (0..n).map(WorkerId).collect()
    }

    #[test]
    fn test_completes_once_after_all_replies() {
        let live = live(3);
        let mut barrier = ResponseBarrier::new();

        assert_eq!(
            barrier.record(WorkerId(2), &live).unwrap(),
            BarrierProgress::Pending { received: 1, expected: 3 }
        );
        assert!(matches!(
            barrier.record(WorkerId(0), &live).unwrap(),
            BarrierProgress::Pending { received: 2, .. }
        ));
        assert_eq!(barrier.record(WorkerId(1), &live).unwrap(), BarrierProgress::Complete);
        assert!(barrier.is_empty());
    }

    #[test]
    fn test_duplicate_reply_is_rejected_without_mutation() {
        let live = live(2);
        let mut barrier = ResponseBarrier::new();
        barrier.record(WorkerId(0), &live).unwrap();

        let err = barrier.record(WorkerId(0), &live).unwrap_err();

        assert!(err.is_protocol_violation());
        assert_eq!(barrier.len(), 1);
        assert_eq!(barrier.record(WorkerId(1), &live).unwrap(), BarrierProgress::Complete);
    }

    #[test]
    fn test_stray_reply_is_rejected() {
        let mut barrier = ResponseBarrier::new();
        let err = barrier.record(WorkerId(9), &live(2)).unwrap_err();
        assert!(err.is_protocol_violation());
        assert!(barrier.is_empty());
    }

    #[test]
    fn test_over_count_is_rejected() {
        let mut barrier = ResponseBarrier::new();
        barrier.record(WorkerId(1), &live(2)).unwrap();

        let err = barrier.record(WorkerId(0), &live(1)).unwrap_err();

        assert!(err.is_protocol_violation());
        assert!(err.to_string().contains("more replies"));
        assert_eq!(barrier.len(), 1);
    }
}
