use serde::{Deserialize, Serialize};
use std::fmt;

use crate::model::{BatchId, EventId, ProgressEvent, UserId};

/// Why the reconciler refused an individual event.
///
/// Rejection is per event, never per batch: the rest of the batch still
/// reaches acknowledgment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RejectReason {
    /// The event references a section/lesson/course the content hierarchy
    /// does not know about.
    UnknownReference,
    /// The event's client timestamp is implausibly far in the future.
    ClockSkew,
}

impl fmt::Display for RejectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RejectReason::UnknownReference => write!(f, "unknown reference"),
            RejectReason::ClockSkew => write!(f, "clock skew"),
        }
    }
}

/// An ordered list of events submitted together, identified by a
/// client-assigned id so an unacknowledged batch can be resubmitted verbatim
/// and deduplicated server-side.
#[derive(Debug, Clone, PartialEq)]
pub struct SyncBatch {
    pub batch_id: BatchId,
    pub user_id: UserId,
    pub events: Vec<ProgressEvent>,
}

impl SyncBatch {
    #[must_use]
    pub fn new(batch_id: BatchId, user_id: UserId, events: Vec<ProgressEvent>) -> Self {
        Self {
            batch_id,
            user_id,
            events,
        }
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.events.len()
    }
}

/// Per-event outcome of ingesting a batch. Partial success is the normal
/// case; serializable so the batch ledger can replay it on resubmission.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncResult {
    pub accepted: Vec<EventId>,
    pub duplicates: Vec<EventId>,
    pub rejected: Vec<(EventId, RejectReason)>,
}

impl SyncResult {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Events that made it into the store, first time or already there.
    #[must_use]
    pub fn ingested_count(&self) -> usize {
        self.accepted.len() + self.duplicates.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sync_result_roundtrips_through_json() {
        let result = SyncResult {
            accepted: vec![EventId::random()],
            duplicates: vec![],
            rejected: vec![(EventId::random(), RejectReason::ClockSkew)],
        };

        let json = serde_json::to_string(&result).unwrap();
        let back: SyncResult = serde_json::from_str(&json).unwrap();
        assert_eq!(back, result);
        assert_eq!(back.ingested_count(), 1);
    }
}
