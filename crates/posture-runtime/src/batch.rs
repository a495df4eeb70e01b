//! [`Batch`] – completion tracking for one logical dispatch.
//!
//! A batch records, per group, the ticket of the goal it is waiting on and
//! whether that goal has finished or failed.  A completion is only accepted
//! when it carries the group's current ticket and the group has not reported
//! yet, so a goal can never be counted twice and goals superseded by a newer
//! dispatch to the same group are ignored.

use std::collections::BTreeMap;

use chrono::Utc;
use posture_types::BatchOutcome;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct GroupStatus {
    ticket: u64,
    finished: bool,
    failed: bool,
}

/// Result of feeding a completion into a [`Batch`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Recorded {
    /// The completion was counted.  `batch_complete` is `true` when it was
    /// the last outstanding group.
    Accepted { batch_complete: bool },
    /// The completion does not belong to any goal this batch waits on.
    Stale,
}

/// The set of groups dispatched together and their completion state.
#[derive(Debug, Clone)]
pub struct Batch {
    id: Uuid,
    posture: String,
    timescale: f64,
    groups: BTreeMap<String, GroupStatus>,
}

impl Batch {
    pub fn new(posture: impl Into<String>, timescale: f64) -> Self {
        Self {
            id: Uuid::new_v4(),
            posture: posture.into(),
            timescale,
            groups: BTreeMap::new(),
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Start (or restart) waiting on `group`'s goal identified by `ticket`.
    ///
    /// The group is marked not finished and not failed.  The batch's posture
    /// and timescale follow the latest dispatch.
    pub fn track(&mut self, group: &str, ticket: u64, posture: &str, timescale: f64) {
        self.groups.insert(
            group.to_string(),
            GroupStatus {
                ticket,
                finished: false,
                failed: false,
            },
        );
        if self.posture != posture {
            self.posture = posture.to_string();
        }
        self.timescale = timescale;
    }

    /// Record the completion of `group`'s goal `ticket`.
    pub fn record(&mut self, group: &str, ticket: u64, error_code: i32) -> Recorded {
        match self.groups.get_mut(group) {
            Some(status) if status.ticket == ticket && !status.finished => {
                status.finished = true;
                status.failed = error_code != 0;
            }
            _ => return Recorded::Stale,
        }
        Recorded::Accepted {
            batch_complete: self.is_complete(),
        }
    }

    /// `true` once every tracked group has reported.  An empty batch is not
    /// complete: nothing was ever sent.
    pub fn is_complete(&self) -> bool {
        !self.groups.is_empty() && self.groups.values().all(|s| s.finished)
    }

    /// Number of groups still in flight.
    pub fn pending(&self) -> usize {
        self.groups.values().filter(|s| !s.finished).count()
    }

    pub fn is_empty(&self) -> bool {
        self.groups.is_empty()
    }

    /// Evaluate the batch into a [`BatchOutcome`].
    pub fn outcome(&self) -> BatchOutcome {
        let (failed, succeeded): (Vec<_>, Vec<_>) = self
            .groups
            .iter()
            .filter(|(_, s)| s.finished)
            .partition(|(_, s)| s.failed);
        BatchOutcome {
            batch_id: self.id,
            posture: self.posture.clone(),
            timescale: self.timescale,
            succeeded: succeeded.into_iter().map(|(g, _)| g.clone()).collect(),
            failed: failed.into_iter().map(|(g, _)| g.clone()).collect(),
            completed_at: Utc::now(),
        }
    }
}
