//! Generic `GroupClient` trait for anything that executes joint trajectories
//! for one actuator group.
//!
//! Transports implement this trait and are created through a
//! [`ClientFactory`].  The dispatcher only ever talks to the trait, so a ROS
//! action client, a fieldbus driver, or the in-process simulator can be
//! swapped without touching dispatch logic.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use posture_types::{ConnectResult, ConnectionState, Trajectory};
use tokio::sync::mpsc;
use tracing::debug;
use uuid::Uuid;

/// The goal-send / goal-complete protocol of a single actuator group.
#[async_trait]
pub trait GroupClient: Send + Sync {
    /// Identifier of the group this client drives, e.g. `"left_arm"`.
    fn group(&self) -> &str;

    /// Wait up to `timeout` for the group's execution endpoint to become
    /// available.
    ///
    /// Called at most once per client instance.
    async fn connect(&self, timeout: Duration) -> ConnectResult;

    /// Current connectivity of the client.
    fn state(&self) -> ConnectionState;

    /// Submit `trajectory` and return immediately.
    ///
    /// The transport must call [`CompletionHandle::complete`] once the goal
    /// finishes, successfully or not.  There is no cancellation path.
    fn send_goal(&self, trajectory: Trajectory, on_complete: CompletionHandle);
}

/// Creates a [`GroupClient`] for a group on first use.
pub trait ClientFactory: Send + Sync {
    fn create(&self, group: &str) -> Arc<dyn GroupClient>;
}

/// A goal completion as seen by the dispatcher.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompletionEvent {
    /// Batch the goal was dispatched under.
    pub batch_id: Uuid,
    pub group: String,
    /// Dispatch ticket identifying the goal within its batch.
    pub ticket: u64,
    /// Zero on success, anything else is a failed execution.
    pub error_code: i32,
}

/// One-shot completion callback bound to a single goal.
///
/// [`complete`][Self::complete] consumes the handle, so a goal can report at
/// most once.
#[derive(Debug)]
pub struct CompletionHandle {
    batch_id: Uuid,
    group: String,
    ticket: u64,
    tx: mpsc::UnboundedSender<CompletionEvent>,
}

impl CompletionHandle {
    pub fn new(
        batch_id: Uuid,
        group: impl Into<String>,
        ticket: u64,
        tx: mpsc::UnboundedSender<CompletionEvent>,
    ) -> Self {
        Self {
            batch_id,
            group: group.into(),
            ticket,
            tx,
        }
    }

    /// Group the goal was sent to.
    pub fn group(&self) -> &str {
        &self.group
    }

    /// Report the goal's outcome to the dispatcher.
    pub fn complete(self, error_code: i32) {
        let event = CompletionEvent {
            batch_id: self.batch_id,
            group: self.group,
            ticket: self.ticket,
            error_code,
        };
        if let Err(e) = self.tx.send(event) {
            // The dispatcher is gone; nobody is left to aggregate.
            debug!(group = %e.0.group, "completion dropped, dispatcher shut down");
        }
    }
}
