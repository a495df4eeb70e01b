//! [`CompletionAggregator`] – turns per-group completions into batch
//! completion and settle-posture chaining.
//!
//! Transports report through their [`CompletionHandle`][posture_hal::CompletionHandle]s
//! into one channel.  The aggregator drains that channel on a single task,
//! so completions are applied one at a time, under the dispatcher's state
//! lock, in whatever order they arrive:
//!
//! ```text
//!  Idle ──execute──▶ Dispatching ──last group reports──▶ Completing
//!   ▲                    ▲                                   │
//!   │                    └──── settle posture dispatched ◀───┤ chain
//!   └───────────────────────── all_done = true ◀─────────────┘ no chain
//! ```
//!
//! A batch is closed the moment its last group reports, so a late or
//! duplicated completion can never close it twice.

use std::sync::Weak;

use posture_hal::CompletionEvent;
use posture_types::{DispatchPayload, PostureError, Target};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::batch::{Batch, Recorded};
use crate::dispatcher::{DispatchState, Dispatcher, Shared};
use crate::events::EventBus;

// ─────────────────────────────────────────────────────────────────────────────
// Chain policy
// ─────────────────────────────────────────────────────────────────────────────

/// What to do once a batch has fully completed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChainPolicy {
    /// Posture dispatched to all groups after a batch completes.  Empty
    /// disables chaining.
    pub settle_posture: String,
    /// Whether a batch containing a failed goal still chains.
    pub chain_on_failure: bool,
}

impl Default for ChainPolicy {
    fn default() -> Self {
        Self {
            settle_posture: String::new(),
            chain_on_failure: true,
        }
    }
}

impl ChainPolicy {
    /// Chain to `posture` after every batch.
    pub fn settle(posture: impl Into<String>) -> Self {
        Self {
            settle_posture: posture.into(),
            ..Self::default()
        }
    }

    /// Never chain.
    pub fn disabled() -> Self {
        Self::default()
    }

    pub fn with_chain_on_failure(mut self, chain_on_failure: bool) -> Self {
        self.chain_on_failure = chain_on_failure;
        self
    }

    /// The posture to chain to after a batch that executed `executed`, or
    /// `None` when the batch should end the motion.
    ///
    /// Never chains a posture onto itself.
    pub fn next_posture(&self, executed: Option<&str>, failed: bool) -> Option<&str> {
        if self.settle_posture.is_empty() || executed == Some(self.settle_posture.as_str()) {
            return None;
        }
        if failed && !self.chain_on_failure {
            return None;
        }
        Some(&self.settle_posture)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Aggregator
// ─────────────────────────────────────────────────────────────────────────────

/// A settle dispatch owed after a batch closed.
#[derive(Debug)]
struct PendingChain {
    from_batch: Uuid,
    settle_posture: String,
}

/// Consumes [`CompletionEvent`]s for one [`Dispatcher`].
///
/// Created and spawned by [`Dispatcher::new`]; it stops once the dispatcher
/// has been dropped and every outstanding completion handle is gone.
pub struct CompletionAggregator {
    shared: Weak<Shared>,
    rx: mpsc::UnboundedReceiver<CompletionEvent>,
}

impl CompletionAggregator {
    pub(crate) fn new(shared: Weak<Shared>, rx: mpsc::UnboundedReceiver<CompletionEvent>) -> Self {
        Self { shared, rx }
    }

    /// Drain completions until the channel closes.
    pub async fn run(mut self) {
        while let Some(event) = self.rx.recv().await {
            let Some(shared) = self.shared.upgrade() else {
                break;
            };
            Self::handle(&Dispatcher::from_shared(shared), event).await;
        }
        debug!("completion aggregator stopped");
    }

    async fn handle(dispatcher: &Dispatcher, event: CompletionEvent) {
        let events = &dispatcher.shared.events;
        let chain = {
            let mut state = dispatcher.shared.state.lock().await;
            Self::on_group_complete(&mut state, events, event)
        };

        let Some(chain) = chain else {
            return;
        };
        // The lock is released: the settle dispatch takes it again.
        dispatcher
            .execute(Target::All, &chain.settle_posture, 1.0)
            .await;

        let mut state = dispatcher.shared.state.lock().await;
        if state.batch.as_ref().is_none_or(Batch::is_empty) {
            warn!(
                settle_posture = %chain.settle_posture,
                "settle posture could not be sent to any group"
            );
            state.batch = None;
            Self::declare_all_done(&mut state, events, chain.from_batch);
        }
    }

    /// Apply one group completion.  Returns the settle dispatch owed when the
    /// completion closed its batch and the chain policy asks for one.
    fn on_group_complete(
        state: &mut DispatchState,
        events: &EventBus,
        event: CompletionEvent,
    ) -> Option<PendingChain> {
        let recorded = match state.batch.as_mut() {
            Some(batch) if batch.id() == event.batch_id => {
                batch.record(&event.group, event.ticket, event.error_code)
            }
            _ => Recorded::Stale,
        };

        let batch_complete = match recorded {
            Recorded::Stale => {
                warn!(
                    group = %event.group,
                    batch_id = %event.batch_id,
                    ticket = event.ticket,
                    "ignoring completion for a goal that is no longer tracked"
                );
                events.publish(DispatchPayload::StaleCompletion {
                    batch_id: event.batch_id,
                    group: event.group,
                });
                return None;
            }
            Recorded::Accepted { batch_complete } => batch_complete,
        };

        if event.error_code != 0 {
            let err = PostureError::GoalExecutionFailed {
                group: event.group.clone(),
                code: event.error_code,
            };
            error!(error = %err, "goal execution failed");
            state.failed = true;
        } else {
            debug!(group = %event.group, "goal finished");
        }
        events.publish(DispatchPayload::GroupCompleted {
            batch_id: event.batch_id,
            group: event.group,
            error_code: event.error_code,
        });

        if batch_complete {
            Self::on_batch_complete(state, events)
        } else {
            None
        }
    }

    /// Close the open batch and decide between chaining and idling.
    fn on_batch_complete(state: &mut DispatchState, events: &EventBus) -> Option<PendingChain> {
        let batch = state.batch.take()?;
        let outcome = batch.outcome();
        info!(
            batch_id = %outcome.batch_id,
            posture = %outcome.posture,
            succeeded = outcome.succeeded.len(),
            failed = outcome.failed.len(),
            "all movement finished"
        );
        events.publish(DispatchPayload::BatchCompleted(outcome.clone()));
        state.last_outcome = Some(outcome);

        let next = state
            .chain
            .next_posture(state.previous_posture.as_deref(), state.failed)
            .map(str::to_string);
        match next {
            Some(settle_posture) => {
                let from_posture = state.previous_posture.clone().unwrap_or_default();
                info!(from = %from_posture, settle = %settle_posture, "chaining settle posture");
                events.publish(DispatchPayload::ChainTriggered {
                    from_posture,
                    settle_posture: settle_posture.clone(),
                });
                Some(PendingChain {
                    from_batch: batch.id(),
                    settle_posture,
                })
            }
            None => {
                Self::declare_all_done(state, events, batch.id());
                None
            }
        }
    }

    fn declare_all_done(state: &mut DispatchState, events: &EventBus, batch_id: Uuid) {
        state.all_done = true;
        info!(batch_id = %batch_id, "all done");
        events.publish(DispatchPayload::AllDone { batch_id });
    }
}
