//! In-process simulated transport for running without physical hardware.
//!
//! [`SimClientFactory`] hands out [`SimGroupClient`]s that accept every goal
//! and report completion once the trajectory's duration (divided by a
//! configurable speed-up) has elapsed.  Groups can be marked unreachable,
//! failing, or silent to exercise the dispatcher's error paths.
//!
//! # Example
//!
//! ```rust
//! use posture_hal::sim::SimClientFactory;
//!
//! let factory = SimClientFactory::new()
//!     .with_speedup(10.0)
//!     .with_failure("torso", 2)
//!     .with_unreachable("head");
//! assert_eq!(factory.created("torso"), 0);
//! ```

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use posture_types::{ConnectResult, ConnectionState, Trajectory};
use tracing::{debug, warn};

use crate::client::{ClientFactory, CompletionHandle, GroupClient};

// ────────────────────────────────────────────────────────────────────────────
// Simulated client
// ────────────────────────────────────────────────────────────────────────────

/// How a simulated group behaves once a goal is sent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum GoalBehavior {
    /// Report `error_code` after the trajectory has played out.
    Complete { error_code: i32 },
    /// Never report.
    Silent,
}

/// A simulated group endpoint.
pub struct SimGroupClient {
    group: String,
    reachable: bool,
    speedup: f64,
    behavior: GoalBehavior,
    state: Mutex<ConnectionState>,
}

impl SimGroupClient {
    /// A reachable group that completes every goal successfully in real time.
    pub fn new(group: impl Into<String>) -> Self {
        Self {
            group: group.into(),
            reachable: true,
            speedup: 1.0,
            behavior: GoalBehavior::Complete { error_code: 0 },
            state: Mutex::new(ConnectionState::Unconnected),
        }
    }

    fn set_state(&self, state: ConnectionState) {
        *self.state.lock().unwrap_or_else(|e| e.into_inner()) = state;
    }

    fn playback_time(&self, trajectory: &Trajectory) -> Duration {
        if self.speedup.is_finite() && self.speedup > 0.0 {
            Duration::try_from_secs_f64(trajectory.duration().as_secs_f64() / self.speedup)
                .unwrap_or(Duration::MAX)
        } else {
            Duration::ZERO
        }
    }
}

#[async_trait]
impl GroupClient for SimGroupClient {
    fn group(&self) -> &str {
        &self.group
    }

    async fn connect(&self, timeout: Duration) -> ConnectResult {
        if self.reachable {
            self.set_state(ConnectionState::Connected);
            ConnectResult::Ready
        } else {
            // An unreachable endpoint simply never answers.
            tokio::time::sleep(timeout).await;
            self.set_state(ConnectionState::Failed);
            ConnectResult::TimedOut
        }
    }

    fn state(&self) -> ConnectionState {
        *self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn send_goal(&self, trajectory: Trajectory, on_complete: CompletionHandle) {
        let delay = self.playback_time(&trajectory);
        debug!(
            group = %self.group,
            points = trajectory.points.len(),
            delay_ms = delay.as_millis() as u64,
            "sim goal accepted"
        );
        match self.behavior {
            GoalBehavior::Complete { error_code } => {
                tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    on_complete.complete(error_code);
                });
            }
            GoalBehavior::Silent => {
                warn!(group = %self.group, "sim group is silent, goal will never report");
                drop(on_complete);
            }
        }
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Factory
// ────────────────────────────────────────────────────────────────────────────

/// Builder-style factory of [`SimGroupClient`]s.
///
/// Records how many clients were created per group so tests can assert on
/// provisioning behaviour.
#[derive(Default)]
pub struct SimClientFactory {
    speedup: Option<f64>,
    unreachable: HashSet<String>,
    failures: HashMap<String, i32>,
    silent: HashSet<String>,
    created: Mutex<HashMap<String, usize>>,
}

impl SimClientFactory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Play trajectories back `speedup` times faster than real time.  A
    /// non-positive value completes goals immediately.
    pub fn with_speedup(mut self, speedup: f64) -> Self {
        self.speedup = Some(speedup);
        self
    }

    /// Make `group` time out on connect.
    pub fn with_unreachable(mut self, group: impl Into<String>) -> Self {
        self.unreachable.insert(group.into());
        self
    }

    /// Make every goal on `group` finish with `error_code`.
    pub fn with_failure(mut self, group: impl Into<String>, error_code: i32) -> Self {
        self.failures.insert(group.into(), error_code);
        self
    }

    /// Make `group` accept goals but never report completion.
    pub fn with_silent(mut self, group: impl Into<String>) -> Self {
        self.silent.insert(group.into());
        self
    }

    /// Number of clients created so far for `group`.
    pub fn created(&self, group: &str) -> usize {
        self.created
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(group)
            .copied()
            .unwrap_or(0)
    }
}

impl ClientFactory for SimClientFactory {
    fn create(&self, group: &str) -> Arc<dyn GroupClient> {
        *self
            .created
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .entry(group.to_string())
            .or_insert(0) += 1;

        let behavior = if self.silent.contains(group) {
            GoalBehavior::Silent
        } else {
            GoalBehavior::Complete {
                error_code: self.failures.get(group).copied().unwrap_or(0),
            }
        };

        let mut client = SimGroupClient::new(group);
        client.reachable = !self.unreachable.contains(group);
        client.speedup = self.speedup.unwrap_or(1.0);
        client.behavior = behavior;
        Arc::new(client)
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Tests
// ────────────────────────────────────────────────────────────────────────────
