use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

/// The group identifier used when a request targets every known group.
pub const ALL_GROUPS: &str = "all";

/// A single joint-space waypoint of a [`Trajectory`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Waypoint {
    /// One position per joint, in the order of [`Trajectory::joint_names`].
    pub positions: Vec<f64>,
    /// Seconds from the start of the trajectory at which this waypoint is
    /// reached.
    pub time_from_start: f64,
}

/// A ready-to-send joint trajectory for one actuator group.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Trajectory {
    pub joint_names: Vec<String>,
    pub points: Vec<Waypoint>,
}

impl Trajectory {
    /// Rescale every waypoint's `time_from_start` by dividing it by
    /// `timescale`.
    ///
    /// A factor of exactly `1.0` is the identity and a factor of exactly `0.0`
    /// is treated as "no rescale" rather than a division by zero.
    pub fn rescaled(mut self, timescale: f64) -> Self {
        if timescale != 1.0 && timescale != 0.0 {
            for point in &mut self.points {
                point.time_from_start /= timescale;
            }
        }
        self
    }

    /// Time at which the final waypoint is reached (zero when empty).
    pub fn duration(&self) -> Duration {
        self.points
            .last()
            .and_then(|p| Duration::try_from_secs_f64(p.time_from_start).ok())
            .unwrap_or_default()
    }
}

/// Resolves a named posture into a trajectory for a single group.
///
/// The dispatcher only ever consumes postures through this trait; the storage
/// format behind it is the implementor's business.
pub trait TrajectoryResolver: Send + Sync {
    /// Return the trajectory of `posture` for `group`, or `None` when the
    /// group has no such posture.
    fn resolve(&self, group: &str, posture: &str) -> Option<Trajectory>;

    /// List posture names per group, optionally restricted to one group.
    fn list_postures(&self, group: Option<&str>) -> BTreeMap<String, Vec<String>>;
}

/// The groups a request is addressed to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Target {
    /// Every group in the dispatcher's configured list.
    All,
    /// An ordered collection of groups, dispatched in order.
    Many(Vec<String>),
    /// A single group.
    One(String),
}

impl Target {
    /// Build a target from its textual form: `"all"`, a comma-separated list
    /// of groups, or a single group name.
    pub fn parse(raw: &str) -> Self {
        let raw = raw.trim();
        if raw == ALL_GROUPS {
            Target::All
        } else if raw.contains(',') {
            Target::Many(
                raw.split(',')
                    .map(str::trim)
                    .filter(|g| !g.is_empty())
                    .map(str::to_string)
                    .collect(),
            )
        } else {
            Target::One(raw.to_string())
        }
    }
}

impl From<&str> for Target {
    fn from(raw: &str) -> Self {
        Target::parse(raw)
    }
}

impl From<Vec<String>> for Target {
    fn from(groups: Vec<String>) -> Self {
        Target::Many(groups)
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Target::All => write!(f, "{ALL_GROUPS}"),
            Target::Many(groups) => write!(f, "{}", groups.join(",")),
            Target::One(group) => write!(f, "{group}"),
        }
    }
}

/// A parsed `"<target> <posture> [timescale]"` request line.
#[derive(Debug, Clone, PartialEq)]
pub struct Request {
    pub target: Target,
    pub posture: String,
    pub timescale: f64,
}

impl Request {
    /// Parse a whitespace-separated request line.
    ///
    /// # Errors
    ///
    /// Returns [`PostureError::MalformedRequest`] when the target or posture
    /// is missing, or when the optional timescale is not a number.
    pub fn parse(line: &str) -> Result<Self, PostureError> {
        let mut tokens = line.split_whitespace();
        let (Some(target), Some(posture)) = (tokens.next(), tokens.next()) else {
            return Err(PostureError::MalformedRequest(format!(
                "expected '<target> <posture> [timescale]', got '{}'",
                line.trim()
            )));
        };
        let timescale = match tokens.next() {
            Some(raw) => raw.parse::<f64>().map_err(|e| {
                PostureError::MalformedRequest(format!("invalid timescale '{raw}': {e}"))
            })?,
            None => 1.0,
        };
        Ok(Self {
            target: Target::parse(target),
            posture: posture.to_string(),
            timescale,
        })
    }
}

/// Result of a bounded connection attempt to a group's execution endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConnectResult {
    Ready,
    TimedOut,
}

/// Connectivity of a group client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ConnectionState {
    #[default]
    Unconnected,
    Connected,
    Failed,
}

/// Evaluated result of a batch once every tracked group has reported.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchOutcome {
    pub batch_id: Uuid,
    pub posture: String,
    pub timescale: f64,
    pub succeeded: Vec<String>,
    pub failed: Vec<String>,
    pub completed_at: DateTime<Utc>,
}

impl BatchOutcome {
    /// `true` when no group in the batch reported an error.
    pub fn is_success(&self) -> bool {
        self.failed.is_empty()
    }
}

/// Notification broadcast by the dispatcher as goals move through their
/// lifecycle.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatchEvent {
    pub id: Uuid,
    pub timestamp: DateTime<Utc>,
    pub payload: DispatchPayload,
}

impl DispatchEvent {
    /// Stamp `payload` with a fresh id and the current time.
    pub fn new(payload: DispatchPayload) -> Self {
        Self {
            id: Uuid::new_v4(),
            timestamp: Utc::now(),
            payload,
        }
    }
}

/// Variants of dispatcher notifications.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", content = "data")]
pub enum DispatchPayload {
    /// A goal was handed to a group's transport.
    GoalSent {
        batch_id: Uuid,
        group: String,
        posture: String,
    },
    /// A group in the open batch reported completion.
    GroupCompleted {
        batch_id: Uuid,
        group: String,
        error_code: i32,
    },
    /// A completion arrived for a batch or goal that is no longer tracked.
    StaleCompletion { batch_id: Uuid, group: String },
    /// Every group of a batch has reported.
    BatchCompleted(BatchOutcome),
    /// The settle posture was dispatched after a batch completed.
    ChainTriggered {
        from_posture: String,
        settle_posture: String,
    },
    /// Nothing remains in flight.
    AllDone { batch_id: Uuid },
}

/// Errors raised across the posture dispatch stack.
#[derive(Error, Debug, Serialize, Deserialize)]
pub enum PostureError {
    #[error("No posture '{posture}' for group '{group}'")]
    PostureNotFound { group: String, posture: String },

    #[error("Could not connect to group '{group}' within {timeout:?}")]
    ClientProvisioningTimeout { group: String, timeout: Duration },

    #[error("Goal on group '{group}' failed with error code {code}")]
    GoalExecutionFailed { group: String, code: i32 },

    #[error("Malformed request: {0}")]
    MalformedRequest(String),

    #[error("Motion still in flight after {0:?}")]
    WaitTimedOut(Duration),
}
