//! [`Dispatcher`] – fans a posture request out to actuator groups.
//!
//! A request names a [`Target`] (all groups, an ordered list, or one group),
//! a posture and a timescale.  For every group the dispatcher:
//!
//! 1. resolves the posture through the [`TrajectoryResolver`] and rescales
//!    it,
//! 2. provisions the group's client on first use (bounded connect timeout),
//! 3. registers the group in the open [`Batch`] under a fresh ticket and
//!    hands the goal to the client together with a completion handle.
//!
//! [`execute`][Dispatcher::execute] returns as soon as the goals are sent.
//! Completion is observed by the [`CompletionAggregator`], which closes the
//! batch, publishes the outcome and optionally chains the settle posture.
//!
//! All tracking state sits behind one async mutex.  A dispatch holds it for
//! its whole fan-out, so no completion can close a batch before every group
//! of the request has been registered.
//!
//! # Overlapping requests
//!
//! Dispatching to [`Target::All`] opens a new batch and replaces the open one.
//! Goals still running from the replaced batch keep running (there is no
//! cancellation) but their completions are ignored.  Dispatches to single
//! groups or lists join the open batch, or open one when none is open.
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use posture_hal::SimClientFactory;
//! use posture_library::PostureLibrary;
//! use posture_runtime::{Dispatcher, DispatcherConfig};
//! use posture_types::Target;
//!
//! # async fn demo() -> Result<(), Box<dyn std::error::Error>> {
//! let library = PostureLibrary::load("postures.yaml")?;
//! let dispatcher = Dispatcher::new(
//!     DispatcherConfig::default(),
//!     Arc::new(library),
//!     Arc::new(SimClientFactory::new()),
//! );
//! assert!(dispatcher.execute(Target::All, "rest", 1.0).await);
//! dispatcher
//!     .wait_until_done(std::time::Duration::from_millis(100), None)
//!     .await?;
//! # Ok(())
//! # }
//! ```

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use posture_hal::{
    ClientFactory, ClientPool, CompletionEvent, CompletionHandle, DEFAULT_CONNECT_TIMEOUT,
};
use posture_types::{
    BatchOutcome, DispatchEvent, DispatchPayload, PostureError, Target, TrajectoryResolver,
};
use tokio::sync::{Mutex, broadcast, mpsc};
use tracing::{debug, error, info, warn};

use crate::aggregator::{ChainPolicy, CompletionAggregator};
use crate::batch::Batch;
use crate::events::{DEFAULT_CAPACITY, EventBus};

/// Groups that make up [`Target::All`] unless configured otherwise.
pub const DEFAULT_GROUPS: [&str; 6] = [
    "right_arm",
    "right_hand",
    "left_arm",
    "left_hand",
    "torso",
    "head",
];

/// Minimum sleep between two polls of [`Dispatcher::wait_until_done`].
const MIN_POLL_INTERVAL: Duration = Duration::from_millis(1);

// ─────────────────────────────────────────────────────────────────────────────
// Configuration
// ─────────────────────────────────────────────────────────────────────────────

/// Configuration bundle for [`Dispatcher`].
#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    /// The groups [`Target::All`] expands to, in dispatch order.
    pub groups: Vec<String>,
    /// Bound on a group client's first connection attempt.
    pub connect_timeout: Duration,
    /// Settle-posture chaining after each completed batch.
    pub chain: ChainPolicy,
    /// Capacity of the dispatch event bus.
    pub event_capacity: usize,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            groups: DEFAULT_GROUPS.iter().map(|g| g.to_string()).collect(),
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            chain: ChainPolicy::default(),
            event_capacity: DEFAULT_CAPACITY,
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Shared state
// ─────────────────────────────────────────────────────────────────────────────

/// Everything guarded by the dispatcher lock.
pub(crate) struct DispatchState {
    pub(crate) pool: ClientPool,
    /// The batch currently being tracked, if any.
    pub(crate) batch: Option<Batch>,
    pub(crate) all_done: bool,
    /// Sticky until the next batch opens.
    pub(crate) failed: bool,
    /// Posture of the most recent request, compared against the settle
    /// posture before chaining.
    pub(crate) previous_posture: Option<String>,
    pub(crate) chain: ChainPolicy,
    pub(crate) last_outcome: Option<BatchOutcome>,
    next_ticket: u64,
}

impl DispatchState {
    /// Replace the open batch with a fresh one.
    fn open_batch(&mut self, posture: &str, timescale: f64) {
        if let Some(old) = &self.batch
            && old.pending() > 0
        {
            warn!(
                batch_id = %old.id(),
                pending = old.pending(),
                "replacing open batch, its in-flight completions will be ignored"
            );
        }
        self.failed = false;
        self.batch = Some(Batch::new(posture, timescale));
    }

    /// The open batch, opening one when none is.
    fn current_batch(&mut self, posture: &str, timescale: f64) -> &mut Batch {
        if self.batch.is_none() {
            self.failed = false;
        }
        self.batch
            .get_or_insert_with(|| Batch::new(posture, timescale))
    }

    fn next_ticket(&mut self) -> u64 {
        self.next_ticket += 1;
        self.next_ticket
    }
}

pub(crate) struct Shared {
    resolver: Arc<dyn TrajectoryResolver>,
    groups: Vec<String>,
    pub(crate) state: Mutex<DispatchState>,
    completions: mpsc::UnboundedSender<CompletionEvent>,
    pub(crate) events: EventBus,
}

// ─────────────────────────────────────────────────────────────────────────────
// Dispatcher
// ─────────────────────────────────────────────────────────────────────────────

/// Posture dispatcher.  Clones share the same state.
#[derive(Clone)]
pub struct Dispatcher {
    pub(crate) shared: Arc<Shared>,
}

impl Dispatcher {
    /// Build a dispatcher and spawn its [`CompletionAggregator`].
    ///
    /// Must be called from within a Tokio runtime.
    pub fn new(
        config: DispatcherConfig,
        resolver: Arc<dyn TrajectoryResolver>,
        factory: Arc<dyn ClientFactory>,
    ) -> Self {
        let (completions, rx) = mpsc::unbounded_channel();
        let state = DispatchState {
            pool: ClientPool::new(factory, config.connect_timeout),
            batch: None,
            all_done: true,
            failed: false,
            previous_posture: None,
            chain: config.chain,
            last_outcome: None,
            next_ticket: 0,
        };
        let shared = Arc::new(Shared {
            resolver,
            groups: config.groups,
            state: Mutex::new(state),
            completions,
            events: EventBus::new(config.event_capacity),
        });

        let aggregator = CompletionAggregator::new(Arc::downgrade(&shared), rx);
        tokio::spawn(aggregator.run());

        Self { shared }
    }

    pub(crate) fn from_shared(shared: Arc<Shared>) -> Self {
        Self { shared }
    }

    // -------------------------------------------------------------------------
    // Dispatch
    // -------------------------------------------------------------------------

    /// Send `posture` to every group of `target`, rescaled by `timescale`.
    ///
    /// Returns `true` when every group's goal was sent.  A group whose
    /// posture cannot be resolved or whose client cannot be provisioned
    /// makes the result `false` but does not stop its siblings.  The call
    /// never waits for the motion itself.
    pub async fn execute(&self, target: Target, posture: &str, timescale: f64) -> bool {
        if let Err(e) = validate(posture, timescale) {
            error!(error = %e, "rejecting request");
            return false;
        }
        info!(groups = %target, posture, timescale, "executing posture");

        let mut state = self.shared.state.lock().await;
        state.previous_posture = Some(posture.to_string());

        // An all-groups request replaces the open batch, but only once its
        // first goal is actually sent.
        let mut replace_batch = matches!(target, Target::All);
        let groups = match target {
            Target::All => {
                info!("calling all the groups");
                self.shared.groups.clone()
            }
            Target::Many(groups) => groups,
            Target::One(group) => vec![group],
        };

        let mut sent_all = true;
        for group in &groups {
            sent_all &= self
                .dispatch_one(&mut state, group, posture, timescale, &mut replace_batch)
                .await;
        }
        if replace_batch {
            warn!(posture, "nothing sent, keeping the open batch");
        }
        sent_all
    }

    async fn dispatch_one(
        &self,
        state: &mut DispatchState,
        group: &str,
        posture: &str,
        timescale: f64,
        replace_batch: &mut bool,
    ) -> bool {
        let Some(trajectory) = self.shared.resolver.resolve(group, posture) else {
            let err = PostureError::PostureNotFound {
                group: group.to_string(),
                posture: posture.to_string(),
            };
            error!(error = %err, "no goal found");
            return false;
        };
        let trajectory = trajectory.rescaled(timescale);

        let client = match state.pool.get_or_provision(group).await {
            Ok(client) => client,
            Err(e) => {
                error!(group, error = %e, "could not set up group client");
                return false;
            }
        };

        if std::mem::take(replace_batch) {
            state.open_batch(posture, timescale);
        }
        let ticket = state.next_ticket();
        let batch = state.current_batch(posture, timescale);
        batch.track(group, ticket, posture, timescale);
        let batch_id = batch.id();

        let handle = CompletionHandle::new(
            batch_id,
            group,
            ticket,
            self.shared.completions.clone(),
        );
        client.send_goal(trajectory, handle);
        state.all_done = false;

        debug!(group, batch_id = %batch_id, ticket, "goal sent");
        self.shared.events.publish(DispatchPayload::GoalSent {
            batch_id,
            group: group.to_string(),
            posture: posture.to_string(),
        });
        true
    }

    /// Dispatch and then block until everything is done, the RPC-style
    /// entry point.
    ///
    /// Returns `Ok(false)` without waiting when the dispatch itself failed.
    ///
    /// # Errors
    ///
    /// Returns [`PostureError::WaitTimedOut`] when `timeout` elapses first.
    pub async fn execute_and_wait(
        &self,
        target: Target,
        posture: &str,
        timescale: f64,
        poll_interval: Duration,
        timeout: Option<Duration>,
    ) -> Result<bool, PostureError> {
        if !self.execute(target, posture, timescale).await {
            return Ok(false);
        }
        self.wait_until_done(poll_interval, timeout).await?;
        Ok(true)
    }

    // -------------------------------------------------------------------------
    // Completion queries
    // -------------------------------------------------------------------------

    /// `true` when nothing dispatched is still in flight and no settle
    /// posture is pending.
    pub async fn is_all_done(&self) -> bool {
        self.shared.state.lock().await.all_done
    }

    /// `true` when a goal of the current (or last) batch failed.
    pub async fn has_failed(&self) -> bool {
        self.shared.state.lock().await.failed
    }

    /// Outcome of the most recently closed batch.
    pub async fn last_outcome(&self) -> Option<BatchOutcome> {
        self.shared.state.lock().await.last_outcome.clone()
    }

    /// Number of groups of the open batch that have not reported yet.
    pub async fn pending_groups(&self) -> usize {
        self.shared
            .state
            .lock()
            .await
            .batch
            .as_ref()
            .map_or(0, Batch::pending)
    }

    /// Poll [`is_all_done`][Self::is_all_done] every `poll_interval`.
    ///
    /// With `timeout == None` this waits forever if a group never reports.
    ///
    /// # Errors
    ///
    /// Returns [`PostureError::WaitTimedOut`] once `timeout` has elapsed.
    pub async fn wait_until_done(
        &self,
        poll_interval: Duration,
        timeout: Option<Duration>,
    ) -> Result<(), PostureError> {
        let poll_interval = poll_interval.max(MIN_POLL_INTERVAL);
        let started = tokio::time::Instant::now();
        loop {
            if self.is_all_done().await {
                return Ok(());
            }
            if let Some(limit) = timeout
                && started.elapsed() >= limit
            {
                return Err(PostureError::WaitTimedOut(limit));
            }
            debug!("not done");
            tokio::time::sleep(poll_interval).await;
        }
    }

    // -------------------------------------------------------------------------
    // Configuration & introspection
    // -------------------------------------------------------------------------

    /// Replace the settle-posture policy.
    pub async fn set_chain_policy(&self, policy: ChainPolicy) {
        info!(settle = %policy.settle_posture, chain_on_failure = policy.chain_on_failure, "chain policy updated");
        self.shared.state.lock().await.chain = policy;
    }

    pub async fn chain_policy(&self) -> ChainPolicy {
        self.shared.state.lock().await.chain.clone()
    }

    /// The groups [`Target::All`] expands to.
    pub fn groups(&self) -> &[String] {
        &self.shared.groups
    }

    /// Groups with a connected client.
    pub async fn connected_groups(&self) -> Vec<String> {
        self.shared.state.lock().await.pool.connected_groups()
    }

    /// Posture names per group, as known to the resolver.
    pub fn list_postures(&self, group: Option<&str>) -> BTreeMap<String, Vec<String>> {
        self.shared.resolver.list_postures(group)
    }

    /// Subscribe to [`DispatchEvent`]s.
    pub fn subscribe(&self) -> broadcast::Receiver<DispatchEvent> {
        self.shared.events.subscribe()
    }
}

fn validate(posture: &str, timescale: f64) -> Result<(), PostureError> {
    if posture.trim().is_empty() {
        return Err(PostureError::MalformedRequest(
            "posture name is empty".to_string(),
        ));
    }
    if !timescale.is_finite() || timescale < 0.0 {
        return Err(PostureError::MalformedRequest(format!(
            "timescale must be a non-negative number, got {timescale}"
        )));
    }
    Ok(())
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use posture_hal::{GroupClient, SimClientFactory};
    use posture_types::{ConnectResult, ConnectionState, Trajectory, Waypoint};
    use std::collections::{HashMap, HashSet};
    use std::sync::Mutex as StdMutex;

    // ------------------------------------------------------------------
    // Test doubles
    // ------------------------------------------------------------------

    fn two_second_move() -> Trajectory {
        Trajectory {
            joint_names: vec!["j0".to_string()],
            points: vec![
                Waypoint {
                    positions: vec![0.0],
                    time_from_start: 1.0,
                },
                Waypoint {
                    positions: vec![1.0],
                    time_from_start: 2.0,
                },
            ],
        }
    }

    /// Resolver where listed groups know listed postures.
    struct MapResolver {
        known: HashSet<(String, String)>,
    }

    impl MapResolver {
        fn new(groups: &[&str], postures: &[&str]) -> Arc<Self> {
            let known = groups
                .iter()
                .flat_map(|g| postures.iter().map(move |p| (g.to_string(), p.to_string())))
                .collect();
            Arc::new(Self { known })
        }
    }

    impl TrajectoryResolver for MapResolver {
        fn resolve(&self, group: &str, posture: &str) -> Option<Trajectory> {
            self.known
                .contains(&(group.to_string(), posture.to_string()))
                .then(two_second_move)
        }

        fn list_postures(&self, _group: Option<&str>) -> BTreeMap<String, Vec<String>> {
            BTreeMap::new()
        }
    }

    struct SentGoal {
        group: String,
        trajectory: Trajectory,
        handle: Option<CompletionHandle>,
    }

    type GoalLog = Arc<StdMutex<Vec<SentGoal>>>;

    struct ManualClient {
        group: String,
        reachable: bool,
        goals: GoalLog,
    }

    #[async_trait]
    impl GroupClient for ManualClient {
        fn group(&self) -> &str {
            &self.group
        }
        async fn connect(&self, _timeout: Duration) -> ConnectResult {
            if self.reachable {
                ConnectResult::Ready
            } else {
                ConnectResult::TimedOut
            }
        }
        fn state(&self) -> ConnectionState {
            ConnectionState::Connected
        }
        fn send_goal(&self, trajectory: Trajectory, on_complete: CompletionHandle) {
            self.goals.lock().unwrap().push(SentGoal {
                group: self.group.clone(),
                trajectory,
                handle: Some(on_complete),
            });
        }
    }

    /// Factory whose goals only complete when the test says so.
    #[derive(Default)]
    struct ManualFactory {
        unreachable: HashSet<String>,
        created: StdMutex<HashMap<String, usize>>,
        goals: GoalLog,
    }

    impl ManualFactory {
        fn unreachable(group: &str) -> Self {
            Self {
                unreachable: HashSet::from([group.to_string()]),
                ..Self::default()
            }
        }

        fn created(&self, group: &str) -> usize {
            self.created.lock().unwrap().get(group).copied().unwrap_or(0)
        }

        fn sent(&self, group: &str) -> usize {
            self.goals.lock().unwrap().iter().filter(|g| g.group == group).count()
        }

        fn last_trajectory(&self, group: &str) -> Trajectory {
            self.goals
                .lock()
                .unwrap()
                .iter()
                .rev()
                .find(|g| g.group == group)
                .map(|g| g.trajectory.clone())
                .expect("goal was sent")
        }

        /// Complete the oldest unreported goal of `group`.
        fn complete(&self, group: &str, error_code: i32) {
            let handle = self
                .goals
                .lock()
                .unwrap()
                .iter_mut()
                .find(|g| g.group == group && g.handle.is_some())
                .and_then(|g| g.handle.take())
                .expect("an unreported goal for the group");
            handle.complete(error_code);
        }
    }

    impl ClientFactory for ManualFactory {
        fn create(&self, group: &str) -> Arc<dyn GroupClient> {
            *self.created.lock().unwrap().entry(group.to_string()).or_insert(0) += 1;
            Arc::new(ManualClient {
                group: group.to_string(),
                reachable: !self.unreachable.contains(group),
                goals: Arc::clone(&self.goals),
            })
        }
    }

    fn dispatcher_with(
        resolver: Arc<MapResolver>,
        factory: &Arc<ManualFactory>,
        chain: ChainPolicy,
    ) -> Dispatcher {
        let config = DispatcherConfig {
            chain,
            connect_timeout: Duration::from_millis(50),
            ..DispatcherConfig::default()
        };
        Dispatcher::new(config, resolver, Arc::clone(factory) as Arc<dyn ClientFactory>)
    }

    fn all_postures(postures: &[&str]) -> Arc<MapResolver> {
        MapResolver::new(&DEFAULT_GROUPS, postures)
    }

    /// Wait for the next event matching `pred`.
    async fn next_event(
        rx: &mut broadcast::Receiver<DispatchEvent>,
        pred: impl Fn(&DispatchPayload) -> bool,
    ) -> DispatchPayload {
        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                let event = rx.recv().await.expect("event bus open");
                if pred(&event.payload) {
                    return event.payload;
                }
            }
        })
        .await
        .expect("event arrived in time")
    }

    async fn wait_for_n(
        rx: &mut broadcast::Receiver<DispatchEvent>,
        n: usize,
        pred: impl Fn(&DispatchPayload) -> bool,
    ) {
        for _ in 0..n {
            next_event(rx, &pred).await;
        }
    }

    fn is_group_completed(p: &DispatchPayload) -> bool {
        matches!(p, DispatchPayload::GroupCompleted { .. })
    }

    fn is_batch_completed(p: &DispatchPayload) -> bool {
        matches!(p, DispatchPayload::BatchCompleted(_))
    }

    fn is_all_done(p: &DispatchPayload) -> bool {
        matches!(p, DispatchPayload::AllDone { .. })
    }

    // ------------------------------------------------------------------
    // Tests
    // ------------------------------------------------------------------

    #[tokio::test]
    async fn all_batch_completes_once_in_reverse_alphabetical_order() {
        let factory = Arc::new(ManualFactory::default());
        let dispatcher = dispatcher_with(all_postures(&["rest"]), &factory, ChainPolicy::disabled());
        let mut rx = dispatcher.subscribe();

        assert!(dispatcher.is_all_done().await);
        assert!(dispatcher.execute(Target::All, "rest", 1.0).await);
        assert!(!dispatcher.is_all_done().await);
        assert_eq!(dispatcher.pending_groups().await, 6);

        let mut groups: Vec<&str> = DEFAULT_GROUPS.to_vec();
        groups.sort_unstable_by(|a, b| b.cmp(a));
        for group in groups {
            factory.complete(group, 0);
        }

        let mut batch_completions = 0;
        loop {
            let payload = next_event(&mut rx, |_| true).await;
            if is_batch_completed(&payload) {
                batch_completions += 1;
            }
            if is_all_done(&payload) {
                break;
            }
        }
        assert_eq!(batch_completions, 1);
        assert!(dispatcher.is_all_done().await);
        assert!(!dispatcher.has_failed().await);
        assert!(rx.try_recv().is_err(), "nothing is dispatched after the batch");
        for group in DEFAULT_GROUPS {
            assert_eq!(factory.sent(group), 1);
        }
        let outcome = dispatcher.last_outcome().await.expect("outcome recorded");
        assert_eq!(outcome.succeeded.len(), 6);
        assert_eq!(outcome.posture, "rest");
    }

    #[tokio::test]
    async fn batch_waits_for_every_group() {
        let factory = Arc::new(ManualFactory::default());
        let dispatcher = dispatcher_with(all_postures(&["rest"]), &factory, ChainPolicy::disabled());
        let mut rx = dispatcher.subscribe();

        dispatcher.execute(Target::All, "rest", 1.0).await;

        // B, D, F first.
        for group in ["right_hand", "left_hand", "head"] {
            factory.complete(group, 0);
        }
        wait_for_n(&mut rx, 3, is_group_completed).await;
        assert!(!dispatcher.is_all_done().await);
        assert!(dispatcher.last_outcome().await.is_none());
        assert_eq!(dispatcher.pending_groups().await, 3);

        // Then A, C, E.
        for group in ["right_arm", "left_arm", "torso"] {
            factory.complete(group, 0);
        }
        next_event(&mut rx, is_batch_completed).await;
        next_event(&mut rx, is_all_done).await;
        assert!(dispatcher.is_all_done().await);
    }

    #[tokio::test]
    async fn unresolvable_group_is_skipped_and_batch_completes_without_it() {
        let factory = Arc::new(ManualFactory::default());
        let resolver = MapResolver::new(&["right_arm"], &["wave"]);
        let dispatcher = dispatcher_with(resolver, &factory, ChainPolicy::disabled());
        let mut rx = dispatcher.subscribe();

        let target = Target::Many(vec!["left_arm".to_string(), "right_arm".to_string()]);
        assert!(!dispatcher.execute(target, "wave", 2.0).await);

        assert_eq!(factory.created("left_arm"), 0, "no client for an unresolved group");
        assert_eq!(factory.sent("right_arm"), 1);
        let sent = factory.last_trajectory("right_arm");
        assert!((sent.points[1].time_from_start - 1.0).abs() < f64::EPSILON);
        assert_eq!(dispatcher.pending_groups().await, 1);

        factory.complete("right_arm", 0);
        let DispatchPayload::BatchCompleted(outcome) = next_event(&mut rx, is_batch_completed).await
        else {
            unreachable!()
        };
        assert_eq!(outcome.succeeded, vec!["right_arm"]);
        assert!(outcome.failed.is_empty());
        assert!((outcome.timescale - 2.0).abs() < f64::EPSILON);
        next_event(&mut rx, is_all_done).await;
        assert!(dispatcher.is_all_done().await);
    }

    #[tokio::test]
    async fn settle_equal_to_executed_posture_does_not_chain() {
        let factory = Arc::new(ManualFactory::default());
        let dispatcher = dispatcher_with(all_postures(&["rest"]), &factory, ChainPolicy::settle("rest"));
        let mut rx = dispatcher.subscribe();

        dispatcher.execute(Target::All, "rest", 1.0).await;
        for group in DEFAULT_GROUPS {
            factory.complete(group, 0);
        }
        next_event(&mut rx, is_all_done).await;

        assert!(dispatcher.is_all_done().await);
        for group in DEFAULT_GROUPS {
            assert_eq!(factory.sent(group), 1);
        }
    }

    #[tokio::test]
    async fn distinct_settle_posture_chains_exactly_once() {
        let factory = Arc::new(ManualFactory::default());
        let dispatcher = dispatcher_with(
            all_postures(&["wave", "waiting"]),
            &factory,
            ChainPolicy::settle("waiting"),
        );
        let mut rx = dispatcher.subscribe();

        dispatcher.execute(Target::All, "wave", 1.0).await;
        for group in DEFAULT_GROUPS {
            factory.complete(group, 0);
        }

        let chained = next_event(&mut rx, |p| matches!(p, DispatchPayload::ChainTriggered { .. })).await;
        let DispatchPayload::ChainTriggered { from_posture, settle_posture } = chained else {
            unreachable!()
        };
        assert_eq!(from_posture, "wave");
        assert_eq!(settle_posture, "waiting");

        wait_for_n(&mut rx, 6, |p| {
            matches!(p, DispatchPayload::GoalSent { posture, .. } if posture == "waiting")
        })
        .await;
        assert!(!dispatcher.is_all_done().await, "settle batch still in flight");
        for group in DEFAULT_GROUPS {
            assert_eq!(factory.sent(group), 2);
        }

        for group in DEFAULT_GROUPS {
            factory.complete(group, 0);
        }
        next_event(&mut rx, is_all_done).await;
        assert!(dispatcher.is_all_done().await);
        for group in DEFAULT_GROUPS {
            assert_eq!(factory.sent(group), 2, "the settle posture does not chain onto itself");
        }
        assert_eq!(dispatcher.last_outcome().await.unwrap().posture, "waiting");
    }

    #[tokio::test]
    async fn unresolvable_settle_posture_still_ends_in_all_done() {
        let factory = Arc::new(ManualFactory::default());
        let dispatcher = dispatcher_with(all_postures(&["rest"]), &factory, ChainPolicy::settle("missing"));
        let mut rx = dispatcher.subscribe();

        dispatcher.execute(Target::One("head".to_string()), "rest", 1.0).await;
        factory.complete("head", 0);

        next_event(&mut rx, |p| matches!(p, DispatchPayload::ChainTriggered { .. })).await;
        next_event(&mut rx, is_all_done).await;
        assert!(dispatcher.is_all_done().await);
        assert_eq!(dispatcher.pending_groups().await, 0);
    }

    #[tokio::test]
    async fn client_is_created_once_per_group() {
        let factory = Arc::new(ManualFactory::default());
        let dispatcher = dispatcher_with(all_postures(&["rest", "wave"]), &factory, ChainPolicy::disabled());

        for posture in ["rest", "wave", "rest"] {
            assert!(dispatcher.execute(Target::One("head".into()), posture, 1.0).await);
        }
        dispatcher.execute(Target::All, "wave", 1.0).await;

        assert_eq!(factory.created("head"), 1);
        assert_eq!(factory.sent("head"), 4);
        assert_eq!(dispatcher.connected_groups().await.len(), 6);
    }

    #[tokio::test]
    async fn provisioning_failure_returns_false_and_is_retried() {
        let factory = Arc::new(ManualFactory::unreachable("head"));
        let dispatcher = dispatcher_with(all_postures(&["rest"]), &factory, ChainPolicy::disabled());

        assert!(!dispatcher.execute(Target::One("head".into()), "rest", 1.0).await);
        assert!(!dispatcher.execute(Target::One("head".into()), "rest", 1.0).await);

        assert_eq!(factory.created("head"), 2);
        assert_eq!(factory.sent("head"), 0);
        assert!(dispatcher.is_all_done().await, "nothing was sent");
        assert!(dispatcher.connected_groups().await.is_empty());
    }

    #[tokio::test]
    async fn failure_is_sticky_until_next_batch() {
        let factory = Arc::new(ManualFactory::default());
        let dispatcher = dispatcher_with(all_postures(&["rest"]), &factory, ChainPolicy::disabled());
        let mut rx = dispatcher.subscribe();

        dispatcher.execute(Target::All, "rest", 1.0).await;
        factory.complete("torso", 3);
        next_event(&mut rx, is_group_completed).await;
        assert!(dispatcher.has_failed().await);

        for group in DEFAULT_GROUPS.iter().filter(|g| **g != "torso") {
            factory.complete(group, 0);
        }
        next_event(&mut rx, is_all_done).await;
        assert!(dispatcher.has_failed().await, "still failed after the batch closed");
        let outcome = dispatcher.last_outcome().await.unwrap();
        assert_eq!(outcome.failed, vec!["torso"]);
        assert!(!outcome.is_success());

        dispatcher.execute(Target::All, "rest", 1.0).await;
        assert!(!dispatcher.has_failed().await, "a new batch clears the flag");
    }

    #[tokio::test]
    async fn failed_batch_chains_by_default() {
        let factory = Arc::new(ManualFactory::default());
        let dispatcher = dispatcher_with(
            MapResolver::new(&DEFAULT_GROUPS, &["wave", "waiting"]),
            &factory,
            ChainPolicy::settle("waiting"),
        );
        let mut rx = dispatcher.subscribe();

        dispatcher.execute(Target::One("head".into()), "wave", 1.0).await;
        factory.complete("head", 1);
        next_event(&mut rx, |p| matches!(p, DispatchPayload::ChainTriggered { .. })).await;
        next_event(&mut rx, |p| {
            matches!(p, DispatchPayload::GoalSent { group, .. } if group == "torso")
        })
        .await;
        assert_eq!(factory.sent("torso"), 1);
        assert!(!dispatcher.has_failed().await, "the settle batch starts clean");
    }

    #[tokio::test]
    async fn failed_batch_does_not_chain_when_configured() {
        let factory = Arc::new(ManualFactory::default());
        let dispatcher = dispatcher_with(
            MapResolver::new(&DEFAULT_GROUPS, &["wave", "waiting"]),
            &factory,
            ChainPolicy::settle("waiting").with_chain_on_failure(false),
        );
        let mut rx = dispatcher.subscribe();

        dispatcher.execute(Target::One("head".into()), "wave", 1.0).await;
        factory.complete("head", 1);
        next_event(&mut rx, is_all_done).await;

        assert!(dispatcher.is_all_done().await);
        assert_eq!(factory.sent("torso"), 0);
    }

    #[tokio::test]
    async fn new_all_dispatch_ignores_completions_of_replaced_batch() {
        let factory = Arc::new(ManualFactory::default());
        let dispatcher = dispatcher_with(all_postures(&["rest", "wave"]), &factory, ChainPolicy::disabled());
        let mut rx = dispatcher.subscribe();

        dispatcher.execute(Target::All, "rest", 1.0).await;
        dispatcher.execute(Target::All, "wave", 1.0).await;

        // The six "rest" goals finish first and belong to the replaced batch.
        for group in DEFAULT_GROUPS {
            factory.complete(group, 0);
        }
        wait_for_n(&mut rx, 6, |p| matches!(p, DispatchPayload::StaleCompletion { .. })).await;
        assert!(!dispatcher.is_all_done().await);
        assert_eq!(dispatcher.pending_groups().await, 6);

        for group in DEFAULT_GROUPS {
            factory.complete(group, 0);
        }
        next_event(&mut rx, is_all_done).await;
        assert_eq!(dispatcher.last_outcome().await.unwrap().posture, "wave");
    }

    #[tokio::test]
    async fn all_dispatch_that_sends_nothing_keeps_the_open_batch() {
        let factory = Arc::new(ManualFactory::default());
        let dispatcher = dispatcher_with(all_postures(&["rest"]), &factory, ChainPolicy::disabled());

        assert!(dispatcher.execute(Target::All, "rest", 1.0).await);
        assert!(!dispatcher.execute(Target::All, "unknown", 1.0).await);
        assert_eq!(dispatcher.pending_groups().await, 6);

        for group in DEFAULT_GROUPS {
            factory.complete(group, 0);
        }
        dispatcher
            .wait_until_done(Duration::from_millis(5), Some(Duration::from_secs(2)))
            .await
            .expect("the rest batch still closes");
        let outcome = dispatcher.last_outcome().await.expect("outcome recorded");
        assert_eq!(outcome.posture, "rest");
        assert_eq!(outcome.succeeded.len(), 6);
    }

    #[tokio::test]
    async fn single_group_dispatches_join_the_open_batch() {
        let factory = Arc::new(ManualFactory::default());
        let dispatcher = dispatcher_with(all_postures(&["rest"]), &factory, ChainPolicy::disabled());
        let mut rx = dispatcher.subscribe();

        dispatcher.execute(Target::One("left_arm".into()), "rest", 1.0).await;
        dispatcher.execute(Target::One("right_arm".into()), "rest", 1.0).await;

        factory.complete("left_arm", 0);
        next_event(&mut rx, is_group_completed).await;
        assert!(!dispatcher.is_all_done().await);

        factory.complete("right_arm", 0);
        let DispatchPayload::BatchCompleted(outcome) = next_event(&mut rx, is_batch_completed).await
        else {
            unreachable!()
        };
        assert_eq!(outcome.succeeded, vec!["left_arm", "right_arm"]);
    }

    #[tokio::test]
    async fn malformed_requests_are_rejected_without_side_effects() {
        let factory = Arc::new(ManualFactory::default());
        let dispatcher = dispatcher_with(all_postures(&["rest"]), &factory, ChainPolicy::disabled());

        assert!(!dispatcher.execute(Target::All, "", 1.0).await);
        assert!(!dispatcher.execute(Target::All, "rest", -1.0).await);
        assert!(!dispatcher.execute(Target::All, "rest", f64::NAN).await);

        assert_eq!(factory.created("head"), 0);
        assert!(dispatcher.is_all_done().await);
        assert_eq!(dispatcher.pending_groups().await, 0);
    }

    #[tokio::test]
    async fn zero_timescale_sends_unscaled_trajectory() {
        let factory = Arc::new(ManualFactory::default());
        let dispatcher = dispatcher_with(all_postures(&["rest"]), &factory, ChainPolicy::disabled());

        assert!(dispatcher.execute(Target::One("torso".into()), "rest", 0.0).await);
        assert_eq!(factory.last_trajectory("torso"), two_second_move());
    }

    #[tokio::test]
    async fn wait_until_done_times_out_while_a_group_is_silent() {
        let factory = Arc::new(ManualFactory::default());
        let dispatcher = dispatcher_with(all_postures(&["rest"]), &factory, ChainPolicy::disabled());

        dispatcher.execute(Target::One("head".into()), "rest", 1.0).await;
        let result = dispatcher
            .wait_until_done(Duration::from_millis(5), Some(Duration::from_millis(30)))
            .await;
        assert!(matches!(result, Err(PostureError::WaitTimedOut(_))));

        factory.complete("head", 0);
        dispatcher
            .wait_until_done(Duration::from_millis(5), Some(Duration::from_secs(5)))
            .await
            .expect("done once the group reports");
    }

    #[tokio::test]
    async fn execute_and_wait_reports_dispatch_failure_immediately() {
        let factory = Arc::new(ManualFactory::default());
        let dispatcher = dispatcher_with(all_postures(&["rest"]), &factory, ChainPolicy::disabled());

        let sent = dispatcher
            .execute_and_wait(
                Target::One("head".into()),
                "missing",
                1.0,
                Duration::from_millis(5),
                None,
            )
            .await
            .unwrap();
        assert!(!sent);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn simulated_stack_runs_to_completion_with_settle() {
        let factory = Arc::new(SimClientFactory::new().with_speedup(100.0));
        let config = DispatcherConfig {
            chain: ChainPolicy::settle("waiting"),
            ..DispatcherConfig::default()
        };
        let dispatcher = Dispatcher::new(
            config,
            all_postures(&["wave", "waiting"]),
            factory.clone() as Arc<dyn ClientFactory>,
        );

        let done = dispatcher
            .execute_and_wait(
                Target::All,
                "wave",
                1.0,
                Duration::from_millis(5),
                Some(Duration::from_secs(10)),
            )
            .await
            .expect("simulated motion finishes");
        assert!(done);
        assert_eq!(dispatcher.last_outcome().await.unwrap().posture, "waiting");
        for group in DEFAULT_GROUPS {
            assert_eq!(factory.created(group), 1);
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn instant_completions_close_each_batch_exactly_once() {
        let factory = Arc::new(SimClientFactory::new().with_speedup(0.0));
        let config = DispatcherConfig {
            chain: ChainPolicy::disabled(),
            ..DispatcherConfig::default()
        };
        let dispatcher = Dispatcher::new(
            config,
            all_postures(&["rest"]),
            factory as Arc<dyn ClientFactory>,
        );
        let mut rx = dispatcher.subscribe();

        for round in 0..25 {
            assert!(dispatcher.execute(Target::All, "rest", 1.0).await);

            let mut batch_completions = 0;
            loop {
                match next_event(&mut rx, |_| true).await {
                    DispatchPayload::BatchCompleted(outcome) => {
                        batch_completions += 1;
                        assert_eq!(outcome.succeeded.len(), 6, "round {round}");
                        assert!(outcome.failed.is_empty(), "round {round}");
                    }
                    DispatchPayload::AllDone { .. } => break,
                    _ => {}
                }
            }
            assert_eq!(batch_completions, 1, "round {round}");
            assert!(dispatcher.is_all_done().await);
        }
    }
}
