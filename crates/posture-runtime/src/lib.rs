//! `posture-runtime` – posture dispatch and completion aggregation.
//!
//! # Modules
//!
//! - [`dispatcher`] – [`Dispatcher`][dispatcher::Dispatcher]: resolves a
//!   posture per group, provisions group clients on first use and sends the
//!   rescaled goals.  Also answers `is_all_done` / `has_failed` queries and
//!   offers a polling [`wait_until_done`][dispatcher::Dispatcher::wait_until_done].
//! - [`aggregator`] – [`CompletionAggregator`][aggregator::CompletionAggregator]:
//!   the single task that applies per-group completions, closes batches and
//!   chains the settle posture according to the
//!   [`ChainPolicy`][aggregator::ChainPolicy].
//! - [`batch`] – [`Batch`][batch::Batch]: per-group tickets and completion
//!   state for one logical dispatch.
//! - [`events`] – [`EventBus`][events::EventBus]: broadcast of
//!   [`DispatchEvent`][posture_types::DispatchEvent]s to any number of
//!   subscribers.
//! - [`telemetry`] – [`init_tracing`][telemetry::init_tracing]: global
//!   `tracing` subscriber with optional OTLP export.

pub mod aggregator;
pub mod batch;
pub mod dispatcher;
pub mod events;
pub mod telemetry;

pub use aggregator::{ChainPolicy, CompletionAggregator};
pub use batch::{Batch, Recorded};
pub use dispatcher::{DEFAULT_GROUPS, Dispatcher, DispatcherConfig};
pub use events::EventBus;
pub use telemetry::{TracerProviderGuard, init_tracing};
