//! `posture-hal` – group transport abstraction
//!
//! Everything the dispatcher needs to talk to an actuator group's trajectory
//! execution endpoint, without knowing which transport sits behind it.
//!
//! # Modules
//!
//! - [`client`] – [`GroupClient`][client::GroupClient] and
//!   [`ClientFactory`][client::ClientFactory]: the goal-send / goal-complete
//!   protocol of one group, and the way clients are created on demand.
//!   [`CompletionHandle`][client::CompletionHandle] is the one-shot completion
//!   callback handed to every goal.
//! - [`pool`] – [`ClientPool`][pool::ClientPool]: lazily provisions and caches
//!   one connected client per group, enforcing the connect timeout.
//! - [`sim`] – in-process simulated transport for headless runs and tests.

pub mod client;
pub mod pool;
pub mod sim;

pub use client::{ClientFactory, CompletionEvent, CompletionHandle, GroupClient};
pub use pool::{ClientPool, DEFAULT_CONNECT_TIMEOUT};
pub use sim::{SimClientFactory, SimGroupClient};
