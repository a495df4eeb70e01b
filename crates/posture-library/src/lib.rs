//! `posture-library` – the named posture store
//!
//! Holds the pre-recorded joint trajectories that the dispatcher resolves by
//! `(group, posture)` name.
//!
//! # Modules
//!
//! - [`store`] – [`PostureLibrary`][store::PostureLibrary]: YAML-backed
//!   posture store implementing
//!   [`TrajectoryResolver`][posture_types::TrajectoryResolver], with file
//!   merging ([`MergeStrategy`][store::MergeStrategy]) and listing.

pub mod store;

pub use store::{GroupPostures, LibraryError, MergeStrategy, PostureLibrary};
