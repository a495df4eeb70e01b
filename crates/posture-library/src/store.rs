//! YAML-backed posture store.
//!
//! Postures are grouped per actuator group.  Each group declares its joint
//! order once and then any number of named postures, each a list of
//! waypoints:
//!
//! ```yaml
//! left_arm:
//!   joint_names: [left_arm_j0, left_arm_j1]
//!   postures:
//!     rest:
//!       - { positions: [0.0, 0.0], time_from_start: 2.0 }
//!     wave:
//!       - { positions: [1.2, 0.3], time_from_start: 1.0 }
//!       - { positions: [1.2, -0.3], time_from_start: 2.0 }
//! ```
//!
//! Several files can be merged into one library with
//! [`PostureLibrary::append`].
//!
//! # Example
//!
//! ```rust
//! use posture_library::PostureLibrary;
//! use posture_types::TrajectoryResolver;
//!
//! let lib = PostureLibrary::from_yaml_str(
//!     "head:\n  joint_names: [pan]\n  postures:\n    nod:\n      - { positions: [0.2], time_from_start: 1.0 }\n",
//! )
//! .unwrap();
//!
//! assert!(lib.resolve("head", "nod").is_some());
//! assert!(lib.resolve("head", "shake").is_none());
//! ```

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use posture_types::{Trajectory, TrajectoryResolver, Waypoint};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info};

// ─────────────────────────────────────────────────────────────────────────────
// Error type
// ─────────────────────────────────────────────────────────────────────────────

/// Errors that can arise while loading, merging or saving postures.
#[derive(Error, Debug)]
pub enum LibraryError {
    #[error("Failed to access posture file {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("Invalid posture YAML: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("Malformed posture data: {0}")]
    Malformed(String),
}

// ─────────────────────────────────────────────────────────────────────────────
// Data model
// ─────────────────────────────────────────────────────────────────────────────

/// All postures of one actuator group.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GroupPostures {
    /// Joint order shared by every waypoint of the group.
    pub joint_names: Vec<String>,
    /// Waypoints per posture name.
    #[serde(default)]
    pub postures: BTreeMap<String, Vec<Waypoint>>,
}

impl GroupPostures {
    fn validate(&self, group: &str) -> Result<(), LibraryError> {
        for (posture, points) in &self.postures {
            for (i, point) in points.iter().enumerate() {
                if point.positions.len() != self.joint_names.len() {
                    return Err(LibraryError::Malformed(format!(
                        "{group}/{posture} waypoint {i} has {} positions for {} joints",
                        point.positions.len(),
                        self.joint_names.len()
                    )));
                }
            }
        }
        Ok(())
    }
}

/// How [`PostureLibrary::merge`] treats a posture that already exists.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MergeStrategy {
    /// Existing postures win; incoming duplicates are dropped.
    #[default]
    Keep,
    /// Incoming postures replace existing ones.
    Overwrite,
}

// ─────────────────────────────────────────────────────────────────────────────
// PostureLibrary
// ─────────────────────────────────────────────────────────────────────────────

/// In-memory posture store, loadable from and savable to YAML.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PostureLibrary {
    groups: BTreeMap<String, GroupPostures>,
}

impl PostureLibrary {
    /// Create an empty library.
    pub fn new() -> Self {
        Self::default()
    }

    /// Load a library from a YAML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, LibraryError> {
        let path = path.as_ref();
        let raw = fs::read_to_string(path).map_err(|source| LibraryError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let lib = Self::from_yaml_str(&raw)?;
        info!(
            path = %path.display(),
            groups = lib.groups.len(),
            "posture library loaded"
        );
        Ok(lib)
    }

    /// Parse a library from YAML text.
    pub fn from_yaml_str(raw: &str) -> Result<Self, LibraryError> {
        let groups: BTreeMap<String, GroupPostures> = serde_yaml::from_str(raw)?;
        for (group, postures) in &groups {
            postures.validate(group)?;
        }
        Ok(Self { groups })
    }

    /// Merge the postures of the YAML file at `path` into this library.
    ///
    /// Returns the number of postures added or replaced.
    pub fn append(
        &mut self,
        path: impl AsRef<Path>,
        strategy: MergeStrategy,
    ) -> Result<usize, LibraryError> {
        let other = Self::load(path)?;
        self.merge(other, strategy)
    }

    /// Merge `other` into this library.
    ///
    /// Returns the number of postures added or replaced.
    ///
    /// # Errors
    ///
    /// Returns [`LibraryError::Malformed`] when a group exists in both
    /// libraries with a different joint order.  Nothing is merged in that
    /// case.
    pub fn merge(&mut self, other: PostureLibrary, strategy: MergeStrategy) -> Result<usize, LibraryError> {
        for (group, incoming) in &other.groups {
            if let Some(existing) = self.groups.get(group)
                && existing.joint_names != incoming.joint_names
            {
                return Err(LibraryError::Malformed(format!(
                    "group '{group}' joint order differs between libraries"
                )));
            }
        }

        let mut changed = 0;
        for (group, incoming) in other.groups {
            let existing = self.groups.entry(group.clone()).or_insert_with(|| GroupPostures {
                joint_names: incoming.joint_names.clone(),
                postures: BTreeMap::new(),
            });
            for (posture, points) in incoming.postures {
                let present = existing.postures.contains_key(&posture);
                match (present, strategy) {
                    (true, MergeStrategy::Keep) => {
                        debug!(group = %group, posture = %posture, "keeping existing posture");
                    }
                    _ => {
                        existing.postures.insert(posture, points);
                        changed += 1;
                    }
                }
            }
        }
        Ok(changed)
    }

    /// Serialise the library to YAML.
    pub fn to_yaml_string(&self) -> Result<String, LibraryError> {
        Ok(serde_yaml::to_string(&self.groups)?)
    }

    /// Write the library to `path` as YAML.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), LibraryError> {
        let path = path.as_ref();
        let raw = self.to_yaml_string()?;
        fs::write(path, raw).map_err(|source| LibraryError::Io {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Names of all groups in the library.
    pub fn groups(&self) -> impl Iterator<Item = &str> {
        self.groups.keys().map(String::as_str)
    }

    /// Total number of postures across all groups.
    pub fn len(&self) -> usize {
        self.groups.values().map(|g| g.postures.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl TrajectoryResolver for PostureLibrary {
    fn resolve(&self, group: &str, posture: &str) -> Option<Trajectory> {
        let entry = self.groups.get(group)?;
        let points = entry.postures.get(posture)?;
        Some(Trajectory {
            joint_names: entry.joint_names.clone(),
            points: points.clone(),
        })
    }

    fn list_postures(&self, group: Option<&str>) -> BTreeMap<String, Vec<String>> {
        self.groups
            .iter()
            .filter(|(name, _)| group.is_none_or(|g| g == name.as_str()))
            .map(|(name, entry)| (name.clone(), entry.postures.keys().cloned().collect()))
            .collect()
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
