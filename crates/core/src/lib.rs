//! bootwait core types: pod phases, object identities, mirror entries and the
//! event source seam the mirror is fed from.

#![forbid(unsafe_code)]

use std::fmt;

use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};

/// Lifecycle phase of a watched object.
///
/// `DoesNotExist` is never reported by the cluster; it is produced when no
/// object currently matches a logical name.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum Phase {
    Pending,
    Running,
    Succeeded,
    Failed,
    Unknown,
    DoesNotExist,
}

impl Phase {
    /// Parse `status.phase` as reported by the API server.
    pub fn from_status(phase: Option<&str>) -> Self {
        match phase {
            Some("Pending") => Phase::Pending,
            Some("Running") => Phase::Running,
            Some("Succeeded") => Phase::Succeeded,
            Some("Failed") => Phase::Failed,
            _ => Phase::Unknown,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::Pending => "Pending",
            Phase::Running => "Running",
            Phase::Succeeded => "Succeeded",
            Phase::Failed => "Failed",
            Phase::Unknown => "Unknown",
            Phase::DoesNotExist => "DoesNotExist",
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Namespaced object key. The name carries a generated suffix
/// (`<logical>-<suffix>`), so it is not stable across replacements.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectIdentity {
    pub namespace: String,
    pub name: String,
}

impl ObjectIdentity {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self { namespace: namespace.into(), name: name.into() }
    }

    /// Store key in `namespace/name` form.
    pub fn key(&self) -> String {
        format!("{}/{}", self.namespace, self.name)
    }
}

impl fmt::Display for ObjectIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MirrorEntry {
    pub identity: ObjectIdentity,
    pub phase: Phase,
    /// metadata.creationTimestamp as unix seconds (0 when absent)
    pub creation_ts: i64,
    /// Raw object (managedFields stripped)
    pub raw: serde_json::Value,
}

/// Incremental change delivered by an [`EventSource`].
#[derive(Debug, Clone, PartialEq)]
pub enum MirrorEvent {
    Applied(MirrorEntry),
    Deleted(ObjectIdentity),
    /// Full relist; replaces everything the mirror holds.
    Restarted(Vec<MirrorEntry>),
}

/// Transient failures of a list+watch subscription. The mirror absorbs these.
#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum SourceError {
    #[error("list failed: {0}")]
    List(String),
    #[error("watch failed: {0}")]
    Watch(String),
    #[error("decode: {0}")]
    Decode(String),
}

pub type EventStream = BoxStream<'static, Result<MirrorEvent, SourceError>>;

/// A list+watch subscription that can be (re)opened on demand.
///
/// Each call to `open` starts from scratch: the first successful item is
/// expected to be a `Restarted` carrying the initial list.
pub trait EventSource: Send + Sync {
    fn open(&self) -> EventStream;
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PhaseEntry {
    pub name: String,
    pub phase: Phase,
}

/// Phase of every logical name for one poll tick, in target order.
///
/// Equality ignores order: two snapshots are equal when they hold the same
/// names mapped to the same phases.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PhaseSnapshot {
    entries: Vec<PhaseEntry>,
}

impl PhaseSnapshot {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the phase for `name`, replacing an existing entry in place.
    pub fn insert(&mut self, name: impl Into<String>, phase: Phase) {
        let name = name.into();
        match self.entries.iter_mut().find(|e| e.name == name) {
            Some(e) => e.phase = phase,
            None => self.entries.push(PhaseEntry { name, phase }),
        }
    }

    pub fn get(&self, name: &str) -> Option<Phase> {
        self.entries.iter().find(|e| e.name == name).map(|e| e.phase)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, Phase)> {
        self.entries.iter().map(|e| (e.name.as_str(), e.phase))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Convergence predicate: every name is `Running`.
    pub fn all_running(&self) -> bool {
        self.entries.iter().all(|e| e.phase == Phase::Running)
    }

    /// Names whose phase is not `Running`.
    pub fn pending(&self) -> impl Iterator<Item = (&str, Phase)> {
        self.iter().filter(|(_, p)| *p != Phase::Running)
    }
}

impl PartialEq for PhaseSnapshot {
    fn eq(&self, other: &Self) -> bool {
        self.entries.len() == other.entries.len()
            && self.entries.iter().all(|e| other.get(&e.name) == Some(e.phase))
    }
}

impl Eq for PhaseSnapshot {}

impl<S: Into<String>> FromIterator<(S, Phase)> for PhaseSnapshot {
    fn from_iter<I: IntoIterator<Item = (S, Phase)>>(iter: I) -> Self {
        let mut snap = PhaseSnapshot::new();
        for (name, phase) in iter {
            snap.insert(name, phase);
        }
        snap
    }
}

impl fmt::Display for PhaseSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, e) in self.entries.iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            write!(f, "{}={}", e.name, e.phase)?;
        }
        Ok(())
    }
}

pub mod prelude {
    pub use super::{EventSource, EventStream, MirrorEntry, MirrorEvent, ObjectIdentity, Phase, PhaseSnapshot, SourceError};
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_reported_phases() {
        assert_eq!(Phase::from_status(Some("Running")), Phase::Running);
        assert_eq!(Phase::from_status(Some("Failed")), Phase::Failed);
        assert_eq!(Phase::from_status(Some("running")), Phase::Unknown);
        assert_eq!(Phase::from_status(None), Phase::Unknown);
    }

    #[test]
    fn snapshot_equality_ignores_order() {
        let a: PhaseSnapshot = [("etcd", Phase::Running), ("apiserver", Phase::Pending)].into_iter().collect();
        let b: PhaseSnapshot = [("apiserver", Phase::Pending), ("etcd", Phase::Running)].into_iter().collect();
        assert_eq!(a, b);

        let c: PhaseSnapshot = [("apiserver", Phase::Running), ("etcd", Phase::Running)].into_iter().collect();
        assert_ne!(a, c);

        let d: PhaseSnapshot = [("etcd", Phase::Running)].into_iter().collect();
        assert_ne!(a, d);
    }

    #[test]
    fn converged_only_when_every_name_running() {
        let all: PhaseSnapshot = [("etcd", Phase::Running), ("apiserver", Phase::Running)].into_iter().collect();
        assert!(all.all_running());

        for other in [Phase::Pending, Phase::Succeeded, Phase::Failed, Phase::Unknown, Phase::DoesNotExist] {
            let snap: PhaseSnapshot = [("etcd", Phase::Running), ("apiserver", other)].into_iter().collect();
            assert!(!snap.all_running(), "{other} must not count as converged");
            assert_eq!(snap.pending().map(|(n, _)| n).collect::<Vec<_>>(), vec!["apiserver"]);
        }
    }

    #[test]
    fn insert_keeps_target_order() {
        let mut snap = PhaseSnapshot::new();
        snap.insert("scheduler", Phase::Pending);
        snap.insert("etcd", Phase::Pending);
        snap.insert("scheduler", Phase::Running);
        let names: Vec<_> = snap.iter().map(|(n, _)| n).collect();
        assert_eq!(names, vec!["scheduler", "etcd"]);
        assert_eq!(snap.get("scheduler"), Some(Phase::Running));
        assert_eq!(snap.to_string(), "scheduler=Running, etcd=Pending");
    }
}
