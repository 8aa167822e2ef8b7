//! Logical name -> concrete pod resolution.

use bootwait_core::{MirrorEntry, Phase, PhaseSnapshot};
use bootwait_store::MirrorSnapshot;
use tracing::debug;

use crate::WaitError;

/// Ordered, de-duplicated logical names to wait on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TargetSet {
    names: Vec<String>,
}

impl TargetSet {
    pub fn new<I, S>(names: I) -> Result<Self, WaitError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut out: Vec<String> = Vec::new();
        for name in names {
            let name = name.into();
            let name = name.trim();
            if name.is_empty() {
                return Err(WaitError::InvalidTargets("empty pod name".to_string()));
            }
            if !out.iter().any(|n| n == name) {
                out.push(name.to_string());
            }
        }
        if out.is_empty() {
            return Err(WaitError::InvalidTargets("no pods to wait for".to_string()));
        }
        Ok(Self { names: out })
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.names.iter().map(String::as_str)
    }

    pub fn len(&self) -> usize { self.names.len() }
    pub fn is_empty(&self) -> bool { self.names.is_empty() }
}

/// Find the pod backing `logical` in `namespace`.
///
/// Pod names carry a generated suffix, so this is a prefix match on the
/// `namespace/name` key. When several pods match (a replacement is rolling
/// out) the last one in snapshot order wins, which is the most recently
/// created.
pub fn resolve<'a>(namespace: &str, logical: &str, snap: &'a MirrorSnapshot) -> Option<&'a MirrorEntry> {
    let prefix = format!("{namespace}/{logical}");
    let mut found: Option<&MirrorEntry> = None;
    let mut matches = 0usize;
    for e in &snap.entries {
        if e.identity.key().starts_with(&prefix) {
            found = Some(e);
            matches += 1;
        }
    }
    if matches > 1 {
        debug!(pod = %logical, matches, chosen = ?found.map(|e| e.identity.key()), "ambiguous prefix match");
    }
    found
}

/// Phase of every target; unmatched names are `DoesNotExist`.
pub fn phase_snapshot(namespace: &str, targets: &TargetSet, snap: &MirrorSnapshot) -> PhaseSnapshot {
    targets
        .iter()
        .map(|name| {
            let phase = resolve(namespace, name, snap).map(|e| e.phase).unwrap_or(Phase::DoesNotExist);
            (name, phase)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use bootwait_core::ObjectIdentity;

    fn entry(ns: &str, name: &str, phase: Phase, ts: i64) -> MirrorEntry {
        MirrorEntry { identity: ObjectIdentity::new(ns, name), phase, creation_ts: ts, raw: serde_json::Value::Null }
    }

    fn snap(entries: Vec<MirrorEntry>) -> MirrorSnapshot {
        MirrorSnapshot { epoch: 1, synced: true, entries }
    }

    #[test]
    fn empty_mirror_is_does_not_exist() {
        let targets = TargetSet::new(["scheduler"]).unwrap();
        let s = snap(vec![]);
        assert!(resolve("kube-system", "scheduler", &s).is_none());
        let phases = phase_snapshot("kube-system", &targets, &s);
        assert_eq!(phases.get("scheduler"), Some(Phase::DoesNotExist));
        assert_eq!(phases.len(), 1);
    }

    #[test]
    fn matches_generated_suffix_within_namespace() {
        let s = snap(vec![
            entry("default", "etcd-0000", Phase::Running, 1),
            entry("kube-system", "etcd-7f3a", Phase::Pending, 2),
        ]);
        let e = resolve("kube-system", "etcd", &s).expect("match");
        assert_eq!(e.identity.name, "etcd-7f3a");
    }

    #[test]
    fn last_match_wins_on_ambiguity() {
        let s = snap(vec![
            entry("kube-system", "apiserver-old1", Phase::Failed, 10),
            entry("kube-system", "apiserver-new2", Phase::Running, 20),
        ]);
        let e = resolve("kube-system", "apiserver", &s).expect("match");
        assert_eq!(e.identity.name, "apiserver-new2");
    }

    #[test]
    fn snapshot_covers_every_target_in_order() {
        let targets = TargetSet::new(["etcd", "apiserver", "scheduler"]).unwrap();
        let s = snap(vec![
            entry("kube-system", "apiserver-91bc", Phase::Running, 1),
            entry("kube-system", "etcd-7f3a", Phase::Running, 2),
        ]);
        let phases = phase_snapshot("kube-system", &targets, &s);
        let got: Vec<_> = phases.iter().collect();
        assert_eq!(
            got,
            vec![("etcd", Phase::Running), ("apiserver", Phase::Running), ("scheduler", Phase::DoesNotExist)]
        );
    }

    #[test]
    fn target_set_rejects_empty_and_dedups() {
        assert!(matches!(TargetSet::new(Vec::<String>::new()), Err(WaitError::InvalidTargets(_))));
        assert!(matches!(TargetSet::new(["etcd", " "]), Err(WaitError::InvalidTargets(_))));
        let t = TargetSet::new(["etcd", "apiserver", "etcd"]).unwrap();
        assert_eq!(t.iter().collect::<Vec<_>>(), vec!["etcd", "apiserver"]);
    }
}
