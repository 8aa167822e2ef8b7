//! bootwait store: resource mirror kept current by a list+watch task

#![forbid(unsafe_code)]

use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use bootwait_core::{EventSource, MirrorEntry, MirrorEvent, ObjectIdentity};
use futures::StreamExt;
use metrics::{counter, gauge};
use rustc_hash::FxHashMap;
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Immutable view of the mirror at one publish.
///
/// `synced` is false until the first full list has been applied, and again
/// from the moment a watch breaks until the next relist lands.
#[derive(Debug, Clone, Default)]
pub struct MirrorSnapshot {
    pub epoch: u64,
    pub synced: bool,
    /// Ordered by creation time, then identity.
    pub entries: Vec<MirrorEntry>,
}

impl MirrorSnapshot {
    pub fn get(&self, id: &ObjectIdentity) -> Option<&MirrorEntry> {
        self.entries.iter().find(|e| &e.identity == id)
    }

    pub fn len(&self) -> usize { self.entries.len() }
    pub fn is_empty(&self) -> bool { self.entries.is_empty() }
}

/// Applies mirror events to an identity-keyed map and freezes snapshots.
pub struct MirrorBuilder {
    epoch: u64,
    synced: bool,
    items: FxHashMap<ObjectIdentity, MirrorEntry>,
}

impl Default for MirrorBuilder {
    fn default() -> Self { Self::new() }
}

impl MirrorBuilder {
    pub fn new() -> Self { Self { epoch: 0, synced: false, items: FxHashMap::default() } }

    pub fn apply(&mut self, ev: MirrorEvent) {
        match ev {
            MirrorEvent::Applied(e) => {
                self.items.insert(e.identity.clone(), e);
            }
            MirrorEvent::Deleted(id) => {
                self.items.remove(&id);
            }
            MirrorEvent::Restarted(list) => {
                self.items.clear();
                for e in list {
                    self.items.insert(e.identity.clone(), e);
                }
                self.synced = true;
            }
        }
        self.epoch = self.epoch.saturating_add(1);
    }

    /// Data is kept; only the freshness flag drops until the next relist.
    pub fn mark_unsynced(&mut self) {
        self.synced = false;
        self.epoch = self.epoch.saturating_add(1);
    }

    pub fn freeze(&self) -> Arc<MirrorSnapshot> {
        let mut entries: Vec<MirrorEntry> = self.items.values().cloned().collect();
        entries.sort_by(|a, b| a.creation_ts.cmp(&b.creation_ts).then_with(|| a.identity.cmp(&b.identity)));
        Arc::new(MirrorSnapshot { epoch: self.epoch, synced: self.synced, entries })
    }
}

#[derive(Debug, Clone)]
pub struct MirrorOptions {
    /// Close and reopen list+watch this often even when healthy. `None` disables.
    pub relist_interval: Option<Duration>,
    pub backoff_initial: Duration,
    pub backoff_max: Duration,
}

impl Default for MirrorOptions {
    fn default() -> Self {
        Self {
            relist_interval: Some(Duration::from_secs(30 * 60)),
            backoff_initial: Duration::from_millis(500),
            backoff_max: Duration::from_secs(30),
        }
    }
}

/// Cheap, cloneable read access to the current snapshot.
#[derive(Clone)]
pub struct MirrorReader {
    snap: Arc<ArcSwap<MirrorSnapshot>>,
    epoch_rx: watch::Receiver<u64>,
}

impl MirrorReader {
    pub fn snapshot(&self) -> Arc<MirrorSnapshot> { self.snap.load_full() }
    pub fn subscribe_epoch(&self) -> watch::Receiver<u64> { self.epoch_rx.clone() }
}

/// Owns the background list+watch task. Dropping the handle stops it.
pub struct MirrorHandle {
    reader: MirrorReader,
    stop_tx: Option<oneshot::Sender<()>>,
    task: Option<JoinHandle<()>>,
}

impl MirrorHandle {
    pub fn reader(&self) -> MirrorReader { self.reader.clone() }
    pub fn snapshot(&self) -> Arc<MirrorSnapshot> { self.reader.snapshot() }
    pub fn subscribe_epoch(&self) -> watch::Receiver<u64> { self.reader.subscribe_epoch() }

    /// Signal the task to stop and release its connection.
    pub fn stop(&mut self) {
        if let Some(tx) = self.stop_tx.take() {
            let _ = tx.send(());
        }
    }

    /// Stop and wait for the task to exit.
    pub async fn shutdown(mut self) {
        self.stop();
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
    }
}

impl Drop for MirrorHandle {
    fn drop(&mut self) { self.stop(); }
}

enum Outcome {
    Stopped,
    Resync,
    Broken(String),
}

fn publish(builder: &MirrorBuilder, snap: &ArcSwap<MirrorSnapshot>, epoch_tx: &watch::Sender<u64>) {
    let next = builder.freeze();
    let epoch = next.epoch;
    gauge!("bootwait_mirror_entries", next.len() as f64);
    snap.store(next);
    let _ = epoch_tx.send(epoch);
}

/// Spawn the list+watch loop for `source` and return a handle for reads and shutdown.
pub fn spawn(source: Arc<dyn EventSource>, opts: MirrorOptions) -> MirrorHandle {
    let snap = Arc::new(ArcSwap::from_pointee(MirrorSnapshot::default()));
    let (epoch_tx, epoch_rx) = watch::channel(0u64);
    let (stop_tx, stop_rx) = oneshot::channel::<()>();
    let snap_clone = Arc::clone(&snap);
    let task = tokio::spawn(run(source, opts, snap_clone, epoch_tx, stop_rx));
    MirrorHandle { reader: MirrorReader { snap, epoch_rx }, stop_tx: Some(stop_tx), task: Some(task) }
}

async fn run(
    source: Arc<dyn EventSource>,
    opts: MirrorOptions,
    snap: Arc<ArcSwap<MirrorSnapshot>>,
    epoch_tx: watch::Sender<u64>,
    mut stop_rx: oneshot::Receiver<()>,
) {
    let mut builder = MirrorBuilder::new();
    let mut backoff = opts.backoff_initial;
    info!("mirror started");
    loop {
        let mut stream = source.open();
        let resync = tokio::time::sleep(opts.relist_interval.unwrap_or(Duration::MAX));
        tokio::pin!(resync);
        let outcome = loop {
            tokio::select! {
                _ = &mut stop_rx => break Outcome::Stopped,
                _ = &mut resync => break Outcome::Resync,
                item = stream.next() => match item {
                    Some(Ok(ev)) => {
                        let relisted = matches!(ev, MirrorEvent::Restarted(_));
                        builder.apply(ev);
                        publish(&builder, &snap, &epoch_tx);
                        counter!("bootwait_watch_events_total", 1);
                        if relisted {
                            debug!(epoch = builder.epoch, "mirror relisted");
                            backoff = opts.backoff_initial;
                        }
                    }
                    Some(Err(e)) => break Outcome::Broken(e.to_string()),
                    None => break Outcome::Broken("stream ended".to_string()),
                },
            }
        };
        drop(stream);
        match outcome {
            Outcome::Stopped => break,
            Outcome::Resync => {
                debug!("periodic resync; reopening list+watch");
            }
            Outcome::Broken(reason) => {
                warn!(error = %reason, backoff_ms = %backoff.as_millis(), "watch broken; relisting after backoff");
                counter!("bootwait_watch_restarts_total", 1);
                builder.mark_unsynced();
                publish(&builder, &snap, &epoch_tx);
                tokio::select! {
                    _ = &mut stop_rx => break,
                    _ = tokio::time::sleep(backoff) => {}
                }
                backoff = (backoff * 2).min(opts.backoff_max);
            }
        }
    }
    info!("mirror stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use bootwait_core::Phase;

    fn entry(name: &str, phase: Phase, ts: i64) -> MirrorEntry {
        MirrorEntry { identity: ObjectIdentity::new("kube-system", name), phase, creation_ts: ts, raw: serde_json::Value::Null }
    }

    #[test]
    fn relist_replaces_and_marks_synced() {
        let mut b = MirrorBuilder::new();
        b.apply(MirrorEvent::Applied(entry("stale-1", Phase::Running, 1)));
        assert!(!b.freeze().synced);

        b.apply(MirrorEvent::Restarted(vec![entry("etcd-1", Phase::Pending, 5)]));
        let s = b.freeze();
        assert!(s.synced);
        assert_eq!(s.epoch, 2);
        assert_eq!(s.len(), 1);
        assert!(s.get(&ObjectIdentity::new("kube-system", "stale-1")).is_none());
    }

    #[test]
    fn entries_ordered_by_creation_then_name() {
        let mut b = MirrorBuilder::new();
        b.apply(MirrorEvent::Restarted(vec![
            entry("b", Phase::Running, 10),
            entry("c", Phase::Running, 5),
            entry("a", Phase::Running, 10),
        ]));
        let names: Vec<_> = b.freeze().entries.iter().map(|e| e.identity.name.clone()).collect();
        assert_eq!(names, vec!["c", "a", "b"]);
    }

    #[test]
    fn unsynced_keeps_data() {
        let mut b = MirrorBuilder::new();
        b.apply(MirrorEvent::Restarted(vec![entry("etcd-1", Phase::Running, 1)]));
        b.mark_unsynced();
        let s = b.freeze();
        assert!(!s.synced);
        assert_eq!(s.len(), 1);
    }
}
