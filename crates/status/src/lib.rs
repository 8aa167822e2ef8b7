//! bootwait status: block until a fixed set of pods is running.
//!
//! A [`bootwait_store`] mirror follows the pods through list+watch in the
//! background while a [`ConvergencePoller`] checks, on a fixed interval,
//! whether every logical pod name resolves to a `Running` pod. Status lines
//! are printed only when the observed phases change.

#![forbid(unsafe_code)]

pub mod changelog;
pub mod poller;
pub mod resolve;

use std::io::Write;
use std::sync::Arc;
use std::time::Duration;

use bootwait_core::EventSource;
use bootwait_kubehub::PodSource;
use bootwait_store::{MirrorOptions, MirrorReader};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

pub use bootwait_core::{Phase, PhaseSnapshot};
pub use changelog::{changed, ChangeLog};
pub use poller::{ConvergencePoller, MirrorPhases, PhaseSource, PollState, RetrievalError};
pub use resolve::{phase_snapshot, resolve, TargetSet};

pub const READY_MESSAGE: &str = "All self-hosted control plane components successfully started";

/// Errors that end a wait. Watch and per-tick failures never surface here.
#[derive(Debug, thiserror::Error)]
pub enum WaitError {
    #[error("connecting to the API server: {0:#}")]
    Connect(anyhow::Error),
    #[error("invalid targets: {0}")]
    InvalidTargets(String),
    #[error("timed out after {}s waiting for pods: {}", .waited.as_secs(), describe(.last))]
    Timeout { waited: Duration, last: Option<PhaseSnapshot> },
    #[error("post-convergence step failed: {0:#}")]
    FollowUp(anyhow::Error),
    #[error("poller already finished ({0:?})")]
    Finished(PollState),
}

fn describe(last: &Option<PhaseSnapshot>) -> String {
    match last {
        Some(s) => s.to_string(),
        None => "no pod status observed".to_string(),
    }
}

/// One-time action gated on convergence (e.g. migrating to self-hosted etcd).
/// Never runs after a timeout.
#[async_trait::async_trait]
pub trait PostConverge: Send + Sync {
    fn name(&self) -> &str;
    async fn run(&self) -> anyhow::Result<()>;
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct WaitConfig {
    /// Logical pod names (without generated suffix)
    pub targets: Vec<String>,
    pub namespace: String,
    /// Label selector for the list+watch, e.g. `k8s-app` (existence)
    pub label_selector: String,
    /// Explicit API server URL; inferred from kubeconfig/in-cluster when unset
    pub api_server: Option<String>,
    pub timeout: Duration,
    pub poll_interval: Duration,
    /// Periodic full relist; `None` disables
    pub relist_interval: Option<Duration>,
    pub watch_backoff_max: Duration,
}

impl Default for WaitConfig {
    fn default() -> Self {
        Self {
            targets: Vec::new(),
            namespace: "kube-system".to_string(),
            label_selector: "k8s-app".to_string(),
            api_server: None,
            timeout: Duration::from_secs(20 * 60),
            poll_interval: Duration::from_secs(5),
            relist_interval: Some(Duration::from_secs(30 * 60)),
            watch_backoff_max: Duration::from_secs(30),
        }
    }
}

impl WaitConfig {
    pub fn mirror_options(&self) -> MirrorOptions {
        MirrorOptions {
            relist_interval: self.relist_interval,
            backoff_max: self.watch_backoff_max,
            ..MirrorOptions::default()
        }
    }
}

/// Wait until every pod in `cfg.targets` is running, then run `follow_up`.
///
/// Status lines and the final ready message go to `out`.
pub async fn wait_until_pods_running<W: Write>(
    cfg: &WaitConfig,
    follow_up: Option<&dyn PostConverge>,
    out: W,
) -> Result<PhaseSnapshot, WaitError> {
    let targets = TargetSet::new(cfg.targets.iter().cloned())?;
    let client = bootwait_kubehub::connect(cfg.api_server.as_deref()).await.map_err(WaitError::Connect)?;
    let source = Arc::new(PodSource::new(client, &cfg.namespace, &cfg.label_selector));
    wait_with_source(cfg, targets, source, follow_up, out).await
}

/// Wait up to `within` for the mirror's first synced publish.
async fn settle(reader: &MirrorReader, within: Duration) -> bool {
    let mut epochs = reader.subscribe_epoch();
    let synced = async {
        while !reader.snapshot().synced {
            if epochs.changed().await.is_err() {
                return false;
            }
        }
        true
    };
    tokio::time::timeout(within, synced).await.unwrap_or(false)
}

/// Same as [`wait_until_pods_running`] against any event source and output.
pub async fn wait_with_source<W: Write>(
    cfg: &WaitConfig,
    targets: TargetSet,
    source: Arc<dyn EventSource>,
    follow_up: Option<&dyn PostConverge>,
    out: W,
) -> Result<PhaseSnapshot, WaitError> {
    info!(pods = targets.len(), ns = %cfg.namespace, selector = %cfg.label_selector, timeout_s = cfg.timeout.as_secs(), "waiting for pods");
    let start = tokio::time::Instant::now();
    let mirror = bootwait_store::spawn(source, cfg.mirror_options());
    let reader = mirror.reader();
    // first tick waits for the initial list instead of reporting it missing
    if !settle(&reader, cfg.poll_interval.min(cfg.timeout)).await {
        debug!("pod mirror not synced before first tick");
    }
    let phases = MirrorPhases::new(reader, &cfg.namespace);
    let mut poller = ConvergencePoller::new(phases, targets, cfg.poll_interval, out);
    let outcome = poller.run(cfg.timeout.saturating_sub(start.elapsed())).await;
    mirror.shutdown().await;
    let snapshot = match outcome {
        Ok(s) => s,
        Err(e) => {
            warn!(error = %e, "pods did not converge");
            return Err(e);
        }
    };

    if let Some(step) = follow_up {
        info!(step = %step.name(), "running post-convergence step");
        step.run().await.map_err(WaitError::FollowUp)?;
    }

    let mut out = poller.into_output();
    if let Err(e) = writeln!(out, "{READY_MESSAGE}") {
        warn!(error = %e, "failed to write ready message");
    }
    Ok(snapshot)
}
