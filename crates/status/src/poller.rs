//! Interval/deadline loop driving the convergence predicate.

use std::io::Write;
use std::time::Duration;

use bootwait_core::PhaseSnapshot;
use bootwait_store::MirrorReader;
use metrics::counter;
use tokio::time::Instant;
use tracing::{debug, info};

use crate::changelog::ChangeLog;
use crate::resolve::{phase_snapshot, TargetSet};
use crate::WaitError;

/// Per-tick retrieval failure; the poller absorbs it and keeps polling.
#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum RetrievalError {
    #[error("pod mirror not synced (epoch {epoch})")]
    NotSynced { epoch: u64 },
    #[error("{0}")]
    Other(String),
}

/// Where a tick gets its phases from.
pub trait PhaseSource {
    fn phases(&self, targets: &TargetSet) -> Result<PhaseSnapshot, RetrievalError>;
}

impl<F> PhaseSource for F
where
    F: Fn(&TargetSet) -> Result<PhaseSnapshot, RetrievalError>,
{
    fn phases(&self, targets: &TargetSet) -> Result<PhaseSnapshot, RetrievalError> {
        self(targets)
    }
}

/// Phases read from the resource mirror. Refuses to answer while the mirror
/// is not synced, so a missing initial list or a broken watch never shows up
/// as `DoesNotExist`.
pub struct MirrorPhases {
    reader: MirrorReader,
    namespace: String,
}

impl MirrorPhases {
    pub fn new(reader: MirrorReader, namespace: &str) -> Self {
        Self { reader, namespace: namespace.to_string() }
    }
}

impl PhaseSource for MirrorPhases {
    fn phases(&self, targets: &TargetSet) -> Result<PhaseSnapshot, RetrievalError> {
        let snap = self.reader.snapshot();
        if !snap.synced {
            return Err(RetrievalError::NotSynced { epoch: snap.epoch });
        }
        Ok(phase_snapshot(&self.namespace, targets, &snap))
    }
}

/// Shortest interval between ticks; a zero interval would spin.
pub const MIN_INTERVAL: Duration = Duration::from_millis(100);

// Stand-in deadline for timeouts too large to add to an `Instant`.
const FAR_FUTURE: Duration = Duration::from_secs(86_400 * 365 * 30);

fn saturating_add(at: Instant, d: Duration) -> Instant {
    at.checked_add(d).unwrap_or_else(|| at + FAR_FUTURE)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollState {
    Polling,
    Converged,
    TimedOut,
}

pub struct ConvergencePoller<S, W> {
    source: S,
    targets: TargetSet,
    interval: Duration,
    changelog: ChangeLog<W>,
    state: PollState,
    last: Option<PhaseSnapshot>,
    ticks: u64,
}

impl<S: PhaseSource, W: Write> ConvergencePoller<S, W> {
    /// `interval` is raised to [`MIN_INTERVAL`] when shorter.
    pub fn new(source: S, targets: TargetSet, interval: Duration, out: W) -> Self {
        Self {
            source,
            targets,
            interval: interval.max(MIN_INTERVAL),
            changelog: ChangeLog::new(out),
            state: PollState::Polling,
            last: None,
            ticks: 0,
        }
    }

    pub fn state(&self) -> PollState { self.state }
    pub fn ticks(&self) -> u64 { self.ticks }
    pub fn last(&self) -> Option<&PhaseSnapshot> { self.last.as_ref() }
    pub fn changelog(&self) -> &ChangeLog<W> { &self.changelog }
    pub fn into_output(self) -> W { self.changelog.into_output() }

    /// One evaluation: fetch phases, report changes, test convergence.
    pub fn tick(&mut self) -> bool {
        self.ticks += 1;
        counter!("bootwait_poll_ticks_total", 1);
        let phases = match self.source.phases(&self.targets) {
            Ok(p) => p,
            Err(e) => {
                counter!("bootwait_poll_errors_total", 1);
                info!(error = %e, tick = self.ticks, "error retrieving pod statuses");
                return false;
            }
        };
        self.changelog.report(&phases);
        let running = phases.all_running();
        if !running {
            debug!(tick = self.ticks, waiting = %phases, "not converged");
        }
        self.last = Some(phases);
        running
    }

    /// Poll until every target is running or `timeout` elapses.
    ///
    /// Evaluates immediately, then every interval; the last evaluation happens
    /// at the deadline.
    pub async fn run(&mut self, timeout: Duration) -> Result<PhaseSnapshot, WaitError> {
        if self.state != PollState::Polling {
            return Err(WaitError::Finished(self.state));
        }
        let start = Instant::now();
        let deadline = saturating_add(start, timeout);
        loop {
            if self.tick() {
                self.state = PollState::Converged;
                info!(ticks = self.ticks, took_ms = %start.elapsed().as_millis(), "pods converged");
                return Ok(self.last.clone().unwrap_or_default());
            }
            let now = Instant::now();
            if now >= deadline {
                self.state = PollState::TimedOut;
                return Err(WaitError::Timeout { waited: now - start, last: self.last.clone() });
            }
            tokio::time::sleep_until(saturating_add(now, self.interval).min(deadline)).await;
        }
    }
}
