//! Status output that only speaks when something changed.

use std::io::Write;

use bootwait_core::PhaseSnapshot;
use tracing::warn;

/// True when `current` should be printed: first report, or any name's phase differs.
pub fn changed(current: &PhaseSnapshot, previous: Option<&PhaseSnapshot>) -> bool {
    previous.map_or(true, |p| p != current)
}

/// Prints one line per pod whenever the phase snapshot differs from the last one reported.
pub struct ChangeLog<W> {
    out: W,
    previous: Option<PhaseSnapshot>,
}

impl<W: Write> ChangeLog<W> {
    pub fn new(out: W) -> Self {
        Self { out, previous: None }
    }

    /// Returns whether anything was written.
    pub fn report(&mut self, current: &PhaseSnapshot) -> bool {
        let emit = changed(current, self.previous.as_ref());
        if emit {
            for (name, phase) in current.iter() {
                if let Err(e) = writeln!(self.out, "\tPod Status:{:>24}\t{}", name, phase) {
                    warn!(error = %e, "failed to write pod status");
                }
            }
            if let Err(e) = self.out.flush() {
                warn!(error = %e, "failed to flush pod status");
            }
        }
        self.previous = Some(current.clone());
        emit
    }

    pub fn previous(&self) -> Option<&PhaseSnapshot> { self.previous.as_ref() }
    pub fn output(&self) -> &W { &self.out }
    pub fn output_mut(&mut self) -> &mut W { &mut self.out }
    pub fn into_output(self) -> W { self.out }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bootwait_core::Phase;

    fn snap(pairs: &[(&str, Phase)]) -> PhaseSnapshot {
        pairs.iter().map(|(n, p)| (*n, *p)).collect()
    }

    fn lines(log: &ChangeLog<Vec<u8>>) -> Vec<String> {
        String::from_utf8_lossy(log.output()).lines().map(str::to_string).collect()
    }

    #[test]
    fn first_report_always_emits() {
        let mut log = ChangeLog::new(Vec::new());
        assert!(log.report(&snap(&[("scheduler", Phase::DoesNotExist)])));
        assert_eq!(lines(&log), vec![format!("\tPod Status:{:>24}\tDoesNotExist", "scheduler")]);
    }

    #[test]
    fn unchanged_snapshot_is_silent() {
        let mut log = ChangeLog::new(Vec::new());
        let s = snap(&[("etcd", Phase::Pending), ("apiserver", Phase::Pending)]);
        assert!(log.report(&s));
        assert!(!log.report(&s));
        // same content, different order
        assert!(!log.report(&snap(&[("apiserver", Phase::Pending), ("etcd", Phase::Pending)])));
        assert_eq!(lines(&log).len(), 2);
    }

    #[test]
    fn any_changed_value_emits_every_name() {
        let mut log = ChangeLog::new(Vec::new());
        log.report(&snap(&[("etcd", Phase::Pending), ("apiserver", Phase::Pending)]));
        assert!(log.report(&snap(&[("etcd", Phase::Running), ("apiserver", Phase::Pending)])));
        let out = lines(&log);
        assert_eq!(out.len(), 4);
        assert!(out[2].ends_with("etcd\tRunning"));
        assert!(out[3].ends_with("apiserver\tPending"));
        assert_eq!(log.previous().and_then(|p| p.get("etcd")), Some(Phase::Running));
    }

    struct FailingFlush(Vec<u8>);

    impl Write for FailingFlush {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.extend_from_slice(buf);
            Ok(buf.len())
        }
        fn flush(&mut self) -> std::io::Result<()> {
            Err(std::io::Error::new(std::io::ErrorKind::BrokenPipe, "closed"))
        }
    }

    #[test]
    fn flush_failure_does_not_stop_reporting() {
        let mut log = ChangeLog::new(FailingFlush(Vec::new()));
        assert!(log.report(&snap(&[("etcd", Phase::Pending)])));
        assert!(log.report(&snap(&[("etcd", Phase::Running)])));
        assert_eq!(String::from_utf8_lossy(&log.output().0).lines().count(), 2);
        assert_eq!(log.previous().and_then(|p| p.get("etcd")), Some(Phase::Running));
    }

    #[test]
    fn changed_is_pure() {
        let a = snap(&[("etcd", Phase::Running)]);
        let b = snap(&[("etcd", Phase::Failed)]);
        assert!(changed(&a, None));
        assert!(!changed(&a, Some(&a.clone())));
        assert!(changed(&a, Some(&b)));
    }
}
