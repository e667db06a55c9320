//! Per-resource alert state machine.
//!
//! The tracker turns a stream of verdicts into a stream of transitions. A
//! severity that repeats only bumps the consecutive counter; a severity that
//! differs from the current one (in either direction, recovery included)
//! produces exactly one [`NotificationEvent`].

use chrono::{DateTime, Utc};

use crate::event::NotificationEvent;
use crate::types::{AlertState, ResourceRef, Sample, Verdict};

/// Alert state machine for a single watched resource.
///
/// Owned by that resource's poll loop; nothing else mutates it.
#[derive(Debug, Clone)]
pub struct AlertStateTracker {
    resource: ResourceRef,
    state: AlertState,
    emitted: u64,
}

impl AlertStateTracker {
    /// Creates a tracker in the optimistic `ok` state.
    #[must_use]
    pub const fn new(resource: ResourceRef, now: DateTime<Utc>) -> Self {
        Self {
            resource,
            state: AlertState::initial(now),
            emitted: 0,
        }
    }

    /// Returns the current state.
    #[must_use]
    pub const fn state(&self) -> &AlertState {
        &self.state
    }

    /// Returns the resource this tracker follows.
    #[must_use]
    pub const fn resource(&self) -> &ResourceRef {
        &self.resource
    }

    /// Returns how many transitions have been emitted so far.
    #[must_use]
    pub const fn transitions(&self) -> u64 {
        self.emitted
    }

    /// Feeds one verdict and returns the transition it caused, if any.
    pub fn observe(&mut self, sample: Sample, verdict: Verdict) -> Option<NotificationEvent> {
        if verdict.severity == self.state.severity {
            self.state.consecutive = self.state.consecutive.saturating_add(1);
            return None;
        }

        let previous = self.state.severity;
        self.state = AlertState {
            severity: verdict.severity,
            entered_at: sample.timestamp,
            consecutive: 1,
        };
        self.emitted += 1;

        Some(NotificationEvent::new(
            self.resource.clone(),
            self.emitted,
            previous,
            sample,
            verdict,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::SourceError;
    use crate::types::{Breach, ResourceKind, ResourceStatus, Severity};
    use proptest::collection::vec;
    use proptest::prelude::*;

    fn tracker() -> AlertStateTracker {
        AlertStateTracker::new(
            ResourceRef::named(ResourceKind::Pod, "default", "api"),
            Utc::now(),
        )
    }

    fn sample() -> Sample {
        Sample::observed(Utc::now(), ResourceStatus::Running, None)
    }

    fn verdict(severity: Severity) -> Verdict {
        match severity {
            Severity::Ok => Verdict::ok(),
            Severity::Warning | Severity::Critical => Verdict::breached(
                severity,
                Breach::Memory {
                    used_bytes: 150,
                    limit_bytes: 100,
                },
            ),
            Severity::Error => Verdict::breached(
                severity,
                Breach::Unavailable(SourceError::Unavailable {
                    reason: "refused".to_string(),
                }),
            ),
        }
    }

    #[test]
    fn starts_ok_with_zero_count() {
        let t = tracker();
        assert_eq!(t.state().severity, Severity::Ok);
        assert_eq!(t.state().consecutive, 0);
    }

    #[test]
    fn repeated_ok_is_silent() {
        let mut t = tracker();
        for _ in 0..5 {
            assert!(t.observe(sample(), verdict(Severity::Ok)).is_none());
        }
        assert_eq!(t.state().consecutive, 5);
        assert_eq!(t.transitions(), 0);
    }

    #[test]
    fn escalation_emits_once_then_counts() {
        let mut t = tracker();
        let event = t.observe(sample(), verdict(Severity::Warning)).unwrap();
        assert_eq!(event.previous, Severity::Ok);
        assert_eq!(event.current, Severity::Warning);
        assert_eq!(event.sequence, 1);

        for _ in 0..3 {
            assert!(t.observe(sample(), verdict(Severity::Warning)).is_none());
        }
        assert_eq!(t.state().consecutive, 4);
    }

    #[test]
    fn recovery_is_reported() {
        let mut t = tracker();
        t.observe(sample(), verdict(Severity::Critical));
        let event = t.observe(sample(), verdict(Severity::Ok)).unwrap();
        assert_eq!(event.previous, Severity::Critical);
        assert_eq!(event.current, Severity::Ok);
        assert_eq!(event.sequence, 2);
        assert!(event.is_recovery());
    }

    #[test]
    fn error_is_an_ordinary_level() {
        let mut t = tracker();
        assert!(t.observe(sample(), verdict(Severity::Error)).is_some());
        assert!(t.observe(sample(), verdict(Severity::Error)).is_none());
        let back = t.observe(sample(), verdict(Severity::Ok)).unwrap();
        assert_eq!(back.previous, Severity::Error);
    }

    #[test]
    fn transition_resets_entered_time() {
        let mut t = tracker();
        let s = sample();
        let ts = s.timestamp;
        t.observe(s, verdict(Severity::Warning));
        assert_eq!(t.state().entered_at, ts);
        assert_eq!(t.state().consecutive, 1);
    }

    fn severity_strategy() -> impl Strategy<Value = Severity> {
        prop_oneof![
            Just(Severity::Ok),
            Just(Severity::Warning),
            Just(Severity::Critical),
            Just(Severity::Error),
        ]
    }

    proptest! {
        #[test]
        fn events_match_adjacent_changes(seq in vec(severity_strategy(), 0..64)) {
            let mut t = tracker();
            let emitted = seq
                .iter()
                .filter_map(|s| t.observe(sample(), verdict(*s)))
                .count();

            let mut expected = 0;
            let mut previous = Severity::Ok;
            for s in &seq {
                if *s != previous {
                    expected += 1;
                }
                previous = *s;
            }
            prop_assert_eq!(emitted, expected);
        }

        #[test]
        fn sustained_severity_emits_exactly_one(
            severity in severity_strategy(),
            repeats in 1usize..50,
        ) {
            prop_assume!(severity != Severity::Ok);
            let mut t = tracker();
            let emitted = (0..=repeats)
                .filter_map(|_| t.observe(sample(), verdict(severity)))
                .count();
            prop_assert_eq!(emitted, 1);
        }

        #[test]
        fn events_always_carry_both_ends(seq in vec(severity_strategy(), 1..32)) {
            let mut t = tracker();
            let mut previous = Severity::Ok;
            for s in seq {
                if let Some(event) = t.observe(sample(), verdict(s)) {
                    prop_assert_eq!(event.previous, previous);
                    prop_assert_eq!(event.current, s);
                    prop_assert_ne!(event.previous, event.current);
                }
                previous = s;
            }
        }
    }
}
