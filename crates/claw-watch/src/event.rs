//! Alert transition events and their chat rendering.

use std::fmt::Write as _;

use chrono::SecondsFormat;
use uuid::Uuid;

use crate::quantity::{format_cpu, format_memory};
use crate::types::{Observation, ResourceRef, Sample, Severity, Verdict};

/// A change of a resource's severity between two consecutive evaluations.
///
/// Created by the tracker, consumed exactly once by the dispatcher.
#[derive(Debug, Clone, PartialEq)]
pub struct NotificationEvent {
    /// Unique identifier for this event.
    pub id: Uuid,
    /// The resource the event is about.
    pub resource: ResourceRef,
    /// Position of this event in the resource's event stream, starting at 1.
    pub sequence: u64,
    /// Severity before the transition.
    pub previous: Severity,
    /// Severity after the transition.
    pub current: Severity,
    /// The sample that caused the transition.
    pub sample: Sample,
    /// The verdict that caused the transition.
    pub verdict: Verdict,
    /// Human-readable chat message.
    pub message: String,
}

impl NotificationEvent {
    /// Creates an event and renders its message.
    #[must_use]
    pub fn new(
        resource: ResourceRef,
        sequence: u64,
        previous: Severity,
        sample: Sample,
        verdict: Verdict,
    ) -> Self {
        let current = verdict.severity;
        let message = render_message(&resource, previous, current, &sample, &verdict);
        Self {
            id: Uuid::new_v4(),
            resource,
            sequence,
            previous,
            current,
            sample,
            verdict,
            message,
        }
    }

    /// Returns true if this event reports a return to `ok`.
    #[must_use]
    pub const fn is_recovery(&self) -> bool {
        self.current.is_ok()
    }

    /// Returns true if this event enters `critical`.
    #[must_use]
    pub fn is_escalation_to_critical(&self) -> bool {
        self.current == Severity::Critical && self.previous != Severity::Critical
    }
}

/// Short tag shown in front of every message.
#[must_use]
pub const fn headline(current: Severity) -> &'static str {
    match current {
        Severity::Ok => "[RESOLVED]",
        Severity::Warning => "[WARNING]",
        Severity::Critical => "[CRITICAL]",
        Severity::Error => "[ERROR]",
    }
}

/// Renders the chat message for a transition.
///
/// Format: `<headline> <resource>: <from> → <to> (<detail>) at <rfc3339>`.
#[must_use]
pub fn render_message(
    resource: &ResourceRef,
    previous: Severity,
    current: Severity,
    sample: &Sample,
    verdict: &Verdict,
) -> String {
    let mut message = format!("{} {resource}: {previous} → {current}", headline(current));
    let detail = match &verdict.breach {
        Some(breach) => breach.to_string(),
        None => describe_healthy(sample),
    };
    if !detail.is_empty() {
        let _ = write!(message, " ({detail})");
    }
    let _ = write!(
        message,
        " at {}",
        sample.timestamp.to_rfc3339_opts(SecondsFormat::Secs, true)
    );
    message
}

fn describe_healthy(sample: &Sample) -> String {
    match &sample.observation {
        Observation::Observed { status, usage } => {
            let mut detail = format!("status {status}");
            if let Some(usage) = usage {
                let _ = write!(
                    detail,
                    ", memory {}, cpu {}",
                    format_memory(usage.memory_bytes),
                    format_cpu(usage.cpu_millicores)
                );
            }
            detail
        }
        Observation::Unavailable(err) => err.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::SourceError;
    use crate::types::{Breach, ResourceKind, ResourceStatus, ResourceUsage};
    use chrono::{TimeZone, Utc};

    fn api() -> ResourceRef {
        ResourceRef::named(ResourceKind::Pod, "default", "api")
    }

    fn at_noon() -> chrono::DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 10, 16, 12, 0, 0).unwrap()
    }

    #[test]
    fn renders_escalation() {
        let sample = Sample::observed(
            at_noon(),
            ResourceStatus::Running,
            Some(ResourceUsage::new(100, 150 * 1024 * 1024)),
        );
        let verdict = Verdict::breached(
            Severity::Warning,
            Breach::Memory {
                used_bytes: 150 * 1024 * 1024,
                limit_bytes: 100 * 1024 * 1024,
            },
        );
        let event = NotificationEvent::new(api(), 1, Severity::Ok, sample, verdict);

        assert_eq!(
            event.message,
            "[WARNING] pod default/api: ok → warning \
             (memory 150Mi exceeds limit 100Mi) at 2026-10-16T12:00:00Z"
        );
        assert!(!event.is_recovery());
    }

    #[test]
    fn renders_recovery_with_measurement() {
        let sample = Sample::observed(
            at_noon(),
            ResourceStatus::Running,
            Some(ResourceUsage::new(250, 40 * 1024 * 1024)),
        );
        let event = NotificationEvent::new(api(), 2, Severity::Warning, sample, Verdict::ok());

        assert_eq!(
            event.message,
            "[RESOLVED] pod default/api: warning → ok \
             (status running, memory 40Mi, cpu 250m) at 2026-10-16T12:00:00Z"
        );
        assert!(event.is_recovery());
    }

    #[test]
    fn renders_source_error() {
        let err = SourceError::NotFound {
            resource: "pod default/api".to_string(),
        };
        let sample = Sample::unavailable(at_noon(), err.clone());
        let verdict = Verdict::breached(Severity::Error, Breach::Unavailable(err));
        let event = NotificationEvent::new(api(), 1, Severity::Ok, sample, verdict);

        assert!(event.message.starts_with("[ERROR] pod default/api: ok → error"));
        assert!(event.message.contains("resource not found"));
    }

    #[test]
    fn critical_escalation_detection() {
        let sample = Sample::observed(at_noon(), ResourceStatus::Failed, None);
        let verdict = Verdict::breached(Severity::Critical, Breach::Status(ResourceStatus::Failed));
        let event = NotificationEvent::new(api(), 1, Severity::Warning, sample, verdict);
        assert!(event.is_escalation_to_critical());
        assert!(event.message.contains("status is failed"));
    }
}
