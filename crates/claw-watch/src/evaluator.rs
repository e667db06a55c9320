//! Threshold evaluation.
//!
//! [`evaluate`] maps a [`Sample`] and the resource's [`ResourceLimits`] to a
//! [`Verdict`]. It is pure: no clock, no I/O, same input same output.
//!
//! Rules, in order:
//! 1. An unavailable sample is an `error` verdict.
//! 2. Each dimension is judged on its own: an unhealthy status is `critical`;
//!    usage above its limit is `warning`, and `critical` once it exceeds
//!    `limit * hard_fail_multiplier`.
//! 3. The worst dimension wins; equal severities are broken by
//!    status > memory > cpu.

use crate::types::{
    Breach, Observation, ResourceLimits, ResourceStatus, ResourceUsage, Sample, Severity, Verdict,
};

/// Evaluates a sample against limits.
#[must_use]
pub fn evaluate(sample: &Sample, limits: &ResourceLimits) -> Verdict {
    match &sample.observation {
        Observation::Unavailable(err) => {
            Verdict::breached(Severity::Error, Breach::Unavailable(err.clone()))
        }
        Observation::Observed { status, usage } => {
            let candidates = [
                status_verdict(*status),
                usage.and_then(|u| memory_verdict(u, limits)),
                usage.and_then(|u| cpu_verdict(u, limits)),
            ];
            candidates
                .into_iter()
                .flatten()
                .reduce(worse)
                .unwrap_or_else(Verdict::ok)
        }
    }
}

/// Stateless wrapper so the evaluator can be held and passed like the other stages.
#[derive(Debug, Clone, Copy, Default)]
pub struct ThresholdEvaluator;

impl ThresholdEvaluator {
    /// Evaluates a sample against limits. See [`evaluate`].
    #[must_use]
    pub fn evaluate(&self, sample: &Sample, limits: &ResourceLimits) -> Verdict {
        evaluate(sample, limits)
    }
}

fn status_verdict(status: ResourceStatus) -> Option<Verdict> {
    status
        .is_unhealthy()
        .then(|| Verdict::breached(Severity::Critical, Breach::Status(status)))
}

fn memory_verdict(usage: ResourceUsage, limits: &ResourceLimits) -> Option<Verdict> {
    let limit = limits.memory_bytes?;
    let severity = usage_severity(usage.memory_bytes, limit, limits.hard_fail_multiplier)?;
    Some(Verdict::breached(
        severity,
        Breach::Memory {
            used_bytes: usage.memory_bytes,
            limit_bytes: limit,
        },
    ))
}

fn cpu_verdict(usage: ResourceUsage, limits: &ResourceLimits) -> Option<Verdict> {
    let limit = limits.cpu_millicores?;
    let severity = usage_severity(usage.cpu_millicores, limit, limits.hard_fail_multiplier)?;
    Some(Verdict::breached(
        severity,
        Breach::Cpu {
            used_millicores: usage.cpu_millicores,
            limit_millicores: limit,
        },
    ))
}

fn usage_severity(used: u64, limit: u64, multiplier: f64) -> Option<Severity> {
    if used <= limit {
        return None;
    }
    let hard_fail = limit as f64 * multiplier.max(1.0);
    if used as f64 > hard_fail {
        Some(Severity::Critical)
    } else {
        Some(Severity::Warning)
    }
}

fn worse(a: Verdict, b: Verdict) -> Verdict {
    let key = |v: &Verdict| {
        (
            v.severity.rank(),
            v.dimension().map_or(0, |d| d.priority()),
        )
    };
    if key(&b) > key(&a) { b } else { a }
}
