//! Core types for the watch engine.
//!
//! This module provides the data model shared by every stage of the pipeline:
//! - [`WatchedResource`]: a configured target with its limits and sink
//! - [`Sample`]: one point-in-time observation of a resource
//! - [`Verdict`]: the evaluation of a sample against limits
//! - [`Severity`]: the ordered condition levels
//! - [`AlertState`]: the per-resource state tracked between polls

use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::SourceError;
use crate::logging::LoggingSettings;
use crate::quantity::{format_cpu, format_memory};

/// Hard-fail multiplier used when a resource does not configure one.
///
/// Usage above the limit but at most twice the limit is a warning; anything
/// beyond is critical.
pub const DEFAULT_HARD_FAIL_MULTIPLIER: f64 = 2.0;

/// Poll interval used when a resource does not configure one.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(30);

/// The condition level of a resource.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    /// Everything within limits.
    #[default]
    Ok,
    /// A limit is exceeded, but within the hard-fail margin.
    Warning,
    /// Unhealthy status or a limit exceeded beyond the hard-fail margin.
    Critical,
    /// The resource could not be sampled.
    Error,
}

impl Severity {
    /// Returns the severity as a string.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Ok => "ok",
            Self::Warning => "warning",
            Self::Critical => "critical",
            Self::Error => "error",
        }
    }

    /// Returns the rank of this severity (higher = worse).
    #[must_use]
    pub const fn rank(&self) -> u8 {
        match self {
            Self::Ok => 0,
            Self::Warning => 1,
            Self::Critical => 2,
            Self::Error => 3,
        }
    }

    /// Returns true for [`Severity::Ok`].
    #[must_use]
    pub const fn is_ok(&self) -> bool {
        matches!(self, Self::Ok)
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The kind of workload being watched.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResourceKind {
    /// A pod, addressed by name or label selector.
    Pod,
    /// A deployment, addressed by name.
    Deployment,
    /// A persistent volume claim, addressed by name.
    Pvc,
}

impl ResourceKind {
    /// Returns the kind as a string.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Pod => "pod",
            Self::Deployment => "deployment",
            Self::Pvc => "pvc",
        }
    }

    /// Returns true if CPU/memory usage can be sampled for this kind.
    #[must_use]
    pub const fn has_usage(&self) -> bool {
        matches!(self, Self::Pod | Self::Deployment)
    }
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How a resource is located within its namespace.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Selector {
    /// An exact object name.
    Name(String),
    /// A label selector such as `app=api,tier=web`.
    Labels(String),
}

impl fmt::Display for Selector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Name(name) => f.write_str(name),
            Self::Labels(labels) => write!(f, "[{labels}]"),
        }
    }
}

/// Identity of a watched resource.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ResourceRef {
    /// The workload kind.
    pub kind: ResourceKind,
    /// The namespace it lives in.
    pub namespace: String,
    /// Name or label selector.
    pub selector: Selector,
}

impl ResourceRef {
    /// References a named object.
    #[must_use]
    pub fn named(
        kind: ResourceKind,
        namespace: impl Into<String>,
        name: impl Into<String>,
    ) -> Self {
        Self {
            kind,
            namespace: namespace.into(),
            selector: Selector::Name(name.into()),
        }
    }

    /// References the objects matching a label selector.
    #[must_use]
    pub fn labelled(
        kind: ResourceKind,
        namespace: impl Into<String>,
        labels: impl Into<String>,
    ) -> Self {
        Self {
            kind,
            namespace: namespace.into(),
            selector: Selector::Labels(labels.into()),
        }
    }
}

impl fmt::Display for ResourceRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}/{}", self.kind, self.namespace, self.selector)
    }
}

/// Usage ceilings for a resource.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ResourceLimits {
    /// Memory ceiling in bytes.
    pub memory_bytes: Option<u64>,
    /// CPU ceiling in millicores.
    pub cpu_millicores: Option<u64>,
    /// Usage above `limit * hard_fail_multiplier` is critical.
    pub hard_fail_multiplier: f64,
}

impl Default for ResourceLimits {
    fn default() -> Self {
        Self {
            memory_bytes: None,
            cpu_millicores: None,
            hard_fail_multiplier: DEFAULT_HARD_FAIL_MULTIPLIER,
        }
    }
}

impl ResourceLimits {
    /// Returns true if any usage ceiling is configured.
    #[must_use]
    pub const fn has_usage_limits(&self) -> bool {
        self.memory_bytes.is_some() || self.cpu_millicores.is_some()
    }
}

/// A configured watch target. Immutable once loaded.
#[derive(Debug, Clone, PartialEq)]
pub struct WatchedResource {
    /// What to watch.
    pub target: ResourceRef,
    /// How often to poll.
    pub interval: Duration,
    /// Diagnostic logging for this resource.
    pub logging: LoggingSettings,
    /// Usage ceilings.
    pub limits: ResourceLimits,
    /// Webhook URL notifications are posted to.
    pub webhook_url: String,
}

impl WatchedResource {
    /// Creates a watched resource with default interval, logging and no limits.
    #[must_use]
    pub fn new(target: ResourceRef, webhook_url: impl Into<String>) -> Self {
        Self {
            target,
            interval: DEFAULT_POLL_INTERVAL,
            logging: LoggingSettings::default(),
            limits: ResourceLimits::default(),
            webhook_url: webhook_url.into(),
        }
    }

    /// Sets the poll interval.
    #[must_use]
    pub const fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    /// Sets the memory ceiling in bytes.
    #[must_use]
    pub const fn with_memory_limit(mut self, bytes: u64) -> Self {
        self.limits.memory_bytes = Some(bytes);
        self
    }

    /// Sets the CPU ceiling in millicores.
    #[must_use]
    pub const fn with_cpu_limit(mut self, millicores: u64) -> Self {
        self.limits.cpu_millicores = Some(millicores);
        self
    }

    /// Sets the hard-fail multiplier.
    #[must_use]
    pub const fn with_hard_fail_multiplier(mut self, multiplier: f64) -> Self {
        self.limits.hard_fail_multiplier = multiplier;
        self
    }

    /// Sets the logging settings.
    #[must_use]
    pub const fn with_logging(mut self, logging: LoggingSettings) -> Self {
        self.logging = logging;
        self
    }

    /// Returns true if polls should also fetch CPU/memory usage.
    #[must_use]
    pub const fn wants_usage(&self) -> bool {
        self.target.kind.has_usage() && self.limits.has_usage_limits()
    }
}

/// Observed lifecycle status of a resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResourceStatus {
    /// Running and ready (pods), fully available (deployments) or bound (PVCs).
    Running,
    /// Starting up, rolling out or waiting to bind.
    Pending,
    /// Completed successfully.
    Succeeded,
    /// Failed, crash-looping, unavailable or lost.
    Failed,
    /// No object matches the selector.
    Missing,
    /// The API reported a status that could not be interpreted.
    Unknown,
}

impl ResourceStatus {
    /// Returns the status as a string.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Pending => "pending",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
            Self::Missing => "missing",
            Self::Unknown => "unknown",
        }
    }

    /// Returns true if this status is a breach regardless of usage.
    #[must_use]
    pub const fn is_unhealthy(&self) -> bool {
        matches!(self, Self::Failed | Self::Missing | Self::Unknown)
    }
}

impl fmt::Display for ResourceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// CPU and memory consumption at sample time.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceUsage {
    /// CPU usage in millicores.
    pub cpu_millicores: u64,
    /// Memory usage in bytes.
    pub memory_bytes: u64,
}

impl ResourceUsage {
    /// Creates a usage reading.
    #[must_use]
    pub const fn new(cpu_millicores: u64, memory_bytes: u64) -> Self {
        Self {
            cpu_millicores,
            memory_bytes,
        }
    }

    /// Adds two readings, clamping each total at `u64::MAX`.
    #[must_use]
    pub const fn saturating_add(self, other: Self) -> Self {
        Self {
            cpu_millicores: self.cpu_millicores.saturating_add(other.cpu_millicores),
            memory_bytes: self.memory_bytes.saturating_add(other.memory_bytes),
        }
    }
}

/// What a poll produced.
#[derive(Debug, Clone, PartialEq)]
pub enum Observation {
    /// The source answered.
    Observed {
        /// Lifecycle status.
        status: ResourceStatus,
        /// Usage, when it was requested and available.
        usage: Option<ResourceUsage>,
    },
    /// The source could not be queried.
    Unavailable(SourceError),
}

/// A point-in-time observation of one resource.
#[derive(Debug, Clone, PartialEq)]
pub struct Sample {
    /// When the poll started.
    pub timestamp: DateTime<Utc>,
    /// What was observed.
    pub observation: Observation,
}

impl Sample {
    /// Creates a sample from a successful poll.
    #[must_use]
    pub const fn observed(
        timestamp: DateTime<Utc>,
        status: ResourceStatus,
        usage: Option<ResourceUsage>,
    ) -> Self {
        Self {
            timestamp,
            observation: Observation::Observed { status, usage },
        }
    }

    /// Creates a sample standing in for a failed poll.
    #[must_use]
    pub const fn unavailable(timestamp: DateTime<Utc>, error: SourceError) -> Self {
        Self {
            timestamp,
            observation: Observation::Unavailable(error),
        }
    }

    /// Returns the observed status, if the poll succeeded.
    #[must_use]
    pub const fn status(&self) -> Option<ResourceStatus> {
        match &self.observation {
            Observation::Observed { status, .. } => Some(*status),
            Observation::Unavailable(_) => None,
        }
    }

    /// Returns the observed usage, if any.
    #[must_use]
    pub const fn usage(&self) -> Option<ResourceUsage> {
        match &self.observation {
            Observation::Observed { usage, .. } => *usage,
            Observation::Unavailable(_) => None,
        }
    }
}

/// The dimension a verdict is about.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Dimension {
    /// Lifecycle status.
    Status,
    /// Memory usage.
    Memory,
    /// CPU usage.
    Cpu,
    /// The sample itself could not be obtained.
    Source,
}

impl Dimension {
    /// Tie-break priority between dimensions of equal severity (higher wins).
    #[must_use]
    pub const fn priority(&self) -> u8 {
        match self {
            Self::Source => 4,
            Self::Status => 3,
            Self::Memory => 2,
            Self::Cpu => 1,
        }
    }

    /// Returns the dimension as a string.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Status => "status",
            Self::Memory => "memory",
            Self::Cpu => "cpu",
            Self::Source => "source",
        }
    }
}

impl fmt::Display for Dimension {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The measurement that breached a limit.
#[derive(Debug, Clone, PartialEq)]
pub enum Breach {
    /// Unhealthy lifecycle status.
    Status(ResourceStatus),
    /// Memory above its ceiling.
    Memory {
        /// Observed bytes.
        used_bytes: u64,
        /// Configured ceiling.
        limit_bytes: u64,
    },
    /// CPU above its ceiling.
    Cpu {
        /// Observed millicores.
        used_millicores: u64,
        /// Configured ceiling.
        limit_millicores: u64,
    },
    /// The source could not be queried.
    Unavailable(SourceError),
}

impl Breach {
    /// Returns the dimension of this breach.
    #[must_use]
    pub const fn dimension(&self) -> Dimension {
        match self {
            Self::Status(_) => Dimension::Status,
            Self::Memory { .. } => Dimension::Memory,
            Self::Cpu { .. } => Dimension::Cpu,
            Self::Unavailable(_) => Dimension::Source,
        }
    }
}

impl fmt::Display for Breach {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Status(status) => write!(f, "status is {status}"),
            Self::Memory {
                used_bytes,
                limit_bytes,
            } => write!(
                f,
                "memory {} exceeds limit {}",
                format_memory(*used_bytes),
                format_memory(*limit_bytes)
            ),
            Self::Cpu {
                used_millicores,
                limit_millicores,
            } => write!(
                f,
                "cpu {} exceeds limit {}",
                format_cpu(*used_millicores),
                format_cpu(*limit_millicores)
            ),
            Self::Unavailable(err) => write!(f, "sample unavailable: {err}"),
        }
    }
}

/// The outcome of evaluating one sample.
#[derive(Debug, Clone, PartialEq)]
pub struct Verdict {
    /// Resulting severity.
    pub severity: Severity,
    /// The breach that decided the severity; `None` when ok.
    pub breach: Option<Breach>,
}

impl Verdict {
    /// A verdict with nothing breached.
    #[must_use]
    pub const fn ok() -> Self {
        Self {
            severity: Severity::Ok,
            breach: None,
        }
    }

    /// A verdict caused by `breach`.
    #[must_use]
    pub const fn breached(severity: Severity, breach: Breach) -> Self {
        Self {
            severity,
            breach: Some(breach),
        }
    }

    /// Returns the breached dimension, if any.
    #[must_use]
    pub fn dimension(&self) -> Option<Dimension> {
        self.breach.as_ref().map(Breach::dimension)
    }
}

/// Alert state of one resource between polls.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AlertState {
    /// Current severity.
    pub severity: Severity,
    /// When the current severity was entered.
    pub entered_at: DateTime<Utc>,
    /// Consecutive polls observed at the current severity.
    pub consecutive: u64,
}

impl AlertState {
    /// The optimistic starting state.
    #[must_use]
    pub const fn initial(now: DateTime<Utc>) -> Self {
        Self {
            severity: Severity::Ok,
            entered_at: now,
            consecutive: 0,
        }
    }
}
