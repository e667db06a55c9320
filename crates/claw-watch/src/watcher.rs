//! The watch engine.
//!
//! A [`Watcher`] owns the watched resources and the shared services. Starting
//! it spawns, per resource, one poll loop and one delivery worker:
//!
//! ```text
//! ResourceSource -> ThresholdEvaluator -> AlertStateTracker -> DeliveryQueue -> NotificationSink
//! ```
//!
//! Poll loops run on a fixed grid anchored at start. A cycle that overruns its
//! interval makes the next one start immediately, after which the grid resumes
//! from there; missed ticks are never replayed and a resource never has two
//! polls in flight.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::clock::{Clock, TokioClock};
use crate::dispatcher::{DeliveryQueue, DeliveryStats, Dispatcher, QueueHandle, RetryPolicy};
use crate::error::{Result, SourceError, WatchError};
use crate::evaluator::ThresholdEvaluator;
use crate::event::NotificationEvent;
use crate::logging::{LogLevel, ResourceLogger};
use crate::remediation::RemediationHook;
use crate::sink::SinkFactory;
use crate::source::ResourceSource;
use crate::tracker::AlertStateTracker;
use crate::types::{
    AlertState, ResourceRef, ResourceStatus, ResourceUsage, Sample, Severity, WatchedResource,
};

type SharedStates = Arc<RwLock<HashMap<ResourceRef, AlertState>>>;

/// Engine-wide tuning.
#[derive(Debug, Clone, PartialEq)]
pub struct WatcherConfig {
    /// Timeout for one sample acquisition, clamped per resource to 80 % of its interval.
    pub source_timeout: Duration,
    /// How long delivery workers may keep draining after shutdown.
    pub shutdown_grace: Duration,
    /// Delivery retry policy.
    pub retry: RetryPolicy,
}

impl Default for WatcherConfig {
    fn default() -> Self {
        Self {
            source_timeout: Duration::from_secs(10),
            shutdown_grace: Duration::from_secs(5),
            retry: RetryPolicy::default(),
        }
    }
}

impl WatcherConfig {
    /// Sets the source timeout.
    #[must_use]
    pub const fn with_source_timeout(mut self, timeout: Duration) -> Self {
        self.source_timeout = timeout;
        self
    }

    /// Sets the shutdown grace period.
    #[must_use]
    pub const fn with_shutdown_grace(mut self, grace: Duration) -> Self {
        self.shutdown_grace = grace;
        self
    }

    /// Sets the retry policy.
    #[must_use]
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }
}

/// Returns the source timeout used for a resource polled every `interval`.
///
/// Always strictly shorter than a non-zero interval.
#[must_use]
pub fn effective_source_timeout(configured: Duration, interval: Duration) -> Duration {
    configured.min(interval * 4 / 5)
}

/// Watches a set of resources and notifies on severity transitions.
pub struct Watcher {
    resources: Vec<WatchedResource>,
    source: Arc<dyn ResourceSource>,
    sinks: Arc<dyn SinkFactory>,
    clock: Arc<dyn Clock>,
    config: WatcherConfig,
    remediation: Option<Arc<dyn RemediationHook>>,
}

impl fmt::Debug for Watcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Watcher")
            .field("resources", &self.resources.len())
            .field("source", &self.source)
            .field("clock", &self.clock)
            .field("config", &self.config)
            .field("remediation", &self.remediation.is_some())
            .finish_non_exhaustive()
    }
}

impl Watcher {
    /// Creates a watcher with the default clock and configuration.
    #[must_use]
    pub fn new(
        resources: Vec<WatchedResource>,
        source: Arc<dyn ResourceSource>,
        sinks: Arc<dyn SinkFactory>,
    ) -> Self {
        Self {
            resources,
            source,
            sinks,
            clock: Arc::new(TokioClock::new()),
            config: WatcherConfig::default(),
            remediation: None,
        }
    }

    /// Replaces the clock.
    #[must_use]
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Replaces the engine configuration.
    #[must_use]
    pub fn with_config(mut self, config: WatcherConfig) -> Self {
        self.config = config;
        self
    }

    /// Installs a hook called on every transition into `critical`.
    #[must_use]
    pub fn with_remediation(mut self, hook: Arc<dyn RemediationHook>) -> Self {
        self.remediation = Some(hook);
        self
    }

    /// Returns the watched resources.
    #[must_use]
    pub fn resources(&self) -> &[WatchedResource] {
        &self.resources
    }

    /// Starts every poll loop and delivery worker on the current tokio runtime.
    ///
    /// All loops stop once `cancel` is cancelled.
    ///
    /// # Errors
    ///
    /// Returns `WatchError::ConfigurationInvalid` if two entries watch the same
    /// resource or an interval is zero.
    pub fn start(self, cancel: CancellationToken) -> Result<WatchHandle> {
        let Self {
            resources,
            source,
            sinks,
            clock,
            config,
            remediation,
        } = self;

        let mut seen = HashMap::new();
        for (index, resource) in resources.iter().enumerate() {
            if resource.interval.is_zero() {
                return Err(WatchError::config(format!(
                    "resources[{index}] ({}): interval must be greater than zero",
                    resource.target
                )));
            }
            if let Some(first) = seen.insert(&resource.target, index) {
                return Err(WatchError::config(format!(
                    "resources[{index}] ({}) duplicates resources[{first}]",
                    resource.target
                )));
            }
        }

        let states: SharedStates = Arc::new(RwLock::new(HashMap::new()));
        let dispatcher = Dispatcher::new(config.retry.clone(), Arc::clone(&clock), cancel.clone());
        let mut tasks = Vec::with_capacity(resources.len());

        for resource in resources {
            let target = resource.target.clone();
            let sink = sinks.sink_for(&resource);
            let queue = DeliveryQueue::spawn(target.clone(), sink, dispatcher.clone());
            let tracker = AlertStateTracker::new(target.clone(), clock.now());
            states.write().insert(target.clone(), *tracker.state());

            let source_timeout = effective_source_timeout(config.source_timeout, resource.interval);
            info!(
                resource = %target,
                interval_secs = resource.interval.as_secs_f64(),
                source_timeout_ms = u64::try_from(source_timeout.as_millis()).unwrap_or(u64::MAX),
                "watching resource"
            );

            let poll = PollLoop {
                log: ResourceLogger::new(target.to_string(), resource.logging),
                resource,
                source: Arc::clone(&source),
                clock: Arc::clone(&clock),
                evaluator: ThresholdEvaluator,
                tracker,
                queue: queue.handle(),
                states: Arc::clone(&states),
                remediation: remediation.clone(),
                source_timeout,
                cancel: cancel.clone(),
                polls: 0,
            };
            tasks.push(ResourceTask {
                resource: target,
                poll: tokio::spawn(poll.run()),
                queue,
            });
        }

        info!(resources = tasks.len(), "watcher started");
        Ok(WatchHandle {
            cancel,
            states,
            tasks,
            grace: config.shutdown_grace,
        })
    }
}

#[derive(Debug, Default, Clone, Copy)]
struct PollStats {
    polls: u64,
    transitions: u64,
}

struct PollLoop {
    resource: WatchedResource,
    source: Arc<dyn ResourceSource>,
    clock: Arc<dyn Clock>,
    evaluator: ThresholdEvaluator,
    tracker: AlertStateTracker,
    queue: QueueHandle,
    states: SharedStates,
    remediation: Option<Arc<dyn RemediationHook>>,
    log: ResourceLogger,
    source_timeout: Duration,
    cancel: CancellationToken,
    polls: u64,
}

impl PollLoop {
    async fn run(mut self) -> PollStats {
        let interval = self.resource.interval;
        let mut next = self.clock.instant();

        loop {
            tokio::select! {
                biased;
                () = self.cancel.cancelled() => break,
                () = self.clock.sleep_until(next) => {}
            }

            let sample = tokio::select! {
                biased;
                () = self.cancel.cancelled() => break,
                sample = self.acquire() => sample,
            };
            self.process(sample);

            next += interval;
            let now = self.clock.instant();
            if next < now {
                self.log.debug(format_args!(
                    "poll overran its interval by {:?}, next poll starts now",
                    now - next
                ));
                next = now;
            }
        }

        debug!(resource = %self.resource.target, polls = self.polls, "poll loop stopped");
        PollStats {
            polls: self.polls,
            transitions: self.tracker.transitions(),
        }
    }

    async fn acquire(&self) -> Sample {
        let timestamp = self.clock.now();
        let timeout = self.source_timeout;
        let fetched = tokio::time::timeout(timeout, self.fetch())
            .await
            .unwrap_or(Err(SourceError::Timeout(timeout)));

        match fetched {
            Ok((status, usage)) => Sample::observed(timestamp, status, usage),
            Err(source) => {
                let err = WatchError::SampleUnavailable {
                    resource: self.resource.target.to_string(),
                    source: source.clone(),
                };
                self.log.warn(format_args!("{err}"));
                Sample::unavailable(timestamp, source)
            }
        }
    }

    async fn fetch(
        &self,
    ) -> std::result::Result<(ResourceStatus, Option<ResourceUsage>), SourceError> {
        let target = &self.resource.target;
        let status = self.source.status(target).await?;
        if !(self.resource.wants_usage() && status == ResourceStatus::Running) {
            return Ok((status, None));
        }
        match self.source.usage(target).await {
            Ok(usage) => Ok((status, Some(usage))),
            Err(e) if e.is_metrics_not_ready() => {
                self.log.debug(format_args!("{e}, judging status only"));
                Ok((status, None))
            }
            Err(e) => Err(e),
        }
    }

    fn process(&mut self, sample: Sample) {
        self.polls += 1;
        let verdict = self.evaluator.evaluate(&sample, &self.resource.limits);
        self.log.debug(format_args!(
            "poll {} evaluated {}",
            self.polls, verdict.severity
        ));

        if let Some(event) = self.tracker.observe(sample, verdict) {
            self.log_transition(&event);
            if event.is_escalation_to_critical() {
                self.remediate(&event);
            }
            self.queue.enqueue(event);
        }

        let state = *self.tracker.state();
        self.states.write().insert(self.resource.target.clone(), state);
    }

    fn log_transition(&self, event: &NotificationEvent) {
        let level = match event.current {
            Severity::Ok => LogLevel::Info,
            Severity::Warning => LogLevel::Warn,
            Severity::Critical | Severity::Error => LogLevel::Error,
        };
        self.log.log(
            level,
            format_args!(
                "severity changed {} -> {}: {}",
                event.previous, event.current, event.message
            ),
        );
    }

    fn remediate(&self, event: &NotificationEvent) {
        let Some(hook) = &self.remediation else {
            return;
        };
        let hook = Arc::clone(hook);
        let event = event.clone();
        tokio::spawn(async move {
            if let Err(err) = hook.remediate(&event).await {
                warn!(resource = %event.resource, error = %err, "remediation hook failed");
            }
        });
    }
}

struct ResourceTask {
    resource: ResourceRef,
    poll: JoinHandle<PollStats>,
    queue: DeliveryQueue,
}

/// Handle to a running [`Watcher`].
pub struct WatchHandle {
    cancel: CancellationToken,
    states: SharedStates,
    tasks: Vec<ResourceTask>,
    grace: Duration,
}

impl fmt::Debug for WatchHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WatchHandle")
            .field("resources", &self.tasks.len())
            .field("cancelled", &self.cancel.is_cancelled())
            .field("grace", &self.grace)
            .finish_non_exhaustive()
    }
}

impl WatchHandle {
    /// Returns the current alert state of every resource.
    #[must_use]
    pub fn snapshot(&self) -> HashMap<ResourceRef, AlertState> {
        self.states.read().clone()
    }

    /// Returns the current alert state of one resource.
    #[must_use]
    pub fn state(&self, resource: &ResourceRef) -> Option<AlertState> {
        self.states.read().get(resource).copied()
    }

    /// Returns live delivery counters per resource.
    #[must_use]
    pub fn delivery_stats(&self) -> Vec<(ResourceRef, DeliveryStats)> {
        self.tasks
            .iter()
            .map(|t| (t.resource.clone(), t.queue.stats()))
            .collect()
    }

    /// Returns the token that stops this watcher.
    #[must_use]
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Cancels every loop and waits for the watcher to wind down.
    pub async fn shutdown(self) -> WatchReport {
        self.cancel.cancel();
        self.join().await
    }

    /// Waits for the watcher to wind down after its token was cancelled.
    ///
    /// Poll loops stop first. Delivery workers then get the shutdown grace
    /// period to drain, after which they are aborted.
    pub async fn join(self) -> WatchReport {
        let Self {
            states,
            tasks,
            grace,
            ..
        } = self;

        let mut stopped = Vec::with_capacity(tasks.len());
        for task in tasks {
            let stats = match task.poll.await {
                Ok(stats) => stats,
                Err(err) => {
                    error!(
                        resource = %task.resource,
                        error = %err,
                        "poll loop terminated abnormally"
                    );
                    PollStats::default()
                }
            };
            stopped.push((task.resource, stats, task.queue));
        }

        let closing = stopped.into_iter().map(|(resource, stats, queue)| {
            let final_state = states
                .read()
                .get(&resource)
                .copied()
                .unwrap_or_else(|| AlertState::initial(chrono::Utc::now()));
            async move {
                let delivery = queue.close(grace).await;
                ResourceReport {
                    resource,
                    polls: stats.polls,
                    transitions: stats.transitions,
                    final_state,
                    delivery,
                }
            }
        });
        let report = WatchReport {
            resources: futures::future::join_all(closing).await,
        };

        info!(
            resources = report.resources.len(),
            polls = report.total_polls(),
            dropped = report.total_dropped(),
            "watcher stopped"
        );
        report
    }
}

/// Per-resource summary produced at shutdown.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceReport {
    /// The resource.
    pub resource: ResourceRef,
    /// Polls completed.
    pub polls: u64,
    /// Severity transitions emitted.
    pub transitions: u64,
    /// Alert state at shutdown.
    pub final_state: AlertState,
    /// Delivery counters.
    pub delivery: DeliveryStats,
}

/// Summary of a watcher run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WatchReport {
    /// One entry per resource, in configuration order.
    pub resources: Vec<ResourceReport>,
}

impl WatchReport {
    /// Returns the entry for `resource`.
    #[must_use]
    pub fn get(&self, resource: &ResourceRef) -> Option<&ResourceReport> {
        self.resources.iter().find(|r| &r.resource == resource)
    }

    /// Total polls across resources.
    #[must_use]
    pub fn total_polls(&self) -> u64 {
        self.resources.iter().map(|r| r.polls).sum()
    }

    /// Total notifications dropped across resources.
    #[must_use]
    pub fn total_dropped(&self) -> u64 {
        self.resources.iter().map(|r| r.delivery.dropped).sum()
    }
}

impl fmt::Display for WatchReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for r in &self.resources {
            writeln!(
                f,
                "{}: {} polls, {} transitions, final {}, {} delivered, {} dropped",
                r.resource,
                r.polls,
                r.transitions,
                r.final_state.severity,
                r.delivery.delivered,
                r.delivery.dropped
            )?;
        }
        Ok(())
    }
}
