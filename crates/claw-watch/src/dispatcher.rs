//! Notification delivery with bounded retry and per-resource ordering.
//!
//! [`Dispatcher::dispatch`] makes up to [`RetryPolicy::max_attempts`] attempts,
//! each under its own timeout, sleeping with exponential backoff between them.
//! A [`DeliveryQueue`] owns one sequential worker per resource so a resource's
//! notifications arrive in the order its transitions happened, while a slow or
//! failing sink for one resource never holds up another.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use crate::clock::Clock;
use crate::error::{Result, SinkError, WatchError};
use crate::event::NotificationEvent;
use crate::sink::NotificationSink;
use crate::types::ResourceRef;

/// Retry behaviour for notification delivery.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Total attempts per notification, the first one included.
    pub max_attempts: u32,
    /// Delay after the first failed attempt.
    pub initial_backoff: Duration,
    /// Multiplier for exponential backoff.
    pub backoff_multiplier: f64,
    /// Upper bound for a single backoff delay.
    pub max_backoff: Duration,
    /// Timeout for a single attempt.
    pub attempt_timeout: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff: Duration::from_millis(500),
            backoff_multiplier: 2.0,
            max_backoff: Duration::from_secs(30),
            attempt_timeout: Duration::from_secs(10),
        }
    }
}

impl RetryPolicy {
    /// Returns the delay to wait after failed attempt number `attempt` (1-based).
    #[must_use]
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let factor = self
            .backoff_multiplier
            .powi(attempt.saturating_sub(1).min(i32::MAX as u32) as i32);
        let millis = self.initial_backoff.as_millis() as f64 * factor;
        if !millis.is_finite() || millis >= self.max_backoff.as_millis() as f64 {
            return self.max_backoff;
        }
        Duration::from_millis(millis as u64).min(self.max_backoff)
    }

    /// Returns true if another attempt may follow failed attempt number `attempt`.
    #[must_use]
    pub const fn should_retry(&self, attempt: u32) -> bool {
        attempt < self.attempt_budget()
    }

    const fn attempt_budget(&self) -> u32 {
        if self.max_attempts == 0 { 1 } else { self.max_attempts }
    }
}

/// Delivers single events to a sink.
#[derive(Debug, Clone)]
pub struct Dispatcher {
    policy: RetryPolicy,
    clock: Arc<dyn Clock>,
    cancel: CancellationToken,
}

impl Dispatcher {
    /// Creates a dispatcher. Once `cancel` fires, failed attempts are no longer retried.
    #[must_use]
    pub fn new(policy: RetryPolicy, clock: Arc<dyn Clock>, cancel: CancellationToken) -> Self {
        Self {
            policy,
            clock,
            cancel,
        }
    }

    /// Returns the retry policy.
    #[must_use]
    pub const fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Delivers `event` through `sink`, retrying per the policy.
    ///
    /// Returns the number of attempts it took.
    ///
    /// # Errors
    ///
    /// Returns `WatchError::DeliveryFailed` once the attempt budget is spent,
    /// or when shutdown interrupts the retries.
    pub async fn dispatch(
        &self,
        sink: &dyn NotificationSink,
        event: &NotificationEvent,
    ) -> Result<u32> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            let outcome = self.attempt(sink, event).await;
            let err = match outcome {
                Ok(()) => {
                    debug!(
                        resource = %event.resource,
                        sink = sink.name(),
                        sequence = event.sequence,
                        attempt,
                        "notification delivered"
                    );
                    return Ok(attempt);
                }
                Err(err) => err,
            };

            if !self.policy.should_retry(attempt) {
                return Err(delivery_failed(event, attempt, &err.to_string()));
            }
            if self.cancel.is_cancelled() {
                return Err(abandoned(event, attempt, &err));
            }

            let delay = self.policy.delay_for_attempt(attempt);
            warn!(
                resource = %event.resource,
                sink = sink.name(),
                attempt,
                delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                error = %err,
                "notification attempt failed, retrying"
            );
            tokio::select! {
                () = self.cancel.cancelled() => return Err(abandoned(event, attempt, &err)),
                () = self.clock.sleep(delay) => {}
            }
        }
    }

    async fn attempt(
        &self,
        sink: &dyn NotificationSink,
        event: &NotificationEvent,
    ) -> std::result::Result<(), SinkError> {
        let timeout = self.policy.attempt_timeout;
        match tokio::time::timeout(timeout, sink.send(&event.message, event.current)).await {
            Ok(result) => result,
            Err(_) => Err(SinkError::Timeout(timeout)),
        }
    }
}

fn delivery_failed(event: &NotificationEvent, attempts: u32, reason: &str) -> WatchError {
    WatchError::DeliveryFailed {
        resource: event.resource.to_string(),
        attempts,
        reason: reason.to_string(),
    }
}

fn abandoned(event: &NotificationEvent, attempts: u32, err: &SinkError) -> WatchError {
    delivery_failed(event, attempts, &format!("{err}; retry abandoned on shutdown"))
}

/// Delivery counters for one resource.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeliveryStats {
    /// Events handed to the queue.
    pub enqueued: u64,
    /// Events the sink accepted.
    pub delivered: u64,
    /// Events given up on, after retries or at shutdown.
    pub dropped: u64,
    /// Send attempts made, retries included.
    pub attempts: u64,
}

impl DeliveryStats {
    /// Events neither delivered nor dropped yet.
    #[must_use]
    pub const fn pending(&self) -> u64 {
        self.enqueued.saturating_sub(self.delivered + self.dropped)
    }
}

/// Cloneable producer side of a [`DeliveryQueue`].
#[derive(Debug, Clone)]
pub struct QueueHandle {
    sender: mpsc::UnboundedSender<NotificationEvent>,
    stats: Arc<Mutex<DeliveryStats>>,
}

impl QueueHandle {
    /// Queues `event` for delivery. Never blocks.
    ///
    /// Returns false if the worker has already stopped.
    pub fn enqueue(&self, event: NotificationEvent) -> bool {
        self.stats.lock().enqueued += 1;
        match self.sender.send(event) {
            Ok(()) => true,
            Err(mpsc::error::SendError(event)) => {
                error!(resource = %event.resource, "delivery worker stopped, notification dropped");
                self.stats.lock().dropped += 1;
                false
            }
        }
    }
}

/// Sequential delivery worker for a single resource.
#[derive(Debug)]
pub struct DeliveryQueue {
    resource: ResourceRef,
    handle: QueueHandle,
    task: JoinHandle<()>,
}

impl DeliveryQueue {
    /// Spawns the worker for `resource` on the current runtime.
    #[must_use]
    pub fn spawn(
        resource: ResourceRef,
        sink: Arc<dyn NotificationSink>,
        dispatcher: Dispatcher,
    ) -> Self {
        let (sender, receiver) = mpsc::unbounded_channel();
        let stats = Arc::new(Mutex::new(DeliveryStats::default()));
        let task = tokio::spawn(run_worker(
            resource.clone(),
            sink,
            dispatcher,
            receiver,
            Arc::clone(&stats),
        ));
        Self {
            resource,
            handle: QueueHandle { sender, stats },
            task,
        }
    }

    /// Returns a producer handle for this queue.
    #[must_use]
    pub fn handle(&self) -> QueueHandle {
        self.handle.clone()
    }

    /// Queues `event` for delivery.
    pub fn enqueue(&self, event: NotificationEvent) -> bool {
        self.handle.enqueue(event)
    }

    /// Returns the current counters.
    #[must_use]
    pub fn stats(&self) -> DeliveryStats {
        *self.handle.stats.lock()
    }

    /// Stops accepting events and waits up to `grace` for the backlog to drain.
    ///
    /// The worker finishes once every [`QueueHandle`] is gone and the queue is
    /// empty. If that takes longer than `grace` it is aborted and whatever was
    /// still pending counts as dropped.
    pub async fn close(self, grace: Duration) -> DeliveryStats {
        let Self {
            resource,
            handle,
            mut task,
        } = self;
        let stats = Arc::clone(&handle.stats);
        drop(handle);

        if tokio::time::timeout(grace, &mut task).await.is_err() {
            task.abort();
            let mut stats = stats.lock();
            let abandoned = stats.pending();
            stats.dropped += abandoned;
            warn!(
                resource = %resource,
                abandoned,
                grace_ms = u64::try_from(grace.as_millis()).unwrap_or(u64::MAX),
                "delivery worker did not drain in time, aborted"
            );
        }
        *stats.lock()
    }
}

async fn run_worker(
    resource: ResourceRef,
    sink: Arc<dyn NotificationSink>,
    dispatcher: Dispatcher,
    mut receiver: mpsc::UnboundedReceiver<NotificationEvent>,
    stats: Arc<Mutex<DeliveryStats>>,
) {
    debug!(resource = %resource, sink = sink.name(), "delivery worker started");
    while let Some(event) = receiver.recv().await {
        match dispatcher.dispatch(sink.as_ref(), &event).await {
            Ok(attempts) => {
                let mut stats = stats.lock();
                stats.delivered += 1;
                stats.attempts += u64::from(attempts);
            }
            Err(err) => {
                let attempts = match &err {
                    WatchError::DeliveryFailed { attempts, .. } => *attempts,
                    _ => 0,
                };
                error!(
                    resource = %resource,
                    sink = sink.name(),
                    sequence = event.sequence,
                    attempts,
                    error = %err,
                    "notification dropped"
                );
                let mut stats = stats.lock();
                stats.dropped += 1;
                stats.attempts += u64::from(attempts);
            }
        }
    }
    debug!(resource = %resource, "delivery worker stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::TokioClock;
    use crate::sink::RecordingSink;
    use crate::types::{ResourceKind, Sample, Severity, Verdict, ResourceStatus};
    use chrono::Utc;

    fn api() -> ResourceRef {
        ResourceRef::named(ResourceKind::Pod, "default", "api")
    }

    fn event(resource: ResourceRef, sequence: u64, current: Severity) -> NotificationEvent {
        let sample = Sample::observed(Utc::now(), ResourceStatus::Running, None);
        let verdict = match current {
            Severity::Ok => Verdict::ok(),
            other => Verdict::breached(
                other,
                crate::types::Breach::Memory {
                    used_bytes: 150,
                    limit_bytes: 100,
                },
            ),
        };
        let mut event = NotificationEvent::new(resource, sequence, Severity::Ok, sample, verdict);
        event.message = format!("event {sequence}");
        event
    }

    fn dispatcher(cancel: &CancellationToken) -> Dispatcher {
        Dispatcher::new(RetryPolicy::default(), Arc::new(TokioClock::new()), cancel.clone())
    }

    mod policy_tests {
        use super::*;

        #[test]
        fn defaults() {
            let policy = RetryPolicy::default();
            assert_eq!(policy.max_attempts, 3);
            assert_eq!(policy.initial_backoff, Duration::from_millis(500));
            assert_eq!(policy.max_backoff, Duration::from_secs(30));
            assert_eq!(policy.attempt_timeout, Duration::from_secs(10));
        }

        #[test]
        fn backoff_doubles_and_caps() {
            let policy = RetryPolicy::default();
            assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(500));
            assert_eq!(policy.delay_for_attempt(2), Duration::from_secs(1));
            assert_eq!(policy.delay_for_attempt(3), Duration::from_secs(2));
            assert_eq!(policy.delay_for_attempt(7), Duration::from_secs(30));
            assert_eq!(policy.delay_for_attempt(500), Duration::from_secs(30));
        }

        #[test]
        fn retry_budget() {
            let policy = RetryPolicy::default();
            assert!(policy.should_retry(1));
            assert!(policy.should_retry(2));
            assert!(!policy.should_retry(3));

            let zero = RetryPolicy {
                max_attempts: 0,
                ..RetryPolicy::default()
            };
            assert!(!zero.should_retry(1));
        }
    }

    mod dispatch_tests {
        use super::*;

        #[tokio::test(start_paused = true)]
        async fn succeeds_first_try() {
            let cancel = CancellationToken::new();
            let sink = RecordingSink::new("test");
            let attempts = dispatcher(&cancel)
                .dispatch(&sink, &event(api(), 1, Severity::Warning))
                .await
                .unwrap();
            assert_eq!(attempts, 1);
            assert_eq!(sink.messages(), vec!["event 1"]);
        }

        #[tokio::test(start_paused = true)]
        async fn retries_with_backoff() {
            let cancel = CancellationToken::new();
            let sink = RecordingSink::new("test");
            sink.fail_next(2);

            let attempts = dispatcher(&cancel)
                .dispatch(&sink, &event(api(), 1, Severity::Warning))
                .await
                .unwrap();

            assert_eq!(attempts, 3);
            let at = sink.attempts();
            assert_eq!(at[1] - at[0], Duration::from_millis(500));
            assert_eq!(at[2] - at[1], Duration::from_secs(1));
        }

        #[tokio::test(start_paused = true)]
        async fn persistent_failure_uses_exact_budget() {
            let cancel = CancellationToken::new();
            let sink = RecordingSink::new("test");
            sink.fail_always();

            let err = dispatcher(&cancel)
                .dispatch(&sink, &event(api(), 1, Severity::Critical))
                .await
                .unwrap_err();

            assert!(matches!(err, WatchError::DeliveryFailed { attempts: 3, .. }));
            assert_eq!(sink.attempts().len(), 3);
            assert!(err.to_string().contains("HTTP 503"));
        }

        #[tokio::test(start_paused = true)]
        async fn slow_attempt_times_out() {
            let cancel = CancellationToken::new();
            let sink = RecordingSink::new("slow").with_latency(Duration::from_secs(60));
            let policy = RetryPolicy {
                max_attempts: 1,
                ..RetryPolicy::default()
            };
            let dispatcher = Dispatcher::new(policy, Arc::new(TokioClock::new()), cancel);

            let err = dispatcher
                .dispatch(&sink, &event(api(), 1, Severity::Warning))
                .await
                .unwrap_err();
            assert!(err.to_string().contains("timed out"));
        }

        #[tokio::test(start_paused = true)]
        async fn cancellation_stops_retrying() {
            let cancel = CancellationToken::new();
            let sink = RecordingSink::new("test");
            sink.fail_always();
            cancel.cancel();

            let err = dispatcher(&cancel)
                .dispatch(&sink, &event(api(), 1, Severity::Warning))
                .await
                .unwrap_err();

            assert!(matches!(err, WatchError::DeliveryFailed { attempts: 1, .. }));
            assert!(err.to_string().contains("shutdown"));
        }

        #[tokio::test(start_paused = true)]
        async fn cancellation_interrupts_backoff() {
            let cancel = CancellationToken::new();
            let sink = RecordingSink::new("test");
            sink.fail_always();
            let policy = RetryPolicy {
                max_attempts: 10,
                initial_backoff: Duration::from_secs(20),
                ..RetryPolicy::default()
            };
            let dispatcher = Dispatcher::new(policy, Arc::new(TokioClock::new()), cancel.clone());

            let trigger = cancel.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_secs(5)).await;
                trigger.cancel();
            });

            let start = tokio::time::Instant::now();
            let err = dispatcher
                .dispatch(&sink, &event(api(), 1, Severity::Warning))
                .await
                .unwrap_err();
            assert!(matches!(err, WatchError::DeliveryFailed { attempts: 1, .. }));
            assert_eq!(start.elapsed(), Duration::from_secs(5));
        }
    }

    mod queue_tests {
        use super::*;

        #[tokio::test(start_paused = true)]
        async fn preserves_order_under_retries() {
            let cancel = CancellationToken::new();
            let sink = Arc::new(RecordingSink::new("test"));
            sink.fail_next(2);
            let queue = DeliveryQueue::spawn(api(), sink.clone(), dispatcher(&cancel));

            for sequence in 1..=4 {
                assert!(queue.enqueue(event(api(), sequence, Severity::Warning)));
            }
            let stats = queue.close(Duration::from_secs(60)).await;

            assert_eq!(sink.messages(), vec!["event 1", "event 2", "event 3", "event 4"]);
            assert_eq!(stats.enqueued, 4);
            assert_eq!(stats.delivered, 4);
            assert_eq!(stats.dropped, 0);
            assert_eq!(stats.attempts, 6);
        }

        #[tokio::test(start_paused = true)]
        async fn failing_resource_does_not_block_another() {
            let cancel = CancellationToken::new();
            let web = ResourceRef::named(ResourceKind::Pod, "default", "web");

            let broken = Arc::new(RecordingSink::new("broken"));
            broken.fail_always();
            let healthy = Arc::new(RecordingSink::new("healthy"));

            let slow_queue = DeliveryQueue::spawn(api(), broken.clone(), dispatcher(&cancel));
            let fast_queue =
                DeliveryQueue::spawn(web.clone(), healthy.clone(), dispatcher(&cancel));

            let start = tokio::time::Instant::now();
            slow_queue.enqueue(event(api(), 1, Severity::Critical));
            fast_queue.enqueue(event(web, 1, Severity::Warning));

            let fast = fast_queue.close(Duration::from_secs(60)).await;
            assert_eq!(fast.delivered, 1);
            assert!(start.elapsed() < Duration::from_millis(500));

            let slow = slow_queue.close(Duration::from_secs(60)).await;
            assert_eq!(slow.dropped, 1);
            assert_eq!(slow.attempts, 3);
            assert_eq!(broken.attempts().len(), 3);
        }

        #[tokio::test(start_paused = true)]
        async fn grace_period_bounds_shutdown() {
            let cancel = CancellationToken::new();
            let sink = Arc::new(RecordingSink::new("slow").with_latency(Duration::from_secs(8)));
            let queue = DeliveryQueue::spawn(api(), sink.clone(), dispatcher(&cancel));

            for sequence in 1..=3 {
                queue.enqueue(event(api(), sequence, Severity::Warning));
            }
            cancel.cancel();

            let start = tokio::time::Instant::now();
            let stats = queue.close(Duration::from_secs(5)).await;

            assert_eq!(start.elapsed(), Duration::from_secs(5));
            assert_eq!(stats.delivered, 0);
            assert_eq!(stats.dropped, 3);
            assert_eq!(stats.pending(), 0);
        }
    }

    mod drop_log_tests {
        use super::*;
        use std::collections::HashMap;
        use std::fmt;
        use tracing::field::{Field, Visit};
        use tracing::{Event, Level, Subscriber};
        use tracing_subscriber::Layer;
        use tracing_subscriber::layer::{Context, SubscriberExt};

        #[derive(Debug)]
        struct Captured {
            level: Level,
            fields: HashMap<String, String>,
        }

        /// Keeps every event emitted while it is the default subscriber.
        #[derive(Clone, Default)]
        struct CaptureLayer {
            events: Arc<Mutex<Vec<Captured>>>,
        }

        #[derive(Default)]
        struct FieldVisitor(HashMap<String, String>);

        impl Visit for FieldVisitor {
            fn record_str(&mut self, field: &Field, value: &str) {
                self.0.insert(field.name().to_string(), value.to_string());
            }

            fn record_debug(&mut self, field: &Field, value: &dyn fmt::Debug) {
                self.0.insert(field.name().to_string(), format!("{value:?}"));
            }
        }

        impl<S: Subscriber> Layer<S> for CaptureLayer {
            fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
                let mut visitor = FieldVisitor::default();
                event.record(&mut visitor);
                self.events.lock().push(Captured {
                    level: *event.metadata().level(),
                    fields: visitor.0,
                });
            }
        }

        #[tokio::test(start_paused = true)]
        async fn dropped_notification_is_logged_as_error() {
            let layer = CaptureLayer::default();
            let subscriber = tracing_subscriber::registry().with(layer.clone());
            let _guard = tracing::subscriber::set_default(subscriber);

            let cancel = CancellationToken::new();
            let sink = Arc::new(RecordingSink::new("broken"));
            sink.fail_always();
            let queue = DeliveryQueue::spawn(api(), sink.clone(), dispatcher(&cancel));
            queue.enqueue(event(api(), 7, Severity::Critical));
            let stats = queue.close(Duration::from_secs(60)).await;
            assert_eq!(stats.dropped, 1);

            let events = layer.events.lock();
            let dropped: Vec<&Captured> = events
                .iter()
                .filter(|e| e.fields.get("message").is_some_and(|m| m == "notification dropped"))
                .collect();
            assert_eq!(dropped.len(), 1, "{events:?}");
            let entry = dropped[0];
            assert_eq!(entry.level, Level::ERROR);
            assert_eq!(entry.fields["resource"], "pod default/api");
            assert_eq!(entry.fields["sink"], "broken");
            assert_eq!(entry.fields["sequence"], "7");
            assert_eq!(entry.fields["attempts"], "3");
            assert!(entry.fields["error"].contains("after 3 attempt(s)"));
        }
    }
}
