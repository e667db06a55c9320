//! Notification sinks.
//!
//! This module provides the [`NotificationSink`] trait and implementations
//! for delivering rendered alert messages:
//! - [`WebhookSink`]: posts to a chat incoming-webhook
//! - [`LogSink`]: writes notifications to the log instead of sending them
//! - [`RecordingSink`]: keeps deliveries in memory, with scriptable failures

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use crate::error::{Result, SinkError, WatchError};
use crate::types::{Severity, WatchedResource};

/// Boxed future returned by [`NotificationSink::send`].
pub type SinkFuture<'a> =
    Pin<Box<dyn Future<Output = std::result::Result<(), SinkError>> + Send + 'a>>;

/// Delivery target for rendered notifications.
///
/// A failed `send` is one failed attempt; retrying is the dispatcher's job.
pub trait NotificationSink: Send + Sync + fmt::Debug {
    /// Returns the name of this sink, for logs.
    fn name(&self) -> &str;

    /// Delivers one message.
    ///
    /// # Errors
    ///
    /// Returns a `SinkError` if this attempt failed.
    fn send<'a>(&'a self, message: &'a str, severity: Severity) -> SinkFuture<'a>;
}

/// Builds the sink for each watched resource.
pub trait SinkFactory: Send + Sync {
    /// Returns the sink notifications about `resource` go to.
    fn sink_for(&self, resource: &WatchedResource) -> Arc<dyn NotificationSink>;
}

impl<F> SinkFactory for F
where
    F: Fn(&WatchedResource) -> Arc<dyn NotificationSink> + Send + Sync,
{
    fn sink_for(&self, resource: &WatchedResource) -> Arc<dyn NotificationSink> {
        self(resource)
    }
}

/// Incoming-webhook payload.
///
/// `text` is the field Slack- and Mattermost-style incoming webhooks render.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WebhookPayload {
    /// The rendered message.
    pub text: String,
}

/// Posts notifications to a chat incoming-webhook URL.
#[derive(Debug, Clone)]
pub struct WebhookSink {
    name: String,
    url: String,
    client: reqwest::Client,
    timeout: Option<Duration>,
}

impl WebhookSink {
    /// Creates a sink posting to `url` through a shared client.
    #[must_use]
    pub fn new(url: impl Into<String>, client: reqwest::Client) -> Self {
        let url = url.into();
        Self {
            name: webhook_name(&url),
            url,
            client,
            timeout: None,
        }
    }

    /// Bounds each request to `timeout`.
    #[must_use]
    pub const fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Returns the webhook URL.
    #[must_use]
    pub fn url(&self) -> &str {
        &self.url
    }
}

/// Logs only the host of a webhook, the path usually embeds a secret.
fn webhook_name(url: &str) -> String {
    url::Url::parse(url)
        .ok()
        .and_then(|u| u.host_str().map(|h| format!("webhook:{h}")))
        .unwrap_or_else(|| "webhook".to_string())
}

impl NotificationSink for WebhookSink {
    fn name(&self) -> &str {
        &self.name
    }

    fn send<'a>(&'a self, message: &'a str, severity: Severity) -> SinkFuture<'a> {
        Box::pin(async move {
            let payload = WebhookPayload {
                text: message.to_string(),
            };
            let mut request = self.client.post(&self.url).json(&payload);
            if let Some(timeout) = self.timeout {
                request = request.timeout(timeout);
            }
            let response = request.send().await.map_err(|e| match self.timeout {
                Some(timeout) if e.is_timeout() => SinkError::Timeout(timeout),
                _ => SinkError::Transport {
                    reason: e.to_string(),
                },
            })?;

            let status = response.status();
            if !status.is_success() {
                return Err(SinkError::Http {
                    status: status.as_u16(),
                });
            }

            debug!(sink = %self.name, severity = %severity, "webhook accepted notification");
            Ok(())
        })
    }
}

/// Creates one [`WebhookSink`] per resource, all sharing a connection pool.
#[derive(Debug, Clone)]
pub struct WebhookSinkFactory {
    client: reqwest::Client,
    request_timeout: Duration,
}

impl WebhookSinkFactory {
    /// Creates a factory whose requests time out after `request_timeout`.
    ///
    /// # Errors
    ///
    /// Returns `WatchError::ConfigurationInvalid` if the HTTP client cannot be built.
    pub fn new(request_timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(request_timeout)
            .user_agent(concat!("clawwatch/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| WatchError::config(format!("failed to build HTTP client: {e}")))?;
        Ok(Self {
            client,
            request_timeout,
        })
    }
}

impl SinkFactory for WebhookSinkFactory {
    fn sink_for(&self, resource: &WatchedResource) -> Arc<dyn NotificationSink> {
        Arc::new(
            WebhookSink::new(resource.webhook_url.clone(), self.client.clone())
                .with_timeout(self.request_timeout),
        )
    }
}

/// A sink that logs notifications instead of sending them.
#[derive(Debug, Clone)]
pub struct LogSink {
    name: String,
}

impl LogSink {
    /// Creates a new log sink.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}

impl Default for LogSink {
    fn default() -> Self {
        Self::new("log")
    }
}

impl NotificationSink for LogSink {
    fn name(&self) -> &str {
        &self.name
    }

    fn send<'a>(&'a self, message: &'a str, severity: Severity) -> SinkFuture<'a> {
        match severity {
            Severity::Critical | Severity::Error => error!(sink = %self.name, "{message}"),
            Severity::Warning => warn!(sink = %self.name, "{message}"),
            Severity::Ok => info!(sink = %self.name, "{message}"),
        }
        Box::pin(async { Ok(()) })
    }
}

/// A delivery accepted by a [`RecordingSink`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivered {
    /// The message.
    pub message: String,
    /// The severity it was sent with.
    pub severity: Severity,
    /// When it was accepted.
    pub at: tokio::time::Instant,
}

#[derive(Debug, Default)]
struct Recording {
    delivered: Vec<Delivered>,
    attempts: Vec<tokio::time::Instant>,
    failures_left: u32,
    always_fail: bool,
}

/// In-memory sink for tests and dry runs.
///
/// Failures can be scripted with [`RecordingSink::fail_next`] and
/// [`RecordingSink::fail_always`]; a failing attempt returns HTTP 503.
#[derive(Debug, Default)]
pub struct RecordingSink {
    name: String,
    latency: Duration,
    state: Mutex<Recording>,
}

impl RecordingSink {
    /// Creates an empty recording sink.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    /// Makes every attempt take `latency` before answering.
    #[must_use]
    pub const fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    /// Makes the next `count` attempts fail.
    pub fn fail_next(&self, count: u32) {
        self.state.lock().failures_left = count;
    }

    /// Makes every attempt fail until [`RecordingSink::recover`] is called.
    pub fn fail_always(&self) {
        self.state.lock().always_fail = true;
    }

    /// Stops scripted failures.
    pub fn recover(&self) {
        let mut state = self.state.lock();
        state.always_fail = false;
        state.failures_left = 0;
    }

    /// Returns all accepted deliveries, oldest first.
    #[must_use]
    pub fn delivered(&self) -> Vec<Delivered> {
        self.state.lock().delivered.clone()
    }

    /// Returns the accepted messages, oldest first.
    #[must_use]
    pub fn messages(&self) -> Vec<String> {
        self.state
            .lock()
            .delivered
            .iter()
            .map(|d| d.message.clone())
            .collect()
    }

    /// Returns when each attempt, failed or not, was made.
    #[must_use]
    pub fn attempts(&self) -> Vec<tokio::time::Instant> {
        self.state.lock().attempts.clone()
    }

    fn record(&self, message: &str, severity: Severity) -> std::result::Result<(), SinkError> {
        let mut state = self.state.lock();
        let now = tokio::time::Instant::now();
        state.attempts.push(now);
        if state.always_fail {
            return Err(SinkError::Http { status: 503 });
        }
        if state.failures_left > 0 {
            state.failures_left -= 1;
            return Err(SinkError::Http { status: 503 });
        }
        state.delivered.push(Delivered {
            message: message.to_string(),
            severity,
            at: now,
        });
        Ok(())
    }
}

impl NotificationSink for RecordingSink {
    fn name(&self) -> &str {
        &self.name
    }

    fn send<'a>(&'a self, message: &'a str, severity: Severity) -> SinkFuture<'a> {
        Box::pin(async move {
            if !self.latency.is_zero() {
                tokio::time::sleep(self.latency).await;
            }
            self.record(message, severity)
        })
    }
}
