//! Workload watcher for Clawbernetes.
//!
//! `claw-watch` polls Kubernetes pods, deployments and persistent volume
//! claims, judges each sample against configured CPU/memory limits and
//! lifecycle status, and posts a chat notification whenever a resource's
//! severity changes.
//!
//! # Pipeline
//!
//! Each watched resource gets its own poll loop:
//!
//! 1. [`ResourceSource`] produces a [`Sample`] (status plus usage)
//! 2. [`ThresholdEvaluator`] turns it into a [`Verdict`]
//! 3. [`AlertStateTracker`] emits a [`NotificationEvent`] only when the severity changes
//! 4. a per-resource [`DeliveryQueue`] hands it to the [`Dispatcher`], which retries with backoff
//!
//! # Example
//!
//! ```rust
//! use chrono::Utc;
//! use claw_watch::{
//!     evaluate, AlertStateTracker, ResourceKind, ResourceRef, ResourceStatus, ResourceUsage,
//!     Sample, Severity, WatchedResource,
//! };
//!
//! let api = ResourceRef::named(ResourceKind::Pod, "default", "api");
//! let watched = WatchedResource::new(api.clone(), "https://chat.example.com/hooks/abc")
//!     .with_memory_limit(100 * 1024 * 1024);
//! let mut tracker = AlertStateTracker::new(api, Utc::now());
//!
//! let sample = Sample::observed(
//!     Utc::now(),
//!     ResourceStatus::Running,
//!     Some(ResourceUsage::new(100, 150 * 1024 * 1024)),
//! );
//! let verdict = evaluate(&sample, &watched.limits);
//! assert_eq!(verdict.severity, Severity::Warning);
//!
//! let event = tracker.observe(sample, verdict).expect("first breach is a transition");
//! assert!(event.message.starts_with("[WARNING] pod default/api: ok → warning"));
//! ```
//!
//! # Running a watcher
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use claw_watch::{KubeApiSource, WatchConfig, Watcher, WebhookSinkFactory};
//! use tokio_util::sync::CancellationToken;
//!
//! let config = WatchConfig::from_file("clawwatch.yaml")?;
//! let source = Arc::new(KubeApiSource::new(&config.kube_config()?)?);
//! let sinks = Arc::new(WebhookSinkFactory::new(config.attempt_timeout())?);
//!
//! let handle = Watcher::new(config.watched_resources()?, source, sinks)
//!     .with_config(config.watcher_config())
//!     .start(CancellationToken::new())?;
//!
//! tokio::signal::ctrl_c().await?;
//! let report = handle.shutdown().await;
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(rustdoc::missing_crate_level_docs)]

pub mod clock;
pub mod config;
pub mod dispatcher;
pub mod error;
pub mod evaluator;
pub mod event;
pub mod kube;
pub mod logging;
pub mod quantity;
pub mod remediation;
pub mod sink;
pub mod source;
pub mod tracker;
pub mod types;
pub mod watcher;

// Re-export main types at crate root
pub use clock::{Clock, TokioClock};
pub use config::WatchConfig;
pub use dispatcher::{DeliveryQueue, DeliveryStats, Dispatcher, QueueHandle, RetryPolicy};
pub use error::{Result, SinkError, SourceError, WatchError};
pub use evaluator::{ThresholdEvaluator, evaluate};
pub use event::NotificationEvent;
pub use kube::{KubeApiSource, KubeConfig};
pub use logging::{LogLevel, LoggingSettings, ResourceLogger};
pub use remediation::{RecordingRemediation, RemediationHook};
pub use sink::{
    LogSink, NotificationSink, RecordingSink, SinkFactory, WebhookSink, WebhookSinkFactory,
};
pub use source::{FakeReading, FakeResourceSource, ResourceSource};
pub use tracker::AlertStateTracker;
pub use types::{
    AlertState, Breach, Dimension, Observation, ResourceKind, ResourceLimits, ResourceRef,
    ResourceStatus, ResourceUsage, Sample, Selector, Severity, Verdict, WatchedResource,
};
pub use watcher::{ResourceReport, WatchHandle, WatchReport, Watcher, WatcherConfig};
