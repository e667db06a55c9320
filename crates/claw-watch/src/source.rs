//! Resource sources.
//!
//! A [`ResourceSource`] answers status and usage queries for a
//! [`ResourceRef`]. The engine only talks to this trait; the Kubernetes API
//! implementation lives in [`crate::kube`], and [`FakeResourceSource`] serves
//! scripted readings for tests and dry runs.

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use parking_lot::Mutex;

use crate::error::SourceError;
use crate::types::{ResourceRef, ResourceStatus, ResourceUsage};

/// Boxed future returned by [`ResourceSource`] methods.
pub type SourceFuture<'a, T> =
    Pin<Box<dyn Future<Output = std::result::Result<T, SourceError>> + Send + 'a>>;

/// Query interface to the cluster.
///
/// Implementations must be safe to call concurrently from every poll loop.
pub trait ResourceSource: Send + Sync + fmt::Debug {
    /// Returns the current lifecycle status of `target`.
    ///
    /// # Errors
    ///
    /// Returns `SourceError::NotFound` if the object does not exist and
    /// `SourceError::Unavailable` if the API could not be queried.
    fn status<'a>(&'a self, target: &'a ResourceRef) -> SourceFuture<'a, ResourceStatus>;

    /// Returns the current CPU/memory usage of `target`.
    ///
    /// # Errors
    ///
    /// Same as [`ResourceSource::status`], plus `SourceError::MetricsNotReady`
    /// when the object exists but has not been measured yet.
    fn usage<'a>(&'a self, target: &'a ResourceRef) -> SourceFuture<'a, ResourceUsage>;
}

/// One scripted answer of a [`FakeResourceSource`].
#[derive(Debug, Clone, PartialEq)]
pub struct FakeReading {
    /// Answer to `status`.
    pub status: std::result::Result<ResourceStatus, SourceError>,
    /// Answer to `usage`.
    pub usage: std::result::Result<ResourceUsage, SourceError>,
    /// How long `status` takes to answer.
    pub delay: Duration,
}

impl FakeReading {
    /// A running resource with the given usage.
    #[must_use]
    pub const fn running(cpu_millicores: u64, memory_bytes: u64) -> Self {
        Self {
            status: Ok(ResourceStatus::Running),
            usage: Ok(ResourceUsage::new(cpu_millicores, memory_bytes)),
            delay: Duration::ZERO,
        }
    }

    /// A resource in `status` with no usage.
    #[must_use]
    pub const fn with_status(status: ResourceStatus) -> Self {
        Self {
            status: Ok(status),
            usage: Ok(ResourceUsage::new(0, 0)),
            delay: Duration::ZERO,
        }
    }

    /// A resource that does not exist.
    #[must_use]
    pub fn not_found(target: &ResourceRef) -> Self {
        Self::failing(SourceError::NotFound {
            resource: target.to_string(),
        })
    }

    /// An API failure.
    #[must_use]
    pub fn unavailable(reason: impl Into<String>) -> Self {
        Self::failing(SourceError::Unavailable {
            reason: reason.into(),
        })
    }

    /// A running resource whose usage has not been measured yet.
    #[must_use]
    pub fn metrics_not_ready(target: &ResourceRef) -> Self {
        Self {
            status: Ok(ResourceStatus::Running),
            usage: Err(SourceError::MetricsNotReady {
                resource: target.to_string(),
            }),
            delay: Duration::ZERO,
        }
    }

    fn failing(err: SourceError) -> Self {
        Self {
            status: Err(err.clone()),
            usage: Err(err),
            delay: Duration::ZERO,
        }
    }

    /// Makes `status` take `delay` to answer.
    #[must_use]
    pub fn delayed(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }
}

#[derive(Debug, Default)]
struct Script {
    pending: VecDeque<FakeReading>,
    current: Option<FakeReading>,
    polls: u64,
}

/// In-memory source that replays scripted readings.
///
/// Every `status` call advances the resource's script by one reading; `usage`
/// answers from the reading the last `status` call returned. Once a script is
/// exhausted its final reading repeats. Unknown resources are not found.
#[derive(Debug, Default)]
pub struct FakeResourceSource {
    scripts: Mutex<HashMap<ResourceRef, Script>>,
}

impl FakeResourceSource {
    /// Creates an empty source.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a script for `target`.
    #[must_use]
    pub fn with_script(
        self,
        target: ResourceRef,
        readings: impl IntoIterator<Item = FakeReading>,
    ) -> Self {
        self.push(&target, readings);
        self
    }

    /// Appends readings to the script of `target`.
    pub fn push(&self, target: &ResourceRef, readings: impl IntoIterator<Item = FakeReading>) {
        let mut scripts = self.scripts.lock();
        scripts
            .entry(target.clone())
            .or_default()
            .pending
            .extend(readings);
    }

    /// Returns how many times `status` was called for `target`.
    #[must_use]
    pub fn poll_count(&self, target: &ResourceRef) -> u64 {
        self.scripts.lock().get(target).map_or(0, |s| s.polls)
    }

    fn advance(&self, target: &ResourceRef) -> Option<FakeReading> {
        let mut scripts = self.scripts.lock();
        let script = scripts.get_mut(target)?;
        script.polls += 1;
        if let Some(next) = script.pending.pop_front() {
            script.current = Some(next);
        }
        script.current.clone()
    }
}

impl ResourceSource for FakeResourceSource {
    fn status<'a>(&'a self, target: &'a ResourceRef) -> SourceFuture<'a, ResourceStatus> {
        Box::pin(async move {
            let Some(reading) = self.advance(target) else {
                return Err(SourceError::NotFound {
                    resource: target.to_string(),
                });
            };
            if !reading.delay.is_zero() {
                tokio::time::sleep(reading.delay).await;
            }
            reading.status
        })
    }

    fn usage<'a>(&'a self, target: &'a ResourceRef) -> SourceFuture<'a, ResourceUsage> {
        let answer = self
            .scripts
            .lock()
            .get(target)
            .and_then(|s| s.current.as_ref())
            .map_or_else(
                || {
                    Err(SourceError::NotFound {
                        resource: target.to_string(),
                    })
                },
                |r| r.usage.clone(),
            );
        Box::pin(async move { answer })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ResourceKind;

    fn api() -> ResourceRef {
        ResourceRef::named(ResourceKind::Pod, "default", "api")
    }

    #[tokio::test]
    async fn replays_script_then_repeats_last() {
        let source = FakeResourceSource::new().with_script(
            api(),
            [FakeReading::running(10, 50), FakeReading::running(20, 150)],
        );

        assert_eq!(source.status(&api()).await, Ok(ResourceStatus::Running));
        assert_eq!(source.usage(&api()).await, Ok(ResourceUsage::new(10, 50)));
        source.status(&api()).await.unwrap();
        assert_eq!(source.usage(&api()).await, Ok(ResourceUsage::new(20, 150)));
        source.status(&api()).await.unwrap();
        assert_eq!(source.usage(&api()).await, Ok(ResourceUsage::new(20, 150)));
        assert_eq!(source.poll_count(&api()), 3);
    }

    #[tokio::test]
    async fn unknown_resource_is_not_found() {
        let source = FakeResourceSource::new();
        let err = source.status(&api()).await.unwrap_err();
        assert!(err.is_not_found());
        assert_eq!(source.poll_count(&api()), 0);
    }

    #[tokio::test]
    async fn scripted_failures() {
        let source = FakeResourceSource::new().with_script(
            api(),
            [FakeReading::not_found(&api()), FakeReading::unavailable("api down")],
        );
        assert!(source.status(&api()).await.unwrap_err().is_not_found());
        assert_eq!(
            source.status(&api()).await,
            Err(SourceError::Unavailable {
                reason: "api down".to_string()
            })
        );
    }

    #[tokio::test(start_paused = true)]
    async fn delayed_reading_takes_time() {
        let source = FakeResourceSource::new().with_script(
            api(),
            [FakeReading::running(0, 0).delayed(Duration::from_secs(3))],
        );
        let start = tokio::time::Instant::now();
        source.status(&api()).await.unwrap();
        assert_eq!(start.elapsed(), Duration::from_secs(3));
    }
}
