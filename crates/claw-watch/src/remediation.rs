//! Optional remediation hook.
//!
//! A [`RemediationHook`] is told about every transition into `critical`. It
//! runs alongside notification delivery, on its own task, and its outcome never
//! affects alert state or delivery.

use std::fmt;
use std::future::Future;
use std::pin::Pin;

use parking_lot::Mutex;

use crate::error::Result;
use crate::event::NotificationEvent;
use crate::types::ResourceRef;

/// Boxed future returned by [`RemediationHook::remediate`].
pub type RemediationFuture<'a> = Pin<Box<dyn Future<Output = Result<()>> + Send + 'a>>;

/// Side-effecting reaction to a resource turning critical.
pub trait RemediationHook: Send + Sync + fmt::Debug {
    /// Reacts to `event`, whose `current` severity is `critical`.
    ///
    /// # Errors
    ///
    /// Any error is logged by the watcher and otherwise ignored.
    fn remediate<'a>(&'a self, event: &'a NotificationEvent) -> RemediationFuture<'a>;
}

/// Hook that only remembers which resources it was called for.
#[derive(Debug, Default)]
pub struct RecordingRemediation {
    calls: Mutex<Vec<ResourceRef>>,
}

impl RecordingRemediation {
    /// Creates an empty recorder.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the resources remediated so far, oldest first.
    #[must_use]
    pub fn calls(&self) -> Vec<ResourceRef> {
        self.calls.lock().clone()
    }
}

impl RemediationHook for RecordingRemediation {
    fn remediate<'a>(&'a self, event: &'a NotificationEvent) -> RemediationFuture<'a> {
        self.calls.lock().push(event.resource.clone());
        Box::pin(async { Ok(()) })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Breach, ResourceKind, ResourceStatus, Sample, Severity, Verdict};
    use chrono::Utc;

    #[tokio::test]
    async fn recorder_keeps_calls() {
        let hook = RecordingRemediation::new();
        let resource = ResourceRef::named(ResourceKind::Deployment, "prod", "web");
        let event = NotificationEvent::new(
            resource.clone(),
            1,
            Severity::Ok,
            Sample::observed(Utc::now(), ResourceStatus::Failed, None),
            Verdict::breached(Severity::Critical, Breach::Status(ResourceStatus::Failed)),
        );

        hook.remediate(&event).await.unwrap();

        assert_eq!(hook.calls(), vec![resource]);
    }
}
