//! Error types for the claw-watch crate.

use std::time::Duration;

use thiserror::Error;

/// Errors surfaced by the watch engine.
#[derive(Debug, Error)]
pub enum WatchError {
    /// The resource source could not produce a sample.
    #[error("sample unavailable for {resource}: {source}")]
    SampleUnavailable {
        /// The resource that was being polled.
        resource: String,
        /// The underlying source failure.
        #[source]
        source: SourceError,
    },

    /// A notification could not be delivered within the retry budget.
    #[error("delivery failed for {resource} after {attempts} attempt(s): {reason}")]
    DeliveryFailed {
        /// The resource the notification was about.
        resource: String,
        /// How many attempts were made.
        attempts: u32,
        /// The last failure reason.
        reason: String,
    },

    /// A watched entry in the configuration is malformed.
    #[error("invalid configuration: {reason}")]
    ConfigurationInvalid {
        /// What is wrong with the configuration.
        reason: String,
    },

    /// The operation was abandoned because shutdown was requested.
    #[error("operation cancelled by shutdown")]
    Cancelled,
}

impl WatchError {
    /// Shorthand for a [`WatchError::ConfigurationInvalid`].
    pub fn config(reason: impl Into<String>) -> Self {
        Self::ConfigurationInvalid {
            reason: reason.into(),
        }
    }
}

impl From<serde_yaml::Error> for WatchError {
    fn from(err: serde_yaml::Error) -> Self {
        Self::config(format!("invalid YAML: {err}"))
    }
}

/// Failures reported by a [`ResourceSource`](crate::source::ResourceSource).
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SourceError {
    /// The resource does not exist.
    #[error("resource not found: {resource}")]
    NotFound {
        /// The resource that was looked up.
        resource: String,
    },

    /// The cluster API could not be reached or answered with an error.
    #[error("source unavailable: {reason}")]
    Unavailable {
        /// Description of the failure.
        reason: String,
    },

    /// The call did not complete in time.
    #[error("source call timed out after {0:?}")]
    Timeout(Duration),

    /// The resource exists but has no usage metrics yet, as with a pod the
    /// metrics server has not scraped since it started.
    #[error("usage metrics not yet available for {resource}")]
    MetricsNotReady {
        /// The resource whose usage was requested.
        resource: String,
    },
}

impl SourceError {
    /// Returns true if the resource itself is missing, as opposed to the API failing.
    #[must_use]
    pub const fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }

    /// Returns true if only the usage metrics are missing.
    #[must_use]
    pub const fn is_metrics_not_ready(&self) -> bool {
        matches!(self, Self::MetricsNotReady { .. })
    }
}

/// Failures reported by a [`NotificationSink`](crate::sink::NotificationSink).
///
/// Every variant is considered retryable by the dispatcher.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SinkError {
    /// The endpoint answered with a non-success status.
    #[error("webhook returned HTTP {status}")]
    Http {
        /// The HTTP status code.
        status: u16,
    },

    /// The request never got a response.
    #[error("transport error: {reason}")]
    Transport {
        /// Description of the failure.
        reason: String,
    },

    /// The attempt exceeded its timeout.
    #[error("delivery attempt timed out after {0:?}")]
    Timeout(Duration),
}

/// Result type for watch operations.
pub type Result<T> = std::result::Result<T, WatchError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display_sample_unavailable() {
        let err = WatchError::SampleUnavailable {
            resource: "pod default/api".to_string(),
            source: SourceError::NotFound {
                resource: "pod default/api".to_string(),
            },
        };
        assert_eq!(
            err.to_string(),
            "sample unavailable for pod default/api: resource not found: pod default/api"
        );
    }

    #[test]
    fn error_display_delivery_failed() {
        let err = WatchError::DeliveryFailed {
            resource: "pod default/api".to_string(),
            attempts: 3,
            reason: "webhook returned HTTP 502".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "delivery failed for pod default/api after 3 attempt(s): webhook returned HTTP 502"
        );
    }

    #[test]
    fn error_display_configuration_invalid() {
        let err = WatchError::config("resources[0]: namespace cannot be empty");
        assert_eq!(
            err.to_string(),
            "invalid configuration: resources[0]: namespace cannot be empty"
        );
    }

    #[test]
    fn source_error_not_found_is_distinguished() {
        assert!(SourceError::NotFound {
            resource: "x".to_string()
        }
        .is_not_found());
        assert!(!SourceError::Unavailable {
            reason: "connection refused".to_string()
        }
        .is_not_found());
        assert!(!SourceError::Timeout(Duration::from_secs(1)).is_not_found());
    }

    #[test]
    fn metrics_not_ready_is_not_a_missing_resource() {
        let err = SourceError::MetricsNotReady {
            resource: "pod default/api".to_string(),
        };
        assert!(err.is_metrics_not_ready());
        assert!(!err.is_not_found());
        assert_eq!(err.to_string(), "usage metrics not yet available for pod default/api");
    }

    #[test]
    fn sink_error_display() {
        assert_eq!(
            SinkError::Http { status: 429 }.to_string(),
            "webhook returned HTTP 429"
        );
        assert_eq!(
            SinkError::Timeout(Duration::from_secs(10)).to_string(),
            "delivery attempt timed out after 10s"
        );
    }

    #[test]
    fn error_from_serde_yaml() {
        let yaml_err = serde_yaml::from_str::<Vec<u32>>("{not: [a list");
        assert!(yaml_err.is_err());
        let err: WatchError = yaml_err.unwrap_err().into();
        assert!(matches!(err, WatchError::ConfigurationInvalid { .. }));
    }
}
