//! Watch configuration.
//!
//! The configuration is a YAML document with four sections:
//! - `defaults`: interval, webhook URL, logging and multiplier applied to every entry
//! - `dispatch`: notification retry and shutdown settings
//! - `source`: how to reach the Kubernetes API
//! - `resources`: the watched entries
//!
//! ```yaml
//! defaults:
//!   interval_secs: 30
//!   webhook_url: https://chat.example.com/hooks/abc
//! resources:
//!   - type: pod
//!     name: api
//!     namespace: prod
//!     limits:
//!       memory: 512Mi
//!       cpu: 500m
//! ```

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::dispatcher::RetryPolicy;
use crate::error::{Result, WatchError};
use crate::kube::KubeConfig;
use crate::logging::LoggingSettings;
use crate::quantity::{parse_cpu, parse_memory};
use crate::types::{
    DEFAULT_HARD_FAIL_MULTIPLIER, ResourceKind, ResourceLimits, ResourceRef, Selector,
    WatchedResource,
};
use crate::watcher::WatcherConfig;

/// Object names (RFC 1123 subdomain).
static OBJECT_NAME_REGEX: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^[a-z0-9]([a-z0-9-]*[a-z0-9])?(\.[a-z0-9]([a-z0-9-]*[a-z0-9])?)*$")
        .unwrap_or_else(|_| unreachable!())
});

/// Namespaces (RFC 1123 label).
static NAMESPACE_REGEX: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[a-z0-9]([a-z0-9-]*[a-z0-9])?$").unwrap_or_else(|_| unreachable!()));

const MAX_OBJECT_NAME_LEN: usize = 253;
const MAX_NAMESPACE_LEN: usize = 63;

/// Settings applied to every entry unless it overrides them.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct Defaults {
    /// Poll interval in seconds.
    pub interval_secs: u64,
    /// Webhook URL for entries without their own.
    pub webhook_url: Option<String>,
    /// Logging for entries without their own.
    pub logging: LoggingSettings,
    /// Hard-fail multiplier for entries without their own.
    pub hard_fail_multiplier: f64,
    /// Namespace for entries without their own.
    pub namespace: String,
}

impl Default for Defaults {
    fn default() -> Self {
        Self {
            interval_secs: 30,
            webhook_url: None,
            logging: LoggingSettings::default(),
            hard_fail_multiplier: DEFAULT_HARD_FAIL_MULTIPLIER,
            namespace: "default".to_string(),
        }
    }
}

/// Notification delivery settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct DispatchSettings {
    /// Attempts per notification, the first one included.
    pub max_attempts: u32,
    /// Delay after the first failed attempt, in milliseconds.
    pub initial_backoff_ms: u64,
    /// Backoff multiplier.
    pub backoff_multiplier: f64,
    /// Backoff ceiling, in milliseconds.
    pub max_backoff_ms: u64,
    /// Timeout of a single attempt, in seconds.
    pub attempt_timeout_secs: u64,
    /// How long pending notifications may drain at shutdown, in seconds.
    pub shutdown_grace_secs: u64,
}

impl Default for DispatchSettings {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff_ms: 500,
            backoff_multiplier: 2.0,
            max_backoff_ms: 30_000,
            attempt_timeout_secs: 10,
            shutdown_grace_secs: 5,
        }
    }
}

/// Kubernetes API access.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default, deny_unknown_fields)]
pub struct SourceSettings {
    /// API server URL. In-cluster settings are used when absent.
    pub api_server: Option<String>,
    /// File holding a bearer token.
    pub token_file: Option<PathBuf>,
    /// File holding the API server CA bundle.
    pub ca_file: Option<PathBuf>,
    /// Skip TLS verification.
    pub insecure: bool,
    /// Timeout of one sample acquisition, in seconds.
    pub timeout_secs: u64,
}

impl Default for SourceSettings {
    fn default() -> Self {
        Self {
            api_server: None,
            token_file: None,
            ca_file: None,
            insecure: false,
            timeout_secs: 10,
        }
    }
}

/// Usage limits of one entry, as Kubernetes quantities.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct LimitsEntry {
    /// Memory ceiling, e.g. `512Mi`.
    pub memory: Option<String>,
    /// CPU ceiling, e.g. `500m` or `2`.
    pub cpu: Option<String>,
    /// Overrides `defaults.hard_fail_multiplier`.
    pub hard_fail_multiplier: Option<f64>,
}

/// One watched entry.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct ResourceEntry {
    /// Resource type: `pod`, `deployment` or `pvc`.
    #[serde(rename = "type")]
    pub kind: ResourceKind,
    /// Object name. Exclusive with `selector`.
    #[serde(default)]
    pub name: Option<String>,
    /// Label selector, e.g. `app=api,tier=web`. Exclusive with `name`.
    #[serde(default)]
    pub selector: Option<String>,
    /// Namespace; `defaults.namespace` when absent.
    #[serde(default)]
    pub namespace: Option<String>,
    /// Poll interval in seconds; `defaults.interval_secs` when absent.
    #[serde(default)]
    pub interval_secs: Option<u64>,
    /// Logging; `defaults.logging` when absent.
    #[serde(default)]
    pub logging: Option<LoggingSettings>,
    /// Usage limits.
    #[serde(default)]
    pub limits: LimitsEntry,
    /// Webhook URL; `defaults.webhook_url` when absent.
    #[serde(default)]
    pub webhook_url: Option<String>,
}

impl ResourceEntry {
    fn label(&self) -> String {
        let what = self
            .name
            .as_deref()
            .or(self.selector.as_deref())
            .unwrap_or("?");
        format!("{} {what}", self.kind)
    }
}

/// The whole configuration document.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct WatchConfig {
    /// Shared defaults.
    #[serde(default)]
    pub defaults: Defaults,
    /// Delivery settings.
    #[serde(default)]
    pub dispatch: DispatchSettings,
    /// API access.
    #[serde(default)]
    pub source: SourceSettings,
    /// Watched entries.
    #[serde(default)]
    pub resources: Vec<ResourceEntry>,
}

impl WatchConfig {
    /// Loads and validates a configuration file.
    ///
    /// # Errors
    ///
    /// Returns `WatchError::ConfigurationInvalid` if the file cannot be read,
    /// parsed or validated.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            WatchError::config(format!(
                "failed to read config file '{}': {e}",
                path.display()
            ))
        })?;
        Self::from_yaml(&content)
    }

    /// Parses and validates a configuration document.
    ///
    /// # Errors
    ///
    /// Returns `WatchError::ConfigurationInvalid` if the YAML is malformed or invalid.
    pub fn from_yaml(content: &str) -> Result<Self> {
        let config: Self = serde_yaml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Checks every section.
    ///
    /// # Errors
    ///
    /// Returns `WatchError::ConfigurationInvalid` naming the first offending setting.
    pub fn validate(&self) -> Result<()> {
        self.validate_dispatch()?;
        if self.source.timeout_secs == 0 {
            return Err(WatchError::config("source.timeout_secs must be greater than 0"));
        }
        if let Some(server) = &self.source.api_server {
            check_http_url("source.api_server", server)?;
        }
        self.watched_resources().map(|_| ())
    }

    fn validate_dispatch(&self) -> Result<()> {
        let d = &self.dispatch;
        if d.max_attempts == 0 {
            return Err(WatchError::config("dispatch.max_attempts must be at least 1"));
        }
        if d.attempt_timeout_secs == 0 {
            return Err(WatchError::config(
                "dispatch.attempt_timeout_secs must be greater than 0",
            ));
        }
        if !(d.backoff_multiplier.is_finite() && d.backoff_multiplier >= 1.0) {
            return Err(WatchError::config(
                "dispatch.backoff_multiplier must be at least 1.0",
            ));
        }
        if d.max_backoff_ms < d.initial_backoff_ms {
            return Err(WatchError::config(
                "dispatch.max_backoff_ms must not be lower than dispatch.initial_backoff_ms",
            ));
        }
        Ok(())
    }

    /// Resolves every entry against the defaults.
    ///
    /// # Errors
    ///
    /// Returns `WatchError::ConfigurationInvalid` naming the offending entry.
    pub fn watched_resources(&self) -> Result<Vec<WatchedResource>> {
        if self.resources.is_empty() {
            return Err(WatchError::config("no resources configured"));
        }

        let mut seen: HashMap<ResourceRef, usize> = HashMap::new();
        let mut resolved = Vec::with_capacity(self.resources.len());
        for (index, entry) in self.resources.iter().enumerate() {
            let resource = self.resolve(entry).map_err(|reason| {
                WatchError::config(format!("resources[{index}] ({}): {reason}", entry.label()))
            })?;
            if let Some(first) = seen.insert(resource.target.clone(), index) {
                return Err(WatchError::config(format!(
                    "resources[{index}] ({}): duplicates resources[{first}]",
                    entry.label()
                )));
            }
            resolved.push(resource);
        }
        Ok(resolved)
    }

    fn resolve(&self, entry: &ResourceEntry) -> std::result::Result<WatchedResource, String> {
        let namespace = entry
            .namespace
            .clone()
            .unwrap_or_else(|| self.defaults.namespace.clone());
        if namespace.len() > MAX_NAMESPACE_LEN || !NAMESPACE_REGEX.is_match(&namespace) {
            return Err(format!("namespace '{namespace}' is not a valid namespace name"));
        }

        let selector = match (&entry.name, &entry.selector) {
            (Some(_), Some(_)) => return Err("set either name or selector, not both".to_string()),
            (None, None) => return Err("one of name or selector is required".to_string()),
            (Some(name), None) => {
                if name.len() > MAX_OBJECT_NAME_LEN || !OBJECT_NAME_REGEX.is_match(name) {
                    return Err(format!("name '{name}' is not a valid object name"));
                }
                Selector::Name(name.clone())
            }
            (None, Some(labels)) => {
                let labels = labels.trim();
                if labels.is_empty() {
                    return Err("selector cannot be empty".to_string());
                }
                Selector::Labels(labels.to_string())
            }
        };

        let interval_secs = entry.interval_secs.unwrap_or(self.defaults.interval_secs);
        if interval_secs == 0 {
            return Err("interval_secs must be greater than 0".to_string());
        }

        let webhook_url = entry
            .webhook_url
            .as_ref()
            .or(self.defaults.webhook_url.as_ref())
            .ok_or_else(|| "webhook_url is required (per entry or in defaults)".to_string())?;
        check_http_url("webhook_url", webhook_url).map_err(|e| reason_of(&e))?;

        let limits = self.resolve_limits(entry)?;

        Ok(WatchedResource {
            target: ResourceRef {
                kind: entry.kind,
                namespace,
                selector,
            },
            interval: Duration::from_secs(interval_secs),
            logging: entry.logging.unwrap_or(self.defaults.logging),
            limits,
            webhook_url: webhook_url.clone(),
        })
    }

    fn resolve_limits(&self, entry: &ResourceEntry) -> std::result::Result<ResourceLimits, String> {
        let raw = &entry.limits;
        if !entry.kind.has_usage() && (raw.memory.is_some() || raw.cpu.is_some()) {
            return Err(format!("{} resources do not support cpu or memory limits", entry.kind));
        }

        let memory_bytes = raw
            .memory
            .as_deref()
            .map(parse_memory)
            .transpose()
            .map_err(|e| format!("limits.memory: {}", reason_of(&e)))?;
        let cpu_millicores = raw
            .cpu
            .as_deref()
            .map(parse_cpu)
            .transpose()
            .map_err(|e| format!("limits.cpu: {}", reason_of(&e)))?;
        if memory_bytes == Some(0) || cpu_millicores == Some(0) {
            return Err("limits must be greater than zero".to_string());
        }

        let hard_fail_multiplier = raw
            .hard_fail_multiplier
            .unwrap_or(self.defaults.hard_fail_multiplier);
        if !(hard_fail_multiplier.is_finite() && hard_fail_multiplier >= 1.0) {
            return Err(format!(
                "hard_fail_multiplier must be at least 1.0, got {hard_fail_multiplier}"
            ));
        }

        Ok(ResourceLimits {
            memory_bytes,
            cpu_millicores,
            hard_fail_multiplier,
        })
    }

    /// Returns the engine settings.
    #[must_use]
    pub fn watcher_config(&self) -> WatcherConfig {
        let d = &self.dispatch;
        WatcherConfig::default()
            .with_source_timeout(Duration::from_secs(self.source.timeout_secs))
            .with_shutdown_grace(Duration::from_secs(d.shutdown_grace_secs))
            .with_retry(RetryPolicy {
                max_attempts: d.max_attempts,
                initial_backoff: Duration::from_millis(d.initial_backoff_ms),
                backoff_multiplier: d.backoff_multiplier,
                max_backoff: Duration::from_millis(d.max_backoff_ms),
                attempt_timeout: Duration::from_secs(d.attempt_timeout_secs),
            })
    }

    /// Returns how long a single webhook attempt may take.
    #[must_use]
    pub const fn attempt_timeout(&self) -> Duration {
        Duration::from_secs(self.dispatch.attempt_timeout_secs)
    }

    /// Returns the Kubernetes API settings, falling back to in-cluster ones.
    ///
    /// # Errors
    ///
    /// Returns `WatchError::ConfigurationInvalid` if credentials cannot be read.
    pub fn kube_config(&self) -> Result<KubeConfig> {
        let s = &self.source;
        let mut config = match &s.api_server {
            Some(server) => KubeConfig::new(server.clone()),
            None => KubeConfig::in_cluster()?,
        };
        if let Some(token) = &s.token_file {
            config = config.with_token_file(token)?;
        }
        if let Some(ca) = &s.ca_file {
            config = config.with_ca_file(ca)?;
        }
        Ok(config
            .with_insecure(s.insecure)
            .with_timeout(Duration::from_secs(s.timeout_secs)))
    }
}

fn check_http_url(field: &str, value: &str) -> Result<()> {
    let url = url::Url::parse(value)
        .map_err(|e| WatchError::config(format!("{field} '{value}' is not a valid URL: {e}")))?;
    if !matches!(url.scheme(), "http" | "https") {
        return Err(WatchError::config(format!(
            "{field} '{value}' must use http or https"
        )));
    }
    Ok(())
}

fn reason_of(err: &WatchError) -> String {
    match err {
        WatchError::ConfigurationInvalid { reason } => reason.clone(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::logging::LogLevel;
    use std::io::Write;
    use tempfile::NamedTempFile;

    const HOOK: &str = "https://chat.example.com/hooks/abc";

    fn create_temp_config(content: &str) -> NamedTempFile {
        let mut file = NamedTempFile::new().expect("failed to create temp file");
        file.write_all(content.as_bytes())
            .expect("failed to write temp file");
        file
    }

    fn expect_invalid(yaml: &str, needle: &str) {
        let err = WatchConfig::from_yaml(yaml).unwrap_err();
        assert!(
            matches!(err, WatchError::ConfigurationInvalid { .. }),
            "unexpected error {err:?}"
        );
        assert!(
            err.to_string().contains(needle),
            "'{err}' does not mention '{needle}'"
        );
    }

    mod parse_tests {
        use super::*;

        #[test]
        fn minimal_config_uses_defaults() {
            let yaml = format!(
                "defaults:\n  webhook_url: {HOOK}\nresources:\n  - type: pod\n    name: api\n"
            );
            let config = WatchConfig::from_yaml(&yaml).unwrap();
            let resources = config.watched_resources().unwrap();

            assert_eq!(resources.len(), 1);
            let api = &resources[0];
            assert_eq!(api.target, ResourceRef::named(ResourceKind::Pod, "default", "api"));
            assert_eq!(api.interval, Duration::from_secs(30));
            assert_eq!(api.webhook_url, HOOK);
            assert!(api.logging.enabled);
            assert_eq!(api.limits, ResourceLimits::default());
            assert_eq!(config.dispatch, DispatchSettings::default());
        }

        #[test]
        fn full_config() {
            let yaml = r"
defaults:
  interval_secs: 60
  webhook_url: https://chat.example.com/hooks/default
  hard_fail_multiplier: 3.0
  logging:
    level: warn
dispatch:
  max_attempts: 5
  initial_backoff_ms: 250
  max_backoff_ms: 10000
  attempt_timeout_secs: 4
  shutdown_grace_secs: 2
source:
  api_server: https://10.0.0.1:6443
  insecure: true
  timeout_secs: 3
resources:
  - type: pod
    name: api
    namespace: prod
    interval_secs: 15
    logging:
      enabled: true
      level: debug
    limits:
      memory: 512Mi
      cpu: 500m
  - type: deployment
    selector: app=web,tier=front
    namespace: prod
    limits:
      cpu: '2'
      hard_fail_multiplier: 1.5
    webhook_url: https://chat.example.com/hooks/web
  - type: pvc
    name: data
    namespace: prod
    logging:
      enabled: false
";
            let config = WatchConfig::from_yaml(yaml).unwrap();
            let resources = config.watched_resources().unwrap();

            let api = &resources[0];
            assert_eq!(api.interval, Duration::from_secs(15));
            assert_eq!(api.logging.level, LogLevel::Debug);
            assert_eq!(api.limits.memory_bytes, Some(512 * 1024 * 1024));
            assert_eq!(api.limits.cpu_millicores, Some(500));
            assert!((api.limits.hard_fail_multiplier - 3.0).abs() < f64::EPSILON);
            assert_eq!(api.webhook_url, "https://chat.example.com/hooks/default");

            let web = &resources[1];
            assert_eq!(
                web.target,
                ResourceRef::labelled(ResourceKind::Deployment, "prod", "app=web,tier=front")
            );
            assert_eq!(web.interval, Duration::from_secs(60));
            assert_eq!(web.logging.level, LogLevel::Warn);
            assert_eq!(web.limits.cpu_millicores, Some(2000));
            assert!((web.limits.hard_fail_multiplier - 1.5).abs() < f64::EPSILON);
            assert_eq!(web.webhook_url, "https://chat.example.com/hooks/web");

            let data = &resources[2];
            assert_eq!(data.target.kind, ResourceKind::Pvc);
            assert!(!data.logging.enabled);

            let watcher = config.watcher_config();
            assert_eq!(watcher.source_timeout, Duration::from_secs(3));
            assert_eq!(watcher.shutdown_grace, Duration::from_secs(2));
            assert_eq!(watcher.retry.max_attempts, 5);
            assert_eq!(watcher.retry.initial_backoff, Duration::from_millis(250));
            assert_eq!(watcher.retry.attempt_timeout, Duration::from_secs(4));

            let kube = config.kube_config().unwrap();
            assert_eq!(kube.api_server, "https://10.0.0.1:6443");
            assert!(kube.insecure);
            assert_eq!(kube.timeout, Duration::from_secs(3));
        }

        #[test]
        fn loads_from_file() {
            let file = create_temp_config(&format!(
                "defaults:\n  webhook_url: {HOOK}\n\
                 resources:\n  - type: deployment\n    name: web\n"
            ));
            let config = WatchConfig::from_file(file.path()).unwrap();
            assert_eq!(config.resources.len(), 1);
        }

        #[test]
        fn token_file_is_read() {
            let token = create_temp_config("my-token\n");
            let yaml = format!(
                "source:\n  api_server: https://k8s.local\n  token_file: {}\n\
                 defaults:\n  webhook_url: {HOOK}\n\
                 resources:\n  - type: pod\n    name: api\n",
                token.path().display()
            );
            let kube = WatchConfig::from_yaml(&yaml).unwrap().kube_config().unwrap();
            assert_eq!(kube.token.as_deref(), Some("my-token"));
        }

        #[test]
        fn missing_file_is_config_error() {
            let err = WatchConfig::from_file("/nonexistent/clawwatch.yaml").unwrap_err();
            assert!(err.to_string().contains("failed to read config file"));
        }
    }

    mod validation_tests {
        use super::*;

        fn with_entry(entry: &str) -> String {
            format!("defaults:\n  webhook_url: {HOOK}\nresources:\n{entry}")
        }

        #[test]
        fn malformed_yaml() {
            expect_invalid("resources: [", "invalid YAML");
        }

        #[test]
        fn unknown_field() {
            expect_invalid(
                &with_entry("  - type: pod\n    name: api\n    colour: blue\n"),
                "colour",
            );
        }

        #[test]
        fn unknown_type() {
            expect_invalid(&with_entry("  - type: statefulset\n    name: api\n"), "statefulset");
        }

        #[test]
        fn no_resources() {
            expect_invalid(&format!("defaults:\n  webhook_url: {HOOK}\n"), "no resources");
        }

        #[test]
        fn name_and_selector_are_exclusive() {
            expect_invalid(
                &with_entry("  - type: pod\n    name: api\n    selector: app=api\n"),
                "not both",
            );
            expect_invalid(&with_entry("  - type: pod\n    namespace: prod\n"), "required");
        }

        #[test]
        fn invalid_names() {
            expect_invalid(
                &with_entry("  - type: pod\n    name: Api_Server\n"),
                "not a valid object name",
            );
            expect_invalid(
                &with_entry("  - type: pod\n    name: api\n    namespace: Prod\n"),
                "not a valid namespace",
            );
        }

        #[test]
        fn zero_interval() {
            expect_invalid(
                &with_entry("  - type: pod\n    name: api\n    interval_secs: 0\n"),
                "resources[0] (pod api): interval_secs",
            );
        }

        #[test]
        fn webhook_required_and_checked() {
            expect_invalid("resources:\n  - type: pod\n    name: api\n", "webhook_url is required");
            expect_invalid(
                &with_entry("  - type: pod\n    name: api\n    webhook_url: ftp://example.com/x\n"),
                "must use http or https",
            );
        }

        #[test]
        fn bad_limits() {
            expect_invalid(
                &with_entry("  - type: pod\n    name: api\n    limits:\n      memory: lots\n"),
                "limits.memory",
            );
            expect_invalid(
                &with_entry("  - type: pod\n    name: api\n    limits:\n      cpu: 0m\n"),
                "greater than zero",
            );
            expect_invalid(
                &with_entry(
                    "  - type: pod\n    name: api\n    limits:\n      memory: 1Gi\n\
                     \x20     hard_fail_multiplier: 0.5\n",
                ),
                "at least 1.0",
            );
        }

        #[test]
        fn pvc_rejects_usage_limits() {
            expect_invalid(
                &with_entry("  - type: pvc\n    name: data\n    limits:\n      memory: 1Gi\n"),
                "do not support",
            );
        }

        #[test]
        fn duplicates_are_rejected() {
            expect_invalid(
                &with_entry(
                    "  - type: pod\n    name: api\n\
                     \x20 - type: pod\n    name: api\n    interval_secs: 5\n",
                ),
                "resources[1] (pod api): duplicates resources[0]",
            );
        }

        #[test]
        fn dispatch_bounds() {
            let yaml = format!(
                "dispatch:\n  max_attempts: 0\n{}",
                with_entry("  - type: pod\n    name: api\n")
            );
            expect_invalid(&yaml, "max_attempts");
        }

        #[test]
        fn api_server_must_be_http() {
            let yaml = format!(
                "source:\n  api_server: unix:///var/run/k8s.sock\n{}",
                with_entry("  - type: pod\n    name: api\n")
            );
            expect_invalid(&yaml, "source.api_server");
        }
    }
}
