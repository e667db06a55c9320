//! Kubernetes API resource source.
//!
//! [`KubeApiSource`] reads pods, deployments and persistent volume claims from
//! the core and `apps/v1` APIs, and pod usage from `metrics.k8s.io/v1beta1`.
//!
//! Status mapping:
//! - pods: `Running` and ready is running; crash-looping or image-pull failures
//!   are failed regardless of phase; several pods combine to the worst status
//! - deployments: all desired replicas ready is running, an exceeded progress
//!   deadline is failed, anything else is pending
//! - claims: `Bound` is running, `Lost` is failed
//! - no object matching a label selector is missing

use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;
use std::time::Duration;

use reqwest::header::{AUTHORIZATION, HeaderMap, HeaderValue};
use serde::Deserialize;
use serde::de::DeserializeOwned;
use tracing::debug;
use url::Url;

use crate::error::{Result, SourceError, WatchError};
use crate::quantity::{parse_cpu, parse_memory};
use crate::source::{ResourceSource, SourceFuture};
use crate::types::{ResourceKind, ResourceRef, ResourceStatus, ResourceUsage, Selector};

/// Service account mount inside a pod.
pub const SERVICE_ACCOUNT_DIR: &str = "/var/run/secrets/kubernetes.io/serviceaccount";

const CRASH_REASONS: &[&str] = &[
    "CrashLoopBackOff",
    "ImagePullBackOff",
    "ErrImagePull",
    "CreateContainerConfigError",
    "InvalidImageName",
];

/// Connection settings for the Kubernetes API.
#[derive(Clone, Default)]
pub struct KubeConfig {
    /// API server base URL.
    pub api_server: String,
    /// Bearer token.
    pub token: Option<String>,
    /// PEM-encoded CA bundle for the API server certificate.
    pub ca_pem: Option<Vec<u8>>,
    /// Skip TLS verification.
    pub insecure: bool,
    /// Per-request timeout.
    pub timeout: Duration,
}

impl fmt::Debug for KubeConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KubeConfig")
            .field("api_server", &self.api_server)
            .field("token", &self.token.as_ref().map(|_| "<redacted>"))
            .field("ca_pem", &self.ca_pem.as_ref().map(Vec::len))
            .field("insecure", &self.insecure)
            .field("timeout", &self.timeout)
            .finish()
    }
}

impl KubeConfig {
    /// Creates settings for `api_server` with no credentials.
    #[must_use]
    pub fn new(api_server: impl Into<String>) -> Self {
        Self {
            api_server: api_server.into(),
            token: None,
            ca_pem: None,
            insecure: false,
            timeout: Duration::from_secs(10),
        }
    }

    /// Reads the in-cluster settings from the service account mount and the
    /// `KUBERNETES_SERVICE_HOST`/`KUBERNETES_SERVICE_PORT` variables.
    ///
    /// # Errors
    ///
    /// Returns `WatchError::ConfigurationInvalid` when not running in a pod.
    pub fn in_cluster() -> Result<Self> {
        let host = std::env::var("KUBERNETES_SERVICE_HOST").map_err(|_| {
            WatchError::config(
                "KUBERNETES_SERVICE_HOST is not set; \
                 set source.api_server when running outside a cluster",
            )
        })?;
        let port = std::env::var("KUBERNETES_SERVICE_PORT").unwrap_or_else(|_| "443".to_string());
        let host = if host.contains(':') {
            format!("[{host}]")
        } else {
            host
        };

        let dir = Path::new(SERVICE_ACCOUNT_DIR);
        let mut config = Self::new(format!("https://{host}:{port}"))
            .with_token_file(&dir.join("token"))?;
        let ca = dir.join("ca.crt");
        if ca.exists() {
            config = config.with_ca_file(&ca)?;
        }
        Ok(config)
    }

    /// Sets the bearer token.
    #[must_use]
    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.token = Some(token.into());
        self
    }

    /// Reads the bearer token from a file.
    ///
    /// # Errors
    ///
    /// Returns `WatchError::ConfigurationInvalid` if the file cannot be read.
    pub fn with_token_file(self, path: &Path) -> Result<Self> {
        let token = std::fs::read_to_string(path).map_err(|e| {
            WatchError::config(format!("cannot read token file {}: {e}", path.display()))
        })?;
        Ok(self.with_token(token.trim()))
    }

    /// Reads the CA bundle from a file.
    ///
    /// # Errors
    ///
    /// Returns `WatchError::ConfigurationInvalid` if the file cannot be read.
    pub fn with_ca_file(mut self, path: &Path) -> Result<Self> {
        let pem = std::fs::read(path).map_err(|e| {
            WatchError::config(format!("cannot read CA file {}: {e}", path.display()))
        })?;
        self.ca_pem = Some(pem);
        Ok(self)
    }

    /// Disables TLS verification.
    #[must_use]
    pub const fn with_insecure(mut self, insecure: bool) -> Self {
        self.insecure = insecure;
        self
    }

    /// Sets the per-request timeout.
    #[must_use]
    pub const fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

/// [`ResourceSource`] backed by the Kubernetes REST API.
#[derive(Debug, Clone)]
pub struct KubeApiSource {
    base: Url,
    client: reqwest::Client,
}

impl KubeApiSource {
    /// Builds the HTTP client for `config`.
    ///
    /// # Errors
    ///
    /// Returns `WatchError::ConfigurationInvalid` for a malformed server URL,
    /// token or CA bundle.
    pub fn new(config: &KubeConfig) -> Result<Self> {
        let base = Url::parse(&config.api_server).map_err(|e| {
            WatchError::config(format!("invalid API server URL '{}': {e}", config.api_server))
        })?;

        let mut headers = HeaderMap::new();
        if let Some(token) = &config.token {
            let mut value = HeaderValue::from_str(&format!("Bearer {token}"))
                .map_err(|_| WatchError::config("token contains invalid characters"))?;
            value.set_sensitive(true);
            headers.insert(AUTHORIZATION, value);
        }

        let mut builder = reqwest::Client::builder()
            .default_headers(headers)
            .timeout(config.timeout)
            .danger_accept_invalid_certs(config.insecure);
        if let Some(pem) = &config.ca_pem {
            let cert = reqwest::Certificate::from_pem(pem)
                .map_err(|e| WatchError::config(format!("invalid CA bundle: {e}")))?;
            builder = builder.add_root_certificate(cert);
        }
        let client = builder
            .build()
            .map_err(|e| WatchError::config(format!("failed to build HTTP client: {e}")))?;

        Ok(Self { base, client })
    }

    /// Returns the API server base URL.
    #[must_use]
    pub const fn base_url(&self) -> &Url {
        &self.base
    }

    async fn get<T: DeserializeOwned>(
        &self,
        target: &ResourceRef,
        path: &str,
        label_selector: Option<&str>,
    ) -> std::result::Result<T, SourceError> {
        let url = self.base.join(path).map_err(|e| SourceError::Unavailable {
            reason: format!("invalid request path {path}: {e}"),
        })?;
        let mut request = self.client.get(url);
        if let Some(selector) = label_selector {
            request = request.query(&[("labelSelector", selector)]);
        }

        debug!(resource = %target, path, "querying API server");
        let response = request.send().await.map_err(transport_error)?;
        let status = response.status();
        if status == reqwest::StatusCode::NOT_FOUND {
            return Err(SourceError::NotFound {
                resource: target.to_string(),
            });
        }
        if !status.is_success() {
            return Err(SourceError::Unavailable {
                reason: format!("GET {path} returned HTTP {}", status.as_u16()),
            });
        }
        response.json::<T>().await.map_err(|e| SourceError::Unavailable {
            reason: format!("GET {path} returned an unreadable body: {e}"),
        })
    }

    async fn pod_status(
        &self,
        target: &ResourceRef,
    ) -> std::result::Result<ResourceStatus, SourceError> {
        let ns = &target.namespace;
        match &target.selector {
            Selector::Name(name) => {
                let pod: Pod = self
                    .get(target, &format!("/api/v1/namespaces/{ns}/pods/{name}"), None)
                    .await?;
                Ok(pod.resource_status())
            }
            Selector::Labels(labels) => {
                let pods: List<Pod> = self
                    .get(target, &format!("/api/v1/namespaces/{ns}/pods"), Some(labels))
                    .await?;
                Ok(combine(pods.items.iter().map(Pod::resource_status)))
            }
        }
    }

    async fn deployments(
        &self,
        target: &ResourceRef,
    ) -> std::result::Result<Vec<Deployment>, SourceError> {
        let base = format!("/apis/apps/v1/namespaces/{}/deployments", target.namespace);
        match &target.selector {
            Selector::Name(name) => {
                let deployment: Deployment =
                    self.get(target, &format!("{base}/{name}"), None).await?;
                Ok(vec![deployment])
            }
            Selector::Labels(labels) => {
                let list: List<Deployment> = self.get(target, &base, Some(labels)).await?;
                Ok(list.items)
            }
        }
    }

    async fn pvc_status(
        &self,
        target: &ResourceRef,
    ) -> std::result::Result<ResourceStatus, SourceError> {
        let base = format!("/api/v1/namespaces/{}/persistentvolumeclaims", target.namespace);
        match &target.selector {
            Selector::Name(name) => {
                let claim: Claim = self.get(target, &format!("{base}/{name}"), None).await?;
                Ok(claim.resource_status())
            }
            Selector::Labels(labels) => {
                let claims: List<Claim> = self.get(target, &base, Some(labels)).await?;
                Ok(combine(claims.items.iter().map(Claim::resource_status)))
            }
        }
    }

    async fn pod_usage(
        &self,
        target: &ResourceRef,
        selector: &Selector,
    ) -> std::result::Result<ResourceUsage, SourceError> {
        let ns = &target.namespace;
        let base = format!("/apis/metrics.k8s.io/v1beta1/namespaces/{ns}/pods");
        // The pod itself was found by the status call; a 404 here means the
        // metrics server has not scraped it yet.
        let not_ready = |e: SourceError| match e {
            SourceError::NotFound { resource } => SourceError::MetricsNotReady { resource },
            other => other,
        };
        let metrics = match selector {
            Selector::Name(name) => {
                let one: PodMetrics = self
                    .get(target, &format!("{base}/{name}"), None)
                    .await
                    .map_err(not_ready)?;
                vec![one]
            }
            Selector::Labels(labels) => {
                let list: List<PodMetrics> = self
                    .get(target, &base, Some(labels))
                    .await
                    .map_err(not_ready)?;
                list.items
            }
        };
        sum_usage(&metrics)
    }
}

fn transport_error(err: reqwest::Error) -> SourceError {
    if err.is_timeout() {
        SourceError::Unavailable {
            reason: format!("API request timed out: {err}"),
        }
    } else {
        SourceError::Unavailable {
            reason: format!("API request failed: {err}"),
        }
    }
}

impl ResourceSource for KubeApiSource {
    fn status<'a>(&'a self, target: &'a ResourceRef) -> SourceFuture<'a, ResourceStatus> {
        Box::pin(async move {
            match target.kind {
                ResourceKind::Pod => self.pod_status(target).await,
                ResourceKind::Deployment => {
                    let deployments = self.deployments(target).await?;
                    Ok(combine(deployments.iter().map(Deployment::resource_status)))
                }
                ResourceKind::Pvc => self.pvc_status(target).await,
            }
        })
    }

    fn usage<'a>(&'a self, target: &'a ResourceRef) -> SourceFuture<'a, ResourceUsage> {
        Box::pin(async move {
            match target.kind {
                ResourceKind::Pod => self.pod_usage(target, &target.selector).await,
                ResourceKind::Deployment => {
                    let mut total = ResourceUsage::new(0, 0);
                    for deployment in self.deployments(target).await? {
                        let query = deployment.spec.selector.to_query();
                        if query.is_empty() {
                            continue;
                        }
                        let selector = Selector::Labels(query);
                        let usage = self.pod_usage(target, &selector).await?;
                        total = total.saturating_add(usage);
                    }
                    Ok(total)
                }
                ResourceKind::Pvc => Err(SourceError::Unavailable {
                    reason: "persistent volume claims report no cpu or memory usage".to_string(),
                }),
            }
        })
    }
}

/// Combines several objects' statuses into one, worst first. Nothing is missing.
fn combine(statuses: impl IntoIterator<Item = ResourceStatus>) -> ResourceStatus {
    statuses
        .into_iter()
        .max_by_key(|s| match s {
            ResourceStatus::Succeeded => 0,
            ResourceStatus::Running => 1,
            ResourceStatus::Pending => 2,
            ResourceStatus::Unknown => 3,
            ResourceStatus::Missing => 4,
            ResourceStatus::Failed => 5,
        })
        .unwrap_or(ResourceStatus::Missing)
}

fn sum_usage(metrics: &[PodMetrics]) -> std::result::Result<ResourceUsage, SourceError> {
    let unreadable = |e: WatchError| SourceError::Unavailable {
        reason: format!("unreadable metrics quantity: {e}"),
    };
    let mut total = ResourceUsage::new(0, 0);
    for container in metrics.iter().flat_map(|m| &m.containers) {
        if let Some(cpu) = &container.usage.cpu {
            let cpu = parse_cpu(cpu).map_err(unreadable)?;
            total.cpu_millicores = total.cpu_millicores.saturating_add(cpu);
        }
        if let Some(memory) = &container.usage.memory {
            let memory = parse_memory(memory).map_err(unreadable)?;
            total.memory_bytes = total.memory_bytes.saturating_add(memory);
        }
    }
    Ok(total)
}

#[derive(Debug, Deserialize)]
struct List<T> {
    #[serde(default = "Vec::new")]
    items: Vec<T>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
struct ObjectMeta {
    name: String,
    deletion_timestamp: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
struct Condition {
    #[serde(rename = "type")]
    kind: String,
    status: String,
    reason: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct Pod {
    metadata: ObjectMeta,
    status: PodStatus,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
struct PodStatus {
    phase: Option<String>,
    conditions: Vec<Condition>,
    container_statuses: Vec<ContainerStatus>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct ContainerStatus {
    state: ContainerState,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct ContainerState {
    waiting: Option<Waiting>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct Waiting {
    reason: Option<String>,
}

impl Pod {
    fn crashing(&self) -> bool {
        self.status.container_statuses.iter().any(|c| {
            c.state
                .waiting
                .as_ref()
                .and_then(|w| w.reason.as_deref())
                .is_some_and(|reason| CRASH_REASONS.contains(&reason))
        })
    }

    fn ready(&self) -> bool {
        self.status
            .conditions
            .iter()
            .any(|c| c.kind == "Ready" && c.status == "True")
    }

    fn resource_status(&self) -> ResourceStatus {
        if self.crashing() {
            return ResourceStatus::Failed;
        }
        match self.status.phase.as_deref() {
            Some("Running") if self.metadata.deletion_timestamp.is_some() => {
                ResourceStatus::Pending
            }
            Some("Running") if self.ready() => ResourceStatus::Running,
            Some("Running" | "Pending") => ResourceStatus::Pending,
            Some("Succeeded") => ResourceStatus::Succeeded,
            Some("Failed") => ResourceStatus::Failed,
            _ => ResourceStatus::Unknown,
        }
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct Deployment {
    metadata: ObjectMeta,
    spec: DeploymentSpec,
    status: DeploymentStatus,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct DeploymentSpec {
    replicas: Option<u32>,
    selector: LabelSelector,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
struct LabelSelector {
    match_labels: BTreeMap<String, String>,
}

impl LabelSelector {
    fn to_query(&self) -> String {
        self.match_labels
            .iter()
            .map(|(k, v)| format!("{k}={v}"))
            .collect::<Vec<_>>()
            .join(",")
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
struct DeploymentStatus {
    ready_replicas: Option<u32>,
    conditions: Vec<Condition>,
}

impl Deployment {
    fn resource_status(&self) -> ResourceStatus {
        let desired = self.spec.replicas.unwrap_or(1);
        let ready = self.status.ready_replicas.unwrap_or(0);
        let stalled = self.status.conditions.iter().any(|c| {
            c.kind == "Progressing"
                && c.status == "False"
                && c.reason.as_deref() == Some("ProgressDeadlineExceeded")
        });

        if ready >= desired {
            ResourceStatus::Running
        } else if stalled {
            debug!(
                deployment = %self.metadata.name,
                ready,
                desired,
                "deployment progress deadline exceeded"
            );
            ResourceStatus::Failed
        } else {
            ResourceStatus::Pending
        }
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct Claim {
    status: ClaimStatus,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct ClaimStatus {
    phase: Option<String>,
}

impl Claim {
    fn resource_status(&self) -> ResourceStatus {
        match self.status.phase.as_deref() {
            Some("Bound") => ResourceStatus::Running,
            Some("Pending") => ResourceStatus::Pending,
            Some("Lost") => ResourceStatus::Failed,
            _ => ResourceStatus::Unknown,
        }
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct PodMetrics {
    containers: Vec<ContainerMetrics>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct ContainerMetrics {
    usage: Usage,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct Usage {
    cpu: Option<String>,
    memory: Option<String>,
}
