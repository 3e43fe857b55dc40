//! Capability contract against the container-orchestration substrate.
//!
//! The control plane manages exactly two resource kinds per function: a
//! one-shot build job and a long-running deployment (fronted by a service).
//! Everything it needs from the substrate (create/delete, filtered watches,
//! pod listing and log streams) is expressed through the [`Substrate`]
//! trait so the lifecycle and reconciliation logic never touch a concrete
//! client.

pub mod api;
pub mod image;
pub mod mock;

pub use api::RestSubstrate;
pub use image::{build_context, image_name, BuildContext};
pub use mock::MockSubstrate;

use std::collections::HashMap;

use async_trait::async_trait;
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::model::Language;

#[derive(Error, Debug)]
pub enum SubstrateError {
    #[error("Resource '{0}' already exists")]
    AlreadyExists(String),

    #[error("Resource '{0}' not found")]
    NotFound(String),

    #[error("Substrate API error: {0}")]
    Api(String),
}

/// Single-key equality filter scoping a watch or list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LabelSelector {
    pub key: String,
    pub value: String,
}

impl LabelSelector {
    pub fn matching(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
        }
    }

    /// Selector for a function's build-job pods.
    pub fn builder(function_id: impl Into<String>) -> Self {
        Self::matching("builder", function_id)
    }

    /// Selector for a function's serving pods and deployment.
    pub fn app(function_id: impl Into<String>) -> Self {
        Self::matching("app", function_id)
    }

    pub fn matches(&self, labels: &HashMap<String, String>) -> bool {
        labels.get(&self.key) == Some(&self.value)
    }
}

impl std::fmt::Display for LabelSelector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}={}", self.key, self.value)
    }
}

/// Phase of a pod reported by the substrate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PodPhase {
    Pending,
    Running,
    Succeeded,
    Failed,
}

/// Condition types attached to a deployment status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConditionType {
    Progressing,
    Available,
    ReplicaFailure,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeploymentCondition {
    #[serde(rename = "type")]
    pub kind: ConditionType,
    pub message: String,
}

/// Deployment status snapshot as emitted by a watch. `desired_replicas` is
/// the spec value the status counts are measured against.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeploymentState {
    pub name: String,
    #[serde(rename = "updatedReplicas")]
    pub updated_replicas: i32,
    pub replicas: i32,
    #[serde(rename = "availableReplicas")]
    pub available_replicas: i32,
    #[serde(rename = "observedGeneration")]
    pub observed_generation: i64,
    pub generation: i64,
    #[serde(rename = "desiredReplicas")]
    pub desired_replicas: i32,
    /// Most recent condition first.
    pub conditions: Vec<DeploymentCondition>,
}

/// Pod status snapshot as emitted by a watch.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PodState {
    pub name: String,
    pub phase: PodPhase,
    #[serde(default)]
    pub message: String,
}

/// One event from a filtered watch stream.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ResourceEvent {
    Pod(PodState),
    Deployment(DeploymentState),
}

/// A pod returned by a list call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PodInfo {
    pub name: String,
    #[serde(default)]
    pub labels: HashMap<String, String>,
}

/// An open watch on the substrate. Receiving ends here; `stop` releases the
/// server-side watch and the worker feeding the channel. Dropping the
/// subscription releases it as well, but callers that finish with a watch
/// stop it explicitly.
pub struct WatchSubscription {
    events: mpsc::Receiver<ResourceEvent>,
    cancel: CancellationToken,
}

impl WatchSubscription {
    pub fn new(events: mpsc::Receiver<ResourceEvent>, cancel: CancellationToken) -> Self {
        Self { events, cancel }
    }

    /// Next event, or `None` once the stream is closed.
    pub async fn next(&mut self) -> Option<ResourceEvent> {
        self.events.recv().await
    }

    /// Release the underlying watch.
    pub fn stop(&self) {
        self.cancel.cancel();
    }
}

impl Drop for WatchSubscription {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// Byte-chunk stream of one pod's logs. An empty chunk means "nothing new
/// yet" on a follow stream; `None` is end-of-stream.
pub type LogStream = BoxStream<'static, std::io::Result<Vec<u8>>>;

/// Everything needed to run a one-shot image build on the substrate.
#[derive(Debug, Clone)]
pub struct BuildJobSpec {
    /// Job resource name, scoped per function (`build-<id>`).
    pub name: String,
    /// `builder=<functionId>` label for watch filtering.
    pub labels: HashMap<String, String>,
    pub language: Language,
    /// Fully qualified destination image tag.
    pub image: String,
    /// Rendered build context (source, Dockerfile, manifest, credentials).
    pub context: BuildContext,
}

#[derive(Debug, Clone)]
pub struct DeploymentSpec {
    /// Deployment name == function id.
    pub name: String,
    pub labels: HashMap<String, String>,
    pub image: String,
    pub replicas: i32,
    pub container_port: u16,
}

#[derive(Debug, Clone)]
pub struct ServiceSpec {
    /// `<prefix>-<functionId>-srv`.
    pub name: String,
    pub selector: HashMap<String, String>,
    pub port: u16,
}

/// Derived name of a function's build job.
pub fn build_job_name(function_id: &str) -> String {
    format!("build-{}", function_id)
}

/// Derived name of a function's service.
pub fn service_name(prefix: &str, function_id: &str) -> String {
    format!("{}-{}-srv", prefix, function_id)
}

/// The substrate client facade.
#[async_trait]
pub trait Substrate: Send + Sync {
    async fn create_namespace(&self, name: &str) -> Result<(), SubstrateError>;

    async fn create_build_job(&self, spec: &BuildJobSpec) -> Result<(), SubstrateError>;
    async fn delete_build_job(&self, name: &str) -> Result<(), SubstrateError>;

    async fn create_deployment(&self, spec: &DeploymentSpec) -> Result<(), SubstrateError>;
    async fn create_service(&self, spec: &ServiceSpec) -> Result<(), SubstrateError>;
    async fn delete_deployment(&self, name: &str) -> Result<(), SubstrateError>;
    async fn delete_service(&self, name: &str) -> Result<(), SubstrateError>;

    /// Touch the deployment's pod-template annotation with the current
    /// timestamp so the substrate replaces its pods.
    async fn trigger_rolling_update(&self, deployment: &str) -> Result<(), SubstrateError>;

    async fn watch_pods(
        &self,
        selector: &LabelSelector,
    ) -> Result<WatchSubscription, SubstrateError>;

    async fn watch_deployments(
        &self,
        selector: &LabelSelector,
    ) -> Result<WatchSubscription, SubstrateError>;

    async fn list_pods(&self, selector: &LabelSelector) -> Result<Vec<PodInfo>, SubstrateError>;

    async fn stream_pod_logs(&self, pod: &str, follow: bool)
        -> Result<LogStream, SubstrateError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_selector_display() {
        assert_eq!(LabelSelector::builder("abc").to_string(), "builder=abc");
        assert_eq!(LabelSelector::app("abc").to_string(), "app=abc");
    }

    #[test]
    fn test_selector_matches() {
        let selector = LabelSelector::app("fn-1");

        let mut labels = HashMap::new();
        labels.insert("app".to_string(), "fn-1".to_string());
        labels.insert("tier".to_string(), "web".to_string());
        assert!(selector.matches(&labels));

        labels.insert("app".to_string(), "fn-2".to_string());
        assert!(!selector.matches(&labels));
    }

    #[test]
    fn test_resource_names() {
        assert_eq!(build_job_name("abc"), "build-abc");
        assert_eq!(service_name("cloudfn", "abc"), "cloudfn-abc-srv");
    }
}
