//! REST adapter for a Kubernetes-style substrate API.
//!
//! Talks plain HTTP (a `kubectl proxy`-style endpoint, or the API server
//! directly with a bearer token). Manifest rendering and watch-line parsing
//! are pure functions; the client methods only move bytes.
//!
//! A build job materializes as two resources sharing the job name: a
//! ConfigMap carrying the rendered build context and a kaniko executor pod
//! mounting it.

use async_trait::async_trait;
use futures::StreamExt;
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION};
use reqwest::StatusCode;
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::settings::Settings;

use super::{
    BuildJobSpec, ConditionType, DeploymentCondition, DeploymentSpec, DeploymentState,
    LabelSelector, LogStream, PodInfo, PodPhase, PodState, ResourceEvent, ServiceSpec, Substrate,
    SubstrateError, WatchSubscription,
};

const KANIKO_IMAGE: &str = "gcr.io/kaniko-project/executor:latest";

/// Annotation touched by [`Substrate::trigger_rolling_update`].
const RESTARTED_AT_ANNOTATION: &str = "cloudfn.dev/restartedAt";

pub struct RestSubstrate {
    client: reqwest::Client,
    base_url: String,
    namespace: String,
}

impl RestSubstrate {
    pub fn new(settings: &Settings) -> Result<Self, SubstrateError> {
        let mut headers = HeaderMap::new();
        if !settings.substrate_token.is_empty() {
            let value = HeaderValue::from_str(&format!("Bearer {}", settings.substrate_token))
                .map_err(|err| SubstrateError::Api(err.to_string()))?;
            headers.insert(AUTHORIZATION, value);
        }

        let client = reqwest::Client::builder()
            .default_headers(headers)
            .build()
            .map_err(|err| SubstrateError::Api(err.to_string()))?;

        Ok(Self {
            client,
            base_url: settings.substrate_api_url.trim_end_matches('/').to_string(),
            namespace: settings.namespace.clone(),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    fn pods_path(&self) -> String {
        format!("/api/v1/namespaces/{}/pods", self.namespace)
    }

    fn deployments_path(&self) -> String {
        format!("/apis/apps/v1/namespaces/{}/deployments", self.namespace)
    }

    async fn expect_success(
        name: &str,
        response: reqwest::Response,
    ) -> Result<(), SubstrateError> {
        match response.status() {
            status if status.is_success() => Ok(()),
            StatusCode::NOT_FOUND => Err(SubstrateError::NotFound(name.to_string())),
            StatusCode::CONFLICT => Err(SubstrateError::AlreadyExists(name.to_string())),
            status => {
                let body = response.text().await.unwrap_or_default();
                Err(SubstrateError::Api(format!("{}: {}", status, body)))
            }
        }
    }

    async fn create(&self, path: &str, name: &str, manifest: Value) -> Result<(), SubstrateError> {
        let response = self
            .client
            .post(self.url(path))
            .json(&manifest)
            .send()
            .await
            .map_err(|err| SubstrateError::Api(err.to_string()))?;
        Self::expect_success(name, response).await
    }

    async fn delete(&self, path: &str, name: &str) -> Result<(), SubstrateError> {
        let response = self
            .client
            .delete(self.url(&format!("{}/{}", path, name)))
            .send()
            .await
            .map_err(|err| SubstrateError::Api(err.to_string()))?;
        Self::expect_success(name, response).await
    }

    /// Open a chunked watch and feed parsed events into a subscription until
    /// it is released or the connection drops.
    async fn watch(
        &self,
        path: &str,
        selector: &LabelSelector,
        parse: fn(&Value) -> Option<ResourceEvent>,
    ) -> Result<WatchSubscription, SubstrateError> {
        let response = self
            .client
            .get(self.url(path))
            .query(&[
                ("watch", "true".to_string()),
                ("labelSelector", selector.to_string()),
            ])
            .send()
            .await
            .map_err(|err| SubstrateError::Api(err.to_string()))?;
        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(SubstrateError::Api(format!("{}: {}", status, body)));
        }

        let (tx, rx) = mpsc::channel(64);
        let cancel = CancellationToken::new();
        let token = cancel.clone();

        tokio::spawn(async move {
            let mut stream = response.bytes_stream();
            let mut buf: Vec<u8> = Vec::new();
            loop {
                let chunk = tokio::select! {
                    _ = token.cancelled() => return,
                    chunk = stream.next() => match chunk {
                        Some(Ok(chunk)) => chunk,
                        Some(Err(err)) => {
                            warn!(error = %err, "watch stream read failed");
                            return;
                        }
                        None => return,
                    },
                };
                buf.extend_from_slice(&chunk);
                while let Some(pos) = buf.iter().position(|&b| b == b'\n') {
                    let line: Vec<u8> = buf.drain(..=pos).collect();
                    if let Some(event) = parse_watch_line(&line, parse) {
                        if tx.send(event).await.is_err() {
                            return;
                        }
                    }
                }
            }
        });

        Ok(WatchSubscription::new(rx, cancel))
    }
}

/// One watch line is `{"type": ..., "object": {...}}`; blank and malformed
/// lines are skipped.
fn parse_watch_line(line: &[u8], parse: fn(&Value) -> Option<ResourceEvent>) -> Option<ResourceEvent> {
    let value: Value = serde_json::from_slice(line).ok()?;
    parse(value.get("object")?)
}

fn pod_event(object: &Value) -> Option<ResourceEvent> {
    let name = object["metadata"]["name"].as_str()?.to_string();
    let phase = match object["status"]["phase"].as_str()? {
        "Pending" => PodPhase::Pending,
        "Running" => PodPhase::Running,
        "Succeeded" => PodPhase::Succeeded,
        "Failed" => PodPhase::Failed,
        _ => return None,
    };
    let message = object["status"]["message"]
        .as_str()
        .unwrap_or_default()
        .to_string();
    Some(ResourceEvent::Pod(PodState {
        name,
        phase,
        message,
    }))
}

fn deployment_event(object: &Value) -> Option<ResourceEvent> {
    let name = object["metadata"]["name"].as_str()?.to_string();
    let status = &object["status"];

    // The API server appends conditions; newest-first here.
    let mut conditions: Vec<DeploymentCondition> = status["conditions"]
        .as_array()
        .map(|conditions| {
            conditions
                .iter()
                .filter_map(|c| {
                    let kind = match c["type"].as_str()? {
                        "Progressing" => ConditionType::Progressing,
                        "Available" => ConditionType::Available,
                        "ReplicaFailure" => ConditionType::ReplicaFailure,
                        _ => return None,
                    };
                    Some(DeploymentCondition {
                        kind,
                        message: c["message"].as_str().unwrap_or_default().to_string(),
                    })
                })
                .collect()
        })
        .unwrap_or_default();
    conditions.reverse();

    Some(ResourceEvent::Deployment(DeploymentState {
        name,
        updated_replicas: status["updatedReplicas"].as_i64().unwrap_or(0) as i32,
        replicas: status["replicas"].as_i64().unwrap_or(0) as i32,
        available_replicas: status["availableReplicas"].as_i64().unwrap_or(0) as i32,
        observed_generation: status["observedGeneration"].as_i64().unwrap_or(0),
        generation: object["metadata"]["generation"].as_i64().unwrap_or(0),
        desired_replicas: object["spec"]["replicas"].as_i64().unwrap_or(0) as i32,
        conditions,
    }))
}

fn namespace_manifest(name: &str) -> Value {
    json!({
        "apiVersion": "v1",
        "kind": "Namespace",
        "metadata": { "name": name }
    })
}

/// ConfigMap carrying the rendered build context; mounted into the kaniko
/// pod as both the workspace and the docker credential directory.
fn build_config_map_manifest(spec: &BuildJobSpec) -> Value {
    let mut data = serde_json::Map::new();
    data.insert(
        "Dockerfile".to_string(),
        Value::String(spec.context.dockerfile.clone()),
    );
    data.insert(
        spec.context.manifest_filename.to_string(),
        Value::String(spec.context.manifest.clone()),
    );
    data.insert(
        spec.context.source_filename.to_string(),
        Value::String(spec.context.source.clone()),
    );
    data.insert(
        "config.json".to_string(),
        Value::String(spec.context.docker_auth.clone()),
    );

    json!({
        "apiVersion": "v1",
        "kind": "ConfigMap",
        "metadata": { "name": spec.name, "labels": spec.labels },
        "data": data
    })
}

fn build_pod_manifest(spec: &BuildJobSpec) -> Value {
    json!({
        "apiVersion": "v1",
        "kind": "Pod",
        "metadata": { "name": spec.name, "labels": spec.labels },
        "spec": {
            "restartPolicy": "Never",
            "containers": [{
                "name": "builder",
                "image": KANIKO_IMAGE,
                "args": [
                    "--dockerfile=/workspace/Dockerfile",
                    "--context=dir:///workspace",
                    format!("--destination={}", spec.image),
                ],
                "volumeMounts": [
                    { "name": "workspace", "mountPath": "/workspace" },
                    { "name": "docker-config", "mountPath": "/kaniko/.docker" },
                ]
            }],
            "volumes": [
                {
                    "name": "workspace",
                    "configMap": {
                        "name": spec.name,
                        "items": [
                            { "key": "Dockerfile", "path": "Dockerfile" },
                            { "key": spec.context.manifest_filename, "path": spec.context.manifest_filename },
                            { "key": spec.context.source_filename, "path": spec.context.source_filename },
                        ]
                    }
                },
                {
                    "name": "docker-config",
                    "configMap": {
                        "name": spec.name,
                        "items": [{ "key": "config.json", "path": "config.json" }]
                    }
                }
            ]
        }
    })
}

fn deployment_manifest(spec: &DeploymentSpec) -> Value {
    json!({
        "apiVersion": "apps/v1",
        "kind": "Deployment",
        "metadata": { "name": spec.name, "labels": spec.labels },
        "spec": {
            "replicas": spec.replicas,
            "selector": { "matchLabels": spec.labels },
            "template": {
                "metadata": { "labels": spec.labels },
                "spec": {
                    "containers": [{
                        "name": "function",
                        "image": spec.image,
                        "ports": [{ "containerPort": spec.container_port }]
                    }]
                }
            }
        }
    })
}

fn service_manifest(spec: &ServiceSpec) -> Value {
    json!({
        "apiVersion": "v1",
        "kind": "Service",
        "metadata": { "name": spec.name },
        "spec": {
            "selector": spec.selector,
            "ports": [{ "port": spec.port, "targetPort": spec.port }]
        }
    })
}

fn restart_patch(timestamp: &str) -> Value {
    json!({
        "spec": {
            "template": {
                "metadata": {
                    "annotations": { RESTARTED_AT_ANNOTATION: timestamp }
                }
            }
        }
    })
}

#[async_trait]
impl Substrate for RestSubstrate {
    async fn create_namespace(&self, name: &str) -> Result<(), SubstrateError> {
        self.create("/api/v1/namespaces", name, namespace_manifest(name))
            .await
    }

    async fn create_build_job(&self, spec: &BuildJobSpec) -> Result<(), SubstrateError> {
        let config_maps = format!("/api/v1/namespaces/{}/configmaps", self.namespace);
        self.create(&config_maps, &spec.name, build_config_map_manifest(spec))
            .await?;
        self.create(&self.pods_path(), &spec.name, build_pod_manifest(spec))
            .await
    }

    async fn delete_build_job(&self, name: &str) -> Result<(), SubstrateError> {
        let config_maps = format!("/api/v1/namespaces/{}/configmaps", self.namespace);
        match self.delete(&config_maps, name).await {
            Ok(()) | Err(SubstrateError::NotFound(_)) => {}
            Err(err) => return Err(err),
        }
        self.delete(&self.pods_path(), name).await
    }

    async fn create_deployment(&self, spec: &DeploymentSpec) -> Result<(), SubstrateError> {
        self.create(&self.deployments_path(), &spec.name, deployment_manifest(spec))
            .await
    }

    async fn create_service(&self, spec: &ServiceSpec) -> Result<(), SubstrateError> {
        let services = format!("/api/v1/namespaces/{}/services", self.namespace);
        self.create(&services, &spec.name, service_manifest(spec))
            .await
    }

    async fn delete_deployment(&self, name: &str) -> Result<(), SubstrateError> {
        self.delete(&self.deployments_path(), name).await
    }

    async fn delete_service(&self, name: &str) -> Result<(), SubstrateError> {
        let services = format!("/api/v1/namespaces/{}/services", self.namespace);
        self.delete(&services, name).await
    }

    async fn trigger_rolling_update(&self, deployment: &str) -> Result<(), SubstrateError> {
        let url = self.url(&format!("{}/{}", self.deployments_path(), deployment));
        let patch = restart_patch(&chrono::Utc::now().to_rfc3339());
        let response = self
            .client
            .patch(url)
            .header("content-type", "application/strategic-merge-patch+json")
            .json(&patch)
            .send()
            .await
            .map_err(|err| SubstrateError::Api(err.to_string()))?;
        Self::expect_success(deployment, response).await
    }

    async fn watch_pods(
        &self,
        selector: &LabelSelector,
    ) -> Result<WatchSubscription, SubstrateError> {
        self.watch(&self.pods_path(), selector, pod_event).await
    }

    async fn watch_deployments(
        &self,
        selector: &LabelSelector,
    ) -> Result<WatchSubscription, SubstrateError> {
        self.watch(&self.deployments_path(), selector, deployment_event)
            .await
    }

    async fn list_pods(&self, selector: &LabelSelector) -> Result<Vec<PodInfo>, SubstrateError> {
        let response = self
            .client
            .get(self.url(&self.pods_path()))
            .query(&[("labelSelector", selector.to_string())])
            .send()
            .await
            .map_err(|err| SubstrateError::Api(err.to_string()))?;
        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(SubstrateError::Api(format!("{}: {}", status, body)));
        }

        let list: Value = response
            .json()
            .await
            .map_err(|err| SubstrateError::Api(err.to_string()))?;
        let pods = list["items"]
            .as_array()
            .map(|items| {
                items
                    .iter()
                    .filter_map(|item| {
                        Some(PodInfo {
                            name: item["metadata"]["name"].as_str()?.to_string(),
                            labels: serde_json::from_value(item["metadata"]["labels"].clone())
                                .unwrap_or_default(),
                        })
                    })
                    .collect()
            })
            .unwrap_or_default();
        Ok(pods)
    }

    async fn stream_pod_logs(
        &self,
        pod: &str,
        follow: bool,
    ) -> Result<LogStream, SubstrateError> {
        let response = self
            .client
            .get(self.url(&format!("{}/{}/log", self.pods_path(), pod)))
            .query(&[("follow", follow.to_string())])
            .send()
            .await
            .map_err(|err| SubstrateError::Api(err.to_string()))?;
        match response.status() {
            status if status.is_success() => {}
            StatusCode::NOT_FOUND => return Err(SubstrateError::NotFound(pod.to_string())),
            status => {
                let body = response.text().await.unwrap_or_default();
                return Err(SubstrateError::Api(format!("{}: {}", status, body)));
            }
        }

        let stream = response
            .bytes_stream()
            .map(|chunk| chunk.map(|bytes| bytes.to_vec()).map_err(std::io::Error::other));
        Ok(stream.boxed())
    }
}
