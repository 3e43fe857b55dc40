//! In-memory substrate for tests: records every create/delete and replays
//! scripted watch events and log chunks.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use futures::StreamExt;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::{
    BuildJobSpec, DeploymentSpec, LabelSelector, LogStream, PodInfo, ResourceEvent, ServiceSpec,
    Substrate, SubstrateError, WatchSubscription,
};

#[derive(Default)]
pub struct MockSubstrate {
    pub namespaces: Mutex<Vec<String>>,
    pub build_jobs: Mutex<Vec<BuildJobSpec>>,
    pub deleted_build_jobs: Mutex<Vec<String>>,
    pub deployments: Mutex<Vec<DeploymentSpec>>,
    pub services: Mutex<Vec<ServiceSpec>>,
    pub deleted_deployments: Mutex<Vec<String>>,
    pub deleted_services: Mutex<Vec<String>>,
    pub rolling_updates: Mutex<Vec<String>>,

    /// Scripts replayed by `watch_pods` / `watch_deployments`.
    pod_events: Mutex<Vec<ResourceEvent>>,
    deployment_events: Mutex<Vec<ResourceEvent>>,

    /// Pods returned by `list_pods`, filtered by selector.
    pods: Mutex<Vec<PodInfo>>,
    /// Per-pod log scripts; `Err` entries become read errors.
    pod_logs: Mutex<HashMap<String, Vec<Result<Vec<u8>, String>>>>,

    /// Tokens of every watch handed out, for leak assertions.
    watch_tokens: Mutex<Vec<CancellationToken>>,

    fail_create_deployment: AtomicBool,
    fail_delete_build_job: AtomicBool,
}

impl MockSubstrate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn script_pod_events(&self, events: Vec<ResourceEvent>) {
        *self.pod_events.lock().unwrap() = events;
    }

    pub fn script_deployment_events(&self, events: Vec<ResourceEvent>) {
        *self.deployment_events.lock().unwrap() = events;
    }

    pub fn register_pod(&self, name: &str, selector: &LabelSelector) {
        let mut labels = HashMap::new();
        labels.insert(selector.key.clone(), selector.value.clone());
        self.pods.lock().unwrap().push(PodInfo {
            name: name.to_string(),
            labels,
        });
    }

    pub fn script_pod_logs(&self, pod: &str, chunks: Vec<Result<Vec<u8>, String>>) {
        self.pod_logs
            .lock()
            .unwrap()
            .insert(pod.to_string(), chunks);
    }

    pub fn fail_create_deployment(&self) {
        self.fail_create_deployment.store(true, Ordering::SeqCst);
    }

    pub fn fail_delete_build_job(&self) {
        self.fail_delete_build_job.store(true, Ordering::SeqCst);
    }

    /// Watches handed out and not yet released.
    pub fn open_watch_count(&self) -> usize {
        self.watch_tokens
            .lock()
            .unwrap()
            .iter()
            .filter(|t| !t.is_cancelled())
            .count()
    }

    fn spawn_watch(&self, events: Vec<ResourceEvent>) -> WatchSubscription {
        let (tx, rx) = mpsc::channel(64);
        let cancel = CancellationToken::new();
        self.watch_tokens.lock().unwrap().push(cancel.clone());

        let token = cancel.clone();
        tokio::spawn(async move {
            for event in events {
                tokio::select! {
                    _ = token.cancelled() => return,
                    sent = tx.send(event) => {
                        if sent.is_err() {
                            return;
                        }
                    }
                }
            }
            // A real watch stays open after the last event; hold the sender
            // until the subscription is released.
            token.cancelled().await;
        });

        WatchSubscription::new(rx, cancel)
    }
}

#[async_trait]
impl Substrate for MockSubstrate {
    async fn create_namespace(&self, name: &str) -> Result<(), SubstrateError> {
        let mut namespaces = self.namespaces.lock().unwrap();
        if namespaces.iter().any(|n| n == name) {
            return Err(SubstrateError::AlreadyExists(name.to_string()));
        }
        namespaces.push(name.to_string());
        Ok(())
    }

    async fn create_build_job(&self, spec: &BuildJobSpec) -> Result<(), SubstrateError> {
        self.build_jobs.lock().unwrap().push(spec.clone());
        Ok(())
    }

    async fn delete_build_job(&self, name: &str) -> Result<(), SubstrateError> {
        if self.fail_delete_build_job.swap(false, Ordering::SeqCst) {
            return Err(SubstrateError::Api("delete refused".to_string()));
        }
        self.deleted_build_jobs.lock().unwrap().push(name.to_string());
        Ok(())
    }

    async fn create_deployment(&self, spec: &DeploymentSpec) -> Result<(), SubstrateError> {
        if self.fail_create_deployment.swap(false, Ordering::SeqCst) {
            return Err(SubstrateError::Api("create refused".to_string()));
        }
        self.deployments.lock().unwrap().push(spec.clone());
        Ok(())
    }

    async fn create_service(&self, spec: &ServiceSpec) -> Result<(), SubstrateError> {
        self.services.lock().unwrap().push(spec.clone());
        Ok(())
    }

    async fn delete_deployment(&self, name: &str) -> Result<(), SubstrateError> {
        self.deleted_deployments.lock().unwrap().push(name.to_string());
        Ok(())
    }

    async fn delete_service(&self, name: &str) -> Result<(), SubstrateError> {
        self.deleted_services.lock().unwrap().push(name.to_string());
        Ok(())
    }

    async fn trigger_rolling_update(&self, deployment: &str) -> Result<(), SubstrateError> {
        let known = self
            .deployments
            .lock()
            .unwrap()
            .iter()
            .any(|d| d.name == deployment);
        if !known {
            return Err(SubstrateError::NotFound(deployment.to_string()));
        }
        self.rolling_updates.lock().unwrap().push(deployment.to_string());
        Ok(())
    }

    async fn watch_pods(
        &self,
        _selector: &LabelSelector,
    ) -> Result<WatchSubscription, SubstrateError> {
        let events = self.pod_events.lock().unwrap().clone();
        Ok(self.spawn_watch(events))
    }

    async fn watch_deployments(
        &self,
        _selector: &LabelSelector,
    ) -> Result<WatchSubscription, SubstrateError> {
        let events = self.deployment_events.lock().unwrap().clone();
        Ok(self.spawn_watch(events))
    }

    async fn list_pods(&self, selector: &LabelSelector) -> Result<Vec<PodInfo>, SubstrateError> {
        Ok(self
            .pods
            .lock()
            .unwrap()
            .iter()
            .filter(|p| selector.matches(&p.labels))
            .cloned()
            .collect())
    }

    async fn stream_pod_logs(
        &self,
        pod: &str,
        _follow: bool,
    ) -> Result<LogStream, SubstrateError> {
        let chunks = self
            .pod_logs
            .lock()
            .unwrap()
            .get(pod)
            .cloned()
            .ok_or_else(|| SubstrateError::NotFound(pod.to_string()))?;

        let stream = futures::stream::iter(chunks).map(|chunk| {
            chunk.map_err(|msg| std::io::Error::new(std::io::ErrorKind::Other, msg))
        });
        Ok(stream.boxed())
    }
}
