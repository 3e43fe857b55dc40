//! Watch-based reconciliation: drain a filtered substrate event stream until
//! a terminal condition or a deadline, whichever comes first.
//!
//! Every call produces exactly one outcome, and the underlying watch is
//! released on both exits. A timeout is not an infrastructure error; it is a
//! legitimate terminal outcome recorded with reason [`WATCH_TIMEOUT`].

use std::time::Duration;

use tracing::debug;

use crate::model::{BuildStatus, DeployStatus};
use crate::substrate::{
    ConditionType, LabelSelector, PodPhase, ResourceEvent, Substrate, SubstrateError,
    WatchSubscription,
};

/// Reason recorded when a reconciliation deadline elapses with no terminal
/// event.
pub const WATCH_TIMEOUT: &str = "Watch Timeout";

/// Terminal outcome of one reconciliation call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchResult<S> {
    pub status: S,
    pub reason: String,
}

impl<S> WatchResult<S> {
    pub fn new(status: S, reason: impl Into<String>) -> Self {
        Self {
            status,
            reason: reason.into(),
        }
    }
}

/// Drain `watch` until `terminal` yields a result or `deadline` elapses.
///
/// The first qualifying event wins; events are evaluated in emission order.
/// The subscription is stopped before returning on every path; the deadline
/// branch must not leave the watch (and the worker feeding it) behind.
pub async fn reconcile<S, P>(
    mut watch: WatchSubscription,
    deadline: Duration,
    terminal: P,
    on_timeout: WatchResult<S>,
) -> WatchResult<S>
where
    P: Fn(&ResourceEvent) -> Option<WatchResult<S>>,
{
    let outcome = tokio::time::timeout(deadline, async {
        while let Some(event) = watch.next().await {
            if let Some(result) = terminal(&event) {
                return Some(result);
            }
            debug!(?event, "event not terminal, continuing watch");
        }
        // The substrate closed the stream without a terminal event; nothing
        // more can arrive, so this resolves the same way a deadline does.
        None
    })
    .await;

    watch.stop();

    match outcome {
        Ok(Some(result)) => result,
        Ok(None) | Err(_) => on_timeout,
    }
}

/// Terminal predicate for a build job's pods: `Succeeded` and `Failed`
/// phases end the watch, everything else keeps it open.
pub fn build_terminal(event: &ResourceEvent) -> Option<WatchResult<BuildStatus>> {
    let ResourceEvent::Pod(pod) = event else {
        return None;
    };
    match pod.phase {
        PodPhase::Succeeded => Some(WatchResult::new(BuildStatus::Success, pod.message.clone())),
        PodPhase::Failed => Some(WatchResult::new(BuildStatus::Failed, pod.message.clone())),
        PodPhase::Pending | PodPhase::Running => None,
    }
}

/// Terminal predicate for a rollout: all replica counts at the desired value
/// with the spec generation observed means deployed; a `ReplicaFailure`
/// condition fails it; `Progressing` keeps waiting.
pub fn deploy_terminal(event: &ResourceEvent) -> Option<WatchResult<DeployStatus>> {
    let ResourceEvent::Deployment(state) = event else {
        return None;
    };

    if state.updated_replicas == state.desired_replicas
        && state.replicas == state.desired_replicas
        && state.available_replicas == state.desired_replicas
        && state.observed_generation >= state.generation
    {
        return Some(WatchResult::new(DeployStatus::Deployed, String::new()));
    }

    match state.conditions.first() {
        Some(condition) if condition.kind == ConditionType::ReplicaFailure => Some(
            WatchResult::new(DeployStatus::DeploymentFailed, condition.message.clone()),
        ),
        _ => None,
    }
}

/// Watch a function's build job to its terminal build status.
pub async fn watch_build(
    substrate: &dyn Substrate,
    function_id: &str,
    deadline: Duration,
) -> Result<WatchResult<BuildStatus>, SubstrateError> {
    let watch = substrate
        .watch_pods(&LabelSelector::builder(function_id))
        .await?;
    Ok(reconcile(
        watch,
        deadline,
        build_terminal,
        WatchResult::new(BuildStatus::Failed, WATCH_TIMEOUT),
    )
    .await)
}

/// Watch a function's deployment to its terminal deploy status.
pub async fn watch_rollout(
    substrate: &dyn Substrate,
    function_id: &str,
    deadline: Duration,
) -> Result<WatchResult<DeployStatus>, SubstrateError> {
    let watch = substrate
        .watch_deployments(&LabelSelector::app(function_id))
        .await?;
    Ok(reconcile(
        watch,
        deadline,
        deploy_terminal,
        WatchResult::new(DeployStatus::DeploymentFailed, WATCH_TIMEOUT),
    )
    .await)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::substrate::{
        DeploymentCondition, DeploymentState, MockSubstrate, PodState,
    };

    fn pod_event(phase: PodPhase, message: &str) -> ResourceEvent {
        ResourceEvent::Pod(PodState {
            name: "builder-pod".to_string(),
            phase,
            message: message.to_string(),
        })
    }

    fn deployment_event(
        updated: i32,
        replicas: i32,
        available: i32,
        observed_generation: i64,
        generation: i64,
        conditions: Vec<DeploymentCondition>,
    ) -> ResourceEvent {
        ResourceEvent::Deployment(DeploymentState {
            name: "fn-1".to_string(),
            updated_replicas: updated,
            replicas,
            available_replicas: available,
            observed_generation,
            generation,
            desired_replicas: 1,
            conditions,
        })
    }

    #[tokio::test]
    async fn test_build_success_on_succeeded_pod() {
        let substrate = MockSubstrate::new();
        substrate.script_pod_events(vec![
            pod_event(PodPhase::Pending, ""),
            pod_event(PodPhase::Running, ""),
            pod_event(PodPhase::Succeeded, "pushed image"),
        ]);

        let result = watch_build(&substrate, "fn-1", Duration::from_secs(60))
            .await
            .unwrap();
        assert_eq!(result.status, BuildStatus::Success);
        assert_eq!(result.reason, "pushed image");
        assert_eq!(substrate.open_watch_count(), 0);
    }

    #[tokio::test]
    async fn test_build_failed_carries_pod_message() {
        let substrate = MockSubstrate::new();
        substrate.script_pod_events(vec![pod_event(PodPhase::Failed, "npm install failed")]);

        let result = watch_build(&substrate, "fn-1", Duration::from_secs(60))
            .await
            .unwrap();
        assert_eq!(result.status, BuildStatus::Failed);
        assert_eq!(result.reason, "npm install failed");
    }

    #[tokio::test]
    async fn test_first_terminal_event_wins() {
        let substrate = MockSubstrate::new();
        substrate.script_pod_events(vec![
            pod_event(PodPhase::Failed, "first"),
            pod_event(PodPhase::Succeeded, "second"),
        ]);

        let result = watch_build(&substrate, "fn-1", Duration::from_secs(60))
            .await
            .unwrap();
        assert_eq!(result.status, BuildStatus::Failed);
        assert_eq!(result.reason, "first");
    }

    #[tokio::test(start_paused = true)]
    async fn test_build_timeout_releases_watch() {
        let substrate = MockSubstrate::new();
        // Only non-terminal phases: the deadline must resolve the call.
        substrate.script_pod_events(vec![pod_event(PodPhase::Running, "")]);

        let result = watch_build(&substrate, "fn-1", Duration::from_secs(60))
            .await
            .unwrap();
        assert_eq!(result.status, BuildStatus::Failed);
        assert_eq!(result.reason, WATCH_TIMEOUT);
        // The deadline branch must not leak the subscription.
        assert_eq!(substrate.open_watch_count(), 0);
    }

    #[tokio::test]
    async fn test_rollout_deployed_when_replicas_converge() {
        let substrate = MockSubstrate::new();
        substrate.script_deployment_events(vec![
            deployment_event(0, 1, 0, 1, 1, vec![]),
            deployment_event(1, 1, 1, 2, 2, vec![]),
        ]);

        let result = watch_rollout(&substrate, "fn-1", Duration::from_secs(30))
            .await
            .unwrap();
        assert_eq!(result.status, DeployStatus::Deployed);
    }

    #[tokio::test]
    async fn test_rollout_stale_generation_not_terminal() {
        let substrate = MockSubstrate::new();
        // Counts match but the controller has not observed the latest spec.
        substrate.script_deployment_events(vec![deployment_event(1, 1, 1, 1, 2, vec![])]);

        let result = tokio::time::timeout(
            Duration::from_millis(200),
            watch_rollout(&substrate, "fn-1", Duration::from_millis(100)),
        )
        .await
        .expect("reconcile respects its own deadline")
        .unwrap();
        assert_eq!(result.status, DeployStatus::DeploymentFailed);
        assert_eq!(result.reason, WATCH_TIMEOUT);
    }

    #[tokio::test]
    async fn test_rollout_replica_failure() {
        let substrate = MockSubstrate::new();
        substrate.script_deployment_events(vec![deployment_event(
            0,
            1,
            0,
            1,
            1,
            vec![DeploymentCondition {
                kind: ConditionType::ReplicaFailure,
                message: "quota exceeded".to_string(),
            }],
        )]);

        let result = watch_rollout(&substrate, "fn-1", Duration::from_secs(30))
            .await
            .unwrap();
        assert_eq!(result.status, DeployStatus::DeploymentFailed);
        assert_eq!(result.reason, "quota exceeded");
    }

    #[tokio::test(start_paused = true)]
    async fn test_rollout_progressing_runs_to_deadline() {
        let substrate = MockSubstrate::new();
        substrate.script_deployment_events(vec![deployment_event(
            0,
            1,
            0,
            1,
            1,
            vec![DeploymentCondition {
                kind: ConditionType::Progressing,
                message: "scaling up".to_string(),
            }],
        )]);

        let result = watch_rollout(&substrate, "fn-1", Duration::from_secs(30))
            .await
            .unwrap();
        assert_eq!(result.status, DeployStatus::DeploymentFailed);
        assert_eq!(result.reason, WATCH_TIMEOUT);
        assert_eq!(substrate.open_watch_count(), 0);
    }

    #[tokio::test]
    async fn test_closed_stream_resolves_as_timeout() {
        let (tx, rx) = tokio::sync::mpsc::channel(1);
        drop(tx);
        let watch =
            WatchSubscription::new(rx, tokio_util::sync::CancellationToken::new());

        let result = reconcile(
            watch,
            Duration::from_secs(60),
            build_terminal,
            WatchResult::new(BuildStatus::Failed, WATCH_TIMEOUT),
        )
        .await;
        assert_eq!(result.status, BuildStatus::Failed);
        assert_eq!(result.reason, WATCH_TIMEOUT);
    }
}
