use std::time::Duration;

use k8s_openapi::api::core::v1::Pod;
use kube::api::DynamicObject;
use serde_json::json;
use switchover_common::wait::{Wait, WaitError};

use super::{CONFIG_AUTO_IMPORT_OVERRIDDEN, Ctx};
use crate::error::{Error, Result};
use crate::hub::{HubGateway, ListQuery};
use crate::reconnect;
use crate::resources;

const STEP_VERIFY_CONNECTIONS: &str = "verify_klusterlet_connections";
const STEP_CLEAR_DISABLE_AUTO_IMPORT: &str = "clear_disable_auto_import";
const STEP_CLEANUP_AUTO_IMPORT_STRATEGY: &str = "cleanup_auto_import_strategy";
const STEP_RESTART_OBSERVABILITY: &str = "restart_observability";
const STEP_VERIFY_OBSERVABILITY_PODS: &str = "verify_observability_pods";

pub const STEPS: &[&str] = &[
    STEP_VERIFY_CONNECTIONS,
    STEP_CLEAR_DISABLE_AUTO_IMPORT,
    STEP_CLEANUP_AUTO_IMPORT_STRATEGY,
    STEP_RESTART_OBSERVABILITY,
    STEP_VERIFY_OBSERVABILITY_PODS,
];

/// Short first wait before reconnecting agents proactively.
const INITIAL_CONNECT_WAIT: Duration = Duration::from_secs(120);
/// Full verification budget after the proactive reconnect.
const FULL_CONNECT_WAIT: Duration = Duration::from_secs(600);
const CONNECT_POLL_INTERVAL: Duration = Duration::from_secs(15);
const ROLLOUT_WAIT: Duration = Duration::from_secs(300);
const ROLLOUT_POLL_INTERVAL: Duration = Duration::from_secs(15);

pub async fn run(cx: &mut Ctx<'_>) -> Result<()> {
    if !cx.state.is_step_completed(STEP_VERIFY_CONNECTIONS) {
        verify_klusterlet_connections(cx).await?;
        cx.state.mark_step_completed(STEP_VERIFY_CONNECTIONS);
        cx.state.save_state()?;
    }
    if !cx.state.is_step_completed(STEP_CLEAR_DISABLE_AUTO_IMPORT) {
        clear_disable_auto_import(cx).await?;
        cx.state.mark_step_completed(STEP_CLEAR_DISABLE_AUTO_IMPORT);
        cx.state.save_state()?;
    }
    if !cx.state.is_step_completed(STEP_CLEANUP_AUTO_IMPORT_STRATEGY) {
        cleanup_auto_import_strategy(cx).await?;
        cx.state.mark_step_completed(STEP_CLEANUP_AUTO_IMPORT_STRATEGY);
        cx.state.save_state()?;
    }
    if !cx.state.is_step_completed(STEP_RESTART_OBSERVABILITY) {
        restart_observability(cx).await?;
        cx.state.mark_step_completed(STEP_RESTART_OBSERVABILITY);
        cx.state.save_state()?;
    }
    if !cx.state.is_step_completed(STEP_VERIFY_OBSERVABILITY_PODS) {
        verify_observability_pods(cx).await?;
        cx.state.mark_step_completed(STEP_VERIFY_OBSERVABILITY_PODS);
        cx.state.save_state()?;
    }
    Ok(())
}

async fn disconnected_clusters(hub: &HubGateway) -> Result<Vec<String>> {
    let clusters = hub
        .list_resources(&resources::managed_cluster(), None, &ListQuery::default())
        .await?;
    Ok(clusters
        .iter()
        .filter(|c| resources::name_of(c) != resources::LOCAL_CLUSTER)
        .filter(|c: &&DynamicObject| !(resources::is_available(c) && resources::is_joined(c)))
        .map(|c| resources::name_of(c).to_string())
        .collect())
}

/// Poll until every managed cluster reports Available and Joined on the new
/// hub. After a short first window, still-disconnected agents get a
/// proactive parallel re-bootstrap instead of waiting out the full timeout.
async fn verify_klusterlet_connections(cx: &mut Ctx<'_>) -> Result<()> {
    if !cx.live() {
        return Ok(());
    }
    let secondary = cx.secondary;
    let all_connected = move || async move {
        let disconnected = disconnected_clusters(secondary).await?;
        Ok::<_, Error>(disconnected.is_empty())
    };

    let initial = Wait::new(
        "managed clusters to connect to the new hub",
        INITIAL_CONNECT_WAIT,
        CONNECT_POLL_INTERVAL,
    )
    .run(cx.cancel, all_connected)
    .await;
    match initial {
        Ok(()) => return Ok(()),
        Err(WaitError::TimedOut { .. }) => {}
        Err(other) => return Err(other.into()),
    }

    let disconnected = disconnected_clusters(cx.secondary).await?;
    tracing::warn!(
        hub = cx.secondary.context(),
        clusters = disconnected.join(","),
        "managed clusters still disconnected; re-bootstrapping their agents"
    );
    let outcomes = reconnect::reconnect_agents(
        cx.factory,
        cx.secondary,
        &disconnected,
        cx.opts.reconnect_concurrency,
        cx.cancel,
    )
    .await;
    for outcome in &outcomes {
        if outcome.success {
            tracing::info!(cluster = %outcome.cluster, "agent re-bootstrapped");
        } else {
            // Non-blocking: the verification poll below is the arbiter.
            tracing::warn!(
                cluster = %outcome.cluster,
                "agent reconnect failed: {}",
                outcome.message
            );
        }
    }

    Wait::new(
        "managed clusters to connect to the new hub",
        FULL_CONNECT_WAIT,
        CONNECT_POLL_INTERVAL,
    )
    .run(cx.cancel, all_connected)
    .await?;
    Ok(())
}

/// Remove the prep-phase annotation on the new hub; a lingering annotation
/// would permanently block auto-import.
async fn clear_disable_auto_import(cx: &mut Ctx<'_>) -> Result<()> {
    let clusters = cx
        .secondary
        .list_resources(&resources::managed_cluster(), None, &ListQuery::default())
        .await?;
    for cluster in &clusters {
        let name = resources::name_of(cluster);
        if !resources::has_annotation(cluster, resources::DISABLE_AUTO_IMPORT_ANNOTATION) {
            continue;
        }
        cx.secondary
            .patch_resource(
                &resources::managed_cluster(),
                None,
                name,
                json!({"metadata": {"annotations": {
                    resources::DISABLE_AUTO_IMPORT_ANNOTATION: null,
                }}}),
            )
            .await?;
        tracing::info!(
            phase = "POST_ACTIVATION",
            step = STEP_CLEAR_DISABLE_AUTO_IMPORT,
            hub = cx.secondary.context(),
            cluster = name,
            "cleared disable-auto-import annotation"
        );
    }
    if !cx.live() {
        return Ok(());
    }
    let lingering: Vec<String> = cx
        .secondary
        .list_resources(&resources::managed_cluster(), None, &ListQuery::default())
        .await?
        .iter()
        .filter(|c| resources::has_annotation(c, resources::DISABLE_AUTO_IMPORT_ANNOTATION))
        .map(|c| resources::name_of(c).to_string())
        .collect();
    if !lingering.is_empty() {
        return Err(Error::fatal(format!(
            "disable-auto-import annotation still present on: {}",
            lingering.join(", ")
        )));
    }
    Ok(())
}

/// Only undone when this run set it during activation.
async fn cleanup_auto_import_strategy(cx: &mut Ctx<'_>) -> Result<()> {
    let overridden = cx
        .state
        .config_get::<bool>(CONFIG_AUTO_IMPORT_OVERRIDDEN)
        .unwrap_or(false);
    if !overridden {
        return Ok(());
    }
    cx.secondary
        .delete_configmap(resources::MCE_NS, resources::IMPORT_CONTROLLER_CONFIGMAP)
        .await?;
    cx.state.config_remove(CONFIG_AUTO_IMPORT_OVERRIDDEN);
    tracing::info!(
        phase = "POST_ACTIVATION",
        step = STEP_CLEANUP_AUTO_IMPORT_STRATEGY,
        hub = cx.secondary.context(),
        "reverted auto-import strategy override"
    );
    Ok(())
}

async fn restart_observability(cx: &mut Ctx<'_>) -> Result<()> {
    if !cx.observability() {
        return Ok(());
    }
    cx.secondary
        .rollout_restart_deployment(
            resources::OBSERVABILITY_NS,
            resources::OBSERVATORIUM_API_DEPLOYMENT,
        )
        .await?;
    if !cx.live() {
        return Ok(());
    }
    let secondary = cx.secondary;
    Wait::new(
        "observatorium rollout to become ready",
        ROLLOUT_WAIT,
        ROLLOUT_POLL_INTERVAL,
    )
    .run(cx.cancel, move || async move {
        let deployment = secondary
            .get_deployment(
                resources::OBSERVABILITY_NS,
                resources::OBSERVATORIUM_API_DEPLOYMENT,
            )
            .await?;
        let Some(deployment) = deployment else {
            return Ok(false);
        };
        let desired = deployment
            .spec
            .as_ref()
            .and_then(|s| s.replicas)
            .unwrap_or(1);
        let ready = deployment
            .status
            .as_ref()
            .and_then(|s| s.ready_replicas)
            .unwrap_or(0);
        Ok::<_, Error>(ready >= desired)
    })
    .await?;
    Ok(())
}

pub fn pod_is_ready(pod: &Pod) -> bool {
    let running = pod
        .status
        .as_ref()
        .and_then(|s| s.phase.as_deref())
        .is_some_and(|p| p == "Running");
    let ready = pod
        .status
        .as_ref()
        .and_then(|s| s.conditions.as_ref())
        .is_some_and(|conds| {
            conds
                .iter()
                .any(|c| c.type_ == "Ready" && c.status == "True")
        });
    running && ready
}

async fn verify_observability_pods(cx: &mut Ctx<'_>) -> Result<()> {
    if !cx.observability() || !cx.live() {
        return Ok(());
    }
    let secondary = cx.secondary;
    let result = Wait::new(
        "observability pods to become ready",
        ROLLOUT_WAIT,
        ROLLOUT_POLL_INTERVAL,
    )
    .run(cx.cancel, move || async move {
        let pods = secondary
            .list_pods(
                resources::OBSERVABILITY_NS,
                Some(resources::OBSERVABILITY_POD_SELECTOR),
            )
            .await?;
        Ok::<_, Error>(!pods.is_empty() && pods.iter().all(pod_is_ready))
    })
    .await;
    match result {
        Ok(()) => Ok(()),
        Err(WaitError::TimedOut { .. }) => {
            let pods = cx
                .secondary
                .list_pods(
                    resources::OBSERVABILITY_NS,
                    Some(resources::OBSERVABILITY_POD_SELECTOR),
                )
                .await?;
            let unhealthy: Vec<String> = pods
                .iter()
                .filter(|p| !pod_is_ready(p))
                .filter_map(|p| p.metadata.name.clone())
                .collect();
            Err(Error::fatal(format!(
                "observability pods not ready: {}",
                unhealthy.join(", ")
            )))
        }
        Err(other) => Err(other.into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::{PodCondition, PodStatus};

    fn pod(phase: &str, ready: &str) -> Pod {
        Pod {
            status: Some(PodStatus {
                phase: Some(phase.to_string()),
                conditions: Some(vec![PodCondition {
                    type_: "Ready".to_string(),
                    status: ready.to_string(),
                    ..Default::default()
                }]),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    #[test]
    fn running_and_ready_pods_pass() {
        assert!(pod_is_ready(&pod("Running", "True")));
    }

    #[test]
    fn pending_or_unready_pods_fail() {
        assert!(!pod_is_ready(&pod("Pending", "True")));
        assert!(!pod_is_ready(&pod("Running", "False")));
        assert!(!pod_is_ready(&Pod::default()));
    }
}
