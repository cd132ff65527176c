//! Decommission of the old hub. Separable flow with destructive deletes;
//! every precondition is re-verified immediately before the first delete.

use std::time::Duration;

use switchover_common::wait::Wait;

use super::Ctx;
use crate::error::{Error, Result};
use crate::hub::ListQuery;
use crate::resources;
use crate::validate::clusters::unpreserved_cluster_deployments;

const STEP_VERIFY_PRECONDITIONS: &str = "verify_decommission_preconditions";
const STEP_DELETE_OBSERVABILITY: &str = "delete_observability";
const STEP_DELETE_MANAGED_CLUSTERS: &str = "delete_managed_clusters";
const STEP_DELETE_MULTICLUSTERHUB: &str = "delete_multiclusterhub";

pub const STEPS: &[&str] = &[
    STEP_VERIFY_PRECONDITIONS,
    STEP_DELETE_OBSERVABILITY,
    STEP_DELETE_MANAGED_CLUSTERS,
    STEP_DELETE_MULTICLUSTERHUB,
];

/// Finalizer drain budget per deletion wave; operator-dependent.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(300);
const DRAIN_POLL_INTERVAL: Duration = Duration::from_secs(15);
const WORKLOAD_TIMEOUT: Duration = Duration::from_secs(600);
const DELETE_CALL_TIMEOUT: Duration = Duration::from_secs(120);

pub async fn run(cx: &mut Ctx<'_>) -> Result<()> {
    if !cx.state.is_step_completed(STEP_VERIFY_PRECONDITIONS) {
        verify_preconditions(cx).await?;
        cx.state.mark_step_completed(STEP_VERIFY_PRECONDITIONS);
        cx.state.save_state()?;
    }
    if !cx.state.is_step_completed(STEP_DELETE_OBSERVABILITY) {
        delete_observability(cx).await?;
        cx.state.mark_step_completed(STEP_DELETE_OBSERVABILITY);
        cx.state.save_state()?;
    }
    if !cx.state.is_step_completed(STEP_DELETE_MANAGED_CLUSTERS) {
        delete_managed_clusters(cx).await?;
        cx.state.mark_step_completed(STEP_DELETE_MANAGED_CLUSTERS);
        cx.state.save_state()?;
    }
    if !cx.state.is_step_completed(STEP_DELETE_MULTICLUSTERHUB) {
        delete_multiclusterhub(cx).await?;
        cx.state.mark_step_completed(STEP_DELETE_MULTICLUSTERHUB);
        cx.state.save_state()?;
    }
    Ok(())
}

/// All managed clusters must be served by the new hub, and every
/// ClusterDeployment on the old hub must be preserve-on-delete.
async fn verify_preconditions(cx: &mut Ctx<'_>) -> Result<()> {
    let clusters = cx
        .secondary
        .list_resources(&resources::managed_cluster(), None, &ListQuery::default())
        .await?;
    let unavailable: Vec<String> = clusters
        .iter()
        .filter(|c| resources::name_of(c) != resources::LOCAL_CLUSTER)
        .filter(|c| !resources::is_available(c))
        .map(|c| resources::name_of(c).to_string())
        .collect();
    if !unavailable.is_empty() {
        return Err(Error::fatal(format!(
            "cannot decommission: managed clusters not yet available on {}: {}",
            cx.secondary.context(),
            unavailable.join(", ")
        )));
    }
    ensure_preserved(cx).await
}

async fn ensure_preserved(cx: &Ctx<'_>) -> Result<()> {
    let offenders = unpreserved_cluster_deployments(cx.primary).await?;
    if offenders.is_empty() {
        Ok(())
    } else {
        Err(Error::fatal(format!(
            "cannot decommission: ClusterDeployments without preserveOnDelete=true: {}",
            offenders.join(", ")
        )))
    }
}

async fn delete_observability(cx: &mut Ctx<'_>) -> Result<()> {
    let mcos = cx
        .primary
        .list_resources(
            &resources::multi_cluster_observability(),
            None,
            &ListQuery::default(),
        )
        .await?;
    for mco in &mcos {
        cx.primary
            .delete_resource(
                &resources::multi_cluster_observability(),
                None,
                resources::name_of(mco),
                Some(DELETE_CALL_TIMEOUT),
            )
            .await?;
    }
    if !cx.live() || mcos.is_empty() {
        return Ok(());
    }
    let primary = cx.primary;
    Wait::new(
        "observability pods to terminate",
        WORKLOAD_TIMEOUT,
        DRAIN_POLL_INTERVAL,
    )
    .run(cx.cancel, move || async move {
        let pods = primary.list_pods(resources::OBSERVABILITY_NS, None).await?;
        Ok::<_, Error>(pods.is_empty())
    })
    .await?;
    Ok(())
}

async fn delete_managed_clusters(cx: &mut Ctx<'_>) -> Result<()> {
    // Destructive path: re-check immediately before deleting anything.
    ensure_preserved(cx).await?;

    let clusters = cx
        .primary
        .list_resources(&resources::managed_cluster(), None, &ListQuery::default())
        .await?;
    for cluster in &clusters {
        let name = resources::name_of(cluster);
        if name == resources::LOCAL_CLUSTER {
            continue;
        }
        cx.primary
            .delete_resource(
                &resources::managed_cluster(),
                None,
                name,
                Some(DELETE_CALL_TIMEOUT),
            )
            .await?;
        tracing::info!(
            phase = "FINALIZATION",
            step = STEP_DELETE_MANAGED_CLUSTERS,
            hub = cx.primary.context(),
            cluster = name,
            "deleted managed cluster record"
        );
    }
    if !cx.live() {
        return Ok(());
    }
    let primary = cx.primary;
    Wait::new(
        "managed cluster finalizers to drain",
        DRAIN_TIMEOUT,
        DRAIN_POLL_INTERVAL,
    )
    .run(cx.cancel, move || async move {
        let remaining = primary
            .list_resources(&resources::managed_cluster(), None, &ListQuery::default())
            .await?;
        let gone = remaining
            .iter()
            .all(|c| resources::name_of(c) == resources::LOCAL_CLUSTER);
        Ok::<_, Error>(gone)
    })
    .await?;
    Ok(())
}

async fn delete_multiclusterhub(cx: &mut Ctx<'_>) -> Result<()> {
    let hubs = cx
        .primary
        .list_resources(&resources::multi_cluster_hub(), None, &ListQuery::default())
        .await?;
    for hub in &hubs {
        cx.primary
            .delete_resource(
                &resources::multi_cluster_hub(),
                hub.metadata.namespace.as_deref(),
                resources::name_of(hub),
                Some(DELETE_CALL_TIMEOUT),
            )
            .await?;
    }
    if !cx.live() || hubs.is_empty() {
        return Ok(());
    }
    let primary = cx.primary;
    Wait::new(
        "hub workloads to terminate",
        WORKLOAD_TIMEOUT,
        DRAIN_POLL_INTERVAL,
    )
    .run(cx.cancel, move || async move {
        let pods = primary.list_pods(resources::ACM_NS, None).await?;
        // The operator pod legitimately outlives the MultiClusterHub.
        let remaining = pods.iter().filter(|p| {
            p.metadata
                .name
                .as_deref()
                .is_none_or(|n| !n.starts_with(resources::MCH_OPERATOR_PREFIX))
        });
        Ok::<_, Error>(remaining.count() == 0)
    })
    .await?;
    tracing::info!(
        phase = "FINALIZATION",
        step = STEP_DELETE_MULTICLUSTERHUB,
        hub = cx.primary.context(),
        "old hub decommissioned"
    );
    Ok(())
}
