use std::time::Duration;

use switchover_common::wait::Wait;

use super::{CONFIG_SCHEDULE_SNAPSHOT, Ctx, ScheduleSnapshot};
use crate::error::{Error, Result};
use crate::hub::ListQuery;
use crate::resources;

const STEP_SNAPSHOT_SCHEDULE: &str = "snapshot_backup_schedule";
const STEP_PAUSE_SCHEDULE: &str = "pause_backup_schedule";
const STEP_DISABLE_AUTO_IMPORT: &str = "disable_auto_import";
const STEP_SCALE_DOWN_OBSERVABILITY: &str = "scale_down_observability";

pub const STEPS: &[&str] = &[
    STEP_SNAPSHOT_SCHEDULE,
    STEP_PAUSE_SCHEDULE,
    STEP_DISABLE_AUTO_IMPORT,
    STEP_SCALE_DOWN_OBSERVABILITY,
];

const COMPACTOR_DRAIN_TIMEOUT: Duration = Duration::from_secs(300);
const COMPACTOR_POLL_INTERVAL: Duration = Duration::from_secs(10);

/// ACM 2.12 gained `spec.paused`; 2.11 schedules can only be deleted and
/// re-applied from the snapshot later.
fn supports_paused(cx: &Ctx<'_>) -> bool {
    cx.acm_version()
        .map(|v| v >= semver::Version::new(2, 12, 0))
        .unwrap_or(true)
}

pub async fn run(cx: &mut Ctx<'_>) -> Result<()> {
    if !cx.state.is_step_completed(STEP_SNAPSHOT_SCHEDULE) {
        snapshot_backup_schedule(cx).await?;
        cx.state.mark_step_completed(STEP_SNAPSHOT_SCHEDULE);
        cx.state.save_state()?;
    }
    if !cx.state.is_step_completed(STEP_PAUSE_SCHEDULE) {
        pause_backup_schedule(cx).await?;
        cx.state.mark_step_completed(STEP_PAUSE_SCHEDULE);
        cx.state.save_state()?;
    }
    if !cx.state.is_step_completed(STEP_DISABLE_AUTO_IMPORT) {
        disable_auto_import(cx).await?;
        cx.state.mark_step_completed(STEP_DISABLE_AUTO_IMPORT);
        cx.state.save_state()?;
    }
    if !cx.state.is_step_completed(STEP_SCALE_DOWN_OBSERVABILITY) {
        scale_down_observability(cx).await?;
        cx.state.mark_step_completed(STEP_SCALE_DOWN_OBSERVABILITY);
        cx.state.save_state()?;
    }
    Ok(())
}

/// Persist the schedule's full spec under a version-neutral key before
/// touching it. More than one schedule is an anomaly; only the first is
/// handled.
async fn snapshot_backup_schedule(cx: &mut Ctx<'_>) -> Result<()> {
    let schedules = cx
        .primary
        .list_resources(
            &resources::backup_schedule(),
            Some(resources::BACKUP_NS),
            &ListQuery::default(),
        )
        .await?;
    if schedules.len() > 1 {
        tracing::warn!(
            hub = cx.primary.context(),
            count = schedules.len(),
            "multiple BackupSchedules found; only the first is handled"
        );
    }
    let Some(schedule) = schedules.first() else {
        tracing::warn!(
            hub = cx.primary.context(),
            "no BackupSchedule on the primary; nothing to snapshot"
        );
        return Ok(());
    };
    let snapshot = ScheduleSnapshot {
        name: resources::name_of(schedule).to_string(),
        uid: resources::uid_of(schedule).map(str::to_string),
        spec: resources::field(schedule, "spec")
            .cloned()
            .unwrap_or(serde_json::Value::Null),
    };
    tracing::info!(
        phase = "PRIMARY_PREP",
        step = STEP_SNAPSHOT_SCHEDULE,
        hub = cx.primary.context(),
        schedule = %snapshot.name,
        "captured BackupSchedule snapshot"
    );
    cx.state.config_set(CONFIG_SCHEDULE_SNAPSHOT, &snapshot)?;
    Ok(())
}

async fn pause_backup_schedule(cx: &mut Ctx<'_>) -> Result<()> {
    let Some(snapshot) = cx.state.config_get::<ScheduleSnapshot>(CONFIG_SCHEDULE_SNAPSHOT) else {
        return Ok(());
    };
    if supports_paused(cx) {
        cx.primary
            .patch_resource(
                &resources::backup_schedule(),
                Some(resources::BACKUP_NS),
                &snapshot.name,
                serde_json::json!({"spec": {"paused": true}}),
            )
            .await?;
        tracing::info!(
            phase = "PRIMARY_PREP",
            step = STEP_PAUSE_SCHEDULE,
            hub = cx.primary.context(),
            schedule = %snapshot.name,
            "paused BackupSchedule"
        );
    } else {
        // 2.11: no pause flag; the snapshot enables re-apply later.
        cx.primary
            .delete_resource(
                &resources::backup_schedule(),
                Some(resources::BACKUP_NS),
                &snapshot.name,
                None,
            )
            .await?;
        tracing::info!(
            phase = "PRIMARY_PREP",
            step = STEP_PAUSE_SCHEDULE,
            hub = cx.primary.context(),
            schedule = %snapshot.name,
            "deleted BackupSchedule (pre-2.12 hub)"
        );
    }
    Ok(())
}

/// Annotate every managed cluster except `local-cluster`; the annotation's
/// presence is the idempotence marker.
async fn disable_auto_import(cx: &mut Ctx<'_>) -> Result<()> {
    let clusters = cx
        .primary
        .list_resources(&resources::managed_cluster(), None, &ListQuery::default())
        .await?;
    for cluster in &clusters {
        let name = resources::name_of(cluster);
        if name == resources::LOCAL_CLUSTER
            || resources::has_annotation(cluster, resources::DISABLE_AUTO_IMPORT_ANNOTATION)
        {
            continue;
        }
        cx.primary
            .patch_resource(
                &resources::managed_cluster(),
                None,
                name,
                serde_json::json!({"metadata": {"annotations": {
                    resources::DISABLE_AUTO_IMPORT_ANNOTATION: "",
                }}}),
            )
            .await?;
        tracing::info!(
            phase = "PRIMARY_PREP",
            step = STEP_DISABLE_AUTO_IMPORT,
            hub = cx.primary.context(),
            cluster = name,
            "disabled auto-import"
        );
    }
    Ok(())
}

/// Quiesce the Thanos compactor so the new hub's writer does not race it on
/// shared object storage.
async fn scale_down_observability(cx: &mut Ctx<'_>) -> Result<()> {
    if !cx.observability() {
        tracing::debug!("observability absent or skipped; no scale-down");
        return Ok(());
    }
    cx.primary
        .scale_statefulset(
            resources::OBSERVABILITY_NS,
            resources::THANOS_COMPACT_STATEFULSET,
            0,
        )
        .await?;
    if !cx.live() {
        return Ok(());
    }
    let primary = cx.primary;
    Wait::new(
        "compactor pods to terminate",
        COMPACTOR_DRAIN_TIMEOUT,
        COMPACTOR_POLL_INTERVAL,
    )
    .run(cx.cancel, move || async move {
        let pods = primary
            .list_pods(
                resources::OBSERVABILITY_NS,
                Some(resources::THANOS_COMPACT_POD_SELECTOR),
            )
            .await?;
        Ok::<_, Error>(pods.is_empty())
    })
    .await?;
    Ok(())
}
