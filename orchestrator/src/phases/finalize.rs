use chrono::{DateTime, Utc};
use serde_json::json;
use sha2::{Digest, Sha256};
use switchover_common::wait::Wait;

use super::{CONFIG_ACTIVATED_AT, CONFIG_SCHEDULE_SNAPSHOT, Ctx, ScheduleSnapshot, decommission};
use crate::args::OldHubAction;
use crate::cadence::cadence_timeout;
use crate::error::{Error, Result};
use crate::resources;
use crate::validate::backup::{backup_completion_time, backup_start_time, latest_backup};

const STEP_RESTORE_SCHEDULE: &str = "restore_backup_schedule";
const STEP_VERIFY_NEW_BACKUPS: &str = "verify_new_backups";
const STEP_VERIFY_BACKUP_INTEGRITY: &str = "verify_backup_integrity";
const STEP_OLD_HUB_DISPOSITION: &str = "old_hub_disposition";

pub const STEPS: &[&str] = &[
    STEP_RESTORE_SCHEDULE,
    STEP_VERIFY_NEW_BACKUPS,
    STEP_VERIFY_BACKUP_INTEGRITY,
    STEP_OLD_HUB_DISPOSITION,
];

const NEW_BACKUP_POLL_INTERVAL: std::time::Duration = std::time::Duration::from_secs(30);
const VELERO_POD_SELECTOR: &str = "app.kubernetes.io/name=velero";
const VELERO_LOG_TAIL: i64 = 2000;

pub async fn run(cx: &mut Ctx<'_>) -> Result<()> {
    if !cx.state.is_step_completed(STEP_RESTORE_SCHEDULE) {
        restore_backup_schedule(cx).await?;
        cx.state.mark_step_completed(STEP_RESTORE_SCHEDULE);
        cx.state.save_state()?;
    }
    if !cx.state.is_step_completed(STEP_VERIFY_NEW_BACKUPS) {
        verify_new_backups(cx).await?;
        cx.state.mark_step_completed(STEP_VERIFY_NEW_BACKUPS);
        cx.state.save_state()?;
    }
    if !cx.state.is_step_completed(STEP_VERIFY_BACKUP_INTEGRITY) {
        verify_backup_integrity(cx).await?;
        cx.state.mark_step_completed(STEP_VERIFY_BACKUP_INTEGRITY);
        cx.state.save_state()?;
    }
    if !cx.state.is_step_completed(STEP_OLD_HUB_DISPOSITION) {
        old_hub_disposition(cx).await?;
        cx.state.mark_step_completed(STEP_OLD_HUB_DISPOSITION);
        cx.state.save_state()?;
    }
    Ok(())
}

fn hash_spec<T: serde::Serialize>(spec: &T) -> String {
    let spec_bytes = serde_json::to_vec(spec).unwrap_or_default();
    let mut hasher = Sha256::new();
    hasher.update(&spec_bytes);
    hex::encode(hasher.finalize())
}

/// The snapshot's spec with pause state stripped; the new hub's schedule
/// starts unpaused.
fn clean_schedule_spec(snapshot: &ScheduleSnapshot) -> serde_json::Value {
    let mut spec = snapshot.spec.clone();
    if let Some(map) = spec.as_object_mut() {
        map.remove("paused");
    }
    spec
}

/// Apply the pre-prep schedule snapshot on the new hub. A schedule may
/// already exist there (replayed by the resource restore); it is replaced
/// only when its spec matches the snapshot, never blindly.
async fn restore_backup_schedule(cx: &mut Ctx<'_>) -> Result<()> {
    let Some(snapshot) = cx.state.config_get::<ScheduleSnapshot>(CONFIG_SCHEDULE_SNAPSHOT) else {
        tracing::warn!("no BackupSchedule snapshot captured; skipping schedule re-apply");
        return Ok(());
    };
    let desired_spec = clean_schedule_spec(&snapshot);

    if let Some(existing) = cx
        .secondary
        .get_resource(
            &resources::backup_schedule(),
            Some(resources::BACKUP_NS),
            &snapshot.name,
        )
        .await?
    {
        let existing_spec = {
            let mut spec = resources::field(&existing, "spec")
                .cloned()
                .unwrap_or(serde_json::Value::Null);
            if let Some(map) = spec.as_object_mut() {
                map.remove("paused");
            }
            spec
        };
        if hash_spec(&existing_spec) == hash_spec(&desired_spec) {
            // Already the schedule we want; just make sure it is unpaused.
            if resources::bool_field(&existing, "spec.paused").unwrap_or(false) {
                cx.secondary
                    .patch_resource(
                        &resources::backup_schedule(),
                        Some(resources::BACKUP_NS),
                        &snapshot.name,
                        json!({"spec": {"paused": false}}),
                    )
                    .await?;
            }
            tracing::info!(
                phase = "FINALIZATION",
                step = STEP_RESTORE_SCHEDULE,
                hub = cx.secondary.context(),
                schedule = %snapshot.name,
                "schedule already present with the expected spec"
            );
            return Ok(());
        }
        // Same name, different spec: not ours to delete.
        return Err(Error::fatal(format!(
            "BackupSchedule {} on hub {} differs from the snapshot; refusing to replace it",
            snapshot.name,
            cx.secondary.context()
        )));
    }

    cx.secondary
        .create_resource(
            &resources::backup_schedule(),
            Some(resources::BACKUP_NS),
            json!({
                "apiVersion": "cluster.open-cluster-management.io/v1beta1",
                "kind": "BackupSchedule",
                "metadata": {
                    "name": snapshot.name,
                    "namespace": resources::BACKUP_NS,
                },
                "spec": desired_spec,
            }),
        )
        .await?;
    tracing::info!(
        phase = "FINALIZATION",
        step = STEP_RESTORE_SCHEDULE,
        hub = cx.secondary.context(),
        schedule = %snapshot.name,
        "applied BackupSchedule snapshot on the new hub"
    );
    Ok(())
}

fn activated_at(cx: &Ctx<'_>) -> DateTime<Utc> {
    cx.state
        .config_get::<String>(CONFIG_ACTIVATED_AT)
        .and_then(|s| DateTime::parse_from_rfc3339(&s).ok())
        .map(|t| t.with_timezone(&Utc))
        .unwrap_or_else(Utc::now)
}

/// Wait for a backup produced by the new hub after activation. The window
/// spans a full cadence plus completion slack, so a not-yet-due schedule is
/// simply waited out rather than failed.
async fn verify_new_backups(cx: &mut Ctx<'_>) -> Result<()> {
    if !cx.live() {
        return Ok(());
    }
    let since = activated_at(cx);
    let cadence = cx.cadence();
    let timeout = cadence + cadence_timeout(cadence);
    let secondary = cx.secondary;
    Wait::new(
        "a completed backup on the new hub",
        timeout,
        NEW_BACKUP_POLL_INTERVAL,
    )
    .run(cx.cancel, move || async move {
        let backups = secondary
            .list_resources(
                &resources::velero_backup(),
                Some(resources::BACKUP_NS),
                &crate::hub::ListQuery::default(),
            )
            .await?;
        let fresh_completed = backups.iter().any(|b| {
            resources::status_phase(b) == Some("Completed")
                && backup_start_time(b).is_some_and(|t| t > since)
        });
        Ok::<_, Error>(fresh_completed)
    })
    .await?;
    tracing::info!(
        phase = "FINALIZATION",
        step = STEP_VERIFY_NEW_BACKUPS,
        hub = cx.secondary.context(),
        "new hub is producing backups"
    );
    Ok(())
}

/// The newest backup must be clean: no status errors, no errors in the
/// Velero logs mentioning it, and a timestamp inside the cadence window.
async fn verify_backup_integrity(cx: &mut Ctx<'_>) -> Result<()> {
    if !cx.live() {
        return Ok(());
    }
    let backups = cx
        .secondary
        .list_resources(
            &resources::velero_backup(),
            Some(resources::BACKUP_NS),
            &crate::hub::ListQuery::default(),
        )
        .await?;
    let latest = latest_backup(&backups)
        .ok_or_else(|| Error::fatal("no backups found on the new hub during integrity check"))?;
    let name = resources::name_of(latest).to_string();

    let errors = resources::field(latest, "status.errors")
        .and_then(|v| v.as_i64())
        .unwrap_or(0);
    if errors > 0 {
        return Err(Error::fatal(format!(
            "latest backup {name} reports {errors} error(s)"
        )));
    }

    let reference = backup_completion_time(latest).or_else(|| backup_start_time(latest));
    let fresh = reference.is_some_and(|t| Utc::now() - t <= chrono::Duration::from_std(
        cadence_timeout(cx.cadence()) + cx.cadence(),
    )
    .unwrap_or_else(|_| chrono::Duration::hours(2)));
    if !fresh {
        return Err(Error::fatal(format!(
            "latest backup {name} is older than the schedule cadence window"
        )));
    }

    let pods = cx
        .secondary
        .list_pods(resources::BACKUP_NS, Some(VELERO_POD_SELECTOR))
        .await?;
    for pod in &pods {
        let Some(pod_name) = pod.metadata.name.as_deref() else {
            continue;
        };
        let logs = cx
            .secondary
            .pod_logs(resources::BACKUP_NS, pod_name, Some(VELERO_LOG_TAIL))
            .await?;
        if velero_log_has_errors(&logs, &name) {
            return Err(Error::fatal(format!(
                "velero logs report errors for backup {name}"
            )));
        }
    }
    tracing::info!(
        phase = "FINALIZATION",
        step = STEP_VERIFY_BACKUP_INTEGRITY,
        hub = cx.secondary.context(),
        backup = %name,
        "latest backup is clean"
    );
    Ok(())
}

fn velero_log_has_errors(logs: &str, backup_name: &str) -> bool {
    logs.lines().any(|line| {
        line.contains(backup_name)
            && (line.contains("level=error") || line.contains("level=fatal"))
    })
}

/// Leave the old hub demoted, decommissioned, or untouched, per policy.
async fn old_hub_disposition(cx: &mut Ctx<'_>) -> Result<()> {
    match cx.opts.old_hub_action {
        OldHubAction::None => {
            // Observability scale-down from primary prep stands; nothing is
            // re-scaled here.
            tracing::info!(
                phase = "FINALIZATION",
                step = STEP_OLD_HUB_DISPOSITION,
                hub = cx.primary.context(),
                "old hub left untouched"
            );
            Ok(())
        }
        OldHubAction::Secondary => demote_old_hub(cx).await,
        OldHubAction::Decommission => decommission::run(cx).await,
    }
}

/// Demote: the old hub becomes the new passive replica, continuously
/// syncing credentials and resources but never owning managed clusters.
async fn demote_old_hub(cx: &mut Ctx<'_>) -> Result<()> {
    let existing = cx
        .primary
        .get_resource(
            &resources::restore(),
            Some(resources::BACKUP_NS),
            resources::PASSIVE_SYNC_RESTORE,
        )
        .await?;
    if existing.is_none() {
        cx.primary
            .create_resource(
                &resources::restore(),
                Some(resources::BACKUP_NS),
                json!({
                    "apiVersion": "cluster.open-cluster-management.io/v1beta1",
                    "kind": "Restore",
                    "metadata": {
                        "name": resources::PASSIVE_SYNC_RESTORE,
                        "namespace": resources::BACKUP_NS,
                    },
                    "spec": {
                        "cleanupBeforeRestore": "CleanupRestored",
                        "syncRestoreWithNewBackups": true,
                        "veleroManagedClustersBackupName": "skip",
                        "veleroCredentialsBackupName": "latest",
                        "veleroResourcesBackupName": "latest",
                    },
                }),
            )
            .await?;
    }
    tracing::info!(
        phase = "FINALIZATION",
        step = STEP_OLD_HUB_DISPOSITION,
        hub = cx.primary.context(),
        "old hub demoted to passive replica"
    );

    if cx.opts.disable_observability_on_secondary {
        // Two observability writers against one object store is a
        // split-brain; remove the old hub's stack.
        let mcos = cx
            .primary
            .list_resources(
                &resources::multi_cluster_observability(),
                None,
                &crate::hub::ListQuery::default(),
            )
            .await?;
        for mco in &mcos {
            cx.primary
                .delete_resource(
                    &resources::multi_cluster_observability(),
                    None,
                    resources::name_of(mco),
                    None,
                )
                .await?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn spec_hash_ignores_pause_state() {
        let snapshot = ScheduleSnapshot {
            name: "schedule-acm".into(),
            uid: Some("abc".into()),
            spec: serde_json::json!({
                "veleroSchedule": "0 */2 * * *",
                "veleroTtl": "120h",
                "paused": true,
            }),
        };
        let cleaned = clean_schedule_spec(&snapshot);
        assert!(cleaned.get("paused").is_none());
        assert_eq!(cleaned["veleroSchedule"], "0 */2 * * *");
    }

    #[test]
    fn identical_specs_hash_identically() {
        let a = serde_json::json!({"veleroSchedule": "0 */2 * * *", "veleroTtl": "120h"});
        let b = serde_json::json!({"veleroSchedule": "0 */2 * * *", "veleroTtl": "120h"});
        let c = serde_json::json!({"veleroSchedule": "0 */6 * * *", "veleroTtl": "120h"});
        assert_eq!(hash_spec(&a), hash_spec(&b));
        assert_ne!(hash_spec(&a), hash_spec(&c));
    }

    #[test]
    fn velero_log_error_detection_is_backup_scoped() {
        let logs = concat!(
            "time=...: level=info msg=\"Backup completed\" backup=acm-resources-schedule-1\n",
            "time=...: level=error msg=\"upload failed\" backup=acm-resources-schedule-2\n",
        );
        assert!(!velero_log_has_errors(logs, "acm-resources-schedule-1"));
        assert!(velero_log_has_errors(logs, "acm-resources-schedule-2"));
    }
}
