use async_trait::async_trait;
use chrono::{DateTime, Utc};
use kube::api::DynamicObject;
use switchover_common::wait::{Wait, WaitError};

use super::{CheckResult, ValidationCtx, Validator};
use crate::cadence::{cadence_timeout, parse_velero_cadence};
use crate::error::Result;
use crate::hub::{HubGateway, ListQuery};
use crate::resources;

const BACKUP_POLL_INTERVAL: std::time::Duration = std::time::Duration::from_secs(30);

/// OADP namespace exists and the Velero workload is present and healthy on
/// both hubs.
pub struct BackupOperatorPresent;

impl BackupOperatorPresent {
    async fn check_hub(&self, hub: &HubGateway) -> Result<Option<String>> {
        if !hub.namespace_exists(resources::BACKUP_NS).await? {
            return Ok(Some(format!(
                "{}: namespace {} missing",
                hub.context(),
                resources::BACKUP_NS
            )));
        }
        let deployment = hub
            .get_deployment(resources::BACKUP_NS, resources::VELERO_DEPLOYMENT)
            .await?;
        let Some(deployment) = deployment else {
            return Ok(Some(format!("{}: velero deployment missing", hub.context())));
        };
        let available = deployment
            .status
            .as_ref()
            .and_then(|s| s.available_replicas)
            .unwrap_or(0);
        if available < 1 {
            return Ok(Some(format!(
                "{}: velero deployment has no available replicas",
                hub.context()
            )));
        }
        Ok(None)
    }
}

#[async_trait]
impl Validator for BackupOperatorPresent {
    fn name(&self) -> &'static str {
        "backup_operator_present"
    }

    async fn run(&self, cx: &ValidationCtx<'_>) -> Result<CheckResult> {
        let mut problems = Vec::new();
        for hub in [cx.primary, cx.secondary] {
            if let Some(problem) = self.check_hub(hub).await? {
                problems.push(problem);
            }
        }
        if problems.is_empty() {
            Ok(CheckResult::pass(
                self.name(),
                "velero is present and healthy on both hubs",
            ))
        } else {
            Ok(CheckResult::fail(self.name(), problems.join("; ")))
        }
    }
}

/// The DataProtectionApplication must be reconciled on both hubs.
pub struct DataProtectionApplicationReconciled;

#[async_trait]
impl Validator for DataProtectionApplicationReconciled {
    fn name(&self) -> &'static str {
        "data_protection_application_reconciled"
    }

    async fn run(&self, cx: &ValidationCtx<'_>) -> Result<CheckResult> {
        let mut problems = Vec::new();
        for hub in [cx.primary, cx.secondary] {
            let dpas = hub
                .list_resources(
                    &resources::data_protection_application(),
                    Some(resources::BACKUP_NS),
                    &ListQuery::default(),
                )
                .await?;
            match dpas.first() {
                None => problems.push(format!(
                    "{}: no DataProtectionApplication in {}",
                    hub.context(),
                    resources::BACKUP_NS
                )),
                Some(dpa) if !resources::condition_is_true(dpa, "Reconciled") => {
                    problems.push(format!(
                        "{}: DataProtectionApplication {} not reconciled",
                        hub.context(),
                        resources::name_of(dpa)
                    ))
                }
                Some(_) => {}
            }
        }
        if problems.is_empty() {
            Ok(CheckResult::pass(
                self.name(),
                "DataProtectionApplication reconciled on both hubs",
            ))
        } else {
            Ok(CheckResult::fail(self.name(), problems.join("; ")))
        }
    }
}

pub fn backup_start_time(backup: &DynamicObject) -> Option<DateTime<Utc>> {
    resources::str_field(backup, "status.startTimestamp")
        .and_then(resources::parse_k8s_time)
        .or_else(|| resources::creation_timestamp(backup))
}

pub fn backup_completion_time(backup: &DynamicObject) -> Option<DateTime<Utc>> {
    resources::str_field(backup, "status.completionTimestamp").and_then(resources::parse_k8s_time)
}

pub async fn list_backups(hub: &HubGateway) -> Result<Vec<DynamicObject>> {
    hub.list_resources(
        &resources::velero_backup(),
        Some(resources::BACKUP_NS),
        &ListQuery::default(),
    )
    .await
}

pub fn latest_backup(backups: &[DynamicObject]) -> Option<&DynamicObject> {
    backups.iter().max_by_key(|b| backup_start_time(b))
}

fn any_in_progress(backups: &[DynamicObject]) -> bool {
    backups
        .iter()
        .any(|b| resources::status_phase(b) == Some("InProgress"))
}

/// Most recent backup must be `Completed` and nothing may be `InProgress`.
/// An in-progress backup gets a cadence-derived grace period to finish
/// before this becomes a failure.
pub struct LatestBackupCompleted;

#[async_trait]
impl Validator for LatestBackupCompleted {
    fn name(&self) -> &'static str {
        "latest_backup_completed"
    }

    async fn run(&self, cx: &ValidationCtx<'_>) -> Result<CheckResult> {
        // Cadence comes from the primary's BackupSchedule and bounds every
        // schedule-aware wait from here on.
        let schedules = cx
            .primary
            .list_resources(
                &resources::backup_schedule(),
                Some(resources::BACKUP_NS),
                &ListQuery::default(),
            )
            .await?;
        if let Some(cron) = schedules
            .first()
            .and_then(|s| resources::str_field(s, "spec.veleroSchedule"))
            && let Some(cadence) = parse_velero_cadence(cron)
        {
            cx.discovered.lock().expect("discovered lock").cadence_secs =
                Some(cadence.as_secs());
        }

        let mut backups = list_backups(cx.primary).await?;
        if backups.is_empty() {
            return Ok(CheckResult::fail(
                self.name(),
                format!("no velero backups found on {}", cx.primary.context()),
            ));
        }

        if any_in_progress(&backups) {
            let wait = Wait::new(
                "in-progress backup to finish",
                cadence_timeout(cx.cadence()),
                BACKUP_POLL_INTERVAL,
            )
            .allow_post_timeout_success();
            let primary = cx.primary;
            let outcome = wait
                .run(cx.cancel, move || async move {
                    let current = list_backups(primary).await?;
                    Ok::<_, crate::error::Error>(!any_in_progress(&current))
                })
                .await;
            match outcome {
                Ok(()) => {}
                Err(WaitError::TimedOut { .. }) => {
                    return Ok(CheckResult::fail(
                        self.name(),
                        "a backup stayed InProgress past the schedule cadence",
                    ));
                }
                Err(other) => return Err(other.into()),
            }
            backups = list_backups(cx.primary).await?;
        }

        let Some(latest) = latest_backup(&backups) else {
            return Ok(CheckResult::fail(self.name(), "no backups to evaluate"));
        };
        let phase = resources::status_phase(latest).unwrap_or("unknown");
        if phase != "Completed" {
            return Ok(CheckResult::fail(
                self.name(),
                format!(
                    "latest backup {} has phase {phase}",
                    resources::name_of(latest)
                ),
            ));
        }
        {
            let mut discovered = cx.discovered.lock().expect("discovered lock");
            discovered.latest_backup_name = Some(resources::name_of(latest).to_string());
            discovered.latest_backup_completion = backup_completion_time(latest);
        }
        Ok(CheckResult::pass(
            self.name(),
            format!("latest backup {} is Completed", resources::name_of(latest)),
        ))
    }
}

/// At least one BackupStorageLocation must be Available on each hub.
pub struct BackupStorageLocationAvailable;

#[async_trait]
impl Validator for BackupStorageLocationAvailable {
    fn name(&self) -> &'static str {
        "backup_storage_location_available"
    }

    async fn run(&self, cx: &ValidationCtx<'_>) -> Result<CheckResult> {
        let mut problems = Vec::new();
        for hub in [cx.primary, cx.secondary] {
            let locations = hub
                .list_resources(
                    &resources::backup_storage_location(),
                    Some(resources::BACKUP_NS),
                    &ListQuery::default(),
                )
                .await?;
            let available = locations
                .iter()
                .any(|l| resources::status_phase(l) == Some("Available"));
            if !available {
                problems.push(format!(
                    "{}: no Available BackupStorageLocation",
                    hub.context()
                ));
            }
        }
        if problems.is_empty() {
            Ok(CheckResult::pass(
                self.name(),
                "backup storage available on both hubs",
            ))
        } else {
            Ok(CheckResult::fail(self.name(), problems.join("; ")))
        }
    }
}

/// Passive sync re-imports managed clusters through managed service account
/// tokens; the schedule must have them enabled.
pub struct ScheduleUsesManagedServiceAccount;

#[async_trait]
impl Validator for ScheduleUsesManagedServiceAccount {
    fn name(&self) -> &'static str {
        "schedule_uses_managed_service_account"
    }

    async fn run(&self, cx: &ValidationCtx<'_>) -> Result<CheckResult> {
        let schedules = cx
            .primary
            .list_resources(
                &resources::backup_schedule(),
                Some(resources::BACKUP_NS),
                &ListQuery::default(),
            )
            .await?;
        let Some(schedule) = schedules.first() else {
            return Ok(CheckResult::fail(
                self.name(),
                format!("no BackupSchedule found on {}", cx.primary.context()),
            ));
        };
        if resources::bool_field(schedule, "spec.useManagedServiceAccount").unwrap_or(false) {
            Ok(CheckResult::pass(
                self.name(),
                "BackupSchedule has useManagedServiceAccount=true",
            ))
        } else {
            Ok(CheckResult::fail(
                self.name(),
                format!(
                    "BackupSchedule {} must set spec.useManagedServiceAccount=true for passive sync",
                    resources::name_of(schedule)
                ),
            ))
        }
    }
}

/// Exactly one passive-sync restore, in a syncing phase, current with the
/// latest backups.
pub struct PassiveSyncReady;

#[async_trait]
impl Validator for PassiveSyncReady {
    fn name(&self) -> &'static str {
        "passive_sync_ready"
    }

    async fn run(&self, cx: &ValidationCtx<'_>) -> Result<CheckResult> {
        let restores = cx
            .secondary
            .list_resources(
                &resources::restore(),
                Some(resources::BACKUP_NS),
                &ListQuery::default(),
            )
            .await?;
        let syncing: Vec<&DynamicObject> = restores
            .iter()
            .filter(|r| {
                resources::bool_field(r, "spec.syncRestoreWithNewBackups").unwrap_or(false)
            })
            .collect();
        let restore = match syncing.as_slice() {
            [] => {
                return Ok(CheckResult::fail(
                    self.name(),
                    format!(
                        "no restore with syncRestoreWithNewBackups=true on {}",
                        cx.secondary.context()
                    ),
                ));
            }
            [one] => *one,
            many => {
                let names: Vec<&str> = many.iter().map(|r| resources::name_of(r)).collect();
                return Ok(CheckResult::fail(
                    self.name(),
                    format!("expected exactly one passive-sync restore, found: {}", names.join(", ")),
                ));
            }
        };

        let phase = resources::restore_phase(restore);
        let phase_ok = matches!(
            phase,
            Some(resources::RestorePhase::Enabled) | Some(resources::RestorePhase::Finished)
        );
        if !phase_ok {
            return Ok(CheckResult::fail(
                self.name(),
                format!(
                    "passive-sync restore {} is in phase {}, expected Enabled or Finished",
                    resources::name_of(restore),
                    phase.map(|p| p.to_string()).unwrap_or_else(|| "unknown".into())
                ),
            ));
        }

        // Freshness: the resources restore tracked in status should point at
        // the newest resources backup. Older operators omit the field; that
        // is only worth a note, not a block.
        let backups = list_backups(cx.primary).await?;
        let newest_resources_backup = backups
            .iter()
            .filter(|b| resources::name_of(b).contains("acm-resources-schedule"))
            .max_by_key(|b| backup_start_time(b))
            .map(|b| resources::name_of(b).to_string());
        if let (Some(tracked), Some(newest)) = (
            resources::str_field(restore, "status.veleroResourcesRestoreName"),
            newest_resources_backup.as_deref(),
        ) && !tracked.contains(newest)
        {
            return Ok(CheckResult::fail(
                self.name(),
                format!(
                    "passive-sync restore lags behind: tracking {tracked}, newest backup is {newest}"
                ),
            ));
        }

        Ok(CheckResult::pass(
            self.name(),
            format!(
                "passive-sync restore {} is {} and current",
                resources::name_of(restore),
                phase.map(|p| p.to_string()).unwrap_or_default()
            ),
        ))
    }
}
