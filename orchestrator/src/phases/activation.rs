use std::time::Duration;

use chrono::Utc;
use kube::api::DynamicObject;
use serde_json::json;
use switchover_common::wait::Wait;

use super::{CONFIG_ACTIVATED_AT, CONFIG_AUTO_IMPORT_OVERRIDDEN, Ctx};
use crate::args::{ActivationMethod, Method};
use crate::cadence::cadence_timeout;
use crate::error::{Error, Result};
use crate::hub::{HubGateway, ListQuery};
use crate::resources;

const STEP_ACTIVATE_PASSIVE_SYNC: &str = "activate_passive_sync";
const STEP_CREATE_FULL_RESTORE: &str = "create_full_restore";
const STEP_WAIT_RESTORE_COMPLETION: &str = "wait_restore_completion";
const STEP_ANNOTATE_IMMEDIATE_IMPORT: &str = "annotate_immediate_import";
const STEP_SET_AUTO_IMPORT_STRATEGY: &str = "set_auto_import_strategy";

pub const STEPS: &[&str] = &[
    STEP_ACTIVATE_PASSIVE_SYNC,
    STEP_CREATE_FULL_RESTORE,
    STEP_WAIT_RESTORE_COMPLETION,
    STEP_ANNOTATE_IMMEDIATE_IMPORT,
    STEP_SET_AUTO_IMPORT_STRATEGY,
];

const PATCH_VERIFY_ATTEMPTS: usize = 5;
const PATCH_VERIFY_INTERVAL: Duration = Duration::from_secs(2);
const DELETION_WAIT: Duration = Duration::from_secs(120);
const DELETION_POLL_INTERVAL: Duration = Duration::from_secs(5);
const RESTORE_POLL_INTERVAL: Duration = Duration::from_secs(10);
const RESTORE_TIMEOUT_FLOOR: Duration = Duration::from_secs(15 * 60);

pub async fn run(cx: &mut Ctx<'_>) -> Result<()> {
    match cx.opts.method {
        Method::Passive => {
            if !cx.state.is_step_completed(STEP_ACTIVATE_PASSIVE_SYNC) {
                match cx.opts.activation_method {
                    ActivationMethod::Patch => activate_by_patch(cx).await?,
                    ActivationMethod::Restore => activate_by_restore(cx).await?,
                }
                cx.state.mark_step_completed(STEP_ACTIVATE_PASSIVE_SYNC);
                cx.state.save_state()?;
            }
        }
        Method::Full => {
            if !cx.state.is_step_completed(STEP_CREATE_FULL_RESTORE) {
                create_full_restore(cx).await?;
                cx.state.mark_step_completed(STEP_CREATE_FULL_RESTORE);
                cx.state.save_state()?;
            }
        }
    }

    if !cx.state.is_step_completed(STEP_WAIT_RESTORE_COMPLETION) {
        wait_restore_completion(cx).await?;
        cx.state
            .config_set(CONFIG_ACTIVATED_AT, &Utc::now().to_rfc3339())?;
        cx.state.mark_step_completed(STEP_WAIT_RESTORE_COMPLETION);
        cx.state.save_state()?;
    }

    if !cx.state.is_step_completed(STEP_ANNOTATE_IMMEDIATE_IMPORT) {
        annotate_immediate_import(cx).await?;
        cx.state.mark_step_completed(STEP_ANNOTATE_IMMEDIATE_IMPORT);
        cx.state.save_state()?;
    }

    if !cx.state.is_step_completed(STEP_SET_AUTO_IMPORT_STRATEGY) {
        set_auto_import_strategy(cx).await?;
        cx.state.mark_step_completed(STEP_SET_AUTO_IMPORT_STRATEGY);
        cx.state.save_state()?;
    }
    Ok(())
}

/// The passive-sync restore, located by its sync flag with a fall back to
/// the well-known name.
async fn find_passive_restore(hub: &HubGateway) -> Result<Option<DynamicObject>> {
    let restores = hub
        .list_resources(
            &resources::restore(),
            Some(resources::BACKUP_NS),
            &ListQuery::default(),
        )
        .await?;
    if let Some(found) = restores
        .into_iter()
        .find(|r| resources::bool_field(r, "spec.syncRestoreWithNewBackups").unwrap_or(false))
    {
        return Ok(Some(found));
    }
    hub.get_resource(
        &resources::restore(),
        Some(resources::BACKUP_NS),
        resources::PASSIVE_SYNC_RESTORE,
    )
    .await
}

/// Decides when a patched value counts as verified. Success requires the
/// observed value to be `latest` and either the value was already `latest`
/// before the patch (idempotent resume) or the resource version moved at
/// some point since. Tracking "ever moved" separately avoids exhausting
/// attempts when a stale cache replays the pre-patch version.
struct PatchVerifier {
    pre_patch_version: Option<String>,
    already_latest: bool,
    ever_changed: bool,
}

impl PatchVerifier {
    fn new(pre_patch_version: Option<String>, already_latest: bool) -> Self {
        Self {
            pre_patch_version,
            already_latest,
            ever_changed: false,
        }
    }

    fn observe(&mut self, value: Option<&str>, resource_version: Option<&str>) -> bool {
        if resource_version.map(str::to_string) != self.pre_patch_version {
            self.ever_changed = true;
        }
        value == Some("latest") && (self.already_latest || self.ever_changed)
    }
}

async fn activate_by_patch(cx: &mut Ctx<'_>) -> Result<()> {
    let restore = find_passive_restore(cx.secondary).await?.ok_or_else(|| {
        Error::fatal(format!(
            "no passive-sync restore found on hub {}",
            cx.secondary.context()
        ))
    })?;
    let name = resources::name_of(&restore).to_string();
    let already_latest =
        resources::str_field(&restore, "spec.veleroManagedClustersBackupName") == Some("latest");

    let outcome = cx
        .secondary
        .patch_resource(
            &resources::restore(),
            Some(resources::BACKUP_NS),
            &name,
            json!({"spec": {"veleroManagedClustersBackupName": "latest"}}),
        )
        .await?;
    tracing::info!(
        phase = "ACTIVATION",
        step = STEP_ACTIVATE_PASSIVE_SYNC,
        hub = cx.secondary.context(),
        restore = %name,
        "patched passive-sync restore to own managed clusters"
    );
    if !cx.live() {
        return Ok(());
    }

    let mut verifier = PatchVerifier::new(outcome.resource_version_before, already_latest);
    for attempt in 0..PATCH_VERIFY_ATTEMPTS {
        let current = cx
            .secondary
            .get_resource(&resources::restore(), Some(resources::BACKUP_NS), &name)
            .await?
            .ok_or_else(|| {
                Error::fatal(format!("restore {name} disappeared during verification"))
            })?;
        let value = resources::str_field(&current, "spec.veleroManagedClustersBackupName");
        if verifier.observe(value, resources::resource_version_of(&current)) {
            return Ok(());
        }
        tracing::debug!(restore = %name, attempt, "activation patch not yet observed");
        tokio::select! {
            _ = cx.cancel.cancelled() => {
                return Err(Error::Cancelled("activation patch verification".into()));
            }
            _ = tokio::time::sleep(PATCH_VERIFY_INTERVAL) => {}
        }
    }
    Err(Error::fatal(format!(
        "activation patch on restore {name} was not observed after {PATCH_VERIFY_ATTEMPTS} reads"
    )))
}

fn restore_manifest(
    name: &str,
    managed_clusters: &str,
    credentials: &str,
    hub_resources: &str,
) -> serde_json::Value {
    json!({
        "apiVersion": "cluster.open-cluster-management.io/v1beta1",
        "kind": "Restore",
        "metadata": {
            "name": name,
            "namespace": resources::BACKUP_NS,
        },
        "spec": {
            "cleanupBeforeRestore": "CleanupRestored",
            "veleroManagedClustersBackupName": managed_clusters,
            "veleroCredentialsBackupName": credentials,
            "veleroResourcesBackupName": hub_resources,
        },
    })
}

async fn activate_by_restore(cx: &mut Ctx<'_>) -> Result<()> {
    if let Some(existing) = find_passive_restore(cx.secondary).await? {
        let name = resources::name_of(&existing).to_string();
        cx.secondary
            .delete_resource(
                &resources::restore(),
                Some(resources::BACKUP_NS),
                &name,
                None,
            )
            .await?;
        if cx.live() {
            // Deletion propagation: the new restore must not race the old
            // object's finalizers.
            let secondary = cx.secondary;
            Wait::new(
                format!("restore {name} to be deleted"),
                DELETION_WAIT,
                DELETION_POLL_INTERVAL,
            )
            .run(cx.cancel, move || {
                let name = name.clone();
                async move {
                    let gone = secondary
                        .get_resource(&resources::restore(), Some(resources::BACKUP_NS), &name)
                        .await?
                        .is_none();
                    Ok::<_, Error>(gone)
                }
            })
            .await?;
        }
    }
    cx.secondary
        .create_resource(
            &resources::restore(),
            Some(resources::BACKUP_NS),
            restore_manifest(resources::ACTIVATION_RESTORE, "latest", "skip", "skip"),
        )
        .await?;
    tracing::info!(
        phase = "ACTIVATION",
        step = STEP_ACTIVATE_PASSIVE_SYNC,
        hub = cx.secondary.context(),
        restore = resources::ACTIVATION_RESTORE,
        "created activation restore"
    );
    Ok(())
}

async fn create_full_restore(cx: &mut Ctx<'_>) -> Result<()> {
    cx.secondary
        .create_resource(
            &resources::restore(),
            Some(resources::BACKUP_NS),
            restore_manifest(resources::FULL_RESTORE, "latest", "latest", "latest"),
        )
        .await?;
    tracing::info!(
        phase = "ACTIVATION",
        step = STEP_CREATE_FULL_RESTORE,
        hub = cx.secondary.context(),
        restore = resources::FULL_RESTORE,
        "created full restore"
    );
    Ok(())
}

/// The restore being waited on depends on how activation ran.
async fn active_restore_name(cx: &Ctx<'_>) -> Result<String> {
    match (cx.opts.method, cx.opts.activation_method) {
        (Method::Full, _) => Ok(resources::FULL_RESTORE.to_string()),
        (Method::Passive, ActivationMethod::Restore) => {
            Ok(resources::ACTIVATION_RESTORE.to_string())
        }
        (Method::Passive, ActivationMethod::Patch) => Ok(find_passive_restore(cx.secondary)
            .await?
            .map(|r| resources::name_of(&r).to_string())
            .unwrap_or_else(|| resources::PASSIVE_SYNC_RESTORE.to_string())),
    }
}

async fn wait_restore_completion(cx: &mut Ctx<'_>) -> Result<()> {
    if !cx.live() {
        return Ok(());
    }
    let name = active_restore_name(cx).await?;
    let timeout = cadence_timeout(cx.cadence()).max(RESTORE_TIMEOUT_FLOOR);
    let secondary = cx.secondary;
    Wait::new(
        format!("restore {name} to complete"),
        timeout,
        RESTORE_POLL_INTERVAL,
    )
    .run(cx.cancel, {
        let name = name.clone();
        move || {
            let name = name.clone();
            async move {
                let restore = secondary
                    .get_resource(&resources::restore(), Some(resources::BACKUP_NS), &name)
                    .await?
                    .ok_or_else(|| {
                        Error::fatal(format!("restore {name} not found while waiting"))
                    })?;
                let Some(phase) = resources::restore_phase(&restore) else {
                    return Ok(false);
                };
                if phase.is_failure() {
                    return Err(Error::fatal(format!(
                        "restore {name} failed with phase {phase}"
                    )));
                }
                // Enabled/Running/unknown phases are non-terminal.
                Ok::<_, Error>(phase.is_success())
            }
        }
    })
    .await?;
    tracing::info!(
        phase = "ACTIVATION",
        step = STEP_WAIT_RESTORE_COMPLETION,
        hub = cx.secondary.context(),
        restore = %name,
        "restore completed"
    );
    Ok(())
}

/// ACM 2.14 with the default `ImportOnly` strategy re-imports restored
/// clusters only when nudged; the immediate-import annotation is that nudge.
async fn annotate_immediate_import(cx: &mut Ctx<'_>) -> Result<()> {
    let version_applies = cx
        .acm_version()
        .is_some_and(|v| v >= semver::Version::new(2, 14, 0));
    if !version_applies {
        return Ok(());
    }
    let strategy = cx
        .secondary
        .get_configmap(resources::MCE_NS, resources::IMPORT_CONTROLLER_CONFIGMAP)
        .await?
        .and_then(|cm| {
            cm.data
                .as_ref()
                .and_then(|d| d.get(resources::AUTO_IMPORT_STRATEGY_KEY).cloned())
        });
    let import_only = match strategy.as_deref() {
        None | Some(resources::STRATEGY_IMPORT_ONLY) => true,
        Some(_) => false,
    };
    if !import_only {
        return Ok(());
    }
    let clusters = cx
        .secondary
        .list_resources(&resources::managed_cluster(), None, &ListQuery::default())
        .await?;
    for cluster in &clusters {
        let name = resources::name_of(cluster);
        if name == resources::LOCAL_CLUSTER
            || resources::has_annotation(cluster, resources::IMMEDIATE_IMPORT_ANNOTATION)
        {
            continue;
        }
        cx.secondary
            .patch_resource(
                &resources::managed_cluster(),
                None,
                name,
                json!({"metadata": {"annotations": {
                    resources::IMMEDIATE_IMPORT_ANNOTATION: "",
                }}}),
            )
            .await?;
        tracing::info!(
            phase = "ACTIVATION",
            step = STEP_ANNOTATE_IMMEDIATE_IMPORT,
            hub = cx.secondary.context(),
            cluster = name,
            "requested immediate import"
        );
    }
    Ok(())
}

/// Optional `ImportAndSync` override for intended failback; recorded in the
/// config bag so only this run cleans it up afterwards.
async fn set_auto_import_strategy(cx: &mut Ctx<'_>) -> Result<()> {
    if !cx.opts.manage_auto_import_strategy {
        return Ok(());
    }
    let data = std::collections::BTreeMap::from([(
        resources::AUTO_IMPORT_STRATEGY_KEY.to_string(),
        resources::STRATEGY_IMPORT_AND_SYNC.to_string(),
    )]);
    cx.secondary
        .create_or_patch_configmap(
            resources::MCE_NS,
            resources::IMPORT_CONTROLLER_CONFIGMAP,
            data,
        )
        .await?;
    cx.state.config_set(CONFIG_AUTO_IMPORT_OVERRIDDEN, &true)?;
    tracing::info!(
        phase = "ACTIVATION",
        step = STEP_SET_AUTO_IMPORT_STRATEGY,
        hub = cx.secondary.context(),
        "set autoImportStrategy=ImportAndSync for this run"
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn verification_succeeds_when_version_changes() {
        let mut v = PatchVerifier::new(Some("100".into()), false);
        assert!(!v.observe(Some("latest"), Some("100")));
        assert!(v.observe(Some("latest"), Some("101")));
    }

    #[test]
    fn verification_succeeds_on_idempotent_resume() {
        let mut v = PatchVerifier::new(Some("100".into()), true);
        // Value already latest before the patch; same version is fine.
        assert!(v.observe(Some("latest"), Some("100")));
    }

    #[test]
    fn version_change_is_remembered_across_stale_reads() {
        let mut v = PatchVerifier::new(Some("100".into()), false);
        // A fresh read shows the bump but not yet the value...
        assert!(!v.observe(Some("skip"), Some("101")));
        // ...then a stale cache replays the old version with the new value.
        assert!(v.observe(Some("latest"), Some("100")));
    }

    #[test]
    fn wrong_value_never_verifies() {
        let mut v = PatchVerifier::new(Some("100".into()), false);
        assert!(!v.observe(Some("skip"), Some("105")));
        assert!(!v.observe(None, Some("106")));
    }

    #[test]
    fn restore_manifest_carries_the_exact_contract() {
        let m = restore_manifest(resources::FULL_RESTORE, "latest", "latest", "latest");
        assert_eq!(m["spec"]["cleanupBeforeRestore"], "CleanupRestored");
        assert_eq!(m["spec"]["veleroManagedClustersBackupName"], "latest");
        let m = restore_manifest(resources::ACTIVATION_RESTORE, "latest", "skip", "skip");
        assert_eq!(m["spec"]["veleroCredentialsBackupName"], "skip");
        assert_eq!(m["spec"]["veleroResourcesBackupName"], "skip");
        assert_eq!(m["metadata"]["namespace"], resources::BACKUP_NS);
    }
}
