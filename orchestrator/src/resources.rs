//! Resource coordinates and field accessors for the ACM, OADP and Velero
//! custom resources the orchestrator consumes but does not own.

use chrono::{DateTime, Utc};
use kube::api::{ApiResource, DynamicObject};
use kube::core::GroupVersionKind;

pub const BACKUP_NS: &str = "open-cluster-management-backup";
pub const ACM_NS: &str = "open-cluster-management";
pub const MCE_NS: &str = "multicluster-engine";
pub const OBSERVABILITY_NS: &str = "open-cluster-management-observability";
pub const AGENT_NS: &str = "open-cluster-management-agent";

/// The hub's own sentinel cluster; always excluded from bulk mutations.
pub const LOCAL_CLUSTER: &str = "local-cluster";

pub const DISABLE_AUTO_IMPORT_ANNOTATION: &str =
    "import.open-cluster-management.io/disable-auto-import";
pub const IMMEDIATE_IMPORT_ANNOTATION: &str = "import.open-cluster-management.io/immediate-import";

pub const IMPORT_CONTROLLER_CONFIGMAP: &str = "import-controller-config";
pub const AUTO_IMPORT_STRATEGY_KEY: &str = "autoImportStrategy";
pub const STRATEGY_IMPORT_ONLY: &str = "ImportOnly";
pub const STRATEGY_IMPORT_AND_SYNC: &str = "ImportAndSync";

pub const BOOTSTRAP_SECRET: &str = "bootstrap-hub-kubeconfig";
pub const KLUSTERLET_DEPLOYMENT: &str = "klusterlet";
pub const VELERO_DEPLOYMENT: &str = "velero";

pub const THANOS_COMPACT_STATEFULSET: &str = "observability-thanos-compact";
pub const THANOS_COMPACT_POD_SELECTOR: &str = "app.kubernetes.io/name=thanos-compact";
pub const OBSERVATORIUM_API_DEPLOYMENT: &str = "observability-observatorium-api";
pub const OBSERVABILITY_POD_SELECTOR: &str = "app.kubernetes.io/part-of=observability";

pub const PASSIVE_SYNC_RESTORE: &str = "restore-acm-passive-sync";
pub const ACTIVATION_RESTORE: &str = "restore-acm-activate";
pub const FULL_RESTORE: &str = "restore-acm-full";

/// The operator workload that legitimately survives a MultiClusterHub delete.
pub const MCH_OPERATOR_PREFIX: &str = "multiclusterhub-operator";

pub const AVAILABLE_CONDITION: &str = "ManagedClusterConditionAvailable";
pub const JOINED_CONDITION: &str = "ManagedClusterJoined";

fn ar(group: &str, version: &str, kind: &str, plural: &str) -> ApiResource {
    ApiResource::from_gvk_with_plural(&GroupVersionKind::gvk(group, version, kind), plural)
}

pub fn managed_cluster() -> ApiResource {
    ar(
        "cluster.open-cluster-management.io",
        "v1",
        "ManagedCluster",
        "managedclusters",
    )
}

pub fn backup_schedule() -> ApiResource {
    ar(
        "cluster.open-cluster-management.io",
        "v1beta1",
        "BackupSchedule",
        "backupschedules",
    )
}

pub fn restore() -> ApiResource {
    ar(
        "cluster.open-cluster-management.io",
        "v1beta1",
        "Restore",
        "restores",
    )
}

pub fn velero_backup() -> ApiResource {
    ar("velero.io", "v1", "Backup", "backups")
}

pub fn backup_storage_location() -> ApiResource {
    ar(
        "velero.io",
        "v1",
        "BackupStorageLocation",
        "backupstoragelocations",
    )
}

pub fn data_protection_application() -> ApiResource {
    ar(
        "oadp.openshift.io",
        "v1alpha1",
        "DataProtectionApplication",
        "dataprotectionapplications",
    )
}

pub fn cluster_deployment() -> ApiResource {
    ar("hive.openshift.io", "v1", "ClusterDeployment", "clusterdeployments")
}

pub fn multi_cluster_hub() -> ApiResource {
    ar(
        "operator.open-cluster-management.io",
        "v1",
        "MultiClusterHub",
        "multiclusterhubs",
    )
}

pub fn multi_cluster_observability() -> ApiResource {
    ar(
        "observability.open-cluster-management.io",
        "v1beta2",
        "MultiClusterObservability",
        "multiclusterobservabilities",
    )
}

pub fn cluster_operator() -> ApiResource {
    ar("config.openshift.io", "v1", "ClusterOperator", "clusteroperators")
}

pub fn cluster_version() -> ApiResource {
    ar("config.openshift.io", "v1", "ClusterVersion", "clusterversions")
}

pub fn node() -> ApiResource {
    ar("", "v1", "Node", "nodes")
}

/// Restore status phases as emitted by the backup operator. Different
/// operator versions emit `Completed` or `Finished` for the same outcome;
/// both are success. Unknown values are treated as still-running until the
/// surrounding wait times out.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RestorePhase {
    Enabled,
    Running,
    Started,
    Finished,
    Completed,
    FinishedWithErrors,
    FailedWithErrors,
    Error,
    Unknown(String),
}

impl RestorePhase {
    pub fn parse(s: &str) -> Self {
        match s {
            "Enabled" => RestorePhase::Enabled,
            "Running" => RestorePhase::Running,
            "Started" => RestorePhase::Started,
            "Finished" => RestorePhase::Finished,
            "Completed" => RestorePhase::Completed,
            "FinishedWithErrors" => RestorePhase::FinishedWithErrors,
            "FailedWithErrors" => RestorePhase::FailedWithErrors,
            "Error" => RestorePhase::Error,
            other => RestorePhase::Unknown(other.to_string()),
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, RestorePhase::Finished | RestorePhase::Completed)
    }

    pub fn is_failure(&self) -> bool {
        matches!(
            self,
            RestorePhase::FinishedWithErrors | RestorePhase::FailedWithErrors | RestorePhase::Error
        )
    }
}

impl std::fmt::Display for RestorePhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            RestorePhase::Enabled => "Enabled",
            RestorePhase::Running => "Running",
            RestorePhase::Started => "Started",
            RestorePhase::Finished => "Finished",
            RestorePhase::Completed => "Completed",
            RestorePhase::FinishedWithErrors => "FinishedWithErrors",
            RestorePhase::FailedWithErrors => "FailedWithErrors",
            RestorePhase::Error => "Error",
            RestorePhase::Unknown(s) => s,
        };
        f.write_str(s)
    }
}

pub fn name_of(obj: &DynamicObject) -> &str {
    obj.metadata.name.as_deref().unwrap_or("")
}

pub fn uid_of(obj: &DynamicObject) -> Option<&str> {
    obj.metadata.uid.as_deref()
}

pub fn resource_version_of(obj: &DynamicObject) -> Option<&str> {
    obj.metadata.resource_version.as_deref()
}

pub fn annotation<'a>(obj: &'a DynamicObject, key: &str) -> Option<&'a str> {
    obj.metadata
        .annotations
        .as_ref()
        .and_then(|a| a.get(key))
        .map(String::as_str)
}

pub fn has_annotation(obj: &DynamicObject, key: &str) -> bool {
    annotation(obj, key).is_some()
}

pub fn creation_timestamp(obj: &DynamicObject) -> Option<DateTime<Utc>> {
    obj.metadata
        .creation_timestamp
        .as_ref()
        .and_then(|t| DateTime::from_timestamp(t.0.as_second(), t.0.subsec_nanosecond() as u32))
}

/// Dotted-path lookup into the object's raw data, e.g. `spec.paused` or
/// `status.phase`. Absent segments yield `None`.
pub fn field<'a>(obj: &'a DynamicObject, path: &str) -> Option<&'a serde_json::Value> {
    let mut cur = &obj.data;
    for seg in path.split('.') {
        cur = cur.get(seg)?;
    }
    Some(cur)
}

pub fn str_field<'a>(obj: &'a DynamicObject, path: &str) -> Option<&'a str> {
    field(obj, path).and_then(|v| v.as_str())
}

pub fn bool_field(obj: &DynamicObject, path: &str) -> Option<bool> {
    field(obj, path).and_then(|v| v.as_bool())
}

pub fn status_phase(obj: &DynamicObject) -> Option<&str> {
    str_field(obj, "status.phase")
}

pub fn restore_phase(obj: &DynamicObject) -> Option<RestorePhase> {
    status_phase(obj).map(RestorePhase::parse)
}

/// Status of a named condition, from `status.conditions`. Returns the
/// condition's `status` value ("True"/"False"/"Unknown").
pub fn condition_status<'a>(obj: &'a DynamicObject, condition_type: &str) -> Option<&'a str> {
    let conditions = field(obj, "status.conditions")?.as_array()?;
    conditions
        .iter()
        .find(|c| c.get("type").and_then(|t| t.as_str()) == Some(condition_type))
        .and_then(|c| c.get("status"))
        .and_then(|s| s.as_str())
}

pub fn condition_is_true(obj: &DynamicObject, condition_type: &str) -> bool {
    condition_status(obj, condition_type) == Some("True")
}

/// A managed cluster is joined once its hub accepted the klusterlet.
pub fn is_joined(obj: &DynamicObject) -> bool {
    condition_is_true(obj, JOINED_CONDITION)
}

pub fn is_available(obj: &DynamicObject) -> bool {
    condition_is_true(obj, AVAILABLE_CONDITION)
}

pub fn parse_k8s_time(s: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .ok()
        .map(|t| t.with_timezone(&Utc))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn obj(data: serde_json::Value) -> DynamicObject {
        DynamicObject {
            types: None,
            metadata: Default::default(),
            data,
        }
    }

    #[test]
    fn dotted_field_lookup() {
        let o = obj(json!({"spec": {"paused": true, "veleroSchedule": "0 */2 * * *"}}));
        assert_eq!(bool_field(&o, "spec.paused"), Some(true));
        assert_eq!(str_field(&o, "spec.veleroSchedule"), Some("0 */2 * * *"));
        assert_eq!(field(&o, "spec.missing.deeper"), None);
    }

    #[test]
    fn condition_lookup_by_type() {
        let o = obj(json!({"status": {"conditions": [
            {"type": "ManagedClusterJoined", "status": "True"},
            {"type": "ManagedClusterConditionAvailable", "status": "False"},
        ]}}));
        assert!(is_joined(&o));
        assert!(!is_available(&o));
        assert_eq!(condition_status(&o, "Nope"), None);
    }

    #[test]
    fn restore_phase_classification() {
        assert!(RestorePhase::parse("Completed").is_success());
        assert!(RestorePhase::parse("Finished").is_success());
        assert!(RestorePhase::parse("FinishedWithErrors").is_failure());
        assert!(RestorePhase::parse("FailedWithErrors").is_failure());
        let odd = RestorePhase::parse("Reticulating");
        assert!(!odd.is_success() && !odd.is_failure());
    }
}
