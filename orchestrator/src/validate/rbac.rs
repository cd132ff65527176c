use async_trait::async_trait;

use super::{CheckResult, ValidationCtx, Validator};
use crate::error::Result;
use crate::hub::HubGateway;
use crate::resources;

/// (verb, group, resource, namespace) tuples the invoker must hold.
type Permission = (&'static str, &'static str, &'static str, Option<&'static str>);

/// Mutating permissions the switchover itself needs.
const OPERATOR_PERMISSIONS: &[Permission] = &[
    (
        "patch",
        "cluster.open-cluster-management.io",
        "backupschedules",
        Some(resources::BACKUP_NS),
    ),
    (
        "create",
        "cluster.open-cluster-management.io",
        "restores",
        Some(resources::BACKUP_NS),
    ),
    (
        "delete",
        "cluster.open-cluster-management.io",
        "restores",
        Some(resources::BACKUP_NS),
    ),
    ("patch", "cluster.open-cluster-management.io", "managedclusters", None),
    ("patch", "apps", "deployments", Some(resources::OBSERVABILITY_NS)),
    ("patch", "apps", "statefulsets", Some(resources::OBSERVABILITY_NS)),
    ("create", "", "configmaps", Some(resources::MCE_NS)),
];

/// Read-only permissions the validators need.
const VALIDATOR_PERMISSIONS: &[Permission] = &[
    ("list", "cluster.open-cluster-management.io", "managedclusters", None),
    ("list", "hive.openshift.io", "clusterdeployments", None),
    ("list", "velero.io", "backups", Some(resources::BACKUP_NS)),
    ("list", "velero.io", "backupstoragelocations", Some(resources::BACKUP_NS)),
    ("list", "operator.open-cluster-management.io", "multiclusterhubs", None),
    ("get", "", "configmaps", Some(resources::MCE_NS)),
];

async fn missing_permissions(
    hub: &HubGateway,
    permissions: &[Permission],
) -> Result<Vec<String>> {
    let mut missing = Vec::new();
    for (verb, group, resource, namespace) in permissions {
        if !hub.can_i(verb, group, resource, *namespace).await? {
            missing.push(format!("{}: {verb} {group}/{resource}", hub.context()));
        }
    }
    Ok(missing)
}

/// SelfSubjectAccessReview over the documented least-privilege set, checked
/// separately for the operator and validator roles. Enabled by default;
/// `--skip-rbac-validation` drops it from the suite.
pub struct RbacPermissions;

#[async_trait]
impl Validator for RbacPermissions {
    fn name(&self) -> &'static str {
        "rbac_permissions"
    }

    async fn run(&self, cx: &ValidationCtx<'_>) -> Result<CheckResult> {
        let mut missing = Vec::new();
        for hub in [cx.primary, cx.secondary] {
            missing.extend(missing_permissions(hub, VALIDATOR_PERMISSIONS).await?);
            missing.extend(missing_permissions(hub, OPERATOR_PERMISSIONS).await?);
        }
        if missing.is_empty() {
            Ok(CheckResult::pass(
                self.name(),
                "invoker holds the operator and validator permission sets on both hubs",
            ))
        } else {
            Ok(CheckResult::fail(
                self.name(),
                format!("missing permissions: {}", missing.join(", ")),
            ))
        }
    }
}
