use async_trait::async_trait;
use kube::api::DynamicObject;

use super::{CheckResult, ValidationCtx, Validator};
use crate::error::Result;
use crate::hub::{HubGateway, ListQuery};
use crate::resources;

pub async fn list_managed_clusters(hub: &HubGateway) -> Result<Vec<DynamicObject>> {
    hub.list_resources(&resources::managed_cluster(), None, &ListQuery::default())
        .await
}

/// Every managed cluster except the hub's own sentinel.
pub fn non_local<'a>(clusters: &'a [DynamicObject]) -> Vec<&'a DynamicObject> {
    clusters
        .iter()
        .filter(|c| resources::name_of(c) != resources::LOCAL_CLUSTER)
        .collect()
}

/// Every joined managed cluster on the primary must be covered by the
/// latest completed backup; a cluster imported after the backup would be
/// lost in the handover.
pub struct ManagedClusterCoverage;

#[async_trait]
impl Validator for ManagedClusterCoverage {
    fn name(&self) -> &'static str {
        "managed_cluster_coverage"
    }

    async fn run(&self, cx: &ValidationCtx<'_>) -> Result<CheckResult> {
        let Some(backup_completion) = cx
            .discovered
            .lock()
            .expect("discovered lock")
            .latest_backup_completion
        else {
            return Ok(CheckResult::fail(
                self.name(),
                "no completed backup to compare managed cluster ages against",
            ));
        };
        let clusters = list_managed_clusters(cx.primary).await?;
        let mut uncovered = Vec::new();
        for cluster in non_local(&clusters) {
            if !resources::is_joined(cluster) {
                continue;
            }
            match resources::creation_timestamp(cluster) {
                Some(created) if created <= backup_completion => {}
                _ => uncovered.push(resources::name_of(cluster).to_string()),
            }
        }
        if uncovered.is_empty() {
            Ok(CheckResult::pass(
                self.name(),
                "all joined managed clusters are covered by the latest backup",
            ))
        } else {
            Ok(CheckResult::fail(
                self.name(),
                format!(
                    "managed clusters newer than the latest backup: {}",
                    uncovered.join(", ")
                ),
            ))
        }
    }
}

/// Without `preserveOnDelete`, removing a ClusterDeployment record from the
/// old hub would destroy the cluster's infrastructure.
pub struct ClusterDeploymentsPreserved;

#[async_trait]
impl Validator for ClusterDeploymentsPreserved {
    fn name(&self) -> &'static str {
        "cluster_deployments_preserved"
    }

    async fn run(&self, cx: &ValidationCtx<'_>) -> Result<CheckResult> {
        let offenders = unpreserved_cluster_deployments(cx.primary).await?;
        if offenders.is_empty() {
            Ok(CheckResult::pass(
                self.name(),
                "all ClusterDeployments have preserveOnDelete=true",
            ))
        } else {
            Ok(CheckResult::fail(
                self.name(),
                format!(
                    "ClusterDeployments without preserveOnDelete=true: {}",
                    offenders.join(", ")
                ),
            ))
        }
    }
}

pub async fn unpreserved_cluster_deployments(hub: &HubGateway) -> Result<Vec<String>> {
    let deployments = hub
        .list_resources(&resources::cluster_deployment(), None, &ListQuery::default())
        .await?;
    Ok(deployments
        .iter()
        .filter(|cd| !resources::bool_field(cd, "spec.preserveOnDelete").unwrap_or(false))
        .map(|cd| {
            format!(
                "{}/{}",
                cd.metadata.namespace.as_deref().unwrap_or(""),
                resources::name_of(cd)
            )
        })
        .collect())
}

/// On ACM 2.14+ an overridden auto-import strategy on a hub that already
/// has managed clusters deserves a heads-up before switchover.
pub struct AutoImportStrategyDefault;

#[async_trait]
impl Validator for AutoImportStrategyDefault {
    fn name(&self) -> &'static str {
        "auto_import_strategy_default"
    }

    async fn run(&self, cx: &ValidationCtx<'_>) -> Result<CheckResult> {
        let version = cx
            .discovered
            .lock()
            .expect("discovered lock")
            .acm_version_primary
            .as_deref()
            .and_then(|v| semver::Version::parse(v).ok());
        let applies = version.is_some_and(|v| v >= semver::Version::new(2, 14, 0));
        if !applies {
            return Ok(CheckResult::pass(
                self.name(),
                "not applicable below ACM 2.14",
            ));
        }

        let mut overridden = Vec::new();
        for hub in [cx.primary, cx.secondary] {
            let strategy = hub
                .get_configmap(resources::MCE_NS, resources::IMPORT_CONTROLLER_CONFIGMAP)
                .await?
                .and_then(|cm| {
                    cm.data
                        .as_ref()
                        .and_then(|d| d.get(resources::AUTO_IMPORT_STRATEGY_KEY).cloned())
                });
            let is_default = match strategy.as_deref() {
                None | Some(resources::STRATEGY_IMPORT_ONLY) => true,
                Some(_) => false,
            };
            if !is_default {
                let clusters = list_managed_clusters(hub).await?;
                if !non_local(&clusters).is_empty() {
                    overridden.push(format!(
                        "{}: autoImportStrategy={}",
                        hub.context(),
                        strategy.as_deref().unwrap_or("")
                    ));
                }
            }
        }
        if overridden.is_empty() {
            Ok(CheckResult::pass(
                self.name(),
                "auto-import strategy is default where it matters",
            ))
        } else {
            Ok(CheckResult::warn(
                self.name(),
                format!("non-default auto-import strategy: {}", overridden.join("; ")),
            ))
        }
    }
}
