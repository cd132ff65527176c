use async_trait::async_trait;

use super::{CheckResult, ValidationCtx, Validator};
use crate::error::Result;
use crate::hub::{HubGateway, ListQuery};
use crate::resources;

/// Both hubs must carry the backup and ACM namespaces.
pub struct NamespacesPresent;

#[async_trait]
impl Validator for NamespacesPresent {
    fn name(&self) -> &'static str {
        "namespaces_present"
    }

    async fn run(&self, cx: &ValidationCtx<'_>) -> Result<CheckResult> {
        let mut missing = Vec::new();
        for hub in [cx.primary, cx.secondary] {
            for ns in [resources::BACKUP_NS, resources::ACM_NS] {
                if !hub.namespace_exists(ns).await? {
                    missing.push(format!("{}:{ns}", hub.context()));
                }
            }
        }
        if missing.is_empty() {
            Ok(CheckResult::pass(
                self.name(),
                "backup and ACM namespaces exist on both hubs",
            ))
        } else {
            Ok(CheckResult::fail(
                self.name(),
                format!("missing namespaces: {}", missing.join(", ")),
            ))
        }
    }
}

pub async fn detect_acm_version(hub: &HubGateway) -> Result<Option<semver::Version>> {
    let hubs = hub
        .list_resources(&resources::multi_cluster_hub(), None, &ListQuery::default())
        .await?;
    Ok(hubs
        .first()
        .and_then(|mch| resources::str_field(mch, "status.currentVersion"))
        .and_then(|v| semver::Version::parse(v).ok()))
}

/// ACM versions must match exactly across the pair; mixed-version switchover
/// is not supported by the backup operator.
pub struct AcmVersionsMatch;

#[async_trait]
impl Validator for AcmVersionsMatch {
    fn name(&self) -> &'static str {
        "acm_versions_match"
    }

    async fn run(&self, cx: &ValidationCtx<'_>) -> Result<CheckResult> {
        let primary = detect_acm_version(cx.primary).await?;
        let secondary = detect_acm_version(cx.secondary).await?;
        {
            let mut discovered = cx.discovered.lock().expect("discovered lock");
            discovered.acm_version_primary = primary.as_ref().map(|v| v.to_string());
            discovered.acm_version_secondary = secondary.as_ref().map(|v| v.to_string());
        }
        match (primary, secondary) {
            (Some(p), Some(s)) if p == s => Ok(CheckResult::pass(
                self.name(),
                format!("both hubs run ACM {p}"),
            )),
            (Some(p), Some(s)) => Ok(CheckResult::fail(
                self.name(),
                format!(
                    "ACM version mismatch: {} has {p}, {} has {s}",
                    cx.primary.context(),
                    cx.secondary.context()
                ),
            )),
            (p, s) => Ok(CheckResult::fail(
                self.name(),
                format!(
                    "could not detect ACM version (primary: {:?}, secondary: {:?})",
                    p.map(|v| v.to_string()),
                    s.map(|v| v.to_string())
                ),
            )),
        }
    }
}

/// Nodes ready, cluster operators healthy, no upgrade in progress; one JSON
/// list call per resource kind per hub.
pub struct ClusterHealth;

impl ClusterHealth {
    async fn check_hub(&self, hub: &HubGateway) -> Result<Vec<String>> {
        let mut problems = Vec::new();

        let nodes = hub
            .list_resources(&resources::node(), None, &ListQuery::default())
            .await?;
        for node in &nodes {
            if !resources::condition_is_true(node, "Ready") {
                problems.push(format!(
                    "{}: node {} not Ready",
                    hub.context(),
                    resources::name_of(node)
                ));
            }
        }

        // Absent on non-OpenShift clusters; an empty list is fine.
        let operators = hub
            .list_resources(&resources::cluster_operator(), None, &ListQuery::default())
            .await?;
        for op in &operators {
            let available = resources::condition_is_true(op, "Available");
            let degraded = resources::condition_is_true(op, "Degraded");
            if !available || degraded {
                problems.push(format!(
                    "{}: cluster operator {} unhealthy (available={available}, degraded={degraded})",
                    hub.context(),
                    resources::name_of(op)
                ));
            }
        }

        if let Some(cv) = hub
            .get_resource(&resources::cluster_version(), None, "version")
            .await?
            && resources::condition_is_true(&cv, "Progressing")
        {
            problems.push(format!("{}: cluster upgrade in progress", hub.context()));
        }

        Ok(problems)
    }
}

#[async_trait]
impl Validator for ClusterHealth {
    fn name(&self) -> &'static str {
        "cluster_health"
    }

    async fn run(&self, cx: &ValidationCtx<'_>) -> Result<CheckResult> {
        let mut problems = self.check_hub(cx.primary).await?;
        problems.extend(self.check_hub(cx.secondary).await?);
        if problems.is_empty() {
            Ok(CheckResult::pass(
                self.name(),
                "nodes and cluster operators healthy on both hubs",
            ))
        } else {
            Ok(CheckResult::fail(self.name(), problems.join("; ")))
        }
    }
}
