//! Parallel fixer for managed-cluster agents still bootstrapped against the
//! old hub. Each worker owns one cluster; a failure is a warning, not a
//! cancellation of its siblings. The post-activation connection poll is the
//! final arbiter of success.

use std::time::Duration;

use futures::stream::{self, StreamExt};
use kube::api::{ApiResource, DynamicObject};
use kube::core::GroupVersionKind;
use serde::Deserialize;
use switchover_common::wait::Wait;
use tokio_util::sync::CancellationToken;

use crate::error::{Error, Result};
use crate::hub::{GatewayFactory, HubGateway};
use crate::resources;

const BOOTSTRAP_SECRET_WAIT: Duration = Duration::from_secs(10);
const BOOTSTRAP_SECRET_POLL_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Clone, Debug)]
pub struct ReconnectOutcome {
    pub cluster: String,
    pub success: bool,
    pub message: String,
}

/// Re-bootstrap the named clusters' agents against the new hub, at most
/// `concurrency` at a time. Outcomes come back sorted by cluster name so
/// reporting stays deterministic regardless of completion order.
pub async fn reconnect_agents(
    factory: &GatewayFactory,
    hub: &HubGateway,
    clusters: &[String],
    concurrency: usize,
    cancel: &CancellationToken,
) -> Vec<ReconnectOutcome> {
    let mut outcomes: Vec<ReconnectOutcome> = stream::iter(clusters.iter().cloned())
        .map(|cluster| async move {
            if cancel.is_cancelled() {
                return ReconnectOutcome {
                    cluster,
                    success: false,
                    message: "cancelled before start".into(),
                };
            }
            match reconnect_one(factory, hub, &cluster, cancel).await {
                Ok(()) => ReconnectOutcome {
                    cluster,
                    success: true,
                    message: "agent re-bootstrapped".into(),
                },
                Err(e) => ReconnectOutcome {
                    cluster,
                    success: false,
                    message: e.to_string(),
                },
            }
        })
        .buffer_unordered(concurrency.max(1))
        .collect()
        .await;
    outcomes.sort_by(|a, b| a.cluster.cmp(&b.cluster));
    outcomes
}

/// Delete the stale bootstrap secret, replay the new hub's import manifest,
/// wait for the secret to reappear, then restart the klusterlet.
async fn reconnect_one(
    factory: &GatewayFactory,
    hub: &HubGateway,
    cluster: &str,
    cancel: &CancellationToken,
) -> Result<()> {
    if !factory.has_context(cluster) {
        return Err(Error::fatal(format!(
            "no kubeconfig context named {cluster} for agent-side access"
        )));
    }
    let agent = factory.build(cluster, true).await?;

    agent
        .delete_secret(resources::AGENT_NS, resources::BOOTSTRAP_SECRET)
        .await?;
    tracing::debug!(cluster, "deleted stale bootstrap kubeconfig secret");

    let manifest = fetch_import_manifest(hub, cluster).await?;
    apply_import_manifest(&agent, &manifest).await?;
    tracing::debug!(cluster, "applied import manifest from the new hub");

    if !agent.is_dry_run() {
        let agent_ref = &agent;
        Wait::new(
            format!("bootstrap secret on {cluster}"),
            BOOTSTRAP_SECRET_WAIT,
            BOOTSTRAP_SECRET_POLL_INTERVAL,
        )
        .run(cancel, move || async move {
            agent_ref
                .secret_exists(resources::AGENT_NS, resources::BOOTSTRAP_SECRET)
                .await
        })
        .await?;
    }

    agent
        .rollout_restart_deployment(resources::AGENT_NS, resources::KLUSTERLET_DEPLOYMENT)
        .await?;
    Ok(())
}

/// The hub keeps each cluster's import manifest in `<name>-import` within
/// the cluster's own namespace.
async fn fetch_import_manifest(hub: &HubGateway, cluster: &str) -> Result<String> {
    let secret_name = format!("{cluster}-import");
    let secret = hub
        .get_secret(cluster, &secret_name)
        .await?
        .ok_or_else(|| {
            Error::fatal(format!(
                "import secret {cluster}/{secret_name} not found on hub {}",
                hub.context()
            ))
        })?;
    let payload = secret
        .data
        .as_ref()
        .and_then(|d| d.get("import.yaml"))
        .ok_or_else(|| {
            Error::fatal(format!(
                "import secret {cluster}/{secret_name} has no import.yaml key"
            ))
        })?;
    String::from_utf8(payload.0.clone())
        .map_err(|_| Error::fatal(format!("import.yaml for {cluster} is not valid UTF-8")))
}

fn split_api_version(api_version: &str) -> (String, String) {
    match api_version.split_once('/') {
        Some((group, version)) => (group.to_string(), version.to_string()),
        None => (String::new(), api_version.to_string()),
    }
}

/// Multi-document YAML from the import secret, parsed into dynamic objects.
pub fn parse_manifest_documents(yaml: &str) -> Result<Vec<DynamicObject>> {
    let mut objects = Vec::new();
    for document in serde_yaml::Deserializer::from_str(yaml) {
        let value = serde_yaml::Value::deserialize(document)
            .map_err(|e| Error::Validation(format!("invalid import manifest: {e}")))?;
        if value.is_null() {
            continue;
        }
        let json = serde_json::to_value(&value)
            .map_err(|e| Error::Validation(format!("invalid import manifest: {e}")))?;
        let obj: DynamicObject = serde_json::from_value(json)
            .map_err(|e| Error::Validation(format!("import manifest document is not a Kubernetes object: {e}")))?;
        objects.push(obj);
    }
    Ok(objects)
}

async fn apply_import_manifest(agent: &HubGateway, yaml: &str) -> Result<()> {
    for obj in parse_manifest_documents(yaml)? {
        let Some(types) = obj.types.as_ref() else {
            continue;
        };
        let (group, version) = split_api_version(&types.api_version);
        let ar = ApiResource::from_gvk(&GroupVersionKind::gvk(&group, &version, &types.kind));
        agent.apply_object(&ar, &obj).await?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn api_version_splits_into_group_and_version() {
        assert_eq!(
            split_api_version("operator.open-cluster-management.io/v1"),
            ("operator.open-cluster-management.io".into(), "v1".into())
        );
        assert_eq!(split_api_version("v1"), (String::new(), "v1".into()));
    }

    #[test]
    fn multi_document_manifest_parses() {
        let yaml = concat!(
            "apiVersion: v1\n",
            "kind: Secret\n",
            "metadata:\n",
            "  name: bootstrap-hub-kubeconfig\n",
            "  namespace: open-cluster-management-agent\n",
            "---\n",
            "apiVersion: operator.open-cluster-management.io/v1\n",
            "kind: Klusterlet\n",
            "metadata:\n",
            "  name: klusterlet\n",
        );
        let objects = parse_manifest_documents(yaml).expect("parse");
        assert_eq!(objects.len(), 2);
        assert_eq!(objects[0].metadata.name.as_deref(), Some("bootstrap-hub-kubeconfig"));
        assert_eq!(
            objects[1].types.as_ref().map(|t| t.kind.as_str()),
            Some("Klusterlet")
        );
    }

    #[test]
    fn empty_documents_are_skipped() {
        let yaml = "---\n---\napiVersion: v1\nkind: ConfigMap\nmetadata:\n  name: cm\n";
        let objects = parse_manifest_documents(yaml).expect("parse");
        assert_eq!(objects.len(), 1);
    }
}
