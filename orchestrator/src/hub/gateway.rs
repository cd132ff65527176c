use std::collections::{BTreeMap, VecDeque};
use std::future::Future;
use std::time::Duration;

use futures::Stream;

use k8s_openapi::api::apps::v1::{Deployment, StatefulSet};
use k8s_openapi::api::authorization::v1::{
    ResourceAttributes, SelfSubjectAccessReview, SelfSubjectAccessReviewSpec,
};
use k8s_openapi::api::core::v1::{ConfigMap, Namespace, Pod, Secret};
use kube::api::{
    Api, ApiResource, DeleteParams, DynamicObject, ListParams, LogParams, Patch, PatchParams,
    PostParams,
};
use kube::Client;
use serde_json::json;
use tokio_util::sync::CancellationToken;

use super::retry::{RetryPolicy, is_not_found, is_retryable};
use crate::error::{Error, Result};
use crate::resources;

/// Field manager name for patches and server-side applies.
const MANAGER: &str = "acm-switchover";

/// Page size for transparent `continue`-token iteration.
const LIST_PAGE_SIZE: u32 = 500;

#[derive(Clone, Debug, Default)]
pub struct ListQuery {
    pub label_selector: Option<String>,
    pub max_items: Option<usize>,
}

/// Resource versions observed around a patch, for caller-side verification.
#[derive(Clone, Debug)]
pub struct PatchOutcome {
    pub resource_version_before: Option<String>,
    pub resource_version_after: Option<String>,
}

enum PageCursor {
    Start,
    Next(String),
    Done,
}

/// One hub's API surface. Owns its client; dry-run and retry policy are
/// attributes of the handle, not of call sites. Every operation is wrapped
/// in the retry policy exactly once; composing helpers add no extra retry.
#[derive(Clone)]
pub struct HubGateway {
    client: Client,
    context: String,
    dry_run: bool,
    retry: RetryPolicy,
    cancel: CancellationToken,
}

impl HubGateway {
    pub fn new(
        client: Client,
        context: String,
        dry_run: bool,
        retry: RetryPolicy,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            client,
            context,
            dry_run,
            retry,
            cancel,
        }
    }

    pub fn context(&self) -> &str {
        &self.context
    }

    pub fn is_dry_run(&self) -> bool {
        self.dry_run
    }

    async fn with_retry<T, F, Fut>(&self, what: &str, mut op: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = std::result::Result<T, kube::Error>>,
    {
        let mut attempt = 0usize;
        loop {
            match op().await {
                Ok(v) => return Ok(v),
                Err(e) if is_retryable(&e) => {
                    attempt += 1;
                    if attempt >= self.retry.attempts {
                        return Err(Error::Transient {
                            attempts: attempt,
                            source: e,
                        });
                    }
                    let delay = self.retry.backoff(attempt - 1);
                    tracing::warn!(
                        hub = %self.context,
                        error = %e,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        "retrying {what}"
                    );
                    tokio::select! {
                        _ = self.cancel.cancelled() => {
                            return Err(Error::Cancelled(what.to_string()));
                        }
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
                Err(e) => {
                    return Err(Error::api(
                        format!("{what} failed on hub {}", self.context),
                        e,
                    ));
                }
            }
        }
    }

    fn dyn_api(&self, ar: &ApiResource, namespace: Option<&str>) -> Api<DynamicObject> {
        match namespace {
            Some(ns) => Api::namespaced_with(self.client.clone(), ns, ar),
            None => Api::all_with(self.client.clone(), ar),
        }
    }

    // ---- namespaces ----

    pub async fn get_namespace(&self, name: &str) -> Result<Option<Namespace>> {
        let api: Api<Namespace> = Api::all(self.client.clone());
        let name = name.to_string();
        self.with_retry("get namespace", || {
            let api = api.clone();
            let name = name.clone();
            async move { api.get_opt(&name).await }
        })
        .await
    }

    /// Composes on `get_namespace`; deliberately not wrapped again.
    pub async fn namespace_exists(&self, name: &str) -> Result<bool> {
        Ok(self.get_namespace(name).await?.is_some())
    }

    // ---- arbitrary custom resources ----

    pub async fn get_resource(
        &self,
        ar: &ApiResource,
        namespace: Option<&str>,
        name: &str,
    ) -> Result<Option<DynamicObject>> {
        let api = self.dyn_api(ar, namespace);
        let name = name.to_string();
        let what = format!("get {}/{name}", ar.kind);
        self.with_retry(&what, || {
            let api = api.clone();
            let name = name.clone();
            async move { api.get_opt(&name).await }
        })
        .await
    }

    /// One page of a list call, with retry. A 404 (the CRD itself is
    /// absent) reads as an empty list, matching the absent-marker semantics
    /// of gets.
    async fn list_page(
        &self,
        ar: &ApiResource,
        namespace: Option<&str>,
        query: &ListQuery,
        continue_token: Option<String>,
    ) -> Result<(Vec<DynamicObject>, Option<String>)> {
        let api = self.dyn_api(ar, namespace);
        let what = format!("list {}", ar.plural);
        let lp = ListParams {
            label_selector: query.label_selector.clone(),
            limit: Some(LIST_PAGE_SIZE),
            continue_token,
            ..Default::default()
        };
        self.with_retry(&what, || {
            let api = api.clone();
            let lp = lp.clone();
            async move {
                match api.list(&lp).await {
                    Ok(list) => Ok((list.items, list.metadata.continue_)),
                    Err(e) if is_not_found(&e) => Ok((Vec::new(), None)),
                    Err(e) => Err(e),
                }
            }
        })
        .await
    }

    /// Bulk list with transparent pagination. `max_items` bounds the total
    /// number of collected objects; the `continue` token loop stops early
    /// once the bound is reached.
    pub async fn list_resources(
        &self,
        ar: &ApiResource,
        namespace: Option<&str>,
        query: &ListQuery,
    ) -> Result<Vec<DynamicObject>> {
        let mut items = Vec::new();
        let mut continue_token: Option<String> = None;
        loop {
            let (page_items, next_token) = self
                .list_page(ar, namespace, query, continue_token.clone())
                .await?;
            continue_token = next_token;
            items.extend(page_items);
            if let Some(max) = query.max_items
                && items.len() >= max
            {
                items.truncate(max);
                break;
            }
            match &continue_token {
                Some(token) if !token.is_empty() => {}
                _ => break,
            }
        }
        Ok(items)
    }

    /// Streaming variant of `list_resources`: yields one object at a time
    /// and fetches pages lazily, so a huge fleet never has to fit in memory
    /// at once.
    pub fn iter_resources(
        &self,
        ar: &ApiResource,
        namespace: Option<&str>,
        query: &ListQuery,
    ) -> impl Stream<Item = Result<DynamicObject>> + use<> {
        let gateway = self.clone();
        let ar = ar.clone();
        let namespace = namespace.map(str::to_string);
        let query = query.clone();
        futures::stream::try_unfold(
            (VecDeque::new(), PageCursor::Start, 0usize),
            move |(mut buffer, mut cursor, mut yielded): (VecDeque<DynamicObject>, _, _)| {
                let gateway = gateway.clone();
                let ar = ar.clone();
                let namespace = namespace.clone();
                let query = query.clone();
                async move {
                    loop {
                        if query.max_items.is_some_and(|max| yielded >= max) {
                            return Ok(None);
                        }
                        if let Some(item) = buffer.pop_front() {
                            yielded += 1;
                            return Ok(Some((item, (buffer, cursor, yielded))));
                        }
                        let token = match &cursor {
                            PageCursor::Done => return Ok(None),
                            PageCursor::Start => None,
                            PageCursor::Next(t) => Some(t.clone()),
                        };
                        let (items, next) = gateway
                            .list_page(&ar, namespace.as_deref(), &query, token)
                            .await?;
                        buffer = items.into();
                        cursor = match next {
                            Some(t) if !t.is_empty() => PageCursor::Next(t),
                            _ => PageCursor::Done,
                        };
                        if buffer.is_empty() && matches!(cursor, PageCursor::Done) {
                            return Ok(None);
                        }
                    }
                }
            },
        )
    }

    /// Merge-patch the resource, capturing the resource version before and
    /// after for caller-side verification. 404 propagates as a fatal error.
    pub async fn patch_resource(
        &self,
        ar: &ApiResource,
        namespace: Option<&str>,
        name: &str,
        body: serde_json::Value,
    ) -> Result<PatchOutcome> {
        let before = self
            .get_resource(ar, namespace, name)
            .await?
            .ok_or_else(|| {
                Error::fatal(format!(
                    "cannot patch {}/{name} on hub {}: resource not found",
                    ar.kind, self.context
                ))
            })?;
        let version_before = resources::resource_version_of(&before).map(str::to_string);

        if self.dry_run {
            tracing::info!(
                hub = %self.context,
                kind = %ar.kind,
                name,
                body = %body,
                "dry-run: skipping patch"
            );
            return Ok(PatchOutcome {
                resource_version_before: version_before.clone(),
                resource_version_after: version_before,
            });
        }

        let api = self.dyn_api(ar, namespace);
        let what = format!("patch {}/{name}", ar.kind);
        let name_owned = name.to_string();
        let patched = self
            .with_retry(&what, || {
                let api = api.clone();
                let name = name_owned.clone();
                let body = body.clone();
                async move {
                    api.patch(&name, &PatchParams::default(), &Patch::Merge(body))
                        .await
                }
            })
            .await?;
        Ok(PatchOutcome {
            resource_version_before: version_before,
            resource_version_after: resources::resource_version_of(&patched).map(str::to_string),
        })
    }

    pub async fn create_resource(
        &self,
        ar: &ApiResource,
        namespace: Option<&str>,
        manifest: serde_json::Value,
    ) -> Result<()> {
        if self.dry_run {
            tracing::info!(
                hub = %self.context,
                kind = %ar.kind,
                body = %manifest,
                "dry-run: skipping create"
            );
            return Ok(());
        }
        let obj: DynamicObject = serde_json::from_value(manifest)?;
        let api = self.dyn_api(ar, namespace);
        let what = format!("create {}", ar.kind);
        self.with_retry(&what, || {
            let api = api.clone();
            let obj = obj.clone();
            async move { api.create(&PostParams::default(), &obj).await }
        })
        .await?;
        Ok(())
    }

    /// Server-side apply of a parsed manifest document. Used when replaying
    /// import manifests against a managed cluster.
    pub async fn apply_object(&self, ar: &ApiResource, obj: &DynamicObject) -> Result<()> {
        let name = resources::name_of(obj).to_string();
        if self.dry_run {
            tracing::info!(
                hub = %self.context,
                kind = %ar.kind,
                name,
                "dry-run: skipping apply"
            );
            return Ok(());
        }
        let api = self.dyn_api(ar, obj.metadata.namespace.as_deref());
        let what = format!("apply {}/{name}", ar.kind);
        self.with_retry(&what, || {
            let api = api.clone();
            let name = name.clone();
            let obj = obj.clone();
            async move {
                api.patch(
                    &name,
                    &PatchParams::apply(MANAGER).force(),
                    &Patch::Apply(&obj),
                )
                .await
            }
        })
        .await?;
        Ok(())
    }

    /// Delete with 404-is-success semantics. An explicit timeout bounds slow
    /// deletions (finalizer-heavy resources).
    pub async fn delete_resource(
        &self,
        ar: &ApiResource,
        namespace: Option<&str>,
        name: &str,
        timeout: Option<Duration>,
    ) -> Result<()> {
        if self.dry_run {
            tracing::info!(
                hub = %self.context,
                kind = %ar.kind,
                name,
                "dry-run: skipping delete"
            );
            return Ok(());
        }
        let api = self.dyn_api(ar, namespace);
        let what = format!("delete {}/{name}", ar.kind);
        let name_owned = name.to_string();
        let op = self.with_retry(&what, || {
            let api = api.clone();
            let name = name_owned.clone();
            async move {
                match api.delete(&name, &DeleteParams::default()).await {
                    Ok(_) => Ok(()),
                    Err(e) if is_not_found(&e) => Ok(()),
                    Err(e) => Err(e),
                }
            }
        });
        match timeout {
            Some(limit) => tokio::time::timeout(limit, op).await.map_err(|_| {
                Error::fatal(format!(
                    "deletion of {}/{name} on hub {} exceeded {limit:?}",
                    ar.kind, self.context
                ))
            })?,
            None => op.await,
        }
    }

    // ---- workloads ----

    pub async fn get_deployment(&self, namespace: &str, name: &str) -> Result<Option<Deployment>> {
        let api: Api<Deployment> = Api::namespaced(self.client.clone(), namespace);
        let name = name.to_string();
        self.with_retry("get deployment", || {
            let api = api.clone();
            let name = name.clone();
            async move { api.get_opt(&name).await }
        })
        .await
    }

    pub async fn scale_deployment(&self, namespace: &str, name: &str, replicas: i32) -> Result<()> {
        if self.dry_run {
            tracing::info!(hub = %self.context, name, replicas, "dry-run: skipping deployment scale");
            return Ok(());
        }
        let api: Api<Deployment> = Api::namespaced(self.client.clone(), namespace);
        let name_owned = name.to_string();
        self.with_retry("scale deployment", || {
            let api = api.clone();
            let name = name_owned.clone();
            async move {
                api.patch_scale(
                    &name,
                    &PatchParams::default(),
                    &Patch::Merge(json!({"spec": {"replicas": replicas}})),
                )
                .await
            }
        })
        .await?;
        Ok(())
    }

    pub async fn scale_statefulset(
        &self,
        namespace: &str,
        name: &str,
        replicas: i32,
    ) -> Result<()> {
        if self.dry_run {
            tracing::info!(hub = %self.context, name, replicas, "dry-run: skipping statefulset scale");
            return Ok(());
        }
        let api: Api<StatefulSet> = Api::namespaced(self.client.clone(), namespace);
        let name_owned = name.to_string();
        self.with_retry("scale statefulset", || {
            let api = api.clone();
            let name = name_owned.clone();
            async move {
                api.patch_scale(
                    &name,
                    &PatchParams::default(),
                    &Patch::Merge(json!({"spec": {"replicas": replicas}})),
                )
                .await
            }
        })
        .await?;
        Ok(())
    }

    /// Annotate the pod template with a fresh restart marker, kubectl-style.
    pub async fn rollout_restart_deployment(&self, namespace: &str, name: &str) -> Result<()> {
        if self.dry_run {
            tracing::info!(hub = %self.context, name, "dry-run: skipping rollout restart");
            return Ok(());
        }
        let api: Api<Deployment> = Api::namespaced(self.client.clone(), namespace);
        let name_owned = name.to_string();
        let marker = chrono::Utc::now().to_rfc3339();
        self.with_retry("rollout restart deployment", || {
            let api = api.clone();
            let name = name_owned.clone();
            let body = json!({
                "spec": {"template": {"metadata": {"annotations": {
                    "kubectl.kubernetes.io/restartedAt": marker,
                }}}}
            });
            async move {
                api.patch(&name, &PatchParams::default(), &Patch::Strategic(body))
                    .await
            }
        })
        .await?;
        Ok(())
    }

    pub async fn list_pods(
        &self,
        namespace: &str,
        label_selector: Option<&str>,
    ) -> Result<Vec<Pod>> {
        let api: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        let lp = ListParams {
            label_selector: label_selector.map(str::to_string),
            ..Default::default()
        };
        let pods = self
            .with_retry("list pods", || {
                let api = api.clone();
                let lp = lp.clone();
                async move { api.list(&lp).await }
            })
            .await?;
        Ok(pods.items)
    }

    pub async fn pod_logs(
        &self,
        namespace: &str,
        pod_name: &str,
        tail_lines: Option<i64>,
    ) -> Result<String> {
        let api: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        let name = pod_name.to_string();
        let lp = LogParams {
            tail_lines,
            ..Default::default()
        };
        self.with_retry("read pod logs", || {
            let api = api.clone();
            let name = name.clone();
            let lp = lp.clone();
            async move { api.logs(&name, &lp).await }
        })
        .await
    }

    // ---- secrets and configmaps ----

    pub async fn get_secret(&self, namespace: &str, name: &str) -> Result<Option<Secret>> {
        let api: Api<Secret> = Api::namespaced(self.client.clone(), namespace);
        let name = name.to_string();
        self.with_retry("get secret", || {
            let api = api.clone();
            let name = name.clone();
            async move { api.get_opt(&name).await }
        })
        .await
    }

    /// Composes on `get_secret`; deliberately not wrapped again.
    pub async fn secret_exists(&self, namespace: &str, name: &str) -> Result<bool> {
        Ok(self.get_secret(namespace, name).await?.is_some())
    }

    pub async fn delete_secret(&self, namespace: &str, name: &str) -> Result<()> {
        if self.dry_run {
            tracing::info!(hub = %self.context, namespace, name, "dry-run: skipping secret delete");
            return Ok(());
        }
        let api: Api<Secret> = Api::namespaced(self.client.clone(), namespace);
        let name_owned = name.to_string();
        self.with_retry("delete secret", || {
            let api = api.clone();
            let name = name_owned.clone();
            async move {
                match api.delete(&name, &DeleteParams::default()).await {
                    Ok(_) => Ok(()),
                    Err(e) if is_not_found(&e) => Ok(()),
                    Err(e) => Err(e),
                }
            }
        })
        .await
    }

    pub async fn get_configmap(&self, namespace: &str, name: &str) -> Result<Option<ConfigMap>> {
        let api: Api<ConfigMap> = Api::namespaced(self.client.clone(), namespace);
        let name = name.to_string();
        self.with_retry("get configmap", || {
            let api = api.clone();
            let name = name.clone();
            async move { api.get_opt(&name).await }
        })
        .await
    }

    pub async fn create_or_patch_configmap(
        &self,
        namespace: &str,
        name: &str,
        data: BTreeMap<String, String>,
    ) -> Result<()> {
        if self.dry_run {
            tracing::info!(
                hub = %self.context,
                namespace,
                name,
                data = %serde_json::to_string(&data).unwrap_or_default(),
                "dry-run: skipping configmap write"
            );
            return Ok(());
        }
        let api: Api<ConfigMap> = Api::namespaced(self.client.clone(), namespace);
        let exists = self.get_configmap(namespace, name).await?.is_some();
        let name_owned = name.to_string();
        if exists {
            self.with_retry("patch configmap", || {
                let api = api.clone();
                let name = name_owned.clone();
                let body = json!({"data": data});
                async move {
                    api.patch(&name, &PatchParams::default(), &Patch::Merge(body))
                        .await
                }
            })
            .await?;
        } else {
            let manifest = ConfigMap {
                metadata: kube::api::ObjectMeta {
                    name: Some(name_owned.clone()),
                    namespace: Some(namespace.to_string()),
                    ..Default::default()
                },
                data: Some(data),
                ..Default::default()
            };
            self.with_retry("create configmap", || {
                let api = api.clone();
                let manifest = manifest.clone();
                async move { api.create(&PostParams::default(), &manifest).await }
            })
            .await?;
        }
        Ok(())
    }

    pub async fn delete_configmap(&self, namespace: &str, name: &str) -> Result<()> {
        if self.dry_run {
            tracing::info!(hub = %self.context, namespace, name, "dry-run: skipping configmap delete");
            return Ok(());
        }
        let api: Api<ConfigMap> = Api::namespaced(self.client.clone(), namespace);
        let name_owned = name.to_string();
        self.with_retry("delete configmap", || {
            let api = api.clone();
            let name = name_owned.clone();
            async move {
                match api.delete(&name, &DeleteParams::default()).await {
                    Ok(_) => Ok(()),
                    Err(e) if is_not_found(&e) => Ok(()),
                    Err(e) => Err(e),
                }
            }
        })
        .await
    }

    // ---- access review ----

    /// SelfSubjectAccessReview for the invoking identity. Creating a review
    /// mutates nothing; it runs even in dry-run mode.
    pub async fn can_i(
        &self,
        verb: &str,
        group: &str,
        resource: &str,
        namespace: Option<&str>,
    ) -> Result<bool> {
        let api: Api<SelfSubjectAccessReview> = Api::all(self.client.clone());
        let review = SelfSubjectAccessReview {
            spec: SelfSubjectAccessReviewSpec {
                resource_attributes: Some(ResourceAttributes {
                    verb: Some(verb.to_string()),
                    group: Some(group.to_string()),
                    resource: Some(resource.to_string()),
                    namespace: namespace.map(str::to_string),
                    ..Default::default()
                }),
                ..Default::default()
            },
            ..Default::default()
        };
        let created = self
            .with_retry("self subject access review", || {
                let api = api.clone();
                let review = review.clone();
                async move { api.create(&PostParams::default(), &review).await }
            })
            .await?;
        Ok(created.status.map(|s| s.allowed).unwrap_or(false))
    }
}
