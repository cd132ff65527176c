//! Typed, retry-wrapped, dry-run-aware access to one hub's Kubernetes API.

mod gateway;
mod retry;

pub use gateway::{HubGateway, ListQuery, PatchOutcome};
pub use retry::{RetryPolicy, is_not_found, is_retryable};

use std::path::PathBuf;
use std::time::Duration;

use kube::config::{KubeConfigOptions, Kubeconfig};
use tokio_util::sync::CancellationToken;

use crate::error::{Error, Result};

pub const DEFAULT_READ_TIMEOUT: Duration = Duration::from_secs(30);
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Resolve the kubeconfig file list: an explicit `--kubeconfig` value wins,
/// then `$KUBECONFIG`, then `~/.kube/config`. Multiple paths are
/// colon-separated, kubectl-style.
pub fn kubeconfig_paths(explicit: Option<&str>) -> Vec<PathBuf> {
    let joined = match explicit {
        Some(v) => v.to_string(),
        None => match std::env::var("KUBECONFIG") {
            Ok(v) if !v.is_empty() => v,
            _ => {
                return std::env::home_dir()
                    .map(|h| vec![h.join(".kube").join("config")])
                    .unwrap_or_default();
            }
        },
    };
    joined
        .split(':')
        .filter(|p| !p.is_empty())
        .map(PathBuf::from)
        .collect()
}

/// Builds per-context gateways from one merged kubeconfig. Each gateway owns
/// its own client; TLS policy and timeouts are per-handle, never
/// process-global.
pub struct GatewayFactory {
    kubeconfig: Kubeconfig,
    paths: Vec<PathBuf>,
    read_timeout: Duration,
    connect_timeout: Duration,
    dry_run: bool,
    cancel: CancellationToken,
}

impl GatewayFactory {
    pub fn load(
        paths: Vec<PathBuf>,
        max_file_bytes: u64,
        read_timeout: Duration,
        connect_timeout: Duration,
        dry_run: bool,
        cancel: CancellationToken,
    ) -> Result<Self> {
        if paths.is_empty() {
            return Err(Error::Validation(
                "no kubeconfig file found; set --kubeconfig or $KUBECONFIG".into(),
            ));
        }
        let mut merged: Option<Kubeconfig> = None;
        for path in &paths {
            // Size ceiling is enforced before any parsing happens.
            let len = std::fs::metadata(path).map(|m| m.len()).unwrap_or(0);
            if len > max_file_bytes {
                return Err(Error::Validation(format!(
                    "kubeconfig {} is {len} bytes, above the {max_file_bytes}-byte ceiling",
                    path.display()
                )));
            }
            let piece = Kubeconfig::read_from(path).map_err(|e| {
                Error::Validation(format!("failed to read kubeconfig {}: {e}", path.display()))
            })?;
            merged = Some(match merged {
                None => piece,
                Some(acc) => acc.merge(piece).map_err(|e| {
                    Error::Validation(format!("failed to merge kubeconfig files: {e}"))
                })?,
            });
        }
        Ok(Self {
            kubeconfig: merged.expect("at least one kubeconfig path"),
            paths,
            read_timeout,
            connect_timeout,
            dry_run,
            cancel,
        })
    }

    pub fn paths(&self) -> &[PathBuf] {
        &self.paths
    }

    pub fn has_context(&self, context: &str) -> bool {
        self.kubeconfig.contexts.iter().any(|c| c.name == context)
    }

    pub async fn build(&self, context: &str, verify_tls: bool) -> Result<HubGateway> {
        let options = KubeConfigOptions {
            context: Some(context.to_string()),
            ..Default::default()
        };
        let mut config = kube::Config::from_custom_kubeconfig(self.kubeconfig.clone(), &options)
            .await
            .map_err(|e| {
                Error::Validation(format!("failed to load context {context:?}: {e}"))
            })?;
        config.read_timeout = Some(self.read_timeout);
        config.connect_timeout = Some(self.connect_timeout);
        config.accept_invalid_certs = !verify_tls;
        let client = kube::Client::try_from(config)
            .map_err(|e| Error::api(format!("failed to build client for {context:?}"), e))?;
        Ok(HubGateway::new(
            client,
            context.to_string(),
            self.dry_run,
            RetryPolicy::default(),
            self.cancel.clone(),
        ))
    }
}
