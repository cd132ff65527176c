use std::sync::Mutex;

use chrono::Utc;

use super::{
    CONFIG_ACM_VERSION_PRIMARY, CONFIG_ACM_VERSION_SECONDARY, CONFIG_CADENCE_SECS,
    CONFIG_LATEST_BACKUP_COMPLETION, CONFIG_LATEST_BACKUP_NAME, CONFIG_OBSERVABILITY,
    CONFIG_VALIDATED_AT, Ctx,
};
use crate::error::Result;
use crate::resources;
use crate::validate::{self, Discovered, ValidationCtx};

const STEP_PREFLIGHT_CHECKS: &str = "preflight_checks";

pub const STEPS: &[&str] = &[STEP_PREFLIGHT_CHECKS];

pub async fn run(cx: &mut Ctx<'_>) -> Result<()> {
    if cx.state.is_step_completed(STEP_PREFLIGHT_CHECKS) {
        tracing::debug!(step = STEP_PREFLIGHT_CHECKS, "step already completed");
        return Ok(());
    }
    let discovered = run_checks(cx).await?;
    persist_discovered(cx, &discovered)?;
    cx.state.mark_step_completed(STEP_PREFLIGHT_CHECKS);
    cx.state.save_state()?;
    Ok(())
}

/// A validate-only run performs the whole preflight without advancing the
/// phase; only a `validated_at` marker is recorded.
pub async fn validate_only(cx: &mut Ctx<'_>) -> Result<()> {
    let discovered = run_checks(cx).await?;
    persist_discovered(cx, &discovered)?;
    cx.state
        .config_set(CONFIG_VALIDATED_AT, &Utc::now().to_rfc3339())?;
    cx.state.flush_state()?;
    tracing::info!("validation passed; phase left unchanged");
    Ok(())
}

async fn run_checks(cx: &Ctx<'_>) -> Result<Discovered> {
    let vcx = ValidationCtx {
        primary: cx.primary,
        secondary: cx.secondary,
        cancel: cx.cancel,
        method: cx.opts.method,
        kubeconfig_paths: cx.opts.kubeconfig_paths.clone(),
        kubeconfig_max_bytes: cx.opts.kubeconfig_max_bytes,
        fallback_cadence: cx.opts.fallback_cadence,
        discovered: Mutex::new(Discovered::default()),
    };
    let suite = validate::default_suite(cx.opts.method, cx.opts.skip_rbac);
    let results = validate::run_suite(&vcx, &suite).await?;
    validate::ensure_passed(&results)?;

    let mut discovered = vcx.discovered.into_inner().expect("discovered lock");
    discovered.observability = detect_observability(cx).await?;
    Ok(discovered)
}

/// Observability is optional; its presence drives the scale-down and
/// restart steps of later phases.
async fn detect_observability(cx: &Ctx<'_>) -> Result<bool> {
    if cx.opts.skip_observability {
        return Ok(false);
    }
    let mcos = cx
        .primary
        .list_resources(
            &resources::multi_cluster_observability(),
            None,
            &crate::hub::ListQuery::default(),
        )
        .await?;
    Ok(!mcos.is_empty())
}

fn persist_discovered(cx: &mut Ctx<'_>, discovered: &Discovered) -> Result<()> {
    cx.state
        .config_set(CONFIG_ACM_VERSION_PRIMARY, &discovered.acm_version_primary)?;
    cx.state.config_set(
        CONFIG_ACM_VERSION_SECONDARY,
        &discovered.acm_version_secondary,
    )?;
    cx.state
        .config_set(CONFIG_OBSERVABILITY, &discovered.observability)?;
    cx.state
        .config_set(CONFIG_LATEST_BACKUP_NAME, &discovered.latest_backup_name)?;
    cx.state.config_set(
        CONFIG_LATEST_BACKUP_COMPLETION,
        &discovered.latest_backup_completion,
    )?;
    cx.state
        .config_set(CONFIG_CADENCE_SECS, &discovered.cadence_secs)?;
    cx.state.save_state()?;
    Ok(())
}
