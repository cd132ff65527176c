//! Phase modules. Every step follows the same guard:
//!
//! ```text
//! if !state.is_step_completed(step) {
//!     perform(step);
//!     state.mark_step_completed(step);
//!     state.save_state();        // flush_state() at phase boundaries
//! }
//! ```
//!
//! so a crashed or interrupted run resumes at the last committed step.

pub mod activation;
pub mod decommission;
pub mod finalize;
pub mod post_activation;
pub mod preflight;
pub mod primary_prep;

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::args::{ActivationMethod, Args, Method, OldHubAction};
use crate::error::{Error, Result};
use crate::hub::{GatewayFactory, HubGateway};
use crate::state::{Phase, StateEngine};

pub const CONFIG_ACM_VERSION_PRIMARY: &str = "acm_version_primary";
pub const CONFIG_ACM_VERSION_SECONDARY: &str = "acm_version_secondary";
pub const CONFIG_OBSERVABILITY: &str = "observability";
pub const CONFIG_LATEST_BACKUP_NAME: &str = "latest_backup_name";
pub const CONFIG_LATEST_BACKUP_COMPLETION: &str = "latest_backup_completion";
pub const CONFIG_CADENCE_SECS: &str = "cadence_secs";
pub const CONFIG_SCHEDULE_SNAPSHOT: &str = "backup_schedule_snapshot";
pub const CONFIG_AUTO_IMPORT_OVERRIDDEN: &str = "auto_import_strategy_overridden";
pub const CONFIG_VALIDATED_AT: &str = "validated_at";
pub const CONFIG_ACTIVATED_AT: &str = "activated_at";

/// The pre-prep BackupSchedule, persisted version-neutrally in the config
/// bag so finalization can re-apply it on the new hub.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ScheduleSnapshot {
    pub name: String,
    pub uid: Option<String>,
    pub spec: serde_json::Value,
}

#[derive(Clone, Debug)]
pub struct RunOptions {
    pub method: Method,
    pub activation_method: ActivationMethod,
    pub old_hub_action: OldHubAction,
    pub validate_only: bool,
    pub force: bool,
    pub skip_observability: bool,
    pub skip_rbac: bool,
    pub manage_auto_import_strategy: bool,
    pub disable_observability_on_secondary: bool,
    pub reconnect_concurrency: usize,
    pub kubeconfig_paths: Vec<PathBuf>,
    pub kubeconfig_max_bytes: u64,
    pub fallback_cadence: Duration,
}

impl RunOptions {
    pub fn from_args(args: &Args, kubeconfig_paths: Vec<PathBuf>) -> Self {
        Self {
            method: args.method,
            activation_method: args.activation_method,
            old_hub_action: args.old_hub_action,
            validate_only: args.validate_only,
            force: args.force,
            skip_observability: args.skip_observability_checks,
            skip_rbac: args.skip_rbac_validation,
            manage_auto_import_strategy: args.manage_auto_import_strategy,
            disable_observability_on_secondary: args.disable_observability_on_secondary,
            reconnect_concurrency: args.reconnect_concurrency,
            kubeconfig_paths,
            kubeconfig_max_bytes: args.kubeconfig_max_bytes,
            fallback_cadence: args.fallback_cadence(),
        }
    }
}

/// Everything a phase borrows for the duration of its execution. Phase
/// modules never persist these references.
pub struct Ctx<'a> {
    pub primary: &'a HubGateway,
    pub secondary: &'a HubGateway,
    pub factory: &'a GatewayFactory,
    pub state: &'a mut StateEngine,
    pub cancel: &'a CancellationToken,
    pub opts: RunOptions,
}

impl Ctx<'_> {
    /// Mutations happen and waits are meaningful only outside dry-run.
    pub fn live(&self) -> bool {
        !self.primary.is_dry_run()
    }

    pub fn acm_version(&self) -> Option<semver::Version> {
        self.state
            .config_get::<String>(CONFIG_ACM_VERSION_PRIMARY)
            .and_then(|v| semver::Version::parse(&v).ok())
    }

    pub fn observability(&self) -> bool {
        !self.opts.skip_observability
            && self
                .state
                .config_get::<bool>(CONFIG_OBSERVABILITY)
                .unwrap_or(false)
    }

    pub fn cadence(&self) -> Duration {
        self.state
            .config_get::<u64>(CONFIG_CADENCE_SECS)
            .map(Duration::from_secs)
            .unwrap_or(self.opts.fallback_cadence)
    }
}

pub fn steps_for(phase: Phase) -> Vec<&'static str> {
    match phase {
        Phase::Preflight => preflight::STEPS.to_vec(),
        Phase::PrimaryPrep => primary_prep::STEPS.to_vec(),
        Phase::Activation => activation::STEPS.to_vec(),
        Phase::PostActivation => post_activation::STEPS.to_vec(),
        Phase::Finalization => {
            let mut steps = finalize::STEPS.to_vec();
            steps.extend_from_slice(decommission::STEPS);
            steps
        }
        Phase::Init | Phase::Completed | Phase::Failed => Vec::new(),
    }
}

/// Drive the run from the resumed phase to COMPLETED. On any error the
/// phase is recorded as FAILED with the error appended, and the next
/// invocation resumes at the failing phase.
pub async fn run(cx: &mut Ctx<'_>) -> Result<()> {
    if cx.opts.validate_only {
        return preflight::validate_only(cx).await;
    }

    let mut phase = cx.state.resume_phase();
    if cx.state.current_phase() == Phase::Failed {
        tracing::info!(phase = %phase, "resuming failed run at the errored phase");
        cx.state.set_phase(phase)?;
    }
    if cx.opts.force {
        let steps = steps_for(phase);
        tracing::info!(phase = %phase, "--force: clearing completed steps of the resumed phase");
        cx.state.clear_steps(&steps);
        cx.state.flush_state()?;
    }
    if phase == Phase::Completed {
        tracing::info!("switchover already completed; nothing to do");
        return Ok(());
    }

    loop {
        if cx.cancel.is_cancelled() {
            let err = Error::Cancelled(format!("phase {phase}"));
            record_failure(cx, phase, &err);
            return Err(err);
        }
        let result = match phase {
            Phase::Init => {
                phase = Phase::Preflight;
                cx.state.set_phase(phase)?;
                continue;
            }
            Phase::Preflight => preflight::run(cx).await,
            Phase::PrimaryPrep => primary_prep::run(cx).await,
            Phase::Activation => activation::run(cx).await,
            Phase::PostActivation => post_activation::run(cx).await,
            Phase::Finalization => finalize::run(cx).await,
            Phase::Completed | Phase::Failed => break,
        };
        if let Err(err) = result {
            record_failure(cx, phase, &err);
            return Err(err);
        }
        match phase.next() {
            Some(next) => {
                phase = next;
                cx.state.set_phase(phase)?;
            }
            None => break,
        }
        if phase == Phase::Completed {
            tracing::info!("switchover completed");
            break;
        }
    }
    Ok(())
}

fn record_failure(cx: &mut Ctx<'_>, phase: Phase, err: &Error) {
    tracing::error!(phase = %phase, error = %err, "phase failed");
    // Both calls flush; nothing more we can do if even that fails.
    let _ = cx.state.add_error(phase, &err.to_string());
    let _ = cx.state.set_phase(Phase::Failed);
}
