use std::path::PathBuf;
use std::time::Duration;

use clap::{Parser, ValueEnum};
use switchover_common::logging::LogFormat;

use crate::error::{Error, Result};

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
pub enum Method {
    /// Activate a previously-prepared passive-sync replica.
    Passive,
    /// One-shot full restore onto the secondary.
    Full,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
pub enum ActivationMethod {
    /// Patch the existing passive-sync restore to own managed clusters.
    Patch,
    /// Delete the passive-sync restore and create an activation restore.
    Restore,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
pub enum OldHubAction {
    /// Demote the old hub to a passive replica.
    Secondary,
    /// Tear the old hub down.
    Decommission,
    /// Leave the old hub untouched.
    None,
}

#[derive(Parser, Debug, Clone)]
#[command(
    name = "acm-switchover",
    about = "Automated switchover of an ACM fleet from one hub to a standby hub",
    version
)]
pub struct Args {
    /// Kubeconfig context of the current primary hub
    #[arg(long)]
    pub primary: String,

    /// Kubeconfig context of the standby hub taking over
    #[arg(long)]
    pub secondary: String,

    /// Switchover method
    #[arg(long, value_enum)]
    pub method: Method,

    /// What happens to the old hub after finalization
    #[arg(long, value_enum)]
    pub old_hub_action: OldHubAction,

    /// Run the preflight validators and stop
    #[arg(long)]
    pub validate_only: bool,

    /// Log intended mutations without issuing them
    #[arg(long)]
    pub dry_run: bool,

    /// How passive-sync activation flips the restore
    #[arg(long, value_enum, default_value = "patch")]
    pub activation_method: ActivationMethod,

    /// Delete observability resources on the old hub when demoting it
    #[arg(long)]
    pub disable_observability_on_secondary: bool,

    /// Force ImportAndSync during activation and revert it afterwards
    #[arg(long)]
    pub manage_auto_import_strategy: bool,

    /// Skip observability scale-down, restart and health checks
    #[arg(long)]
    pub skip_observability_checks: bool,

    /// Skip the SelfSubjectAccessReview preflight checks
    #[arg(long)]
    pub skip_rbac_validation: bool,

    /// Re-run completed steps of the resumed phase
    #[arg(long)]
    pub force: bool,

    /// State directory override; the state file name is derived from the
    /// context pair
    #[arg(long, env = "ACM_SWITCHOVER_STATE_DIR")]
    pub state_dir: Option<PathBuf>,

    /// Debug-level logging
    #[arg(long, short)]
    pub verbose: bool,

    /// Required for decommission: no interactive confirmation is available
    #[arg(long)]
    pub non_interactive: bool,

    /// Log output format
    #[arg(long, default_value = "text")]
    pub log_format: String,

    /// Colon-separated kubeconfig paths; defaults to $KUBECONFIG then
    /// ~/.kube/config
    #[arg(long, env = "KUBECONFIG")]
    pub kubeconfig: Option<String>,

    /// Skip TLS host name verification for the primary hub only
    #[arg(long)]
    pub no_verify_tls_primary: bool,

    /// Skip TLS host name verification for the secondary hub only
    #[arg(long)]
    pub no_verify_tls_secondary: bool,

    /// Seconds to wait for the state-file lock before failing fast
    #[arg(long, default_value_t = 10)]
    pub lock_wait_secs: u64,

    /// Worker pool size for the parallel agent reconnector
    #[arg(long, default_value_t = 10)]
    pub reconnect_concurrency: usize,

    /// Ceiling on each kubeconfig file, in bytes, checked before parsing
    #[arg(long, default_value_t = 10 * 1024 * 1024)]
    pub kubeconfig_max_bytes: u64,

    /// Fallback backup cadence in minutes when the schedule's cron
    /// expression cannot be interpreted
    #[arg(long, default_value_t = 60)]
    pub backup_cadence_mins: u64,
}

impl Args {
    pub fn lock_wait(&self) -> Duration {
        Duration::from_secs(self.lock_wait_secs)
    }

    pub fn fallback_cadence(&self) -> Duration {
        Duration::from_secs(self.backup_cadence_mins * 60)
    }

    pub fn parsed_log_format(&self) -> Result<LogFormat> {
        self.log_format
            .parse()
            .map_err(|e| Error::Validation(format!("{e}")))
    }

    /// Semantic cross-checks that clap cannot express.
    pub fn validate(&self) -> Result<()> {
        validate_context_name(&self.primary)?;
        validate_context_name(&self.secondary)?;
        if self.primary == self.secondary {
            return Err(Error::Validation(
                "primary and secondary contexts must differ".into(),
            ));
        }
        if self.non_interactive && self.old_hub_action != OldHubAction::Decommission {
            return Err(Error::Validation(
                "--non-interactive is only valid with --old-hub-action decommission".into(),
            ));
        }
        if self.old_hub_action == OldHubAction::Decommission && !self.non_interactive {
            return Err(Error::Validation(
                "decommission requires --non-interactive; interactive confirmation is not supported"
                    .into(),
            ));
        }
        if let Some(dir) = &self.state_dir {
            validate_path_component_safety(dir)?;
        }
        if self.reconnect_concurrency == 0 {
            return Err(Error::Validation(
                "--reconnect-concurrency must be at least 1".into(),
            ));
        }
        Ok(())
    }
}

/// Context names feed into file names and log lines; refuse anything that
/// could smuggle traversal or shell metacharacters into helper tooling.
pub fn validate_context_name(name: &str) -> Result<()> {
    if name.is_empty() || name.len() > 253 {
        return Err(Error::Validation(format!(
            "context name must be 1-253 characters, got {:?}",
            name
        )));
    }
    let ok = name
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.' | ':' | '@' | '/'));
    if !ok {
        return Err(Error::Security(format!(
            "context name contains unsafe characters: {name:?}"
        )));
    }
    if name.contains("..") {
        return Err(Error::Security(format!(
            "context name must not contain '..': {name:?}"
        )));
    }
    Ok(())
}

fn validate_path_component_safety(path: &std::path::Path) -> Result<()> {
    let display = path.display().to_string();
    if display.contains('\n') || display.contains('\0') {
        return Err(Error::Security(format!(
            "state directory contains unsafe characters: {display:?}"
        )));
    }
    Ok(())
}

/// Kubernetes resource names must be DNS-1123 subdomains. Applied before
/// any name reaches the gateway.
pub fn validate_resource_name(name: &str) -> Result<()> {
    let valid = !name.is_empty()
        && name.len() <= 253
        && name
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-' || c == '.')
        && !name.starts_with(['-', '.'])
        && !name.ends_with(['-', '.']);
    if valid {
        Ok(())
    } else {
        Err(Error::Validation(format!(
            "not a valid DNS-1123 resource name: {name:?}"
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_args() -> Args {
        Args::parse_from([
            "acm-switchover",
            "--primary",
            "mgmt1",
            "--secondary",
            "mgmt2",
            "--method",
            "passive",
            "--old-hub-action",
            "secondary",
        ])
    }

    #[test]
    fn minimal_invocation_parses() {
        let args = base_args();
        assert_eq!(args.method, Method::Passive);
        assert_eq!(args.activation_method, ActivationMethod::Patch);
        args.validate().expect("valid args");
    }

    #[test]
    fn identical_contexts_are_rejected() {
        let mut args = base_args();
        args.secondary = "mgmt1".into();
        assert!(matches!(args.validate(), Err(Error::Validation(_))));
    }

    #[test]
    fn decommission_requires_non_interactive() {
        let mut args = base_args();
        args.old_hub_action = OldHubAction::Decommission;
        assert!(args.validate().is_err());
        args.non_interactive = true;
        args.validate().expect("gated decommission");
    }

    #[test]
    fn non_interactive_only_valid_with_decommission() {
        let mut args = base_args();
        args.non_interactive = true;
        assert!(args.validate().is_err());
    }

    #[test]
    fn shell_metacharacters_are_a_security_error() {
        assert!(matches!(
            validate_context_name("mgmt1; rm -rf /"),
            Err(Error::Security(_))
        ));
        assert!(matches!(
            validate_context_name("../../etc/passwd"),
            Err(Error::Security(_))
        ));
        validate_context_name("arn:aws:eks:us-east-1:1234:cluster/mgmt1").expect("eks arn");
    }

    #[test]
    fn resource_name_validation() {
        validate_resource_name("restore-acm-activate").unwrap();
        assert!(validate_resource_name("Not-Valid").is_err());
        assert!(validate_resource_name("-leading").is_err());
        assert!(validate_resource_name("").is_err());
    }
}
