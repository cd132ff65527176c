//! Pre-flight validators. Each validator is a self-contained predicate over
//! one or both hubs; none of them mutates cluster state. The coordinator
//! runs them in declaration order so reports stay deterministic.

pub mod backup;
pub mod clusters;
pub mod hubs;
pub mod kubeconfig;
pub mod rbac;

pub use backup::{
    BackupOperatorPresent, BackupStorageLocationAvailable, DataProtectionApplicationReconciled,
    LatestBackupCompleted, PassiveSyncReady, ScheduleUsesManagedServiceAccount,
};
pub use clusters::{AutoImportStrategyDefault, ClusterDeploymentsPreserved, ManagedClusterCoverage};
pub use hubs::{AcmVersionsMatch, ClusterHealth, NamespacesPresent};
pub use kubeconfig::{KubeconfigIntegrity, KubeconfigSize};
pub use rbac::RbacPermissions;

use std::path::PathBuf;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use owo_colors::OwoColorize;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::args::Method;
use crate::error::{Error, Result};
use crate::hub::HubGateway;

/// Facts collected while validating, reused by later validators and by the
/// phase modules (persisted into the state config bag by preflight).
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct Discovered {
    pub acm_version_primary: Option<String>,
    pub acm_version_secondary: Option<String>,
    pub observability: bool,
    pub latest_backup_name: Option<String>,
    pub latest_backup_completion: Option<DateTime<Utc>>,
    pub cadence_secs: Option<u64>,
}

pub struct ValidationCtx<'a> {
    pub primary: &'a HubGateway,
    pub secondary: &'a HubGateway,
    pub cancel: &'a CancellationToken,
    pub method: Method,
    pub kubeconfig_paths: Vec<PathBuf>,
    pub kubeconfig_max_bytes: u64,
    pub fallback_cadence: Duration,
    pub discovered: Mutex<Discovered>,
}

impl ValidationCtx<'_> {
    pub fn cadence(&self) -> Duration {
        self.discovered
            .lock()
            .expect("discovered lock")
            .cadence_secs
            .map(Duration::from_secs)
            .unwrap_or(self.fallback_cadence)
    }
}

#[derive(Clone, Debug)]
pub struct CheckResult {
    pub name: &'static str,
    pub passed: bool,
    pub message: String,
    pub critical: bool,
}

impl CheckResult {
    pub fn pass(name: &'static str, message: impl Into<String>) -> Self {
        Self {
            name,
            passed: true,
            message: message.into(),
            critical: true,
        }
    }

    pub fn fail(name: &'static str, message: impl Into<String>) -> Self {
        Self {
            name,
            passed: false,
            message: message.into(),
            critical: true,
        }
    }

    pub fn warn(name: &'static str, message: impl Into<String>) -> Self {
        Self {
            name,
            passed: false,
            message: message.into(),
            critical: false,
        }
    }
}

#[async_trait]
pub trait Validator: Send + Sync {
    fn name(&self) -> &'static str;

    async fn run(&self, cx: &ValidationCtx<'_>) -> Result<CheckResult>;
}

/// The default validator suite in its canonical order. Ordering matters:
/// later validators consume facts discovered by earlier ones.
pub fn default_suite(method: Method, skip_rbac: bool) -> Vec<Box<dyn Validator>> {
    let mut suite: Vec<Box<dyn Validator>> = vec![
        Box::new(KubeconfigSize),
        Box::new(KubeconfigIntegrity),
        Box::new(NamespacesPresent),
        Box::new(AcmVersionsMatch),
        Box::new(BackupOperatorPresent),
        Box::new(DataProtectionApplicationReconciled),
        Box::new(LatestBackupCompleted),
        Box::new(BackupStorageLocationAvailable),
        Box::new(ManagedClusterCoverage),
        Box::new(ClusterDeploymentsPreserved),
    ];
    if method == Method::Passive {
        suite.push(Box::new(ScheduleUsesManagedServiceAccount));
        suite.push(Box::new(PassiveSyncReady));
    }
    suite.push(Box::new(AutoImportStrategyDefault));
    suite.push(Box::new(ClusterHealth));
    if !skip_rbac {
        suite.push(Box::new(RbacPermissions));
    }
    suite
}

/// Run every validator, print the report, and fail if any critical check
/// did not pass. Gateway-level errors abort the suite immediately.
pub async fn run_suite(
    cx: &ValidationCtx<'_>,
    validators: &[Box<dyn Validator>],
) -> Result<Vec<CheckResult>> {
    let mut results = Vec::with_capacity(validators.len());
    for validator in validators {
        tracing::debug!(step = validator.name(), "running validator");
        let result = validator.run(cx).await?;
        tracing::info!(
            step = result.name,
            passed = result.passed,
            critical = result.critical,
            "{}",
            result.message
        );
        results.push(result);
    }
    print_report(&results);
    Ok(results)
}

pub fn critical_failures(results: &[CheckResult]) -> Vec<&CheckResult> {
    results.iter().filter(|r| r.critical && !r.passed).collect()
}

pub fn ensure_passed(results: &[CheckResult]) -> Result<()> {
    let failed = critical_failures(results);
    if failed.is_empty() {
        return Ok(());
    }
    let names: Vec<&str> = failed.iter().map(|r| r.name).collect();
    Err(Error::Validation(format!(
        "{} critical preflight check(s) failed: {}",
        failed.len(),
        names.join(", ")
    )))
}

fn print_report(results: &[CheckResult]) {
    println!("\n{}", "Preflight validation report".bold());
    for r in results {
        let marker = if r.passed {
            "✅".to_string()
        } else if r.critical {
            "❌".to_string()
        } else {
            "⚠️".to_string()
        };
        let name = if r.passed {
            r.name.green().to_string()
        } else if r.critical {
            r.name.red().to_string()
        } else {
            r.name.yellow().to_string()
        };
        println!("  {marker} {name}: {}", r.message);
    }
    let failed = critical_failures(results);
    if failed.is_empty() {
        println!("{}\n", "All critical checks passed".green());
    } else {
        println!(
            "{}\n",
            format!("{} critical check(s) failed", failed.len()).red()
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn critical_failure_detection() {
        let results = vec![
            CheckResult::pass("a", "ok"),
            CheckResult::warn("b", "meh"),
            CheckResult::fail("c", "bad"),
        ];
        let failed = critical_failures(&results);
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].name, "c");
        assert!(ensure_passed(&results).is_err());
    }

    #[test]
    fn warnings_do_not_block() {
        let results = vec![CheckResult::pass("a", "ok"), CheckResult::warn("b", "meh")];
        ensure_passed(&results).expect("warnings are not critical");
    }

    #[test]
    fn passive_suite_includes_passive_checks() {
        let passive = default_suite(Method::Passive, false);
        let full = default_suite(Method::Full, false);
        assert!(passive.len() > full.len());
        assert!(passive.iter().any(|v| v.name() == "passive_sync_ready"));
        assert!(!full.iter().any(|v| v.name() == "passive_sync_ready"));
    }

    #[test]
    fn rbac_is_skippable() {
        let suite = default_suite(Method::Full, true);
        assert!(!suite.iter().any(|v| v.name() == "rbac_permissions"));
    }
}
