use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use chrono::Utc;
use fs2::FileExt;
use serde::Serialize;
use serde::de::DeserializeOwned;

use super::model::{ErrorRecord, Phase, RunState, SCHEMA_VERSION, StepRecord};
use crate::error::{Error, Result};

const LOCK_POLL_INTERVAL: Duration = Duration::from_millis(250);

/// Config-bag key recording that the stored state was produced by a dry run.
pub const DRY_RUN_KEY: &str = "dry_run";

pub fn state_file_name(primary: &str, secondary: &str) -> String {
    format!("switchover-{primary}__{secondary}.json")
}

/// `ACM_SWITCHOVER_STATE_DIR` overrides; a dot-directory under the working
/// directory is the fallback.
pub fn default_state_dir() -> PathBuf {
    match std::env::var_os("ACM_SWITCHOVER_STATE_DIR") {
        Some(dir) if !dir.is_empty() => PathBuf::from(dir),
        _ => PathBuf::from(".acm-switchover"),
    }
}

/// Exclusive owner of the on-disk run-state document and its `.tmp`/`.lock`
/// siblings. Writes are atomic (tmp + fsync + rename); the advisory lock is
/// held for the engine's whole lifetime so concurrent invocations serialize.
#[derive(Debug)]
pub struct StateEngine {
    path: PathBuf,
    tmp_path: PathBuf,
    // NOTE(lifetime): held to maintain the exclusive advisory lock;
    // released on drop.
    _lock_file: File,
    state: RunState,
    dirty: bool,
}

impl StateEngine {
    /// Open (or create) the state document for this hub pair. Performs
    /// orphaned-tmp cleanup, lock acquisition with a bounded wait, and
    /// context adoption: stored contexts must match the caller's exactly or
    /// the state is reset.
    pub fn open(
        dir: &Path,
        primary: &str,
        secondary: &str,
        tool_version: &str,
        dry_run: bool,
        lock_wait: Duration,
    ) -> Result<Self> {
        fs::create_dir_all(dir)?;
        let path = dir.join(state_file_name(primary, secondary));
        let tmp_path = path.with_extension("json.tmp");
        let lock_path = path.with_extension("json.lock");

        let lock_file = acquire_lock(&lock_path, lock_wait)?;
        cleanup_orphaned_tmp(&path, &tmp_path);

        let stored = load_document(&path)?;
        let (state, adopted) = adopt(stored, primary, secondary, tool_version, dry_run);

        let mut engine = Self {
            path,
            tmp_path,
            _lock_file: lock_file,
            state,
            dirty: false,
        };
        if adopted {
            engine.flush_state()?;
        }
        Ok(engine)
    }

    pub fn current_phase(&self) -> Phase {
        self.state.current_phase
    }

    pub fn primary(&self) -> Option<&str> {
        self.state.primary.as_deref()
    }

    pub fn secondary(&self) -> Option<&str> {
        self.state.secondary.as_deref()
    }

    pub fn completed_steps(&self) -> &[StepRecord] {
        &self.state.completed_steps
    }

    pub fn errors(&self) -> &[ErrorRecord] {
        &self.state.errors
    }

    pub fn is_step_completed(&self, name: &str) -> bool {
        self.state.completed_steps.iter().any(|s| s.name == name)
    }

    pub fn mark_step_completed(&mut self, name: &str) {
        if self.is_step_completed(name) {
            return;
        }
        self.state.completed_steps.push(StepRecord {
            name: name.to_string(),
            timestamp: Utc::now(),
        });
        self.dirty = true;
    }

    /// Forget the named steps so `--force` can re-run them.
    pub fn clear_steps(&mut self, names: &[&str]) {
        let before = self.state.completed_steps.len();
        self.state
            .completed_steps
            .retain(|s| !names.contains(&s.name.as_str()));
        if self.state.completed_steps.len() != before {
            self.dirty = true;
        }
    }

    /// Phase transitions are commit points; this always flushes.
    pub fn set_phase(&mut self, phase: Phase) -> Result<()> {
        if self.state.current_phase != phase {
            tracing::info!(phase = %phase, "phase transition");
        }
        self.state.current_phase = phase;
        self.flush_state()
    }

    /// The phase execution should resume at. From `Failed`, rewind to the
    /// last errored phase; completed steps within it stay skipped.
    pub fn resume_phase(&self) -> Phase {
        if self.state.current_phase == Phase::Failed {
            self.state
                .errors
                .last()
                .map(|e| e.phase)
                .unwrap_or(Phase::Init)
        } else {
            self.state.current_phase
        }
    }

    pub fn config_get<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        self.state
            .config
            .get(key)
            .and_then(|v| serde_json::from_value(v.clone()).ok())
    }

    pub fn config_set<T: Serialize>(&mut self, key: &str, value: &T) -> Result<()> {
        let value = serde_json::to_value(value)?;
        if self.state.config.get(key) != Some(&value) {
            self.state.config.insert(key.to_string(), value);
            self.dirty = true;
        }
        Ok(())
    }

    pub fn config_remove(&mut self, key: &str) {
        if self.state.config.remove(key).is_some() {
            self.dirty = true;
        }
    }

    /// Append-only error record; flushes unconditionally.
    pub fn add_error(&mut self, phase: Phase, message: &str) -> Result<()> {
        self.state.errors.push(ErrorRecord {
            phase,
            error: message.to_string(),
            timestamp: Utc::now(),
        });
        self.flush_state()
    }

    /// Write only if a step/config mutation set the dirty flag.
    pub fn save_state(&mut self) -> Result<()> {
        if self.dirty {
            self.write()?;
        }
        Ok(())
    }

    /// Unconditional write. Mandatory on phase transitions, error records,
    /// resets, context adoption, and termination.
    pub fn flush_state(&mut self) -> Result<()> {
        self.write()
    }

    /// Serialize to the sibling tmp file, fsync, rename over the target.
    /// The rename is the commit point.
    fn write(&mut self) -> Result<()> {
        self.state.last_updated = Utc::now();
        let json = serde_json::to_vec_pretty(&self.state)?;
        let mut f = File::create(&self.tmp_path)?;
        f.write_all(&json)?;
        f.sync_all()?;
        fs::rename(&self.tmp_path, &self.path)?;
        self.dirty = false;
        Ok(())
    }
}

impl Drop for StateEngine {
    fn drop(&mut self) {
        // Best-effort flush of buffered updates; phase boundaries and error
        // records have already flushed explicitly.
        if self.dirty {
            let _ = self.write();
        }
    }
}

fn acquire_lock(lock_path: &Path, lock_wait: Duration) -> Result<File> {
    // Avoid truncating before the lock is held.
    let file = OpenOptions::new()
        .create(true)
        .read(true)
        .write(true)
        .truncate(false)
        .open(lock_path)?;
    let deadline = Instant::now() + lock_wait;
    loop {
        match file.try_lock_exclusive() {
            Ok(()) => return Ok(file),
            Err(_) if Instant::now() < deadline => {
                std::thread::sleep(LOCK_POLL_INTERVAL);
            }
            Err(_) => {
                return Err(Error::fatal(format!(
                    "state file is locked by another invocation (waited {lock_wait:?}): {}",
                    lock_path.display()
                )));
            }
        }
    }
}

/// Reclaim a tmp file orphaned by a crash. Safe whenever the committed
/// target is at least as new, or when no commit ever happened.
fn cleanup_orphaned_tmp(path: &Path, tmp_path: &Path) {
    if !tmp_path.exists() {
        return;
    }
    let stale = match (fs::metadata(path), fs::metadata(tmp_path)) {
        (Ok(target), Ok(tmp)) => match (target.modified(), tmp.modified()) {
            (Ok(t), Ok(tm)) => t >= tm,
            _ => false,
        },
        (Err(_), Ok(_)) => true,
        _ => false,
    };
    if stale {
        let _ = fs::remove_file(tmp_path);
    }
}

fn load_document(path: &Path) -> Result<Option<RunState>> {
    let raw = match fs::read(path) {
        Ok(raw) => raw,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    let state: RunState = serde_json::from_slice(&raw).map_err(|e| {
        Error::Validation(format!(
            "state file {} is not a valid run state document: {e}",
            path.display()
        ))
    })?;
    if state.schema_version != SCHEMA_VERSION {
        return Err(Error::Validation(format!(
            "state file {} has schema version {}, expected {SCHEMA_VERSION}",
            path.display(),
            state.schema_version
        )));
    }
    Ok(Some(state))
}

/// Context adoption: resume only a state whose stored contexts both match.
/// Anything else (fresh file, null contexts, mismatch, dry-run leftovers
/// before a live run) starts from a clean document. Returns the state and
/// whether it must be flushed immediately.
fn adopt(
    stored: Option<RunState>,
    primary: &str,
    secondary: &str,
    tool_version: &str,
    dry_run: bool,
) -> (RunState, bool) {
    if let Some(st) = stored {
        let stored_dry_run = st
            .config
            .get(DRY_RUN_KEY)
            .and_then(|v| v.as_bool())
            .unwrap_or(false);
        if st.matches_contexts(primary, secondary) && (dry_run || !stored_dry_run) {
            return (st, false);
        }
        if stored_dry_run && !dry_run {
            tracing::info!("discarding dry-run state before live run");
        } else {
            tracing::info!(
                stored_primary = st.primary.as_deref().unwrap_or("null"),
                stored_secondary = st.secondary.as_deref().unwrap_or("null"),
                "stored contexts do not match; resetting run state"
            );
        }
    }
    let mut fresh = RunState::new(tool_version);
    fresh.primary = Some(primary.to_string());
    fresh.secondary = Some(secondary.to_string());
    if dry_run {
        fresh
            .config
            .insert(DRY_RUN_KEY.to_string(), serde_json::Value::Bool(true));
    }
    (fresh, true)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn open_engine(dir: &Path) -> StateEngine {
        StateEngine::open(dir, "mgmt1", "mgmt2", "0.1.0", false, Duration::from_millis(10))
            .expect("open state engine")
    }

    #[test]
    fn fresh_open_adopts_contexts_and_flushes() {
        let dir = tempfile::tempdir().unwrap();
        let engine = open_engine(dir.path());
        assert_eq!(engine.current_phase(), Phase::Init);
        assert_eq!(engine.primary(), Some("mgmt1"));
        let on_disk = fs::read_to_string(dir.path().join(state_file_name("mgmt1", "mgmt2"))).unwrap();
        let parsed: RunState = serde_json::from_str(&on_disk).unwrap();
        assert_eq!(parsed.secondary.as_deref(), Some("mgmt2"));
    }

    #[test]
    fn steps_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        {
            let mut engine = open_engine(dir.path());
            engine.mark_step_completed("pause_backup_schedule");
            engine.save_state().unwrap();
        }
        let engine = open_engine(dir.path());
        assert!(engine.is_step_completed("pause_backup_schedule"));
        assert!(!engine.is_step_completed("disable_auto_import"));
    }

    #[test]
    fn save_state_is_a_noop_when_clean() {
        let dir = tempfile::tempdir().unwrap();
        let mut engine = open_engine(dir.path());
        let path = dir.path().join(state_file_name("mgmt1", "mgmt2"));
        let before = fs::read_to_string(&path).unwrap();
        engine.save_state().unwrap();
        assert_eq!(before, fs::read_to_string(&path).unwrap());
    }

    #[test]
    fn context_mismatch_resets_state() {
        let dir = tempfile::tempdir().unwrap();
        {
            let mut engine = open_engine(dir.path());
            engine.mark_step_completed("pause_backup_schedule");
            engine.set_phase(Phase::PrimaryPrep).unwrap();
        }
        // Same secondary, different primary: different state file, but also
        // exercise mismatch against a hand-tampered document.
        let path = dir.path().join(state_file_name("mgmt1", "mgmt2"));
        let mut doc: RunState =
            serde_json::from_slice(&fs::read(&path).unwrap()).unwrap();
        doc.primary = Some("other".into());
        fs::write(&path, serde_json::to_vec(&doc).unwrap()).unwrap();

        let engine = open_engine(dir.path());
        assert_eq!(engine.current_phase(), Phase::Init);
        assert!(engine.completed_steps().is_empty());
    }

    #[test]
    fn null_contexts_reset_state() {
        let dir = tempfile::tempdir().unwrap();
        {
            let mut engine = open_engine(dir.path());
            engine.set_phase(Phase::Activation).unwrap();
        }
        let path = dir.path().join(state_file_name("mgmt1", "mgmt2"));
        let mut doc: RunState = serde_json::from_slice(&fs::read(&path).unwrap()).unwrap();
        doc.primary = None;
        fs::write(&path, serde_json::to_vec(&doc).unwrap()).unwrap();

        let engine = open_engine(dir.path());
        assert_eq!(engine.current_phase(), Phase::Init);
    }

    #[test]
    fn resume_phase_rewinds_to_last_errored_phase() {
        let dir = tempfile::tempdir().unwrap();
        let mut engine = open_engine(dir.path());
        engine.set_phase(Phase::PostActivation).unwrap();
        engine
            .add_error(Phase::PostActivation, "verification timed out")
            .unwrap();
        engine.set_phase(Phase::Failed).unwrap();
        assert_eq!(engine.resume_phase(), Phase::PostActivation);
    }

    #[test]
    fn resume_phase_passes_through_when_not_failed() {
        let dir = tempfile::tempdir().unwrap();
        let mut engine = open_engine(dir.path());
        engine.set_phase(Phase::Activation).unwrap();
        assert_eq!(engine.resume_phase(), Phase::Activation);
    }

    #[test]
    fn config_roundtrip_and_removal() {
        let dir = tempfile::tempdir().unwrap();
        let mut engine = open_engine(dir.path());
        engine.config_set("acm_version_primary", &"2.12.7").unwrap();
        assert_eq!(
            engine.config_get::<String>("acm_version_primary").as_deref(),
            Some("2.12.7")
        );
        engine.config_remove("acm_version_primary");
        assert_eq!(engine.config_get::<String>("acm_version_primary"), None);
    }

    #[test]
    fn clear_steps_only_touches_named_steps() {
        let dir = tempfile::tempdir().unwrap();
        let mut engine = open_engine(dir.path());
        engine.mark_step_completed("a");
        engine.mark_step_completed("b");
        engine.clear_steps(&["a"]);
        assert!(!engine.is_step_completed("a"));
        assert!(engine.is_step_completed("b"));
    }

    #[test]
    fn second_engine_fails_fast_while_lock_held() {
        let dir = tempfile::tempdir().unwrap();
        let _held = open_engine(dir.path());
        let err = StateEngine::open(
            dir.path(),
            "mgmt1",
            "mgmt2",
            "0.1.0",
            false,
            Duration::from_millis(50),
        )
        .expect_err("lock is held");
        assert!(matches!(err, Error::Fatal { .. }));
        // The committed document is still valid JSON.
        let raw = fs::read(dir.path().join(state_file_name("mgmt1", "mgmt2"))).unwrap();
        serde_json::from_slice::<RunState>(&raw).unwrap();
    }

    #[test]
    fn orphaned_tmp_is_reclaimed_when_target_is_newer() {
        let dir = tempfile::tempdir().unwrap();
        {
            let _ = open_engine(dir.path());
        }
        let tmp = dir
            .path()
            .join(state_file_name("mgmt1", "mgmt2"))
            .with_extension("json.tmp");
        fs::write(&tmp, b"{\"partial\":").unwrap();
        // Make the committed target strictly newer than the orphan.
        let target = dir.path().join(state_file_name("mgmt1", "mgmt2"));
        let raw = fs::read(&target).unwrap();
        std::thread::sleep(Duration::from_millis(20));
        fs::write(&target, raw).unwrap();
        let _ = open_engine(dir.path());
        assert!(!tmp.exists());
    }

    #[test]
    fn live_run_discards_dry_run_state() {
        let dir = tempfile::tempdir().unwrap();
        {
            let mut engine = StateEngine::open(
                dir.path(),
                "mgmt1",
                "mgmt2",
                "0.1.0",
                true,
                Duration::from_millis(10),
            )
            .unwrap();
            engine.mark_step_completed("pause_backup_schedule");
            engine.set_phase(Phase::Activation).unwrap();
        }
        let engine = open_engine(dir.path());
        assert_eq!(engine.current_phase(), Phase::Init);
        assert!(!engine.is_step_completed("pause_backup_schedule"));
    }

    #[test]
    fn dry_run_resumes_dry_run_state() {
        let dir = tempfile::tempdir().unwrap();
        {
            let mut engine = StateEngine::open(
                dir.path(),
                "mgmt1",
                "mgmt2",
                "0.1.0",
                true,
                Duration::from_millis(10),
            )
            .unwrap();
            engine.set_phase(Phase::Activation).unwrap();
        }
        let engine = StateEngine::open(
            dir.path(),
            "mgmt1",
            "mgmt2",
            "0.1.0",
            true,
            Duration::from_millis(10),
        )
        .unwrap();
        assert_eq!(engine.current_phase(), Phase::Activation);
    }
}
