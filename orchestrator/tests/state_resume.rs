//! Resume and crash-safety laws of the state engine, driven through the
//! public API against real temp directories.

use std::fs;
use std::time::Duration;

use switchover_orchestrator::phases::steps_for;
use switchover_orchestrator::state::{Phase, RunState, StateEngine, state_file_name};

const LOCK_WAIT: Duration = Duration::from_millis(50);

fn open(dir: &std::path::Path) -> StateEngine {
    StateEngine::open(dir, "mgmt1", "mgmt2", "0.1.0", false, LOCK_WAIT).expect("open")
}

fn read_document(dir: &std::path::Path) -> RunState {
    let raw = fs::read(dir.join(state_file_name("mgmt1", "mgmt2"))).expect("state file");
    serde_json::from_slice(&raw).expect("state file is always parseable JSON")
}

#[test]
fn interrupted_run_resumes_at_the_next_incomplete_step() {
    let dir = tempfile::tempdir().unwrap();
    // First invocation: two of four prep steps commit, then the process
    // "crashes" (engine dropped mid-phase).
    {
        let mut engine = open(dir.path());
        engine.set_phase(Phase::PrimaryPrep).unwrap();
        engine.mark_step_completed("snapshot_backup_schedule");
        engine.mark_step_completed("pause_backup_schedule");
        engine.save_state().unwrap();
    }
    // Second invocation sees the same phase with both steps skippable.
    let engine = open(dir.path());
    assert_eq!(engine.resume_phase(), Phase::PrimaryPrep);
    assert!(engine.is_step_completed("snapshot_backup_schedule"));
    assert!(engine.is_step_completed("pause_backup_schedule"));
    assert!(!engine.is_step_completed("disable_auto_import"));
}

#[test]
fn completed_run_has_nothing_left_to_do() {
    let dir = tempfile::tempdir().unwrap();
    {
        let mut engine = open(dir.path());
        for phase in [
            Phase::Preflight,
            Phase::PrimaryPrep,
            Phase::Activation,
            Phase::PostActivation,
            Phase::Finalization,
        ] {
            for step in steps_for(phase) {
                engine.mark_step_completed(step);
            }
            engine.set_phase(phase).unwrap();
        }
        engine.set_phase(Phase::Completed).unwrap();
    }
    let engine = open(dir.path());
    assert_eq!(engine.resume_phase(), Phase::Completed);
    // Every step of every prior phase is durably recorded.
    for phase in [
        Phase::Preflight,
        Phase::PrimaryPrep,
        Phase::Activation,
        Phase::PostActivation,
        Phase::Finalization,
    ] {
        for step in steps_for(phase) {
            assert!(engine.is_step_completed(step), "missing step {step}");
        }
    }
}

#[test]
fn failed_run_rewinds_to_the_errored_phase_with_earlier_steps_intact() {
    let dir = tempfile::tempdir().unwrap();
    {
        let mut engine = open(dir.path());
        engine.set_phase(Phase::Activation).unwrap();
        engine.mark_step_completed("activate_passive_sync");
        engine
            .add_error(Phase::Activation, "restore failed with phase FailedWithErrors")
            .unwrap();
        engine.set_phase(Phase::Failed).unwrap();
    }
    let engine = open(dir.path());
    assert_eq!(engine.current_phase(), Phase::Failed);
    assert_eq!(engine.resume_phase(), Phase::Activation);
    assert!(engine.is_step_completed("activate_passive_sync"));
    let errors = engine.errors();
    assert_eq!(errors.len(), 1);
    assert_eq!(errors[0].phase, Phase::Activation);
}

#[test]
fn on_disk_document_is_valid_json_after_every_commit() {
    let dir = tempfile::tempdir().unwrap();
    let mut engine = open(dir.path());
    for (i, phase) in [Phase::Preflight, Phase::PrimaryPrep, Phase::Activation]
        .into_iter()
        .enumerate()
    {
        engine.mark_step_completed(&format!("step_{i}"));
        engine.set_phase(phase).unwrap();
        let doc = read_document(dir.path());
        assert_eq!(doc.current_phase, phase);
        assert_eq!(doc.completed_steps.len(), i + 1);
        assert_eq!(doc.primary.as_deref(), Some("mgmt1"));
    }
    // No stray tmp file after clean commits.
    assert!(
        !dir.path()
            .join(state_file_name("mgmt1", "mgmt2"))
            .with_extension("json.tmp")
            .exists()
    );
}

#[test]
fn concurrent_invocations_serialize_on_the_lock() {
    let dir = tempfile::tempdir().unwrap();
    let mut first = open(dir.path());
    first.set_phase(Phase::Preflight).unwrap();

    let second = StateEngine::open(dir.path(), "mgmt1", "mgmt2", "0.1.0", false, LOCK_WAIT);
    assert!(second.is_err(), "second invocation must not share the lock");
    // The loser never corrupted the winner's document.
    let doc = read_document(dir.path());
    assert_eq!(doc.current_phase, Phase::Preflight);

    drop(first);
    // Once the first invocation exits, the next one proceeds.
    let third = open(dir.path());
    assert_eq!(third.resume_phase(), Phase::Preflight);
}

#[test]
fn mismatched_contexts_start_fresh() {
    let dir = tempfile::tempdir().unwrap();
    {
        let mut engine = open(dir.path());
        engine.set_phase(Phase::Activation).unwrap();
        engine.mark_step_completed("activate_passive_sync");
        engine.save_state().unwrap();
    }
    // Same pair resumes.
    {
        let engine = open(dir.path());
        assert_eq!(engine.resume_phase(), Phase::Activation);
    }
    // A different pair writes a different file and starts at INIT.
    let other = StateEngine::open(dir.path(), "mgmt3", "mgmt2", "0.1.0", false, LOCK_WAIT)
        .expect("open with different contexts");
    assert_eq!(other.current_phase(), Phase::Init);
    assert!(!other.is_step_completed("activate_passive_sync"));
}
