use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub const SCHEMA_VERSION: u32 = 1;

/// Phase of a switchover run. The success path is totally ordered; `Failed`
/// is the orthogonal terminal value for any unrecoverable step.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Phase {
    Init,
    Preflight,
    PrimaryPrep,
    Activation,
    PostActivation,
    Finalization,
    Completed,
    Failed,
}

impl Phase {
    pub const SUCCESS_PATH: [Phase; 7] = [
        Phase::Init,
        Phase::Preflight,
        Phase::PrimaryPrep,
        Phase::Activation,
        Phase::PostActivation,
        Phase::Finalization,
        Phase::Completed,
    ];

    /// The next phase on the success path. Terminal values have none.
    pub fn next(self) -> Option<Phase> {
        let idx = Self::SUCCESS_PATH.iter().position(|p| *p == self)?;
        Self::SUCCESS_PATH.get(idx + 1).copied()
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Phase::Completed | Phase::Failed)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Phase::Init => "INIT",
            Phase::Preflight => "PREFLIGHT",
            Phase::PrimaryPrep => "PRIMARY_PREP",
            Phase::Activation => "ACTIVATION",
            Phase::PostActivation => "POST_ACTIVATION",
            Phase::Finalization => "FINALIZATION",
            Phase::Completed => "COMPLETED",
            Phase::Failed => "FAILED",
        }
    }
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StepRecord {
    pub name: String,
    pub timestamp: DateTime<Utc>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ErrorRecord {
    pub phase: Phase,
    pub error: String,
    pub timestamp: DateTime<Utc>,
}

/// The single persisted document per (primary, secondary) pair.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RunState {
    pub schema_version: u32,
    pub tool_version: String,
    pub created_at: DateTime<Utc>,
    pub last_updated: DateTime<Utc>,
    pub current_phase: Phase,
    pub primary: Option<String>,
    pub secondary: Option<String>,
    pub completed_steps: Vec<StepRecord>,
    pub config: serde_json::Map<String, serde_json::Value>,
    pub errors: Vec<ErrorRecord>,
}

impl RunState {
    pub fn new(tool_version: &str) -> Self {
        let now = Utc::now();
        Self {
            schema_version: SCHEMA_VERSION,
            tool_version: tool_version.to_string(),
            created_at: now,
            last_updated: now,
            current_phase: Phase::Init,
            primary: None,
            secondary: None,
            completed_steps: Vec::new(),
            config: serde_json::Map::new(),
            errors: Vec::new(),
        }
    }

    /// Valid for reuse iff both stored contexts are non-null and equal to the
    /// caller's. A stored null never matches anything.
    pub fn matches_contexts(&self, primary: &str, secondary: &str) -> bool {
        self.primary.as_deref() == Some(primary) && self.secondary.as_deref() == Some(secondary)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn success_path_ordering() {
        assert_eq!(Phase::Init.next(), Some(Phase::Preflight));
        assert_eq!(Phase::Preflight.next(), Some(Phase::PrimaryPrep));
        assert_eq!(Phase::Finalization.next(), Some(Phase::Completed));
        assert_eq!(Phase::Completed.next(), None);
        assert_eq!(Phase::Failed.next(), None);
    }

    #[test]
    fn phase_serializes_to_screaming_snake() {
        assert_eq!(
            serde_json::to_string(&Phase::PostActivation).unwrap(),
            "\"POST_ACTIVATION\""
        );
        let parsed: Phase = serde_json::from_str("\"PRIMARY_PREP\"").unwrap();
        assert_eq!(parsed, Phase::PrimaryPrep);
    }

    #[test]
    fn null_contexts_never_match() {
        let mut st = RunState::new("0.1.0");
        assert!(!st.matches_contexts("a", "b"));
        st.primary = Some("a".into());
        assert!(!st.matches_contexts("a", "b"));
        st.secondary = Some("b".into());
        assert!(st.matches_contexts("a", "b"));
        assert!(!st.matches_contexts("c", "b"));
    }
}
