use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    #[default]
    Idle,
    Analyzing,
    Generating,
    Complete,
    Error,
    /// Quota ran out and the run is parked until a new credential arrives.
    AwaitingCredential,
}

impl Stage {
    /// A new run may only start from a settled stage.
    pub fn accepts_new_run(self) -> bool {
        !matches!(self, Self::Analyzing | Self::Generating)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessingState {
    pub stage: Stage,
    pub progress_message: String,
    pub total_scenes: usize,
    /// Loop index of the scene currently being worked, not a count of
    /// finished scenes. Progress bars read it as "position in the batch".
    pub completed_scenes: usize,
}

impl ProcessingState {
    pub fn idle() -> Self {
        Self::default()
    }
}

#[cfg(test)]
mod tests {
    use super::{ProcessingState, Stage};

    #[test]
    fn busy_stages_reject_new_runs() {
        assert!(Stage::Idle.accepts_new_run());
        assert!(Stage::Complete.accepts_new_run());
        assert!(Stage::Error.accepts_new_run());
        assert!(Stage::AwaitingCredential.accepts_new_run());
        assert!(!Stage::Analyzing.accepts_new_run());
        assert!(!Stage::Generating.accepts_new_run());
    }

    #[test]
    fn stage_serializes_snake_case() -> anyhow::Result<()> {
        let state = ProcessingState {
            stage: Stage::AwaitingCredential,
            ..ProcessingState::idle()
        };
        let value = serde_json::to_value(&state)?;
        assert_eq!(value["stage"], "awaiting_credential");
        Ok(())
    }
}
