use crate::domain::types::{CycleEvent, CycleState, TransitionError};

pub fn transition(current: &CycleState, event: &CycleEvent) -> Result<CycleState, TransitionError> {
    match (current, event) {
        (CycleState::Idle, CycleEvent::Started) => Ok(CycleState::Running),
        (CycleState::Running, CycleEvent::EngineReturned { tool_calls }) if *tool_calls > 0 => {
            Ok(CycleState::Executed)
        }
        (CycleState::Running, CycleEvent::EngineReturned { .. }) => Ok(CycleState::Analysed),
        (CycleState::Running, CycleEvent::EngineFailed { .. }) => Ok(CycleState::Failed),
        _ => Err(TransitionError {
            from: *current,
            event: format!("{event:?}"),
            reason: "invalid transition".to_string(),
        }),
    }
}
