use candid::CandidType;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Failures surfaced to callers of the subscription and execution endpoints.
///
/// Rejected on-chain actions are not represented here: they are captured in
/// the tool result and logged as data.
#[derive(CandidType, Serialize, Deserialize, Clone, Debug, Error, PartialEq, Eq)]
pub enum AgentError {
    #[error("not found: {0}")]
    NotFound(String),
    #[error("unauthorized: {0}")]
    Unauthorized(String),
    #[error("validation failed: {0}")]
    Validation(String),
    #[error("decision engine failed: {0}")]
    Inference(String),
    #[error("storage failure: {0}")]
    Storage(String),
}

impl AgentError {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::NotFound(_) => "not_found",
            Self::Unauthorized(_) => "unauthorized",
            Self::Validation(_) => "validation",
            Self::Inference(_) => "inference",
            Self::Storage(_) => "storage",
        }
    }
}
