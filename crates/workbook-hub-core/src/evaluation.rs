//! Evaluation requests and their outcomes.

use serde::{Deserialize, Serialize};

use crate::RequestId;

/// A code snippet submitted by a client for execution by the agent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EvaluationRequest {
    pub request_id: RequestId,
    pub code: String,
}

impl EvaluationRequest {
    /// Create a request with a fresh identifier.
    #[must_use]
    pub fn new(code: impl Into<String>) -> Self {
        Self {
            request_id: RequestId::new(),
            code: code.into(),
        }
    }
}

/// Outcome reported by the agent when an evaluation finishes.
///
/// The hub itself settles a request as [`EvaluationOutcome::Interrupted`]
/// when it is aborted before reaching an agent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum EvaluationOutcome {
    /// Evaluation produced a (rendered) value.
    Success { value: String },
    /// Evaluation failed to compile or threw.
    Failure { message: String },
    /// Evaluation was aborted before it finished.
    Interrupted,
}

impl EvaluationOutcome {
    #[must_use]
    pub fn success(value: impl Into<String>) -> Self {
        Self::Success {
            value: value.into(),
        }
    }

    #[must_use]
    pub fn failure(message: impl Into<String>) -> Self {
        Self::Failure {
            message: message.into(),
        }
    }

    #[must_use]
    pub const fn is_success(&self) -> bool {
        matches!(self, Self::Success { .. })
    }
}

/// Milestones an agent reports while an evaluation is in flight.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EvaluationPhase {
    Compiled,
    Evaluated,
    /// The value has been rendered for display.
    Represented,
}
