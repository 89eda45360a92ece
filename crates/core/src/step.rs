//! The fixed, ordered step vocabulary of the demo workflow.

use core::str::FromStr;
use serde::{Deserialize, Serialize};

use crate::error::DomainError;

/// A named workflow step.
///
/// Steps always execute in declaration order; [`Step::ALL`] is the canonical
/// sequence. A step name doubles as a failure-injection point (`fail_at`).
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Step {
    FetchInput,
    Transform,
    ToolCall,
    Finalize,
}

impl Step {
    /// Every step, in execution order.
    pub const ALL: [Step; 4] = [Step::FetchInput, Step::Transform, Step::ToolCall, Step::Finalize];

    pub fn as_str(&self) -> &'static str {
        match self {
            Step::FetchInput => "fetch_input",
            Step::Transform => "transform",
            Step::ToolCall => "tool_call",
            Step::Finalize => "finalize",
        }
    }
}

impl core::fmt::Display for Step {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Step {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Step::ALL
            .into_iter()
            .find(|step| step.as_str() == s)
            .ok_or_else(|| DomainError::unknown_step(s))
    }
}
