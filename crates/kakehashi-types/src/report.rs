//! Skill execution reports.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use strum::{Display, EnumString, IntoStaticStr};

/// Failure category of a skill invocation, rendered as `error_type`.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, EnumString, IntoStaticStr,
)]
pub enum SkillErrorKind {
    /// Skill directory or entry file is missing.
    NotFound,
    /// Loaded package exposes neither `execute` nor `main`.
    InvalidSkill,
    /// Every load attempt failed.
    LoadError,
    /// The invocation exceeded its deadline.
    Timeout,
    /// The entry point raised an error.
    RuntimeError,
}

/// Outcome of one skill invocation.
///
/// Failures are reports, not errors: the loader never lets a skill failure
/// escape past its boundary.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SkillReport {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_type: Option<SkillErrorKind>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub traceback: Option<String>,
    /// Wall-clock seconds.
    pub execution_time: f64,
    pub skill: String,
}

impl SkillReport {
    pub fn success(skill: impl Into<String>, result: Value, execution_time: f64) -> Self {
        Self {
            success: true,
            result: Some(result),
            error: None,
            error_type: None,
            traceback: None,
            execution_time,
            skill: skill.into(),
        }
    }

    pub fn failure(
        skill: impl Into<String>,
        kind: SkillErrorKind,
        error: impl Into<String>,
        execution_time: f64,
    ) -> Self {
        Self {
            success: false,
            result: None,
            error: Some(error.into()),
            error_type: Some(kind),
            traceback: None,
            execution_time,
            skill: skill.into(),
        }
    }

    pub fn with_traceback(mut self, traceback: impl Into<String>) -> Self {
        self.traceback = Some(traceback.into());
        self
    }
}
