//! Skill failures and their wire classification.

use std::path::PathBuf;
use std::time::Duration;

use kakehashi_types::SkillErrorKind;
use thiserror::Error;

use crate::engine::GuestFailure;

#[derive(Debug, Error)]
pub enum SkillError {
    #[error("skill '{name}' not found: {path}")]
    NotFound { name: String, path: PathBuf },

    #[error("skill '{name}' must define an 'execute' or 'main' function")]
    InvalidSkill { name: String },

    #[error("failed to load skill '{name}' after {attempts} attempts: {source}")]
    Load {
        name: String,
        attempts: u32,
        #[source]
        source: anyhow::Error,
    },

    #[error("skill '{name}' timed out after {after:?}")]
    Timeout { name: String, after: Duration },

    #[error("skill '{name}' failed: {failure}")]
    Runtime { name: String, failure: GuestFailure },
}

impl SkillError {
    pub fn kind(&self) -> SkillErrorKind {
        match self {
            SkillError::NotFound { .. } => SkillErrorKind::NotFound,
            SkillError::InvalidSkill { .. } => SkillErrorKind::InvalidSkill,
            SkillError::Load { .. } => SkillErrorKind::LoadError,
            SkillError::Timeout { .. } => SkillErrorKind::Timeout,
            SkillError::Runtime { .. } => SkillErrorKind::RuntimeError,
        }
    }

    /// Short message for the report; the trace travels separately.
    pub fn message(&self) -> String {
        match self {
            SkillError::Runtime { failure, .. } => failure.message.clone(),
            other => other.to_string(),
        }
    }

    pub fn traceback(&self) -> Option<&str> {
        match self {
            SkillError::Runtime { failure, .. } => Some(&failure.trace),
            _ => None,
        }
    }
}
