//! Task specification loading and validation.
//!
//! A task spec is the structured input required to start a session:
//! a goal, a definition of done, optional constraints, and the list of
//! evidence paths whose existence is the terminal pass/fail signal.
//! Specs are read from YAML or JSON files, auto-detected by extension.

use serde::{Deserialize, Serialize};
use std::path::Path;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SpecError {
    #[error("failed to read spec file: {0}")]
    Read(#[from] std::io::Error),

    #[error("failed to parse JSON spec: {0}")]
    Json(#[from] serde_json::Error),

    #[error("failed to parse YAML spec: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("unsupported spec format: {0} (use .json or .yaml)")]
    UnsupportedFormat(String),
}

/// Structured task input for a session.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TaskSpec {
    pub goal: String,

    pub definition_of_done: String,

    #[serde(default)]
    pub constraints: Vec<String>,

    /// Paths whose existence verifies completion.
    #[serde(default)]
    pub evidence: Vec<String>,
}

/// Outcome of a validation pass over a spec.
#[derive(Debug, Clone, Default)]
pub struct SpecValidation {
    pub valid: bool,
    pub warnings: Vec<String>,
    pub errors: Vec<String>,
}

impl TaskSpec {
    /// Load a task spec from a YAML or JSON file, selected by extension.
    pub fn load(path: &Path) -> Result<Self, SpecError> {
        let data = std::fs::read_to_string(path)?;

        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or_default()
            .to_ascii_lowercase();

        match ext.as_str() {
            "json" => Ok(serde_json::from_str(&data)?),
            "yaml" | "yml" => Ok(serde_yaml::from_str(&data)?),
            other => Err(SpecError::UnsupportedFormat(other.to_string())),
        }
    }

    /// Check the spec for completeness.
    ///
    /// Errors make the spec unusable; warnings are advisory and do not
    /// block execution.
    pub fn validate(&self) -> SpecValidation {
        let mut res = SpecValidation {
            valid: true,
            ..Default::default()
        };

        if self.goal.is_empty() {
            res.valid = false;
            res.errors.push("Goal is required".to_string());
        } else if self.goal.len() < 10 {
            res.warnings
                .push("Goal is very short; consider adding more detail".to_string());
        }

        if self.definition_of_done.is_empty() {
            res.valid = false;
            res.errors
                .push("Definition of Done (DoD) is required".to_string());
        }

        if self.constraints.is_empty() {
            res.warnings
                .push("No constraints specified. Are there really no limits?".to_string());
        }

        if self.evidence.is_empty() {
            res.valid = false;
            res.errors
                .push("Evidence (verification paths) is required".to_string());
        }

        res
    }
}
