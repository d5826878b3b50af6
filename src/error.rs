//! Pipeline error taxonomy
//!
//! Errors are split by blast radius: most of them only abort the candidate
//! being processed, a few abort the whole stage run (see [`PipelineError::aborts_stage`]).

use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum PipelineError {
    /// No usable in-sample result artifact for a candidate
    #[error("no result for '{candidate}' at {}", .path.display())]
    ResultNotFound { candidate: String, path: PathBuf },

    /// A report or summary exists but cannot be interpreted
    #[error("malformed report {}: {reason}", .path.display())]
    MalformedReport { path: PathBuf, reason: String },

    #[error("sort column '{0}' not found in combined results")]
    InvalidSortColumn(String),

    #[error("combined results not found: {}", .0.display())]
    SummaryMissing(PathBuf),

    /// Manual gate: the upstream stage has no selected candidate yet
    #[error("upstream stage '{stage}' has no selection at {}; run it and select a candidate first", .path.display())]
    UpstreamResultMissing { stage: String, path: PathBuf },

    #[error("upstream selection for stage '{stage}' must hold exactly one candidate, found {found}")]
    UpstreamSelection { stage: String, found: usize },

    #[error("invalid parameter '{name}': {reason}")]
    InvalidParameter { name: String, reason: String },

    #[error("indicator metadata for '{candidate}' missing or invalid at {}: {reason}", .path.display())]
    MissingMetadata {
        candidate: String,
        path: PathBuf,
        reason: String,
    },

    /// Another terminal instance is already running against the profile
    #[error("terminal already running: {}", .0.display())]
    TerminalBusy(PathBuf),

    #[error("terminal run failed for {} (exit code {code:?})", .config.display())]
    TerminalFailed { config: PathBuf, code: Option<i32> },

    #[error("terminal report not found: {}", .0.display())]
    ReportMissing(PathBuf),

    #[error("unknown stage '{0}'")]
    UnknownStage(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Csv(#[from] csv::Error),

    #[error(transparent)]
    Yaml(#[from] serde_yaml::Error),

    #[error(transparent)]
    Xml(#[from] quick_xml::Error),
}

impl PipelineError {
    /// Errors that must stop the stage run instead of skipping one candidate.
    pub fn aborts_stage(&self) -> bool {
        matches!(
            self,
            PipelineError::TerminalBusy(_)
                | PipelineError::UpstreamResultMissing { .. }
                | PipelineError::UpstreamSelection { .. }
                | PipelineError::InvalidSortColumn(_)
        )
    }

    pub(crate) fn malformed(path: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        PipelineError::MalformedReport {
            path: path.into(),
            reason: reason.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stage_aborting_errors() {
        assert!(PipelineError::TerminalBusy(PathBuf::from("terminal64.exe")).aborts_stage());
        assert!(PipelineError::InvalidSortColumn("Res_X".into()).aborts_stage());
        assert!(PipelineError::UpstreamResultMissing {
            stage: "Trigger".into(),
            path: PathBuf::from("the_trigger.yaml"),
        }
        .aborts_stage());
    }

    #[test]
    fn test_candidate_scoped_errors() {
        let err = PipelineError::ResultNotFound {
            candidate: "ADX".into(),
            path: PathBuf::from("ADX_IS.csv"),
        };
        assert!(!err.aborts_stage());
        assert!(!PipelineError::ReportMissing(PathBuf::from("ADX_IS.xml")).aborts_stage());
        assert!(!PipelineError::TerminalFailed {
            config: PathBuf::from("ADX_IS.ini"),
            code: Some(1),
        }
        .aborts_stage());
    }
}
