//! Multi-stage driver

use serde::Serialize;
use std::path::PathBuf;
use tracing::{error, info};

use crate::config::{AppConfig, ResolvedPaths};
use crate::error::PipelineError;
use crate::terminal::TesterTerminal;

use super::{RunOptions, StageReport, StageRunner};

/// Where the pipeline stopped
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum StageStatus {
    /// Every configured stage ran
    Completed,
    /// `stage` waits for an operator to pick the winner of `upstream`
    AwaitingSelection {
        stage: String,
        upstream: String,
        selection: PathBuf,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PipelineReport {
    pub stages: Vec<StageReport>,
    pub status: StageStatus,
}

/// Runs the configured stages in order
pub struct Pipeline<'a, T: TesterTerminal> {
    config: &'a AppConfig,
    runner: StageRunner<'a, T>,
}

impl<'a, T: TesterTerminal> Pipeline<'a, T> {
    pub fn new(config: &'a AppConfig, paths: &'a ResolvedPaths, terminal: &'a T) -> Self {
        Self {
            config,
            runner: StageRunner::new(config, paths, terminal),
        }
    }

    /// Run stages until one is gated by a missing upstream selection. The
    /// gate is a normal stop, every other aborting error is returned.
    pub fn run(&self, options: &RunOptions) -> Result<PipelineReport, PipelineError> {
        let mut stages = Vec::new();

        for stage in &self.config.pipeline.stages {
            match self.runner.run(stage, options) {
                Ok(report) => stages.push(report),
                Err(PipelineError::UpstreamResultMissing { stage: upstream, path }) => {
                    info!(
                        stage = %stage.name,
                        upstream = %upstream,
                        selection = %path.display(),
                        "Pipeline paused: select a candidate for the upstream stage and run again"
                    );
                    return Ok(PipelineReport {
                        stages,
                        status: StageStatus::AwaitingSelection {
                            stage: stage.name.clone(),
                            upstream,
                            selection: path,
                        },
                    });
                }
                Err(e) => {
                    error!(stage = %stage.name, error = %e, "Stage aborted");
                    return Err(e);
                }
            }
        }

        info!(stages = stages.len(), "Pipeline complete");
        Ok(PipelineReport {
            stages,
            status: StageStatus::Completed,
        })
    }
}
