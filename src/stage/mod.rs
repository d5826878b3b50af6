//! Stages and their on-disk layout
//!
//! A stage optimises one component of the expert (trigger, confirmation,
//! volume...) across every indicator definition in its source directory.
//! Each `(run, stage)` pair owns `experts/`, `ini_files/` and `results/`
//! under `<output>/<run>/<stage>/`.

mod pipeline;
mod runner;

pub use pipeline::{Pipeline, PipelineReport, StageStatus};
pub use runner::{CandidateReport, RunOptions, StageReport, StageRunner, StepOutcome};

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

use crate::config::ResolvedPaths;
use crate::error::PipelineError;
use crate::persistence;
use crate::render::RendererKind;

/// Trace of generated sources without a compiled binary
pub const UNCOMPILED_LIST_FILE: &str = "00_un_compiled.txt";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageConfig {
    pub name: String,
    /// Metadata directory, relative to `paths.indicator_dir`
    pub indicator_dir: PathBuf,
    /// Template file, relative to `paths.template_dir`
    pub template: PathBuf,
    pub renderer: RendererKind,
    /// Earlier stages whose selection is fixed into this stage's experts
    #[serde(default)]
    pub depends_on: Vec<String>,
}

impl StageConfig {
    fn new(name: &str, indicator_dir: &str, renderer: RendererKind, depends_on: &[&str]) -> Self {
        Self {
            name: name.to_string(),
            indicator_dir: PathBuf::from(indicator_dir),
            template: PathBuf::from(format!("template_{}.mq5", renderer.prefix())),
            renderer,
            depends_on: depends_on.iter().map(|s| s.to_string()).collect(),
        }
    }

    /// Default trend-following pipeline
    pub fn trend_following() -> Vec<StageConfig> {
        const SIGNALS: &str = "trend_following/trigger_conf_exit";
        vec![
            Self::new("Trigger", SIGNALS, RendererKind::Trigger, &[]),
            Self::new("Conformation", SIGNALS, RendererKind::Conformation, &["Trigger"]),
            Self::new(
                "Trendline",
                "trend_following/trendline",
                RendererKind::Trendline,
                &["Trigger", "Conformation"],
            ),
            Self::new(
                "Volume",
                "trend_following/volume",
                RendererKind::Volume,
                &["Trigger", "Conformation", "Trendline"],
            ),
            Self::new(
                "Exit",
                SIGNALS,
                RendererKind::Exit,
                &["Trigger", "Conformation", "Trendline", "Volume"],
            ),
        ]
    }
}

/// Directories owned by one stage of one run
#[derive(Debug, Clone, PartialEq)]
pub struct StageLayout {
    pub root: PathBuf,
    pub experts: PathBuf,
    pub ini_files: PathBuf,
    pub results: PathBuf,
}

impl StageLayout {
    pub fn new(paths: &ResolvedPaths, run_name: &str, stage: &str) -> Self {
        let root = paths.stage_dir(run_name, stage);
        Self {
            experts: root.join("experts"),
            ini_files: root.join("ini_files"),
            results: root.join("results"),
            root,
        }
    }

    pub fn create(&self) -> Result<(), PipelineError> {
        for dir in [&self.experts, &self.ini_files, &self.results] {
            fs::create_dir_all(dir)?;
        }
        debug!(root = %self.root.display(), "Stage directories ready");
        Ok(())
    }
}

/// Candidates whose `.mq5` source has a compiled `.ex5` next to it, sorted.
/// Source-only candidates are listed in [`UNCOMPILED_LIST_FILE`], which is
/// rewritten on every call.
pub fn compiled_candidates(experts_dir: &Path) -> Result<Vec<String>, PipelineError> {
    let mut compiled = Vec::new();
    let mut uncompiled = Vec::new();

    if experts_dir.exists() {
        for entry in fs::read_dir(experts_dir)? {
            let path = entry?.path();
            let is_source = path
                .extension()
                .is_some_and(|e| e.eq_ignore_ascii_case("mq5"));
            if !is_source {
                continue;
            }
            let Some(stem) = path.file_stem().map(|s| s.to_string_lossy().into_owned()) else {
                continue;
            };
            if path.with_extension("ex5").exists() {
                compiled.push(stem);
            } else {
                uncompiled.push(stem);
            }
        }
    }
    compiled.sort();
    uncompiled.sort();

    if !uncompiled.is_empty() {
        warn!(
            count = uncompiled.len(),
            candidates = ?uncompiled,
            "Sources without compiled binary"
        );
    }
    if experts_dir.exists() {
        persistence::write_text(
            &experts_dir.join(UNCOMPILED_LIST_FILE),
            &uncompiled.join("\n"),
        )?;
    }
    Ok(compiled)
}
