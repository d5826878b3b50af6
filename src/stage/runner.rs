//! Stage runner
//!
//! Drives every compiled candidate of a stage through
//! NotStarted -> IS running -> IS done -> OOS running -> OOS done.
//! Steps whose artifacts already exist are skipped, so an interrupted stage
//! can simply be run again.

use serde::Serialize;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

use crate::config::{AppConfig, PipelineConfig, ResolvedPaths};
use crate::error::PipelineError;
use crate::indicators::{find_definition, IndicatorDefinition};
use crate::render::{ExpertGenerator, GenerationReport};
use crate::reports::copy_report;
use crate::results::{extract, extract_top, update_summary};
use crate::run_config::{RunConfig, RunConfigBuilder};
use crate::terminal::{ensure_idle, TesterTerminal};
use crate::types::{CandidateState, RunResult, SampleMode};
use crate::upstream;

use super::{compiled_candidates, StageConfig, StageLayout};

#[derive(Debug, Clone, PartialEq)]
pub struct RunOptions {
    /// Regenerate and compile experts before running
    pub recompile: bool,
    pub top_n: usize,
    pub sort_by: String,
}

impl RunOptions {
    pub fn from_config(pipeline: &PipelineConfig) -> Self {
        Self {
            recompile: pipeline.recompile,
            top_n: pipeline.top_n,
            sort_by: pipeline.sort_by.clone(),
        }
    }
}

/// What happened to one step of a candidate
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", content = "reason", rename_all = "snake_case")]
pub enum StepOutcome {
    /// The terminal was invoked
    Executed,
    /// An existing artifact was used
    Reused,
    Failed(String),
    NotAttempted,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CandidateReport {
    pub candidate: String,
    pub final_state: CandidateState,
    pub in_sample: StepOutcome,
    pub out_of_sample: StepOutcome,
    /// Terminal invocations made for this candidate
    pub invocations: usize,
}

impl CandidateReport {
    fn new(candidate: &str) -> Self {
        Self {
            candidate: candidate.to_string(),
            final_state: CandidateState::NotStarted,
            in_sample: StepOutcome::NotAttempted,
            out_of_sample: StepOutcome::NotAttempted,
            invocations: 0,
        }
    }

    fn transition(&mut self, to: CandidateState) {
        info!(
            candidate = %self.candidate,
            from = %self.final_state,
            to = %to,
            "Candidate state"
        );
        self.final_state = to;
    }

    /// Mark the step in progress as failed
    fn fail(&mut self, error: &PipelineError) {
        let reason = StepOutcome::Failed(error.to_string());
        match self.final_state {
            CandidateState::OutOfSampleRunning | CandidateState::InSampleDone => {
                self.out_of_sample = reason
            }
            _ => self.in_sample = reason,
        }
        self.transition(CandidateState::Failed);
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct StageReport {
    pub stage: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub generation: Option<GenerationReport>,
    pub candidates: Vec<CandidateReport>,
    /// Candidates the aggregator could not summarise
    pub failed: Vec<String>,
    /// Top-N candidates, best first
    pub top: Vec<String>,
}

impl StageReport {
    pub fn invocations(&self) -> usize {
        self.candidates.iter().map(|c| c.invocations).sum()
    }
}

/// Runs the stages of one configured run against a tester terminal
pub struct StageRunner<'a, T: TesterTerminal> {
    config: &'a AppConfig,
    paths: &'a ResolvedPaths,
    terminal: &'a T,
}

impl<'a, T: TesterTerminal> StageRunner<'a, T> {
    pub fn new(config: &'a AppConfig, paths: &'a ResolvedPaths, terminal: &'a T) -> Self {
        Self {
            config,
            paths,
            terminal,
        }
    }

    pub fn run(&self, stage: &StageConfig, options: &RunOptions) -> Result<StageReport, PipelineError> {
        let run_name = &self.config.project.run_name;
        info!(stage = %stage.name, run = %run_name, "Starting stage");

        ensure_idle(self.terminal)?;
        for upstream_name in &stage.depends_on {
            let upstream_stage = self.config.stage(upstream_name)?;
            upstream::load(self.paths, run_name, upstream_stage)?;
        }

        let layout = StageLayout::new(self.paths, run_name, &stage.name);
        layout.create()?;

        if let Err(e) = self.terminal.clear_test_cache() {
            warn!(error = %e, "Could not clear test cache");
        }

        let mut report = StageReport {
            stage: stage.name.clone(),
            ..StageReport::default()
        };
        if options.recompile {
            let generator = ExpertGenerator::new(self.config, self.paths);
            report.generation = Some(generator.generate(stage, &layout, self.terminal)?);
        }

        let candidates = compiled_candidates(&layout.experts)?;
        if candidates.is_empty() {
            warn!(experts = %layout.experts.display(), "No compiled candidates");
        }
        info!(stage = %stage.name, candidates = candidates.len(), "Processing candidates");

        let builder = RunConfigBuilder::new(
            &self.config.project,
            self.config.optimisation_for(&stage.name),
            &self.paths.experts_dir,
        );

        for candidate in &candidates {
            let mut outcome = CandidateReport::new(candidate);
            if let Err(e) = self.process_candidate(stage, &layout, &builder, &mut outcome) {
                if e.aborts_stage() {
                    return Err(e);
                }
                warn!(candidate = %candidate, error = %e, "Candidate failed");
                outcome.fail(&e);
            }
            report.candidates.push(outcome);

            let (_, failed) = update_summary(&layout.results, Some(&stage.name), false)?;
            report.failed = failed;
        }

        if candidates.is_empty() {
            let (_, failed) = update_summary(&layout.results, Some(&stage.name), false)?;
            report.failed = failed;
        }

        report.top = extract_top(&layout.results, options.top_n, &options.sort_by)?
            .into_iter()
            .map(|set| set.indicator)
            .collect();

        info!(
            stage = %stage.name,
            candidates = report.candidates.len(),
            failed = report.failed.len(),
            invocations = report.invocations(),
            "Stage finished"
        );
        Ok(report)
    }

    fn process_candidate(
        &self,
        stage: &StageConfig,
        layout: &StageLayout,
        builder: &RunConfigBuilder<'_>,
        report: &mut CandidateReport,
    ) -> Result<(), PipelineError> {
        let candidate = report.candidate.clone();
        let binary = layout.experts.join(format!("{}.ex5", candidate));

        let best = self.in_sample(stage, layout, builder, &binary, report)?;
        report.transition(CandidateState::InSampleDone);

        let oos_csv = layout
            .results
            .join(SampleMode::OutOfSample.result_file(&candidate));
        if oos_csv.exists() {
            info!(candidate = %candidate, "OOS result exists, skipping");
            report.out_of_sample = StepOutcome::Reused;
        } else {
            report.transition(CandidateState::OutOfSampleRunning);
            let def = self.definition(stage, &candidate)?;
            let config = builder.out_of_sample(&candidate, &binary, &def, &best)?;
            self.execute(&config, layout, report)?;
            report.out_of_sample = StepOutcome::Executed;
        }
        report.transition(CandidateState::OutOfSampleDone);
        Ok(())
    }

    /// Best in-sample pass, reusing an existing result when it is readable
    fn in_sample(
        &self,
        stage: &StageConfig,
        layout: &StageLayout,
        builder: &RunConfigBuilder<'_>,
        binary: &Path,
        report: &mut CandidateReport,
    ) -> Result<RunResult, PipelineError> {
        let candidate = report.candidate.clone();
        let is_csv = layout
            .results
            .join(SampleMode::InSample.result_file(&candidate));

        if is_csv.exists() {
            match extract(&layout.results, &candidate) {
                Ok(best) => {
                    info!(candidate = %candidate, score = best.score, "IS result exists, skipping");
                    report.in_sample = StepOutcome::Reused;
                    return Ok(best);
                }
                Err(e) => warn!(candidate = %candidate, error = %e, "Existing IS result unusable, re-running"),
            }
        }

        report.transition(CandidateState::InSampleRunning);
        let def = self.definition(stage, &candidate)?;
        let config = builder.in_sample(&candidate, binary, &def)?;
        self.execute(&config, layout, report)?;

        let best = extract(&layout.results, &candidate)?;
        info!(candidate = %candidate, score = best.score, "IS optimisation complete");
        report.in_sample = StepOutcome::Executed;
        Ok(best)
    }

    fn definition(&self, stage: &StageConfig, candidate: &str) -> Result<IndicatorDefinition, PipelineError> {
        let dir = self.paths.stage_indicator_dir(&stage.indicator_dir);
        let path = find_definition(&dir, candidate)?;
        IndicatorDefinition::load(&path, candidate)
    }

    /// Write the INI, run the terminal and bring the report into `results/`
    fn execute(
        &self,
        config: &RunConfig,
        layout: &StageLayout,
        report: &mut CandidateReport,
    ) -> Result<PathBuf, PipelineError> {
        let ini = config.write(&layout.ini_files)?;
        report.invocations += 1;
        self.terminal.run(&ini)?;
        copy_report(&self.terminal.report_dir(), &config.report_name(), &layout.results)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{OptimisationConfig, PathsConfig, ProjectConfig};
    use crate::reports::fixtures::spreadsheet_xml;
    use crate::results::summary::SUMMARY_FILE;
    use crate::terminal::MockTesterTerminal;
    use crate::types::DataSplit;
    use std::collections::HashMap;
    use std::fs;

    const ADX: &str = "ADX:\n  indicator_inputs:\n    period: {default: 14, min: 2, max: 50, step: 1, type: int}\n";

    fn app_config(root: &Path) -> AppConfig {
        AppConfig {
            paths: PathsConfig {
                terminal_exe: root.join("terminal64.exe"),
                meta_editor_exe: root.join("MetaEditor64.exe"),
                terminal_data_dir: root.join("data"),
                experts_dir: Some(root.join("output")),
                test_cache_dir: None,
                indicator_dir: root.join("indicators"),
                output_dir: root.join("output"),
                template_dir: root.join("templates"),
            },
            project: ProjectConfig {
                run_name: "Run".to_string(),
                symbol: "EURUSD".to_string(),
                period: "H4".to_string(),
                from_date: "2020.01.01".to_string(),
                to_date: "2024.01.01".to_string(),
                deposit: 10_000.0,
                currency: "USD".to_string(),
                leverage: 100,
                data_split: DataSplit::Year,
                risk: 1.0,
                sl: 1.5,
                tp: 1.0,
                whitelist: Vec::new(),
                whitelist_file: None,
            },
            optimisation: HashMap::from([("default".to_string(), OptimisationConfig::default())]),
            pipeline: PipelineConfig::default(),
        }
    }

    /// Indicator metadata plus an already compiled expert for each candidate
    fn seed(config: &AppConfig, candidates: &[&str]) {
        let paths = config.paths();
        let stage = &config.pipeline.stages[0];
        let indicators = paths.stage_indicator_dir(&stage.indicator_dir);
        fs::create_dir_all(&indicators).unwrap();
        let layout = StageLayout::new(&paths, "Run", &stage.name);
        layout.create().unwrap();
        for c in candidates {
            fs::write(indicators.join(format!("{}.yaml", c)), ADX.replace("ADX", c)).unwrap();
            fs::write(layout.experts.join(format!("{}.mq5", c)), "").unwrap();
            fs::write(layout.experts.join(format!("{}.ex5", c)), "").unwrap();
        }
    }

    fn options() -> RunOptions {
        RunOptions {
            recompile: false,
            top_n: 5,
            sort_by: "Res_OOS".to_string(),
        }
    }

    /// Terminal that writes a report named after the INI file
    fn scripted_terminal(report_dir: PathBuf, runs: usize) -> MockTesterTerminal {
        let mut terminal = MockTesterTerminal::new();
        terminal.expect_is_running().return_const(false);
        terminal.expect_clear_test_cache().returning(|| Ok(0));
        let dir = report_dir.clone();
        terminal.expect_report_dir().returning(move || dir.clone());
        terminal.expect_run().times(runs).returning(move |ini| {
            let name = ini.file_stem().unwrap().to_string_lossy().into_owned();
            let score = if name.ends_with("_IS") { "120" } else { "95" };
            let xml = spreadsheet_xml(
                &["Pass", "Result", "Profit Factor", "Trades", "period"],
                &[
                    vec!["1".into(), "40".into(), "1.1".into(), "20".into(), "14".into()],
                    vec!["2".into(), score.into(), "1.6".into(), "30".into(), "21".into()],
                ],
            );
            fs::create_dir_all(&report_dir).unwrap();
            fs::write(report_dir.join(format!("{}.xml", name)), xml).unwrap();
            Ok(())
        });
        terminal
    }

    #[test]
    fn test_runs_is_then_oos_and_aggregates() {
        let dir = tempfile::tempdir().unwrap();
        let config = app_config(dir.path());
        seed(&config, &["ADX"]);
        let paths = config.paths();
        let terminal = scripted_terminal(dir.path().join("data"), 2);

        let runner = StageRunner::new(&config, &paths, &terminal);
        let report = runner.run(&config.pipeline.stages[0], &options()).unwrap();

        let adx = &report.candidates[0];
        assert_eq!(adx.final_state, CandidateState::OutOfSampleDone);
        assert_eq!(adx.in_sample, StepOutcome::Executed);
        assert_eq!(adx.out_of_sample, StepOutcome::Executed);
        assert_eq!(report.invocations(), 2);
        assert_eq!(report.top, vec!["ADX"]);

        let layout = StageLayout::new(&paths, "Run", "Trigger");
        let oos_ini = persistence_text(&layout.ini_files.join("ADX_OOS.ini"));
        assert!(oos_ini.contains("period=21||0||0||1||N"));
        let summary = fs::read_to_string(layout.results.join(SUMMARY_FILE)).unwrap();
        assert!(summary.contains("ADX,120.0,95.0"));
    }

    fn persistence_text(path: &Path) -> String {
        crate::persistence::decode_text(&fs::read(path).unwrap())
    }

    #[test]
    fn test_existing_artifacts_are_reused() {
        let dir = tempfile::tempdir().unwrap();
        let config = app_config(dir.path());
        seed(&config, &["ADX"]);
        let paths = config.paths();
        let layout = StageLayout::new(&paths, "Run", "Trigger");
        fs::write(
            layout.results.join("ADX_IS.csv"),
            "Pass,Result,Profit Factor,Trades,period\n1,120,1.6,30,21\n",
        )
        .unwrap();
        fs::write(
            layout.results.join("ADX_OOS.csv"),
            "Pass,Result,Profit Factor,Trades,period\n1,95,1.4,25,21\n",
        )
        .unwrap();

        let terminal = scripted_terminal(dir.path().join("data"), 0);
        let runner = StageRunner::new(&config, &paths, &terminal);
        let report = runner.run(&config.pipeline.stages[0], &options()).unwrap();

        assert_eq!(report.invocations(), 0);
        assert_eq!(report.candidates[0].in_sample, StepOutcome::Reused);
        assert_eq!(report.candidates[0].out_of_sample, StepOutcome::Reused);
    }

    #[test]
    fn test_terminal_failure_is_contained_to_candidate() {
        let dir = tempfile::tempdir().unwrap();
        let config = app_config(dir.path());
        seed(&config, &["ADX", "RSI"]);
        let paths = config.paths();

        let mut terminal = MockTesterTerminal::new();
        terminal.expect_is_running().return_const(false);
        terminal.expect_clear_test_cache().returning(|| Ok(0));
        terminal.expect_report_dir().returning(PathBuf::new);
        terminal.expect_run().times(2).returning(|ini| {
            Err(PipelineError::TerminalFailed {
                config: ini.to_path_buf(),
                code: Some(1),
            })
        });

        let runner = StageRunner::new(&config, &paths, &terminal);
        let report = runner.run(&config.pipeline.stages[0], &options()).unwrap();

        assert_eq!(report.candidates.len(), 2);
        for c in &report.candidates {
            assert_eq!(c.final_state, CandidateState::Failed);
            assert!(matches!(c.in_sample, StepOutcome::Failed(_)));
            assert_eq!(c.out_of_sample, StepOutcome::NotAttempted);
        }
        assert!(report.top.is_empty());
    }

    #[test]
    fn test_busy_terminal_aborts_stage() {
        let dir = tempfile::tempdir().unwrap();
        let config = app_config(dir.path());
        let paths = config.paths();

        let mut terminal = MockTesterTerminal::new();
        terminal.expect_is_running().return_const(true);
        terminal
            .expect_executable()
            .returning(|| PathBuf::from("terminal64.exe"));
        terminal.expect_run().never();

        let runner = StageRunner::new(&config, &paths, &terminal);
        let err = runner.run(&config.pipeline.stages[0], &options()).unwrap_err();
        assert!(matches!(err, PipelineError::TerminalBusy(_)));
    }

    #[test]
    fn test_missing_upstream_selection_gates_stage() {
        let dir = tempfile::tempdir().unwrap();
        let config = app_config(dir.path());
        let paths = config.paths();

        let mut terminal = MockTesterTerminal::new();
        terminal.expect_is_running().return_const(false);
        terminal.expect_run().never();

        let runner = StageRunner::new(&config, &paths, &terminal);
        let err = runner.run(&config.pipeline.stages[1], &options()).unwrap_err();
        assert!(matches!(err, PipelineError::UpstreamResultMissing { .. }));
    }
}
