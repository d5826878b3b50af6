//! Tester run configuration
//!
//! One INI file per `(candidate, mode)`: a `[Tester]` section describing the
//! test and a `[TesterInputs]` section where every expert input is a
//! `value||min||step||max||Y/N` directive. In-sample runs optimise the
//! candidate's inputs over their scaled ranges; out-of-sample runs fix them
//! to the in-sample winner.

use std::fmt;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

use crate::config::{OptimisationConfig, ProjectConfig};
use crate::error::PipelineError;
use crate::indicators::IndicatorDefinition;
use crate::persistence;
use crate::scaling::{scale, ScalingMode};
use crate::types::{format_number, RunResult, SampleMode};

const LINE_END: &str = "\r\n";
/// Every tick
const MODEL_EVERY_TICK: u8 = 1;
/// Fast genetic algorithm
const OPTIMIZATION_GENETIC: u8 = 2;

/// `value||min||step||max||Y/N`
#[derive(Debug, Clone, PartialEq)]
pub struct InputDirective {
    pub value: String,
    pub min: String,
    pub step: String,
    pub max: String,
    pub optimise: bool,
}

impl InputDirective {
    /// Fixed value; range fields are ignored by the terminal
    pub fn fixed(value: impl Into<String>, max: impl Into<String>) -> Self {
        Self {
            value: value.into(),
            min: "0".to_string(),
            step: "0".to_string(),
            max: max.into(),
            optimise: false,
        }
    }

    fn with_range(value: impl Into<String>, min: &str, step: &str, max: &str, optimise: bool) -> Self {
        Self {
            value: value.into(),
            min: min.to_string(),
            step: step.to_string(),
            max: max.to_string(),
            optimise,
        }
    }
}

impl fmt::Display for InputDirective {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}||{}||{}||{}||{}",
            self.value,
            self.min,
            self.step,
            self.max,
            if self.optimise { "Y" } else { "N" }
        )
    }
}

/// Everything the terminal needs for one run
#[derive(Debug, Clone, PartialEq)]
pub struct RunConfig {
    pub candidate: String,
    pub mode: SampleMode,
    /// Compiled expert, relative to the terminal's experts root
    pub expert: String,
    pub symbol: String,
    pub period: String,
    pub from_date: String,
    pub to_date: String,
    pub deposit: f64,
    pub currency: String,
    pub leverage: u32,
    pub criterion: u8,
    /// Expert-wide inputs (money management, criterion, data split...)
    pub static_inputs: Vec<(String, InputDirective)>,
    /// The candidate's own inputs
    pub directives: Vec<(String, InputDirective)>,
}

/// Builds run configurations for the candidates of one stage
pub struct RunConfigBuilder<'a> {
    project: &'a ProjectConfig,
    optimisation: OptimisationConfig,
    experts_root: &'a Path,
}

impl<'a> RunConfigBuilder<'a> {
    pub fn new(
        project: &'a ProjectConfig,
        optimisation: OptimisationConfig,
        experts_root: &'a Path,
    ) -> Self {
        Self {
            project,
            optimisation,
            experts_root,
        }
    }

    /// In-sample run: optimisable inputs span their scaled ranges
    pub fn in_sample(
        &self,
        candidate: &str,
        binary: &Path,
        def: &IndicatorDefinition,
    ) -> Result<RunConfig, PipelineError> {
        let mode = if self.optimisation.per_param {
            ScalingMode::PerParameter
        } else {
            ScalingMode::Grid
        };
        let scaled = scale(&def.inputs(), self.optimisation.max_iterations, mode)?;

        let directives: Vec<(String, InputDirective)> = scaled
            .iter()
            .map(|p| {
                let directive = if p.optimise {
                    InputDirective::with_range(
                        p.default.to_string(),
                        &p.format_value(p.min),
                        &p.format_value(p.step),
                        &p.format_value(p.max),
                        true,
                    )
                } else {
                    InputDirective::fixed(p.default.to_string(), "1")
                };
                (p.name.clone(), directive)
            })
            .collect();

        let combinations: u128 = scaled
            .iter()
            .filter(|p| p.optimise)
            .map(|p| p.count as u128)
            .product();
        debug!(
            candidate = %candidate,
            combinations,
            budget = self.optimisation.max_iterations,
            "Scaled in-sample grid"
        );

        Ok(self.assemble(candidate, SampleMode::InSample, binary, directives))
    }

    /// Out-of-sample run: every input fixed, the in-sample winner's values
    /// taking precedence over defaults
    pub fn out_of_sample(
        &self,
        candidate: &str,
        binary: &Path,
        def: &IndicatorDefinition,
        best: &RunResult,
    ) -> Result<RunConfig, PipelineError> {
        let directives = def
            .inputs()
            .into_iter()
            .map(|input| {
                let value = match best.parameters.get(&input.name.to_lowercase()) {
                    Some(v) => v.clone(),
                    None => {
                        if input.optimise {
                            warn!(
                                candidate = %candidate,
                                input = %input.name,
                                "No in-sample value, using default"
                            );
                        }
                        input.default.to_string()
                    }
                };
                (input.name, InputDirective::fixed(value, "1"))
            })
            .collect();

        Ok(self.assemble(candidate, SampleMode::OutOfSample, binary, directives))
    }

    fn assemble(
        &self,
        candidate: &str,
        mode: SampleMode,
        binary: &Path,
        directives: Vec<(String, InputDirective)>,
    ) -> RunConfig {
        let p = self.project;
        let o = &self.optimisation;
        let any_optimised = directives.iter().any(|(_, d)| d.optimise);
        // The terminal only writes an optimisation report when something is optimised
        let force_opt = !mode.is_in_sample() || !any_optimised;

        let static_inputs: Vec<(String, InputDirective)> = vec![
            ("inp_lot_mode", InputDirective::with_range("2", "0", "0", "2", false)),
            (
                "inp_lot_var",
                InputDirective::with_range(format_number(p.risk), "2.0", "0.2", "20", false),
            ),
            ("inp_sl_mode", InputDirective::with_range("2", "0", "0", "5", false)),
            (
                "inp_sl_var",
                InputDirective::with_range(format_number(p.sl), "1.0", "0.1", "10", false),
            ),
            ("inp_tp_mode", InputDirective::with_range("2", "0", "0", "5", false)),
            (
                "inp_tp_var",
                InputDirective::with_range(format_number(p.tp), "1.5", "0.15", "15", false),
            ),
            (
                "inp_custom_criteria",
                InputDirective::fixed(o.custom_criterion.to_string(), "1"),
            ),
            (
                "inp_opt_min_trades",
                InputDirective::fixed(o.min_trades.to_string(), "1"),
            ),
            (
                "inp_data_split_method",
                InputDirective::fixed(p.data_split.code(mode).to_string(), "3"),
            ),
            (
                "inp_force_opt",
                InputDirective::with_range("1", "1", "1", "2", force_opt),
            ),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v))
        .collect();

        RunConfig {
            candidate: candidate.to_string(),
            mode,
            expert: expert_path(binary, self.experts_root),
            symbol: p.symbol.clone(),
            period: p.period.clone(),
            from_date: p.from_date.clone(),
            to_date: p.to_date.clone(),
            deposit: p.deposit,
            currency: p.currency.clone(),
            leverage: p.leverage,
            criterion: o.opt_criterion,
            static_inputs,
            directives,
        }
    }
}

/// Expert path as the terminal expects it: relative to its experts root,
/// backslash separated
fn expert_path(binary: &Path, experts_root: &Path) -> String {
    match binary.strip_prefix(experts_root) {
        Ok(rel) => rel.to_string_lossy().replace('/', "\\"),
        Err(_) => {
            warn!(
                expert = %binary.display(),
                root = %experts_root.display(),
                "Expert is outside the terminal experts root; using absolute path"
            );
            binary.display().to_string()
        }
    }
}

impl RunConfig {
    pub fn report_name(&self) -> String {
        self.mode.report_name(&self.candidate)
    }

    pub fn file_name(&self) -> String {
        format!("{}.ini", self.report_name())
    }

    pub fn to_ini(&self) -> String {
        let tester = [
            ("Expert", self.expert.clone()),
            ("Symbol", self.symbol.clone()),
            ("Period", self.period.clone()),
            ("Model", MODEL_EVERY_TICK.to_string()),
            ("FromDate", self.from_date.clone()),
            ("ToDate", self.to_date.clone()),
            ("ForwardMode", "0".to_string()),
            ("Deposit", format!("{}", self.deposit)),
            ("Currency", self.currency.clone()),
            ("ProfitInPips", "0".to_string()),
            ("Leverage", self.leverage.to_string()),
            ("ExecutionMode", "0".to_string()),
            ("Optimization", OPTIMIZATION_GENETIC.to_string()),
            ("OptimizationCriterion", self.criterion.to_string()),
            ("Visual", "0".to_string()),
            ("ReplaceReport", "1".to_string()),
            ("ShutdownTerminal", "1".to_string()),
            ("Report", self.report_name()),
        ];

        let mut out = String::from("[Tester]");
        out.push_str(LINE_END);
        for (key, value) in tester {
            out.push_str(&format!("{}={}{}", key, value, LINE_END));
        }
        out.push_str(LINE_END);
        out.push_str("[TesterInputs]");
        out.push_str(LINE_END);
        for (key, directive) in self.static_inputs.iter().chain(self.directives.iter()) {
            out.push_str(&format!("{}={}{}", key, directive, LINE_END));
        }
        out
    }

    /// Write `<ini_dir>/<candidate>_<IS|OOS>.ini` (UTF-16LE)
    pub fn write(&self, ini_dir: &Path) -> Result<PathBuf, PipelineError> {
        let path = ini_dir.join(self.file_name());
        persistence::write_utf16(&path, &self.to_ini())?;
        info!(
            candidate = %self.candidate,
            mode = %self.mode,
            path = %path.display(),
            "Wrote run configuration"
        );
        Ok(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::DataSplit;
    use std::collections::BTreeMap;

    const ADX: &str = "ADX:\n  indicator_inputs:\n    period: {default: 14, min: 2, max: 50, step: 1, type: int}\n    method: {default: MODE_SMA, optimise: false, type: ENUM_MA_METHOD}\n  logic_inputs:\n    threshold: {default: 25.0, min: 10.0, max: 40.0, step: 5.0}\n";

    fn project() -> ProjectConfig {
        ProjectConfig {
            run_name: "Run".to_string(),
            symbol: "EURUSD".to_string(),
            period: "H4".to_string(),
            from_date: "2020.01.01".to_string(),
            to_date: "2024.01.01".to_string(),
            deposit: 100_000.0,
            currency: "USD".to_string(),
            leverage: 100,
            data_split: DataSplit::Year,
            risk: 1.0,
            sl: 1.5,
            tp: 1.0,
            whitelist: Vec::new(),
            whitelist_file: None,
        }
    }

    fn adx() -> IndicatorDefinition {
        IndicatorDefinition::parse(ADX, Path::new("ADX.yaml"), "ADX").unwrap()
    }

    fn directive<'c>(config: &'c RunConfig, name: &str) -> &'c InputDirective {
        &config
            .static_inputs
            .iter()
            .chain(config.directives.iter())
            .find(|(k, _)| k == name)
            .unwrap()
            .1
    }

    #[test]
    fn test_in_sample_directives() {
        let project = project();
        let root = Path::new("/mt5/MQL5/Experts");
        let builder = RunConfigBuilder::new(&project, OptimisationConfig::default(), root);
        let config = builder
            .in_sample("ADX", &root.join("Run/Trigger/experts/ADX.ex5"), &adx())
            .unwrap();

        assert_eq!(config.expert, "Run\\Trigger\\experts\\ADX.ex5");
        assert_eq!(directive(&config, "period").to_string(), "14||2||1||50||Y");
        assert_eq!(directive(&config, "method").to_string(), "MODE_SMA||0||0||1||N");
        assert_eq!(directive(&config, "threshold").to_string(), "25.0||10.0||5.0||40.0||Y");
        assert_eq!(directive(&config, "inp_data_split_method").to_string(), "2||0||0||3||N");
        assert_eq!(directive(&config, "inp_lot_var").to_string(), "1.0||2.0||0.2||20||N");
        assert_eq!(directive(&config, "inp_force_opt").to_string(), "1||1||1||2||N");
    }

    #[test]
    fn test_in_sample_grid_respects_budget() {
        let project = project();
        let optimisation = OptimisationConfig {
            max_iterations: 10,
            ..OptimisationConfig::default()
        };
        let root = Path::new("/mt5/MQL5/Experts");
        let builder = RunConfigBuilder::new(&project, optimisation, root);
        let config = builder.in_sample("ADX", &root.join("ADX.ex5"), &adx()).unwrap();

        let step: f64 = directive(&config, "period").step.parse().unwrap();
        assert!(step > 1.0);
    }

    #[test]
    fn test_out_of_sample_fixes_winner() {
        let project = project();
        let root = Path::new("/mt5/MQL5/Experts");
        let builder = RunConfigBuilder::new(&project, OptimisationConfig::default(), root);
        let best = RunResult {
            candidate: "ADX".to_string(),
            mode: SampleMode::InSample,
            score: 120.0,
            parameters: BTreeMap::from([("period".to_string(), "21".to_string())]),
        };
        let config = builder
            .out_of_sample("ADX", &root.join("ADX.ex5"), &adx(), &best)
            .unwrap();

        assert_eq!(directive(&config, "period").to_string(), "21||0||0||1||N");
        assert_eq!(directive(&config, "threshold").to_string(), "25.0||0||0||1||N");
        assert_eq!(directive(&config, "inp_data_split_method").value, "1");
        assert!(directive(&config, "inp_force_opt").optimise);
        assert_eq!(config.report_name(), "ADX_OOS");
    }

    #[test]
    fn test_ini_is_utf16_with_tester_sections() {
        let project = project();
        let root = Path::new("/mt5/MQL5/Experts");
        let builder = RunConfigBuilder::new(&project, OptimisationConfig::default(), root);
        let config = builder.in_sample("ADX", &root.join("ADX.ex5"), &adx()).unwrap();

        let dir = tempfile::tempdir().unwrap();
        let path = config.write(dir.path()).unwrap();
        assert!(path.ends_with("ADX_IS.ini"));

        let bytes = std::fs::read(&path).unwrap();
        assert_eq!(&bytes[..2], &[0xFF, 0xFE]);
        let text = persistence::decode_text(&bytes);
        assert!(text.starts_with("[Tester]\r\nExpert=ADX.ex5\r\n"));
        assert!(text.contains("OptimizationCriterion=6\r\n"));
        assert!(text.contains("Report=ADX_IS\r\n"));
        assert!(text.contains("[TesterInputs]\r\ninp_lot_mode=2||0||0||2||N\r\n"));
    }
}
