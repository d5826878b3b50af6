//! Configuration section types

use serde::Deserialize;
use std::path::{Path, PathBuf};

use crate::stage::StageConfig;
use crate::types::DataSplit;

/// Marker accepted in `whitelist`/`whitelist_file` meaning "trade the chart symbol"
pub const CHART_SYMBOL_ONLY: &str = "CHART_SYMBOL_ONLY";

#[derive(Debug, Clone, Deserialize)]
pub struct PathsConfig {
    /// terminal64.exe
    pub terminal_exe: PathBuf,
    /// MetaEditor64.exe, used to compile generated experts
    pub meta_editor_exe: PathBuf,
    /// Terminal data root; reports land here
    pub terminal_data_dir: PathBuf,
    /// Defaults to `<terminal_data_dir>/MQL5/Experts`
    #[serde(default)]
    pub experts_dir: Option<PathBuf>,
    /// Defaults to `<terminal_data_dir>/Tester/cache`
    #[serde(default)]
    pub test_cache_dir: Option<PathBuf>,
    /// Indicator metadata root; each stage reads a subdirectory
    pub indicator_dir: PathBuf,
    /// Root of `<run>/<stage>/...` trees
    pub output_dir: PathBuf,
    pub template_dir: PathBuf,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ProjectConfig {
    pub run_name: String,
    pub symbol: String,
    /// Chart period (M1, M5, M15, M30, H1, H4, D1)
    pub period: String,
    /// YYYY.MM.DD
    pub from_date: String,
    /// YYYY.MM.DD
    pub to_date: String,
    pub deposit: f64,
    pub currency: String,
    pub leverage: u32,
    #[serde(default)]
    pub data_split: DataSplit,
    /// Risk per trade (lot variable)
    pub risk: f64,
    /// Stop loss multiplier
    pub sl: f64,
    /// Take profit multiplier
    pub tp: f64,
    #[serde(default)]
    pub whitelist: Vec<String>,
    /// One symbol per line (commas also accepted), or `CHART_SYMBOL_ONLY`
    #[serde(default)]
    pub whitelist_file: Option<PathBuf>,
}

/// Per-stage optimisation settings
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct OptimisationConfig {
    /// Terminal `OptimizationCriterion` (6 = custom max)
    #[serde(default = "default_opt_criterion")]
    pub opt_criterion: u8,
    /// Selector passed to the expert's custom criterion function
    #[serde(default)]
    pub custom_criterion: u8,
    #[serde(default)]
    pub min_trades: u32,
    /// Combination budget for the scaler
    #[serde(default = "default_max_iterations")]
    pub max_iterations: u64,
    /// Budget caps each parameter instead of the whole grid
    #[serde(default)]
    pub per_param: bool,
}

fn default_opt_criterion() -> u8 {
    6
}

fn default_max_iterations() -> u64 {
    10_000
}

impl Default for OptimisationConfig {
    fn default() -> Self {
        Self {
            opt_criterion: default_opt_criterion(),
            custom_criterion: 0,
            min_trades: 0,
            max_iterations: default_max_iterations(),
            per_param: false,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct PipelineConfig {
    #[serde(default = "StageConfig::trend_following")]
    pub stages: Vec<StageConfig>,
    /// Rows kept by top-N extraction
    #[serde(default = "default_top_n")]
    pub top_n: usize,
    /// Summary column ranked by top-N extraction
    #[serde(default = "default_sort_by")]
    pub sort_by: String,
    /// Regenerate and compile experts on entry
    #[serde(default = "default_recompile")]
    pub recompile: bool,
}

fn default_top_n() -> usize {
    5
}

fn default_sort_by() -> String {
    "Res_OOS".to_string()
}

fn default_recompile() -> bool {
    true
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            stages: StageConfig::trend_following(),
            top_n: default_top_n(),
            sort_by: default_sort_by(),
            recompile: default_recompile(),
        }
    }
}

/// Filesystem locations resolved once at start-up and passed by reference
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedPaths {
    pub terminal_exe: PathBuf,
    pub meta_editor_exe: PathBuf,
    pub terminal_data_dir: PathBuf,
    /// `<data>/MQL5`, the compiler's working directory
    pub mql5_dir: PathBuf,
    pub experts_dir: PathBuf,
    pub test_cache_dir: PathBuf,
    pub indicator_dir: PathBuf,
    pub output_dir: PathBuf,
    pub template_dir: PathBuf,
}

impl ResolvedPaths {
    pub fn from_config(paths: &PathsConfig) -> Self {
        let mql5_dir = paths.terminal_data_dir.join("MQL5");
        Self {
            terminal_exe: paths.terminal_exe.clone(),
            meta_editor_exe: paths.meta_editor_exe.clone(),
            terminal_data_dir: paths.terminal_data_dir.clone(),
            experts_dir: paths
                .experts_dir
                .clone()
                .unwrap_or_else(|| mql5_dir.join("Experts")),
            test_cache_dir: paths
                .test_cache_dir
                .clone()
                .unwrap_or_else(|| paths.terminal_data_dir.join("Tester").join("cache")),
            mql5_dir,
            indicator_dir: paths.indicator_dir.clone(),
            output_dir: paths.output_dir.clone(),
            template_dir: paths.template_dir.clone(),
        }
    }

    /// `<output>/<run>`
    pub fn run_dir(&self, run_name: &str) -> PathBuf {
        self.output_dir.join(run_name)
    }

    /// `<output>/<run>/<stage>`
    pub fn stage_dir(&self, run_name: &str, stage: &str) -> PathBuf {
        self.run_dir(run_name).join(stage)
    }

    /// Manual selection artifact of a stage: `<stage dir>/the_<stage>.yaml`
    pub fn selection_file(&self, run_name: &str, stage: &str) -> PathBuf {
        self.stage_dir(run_name, stage)
            .join(format!("the_{}.yaml", stage.to_lowercase()))
    }

    /// Indicator metadata directory of a stage
    pub fn stage_indicator_dir(&self, indicator_subdir: &Path) -> PathBuf {
        self.indicator_dir.join(indicator_subdir)
    }
}
