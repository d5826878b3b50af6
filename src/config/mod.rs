//! Configuration management for Optiforge
//!
//! Loads from YAML files + environment variables via .env

mod types;

pub use types::*;

use anyhow::{bail, Context, Result};
use chrono::NaiveDate;
use config::{Config, Environment, File};
use serde::Deserialize;
use std::collections::{HashMap, HashSet};
use std::fs;
use std::path::Path;

use crate::error::PipelineError;
use crate::stage::StageConfig;

const DATE_FORMAT: &str = "%Y.%m.%d";
const PERIODS: [&str; 7] = ["M1", "M5", "M15", "M30", "H1", "H4", "D1"];
/// Optimisation entry used by stages without their own
const DEFAULT_OPTIMISATION_KEY: &str = "default";
/// Whitelist entry of the chart symbol inside generated experts
const CHART_SYMBOL_EXPR: &str = "Symbol()";

/// Main application configuration
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    pub paths: PathsConfig,
    pub project: ProjectConfig,
    #[serde(default)]
    pub optimisation: HashMap<String, OptimisationConfig>,
    #[serde(default)]
    pub pipeline: PipelineConfig,
}

impl AppConfig {
    /// Load configuration from defaults, config files, an optional explicit
    /// file and the environment (`OPTIFORGE__SECTION__KEY`)
    pub fn load(explicit: Option<&Path>) -> Result<Self> {
        // Load .env file first
        dotenvy::dotenv().ok();

        let mut builder = Config::builder()
            // Paths defaults
            .set_default("paths.indicator_dir", "indicators")?
            .set_default("paths.output_dir", "output")?
            .set_default("paths.template_dir", "templates")?
            // Project defaults
            .set_default("project.run_name", "TestRun")?
            .set_default("project.period", "D1")?
            .set_default("project.deposit", 10_000.0)?
            .set_default("project.currency", "USD")?
            .set_default("project.leverage", 100)?
            .set_default("project.data_split", "none")?
            .set_default("project.risk", 1.0)?
            .set_default("project.sl", 1.5)?
            .set_default("project.tp", 1.0)?
            // Pipeline defaults (stages come from serde)
            .set_default("pipeline.top_n", 5)?
            .set_default("pipeline.sort_by", "Res_OOS")?
            .set_default("pipeline.recompile", true)?
            // Load config file if exists
            .add_source(File::with_name("config/default").required(false))
            .add_source(File::with_name("config/local").required(false));

        if let Some(path) = explicit {
            if !path.exists() {
                bail!("Config file {} does not exist", path.display());
            }
            builder = builder.add_source(File::from(path).required(true));
        }

        let config = builder
            // Override with environment variables (OPTIFORGE__*)
            .add_source(Environment::with_prefix("OPTIFORGE").separator("__"))
            .build()
            .context("Failed to build configuration")?;

        let app_config: AppConfig = config
            .try_deserialize()
            .context("Failed to deserialize configuration")?;

        Ok(app_config)
    }

    /// Check values the terminal would otherwise reject late (or silently misread)
    pub fn validate(&self) -> Result<()> {
        let p = &self.project;

        if p.run_name.trim().is_empty() {
            bail!("project.run_name must not be empty");
        }
        if p.symbol.trim().is_empty() {
            bail!("project.symbol must not be empty");
        }

        let from = NaiveDate::parse_from_str(&p.from_date, DATE_FORMAT)
            .with_context(|| format!("project.from_date '{}' is not YYYY.MM.DD", p.from_date))?;
        let to = NaiveDate::parse_from_str(&p.to_date, DATE_FORMAT)
            .with_context(|| format!("project.to_date '{}' is not YYYY.MM.DD", p.to_date))?;
        if from >= to {
            bail!("project.from_date {} must be before to_date {}", p.from_date, p.to_date);
        }

        if !PERIODS.contains(&p.period.as_str()) {
            bail!(
                "Invalid period: {}. Must be one of: {}",
                p.period,
                PERIODS.join(", ")
            );
        }

        for (name, value) in [("risk", p.risk), ("sl", p.sl), ("tp", p.tp), ("deposit", p.deposit)] {
            if !value.is_finite() || value < 0.0 {
                bail!("project.{} must be a non-negative number, got {}", name, value);
            }
        }

        let mut seen = HashSet::new();
        for stage in &self.pipeline.stages {
            for upstream in &stage.depends_on {
                if !seen.contains(&upstream.to_lowercase()) {
                    bail!(
                        "Stage '{}' depends on '{}', which is not an earlier stage",
                        stage.name,
                        upstream
                    );
                }
            }
            if !seen.insert(stage.name.to_lowercase()) {
                bail!("Duplicate stage name '{}'", stage.name);
            }
        }

        if self.pipeline.top_n == 0 {
            bail!("pipeline.top_n must be at least 1");
        }

        Ok(())
    }

    /// Generate a one-line digest of the config for logging
    pub fn digest(&self) -> String {
        format!(
            "run={} symbol={} period={} range={}..{} split={:?} stages={:?}",
            self.project.run_name,
            self.project.symbol,
            self.project.period,
            self.project.from_date,
            self.project.to_date,
            self.project.data_split,
            self.pipeline
                .stages
                .iter()
                .map(|s| s.name.as_str())
                .collect::<Vec<_>>()
        )
    }

    pub fn paths(&self) -> ResolvedPaths {
        ResolvedPaths::from_config(&self.paths)
    }

    /// Stage by name (case-insensitive)
    pub fn stage(&self, name: &str) -> Result<&StageConfig, PipelineError> {
        self.pipeline
            .stages
            .iter()
            .find(|s| s.name.eq_ignore_ascii_case(name))
            .ok_or_else(|| PipelineError::UnknownStage(name.to_string()))
    }

    /// Optimisation settings of a stage, falling back to the `default` entry
    pub fn optimisation_for(&self, stage: &str) -> OptimisationConfig {
        let lookup = |key: &str| {
            self.optimisation
                .iter()
                .find(|(k, _)| k.eq_ignore_ascii_case(key))
                .map(|(_, v)| v.clone())
        };
        lookup(stage)
            .or_else(|| lookup(DEFAULT_OPTIMISATION_KEY))
            .unwrap_or_default()
    }

    /// Symbols the generated experts may trade
    pub fn whitelist(&self) -> Result<Vec<String>, PipelineError> {
        let p = &self.project;
        let chart_only = p.whitelist.iter().any(|s| s == CHART_SYMBOL_ONLY)
            || p.whitelist_file
                .as_deref()
                .is_some_and(|f| f.as_os_str().eq_ignore_ascii_case(CHART_SYMBOL_ONLY));
        if chart_only {
            return Ok(vec![CHART_SYMBOL_EXPR.to_string()]);
        }

        let mut symbols = p.whitelist.clone();
        if let Some(file) = &p.whitelist_file {
            let text = fs::read_to_string(file)?;
            symbols.extend(
                text.split(|c: char| c == '\n' || c == ',')
                    .map(str::trim)
                    .filter(|s| !s.is_empty() && !s.starts_with('#'))
                    .map(str::to_string),
            );
        }
        if symbols.is_empty() {
            symbols.push(CHART_SYMBOL_EXPR.to_string());
        }
        Ok(symbols)
    }
}

impl std::fmt::Display for AppConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.digest())
    }
}
