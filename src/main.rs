//! Optiforge command line

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde::Serialize;
use std::path::{Path, PathBuf};
use tracing::info;
use tracing_subscriber::EnvFilter;

use optiforge::config::AppConfig;
use optiforge::indicators::IndicatorDefinition;
use optiforge::render::candidate_name;
use optiforge::results::{extract_top, update_summary};
use optiforge::scaling::{scale, ScalingMode};
use optiforge::stage::{Pipeline, RunOptions, StageLayout, StageRunner};
use optiforge::terminal::Mt5Terminal;
use optiforge::upstream;

#[derive(Parser, Debug)]
#[command(name = "optiforge", version, about = "Multi-stage IS/OOS optimisation for MT5 experts")]
struct Cli {
    /// Configuration file (merged over config/default and config/local)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Emit logs as JSON lines
    #[arg(long, global = true)]
    json_logs: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run one stage: generate, optimise IS, verify OOS, aggregate
    Run {
        #[arg(long)]
        stage: String,
        /// Reuse existing compiled experts
        #[arg(long)]
        no_recompile: bool,
        #[arg(long)]
        top_n: Option<usize>,
        #[arg(long)]
        sort_by: Option<String>,
        /// Print the stage report as JSON
        #[arg(long)]
        json: bool,
    },
    /// Run every configured stage in order, pausing at the first manual gate
    Pipeline {
        #[arg(long)]
        no_recompile: bool,
        #[arg(long)]
        json: bool,
    },
    /// Rebuild a stage's summary from its results
    Summarise {
        #[arg(long)]
        stage: String,
        /// Print the summary table
        #[arg(long)]
        print: bool,
    },
    /// Extract the top-N parameter sets of a stage
    Top {
        #[arg(long)]
        stage: String,
        #[arg(long)]
        top_n: Option<usize>,
        #[arg(long)]
        sort_by: Option<String>,
    },
    /// Record the candidate downstream stages build on
    Select {
        #[arg(long)]
        stage: String,
        #[arg(long)]
        candidate: String,
    },
    /// Show the scaled optimisation grid of an indicator definition
    Scale {
        #[arg(long)]
        indicator: PathBuf,
        #[arg(long, default_value_t = 10_000)]
        budget: u64,
        #[arg(long)]
        per_param: bool,
    },
}

fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    init_logging(cli.json_logs);

    match cli.command {
        Command::Run {
            stage,
            no_recompile,
            top_n,
            sort_by,
            json,
        } => {
            let config = load_config(cli.config.as_deref())?;
            let paths = config.paths();
            let stage = config.stage(&stage)?;
            let mut options = RunOptions::from_config(&config.pipeline);
            options.recompile &= !no_recompile;
            options.top_n = top_n.unwrap_or(options.top_n);
            options.sort_by = sort_by.unwrap_or(options.sort_by);

            let terminal = Mt5Terminal::new(&paths);
            let report = StageRunner::new(&config, &paths, &terminal).run(stage, &options)?;
            if json {
                print_json(&report)?;
            } else {
                info!(
                    stage = %report.stage,
                    candidates = report.candidates.len(),
                    failed = report.failed.len(),
                    top = ?report.top,
                    "Done"
                );
            }
        }
        Command::Pipeline { no_recompile, json } => {
            let config = load_config(cli.config.as_deref())?;
            let paths = config.paths();
            let mut options = RunOptions::from_config(&config.pipeline);
            options.recompile &= !no_recompile;

            let terminal = Mt5Terminal::new(&paths);
            let report = Pipeline::new(&config, &paths, &terminal).run(&options)?;
            if json {
                print_json(&report)?;
            } else {
                info!(stages = report.stages.len(), status = ?report.status, "Done");
            }
        }
        Command::Summarise { stage, print } => {
            let config = load_config(cli.config.as_deref())?;
            let paths = config.paths();
            let stage = config.stage(&stage)?;
            let layout = StageLayout::new(&paths, &config.project.run_name, &stage.name);
            let (table, failed) = update_summary(&layout.results, Some(&stage.name), print)?;
            info!(rows = table.rows.len(), failed = failed.len(), "Summary updated");
        }
        Command::Top {
            stage,
            top_n,
            sort_by,
        } => {
            let config = load_config(cli.config.as_deref())?;
            let paths = config.paths();
            let stage = config.stage(&stage)?;
            let layout = StageLayout::new(&paths, &config.project.run_name, &stage.name);
            let sets = extract_top(
                &layout.results,
                top_n.unwrap_or(config.pipeline.top_n),
                sort_by.as_deref().unwrap_or(&config.pipeline.sort_by),
            )?;
            for set in sets {
                println!("{}", set.indicator);
            }
        }
        Command::Select { stage, candidate } => {
            let config = load_config(cli.config.as_deref())?;
            let paths = config.paths();
            let stage = config.stage(&stage)?;
            let path = upstream::select(&paths, &config.project.run_name, stage, &candidate)?;
            println!("{}", path.display());
        }
        Command::Scale {
            indicator,
            budget,
            per_param,
        } => {
            let name = candidate_name(&indicator);
            let def = IndicatorDefinition::load(&indicator, &name)?;
            let mode = if per_param {
                ScalingMode::PerParameter
            } else {
                ScalingMode::Grid
            };
            let scaled = scale(&def.inputs(), budget, mode)?;

            let mut combinations: u128 = 1;
            for p in &scaled {
                if p.optimise {
                    combinations = combinations.saturating_mul(p.count as u128);
                }
                let values: Vec<String> = p.grid_values().iter().map(|v| p.format_value(*v)).collect();
                println!(
                    "{:<24} step {:<10} count {:<6} [{}]",
                    p.name,
                    p.format_value(p.step),
                    p.count,
                    values.join(", ")
                );
            }
            println!("combinations: {} (budget {})", combinations, budget);
        }
    }

    Ok(())
}

fn init_logging(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    if json {
        tracing_subscriber::fmt().json().with_env_filter(filter).init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}

fn load_config(path: Option<&Path>) -> Result<AppConfig> {
    let config = AppConfig::load(path)?;
    config.validate().context("Invalid configuration")?;
    info!(config = %config.digest(), "Configuration loaded");
    Ok(config)
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
