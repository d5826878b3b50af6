//! Top-N parameter set extraction

use serde_yaml::{Mapping, Value};
use std::path::Path;
use tracing::{info, warn};

use crate::error::PipelineError;
use crate::persistence;
use crate::reports::ReportTable;
use crate::types::{ParamValue, SampleMode};

use super::extract::best_pass;
use super::summary::SUMMARY_FILE;

pub const TOP_CSV_FILE: &str = "1_top_parameter_sets.csv";
pub const TOP_YAML_FILE: &str = "1_top_parameter_sets.yaml";

/// Winning in-sample inputs of one top-ranked candidate
#[derive(Debug, Clone, PartialEq)]
pub struct TopParameterSet {
    pub indicator: String,
    /// Original report column name -> raw value, in report order
    pub parameters: Vec<(String, String)>,
}

/// Rank the combined summary by `sort_by` (highest first), keep `top_n`
/// candidates and write their best in-sample inputs as a flat CSV and a
/// nested YAML keyed by candidate.
pub fn extract_top(
    results_dir: &Path,
    top_n: usize,
    sort_by: &str,
) -> Result<Vec<TopParameterSet>, PipelineError> {
    let summary_path = results_dir.join(SUMMARY_FILE);
    if !summary_path.exists() {
        return Err(PipelineError::SummaryMissing(summary_path));
    }

    let mut summary = ReportTable::read_csv(&summary_path)?;
    let sort_col = summary
        .column(sort_by)
        .ok_or_else(|| PipelineError::InvalidSortColumn(sort_by.to_string()))?;
    let name_col = summary
        .column("Indicator")
        .ok_or_else(|| PipelineError::malformed(&summary_path, "no 'Indicator' column"))?;
    summary.sort_desc_by(sort_col);

    let mut sets = Vec::new();
    for row in summary.rows.iter().take(top_n) {
        let Some(indicator) = row.get(name_col) else { continue };
        let is_csv = results_dir.join(SampleMode::InSample.result_file(indicator));
        if !is_csv.exists() {
            warn!(path = %is_csv.display(), "Missing IS CSV");
            continue;
        }

        let table = match ReportTable::read_csv(&is_csv) {
            Ok(table) => table,
            Err(e) => {
                warn!(path = %is_csv.display(), error = %e, "Unreadable IS CSV");
                continue;
            }
        };
        match best_pass(&table, &is_csv) {
            Ok(Some((_, parameters))) => sets.push(TopParameterSet {
                indicator: indicator.clone(),
                parameters,
            }),
            Ok(None) => warn!(path = %is_csv.display(), "IS CSV has no rows"),
            Err(e) => warn!(path = %is_csv.display(), error = %e, "Unreadable IS CSV"),
        }
    }

    if sets.is_empty() {
        warn!("No parameter sets extracted");
        return Ok(sets);
    }

    write_flat(&results_dir.join(TOP_CSV_FILE), &sets)?;
    write_nested(&results_dir.join(TOP_YAML_FILE), &sets)?;
    info!(
        count = sets.len(),
        top_n,
        sort_by = %sort_by,
        "Saved top parameter sets"
    );
    Ok(sets)
}

/// `Indicator` plus the union of all parameter columns, first-seen order
fn write_flat(path: &Path, sets: &[TopParameterSet]) -> Result<(), PipelineError> {
    let mut headers = vec!["Indicator".to_string()];
    for set in sets {
        for (name, _) in &set.parameters {
            if !headers.contains(name) {
                headers.push(name.clone());
            }
        }
    }

    let rows: Vec<Vec<String>> = sets
        .iter()
        .map(|set| {
            headers
                .iter()
                .enumerate()
                .map(|(i, h)| {
                    if i == 0 {
                        return set.indicator.clone();
                    }
                    set.parameters
                        .iter()
                        .find(|(name, _)| name == h)
                        .map(|(_, v)| v.clone())
                        .unwrap_or_default()
                })
                .collect()
        })
        .collect();

    persistence::write_csv(path, &headers, &rows)
}

fn write_nested(path: &Path, sets: &[TopParameterSet]) -> Result<(), PipelineError> {
    let mut doc = Mapping::new();
    for set in sets {
        let mut params = Mapping::new();
        for (name, raw) in &set.parameters {
            params.insert(
                Value::from(name.as_str()),
                serde_yaml::to_value(ParamValue::infer(raw))?,
            );
        }
        doc.insert(Value::from(set.indicator.as_str()), Value::Mapping(params));
    }
    persistence::write_yaml(path, &Value::Mapping(doc))
}
