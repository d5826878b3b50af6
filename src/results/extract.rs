//! Result extraction: the best pass of a run

use std::collections::BTreeMap;
use std::path::Path;
use tracing::debug;

use crate::error::PipelineError;
use crate::reports::{safe_float, ReportTable};
use crate::types::{RunResult, SampleMode};

/// Score column of a tester report
pub const RESULT_COLUMN: &str = "Result";

/// Report columns that are metrics rather than expert inputs
pub const METRIC_COLUMNS: [&str; 10] = [
    "Pass",
    "Result",
    "Profit",
    "Profit Factor",
    "Custom",
    "Expected Payoff",
    "Recovery Factor",
    "Sharpe Ratio",
    "Equity DD %",
    "Trades",
];

pub fn is_metric_column(name: &str) -> bool {
    METRIC_COLUMNS.contains(&name)
}

/// Best in-sample pass of a candidate
pub fn extract(results_dir: &Path, candidate: &str) -> Result<RunResult, PipelineError> {
    extract_mode(results_dir, candidate, SampleMode::InSample)
}

/// Best pass of a candidate's `<candidate>_<IS|OOS>.csv`. Parameter names
/// are lower-cased; values are passed through untouched.
pub fn extract_mode(
    results_dir: &Path,
    candidate: &str,
    mode: SampleMode,
) -> Result<RunResult, PipelineError> {
    let path = results_dir.join(mode.result_file(candidate));
    let not_found = || PipelineError::ResultNotFound {
        candidate: candidate.to_string(),
        path: path.clone(),
    };
    if !path.exists() {
        return Err(not_found());
    }

    let table = ReportTable::read_csv(&path)
        .map_err(|e| PipelineError::malformed(&path, e.to_string()))?;
    let (score, best) = best_pass(&table, &path)?.ok_or_else(not_found)?;

    let parameters: BTreeMap<String, String> = best
        .into_iter()
        .map(|(name, value)| (name.to_lowercase(), value))
        .collect();

    debug!(
        candidate = %candidate,
        mode = %mode,
        score,
        parameters = parameters.len(),
        "Extracted best pass"
    );

    Ok(RunResult {
        candidate: candidate.to_string(),
        mode,
        score,
        parameters,
    })
}

/// Score and input columns (original header names) of the highest-scoring
/// row; `None` when the table has no rows
pub fn best_pass(
    table: &ReportTable,
    path: &Path,
) -> Result<Option<(f64, Vec<(String, String)>)>, PipelineError> {
    let result_col = table
        .column(RESULT_COLUMN)
        .ok_or_else(|| PipelineError::malformed(path, "no 'Result' column"))?;
    if table.is_empty() {
        return Ok(None);
    }

    let mut sorted = table.clone();
    sorted.sort_desc_by(result_col);
    let top = &sorted.rows[0];

    let score = safe_float(top.get(result_col).map(String::as_str).unwrap_or(""));
    let inputs = sorted
        .headers
        .iter()
        .enumerate()
        .filter(|(_, h)| !is_metric_column(h))
        .map(|(i, h)| (h.clone(), top.get(i).cloned().unwrap_or_default()))
        .collect();
    Ok(Some((score, inputs)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn test_extract_picks_highest_result() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(
            dir.path().join("ADX_IS.csv"),
            "Pass,Result,Profit,Trades,Period,Threshold\n\
             1,10,100,40,14,20\n\
             2,50,400,35,21,25\n\
             3,30,250,50,28,30\n",
        )
        .unwrap();

        let result = extract(dir.path(), "ADX").unwrap();
        assert_eq!(result.score, 50.0);
        assert_eq!(result.mode, SampleMode::InSample);
        assert_eq!(result.parameters.len(), 2);
        assert_eq!(result.parameters["period"], "21");
        assert_eq!(result.parameters["threshold"], "25");
    }

    #[test]
    fn test_extract_missing_and_empty() {
        let dir = tempfile::tempdir().unwrap();
        assert!(matches!(
            extract(dir.path(), "ADX"),
            Err(PipelineError::ResultNotFound { .. })
        ));

        fs::write(dir.path().join("ADX_IS.csv"), "Pass,Result,Period\n").unwrap();
        assert!(matches!(
            extract(dir.path(), "ADX"),
            Err(PipelineError::ResultNotFound { .. })
        ));
    }

    #[test]
    fn test_extract_passes_raw_values_through() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(
            dir.path().join("MACD_IS.csv"),
            "Pass,Result,Mode,Fast\n1,5,MODE_EMA,abc\n",
        )
        .unwrap();
        let result = extract(dir.path(), "MACD").unwrap();
        assert_eq!(result.parameters["mode"], "MODE_EMA");
        assert_eq!(result.parameters["fast"], "abc");
    }

    #[test]
    fn test_extract_without_result_column_is_malformed() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("RSI_IS.csv"), "Pass,Period\n1,14\n").unwrap();
        assert!(matches!(
            extract(dir.path(), "RSI"),
            Err(PipelineError::MalformedReport { .. })
        ));
    }
}
