//! Result aggregation across a stage's candidates

use serde::Serialize;
use std::fs;
use std::path::Path;
use tracing::{info, warn};

use crate::error::PipelineError;
use crate::persistence;
use crate::reports::{safe_float, ReportTable};
use crate::types::{format_number, SampleMode};

use super::extract::RESULT_COLUMN;

pub const SUMMARY_FILE: &str = "1_combined_results.csv";
pub const FAILED_LIST_FILE: &str = "failed_postprocess.txt";

/// `1_combined_results_<stage>.csv`
pub fn stage_summary_file(stage: &str) -> String {
    format!("1_combined_results_{}.csv", stage)
}

/// Summary prefix -> report column
pub const METRICS: [(&str, &str); 3] = [
    ("Res", "Result"),
    ("PF", "Profit Factor"),
    ("Trades", "Trades"),
];

pub const SUMMARY_HEADERS: [&str; 11] = [
    "Indicator",
    "Res_IS",
    "Res_OOS",
    "PF_IS",
    "PF_OOS",
    "Trades_IS",
    "Trades_OOS",
    "Res_dif",
    "Res_mean",
    "PF_dif",
    "Trades_dif",
];

/// `round(|a - b| / b * 100, 2)`, or 0.0 when `b` is zero
pub fn percent_diff(a: f64, b: f64) -> f64 {
    if b == 0.0 {
        return 0.0;
    }
    round2((a - b).abs() / b * 100.0)
}

fn round2(v: f64) -> f64 {
    (v * 100.0).round() / 100.0
}

/// One candidate's IS/OOS comparison
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StageSummaryRow {
    pub indicator: String,
    pub res_is: f64,
    pub res_oos: f64,
    pub pf_is: f64,
    pub pf_oos: f64,
    pub trades_is: f64,
    pub trades_oos: f64,
    pub res_dif: f64,
    pub res_mean: f64,
    pub pf_dif: f64,
    pub trades_dif: f64,
}

impl StageSummaryRow {
    /// Build from the best-row metrics (Res, PF, Trades) of both runs
    pub fn from_metrics(indicator: &str, is: [f64; 3], oos: [f64; 3]) -> Self {
        Self {
            indicator: indicator.to_string(),
            res_is: is[0],
            res_oos: oos[0],
            pf_is: is[1],
            pf_oos: oos[1],
            trades_is: is[2],
            trades_oos: oos[2],
            res_dif: percent_diff(is[0], oos[0]),
            res_mean: (is[0] + oos[0]) / 2.0,
            pf_dif: percent_diff(is[1], oos[1]),
            trades_dif: percent_diff(is[2], oos[2]),
        }
    }

    pub fn to_record(&self) -> Vec<String> {
        let mut record = vec![self.indicator.clone()];
        record.extend(
            [
                self.res_is,
                self.res_oos,
                self.pf_is,
                self.pf_oos,
                self.trades_is,
                self.trades_oos,
                self.res_dif,
                self.res_mean,
                self.pf_dif,
                self.trades_dif,
            ]
            .iter()
            .map(|v| format_number(*v)),
        );
        record
    }
}

/// Res, PF and Trades of the best row (by Result)
fn top_metrics(table: &ReportTable, source: &Path) -> Result<[f64; 3], PipelineError> {
    let result_col = table
        .column(RESULT_COLUMN)
        .ok_or_else(|| PipelineError::malformed(source, "no 'Result' column"))?;
    if table.is_empty() {
        return Err(PipelineError::malformed(source, "no rows"));
    }
    let mut sorted = table.clone();
    sorted.sort_desc_by(result_col);

    let mut values = [0.0; 3];
    for (slot, (_, column)) in values.iter_mut().zip(METRICS.iter()) {
        let idx = sorted
            .column(column)
            .ok_or_else(|| PipelineError::malformed(source, format!("no '{}' column", column)))?;
        *slot = safe_float(sorted.cell(0, idx).unwrap_or(""));
    }
    Ok(values)
}

/// All summary rows of a stage, best out-of-sample result first
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SummaryTable {
    pub rows: Vec<StageSummaryRow>,
}

impl SummaryTable {
    pub fn sort(&mut self) {
        self.rows.sort_by(|a, b| b.res_oos.total_cmp(&a.res_oos));
    }

    pub fn headers() -> Vec<String> {
        SUMMARY_HEADERS.iter().map(|h| h.to_string()).collect()
    }

    pub fn records(&self) -> Vec<Vec<String>> {
        self.rows.iter().map(StageSummaryRow::to_record).collect()
    }

    /// Rows whose indicator starts with the stage name
    pub fn for_stage(&self, stage: &str) -> SummaryTable {
        SummaryTable {
            rows: self
                .rows
                .iter()
                .filter(|r| r.indicator.starts_with(stage))
                .cloned()
                .collect(),
        }
    }

    pub fn write(&self, path: &Path) -> Result<(), PipelineError> {
        persistence::write_csv(path, &Self::headers(), &self.records())
    }

    /// Fixed-width text rendering for the console
    pub fn to_text(&self) -> String {
        let records = self.records();
        let headers = Self::headers();
        let widths: Vec<usize> = headers
            .iter()
            .enumerate()
            .map(|(i, h)| {
                records
                    .iter()
                    .map(|r| r[i].len())
                    .chain(std::iter::once(h.len()))
                    .max()
                    .unwrap_or(0)
            })
            .collect();

        let line = |cells: &[String]| {
            cells
                .iter()
                .zip(widths.iter())
                .map(|(c, w)| format!("{:>width$}", c, width = *w))
                .collect::<Vec<_>>()
                .join("  ")
        };

        let mut out = line(&headers);
        for record in &records {
            out.push('\n');
            out.push_str(&line(record));
        }
        out
    }
}

/// Read every `<candidate>_IS.csv` / `<candidate>_OOS.csv` pair. Candidates
/// with a missing or unreadable artifact land in the failed list.
pub fn collect(results_dir: &Path) -> Result<(SummaryTable, Vec<String>), PipelineError> {
    let mut table = SummaryTable::default();
    let mut failed = Vec::new();

    if !results_dir.exists() {
        return Ok((table, failed));
    }

    let is_suffix = format!("_{}.csv", SampleMode::InSample.suffix());
    let mut candidates: Vec<String> = fs::read_dir(results_dir)?
        .filter_map(|entry| entry.ok())
        .filter_map(|entry| entry.file_name().to_str().map(str::to_string))
        .filter_map(|name| name.strip_suffix(&is_suffix).map(str::to_string))
        .collect();
    candidates.sort();

    for candidate in candidates {
        match summarise_candidate(results_dir, &candidate) {
            Ok(row) => table.rows.push(row),
            Err(e) => {
                warn!(candidate = %candidate, error = %e, "Failed to process results");
                failed.push(candidate);
            }
        }
    }

    table.sort();
    Ok((table, failed))
}

fn summarise_candidate(results_dir: &Path, candidate: &str) -> Result<StageSummaryRow, PipelineError> {
    let metrics = |mode: SampleMode| {
        let path = results_dir.join(mode.result_file(candidate));
        if !path.exists() {
            return Err(PipelineError::ResultNotFound {
                candidate: candidate.to_string(),
                path,
            });
        }
        let table = ReportTable::read_csv(&path)
            .map_err(|e| PipelineError::malformed(&path, e.to_string()))?;
        top_metrics(&table, &path)
    };

    let is = metrics(SampleMode::InSample)?;
    let oos = metrics(SampleMode::OutOfSample)?;
    Ok(StageSummaryRow::from_metrics(candidate, is, oos))
}

/// Rewrite the stage's summary artifacts from scratch: the full summary
/// (header only when empty), the stage-filtered summary when any row
/// matches, and the failed list.
pub fn update(
    results_dir: &Path,
    stage_name: Option<&str>,
    print_summary: bool,
) -> Result<(SummaryTable, Vec<String>), PipelineError> {
    let (table, failed) = collect(results_dir)?;

    if table.rows.is_empty() {
        warn!(dir = %results_dir.display(), "No valid results found");
    }
    table.write(&results_dir.join(SUMMARY_FILE))?;
    info!(rows = table.rows.len(), "Saved combined results");

    if let Some(stage) = stage_name {
        let stage_table = table.for_stage(stage);
        if !stage_table.rows.is_empty() {
            let path = results_dir.join(stage_summary_file(stage));
            stage_table.write(&path)?;
            info!(path = %path.display(), "Saved stage-specific results");
        }
    }

    persistence::write_text(&results_dir.join(FAILED_LIST_FILE), &failed.join("\n"))?;
    if !failed.is_empty() {
        warn!(failed = ?failed, "Some candidates failed post-processing");
    }

    if print_summary {
        println!("{}", table.to_text());
    }

    Ok((table, failed))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_pair(dir: &Path, name: &str, is: &str, oos: &str) {
        fs::write(dir.join(format!("{}_IS.csv", name)), is).unwrap();
        fs::write(dir.join(format!("{}_OOS.csv", name)), oos).unwrap();
    }

    fn report(result: f64, pf: f64, trades: u32) -> String {
        format!(
            "Pass,Result,Profit Factor,Trades,Period\n1,{},{},{},14\n2,{},1.0,1,7\n",
            result,
            pf,
            trades,
            result / 2.0
        )
    }

    #[test]
    fn test_percent_diff() {
        assert_eq!(percent_diff(120.0, 95.0), 26.32);
        assert_eq!(percent_diff(10.0, 0.0), 0.0);
        assert_eq!(percent_diff(95.0, 95.0), 0.0);
    }

    #[test]
    fn test_adx_scenario() {
        let dir = tempfile::tempdir().unwrap();
        write_pair(dir.path(), "ADX", &report(120.0, 1.8, 40), &report(95.0, 1.5, 30));

        let (table, failed) = collect(dir.path()).unwrap();
        assert!(failed.is_empty());
        let row = &table.rows[0];
        assert_eq!(row.res_is, 120.0);
        assert_eq!(row.res_oos, 95.0);
        assert_eq!(row.res_dif, 26.32);
        assert_eq!(row.res_mean, 107.5);
        assert_eq!(row.trades_dif, 33.33);
    }

    #[test]
    fn test_rows_sorted_by_oos_and_zero_oos() {
        let dir = tempfile::tempdir().unwrap();
        write_pair(dir.path(), "ADX", &report(120.0, 1.8, 40), &report(0.0, 0.0, 0));
        write_pair(dir.path(), "RSI", &report(80.0, 1.4, 20), &report(60.0, 1.2, 18));

        let (table, failed) = collect(dir.path()).unwrap();
        assert!(failed.is_empty());
        assert_eq!(table.rows.len(), 2);
        assert_eq!(table.rows[0].indicator, "RSI");
        assert_eq!(table.rows[1].res_dif, 0.0);
        assert_eq!(table.rows[1].pf_dif, 0.0);
    }

    #[test]
    fn test_partial_failure() {
        let dir = tempfile::tempdir().unwrap();
        write_pair(dir.path(), "ADX", &report(120.0, 1.8, 40), &report(95.0, 1.5, 30));
        write_pair(dir.path(), "RSI", &report(80.0, 1.4, 20), &report(60.0, 1.2, 18));
        write_pair(dir.path(), "MACD", &report(70.0, 1.3, 25), "garbage without columns\n");

        let (table, failed) = update(dir.path(), Some("Trigger"), false).unwrap();
        assert_eq!(table.rows.len(), 2);
        assert_eq!(failed, vec!["MACD".to_string()]);

        let written = ReportTable::read_csv(&dir.path().join(SUMMARY_FILE)).unwrap();
        assert_eq!(written.headers, SummaryTable::headers());
        assert_eq!(written.rows.len(), 2);
        assert_eq!(
            fs::read_to_string(dir.path().join(FAILED_LIST_FILE)).unwrap(),
            "MACD"
        );
        assert!(!dir.path().join(stage_summary_file("Trigger")).exists());
    }

    #[test]
    fn test_missing_oos_is_failed_and_list_is_rewritten() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("ADX_IS.csv"), report(120.0, 1.8, 40)).unwrap();
        update(dir.path(), None, false).unwrap();
        assert_eq!(
            fs::read_to_string(dir.path().join(FAILED_LIST_FILE)).unwrap(),
            "ADX"
        );

        fs::write(dir.path().join("ADX_OOS.csv"), report(95.0, 1.5, 30)).unwrap();
        let (table, failed) = update(dir.path(), None, false).unwrap();
        assert_eq!(table.rows.len(), 1);
        assert!(failed.is_empty());
        assert_eq!(
            fs::read_to_string(dir.path().join(FAILED_LIST_FILE)).unwrap(),
            ""
        );
    }

    #[test]
    fn test_empty_results_write_header() {
        let dir = tempfile::tempdir().unwrap();
        let (table, _) = update(dir.path(), Some("Trigger"), false).unwrap();
        assert!(table.rows.is_empty());
        let written = fs::read_to_string(dir.path().join(SUMMARY_FILE)).unwrap();
        assert!(written.starts_with("Indicator,Res_IS,Res_OOS"));
    }

    #[test]
    fn test_stage_filtered_summary() {
        let dir = tempfile::tempdir().unwrap();
        write_pair(dir.path(), "Trigger_ADX", &report(120.0, 1.8, 40), &report(95.0, 1.5, 30));
        write_pair(dir.path(), "RSI", &report(80.0, 1.4, 20), &report(60.0, 1.2, 18));

        update(dir.path(), Some("Trigger"), false).unwrap();
        let stage = ReportTable::read_csv(&dir.path().join(stage_summary_file("Trigger"))).unwrap();
        assert_eq!(stage.rows.len(), 1);
        assert_eq!(stage.rows[0][0], "Trigger_ADX");
    }
}
