//! Terminal report handling
//!
//! The tester exports optimisation results as a SpreadsheetML workbook
//! (`<report>.xml` in the terminal data root). After each run the report is
//! copied into the stage's results directory and converted to CSV, which is
//! the format every later step reads.

use csv::ReaderBuilder;
use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, error, info, warn};

use crate::error::PipelineError;
use crate::persistence;

/// A header row plus data rows, all raw text
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ReportTable {
    pub headers: Vec<String>,
    pub rows: Vec<Vec<String>>,
}

impl ReportTable {
    pub fn read_csv(path: &Path) -> Result<Self, PipelineError> {
        let mut reader = ReaderBuilder::new()
            .has_headers(true)
            .flexible(true)
            .from_path(path)?;

        let headers = reader
            .headers()?
            .iter()
            .map(|h| h.trim().to_string())
            .collect();
        let mut rows = Vec::new();
        for record in reader.records() {
            rows.push(record?.iter().map(str::to_string).collect());
        }
        Ok(Self { headers, rows })
    }

    pub fn write_csv(&self, path: &Path) -> Result<(), PipelineError> {
        persistence::write_csv(path, &self.headers, &self.rows)
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn column(&self, name: &str) -> Option<usize> {
        self.headers.iter().position(|h| h == name)
    }

    pub fn cell(&self, row: usize, column: usize) -> Option<&str> {
        self.rows
            .get(row)
            .and_then(|r| r.get(column))
            .map(String::as_str)
    }

    /// Stable sort of the rows by a numeric column, highest first
    pub fn sort_desc_by(&mut self, column: usize) {
        self.rows.sort_by(|a, b| {
            let va = a.get(column).map(|v| safe_float(v)).unwrap_or(0.0);
            let vb = b.get(column).map(|v| safe_float(v)).unwrap_or(0.0);
            vb.total_cmp(&va)
        });
    }
}

/// Numeric value of a report cell; empty, NaN and infinite markers read as 0.0
pub fn safe_float(raw: &str) -> f64 {
    let v = raw.trim().to_lowercase();
    match v.as_str() {
        "" | "nan" | "inf" | "-inf" | "-nan(ind)" => 0.0,
        _ => v
            .parse::<f64>()
            .ok()
            .filter(|f| f.is_finite())
            .unwrap_or(0.0),
    }
}

/// Turns a report file's bytes into a table
pub trait ReportParser {
    fn parse(&self, bytes: &[u8], source: &Path) -> Result<ReportTable, PipelineError>;
}

/// Excel 2003 XML (SpreadsheetML): first `Table`, first `Row` is the header
#[derive(Debug, Clone, Copy, Default)]
pub struct SpreadsheetMlParser;

impl ReportParser for SpreadsheetMlParser {
    fn parse(&self, bytes: &[u8], source: &Path) -> Result<ReportTable, PipelineError> {
        let text = persistence::decode_text(bytes);
        let mut reader = Reader::from_str(&text);
        reader.trim_text(true);

        let mut table_rows: Option<Vec<Vec<String>>> = None;
        let mut in_table = false;
        let mut row: Option<Vec<String>> = None;
        let mut data: Option<String> = None;

        loop {
            match reader.read_event()? {
                Event::Start(e) => match e.local_name().as_ref() {
                    b"Table" if table_rows.is_none() => {
                        in_table = true;
                        table_rows = Some(Vec::new());
                    }
                    b"Row" if in_table => row = Some(Vec::new()),
                    b"Cell" if in_table => {
                        if let Some(r) = row.as_mut() {
                            pad_to_index(r, &e);
                        }
                    }
                    b"Data" if in_table => data = Some(String::new()),
                    _ => {}
                },
                Event::Empty(e) => match e.local_name().as_ref() {
                    b"Cell" | b"Data" if in_table => {
                        if let Some(r) = row.as_mut() {
                            if e.local_name().as_ref() == b"Cell" {
                                pad_to_index(r, &e);
                            }
                            r.push(String::new());
                        }
                    }
                    _ => {}
                },
                Event::Text(t) => {
                    if let Some(d) = data.as_mut() {
                        d.push_str(&t.unescape()?);
                    }
                }
                Event::CData(c) => {
                    if let Some(d) = data.as_mut() {
                        d.push_str(&String::from_utf8_lossy(&c));
                    }
                }
                Event::End(e) => match e.local_name().as_ref() {
                    b"Data" if in_table => {
                        if let (Some(r), Some(d)) = (row.as_mut(), data.take()) {
                            r.push(d);
                        }
                    }
                    b"Row" if in_table => {
                        if let (Some(rows), Some(r)) = (table_rows.as_mut(), row.take()) {
                            rows.push(r);
                        }
                    }
                    // Only the first table is kept
                    b"Table" if in_table => break,
                    _ => {}
                },
                Event::Eof => break,
                _ => {}
            }
        }

        let mut rows = table_rows
            .ok_or_else(|| PipelineError::malformed(source, "no table in workbook"))?
            .into_iter();
        let headers = rows
            .next()
            .ok_or_else(|| PipelineError::malformed(source, "table has no header row"))?;
        // Trailing empty cells may be left out of a row
        let width = headers.len();
        let rows = rows
            .map(|mut row| {
                if row.len() < width {
                    row.resize(width, String::new());
                }
                row
            })
            .collect();
        Ok(ReportTable { headers, rows })
    }
}

/// Honour `ss:Index` (1-based) on sparse rows
fn pad_to_index(row: &mut Vec<String>, cell: &BytesStart<'_>) {
    let index = cell
        .attributes()
        .flatten()
        .find(|a| a.key.local_name().as_ref() == b"Index")
        .and_then(|a| a.unescape_value().ok())
        .and_then(|v| v.parse::<usize>().ok());
    if let Some(index) = index {
        while row.len() + 1 < index {
            row.push(String::new());
        }
    }
}

/// Convert a SpreadsheetML report to CSV
pub fn convert_to_csv(xml: &Path, csv: &Path) -> Result<ReportTable, PipelineError> {
    let bytes = fs::read(xml)?;
    let table = SpreadsheetMlParser.parse(&bytes, xml)?;
    table.write_csv(csv)?;
    debug!(csv = %csv.display(), rows = table.rows.len(), "Converted report to CSV");
    Ok(table)
}

/// Copy `<report_dir>/<report>.xml` into `results_dir`, convert it to
/// `<report>.csv` and delete the copied XML. A failed conversion keeps the
/// XML for inspection and is returned as an error.
pub fn copy_report(
    report_dir: &Path,
    report_name: &str,
    results_dir: &Path,
) -> Result<PathBuf, PipelineError> {
    let src = report_dir.join(format!("{}.xml", report_name));
    if !src.exists() {
        error!(report = %src.display(), "Report not found");
        return Err(PipelineError::ReportMissing(src));
    }

    fs::create_dir_all(results_dir)?;
    let dest_xml = results_dir.join(format!("{}.xml", report_name));
    let dest_csv = results_dir.join(format!("{}.csv", report_name));
    fs::copy(&src, &dest_xml)?;
    info!(report = %dest_xml.display(), "Copied terminal report");

    match convert_to_csv(&dest_xml, &dest_csv) {
        Ok(_) => {
            fs::remove_file(&dest_xml)?;
            info!(csv = %dest_csv.display(), "Converted and deleted XML report");
            Ok(dest_csv)
        }
        Err(e) => {
            warn!(report = %dest_xml.display(), error = %e, "Failed to convert report to CSV");
            Err(e)
        }
    }
}

#[cfg(test)]
pub(crate) mod fixtures {
    /// Minimal tester export with the given header and rows
    pub fn spreadsheet_xml(headers: &[&str], rows: &[Vec<String>]) -> String {
        let cell = |v: &str| {
            let ty = if v.parse::<f64>().is_ok() { "Number" } else { "String" };
            format!("<Cell><Data ss:Type=\"{}\">{}</Data></Cell>", ty, v)
        };
        let mut xml = String::from(
            "<?xml version=\"1.0\"?>\n<Workbook xmlns=\"urn:schemas-microsoft-com:office:spreadsheet\" \
             xmlns:ss=\"urn:schemas-microsoft-com:office:spreadsheet\">\n\
             <Worksheet ss:Name=\"Tester Optimizator Results\"><Table>\n<Row>",
        );
        for h in headers {
            xml.push_str(&cell(h));
        }
        xml.push_str("</Row>\n");
        for r in rows {
            xml.push_str("<Row>");
            for v in r {
                xml.push_str(&cell(v));
            }
            xml.push_str("</Row>\n");
        }
        xml.push_str("</Table></Worksheet></Workbook>\n");
        xml
    }
}

#[cfg(test)]
mod tests {
    use super::fixtures::spreadsheet_xml;
    use super::*;

    fn row(values: &[&str]) -> Vec<String> {
        values.iter().map(|v| v.to_string()).collect()
    }

    #[test]
    fn test_parse_spreadsheet() {
        let xml = spreadsheet_xml(
            &["Pass", "Result", "Profit Factor", "period"],
            &[row(&["1", "120.5", "1.8", "14"]), row(&["2", "95", "1.2", "21"])],
        );
        let table = SpreadsheetMlParser.parse(xml.as_bytes(), Path::new("r.xml")).unwrap();
        assert_eq!(table.headers, vec!["Pass", "Result", "Profit Factor", "period"]);
        assert_eq!(table.rows.len(), 2);
        assert_eq!(table.rows[1][3], "21");
    }

    #[test]
    fn test_parse_utf16_and_sparse_cells() {
        let xml = "<Workbook><Worksheet><Table>\
                   <Row><Cell><Data>a</Data></Cell><Cell><Data>b</Data></Cell><Cell><Data>c</Data></Cell></Row>\
                   <Row><Cell><Data>1</Data></Cell><Cell ss:Index=\"3\"><Data>3</Data></Cell></Row>\
                   </Table></Worksheet></Workbook>";
        let bytes = persistence::encode_utf16le(xml);
        let table = SpreadsheetMlParser.parse(&bytes, Path::new("r.xml")).unwrap();
        assert_eq!(table.rows[0], row(&["1", "", "3"]));
    }

    #[test]
    fn test_short_rows_are_padded_to_header() {
        let terminal_root = tempfile::tempdir().unwrap();
        let results = tempfile::tempdir().unwrap();
        let xml = "<Workbook><Worksheet><Table>\
                   <Row><Cell><Data>Pass</Data></Cell><Cell><Data>Result</Data></Cell><Cell><Data>period</Data></Cell></Row>\
                   <Row><Cell><Data>1</Data></Cell><Cell><Data>50</Data></Cell></Row>\
                   </Table></Worksheet></Workbook>";

        let table = SpreadsheetMlParser.parse(xml.as_bytes(), Path::new("r.xml")).unwrap();
        assert_eq!(table.rows, vec![row(&["1", "50", ""])]);

        fs::write(terminal_root.path().join("RSI_IS.xml"), xml).unwrap();
        let csv = copy_report(terminal_root.path(), "RSI_IS", results.path()).unwrap();
        let written = ReportTable::read_csv(&csv).unwrap();
        assert_eq!(written.rows, vec![row(&["1", "50", ""])]);
    }

    #[test]
    fn test_parse_without_table_is_malformed() {
        let err = SpreadsheetMlParser
            .parse(b"<Workbook></Workbook>", Path::new("r.xml"))
            .unwrap_err();
        assert!(matches!(err, PipelineError::MalformedReport { .. }));
    }

    #[test]
    fn test_copy_report_converts_and_removes_xml() {
        let terminal_root = tempfile::tempdir().unwrap();
        let results = tempfile::tempdir().unwrap();
        let xml = spreadsheet_xml(&["Pass", "Result"], &[row(&["1", "10"])]);
        fs::write(terminal_root.path().join("ADX_IS.xml"), xml).unwrap();

        let csv = copy_report(terminal_root.path(), "ADX_IS", results.path()).unwrap();
        assert_eq!(csv, results.path().join("ADX_IS.csv"));
        assert!(!results.path().join("ADX_IS.xml").exists());

        let table = ReportTable::read_csv(&csv).unwrap();
        assert_eq!(table.headers, vec!["Pass", "Result"]);
        assert_eq!(table.rows, vec![row(&["1", "10"])]);
    }

    #[test]
    fn test_copy_report_missing_source() {
        let terminal_root = tempfile::tempdir().unwrap();
        let err = copy_report(terminal_root.path(), "ADX_OOS", terminal_root.path()).unwrap_err();
        assert!(matches!(err, PipelineError::ReportMissing(_)));
    }

    #[test]
    fn test_safe_float_and_sorting() {
        assert_eq!(safe_float("-nan(ind)"), 0.0);
        assert_eq!(safe_float(" 12.5 "), 12.5);
        assert_eq!(safe_float("inf"), 0.0);

        let mut table = ReportTable {
            headers: vec!["Result".into()],
            rows: vec![row(&["10"]), row(&["50"]), row(&["30"])],
        };
        table.sort_desc_by(0);
        assert_eq!(table.rows[0][0], "50");
        assert_eq!(table.rows[2][0], "10");
    }
}
