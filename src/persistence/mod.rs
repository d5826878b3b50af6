//! Artifact persistence
//!
//! Every artifact the pipeline produces (INI files, result CSVs, summaries,
//! selections) is written to a temporary file in the destination directory
//! and renamed into place, so an interrupted run never leaves a truncated
//! file that would later be mistaken for a finished one.

use csv::WriterBuilder;
use serde::Serialize;
use std::fs;
use std::io::Write;
use std::path::Path;
use tempfile::NamedTempFile;
use tracing::debug;

use crate::error::PipelineError;

const UTF16_LE_BOM: [u8; 2] = [0xFF, 0xFE];

/// Write raw bytes atomically, creating the parent directory if needed
pub fn write_atomic(path: &Path, contents: &[u8]) -> Result<(), PipelineError> {
    let dir = match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p,
        _ => Path::new("."),
    };
    fs::create_dir_all(dir)?;

    let mut tmp = NamedTempFile::new_in(dir)?;
    tmp.write_all(contents)?;
    tmp.as_file().sync_all()?;
    tmp.persist(path).map_err(|e| e.error)?;

    debug!(path = %path.display(), bytes = contents.len(), "Wrote artifact");
    Ok(())
}

pub fn write_text(path: &Path, text: &str) -> Result<(), PipelineError> {
    write_atomic(path, text.as_bytes())
}

/// Write text as UTF-16LE with a byte-order mark (the terminal's INI encoding)
pub fn write_utf16(path: &Path, text: &str) -> Result<(), PipelineError> {
    write_atomic(path, &encode_utf16le(text))
}

pub fn encode_utf16le(text: &str) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(2 + text.len() * 2);
    bytes.extend_from_slice(&UTF16_LE_BOM);
    for unit in text.encode_utf16() {
        bytes.extend_from_slice(&unit.to_le_bytes());
    }
    bytes
}

/// Decode bytes that may be UTF-16 (LE/BE with BOM) or UTF-8 (with or without BOM)
pub fn decode_text(bytes: &[u8]) -> String {
    match bytes {
        [0xFF, 0xFE, rest @ ..] => decode_utf16(rest, u16::from_le_bytes),
        [0xFE, 0xFF, rest @ ..] => decode_utf16(rest, u16::from_be_bytes),
        [0xEF, 0xBB, 0xBF, rest @ ..] => String::from_utf8_lossy(rest).into_owned(),
        _ => String::from_utf8_lossy(bytes).into_owned(),
    }
}

fn decode_utf16(bytes: &[u8], to_unit: fn([u8; 2]) -> u16) -> String {
    let units: Vec<u16> = bytes
        .chunks_exact(2)
        .map(|pair| to_unit([pair[0], pair[1]]))
        .collect();
    String::from_utf16_lossy(&units)
}

/// Write a CSV table with a header row. The header is written even when
/// there are no rows.
pub fn write_csv(path: &Path, headers: &[String], rows: &[Vec<String>]) -> Result<(), PipelineError> {
    let mut writer = WriterBuilder::new().has_headers(false).from_writer(Vec::new());
    writer.write_record(headers)?;
    for row in rows {
        writer.write_record(row)?;
    }
    writer.flush()?;
    let bytes = writer.into_inner().map_err(|e| {
        PipelineError::Io(std::io::Error::new(std::io::ErrorKind::Other, e.to_string()))
    })?;
    write_atomic(path, &bytes)
}

pub fn write_yaml<T: Serialize>(path: &Path, value: &T) -> Result<(), PipelineError> {
    let text = serde_yaml::to_string(value)?;
    write_text(path, &text)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_write_atomic_creates_parent_and_replaces() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("results").join("summary.csv");

        write_text(&path, "first").unwrap();
        write_text(&path, "second").unwrap();

        assert_eq!(fs::read_to_string(&path).unwrap(), "second");
        let leftovers = fs::read_dir(path.parent().unwrap()).unwrap().count();
        assert_eq!(leftovers, 1, "temporary files must not linger");
    }

    #[test]
    fn test_utf16_roundtrip() {
        let bytes = encode_utf16le("[Tester]\r\nSymbol=EURUSD\r\n");
        assert_eq!(&bytes[..2], &UTF16_LE_BOM);
        assert_eq!(decode_text(&bytes), "[Tester]\r\nSymbol=EURUSD\r\n");
        assert_eq!(decode_text("plain".as_bytes()), "plain");
    }

    #[test]
    fn test_csv_header_only() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("empty.csv");
        write_csv(&path, &["Indicator".to_string(), "Res_IS".to_string()], &[]).unwrap();
        assert_eq!(fs::read_to_string(&path).unwrap(), "Indicator,Res_IS\n");
    }
}
