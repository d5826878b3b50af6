//! Core types used throughout Optiforge
//!
//! Defines sample modes, parameter values, run results and candidate states.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Which half of the data a terminal run covers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SampleMode {
    InSample,
    OutOfSample,
}

impl SampleMode {
    /// Suffix used in report, config and result file names
    pub fn suffix(&self) -> &'static str {
        match self {
            SampleMode::InSample => "IS",
            SampleMode::OutOfSample => "OOS",
        }
    }

    /// Report name for a candidate in this mode (e.g. "ADX_IS")
    pub fn report_name(&self, candidate: &str) -> String {
        format!("{}_{}", candidate, self.suffix())
    }

    /// Result CSV file name for a candidate in this mode (e.g. "ADX_IS.csv")
    pub fn result_file(&self, candidate: &str) -> String {
        format!("{}.csv", self.report_name(candidate))
    }

    pub fn is_in_sample(&self) -> bool {
        matches!(self, SampleMode::InSample)
    }
}

impl fmt::Display for SampleMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SampleMode::InSample => write!(f, "in-sample"),
            SampleMode::OutOfSample => write!(f, "out-of-sample"),
        }
    }
}

/// How the expert splits the tested period into IS/OOS halves
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DataSplit {
    None,
    Year,
    Month,
}

impl Default for DataSplit {
    fn default() -> Self {
        DataSplit::None
    }
}

impl DataSplit {
    /// Code understood by the expert's `inp_data_split_method` input
    pub fn code(&self, mode: SampleMode) -> u8 {
        match (self, mode) {
            (DataSplit::Year, SampleMode::InSample) => 2,
            (DataSplit::Year, SampleMode::OutOfSample) => 1,
            (DataSplit::Month, SampleMode::InSample) => 4,
            (DataSplit::Month, SampleMode::OutOfSample) => 3,
            (DataSplit::None, _) => 0,
        }
    }

    /// Parse from string
    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "none" => Some(DataSplit::None),
            "year" => Some(DataSplit::Year),
            "month" => Some(DataSplit::Month),
            _ => None,
        }
    }
}

/// A runtime parameter value as found in indicator metadata or result files
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ParamValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
}

impl ParamValue {
    /// Infer the narrowest primitive type for a raw text value
    pub fn infer(raw: &str) -> Self {
        let trimmed = raw.trim();
        if trimmed.eq_ignore_ascii_case("true") {
            return ParamValue::Bool(true);
        }
        if trimmed.eq_ignore_ascii_case("false") {
            return ParamValue::Bool(false);
        }
        if let Ok(v) = trimmed.parse::<i64>() {
            return ParamValue::Int(v);
        }
        match trimmed.parse::<f64>() {
            Ok(v) if v.is_finite() => ParamValue::Float(v),
            _ => ParamValue::Text(raw.to_string()),
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            ParamValue::Int(v) => Some(*v as f64),
            ParamValue::Float(v) => Some(*v),
            ParamValue::Bool(b) => Some(if *b { 1.0 } else { 0.0 }),
            ParamValue::Text(_) => None,
        }
    }

    /// Primitive type name, used when synthesizing metadata entries
    pub fn type_name(&self) -> &'static str {
        match self {
            ParamValue::Bool(_) => "bool",
            ParamValue::Int(_) => "int",
            ParamValue::Float(_) => "double",
            ParamValue::Text(_) => "string",
        }
    }
}

impl fmt::Display for ParamValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ParamValue::Bool(b) => write!(f, "{}", b),
            ParamValue::Int(v) => write!(f, "{}", v),
            ParamValue::Float(v) => write!(f, "{}", format_number(*v)),
            ParamValue::Text(s) => write!(f, "{}", s),
        }
    }
}

/// Format a float the way the terminal expects: whole numbers keep one decimal
pub fn format_number(v: f64) -> String {
    if v.is_finite() && v.fract() == 0.0 && v.abs() < 1e15 {
        format!("{:.1}", v)
    } else {
        format!("{}", v)
    }
}

/// Declared type of an indicator input
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum ParamType {
    Int,
    Float,
    Bool,
    /// Enum or any other MQL5 type, kept verbatim
    Named(String),
}

impl ParamType {
    /// Type keyword used in generated `input` declarations
    pub fn mql_type(&self) -> &str {
        match self {
            ParamType::Int => "int",
            ParamType::Float => "double",
            ParamType::Bool => "bool",
            ParamType::Named(name) => name,
        }
    }

    pub fn is_integer(&self) -> bool {
        matches!(self, ParamType::Int)
    }

    /// Type implied by a default value when none is declared
    pub fn of_value(value: &ParamValue) -> Self {
        match value {
            ParamValue::Int(_) => ParamType::Int,
            ParamValue::Float(_) => ParamType::Float,
            ParamValue::Bool(_) => ParamType::Bool,
            ParamValue::Text(_) => ParamType::Named("string".to_string()),
        }
    }
}

impl From<String> for ParamType {
    fn from(s: String) -> Self {
        match s.trim().to_lowercase().as_str() {
            "int" | "long" | "short" | "char" | "uint" | "ulong" | "ushort" | "uchar" => {
                ParamType::Int
            }
            "float" | "double" => ParamType::Float,
            "bool" => ParamType::Bool,
            _ => ParamType::Named(s.trim().to_string()),
        }
    }
}

impl From<ParamType> for String {
    fn from(t: ParamType) -> Self {
        match t {
            ParamType::Int => "int".to_string(),
            ParamType::Float => "double".to_string(),
            ParamType::Bool => "bool".to_string(),
            ParamType::Named(name) => name,
        }
    }
}

/// One tunable input of an indicator, as declared in its metadata
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndicatorParameter {
    /// Input name (the metadata map key)
    #[serde(skip)]
    pub name: String,
    pub default: ParamValue,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub step: Option<f64>,
    #[serde(default = "default_optimise", alias = "optimize")]
    pub optimise: bool,
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub declared_type: Option<ParamType>,
}

fn default_optimise() -> bool {
    true
}

impl IndicatorParameter {
    pub fn new(name: &str, default: ParamValue) -> Self {
        Self {
            name: name.to_string(),
            default,
            min: None,
            max: None,
            step: None,
            optimise: false,
            declared_type: None,
        }
    }

    /// Declared type, or the one implied by the default value
    pub fn value_type(&self) -> ParamType {
        self.declared_type
            .clone()
            .unwrap_or_else(|| ParamType::of_value(&self.default))
    }
}

/// Best parameter assignment found by one terminal run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunResult {
    pub candidate: String,
    pub mode: SampleMode,
    /// Value of the `Result` column of the winning pass
    pub score: f64,
    /// Lower-cased parameter name -> raw value from the report
    pub parameters: BTreeMap<String, String>,
}

/// Per-candidate progress through a stage
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CandidateState {
    NotStarted,
    InSampleRunning,
    InSampleDone,
    OutOfSampleRunning,
    OutOfSampleDone,
    Failed,
}

impl Default for CandidateState {
    fn default() -> Self {
        CandidateState::NotStarted
    }
}

impl fmt::Display for CandidateState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CandidateState::NotStarted => write!(f, "NOT_STARTED"),
            CandidateState::InSampleRunning => write!(f, "IS_RUNNING"),
            CandidateState::InSampleDone => write!(f, "IS_DONE"),
            CandidateState::OutOfSampleRunning => write!(f, "OOS_RUNNING"),
            CandidateState::OutOfSampleDone => write!(f, "OOS_DONE"),
            CandidateState::Failed => write!(f, "FAILED"),
        }
    }
}
