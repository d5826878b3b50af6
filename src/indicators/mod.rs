//! Indicator metadata
//!
//! Each candidate is described by a YAML file with a single top-level key
//! (the indicator name):
//!
//! ```yaml
//! ADX:
//!   indicator_path: "Indicators\\ADX.ex5"
//!   indicator_inputs:
//!     period: {default: 14, min: 2, max: 50, step: 1, type: int}
//!   logic_inputs:
//!     threshold: {default: 25.0, optimise: false}
//!   buffers: [0, 1]
//! ```

use serde_yaml::{Mapping, Value};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

use crate::error::PipelineError;
use crate::types::{IndicatorParameter, ParamValue};

const INDICATOR_INPUTS: &str = "indicator_inputs";
const LOGIC_INPUTS: &str = "logic_inputs";
/// Older metadata files keep every input under this key
const LEGACY_INPUTS: &str = "inputs";

/// Parsed metadata of one indicator
#[derive(Debug, Clone, PartialEq)]
pub struct IndicatorDefinition {
    pub name: String,
    /// Inputs passed to the indicator itself
    pub indicator_inputs: Vec<IndicatorParameter>,
    /// Inputs consumed by the expert's trading logic
    pub logic_inputs: Vec<IndicatorParameter>,
    /// Everything else (path, buffers, conditions, enums...), kept verbatim
    pub extra: Mapping,
}

impl IndicatorDefinition {
    /// Load a definition file, checking its top-level key against `expected`
    pub fn load(path: &Path, expected: &str) -> Result<Self, PipelineError> {
        let text = fs::read_to_string(path).map_err(|e| PipelineError::MissingMetadata {
            candidate: expected.to_string(),
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;
        Self::parse(&text, path, expected)
    }

    pub fn parse(text: &str, path: &Path, expected: &str) -> Result<Self, PipelineError> {
        let invalid = |reason: String| PipelineError::MissingMetadata {
            candidate: expected.to_string(),
            path: path.to_path_buf(),
            reason,
        };

        let doc: Value = serde_yaml::from_str(text).map_err(|e| invalid(e.to_string()))?;
        let top = doc
            .as_mapping()
            .ok_or_else(|| invalid("top level is not a mapping".to_string()))?;
        if top.len() != 1 {
            return Err(invalid(format!(
                "expected a single top-level indicator, found {}",
                top.len()
            )));
        }

        let (key, body) = top
            .iter()
            .next()
            .ok_or_else(|| invalid("empty document".to_string()))?;
        let name = key
            .as_str()
            .ok_or_else(|| invalid("top-level key is not a string".to_string()))?
            .to_string();
        if !name.eq_ignore_ascii_case(expected) {
            warn!(
                path = %path.display(),
                found = %name,
                expected = %expected,
                "Top-level key does not match expected indicator name"
            );
        }

        let mut extra = match body {
            Value::Mapping(m) => m.clone(),
            Value::Null => Mapping::new(),
            _ => return Err(invalid("indicator body is not a mapping".to_string())),
        };

        let legacy = extra.remove(LEGACY_INPUTS);
        let indicator_section = extra.remove(INDICATOR_INPUTS).or(legacy);
        let indicator_inputs = parse_inputs(indicator_section, INDICATOR_INPUTS)
            .map_err(|reason| invalid(reason))?;
        let logic_inputs =
            parse_inputs(extra.remove(LOGIC_INPUTS), LOGIC_INPUTS).map_err(|reason| invalid(reason))?;

        debug!(
            indicator = %name,
            indicator_inputs = indicator_inputs.len(),
            logic_inputs = logic_inputs.len(),
            "Loaded indicator metadata"
        );

        Ok(Self {
            name,
            indicator_inputs,
            logic_inputs,
            extra,
        })
    }

    /// All inputs, indicator inputs first; a logic input shadows an indicator
    /// input of the same name.
    pub fn inputs(&self) -> Vec<IndicatorParameter> {
        let mut merged: Vec<IndicatorParameter> = self
            .indicator_inputs
            .iter()
            .filter(|p| !self.logic_inputs.iter().any(|l| l.name == p.name))
            .cloned()
            .collect();
        merged.extend(self.logic_inputs.iter().cloned());
        merged
    }

    /// Find an input by name, exact match first, then case-insensitive
    pub fn input_mut(&mut self, key: &str) -> Option<&mut IndicatorParameter> {
        let exact = self
            .indicator_inputs
            .iter()
            .chain(self.logic_inputs.iter())
            .any(|p| p.name == key);

        self.indicator_inputs
            .iter_mut()
            .chain(self.logic_inputs.iter_mut())
            .find(|p| {
                if exact {
                    p.name == key
                } else {
                    p.name.eq_ignore_ascii_case(key)
                }
            })
    }

    /// String view of an extra field (path, function, conditions...)
    pub fn extra_str(&self, key: &str) -> Option<String> {
        match self.extra.get(key)? {
            Value::String(s) => Some(s.clone()),
            Value::Bool(b) => Some(b.to_string()),
            Value::Number(n) => Some(n.to_string()),
            _ => None,
        }
    }

    /// Serialize back to the single-key YAML layout
    pub fn to_yaml(&self) -> Result<Value, PipelineError> {
        let mut body = Mapping::new();
        body.insert(
            Value::from(INDICATOR_INPUTS),
            inputs_to_value(&self.indicator_inputs)?,
        );
        body.insert(Value::from(LOGIC_INPUTS), inputs_to_value(&self.logic_inputs)?);
        for (k, v) in &self.extra {
            body.insert(k.clone(), v.clone());
        }

        let mut top = Mapping::new();
        top.insert(Value::from(self.name.as_str()), Value::Mapping(body));
        Ok(Value::Mapping(top))
    }
}

fn parse_inputs(section: Option<Value>, label: &str) -> Result<Vec<IndicatorParameter>, String> {
    let mapping = match section {
        None | Some(Value::Null) => return Ok(Vec::new()),
        Some(Value::Mapping(m)) => m,
        Some(_) => return Err(format!("'{}' must be a mapping", label)),
    };

    let mut inputs = Vec::with_capacity(mapping.len());
    for (key, value) in mapping {
        let name = key
            .as_str()
            .ok_or_else(|| format!("non-string input name in '{}'", label))?
            .to_string();

        let mut param = match value {
            Value::Mapping(_) => serde_yaml::from_value::<IndicatorParameter>(value)
                .map_err(|e| format!("input '{}': {}", name, e))?,
            // Minimal selection files store bare values
            scalar => {
                let default: ParamValue = serde_yaml::from_value(scalar)
                    .map_err(|e| format!("input '{}': {}", name, e))?;
                IndicatorParameter::new(&name, default)
            }
        };
        param.name = name;
        inputs.push(param);
    }
    Ok(inputs)
}

fn inputs_to_value(inputs: &[IndicatorParameter]) -> Result<Value, PipelineError> {
    let mut mapping = Mapping::new();
    for param in inputs {
        mapping.insert(Value::from(param.name.as_str()), serde_yaml::to_value(param)?);
    }
    Ok(Value::Mapping(mapping))
}

/// Locate the metadata file of an indicator: `<name>.yaml` first, otherwise
/// the file whose top-level key matches case-insensitively.
pub fn find_definition(dir: &Path, indicator: &str) -> Result<PathBuf, PipelineError> {
    let direct = dir.join(format!("{}.yaml", indicator));
    if direct.exists() {
        return Ok(direct);
    }

    for path in list_definitions(dir)? {
        let text = match fs::read_to_string(&path) {
            Ok(t) => t,
            Err(_) => continue,
        };
        let top_key = serde_yaml::from_str::<Value>(&text).ok().and_then(|doc| {
            doc.as_mapping()
                .and_then(|m| m.keys().next())
                .and_then(|k| k.as_str())
                .map(str::to_string)
        });
        if top_key.is_some_and(|k| k.eq_ignore_ascii_case(indicator)) {
            return Ok(path);
        }
    }

    Err(PipelineError::MissingMetadata {
        candidate: indicator.to_string(),
        path: direct,
        reason: "no metadata file found".to_string(),
    })
}

/// All `*.yaml` metadata files in a directory, sorted by name
pub fn list_definitions(dir: &Path) -> Result<Vec<PathBuf>, PipelineError> {
    if !dir.exists() {
        return Ok(Vec::new());
    }
    let mut files = Vec::new();
    for entry in fs::read_dir(dir)? {
        let path = entry?.path();
        if path.is_file()
            && path
                .extension()
                .and_then(|e| e.to_str())
                .map(|e| e.eq_ignore_ascii_case("yaml"))
                .unwrap_or(false)
        {
            files.push(path);
        }
    }
    files.sort();
    Ok(files)
}
