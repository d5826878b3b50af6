//! Cross-stage data loading
//!
//! A stage is finished by hand: the operator reviews its summary and writes
//! (or asks `select` to write) `the_<stage>.yaml`, a single-entry mapping of
//! the chosen candidate to its optimised inputs. Downstream stages load that
//! selection and merge it over the candidate's metadata so the component is
//! rendered with its parameters fixed.

use serde_yaml::{Mapping, Value};
use std::fs;
use std::path::PathBuf;
use tracing::{debug, info, warn};

use crate::config::ResolvedPaths;
use crate::error::PipelineError;
use crate::indicators::{find_definition, IndicatorDefinition};
use crate::persistence;
use crate::reports::ReportTable;
use crate::results::best_pass;
use crate::stage::StageConfig;
use crate::types::{IndicatorParameter, ParamType, ParamValue, SampleMode};

/// Selected candidate of `stage` and its metadata with the optimised values
/// as defaults. Ranges are preserved.
pub fn load(
    paths: &ResolvedPaths,
    run_name: &str,
    stage: &StageConfig,
) -> Result<(String, IndicatorDefinition), PipelineError> {
    let selection_path = paths.selection_file(run_name, &stage.name);
    if !selection_path.exists() {
        warn!(
            stage = %stage.name,
            path = %selection_path.display(),
            "Upstream selection missing"
        );
        return Err(PipelineError::UpstreamResultMissing {
            stage: stage.name.clone(),
            path: selection_path,
        });
    }

    let text = fs::read_to_string(&selection_path)?;
    let doc: Value = serde_yaml::from_str(&text)?;
    let entries = match doc {
        Value::Mapping(m) => m,
        Value::Null => Mapping::new(),
        _ => {
            return Err(PipelineError::UpstreamSelection {
                stage: stage.name.clone(),
                found: 0,
            })
        }
    };
    if entries.len() != 1 {
        return Err(PipelineError::UpstreamSelection {
            stage: stage.name.clone(),
            found: entries.len(),
        });
    }

    let Some((Value::String(candidate), optimised)) = entries.into_iter().next() else {
        return Err(PipelineError::UpstreamSelection {
            stage: stage.name.clone(),
            found: 0,
        });
    };

    let metadata = find_definition(&paths.stage_indicator_dir(&stage.indicator_dir), &candidate)?;
    let mut def = IndicatorDefinition::load(&metadata, &candidate)?;

    let overrides = match optimised {
        Value::Mapping(m) => m,
        Value::Null => Mapping::new(),
        _ => {
            return Err(PipelineError::InvalidParameter {
                name: candidate,
                reason: format!("selection in {} is not a mapping", selection_path.display()),
            })
        }
    };
    merge(&mut def, &overrides)?;

    info!(
        stage = %stage.name,
        candidate = %candidate,
        overrides = overrides.len(),
        "Loaded upstream selection"
    );
    Ok((candidate, def))
}

/// Overwrite matching defaults; keys unknown to the metadata become fixed
/// logic inputs typed from their value
fn merge(def: &mut IndicatorDefinition, overrides: &Mapping) -> Result<(), PipelineError> {
    for (key, value) in overrides {
        let Some(key) = key.as_str() else { continue };
        let value: ParamValue = serde_yaml::from_value(value.clone())?;

        match def.input_mut(key) {
            Some(param) => {
                debug!(input = %key, from = %param.default, to = %value, "Override default");
                param.default = value;
            }
            None => {
                debug!(input = %key, value = %value, "Synthesized input");
                let mut param = IndicatorParameter::new(key, value);
                param.declared_type = Some(ParamType::of_value(&param.default));
                def.logic_inputs.push(param);
            }
        }
    }
    Ok(())
}

/// Write the selection artifact of `stage` for `candidate`: its default
/// inputs overlaid with the best in-sample pass. An existing selection is
/// never overwritten.
pub fn select(
    paths: &ResolvedPaths,
    run_name: &str,
    stage: &StageConfig,
    candidate: &str,
) -> Result<PathBuf, PipelineError> {
    let selection_path = paths.selection_file(run_name, &stage.name);
    if selection_path.exists() {
        info!(
            stage = %stage.name,
            path = %selection_path.display(),
            "Selection already exists, leaving it untouched"
        );
        return Ok(selection_path);
    }

    let metadata = find_definition(&paths.stage_indicator_dir(&stage.indicator_dir), candidate)?;
    let def = IndicatorDefinition::load(&metadata, candidate)?;

    let is_csv = paths
        .stage_dir(run_name, &stage.name)
        .join("results")
        .join(SampleMode::InSample.result_file(candidate));
    if !is_csv.exists() {
        return Err(PipelineError::ResultNotFound {
            candidate: candidate.to_string(),
            path: is_csv,
        });
    }
    let table = ReportTable::read_csv(&is_csv)?;
    let best = best_pass(&table, &is_csv)?
        .map(|(_, params)| params)
        .unwrap_or_default();

    let mut values = Mapping::new();
    for input in def.inputs() {
        let value = best
            .iter()
            .find(|(name, _)| name.eq_ignore_ascii_case(&input.name))
            .map(|(_, raw)| ParamValue::infer(raw))
            .unwrap_or(input.default);
        values.insert(Value::from(input.name), serde_yaml::to_value(value)?);
    }

    let mut doc = Mapping::new();
    doc.insert(Value::from(def.name.as_str()), Value::Mapping(values));
    persistence::write_yaml(&selection_path, &Value::Mapping(doc))?;

    info!(
        stage = %stage.name,
        candidate = %candidate,
        path = %selection_path.display(),
        "Wrote stage selection"
    );
    Ok(selection_path)
}
