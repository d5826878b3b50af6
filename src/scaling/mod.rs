//! Parameter scaling
//!
//! Shrinks the optimisation grid of an indicator so the terminal never tries
//! more than a configured number of parameter combinations. Steps are only
//! ever inflated, never reduced, and parameters already within budget keep
//! their declared step.
//!
//! Parameters whose range holds a single value (min == max) cannot absorb any
//! reduction, so they are left out of the exponent of the scale factor.

use serde::Serialize;
use tracing::debug;

use crate::error::PipelineError;
use crate::types::{format_number, IndicatorParameter, ParamType, ParamValue};

/// Tolerance for float division in value counts (e.g. 0.9 / 0.1)
const COUNT_EPSILON: f64 = 1e-9;
/// Float steps are rounded to this granularity
const FLOAT_STEP_GRANULARITY: f64 = 1e6;

/// What the iteration budget caps
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ScalingMode {
    /// Product of all value counts
    #[default]
    Grid,
    /// Each parameter's own value count
    PerParameter,
}

/// A parameter with its effective optimisation step
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ScaledParameter {
    pub name: String,
    pub default: ParamValue,
    pub min: f64,
    pub max: f64,
    pub step: f64,
    /// Number of values the terminal will try
    pub count: u64,
    pub optimise: bool,
    #[serde(skip)]
    pub param_type: ParamType,
}

impl ScaledParameter {
    /// Values the terminal tries: `min`, `min + step`, ... up to `max`.
    /// `max` itself only appears when the step lands on it.
    pub fn grid_values(&self) -> Vec<f64> {
        if !self.optimise || self.step <= 0.0 || self.max <= self.min {
            return vec![self.min];
        }
        (0..self.count)
            .map(|i| self.min + i as f64 * self.step)
            .filter(|v| *v <= self.max + COUNT_EPSILON)
            .collect()
    }

    /// Render a range bound or step in the parameter's own type
    pub fn format_value(&self, v: f64) -> String {
        if self.param_type.is_integer() {
            format!("{}", v.round() as i64)
        } else {
            format_number(v)
        }
    }
}

/// Number of values in `[min, max]` stepping by `step`, at least 1
pub fn value_count(min: f64, max: f64, step: f64) -> u64 {
    if !(step > 0.0) || !(max > min) {
        return 1;
    }
    ((max - min) / step + COUNT_EPSILON).floor() as u64 + 1
}

/// Scale the optimisable parameters so their combined grid fits `budget`.
///
/// Non-optimisable parameters pass through with a count of 1. The output
/// keeps the input order.
pub fn scale(
    parameters: &[IndicatorParameter],
    budget: u64,
    mode: ScalingMode,
) -> Result<Vec<ScaledParameter>, PipelineError> {
    let budget = budget.max(1);
    let mut scaled = parameters
        .iter()
        .map(resolve)
        .collect::<Result<Vec<_>, _>>()?;

    let optimisable: Vec<usize> = scaled
        .iter()
        .enumerate()
        .filter(|(_, p)| p.optimise)
        .map(|(i, _)| i)
        .collect();
    if optimisable.is_empty() {
        return Ok(scaled);
    }

    let counts: Vec<u64> = optimisable.iter().map(|&i| scaled[i].count).collect();
    let targets = match mode {
        ScalingMode::Grid => grid_targets(&counts, budget),
        ScalingMode::PerParameter => counts.iter().map(|&c| c.min(budget)).collect(),
    };

    for (&idx, (&count, &target)) in optimisable.iter().zip(counts.iter().zip(targets.iter())) {
        if target >= count {
            continue;
        }
        let param = &mut scaled[idx];
        param.step = step_for_target(param, target);
        param.count = value_count(param.min, param.max, param.step);
        debug!(
            parameter = %param.name,
            from_count = count,
            to_count = param.count,
            step = param.step,
            "Scaled parameter step"
        );
    }

    Ok(scaled)
}

/// Resolve declared range/step, falling back to the default value
fn resolve(param: &IndicatorParameter) -> Result<ScaledParameter, PipelineError> {
    let invalid = |reason: &str| PipelineError::InvalidParameter {
        name: param.name.clone(),
        reason: reason.to_string(),
    };
    let default = param.default.as_f64();
    let param_type = param.value_type();

    if !param.optimise {
        let min = param.min.or(default).unwrap_or(0.0);
        return Ok(ScaledParameter {
            name: param.name.clone(),
            default: param.default.clone(),
            min,
            max: param.max.or(default).unwrap_or(min),
            step: param.step.unwrap_or(1.0),
            count: 1,
            optimise: false,
            param_type,
        });
    }

    let min = param
        .min
        .or(default)
        .ok_or_else(|| invalid("no min and a non-numeric default"))?;
    let max = param
        .max
        .or(default)
        .ok_or_else(|| invalid("no max and a non-numeric default"))?;
    let step = param.step.unwrap_or(1.0);

    if !min.is_finite() || !max.is_finite() {
        return Err(invalid("range bounds must be finite"));
    }
    if max < min {
        return Err(invalid("max is below min"));
    }
    if !(step > 0.0) || !step.is_finite() {
        return Err(invalid("step must be positive"));
    }

    Ok(ScaledParameter {
        name: param.name.clone(),
        default: param.default.clone(),
        min,
        max,
        step,
        count: value_count(min, max, step),
        optimise: true,
        param_type,
    })
}

/// Target value counts whose product fits the budget
fn grid_targets(counts: &[u64], budget: u64) -> Vec<u64> {
    let total = product(counts);
    if total <= budget as u128 {
        return counts.to_vec();
    }

    let reducible = counts.iter().filter(|&&c| c > 1).count();
    let scale_factor = (total as f64 / budget as f64).powf(1.0 / reducible as f64);

    let mut targets: Vec<u64> = counts
        .iter()
        .map(|&c| {
            if c > 1 {
                ((c as f64 / scale_factor).floor() as u64).clamp(1, c)
            } else {
                1
            }
        })
        .collect();

    // Targets clamped up to 1 can leave the product above budget; take
    // values from the widest remaining target until it fits.
    while product(&targets) > budget as u128 {
        let widest = targets
            .iter()
            .enumerate()
            .filter(|&(_, &t)| t > 1)
            .max_by_key(|&(_, &t)| t)
            .map(|(i, _)| i);
        match widest {
            Some(i) => targets[i] -= 1,
            None => break,
        }
    }

    // Flooring undershoots; hand single values back while the budget allows,
    // widest ranges first.
    let mut order: Vec<usize> = (0..counts.len()).collect();
    order.sort_by(|&a, &b| counts[b].cmp(&counts[a]));
    loop {
        let mut changed = false;
        for &i in &order {
            if targets[i] >= counts[i] {
                continue;
            }
            targets[i] += 1;
            if product(&targets) <= budget as u128 {
                changed = true;
            } else {
                targets[i] -= 1;
            }
        }
        if !changed {
            break;
        }
    }
    targets
}

fn product(counts: &[u64]) -> u128 {
    counts
        .iter()
        .fold(1u128, |acc, &c| acc.saturating_mul(c as u128))
}

/// Smallest step that yields at most `target` values
fn step_for_target(param: &ScaledParameter, target: u64) -> f64 {
    let span = param.max - param.min;
    let step = if param.param_type.is_integer() {
        // floor(span / s) + 1 <= target  <=>  s > span / target
        ((span / target as f64).floor() + 1.0).max(1.0)
    } else if target <= 1 {
        span + param.step
    } else {
        let raw = span / (target - 1) as f64;
        let mut step = ((raw * FLOAT_STEP_GRANULARITY).round() / FLOAT_STEP_GRANULARITY)
            .max(1.0 / FLOAT_STEP_GRANULARITY);
        while value_count(param.min, param.max, step) > target {
            step += 1.0 / FLOAT_STEP_GRANULARITY;
        }
        step
    };
    step.max(param.step)
}
