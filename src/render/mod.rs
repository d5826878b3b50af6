//! Expert source generation
//!
//! Each stage renders one expert per indicator definition from a text
//! template with `{{ key }}` placeholders. Context keys are namespaced by the
//! renderer's prefix (`trigger_input_lines`, `conf_buffers`, ...), and every
//! upstream stage the stage depends on is injected under its own prefix with
//! its selected parameter values fixed.

use serde::{Deserialize, Serialize};
use serde_yaml::Value;
use std::collections::BTreeMap;
use std::fmt::Write as FmtWrite;
use std::fs;
use std::path::PathBuf;
use tracing::{debug, info, warn};

use crate::config::{AppConfig, ResolvedPaths};
use crate::error::PipelineError;
use crate::indicators::{list_definitions, IndicatorDefinition};
use crate::persistence;
use crate::stage::{StageConfig, StageLayout};
use crate::terminal::TesterTerminal;
use crate::types::{IndicatorParameter, ParamType, ParamValue};
use crate::upstream;

/// Renderer of a stage, one per component of the trend-following expert
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RendererKind {
    Trigger,
    Conformation,
    Volume,
    Exit,
    Trendline,
}

impl RendererKind {
    /// Namespace of this component's template context keys
    pub fn prefix(&self) -> &'static str {
        match self {
            RendererKind::Trigger => "trigger",
            RendererKind::Conformation => "conf",
            RendererKind::Volume => "volume",
            RendererKind::Exit => "exit",
            RendererKind::Trendline => "tl",
        }
    }

    /// Metadata key holding the `long`/`short` entry conditions
    pub fn conditions_key(&self) -> &'static str {
        match self {
            RendererKind::Trigger => "trigger_conditions",
            RendererKind::Conformation => "conf_conditions",
            RendererKind::Volume => "volume_conditions",
            RendererKind::Exit => "exit_conditions",
            RendererKind::Trendline => "trendline_conditions",
        }
    }
}

/// Flat key -> text context for a template
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TemplateContext {
    values: BTreeMap<String, String>,
}

impl TemplateContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.values.insert(key.into(), value.into());
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.values.get(key).map(String::as_str)
    }

    /// Add one indicator under `kind`'s prefix. Only the candidate being
    /// optimised declares its inputs; upstream components get fixed values.
    pub fn add_indicator(
        &mut self,
        kind: RendererKind,
        def: &IndicatorDefinition,
        declare_inputs: bool,
    ) {
        let p = kind.prefix();

        self.insert(format!("{}_indicator_name", p), def.name.as_str());
        if declare_inputs {
            self.insert(format!("{}_input_lines", p), input_lines(&def.inputs()));
        }
        self.insert(
            format!("{}_logic_inputs_vars", p),
            join(def.logic_inputs.iter().map(|i| i.name.clone())),
        );
        self.insert(
            format!("{}_logic_inputs_defaults", p),
            join(def.logic_inputs.iter().map(|i| mql_literal(&i.default, &i.value_type()))),
        );
        self.insert(
            format!("{}_custom", p),
            def.extra_str("custom").unwrap_or_else(|| "false".to_string()),
        );
        self.insert(format!("{}_function", p), def.extra_str("function").unwrap_or_default());
        self.insert(
            format!("{}_path", p),
            def.extra_str("indicator_path").unwrap_or_default(),
        );
        self.insert(
            format!("{}_inputs", p),
            join(def.indicator_inputs.iter().map(|i| i.name.clone())),
        );
        self.insert(
            format!("{}_inputs_values", p),
            join(def.indicator_inputs.iter().map(|i| mql_literal(&i.default, &i.value_type()))),
        );
        self.insert(
            format!("{}_buffers", p),
            join(sequence_items(def.extra.get("buffers"))),
        );

        let conditions = def.extra.get(kind.conditions_key());
        for side in ["long", "short"] {
            let text = conditions
                .and_then(|c| c.get(side))
                .map(value_text)
                .unwrap_or_default();
            self.insert(format!("{}_{}_conditions", p, side), text);
        }
    }

    /// Substitute every `{{ key }}` placeholder. Unknown keys render empty.
    pub fn render(&self, template: &str) -> String {
        let mut out = String::with_capacity(template.len());
        let mut rest = template;
        while let Some(start) = rest.find("{{") {
            out.push_str(&rest[..start]);
            let after = &rest[start + 2..];
            match after.find("}}") {
                Some(end) => {
                    let key = after[..end].trim();
                    match self.values.get(key) {
                        Some(value) => out.push_str(value),
                        None => warn!(key = %key, "Template placeholder has no value"),
                    }
                    rest = &after[end + 2..];
                }
                None => {
                    out.push_str(&rest[start..]);
                    rest = "";
                }
            }
        }
        out.push_str(rest);
        out
    }
}

/// `input <type> <name> = <default>;` for each input
pub fn input_lines(inputs: &[IndicatorParameter]) -> String {
    let mut out = String::new();
    for input in inputs {
        let ty = input.value_type();
        let _ = writeln!(
            out,
            "input {} {} = {};",
            ty.mql_type(),
            input.name,
            mql_literal(&input.default, &ty)
        );
    }
    out
}

/// Literal for a value in generated source; strings are quoted
fn mql_literal(value: &ParamValue, ty: &ParamType) -> String {
    match (value, ty) {
        (ParamValue::Text(s), ParamType::Named(name)) if name == "string" => format!("\"{}\"", s),
        (ParamValue::Int(v), ParamType::Float) => format!("{}.0", v),
        _ => value.to_string(),
    }
}

/// MQL5 enum blocks from the `enums` sections, first declaration wins
pub fn enum_definitions<'a>(defs: impl IntoIterator<Item = &'a IndicatorDefinition>) -> String {
    let mut seen = Vec::<String>::new();
    let mut out = String::new();
    for def in defs {
        let Some(Value::Mapping(enums)) = def.extra.get("enums") else {
            continue;
        };
        for (name, values) in enums {
            let Some(name) = name.as_str() else { continue };
            if seen.iter().any(|s| s == name) {
                continue;
            }
            seen.push(name.to_string());
            let _ = writeln!(out, "enum {} {{", name);
            for v in sequence_items(Some(values)) {
                let _ = writeln!(out, "    {},", v);
            }
            let _ = writeln!(out, "}};");
        }
    }
    out
}

/// `"EURUSD","GBPUSD"`; the chart symbol expression stays unquoted
pub fn symbols_array(symbols: &[String]) -> String {
    join(symbols.iter().map(|s| {
        if s.ends_with("()") {
            s.clone()
        } else {
            format!("\"{}\"", s)
        }
    }))
}

fn join(items: impl IntoIterator<Item = String>) -> String {
    items.into_iter().collect::<Vec<_>>().join(", ")
}

fn sequence_items(value: Option<&Value>) -> Vec<String> {
    match value {
        Some(Value::Sequence(items)) => items.iter().map(value_text).collect(),
        Some(other) => vec![value_text(other)],
        None => Vec::new(),
    }
}

fn value_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Bool(b) => b.to_string(),
        Value::Number(n) => n.to_string(),
        Value::Null => String::new(),
        other => serde_yaml::to_string(other)
            .map(|s| s.trim_end().to_string())
            .unwrap_or_default(),
    }
}

/// Outcome of generating a stage's experts
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct GenerationReport {
    pub generated: Vec<String>,
    pub compiled: Vec<String>,
    /// Candidate and reason
    pub skipped: Vec<(String, String)>,
}

/// Renders and compiles one expert per indicator definition of a stage
pub struct ExpertGenerator<'a> {
    config: &'a AppConfig,
    paths: &'a ResolvedPaths,
}

impl<'a> ExpertGenerator<'a> {
    pub fn new(config: &'a AppConfig, paths: &'a ResolvedPaths) -> Self {
        Self { config, paths }
    }

    /// Shared context of every expert in the stage: symbols, run info and
    /// the fixed upstream components
    pub fn base_context(
        &self,
        stage: &StageConfig,
    ) -> Result<(TemplateContext, Vec<IndicatorDefinition>), PipelineError> {
        let mut ctx = TemplateContext::new();
        let symbols = self.config.whitelist()?;
        ctx.insert("symbols_array", symbols_array(&symbols));
        ctx.insert("whitelist", symbols_array(&symbols));
        ctx.insert("symbols_count", symbols.len().to_string());
        ctx.insert("run_name", self.config.project.run_name.as_str());
        ctx.insert("stage_name", stage.name.as_str());

        let mut upstream_defs = Vec::with_capacity(stage.depends_on.len());
        for name in &stage.depends_on {
            let upstream_stage = self.config.stage(name)?;
            let (candidate, def) =
                upstream::load(self.paths, &self.config.project.run_name, upstream_stage)?;
            debug!(
                stage = %stage.name,
                upstream = %upstream_stage.name,
                candidate = %candidate,
                "Injected upstream selection"
            );
            ctx.insert(format!("{}_name", upstream_stage.renderer.prefix()), candidate);
            ctx.add_indicator(upstream_stage.renderer, &def, false);
            upstream_defs.push(def);
        }
        Ok((ctx, upstream_defs))
    }

    pub fn render_candidate(
        &self,
        stage: &StageConfig,
        base: &TemplateContext,
        upstream_defs: &[IndicatorDefinition],
        template: &str,
        def: &IndicatorDefinition,
    ) -> String {
        let mut ctx = base.clone();
        ctx.add_indicator(stage.renderer, def, true);
        ctx.insert(
            "enum_definitions",
            enum_definitions(upstream_defs.iter().chain(std::iter::once(def))),
        );
        ctx.render(template)
    }

    /// Write `experts/<candidate>.mq5` for every definition and compile it.
    /// Upstream failures abort; a bad definition only skips that candidate.
    pub fn generate<T: TesterTerminal>(
        &self,
        stage: &StageConfig,
        layout: &StageLayout,
        terminal: &T,
    ) -> Result<GenerationReport, PipelineError> {
        let template_path = self.paths.template_dir.join(&stage.template);
        let template =
            fs::read_to_string(&template_path).map_err(|e| PipelineError::MissingMetadata {
                candidate: stage.name.clone(),
                path: template_path.clone(),
                reason: format!("template unreadable: {}", e),
            })?;

        let (base, upstream_defs) = self.base_context(stage)?;
        let indicator_dir = self.paths.stage_indicator_dir(&stage.indicator_dir);
        let files = list_definitions(&indicator_dir)?;
        if files.is_empty() {
            warn!(dir = %indicator_dir.display(), "No indicator definitions found");
        }

        let mut report = GenerationReport::default();
        for file in files {
            let candidate = candidate_name(&file);
            let def = match IndicatorDefinition::load(&file, &candidate) {
                Ok(def) => def,
                Err(e) => {
                    warn!(candidate = %candidate, error = %e, "Skipping indicator");
                    report.skipped.push((candidate, e.to_string()));
                    continue;
                }
            };

            let source = self.render_candidate(stage, &base, &upstream_defs, &template, &def);
            let mq5 = source_path(layout, &candidate);
            persistence::write_text(&mq5, &source)?;
            report.generated.push(candidate.clone());

            match terminal.compile(&mq5) {
                Ok(true) => report.compiled.push(candidate),
                Ok(false) => warn!(candidate = %candidate, "Expert did not compile"),
                Err(e) => warn!(candidate = %candidate, error = %e, "Compiler failed"),
            }
        }

        info!(
            stage = %stage.name,
            generated = report.generated.len(),
            compiled = report.compiled.len(),
            skipped = report.skipped.len(),
            "Generated experts"
        );
        Ok(report)
    }
}

/// Candidate identifier: the definition's file stem
pub fn candidate_name(path: &std::path::Path) -> String {
    path.file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default()
}

/// Path of a candidate's generated source
pub fn source_path(layout: &StageLayout, candidate: &str) -> PathBuf {
    layout.experts.join(format!("{}.mq5", candidate))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;

    const RSI: &str = r#"
RSI:
  indicator_path: "Indicators\\RSI.ex5"
  custom: true
  indicator_inputs:
    period: {default: 14, min: 2, max: 50, step: 1, type: int}
    price: {default: PRICE_CLOSE, optimise: false, type: ENUM_APPLIED_PRICE}
  logic_inputs:
    level: {default: 30.0, min: 10.0, max: 40.0, step: 5.0}
  buffers: [0]
  trigger_conditions:
    long: "rsi[1] < level && rsi[0] > level"
    short: "rsi[1] > 100 - level && rsi[0] < 100 - level"
  enums:
    ENUM_CROSS_MODE: [CROSS_UP, CROSS_DOWN]
"#;

    fn rsi() -> IndicatorDefinition {
        IndicatorDefinition::parse(RSI, Path::new("RSI.yaml"), "RSI").unwrap()
    }

    #[test]
    fn test_renderer_prefixes() {
        assert_eq!(RendererKind::Conformation.prefix(), "conf");
        assert_eq!(RendererKind::Trendline.prefix(), "tl");
        assert_eq!(RendererKind::Volume.conditions_key(), "volume_conditions");
        let kind: RendererKind = serde_yaml::from_str("exit").unwrap();
        assert_eq!(kind, RendererKind::Exit);
    }

    #[test]
    fn test_indicator_context() {
        let mut ctx = TemplateContext::new();
        ctx.add_indicator(RendererKind::Trigger, &rsi(), true);

        let lines = ctx.get("trigger_input_lines").unwrap();
        assert!(lines.contains("input int period = 14;"));
        assert!(lines.contains("input ENUM_APPLIED_PRICE price = PRICE_CLOSE;"));
        assert!(lines.contains("input double level = 30.0;"));
        assert_eq!(ctx.get("trigger_inputs"), Some("period, price"));
        assert_eq!(ctx.get("trigger_custom"), Some("true"));
        assert_eq!(ctx.get("trigger_buffers"), Some("0"));
        assert_eq!(
            ctx.get("trigger_long_conditions"),
            Some("rsi[1] < level && rsi[0] > level")
        );
    }

    #[test]
    fn test_upstream_context_has_no_input_declarations() {
        let mut ctx = TemplateContext::new();
        ctx.add_indicator(RendererKind::Trigger, &rsi(), false);
        assert!(ctx.get("trigger_input_lines").is_none());
        assert_eq!(ctx.get("trigger_inputs_values"), Some("14, PRICE_CLOSE"));
    }

    #[test]
    fn test_render_placeholders() {
        let mut ctx = TemplateContext::new();
        ctx.insert("name", "ADX");
        let out = ctx.render("// {{ name }} / {{name}} / {{ missing }} / {{ open");
        assert_eq!(out, "// ADX / ADX /  / {{ open");
    }

    #[test]
    fn test_enum_definitions_and_symbols() {
        let enums = enum_definitions([&rsi(), &rsi()]);
        assert_eq!(enums.matches("enum ENUM_CROSS_MODE").count(), 1);
        assert!(enums.contains("    CROSS_UP,"));

        let symbols = vec!["EURUSD".to_string(), "Symbol()".to_string()];
        assert_eq!(symbols_array(&symbols), "\"EURUSD\", Symbol()");
    }
}
