// Copyright 2025 AgentReplay (https://github.com/agentreplay)
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU Affero General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
// GNU Affero General Public License for more details.
//
// You should have received a copy of the GNU Affero General Public License
// along with this program. If not, see <https://www.gnu.org/licenses/>.

//! Placeholder substitution for metric criteria, rubrics and prompts
//!
//! Two engines are supported:
//!
//! - [`TemplateEngine::Format`]: `{name}` placeholders with `{{`/`}}` escapes.
//!   Dotted (`{user.name}`) and indexed (`{items[0]}`) fields resolve against
//!   the top-level variable.
//! - [`TemplateEngine::Jinja2`]: full control-flow templates rendered with
//!   minijinja (`{% if audience == "clinical" %}...{% endif %}`).
//!
//! In strict mode every referenced top-level name must be supplied, otherwise
//! nothing is rendered and an input error lists the missing names.

use crate::error::{JudgeError, Result};
use crate::models::Rubric;
use minijinja::{Environment, ErrorKind, UndefinedBehavior};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeSet;
use std::fmt;

/// Variables available to a template
pub type TemplateVars = Map<String, Value>;

/// Placeholder syntax used by a template
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TemplateEngine {
    #[default]
    Format,
    #[serde(alias = "jinja")]
    Jinja2,
}

impl TemplateEngine {
    pub fn as_str(&self) -> &'static str {
        match self {
            TemplateEngine::Format => "format",
            TemplateEngine::Jinja2 => "jinja2",
        }
    }
}

impl fmt::Display for TemplateEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for TemplateEngine {
    type Err = JudgeError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "format" => Ok(TemplateEngine::Format),
            "jinja2" | "jinja" => Ok(TemplateEngine::Jinja2),
            other => Err(JudgeError::InvalidInput(format!(
                "Unknown template engine '{}'. Expected 'format' or 'jinja2'",
                other
            ))),
        }
    }
}

/// A value that may embed placeholders
pub trait Templated: Sized {
    fn apply(&self, vars: &TemplateVars, engine: TemplateEngine, strict: bool) -> Result<Self>;

    fn required_vars(&self, engine: TemplateEngine) -> BTreeSet<String>;
}

impl Templated for String {
    fn apply(&self, vars: &TemplateVars, engine: TemplateEngine, strict: bool) -> Result<Self> {
        apply_str(self, vars, engine, strict)
    }

    fn required_vars(&self, engine: TemplateEngine) -> BTreeSet<String> {
        match engine {
            TemplateEngine::Format => format_required_vars(self),
            TemplateEngine::Jinja2 => jinja_required_vars(self),
        }
    }
}

/// Level keys are preserved; only descriptions are rendered
impl Templated for Rubric {
    fn apply(&self, vars: &TemplateVars, engine: TemplateEngine, strict: bool) -> Result<Self> {
        match self {
            Rubric::Text(text) => Ok(Rubric::Text(text.apply(vars, engine, strict)?)),
            Rubric::Levels(levels) => levels
                .iter()
                .map(|(level, desc)| Ok((*level, desc.apply(vars, engine, strict)?)))
                .collect::<Result<Vec<_>>>()
                .map(Rubric::Levels),
        }
    }

    fn required_vars(&self, engine: TemplateEngine) -> BTreeSet<String> {
        match self {
            Rubric::Text(text) => text.required_vars(engine),
            Rubric::Levels(levels) => levels
                .iter()
                .flat_map(|(_, desc)| desc.required_vars(engine))
                .collect(),
        }
    }
}

impl<T: Templated> Templated for Option<T> {
    fn apply(&self, vars: &TemplateVars, engine: TemplateEngine, strict: bool) -> Result<Self> {
        self.as_ref()
            .map(|inner| inner.apply(vars, engine, strict))
            .transpose()
    }

    fn required_vars(&self, engine: TemplateEngine) -> BTreeSet<String> {
        self.as_ref()
            .map(|inner| inner.required_vars(engine))
            .unwrap_or_default()
    }
}

/// Resolve placeholders in `template`
pub fn apply<T: Templated>(
    template: &T,
    vars: &TemplateVars,
    engine: TemplateEngine,
    strict: bool,
) -> Result<T> {
    template.apply(vars, engine, strict)
}

/// Statically list the top-level names a template references
///
/// Unparseable templates yield an empty set.
pub fn get_required_vars<T: Templated>(template: &T, engine: TemplateEngine) -> BTreeSet<String> {
    template.required_vars(engine)
}

/// Merge defaults with provided variables (provided wins) and check `required`
pub fn validate_template_vars(
    provided: &TemplateVars,
    required: &[String],
    defaults: &TemplateVars,
) -> Result<TemplateVars> {
    let mut merged = defaults.clone();
    for (k, v) in provided {
        merged.insert(k.clone(), v.clone());
    }

    let missing: BTreeSet<&str> = required
        .iter()
        .filter(|name| !merged.contains_key(name.as_str()))
        .map(String::as_str)
        .collect();
    if !missing.is_empty() {
        return Err(missing_vars_error(missing));
    }

    Ok(merged)
}

fn missing_vars_error<'a>(missing: impl IntoIterator<Item = &'a str>) -> JudgeError {
    let names: Vec<&str> = missing.into_iter().collect();
    JudgeError::InvalidInput(format!(
        "Missing required template variables: {}",
        names.join(", ")
    ))
}

/// Render a single template string
pub fn apply_str(
    template: &str,
    vars: &TemplateVars,
    engine: TemplateEngine,
    strict: bool,
) -> Result<String> {
    match engine {
        TemplateEngine::Format => render_format(template, vars, strict),
        TemplateEngine::Jinja2 => render_jinja(template, vars, strict),
    }
}

// ---------------------------------------------------------------------------
// Format engine
// ---------------------------------------------------------------------------

#[derive(Debug, PartialEq)]
enum Segment<'a> {
    Literal(String),
    /// `raw` is the placeholder including braces, `inner` excludes them
    Field { raw: &'a str, inner: &'a str },
}

fn parse_format(template: &str) -> std::result::Result<Vec<Segment<'_>>, String> {
    let bytes = template.as_bytes();
    let mut segments = Vec::new();
    let mut literal = String::new();
    let mut lit_start = 0;
    let mut i = 0;

    while i < bytes.len() {
        match bytes[i] {
            b'{' if bytes.get(i + 1) == Some(&b'{') => {
                literal.push_str(&template[lit_start..i]);
                literal.push('{');
                i += 2;
                lit_start = i;
            }
            b'{' => {
                literal.push_str(&template[lit_start..i]);
                let start = i;
                let mut depth = 0usize;
                let mut end = None;
                for (j, b) in bytes.iter().enumerate().skip(i) {
                    match b {
                        b'{' => depth += 1,
                        b'}' => {
                            depth -= 1;
                            if depth == 0 {
                                end = Some(j);
                                break;
                            }
                        }
                        _ => {}
                    }
                }
                let end = end.ok_or_else(|| "unmatched '{' in format string".to_string())?;
                if !literal.is_empty() {
                    segments.push(Segment::Literal(std::mem::take(&mut literal)));
                }
                segments.push(Segment::Field {
                    raw: &template[start..=end],
                    inner: &template[start + 1..end],
                });
                i = end + 1;
                lit_start = i;
            }
            b'}' if bytes.get(i + 1) == Some(&b'}') => {
                literal.push_str(&template[lit_start..i]);
                literal.push('}');
                i += 2;
                lit_start = i;
            }
            b'}' => return Err("single '}' encountered in format string".to_string()),
            _ => i += 1,
        }
    }

    literal.push_str(&template[lit_start..]);
    if !literal.is_empty() {
        segments.push(Segment::Literal(literal));
    }
    Ok(segments)
}

/// Split `name.attr[0]!r:>10` into (`name.attr[0]`, `>10`)
fn split_field(inner: &str) -> (&str, &str) {
    let expr_end = inner.find(['!', ':']).unwrap_or(inner.len());
    let expr = &inner[..expr_end];
    let spec = match inner[expr_end..].find(':') {
        Some(pos) => &inner[expr_end + pos + 1..],
        None => "",
    };
    (expr, spec)
}

fn base_name(expr: &str) -> &str {
    let before_dot = expr.split('.').next().unwrap_or(expr);
    before_dot.split('[').next().unwrap_or(before_dot)
}

fn format_required_vars(template: &str) -> BTreeSet<String> {
    match parse_format(template) {
        Ok(segments) => segments
            .iter()
            .filter_map(|seg| match seg {
                Segment::Field { inner, .. } => {
                    let (expr, _) = split_field(inner);
                    let name = base_name(expr);
                    (!name.is_empty()).then(|| name.to_string())
                }
                Segment::Literal(_) => None,
            })
            .collect(),
        Err(e) => {
            tracing::debug!("Could not scan format template for variables: {}", e);
            BTreeSet::new()
        }
    }
}

/// Walk `.attr` / `[key]` accessors after the base name
fn resolve_field<'v>(expr: &str, vars: &'v TemplateVars) -> Option<&'v Value> {
    let base = base_name(expr);
    let mut current = vars.get(base)?;
    let mut rest = &expr[base.len()..];

    while !rest.is_empty() {
        if let Some(after_dot) = rest.strip_prefix('.') {
            let end = after_dot.find(['.', '[']).unwrap_or(after_dot.len());
            current = current.get(&after_dot[..end])?;
            rest = &after_dot[end..];
        } else if let Some(after_bracket) = rest.strip_prefix('[') {
            let close = after_bracket.find(']')?;
            let key = &after_bracket[..close];
            current = match key.parse::<usize>() {
                Ok(idx) if current.is_array() => current.get(idx)?,
                _ => current.get(key)?,
            };
            rest = &after_bracket[close + 1..];
        } else {
            return None;
        }
    }

    Some(current)
}

fn render_value(value: &Value, spec: &str) -> String {
    if let (Some(precision), Some(n)) = (
        spec.strip_prefix('.')
            .and_then(|s| s.strip_suffix('f'))
            .and_then(|p| p.parse::<usize>().ok()),
        value.as_f64(),
    ) {
        return format!("{:.*}", precision, n);
    }

    match value {
        Value::String(s) => s.clone(),
        Value::Null => "None".to_string(),
        other => other.to_string(),
    }
}

fn render_format(template: &str, vars: &TemplateVars, strict: bool) -> Result<String> {
    let segments = parse_format(template)
        .map_err(|e| JudgeError::InvalidInput(format!("Invalid format template: {}", e)))?;

    if strict {
        let missing: BTreeSet<String> = format_required_vars(template)
            .into_iter()
            .filter(|name| !vars.contains_key(name))
            .collect();
        if !missing.is_empty() {
            return Err(missing_vars_error(missing.iter().map(String::as_str)));
        }
    }

    let mut out = String::with_capacity(template.len());
    for segment in &segments {
        match segment {
            Segment::Literal(text) => out.push_str(text),
            Segment::Field { raw, inner } => {
                let (expr, spec) = split_field(inner);
                if expr.is_empty() || expr.chars().all(|c| c.is_ascii_digit()) {
                    return Err(JudgeError::InvalidInput(format!(
                        "Positional placeholder '{}' is not supported; use named variables",
                        raw
                    )));
                }
                match resolve_field(expr, vars) {
                    Some(value) => out.push_str(&render_value(value, spec)),
                    None if strict => {
                        return Err(JudgeError::InvalidInput(format!(
                            "Missing template variable: '{}'",
                            expr
                        )))
                    }
                    None => out.push_str(raw),
                }
            }
        }
    }

    Ok(out)
}

// ---------------------------------------------------------------------------
// Jinja engine
// ---------------------------------------------------------------------------

fn jinja_required_vars(template: &str) -> BTreeSet<String> {
    let env = Environment::new();
    match env.template_from_str(template) {
        Ok(tmpl) => {
            // builtin functions such as `range` are never caller supplied
            let globals: BTreeSet<&str> = env.globals().map(|(name, _)| name).collect();
            tmpl.undeclared_variables(false)
                .into_iter()
                .filter(|name| !globals.contains(name.as_str()))
                .collect()
        }
        Err(e) => {
            tracing::debug!("Could not scan jinja template for variables: {}", e);
            BTreeSet::new()
        }
    }
}

fn render_jinja(template: &str, vars: &TemplateVars, strict: bool) -> Result<String> {
    let mut env = Environment::new();
    env.set_undefined_behavior(if strict {
        UndefinedBehavior::Strict
    } else {
        UndefinedBehavior::Lenient
    });

    env.render_str(template, vars).map_err(|e| match e.kind() {
        ErrorKind::UndefinedError => JudgeError::InvalidInput(format!(
            "Missing template variable in Jinja2 template: {}",
            e
        )),
        _ => JudgeError::InvalidInput(format!("Invalid Jinja2 template: {}", e)),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn vars(value: Value) -> TemplateVars {
        match value {
            Value::Object(map) => map,
            _ => panic!("expected object"),
        }
    }

    #[test]
    fn test_strict_failure_names_missing_variables() {
        let err = apply_str(
            "Evaluate {topic} for {audience}",
            &vars(json!({"topic": "math"})),
            TemplateEngine::Format,
            true,
        )
        .unwrap_err();
        match err {
            JudgeError::InvalidInput(msg) => {
                assert_eq!(msg, "Missing required template variables: audience")
            }
            other => panic!("unexpected error {:?}", other),
        }
    }

    #[test]
    fn test_missing_variables_sorted_and_joined() {
        let err = apply_str("{zeta} {alpha}", &TemplateVars::new(), TemplateEngine::Format, true)
            .unwrap_err();
        assert!(err.to_string().ends_with("alpha, zeta"));
    }

    #[test]
    fn test_lenient_passthrough() {
        let out = apply_str(
            "Evaluate {topic} for {audience}",
            &vars(json!({"topic": "math"})),
            TemplateEngine::Format,
            false,
        )
        .unwrap();
        assert_eq!(out, "Evaluate math for {audience}");
    }

    #[test]
    fn test_rubric_levels_keep_keys() {
        let rubric = Rubric::levels([(1.0, "Bad {x}"), (5.0, "Great {x}")]);
        let out = apply(&rubric, &vars(json!({"x": "code"})), TemplateEngine::Format, true).unwrap();
        assert_eq!(
            out,
            Rubric::Levels(vec![
                (1.0, "Bad code".to_string()),
                (5.0, "Great code".to_string())
            ])
        );
    }

    #[test]
    fn test_none_passes_through() {
        let template: Option<String> = None;
        let out = apply(&template, &TemplateVars::new(), TemplateEngine::Format, true).unwrap();
        assert_eq!(out, None);
    }

    #[test]
    fn test_escaped_braces() {
        let out = apply_str(
            "Return {{\"x\": {n}}}",
            &vars(json!({"n": 3})),
            TemplateEngine::Format,
            true,
        )
        .unwrap();
        assert_eq!(out, "Return {\"x\": 3}");
        assert!(get_required_vars(&"{{literal}}".to_string(), TemplateEngine::Format).is_empty());
    }

    #[test]
    fn test_required_vars_use_top_level_name() {
        let template = "Hi {user.name}, item {items[0]} in {domain}".to_string();
        let required = get_required_vars(&template, TemplateEngine::Format);
        let expected: BTreeSet<String> =
            ["domain", "items", "user"].iter().map(|s| s.to_string()).collect();
        assert_eq!(required, expected);
    }

    #[test]
    fn test_attribute_and_index_access() {
        let out = apply_str(
            "{user.name} likes {items[1]}",
            &vars(json!({"user": {"name": "Ada"}, "items": ["tea", "code"]})),
            TemplateEngine::Format,
            true,
        )
        .unwrap();
        assert_eq!(out, "Ada likes code");
    }

    #[test]
    fn test_malformed_template_scan_is_empty() {
        let template = "unbalanced {open".to_string();
        assert!(get_required_vars(&template, TemplateEngine::Format).is_empty());
        assert!(apply_str(&template, &TemplateVars::new(), TemplateEngine::Format, false).is_err());
    }

    #[test]
    fn test_jinja_conditional() {
        let template = "{% if audience == 'clinical' %}Use jargon{% else %}Avoid jargon{% endif %}";
        let out = apply_str(
            template,
            &vars(json!({"audience": "clinical"})),
            TemplateEngine::Jinja2,
            true,
        )
        .unwrap();
        assert_eq!(out, "Use jargon");
    }

    #[test]
    fn test_jinja_strict_and_lenient() {
        let template = "Hello {{ name }}!";
        let err = apply_str(template, &TemplateVars::new(), TemplateEngine::Jinja2, true).unwrap_err();
        assert!(err.to_string().contains("name"));

        let out = apply_str(template, &TemplateVars::new(), TemplateEngine::Jinja2, false).unwrap();
        assert_eq!(out, "Hello !");
    }

    #[test]
    fn test_jinja_strict_allows_globals_and_defaults() {
        let out = apply_str(
            "{% for i in range(n) %}x{% endfor %}",
            &vars(json!({"n": 2})),
            TemplateEngine::Jinja2,
            true,
        )
        .unwrap();
        assert_eq!(out, "xx");

        let out = apply_str(
            "{{ name | default('anonymous') }}",
            &TemplateVars::new(),
            TemplateEngine::Jinja2,
            true,
        )
        .unwrap();
        assert_eq!(out, "anonymous");

        let required =
            get_required_vars(&"{% for i in range(n) %}x{% endfor %}".to_string(), TemplateEngine::Jinja2);
        assert_eq!(required.into_iter().collect::<Vec<_>>(), vec!["n".to_string()]);
    }

    #[test]
    fn test_jinja_loop_variable_not_required() {
        let template = "{% for t in topics %}{{ t }} {% endfor %}".to_string();
        let required = get_required_vars(&template, TemplateEngine::Jinja2);
        assert!(required.contains("topics"));
        assert!(!required.contains("t"));
    }

    #[test]
    fn test_validate_template_vars() {
        let defaults = vars(json!({"tone": "formal", "lang": "en"}));
        let provided = vars(json!({"lang": "fr"}));
        let merged =
            validate_template_vars(&provided, &["lang".to_string()], &defaults).unwrap();
        assert_eq!(merged["lang"], json!("fr"));
        assert_eq!(merged["tone"], json!("formal"));

        let err = validate_template_vars(&provided, &["audience".to_string()], &defaults)
            .unwrap_err();
        assert!(err.to_string().contains("audience"));
    }

    #[test]
    fn test_engine_from_str() {
        assert_eq!("jinja2".parse::<TemplateEngine>().unwrap(), TemplateEngine::Jinja2);
        assert!("mustache".parse::<TemplateEngine>().is_err());
    }
}
