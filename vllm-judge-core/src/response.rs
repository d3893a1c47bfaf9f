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

//! Turns free-text judge output into an [`EvaluationResult`]
//!
//! Extraction runs an ordered cascade and stops at the first stage that
//! yields a JSON object:
//!
//! 1. [`ParseStrategy::DirectJson`]: the whole trimmed text
//! 2. [`ParseStrategy::FencedBlock`]: the interior of a ```` ``` ```` block
//! 3. [`ParseStrategy::BraceScan`]: the first flat `{...}` containing `"decision"`
//!
//! The object is then normalized: synonym keys are adopted for missing
//! fields, reasoning is stringified, and score is coerced to a float or
//! dropped. A missing decision is the only fatal normalization failure.

use crate::error::{JudgeError, Result};
use crate::models::{Decision, EvaluationResult};
use regex::Regex;
use serde_json::{Map, Value};
use std::fmt;
use std::sync::LazyLock;
use tracing::{debug, warn};

/// Fallback keys for `decision`, in priority order
pub const DECISION_ALTERNATIVES: &[&str] =
    &["label", "judgment", "result", "output", "prediction", "response"];

/// Fallback keys for `reasoning`, in priority order
pub const REASONING_ALTERNATIVES: &[&str] = &[
    "reason",
    "explanation",
    "justification",
    "rationale",
    "thought",
    "thinking",
];

/// Fallback keys for `score`, in priority order
pub const SCORE_ALTERNATIVES: &[&str] = &[
    "confidence",
    "probability",
    "prob",
    "grade",
    "rating",
    "score_value",
    "value",
];

/// Reasoning used when the model supplied none
pub const NO_REASONING: &str = "=== No reasoning provided ===";

/// Metadata keys owned by the parser
const RESERVED_METADATA: &[&str] = &["model", "raw_response"];

static FENCED_BLOCK: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r"(?s)```(?:json)?\s*(\{.*?\})\s*```").ok());
static DECISION_OBJECT: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r#"(\{[^{}]*"decision"[^{}]*\})"#).ok());

/// Stage of the extraction cascade that produced the JSON object
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParseStrategy {
    DirectJson,
    FencedBlock,
    BraceScan,
}

impl ParseStrategy {
    pub const CASCADE: [ParseStrategy; 3] = [
        ParseStrategy::DirectJson,
        ParseStrategy::FencedBlock,
        ParseStrategy::BraceScan,
    ];

    /// Run this stage alone
    pub fn try_extract(&self, raw: &str) -> Option<Map<String, Value>> {
        let candidate = match self {
            ParseStrategy::DirectJson => Some(raw.trim()),
            ParseStrategy::FencedBlock => FENCED_BLOCK
                .as_ref()
                .and_then(|re| re.captures(raw))
                .and_then(|caps| caps.get(1))
                .map(|m| m.as_str()),
            ParseStrategy::BraceScan => DECISION_OBJECT
                .as_ref()
                .and_then(|re| re.find(raw))
                .map(|m| m.as_str()),
        }?;

        match serde_json::from_str::<Value>(candidate) {
            Ok(Value::Object(map)) => Some(map),
            Ok(other) => {
                debug!("{} produced non-object JSON: {}", self, json_kind(&other));
                None
            }
            Err(e) => {
                debug!("{} parsing failed: {}", self, e);
                None
            }
        }
    }
}

impl fmt::Display for ParseStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ParseStrategy::DirectJson => "direct JSON",
            ParseStrategy::FencedBlock => "fenced JSON block",
            ParseStrategy::BraceScan => "brace scan",
        })
    }
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// Run the cascade, returning the object and the stage that produced it
pub fn extract_json(raw: &str) -> Option<(Map<String, Value>, ParseStrategy)> {
    ParseStrategy::CASCADE.iter().find_map(|strategy| {
        strategy.try_extract(raw).map(|data| {
            debug!("Successfully parsed using {}", strategy);
            (data, *strategy)
        })
    })
}

/// Parse raw judge output; `model` is recorded in metadata
pub fn parse_response(raw: &str, model: &str) -> Result<EvaluationResult> {
    parse_response_traced(raw, model).map(|(result, _)| result)
}

/// Like [`parse_response`], also reporting which cascade stage succeeded
pub fn parse_response_traced(raw: &str, model: &str) -> Result<(EvaluationResult, ParseStrategy)> {
    debug!(
        "Parsing response: {}...",
        raw.chars().take(100).collect::<String>()
    );

    let (data, strategy) = extract_json(raw).ok_or_else(|| {
        JudgeError::parse(
            "Unable to extract valid JSON from response using any parsing strategy",
            raw,
        )
    })?;

    normalize(data, raw, model).map(|result| (result, strategy))
}

/// First present key among `canonical` then `alternatives`
fn take_field(
    data: &mut Map<String, Value>,
    canonical: &str,
    alternatives: &[&str],
) -> Option<Value> {
    if let Some(value) = data.remove(canonical) {
        return Some(value);
    }
    alternatives.iter().find_map(|alt| {
        let value = data.get(*alt).cloned()?;
        debug!("Used '{}' field for {}", alt, canonical);
        Some(value)
    })
}

fn coerce_score(value: Value) -> Option<f64> {
    let score = match &value {
        Value::Null => return None,
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    };

    match score {
        Some(s) if s.is_finite() => Some(s),
        _ => {
            warn!("Invalid score value: {}, setting to None", value);
            None
        }
    }
}

/// Apply synonym fallbacks and type coercion to an extracted object
pub fn normalize(
    mut data: Map<String, Value>,
    raw: &str,
    model: &str,
) -> Result<EvaluationResult> {
    let decision = match take_field(&mut data, "decision", DECISION_ALTERNATIVES) {
        Some(Value::Null) => {
            return Err(JudgeError::parse("Response 'decision' field is null", raw));
        }
        Some(value) => Decision::from(value),
        None => {
            return Err(JudgeError::parse(
                "Response missing required 'decision' field",
                raw,
            ));
        }
    };
    if !decision.is_expected_type() {
        warn!("Decision field has unexpected type: {}", decision);
    }

    let reasoning = match take_field(&mut data, "reasoning", REASONING_ALTERNATIVES) {
        Some(Value::String(s)) => s,
        Some(Value::Null) | None => {
            warn!("No reasoning field found, using default");
            NO_REASONING.to_string()
        }
        Some(other) => {
            debug!("Converted reasoning to string");
            other.to_string()
        }
    };

    let score = match take_field(&mut data, "score", SCORE_ALTERNATIVES) {
        Some(value) => coerce_score(value),
        None => {
            warn!("No score field found, setting to None");
            None
        }
    };

    let mut metadata = Map::new();
    metadata.insert("model".to_string(), Value::String(model.to_string()));
    metadata.insert("raw_response".to_string(), Value::String(raw.to_string()));
    if let Some(Value::Object(extra)) = data.remove("metadata") {
        for (key, value) in extra {
            if RESERVED_METADATA.contains(&key.as_str()) {
                debug!("Ignoring model-provided metadata key '{}'", key);
                continue;
            }
            metadata.insert(key, value);
        }
    }

    Ok(EvaluationResult {
        decision,
        reasoning,
        score,
        metadata,
    })
}
