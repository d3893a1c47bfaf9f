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

//! Core data types: evaluated content, verdicts and batch aggregates

use crate::error::{JudgeError, Result};
use serde::de::{self, Deserializer};
use serde::ser::{SerializeMap, Serializer};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::fmt;

/// Numeric (min, max) score bounds
pub type Scale = (f64, f64);

/// A single chat turn
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub role: String,
    pub content: String,
}

impl Message {
    pub fn new(role: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            role: role.into(),
            content: content.into(),
        }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::new("system", content)
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new("user", content)
    }
}

/// What is being judged
///
/// Shape is decided once by [`Content::classify`]; everything downstream
/// matches on the variant.
#[derive(Debug, Clone, PartialEq)]
pub enum Content {
    /// Single response evaluation
    Text(String),
    /// Pairwise comparison of two responses
    Comparison { a: String, b: String },
    /// Multi-turn conversation
    Conversation(Vec<Message>),
}

const EMPTY_CONVERSATION: &str = "Conversation content cannot be an empty list.";
const INVALID_CONVERSATION: &str = "Invalid content structure for conversation. \
     Please provide a list of dicts with role and content fields.";

fn value_to_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

impl Content {
    /// Classify a loosely-typed JSON value into one of the three content shapes
    pub fn classify(value: &Value) -> Result<Self> {
        match value {
            Value::String(s) => Ok(Content::Text(s.clone())),
            Value::Object(map) => match (map.len(), map.get("a"), map.get("b")) {
                (2, Some(a), Some(b)) => Ok(Content::Comparison {
                    a: value_to_text(a),
                    b: value_to_text(b),
                }),
                _ => Err(JudgeError::InvalidInput(
                    "Content mapping must contain exactly the keys 'a' and 'b' for comparison"
                        .to_string(),
                )),
            },
            Value::Array(items) => {
                if items.is_empty() {
                    return Err(JudgeError::InvalidInput(EMPTY_CONVERSATION.to_string()));
                }
                let mut turns = Vec::with_capacity(items.len());
                for item in items {
                    let role = item.get("role").and_then(Value::as_str);
                    let content = item.get("content").and_then(Value::as_str);
                    match (role, content) {
                        (Some(role), Some(content)) => turns.push(Message::new(role, content)),
                        _ => return Err(JudgeError::InvalidInput(INVALID_CONVERSATION.to_string())),
                    }
                }
                Ok(Content::Conversation(turns))
            }
            _ => Err(JudgeError::InvalidInput(format!(
                "Unsupported content type: {}",
                value
            ))),
        }
    }

    pub fn comparison(a: impl Into<String>, b: impl Into<String>) -> Self {
        Content::Comparison {
            a: a.into(),
            b: b.into(),
        }
    }

    /// Build a conversation, rejecting an empty turn list
    pub fn conversation(turns: Vec<Message>) -> Result<Self> {
        if turns.is_empty() {
            return Err(JudgeError::InvalidInput(EMPTY_CONVERSATION.to_string()));
        }
        Ok(Content::Conversation(turns))
    }

    /// Re-check invariants that direct construction can bypass
    pub fn validate(&self) -> Result<()> {
        match self {
            Content::Conversation(turns) if turns.is_empty() => {
                Err(JudgeError::InvalidInput(EMPTY_CONVERSATION.to_string()))
            }
            _ => Ok(()),
        }
    }

    pub fn to_value(&self) -> Value {
        match self {
            Content::Text(s) => Value::String(s.clone()),
            Content::Comparison { a, b } => json!({ "a": a, "b": b }),
            Content::Conversation(turns) => json!(turns),
        }
    }
}

impl From<&str> for Content {
    fn from(text: &str) -> Self {
        Content::Text(text.to_string())
    }
}

impl From<String> for Content {
    fn from(text: String) -> Self {
        Content::Text(text)
    }
}

impl Serialize for Content {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        self.to_value().serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for Content {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let value = Value::deserialize(deserializer)?;
        Content::classify(&value).map_err(de::Error::custom)
    }
}

/// The judgment itself: a label, a boolean or a number
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Decision {
    Bool(bool),
    Number(serde_json::Number),
    Text(String),
    /// Arrays/objects emitted by a model; kept as-is
    Other(Value),
}

impl Decision {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Decision::Text(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Decision::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Decision::Number(n) => n.as_f64(),
            _ => None,
        }
    }

    /// True for the text/boolean/number shapes a judgment is expected to take
    pub fn is_expected_type(&self) -> bool {
        !matches!(self, Decision::Other(_))
    }

    pub fn to_value(&self) -> Value {
        match self {
            Decision::Bool(b) => Value::Bool(*b),
            Decision::Number(n) => Value::Number(n.clone()),
            Decision::Text(s) => Value::String(s.clone()),
            Decision::Other(v) => v.clone(),
        }
    }
}

impl From<Value> for Decision {
    fn from(value: Value) -> Self {
        match value {
            Value::Bool(b) => Decision::Bool(b),
            Value::Number(n) => Decision::Number(n),
            Value::String(s) => Decision::Text(s),
            other => Decision::Other(other),
        }
    }
}

impl From<&str> for Decision {
    fn from(text: &str) -> Self {
        Decision::Text(text.to_string())
    }
}

impl From<String> for Decision {
    fn from(text: String) -> Self {
        Decision::Text(text)
    }
}

impl From<bool> for Decision {
    fn from(b: bool) -> Self {
        Decision::Bool(b)
    }
}

impl PartialEq<&str> for Decision {
    fn eq(&self, other: &&str) -> bool {
        self.as_str() == Some(*other)
    }
}

impl fmt::Display for Decision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Decision::Bool(b) => write!(f, "{}", b),
            Decision::Number(n) => write!(f, "{}", n),
            Decision::Text(s) => write!(f, "{}", s),
            Decision::Other(v) => write!(f, "{}", v),
        }
    }
}

/// Structured verdict produced by every evaluation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvaluationResult {
    pub decision: Decision,
    pub reasoning: String,
    #[serde(default)]
    pub score: Option<f64>,
    #[serde(default)]
    pub metadata: Map<String, Value>,
}

impl EvaluationResult {
    pub fn new(decision: impl Into<Decision>, reasoning: impl Into<String>) -> Self {
        Self {
            decision: decision.into(),
            reasoning: reasoning.into(),
            score: None,
            metadata: Map::new(),
        }
    }

    pub fn with_score(mut self, score: Option<f64>) -> Self {
        self.score = score;
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }
}

/// Scoring guide: free text or level → description entries
#[derive(Debug, Clone, PartialEq)]
pub enum Rubric {
    Text(String),
    /// Insertion-ordered levels; rendering sorts them
    Levels(Vec<(f64, String)>),
}

impl Rubric {
    pub fn levels<I, S>(levels: I) -> Self
    where
        I: IntoIterator<Item = (f64, S)>,
        S: Into<String>,
    {
        Rubric::Levels(levels.into_iter().map(|(l, d)| (l, d.into())).collect())
    }

    pub fn is_empty(&self) -> bool {
        match self {
            Rubric::Text(s) => s.is_empty(),
            Rubric::Levels(levels) => levels.is_empty(),
        }
    }
}

impl From<&str> for Rubric {
    fn from(text: &str) -> Self {
        Rubric::Text(text.to_string())
    }
}

impl From<String> for Rubric {
    fn from(text: String) -> Self {
        Rubric::Text(text)
    }
}

/// Render a rubric level as "5" or "0.9"
pub fn format_level(level: f64) -> String {
    if level.fract() == 0.0 && level.abs() < 1e15 {
        format!("{}", level as i64)
    } else {
        format!("{}", level)
    }
}

impl Serialize for Rubric {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        match self {
            Rubric::Text(s) => serializer.serialize_str(s),
            Rubric::Levels(levels) => {
                let mut map = serializer.serialize_map(Some(levels.len()))?;
                for (level, desc) in levels {
                    map.serialize_entry(&format_level(*level), desc)?;
                }
                map.end()
            }
        }
    }
}

impl<'de> Deserialize<'de> for Rubric {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        match Value::deserialize(deserializer)? {
            Value::String(s) => Ok(Rubric::Text(s)),
            Value::Object(map) => {
                let mut levels = Vec::with_capacity(map.len());
                for (key, desc) in map {
                    let level: f64 = key
                        .trim()
                        .parse()
                        .map_err(|_| de::Error::custom(format!("rubric level '{}' is not numeric", key)))?;
                    levels.push((level, value_to_text(&desc)));
                }
                Ok(Rubric::Levels(levels))
            }
            other => Err(de::Error::custom(format!(
                "rubric must be a string or a mapping, got {}",
                other
            ))),
        }
    }
}

/// Few-shot example shown to the judge
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Example {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input: Option<String>,
    #[serde(default, alias = "response", alias = "text", skip_serializing_if = "Option::is_none")]
    pub content: Option<Content>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub decision: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub score: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reasoning: Option<String>,
}

impl Example {
    pub fn new(content: impl Into<Content>, decision: impl Into<Value>) -> Self {
        Self {
            content: Some(content.into()),
            decision: Some(decision.into()),
            ..Default::default()
        }
    }

    pub fn with_input(mut self, input: impl Into<String>) -> Self {
        self.input = Some(input.into());
        self
    }

    pub fn with_score(mut self, score: f64) -> Self {
        self.score = Some(score);
        self
    }

    pub fn with_reasoning(mut self, reasoning: impl Into<String>) -> Self {
        self.reasoning = Some(reasoning.into());
        self
    }
}

/// A failed batch item
#[derive(Debug)]
pub struct BatchItemError {
    pub index: usize,
    pub error: JudgeError,
}

impl fmt::Display for BatchItemError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Item {} failed: {}", self.index, self.error)
    }
}

impl std::error::Error for BatchItemError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.error)
    }
}

pub type BatchOutcome = std::result::Result<EvaluationResult, BatchItemError>;

/// Aggregate of a batch run; `results` follows input order
#[derive(Debug)]
pub struct BatchResult {
    pub results: Vec<BatchOutcome>,
    pub total: usize,
    pub successful: usize,
    pub failed: usize,
    pub duration_seconds: f64,
}

impl BatchResult {
    pub fn from_outcomes(results: Vec<BatchOutcome>, duration_seconds: f64) -> Self {
        let successful = results.iter().filter(|r| r.is_ok()).count();
        let total = results.len();
        Self {
            results,
            total,
            successful,
            failed: total - successful,
            duration_seconds,
        }
    }

    pub fn success_rate(&self) -> f64 {
        if self.total == 0 {
            0.0
        } else {
            self.successful as f64 / self.total as f64
        }
    }

    /// (index, error) for each failed item
    pub fn failures(&self) -> Vec<(usize, &JudgeError)> {
        self.results
            .iter()
            .filter_map(|r| r.as_ref().err())
            .map(|e| (e.index, &e.error))
            .collect()
    }

    pub fn successes(&self) -> impl Iterator<Item = &EvaluationResult> {
        self.results.iter().filter_map(|r| r.as_ref().ok())
    }

    pub fn to_json(&self) -> Value {
        let results: Vec<Value> = self
            .results
            .iter()
            .map(|r| match r {
                Ok(result) => json!(result),
                Err(e) => json!({ "index": e.index, "error": e.error.to_string() }),
            })
            .collect();

        json!({
            "results": results,
            "total": self.total,
            "successful": self.successful,
            "failed": self.failed,
            "success_rate": self.success_rate(),
            "duration_seconds": self.duration_seconds,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_text() {
        let content = Content::classify(&json!("Paris")).unwrap();
        assert_eq!(content, Content::Text("Paris".to_string()));
    }

    #[test]
    fn test_classify_comparison() {
        let content = Content::classify(&json!({"a": "first", "b": "second"})).unwrap();
        assert_eq!(content, Content::comparison("first", "second"));
    }

    #[test]
    fn test_classify_conversation() {
        let content = Content::classify(&json!([
            {"role": "user", "content": "hi"},
            {"role": "assistant", "content": "hello"}
        ]))
        .unwrap();
        match content {
            Content::Conversation(turns) => assert_eq!(turns.len(), 2),
            other => panic!("unexpected shape {:?}", other),
        }
    }

    #[test]
    fn test_empty_conversation_rejected() {
        let err = Content::classify(&json!([])).unwrap_err();
        assert!(matches!(err, JudgeError::InvalidInput(ref m) if m.contains("empty list")));
        assert!(Content::conversation(vec![]).is_err());
    }

    #[test]
    fn test_malformed_conversation_rejected() {
        let err = Content::classify(&json!([{"role": "user"}, "loose text"])).unwrap_err();
        assert!(matches!(err, JudgeError::InvalidInput(ref m) if m.contains("role and content")));
    }

    #[test]
    fn test_content_deserialize_uses_classifier() {
        let content: Content = serde_json::from_str(r#"{"a": "x", "b": "y"}"#).unwrap();
        assert!(matches!(content, Content::Comparison { .. }));
        assert!(serde_json::from_str::<Content>("[]").is_err());
    }

    #[test]
    fn test_decision_shapes() {
        let d: Decision = serde_json::from_value(json!(true)).unwrap();
        assert_eq!(d, Decision::Bool(true));
        let d: Decision = serde_json::from_value(json!(7)).unwrap();
        assert_eq!(d.as_f64(), Some(7.0));
        let d: Decision = serde_json::from_value(json!("GOOD")).unwrap();
        assert_eq!(d, "GOOD");
        assert!(!Decision::from(json!(["x"])).is_expected_type());
    }

    #[test]
    fn test_rubric_levels_serde() {
        let rubric: Rubric = serde_json::from_str(r#"{"1": "Bad", "0.5": "Half"}"#).unwrap();
        match &rubric {
            Rubric::Levels(levels) => {
                assert!(levels.contains(&(1.0, "Bad".to_string())));
                assert!(levels.contains(&(0.5, "Half".to_string())));
            }
            other => panic!("unexpected rubric {:?}", other),
        }
        let back = serde_json::to_value(&rubric).unwrap();
        assert_eq!(back["1"], json!("Bad"));
        assert_eq!(back["0.5"], json!("Half"));
    }

    #[test]
    fn test_example_accepts_response_alias() {
        let example: Example =
            serde_json::from_str(r#"{"response": "4", "decision": "correct"}"#).unwrap();
        assert_eq!(example.content, Some(Content::Text("4".to_string())));
    }

    #[test]
    fn test_batch_result_counts() {
        let results = vec![
            Ok(EvaluationResult::new("GOOD", "fine")),
            Err(BatchItemError {
                index: 1,
                error: JudgeError::Timeout("slow".into()),
            }),
            Ok(EvaluationResult::new("BAD", "wrong")),
        ];
        let batch = BatchResult::from_outcomes(results, 0.5);
        assert_eq!(batch.total, 3);
        assert_eq!(batch.successful + batch.failed, batch.total);
        assert!((batch.success_rate() - 2.0 / 3.0).abs() < 1e-9);
        assert_eq!(batch.failures().len(), 1);
        assert_eq!(batch.failures()[0].0, 1);
        let decisions: Vec<String> = batch.successes().map(|r| r.decision.to_string()).collect();
        assert_eq!(decisions, vec!["GOOD", "BAD"]);
    }

    #[test]
    fn test_empty_batch_success_rate() {
        let batch = BatchResult::from_outcomes(vec![], 0.0);
        assert_eq!(batch.success_rate(), 0.0);
        assert_eq!(batch.to_json()["total"], json!(0));
    }
}
