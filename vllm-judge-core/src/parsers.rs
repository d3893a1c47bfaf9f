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

//! Fixed-format parsers for guardian models
//!
//! These never fail: plumbing problems come back as a `"Failed"` decision so
//! batch callers always get a structured result.

use crate::client::ModelOutput;
use crate::models::EvaluationResult;
use regex::Regex;
use serde_json::{json, Value};
use std::sync::LazyLock;

const GRANITE_SAFE_TOKEN: &str = "Yes";
const GRANITE_RISKY_TOKEN: &str = "No";
/// Stand-in probability for a label token absent from the alternatives
const PROB_FLOOR: f64 = 1e-50;

static FIRST_WORD: LazyLock<Option<Regex>> = LazyLock::new(|| Regex::new(r"(?m)^\w+").ok());
static CONFIDENCE_TAG: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r"<confidence> (.*?) </confidence>").ok());

fn tagged(decision: impl Into<String>, reasoning: impl Into<String>, model_type: &str) -> EvaluationResult {
    EvaluationResult::new(decision.into(), reasoning).with_metadata("model_type", json!(model_type))
}

/// Text of the first choice, or the plain completion
fn output_text(output: &ModelOutput) -> String {
    match output {
        ModelOutput::Text(text) => text.clone(),
        ModelOutput::Choices(choices) => choices.first().map(choice_text).unwrap_or_default(),
    }
}

fn choice_text(choice: &Value) -> String {
    choice
        .pointer("/message/content")
        .or_else(|| choice.get("text"))
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string()
}

/// Llama Guard 3: first line is `safe`/`unsafe`, second line lists categories
pub fn parse_llama_guard_3(output: &ModelOutput) -> EvaluationResult {
    let text = output_text(output);
    let mut lines = text.trim().split('\n');

    let decision = lines.next().unwrap_or_default().to_lowercase().trim().to_string();
    let reasoning = lines
        .next()
        .map(|line| line.trim().to_string())
        .unwrap_or_else(|| "No violations detected".to_string());

    tagged(decision, reasoning, "llama_guard_3")
}

/// Granite Guardian 3.2: `Yes`/`No` label with logprobs and a confidence tag
pub fn parse_granite_guardian_3_2(output: &ModelOutput) -> EvaluationResult {
    const MODEL_TYPE: &str = "granite_guardian_3_2";

    let choices: Vec<Value> = match output {
        ModelOutput::Choices(choices) => choices.clone(),
        ModelOutput::Text(raw) => match serde_json::from_str::<Value>(raw) {
            Ok(Value::Array(items)) => items,
            Ok(other) => vec![other],
            Err(e) => {
                return tagged("Failed", format!("JSON parsing error: {}", e), MODEL_TYPE);
            }
        },
    };

    let Some(choice) = choices.first() else {
        return tagged("Failed", "Empty choices list", MODEL_TYPE);
    };

    let probabilities = choice
        .get("logprobs")
        .filter(|lp| !lp.is_null())
        .map(label_probabilities);

    let text = choice_text(choice);
    let text = text.trim();

    let first_word = FIRST_WORD
        .as_ref()
        .and_then(|re| re.find(text))
        .map(|m| m.as_str().trim().to_string())
        .unwrap_or_else(|| "Failed".to_string());

    let label = if first_word.eq_ignore_ascii_case(GRANITE_RISKY_TOKEN) {
        GRANITE_RISKY_TOKEN.to_string()
    } else if first_word.eq_ignore_ascii_case(GRANITE_SAFE_TOKEN) {
        GRANITE_SAFE_TOKEN.to_string()
    } else {
        first_word
    };

    let score = probabilities.and_then(|(safe, risky)| {
        let prob = if label == GRANITE_RISKY_TOKEN {
            Some(risky)
        } else if label == GRANITE_SAFE_TOKEN {
            Some(safe)
        } else {
            None
        };
        prob.map(|p| (p * 1000.0).round() / 1000.0)
    });

    let confidence = CONFIDENCE_TAG
        .as_ref()
        .and_then(|re| re.captures(text))
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str().trim().to_string())
        .unwrap_or_else(|| "Unknown".to_string());

    tagged(label, format!("Confidence level: {}", confidence), MODEL_TYPE).with_score(score)
}

/// (P(safe), P(risky)) from the top alternatives at the first generated position
fn label_probabilities(logprobs: &Value) -> (f64, f64) {
    let mut safe = PROB_FLOOR;
    let mut risky = PROB_FLOOR;

    let alternatives = logprobs
        .pointer("/content/0/top_logprobs")
        .and_then(Value::as_array);

    for alt in alternatives.into_iter().flatten() {
        let (Some(token), Some(logprob)) = (
            alt.get("token").and_then(Value::as_str),
            alt.get("logprob").and_then(Value::as_f64),
        ) else {
            continue;
        };
        let token = token.trim();
        if token.eq_ignore_ascii_case(GRANITE_SAFE_TOKEN) {
            safe += logprob.exp();
        }
        if token.eq_ignore_ascii_case(GRANITE_RISKY_TOKEN) {
            risky += logprob.exp();
        }
    }

    // softmax over log-space values, shifted by the max
    let logs = [safe.ln(), risky.ln()];
    let max = logs[0].max(logs[1]);
    let exps = [(logs[0] - max).exp(), (logs[1] - max).exp()];
    let total = exps[0] + exps[1];
    (exps[0] / total, exps[1] / total)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn granite_choice(content: &str, alternatives: Value) -> Value {
        json!({
            "message": {"role": "assistant", "content": content},
            "logprobs": {"content": [{"token": "Yes", "logprob": -0.1, "top_logprobs": alternatives}]}
        })
    }

    #[test]
    fn test_llama_guard_unsafe_with_categories() {
        let result = parse_llama_guard_3(&ModelOutput::Text("\nUNSAFE\nS1,S10\n".to_string()));
        assert_eq!(result.decision, "unsafe");
        assert_eq!(result.reasoning, "S1,S10");
        assert_eq!(result.score, None);
        assert_eq!(result.metadata["model_type"], json!("llama_guard_3"));
    }

    #[test]
    fn test_llama_guard_safe_default_reasoning() {
        let result = parse_llama_guard_3(&ModelOutput::Text("safe".to_string()));
        assert_eq!(result.decision, "safe");
        assert_eq!(result.reasoning, "No violations detected");
    }

    #[test]
    fn test_granite_yes_with_probabilities() {
        let choice = granite_choice(
            "yes <confidence> High </confidence>",
            json!([
                {"token": "Yes", "logprob": -0.05},
                {"token": " yes", "logprob": -4.0},
                {"token": "No", "logprob": -3.2}
            ]),
        );
        let result = parse_granite_guardian_3_2(&ModelOutput::Choices(vec![choice]));

        assert_eq!(result.decision, "Yes");
        assert_eq!(result.reasoning, "Confidence level: High");
        let score = result.score.unwrap();
        let safe = (-0.05f64).exp() + (-4.0f64).exp();
        let risky = (-3.2f64).exp();
        let expected = ((safe / (safe + risky)) * 1000.0).round() / 1000.0;
        assert!((score - expected).abs() < 1e-9);
    }

    #[test]
    fn test_granite_missing_risky_token_uses_floor() {
        let choice = granite_choice("No", json!([{"token": "No", "logprob": -0.01}]));
        let result = parse_granite_guardian_3_2(&ModelOutput::Choices(vec![choice]));
        assert_eq!(result.decision, "No");
        assert_eq!(result.score, Some(1.0));
        assert_eq!(result.reasoning, "Confidence level: Unknown");
    }

    #[test]
    fn test_granite_unknown_label_kept_verbatim() {
        let choice = json!({"message": {"content": "Maybe later"}, "logprobs": null});
        let result = parse_granite_guardian_3_2(&ModelOutput::Choices(vec![choice]));
        assert_eq!(result.decision, "Maybe");
        assert_eq!(result.score, None);
    }

    #[test]
    fn test_granite_serialized_input() {
        let raw = json!([{"message": {"content": "No"}, "logprobs": null}]).to_string();
        let result = parse_granite_guardian_3_2(&ModelOutput::Text(raw));
        assert_eq!(result.decision, "No");
    }

    #[test]
    fn test_granite_bad_json_is_structured_failure() {
        let result = parse_granite_guardian_3_2(&ModelOutput::Text("not json".to_string()));
        assert_eq!(result.decision, "Failed");
        assert!(result.reasoning.starts_with("JSON parsing error"));
        assert_eq!(result.score, None);
        assert_eq!(result.metadata["model_type"], json!("granite_guardian_3_2"));
    }

    #[test]
    fn test_granite_empty_choices() {
        let result = parse_granite_guardian_3_2(&ModelOutput::Choices(vec![]));
        assert_eq!(result.decision, "Failed");
        assert_eq!(result.reasoning, "Empty choices list");
    }
}
