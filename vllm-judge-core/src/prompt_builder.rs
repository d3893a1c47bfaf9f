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

//! Judge prompt construction
//!
//! Produces the two-message (system, user) conversation sent to the judge
//! model. Every input here has already been templated.

use crate::error::{JudgeError, Result};
use crate::models::{format_level, Content, Example, Message, Rubric, Scale};
use serde_json::Value;

pub const DEFAULT_SYSTEM_PROMPT: &str = "You are an impartial judge and expert evaluator. Your task is to evaluate the provided content based on the specific evaluation criteria and rubric.
# Key Instructions:
1. Your evaluation must be objective, consistent, and based solely on the specified criteria. Do not let your own opinions or biases interfere.
2. Focus exclusively on quality assessment.
3. Do not be influenced by the length of the responses unless response length is explicitly relevant to the specified evaluation criteria (e.g., a task assessing conciseness or verbosity).
4. Your entire response MUST be a single, valid JSON object and nothing else. Do not include any text or conversational filler before or after this JSON object.

";

/// Always appended to the system prompt, custom or not
pub const OUTPUT_FORMAT: &str = r#"
# Output Format:

The JSON object MUST have exactly these three fields:

1. decision: (String | Boolean) This decision label should clearly state your main finding. This could be a string representing a specific class (eg., PASS, FAIL, CORRECT, INCORRECT, etc.) or a boolean value (true or false). If user provided a rubric, you should use the rubric to determine the decision label.
2. score: (Number | null) A numerical score for the evaluation. If scoring is requested, provide the score as a number. If scoring is NOT requested or is not applicable for the specific task, you MUST use the value null for this field.
3. reasoning: (String) A concise explanation justifying your decision and score (if a score was provided). This reasoning must directly and logically support your evaluation and refer to the specific evaluation criteria.

The JSON object MUST be well-formed and adhere strictly to the following structure:

{
    "decision": <your judgment - string|boolean>,
    "reasoning": <concise explanation of your judgment - string>,
    "score": <numeric score if requested, otherwise null - number|null>
}
        "#;

const JSON_REMINDER: &str = r#"{
    "decision": <your judgment - string|boolean>,
    "reasoning": "<concise explanation of your judgment>",
    "score": <numeric score if requested, otherwise null>
}"#;

const DECISION_INSTRUCTION: &str = "\nYou must return a decision label/class (your main judgement) for the `decision` field and a concise explanation for the `reasoning` field in the JSON object.";

/// Fully resolved inputs of one judge prompt
#[derive(Debug, Clone, Copy)]
pub struct PromptSpec<'a> {
    pub content: &'a Content,
    pub criteria: &'a str,
    pub input: Option<&'a str>,
    pub rubric: Option<&'a Rubric>,
    pub scale: Option<Scale>,
    pub examples: &'a [Example],
    pub system_prompt: Option<&'a str>,
    pub context: Option<&'a str>,
    pub additional_instructions: Option<&'a str>,
}

impl<'a> PromptSpec<'a> {
    pub fn new(content: &'a Content, criteria: &'a str) -> Self {
        Self {
            content,
            criteria,
            input: None,
            rubric: None,
            scale: None,
            examples: &[],
            system_prompt: None,
            context: None,
            additional_instructions: None,
        }
    }
}

fn present(value: Option<&str>) -> Option<&str> {
    value.filter(|s| !s.is_empty())
}

/// Build the system and user messages for a judge call
pub fn build_messages(spec: &PromptSpec<'_>) -> Result<Vec<Message>> {
    spec.content.validate()?;

    let mut system = present(spec.system_prompt)
        .unwrap_or(DEFAULT_SYSTEM_PROMPT)
        .to_string();
    system.push_str(OUTPUT_FORMAT);

    Ok(vec![Message::system(system), Message::user(build_user_prompt(spec)?)])
}

fn build_user_prompt(spec: &PromptSpec<'_>) -> Result<String> {
    let mut parts: Vec<String> = Vec::new();

    if let Some(input) = present(spec.input) {
        parts.push("Given the following input/question:".to_string());
        parts.push(format!("\"{}\"", input));
        parts.push(String::new());
    }

    parts.push("## Content to evaluate:".to_string());
    parts.extend(content_section(spec.content));
    parts.extend(criteria_section(spec.content, spec.criteria, present(spec.context)));

    let rubric = spec.rubric.filter(|r| !r.is_empty());
    if spec.scale.is_some() || rubric.is_some() {
        parts.extend(scoring_section(spec.scale, rubric));
    }

    if !spec.examples.is_empty() {
        parts.extend(examples_section(spec.examples)?);
    }

    if let Some(extra) = present(spec.additional_instructions) {
        parts.push(format!("Additional instructions: {}", extra));
    }

    parts.push("\nYou must respond in JSON format:".to_string());
    parts.push(JSON_REMINDER.to_string());

    Ok(parts.join("\n"))
}

/// "user" -> "User", "tool_call" -> "Tool_Call"
fn title_case(role: &str) -> String {
    let mut out = String::with_capacity(role.len());
    let mut at_word_start = true;
    for ch in role.chars() {
        if ch.is_alphabetic() {
            if at_word_start {
                out.extend(ch.to_uppercase());
            } else {
                out.extend(ch.to_lowercase());
            }
            at_word_start = false;
        } else {
            out.push(ch);
            at_word_start = true;
        }
    }
    out
}

fn content_section(content: &Content) -> Vec<String> {
    match content {
        Content::Text(text) => vec![text.clone()],
        Content::Comparison { a, b } => vec![
            format!("**Response A:**\n{}", a),
            format!("**Response B:**\n{}", b),
        ],
        Content::Conversation(turns) => {
            let mut section = vec!["**Conversation Start:**".to_string()];
            for (i, turn) in turns.iter().enumerate() {
                section.push(format!("{}: {}", title_case(&turn.role), turn.content));
                if i + 1 < turns.len() {
                    section.push(String::new());
                }
            }
            section.push("**Conversation End:**".to_string());
            section
        }
    }
}

fn criteria_section(content: &Content, criteria: &str, context: Option<&str>) -> Vec<String> {
    let mut section = vec!["## Evaluation Criteria:".to_string()];

    match content {
        Content::Comparison { .. } => {
            section.push(format!("Compare the two responses based on: {}", criteria));
        }
        Content::Conversation(_) => {
            section.push(format!("Evaluate the conversation based on: {}", criteria));
            section.push("Consider the full context, flow, and interaction quality.".to_string());
        }
        Content::Text(_) => {
            section.push(format!("Evaluate the content based on: {}", criteria));
        }
    }

    if let Some(context) = context {
        section.push(format!("\nContext: {}", context));
    }

    section.push(DECISION_INSTRUCTION.to_string());
    section
}

/// Levels sorted by score, highest first
fn sorted_levels(levels: &[(f64, String)]) -> Vec<String> {
    let mut sorted: Vec<&(f64, String)> = levels.iter().collect();
    sorted.sort_by(|a, b| b.0.total_cmp(&a.0));
    sorted
        .into_iter()
        .map(|(level, desc)| format!("- {}: {}", format_level(*level), desc))
        .collect()
}

fn scoring_section(scale: Option<Scale>, rubric: Option<&Rubric>) -> Vec<String> {
    let mut section = Vec::new();

    match (scale, rubric) {
        (Some((min, max)), rubric) => {
            section.push(format!(
                "In addition to these, provide a score from {} to {}",
                format_level(min),
                format_level(max)
            ));
            match rubric {
                Some(Rubric::Levels(levels)) => {
                    section.push("\nScoring guide:".to_string());
                    section.extend(sorted_levels(levels));
                }
                Some(Rubric::Text(text)) => {
                    section.push(format!("\nEvaluation guide: {}", text));
                }
                None => {}
            }
        }
        (None, Some(rubric)) => {
            section.push(
                "\nIn addition to these, provide a score if required by the following evaluation guide."
                    .to_string(),
            );
            match rubric {
                Rubric::Text(text) => section.push(format!("\nEvaluation guide: {}", text)),
                Rubric::Levels(levels) => {
                    section.push("\nEvaluation guide:".to_string());
                    section.extend(sorted_levels(levels));
                }
            }
        }
        (None, None) => {}
    }

    section
}

/// Single-line JSON with `decision`, `score`, `reasoning` in that order
fn example_response(example: &Example, decision: &Value) -> Result<String> {
    let mut fields = vec![format!("\"decision\": {}", serde_json::to_string(decision)?)];
    if let Some(score) = example.score {
        fields.push(format!("\"score\": {}", format_level(score)));
    }
    if let Some(reasoning) = &example.reasoning {
        fields.push(format!("\"reasoning\": {}", serde_json::to_string(reasoning)?));
    }
    Ok(format!("{{{}}}", fields.join(", ")))
}

fn examples_section(examples: &[Example]) -> Result<Vec<String>> {
    let mut section = vec!["\nExample evaluations:".to_string()];

    for (i, example) in examples.iter().enumerate() {
        section.push(format!("Example {}:", i + 1));
        section.push("Request:".to_string());

        if let Some(input) = &example.input {
            section.push(format!("Input: {}", input));
        }
        match &example.content {
            Some(Content::Text(text)) => section.push(format!("Content: {}", text)),
            Some(Content::Comparison { a, b }) => {
                section.push(format!("Response A: {}", a));
                section.push(format!("Response B: {}", b));
            }
            Some(Content::Conversation(turns)) => {
                section.push("**Conversation Start:**".to_string());
                section.extend(
                    turns
                        .iter()
                        .map(|turn| format!("{}: {}", title_case(&turn.role), turn.content)),
                );
                section.push("**Conversation End:**".to_string());
            }
            None => {}
        }

        section.push("Response:".to_string());

        let decision = match &example.decision {
            None | Some(Value::Null) => None,
            Some(Value::String(s)) if s.is_empty() => None,
            Some(decision) => Some(decision),
        }
        .ok_or_else(|| {
            JudgeError::InvalidInput("Example must include a decision field".to_string())
        })?;

        section.push(example_response(example, decision)?);
    }

    Ok(section)
}

/// Flatten chat messages into a completion prompt
pub fn format_messages_as_text(messages: &[Message]) -> String {
    let mut parts: Vec<String> = messages
        .iter()
        .filter_map(|message| match message.role.as_str() {
            "system" => Some(format!("System: {}", message.content)),
            "user" => Some(format!("\nUser: {}", message.content)),
            "assistant" => Some(format!("\nAssistant: {}", message.content)),
            _ => None,
        })
        .collect();

    parts.push("\nAssistant:".to_string());
    parts.join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn user_prompt(spec: &PromptSpec<'_>) -> String {
        build_messages(spec).unwrap().remove(1).content
    }

    #[test]
    fn test_default_system_prompt_has_output_format() {
        let content = Content::from("Paris");
        let messages = build_messages(&PromptSpec::new(&content, "accuracy")).unwrap();

        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].role, "system");
        assert!(messages[0].content.starts_with("You are an impartial judge"));
        assert!(messages[0].content.contains("# Output Format:"));
        assert_eq!(messages[1].role, "user");
    }

    #[test]
    fn test_custom_system_prompt_keeps_output_format() {
        let content = Content::from("x");
        let spec = PromptSpec {
            system_prompt: Some("You are a strict grader."),
            ..PromptSpec::new(&content, "accuracy")
        };
        let system = build_messages(&spec).unwrap().remove(0).content;
        assert!(system.starts_with("You are a strict grader."));
        assert!(system.contains("# Output Format:"));
        assert!(!system.contains("impartial judge"));
    }

    #[test]
    fn test_user_prompt_layout() {
        let content = Content::from("Paris");
        let spec = PromptSpec {
            input: Some("What is the capital of France?"),
            scale: Some((1.0, 10.0)),
            context: Some("Geography quiz"),
            additional_instructions: Some("Be brief."),
            ..PromptSpec::new(&content, "accuracy")
        };
        let prompt = user_prompt(&spec);

        assert!(prompt.starts_with(
            "Given the following input/question:\n\"What is the capital of France?\"\n\n## Content to evaluate:\nParis\n## Evaluation Criteria:\nEvaluate the content based on: accuracy"
        ));
        assert!(prompt.contains("\n\nContext: Geography quiz"));
        assert!(prompt.contains("In addition to these, provide a score from 1 to 10"));
        assert!(prompt.contains("Additional instructions: Be brief."));
        assert!(prompt.ends_with(JSON_REMINDER));

        let criteria_at = prompt.find("## Evaluation Criteria:").unwrap();
        let scale_at = prompt.find("provide a score from").unwrap();
        let extra_at = prompt.find("Additional instructions").unwrap();
        assert!(criteria_at < scale_at && scale_at < extra_at);
    }

    #[test]
    fn test_comparison_framing() {
        let content = Content::comparison("Short answer", "Long answer");
        let prompt = user_prompt(&PromptSpec::new(&content, "helpfulness"));
        assert!(prompt.contains("**Response A:**\nShort answer"));
        assert!(prompt.contains("**Response B:**\nLong answer"));
        assert!(prompt.contains("Compare the two responses based on: helpfulness"));
    }

    #[test]
    fn test_conversation_rendering() {
        let content = Content::conversation(vec![
            Message::user("Hi"),
            Message::new("assistant", "Hello! How can I help?"),
        ])
        .unwrap();
        let prompt = user_prompt(&PromptSpec::new(&content, "politeness"));
        assert!(prompt.contains(
            "**Conversation Start:**\nUser: Hi\n\nAssistant: Hello! How can I help?\n**Conversation End:**"
        ));
        assert!(prompt.contains("Evaluate the conversation based on: politeness"));
        assert!(prompt.contains("Consider the full context, flow, and interaction quality."));
    }

    #[test]
    fn test_level_rubric_sorted_descending() {
        let content = Content::from("x");
        let rubric = Rubric::levels([(1.0, "Bad"), (5.0, "Great"), (0.5, "Awful")]);
        let spec = PromptSpec {
            rubric: Some(&rubric),
            scale: Some((0.0, 5.0)),
            ..PromptSpec::new(&content, "quality")
        };
        let prompt = user_prompt(&spec);
        assert!(prompt.contains("\nScoring guide:\n- 5: Great\n- 1: Bad\n- 0.5: Awful"));
    }

    #[test]
    fn test_text_rubric_without_scale() {
        let content = Content::from("x");
        let rubric = Rubric::from("PASS if correct, FAIL otherwise");
        let spec = PromptSpec {
            rubric: Some(&rubric),
            ..PromptSpec::new(&content, "correctness")
        };
        let prompt = user_prompt(&spec);
        assert!(prompt.contains("provide a score if required by the following evaluation guide."));
        assert!(prompt.contains("\nEvaluation guide: PASS if correct, FAIL otherwise"));
        assert!(!prompt.contains("provide a score from"));
    }

    #[test]
    fn test_examples_section() {
        let content = Content::from("x");
        let examples = vec![Example::new("The sky is blue", "PASS")
            .with_input("What color is the sky?")
            .with_score(5.0)
            .with_reasoning("Correct")];
        let spec = PromptSpec {
            examples: &examples,
            ..PromptSpec::new(&content, "accuracy")
        };
        let prompt = user_prompt(&spec);
        assert!(prompt.contains(
            "\nExample evaluations:\nExample 1:\nRequest:\nInput: What color is the sky?\nContent: The sky is blue\nResponse:\n{\"decision\": \"PASS\", \"score\": 5, \"reasoning\": \"Correct\"}"
        ));
    }

    #[test]
    fn test_example_without_decision_rejected() {
        let content = Content::from("x");
        let examples = vec![Example {
            content: Some(Content::from("y")),
            decision: Some(json!("")),
            ..Default::default()
        }];
        let spec = PromptSpec {
            examples: &examples,
            ..PromptSpec::new(&content, "accuracy")
        };
        let err = build_messages(&spec).unwrap_err();
        assert!(err.to_string().contains("Example must include a decision field"));
    }

    #[test]
    fn test_empty_conversation_rejected() {
        let content = Content::Conversation(vec![]);
        assert!(matches!(
            build_messages(&PromptSpec::new(&content, "x")),
            Err(JudgeError::InvalidInput(_))
        ));
    }

    #[test]
    fn test_format_messages_as_text() {
        let text = format_messages_as_text(&[Message::system("S"), Message::user("U")]);
        assert_eq!(text, "System: S\n\nUser: U\n\nAssistant:");
    }

    #[test]
    fn test_title_case() {
        assert_eq!(title_case("user"), "User");
        assert_eq!(title_case("ASSISTANT"), "Assistant");
        assert_eq!(title_case("tool_call"), "Tool_Call");
    }
}
