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

// Batch accounting over mixed success/failure workloads

use async_trait::async_trait;
use proptest::prelude::*;
use serde_json::{Map, Value};
use std::sync::Arc;
use vllm_judge::{
    EvaluateRequest, InferenceClient, Judge, JudgeConfig, JudgeError, Message, ModelOutput,
};

/// Replies with a verdict unless the content asks for a failure
struct ScriptedClient;

#[async_trait]
impl InferenceClient for ScriptedClient {
    async fn chat_completion(
        &self,
        messages: &[Message],
        _sampling_params: &Map<String, Value>,
        _return_choices: bool,
    ) -> vllm_judge::Result<ModelOutput> {
        let user = &messages[1].content;
        if user.contains("<timeout>") {
            return Err(JudgeError::Timeout("Request timed out after 30s".to_string()));
        }
        if user.contains("<garbage>") {
            return Ok(ModelOutput::Text("not a verdict".to_string()));
        }
        Ok(ModelOutput::Text(
            r#"{"decision": "PASS", "reasoning": "fine", "score": 1}"#.to_string(),
        ))
    }

    async fn completion(
        &self,
        _prompt: &str,
        _sampling_params: &Map<String, Value>,
        _return_choices: bool,
    ) -> vllm_judge::Result<ModelOutput> {
        Err(JudgeError::Connection("completions disabled".to_string()))
    }

    async fn list_models(&self) -> vllm_judge::Result<Vec<String>> {
        Ok(vec!["scripted".to_string()])
    }
}

fn judge() -> Judge {
    let config = JudgeConfig::new("http://localhost:8000", Some("scripted".to_string()))
        .unwrap()
        .with_max_concurrent(4);
    Judge::with_client(config, Arc::new(ScriptedClient))
}

fn request(kind: u8) -> EvaluateRequest {
    let content = match kind {
        0 => "a fine answer",
        1 => "<timeout>",
        2 => "<garbage>",
        _ => return EvaluateRequest::new("no criteria given"),
    };
    EvaluateRequest::new(content).criteria("quality")
}

proptest! {
    #[test]
    fn test_batch_accounting(kinds in prop::collection::vec(0u8..4, 0..24)) {
        let runtime = tokio::runtime::Runtime::new().unwrap();
        let requests: Vec<EvaluateRequest> = kinds.iter().map(|k| request(*k)).collect();
        let batch = runtime.block_on(judge().batch_evaluate(requests, None, None));

        prop_assert_eq!(batch.total, kinds.len());
        prop_assert_eq!(batch.results.len(), batch.total);
        prop_assert_eq!(batch.successful + batch.failed, batch.total);

        let expected_ok = kinds.iter().filter(|k| **k == 0).count();
        prop_assert_eq!(batch.successful, expected_ok);

        if batch.total == 0 {
            prop_assert_eq!(batch.success_rate(), 0.0);
        } else {
            let rate = batch.successful as f64 / batch.total as f64;
            prop_assert!((batch.success_rate() - rate).abs() < 1e-12);
        }

        for (index, kind) in kinds.iter().enumerate() {
            match (&batch.results[index], kind) {
                (Ok(result), 0) => prop_assert_eq!(&result.metadata["batch_index"], &Value::from(index)),
                (Err(item), 1) => {
                    prop_assert_eq!(item.index, index);
                    let model_call = matches!(item.error, JudgeError::ModelCall(_));
                    prop_assert!(model_call, "item {} error: {}", index, item.error);
                }
                (Err(item), 2) => {
                    let parse = matches!(item.error, JudgeError::Parse { .. });
                    prop_assert!(parse, "item {} error: {}", index, item.error);
                }
                (Err(item), _) => {
                    let invalid = matches!(item.error, JudgeError::InvalidInput(_));
                    prop_assert!(invalid, "item {} error: {}", index, item.error);
                }
                (Ok(_), _) => prop_assert!(false, "item {} should have failed", index),
            }
        }
    }
}

#[tokio::test]
async fn test_batch_result_json_shape() {
    let batch = judge()
        .batch_evaluate(vec![request(0), request(1)], None, None)
        .await;
    let json = batch.to_json();

    assert_eq!(json["total"], 2);
    assert_eq!(json["successful"], 1);
    assert_eq!(json["failed"], 1);
    assert_eq!(json["success_rate"], 0.5);
}
