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

//! # vLLM Judge
//!
//! LLM-as-a-judge client for OpenAI-compatible inference servers.
//!
//! ## Features
//!
//! - **Templated metrics**: reusable criteria/rubric bundles with `{var}` or
//!   Jinja2 placeholders, and a catalog of built-in metrics
//! - **Fault-tolerant parsing**: verdicts are recovered from bare JSON,
//!   fenced blocks, or JSON buried in prose, with synonym field names
//! - **Guardian models**: dedicated parsers for Llama Guard 3 and Granite
//!   Guardian 3.2
//! - **Batch evaluation**: bounded-concurrency fan-out with per-item failures
//!
//! ## Example
//!
//! ```rust,ignore
//! use vllm_judge::{EvaluateRequest, Judge, JudgeConfig};
//!
//! #[tokio::main]
//! async fn main() -> vllm_judge::Result<()> {
//!     let judge = Judge::connect(JudgeConfig::new("http://localhost:8000", None)?).await?;
//!
//!     let result = judge
//!         .evaluate(
//!             EvaluateRequest::new("Paris")
//!                 .input("What is the capital of France?")
//!                 .metric("accuracy"),
//!         )
//!         .await?;
//!
//!     println!("{} ({:?}): {}", result.decision, result.score, result.reasoning);
//!     Ok(())
//! }
//! ```

pub mod batch;
pub mod builtin_metrics;
pub mod client;
pub mod config;
pub mod error;
pub mod judge;
pub mod metrics;
pub mod models;
pub mod parsers;
pub mod prompt_builder;
pub mod response;
pub mod templating;

pub use batch::{requests_from_json, BatchOptions, BatchProcessor, ProgressCallback};
pub use client::{InferenceClient, ModelOutput, VllmClient};
pub use config::JudgeConfig;
pub use error::{JudgeError, Result};
pub use judge::{EvaluateRequest, Judge, MetricSelector};
pub use metrics::{Metric, MetricBuilder, MetricDef, MetricRegistry, ModelSpecificMetric};
pub use models::{
    BatchItemError, BatchOutcome, BatchResult, Content, Decision, EvaluationResult, Example,
    Message, Rubric, Scale,
};
pub use response::{parse_response, ParseStrategy};
pub use templating::{TemplateEngine, TemplateVars};
