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

//! Evaluation orchestrator
//!
//! Each call resolves its metric, then takes one of two paths:
//!
//! - **model-specific**: the content goes to the model as-is and the raw
//!   output is handed to the metric's own parser.
//! - **standard**: metric defaults are merged with caller overrides, all
//!   templated fields are rendered in strict mode, the judge prompt is built,
//!   and the reply runs through the generic response normalizer.
//!
//! A `Judge` holds no per-call state, so it can be shared across concurrent
//! evaluations.

use crate::batch::{BatchOptions, BatchProcessor, ProgressCallback};
use crate::client::{InferenceClient, ModelOutput, VllmClient};
use crate::config::JudgeConfig;
use crate::error::{JudgeError, Result};
use crate::metrics::{Metric, MetricDef, MetricRegistry, ModelSpecificMetric};
use crate::models::{BatchResult, Content, EvaluationResult, Example, Message, Rubric, Scale};
use crate::prompt_builder::{build_messages, format_messages_as_text, PromptSpec};
use crate::response::parse_response;
use crate::templating::{apply, validate_template_vars, TemplateEngine, TemplateVars};
use serde::{de, Deserialize, Deserializer};
use serde_json::{Map, Value};
use std::sync::Arc;
use tracing::{debug, info};

/// Default scale for score-style convenience calls
pub const DEFAULT_SCALE: Scale = (1.0, 10.0);

/// How a request names its metric
#[derive(Debug, Clone)]
pub enum MetricSelector {
    /// Looked up in the judge's registry
    Name(String),
    /// Used directly
    Inline(Arc<MetricDef>),
}

impl From<&str> for MetricSelector {
    fn from(name: &str) -> Self {
        MetricSelector::Name(name.to_string())
    }
}

impl From<String> for MetricSelector {
    fn from(name: String) -> Self {
        MetricSelector::Name(name)
    }
}

impl From<Metric> for MetricSelector {
    fn from(metric: Metric) -> Self {
        MetricSelector::Inline(Arc::new(MetricDef::Standard(metric)))
    }
}

impl From<ModelSpecificMetric> for MetricSelector {
    fn from(metric: ModelSpecificMetric) -> Self {
        MetricSelector::Inline(Arc::new(MetricDef::ModelSpecific(metric)))
    }
}

impl From<Arc<MetricDef>> for MetricSelector {
    fn from(metric: Arc<MetricDef>) -> Self {
        MetricSelector::Inline(metric)
    }
}

/// A metric name, or an inline standard metric definition
impl<'de> Deserialize<'de> for MetricSelector {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        match Value::deserialize(deserializer)? {
            Value::String(name) => Ok(MetricSelector::Name(name)),
            value @ Value::Object(_) => {
                let metric: Metric = serde_json::from_value(value).map_err(de::Error::custom)?;
                Ok(MetricSelector::from(metric.with_detected_vars()))
            }
            other => Err(de::Error::custom(format!(
                "metric must be a name or a metric definition, got {}",
                other
            ))),
        }
    }
}

/// Parameters of one evaluation
///
/// Every field except `content` is optional; unset fields fall back to the
/// selected metric's defaults.
#[derive(Debug, Clone, Deserialize)]
pub struct EvaluateRequest {
    #[serde(alias = "response")]
    pub content: Content,
    #[serde(default)]
    pub input: Option<String>,
    #[serde(default)]
    pub criteria: Option<String>,
    #[serde(default)]
    pub rubric: Option<Rubric>,
    #[serde(default)]
    pub scale: Option<Scale>,
    #[serde(default)]
    pub examples: Option<Vec<Example>>,
    #[serde(default)]
    pub metric: Option<MetricSelector>,
    #[serde(default)]
    pub system_prompt: Option<String>,
    #[serde(default)]
    pub context: Option<String>,
    #[serde(default)]
    pub template_vars: TemplateVars,
    #[serde(default)]
    pub template_engine: Option<TemplateEngine>,
    #[serde(default)]
    pub sampling_params: Map<String, Value>,
    #[serde(default)]
    pub additional_instructions: Option<String>,
}

impl EvaluateRequest {
    pub fn new(content: impl Into<Content>) -> Self {
        Self {
            content: content.into(),
            input: None,
            criteria: None,
            rubric: None,
            scale: None,
            examples: None,
            metric: None,
            system_prompt: None,
            context: None,
            template_vars: TemplateVars::new(),
            template_engine: None,
            sampling_params: Map::new(),
            additional_instructions: None,
        }
    }

    pub fn input(mut self, input: impl Into<String>) -> Self {
        self.input = Some(input.into());
        self
    }

    pub fn criteria(mut self, criteria: impl Into<String>) -> Self {
        self.criteria = Some(criteria.into());
        self
    }

    pub fn rubric(mut self, rubric: impl Into<Rubric>) -> Self {
        self.rubric = Some(rubric.into());
        self
    }

    pub fn scale(mut self, min: f64, max: f64) -> Self {
        self.scale = Some((min, max));
        self
    }

    pub fn examples(mut self, examples: Vec<Example>) -> Self {
        self.examples = Some(examples);
        self
    }

    pub fn metric(mut self, metric: impl Into<MetricSelector>) -> Self {
        self.metric = Some(metric.into());
        self
    }

    pub fn system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.system_prompt = Some(prompt.into());
        self
    }

    pub fn context(mut self, context: impl Into<String>) -> Self {
        self.context = Some(context.into());
        self
    }

    pub fn template_var(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.template_vars.insert(key.into(), value.into());
        self
    }

    pub fn template_vars(mut self, vars: TemplateVars) -> Self {
        self.template_vars.extend(vars);
        self
    }

    pub fn template_engine(mut self, engine: TemplateEngine) -> Self {
        self.template_engine = Some(engine);
        self
    }

    pub fn sampling_param(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.sampling_params.insert(key.into(), value.into());
        self
    }

    pub fn additional_instructions(mut self, text: impl Into<String>) -> Self {
        self.additional_instructions = Some(text.into());
        self
    }
}

fn non_empty(value: Option<&str>) -> Option<&str> {
    value.filter(|s| !s.is_empty())
}

/// Standard-path parameters after merging and templating
struct ResolvedParams {
    criteria: String,
    rubric: Option<Rubric>,
    scale: Option<Scale>,
    examples: Vec<Example>,
    system_prompt: Option<String>,
    context: Option<String>,
    input: Option<String>,
    additional_instructions: Option<String>,
    template_vars: TemplateVars,
    template_engine: TemplateEngine,
}

impl ResolvedParams {
    /// Caller value wins; otherwise the metric's
    fn merge(request: &EvaluateRequest, metric: Option<&Metric>) -> Result<Self> {
        let criteria = non_empty(request.criteria.as_deref())
            .or_else(|| metric.and_then(|m| non_empty(Some(m.criteria.as_str()))))
            .map(str::to_string)
            .ok_or_else(|| {
                JudgeError::InvalidInput("Either 'criteria' or 'metric' must be provided".to_string())
            })?;

        let rubric = request
            .rubric
            .clone()
            .filter(|r| !r.is_empty())
            .or_else(|| metric.and_then(|m| m.rubric.clone()))
            .filter(|r| !r.is_empty());

        let examples = request
            .examples
            .clone()
            .filter(|e| !e.is_empty())
            .or_else(|| metric.map(|m| m.examples.clone()))
            .unwrap_or_default();

        let system_prompt = non_empty(request.system_prompt.as_deref())
            .or_else(|| metric.and_then(|m| non_empty(m.system_prompt.as_deref())))
            .map(str::to_string);

        let additional_instructions = non_empty(request.additional_instructions.as_deref())
            .or_else(|| metric.and_then(|m| non_empty(m.additional_instructions.as_deref())))
            .map(str::to_string);

        let template_engine = request
            .template_engine
            .or_else(|| metric.map(|m| m.template_engine))
            .unwrap_or_default();

        // `input` counts as provided before required vars are checked
        let input = non_empty(request.input.as_deref()).map(str::to_string);
        let mut provided = request.template_vars.clone();
        if let Some(input) = &input {
            provided.insert("input".to_string(), Value::String(input.clone()));
        }
        let template_vars = match metric {
            Some(m) => validate_template_vars(&provided, &m.required_vars, &m.template_vars)?,
            None => provided,
        };

        Ok(Self {
            criteria,
            rubric,
            scale: request.scale.or_else(|| metric.and_then(|m| m.scale)),
            examples,
            system_prompt,
            context: request.context.clone(),
            input,
            additional_instructions,
            template_vars,
            template_engine,
        })
    }

    /// Render every templated field in strict mode
    fn render(mut self) -> Result<Self> {
        let vars = &self.template_vars;
        let engine = self.template_engine;

        self.criteria = apply(&self.criteria, vars, engine, true)?;
        self.rubric = apply(&self.rubric, vars, engine, true)?;
        self.system_prompt = apply(&self.system_prompt, vars, engine, true)?;
        self.context = apply(&self.context, vars, engine, true)?;
        self.input = apply(&self.input, vars, engine, true)?;
        Ok(self)
    }
}

/// LLM-as-a-judge client
pub struct Judge {
    config: JudgeConfig,
    client: Arc<dyn InferenceClient>,
    registry: MetricRegistry,
}

impl Judge {
    /// Judge over a vLLM endpoint; the model must be configured
    pub fn new(config: JudgeConfig) -> Result<Self> {
        if config.model.as_deref().map_or(true, str::is_empty) {
            return Err(JudgeError::Configuration(
                "No model configured; set one or use Judge::connect to auto-detect".to_string(),
            ));
        }
        let client = VllmClient::new(config.clone())?;
        let config = client.config().clone();
        Ok(Self::with_client(config, Arc::new(client)))
    }

    /// Judge over a vLLM endpoint, detecting the model when none is configured
    pub async fn connect(config: JudgeConfig) -> Result<Self> {
        let mut client = VllmClient::new(config)?;
        if client.config().model.is_none() {
            let model = client.detect_model().await?;
            info!("Auto-detected model: {}", model);
            client.set_model(model);
        }
        let config = client.config().clone();
        Ok(Self::with_client(config, Arc::new(client)))
    }

    /// Judge over any inference backend
    pub fn with_client(config: JudgeConfig, client: Arc<dyn InferenceClient>) -> Self {
        Self {
            config,
            client,
            registry: MetricRegistry::new(),
        }
    }

    pub fn config(&self) -> &JudgeConfig {
        &self.config
    }

    pub fn model(&self) -> &str {
        self.config.model.as_deref().unwrap_or_default()
    }

    pub fn registry(&self) -> &MetricRegistry {
        &self.registry
    }

    /// Run one evaluation
    pub async fn evaluate(&self, request: EvaluateRequest) -> Result<EvaluationResult> {
        let metric = match &request.metric {
            None => None,
            Some(MetricSelector::Name(name)) => Some(self.registry.get(name)?),
            Some(MetricSelector::Inline(def)) => Some(Arc::clone(def)),
        };

        match metric.as_deref() {
            Some(MetricDef::ModelSpecific(m)) => self.evaluate_model_specific(m, &request).await,
            Some(MetricDef::Standard(m)) => self.evaluate_standard(Some(m), &request).await,
            None => self.evaluate_standard(None, &request).await,
        }
    }

    async fn evaluate_model_specific(
        &self,
        metric: &ModelSpecificMetric,
        request: &EvaluateRequest,
    ) -> Result<EvaluationResult> {
        let messages = match &request.content {
            Content::Comparison { .. } => {
                return Err(JudgeError::InvalidInput(
                    "Model-specific metrics only support text or conversation content".to_string(),
                ));
            }
            Content::Text(text) => vec![Message::user(text.clone())],
            Content::Conversation(turns) => {
                request.content.validate()?;
                turns.clone()
            }
        };

        info!(
            "Metric '{}' expects a {} type model; use a standard metric for other models",
            metric.name, metric.model_pattern
        );

        let mut sampling_params = metric.sampling_params.clone();
        sampling_params.extend(request.sampling_params.clone());

        let output = self
            .call_model(&messages, &sampling_params, metric.return_choices)
            .await?;
        Ok((metric.parser)(&output))
    }

    async fn evaluate_standard(
        &self,
        metric: Option<&Metric>,
        request: &EvaluateRequest,
    ) -> Result<EvaluationResult> {
        request.content.validate()?;
        let params = ResolvedParams::merge(request, metric)?.render()?;

        let spec = PromptSpec {
            input: params.input.as_deref(),
            rubric: params.rubric.as_ref(),
            scale: params.scale,
            examples: &params.examples,
            system_prompt: params.system_prompt.as_deref(),
            context: params.context.as_deref(),
            additional_instructions: params.additional_instructions.as_deref(),
            ..PromptSpec::new(&request.content, &params.criteria)
        };
        let messages = build_messages(&spec)?;

        let raw = self
            .call_model(&messages, &request.sampling_params, false)
            .await?
            .into_text();
        let mut result = parse_response(&raw, self.model())?;

        if !params.template_vars.is_empty() {
            result
                .metadata
                .insert("template_vars".to_string(), Value::Object(params.template_vars));
            result.metadata.insert(
                "template_engine".to_string(),
                Value::String(params.template_engine.as_str().to_string()),
            );
        }

        Ok(result)
    }

    /// The single suspension point of an evaluation
    async fn call_model(
        &self,
        messages: &[Message],
        sampling_params: &Map<String, Value>,
        return_choices: bool,
    ) -> Result<ModelOutput> {
        if sampling_params
            .get("n")
            .and_then(Value::as_f64)
            .is_some_and(|n| n > 1.0)
        {
            return Err(JudgeError::InvalidInput("n > 1 is not supported".to_string()));
        }

        let output = if self.config.use_chat_api {
            self.client
                .chat_completion(messages, sampling_params, return_choices)
                .await
        } else {
            let prompt = format_messages_as_text(messages);
            debug!("Using completions API ({} chars)", prompt.len());
            self.client
                .completion(&prompt, sampling_params, return_choices)
                .await
        };

        output.map_err(|e| JudgeError::ModelCall(Box::new(e)))
    }

    /// Score text against `criteria` on a numeric scale (1-10 by default)
    pub async fn score(
        &self,
        criteria: &str,
        content: impl Into<Content>,
        input: Option<&str>,
        scale: Option<Scale>,
    ) -> Result<EvaluationResult> {
        let (min, max) = scale.unwrap_or(DEFAULT_SCALE);
        let mut request = EvaluateRequest::new(content).criteria(criteria).scale(min, max);
        request.input = input.map(str::to_string);
        self.evaluate(request).await
    }

    /// Judge an answer to a question
    pub async fn qa_evaluate(
        &self,
        question: &str,
        answer: &str,
        criteria: Option<&str>,
        scale: Option<Scale>,
    ) -> Result<EvaluationResult> {
        let (min, max) = scale.unwrap_or(DEFAULT_SCALE);
        let request = EvaluateRequest::new(answer)
            .input(question)
            .criteria(criteria.unwrap_or("accuracy and completeness"))
            .scale(min, max);
        self.evaluate(request).await
    }

    /// Pick the better of two responses
    pub async fn compare(
        &self,
        response_a: &str,
        response_b: &str,
        criteria: &str,
        input: Option<&str>,
    ) -> Result<EvaluationResult> {
        let mut request =
            EvaluateRequest::new(Content::comparison(response_a, response_b)).criteria(criteria);
        request.input = input.map(str::to_string);
        self.evaluate(request).await
    }

    /// Assign one of `categories`
    pub async fn classify(
        &self,
        content: impl Into<Content>,
        categories: &[&str],
        criteria: Option<&str>,
        input: Option<&str>,
    ) -> Result<EvaluationResult> {
        let mut request = EvaluateRequest::new(content)
            .criteria(criteria.unwrap_or("appropriate category"))
            .rubric(format!(
                "Classify into one of these categories: {}",
                categories.join(", ")
            ));
        request.input = input.map(str::to_string);
        self.evaluate(request).await
    }

    pub fn register_metric(&self, metric: impl Into<MetricDef>) {
        self.registry.register(metric);
    }

    pub fn get_metric(&self, name: &str) -> Result<Arc<MetricDef>> {
        self.registry.get(name)
    }

    pub fn list_metrics(&self) -> Vec<String> {
        self.registry.list()
    }

    /// Evaluate many requests with bounded concurrency
    ///
    /// `max_concurrent` defaults to the configured limit.
    pub async fn batch_evaluate(
        &self,
        requests: Vec<EvaluateRequest>,
        max_concurrent: Option<usize>,
        progress: Option<&ProgressCallback>,
    ) -> BatchResult {
        let options = BatchOptions {
            max_concurrent: max_concurrent.unwrap_or(self.config.max_concurrent),
            ..Default::default()
        };
        BatchProcessor::new(self, options).process(requests, progress).await
    }

    /// Score many responses; fails with the first item error
    pub async fn batch_score(
        &self,
        responses: Vec<String>,
        criteria: &str,
        scale: Option<Scale>,
    ) -> Result<Vec<EvaluationResult>> {
        let (min, max) = scale.unwrap_or(DEFAULT_SCALE);
        let requests = responses
            .into_iter()
            .map(|response| EvaluateRequest::new(response).criteria(criteria).scale(min, max))
            .collect();

        self.batch_evaluate(requests, None, None)
            .await
            .results
            .into_iter()
            .map(|outcome| outcome.map_err(|e| e.error))
            .collect()
    }
}
