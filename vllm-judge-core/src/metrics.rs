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

//! Reusable evaluation configurations and the name → metric registry

use crate::builtin_metrics::builtin_metrics;
use crate::client::ModelOutput;
use crate::error::{JudgeError, Result};
use crate::models::{EvaluationResult, Example, Rubric, Scale};
use crate::templating::{get_required_vars, TemplateEngine, TemplateVars};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;
use tracing::info;

/// Ordinary metric: goes through prompt construction and generic parsing
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Metric {
    pub name: String,

    /// What to evaluate for; may embed placeholders
    pub criteria: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rubric: Option<Rubric>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scale: Option<Scale>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub examples: Vec<Example>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system_prompt: Option<String>,

    /// Default values for placeholders
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub template_vars: TemplateVars,

    /// Placeholders the caller must supply
    #[serde(default)]
    pub required_vars: Vec<String>,

    #[serde(default)]
    pub template_engine: TemplateEngine,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub additional_instructions: Option<String>,
}

impl Metric {
    pub fn builder(name: impl Into<String>) -> MetricBuilder {
        MetricBuilder::new(name)
    }

    /// Placeholders in criteria, rubric and system prompt not covered by defaults
    pub fn detect_required_vars(&self) -> Vec<String> {
        let mut names: BTreeSet<String> = get_required_vars(&self.criteria, self.template_engine);
        names.extend(get_required_vars(&self.rubric, self.template_engine));
        names.extend(get_required_vars(&self.system_prompt, self.template_engine));
        names
            .into_iter()
            .filter(|name| !self.template_vars.contains_key(name))
            .collect()
    }

    /// Fill `required_vars` by scanning when the author left it empty
    pub fn with_detected_vars(mut self) -> Self {
        if self.required_vars.is_empty() {
            self.required_vars = self.detect_required_vars();
        }
        self
    }
}

/// Builder for [`Metric`]
#[derive(Debug, Clone)]
pub struct MetricBuilder {
    metric: Metric,
    explicit_required: bool,
}

impl MetricBuilder {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            metric: Metric {
                name: name.into(),
                ..Default::default()
            },
            explicit_required: false,
        }
    }

    pub fn criteria(mut self, criteria: impl Into<String>) -> Self {
        self.metric.criteria = criteria.into();
        self
    }

    pub fn rubric(mut self, rubric: impl Into<Rubric>) -> Self {
        self.metric.rubric = Some(rubric.into());
        self
    }

    pub fn scale(mut self, min: f64, max: f64) -> Self {
        self.metric.scale = Some((min, max));
        self
    }

    pub fn example(mut self, example: Example) -> Self {
        self.metric.examples.push(example);
        self
    }

    pub fn examples(mut self, examples: Vec<Example>) -> Self {
        self.metric.examples = examples;
        self
    }

    pub fn system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.metric.system_prompt = Some(prompt.into());
        self
    }

    pub fn template_var(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.metric.template_vars.insert(key.into(), value.into());
        self
    }

    pub fn template_vars(mut self, vars: TemplateVars) -> Self {
        self.metric.template_vars = vars;
        self
    }

    /// Explicit list; disables auto-detection
    pub fn required_vars<I, S>(mut self, vars: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.metric.required_vars = vars.into_iter().map(Into::into).collect();
        self.explicit_required = true;
        self
    }

    pub fn template_engine(mut self, engine: TemplateEngine) -> Self {
        self.metric.template_engine = engine;
        self
    }

    pub fn additional_instructions(mut self, text: impl Into<String>) -> Self {
        self.metric.additional_instructions = Some(text.into());
        self
    }

    pub fn build(self) -> Metric {
        if self.explicit_required {
            self.metric
        } else {
            self.metric.with_detected_vars()
        }
    }
}

/// Parser for one model family's native output convention
pub type ResponseParser = fn(&ModelOutput) -> EvaluationResult;

/// Metric that skips prompt construction and hands raw output to `parser`
#[derive(Clone)]
pub struct ModelSpecificMetric {
    pub name: String,
    /// Model family this metric is designed for
    pub model_pattern: String,
    pub parser: ResponseParser,
    /// Overlay merged into the request (e.g. logprobs settings)
    pub sampling_params: Map<String, Value>,
    /// Ask the transport for raw choice objects instead of text
    pub return_choices: bool,
}

impl ModelSpecificMetric {
    pub fn new(
        name: impl Into<String>,
        model_pattern: impl Into<String>,
        parser: ResponseParser,
    ) -> Self {
        Self {
            name: name.into(),
            model_pattern: model_pattern.into(),
            parser,
            sampling_params: Map::new(),
            return_choices: false,
        }
    }

    pub fn with_sampling_params(mut self, params: Map<String, Value>) -> Self {
        self.sampling_params = params;
        self
    }

    pub fn with_return_choices(mut self, return_choices: bool) -> Self {
        self.return_choices = return_choices;
        self
    }
}

impl fmt::Debug for ModelSpecificMetric {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ModelSpecificMetric")
            .field("name", &self.name)
            .field("model_pattern", &self.model_pattern)
            .field("sampling_params", &self.sampling_params)
            .field("return_choices", &self.return_choices)
            .finish_non_exhaustive()
    }
}

/// A registry entry
#[derive(Debug, Clone)]
pub enum MetricDef {
    Standard(Metric),
    ModelSpecific(ModelSpecificMetric),
}

impl MetricDef {
    pub fn name(&self) -> &str {
        match self {
            MetricDef::Standard(m) => &m.name,
            MetricDef::ModelSpecific(m) => &m.name,
        }
    }

    pub fn as_standard(&self) -> Option<&Metric> {
        match self {
            MetricDef::Standard(m) => Some(m),
            MetricDef::ModelSpecific(_) => None,
        }
    }
}

impl From<Metric> for MetricDef {
    fn from(metric: Metric) -> Self {
        MetricDef::Standard(metric)
    }
}

impl From<ModelSpecificMetric> for MetricDef {
    fn from(metric: ModelSpecificMetric) -> Self {
        MetricDef::ModelSpecific(metric)
    }
}

/// Name → metric lookup with a caller overlay on top of the built-in catalog
///
/// Registration is an upsert; the overlay is consulted before built-ins.
pub struct MetricRegistry {
    builtins: &'static [Arc<MetricDef>],
    custom: RwLock<Vec<Arc<MetricDef>>>,
}

impl MetricRegistry {
    /// Registry backed by the built-in catalog
    pub fn new() -> Self {
        Self {
            builtins: builtin_metrics(),
            custom: RwLock::new(Vec::new()),
        }
    }

    /// Registry with no built-ins
    pub fn empty() -> Self {
        Self {
            builtins: &[],
            custom: RwLock::new(Vec::new()),
        }
    }

    /// Register or replace a metric by name
    pub fn register(&self, metric: impl Into<MetricDef>) {
        let metric = Arc::new(metric.into());
        let mut custom = self.custom.write();

        match custom.iter_mut().find(|m| m.name() == metric.name()) {
            Some(slot) => {
                info!("Replaced registered metric: {}", metric.name());
                *slot = metric;
            }
            None => {
                info!("Registered metric: {}", metric.name());
                custom.push(metric);
            }
        }
    }

    pub fn get(&self, name: &str) -> Result<Arc<MetricDef>> {
        if let Some(metric) = self.custom.read().iter().find(|m| m.name() == name) {
            return Ok(Arc::clone(metric));
        }

        if let Some(metric) = self.builtins.iter().find(|m| m.name() == name) {
            return Ok(Arc::clone(metric));
        }

        Err(JudgeError::MetricNotFound(format!(
            "Metric '{}' not found. Available metrics: {}",
            name,
            self.list().join(", ")
        )))
    }

    /// Registered names first, then built-ins in catalog order
    pub fn list(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .custom
            .read()
            .iter()
            .map(|m| m.name().to_string())
            .collect();
        for metric in self.builtins {
            if !names.iter().any(|n| n == metric.name()) {
                names.push(metric.name().to_string());
            }
        }
        names
    }
}

impl Default for MetricRegistry {
    fn default() -> Self {
        Self::new()
    }
}
