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

//! Built-in metric catalog
//!
//! Standard metrics are data in `builtin_metrics.toml`; the guardian-model
//! metrics need parser functions and are declared here.

use crate::metrics::{Metric, MetricDef, ModelSpecificMetric};
use crate::parsers::{parse_granite_guardian_3_2, parse_llama_guard_3};
use serde::Deserialize;
use serde_json::{json, Map, Value};
use std::sync::{Arc, LazyLock};

const CATALOG: &str = include_str!("builtin_metrics.toml");

#[derive(Debug, Deserialize)]
struct Catalog {
    #[serde(default)]
    additional_instructions: Option<String>,
    metrics: Vec<Metric>,
}

static BUILTIN_METRICS: LazyLock<Vec<Arc<MetricDef>>> = LazyLock::new(load_catalog);

/// All built-in metrics in catalog order
pub fn builtin_metrics() -> &'static [Arc<MetricDef>] {
    BUILTIN_METRICS.as_slice()
}

fn guardian_metrics() -> Vec<ModelSpecificMetric> {
    let mut granite_params = Map::new();
    granite_params.insert("top_logprobs".to_string(), json!(20));
    granite_params.insert("logprobs".to_string(), Value::Bool(true));

    vec![
        ModelSpecificMetric::new("llama_guard_3_safety", "llama_guard_3", parse_llama_guard_3),
        ModelSpecificMetric::new(
            "granite_guardian_3_2",
            "granite_guardian_3_2",
            parse_granite_guardian_3_2,
        )
        .with_sampling_params(granite_params)
        .with_return_choices(true),
    ]
}

fn parse_catalog(source: &str) -> Result<Vec<Metric>, toml::de::Error> {
    let catalog: Catalog = toml::from_str(source)?;
    let shared = catalog.additional_instructions;

    Ok(catalog
        .metrics
        .into_iter()
        .map(|mut metric| {
            if metric.additional_instructions.is_none() {
                metric.additional_instructions = shared.clone();
            }
            metric.with_detected_vars()
        })
        .collect())
}

fn load_catalog() -> Vec<Arc<MetricDef>> {
    let mut all: Vec<Arc<MetricDef>> = guardian_metrics()
        .into_iter()
        .map(|m| Arc::new(MetricDef::ModelSpecific(m)))
        .collect();

    match parse_catalog(CATALOG) {
        Ok(metrics) => all.extend(metrics.into_iter().map(|m| Arc::new(MetricDef::Standard(m)))),
        Err(e) => tracing::error!("Failed to load built-in metric catalog: {}", e),
    }

    all
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Rubric;
    use crate::templating::TemplateEngine;

    fn standard(name: &str) -> Metric {
        builtin_metrics()
            .iter()
            .find(|m| m.name() == name)
            .and_then(|m| m.as_standard().cloned())
            .unwrap_or_else(|| panic!("missing builtin {}", name))
    }

    #[test]
    fn test_catalog_parses() {
        let metrics = parse_catalog(CATALOG).unwrap();
        assert!(metrics.len() >= 30);
    }

    #[test]
    fn test_catalog_order() {
        let names: Vec<&str> = builtin_metrics().iter().map(|m| m.name()).collect();
        assert_eq!(&names[..4], &["llama_guard_3_safety", "granite_guardian_3_2", "helpfulness", "accuracy"]);
        assert_eq!(names.last(), Some(&"summarization_quality"));
    }

    #[test]
    fn test_guardian_metrics_are_model_specific() {
        let granite = builtin_metrics()
            .iter()
            .find(|m| m.name() == "granite_guardian_3_2")
            .unwrap();
        match granite.as_ref() {
            MetricDef::ModelSpecific(m) => {
                assert!(m.return_choices);
                assert_eq!(m.sampling_params["top_logprobs"], json!(20));
            }
            MetricDef::Standard(_) => panic!("granite should be model specific"),
        }
    }

    #[test]
    fn test_shared_additional_instructions() {
        let helpfulness = standard("helpfulness");
        assert!(helpfulness
            .additional_instructions
            .unwrap()
            .contains("decision label"));
        assert_eq!(helpfulness.examples.len(), 1);
        match helpfulness.rubric {
            Some(Rubric::Levels(levels)) => assert_eq!(levels.len(), 11),
            other => panic!("unexpected rubric {:?}", other),
        }
    }

    #[test]
    fn test_templated_metrics() {
        let code_review = standard("code_review_template");
        assert_eq!(code_review.required_vars, vec!["language", "purpose"]);
        assert_eq!(code_review.template_vars["environment"], json!("production"));

        let medical = standard("medical_info_template");
        assert_eq!(medical.template_engine, TemplateEngine::Jinja2);
        assert!(medical.criteria.contains("{% if target_audience"));
    }

    #[test]
    fn test_response_alias_in_examples() {
        let medical = standard("medical_accuracy");
        assert!(medical.examples[0].content.is_some());
    }
}
