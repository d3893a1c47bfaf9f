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

//! vLLM Judge CLI
//!
//! Command-line front end for running evaluations against a vLLM server.

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use serde_json::{Map, Value};
use std::path::{Path, PathBuf};
use tracing::{debug, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use vllm_judge::models::format_level;
use vllm_judge::{
    requests_from_json, EvaluateRequest, EvaluationResult, Judge, JudgeConfig, MetricDef,
    MetricRegistry, ProgressCallback, Scale, TemplateVars,
};

#[derive(Parser)]
#[command(name = "vllm-judge")]
#[command(about = "vLLM Judge - LLM-as-a-Judge evaluation tool", long_about = None)]
struct Cli {
    /// Verbose mode
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Args, Clone, Debug, Default)]
struct ConnectionArgs {
    /// vLLM server URL
    #[arg(long, env = "VLLM_JUDGE_BASE_URL")]
    base_url: Option<String>,

    /// Model name (auto-detected if not provided)
    #[arg(long, env = "VLLM_JUDGE_MODEL")]
    model: Option<String>,

    /// Path to a TOML configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Request timeout in seconds
    #[arg(long)]
    timeout: Option<f64>,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, ValueEnum)]
enum OutputFormat {
    #[default]
    Text,
    Json,
}

#[derive(Subcommand)]
enum Commands {
    /// Evaluate a single response
    Evaluate {
        #[command(flatten)]
        connection: ConnectionArgs,

        /// Text to evaluate
        #[arg(long)]
        content: String,

        /// Input/question/prompt that the content responds to
        #[arg(long)]
        input: Option<String>,

        /// Evaluation criteria
        #[arg(long)]
        criteria: Option<String>,

        /// Pre-defined metric name
        #[arg(long)]
        metric: Option<String>,

        /// Numeric scale
        #[arg(long, num_args = 2, value_names = ["MIN", "MAX"])]
        scale: Option<Vec<f64>>,

        /// Evaluation rubric
        #[arg(long)]
        rubric: Option<String>,

        /// Additional context
        #[arg(long)]
        context: Option<String>,

        /// Template variable for templated metrics (repeatable)
        #[arg(long = "var", value_name = "KEY=VALUE", value_parser = parse_var)]
        vars: Vec<(String, String)>,

        #[arg(long, value_enum, default_value_t = OutputFormat::Text)]
        output: OutputFormat,
    },

    /// Evaluate an answer to a question
    QaEvaluate {
        #[command(flatten)]
        connection: ConnectionArgs,

        #[arg(long)]
        question: String,

        #[arg(long)]
        answer: String,

        #[arg(long, default_value = "accuracy and completeness")]
        criteria: String,

        /// Numeric scale (default: 1 10)
        #[arg(long, num_args = 2, value_names = ["MIN", "MAX"])]
        scale: Option<Vec<f64>>,

        #[arg(long, value_enum, default_value_t = OutputFormat::Text)]
        output: OutputFormat,
    },

    /// Compare two responses
    Compare {
        #[command(flatten)]
        connection: ConnectionArgs,

        #[arg(long)]
        response_a: String,

        #[arg(long)]
        response_b: String,

        /// Comparison criteria
        #[arg(long)]
        criteria: String,

        /// Input/question that both responses address
        #[arg(long)]
        input: Option<String>,

        #[arg(long, value_enum, default_value_t = OutputFormat::Text)]
        output: OutputFormat,
    },

    /// List built-in metrics
    ListMetrics {
        /// Only show metrics whose name contains this text
        #[arg(long)]
        filter: Option<String>,
    },

    /// Run a batch evaluation from a JSON file
    Batch {
        #[command(flatten)]
        connection: ConnectionArgs,

        /// JSON array of evaluation requests
        #[arg(long)]
        file: PathBuf,

        /// Maximum concurrent requests
        #[arg(long)]
        max_concurrent: Option<usize>,

        /// Output file (default: stdout)
        #[arg(long)]
        output: Option<PathBuf>,
    },
}

fn parse_var(raw: &str) -> std::result::Result<(String, String), String> {
    match raw.split_once('=') {
        Some((key, value)) if !key.trim().is_empty() => {
            Ok((key.trim().to_string(), value.to_string()))
        }
        _ => Err(format!("expected KEY=VALUE, got '{}'", raw)),
    }
}

fn to_scale(values: Option<Vec<f64>>) -> Option<Scale> {
    match values.as_deref() {
        Some([min, max]) => Some((*min, *max)),
        _ => None,
    }
}

/// Config file and environment first, then command-line overrides
fn build_config(args: &ConnectionArgs) -> Result<JudgeConfig> {
    let mut config = JudgeConfig::load(args.config.clone()).context("Failed to load configuration")?;
    if let Some(base_url) = &args.base_url {
        config.base_url = base_url.clone();
    }
    if let Some(model) = &args.model {
        config = config.with_model(model.clone());
    }
    if let Some(timeout) = args.timeout {
        config = config.with_timeout(timeout);
    }
    config.normalized().context("Invalid configuration")
}

async fn connect(args: &ConnectionArgs) -> Result<Judge> {
    let config = build_config(args)?;
    info!("Connecting to {}", config.base_url);
    Judge::connect(config)
        .await
        .context("Failed to connect to vLLM server")
}

fn print_result(result: &EvaluationResult, output: OutputFormat) -> Result<()> {
    match output {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(result)?),
        OutputFormat::Text => {
            println!("Decision: {}", result.decision);
            if let Some(score) = result.score {
                println!("Score: {}", score);
            }
            println!("Reasoning: {}", result.reasoning);
        }
    }
    Ok(())
}

fn list_metrics(filter: Option<&str>) -> Result<()> {
    let registry = MetricRegistry::new();
    let filter = filter.map(str::to_lowercase);

    for name in registry.list() {
        if filter.as_ref().is_some_and(|f| !name.to_lowercase().contains(f)) {
            continue;
        }
        println!("\n{}:", name);
        match registry.get(&name)?.as_ref() {
            MetricDef::Standard(metric) => {
                println!("  Criteria: {}", metric.criteria.trim());
                if let Some((min, max)) = metric.scale {
                    println!("  Scale: {}-{}", format_level(min), format_level(max));
                }
                let has_rubric = metric.rubric.as_ref().is_some_and(|r| !r.is_empty());
                println!("  Has rubric: {}", if has_rubric { "Yes" } else { "No" });
                println!("  Examples: {}", metric.examples.len());
                if !metric.required_vars.is_empty() {
                    println!("  Required vars: {}", metric.required_vars.join(", "));
                }
            }
            MetricDef::ModelSpecific(metric) => {
                println!("  Model: {}", metric.model_pattern);
            }
        }
    }
    Ok(())
}

async fn run_batch(
    connection: &ConnectionArgs,
    file: &Path,
    max_concurrent: Option<usize>,
    output: Option<&Path>,
) -> Result<()> {
    let text = std::fs::read_to_string(file)
        .with_context(|| format!("Failed to read batch file {:?}", file))?;
    let data: Value = serde_json::from_str(&text).context("Error parsing JSON")?;
    let Value::Array(items) = data else {
        bail!("Batch file must contain a JSON array");
    };
    let requests = requests_from_json(items, &Map::new())?;

    let judge = connect(connection).await?;
    eprintln!("Running batch evaluation of {} items...", requests.len());

    let progress: &ProgressCallback = &|done, total| debug!("Progress: {}/{}", done, total);
    let batch = judge
        .batch_evaluate(requests, max_concurrent, Some(progress))
        .await;

    let rendered = serde_json::to_string_pretty(&batch.to_json())?;
    match output {
        Some(path) => {
            std::fs::write(path, rendered)
                .with_context(|| format!("Failed to write {:?}", path))?;
            eprintln!("Results written to {:?}", path);
        }
        None => println!("{}", rendered),
    }

    eprintln!("\nSummary:");
    eprintln!("  Total: {}", batch.total);
    eprintln!("  Successful: {}", batch.successful);
    eprintln!("  Failed: {}", batch.failed);
    eprintln!("  Success rate: {:.1}%", batch.success_rate() * 100.0);
    let scores: Vec<f64> = batch.successes().filter_map(|r| r.score).collect();
    if !scores.is_empty() {
        eprintln!(
            "  Average score: {:.2}",
            scores.iter().sum::<f64>() / scores.len() as f64
        );
    }
    eprintln!("  Duration: {:.1}s", batch.duration_seconds);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let default_filter = if cli.verbose {
        "vllm_judge=debug"
    } else {
        "vllm_judge=info"
    };
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| default_filter.into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    match cli.command {
        Commands::Evaluate {
            connection,
            content,
            input,
            criteria,
            metric,
            scale,
            rubric,
            context,
            vars,
            output,
        } => {
            let mut request = EvaluateRequest::new(content);
            request.input = input;
            request.criteria = criteria;
            request.context = context;
            request.scale = to_scale(scale);
            request.rubric = rubric.map(Into::into);
            request.metric = metric.map(Into::into);
            request.template_vars = vars
                .into_iter()
                .map(|(k, v)| (k, Value::String(v)))
                .collect::<TemplateVars>();

            let judge = connect(&connection).await?;
            let result = judge.evaluate(request).await?;
            print_result(&result, output)?;
        }

        Commands::QaEvaluate {
            connection,
            question,
            answer,
            criteria,
            scale,
            output,
        } => {
            let judge = connect(&connection).await?;
            let result = judge
                .qa_evaluate(&question, &answer, Some(&criteria), to_scale(scale))
                .await?;
            if output == OutputFormat::Text {
                println!("Question: {}", question);
                println!("Answer: {}", answer);
            }
            print_result(&result, output)?;
        }

        Commands::Compare {
            connection,
            response_a,
            response_b,
            criteria,
            input,
            output,
        } => {
            let judge = connect(&connection).await?;
            let result = judge
                .compare(&response_a, &response_b, &criteria, input.as_deref())
                .await?;
            match output {
                OutputFormat::Json => print_result(&result, output)?,
                OutputFormat::Text => {
                    if let Some(input) = &input {
                        println!("Input: {}", input);
                    }
                    println!("Response A: {}", response_a);
                    println!("Response B: {}", response_b);
                    println!("Winner: {}", result.decision);
                    println!("Reasoning: {}", result.reasoning);
                }
            }
        }

        Commands::ListMetrics { filter } => list_metrics(filter.as_deref())?,

        Commands::Batch {
            connection,
            file,
            max_concurrent,
            output,
        } => run_batch(&connection, &file, max_concurrent, output.as_deref()).await?,
    }

    Ok(())
}
