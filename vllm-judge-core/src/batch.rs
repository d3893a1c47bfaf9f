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

//! Bounded-concurrency batch evaluation
//!
//! Items run independently: a failing item becomes a [`BatchItemError`] in
//! its slot and never aborts its siblings.

use crate::error::{JudgeError, Result};
use crate::judge::{EvaluateRequest, Judge};
use crate::models::{BatchItemError, BatchOutcome, BatchResult};
use futures::stream::{FuturesUnordered, Stream};
use serde_json::{json, Map, Value};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Instant;
use tokio::sync::Semaphore;
use tracing::{debug, info};

/// Called with `(completed, total)` after each item finishes
pub type ProgressCallback = dyn Fn(usize, usize) + Send + Sync;

pub const DEFAULT_MAX_CONCURRENT: usize = 50;

#[derive(Debug, Clone)]
pub struct BatchOptions {
    /// Upper bound on in-flight model calls
    pub max_concurrent: usize,
    /// Shared sampling overlay; per-item values win
    pub sampling_params: Map<String, Value>,
}

impl Default for BatchOptions {
    fn default() -> Self {
        Self {
            max_concurrent: DEFAULT_MAX_CONCURRENT,
            sampling_params: Map::new(),
        }
    }
}

pub struct BatchProcessor<'a> {
    judge: &'a Judge,
    semaphore: Semaphore,
    sampling_params: Map<String, Value>,
    completed: AtomicUsize,
}

impl<'a> BatchProcessor<'a> {
    pub fn new(judge: &'a Judge, options: BatchOptions) -> Self {
        Self {
            judge,
            semaphore: Semaphore::new(options.max_concurrent.max(1)),
            sampling_params: options.sampling_params,
            completed: AtomicUsize::new(0),
        }
    }

    /// Evaluate every request; results keep input order
    pub async fn process(
        &self,
        requests: Vec<EvaluateRequest>,
        progress: Option<&ProgressCallback>,
    ) -> BatchResult {
        let start = Instant::now();
        let total = requests.len();
        self.completed.store(0, Ordering::SeqCst);

        let futures = requests
            .into_iter()
            .enumerate()
            .map(|(index, request)| self.process_item(index, request, total, progress));
        let results = futures::future::join_all(futures).await;

        let batch = BatchResult::from_outcomes(results, start.elapsed().as_secs_f64());
        info!(
            "Batch complete: {}/{} successful in {:.2}s",
            batch.successful, batch.total, batch.duration_seconds
        );
        batch
    }

    /// Yield `(index, outcome)` pairs in completion order
    pub fn process_streaming<'s>(
        &'s self,
        requests: Vec<EvaluateRequest>,
    ) -> impl Stream<Item = (usize, BatchOutcome)> + 's {
        let total = requests.len();
        self.completed.store(0, Ordering::SeqCst);

        requests
            .into_iter()
            .enumerate()
            .map(|(index, request)| async move {
                (index, self.process_item(index, request, total, None).await)
            })
            .collect::<FuturesUnordered<_>>()
    }

    async fn process_item(
        &self,
        index: usize,
        mut request: EvaluateRequest,
        total: usize,
        progress: Option<&ProgressCallback>,
    ) -> BatchOutcome {
        let outcome = match self.semaphore.acquire().await {
            Ok(_permit) => {
                let mut sampling_params = self.sampling_params.clone();
                sampling_params.extend(std::mem::take(&mut request.sampling_params));
                request.sampling_params = sampling_params;
                self.judge.evaluate(request).await
            }
            Err(e) => Err(JudgeError::Configuration(format!(
                "Batch concurrency limiter closed: {}",
                e
            ))),
        };

        let completed = self.completed.fetch_add(1, Ordering::SeqCst) + 1;
        if let Some(progress) = progress {
            progress(completed, total);
        }

        match outcome {
            Ok(result) => Ok(result.with_metadata("batch_index", json!(index))),
            Err(error) => {
                debug!("Batch item {} failed: {}", index, error);
                Err(BatchItemError { index, error })
            }
        }
    }
}

/// Build requests from JSON objects, each overlaid on `defaults`
pub fn requests_from_json(items: Vec<Value>, defaults: &Map<String, Value>) -> Result<Vec<EvaluateRequest>> {
    items
        .into_iter()
        .enumerate()
        .map(|(index, item)| {
            let Value::Object(fields) = item else {
                return Err(JudgeError::InvalidInput(format!(
                    "Item {} must be a JSON object",
                    index
                )));
            };
            let mut merged = defaults.clone();
            merged.extend(fields);
            serde_json::from_value(Value::Object(merged))
                .map_err(|e| JudgeError::InvalidInput(format!("Item {} is invalid: {}", index, e)))
        })
        .collect()
}
