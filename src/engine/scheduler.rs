use crate::core::error::EngineError;
use crate::core::types::{
    BatchEntry, BatchReport, ExecutionLogEntry, FailureRecord, MarketDescriptor, MarketOutcome,
};
use crate::engine::pipeline::{PipelineDeps, PipelineOptions, run_pipeline};
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, error, info, info_span, warn};

/// Backoff schedule for transient provider failures: 2s, 4s, 8s... capped.
const BACKOFF_INITIAL: Duration = Duration::from_secs(2);
const BACKOFF_CAP: Duration = Duration::from_secs(30);
const MAX_TASK_RETRIES: u32 = 3;

/// Fans the per-market pipeline out over a bounded pool of concurrent tasks,
/// each with its own sandbox. One market's failure never touches another's.
pub struct BatchScheduler {
    deps: PipelineDeps,
    opts: PipelineOptions,
    concurrency: usize,
    pipeline_timeout: Duration,
}

impl BatchScheduler {
    pub fn new(
        deps: PipelineDeps,
        opts: PipelineOptions,
        concurrency: usize,
        pipeline_timeout: Duration,
    ) -> Self {
        Self {
            deps,
            opts,
            concurrency: concurrency.max(1),
            pipeline_timeout,
        }
    }

    /// Run every market to completion (or failure) and report in selection
    /// order. Tasks start in order, finish in any order; the semaphore keeps
    /// live sandboxes at or under the concurrency cap.
    pub async fn run_batch(
        &self,
        label: &str,
        markets: Vec<MarketDescriptor>,
        cancel: CancellationToken,
    ) -> BatchReport {
        let started_at = Utc::now();
        let semaphore = Arc::new(Semaphore::new(self.concurrency));
        let mut tasks: JoinSet<(usize, BatchEntry)> = JoinSet::new();

        info!(markets = markets.len(), concurrency = self.concurrency, "starting batch");

        for (index, market) in markets.iter().cloned().enumerate() {
            let deps = self.deps.clone();
            let opts = self.opts.clone();
            let semaphore = semaphore.clone();
            let cancel = cancel.clone();
            let pipeline_timeout = self.pipeline_timeout;
            let slug = market.effective_slug();
            let span = info_span!("pipeline", %slug);

            tasks.spawn(
                async move {
                    metrics::counter!("polysim_pipelines_total").increment(1);
                    let outcome = run_task(
                        &deps,
                        &opts,
                        &market,
                        semaphore,
                        pipeline_timeout,
                        &cancel,
                    )
                    .await;
                    match &outcome {
                        MarketOutcome::Completed(_) => {
                            metrics::counter!("polysim_pipelines_succeeded_total").increment(1)
                        }
                        MarketOutcome::Failed(f) => {
                            metrics::counter!("polysim_pipelines_failed_total").increment(1);
                            error!(slug = %f.slug, kind = %f.kind, reason = %f.reason, "pipeline failed");
                        }
                    }
                    (
                        index,
                        BatchEntry {
                            slug: market.effective_slug(),
                            question: market.question.clone(),
                            outcome,
                        },
                    )
                }
                .instrument(span),
            );
        }

        // Completions arrive in arbitrary order; the report keeps selection
        // order by index.
        let mut slots: Vec<Option<BatchEntry>> = (0..markets.len()).map(|_| None).collect();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((index, entry)) => slots[index] = Some(entry),
                Err(panic) => error!(?panic, "pipeline task panicked"),
            }
        }

        let entries = slots
            .into_iter()
            .enumerate()
            .map(|(i, slot)| {
                // A panicked task takes its log buffer down with it; this
                // backstop record is the one failure with no attempt history.
                slot.unwrap_or_else(|| BatchEntry {
                    slug: markets[i].effective_slug(),
                    question: markets[i].question.clone(),
                    outcome: MarketOutcome::Failed(FailureRecord {
                        slug: markets[i].effective_slug(),
                        kind: "panic".to_string(),
                        reason: "pipeline task panicked".to_string(),
                        execution_log: Vec::new(),
                    }),
                })
            })
            .collect();

        BatchReport {
            label: label.to_string(),
            started_at,
            entries,
        }
    }
}

/// One market's task: bounded retries with exponential backoff on transient
/// provider failures, sandbox acquired and released inside each attempt.
async fn run_task(
    deps: &PipelineDeps,
    opts: &PipelineOptions,
    market: &MarketDescriptor,
    semaphore: Arc<Semaphore>,
    pipeline_timeout: Duration,
    cancel: &CancellationToken,
) -> MarketOutcome {
    let slug = market.effective_slug();

    let mut backoff = BACKOFF_INITIAL;
    let mut last_err = (
        EngineError::SandboxUnavailable("task retries exhausted".to_string()),
        Vec::new(),
    );
    for attempt in 0..=MAX_TASK_RETRIES {
        // Hold a permit for the whole attempt: the cap bounds live sandboxes.
        let permit = tokio::select! {
            p = semaphore.clone().acquire_owned() => match p {
                Ok(p) => p,
                Err(_) => return failure(&slug, &EngineError::Cancelled, Vec::new()),
            },
            _ = cancel.cancelled() => return failure(&slug, &EngineError::Cancelled, Vec::new()),
        };

        if cancel.is_cancelled() {
            return failure(&slug, &EngineError::Cancelled, Vec::new());
        }

        let result = run_task_once(deps, opts, market, pipeline_timeout, cancel).await;
        drop(permit);

        match result {
            Ok(result) => return MarketOutcome::Completed(Box::new(result)),
            Err((e, log)) if e.is_transient() && attempt < MAX_TASK_RETRIES => {
                warn!(%slug, attempt, error = %e, "transient failure, backing off");
                last_err = (e, log);
                tokio::select! {
                    _ = tokio::time::sleep(backoff) => {}
                    _ = cancel.cancelled() => return failure(&slug, &EngineError::Cancelled, Vec::new()),
                }
                backoff = (backoff * 2).min(BACKOFF_CAP);
            }
            Err((e, log)) => return failure(&slug, &e, log),
        }
    }
    let (err, log) = last_err;
    failure(&slug, &err, log)
}

async fn run_task_once(
    deps: &PipelineDeps,
    opts: &PipelineOptions,
    market: &MarketDescriptor,
    pipeline_timeout: Duration,
    cancel: &CancellationToken,
) -> Result<crate::core::types::PipelineResult, (EngineError, Vec<ExecutionLogEntry>)> {
    let sandbox = match deps.sandbox_client.acquire().await {
        Ok(s) => s,
        Err(e) => return Err((e, Vec::new())),
    };

    // Release on every path: success, error, timeout, or cancellation. The
    // log buffer lives outside the timeout so attempts made before the wall
    // clock expired still reach the failure record.
    let mut execution_log = Vec::new();
    let result = tokio::time::timeout(
        pipeline_timeout,
        run_pipeline(
            sandbox.as_ref(),
            deps,
            market,
            opts,
            cancel,
            &mut execution_log,
        ),
    )
    .await;
    sandbox.release().await;

    match result {
        Ok(Ok(result)) => Ok(result),
        Ok(Err(e)) => Err((e, execution_log)),
        Err(_elapsed) => Err((
            EngineError::PipelineTimeout {
                budget: pipeline_timeout,
            },
            execution_log,
        )),
    }
}

fn failure(slug: &str, err: &EngineError, execution_log: Vec<ExecutionLogEntry>) -> MarketOutcome {
    MarketOutcome::Failed(FailureRecord {
        slug: slug.to_string(),
        kind: err.kind_tag().to_string(),
        reason: err.to_string(),
        execution_log,
    })
}
