use crate::core::error::{EngineError, FailureKind};
use crate::core::types::{ExecutionLogEntry, Phase, SimulationArtifact};
use crate::engine::trials::{SMOKE_TIMEOUT, TrialRecord, TrialRunner, tail};
use crate::generator::prompts::RepairRequest;
use crate::generator::{CodeGenerator, structural_violation};
use crate::sandbox::client::ExecResult;
use std::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Diagnostics excerpt handed back to the fixer.
const STDERR_TAIL_BYTES: usize = 2048;

#[derive(Debug)]
pub struct RepairOutcome {
    pub artifact: SimulationArtifact,
    pub used_fallback: bool,
}

/// Generate → execute → repair state machine with a bounded attempt budget.
///
/// The budget is shared across the whole pipeline: the initial establish loop
/// and any later re-entry (a NaN surfacing during calibration) draw from the
/// same counter, which is what bounds total generator invocations.
///
/// Attempt entries go into a caller-owned buffer, so the log survives error
/// returns and reaches the FailureRecord for markets that never produce a
/// result.
pub struct RepairLoop<'a> {
    runner: &'a TrialRunner<'a>,
    generator: &'a CodeGenerator,
    max_retries: u32,
    attempts: u32,
    log: &'a mut Vec<ExecutionLogEntry>,
}

impl<'a> RepairLoop<'a> {
    pub fn new(
        runner: &'a TrialRunner<'a>,
        generator: &'a CodeGenerator,
        max_retries: u32,
        log: &'a mut Vec<ExecutionLogEntry>,
    ) -> Self {
        Self {
            runner,
            generator,
            max_retries,
            attempts: 0,
            log,
        }
    }

    /// Establish a working artifact from the generator's first output.
    pub async fn establish(
        &mut self,
        initial: SimulationArtifact,
        fallback: Option<&SimulationArtifact>,
        cancel: &CancellationToken,
    ) -> Result<RepairOutcome, EngineError> {
        self.run(initial, fallback, cancel).await
    }

    /// Re-enter the loop after a later phase surfaced a repairable failure
    /// (e.g. a NaN metric during calibration). Draws on the remaining budget.
    pub async fn reenter(
        &mut self,
        artifact: &SimulationArtifact,
        classification: FailureKind,
        detail: &str,
        phase: Phase,
        fallback: Option<&SimulationArtifact>,
        cancel: &CancellationToken,
    ) -> Result<RepairOutcome, EngineError> {
        if self.attempts >= self.max_retries {
            return self.exhausted(fallback, detail).await;
        }
        let repaired = match self
            .generator
            .repair(
                artifact,
                &RepairRequest {
                    classification,
                    exit_code: None,
                    stderr_tail: detail.to_string(),
                    phase,
                },
            )
            .await
        {
            Ok(a) => a,
            Err(e) => {
                warn!(error = %e, "repair generation failed");
                return self.exhausted(fallback, &e.to_string()).await;
            }
        };
        self.run(repaired, fallback, cancel).await
    }

    async fn run(
        &mut self,
        mut artifact: SimulationArtifact,
        fallback: Option<&SimulationArtifact>,
        cancel: &CancellationToken,
    ) -> Result<RepairOutcome, EngineError> {
        let mut last_error = String::new();

        while self.attempts < self.max_retries {
            if cancel.is_cancelled() {
                return Err(EngineError::Cancelled);
            }
            self.attempts += 1;
            let attempt = self.attempts;
            metrics::counter!("polysim_repair_attempts_total").increment(1);
            let started = Instant::now();

            // Cheap host-side contract check before spending a sandbox exec.
            let (kind, detail, exit_code) = if let Some(reason) =
                structural_violation(&artifact.code)
            {
                (FailureKind::Structural, reason, None)
            } else {
                let (exec, record) = self.runner.exec_single(&artifact, 0, SMOKE_TIMEOUT).await?;
                match classify_smoke(&exec, record.as_ref()) {
                    Ok(metric) => {
                        self.log.push(ExecutionLogEntry {
                            attempt,
                            phase: Phase::Smoke,
                            classification: None,
                            duration_ms: started.elapsed().as_millis() as u64,
                            detail: format!("metric={metric}"),
                        });
                        info!(attempt, metric, "smoke test passed");
                        return Ok(RepairOutcome {
                            artifact,
                            used_fallback: false,
                        });
                    }
                    Err((kind, detail)) => (kind, detail, Some(exec.exit_code)),
                }
            };
            warn!(attempt, %kind, detail = %tail(&detail, 200), "smoke test failed");
            self.log.push(ExecutionLogEntry {
                attempt,
                phase: Phase::Smoke,
                classification: Some(kind),
                duration_ms: started.elapsed().as_millis() as u64,
                detail: tail(&detail, 200),
            });
            last_error = detail.clone();

            if self.attempts >= self.max_retries {
                break;
            }

            artifact = match self
                .generator
                .repair(
                    &artifact,
                    &RepairRequest {
                        classification: kind,
                        exit_code,
                        stderr_tail: tail(&detail, STDERR_TAIL_BYTES),
                        phase: Phase::Smoke,
                    },
                )
                .await
            {
                Ok(a) => a,
                Err(e) => {
                    warn!(error = %e, "repair generation failed");
                    last_error = e.to_string();
                    break;
                }
            };
        }

        self.exhausted(fallback, &last_error).await
    }

    /// Budget spent. With a baseline artifact the pipeline survives; without
    /// one the task fails.
    async fn exhausted(
        &mut self,
        fallback: Option<&SimulationArtifact>,
        last_error: &str,
    ) -> Result<RepairOutcome, EngineError> {
        let Some(fallback) = fallback else {
            return Err(EngineError::RepairExhausted {
                attempts: self.attempts,
                last_error: tail(last_error, 200),
            });
        };

        let started = Instant::now();
        let (exec, record) = self
            .runner
            .exec_single(fallback, 0, SMOKE_TIMEOUT)
            .await?;
        match classify_smoke(&exec, record.as_ref()) {
            Ok(metric) => {
                info!(metric, "fallback artifact in use");
                self.log.push(ExecutionLogEntry {
                    attempt: self.attempts,
                    phase: Phase::Fallback,
                    classification: None,
                    duration_ms: started.elapsed().as_millis() as u64,
                    detail: "fallback-used".to_string(),
                });
                Ok(RepairOutcome {
                    artifact: fallback.clone(),
                    used_fallback: true,
                })
            }
            Err((kind, detail)) => {
                self.log.push(ExecutionLogEntry {
                    attempt: self.attempts,
                    phase: Phase::Fallback,
                    classification: Some(kind),
                    duration_ms: started.elapsed().as_millis() as u64,
                    detail: tail(&detail, 200),
                });
                Err(EngineError::RepairExhausted {
                    attempts: self.attempts,
                    last_error: format!("fallback also failed: {}", tail(&detail, 200)),
                })
            }
        }
    }
}

/// Map one smoke execution onto the repair taxonomy.
fn classify_smoke(
    exec: &ExecResult,
    record: Option<&TrialRecord>,
) -> Result<f64, (FailureKind, String)> {
    if exec.timed_out {
        return Err((FailureKind::Timeout, "trial exceeded its timeout".into()));
    }
    if exec.exit_code != 0 {
        let stderr = tail(&exec.stderr, STDERR_TAIL_BYTES);
        let kind = if stderr.contains("SyntaxError") || stderr.contains("IndentationError") {
            FailureKind::Parse
        } else {
            FailureKind::Runtime
        };
        return Err((kind, stderr));
    }
    match record {
        Some(rec) => match (rec.metric, &rec.error) {
            (Some(metric), _) if metric.is_finite() => Ok(metric),
            (Some(_), _) => Err((FailureKind::NonFinite, "metric not finite".into())),
            (None, Some(err)) if err.contains("non-finite") => {
                Err((FailureKind::NonFinite, err.clone()))
            }
            (None, Some(err)) => Err((FailureKind::Runtime, err.clone())),
            (None, None) => Err((FailureKind::Runtime, "trial produced no metric".into())),
        },
        None => Err((
            FailureKind::Runtime,
            "trial produced no output record".into(),
        )),
    }
}
