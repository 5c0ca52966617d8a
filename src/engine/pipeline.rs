use crate::core::error::EngineError;
use crate::core::types::{
    ExecutionLogEntry, MarketDescriptor, Phase, PipelineResult, PipelineStatus, ResearchBundle,
    Signal, SimulationArtifact, SuccessMode,
};
use crate::engine::calibrate::{CalibrationOutcome, calibrate};
use crate::engine::montecarlo::run_monte_carlo;
use crate::engine::repair::RepairLoop;
use crate::engine::trials::TrialRunner;
use crate::generator::CodeGenerator;
use crate::generator::prompts::{RepairRequest, research_query};
use crate::llm::LlmProvider;
use crate::research::adapter::ResearchClient;
use crate::sandbox::client::{SandboxClient, SandboxHandle};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Shared read-only provider handles; connection pools underneath are
/// thread-safe, so pipelines hold clones freely.
#[derive(Clone)]
pub struct PipelineDeps {
    pub sandbox_client: Arc<dyn SandboxClient>,
    pub llm: Arc<dyn LlmProvider>,
    pub research: Arc<dyn ResearchClient>,
}

#[derive(Clone)]
pub struct PipelineOptions {
    pub monte_carlo_runs: u32,
    pub calibration_runs: u32,
    pub max_repair_retries: u32,
    pub signal_epsilon: f64,
    pub probability_mode: bool,
    pub user_threshold: Option<f64>,
    pub exec_timeout: Duration,
    pub trial_chunk_size: usize,
    pub fallback: Option<SimulationArtifact>,
}

impl PipelineOptions {
    pub fn from_cfg(engine: &crate::config::config::EngineCfg, sandbox: &crate::config::config::SandboxCfg, fallback: Option<SimulationArtifact>) -> Self {
        Self {
            monte_carlo_runs: engine.monte_carlo_runs,
            calibration_runs: engine.calibration_runs,
            max_repair_retries: engine.max_repair_retries,
            signal_epsilon: engine.signal_epsilon,
            probability_mode: engine.probability_mode,
            user_threshold: engine.user_threshold,
            exec_timeout: sandbox.exec_timeout,
            trial_chunk_size: engine.trial_chunk_size,
            fallback,
        }
    }
}

/// Run the full per-market pipeline inside an already-acquired sandbox:
/// research → generate → (execute ↔ repair) → calibrate → monte carlo.
/// The caller owns sandbox acquire/release so teardown happens on every
/// exit path, including errors returned from here. It also owns the
/// execution-log buffer: on success the entries move into the result, on any
/// error they stay behind for the FailureRecord.
pub async fn run_pipeline(
    sandbox: &dyn SandboxHandle,
    deps: &PipelineDeps,
    market: &MarketDescriptor,
    opts: &PipelineOptions,
    cancel: &CancellationToken,
    execution_log: &mut Vec<ExecutionLogEntry>,
) -> Result<PipelineResult, EngineError> {
    if cancel.is_cancelled() {
        return Err(EngineError::Cancelled);
    }

    // Research grounds the generator but is never load-bearing: any failure
    // degrades to an empty bundle.
    let research = match deps
        .research
        .research(&sandbox.tool_endpoint(), &research_query(&market.question))
        .await
    {
        Ok(bundle) => bundle,
        Err(e) => {
            warn!(error = %e, "research unavailable, continuing without context");
            ResearchBundle::default()
        }
    };

    if cancel.is_cancelled() {
        return Err(EngineError::Cancelled);
    }

    let generator = CodeGenerator::new(deps.llm.clone());
    let initial = generator.initial(market, &research).await?;

    let runner = TrialRunner {
        sandbox,
        exec_timeout: opts.exec_timeout,
        chunk_size: opts.trial_chunk_size,
    };
    let mut repair = RepairLoop::new(&runner, &generator, opts.max_repair_retries, execution_log);

    let outcome = repair
        .establish(initial, opts.fallback.as_ref(), cancel)
        .await?;
    let mut artifact = outcome.artifact;
    let mut used_fallback = outcome.used_fallback;

    // Calibration loop: NaNs re-enter the repair budget; a degenerate model
    // gets exactly one dedicated re-generation before the task fails.
    let mut regenerated = false;
    let calibration = loop {
        if cancel.is_cancelled() {
            return Err(EngineError::Cancelled);
        }
        match calibrate(
            &runner,
            &artifact,
            opts.calibration_runs,
            opts.user_threshold,
            cancel,
        )
        .await?
        {
            CalibrationOutcome::Accepted(c) => break c,
            CalibrationOutcome::NeedsRepair {
                classification,
                detail,
            } => {
                let o = repair
                    .reenter(
                        &artifact,
                        classification,
                        &detail,
                        Phase::Calibration,
                        opts.fallback.as_ref(),
                        cancel,
                    )
                    .await?;
                artifact = o.artifact;
                used_fallback |= o.used_fallback;
            }
            CalibrationOutcome::Rejected { calibration, kind } => {
                if regenerated {
                    return Err(EngineError::CalibrationRejected {
                        kind,
                        detail: format!(
                            "stdev {} after re-generation (verdict {:?})",
                            calibration.stdev, calibration.verdict
                        ),
                    });
                }
                regenerated = true;
                info!("calibration rejected, requesting one re-generation");
                artifact = generator
                    .repair(
                        &artifact,
                        &RepairRequest {
                            classification: kind,
                            exit_code: None,
                            stderr_tail: format!(
                                "all {} calibration metrics within stdev {}",
                                calibration.runs, calibration.stdev
                            ),
                            phase: Phase::Calibration,
                        },
                    )
                    .await?;
                used_fallback = false;
            }
        }
    };

    // Probability mode only applies when the user asked for it and every
    // calibration metric already lives in [0, 1].
    let mode = if opts.probability_mode && calibration.metrics_in_unit_range {
        SuccessMode::Probability
    } else {
        SuccessMode::Threshold
    };
    let threshold = calibration.threshold;

    let mc = run_monte_carlo(
        &runner,
        &artifact,
        opts.monte_carlo_runs,
        threshold,
        mode,
        calibration,
        cancel,
    )
    .await?;

    let status = if mc.partially_failed {
        PipelineStatus::PartiallyFailed
    } else if used_fallback {
        PipelineStatus::SucceededWithFallback
    } else {
        PipelineStatus::Succeeded
    };

    let signal = Signal::derive(mc.result.probability, market.yes_price, opts.signal_epsilon);
    info!(
        slug = %market.effective_slug(),
        probability = mc.result.probability,
        market_yes = market.yes_price,
        ?signal,
        ?status,
        "pipeline complete"
    );

    Ok(PipelineResult {
        market: market.clone(),
        research,
        explanation: artifact.description.clone(),
        artifact_code: artifact.code,
        montecarlo: mc.result,
        signal,
        status,
        execution_log: std::mem::take(execution_log),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::SimLlmClient;
    use crate::research::adapter::SimResearchClient;
    use crate::sandbox::client::ExecResult;
    use crate::sandbox::simulator::SimSandboxClient;

    fn market() -> MarketDescriptor {
        MarketDescriptor {
            slug: "fed-cut-dec".into(),
            question: "Will the Fed cut rates in December 2025?".into(),
            yes_price: 0.65,
            volume: Some(950_000.0),
            end_date: None,
        }
    }

    fn options() -> PipelineOptions {
        PipelineOptions {
            monte_carlo_runs: 200,
            calibration_runs: 50,
            max_repair_retries: 5,
            signal_epsilon: 0.05,
            probability_mode: false,
            user_threshold: None,
            exec_timeout: Duration::from_secs(60),
            // One exec per calibration batch keeps scripted tests aligned.
            trial_chunk_size: 100,
            fallback: None,
        }
    }

    fn deps(sandbox: Arc<SimSandboxClient>, llm: Arc<SimLlmClient>) -> PipelineDeps {
        PipelineDeps {
            sandbox_client: sandbox,
            llm,
            research: Arc::new(SimResearchClient),
        }
    }

    #[tokio::test]
    async fn happy_path_produces_signal_and_result() {
        let sandbox_client = Arc::new(SimSandboxClient::new());
        let llm = Arc::new(SimLlmClient::new());
        let d = deps(sandbox_client.clone(), llm.clone());
        let sbx = d.sandbox_client.acquire().await.unwrap();

        let mut log = Vec::new();
        let result = run_pipeline(
            sbx.as_ref(),
            &d,
            &market(),
            &options(),
            &CancellationToken::new(),
            &mut log,
        )
        .await
        .unwrap();
        sbx.release().await;

        assert_eq!(result.status, PipelineStatus::Succeeded);
        assert_eq!(result.montecarlo.n_runs, 200);
        assert!((0.0..=1.0).contains(&result.montecarlo.probability));
        assert!(result.explanation.is_some());
        assert!(!result.research.text.is_empty());
        // One generator call: the initial artifact worked.
        assert_eq!(llm.call_count(), 1);
        // Exactly one smoke entry, moved into the result.
        assert_eq!(result.execution_log.len(), 1);
        assert!(log.is_empty());
    }

    #[tokio::test]
    async fn repair_bound_holds_even_when_everything_fails() {
        let sandbox_client = Arc::new(SimSandboxClient::new());
        let llm = Arc::new(SimLlmClient::new());
        let d = deps(sandbox_client.clone(), llm.clone());
        let sbx = d.sandbox_client.acquire().await.unwrap();

        // Every smoke attempt fails; no fallback.
        for _ in 0..10 {
            sandbox_client
                .push_exec(ExecResult {
                    exit_code: 1,
                    stderr: "RuntimeError: broken".into(),
                    ..Default::default()
                })
                .await;
        }

        let opts = options();
        let mut log = Vec::new();
        let err = run_pipeline(
            sbx.as_ref(),
            &d,
            &market(),
            &opts,
            &CancellationToken::new(),
            &mut log,
        )
        .await
        .unwrap_err();
        sbx.release().await;

        assert!(matches!(err, EngineError::RepairExhausted { .. }));
        // Initial + at most MAX_REPAIR_RETRIES + 1 more generator calls.
        assert!(llm.call_count() as u32 <= opts.max_repair_retries + 2);
        // The failed attempts remain in the caller's buffer.
        assert_eq!(log.len(), opts.max_repair_retries as usize);
    }

    #[tokio::test]
    async fn degenerate_calibration_regenerates_once_then_fails() {
        let sandbox_client = Arc::new(SimSandboxClient::new());
        let llm = Arc::new(SimLlmClient::new());
        let d = deps(sandbox_client.clone(), llm.clone());
        let sbx = d.sandbox_client.acquire().await.unwrap();

        let constant_batch = |runs: u32| ExecResult {
            exit_code: 0,
            stdout: (0..runs)
                .map(|s| format!("{{\"seed\": {s}, \"metric\": 0.5}}\n"))
                .collect(),
            ..Default::default()
        };

        // Smoke passes (default protocol), first calibration constant,
        // smoke again after regen not needed (regen goes straight to
        // calibration), second calibration constant again -> rejection.
        sandbox_client
            .push_exec(ExecResult {
                exit_code: 0,
                stdout: "{\"seed\": 0, \"metric\": 0.5}\n".into(),
                ..Default::default()
            })
            .await;
        sandbox_client.push_exec(constant_batch(50)).await;
        sandbox_client.push_exec(constant_batch(50)).await;

        let mut log = Vec::new();
        let err = run_pipeline(
            sbx.as_ref(),
            &d,
            &market(),
            &options(),
            &CancellationToken::new(),
            &mut log,
        )
        .await
        .unwrap_err();
        sbx.release().await;

        assert!(matches!(err, EngineError::CalibrationRejected { .. }));
        // Initial + exactly one re-generation.
        assert_eq!(llm.call_count(), 2);
        // The passing smoke attempt is still on record.
        assert_eq!(log.len(), 1);
    }

    #[tokio::test]
    async fn degenerate_calibration_recovers_on_regeneration() {
        let sandbox_client = Arc::new(SimSandboxClient::new());
        let llm = Arc::new(SimLlmClient::new());
        let d = deps(sandbox_client.clone(), llm.clone());
        let sbx = d.sandbox_client.acquire().await.unwrap();

        // Smoke ok, then a constant calibration batch; afterwards the default
        // protocol takes over (spread metrics), so the second calibration and
        // the Monte Carlo succeed.
        sandbox_client
            .push_exec(ExecResult {
                exit_code: 0,
                stdout: "{\"seed\": 0, \"metric\": 0.5}\n".into(),
                ..Default::default()
            })
            .await;
        sandbox_client
            .push_exec(ExecResult {
                exit_code: 0,
                stdout: (0..50)
                    .map(|s| format!("{{\"seed\": {s}, \"metric\": 0.5}}\n"))
                    .collect(),
                ..Default::default()
            })
            .await;

        let mut log = Vec::new();
        let result = run_pipeline(
            sbx.as_ref(),
            &d,
            &market(),
            &options(),
            &CancellationToken::new(),
            &mut log,
        )
        .await
        .unwrap();
        sbx.release().await;

        assert_eq!(result.status, PipelineStatus::Succeeded);
        assert_eq!(llm.call_count(), 2);
        assert!(result.montecarlo.calibration.stdev > 1e-3);
    }

    #[tokio::test]
    async fn exhausted_repairs_fall_back_to_the_baseline() {
        let sandbox_client = Arc::new(SimSandboxClient::new());
        let llm = Arc::new(SimLlmClient::new());
        let d = deps(sandbox_client.clone(), llm.clone());
        let sbx = d.sandbox_client.acquire().await.unwrap();

        // Every generated artifact fails its smoke test; the baseline then
        // carries calibration and the Monte Carlo.
        for _ in 0..5 {
            sandbox_client
                .push_exec(ExecResult {
                    exit_code: 1,
                    stderr: "NameError: name 'foo' is not defined".into(),
                    ..Default::default()
                })
                .await;
        }

        let mut opts = options();
        opts.fallback = Some(SimulationArtifact::new(
            "def run_trial(seed):\n    return 0.5\n".into(),
            None,
        ));
        let mut log = Vec::new();
        let result = run_pipeline(
            sbx.as_ref(),
            &d,
            &market(),
            &opts,
            &CancellationToken::new(),
            &mut log,
        )
        .await
        .unwrap();
        sbx.release().await;

        assert_eq!(result.status, PipelineStatus::SucceededWithFallback);
        assert_eq!(result.montecarlo.n_runs, 200);
        // Five failed attempts plus the fallback-used entry.
        assert_eq!(result.execution_log.len(), 6);
        assert_eq!(result.execution_log[5].detail, "fallback-used");
    }

    #[tokio::test]
    async fn cancelled_pipeline_never_produces_a_result() {
        let sandbox_client = Arc::new(SimSandboxClient::new());
        let llm = Arc::new(SimLlmClient::new());
        let d = deps(sandbox_client.clone(), llm);
        let sbx = d.sandbox_client.acquire().await.unwrap();

        let cancel = CancellationToken::new();
        cancel.cancel();
        let mut log = Vec::new();
        let err = run_pipeline(sbx.as_ref(), &d, &market(), &options(), &cancel, &mut log)
            .await
            .unwrap_err();
        sbx.release().await;
        assert!(matches!(err, EngineError::Cancelled));
        assert!(log.is_empty());
    }

    #[tokio::test]
    async fn probability_mode_applies_only_with_unit_range_metrics() {
        let sandbox_client = Arc::new(SimSandboxClient::new());
        let llm = Arc::new(SimLlmClient::new());
        let d = deps(sandbox_client.clone(), llm);
        let sbx = d.sandbox_client.acquire().await.unwrap();

        let mut opts = options();
        opts.probability_mode = true;
        let mut log = Vec::new();
        let result = run_pipeline(
            sbx.as_ref(),
            &d,
            &market(),
            &opts,
            &CancellationToken::new(),
            &mut log,
        )
        .await
        .unwrap();
        sbx.release().await;

        // Simulator metrics live in [0, 1), so the flag takes effect.
        assert_eq!(result.montecarlo.mode, SuccessMode::Probability);
    }
}
