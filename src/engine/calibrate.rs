use crate::core::error::{EngineError, FailureKind};
use crate::core::types::{Calibration, CalibrationVerdict, SimulationArtifact};
use crate::engine::trials::TrialRunner;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Minimum meaningful calibration batch.
const MIN_CALIBRATION_RUNS: u32 = 5;

#[derive(Debug)]
pub enum CalibrationOutcome {
    Accepted(Calibration),
    /// A trial failed mid-calibration (NaN or runtime error). The calibration
    /// is discarded and the artifact goes back through the repair loop.
    NeedsRepair {
        classification: FailureKind,
        detail: String,
    },
    /// The model is statistically useless: a Monte Carlo over it would return
    /// the same answer every run.
    Rejected {
        calibration: Calibration,
        kind: FailureKind,
    },
}

/// Run a small batch to characterize the raw-metric distribution and pick the
/// binary threshold. Seeds 0..runs−1, same trial primitive as the main batch.
pub async fn calibrate(
    runner: &TrialRunner<'_>,
    artifact: &SimulationArtifact,
    runs: u32,
    user_threshold: Option<f64>,
    cancel: &CancellationToken,
) -> Result<CalibrationOutcome, EngineError> {
    if runs < MIN_CALIBRATION_RUNS {
        return Err(EngineError::CalibrationTooSmall { runs });
    }

    let seeds: Vec<u64> = (0..runs as u64).collect();
    let records = runner.run_seeds(artifact, &seeds, cancel).await?;

    let mut metrics = Vec::with_capacity(records.len());
    for rec in &records {
        match (rec.metric, &rec.error) {
            (Some(m), _) if m.is_finite() => metrics.push(m),
            _ => {
                let detail = rec
                    .error
                    .clone()
                    .unwrap_or_else(|| "missing metric".to_string());
                let classification = if detail.contains("non-finite") {
                    FailureKind::NonFinite
                } else {
                    FailureKind::Runtime
                };
                warn!(seed = rec.seed, %detail, "calibration trial failed, discarding batch");
                return Ok(CalibrationOutcome::NeedsRepair {
                    classification,
                    detail: format!("seed {}: {detail}", rec.seed),
                });
            }
        }
    }

    if (metrics.len() as u32) < runs {
        // The sandbox dropped records without erroring; treat like a failure.
        return Ok(CalibrationOutcome::NeedsRepair {
            classification: FailureKind::Runtime,
            detail: format!("only {}/{} calibration records", metrics.len(), runs),
        });
    }

    let stats = summarize(&metrics);
    let threshold = user_threshold.unwrap_or(stats.mean);
    if let Some(user) = user_threshold {
        if user < stats.min || user > stats.max {
            warn!(
                user,
                min = stats.min,
                max = stats.max,
                "user threshold lies outside the calibration range"
            );
        }
    }

    // Epsilon scales with the sample when the metric range is unknown.
    let epsilon = 1e-3 * stats.mean.abs().max(1.0);
    let verdict = if stats.stdev < epsilon {
        CalibrationVerdict::RejectedLowVariance
    } else if stats.max - stats.min == 0.0 {
        CalibrationVerdict::RejectedDegenerate
    } else {
        CalibrationVerdict::Accepted
    };

    let calibration = Calibration {
        runs,
        min: stats.min,
        max: stats.max,
        mean: stats.mean,
        stdev: stats.stdev,
        threshold,
        verdict,
        metrics_in_unit_range: metrics.iter().all(|m| (0.0..=1.0).contains(m)),
    };

    match verdict {
        CalibrationVerdict::Accepted => {
            info!(
                mean = stats.mean,
                stdev = stats.stdev,
                threshold,
                "calibration accepted"
            );
            Ok(CalibrationOutcome::Accepted(calibration))
        }
        _ => {
            warn!(stdev = stats.stdev, ?verdict, "calibration rejected");
            Ok(CalibrationOutcome::Rejected {
                calibration,
                kind: FailureKind::InsufficientStochasticity,
            })
        }
    }
}

struct Summary {
    min: f64,
    max: f64,
    mean: f64,
    stdev: f64,
}

fn summarize(metrics: &[f64]) -> Summary {
    let n = metrics.len() as f64;
    let mean = metrics.iter().sum::<f64>() / n;
    let var = metrics.iter().map(|m| (m - mean).powi(2)).sum::<f64>() / n;
    Summary {
        min: metrics.iter().cloned().fold(f64::INFINITY, f64::min),
        max: metrics.iter().cloned().fold(f64::NEG_INFINITY, f64::max),
        mean,
        stdev: var.sqrt(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sandbox::client::{ExecResult, SandboxClient, SandboxHandle};
    use crate::sandbox::simulator::SimSandboxClient;
    use std::sync::Arc;
    use std::time::Duration;

    const OK_ARTIFACT: &str = "def run_trial(seed):\n    return 0.5\n";

    async fn setup() -> (SimSandboxClient, Arc<dyn SandboxHandle>) {
        let client = SimSandboxClient::new();
        let sbx = client.acquire().await.unwrap();
        (client, sbx)
    }

    fn runner<'a>(sbx: &'a Arc<dyn SandboxHandle>) -> TrialRunner<'a> {
        TrialRunner {
            sandbox: sbx.as_ref(),
            exec_timeout: Duration::from_secs(60),
            chunk_size: 100,
        }
    }

    fn constant_metrics_stdout(runs: u32, value: f64) -> ExecResult {
        let stdout = (0..runs)
            .map(|s| format!("{{\"seed\": {s}, \"metric\": {value}}}\n"))
            .collect();
        ExecResult {
            exit_code: 0,
            stdout,
            ..Default::default()
        }
    }

    #[test]
    fn summary_statistics() {
        let s = summarize(&[0.2, 0.4, 0.6, 0.8]);
        assert!((s.mean - 0.5).abs() < 1e-12);
        assert_eq!(s.min, 0.2);
        assert_eq!(s.max, 0.8);
        let expected = (0.05f64).sqrt(); // population variance of the sample
        assert!((s.stdev - expected).abs() < 1e-12);
    }

    #[tokio::test]
    async fn too_small_batch_is_an_error() {
        let (_client, sbx) = setup().await;
        let r = runner(&sbx);
        let artifact = SimulationArtifact::new(OK_ARTIFACT.to_string(), None);
        let err = calibrate(&r, &artifact, 4, None, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::CalibrationTooSmall { runs: 4 }));
    }

    #[tokio::test]
    async fn accepts_spread_out_metrics() {
        let (_client, sbx) = setup().await;
        let r = runner(&sbx);
        // Default simulator protocol: hash-spread metrics in [0, 1).
        let artifact = SimulationArtifact::new(OK_ARTIFACT.to_string(), None);
        match calibrate(&r, &artifact, 50, None, &CancellationToken::new())
            .await
            .unwrap()
        {
            CalibrationOutcome::Accepted(c) => {
                assert_eq!(c.runs, 50);
                assert!(c.stdev > 1e-3);
                assert!(c.threshold >= c.min && c.threshold <= c.max);
                assert!((c.threshold - c.mean).abs() < 1e-12);
                assert!(c.metrics_in_unit_range);
            }
            _ => panic!("expected acceptance"),
        }
    }

    #[tokio::test]
    async fn constant_metrics_are_rejected_low_variance() {
        let (client, sbx) = setup().await;
        client.push_exec(constant_metrics_stdout(50, 0.5)).await;
        let r = runner(&sbx);
        let artifact = SimulationArtifact::new(OK_ARTIFACT.to_string(), None);
        match calibrate(&r, &artifact, 50, None, &CancellationToken::new())
            .await
            .unwrap()
        {
            CalibrationOutcome::Rejected { calibration, kind } => {
                assert_eq!(calibration.verdict, CalibrationVerdict::RejectedLowVariance);
                assert_eq!(kind, FailureKind::InsufficientStochasticity);
                assert_eq!(calibration.stdev, 0.0);
            }
            _ => panic!("expected rejection"),
        }
    }

    #[tokio::test]
    async fn nan_discards_calibration_for_repair() {
        let (client, sbx) = setup().await;
        let mut stdout = String::new();
        for s in 0..10 {
            stdout.push_str(&format!("{{\"seed\": {s}, \"metric\": 0.4}}\n"));
        }
        stdout.push_str("{\"seed\": 10, \"error\": \"non-finite metric\"}\n");
        for s in 11..50 {
            stdout.push_str(&format!("{{\"seed\": {s}, \"metric\": 0.6}}\n"));
        }
        client
            .push_exec(ExecResult {
                exit_code: 0,
                stdout,
                ..Default::default()
            })
            .await;

        let r = runner(&sbx);
        let artifact = SimulationArtifact::new(OK_ARTIFACT.to_string(), None);
        match calibrate(&r, &artifact, 50, None, &CancellationToken::new())
            .await
            .unwrap()
        {
            CalibrationOutcome::NeedsRepair {
                classification,
                detail,
            } => {
                assert_eq!(classification, FailureKind::NonFinite);
                assert!(detail.contains("seed 10"));
            }
            _ => panic!("expected repair escalation"),
        }
    }

    #[tokio::test]
    async fn user_threshold_overrides_but_stats_are_recorded() {
        let (_client, sbx) = setup().await;
        let r = runner(&sbx);
        let artifact = SimulationArtifact::new(OK_ARTIFACT.to_string(), None);
        match calibrate(&r, &artifact, 50, Some(0.9), &CancellationToken::new())
            .await
            .unwrap()
        {
            CalibrationOutcome::Accepted(c) => {
                assert_eq!(c.threshold, 0.9);
                assert!(c.stdev > 0.0);
            }
            _ => panic!("expected acceptance"),
        }
    }
}
