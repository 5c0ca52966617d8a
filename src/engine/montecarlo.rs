use crate::core::error::EngineError;
use crate::core::types::{
    Calibration, MonteCarloResult, SimulationArtifact, SuccessMode, TrialOutcome, ci_95_half_width,
};
use crate::engine::trials::{TrialRecord, TrialRunner};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Trials may individually fail; past this fraction the whole batch is
/// reported as partially failed.
const MAX_FAILED_FRACTION: f64 = 0.10;

pub struct MonteCarloRun {
    pub result: MonteCarloResult,
    pub partially_failed: bool,
}

/// Execute the main batch: N independent trials with seeds 0..N−1, aggregated
/// host-side. The generated code only ever supplies raw metrics.
pub async fn run_monte_carlo(
    runner: &TrialRunner<'_>,
    artifact: &SimulationArtifact,
    n_runs: u32,
    threshold: f64,
    mode: SuccessMode,
    calibration: Calibration,
    cancel: &CancellationToken,
) -> Result<MonteCarloRun, EngineError> {
    let seeds: Vec<u64> = (0..n_runs as u64).collect();
    let records = runner.run_seeds(artifact, &seeds, cancel).await?;
    let run = aggregate(&records, n_runs, threshold, mode, calibration);
    info!(
        n_runs = run.result.n_runs,
        probability = run.result.probability,
        ci_95 = run.result.ci_95,
        failed = run.result.failed_seeds.len(),
        "monte carlo complete"
    );
    Ok(run)
}

/// Pure aggregation step, separated so the invariants are testable without a
/// sandbox. `outcomes[i]` corresponds to the i-th surviving seed in ascending
/// seed order; failed seeds are recorded and skipped.
pub fn aggregate(
    records: &[TrialRecord],
    requested_runs: u32,
    threshold: f64,
    mode: SuccessMode,
    calibration: Calibration,
) -> MonteCarloRun {
    let mut outcomes = Vec::with_capacity(records.len());
    let mut trial_outcomes: Vec<TrialOutcome> = Vec::with_capacity(records.len());
    let mut failed_seeds: Vec<(u64, String)> = Vec::new();

    for rec in records {
        match (rec.metric, &rec.error) {
            (Some(metric), _) if metric.is_finite() => {
                let success = match mode {
                    SuccessMode::Threshold => metric > threshold,
                    SuccessMode::Probability => bernoulli(rec.seed, metric),
                };
                trial_outcomes.push(TrialOutcome {
                    seed: rec.seed,
                    metric,
                    success,
                });
                outcomes.push(u8::from(success));
            }
            (_, err) => {
                failed_seeds.push((
                    rec.seed,
                    err.clone().unwrap_or_else(|| "missing metric".to_string()),
                ));
            }
        }
    }

    // Seeds that never produced a record count as failed too.
    for seed in 0..requested_runs as u64 {
        if !records.iter().any(|r| r.seed == seed) {
            failed_seeds.push((seed, "no record".to_string()));
        }
    }
    failed_seeds.sort_by_key(|(s, _)| *s);

    let n_runs = outcomes.len() as u32;
    let successes = outcomes.iter().filter(|&&o| o == 1).count();
    let probability = if n_runs > 0 {
        successes as f64 / n_runs as f64
    } else {
        0.0
    };

    let failed_fraction = failed_seeds.len() as f64 / requested_runs.max(1) as f64;
    let partially_failed = failed_fraction > MAX_FAILED_FRACTION;
    if !failed_seeds.is_empty() {
        warn!(
            failed = failed_seeds.len(),
            requested = requested_runs,
            partially_failed,
            "some trials failed"
        );
    }

    MonteCarloRun {
        result: MonteCarloResult {
            n_runs,
            probability,
            ci_95: ci_95_half_width(probability, n_runs),
            outcomes,
            trials: trial_outcomes,
            calibration,
            threshold,
            mode,
            failed_seeds,
        },
        partially_failed,
    }
}

/// Probability mode: the metric is itself a probability; draw the binary
/// outcome from a deterministic per-trial sub-seed so reruns are identical.
fn bernoulli(seed: u64, metric: f64) -> bool {
    let sub_seed = seed
        .wrapping_mul(0x9E37_79B9_7F4A_7C15)
        ^ 0xD1B5_4A32_D192_ED03;
    let mut rng = StdRng::seed_from_u64(sub_seed);
    rng.random::<f64>() < metric.clamp(0.0, 1.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::CalibrationVerdict;

    fn calibration() -> Calibration {
        Calibration {
            runs: 50,
            min: 0.1,
            max: 0.9,
            mean: 0.5,
            stdev: 0.2,
            threshold: 0.5,
            verdict: CalibrationVerdict::Accepted,
            metrics_in_unit_range: true,
        }
    }

    fn records_with_failures(total: u64, failed: u64) -> Vec<TrialRecord> {
        (0..total)
            .map(|seed| {
                if seed < failed {
                    TrialRecord {
                        seed,
                        metric: None,
                        error: Some("exec timeout".into()),
                    }
                } else {
                    TrialRecord {
                        seed,
                        // Above threshold for even seeds.
                        metric: Some(if seed % 2 == 0 { 0.8 } else { 0.2 }),
                        error: None,
                    }
                }
            })
            .collect()
    }

    #[test]
    fn probability_equals_success_fraction_and_ci_matches() {
        let records: Vec<TrialRecord> = (0..200)
            .map(|seed| TrialRecord {
                seed,
                metric: Some(if seed < 144 { 0.9 } else { 0.1 }),
                error: None,
            })
            .collect();
        let run = aggregate(&records, 200, 0.5, SuccessMode::Threshold, calibration());
        assert!(!run.partially_failed);
        let r = &run.result;
        assert_eq!(r.n_runs, 200);
        assert!((r.probability - 0.72).abs() < 1e-12);
        let successes = r.outcomes.iter().filter(|&&o| o == 1).count();
        assert_eq!(successes as f64 / r.n_runs as f64, r.probability);
        assert!((r.ci_95 - 1.96 * (0.72f64 * 0.28 / 200.0).sqrt()).abs() < 1e-9);
        assert_eq!(r.outcomes.len(), 200);
    }

    #[test]
    fn threshold_is_strictly_greater_than() {
        let records = vec![TrialRecord {
            seed: 0,
            metric: Some(0.5),
            error: None,
        }];
        let run = aggregate(&records, 1, 0.5, SuccessMode::Threshold, calibration());
        assert_eq!(run.result.outcomes, vec![0]);
    }

    #[test]
    fn under_ten_percent_failures_shrinks_n_runs() {
        // 15 of 200 fail: 7.5% < 10% -> not partially failed, n_runs = 185.
        let run = aggregate(
            &records_with_failures(200, 15),
            200,
            0.5,
            SuccessMode::Threshold,
            calibration(),
        );
        assert!(!run.partially_failed);
        assert_eq!(run.result.n_runs, 185);
        assert_eq!(run.result.failed_seeds.len(), 15);
        let successes = run.result.outcomes.iter().filter(|&&o| o == 1).count();
        assert!(
            (run.result.probability - successes as f64 / 185.0).abs() < 1e-12
        );
    }

    #[test]
    fn over_ten_percent_failures_is_partial() {
        // 25 of 200 fail: 12.5% > 10%.
        let run = aggregate(
            &records_with_failures(200, 25),
            200,
            0.5,
            SuccessMode::Threshold,
            calibration(),
        );
        assert!(run.partially_failed);
        assert_eq!(run.result.n_runs, 175);
    }

    #[test]
    fn missing_records_count_as_failures() {
        let records = vec![TrialRecord {
            seed: 0,
            metric: Some(0.9),
            error: None,
        }];
        let run = aggregate(&records, 10, 0.5, SuccessMode::Threshold, calibration());
        assert_eq!(run.result.failed_seeds.len(), 9);
        assert!(run.partially_failed);
    }

    #[test]
    fn probability_mode_is_deterministic() {
        let records: Vec<TrialRecord> = (0..100)
            .map(|seed| TrialRecord {
                seed,
                metric: Some(0.3 + (seed as f64 % 10.0) * 0.05),
                error: None,
            })
            .collect();
        let a = aggregate(&records, 100, 0.5, SuccessMode::Probability, calibration());
        let b = aggregate(&records, 100, 0.5, SuccessMode::Probability, calibration());
        assert_eq!(a.result.outcomes, b.result.outcomes);
        // Not all identical: the Bernoulli draws actually vary across seeds.
        assert!(a.result.outcomes.iter().any(|&o| o == 1));
        assert!(a.result.outcomes.iter().any(|&o| o == 0));
    }

    #[test]
    fn bernoulli_extremes() {
        assert!(!bernoulli(1, 0.0));
        assert!(bernoulli(1, 1.0));
    }
}
