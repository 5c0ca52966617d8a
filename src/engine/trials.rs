use crate::core::error::EngineError;
use crate::core::types::SimulationArtifact;
use crate::sandbox::client::{ExecResult, SandboxHandle};
use serde::Deserialize;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::warn;

/// Stable path the current artifact is written to before every attempt.
pub const ARTIFACT_PATH: &str = "/tmp/simulation.py";

/// Smoke tests get a short leash; one trial must finish in 3s, so 15s covers
/// interpreter startup with a wide margin.
pub const SMOKE_TIMEOUT: Duration = Duration::from_secs(15);

/// One line of the trial protocol: either a metric or a per-seed error.
#[derive(Clone, Debug, Deserialize)]
pub struct TrialRecord {
    pub seed: u64,
    #[serde(default)]
    pub metric: Option<f64>,
    #[serde(default)]
    pub error: Option<String>,
}

/// Wrap the artifact with a driver loop that emits one JSON line per seed.
/// The artifact stays opaque: the wrapper only calls its `run_trial` entry
/// point and normalizes the return shape.
pub fn build_trial_wrapper(artifact_code: &str, seeds: &[u64]) -> String {
    let seeds_json = serde_json::to_string(seeds).expect("seed list serializes");
    format!(
        r#"{artifact_code}

# --- trial driver ---
import json as _json
import math as _math
import sys as _sys

SEEDS = {seeds_json}

for _seed in SEEDS:
    try:
        _out = run_trial(_seed)
        _metric = _out[0] if isinstance(_out, tuple) else _out
        _metric = float(_metric)
        if _math.isnan(_metric) or _math.isinf(_metric):
            print(_json.dumps({{"seed": _seed, "error": "non-finite metric"}}))
        else:
            print(_json.dumps({{"seed": _seed, "metric": _metric}}))
    except Exception as _exc:
        print(_json.dumps({{"seed": _seed, "error": f"{{type(_exc).__name__}}: {{_exc}}"}}))
    _sys.stdout.flush()
"#
    )
}

/// Parse protocol lines out of stdout, skipping anything the artifact printed
/// on its own. Later records for a seed win.
pub fn parse_trial_output(stdout: &str) -> Vec<TrialRecord> {
    let mut records: Vec<TrialRecord> = Vec::new();
    for line in stdout.lines() {
        let line = line.trim();
        if !line.starts_with('{') {
            continue;
        }
        if let Ok(rec) = serde_json::from_str::<TrialRecord>(line) {
            if let Some(existing) = records.iter_mut().find(|r| r.seed == rec.seed) {
                *existing = rec;
            } else {
                records.push(rec);
            }
        }
    }
    records
}

/// Executes trial batches for one pipeline's artifact inside its sandbox.
pub struct TrialRunner<'a> {
    pub sandbox: &'a dyn SandboxHandle,
    pub exec_timeout: Duration,
    pub chunk_size: usize,
}

impl TrialRunner<'_> {
    /// Run one seed and hand back the raw exec result plus whatever record it
    /// produced. Used by the repair loop, which needs the diagnostics.
    pub async fn exec_single(
        &self,
        artifact: &SimulationArtifact,
        seed: u64,
        timeout: Duration,
    ) -> Result<(ExecResult, Option<TrialRecord>), EngineError> {
        self.sandbox
            .write_file(ARTIFACT_PATH, artifact.code.as_bytes())
            .await?;
        let wrapper = build_trial_wrapper(&artifact.code, &[seed]);
        let exec = self.sandbox.exec(&wrapper, timeout).await?;
        let record = parse_trial_output(&exec.stdout)
            .into_iter()
            .find(|r| r.seed == seed);
        Ok((exec, record))
    }

    /// Run a contiguous seed range in chunks sized to the exec timeout. A
    /// chunk-level failure (nonzero exit, timeout) becomes a per-seed error
    /// record for every seed in the chunk that produced no output line.
    pub async fn run_seeds(
        &self,
        artifact: &SimulationArtifact,
        seeds: &[u64],
        cancel: &CancellationToken,
    ) -> Result<Vec<TrialRecord>, EngineError> {
        self.sandbox
            .write_file(ARTIFACT_PATH, artifact.code.as_bytes())
            .await?;

        let mut records = Vec::with_capacity(seeds.len());
        for chunk in seeds.chunks(self.chunk_size.max(1)) {
            if cancel.is_cancelled() {
                return Err(EngineError::Cancelled);
            }

            let wrapper = build_trial_wrapper(&artifact.code, chunk);
            let exec = self.sandbox.exec(&wrapper, self.exec_timeout).await?;
            let mut chunk_records = parse_trial_output(&exec.stdout);

            if !exec.ok() {
                let reason = if exec.timed_out {
                    "exec timeout".to_string()
                } else {
                    format!("exit {}: {}", exec.exit_code, tail(&exec.stderr, 200))
                };
                warn!(
                    seeds = chunk.len(),
                    got = chunk_records.len(),
                    %reason,
                    "trial chunk failed"
                );
                for &seed in chunk {
                    if !chunk_records.iter().any(|r| r.seed == seed) {
                        chunk_records.push(TrialRecord {
                            seed,
                            metric: None,
                            error: Some(reason.clone()),
                        });
                    }
                }
            }
            records.extend(chunk_records);
        }

        records.sort_by_key(|r| r.seed);
        Ok(records)
    }
}

/// Last `max` bytes of a diagnostic stream, on a char boundary.
pub fn tail(s: &str, max: usize) -> String {
    if s.len() <= max {
        return s.to_string();
    }
    let mut start = s.len() - max;
    while !s.is_char_boundary(start) {
        start += 1;
    }
    s[start..].to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sandbox::client::SandboxClient;
    use crate::sandbox::simulator::SimSandboxClient;

    const OK_ARTIFACT: &str = "def run_trial(seed):\n    return 0.5\n";

    #[test]
    fn wrapper_embeds_artifact_and_seed_marker() {
        let w = build_trial_wrapper(OK_ARTIFACT, &[0, 1, 2]);
        assert!(w.starts_with(OK_ARTIFACT));
        assert!(w.contains("SEEDS = [0,1,2]"));
        assert!(w.contains("run_trial(_seed)"));
    }

    #[test]
    fn parse_skips_artifact_noise_and_dedupes() {
        let stdout = "warming up\n\
                      {\"seed\": 0, \"metric\": 0.4}\n\
                      not json at all\n\
                      {\"seed\": 1, \"error\": \"ZeroDivisionError: division by zero\"}\n\
                      {\"seed\": 0, \"metric\": 0.6}\n";
        let records = parse_trial_output(stdout);
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].metric, Some(0.6));
        assert!(records[1].error.is_some());
    }

    #[tokio::test]
    async fn runner_covers_all_seeds_across_chunks() {
        let client = SimSandboxClient::new();
        let sbx = client.acquire().await.unwrap();
        let runner = TrialRunner {
            sandbox: sbx.as_ref(),
            exec_timeout: Duration::from_secs(60),
            chunk_size: 10,
        };
        let artifact = SimulationArtifact::new(OK_ARTIFACT.to_string(), None);
        let seeds: Vec<u64> = (0..25).collect();
        let records = runner
            .run_seeds(&artifact, &seeds, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(records.len(), 25);
        for (i, r) in records.iter().enumerate() {
            assert_eq!(r.seed, i as u64);
            assert!(r.metric.is_some());
        }
        sbx.release().await;
    }

    #[tokio::test]
    async fn failed_chunk_yields_error_records() {
        let client = SimSandboxClient::new();
        let sbx = client.acquire().await.unwrap();
        client
            .push_exec(ExecResult {
                exit_code: 1,
                stderr: "Traceback: NameError".into(),
                ..Default::default()
            })
            .await;
        let runner = TrialRunner {
            sandbox: sbx.as_ref(),
            exec_timeout: Duration::from_secs(60),
            chunk_size: 50,
        };
        let artifact = SimulationArtifact::new(OK_ARTIFACT.to_string(), None);
        let seeds: Vec<u64> = (0..3).collect();
        let records = runner
            .run_seeds(&artifact, &seeds, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(records.len(), 3);
        assert!(records.iter().all(|r| r.error.is_some()));
        sbx.release().await;
    }

    #[tokio::test]
    async fn cancellation_short_circuits() {
        let client = SimSandboxClient::new();
        let sbx = client.acquire().await.unwrap();
        let runner = TrialRunner {
            sandbox: sbx.as_ref(),
            exec_timeout: Duration::from_secs(60),
            chunk_size: 10,
        };
        let cancel = CancellationToken::new();
        cancel.cancel();
        let artifact = SimulationArtifact::new(OK_ARTIFACT.to_string(), None);
        let err = runner
            .run_seeds(&artifact, &[0, 1], &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Cancelled));
        sbx.release().await;
    }

    #[test]
    fn tail_respects_char_boundaries() {
        assert_eq!(tail("abcdef", 3), "def");
        assert_eq!(tail("ab", 10), "ab");
        // Multi-byte chars are not split.
        let s = "xé".repeat(10);
        let t = tail(&s, 3);
        assert!(t.len() <= 3);
    }
}
