use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::core::error::FailureKind;

// ----------- Pipeline inputs -----------------

/// A binary-outcome prediction market, as selected upstream. Immutable input
/// to a pipeline; how it was discovered is out of scope here.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct MarketDescriptor {
    #[serde(default)]
    pub slug: String,
    pub question: String,
    /// Current YES price, in [0, 1].
    #[serde(alias = "yes_odds")]
    pub yes_price: f64,
    #[serde(default)]
    pub volume: Option<f64>,
    #[serde(default)]
    pub end_date: Option<DateTime<Utc>>,
}

impl MarketDescriptor {
    /// Slug used for the per-market result directory and the batch report key.
    /// Falls back to a slugified question when the upstream source gave none.
    pub fn effective_slug(&self) -> String {
        if self.slug.is_empty() {
            slugify(&self.question)
        } else {
            self.slug.clone()
        }
    }
}

/// Lowercase, first 50 chars, non-alphanumerics collapsed to single dashes.
pub fn slugify(text: &str) -> String {
    let mut out = String::with_capacity(50);
    let mut last_dash = true; // suppress leading dash
    for c in text.chars().take(50) {
        if c.is_ascii_alphanumeric() {
            out.push(c.to_ascii_lowercase());
            last_dash = false;
        } else if !last_dash {
            out.push('-');
            last_dash = true;
        }
    }
    while out.ends_with('-') {
        out.pop();
    }
    out
}

/// Grounding context from the research tool. Helpful, not required: a pipeline
/// continues with an empty bundle when research is unavailable.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct ResearchBundle {
    pub text: String,
    #[serde(default)]
    pub highlights: Vec<String>,
    #[serde(default)]
    pub citations: Vec<String>,
}

impl ResearchBundle {
    pub fn is_empty(&self) -> bool {
        self.text.is_empty()
    }
}

// ----------- Artifacts -----------------

/// Static self-description block extracted from a generated artifact, used for
/// the explanation field of the result. Absent when the model omitted it or
/// the block failed to parse.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ModelDescription {
    #[serde(default)]
    pub agents: Vec<AgentDescription>,
    #[serde(default)]
    pub rationale: String,
    #[serde(default)]
    pub outcome_interpretation: String,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AgentDescription {
    pub name: String,
    #[serde(default)]
    pub count: u32,
    #[serde(default)]
    pub role: String,
}

/// The LLM-authored simulation program. Opaque text from the engine's point of
/// view: it crosses into the sandbox as bytes and is never parsed beyond the
/// entry-point and description checks at generation time.
#[derive(Clone, Debug)]
pub struct SimulationArtifact {
    pub code: String,
    pub description: Option<ModelDescription>,
}

impl SimulationArtifact {
    pub fn new(code: String, description: Option<ModelDescription>) -> Self {
        Self { code, description }
    }
}

// ----------- Trial outcomes and aggregation -----------------

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TrialOutcome {
    pub seed: u64,
    pub metric: f64,
    pub success: bool,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CalibrationVerdict {
    Accepted,
    RejectedLowVariance,
    RejectedDegenerate,
}

/// Summary of the small preliminary batch used to pick the binary threshold
/// and detect degenerate models.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Calibration {
    pub runs: u32,
    pub min: f64,
    pub max: f64,
    pub mean: f64,
    pub stdev: f64,
    pub threshold: f64,
    pub verdict: CalibrationVerdict,
    /// True when every calibration metric landed in [0, 1]; recorded so an
    /// operator can tell when the probability_mode flag would have applied.
    pub metrics_in_unit_range: bool,
}

/// How a raw metric becomes a binary outcome.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SuccessMode {
    /// success = metric > threshold (strict).
    Threshold,
    /// metric is already a probability; success ~ Bernoulli(metric) with a
    /// deterministic per-trial sub-seed.
    Probability,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct MonteCarloResult {
    pub n_runs: u32,
    pub probability: f64,
    pub ci_95: f64,
    /// Binary outcomes indexed by seed order (failed seeds removed).
    pub outcomes: Vec<u8>,
    /// Full per-seed tuples, same order as `outcomes`.
    #[serde(default)]
    pub trials: Vec<TrialOutcome>,
    pub calibration: Calibration,
    pub threshold: f64,
    pub mode: SuccessMode,
    /// Seeds whose trials failed, with the reason; skipped from aggregation.
    #[serde(default)]
    pub failed_seeds: Vec<(u64, String)>,
}

/// 95% confidence interval half-width under the normal approximation.
pub fn ci_95_half_width(probability: f64, n_runs: u32) -> f64 {
    if n_runs == 0 {
        return 0.0;
    }
    1.96 * (probability * (1.0 - probability) / n_runs as f64).sqrt()
}

// ----------- Signals -----------------

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Signal {
    BuyYes,
    BuyNo,
    Hold,
}

impl Signal {
    /// BUY_YES iff probability − market_yes ≥ epsilon, BUY_NO iff ≤ −epsilon,
    /// HOLD otherwise.
    pub fn derive(probability: f64, market_yes: f64, epsilon: f64) -> Signal {
        let edge = probability - market_yes;
        if edge >= epsilon {
            Signal::BuyYes
        } else if edge <= -epsilon {
            Signal::BuyNo
        } else {
            Signal::Hold
        }
    }
}

// ----------- Execution log -----------------

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Phase {
    Smoke,
    Fallback,
    Calibration,
}

/// One structured entry per execute/repair attempt, persisted to
/// execution.log in the result directory.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ExecutionLogEntry {
    pub attempt: u32,
    pub phase: Phase,
    pub classification: Option<FailureKind>,
    pub duration_ms: u64,
    pub detail: String,
}

impl ExecutionLogEntry {
    pub fn render(&self) -> String {
        let class = self
            .classification
            .map(|k| format!("{k}"))
            .unwrap_or_else(|| "ok".to_string());
        format!(
            "attempt={} phase={:?} outcome={} duration_ms={} {}",
            self.attempt, self.phase, class, self.duration_ms, self.detail
        )
    }
}

// ----------- Pipeline and batch results -----------------

/// Status of a pipeline that produced a result. Terminal failures (including
/// cancellation) are recorded as FailureRecords instead, since they carry no
/// MonteCarloResult.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PipelineStatus {
    Succeeded,
    SucceededWithFallback,
    PartiallyFailed,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PipelineResult {
    pub market: MarketDescriptor,
    pub research: ResearchBundle,
    /// Final working artifact text; written verbatim to model.py, excluded
    /// from result.json.
    #[serde(skip)]
    pub artifact_code: String,
    pub explanation: Option<ModelDescription>,
    pub montecarlo: MonteCarloResult,
    pub signal: Signal,
    pub status: PipelineStatus,
    pub execution_log: Vec<ExecutionLogEntry>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct FailureRecord {
    pub slug: String,
    pub kind: String,
    pub reason: String,
    #[serde(default)]
    pub execution_log: Vec<ExecutionLogEntry>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum MarketOutcome {
    Completed(Box<PipelineResult>),
    Failed(FailureRecord),
}

impl MarketOutcome {
    pub fn is_failure(&self) -> bool {
        matches!(self, MarketOutcome::Failed(_))
    }
}

/// Per-batch report, in market selection order.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct BatchReport {
    pub label: String,
    pub started_at: DateTime<Utc>,
    pub entries: Vec<BatchEntry>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct BatchEntry {
    pub slug: String,
    pub question: String,
    pub outcome: MarketOutcome,
}

impl BatchReport {
    pub fn failed_count(&self) -> usize {
        self.entries.iter().filter(|e| e.outcome.is_failure()).count()
    }
}
