//! Prompt templates for model generation and repair.

use crate::core::error::FailureKind;
use crate::core::types::{MarketDescriptor, ResearchBundle};

/// Contract the generated program must satisfy. Kept strict: the engine only
/// ever calls `run_trial(seed)` and treats the metric as a black box.
pub const SYSTEM_PROMPT: &str = r#"You are an expert agent-based modeling scientist. You write complete, self-contained Python simulation programs for binary prediction-market questions.

## Required contract

Your program MUST define:

1. `run_trial(seed: int)` — runs ONE simulation with the given seed and
   returns either a float metric, or a tuple `(metric, aux)` where `metric`
   is a float. The metric must be finite (never NaN or infinity), must be
   deterministic for a given seed, and should land in a bounded range you
   choose (prefer [0, 1], higher = more likely YES).
2. `MODEL_DESCRIPTION` — a module-level triple-quoted string containing a
   JSON object with fields:
   - "agents": list of {"name", "count", "role"}
   - "rationale": one sentence on why this model fits the question
   - "outcome_interpretation": one sentence mapping the metric to YES/NO

You MAY also define `run_monte_carlo(...)`; the engine ignores it and
aggregates trials itself.

## Constraints

- Seed ALL randomness from the `seed` argument (random.Random(seed) or
  numpy.random.default_rng(seed)). Never use unseeded global randomness.
- At most 200 agents and at most 500 simulation steps per trial; one trial
  must finish in under 3 seconds.
- No network access, no reading or writing files outside /tmp, no
  subprocesses, no infinite or unbounded loops, no input().
- Use only the standard library, numpy, and mesa if needed.
- Output ONLY the Python program. No markdown fences, no prose.
"#;

/// Fixer persona: minimal diffs, keep structure.
pub const REPAIR_SYSTEM_PROMPT: &str = r#"You are a Python debugger for agent-based Monte Carlo simulations. You receive a program that failed, plus its failure diagnostics. Return a corrected version of the COMPLETE program.

Rules:
- Preserve the original structure and modeling logic; fix only what is broken.
- The contract still applies: `run_trial(seed)` returning a finite float
  metric (or (metric, aux)), all randomness seeded from `seed`,
  MODEL_DESCRIPTION block present, one trial under 3 seconds.
- Return ONLY the corrected Python program. No markdown fences, no prose.
"#;

/// Framing applied to the market question before it hits the research tool.
pub fn research_query(question: &str) -> String {
    format!(
        "Provide current data and context for this prediction market question:\n\
         \"{question}\"\n\n\
         Include:\n\
         - Recent news and developments\n\
         - Key statistics and data points\n\
         - Expert opinions and forecasts\n\
         - Historical context\n\
         - Factors that could influence the outcome"
    )
}

pub fn generation_prompt(market: &MarketDescriptor, research: &ResearchBundle) -> String {
    let research_section = if research.is_empty() {
        "No research context available; rely on general knowledge.".to_string()
    } else {
        research.text.clone()
    };

    format!(
        "## Prediction Market Question\n{question}\n\n\
         ## Current Market Odds\n\
         - Yes: {yes:.0}%\n\
         - No: {no:.0}%\n\n\
         ## Research Data\n{research_section}\n\n\
         ## Your Task\n\
         Write the complete simulation program. Consider:\n\
         1. Who are the key actors? (2-4 agent types)\n\
         2. What behaviors influence the outcome?\n\
         3. What raw metric best captures how likely YES is?\n\n\
         Return only the code.",
        question = market.question,
        yes = market.yes_price * 100.0,
        no = (1.0 - market.yes_price) * 100.0,
    )
}

pub struct RepairRequest {
    pub classification: FailureKind,
    pub exit_code: Option<i32>,
    pub stderr_tail: String,
    pub phase: crate::core::types::Phase,
}

pub fn repair_prompt(code: &str, failure: &RepairRequest) -> String {
    let hint = match failure.classification {
        FailureKind::Timeout => {
            "\nHint: a single trial must finish in under 3 seconds. Reduce agent \
             counts or step counts so the work per trial is strictly bounded."
        }
        FailureKind::NonFinite => {
            "\nHint: the metric came back NaN or infinite. Guard divisions and \
             clamp the metric into its intended range before returning it."
        }
        FailureKind::Structural => {
            "\nHint: the program is missing the required run_trial(seed) entry \
             point or violates a stated constraint. Restore the full contract."
        }
        FailureKind::InsufficientStochasticity => {
            "\nHint: every trial produced essentially the same metric, so a Monte \
             Carlo over this model is meaningless. Introduce seeded randomness \
             that materially moves the outcome between trials."
        }
        _ => "",
    };

    format!(
        "This program failed during {phase:?} with a {kind}.\n\n\
         ## Program\n```python\n{code}\n```\n\n\
         ## Diagnostics\nexit code: {exit}\n```\n{stderr}\n```\n{hint}\n\n\
         Return the corrected program:",
        phase = failure.phase,
        kind = failure.classification,
        exit = failure
            .exit_code
            .map(|c| c.to_string())
            .unwrap_or_else(|| "n/a".to_string()),
        stderr = failure.stderr_tail,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::Phase;

    fn market() -> MarketDescriptor {
        MarketDescriptor {
            slug: "fed-cut-dec".into(),
            question: "Will the Fed cut rates in December 2025?".into(),
            yes_price: 0.65,
            volume: Some(950_000.0),
            end_date: None,
        }
    }

    #[test]
    fn generation_prompt_includes_odds_and_research() {
        let research = ResearchBundle {
            text: "CPI cooled to 2.4%".into(),
            ..Default::default()
        };
        let p = generation_prompt(&market(), &research);
        assert!(p.contains("Yes: 65%"));
        assert!(p.contains("No: 35%"));
        assert!(p.contains("CPI cooled"));
    }

    #[test]
    fn repair_prompt_carries_timeout_hint() {
        let p = repair_prompt(
            "def run_trial(seed): ...",
            &RepairRequest {
                classification: FailureKind::Timeout,
                exit_code: Some(-1),
                stderr_tail: String::new(),
                phase: Phase::Smoke,
            },
        );
        assert!(p.contains("under 3 seconds"));
    }
}
