pub mod prompts;

use crate::core::error::EngineError;
use crate::core::types::{MarketDescriptor, ModelDescription, ResearchBundle, SimulationArtifact};
use crate::llm::LlmProvider;
use prompts::RepairRequest;
use std::sync::Arc;
use tracing::{info, warn};

/// Number of extra attempts against the LLM provider on transient errors.
const PROVIDER_RETRIES: u32 = 2;

/// Authors simulation artifacts: an initial program from question + research,
/// and corrected programs from prior code + failure diagnostics.
pub struct CodeGenerator {
    llm: Arc<dyn LlmProvider>,
}

impl CodeGenerator {
    pub fn new(llm: Arc<dyn LlmProvider>) -> Self {
        Self { llm }
    }

    pub async fn initial(
        &self,
        market: &MarketDescriptor,
        research: &ResearchBundle,
    ) -> Result<SimulationArtifact, EngineError> {
        let user = prompts::generation_prompt(market, research);
        let text = self
            .complete_with_retry(prompts::SYSTEM_PROMPT, &user)
            .await?;
        let artifact = into_artifact(&text)?;
        info!(chars = artifact.code.len(), "generated initial artifact");
        Ok(artifact)
    }

    pub async fn repair(
        &self,
        artifact: &SimulationArtifact,
        failure: &RepairRequest,
    ) -> Result<SimulationArtifact, EngineError> {
        let user = prompts::repair_prompt(&artifact.code, failure);
        let text = self
            .complete_with_retry(prompts::REPAIR_SYSTEM_PROMPT, &user)
            .await?;
        let repaired = into_artifact(&text)?;
        info!(
            kind = %failure.classification,
            chars = repaired.code.len(),
            "generated repaired artifact"
        );
        Ok(repaired)
    }

    async fn complete_with_retry(
        &self,
        system: &str,
        user: &str,
    ) -> Result<String, EngineError> {
        let mut last_err = None;
        for attempt in 0..=PROVIDER_RETRIES {
            match self.llm.complete(system, user).await {
                Ok(text) => return Ok(text),
                Err(e) if e.is_transient() && attempt < PROVIDER_RETRIES => {
                    warn!(attempt, error = %e, "LLM call failed, retrying");
                    tokio::time::sleep(std::time::Duration::from_millis(
                        500 * (attempt as u64 + 1),
                    ))
                    .await;
                    last_err = Some(e);
                }
                Err(e) => return Err(e),
            }
        }
        Err(last_err.unwrap_or_else(|| EngineError::LlmUnavailable("no attempts made".into())))
    }
}

/// Normalize raw LLM output into an artifact: strip markdown fences, extract
/// the self-description block. Structural validation happens in the repair
/// loop so a bad program is repaired, not discarded.
fn into_artifact(text: &str) -> Result<SimulationArtifact, EngineError> {
    let code = strip_markdown_fences(text).trim().to_string();
    if code.is_empty() {
        return Err(EngineError::GenerationInvalid("empty completion".into()));
    }
    let description = extract_description(&code);
    Ok(SimulationArtifact::new(code, description))
}

/// Returns the reason the program violates the artifact contract, if any.
/// Checked host-side before spending a sandbox exec on it.
pub fn structural_violation(code: &str) -> Option<String> {
    if !code.contains("def run_trial(") {
        return Some("missing run_trial(seed) entry point".to_string());
    }
    const FORBIDDEN: [(&str, &str); 5] = [
        ("import requests", "network access (requests)"),
        ("import urllib", "network access (urllib)"),
        ("import socket", "network access (socket)"),
        ("import subprocess", "subprocess spawn"),
        ("input(", "interactive input"),
    ];
    for (needle, reason) in FORBIDDEN {
        if code.contains(needle) {
            return Some(format!("forbidden pattern: {reason}"));
        }
    }
    None
}

fn strip_markdown_fences(text: &str) -> &str {
    let trimmed = text.trim();
    let without_open = trimmed
        .strip_prefix("```python")
        .or_else(|| trimmed.strip_prefix("```"))
        .unwrap_or(trimmed);
    without_open
        .trim_start_matches(['\r', '\n'])
        .strip_suffix("```")
        .unwrap_or(without_open)
}

/// Pull the JSON out of the MODEL_DESCRIPTION triple-quoted block. Absence or
/// parse failure is not an error; the explanation field just stays null.
fn extract_description(code: &str) -> Option<ModelDescription> {
    let start = code.find("MODEL_DESCRIPTION")?;
    let rest = &code[start..];
    let (open, quote) = rest
        .find("\"\"\"")
        .map(|i| (i, "\"\"\""))
        .or_else(|| rest.find("'''").map(|i| (i, "'''")))?;
    let body = &rest[open + 3..];
    let close = body.find(quote)?;
    serde_json::from_str(body[..close].trim()).ok()
}
