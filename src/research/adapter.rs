use crate::config::config::ResearchCfg;
use crate::core::error::EngineError;
use crate::core::types::ResearchBundle;
use crate::sandbox::client::ToolEndpoint;
use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde_json::json;
use std::time::Duration;
use tracing::{info, warn};

/// Research seam. Grounding is helpful, not required: callers treat
/// ResearchUnavailable as "continue with an empty bundle".
#[async_trait]
pub trait ResearchClient: Send + Sync + 'static {
    async fn research(
        &self,
        endpoint: &ToolEndpoint,
        question: &str,
    ) -> Result<ResearchBundle, EngineError>;
}

/// Calls the research tool through the sandbox's tool gateway. The gateway
/// speaks an MCP-flavored tools/call envelope and authorizes via the
/// sandbox-scoped bearer token.
pub struct ToolGatewayResearchClient {
    client: Client,
    cfg: ResearchCfg,
}

impl ToolGatewayResearchClient {
    pub fn new(cfg: ResearchCfg, client: Client) -> Self {
        Self { client, cfg }
    }

    async fn call_once(
        &self,
        endpoint: &ToolEndpoint,
        question: &str,
    ) -> Result<ResearchBundle, EngineError> {
        let body = json!({
            "method": "tools/call",
            "params": {
                "name": "research_ask",
                "arguments": {
                    "messages": [{"role": "user", "content": question}]
                }
            }
        });

        let res = self
            .client
            .post(&endpoint.url)
            .bearer_auth(&endpoint.token)
            .timeout(self.cfg.request_timeout)
            .json(&body)
            .send()
            .await
            .map_err(|e| EngineError::ResearchUnavailable(e.to_string()))?;

        match res.status() {
            s if s.is_success() => {}
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
                let body = res.text().await.unwrap_or_default();
                return Err(EngineError::AuthDenied(format!("research auth: {body}")));
            }
            s => {
                let body = res.text().await.unwrap_or_default();
                return Err(EngineError::ResearchUnavailable(format!(
                    "status {s}: {body}"
                )));
            }
        }

        let parsed: serde_json::Value = res
            .json()
            .await
            .map_err(|e| EngineError::ResearchUnavailable(format!("malformed response: {e}")))?;

        Ok(parse_bundle(&parsed))
    }
}

/// Extract the text blocks (and optional citations) from a tools/call result.
fn parse_bundle(value: &serde_json::Value) -> ResearchBundle {
    let mut text = String::new();
    if let Some(blocks) = value["content"].as_array() {
        for block in blocks {
            if let Some(t) = block["text"].as_str() {
                if !text.is_empty() {
                    text.push('\n');
                }
                text.push_str(t);
            }
        }
    } else if let Some(t) = value["text"].as_str() {
        text.push_str(t);
    }

    let citations = value["citations"]
        .as_array()
        .map(|a| {
            a.iter()
                .filter_map(|c| c.as_str().map(str::to_string))
                .collect()
        })
        .unwrap_or_default();

    // Bulleted lines double as highlights for the summary page.
    let highlights = text
        .lines()
        .filter(|l| l.trim_start().starts_with("- "))
        .map(|l| l.trim_start().trim_start_matches("- ").to_string())
        .take(8)
        .collect();

    ResearchBundle {
        text,
        highlights,
        citations,
    }
}

#[async_trait]
impl ResearchClient for ToolGatewayResearchClient {
    async fn research(
        &self,
        endpoint: &ToolEndpoint,
        question: &str,
    ) -> Result<ResearchBundle, EngineError> {
        let mut backoff = Duration::from_millis(500);
        let mut last_err = None;

        for attempt in 0..self.cfg.max_retries.max(1) {
            match self.call_once(endpoint, question).await {
                Ok(bundle) => {
                    info!(chars = bundle.text.len(), "research gathered");
                    return Ok(bundle);
                }
                // Auth problems never recover on retry.
                Err(e @ EngineError::AuthDenied(_)) => return Err(e),
                Err(e) => {
                    warn!(attempt, error = %e, "research call failed");
                    last_err = Some(e);
                    if attempt + 1 < self.cfg.max_retries {
                        tokio::time::sleep(backoff).await;
                        backoff *= 2;
                    }
                }
            }
        }

        Err(last_err
            .unwrap_or_else(|| EngineError::ResearchUnavailable("no attempts made".into())))
    }
}

/// Offline stand-in with canned context.
pub struct SimResearchClient;

#[async_trait]
impl ResearchClient for SimResearchClient {
    async fn research(
        &self,
        _endpoint: &ToolEndpoint,
        question: &str,
    ) -> Result<ResearchBundle, EngineError> {
        Ok(ResearchBundle {
            text: format!(
                "Offline research stub for: {question}\n\
                 - No live sources consulted.\n\
                 - Treat the market price as the best available prior."
            ),
            highlights: vec!["No live sources consulted.".to_string()],
            citations: Vec::new(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_bundle_extracts_text_blocks() {
        let v = json!({
            "content": [
                {"type": "text", "text": "First paragraph."},
                {"type": "text", "text": "- CPI printed at 2.4%\n- Futures price two cuts"}
            ],
            "citations": ["https://example.com/a"]
        });
        let b = parse_bundle(&v);
        assert!(b.text.contains("First paragraph."));
        assert_eq!(b.highlights.len(), 2);
        assert_eq!(b.citations, vec!["https://example.com/a".to_string()]);
    }

    #[test]
    fn parse_bundle_handles_flat_text() {
        let b = parse_bundle(&json!({"text": "plain"}));
        assert_eq!(b.text, "plain");
        assert!(b.highlights.is_empty());
    }

    #[tokio::test]
    async fn sim_research_is_never_empty() {
        let endpoint = ToolEndpoint {
            url: "http://x.invalid".into(),
            token: "t".into(),
        };
        let b = SimResearchClient
            .research(&endpoint, "Will it rain?")
            .await
            .unwrap();
        assert!(b.text.contains("Will it rain?"));
    }
}
