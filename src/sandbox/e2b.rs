use crate::config::config::SandboxCfg;
use crate::core::error::EngineError;
use crate::sandbox::client::{ExecResult, SandboxClient, SandboxHandle, ToolEndpoint};
use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tracing::{info, warn};

/// Remote sandbox provider client (E2B-style REST surface). Template is
/// expected to carry the simulation runtime and the research-tool gateway
/// preinstalled; the research key is handed to the provider at create time so
/// it can mint a sandbox-scoped gateway token.
pub struct E2bSandboxClient {
    client: Client,
    cfg: SandboxCfg,
    research_api_key: String,
}

impl E2bSandboxClient {
    pub fn new(cfg: SandboxCfg, research_api_key: String, client: Client) -> Self {
        Self {
            client,
            cfg,
            research_api_key,
        }
    }

    fn map_status(status: StatusCode, body: String) -> EngineError {
        match status {
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => EngineError::AuthDenied(body),
            StatusCode::TOO_MANY_REQUESTS => EngineError::RateLimited(body),
            s if s.is_server_error() => EngineError::SandboxUnavailable(body),
            _ => EngineError::SandboxUnavailable(format!("status {status}: {body}")),
        }
    }
}

#[derive(Serialize)]
struct CreateSandboxReq<'a> {
    #[serde(rename = "templateID")]
    template_id: &'a str,
    #[serde(rename = "timeoutMs")]
    timeout_ms: u64,
    #[serde(rename = "researchApiKey", skip_serializing_if = "str::is_empty")]
    research_api_key: &'a str,
}

#[derive(Deserialize)]
struct CreateSandboxResp {
    #[serde(rename = "sandboxID")]
    sandbox_id: String,
    #[serde(rename = "toolGatewayUrl")]
    tool_gateway_url: String,
    #[serde(rename = "toolGatewayToken")]
    tool_gateway_token: String,
}

#[derive(Serialize)]
struct ExecReq<'a> {
    code: &'a str,
    #[serde(rename = "timeoutMs")]
    timeout_ms: u64,
}

#[derive(Deserialize)]
struct ExecResp {
    #[serde(rename = "exitCode")]
    exit_code: i32,
    #[serde(default)]
    stdout: String,
    #[serde(default)]
    stderr: String,
    #[serde(rename = "timedOut", default)]
    timed_out: bool,
}

#[derive(Serialize)]
struct WriteFileReq<'a> {
    path: &'a str,
    content: &'a str,
}

#[async_trait]
impl SandboxClient for E2bSandboxClient {
    async fn acquire(&self) -> Result<Arc<dyn SandboxHandle>, EngineError> {
        let url = format!("{}/sandboxes", self.cfg.base_url);
        let res = self
            .client
            .post(&url)
            .header("X-API-Key", &self.cfg.api_key)
            .json(&CreateSandboxReq {
                template_id: &self.cfg.template_id,
                timeout_ms: self.cfg.lifetime.as_millis() as u64,
                research_api_key: &self.research_api_key,
            })
            .send()
            .await
            .map_err(|e| EngineError::SandboxUnavailable(e.to_string()))?;

        if !res.status().is_success() {
            let status = res.status();
            let body = res.text().await.unwrap_or_default();
            return Err(Self::map_status(status, body));
        }

        let created: CreateSandboxResp = res
            .json()
            .await
            .map_err(|e| EngineError::SandboxUnavailable(format!("malformed create response: {e}")))?;

        info!(sandbox_id = %created.sandbox_id, "sandbox acquired");
        metrics::gauge!("polysim_sandboxes_live").increment(1.0);

        Ok(Arc::new(E2bSandbox {
            client: self.client.clone(),
            base_url: self.cfg.base_url.clone(),
            api_key: self.cfg.api_key.clone(),
            sandbox_id: created.sandbox_id,
            endpoint: ToolEndpoint {
                url: created.tool_gateway_url,
                token: created.tool_gateway_token,
            },
            released: AtomicBool::new(false),
        }))
    }
}

pub struct E2bSandbox {
    client: Client,
    base_url: String,
    api_key: String,
    sandbox_id: String,
    endpoint: ToolEndpoint,
    released: AtomicBool,
}

#[async_trait]
impl SandboxHandle for E2bSandbox {
    fn id(&self) -> &str {
        &self.sandbox_id
    }

    async fn exec(&self, code: &str, timeout: Duration) -> Result<ExecResult, EngineError> {
        let url = format!("{}/sandboxes/{}/exec", self.base_url, self.sandbox_id);

        // Give the transport a margin over the in-sandbox timeout so a slow
        // trial surfaces as timed_out, not as a connection error.
        let send = self
            .client
            .post(&url)
            .header("X-API-Key", &self.api_key)
            .timeout(timeout + Duration::from_secs(10))
            .json(&ExecReq {
                code,
                timeout_ms: timeout.as_millis() as u64,
            })
            .send();

        let res = match send.await {
            Ok(r) => r,
            Err(e) if e.is_timeout() => {
                return Ok(ExecResult {
                    exit_code: -1,
                    stdout: String::new(),
                    stderr: "transport timeout".to_string(),
                    timed_out: true,
                });
            }
            Err(e) => return Err(EngineError::SandboxUnavailable(e.to_string())),
        };

        if !res.status().is_success() {
            let status = res.status();
            let body = res.text().await.unwrap_or_default();
            return Err(Self::map_exec_status(status, body));
        }

        let parsed: ExecResp = res
            .json()
            .await
            .map_err(|e| EngineError::SandboxUnavailable(format!("malformed exec response: {e}")))?;

        Ok(ExecResult {
            exit_code: parsed.exit_code,
            stdout: parsed.stdout,
            stderr: parsed.stderr,
            timed_out: parsed.timed_out,
        })
    }

    async fn write_file(&self, path: &str, bytes: &[u8]) -> Result<(), EngineError> {
        let url = format!("{}/sandboxes/{}/files", self.base_url, self.sandbox_id);
        let content = String::from_utf8_lossy(bytes);
        let res = self
            .client
            .post(&url)
            .header("X-API-Key", &self.api_key)
            .json(&WriteFileReq {
                path,
                content: &content,
            })
            .send()
            .await
            .map_err(|e| EngineError::SandboxUnavailable(e.to_string()))?;

        if !res.status().is_success() {
            let status = res.status();
            let body = res.text().await.unwrap_or_default();
            return Err(E2bSandboxClient::map_status(status, body));
        }
        Ok(())
    }

    async fn read_file(&self, path: &str) -> Result<Vec<u8>, EngineError> {
        let url = format!("{}/sandboxes/{}/files", self.base_url, self.sandbox_id);
        let res = self
            .client
            .get(&url)
            .header("X-API-Key", &self.api_key)
            .query(&[("path", path)])
            .send()
            .await
            .map_err(|e| EngineError::SandboxUnavailable(e.to_string()))?;

        if !res.status().is_success() {
            let status = res.status();
            let body = res.text().await.unwrap_or_default();
            return Err(E2bSandboxClient::map_status(status, body));
        }
        let bytes = res
            .bytes()
            .await
            .map_err(|e| EngineError::SandboxUnavailable(e.to_string()))?;
        Ok(bytes.to_vec())
    }

    fn tool_endpoint(&self) -> ToolEndpoint {
        self.endpoint.clone()
    }

    async fn release(&self) {
        if self.released.swap(true, Ordering::SeqCst) {
            return; // already released
        }
        metrics::gauge!("polysim_sandboxes_live").decrement(1.0);

        let url = format!("{}/sandboxes/{}", self.base_url, self.sandbox_id);
        // Teardown must never fail the pipeline; the provider reaps expired
        // sandboxes anyway, so a failed kill only costs its remaining lifetime.
        match self
            .client
            .delete(&url)
            .header("X-API-Key", &self.api_key)
            .send()
            .await
        {
            Ok(res) if res.status().is_success() => {
                info!(sandbox_id = %self.sandbox_id, "sandbox released");
            }
            Ok(res) => {
                warn!(sandbox_id = %self.sandbox_id, status = %res.status(), "sandbox kill rejected");
            }
            Err(e) => {
                warn!(sandbox_id = %self.sandbox_id, error = %e, "sandbox kill failed");
            }
        }
    }
}

impl E2bSandbox {
    fn map_exec_status(status: StatusCode, body: String) -> EngineError {
        E2bSandboxClient::map_status(status, body)
    }
}
