use crate::core::error::EngineError;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;

/// Authenticated endpoint, reachable from inside the sandbox, that mediates
/// calls to the research provider. The token is scoped to one sandbox and is
/// never logged.
#[derive(Clone)]
pub struct ToolEndpoint {
    pub url: String,
    pub token: String,
}

impl std::fmt::Debug for ToolEndpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Redact the bearer token.
        f.debug_struct("ToolEndpoint")
            .field("url", &self.url)
            .field("token", &"<redacted>")
            .finish()
    }
}

#[derive(Clone, Debug, Default)]
pub struct ExecResult {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
    pub timed_out: bool,
}

impl ExecResult {
    pub fn ok(&self) -> bool {
        self.exit_code == 0 && !self.timed_out
    }
}

/// Provider of hermetic execution environments. One sandbox per pipeline,
/// never reused across pipelines.
#[async_trait]
pub trait SandboxClient: Send + Sync + 'static {
    async fn acquire(&self) -> Result<Arc<dyn SandboxHandle>, EngineError>;
}

/// A live sandbox. All operations are suspension points; `release` is
/// idempotent, must not fail, and is called on every pipeline exit path.
#[async_trait]
pub trait SandboxHandle: Send + Sync {
    fn id(&self) -> &str;

    async fn exec(&self, code: &str, timeout: Duration) -> Result<ExecResult, EngineError>;

    async fn write_file(&self, path: &str, bytes: &[u8]) -> Result<(), EngineError>;

    #[allow(dead_code)]
    async fn read_file(&self, path: &str) -> Result<Vec<u8>, EngineError>;

    fn tool_endpoint(&self) -> ToolEndpoint;

    async fn release(&self);
}
