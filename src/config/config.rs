use anyhow::{Context, Result};
use config::{Config, File};
use serde::Deserialize;
use std::time::Duration;

#[derive(Debug, Deserialize, Clone, Default)]
pub struct AppCfg {
    #[serde(default)]
    pub http: HttpCfg,
    #[serde(default)]
    pub llm: LlmCfg,
    #[serde(default)]
    pub sandbox: SandboxCfg,
    #[serde(default)]
    pub research: ResearchCfg,
    #[serde(default)]
    pub engine: EngineCfg,
    #[serde(default)]
    pub report: ReportCfg,
}

#[derive(Debug, Deserialize, Clone)]
pub struct HttpCfg {
    #[serde(rename = "userAgent", default = "default_ua")]
    pub user_agent: String,
    #[serde(with = "humantime_serde", default = "default_http_timeout")]
    pub timeout: Duration,
    #[serde(rename = "poolIdleTimeout", with = "humantime_serde", default = "default_pool_idle")]
    pub pool_idle_timeout: Duration,
    #[serde(rename = "poolMaxIdlePerHost", default = "default_pool")]
    pub pool_max_idle_per_host: usize,
}

impl Default for HttpCfg {
    fn default() -> Self {
        Self {
            user_agent: default_ua(),
            timeout: default_http_timeout(),
            pool_idle_timeout: default_pool_idle(),
            pool_max_idle_per_host: default_pool(),
        }
    }
}
fn default_ua() -> String {
    "polysim/0.1".into()
}
fn default_http_timeout() -> Duration {
    Duration::from_secs(30)
}
fn default_pool_idle() -> Duration {
    Duration::from_secs(90)
}
fn default_pool() -> usize {
    16
}

#[derive(Debug, Deserialize, Clone)]
pub struct LlmCfg {
    #[serde(rename = "baseUrl", default = "default_llm_base_url")]
    pub base_url: String,
    #[serde(default)]
    pub api_key: String,
    #[serde(default = "default_llm_model")]
    pub model: String,
    #[serde(rename = "maxTokens", default = "default_llm_max_tokens")]
    pub max_tokens: u32,
    #[serde(rename = "rateLimitRpm", default = "default_llm_rpm")]
    pub rate_limit_rpm: u32,
    #[serde(rename = "requestTimeout", with = "humantime_serde", default = "default_llm_timeout")]
    pub request_timeout: Duration,
}

impl Default for LlmCfg {
    fn default() -> Self {
        Self {
            base_url: default_llm_base_url(),
            api_key: String::new(),
            model: default_llm_model(),
            max_tokens: default_llm_max_tokens(),
            rate_limit_rpm: default_llm_rpm(),
            request_timeout: default_llm_timeout(),
        }
    }
}
fn default_llm_base_url() -> String {
    "https://api.openai.com/v1".to_string()
}
fn default_llm_model() -> String {
    "gpt-4o".to_string()
}
fn default_llm_max_tokens() -> u32 {
    4096
}
fn default_llm_rpm() -> u32 {
    30
}
fn default_llm_timeout() -> Duration {
    Duration::from_secs(120)
}

#[derive(Debug, Deserialize, Clone)]
pub struct SandboxCfg {
    #[serde(rename = "baseUrl", default = "default_sandbox_base_url")]
    pub base_url: String,
    #[serde(default)]
    pub api_key: String,
    #[serde(rename = "templateId", default = "default_template")]
    pub template_id: String,
    /// Run against the in-process simulator sandbox instead of the remote
    /// provider (offline mode).
    #[serde(default)]
    pub simulate: bool,
    #[serde(rename = "execTimeout", with = "humantime_serde", default = "default_exec_timeout")]
    pub exec_timeout: Duration,
    /// Hard lifetime of a sandbox from acquire, enforced provider-side.
    #[serde(with = "humantime_serde", default = "default_sandbox_lifetime")]
    pub lifetime: Duration,
}

impl Default for SandboxCfg {
    fn default() -> Self {
        Self {
            base_url: default_sandbox_base_url(),
            api_key: String::new(),
            template_id: default_template(),
            simulate: false,
            exec_timeout: default_exec_timeout(),
            lifetime: default_sandbox_lifetime(),
        }
    }
}
fn default_sandbox_base_url() -> String {
    "https://api.e2b.dev".to_string()
}
fn default_template() -> String {
    "code-interpreter-v1".to_string()
}
fn default_exec_timeout() -> Duration {
    Duration::from_secs(60)
}
fn default_sandbox_lifetime() -> Duration {
    Duration::from_secs(600)
}

#[derive(Debug, Deserialize, Clone)]
pub struct ResearchCfg {
    #[serde(default)]
    pub api_key: String,
    #[serde(rename = "requestTimeout", with = "humantime_serde", default = "default_research_timeout")]
    pub request_timeout: Duration,
    #[serde(rename = "maxRetries", default = "default_research_retries")]
    pub max_retries: u32,
}

impl Default for ResearchCfg {
    fn default() -> Self {
        Self {
            api_key: String::new(),
            request_timeout: default_research_timeout(),
            max_retries: default_research_retries(),
        }
    }
}
fn default_research_timeout() -> Duration {
    Duration::from_secs(30)
}
fn default_research_retries() -> u32 {
    3
}

#[derive(Debug, Deserialize, Clone)]
pub struct EngineCfg {
    #[serde(rename = "batchConcurrency", default = "default_batch_concurrency")]
    pub batch_concurrency: usize,
    #[serde(rename = "monteCarloRuns", default = "default_mc_runs")]
    pub monte_carlo_runs: u32,
    #[serde(rename = "calibrationRuns", default = "default_calibration_runs")]
    pub calibration_runs: u32,
    #[serde(rename = "maxRepairRetries", default = "default_repair_retries")]
    pub max_repair_retries: u32,
    #[serde(rename = "signalEpsilon", default = "default_signal_epsilon")]
    pub signal_epsilon: f64,
    #[serde(rename = "probabilityMode", default)]
    pub probability_mode: bool,
    /// Explicit threshold from the user; calibration stats are still recorded.
    #[serde(rename = "userThreshold", default)]
    pub user_threshold: Option<f64>,
    #[serde(rename = "pipelineTimeout", with = "humantime_serde", default = "default_pipeline_timeout")]
    pub pipeline_timeout: Duration,
    /// Path to a baseline artifact used when all repair attempts fail.
    #[serde(rename = "fallbackModelPath", default)]
    pub fallback_model_path: Option<String>,
    /// Seeds per sandbox exec; sized so a chunk of 3s trials fits well inside
    /// the per-exec timeout.
    #[serde(rename = "trialChunkSize", default = "default_trial_chunk")]
    pub trial_chunk_size: usize,
}

impl Default for EngineCfg {
    fn default() -> Self {
        Self {
            batch_concurrency: default_batch_concurrency(),
            monte_carlo_runs: default_mc_runs(),
            calibration_runs: default_calibration_runs(),
            max_repair_retries: default_repair_retries(),
            signal_epsilon: default_signal_epsilon(),
            probability_mode: false,
            user_threshold: None,
            pipeline_timeout: default_pipeline_timeout(),
            fallback_model_path: None,
            trial_chunk_size: default_trial_chunk(),
        }
    }
}
fn default_batch_concurrency() -> usize {
    10
}
fn default_mc_runs() -> u32 {
    200
}
fn default_calibration_runs() -> u32 {
    50
}
fn default_repair_retries() -> u32 {
    5
}
fn default_signal_epsilon() -> f64 {
    0.05
}
fn default_pipeline_timeout() -> Duration {
    Duration::from_secs(600)
}
fn default_trial_chunk() -> usize {
    25
}

#[derive(Debug, Deserialize, Clone)]
pub struct ReportCfg {
    #[serde(rename = "resultsDir", default = "default_results_dir")]
    pub results_dir: String,
    #[serde(rename = "writeHtml", default = "default_true")]
    pub write_html: bool,
    #[serde(rename = "metricsAddr", default = "default_metrics_addr")]
    pub metrics_addr: String,
}

impl Default for ReportCfg {
    fn default() -> Self {
        Self {
            results_dir: default_results_dir(),
            write_html: true,
            metrics_addr: default_metrics_addr(),
        }
    }
}
fn default_results_dir() -> String {
    "results".to_string()
}
fn default_true() -> bool {
    true
}
fn default_metrics_addr() -> String {
    "0.0.0.0:9000".to_string()
}

impl AppCfg {
    pub fn load(path: &str) -> Result<Self> {
        let cfg = Config::builder()
            .add_source(File::with_name(path).required(false))
            .add_source(config::Environment::default().separator("__"))
            .build()
            .context("building config")?;

        let mut app: AppCfg = cfg.try_deserialize().context("deserializing config")?;
        app.apply_flat_env();
        app.validate()?;
        Ok(app)
    }

    /// Flat, conventionally named variables override whatever the file and
    /// nested env sources produced. These are the names operators actually
    /// export (.env), so they win.
    fn apply_flat_env(&mut self) {
        if let Ok(v) = std::env::var("LLM_API_KEY") {
            self.llm.api_key = v;
        }
        if let Ok(v) = std::env::var("LLM_MODEL_ID") {
            self.llm.model = v;
        }
        if let Ok(v) = std::env::var("LLM_BASE_URL") {
            self.llm.base_url = v;
        }
        if let Ok(v) = std::env::var("SANDBOX_API_KEY") {
            self.sandbox.api_key = v;
        }
        if let Ok(v) = std::env::var("SANDBOX_TEMPLATE_ID") {
            self.sandbox.template_id = v;
        }
        if let Ok(v) = std::env::var("RESEARCH_API_KEY") {
            self.research.api_key = v;
        }
        if let Ok(v) = std::env::var("BATCH_CONCURRENCY") {
            if let Ok(n) = v.parse() {
                self.engine.batch_concurrency = n;
            }
        }
        if let Ok(v) = std::env::var("MONTE_CARLO_RUNS") {
            if let Ok(n) = v.parse() {
                self.engine.monte_carlo_runs = n;
            }
        }
        if let Ok(v) = std::env::var("CALIBRATION_RUNS") {
            if let Ok(n) = v.parse() {
                self.engine.calibration_runs = n;
            }
        }
        if let Ok(v) = std::env::var("MAX_REPAIR_RETRIES") {
            if let Ok(n) = v.parse() {
                self.engine.max_repair_retries = n;
            }
        }
        if let Ok(v) = std::env::var("SIGNAL_EPSILON") {
            if let Ok(n) = v.parse() {
                self.engine.signal_epsilon = n;
            }
        }
        if let Ok(v) = std::env::var("SIMULATION_MODE") {
            self.engine.probability_mode = v.eq_ignore_ascii_case("probability");
        }
    }

    pub fn validate(&self) -> Result<()> {
        anyhow::ensure!(
            self.engine.batch_concurrency > 0,
            "engine.batchConcurrency must be > 0"
        );
        anyhow::ensure!(
            self.engine.monte_carlo_runs > 0,
            "engine.monteCarloRuns must be > 0"
        );
        anyhow::ensure!(
            self.engine.signal_epsilon >= 0.0 && self.engine.signal_epsilon <= 1.0,
            "engine.signalEpsilon must lie in [0, 1]"
        );
        anyhow::ensure!(
            self.engine.trial_chunk_size > 0,
            "engine.trialChunkSize must be > 0"
        );
        if let Some(t) = self.engine.user_threshold {
            anyhow::ensure!(t.is_finite(), "engine.userThreshold must be finite");
        }
        anyhow::ensure!(!self.llm.base_url.is_empty(), "llm.baseUrl missing");
        anyhow::ensure!(!self.sandbox.base_url.is_empty(), "sandbox.baseUrl missing");
        Ok(())
    }

    /// Credentials the engine needs before it can start a live batch. Offline
    /// mode (sandbox.simulate) runs without any.
    pub fn has_live_credentials(&self) -> bool {
        !self.llm.api_key.is_empty() && !self.sandbox.api_key.is_empty()
    }
}
