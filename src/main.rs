mod config;
mod core;
mod engine;
mod generator;
mod llm;
mod report;
mod research;
mod sandbox;

use anyhow::{Context, Result};
use clap::Parser;
use crate::config::config::AppCfg;
use crate::core::types::{MarketDescriptor, SimulationArtifact};
use crate::engine::pipeline::{PipelineDeps, PipelineOptions};
use crate::engine::scheduler::BatchScheduler;
use crate::llm::{LlmClient, SimLlmClient};
use crate::research::adapter::{SimResearchClient, ToolGatewayResearchClient};
use crate::sandbox::e2b::E2bSandboxClient;
use crate::sandbox::simulator::SimSandboxClient;
use reqwest::Client;
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

const EXIT_OK: i32 = 0;
const EXIT_INVALID_INPUT: i32 = 2;
const EXIT_PROVIDER_UNAVAILABLE: i32 = 3;
const EXIT_PARTIAL_FAILURE: i32 = 4;
const EXIT_TOTAL_FAILURE: i32 = 5;

/// Compare prediction-market odds with LLM-generated Monte Carlo simulations.
#[derive(Parser, Debug)]
#[command(name = "polysim", version)]
struct Cli {
    /// JSON file with the markets to simulate
    /// (array of {slug?, question, yes_price, volume?, end_date?}).
    markets: PathBuf,

    /// Label for the result directory.
    #[arg(long, default_value = "batch")]
    label: String,

    /// Monte Carlo runs per market (overrides config).
    #[arg(long)]
    runs: Option<u32>,

    /// Explicit success threshold; calibration stats are still recorded.
    #[arg(long)]
    threshold: Option<f64>,

    /// Treat metrics as probabilities and draw Bernoulli outcomes.
    #[arg(long)]
    probability_mode: bool,

    /// Run fully offline against the in-process simulator sandbox.
    #[arg(long)]
    offline: bool,

    /// Config file path.
    #[arg(long, default_value = "config.yml")]
    config: String,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .json()
        .with_max_level(tracing::Level::INFO)
        .with_current_span(false)
        .init();
    dotenv::dotenv().ok();

    let cli = Cli::parse();
    let code = match run(cli).await {
        Ok(code) => code,
        Err(e) => {
            error!("{e:#}");
            EXIT_INVALID_INPUT
        }
    };
    std::process::exit(code);
}

async fn run(cli: Cli) -> Result<i32> {
    let mut cfg = match AppCfg::load(&cli.config) {
        Ok(cfg) => cfg,
        Err(e) => {
            error!("invalid configuration: {e:#}");
            return Ok(EXIT_INVALID_INPUT);
        }
    };

    // CLI flags beat file and environment.
    if let Some(runs) = cli.runs {
        cfg.engine.monte_carlo_runs = runs;
    }
    if let Some(threshold) = cli.threshold {
        cfg.engine.user_threshold = Some(threshold);
    }
    if cli.probability_mode {
        cfg.engine.probability_mode = true;
    }
    if cli.offline {
        cfg.sandbox.simulate = true;
    }
    if let Err(e) = cfg.validate() {
        error!("invalid configuration: {e:#}");
        return Ok(EXIT_INVALID_INPUT);
    }

    let markets = match load_markets(&cli.markets).await {
        Ok(m) => m,
        Err(e) => {
            error!("invalid markets file: {e:#}");
            return Ok(EXIT_INVALID_INPUT);
        }
    };
    info!(markets = markets.len(), label = %cli.label, "batch input loaded");

    serve_metrics(&cfg.report.metrics_addr);
    metrics::counter!("polysim_startups_total").increment(1);

    let http = Client::builder()
        .use_rustls_tls()
        .user_agent(cfg.http.user_agent.clone())
        .pool_idle_timeout(cfg.http.pool_idle_timeout)
        .pool_max_idle_per_host(cfg.http.pool_max_idle_per_host)
        .timeout(cfg.http.timeout)
        .build()
        .context("building HTTP client")?;

    let deps = if cfg.sandbox.simulate {
        info!("running in OFFLINE SIMULATOR mode");
        PipelineDeps {
            sandbox_client: Arc::new(SimSandboxClient::new()),
            llm: Arc::new(SimLlmClient::new()),
            research: Arc::new(SimResearchClient),
        }
    } else {
        if !cfg.has_live_credentials() {
            error!("missing LLM_API_KEY / SANDBOX_API_KEY; cannot start a live batch");
            return Ok(EXIT_PROVIDER_UNAVAILABLE);
        }
        PipelineDeps {
            sandbox_client: Arc::new(E2bSandboxClient::new(
                cfg.sandbox.clone(),
                cfg.research.api_key.clone(),
                http.clone(),
            )),
            llm: Arc::new(LlmClient::new(cfg.llm.clone(), http.clone())),
            research: Arc::new(ToolGatewayResearchClient::new(
                cfg.research.clone(),
                http.clone(),
            )),
        }
    };

    let fallback = load_fallback(cfg.engine.fallback_model_path.as_deref()).await;
    let opts = PipelineOptions::from_cfg(&cfg.engine, &cfg.sandbox, fallback);
    let scheduler = BatchScheduler::new(
        deps,
        opts,
        cfg.engine.batch_concurrency,
        cfg.engine.pipeline_timeout,
    );

    let shutdown = CancellationToken::new();
    {
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("ctrl-c received, cancelling in-flight pipelines");
                shutdown.cancel();
            }
        });
    }

    let total = markets.len();
    let report = scheduler.run_batch(&cli.label, markets, shutdown).await;
    let dir = report::assembler::write_batch(&report, &cfg.report).await?;

    let failed = report.failed_count();
    info!(
        total,
        failed,
        results = %dir.display(),
        "batch finished"
    );

    Ok(if failed == 0 {
        EXIT_OK
    } else if failed == total {
        EXIT_TOTAL_FAILURE
    } else {
        EXIT_PARTIAL_FAILURE
    })
}

async fn load_markets(path: &PathBuf) -> Result<Vec<MarketDescriptor>> {
    let raw = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("reading {}", path.display()))?;
    let markets: Vec<MarketDescriptor> =
        serde_json::from_str(&raw).context("parsing markets JSON")?;
    anyhow::ensure!(!markets.is_empty(), "markets file is empty");
    for m in &markets {
        anyhow::ensure!(
            (0.0..=1.0).contains(&m.yes_price),
            "market '{}': yes_price {} outside [0, 1]",
            m.effective_slug(),
            m.yes_price
        );
        anyhow::ensure!(
            !m.question.trim().is_empty(),
            "market '{}' has an empty question",
            m.effective_slug()
        );
    }
    Ok(markets)
}

async fn load_fallback(path: Option<&str>) -> Option<SimulationArtifact> {
    let path = path?;
    match tokio::fs::read_to_string(path).await {
        Ok(code) => {
            info!(%path, "fallback artifact loaded");
            Some(SimulationArtifact::new(code, None))
        }
        Err(e) => {
            warn!(%path, error = %e, "fallback artifact unavailable");
            None
        }
    }
}

/// Prometheus endpoint, same shape as every other service here.
fn serve_metrics(addr: &str) {
    let builder = metrics_exporter_prometheus::PrometheusBuilder::new();
    let handle = match builder.install_recorder() {
        Ok(h) => h,
        Err(e) => {
            warn!(error = %e, "failed to install Prometheus recorder");
            return;
        }
    };

    let addr = addr.to_string();
    tokio::spawn(async move {
        let app = axum::Router::new().route(
            "/metrics",
            axum::routing::get(move || {
                let handle = handle.clone();
                async move { handle.render() }
            }),
        );
        match tokio::net::TcpListener::bind(&addr).await {
            Ok(listener) => {
                info!("metrics endpoint listening on {addr}/metrics");
                if let Err(e) = axum::serve(listener, app).await {
                    warn!(error = %e, "metrics server stopped");
                }
            }
            Err(e) => warn!(error = %e, "could not bind metrics endpoint"),
        }
    });
}
