use crate::config::config::ReportCfg;
use crate::core::types::{BatchReport, MarketOutcome, slugify};
use anyhow::{Context, Result};
use std::path::{Path, PathBuf};
use tracing::info;

/// Serialize a batch to its result directory:
///
/// results/{label}_{UTC}/
///   summary.json            full BatchReport, full precision
///   summary.html            optional overview table
///   {slugified-question}/
///     model.py              final artifact text, verbatim
///     result.json           PipelineResult minus the artifact text
///     research.txt          raw research bundle
///     execution.log         one line per execution-loop entry
pub async fn write_batch(report: &BatchReport, cfg: &ReportCfg) -> Result<PathBuf> {
    let stamp = report.started_at.format("%Y%m%dT%H%M%SZ");
    let dir = Path::new(&cfg.results_dir).join(format!("{}_{stamp}", report.label));
    tokio::fs::create_dir_all(&dir)
        .await
        .with_context(|| format!("creating result directory {}", dir.display()))?;

    let summary = serde_json::to_string_pretty(report).context("serializing summary")?;
    tokio::fs::write(dir.join("summary.json"), summary)
        .await
        .context("writing summary.json")?;

    if cfg.write_html {
        tokio::fs::write(dir.join("summary.html"), render_summary_html(report))
            .await
            .context("writing summary.html")?;
    }

    for entry in &report.entries {
        let sub_name = match slugify(&entry.question) {
            s if s.is_empty() => entry.slug.clone(),
            s => s,
        };
        let sub = dir.join(&sub_name);
        tokio::fs::create_dir_all(&sub)
            .await
            .with_context(|| format!("creating market directory {}", sub.display()))?;

        match &entry.outcome {
            MarketOutcome::Completed(result) => {
                tokio::fs::write(sub.join("model.py"), &result.artifact_code)
                    .await
                    .context("writing model.py")?;
                tokio::fs::write(
                    sub.join("result.json"),
                    serde_json::to_string_pretty(result)?,
                )
                .await
                .context("writing result.json")?;
                tokio::fs::write(sub.join("research.txt"), &result.research.text)
                    .await
                    .context("writing research.txt")?;
                let log: String = result
                    .execution_log
                    .iter()
                    .map(|e| format!("{}\n", e.render()))
                    .collect();
                tokio::fs::write(sub.join("execution.log"), log)
                    .await
                    .context("writing execution.log")?;
            }
            MarketOutcome::Failed(failure) => {
                tokio::fs::write(
                    sub.join("result.json"),
                    serde_json::to_string_pretty(failure)?,
                )
                .await
                .context("writing failure result.json")?;
                let log: String = failure
                    .execution_log
                    .iter()
                    .map(|e| format!("{}\n", e.render()))
                    .collect();
                tokio::fs::write(sub.join("execution.log"), log)
                    .await
                    .context("writing execution.log")?;
            }
        }
    }

    info!(dir = %dir.display(), "batch results written");
    Ok(dir)
}

/// Plain static overview; values are rounded here and only here.
fn render_summary_html(report: &BatchReport) -> String {
    let mut rows = String::new();
    for entry in &report.entries {
        match &entry.outcome {
            MarketOutcome::Completed(r) => {
                let edge = r.montecarlo.probability - r.market.yes_price;
                rows.push_str(&format!(
                    "<tr><td>{}</td><td>{:.1}% &plusmn; {:.1}%</td><td>{:.1}%</td>\
                     <td>{:+.1}pp</td><td>{:?}</td><td>{:?}</td></tr>\n",
                    html_escape(&entry.question),
                    r.montecarlo.probability * 100.0,
                    r.montecarlo.ci_95 * 100.0,
                    r.market.yes_price * 100.0,
                    edge * 100.0,
                    r.signal,
                    r.status,
                ));
            }
            MarketOutcome::Failed(f) => {
                rows.push_str(&format!(
                    "<tr><td>{}</td><td colspan=\"4\">failed: {}</td><td>{}</td></tr>\n",
                    html_escape(&entry.question),
                    html_escape(&f.reason),
                    html_escape(&f.kind),
                ));
            }
        }
    }

    format!(
        "<!DOCTYPE html>\n<html><head><meta charset=\"utf-8\">\
         <title>polysim batch {label}</title>\
         <style>body{{font-family:sans-serif}}table{{border-collapse:collapse}}\
         td,th{{border:1px solid #ccc;padding:4px 8px}}</style></head>\n\
         <body><h1>Batch {label}</h1>\n\
         <table><tr><th>Question</th><th>Simulation</th><th>Market</th>\
         <th>Edge</th><th>Signal</th><th>Status</th></tr>\n{rows}</table>\
         </body></html>\n",
        label = html_escape(&report.label),
    )
}

fn html_escape(s: &str) -> String {
    s.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::error::FailureKind;
    use crate::core::types::*;
    use chrono::TimeZone;

    fn sample_report() -> BatchReport {
        let market = MarketDescriptor {
            slug: "fed-cut-dec".into(),
            question: "Will the Fed cut rates in December 2025?".into(),
            yes_price: 0.65,
            volume: Some(950_000.0),
            end_date: None,
        };
        let calibration = Calibration {
            runs: 50,
            min: 0.31,
            max: 0.84,
            mean: 0.58,
            stdev: 0.09,
            threshold: 0.58,
            verdict: CalibrationVerdict::Accepted,
            metrics_in_unit_range: true,
        };
        let mut outcomes = vec![1u8; 144];
        outcomes.extend(vec![0u8; 56]);
        let result = PipelineResult {
            market: market.clone(),
            research: ResearchBundle {
                text: "Research context here.".into(),
                highlights: vec![],
                citations: vec![],
            },
            artifact_code: "def run_trial(seed):\n    return 0.5\n".into(),
            explanation: None,
            montecarlo: MonteCarloResult {
                n_runs: 200,
                probability: 0.72,
                ci_95: ci_95_half_width(0.72, 200),
                outcomes,
                trials: vec![],
                calibration,
                threshold: 0.58,
                mode: SuccessMode::Threshold,
                failed_seeds: vec![],
            },
            signal: Signal::BuyYes,
            status: PipelineStatus::Succeeded,
            execution_log: vec![ExecutionLogEntry {
                attempt: 1,
                phase: Phase::Smoke,
                classification: None,
                duration_ms: 412,
                detail: "metric=0.55".into(),
            }],
        };

        BatchReport {
            label: "test".into(),
            started_at: chrono::Utc.with_ymd_and_hms(2025, 12, 1, 9, 30, 0).unwrap(),
            entries: vec![
                BatchEntry {
                    slug: "fed-cut-dec".into(),
                    question: market.question.clone(),
                    outcome: MarketOutcome::Completed(Box::new(result)),
                },
                BatchEntry {
                    slug: "broken-market".into(),
                    question: "Will this one fail?".into(),
                    outcome: MarketOutcome::Failed(FailureRecord {
                        slug: "broken-market".into(),
                        kind: "execution-failure".into(),
                        reason: "repair attempts exhausted".into(),
                        execution_log: vec![ExecutionLogEntry {
                            attempt: 1,
                            phase: Phase::Smoke,
                            classification: Some(FailureKind::Runtime),
                            duration_ms: 100,
                            detail: "NameError".into(),
                        }],
                    }),
                },
            ],
        }
    }

    #[tokio::test]
    async fn writes_the_full_directory_layout() {
        let tmp = tempfile::tempdir().unwrap();
        let cfg = ReportCfg {
            results_dir: tmp.path().to_string_lossy().into_owned(),
            write_html: true,
            metrics_addr: String::new(),
        };
        let report = sample_report();
        let dir = write_batch(&report, &cfg).await.unwrap();

        assert_eq!(
            dir.file_name().unwrap().to_string_lossy(),
            "test_20251201T093000Z"
        );
        assert!(dir.join("summary.json").exists());
        assert!(dir.join("summary.html").exists());

        let market_dir = dir.join("will-the-fed-cut-rates-in-december-2025");
        assert!(market_dir.join("model.py").exists());
        assert!(market_dir.join("result.json").exists());
        assert!(market_dir.join("research.txt").exists());
        assert!(market_dir.join("execution.log").exists());

        let model = std::fs::read_to_string(market_dir.join("model.py")).unwrap();
        assert_eq!(model, "def run_trial(seed):\n    return 0.5\n");

        let failed_dir = dir.join("will-this-one-fail");
        assert!(failed_dir.join("result.json").exists());
    }

    #[tokio::test]
    async fn result_json_excludes_artifact_but_keeps_precision() {
        let tmp = tempfile::tempdir().unwrap();
        let cfg = ReportCfg {
            results_dir: tmp.path().to_string_lossy().into_owned(),
            write_html: false,
            metrics_addr: String::new(),
        };
        let report = sample_report();
        let dir = write_batch(&report, &cfg).await.unwrap();

        let raw = std::fs::read_to_string(
            dir.join("will-the-fed-cut-rates-in-december-2025")
                .join("result.json"),
        )
        .unwrap();
        assert!(!raw.contains("def run_trial"));

        let parsed: serde_json::Value = serde_json::from_str(&raw).unwrap();
        // Stored at full precision, not display-rounded.
        let ci = parsed["montecarlo"]["ci_95"].as_f64().unwrap();
        assert!((ci - ci_95_half_width(0.72, 200)).abs() < 1e-15);
    }

    #[tokio::test]
    async fn summary_roundtrips_through_json() {
        let report = sample_report();
        let json = serde_json::to_string(&report).unwrap();
        let parsed: BatchReport = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.entries.len(), 2);
        assert_eq!(parsed.failed_count(), 1);
        match &parsed.entries[0].outcome {
            MarketOutcome::Completed(r) => {
                assert_eq!(r.montecarlo.n_runs, 200);
                assert_eq!(r.signal, Signal::BuyYes);
                // artifact_code is skipped by design.
                assert!(r.artifact_code.is_empty());
            }
            _ => panic!("expected completed entry"),
        }
    }

    #[test]
    fn html_contains_rows_and_escapes() {
        let html = render_summary_html(&sample_report());
        assert!(html.contains("Will the Fed cut rates in December 2025?"));
        assert!(html.contains("BuyYes"));
        assert!(html.contains("failed: repair attempts exhausted"));
    }
}
