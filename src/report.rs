//! Result payload and test-history export.

use std::fs::File;
use std::io::Write;
use std::path::Path;

use chrono::Utc;
use serde::Serialize;
use serde_json::{Value, json};

use crate::cache::CacheStats;
use crate::error::Result;
use crate::oracle::OracleStats;
use crate::run::ChainReport;
use crate::settings::RunSettings;

/// JSON document summarizing a finished chain.
pub fn result_payload(
    report: &ChainReport,
    settings: &RunSettings,
    cache: CacheStats,
    oracle: OracleStats,
) -> Value {
    let runs: Vec<Value> = report
        .runs
        .iter()
        .map(|r| {
            json!({
                "run": r.index,
                "baseline_score": r.baseline_score,
                "best_score": r.best.score,
                "best_source": r.best.source,
                "best_metrics": r.best_metrics(),
                "tests": r.test_count,
                "stop_reason": r.stop_reason,
                "elapsed_secs": r.elapsed_secs,
                "stats": r.stats,
                "parameter_effectiveness": r.parameter_effectiveness,
                "error": r.error,
            })
        })
        .collect();

    json!({
        "generated_at_utc": Utc::now().to_rfc3339(),
        "scoring_mode": settings.scoring.mode,
        "target_score": settings.target_score,
        "seed": settings.seed,
        "runs_requested": settings.chain.runs,
        "target_reached": report.target_reached,
        "cancelled": report.cancelled,
        "fatal_error": report.fatal,
        "total_tests": report.total_tests(),
        "selected_result": report.best.as_ref().map(|b| json!({
            "score": b.score,
            "source": b.source,
            "validated": b.validated,
            "run": report.best_run,
            "metrics": b.metrics,
            "config": b.configuration,
        })),
        "best_trace": report.best_trace,
        "runs": runs,
        "failures": report.failures,
        "cache": {
            "hits": cache.hits,
            "misses": cache.misses,
            "api_calls_saved": cache.api_calls_saved,
            "hit_rate": cache.hit_rate(),
        },
        "oracle": oracle,
    })
}

#[derive(Serialize)]
struct HistoryRow<'a> {
    run: usize,
    test: usize,
    phase: &'a str,
    score: Option<f64>,
    tokens: Option<u64>,
    win_rate: Option<f64>,
    pnl_percent: Option<f64>,
    rejected: bool,
    reason: Option<&'a str>,
    cached: bool,
    improved: bool,
    error: Option<&'a str>,
    key: &'a str,
}

/// Writes one CSV row per evaluated candidate, across every run of the chain.
pub fn write_history<W: Write>(report: &ChainReport, out: W) -> Result<()> {
    let mut wtr = csv::Writer::from_writer(out);
    for (run, t) in report.history() {
        wtr.serialize(HistoryRow {
            run,
            test: t.index,
            phase: &t.phase,
            score: t.score,
            tokens: t.token_count,
            win_rate: t.win_rate,
            pnl_percent: t.pnl_percent,
            rejected: t.rejected,
            reason: t.reason.as_deref(),
            cached: t.cached,
            improved: t.improved,
            error: t.error.as_deref(),
            key: &t.key,
        })?;
    }
    wtr.flush()?;
    Ok(())
}

pub fn write_history_file(report: &ChainReport, path: &Path) -> Result<()> {
    write_history(report, File::create(path)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::params::{Configuration, ParameterRule, ParameterSpace};
    use crate::run::ChainedRun;
    use crate::search::testing::*;

    async fn finished_chain() -> (ChainReport, Harness) {
        let oracle = FnOracle::new(|c: &Configuration| {
            let x = c.get("Wallets", "Min Holders").and_then(|v| v.as_f64()).unwrap_or(0.0);
            success(400, 10.0 + x, 50.0)
        });
        let space = ParameterSpace::new(
            vec![ParameterRule::integer("Wallets", "Min Holders", 0, 4, 1).with_default(2)],
            Vec::new(),
        )
        .unwrap();
        let mut settings = quick_settings();
        settings.phases.lhs = false;
        settings.phases.correlated = false;
        settings.phases.annealing = false;
        settings.phases.genetic = false;
        settings.phases.deep_dive = false;
        let mut h = Harness::new(space, settings, oracle);
        let report = ChainedRun::new(&h.space, &h.settings, &mut h.cache, &mut h.oracle, h.stop.clone())
            .execute(None)
            .await;
        (report, h)
    }

    #[tokio::test]
    async fn payload_carries_selected_config_and_stats() {
        let (report, h) = finished_chain().await;
        let payload = result_payload(&report, &h.settings, h.cache.stats(), h.oracle.stats());
        let selected = &payload["selected_result"];
        assert_eq!(selected["score"], json!(7.0));
        assert_eq!(selected["config"], json!({"Wallets": {"Min Holders": 4}}));
        assert_eq!(payload["runs"].as_array().unwrap().len(), 1);
        assert!(payload["runs"][0]["best_metrics"]["token_count"].is_u64());
        assert_eq!(payload["oracle"]["calls"], json!(5));
        assert!(payload["generated_at_utc"].is_string());
    }

    #[tokio::test]
    async fn history_has_one_row_per_test() {
        let (report, _h) = finished_chain().await;
        let mut buf = Vec::new();
        write_history(&report, &mut buf).unwrap();
        let text = String::from_utf8(buf).unwrap();
        let mut lines = text.lines();
        assert!(lines.next().unwrap().starts_with("run,test,phase,score"));
        assert_eq!(lines.count(), report.total_tests());
    }

    #[tokio::test]
    async fn history_file_lands_on_disk() {
        let (report, _h) = finished_chain().await;
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("history.csv");
        write_history_file(&report, &path).unwrap();
        assert!(std::fs::read_to_string(&path).unwrap().contains("Baseline"));
    }
}
