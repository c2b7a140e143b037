//! Result Aggregator (C9, spec §4.8): turns the State Store's terminal
//! snapshot into the report records external renderers consume.
//!
//! `index.json`/`results.json` are written to disk by the CLI crate; this
//! module only owns the typed records and the serialization-adjacent
//! assembly (JUnit string building) that belongs with the rest of the
//! engine rather than the front end. `BTreeMap` is used wherever key order
//! must stay stable across re-emission (spec §8 "parsing `index.json` then
//! re-emitting yields byte-equivalent JSON").

use std::collections::BTreeMap;

use arena_domain::model::{AssertionsSummary, CostSummary, RunResult, RunStatus};
use serde::Serialize;

/// `index.json` (spec §6): the summary document, one entry per run.
#[derive(Debug, Clone, Serialize)]
pub struct ReportIndex {
    pub total_runs: usize,
    pub successful: usize,
    pub errors: usize,
    pub total_cost: f64,
    pub total_duration_ms: u64,
    pub per_run: Vec<ReportIndexEntry>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ReportIndexEntry {
    pub run_id: String,
    pub scenario: String,
    pub provider: String,
    pub region: String,
    pub status: RunStatus,
    pub cost: f64,
    pub duration_ms: u64,
    pub assertions: ReportIndexAssertions,
}

#[derive(Debug, Clone, Serialize)]
pub struct ReportIndexAssertions {
    pub total: u32,
    pub failed: u32,
}

/// `results.json` (spec §6): full per-run detail including turn
/// transcripts, keyed by `run_id` so a renderer can look a run up
/// directly rather than scanning the array.
#[derive(Debug, Clone, Serialize)]
pub struct ReportDetail {
    pub runs: BTreeMap<String, RunResult>,
}

impl ReportIndex {
    /// Builds the index from a finalized (terminal-only) snapshot. Runs
    /// that are not yet terminal are folded in as failures rather than
    /// silently dropped, since `finalize()` is only ever called once the
    /// scheduler has drained (spec §4.2 `Finalize`).
    pub fn build(runs: &[RunResult]) -> Self {
        let total_runs = runs.len();
        let successful = runs.iter().filter(|r| r.status == RunStatus::Completed).count();
        let errors = total_runs - successful;
        let total_cost: f64 = runs.iter().map(|r| r.cost.total_dollars).sum();
        let total_duration_ms: u64 = runs.iter().map(|r| r.duration_ms).sum();

        let mut per_run: Vec<ReportIndexEntry> = runs
            .iter()
            .map(|r| ReportIndexEntry {
                run_id: r.run_id.clone(),
                scenario: r.scenario_id.clone(),
                provider: r.provider_id.clone(),
                region: r.region.clone(),
                status: r.status,
                cost: r.cost.total_dollars,
                duration_ms: r.duration_ms,
                assertions: ReportIndexAssertions {
                    total: r.assertions_summary.total,
                    failed: r.assertions_summary.failed,
                },
            })
            .collect();
        // stable, deterministic ordering independent of shard iteration
        // order, so two dry-runs over the same config produce identical
        // index.json modulo timestamps (spec §8).
        per_run.sort_by(|a, b| a.run_id.cmp(&b.run_id));

        Self {
            total_runs,
            successful,
            errors,
            total_cost,
            total_duration_ms,
            per_run,
        }
    }

    /// Every run-level assertion passed and every run completed — the
    /// condition the CLI's exit-code mapping (spec §6) consults directly.
    pub fn all_passed(&self) -> bool {
        self.errors == 0 && self.per_run.iter().all(|r| r.assertions.failed == 0)
    }
}

impl ReportDetail {
    pub fn build(runs: &[RunResult]) -> Self {
        Self {
            runs: runs.iter().map(|r| (r.run_id.clone(), r.clone())).collect(),
        }
    }
}

fn xml_escape(s: &str) -> String {
    s.chars()
        .map(|c| match c {
            '&' => "&amp;".to_string(),
            '<' => "&lt;".to_string(),
            '>' => "&gt;".to_string(),
            '"' => "&quot;".to_string(),
            '\'' => "&apos;".to_string(),
            other => other.to_string(),
        })
        .collect()
}

/// Hand-assembled JUnit XML (spec §6 `junit.xml`): one `<testsuite>`
/// containing one `<testcase>` per run. No XML crate appears anywhere in
/// the retrieved corpus, so this follows the same `format!`-based,
/// delimiter-driven assembly the teacher uses for its own generated
/// Markdown sections.
pub fn render_junit_xml(runs: &[RunResult]) -> String {
    let mut sorted: Vec<&RunResult> = runs.iter().collect();
    sorted.sort_by(|a, b| a.run_id.cmp(&b.run_id));

    let total = sorted.len();
    let failures = sorted
        .iter()
        .filter(|r| r.error.as_ref().is_some_and(|e| e.is_assertion_failure) || r.assertions_summary.failed > 0)
        .count();
    let errors = sorted
        .iter()
        .filter(|r| r.error.as_ref().is_some_and(|e| !e.is_assertion_failure))
        .count();
    let total_time_s: f64 = sorted.iter().map(|r| r.duration_ms as f64 / 1000.0).sum();

    let mut out = String::new();
    out.push_str("<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n");
    out.push_str(&format!(
        "<testsuite name=\"prompt-arena\" tests=\"{total}\" failures=\"{failures}\" errors=\"{errors}\" time=\"{total_time_s:.3}\">\n"
    ));
    for run in sorted {
        let name = format!("{}/{}/{}", run.scenario_id, run.provider_id, run.region);
        let time_s = run.duration_ms as f64 / 1000.0;
        out.push_str(&format!(
            "  <testcase classname=\"{}\" name=\"{}\" time=\"{:.3}\">\n",
            xml_escape(&run.run_id),
            xml_escape(&name),
            time_s
        ));
        if let Some(err) = &run.error {
            let tag = if err.is_assertion_failure { "failure" } else { "error" };
            out.push_str(&format!(
                "    <{tag} type=\"{}\" message=\"{}\"></{tag}>\n",
                xml_escape(&err.kind),
                xml_escape(&err.message)
            ));
        } else if run.assertions_summary.failed > 0 {
            out.push_str(&format!(
                "    <failure type=\"AssertionFailure\" message=\"{} of {} assertions failed\"></failure>\n",
                run.assertions_summary.failed, run.assertions_summary.total
            ));
        }
        out.push_str("  </testcase>\n");
    }
    out.push_str("</testsuite>\n");
    out
}

/// Rolls per-run cost and assertion totals into a single summary, used by
/// callers that want aggregate numbers without building the full index
/// (e.g. a CLI progress line printed as runs complete).
pub fn summarize_cost(runs: &[RunResult]) -> CostSummary {
    let mut total = CostSummary::default();
    for run in runs {
        total.accumulate(&run.cost);
    }
    total
}

pub fn summarize_assertions(runs: &[RunResult]) -> AssertionsSummary {
    let mut total = AssertionsSummary::default();
    for run in runs {
        total.total += run.assertions_summary.total;
        total.passed += run.assertions_summary.passed;
        total.failed += run.assertions_summary.failed;
    }
    total
}

#[cfg(test)]
mod tests {
    use super::*;
    use arena_domain::model::RunError;
    use chrono::Utc;

    fn run(id: &str, status: RunStatus, failed_assertions: u32, error: Option<RunError>) -> RunResult {
        RunResult {
            run_id: id.into(),
            scenario_id: "greet".into(),
            provider_id: "mock".into(),
            region: "r1".into(),
            status,
            started_at: Utc::now(),
            finished_at: Some(Utc::now()),
            duration_ms: 120,
            cost: CostSummary {
                total_dollars: 0.01,
                ..Default::default()
            },
            turn_results: Vec::new(),
            assertions_summary: AssertionsSummary {
                total: failed_assertions + 1,
                passed: 1,
                failed: failed_assertions,
            },
            error,
        }
    }

    #[test]
    fn index_counts_successful_and_errored_runs() {
        let runs = vec![
            run("b", RunStatus::Completed, 0, None),
            run(
                "a",
                RunStatus::Failed,
                0,
                Some(RunError {
                    kind: "ProviderPermanent".into(),
                    message: "401".into(),
                    is_assertion_failure: false,
                }),
            ),
        ];
        let index = ReportIndex::build(&runs);
        assert_eq!(index.total_runs, 2);
        assert_eq!(index.successful, 1);
        assert_eq!(index.errors, 1);
        // sorted by run_id regardless of input order.
        assert_eq!(index.per_run[0].run_id, "a");
        assert_eq!(index.per_run[1].run_id, "b");
    }

    #[test]
    fn index_all_passed_false_when_any_assertion_failed() {
        let runs = vec![run("a", RunStatus::Completed, 1, None)];
        let index = ReportIndex::build(&runs);
        assert!(!index.all_passed());
    }

    #[test]
    fn index_all_passed_true_for_clean_run() {
        let runs = vec![run("a", RunStatus::Completed, 0, None)];
        let index = ReportIndex::build(&runs);
        assert!(index.all_passed());
    }

    #[test]
    fn detail_keys_runs_by_run_id() {
        let runs = vec![run("a", RunStatus::Completed, 0, None)];
        let detail = ReportDetail::build(&runs);
        assert!(detail.runs.contains_key("a"));
    }

    #[test]
    fn junit_uses_error_tag_for_execution_failure() {
        let runs = vec![run(
            "a",
            RunStatus::Failed,
            0,
            Some(RunError {
                kind: "ProviderPermanent".into(),
                message: "401 unauthorized".into(),
                is_assertion_failure: false,
            }),
        )];
        let xml = render_junit_xml(&runs);
        assert!(xml.contains("<error "));
        assert!(!xml.contains("<failure "));
    }

    #[test]
    fn junit_uses_failure_tag_for_assertion_failure() {
        let runs = vec![run(
            "a",
            RunStatus::Failed,
            0,
            Some(RunError {
                kind: "AssertionFailure".into(),
                message: "pattern not found".into(),
                is_assertion_failure: true,
            }),
        )];
        let xml = render_junit_xml(&runs);
        assert!(xml.contains("<failure "));
        assert!(!xml.contains("<error "));
    }

    #[test]
    fn junit_reports_failure_for_completed_run_with_failed_assertions() {
        let runs = vec![run("a", RunStatus::Completed, 2, None)];
        let xml = render_junit_xml(&runs);
        assert!(xml.contains("<failure "));
        assert!(xml.contains("testsuite") && xml.contains("failures=\"1\""));
    }

    #[test]
    fn junit_escapes_message_text() {
        let runs = vec![run(
            "a",
            RunStatus::Failed,
            0,
            Some(RunError {
                kind: "ToolError".into(),
                message: "bad <tag> & \"quote\"".into(),
                is_assertion_failure: false,
            }),
        )];
        let xml = render_junit_xml(&runs);
        assert!(xml.contains("bad &lt;tag&gt; &amp; &quot;quote&quot;"));
    }

    #[test]
    fn summarize_cost_accumulates_across_runs() {
        let runs = vec![
            run("a", RunStatus::Completed, 0, None),
            run("b", RunStatus::Completed, 0, None),
        ];
        let cost = summarize_cost(&runs);
        assert!((cost.total_dollars - 0.02).abs() < 1e-9);
    }

    #[test]
    fn summarize_assertions_rolls_up_totals() {
        let runs = vec![run("a", RunStatus::Completed, 1, None), run("b", RunStatus::Completed, 0, None)];
        let summary = summarize_assertions(&runs);
        assert_eq!(summary.total, 3);
        assert_eq!(summary.failed, 1);
    }
}
