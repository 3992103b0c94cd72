//! Markdown and JSON report generation.
//!
//! Renders the outcome of an analysis run, or a bare score table for the
//! `score` command.

use crate::models::{AnalysisResult, AnalysisSummary, EventKind, RunStatus, Score, SkipTally, StreamFailure};
use std::collections::BTreeMap;

/// Generate a complete Markdown report.
pub fn generate_markdown_report(result: &AnalysisResult) -> String {
    let mut output = String::new();

    output.push_str(&format!("# Contribution Report: {}\n\n", result.summary.subject));
    output.push_str(&generate_metadata_section(&result.summary));
    output.push_str(&generate_scores_section(&result.scores));
    output.push_str(&generate_activity_section(&result.summary.counts_by_kind, &result.summary.skipped));
    output.push_str(&generate_failures_section(&result.summary.failures));
    output.push_str(&generate_footer());

    output
}

fn generate_metadata_section(summary: &AnalysisSummary) -> String {
    let mut section = String::new();

    section.push_str("## Metadata\n\n");
    section.push_str(&format!(
        "- **Status:** {} {}\n",
        summary.status.emoji(),
        summary.status
    ));
    section.push_str(&format!("- **Window:** {}", summary.window.label()));
    if summary.since_clamped {
        section.push_str(" (clamped)");
    }
    section.push('\n');
    section.push_str(&format!("- **API Mode:** `{}`\n", summary.api_mode));
    section.push_str(&format!("- **Rules:** `{}`\n", summary.rules_origin));
    section.push_str(&format!("- **Streams:** {}\n", summary.streams_total));
    section.push_str(&format!(
        "- **Pages Fetched:** {} ({} from cache)\n",
        summary.pages_fetched, summary.pages_from_cache
    ));
    section.push_str(&format!("- **Events:** {}\n", summary.total_events));
    section.push_str(&format!(
        "- **Analysis Duration:** {:.1}s\n",
        summary.duration_seconds
    ));
    section.push('\n');

    section
}

/// Score table, one row per dimension.
pub fn generate_scores_section(scores: &[Score]) -> String {
    let mut section = String::new();

    section.push_str("## Scores\n\n");
    if scores.is_empty() {
        section.push_str("No dimensions were scored.\n\n");
        return section;
    }

    section.push_str("| Dimension | Score |\n");
    section.push_str("|:---|---:|\n");
    for score in scores {
        section.push_str(&format!("| {} | {:.2} |\n", score.dimension, score.value));
    }
    section.push('\n');

    section
}

fn generate_activity_section(counts: &BTreeMap<EventKind, usize>, skipped: &SkipTally) -> String {
    let mut section = String::new();

    section.push_str("## Activity\n\n");
    section.push_str("| Kind | Events |\n");
    section.push_str("|:---|:---:|\n");
    for (kind, count) in counts {
        section.push_str(&format!("| {} | {} |\n", kind, count));
    }
    section.push('\n');

    if skipped.total() > 0 {
        section.push_str(&format!(
            "*Skipped {} record(s): {} unsupported, {} malformed, {} outside the window, {} by other actors.*\n\n",
            skipped.total(),
            skipped.unsupported,
            skipped.malformed,
            skipped.out_of_window,
            skipped.other_actor
        ));
    }

    section
}

fn generate_failures_section(failures: &[StreamFailure]) -> String {
    if failures.is_empty() {
        return String::new();
    }

    let mut section = String::new();
    section.push_str("## Failed Streams\n\n");
    section.push_str("Scores above only cover the streams that completed.\n\n");
    for failure in failures {
        let hint = if failure.retryable { " (retryable)" } else { "" };
        section.push_str(&format!("- `{}`: {}{}\n", failure.stream, failure.error, hint));
    }
    section.push('\n');

    section
}

fn generate_footer() -> String {
    "---\n\n*Report generated by fairscore*\n".to_string()
}

/// Per-actor score tables for events that were not filtered to one subject.
pub fn generate_leaderboard(by_actor: &BTreeMap<String, Vec<Score>>) -> String {
    let dimensions: Vec<&str> = by_actor
        .values()
        .next()
        .map(|scores| scores.iter().map(|s| s.dimension.as_str()).collect())
        .unwrap_or_default();

    let mut rows: Vec<(&String, f64, &Vec<Score>)> = by_actor
        .iter()
        .map(|(actor, scores)| (actor, scores.iter().map(|s| s.value).sum(), scores))
        .collect();
    rows.sort_by(|a, b| b.1.total_cmp(&a.1).then_with(|| a.0.cmp(b.0)));

    let mut output = String::from("## Scores by Actor\n\n| Actor |");
    for dim in &dimensions {
        output.push_str(&format!(" {} |", dim));
    }
    output.push_str(" **Total** |\n|:---|");
    output.push_str(&"---:|".repeat(dimensions.len() + 1));
    output.push('\n');

    for (actor, total, scores) in rows {
        output.push_str(&format!("| {} |", actor));
        for score in scores {
            output.push_str(&format!(" {:.2} |", score.value));
        }
        output.push_str(&format!(" **{:.2}** |\n", total));
    }
    output.push('\n');
    output
}

/// Generate a JSON report: summary and scores, without the raw events.
pub fn generate_json_report(result: &AnalysisResult) -> serde_json::Result<String> {
    serde_json::to_string_pretty(&serde_json::json!({
        "summary": result.summary,
        "scores": result.scores,
        "count": result.count,
    }))
}

/// Process exit code for a finished run.
pub fn exit_code(status: RunStatus) -> i32 {
    match status {
        RunStatus::Ok => 0,
        RunStatus::Partial => 2,
        RunStatus::Failed => 1,
    }
}
