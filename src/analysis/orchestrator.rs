//! End-to-end analysis of one subject.
//!
//! The analyzer clamps the window, resolves the ruleset, runs the fetch
//! workers, normalizes pages as they arrive and aggregates once at the end.
//! A failed stream is recorded in the summary; the run only fails when every
//! stream does.

use super::aggregator::{aggregate, counts_by_kind, scores_by_dimension, ScorePolicy};
use crate::error::{PipelineError, PipelineResult};
use crate::fetch::{Fetcher, StreamEvent};
use crate::models::{
    AnalysisResult, AnalysisSummary, ApiMode, ContributionEvent, Provider, RawPage, Repo, RunStatus, SkipTally,
    StreamFailure, Window,
};
use crate::normalizer::{normalize, NormalizeContext};
use crate::rules::{self, RuleSource};
use chrono::{DateTime, Utc};
use std::collections::BTreeSet;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Run-level settings.
#[derive(Debug, Clone)]
pub struct AnalysisOptions {
    pub provider: Provider,
    pub max_since_days: u32,
    pub exclude_bots: bool,
    pub self_repo_penalty: f64,
    pub rules_source: RuleSource,
    /// Ruleset file used instead of the built-in default when it exists.
    pub rules_override: Option<PathBuf>,
    pub run_timeout: Duration,
}

impl Default for AnalysisOptions {
    fn default() -> Self {
        Self {
            provider: Provider::GitHub,
            max_since_days: 180,
            exclude_bots: true,
            self_repo_penalty: 0.8,
            rules_source: RuleSource::Default,
            rules_override: None,
            run_timeout: Duration::from_secs(600),
        }
    }
}

/// Accumulates normalized output while streams report in.
#[derive(Default)]
struct RunTally {
    events: Vec<ContributionEvent>,
    skipped: SkipTally,
    pages_fetched: usize,
    pages_from_cache: usize,
    failures: Vec<StreamFailure>,
    auth_failure: Option<String>,
    pending: BTreeSet<String>,
}

impl RunTally {
    fn page(&mut self, page: &RawPage, provider: Provider, ctx: &NormalizeContext<'_>) {
        self.pages_fetched += 1;
        if page.from_cache {
            self.pages_from_cache += 1;
        }
        let normalized = normalize(page, provider, ctx);
        debug!(
            "{} {:?} page {}: {} event(s), {} skipped",
            page.stream,
            page.source,
            page.page,
            normalized.events.len(),
            normalized.skipped.total()
        );
        self.skipped.merge(&normalized.skipped);
        self.events.extend(normalized.events);
    }

    fn finished(&mut self, stream: String, result: PipelineResult<usize>) {
        self.pending.remove(&stream);
        if let Err(e) = result {
            if let PipelineError::Auth(ref detail) = e {
                self.auth_failure.get_or_insert_with(|| detail.clone());
            }
            self.failures.push(e.to_stream_failure(&stream));
        }
    }

    fn handle(&mut self, event: StreamEvent, provider: Provider, ctx: &NormalizeContext<'_>) {
        match event {
            StreamEvent::Page(page) => self.page(&page, provider, ctx),
            StreamEvent::Finished { stream, result } => self.finished(stream, result),
        }
    }
}

pub struct Analyzer {
    fetcher: Arc<Fetcher>,
    options: AnalysisOptions,
}

impl Analyzer {
    pub fn new(fetcher: Arc<Fetcher>, options: AnalysisOptions) -> Self {
        Self { fetcher, options }
    }

    pub fn options(&self) -> &AnalysisOptions {
        &self.options
    }

    fn window(&self, since: Option<DateTime<Utc>>, now: DateTime<Utc>) -> (Window, bool) {
        let window = Window::clamped(since, now, self.options.max_since_days);
        let clamped = since.is_some_and(|s| s < window.since);
        if clamped {
            info!(
                "Requested since is older than {} days, clamped to {}",
                self.options.max_since_days,
                window.since.format("%Y-%m-%d")
            );
        }
        (window, clamped)
    }

    /// Normalized events of one repository, by any actor.
    pub async fn fetch(
        &self,
        provider: Provider,
        repo: Repo,
        since: Option<DateTime<Utc>>,
    ) -> PipelineResult<(Vec<ContributionEvent>, SkipTally)> {
        self.fetch_at(provider, repo, since, Utc::now()).await
    }

    pub async fn fetch_at(
        &self,
        provider: Provider,
        repo: Repo,
        since: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> PipelineResult<(Vec<ContributionEvent>, SkipTally)> {
        let (window, _) = self.window(since, now);
        let pages = self.fetcher.fetch_repo_pages(repo, window).await?;

        let ctx = NormalizeContext {
            subject: None,
            window: Some(&window),
        };
        let mut tally = RunTally::default();
        for page in &pages {
            tally.page(page, provider, &ctx);
        }
        sort_and_dedup(&mut tally.events);
        Ok((tally.events, tally.skipped))
    }

    pub async fn analyze(
        &self,
        subject: &str,
        since: Option<DateTime<Utc>>,
        api_mode: ApiMode,
    ) -> PipelineResult<AnalysisResult> {
        self.analyze_at(subject, since, api_mode, Utc::now()).await
    }

    /// `analyze` with an explicit end of window.
    pub async fn analyze_at(
        &self,
        subject: &str,
        since: Option<DateTime<Utc>>,
        api_mode: ApiMode,
        now: DateTime<Utc>,
    ) -> PipelineResult<AnalysisResult> {
        let started = Instant::now();
        let (window, since_clamped) = self.window(since, now);
        let (rules, rules_origin) = rules::resolve(&self.options.rules_source, self.options.rules_override.as_deref())?;

        let repos = match api_mode {
            ApiMode::Batch => Vec::new(),
            ApiMode::Rest | ApiMode::Auto => self.fetcher.list_subject_repos(subject).await?,
        };
        let mode = self.fetcher.choose_mode(api_mode, repos.len());
        let plans = self.fetcher.plan(subject, mode, &repos);
        let streams_total = plans.len();
        info!(
            "Analyzing {} over {} with {} stream(s) in {} mode",
            subject,
            window.label(),
            streams_total,
            mode
        );

        let provider = self.options.provider;
        let ctx = NormalizeContext {
            subject: Some(subject),
            window: Some(&window),
        };
        let mut tally = RunTally {
            pending: plans.iter().map(|p| p.id.clone()).collect(),
            ..RunTally::default()
        };

        let mut run = self.fetcher.spawn(plans, window, Some(subject.to_string()));
        let deadline = tokio::time::sleep(self.options.run_timeout);
        tokio::pin!(deadline);

        loop {
            tokio::select! {
                event = run.events.recv() => match event {
                    Some(event) => tally.handle(event, provider, &ctx),
                    None => break,
                },
                _ = &mut deadline => {
                    warn!(
                        "Run timeout of {}s reached, cancelling {} stream(s)",
                        self.options.run_timeout.as_secs(),
                        tally.pending.len()
                    );
                    run.cancel();
                    while let Ok(event) = run.events.try_recv() {
                        tally.handle(event, provider, &ctx);
                    }
                    for stream in std::mem::take(&mut tally.pending) {
                        tally.failures.push(StreamFailure {
                            stream,
                            error: format!(
                                "cancelled after run timeout of {}s",
                                self.options.run_timeout.as_secs()
                            ),
                            retryable: true,
                        });
                    }
                    break;
                }
            }
        }

        sort_and_dedup(&mut tally.events);
        let policy = ScorePolicy {
            exclude_bots: self.options.exclude_bots,
            self_repo_penalty: self.options.self_repo_penalty,
            window,
        };
        let scores = aggregate(subject, &tally.events, &rules, &policy);

        let status = if tally.failures.is_empty() {
            RunStatus::Ok
        } else if tally.failures.len() < streams_total {
            RunStatus::Partial
        } else {
            RunStatus::Failed
        };

        let summary = AnalysisSummary {
            subject: subject.to_string(),
            status,
            api_mode: mode,
            window,
            since_clamped,
            rules_origin,
            streams_total,
            total_events: tally.events.len(),
            counts_by_kind: counts_by_kind(&tally.events),
            scores_by_dimension: scores_by_dimension(&scores),
            skipped: tally.skipped,
            pages_fetched: tally.pages_fetched,
            pages_from_cache: tally.pages_from_cache,
            failures: tally.failures,
            duration_seconds: started.elapsed().as_secs_f64(),
        };

        if status == RunStatus::Failed {
            if let Some(detail) = tally.auth_failure {
                return Err(PipelineError::Auth(detail));
            }
            return Err(PipelineError::AllStreamsFailed {
                summary: Box::new(summary),
            });
        }

        info!(
            "{} {}: {} event(s) from {} page(s), status {}",
            status.emoji(),
            subject,
            summary.total_events,
            summary.pages_fetched,
            status
        );
        Ok(AnalysisResult {
            count: summary.total_events,
            summary,
            scores,
            events: tally.events,
        })
    }
}

/// Stable event order; the same record seen twice is kept once.
fn sort_and_dedup(events: &mut Vec<ContributionEvent>) {
    events.sort_by(|a, b| {
        (a.timestamp, &a.id, a.kind, &a.repo).cmp(&(b.timestamp, &b.id, b.kind, &b.repo))
    });
    events.dedup_by(|a, b| a.id == b.id && a.kind == b.kind && a.repo == b.repo);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::MemoryCache;
    use crate::fetch::transport::scripted::ScriptedTransport;
    use crate::fetch::transport::ApiResponse;
    use crate::fetch::{ApiClient, FetchSettings, GitHubApi, RequestPolicy};
    use crate::limiter::Unlimited;
    use crate::models::EventKind;
    use chrono::{Duration as ChronoDuration, TimeZone};
    use serde_json::json;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 6, 30, 0, 0, 0).unwrap()
    }

    fn settings() -> FetchSettings {
        FetchSettings {
            max_review_prs: 0,
            ..FetchSettings::default()
        }
    }

    fn analyzer(transport: Arc<ScriptedTransport>, settings: FetchSettings, options: AnalysisOptions) -> Analyzer {
        let client = ApiClient::new(
            transport,
            Arc::new(Unlimited),
            Arc::new(MemoryCache::new()),
            RequestPolicy::default(),
        )
        .with_token(Some("t".to_string()));
        let fetcher = Arc::new(Fetcher::new(client, GitHubApi::default(), settings));
        Analyzer::new(fetcher, options)
    }

    fn since() -> DateTime<Utc> {
        now() - ChronoDuration::days(30)
    }

    fn window() -> Window {
        Window::new(since(), now())
    }

    fn list_repos(transport: &ScriptedTransport, names: &[&str]) {
        let repos: Vec<_> = names.iter().map(|n| json!({"full_name": format!("octo/{}", n)})).collect();
        transport.push_json(&GitHubApi::default().user_repos("octo", 100), json!(repos));
    }

    fn script_activity(transport: &ScriptedTransport, repo: &str) {
        let api = GitHubApi::default();
        let repo = Repo::new("octo", repo);
        transport.push_json(
            &api.issues(&repo, &window(), 100),
            json!([
                {"id": 1, "user": {"login": "octo"}, "created_at": "2026-06-10T00:00:00Z", "pull_request": {}},
                {"id": 2, "user": {"login": "alice"}, "created_at": "2026-06-11T00:00:00Z"},
                {"id": 3, "user": {"login": "octo"}, "created_at": "2026-06-12T00:00:00Z"}
            ]),
        );
        transport.push_json(
            &api.commits(&repo, &window(), Some("octo"), 100),
            json!([
                {"sha": "abc", "author": {"login": "octo"}, "commit": {"author": {"date": "2026-06-13T00:00:00Z"}}},
                {"sha": "old", "author": {"login": "octo"}, "commit": {"author": {"date": "2026-01-13T00:00:00Z"}}}
            ]),
        );
    }

    #[tokio::test]
    async fn test_analyze_scores_subject_activity() {
        let transport = Arc::new(ScriptedTransport::new());
        list_repos(&transport, &["hello"]);
        script_activity(&transport, "hello");
        let analyzer = analyzer(transport, settings(), AnalysisOptions::default());

        let result = analyzer
            .analyze_at("octo", Some(since()), ApiMode::Rest, now())
            .await
            .unwrap();
        let summary = &result.summary;

        assert_eq!(summary.status, RunStatus::Ok);
        assert_eq!(result.count, 3);
        assert_eq!(summary.counts_by_kind[&EventKind::Pr], 1);
        assert_eq!(summary.counts_by_kind[&EventKind::Issue], 1);
        assert_eq!(summary.counts_by_kind[&EventKind::Commit], 1);
        assert_eq!(summary.skipped.other_actor, 1);
        assert_eq!(summary.skipped.out_of_window, 1);
        assert_eq!(summary.rules_origin, "default");
        assert!(!summary.since_clamped);

        // All events are in the subject's own repository: default weights times 0.8.
        let code = summary.scores_by_dimension["code"];
        assert!((code - (1.0 + 0.8) * 0.8).abs() < 1e-9);
        assert!((summary.scores_by_dimension["community"] - 0.3 * 0.8).abs() < 1e-9);
        assert_eq!(summary.scores_by_dimension["review"], 0.0);
    }

    #[tokio::test]
    async fn test_fetch_keeps_every_actor() {
        let transport = Arc::new(ScriptedTransport::new());
        let api = GitHubApi::default();
        let repo = Repo::new("octo", "hello");
        script_activity(&transport, "hello");
        transport.push_json(&api.commits(&repo, &window(), None, 100), json!([]));
        let analyzer = analyzer(transport, settings(), AnalysisOptions::default());

        let (events, skipped) = analyzer
            .fetch_at(Provider::GitHub, repo, Some(since()), now())
            .await
            .unwrap();

        let ids: Vec<_> = events.iter().map(|e| e.id.as_str()).collect();
        assert_eq!(ids, vec!["1", "2", "3"]);
        assert_eq!(events[1].actor, "alice");
        assert_eq!(skipped.other_actor, 0);
    }

    #[tokio::test]
    async fn test_since_is_clamped() {
        let transport = Arc::new(ScriptedTransport::new());
        list_repos(&transport, &[]);
        let analyzer = analyzer(transport, settings(), AnalysisOptions::default());

        let result = analyzer
            .analyze_at("octo", Some(now() - ChronoDuration::days(400)), ApiMode::Rest, now())
            .await
            .unwrap();
        assert!(result.summary.since_clamped);
        assert_eq!(result.summary.window.days(), 180);
        assert_eq!(result.summary.streams_total, 0);
        assert_eq!(result.scores.len(), 3);
    }

    #[tokio::test]
    async fn test_one_failed_stream_is_partial() {
        let transport = Arc::new(ScriptedTransport::new());
        list_repos(&transport, &["hello", "broken"]);
        script_activity(&transport, "hello");
        let analyzer = analyzer(transport, settings(), AnalysisOptions::default());

        let result = analyzer
            .analyze_at("octo", Some(since()), ApiMode::Rest, now())
            .await
            .unwrap();
        assert_eq!(result.summary.status, RunStatus::Partial);
        assert_eq!(result.count, 3);
        assert_eq!(result.summary.failures.len(), 1);
        assert_eq!(result.summary.failures[0].stream, "octo/broken");
        assert!(!result.summary.failures[0].retryable);
    }

    #[tokio::test]
    async fn test_every_stream_failing_fails_the_run() {
        let transport = Arc::new(ScriptedTransport::new());
        list_repos(&transport, &["a", "b"]);
        let analyzer = analyzer(transport, settings(), AnalysisOptions::default());

        match analyzer.analyze_at("octo", Some(since()), ApiMode::Rest, now()).await {
            Err(PipelineError::AllStreamsFailed { summary }) => {
                assert_eq!(summary.status, RunStatus::Failed);
                assert_eq!(summary.failures.len(), 2);
            }
            other => panic!("unexpected result: {:?}", other.map(|r| r.summary.status)),
        }
    }

    #[tokio::test]
    async fn test_auth_failure_surfaces_as_auth() {
        let transport = Arc::new(ScriptedTransport::new());
        list_repos(&transport, &["hello"]);
        let repo = Repo::new("octo", "hello");
        transport.push(
            &GitHubApi::default().issues(&repo, &window(), 100),
            ApiResponse::new(401, r#"{"message":"Bad credentials"}"#),
        );
        let analyzer = analyzer(transport, settings(), AnalysisOptions::default());

        let err = analyzer
            .analyze_at("octo", Some(since()), ApiMode::Rest, now())
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::Auth(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_timeout_keeps_finished_work() {
        let transport = Arc::new(ScriptedTransport::with_delay(Duration::from_secs(1)));
        list_repos(&transport, &["hello", "slow"]);
        script_activity(&transport, "hello");

        let api = GitHubApi::default();
        let slow = Repo::new("octo", "slow");
        let first = api.issues(&slow, &window(), 100);
        for page in 2..=6 {
            let url = if page == 2 {
                first.clone()
            } else {
                format!("https://api.github.com/slow?page={}", page - 1)
            };
            let next = format!("https://api.github.com/slow?page={}", page);
            transport.push(
                &url,
                ApiResponse::new(200, "[]").with_header("Link", format!("<{}>; rel=\"next\"", next)),
            );
        }

        let options = AnalysisOptions {
            run_timeout: Duration::from_millis(3500),
            ..AnalysisOptions::default()
        };
        let analyzer = analyzer(transport, settings(), options);
        let result = analyzer
            .analyze_at("octo", Some(since()), ApiMode::Rest, now())
            .await
            .unwrap();

        assert_eq!(result.summary.status, RunStatus::Partial);
        assert_eq!(result.count, 3);
        assert_eq!(result.summary.failures.len(), 1);
        assert_eq!(result.summary.failures[0].stream, "octo/slow");
        assert!(result.summary.failures[0].error.contains("timeout"));
    }

    #[tokio::test]
    async fn test_batch_mode_uses_search() {
        let transport = Arc::new(ScriptedTransport::new());
        transport.push_json(
            &GitHubApi::default().graphql_url,
            json!({"data": {"search": {
                "pageInfo": {"hasNextPage": false, "endCursor": null},
                "nodes": [
                    {"__typename": "PullRequest", "id": "PR_1", "repository": {"nameWithOwner": "rust-lang/rust"},
                     "author": {"login": "octo"}, "createdAt": "2026-06-20T00:00:00Z"},
                    {"__typename": "PullRequest", "id": "PR_2", "repository": {"nameWithOwner": "rust-lang/rust"},
                     "author": {"login": "octo"}, "createdAt": "2026-06-21T00:00:00Z"}
                ]
            }}}),
        );
        let analyzer = analyzer(transport.clone(), settings(), AnalysisOptions::default());

        let result = analyzer
            .analyze_at("octo", Some(since()), ApiMode::Batch, now())
            .await
            .unwrap();
        assert_eq!(result.summary.api_mode, ApiMode::Batch);
        assert_eq!(result.summary.scores_by_dimension["code"], 2.0);
        assert_eq!(transport.requests().len(), 1);
    }

    #[tokio::test]
    async fn test_override_rules_apply() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("rules.toml");
        std::fs::write(&path, "[dimensions.everything]\nkinds = [\"pr\", \"issue\", \"commit\"]\nweight = 1.0\n").unwrap();

        let transport = Arc::new(ScriptedTransport::new());
        list_repos(&transport, &["hello"]);
        script_activity(&transport, "hello");
        let options = AnalysisOptions {
            rules_override: Some(path.clone()),
            self_repo_penalty: 1.0,
            ..AnalysisOptions::default()
        };
        let analyzer = analyzer(transport, settings(), options);

        let result = analyzer
            .analyze_at("octo", Some(since()), ApiMode::Auto, now())
            .await
            .unwrap();
        assert_eq!(result.summary.rules_origin, path.display().to_string());
        assert_eq!(result.scores.len(), 1);
        assert_eq!(result.scores[0].value, 3.0);
    }

    #[test]
    fn test_sort_and_dedup() {
        let e = |id: &str, day: u32| ContributionEvent {
            id: id.to_string(),
            kind: EventKind::Commit,
            repo: Repo::new("octo", "hello"),
            actor: "octo".to_string(),
            timestamp: Utc.with_ymd_and_hms(2026, 6, day, 0, 0, 0).unwrap(),
            is_bot: false,
            is_self_repo: true,
        };
        let mut events = vec![e("b", 2), e("a", 1), e("b", 2)];
        sort_and_dedup(&mut events);
        let ids: Vec<_> = events.iter().map(|e| e.id.as_str()).collect();
        assert_eq!(ids, vec!["a", "b"]);
    }
}
