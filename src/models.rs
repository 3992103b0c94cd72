//! Data models for the contribution scorer.
//!
//! This module contains the core data structures shared by the fetcher,
//! the normalizer, the aggregator and the report renderer.

use chrono::{DateTime, Duration, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

/// Kind of a normalized contribution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventKind {
    Commit,
    Pr,
    Issue,
    Review,
}

impl EventKind {
    pub const ALL: [EventKind; 4] = [
        EventKind::Commit,
        EventKind::Pr,
        EventKind::Issue,
        EventKind::Review,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::Commit => "commit",
            EventKind::Pr => "pr",
            EventKind::Issue => "issue",
            EventKind::Review => "review",
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EventKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "commit" => Ok(EventKind::Commit),
            "pr" | "pull_request" => Ok(EventKind::Pr),
            "issue" => Ok(EventKind::Issue),
            "review" => Ok(EventKind::Review),
            other => Err(format!("unknown event kind: {}", other)),
        }
    }
}

/// Activity provider. Selected by string key at construction time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Provider {
    GitHub,
}

impl FromStr for Provider {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "github" => Ok(Provider::GitHub),
            other => Err(format!("unknown provider: {}", other)),
        }
    }
}

/// Which transport the fetcher should use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ApiMode {
    /// Paginated REST endpoints, one stream per repository.
    Rest,
    /// GraphQL search, cursor paginated.
    Batch,
    /// Pick whichever needs fewer requests for the window.
    #[default]
    Auto,
}

impl fmt::Display for ApiMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ApiMode::Rest => write!(f, "rest"),
            ApiMode::Batch => write!(f, "batch"),
            ApiMode::Auto => write!(f, "auto"),
        }
    }
}

/// A repository reference, serialized as `owner/name`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Repo {
    pub owner: String,
    pub name: String,
}

impl Repo {
    pub fn new(owner: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            owner: owner.into(),
            name: name.into(),
        }
    }

    /// Parse `owner/name`, tolerating a `github.com/` prefix.
    pub fn parse(full_name: &str) -> Option<Self> {
        let trimmed = full_name
            .trim()
            .trim_start_matches("https://")
            .trim_start_matches("github.com/")
            .trim_end_matches(".git");
        let (owner, name) = trimmed.split_once('/')?;
        if owner.is_empty() || name.is_empty() || name.contains('/') {
            return None;
        }
        Some(Self::new(owner, name))
    }

    pub fn full_name(&self) -> String {
        format!("{}/{}", self.owner, self.name)
    }

    /// Repository ownership is compared case-insensitively, like logins.
    pub fn is_owned_by(&self, login: &str) -> bool {
        self.owner.eq_ignore_ascii_case(login)
    }
}

impl fmt::Display for Repo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.owner, self.name)
    }
}

impl TryFrom<String> for Repo {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Repo::parse(&value).ok_or_else(|| format!("invalid repository name: {}", value))
    }
}

impl From<Repo> for String {
    fn from(repo: Repo) -> Self {
        repo.full_name()
    }
}

/// One normalized unit of activity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContributionEvent {
    /// Provider-assigned identifier (commit sha, issue id, ...).
    pub id: String,
    pub kind: EventKind,
    pub repo: Repo,
    /// Login of the account that performed the activity.
    pub actor: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub is_bot: bool,
    /// Authored by the repository owner in their own repository.
    #[serde(default)]
    pub is_self_repo: bool,
}

/// Inclusive time window `[since, until]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Window {
    pub since: DateTime<Utc>,
    pub until: DateTime<Utc>,
}

impl Window {
    pub fn new(since: DateTime<Utc>, until: DateTime<Utc>) -> Self {
        Self { since, until }
    }

    /// Build a window ending at `until` whose start is no earlier than
    /// `until - max_days`. A missing or too-early `since` is raised to that
    /// bound; a `since` after `until` collapses to `until`.
    pub fn clamped(since: Option<DateTime<Utc>>, until: DateTime<Utc>, max_days: u32) -> Self {
        let earliest = days_before(until, i64::from(max_days));
        let since = since.unwrap_or(earliest).max(earliest).min(until);
        Self { since, until }
    }

    pub fn contains(&self, ts: DateTime<Utc>) -> bool {
        ts >= self.since && ts <= self.until
    }

    pub fn days(&self) -> i64 {
        (self.until - self.since).num_days()
    }

    pub fn label(&self) -> String {
        format!(
            "{}..{}",
            self.since.format("%Y-%m-%d"),
            self.until.format("%Y-%m-%d")
        )
    }
}

/// `ts - days`, saturating at the earliest representable instant.
fn days_before(ts: DateTime<Utc>, days: i64) -> DateTime<Utc> {
    saturating_sub(ts, Duration::try_days(days))
}

fn saturating_sub(ts: DateTime<Utc>, delta: Option<Duration>) -> DateTime<Utc> {
    match delta.and_then(|d| ts.checked_sub_signed(d)) {
        Some(earlier) => earlier,
        None if delta.is_some_and(|d| d < Duration::zero()) => DateTime::<Utc>::MAX_UTC,
        None => DateTime::<Utc>::MIN_UTC,
    }
}

/// Parse a since bound: relative (`30d`, `12h`), RFC 3339, or a plain date.
pub fn parse_since(text: &str, now: DateTime<Utc>) -> Result<DateTime<Utc>, String> {
    let s = text.trim().to_lowercase();

    if let Some(days) = s.strip_suffix('d').and_then(|n| n.parse::<i64>().ok()) {
        return Ok(days_before(now, days));
    }
    if let Some(hours) = s.strip_suffix('h').and_then(|n| n.parse::<i64>().ok()) {
        return Ok(saturating_sub(now, Duration::try_hours(hours)));
    }
    if let Ok(ts) = DateTime::parse_from_rfc3339(text.trim()) {
        return Ok(ts.with_timezone(&Utc));
    }
    if let Ok(date) = NaiveDate::parse_from_str(&s, "%Y-%m-%d") {
        if let Some(midnight) = date.and_hms_opt(0, 0, 0) {
            return Ok(midnight.and_utc());
        }
    }

    Err(format!(
        "Invalid since value '{}': expected e.g. 30d, 12h, 2024-01-31 or RFC 3339",
        text
    ))
}

/// One aggregate result for a (subject, dimension, window).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Score {
    pub subject: String,
    pub dimension: String,
    pub window: Window,
    pub value: f64,
    /// Scores are computed as of the end of their window.
    pub computed_at: DateTime<Utc>,
}

/// Endpoint family a raw page came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PageSource {
    Repos,
    Issues,
    Commits,
    Pulls,
    Reviews,
    Search,
}

/// An undecoded provider page as handed to the normalizer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawPage {
    /// Stream the page belongs to (a repository or a search).
    pub stream: String,
    pub source: PageSource,
    /// Repository the records belong to, when the endpoint is per repository.
    pub repo: Option<Repo>,
    /// 1-based page number within its endpoint.
    pub page: u32,
    pub payload: serde_json::Value,
    /// Served from the conditional-request cache (HTTP 304).
    pub from_cache: bool,
}

/// Records dropped while normalizing, by reason.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SkipTally {
    /// Record types the normalizer does not map.
    pub unsupported: usize,
    /// Records missing or failing to parse a required field.
    pub malformed: usize,
    /// Records with a timestamp outside the analysis window.
    pub out_of_window: usize,
    /// Records by someone other than the analyzed subject.
    pub other_actor: usize,
}

impl SkipTally {
    pub fn total(&self) -> usize {
        self.unsupported + self.malformed + self.out_of_window + self.other_actor
    }

    pub fn merge(&mut self, other: &SkipTally) {
        self.unsupported += other.unsupported;
        self.malformed += other.malformed;
        self.out_of_window += other.out_of_window;
        self.other_actor += other.other_actor;
    }
}

/// A fetch stream that did not complete.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamFailure {
    pub stream: String,
    pub error: String,
    pub retryable: bool,
}

/// Overall outcome of an analysis run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Ok,
    Partial,
    Failed,
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RunStatus::Ok => write!(f, "ok"),
            RunStatus::Partial => write!(f, "partial"),
            RunStatus::Failed => write!(f, "failed"),
        }
    }
}

impl RunStatus {
    pub fn emoji(&self) -> &'static str {
        match self {
            RunStatus::Ok => "✅",
            RunStatus::Partial => "⚠️",
            RunStatus::Failed => "❌",
        }
    }
}

/// Summary of an analysis run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnalysisSummary {
    pub subject: String,
    pub status: RunStatus,
    /// Transport actually used after resolving `auto`.
    pub api_mode: ApiMode,
    pub window: Window,
    /// Whether the requested since bound was raised to the maximum window.
    pub since_clamped: bool,
    /// Where the ruleset came from (`default` or a path).
    pub rules_origin: String,
    pub streams_total: usize,
    pub total_events: usize,
    pub counts_by_kind: BTreeMap<EventKind, usize>,
    pub scores_by_dimension: BTreeMap<String, f64>,
    pub skipped: SkipTally,
    pub pages_fetched: usize,
    pub pages_from_cache: usize,
    pub failures: Vec<StreamFailure>,
    pub duration_seconds: f64,
}

/// Everything an analysis run hands back to its caller.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnalysisResult {
    pub summary: AnalysisSummary,
    pub scores: Vec<Score>,
    pub count: usize,
    pub events: Vec<ContributionEvent>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 10, 16, 12, 0, 0).unwrap()
    }

    #[test]
    fn test_event_kind_parse() {
        assert_eq!("pr".parse::<EventKind>(), Ok(EventKind::Pr));
        assert_eq!("Pull_Request".parse::<EventKind>(), Ok(EventKind::Pr));
        assert_eq!("REVIEW".parse::<EventKind>(), Ok(EventKind::Review));
        assert!("star".parse::<EventKind>().is_err());
    }

    #[test]
    fn test_repo_parse() {
        assert_eq!(Repo::parse("rust-lang/rust"), Some(Repo::new("rust-lang", "rust")));
        assert_eq!(
            Repo::parse("github.com/rust-lang/rust"),
            Some(Repo::new("rust-lang", "rust"))
        );
        assert_eq!(Repo::parse("rust-lang"), None);
        assert_eq!(Repo::parse("a/b/c"), None);
        assert!(Repo::new("Octo", "x").is_owned_by("octo"));
    }

    #[test]
    fn test_repo_serializes_as_string() {
        let json = serde_json::to_string(&Repo::new("octo", "hello")).unwrap();
        assert_eq!(json, "\"octo/hello\"");
        let back: Repo = serde_json::from_str(&json).unwrap();
        assert_eq!(back, Repo::new("octo", "hello"));
        assert!(serde_json::from_str::<Repo>("\"nope\"").is_err());
    }

    #[test]
    fn test_window_clamps_to_max_days() {
        let requested = now() - Duration::days(400);
        let window = Window::clamped(Some(requested), now(), 180);
        assert_eq!(window.since, now() - Duration::days(180));
        assert_eq!(window.days(), 180);
    }

    #[test]
    fn test_window_keeps_recent_since() {
        let requested = now() - Duration::days(30);
        let window = Window::clamped(Some(requested), now(), 180);
        assert_eq!(window.since, requested);

        let open = Window::clamped(None, now(), 90);
        assert_eq!(open.days(), 90);

        let future = Window::clamped(Some(now() + Duration::days(2)), now(), 90);
        assert_eq!(future.since, now());
    }

    #[test]
    fn test_window_contains_is_inclusive() {
        let window = Window::new(now() - Duration::days(1), now());
        assert!(window.contains(now()));
        assert!(window.contains(now() - Duration::days(1)));
        assert!(!window.contains(now() + Duration::seconds(1)));
    }

    #[test]
    fn test_parse_since_forms() {
        assert_eq!(parse_since("30d", now()), Ok(now() - Duration::days(30)));
        assert_eq!(parse_since("12h", now()), Ok(now() - Duration::hours(12)));
        assert_eq!(
            parse_since("2026-01-02", now()),
            Ok(Utc.with_ymd_and_hms(2026, 1, 2, 0, 0, 0).unwrap())
        );
        assert_eq!(
            parse_since("2026-01-02T03:04:05Z", now()),
            Ok(Utc.with_ymd_and_hms(2026, 1, 2, 3, 4, 5).unwrap())
        );
        assert!(parse_since("last tuesday", now()).is_err());
    }

    #[test]
    fn test_parse_since_huge_offsets_saturate() {
        assert_eq!(parse_since("99999999999d", now()), Ok(DateTime::<Utc>::MIN_UTC));
        assert_eq!(parse_since("9999999999999999d", now()), Ok(DateTime::<Utc>::MIN_UTC));
        assert_eq!(parse_since("9999999999999999h", now()), Ok(DateTime::<Utc>::MIN_UTC));

        let since = parse_since("99999999999d", now()).unwrap();
        let window = Window::clamped(Some(since), now(), 180);
        assert_eq!(window.since, now() - Duration::days(180));
    }

    #[test]
    fn test_clamped_with_huge_max_days() {
        let window = Window::clamped(None, now(), u32::MAX);
        assert_eq!(window.since, DateTime::<Utc>::MIN_UTC);
        assert_eq!(window.until, now());

        let window = Window::clamped(None, now(), 100_000_000);
        assert_eq!(window.since, DateTime::<Utc>::MIN_UTC);
        assert!(window.contains(now() - Duration::days(365)));
    }

    #[test]
    fn test_skip_tally_merge() {
        let mut tally = SkipTally {
            unsupported: 1,
            ..SkipTally::default()
        };
        tally.merge(&SkipTally {
            malformed: 2,
            other_actor: 3,
            ..SkipTally::default()
        });
        assert_eq!(tally.total(), 6);
    }

    #[test]
    fn test_kind_keys_serialize_in_maps() {
        let mut counts = BTreeMap::new();
        counts.insert(EventKind::Pr, 3usize);
        let json = serde_json::to_string(&counts).unwrap();
        assert_eq!(json, r#"{"pr":3}"#);
    }
}
