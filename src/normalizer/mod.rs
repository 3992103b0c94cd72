//! Mapping of provider payloads to canonical contribution events.
//!
//! Normalization is pure: a page in, events and a skip tally out. A record
//! that cannot be mapped is dropped and counted; it never fails the page.

use crate::models::{ContributionEvent, EventKind, PageSource, Provider, RawPage, Repo, SkipTally, Window};
use chrono::{DateTime, Utc};
use serde_json::Value;

/// Filters applied while normalizing.
#[derive(Debug, Clone, Copy, Default)]
pub struct NormalizeContext<'a> {
    /// Keep only events by this login.
    pub subject: Option<&'a str>,
    /// Keep only events inside this window.
    pub window: Option<&'a Window>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Normalized {
    pub events: Vec<ContributionEvent>,
    pub skipped: SkipTally,
}

/// Well-known automation accounts that do not carry a `[bot]` suffix.
const KNOWN_BOTS: &[&str] = &["dependabot", "github-actions", "renovate", "renovate[bot]"];

/// Whether a login looks like an automation account.
pub fn is_bot_login(login: &str) -> bool {
    let lower = login.to_lowercase();
    KNOWN_BOTS.contains(&lower.as_str()) || lower.contains("[bot]") || lower.ends_with("-bot")
}

/// Why a record was not turned into an event.
enum Skip {
    Unsupported,
    Malformed,
}

/// Fields extracted from one record before filtering.
struct Record {
    id: String,
    kind: EventKind,
    repo: Repo,
    actor: String,
    timestamp: DateTime<Utc>,
    bot_type: bool,
}

pub fn normalize(page: &RawPage, provider: Provider, ctx: &NormalizeContext<'_>) -> Normalized {
    let mut out = Normalized::default();

    let records = match page.payload.as_array() {
        Some(records) => records,
        None => {
            out.skipped.malformed += 1;
            return out;
        }
    };

    for item in records {
        let record = match provider {
            Provider::GitHub => github_record(page, item),
        };
        match record {
            Ok(record) => admit(record, ctx, &mut out),
            Err(Skip::Unsupported) => out.skipped.unsupported += 1,
            Err(Skip::Malformed) => out.skipped.malformed += 1,
        }
    }

    out
}

fn admit(record: Record, ctx: &NormalizeContext<'_>, out: &mut Normalized) {
    if let Some(subject) = ctx.subject {
        if !record.actor.eq_ignore_ascii_case(subject) {
            out.skipped.other_actor += 1;
            return;
        }
    }
    if let Some(window) = ctx.window {
        if !window.contains(record.timestamp) {
            out.skipped.out_of_window += 1;
            return;
        }
    }

    let is_self_repo = record.repo.is_owned_by(&record.actor);
    out.events.push(ContributionEvent {
        is_bot: record.bot_type || is_bot_login(&record.actor),
        is_self_repo,
        id: record.id,
        kind: record.kind,
        repo: record.repo,
        actor: record.actor,
        timestamp: record.timestamp,
    });
}

fn github_record(page: &RawPage, item: &Value) -> Result<Record, Skip> {
    match page.source {
        PageSource::Issues => {
            let kind = if item.get("pull_request").is_some() {
                EventKind::Pr
            } else {
                EventKind::Issue
            };
            let user = item.get("user");
            Ok(Record {
                id: id_of(item.get("id"))?,
                kind,
                repo: page.repo.clone().ok_or(Skip::Malformed)?,
                actor: login_of(user).ok_or(Skip::Malformed)?,
                timestamp: timestamp_of(item.get("created_at"))?,
                bot_type: is_bot_type(user),
            })
        }
        PageSource::Commits => {
            let author = item.get("author").filter(|a| !a.is_null());
            let actor = login_of(author)
                .or_else(|| login_of(item.get("committer")))
                .unwrap_or_else(|| "unknown".to_string());
            let date = item
                .pointer("/commit/author/date")
                .or_else(|| item.pointer("/commit/committer/date"));
            Ok(Record {
                id: id_of(item.get("sha"))?,
                kind: EventKind::Commit,
                repo: page.repo.clone().ok_or(Skip::Malformed)?,
                actor,
                timestamp: timestamp_of(date)?,
                bot_type: is_bot_type(author),
            })
        }
        PageSource::Reviews => {
            let user = item.get("user");
            let date = item
                .get("submitted_at")
                .filter(|v| !v.is_null())
                .or_else(|| item.get("created_at"));
            Ok(Record {
                id: id_of(item.get("id"))?,
                kind: EventKind::Review,
                repo: page.repo.clone().ok_or(Skip::Malformed)?,
                actor: login_of(user).ok_or(Skip::Malformed)?,
                timestamp: timestamp_of(date)?,
                bot_type: is_bot_type(user),
            })
        }
        PageSource::Search => {
            let kind = match item.get("__typename").and_then(Value::as_str) {
                Some("PullRequest") => EventKind::Pr,
                Some("Issue") => EventKind::Issue,
                _ => return Err(Skip::Unsupported),
            };
            let author = item.get("author");
            let repo = item
                .pointer("/repository/nameWithOwner")
                .and_then(Value::as_str)
                .and_then(Repo::parse)
                .ok_or(Skip::Malformed)?;
            Ok(Record {
                id: id_of(item.get("id"))?,
                kind,
                repo,
                actor: login_of(author).ok_or(Skip::Malformed)?,
                timestamp: timestamp_of(item.get("createdAt"))?,
                bot_type: author
                    .and_then(|a| a.get("__typename"))
                    .and_then(Value::as_str)
                    == Some("Bot"),
            })
        }
        PageSource::Pulls | PageSource::Repos => Err(Skip::Unsupported),
    }
}

/// String or numeric identifier.
fn id_of(value: Option<&Value>) -> Result<String, Skip> {
    match value {
        Some(Value::String(s)) if !s.is_empty() => Ok(s.clone()),
        Some(Value::Number(n)) => Ok(n.to_string()),
        _ => Err(Skip::Malformed),
    }
}

fn login_of(user: Option<&Value>) -> Option<String> {
    user?
        .get("login")
        .and_then(Value::as_str)
        .filter(|l| !l.is_empty())
        .map(String::from)
}

fn is_bot_type(user: Option<&Value>) -> bool {
    user.and_then(|u| u.get("type")).and_then(Value::as_str) == Some("Bot")
}

fn timestamp_of(value: Option<&Value>) -> Result<DateTime<Utc>, Skip> {
    value
        .and_then(Value::as_str)
        .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
        .map(|ts| ts.with_timezone(&Utc))
        .ok_or(Skip::Malformed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::json;

    fn page(source: PageSource, payload: Value) -> RawPage {
        RawPage {
            stream: "octo/hello".to_string(),
            source,
            repo: Some(Repo::new("octo", "hello")),
            page: 1,
            payload,
            from_cache: false,
        }
    }

    fn run(page: &RawPage) -> Normalized {
        normalize(page, Provider::GitHub, &NormalizeContext::default())
    }

    #[test]
    fn test_issues_and_prs() {
        let p = page(
            PageSource::Issues,
            json!([
                {"id": 1, "user": {"login": "alice"}, "created_at": "2026-01-05T10:00:00Z"},
                {"id": 2, "user": {"login": "octo"}, "created_at": "2026-01-06T10:00:00Z",
                 "pull_request": {"url": "x"}}
            ]),
        );
        let out = run(&p);
        assert_eq!(out.events.len(), 2);
        assert_eq!(out.events[0].kind, EventKind::Issue);
        assert_eq!(out.events[0].id, "1");
        assert!(!out.events[0].is_self_repo);
        assert_eq!(out.events[1].kind, EventKind::Pr);
        assert!(out.events[1].is_self_repo);
        assert_eq!(
            out.events[1].timestamp,
            Utc.with_ymd_and_hms(2026, 1, 6, 10, 0, 0).unwrap()
        );
    }

    #[test]
    fn test_commit_actor_fallbacks() {
        let p = page(
            PageSource::Commits,
            json!([
                {"sha": "a1", "author": {"login": "alice"}, "commit": {"author": {"date": "2026-01-01T00:00:00Z"}}},
                {"sha": "b2", "author": null, "committer": {"login": "bob"},
                 "commit": {"author": {"date": "2026-01-02T00:00:00+02:00"}}},
                {"sha": "c3", "commit": {"author": {"date": "2026-01-03T00:00:00Z"}}}
            ]),
        );
        let out = run(&p);
        let actors: Vec<_> = out.events.iter().map(|e| e.actor.as_str()).collect();
        assert_eq!(actors, vec!["alice", "bob", "unknown"]);
        assert_eq!(
            out.events[1].timestamp,
            Utc.with_ymd_and_hms(2026, 1, 1, 22, 0, 0).unwrap()
        );
    }

    #[test]
    fn test_review_timestamp_fallback() {
        let p = page(
            PageSource::Reviews,
            json!([
                {"id": 10, "user": {"login": "alice"}, "submitted_at": "2026-01-04T00:00:00Z"},
                {"id": 11, "user": {"login": "alice"}, "submitted_at": null, "created_at": "2026-01-05T00:00:00Z"}
            ]),
        );
        let out = run(&p);
        assert_eq!(out.events.len(), 2);
        assert!(out.events.iter().all(|e| e.kind == EventKind::Review));
    }

    #[test]
    fn test_malformed_records_drop_individually() {
        let p = page(
            PageSource::Issues,
            json!([
                {"id": 1, "user": {"login": "alice"}, "created_at": "yesterday"},
                {"id": 2, "user": {"login": "alice"}, "created_at": "2026-01-05T10:00:00Z"},
                {"user": {"login": "alice"}, "created_at": "2026-01-05T10:00:00Z"}
            ]),
        );
        let out = run(&p);
        assert_eq!(out.events.len(), 1);
        assert_eq!(out.skipped.malformed, 2);

        let not_a_list = page(PageSource::Issues, json!({"message": "oops"}));
        assert_eq!(run(&not_a_list).skipped.malformed, 1);
    }

    #[test]
    fn test_unsupported_records_are_counted() {
        let pulls = page(PageSource::Pulls, json!([{"number": 1}, {"number": 2}]));
        let out = run(&pulls);
        assert!(out.events.is_empty());
        assert_eq!(out.skipped.unsupported, 2);

        let mut search = page(
            PageSource::Search,
            json!([{"__typename": "Discussion", "id": "D_1"}]),
        );
        search.repo = None;
        assert_eq!(run(&search).skipped.unsupported, 1);
    }

    #[test]
    fn test_bot_detection() {
        assert!(is_bot_login("dependabot[bot]"));
        assert!(is_bot_login("Renovate"));
        assert!(is_bot_login("github-actions"));
        assert!(is_bot_login("deploy-bot"));
        assert!(!is_bot_login("robotics-fan"));
        assert!(!is_bot_login("octo"));

        let p = page(
            PageSource::Issues,
            json!([
                {"id": 1, "user": {"login": "ci-helper", "type": "Bot"}, "created_at": "2026-01-05T10:00:00Z"},
                {"id": 2, "user": {"login": "snyk-bot"}, "created_at": "2026-01-05T10:00:00Z"},
                {"id": 3, "user": {"login": "alice", "type": "User"}, "created_at": "2026-01-05T10:00:00Z"}
            ]),
        );
        let flags: Vec<_> = run(&p).events.iter().map(|e| e.is_bot).collect();
        assert_eq!(flags, vec![true, true, false]);
    }

    #[test]
    fn test_subject_and_window_filters() {
        let window = Window::new(
            Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap(),
            Utc.with_ymd_and_hms(2026, 1, 31, 0, 0, 0).unwrap(),
        );
        let ctx = NormalizeContext {
            subject: Some("Alice"),
            window: Some(&window),
        };
        let p = page(
            PageSource::Issues,
            json!([
                {"id": 1, "user": {"login": "alice"}, "created_at": "2026-01-05T10:00:00Z"},
                {"id": 2, "user": {"login": "bob"}, "created_at": "2026-01-05T10:00:00Z"},
                {"id": 3, "user": {"login": "alice"}, "created_at": "2025-12-05T10:00:00Z"}
            ]),
        );
        let out = normalize(&p, Provider::GitHub, &ctx);
        assert_eq!(out.events.len(), 1);
        assert_eq!(out.skipped.other_actor, 1);
        assert_eq!(out.skipped.out_of_window, 1);
    }

    #[test]
    fn test_search_nodes() {
        let mut p = page(
            PageSource::Search,
            json!([
                {"__typename": "PullRequest", "id": "PR_1", "repository": {"nameWithOwner": "rust-lang/rust"},
                 "author": {"login": "octo", "__typename": "User"}, "createdAt": "2026-01-05T10:00:00Z"},
                {"__typename": "Issue", "id": "I_2", "repository": {"nameWithOwner": "octo/hello"},
                 "author": {"login": "octo", "__typename": "User"}, "createdAt": "2026-01-06T10:00:00Z"},
                {"__typename": "Issue", "id": "I_3", "repository": {"nameWithOwner": "octo/hello"},
                 "author": null, "createdAt": "2026-01-06T10:00:00Z"}
            ]),
        );
        p.repo = None;
        let out = run(&p);
        assert_eq!(out.events.len(), 2);
        assert_eq!(out.events[0].kind, EventKind::Pr);
        assert_eq!(out.events[0].repo, Repo::new("rust-lang", "rust"));
        assert!(!out.events[0].is_self_repo);
        assert!(out.events[1].is_self_repo);
        assert_eq!(out.skipped.malformed, 1);
    }
}
