//! GitHub endpoint layout and response header helpers.

use super::transport::ApiResponse;
use crate::models::{Repo, Window};
use chrono::{DateTime, SecondsFormat, Utc};
use std::time::Duration;

pub const DEFAULT_API_URL: &str = "https://api.github.com";
pub const DEFAULT_GRAPHQL_URL: &str = "https://api.github.com/graphql";

/// Cursor-paginated search over issues and pull requests.
pub const SEARCH_QUERY: &str = "query($q: String!, $first: Int!, $after: String) {
  search(type: ISSUE, query: $q, first: $first, after: $after) {
    pageInfo { hasNextPage endCursor }
    nodes {
      __typename
      ... on PullRequest { id number repository { nameWithOwner } author { login __typename } createdAt }
      ... on Issue { id number repository { nameWithOwner } author { login __typename } createdAt }
    }
  }
}";

/// URL builder for the REST and GraphQL endpoints.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GitHubApi {
    pub base_url: String,
    pub graphql_url: String,
}

impl Default for GitHubApi {
    fn default() -> Self {
        Self::new(DEFAULT_API_URL, DEFAULT_GRAPHQL_URL)
    }
}

fn iso(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Secs, true)
}

impl GitHubApi {
    pub fn new(base_url: &str, graphql_url: &str) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            graphql_url: graphql_url.to_string(),
        }
    }

    pub fn user_repos(&self, login: &str, per_page: u32) -> String {
        format!(
            "{}/users/{}/repos?per_page={}&type=owner&sort=updated",
            self.base_url, login, per_page
        )
    }

    /// Issues and pull requests (the issues endpoint returns both).
    pub fn issues(&self, repo: &Repo, window: &Window, per_page: u32) -> String {
        format!(
            "{}/repos/{}/{}/issues?state=all&per_page={}&since={}",
            self.base_url,
            repo.owner,
            repo.name,
            per_page,
            iso(window.since)
        )
    }

    pub fn commits(&self, repo: &Repo, window: &Window, author: Option<&str>, per_page: u32) -> String {
        let mut url = format!(
            "{}/repos/{}/{}/commits?per_page={}&since={}&until={}",
            self.base_url,
            repo.owner,
            repo.name,
            per_page,
            iso(window.since),
            iso(window.until)
        );
        if let Some(author) = author {
            url.push_str("&author=");
            url.push_str(author);
        }
        url
    }

    pub fn pulls(&self, repo: &Repo, per_page: u32) -> String {
        format!(
            "{}/repos/{}/{}/pulls?state=all&per_page={}&sort=updated",
            self.base_url, repo.owner, repo.name, per_page
        )
    }

    pub fn reviews(&self, repo: &Repo, number: u64, per_page: u32) -> String {
        format!(
            "{}/repos/{}/{}/pulls/{}/reviews?per_page={}",
            self.base_url, repo.owner, repo.name, number, per_page
        )
    }

    /// Search string for public issues and PRs authored by `login` in the window.
    pub fn search_query(login: &str, window: &Window) -> String {
        format!(
            "author:{} is:public created:{}..{}",
            login,
            iso(window.since),
            iso(window.until)
        )
    }
}

/// Extract the `rel="next"` target of a Link header.
pub fn parse_link_next(link: Option<&str>) -> Option<String> {
    link?
        .split(',')
        .map(str::trim)
        .find(|part| part.contains("rel=\"next\""))
        .and_then(|part| {
            let start = part.find('<')?;
            let end = part[start + 1..].find('>')? + start + 1;
            Some(part[start + 1..end].to_string())
        })
}

/// How long the server asked us to wait, if it said.
///
/// `Retry-After` (seconds) wins; otherwise an exhausted primary limit points
/// at `X-RateLimit-Reset` (epoch seconds), plus one second of slack.
pub fn retry_hint(response: &ApiResponse, now: DateTime<Utc>) -> Option<Duration> {
    if let Some(secs) = response
        .header("retry-after")
        .and_then(|v| v.trim().parse::<u64>().ok())
    {
        return Some(Duration::from_secs(secs));
    }

    let exhausted = response
        .header("x-ratelimit-remaining")
        .map(|v| v.trim() == "0")
        .unwrap_or(response.status == 429);
    if !exhausted {
        return None;
    }

    let reset = response
        .header("x-ratelimit-reset")
        .and_then(|v| v.trim().parse::<i64>().ok())?;
    let wait = (reset - now.timestamp()).max(0) + 1;
    Some(Duration::from_secs(wait as u64))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn window() -> Window {
        Window::new(
            Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap(),
            Utc.with_ymd_and_hms(2026, 2, 1, 0, 0, 0).unwrap(),
        )
    }

    #[test]
    fn test_urls() {
        let api = GitHubApi::new("https://api.github.com/", DEFAULT_GRAPHQL_URL);
        let repo = Repo::new("octo", "hello");
        assert_eq!(
            api.user_repos("octo", 100),
            "https://api.github.com/users/octo/repos?per_page=100&type=owner&sort=updated"
        );
        assert_eq!(
            api.commits(&repo, &window(), Some("octo"), 50),
            "https://api.github.com/repos/octo/hello/commits?per_page=50&since=2026-01-01T00:00:00Z&until=2026-02-01T00:00:00Z&author=octo"
        );
        assert!(api.reviews(&repo, 7, 100).ends_with("/pulls/7/reviews?per_page=100"));
        assert_eq!(
            GitHubApi::search_query("octo", &window()),
            "author:octo is:public created:2026-01-01T00:00:00Z..2026-02-01T00:00:00Z"
        );
    }

    #[test]
    fn test_parse_link_next() {
        let link = r#"<https://api.github.com/x?page=2>; rel="next", <https://api.github.com/x?page=5>; rel="last""#;
        assert_eq!(
            parse_link_next(Some(link)),
            Some("https://api.github.com/x?page=2".to_string())
        );
        let last_only = r#"<https://api.github.com/x?page=1>; rel="prev""#;
        assert_eq!(parse_link_next(Some(last_only)), None);
        assert_eq!(parse_link_next(None), None);
    }

    #[test]
    fn test_retry_hint_prefers_retry_after() {
        let now = Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap();
        let resp = ApiResponse::new(429, "")
            .with_header("Retry-After", "7")
            .with_header("X-RateLimit-Reset", (now.timestamp() + 100).to_string());
        assert_eq!(retry_hint(&resp, now), Some(Duration::from_secs(7)));
    }

    #[test]
    fn test_retry_hint_from_reset() {
        let now = Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap();
        let resp = ApiResponse::new(403, "")
            .with_header("X-RateLimit-Remaining", "0")
            .with_header("X-RateLimit-Reset", (now.timestamp() + 30).to_string());
        assert_eq!(retry_hint(&resp, now), Some(Duration::from_secs(31)));

        let not_exhausted = ApiResponse::new(403, "")
            .with_header("X-RateLimit-Remaining", "12")
            .with_header("X-RateLimit-Reset", (now.timestamp() + 30).to_string());
        assert_eq!(retry_hint(&not_exhausted, now), None);
    }
}
