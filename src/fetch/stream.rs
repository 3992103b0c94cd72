//! Lazily paginated page streams.
//!
//! A stream yields one `RawPage` per request, strictly in cursor order. It can
//! be restarted from its first page but never resumed mid-way.

use super::client::ApiClient;
use super::github::SEARCH_QUERY;
use super::transport::ApiRequest;
use crate::error::{PipelineError, PipelineResult};
use crate::models::{PageSource, RawPage, Repo};
use serde_json::{json, Value};
use tracing::debug;

/// Pagination style of a stream.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamKind {
    /// REST endpoint, paginated by `Link: <...>; rel="next"`.
    Rest { first_url: String },
    /// GraphQL search, paginated by `pageInfo.endCursor`.
    Graph {
        url: String,
        search: String,
        page_size: u32,
    },
}

#[derive(Debug, Clone, PartialEq)]
enum Cursor {
    Start,
    /// Next URL (REST) or end cursor (GraphQL).
    Next(String),
}

pub struct PageStream {
    stream: String,
    source: PageSource,
    repo: Option<Repo>,
    kind: StreamKind,
    cursor: Cursor,
    page: u32,
    max_pages: u32,
    exhausted: bool,
}

impl PageStream {
    pub fn rest(
        stream: impl Into<String>,
        source: PageSource,
        repo: Option<Repo>,
        first_url: String,
        max_pages: u32,
    ) -> Self {
        Self::new(stream.into(), source, repo, StreamKind::Rest { first_url }, max_pages)
    }

    pub fn graph(
        stream: impl Into<String>,
        url: String,
        search: String,
        page_size: u32,
        max_pages: u32,
    ) -> Self {
        Self::new(
            stream.into(),
            PageSource::Search,
            None,
            StreamKind::Graph {
                url,
                search,
                page_size: page_size.clamp(1, 100),
            },
            max_pages,
        )
    }

    fn new(stream: String, source: PageSource, repo: Option<Repo>, kind: StreamKind, max_pages: u32) -> Self {
        Self {
            stream,
            source,
            repo,
            kind,
            cursor: Cursor::Start,
            page: 0,
            max_pages,
            exhausted: false,
        }
    }

    /// Rewind to the first page.
    pub fn restart(&mut self) {
        self.cursor = Cursor::Start;
        self.page = 0;
        self.exhausted = false;
    }

    pub fn pages_read(&self) -> u32 {
        self.page
    }

    fn request(&self) -> ApiRequest {
        match (&self.kind, &self.cursor) {
            (StreamKind::Rest { first_url }, Cursor::Start) => ApiRequest::get(first_url.clone()),
            (StreamKind::Rest { .. }, Cursor::Next(url)) => ApiRequest::get(url.clone()),
            (StreamKind::Graph { url, search, page_size }, cursor) => {
                let after = match cursor {
                    Cursor::Start => Value::Null,
                    Cursor::Next(c) => Value::String(c.clone()),
                };
                ApiRequest::post_json(
                    url.clone(),
                    json!({
                        "query": SEARCH_QUERY,
                        "variables": { "q": search, "first": page_size, "after": after },
                    }),
                )
            }
        }
    }

    /// Fetch the next page, or `None` once the stream is done.
    ///
    /// An error ends the stream.
    pub async fn next_page(&mut self, client: &ApiClient) -> Option<PipelineResult<RawPage>> {
        if self.exhausted {
            return None;
        }
        if self.page >= self.max_pages {
            debug!("{}: page cap of {} reached", self.stream, self.max_pages);
            self.exhausted = true;
            return None;
        }

        let request = self.request();
        if matches!(self.kind, StreamKind::Graph { .. }) && !client.has_token() {
            self.exhausted = true;
            return Some(Err(PipelineError::Auth(
                "GraphQL search requires a token".to_string(),
            )));
        }

        let url = request.url.clone();
        let fetched = match client.execute(request).await {
            Ok(fetched) => fetched,
            Err(e) => {
                self.exhausted = true;
                return Some(Err(e));
            }
        };

        let (payload, next) = match self.kind {
            StreamKind::Rest { .. } => (fetched.body, fetched.next_link),
            StreamKind::Graph { .. } => match split_search(&url, fetched.body) {
                Ok(split) => split,
                Err(e) => {
                    self.exhausted = true;
                    return Some(Err(e));
                }
            },
        };

        self.page += 1;
        match next {
            Some(next) => self.cursor = Cursor::Next(next),
            None => self.exhausted = true,
        }

        Some(Ok(RawPage {
            stream: self.stream.clone(),
            source: self.source,
            repo: self.repo.clone(),
            page: self.page,
            payload,
            from_cache: fetched.from_cache,
        }))
    }
}

/// Split a search response into its nodes and the next cursor.
fn split_search(url: &str, mut body: Value) -> PipelineResult<(Value, Option<String>)> {
    let search = body.pointer_mut("/data/search").map(Value::take);
    let search = match search {
        Some(search) if search.is_object() => search,
        _ => {
            let detail = body
                .get("errors")
                .and_then(Value::as_array)
                .and_then(|errors| errors.first())
                .and_then(|e| e.get("message"))
                .and_then(Value::as_str)
                .unwrap_or("response has no data.search")
                .to_string();
            return Err(PipelineError::Decode {
                url: url.to_string(),
                detail,
            });
        }
    };

    let has_next = search
        .pointer("/pageInfo/hasNextPage")
        .and_then(Value::as_bool)
        .unwrap_or(false);
    let cursor = search
        .pointer("/pageInfo/endCursor")
        .and_then(Value::as_str)
        .map(String::from);
    let nodes = match search.get("nodes") {
        Some(Value::Array(nodes)) => Value::Array(nodes.clone()),
        _ => Value::Array(Vec::new()),
    };

    Ok((nodes, if has_next { cursor } else { None }))
}
