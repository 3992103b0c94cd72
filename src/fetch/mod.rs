//! Concurrent activity fetching.
//!
//! Streams are planned per repository (REST) or as one search (GraphQL) and
//! run on a bounded worker pool. Pages are forwarded over a channel as they
//! arrive so the caller can normalize while fetching continues.

pub mod client;
pub mod github;
pub mod stream;
pub mod transport;

pub use client::{ApiClient, RequestPolicy};
pub use github::GitHubApi;
pub use stream::PageStream;
pub use transport::{HttpTransport, Transport};

use crate::error::{PipelineError, PipelineResult};
use crate::models::{ApiMode, PageSource, RawPage, Repo, Window};
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

/// Upper bound on concurrent streams.
pub const MAX_CONCURRENCY: usize = 20;

/// Fetch layer tuning.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FetchSettings {
    pub concurrency: usize,
    pub page_size: u32,
    /// Pages per endpoint before a stream stops paginating.
    pub max_pages: u32,
    pub max_repos: usize,
    /// Pull requests per repository whose reviews are fetched.
    pub max_review_prs: usize,
    /// Estimated REST calls above which `auto` switches to GraphQL.
    pub batch_threshold: usize,
}

impl Default for FetchSettings {
    fn default() -> Self {
        Self {
            concurrency: 5,
            page_size: 100,
            max_pages: 10,
            max_repos: 20,
            max_review_prs: 20,
            batch_threshold: 400,
        }
    }
}

impl FetchSettings {
    pub fn worker_count(&self) -> usize {
        self.concurrency.clamp(1, MAX_CONCURRENCY)
    }
}

/// What one stream fetches.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamTarget {
    Repository(Repo),
    Search { login: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamPlan {
    pub id: String,
    pub target: StreamTarget,
}

impl StreamPlan {
    pub fn repository(repo: Repo) -> Self {
        Self {
            id: repo.full_name(),
            target: StreamTarget::Repository(repo),
        }
    }

    pub fn search(login: &str) -> Self {
        Self {
            id: format!("search:{}", login),
            target: StreamTarget::Search {
                login: login.to_string(),
            },
        }
    }
}

/// Messages from the worker pool.
#[derive(Debug)]
pub enum StreamEvent {
    Page(RawPage),
    /// A stream ended, with its page count or the error that stopped it.
    Finished {
        stream: String,
        result: PipelineResult<usize>,
    },
}

/// Handle on running workers.
pub struct FetchRun {
    pub events: mpsc::Receiver<StreamEvent>,
    workers: JoinSet<()>,
}

impl FetchRun {
    /// Abort every worker at its next suspension point.
    pub fn cancel(&mut self) {
        self.workers.abort_all();
        self.events.close();
    }
}

pub struct Fetcher {
    client: Arc<ApiClient>,
    api: GitHubApi,
    settings: FetchSettings,
}

impl Fetcher {
    pub fn new(client: ApiClient, api: GitHubApi, settings: FetchSettings) -> Self {
        if settings.concurrency != settings.worker_count() {
            warn!(
                "Concurrency {} out of range, using {}",
                settings.concurrency,
                settings.worker_count()
            );
        }
        Self {
            client: Arc::new(client),
            api,
            settings,
        }
    }

    pub fn settings(&self) -> &FetchSettings {
        &self.settings
    }

    pub fn client(&self) -> &ApiClient {
        &self.client
    }

    /// Repositories owned by `login`, most recently updated first.
    pub async fn list_subject_repos(&self, login: &str) -> PipelineResult<Vec<Repo>> {
        let url = self.api.user_repos(login, self.settings.page_size);
        let mut stream = PageStream::rest(login, PageSource::Repos, None, url, self.settings.max_pages);
        let mut repos = Vec::new();

        while repos.len() < self.settings.max_repos {
            let page = match stream.next_page(&self.client).await {
                Some(page) => page?,
                None => break,
            };
            let items = page.payload.as_array().cloned().unwrap_or_default();
            repos.extend(
                items
                    .iter()
                    .filter_map(|item| item.get("full_name").and_then(Value::as_str))
                    .filter_map(Repo::parse),
            );
        }

        repos.truncate(self.settings.max_repos);
        debug!("{} owns {} repositories (capped at {})", login, repos.len(), self.settings.max_repos);
        Ok(repos)
    }

    /// Upper-bound REST request count for `repos` repositories: the listing,
    /// then issues, commits and pulls per repository plus one reviews call
    /// per PR.
    pub fn estimate_rest_calls(&self, repos: usize) -> usize {
        1 + repos * (3 + self.settings.max_review_prs)
    }

    /// Resolve `auto` to a concrete transport.
    pub fn choose_mode(&self, requested: ApiMode, repos: usize) -> ApiMode {
        match requested {
            ApiMode::Rest | ApiMode::Batch => requested,
            ApiMode::Auto => {
                let estimate = self.estimate_rest_calls(repos);
                if self.client.has_token() && estimate > self.settings.batch_threshold {
                    info!(
                        "Estimated {} REST calls exceeds {}, using batch mode",
                        estimate, self.settings.batch_threshold
                    );
                    ApiMode::Batch
                } else {
                    ApiMode::Rest
                }
            }
        }
    }

    pub fn plan(&self, subject: &str, mode: ApiMode, repos: &[Repo]) -> Vec<StreamPlan> {
        match mode {
            ApiMode::Batch => vec![StreamPlan::search(subject)],
            ApiMode::Rest | ApiMode::Auto => repos.iter().cloned().map(StreamPlan::repository).collect(),
        }
    }

    /// Start one worker per plan, at most `worker_count` running at once.
    pub fn spawn(self: &Arc<Self>, plans: Vec<StreamPlan>, window: Window, subject: Option<String>) -> FetchRun {
        let (tx, rx) = mpsc::channel(64);
        let permits = Arc::new(Semaphore::new(self.settings.worker_count()));
        let mut workers = JoinSet::new();

        for plan in plans {
            let fetcher = Arc::clone(self);
            let permits = Arc::clone(&permits);
            let tx = tx.clone();
            let subject = subject.clone();

            workers.spawn(async move {
                // The semaphore is never closed, so a permit always arrives.
                let _permit = permits.acquire_owned().await.ok();
                let result = fetcher.run_stream(&plan, &window, subject.as_deref(), &tx).await;
                if let Err(ref e) = result {
                    warn!("Stream {} failed: {}", plan.id, e);
                }
                let _ = tx
                    .send(StreamEvent::Finished {
                        stream: plan.id,
                        result,
                    })
                    .await;
            });
        }

        FetchRun { events: rx, workers }
    }

    async fn run_stream(
        &self,
        plan: &StreamPlan,
        window: &Window,
        subject: Option<&str>,
        tx: &mpsc::Sender<StreamEvent>,
    ) -> PipelineResult<usize> {
        match plan.target {
            StreamTarget::Repository(ref repo) => self.run_repository(&plan.id, repo, window, subject, tx).await,
            StreamTarget::Search { ref login } => {
                let mut stream = PageStream::graph(
                    plan.id.clone(),
                    self.api.graphql_url.clone(),
                    GitHubApi::search_query(login, window),
                    self.settings.page_size,
                    self.settings.max_pages,
                );
                forward(&mut stream, &self.client, tx).await
            }
        }
    }

    /// Issues, commits, then reviews of recent pull requests, in that order.
    async fn run_repository(
        &self,
        id: &str,
        repo: &Repo,
        window: &Window,
        subject: Option<&str>,
        tx: &mpsc::Sender<StreamEvent>,
    ) -> PipelineResult<usize> {
        let per_page = self.settings.page_size;
        let max_pages = self.settings.max_pages;
        let mut pages = 0;

        let mut issues = PageStream::rest(
            id,
            PageSource::Issues,
            Some(repo.clone()),
            self.api.issues(repo, window, per_page),
            max_pages,
        );
        pages += forward(&mut issues, &self.client, tx).await?;

        let mut commits = PageStream::rest(
            id,
            PageSource::Commits,
            Some(repo.clone()),
            self.api.commits(repo, window, subject, per_page),
            max_pages,
        );
        match forward(&mut commits, &self.client, tx).await {
            Ok(n) => pages += n,
            // An empty repository answers 409 on its commit list.
            Err(PipelineError::Api { status: 409, .. }) => debug!("{} has no commits", repo),
            Err(e) => return Err(e),
        }

        for number in self.recent_pull_numbers(id, repo, window).await? {
            let mut reviews = PageStream::rest(
                id,
                PageSource::Reviews,
                Some(repo.clone()),
                self.api.reviews(repo, number, per_page),
                max_pages,
            );
            pages += forward(&mut reviews, &self.client, tx).await?;
        }

        Ok(pages)
    }

    /// Numbers of pull requests updated inside the window, newest first.
    async fn recent_pull_numbers(&self, id: &str, repo: &Repo, window: &Window) -> PipelineResult<Vec<u64>> {
        let cap = self.settings.max_review_prs;
        let mut numbers = Vec::new();
        if cap == 0 {
            return Ok(numbers);
        }

        let mut pulls = PageStream::rest(
            id,
            PageSource::Pulls,
            Some(repo.clone()),
            self.api.pulls(repo, self.settings.page_size),
            self.settings.max_pages,
        );
        'pages: while let Some(page) = pulls.next_page(&self.client).await {
            let page = page?;
            for pr in page.payload.as_array().map(Vec::as_slice).unwrap_or_default() {
                let updated = pr
                    .get("updated_at")
                    .and_then(Value::as_str)
                    .and_then(|s| s.parse::<chrono::DateTime<chrono::Utc>>().ok());
                if matches!(updated, Some(ts) if ts < window.since) {
                    break 'pages;
                }
                if let Some(number) = pr.get("number").and_then(Value::as_u64) {
                    numbers.push(number);
                    if numbers.len() >= cap {
                        break 'pages;
                    }
                }
            }
        }
        Ok(numbers)
    }

    /// All pages of a single repository, for one-off fetches.
    pub async fn fetch_repo_pages(self: &Arc<Self>, repo: Repo, window: Window) -> PipelineResult<Vec<RawPage>> {
        let mut run = self.spawn(vec![StreamPlan::repository(repo)], window, None);
        let mut pages = Vec::new();
        while let Some(event) = run.events.recv().await {
            match event {
                StreamEvent::Page(page) => pages.push(page),
                StreamEvent::Finished { result, .. } => {
                    result?;
                }
            }
        }
        Ok(pages)
    }
}

/// Drain `stream` into the channel. Stops quietly if the receiver is gone.
async fn forward(
    stream: &mut PageStream,
    client: &ApiClient,
    tx: &mpsc::Sender<StreamEvent>,
) -> PipelineResult<usize> {
    let mut sent = 0;
    while let Some(page) = stream.next_page(client).await {
        if tx.send(StreamEvent::Page(page?)).await.is_err() {
            break;
        }
        sent += 1;
    }
    Ok(sent)
}
