//! Rate-limited, cached, retrying request execution.

use super::github::{parse_link_next, retry_hint};
use super::transport::{ApiRequest, ApiResponse, Method, Transport};
use crate::backoff::Backoff;
use crate::cache::{CacheEntry, CacheStore, Validator};
use crate::error::{PipelineError, PipelineResult};
use crate::limiter::{acquire_blocking, composite_key, try_acquire_async, RateLimiter};
use crate::storage::off_runtime;
use chrono::Utc;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, warn};

/// How a request reacts to limits and failures.
#[derive(Debug, Clone, Copy)]
pub struct RequestPolicy {
    pub backoff: Backoff,
    /// Fail immediately when the local limiter denies instead of waiting.
    pub strict_rate_limit: bool,
    /// Longest wait for a local limiter token.
    pub limiter_wait: Duration,
}

impl Default for RequestPolicy {
    fn default() -> Self {
        Self {
            backoff: Backoff::default(),
            strict_rate_limit: false,
            limiter_wait: Duration::from_secs(30),
        }
    }
}

/// A decoded response body.
#[derive(Debug, Clone, PartialEq)]
pub struct Fetched {
    pub body: Value,
    /// `rel="next"` link, for REST pagination.
    pub next_link: Option<String>,
    /// Served from the cache after a 304.
    pub from_cache: bool,
}

/// Why an attempt should be retried.
enum Retry {
    Throttled(String),
    Transient(String),
}

/// Executes requests against the provider API.
pub struct ApiClient {
    transport: Arc<dyn Transport>,
    limiter: Arc<dyn RateLimiter>,
    cache: Arc<dyn CacheStore>,
    token: Option<String>,
    limiter_key: String,
    policy: RequestPolicy,
}

impl ApiClient {
    pub fn new(
        transport: Arc<dyn Transport>,
        limiter: Arc<dyn RateLimiter>,
        cache: Arc<dyn CacheStore>,
        policy: RequestPolicy,
    ) -> Self {
        Self {
            transport,
            limiter,
            cache,
            token: None,
            limiter_key: composite_key(None, None),
            policy,
        }
    }

    pub fn with_token(mut self, token: Option<String>) -> Self {
        self.token = token.filter(|t| !t.trim().is_empty());
        self
    }

    pub fn with_limiter_key(mut self, key: impl Into<String>) -> Self {
        self.limiter_key = key.into();
        self
    }

    pub fn has_token(&self) -> bool {
        self.token.is_some()
    }

    /// Take a limiter token, waiting unless the policy is strict.
    async fn admit(&self) -> PipelineResult<()> {
        if try_acquire_async(&self.limiter, &self.limiter_key).await {
            return Ok(());
        }
        if self.policy.strict_rate_limit {
            return Err(PipelineError::RateLimitExceeded {
                key: self.limiter_key.clone(),
                detail: "local request budget exhausted".to_string(),
            });
        }

        debug!("Waiting for limiter token ({})", self.limiter_key);
        if acquire_blocking(&self.limiter, &self.limiter_key, self.policy.limiter_wait).await {
            Ok(())
        } else {
            Err(PipelineError::RateLimitExceeded {
                key: self.limiter_key.clone(),
                detail: format!(
                    "no token within {}s",
                    self.policy.limiter_wait.as_secs_f64()
                ),
            })
        }
    }

    async fn cache_get(&self, key: &str) -> Option<CacheEntry> {
        if !self.cache.blocking_io() {
            return self.cache.get(key);
        }
        let cache = Arc::clone(&self.cache);
        let key = key.to_string();
        off_runtime(move || cache.get(&key)).await.flatten()
    }

    async fn cache_put(&self, key: &str, entry: CacheEntry) {
        if !self.cache.blocking_io() {
            return self.cache.put(key, entry);
        }
        let cache = Arc::clone(&self.cache);
        let key = key.to_string();
        off_runtime(move || cache.put(&key, entry)).await;
    }

    async fn cache_touch(&self, key: &str) {
        let now = Utc::now();
        if !self.cache.blocking_io() {
            return self.cache.touch(key, now);
        }
        let cache = Arc::clone(&self.cache);
        let key = key.to_string();
        off_runtime(move || cache.touch(&key, now)).await;
    }

    fn decode(&self, url: &str, body: &str) -> PipelineResult<Value> {
        serde_json::from_str(body).map_err(|e| PipelineError::Decode {
            url: url.to_string(),
            detail: e.to_string(),
        })
    }

    /// Send `request` and return its decoded body.
    ///
    /// Conditional headers are attached from the cache; a 304 returns the
    /// stored payload unchanged. Throttling (429/403), 5xx and transport
    /// failures are retried with backoff.
    pub async fn execute(&self, request: ApiRequest) -> PipelineResult<Fetched> {
        let started = Instant::now();
        let backoff = self.policy.backoff;
        let cache_key = request.cache_key();
        let cached = match cache_key.as_deref() {
            Some(key) => self.cache_get(key).await,
            None => None,
        };

        let mut request = request.header("Accept", "application/vnd.github+json");
        if let Some(ref token) = self.token {
            request = request.header("Authorization", format!("Bearer {}", token));
        }
        if let Some(ref entry) = cached {
            for (name, value) in entry.validator.request_headers() {
                request = request.header(name, value);
            }
        }

        let mut attempt: u32 = 0;
        loop {
            self.admit().await?;
            attempt += 1;

            let (retry, hint) = match self.transport.send(&request).await {
                Ok(response) => match response.status {
                    304 => {
                        if let (Some(key), Some(entry)) = (cache_key.as_deref(), cached.as_ref()) {
                            debug!("304 for {}, using cached payload", request.url);
                            self.cache_touch(key).await;
                            return Ok(Fetched {
                                body: self.decode(&request.url, &entry.payload)?,
                                next_link: parse_link_next(response.header("link"))
                                    .or_else(|| entry.next_link.clone()),
                                from_cache: true,
                            });
                        }
                        return Err(PipelineError::Api {
                            status: 304,
                            url: request.url.clone(),
                        });
                    }
                    200..=299 => return self.accept(&request, cache_key.as_deref(), response).await,
                    401 => {
                        return Err(PipelineError::Auth(format!(
                            "{} rejected the credential (HTTP 401)",
                            request.url
                        )))
                    }
                    403 | 429 => (
                        Retry::Throttled(format!("HTTP {}", response.status)),
                        retry_hint(&response, Utc::now()),
                    ),
                    500..=599 => (Retry::Transient(format!("HTTP {}", response.status)), None),
                    status => {
                        return Err(PipelineError::Api {
                            status,
                            url: request.url.clone(),
                        })
                    }
                },
                Err(e) => (Retry::Transient(e.to_string()), None),
            };

            let delay = backoff.delay_for(attempt - 1, hint);
            if attempt >= backoff.max_attempts || !backoff.allows(started.elapsed(), delay) {
                return Err(self.exhausted(retry, attempt));
            }

            let reason = match retry {
                Retry::Throttled(ref d) | Retry::Transient(ref d) => d.as_str(),
            };
            warn!(
                "{} for {} (attempt {}/{}), retrying in {:.1}s",
                reason,
                request.url,
                attempt,
                backoff.max_attempts,
                delay.as_secs_f64()
            );
            tokio::time::sleep(delay).await;
        }
    }

    async fn accept(
        &self,
        request: &ApiRequest,
        cache_key: Option<&str>,
        response: ApiResponse,
    ) -> PipelineResult<Fetched> {
        let body = self.decode(&request.url, &response.body)?;
        let next_link = parse_link_next(response.header("link"));

        if let Some(key) = cache_key {
            let validator = Validator::from_response(&response);
            if request.method == Method::Get && !validator.is_empty() {
                self.cache_put(
                    key,
                    CacheEntry {
                        validator,
                        payload: response.body.clone(),
                        next_link: next_link.clone(),
                        fetched_at: Utc::now(),
                    },
                )
                .await;
            }
        }

        Ok(Fetched {
            body,
            next_link,
            from_cache: false,
        })
    }

    fn exhausted(&self, retry: Retry, attempts: u32) -> PipelineError {
        match retry {
            Retry::Throttled(detail) => PipelineError::RateLimitExceeded {
                key: self.limiter_key.clone(),
                detail: format!("provider kept throttling after {} attempt(s): {}", attempts, detail),
            },
            Retry::Transient(detail) => PipelineError::TransientNetwork { attempts, detail },
        }
    }
}
