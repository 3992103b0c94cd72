//! Configuration file handling.
//!
//! This module handles loading `.fairscore.toml` and merging it with
//! command-line flags. Every field has a default, so a partial file works.

use crate::analysis::AnalysisOptions;
use crate::backoff::Backoff;
use crate::fetch::{FetchSettings, RequestPolicy};
use crate::limiter::BucketConfig;
use crate::models::{ApiMode, Provider};
use crate::rules::{RuleSource, OVERRIDE_FILE};
use crate::suggest::LlmSettings;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default config file name, looked up in the working directory.
pub const CONFIG_FILE: &str = ".fairscore.toml";

/// Root configuration structure.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub general: GeneralConfig,

    /// Provider access, pagination and retry.
    #[serde(default)]
    pub fetch: FetchConfig,

    #[serde(default)]
    pub scoring: ScoringConfig,

    /// Conditional-request cache.
    #[serde(default)]
    pub cache: CacheConfig,

    /// Rule suggestion model.
    #[serde(default)]
    pub llm: LlmConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeneralConfig {
    /// Output destination, `-` for stdout.
    #[serde(default = "default_output")]
    pub output: String,

    #[serde(default)]
    pub verbose: bool,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            output: default_output(),
            verbose: false,
        }
    }
}

fn default_output() -> String {
    "-".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FetchConfig {
    #[serde(default = "default_api_base_url")]
    pub api_base_url: String,

    #[serde(default = "default_graphql_url")]
    pub graphql_url: String,

    /// Concurrent fetch streams (1-20).
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,

    #[serde(default = "default_page_size")]
    pub page_size: u32,

    /// Pagination depth per endpoint.
    #[serde(default = "default_max_pages")]
    pub max_pages: u32,

    #[serde(default = "default_max_repos")]
    pub max_repos: usize,

    #[serde(default = "default_max_review_prs")]
    pub max_review_prs: usize,

    /// Estimated REST calls above which `auto` mode uses GraphQL.
    #[serde(default = "default_batch_threshold")]
    pub batch_threshold: usize,

    #[serde(default)]
    pub api_mode: ApiMode,

    /// Per-request timeout in seconds.
    #[serde(default = "default_request_timeout")]
    pub request_timeout: u64,

    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Total retry budget per request in seconds.
    #[serde(default = "default_max_elapsed")]
    pub max_elapsed: u64,

    #[serde(default = "default_backoff_base_ms")]
    pub backoff_base_ms: u64,

    #[serde(default = "default_backoff_max_ms")]
    pub backoff_max_ms: u64,

    /// Fail immediately instead of waiting when the local limiter denies.
    #[serde(default)]
    pub strict_rate_limit: bool,

    /// Seconds to wait for a limiter token.
    #[serde(default = "default_limiter_wait")]
    pub limiter_wait: u64,

    #[serde(default = "default_rate_capacity")]
    pub rate_capacity: u32,

    /// Tokens added per `rate_window` seconds.
    #[serde(default = "default_rate_refill")]
    pub rate_refill: u32,

    #[serde(default = "default_rate_window")]
    pub rate_window: u64,

    /// SQLite file shared between processes for rate limiting. Unset keeps
    /// the limiter in memory.
    #[serde(default)]
    pub rate_limit_store: Option<PathBuf>,

    /// Whole-run budget in seconds; unfinished streams are cancelled.
    #[serde(default = "default_run_timeout")]
    pub run_timeout: u64,
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            api_base_url: default_api_base_url(),
            graphql_url: default_graphql_url(),
            concurrency: default_concurrency(),
            page_size: default_page_size(),
            max_pages: default_max_pages(),
            max_repos: default_max_repos(),
            max_review_prs: default_max_review_prs(),
            batch_threshold: default_batch_threshold(),
            api_mode: ApiMode::default(),
            request_timeout: default_request_timeout(),
            max_attempts: default_max_attempts(),
            max_elapsed: default_max_elapsed(),
            backoff_base_ms: default_backoff_base_ms(),
            backoff_max_ms: default_backoff_max_ms(),
            strict_rate_limit: false,
            limiter_wait: default_limiter_wait(),
            rate_capacity: default_rate_capacity(),
            rate_refill: default_rate_refill(),
            rate_window: default_rate_window(),
            rate_limit_store: None,
            run_timeout: default_run_timeout(),
        }
    }
}

fn default_api_base_url() -> String {
    crate::fetch::github::DEFAULT_API_URL.to_string()
}

fn default_graphql_url() -> String {
    crate::fetch::github::DEFAULT_GRAPHQL_URL.to_string()
}

fn default_concurrency() -> usize {
    5
}

fn default_page_size() -> u32 {
    100
}

fn default_max_pages() -> u32 {
    10
}

fn default_max_repos() -> usize {
    20
}

fn default_max_review_prs() -> usize {
    20
}

fn default_batch_threshold() -> usize {
    400
}

fn default_request_timeout() -> u64 {
    30
}

fn default_max_attempts() -> u32 {
    5
}

fn default_max_elapsed() -> u64 {
    120
}

fn default_backoff_base_ms() -> u64 {
    1000
}

fn default_backoff_max_ms() -> u64 {
    10_000
}

fn default_limiter_wait() -> u64 {
    30
}

// Stays under the authenticated secondary limit of roughly 90 requests a minute.
fn default_rate_capacity() -> u32 {
    80
}

fn default_rate_refill() -> u32 {
    80
}

fn default_rate_window() -> u64 {
    60
}

fn default_run_timeout() -> u64 {
    600
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScoringConfig {
    /// Oldest allowed window start, in days before now.
    #[serde(default = "default_max_since_days")]
    pub max_since_days: u32,

    #[serde(default = "default_true")]
    pub exclude_bots: bool,

    /// Multiplier for activity in the subject's own repositories.
    #[serde(default = "default_self_repo_penalty")]
    pub self_repo_penalty: f64,

    /// `default`, a TOML file path, or inline TOML.
    #[serde(default)]
    pub rules_source: Option<String>,

    /// Ruleset used instead of the built-in default when the file exists.
    #[serde(default = "default_rules_override")]
    pub rules_override: PathBuf,
}

impl Default for ScoringConfig {
    fn default() -> Self {
        Self {
            max_since_days: default_max_since_days(),
            exclude_bots: true,
            self_repo_penalty: default_self_repo_penalty(),
            rules_source: None,
            rules_override: default_rules_override(),
        }
    }
}

fn default_max_since_days() -> u32 {
    180
}

fn default_true() -> bool {
    true
}

fn default_self_repo_penalty() -> f64 {
    0.8
}

fn default_rules_override() -> PathBuf {
    PathBuf::from(OVERRIDE_FILE)
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Cache file. Unset uses the user cache directory.
    #[serde(default)]
    pub path: Option<PathBuf>,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            path: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmConfig {
    /// `ollama`, or `none` to disable rule suggestion.
    #[serde(default = "default_llm_provider")]
    pub provider: String,

    #[serde(default = "default_llm_url")]
    pub url: String,

    #[serde(default = "default_llm_model")]
    pub model: String,

    #[serde(default = "default_temperature")]
    pub temperature: f32,

    /// Request timeout in seconds.
    #[serde(default = "default_llm_timeout")]
    pub timeout_seconds: u64,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            provider: default_llm_provider(),
            url: default_llm_url(),
            model: default_llm_model(),
            temperature: default_temperature(),
            timeout_seconds: default_llm_timeout(),
        }
    }
}

fn default_llm_provider() -> String {
    "none".to_string()
}

fn default_llm_url() -> String {
    "http://localhost:11434".to_string()
}

fn default_llm_model() -> String {
    "llama3.1:8b".to_string()
}

fn default_temperature() -> f32 {
    0.2
}

fn default_llm_timeout() -> u64 {
    120
}

impl Config {
    /// Load configuration from a file path.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let config: Config = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

        Ok(config)
    }

    /// Try to load configuration from the default location.
    ///
    /// Returns `Ok(None)` if the file doesn't exist, `Err` if it exists but can't be parsed.
    pub fn load_default() -> Result<Option<Self>> {
        let default_path = Path::new(CONFIG_FILE);

        if default_path.exists() {
            Ok(Some(Self::load(default_path)?))
        } else {
            Ok(None)
        }
    }

    /// Merge this configuration with CLI arguments.
    ///
    /// Only flags the user actually passed override file settings.
    pub fn merge_with_args(&mut self, args: &crate::cli::Args) {
        if let Some(concurrency) = args.concurrency {
            self.fetch.concurrency = concurrency;
        }
        if let Some(max_pages) = args.max_pages {
            self.fetch.max_pages = max_pages;
        }
        if let Some(mode) = args.api_mode {
            self.fetch.api_mode = mode.into();
        }
        if let Some(ref url) = args.api_url {
            self.fetch.api_base_url = url.clone();
        }
        if args.strict_rate_limit {
            self.fetch.strict_rate_limit = true;
        }
        if args.no_cache {
            self.cache.enabled = false;
        }
        if let Some(ref rules) = args.rules {
            self.scoring.rules_source = Some(rules.clone());
        }
        if args.include_bots {
            self.scoring.exclude_bots = false;
        }
        if let Some(penalty) = args.self_repo_penalty {
            self.scoring.self_repo_penalty = penalty;
        }
        if let Some(days) = args.max_since_days {
            self.scoring.max_since_days = days;
        }
        if let Some(ref output) = args.output {
            self.general.output = output.clone();
        }
        if args.verbose {
            self.general.verbose = true;
        }
    }

    /// Generate a default configuration file content.
    pub fn default_toml() -> String {
        let config = Config::default();
        toml::to_string_pretty(&config).unwrap_or_else(|_| String::new())
    }

    pub fn fetch_settings(&self) -> FetchSettings {
        FetchSettings {
            concurrency: self.fetch.concurrency,
            page_size: self.fetch.page_size.clamp(1, 100),
            max_pages: self.fetch.max_pages,
            max_repos: self.fetch.max_repos,
            max_review_prs: self.fetch.max_review_prs,
            batch_threshold: self.fetch.batch_threshold,
        }
    }

    pub fn request_policy(&self) -> RequestPolicy {
        RequestPolicy {
            backoff: Backoff {
                base: Duration::from_millis(self.fetch.backoff_base_ms),
                max_delay: Duration::from_millis(self.fetch.backoff_max_ms),
                max_attempts: self.fetch.max_attempts.max(1),
                max_elapsed: Duration::from_secs(self.fetch.max_elapsed),
            },
            strict_rate_limit: self.fetch.strict_rate_limit,
            limiter_wait: Duration::from_secs(self.fetch.limiter_wait),
        }
    }

    pub fn bucket_config(&self) -> BucketConfig {
        BucketConfig::new(
            f64::from(self.fetch.rate_capacity),
            f64::from(self.fetch.rate_refill),
            Duration::from_secs(self.fetch.rate_window.max(1)),
        )
    }

    pub fn rule_source(&self) -> RuleSource {
        self.scoring
            .rules_source
            .as_deref()
            .map(RuleSource::parse)
            .unwrap_or(RuleSource::Default)
    }

    pub fn analysis_options(&self) -> AnalysisOptions {
        AnalysisOptions {
            provider: Provider::GitHub,
            max_since_days: self.scoring.max_since_days,
            exclude_bots: self.scoring.exclude_bots,
            self_repo_penalty: self.scoring.self_repo_penalty,
            rules_source: self.rule_source(),
            rules_override: Some(self.scoring.rules_override.clone()),
            run_timeout: Duration::from_secs(self.fetch.run_timeout),
        }
    }

    pub fn llm_settings(&self) -> LlmSettings {
        LlmSettings {
            provider: self.llm.provider.clone(),
            url: self.llm.url.clone(),
            model: self.llm.model.clone(),
            temperature: self.llm.temperature,
            timeout: Duration::from_secs(self.llm.timeout_seconds),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cli::Args;
    use clap::Parser;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.general.output, "-");
        assert_eq!(config.fetch.concurrency, 5);
        assert_eq!(config.fetch.api_mode, ApiMode::Auto);
        assert_eq!(config.scoring.max_since_days, 180);
        assert!(config.scoring.exclude_bots);
        assert_eq!(config.scoring.self_repo_penalty, 0.8);
        assert_eq!(config.llm.provider, "none");
        assert_eq!(config.rule_source(), RuleSource::Default);
    }

    #[test]
    fn test_parse_partial_config() {
        let toml_content = r#"
[fetch]
concurrency = 12
api_mode = "batch"

[scoring]
self_repo_penalty = 0.5
rules_source = "team-rules.toml"

[llm]
provider = "ollama"
"#;

        let config: Config = toml::from_str(toml_content).unwrap();
        assert_eq!(config.fetch.concurrency, 12);
        assert_eq!(config.fetch.api_mode, ApiMode::Batch);
        assert_eq!(config.fetch.max_attempts, 5);
        assert_eq!(config.scoring.self_repo_penalty, 0.5);
        assert_eq!(config.rule_source(), RuleSource::Path(PathBuf::from("team-rules.toml")));
        assert!(config.cache.enabled);
        assert_eq!(config.llm_settings().provider, "ollama");
        assert_eq!(config.llm_settings().url, "http://localhost:11434");
    }

    #[test]
    fn test_default_toml_roundtrips() {
        let toml_str = Config::default_toml();
        assert!(toml_str.contains("[general]"));
        assert!(toml_str.contains("[fetch]"));
        assert!(toml_str.contains("[scoring]"));
        assert!(toml_str.contains("[llm]"));

        let parsed: Config = toml::from_str(&toml_str).unwrap();
        assert_eq!(parsed.fetch_settings(), Config::default().fetch_settings());
    }

    #[test]
    fn test_cli_flags_override_file() {
        let mut config: Config = toml::from_str("[fetch]\nconcurrency = 3\nmax_pages = 4\n").unwrap();
        let args = Args::parse_from([
            "fairscore",
            "--concurrency",
            "9",
            "--include-bots",
            "--no-cache",
            "analyze",
            "octo",
        ]);
        config.merge_with_args(&args);

        assert_eq!(config.fetch.concurrency, 9);
        assert_eq!(config.fetch.max_pages, 4);
        assert!(!config.scoring.exclude_bots);
        assert!(!config.cache.enabled);
    }

    #[test]
    fn test_derived_settings() {
        let config = Config::default();
        let policy = config.request_policy();
        assert_eq!(policy.backoff.max_attempts, 5);
        assert_eq!(policy.backoff.max_delay, Duration::from_secs(10));
        assert_eq!(config.analysis_options().run_timeout, Duration::from_secs(600));
        assert_eq!(
            config.analysis_options().rules_override,
            Some(PathBuf::from(OVERRIDE_FILE))
        );
    }
}
