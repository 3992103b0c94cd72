//! fairscore - rule-based scoring of GitHub contributions
//!
//! A CLI tool that fetches a user's public activity through the GitHub REST
//! or GraphQL API, normalizes it into contribution events and scores them
//! per dimension under a configurable ruleset.
//!
//! Exit codes:
//!   0 - Success
//!   1 - Runtime error (auth, configuration, every stream failed, etc.)
//!   2 - Partial result: some fetch streams failed

mod analysis;
mod backoff;
mod cache;
mod cli;
mod config;
mod error;
mod fetch;
mod limiter;
mod models;
mod normalizer;
mod report;
mod rules;
mod storage;
mod suggest;

use analysis::{aggregate, counts_by_kind, score_by_actor, Analyzer, ScorePolicy};
use anyhow::{Context, Result};
use cache::{CacheStore, MemoryCache, NoCache, SqliteCache};
use chrono::{DateTime, Utc};
use cli::{Args, Command, OutputFormat, SaveKind};
use config::{Config, CONFIG_FILE};
use error::PipelineError;
use fetch::{ApiClient, Fetcher, GitHubApi, HttpTransport};
use indicatif::{ProgressBar, ProgressStyle};
use limiter::{composite_key, token_identity, RateLimiter, SharedStoreLimiter, TokenBucketLimiter};
use models::{parse_since, ContributionEvent, Provider, Repo, Score, Window};
use std::io::Read;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};
use tracing_subscriber::FmtSubscriber;

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse_args();

    if let Err(e) = args.validate() {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }

    // Handle init-config early (no logging needed)
    if let Command::InitConfig { force } = args.command {
        return handle_init_config(force);
    }

    init_logging(&args);

    info!("fairscore v{}", env!("CARGO_PKG_VERSION"));
    debug!("Command: {:?}", args.command);

    match run(args).await {
        Ok(exit_code) => std::process::exit(exit_code),
        Err(e) => {
            error!("Run failed: {:#}", e);
            eprintln!("\n❌ Error: {:#}", e);
            std::process::exit(1);
        }
    }
}

/// Handle init-config: generate a default .fairscore.toml.
fn handle_init_config(force: bool) -> Result<()> {
    let path = Path::new(CONFIG_FILE);

    if path.exists() && !force {
        eprintln!(
            "⚠️  {} already exists. Remove it first or pass --force.",
            CONFIG_FILE
        );
        std::process::exit(1);
    }

    let content = Config::default_toml();
    std::fs::write(path, &content).with_context(|| format!("Failed to write {}", CONFIG_FILE))?;

    println!("✅ Created {} with default settings.", CONFIG_FILE);
    println!("   Edit it to tune concurrency, retries, scoring and the LLM provider.");
    Ok(())
}

/// Initialize logging based on verbosity settings.
fn init_logging(args: &Args) {
    let level = args.log_level();

    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_writer(std::io::stderr)
        .with_target(false)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .compact()
        .finish();

    if let Err(e) = tracing::subscriber::set_global_default(subscriber) {
        eprintln!("Failed to set tracing subscriber: {}", e);
    }
}

async fn run(args: Args) -> Result<i32> {
    let mut config = load_config(&args)?;
    config.merge_with_args(&args);

    match args.command.clone() {
        Command::Fetch { repo, since, provider } => run_fetch(&args, &config, &repo, since.as_deref(), &provider).await,
        Command::Score { input, subject, since } => run_score(&args, &config, &input, subject.as_deref(), since.as_deref()),
        Command::Analyze {
            subject,
            since,
            events_out,
            save,
        } => run_analyze(&args, &config, &subject, since.as_deref(), events_out.as_deref(), save.as_deref()).await,
        Command::Save { dsn, input, kind } => run_save(&dsn, &input, kind),
        Command::SuggestRules { input } => run_suggest(&config, &input).await,
        Command::InitConfig { force } => handle_init_config(force).map(|_| 0),
    }
}

/// Load configuration from file or use defaults.
fn load_config(args: &Args) -> Result<Config> {
    if let Some(ref config_path) = args.config {
        info!("Loading config from: {}", config_path.display());
        return Config::load(config_path);
    }

    match Config::load_default() {
        Ok(Some(config)) => {
            info!("Loaded default config from {}", CONFIG_FILE);
            Ok(config)
        }
        Ok(None) => {
            debug!("No config file found, using defaults");
            Ok(Config::default())
        }
        Err(e) => {
            warn!("Failed to load config: {:#}", e);
            Ok(Config::default())
        }
    }
}

fn build_cache(config: &Config) -> Arc<dyn CacheStore> {
    if !config.cache.enabled {
        debug!("HTTP cache disabled");
        return Arc::new(NoCache);
    }
    let Some(path) = config.cache.path.clone().or_else(SqliteCache::default_path) else {
        return Arc::new(MemoryCache::new());
    };
    match SqliteCache::open(&path) {
        Ok(cache) => Arc::new(cache),
        Err(e) => {
            warn!("Cache at {} unavailable ({}), using memory", path.display(), e);
            Arc::new(MemoryCache::new())
        }
    }
}

fn build_limiter(config: &Config) -> Result<Arc<dyn RateLimiter>> {
    let bucket = config.bucket_config();
    let limiter: Arc<dyn RateLimiter> = match config.fetch.rate_limit_store {
        Some(ref path) => Arc::new(
            SharedStoreLimiter::open(path, bucket)
                .with_context(|| format!("Failed to open rate limit store {}", path.display()))?,
        ),
        None => Arc::new(TokenBucketLimiter::new(bucket)),
    };
    Ok(limiter)
}

fn build_analyzer(args: &Args, config: &Config) -> Result<Analyzer> {
    let user_agent = format!("fairscore/{}", env!("CARGO_PKG_VERSION"));
    let transport = HttpTransport::new(Duration::from_secs(config.fetch.request_timeout), &user_agent)
        .context("Failed to build HTTP client")?;

    let token = args.token.clone();
    if token.is_none() {
        warn!("No GitHub token: requests are unauthenticated and batch mode is unavailable");
    }
    let identity = token.as_deref().filter(|t| !t.trim().is_empty()).map(token_identity);
    let limiter_key = composite_key(identity.as_deref(), None);

    let client = ApiClient::new(Arc::new(transport), build_limiter(config)?, build_cache(config), config.request_policy())
        .with_token(token)
        .with_limiter_key(limiter_key);
    let api = GitHubApi::new(&config.fetch.api_base_url, &config.fetch.graphql_url);
    let fetcher = Fetcher::new(client, api, config.fetch_settings());

    Ok(Analyzer::new(Arc::new(fetcher), config.analysis_options()))
}

fn spinner(args: &Args, message: String) -> Option<ProgressBar> {
    if args.quiet {
        return None;
    }
    let pb = ProgressBar::new_spinner();
    pb.set_style(
        ProgressStyle::default_spinner()
            .template("{spinner:.green} [{elapsed_precise}] {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_spinner()),
    );
    pb.set_message(message);
    pb.enable_steady_tick(Duration::from_millis(120));
    Some(pb)
}

fn since_arg(since: Option<&str>) -> Result<Option<DateTime<Utc>>> {
    since
        .map(|s| parse_since(s, Utc::now()).map_err(anyhow::Error::msg))
        .transpose()
}

/// Read a path, or stdin for `-`.
fn read_input(input: &str) -> Result<String> {
    if input == "-" {
        let mut buf = String::new();
        std::io::stdin().read_to_string(&mut buf).context("Failed to read stdin")?;
        return Ok(buf);
    }
    std::fs::read_to_string(input).with_context(|| format!("Failed to read {}", input))
}

fn read_events(input: &str) -> Result<Vec<ContributionEvent>> {
    let text = read_input(input)?;
    serde_json::from_str(&text).with_context(|| format!("{} is not a JSON list of events", input))
}

/// Write to a path, or stdout for `-`.
fn write_output(dest: &str, content: &str) -> Result<()> {
    if dest == "-" {
        println!("{}", content);
        return Ok(());
    }
    std::fs::write(dest, content).with_context(|| format!("Failed to write {}", dest))?;
    eprintln!("✅ Saved to {}", dest);
    Ok(())
}

async fn run_fetch(args: &Args, config: &Config, repo: &str, since: Option<&str>, provider: &str) -> Result<i32> {
    let provider: Provider = provider.parse().map_err(anyhow::Error::msg)?;
    let repo = Repo::parse(repo).with_context(|| format!("Invalid repository: {}", repo))?;
    let analyzer = build_analyzer(args, config)?;

    let pb = spinner(args, format!("Fetching {}...", repo));
    let fetched = analyzer.fetch(provider, repo, since_arg(since)?).await;
    if let Some(pb) = pb {
        pb.finish_and_clear();
    }
    let (events, skipped) = fetched?;

    info!("{} event(s), {} record(s) skipped", events.len(), skipped.total());
    write_output(&config.general.output, &serde_json::to_string_pretty(&events)?)?;
    Ok(0)
}

/// The window spanned by `events`, or the empty window at `now`.
fn events_window(events: &[ContributionEvent], now: DateTime<Utc>) -> Window {
    let since = events.iter().map(|e| e.timestamp).min().unwrap_or(now);
    let until = events.iter().map(|e| e.timestamp).max().unwrap_or(now);
    Window::new(since, until)
}

fn run_score(args: &Args, config: &Config, input: &str, subject: Option<&str>, since: Option<&str>) -> Result<i32> {
    let events = read_events(input)?;
    let now = Utc::now();
    let window = match since_arg(since)? {
        Some(since) => Window::clamped(Some(since), now, config.scoring.max_since_days),
        None => events_window(&events, now),
    };
    let (rules, origin) = rules::resolve(&config.rule_source(), Some(&config.scoring.rules_override))?;
    info!("Scoring {} event(s) over {} with {} rules", events.len(), window.label(), origin);

    let policy = ScorePolicy {
        exclude_bots: config.scoring.exclude_bots,
        self_repo_penalty: config.scoring.self_repo_penalty,
        window,
    };

    let output = match subject {
        Some(subject) => {
            let own: Vec<ContributionEvent> = events
                .into_iter()
                .filter(|e| e.actor.eq_ignore_ascii_case(subject))
                .collect();
            let scores = aggregate(subject, &own, &rules, &policy);
            match args.format {
                OutputFormat::Json => serde_json::to_string_pretty(&scores)?,
                OutputFormat::Markdown => report::generate_scores_section(&scores),
            }
        }
        None => {
            let by_actor = score_by_actor(&events, &rules, &policy);
            match args.format {
                OutputFormat::Json => serde_json::to_string_pretty(&by_actor)?,
                OutputFormat::Markdown => report::generate_leaderboard(&by_actor),
            }
        }
    };

    write_output(&config.general.output, &output)?;
    Ok(0)
}

async fn run_analyze(
    args: &Args,
    config: &Config,
    subject: &str,
    since: Option<&str>,
    events_out: Option<&Path>,
    save: Option<&str>,
) -> Result<i32> {
    let analyzer = build_analyzer(args, config)?;
    let since = since_arg(since)?;

    let pb = spinner(args, format!("Analyzing {}...", subject));
    let outcome = analyzer.analyze(subject, since, config.fetch.api_mode).await;
    if let Some(pb) = pb {
        pb.finish_and_clear();
    }

    let result = match outcome {
        Ok(result) => result,
        Err(PipelineError::AllStreamsFailed { summary }) => {
            eprintln!("\n❌ All {} fetch stream(s) failed:", summary.failures.len());
            for failure in &summary.failures {
                eprintln!("   - {}: {}", failure.stream, failure.error);
            }
            return Ok(report::exit_code(summary.status));
        }
        Err(e) => return Err(e.into()),
    };

    let rendered = match args.format {
        OutputFormat::Json => report::generate_json_report(&result)?,
        OutputFormat::Markdown => report::generate_markdown_report(&result),
    };
    write_output(&config.general.output, &rendered)?;

    if let Some(path) = events_out {
        std::fs::write(path, serde_json::to_string_pretty(&result.events)?)
            .with_context(|| format!("Failed to write events to {}", path.display()))?;
        info!("Wrote {} event(s) to {}", result.events.len(), path.display());
    }

    if let Some(dsn) = save {
        let mut backend = storage::open_backend(dsn)?;
        let events = backend.save_events(&result.events)?;
        let scores = backend.save_scores(&result.scores)?;
        backend.close()?;
        info!("Stored {} new event(s) and {} score(s)", events, scores);
    }

    let summary = &result.summary;
    if !args.quiet {
        eprintln!("\n📊 Analysis Summary:");
        eprintln!("   Status: {} {}", summary.status.emoji(), summary.status);
        eprintln!("   Window: {}", summary.window.label());
        eprintln!("   Events: {}", summary.total_events);
        for (dimension, value) in &summary.scores_by_dimension {
            eprintln!("   - {}: {:.2}", dimension, value);
        }
        if !summary.failures.is_empty() {
            eprintln!("   ⚠️  {} of {} stream(s) failed", summary.failures.len(), summary.streams_total);
        }
        eprintln!("   Duration: {:.1}s", summary.duration_seconds);
    }

    Ok(report::exit_code(summary.status))
}

/// Scores from either a bare list or a JSON analysis report.
fn parse_scores(text: &str) -> Result<Vec<Score>> {
    let value: serde_json::Value = serde_json::from_str(text).context("Input is not JSON")?;
    let list = match value {
        serde_json::Value::Object(mut map) => map.remove("scores").context("JSON object has no scores field")?,
        other => other,
    };
    serde_json::from_value(list).context("Input is not a list of scores")
}

fn run_save(dsn: &str, input: &str, kind: SaveKind) -> Result<i32> {
    let mut backend = storage::open_backend(dsn)?;
    let stored = match kind {
        SaveKind::Events => backend.save_events(&read_events(input)?)?,
        SaveKind::Scores => backend.save_scores(&parse_scores(&read_input(input)?)?)?,
    };
    backend.close()?;
    println!("✅ Stored {} {:?} record(s)", stored, kind);
    Ok(0)
}

async fn run_suggest(config: &Config, input: &str) -> Result<i32> {
    let events = read_events(input)?;
    let counts = counts_by_kind(&events);
    let text = suggest::suggest_rules(&counts, &config.llm_settings()).await?;
    write_output(&config.general.output, &text)?;
    Ok(0)
}
