//! Command-line interface argument parsing.
//!
//! This module handles all CLI argument parsing using clap,
//! including validation and default values.

use crate::models::{parse_since, ApiMode};
use chrono::Utc;
use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// fairscore - fair, rule-based scoring of GitHub contributions
///
/// Fetches a user's activity, normalizes it into events and scores it
/// per dimension with bot exclusion and a self-repository penalty.
///
/// Examples:
///   fairscore analyze octocat --since 90d
///   fairscore analyze octocat --api-mode batch --format json -o report.json
///   fairscore fetch --repo rust-lang/rust --since 7d -o events.json
///   fairscore score --input events.json --rules team-rules.toml
///   fairscore save --dsn sqlite:///fairscore.db --input events.json
///   fairscore init-config
#[derive(Parser, Debug, Clone)]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Args {
    #[command(subcommand)]
    pub command: Command,

    /// Path to configuration file
    ///
    /// If not specified, looks for .fairscore.toml in the current directory
    #[arg(short, long, value_name = "FILE", global = true)]
    pub config: Option<PathBuf>,

    /// GitHub token for authenticated requests and batch mode
    #[arg(long, env = "GITHUB_TOKEN", hide_env_values = true, global = true)]
    pub token: Option<String>,

    /// Output destination (path, or - for stdout)
    #[arg(short, long, value_name = "FILE", global = true)]
    pub output: Option<String>,

    /// Output format (markdown, json)
    #[arg(long, default_value = "markdown", value_name = "FORMAT", global = true)]
    pub format: OutputFormat,

    /// Enable verbose logging output
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Run in quiet mode (minimal output)
    #[arg(short, long, global = true)]
    pub quiet: bool,

    /// Number of concurrent fetch streams (clamped to 1-20)
    #[arg(long, value_name = "NUM", global = true)]
    pub concurrency: Option<usize>,

    /// Pages fetched per endpoint before stopping
    #[arg(long, value_name = "NUM", global = true)]
    pub max_pages: Option<u32>,

    /// Transport used for analysis
    #[arg(long, value_name = "MODE", global = true)]
    pub api_mode: Option<ApiModeArg>,

    /// REST API base URL (for GitHub Enterprise or a proxy)
    #[arg(long, value_name = "URL", global = true)]
    pub api_url: Option<String>,

    /// Fail instead of waiting when the local rate limiter is exhausted
    #[arg(long, global = true)]
    pub strict_rate_limit: bool,

    /// Disable the conditional-request cache
    #[arg(long, global = true)]
    pub no_cache: bool,

    /// Ruleset: default, a TOML file path, or inline TOML
    #[arg(long, value_name = "RULES", global = true)]
    pub rules: Option<String>,

    /// Count activity from bot accounts
    #[arg(long, global = true)]
    pub include_bots: bool,

    /// Multiplier for activity in the subject's own repositories (0.0 - 1.0)
    #[arg(long, value_name = "FACTOR", global = true)]
    pub self_repo_penalty: Option<f64>,

    /// Oldest allowed window start, in days
    #[arg(long, value_name = "DAYS", global = true)]
    pub max_since_days: Option<u32>,
}

#[derive(Subcommand, Debug, Clone)]
pub enum Command {
    /// Fetch one repository's activity and print normalized events as JSON
    Fetch {
        /// Repository full name (owner/name)
        #[arg(long, value_name = "OWNER/NAME")]
        repo: String,

        /// Start of the window: 30d, 12h, 2026-01-31 or RFC 3339
        #[arg(long)]
        since: Option<String>,

        /// Provider id
        #[arg(long, default_value = "github")]
        provider: String,
    },

    /// Score a JSON list of events per actor
    Score {
        /// Events file, or - for stdin
        #[arg(short, long, default_value = "-")]
        input: String,

        /// Only score this actor
        #[arg(long)]
        subject: Option<String>,

        /// Start of the window (defaults to the earliest event)
        #[arg(long)]
        since: Option<String>,
    },

    /// Fetch, normalize and score one user's activity
    Analyze {
        /// GitHub login to analyze
        subject: String,

        /// Start of the window: 30d, 12h, 2026-01-31 or RFC 3339
        #[arg(long)]
        since: Option<String>,

        /// Also write the normalized events to this file
        #[arg(long, value_name = "FILE")]
        events_out: Option<PathBuf>,

        /// Also store events and scores in this database
        #[arg(long, value_name = "DSN")]
        save: Option<String>,
    },

    /// Store events or scores from a JSON file
    Save {
        /// sqlite:///path.db or sqlite:///:memory:
        #[arg(long)]
        dsn: String,

        /// JSON file, or - for stdin
        #[arg(short, long, default_value = "-")]
        input: String,

        /// What the input holds
        #[arg(long, default_value = "events")]
        kind: SaveKind,
    },

    /// Ask the configured LLM for a ruleset fitting an event sample
    SuggestRules {
        /// Events file, or - for stdin
        #[arg(short, long, default_value = "-")]
        input: String,
    },

    /// Generate a default .fairscore.toml configuration file
    InitConfig {
        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },
}

/// Output format for reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, clap::ValueEnum)]
pub enum OutputFormat {
    /// Markdown format (default)
    #[default]
    Markdown,
    /// JSON format
    Json,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum ApiModeArg {
    Rest,
    Batch,
    Auto,
}

impl From<ApiModeArg> for ApiMode {
    fn from(mode: ApiModeArg) -> Self {
        match mode {
            ApiModeArg::Rest => ApiMode::Rest,
            ApiModeArg::Batch => ApiMode::Batch,
            ApiModeArg::Auto => ApiMode::Auto,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum SaveKind {
    Events,
    Scores,
}

impl Args {
    /// Parse command-line arguments.
    pub fn parse_args() -> Self {
        Self::parse()
    }

    fn since(&self) -> Option<&str> {
        match self.command {
            Command::Fetch { ref since, .. } | Command::Score { ref since, .. } | Command::Analyze { ref since, .. } => {
                since.as_deref()
            }
            _ => None,
        }
    }

    /// Validate the parsed arguments.
    pub fn validate(&self) -> Result<(), String> {
        if self.verbose && self.quiet {
            return Err("Cannot use both --verbose and --quiet".to_string());
        }

        if let Some(since) = self.since() {
            parse_since(since, Utc::now())?;
        }

        if let Some(penalty) = self.self_repo_penalty {
            if !(0.0..=1.0).contains(&penalty) {
                return Err("Self-repository penalty must be between 0.0 and 1.0".to_string());
            }
        }

        if let Some(ref url) = self.api_url {
            if !url.starts_with("http://") && !url.starts_with("https://") {
                return Err("API URL must start with 'http://' or 'https://'".to_string());
            }
        }

        if self.max_pages == Some(0) {
            return Err("Max pages must be at least 1".to_string());
        }

        match self.command {
            Command::Fetch { ref repo, ref provider, .. } => {
                if crate::models::Repo::parse(repo).is_none() {
                    return Err(format!("Repository must look like owner/name, got '{}'", repo));
                }
                provider.parse::<crate::models::Provider>()?;
            }
            Command::Analyze { ref subject, .. } if subject.trim().is_empty() => {
                return Err("Subject login must not be empty".to_string());
            }
            Command::Save { ref dsn, .. } if dsn.trim().is_empty() => {
                return Err("DSN must not be empty".to_string());
            }
            _ => {}
        }

        Ok(())
    }

    /// Returns the log level based on verbosity settings.
    pub fn log_level(&self) -> tracing::Level {
        if self.quiet {
            tracing::Level::ERROR
        } else if self.verbose {
            tracing::Level::DEBUG
        } else {
            tracing::Level::INFO
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Args {
        Args::parse_from(std::iter::once("fairscore").chain(args.iter().copied()))
    }

    #[test]
    fn test_parse_analyze() {
        let args = parse(&["analyze", "octo", "--since", "90d", "--api-mode", "batch", "--format", "json"]);
        match args.command {
            Command::Analyze { ref subject, ref since, .. } => {
                assert_eq!(subject, "octo");
                assert_eq!(since.as_deref(), Some("90d"));
            }
            ref other => panic!("unexpected command: {:?}", other),
        }
        assert_eq!(args.api_mode, Some(ApiModeArg::Batch));
        assert_eq!(args.format, OutputFormat::Json);
        assert!(args.validate().is_ok());
    }

    #[test]
    fn test_validation_rejects_bad_since() {
        let args = parse(&["analyze", "octo", "--since", "last week"]);
        assert!(args.validate().is_err());
    }

    #[test]
    fn test_validation_accepts_huge_since() {
        let args = parse(&["analyze", "octo", "--since", "99999999999d", "--max-since-days", "4294967295"]);
        assert!(args.validate().is_ok());
    }

    #[test]
    fn test_validation_rejects_bad_repo() {
        let args = parse(&["fetch", "--repo", "not-a-repo"]);
        assert!(args.validate().is_err());

        let args = parse(&["fetch", "--repo", "octo/hello", "--provider", "gitlab"]);
        assert!(args.validate().is_err());
    }

    #[test]
    fn test_validation_penalty_range() {
        let args = parse(&["--self-repo-penalty", "1.5", "analyze", "octo"]);
        assert!(args.validate().is_err());
    }

    #[test]
    fn test_validation_conflicting_options() {
        let args = parse(&["-v", "-q", "init-config"]);
        assert!(args.validate().is_err());
    }

    #[test]
    fn test_save_kind() {
        let args = parse(&["save", "--dsn", "sqlite:///:memory:", "--kind", "scores"]);
        match args.command {
            Command::Save { kind, ref input, .. } => {
                assert_eq!(kind, SaveKind::Scores);
                assert_eq!(input, "-");
            }
            ref other => panic!("unexpected command: {:?}", other),
        }
    }

    #[test]
    fn test_log_level() {
        let mut args = parse(&["init-config"]);
        assert_eq!(args.log_level(), tracing::Level::INFO);

        args.verbose = true;
        assert_eq!(args.log_level(), tracing::Level::DEBUG);

        args.verbose = false;
        args.quiet = true;
        assert_eq!(args.log_level(), tracing::Level::ERROR);
    }
}
