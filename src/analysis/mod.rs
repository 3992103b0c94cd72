//! Scoring and run orchestration.

pub mod aggregator;
pub mod orchestrator;

pub use aggregator::{aggregate, counts_by_kind, score_by_actor, scores_by_dimension, ScorePolicy};
pub use orchestrator::{AnalysisOptions, Analyzer};
