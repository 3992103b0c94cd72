//! Report rendering.

pub mod generator;

pub use generator::{exit_code, generate_json_report, generate_leaderboard, generate_markdown_report, generate_scores_section};
