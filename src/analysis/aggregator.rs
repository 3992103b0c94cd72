//! Score aggregation.
//!
//! Aggregation is a pure fold over events: the same events, ruleset and
//! policy always produce bit-identical scores, whatever order the events
//! arrived in.

use crate::models::{ContributionEvent, EventKind, Score, Window};
use crate::rules::RuleSet;
use chrono::NaiveDate;
use std::collections::BTreeMap;

/// Adjustments applied while scoring.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScorePolicy {
    pub exclude_bots: bool,
    /// Multiplier for events in the actor's own repository, in `[0, 1]`.
    pub self_repo_penalty: f64,
    pub window: Window,
}

impl ScorePolicy {
    pub fn new(window: Window) -> Self {
        Self {
            exclude_bots: true,
            self_repo_penalty: 0.8,
            window,
        }
    }

    /// The penalty clamped to `[0, 1]`; a non-finite value disables it.
    pub fn effective_penalty(&self) -> f64 {
        if self.self_repo_penalty.is_finite() {
            self.self_repo_penalty.clamp(0.0, 1.0)
        } else {
            1.0
        }
    }

    fn admits(&self, event: &ContributionEvent) -> bool {
        !(self.exclude_bots && event.is_bot) && self.window.contains(event.timestamp)
    }
}

/// Event counts per kind, split by self-repository flag.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
struct KindTally {
    plain: u64,
    own_repo: u64,
}

/// Drop events beyond the per-day cap for their (actor, kind, UTC day).
///
/// Within a group the earliest events are kept, ordered by timestamp and then
/// by id so the choice does not depend on input order.
fn clip<'a>(events: Vec<&'a ContributionEvent>, rules: &RuleSet) -> Vec<&'a ContributionEvent> {
    let caps = &rules.fairness.clip_per_user_day;
    if caps.is_empty() {
        return events;
    }

    let mut kept = Vec::with_capacity(events.len());
    let mut groups: BTreeMap<(String, EventKind, NaiveDate), Vec<&ContributionEvent>> = BTreeMap::new();
    for event in events {
        if caps.contains_key(&event.kind) {
            groups
                .entry((event.actor.to_lowercase(), event.kind, event.timestamp.date_naive()))
                .or_default()
                .push(event);
        } else {
            kept.push(event);
        }
    }

    for ((_, kind, _), mut group) in groups {
        let cap = caps.get(&kind).copied().unwrap_or(u32::MAX) as usize;
        group.sort_by(|a, b| {
            (a.timestamp, &a.id, &a.repo, a.is_self_repo).cmp(&(b.timestamp, &b.id, &b.repo, b.is_self_repo))
        });
        group.truncate(cap);
        kept.extend(group);
    }

    kept
}

fn tally(events: &[&ContributionEvent]) -> BTreeMap<EventKind, KindTally> {
    let mut counts: BTreeMap<EventKind, KindTally> = BTreeMap::new();
    for event in events {
        let entry = counts.entry(event.kind).or_default();
        if event.is_self_repo {
            entry.own_repo += 1;
        } else {
            entry.plain += 1;
        }
    }
    counts
}

/// Score `events` for `subject`: one score per ruleset dimension.
///
/// Each admitted event adds its kind's weight to every dimension that lists
/// the kind, multiplied by the self-repository penalty where it applies.
/// Dimensions nothing matched score 0.
pub fn aggregate(subject: &str, events: &[ContributionEvent], rules: &RuleSet, policy: &ScorePolicy) -> Vec<Score> {
    let admitted: Vec<&ContributionEvent> = events.iter().filter(|e| policy.admits(e)).collect();
    let counts = tally(&clip(admitted, rules));
    let penalty = policy.effective_penalty();

    rules
        .dimensions
        .iter()
        .map(|(name, dim)| {
            let value = counts
                .iter()
                .filter_map(|(kind, t)| {
                    dim.weight_for(*kind)
                        .map(|w| w * t.plain as f64 + w * penalty * t.own_repo as f64)
                })
                .sum();
            Score {
                subject: subject.to_string(),
                dimension: name.clone(),
                window: policy.window,
                value,
                computed_at: policy.window.until,
            }
        })
        .collect()
}

/// Aggregate separately for every actor in `events`.
pub fn score_by_actor(
    events: &[ContributionEvent],
    rules: &RuleSet,
    policy: &ScorePolicy,
) -> BTreeMap<String, Vec<Score>> {
    let mut by_actor: BTreeMap<String, Vec<ContributionEvent>> = BTreeMap::new();
    for event in events {
        by_actor.entry(event.actor.clone()).or_default().push(event.clone());
    }
    by_actor
        .into_iter()
        .map(|(actor, events)| {
            let scores = aggregate(&actor, &events, rules, policy);
            (actor, scores)
        })
        .collect()
}

/// Number of events per kind. Every kind is present.
pub fn counts_by_kind(events: &[ContributionEvent]) -> BTreeMap<EventKind, usize> {
    let mut counts: BTreeMap<EventKind, usize> = EventKind::ALL.iter().map(|k| (*k, 0)).collect();
    for event in events {
        *counts.entry(event.kind).or_default() += 1;
    }
    counts
}

/// Score values keyed by dimension.
pub fn scores_by_dimension(scores: &[Score]) -> BTreeMap<String, f64> {
    scores.iter().map(|s| (s.dimension.clone(), s.value)).collect()
}
