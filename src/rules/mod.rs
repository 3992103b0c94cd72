//! Scoring rulesets: loading, validation and TOML serialization.
//!
//! A ruleset maps dimension names to the event kinds they count and the
//! weight of each kind, plus optional per-day fairness caps.
//!
//! ```toml
//! [dimensions.code]
//! kinds = ["pr", "commit"]
//! weight = 1.0
//! weights_by_kind = { commit = 0.8 }
//!
//! [fairness.clip_per_user_day]
//! commit = 20
//! ```

use crate::error::ValidationError;
use crate::models::EventKind;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// File name picked up as a ruleset override when present.
pub const OVERRIDE_FILE: &str = ".fairscore-rules.toml";

/// One scoring dimension.
#[derive(Debug, Clone, PartialEq)]
pub struct Dimension {
    pub kinds: BTreeSet<EventKind>,
    pub weight: f64,
    /// Per-kind weights that replace `weight` for that kind.
    pub weights_by_kind: BTreeMap<EventKind, f64>,
}

impl Dimension {
    pub fn new(kinds: impl IntoIterator<Item = EventKind>, weight: f64) -> Self {
        Self {
            kinds: kinds.into_iter().collect(),
            weight,
            weights_by_kind: BTreeMap::new(),
        }
    }

    pub fn with_kind_weight(mut self, kind: EventKind, weight: f64) -> Self {
        self.weights_by_kind.insert(kind, weight);
        self
    }

    /// Effective weight of `kind`, or `None` if this dimension does not count it.
    pub fn weight_for(&self, kind: EventKind) -> Option<f64> {
        if !self.kinds.contains(&kind) {
            return None;
        }
        Some(self.weights_by_kind.get(&kind).copied().unwrap_or(self.weight))
    }
}

/// Daily per-actor caps by event kind. Kinds without a cap are unlimited.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Fairness {
    pub clip_per_user_day: BTreeMap<EventKind, u32>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RuleSet {
    pub dimensions: BTreeMap<String, Dimension>,
    pub fairness: Fairness,
}

impl RuleSet {
    pub fn dimension_names(&self) -> impl Iterator<Item = &str> {
        self.dimensions.keys().map(String::as_str)
    }
}

/// Where a ruleset comes from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RuleSource {
    /// The built-in ruleset (`default` or `auto`).
    Default,
    Path(PathBuf),
    /// Inline TOML text.
    Text(String),
}

impl RuleSource {
    pub fn parse(value: &str) -> Self {
        let trimmed = value.trim();
        match trimmed.to_lowercase().as_str() {
            "" | "default" | "auto" => RuleSource::Default,
            _ if trimmed.contains('\n') || trimmed.starts_with('[') => RuleSource::Text(value.to_string()),
            _ => RuleSource::Path(PathBuf::from(trimmed)),
        }
    }
}

impl fmt::Display for RuleSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RuleSource::Default => write!(f, "default"),
            RuleSource::Path(path) => write!(f, "{}", path.display()),
            RuleSource::Text(_) => write!(f, "inline"),
        }
    }
}

/// The built-in ruleset.
pub fn default_rules() -> RuleSet {
    let mut dimensions = BTreeMap::new();
    dimensions.insert(
        "code".to_string(),
        Dimension::new([EventKind::Pr, EventKind::Commit], 1.0).with_kind_weight(EventKind::Commit, 0.8),
    );
    dimensions.insert("review".to_string(), Dimension::new([EventKind::Review], 0.6));
    dimensions.insert("community".to_string(), Dimension::new([EventKind::Issue], 0.3));

    let clip_per_user_day = [
        (EventKind::Commit, 20),
        (EventKind::Pr, 5),
        (EventKind::Review, 50),
        (EventKind::Issue, 10),
    ]
    .into_iter()
    .collect();

    RuleSet {
        dimensions,
        fairness: Fairness { clip_per_user_day },
    }
}

/// Load and validate a ruleset.
pub fn load(source: &RuleSource) -> Result<RuleSet, ValidationError> {
    match source {
        RuleSource::Default => Ok(default_rules()),
        RuleSource::Path(path) => {
            debug!("Loading ruleset from {}", path.display());
            let text = std::fs::read_to_string(path).map_err(|e| ValidationError::Unreadable {
                path: path.display().to_string(),
                detail: e.to_string(),
            })?;
            parse_toml(&text)
        }
        RuleSource::Text(text) => parse_toml(text),
    }
}

/// Pick the ruleset for a run.
///
/// A default/auto request uses the override file when one exists; any
/// explicit source is loaded as given. Returns the ruleset and its origin.
pub fn resolve(requested: &RuleSource, override_path: Option<&Path>) -> Result<(RuleSet, String), ValidationError> {
    if *requested == RuleSource::Default {
        if let Some(path) = override_path.filter(|p| p.exists()) {
            info!("Using ruleset override {}", path.display());
            let source = RuleSource::Path(path.to_path_buf());
            return Ok((load(&source)?, source.to_string()));
        }
    }
    Ok((load(requested)?, requested.to_string()))
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawRuleSet {
    #[serde(default)]
    dimensions: BTreeMap<String, RawDimension>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    fairness: Option<RawFairness>,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawDimension {
    kinds: Vec<String>,
    #[serde(default = "default_weight")]
    weight: f64,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    weights_by_kind: BTreeMap<String, f64>,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawFairness {
    #[serde(default)]
    clip_per_user_day: BTreeMap<String, u32>,
}

fn default_weight() -> f64 {
    1.0
}

fn parse_kind(location: &str, kind: &str) -> Result<EventKind, ValidationError> {
    kind.parse().map_err(|_| ValidationError::UnknownKind {
        location: location.to_string(),
        kind: kind.to_string(),
    })
}

/// Parse and validate ruleset TOML.
pub fn parse_toml(text: &str) -> Result<RuleSet, ValidationError> {
    let raw: RawRuleSet = toml::from_str(text).map_err(|e| ValidationError::Malformed(e.message().to_string()))?;

    let mut dimensions = BTreeMap::new();
    for (name, dim) in raw.dimensions {
        let location = format!("dimensions.{}", name);
        let kinds = dim
            .kinds
            .iter()
            .map(|k| parse_kind(&location, k))
            .collect::<Result<BTreeSet<_>, _>>()?;
        let weights_by_kind = dim
            .weights_by_kind
            .iter()
            .map(|(k, w)| Ok((parse_kind(&format!("{}.weights_by_kind", location), k)?, *w)))
            .collect::<Result<BTreeMap<_, _>, ValidationError>>()?;
        dimensions.insert(
            name,
            Dimension {
                kinds,
                weight: dim.weight,
                weights_by_kind,
            },
        );
    }

    let clip_per_user_day = raw
        .fairness
        .map(|f| f.clip_per_user_day)
        .unwrap_or_default()
        .iter()
        .map(|(k, cap)| Ok((parse_kind("fairness.clip_per_user_day", k)?, *cap)))
        .collect::<Result<BTreeMap<_, _>, ValidationError>>()?;

    let rules = RuleSet {
        dimensions,
        fairness: Fairness { clip_per_user_day },
    };
    validate(&rules)?;
    Ok(rules)
}

fn check_weight(location: String, value: f64) -> Result<(), ValidationError> {
    if value.is_finite() && value >= 0.0 {
        Ok(())
    } else {
        Err(ValidationError::InvalidWeight { location, value })
    }
}

/// Reject rulesets whose attribution would be ambiguous or undefined.
pub fn validate(rules: &RuleSet) -> Result<(), ValidationError> {
    if rules.dimensions.is_empty() {
        return Err(ValidationError::NoDimensions);
    }

    let mut seen_names: HashMap<String, &str> = HashMap::new();
    let mut first_weight: BTreeMap<EventKind, (&str, f64)> = BTreeMap::new();

    for (name, dim) in &rules.dimensions {
        if seen_names.insert(name.to_lowercase(), name).is_some() {
            return Err(ValidationError::DuplicateDimension(name.clone()));
        }
        if dim.kinds.is_empty() {
            return Err(ValidationError::EmptyDimension(name.clone()));
        }
        check_weight(format!("dimensions.{}", name), dim.weight)?;

        for (kind, weight) in &dim.weights_by_kind {
            if !dim.kinds.contains(kind) {
                return Err(ValidationError::OrphanKindWeight {
                    dimension: name.clone(),
                    kind: kind.to_string(),
                });
            }
            check_weight(format!("dimensions.{}.weights_by_kind.{}", name, kind), *weight)?;
        }

        for kind in &dim.kinds {
            let weight = dim.weight_for(*kind).unwrap_or(dim.weight);
            match first_weight.get(kind) {
                Some(&(first_dimension, first)) if first != weight => {
                    return Err(ValidationError::ConflictingWeight {
                        kind: kind.to_string(),
                        first_dimension: first_dimension.to_string(),
                        first,
                        second_dimension: name.clone(),
                        second: weight,
                    });
                }
                Some(_) => {}
                None => {
                    first_weight.insert(*kind, (name.as_str(), weight));
                }
            }
        }
    }

    Ok(())
}

/// Serialize a ruleset to the TOML text format.
pub fn to_toml(rules: &RuleSet) -> Result<String, ValidationError> {
    let dimensions = rules
        .dimensions
        .iter()
        .map(|(name, dim)| {
            let raw = RawDimension {
                kinds: dim.kinds.iter().map(|k| k.to_string()).collect(),
                weight: dim.weight,
                weights_by_kind: dim
                    .weights_by_kind
                    .iter()
                    .map(|(k, w)| (k.to_string(), *w))
                    .collect(),
            };
            (name.clone(), raw)
        })
        .collect();

    let clip = &rules.fairness.clip_per_user_day;
    let fairness = (!clip.is_empty()).then(|| RawFairness {
        clip_per_user_day: clip.iter().map(|(k, c)| (k.to_string(), *c)).collect(),
    });

    toml::to_string_pretty(&RawRuleSet { dimensions, fairness })
        .map_err(|e| ValidationError::Malformed(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
[dimensions.code]
kinds = ["pr", "commit"]
weight = 1.0
weights_by_kind = { commit = 0.8 }

[dimensions.community]
kinds = ["issue"]
weight = 0.5

[fairness.clip_per_user_day]
commit = 20
pr = 5
"#;

    #[test]
    fn test_parse_sample() {
        let rules = parse_toml(SAMPLE).unwrap();
        assert_eq!(rules.dimensions.len(), 2);
        let code = &rules.dimensions["code"];
        assert_eq!(code.weight_for(EventKind::Pr), Some(1.0));
        assert_eq!(code.weight_for(EventKind::Commit), Some(0.8));
        assert_eq!(code.weight_for(EventKind::Issue), None);
        assert_eq!(rules.fairness.clip_per_user_day[&EventKind::Pr], 5);
    }

    #[test]
    fn test_roundtrip_is_lossless() {
        let rules = parse_toml(SAMPLE).unwrap();
        let text = to_toml(&rules).unwrap();
        assert_eq!(parse_toml(&text).unwrap(), rules);

        let defaults = default_rules();
        assert_eq!(parse_toml(&to_toml(&defaults).unwrap()).unwrap(), defaults);
    }

    #[test]
    fn test_missing_fairness_means_no_caps() {
        let rules = parse_toml("[dimensions.code]\nkinds = [\"pr\"]\n").unwrap();
        assert!(rules.fairness.clip_per_user_day.is_empty());
        assert_eq!(rules.dimensions["code"].weight, 1.0);
        assert!(!to_toml(&rules).unwrap().contains("fairness"));
    }

    #[test]
    fn test_integer_weights_accepted() {
        let rules = parse_toml("[dimensions.code]\nkinds = [\"pr\"]\nweight = 2\n").unwrap();
        assert_eq!(rules.dimensions["code"].weight, 2.0);
    }

    #[test]
    fn test_rejects_unknown_kind() {
        let err = parse_toml("[dimensions.code]\nkinds = [\"star\"]\n").unwrap_err();
        assert!(matches!(err, ValidationError::UnknownKind { ref kind, .. } if kind == "star"));

        let err = parse_toml("[dimensions.code]\nkinds = [\"pr\"]\n[fairness.clip_per_user_day]\nfork = 1\n").unwrap_err();
        assert!(matches!(err, ValidationError::UnknownKind { .. }));
    }

    #[test]
    fn test_rejects_bad_weights() {
        let err = parse_toml("[dimensions.code]\nkinds = [\"pr\"]\nweight = -1.0\n").unwrap_err();
        assert!(matches!(err, ValidationError::InvalidWeight { .. }));

        let err = parse_toml("[dimensions.code]\nkinds = [\"pr\"]\nweight = nan\n").unwrap_err();
        assert!(matches!(err, ValidationError::InvalidWeight { .. }));

        let err = parse_toml("[dimensions.code]\nkinds = [\"pr\"]\nweight = inf\n").unwrap_err();
        assert!(matches!(err, ValidationError::InvalidWeight { .. }));
    }

    #[test]
    fn test_rejects_conflicting_weights() {
        let text = r#"
[dimensions.code]
kinds = ["pr"]
weight = 1.0

[dimensions.delivery]
kinds = ["pr"]
weight = 2.0
"#;
        let err = parse_toml(text).unwrap_err();
        assert!(matches!(err, ValidationError::ConflictingWeight { ref kind, .. } if kind == "pr"));

        let overlap = r#"
[dimensions.code]
kinds = ["pr"]
weight = 1.0

[dimensions.delivery]
kinds = ["pr", "issue"]
weight = 0.5
weights_by_kind = { pr = 1.0 }
"#;
        assert!(parse_toml(overlap).is_ok());
    }

    #[test]
    fn test_rejects_duplicate_and_empty_dimensions() {
        let text = "[dimensions.Code]\nkinds = [\"pr\"]\n[dimensions.code]\nkinds = [\"pr\"]\n";
        assert!(matches!(
            parse_toml(text).unwrap_err(),
            ValidationError::DuplicateDimension(_)
        ));

        let empty = "[dimensions.code]\nkinds = []\n";
        assert_eq!(
            parse_toml(empty).unwrap_err(),
            ValidationError::EmptyDimension("code".to_string())
        );
        assert_eq!(parse_toml("").unwrap_err(), ValidationError::NoDimensions);
    }

    #[test]
    fn test_rejects_orphan_override_and_unknown_fields() {
        let orphan = "[dimensions.code]\nkinds = [\"pr\"]\nweights_by_kind = { commit = 0.5 }\n";
        assert!(matches!(
            parse_toml(orphan).unwrap_err(),
            ValidationError::OrphanKindWeight { .. }
        ));

        let typo = "[dimensions.code]\nkinds = [\"pr\"]\nweigth = 2.0\n";
        assert!(matches!(parse_toml(typo).unwrap_err(), ValidationError::Malformed(_)));
    }

    #[test]
    fn test_rule_source_parse() {
        assert_eq!(RuleSource::parse("auto"), RuleSource::Default);
        assert_eq!(RuleSource::parse("DEFAULT"), RuleSource::Default);
        assert_eq!(
            RuleSource::parse("rules/team.toml"),
            RuleSource::Path(PathBuf::from("rules/team.toml"))
        );
        assert!(matches!(RuleSource::parse(SAMPLE), RuleSource::Text(_)));
    }

    #[test]
    fn test_resolve_prefers_override_for_default() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(OVERRIDE_FILE);
        std::fs::write(&path, SAMPLE).unwrap();

        let (rules, origin) = resolve(&RuleSource::Default, Some(&path)).unwrap();
        assert!(rules.dimensions.contains_key("community"));
        assert_eq!(origin, path.display().to_string());

        let (rules, origin) = resolve(&RuleSource::Default, Some(&dir.path().join("missing.toml"))).unwrap();
        assert_eq!(rules, default_rules());
        assert_eq!(origin, "default");

        let inline = RuleSource::Text("[dimensions.x]\nkinds = [\"review\"]\n".to_string());
        let (rules, origin) = resolve(&inline, Some(&path)).unwrap();
        assert!(rules.dimensions.contains_key("x"));
        assert_eq!(origin, "inline");
    }

    #[test]
    fn test_unreadable_path() {
        let err = load(&RuleSource::Path(PathBuf::from("/definitely/not/here.toml"))).unwrap_err();
        assert!(matches!(err, ValidationError::Unreadable { .. }));
    }
}
