//! Schema-matching data model
//!
//! Candidates are produced by the server and only ever re-statused; the client
//! never edits scores locally. Ground truth is derived from the accepted
//! candidates every time it is needed and is never stored.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};

/// Curator decision on a candidate
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum CandidateStatus {
    #[default]
    Idle,
    Accepted,
    Rejected,
    Discarded,
}

impl CandidateStatus {
    /// Precedence used when matchers disagree in the aggregated view
    fn precedence(&self) -> u8 {
        match self {
            CandidateStatus::Accepted => 3,
            CandidateStatus::Rejected => 2,
            CandidateStatus::Discarded => 1,
            CandidateStatus::Idle => 0,
        }
    }
}

/// One (source column, target column) proposal from one matcher
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Candidate {
    pub source_column: String,
    pub target_column: String,
    pub score: f64,
    pub matcher: String,
    #[serde(default)]
    pub status: CandidateStatus,
}

impl Candidate {
    pub fn new(
        source_column: impl Into<String>,
        target_column: impl Into<String>,
        matcher: impl Into<String>,
        score: f64,
    ) -> Self {
        Self {
            source_column: source_column.into(),
            target_column: target_column.into(),
            score,
            matcher: matcher.into(),
            status: CandidateStatus::Idle,
        }
    }

    pub fn with_status(mut self, status: CandidateStatus) -> Self {
        self.status = status;
        self
    }

    /// Identity of the user-visible (aggregated) candidate
    pub fn pair(&self) -> (&str, &str) {
        (&self.source_column, &self.target_column)
    }

    pub fn is_accepted(&self) -> bool {
        self.status == CandidateStatus::Accepted
    }
}

/// Candidate collapsed across matchers, keyed by (source, target)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AggregatedCandidate {
    pub source_column: String,
    pub target_column: String,
    /// Highest score any matcher gave this pair
    pub score: f64,
    pub matchers: Vec<String>,
    pub status: CandidateStatus,
}

/// Collapse raw candidates into the user-visible view
///
/// Output order follows first appearance of each pair.
pub fn aggregate_candidates(candidates: &[Candidate]) -> Vec<AggregatedCandidate> {
    let mut index: HashMap<(String, String), usize> = HashMap::new();
    let mut aggregated: Vec<AggregatedCandidate> = Vec::new();

    for candidate in candidates {
        let key = (candidate.source_column.clone(), candidate.target_column.clone());
        match index.get(&key) {
            Some(&i) => {
                let entry = &mut aggregated[i];
                if candidate.score > entry.score {
                    entry.score = candidate.score;
                }
                if !entry.matchers.contains(&candidate.matcher) {
                    entry.matchers.push(candidate.matcher.clone());
                }
                if candidate.status.precedence() > entry.status.precedence() {
                    entry.status = candidate.status;
                }
            }
            None => {
                index.insert(key, aggregated.len());
                aggregated.push(AggregatedCandidate {
                    source_column: candidate.source_column.clone(),
                    target_column: candidate.target_column.clone(),
                    score: candidate.score,
                    matchers: vec![candidate.matcher.clone()],
                    status: candidate.status,
                });
            }
        }
    }

    aggregated
}

/// A matching strategy registered in the session
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Matcher {
    pub name: String,
    #[serde(default = "default_weight")]
    pub weight: f64,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default)]
    pub params: serde_json::Value,
    #[serde(default)]
    pub code: String,
}

fn default_weight() -> f64 {
    1.0
}

fn default_enabled() -> bool {
    true
}

impl Matcher {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            weight: default_weight(),
            enabled: true,
            params: serde_json::Value::Null,
            code: String::new(),
        }
    }
}

/// Curator-accepted pairs, de-duplicated by (source, target)
#[derive(Debug, Clone, Default, PartialEq)]
pub struct GroundTruth {
    entries: Vec<Candidate>,
    by_source: BTreeMap<String, Vec<String>>,
}

impl GroundTruth {
    /// Derive ground truth from the current candidate set
    ///
    /// The first accepted candidate seen for a pair represents it.
    pub fn from_candidates(candidates: &[Candidate]) -> Self {
        let mut seen: HashSet<(&str, &str)> = HashSet::new();
        let mut entries = Vec::new();
        let mut by_source: BTreeMap<String, Vec<String>> = BTreeMap::new();

        for candidate in candidates.iter().filter(|c| c.is_accepted()) {
            if seen.insert(candidate.pair()) {
                entries.push(candidate.clone());
                by_source
                    .entry(candidate.source_column.clone())
                    .or_default()
                    .push(candidate.target_column.clone());
            }
        }

        Self { entries, by_source }
    }

    pub fn entries(&self) -> &[Candidate] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Source columns with at least one accepted target, sorted
    pub fn source_columns(&self) -> impl Iterator<Item = &str> {
        self.by_source.keys().map(String::as_str)
    }

    pub fn source_column_count(&self) -> usize {
        self.by_source.len()
    }

    pub fn targets_for(&self, source_column: &str) -> &[String] {
        self.by_source
            .get(source_column)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    pub fn contains(&self, source_column: &str, target_column: &str) -> bool {
        self.targets_for(source_column)
            .iter()
            .any(|t| t == target_column)
    }

    /// The accepted candidate standing for (source, target)
    pub fn entry(&self, source_column: &str, target_column: &str) -> Option<&Candidate> {
        self.entries
            .iter()
            .find(|c| c.source_column == source_column && c.target_column == target_column)
    }
}

/// Evidence category
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExplanationType {
    Name,
    Token,
    Value,
    Semantic,
    Pattern,
    History,
    Knowledge,
    #[serde(other)]
    Other,
}

impl ExplanationType {
    pub const ALL: [ExplanationType; 8] = [
        ExplanationType::Name,
        ExplanationType::Token,
        ExplanationType::Value,
        ExplanationType::Semantic,
        ExplanationType::Pattern,
        ExplanationType::History,
        ExplanationType::Knowledge,
        ExplanationType::Other,
    ];
}

/// One piece of evidence for or against a pair
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Explanation {
    #[serde(rename = "type")]
    pub explanation_type: ExplanationType,
    pub is_match: bool,
    /// 0.0 - 1.0
    pub confidence: f64,
}

/// Cached evidence for one ground-truth pair
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExplanationSummary {
    pub source_column: String,
    pub target_column: String,
    #[serde(default)]
    pub explanations: Vec<Explanation>,
}

/// Evidence attribution for one matcher
///
/// Scores are sums of the matcher's (max) candidate score over covered
/// ground-truth pairs; support/contradict weight that score by the strongest
/// explanation confidence per category.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExplanationBreakdown {
    pub covered_ground_truth_score: f64,
    pub covered_ground_truth_count: usize,
    pub exact_match_score: f64,
    pub support: BTreeMap<ExplanationType, f64>,
    pub contradict: BTreeMap<ExplanationType, f64>,
    pub explained_ground_truth_count: usize,
    pub missing_explanation_count: usize,
}

impl Default for ExplanationBreakdown {
    fn default() -> Self {
        let zeroed: BTreeMap<ExplanationType, f64> =
            ExplanationType::ALL.iter().map(|t| (*t, 0.0)).collect();
        Self {
            covered_ground_truth_score: 0.0,
            covered_ground_truth_count: 0,
            exact_match_score: 0.0,
            support: zeroed.clone(),
            contradict: zeroed,
            explained_ground_truth_count: 0,
            missing_explanation_count: 0,
        }
    }
}

/// Ranking metrics and evidence attribution for one enabled matcher
///
/// Naming quirk carried over from the UI contract: `false_positives` holds
/// ground-truth pairs the matcher failed to propose, `false_negatives` holds
/// the matcher's proposals that are not ground truth. Renderers depend on this
/// direction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MatcherAnalysis {
    pub name: String,
    pub mrr: f64,
    pub recall_gt: f64,
    pub f1_score: f64,
    pub false_positives: Vec<Candidate>,
    pub false_negatives: Vec<Candidate>,
    #[serde(default)]
    pub explanation_breakdown: Option<ExplanationBreakdown>,
}
