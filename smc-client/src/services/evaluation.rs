//! Matcher evaluation engine
//!
//! Scores every enabled matcher against the curator's ground truth in two
//! phases:
//!
//! - **Ranking metrics**: pure function of the candidate snapshot (MRR,
//!   recall, F1 and the per-matcher miss lists), published immediately.
//! - **Explanation attribution**: weighs each matcher's covered ground-truth
//!   pairs by cached evidence fetched from the server, patched in when the
//!   batched fetch resolves.
//!
//! Every cycle takes a ticket from a shared sequence counter. A cycle may only
//! write its results while its ticket is still the latest one issued; older
//! cycles run to completion and their results are dropped.

use smc_common::events::{AnalysisPhase, EventBus, NotificationLevel, SmcEvent};
use smc_common::{
    Candidate, ExplanationBreakdown, ExplanationSummary, ExplanationType, GroundTruth, Matcher,
    MatcherAnalysis,
};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::api::{ColumnPair, ExplanationSource};
use crate::error::ClientResult;
use crate::state::SessionState;

/// Shortcut matcher whose hits count as exact matches and need no evidence
pub const EXACT_MATCH_MATCHER: &str = "candidate_quadrants";

// ============================================================================
// Ranking metrics
// ============================================================================

/// Compute ranking metrics for each matcher, in roster order
///
/// `explanation_breakdown` is left empty; it is filled in by attribution.
pub fn compute_ranking_metrics(candidates: &[Candidate], matchers: &[Matcher]) -> Vec<MatcherAnalysis> {
    let ground_truth = GroundTruth::from_candidates(candidates);
    matchers
        .iter()
        .map(|matcher| rank_matcher(&matcher.name, candidates, &ground_truth))
        .collect()
}

fn rank_matcher(name: &str, candidates: &[Candidate], ground_truth: &GroundTruth) -> MatcherAnalysis {
    let mut by_source: HashMap<&str, Vec<&Candidate>> = HashMap::new();
    for candidate in candidates.iter().filter(|c| c.matcher == name) {
        by_source
            .entry(candidate.source_column.as_str())
            .or_default()
            .push(candidate);
    }
    for ranked in by_source.values_mut() {
        ranked.sort_by(|a, b| {
            b.score
                .total_cmp(&a.score)
                .then_with(|| a.target_column.cmp(&b.target_column))
        });
    }

    let mut reciprocal_rank_sum = 0.0;
    let mut hits = 0usize;
    // Inverted names: see `MatcherAnalysis`
    let mut false_positives = Vec::new();
    let mut false_negatives = Vec::new();

    for source_column in ground_truth.source_columns() {
        let targets = ground_truth.targets_for(source_column);
        let ranked = by_source
            .get(source_column)
            .map(Vec::as_slice)
            .unwrap_or(&[]);

        if let Some(rank) = ranked
            .iter()
            .position(|c| targets.contains(&c.target_column))
        {
            reciprocal_rank_sum += 1.0 / (rank as f64 + 1.0);
            hits += 1;
        }

        false_negatives.extend(
            ranked
                .iter()
                .filter(|c| !targets.contains(&c.target_column))
                .map(|c| (*c).clone()),
        );

        for target in targets {
            if !ranked.iter().any(|c| &c.target_column == target) {
                if let Some(entry) = ground_truth.entry(source_column, target) {
                    false_positives.push(entry.clone());
                }
            }
        }
    }

    let source_count = ground_truth.source_column_count();
    let (mrr, recall) = if source_count == 0 {
        (0.0, 0.0)
    } else {
        (
            reciprocal_rank_sum / source_count as f64,
            hits as f64 / source_count as f64,
        )
    };

    let precision_denominator = hits + false_positives.len();
    let precision = if precision_denominator == 0 {
        0.0
    } else {
        hits as f64 / precision_denominator as f64
    };
    let f1_score = if precision + recall == 0.0 {
        0.0
    } else {
        2.0 * precision * recall / (precision + recall)
    };

    MatcherAnalysis {
        name: name.to_string(),
        mrr,
        recall_gt: recall,
        f1_score,
        false_positives,
        false_negatives,
        explanation_breakdown: None,
    }
}

// ============================================================================
// Explanation attribution
// ============================================================================

/// Ground-truth pairs already decided by the exact-match shortcut matcher
pub fn exact_match_pairs(candidates: &[Candidate], ground_truth: &GroundTruth) -> HashSet<(String, String)> {
    candidates
        .iter()
        .filter(|c| c.matcher == EXACT_MATCH_MATCHER)
        .filter(|c| ground_truth.contains(&c.source_column, &c.target_column))
        .map(|c| (c.source_column.clone(), c.target_column.clone()))
        .collect()
}

/// Ground-truth pairs that need cached evidence, in ground-truth order
pub fn evidence_pairs(ground_truth: &GroundTruth, exact: &HashSet<(String, String)>) -> Vec<ColumnPair> {
    ground_truth
        .entries()
        .iter()
        .filter(|c| !exact.contains(&(c.source_column.clone(), c.target_column.clone())))
        .map(|c| ColumnPair::new(c.source_column.as_str(), c.target_column.as_str()))
        .collect()
}

/// Attribute covered ground truth to evidence categories, per matcher
pub fn attribute_explanations(
    candidates: &[Candidate],
    matchers: &[Matcher],
    ground_truth: &GroundTruth,
    exact: &HashSet<(String, String)>,
    summaries: &[ExplanationSummary],
) -> HashMap<String, ExplanationBreakdown> {
    let evidence: HashMap<(&str, &str), &ExplanationSummary> = summaries
        .iter()
        .filter(|s| !s.explanations.is_empty())
        .map(|s| ((s.source_column.as_str(), s.target_column.as_str()), s))
        .collect();

    matchers
        .iter()
        .map(|matcher| {
            let breakdown = attribute_matcher(&matcher.name, candidates, ground_truth, exact, &evidence);
            (matcher.name.clone(), breakdown)
        })
        .collect()
}

fn attribute_matcher(
    name: &str,
    candidates: &[Candidate],
    ground_truth: &GroundTruth,
    exact: &HashSet<(String, String)>,
    evidence: &HashMap<(&str, &str), &ExplanationSummary>,
) -> ExplanationBreakdown {
    // Max score per pair this matcher produced
    let mut scores: HashMap<(&str, &str), f64> = HashMap::new();
    for candidate in candidates.iter().filter(|c| c.matcher == name) {
        let score = scores.entry(candidate.pair()).or_insert(f64::NEG_INFINITY);
        *score = score.max(candidate.score);
    }

    let mut breakdown = ExplanationBreakdown::default();
    for entry in ground_truth.entries() {
        let pair = entry.pair();
        let Some(&score) = scores.get(&pair) else {
            continue;
        };

        breakdown.covered_ground_truth_score += score;
        breakdown.covered_ground_truth_count += 1;

        if exact.contains(&(pair.0.to_string(), pair.1.to_string())) {
            breakdown.exact_match_score += score;
            continue;
        }

        match evidence.get(&pair) {
            Some(summary) => {
                let (support, contradict) = strongest_confidence(summary);
                for (category, confidence) in support {
                    *breakdown.support.entry(category).or_insert(0.0) += score * confidence;
                }
                for (category, confidence) in contradict {
                    *breakdown.contradict.entry(category).or_insert(0.0) += score * confidence;
                }
                breakdown.explained_ground_truth_count += 1;
            }
            None => breakdown.missing_explanation_count += 1,
        }
    }
    breakdown
}

type CategoryConfidence = BTreeMap<ExplanationType, f64>;

/// Strongest matching and non-matching confidence per category
fn strongest_confidence(summary: &ExplanationSummary) -> (CategoryConfidence, CategoryConfidence) {
    let mut support = CategoryConfidence::new();
    let mut contradict = CategoryConfidence::new();
    for explanation in &summary.explanations {
        let side = if explanation.is_match {
            &mut support
        } else {
            &mut contradict
        };
        let best = side.entry(explanation.explanation_type).or_insert(0.0);
        *best = best.max(explanation.confidence);
    }
    (support, contradict)
}

// ============================================================================
// Engine
// ============================================================================

/// How an evaluation cycle ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EvaluationOutcome {
    /// Both phases were written to session state
    Applied { sequence: u64 },
    /// A newer cycle was issued; this one's remaining results were dropped
    Superseded { sequence: u64 },
}

/// Re-evaluates matchers from session state
#[derive(Clone)]
pub struct EvaluationEngine {
    source: Arc<dyn ExplanationSource>,
    state: SessionState,
    events: EventBus,
    sequence: Arc<AtomicU64>,
}

impl EvaluationEngine {
    pub fn new(source: Arc<dyn ExplanationSource>, state: SessionState, events: EventBus) -> Self {
        Self {
            source,
            state,
            events,
            sequence: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Latest sequence number issued
    pub fn latest_sequence(&self) -> u64 {
        self.sequence.load(Ordering::SeqCst)
    }

    fn is_current(&self, sequence: u64) -> bool {
        self.sequence.load(Ordering::SeqCst) == sequence
    }

    /// Run one full evaluation cycle against the current snapshot
    pub async fn evaluate(&self) -> ClientResult<EvaluationOutcome> {
        let sequence = self.sequence.fetch_add(1, Ordering::SeqCst) + 1;
        let snapshot = self.state.evaluation_snapshot().await;

        let analyses = compute_ranking_metrics(&snapshot.candidates, &snapshot.enabled_matchers);
        let matcher_count = analyses.len();
        if !self
            .state
            .replace_analyses_if(analyses, || self.is_current(sequence))
            .await
        {
            tracing::debug!(sequence = sequence, "Discarding stale ranking metrics");
            return Ok(EvaluationOutcome::Superseded { sequence });
        }
        self.events.emit_lossy(SmcEvent::AnalysisUpdated {
            sequence,
            phase: AnalysisPhase::Metrics,
        });
        tracing::debug!(sequence = sequence, matchers = matcher_count, "Ranking metrics published");

        let ground_truth = GroundTruth::from_candidates(&snapshot.candidates);
        let exact = exact_match_pairs(&snapshot.candidates, &ground_truth);
        let pairs = evidence_pairs(&ground_truth, &exact);

        let summaries = if pairs.is_empty() {
            Vec::new()
        } else {
            match self.source.cached_explanation_summaries(&pairs).await {
                Ok(summaries) => summaries,
                Err(e) => {
                    tracing::warn!(sequence = sequence, error = %e, "Explanation fetch failed");
                    if self.is_current(sequence) {
                        self.events.emit_lossy(SmcEvent::notify(
                            NotificationLevel::Warning,
                            format!("Failed to load explanations: {}", e.user_message()),
                        ));
                    }
                    return Err(e);
                }
            }
        };

        let breakdowns = attribute_explanations(
            &snapshot.candidates,
            &snapshot.enabled_matchers,
            &ground_truth,
            &exact,
            &summaries,
        );

        if !self
            .state
            .patch_breakdowns_if(&breakdowns, || self.is_current(sequence))
            .await
        {
            tracing::debug!(
                sequence = sequence,
                latest = self.latest_sequence(),
                "Discarding stale explanation breakdowns"
            );
            return Ok(EvaluationOutcome::Superseded { sequence });
        }
        self.events.emit_lossy(SmcEvent::AnalysisUpdated {
            sequence,
            phase: AnalysisPhase::Explanations,
        });
        tracing::info!(
            sequence = sequence,
            matchers = matcher_count,
            evidence_pairs = pairs.len(),
            "Matcher evaluation applied"
        );
        Ok(EvaluationOutcome::Applied { sequence })
    }

    /// Re-evaluate whenever candidates or the roster change
    ///
    /// Each change spawns its own cycle; overlapping cycles are resolved by
    /// the sequence check, not by cancelling the older one.
    pub fn spawn_observer(&self, cancel: CancellationToken) -> JoinHandle<()> {
        let engine = self.clone();
        let mut revisions = self.state.subscribe_revisions();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => break,
                    changed = revisions.changed() => {
                        if changed.is_err() {
                            break;
                        }
                    }
                }

                let cycle = engine.clone();
                tokio::spawn(async move {
                    if let Err(e) = cycle.evaluate().await {
                        tracing::warn!(error = %e, "Evaluation cycle failed");
                    }
                });
            }
            tracing::debug!("Evaluation observer stopped");
        })
    }
}
