//! The candidate ranker: composite scoring, `(candidate_type, payload_hash)`
//! deduplication, Pareto pruning within each candidate type, and a total,
//! deterministic stable sort. Every step here is a pure function of its
//! input candidate list — no suspension, no I/O, matching the "pure core"
//! design note.

use std::cmp::Ordering;
use std::collections::HashSet;

use coh_proposers::{Candidate, CandidateType, Scores};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ScoreWeights {
    pub risk: f64,
    pub utility: f64,
    pub cost: f64,
    pub confidence: f64,
}

impl Default for ScoreWeights {
    fn default() -> Self {
        Self { risk: 0.25, utility: 0.35, cost: 0.20, confidence: 0.20 }
    }
}

/// `w_r*(1-risk) + w_u*utility + w_c*(1-cost) + w_f*confidence`, clamped to
/// `[0,1]`. Lower risk and lower cost are better, so both are inverted
/// before weighting.
pub fn composite_score(scores: &Scores, weights: &ScoreWeights) -> f64 {
    let composite = weights.risk * (1.0 - scores.risk)
        + weights.utility * scores.utility
        + weights.cost * (1.0 - scores.cost)
        + weights.confidence * scores.confidence;
    composite.clamp(0.0, 1.0)
}

/// First-wins deduplication on `(candidate_type, payload_hash)`, preserving
/// the stable input order of the survivors.
pub fn deduplicate(candidates: Vec<Candidate>) -> Vec<Candidate> {
    let mut seen = HashSet::new();
    candidates
        .into_iter()
        .filter(|c| seen.insert((c.candidate_type, c.payload_hash)))
        .collect()
}

fn dominates(a: &Scores, b: &Scores) -> bool {
    let at_least_as_good = a.risk <= b.risk && a.utility >= b.utility && a.cost <= b.cost && a.confidence >= b.confidence;
    let strictly_better = a.risk < b.risk || a.utility > b.utility || a.cost < b.cost || a.confidence > b.confidence;
    at_least_as_good && strictly_better
}

/// Drops any candidate that is dominated by another candidate of the same
/// `candidate_type`. Dominance is computed independently per type:
/// candidates of different types are never compared against each other.
pub fn pareto_prune(candidates: Vec<Candidate>) -> Vec<Candidate> {
    let groups: Vec<CandidateType> = {
        let mut seen = HashSet::new();
        candidates.iter().map(|c| c.candidate_type).filter(|t| seen.insert(*t)).collect()
    };

    let mut survivors = Vec::with_capacity(candidates.len());
    for group in groups {
        let same_type: Vec<&Candidate> = candidates.iter().filter(|c| c.candidate_type == group).collect();
        for candidate in &same_type {
            let is_dominated = same_type
                .iter()
                .any(|other| !std::ptr::eq(*other, *candidate) && dominates(&other.scores, &candidate.scores));
            if !is_dominated {
                survivors.push((*candidate).clone());
            }
        }
    }
    survivors
}

/// Sorts by `(composite desc, candidate_type asc, payload_hash asc)` — a
/// total order with zero ties.
fn stable_sort_key(candidates: &mut [(Candidate, f64)]) {
    candidates.sort_by(|(a, a_score), (b, b_score)| {
        b_score
            .partial_cmp(a_score)
            .unwrap_or(Ordering::Equal)
            .then_with(|| format!("{:?}", a.candidate_type).cmp(&format!("{:?}", b.candidate_type)))
            .then_with(|| a.payload_hash.to_string().cmp(&b.payload_hash.to_string()))
    });
}

/// Scores, deduplicates, Pareto-prunes, stable-sorts, and truncates to
/// `max_candidates`. This is the single entry point `coh-executor`/
/// `coh-kernel` call; the individual steps stay public for testing and for
/// callers that want to compose them differently.
pub fn rank(candidates: Vec<Candidate>, weights: &ScoreWeights, max_candidates: usize) -> Vec<Candidate> {
    if candidates.is_empty() {
        return Vec::new();
    }

    let deduped = deduplicate(candidates);
    let pruned = pareto_prune(deduped);

    let mut scored: Vec<(Candidate, f64)> =
        pruned.into_iter().map(|c| { let s = composite_score(&c.scores, weights); (c, s) }).collect();
    stable_sort_key(&mut scored);

    scored.into_iter().map(|(c, _)| c).take(max_candidates).collect()
}
