use std::collections::BTreeMap;

use itertools::Itertools;
use tracing::debug;

use crate::{
    config::{AggregateFn, RobustRule},
    results::{RobustHit, ThresholdResult},
};

/// Best evidence for one drug at one cutoff
#[derive(Debug, Clone, Copy)]
struct DrugAtCutoff {
    cutoff: f64,
    score: f64,
    q: f64,
}

/// Flattens the hits of scored cutoffs into per-drug evidence
///
/// A drug with several hit experiments in one cutoff keeps its most
/// negative score and smallest q.
fn collect_support(
    results: &[ThresholdResult],
    q_threshold: f64,
) -> BTreeMap<String, Vec<DrugAtCutoff>> {
    let mut support: BTreeMap<String, Vec<DrugAtCutoff>> = BTreeMap::new();
    for result in results.iter().filter(|r| r.is_scored()) {
        let by_drug = result
            .hits(q_threshold)
            .into_group_map_by(|record| record.drug.clone());
        for (drug, records) in by_drug {
            let score = records.iter().map(|r| r.score).fold(f64::INFINITY, f64::min);
            let q = records.iter().map(|r| r.q).fold(f64::INFINITY, f64::min);
            support
                .entry(drug)
                .or_default()
                .push(DrugAtCutoff {
                    cutoff: result.cutoff,
                    score,
                    q,
                });
        }
    }
    support
}

/// Consolidates sweep results into consensus reversal candidates
///
/// Drugs meeting `rule` are returned with their aggregated score and best
/// q-value, strongest reversal first.
pub fn aggregate(
    results: &[ThresholdResult],
    q_threshold: f64,
    rule: RobustRule,
    k: Option<usize>,
    aggregate_fn: &AggregateFn,
) -> Vec<RobustHit> {
    let n_scored = results.iter().filter(|r| r.is_scored()).count();
    if n_scored == 0 {
        return Vec::new();
    }
    let required = rule.required_support(k, n_scored).max(1);

    let mut hits = collect_support(results, q_threshold)
        .into_iter()
        .filter(|(_, evidence)| evidence.len() >= required)
        .map(|(drug, evidence)| {
            let scores = evidence.iter().map(|e| e.score).collect::<Vec<_>>();
            let cutoffs = evidence.iter().map(|e| e.cutoff).collect::<Vec<_>>();
            let min_q = evidence.iter().map(|e| e.q).fold(f64::INFINITY, f64::min);
            RobustHit::new(
                drug,
                aggregate_fn.aggregate(&scores, &cutoffs),
                min_q,
                evidence.len(),
            )
        })
        .collect::<Vec<_>>();

    hits.sort_by(|a, b| {
        a.aggregated_score
            .total_cmp(&b.aggregated_score)
            .then_with(|| a.drug.cmp(&b.drug))
    });
    debug!(
        n_scored,
        required,
        n_robust = hits.len(),
        "aggregated robust hits"
    );
    hits
}
