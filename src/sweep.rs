use std::{
    panic::{catch_unwind, AssertUnwindSafe},
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
};

use rayon::prelude::*;
use tracing::{debug, info, warn};

use crate::{
    aggregate::aggregate,
    comparator::{apply_mode, score_all},
    config::SweepConfig,
    error::{CmapError, Result},
    library::ProfileLibrary,
    null::{generate_null, NullCache, NullDistribution},
    results::{
        CutoffStatus, CutoffSummary, RobustHit, SignificanceRecord, ThresholdOutcome,
        ThresholdResult,
    },
    signature::{DiseaseTable, GeneSignature},
    significance::evaluate,
    utils::cutoff_seed,
};

/// Index meaning "no cutoff has been skipped"
const NO_HALT: usize = usize::MAX;

/// Scores a disease signature across a grid of effect-size cutoffs
///
/// Each cutoff rebuilds the signature, calibrates its own null and
/// evaluates significance. Cutoffs run in parallel over shared read-only
/// inputs and are reduced in grid order.
pub struct ThresholdSweep<'a> {
    table: &'a DiseaseTable,
    library: &'a ProfileLibrary,
    config: &'a SweepConfig,
    null_cache: Option<&'a NullCache>,
    #[cfg(test)]
    fault: Option<tests::Fault>,
}
impl<'a> ThresholdSweep<'a> {
    /// Validates the configuration and the table's shape against it
    pub fn new(
        table: &'a DiseaseTable,
        library: &'a ProfileLibrary,
        config: &'a SweepConfig,
    ) -> Result<Self> {
        config.validate()?;
        config.strategy.effect_values(table)?;
        if config.p_value_cutoff.is_some() && table.pvalues().is_none() {
            return Err(CmapError::InputShape(
                "p-value cutoff set but table has no p-value column".into(),
            ));
        }
        Ok(Self {
            table,
            library,
            config,
            null_cache: None,
            #[cfg(test)]
            fault: None,
        })
    }

    /// Reuses null distributions across runs through a caller-owned cache
    pub fn with_null_cache(mut self, cache: &'a NullCache) -> Self {
        self.null_cache = Some(cache);
        self
    }

    /// The cutoffs this sweep visits, ascending
    pub fn cutoffs(&self) -> Result<Vec<f64>> {
        let effects = self.config.strategy.effect_values(self.table)?;
        self.config.grid.resolve(&effects)
    }

    /// Runs one cutoff, failing on any gating or scoring error
    pub fn run_single(&self, cutoff: f64) -> Result<ThresholdResult> {
        let outcome = self.score_cutoff(cutoff)?;
        Ok(ThresholdResult::new(cutoff, outcome))
    }

    /// Runs every cutoff of the grid
    ///
    /// Undersized cutoffs are skipped, and with `stop_on_small` the first
    /// skip in grid order ends the sweep. Errors inside a cutoff are
    /// isolated to it, except for input-shape and degenerate-null errors
    /// which fail the run.
    pub fn run(&self) -> Result<SweepReport> {
        let cutoffs = self.cutoffs()?;
        let workers = self.config.worker_count(cutoffs.len());
        info!(
            n_cutoffs = cutoffs.len(),
            workers,
            n_profiles = self.library.n_profiles(),
            "starting threshold sweep"
        );

        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(workers)
            .build()
            .map_err(|e| CmapError::Worker(e.to_string()))?;
        let halt = AtomicUsize::new(NO_HALT);
        let attempts = pool.install(|| {
            cutoffs
                .par_iter()
                .enumerate()
                .map(|(index, &cutoff)| self.attempt(index, cutoff, &halt))
                .collect::<Vec<_>>()
        });

        let mut results = Vec::with_capacity(cutoffs.len());
        let mut aborted_at = None;
        for attempt in attempts {
            // only cutoffs past the first skip are ever cancelled
            let Some(attempt) = attempt else { break };
            let result = attempt?;
            let skipped = result.status() == CutoffStatus::Skipped;
            let cutoff = result.cutoff;
            results.push(result);
            if skipped && self.config.stop_on_small {
                warn!(cutoff, "stopping sweep at undersized signature");
                aborted_at = Some(cutoff);
                break;
            }
        }

        let robust = aggregate(
            &results,
            self.config.q_value_threshold,
            self.config.robust_rule,
            self.config.robust_k,
            &self.config.aggregate_fn,
        );
        info!(
            n_attempted = results.len(),
            n_scored = results.iter().filter(|r| r.is_scored()).count(),
            n_robust = robust.len(),
            "finished threshold sweep"
        );
        Ok(SweepReport {
            q_threshold: self.config.q_value_threshold,
            results,
            robust,
            aborted_at,
        })
    }

    /// Runs one cutoff inside the sweep
    ///
    /// Returns `None` when an earlier skip cancelled it, and `Err` only for
    /// errors that fail the whole sweep.
    fn attempt(
        &self,
        index: usize,
        cutoff: f64,
        halt: &AtomicUsize,
    ) -> Option<Result<ThresholdResult>> {
        if self.config.stop_on_small && halt.load(Ordering::Acquire) < index {
            debug!(cutoff, "cutoff cancelled after earlier skip");
            return None;
        }

        let outcome = match catch_unwind(AssertUnwindSafe(|| self.score_cutoff(cutoff))) {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(err)) if err.is_skip() => {
                if self.config.stop_on_small {
                    halt.fetch_min(index, Ordering::AcqRel);
                }
                let n_genes = match err {
                    CmapError::InsufficientSignatureSize { n_genes, .. } => n_genes,
                    _ => 0,
                };
                warn!(cutoff, n_genes, reason = %err, "skipping cutoff");
                ThresholdOutcome::Skipped {
                    reason: err.to_string(),
                    n_genes,
                }
            }
            Ok(Err(err)) if err.is_fatal() => return Some(Err(err)),
            Ok(Err(err)) => {
                warn!(cutoff, cause = %err, "cutoff failed");
                ThresholdOutcome::Errored {
                    cause: err.to_string(),
                }
            }
            Err(panic) => {
                let cause = panic_message(panic.as_ref());
                warn!(cutoff, %cause, "cutoff panicked");
                ThresholdOutcome::Errored {
                    cause: CmapError::Worker(cause).to_string(),
                }
            }
        };
        Some(Ok(ThresholdResult::new(cutoff, outcome)))
    }

    /// Builds, gates and scores the signature at one cutoff
    fn score_cutoff(&self, cutoff: f64) -> Result<ThresholdOutcome> {
        #[cfg(test)]
        self.fault.map_or(Ok(()), |fault| fault.trigger(cutoff))?;
        let build = self.config.strategy.build_signature(
            self.table,
            cutoff,
            self.config.p_value_cutoff,
            self.library,
        )?;
        let signature = build.signature;
        self.gate(&signature, build.pre_filter_gene_count)?;

        let null = self.null_for(&signature)?;
        let observed = score_all(&signature, self.library);
        let evaluation = evaluate(&null, &observed, self.config.fdr_method)?;
        let reported = apply_mode(&observed, self.config.score_mode);

        let records = self
            .library
            .profiles()
            .iter()
            .zip(reported)
            .zip(evaluation.values)
            .map(|((profile, score), sig)| {
                SignificanceRecord::new(
                    profile.id().to_string(),
                    profile.drug().to_string(),
                    score,
                    sig.p,
                    sig.q,
                    cutoff,
                )
            })
            .collect::<Vec<_>>();
        debug!(
            cutoff,
            n_up = signature.n_up(),
            n_down = signature.n_down(),
            n_hits = records
                .iter()
                .filter(|r| r.is_hit(self.config.q_value_threshold))
                .count(),
            "scored cutoff"
        );
        Ok(ThresholdOutcome::Scored {
            signature,
            records,
            fdr_path: evaluation.fdr_path,
        })
    }

    fn gate(&self, signature: &GeneSignature, pre_filter_gene_count: usize) -> Result<()> {
        let n_genes = signature.n_genes();
        if n_genes == 0 {
            return Err(CmapError::EmptySignature {
                cutoff: signature.cutoff,
            });
        }
        let required = self.config.required_genes(pre_filter_gene_count);
        if n_genes < required {
            return Err(CmapError::InsufficientSignatureSize {
                cutoff: signature.cutoff,
                n_genes,
                required,
            });
        }
        Ok(())
    }

    fn null_for(&self, signature: &GeneSignature) -> Result<Arc<NullDistribution>> {
        let seed = cutoff_seed(self.config.seed, signature.cutoff);
        let (n_up, n_down) = (signature.n_up(), signature.n_down());
        match self.null_cache {
            Some(cache) => {
                cache.get_or_generate(self.library, n_up, n_down, self.config.n_permutations, seed)
            }
            None => generate_null(self.library, n_up, n_down, self.config.n_permutations, seed)
                .map(Arc::new),
        }
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(msg) = panic.downcast_ref::<&str>() {
        msg.to_string()
    } else if let Some(msg) = panic.downcast_ref::<String>() {
        msg.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// Reduced outcome of a threshold sweep
#[derive(Debug, Clone)]
pub struct SweepReport {
    pub q_threshold: f64,
    /// One result per attempted cutoff, in grid order
    pub results: Vec<ThresholdResult>,
    /// Consensus candidates across scored cutoffs
    pub robust: Vec<RobustHit>,
    /// Cutoff whose skip ended the sweep early
    pub aborted_at: Option<f64>,
}
impl SweepReport {
    /// Significant reversals of every scored cutoff
    pub fn hit_table(&self) -> Vec<&SignificanceRecord> {
        self.results
            .iter()
            .flat_map(|r| r.hits(self.q_threshold))
            .collect()
    }

    pub fn summary(&self) -> Vec<CutoffSummary> {
        self.results
            .iter()
            .map(|r| r.summary(self.q_threshold))
            .collect()
    }

    pub fn pprint(&self) {
        println!("Cutoff\tGenes\tHits\tMedianQ\tStatus");
        for row in self.summary() {
            let median_q = row.median_q.map_or("NA".to_string(), |q| q.to_string());
            println!(
                "{}\t{}\t{}\t{}\t{}",
                row.cutoff, row.n_genes_kept, row.n_hits, median_q, row.status
            );
        }
        println!();
        println!("Drug\tAggregatedScore\tMinQ\tSupport");
        for hit in &self.robust {
            println!(
                "{}\t{}\t{}\t{}",
                hit.drug, hit.aggregated_score, hit.min_q, hit.n_support
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        comparator::ScoreMode,
        config::RobustRule,
        grid::CutoffGrid,
        library::Experiment,
        signature::{EffectColumn, SignatureStrategy},
        utils::same_cutoff,
    };
    use approx::assert_relative_eq;

    const N_GENES: usize = 60;

    /// Failure injected into one cutoff of a sweep
    #[derive(Debug, Clone, Copy)]
    pub(super) enum Fault {
        Panic(f64),
        Fail(f64),
    }
    impl Fault {
        pub(super) fn trigger(self, cutoff: f64) -> Result<()> {
            match self {
                Fault::Panic(at) if same_cutoff(at, cutoff) => panic!("scoring blew up"),
                Fault::Fail(at) if same_cutoff(at, cutoff) => {
                    Err(CmapError::Worker("scoring failed".into()))
                }
                _ => Ok(()),
            }
        }
    }

    fn gene_names() -> Vec<String> {
        (0..N_GENES).map(|i| format!("g{:02}", i)).collect()
    }

    /// Disease effects: g00..g19 up with decreasing strength, g40..g59 down
    fn disease_table() -> DiseaseTable {
        let effects = (0..N_GENES)
            .map(|i| match i {
                0..=19 => 2.0 - i as f64 * 0.1,
                40..=59 => -2.0 + (i - 40) as f64 * 0.1,
                _ => 0.01,
            })
            .collect();
        DiseaseTable::new(
            gene_names(),
            vec![EffectColumn::new("logfc".into(), effects)],
            None,
        )
        .unwrap()
    }

    /// Reversing drugs rank the disease-down genes first
    fn library() -> ProfileLibrary {
        let reversing = (0..N_GENES).map(|i| i as f64).collect::<Vec<_>>();
        let mimicking = (0..N_GENES).map(|i| -(i as f64)).collect::<Vec<_>>();
        let neutral = (0..N_GENES)
            .map(|i| ((i * 37) % N_GENES) as f64)
            .collect::<Vec<_>>();
        let mut experiments = Vec::new();
        let mut columns = Vec::new();
        for rep in 0..3 {
            experiments.push(Experiment::new(format!("rev_{}", rep), "reverser".into()));
            columns.push(reversing.clone());
            experiments.push(Experiment::new(format!("mim_{}", rep), "mimic".into()));
            columns.push(mimicking.clone());
            experiments.push(Experiment::new(format!("neu_{}", rep), "neutral".into()));
            columns.push(neutral.clone());
        }
        ProfileLibrary::from_matrix(gene_names(), experiments, &columns).unwrap()
    }

    fn config(grid: CutoffGrid) -> SweepConfig {
        SweepConfig::builder()
            .strategy(SignatureStrategy::Column {
                name: "logfc".into(),
            })
            .grid(grid)
            .n_permutations(2_000)
            .min_genes(4)
            .q_value_threshold(0.1)
            .robust_rule(RobustRule::All)
            .workers(2)
            .build()
    }

    #[test]
    fn test_single_cutoff_finds_reverser() {
        let (table, lib) = (disease_table(), library());
        let config = config(CutoffGrid::Fixed(vec![0.5]));
        let sweep = ThresholdSweep::new(&table, &lib, &config).unwrap();
        let result = sweep.run_single(0.5).unwrap();
        assert!(result.is_scored());
        let hits = result.hits(0.1).collect::<Vec<_>>();
        assert!(!hits.is_empty());
        assert!(hits.iter().all(|h| h.drug == "reverser"));
        for record in result.records() {
            assert!(record.p > 0.0 && record.p <= 1.0);
        }
    }

    #[test]
    fn test_single_cutoff_fails_fast_when_empty() {
        let (table, lib) = (disease_table(), library());
        let config = config(CutoffGrid::Fixed(vec![5.0]));
        let sweep = ThresholdSweep::new(&table, &lib, &config).unwrap();
        assert!(matches!(
            sweep.run_single(5.0),
            Err(CmapError::EmptySignature { .. })
        ));
    }

    #[test]
    fn test_sweep_skips_small_and_continues() {
        let (table, lib) = (disease_table(), library());
        // 1.95 keeps only g00 and g40; 3.0 keeps nothing
        let config = config(CutoffGrid::Fixed(vec![0.5, 1.95, 1.0, 3.0]));
        let report = ThresholdSweep::new(&table, &lib, &config)
            .unwrap()
            .run()
            .unwrap();
        let statuses = report.summary().iter().map(|s| s.status).collect::<Vec<_>>();
        assert_eq!(
            statuses,
            vec![
                CutoffStatus::Scored,
                CutoffStatus::Scored,
                CutoffStatus::Skipped,
                CutoffStatus::Skipped
            ]
        );
        assert_eq!(report.aborted_at, None);
        assert_eq!(report.robust.len(), 1);
        assert_eq!(report.robust[0].drug, "reverser");
        assert_eq!(report.robust[0].n_support, 2);
    }

    #[test]
    fn test_stop_on_small_discards_later_cutoffs() {
        let (table, lib) = (disease_table(), library());
        let mut config = config(CutoffGrid::Fixed(vec![0.5, 1.95, 3.0, 1.0, 0.2]));
        config.stop_on_small = true;
        let report = ThresholdSweep::new(&table, &lib, &config)
            .unwrap()
            .run()
            .unwrap();
        let cutoffs = report.results.iter().map(|r| r.cutoff).collect::<Vec<_>>();
        assert_eq!(cutoffs, vec![0.2, 0.5, 1.0, 1.95]);
        assert_eq!(report.aborted_at, Some(1.95));
    }

    #[test]
    fn test_sweep_is_reproducible_across_worker_counts() {
        let (table, lib) = (disease_table(), library());
        let mut one = config(CutoffGrid::Auto { step: 0.5 });
        one.workers = Some(1);
        let mut many = one.clone();
        many.workers = Some(4);
        let a = ThresholdSweep::new(&table, &lib, &one).unwrap().run().unwrap();
        let b = ThresholdSweep::new(&table, &lib, &many).unwrap().run().unwrap();
        assert_eq!(a.summary(), b.summary());
        assert_eq!(a.robust, b.robust);
        let records = |r: &SweepReport| {
            r.results
                .iter()
                .flat_map(|t| t.records().to_vec())
                .collect::<Vec<_>>()
        };
        assert_eq!(records(&a), records(&b));
    }

    #[test]
    fn test_auto_grid_uses_smaller_tail() {
        let (table, lib) = (disease_table(), library());
        let config = config(CutoffGrid::Auto { step: 0.5 });
        let sweep = ThresholdSweep::new(&table, &lib, &config).unwrap();
        assert_eq!(sweep.cutoffs().unwrap(), vec![0.0, 0.5, 1.0, 1.5, 2.0]);
    }

    #[test]
    fn test_null_cache_is_used() {
        let (table, lib) = (disease_table(), library());
        let config = config(CutoffGrid::Fixed(vec![0.5, 1.0]));
        let cache = NullCache::new();
        let sweep = ThresholdSweep::new(&table, &lib, &config)
            .unwrap()
            .with_null_cache(&cache);
        let first = sweep.run().unwrap();
        assert_eq!(cache.len(), 2);
        let second = sweep.run().unwrap();
        assert_eq!(cache.len(), 2);
        assert_eq!(first.summary(), second.summary());
    }

    #[test]
    fn test_missing_column_is_input_shape_error() {
        let (table, lib) = (disease_table(), library());
        let mut config = config(CutoffGrid::Fixed(vec![0.5]));
        config.strategy = SignatureStrategy::Average {
            prefix: "tstat".into(),
        };
        assert!(matches!(
            ThresholdSweep::new(&table, &lib, &config),
            Err(CmapError::InputShape(_))
        ));
    }

    #[test]
    fn test_hit_table_only_holds_reversals() {
        let (table, lib) = (disease_table(), library());
        let config = config(CutoffGrid::Fixed(vec![0.5, 1.0]));
        let report = ThresholdSweep::new(&table, &lib, &config)
            .unwrap()
            .run()
            .unwrap();
        let hits = report.hit_table();
        assert!(!hits.is_empty());
        assert!(hits.iter().all(|h| h.score < 0.0 && h.q < 0.1));
    }

    fn run_with_fault(fault: Fault) -> SweepReport {
        let (table, lib) = (disease_table(), library());
        let config = config(CutoffGrid::Fixed(vec![0.5, 0.75, 1.0]));
        let mut sweep = ThresholdSweep::new(&table, &lib, &config).unwrap();
        sweep.fault = Some(fault);
        sweep.run().unwrap()
    }

    #[test]
    fn test_panicking_cutoff_is_isolated() {
        let report = run_with_fault(Fault::Panic(0.75));
        let statuses = report.summary().iter().map(|s| s.status).collect::<Vec<_>>();
        assert_eq!(
            statuses,
            vec![
                CutoffStatus::Scored,
                CutoffStatus::Errored,
                CutoffStatus::Scored
            ]
        );
        match &report.results[1].outcome {
            ThresholdOutcome::Errored { cause } => assert!(cause.contains("scoring blew up")),
            other => panic!("expected errored cutoff, got {:?}", other),
        }
        assert_eq!(report.summary()[1].n_genes_kept, 0);
        assert_eq!(report.robust.len(), 1);
        assert_eq!(report.robust[0].drug, "reverser");
        assert_eq!(report.robust[0].n_support, 2);
    }

    #[test]
    fn test_failing_cutoff_is_isolated() {
        let report = run_with_fault(Fault::Fail(0.5));
        let statuses = report.summary().iter().map(|s| s.status).collect::<Vec<_>>();
        assert_eq!(
            statuses,
            vec![
                CutoffStatus::Errored,
                CutoffStatus::Scored,
                CutoffStatus::Scored
            ]
        );
        assert_eq!(report.aborted_at, None);
        assert!(report.results[0].records().is_empty());
    }

    #[test]
    fn test_single_cutoff_propagates_failure() {
        let (table, lib) = (disease_table(), library());
        let config = config(CutoffGrid::Fixed(vec![0.5]));
        let mut sweep = ThresholdSweep::new(&table, &lib, &config).unwrap();
        sweep.fault = Some(Fault::Fail(0.5));
        assert!(matches!(sweep.run_single(0.5), Err(CmapError::Worker(_))));
    }

    #[test]
    fn test_rescaled_scores_keep_reversal_sign() {
        let (table, lib) = (disease_table(), library());
        let mut config = config(CutoffGrid::Fixed(vec![0.5, 1.0]));
        config.score_mode = ScoreMode::Rescaled;
        let report = ThresholdSweep::new(&table, &lib, &config)
            .unwrap()
            .run()
            .unwrap();
        for record in report.results.iter().flat_map(|r| r.records()) {
            assert!((-1.0..=0.0).contains(&record.score));
            if record.drug == "mimic" {
                assert_eq!(record.score, 0.0);
            }
        }
        let hits = report.hit_table();
        assert!(!hits.is_empty());
        assert!(hits.iter().all(|h| h.drug == "reverser"));
        assert_eq!(report.robust.len(), 1);
        assert_eq!(report.robust[0].drug, "reverser");
        assert_relative_eq!(report.robust[0].aggregated_score, -1.0);
    }

    #[test]
    fn test_panic_message_extraction() {
        let boxed: Box<dyn std::any::Any + Send> = Box::new("boom");
        assert_eq!(panic_message(boxed.as_ref()), "boom");
        let boxed: Box<dyn std::any::Any + Send> = Box::new(String::from("bang"));
        assert_eq!(panic_message(boxed.as_ref()), "bang");
    }
}
