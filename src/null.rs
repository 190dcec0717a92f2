use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
};

use rand::{seq::index::sample, Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use rayon::prelude::*;
use tracing::debug;

use crate::{
    comparator::score,
    error::{CmapError, Result},
    library::ProfileLibrary,
    utils::derive_seed,
};

/// Number of permutations drawn from one seeded stream
///
/// Fixed so that output does not depend on the number of threads.
const BLOCK_SIZE: usize = 4096;

/// Empirical null distribution of connectivity scores
#[derive(Debug, Clone, PartialEq)]
pub struct NullDistribution {
    pub n_up: usize,
    pub n_down: usize,
    pub seed: u64,
    pub scores: Vec<f64>,
}
impl NullDistribution {
    pub fn len(&self) -> usize {
        self.scores.len()
    }

    pub fn is_empty(&self) -> bool {
        self.scores.is_empty()
    }
}

/// Scores random signatures against random profiles
///
/// Each iteration draws one profile with replacement and `n_up + n_down`
/// distinct genes from the universe; the first `n_up` form the up set.
pub fn generate_null(
    library: &ProfileLibrary,
    n_up: usize,
    n_down: usize,
    n_permutations: usize,
    seed: u64,
) -> Result<NullDistribution> {
    let n_genes = library.n_genes();
    let n_draw = n_up + n_down;
    if n_permutations == 0 {
        return Err(CmapError::Config("n_permutations must be positive".into()));
    }
    if n_draw > n_genes {
        return Err(CmapError::InputShape(format!(
            "cannot draw {} genes from a universe of {}",
            n_draw, n_genes
        )));
    }

    let n_blocks = n_permutations.div_ceil(BLOCK_SIZE);
    let scores = (0..n_blocks)
        .into_par_iter()
        .flat_map_iter(|block| {
            let start = block * BLOCK_SIZE;
            let len = BLOCK_SIZE.min(n_permutations - start);
            let mut rng = ChaCha8Rng::seed_from_u64(derive_seed(seed, block as u64));
            (0..len)
                .map(|_| draw_score(library, n_up, n_draw, &mut rng))
                .collect::<Vec<_>>()
        })
        .collect::<Vec<_>>();

    debug!(n_up, n_down, n_permutations, seed, "generated null distribution");
    Ok(NullDistribution {
        n_up,
        n_down,
        seed,
        scores,
    })
}

fn draw_score(library: &ProfileLibrary, n_up: usize, n_draw: usize, rng: &mut ChaCha8Rng) -> f64 {
    let profile = &library.profiles()[rng.gen_range(0..library.n_profiles())];
    let genes = sample(rng, library.n_genes(), n_draw).into_vec();
    let (up, down) = genes.split_at(n_up);
    score(up, down, profile)
}

/// Library fingerprint, n_up, n_down, n_permutations, seed
type NullKey = (u64, usize, usize, usize, u64);

/// Memoizes null distributions by library and `(n_up, n_down, n_permutations, seed)`
///
/// Owned by the caller and shared across sweep workers. One cache may serve
/// several libraries; entries never cross between them.
#[derive(Default)]
pub struct NullCache {
    entries: Mutex<HashMap<NullKey, Arc<NullDistribution>>>,
}
impl NullCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get_or_generate(
        &self,
        library: &ProfileLibrary,
        n_up: usize,
        n_down: usize,
        n_permutations: usize,
        seed: u64,
    ) -> Result<Arc<NullDistribution>> {
        let key = (library.fingerprint(), n_up, n_down, n_permutations, seed);
        if let Some(null) = self.lock().get(&key) {
            return Ok(Arc::clone(null));
        }
        // generated outside the lock; a racing duplicate yields identical scores
        let null = Arc::new(generate_null(library, n_up, n_down, n_permutations, seed)?);
        Ok(Arc::clone(self.lock().entry(key).or_insert(null)))
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    pub fn clear(&self) {
        self.lock().clear();
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<NullKey, Arc<NullDistribution>>> {
        self.entries.lock().unwrap_or_else(|e| e.into_inner())
    }
}
