use std::{
    collections::{hash_map::DefaultHasher, HashMap},
    hash::{Hash, Hasher},
    path::{Path, PathBuf},
    sync::{Arc, Mutex},
};

use derive_new::new;
use tracing::debug;

use crate::error::{CmapError, Result};

/// Identity of a perturbation experiment
#[derive(Debug, Clone, PartialEq, Eq, new)]
pub struct Experiment {
    /// Unique experiment identifier (a library column name)
    pub id: String,
    /// Drug the experiment perturbs with; several experiments may share one
    pub drug: String,
}
impl Experiment {
    /// An experiment whose drug name is its identifier
    pub fn from_id(id: impl Into<String>) -> Self {
        let id = id.into();
        Self {
            drug: id.clone(),
            id,
        }
    }
}

/// One perturbation experiment as a total order over the gene universe
#[derive(Debug, Clone)]
pub struct RankedProfile {
    experiment: Experiment,
    /// 1-based rank of each universe gene, indexed by gene index
    ranks: Vec<u32>,
}
impl RankedProfile {
    /// Ranks raw perturbation values
    ///
    /// Rank 1 is the most up-regulated gene. Ties keep their order of
    /// appearance and non-finite values are ranked last.
    pub fn from_values(experiment: Experiment, values: &[f64]) -> Self {
        let mut order = (0..values.len()).collect::<Vec<_>>();
        // stable sort: ties resolve by position
        order.sort_by(|&a, &b| {
            let (va, vb) = (values[a], values[b]);
            match (va.is_finite(), vb.is_finite()) {
                (true, true) => vb.total_cmp(&va),
                (true, false) => std::cmp::Ordering::Less,
                (false, true) => std::cmp::Ordering::Greater,
                (false, false) => std::cmp::Ordering::Equal,
            }
        });
        let mut ranks = vec![0; values.len()];
        for (position, gene) in order.into_iter().enumerate() {
            ranks[gene] = position as u32 + 1;
        }
        Self { experiment, ranks }
    }

    /// Accepts a column that is already ranked, validating it is a permutation of 1..=N
    pub fn from_ranks(experiment: Experiment, ranks: Vec<u32>) -> Result<Self> {
        let n = ranks.len();
        let mut seen = vec![false; n];
        for &rank in &ranks {
            let slot = (rank as usize)
                .checked_sub(1)
                .filter(|&i| i < n)
                .ok_or_else(|| {
                    CmapError::InputShape(format!(
                        "rank {} out of range 1..={} in experiment {}",
                        rank, n, experiment.id
                    ))
                })?;
            if seen[slot] {
                return Err(CmapError::InputShape(format!(
                    "duplicate rank {} in experiment {}",
                    rank, experiment.id
                )));
            }
            seen[slot] = true;
        }
        Ok(Self { experiment, ranks })
    }

    pub fn experiment(&self) -> &Experiment {
        &self.experiment
    }

    pub fn id(&self) -> &str {
        &self.experiment.id
    }

    pub fn drug(&self) -> &str {
        &self.experiment.drug
    }

    /// 1-based rank of a gene by universe index
    pub fn rank(&self, gene: usize) -> u32 {
        self.ranks[gene]
    }

    pub fn len(&self) -> usize {
        self.ranks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ranks.is_empty()
    }
}

/// A set of ranked profiles sharing one gene universe
#[derive(Debug, Clone)]
pub struct ProfileLibrary {
    genes: Vec<String>,
    index: HashMap<String, usize>,
    profiles: Vec<RankedProfile>,
    /// Content hash over genes, experiments and ranks
    fingerprint: u64,
}
impl ProfileLibrary {
    /// Builds a library from a gene-by-experiment matrix of raw values
    ///
    /// `columns[j]` holds one value per gene in `genes`.
    pub fn from_matrix(
        genes: Vec<String>,
        experiments: Vec<Experiment>,
        columns: &[Vec<f64>],
    ) -> Result<Self> {
        if experiments.len() != columns.len() {
            return Err(CmapError::InputShape(format!(
                "{} experiment labels for {} columns",
                experiments.len(),
                columns.len()
            )));
        }
        let index = Self::build_index(&genes)?;
        let profiles = experiments
            .into_iter()
            .zip(columns.iter())
            .map(|(experiment, values)| {
                if values.len() != genes.len() {
                    return Err(CmapError::InputShape(format!(
                        "experiment {} has {} values for {} genes",
                        experiment.id,
                        values.len(),
                        genes.len()
                    )));
                }
                Ok(RankedProfile::from_values(experiment, values))
            })
            .collect::<Result<Vec<_>>>()?;
        Self::assemble(genes, index, profiles)
    }

    /// Builds a library from profiles that were ranked upstream
    pub fn from_profiles(genes: Vec<String>, profiles: Vec<RankedProfile>) -> Result<Self> {
        let index = Self::build_index(&genes)?;
        if let Some(bad) = profiles.iter().find(|p| p.len() != genes.len()) {
            return Err(CmapError::InputShape(format!(
                "experiment {} ranks {} genes, universe has {}",
                bad.id(),
                bad.len(),
                genes.len()
            )));
        }
        Self::assemble(genes, index, profiles)
    }

    fn build_index(genes: &[String]) -> Result<HashMap<String, usize>> {
        let mut index = HashMap::with_capacity(genes.len());
        for (i, gene) in genes.iter().enumerate() {
            if index.insert(gene.clone(), i).is_some() {
                return Err(CmapError::InputShape(format!(
                    "duplicate gene identifier {} in library",
                    gene
                )));
            }
        }
        Ok(index)
    }

    fn assemble(
        genes: Vec<String>,
        index: HashMap<String, usize>,
        profiles: Vec<RankedProfile>,
    ) -> Result<Self> {
        if genes.is_empty() {
            return Err(CmapError::InputShape("library gene universe is empty".into()));
        }
        if profiles.is_empty() {
            return Err(CmapError::InputShape("library has no profiles".into()));
        }
        let fingerprint = Self::fingerprint_of(&genes, &profiles);
        debug!(
            n_genes = genes.len(),
            n_profiles = profiles.len(),
            fingerprint,
            "built profile library"
        );
        Ok(Self {
            genes,
            index,
            profiles,
            fingerprint,
        })
    }

    fn fingerprint_of(genes: &[String], profiles: &[RankedProfile]) -> u64 {
        let mut hasher = DefaultHasher::new();
        genes.hash(&mut hasher);
        for profile in profiles {
            profile.experiment.id.hash(&mut hasher);
            profile.experiment.drug.hash(&mut hasher);
            profile.ranks.hash(&mut hasher);
        }
        hasher.finish()
    }

    /// Identifies the library's content; equal libraries share a fingerprint
    pub fn fingerprint(&self) -> u64 {
        self.fingerprint
    }

    /// Universe index of a gene identifier
    pub fn gene_index(&self, gene: &str) -> Option<usize> {
        self.index.get(gene).copied()
    }

    pub fn genes(&self) -> &[String] {
        &self.genes
    }

    pub fn n_genes(&self) -> usize {
        self.genes.len()
    }

    pub fn profiles(&self) -> &[RankedProfile] {
        &self.profiles
    }

    pub fn n_profiles(&self) -> usize {
        self.profiles.len()
    }
}

/// Caller-owned cache of loaded libraries keyed by canonical path
///
/// Entries live until `invalidate` or `clear` is called.
#[derive(Default)]
pub struct LibraryCache {
    entries: Mutex<HashMap<PathBuf, Arc<ProfileLibrary>>>,
}
impl LibraryCache {
    pub fn new() -> Self {
        Self::default()
    }

    fn canonical(path: &Path) -> PathBuf {
        std::fs::canonicalize(path).unwrap_or_else(|_| path.to_path_buf())
    }

    /// Returns the cached library for `path`, loading it on a miss
    pub fn get_or_load<F>(&self, path: &Path, loader: F) -> anyhow::Result<Arc<ProfileLibrary>>
    where
        F: FnOnce(&Path) -> anyhow::Result<ProfileLibrary>,
    {
        let key = Self::canonical(path);
        if let Some(library) = self.lock().get(&key) {
            return Ok(Arc::clone(library));
        }
        debug!(path = %key.display(), "loading profile library");
        let library = Arc::new(loader(&key)?);
        Ok(Arc::clone(self.lock().entry(key).or_insert(library)))
    }

    /// Drops the entry for `path`, returning whether one existed
    pub fn invalidate(&self, path: &Path) -> bool {
        self.lock().remove(&Self::canonical(path)).is_some()
    }

    pub fn clear(&self) {
        self.lock().clear();
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<PathBuf, Arc<ProfileLibrary>>> {
        // a poisoned map is still structurally valid
        self.entries.lock().unwrap_or_else(|e| e.into_inner())
    }
}
