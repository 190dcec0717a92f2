use std::collections::HashSet;

use derive_new::new;
use serde::Deserialize;

use crate::{
    error::{CmapError, Result},
    library::ProfileLibrary,
    math::arithmetic_mean,
};

/// A named numeric column of the disease table
#[derive(Debug, Clone, new)]
pub struct EffectColumn {
    pub name: String,
    pub values: Vec<f64>,
}

/// Disease expression table as handed over by the file readers
#[derive(Debug, Clone)]
pub struct DiseaseTable {
    genes: Vec<String>,
    effects: Vec<EffectColumn>,
    pvalues: Option<Vec<f64>>,
}
impl DiseaseTable {
    pub fn new(
        genes: Vec<String>,
        effects: Vec<EffectColumn>,
        pvalues: Option<Vec<f64>>,
    ) -> Result<Self> {
        if genes.is_empty() {
            return Err(CmapError::InputShape("disease table has no genes".into()));
        }
        if effects.is_empty() {
            return Err(CmapError::InputShape(
                "disease table has no effect-size columns".into(),
            ));
        }
        if let Some(bad) = effects.iter().find(|c| c.values.len() != genes.len()) {
            return Err(CmapError::InputShape(format!(
                "effect column {} has {} values for {} genes",
                bad.name,
                bad.values.len(),
                genes.len()
            )));
        }
        if let Some(p) = &pvalues {
            if p.len() != genes.len() {
                return Err(CmapError::InputShape(format!(
                    "p-value column has {} values for {} genes",
                    p.len(),
                    genes.len()
                )));
            }
        }
        Ok(Self {
            genes,
            effects,
            pvalues,
        })
    }

    pub fn genes(&self) -> &[String] {
        &self.genes
    }

    pub fn pvalues(&self) -> Option<&[f64]> {
        self.pvalues.as_deref()
    }

    /// All effect columns whose name starts with `prefix`
    pub fn effect_columns(&self, prefix: &str) -> Result<Vec<&EffectColumn>> {
        let columns = self
            .effects
            .iter()
            .filter(|c| c.name.starts_with(prefix))
            .collect::<Vec<_>>();
        if columns.is_empty() {
            return Err(CmapError::InputShape(format!(
                "no effect-size column with prefix {:?}",
                prefix
            )));
        }
        Ok(columns)
    }

    /// The effect column named exactly `name`
    pub fn effect_column(&self, name: &str) -> Result<&EffectColumn> {
        self.effects
            .iter()
            .find(|c| c.name == name)
            .ok_or_else(|| CmapError::InputShape(format!("no effect-size column {:?}", name)))
    }
}

/// How effect columns are combined into one value per gene
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SignatureStrategy {
    /// Mean of every column sharing `prefix`
    Average { prefix: String },
    /// A single column processed on its own
    Column { name: String },
}
impl SignatureStrategy {
    /// The per-gene effect sizes this strategy thresholds on
    pub fn effect_values(&self, table: &DiseaseTable) -> Result<Vec<f64>> {
        match self {
            SignatureStrategy::Average { prefix } => {
                let columns = table.effect_columns(prefix)?;
                let values = (0..table.genes.len())
                    .map(|i| {
                        let row = columns.iter().map(|c| c.values[i]).collect::<Vec<_>>();
                        arithmetic_mean(&row)
                    })
                    .collect();
                Ok(values)
            }
            SignatureStrategy::Column { name } => Ok(table.effect_column(name)?.values.clone()),
        }
    }

    /// Builds the signature for one cutoff
    ///
    /// Genes above `cutoff` are up, genes below `-cutoff` are down. Genes
    /// outside the library universe or failing `p_value_cutoff` are dropped.
    pub fn build_signature(
        &self,
        table: &DiseaseTable,
        cutoff: f64,
        p_value_cutoff: Option<f64>,
        library: &ProfileLibrary,
    ) -> Result<SignatureBuild> {
        let effects = self.effect_values(table)?;
        let pvalues = match p_value_cutoff {
            Some(_) => Some(table.pvalues().ok_or_else(|| {
                CmapError::InputShape("p-value cutoff set but table has no p-value column".into())
            })?),
            None => None,
        };

        let mut seen = HashSet::new();
        let mut up = Vec::new();
        let mut down = Vec::new();
        let mut pre_filter_gene_count = 0;
        for (i, gene) in table.genes.iter().enumerate() {
            let Some(index) = library.gene_index(gene) else {
                continue;
            };
            if !seen.insert(index) {
                continue;
            }
            pre_filter_gene_count += 1;

            let effect = effects[i];
            if !effect.is_finite() {
                continue;
            }
            if let (Some(pvalues), Some(threshold)) = (pvalues, p_value_cutoff) {
                let p = pvalues[i];
                if !p.is_finite() || p >= threshold {
                    continue;
                }
            }
            if effect > cutoff {
                up.push(index);
            } else if effect < -cutoff {
                down.push(index);
            }
        }

        Ok(SignatureBuild {
            signature: GeneSignature::new(cutoff, up, down),
            pre_filter_gene_count,
        })
    }
}

/// Disjoint up/down gene sets, as universe indices
#[derive(Debug, Clone, PartialEq, new)]
pub struct GeneSignature {
    pub cutoff: f64,
    pub up: Vec<usize>,
    pub down: Vec<usize>,
}
impl GeneSignature {
    /// Resolves identifiers against a library, dropping unknown genes
    ///
    /// A gene listed on both sides is kept only in the up set.
    pub fn from_ids(cutoff: f64, up: &[&str], down: &[&str], library: &ProfileLibrary) -> Self {
        let up = up
            .iter()
            .filter_map(|g| library.gene_index(g))
            .collect::<Vec<_>>();
        let up_set = up.iter().copied().collect::<HashSet<_>>();
        let down = down
            .iter()
            .filter_map(|g| library.gene_index(g))
            .filter(|i| !up_set.contains(i))
            .collect();
        Self { cutoff, up, down }
    }

    pub fn n_up(&self) -> usize {
        self.up.len()
    }

    pub fn n_down(&self) -> usize {
        self.down.len()
    }

    pub fn n_genes(&self) -> usize {
        self.up.len() + self.down.len()
    }

    pub fn is_empty(&self) -> bool {
        self.n_genes() == 0
    }
}

/// A built signature plus the universe-restricted gene count before filtering
#[derive(Debug, Clone)]
pub struct SignatureBuild {
    pub signature: GeneSignature,
    pub pre_filter_gene_count: usize,
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::library::tests::{genes, toy_library};

    pub fn toy_table() -> DiseaseTable {
        DiseaseTable::new(
            genes(&["A", "B", "C", "D", "E", "Z"]),
            vec![
                EffectColumn::new("logfc_1".into(), vec![2.0, 1.0, 0.0, -1.0, -3.0, 5.0]),
                EffectColumn::new("logfc_2".into(), vec![1.0, 0.5, 0.2, -0.5, -1.0, 5.0]),
            ],
            Some(vec![0.001, 0.2, 0.5, 0.01, 0.001, 0.001]),
        )
        .unwrap()
    }

    #[test]
    fn test_average_strategy() {
        let strategy = SignatureStrategy::Average {
            prefix: "logfc".into(),
        };
        let build = strategy
            .build_signature(&toy_table(), 0.5, None, &toy_library())
            .unwrap();
        // averages: A 1.5, B 0.75, C 0.1, D -0.75, E -2.0; Z not in the universe
        assert_eq!(build.signature.up, vec![0, 1]);
        assert_eq!(build.signature.down, vec![3, 4]);
        assert_eq!(build.pre_filter_gene_count, 5);
    }

    #[test]
    fn test_column_strategy_with_pvalue_filter() {
        let strategy = SignatureStrategy::Column {
            name: "logfc_1".into(),
        };
        let build = strategy
            .build_signature(&toy_table(), 0.5, Some(0.05), &toy_library())
            .unwrap();
        assert_eq!(build.signature.up, vec![0]);
        assert_eq!(build.signature.down, vec![3, 4]);
    }

    #[test]
    fn test_zero_cutoff_excludes_exact_zero() {
        let strategy = SignatureStrategy::Column {
            name: "logfc_1".into(),
        };
        let build = strategy
            .build_signature(&toy_table(), 0.0, None, &toy_library())
            .unwrap();
        assert_eq!(build.signature.n_genes(), 4);
    }

    #[test]
    fn test_missing_prefix_is_input_shape_error() {
        let strategy = SignatureStrategy::Average {
            prefix: "t_stat".into(),
        };
        let result = strategy.build_signature(&toy_table(), 0.5, None, &toy_library());
        assert!(matches!(result, Err(CmapError::InputShape(_))));
    }

    #[test]
    fn test_pvalue_cutoff_without_column() {
        let table = DiseaseTable::new(
            genes(&["A"]),
            vec![EffectColumn::new("logfc".into(), vec![1.0])],
            None,
        )
        .unwrap();
        let strategy = SignatureStrategy::Column {
            name: "logfc".into(),
        };
        let result = strategy.build_signature(&table, 0.5, Some(0.05), &toy_library());
        assert!(matches!(result, Err(CmapError::InputShape(_))));
    }

    #[test]
    fn test_from_ids_keeps_sets_disjoint() {
        let sig = GeneSignature::from_ids(0.0, &["A", "B", "Q"], &["B", "E"], &toy_library());
        assert_eq!(sig.up, vec![0, 1]);
        assert_eq!(sig.down, vec![4]);
    }
}
