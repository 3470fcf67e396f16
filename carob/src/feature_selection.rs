//! Highly variable gene selection
//!
//! Genes are ranked by how much their observed expression variance
//! exceeds the variance expected at their mean expression level. The
//! expectation comes from a loess fit of variance on mean across all
//! genes; the ratio observed/expected is the ranking statistic.

use crate::pipeline_common::*;
use table_util::common_io::write_types;
use table_util::loess::loess_fit;

/// Per-gene selection statistics over the filtered matrix
pub struct HvgSelection {
    /// selected row indices into the filtered matrix, ascending
    pub indices: Vec<usize>,
    /// gene identifiers matching `indices`
    pub names: Vec<Box<str>>,
    /// all gene identifiers of the candidate universe
    pub genes: Vec<Box<str>>,
    pub mean: Vec<f32>,
    pub variance: Vec<f32>,
    /// loess-fitted expected variance at each gene's mean
    pub expected: Vec<f32>,
    /// observed / expected variance; degenerate values become 0
    pub ratio: Vec<f32>,
    pub selected: Vec<bool>,
}

impl HvgSelection {
    /// Write the per-gene QC table (one row per candidate gene)
    pub fn write_qc(&self, file: &str) -> anyhow::Result<()> {
        let mut lines: Vec<Box<str>> = Vec::with_capacity(self.genes.len() + 1);
        lines.push("gene\tmean\tvariance\texpected_variance\tratio\tselected".into());
        for i in 0..self.genes.len() {
            lines.push(
                format!(
                    "{}\t{}\t{}\t{}\t{}\t{}",
                    self.genes[i],
                    fmt_stat(self.mean[i]),
                    fmt_stat(self.variance[i]),
                    fmt_stat(self.expected[i]),
                    fmt_stat(self.ratio[i]),
                    if self.selected[i] { 1 } else { 0 }
                )
                .into_boxed_str(),
            );
        }
        write_types(&lines, file)
    }
}

fn fmt_stat(x: f32) -> String {
    if x.is_finite() {
        format!("{:.6}", x)
    } else {
        "NA".to_string()
    }
}

///
/// Rank every gene of the filtered matrix by its standardized variance
/// ratio and keep the top `top_n`.
///
/// Ratios that cannot be computed (non-finite inputs, degenerate
/// expected variance) are set to zero so the gene stays in the
/// candidate universe as least informative. The descending sort is
/// stable, so ties keep their original row order.
///
pub fn select_highly_variable_genes(
    expr: &MatWithNames,
    top_n: usize,
    span: f32,
) -> anyhow::Result<HvgSelection> {
    let n_genes = expr.nrows();
    if top_n == 0 {
        anyhow::bail!("feature selection: top_n must be >= 1");
    }
    if top_n > n_genes {
        anyhow::bail!(
            "feature selection: top_n {} exceeds {} candidate genes",
            top_n,
            n_genes
        );
    }

    let (mean, variance) = expr.row_mean_variance();

    // fit the trend only where both statistics exist
    let fit_idx: Vec<usize> = (0..n_genes)
        .filter(|&i| mean[i].is_finite() && variance[i].is_finite())
        .collect();
    if fit_idx.len() < 2 {
        anyhow::bail!(
            "feature selection: only {} gene(s) with finite mean/variance",
            fit_idx.len()
        );
    }

    let fit_x: Vec<f32> = fit_idx.iter().map(|&i| mean[i]).collect();
    let fit_y: Vec<f32> = fit_idx.iter().map(|&i| variance[i]).collect();
    let fitted = loess_fit(&fit_x, &fit_y, span)?;

    let mut expected = vec![f32::NAN; n_genes];
    for (&i, &f) in fit_idx.iter().zip(fitted.iter()) {
        expected[i] = f;
    }

    let ratio: Vec<f32> = (0..n_genes)
        .map(|i| {
            let e = expected[i];
            let v = variance[i];
            if e.is_finite() && e > 0.0 && v.is_finite() {
                let r = v / e;
                if r.is_finite() {
                    r
                } else {
                    0.0
                }
            } else {
                0.0
            }
        })
        .collect();

    // stable descending sort: ties keep original row order
    let mut order: Vec<usize> = (0..n_genes).collect();
    order.sort_by(|&a, &b| {
        ratio[b]
            .partial_cmp(&ratio[a])
            .unwrap_or(std::cmp::Ordering::Equal)
    });

    let mut selected = vec![false; n_genes];
    for &i in order.iter().take(top_n) {
        selected[i] = true;
    }

    let mut indices: Vec<usize> = order[..top_n].to_vec();
    indices.sort_unstable();
    let names: Vec<Box<str>> = indices.iter().map(|&i| expr.rows[i].clone()).collect();

    info!(
        "selected {} / {} highly variable genes (span {})",
        top_n, n_genes, span
    );

    Ok(HvgSelection {
        indices,
        names,
        genes: expr.rows.clone(),
        mean,
        variance,
        expected,
        ratio,
        selected,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use table_util::dmatrix_util::Mat;

    fn matrix_from_rows(rows: &[Vec<f32>]) -> MatWithNames {
        let nrow = rows.len();
        let ncol = rows[0].len();
        let mat = Mat::from_row_iterator(nrow, ncol, rows.iter().flatten().copied());
        MatWithNames::new(
            (0..nrow).map(|i| format!("g{}", i).into_boxed_str()).collect(),
            (0..ncol).map(|j| format!("s{}", j).into_boxed_str()).collect(),
            mat,
        )
        .unwrap()
    }

    fn spread(center: f32, amplitude: f32, n: usize) -> Vec<f32> {
        (0..n)
            .map(|j| center + amplitude * if j % 2 == 0 { 1.0 } else { -1.0 })
            .collect()
    }

    #[test]
    fn exact_count_and_subset_invariants() {
        let rows: Vec<Vec<f32>> = (0..30)
            .map(|i| spread(5.0, 0.2 + 0.01 * i as f32, 20))
            .collect();
        let expr = matrix_from_rows(&rows);

        let sel = select_highly_variable_genes(&expr, 7, 0.5).unwrap();
        assert_eq!(sel.indices.len(), 7);
        assert_eq!(sel.names.len(), 7);
        assert!(sel.indices.iter().all(|&i| i < expr.nrows()));
        assert_eq!(sel.selected.iter().filter(|&&s| s).count(), 7);
    }

    #[test]
    fn full_ranking_returns_every_gene() {
        let rows: Vec<Vec<f32>> = (0..10)
            .map(|i| spread(3.0, 0.5 + 0.1 * i as f32, 15))
            .collect();
        let expr = matrix_from_rows(&rows);

        let sel = select_highly_variable_genes(&expr, 10, 0.5).unwrap();
        assert_eq!(sel.indices, (0..10).collect::<Vec<_>>());
    }

    #[test]
    fn high_variance_outlier_is_picked_first() {
        // same mean everywhere; one gene swings far harder
        let mut rows: Vec<Vec<f32>> = (0..20).map(|_| spread(5.0, 0.1, 24)).collect();
        rows[13] = spread(5.0, 4.0, 24);
        let expr = matrix_from_rows(&rows);

        let sel = select_highly_variable_genes(&expr, 1, 0.5).unwrap();
        assert_eq!(sel.indices, vec![13]);
    }

    #[test]
    fn constant_genes_stay_in_universe_with_zero_ratio() {
        let mut rows: Vec<Vec<f32>> = (0..10).map(|_| spread(4.0, 1.0, 12)).collect();
        rows[3] = vec![4.0; 12]; // zero variance
        let expr = matrix_from_rows(&rows);

        let sel = select_highly_variable_genes(&expr, 9, 0.5).unwrap();
        assert_eq!(sel.ratio[3], 0.0);
        assert!(!sel.selected[3], "zero-ratio gene ranks last");
        assert_eq!(sel.indices.len(), 9);
    }

    #[test]
    fn ties_keep_original_row_order() {
        // identical rows: every ratio is exactly 1.0
        let rows: Vec<Vec<f32>> = (0..6).map(|_| spread(2.0, 1.0, 10)).collect();
        let expr = matrix_from_rows(&rows);

        let sel = select_highly_variable_genes(&expr, 3, 1.0).unwrap();
        assert_eq!(sel.indices, vec![0, 1, 2]);
    }

    #[test]
    fn oversized_top_n_is_a_configuration_error() {
        let rows: Vec<Vec<f32>> = (0..5).map(|_| spread(2.0, 1.0, 10)).collect();
        let expr = matrix_from_rows(&rows);

        assert!(select_highly_variable_genes(&expr, 6, 0.3).is_err());
        assert!(select_highly_variable_genes(&expr, 0, 0.3).is_err());
    }

    #[test]
    fn qc_table_lists_every_candidate() {
        let rows: Vec<Vec<f32>> = (0..8).map(|i| spread(1.0, 0.3 + 0.1 * i as f32, 10)).collect();
        let expr = matrix_from_rows(&rows);
        let sel = select_highly_variable_genes(&expr, 4, 0.5).unwrap();

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("hvg.tsv");
        sel.write_qc(path.to_str().unwrap()).unwrap();

        let text = std::fs::read_to_string(&path).unwrap();
        assert_eq!(text.lines().count(), 9);
        assert!(text.starts_with("gene\tmean"));
    }
}
