//! Expression matrix preprocessing
//!
//! Filter out replicate columns and weakly expressed genes, align the
//! surviving samples with the clinical table, then reduce to scaled
//! highly variable genes. Each step returns a new table; the sample
//! alignment is established once here and never revisited downstream.

use crate::clinical::ClinicalTable;
use crate::feature_selection::{select_highly_variable_genes, HvgSelection};
use crate::pipeline_common::*;

#[derive(Args, Debug, Clone)]
pub struct PreprocessArgs {
    #[arg(
        long,
        short = 'x',
        required = true,
        help = "Expression matrix file (genes x samples)",
        long_help = "Expression matrix file (genes x samples).\n\
		     Delimited text (tab or comma), optionally gzipped.\n\
		     First header row: sample identifiers; first column:\n\
		     gene identifiers; `NA` marks a missing value.\n\
		     Values are assumed to be log2-scale expression."
    )]
    pub expression: Box<str>,

    #[arg(
        long,
        short = 'c',
        required = true,
        help = "Clinical annotation file",
        long_help = "Clinical annotation file (one row per sample).\n\
		     Column names are matched case-insensitively against\n\
		     the fixed clinical vocabulary; `NA` marks missing."
    )]
    pub clinical: Box<str>,

    #[arg(
        long,
        default_value = "repl",
        help = "Replicate sample-name pattern",
        long_help = "Substring marking technical replicate columns.\n\
		     Columns whose sample identifier contains this pattern\n\
		     are removed before any statistics are computed."
    )]
    pub replicate_pattern: Box<str>,

    #[arg(
        long,
        default_value_t = 0.0,
        help = "Minimum expression value counted as support"
    )]
    pub expr_floor: f32,

    #[arg(
        long,
        default_value_t = 0.1,
        help = "Fraction of samples that must reach the floor",
        long_help = "A gene is kept when at least ceil(n_samples * fraction)\n\
		     samples reach the expression floor. Raising the fraction\n\
		     can only shrink the retained gene set."
    )]
    pub min_sample_fraction: f32,

    #[arg(
        long,
        default_value_t = 1000,
        help = "Number of highly variable genes to keep"
    )]
    pub hvg: usize,

    #[arg(
        long,
        default_value_t = 0.3,
        help = "Loess span for the mean-variance trend"
    )]
    pub span: f32,
}

/// Everything the downstream branches consume
pub struct PreparedData {
    /// scaled highly variable genes x aligned samples
    pub scaled: MatWithNames,
    /// clinical rows aligned 1:1 with `scaled` columns
    pub clinical: ClinicalTable,
    /// per-gene selection statistics over the filtered matrix
    pub hvg: HvgSelection,
}

/// gene filtering summary for logging / QC
pub struct FilterSummary {
    pub kept: usize,
    pub removed: usize,
}

impl FilterSummary {
    pub fn pct_kept(&self) -> f64 {
        let total = self.kept + self.removed;
        if total == 0 {
            0.0
        } else {
            100.0 * self.kept as f64 / total as f64
        }
    }
}

/// Remove technical replicate columns by sample-name pattern match
pub fn drop_replicate_samples(expr: &MatWithNames, pattern: &str) -> (MatWithNames, usize) {
    let keep: Vec<usize> = (0..expr.ncols())
        .filter(|&j| !expr.cols[j].contains(pattern))
        .collect();
    let n_dropped = expr.ncols() - keep.len();
    (expr.select_columns(&keep), n_dropped)
}

/// Keep genes reaching `floor` in at least `ceil(n * fraction)` samples
pub fn filter_low_expression(
    expr: &MatWithNames,
    floor: f32,
    min_fraction: f32,
) -> anyhow::Result<(MatWithNames, FilterSummary)> {
    if !(0.0..=1.0).contains(&min_fraction) {
        anyhow::bail!(
            "expression filter: min sample fraction must be in [0, 1], got {}",
            min_fraction
        );
    }

    let min_count = (expr.ncols() as f64 * min_fraction as f64).ceil() as usize;
    let support = expr.row_support(floor);

    let keep: Vec<usize> = (0..expr.nrows())
        .filter(|&i| support[i] >= min_count)
        .collect();

    if keep.is_empty() {
        anyhow::bail!(
            "expression filter removed every gene \
	     (floor {}, fraction {} -> {} of {} samples); \
	     relax the filter configuration",
            floor,
            min_fraction,
            min_count,
            expr.ncols()
        );
    }

    let summary = FilterSummary {
        kept: keep.len(),
        removed: expr.nrows() - keep.len(),
    };

    Ok((expr.select_rows(&keep), summary))
}

/// Subset both tables to the intersection of expression columns and
/// clinical sample ids, in expression column order.
pub fn align_samples(
    expr: &MatWithNames,
    clinical: &ClinicalTable,
) -> anyhow::Result<(MatWithNames, ClinicalTable)> {
    let clinical_idx = clinical.sample_index_map();

    let mut expr_keep = Vec::new();
    let mut clinical_keep = Vec::new();
    for (j, name) in expr.cols.iter().enumerate() {
        if let Some(&i) = clinical_idx.get(name.as_ref()) {
            expr_keep.push(j);
            clinical_keep.push(i);
        }
    }

    if expr_keep.is_empty() {
        anyhow::bail!(
            "sample alignment: no overlap between {} expression columns \
	     and {} clinical samples",
            expr.ncols(),
            clinical.len()
        );
    }

    Ok((expr.select_columns(&expr_keep), clinical.subset(&clinical_keep)))
}

///
/// Run the full preprocessing chain: load both inputs, drop replicate
/// columns, filter weakly expressed genes, align samples, select
/// highly variable genes, and standardize their rows.
///
pub fn prepare(args: &PreprocessArgs) -> anyhow::Result<PreparedData> {
    let expr = MatWithNames::from_tsv(&args.expression)?;
    info!(
        "loaded expression matrix: {} genes x {} samples",
        expr.nrows(),
        expr.ncols()
    );

    let clinical = ClinicalTable::from_delim(&args.clinical)?;

    let (expr, n_repl) = drop_replicate_samples(&expr, &args.replicate_pattern);
    info!(
        "removed {} replicate column(s) matching '{}'",
        n_repl, args.replicate_pattern
    );

    let (expr, summary) = filter_low_expression(&expr, args.expr_floor, args.min_sample_fraction)?;
    info!(
        "expression filter: kept {} genes, removed {} ({:.1}% kept)",
        summary.kept,
        summary.removed,
        summary.pct_kept()
    );

    let (expr, clinical) = align_samples(&expr, &clinical)?;
    info!(
        "aligned {} samples shared by expression and clinical tables",
        expr.ncols()
    );

    let subtype = clinical.subtype()?;
    let dist: Vec<String> = subtype
        .levels
        .iter()
        .zip(subtype.counts().iter())
        .map(|(level, n)| format!("{} {}", level, n))
        .collect();
    info!("subtype distribution: {}", dist.join(", "));

    let age = clinical.numeric("age_at_diagnosis")?;
    let known: Vec<f32> = age.iter().flatten().copied().collect();
    if !known.is_empty() {
        info!(
            "mean age at diagnosis: {:.1} ({} known)",
            known.iter().sum::<f32>() / known.len() as f32,
            known.len()
        );
    }

    let hvg = select_highly_variable_genes(&expr, args.hvg, args.span)?;
    debug_assert_eq!(hvg.names.len(), hvg.indices.len());

    let selected = expr.select_rows(&hvg.indices);
    let scaled = selected.standardize_rows();
    if scaled.n_dropped > 0 {
        info!(
            "dropped {} zero-variance row(s) during standardization",
            scaled.n_dropped
        );
    }

    Ok(PreparedData {
        scaled: scaled.out,
        clinical,
        hvg,
    })
}
