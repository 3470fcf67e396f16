//! Cross-validation command: balanced supervised evaluation
//!
//! Balances the subtype classes by undersampling, runs stratified
//! K-fold cross-validation of the random forest classifier, then
//! trains a final model on one fold's training split and scores it on
//! every remaining labeled sample, reporting feature importance.

use crate::balance::balance_classes;
use crate::crossval::{cross_validate, final_holdout};
use crate::forest::{FeatureImportance, ForestConfig};
use crate::pipeline_common::*;
use crate::routines_pre_process::{prepare, PreparedData, PreprocessArgs};
use rand::rngs::StdRng;
use rand::SeedableRng;
use std::collections::HashMap;
use table_util::common_io::write_types;

#[derive(Args, Debug, Clone)]
pub struct CrossvalOpts {
    #[arg(long, default_value_t = 5, help = "Cross-validation fold count")]
    pub folds: usize,

    #[arg(long, default_value_t = 500, help = "Trees per random forest")]
    pub trees: usize,

    #[arg(
        long,
        default_value_t = 0,
        help = "Features tried per split (0 = sqrt of the gene count)"
    )]
    pub mtry: usize,

    #[arg(long, default_value_t = 32, help = "Maximum tree depth")]
    pub max_depth: usize,

    #[arg(
        long,
        default_value_t = 0,
        help = "Designated fold for the final model",
        long_help = "The final model trains on this fold's training split of\n\
		     the balanced set and is scored on every labeled sample\n\
		     outside that split."
    )]
    pub final_fold: usize,

    #[arg(
        long,
        default_value_t = 50,
        help = "Genes kept in the importance table"
    )]
    pub top_genes: usize,

    #[arg(
        long,
        default_value_t = 42,
        help = "Random seed",
        long_help = "Random seed driving class balancing, fold assignment,\n\
		     and forest fitting. Two runs with the same seed and the\n\
		     same inputs produce identical outputs."
    )]
    pub seed: u64,
}

#[derive(Args, Debug)]
pub struct CrossvalArgs {
    #[command(flatten)]
    pub data: PreprocessArgs,

    #[command(flatten)]
    pub crossval: CrossvalOpts,

    #[arg(
        long,
        short = 'o',
        required = true,
        help = "Output file prefix",
        long_help = "Output file prefix.\n\n\
		     Generates:\n\
		     - {out}.gene_variance.tsv: per-gene selection statistics\n\
		     - {out}.cv_summary.tsv: fold-aggregated metrics\n\
		     - {out}.top_genes.tsv: feature importance ranking"
    )]
    pub out: Box<str>,
}

pub fn run_crossval(args: &CrossvalArgs) -> anyhow::Result<()> {
    env_logger::try_init().ok();

    let prepared = prepare(&args.data)?;
    prepared
        .hvg
        .write_qc(&format!("{}.gene_variance.tsv", args.out))?;

    crossval_branch(&prepared, &args.crossval, &args.out)
}

/// The balanced evaluation branch over prepared data
pub fn crossval_branch(
    prepared: &PreparedData,
    opts: &CrossvalOpts,
    out: &str,
) -> anyhow::Result<()> {
    let subtype = prepared.clinical.subtype()?;

    // supervised universe: samples with a known subtype label
    let x_all = prepared.scaled.transposed();
    let labeled: Vec<usize> = (0..x_all.nrows())
        .filter(|&i| subtype.codes[i].is_some())
        .collect();
    let x_sup = x_all.select_rows(&labeled);
    let labels: Vec<usize> = labeled
        .iter()
        .map(|&i| subtype.codes[i].map(|c| c as usize).unwrap_or(0))
        .collect();
    info!(
        "{} of {} samples carry a subtype label",
        labeled.len(),
        x_all.nrows()
    );

    let mut rng = StdRng::seed_from_u64(opts.seed);

    let balanced = balance_classes(subtype, &mut rng)?;
    info!(
        "balanced set: {} classes x {} samples",
        balanced.class_codes.len(),
        balanced.per_class
    );

    // balanced indices live in the working sample space; move them
    // into the labeled subspace
    let sup_pos: HashMap<usize, usize> = labeled
        .iter()
        .enumerate()
        .map(|(pos, &i)| (i, pos))
        .collect();
    let bal_sup: Vec<usize> = balanced
        .indices
        .iter()
        .map(|i| sup_pos[i])
        .collect();

    let forest_cfg = ForestConfig {
        num_trees: opts.trees,
        mtry: opts.mtry,
        max_depth: opts.max_depth,
        min_leaf: 1,
        seed: opts.seed,
    };

    let x_bal = x_sup.select_rows(&bal_sup);
    let y_bal: Vec<usize> = bal_sup.iter().map(|&i| labels[i]).collect();

    let summary = cross_validate(&x_bal.mat, &y_bal, opts.folds, &forest_cfg, &mut rng)?;
    info!(
        "cross-validation: accuracy {:.3} +/- {:.3}, balanced {:.3} +/- {:.3}, macro-F1 {:.3} +/- {:.3}",
        summary.accuracy.mean,
        summary.accuracy.sd,
        summary.balanced_accuracy.mean,
        summary.balanced_accuracy.sd,
        summary.macro_f1.mean,
        summary.macro_f1.sd
    );

    let summary_file = format!("{}.cv_summary.tsv", out);
    summary.write_tsv(&summary_file)?;
    info!("wrote cross-validation summary to {}", summary_file);

    let report = final_holdout(
        &x_sup.mat,
        &labels,
        &bal_sup,
        opts.folds,
        opts.final_fold,
        &forest_cfg,
        &mut rng,
    )?;
    info!(
        "final model confusion matrix:\n{}",
        report.record.confusion.render(&subtype.levels)
    );
    let cm = &report.record.confusion;
    for c in 0..cm.n_classes() {
        if cm.support(c) == 0 {
            continue;
        }
        info!(
            "class '{}': sensitivity {:.3}, specificity {:.3}, precision {:.3}, F1 {:.3}",
            subtype.levels.get(c).map(|x| x.as_ref()).unwrap_or("?"),
            cm.sensitivity(c),
            cm.specificity(c),
            cm.precision(c),
            cm.f1(c)
        );
    }

    let genes_file = format!("{}.top_genes.tsv", out);
    write_top_genes(&genes_file, &x_sup.cols, &report.importance, opts.top_genes)?;
    info!("wrote top gene importance to {}", genes_file);

    Ok(())
}

/// Write the importance table ranked by mean decrease in accuracy
fn write_top_genes(
    file: &str,
    genes: &[Box<str>],
    importance: &FeatureImportance,
    top_n: usize,
) -> anyhow::Result<()> {
    let mut order: Vec<usize> = (0..genes.len()).collect();
    order.sort_by(|&a, &b| {
        importance.mean_decrease_accuracy[b]
            .partial_cmp(&importance.mean_decrease_accuracy[a])
            .unwrap_or(std::cmp::Ordering::Equal)
    });

    let mut lines: Vec<Box<str>> = Vec::with_capacity(top_n + 1);
    lines.push("gene\tmean_decrease_accuracy\tmean_decrease_impurity".into());
    for &g in order.iter().take(top_n) {
        lines.push(
            format!(
                "{}\t{:.6}\t{:.6}",
                genes[g],
                importance.mean_decrease_accuracy[g],
                importance.mean_decrease_impurity[g]
            )
            .into_boxed_str(),
        );
    }
    write_types(&lines, file)
}
