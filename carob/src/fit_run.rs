//! Full pipeline command: one batch pass over both branches
//!
//! Preprocesses once, then runs the clustering branch and the balanced
//! cross-validation branch on the same prepared tables.

use crate::fit_clustering::{cluster_branch, ClusterOpts};
use crate::fit_crossval::{crossval_branch, CrossvalOpts};
use crate::pipeline_common::*;
use crate::routines_pre_process::{prepare, PreprocessArgs};

#[derive(Args, Debug)]
pub struct RunArgs {
    #[command(flatten)]
    pub data: PreprocessArgs,

    #[command(flatten)]
    pub cluster: ClusterOpts,

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
		     - {out}.pca.tsv: sample embedding coordinates\n\
		     - {out}.clusters.tsv: cluster assignments per tested k\n\
		     - {out}.cv_summary.tsv: fold-aggregated metrics\n\
		     - {out}.top_genes.tsv: feature importance ranking"
    )]
    pub out: Box<str>,
}

pub fn run_pipeline(args: &RunArgs) -> anyhow::Result<()> {
    env_logger::try_init().ok();

    let prepared = prepare(&args.data)?;
    prepared
        .hvg
        .write_qc(&format!("{}.gene_variance.tsv", args.out))?;

    cluster_branch(&prepared, &args.cluster, &args.out)?;
    crossval_branch(&prepared, &args.crossval, &args.out)?;

    info!("pipeline finished for prefix {}", args.out);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::SmallRng;
    use rand::SeedableRng;
    use rand_distr::{Distribution, Normal};
    use std::fmt::Write as _;

    const N_GENES: usize = 100;
    const N_SAMPLES: usize = 50;

    /// Synthetic cohort: 3 subtype groups (17/17/16) with group-shifted
    /// expression on a third of the genes, gene 0 constant at 5.0, and
    /// two technical replicate columns that must be filtered away.
    fn write_inputs(dir: &std::path::Path) -> (String, String) {
        let mut rng = SmallRng::seed_from_u64(1234);
        let noise = Normal::new(0.0_f32, 0.5).unwrap();

        let group_of = |j: usize| -> usize {
            if j < 17 {
                0
            } else if j < 34 {
                1
            } else {
                2
            }
        };

        let mut expr = String::new();
        expr.push_str("gene");
        for j in 0..N_SAMPLES {
            write!(expr, "\tS{:02}", j).unwrap();
        }
        expr.push_str("\tS00repl\tS01repl\n");

        for i in 0..N_GENES {
            write!(expr, "g{:03}", i).unwrap();
            for j in 0..N_SAMPLES + 2 {
                let g = group_of(j.min(N_SAMPLES - 1));
                let value = if i == 0 {
                    5.0
                } else if i % 3 == 0 {
                    // informative gene: group-specific mean shift
                    6.0 + 2.0 * g as f32 + noise.sample(&mut rng)
                } else {
                    4.0 + noise.sample(&mut rng)
                };
                write!(expr, "\t{:.4}", value).unwrap();
            }
            expr.push('\n');
        }

        let mut clinical = String::from(
            "sample,instrument model,age at diagnosis,tumor size,lymph node status,\
er status,pgr status,her2 status,ki67 status,nhg,pam50 subtype,\
overall survival days,overall survival event\n",
        );
        let subtypes = ["LumA", "LumB", "Basal"];
        for j in 0..N_SAMPLES {
            writeln!(
                clinical,
                "S{:02},HiSeq 2000,{},{},NodeNegative,1,1,0,1,2,{},1000,0",
                j,
                45 + j % 30,
                10 + j % 25,
                subtypes[group_of(j)]
            )
            .unwrap();
        }

        let expr_path = dir.join("expr.tsv");
        let clinical_path = dir.join("clinical.csv");
        std::fs::write(&expr_path, expr).unwrap();
        std::fs::write(&clinical_path, clinical).unwrap();
        (
            expr_path.to_str().unwrap().to_string(),
            clinical_path.to_str().unwrap().to_string(),
        )
    }

    fn test_args(expr: &str, clinical: &str, out: &str) -> RunArgs {
        RunArgs {
            data: PreprocessArgs {
                expression: expr.into(),
                clinical: clinical.into(),
                replicate_pattern: "repl".into(),
                expr_floor: 0.0,
                min_sample_fraction: 0.1,
                hvg: N_GENES, // full ranking keeps the constant gene
                span: 0.3,
            },
            cluster: ClusterOpts {
                num_pc: 10,
                kmin: 2,
                kmax: 4,
                max_iter: 50,
            },
            crossval: CrossvalOpts {
                folds: 5,
                trees: 20,
                mtry: 0,
                max_depth: 8,
                final_fold: 0,
                top_genes: 50,
                seed: 42,
            },
            out: out.into(),
        }
    }

    #[test]
    fn prepared_data_drops_replicates_and_constant_gene() {
        let dir = tempfile::tempdir().unwrap();
        let (expr, clinical) = write_inputs(dir.path());
        let args = test_args(&expr, &clinical, "unused");

        let prepared = prepare(&args.data).unwrap();

        // 52 columns minus 2 replicates, all aligned with clinical rows
        assert_eq!(prepared.scaled.ncols(), N_SAMPLES);
        assert_eq!(prepared.clinical.len(), N_SAMPLES);

        // gene 0 survives the expression filter (5.0 >= 0 everywhere)
        // and the full-ranking selection, but the scaler drops it
        assert_eq!(prepared.hvg.indices.len(), N_GENES);
        assert!(!prepared.scaled.rows.contains(&Box::from("g000")));
        assert_eq!(prepared.scaled.nrows(), N_GENES - 1);
    }

    #[test]
    fn full_pipeline_writes_all_artifacts() {
        let dir = tempfile::tempdir().unwrap();
        let (expr, clinical) = write_inputs(dir.path());
        let out = dir.path().join("result");
        let args = test_args(&expr, &clinical, out.to_str().unwrap());

        run_pipeline(&args).unwrap();

        let read = |suffix: &str| -> String {
            std::fs::read_to_string(format!("{}{}", out.to_str().unwrap(), suffix)).unwrap()
        };

        // cluster assignment table: one line per aligned sample
        let clusters = read(".clusters.tsv");
        assert_eq!(clusters.lines().count(), N_SAMPLES + 1);
        assert!(clusters.starts_with("sample\tsubtype\tkmeans_2"));

        // cross-validation summary: three metric rows, values in [0, 1]
        let summary = read(".cv_summary.tsv");
        let lines: Vec<&str> = summary.lines().collect();
        assert_eq!(lines.len(), 4);
        for line in &lines[1..] {
            let fields: Vec<&str> = line.split('\t').collect();
            let mean: f64 = fields[1].parse().unwrap();
            let sd: f64 = fields[2].parse().unwrap();
            assert!((0.0..=1.0).contains(&mean), "{}", line);
            assert!(sd >= 0.0);
        }

        // importance table: header + top 50 genes
        let top = read(".top_genes.tsv");
        assert_eq!(top.lines().count(), 51);

        // QC supplements
        assert_eq!(read(".gene_variance.tsv").lines().count(), N_GENES + 1);
        assert_eq!(read(".pca.tsv").lines().count(), N_SAMPLES + 1);
    }

    #[test]
    fn same_seed_rewrites_identical_summary() {
        let dir = tempfile::tempdir().unwrap();
        let (expr, clinical) = write_inputs(dir.path());

        let out_a = dir.path().join("a");
        let out_b = dir.path().join("b");
        let args_a = test_args(&expr, &clinical, out_a.to_str().unwrap());
        let args_b = test_args(&expr, &clinical, out_b.to_str().unwrap());

        let prepared = prepare(&args_a.data).unwrap();
        crossval_branch(&prepared, &args_a.crossval, args_a.out.as_ref()).unwrap();
        crossval_branch(&prepared, &args_b.crossval, args_b.out.as_ref()).unwrap();

        let a = std::fs::read_to_string(format!("{}.cv_summary.tsv", args_a.out)).unwrap();
        let b = std::fs::read_to_string(format!("{}.cv_summary.tsv", args_b.out)).unwrap();
        assert_eq!(a, b);

        let a = std::fs::read_to_string(format!("{}.top_genes.tsv", args_a.out)).unwrap();
        let b = std::fs::read_to_string(format!("{}.top_genes.tsv", args_b.out)).unwrap();
        assert_eq!(a, b);
    }
}
