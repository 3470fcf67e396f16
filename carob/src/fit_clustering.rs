//! Clustering command: embed the scaled expression and cluster it
//!
//! Produces the PCA coordinate table and the cluster assignment table
//! (k-means and Ward at every tested k) with subtype agreement logged.

use crate::cluster::*;
use crate::pipeline_common::*;
use crate::routines_pre_process::{prepare, PreparedData, PreprocessArgs};
use table_util::pca::principal_components;

#[derive(Args, Debug, Clone)]
pub struct ClusterOpts {
    #[arg(
        long,
        default_value_t = 50,
        help = "Number of principal components",
        long_help = "Number of principal components for the sample embedding.\n\
		     Capped by the matrix rank; clustering runs on these\n\
		     coordinates rather than the full gene space."
    )]
    pub num_pc: usize,

    #[arg(long, default_value_t = 2, help = "Smallest cluster count to test")]
    pub kmin: usize,

    #[arg(long, default_value_t = 6, help = "Largest cluster count to test")]
    pub kmax: usize,

    #[arg(long, default_value_t = 100, help = "Maximum k-means iterations")]
    pub max_iter: usize,
}

#[derive(Args, Debug)]
pub struct ClusteringArgs {
    #[command(flatten)]
    pub data: PreprocessArgs,

    #[command(flatten)]
    pub cluster: ClusterOpts,

    #[arg(
        long,
        short = 'o',
        required = true,
        help = "Output file prefix",
        long_help = "Output file prefix.\n\n\
		     Generates:\n\
		     - {out}.gene_variance.tsv: per-gene selection statistics\n\
		     - {out}.pca.tsv: sample embedding coordinates\n\
		     - {out}.clusters.tsv: cluster assignments per tested k"
    )]
    pub out: Box<str>,
}

pub fn run_clustering(args: &ClusteringArgs) -> anyhow::Result<()> {
    env_logger::try_init().ok();

    let prepared = prepare(&args.data)?;
    prepared
        .hvg
        .write_qc(&format!("{}.gene_variance.tsv", args.out))?;

    cluster_branch(&prepared, &args.cluster, &args.out)
}

/// The embedding + clustering branch over prepared data
pub fn cluster_branch(
    prepared: &PreparedData,
    opts: &ClusterOpts,
    out: &str,
) -> anyhow::Result<()> {
    // observations are samples
    let points = prepared.scaled.transposed();

    let pca = principal_components(&points.mat, opts.num_pc)?;
    info!(
        "embedded {} samples into {} components ({:.1}% variance in the first two)",
        points.nrows(),
        pca.coords.ncols(),
        100.0 * (pca.explained.first().copied().unwrap_or(0.0)
            + pca.explained.get(1).copied().unwrap_or(0.0))
    );

    let pc_names: Vec<Box<str>> = (1..=pca.coords.ncols())
        .map(|c| format!("PC{}", c).into_boxed_str())
        .collect();
    let pca_table = MatWithNames::new(points.rows.clone(), pc_names, pca.coords.clone())?;
    let pca_file = format!("{}.pca.tsv", out);
    pca_table.to_tsv(&pca_file, "sample")?;
    info!("wrote sample embedding to {}", pca_file);

    let assign = cluster_embedded_samples(&pca.coords, opts.kmin, opts.kmax, opts.max_iter)?;

    let subtype = prepared.clinical.subtype()?;
    for a in agreement_with_subtype(&assign, subtype)? {
        info!(
            "k = {}: ARI vs subtype: k-means {:.3}, hierarchical {:.3}",
            a.k, a.kmeans_ari, a.hclust_ari
        );
    }

    let cluster_file = format!("{}.clusters.tsv", out);
    write_cluster_table(&cluster_file, &points.rows, subtype, &assign)?;
    info!("wrote cluster assignments to {}", cluster_file);

    Ok(())
}
