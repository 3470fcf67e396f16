//! Unsupervised clustering over the embedded samples
//!
//! K-means and Ward hierarchical clustering at every tested cluster
//! count, with adjusted-Rand agreement against the subtype labels as
//! a QC readout. This branch never feeds the supervised evaluation.

use crate::clinical::CategoricalColumn;
use crate::metrics::adjusted_rand_index;
use crate::pipeline_common::*;
use table_util::clustering::{hierarchical_rows, Kmeans, KmeansArgs, Linkage};
use table_util::common_io::write_types;

/// Cluster assignments for every tested k
pub struct ClusterAssignments {
    pub ks: Vec<usize>,
    /// k-means labels per tested k, one label per sample
    pub kmeans: Vec<Vec<usize>>,
    /// Ward hierarchical labels per tested k
    pub hclust: Vec<Vec<usize>>,
}

/// Agreement of both partitions with the reference labels at one k
pub struct Agreement {
    pub k: usize,
    pub kmeans_ari: f64,
    pub hclust_ari: f64,
}

///
/// Cluster the embedded samples at every `k` in `[kmin, kmax]`.
///
/// * `coords` - samples x embedding dimensions
pub fn cluster_embedded_samples(
    coords: &Mat,
    kmin: usize,
    kmax: usize,
    max_iter: usize,
) -> anyhow::Result<ClusterAssignments> {
    let n = coords.nrows();
    if kmin < 2 || kmin > kmax {
        anyhow::bail!(
            "clustering: need 2 <= kmin <= kmax, got [{}, {}]",
            kmin,
            kmax
        );
    }
    if kmax > n {
        anyhow::bail!("clustering: kmax {} exceeds {} samples", kmax, n);
    }

    let tree = hierarchical_rows(coords, Linkage::Ward)?;

    let ks: Vec<usize> = (kmin..=kmax).collect();
    let mut kmeans = Vec::with_capacity(ks.len());
    let mut hclust = Vec::with_capacity(ks.len());
    for &k in &ks {
        let labels = coords.kmeans_rows(KmeansArgs {
            num_clusters: k,
            max_iter,
        });
        kmeans.push(labels);
        hclust.push(tree.cut(k)?);
    }

    info!(
        "clustered {} samples at k = {}..{} (k-means and Ward)",
        n, kmin, kmax
    );

    Ok(ClusterAssignments { ks, kmeans, hclust })
}

///
/// Adjusted Rand index of every partition against the subtype labels,
/// computed over samples with a known subtype.
///
pub fn agreement_with_subtype(
    assign: &ClusterAssignments,
    subtype: &CategoricalColumn,
) -> anyhow::Result<Vec<Agreement>> {
    let labeled: Vec<usize> = (0..subtype.codes.len())
        .filter(|&i| subtype.codes[i].is_some())
        .collect();
    if labeled.len() < 2 {
        anyhow::bail!("cluster agreement: fewer than 2 labeled samples");
    }

    let truth: Vec<usize> = labeled
        .iter()
        .map(|&i| subtype.codes[i].map(|c| c as usize).unwrap_or(0))
        .collect();

    let mut out = Vec::with_capacity(assign.ks.len());
    for (pos, &k) in assign.ks.iter().enumerate() {
        let km: Vec<usize> = labeled.iter().map(|&i| assign.kmeans[pos][i]).collect();
        let hc: Vec<usize> = labeled.iter().map(|&i| assign.hclust[pos][i]).collect();
        out.push(Agreement {
            k,
            kmeans_ari: adjusted_rand_index(&truth, &km)?,
            hclust_ari: adjusted_rand_index(&truth, &hc)?,
        });
    }
    Ok(out)
}

///
/// Write the cluster assignment table: sample id, subtype label, one
/// k-means and one hierarchical column per tested k.
///
pub fn write_cluster_table(
    file: &str,
    samples: &[Box<str>],
    subtype: &CategoricalColumn,
    assign: &ClusterAssignments,
) -> anyhow::Result<()> {
    let mut header = String::from("sample\tsubtype");
    for &k in &assign.ks {
        header.push_str(&format!("\tkmeans_{}", k));
    }
    for &k in &assign.ks {
        header.push_str(&format!("\thclust_{}", k));
    }

    let mut lines: Vec<Box<str>> = Vec::with_capacity(samples.len() + 1);
    lines.push(header.into_boxed_str());

    for (i, sample) in samples.iter().enumerate() {
        let mut line = format!("{}\t{}", sample, subtype.level_of(i).unwrap_or("NA"));
        for pos in 0..assign.ks.len() {
            line.push_str(&format!("\t{}", assign.kmeans[pos][i]));
        }
        for pos in 0..assign.ks.len() {
            line.push_str(&format!("\t{}", assign.hclust[pos][i]));
        }
        lines.push(line.into_boxed_str());
    }
    write_types(&lines, file)
}
