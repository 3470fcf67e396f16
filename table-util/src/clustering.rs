//! Clustering on matrix rows
//!
//! K-means delegates to the `clustering` crate; agglomerative
//! hierarchical clustering builds a dendrogram that can be cut at any
//! number of clusters.

use nalgebra::DMatrix;

/// Arguments for k-means clustering
#[derive(Debug, Clone)]
pub struct KmeansArgs {
    /// Number of clusters
    pub num_clusters: usize,
    /// Maximum number of iterations
    pub max_iter: usize,
}

impl Default for KmeansArgs {
    fn default() -> Self {
        Self {
            num_clusters: 1,
            max_iter: 100,
        }
    }
}

impl KmeansArgs {
    /// Create args with specified number of clusters
    pub fn with_clusters(num_clusters: usize) -> Self {
        Self {
            num_clusters,
            ..Default::default()
        }
    }
}

/// Trait for k-means clustering on matrix rows
pub trait Kmeans {
    /// Cluster rows and return membership vector
    ///
    /// # Arguments
    /// * `args` - Clustering parameters
    ///
    /// # Returns
    /// Vector of cluster assignments, one per row
    fn kmeans_rows(&self, args: KmeansArgs) -> Vec<usize>;
}

impl<T> Kmeans for DMatrix<T>
where
    T: Clone + Sync + Send,
    Vec<T>: clustering::Elem,
{
    fn kmeans_rows(&self, args: KmeansArgs) -> Vec<usize> {
        if args.num_clusters <= 1 || self.nrows() == 0 {
            return vec![0; self.nrows()];
        }

        let data: Vec<Vec<T>> = self
            .row_iter()
            .map(|x| x.iter().cloned().collect())
            .collect();

        let clust = clustering::kmeans(args.num_clusters, &data, args.max_iter);
        clust.membership
    }
}

/// Linkage rule for agglomerative clustering
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Linkage {
    Average,
    Complete,
    Ward,
}

/// Merge history of agglomerative clustering over `n` observations.
///
/// Each step records `(a, b)`: cluster `b` was absorbed into cluster
/// `a` (ids are original observation indices acting as cluster
/// representatives).
pub struct Dendrogram {
    n: usize,
    merges: Vec<(usize, usize)>,
}

impl Dendrogram {
    /// Cut the tree into exactly `k` clusters.
    ///
    /// Labels are contiguous `0..k`, numbered by the first observation
    /// seen in each cluster, so the output is deterministic.
    pub fn cut(&self, k: usize) -> anyhow::Result<Vec<usize>> {
        if k == 0 || k > self.n {
            anyhow::bail!(
                "cannot cut dendrogram over {} observations into {} clusters",
                self.n,
                k
            );
        }

        let mut parent: Vec<usize> = (0..self.n).collect();
        fn find(parent: &mut [usize], mut i: usize) -> usize {
            while parent[i] != i {
                parent[i] = parent[parent[i]];
                i = parent[i];
            }
            i
        }

        for &(a, b) in self.merges.iter().take(self.n - k) {
            let ra = find(&mut parent, a);
            let rb = find(&mut parent, b);
            parent[rb] = ra;
        }

        let mut labels = vec![usize::MAX; self.n];
        let mut next = 0;
        let mut root_label: std::collections::HashMap<usize, usize> =
            std::collections::HashMap::new();
        for i in 0..self.n {
            let r = find(&mut parent, i);
            let label = *root_label.entry(r).or_insert_with(|| {
                let l = next;
                next += 1;
                l
            });
            labels[i] = label;
        }

        debug_assert_eq!(next, k);
        Ok(labels)
    }
}

/// Agglomerative hierarchical clustering of matrix rows under
/// Euclidean distance.
///
/// Pairwise distances are updated with the Lance-Williams recurrences;
/// Ward linkage operates on squared distances. Quadratic memory in the
/// number of rows.
pub fn hierarchical_rows(points: &DMatrix<f32>, linkage: Linkage) -> anyhow::Result<Dendrogram> {
    let n = points.nrows();
    if n == 0 {
        anyhow::bail!("hierarchical clustering needs at least one observation");
    }

    // pairwise (squared) Euclidean distances
    let mut dist = vec![vec![0.0_f64; n]; n];
    for i in 0..n {
        for j in (i + 1)..n {
            let mut d2 = 0.0_f64;
            for c in 0..points.ncols() {
                let diff = (points[(i, c)] - points[(j, c)]) as f64;
                d2 += diff * diff;
            }
            let d = if linkage == Linkage::Ward { d2 } else { d2.sqrt() };
            dist[i][j] = d;
            dist[j][i] = d;
        }
    }

    let mut size = vec![1.0_f64; n];
    let mut active: Vec<usize> = (0..n).collect();
    let mut merges = Vec::with_capacity(n.saturating_sub(1));

    while active.len() > 1 {
        // closest active pair; ties resolved by lowest index pair
        let mut best = f64::INFINITY;
        let mut best_a = active[0];
        let mut best_b = active[0];
        for (ai, &a) in active.iter().enumerate() {
            for &b in &active[ai + 1..] {
                if dist[a][b] < best {
                    best = dist[a][b];
                    best_a = a;
                    best_b = b;
                }
            }
        }

        let (na, nb) = (size[best_a], size[best_b]);

        for &c in &active {
            if c == best_a || c == best_b {
                continue;
            }
            let d_ac = dist[best_a][c];
            let d_bc = dist[best_b][c];
            let new_d = match linkage {
                Linkage::Average => (d_ac * na + d_bc * nb) / (na + nb),
                Linkage::Complete => d_ac.max(d_bc),
                Linkage::Ward => {
                    let nc = size[c];
                    ((na + nc) * d_ac + (nb + nc) * d_bc - nc * dist[best_a][best_b])
                        / (na + nb + nc)
                }
            };
            dist[best_a][c] = new_d;
            dist[c][best_a] = new_d;
        }

        size[best_a] = na + nb;
        merges.push((best_a, best_b));
        active.retain(|&c| c != best_b);
    }

    Ok(Dendrogram { n, merges })
}
