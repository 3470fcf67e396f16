use crate::dmatrix_util::Mat;

/// Principal component coordinates for a set of observations
pub struct Pca {
    /// observation coordinates (n x num_pc)
    pub coords: Mat,
    /// fraction of total variance carried by each component
    pub explained: Vec<f32>,
}

/// Project observations (rows) onto their leading principal
/// components via SVD of the column-centered data matrix.
///
/// * `points` - observations x features
/// * `num_pc` - number of components to keep (capped by the rank)
pub fn principal_components(points: &Mat, num_pc: usize) -> anyhow::Result<Pca> {
    let n = points.nrows();
    let p = points.ncols();
    if n < 2 {
        anyhow::bail!("pca: need at least 2 observations, got {}", n);
    }
    if p == 0 {
        anyhow::bail!("pca: empty feature set");
    }
    if num_pc == 0 {
        anyhow::bail!("pca: number of components must be > 0");
    }
    if points.iter().any(|x| !x.is_finite()) {
        anyhow::bail!("pca: input contains non-finite values");
    }

    // column centering
    let mut centered = points.clone();
    for j in 0..p {
        let mu = centered.column(j).mean();
        for i in 0..n {
            centered[(i, j)] -= mu;
        }
    }

    let svd = centered.svd(true, true);
    let uu = svd
        .u
        .as_ref()
        .ok_or_else(|| anyhow::anyhow!("pca: SVD did not return U"))?;
    let sv = &svd.singular_values;

    let k = num_pc.min(sv.len()).min(n.saturating_sub(1)).max(1);

    let mut coords = Mat::zeros(n, k);
    for c in 0..k {
        for i in 0..n {
            coords[(i, c)] = uu[(i, c)] * sv[c];
        }
    }

    let total: f32 = sv.iter().map(|&s| s * s).sum();
    let explained = if total > 0.0 {
        (0..k).map(|c| sv[c] * sv[c] / total).collect()
    } else {
        vec![0.0; k]
    };

    Ok(Pca { coords, explained })
}

#[cfg(test)]
mod tests {
    use super::*;

    /// two groups separated along one direction, small noise elsewhere
    fn two_group_points() -> Mat {
        use rand::rngs::SmallRng;
        use rand::SeedableRng;
        use rand_distr::{Distribution, Normal};

        let mut rng = SmallRng::seed_from_u64(7);
        let noise = Normal::new(0.0_f32, 0.1).unwrap();

        let mut data = Mat::zeros(40, 5);
        for i in 0..40 {
            let shift = if i < 20 { 0.0 } else { 10.0 };
            for j in 0..5 {
                data[(i, j)] = noise.sample(&mut rng) + if j == 0 { shift } else { 0.0 };
            }
        }
        data
    }

    #[test]
    fn leading_component_separates_groups() {
        let points = two_group_points();
        let pca = principal_components(&points, 2).unwrap();

        assert_eq!(pca.coords.nrows(), 40);
        assert_eq!(pca.coords.ncols(), 2);

        // every pair across the two groups is separated on PC1
        let pc1: Vec<f32> = (0..40).map(|i| pca.coords[(i, 0)]).collect();
        let sign0 = pc1[0] > 0.0;
        assert!(pc1[..20].iter().all(|&v| (v > 0.0) == sign0));
        assert!(pc1[20..].iter().all(|&v| (v > 0.0) != sign0));
    }

    #[test]
    fn explained_fractions_are_ordered() {
        let points = two_group_points();
        let pca = principal_components(&points, 3).unwrap();

        assert!(pca.explained[0] > pca.explained[1]);
        assert!(pca.explained[0] > 0.9, "group shift dominates variance");
        let sum: f32 = pca.explained.iter().sum();
        assert!(sum <= 1.0 + 1e-4);
    }

    #[test]
    fn component_count_is_capped() {
        let points = two_group_points();
        let pca = principal_components(&points, 100).unwrap();
        assert!(pca.coords.ncols() <= 5);
    }

    #[test]
    fn degenerate_inputs_rejected() {
        let one = Mat::zeros(1, 3);
        assert!(principal_components(&one, 2).is_err());

        let mut bad = Mat::zeros(3, 3);
        bad[(0, 0)] = f32::NAN;
        assert!(principal_components(&bad, 2).is_err());
    }
}
