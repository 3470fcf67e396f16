//! Random forest classifier
//!
//! Bagged ensemble of gini decision trees with per-split feature
//! subsampling, grown on bootstrap resamples of the training rows.
//! Tree growth is deterministic given the run seed: every tree derives
//! its own RNG from the seed and its index, so fitting may proceed in
//! parallel without affecting the result.

use crate::pipeline_common::*;
use indicatif::ParallelProgressIterator;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rayon::prelude::*;

#[derive(Debug, Clone)]
pub struct ForestConfig {
    /// number of trees in the ensemble
    pub num_trees: usize,
    /// features tried per split; 0 means floor(sqrt(n_features))
    pub mtry: usize,
    /// depth cap; generous enough to grow to purity on typical data
    pub max_depth: usize,
    /// minimum samples in a leaf
    pub min_leaf: usize,
    /// run seed; every stochastic step derives from it
    pub seed: u64,
}

impl Default for ForestConfig {
    fn default() -> Self {
        Self {
            num_trees: 500,
            mtry: 0,
            max_depth: 32,
            min_leaf: 1,
            seed: 42,
        }
    }
}

#[derive(Debug, Clone)]
enum Node {
    Leaf {
        class: usize,
    },
    Split {
        feature: usize,
        threshold: f32,
        left: usize,
        right: usize,
    },
}

#[derive(Debug, Clone)]
struct Tree {
    nodes: Vec<Node>,
    /// training rows not drawn into this tree's bootstrap
    oob: Vec<usize>,
    /// per-feature impurity decrease accumulated during growth
    impurity_decrease: Vec<f32>,
}

/// Per-gene importance scores of a fitted forest
pub struct FeatureImportance {
    /// out-of-bag permutation importance
    pub mean_decrease_accuracy: Vec<f32>,
    /// gini importance
    pub mean_decrease_impurity: Vec<f32>,
}

pub struct RandomForest {
    trees: Vec<Tree>,
    n_classes: usize,
    n_features: usize,
    seed: u64,
}

impl RandomForest {
    ///
    /// Fit the ensemble on `x` (samples x features) with one label per
    /// row. Requires finite features and at least two classes.
    ///
    pub fn fit(x: &Mat, labels: &[usize], config: &ForestConfig) -> anyhow::Result<Self> {
        let n = x.nrows();
        let p = x.ncols();
        if n == 0 || p == 0 {
            anyhow::bail!("random forest: empty training data ({} x {})", n, p);
        }
        if labels.len() != n {
            anyhow::bail!(
                "random forest: {} labels for {} training rows",
                labels.len(),
                n
            );
        }
        if config.num_trees == 0 {
            anyhow::bail!("random forest: number of trees must be >= 1");
        }
        if x.iter().any(|v| !v.is_finite()) {
            anyhow::bail!("random forest: training matrix contains non-finite values");
        }

        let n_classes = labels.iter().max().map_or(0, |&m| m + 1);
        if n_classes < 2 {
            anyhow::bail!("random forest: need at least 2 classes, got {}", n_classes);
        }

        let mtry = if config.mtry == 0 {
            ((p as f64).sqrt().floor() as usize).max(1)
        } else {
            config.mtry.min(p)
        };

        let trees: Vec<Tree> = (0..config.num_trees)
            .into_par_iter()
            .progress_count(config.num_trees as u64)
            .map(|t| {
                let mut rng = StdRng::seed_from_u64(tree_seed(config.seed, t as u64));
                grow_tree(x, labels, n_classes, mtry, config, &mut rng)
            })
            .collect();

        info!(
            "fitted random forest: {} trees, mtry {}, {} classes",
            trees.len(),
            mtry,
            n_classes
        );

        Ok(Self {
            trees,
            n_classes,
            n_features: p,
            seed: config.seed,
        })
    }

    pub fn n_classes(&self) -> usize {
        self.n_classes
    }

    /// Majority vote over trees; vote ties go to the smaller class id
    pub fn predict_row(&self, row: &[f32]) -> usize {
        let mut votes = vec![0_usize; self.n_classes];
        for tree in &self.trees {
            votes[predict_tree(tree, row, None)] += 1;
        }
        argmax(&votes)
    }

    /// Predict a label for every row of `x`
    pub fn predict(&self, x: &Mat) -> Vec<usize> {
        (0..x.nrows())
            .into_par_iter()
            .map(|i| {
                let row: Vec<f32> = x.row(i).iter().copied().collect();
                self.predict_row(&row)
            })
            .collect()
    }

    ///
    /// Feature importance on the training data: mean decrease in
    /// out-of-bag accuracy under per-feature permutation, and mean
    /// gini impurity decrease, both averaged over trees.
    ///
    pub fn importance(&self, x: &Mat, labels: &[usize]) -> anyhow::Result<FeatureImportance> {
        if x.nrows() != labels.len() || x.ncols() != self.n_features {
            anyhow::bail!(
                "feature importance: data {} x {} does not match forest ({} features, {} labels)",
                x.nrows(),
                x.ncols(),
                self.n_features,
                labels.len()
            );
        }

        let p = self.n_features;

        let mdi = {
            let mut acc = vec![0.0_f32; p];
            for tree in &self.trees {
                for (j, &d) in tree.impurity_decrease.iter().enumerate() {
                    acc[j] += d;
                }
            }
            acc.iter().map(|&v| v / self.trees.len() as f32).collect()
        };

        let per_tree: Vec<Vec<f32>> = self
            .trees
            .par_iter()
            .enumerate()
            .map(|(t, tree)| permutation_decrease(tree, x, labels, p, tree_seed(self.seed, t as u64)))
            .collect();

        let mut mda = vec![0.0_f32; p];
        for tree_scores in &per_tree {
            for (j, &d) in tree_scores.iter().enumerate() {
                mda[j] += d;
            }
        }
        for v in mda.iter_mut() {
            *v /= self.trees.len() as f32;
        }

        Ok(FeatureImportance {
            mean_decrease_accuracy: mda,
            mean_decrease_impurity: mdi,
        })
    }
}

fn tree_seed(seed: u64, t: u64) -> u64 {
    seed ^ (t.wrapping_add(1)).wrapping_mul(0x9E37_79B9_7F4A_7C15)
}

fn argmax(votes: &[usize]) -> usize {
    let mut best = 0;
    for (c, &v) in votes.iter().enumerate() {
        if v > votes[best] {
            best = c;
        }
    }
    best
}

fn grow_tree(
    x: &Mat,
    labels: &[usize],
    n_classes: usize,
    mtry: usize,
    config: &ForestConfig,
    rng: &mut StdRng,
) -> Tree {
    let n = x.nrows();
    let p = x.ncols();

    // bootstrap resample of the training rows
    let mut in_bag = vec![false; n];
    let sample: Vec<usize> = (0..n)
        .map(|_| {
            let i = rng.random_range(0..n);
            in_bag[i] = true;
            i
        })
        .collect();
    let oob: Vec<usize> = (0..n).filter(|&i| !in_bag[i]).collect();

    let mut tree = Tree {
        nodes: Vec::new(),
        oob,
        impurity_decrease: vec![0.0; p],
    };
    grow_node(x, labels, n_classes, mtry, config, rng, sample, 0, n, &mut tree);
    tree
}

/// Grow one node over `idx` rows and return its node id
#[allow(clippy::too_many_arguments)]
fn grow_node(
    x: &Mat,
    labels: &[usize],
    n_classes: usize,
    mtry: usize,
    config: &ForestConfig,
    rng: &mut StdRng,
    idx: Vec<usize>,
    depth: usize,
    n_total: usize,
    tree: &mut Tree,
) -> usize {
    let counts = class_counts(labels, &idx, n_classes);
    let majority = argmax(&counts);
    let pure = counts.iter().filter(|&&c| c > 0).count() <= 1;

    if pure || depth >= config.max_depth || idx.len() < 2 * config.min_leaf.max(1) {
        tree.nodes.push(Node::Leaf { class: majority });
        return tree.nodes.len() - 1;
    }

    let parent_gini = gini(&counts, idx.len());
    let candidates = rand::seq::index::sample(rng, x.ncols(), mtry.min(x.ncols()));

    let mut best: Option<(usize, f32, f32)> = None; // (feature, threshold, gain)
    for j in candidates.iter() {
        if let Some((threshold, gain)) =
            best_split_on_feature(x, labels, n_classes, &idx, j, parent_gini, config.min_leaf)
        {
            if best.map_or(true, |(_, _, g)| gain > g) {
                best = Some((j, threshold, gain));
            }
        }
    }

    let Some((feature, threshold, gain)) = best else {
        tree.nodes.push(Node::Leaf { class: majority });
        return tree.nodes.len() - 1;
    };

    tree.impurity_decrease[feature] += gain * idx.len() as f32 / n_total as f32;

    let (left_idx, right_idx): (Vec<usize>, Vec<usize>) =
        idx.iter().copied().partition(|&i| x[(i, feature)] <= threshold);

    let node_id = tree.nodes.len();
    tree.nodes.push(Node::Leaf { class: majority }); // placeholder

    let left = grow_node(
        x, labels, n_classes, mtry, config, rng, left_idx, depth + 1, n_total, tree,
    );
    let right = grow_node(
        x, labels, n_classes, mtry, config, rng, right_idx, depth + 1, n_total, tree,
    );

    tree.nodes[node_id] = Node::Split {
        feature,
        threshold,
        left,
        right,
    };
    node_id
}

fn class_counts(labels: &[usize], idx: &[usize], n_classes: usize) -> Vec<usize> {
    let mut counts = vec![0_usize; n_classes];
    for &i in idx {
        counts[labels[i]] += 1;
    }
    counts
}

fn gini(counts: &[usize], total: usize) -> f32 {
    if total == 0 {
        return 0.0;
    }
    let mut sum_sq = 0.0_f32;
    for &c in counts {
        let f = c as f32 / total as f32;
        sum_sq += f * f;
    }
    1.0 - sum_sq
}

/// Best threshold for one feature; None when no split improves purity
fn best_split_on_feature(
    x: &Mat,
    labels: &[usize],
    n_classes: usize,
    idx: &[usize],
    feature: usize,
    parent_gini: f32,
    min_leaf: usize,
) -> Option<(f32, f32)> {
    let n = idx.len();
    let mut order: Vec<(f32, usize)> = idx.iter().map(|&i| (x[(i, feature)], labels[i])).collect();
    order.sort_by(|a, b| a.0.partial_cmp(&b.0).unwrap_or(std::cmp::Ordering::Equal));

    let min_leaf = min_leaf.max(1);
    let mut left_counts = vec![0_usize; n_classes];
    let mut right_counts = class_counts(labels, idx, n_classes);

    let mut best: Option<(f32, f32)> = None;
    for s in 0..(n - 1) {
        let (v, label) = order[s];
        left_counts[label] += 1;
        right_counts[label] -= 1;

        let next_v = order[s + 1].0;
        if next_v <= v {
            continue; // no boundary between equal values
        }
        let n_left = s + 1;
        let n_right = n - n_left;
        if n_left < min_leaf || n_right < min_leaf {
            continue;
        }

        let weighted = (n_left as f32 * gini(&left_counts, n_left)
            + n_right as f32 * gini(&right_counts, n_right))
            / n as f32;
        let gain = parent_gini - weighted;
        if gain > 1e-7 && best.map_or(true, |(_, g)| gain > g) {
            best = Some((0.5 * (v + next_v), gain));
        }
    }
    best
}

/// Walk the tree for one sample; `override_feature` substitutes the
/// value of a single feature (used by permutation importance).
fn predict_tree(tree: &Tree, row: &[f32], override_feature: Option<(usize, f32)>) -> usize {
    let mut at = 0;
    loop {
        match &tree.nodes[at] {
            Node::Leaf { class } => return *class,
            Node::Split {
                feature,
                threshold,
                left,
                right,
            } => {
                let v = match override_feature {
                    Some((j, val)) if j == *feature => val,
                    _ => row[*feature],
                };
                at = if v <= *threshold { *left } else { *right };
            }
        }
    }
}

/// Out-of-bag accuracy decrease per feature for one tree
fn permutation_decrease(
    tree: &Tree,
    x: &Mat,
    labels: &[usize],
    p: usize,
    seed: u64,
) -> Vec<f32> {
    let mut scores = vec![0.0_f32; p];
    if tree.oob.is_empty() {
        return scores;
    }

    let rows: Vec<Vec<f32>> = tree
        .oob
        .iter()
        .map(|&i| x.row(i).iter().copied().collect())
        .collect();

    let mut baseline = 0_usize;
    for (pos, row) in rows.iter().enumerate() {
        if predict_tree(tree, row, None) == labels[tree.oob[pos]] {
            baseline += 1;
        }
    }

    // only features the tree actually splits on can change a prediction
    let mut used = vec![false; p];
    for node in &tree.nodes {
        if let Node::Split { feature, .. } = node {
            used[*feature] = true;
        }
    }

    let n_oob = tree.oob.len();
    for (j, flag) in used.iter().enumerate() {
        if !flag {
            continue;
        }
        let mut rng = StdRng::seed_from_u64(seed ^ (j as u64).wrapping_mul(0xD6E8_FEB8_6659_FD93));
        let mut perm: Vec<usize> = (0..n_oob).collect();
        for i in (1..n_oob).rev() {
            let k = rng.random_range(0..=i);
            perm.swap(i, k);
        }

        let permuted_correct = (0..n_oob)
            .filter(|&pos| {
                let shuffled_value = rows[perm[pos]][j];
                predict_tree(tree, &rows[pos], Some((j, shuffled_value)))
                    == labels[tree.oob[pos]]
            })
            .count();

        scores[j] = (baseline as f32 - permuted_correct as f32) / n_oob as f32;
    }
    scores
}
