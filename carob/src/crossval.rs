//! Stratified cross-validation of the subtype classifier
//!
//! The balanced sample set is partitioned into K class-stratified
//! folds. Each fold evaluation is a pure function of its train/test
//! split, so folds run in parallel; every stochastic step derives its
//! seed from the run seed, keeping repeated runs identical.

use crate::forest::{FeatureImportance, ForestConfig, RandomForest};
use crate::metrics::ConfusionMatrix;
use crate::pipeline_common::*;
use rand::rngs::StdRng;
use rayon::prelude::*;
use table_util::common_io::write_types;

/// Evaluation of one held-out split
pub struct FoldRecord {
    pub fold: usize,
    pub n_train: usize,
    pub n_test: usize,
    pub confusion: ConfusionMatrix,
    pub accuracy: f64,
    pub balanced_accuracy: f64,
    pub macro_f1: f64,
}

/// Mean and standard deviation (ddof = 1) across folds
pub struct Aggregate {
    pub mean: f64,
    pub sd: f64,
}

pub struct CvSummary {
    pub folds: Vec<FoldRecord>,
    pub accuracy: Aggregate,
    pub balanced_accuracy: Aggregate,
    pub macro_f1: Aggregate,
}

impl CvSummary {
    pub fn write_tsv(&self, file: &str) -> anyhow::Result<()> {
        let lines: Vec<Box<str>> = vec![
            "metric\tmean\tsd".into(),
            format!("accuracy\t{:.6}\t{:.6}", self.accuracy.mean, self.accuracy.sd)
                .into_boxed_str(),
            format!(
                "balanced_accuracy\t{:.6}\t{:.6}",
                self.balanced_accuracy.mean, self.balanced_accuracy.sd
            )
            .into_boxed_str(),
            format!("macro_f1\t{:.6}\t{:.6}", self.macro_f1.mean, self.macro_f1.sd)
                .into_boxed_str(),
        ];
        write_types(&lines, file)
    }
}

/// Final model scored against every sample left out of its training split
pub struct HoldoutReport {
    pub record: FoldRecord,
    pub importance: FeatureImportance,
}

///
/// Partition samples into `k` disjoint, exhaustive, class-stratified
/// folds: per-class shuffle with the given RNG, then round-robin
/// assignment.
///
pub fn stratified_folds(
    labels: &[usize],
    k: usize,
    rng: &mut StdRng,
) -> anyhow::Result<Vec<Vec<usize>>> {
    if k < 2 {
        anyhow::bail!("cross-validation: fold count must be >= 2, got {}", k);
    }

    let n_classes = labels.iter().max().map_or(0, |&m| m + 1);
    let mut by_class: Vec<Vec<usize>> = vec![Vec::new(); n_classes];
    for (i, &label) in labels.iter().enumerate() {
        by_class[label].push(i);
    }

    if let Some(smallest) = by_class.iter().filter(|g| !g.is_empty()).map(|g| g.len()).min() {
        if k > smallest {
            anyhow::bail!(
                "cross-validation: fold count {} exceeds smallest class size {}",
                k,
                smallest
            );
        }
    } else {
        anyhow::bail!("cross-validation: no labeled samples");
    }

    use rand::seq::SliceRandom;
    let mut folds: Vec<Vec<usize>> = vec![Vec::new(); k];
    for group in by_class.iter_mut() {
        group.shuffle(rng);
        for (pos, &i) in group.iter().enumerate() {
            folds[pos % k].push(i);
        }
    }
    Ok(folds)
}

///
/// Run K-fold cross-validation on the balanced data: one forest per
/// fold, aggregated accuracy / balanced accuracy / macro-F1.
///
/// * `x` - balanced samples x features
/// * `labels` - class code per balanced sample
/// * `k` - fold count
/// * `forest` - forest configuration; per-fold seeds derive from it
/// * `rng` - run RNG used for the fold partition
pub fn cross_validate(
    x: &Mat,
    labels: &[usize],
    k: usize,
    forest: &ForestConfig,
    rng: &mut StdRng,
) -> anyhow::Result<CvSummary> {
    let folds = stratified_folds(labels, k, rng)?;
    let n_classes = labels.iter().max().map_or(0, |&m| m + 1);

    let records: Vec<FoldRecord> = folds
        .par_iter()
        .enumerate()
        .map(|(f, test)| {
            let train: Vec<usize> = folds
                .iter()
                .enumerate()
                .filter(|&(g, _)| g != f)
                .flat_map(|(_, fold)| fold.iter().copied())
                .collect();

            let cfg = fold_config(forest, f);
            evaluate_split(x, labels, &train, test, n_classes, f, &cfg)
        })
        .collect::<anyhow::Result<Vec<_>>>()?;

    for rec in &records {
        info!(
            "fold {}: accuracy {:.3}, balanced {:.3}, macro-F1 {:.3} ({} train / {} test)",
            rec.fold, rec.accuracy, rec.balanced_accuracy, rec.macro_f1, rec.n_train, rec.n_test
        );
    }

    let accuracy = aggregate(records.iter().map(|r| r.accuracy));
    let balanced_accuracy = aggregate(records.iter().map(|r| r.balanced_accuracy));
    let macro_f1 = aggregate(records.iter().map(|r| r.macro_f1));

    Ok(CvSummary {
        folds: records,
        accuracy,
        balanced_accuracy,
        macro_f1,
    })
}

///
/// Train one forest on the training split of the designated fold and
/// score it on every labeled sample outside that split, with feature
/// importance from the trained model.
///
/// * `x` - all labeled samples x features
/// * `labels` - class code per labeled sample
/// * `balanced` - balanced subset indices into `x`
/// * `final_fold` - which fold supplies the held-out part of the
///   balanced set; its complement is the training split
pub fn final_holdout(
    x: &Mat,
    labels: &[usize],
    balanced: &[usize],
    k: usize,
    final_fold: usize,
    forest: &ForestConfig,
    rng: &mut StdRng,
) -> anyhow::Result<HoldoutReport> {
    if final_fold >= k {
        anyhow::bail!(
            "final model: designated fold {} out of range for {} folds",
            final_fold,
            k
        );
    }

    let bal_labels: Vec<usize> = balanced.iter().map(|&i| labels[i]).collect();
    let folds = stratified_folds(&bal_labels, k, rng)?;

    // training rows in the index space of `x`
    let train: Vec<usize> = folds
        .iter()
        .enumerate()
        .filter(|&(g, _)| g != final_fold)
        .flat_map(|(_, fold)| fold.iter().map(|&b| balanced[b]))
        .collect();

    let in_train: std::collections::HashSet<usize> = train.iter().copied().collect();
    let test: Vec<usize> = (0..x.nrows()).filter(|i| !in_train.contains(i)).collect();
    if test.is_empty() {
        anyhow::bail!("final model: no samples left outside the training split");
    }

    let n_classes = labels.iter().max().map_or(0, |&m| m + 1);
    let cfg = fold_config(forest, k + final_fold);

    let x_train = x.select_rows(train.iter());
    let y_train: Vec<usize> = train.iter().map(|&i| labels[i]).collect();
    let model = RandomForest::fit(&x_train, &y_train, &cfg)?;

    let x_test = x.select_rows(test.iter());
    let y_test: Vec<usize> = test.iter().map(|&i| labels[i]).collect();
    let predicted = model.predict(&x_test);

    let confusion = ConfusionMatrix::from_labels(&y_test, &predicted, n_classes)?;
    let record = FoldRecord {
        fold: final_fold,
        n_train: train.len(),
        n_test: test.len(),
        accuracy: confusion.accuracy(),
        balanced_accuracy: confusion.balanced_accuracy(),
        macro_f1: confusion.macro_f1(),
        confusion,
    };

    let importance = model.importance(&x_train, &y_train)?;

    info!(
        "final model: accuracy {:.3}, balanced {:.3}, macro-F1 {:.3} on {} held-out sample(s)",
        record.accuracy, record.balanced_accuracy, record.macro_f1, record.n_test
    );

    Ok(HoldoutReport { record, importance })
}

fn fold_config(forest: &ForestConfig, f: usize) -> ForestConfig {
    ForestConfig {
        seed: forest
            .seed
            .wrapping_add((f as u64 + 1).wrapping_mul(0xA076_1D64_78BD_642F)),
        ..forest.clone()
    }
}

fn evaluate_split(
    x: &Mat,
    labels: &[usize],
    train: &[usize],
    test: &[usize],
    n_classes: usize,
    fold: usize,
    cfg: &ForestConfig,
) -> anyhow::Result<FoldRecord> {
    let x_train = x.select_rows(train.iter());
    let y_train: Vec<usize> = train.iter().map(|&i| labels[i]).collect();
    let model = RandomForest::fit(&x_train, &y_train, cfg)?;
    debug_assert!(model.n_classes() <= n_classes);

    let x_test = x.select_rows(test.iter());
    let y_test: Vec<usize> = test.iter().map(|&i| labels[i]).collect();
    let predicted = model.predict(&x_test);

    let confusion = ConfusionMatrix::from_labels(&y_test, &predicted, n_classes)?;
    Ok(FoldRecord {
        fold,
        n_train: train.len(),
        n_test: test.len(),
        accuracy: confusion.accuracy(),
        balanced_accuracy: confusion.balanced_accuracy(),
        macro_f1: confusion.macro_f1(),
        confusion,
    })
}

fn aggregate(values: impl Iterator<Item = f64>) -> Aggregate {
    let values: Vec<f64> = values.collect();
    let n = values.len() as f64;
    let mean = values.iter().sum::<f64>() / n;
    let sd = if values.len() > 1 {
        (values.iter().map(|v| (v - mean) * (v - mean)).sum::<f64>() / (n - 1.0)).sqrt()
    } else {
        0.0
    };
    Aggregate { mean, sd }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;

    fn labeled_data(per_class: usize) -> (Mat, Vec<usize>) {
        let mut rows = Vec::new();
        let mut labels = Vec::new();
        let centers = [[0.0_f32, 0.0], [6.0, 0.0], [0.0, 6.0]];
        for (c, center) in centers.iter().enumerate() {
            for i in 0..per_class {
                rows.push(center[0] + 0.05 * i as f32);
                rows.push(center[1] - 0.05 * i as f32);
                labels.push(c);
            }
        }
        (
            Mat::from_row_iterator(3 * per_class, 2, rows.into_iter()),
            labels,
        )
    }

    fn quick_forest() -> ForestConfig {
        ForestConfig {
            num_trees: 15,
            max_depth: 5,
            ..Default::default()
        }
    }

    #[test]
    fn folds_are_disjoint_exhaustive_and_stratified() {
        let labels: Vec<usize> = (0..30).map(|i| i % 3).collect();
        let mut rng = StdRng::seed_from_u64(2);
        let folds = stratified_folds(&labels, 5, &mut rng).unwrap();

        assert_eq!(folds.len(), 5);

        let mut all: Vec<usize> = folds.iter().flatten().copied().collect();
        all.sort_unstable();
        assert_eq!(all, (0..30).collect::<Vec<_>>());

        for fold in &folds {
            assert_eq!(fold.len(), 6);
            for c in 0..3 {
                let members = fold.iter().filter(|&&i| labels[i] == c).count();
                assert_eq!(members, 2, "fold not stratified");
            }
        }
    }

    #[test]
    fn fold_sizes_differ_by_at_most_one() {
        let labels: Vec<usize> = (0..17).map(|i| i % 2).collect();
        let mut rng = StdRng::seed_from_u64(4);
        let folds = stratified_folds(&labels, 4, &mut rng).unwrap();

        let sizes: Vec<usize> = folds.iter().map(|f| f.len()).collect();
        let lo = *sizes.iter().min().unwrap();
        let hi = *sizes.iter().max().unwrap();
        assert!(hi - lo <= 1, "sizes {:?}", sizes);
        assert_eq!(sizes.iter().sum::<usize>(), 17);
    }

    #[test]
    fn fold_partition_is_seed_deterministic() {
        let labels: Vec<usize> = (0..24).map(|i| i % 3).collect();
        let a = stratified_folds(&labels, 4, &mut StdRng::seed_from_u64(7)).unwrap();
        let b = stratified_folds(&labels, 4, &mut StdRng::seed_from_u64(7)).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn too_many_folds_for_smallest_class() {
        let labels = vec![0, 0, 0, 0, 1, 1, 1];
        let mut rng = StdRng::seed_from_u64(0);
        assert!(stratified_folds(&labels, 4, &mut rng).is_err());
        assert!(stratified_folds(&labels, 1, &mut rng).is_err());
    }

    #[test]
    fn cross_validation_produces_k_valid_records() {
        let (x, labels) = labeled_data(10);
        let mut rng = StdRng::seed_from_u64(5);

        let summary = cross_validate(&x, &labels, 5, &quick_forest(), &mut rng).unwrap();
        assert_eq!(summary.folds.len(), 5);
        for rec in &summary.folds {
            assert!((0.0..=1.0).contains(&rec.accuracy));
            assert!((0.0..=1.0).contains(&rec.balanced_accuracy));
            assert!((0.0..=1.0).contains(&rec.macro_f1));
            assert_eq!(rec.n_train + rec.n_test, 30);
        }
        assert!(summary.accuracy.sd >= 0.0);

        // classes this separated should be essentially solved
        assert!(summary.accuracy.mean > 0.8);
    }

    #[test]
    fn cross_validation_is_seed_deterministic() {
        let (x, labels) = labeled_data(8);

        let a = cross_validate(&x, &labels, 4, &quick_forest(), &mut StdRng::seed_from_u64(9))
            .unwrap();
        let b = cross_validate(&x, &labels, 4, &quick_forest(), &mut StdRng::seed_from_u64(9))
            .unwrap();

        assert_eq!(a.accuracy.mean, b.accuracy.mean);
        assert_eq!(a.macro_f1.mean, b.macro_f1.mean);
        for (ra, rb) in a.folds.iter().zip(b.folds.iter()) {
            assert_eq!(ra.accuracy, rb.accuracy);
        }
    }

    #[test]
    fn final_holdout_tests_everything_outside_training() {
        let (x, labels) = labeled_data(10);
        // balanced subset: first 8 of each class
        let balanced: Vec<usize> = (0..30).filter(|i| i % 10 < 8).collect();
        let mut rng = StdRng::seed_from_u64(3);

        let report =
            final_holdout(&x, &labels, &balanced, 4, 0, &quick_forest(), &mut rng).unwrap();

        let n_train = report.record.n_train;
        let n_test = report.record.n_test;
        assert_eq!(n_train + n_test, 30);
        assert_eq!(n_train, 18, "3 of 4 folds over 24 balanced samples");
        assert!((0.0..=1.0).contains(&report.record.accuracy));
        assert_eq!(report.importance.mean_decrease_accuracy.len(), 2);
        assert_eq!(report.importance.mean_decrease_impurity.len(), 2);
    }

    #[test]
    fn summary_table_has_three_metric_rows() {
        let (x, labels) = labeled_data(6);
        let mut rng = StdRng::seed_from_u64(1);
        let summary = cross_validate(&x, &labels, 3, &quick_forest(), &mut rng).unwrap();

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cv.tsv");
        summary.write_tsv(path.to_str().unwrap()).unwrap();

        let text = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 4);
        assert!(lines[1].starts_with("accuracy\t"));
        assert!(lines[3].starts_with("macro_f1\t"));
    }
}
