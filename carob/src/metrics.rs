//! Classification and partition-agreement metrics
//!
//! A label-by-label confusion matrix with the per-class rates derived
//! from it, plus the adjusted Rand index for comparing two partitions
//! of the same sample set.

/// Confusion matrix over `n_classes` labels (rows = actual,
/// columns = predicted).
#[derive(Debug, Clone)]
pub struct ConfusionMatrix {
    n_classes: usize,
    counts: Vec<usize>,
}

impl ConfusionMatrix {
    pub fn from_labels(
        actual: &[usize],
        predicted: &[usize],
        n_classes: usize,
    ) -> anyhow::Result<Self> {
        if actual.len() != predicted.len() {
            anyhow::bail!(
                "confusion matrix: {} actual vs {} predicted labels",
                actual.len(),
                predicted.len()
            );
        }
        if actual.is_empty() {
            anyhow::bail!("confusion matrix: no labels");
        }
        let mut counts = vec![0_usize; n_classes * n_classes];
        for (&a, &p) in actual.iter().zip(predicted.iter()) {
            if a >= n_classes || p >= n_classes {
                anyhow::bail!(
                    "confusion matrix: label ({}, {}) out of range for {} classes",
                    a,
                    p,
                    n_classes
                );
            }
            counts[a * n_classes + p] += 1;
        }
        Ok(Self { n_classes, counts })
    }

    pub fn n_classes(&self) -> usize {
        self.n_classes
    }

    pub fn get(&self, actual: usize, predicted: usize) -> usize {
        self.counts[actual * self.n_classes + predicted]
    }

    pub fn total(&self) -> usize {
        self.counts.iter().sum()
    }

    /// number of actual members of a class
    pub fn support(&self, class: usize) -> usize {
        (0..self.n_classes).map(|p| self.get(class, p)).sum()
    }

    pub fn true_positives(&self, class: usize) -> usize {
        self.get(class, class)
    }

    pub fn false_positives(&self, class: usize) -> usize {
        (0..self.n_classes)
            .filter(|&a| a != class)
            .map(|a| self.get(a, class))
            .sum()
    }

    pub fn false_negatives(&self, class: usize) -> usize {
        (0..self.n_classes)
            .filter(|&p| p != class)
            .map(|p| self.get(class, p))
            .sum()
    }

    pub fn true_negatives(&self, class: usize) -> usize {
        self.total() - self.true_positives(class) - self.false_positives(class)
            - self.false_negatives(class)
    }

    pub fn accuracy(&self) -> f64 {
        let correct: usize = (0..self.n_classes).map(|c| self.get(c, c)).sum();
        correct as f64 / self.total() as f64
    }

    pub fn precision(&self, class: usize) -> f64 {
        ratio(
            self.true_positives(class),
            self.true_positives(class) + self.false_positives(class),
        )
    }

    /// recall of a class
    pub fn sensitivity(&self, class: usize) -> f64 {
        ratio(
            self.true_positives(class),
            self.true_positives(class) + self.false_negatives(class),
        )
    }

    pub fn specificity(&self, class: usize) -> f64 {
        ratio(
            self.true_negatives(class),
            self.true_negatives(class) + self.false_positives(class),
        )
    }

    pub fn f1(&self, class: usize) -> f64 {
        let p = self.precision(class);
        let r = self.sensitivity(class);
        if p + r > 0.0 {
            2.0 * p * r / (p + r)
        } else {
            0.0
        }
    }

    /// unweighted mean F1 over classes with at least one actual member
    pub fn macro_f1(&self) -> f64 {
        let supported: Vec<usize> = (0..self.n_classes)
            .filter(|&c| self.support(c) > 0)
            .collect();
        supported.iter().map(|&c| self.f1(c)).sum::<f64>() / supported.len().max(1) as f64
    }

    /// mean sensitivity over classes with at least one actual member
    pub fn balanced_accuracy(&self) -> f64 {
        let supported: Vec<usize> = (0..self.n_classes)
            .filter(|&c| self.support(c) > 0)
            .collect();
        supported.iter().map(|&c| self.sensitivity(c)).sum::<f64>()
            / supported.len().max(1) as f64
    }

    /// multi-line rendering for the log, one row per actual class
    pub fn render(&self, labels: &[Box<str>]) -> String {
        fn name(labels: &[Box<str>], c: usize) -> &str {
            labels.get(c).map(|x| x.as_ref()).unwrap_or("?")
        }
        let mut lines = Vec::with_capacity(self.n_classes + 1);
        let header: Vec<&str> = (0..self.n_classes).map(|c| name(labels, c)).collect();
        lines.push(format!("actual\\predicted\t{}", header.join("\t")));
        for a in 0..self.n_classes {
            let row: Vec<String> = (0..self.n_classes)
                .map(|p| self.get(a, p).to_string())
                .collect();
            lines.push(format!("{}\t{}", name(labels, a), row.join("\t")));
        }
        lines.join("\n")
    }
}

fn ratio(num: usize, denom: usize) -> f64 {
    if denom == 0 {
        0.0
    } else {
        num as f64 / denom as f64
    }
}

///
/// Adjusted Rand index between two partitions of the same samples:
/// 1 for identical partitions (up to relabeling), approximately 0 for
/// independent ones.
///
pub fn adjusted_rand_index(a: &[usize], b: &[usize]) -> anyhow::Result<f64> {
    if a.len() != b.len() {
        anyhow::bail!("ARI: partitions of different length ({} vs {})", a.len(), b.len());
    }
    let n = a.len();
    if n < 2 {
        anyhow::bail!("ARI: need at least 2 samples");
    }

    let ka = a.iter().max().map_or(0, |&m| m + 1);
    let kb = b.iter().max().map_or(0, |&m| m + 1);

    let mut table = vec![0_usize; ka * kb];
    let mut row_sum = vec![0_usize; ka];
    let mut col_sum = vec![0_usize; kb];
    for (&x, &y) in a.iter().zip(b.iter()) {
        table[x * kb + y] += 1;
        row_sum[x] += 1;
        col_sum[y] += 1;
    }

    fn comb2(x: usize) -> f64 {
        (x as f64) * (x as f64 - 1.0) / 2.0
    }

    let sum_cells: f64 = table.iter().map(|&c| comb2(c)).sum();
    let sum_rows: f64 = row_sum.iter().map(|&c| comb2(c)).sum();
    let sum_cols: f64 = col_sum.iter().map(|&c| comb2(c)).sum();
    let total = comb2(n);

    let expected = sum_rows * sum_cols / total;
    let max_index = (sum_rows + sum_cols) / 2.0;

    if (max_index - expected).abs() < f64::EPSILON {
        // both partitions are single blocks (or equivalent): perfect agreement
        return Ok(1.0);
    }
    Ok((sum_cells - expected) / (max_index - expected))
}
