//! Clinical metadata normalization
//!
//! Raw per-sample annotation tables come with heterogeneous column
//! naming. This module maps them onto a fixed, underscore-normalized
//! vocabulary, converts the `NA` sentinel to a uniform missing marker,
//! and coerces every column to its declared type. Coercion failures
//! become missing values, never a failed run.

use crate::pipeline_common::*;
use std::collections::HashMap;
use table_util::common_io::read_lines_of_words_delim;

pub const SAMPLE_ID: &str = "sample_id";
pub const SUBTYPE: &str = "pam50_subtype";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColumnKind {
    Categorical,
    Numeric,
}

/// canonical column name, type, and accepted aliases (post-normalization)
const SCHEMA: &[(&str, ColumnKind, &[&str])] = &[
    (
        "instrument_model",
        ColumnKind::Categorical,
        &["instrument"],
    ),
    ("age_at_diagnosis", ColumnKind::Numeric, &["age"]),
    ("tumor_size", ColumnKind::Numeric, &["tumor_size_mm"]),
    (
        "lymph_node_status",
        ColumnKind::Categorical,
        &["node_status", "lymph_node_group"],
    ),
    ("er_status", ColumnKind::Categorical, &["er"]),
    ("pgr_status", ColumnKind::Categorical, &["pr_status", "pgr"]),
    ("her2_status", ColumnKind::Categorical, &["her2"]),
    ("ki67_status", ColumnKind::Categorical, &["ki67"]),
    (
        "nhg",
        ColumnKind::Categorical,
        &["histologic_grade", "grade", "nottingham_histologic_grade"],
    ),
    (
        SUBTYPE,
        ColumnKind::Categorical,
        &["subtype", "pam50", "molecular_subtype"],
    ),
    (
        "overall_survival_days",
        ColumnKind::Numeric,
        &["os_days", "overall_survival_time"],
    ),
    (
        "overall_survival_event",
        ColumnKind::Categorical,
        &["os_event", "event"],
    ),
];

const SAMPLE_ALIASES: &[&str] = &[SAMPLE_ID, "sample", "sample_name", "title", "id"];

/// A categorical column with levels interned in first-appearance order
#[derive(Debug, Clone)]
pub struct CategoricalColumn {
    pub levels: Vec<Box<str>>,
    pub codes: Vec<Option<u32>>,
}

impl CategoricalColumn {
    pub fn level_of(&self, idx: usize) -> Option<&str> {
        self.codes[idx].map(|c| self.levels[c as usize].as_ref())
    }

    /// number of members per level
    pub fn counts(&self) -> Vec<usize> {
        let mut counts = vec![0; self.levels.len()];
        for code in self.codes.iter().flatten() {
            counts[*code as usize] += 1;
        }
        counts
    }
}

#[derive(Debug, Clone)]
pub enum ClinicalColumn {
    Categorical(CategoricalColumn),
    Numeric(Vec<Option<f32>>),
}

/// One row per sample, fixed typed schema, sample id as the join key
#[derive(Debug, Clone)]
pub struct ClinicalTable {
    pub samples: Vec<Box<str>>,
    columns: Vec<(Box<str>, ClinicalColumn)>,
}

impl ClinicalTable {
    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn categorical(&self, name: &str) -> anyhow::Result<&CategoricalColumn> {
        match self.column(name)? {
            ClinicalColumn::Categorical(col) => Ok(col),
            ClinicalColumn::Numeric(_) => {
                anyhow::bail!("clinical column '{}' is numeric, not categorical", name)
            }
        }
    }

    pub fn numeric(&self, name: &str) -> anyhow::Result<&[Option<f32>]> {
        match self.column(name)? {
            ClinicalColumn::Numeric(col) => Ok(col),
            ClinicalColumn::Categorical(_) => {
                anyhow::bail!("clinical column '{}' is categorical, not numeric", name)
            }
        }
    }

    fn column(&self, name: &str) -> anyhow::Result<&ClinicalColumn> {
        self.columns
            .iter()
            .find(|(n, _)| n.as_ref() == name)
            .map(|(_, c)| c)
            .ok_or_else(|| anyhow::anyhow!("no clinical column '{}'", name))
    }

    pub fn subtype(&self) -> anyhow::Result<&CategoricalColumn> {
        self.categorical(SUBTYPE)
    }

    /// map from sample id to row index
    pub fn sample_index_map(&self) -> HashMap<&str, usize> {
        self.samples
            .iter()
            .enumerate()
            .map(|(i, s)| (s.as_ref(), i))
            .collect()
    }

    /// Take a subset of rows in the given index order; level
    /// vocabularies are carried over unchanged.
    pub fn subset(&self, idx: &[usize]) -> Self {
        let samples = idx.iter().map(|&i| self.samples[i].clone()).collect();
        let columns = self
            .columns
            .iter()
            .map(|(name, col)| {
                let col = match col {
                    ClinicalColumn::Categorical(c) => {
                        ClinicalColumn::Categorical(CategoricalColumn {
                            levels: c.levels.clone(),
                            codes: idx.iter().map(|&i| c.codes[i]).collect(),
                        })
                    }
                    ClinicalColumn::Numeric(c) => {
                        ClinicalColumn::Numeric(idx.iter().map(|&i| c[i]).collect())
                    }
                };
                (name.clone(), col)
            })
            .collect();
        Self { samples, columns }
    }

    ///
    /// Read a raw clinical annotation file and normalize it into the
    /// fixed schema. Unrecognized source columns are dropped; every
    /// schema column must be present under some accepted alias.
    ///
    pub fn from_delim(file: &str) -> anyhow::Result<Self> {
        let parsed = read_lines_of_words_delim(file, &['\t', ','], 0)?;
        if parsed.lines.is_empty() {
            anyhow::bail!("clinical table {} has no rows", file);
        }

        let header: Vec<String> = parsed
            .header
            .iter()
            .map(|h| normalize_column_name(h))
            .collect();

        let find = |aliases: &[&str]| -> Option<usize> {
            aliases
                .iter()
                .find_map(|a| header.iter().position(|h| h == a))
        };

        let sample_idx = find(SAMPLE_ALIASES).ok_or_else(|| {
            anyhow::anyhow!("clinical table {} has no sample identifier column", file)
        })?;

        let width = parsed.header.len();
        for (i, line) in parsed.lines.iter().enumerate() {
            if line.len() != width {
                anyhow::bail!(
                    "clinical table {}: ragged line {} ({} fields, expected {})",
                    file,
                    i + 2,
                    line.len(),
                    width
                );
            }
        }

        let samples: Vec<Box<str>> = parsed
            .lines
            .iter()
            .map(|line| line[sample_idx].clone())
            .collect();

        let mut seen: HashMap<&str, usize> = HashMap::with_capacity(samples.len());
        for (i, s) in samples.iter().enumerate() {
            if let Some(prev) = seen.insert(s.as_ref(), i) {
                anyhow::bail!(
                    "duplicate sample id '{}' in clinical rows {} and {}",
                    s,
                    prev + 2,
                    i + 2
                );
            }
        }

        let mut columns = Vec::with_capacity(SCHEMA.len());
        for &(name, kind, aliases) in SCHEMA {
            let src = std::iter::once(name)
                .chain(aliases.iter().copied())
                .collect::<Vec<_>>();
            let j = find(&src).ok_or_else(|| {
                anyhow::anyhow!("clinical table {} is missing column '{}'", file, name)
            })?;

            let raw = parsed.lines.iter().map(|line| line[j].as_ref());
            let col = match kind {
                ColumnKind::Categorical => ClinicalColumn::Categorical(intern_categories(raw)),
                ColumnKind::Numeric => {
                    let (values, n_bad) = coerce_numeric(raw);
                    if n_bad > 0 {
                        warn!(
                            "clinical column '{}': {} non-numeric token(s) treated as missing",
                            name, n_bad
                        );
                    }
                    ClinicalColumn::Numeric(values)
                }
            };
            columns.push((Box::from(name), col));
        }

        info!(
            "normalized clinical table: {} samples x {} columns",
            samples.len(),
            columns.len() + 1
        );

        Ok(Self { samples, columns })
    }
}

/// lower-case and squeeze every non-alphanumeric run into a single '_'
pub fn normalize_column_name(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    let mut pending_sep = false;
    for ch in raw.chars() {
        if ch.is_ascii_alphanumeric() {
            if pending_sep && !out.is_empty() {
                out.push('_');
            }
            pending_sep = false;
            out.push(ch.to_ascii_lowercase());
        } else {
            pending_sep = true;
        }
    }
    out
}

fn is_missing(token: &str) -> bool {
    token.is_empty() || token == "NA"
}

fn intern_categories<'a>(raw: impl Iterator<Item = &'a str>) -> CategoricalColumn {
    let mut levels: Vec<Box<str>> = Vec::new();
    let mut level_of: HashMap<Box<str>, u32> = HashMap::new();
    let codes = raw
        .map(|tok| {
            if is_missing(tok) {
                None
            } else if let Some(&code) = level_of.get(tok) {
                Some(code)
            } else {
                let code = levels.len() as u32;
                levels.push(Box::from(tok));
                level_of.insert(Box::from(tok), code);
                Some(code)
            }
        })
        .collect();
    CategoricalColumn { levels, codes }
}

fn coerce_numeric<'a>(raw: impl Iterator<Item = &'a str>) -> (Vec<Option<f32>>, usize) {
    let mut n_bad = 0;
    let values = raw
        .map(|tok| {
            if is_missing(tok) {
                None
            } else {
                match tok.parse::<f32>() {
                    Ok(x) if x.is_finite() => Some(x),
                    _ => {
                        n_bad += 1;
                        None
                    }
                }
            }
        })
        .collect();
    (values, n_bad)
}
