use crate::common_io::{open_buf_writer, read_lines_of_words_delim, Delimiter};
use std::collections::HashMap;
use std::io::Write;

pub type Mat = nalgebra::DMatrix<f32>;

/// A dense matrix with unique row and column labels attached.
///
/// The shape is fixed once constructed; missing values are `f32::NAN`.
/// All the subsetting operations return a new matrix rather than
/// mutating in place.
#[derive(Debug, Clone)]
pub struct MatWithNames {
    pub rows: Vec<Box<str>>,
    pub cols: Vec<Box<str>>,
    pub mat: Mat,
}

/// Row-wise standardization output
pub struct ScaledRows {
    pub out: MatWithNames,
    pub n_dropped: usize,
}

impl MatWithNames {
    pub fn new(rows: Vec<Box<str>>, cols: Vec<Box<str>>, mat: Mat) -> anyhow::Result<Self> {
        if rows.len() != mat.nrows() || cols.len() != mat.ncols() {
            anyhow::bail!(
                "label/shape mismatch: {} x {} labels vs {} x {} matrix",
                rows.len(),
                cols.len(),
                mat.nrows(),
                mat.ncols()
            );
        }
        check_unique(&rows, "row")?;
        check_unique(&cols, "column")?;
        Ok(Self { rows, cols, mat })
    }

    pub fn nrows(&self) -> usize {
        self.mat.nrows()
    }

    pub fn ncols(&self) -> usize {
        self.mat.ncols()
    }

    /// Take a subset of rows in the given index order
    pub fn select_rows(&self, idx: &[usize]) -> Self {
        Self {
            rows: idx.iter().map(|&i| self.rows[i].clone()).collect(),
            cols: self.cols.clone(),
            mat: self.mat.select_rows(idx.iter()),
        }
    }

    /// Take a subset of columns in the given index order
    pub fn select_columns(&self, idx: &[usize]) -> Self {
        Self {
            rows: self.rows.clone(),
            cols: idx.iter().map(|&j| self.cols[j].clone()).collect(),
            mat: self.mat.select_columns(idx.iter()),
        }
    }

    /// Swap rows and columns
    pub fn transposed(&self) -> Self {
        Self {
            rows: self.cols.clone(),
            cols: self.rows.clone(),
            mat: self.mat.transpose(),
        }
    }

    /// Row-wise mean and sample variance (ddof = 1) over finite
    /// entries. A row with no finite entry gets a NaN mean; a row with
    /// fewer than two finite entries gets a NaN variance.
    pub fn row_mean_variance(&self) -> (Vec<f32>, Vec<f32>) {
        let nrow = self.nrows();
        let mut means = Vec::with_capacity(nrow);
        let mut vars = Vec::with_capacity(nrow);

        for i in 0..nrow {
            let mut nn = 0_usize;
            let mut s1 = 0_f64;
            let mut s2 = 0_f64;
            for j in 0..self.ncols() {
                let x = self.mat[(i, j)];
                if x.is_finite() {
                    nn += 1;
                    s1 += x as f64;
                    s2 += (x as f64) * (x as f64);
                }
            }
            let mu = if nn > 0 { s1 / nn as f64 } else { f64::NAN };
            let var = if nn > 1 {
                ((s2 - s1 * mu) / (nn as f64 - 1.0)).max(0.0)
            } else {
                f64::NAN
            };
            means.push(mu as f32);
            vars.push(var as f32);
        }
        (means, vars)
    }

    /// Row-wise count of finite entries at or above the cutoff value
    pub fn row_support(&self, cutoff: f32) -> Vec<usize> {
        (0..self.nrows())
            .map(|i| {
                (0..self.ncols())
                    .filter(|&j| {
                        let x = self.mat[(i, j)];
                        x.is_finite() && x >= cutoff
                    })
                    .count()
            })
            .collect()
    }

    /// Standardize each row to zero mean and unit variance (ddof = 1).
    ///
    /// Rows with zero or undefined standard deviation are dropped, so
    /// the output has at most as many rows as the input. Missing
    /// entries of a retained row become 0.0 (the standardized row
    /// mean), keeping the output finite everywhere.
    pub fn standardize_rows(&self) -> ScaledRows {
        let (means, vars) = self.row_mean_variance();

        let kept: Vec<usize> = (0..self.nrows())
            .filter(|&i| vars[i].is_finite() && vars[i] > 0.0)
            .collect();

        let mut mat = Mat::zeros(kept.len(), self.ncols());
        for (ii, &i) in kept.iter().enumerate() {
            let mu = means[i];
            let sd = vars[i].sqrt();
            for j in 0..self.ncols() {
                let x = self.mat[(i, j)];
                mat[(ii, j)] = if x.is_finite() { (x - mu) / sd } else { 0.0 };
            }
        }

        let out = Self {
            rows: kept.iter().map(|&i| self.rows[i].clone()).collect(),
            cols: self.cols.clone(),
            mat,
        };

        ScaledRows {
            n_dropped: self.nrows() - out.nrows(),
            out,
        }
    }

    ///
    /// Read a labeled matrix from a delimited text file. The header
    /// line carries the column labels (with or without a leading
    /// corner label); each following line is a row label followed by
    /// the values. `NA`, empty, or unparseable tokens become NaN.
    ///
    pub fn read_delim(file: &str, delim: impl Into<Delimiter>) -> anyhow::Result<Self> {
        let parsed = read_lines_of_words_delim(file, delim, 0)?;

        if parsed.lines.is_empty() {
            anyhow::bail!("no data rows in {}", file);
        }

        let width = parsed.lines[0].len();
        if width < 2 {
            anyhow::bail!("expected row label + values in {}", file);
        }
        let ncol = width - 1;

        // header may or may not include a corner label
        let cols: Vec<Box<str>> = if parsed.header.len() == ncol {
            parsed.header.clone()
        } else if parsed.header.len() == ncol + 1 {
            parsed.header[1..].to_vec()
        } else {
            anyhow::bail!(
                "header width {} does not match data width {} in {}",
                parsed.header.len(),
                width,
                file
            );
        };

        let mut rows = Vec::with_capacity(parsed.lines.len());
        let mut values = Vec::with_capacity(parsed.lines.len() * ncol);
        for (i, line) in parsed.lines.iter().enumerate() {
            if line.len() != width {
                anyhow::bail!(
                    "ragged line {} in {}: {} fields, expected {}",
                    i + 2,
                    file,
                    line.len(),
                    width
                );
            }
            rows.push(line[0].clone());
            values.extend(line[1..].iter().map(|tok| parse_value(tok)));
        }

        let mat = Mat::from_row_iterator(rows.len(), ncol, values.into_iter());
        Self::new(rows, cols, mat)
    }

    pub fn from_tsv(file: &str) -> anyhow::Result<Self> {
        Self::read_delim(file, &['\t', ','])
    }

    ///
    /// Write the labeled matrix as a delimited text file; NaN values
    /// are written back as `NA`.
    ///
    /// * `corner` - label for the top-left header cell
    ///
    pub fn write_delim(&self, file: &str, sep: &str, corner: &str) -> anyhow::Result<()> {
        let mut buf = open_buf_writer(file)?;

        let header: Vec<&str> = std::iter::once(corner)
            .chain(self.cols.iter().map(|x| x.as_ref()))
            .collect();
        writeln!(buf, "{}", header.join(sep))?;

        for i in 0..self.nrows() {
            let mut line = String::with_capacity(16 * (self.ncols() + 1));
            line.push_str(self.rows[i].as_ref());
            for j in 0..self.ncols() {
                line.push_str(sep);
                let x = self.mat[(i, j)];
                if x.is_finite() {
                    line.push_str(&format!("{}", x));
                } else {
                    line.push_str("NA");
                }
            }
            writeln!(buf, "{}", line)?;
        }
        buf.flush()?;
        Ok(())
    }

    pub fn to_tsv(&self, file: &str, corner: &str) -> anyhow::Result<()> {
        self.write_delim(file, "\t", corner)
    }
}

fn parse_value(tok: &str) -> f32 {
    if tok.is_empty() || tok == "NA" {
        return f32::NAN;
    }
    tok.parse::<f32>().unwrap_or(f32::NAN)
}

fn check_unique(names: &[Box<str>], what: &str) -> anyhow::Result<()> {
    let mut seen: HashMap<&str, usize> = HashMap::with_capacity(names.len());
    for (i, name) in names.iter().enumerate() {
        if let Some(prev) = seen.insert(name.as_ref(), i) {
            anyhow::bail!(
                "duplicate {} label '{}' at positions {} and {}",
                what,
                name,
                prev,
                i
            );
        }
    }
    Ok(())
}
