//! Index-aligned `(T, V)` columns with missing-value handling.

use std::cmp::Ordering;

use ndarray::Array1;

use crate::VxError;

/// Two equal-length columns: independent `t` and dependent `v`.
///
/// Missing entries are stored as `NaN`; any non-finite value counts as
/// missing.
#[derive(Clone, Debug, PartialEq)]
pub struct SeriesPair {
    t: Array1<f64>,
    v: Array1<f64>,
}

impl SeriesPair {
    pub fn new(t: Vec<f64>, v: Vec<f64>) -> Result<Self, VxError> {
        if t.len() != v.len() {
            return Err(VxError::LengthMismatch {
                t_len: t.len(),
                v_len: v.len(),
            });
        }
        Ok(Self {
            t: Array1::from_vec(t),
            v: Array1::from_vec(v),
        })
    }

    pub fn from_points(points: &[(f64, f64)]) -> Self {
        let (t, v): (Vec<_>, Vec<_>) = points.iter().copied().unzip();
        Self {
            t: Array1::from_vec(t),
            v: Array1::from_vec(v),
        }
    }

    pub fn len(&self) -> usize {
        self.t.len()
    }

    pub fn is_empty(&self) -> bool {
        self.t.is_empty()
    }

    pub fn t(&self) -> &[f64] {
        self.t.as_slice().unwrap_or(&[])
    }

    pub fn v(&self) -> &[f64] {
        self.v.as_slice().unwrap_or(&[])
    }

    /// First differences `(dT, dV)`; index 0 has no predecessor and is `NaN`.
    pub fn increments(&self) -> (Array1<f64>, Array1<f64>) {
        (first_difference(&self.t), first_difference(&self.v))
    }

    /// Whether row `i` has finite `T`, `V` and finite increments.
    ///
    /// Row 0 is never valid since it has no increment.
    pub fn is_valid_row(&self, i: usize) -> bool {
        i > 0
            && i < self.len()
            && self.t[i].is_finite()
            && self.v[i].is_finite()
            && self.t[i - 1].is_finite()
            && self.v[i - 1].is_finite()
    }

    pub fn valid_rows(&self) -> usize {
        (0..self.len()).filter(|&i| self.is_valid_row(i)).count()
    }

    /// Index of the `n`-th valid row (1-based count), if there is one.
    pub fn nth_valid_row(&self, n: usize) -> Option<usize> {
        if n == 0 {
            return None;
        }
        (0..self.len()).filter(|&i| self.is_valid_row(i)).nth(n - 1)
    }

    /// Number of leading rows where `T` or `V` is missing.
    pub fn leading_gap(&self) -> usize {
        self.t
            .iter()
            .zip(self.v.iter())
            .take_while(|(t, v)| !t.is_finite() || !v.is_finite())
            .count()
    }

    /// Indices after the first valid row where `T` or `V` is missing.
    pub fn interior_gaps(&self) -> Vec<usize> {
        let Some(first) = self.nth_valid_row(1) else {
            return Vec::new();
        };
        (first..self.len())
            .filter(|&i| !self.t[i].is_finite() || !self.v[i].is_finite())
            .collect()
    }

    /// Indices `i` where `T[i] == T[i - 1]` with both values present.
    pub fn repeated_steps(&self) -> Vec<usize> {
        (1..self.len())
            .filter(|&i| self.t[i].is_finite() && self.t[i] == self.t[i - 1])
            .collect()
    }

    /// Rows ordered by `t`; missing `t` sorts last, ties keep input order.
    pub fn sorted_by_independent(&self) -> Self {
        let mut rows: Vec<(f64, f64)> = self
            .t
            .iter()
            .copied()
            .zip(self.v.iter().copied())
            .collect();
        rows.sort_by(|a, b| match (a.0.is_finite(), b.0.is_finite()) {
            (true, true) => a.0.partial_cmp(&b.0).unwrap_or(Ordering::Equal),
            (true, false) => Ordering::Less,
            (false, true) => Ordering::Greater,
            (false, false) => Ordering::Equal,
        });
        Self::from_points(&rows)
    }
}

fn first_difference(values: &Array1<f64>) -> Array1<f64> {
    let mut out = Vec::with_capacity(values.len());
    if values.is_empty() {
        return Array1::from_vec(out);
    }
    out.push(f64::NAN);
    for w in values.windows(2) {
        out.push(w[1] - w[0]);
    }
    Array1::from_vec(out)
}
