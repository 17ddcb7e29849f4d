//! Sequential unwrapping of a quantized `(T, V)` series.
//!
//! The first two valid rows seed the reference slope. Every later step is
//! passed through the [`Matcher`] against the previous *corrected* step, so
//! corrections accumulate. The result is the running sum of
//! `raw dV - corrected dV`, i.e. the part of `V` that the smooth trend does not
//! explain.

use serde::Serialize;
use tracing::debug;

use crate::matcher::{Increment, Matcher};
use crate::series::SeriesPair;
use crate::{Params, VxError};

#[derive(Clone, Debug, Serialize, Default, PartialEq)]
pub struct UnwrapDiagnostics {
    /// Index of the second valid row, the first corrected step.
    pub seed_index: usize,
    /// Leading rows with a missing `T` or `V`.
    pub leading_rows: usize,
    /// Steps that received a non-zero shift.
    pub corrected_steps: usize,
    pub max_abs_shift: i64,
    pub params_hash: String,
}

/// Full result of one unwrapping pass, aligned with the input rows.
#[derive(Clone, Debug, Serialize, PartialEq)]
pub struct Decomposition {
    pub independent: Vec<f64>,
    pub raw: Vec<f64>,
    /// `raw - residual`: the unwrapped trend.
    pub smooth: Vec<f64>,
    /// Cumulative `raw dV - corrected dV`.
    pub residual: Vec<f64>,
    /// Corrected increment per row; `NaN` where no increment exists.
    pub corrected_increments: Vec<f64>,
    /// Quanta added to the raw increment per row.
    pub shifts: Vec<i64>,
    pub diagnostics: UnwrapDiagnostics,
}

impl Decomposition {
    pub fn len(&self) -> usize {
        self.residual.len()
    }

    pub fn is_empty(&self) -> bool {
        self.residual.is_empty()
    }
}

/// Unwrap `v` against `t` with the default hill-climb matcher.
///
/// Returns the residual series, same length as the inputs.
pub fn unwrap(t: &[f64], v: &[f64], quantum: f64) -> Result<Vec<f64>, VxError> {
    unwrap_with(t, v, &Params::new(quantum))
}

pub fn unwrap_with(t: &[f64], v: &[f64], params: &Params) -> Result<Vec<f64>, VxError> {
    decompose(t, v, params).map(|d| d.residual)
}

pub fn decompose(t: &[f64], v: &[f64], params: &Params) -> Result<Decomposition, VxError> {
    params.validate()?;
    let series = SeriesPair::new(t.to_vec(), v.to_vec())?;
    let n = series.len();
    let seed = series.nth_valid_row(2).ok_or(VxError::InsufficientData)?;
    let (dt, dv) = series.increments();
    let matcher = Matcher::new(params);

    let mut corrected = Vec::with_capacity(n);
    let mut shifts = vec![0_i64; n];
    corrected.extend(dv.iter().take(seed).copied());

    let mut reference = Increment::new(dv[seed - 1], dt[seed - 1]);
    if !reference.is_finite() {
        return Err(VxError::NonFiniteStep { index: seed - 1 });
    }
    if reference.dt == 0.0 {
        return Err(VxError::DegenerateStep { index: seed - 1 });
    }

    for i in seed..n {
        let matched = matcher
            .line_up(reference, Increment::new(dv[i], dt[i]))
            .map_err(|failure| failure.at(i))?;
        corrected.push(matched.dv);
        shifts[i] = matched.shift;
        reference = Increment::new(matched.dv, dt[i]);
    }

    let mut residual = Vec::with_capacity(n);
    let mut total = 0.0;
    for (i, (&raw, &fixed)) in dv.iter().zip(corrected.iter()).enumerate() {
        if i >= seed {
            total += raw - fixed;
        }
        residual.push(total);
    }

    let smooth = series
        .v()
        .iter()
        .zip(residual.iter())
        .map(|(&value, &r)| value - r)
        .collect();

    let corrected_steps = shifts.iter().filter(|&&s| s != 0).count();
    let max_abs_shift = shifts.iter().map(|s| s.abs()).max().unwrap_or(0);
    debug!(
        rows = n,
        seed_index = seed,
        corrected_steps,
        max_abs_shift,
        "unwrapped series"
    );

    Ok(Decomposition {
        independent: series.t().to_vec(),
        raw: series.v().to_vec(),
        smooth,
        residual,
        corrected_increments: corrected,
        shifts,
        diagnostics: UnwrapDiagnostics {
            seed_index: seed,
            leading_rows: series.leading_gap(),
            corrected_steps,
            max_abs_shift,
            params_hash: params.params_hash_sha256()?,
        },
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::MatchStrategy;
    use approx::assert_abs_diff_eq;

    const NAN: f64 = f64::NAN;

    fn ramp(n: usize) -> Vec<f64> {
        (0..n).map(|i| i as f64).collect()
    }

    #[test]
    fn test_no_wrap_gives_zero_residual() {
        let t = ramp(5);
        let out = unwrap(&t, &t, 10.0).unwrap();
        assert_eq!(out, vec![0.0; 5]);
    }

    #[test]
    fn test_single_jump_is_isolated() {
        let q = 2.5;
        let t = ramp(5);
        let v = vec![0.0, 1.0, 2.0, 3.0 + q, 4.0 + q];
        let d = decompose(&t, &v, &Params::new(q)).unwrap();
        assert_eq!(d.residual, vec![0.0, 0.0, 0.0, q, q]);
        assert_eq!(d.smooth, vec![0.0, 1.0, 2.0, 3.0, 4.0]);
        assert_eq!(d.shifts, vec![0, 0, 0, -1, 0]);
        assert_eq!(d.diagnostics.seed_index, 2);
        assert_eq!(d.diagnostics.corrected_steps, 1);
        assert_eq!(d.diagnostics.max_abs_shift, 1);
    }

    #[test]
    fn test_leading_rows_keep_raw_increments() {
        let t = vec![NAN, NAN, 2.0, 3.0, 4.0, 5.0];
        let v = vec![NAN, NAN, 2.0, 3.0, 4.0 + 2.0, 5.0 + 2.0];
        let d = decompose(&t, &v, &Params::new(2.0)).unwrap();
        assert_eq!(d.len(), 6);
        assert_eq!(d.residual, vec![0.0, 0.0, 0.0, 0.0, 2.0, 2.0]);
        assert_eq!(d.diagnostics.seed_index, 4);
        assert_eq!(d.diagnostics.leading_rows, 2);
        assert!(d.corrected_increments[..3].iter().all(|x| x.is_nan()));
        assert_eq!(d.corrected_increments[3], 1.0);
        assert!(d.smooth[0].is_nan());
    }

    #[test]
    fn test_insufficient_data() {
        assert_eq!(unwrap(&[1.0], &[1.0], 1.0), Err(VxError::InsufficientData));
        assert_eq!(
            unwrap(&[0.0, 1.0], &[0.0, 1.0], 1.0),
            Err(VxError::InsufficientData)
        );
        assert_eq!(
            unwrap(&[NAN, NAN, NAN], &[NAN, NAN, NAN], 1.0),
            Err(VxError::InsufficientData)
        );
        assert_eq!(unwrap(&[], &[], 1.0), Err(VxError::InsufficientData));
    }

    #[test]
    fn test_repeated_independent_value() {
        let t = vec![0.0, 1.0, 2.0, 2.0, 3.0];
        let v = ramp(5);
        assert_eq!(
            unwrap(&t, &v, 1.0),
            Err(VxError::DegenerateStep { index: 3 })
        );
    }

    #[test]
    fn test_degenerate_reference_step() {
        let t = vec![0.0, 0.0, 1.0, 2.0];
        let v = ramp(4);
        assert_eq!(
            unwrap(&t, &v, 1.0),
            Err(VxError::DegenerateStep { index: 1 })
        );
    }

    #[test]
    fn test_interior_gap_is_rejected() {
        let t = vec![0.0, 1.0, 2.0, NAN, 4.0, 5.0];
        let v = ramp(6);
        assert_eq!(
            unwrap(&t, &v, 1.0),
            Err(VxError::NonFiniteStep { index: 3 })
        );
    }

    #[test]
    fn test_length_mismatch_and_bad_quantum() {
        assert_eq!(
            unwrap(&[0.0, 1.0, 2.0], &[0.0, 1.0], 1.0),
            Err(VxError::LengthMismatch { t_len: 3, v_len: 2 })
        );
        assert!(matches!(
            unwrap(&ramp(4), &ramp(4), 0.0),
            Err(VxError::InvalidParameter(_))
        ));
    }

    #[test]
    fn test_recovers_wrapped_parabola() {
        let q = 3.0;
        let t = ramp(50);
        let truth: Vec<f64> = t.iter().map(|x| 0.05 * x * x).collect();
        let wrapped: Vec<f64> = truth.iter().map(|y| y.rem_euclid(q)).collect();
        for strategy in [MatchStrategy::HillClimb, MatchStrategy::Rounding] {
            let mut params = Params::new(q);
            params.strategy = strategy;
            let d = decompose(&t, &wrapped, &params).unwrap();
            for (s, y) in d.smooth.iter().zip(truth.iter()) {
                assert_abs_diff_eq!(*s, *y, epsilon = 1e-9);
            }
        }
    }
}
