//! Derivative matching between two adjacent steps.
//!
//! Given the slope of the previous (already corrected) step, pick the integer
//! multiple of the quantum that, added to the current raw increment, brings the
//! current slope closest to the previous one.

use thiserror::Error;

use crate::{MatchStrategy, Params, VxError, DEFAULT_MAX_ITERATIONS};

/// One step of a series: the change of the dependent and independent values.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Increment {
    pub dv: f64,
    pub dt: f64,
}

impl Increment {
    pub fn new(dv: f64, dt: f64) -> Self {
        Self { dv, dt }
    }

    pub fn slope(&self) -> f64 {
        self.dv / self.dt
    }

    pub fn is_finite(&self) -> bool {
        self.dv.is_finite() && self.dt.is_finite()
    }
}

/// A corrected increment and the number of quanta added to the raw value.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Matched {
    pub dv: f64,
    pub shift: i64,
}

#[derive(Error, Debug, Clone, Copy, PartialEq)]
pub enum MatchFailure {
    #[error("zero step in the independent variable")]
    ZeroStep,
    #[error("non-finite increment")]
    NonFinite,
    #[error("no convergence after {iterations} iterations")]
    NonConvergence { iterations: usize },
    #[error("quantum must be finite and > 0")]
    InvalidQuantum,
}

impl MatchFailure {
    /// Attach the series index the failure was detected at.
    pub fn at(self, index: usize) -> VxError {
        match self {
            MatchFailure::ZeroStep => VxError::DegenerateStep { index },
            MatchFailure::NonFinite => VxError::NonFiniteStep { index },
            MatchFailure::NonConvergence { iterations } => {
                VxError::NonConvergence { index, iterations }
            }
            MatchFailure::InvalidQuantum => {
                VxError::InvalidParameter("quantum must be finite and > 0".into())
            }
        }
    }
}

#[derive(Clone, Debug)]
pub struct Matcher {
    quantum: f64,
    strategy: MatchStrategy,
    max_iterations: usize,
}

impl Matcher {
    pub fn new(params: &Params) -> Self {
        Self {
            quantum: params.quantum,
            strategy: params.strategy,
            max_iterations: params.max_iterations.max(1),
        }
    }

    /// Correct `candidate` so that its slope best continues `reference`.
    ///
    /// Ties between the unchanged value and a shifted one keep the unchanged
    /// value.
    pub fn line_up(
        &self,
        reference: Increment,
        candidate: Increment,
    ) -> Result<Matched, MatchFailure> {
        if !self.quantum.is_finite() || self.quantum <= 0.0 {
            return Err(MatchFailure::InvalidQuantum);
        }
        if reference.dt == 0.0 || candidate.dt == 0.0 {
            return Err(MatchFailure::ZeroStep);
        }
        if !reference.is_finite() || !candidate.is_finite() {
            return Err(MatchFailure::NonFinite);
        }
        let target = reference.slope();
        if !target.is_finite() || !candidate.slope().is_finite() {
            return Err(MatchFailure::NonFinite);
        }
        match self.strategy {
            MatchStrategy::HillClimb => self.hill_climb(target, candidate),
            MatchStrategy::Rounding => self.nearest_multiple(target, candidate),
        }
    }

    fn hill_climb(&self, target: f64, candidate: Increment) -> Result<Matched, MatchFailure> {
        let q = self.quantum;
        let dt = candidate.dt;
        let mut shift: i64 = 0;
        for _ in 0..self.max_iterations {
            let dv = candidate.dv + shift as f64 * q;
            let here = (target - dv / dt).abs();
            let up = (target - (dv + q) / dt).abs();
            let down = (target - (dv - q) / dt).abs();
            if up < here && up <= down {
                shift += 1;
            } else if down < here {
                shift -= 1;
            } else {
                return Ok(Matched { dv, shift });
            }
        }
        Err(MatchFailure::NonConvergence {
            iterations: self.max_iterations,
        })
    }

    fn nearest_multiple(
        &self,
        target: f64,
        candidate: Increment,
    ) -> Result<Matched, MatchFailure> {
        let offset = (target * candidate.dt - candidate.dv) / self.quantum;
        if !offset.is_finite() {
            return Err(MatchFailure::NonFinite);
        }
        let k = round_half_toward_zero(offset);
        // The hill climb needs |k| + 1 rounds to settle on the same multiple.
        if k.abs() >= self.max_iterations as f64 {
            return Err(MatchFailure::NonConvergence {
                iterations: self.max_iterations,
            });
        }
        let shift = k as i64;
        Ok(Matched {
            dv: candidate.dv + shift as f64 * self.quantum,
            shift,
        })
    }
}

fn round_half_toward_zero(x: f64) -> f64 {
    let r = x.signum() * (x.abs() - 0.5).ceil();
    if r == 0.0 {
        0.0
    } else {
        r
    }
}

/// Convenience form of [`Matcher::line_up`] with the default hill-climb search.
pub fn line_up(
    prev_dv: f64,
    prev_dt: f64,
    curr_dv: f64,
    curr_dt: f64,
    quantum: f64,
) -> Result<f64, MatchFailure> {
    let matcher = Matcher {
        quantum,
        strategy: MatchStrategy::HillClimb,
        max_iterations: DEFAULT_MAX_ITERATIONS,
    };
    matcher
        .line_up(Increment::new(prev_dv, prev_dt), Increment::new(curr_dv, curr_dt))
        .map(|m| m.dv)
}
