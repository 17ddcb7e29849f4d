//! Curve reconstruction for plots digitized from vector graphics.
//!
//! Digitized traces of instruments with a periodic scale carry jumps of an
//! integer number of quanta. [`unwrap`] walks a `(T, V)` series, re-aligns each
//! step with the slope of the previous corrected step, and returns the
//! accumulated difference between raw and corrected increments.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;

pub mod calibrate;
pub mod matcher;
pub mod series;
pub mod unwrap;

pub use calibrate::{AxisCalibration, Calibration};
pub use matcher::{line_up, Increment, MatchFailure, Matched, Matcher};
pub use series::SeriesPair;
pub use unwrap::{decompose, unwrap, unwrap_with, Decomposition, UnwrapDiagnostics};

/// Upper bound on matcher steps for a single increment.
pub const DEFAULT_MAX_ITERATIONS: usize = 100_000;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum VxError {
    #[error("insufficient data: at least two valid rows are required")]
    InsufficientData,
    #[error("degenerate step at index {index}: independent variable does not change")]
    DegenerateStep { index: usize },
    #[error("matcher did not converge at index {index} after {iterations} iterations")]
    NonConvergence { index: usize, iterations: usize },
    #[error("missing or non-finite value inside the series at index {index}")]
    NonFiniteStep { index: usize },
    #[error("series length mismatch: {t_len} independent vs {v_len} dependent values")]
    LengthMismatch { t_len: usize, v_len: usize },
    #[error("invalid parameter: {0}")]
    InvalidParameter(String),
    #[error("invalid calibration: {0}")]
    Calibration(String),
}

/// How the matcher picks the multiple of the quantum for each step.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum MatchStrategy {
    /// Step one quantum at a time while the slope distance strictly shrinks.
    HillClimb,
    /// Round the slope offset to the nearest multiple directly.
    Rounding,
}

impl Default for MatchStrategy {
    fn default() -> Self {
        MatchStrategy::HillClimb
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct Params {
    pub quantum: f64,
    pub strategy: MatchStrategy,
    pub max_iterations: usize,
}

impl Params {
    pub fn new(quantum: f64) -> Self {
        Self {
            quantum,
            strategy: MatchStrategy::default(),
            max_iterations: DEFAULT_MAX_ITERATIONS,
        }
    }

    pub fn validate(&self) -> Result<(), VxError> {
        if !self.quantum.is_finite() || self.quantum <= 0.0 {
            return Err(VxError::InvalidParameter(format!(
                "quantum must be finite and > 0, got {}",
                self.quantum
            )));
        }
        if self.max_iterations == 0 {
            return Err(VxError::InvalidParameter(
                "max_iterations must be at least 1".into(),
            ));
        }
        Ok(())
    }

    /// Hex SHA-256 of the canonical JSON encoding, used to tag reports.
    pub fn params_hash_sha256(&self) -> Result<String, VxError> {
        let bytes =
            serde_json::to_vec(self).map_err(|e| VxError::InvalidParameter(e.to_string()))?;
        Ok(sha256_hex(&bytes))
    }
}

fn sha256_hex(bytes: &[u8]) -> String {
    let digest = Sha256::digest(bytes);
    let mut out = String::with_capacity(digest.len() * 2);
    for b in digest {
        use std::fmt::Write;
        let _ = write!(&mut out, "{:02x}", b);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_params_validate_rejects_bad_quantum() {
        for q in [0.0, -1.0, f64::NAN, f64::INFINITY] {
            let err = Params::new(q).validate().unwrap_err();
            assert!(matches!(err, VxError::InvalidParameter(_)), "quantum {q}");
        }
        assert!(Params::new(0.25).validate().is_ok());
    }

    #[test]
    fn test_params_hash_is_stable() {
        let a = Params::new(1.5).params_hash_sha256().unwrap();
        let b = Params::new(1.5).params_hash_sha256().unwrap();
        let c = Params::new(3.0).params_hash_sha256().unwrap();
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(a.len(), 64);
    }

    #[test]
    fn test_strategy_serializes_snake_case() {
        let json = serde_json::to_string(&MatchStrategy::HillClimb).unwrap();
        assert_eq!(json, "\"hill_climb\"");
    }
}
