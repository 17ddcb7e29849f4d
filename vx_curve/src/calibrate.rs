//! Mapping from graphic coordinates to physical units.
//!
//! Each axis is calibrated from two reference ticks whose graphic positions and
//! physical labels are known. Graphic y axes usually grow downward; that is
//! expressed by a `graphic_min` larger than `graphic_max`.

use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::series::SeriesPair;
use crate::VxError;

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq)]
pub struct AxisCalibration {
    pub graphic_min: f64,
    pub graphic_max: f64,
    pub physical_min: f64,
    pub physical_max: f64,
}

impl AxisCalibration {
    pub fn new(
        graphic_min: f64,
        graphic_max: f64,
        physical_min: f64,
        physical_max: f64,
    ) -> Result<Self, VxError> {
        let axis = Self {
            graphic_min,
            graphic_max,
            physical_min,
            physical_max,
        };
        axis.validate()?;
        Ok(axis)
    }

    pub fn validate(&self) -> Result<(), VxError> {
        let values = [
            self.graphic_min,
            self.graphic_max,
            self.physical_min,
            self.physical_max,
        ];
        if values.iter().any(|v| !v.is_finite()) {
            return Err(VxError::Calibration("tick values must be finite".into()));
        }
        if self.graphic_min == self.graphic_max {
            return Err(VxError::Calibration(format!(
                "reference ticks share graphic position {}",
                self.graphic_min
            )));
        }
        if self.physical_min == self.physical_max {
            return Err(VxError::Calibration(format!(
                "reference ticks share label {}",
                self.physical_min
            )));
        }
        Ok(())
    }

    /// Physical coordinate of graphic position `p`. Missing values pass through.
    pub fn apply(&self, p: f64) -> f64 {
        self.physical_min
            + (self.physical_max - self.physical_min) * (p - self.graphic_min)
                / (self.graphic_max - self.graphic_min)
    }

}

/// Calibration for both axes of a plot.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq)]
pub struct Calibration {
    pub x: AxisCalibration,
    pub y: AxisCalibration,
}

impl Calibration {
    pub fn from_json(text: &str) -> Result<Self, VxError> {
        let calibration: Calibration =
            serde_json::from_str(text).map_err(|e| VxError::Calibration(e.to_string()))?;
        calibration.x.validate()?;
        calibration.y.validate()?;
        Ok(calibration)
    }

    pub fn load(path: &Path) -> Result<Self, VxError> {
        let text = fs::read_to_string(path)
            .map_err(|e| VxError::Calibration(format!("{}: {}", path.display(), e)))?;
        Self::from_json(&text)
    }

    pub fn apply_point(&self, point: (f64, f64)) -> (f64, f64) {
        (self.x.apply(point.0), self.y.apply(point.1))
    }

    pub fn apply_series(&self, series: &SeriesPair) -> SeriesPair {
        let points: Vec<(f64, f64)> = series
            .t()
            .iter()
            .zip(series.v().iter())
            .map(|(&x, &y)| self.apply_point((x, y)))
            .collect();
        SeriesPair::from_points(&points)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_maps_ticks_to_labels() {
        let axis = AxisCalibration::new(100.0, 500.0, 150.0, 350.0).unwrap();
        assert_relative_eq!(axis.apply(100.0), 150.0);
        assert_relative_eq!(axis.apply(500.0), 350.0);
        assert_relative_eq!(axis.apply(300.0), 250.0);
    }

    #[test]
    fn test_flipped_axis() {
        // Graphic y grows downward: tick at 400 is the low label.
        let axis = AxisCalibration::new(400.0, 100.0, 0.0, 3.0).unwrap();
        assert_relative_eq!(axis.apply(400.0), 0.0);
        assert_relative_eq!(axis.apply(200.0), 2.0);
    }

    #[test]
    fn test_rejects_degenerate_ticks() {
        assert!(matches!(
            AxisCalibration::new(10.0, 10.0, 0.0, 1.0),
            Err(VxError::Calibration(_))
        ));
        assert!(matches!(
            AxisCalibration::new(0.0, 10.0, 5.0, 5.0),
            Err(VxError::Calibration(_))
        ));
        assert!(matches!(
            AxisCalibration::new(0.0, f64::NAN, 0.0, 1.0),
            Err(VxError::Calibration(_))
        ));
    }

    #[test]
    fn test_from_json_and_series() {
        let text = r#"{
            "x": {"graphic_min": 0.0, "graphic_max": 10.0, "physical_min": 100.0, "physical_max": 200.0},
            "y": {"graphic_min": 50.0, "graphic_max": 0.0, "physical_min": 0.0, "physical_max": 5.0}
        }"#;
        let cal = Calibration::from_json(text).unwrap();
        let series = SeriesPair::new(vec![0.0, 5.0, f64::NAN], vec![50.0, 25.0, 0.0]).unwrap();
        let mapped = cal.apply_series(&series);
        assert_relative_eq!(mapped.t()[1], 150.0);
        assert_relative_eq!(mapped.v()[1], 2.5);
        assert!(mapped.t()[2].is_nan());
        assert_relative_eq!(mapped.v()[2], 5.0);
    }

    #[test]
    fn test_from_json_rejects_bad_axis() {
        let text = r#"{
            "x": {"graphic_min": 1.0, "graphic_max": 1.0, "physical_min": 0.0, "physical_max": 1.0},
            "y": {"graphic_min": 0.0, "graphic_max": 1.0, "physical_min": 0.0, "physical_max": 1.0}
        }"#;
        assert!(Calibration::from_json(text).is_err());
        assert!(Calibration::from_json("not json").is_err());
    }
}
