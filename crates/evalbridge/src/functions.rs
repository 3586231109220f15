//! Reference objective functions used by the demo binary and the tests.

use std::f64::consts::PI;

use crate::objective::{Objective, ObjectiveError};

/// `offset + Σ (x_i − center)²`, minimum `offset` at `x_i = center`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct OffsetSphere {
    pub center: f64,
    pub offset: f64,
}

impl OffsetSphere {
    pub fn new(center: f64, offset: f64) -> Self {
        Self { center, offset }
    }

    pub fn value(&self, point: &[f64]) -> f64 {
        point
            .iter()
            .map(|x| (x - self.center) * (x - self.center))
            .fold(self.offset, |acc, sq| acc + sq)
    }
}

impl Default for OffsetSphere {
    fn default() -> Self {
        Self::new(0.53, 10.0)
    }
}

impl Objective for OffsetSphere {
    fn evaluate(&mut self, point: &[f64]) -> Result<f64, ObjectiveError> {
        Ok(self.value(point))
    }
}

/// Branin-Hoo on the unit square, rescaled to `x ∈ [-5, 10]`, `y ∈ [0, 15]`.
///
/// Global minimum ≈ 0.397887.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Branin;

impl Branin {
    pub fn value(x: f64, y: f64) -> f64 {
        let x = x * 15.0 - 5.0;
        let y = y * 15.0;
        let b = 5.1 / (4.0 * PI * PI);
        let c = 5.0 / PI;
        let t = 1.0 / (8.0 * PI);
        let inner = y - b * x * x + c * x - 6.0;
        inner * inner + 10.0 * (1.0 - t) * x.cos() + 10.0
    }
}

impl Objective for Branin {
    fn evaluate(&mut self, point: &[f64]) -> Result<f64, ObjectiveError> {
        match point {
            [x, y] => Ok(Self::value(*x, *y)),
            _ => Err(ObjectiveError::new(format!(
                "branin takes 2 coordinates, got {}",
                point.len()
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sphere_minimum_is_exact() {
        let f = OffsetSphere::default();
        assert_eq!(f.value(&[0.53, 0.53]), 10.0);
    }

    #[test]
    fn sphere_off_center() {
        let f = OffsetSphere::default();
        let v = f.value(&[0.5, 0.5]);
        assert!((v - 10.0018).abs() < 1e-12, "{v}");
    }

    #[test]
    fn branin_known_minimum() {
        // (π, 2.275) in the original domain.
        let x = (PI + 5.0) / 15.0;
        let y = 2.275 / 15.0;
        assert!((Branin::value(x, y) - 0.397887).abs() < 1e-5);
    }

    #[test]
    fn branin_rejects_wrong_dimension() {
        let mut f = Branin;
        assert!(f.evaluate(&[0.1, 0.2, 0.3]).is_err());
    }
}
