use cv_core::consensus::Model;
use cv_core::nalgebra::{Matrix3, Vector3};
use cv_core::{FeatureMatch, KeyPoint};
use derive_more::{AsMut, AsRef, Deref, DerefMut, From, Into};

#[cfg(feature = "serde-serialize")]
use serde::{Deserialize, Serialize};

/// This stores a fundamental matrix, which is satisfied by the following constraint:
///
/// ```text
/// transpose(x') * F * x = 0
/// ```
///
/// Where `x` and `x'` are homogeneous pixel coordinates of the same world point in the first
/// and the second image. Unlike the essential matrix, it does not need calibrated cameras, which
/// makes it suitable for checking matches between a query image and an arbitrary map view.
///
/// `F * x` is the epipolar line of `x` in the second image and `transpose(F) * x'` is the
/// epipolar line of `x'` in the first image.
#[derive(Debug, Clone, Copy, PartialEq, PartialOrd, AsMut, AsRef, Deref, DerefMut, From, Into)]
#[cfg_attr(feature = "serde-serialize", derive(Serialize, Deserialize))]
pub struct FundamentalMatrix(pub Matrix3<f64>);

impl FundamentalMatrix {
    /// The algebraic error `transpose(x') * F * x`.
    pub fn algebraic_error(&self, FeatureMatch(a, b): &FeatureMatch<KeyPoint>) -> f64 {
        b.to_homogeneous().dot(&(self.0 * a.to_homogeneous()))
    }

    /// The pixel distances of `a` to the epipolar line of `b` and of `b` to the epipolar line
    /// of `a`, in that order.
    pub fn epipolar_distances(&self, feature_match: &FeatureMatch<KeyPoint>) -> [f64; 2] {
        let FeatureMatch(a, b) = feature_match;
        let error = self.algebraic_error(feature_match).abs();
        let line_in_b: Vector3<f64> = self.0 * a.to_homogeneous();
        let line_in_a: Vector3<f64> = self.0.transpose() * b.to_homogeneous();
        let distance = |line: Vector3<f64>| {
            let norm = line.xy().norm();
            if norm == 0.0 {
                f64::INFINITY
            } else {
                error / norm
            }
        };
        [distance(line_in_a), distance(line_in_b)]
    }

    /// Scales the matrix to a unit Frobenius norm.
    ///
    /// Returns `None` for the zero matrix.
    pub fn normalized(self) -> Option<Self> {
        let norm = self.0.norm();
        if norm == 0.0 || !norm.is_finite() {
            None
        } else {
            Some(Self(self.0 / norm))
        }
    }
}

impl Model<FeatureMatch<KeyPoint>> for FundamentalMatrix {
    /// The root mean square of the two epipolar distances, in pixels.
    fn residual(&self, data: &FeatureMatch<KeyPoint>) -> f64 {
        let [first, second] = self.epipolar_distances(data);
        ((first * first + second * second) * 0.5).sqrt()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    /// A pure horizontal translation: epipolar lines are image rows.
    fn horizontal() -> FundamentalMatrix {
        FundamentalMatrix(Matrix3::new(0.0, 0.0, 0.0, 0.0, 0.0, -1.0, 0.0, 1.0, 0.0))
    }

    #[test]
    fn residual_is_row_offset() {
        let on_line = FeatureMatch(KeyPoint::new(10.0, 20.0), KeyPoint::new(50.0, 20.0));
        assert_relative_eq!(horizontal().residual(&on_line), 0.0);
        let off_line = FeatureMatch(KeyPoint::new(10.0, 20.0), KeyPoint::new(50.0, 23.0));
        assert_relative_eq!(horizontal().residual(&off_line), 3.0, epsilon = 1e-12);
    }

    #[test]
    fn normalized_has_unit_norm() {
        let f = FundamentalMatrix(horizontal().0 * 7.0).normalized().unwrap();
        assert_relative_eq!(f.0.norm(), 1.0, epsilon = 1e-12);
        assert!(FundamentalMatrix(Matrix3::zeros()).normalized().is_none());
    }
}
