use derive_more::{AsMut, AsRef, Deref, DerefMut, From, Into};
use nalgebra::{Matrix3, Rotation3, Unit, Vector3};

#[cfg(feature = "serde-serialize")]
use serde::{Deserialize, Serialize};

/// Contains a member of the lie algebra so(3), the tangent space of 3d rotations.
///
/// This is only intended to be used in optimization problems where it is desirable to
/// have unconstrained variables representing the degrees of freedom of a rotation.
/// Rotations should otherwise be stored as rotation matrices.
#[derive(Debug, Clone, Copy, PartialEq, PartialOrd, AsMut, AsRef, Deref, DerefMut, From, Into)]
#[cfg_attr(feature = "serde-serialize", derive(Serialize, Deserialize))]
pub struct Skew3(pub Vector3<f64>);

impl Skew3 {
    /// Converts the Skew3 to a Rotation3 matrix.
    pub fn rotation(self) -> Rotation3<f64> {
        self.into()
    }

    /// Converts the Skew3 into a Rotation3 matrix quickly, but only works when the rotation
    /// is very small.
    pub fn rotation_small(self) -> Rotation3<f64> {
        Rotation3::from_matrix(&(Matrix3::identity() + self.hat()))
    }

    /// This converts the Skew3 into its skew-symmetric matrix form.
    pub fn hat(self) -> Matrix3<f64> {
        self.0.cross_matrix()
    }

    /// This converts a matrix in skew-symmetric form into a Skew3.
    ///
    /// Warning: Does no check to ensure matrix is actually skew-symmetric.
    pub fn vee(mat: Matrix3<f64>) -> Self {
        Self(Vector3::new(mat.m32, mat.m13, mat.m21))
    }
}

/// This is the exponential map.
impl From<Skew3> for Rotation3<f64> {
    fn from(w: Skew3) -> Self {
        let theta2 = w.0.norm_squared();
        if theta2 <= f64::EPSILON {
            w.rotation_small()
        } else {
            let theta = theta2.sqrt();
            let axis = Unit::new_unchecked(w.0 / theta);
            Self::from_axis_angle(&axis, theta)
        }
    }
}

/// Below this distance from `pi` the axis is read from the symmetric part of the rotation.
const NEAR_PI: f64 = 1e-3;

/// This is the log map.
impl From<Rotation3<f64>> for Skew3 {
    fn from(r: Rotation3<f64>) -> Self {
        let m = r.matrix();
        let cos = ((m.trace() - 1.0) * 0.5).clamp(-1.0, 1.0);
        let angle = cos.acos();
        // `2 sin(angle) * axis`.
        let antisymmetric = Vector3::new(m.m32 - m.m23, m.m13 - m.m31, m.m21 - m.m12);
        if angle.is_nan() {
            Self(Vector3::zeros())
        } else if angle < 1e-8 {
            Self(antisymmetric * 0.5)
        } else if core::f64::consts::PI - angle > NEAR_PI {
            Self(antisymmetric * (angle / (2.0 * angle.sin())))
        } else {
            // `(R + R^T) / 2 - cos * I = (1 - cos) * axis * axis^T`
            let outer = (m + m.transpose()) * 0.5 - Matrix3::identity() * cos;
            let column = (0..3)
                .max_by(|&a, &b| outer[(a, a)].total_cmp(&outer[(b, b)]))
                .unwrap_or(0);
            let axis = outer.column(column) / outer[(column, column)].max(f64::EPSILON).sqrt();
            let axis = axis.normalize();
            // The antisymmetric part still fixes the sign while it is above the noise.
            let axis = if axis.dot(&antisymmetric) < 0.0 {
                -axis
            } else {
                axis
            };
            Self(axis * angle)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn exp_log_round_trip() {
        let rotation = Rotation3::from_euler_angles(0.4, -1.1, 2.0);
        let skew: Skew3 = rotation.into();
        assert_relative_eq!(skew.rotation(), rotation, epsilon = 1e-12);
    }

    #[test]
    fn half_turns_keep_their_axis() {
        for axis in [
            Vector3::new(0.0, 0.9999, 0.0141),
            Vector3::new(1.0, 2.0, -3.0),
            Vector3::z(),
        ] {
            let axis = Unit::new_normalize(axis);
            for angle in [core::f64::consts::PI, core::f64::consts::PI - 1e-6, 3.1] {
                let rotation = Rotation3::from_axis_angle(&axis, angle);
                let skew: Skew3 = rotation.into();
                assert_relative_eq!(skew.rotation(), rotation, epsilon = 1e-9);
                assert!(skew.0.norm() <= core::f64::consts::PI + 1e-12);
            }
        }
    }

    #[test]
    fn tiny_rotation_uses_small_angle_map() {
        let skew = Skew3(Vector3::new(1e-9, 0.0, 0.0));
        let rotation = skew.rotation();
        assert_relative_eq!(rotation, Rotation3::identity(), epsilon = 1e-8);
    }
}
