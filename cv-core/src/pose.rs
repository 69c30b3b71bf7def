use crate::{CameraPoint, Projective, Skew3, WorldPoint};
use derive_more::{AsMut, AsRef, From, Into};
use nalgebra::{IsometryMatrix3, Matrix3x4, Matrix4, Point3, Rotation3, Unit, Vector3, Vector6};

#[cfg(feature = "serde-serialize")]
use serde::{Deserialize, Serialize};

/// This trait is implemented by all the different poses in this library:
///
/// * [`CameraToWorld`] - Transforms [`CameraPoint`] into [`WorldPoint`]
/// * [`WorldToCamera`] - Transforms [`WorldPoint`] into [`CameraPoint`]
pub trait Pose: From<IsometryMatrix3<f64>> + Clone + Copy {
    type InputPoint: Projective;
    type OutputPoint: Projective;
    type Inverse: Pose;

    /// Retrieve the isometry.
    fn isometry(self) -> IsometryMatrix3<f64>;

    /// Creates a pose with no change in position or orientation.
    fn identity() -> Self {
        IsometryMatrix3::identity().into()
    }

    /// Takes the inverse of the pose.
    fn inverse(self) -> Self::Inverse {
        self.isometry().inverse().into()
    }

    /// Create the pose from rotation and translation.
    fn from_parts(translation: Vector3<f64>, rotation: Rotation3<f64>) -> Self {
        IsometryMatrix3::from_parts(translation.into(), rotation).into()
    }

    /// Retrieve the homogeneous matrix.
    fn homogeneous(self) -> Matrix4<f64> {
        self.isometry().to_homogeneous()
    }

    /// Retrieve the se(3) representation of the pose.
    ///
    /// The translation components come before the so(3) components.
    fn se3(self) -> Vector6<f64> {
        let isometry = self.isometry();
        let t = isometry.translation.vector;
        let r: Skew3 = isometry.rotation.into();
        Vector6::new(t.x, t.y, t.z, r.x, r.y, r.z)
    }

    /// Set the se(3) representation of the pose.
    fn from_se3(se3: Vector6<f64>) -> Self {
        let translation = se3.xyz();
        let rotation = Skew3(Vector3::new(se3[3], se3[4], se3[5])).into();
        Self::from_parts(translation, rotation)
    }

    /// Transform the given point to an output point.
    fn transform(self, input: Self::InputPoint) -> Self::OutputPoint {
        (self.isometry().to_homogeneous() * input.homogeneous()).into()
    }
}

/// The pose of the world relative to a camera. It maps world points into camera points.
///
/// This is the `[R|t]` of the classic projection `P = K[R|t]`.
#[derive(Debug, Clone, Copy, PartialEq, AsMut, AsRef, From, Into)]
#[cfg_attr(feature = "serde-serialize", derive(Serialize, Deserialize))]
pub struct WorldToCamera(pub IsometryMatrix3<f64>);

impl Pose for WorldToCamera {
    type InputPoint = WorldPoint;
    type OutputPoint = CameraPoint;
    type Inverse = CameraToWorld;

    #[inline(always)]
    fn isometry(self) -> IsometryMatrix3<f64> {
        self.into()
    }
}

impl WorldToCamera {
    /// Builds the pose of a camera with world-to-camera rotation `rotation` whose optical center
    /// sits at `center` in world coordinates.
    pub fn from_rotation_center(rotation: Rotation3<f64>, center: Point3<f64>) -> Self {
        Self::from_parts(-(rotation * center.coords), rotation)
    }

    /// The world-to-camera rotation.
    pub fn rotation(self) -> Rotation3<f64> {
        self.0.rotation
    }

    /// The optical center of the camera in world coordinates.
    pub fn center(self) -> Point3<f64> {
        Point3::from(-(self.0.rotation.inverse() * self.0.translation.vector))
    }

    /// The direction the camera looks at, expressed in world coordinates.
    pub fn optical_axis(self) -> Unit<Vector3<f64>> {
        Unit::new_normalize(self.0.rotation.inverse() * Vector3::z())
    }

    /// The depth of a world point along the optical axis of this camera.
    pub fn depth(self, point: Point3<f64>) -> f64 {
        (self.0 * point).z
    }

    /// The `[R|t]` matrix of the pose.
    pub fn matrix(self) -> Matrix3x4<f64> {
        let mut matrix = Matrix3x4::zeros();
        matrix
            .fixed_slice_mut::<3, 3>(0, 0)
            .copy_from(self.0.rotation.matrix());
        matrix.set_column(3, &self.0.translation.vector);
        matrix
    }
}

/// The pose of a camera relative to the world. It maps camera points into world points.
///
/// The translation of this pose is the optical center of the camera.
#[derive(Debug, Clone, Copy, PartialEq, AsMut, AsRef, From, Into)]
#[cfg_attr(feature = "serde-serialize", derive(Serialize, Deserialize))]
pub struct CameraToWorld(pub IsometryMatrix3<f64>);

impl Pose for CameraToWorld {
    type InputPoint = CameraPoint;
    type OutputPoint = WorldPoint;
    type Inverse = WorldToCamera;

    #[inline(always)]
    fn isometry(self) -> IsometryMatrix3<f64> {
        self.into()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn center_and_depth_agree() {
        let rotation = Rotation3::from_euler_angles(0.3, 0.2, -0.7);
        let center = Point3::new(0.5, -1.0, 4.0);
        let pose = WorldToCamera::from_rotation_center(rotation, center);
        assert_relative_eq!(pose.center(), center, epsilon = 1e-12);

        // A point one unit along the optical axis has depth one.
        let ahead = center + pose.optical_axis().into_inner();
        assert_relative_eq!(pose.depth(ahead), 1.0, epsilon = 1e-12);
    }

    #[test]
    fn se3_round_trip() {
        let pose = WorldToCamera::from_parts(
            Vector3::new(0.1, 0.2, 0.3),
            Rotation3::from_euler_angles(-0.2, 0.4, 1.3),
        );
        let back = WorldToCamera::from_se3(pose.se3());
        assert_relative_eq!(back.0, pose.0, epsilon = 1e-12);
    }

    #[test]
    fn se3_round_trip_of_a_half_turn() {
        // Looking back at the origin from +Z turns the camera by pi about a tilted axis.
        let center = Point3::new(0.0, 0.5, 6.0);
        let rotation = Rotation3::face_towards(&-center.coords, &Vector3::y()).inverse();
        let pose = WorldToCamera::from_rotation_center(rotation, center);
        assert_relative_eq!(pose.rotation().angle(), core::f64::consts::PI, epsilon = 1e-6);
        let back = WorldToCamera::from_se3(pose.se3());
        assert_relative_eq!(back.0, pose.0, epsilon = 1e-9);
        assert_relative_eq!(back.center(), center, epsilon = 1e-9);
    }

    #[test]
    fn inverse_maps_camera_points_back() {
        let pose = WorldToCamera::from_parts(
            Vector3::new(-1.0, 0.5, 2.0),
            Rotation3::from_euler_angles(0.1, 0.0, 0.2),
        );
        let world = WorldPoint::from_point(Point3::new(1.0, 2.0, 3.0));
        let camera = pose.transform(world);
        let back = pose.inverse().transform(camera);
        assert_relative_eq!(back.point().unwrap(), world.point().unwrap(), epsilon = 1e-12);
    }
}
