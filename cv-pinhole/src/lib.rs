//! This crate plugs into `cv-core` and provides the pinhole camera models used for relocalization.
//! It converts pixel coordinates into normalized image coordinates (and back) with or without
//! radial distortion, projects world points into images, and provides the fundamental matrix
//! model used to filter putative matches.

mod fundamental;

pub use fundamental::*;

use cv_core::nalgebra::{Matrix3, Point2, Point3, Vector2, Vector3};
use cv_core::{
    CameraModel, CameraPoint, ImagePoint, KeyPoint, Pose, Projective, WorldPoint, WorldToCamera,
};
use derive_more::{AsMut, AsRef, Deref, DerefMut, From, Into};

#[cfg(feature = "serde-serialize")]
use serde::{Deserialize, Serialize};

/// A point in normalized image coordinates. This keypoint has been corrected
/// for distortion and normalized based on the camera intrinsic matrix.
#[derive(Debug, Clone, Copy, PartialEq, PartialOrd, AsMut, AsRef, Deref, DerefMut, From, Into)]
#[cfg_attr(feature = "serde-serialize", derive(Serialize, Deserialize))]
pub struct NormalizedKeyPoint(pub Point2<f64>);

impl NormalizedKeyPoint {
    /// Tries to convert the [`CameraPoint`] into a [`NormalizedKeyPoint`].
    ///
    /// Fails for points at infinity or in the plane of the optical center.
    pub fn from_camera_point(point: CameraPoint) -> Option<Self> {
        let bearing = point.bearing_unnormalized();
        if bearing.z == 0.0 || !bearing.z.is_finite() {
            return None;
        }
        Some(Self(Point2::new(bearing.x / bearing.z, bearing.y / bearing.z)))
    }

    /// Get the virtual image point at depth `1.0` in front of the camera.
    pub fn virtual_image_point(self) -> Point3<f64> {
        self.coords.push(1.0).into()
    }

    /// The homogeneous bearing `(x, y, 1)`.
    pub fn bearing_unnormalized(self) -> Vector3<f64> {
        self.coords.push(1.0)
    }
}

/// This contains intrinsic camera parameters as per
/// [this Wikipedia page](https://en.wikipedia.org/wiki/Camera_resectioning#Intrinsic_parameters).
#[derive(Debug, Clone, Copy, PartialEq, PartialOrd)]
#[cfg_attr(feature = "serde-serialize", derive(Serialize, Deserialize))]
pub struct CameraIntrinsics {
    pub focals: Vector2<f64>,
    pub principal_point: Point2<f64>,
    pub skew: f64,
}

impl CameraIntrinsics {
    /// Creates camera intrinsics that would create an identity intrinsic matrix.
    pub fn identity() -> Self {
        Self {
            focals: Vector2::new(1.0, 1.0),
            skew: 0.0,
            principal_point: Point2::new(0.0, 0.0),
        }
    }

    #[must_use]
    pub fn focals(self, focals: Vector2<f64>) -> Self {
        Self { focals, ..self }
    }

    #[must_use]
    pub fn focal(self, focal: f64) -> Self {
        Self {
            focals: Vector2::new(focal, focal),
            ..self
        }
    }

    #[must_use]
    pub fn principal_point(self, principal_point: Point2<f64>) -> Self {
        Self {
            principal_point,
            ..self
        }
    }

    #[must_use]
    pub fn skew(self, skew: f64) -> Self {
        Self { skew, ..self }
    }

    /// Reads the intrinsics out of an upper triangular calibration matrix.
    ///
    /// The matrix is scaled so that its bottom right element is `1.0`.
    pub fn from_matrix(matrix: &Matrix3<f64>) -> Option<Self> {
        let scale = matrix[(2, 2)];
        if scale == 0.0 || !scale.is_finite() {
            return None;
        }
        let matrix = matrix / scale;
        Some(Self {
            focals: Vector2::new(matrix[(0, 0)], matrix[(1, 1)]),
            principal_point: Point2::new(matrix[(0, 2)], matrix[(1, 2)]),
            skew: matrix[(0, 1)],
        })
    }

    #[rustfmt::skip]
    pub fn matrix(&self) -> Matrix3<f64> {
        Matrix3::new(
            self.focals.x,  self.skew,      self.principal_point.x,
            0.0,            self.focals.y,  self.principal_point.y,
            0.0,            0.0,            1.0,
        )
    }
}

impl CameraModel for CameraIntrinsics {
    type Projection = NormalizedKeyPoint;

    /// Takes in a point from an image in pixel coordinates and
    /// converts it to a [`NormalizedKeyPoint`].
    ///
    /// ```
    /// use cv_core::{KeyPoint, CameraModel};
    /// use cv_pinhole::CameraIntrinsics;
    /// use cv_core::nalgebra::{Vector2, Point2};
    /// let intrinsics = CameraIntrinsics {
    ///     focals: Vector2::new(800.0, 900.0),
    ///     principal_point: Point2::new(500.0, 600.0),
    ///     skew: 1.7,
    /// };
    /// let kp = KeyPoint(Point2::new(471.0, 322.0));
    /// let nkp = intrinsics.calibrate(kp);
    /// let distance = (kp.to_homogeneous() - intrinsics.matrix() * nkp.to_homogeneous()).norm();
    /// assert!(distance < 0.1);
    /// ```
    fn calibrate<P>(&self, point: P) -> NormalizedKeyPoint
    where
        P: ImagePoint,
    {
        let centered = point.image_point() - self.principal_point;
        let y = centered.y / self.focals.y;
        let x = (centered.x - self.skew * y) / self.focals.x;
        NormalizedKeyPoint(Point2::new(x, y))
    }

    /// Converts a [`NormalizedKeyPoint`] back into pixel coordinates.
    fn uncalibrate(&self, projection: NormalizedKeyPoint) -> KeyPoint {
        let y = projection.y * self.focals.y;
        let x = projection.x * self.focals.x + self.skew * projection.y;
        KeyPoint(Point2::new(x, y) + self.principal_point.coords)
    }
}

/// Camera intrinsics with three radial distortion coefficients.
///
/// A normalized point `p` with `r = |p|` is distorted to `p * (1 + k1 r^2 + k2 r^4 + k3 r^6)`
/// before the intrinsic matrix is applied.
#[derive(Debug, Clone, Copy, PartialEq, PartialOrd)]
#[cfg_attr(feature = "serde-serialize", derive(Serialize, Deserialize))]
pub struct CameraIntrinsicsK3Distortion {
    pub simple_intrinsics: CameraIntrinsics,
    pub k1: f64,
    pub k2: f64,
    pub k3: f64,
}

impl CameraIntrinsicsK3Distortion {
    pub fn new(simple_intrinsics: CameraIntrinsics, [k1, k2, k3]: [f64; 3]) -> Self {
        Self {
            simple_intrinsics,
            k1,
            k2,
            k3,
        }
    }

    /// Intrinsics without any distortion.
    pub fn undistorted(simple_intrinsics: CameraIntrinsics) -> Self {
        Self::new(simple_intrinsics, [0.0; 3])
    }

    pub fn distortion(&self) -> [f64; 3] {
        [self.k1, self.k2, self.k3]
    }

    pub fn has_distortion(&self) -> bool {
        self.distortion().iter().any(|&k| k != 0.0)
    }

    fn radial_factor(&self, r2: f64) -> f64 {
        1.0 + r2 * (self.k1 + r2 * (self.k2 + r2 * self.k3))
    }

    /// Applies the lens distortion to an undistorted normalized point.
    pub fn distort(&self, point: NormalizedKeyPoint) -> NormalizedKeyPoint {
        let factor = self.radial_factor(point.coords.norm_squared());
        NormalizedKeyPoint((point.coords * factor).into())
    }

    /// Removes the lens distortion from a distorted normalized point.
    ///
    /// Inverts [`CameraIntrinsicsK3Distortion::distort`] with a fixed point iteration.
    pub fn undistort(&self, point: NormalizedKeyPoint) -> NormalizedKeyPoint {
        if !self.has_distortion() {
            return point;
        }
        let distorted = point.coords;
        let mut undistorted = distorted;
        for _ in 0..20 {
            let factor = self.radial_factor(undistorted.norm_squared());
            if factor.abs() < f64::EPSILON {
                break;
            }
            let next = distorted / factor;
            let delta = (next - undistorted).norm_squared();
            undistorted = next;
            if delta < 1e-24 {
                break;
            }
        }
        NormalizedKeyPoint(undistorted.into())
    }

    /// Projects a world point into the image with the given pose.
    ///
    /// Returns `None` if the point is not strictly in front of the camera.
    pub fn project(&self, pose: WorldToCamera, point: WorldPoint) -> Option<KeyPoint> {
        let camera_point = pose.transform(point);
        if camera_point.depth().map_or(true, |depth| depth <= 0.0) {
            return None;
        }
        NormalizedKeyPoint::from_camera_point(camera_point)
            .map(|normalized| self.uncalibrate(normalized))
    }

    /// The pixel distance between an observation and the projection of its world point.
    ///
    /// Points behind the camera have an infinite error.
    pub fn reprojection_error(
        &self,
        pose: WorldToCamera,
        keypoint: KeyPoint,
        point: WorldPoint,
    ) -> f64 {
        self.project(pose, point)
            .map_or(f64::INFINITY, |projected| (projected.0 - keypoint.0).norm())
    }
}

impl From<CameraIntrinsics> for CameraIntrinsicsK3Distortion {
    fn from(simple_intrinsics: CameraIntrinsics) -> Self {
        Self::undistorted(simple_intrinsics)
    }
}

impl CameraModel for CameraIntrinsicsK3Distortion {
    type Projection = NormalizedKeyPoint;

    /// Takes in a point from an image in pixel coordinates and
    /// converts it to an undistorted [`NormalizedKeyPoint`].
    ///
    /// ```
    /// use cv_core::{KeyPoint, CameraModel};
    /// use cv_pinhole::{CameraIntrinsics, CameraIntrinsicsK3Distortion};
    /// use cv_core::nalgebra::Point2;
    /// let intrinsics = CameraIntrinsicsK3Distortion::new(
    ///     CameraIntrinsics::identity().focal(800.0).principal_point(Point2::new(320.0, 240.0)),
    ///     [-0.2, 0.05, -0.01],
    /// );
    /// let kp = KeyPoint(Point2::new(471.0, 322.0));
    /// let ukp = intrinsics.uncalibrate(intrinsics.calibrate(kp));
    /// assert!((kp.0 - ukp.0).norm() < 1e-6);
    /// ```
    fn calibrate<P>(&self, point: P) -> NormalizedKeyPoint
    where
        P: ImagePoint,
    {
        self.undistort(self.simple_intrinsics.calibrate(point))
    }

    fn uncalibrate(&self, projection: NormalizedKeyPoint) -> KeyPoint {
        self.simple_intrinsics.uncalibrate(self.distort(projection))
    }
}

/// Computes the similarity that moves the centroid of the points to the origin and scales
/// them to a mean distance of `sqrt(2)` from it.
///
/// Conditioning pixel coordinates this way keeps the linear systems of the minimal solvers
/// well scaled. Returns `None` when there are no points or all of them coincide.
pub fn isotropic_normalization<I>(points: I) -> Option<Matrix3<f64>>
where
    I: Iterator<Item = Point2<f64>> + Clone,
{
    let count = points.clone().count();
    if count == 0 {
        return None;
    }
    let centroid = points.clone().map(|p| p.coords).sum::<Vector2<f64>>() / count as f64;
    let mean_distance = points.map(|p| (p.coords - centroid).norm()).sum::<f64>() / count as f64;
    if mean_distance <= f64::EPSILON || !mean_distance.is_finite() {
        return None;
    }
    let scale = core::f64::consts::SQRT_2 / mean_distance;
    Some(Matrix3::new(
        scale,
        0.0,
        -scale * centroid.x,
        0.0,
        scale,
        -scale * centroid.y,
        0.0,
        0.0,
        1.0,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use cv_core::nalgebra::Rotation3;

    fn intrinsics() -> CameraIntrinsicsK3Distortion {
        CameraIntrinsics::identity()
            .focal(1000.0)
            .principal_point(Point2::new(500.0, 500.0))
            .into()
    }

    #[test]
    fn projects_point_on_axis_to_principal_point() {
        let pose = WorldToCamera::from_rotation_center(Rotation3::identity(), Point3::origin());
        let keypoint = intrinsics()
            .project(pose, Point3::new(0.0, 0.0, 4.0).into())
            .unwrap();
        assert_relative_eq!(keypoint.0, Point2::new(500.0, 500.0), epsilon = 1e-9);
    }

    #[test]
    fn points_behind_camera_do_not_project() {
        let pose = WorldToCamera::from_rotation_center(Rotation3::identity(), Point3::origin());
        let behind: WorldPoint = Point3::new(0.1, 0.0, -2.0).into();
        assert!(intrinsics().project(pose, behind).is_none());
        assert_eq!(
            intrinsics().reprojection_error(pose, KeyPoint::new(0.0, 0.0), behind),
            f64::INFINITY
        );
    }

    #[test]
    fn undistort_inverts_distort() {
        let intrinsics = CameraIntrinsicsK3Distortion::new(
            CameraIntrinsics::identity().focal(800.0),
            [-0.25, 0.08, -0.01],
        );
        let point = NormalizedKeyPoint(Point2::new(0.3, -0.2));
        let round_trip = intrinsics.undistort(intrinsics.distort(point));
        assert_relative_eq!(round_trip.0, point.0, epsilon = 1e-10);
    }

    #[test]
    fn matrix_round_trip() {
        let simple = CameraIntrinsics::identity()
            .focals(Vector2::new(900.0, 910.0))
            .principal_point(Point2::new(320.0, 250.0));
        let recovered = CameraIntrinsics::from_matrix(&(simple.matrix() * 3.0)).unwrap();
        assert_relative_eq!(recovered.matrix(), simple.matrix(), epsilon = 1e-12);
    }

    #[test]
    fn normalization_centers_points() {
        let points = [
            Point2::new(10.0, 20.0),
            Point2::new(30.0, 20.0),
            Point2::new(20.0, 40.0),
        ];
        let transform = isotropic_normalization(points.iter().copied()).unwrap();
        let moved: Vec<Vector2<f64>> = points
            .iter()
            .map(|p| (transform * p.to_homogeneous()).xy())
            .collect();
        let centroid = moved.iter().sum::<Vector2<f64>>() / 3.0;
        assert_relative_eq!(centroid, Vector2::zeros(), epsilon = 1e-12);
        let mean = moved.iter().map(|p| p.norm()).sum::<f64>() / 3.0;
        assert_relative_eq!(mean, 2f64.sqrt(), epsilon = 1e-12);
        assert!(isotropic_normalization([Point2::new(1.0, 1.0); 4].iter().copied()).is_none());
    }
}
