//! Camera resection from 2D-3D correspondences with the direct linear transform.
//!
//! Six matches determine the `3x4` projection matrix `P` up to scale. With known intrinsics
//! the observations are normalized first and `P` is projected onto the closest rotation. Without
//! intrinsics, `P` is split into a calibration matrix and a rotation with an RQ decomposition.

use cv_core::{
    consensus::{Estimator, Model},
    nalgebra::{
        Matrix3, Matrix3x4, Matrix4, Matrix4x3, Point2, Point3, Rotation3, SMatrix, SVector,
        Vector2, Vector3, SVD,
    },
    CameraModel, FeatureWorldMatch, KeyPoint, Pose, Projective, WorldToCamera,
};
use cv_pinhole::{isotropic_normalization, CameraIntrinsics, CameraIntrinsicsK3Distortion};
use float_ord::FloatOrd;

#[cfg(feature = "serde-serialize")]
use serde::{Deserialize, Serialize};

/// A camera pose and the intrinsics it was estimated with.
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde-serialize", derive(Serialize, Deserialize))]
pub struct Resection {
    pub pose: WorldToCamera,
    pub intrinsics: CameraIntrinsicsK3Distortion,
}

impl Model<FeatureWorldMatch<KeyPoint>> for Resection {
    /// The reprojection error in pixels, infinite for points behind the camera.
    fn residual(&self, data: &FeatureWorldMatch<KeyPoint>) -> f64 {
        let FeatureWorldMatch(keypoint, point) = *data;
        self.intrinsics.reprojection_error(self.pose, keypoint, point)
    }
}

/// The six point DLT resection solver.
///
/// ```
/// use cv_core::nalgebra::{Point3, Rotation3};
/// use cv_core::{FeatureWorldMatch, WorldToCamera, consensus::Model};
/// use cv_pinhole::{CameraIntrinsics, CameraIntrinsicsK3Distortion};
/// use six_point::SixPoint;
///
/// let intrinsics: CameraIntrinsicsK3Distortion = CameraIntrinsics::identity().focal(700.0).into();
/// let pose = WorldToCamera::from_rotation_center(
///     Rotation3::from_euler_angles(0.1, 0.2, -0.1),
///     Point3::new(0.5, -0.3, -6.0),
/// );
/// let matches: Vec<_> = [
///     [0.0, 0.0, 0.0], [1.0, 0.2, 0.5], [-0.7, 0.9, 0.1],
///     [0.3, -1.1, -0.4], [1.2, 1.0, -0.8], [-1.0, -0.6, 0.9], [0.2, 0.4, 1.3],
/// ]
/// .iter()
/// .map(|&[x, y, z]| {
///     let point = Point3::new(x, y, z).into();
///     FeatureWorldMatch(intrinsics.project(pose, point).unwrap(), point)
/// })
/// .collect();
/// let resection = SixPoint::calibrated(intrinsics).from_matches(matches.iter().copied()).unwrap();
/// assert!((resection.pose.center() - pose.center()).norm() < 1e-6);
/// assert!(matches.iter().all(|m| resection.residual(m) < 1e-6));
/// ```
#[derive(Copy, Clone, Debug)]
pub struct SixPoint {
    intrinsics: Option<CameraIntrinsicsK3Distortion>,
    epsilon: f64,
    iterations: usize,
}

impl SixPoint {
    /// Estimates only the pose. Observations are undistorted with the given intrinsics.
    pub fn calibrated(intrinsics: CameraIntrinsicsK3Distortion) -> Self {
        Self {
            intrinsics: Some(intrinsics),
            epsilon: 1e-12,
            iterations: 1000,
        }
    }

    /// Estimates the pose and a zero-skew pinhole calibration without distortion.
    pub fn uncalibrated() -> Self {
        Self {
            intrinsics: None,
            epsilon: 1e-12,
            iterations: 1000,
        }
    }

    #[must_use]
    pub fn epsilon(self, epsilon: f64) -> Self {
        Self { epsilon, ..self }
    }

    #[must_use]
    pub fn iterations(self, iterations: usize) -> Self {
        Self { iterations, ..self }
    }

    pub fn intrinsics(&self) -> Option<CameraIntrinsicsK3Distortion> {
        self.intrinsics
    }

    pub fn from_matches<I>(&self, data: I) -> Option<Resection>
    where
        I: Iterator<Item = FeatureWorldMatch<KeyPoint>> + Clone,
    {
        let image_points = data.clone().map(|FeatureWorldMatch(keypoint, _)| match self.intrinsics {
            Some(intrinsics) => intrinsics.calibrate(keypoint).0,
            None => keypoint.0,
        });
        let world_points = data
            .clone()
            .map(|FeatureWorldMatch(_, point)| point.point())
            .collect::<Option<Vec<Point3<f64>>>>()?;
        if world_points.len() < 6 {
            return None;
        }
        let projection = self.projection_matrix(image_points, &world_points)?;
        let resection = match self.intrinsics {
            Some(intrinsics) => Resection {
                pose: self.calibrated_pose(projection)?,
                intrinsics,
            },
            None => self.decompose(projection)?,
        };
        let finite = resection.pose.homogeneous().iter().all(|v| v.is_finite());
        if finite {
            Some(resection)
        } else {
            None
        }
    }

    /// Solves `x ~ P * X` in the least squares sense with conditioned coordinates.
    fn projection_matrix<I>(&self, image_points: I, world_points: &[Point3<f64>]) -> Option<Matrix3x4<f64>>
    where
        I: Iterator<Item = Point2<f64>> + Clone,
    {
        let image_normalization = isotropic_normalization(image_points.clone())?;
        let world_normalization = world_normalization(world_points)?;
        let mut normal = SMatrix::<f64, 12, 12>::zeros();
        for (image, world) in image_points.zip(world_points) {
            let image = image_normalization * image.to_homogeneous();
            let world = world_normalization * world.to_homogeneous();
            let (x, y) = (image.x / image.z, image.y / image.z);
            let mut first = SVector::<f64, 12>::zeros();
            first.fixed_rows_mut::<4>(0).copy_from(&world);
            first.fixed_rows_mut::<4>(8).copy_from(&(world * -x));
            let mut second = SVector::<f64, 12>::zeros();
            second.fixed_rows_mut::<4>(4).copy_from(&world);
            second.fixed_rows_mut::<4>(8).copy_from(&(world * -y));
            normal += first * first.transpose() + second * second.transpose();
        }
        let eigens = normal.try_symmetric_eigen(self.epsilon, self.iterations)?;
        let (smallest, _) = eigens
            .eigenvalues
            .iter()
            .enumerate()
            .min_by_key(|&(_, &value)| FloatOrd(value))?;
        let normalized: Matrix3x4<f64> =
            Matrix4x3::from_iterator(eigens.eigenvectors.column(smallest).iter().copied())
                .transpose();
        Some(image_normalization.try_inverse()? * normalized * world_normalization)
    }

    /// Projects the left `3x3` block onto the closest rotation.
    fn calibrated_pose(&self, projection: Matrix3x4<f64>) -> Option<WorldToCamera> {
        let left: Matrix3<f64> = projection.fixed_slice::<3, 3>(0, 0).into_owned();
        // P is only known up to sign; the rotation must be proper.
        let projection = if left.determinant() < 0.0 {
            -projection
        } else {
            projection
        };
        let left: Matrix3<f64> = projection.fixed_slice::<3, 3>(0, 0).into_owned();
        let svd = SVD::try_new(left, true, true, self.epsilon, self.iterations)?;
        let (u, v_t) = (svd.u?, svd.v_t?);
        let scale = svd.singular_values.mean();
        if scale <= 0.0 {
            return None;
        }
        let mut rotation = u * v_t;
        if rotation.determinant() < 0.0 {
            rotation = -rotation;
        }
        let translation = projection.column(3) / scale;
        Some(WorldToCamera::from_parts(
            translation,
            Rotation3::from_matrix_unchecked(rotation),
        ))
    }

    /// Splits the projection into `K * [R | t]` with an RQ decomposition.
    fn decompose(&self, projection: Matrix3x4<f64>) -> Option<Resection> {
        let left: Matrix3<f64> = projection.fixed_slice::<3, 3>(0, 0).into_owned();
        let projection = if left.determinant() < 0.0 {
            -projection
        } else {
            projection
        };
        let left: Matrix3<f64> = projection.fixed_slice::<3, 3>(0, 0).into_owned();
        let (calibration, rotation) = rq(left);
        if calibration[(2, 2)].abs() <= f64::EPSILON {
            return None;
        }
        let translation = calibration.try_inverse()? * projection.column(3);
        let calibration = calibration / calibration[(2, 2)];
        let simple_intrinsics = CameraIntrinsics::identity()
            .focals(Vector2::new(calibration[(0, 0)], calibration[(1, 1)]))
            .principal_point(Point2::new(calibration[(0, 2)], calibration[(1, 2)]));
        if simple_intrinsics.focals.iter().any(|&f| f <= 0.0 || !f.is_finite()) {
            return None;
        }
        Some(Resection {
            pose: WorldToCamera::from_parts(translation, Rotation3::from_matrix_unchecked(rotation)),
            intrinsics: simple_intrinsics.into(),
        })
    }
}

impl Estimator<FeatureWorldMatch<KeyPoint>> for SixPoint {
    type Model = Resection;
    type ModelIter = Option<Resection>;
    const MIN_SAMPLES: usize = 6;

    fn estimate<I>(&self, data: I) -> Self::ModelIter
    where
        I: Iterator<Item = FeatureWorldMatch<KeyPoint>> + Clone,
    {
        self.from_matches(data)
    }
}

/// Moves the centroid to the origin and scales the mean distance from it to `sqrt(3)`.
fn world_normalization(points: &[Point3<f64>]) -> Option<Matrix4<f64>> {
    if points.is_empty() {
        return None;
    }
    let count = points.len() as f64;
    let centroid = points.iter().map(|p| p.coords).sum::<Vector3<f64>>() / count;
    let mean_distance = points.iter().map(|p| (p.coords - centroid).norm()).sum::<f64>() / count;
    if mean_distance <= f64::EPSILON || !mean_distance.is_finite() {
        return None;
    }
    let scale = 3f64.sqrt() / mean_distance;
    let mut transform = Matrix4::identity() * scale;
    transform[(3, 3)] = 1.0;
    transform
        .fixed_slice_mut::<3, 1>(0, 3)
        .copy_from(&(-centroid * scale));
    Some(transform)
}

/// Decomposes `m = R * Q` with `R` upper triangular with a positive diagonal and `Q`
/// orthonormal.
fn rq(m: Matrix3<f64>) -> (Matrix3<f64>, Matrix3<f64>) {
    let flip = Matrix3::new(0.0, 0.0, 1.0, 0.0, 1.0, 0.0, 1.0, 0.0, 0.0);
    let qr = (flip * m).transpose().qr();
    let (q, r) = (qr.q(), qr.r());
    let mut upper = flip * r.transpose() * flip;
    let mut orthonormal = flip * q.transpose();
    for ix in 0..3 {
        if upper[(ix, ix)] < 0.0 {
            upper.column_mut(ix).neg_mut();
            orthonormal.row_mut(ix).neg_mut();
        }
    }
    (upper, orthonormal)
}
