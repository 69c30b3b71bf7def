use crate::{intersects, is_non_empty, GeometryError, HalfPlane};
use cv_core::nalgebra::{Matrix3, Point3, Rotation3, Unit, Vector3};
use cv_core::{Pose, WorldToCamera};
use log::*;

#[cfg(feature = "serde-serialize")]
use serde::{Deserialize, Serialize};

/// The volume of space seen by a pinhole camera.
///
/// The frustum is the intersection of four lateral half-planes that pass through the optical
/// center and the image borders. A truncated frustum adds a near and a far plane at fixed
/// depths along the optical axis.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde-serialize", derive(Serialize, Deserialize))]
pub struct Frustum {
    center: Point3<f64>,
    axis: Unit<Vector3<f64>>,
    /// Lateral planes first, then near and far when truncated.
    planes: Vec<HalfPlane>,
    depth_range: Option<(f64, f64)>,
}

impl Frustum {
    /// Builds an infinite frustum.
    ///
    /// * `width` and `height` are the image size in pixels.
    /// * `intrinsics` is the upper triangular calibration matrix `K`.
    /// * `rotation` maps world directions into the camera frame.
    /// * `center` is the optical center in world coordinates.
    pub fn new(
        width: f64,
        height: f64,
        intrinsics: &Matrix3<f64>,
        rotation: &Rotation3<f64>,
        center: Point3<f64>,
    ) -> Result<Self, GeometryError> {
        let inverse_intrinsics = intrinsics
            .try_inverse()
            .ok_or(GeometryError::SingularIntrinsics)?;
        let axis = Unit::new_normalize(rotation.inverse() * Vector3::z());
        let rays: Vec<Vector3<f64>> = [(0.0, 0.0), (width, 0.0), (width, height), (0.0, height)]
            .iter()
            .map(|&(u, v)| rotation.inverse() * (inverse_intrinsics * Vector3::new(u, v, 1.0)))
            .collect();
        let planes = (0..4)
            .map(|ix| {
                let normal = rays[ix].cross(&rays[(ix + 1) % 4]);
                // Keep the optical axis inside.
                let normal = if normal.dot(&axis) < 0.0 { -normal } else { normal };
                HalfPlane::new(center, normal)
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self {
            center,
            axis,
            planes,
            depth_range: None,
        })
    }

    /// Builds a frustum bounded by the near and far depths along the optical axis.
    pub fn truncated(
        width: f64,
        height: f64,
        intrinsics: &Matrix3<f64>,
        rotation: &Rotation3<f64>,
        center: Point3<f64>,
        near: f64,
        far: f64,
    ) -> Result<Self, GeometryError> {
        Self::new(width, height, intrinsics, rotation, center)?.with_depth_range(near, far)
    }

    /// Builds the frustum of a camera pose.
    pub fn from_pose(
        width: f64,
        height: f64,
        intrinsics: &Matrix3<f64>,
        pose: WorldToCamera,
    ) -> Result<Self, GeometryError> {
        Self::new(
            width,
            height,
            intrinsics,
            &pose.isometry().rotation,
            pose.center(),
        )
    }

    /// Replaces the near and far planes.
    ///
    /// The range must satisfy `0 <= near < far`. An infinite `far` leaves the far side open.
    pub fn with_depth_range(mut self, near: f64, far: f64) -> Result<Self, GeometryError> {
        if !(near >= 0.0 && far > near) {
            debug!("refusing depth range [{}, {}]", near, far);
            return Err(GeometryError::InvalidDepthRange);
        }
        self.planes.truncate(4);
        self.planes
            .push(HalfPlane::new(self.center + *self.axis * near, *self.axis)?);
        if far.is_finite() {
            self.planes
                .push(HalfPlane::new(self.center + *self.axis * far, -*self.axis)?);
        }
        self.depth_range = Some((near, far));
        Ok(self)
    }

    /// No near or far plane bounds the frustum.
    pub fn is_infinite(&self) -> bool {
        self.depth_range.is_none()
    }

    pub fn is_truncated(&self) -> bool {
        self.depth_range.is_some()
    }

    pub fn depth_range(&self) -> Option<(f64, f64)> {
        self.depth_range
    }

    pub fn camera_center(&self) -> Point3<f64> {
        self.center
    }

    pub fn optical_axis(&self) -> Unit<Vector3<f64>> {
        self.axis
    }

    pub fn planes(&self) -> &[HalfPlane] {
        &self.planes
    }

    pub fn contains(&self, point: Point3<f64>) -> bool {
        self.planes.iter().all(|plane| plane.contains(point))
    }

    /// Decides whether two frustums share some volume.
    pub fn try_intersect(&self, other: &Self) -> Result<bool, GeometryError> {
        is_non_empty(&self.union_planes(other))
    }

    /// Like [`Frustum::try_intersect`], but an undecidable intersection counts as disjoint.
    pub fn intersect(&self, other: &Self) -> bool {
        intersects(&self.union_planes(other))
    }

    fn union_planes(&self, other: &Self) -> Vec<HalfPlane> {
        self.planes.iter().chain(&other.planes).copied().collect()
    }
}
