use derive_more::{AsMut, AsRef, Deref, DerefMut, From, Into};
use nalgebra::{Point3, Unit, Vector3, Vector4};

#[cfg(feature = "serde-serialize")]
use serde::{Deserialize, Serialize};

/// This trait is implemented for homogeneous projective 3d coordinate.
pub trait Projective: From<Vector4<f64>> + Clone + Copy {
    /// Retrieve the homogeneous vector.
    ///
    /// No constraints are put on this vector. It may be scaled freely and still represent
    /// the same point.
    fn homogeneous(self) -> Vector4<f64>;

    /// Retrieve the euclidean 3d point by normalizing the homogeneous coordinate.
    ///
    /// This fails for points at infinity.
    fn point(self) -> Option<Point3<f64>> {
        Point3::from_homogeneous(self.homogeneous())
    }

    /// Convert the euclidean 3d point into homogeneous coordinates.
    fn from_point(point: Point3<f64>) -> Self {
        point.to_homogeneous().into()
    }

    /// Retrieve the normalized bearing of the coordinate.
    fn bearing(self) -> Unit<Vector3<f64>> {
        Unit::new_normalize(self.bearing_unnormalized())
    }

    /// Retrieve the unnormalized bearing of the coordinate.
    fn bearing_unnormalized(self) -> Vector3<f64> {
        self.homogeneous().xyz()
    }
}

/// A 3d point relative to the optical center and orientation of a camera.
///
/// The positive X axis is right, the positive Y axis is down, and the positive Z axis
/// points forward from the optical center, so the Z component is the depth of the point.
#[derive(Debug, Clone, Copy, PartialEq, PartialOrd, AsMut, AsRef, Deref, DerefMut, From, Into)]
#[cfg_attr(feature = "serde-serialize", derive(Serialize, Deserialize))]
pub struct CameraPoint(pub Vector4<f64>);

impl Projective for CameraPoint {
    fn homogeneous(self) -> Vector4<f64> {
        self.into()
    }
}

impl CameraPoint {
    /// The depth of the point along the optical axis.
    ///
    /// Returns `None` for points at infinity.
    pub fn depth(self) -> Option<f64> {
        self.point().map(|p| p.z)
    }
}

/// A point in the frame of the map.
///
/// Landmarks of a map are stored as world points. The unit of distance is whatever unit the
/// map was reconstructed in.
#[derive(Debug, Clone, Copy, PartialEq, PartialOrd, AsMut, AsRef, Deref, DerefMut, From, Into)]
#[cfg_attr(feature = "serde-serialize", derive(Serialize, Deserialize))]
pub struct WorldPoint(pub Vector4<f64>);

impl Projective for WorldPoint {
    fn homogeneous(self) -> Vector4<f64> {
        self.into()
    }
}

impl From<Point3<f64>> for WorldPoint {
    fn from(point: Point3<f64>) -> Self {
        Self::from_point(point)
    }
}
