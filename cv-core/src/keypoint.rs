use derive_more::{AsMut, AsRef, Deref, DerefMut, From, Into};
use nalgebra::Point2;

#[cfg(feature = "serde-serialize")]
use serde::{Deserialize, Serialize};

/// Allows the retrieval of the point on the image the feature came from.
pub trait ImagePoint {
    /// Retrieves the point on the image
    fn image_point(&self) -> Point2<f64>;
}

/// A point on an image frame in pixel coordinates.
///
/// The keypoint is neither undistorted nor normalized. To remove the effect of the lens,
/// pass it through a [`CameraModel`](crate::CameraModel).
#[derive(Debug, Clone, Copy, PartialEq, PartialOrd, AsMut, AsRef, Deref, DerefMut, From, Into)]
#[cfg_attr(feature = "serde-serialize", derive(Serialize, Deserialize))]
pub struct KeyPoint(pub Point2<f64>);

impl KeyPoint {
    pub fn new(x: f64, y: f64) -> Self {
        Self(Point2::new(x, y))
    }
}

impl ImagePoint for KeyPoint {
    fn image_point(&self) -> Point2<f64> {
        self.0
    }
}

impl ImagePoint for Point2<f64> {
    fn image_point(&self) -> Point2<f64> {
        *self
    }
}
