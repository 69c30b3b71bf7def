use crate::{ImagePoint, KeyPoint};

/// Allows conversion between the point on an image and the internal projection
/// of the camera model.
pub trait CameraModel {
    /// The calibrated representation of an image point.
    type Projection;

    /// Removes the effect of the intrinsics (and lens) from a pixel location.
    ///
    /// The image point uses the usual image frame: X is right and Y is down.
    fn calibrate<P>(&self, point: P) -> Self::Projection
    where
        P: ImagePoint;

    /// Applies the intrinsics (and lens) to a calibrated projection to get back to pixels.
    fn uncalibrate(&self, projection: Self::Projection) -> KeyPoint;
}
