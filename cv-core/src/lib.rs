//! # Core types for relocalization
//!
//! This crate provides the shared vocabulary used by every crate in the workspace: poses,
//! projective points, image keypoints, the camera model trait, and feature-to-world matches.
//! It is kept small on purpose so that the geometry, estimation, optimization and localization
//! crates can all agree on the same types without pulling in each other.
//!
//! ## Coordinate conventions
//!
//! * A [`WorldPoint`] lives in the frame of the map.
//! * A [`CameraPoint`] lives in the frame of one camera, where X is right, Y is down and Z points
//!   forward along the optical axis.
//! * A [`WorldToCamera`] pose maps the first into the second. Its inverse, [`CameraToWorld`],
//!   carries the optical center of the camera as its translation.
//!
//! A camera pose is often specified as a rotation plus the optical center `C` in world
//! coordinates. The translation of the equivalent [`WorldToCamera`] is then `t = -R * C`:
//!
//! ```
//! use cv_core::{Pose, WorldToCamera};
//! use cv_core::nalgebra::{Point3, Rotation3};
//!
//! let rotation = Rotation3::from_euler_angles(0.1, -0.3, 0.2);
//! let center = Point3::new(1.0, 2.0, -3.0);
//! let pose = WorldToCamera::from_rotation_center(rotation, center);
//! assert!((pose.center() - center).norm() < 1e-12);
//! ```

mod camera;
mod keypoint;
mod matches;
mod point;
mod pose;
mod so3;

pub use camera::*;
pub use cv_consensus as consensus;
pub use cv_consensus::sample_consensus;
pub use keypoint::*;
pub use matches::*;
pub use nalgebra;
pub use point::*;
pub use pose::*;
pub use so3::*;
