//! This crate contains the computational geometry used to decide whether two cameras can see
//! the same part of a scene.
//!
//! ## Half-spaces
//!
//! A [`HalfPlane`] is the set of points on the side of a plane its normal points to. The
//! intersection of a set of half-planes is a convex polyhedron, possibly unbounded. Deciding
//! whether it is empty is a small linear program, solved by [`is_non_empty`].
//!
//! ## Frustums
//!
//! A [`Frustum`] is the volume a pinhole camera can see. Four lateral half-planes pass through
//! the optical center and the image corners. Optionally a near and a far plane bound the depth.
//!
//! ```text
//!            far
//!      +-------------+
//!       \           /
//!        \  near   /
//!         +-------+
//!          \     /
//!           \   /
//!            \ /
//!             C
//! ```
//!
//! Two frustums overlap when the union of their half-planes has a non-empty intersection.

mod frustum;
mod half_space;

pub use frustum::*;
pub use half_space::*;

use thiserror::Error;

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum GeometryError {
    /// The linear program could not decide whether the intersection is empty.
    #[error("the half-space intersection could not be determined")]
    Indeterminate,
    /// The points given to build a half-plane are colinear or the normal is zero.
    #[error("the half-plane normal is degenerate")]
    DegenerateNormal,
    /// The calibration matrix cannot be inverted.
    #[error("the intrinsic matrix is singular")]
    SingularIntrinsics,
    /// The near depth is negative or not below the far depth.
    #[error("the frustum depth range is invalid")]
    InvalidDepthRange,
}
