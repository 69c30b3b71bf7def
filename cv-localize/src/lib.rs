//! Sequential camera relocalization against a sparse 3d map.
//!
//! A [`Localizer`] takes the described frames of a sequence one at a time. Each frame is first
//! matched against the most recently localized frames in the [`TemporalBuffer`]. When that does
//! not produce enough correspondences, candidate views are retrieved from the [`Map`] and
//! matched instead. The pose is then resected with a robust estimator and refined on its
//! inliers. Frames that cannot be localized are recorded as invalid and the sequence moves on.
//!
//! Once a sequence is done, [`refine_sequence`] adjusts all the valid poses together.

mod buffer;
mod error;
mod estimator;
#[cfg(feature = "fiducial")]
mod fiducial;
mod frame;
mod localizer;
mod map;
mod matching;
mod refine;
mod result;
mod retrieval;
mod session;
mod settings;
mod trajectory;

pub use buffer::*;
pub use error::*;
pub use estimator::*;
#[cfg(feature = "fiducial")]
pub use fiducial::*;
pub use frame::*;
pub use localizer::*;
pub use map::*;
pub use matching::*;
pub use refine::*;
pub use result::*;
pub use retrieval::*;
pub use session::*;
pub use settings::*;
pub use trajectory::*;

/// The number of correspondences that determine a camera pose.
pub const MIN_RESECTION_INLIERS: usize = 6;
