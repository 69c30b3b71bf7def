use crate::WorldPoint;

#[cfg(feature = "serde-serialize")]
use serde::{Deserialize, Serialize};

/// A match between a feature on one image and a feature on another image.
#[derive(Debug, Clone, Copy, PartialEq, PartialOrd)]
#[cfg_attr(feature = "serde-serialize", derive(Serialize, Deserialize))]
pub struct FeatureMatch<P>(pub P, pub P);

/// A match between a feature on an image and the world point it observes.
#[derive(Debug, Clone, Copy, PartialEq, PartialOrd)]
#[cfg_attr(feature = "serde-serialize", derive(Serialize, Deserialize))]
pub struct FeatureWorldMatch<P>(pub P, pub WorldPoint);
