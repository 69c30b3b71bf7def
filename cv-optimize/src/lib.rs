//! Nonlinear least squares refinement of camera poses, intrinsics and structure.
//!
//! [`SequenceProblem`] is a [`LeastSquaresProblem`] over a sequence of localized frames, so it
//! is minimized by the [`LevenbergMarquardt`] solver of the `levenberg-marquardt` crate. Poses
//! are refined as local se(3) increments on top of the poses the problem was built from.

mod sequence;

pub use levenberg_marquardt::{
    LeastSquaresProblem, LevenbergMarquardt, MinimizationReport, TerminationReason,
};
pub use sequence::*;

use thiserror::Error;

#[cfg(feature = "serde-serialize")]
use serde::{Deserialize, Serialize};

/// Which parameters a refinement may change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde-serialize", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde-serialize", serde(default))]
pub struct RefinementOptions {
    /// Refine the pose of every frame.
    pub refine_poses: bool,
    /// Refine focal lengths and principal points.
    pub refine_intrinsics: bool,
    /// Refine the radial distortion coefficients.
    pub refine_distortion: bool,
    /// Refine the positions of the landmarks.
    pub refine_structure: bool,
}

impl Default for RefinementOptions {
    fn default() -> Self {
        Self {
            refine_poses: true,
            refine_intrinsics: false,
            refine_distortion: false,
            refine_structure: false,
        }
    }
}

impl RefinementOptions {
    pub fn refines_anything(&self) -> bool {
        self.refine_poses || self.refine_intrinsics || self.refine_distortion || self.refine_structure
    }
}

#[derive(Debug, Error, Clone, PartialEq)]
pub enum OptimizeError {
    #[error("there are no observations to refine")]
    NoObservations,
    #[error("no parameters were selected for refinement")]
    NothingToRefine,
    #[error("observation {observation} references frame {frame}, but only {frames} frames exist")]
    InvalidFrame {
        observation: usize,
        frame: usize,
        frames: usize,
    },
    #[error("observation {observation} references landmark {landmark}, but only {landmarks} landmarks exist")]
    InvalidLandmark {
        observation: usize,
        landmark: usize,
        landmarks: usize,
    },
    #[error("frame {frame} references intrinsics {intrinsics}, but only {groups} exist")]
    InvalidIntrinsics {
        frame: usize,
        intrinsics: usize,
        groups: usize,
    },
    #[error(
        "refinement stopped with {termination:?} after {evaluations} evaluations at cost {objective_function}"
    )]
    DidNotConverge {
        termination: TerminationReason,
        evaluations: usize,
        objective_function: f64,
    },
}

impl From<MinimizationReport<f64>> for OptimizeError {
    fn from(report: MinimizationReport<f64>) -> Self {
        Self::DidNotConverge {
            termination: report.termination,
            evaluations: report.number_of_evaluations,
            objective_function: report.objective_function,
        }
    }
}
