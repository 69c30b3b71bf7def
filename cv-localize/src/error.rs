use cv_consensus::ConsensusError;
use cv_geom::GeometryError;
use cv_optimize::{OptimizeError, TerminationReason};
use thiserror::Error;

/// Everything that can go wrong while localizing a sequence.
///
/// Only [`LocalizeError::Configuration`] and unreadable inputs abort a run. Every other variant
/// is recorded against the frame it happened on and the run moves on to the next frame.
#[derive(Debug, Error)]
pub enum LocalizeError {
    #[error("invalid configuration: {0}")]
    Configuration(String),
    #[error("candidate retrieval is unavailable: {0}")]
    RetrievalUnavailable(String),
    #[error("only found {found} correspondences, need {needed}")]
    InsufficientCorrespondences { found: usize, needed: usize },
    #[error("pose estimation failed: {0}")]
    EstimationFailed(String),
    #[error(
        "sequence refinement stopped with {termination:?} after {evaluations} evaluations at cost {cost}"
    )]
    RefinementDidNotConverge {
        termination: TerminationReason,
        evaluations: usize,
        cost: f64,
    },
    #[error("sequence refinement could not be set up: {0}")]
    Refinement(OptimizeError),
    #[error("the half-space feasibility test was indeterminate")]
    GeometryIndeterminate,
    #[error("invalid geometry: {0}")]
    Geometry(GeometryError),
    #[error("the map is inconsistent: {0}")]
    InvalidMap(String),
    #[error("the stored result of frame {0} is inconsistent")]
    InvalidResult(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Serialization(#[from] bincode::Error),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

impl From<ConsensusError> for LocalizeError {
    fn from(error: ConsensusError) -> Self {
        match error {
            ConsensusError::Configuration { .. } => Self::Configuration(error.to_string()),
            ConsensusError::InsufficientCorrespondences { found, needed } => {
                Self::InsufficientCorrespondences { found, needed }
            }
            ConsensusError::EstimationFailed { .. } => Self::EstimationFailed(error.to_string()),
        }
    }
}

impl From<GeometryError> for LocalizeError {
    fn from(error: GeometryError) -> Self {
        match error {
            GeometryError::Indeterminate => Self::GeometryIndeterminate,
            other => Self::Geometry(other),
        }
    }
}

impl From<OptimizeError> for LocalizeError {
    fn from(error: OptimizeError) -> Self {
        match error {
            OptimizeError::DidNotConverge {
                termination,
                evaluations,
                objective_function,
            } => Self::RefinementDidNotConverge {
                termination,
                evaluations,
                cost: objective_function,
            },
            other => Self::Refinement(other),
        }
    }
}

impl LocalizeError {
    /// Errors that end a run instead of a single frame.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::Configuration(_) | Self::Io(_) | Self::Serialization(_) | Self::Json(_)
        )
    }
}
