//! Robust model fitting by random sample consensus.
//!
//! Two consensus policies are provided, both implementing the [`Consensus`] trait of
//! `sample-consensus` over its [`Estimator`] and [`Model`] traits:
//!
//! * [`LoRansac`] scores hypotheses by their inlier count under a fixed threshold and
//!   locally re-optimizes every new best hypothesis on its inliers.
//! * [`AcRansac`] ranks hypotheses by their number of false alarms (NFA) and picks the inlier
//!   threshold automatically. An explicit threshold only bounds that choice from above.
//!
//! Besides the model and its inliers, [`LoRansac::fit`] and [`AcRansac::fit`] report the
//! threshold that selected the inliers in a [`Fit`]. [`RobustEstimator`] selects one of the
//! two at runtime and validates the threshold handed to it.

mod ac_ransac;
mod lo_ransac;

pub use ac_ransac::*;
pub use lo_ransac::*;
pub use sample_consensus;
pub use sample_consensus::{Consensus, Estimator, Model};

use core::fmt;
use core::str::FromStr;
use rand::Rng;
use thiserror::Error;

#[cfg(feature = "serde-serialize")]
use serde::{Deserialize, Serialize};

/// Thresholds at or below this value are rejected by [`RobustEstimator::LoRansac`].
pub const LO_RANSAC_MIN_THRESHOLD: f64 = 1e-6;

/// The outcome of a consensus run.
#[derive(Debug, Clone, PartialEq)]
pub struct Fit<M> {
    /// The best model found.
    pub model: M,
    /// The indices of the data that agree with the model, in ascending residual order for
    /// [`AcRansac`] and ascending index order for [`LoRansac`].
    pub inliers: Vec<usize>,
    /// The threshold that was used to select the inliers.
    pub threshold: f64,
}

#[derive(Debug, Error, Clone, PartialEq)]
pub enum ConsensusError {
    #[error("the {policy} estimator does not accept a threshold of {threshold}")]
    Configuration {
        policy: RobustEstimator,
        threshold: f64,
    },
    #[error("only {found} correspondences were provided, but {needed} are needed")]
    InsufficientCorrespondences { found: usize, needed: usize },
    #[error("the best hypothesis had {best_inliers} inliers, but {needed} are needed")]
    EstimationFailed { best_inliers: usize, needed: usize },
}

/// The robust estimation policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde-serialize", derive(Serialize, Deserialize))]
pub enum RobustEstimator {
    LoRansac,
    AcRansac,
}

impl Default for RobustEstimator {
    fn default() -> Self {
        Self::AcRansac
    }
}

impl fmt::Display for RobustEstimator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::LoRansac => write!(f, "loransac"),
            Self::AcRansac => write!(f, "acransac"),
        }
    }
}

impl FromStr for RobustEstimator {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().replace(['-', '_'], "").as_str() {
            "loransac" => Ok(Self::LoRansac),
            "acransac" => Ok(Self::AcRansac),
            other => Err(format!(
                "unknown robust estimator {:?}, only acransac and loransac are supported",
                other
            )),
        }
    }
}

/// Parameters shared by both policies when they are driven through [`RobustEstimator::fit`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FitParameters {
    /// Upper bound on the number of sampled hypotheses.
    pub iterations: usize,
    /// Confidence used by [`LoRansac`] to stop sampling early.
    pub confidence: f64,
    /// The inlier floor below which [`LoRansac`] reports a failure.
    pub min_inliers: usize,
    /// The background model used by [`AcRansac`].
    pub nfa: NfaParameters,
    /// The most models the estimator returns for one minimal sample.
    pub max_models: usize,
}

impl RobustEstimator {
    /// Validates a user threshold for this policy and returns the threshold to use.
    ///
    /// * LO-RANSAC needs a strictly positive inlier band, so anything at or below
    ///   [`LO_RANSAC_MIN_THRESHOLD`] is a configuration error.
    /// * AC-RANSAC treats `0` as "choose automatically", which is `f64::INFINITY`.
    ///
    /// Negative or NaN thresholds are rejected by both.
    pub fn checked_threshold(self, threshold: f64) -> Result<f64, ConsensusError> {
        let error = ConsensusError::Configuration {
            policy: self,
            threshold,
        };
        if threshold.is_nan() || threshold < 0.0 {
            return Err(error);
        }
        match self {
            Self::LoRansac if threshold <= LO_RANSAC_MIN_THRESHOLD => Err(error),
            Self::LoRansac => Ok(threshold),
            Self::AcRansac if threshold == 0.0 => Ok(f64::INFINITY),
            Self::AcRansac => Ok(threshold),
        }
    }

    /// Runs the selected policy on the data.
    pub fn fit<E, D, R>(
        self,
        estimator: &E,
        data: &[D],
        threshold: f64,
        parameters: &FitParameters,
        rng: &mut R,
    ) -> Result<Fit<E::Model>, ConsensusError>
    where
        E: Estimator<D>,
        D: Clone,
        R: Rng,
    {
        let threshold = self.checked_threshold(threshold)?;
        match self {
            Self::LoRansac => LoRansac::new(threshold, rng)?
                .max_iterations(parameters.iterations)
                .confidence(parameters.confidence)
                .min_inliers(parameters.min_inliers)
                .fit(estimator, data),
            Self::AcRansac => AcRansac::new(threshold, parameters.nfa, rng)
                .iterations(parameters.iterations)
                .max_models(parameters.max_models)
                .fit(estimator, data),
        }
    }
}

/// Estimates models from the data at the given indices.
fn estimate_from<E, D>(estimator: &E, data: &[D], indices: &[usize]) -> E::ModelIter
where
    E: Estimator<D>,
    D: Clone,
{
    estimator.estimate(indices.iter().map(|&ix| data[ix].clone()))
}

/// Collects the indices of the data whose residual is within the threshold.
fn inliers_within<M, D>(model: &M, data: &[D], threshold: f64) -> Vec<usize>
where
    M: Model<D>,
{
    data.iter()
        .enumerate()
        .filter(|(_, datum)| model.residual(datum) <= threshold)
        .map(|(ix, _)| ix)
        .collect()
}
