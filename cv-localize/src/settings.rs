use crate::LocalizeError;
use cv_consensus::{FitParameters, NfaParameters, RobustEstimator};
use cv_optimize::{LevenbergMarquardt, RefinementOptions};
use log::*;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// How the candidates returned by retrieval are turned into a pose.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Algorithm {
    /// Stop at the first candidate that produces a valid pose.
    FirstBest,
    /// Pool the correspondences of every matched candidate and resect once.
    AllResults,
}

impl Default for Algorithm {
    fn default() -> Self {
        Self::AllResults
    }
}

impl fmt::Display for Algorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::FirstBest => write!(f, "FirstBest"),
            Self::AllResults => write!(f, "AllResults"),
        }
    }
}

impl FromStr for Algorithm {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let name: String = s
            .chars()
            .filter(|&c| c != '-' && c != '_')
            .map(|c| c.to_ascii_lowercase())
            .collect();
        match name.as_str() {
            "firstbest" => Ok(Self::FirstBest),
            "allresults" => Ok(Self::AllResults),
            _ => Err(format!(
                "unknown algorithm {:?}, expected first-best or all-results",
                s
            )),
        }
    }
}

/// The settings for localizing a sequence.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LocalizerSettings {
    /// The robust estimator used for resection.
    #[serde(default)]
    pub resection_estimator: RobustEstimator,
    /// The maximum reprojection error in pixels for resection. `0` lets AC-RANSAC choose.
    #[serde(default = "default_error_max")]
    pub resection_error_max: f64,
    /// The robust estimator used for the geometric check of matches.
    #[serde(default)]
    pub matching_estimator: RobustEstimator,
    /// The maximum epipolar error in pixels for matching. `0` lets AC-RANSAC choose.
    #[serde(default = "default_error_max")]
    pub matching_error_max: f64,
    /// The number of candidate views to retrieve for each frame.
    #[serde(default = "default_num_results")]
    pub num_results: usize,
    /// With [`Algorithm::AllResults`], stop matching after this many candidates matched. `0`
    /// disables the limit.
    #[serde(default = "default_max_results")]
    pub max_results: usize,
    /// How candidates are combined into a pose.
    #[serde(default)]
    pub algorithm: Algorithm,
    /// The number of previously localized frames kept for matching. `0` disables the buffer.
    #[serde(default = "default_frame_buffer_matching")]
    pub frame_buffer_matching: usize,
    /// The number of correspondences the buffer must produce before retrieval is skipped.
    #[serde(default = "default_buffer_min_correspondences")]
    pub buffer_min_correspondences: usize,
    /// Require matches to agree with a fundamental matrix.
    #[serde(default = "default_robust_matching")]
    pub robust_matching: bool,
    /// Refine the intrinsics of every localized frame.
    #[serde(default)]
    pub refine_intrinsics: bool,
    /// The nearest neighbor must be closer than this fraction of the second nearest.
    #[serde(default = "default_distance_ratio")]
    pub distance_ratio: f64,
    /// The maximum number of hypotheses per consensus run.
    #[serde(default = "default_ransac_iterations")]
    pub ransac_iterations: usize,
    /// The confidence at which LO-RANSAC stops sampling.
    #[serde(default = "default_ransac_confidence")]
    pub ransac_confidence: f64,
    /// The minimum number of inliers of a valid pose. Never less than six.
    #[serde(default = "default_min_inliers")]
    pub min_inliers: usize,
    /// Drop candidates whose frustum cannot overlap the previous pose.
    #[serde(default = "default_frustum_pruning")]
    pub frustum_pruning: bool,
    /// The number of keyframes sharing markers with the query that are searched.
    #[serde(default = "default_fiducial_nearest_keyframes")]
    pub fiducial_nearest_keyframes: usize,
    /// The refinement of the whole sequence after localization.
    #[serde(default)]
    pub sequence: SequenceSettings,
}

impl Default for LocalizerSettings {
    fn default() -> Self {
        Self {
            resection_estimator: RobustEstimator::default(),
            resection_error_max: default_error_max(),
            matching_estimator: RobustEstimator::default(),
            matching_error_max: default_error_max(),
            num_results: default_num_results(),
            max_results: default_max_results(),
            algorithm: Algorithm::default(),
            frame_buffer_matching: default_frame_buffer_matching(),
            buffer_min_correspondences: default_buffer_min_correspondences(),
            robust_matching: default_robust_matching(),
            refine_intrinsics: false,
            distance_ratio: default_distance_ratio(),
            ransac_iterations: default_ransac_iterations(),
            ransac_confidence: default_ransac_confidence(),
            min_inliers: default_min_inliers(),
            frustum_pruning: default_frustum_pruning(),
            fiducial_nearest_keyframes: default_fiducial_nearest_keyframes(),
            sequence: SequenceSettings::default(),
        }
    }
}

impl LocalizerSettings {
    /// Checks the settings and returns them with thresholds in the form the estimators use.
    ///
    /// A zero AC-RANSAC threshold becomes infinite. A LO-RANSAC threshold that is not strictly
    /// positive is an error. Sequence refinement is turned off when per-frame intrinsics
    /// refinement is on.
    pub fn validate(mut self) -> Result<Self, LocalizeError> {
        self.resection_error_max = self
            .resection_estimator
            .checked_threshold(self.resection_error_max)?;
        self.matching_error_max = self
            .matching_estimator
            .checked_threshold(self.matching_error_max)?;
        if !(self.distance_ratio > 0.0 && self.distance_ratio <= 1.0) {
            return Err(LocalizeError::Configuration(format!(
                "the distance ratio must be in (0, 1], got {}",
                self.distance_ratio
            )));
        }
        if self.num_results == 0 {
            return Err(LocalizeError::Configuration(
                "at least one candidate must be retrieved".to_string(),
            ));
        }
        if self.sequence.enabled && self.refine_intrinsics {
            warn!("sequence refinement is disabled because per-frame intrinsics refinement is on");
            self.sequence.enabled = false;
        }
        Ok(self)
    }

    /// The inlier floor, which is never below the minimal resection sample.
    pub fn inlier_floor(&self) -> usize {
        self.min_inliers.max(crate::MIN_RESECTION_INLIERS)
    }

    pub fn resection_parameters(&self, width: f64, height: f64) -> FitParameters {
        FitParameters {
            iterations: self.ransac_iterations,
            confidence: self.ransac_confidence,
            min_inliers: self.inlier_floor(),
            nfa: NfaParameters::point_to_point(width, height),
            max_models: 1,
        }
    }
}

/// The settings of the refinement of a whole localized sequence.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SequenceSettings {
    /// Run the refinement at the end of a run.
    #[serde(default)]
    pub enabled: bool,
    /// Refine focal lengths and principal points.
    #[serde(default = "default_true")]
    pub refine_intrinsics: bool,
    /// Keep and refine the distortion coefficients. Otherwise they are taken as zero.
    #[serde(default = "default_true")]
    pub model_distortion: bool,
    /// Refine the poses of the localized frames.
    #[serde(default = "default_true")]
    pub refine_poses: bool,
    /// Refine the positions of the landmarks.
    #[serde(default)]
    pub refine_structure: bool,
    /// Every frame shares the intrinsics of the first localized frame.
    #[serde(default = "default_true")]
    pub shared_intrinsics: bool,
    /// Landmarks seen by fewer localized frames are left out.
    #[serde(default)]
    pub min_point_visibility: usize,
    /// The patience of the minimization. It gives up after `max_iterations` times one more
    /// than the number of refined parameters residual evaluations.
    #[serde(default = "default_sequence_max_iterations")]
    pub max_iterations: usize,
    /// The relative cost, step and gradient tolerance of the minimization.
    #[serde(default = "default_sequence_tolerance")]
    pub tolerance: f64,
}

impl Default for SequenceSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            refine_intrinsics: true,
            model_distortion: true,
            refine_poses: true,
            refine_structure: false,
            shared_intrinsics: true,
            min_point_visibility: 0,
            max_iterations: default_sequence_max_iterations(),
            tolerance: default_sequence_tolerance(),
        }
    }
}

impl SequenceSettings {
    pub fn options(&self) -> RefinementOptions {
        RefinementOptions {
            refine_poses: self.refine_poses,
            refine_intrinsics: self.refine_intrinsics,
            refine_distortion: self.refine_intrinsics && self.model_distortion,
            refine_structure: self.refine_structure,
        }
    }

    pub fn solver(&self) -> LevenbergMarquardt<f64> {
        LevenbergMarquardt::new()
            .with_patience(self.max_iterations.max(1))
            .with_ftol(self.tolerance)
            .with_xtol(self.tolerance)
            .with_gtol(self.tolerance)
    }
}

fn default_error_max() -> f64 {
    4.0
}

fn default_num_results() -> usize {
    4
}

fn default_max_results() -> usize {
    10
}

fn default_frame_buffer_matching() -> usize {
    10
}

fn default_buffer_min_correspondences() -> usize {
    32
}

fn default_robust_matching() -> bool {
    true
}

fn default_distance_ratio() -> f64 {
    0.8
}

fn default_ransac_iterations() -> usize {
    1024
}

fn default_ransac_confidence() -> f64 {
    0.999
}

fn default_min_inliers() -> usize {
    6
}

fn default_frustum_pruning() -> bool {
    true
}

fn default_fiducial_nearest_keyframes() -> usize {
    5
}

fn default_true() -> bool {
    true
}

fn default_sequence_max_iterations() -> usize {
    100
}

fn default_sequence_tolerance() -> f64 {
    1e-10
}
