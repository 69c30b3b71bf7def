use crate::{
    Correspondence, Inlier, LocalizationResult, LocalizeError, LocalizerSettings, Map, QueryFrame,
};
use cv_consensus::Model;
use cv_core::{FeatureWorldMatch, KeyPoint};
use cv_optimize::{refine, LevenbergMarquardt, Observation, RefinementOptions, SequenceProblem};
use log::*;
use rand::Rng;
use six_point::{Resection, SixPoint};

/// Resects a frame from its correspondences and refines the pose on the inliers.
#[derive(Debug, Clone)]
pub struct PoseEstimator {
    settings: LocalizerSettings,
}

impl PoseEstimator {
    pub fn new(settings: LocalizerSettings) -> Self {
        Self { settings }
    }

    /// Estimates the pose of a frame.
    ///
    /// Frames with known intrinsics keep them. Other frames get a zero skew pinhole calibration
    /// without distortion from the resection.
    pub fn estimate<R: Rng>(
        &self,
        frame: &QueryFrame,
        map: &Map,
        correspondences: &[Correspondence],
        rng: &mut R,
    ) -> Result<LocalizationResult, LocalizeError> {
        let (matches, inliers): (Vec<FeatureWorldMatch<KeyPoint>>, Vec<Inlier>) = correspondences
            .iter()
            .filter_map(|c| {
                let keypoint = frame.features.get(c.query)?.keypoint;
                let point = map.landmark(c.landmark)?.position;
                let inlier = Inlier {
                    query: c.query,
                    keypoint,
                    landmark: c.landmark,
                    point,
                };
                Some((inlier.world_match(), inlier))
            })
            .unzip();
        let floor = self.settings.inlier_floor();
        if matches.len() < floor {
            return Err(LocalizeError::InsufficientCorrespondences {
                found: matches.len(),
                needed: floor,
            });
        }

        let solver = frame
            .intrinsics
            .map_or_else(SixPoint::uncalibrated, SixPoint::calibrated);
        let parameters = self
            .settings
            .resection_parameters(frame.width as f64, frame.height as f64);
        let fit = self.settings.resection_estimator.fit(
            &solver,
            &matches,
            self.settings.resection_error_max,
            &parameters,
            rng,
        )?;
        if fit.inliers.len() < floor {
            return Err(LocalizeError::EstimationFailed(format!(
                "the best pose had {} inliers, need {}",
                fit.inliers.len(),
                floor
            )));
        }
        let threshold = fit.threshold;
        debug!(
            "resected {} with {} of {} inliers at threshold {}",
            frame.name,
            fit.inliers.len(),
            matches.len(),
            threshold
        );

        let consensus_inliers: Vec<Inlier> = fit.inliers.iter().map(|&ix| inliers[ix]).collect();
        let mut model = fit.model;
        let mut selected = consensus_inliers;
        if let Some(refined) = self.refine(&model, &selected) {
            let reselected: Vec<Inlier> = inliers
                .iter()
                .zip(&matches)
                .filter(|&(_, data)| refined.residual(data) <= threshold)
                .map(|(&inlier, _)| inlier)
                .collect();
            // Refinement must not cost the frame any inliers.
            if reselected.len() >= selected.len() {
                model = refined;
                selected = reselected;
            } else {
                debug!(
                    "kept the consensus pose of {}, refinement left {} of {} inliers",
                    frame.name,
                    reselected.len(),
                    selected.len()
                );
            }
        }
        if selected.len() < floor {
            return Err(LocalizeError::EstimationFailed(format!(
                "only {} inliers remained after refinement, need {}",
                selected.len(),
                floor
            )));
        }
        LocalizationResult::localized(
            frame.name.clone(),
            model.pose,
            model.intrinsics,
            selected,
            threshold,
        )
    }

    /// Minimizes the reprojection error of the inliers over the pose, and the intrinsics if
    /// they are refined per frame. `None` when the minimization fails.
    fn refine(&self, model: &Resection, inliers: &[Inlier]) -> Option<Resection> {
        let observations = inliers
            .iter()
            .enumerate()
            .map(|(landmark, inlier)| Observation {
                frame: 0,
                landmark,
                keypoint: inlier.keypoint,
            })
            .collect();
        let points: Vec<_> = inliers.iter().map(|inlier| inlier.point).collect();
        let options = RefinementOptions {
            refine_poses: true,
            refine_intrinsics: self.settings.refine_intrinsics,
            refine_distortion: false,
            refine_structure: false,
        };
        let problem = SequenceProblem::new(
            &[model.pose],
            &[model.intrinsics],
            &[0],
            &points,
            observations,
            options,
        )
        .map_err(|e| debug!("pose refinement could not be set up: {}", e))
        .ok()?;
        let refinement = refine(problem, &LevenbergMarquardt::new().with_patience(50))
            .map_err(|e| debug!("pose refinement failed: {}", e))
            .ok()?;
        Some(Resection {
            pose: *refinement.poses.first()?,
            intrinsics: *refinement.intrinsics.first()?,
        })
    }
}
