use crate::{LandmarkId, LocalizationResult, LocalizeError, SequenceSettings};
use cv_core::nalgebra::Point3;
use cv_core::WorldToCamera;
use cv_optimize::{refine, Observation, OptimizeError, SequenceProblem, TerminationReason};
use cv_pinhole::CameraIntrinsicsK3Distortion;
use itertools::Itertools;
use log::*;
use std::collections::{BTreeMap, HashMap};

/// The refined state of the valid frames of a sequence.
#[derive(Debug, Clone, PartialEq)]
pub struct SequenceRefinement {
    /// The index of every refined result.
    pub frames: Vec<usize>,
    /// The refined pose of every refined result.
    pub poses: Vec<WorldToCamera>,
    /// The refined intrinsics of every refined result.
    pub intrinsics: Vec<CameraIntrinsicsK3Distortion>,
    pub points: HashMap<LandmarkId, Point3<f64>>,
    pub termination: TerminationReason,
    /// The number of residual evaluations of the minimization.
    pub evaluations: usize,
    pub initial_rms: f64,
    pub final_rms: f64,
}

/// Refines the poses of the valid results, and the intrinsics and landmarks if asked to.
///
/// Invalid results are skipped. Nothing is modified; see [`apply_refinement`].
pub fn compute_refinement(
    results: &[LocalizationResult],
    settings: &SequenceSettings,
) -> Result<SequenceRefinement, LocalizeError> {
    let visibility = results
        .iter()
        .filter(|result| result.is_valid())
        .flat_map(|result| result.inliers().iter().map(|inlier| inlier.landmark).unique())
        .counts();
    let mut landmarks: BTreeMap<LandmarkId, (usize, Point3<f64>)> = BTreeMap::new();
    for inlier in results
        .iter()
        .filter(|result| result.is_valid())
        .flat_map(|result| result.inliers())
    {
        if visibility.get(&inlier.landmark).copied().unwrap_or(0) >= settings.min_point_visibility {
            let next = landmarks.len();
            landmarks.entry(inlier.landmark).or_insert((next, inlier.point));
        }
    }

    let mut frames = vec![];
    let mut poses = vec![];
    let mut intrinsics = vec![];
    let mut frame_intrinsics = vec![];
    let mut observations = vec![];
    for (ix, result) in results.iter().enumerate() {
        let (pose, frame_intrinsic) = match (result.pose(), result.intrinsics()) {
            (Some(pose), Some(intrinsic)) => (pose, intrinsic),
            _ => {
                debug!("skipping {} in sequence refinement", result.frame());
                continue;
            }
        };
        let frame = frames.len();
        let before = observations.len();
        observations.extend(result.inliers().iter().filter_map(|inlier| {
            landmarks.get(&inlier.landmark).map(|&(landmark, _)| Observation {
                frame,
                landmark,
                keypoint: inlier.keypoint,
            })
        }));
        if observations.len() == before {
            debug!("{} observes no retained landmark", result.frame());
            continue;
        }
        let frame_intrinsic = if settings.model_distortion {
            frame_intrinsic
        } else {
            CameraIntrinsicsK3Distortion::undistorted(frame_intrinsic.simple_intrinsics)
        };
        if !settings.shared_intrinsics || intrinsics.is_empty() {
            intrinsics.push(frame_intrinsic);
        }
        frame_intrinsics.push(intrinsics.len() - 1);
        frames.push(ix);
        poses.push(pose);
    }
    info!(
        "refining {} of {} frames with {} landmarks and {} observations",
        frames.len(),
        results.len(),
        landmarks.len(),
        observations.len()
    );
    if frames.is_empty() {
        return Err(OptimizeError::NoObservations.into());
    }

    let mut ids = vec![LandmarkId(0); landmarks.len()];
    let mut points = vec![Point3::origin(); landmarks.len()];
    for (&id, &(ix, point)) in &landmarks {
        ids[ix] = id;
        points[ix] = point;
    }
    let problem = SequenceProblem::new(
        &poses,
        &intrinsics,
        &frame_intrinsics,
        &points,
        observations,
        settings.options(),
    )?;
    let refinement = refine(problem, &settings.solver())?;
    info!(
        "sequence refinement reduced the RMS reprojection error from {} to {}",
        refinement.initial_rms, refinement.final_rms
    );
    Ok(SequenceRefinement {
        intrinsics: frame_intrinsics
            .iter()
            .map(|&group| refinement.intrinsics[group])
            .collect(),
        poses: refinement.poses,
        frames,
        points: ids.into_iter().zip(refinement.landmarks).collect(),
        termination: refinement.termination,
        evaluations: refinement.evaluations,
        initial_rms: refinement.initial_rms,
        final_rms: refinement.final_rms,
    })
}

/// Writes a refinement into the results it was computed from.
pub fn apply_refinement(results: &mut [LocalizationResult], refinement: &SequenceRefinement) {
    for ((&frame, &pose), &intrinsics) in refinement
        .frames
        .iter()
        .zip(&refinement.poses)
        .zip(&refinement.intrinsics)
    {
        if let Some(result) = results.get_mut(frame) {
            result.apply_refinement(pose, intrinsics, &refinement.points);
        }
    }
}

/// Refines a localized sequence in place. On failure the results are left untouched.
pub fn refine_sequence(
    results: &mut [LocalizationResult],
    settings: &SequenceSettings,
) -> Result<SequenceRefinement, LocalizeError> {
    let refinement = compute_refinement(results, settings)?;
    apply_refinement(results, &refinement);
    Ok(refinement)
}
