use crate::{
    LeastSquaresProblem, LevenbergMarquardt, OptimizeError, RefinementOptions, TerminationReason,
};
use cv_core::nalgebra::{
    dimension::{Dynamic, U1},
    DMatrix, DVector, Point2, Point3, VecStorage, Vector2, Vector3, Vector6,
};
use cv_core::{CameraModel, KeyPoint, Pose, WorldToCamera};
use cv_pinhole::{CameraIntrinsics, CameraIntrinsicsK3Distortion, NormalizedKeyPoint};
use log::*;

/// Pose (6), intrinsics (4), distortion (3) and landmark (3) parameters of one observation.
const LOCAL: usize = 16;

/// The residual of each axis of an observation whose landmark is not in front of its camera.
///
/// It is constant, so moving a landmark behind a camera always raises the cost by far more
/// than any reprojection error it could remove.
pub const BEHIND_CAMERA_RESIDUAL: f64 = 1e4;

/// An observation of a landmark in a frame.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Observation {
    pub frame: usize,
    pub landmark: usize,
    pub keypoint: KeyPoint,
}

/// Where each refined parameter lives in the parameter vector.
///
/// The camera side (pose increments, intrinsics, distortion) comes first, the landmarks last.
#[derive(Debug, Clone, Copy)]
struct Layout {
    options: RefinementOptions,
    frames: usize,
    groups: usize,
    landmarks: usize,
}

impl Layout {
    fn poses_len(&self) -> usize {
        if self.options.refine_poses {
            6 * self.frames
        } else {
            0
        }
    }

    fn intrinsics_len(&self) -> usize {
        if self.options.refine_intrinsics {
            4 * self.groups
        } else {
            0
        }
    }

    fn distortion_len(&self) -> usize {
        if self.options.refine_distortion {
            3 * self.groups
        } else {
            0
        }
    }

    fn camera_len(&self) -> usize {
        self.poses_len() + self.intrinsics_len() + self.distortion_len()
    }

    fn len(&self) -> usize {
        self.camera_len()
            + if self.options.refine_structure {
                3 * self.landmarks
            } else {
                0
            }
    }

    /// The global index of every active local parameter of an observation.
    fn local_indices(&self, frame: usize, group: usize, landmark: usize) -> [Option<usize>; LOCAL] {
        let mut indices = [None; LOCAL];
        if self.options.refine_poses {
            for k in 0..6 {
                indices[k] = Some(6 * frame + k);
            }
        }
        if self.options.refine_intrinsics {
            for k in 0..4 {
                indices[6 + k] = Some(self.poses_len() + 4 * group + k);
            }
        }
        if self.options.refine_distortion {
            for k in 0..3 {
                indices[10 + k] = Some(self.poses_len() + self.intrinsics_len() + 3 * group + k);
            }
        }
        if self.options.refine_structure {
            for k in 0..3 {
                indices[13 + k] = Some(self.camera_len() + 3 * landmark + k);
            }
        }
        indices
    }
}

/// Intrinsics as `[fx, fy, cx, cy, k1, k2, k3]` plus the fixed skew.
#[derive(Debug, Clone, Copy, PartialEq)]
struct IntrinsicParameters {
    values: [f64; 7],
    skew: f64,
}

impl From<CameraIntrinsicsK3Distortion> for IntrinsicParameters {
    fn from(intrinsics: CameraIntrinsicsK3Distortion) -> Self {
        let simple = intrinsics.simple_intrinsics;
        Self {
            values: [
                simple.focals.x,
                simple.focals.y,
                simple.principal_point.x,
                simple.principal_point.y,
                intrinsics.k1,
                intrinsics.k2,
                intrinsics.k3,
            ],
            skew: simple.skew,
        }
    }
}

fn intrinsics_from(values: &[f64], skew: f64) -> CameraIntrinsicsK3Distortion {
    CameraIntrinsicsK3Distortion::new(
        CameraIntrinsics {
            focals: Vector2::new(values[0], values[1]),
            principal_point: Point2::new(values[2], values[3]),
            skew,
        },
        [values[4], values[5], values[6]],
    )
}

/// Applies a local se(3) increment on top of a pose.
fn compose(increment: &[f64], base: WorldToCamera) -> WorldToCamera {
    let increment = WorldToCamera::from_se3(Vector6::from_column_slice(increment));
    WorldToCamera(increment.isometry() * base.isometry())
}

/// The pixel residual of a projection given all local parameters.
///
/// Returns `None` when the landmark is not in front of the camera.
fn local_residual(
    local: &[f64; LOCAL],
    base: WorldToCamera,
    skew: f64,
    keypoint: KeyPoint,
) -> Option<Vector2<f64>> {
    let pose = compose(&local[0..6], base);
    let intrinsics = intrinsics_from(&local[6..13], skew);
    let point = pose.isometry() * Point3::new(local[13], local[14], local[15]);
    if point.z <= f64::EPSILON {
        return None;
    }
    let normalized = NormalizedKeyPoint(Point2::new(point.x / point.z, point.y / point.z));
    Some(intrinsics.uncalibrate(normalized).0 - keypoint.0)
}

/// Whether the solver stopped at a minimum.
///
/// Stopping because no step can improve the cost within machine precision counts as one.
pub fn converged(termination: &TerminationReason) -> bool {
    termination.was_successful()
        || matches!(termination, TerminationReason::NoImprovementPossible(_))
}

/// Bundle adjustment of a sequence of frames against a set of landmarks.
///
/// Every frame has a pose and uses one of the shared intrinsics. The residual of an observation
/// is the pixel difference between its keypoint and the projection of its landmark, or
/// [`BEHIND_CAMERA_RESIDUAL`] on both axes when the landmark is not in front of the camera.
///
/// Poses are parametrized by an se(3) increment applied on the left of the pose the problem
/// was built with, so the parametrization is well behaved for any starting rotation.
#[derive(Debug, Clone)]
pub struct SequenceProblem {
    layout: Layout,
    poses: Vec<WorldToCamera>,
    increments: Vec<Vector6<f64>>,
    intrinsics: Vec<IntrinsicParameters>,
    frame_intrinsics: Vec<usize>,
    landmarks: Vec<Vector3<f64>>,
    observations: Vec<Observation>,
}

impl SequenceProblem {
    pub fn new(
        poses: &[WorldToCamera],
        intrinsics: &[CameraIntrinsicsK3Distortion],
        frame_intrinsics: &[usize],
        landmarks: &[Point3<f64>],
        observations: Vec<Observation>,
        options: RefinementOptions,
    ) -> Result<Self, OptimizeError> {
        if observations.is_empty() {
            return Err(OptimizeError::NoObservations);
        }
        if !options.refines_anything() {
            return Err(OptimizeError::NothingToRefine);
        }
        for (frame, &group) in frame_intrinsics.iter().enumerate() {
            if group >= intrinsics.len() {
                return Err(OptimizeError::InvalidIntrinsics {
                    frame,
                    intrinsics: group,
                    groups: intrinsics.len(),
                });
            }
        }
        for (ix, observation) in observations.iter().enumerate() {
            if observation.frame >= poses.len() || observation.frame >= frame_intrinsics.len() {
                return Err(OptimizeError::InvalidFrame {
                    observation: ix,
                    frame: observation.frame,
                    frames: poses.len().min(frame_intrinsics.len()),
                });
            }
            if observation.landmark >= landmarks.len() {
                return Err(OptimizeError::InvalidLandmark {
                    observation: ix,
                    landmark: observation.landmark,
                    landmarks: landmarks.len(),
                });
            }
        }
        Ok(Self {
            layout: Layout {
                options,
                frames: poses.len(),
                groups: intrinsics.len(),
                landmarks: landmarks.len(),
            },
            poses: poses.to_vec(),
            increments: vec![Vector6::zeros(); poses.len()],
            intrinsics: intrinsics.iter().map(|&i| i.into()).collect(),
            frame_intrinsics: frame_intrinsics.to_vec(),
            landmarks: landmarks.iter().map(|p| p.coords).collect(),
            observations,
        })
    }

    pub fn poses(&self) -> Vec<WorldToCamera> {
        self.poses
            .iter()
            .zip(&self.increments)
            .map(|(&pose, increment)| compose(increment.as_slice(), pose))
            .collect()
    }

    pub fn intrinsics(&self) -> Vec<CameraIntrinsicsK3Distortion> {
        self.intrinsics
            .iter()
            .map(|group| intrinsics_from(&group.values, group.skew))
            .collect()
    }

    pub fn landmarks(&self) -> Vec<Point3<f64>> {
        self.landmarks.iter().map(|&p| Point3::from(p)).collect()
    }

    pub fn observations(&self) -> &[Observation] {
        &self.observations
    }

    fn local_parameters(&self, observation: &Observation) -> [f64; LOCAL] {
        let mut local = [0.0; LOCAL];
        local[0..6].copy_from_slice(self.increments[observation.frame].as_slice());
        let group = &self.intrinsics[self.frame_intrinsics[observation.frame]];
        local[6..13].copy_from_slice(&group.values);
        local[13..16].copy_from_slice(self.landmarks[observation.landmark].as_slice());
        local
    }

    fn residual(&self, observation: &Observation) -> Vector2<f64> {
        let skew = self.intrinsics[self.frame_intrinsics[observation.frame]].skew;
        local_residual(
            &self.local_parameters(observation),
            self.poses[observation.frame],
            skew,
            observation.keypoint,
        )
        .unwrap_or_else(|| Vector2::repeat(BEHIND_CAMERA_RESIDUAL))
    }

    /// The derivative of the residual of one observation by each of its active parameters,
    /// with central differences.
    ///
    /// Observations behind their camera have a constant residual and so no derivatives.
    fn derivatives(&self, observation: &Observation) -> Vec<(usize, Vector2<f64>)> {
        let group = self.frame_intrinsics[observation.frame];
        let skew = self.intrinsics[group].skew;
        let base = self.poses[observation.frame];
        let local = self.local_parameters(observation);
        let residual = |local: &[f64; LOCAL]| local_residual(local, base, skew, observation.keypoint);
        if residual(&local).is_none() {
            return vec![];
        }
        self.layout
            .local_indices(observation.frame, group, observation.landmark)
            .iter()
            .enumerate()
            .filter_map(|(k, index)| {
                let index = (*index)?;
                let step = 1e-6 * (1.0 + local[k].abs());
                let mut forward = local;
                forward[k] += step;
                let mut backward = local;
                backward[k] -= step;
                let derivative = (residual(&forward)? - residual(&backward)?) / (2.0 * step);
                Some((index, derivative))
            })
            .collect()
    }

    /// The root mean square reprojection error over all observations.
    ///
    /// Observations behind their camera count with [`BEHIND_CAMERA_RESIDUAL`].
    pub fn rms_error(&self) -> f64 {
        let sum: f64 = self
            .observations
            .iter()
            .map(|observation| self.residual(observation).norm_squared())
            .sum();
        (sum / self.observations.len() as f64).sqrt()
    }

    /// The number of observations whose landmark is not in front of its camera.
    pub fn behind_camera(&self) -> usize {
        self.observations
            .iter()
            .filter(|observation| {
                let skew = self.intrinsics[self.frame_intrinsics[observation.frame]].skew;
                local_residual(
                    &self.local_parameters(observation),
                    self.poses[observation.frame],
                    skew,
                    observation.keypoint,
                )
                .is_none()
            })
            .count()
    }
}

impl LeastSquaresProblem<f64, Dynamic, Dynamic> for SequenceProblem {
    type ResidualStorage = VecStorage<f64, Dynamic, U1>;
    type JacobianStorage = VecStorage<f64, Dynamic, Dynamic>;
    type ParameterStorage = VecStorage<f64, Dynamic, U1>;

    fn set_params(&mut self, params: &DVector<f64>) {
        let options = self.layout.options;
        let mut offset = 0;
        if options.refine_poses {
            for increment in &mut self.increments {
                increment.copy_from(&params.fixed_rows::<6>(offset));
                offset += 6;
            }
        }
        if options.refine_intrinsics {
            for group in &mut self.intrinsics {
                for k in 0..4 {
                    group.values[k] = params[offset + k];
                }
                offset += 4;
            }
        }
        if options.refine_distortion {
            for group in &mut self.intrinsics {
                for k in 0..3 {
                    group.values[4 + k] = params[offset + k];
                }
                offset += 3;
            }
        }
        if options.refine_structure {
            for landmark in &mut self.landmarks {
                landmark.copy_from(&params.fixed_rows::<3>(offset));
                offset += 3;
            }
        }
    }

    fn params(&self) -> DVector<f64> {
        let options = self.layout.options;
        let increments = self
            .increments
            .iter()
            .filter(|_| options.refine_poses)
            .flat_map(|increment| increment.iter().copied());
        let intrinsics = self
            .intrinsics
            .iter()
            .filter(|_| options.refine_intrinsics)
            .flat_map(|group| group.values[0..4].iter().copied());
        let distortion = self
            .intrinsics
            .iter()
            .filter(|_| options.refine_distortion)
            .flat_map(|group| group.values[4..7].iter().copied());
        let landmarks = self
            .landmarks
            .iter()
            .filter(|_| options.refine_structure)
            .flat_map(|landmark| landmark.iter().copied());
        DVector::from_iterator(
            self.layout.len(),
            increments.chain(intrinsics).chain(distortion).chain(landmarks),
        )
    }

    /// `None` when a residual is not finite, which stops the minimization.
    fn residuals(&self) -> Option<DVector<f64>> {
        let residuals = DVector::from_iterator(
            2 * self.observations.len(),
            self.observations.iter().flat_map(|observation| {
                let residual = self.residual(observation);
                [residual.x, residual.y]
            }),
        );
        if residuals.iter().all(|r| r.is_finite()) {
            Some(residuals)
        } else {
            None
        }
    }

    fn jacobian(&self) -> Option<DMatrix<f64>> {
        let mut jacobian = DMatrix::zeros(2 * self.observations.len(), self.layout.len());
        for (row, observation) in self.observations.iter().enumerate() {
            for (column, derivative) in self.derivatives(observation) {
                jacobian[(2 * row, column)] = derivative.x;
                jacobian[(2 * row + 1, column)] = derivative.y;
            }
        }
        if jacobian.iter().all(|v| v.is_finite()) {
            Some(jacobian)
        } else {
            None
        }
    }
}

/// The refined values of a [`SequenceProblem`].
#[derive(Debug, Clone, PartialEq)]
pub struct Refinement {
    pub poses: Vec<WorldToCamera>,
    pub intrinsics: Vec<CameraIntrinsicsK3Distortion>,
    pub landmarks: Vec<Point3<f64>>,
    pub termination: TerminationReason,
    /// The number of residual evaluations of the minimization.
    pub evaluations: usize,
    pub initial_rms: f64,
    pub final_rms: f64,
}

/// Minimizes the problem without touching anything it was built from.
///
/// Fails with [`OptimizeError::DidNotConverge`] when the minimization stops for any reason
/// other than reaching a minimum, in which case nothing should be applied.
pub fn refine(
    problem: SequenceProblem,
    solver: &LevenbergMarquardt<f64>,
) -> Result<Refinement, OptimizeError> {
    let initial_rms = problem.rms_error();
    let (problem, report) = solver.minimize(problem);
    if !converged(&report.termination) {
        info!(
            "refinement stopped with {:?} after {} evaluations",
            report.termination, report.number_of_evaluations
        );
        return Err(report.into());
    }
    let final_rms = problem.rms_error();
    debug!(
        "refinement reduced RMS reprojection error from {} to {} in {} evaluations",
        initial_rms, final_rms, report.number_of_evaluations
    );
    Ok(Refinement {
        poses: problem.poses(),
        intrinsics: problem.intrinsics(),
        landmarks: problem.landmarks(),
        termination: report.termination,
        evaluations: report.number_of_evaluations,
        initial_rms,
        final_rms,
    })
}
