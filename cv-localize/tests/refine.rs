mod common;

use approx::assert_relative_eq;
use common::{intrinsics, ring_pose, World};
use cv_core::nalgebra::Vector6;
use cv_core::{KeyPoint, Pose, WorldToCamera};
use cv_localize::{
    apply_refinement, compute_refinement, load_results, refine_sequence, save_results, Inlier,
    Keyframe, LandmarkId, LocalizationResult, LocalizeError, SequenceSettings, Trajectory,
};
use rand::{rngs::SmallRng, Rng, SeedableRng};

const ANGLES: [f64; 5] = [0.0, 0.1, 0.2, 0.3, 0.4];

fn inliers(world: &World, pose: WorldToCamera) -> Vec<Inlier> {
    world
        .points
        .iter()
        .enumerate()
        .filter_map(|(ix, &point)| {
            intrinsics()
                .project(pose, point.into())
                .map(|keypoint| Inlier {
                    query: ix,
                    keypoint,
                    landmark: LandmarkId(ix as u32),
                    point,
                })
        })
        .collect()
}

/// Results with exact observations but perturbed poses. The frame at `invalid` failed.
fn results(world: &World, invalid: Option<usize>, seed: u64) -> Vec<LocalizationResult> {
    let mut rng = SmallRng::seed_from_u64(seed);
    ANGLES
        .iter()
        .enumerate()
        .map(|(ix, &angle)| {
            let name = format!("frame{}", ix);
            if Some(ix) == invalid {
                return LocalizationResult::invalid(name);
            }
            let truth = ring_pose(angle);
            let noise = Vector6::from_fn(|_, _| rng.gen_range(-0.01..0.01));
            LocalizationResult::localized(
                name,
                WorldToCamera::from_se3(truth.se3() + noise),
                intrinsics(),
                inliers(world, truth),
                2.0,
            )
            .unwrap()
        })
        .collect()
}

fn poses_only() -> SequenceSettings {
    SequenceSettings {
        enabled: true,
        refine_intrinsics: false,
        ..SequenceSettings::default()
    }
}

#[test]
fn valid_frames_are_refined() {
    let world = World::new(60, 4, 0);
    let mut results = results(&world, None, 1);
    let refinement = refine_sequence(&mut results, &poses_only()).unwrap();
    assert_eq!(refinement.frames, [0, 1, 2, 3, 4]);
    assert!(refinement.final_rms < 1e-6);
    for (result, &angle) in results.iter().zip(&ANGLES) {
        assert_relative_eq!(
            result.pose().unwrap().center(),
            ring_pose(angle).center(),
            epsilon = 1e-5
        );
        assert_eq!(result.intrinsics(), Some(intrinsics()));
    }
}

#[test]
fn invalid_frames_are_skipped() {
    let world = World::new(60, 4, 2);
    let mut results = results(&world, Some(2), 3);
    let refinement = refine_sequence(&mut results, &poses_only()).unwrap();
    assert_eq!(refinement.frames, [0, 1, 3, 4]);
    assert_eq!(results[2], LocalizationResult::invalid("frame2"));

    let trajectory = Trajectory::from_results(&results);
    assert_eq!(trajectory.len(), 5);
    assert_eq!(trajectory.jumps(), 1);
    assert_eq!(
        trajectory.keyframes[2],
        Keyframe::Jump {
            frame: "frame2".to_string()
        }
    );
}

#[test]
fn refinement_is_idempotent() {
    let world = World::new(60, 4, 4);
    let results = results(&world, Some(0), 5);
    let first = compute_refinement(&results, &SequenceSettings::default()).unwrap();
    let second = compute_refinement(&results, &SequenceSettings::default()).unwrap();
    assert_eq!(first, second);

    let mut refined = results.clone();
    apply_refinement(&mut refined, &first);
    let again = compute_refinement(&refined, &SequenceSettings::default()).unwrap();
    assert_relative_eq!(again.final_rms, first.final_rms, epsilon = 1e-6);
}

#[test]
fn failed_refinement_leaves_results_untouched() {
    let world = World::new(60, 4, 6);
    let mut results = results(&world, None, 7);
    let truth = ring_pose(ANGLES[2]);
    let mut broken = inliers(&world, truth);
    broken[0].keypoint = KeyPoint::new(f64::INFINITY, 0.0);
    results[2] =
        LocalizationResult::localized("frame2", truth, intrinsics(), broken, 2.0).unwrap();
    let original = results.clone();

    let error = refine_sequence(&mut results, &poses_only()).unwrap_err();
    match error {
        LocalizeError::RefinementDidNotConverge { termination, .. } => {
            assert!(!termination.was_successful())
        }
        other => panic!("unexpected error {:?}", other),
    }
    assert_eq!(results, original);
}

#[test]
fn nothing_to_refine() {
    let results = vec![LocalizationResult::invalid("a")];
    assert!(matches!(
        compute_refinement(&results, &SequenceSettings::default()),
        Err(LocalizeError::Refinement(_))
    ));
}

#[test]
fn poorly_seen_landmarks_are_dropped() {
    let world = World::new(60, 4, 8);
    let mut results = results(&world, None, 9);
    // Only the first frame sees an extra landmark.
    let mut first_inliers = results[0].inliers().to_vec();
    first_inliers.push(Inlier {
        query: 1000,
        landmark: LandmarkId(1000),
        ..first_inliers[0]
    });
    results[0] = LocalizationResult::localized(
        "frame0",
        results[0].pose().unwrap(),
        intrinsics(),
        first_inliers,
        2.0,
    )
    .unwrap();
    let settings = SequenceSettings {
        min_point_visibility: 2,
        ..poses_only()
    };
    let refinement = compute_refinement(&results, &settings).unwrap();
    assert!(!refinement.points.contains_key(&LandmarkId(1000)));
    assert_eq!(refinement.points.len(), 60);
}

#[test]
fn results_survive_a_round_trip_before_refinement() {
    let world = World::new(40, 4, 10);
    let results = results(&world, Some(1), 11);
    let directory = tempfile::tempdir().unwrap();
    let path = directory.path().join("results.bin");
    save_results(&results, &path).unwrap();
    let mut loaded = load_results(&path).unwrap();
    assert_eq!(loaded, results);
    assert!(refine_sequence(&mut loaded, &poses_only()).is_ok());

    let trajectory_path = directory.path().join("trajectory.json");
    let trajectory = Trajectory::from_results(&loaded);
    trajectory.save(&trajectory_path).unwrap();
    let reloaded = Trajectory::load(&trajectory_path).unwrap();
    assert_eq!(reloaded.len(), trajectory.len());
    assert_eq!(reloaded.jumps(), 1);
}
