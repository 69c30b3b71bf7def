mod common;

use approx::assert_relative_eq;
use common::{ring_pose, World};
use cv_consensus::RobustEstimator;
use cv_localize::{
    Algorithm, CandidateRetrieval, ExhaustiveRetrieval, FrameState, LocalizationStats,
    LocalizeError, Localizer, LocalizerKind, LocalizerSettings, LocalizerType, Matcher,
    RetrievalSource, Session, Signature, Tracker,
};
use std::sync::Arc;

/// Fixed inlier band and no epipolar check, so every stage is deterministic.
fn fixed_settings() -> LocalizerSettings {
    LocalizerSettings {
        resection_estimator: RobustEstimator::LoRansac,
        resection_error_max: 2.0,
        robust_matching: false,
        ..LocalizerSettings::default()
    }
}

fn tracker(world: &World, settings: LocalizerSettings) -> Tracker<RetrievalSource> {
    let map = Arc::new(world.map.clone());
    let retrieval = ExhaustiveRetrieval::from_map(&map);
    let source = RetrievalSource::new(Box::new(retrieval), Matcher::new(&settings));
    Tracker::new(map, source, settings, 7).unwrap()
}

#[test]
fn first_frame_localizes_through_retrieval() {
    let mut world = World::new(150, 8, 0);
    let mut tracker = tracker(&world, fixed_settings());
    let truth = ring_pose(0.3);
    let frame = world.frame("f0", truth, |_| true, 30);

    let report = tracker.localize(&frame);
    assert!(report.failure.is_none(), "{:?}", report.failure);
    assert!(!report.used_buffer);
    assert_eq!(
        report.states,
        [
            FrameState::Idle,
            FrameState::Retrieved,
            FrameState::Matched,
            FrameState::PoseValid
        ]
    );
    let result = &report.result;
    assert!(result.is_valid());
    assert!(result.inliers().len() >= 6);
    assert_relative_eq!(
        result.pose().unwrap().center(),
        truth.center(),
        epsilon = 1e-5
    );
    assert_eq!(tracker.buffer().len(), 1);
}

#[test]
fn next_frame_localizes_against_the_buffer() {
    let mut world = World::new(150, 8, 1);
    let mut tracker = tracker(&world, fixed_settings());
    let first = world.frame("f0", ring_pose(0.3), |_| true, 10);
    assert!(tracker.localize(&first).result.is_valid());

    let truth = ring_pose(0.32);
    let second = world.frame("f1", truth, |_| true, 10);
    let report = tracker.localize(&second);
    assert!(report.used_buffer);
    assert_eq!(report.state(), FrameState::PoseValid);
    assert_relative_eq!(
        report.result.pose().unwrap().center(),
        truth.center(),
        epsilon = 1e-5
    );
    assert_eq!(tracker.buffer().len(), 2);
}

#[test]
fn buffer_without_overlap_falls_back_to_retrieval() {
    let mut world = World::new(200, 8, 2);
    let mut tracker = tracker(&world, fixed_settings());
    let first = world.frame("f0", ring_pose(0.3), |landmark| landmark < 100, 0);
    assert!(tracker.localize(&first).result.is_valid());

    let second = world.frame("f1", ring_pose(0.35), |landmark| landmark >= 100, 0);
    let report = tracker.localize(&second);
    assert!(report.result.is_valid());
    assert!(!report.used_buffer);
    assert!(report
        .result
        .inliers()
        .iter()
        .all(|inlier| inlier.landmark.0 >= 100));
}

#[test]
fn invalid_frames_leave_the_buffer_alone() {
    let mut world = World::new(150, 8, 3);
    let mut tracker = tracker(&world, fixed_settings());
    let first = world.frame("f0", ring_pose(0.3), |_| true, 0);
    assert!(tracker.localize(&first).result.is_valid());
    let before = tracker.buffer().clone();

    let clutter = world.clutter_frame("noise", 50);
    let report = tracker.localize(&clutter);
    assert_eq!(report.state(), FrameState::PoseInvalid);
    assert!(!report.result.is_valid());
    assert!(report.result.inliers().is_empty());
    assert!(report.failure.is_some());
    assert_eq!(tracker.buffer(), &before);
}

#[test]
fn unavailable_retrieval_only_fails_the_frame() {
    let mut world = World::new(150, 8, 4);
    let mut tracker = tracker(&world, fixed_settings());
    let mut blind = world.frame("blind", ring_pose(0.3), |_| true, 0);
    blind.signature = Signature::default();

    let report = tracker.localize(&blind);
    assert!(matches!(
        report.failure,
        Some(LocalizeError::RetrievalUnavailable(_))
    ));
    assert_eq!(report.states, [FrameState::Idle, FrameState::PoseInvalid]);

    let next = world.frame("next", ring_pose(0.31), |_| true, 0);
    assert!(tracker.localize(&next).result.is_valid());
}

#[test]
fn first_best_stops_at_a_valid_candidate() {
    let mut world = World::new(150, 8, 5);
    let settings = LocalizerSettings {
        algorithm: Algorithm::FirstBest,
        ..fixed_settings()
    };
    let mut tracker = tracker(&world, settings);
    let truth = ring_pose(1.0);
    let report = tracker.localize(&world.frame("f0", truth, |_| true, 20));
    assert!(report.result.is_valid());
    assert_relative_eq!(
        report.result.pose().unwrap().center(),
        truth.center(),
        epsilon = 1e-5
    );
}

#[test]
fn uncalibrated_frames_recover_intrinsics() {
    let mut world = World::new(150, 8, 6);
    let mut tracker = tracker(&world, fixed_settings());
    let truth = ring_pose(0.5);
    let mut frame = world.frame("f0", truth, |_| true, 0);
    frame.intrinsics = None;

    let report = tracker.localize(&frame);
    let result = report.result;
    assert!(result.is_valid(), "{:?}", report.failure);
    let intrinsics = result.intrinsics().unwrap();
    assert_relative_eq!(intrinsics.simple_intrinsics.focals.x, 800.0, max_relative = 1e-4);
    assert_relative_eq!(intrinsics.simple_intrinsics.focals.y, 800.0, max_relative = 1e-4);
    assert_eq!(intrinsics.distortion(), [0.0; 3]);
    assert_relative_eq!(
        result.pose().unwrap().center(),
        truth.center(),
        epsilon = 1e-4
    );
}

#[test]
fn a_contrario_defaults_with_robust_matching() {
    let mut world = World::new(150, 8, 7);
    let mut localizer = LocalizerKind::initialize(
        LocalizerType::Retrieval,
        Arc::new(world.map.clone()),
        LocalizerSettings::default(),
        11,
    )
    .unwrap();
    assert!(localizer.is_ready());
    let truth = ring_pose(0.2);
    let report = localizer.localize(&world.frame("f0", truth, |_| true, 30));
    assert!(report.result.is_valid(), "{:?}", report.failure);
    assert_relative_eq!(
        report.result.pose().unwrap().center(),
        truth.center(),
        epsilon = 1e-4
    );
}

#[test]
fn sessions_count_every_frame() {
    let mut world = World::new(150, 8, 8);
    let tracker = tracker(&world, fixed_settings());
    let mut blind = world.clutter_frame("b", 20);
    blind.signature = Signature::default();
    let frames = vec![
        Ok(world.frame("a", ring_pose(0.3), |_| true, 0)),
        Ok(blind),
        Ok(world.clutter_frame("c", 40)),
        Ok(world.frame("d", ring_pose(0.35), |_| true, 0)),
    ];

    let mut session = Session::new(tracker);
    let report = session.run(frames).unwrap();
    assert_eq!(report.results.len(), 4);
    assert_eq!(report.localized(), 2);
    let valid: Vec<bool> = report.results.iter().map(|r| r.is_valid()).collect();
    assert_eq!(valid, [true, false, false, true]);
    assert_eq!(report.stats.count(), 4);
    assert!(report.to_string().starts_with("Localized 2/4 images"));
    assert!(report.to_string().contains("a : "));
}

#[test]
fn unreadable_frames_end_the_run() {
    let mut world = World::new(100, 4, 9);
    let mut session = Session::new(tracker(&world, fixed_settings()));
    let frames = vec![
        Ok(world.frame("a", ring_pose(0.3), |_| true, 0)),
        Err(LocalizeError::Io(std::io::Error::new(
            std::io::ErrorKind::NotFound,
            "missing frame",
        ))),
    ];
    let error = session.run(frames).unwrap_err();
    assert!(error.is_fatal());
}

#[test]
fn session_writes_the_result_log() {
    let mut world = World::new(100, 4, 10);
    let directory = tempfile::tempdir().unwrap();
    let path = directory.path().join("results.bin");
    let log = cv_localize::ResultLogWriter::create(&path).unwrap();
    let mut session = Session::new(tracker(&world, fixed_settings())).with_log(log);
    let mut stats = LocalizationStats::default();
    let report = session
        .localize_frame(&world.frame("a", ring_pose(0.3), |_| true, 0), &mut stats)
        .unwrap();
    assert!(report.result.is_valid());
    let run = session.run(vec![Ok(world.clutter_frame("b", 10))]).unwrap();
    assert_eq!(run.results.len(), 1);

    let logged = cv_localize::load_results(&path).unwrap();
    assert_eq!(logged.len(), 2);
    assert_eq!(logged[0], report.result);
    assert!(!logged[1].is_valid());
}

#[test]
fn retrieval_is_ranked_and_bounded() {
    let world = World::new(50, 6, 11);
    let retrieval = ExhaustiveRetrieval::from_map(&world.map);
    assert_eq!(retrieval.len(), 6);
    let candidates = retrieval
        .retrieve(&Signature::from_words(0..50), 4)
        .unwrap();
    assert_eq!(candidates.len(), 4);
}
