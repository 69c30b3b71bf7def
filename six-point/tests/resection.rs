use approx::assert_relative_eq;
use cv_core::consensus::{AcRansac, LoRansac, Model, NfaParameters};
use cv_core::nalgebra::{Point2, Point3, Rotation3, Vector2};
use cv_core::{FeatureWorldMatch, KeyPoint, WorldToCamera};
use cv_pinhole::{CameraIntrinsics, CameraIntrinsicsK3Distortion};
use rand::{rngs::SmallRng, Rng, SeedableRng};
use six_point::SixPoint;

fn intrinsics(distortion: [f64; 3]) -> CameraIntrinsicsK3Distortion {
    CameraIntrinsicsK3Distortion::new(
        CameraIntrinsics::identity()
            .focals(Vector2::new(820.0, 800.0))
            .principal_point(Point2::new(330.0, 250.0)),
        distortion,
    )
}

fn pose() -> WorldToCamera {
    WorldToCamera::from_rotation_center(
        Rotation3::from_euler_angles(-0.1, 0.25, 0.05),
        Point3::new(0.4, 0.2, -7.0),
    )
}

fn scene(
    count: usize,
    intrinsics: CameraIntrinsicsK3Distortion,
    seed: u64,
) -> Vec<FeatureWorldMatch<KeyPoint>> {
    let mut rng = SmallRng::seed_from_u64(seed);
    (0..count)
        .map(|_| {
            let point = Point3::new(
                rng.gen_range(-2.0..2.0),
                rng.gen_range(-1.5..1.5),
                rng.gen_range(-1.5..1.5),
            )
            .into();
            FeatureWorldMatch(intrinsics.project(pose(), point).unwrap(), point)
        })
        .collect()
}

#[test]
fn calibrated_with_distortion() {
    let intrinsics = intrinsics([-0.12, 0.03, 0.0]);
    let data = scene(12, intrinsics, 0);
    let resection = SixPoint::calibrated(intrinsics)
        .from_matches(data.iter().copied())
        .unwrap();
    assert_relative_eq!(
        resection.pose.center(),
        pose().center(),
        epsilon = 1e-6
    );
    assert_eq!(resection.intrinsics, intrinsics);
    for m in &data {
        assert!(resection.residual(m) < 1e-6);
    }
}

#[test]
fn uncalibrated_recovers_intrinsics() {
    let intrinsics = intrinsics([0.0; 3]);
    let data = scene(20, intrinsics, 1);
    let resection = SixPoint::uncalibrated()
        .from_matches(data.iter().copied())
        .unwrap();
    let estimated = resection.intrinsics.simple_intrinsics;
    assert_relative_eq!(estimated.focals, intrinsics.simple_intrinsics.focals, epsilon = 1e-4);
    assert_relative_eq!(
        estimated.principal_point,
        intrinsics.simple_intrinsics.principal_point,
        epsilon = 1e-4
    );
    assert_eq!(estimated.skew, 0.0);
    assert_relative_eq!(resection.pose.center(), pose().center(), epsilon = 1e-6);
}

#[test]
fn five_matches_are_not_enough() {
    let intrinsics = intrinsics([0.0; 3]);
    let data = scene(5, intrinsics, 2);
    assert!(SixPoint::calibrated(intrinsics)
        .from_matches(data.iter().copied())
        .is_none());
}

fn with_outliers(mut data: Vec<FeatureWorldMatch<KeyPoint>>) -> Vec<FeatureWorldMatch<KeyPoint>> {
    let mut rng = SmallRng::seed_from_u64(5);
    for m in data.iter_mut().step_by(3) {
        m.0 = KeyPoint::new(rng.gen_range(0.0..660.0), rng.gen_range(0.0..500.0));
    }
    data
}

#[test]
fn robust_resection() {
    let intrinsics = intrinsics([-0.05, 0.0, 0.0]);
    let data = with_outliers(scene(90, intrinsics, 3));
    let estimator = SixPoint::calibrated(intrinsics);

    let ac = AcRansac::new(
        0.0,
        NfaParameters::point_to_point(660.0, 500.0),
        SmallRng::seed_from_u64(0),
    )
    .fit(&estimator, &data)
    .unwrap();
    assert!(ac.inliers.iter().filter(|&&ix| ix % 3 != 0).count() >= 58);
    assert!(ac.threshold < 4.0);
    assert_relative_eq!(ac.model.pose.center(), pose().center(), epsilon = 1e-4);

    let lo = LoRansac::new(4.0, SmallRng::seed_from_u64(0))
        .unwrap()
        .min_inliers(30)
        .fit(&estimator, &data)
        .unwrap();
    assert!(lo.inliers.iter().filter(|&&ix| ix % 3 != 0).count() >= 58);
}
