use cv_consensus::{
    AcRansac, Consensus, ConsensusError, Estimator, FitParameters, LoRansac, Model,
    NfaParameters, RobustEstimator,
};
use rand::{rngs::SmallRng, Rng, SeedableRng};

/// A line `y = slope * x + intercept`.
#[derive(Debug, Clone, Copy)]
struct Line {
    slope: f64,
    intercept: f64,
}

impl Model<[f64; 2]> for Line {
    fn residual(&self, &[x, y]: &[f64; 2]) -> f64 {
        (self.slope * x + self.intercept - y).abs() / (1.0 + self.slope * self.slope).sqrt()
    }
}

/// Least squares line fit.
struct LineEstimator;

impl Estimator<[f64; 2]> for LineEstimator {
    type Model = Line;
    type ModelIter = Option<Line>;
    const MIN_SAMPLES: usize = 2;

    fn estimate<I>(&self, data: I) -> Self::ModelIter
    where
        I: Iterator<Item = [f64; 2]> + Clone,
    {
        let (n, sx, sy, sxx, sxy) = data.fold((0.0, 0.0, 0.0, 0.0, 0.0), |acc, [x, y]| {
            (acc.0 + 1.0, acc.1 + x, acc.2 + y, acc.3 + x * x, acc.4 + x * y)
        });
        let denominator = n * sxx - sx * sx;
        if denominator.abs() < 1e-12 {
            return None;
        }
        let slope = (n * sxy - sx * sy) / denominator;
        Some(Line {
            slope,
            intercept: (sy - slope * sx) / n,
        })
    }
}

/// 60 points on `y = 2x + 1` with small noise and 40 uniform outliers.
fn line_data() -> Vec<[f64; 2]> {
    let mut rng = SmallRng::seed_from_u64(7);
    let mut data: Vec<[f64; 2]> = (0..60)
        .map(|i| {
            let x = i as f64 * 5.0;
            [x, 2.0 * x + 1.0 + rng.gen_range(-0.1..0.1)]
        })
        .collect();
    data.extend((0..40).map(|_| [rng.gen_range(0.0..300.0), rng.gen_range(0.0..600.0)]));
    data
}

#[test]
fn lo_ransac_finds_line() {
    let data = line_data();
    let fit = LoRansac::new(1.0, SmallRng::seed_from_u64(0))
        .unwrap()
        .min_inliers(30)
        .fit(&LineEstimator, &data)
        .unwrap();
    assert!((fit.model.slope - 2.0).abs() < 0.01);
    assert!(fit.inliers.len() >= 60);
    assert!((0..60).all(|ix| fit.inliers.contains(&ix)));
    assert_eq!(fit.threshold, 1.0);
}

#[test]
fn ac_ransac_finds_line_and_threshold() {
    let data = line_data();
    let fit = AcRansac::new(
        0.0,
        NfaParameters::point_to_line(300.0, 600.0),
        SmallRng::seed_from_u64(0),
    )
    .fit(&LineEstimator, &data)
    .unwrap();
    assert!((fit.model.slope - 2.0).abs() < 0.01);
    assert!(fit.inliers.len() >= 55);
    assert!(fit.threshold < 5.0);
}

#[test]
fn ac_ransac_zero_matches_infinite_threshold() {
    let data = line_data();
    let nfa = NfaParameters::point_to_line(300.0, 600.0);
    let zero = AcRansac::new(0.0, nfa, SmallRng::seed_from_u64(3))
        .fit(&LineEstimator, &data)
        .unwrap();
    let infinite = AcRansac::new(f64::INFINITY, nfa, SmallRng::seed_from_u64(3))
        .fit(&LineEstimator, &data)
        .unwrap();
    assert_eq!(zero.inliers, infinite.inliers);
    assert_eq!(zero.threshold, infinite.threshold);
}

#[test]
fn too_few_correspondences() {
    let result = LoRansac::new(1.0, SmallRng::seed_from_u64(0))
        .unwrap()
        .fit(&LineEstimator, &[[0.0, 1.0]]);
    assert_eq!(
        result.unwrap_err(),
        ConsensusError::InsufficientCorrespondences {
            found: 1,
            needed: 2
        }
    );
}

#[test]
fn lo_ransac_reports_too_few_inliers() {
    let data = line_data();
    let result = LoRansac::new(1.0, SmallRng::seed_from_u64(0))
        .unwrap()
        .min_inliers(90)
        .fit(&LineEstimator, &data);
    assert!(matches!(
        result,
        Err(ConsensusError::EstimationFailed { needed: 90, .. })
    ));
}

#[test]
fn policy_dispatch() {
    let data = line_data();
    let parameters = FitParameters {
        iterations: 512,
        confidence: 0.999,
        min_inliers: 6,
        nfa: NfaParameters::point_to_line(300.0, 600.0),
        max_models: 1,
    };
    let mut rng = SmallRng::seed_from_u64(11);
    for policy in [RobustEstimator::AcRansac, RobustEstimator::LoRansac] {
        let fit = policy
            .fit(&LineEstimator, &data, 1.0, &parameters, &mut rng)
            .unwrap();
        assert!((fit.model.intercept - 1.0).abs() < 0.5);
    }
    assert!(RobustEstimator::LoRansac
        .fit(&LineEstimator, &data, 0.0, &parameters, &mut rng)
        .is_err());
}

#[test]
fn consensus_over_iterators() {
    let data = line_data();
    let mut lo_ransac = LoRansac::new(1.0, SmallRng::seed_from_u64(0))
        .unwrap()
        .min_inliers(30);
    let (model, inliers) = lo_ransac
        .model_inliers(&LineEstimator, data.iter().copied())
        .unwrap();
    assert!((model.slope - 2.0).abs() < 0.01);
    assert!((0..60).all(|ix| inliers.contains(&ix)));

    let mut ac_ransac = AcRansac::new(
        0.0,
        NfaParameters::point_to_line(300.0, 600.0),
        SmallRng::seed_from_u64(0),
    );
    let model = ac_ransac.model(&LineEstimator, data.iter().copied()).unwrap();
    assert!((model.intercept - 1.0).abs() < 0.5);

    let mut strict = LoRansac::new(1.0, SmallRng::seed_from_u64(0))
        .unwrap()
        .min_inliers(90);
    assert!(strict
        .model_inliers(&LineEstimator, data.iter().copied())
        .is_none());
}
