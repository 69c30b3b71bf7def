//! Linear estimation of the fundamental matrix from pixel correspondences.
//!
//! Both solvers condition the pixel coordinates of each image with
//! [`cv_pinhole::isotropic_normalization`], solve the linear epipolar constraint in the
//! normalized space and map the result back to pixels. Returned matrices have rank 2 and a
//! unit Frobenius norm.

use arrayvec::ArrayVec;
use cv_core::{
    consensus::Estimator,
    nalgebra::{Matrix3, SMatrix, SVector, SVD},
    FeatureMatch, KeyPoint,
};
use cv_pinhole::{isotropic_normalization, FundamentalMatrix};
use float_ord::FloatOrd;

type Normal9 = SMatrix<f64, 9, 9>;

/// A fundamental matrix problem in normalized coordinates.
struct Normalized {
    /// `transpose(A) * A` for the stacked epipolar constraints.
    normal: Normal9,
    /// Normalization of the first image.
    first: Matrix3<f64>,
    /// Normalization of the second image.
    second: Matrix3<f64>,
}

impl Normalized {
    fn new<I>(data: I) -> Option<Self>
    where
        I: Iterator<Item = FeatureMatch<KeyPoint>> + Clone,
    {
        let first = isotropic_normalization(data.clone().map(|FeatureMatch(a, _)| a.0))?;
        let second = isotropic_normalization(data.clone().map(|FeatureMatch(_, b)| b.0))?;
        let mut normal = Normal9::zeros();
        for FeatureMatch(a, b) in data {
            let a = first * a.to_homogeneous();
            let b = second * b.to_homogeneous();
            // Row-major coefficients of `transpose(b) * F * a`.
            let row = SVector::<f64, 9>::from_iterator(
                (0..3).flat_map(|i| (0..3).map(move |j| b[i] * a[j])),
            );
            normal += row * row.transpose();
        }
        Some(Self {
            normal,
            first,
            second,
        })
    }

    /// The eigenvectors of the `count` smallest eigenvalues, as row-major matrices.
    fn null_space(&self, count: usize, epsilon: f64, iterations: usize) -> Option<Vec<Matrix3<f64>>> {
        let eigens = self.normal.try_symmetric_eigen(epsilon, iterations)?;
        let mut order: Vec<usize> = (0..9).collect();
        order.sort_unstable_by_key(|&ix| FloatOrd(eigens.eigenvalues[ix]));
        Some(
            order[..count]
                .iter()
                .map(|&ix| {
                    Matrix3::from_iterator(eigens.eigenvectors.column(ix).iter().copied())
                        .transpose()
                })
                .collect(),
        )
    }

    /// Maps a normalized fundamental matrix back to pixel coordinates.
    fn denormalize(&self, fundamental: Matrix3<f64>) -> Option<FundamentalMatrix> {
        let fundamental = self.second.transpose() * fundamental * self.first;
        if fundamental.iter().all(|v| v.is_finite()) {
            FundamentalMatrix(fundamental).normalized()
        } else {
            None
        }
    }
}

/// Forces the smallest singular value to zero.
fn enforce_rank_two(matrix: Matrix3<f64>, epsilon: f64, iterations: usize) -> Option<Matrix3<f64>> {
    let mut svd = SVD::try_new(matrix, true, true, epsilon, iterations)?;
    let (smallest, _) = svd
        .singular_values
        .iter()
        .enumerate()
        .min_by_key(|&(_, &value)| FloatOrd(value))?;
    svd.singular_values[smallest] = 0.0;
    svd.recompose().ok()
}

/// Performs the normalized
/// [eight-point algorithm](https://en.wikipedia.org/wiki/Eight-point_algorithm)
/// by Richard Hartley.
///
/// More than eight matches are solved in the least squares sense.
#[derive(Copy, Clone, Debug)]
pub struct EightPoint {
    pub epsilon: f64,
    pub iterations: usize,
}

impl EightPoint {
    pub fn new() -> Self {
        Default::default()
    }

    pub fn from_matches<I>(&self, data: I) -> Option<FundamentalMatrix>
    where
        I: Iterator<Item = FeatureMatch<KeyPoint>> + Clone,
    {
        if data.clone().count() < 8 {
            return None;
        }
        let problem = Normalized::new(data)?;
        let solution = problem
            .null_space(1, self.epsilon, self.iterations)?
            .pop()?;
        let solution = enforce_rank_two(solution, self.epsilon, self.iterations)?;
        problem.denormalize(solution)
    }
}

impl Default for EightPoint {
    fn default() -> Self {
        Self {
            epsilon: 1e-12,
            iterations: 1000,
        }
    }
}

impl Estimator<FeatureMatch<KeyPoint>> for EightPoint {
    type Model = FundamentalMatrix;
    type ModelIter = Option<FundamentalMatrix>;
    const MIN_SAMPLES: usize = 8;

    fn estimate<I>(&self, data: I) -> Self::ModelIter
    where
        I: Iterator<Item = FeatureMatch<KeyPoint>> + Clone,
    {
        self.from_matches(data)
    }
}

/// The seven-point algorithm.
///
/// Seven matches leave a two dimensional family of solutions `a * F1 + (1 - a) * F2`. The
/// singularity constraint `det(F) = 0` is a cubic in `a`, so up to three matrices are
/// returned. When the cubic vanishes identically every member of the family is singular and
/// both `F1` and `F2` are returned.
#[derive(Copy, Clone, Debug)]
pub struct SevenPoint {
    pub epsilon: f64,
    pub iterations: usize,
}

impl SevenPoint {
    /// The most fundamental matrices one sample of seven matches can produce.
    pub const MAX_MODELS: usize = 3;

    pub fn new() -> Self {
        Default::default()
    }

    pub fn from_matches<I>(&self, data: I) -> ArrayVec<FundamentalMatrix, 3>
    where
        I: Iterator<Item = FeatureMatch<KeyPoint>> + Clone,
    {
        let mut models = ArrayVec::new();
        if data.clone().count() < 7 {
            return models;
        }
        let problem = match Normalized::new(data) {
            Some(problem) => problem,
            None => return models,
        };
        let (f1, f2) = match problem.null_space(2, self.epsilon, self.iterations) {
            Some(basis) => (basis[0], basis[1]),
            None => return models,
        };

        let det = |a: f64| (f1 * a + f2 * (1.0 - a)).determinant();
        let coefficients = cubic_through(det(0.0), det(1.0), det(-1.0), det(2.0));
        let scale = coefficients.iter().map(|c| c.abs()).fold(0.0, f64::max);
        if scale < 1e-10 {
            models.extend([f1, f2].iter().filter_map(|&f| problem.denormalize(f)));
            return models;
        }
        for root in real_cubic_roots(coefficients) {
            if let Some(model) = problem.denormalize(f1 * root + f2 * (1.0 - root)) {
                models.push(model);
            }
        }
        models
    }
}

impl Default for SevenPoint {
    fn default() -> Self {
        Self {
            epsilon: 1e-12,
            iterations: 1000,
        }
    }
}

impl Estimator<FeatureMatch<KeyPoint>> for SevenPoint {
    type Model = FundamentalMatrix;
    type ModelIter = ArrayVec<FundamentalMatrix, 3>;
    const MIN_SAMPLES: usize = 7;

    fn estimate<I>(&self, data: I) -> Self::ModelIter
    where
        I: Iterator<Item = FeatureMatch<KeyPoint>> + Clone,
    {
        self.from_matches(data)
    }
}

/// Coefficients `[a, b, c, d]` of the cubic `a x^3 + b x^2 + c x + d` through its values at
/// `0`, `1`, `-1` and `2`.
fn cubic_through(at_zero: f64, at_one: f64, at_minus_one: f64, at_two: f64) -> [f64; 4] {
    let d = at_zero;
    let b = 0.5 * (at_one + at_minus_one) - d;
    let odd = 0.5 * (at_one - at_minus_one);
    let a = (at_two - 4.0 * b - d - 2.0 * odd) / 6.0;
    let c = odd - a;
    [a, b, c, d]
}

/// The real roots of `a x^3 + b x^2 + c x + d`, falling back to lower degrees when the
/// leading coefficients vanish.
fn real_cubic_roots([a, b, c, d]: [f64; 4]) -> ArrayVec<f64, 3> {
    let mut roots = ArrayVec::new();
    let scale = b.abs().max(c.abs()).max(d.abs());
    if a.abs() <= 1e-12 * scale {
        if b.abs() <= 1e-12 * c.abs().max(d.abs()) {
            if c != 0.0 {
                roots.push(-d / c);
            }
            return roots;
        }
        let discriminant = c * c - 4.0 * b * d;
        if discriminant >= 0.0 {
            let sqrt = discriminant.sqrt();
            roots.push((-c + sqrt) / (2.0 * b));
            roots.push((-c - sqrt) / (2.0 * b));
        }
        return roots;
    }

    let (b, c, d) = (b / a, c / a, d / a);
    let shift = b / 3.0;
    // Depressed cubic t^3 + p t + q with x = t - b / 3.
    let p = c - b * b / 3.0;
    let q = 2.0 * b * b * b / 27.0 - b * c / 3.0 + d;
    let discriminant = (q * q) / 4.0 + (p * p * p) / 27.0;
    if discriminant > 0.0 {
        let sqrt = discriminant.sqrt();
        roots.push((-q / 2.0 + sqrt).cbrt() + (-q / 2.0 - sqrt).cbrt() - shift);
    } else if p == 0.0 {
        roots.push(-shift);
    } else {
        let radius = 2.0 * (-p / 3.0).sqrt();
        let cos = ((3.0 * q) / (2.0 * p) * (-3.0 / p).sqrt()).clamp(-1.0, 1.0);
        let phi = cos.acos() / 3.0;
        for k in 0..3 {
            let angle = phi - 2.0 * core::f64::consts::PI * k as f64 / 3.0;
            roots.push(radius * angle.cos() - shift);
        }
    }
    roots
}
