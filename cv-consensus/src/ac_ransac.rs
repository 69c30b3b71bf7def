use crate::{estimate_from, ConsensusError, Fit};
use float_ord::FloatOrd;
use log::*;
use rand::seq::index;
use rand::Rng;
use sample_consensus::{Consensus, Estimator, Model};

#[cfg(feature = "serde-serialize")]
use serde::{Deserialize, Serialize};

/// The background model used to compute the number of false alarms.
///
/// `log_alpha0` is the log10 probability that a random datum has a residual of one unit, and
/// the probability for a residual `r` is `alpha0 * r^mult_error`.
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde-serialize", derive(Serialize, Deserialize))]
pub struct NfaParameters {
    pub log_alpha0: f64,
    pub mult_error: f64,
}

impl NfaParameters {
    /// Residuals are distances between two points of a `width` by `height` image.
    pub fn point_to_point(width: f64, height: f64) -> Self {
        Self {
            log_alpha0: (core::f64::consts::PI / (width * height)).log10(),
            mult_error: 2.0,
        }
    }

    /// Residuals are distances between points and lines crossing a `width` by `height` image.
    pub fn point_to_line(width: f64, height: f64) -> Self {
        let diagonal = (width * width + height * height).sqrt();
        Self {
            log_alpha0: (2.0 * diagonal / (width * height)).log10(),
            mult_error: 1.0,
        }
    }
}

/// A contrario RANSAC.
///
/// Each hypothesis is scored by the smallest NFA over all prefixes of its sorted residuals,
/// which simultaneously picks the inlier threshold. A hypothesis is meaningful when its NFA is
/// below `0` (less than one expected false detection). Once a meaningful hypothesis exists, the
/// last tenth of the iterations samples only from its inliers.
#[derive(Debug, Clone)]
pub struct AcRansac<R> {
    max_threshold: f64,
    iterations: usize,
    max_models: usize,
    nfa: NfaParameters,
    rng: R,
}

impl<R> AcRansac<R>
where
    R: Rng,
{
    /// A threshold of `0` leaves the threshold unbounded.
    pub fn new(threshold: f64, nfa: NfaParameters, rng: R) -> Self {
        let max_threshold = if threshold == 0.0 {
            f64::INFINITY
        } else {
            threshold
        };
        Self {
            max_threshold,
            iterations: 1024,
            max_models: 1,
            nfa,
            rng,
        }
    }

    #[must_use]
    pub fn iterations(self, iterations: usize) -> Self {
        Self { iterations, ..self }
    }

    /// The most models one minimal sample can produce, counted as separate tests in the NFA.
    #[must_use]
    pub fn max_models(self, max_models: usize) -> Self {
        Self {
            max_models: max_models.max(1),
            ..self
        }
    }

    pub fn max_threshold(&self) -> f64 {
        self.max_threshold
    }

    /// Finds the prefix of `residuals` with the lowest NFA.
    ///
    /// Returns the NFA and the number of inliers in the prefix.
    fn best_prefix(&self, residuals: &[(f64, usize)], tables: &NfaTables) -> Option<(f64, usize)> {
        let sample_size = tables.sample_size;
        let mut best: Option<(f64, usize)> = None;
        for (ix, &(residual, _)) in residuals.iter().enumerate().skip(sample_size) {
            if !residual.is_finite() || residual > self.max_threshold {
                break;
            }
            let inliers = ix + 1;
            let log_alpha =
                self.nfa.log_alpha0 + self.nfa.mult_error * (residual + f64::EPSILON).log10();
            let nfa = tables.log_e0
                + log_alpha * (inliers - sample_size) as f64
                + tables.log_c_n[inliers]
                + tables.log_c_k[inliers];
            if best.map_or(true, |(best_nfa, _)| nfa < best_nfa) {
                best = Some((nfa, inliers));
            }
        }
        best
    }
}

/// Precomputed log10 binomial coefficients for a fixed data size.
struct NfaTables {
    sample_size: usize,
    log_e0: f64,
    /// `log10(C(n, k))` for `k` in `0..=n`.
    log_c_n: Vec<f64>,
    /// `log10(C(k, s))` for `k` in `0..=n`, zero below `s`.
    log_c_k: Vec<f64>,
}

impl NfaTables {
    fn new(total: usize, sample_size: usize, max_models: usize) -> Self {
        let mut log_c_n = vec![0.0; total + 1];
        for k in 1..=total {
            log_c_n[k] = log_c_n[k - 1] + ((total - k + 1) as f64 / k as f64).log10();
        }
        let mut log_c_k = vec![0.0; total + 1];
        for k in sample_size + 1..=total {
            log_c_k[k] = log_c_k[k - 1] + (k as f64 / (k - sample_size) as f64).log10();
        }
        Self {
            sample_size,
            log_e0: ((max_models * (total - sample_size)) as f64).log10(),
            log_c_n,
            log_c_k,
        }
    }
}

impl<R> AcRansac<R>
where
    R: Rng,
{
    /// Finds the model with the lowest NFA along with its automatically chosen threshold.
    pub fn fit<E, D>(&mut self, estimator: &E, data: &[D]) -> Result<Fit<E::Model>, ConsensusError>
    where
        E: Estimator<D>,
        D: Clone,
    {
        let sample_size = E::MIN_SAMPLES;
        if data.len() < sample_size {
            return Err(ConsensusError::InsufficientCorrespondences {
                found: data.len(),
                needed: sample_size,
            });
        }
        if data.len() == sample_size {
            info!(
                "only found {} correspondences, need more than {} to validate a model",
                data.len(),
                sample_size
            );
            return Err(ConsensusError::EstimationFailed {
                best_inliers: 0,
                needed: sample_size + 1,
            });
        }

        let tables = NfaTables::new(data.len(), sample_size, self.max_models);
        let reserve = self.iterations / 10;
        let mut budget = self.iterations - reserve;
        let mut pool: Vec<usize> = (0..data.len()).collect();
        let mut reserve_used = false;
        let mut best: Option<(f64, Fit<E::Model>)> = None;

        let mut iteration = 0;
        while iteration < budget {
            iteration += 1;
            if pool.len() < sample_size {
                break;
            }
            let sample: Vec<usize> = index::sample(&mut self.rng, pool.len(), sample_size)
                .iter()
                .map(|ix| pool[ix])
                .collect();
            let mut improved = false;
            for model in estimate_from(estimator, data, &sample) {
                let mut residuals: Vec<(f64, usize)> = data
                    .iter()
                    .enumerate()
                    .map(|(ix, datum)| {
                        let residual = model.residual(datum);
                        let residual = if residual.is_nan() {
                            f64::INFINITY
                        } else {
                            residual
                        };
                        (residual, ix)
                    })
                    .collect();
                residuals.sort_unstable_by_key(|&(residual, _)| FloatOrd(residual));
                let (nfa, count) = match self.best_prefix(&residuals, &tables) {
                    Some(found) => found,
                    None => continue,
                };
                if best.as_ref().map_or(true, |(best_nfa, _)| nfa < *best_nfa) {
                    trace!(
                        "iteration {} improved NFA to {} with {} inliers",
                        iteration,
                        nfa,
                        count
                    );
                    improved = true;
                    best = Some((
                        nfa,
                        Fit {
                            model,
                            inliers: residuals[..count].iter().map(|&(_, ix)| ix).collect(),
                            threshold: residuals[count - 1].0,
                        },
                    ));
                }
            }
            if let Some((nfa, fit)) = best.as_ref() {
                if improved && *nfa < 0.0 {
                    pool = fit.inliers.clone();
                    if !reserve_used {
                        reserve_used = true;
                        budget += reserve;
                    }
                }
            }
        }

        match best {
            Some((nfa, fit)) if nfa < 0.0 => {
                debug!(
                    "selected {} of {} inliers with NFA {} and threshold {}",
                    fit.inliers.len(),
                    data.len(),
                    nfa,
                    fit.threshold
                );
                Ok(fit)
            }
            best => {
                let best_inliers = best.map_or(0, |(_, fit)| fit.inliers.len());
                info!(
                    "no meaningful model after {} iterations, best had {} inliers",
                    iteration, best_inliers
                );
                Err(ConsensusError::EstimationFailed {
                    best_inliers,
                    needed: sample_size + 1,
                })
            }
        }
    }
}

impl<E, D, R> Consensus<E, D> for AcRansac<R>
where
    E: Estimator<D>,
    D: Clone,
    R: Rng,
{
    type Inliers = Vec<usize>;

    fn model<I>(&mut self, estimator: &E, data: I) -> Option<E::Model>
    where
        I: Iterator<Item = D> + Clone,
    {
        self.model_inliers(estimator, data).map(|(model, _)| model)
    }

    fn model_inliers<I>(&mut self, estimator: &E, data: I) -> Option<(E::Model, Self::Inliers)>
    where
        I: Iterator<Item = D> + Clone,
    {
        let data: Vec<D> = data.collect();
        self.fit(estimator, &data)
            .ok()
            .map(|fit| (fit.model, fit.inliers))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn binomial_tables() {
        let tables = NfaTables::new(10, 2, 1);
        // C(10, 3) = 120
        assert_relative_eq!(tables.log_c_n[3], 120f64.log10(), epsilon = 1e-12);
        // C(5, 2) = 10
        assert_relative_eq!(tables.log_c_k[5], 10f64.log10(), epsilon = 1e-12);
        assert_eq!(tables.log_c_k[2], 0.0);
        assert_relative_eq!(tables.log_e0, 8f64.log10(), epsilon = 1e-12);
    }

    #[test]
    fn zero_threshold_is_unbounded() {
        use rand::{rngs::SmallRng, SeedableRng};
        let ransac = AcRansac::new(
            0.0,
            NfaParameters::point_to_point(640.0, 480.0),
            SmallRng::seed_from_u64(0),
        );
        assert_eq!(ransac.max_threshold(), f64::INFINITY);
    }
}
