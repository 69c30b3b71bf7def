use crate::{
    estimate_from, inliers_within, ConsensusError, Fit, RobustEstimator, LO_RANSAC_MIN_THRESHOLD,
};
use log::*;
use rand::seq::index;
use rand::Rng;
use sample_consensus::{Consensus, Estimator};

/// RANSAC with a fixed inlier threshold and local optimization.
///
/// Every time a hypothesis beats the current best, it is re-estimated from all of its inliers
/// until the inlier set stops growing. The number of iterations adapts to the best inlier
/// ratio seen so far.
#[derive(Debug, Clone)]
pub struct LoRansac<R> {
    threshold: f64,
    max_iterations: usize,
    confidence: f64,
    min_inliers: usize,
    local_iterations: usize,
    rng: R,
}

impl<R> LoRansac<R>
where
    R: Rng,
{
    /// Fails with [`ConsensusError::Configuration`] when the threshold is not strictly above
    /// [`LO_RANSAC_MIN_THRESHOLD`].
    pub fn new(threshold: f64, rng: R) -> Result<Self, ConsensusError> {
        if threshold.is_nan() || threshold <= LO_RANSAC_MIN_THRESHOLD {
            return Err(ConsensusError::Configuration {
                policy: RobustEstimator::LoRansac,
                threshold,
            });
        }
        Ok(Self {
            threshold,
            max_iterations: 1024,
            confidence: 0.999,
            min_inliers: 0,
            local_iterations: 10,
            rng,
        })
    }

    #[must_use]
    pub fn max_iterations(self, max_iterations: usize) -> Self {
        Self {
            max_iterations,
            ..self
        }
    }

    #[must_use]
    pub fn confidence(self, confidence: f64) -> Self {
        Self { confidence, ..self }
    }

    /// Fits with fewer inliers than this (or fewer than the minimal sample) are failures.
    #[must_use]
    pub fn min_inliers(self, min_inliers: usize) -> Self {
        Self {
            min_inliers,
            ..self
        }
    }

    #[must_use]
    pub fn local_iterations(self, local_iterations: usize) -> Self {
        Self {
            local_iterations,
            ..self
        }
    }

    pub fn threshold(&self) -> f64 {
        self.threshold
    }

    /// Re-estimates the model from its inliers while that keeps finding more of them.
    fn local_optimization<E, D>(
        &self,
        estimator: &E,
        data: &[D],
        mut model: E::Model,
        mut inliers: Vec<usize>,
    ) -> (E::Model, Vec<usize>)
    where
        E: Estimator<D>,
        D: Clone,
    {
        for _ in 0..self.local_iterations {
            if inliers.len() <= E::MIN_SAMPLES {
                break;
            }
            let refit = estimate_from(estimator, data, &inliers)
                .into_iter()
                .map(|candidate| {
                    let candidate_inliers = inliers_within(&candidate, data, self.threshold);
                    (candidate, candidate_inliers)
                })
                .max_by_key(|(_, candidate_inliers)| candidate_inliers.len());
            match refit {
                Some((candidate, candidate_inliers)) if candidate_inliers.len() >= inliers.len() => {
                    let grew = candidate_inliers.len() > inliers.len();
                    model = candidate;
                    inliers = candidate_inliers;
                    if !grew {
                        break;
                    }
                }
                _ => break,
            }
        }
        (model, inliers)
    }
}

/// The number of iterations needed to draw one all-inlier sample with the given confidence.
fn required_iterations(inliers: usize, total: usize, sample: usize, confidence: f64) -> usize {
    let inlier_ratio = inliers as f64 / total as f64;
    let all_inliers = inlier_ratio.powi(sample as i32);
    if all_inliers >= 1.0 {
        return 1;
    }
    if all_inliers <= 0.0 {
        return usize::MAX;
    }
    let iterations = (1.0 - confidence).ln() / (1.0 - all_inliers).ln();
    if iterations.is_finite() {
        iterations.ceil().max(1.0) as usize
    } else {
        usize::MAX
    }
}

impl<R> LoRansac<R>
where
    R: Rng,
{
    /// Finds the model with the most inliers within the threshold.
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
        let needed = self.min_inliers.max(sample_size);

        let mut best: Option<Fit<E::Model>> = None;
        let mut required = self.max_iterations;
        let mut iteration = 0;
        while iteration < required {
            iteration += 1;
            let sample = index::sample(&mut self.rng, data.len(), sample_size).into_vec();
            for model in estimate_from(estimator, data, &sample) {
                let inliers = inliers_within(&model, data, self.threshold);
                let best_count = best.as_ref().map_or(0, |fit| fit.inliers.len());
                if inliers.len() < sample_size || inliers.len() <= best_count {
                    continue;
                }
                let (model, inliers) = self.local_optimization(estimator, data, model, inliers);
                debug!(
                    "iteration {} found a hypothesis with {} of {} inliers",
                    iteration,
                    inliers.len(),
                    data.len()
                );
                required = required_iterations(
                    inliers.len(),
                    data.len(),
                    sample_size,
                    self.confidence,
                )
                .min(self.max_iterations);
                best = Some(Fit {
                    model,
                    inliers,
                    threshold: self.threshold,
                });
            }
        }

        match best {
            Some(fit) if fit.inliers.len() >= needed => Ok(fit),
            best => {
                let best_inliers = best.map_or(0, |fit| fit.inliers.len());
                info!(
                    "only found {} inliers after {} iterations, need {}",
                    best_inliers, iteration, needed
                );
                Err(ConsensusError::EstimationFailed {
                    best_inliers,
                    needed,
                })
            }
        }
    }
}

impl<E, D, R> Consensus<E, D> for LoRansac<R>
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
