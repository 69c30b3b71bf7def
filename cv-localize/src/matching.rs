use crate::{
    Euclidean, Feature, LandmarkId, LocalizeError, LocalizerSettings, Map, QueryFrame, ViewId,
};
use cv_consensus::{FitParameters, RobustEstimator};
use cv_core::{FeatureMatch, KeyPoint};
use eight_point::SevenPoint;
use float_ord::FloatOrd;
use log::*;
use rand::Rng;
use space::{Knn, LinearKnn};
use std::collections::{BTreeMap, HashMap};

/// The smallest number of matches the epipolar check is attempted with.
pub const MIN_ROBUST_MATCHES: usize = 8;

/// A match between a query feature and a candidate feature.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DescriptorMatch {
    pub query: usize,
    pub candidate: usize,
    pub distance: f32,
}

/// A query feature that was matched to a landmark.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Correspondence {
    /// The index of the feature in the query frame.
    pub query: usize,
    pub landmark: LandmarkId,
    pub distance: f32,
}

/// Matches query descriptors with a nearest neighbor distance ratio test.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Matcher {
    /// A match is kept if the nearest distance is below `ratio` times the second nearest.
    pub ratio: f64,
    /// Keep only matches consistent with a fundamental matrix.
    pub robust: bool,
    pub estimator: RobustEstimator,
    /// The epipolar threshold in pixels, already validated for `estimator`.
    pub threshold: f64,
    pub iterations: usize,
    pub confidence: f64,
}

impl Matcher {
    pub fn new(settings: &LocalizerSettings) -> Self {
        Self {
            ratio: settings.distance_ratio,
            robust: settings.robust_matching,
            estimator: settings.matching_estimator,
            threshold: settings.matching_error_max,
            iterations: settings.ransac_iterations,
            confidence: settings.ransac_confidence,
        }
    }

    /// Matches every query feature to its nearest candidate.
    ///
    /// Ambiguous matches are rejected by the ratio test. When several query features pick the
    /// same candidate only the closest one is kept.
    pub fn match_descriptors(
        &self,
        query: &[Feature],
        candidates: &[&Feature],
    ) -> Vec<DescriptorMatch> {
        if candidates.len() < 2 {
            return vec![];
        }
        let ratio = self.ratio as f32;
        let knn = LinearKnn {
            metric: Euclidean,
            iter: candidates.iter().map(|candidate| &candidate.descriptor),
        };
        let mut best_for_candidate: HashMap<usize, DescriptorMatch> = HashMap::new();
        for (query_ix, feature) in query.iter().enumerate() {
            let neighbors = knn.knn(&feature.descriptor, 2);
            let (best, second) = match neighbors.as_slice() {
                [best, second, ..] => (best, second),
                _ => continue,
            };
            let distance = f32::from_bits(best.distance);
            if !(distance < ratio * f32::from_bits(second.distance)) {
                continue;
            }
            let found = DescriptorMatch {
                query: query_ix,
                candidate: best.index,
                distance,
            };
            best_for_candidate
                .entry(found.candidate)
                .and_modify(|existing| {
                    if found.distance < existing.distance {
                        *existing = found;
                    }
                })
                .or_insert(found);
        }
        let mut matches: Vec<DescriptorMatch> = best_for_candidate.into_values().collect();
        matches.sort_by_key(|m| m.query);
        matches
    }

    /// Fits a fundamental matrix to the matched keypoints and returns the indices of the inliers.
    pub fn robust_filter<R: Rng>(
        &self,
        pairs: &[FeatureMatch<KeyPoint>],
        width: f64,
        height: f64,
        rng: &mut R,
    ) -> Result<Vec<usize>, LocalizeError> {
        if pairs.len() < MIN_ROBUST_MATCHES {
            return Err(LocalizeError::InsufficientCorrespondences {
                found: pairs.len(),
                needed: MIN_ROBUST_MATCHES,
            });
        }
        let parameters = FitParameters {
            iterations: self.iterations,
            confidence: self.confidence,
            min_inliers: MIN_ROBUST_MATCHES,
            nfa: cv_consensus::NfaParameters::point_to_line(width, height),
            max_models: SevenPoint::MAX_MODELS,
        };
        let fit = self
            .estimator
            .fit(&SevenPoint::new(), pairs, self.threshold, &parameters, rng)?;
        let mut inliers = fit.inliers;
        inliers.sort_unstable();
        Ok(inliers)
    }

    /// Matches a query frame against the reconstructed features of a map view.
    pub fn match_view<R: Rng>(
        &self,
        frame: &QueryFrame,
        map: &Map,
        view: ViewId,
        rng: &mut R,
    ) -> Result<Vec<Correspondence>, LocalizeError> {
        let (features, landmarks): (Vec<&Feature>, Vec<LandmarkId>) =
            map.reconstructed_features(view).unzip();
        let matches = self.match_descriptors(&frame.features, &features);
        info!("found {} putative matches against view {}", matches.len(), view);
        if !self.robust {
            return Ok(to_correspondences(&matches, &landmarks));
        }

        let pairs: Vec<FeatureMatch<KeyPoint>> = matches
            .iter()
            .map(|m| FeatureMatch(features[m.candidate].keypoint, frame.features[m.query].keypoint))
            .collect();
        let (width, height) = map
            .view(view)
            .map_or((frame.width, frame.height), |v| {
                (v.width.max(frame.width), v.height.max(frame.height))
            });
        let inliers = self.robust_filter(&pairs, width as f64, height as f64, rng)?;
        debug!(
            "{} of {} matches against view {} are epipolar inliers",
            inliers.len(),
            matches.len(),
            view
        );
        let kept: Vec<DescriptorMatch> = inliers.iter().map(|&ix| matches[ix]).collect();
        Ok(to_correspondences(&kept, &landmarks))
    }

    /// Matches a query frame against features with known landmarks without any geometric check.
    pub fn match_landmarks(
        &self,
        frame: &QueryFrame,
        reconstructed: &[(&Feature, LandmarkId)],
    ) -> Vec<Correspondence> {
        let features: Vec<&Feature> = reconstructed.iter().map(|&(feature, _)| feature).collect();
        let landmarks: Vec<LandmarkId> = reconstructed
            .iter()
            .map(|&(_, landmark)| landmark)
            .collect();
        to_correspondences(&self.match_descriptors(&frame.features, &features), &landmarks)
    }
}

fn to_correspondences(
    matches: &[DescriptorMatch],
    landmarks: &[LandmarkId],
) -> Vec<Correspondence> {
    matches
        .iter()
        .map(|m| Correspondence {
            query: m.query,
            landmark: landmarks[m.candidate],
            distance: m.distance,
        })
        .collect()
}

/// Pools correspondence sets into one set usable for resection.
///
/// A query feature matched to different landmarks is dropped. A landmark matched by several
/// query features keeps only the closest one. The result is ordered by query feature.
pub fn merge_correspondences<I>(sets: I) -> Vec<Correspondence>
where
    I: IntoIterator<Item = Vec<Correspondence>>,
{
    let mut by_query: BTreeMap<usize, Option<Correspondence>> = BTreeMap::new();
    for correspondence in sets.into_iter().flatten() {
        by_query
            .entry(correspondence.query)
            .and_modify(|existing| {
                *existing = match *existing {
                    Some(previous) if previous.landmark != correspondence.landmark => None,
                    Some(previous) if correspondence.distance < previous.distance => {
                        Some(correspondence)
                    }
                    unchanged => unchanged,
                }
            })
            .or_insert(Some(correspondence));
    }
    let conflicting = by_query.values().filter(|c| c.is_none()).count();
    if conflicting != 0 {
        debug!("dropped {} query features matched to several landmarks", conflicting);
    }

    let mut by_landmark: BTreeMap<LandmarkId, Correspondence> = BTreeMap::new();
    for correspondence in by_query.into_values().flatten() {
        by_landmark
            .entry(correspondence.landmark)
            .and_modify(|existing| {
                if FloatOrd(correspondence.distance) < FloatOrd(existing.distance) {
                    *existing = correspondence;
                }
            })
            .or_insert(correspondence);
    }
    let mut merged: Vec<Correspondence> = by_landmark.into_values().collect();
    merged.sort_by_key(|c| c.query);
    merged
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Descriptor;
    use rand::SeedableRng;

    fn feature(descriptor: &[f32]) -> Feature {
        Feature::new(KeyPoint::new(0.0, 0.0), Descriptor(descriptor.to_vec()))
    }

    fn matcher() -> Matcher {
        Matcher::new(&LocalizerSettings::default())
    }

    #[test]
    fn ratio_test_rejects_ambiguous_matches() {
        let candidates = [feature(&[0.0, 0.0]), feature(&[10.0, 0.0]), feature(&[5.0, 5.0])];
        let candidates: Vec<&Feature> = candidates.iter().collect();
        let query = [
            // Clearly closest to the first candidate.
            feature(&[0.5, 0.0]),
            // Halfway between the first two candidates.
            feature(&[5.0, 0.0]),
        ];
        let matches = matcher().match_descriptors(&query, &candidates);
        assert_eq!(matches.len(), 1);
        assert_eq!(matches[0].query, 0);
        assert_eq!(matches[0].candidate, 0);
        assert_eq!(matches[0].distance, 0.5);
    }

    #[test]
    fn nearest_candidate_is_found_anywhere_in_the_list() {
        let candidates = [
            feature(&[9.0, 9.0]),
            feature(&[-4.0, 0.0]),
            feature(&[1.0, 1.0]),
            feature(&[20.0, -3.0]),
        ];
        let candidates: Vec<&Feature> = candidates.iter().collect();
        let matches = matcher().match_descriptors(&[feature(&[1.0, 0.0])], &candidates);
        assert_eq!(matches.len(), 1);
        assert_eq!(matches[0].candidate, 2);
        assert_eq!(matches[0].distance, 1.0);
    }

    #[test]
    fn closest_query_wins_a_candidate() {
        let candidates = [feature(&[0.0]), feature(&[100.0])];
        let candidates: Vec<&Feature> = candidates.iter().collect();
        let query = [feature(&[2.0]), feature(&[1.0])];
        let matches = matcher().match_descriptors(&query, &candidates);
        assert_eq!(matches.len(), 1);
        assert_eq!(matches[0].query, 1);
    }

    #[test]
    fn too_few_candidates() {
        let candidates = [feature(&[0.0])];
        let candidates: Vec<&Feature> = candidates.iter().collect();
        assert!(matcher()
            .match_descriptors(&[feature(&[0.0])], &candidates)
            .is_empty());
    }

    #[test]
    fn robust_filter_needs_eight_matches() {
        let pairs = vec![FeatureMatch(KeyPoint::new(0.0, 0.0), KeyPoint::new(1.0, 1.0)); 7];
        let mut rng = rand::rngs::SmallRng::seed_from_u64(0);
        let result = matcher().robust_filter(&pairs, 640.0, 480.0, &mut rng);
        assert!(matches!(
            result,
            Err(LocalizeError::InsufficientCorrespondences { found: 7, needed: 8 })
        ));
    }

    #[test]
    fn merging_drops_conflicts() {
        let c = |query, landmark, distance| Correspondence {
            query,
            landmark: LandmarkId(landmark),
            distance,
        };
        let merged = merge_correspondences(vec![
            vec![c(0, 10, 1.0), c(1, 11, 1.0), c(2, 12, 3.0)],
            vec![c(0, 10, 0.5), c(1, 20, 1.0), c(3, 12, 2.0)],
        ]);
        assert_eq!(merged, vec![c(0, 10, 0.5), c(3, 12, 2.0)]);
    }
}
