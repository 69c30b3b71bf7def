use crate::{
    merge_correspondences, Correspondence, Feature, LandmarkId, LocalizationResult, Matcher,
    QueryFrame,
};
use cv_core::WorldToCamera;
use cv_pinhole::CameraIntrinsicsK3Distortion;
use log::*;
use std::collections::VecDeque;

/// The inlier features of a localized frame and the landmarks they observe.
#[derive(Debug, Clone, PartialEq)]
pub struct BufferedFrame {
    pub name: String,
    pub pose: WorldToCamera,
    pub intrinsics: CameraIntrinsicsK3Distortion,
    pub width: u32,
    pub height: u32,
    pub features: Vec<Feature>,
    pub landmarks: Vec<LandmarkId>,
}

impl BufferedFrame {
    /// Keeps the inliers of a valid result. Returns `None` for invalid results.
    pub fn new(frame: &QueryFrame, result: &LocalizationResult) -> Option<Self> {
        let pose = result.pose()?;
        let intrinsics = result.intrinsics()?;
        let (features, landmarks) = result
            .inliers()
            .iter()
            .filter_map(|inlier| {
                frame
                    .features
                    .get(inlier.query)
                    .map(|feature| (feature.clone(), inlier.landmark))
            })
            .unzip();
        Some(Self {
            name: frame.name.clone(),
            pose,
            intrinsics,
            width: frame.width,
            height: frame.height,
            features,
            landmarks,
        })
    }

    pub fn reconstructed_features(&self) -> Vec<(&Feature, LandmarkId)> {
        self.features.iter().zip(self.landmarks.iter().copied()).collect()
    }
}

/// The most recent localized frames, oldest first.
#[derive(Debug, Clone, PartialEq)]
pub struct TemporalBuffer {
    entries: VecDeque<BufferedFrame>,
    capacity: usize,
}

impl TemporalBuffer {
    /// A buffer with a capacity of `0` never holds anything.
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    /// Adds a frame, evicting the oldest one when the buffer is full.
    pub fn push(&mut self, frame: BufferedFrame) {
        if self.capacity == 0 {
            return;
        }
        while self.entries.len() >= self.capacity {
            if let Some(evicted) = self.entries.pop_front() {
                trace!("evicted {} from the temporal buffer", evicted.name);
            }
        }
        self.entries.push_back(frame);
    }

    pub fn iter(&self) -> impl Iterator<Item = &BufferedFrame> + '_ {
        self.entries.iter()
    }

    /// The most recently pushed frame.
    pub fn latest(&self) -> Option<&BufferedFrame> {
        self.entries.back()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    /// Matches a frame against every buffered frame and pools the correspondences.
    pub fn match_frame(&self, matcher: &Matcher, frame: &QueryFrame) -> Vec<Correspondence> {
        let sets = self
            .entries
            .iter()
            .map(|buffered| matcher.match_landmarks(frame, &buffered.reconstructed_features()))
            .collect::<Vec<_>>();
        let merged = merge_correspondences(sets);
        debug!(
            "matched {} against {} buffered frames with {} correspondences",
            frame.name,
            self.entries.len(),
            merged.len()
        );
        merged
    }
}
