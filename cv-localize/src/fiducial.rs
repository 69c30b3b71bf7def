use crate::{Correspondence, CorrespondenceSource, LocalizeError, Map, QueryFrame, ViewId};
use log::*;
use std::cmp::Reverse;
use std::collections::{BTreeMap, BTreeSet};

/// Candidates and correspondences from fiducial markers.
///
/// Every marker id is assumed to be detected at most once per image, so equal ids are the same
/// physical point.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FiducialSource {
    nearest_keyframes: usize,
}

impl FiducialSource {
    pub fn new(nearest_keyframes: usize) -> Self {
        Self { nearest_keyframes }
    }
}

/// The markers of a frame. Markers detected more than once are dropped.
fn unique_markers(frame: &QueryFrame) -> BTreeMap<u32, usize> {
    let mut seen: BTreeMap<u32, Option<usize>> = BTreeMap::new();
    for (ix, marker) in frame
        .features
        .iter()
        .enumerate()
        .filter_map(|(ix, feature)| feature.marker.map(|marker| (ix, marker)))
    {
        seen.entry(marker)
            .and_modify(|existing| *existing = None)
            .or_insert(Some(ix));
    }
    seen.into_iter()
        .filter_map(|(marker, ix)| ix.map(|ix| (marker, ix)))
        .collect()
}

impl CorrespondenceSource for FiducialSource {
    fn is_ready(&self) -> bool {
        self.nearest_keyframes != 0
    }

    /// The views that share the most markers with the frame. `max` is ignored in favor of the
    /// number of nearest keyframes.
    fn candidates(
        &self,
        map: &Map,
        frame: &QueryFrame,
        _: usize,
    ) -> Result<Vec<ViewId>, LocalizeError> {
        let markers = unique_markers(frame);
        if markers.is_empty() {
            debug!("{} has no markers", frame.name);
            return Ok(vec![]);
        }
        let mut shared: Vec<(ViewId, usize)> = map
            .views()
            .filter(|(_, view)| view.pose.is_some())
            .map(|(id, _)| {
                let count = map
                    .reconstructed_features(id)
                    .filter_map(|(feature, _)| feature.marker)
                    .filter(|marker| markers.contains_key(marker))
                    .collect::<BTreeSet<u32>>()
                    .len();
                (id, count)
            })
            .filter(|&(_, count)| count != 0)
            .collect();
        shared.sort_by_key(|&(id, count)| (Reverse(count), id));
        shared.truncate(self.nearest_keyframes);
        Ok(shared.into_iter().map(|(id, _)| id).collect())
    }

    fn correspond(
        &self,
        map: &Map,
        frame: &QueryFrame,
        view: ViewId,
        _: u64,
    ) -> Result<Vec<Correspondence>, LocalizeError> {
        let markers = unique_markers(frame);
        let mut correspondences: BTreeMap<usize, Correspondence> = BTreeMap::new();
        for (feature, landmark) in map.reconstructed_features(view) {
            if let Some(&query) = feature.marker.and_then(|marker| markers.get(&marker)) {
                correspondences.entry(query).or_insert(Correspondence {
                    query,
                    landmark,
                    distance: 0.0,
                });
            }
        }
        Ok(correspondences.into_values().collect())
    }
}
