use crate::{Descriptor, Feature, LocalizeError, Signature};
use cv_core::nalgebra::Point3;
use cv_core::WorldToCamera;
use cv_geom::Frustum;
use cv_pinhole::CameraIntrinsicsK3Distortion;
use derive_more::{Display, From, Into};
use log::*;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::File;
use std::io::{BufReader, BufWriter};
use std::path::Path;

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Display, From, Into, Serialize, Deserialize,
)]
pub struct LandmarkId(pub u32);

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Display, From, Into, Serialize, Deserialize,
)]
pub struct ViewId(pub u32);

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Display, From, Into, Serialize, Deserialize,
)]
pub struct IntrinsicId(pub u32);

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Display, From, Into, Serialize, Deserialize,
)]
pub struct PoseId(pub u32);

/// A reconstructed 3d point.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Landmark {
    pub position: Point3<f64>,
    /// Maps every view that observes the landmark to the index of the observing feature.
    pub observations: BTreeMap<ViewId, usize>,
}

/// An image of the map.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct View {
    /// The image this view was described from.
    pub image: String,
    pub width: u32,
    pub height: u32,
    pub intrinsic: IntrinsicId,
    /// Views that could not be resolved during reconstruction have no pose.
    pub pose: Option<PoseId>,
    pub features: Vec<Feature>,
    pub signature: Signature,
}

/// The serialized content of a [`Map`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MapData {
    pub landmarks: BTreeMap<LandmarkId, Landmark>,
    pub views: BTreeMap<ViewId, View>,
    pub intrinsics: BTreeMap<IntrinsicId, CameraIntrinsicsK3Distortion>,
    pub poses: BTreeMap<PoseId, WorldToCamera>,
}

/// The features of a view that observe a landmark.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ReconstructedRegions {
    /// Indices into the features of the view.
    pub features: Vec<usize>,
    /// The landmark observed by each feature.
    pub landmarks: Vec<LandmarkId>,
}

impl ReconstructedRegions {
    pub fn len(&self) -> usize {
        self.features.len()
    }

    pub fn is_empty(&self) -> bool {
        self.features.is_empty()
    }
}

/// A read-only sparse map to localize against.
///
/// Every reference inside the map is checked when it is built, so lookups of ids that come from
/// the map itself always succeed.
#[derive(Debug, Clone, PartialEq)]
pub struct Map {
    data: MapData,
    regions: BTreeMap<ViewId, ReconstructedRegions>,
}

impl Map {
    pub fn new(data: MapData) -> Result<Self, LocalizeError> {
        for (&id, view) in &data.views {
            if !data.intrinsics.contains_key(&view.intrinsic) {
                return Err(LocalizeError::InvalidMap(format!(
                    "view {} uses unknown intrinsic {}",
                    id, view.intrinsic
                )));
            }
            if let Some(pose) = view.pose {
                if !data.poses.contains_key(&pose) {
                    return Err(LocalizeError::InvalidMap(format!(
                        "view {} uses unknown pose {}",
                        id, pose
                    )));
                }
            }
        }

        let mut regions: BTreeMap<ViewId, ReconstructedRegions> = BTreeMap::new();
        for (&landmark, object) in &data.landmarks {
            for (&view, &feature) in &object.observations {
                let features = data
                    .views
                    .get(&view)
                    .map(|view| view.features.len())
                    .ok_or_else(|| {
                        LocalizeError::InvalidMap(format!(
                            "landmark {} is observed by unknown view {}",
                            landmark, view
                        ))
                    })?;
                if feature >= features {
                    return Err(LocalizeError::InvalidMap(format!(
                        "landmark {} is observed by feature {} of view {}, which has {} features",
                        landmark, feature, view, features
                    )));
                }
                let entry = regions.entry(view).or_default();
                entry.features.push(feature);
                entry.landmarks.push(landmark);
            }
        }

        info!(
            "map has {} landmarks, {} views ({} posed) and {} intrinsics",
            data.landmarks.len(),
            data.views.len(),
            data.views.values().filter(|view| view.pose.is_some()).count(),
            data.intrinsics.len()
        );
        Ok(Self { data, regions })
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, LocalizeError> {
        let file = File::open(path)?;
        let data: MapData = bincode::deserialize_from(BufReader::new(file))?;
        Self::new(data)
    }

    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), LocalizeError> {
        let file = File::create(path)?;
        bincode::serialize_into(BufWriter::new(file), &self.data)?;
        Ok(())
    }

    pub fn data(&self) -> &MapData {
        &self.data
    }

    pub fn landmark(&self, id: LandmarkId) -> Option<&Landmark> {
        self.data.landmarks.get(&id)
    }

    pub fn landmarks(&self) -> impl Iterator<Item = (LandmarkId, &Landmark)> + '_ {
        self.data.landmarks.iter().map(|(&id, landmark)| (id, landmark))
    }

    pub fn view(&self, id: ViewId) -> Option<&View> {
        self.data.views.get(&id)
    }

    /// The views in id order.
    pub fn views(&self) -> impl Iterator<Item = (ViewId, &View)> + '_ {
        self.data.views.iter().map(|(&id, view)| (id, view))
    }

    pub fn intrinsic(&self, id: IntrinsicId) -> Option<&CameraIntrinsicsK3Distortion> {
        self.data.intrinsics.get(&id)
    }

    pub fn pose(&self, id: PoseId) -> Option<WorldToCamera> {
        self.data.poses.get(&id).copied()
    }

    pub fn view_pose(&self, id: ViewId) -> Option<WorldToCamera> {
        self.view(id)?.pose.and_then(|pose| self.pose(pose))
    }

    pub fn view_intrinsics(&self, id: ViewId) -> Option<&CameraIntrinsicsK3Distortion> {
        self.intrinsic(self.view(id)?.intrinsic)
    }

    /// The features of a view that observe landmarks, empty for views that observe none.
    pub fn regions(&self, id: ViewId) -> Option<&ReconstructedRegions> {
        self.regions.get(&id)
    }

    /// The descriptor and landmark of every reconstructed feature of a view.
    pub fn reconstructed_features(
        &self,
        id: ViewId,
    ) -> impl Iterator<Item = (&Feature, LandmarkId)> + '_ {
        let view = self.view(id);
        self.regions(id).into_iter().flat_map(move |regions| {
            regions
                .features
                .iter()
                .zip(&regions.landmarks)
                .filter_map(move |(&feature, &landmark)| {
                    view.map(|view| (&view.features[feature], landmark))
                })
        })
    }

    pub fn descriptor(&self, view: ViewId, feature: usize) -> Option<&Descriptor> {
        self.view(view)?
            .features
            .get(feature)
            .map(|feature| &feature.descriptor)
    }

    /// The infinite frustum of a posed view.
    pub fn view_frustum(&self, id: ViewId) -> Option<Frustum> {
        let view = self.view(id)?;
        let pose = self.view_pose(id)?;
        let intrinsics = self.view_intrinsics(id)?;
        Frustum::from_pose(
            view.width as f64,
            view.height as f64,
            &intrinsics.simple_intrinsics.matrix(),
            pose,
        )
        .map_err(|e| debug!("view {} has no frustum: {}", id, e))
        .ok()
    }

    pub fn len(&self) -> usize {
        self.data.views.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.views.is_empty()
    }
}
