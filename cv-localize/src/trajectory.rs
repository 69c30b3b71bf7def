use crate::{LocalizationResult, LocalizeError, Map};
use cv_core::WorldToCamera;
use cv_pinhole::CameraIntrinsicsK3Distortion;
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::{BufReader, BufWriter};
use std::path::Path;

/// One frame of a camera track.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Keyframe {
    Camera {
        frame: String,
        pose: WorldToCamera,
        intrinsics: CameraIntrinsicsK3Distortion,
    },
    /// A frame without a pose. The camera jumps over it instead of interpolating.
    Jump { frame: String },
}

impl Keyframe {
    pub fn frame(&self) -> &str {
        match self {
            Self::Camera { frame, .. } | Self::Jump { frame } => frame,
        }
    }

    pub fn is_jump(&self) -> bool {
        matches!(self, Self::Jump { .. })
    }
}

/// An ordered camera track, written as JSON for scene exchange tools.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Trajectory {
    pub keyframes: Vec<Keyframe>,
}

impl Trajectory {
    /// One keyframe per result, in order. Invalid results become jumps.
    pub fn from_results(results: &[LocalizationResult]) -> Self {
        let keyframes = results
            .iter()
            .map(|result| match (result.pose(), result.intrinsics()) {
                (Some(pose), Some(intrinsics)) => Keyframe::Camera {
                    frame: result.frame().to_string(),
                    pose,
                    intrinsics,
                },
                _ => Keyframe::Jump {
                    frame: result.frame().to_string(),
                },
            })
            .collect();
        Self { keyframes }
    }

    /// One keyframe per map view in id order. Views without a pose become jumps.
    pub fn from_map_views(map: &Map) -> Self {
        let keyframes = map
            .views()
            .map(|(id, view)| match (map.view_pose(id), map.view_intrinsics(id)) {
                (Some(pose), Some(&intrinsics)) => Keyframe::Camera {
                    frame: view.image.clone(),
                    pose,
                    intrinsics,
                },
                _ => Keyframe::Jump {
                    frame: view.image.clone(),
                },
            })
            .collect();
        Self { keyframes }
    }

    pub fn len(&self) -> usize {
        self.keyframes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keyframes.is_empty()
    }

    pub fn jumps(&self) -> usize {
        self.keyframes.iter().filter(|keyframe| keyframe.is_jump()).count()
    }

    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), LocalizeError> {
        let file = File::create(path)?;
        serde_json::to_writer_pretty(BufWriter::new(file), self)?;
        Ok(())
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, LocalizeError> {
        let file = File::open(path)?;
        Ok(serde_json::from_reader(BufReader::new(file))?)
    }
}
