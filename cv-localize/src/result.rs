use crate::{LandmarkId, LocalizeError, MIN_RESECTION_INLIERS};
use cv_core::nalgebra::Point3;
use cv_core::{FeatureWorldMatch, KeyPoint, WorldToCamera};
use cv_pinhole::CameraIntrinsicsK3Distortion;
use log::*;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs::File;
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::Path;

/// A query feature that agrees with the estimated pose.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Inlier {
    /// The index of the feature in the query frame.
    pub query: usize,
    pub keypoint: KeyPoint,
    pub landmark: LandmarkId,
    pub point: Point3<f64>,
}

impl Inlier {
    pub fn world_match(&self) -> FeatureWorldMatch<KeyPoint> {
        FeatureWorldMatch(self.keypoint, self.point.into())
    }
}

/// The outcome of localizing one frame.
///
/// A valid result always has a pose, intrinsics and at least [`MIN_RESECTION_INLIERS`] inliers.
/// An invalid result has none of them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LocalizationResult {
    frame: String,
    pose: Option<WorldToCamera>,
    intrinsics: Option<CameraIntrinsicsK3Distortion>,
    inliers: Vec<Inlier>,
    error_max: f64,
}

impl LocalizationResult {
    /// A valid result. Fails if there are too few inliers to determine a pose.
    pub fn localized(
        frame: impl Into<String>,
        pose: WorldToCamera,
        intrinsics: CameraIntrinsicsK3Distortion,
        inliers: Vec<Inlier>,
        error_max: f64,
    ) -> Result<Self, LocalizeError> {
        if inliers.len() < MIN_RESECTION_INLIERS {
            return Err(LocalizeError::InsufficientCorrespondences {
                found: inliers.len(),
                needed: MIN_RESECTION_INLIERS,
            });
        }
        Ok(Self {
            frame: frame.into(),
            pose: Some(pose),
            intrinsics: Some(intrinsics),
            inliers,
            error_max,
        })
    }

    pub fn invalid(frame: impl Into<String>) -> Self {
        Self {
            frame: frame.into(),
            pose: None,
            intrinsics: None,
            inliers: vec![],
            error_max: f64::INFINITY,
        }
    }

    pub fn is_valid(&self) -> bool {
        self.pose.is_some()
    }

    pub fn frame(&self) -> &str {
        &self.frame
    }

    pub fn pose(&self) -> Option<WorldToCamera> {
        self.pose
    }

    pub fn intrinsics(&self) -> Option<CameraIntrinsicsK3Distortion> {
        self.intrinsics
    }

    pub fn inliers(&self) -> &[Inlier] {
        &self.inliers
    }

    /// The inlier threshold in pixels the pose was accepted with.
    pub fn error_max(&self) -> f64 {
        self.error_max
    }

    /// Replaces the camera and landmark positions of a valid result with refined ones.
    pub(crate) fn apply_refinement(
        &mut self,
        pose: WorldToCamera,
        intrinsics: CameraIntrinsicsK3Distortion,
        points: &HashMap<LandmarkId, Point3<f64>>,
    ) {
        if !self.is_valid() {
            return;
        }
        self.pose = Some(pose);
        self.intrinsics = Some(intrinsics);
        for inlier in &mut self.inliers {
            if let Some(&point) = points.get(&inlier.landmark) {
                inlier.point = point;
            }
        }
    }

    fn check(self) -> Result<Self, LocalizeError> {
        match (self.pose, self.intrinsics) {
            (Some(pose), Some(intrinsics)) => {
                Self::localized(self.frame, pose, intrinsics, self.inliers, self.error_max)
            }
            (None, None) if self.inliers.is_empty() => Ok(self),
            _ => Err(LocalizeError::InvalidResult(self.frame)),
        }
    }
}

/// Appends results to a log one record at a time.
///
/// Every record is a little endian `u64` length followed by the bincode encoded result.
pub struct ResultLogWriter {
    writer: BufWriter<File>,
    records: usize,
}

impl ResultLogWriter {
    pub fn create(path: impl AsRef<Path>) -> Result<Self, LocalizeError> {
        let file = File::create(path)?;
        Ok(Self {
            writer: BufWriter::new(file),
            records: 0,
        })
    }

    pub fn append(&mut self, result: &LocalizationResult) -> Result<(), LocalizeError> {
        let record = bincode::serialize(result)?;
        self.writer.write_all(&(record.len() as u64).to_le_bytes())?;
        self.writer.write_all(&record)?;
        self.records += 1;
        Ok(())
    }

    pub fn records(&self) -> usize {
        self.records
    }

    /// Flushes the log.
    pub fn finish(mut self) -> Result<usize, LocalizeError> {
        self.writer.flush()?;
        Ok(self.records)
    }
}

pub fn save_results(
    results: &[LocalizationResult],
    path: impl AsRef<Path>,
) -> Result<(), LocalizeError> {
    let mut writer = ResultLogWriter::create(path.as_ref())?;
    for result in results {
        writer.append(result)?;
    }
    let records = writer.finish()?;
    info!("saved {} results to {}", records, path.as_ref().display());
    Ok(())
}

pub fn load_results(path: impl AsRef<Path>) -> Result<Vec<LocalizationResult>, LocalizeError> {
    let mut reader = BufReader::new(File::open(path.as_ref())?);
    let mut results = vec![];
    loop {
        let mut length = [0u8; 8];
        match reader.read_exact(&mut length) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => break,
            Err(e) => return Err(e.into()),
        }
        // Reading through `take` keeps a corrupt length from allocating anything up front.
        let length = u64::from_le_bytes(length);
        let mut record = vec![];
        reader.by_ref().take(length).read_to_end(&mut record)?;
        if record.len() as u64 != length {
            return Err(LocalizeError::Serialization(Box::new(
                bincode::ErrorKind::Custom(format!(
                    "record {} needs {} bytes but only {} remain",
                    results.len(),
                    length,
                    record.len()
                )),
            )));
        }
        let result: LocalizationResult = bincode::deserialize(&record)?;
        results.push(result.check()?);
    }
    info!("loaded {} results from {}", results.len(), path.as_ref().display());
    Ok(results)
}
