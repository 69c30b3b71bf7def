use crate::LocalizeError;
use cv_core::KeyPoint;
use cv_pinhole::CameraIntrinsicsK3Distortion;
use derive_more::{AsRef, Deref, From, Into};
use log::*;
use serde::{Deserialize, Serialize};
use space::Metric;
use std::collections::BTreeMap;
use std::fs::File;
use std::io::{BufReader, BufWriter};
use std::path::{Path, PathBuf};

/// A feature descriptor compared with the euclidean distance.
#[derive(Debug, Clone, PartialEq, AsRef, Deref, From, Into, Serialize, Deserialize)]
pub struct Descriptor(pub Vec<f32>);

impl Descriptor {
    pub fn distance(&self, other: &Self) -> f32 {
        self.0
            .iter()
            .zip(&other.0)
            .map(|(a, b)| (a - b) * (a - b))
            .sum::<f32>()
            .sqrt()
    }
}

/// The euclidean distance between descriptors, as the bits of the non-negative `f32`.
///
/// Non-negative floats order the same way as their bit patterns.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Euclidean;

impl Metric<Descriptor> for Euclidean {
    type Unit = u32;

    fn distance(&self, a: &Descriptor, b: &Descriptor) -> u32 {
        a.distance(b).to_bits()
    }
}

/// A sparse visual word histogram that summarizes a whole image.
#[derive(Debug, Clone, Default, PartialEq, AsRef, Deref, From, Into, Serialize, Deserialize)]
pub struct Signature(pub BTreeMap<u32, f32>);

impl Signature {
    /// Builds a signature from the visual word of every feature.
    pub fn from_words(words: impl IntoIterator<Item = u32>) -> Self {
        let mut histogram = BTreeMap::new();
        for word in words {
            *histogram.entry(word).or_insert(0.0) += 1.0;
        }
        Self(histogram)
    }

    pub fn norm(&self) -> f32 {
        self.0.values().map(|v| v * v).sum::<f32>().sqrt()
    }

    /// The cosine of the angle between two histograms, zero if either is empty.
    pub fn cosine_similarity(&self, other: &Self) -> f32 {
        let norms = self.norm() * other.norm();
        if norms == 0.0 {
            return 0.0;
        }
        let dot: f32 = self
            .0
            .iter()
            .filter_map(|(word, a)| other.0.get(word).map(|b| a * b))
            .sum();
        dot / norms
    }
}

/// A described keypoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Feature {
    pub keypoint: KeyPoint,
    pub descriptor: Descriptor,
    /// The id of the fiducial marker this feature was detected on.
    #[serde(default)]
    pub marker: Option<u32>,
}

impl Feature {
    pub fn new(keypoint: KeyPoint, descriptor: Descriptor) -> Self {
        Self {
            keypoint,
            descriptor,
            marker: None,
        }
    }
}

/// An image of the sequence to localize, already described.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryFrame {
    /// The name of the image the frame was described from.
    pub name: String,
    pub width: u32,
    pub height: u32,
    /// The intrinsics of the camera, if they are known.
    pub intrinsics: Option<CameraIntrinsicsK3Distortion>,
    pub features: Vec<Feature>,
    pub signature: Signature,
}

impl QueryFrame {
    pub fn load(path: impl AsRef<Path>) -> Result<Self, LocalizeError> {
        let file = File::open(path)?;
        Ok(bincode::deserialize_from(BufReader::new(file))?)
    }

    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), LocalizeError> {
        let file = File::create(path)?;
        bincode::serialize_into(BufWriter::new(file), self)?;
        Ok(())
    }
}

/// The frames of a directory in file name order.
///
/// Every file with the `frame` extension is one bincode encoded [`QueryFrame`].
#[derive(Debug, Clone)]
pub struct FrameDirectory {
    paths: std::vec::IntoIter<PathBuf>,
}

impl FrameDirectory {
    pub const EXTENSION: &'static str = "frame";

    pub fn open(directory: impl AsRef<Path>) -> Result<Self, LocalizeError> {
        let mut paths = std::fs::read_dir(directory.as_ref())?
            .map(|entry| entry.map(|entry| entry.path()))
            .collect::<Result<Vec<_>, _>>()?;
        paths.retain(|path| path.extension().map_or(false, |ext| ext == Self::EXTENSION));
        paths.sort();
        info!(
            "found {} frames in {}",
            paths.len(),
            directory.as_ref().display()
        );
        Ok(Self {
            paths: paths.into_iter(),
        })
    }

    pub fn len(&self) -> usize {
        self.paths.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Iterator for FrameDirectory {
    type Item = Result<QueryFrame, LocalizeError>;

    fn next(&mut self) -> Option<Self::Item> {
        self.paths.next().map(QueryFrame::load)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn descriptor_distance() {
        let a = Descriptor(vec![0.0, 3.0]);
        let b = Descriptor(vec![4.0, 0.0]);
        assert_relative_eq!(a.distance(&b), 5.0);
        assert_eq!(a.distance(&a), 0.0);
    }

    #[test]
    fn metric_orders_like_the_distance() {
        let origin = Descriptor(vec![0.0, 0.0]);
        let distances: Vec<u32> = [0.0, 0.25, 1.0, 3.5, 1e6]
            .iter()
            .map(|&x| Euclidean.distance(&origin, &Descriptor(vec![x, 0.0])))
            .collect();
        assert!(distances.windows(2).all(|pair| pair[0] < pair[1]));
        assert_eq!(f32::from_bits(distances[3]), 3.5);
    }

    #[test]
    fn cosine_similarity() {
        let a = Signature::from_words([1, 1, 2]);
        let b = Signature::from_words([1, 2, 2]);
        let c = Signature::from_words([3]);
        assert_relative_eq!(a.cosine_similarity(&a), 1.0, epsilon = 1e-6);
        assert_relative_eq!(a.cosine_similarity(&b), 0.8, epsilon = 1e-6);
        assert_eq!(a.cosine_similarity(&c), 0.0);
        assert_eq!(a.cosine_similarity(&Signature::default()), 0.0);
    }

    #[test]
    fn directory_is_sorted_and_filtered() {
        let directory = tempfile::tempdir().unwrap();
        for name in ["b", "a", "c"] {
            QueryFrame {
                name: name.to_string(),
                width: 640,
                height: 480,
                intrinsics: None,
                features: vec![],
                signature: Signature::default(),
            }
            .save(directory.path().join(format!("{}.frame", name)))
            .unwrap();
        }
        std::fs::write(directory.path().join("notes.txt"), "not a frame").unwrap();

        let frames = FrameDirectory::open(directory.path()).unwrap();
        assert_eq!(frames.len(), 3);
        let names: Vec<String> = frames.map(|frame| frame.unwrap().name).collect();
        assert_eq!(names, ["a", "b", "c"]);
    }
}
