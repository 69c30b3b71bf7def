#![allow(dead_code)]

use cv_core::nalgebra::{Point2, Point3, Rotation3, Vector3};
use cv_core::WorldToCamera;
use cv_localize::{
    Descriptor, Feature, IntrinsicId, Landmark, LandmarkId, Map, MapData, PoseId, QueryFrame,
    Signature, View, ViewId,
};
use cv_pinhole::{CameraIntrinsics, CameraIntrinsicsK3Distortion};
use rand::{rngs::SmallRng, Rng, SeedableRng};
use std::collections::BTreeMap;

pub const WIDTH: u32 = 800;
pub const HEIGHT: u32 = 600;
const DESCRIPTOR_LEN: usize = 64;

pub fn intrinsics() -> CameraIntrinsicsK3Distortion {
    CameraIntrinsics::identity()
        .focal(800.0)
        .principal_point(Point2::new(400.0, 300.0))
        .into()
}

/// A camera on a ring of radius 8 looking at the origin.
pub fn ring_pose(angle: f64) -> WorldToCamera {
    let center = Point3::new(8.0 * angle.cos(), 0.5, 8.0 * angle.sin());
    let rotation = Rotation3::face_towards(&-center.coords, &Vector3::y()).inverse();
    WorldToCamera::from_rotation_center(rotation, center)
}

/// A cloud of described landmarks around the origin and a map of views on a ring around it.
pub struct World {
    pub points: Vec<Point3<f64>>,
    pub descriptors: Vec<Descriptor>,
    pub map: Map,
    rng: SmallRng,
}

impl World {
    pub fn new(landmarks: usize, views: usize, seed: u64) -> Self {
        let mut rng = SmallRng::seed_from_u64(seed);
        let points: Vec<Point3<f64>> = (0..landmarks)
            .map(|_| {
                Point3::new(
                    rng.gen_range(-1.5..1.5),
                    rng.gen_range(-1.5..1.5),
                    rng.gen_range(-1.5..1.5),
                )
            })
            .collect();
        let descriptors: Vec<Descriptor> = (0..landmarks)
            .map(|_| random_descriptor(&mut rng))
            .collect();

        let mut data = MapData::default();
        data.intrinsics.insert(IntrinsicId(0), intrinsics());
        let mut observations: Vec<BTreeMap<ViewId, usize>> = vec![BTreeMap::new(); landmarks];
        for ix in 0..views {
            let id = ViewId(ix as u32);
            let pose = ring_pose(ix as f64 * std::f64::consts::TAU / views as f64);
            data.poses.insert(PoseId(ix as u32), pose);
            let mut features = vec![];
            for (landmark, point) in points.iter().enumerate() {
                if let Some(keypoint) = intrinsics().project(pose, (*point).into()) {
                    observations[landmark].insert(id, features.len());
                    features.push(Feature {
                        keypoint,
                        descriptor: descriptors[landmark].clone(),
                        marker: Some(landmark as u32),
                    });
                }
            }
            data.views.insert(
                id,
                View {
                    image: format!("view{:03}.png", ix),
                    width: WIDTH,
                    height: HEIGHT,
                    intrinsic: IntrinsicId(0),
                    pose: Some(PoseId(ix as u32)),
                    features,
                    signature: Signature::from_words(0..landmarks as u32),
                },
            );
        }
        for (ix, (position, observations)) in points.iter().zip(observations).enumerate() {
            data.landmarks.insert(
                LandmarkId(ix as u32),
                Landmark {
                    position: *position,
                    observations,
                },
            );
        }
        let map = Map::new(data).unwrap();
        Self {
            points,
            descriptors,
            map,
            rng,
        }
    }

    /// A calibrated frame observing the landmarks `observed` accepts, plus random clutter.
    pub fn frame(
        &mut self,
        name: &str,
        pose: WorldToCamera,
        observed: impl Fn(usize) -> bool,
        clutter: usize,
    ) -> QueryFrame {
        let mut features = vec![];
        let mut words = vec![];
        for (landmark, point) in self.points.iter().enumerate() {
            if !observed(landmark) {
                continue;
            }
            if let Some(keypoint) = intrinsics().project(pose, (*point).into()) {
                let descriptor = Descriptor(
                    self.descriptors[landmark]
                        .iter()
                        .map(|v| v + self.rng.gen_range(-0.005..0.005))
                        .collect(),
                );
                features.push(Feature {
                    keypoint,
                    descriptor,
                    marker: Some(landmark as u32),
                });
                words.push(landmark as u32);
            }
        }
        for _ in 0..clutter {
            let keypoint = cv_core::KeyPoint::new(
                self.rng.gen_range(0.0..WIDTH as f64),
                self.rng.gen_range(0.0..HEIGHT as f64),
            );
            features.push(Feature::new(keypoint, random_descriptor(&mut self.rng)));
        }
        QueryFrame {
            name: name.to_string(),
            width: WIDTH,
            height: HEIGHT,
            intrinsics: Some(intrinsics()),
            features,
            signature: Signature::from_words(words),
        }
    }

    /// A frame of nothing but clutter whose signature still retrieves views.
    pub fn clutter_frame(&mut self, name: &str, clutter: usize) -> QueryFrame {
        let mut frame = self.frame(name, ring_pose(0.0), |_| false, clutter);
        frame.signature = Signature::from_words(0..10);
        frame
    }
}

fn random_descriptor(rng: &mut SmallRng) -> Descriptor {
    Descriptor((0..DESCRIPTOR_LEN).map(|_| rng.gen::<f32>()).collect())
}
