use crate::{
    merge_correspondences, Algorithm, BufferedFrame, CandidateRetrieval, Correspondence,
    ExhaustiveRetrieval, LocalizationResult, LocalizeError, LocalizerSettings, Map, Matcher,
    PoseEstimator, QueryFrame, TemporalBuffer, ViewId,
};
use cv_geom::Frustum;
use log::*;
use rand::{Rng, SeedableRng};
use rand_pcg::Pcg64;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

/// The stages a frame goes through while it is localized.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FrameState {
    Idle,
    /// Candidate views (or the temporal buffer) were found.
    Retrieved,
    /// Enough correspondences were matched to attempt a pose.
    Matched,
    PoseValid,
    PoseInvalid,
}

/// Everything that happened to one frame.
#[derive(Debug)]
pub struct FrameReport {
    pub result: LocalizationResult,
    /// Every state the frame passed through, starting at [`FrameState::Idle`].
    pub states: Vec<FrameState>,
    /// Why the frame is invalid.
    pub failure: Option<LocalizeError>,
    /// The pose came from matching against the temporal buffer.
    pub used_buffer: bool,
}

impl FrameReport {
    pub fn state(&self) -> FrameState {
        self.states.last().copied().unwrap_or(FrameState::Idle)
    }
}

/// Localizes the frames of one sequence in order.
pub trait Localizer {
    fn is_ready(&self) -> bool;

    /// Localizes a frame. This never fails: a frame that cannot be localized gets an invalid
    /// result and the reason is kept in the report.
    fn localize(&mut self, frame: &QueryFrame) -> FrameReport;
}

/// Finds map views for a frame and the correspondences between the frame and each view.
pub trait CorrespondenceSource: Send + Sync {
    fn is_ready(&self) -> bool;

    /// The candidate views for a frame, best first.
    fn candidates(
        &self,
        map: &Map,
        frame: &QueryFrame,
        max: usize,
    ) -> Result<Vec<ViewId>, LocalizeError>;

    /// Matches a frame against one candidate view. `seed` drives any random sampling.
    fn correspond(
        &self,
        map: &Map,
        frame: &QueryFrame,
        view: ViewId,
        seed: u64,
    ) -> Result<Vec<Correspondence>, LocalizeError>;
}

/// Candidates from image retrieval, correspondences from descriptor matching.
pub struct RetrievalSource {
    retrieval: Box<dyn CandidateRetrieval>,
    matcher: Matcher,
}

impl RetrievalSource {
    pub fn new(retrieval: Box<dyn CandidateRetrieval>, matcher: Matcher) -> Self {
        Self { retrieval, matcher }
    }
}

impl CorrespondenceSource for RetrievalSource {
    fn is_ready(&self) -> bool {
        self.retrieval.is_ready()
    }

    fn candidates(
        &self,
        _: &Map,
        frame: &QueryFrame,
        max: usize,
    ) -> Result<Vec<ViewId>, LocalizeError> {
        Ok(self
            .retrieval
            .retrieve(&frame.signature, max)?
            .into_iter()
            .map(|candidate| candidate.view)
            .collect())
    }

    fn correspond(
        &self,
        map: &Map,
        frame: &QueryFrame,
        view: ViewId,
        seed: u64,
    ) -> Result<Vec<Correspondence>, LocalizeError> {
        self.matcher
            .match_view(frame, map, view, &mut Pcg64::seed_from_u64(seed))
    }
}

/// Localizes a sequence against a map, matching against recently localized frames first.
pub struct Tracker<S> {
    map: Arc<Map>,
    source: S,
    settings: LocalizerSettings,
    matcher: Matcher,
    estimator: PoseEstimator,
    buffer: TemporalBuffer,
    rng: Pcg64,
}

impl<S> Tracker<S>
where
    S: CorrespondenceSource,
{
    pub fn new(
        map: Arc<Map>,
        source: S,
        settings: LocalizerSettings,
        seed: u64,
    ) -> Result<Self, LocalizeError> {
        let settings = settings.validate()?;
        Ok(Self {
            map,
            source,
            matcher: Matcher::new(&settings),
            estimator: PoseEstimator::new(settings),
            buffer: TemporalBuffer::new(settings.frame_buffer_matching),
            settings,
            rng: Pcg64::seed_from_u64(seed),
        })
    }

    pub fn map(&self) -> &Arc<Map> {
        &self.map
    }

    pub fn settings(&self) -> &LocalizerSettings {
        &self.settings
    }

    pub fn buffer(&self) -> &TemporalBuffer {
        &self.buffer
    }

    /// Forgets the recently localized frames, for instance at a cut in the sequence.
    pub fn reset(&mut self) {
        self.buffer.clear();
    }

    fn localize_with_source(
        &mut self,
        frame: &QueryFrame,
        states: &mut Vec<FrameState>,
    ) -> Result<LocalizationResult, LocalizeError> {
        let floor = self.settings.inlier_floor();
        let mut candidates = self
            .source
            .candidates(&self.map, frame, self.settings.num_results)?;
        if self.settings.frustum_pruning {
            candidates = self.prune(frame, candidates);
        }
        states.push(FrameState::Retrieved);
        if candidates.is_empty() {
            return Err(LocalizeError::InsufficientCorrespondences {
                found: 0,
                needed: floor,
            });
        }
        info!("matching {} against {} candidate views", frame.name, candidates.len());

        let seeds: Vec<u64> = candidates.iter().map(|_| self.rng.gen()).collect();
        let map = &*self.map;
        let source = &self.source;
        let matched: Vec<(ViewId, Result<Vec<Correspondence>, LocalizeError>)> = candidates
            .par_iter()
            .zip(seeds.par_iter())
            .map(|(&view, &seed)| (view, source.correspond(map, frame, view, seed)))
            .collect();

        let mut failure = LocalizeError::InsufficientCorrespondences {
            found: 0,
            needed: floor,
        };
        let mut usable = vec![];
        for (view, correspondences) in matched {
            match correspondences {
                Ok(correspondences) if correspondences.len() >= floor => {
                    usable.push((view, correspondences))
                }
                Ok(correspondences) => {
                    debug!("view {} only gave {} correspondences", view, correspondences.len());
                    failure = LocalizeError::InsufficientCorrespondences {
                        found: correspondences.len(),
                        needed: floor,
                    };
                }
                Err(e) => {
                    debug!("matching against view {} failed: {}", view, e);
                    failure = e;
                }
            }
        }
        if usable.is_empty() {
            return Err(failure);
        }
        states.push(FrameState::Matched);

        match self.settings.algorithm {
            Algorithm::FirstBest => {
                for (view, correspondences) in usable {
                    match self
                        .estimator
                        .estimate(frame, &self.map, &correspondences, &mut self.rng)
                    {
                        Ok(result) => {
                            debug!("{} localized against view {}", frame.name, view);
                            return Ok(result);
                        }
                        Err(e) => {
                            debug!("no pose for {} against view {}: {}", frame.name, view, e);
                            failure = e;
                        }
                    }
                }
                Err(failure)
            }
            Algorithm::AllResults => {
                let limit = match self.settings.max_results {
                    0 => usize::MAX,
                    limit => limit,
                };
                let pooled = merge_correspondences(
                    usable
                        .into_iter()
                        .take(limit)
                        .map(|(_, correspondences)| correspondences),
                );
                self.estimator
                    .estimate(frame, &self.map, &pooled, &mut self.rng)
            }
        }
    }

    /// Drops the candidates that cannot see anything the previous frame saw.
    fn prune(&self, frame: &QueryFrame, candidates: Vec<ViewId>) -> Vec<ViewId> {
        let latest = match self.buffer.latest() {
            Some(latest) => latest,
            None => return candidates,
        };
        let predicted = match Frustum::from_pose(
            frame.width as f64,
            frame.height as f64,
            &latest.intrinsics.simple_intrinsics.matrix(),
            latest.pose,
        ) {
            Ok(predicted) => predicted,
            Err(e) => {
                debug!("no predicted frustum for {}: {}", frame.name, e);
                return candidates;
            }
        };
        let before = candidates.len();
        let kept: Vec<ViewId> = candidates
            .into_iter()
            .filter(|&view| {
                self.map
                    .view_frustum(view)
                    .map_or(true, |frustum| predicted.intersect(&frustum))
            })
            .collect();
        if kept.len() != before {
            debug!(
                "pruned {} of {} candidates of {} by frustum",
                before - kept.len(),
                before,
                frame.name
            );
        }
        kept
    }

    fn finish(
        &mut self,
        frame: &QueryFrame,
        mut states: Vec<FrameState>,
        outcome: Result<LocalizationResult, LocalizeError>,
        used_buffer: bool,
    ) -> FrameReport {
        match outcome {
            Ok(result) => {
                states.push(FrameState::PoseValid);
                info!(
                    "frame {} localized with {} inliers",
                    frame.name,
                    result.inliers().len()
                );
                if let Some(buffered) = BufferedFrame::new(frame, &result) {
                    self.buffer.push(buffered);
                }
                FrameReport {
                    result,
                    states,
                    failure: None,
                    used_buffer,
                }
            }
            Err(e) => {
                states.push(FrameState::PoseInvalid);
                if matches!(e, LocalizeError::RetrievalUnavailable(_)) {
                    warn!("frame {} could not be localized: {}", frame.name, e);
                } else {
                    info!("frame {} could not be localized: {}", frame.name, e);
                }
                FrameReport {
                    result: LocalizationResult::invalid(frame.name.clone()),
                    states,
                    failure: Some(e),
                    used_buffer: false,
                }
            }
        }
    }
}

impl<S> Localizer for Tracker<S>
where
    S: CorrespondenceSource,
{
    fn is_ready(&self) -> bool {
        self.source.is_ready() && !self.map.is_empty()
    }

    fn localize(&mut self, frame: &QueryFrame) -> FrameReport {
        let mut states = vec![FrameState::Idle];
        if !self.buffer.is_empty() {
            let correspondences = self.buffer.match_frame(&self.matcher, frame);
            let needed = self
                .settings
                .buffer_min_correspondences
                .max(self.settings.inlier_floor());
            if correspondences.len() >= needed {
                states.extend([FrameState::Retrieved, FrameState::Matched]);
                match self
                    .estimator
                    .estimate(frame, &self.map, &correspondences, &mut self.rng)
                {
                    Ok(result) => return self.finish(frame, states, Ok(result), true),
                    Err(e) => info!(
                        "buffer pose of {} failed, falling back to retrieval: {}",
                        frame.name, e
                    ),
                }
            } else {
                debug!(
                    "buffer gave {} of {} correspondences for {}",
                    correspondences.len(),
                    needed,
                    frame.name
                );
            }
        }
        let outcome = self.localize_with_source(frame, &mut states);
        self.finish(frame, states, outcome, false)
    }
}

/// The available localizers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LocalizerType {
    Retrieval,
    Fiducial,
}

impl Default for LocalizerType {
    fn default() -> Self {
        Self::Retrieval
    }
}

impl fmt::Display for LocalizerType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Retrieval => write!(f, "retrieval"),
            Self::Fiducial => write!(f, "fiducial"),
        }
    }
}

impl FromStr for LocalizerType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "retrieval" => Ok(Self::Retrieval),
            "fiducial" => Ok(Self::Fiducial),
            other => Err(format!(
                "unknown localizer {:?}, expected retrieval or fiducial",
                other
            )),
        }
    }
}

/// A localizer chosen at startup.
pub enum LocalizerKind {
    Retrieval(Tracker<RetrievalSource>),
    #[cfg(feature = "fiducial")]
    Fiducial(Tracker<crate::FiducialSource>),
}

impl LocalizerKind {
    /// Validates the settings and builds the localizer.
    pub fn initialize(
        kind: LocalizerType,
        map: Arc<Map>,
        settings: LocalizerSettings,
        seed: u64,
    ) -> Result<Self, LocalizeError> {
        let settings = settings.validate()?;
        match kind {
            LocalizerType::Retrieval => {
                let retrieval = ExhaustiveRetrieval::from_map(&map);
                let source = RetrievalSource::new(Box::new(retrieval), Matcher::new(&settings));
                Ok(Self::Retrieval(Tracker::new(map, source, settings, seed)?))
            }
            #[cfg(feature = "fiducial")]
            LocalizerType::Fiducial => {
                let source = crate::FiducialSource::new(settings.fiducial_nearest_keyframes);
                Ok(Self::Fiducial(Tracker::new(map, source, settings, seed)?))
            }
            #[cfg(not(feature = "fiducial"))]
            LocalizerType::Fiducial => Err(LocalizeError::Configuration(
                "the fiducial localizer needs the fiducial feature".to_string(),
            )),
        }
    }

    pub fn kind(&self) -> LocalizerType {
        match self {
            Self::Retrieval(_) => LocalizerType::Retrieval,
            #[cfg(feature = "fiducial")]
            Self::Fiducial(_) => LocalizerType::Fiducial,
        }
    }
}

impl Localizer for LocalizerKind {
    fn is_ready(&self) -> bool {
        match self {
            Self::Retrieval(tracker) => tracker.is_ready(),
            #[cfg(feature = "fiducial")]
            Self::Fiducial(tracker) => tracker.is_ready(),
        }
    }

    fn localize(&mut self, frame: &QueryFrame) -> FrameReport {
        match self {
            Self::Retrieval(tracker) => tracker.localize(frame),
            #[cfg(feature = "fiducial")]
            Self::Fiducial(tracker) => tracker.localize(frame),
        }
    }
}
