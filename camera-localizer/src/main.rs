use cv_consensus::RobustEstimator;
use cv_localize::{
    load_results, refine_sequence, save_results, Algorithm, FrameDirectory, LocalizationResult,
    LocalizeError, LocalizerKind, LocalizerSettings, LocalizerType, Map, ResultLogWriter,
    SequenceSettings, Session, Trajectory,
};
use log::*;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use structopt::StructOpt;

#[derive(StructOpt, Clone)]
#[structopt(
    name = "camera-localizer",
    about = "Localizes a sequence of described frames against a sparse map"
)]
enum Opt {
    /// Localize every frame of a directory, then optionally refine the whole sequence.
    Localize(LocalizeOpt),
    /// Refine a previously written result log.
    Refine(RefineOpt),
}

#[derive(StructOpt, Clone)]
struct LocalizeOpt {
    /// The bincode map to localize against.
    #[structopt(short, long)]
    map: PathBuf,
    /// The directory of described frames, one `.frame` file per image.
    #[structopt(short, long)]
    frames: PathBuf,
    /// The file where settings are specified.
    ///
    /// This is in the format of `cv_localize::LocalizerSettings`.
    #[structopt(short, long, default_value = "localizer-settings.json")]
    settings: PathBuf,
    /// The resection estimator, `acransac` or `loransac`.
    #[structopt(long)]
    resection_estimator: Option<RobustEstimator>,
    /// The resection inlier threshold in pixels. Zero means automatic with AC-RANSAC.
    #[structopt(long)]
    reprojection_error: Option<f64>,
    /// The estimator of the epipolar match check, `acransac` or `loransac`.
    #[structopt(long)]
    matching_estimator: Option<RobustEstimator>,
    /// The epipolar inlier threshold in pixels. Zero means automatic with AC-RANSAC.
    #[structopt(long)]
    matching_error: Option<f64>,
    /// The number of candidate views to retrieve for every frame.
    #[structopt(long)]
    nb_image_match: Option<usize>,
    /// The number of candidate views to merge. Zero merges all of them.
    #[structopt(long)]
    max_results: Option<usize>,
    /// `first-best` or `all-results`, also accepted without the dash.
    #[structopt(long)]
    algorithm: Option<Algorithm>,
    /// The number of localized frames kept for matching the next frame.
    #[structopt(long)]
    nb_frame_buffer_matching: Option<usize>,
    /// Check descriptor matches with a fundamental matrix.
    #[structopt(long)]
    robust_matching: Option<bool>,
    /// Refine the intrinsics of every frame. This disables the global bundle.
    #[structopt(long)]
    refine_intrinsics: Option<bool>,
    /// Refine the whole localized sequence at the end.
    #[structopt(long)]
    global_bundle: bool,
    #[structopt(flatten)]
    bundle: BundleOpt,
    /// Where to write the result log.
    #[structopt(long)]
    output_binary: Option<PathBuf>,
    /// Where to write the camera trajectory as JSON.
    #[structopt(long)]
    output_trajectory: Option<PathBuf>,
    /// `retrieval`, or `fiducial` when built with markers.
    #[structopt(long, default_value = "retrieval")]
    localizer: LocalizerType,
    /// The seed of the consensus sampling.
    #[structopt(long, default_value = "5")]
    seed: u64,
}

#[derive(StructOpt, Clone)]
struct RefineOpt {
    /// A result log written by `localize`.
    #[structopt(short, long)]
    results: PathBuf,
    #[structopt(flatten)]
    bundle: BundleOpt,
    /// Where to write the refined result log.
    #[structopt(long)]
    output_binary: Option<PathBuf>,
    /// Where to write the refined trajectory as JSON.
    #[structopt(long)]
    output_trajectory: Option<PathBuf>,
}

#[derive(StructOpt, Clone)]
struct BundleOpt {
    /// Take the distortion of every frame as zero during the bundle.
    #[structopt(long)]
    no_distortion: bool,
    /// Keep the intrinsics fixed during the bundle.
    #[structopt(long)]
    no_ba_refine_intrinsics: bool,
    /// Landmarks seen by fewer localized frames are left out of the bundle.
    #[structopt(long)]
    min_point_visibility: Option<usize>,
}

impl BundleOpt {
    fn apply(&self, sequence: &mut SequenceSettings) {
        sequence.model_distortion &= !self.no_distortion;
        sequence.refine_intrinsics &= !self.no_ba_refine_intrinsics;
        if let Some(visibility) = self.min_point_visibility {
            sequence.min_point_visibility = visibility;
        }
    }
}

fn main() {
    pretty_env_logger::init_timed();
    let result = match Opt::from_args() {
        Opt::Localize(opt) => localize(opt),
        Opt::Refine(opt) => refine(opt),
    };
    if let Err(e) = result {
        error!("{}", e);
        std::process::exit(1);
    }
}

fn load_settings(path: &Path) -> LocalizerSettings {
    let settings = std::fs::File::open(path)
        .ok()
        .and_then(|file| serde_json::from_reader(file).ok());
    if settings.is_some() {
        info!("loaded existing settings");
    } else {
        info!("used default settings");
    }
    settings.unwrap_or_default()
}

fn localize(opt: LocalizeOpt) -> Result<(), LocalizeError> {
    let mut settings = load_settings(&opt.settings);
    if let Some(estimator) = opt.resection_estimator {
        settings.resection_estimator = estimator;
    }
    if let Some(error) = opt.reprojection_error {
        settings.resection_error_max = error;
    }
    if let Some(estimator) = opt.matching_estimator {
        settings.matching_estimator = estimator;
    }
    if let Some(error) = opt.matching_error {
        settings.matching_error_max = error;
    }
    if let Some(num_results) = opt.nb_image_match {
        settings.num_results = num_results;
    }
    if let Some(max_results) = opt.max_results {
        settings.max_results = max_results;
    }
    if let Some(algorithm) = opt.algorithm {
        settings.algorithm = algorithm;
    }
    if let Some(frames) = opt.nb_frame_buffer_matching {
        settings.frame_buffer_matching = frames;
    }
    if let Some(robust) = opt.robust_matching {
        settings.robust_matching = robust;
    }
    if let Some(refine) = opt.refine_intrinsics {
        settings.refine_intrinsics = refine;
    }
    settings.sequence.enabled |= opt.global_bundle;
    opt.bundle.apply(&mut settings.sequence);
    let settings = settings.validate()?;

    info!("loading the map");
    let map = Arc::new(Map::load(&opt.map)?);
    let frames = FrameDirectory::open(&opt.frames)?;
    let localizer = LocalizerKind::initialize(opt.localizer, map, settings, opt.seed)?;
    info!("using the {} localizer", localizer.kind());

    let mut session = Session::new(localizer);
    if let Some(path) = &opt.output_binary {
        session = session.with_log(ResultLogWriter::create(path)?);
    }
    let mut report = session.run(frames)?;
    println!("{}", report);

    if let Some(path) = &opt.output_trajectory {
        Trajectory::from_results(&report.results).save(path)?;
    }

    if settings.sequence.enabled {
        let bundled = bundle(&mut report.results, &settings.sequence);
        if bundled {
            write_outputs(
                &report.results,
                opt.output_binary.as_deref().map(bundle_path).as_deref(),
                opt.output_trajectory.as_deref().map(bundle_path).as_deref(),
            )?;
        }
    }
    Ok(())
}

fn refine(opt: RefineOpt) -> Result<(), LocalizeError> {
    let mut results = load_results(&opt.results)?;
    info!("loaded {} results", results.len());
    let mut sequence = SequenceSettings {
        enabled: true,
        ..SequenceSettings::default()
    };
    opt.bundle.apply(&mut sequence);
    if bundle(&mut results, &sequence) {
        write_outputs(
            &results,
            opt.output_binary.as_deref(),
            opt.output_trajectory.as_deref(),
        )?;
    }
    Ok(())
}

/// Refines the results in place and reports whether it succeeded.
fn bundle(results: &mut [LocalizationResult], sequence: &SequenceSettings) -> bool {
    match refine_sequence(results, sequence) {
        Ok(refinement) => {
            println!(
                "Bundle Adjustment: {} frames, RMSE {} -> {} in {} evaluations",
                refinement.frames.len(),
                refinement.initial_rms,
                refinement.final_rms,
                refinement.evaluations
            );
            true
        }
        Err(e) => {
            warn!("{}", e);
            println!("Bundle Adjustment failed!");
            false
        }
    }
}

fn write_outputs(
    results: &[LocalizationResult],
    binary: Option<&Path>,
    trajectory: Option<&Path>,
) -> Result<(), LocalizeError> {
    if let Some(path) = binary {
        save_results(results, path)?;
        info!("saved {} results to {}", results.len(), path.display());
    }
    if let Some(path) = trajectory {
        Trajectory::from_results(results).save(path)?;
        info!("saved the trajectory to {}", path.display());
    }
    Ok(())
}

/// `out/results.bin` becomes `out/results.BUNDLE.bin`.
fn bundle_path(path: &Path) -> PathBuf {
    let stem = path
        .file_stem()
        .map(|stem| stem.to_string_lossy().into_owned())
        .unwrap_or_default();
    let name = match path.extension() {
        Some(extension) => format!("{}.BUNDLE.{}", stem, extension.to_string_lossy()),
        None => format!("{}.BUNDLE", stem),
    };
    path.with_file_name(name)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bundle_paths_keep_the_extension() {
        assert_eq!(
            bundle_path(Path::new("out/results.bin")),
            Path::new("out/results.BUNDLE.bin")
        );
        assert_eq!(
            bundle_path(Path::new("trajectory.json")),
            Path::new("trajectory.BUNDLE.json")
        );
        assert_eq!(bundle_path(Path::new("log")), Path::new("log.BUNDLE"));
    }

    #[test]
    fn bundle_flags_only_turn_things_off() {
        let mut sequence = SequenceSettings::default();
        BundleOpt {
            no_distortion: true,
            no_ba_refine_intrinsics: false,
            min_point_visibility: Some(3),
        }
        .apply(&mut sequence);
        assert!(!sequence.model_distortion);
        assert!(sequence.refine_intrinsics);
        assert_eq!(sequence.min_point_visibility, 3);
    }
}
