use crate::{FrameReport, LocalizationResult, LocalizeError, Localizer, QueryFrame, ResultLogWriter};
use log::*;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Instant;

/// Running aggregates of per-frame processing times in milliseconds.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LocalizationStats {
    count: usize,
    sum: f64,
    min: f64,
    max: f64,
}

impl Default for LocalizationStats {
    fn default() -> Self {
        Self {
            count: 0,
            sum: 0.0,
            min: f64::INFINITY,
            max: f64::NEG_INFINITY,
        }
    }
}

impl LocalizationStats {
    pub fn record(&mut self, milliseconds: f64) {
        self.count += 1;
        self.sum += milliseconds;
        self.min = self.min.min(milliseconds);
        self.max = self.max.max(milliseconds);
    }

    /// Combines the statistics of two runs.
    pub fn merge(&mut self, other: &Self) {
        self.count += other.count;
        self.sum += other.sum;
        self.min = self.min.min(other.min);
        self.max = self.max.max(other.max);
    }

    pub fn count(&self) -> usize {
        self.count
    }

    pub fn sum(&self) -> f64 {
        self.sum
    }

    /// `None` until something was recorded.
    pub fn mean(&self) -> Option<f64> {
        (self.count != 0).then(|| self.sum / self.count as f64)
    }

    pub fn min(&self) -> Option<f64> {
        (self.count != 0).then(|| self.min)
    }

    pub fn max(&self) -> Option<f64> {
        (self.count != 0).then(|| self.max)
    }
}

/// The outcome of localizing a whole sequence.
#[derive(Debug, Clone, PartialEq)]
pub struct RunReport {
    pub results: Vec<LocalizationResult>,
    pub stats: LocalizationStats,
}

impl RunReport {
    pub fn localized(&self) -> usize {
        self.results.iter().filter(|result| result.is_valid()).count()
    }
}

impl fmt::Display for RunReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Localized {}/{} images", self.localized(), self.results.len())?;
        writeln!(f, "Images localized with the number of 2D/3D matches during localization:")?;
        for result in self.results.iter().filter(|result| result.is_valid()) {
            writeln!(f, "{} : {}", result.frame(), result.inliers().len())?;
        }
        writeln!(f, "Processing took {} [s] overall", self.stats.sum() / 1000.0)?;
        writeln!(f, "Mean time for localization: {} [ms]", self.stats.mean().unwrap_or(0.0))?;
        writeln!(f, "Max time for localization: {} [ms]", self.stats.max().unwrap_or(0.0))?;
        write!(f, "Min time for localization: {} [ms]", self.stats.min().unwrap_or(0.0))
    }
}

/// Drives a localizer over a stream of frames.
pub struct Session<L> {
    localizer: L,
    log: Option<ResultLogWriter>,
}

impl<L> Session<L>
where
    L: Localizer,
{
    pub fn new(localizer: L) -> Self {
        Self {
            localizer,
            log: None,
        }
    }

    /// Appends every result to a log as soon as its frame is done.
    #[must_use]
    pub fn with_log(self, log: ResultLogWriter) -> Self {
        Self {
            log: Some(log),
            ..self
        }
    }

    pub fn localizer(&self) -> &L {
        &self.localizer
    }

    pub fn into_localizer(self) -> L {
        self.localizer
    }

    /// Localizes one frame and records how long it took.
    ///
    /// Only failing to write the result log is an error.
    pub fn localize_frame(
        &mut self,
        frame: &QueryFrame,
        stats: &mut LocalizationStats,
    ) -> Result<FrameReport, LocalizeError> {
        let start = Instant::now();
        let report = self.localizer.localize(frame);
        let elapsed = start.elapsed().as_secs_f64() * 1000.0;
        stats.record(elapsed);
        debug!("{} took {} ms", frame.name, elapsed);
        if let Some(log) = &mut self.log {
            log.append(&report.result)?;
        }
        Ok(report)
    }

    /// Localizes every frame in order.
    ///
    /// A frame that cannot be read ends the run. A frame that cannot be localized does not.
    pub fn run<I>(&mut self, frames: I) -> Result<RunReport, LocalizeError>
    where
        I: IntoIterator<Item = Result<QueryFrame, LocalizeError>>,
    {
        if !self.localizer.is_ready() {
            return Err(LocalizeError::Configuration(
                "the localizer could not be initialized".to_string(),
            ));
        }
        let mut stats = LocalizationStats::default();
        let mut results = vec![];
        for frame in frames {
            let frame = frame?;
            let report = self.localize_frame(&frame, &mut stats)?;
            results.push(report.result);
        }
        if let Some(log) = self.log.take() {
            let records = log.finish()?;
            info!("wrote {} results to the log", records);
        }
        let report = RunReport { results, stats };
        info!(
            "localized {}/{} frames",
            report.localized(),
            report.results.len()
        );
        Ok(report)
    }
}
