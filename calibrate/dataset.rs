//! # Dataset Builder
//!
//! Runs the Monte Carlo sweep for one crop/trait pair: sample a trial, push it
//! through the simulator, extract features, and keep the `(features, target)`
//! pair. A trial that fails in the simulator or in extraction is dropped and
//! counted; the sweep never aborts on a partial failure. Only the first few
//! failures are logged so a pathological parameter envelope cannot flood the
//! log, and the final counts are always reported.

use crate::calibrate::bands::BandExtractor;
use crate::calibrate::config::ConfigurationError;
use crate::calibrate::profile::{CropProfile, TraitSelector};
use crate::calibrate::progress::{NoopSweepProgress, SweepProgress};
use crate::calibrate::sampler::ParameterSampler;
use crate::calibrate::simulator::Simulator;
use ndarray::{Array1, Array2};
use rand::Rng;
use thiserror::Error;

/// Number of per-trial failures logged individually per sweep.
pub const LOGGED_FAILURE_LIMIT: usize = 5;

/// Bookkeeping for one dataset build.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DatasetReport {
    /// Trials run, or rows read for a measured table.
    pub attempted: usize,
    pub retained: usize,
    pub simulation_failures: usize,
    pub extraction_failures: usize,
    /// Measured rows dropped for a missing trait or feature value.
    pub missing_values: usize,
}

impl DatasetReport {
    pub fn dropped(&self) -> usize {
        self.simulation_failures + self.extraction_failures + self.missing_values
    }
}

/// Feature matrix and target vector for one crop/trait calibration.
#[derive(Debug, Clone)]
pub struct CalibrationDataset {
    /// Column names of `features`, in coefficient order.
    pub feature_names: Vec<String>,
    /// Shape: `[retained, feature_names.len()]`.
    pub features: Array2<f64>,
    pub target: Array1<f64>,
    pub report: DatasetReport,
}

impl CalibrationDataset {
    /// Assembles a dataset from row vectors of equal length.
    pub fn from_rows(
        feature_names: Vec<String>,
        rows: &[Array1<f64>],
        target: Vec<f64>,
        report: DatasetReport,
    ) -> Self {
        let width = feature_names.len();
        let features = Array2::from_shape_fn((rows.len(), width), |(i, j)| rows[i][j]);
        Self {
            feature_names,
            features,
            target: Array1::from_vec(target),
            report,
        }
    }

    pub fn len(&self) -> usize {
        self.target.len()
    }

    pub fn is_empty(&self) -> bool {
        self.target.is_empty()
    }
}

#[derive(Error, Debug)]
pub enum DatasetError {
    #[error(transparent)]
    Configuration(#[from] ConfigurationError),

    #[error(
        "Only {} of {} trials were retained ({} simulation failures, {} extraction failures), but at least {required} are required",
        .report.retained,
        .report.attempted,
        .report.simulation_failures,
        .report.extraction_failures
    )]
    InsufficientData {
        report: DatasetReport,
        required: usize,
    },
}

pub struct DatasetBuilder<'a> {
    sampler: ParameterSampler<'a>,
    selector: TraitSelector,
    extractor: BandExtractor,
    simulator: &'a dyn Simulator,
    minimum_samples: usize,
    label: String,
}

impl<'a> DatasetBuilder<'a> {
    /// Fails with [`ConfigurationError`] before any simulation if the crop's
    /// ranges are invalid.
    pub fn new(
        profile: &'a CropProfile,
        selector: TraitSelector,
        extractor: BandExtractor,
        simulator: &'a dyn Simulator,
    ) -> Result<Self, ConfigurationError> {
        Ok(Self {
            sampler: ParameterSampler::new(profile)?,
            selector,
            extractor,
            simulator,
            minimum_samples: 2,
            label: format!("{}/{}", profile.name, selector),
        })
    }

    /// Retained-sample floor below which the build fails.
    pub fn with_minimum_samples(mut self, minimum_samples: usize) -> Self {
        self.minimum_samples = minimum_samples;
        self
    }

    /// Names the sweep in logs and progress reports. Defaults to `crop/trait`.
    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = label.into();
        self
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn build<R: Rng>(
        &self,
        rng: &mut R,
        trials: usize,
    ) -> Result<CalibrationDataset, DatasetError> {
        self.build_with_progress(rng, trials, &NoopSweepProgress)
    }

    pub fn build_with_progress<R: Rng>(
        &self,
        rng: &mut R,
        trials: usize,
        progress: &dyn SweepProgress,
    ) -> Result<CalibrationDataset, DatasetError> {
        let label = self.label();
        let profile = self.sampler.profile();
        log::info!("{label}: running {trials} simulation trials");
        progress.on_sweep_start(label, trials);

        let mut rows: Vec<Array1<f64>> = Vec::with_capacity(trials);
        let mut target: Vec<f64> = Vec::with_capacity(trials);
        let mut report = DatasetReport {
            attempted: trials,
            ..DatasetReport::default()
        };

        for trial in 0..trials {
            let parameters = self.sampler.draw(rng);
            let outcome = self
                .simulator
                .simulate(&parameters)
                .map_err(|e| e.to_string())
                .map(|spectrum| self.extractor.extract(&spectrum));

            match outcome {
                Ok(Ok(row)) => {
                    rows.push(row);
                    target.push(self.selector.target_value(profile, &parameters));
                }
                Ok(Err(e)) => {
                    report.extraction_failures += 1;
                    if report.dropped() <= LOGGED_FAILURE_LIMIT {
                        log::warn!("{label}: trial {trial} dropped, extraction failed: {e}");
                    }
                }
                Err(message) => {
                    report.simulation_failures += 1;
                    if report.dropped() <= LOGGED_FAILURE_LIMIT {
                        log::warn!("{label}: trial {trial} dropped, simulation failed: {message}");
                    }
                }
            }
            progress.on_sweep_advance(label, trial + 1);
        }

        report.retained = rows.len();
        log::info!(
            "{label}: retained {}/{} trials ({} simulation failures, {} extraction failures)",
            report.retained,
            report.attempted,
            report.simulation_failures,
            report.extraction_failures
        );
        progress.on_sweep_finish(label, &report);

        if report.retained < self.minimum_samples {
            return Err(DatasetError::InsufficientData {
                report,
                required: self.minimum_samples,
            });
        }

        Ok(CalibrationDataset::from_rows(
            self.extractor.feature_names(),
            &rows,
            target,
            report,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::calibrate::simulator::{CanopyParameters, SimulationError, Spectrum};
    use rand::SeedableRng;
    use rand::rngs::StdRng;
    use std::sync::Mutex;

    fn red_edge_simulator(p: &CanopyParameters) -> Result<Spectrum, SimulationError> {
        let mut spectrum = Spectrum::flat(0.2);
        spectrum.set_wavelength(705, 0.4 - 0.003 * p.cab);
        Ok(spectrum)
    }

    #[test]
    fn every_successful_trial_is_retained() {
        let profile = CropProfile::corn();
        let extractor = BandExtractor::from_names(&["B05"]).unwrap();
        let builder = DatasetBuilder::new(
            &profile,
            TraitSelector::CHLOROPHYLL,
            extractor,
            &red_edge_simulator,
        )
        .unwrap();
        let dataset = builder.build(&mut StdRng::seed_from_u64(1), 40).unwrap();
        assert_eq!(dataset.len(), 40);
        assert_eq!(dataset.features.dim(), (40, 1));
        assert_eq!(dataset.feature_names, vec!["B05".to_string()]);
        assert_eq!(dataset.report.dropped(), 0);
        for (row, cab) in dataset.features.rows().into_iter().zip(dataset.target.iter()) {
            assert!((row[0] - (0.4 - 0.003 * cab)).abs() < 1e-12);
        }
    }

    #[test]
    fn failing_trials_are_dropped_and_counted() {
        // Cab is uniform on [10, 90]; rejecting the lower half fails ~50%.
        let failing = |p: &CanopyParameters| -> Result<Spectrum, SimulationError> {
            if p.cab < 50.0 {
                Err(SimulationError::Rejected(format!("cab {}", p.cab)))
            } else {
                red_edge_simulator(p)
            }
        };
        let profile = CropProfile::corn();
        let builder = DatasetBuilder::new(
            &profile,
            TraitSelector::CHLOROPHYLL,
            BandExtractor::from_names(&["B05"]).unwrap(),
            &failing,
        )
        .unwrap();
        let dataset = builder.build(&mut StdRng::seed_from_u64(2024), 100).unwrap();
        let report = dataset.report;
        assert_eq!(report.attempted, 100);
        assert_eq!(report.retained + report.simulation_failures, 100);
        assert_eq!(report.extraction_failures, 0);
        assert!(
            (35..=65).contains(&report.retained),
            "retained {} is outside sampling variance",
            report.retained
        );
        assert!(dataset.target.iter().all(|&cab| cab >= 50.0));
    }

    #[test]
    fn extraction_failures_are_dropped_and_counted() {
        let degenerate = |p: &CanopyParameters| -> Result<Spectrum, SimulationError> {
            if p.lai < 2.0 {
                Ok(Spectrum::flat(0.0))
            } else {
                Ok(Spectrum::flat(0.3))
            }
        };
        let profile = CropProfile::soybean();
        let builder = DatasetBuilder::new(
            &profile,
            TraitSelector::CHLOROPHYLL,
            BandExtractor::from_names(&["NDVI"]).unwrap(),
            &degenerate,
        )
        .unwrap();
        let dataset = builder.build(&mut StdRng::seed_from_u64(5), 200).unwrap();
        assert!(dataset.report.extraction_failures > 0);
        assert_eq!(dataset.report.simulation_failures, 0);
        assert_eq!(
            dataset.report.retained + dataset.report.extraction_failures,
            200
        );
    }

    #[test]
    fn too_few_trials_is_insufficient_data() {
        let profile = CropProfile::corn();
        let builder = DatasetBuilder::new(
            &profile,
            TraitSelector::CHLOROPHYLL,
            BandExtractor::from_names(&["B05"]).unwrap(),
            &red_edge_simulator,
        )
        .unwrap()
        .with_minimum_samples(2);
        match builder.build(&mut StdRng::seed_from_u64(0), 1) {
            Err(DatasetError::InsufficientData { report, required }) => {
                assert_eq!(report.retained, 1);
                assert_eq!(required, 2);
            }
            other => panic!("expected InsufficientData, got {other:?}"),
        }
    }

    #[test]
    fn derived_trait_targets_use_the_crop_map() {
        let profile = CropProfile::wheat();
        let builder = DatasetBuilder::new(
            &profile,
            TraitSelector::Nitrogen,
            BandExtractor::from_names(&["B05"]).unwrap(),
            &red_edge_simulator,
        )
        .unwrap();
        let dataset = builder.build(&mut StdRng::seed_from_u64(8), 25).unwrap();
        for (row, nitrogen) in dataset.features.rows().into_iter().zip(dataset.target.iter()) {
            let cab = (0.4 - row[0]) / 0.003;
            assert!((nitrogen - (0.045 * cab + 0.8)).abs() < 1e-9);
        }
    }

    #[derive(Default)]
    struct RecordingProgress {
        events: Mutex<Vec<String>>,
    }

    impl SweepProgress for RecordingProgress {
        fn on_sweep_start(&self, job: &str, total_trials: usize) {
            self.events
                .lock()
                .unwrap()
                .push(format!("start {job} {total_trials}"));
        }
        fn on_sweep_finish(&self, job: &str, report: &DatasetReport) {
            self.events
                .lock()
                .unwrap()
                .push(format!("finish {job} {}", report.retained));
        }
    }

    #[test]
    fn progress_observer_sees_start_and_finish() {
        let profile = CropProfile::corn();
        let builder = DatasetBuilder::new(
            &profile,
            TraitSelector::CHLOROPHYLL,
            BandExtractor::from_names(&["B05"]).unwrap(),
            &red_edge_simulator,
        )
        .unwrap();
        let progress = RecordingProgress::default();
        builder
            .build_with_progress(&mut StdRng::seed_from_u64(3), 10, &progress)
            .unwrap();
        let events = progress.events.into_inner().unwrap();
        assert_eq!(
            events,
            vec![
                "start Corn/chlorophyll 10".to_string(),
                "finish Corn/chlorophyll 10".to_string()
            ]
        );
    }
}
