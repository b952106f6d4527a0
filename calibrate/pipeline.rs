//! # Calibration Pipeline
//!
//! One parameterized pipeline covers every crop, trait, model form, and data
//! source. Each [`CalibrationJob`] is independent: it owns its dataset and its
//! random generator, so jobs run in parallel on the rayon pool and share
//! nothing but the read-only simulator and progress observer. A failing job
//! is recorded in the summary and never aborts its siblings; the only
//! synchronization point is the final merge into one [`ModelDocument`].

use crate::calibrate::bands::{BandExtractor, Feature};
use crate::calibrate::config::ConfigurationError;
use crate::calibrate::data::{self, DataError};
use crate::calibrate::dataset::{CalibrationDataset, DatasetBuilder, DatasetError, DatasetReport};
use crate::calibrate::estimate::{self, EstimationError, ModelForm};
use crate::calibrate::model::{ExportedModel, ModelDocument, ModelError};
use crate::calibrate::profile::{CropProfile, DerivedTraits, TraitSelector};
use crate::calibrate::progress::SweepProgress;
use crate::calibrate::simulator::Simulator;
use rand::SeedableRng;
use rand::rngs::StdRng;
use rayon::prelude::*;
use std::path::PathBuf;
use thiserror::Error;

/// Where a job's samples come from.
#[derive(Debug, Clone)]
pub enum JobSource {
    /// Monte Carlo sweep through the simulator.
    Simulated { profile: CropProfile, trials: usize },
    /// One already-joined ground-truth table.
    Measured {
        path: PathBuf,
        trait_column: String,
        derived: Option<DerivedTraits>,
    },
}

/// One crop/trait/form calibration.
#[derive(Debug, Clone)]
pub struct CalibrationJob {
    pub crop: String,
    pub selector: TraitSelector,
    pub form: ModelForm,
    /// Empty on a measured job means every `Wave_` column of the table.
    pub features: Vec<Feature>,
    pub source: JobSource,
    /// Key of the model inside its crop in the exported document.
    pub key: String,
}

impl CalibrationJob {
    pub fn label(&self) -> String {
        format!("{}/{}", self.crop, self.key)
    }

    pub fn is_simulated(&self) -> bool {
        matches!(self.source, JobSource::Simulated { .. })
    }
}

#[derive(Error, Debug)]
pub enum JobFailure {
    #[error(transparent)]
    Configuration(#[from] ConfigurationError),
    #[error(transparent)]
    Dataset(#[from] DatasetError),
    #[error(transparent)]
    Data(#[from] DataError),
    #[error(transparent)]
    Estimation(#[from] EstimationError),
    #[error(transparent)]
    Export(#[from] ModelError),
}

/// A failed job, with enough context to tell which one and how far it got.
#[derive(Error, Debug)]
#[error("{crop}/{key} failed after {retained} of {attempted} samples were retained: {failure}")]
pub struct CalibrationError {
    pub crop: String,
    pub key: String,
    pub attempted: usize,
    pub retained: usize,
    #[source]
    pub failure: JobFailure,
}

#[derive(Debug)]
pub struct JobOutcome {
    pub crop: String,
    pub key: String,
    pub form: ModelForm,
    pub report: DatasetReport,
    pub result: Result<ExportedModel, CalibrationError>,
}

#[derive(Debug)]
pub struct CalibrationSummary {
    /// One entry per job, in job order.
    pub outcomes: Vec<JobOutcome>,
}

impl CalibrationSummary {
    /// Merges every successful job into one document.
    pub fn document(&self) -> Result<ModelDocument, ModelError> {
        let mut document = ModelDocument::new();
        for outcome in &self.outcomes {
            if let Ok(model) = &outcome.result {
                document.insert(&outcome.key, model.clone())?;
            }
        }
        Ok(document)
    }

    pub fn failures(&self) -> impl Iterator<Item = &CalibrationError> {
        self.outcomes
            .iter()
            .filter_map(|outcome| outcome.result.as_ref().err())
    }

    pub fn all_succeeded(&self) -> bool {
        self.failures().next().is_none()
    }
}

const GOLDEN_GAMMA: u64 = 0x9E37_79B9_7F4A_7C15;

/// One SplitMix64 step.
fn splitmix64(state: u64) -> u64 {
    let mut z = state.wrapping_add(GOLDEN_GAMMA);
    z = (z ^ (z >> 30)).wrapping_mul(0xBF58_476D_1CE4_E5B9);
    z = (z ^ (z >> 27)).wrapping_mul(0x94D0_49BB_1331_11EB);
    z ^ (z >> 31)
}

/// Seed for job `index` of a run seeded with `base`.
pub fn job_seed(base: u64, index: usize) -> u64 {
    splitmix64(base.wrapping_add((index as u64).wrapping_mul(GOLDEN_GAMMA)))
}

fn job_rng(seed: Option<u64>, index: usize) -> StdRng {
    match seed {
        Some(base) => StdRng::seed_from_u64(job_seed(base, index)),
        None => StdRng::from_entropy(),
    }
}

/// Runs every job on the current rayon pool and collects the outcomes.
///
/// Fails up front, before any simulation, when simulated jobs are requested
/// without a simulator.
pub fn run_calibration(
    jobs: &[CalibrationJob],
    simulator: Option<&dyn Simulator>,
    seed: Option<u64>,
    progress: &dyn SweepProgress,
) -> Result<CalibrationSummary, ConfigurationError> {
    if simulator.is_none() && jobs.iter().any(CalibrationJob::is_simulated) {
        return Err(ConfigurationError::MissingSimulator);
    }
    log::info!(
        "Running {} calibration jobs on {} threads",
        jobs.len(),
        rayon::current_num_threads()
    );

    let outcomes: Vec<JobOutcome> = jobs
        .par_iter()
        .enumerate()
        .map(|(index, job)| {
            let mut rng = job_rng(seed, index);
            run_job(job, simulator, &mut rng, progress)
        })
        .collect();

    let failed = outcomes.iter().filter(|outcome| outcome.result.is_err()).count();
    if failed > 0 {
        log::warn!("{failed} of {} calibration jobs failed", outcomes.len());
    }
    Ok(CalibrationSummary { outcomes })
}

/// Runs one job to completion on the calling thread.
pub fn run_job(
    job: &CalibrationJob,
    simulator: Option<&dyn Simulator>,
    rng: &mut StdRng,
    progress: &dyn SweepProgress,
) -> JobOutcome {
    let mut report = DatasetReport::default();
    let result = calibrate_job(job, simulator, rng, progress, &mut report).map_err(|failure| {
        let error = CalibrationError {
            crop: job.crop.clone(),
            key: job.key.clone(),
            attempted: report.attempted,
            retained: report.retained,
            failure,
        };
        log::warn!("{error}");
        error
    });
    JobOutcome {
        crop: job.crop.clone(),
        key: job.key.clone(),
        form: job.form,
        report,
        result,
    }
}

fn calibrate_job(
    job: &CalibrationJob,
    simulator: Option<&dyn Simulator>,
    rng: &mut StdRng,
    progress: &dyn SweepProgress,
    report: &mut DatasetReport,
) -> Result<ExportedModel, JobFailure> {
    let minimum_samples = job.form.minimum_samples();
    let (dataset, derived) = match &job.source {
        JobSource::Simulated { profile, trials } => {
            let simulator = simulator.ok_or(ConfigurationError::MissingSimulator)?;
            let builder = DatasetBuilder::new(
                profile,
                job.selector,
                BandExtractor::new(job.features.clone()),
                simulator,
            )?
            .with_minimum_samples(minimum_samples)
            .with_label(job.label());
            let dataset = builder
                .build_with_progress(rng, *trials, progress)
                .inspect_err(|e| {
                    if let DatasetError::InsufficientData { report: partial, .. } = e {
                        *report = *partial;
                    }
                })?;
            (dataset, Some(profile.derived))
        }
        JobSource::Measured {
            path,
            trait_column,
            derived,
        } => {
            let dataset = data::load_measured(path, trait_column, &job.features, minimum_samples)
                .inspect_err(|e| {
                    if let DataError::InsufficientRows { report: partial, .. } = e {
                        *report = *partial;
                    }
                })?;
            (dataset, *derived)
        }
    };
    *report = dataset.report;

    let fitted = fit(job, &dataset)?;
    let exported = ExportedModel::from_fitted(&job.crop, &job.selector.name(), &fitted, derived);
    exported.validate(&job.key)?;

    log::info!(
        "{}: {} fit on {}/{} samples, R² = {:.4} ({:?})",
        job.label(),
        job.form,
        report.retained,
        report.attempted,
        exported.r2,
        exported.r2_method
    );
    Ok(exported)
}

fn fit(job: &CalibrationJob, dataset: &CalibrationDataset) -> Result<estimate::FittedModel, EstimationError> {
    estimate::fit_model(
        job.form,
        dataset.features.view(),
        dataset.target.view(),
        &dataset.feature_names,
    )
}
