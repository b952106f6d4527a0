//! # Run Configuration
//!
//! One TOML document describes a whole calibration run: which crops to
//! simulate, which traits and model forms to fit, where field measurements
//! live, how to launch the simulator, and where the exported document goes.
//! The document is parsed and resolved into a flat list of
//! [`CalibrationJob`]s once, before any simulation starts, so every
//! configuration mistake surfaces as a [`ConfigurationError`] up front.
//!
//! ```toml
//! output = "calibration_results.json"
//! seed = 42
//! trials = 10000
//!
//! [simulator]
//! program = "prosail-run"
//! style = "named"
//!
//! [[crops]]
//! name = "Sorghum"
//! base = "Corn"
//! ranges = { cab = [15.0, 70.0], lidfa = 55.0 }
//!
//! [[calibrations]]
//! crops = ["Corn", "Soybean", "Wheat", "Sorghum"]
//! traits = ["chlorophyll", "nitrogen"]
//! forms = ["linear", "pls"]
//!
//! [[measured]]
//! crop = "Corn"
//! path = "data/corn_ground_truth.csv"
//! traits = ["nitrogen"]
//! forms = ["linear", "polynomial_deg2"]
//! ```

use crate::calibrate::bands::{
    Feature, default_measured_features, default_simulated_features, parse_features,
};
use crate::calibrate::estimate::{DEFAULT_PLS_COMPONENTS, DEFAULT_PLS_FOLDS, ModelForm};
use crate::calibrate::pipeline::{CalibrationJob, JobSource};
use crate::calibrate::profile::{CropProfile, DerivedTraits, ParameterKind, ParameterRange, TraitSelector};
use crate::calibrate::simulator::SimulatorCommand;
use itertools::iproduct;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigurationError {
    #[error("Unknown simulator parameter '{0}'")]
    UnknownParameter(String),

    #[error("Unknown trait selector '{0}'; expected chlorophyll, nitrogen, vmax, or a parameter name")]
    UnknownTrait(String),

    #[error("Unknown feature '{0}'; expected NDVI, NDRE, a Sentinel-2 band name, or Wave_<nm>")]
    UnknownFeature(String),

    #[error("Feature '{0}' is listed more than once")]
    DuplicateFeature(String),

    #[error("Unknown crop '{0}'; define it under [[crops]] or use Corn, Soybean, or Wheat")]
    UnknownCrop(String),

    #[error("Invalid model form: {0}")]
    InvalidModelForm(String),

    #[error("{crop}: range for '{parameter}' is inverted ({low} > {high})")]
    InvertedRange {
        crop: String,
        parameter: ParameterKind,
        low: f64,
        high: f64,
    },

    #[error("{crop}: '{parameter}' must be strictly positive, but its lower bound is {low}")]
    NonPositiveRange {
        crop: String,
        parameter: ParameterKind,
        low: f64,
    },

    #[error("{crop}: range for '{parameter}' has a non-finite bound")]
    NonFiniteBound { crop: String, parameter: ParameterKind },

    #[error("Model form '{form}' needs exactly {expected} features, but {found} were configured")]
    FeatureCount {
        form: &'static str,
        expected: usize,
        found: usize,
    },

    #[error("PLS with {components} components needs at least that many features, but only {features} were configured")]
    TooFewFeaturesForPls { components: usize, features: usize },

    #[error("Trait '{0}' has no ground-truth column; set trait_column explicitly")]
    NoMeasuredColumn(String),

    #[error("{crop}: trait_column can only be set when exactly one trait is measured")]
    AmbiguousTraitColumn { crop: String },

    #[error("{crop}: model key '{key}' is produced by more than one calibration")]
    DuplicateJob { crop: String, key: String },

    #[error("The trial count must be positive")]
    ZeroTrials,

    #[error("The configuration requests no calibrations")]
    NoJobs,

    #[error("Simulated calibrations were requested, but no [simulator] command is configured")]
    MissingSimulator,

    #[error("Failed to read configuration file '{}': {source}", .path.display())]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Failed to parse configuration: {0}")]
    Parse(#[from] toml::de::Error),
}

/// Appended to a measured model key that would otherwise collide with a
/// simulated one.
pub const MEASURED_SUFFIX: &str = "_measured";

fn default_output() -> PathBuf {
    PathBuf::from("calibration_results.json")
}

fn default_trials() -> usize {
    10_000
}

fn default_traits() -> Vec<TraitSelector> {
    vec![TraitSelector::CHLOROPHYLL]
}

fn default_forms() -> Vec<String> {
    vec!["linear".to_string()]
}

/// PLS hyperparameters applied to every `pls` form that does not name its own
/// component count.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PlsSettings {
    #[serde(default = "default_components")]
    pub components: usize,
    #[serde(default = "default_folds")]
    pub folds: usize,
}

fn default_components() -> usize {
    DEFAULT_PLS_COMPONENTS
}

fn default_folds() -> usize {
    DEFAULT_PLS_FOLDS
}

impl Default for PlsSettings {
    fn default() -> Self {
        Self {
            components: DEFAULT_PLS_COMPONENTS,
            folds: DEFAULT_PLS_FOLDS,
        }
    }
}

impl PlsSettings {
    /// Parses a form name; bare `pls` takes these settings, `pls:<k>` keeps
    /// its own component count and takes the configured fold count.
    pub fn parse_form(&self, name: &str) -> Result<ModelForm, ConfigurationError> {
        let form = match name.parse::<ModelForm>()? {
            ModelForm::Pls { components, .. } => {
                let components = if name.trim().eq_ignore_ascii_case("pls") {
                    self.components
                } else {
                    components
                };
                ModelForm::Pls {
                    components,
                    folds: self.folds,
                }
            }
            other => other,
        };
        form.validate()?;
        Ok(form)
    }
}

/// A crop defined in the configuration file. Ranges not listed are inherited
/// from `base` (or from the built-in profile of the same name).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CropSpec {
    pub name: String,
    #[serde(default)]
    pub base: Option<String>,
    #[serde(default)]
    pub ranges: BTreeMap<String, ParameterRange>,
    #[serde(default)]
    pub derived: Option<DerivedTraits>,
}

impl CropSpec {
    pub fn resolve(&self) -> Result<CropProfile, ConfigurationError> {
        let base = self.base.as_deref().unwrap_or(&self.name);
        let mut profile =
            CropProfile::builtin(base).ok_or_else(|| ConfigurationError::UnknownCrop(base.to_string()))?;
        profile.name = self.name.clone();
        for (parameter, range) in &self.ranges {
            profile.ranges.set(parameter.parse()?, *range);
        }
        if let Some(derived) = self.derived {
            profile.derived = derived;
        }
        profile.validate()?;
        Ok(profile)
    }
}

/// Crops × traits × forms fitted on simulated data.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SimulatedCalibration {
    pub crops: Vec<String>,
    #[serde(default = "default_traits")]
    pub traits: Vec<TraitSelector>,
    #[serde(default = "default_forms")]
    pub forms: Vec<String>,
    /// Empty means the form's default feature set.
    #[serde(default)]
    pub features: Vec<String>,
    /// Overrides the run-wide trial count.
    #[serde(default)]
    pub trials: Option<usize>,
}

/// Traits × forms fitted on one already-joined ground-truth table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MeasuredCalibration {
    pub crop: String,
    pub path: PathBuf,
    #[serde(default = "default_traits")]
    pub traits: Vec<TraitSelector>,
    #[serde(default)]
    pub trait_column: Option<String>,
    #[serde(default = "default_forms")]
    pub forms: Vec<String>,
    /// Empty means the form's default; for PLS that is every `Wave_` column.
    #[serde(default)]
    pub features: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CalibrationConfig {
    #[serde(default = "default_output")]
    pub output: PathBuf,
    /// Base seed; `None` seeds every job from OS entropy.
    #[serde(default)]
    pub seed: Option<u64>,
    #[serde(default = "default_trials")]
    pub trials: usize,
    #[serde(default)]
    pub simulator: Option<SimulatorCommand>,
    #[serde(default)]
    pub pls: PlsSettings,
    #[serde(default)]
    pub crops: Vec<CropSpec>,
    #[serde(default)]
    pub calibrations: Vec<SimulatedCalibration>,
    #[serde(default)]
    pub measured: Vec<MeasuredCalibration>,
}

impl Default for CalibrationConfig {
    /// Chlorophyll against B05 for the three built-in crops.
    fn default() -> Self {
        Self {
            output: default_output(),
            seed: None,
            trials: default_trials(),
            simulator: None,
            pls: PlsSettings::default(),
            crops: Vec::new(),
            calibrations: vec![SimulatedCalibration {
                crops: CropProfile::builtin_profiles()
                    .into_iter()
                    .map(|profile| profile.name)
                    .collect(),
                traits: default_traits(),
                forms: default_forms(),
                features: Vec::new(),
                trials: None,
            }],
            measured: Vec::new(),
        }
    }
}

impl CalibrationConfig {
    pub fn from_path(path: &Path) -> Result<Self, ConfigurationError> {
        let text = fs::read_to_string(path).map_err(|source| ConfigurationError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml(&text)
    }

    pub fn from_toml(text: &str) -> Result<Self, ConfigurationError> {
        Ok(toml::from_str(text)?)
    }

    /// Looks a crop up among the configured crops first, then the built-ins.
    pub fn profile(&self, name: &str) -> Result<CropProfile, ConfigurationError> {
        match self
            .crops
            .iter()
            .find(|spec| spec.name.eq_ignore_ascii_case(name))
        {
            Some(spec) => spec.resolve(),
            None => {
                let profile = CropProfile::builtin(name)
                    .ok_or_else(|| ConfigurationError::UnknownCrop(name.to_string()))?;
                profile.validate()?;
                Ok(profile)
            }
        }
    }

    /// Expands the configuration into independent jobs and checks everything
    /// that can be checked without running the simulator.
    pub fn resolve(&self) -> Result<Vec<CalibrationJob>, ConfigurationError> {
        let mut jobs = Vec::new();

        for calibration in &self.calibrations {
            let trials = calibration.trials.unwrap_or(self.trials);
            if trials == 0 {
                return Err(ConfigurationError::ZeroTrials);
            }
            let forms = self.parse_forms(&calibration.forms)?;
            let profiles = calibration
                .crops
                .iter()
                .map(|name| self.profile(name))
                .collect::<Result<Vec<_>, _>>()?;

            for (profile, selector, form) in iproduct!(&profiles, &calibration.traits, &forms) {
                let features = if calibration.features.is_empty() {
                    default_simulated_features(*form)
                } else {
                    parse_features(&calibration.features)?
                };
                check_feature_count(*form, &features)?;
                jobs.push(CalibrationJob {
                    crop: profile.name.clone(),
                    selector: *selector,
                    form: *form,
                    features,
                    source: JobSource::Simulated {
                        profile: profile.clone(),
                        trials,
                    },
                    key: selector.name(),
                });
            }
        }

        for measured in &self.measured {
            if measured.trait_column.is_some() && measured.traits.len() != 1 {
                return Err(ConfigurationError::AmbiguousTraitColumn {
                    crop: measured.crop.clone(),
                });
            }
            let forms = self.parse_forms(&measured.forms)?;
            let profile = self.profile(&measured.crop).ok();
            let crop = profile
                .as_ref()
                .map_or_else(|| measured.crop.clone(), |profile| profile.name.clone());
            let derived = profile.map(|profile| profile.derived);

            for (selector, form) in iproduct!(&measured.traits, &forms) {
                let trait_column = match &measured.trait_column {
                    Some(column) => column.clone(),
                    None => selector
                        .measured_column()
                        .ok_or_else(|| ConfigurationError::NoMeasuredColumn(selector.name()))?
                        .to_string(),
                };
                let features = if measured.features.is_empty() {
                    default_measured_features(*form)
                } else {
                    parse_features(&measured.features)?
                };
                // An empty list expands to every Wave_ column once the table is read.
                if !features.is_empty() {
                    check_feature_count(*form, &features)?;
                }
                jobs.push(CalibrationJob {
                    crop: crop.clone(),
                    selector: *selector,
                    form: *form,
                    features,
                    source: JobSource::Measured {
                        path: measured.path.clone(),
                        trait_column,
                        derived,
                    },
                    key: selector.name(),
                });
            }
        }

        if jobs.is_empty() {
            return Err(ConfigurationError::NoJobs);
        }
        qualify_keys(&mut jobs)?;
        log::info!("Resolved {} calibration jobs", jobs.len());
        Ok(jobs)
    }

    fn parse_forms(&self, names: &[String]) -> Result<Vec<ModelForm>, ConfigurationError> {
        names.iter().map(|name| self.pls.parse_form(name)).collect()
    }
}

fn check_feature_count(form: ModelForm, features: &[Feature]) -> Result<(), ConfigurationError> {
    match form {
        ModelForm::Pls { components, .. } if features.len() < components => {
            Err(ConfigurationError::TooFewFeaturesForPls {
                components,
                features: features.len(),
            })
        }
        _ => match form.required_features() {
            Some(expected) if expected != features.len() => Err(ConfigurationError::FeatureCount {
                form: form.tag(),
                expected,
                found: features.len(),
            }),
            _ => Ok(()),
        },
    }
}

/// A crop/trait fitted with a single form is keyed by the trait name alone;
/// when several forms of one source share a crop/trait, each key gains the
/// form tag. A measured key that still matches a simulated one gains
/// `_measured`.
fn qualify_keys(jobs: &mut [CalibrationJob]) -> Result<(), ConfigurationError> {
    let mut shared: HashMap<(String, TraitSelector, bool), usize> = HashMap::new();
    for job in jobs.iter() {
        *shared
            .entry((job.crop.clone(), job.selector, job.is_simulated()))
            .or_default() += 1;
    }
    for job in jobs.iter_mut() {
        if shared[&(job.crop.clone(), job.selector, job.is_simulated())] > 1 {
            job.key = format!("{}_{}", job.selector.name(), job.form.tag());
        }
    }

    let simulated: HashSet<(String, String)> = jobs
        .iter()
        .filter(|job| job.is_simulated())
        .map(|job| (job.crop.clone(), job.key.clone()))
        .collect();
    for job in jobs.iter_mut().filter(|job| !job.is_simulated()) {
        if simulated.contains(&(job.crop.clone(), job.key.clone())) {
            job.key.push_str(MEASURED_SUFFIX);
        }
    }

    let mut seen: HashMap<(String, String), usize> = HashMap::new();
    for job in jobs.iter() {
        let count = seen.entry((job.crop.clone(), job.key.clone())).or_default();
        *count += 1;
        if *count > 1 {
            return Err(ConfigurationError::DuplicateJob {
                crop: job.crop.clone(),
                key: job.key.clone(),
            });
        }
    }
    Ok(())
}
