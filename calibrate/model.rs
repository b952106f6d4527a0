use crate::calibrate::bands::{ExtractionError, Feature, parse_features};
use crate::calibrate::config::ConfigurationError;
use crate::calibrate::estimate::{FitDetails, FittedModel, R2Method, polynomial_basis};
use crate::calibrate::profile::DerivedTraits;
use crate::calibrate::simulator::Spectrum;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::{self, OpenOptions};
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use thiserror::Error;

// --- Public Data Structures ---
// These structs define the portable format consumed by the downstream crop
// engine, which evaluates them without access to the simulator.

/// The regression form of an exported model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModelType {
    /// `intercept + slope * x`.
    Linear,
    /// `intercept + c · (f1, f2, f1², f1·f2, f2²)`.
    PolynomialDeg2,
    /// `intercept + c · x` over every listed feature, in raw units.
    Pls,
}

/// One fitted crop/trait model in portable form.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExportedModel {
    #[serde(rename = "type")]
    pub model_type: ModelType,
    pub crop: String,
    #[serde(rename = "trait")]
    pub trait_name: String,
    /// Input feature names, in the order the evaluator must supply them.
    pub features: Vec<String>,
    pub coefficients: Vec<f64>,
    pub intercept: f64,
    /// Not clamped; a cross-validated R² may be negative.
    pub r2: f64,
    pub r2_method: R2Method,
    pub samples: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub slope: Option<f64>,
    /// Expanded polynomial term names, one per coefficient.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub terms: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub components: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub folds: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub r2_in_sample: Option<f64>,
    /// The crop's chlorophyll to nitrogen/Vmax maps.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub derived: Option<DerivedTraits>,
}

/// Custom error type for model export, loading, and evaluation.
#[derive(Error, Debug)]
pub enum ModelError {
    #[error("Failed to read or write model file: {0}")]
    IoError(#[from] io::Error),
    #[error("Failed to encode or decode JSON model document: {0}")]
    JsonError(#[from] serde_json::Error),
    #[error("Failed to parse TOML model document: {0}")]
    TomlParseError(#[from] toml::de::Error),
    #[error("Failed to serialize model document to TOML format: {0}")]
    TomlSerializeError(#[from] toml::ser::Error),
    #[error("Prediction input has {found} features, but the model was trained on {expected}.")]
    MismatchedFeatureCount { found: usize, expected: usize },
    #[error("The {crop}/{key} model has {coefficients} coefficients, which does not fit its {features} features")]
    MalformedModel {
        crop: String,
        key: String,
        coefficients: usize,
        features: usize,
    },
    #[error("Refusing to export the {crop}/{key} model: it has non-finite coefficients")]
    NonFiniteModel { crop: String, key: String },
    #[error("The model references an unsupported feature: {0}")]
    UnsupportedFeature(#[from] ConfigurationError),
    #[error("Feature evaluation failed during prediction: {0}")]
    Extraction(#[from] ExtractionError),
}

impl ExportedModel {
    /// Converts a fit into its portable form.
    pub fn from_fitted(
        crop: &str,
        trait_name: &str,
        fitted: &FittedModel,
        derived: Option<DerivedTraits>,
    ) -> Self {
        let mut exported = ExportedModel {
            model_type: ModelType::Linear,
            crop: crop.to_string(),
            trait_name: trait_name.to_string(),
            features: fitted.feature_names.clone(),
            coefficients: fitted.coefficients.to_vec(),
            intercept: fitted.intercept,
            r2: fitted.r2,
            r2_method: fitted.r2_method,
            samples: fitted.samples,
            slope: None,
            terms: Vec::new(),
            components: None,
            folds: None,
            r2_in_sample: None,
            derived,
        };
        match &fitted.details {
            FitDetails::Linear { slope } => {
                exported.slope = Some(*slope);
            }
            FitDetails::Polynomial { terms } => {
                exported.model_type = ModelType::PolynomialDeg2;
                exported.terms = terms.clone();
            }
            FitDetails::Pls {
                components,
                folds,
                r2_in_sample,
            } => {
                exported.model_type = ModelType::Pls;
                exported.components = Some(*components);
                exported.folds = Some(*folds);
                exported.r2_in_sample = Some(*r2_in_sample);
            }
        }
        exported
    }

    fn expected_coefficients(&self) -> usize {
        match self.model_type {
            ModelType::PolynomialDeg2 if self.features.len() == 2 => 5,
            ModelType::PolynomialDeg2 => usize::MAX,
            ModelType::Linear | ModelType::Pls => self.features.len(),
        }
    }

    fn check_shape(&self, key: &str) -> Result<(), ModelError> {
        if self.coefficients.len() != self.expected_coefficients() {
            return Err(ModelError::MalformedModel {
                crop: self.crop.clone(),
                key: key.to_string(),
                coefficients: self.coefficients.len(),
                features: self.features.len(),
            });
        }
        Ok(())
    }

    /// Checks what every exported model must satisfy: finite numbers and a
    /// coefficient count that fits the feature list.
    pub fn validate(&self, key: &str) -> Result<(), ModelError> {
        if !self.intercept.is_finite() || self.coefficients.iter().any(|c| !c.is_finite()) {
            return Err(ModelError::NonFiniteModel {
                crop: self.crop.clone(),
                key: key.to_string(),
            });
        }
        self.check_shape(key)
    }

    /// Evaluates the model on a feature vector ordered as `self.features`.
    pub fn predict(&self, features: &[f64]) -> Result<f64, ModelError> {
        if features.len() != self.features.len() {
            return Err(ModelError::MismatchedFeatureCount {
                found: features.len(),
                expected: self.features.len(),
            });
        }
        self.check_shape(&self.trait_name)?;
        let linear = |inputs: &[f64]| -> f64 {
            inputs
                .iter()
                .zip(&self.coefficients)
                .map(|(x, c)| x * c)
                .sum::<f64>()
                + self.intercept
        };
        Ok(match self.model_type {
            ModelType::PolynomialDeg2 => linear(&polynomial_basis(features[0], features[1])),
            ModelType::Linear | ModelType::Pls => linear(features),
        })
    }

    /// Parses `self.features` back into evaluable features.
    pub fn parsed_features(&self) -> Result<Vec<Feature>, ModelError> {
        Ok(parse_features(&self.features)?)
    }

    /// Evaluates the model's features against any wavelength lookup, then
    /// predicts.
    pub fn predict_with<F>(&self, reflectance: F) -> Result<f64, ModelError>
    where
        F: Fn(u32) -> Option<f64>,
    {
        let values = self
            .parsed_features()?
            .iter()
            .map(|feature| feature.evaluate(&reflectance))
            .collect::<Result<Vec<f64>, ExtractionError>>()?;
        self.predict(&values)
    }

    /// Evaluates the model directly on a full spectrum.
    pub fn predict_spectrum(&self, spectrum: &Spectrum) -> Result<f64, ModelError> {
        self.predict_with(|nm| spectrum.at_wavelength(nm))
    }
}

/// Serialization format, chosen from the output path's extension.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExportFormat {
    Json,
    Toml,
}

impl ExportFormat {
    /// `.toml` selects TOML; anything else is JSON.
    pub fn from_path(path: &Path) -> Self {
        match path.extension().and_then(|ext| ext.to_str()) {
            Some(ext) if ext.eq_ignore_ascii_case("toml") => ExportFormat::Toml,
            _ => ExportFormat::Json,
        }
    }
}

/// Every exported model of a run, keyed by crop and then by model key.
///
/// Both levels are ordered maps so that serializing the same models always
/// produces the same bytes.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ModelDocument {
    crops: BTreeMap<String, BTreeMap<String, ExportedModel>>,
}

impl ModelDocument {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a model under `crop`/`key`. Non-finite models are rejected.
    pub fn insert(&mut self, key: &str, model: ExportedModel) -> Result<(), ModelError> {
        model.validate(key)?;
        self.crops
            .entry(model.crop.clone())
            .or_default()
            .insert(key.to_string(), model);
        Ok(())
    }

    pub fn get(&self, crop: &str, key: &str) -> Option<&ExportedModel> {
        self.crops.get(crop).and_then(|models| models.get(key))
    }

    pub fn crops(&self) -> impl Iterator<Item = &str> {
        self.crops.keys().map(String::as_str)
    }

    /// `(crop, key, model)` in document order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str, &ExportedModel)> {
        self.crops.iter().flat_map(|(crop, models)| {
            models
                .iter()
                .map(move |(key, model)| (crop.as_str(), key.as_str(), model))
        })
    }

    pub fn len(&self) -> usize {
        self.crops.values().map(BTreeMap::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn render(&self, format: ExportFormat) -> Result<String, ModelError> {
        let mut text = match format {
            ExportFormat::Json => serde_json::to_string_pretty(self)?,
            ExportFormat::Toml => toml::to_string_pretty(self)?,
        };
        if !text.ends_with('\n') {
            text.push('\n');
        }
        Ok(text)
    }

    pub fn parse(text: &str, format: ExportFormat) -> Result<Self, ModelError> {
        let document: ModelDocument = match format {
            ExportFormat::Json => serde_json::from_str(text)?,
            ExportFormat::Toml => toml::from_str(text)?,
        };
        for (_, key, model) in document.iter() {
            model.check_shape(key)?;
        }
        Ok(document)
    }

    /// Writes the document to a sibling temporary file, syncs it, and renames
    /// it over `path`. The destination is never left half-written.
    pub fn save(&self, path: &Path) -> Result<(), ModelError> {
        let text = self.render(ExportFormat::from_path(path))?;
        write_atomically(path, text.as_bytes())?;
        log::info!("Wrote {} models to '{}'", self.len(), path.display());
        Ok(())
    }

    /// Loads a document saved by [`ModelDocument::save`].
    pub fn load(path: &Path) -> Result<Self, ModelError> {
        let text = fs::read_to_string(path)?;
        Self::parse(&text, ExportFormat::from_path(path))
    }
}

fn write_atomically(path: &Path, contents: &[u8]) -> io::Result<()> {
    let output_dir = match path.parent() {
        Some(dir) if !dir.as_os_str().is_empty() => dir.to_path_buf(),
        _ => PathBuf::from("."),
    };
    let output_name = path.file_name().ok_or_else(|| {
        io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("Output path '{}' has no file name.", path.display()),
        )
    })?;
    fs::create_dir_all(&output_dir)?;

    let pid = std::process::id();
    let ts_nanos = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_nanos())
        .unwrap_or(0);

    let mut temp = None;
    for attempt in 0..32u32 {
        let candidate = output_dir.join(format!(
            ".{}.{}.{}.tmp",
            output_name.to_string_lossy(),
            pid,
            ts_nanos + attempt as u128
        ));
        match OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&candidate)
        {
            Ok(file) => {
                temp = Some((candidate, file));
                break;
            }
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => continue,
            Err(e) => return Err(e),
        }
    }

    let (temp_path, temp_file) = temp.ok_or_else(|| {
        io::Error::new(
            io::ErrorKind::AlreadyExists,
            format!(
                "Failed to allocate a unique temporary output file in '{}'.",
                output_dir.display()
            ),
        )
    })?;

    let write_result = (|| -> io::Result<()> {
        let mut writer = BufWriter::new(temp_file);
        writer.write_all(contents)?;
        writer.flush()?;
        let file = writer.into_inner().map_err(io::Error::other)?;
        file.sync_all()?;
        Ok(())
    })();

    if let Err(err) = write_result {
        let _ = fs::remove_file(&temp_path);
        return Err(err);
    }

    fs::rename(&temp_path, path).inspect_err(|_| {
        let _ = fs::remove_file(&temp_path);
    })
}
