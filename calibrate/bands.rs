//! # Band Extraction
//!
//! Turns a full reflectance spectrum into the handful of named features a
//! portable model consumes. Bands are read at fixed offsets
//! (`index = wavelength_nm - 400`); indices are normalized differences of two
//! bands. The same evaluation is used for measured `Wave_<nm>` tables and by
//! exported models at prediction time, so the downstream consumer computes
//! exactly what the fitter saw.

use crate::calibrate::config::ConfigurationError;
use crate::calibrate::estimate::ModelForm;
use crate::calibrate::simulator::{SPECTRUM_LEN, Spectrum};
use ndarray::Array1;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Denominators below this magnitude invalidate an index.
pub const DEGENERATE_DENOMINATOR: f64 = 1e-9;

/// Column prefix of spectral columns in ground-truth tables.
pub const WAVE_PREFIX: &str = "Wave_";

/// Sentinel-2 MSI bands by central wavelength.
pub const SENTINEL2_BANDS: [(&str, u32); 10] = [
    ("B02", 490),
    ("B03", 560),
    ("B04", 665),
    ("B05", 705),
    ("B06", 740),
    ("B07", 783),
    ("B08", 842),
    ("B8A", 865),
    ("B11", 1610),
    ("B12", 2190),
];

const RED_NM: u32 = 665;
const RED_EDGE_NM: u32 = 705;
const NIR_NM: u32 = 842;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ExtractionError {
    #[error("Spectrum has {found} values, expected {expected} (400-2500 nm at 1 nm)")]
    MalformedSpectrum { found: usize, expected: usize },

    #[error("No reflectance available at {wavelength_nm} nm for feature '{feature}'")]
    MissingValue { feature: String, wavelength_nm: u32 },

    #[error("Non-finite reflectance at {wavelength_nm} nm for feature '{feature}'")]
    NonFinite { feature: String, wavelength_nm: u32 },

    #[error("Degenerate denominator {denominator:e} while computing '{feature}'")]
    DegenerateDenominator { feature: String, denominator: f64 },
}

/// Normalized-difference indices `(nir - x) / (nir + x)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SpectralIndex {
    /// Vegetation index, `(B08 - B04) / (B08 + B04)`.
    Ndvi,
    /// Red-edge index, `(B08 - B05) / (B08 + B05)`.
    Ndre,
}

impl SpectralIndex {
    pub fn name(self) -> &'static str {
        match self {
            Self::Ndvi => "NDVI",
            Self::Ndre => "NDRE",
        }
    }

    /// `(nir, other)` wavelengths in nm.
    pub fn wavelengths(self) -> (u32, u32) {
        match self {
            Self::Ndvi => (NIR_NM, RED_NM),
            Self::Ndre => (NIR_NM, RED_EDGE_NM),
        }
    }
}

/// One named spectral feature.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Feature {
    Band { name: String, wavelength_nm: u32 },
    Index(SpectralIndex),
}

impl Feature {
    pub fn band(name: impl Into<String>, wavelength_nm: u32) -> Self {
        Feature::Band {
            name: name.into(),
            wavelength_nm,
        }
    }

    /// A `Wave_<nm>` band, the naming used by ground-truth tables.
    pub fn wave(wavelength_nm: u32) -> Self {
        Feature::band(format!("{WAVE_PREFIX}{wavelength_nm}"), wavelength_nm)
    }

    pub fn name(&self) -> &str {
        match self {
            Feature::Band { name, .. } => name,
            Feature::Index(index) => index.name(),
        }
    }

    /// Every wavelength this feature reads.
    pub fn wavelengths(&self) -> Vec<u32> {
        match self {
            Feature::Band { wavelength_nm, .. } => vec![*wavelength_nm],
            Feature::Index(index) => {
                let (nir, other) = index.wavelengths();
                vec![nir, other]
            }
        }
    }

    /// Evaluates the feature against any wavelength lookup. `reflectance`
    /// returns `None` where no value exists.
    pub fn evaluate<F>(&self, reflectance: F) -> Result<f64, ExtractionError>
    where
        F: Fn(u32) -> Option<f64>,
    {
        let read = |wavelength_nm: u32| -> Result<f64, ExtractionError> {
            let value = reflectance(wavelength_nm).ok_or_else(|| ExtractionError::MissingValue {
                feature: self.name().to_string(),
                wavelength_nm,
            })?;
            if !value.is_finite() {
                return Err(ExtractionError::NonFinite {
                    feature: self.name().to_string(),
                    wavelength_nm,
                });
            }
            Ok(value)
        };

        match self {
            Feature::Band { wavelength_nm, .. } => read(*wavelength_nm),
            Feature::Index(index) => {
                let (nir_nm, other_nm) = index.wavelengths();
                let nir = read(nir_nm)?;
                let other = read(other_nm)?;
                let denominator = nir + other;
                if denominator <= 0.0 || denominator.abs() < DEGENERATE_DENOMINATOR {
                    return Err(ExtractionError::DegenerateDenominator {
                        feature: self.name().to_string(),
                        denominator,
                    });
                }
                Ok((nir - other) / denominator)
            }
        }
    }
}

impl fmt::Display for Feature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Feature {
    type Err = ConfigurationError;

    /// Accepts `NDVI`, `NDRE`, Sentinel-2 band names (`B05`, `B8A`), and
    /// `Wave_<nm>` at any wavelength. Measured tables may reach below 400 nm;
    /// a spectrum that does not cover the wavelength fails at evaluation.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        let upper = trimmed.to_ascii_uppercase();
        match upper.as_str() {
            "NDVI" => return Ok(Feature::Index(SpectralIndex::Ndvi)),
            "NDRE" => return Ok(Feature::Index(SpectralIndex::Ndre)),
            _ => {}
        }
        if let Some(&(name, wavelength_nm)) = SENTINEL2_BANDS.iter().find(|(name, _)| *name == upper) {
            return Ok(Feature::band(name, wavelength_nm));
        }
        if let Some(digits) = trimmed.strip_prefix(WAVE_PREFIX) {
            if let Ok(wavelength_nm) = digits.parse::<u32>() {
                return Ok(Feature::wave(wavelength_nm));
            }
        }
        Err(ConfigurationError::UnknownFeature(s.to_string()))
    }
}

/// Parses a list of feature names, rejecting duplicates.
pub fn parse_features<S: AsRef<str>>(names: &[S]) -> Result<Vec<Feature>, ConfigurationError> {
    let mut features: Vec<Feature> = Vec::with_capacity(names.len());
    for name in names {
        let feature: Feature = name.as_ref().parse()?;
        if features.iter().any(|existing| existing.name() == feature.name()) {
            return Err(ConfigurationError::DuplicateFeature(feature.name().to_string()));
        }
        features.push(feature);
    }
    Ok(features)
}

/// Default feature set for a simulated calibration of the given form.
pub fn default_simulated_features(form: ModelForm) -> Vec<Feature> {
    match form {
        ModelForm::Linear => vec![Feature::band("B05", RED_EDGE_NM)],
        ModelForm::PolynomialDeg2 => vec![
            Feature::Index(SpectralIndex::Ndvi),
            Feature::Index(SpectralIndex::Ndre),
        ],
        ModelForm::Pls { .. } => SENTINEL2_BANDS
            .iter()
            .map(|&(name, wavelength_nm)| Feature::band(name, wavelength_nm))
            .chain([
                Feature::Index(SpectralIndex::Ndvi),
                Feature::Index(SpectralIndex::Ndre),
            ])
            .collect(),
    }
}

/// Default feature set for a measured calibration. An empty list means "every
/// `Wave_` column in the table".
pub fn default_measured_features(form: ModelForm) -> Vec<Feature> {
    match form {
        ModelForm::Linear => vec![Feature::wave(RED_EDGE_NM)],
        ModelForm::PolynomialDeg2 => vec![
            Feature::Index(SpectralIndex::Ndvi),
            Feature::Index(SpectralIndex::Ndre),
        ],
        ModelForm::Pls { .. } => Vec::new(),
    }
}

/// Extracts an ordered feature vector from a spectrum.
#[derive(Debug, Clone, PartialEq)]
pub struct BandExtractor {
    features: Vec<Feature>,
}

impl BandExtractor {
    pub fn new(features: Vec<Feature>) -> Self {
        Self { features }
    }

    pub fn from_names<S: AsRef<str>>(names: &[S]) -> Result<Self, ConfigurationError> {
        Ok(Self::new(parse_features(names)?))
    }

    pub fn features(&self) -> &[Feature] {
        &self.features
    }

    pub fn feature_names(&self) -> Vec<String> {
        self.features.iter().map(|f| f.name().to_string()).collect()
    }

    pub fn extract(&self, spectrum: &Spectrum) -> Result<Array1<f64>, ExtractionError> {
        if spectrum.len() != SPECTRUM_LEN {
            return Err(ExtractionError::MalformedSpectrum {
                found: spectrum.len(),
                expected: SPECTRUM_LEN,
            });
        }
        let mut row = Array1::zeros(self.features.len());
        for (slot, feature) in row.iter_mut().zip(&self.features) {
            *slot = feature.evaluate(|nm| spectrum.at_wavelength(nm))?;
        }
        Ok(row)
    }
}
