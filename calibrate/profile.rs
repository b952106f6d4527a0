//! # Crop Profiles
//!
//! A crop profile is the sampling envelope for one species: an inclusive range
//! for each of the fourteen physical parameters the canopy simulator accepts,
//! plus the linear maps that turn simulated chlorophyll into the nitrogen and
//! Vmax proxies used downstream.
//!
//! The built-in profiles follow published field ranges for each species:
//! corn and wheat are erectophile monocots, soybean is a planophile dicot
//! with a thicker leaf structure index.

use crate::calibrate::config::ConfigurationError;
use crate::calibrate::simulator::CanopyParameters;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// The fourteen physical parameters of one simulation trial.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum ParameterKind {
    /// Leaf structure index `N`.
    LeafStructure,
    /// Leaf chlorophyll content `Cab` (ug/cm2).
    Chlorophyll,
    /// Carotenoid content `Car` (ug/cm2).
    Carotenoids,
    /// Brown pigment fraction `Cbrown`.
    BrownPigments,
    /// Equivalent water thickness `Cw` (cm).
    Water,
    /// Dry matter content `Cm` (g/cm2).
    DryMatter,
    /// Leaf area index.
    LeafAreaIndex,
    /// Average leaf inclination angle (degrees).
    LeafAngle,
    /// Hotspot size parameter.
    Hotspot,
    /// Solar zenith angle (degrees).
    SolarZenith,
    /// Observer zenith angle (degrees).
    ObserverZenith,
    /// Relative azimuth between sun and sensor (degrees).
    RelativeAzimuth,
    /// Soil brightness multiplier.
    SoilBrightness,
    /// Dry/wet soil mixing fraction.
    SoilMoisture,
}

impl ParameterKind {
    pub const ALL: [ParameterKind; 14] = [
        ParameterKind::LeafStructure,
        ParameterKind::Chlorophyll,
        ParameterKind::Carotenoids,
        ParameterKind::BrownPigments,
        ParameterKind::Water,
        ParameterKind::DryMatter,
        ParameterKind::LeafAreaIndex,
        ParameterKind::LeafAngle,
        ParameterKind::Hotspot,
        ParameterKind::SolarZenith,
        ParameterKind::ObserverZenith,
        ParameterKind::RelativeAzimuth,
        ParameterKind::SoilBrightness,
        ParameterKind::SoilMoisture,
    ];

    /// The simulator's keyword for this parameter.
    pub fn name(self) -> &'static str {
        match self {
            Self::LeafStructure => "n",
            Self::Chlorophyll => "cab",
            Self::Carotenoids => "car",
            Self::BrownPigments => "cbrown",
            Self::Water => "cw",
            Self::DryMatter => "cm",
            Self::LeafAreaIndex => "lai",
            Self::LeafAngle => "lidfa",
            Self::Hotspot => "hspot",
            Self::SolarZenith => "tts",
            Self::ObserverZenith => "tto",
            Self::RelativeAzimuth => "psi",
            Self::SoilBrightness => "rsoil",
            Self::SoilMoisture => "psoil",
        }
    }

    /// Parameters whose lower bound must be strictly positive.
    pub fn requires_positive(self) -> bool {
        matches!(
            self,
            Self::LeafStructure
                | Self::Chlorophyll
                | Self::Water
                | Self::DryMatter
                | Self::LeafAreaIndex
        )
    }
}

impl fmt::Display for ParameterKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for ParameterKind {
    type Err = ConfigurationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let key = s.trim().to_ascii_lowercase();
        let kind = match key.as_str() {
            "n" | "leaf_structure" => Self::LeafStructure,
            "cab" | "chlorophyll" => Self::Chlorophyll,
            "car" | "carotenoids" => Self::Carotenoids,
            "cbrown" => Self::BrownPigments,
            "cw" | "water" => Self::Water,
            "cm" | "dry_matter" => Self::DryMatter,
            "lai" => Self::LeafAreaIndex,
            "lidfa" | "ala" | "leaf_angle" => Self::LeafAngle,
            "hspot" | "hotspot" => Self::Hotspot,
            "tts" | "solar_zenith" => Self::SolarZenith,
            "tto" | "observer_zenith" => Self::ObserverZenith,
            "psi" | "relative_azimuth" => Self::RelativeAzimuth,
            "rsoil" | "soil_brightness" => Self::SoilBrightness,
            "psoil" | "soil_moisture" => Self::SoilMoisture,
            _ => return Err(ConfigurationError::UnknownParameter(s.to_string())),
        };
        Ok(kind)
    }
}

impl TryFrom<String> for ParameterKind {
    type Error = ConfigurationError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<ParameterKind> for String {
    fn from(kind: ParameterKind) -> Self {
        kind.name().to_string()
    }
}

/// An inclusive `[low, high]` interval. Written in TOML either as a two-element
/// array or as a single number for a fixed value.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(from = "RangeSpec", into = "RangeSpec")]
pub struct ParameterRange {
    pub low: f64,
    pub high: f64,
}

impl ParameterRange {
    pub const fn new(low: f64, high: f64) -> Self {
        Self { low, high }
    }

    pub const fn fixed(value: f64) -> Self {
        Self {
            low: value,
            high: value,
        }
    }

    pub fn contains(&self, value: f64) -> bool {
        self.low <= value && value <= self.high
    }

    pub fn is_fixed(&self) -> bool {
        self.low == self.high
    }
}

#[derive(Serialize, Deserialize)]
#[serde(untagged)]
enum RangeSpec {
    Fixed(f64),
    Bounds([f64; 2]),
}

impl From<RangeSpec> for ParameterRange {
    fn from(spec: RangeSpec) -> Self {
        match spec {
            RangeSpec::Fixed(value) => ParameterRange::fixed(value),
            RangeSpec::Bounds([low, high]) => ParameterRange::new(low, high),
        }
    }
}

impl From<ParameterRange> for RangeSpec {
    fn from(range: ParameterRange) -> Self {
        if range.is_fixed() {
            RangeSpec::Fixed(range.low)
        } else {
            RangeSpec::Bounds([range.low, range.high])
        }
    }
}

/// Per-parameter sampling ranges, one field per simulator keyword.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParameterRanges {
    pub n: ParameterRange,
    pub cab: ParameterRange,
    pub car: ParameterRange,
    pub cbrown: ParameterRange,
    pub cw: ParameterRange,
    pub cm: ParameterRange,
    pub lai: ParameterRange,
    pub lidfa: ParameterRange,
    pub hspot: ParameterRange,
    pub tts: ParameterRange,
    pub tto: ParameterRange,
    pub psi: ParameterRange,
    pub rsoil: ParameterRange,
    pub psoil: ParameterRange,
}

impl ParameterRanges {
    /// Ranges shared by every built-in crop before species overrides.
    fn shared(n: ParameterRange, cab: ParameterRange, leaf_angle: f64) -> Self {
        Self {
            n,
            cab,
            car: ParameterRange::fixed(8.0),
            cbrown: ParameterRange::fixed(0.0),
            cw: ParameterRange::new(0.005, 0.02),
            cm: ParameterRange::new(0.005, 0.015),
            lai: ParameterRange::new(0.5, 7.0),
            lidfa: ParameterRange::fixed(leaf_angle),
            hspot: ParameterRange::fixed(0.01),
            tts: ParameterRange::new(30.0, 60.0),
            tto: ParameterRange::fixed(0.0),
            psi: ParameterRange::fixed(0.0),
            rsoil: ParameterRange::new(0.5, 1.5),
            psoil: ParameterRange::new(0.0, 1.0),
        }
    }

    pub fn get(&self, kind: ParameterKind) -> ParameterRange {
        *self.slot(kind)
    }

    pub fn set(&mut self, kind: ParameterKind, range: ParameterRange) {
        *self.slot_mut(kind) = range;
    }

    fn slot(&self, kind: ParameterKind) -> &ParameterRange {
        match kind {
            ParameterKind::LeafStructure => &self.n,
            ParameterKind::Chlorophyll => &self.cab,
            ParameterKind::Carotenoids => &self.car,
            ParameterKind::BrownPigments => &self.cbrown,
            ParameterKind::Water => &self.cw,
            ParameterKind::DryMatter => &self.cm,
            ParameterKind::LeafAreaIndex => &self.lai,
            ParameterKind::LeafAngle => &self.lidfa,
            ParameterKind::Hotspot => &self.hspot,
            ParameterKind::SolarZenith => &self.tts,
            ParameterKind::ObserverZenith => &self.tto,
            ParameterKind::RelativeAzimuth => &self.psi,
            ParameterKind::SoilBrightness => &self.rsoil,
            ParameterKind::SoilMoisture => &self.psoil,
        }
    }

    fn slot_mut(&mut self, kind: ParameterKind) -> &mut ParameterRange {
        match kind {
            ParameterKind::LeafStructure => &mut self.n,
            ParameterKind::Chlorophyll => &mut self.cab,
            ParameterKind::Carotenoids => &mut self.car,
            ParameterKind::BrownPigments => &mut self.cbrown,
            ParameterKind::Water => &mut self.cw,
            ParameterKind::DryMatter => &mut self.cm,
            ParameterKind::LeafAreaIndex => &mut self.lai,
            ParameterKind::LeafAngle => &mut self.lidfa,
            ParameterKind::Hotspot => &mut self.hspot,
            ParameterKind::SolarZenith => &mut self.tts,
            ParameterKind::ObserverZenith => &mut self.tto,
            ParameterKind::RelativeAzimuth => &mut self.psi,
            ParameterKind::SoilBrightness => &mut self.rsoil,
            ParameterKind::SoilMoisture => &mut self.psoil,
        }
    }
}

/// `value = slope * chlorophyll + intercept`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LinearMap {
    pub slope: f64,
    pub intercept: f64,
}

impl LinearMap {
    pub const fn new(slope: f64, intercept: f64) -> Self {
        Self { slope, intercept }
    }

    pub fn apply(&self, x: f64) -> f64 {
        self.slope * x + self.intercept
    }
}

/// Species-specific scaling from chlorophyll to the nitrogen and Vmax proxies.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DerivedTraits {
    /// Nitrogen mass (%) from Cab.
    pub nitrogen: LinearMap,
    /// Maximum carboxylation rate (umol m-2 s-1) from Cab.
    pub vmax: LinearMap,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CropProfile {
    pub name: String,
    pub ranges: ParameterRanges,
    pub derived: DerivedTraits,
}

impl CropProfile {
    pub fn corn() -> Self {
        Self {
            name: "Corn".to_string(),
            ranges: ParameterRanges::shared(
                ParameterRange::new(1.0, 1.5),
                ParameterRange::new(10.0, 90.0),
                60.0,
            ),
            derived: DerivedTraits {
                nitrogen: LinearMap::new(0.05, 1.0),
                vmax: LinearMap::new(1.5, 0.0),
            },
        }
    }

    pub fn soybean() -> Self {
        Self {
            name: "Soybean".to_string(),
            ranges: ParameterRanges::shared(
                ParameterRange::new(1.5, 2.5),
                ParameterRange::new(10.0, 90.0),
                45.0,
            ),
            derived: DerivedTraits {
                nitrogen: LinearMap::new(0.06, 1.2),
                vmax: LinearMap::new(1.6, 0.0),
            },
        }
    }

    pub fn wheat() -> Self {
        Self {
            name: "Wheat".to_string(),
            ranges: ParameterRanges::shared(
                ParameterRange::new(1.0, 2.0),
                ParameterRange::new(10.0, 80.0),
                50.0,
            ),
            derived: DerivedTraits {
                nitrogen: LinearMap::new(0.045, 0.8),
                vmax: LinearMap::new(1.3, 0.0),
            },
        }
    }

    pub fn builtin_profiles() -> Vec<CropProfile> {
        vec![Self::corn(), Self::soybean(), Self::wheat()]
    }

    /// Looks up a built-in profile by name, ignoring case.
    pub fn builtin(name: &str) -> Option<CropProfile> {
        Self::builtin_profiles()
            .into_iter()
            .find(|profile| profile.name.eq_ignore_ascii_case(name))
    }

    /// Checks every range: finite bounds, `low <= high`, and strictly positive
    /// lower bounds where the physics requires them.
    pub fn validate(&self) -> Result<(), ConfigurationError> {
        for kind in ParameterKind::ALL {
            let range = self.ranges.get(kind);
            if !range.low.is_finite() || !range.high.is_finite() {
                return Err(ConfigurationError::NonFiniteBound {
                    crop: self.name.clone(),
                    parameter: kind,
                });
            }
            if range.low > range.high {
                return Err(ConfigurationError::InvertedRange {
                    crop: self.name.clone(),
                    parameter: kind,
                    low: range.low,
                    high: range.high,
                });
            }
            if kind.requires_positive() && range.low <= 0.0 {
                return Err(ConfigurationError::NonPositiveRange {
                    crop: self.name.clone(),
                    parameter: kind,
                    low: range.low,
                });
            }
        }
        Ok(())
    }
}

/// Which quantity a calibration regresses onto.
///
/// On the simulated path every selector is read from the trial's parameter
/// vector; nitrogen and Vmax are derived from chlorophyll through the crop's
/// [`DerivedTraits`]. On the measured path only chlorophyll, nitrogen and
/// Vmax have ground-truth columns.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum TraitSelector {
    Parameter(ParameterKind),
    Nitrogen,
    Vmax,
}

impl TraitSelector {
    pub const CHLOROPHYLL: TraitSelector = TraitSelector::Parameter(ParameterKind::Chlorophyll);

    pub fn name(&self) -> String {
        match self {
            Self::Parameter(ParameterKind::Chlorophyll) => "chlorophyll".to_string(),
            Self::Parameter(kind) => kind.name().to_string(),
            Self::Nitrogen => "nitrogen".to_string(),
            Self::Vmax => "vmax".to_string(),
        }
    }

    /// The regression target for one simulated trial.
    pub fn target_value(&self, profile: &CropProfile, parameters: &CanopyParameters) -> f64 {
        let cab = parameters.get(ParameterKind::Chlorophyll);
        match self {
            Self::Parameter(kind) => parameters.get(*kind),
            Self::Nitrogen => profile.derived.nitrogen.apply(cab),
            Self::Vmax => profile.derived.vmax.apply(cab),
        }
    }

    /// Ground-truth column name in the field measurement tables.
    pub fn measured_column(&self) -> Option<&'static str> {
        match self {
            Self::Parameter(ParameterKind::Chlorophyll) => Some("Measured_Chl (ug/cm2)"),
            Self::Nitrogen => Some("measured_Nmass (%)"),
            Self::Vmax => Some("measured_Vmax (umol m-2 s-1)"),
            Self::Parameter(_) => None,
        }
    }
}

impl fmt::Display for TraitSelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name())
    }
}

impl FromStr for TraitSelector {
    type Err = ConfigurationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "nitrogen" | "nmass" => Ok(Self::Nitrogen),
            "vmax" => Ok(Self::Vmax),
            other => other
                .parse::<ParameterKind>()
                .map(Self::Parameter)
                .map_err(|_| ConfigurationError::UnknownTrait(s.to_string())),
        }
    }
}

impl TryFrom<String> for TraitSelector {
    type Error = ConfigurationError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<TraitSelector> for String {
    fn from(selector: TraitSelector) -> Self {
        selector.name()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builtin_profiles_are_valid() {
        for profile in CropProfile::builtin_profiles() {
            profile
                .validate()
                .unwrap_or_else(|e| panic!("{} should validate: {e}", profile.name));
        }
    }

    #[test]
    fn builtin_lookup_ignores_case() {
        let soy = CropProfile::builtin("soybean").expect("soybean is built in");
        assert_eq!(soy.name, "Soybean");
        assert_eq!(soy.ranges.lidfa, ParameterRange::fixed(45.0));
        assert!(CropProfile::builtin("Sorghum").is_none());
    }

    #[test]
    fn inverted_range_is_rejected() {
        let mut profile = CropProfile::corn();
        profile
            .ranges
            .set(ParameterKind::LeafAreaIndex, ParameterRange::new(7.0, 0.5));
        match profile.validate() {
            Err(ConfigurationError::InvertedRange { parameter, .. }) => {
                assert_eq!(parameter, ParameterKind::LeafAreaIndex)
            }
            other => panic!("expected InvertedRange, got {other:?}"),
        }
    }

    #[test]
    fn non_positive_lower_bound_is_rejected_only_where_required() {
        let mut profile = CropProfile::wheat();
        profile
            .ranges
            .set(ParameterKind::Water, ParameterRange::new(0.0, 0.02));
        assert!(matches!(
            profile.validate(),
            Err(ConfigurationError::NonPositiveRange {
                parameter: ParameterKind::Water,
                ..
            })
        ));

        // Soil moisture may legitimately start at zero.
        let mut profile = CropProfile::wheat();
        profile
            .ranges
            .set(ParameterKind::SoilMoisture, ParameterRange::new(0.0, 0.0));
        assert!(profile.validate().is_ok());
    }

    #[test]
    fn non_finite_bound_is_rejected() {
        let mut profile = CropProfile::corn();
        profile
            .ranges
            .set(ParameterKind::SolarZenith, ParameterRange::new(30.0, f64::NAN));
        assert!(matches!(
            profile.validate(),
            Err(ConfigurationError::NonFiniteBound { .. })
        ));
    }

    #[test]
    fn trait_selectors_parse_aliases() {
        assert_eq!(
            "chlorophyll".parse::<TraitSelector>().unwrap(),
            TraitSelector::CHLOROPHYLL
        );
        assert_eq!("Cab".parse::<TraitSelector>().unwrap(), TraitSelector::CHLOROPHYLL);
        assert_eq!("NITROGEN".parse::<TraitSelector>().unwrap(), TraitSelector::Nitrogen);
        assert_eq!(
            "lai".parse::<TraitSelector>().unwrap(),
            TraitSelector::Parameter(ParameterKind::LeafAreaIndex)
        );
        assert!(matches!(
            "yield".parse::<TraitSelector>(),
            Err(ConfigurationError::UnknownTrait(name)) if name == "yield"
        ));
    }

    #[test]
    fn derived_targets_follow_crop_maps() {
        let soy = CropProfile::soybean();
        let mut params = CanopyParameters::default();
        params.set(ParameterKind::Chlorophyll, 50.0);
        assert!((TraitSelector::Nitrogen.target_value(&soy, &params) - 4.2).abs() < 1e-12);
        assert!((TraitSelector::Vmax.target_value(&soy, &params) - 80.0).abs() < 1e-12);
        assert_eq!(TraitSelector::CHLOROPHYLL.target_value(&soy, &params), 50.0);
    }

    #[test]
    fn ranges_deserialize_from_scalars_and_pairs() {
        #[derive(Deserialize)]
        struct Holder {
            fixed: ParameterRange,
            bounds: ParameterRange,
        }
        let holder: Holder = toml::from_str("fixed = 8.0\nbounds = [10.0, 90.0]\n").unwrap();
        assert_eq!(holder.fixed, ParameterRange::fixed(8.0));
        assert_eq!(holder.bounds, ParameterRange::new(10.0, 90.0));
    }
}
