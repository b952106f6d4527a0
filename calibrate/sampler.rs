//! Pure uniform Monte Carlo over a crop's parameter envelope.
//!
//! Every parameter of every trial is an independent `Uniform(low, high)`
//! draw. There is no correlation structure and no stratification; the caller
//! owns the random source so that parallel jobs can each carry their own
//! seeded generator.

use crate::calibrate::config::ConfigurationError;
use crate::calibrate::profile::{CropProfile, ParameterKind};
use crate::calibrate::simulator::CanopyParameters;
use rand::Rng;

#[derive(Debug, Clone, Copy)]
pub struct ParameterSampler<'a> {
    profile: &'a CropProfile,
}

impl<'a> ParameterSampler<'a> {
    /// Validates the profile once; draws never re-check ranges.
    pub fn new(profile: &'a CropProfile) -> Result<Self, ConfigurationError> {
        profile.validate()?;
        Ok(Self { profile })
    }

    pub fn profile(&self) -> &'a CropProfile {
        self.profile
    }

    /// Draws one trial.
    pub fn draw<R: Rng>(&self, rng: &mut R) -> CanopyParameters {
        let mut parameters = CanopyParameters::default();
        for kind in ParameterKind::ALL {
            let range = self.profile.ranges.get(kind);
            let value = if range.is_fixed() {
                range.low
            } else {
                rng.gen_range(range.low..=range.high)
            };
            parameters.set(kind, value);
        }
        parameters
    }

    /// Draws `trials` independent trials.
    pub fn sample<R: Rng>(&self, rng: &mut R, trials: usize) -> Vec<CanopyParameters> {
        (0..trials).map(|_| self.draw(rng)).collect()
    }
}
