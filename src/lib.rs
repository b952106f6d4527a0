#![deny(unused_variables)]
#![deny(dead_code)]
#![deny(unused_imports)]
#![deny(clippy::no_effect_underscore_binding)]

//! Calibration of portable crop trait models from simulated and measured
//! reflectance spectra.

#[path = "../calibrate/lib.rs"]
pub mod calibrate;
