#![deny(dead_code)]
#![deny(unused_imports)]

pub mod bands;
pub mod config;
pub mod data;
pub mod dataset;
pub mod estimate;
pub mod model;
pub mod pipeline;
pub mod pls;
pub mod profile;
pub mod progress;
pub mod sampler;
pub mod simulator;
