//! # Simulator Adapter
//!
//! The leaf/canopy radiative-transfer model is an external black box. This
//! module fixes the contract the rest of the pipeline programs against: a
//! named parameter set goes in, a 2101-value reflectance spectrum covering
//! 400-2500 nm at 1 nm comes out, or the trial fails with a
//! [`SimulationError`] that the dataset builder absorbs.
//!
//! [`CommandSimulator`] drives an out-of-process simulator over stdin/stdout.
//! Whether that executable expects keyword arguments or the sixteen-slot
//! positional layout of older library revisions is a detail of its
//! [`ArgumentStyle`]; callers only ever see [`CanopyParameters`].

use crate::calibrate::profile::ParameterKind;
use serde::{Deserialize, Serialize};
use std::io::{self, Write};
use std::path::PathBuf;
use std::process::{Child, Command, Stdio};
use thiserror::Error;

/// First wavelength of a simulated spectrum, in nm.
pub const SPECTRUM_START_NM: u32 = 400;
/// Last wavelength of a simulated spectrum, in nm.
pub const SPECTRUM_END_NM: u32 = 2500;
/// Number of samples in a spectrum at 1 nm resolution.
pub const SPECTRUM_LEN: usize = (SPECTRUM_END_NM - SPECTRUM_START_NM + 1) as usize;

/// One fully specified parameter vector, keyed by simulator keyword.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct CanopyParameters {
    pub n: f64,
    pub cab: f64,
    pub car: f64,
    pub cbrown: f64,
    pub cw: f64,
    pub cm: f64,
    pub lai: f64,
    pub lidfa: f64,
    pub hspot: f64,
    pub tts: f64,
    pub tto: f64,
    pub psi: f64,
    pub rsoil: f64,
    pub psoil: f64,
}

impl CanopyParameters {
    pub fn get(&self, kind: ParameterKind) -> f64 {
        match kind {
            ParameterKind::LeafStructure => self.n,
            ParameterKind::Chlorophyll => self.cab,
            ParameterKind::Carotenoids => self.car,
            ParameterKind::BrownPigments => self.cbrown,
            ParameterKind::Water => self.cw,
            ParameterKind::DryMatter => self.cm,
            ParameterKind::LeafAreaIndex => self.lai,
            ParameterKind::LeafAngle => self.lidfa,
            ParameterKind::Hotspot => self.hspot,
            ParameterKind::SolarZenith => self.tts,
            ParameterKind::ObserverZenith => self.tto,
            ParameterKind::RelativeAzimuth => self.psi,
            ParameterKind::SoilBrightness => self.rsoil,
            ParameterKind::SoilMoisture => self.psoil,
        }
    }

    pub fn set(&mut self, kind: ParameterKind, value: f64) {
        let slot = match kind {
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
        };
        *slot = value;
    }
}

/// A reflectance spectrum indexed by `wavelength_nm - 400`.
#[repr(transparent)]
#[derive(Clone, Debug, PartialEq)]
pub struct Spectrum(Vec<f64>);

impl Spectrum {
    pub fn new(values: Vec<f64>) -> Self {
        Self(values)
    }

    /// A spectrum with the same reflectance at every wavelength.
    pub fn flat(value: f64) -> Self {
        Self(vec![value; SPECTRUM_LEN])
    }

    pub fn values(&self) -> &[f64] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Reflectance at a whole-nanometre wavelength, if the spectrum covers it.
    pub fn at_wavelength(&self, wavelength_nm: u32) -> Option<f64> {
        let offset = wavelength_nm.checked_sub(SPECTRUM_START_NM)?;
        self.0.get(offset as usize).copied()
    }

    pub fn set_wavelength(&mut self, wavelength_nm: u32, value: f64) {
        if let Some(offset) = wavelength_nm.checked_sub(SPECTRUM_START_NM) {
            if let Some(slot) = self.0.get_mut(offset as usize) {
                *slot = value;
            }
        }
    }

    pub fn into_inner(self) -> Vec<f64> {
        self.0
    }
}

#[derive(Error, Debug)]
pub enum SimulationError {
    #[error("The simulator rejected the parameter vector: {0}")]
    Rejected(String),

    #[error("Failed to launch simulator '{program}': {source}")]
    Launch {
        program: String,
        source: io::Error,
    },

    #[error("Simulator I/O failed: {0}")]
    Io(#[from] io::Error),

    #[error("Simulator exited with {status}: {stderr}")]
    ExitStatus { status: String, stderr: String },

    #[error("Simulator output is not a JSON array of reflectances: {0}")]
    Decode(#[from] serde_json::Error),

    #[error("Simulator returned {found} reflectance values, expected {expected}")]
    WrongLength { found: usize, expected: usize },

    #[error("Simulator returned a non-finite reflectance at {wavelength_nm} nm")]
    NonFinite { wavelength_nm: u32 },
}

/// The radiative-transfer boundary. Implementations must be pure functions of
/// their input; they are shared across parallel calibration jobs.
pub trait Simulator: Sync {
    fn simulate(&self, parameters: &CanopyParameters) -> Result<Spectrum, SimulationError>;
}

impl<F> Simulator for F
where
    F: Fn(&CanopyParameters) -> Result<Spectrum, SimulationError> + Sync,
{
    fn simulate(&self, parameters: &CanopyParameters) -> Result<Spectrum, SimulationError> {
        self(parameters)
    }
}

/// How the external simulator expects its parameters on stdin.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArgumentStyle {
    /// One JSON object keyed by parameter name.
    #[default]
    Named,
    /// The sixteen-slot array `n, cab, car, cbrown, cw, cm, lai, lidfa, lidfb,
    /// hspot, tts, tto, psi, rsoil, psoil, rsoil0` with `rsoil0 = null`.
    Positional,
}

fn default_prospect_version() -> String {
    "D".to_string()
}

/// Configuration for an out-of-process simulator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SimulatorCommand {
    pub program: PathBuf,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub style: ArgumentStyle,
    #[serde(default = "default_prospect_version")]
    pub prospect_version: String,
}

impl SimulatorCommand {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            style: ArgumentStyle::Named,
            prospect_version: default_prospect_version(),
        }
    }
}

/// Ellipsoidal (Campbell) leaf angle distribution: `lidfa` is the mean angle
/// and `lidfb` is unused.
const LEAF_DISTRIBUTION_TYPE: u8 = 2;
const LEAF_DISTRIBUTION_B: f64 = 0.0;

#[derive(Serialize)]
struct NamedRequest<'a> {
    #[serde(flatten)]
    parameters: &'a CanopyParameters,
    lidfb: f64,
    typelidf: u8,
    prospect_version: &'a str,
}

/// Runs one simulator process per trial.
#[derive(Debug, Clone)]
pub struct CommandSimulator {
    command: SimulatorCommand,
}

impl CommandSimulator {
    pub fn new(command: SimulatorCommand) -> Self {
        Self { command }
    }

    pub fn command(&self) -> &SimulatorCommand {
        &self.command
    }

    /// The stdin payload for one trial.
    pub fn encode_request(&self, p: &CanopyParameters) -> Result<String, SimulationError> {
        let request = match self.command.style {
            ArgumentStyle::Named => serde_json::to_string(&NamedRequest {
                parameters: p,
                lidfb: LEAF_DISTRIBUTION_B,
                typelidf: LEAF_DISTRIBUTION_TYPE,
                prospect_version: &self.command.prospect_version,
            })?,
            ArgumentStyle::Positional => serde_json::to_string(&serde_json::json!([
                p.n,
                p.cab,
                p.car,
                p.cbrown,
                p.cw,
                p.cm,
                p.lai,
                p.lidfa,
                LEAF_DISTRIBUTION_B,
                p.hspot,
                p.tts,
                p.tto,
                p.psi,
                p.rsoil,
                p.psoil,
                serde_json::Value::Null,
            ]))?,
        };
        Ok(request)
    }

    /// Decodes and checks the simulator's stdout.
    pub fn decode_response(&self, stdout: &[u8]) -> Result<Spectrum, SimulationError> {
        let values: Vec<f64> = serde_json::from_slice(stdout)?;
        if values.len() != SPECTRUM_LEN {
            return Err(SimulationError::WrongLength {
                found: values.len(),
                expected: SPECTRUM_LEN,
            });
        }
        if let Some(offset) = values.iter().position(|v| !v.is_finite()) {
            return Err(SimulationError::NonFinite {
                wavelength_nm: SPECTRUM_START_NM + offset as u32,
            });
        }
        Ok(Spectrum::new(values))
    }
}

impl Simulator for CommandSimulator {
    fn simulate(&self, parameters: &CanopyParameters) -> Result<Spectrum, SimulationError> {
        let request = self.encode_request(parameters)?;

        let mut child = Command::new(&self.command.program)
            .args(&self.command.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|source| SimulationError::Launch {
                program: self.command.program.display().to_string(),
                source,
            })?;

        if let Some(mut stdin) = child.stdin.take() {
            // A simulator that exits without reading its input reports through
            // its exit status instead.
            if let Err(e) = stdin.write_all(request.as_bytes()) {
                if e.kind() != io::ErrorKind::BrokenPipe {
                    drop(stdin);
                    reap(&mut child);
                    return Err(e.into());
                }
            }
        }

        let output = child.wait_with_output()?;
        if !output.status.success() {
            return Err(SimulationError::ExitStatus {
                status: output.status.to_string(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        self.decode_response(&output.stdout)
    }
}

/// Kills and waits on a child whose request could not be delivered.
fn reap(child: &mut Child) {
    if let Err(e) = child.kill() {
        log::debug!("Simulator process already exited: {e}");
    }
    if let Err(e) = child.wait() {
        log::warn!("Failed to reap simulator process: {e}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_parameters() -> CanopyParameters {
        CanopyParameters {
            n: 1.5,
            cab: 40.0,
            car: 8.0,
            cbrown: 0.0,
            cw: 0.01,
            cm: 0.009,
            lai: 3.0,
            lidfa: 60.0,
            hspot: 0.01,
            tts: 45.0,
            tto: 0.0,
            psi: 0.0,
            rsoil: 1.0,
            psoil: 0.5,
        }
    }

    #[test]
    fn spectrum_indexing_starts_at_400_nm() {
        let mut spectrum = Spectrum::flat(0.1);
        spectrum.set_wavelength(705, 0.42);
        assert_eq!(spectrum.len(), 2101);
        assert_eq!(spectrum.values()[305], 0.42);
        assert_eq!(spectrum.at_wavelength(705), Some(0.42));
        assert_eq!(spectrum.at_wavelength(2500), Some(0.1));
        assert_eq!(spectrum.at_wavelength(2501), None);
        assert_eq!(spectrum.at_wavelength(399), None);
    }

    #[test]
    fn named_request_carries_every_keyword() {
        let simulator = CommandSimulator::new(SimulatorCommand::new("prosail"));
        let request = simulator.encode_request(&sample_parameters()).unwrap();
        let value: serde_json::Value = serde_json::from_str(&request).unwrap();
        for kind in ParameterKind::ALL {
            assert!(
                value.get(kind.name()).is_some(),
                "missing keyword {}",
                kind.name()
            );
        }
        assert_eq!(value["cab"], 40.0);
        assert_eq!(value["typelidf"], 2);
        assert_eq!(value["prospect_version"], "D");
    }

    #[test]
    fn positional_request_uses_sixteen_slots() {
        let mut command = SimulatorCommand::new("prosail");
        command.style = ArgumentStyle::Positional;
        let simulator = CommandSimulator::new(command);
        let request = simulator.encode_request(&sample_parameters()).unwrap();
        let value: Vec<serde_json::Value> = serde_json::from_str(&request).unwrap();
        assert_eq!(value.len(), 16);
        assert_eq!(value[1], 40.0);
        assert_eq!(value[7], 60.0);
        assert_eq!(value[13], 1.0);
        assert!(value[15].is_null());
    }

    #[test]
    fn response_length_is_checked() {
        let simulator = CommandSimulator::new(SimulatorCommand::new("prosail"));
        match simulator.decode_response(b"[0.1, 0.2, 0.3]") {
            Err(SimulationError::WrongLength { found, expected }) => {
                assert_eq!(found, 3);
                assert_eq!(expected, SPECTRUM_LEN);
            }
            other => panic!("expected WrongLength, got {other:?}"),
        }
        assert!(matches!(
            simulator.decode_response(b"not json"),
            Err(SimulationError::Decode(_))
        ));
    }

    #[test]
    fn closures_are_simulators() {
        let simulator = |p: &CanopyParameters| -> Result<Spectrum, SimulationError> {
            if p.lai > 5.0 {
                Err(SimulationError::Rejected("lai too high".to_string()))
            } else {
                Ok(Spectrum::flat(0.2))
            }
        };
        assert!(simulator.simulate(&sample_parameters()).is_ok());
        let mut dense = sample_parameters();
        dense.lai = 6.0;
        assert!(matches!(
            simulator.simulate(&dense),
            Err(SimulationError::Rejected(_))
        ));
    }

    #[cfg(unix)]
    #[test]
    fn command_simulator_round_trips_through_a_process() {
        let mut command = SimulatorCommand::new("sh");
        command.args = vec![
            "-c".to_string(),
            "cat > /dev/null; awk 'BEGIN { printf \"[\"; for (i = 0; i < 2101; i++) { if (i > 0) printf \",\"; printf \"0.25\" } print \"]\" }'".to_string(),
        ];
        let simulator = CommandSimulator::new(command);
        let spectrum = simulator.simulate(&sample_parameters()).unwrap();
        assert_eq!(spectrum.len(), SPECTRUM_LEN);
        assert_eq!(spectrum.at_wavelength(842), Some(0.25));
    }

    #[cfg(unix)]
    #[test]
    fn command_simulator_reports_exit_status() {
        let mut command = SimulatorCommand::new("sh");
        command.args = vec!["-c".to_string(), "echo invalid geometry >&2; exit 3".to_string()];
        let simulator = CommandSimulator::new(command);
        match simulator.simulate(&sample_parameters()) {
            Err(SimulationError::ExitStatus { stderr, .. }) => {
                assert_eq!(stderr, "invalid geometry")
            }
            other => panic!("expected ExitStatus, got {other:?}"),
        }
    }

    #[cfg(unix)]
    #[test]
    fn undelivered_requests_reap_the_child() {
        let mut child = Command::new("sleep")
            .arg("30")
            .stdin(Stdio::piped())
            .spawn()
            .unwrap();
        reap(&mut child);
        let status = child.try_wait().unwrap();
        assert!(status.is_some_and(|status| !status.success()));
    }

    #[test]
    fn missing_program_fails_to_launch() {
        let simulator =
            CommandSimulator::new(SimulatorCommand::new("/nonexistent/canopy-simulator"));
        assert!(matches!(
            simulator.simulate(&sample_parameters()),
            Err(SimulationError::Launch { .. })
        ));
    }
}
