use approx::assert_abs_diff_eq;
use canopy_calibrate::calibrate::config::CalibrationConfig;
use canopy_calibrate::calibrate::estimate::R2Method;
use canopy_calibrate::calibrate::model::{ExportFormat, ModelDocument, ModelType};
use canopy_calibrate::calibrate::pipeline::run_calibration;
use canopy_calibrate::calibrate::profile::CropProfile;
use canopy_calibrate::calibrate::progress::NoopSweepProgress;
use canopy_calibrate::calibrate::simulator::{CanopyParameters, SimulationError, Spectrum};
use std::fs;
use std::path::Path;
use tempfile::tempdir;

/// Red edge falls with chlorophyll and rises slightly with leaf area.
fn toy_simulator(p: &CanopyParameters) -> Result<Spectrum, SimulationError> {
    let mut spectrum = Spectrum::flat(0.05);
    spectrum.set_wavelength(665, 0.12 - 0.001 * p.cab);
    spectrum.set_wavelength(705, 0.30 - 0.002 * p.cab + 0.005 * p.lai);
    spectrum.set_wavelength(842, 0.30 + 0.04 * p.lai);
    Ok(spectrum)
}

const NITROGEN: &str = "measured_Nmass (%)";

fn nitrogen_surface(ndvi: f64, ndre: f64) -> f64 {
    1.0 + 2.0 * ndvi + 3.0 * ndre + ndvi * ndre
}

/// 6 x 6 grid of red and red-edge reflectances with a quadratic nitrogen
/// response in NDVI and NDRE.
fn write_ground_truth(path: &Path) {
    let mut lines = vec![format!("sample_id,{NITROGEN},Wave_665,Wave_705,Wave_842")];
    let nir = 0.45;
    for i in 0..6 {
        for j in 0..6 {
            let red = 0.03 + 0.01 * i as f64;
            let red_edge = 0.15 + 0.03 * j as f64;
            let ndvi = (nir - red) / (nir + red);
            let ndre = (nir - red_edge) / (nir + red_edge);
            lines.push(format!(
                "P{i}{j},{},{red},{red_edge},{nir}",
                nitrogen_surface(ndvi, ndre)
            ));
        }
    }
    fs::write(path, lines.join("\n")).unwrap();
}

#[test]
fn configured_simulated_run_exports_a_reloadable_document() {
    let dir = tempdir().unwrap();
    let output = dir.path().join("models.json");
    let text = format!(
        r#"
output = '{}'
seed = 11
trials = 300

[[crops]]
name = "Sorghum"
base = "Corn"
ranges = {{ cab = [20.0, 80.0] }}

[[calibrations]]
crops = ["Corn", "Sorghum"]
traits = ["chlorophyll", "nitrogen"]
forms = ["linear"]
"#,
        output.display()
    );
    let config = CalibrationConfig::from_toml(&text).unwrap();
    let jobs = config.resolve().unwrap();
    assert_eq!(jobs.len(), 4);

    let summary =
        run_calibration(&jobs, Some(&toy_simulator), config.seed, &NoopSweepProgress).unwrap();
    assert!(summary.all_succeeded());
    for outcome in &summary.outcomes {
        assert_eq!(outcome.report.attempted, 300);
        assert_eq!(outcome.report.retained, 300);
    }

    let document = summary.document().unwrap();
    document.save(&config.output).unwrap();

    let written = fs::read_to_string(&output).unwrap();
    let reloaded = ModelDocument::load(&output).unwrap();
    assert_eq!(reloaded, document);
    assert_eq!(reloaded.render(ExportFormat::Json).unwrap(), written);

    let crops: Vec<&str> = reloaded.crops().collect();
    assert_eq!(crops, vec!["Corn", "Sorghum"]);

    let sorghum = reloaded.get("Sorghum", "nitrogen").unwrap();
    assert_eq!(sorghum.model_type, ModelType::Linear);
    assert_eq!(sorghum.trait_name, "nitrogen");
    assert_eq!(sorghum.derived, Some(CropProfile::corn().derived));
    assert!(sorghum.r2 > 0.8, "R² {} too low", sorghum.r2);

    let corn = reloaded.get("Corn", "chlorophyll").unwrap();
    let darker = corn
        .predict_with(|nm| Some(if nm == 705 { 0.15 } else { 0.05 }))
        .unwrap();
    let brighter = corn
        .predict_with(|nm| Some(if nm == 705 { 0.25 } else { 0.05 }))
        .unwrap();
    assert!(darker > brighter);
}

#[test]
fn measured_table_fits_every_requested_form() {
    let dir = tempdir().unwrap();
    let table = dir.path().join("ground_truth.csv");
    write_ground_truth(&table);
    let output = dir.path().join("measured.toml");

    let text = format!(
        r#"
output = '{}'
calibrations = []

[pls]
components = 2
folds = 4

[[measured]]
crop = "Corn"
path = '{}'
traits = ["nitrogen"]
forms = ["linear", "polynomial_deg2", "pls"]
"#,
        output.display(),
        table.display()
    );
    let config = CalibrationConfig::from_toml(&text).unwrap();
    let jobs = config.resolve().unwrap();
    let keys: Vec<&str> = jobs.iter().map(|job| job.key.as_str()).collect();
    assert_eq!(
        keys,
        vec!["nitrogen_linear", "nitrogen_polynomial_deg2", "nitrogen_pls"]
    );

    // Measured jobs never touch the simulator.
    let summary = run_calibration(&jobs, None, None, &NoopSweepProgress).unwrap();
    assert!(summary.all_succeeded(), "{:?}", summary.failures().collect::<Vec<_>>());
    summary.document().unwrap().save(&config.output).unwrap();

    let document = ModelDocument::load(&output).unwrap();
    assert_eq!(document.len(), 3);

    let linear = document.get("Corn", "nitrogen_linear").unwrap();
    assert_eq!(linear.features, vec!["Wave_705".to_string()]);
    assert_eq!(linear.r2_method, R2Method::Pearson);
    assert_eq!(linear.samples, 36);

    let polynomial = document.get("Corn", "nitrogen_polynomial_deg2").unwrap();
    assert_eq!(polynomial.r2_method, R2Method::InSample);
    assert_eq!(polynomial.coefficients.len(), 5);
    assert_eq!(polynomial.terms.len(), 5);
    assert!(polynomial.r2 > 0.999, "R² {} too low", polynomial.r2);

    let (red, red_edge, nir) = (0.055, 0.22, 0.45);
    let expected = nitrogen_surface((nir - red) / (nir + red), (nir - red_edge) / (nir + red_edge));
    let predicted = polynomial
        .predict_with(|nm| match nm {
            665 => Some(red),
            705 => Some(red_edge),
            842 => Some(nir),
            _ => None,
        })
        .unwrap();
    assert_abs_diff_eq!(predicted, expected, epsilon = 1e-6);

    let pls = document.get("Corn", "nitrogen_pls").unwrap();
    assert_eq!(pls.model_type, ModelType::Pls);
    assert_eq!(pls.r2_method, R2Method::CrossValidated);
    assert_eq!(pls.components, Some(2));
    assert_eq!(pls.folds, Some(4));
    assert_eq!(
        pls.features,
        vec!["Wave_665".to_string(), "Wave_705".to_string(), "Wave_842".to_string()]
    );
    let in_sample = pls.r2_in_sample.unwrap();
    assert!(pls.r2 <= in_sample + 1e-12);
}

#[test]
fn a_broken_measured_table_fails_only_its_own_job() {
    let dir = tempdir().unwrap();
    let table = dir.path().join("sparse.csv");
    fs::write(&table, format!("{NITROGEN},Wave_705\n2.0,0.2\n")).unwrap();

    let text = format!(
        r#"
trials = 100

[[calibrations]]
crops = ["Wheat"]
traits = ["chlorophyll"]
forms = ["linear"]

[[measured]]
crop = "Wheat"
path = '{}'
traits = ["nitrogen"]
forms = ["linear"]
"#,
        table.display()
    );
    let config = CalibrationConfig::from_toml(&text).unwrap();
    let jobs = config.resolve().unwrap();
    let summary = run_calibration(&jobs, Some(&toy_simulator), Some(5), &NoopSweepProgress).unwrap();

    let failures: Vec<_> = summary.failures().collect();
    assert_eq!(failures.len(), 1);
    assert_eq!(failures[0].key, "nitrogen");
    assert_eq!(failures[0].retained, 1);
    assert_eq!(failures[0].attempted, 1);

    let document = summary.document().unwrap();
    assert!(document.get("Wheat", "chlorophyll").is_some());
    assert!(document.get("Wheat", "nitrogen").is_none());
}
