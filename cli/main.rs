#![deny(unused_variables)]
#![deny(dead_code)]
#![deny(unused_imports)]
#![deny(clippy::no_effect_underscore_binding)]

use clap::{Args, CommandFactory, Parser, Subcommand};
use indicatif::{MultiProgress, ProgressBar, ProgressDrawTarget, ProgressStyle};
use std::collections::HashMap;
use std::fs::File;
use std::io::{BufWriter, IsTerminal, Write};
use std::path::{Path, PathBuf};
use std::process;
use std::sync::Mutex;

use canopy_calibrate::calibrate::config::{CalibrationConfig, MeasuredCalibration, PlsSettings};
use canopy_calibrate::calibrate::data::SpectralTable;
use canopy_calibrate::calibrate::dataset::DatasetReport;
use canopy_calibrate::calibrate::model::{ExportedModel, ModelDocument};
use canopy_calibrate::calibrate::pipeline::{CalibrationSummary, run_calibration};
use canopy_calibrate::calibrate::profile::{CropProfile, TraitSelector};
use canopy_calibrate::calibrate::progress::SweepProgress;
use canopy_calibrate::calibrate::simulator::{CommandSimulator, Simulator};
use serde::Serialize;

#[derive(Args)]
pub struct RunArgs {
    /// TOML run configuration; the built-in Corn/Soybean/Wheat chlorophyll
    /// run is used when omitted
    #[arg(long, value_name = "PATH")]
    pub config: Option<PathBuf>,

    /// Where the model document is written (`.toml` selects TOML, anything else JSON)
    #[arg(long, value_name = "PATH")]
    pub output: Option<PathBuf>,

    /// Base seed; each job derives its own generator from it
    #[arg(long)]
    pub seed: Option<u64>,

    /// Simulation trials per simulated job, overriding every value in the configuration
    #[arg(long, value_name = "N")]
    pub trials: Option<usize>,

    /// Size of the worker pool running jobs in parallel
    #[arg(long, value_name = "N")]
    pub threads: Option<usize>,
}

#[derive(Args)]
pub struct FitMeasuredArgs {
    /// Ground-truth CSV with a trait column and Wave_<nm> reflectance columns
    pub table: PathBuf,

    /// Crop the measurements belong to
    #[arg(long)]
    pub crop: String,

    /// Traits to calibrate (chlorophyll, nitrogen, vmax)
    #[arg(long = "trait", value_name = "TRAIT", value_delimiter = ',', required = true)]
    pub traits: Vec<TraitSelector>,

    /// Column holding the measured trait; only valid with a single trait
    #[arg(long)]
    pub trait_column: Option<String>,

    /// Model forms to fit (linear, polynomial_deg2, pls, pls:<k>)
    #[arg(long, value_delimiter = ',', default_value = "linear")]
    pub forms: Vec<String>,

    /// Predictor features; defaults depend on the form
    #[arg(long, value_delimiter = ',')]
    pub features: Vec<String>,

    /// Latent components for a bare `pls` form
    #[arg(long, default_value = "5")]
    pub pls_components: usize,

    /// Cross-validation folds for PLS
    #[arg(long, default_value = "5")]
    pub pls_folds: usize,

    #[arg(long, default_value = "calibration_results.json")]
    pub output: PathBuf,
}

#[derive(Args)]
pub struct PredictArgs {
    /// Model document written by `run` or `fit-measured`
    #[arg(long, value_name = "PATH")]
    pub model: PathBuf,

    /// CSV of spectra with Wave_<nm> columns and an optional sample_id column
    pub input: PathBuf,

    /// Only apply models of this crop
    #[arg(long)]
    pub crop: Option<String>,

    /// Only apply models stored under this key
    #[arg(long)]
    pub key: Option<String>,

    #[arg(long, default_value = "predictions.tsv")]
    pub output: PathBuf,
}

#[derive(Parser)]
#[command(
    name = "canopy-calibrate",
    about = "Spectral calibration of crop canopy traits",
    long_about = "Calibrates regression models that estimate canopy traits such as \
                 chlorophyll, nitrogen and Vmax from reflectance spectra, using \
                 simulated sweeps or field measurements, and applies them to new spectra."
)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    #[command(about = "Run every calibration a configuration describes (outputs: model document)")]
    Run(RunArgs),

    #[command(about = "Calibrate from a ground-truth table (outputs: model document)")]
    FitMeasured(FitMeasuredArgs),

    #[command(about = "Apply a model document to spectra (outputs: predictions.tsv)")]
    Predict(PredictArgs),

    #[command(about = "Print the built-in crop profiles as TOML")]
    Profiles,
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let Cli { command } = Cli::parse();

    let result = match command {
        Some(Commands::Run(args)) => run(args),
        Some(Commands::FitMeasured(args)) => fit_measured(args),
        Some(Commands::Predict(args)) => predict(args),
        Some(Commands::Profiles) => print_profiles(),
        None => {
            Cli::command().print_help().expect("print help");
            println!();
            Ok(())
        }
    };

    if let Err(e) = result {
        eprintln!("Error: {e}");
        process::exit(1);
    }
}

fn run(args: RunArgs) -> Result<(), Box<dyn std::error::Error>> {
    let mut config = match &args.config {
        Some(path) => {
            println!("Loading configuration from: {}", path.display());
            CalibrationConfig::from_path(path)?
        }
        None => {
            println!("No configuration given; running the built-in chlorophyll calibrations.");
            CalibrationConfig::default()
        }
    };
    if let Some(output) = args.output {
        config.output = output;
    }
    if let Some(seed) = args.seed {
        config.seed = Some(seed);
    }
    if let Some(trials) = args.trials {
        config.trials = trials;
        for calibration in &mut config.calibrations {
            calibration.trials = None;
        }
    }
    if let Some(threads) = args.threads {
        rayon::ThreadPoolBuilder::new()
            .num_threads(threads)
            .build_global()?;
    }

    execute(&config)
}

fn fit_measured(args: FitMeasuredArgs) -> Result<(), Box<dyn std::error::Error>> {
    let config = CalibrationConfig {
        output: args.output,
        pls: PlsSettings {
            components: args.pls_components,
            folds: args.pls_folds,
        },
        calibrations: Vec::new(),
        measured: vec![MeasuredCalibration {
            crop: args.crop,
            path: args.table,
            traits: args.traits,
            trait_column: args.trait_column,
            forms: args.forms,
            features: args.features,
        }],
        ..CalibrationConfig::default()
    };
    execute(&config)
}

/// Resolves, runs, reports, and saves. Fails when any job failed, after the
/// successful ones have been written.
fn execute(config: &CalibrationConfig) -> Result<(), Box<dyn std::error::Error>> {
    let jobs = config.resolve()?;
    println!("Resolved {} calibration jobs.", jobs.len());

    let simulator = config.simulator.clone().map(CommandSimulator::new);
    if let Some(simulator) = &simulator {
        println!("Simulator: {}", simulator.command().program.display());
    }
    let progress = SweepBars::new()?;
    let summary = run_calibration(
        &jobs,
        simulator.as_ref().map(|s| s as &dyn Simulator),
        config.seed,
        &progress,
    )?;

    print_summary(&summary);

    let document = summary.document()?;
    if document.is_empty() {
        println!("No model succeeded; nothing written.");
    } else {
        document.save(&config.output)?;
        println!(
            "Saved {} models to: {}",
            document.len(),
            config.output.display()
        );
    }

    let failed = summary.failures().count();
    if failed > 0 {
        return Err(format!("{failed} of {} calibration jobs failed", summary.outcomes.len()).into());
    }
    Ok(())
}

fn print_summary(summary: &CalibrationSummary) {
    println!("\nCalibration summary:");
    for outcome in &summary.outcomes {
        let report = &outcome.report;
        println!(
            "  {}/{} [{}]: {}/{} samples retained ({} simulation failures, {} extraction failures, {} incomplete)",
            outcome.crop,
            outcome.key,
            outcome.form,
            report.retained,
            report.attempted,
            report.simulation_failures,
            report.extraction_failures,
            report.missing_values
        );
        match &outcome.result {
            Ok(model) => {
                println!("      features:     {}", model.features.join(", "));
                println!("      coefficients: {}", format_coefficients(&model.coefficients));
                println!("      intercept:    {:.6}", model.intercept);
                println!("      R²:           {:.4} ({:?})", model.r2, model.r2_method);
            }
            Err(e) => println!("      FAILED: {}", e.failure),
        }
    }
}

fn format_coefficients(coefficients: &[f64]) -> String {
    coefficients
        .iter()
        .map(|c| format!("{c:.6}"))
        .collect::<Vec<_>>()
        .join(", ")
}

fn predict(args: PredictArgs) -> Result<(), Box<dyn std::error::Error>> {
    println!("Loading model document from: {}", args.model.display());
    let document = ModelDocument::load(&args.model)?;

    let selected: Vec<(&str, &str, &ExportedModel)> = document
        .iter()
        .filter(|(crop, _, _)| {
            args.crop
                .as_deref()
                .is_none_or(|wanted| crop.eq_ignore_ascii_case(wanted))
        })
        .filter(|(_, key, _)| args.key.as_deref().is_none_or(|wanted| *key == wanted))
        .collect();
    if selected.is_empty() {
        return Err("No model in the document matches the requested crop and key".into());
    }

    println!("Loading spectra from: {}", args.input.display());
    let table = SpectralTable::load(&args.input)?;
    for (_, _, model) in &selected {
        table.require(&model.parsed_features()?)?;
    }
    println!(
        "Applying {} models to {} spectra",
        selected.len(),
        table.height()
    );

    let unusable = write_predictions(&args.output, &table, &selected)?;
    if unusable > 0 {
        println!("{unusable} predictions could not be evaluated and were written as NA.");
    }
    println!("Predictions saved to: {}", args.output.display());
    Ok(())
}

/// One row per spectrum, one column per model. Returns how many cells were
/// written as `NA`.
fn write_predictions(
    path: &Path,
    table: &SpectralTable,
    models: &[(&str, &str, &ExportedModel)],
) -> Result<usize, Box<dyn std::error::Error>> {
    let mut writer = BufWriter::new(File::create(path)?);
    let header: Vec<String> = models
        .iter()
        .map(|(crop, key, _)| format!("{crop}/{key}"))
        .collect();
    writeln!(writer, "sample_id\t{}", header.join("\t"))?;

    let mut unusable = 0;
    for (row, sample_id) in table.sample_ids().iter().enumerate() {
        let cells: Vec<String> = models
            .iter()
            .map(|(_, _, model)| match model.predict_with(|nm| table.reflectance(row, nm)) {
                Ok(value) => format!("{value:.6}"),
                Err(e) => {
                    log::debug!("{sample_id}: {e}");
                    unusable += 1;
                    "NA".to_string()
                }
            })
            .collect();
        writeln!(writer, "{sample_id}\t{}", cells.join("\t"))?;
    }
    writer.flush()?;
    Ok(unusable)
}

#[derive(Serialize)]
struct ProfileListing {
    crops: Vec<CropProfile>,
}

fn print_profiles() -> Result<(), Box<dyn std::error::Error>> {
    let listing = ProfileListing {
        crops: CropProfile::builtin_profiles(),
    };
    print!("{}", toml::to_string_pretty(&listing)?);
    Ok(())
}

/// One progress bar per simulation sweep, stacked while jobs run in parallel.
struct SweepBars {
    multi: MultiProgress,
    style: ProgressStyle,
    bars: Mutex<HashMap<String, ProgressBar>>,
}

impl SweepBars {
    fn new() -> Result<Self, indicatif::style::TemplateError> {
        let draw_target = if std::io::stderr().is_terminal() {
            ProgressDrawTarget::stderr_with_hz(20)
        } else {
            ProgressDrawTarget::hidden()
        };
        let style = ProgressStyle::with_template(
            "> [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} ({eta}) {msg}",
        )?
        .progress_chars("█▉▊▋▌▍▎▏  ");
        Ok(Self {
            multi: MultiProgress::with_draw_target(draw_target),
            style,
            bars: Mutex::new(HashMap::new()),
        })
    }
}

impl SweepProgress for SweepBars {
    fn on_sweep_start(&self, job: &str, total_trials: usize) {
        let bar = self.multi.add(ProgressBar::new(total_trials as u64));
        bar.set_style(self.style.clone());
        bar.set_message(job.to_string());
        if let Ok(mut bars) = self.bars.lock() {
            bars.insert(job.to_string(), bar);
        }
    }

    fn on_sweep_advance(&self, job: &str, completed_trials: usize) {
        if let Ok(bars) = self.bars.lock() {
            if let Some(bar) = bars.get(job) {
                bar.set_position(completed_trials as u64);
            }
        }
    }

    fn on_sweep_finish(&self, job: &str, report: &DatasetReport) {
        if let Ok(mut bars) = self.bars.lock() {
            if let Some(bar) = bars.remove(job) {
                bar.finish_with_message(format!(
                    "{job}: {}/{} retained",
                    report.retained, report.attempted
                ));
            }
        }
    }
}
