//! # Measured Data Loading
//!
//! The alternative to simulation: a ground-truth table where each row pairs a
//! measured trait value with a measured reflectance spectrum stored as
//! `Wave_<nm>` columns. The table is expected to be already joined; merging
//! trait and metadata tables happens upstream.
//!
//! - Lenient cells: non-numeric cells coerce to missing rather than failing
//!   the whole column, matching how field sheets arrive in practice.
//! - Row-wise dropping: a row missing its trait value or any reflectance a
//!   requested feature reads is dropped and counted, never imputed.
//! - Same arithmetic as the simulated path: NDVI and NDRE are evaluated from
//!   the `Wave_` columns through [`Feature::evaluate`], with the same guarded
//!   division.

use crate::calibrate::bands::{ExtractionError, Feature, WAVE_PREFIX};
use crate::calibrate::dataset::{CalibrationDataset, DatasetReport, LOGGED_FAILURE_LIMIT};
use ndarray::Array1;
use polars::prelude::*;
use std::collections::{BTreeMap, HashSet};
use std::fs::File;
use std::path::Path;
use thiserror::Error;

const SAMPLE_ID_COLUMN: &str = "sample_id";

#[derive(Error, Debug)]
pub enum DataError {
    #[error("Error from the underlying Polars DataFrame library: {0}")]
    PolarsError(#[from] PolarsError),
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
    #[error(
        "The required column '{0}' was not found in the input file. Please check spelling and case."
    )]
    ColumnNotFound(String),
    #[error(
        "The column '{column_name}' could not be converted to the expected type '{expected_type}'. (Found type: {found_type})"
    )]
    ColumnWrongType {
        column_name: String,
        expected_type: &'static str,
        found_type: String,
    },
    #[error("The input file has no '{WAVE_PREFIX}<nm>' reflectance columns")]
    NoSpectralColumns,
    #[error(
        "Only {} of {} rows are usable ({} incomplete, {} unusable), but at least {required} are required.",
        .report.retained,
        .report.attempted,
        .report.missing_values,
        .report.extraction_failures
    )]
    InsufficientRows {
        report: DatasetReport,
        required: usize,
    },
}

/// Reflectance columns of a table, keyed by wavelength.
#[derive(Debug, Clone)]
pub struct SpectralTable {
    sample_ids: Vec<String>,
    bands: BTreeMap<u32, Vec<Option<f64>>>,
    height: usize,
}

impl SpectralTable {
    /// Reads every `Wave_<nm>` column of a CSV file.
    pub fn load(path: &Path) -> Result<Self, DataError> {
        let df = internal::read_csv(path)?;
        Self::from_frame(&df)
    }

    fn from_frame(df: &DataFrame) -> Result<Self, DataError> {
        let mut bands = BTreeMap::new();
        for (wavelength_nm, name) in internal::wave_columns(df) {
            bands.insert(wavelength_nm, internal::numeric_column(df, &name)?);
        }
        if bands.is_empty() {
            return Err(DataError::NoSpectralColumns);
        }
        Ok(Self {
            sample_ids: internal::sample_ids(df)?,
            bands,
            height: df.height(),
        })
    }

    pub fn height(&self) -> usize {
        self.height
    }

    pub fn sample_ids(&self) -> &[String] {
        &self.sample_ids
    }

    /// Wavelengths present, ascending.
    pub fn wavelengths(&self) -> impl Iterator<Item = u32> + '_ {
        self.bands.keys().copied()
    }

    pub fn reflectance(&self, row: usize, wavelength_nm: u32) -> Option<f64> {
        self.bands
            .get(&wavelength_nm)
            .and_then(|column| column.get(row).copied().flatten())
    }

    /// Fails with [`DataError::ColumnNotFound`] when a feature reads a
    /// wavelength the table does not carry.
    pub fn require(&self, features: &[Feature]) -> Result<(), DataError> {
        for feature in features {
            for wavelength_nm in feature.wavelengths() {
                if !self.bands.contains_key(&wavelength_nm) {
                    return Err(DataError::ColumnNotFound(format!(
                        "{WAVE_PREFIX}{wavelength_nm}"
                    )));
                }
            }
        }
        Ok(())
    }

    /// True when every reflectance the features read is present in `row`.
    pub fn is_complete(&self, row: usize, features: &[Feature]) -> bool {
        features.iter().all(|feature| {
            feature
                .wavelengths()
                .into_iter()
                .all(|nm| self.reflectance(row, nm).is_some())
        })
    }

    /// Evaluates the features on one row.
    pub fn feature_row(&self, row: usize, features: &[Feature]) -> Result<Array1<f64>, ExtractionError> {
        let mut values = Array1::zeros(features.len());
        for (slot, feature) in values.iter_mut().zip(features) {
            *slot = feature.evaluate(|nm| self.reflectance(row, nm))?;
        }
        Ok(values)
    }

    /// One `Wave_<nm>` band feature per column, in wavelength order.
    pub fn all_bands(&self) -> Vec<Feature> {
        self.wavelengths().map(Feature::wave).collect()
    }
}

/// Loads a ground-truth table into a calibration dataset.
///
/// `features` empty selects every `Wave_` column. Rows with a missing trait
/// value or a missing reflectance are dropped and counted as missing; rows
/// whose features cannot be evaluated (a degenerate index denominator, a
/// non-finite reflectance) are dropped as extraction failures.
pub fn load_measured(
    path: &Path,
    trait_column: &str,
    features: &[Feature],
    minimum_samples: usize,
) -> Result<CalibrationDataset, DataError> {
    log::info!("Loading ground-truth data from '{}'", path.display());
    let df = internal::read_csv(path)?;

    let columns: HashSet<String> = df
        .get_column_names()
        .into_iter()
        .map(|name| name.to_string())
        .collect();
    if !columns.contains(trait_column) {
        return Err(DataError::ColumnNotFound(trait_column.to_string()));
    }

    let table = SpectralTable::from_frame(&df)?;
    let features = if features.is_empty() {
        table.all_bands()
    } else {
        features.to_vec()
    };
    table.require(&features)?;
    let target_column = internal::numeric_column(&df, trait_column)?;

    let mut report = DatasetReport {
        attempted: table.height(),
        ..DatasetReport::default()
    };
    let mut rows = Vec::with_capacity(table.height());
    let mut target = Vec::with_capacity(table.height());

    for (row, value) in target_column.iter().enumerate() {
        let Some(value) = *value else {
            report.missing_values += 1;
            continue;
        };
        if !table.is_complete(row, &features) {
            report.missing_values += 1;
            continue;
        }
        match table.feature_row(row, &features) {
            Ok(values) => {
                rows.push(values);
                target.push(value);
            }
            Err(e) => {
                report.extraction_failures += 1;
                if report.extraction_failures <= LOGGED_FAILURE_LIMIT {
                    log::warn!("Row {} ({}) dropped: {e}", row + 1, table.sample_ids()[row]);
                }
            }
        }
    }

    report.retained = rows.len();
    log::info!(
        "{}: retained {}/{} rows ({} incomplete, {} unusable)",
        trait_column,
        report.retained,
        report.attempted,
        report.missing_values,
        report.extraction_failures
    );

    if report.retained < minimum_samples {
        return Err(DataError::InsufficientRows {
            report,
            required: minimum_samples,
        });
    }

    let feature_names = features.iter().map(|f| f.name().to_string()).collect();
    Ok(CalibrationDataset::from_rows(feature_names, &rows, target, report))
}

/// Internal helpers shared by the loaders.
mod internal {
    use super::*;

    pub(super) fn read_csv(path: &Path) -> Result<DataFrame, DataError> {
        let df = CsvReader::new(File::open(path)?)
            .with_options(
                CsvReadOptions::default()
                    .with_has_header(true)
                    .with_infer_schema_length(None),
            )
            .finish()?;
        log::debug!(
            "Read {} rows x {} columns from '{}'",
            df.height(),
            df.width(),
            path.display()
        );
        Ok(df)
    }

    /// `(wavelength, column name)` for every `Wave_<nm>` column, in table order.
    pub(super) fn wave_columns(df: &DataFrame) -> Vec<(u32, String)> {
        df.get_column_names()
            .into_iter()
            .filter_map(|name| {
                let name = name.to_string();
                let wavelength_nm = name.strip_prefix(WAVE_PREFIX)?.parse::<u32>().ok()?;
                Some((wavelength_nm, name))
            })
            .collect()
    }

    /// Casts a column to `f64`; cells that do not parse become `None`.
    pub(super) fn numeric_column(
        df: &DataFrame,
        column_name: &str,
    ) -> Result<Vec<Option<f64>>, DataError> {
        let column = df
            .column(column_name)
            .map_err(|_| DataError::ColumnNotFound(column_name.to_string()))?;
        let casted = column
            .cast(&DataType::Float64)
            .map_err(|_| DataError::ColumnWrongType {
                column_name: column_name.to_string(),
                expected_type: "f64 (numeric)",
                found_type: format!("{:?}", column.dtype()),
            })?;
        Ok(casted.f64()?.into_iter().collect())
    }

    /// Identifiers from a `sample_id` column, or 1-based row numbers.
    pub(super) fn sample_ids(df: &DataFrame) -> Result<Vec<String>, DataError> {
        let n = df.height();
        if !df
            .get_column_names()
            .iter()
            .any(|name| name.as_str() == SAMPLE_ID_COLUMN)
        {
            return Ok((1..=n).map(|i| i.to_string()).collect());
        }
        let ids = df.column(SAMPLE_ID_COLUMN)?.cast(&DataType::String)?;
        Ok(ids
            .str()?
            .into_iter()
            .enumerate()
            .map(|(i, id)| match id {
                Some(text) if !text.is_empty() => text.to_string(),
                _ => (i + 1).to_string(),
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::calibrate::bands::parse_features;
    use approx::assert_abs_diff_eq;
    use std::io::{self, Write};
    use tempfile::NamedTempFile;

    /// Helper function to create a temporary CSV file with given content.
    fn create_test_csv(content: &str) -> io::Result<NamedTempFile> {
        let mut file = NamedTempFile::with_suffix(".csv")?;
        write!(file, "{content}")?;
        Ok(file)
    }

    const NITROGEN: &str = "measured_Nmass (%)";

    /// A table with a linear nitrogen signal in the red edge.
    fn nitrogen_table(rows: usize) -> String {
        let mut lines = vec![format!(
            "sample_id,{NITROGEN},Wave_665,Wave_705,Wave_842"
        )];
        for i in 0..rows {
            let red_edge = 0.10 + 0.01 * i as f64;
            let nitrogen = 2.0 * red_edge + 1.0;
            lines.push(format!("S{i},{nitrogen:.4},0.05,{red_edge:.4},0.45"));
        }
        lines.join("\n")
    }

    #[test]
    fn loads_a_single_band_dataset() {
        let file = create_test_csv(&nitrogen_table(10)).unwrap();
        let features = parse_features(&["Wave_705"]).unwrap();
        let dataset = load_measured(file.path(), NITROGEN, &features, 2).unwrap();

        assert_eq!(dataset.len(), 10);
        assert_eq!(dataset.feature_names, vec!["Wave_705".to_string()]);
        assert_eq!(dataset.features.shape(), &[10, 1]);
        assert_abs_diff_eq!(dataset.features[[3, 0]], 0.13, epsilon = 1e-12);
        assert_abs_diff_eq!(dataset.target[3], 1.26, epsilon = 1e-12);
        assert_eq!(dataset.report.attempted, 10);
        assert_eq!(dataset.report.dropped(), 0);
    }

    #[test]
    fn missing_and_non_numeric_cells_drop_rows() {
        let content = format!(
            "{NITROGEN},Wave_705\n2.1,0.12\n,0.13\nn/a,0.14\n2.4,\n2.5,0.16\n2.6,0.17"
        );
        let file = create_test_csv(&content).unwrap();
        let features = parse_features(&["Wave_705"]).unwrap();
        let dataset = load_measured(file.path(), NITROGEN, &features, 2).unwrap();
        assert_eq!(dataset.len(), 3);
        assert_eq!(dataset.report.missing_values, 3);
        assert_eq!(dataset.target.to_vec(), vec![2.1, 2.5, 2.6]);
    }

    #[test]
    fn indices_are_computed_from_wave_columns() {
        let file = create_test_csv(&nitrogen_table(8)).unwrap();
        let features = parse_features(&["NDVI", "NDRE"]).unwrap();
        let dataset = load_measured(file.path(), NITROGEN, &features, 2).unwrap();
        assert_abs_diff_eq!(
            dataset.features[[0, 0]],
            (0.45 - 0.05) / (0.45 + 0.05),
            epsilon = 1e-12
        );
        assert_abs_diff_eq!(
            dataset.features[[0, 1]],
            (0.45 - 0.10) / (0.45 + 0.10),
            epsilon = 1e-12
        );
    }

    #[test]
    fn zero_reflectance_rows_are_extraction_failures() {
        let content = format!(
            "{NITROGEN},Wave_665,Wave_705,Wave_842\n2.0,0,0,0\n2.1,0.05,0.1,0.4\n2.2,0.05,0.12,0.42"
        );
        let file = create_test_csv(&content).unwrap();
        let features = parse_features(&["NDVI"]).unwrap();
        let dataset = load_measured(file.path(), NITROGEN, &features, 2).unwrap();
        assert_eq!(dataset.len(), 2);
        assert_eq!(dataset.report.extraction_failures, 1);
    }

    #[test]
    fn empty_feature_list_uses_every_wave_column() {
        let file = create_test_csv(&nitrogen_table(6)).unwrap();
        let dataset = load_measured(file.path(), NITROGEN, &[], 2).unwrap();
        assert_eq!(
            dataset.feature_names,
            vec!["Wave_665", "Wave_705", "Wave_842"]
        );
    }

    #[test]
    fn test_error_column_not_found() {
        let file = create_test_csv(&nitrogen_table(5)).unwrap();
        let features = parse_features(&["Wave_705"]).unwrap();
        match load_measured(file.path(), "measured_Vmax (umol m-2 s-1)", &features, 2) {
            Err(DataError::ColumnNotFound(column)) => {
                assert_eq!(column, "measured_Vmax (umol m-2 s-1)")
            }
            other => panic!("expected ColumnNotFound, got {other:?}"),
        }

        let features = parse_features(&["Wave_900"]).unwrap();
        assert!(matches!(
            load_measured(file.path(), NITROGEN, &features, 2),
            Err(DataError::ColumnNotFound(column)) if column == "Wave_900"
        ));
    }

    #[test]
    fn test_error_insufficient_rows() {
        let file = create_test_csv(&nitrogen_table(1)).unwrap();
        let features = parse_features(&["Wave_705"]).unwrap();
        match load_measured(file.path(), NITROGEN, &features, 2) {
            Err(DataError::InsufficientRows { report, required }) => {
                assert_eq!(report.retained, 1);
                assert_eq!(report.attempted, 1);
                assert_eq!(required, 2);
            }
            other => panic!("expected InsufficientRows, got {other:?}"),
        }
    }

    #[test]
    fn insufficient_rows_carries_every_drop_count() {
        let content = format!(
            "{NITROGEN},Wave_665,Wave_705,Wave_842\n2.0,0,0,0\n,0.05,0.1,0.4\n2.2,0.05,0.12,0.42\n2.3,0.05,,0.43"
        );
        let file = create_test_csv(&content).unwrap();
        let features = parse_features(&["NDVI"]).unwrap();
        match load_measured(file.path(), NITROGEN, &features, 3) {
            Err(DataError::InsufficientRows { report, .. }) => {
                assert_eq!(report.attempted, 4);
                assert_eq!(report.retained, 2);
                assert_eq!(report.missing_values, 1);
                assert_eq!(report.extraction_failures, 1);
                assert_eq!(report.retained + report.dropped(), report.attempted);
            }
            other => panic!("expected InsufficientRows, got {other:?}"),
        }
    }

    #[test]
    fn spectral_table_reads_ids_and_bands() {
        let file = create_test_csv(&nitrogen_table(3)).unwrap();
        let table = SpectralTable::load(file.path()).unwrap();
        assert_eq!(table.height(), 3);
        assert_eq!(table.sample_ids(), &["S0", "S1", "S2"]);
        assert_eq!(table.wavelengths().collect::<Vec<_>>(), vec![665, 705, 842]);
        assert_eq!(table.reflectance(1, 705), Some(0.11));
        assert_eq!(table.reflectance(1, 500), None);
    }
}
