// calibrate/estimate.rs

//! # Model Estimation
//!
//! Three interchangeable regression forms share one contract: a feature
//! matrix and a target vector go in, a [`FittedModel`] with a coefficient of
//! determination comes out.
//!
//! 1.  Linear: ordinary least squares of the target on a single feature;
//!     R² is the squared Pearson correlation.
//! 2.  Polynomial (degree 2): two features expanded to
//!     `(f1, f2, f1², f1·f2, f2²)` with a separately fitted intercept; R² is
//!     computed in-sample on the training set.
//! 3.  PLS: partial least squares with `k` latent factors over every
//!     feature; R² comes from k-fold cross-validated predictions.
//!
//! The polynomial form reports an in-sample R² while PLS reports a
//! cross-validated one. The two are not comparable, and every fitted model
//! carries its [`R2Method`] so consumers can tell them apart.

use crate::calibrate::config::ConfigurationError;
use crate::calibrate::pls;
use ndarray::{Array1, Array2, ArrayView1, ArrayView2, Axis};
use ndarray_linalg::LeastSquaresSvd;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

pub const DEFAULT_PLS_COMPONENTS: usize = 5;
pub const DEFAULT_PLS_FOLDS: usize = 5;

/// Regression form, selected per calibration job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ModelForm {
    Linear,
    PolynomialDeg2,
    Pls { components: usize, folds: usize },
}

impl ModelForm {
    pub fn pls_default() -> Self {
        ModelForm::Pls {
            components: DEFAULT_PLS_COMPONENTS,
            folds: DEFAULT_PLS_FOLDS,
        }
    }

    /// The tag written to the exported document.
    pub fn tag(&self) -> &'static str {
        match self {
            ModelForm::Linear => "linear",
            ModelForm::PolynomialDeg2 => "polynomial_deg2",
            ModelForm::Pls { .. } => "pls",
        }
    }

    /// Fewest retained samples a fit of this form will accept.
    pub fn minimum_samples(&self) -> usize {
        match self {
            ModelForm::Linear => 2,
            ModelForm::PolynomialDeg2 => POLYNOMIAL_TERMS + 1,
            ModelForm::Pls { components, folds } => 5usize.max(*folds).max(*components),
        }
    }

    /// Number of input features the form requires, if fixed.
    pub fn required_features(&self) -> Option<usize> {
        match self {
            ModelForm::Linear => Some(1),
            ModelForm::PolynomialDeg2 => Some(2),
            ModelForm::Pls { .. } => None,
        }
    }

    pub fn validate(&self) -> Result<(), ConfigurationError> {
        if let ModelForm::Pls { components, folds } = *self {
            if components == 0 {
                return Err(ConfigurationError::InvalidModelForm(
                    "PLS needs at least one latent component".to_string(),
                ));
            }
            if folds < 2 {
                return Err(ConfigurationError::InvalidModelForm(format!(
                    "PLS cross-validation needs at least 2 folds, got {folds}"
                )));
            }
        }
        Ok(())
    }
}

impl fmt::Display for ModelForm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ModelForm::Pls { components, folds } => {
                write!(f, "pls(k={components}, folds={folds})")
            }
            other => f.write_str(other.tag()),
        }
    }
}

impl FromStr for ModelForm {
    type Err = ConfigurationError;

    /// Accepts `linear`, `polynomial_deg2` (or `poly2`), `pls`, and `pls:<k>`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let key = s.trim().to_ascii_lowercase();
        match key.as_str() {
            "linear" => return Ok(ModelForm::Linear),
            "polynomial_deg2" | "poly2" | "polynomial" => return Ok(ModelForm::PolynomialDeg2),
            "pls" => return Ok(ModelForm::pls_default()),
            _ => {}
        }
        if let Some(components) = key.strip_prefix("pls:") {
            let components: usize = components
                .parse()
                .map_err(|_| ConfigurationError::InvalidModelForm(s.to_string()))?;
            let form = ModelForm::Pls {
                components,
                folds: DEFAULT_PLS_FOLDS,
            };
            form.validate()?;
            return Ok(form);
        }
        Err(ConfigurationError::InvalidModelForm(s.to_string()))
    }
}

/// How the reported R² was computed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum R2Method {
    /// Squared Pearson correlation of a single-feature fit.
    Pearson,
    /// `1 - SS_res / SS_tot` on the training data itself.
    InSample,
    /// `1 - SS_res / SS_tot` on k-fold out-of-sample predictions.
    CrossValidated,
}

/// Form-specific results kept alongside the shared fields.
#[derive(Debug, Clone, PartialEq)]
pub enum FitDetails {
    Linear {
        slope: f64,
    },
    Polynomial {
        /// Names of the expanded basis terms, in coefficient order.
        terms: Vec<String>,
    },
    Pls {
        /// Components actually extracted; fewer than requested when the
        /// feature matrix runs out of rank.
        components: usize,
        folds: usize,
        r2_in_sample: f64,
    },
}

/// Output of a fit. Coefficients are in the original feature units.
#[derive(Debug, Clone, PartialEq)]
pub struct FittedModel {
    pub form: ModelForm,
    pub feature_names: Vec<String>,
    pub coefficients: Array1<f64>,
    pub intercept: f64,
    pub r2: f64,
    pub r2_method: R2Method,
    pub samples: usize,
    pub details: FitDetails,
}

impl FittedModel {
    /// Predicts from one feature row, applying the polynomial expansion when
    /// needed.
    pub fn predict_row(&self, row: ArrayView1<f64>) -> f64 {
        match self.form {
            ModelForm::PolynomialDeg2 => {
                let basis = polynomial_basis(row[0], row[1]);
                basis
                    .iter()
                    .zip(self.coefficients.iter())
                    .map(|(b, c)| b * c)
                    .sum::<f64>()
                    + self.intercept
            }
            ModelForm::Linear | ModelForm::Pls { .. } => {
                row.dot(&self.coefficients) + self.intercept
            }
        }
    }
}

#[derive(Error, Debug)]
pub enum EstimationError {
    #[error("Only {found} samples are available, but at least {required} are required")]
    InsufficientData { found: usize, required: usize },

    #[error("Non-finite value in {column} at row {row}; refusing to fit")]
    NonFiniteInput { column: String, row: usize },

    #[error("The fit produced non-finite coefficients")]
    NonFiniteCoefficients,

    #[error("Feature '{0}' has zero variance; the regression is undefined")]
    DegenerateFeature(String),

    #[error("The target has zero variance; R² is undefined")]
    ConstantTarget,

    #[error("Model form '{form}' needs {expected} features, got {found}")]
    FeatureCountMismatch {
        form: &'static str,
        expected: usize,
        found: usize,
    },

    #[error("PLS requested {requested} components, but only {features} features are available")]
    TooManyComponents { requested: usize, features: usize },

    #[error("Feature matrix has {rows} rows but the target has {targets} values")]
    ShapeMismatch { rows: usize, targets: usize },

    #[error("A linear system solve failed: {0}")]
    LinearSystemSolveFailed(ndarray_linalg::error::LinalgError),
}

impl EstimationError {
    /// True for the numeric failure class: non-finite data or results.
    pub fn is_numeric(&self) -> bool {
        matches!(
            self,
            EstimationError::NonFiniteInput { .. }
                | EstimationError::NonFiniteCoefficients
                | EstimationError::LinearSystemSolveFailed(..)
        )
    }
}

/// The main entry point for fitting. Validates shape, sample count and
/// finiteness, then dispatches on the model form.
pub fn fit_model(
    form: ModelForm,
    x: ArrayView2<f64>,
    y: ArrayView1<f64>,
    feature_names: &[String],
) -> Result<FittedModel, EstimationError> {
    if x.nrows() != y.len() {
        return Err(EstimationError::ShapeMismatch {
            rows: x.nrows(),
            targets: y.len(),
        });
    }
    if let Some(expected) = form.required_features() {
        if x.ncols() != expected {
            return Err(EstimationError::FeatureCountMismatch {
                form: form.tag(),
                expected,
                found: x.ncols(),
            });
        }
    }
    let required = form.minimum_samples();
    if y.len() < required {
        return Err(EstimationError::InsufficientData {
            found: y.len(),
            required,
        });
    }
    ensure_finite(x, y, feature_names)?;

    log::debug!(
        "Fitting {form} on {} samples x {} features",
        x.nrows(),
        x.ncols()
    );

    let fitted = match form {
        ModelForm::Linear => fit_linear(x.column(0), y, feature_names)?,
        ModelForm::PolynomialDeg2 => fit_polynomial(x, y, feature_names)?,
        ModelForm::Pls { components, folds } => {
            fit_pls(x, y, feature_names, components, folds)?
        }
    };

    if !fitted.intercept.is_finite()
        || !fitted.r2.is_finite()
        || fitted.coefficients.iter().any(|c| !c.is_finite())
    {
        return Err(EstimationError::NonFiniteCoefficients);
    }
    log::debug!("{form}: R² = {:.4} ({:?})", fitted.r2, fitted.r2_method);
    Ok(fitted)
}

fn ensure_finite(
    x: ArrayView2<f64>,
    y: ArrayView1<f64>,
    feature_names: &[String],
) -> Result<(), EstimationError> {
    if let Some(row) = y.iter().position(|v| !v.is_finite()) {
        return Err(EstimationError::NonFiniteInput {
            column: "target".to_string(),
            row,
        });
    }
    for (j, column) in x.axis_iter(Axis(1)).enumerate() {
        if let Some(row) = column.iter().position(|v| !v.is_finite()) {
            let name = feature_names
                .get(j)
                .cloned()
                .unwrap_or_else(|| format!("feature {j}"));
            return Err(EstimationError::NonFiniteInput { column: name, row });
        }
    }
    Ok(())
}

/// `1 - SS_res / SS_tot`. Not clamped: a model worse than the mean scores
/// below zero.
pub fn coefficient_of_determination(y: ArrayView1<f64>, predicted: ArrayView1<f64>) -> f64 {
    let mean = y.sum() / y.len() as f64;
    let ss_tot: f64 = y.iter().map(|v| (v - mean).powi(2)).sum();
    let ss_res: f64 = y
        .iter()
        .zip(predicted.iter())
        .map(|(v, p)| (v - p).powi(2))
        .sum();
    1.0 - ss_res / ss_tot
}

fn sum_of_squares_about_mean(values: ArrayView1<f64>) -> f64 {
    let mean = values.sum() / values.len() as f64;
    values.iter().map(|v| (v - mean).powi(2)).sum()
}

fn fit_linear(
    x: ArrayView1<f64>,
    y: ArrayView1<f64>,
    feature_names: &[String],
) -> Result<FittedModel, EstimationError> {
    let n = x.len() as f64;
    let mean_x = x.sum() / n;
    let mean_y = y.sum() / n;

    let mut sxx = 0.0;
    let mut sxy = 0.0;
    let mut syy = 0.0;
    for (&xi, &yi) in x.iter().zip(y.iter()) {
        let dx = xi - mean_x;
        let dy = yi - mean_y;
        sxx += dx * dx;
        sxy += dx * dy;
        syy += dy * dy;
    }

    if sxx <= 0.0 {
        let name = feature_names
            .first()
            .cloned()
            .unwrap_or_else(|| "feature 0".to_string());
        return Err(EstimationError::DegenerateFeature(name));
    }
    if syy <= 0.0 {
        return Err(EstimationError::ConstantTarget);
    }

    let slope = sxy / sxx;
    let intercept = mean_y - slope * mean_x;
    let r = sxy / (sxx * syy).sqrt();

    Ok(FittedModel {
        form: ModelForm::Linear,
        feature_names: feature_names.to_vec(),
        coefficients: Array1::from_vec(vec![slope]),
        intercept,
        r2: r * r,
        r2_method: R2Method::Pearson,
        samples: x.len(),
        details: FitDetails::Linear { slope },
    })
}

const POLYNOMIAL_TERMS: usize = 5;

/// Degree-2 expansion of two features without a bias column.
pub fn polynomial_basis(a: f64, b: f64) -> [f64; POLYNOMIAL_TERMS] {
    [a, b, a * a, a * b, b * b]
}

/// Names of the expanded terms in [`polynomial_basis`] order.
pub fn polynomial_term_names(a: &str, b: &str) -> Vec<String> {
    vec![
        a.to_string(),
        b.to_string(),
        format!("{a}^2"),
        format!("{a}*{b}"),
        format!("{b}^2"),
    ]
}

fn fit_polynomial(
    x: ArrayView2<f64>,
    y: ArrayView1<f64>,
    feature_names: &[String],
) -> Result<FittedModel, EstimationError> {
    if sum_of_squares_about_mean(y) <= 0.0 {
        return Err(EstimationError::ConstantTarget);
    }

    let n = x.nrows();
    // Column 0 carries the intercept; the basis follows in coefficient order.
    let mut design = Array2::<f64>::ones((n, POLYNOMIAL_TERMS + 1));
    for (i, row) in x.axis_iter(Axis(0)).enumerate() {
        let basis = polynomial_basis(row[0], row[1]);
        for (j, value) in basis.iter().enumerate() {
            design[[i, j + 1]] = *value;
        }
    }

    let solution = design
        .least_squares(&y)
        .map_err(EstimationError::LinearSystemSolveFailed)?
        .solution;

    let intercept = solution[0];
    let coefficients = solution.slice(ndarray::s![1..]).to_owned();
    let fitted = design.dot(&solution);
    let r2 = coefficient_of_determination(y, fitted.view());

    let (a, b) = match feature_names {
        [a, b, ..] => (a.as_str(), b.as_str()),
        _ => ("x1", "x2"),
    };

    Ok(FittedModel {
        form: ModelForm::PolynomialDeg2,
        feature_names: feature_names.to_vec(),
        coefficients,
        intercept,
        r2,
        r2_method: R2Method::InSample,
        samples: n,
        details: FitDetails::Polynomial {
            terms: polynomial_term_names(a, b),
        },
    })
}

fn fit_pls(
    x: ArrayView2<f64>,
    y: ArrayView1<f64>,
    feature_names: &[String],
    components: usize,
    folds: usize,
) -> Result<FittedModel, EstimationError> {
    if components > x.ncols() {
        return Err(EstimationError::TooManyComponents {
            requested: components,
            features: x.ncols(),
        });
    }
    if sum_of_squares_about_mean(y) <= 0.0 {
        return Err(EstimationError::ConstantTarget);
    }

    let model = pls::fit_pls1(x, y, components)?;
    let in_sample = model.predict(x);
    let r2_in_sample = coefficient_of_determination(y, in_sample.view());

    let cv_predictions = pls::cross_validated_predictions(x, y, components, folds)?;
    let r2 = coefficient_of_determination(y, cv_predictions.view());
    log::info!(
        "PLS with {} components: cross-validated R² {r2:.4}, in-sample R² {r2_in_sample:.4}",
        model.components
    );

    Ok(FittedModel {
        form: ModelForm::Pls { components, folds },
        feature_names: feature_names.to_vec(),
        coefficients: model.coefficients,
        intercept: model.intercept,
        r2,
        r2_method: R2Method::CrossValidated,
        samples: y.len(),
        details: FitDetails::Pls {
            components: model.components,
            folds,
            r2_in_sample,
        },
    })
}
