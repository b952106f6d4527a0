//! Single-response partial least squares (PLS1) via NIPALS.
//!
//! Features and target are standardized before extraction, and the final
//! regression vector is mapped back to raw units so that an exported model is
//! `intercept + coefficients · x` on unscaled features.

use crate::calibrate::estimate::EstimationError;
use ndarray::{Array1, Array2, ArrayView1, ArrayView2, Axis, s};
use ndarray_linalg::Inverse;
use std::ops::Range;

/// Relative threshold below which a weight vector or score is treated as
/// exhausted and extraction stops early.
const RANK_TOLERANCE: f64 = 1e-10;

#[derive(Debug, Clone)]
pub struct PlsModel {
    /// Regression vector in original feature units.
    pub coefficients: Array1<f64>,
    pub intercept: f64,
    /// Latent components actually extracted.
    pub components: usize,
}

impl PlsModel {
    pub fn predict(&self, x: ArrayView2<f64>) -> Array1<f64> {
        x.dot(&self.coefficients) + self.intercept
    }
}

struct Standardized {
    values: Array2<f64>,
    means: Array1<f64>,
    scales: Array1<f64>,
}

/// Centers each column and divides by its sample standard deviation. A column
/// with no spread keeps a scale of one so it contributes nothing after
/// centering.
fn standardize(x: ArrayView2<f64>) -> Standardized {
    let n = x.nrows() as f64;
    let means = x.mean_axis(Axis(0)).unwrap_or_else(|| Array1::zeros(x.ncols()));
    let mut scales = Array1::ones(x.ncols());
    for (j, column) in x.axis_iter(Axis(1)).enumerate() {
        let ss: f64 = column.iter().map(|v| (v - means[j]).powi(2)).sum();
        let sd = (ss / (n - 1.0)).sqrt();
        if sd > 0.0 && sd.is_finite() {
            scales[j] = sd;
        }
    }
    let values = (&x - &means) / &scales;
    Standardized {
        values,
        means,
        scales,
    }
}

/// Fits PLS1 with up to `components` latent factors.
pub fn fit_pls1(
    x: ArrayView2<f64>,
    y: ArrayView1<f64>,
    components: usize,
) -> Result<PlsModel, EstimationError> {
    let n = x.nrows();
    let p = x.ncols();
    if n < 2 {
        return Err(EstimationError::InsufficientData {
            found: n,
            required: 2,
        });
    }

    let standardized = standardize(x);
    let y_mean = y.sum() / n as f64;
    let y_ss: f64 = y.iter().map(|v| (v - y_mean).powi(2)).sum();
    let y_scale = (y_ss / (n as f64 - 1.0)).sqrt();
    if y_scale <= 0.0 {
        return Err(EstimationError::ConstantTarget);
    }

    let mut residual_x = standardized.values.clone();
    let mut residual_y = y.mapv(|v| (v - y_mean) / y_scale);

    let mut weights = Array2::<f64>::zeros((p, components));
    let mut loadings = Array2::<f64>::zeros((p, components));
    let mut y_loadings = Array1::<f64>::zeros(components);

    let initial_weights = residual_x.t().dot(&residual_y);
    let reference_norm = initial_weights.dot(&initial_weights).sqrt();
    let mut extracted = 0;

    for a in 0..components {
        let mut w = residual_x.t().dot(&residual_y);
        let w_norm = w.dot(&w).sqrt();
        if w_norm <= RANK_TOLERANCE * reference_norm.max(1.0) {
            log::debug!("PLS extraction stopped after {a} components: weight vector vanished");
            break;
        }
        w /= w_norm;

        let t = residual_x.dot(&w);
        let tt = t.dot(&t);
        if tt <= RANK_TOLERANCE * n as f64 {
            log::debug!("PLS extraction stopped after {a} components: score vector vanished");
            break;
        }
        let p_load = residual_x.t().dot(&t) / tt;
        let q = residual_y.dot(&t) / tt;

        // Deflate X and y by the rank-one component.
        let t_col = t.view().insert_axis(Axis(1));
        let p_row = p_load.view().insert_axis(Axis(0));
        residual_x -= &t_col.dot(&p_row);
        residual_y.scaled_add(-q, &t);

        weights.column_mut(a).assign(&w);
        loadings.column_mut(a).assign(&p_load);
        y_loadings[a] = q;
        extracted += 1;
    }

    if extracted == 0 {
        return Err(EstimationError::DegenerateFeature(
            "all features".to_string(),
        ));
    }

    let w = weights.slice(s![.., ..extracted]);
    let pl = loadings.slice(s![.., ..extracted]);
    let q = y_loadings.slice(s![..extracted]);

    // B = W (P'W)^-1 q in standardized units.
    let ptw = pl.t().dot(&w);
    let ptw_inv = ptw
        .inv()
        .map_err(EstimationError::LinearSystemSolveFailed)?;
    let beta_std = w.dot(&ptw_inv.dot(&q));

    let coefficients = &beta_std * y_scale / &standardized.scales;
    let intercept = y_mean - coefficients.dot(&standardized.means);

    if !intercept.is_finite() || coefficients.iter().any(|c| !c.is_finite()) {
        return Err(EstimationError::NonFiniteCoefficients);
    }

    Ok(PlsModel {
        coefficients,
        intercept,
        components: extracted,
    })
}

/// Contiguous k-fold partition of `0..n`. The first `n % folds` folds hold one
/// extra sample.
pub fn kfold_ranges(n: usize, folds: usize) -> Vec<Range<usize>> {
    let base = n / folds;
    let extra = n % folds;
    let mut start = 0;
    (0..folds)
        .map(|i| {
            let len = base + usize::from(i < extra);
            let range = start..start + len;
            start += len;
            range
        })
        .collect()
}

/// Out-of-fold predictions: each sample is predicted by a model that never
/// saw it.
pub fn cross_validated_predictions(
    x: ArrayView2<f64>,
    y: ArrayView1<f64>,
    components: usize,
    folds: usize,
) -> Result<Array1<f64>, EstimationError> {
    let n = x.nrows();
    if folds < 2 || n < folds {
        return Err(EstimationError::InsufficientData {
            found: n,
            required: folds.max(2),
        });
    }

    let mut predictions = Array1::<f64>::zeros(n);
    for (fold, held_out) in kfold_ranges(n, folds).into_iter().enumerate() {
        let train: Vec<usize> = (0..n).filter(|i| !held_out.contains(i)).collect();
        let x_train = x.select(Axis(0), &train);
        let y_train = y.select(Axis(0), &train);

        match fit_pls1(x_train.view(), y_train.view(), components) {
            Ok(model) => {
                let x_test = x.slice(s![held_out.clone(), ..]);
                predictions
                    .slice_mut(s![held_out])
                    .assign(&model.predict(x_test));
            }
            // A fold whose training target is constant predicts that constant.
            Err(EstimationError::ConstantTarget) => {
                let fold_mean = y_train.mean().unwrap_or(0.0);
                log::debug!("PLS fold {fold}: constant training target, predicting {fold_mean}");
                predictions.slice_mut(s![held_out]).fill(fold_mean);
            }
            Err(e) => {
                log::warn!("PLS fold {fold} failed to fit: {e}");
                return Err(e);
            }
        }
    }
    Ok(predictions)
}
