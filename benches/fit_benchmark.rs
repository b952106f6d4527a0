use canopy_calibrate::calibrate::estimate::{ModelForm, fit_model};
use criterion::{BenchmarkId, Criterion, Throughput, black_box, criterion_group, criterion_main};
use ndarray::{Array1, Array2};
use rand::distributions::Standard;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

/// Random predictors with a noisy linear response.
fn synthetic_dataset(samples: usize, features: usize) -> (Array2<f64>, Array1<f64>) {
    let mut rng = StdRng::seed_from_u64(0x5EED_F17 + samples as u64);
    let x: Array2<f64> = Array2::from_shape_fn((samples, features), |_| rng.sample(Standard));
    let weights: Array1<f64> = (0..features).map(|j| 1.0 + j as f64).collect();
    let noise: Array1<f64> = (0..samples).map(|_| 0.05 * rng.sample::<f64, _>(Standard)).collect();
    let y = x.dot(&weights) + noise;
    (x, y)
}

fn benchmark_fits(c: &mut Criterion) {
    let sample_counts = [1_000_usize, 10_000];
    let mut group = c.benchmark_group("model_fit");

    for &samples in &sample_counts {
        group.throughput(Throughput::Elements(samples as u64));

        let cases = [
            ("linear", ModelForm::Linear, 1),
            ("polynomial_deg2", ModelForm::PolynomialDeg2, 2),
            ("pls5", ModelForm::pls_default(), 15),
        ];
        for (label, form, features) in cases {
            let (x, y) = synthetic_dataset(samples, features);
            let names: Vec<String> = (0..features).map(|j| format!("x{j}")).collect();
            group.bench_with_input(BenchmarkId::new(label, samples), &(x, y), |b, (x, y)| {
                b.iter(|| {
                    let fitted = fit_model(form, black_box(x.view()), black_box(y.view()), &names);
                    black_box(fitted.map(|model| model.r2).unwrap_or(f64::NAN));
                });
            });
        }
    }
    group.finish();
}

criterion_group!(model_fit, benchmark_fits);
criterion_main!(model_fit);
