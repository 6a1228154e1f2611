use std::sync::Arc;

use criterion::{Criterion, criterion_group, criterion_main};
use itertools::Itertools;
use nalgebra::{Vector3, Vector5};
use rand::Rng;
use rand_distr::{Distribution, Normal};
use trajfit::{
    FitJob, Fitter, HelixPropagator, Measurement, ParticleHypothesis, PropDirection, Propagator,
    Surface, SurfaceId, TrackParameters,
};

const SIGMA: f64 = 0.01;

fn jobs(propagator: &HelixPropagator, n: usize) -> Vec<FitJob> {
    let mut rng = rand::rng();
    let noise = Normal::new(0., SIGMA).unwrap();
    let perigee = Arc::new(Surface::perigee(Vector3::zeros()));
    let planes = (0..10)
        .map(|i| {
            Arc::new(Surface::plane(
                SurfaceId(i + 1),
                Vector3::new(40. * (i + 1) as f64, 0., 0.),
                Vector3::x(),
                Vector3::y(),
            ))
        })
        .collect_vec();

    (0..n)
        .map(|_| {
            let qop = rng.random_range(0.5e-3..2e-3);
            let phi = rng.random_range(-0.05..0.05);
            let truth = TrackParameters::new(
                perigee.clone(),
                Vector5::new(0.1, -0.2, phi, 1.5, qop),
            );
            let measurements = planes
                .iter()
                .filter_map(|s| propagator.propagate(&truth, s, PropDirection::Along, false))
                .map(|p| {
                    let v = p.parameters.values();
                    Measurement::pixel(
                        p.parameters.surface().clone(),
                        v[0] + noise.sample(&mut rng),
                        v[1] + noise.sample(&mut rng),
                        SIGMA,
                        SIGMA,
                    )
                })
                .collect_vec();
            let seed = TrackParameters::new(
                perigee.clone(),
                Vector5::new(0., 0., 0., 1.5, 1.1 * qop),
            );
            FitJob {
                measurements,
                seed,
                run_outlier: true,
                particle: ParticleHypothesis::NonInteracting,
            }
        })
        .collect()
}

fn fit_benchmark(c: &mut Criterion) {
    let mut fit = c.benchmark_group("fit");
    fit.sample_size(10);

    let propagator = HelixPropagator::solenoid(2.);
    let fitter = Fitter::new(propagator);
    let jobs = jobs(&propagator, 200);

    fit.bench_function("fit blocking", |b| {
        b.iter(|| {
            jobs.iter()
                .map(|j| fitter.fit(&j.measurements, &j.seed, j.run_outlier, j.particle))
                .filter(Result::is_ok)
                .count()
        })
    });

    fit.bench_function("fit parallel", |b| b.iter(|| fitter.fit_par(&jobs)));
}

criterion_group!(benches, fit_benchmark);
criterion_main!(benches);
