use std::sync::atomic::{AtomicUsize, Ordering};

use lrcpd_cpd::{
    estep::{EStepInput, Responsibilities},
    register, register_into, Cancel, CpdConfig, CpdContext, Criteria, CpuBackend, EStep, Error, Guard,
    LowRankBasis, PointSet, Registrar, Status, Termination, Thresholds, Unavailable, Windowing,
};
use nalgebra::{Point3, Vector3};

fn sphere(n: usize) -> PointSet<f64> {
    let golden = std::f64::consts::PI * (3. - 5f64.sqrt());
    { 0..n }
        .map(|i| {
            let y = 1. - 2. * (i as f64 + 0.5) / n as f64;
            let r = (1. - y * y).sqrt();
            let theta = golden * i as f64;
            Point3::new(r * theta.cos(), y, r * theta.sin())
        })
        .collect()
}

fn warp(points: &PointSet<f64>) -> PointSet<f64> {
    points.map(|p| {
        Point3::new(
            p.x + 0.04 * p.y * p.y,
            p.y + 0.04 * p.z * p.x,
            p.z + 0.04 * (2. * p.x).sin(),
        )
    })
}

fn tight_config() -> CpdConfig<f64> {
    CpdConfig::default()
        .with_lambda(1.)
        .with_beta(2.)
        .with_w(0.)
        .with_sigma2_init(0.01)
        .with_tolerance(1e-5)
        .with_max_iterations(100)
}

fn offset() -> Vector3<f64> {
    Vector3::new(0.05, -0.03, 0.02)
}

#[test]
fn identity_is_a_fixed_point() {
    let model = sphere(50);
    let config = tight_config();
    let basis = LowRankBasis::from_config(&model, &config).unwrap();

    let registration = register(&config, &model, &model, &basis).unwrap();
    assert_eq!(registration.status(), Status::Ok);
    assert!(registration.is_converged());
    assert!(registration.result.iterations < 100);
    assert!(registration.result.sigma2 < 1e-6);
    assert!(registration.points.max_distance(&model).unwrap() < 1e-4);
    assert_eq!(registration.result.debug_code(), 0);
}

#[test]
fn identity_in_single_precision() {
    let model = PointSet::from_points(sphere(50).iter().map(|p| p.cast::<f32>()));
    let config = CpdConfig::<f32>::default()
        .with_lambda(1.)
        .with_w(0.)
        .with_sigma2_init(0.01)
        .with_tolerance(1e-5)
        .with_max_iterations(100);
    let basis = LowRankBasis::from_config(&model, &config).unwrap();

    let registration = register(&config, &model, &model, &basis).unwrap();
    assert!(registration.is_converged());
    assert!(registration.points.max_distance(&model).unwrap() < 1e-4);
}

#[test]
fn rejects_bad_arguments() {
    let model = sphere(50);
    let config = tight_config();
    let basis = LowRankBasis::from_config(&model, &config).unwrap();

    let sentinel = PointSet::from_points(vec![Point3::new(7., 7., 7.); 50]);
    let mut out = sentinel.clone();
    let err = register_into(&config, &PointSet::new(), &model, &basis, &mut out).unwrap_err();
    assert_eq!(err.status(), Status::InvalidArgument);
    assert_eq!(out, sentinel);

    let small = sphere(3);
    let err = register(&config, &model, &small, &basis).unwrap_err();
    assert_eq!(err.status().code(), -1);

    let err = register(&config, &model, &sphere(40), &basis).unwrap_err();
    assert!(matches!(err, Error::BasisMismatch { expected: 50, found: 40 }));

    let flat = CpdConfig { dim: 2, ..config };
    let err = register_into(&flat, &model, &model, &basis, &mut out).unwrap_err();
    assert!(matches!(err, Error::InvalidDimension(2)));
    assert_eq!(err.status(), Status::InvalidArgument);
    assert_eq!(err.status().code(), -1);
    assert_eq!(out, sentinel);

    let mut short = PointSet::zeros(49);
    assert!(register_into(&config, &model, &model, &basis, &mut short).is_err());
    assert_eq!(short, PointSet::zeros(49));
}

#[test]
fn invalid_kernel_width_diverges_immediately() {
    let model = sphere(50);
    let basis = LowRankBasis::from_config(&model, &tight_config()).unwrap();
    let config = tight_config().with_beta(0.);

    let registration = register(&config, &model.translate(&offset()), &model, &basis).unwrap();
    assert_eq!(registration.status(), Status::NumericError);
    assert_eq!(registration.result.termination, Termination::Diverged(Guard::InvalidKernelWidth));
    assert!(registration.result.criteria.contains(Criteria::NUMERIC_ERROR));
    assert_eq!(registration.result.iterations, 0);
    assert_eq!(registration.result.debug_code(), Guard::InvalidKernelWidth.code());
    assert_eq!(registration.points, model);
}

#[test]
fn collapsed_mass_keeps_last_positions() {
    let model = sphere(60);
    let config = tight_config();
    let basis = LowRankBasis::from_config(&model, &config).unwrap();
    let far = model.translate(&Vector3::new(100., 0., 0.));

    let registration = register(&config, &far, &model, &basis).unwrap();
    assert_eq!(registration.result.termination, Termination::Diverged(Guard::MassCollapsed));
    assert!(registration.result.criteria.contains(Criteria::NUMERIC_ERROR));
    assert!(!registration.result.criteria.is_success());
    assert_eq!(registration.result.iterations, 1);
    assert_eq!(registration.points, model);
    assert!(matches!(
        registration.into_converged(),
        Err(Error::Numeric(Guard::MassCollapsed))
    ));
}

/// Empties the model mass from the given E-step call on.
struct Starving {
    inner: CpuBackend,
    calls: AtomicUsize,
    from: usize,
}

impl EStep<f64> for Starving {
    fn name(&self) -> &'static str {
        "starving"
    }

    fn estimate_sigma2(&self, data: &PointSet<f64>, model: &PointSet<f64>) -> lrcpd_cpd::Result<f64> {
        self.inner.estimate_sigma2(data, model)
    }

    fn e_step(&self, input: &EStepInput<'_, f64>, out: &mut Responsibilities<f64>) -> lrcpd_cpd::Result<()> {
        self.inner.e_step(input, out)?;
        if self.calls.fetch_add(1, Ordering::Relaxed) + 1 >= self.from {
            out.p1.iter_mut().for_each(|p| *p = 0.);
        }
        Ok(())
    }
}

#[test]
fn collapse_mid_run_keeps_last_commit() {
    let model = sphere(60);
    let data = warp(&model);
    let config = CpdConfig {
        tolerance: 0.,
        thresholds: Thresholds {
            sigma2_floor: 0.,
            dsigma2_abs: 0.,
            dsigma2_rel: 0.,
            rtol: 0.,
            ..Default::default()
        },
        ..tight_config()
    };
    let basis = LowRankBasis::from_config(&model, &config).unwrap();
    let backend = Starving {
        inner: CpuBackend::new(),
        calls: AtomicUsize::new(0),
        from: 3,
    };

    let registration = { Registrar::new(&config).with_backend(backend) }
        .run(&data, &model, &basis)
        .unwrap();
    assert_eq!(registration.result.termination, Termination::Diverged(Guard::MassCollapsed));
    assert_eq!(registration.result.iterations, 3);
    assert_eq!(registration.result.debug_code(), Guard::MassCollapsed.code());

    let capped = register(&config.with_max_iterations(2), &data, &model, &basis).unwrap();
    assert_eq!(capped.result.termination, Termination::Exhausted);
    assert_eq!(registration.points, capped.points);
    assert_ne!(registration.points, model);
}

#[test]
fn translation_is_recovered() {
    let model = sphere(60);
    let data = model.translate(&offset());
    let config = tight_config();
    let basis = LowRankBasis::from_config(&model, &config).unwrap();

    let sorted = register(&config, &data, &model, &basis).unwrap();
    assert!(sorted.is_converged());
    let before = model.rms_distance(&data).unwrap();
    let after = sorted.points.rms_distance(&data).unwrap();
    assert!(after < 0.05 * before, "{after} vs {before}");

    let dense = register(&config.with_windowing(Windowing::Dense), &data, &model, &basis).unwrap();
    assert_eq!(dense.points, sorted.points);
    assert_eq!(dense.result.iterations, sorted.result.iterations);
    assert_eq!(dense.result.criteria, sorted.result.criteria);
}

#[test]
fn rerun_from_converged_state_is_short() {
    let model = sphere(60);
    let data = model.translate(&offset());
    let config = tight_config();
    let basis = LowRankBasis::from_config(&model, &config).unwrap();
    let first = register(&config, &data, &model, &basis).unwrap();

    let seed = if first.result.sigma2 > 0. { first.result.sigma2 } else { 1e-6 };
    let config = config.with_sigma2_init(seed);
    let basis = LowRankBasis::from_config(&first.points, &config).unwrap();
    let second = register(&config, &data, &first.points, &basis).unwrap();
    assert!(second.is_converged());
    assert!(second.result.iterations <= 5, "{} iterations", second.result.iterations);
    assert!(second.points.rms_distance(&data).unwrap() <= first.points.rms_distance(&data).unwrap() + 1e-6);
}

#[test]
fn higher_rank_fits_better() {
    let model = sphere(100);
    let data = warp(&model);
    let mut last = f64::INFINITY;
    for rank in [2, 4, 16] {
        let config = tight_config().with_beta(1.).with_rank(rank);
        let basis = LowRankBasis::from_config(&model, &config).unwrap();
        let registration = register(&config, &data, &model, &basis).unwrap();
        assert_ne!(registration.status(), Status::NumericError);

        let residual = registration.points.rms_distance(&data).unwrap();
        assert!(residual <= last + 1e-9, "rank {rank}: {residual} > {last}");
        last = residual;
    }
}

#[test]
fn flags_are_consistent() {
    let model = sphere(60);
    let data = warp(&model);
    for max_iterations in [1, 2, 50] {
        for w in [0., 0.2] {
            let config = tight_config().with_max_iterations(max_iterations).with_w(w);
            let basis = LowRankBasis::from_config(&model, &config).unwrap();
            let result = register(&config, &data, &model, &basis).unwrap().result;

            let criteria = result.criteria;
            assert!(!(criteria.contains(Criteria::NUMERIC_ERROR) && result.status() == Status::Ok));
            if criteria.contains(Criteria::ITER) {
                assert_eq!(result.iterations, max_iterations);
                assert_eq!(result.status(), Status::NonConvergence);
            }
            if result.status() == Status::Ok {
                assert!(result.iterations < max_iterations);
                assert!(criteria.is_success());
            }
            assert!(result.e_step_time <= result.elapsed);
        }
    }
}

#[test]
fn exhausted_run_reports_non_convergence() {
    let model = sphere(60);
    let data = warp(&model);
    let config = tight_config().with_max_iterations(1);
    let basis = LowRankBasis::from_config(&model, &config).unwrap();

    let registration = register(&config, &data, &model, &basis).unwrap();
    assert_eq!(registration.result.termination, Termination::Exhausted);
    assert_eq!(registration.status().code(), -3);
    assert!(registration.points.rms_distance(&data).unwrap() < model.rms_distance(&data).unwrap());
    assert!(matches!(
        registration.into_converged(),
        Err(Error::NotConverged { iterations: 1 })
    ));
}

#[test]
fn independent_of_thread_count() {
    let model = sphere(80);
    let data = warp(&model);
    let config = tight_config();
    let basis = LowRankBasis::from_config(&model, &config).unwrap();

    let single = rayon::ThreadPoolBuilder::new().num_threads(1).build().unwrap();
    let many = rayon::ThreadPoolBuilder::new().num_threads(4).build().unwrap();
    let a = single.install(|| register(&config, &data, &model, &basis).unwrap());
    let b = many.install(|| register(&config, &data, &model, &basis).unwrap());
    assert_eq!(a.points, b.points);
    assert_eq!(a.result.iterations, b.result.iterations);
    assert_eq!(a.result.sigma2, b.result.sigma2);
}

#[test]
fn unavailable_backend_is_an_internal_error() {
    let model = sphere(50);
    let config = tight_config();
    let basis = LowRankBasis::from_config(&model, &config).unwrap();
    let backend = Unavailable {
        name: "accelerator",
        reason: "no device".into(),
    };

    let err = { Registrar::new(&config).with_backend(backend.clone()) }
        .run(&model, &model, &basis)
        .unwrap_err();
    assert_eq!(err.status(), Status::InternalError);

    let config = CpdConfig {
        sigma2_init: None,
        ..config
    };
    let err = { Registrar::new(&config).with_backend(backend) }
        .run(&model, &model, &basis)
        .unwrap_err();
    assert!(matches!(err, Error::Backend { backend: "accelerator", .. }));
}

#[test]
fn cancellation_stops_before_iterating() {
    let model = sphere(50);
    let data = model.translate(&offset());
    let config = tight_config();
    let cancel = Cancel::new();
    cancel.cancel();

    let context = CpdContext::new(config, model.clone()).unwrap();
    let registration = context.register_cancellable(&data, cancel).unwrap();
    assert_eq!(registration.status(), Status::Cancelled);
    assert_eq!(registration.result.iterations, 0);
    assert_eq!(registration.points, model);
    assert!(matches!(registration.into_converged(), Err(Error::Cancelled)));
}

#[test]
fn context_serves_many_data_sets() {
    let model = sphere(100);
    let context = CpdContext::new(CpdConfig::default().with_rank(5), model.clone()).unwrap();

    for data in [model.translate(&offset()), warp(&model)] {
        let registration = context.register(&data).unwrap();
        assert!(registration.is_converged(), "{:?}", registration.result);
        let before = model.rms_distance(&data).unwrap();
        assert!(registration.points.rms_distance(&data).unwrap() < 0.8 * before);

        let direct = register(context.config(), &data, &model, context.basis()).unwrap();
        assert_eq!(direct.points, registration.points);

        let mut out = PointSet::zeros(100);
        let result = register_into(context.config(), &data, &model, context.basis(), &mut out).unwrap();
        assert_eq!(out, registration.points);
        assert_eq!(result.iterations, registration.result.iterations);
    }
}

#[test]
fn stored_basis_reproduces_registration() {
    let model = sphere(60);
    let data = warp(&model);
    let config = tight_config();
    let context = CpdContext::new(config, model.clone()).unwrap();

    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("sphere.basis");
    context.basis().write_to(std::fs::File::create(&path).unwrap()).unwrap();
    let basis = LowRankBasis::read_from(std::fs::File::open(&path).unwrap()).unwrap();

    let restored = CpdContext::with_basis(config, model, basis).unwrap();
    assert_eq!(
        restored.register(&data).unwrap().points,
        context.register(&data).unwrap().points
    );
}
