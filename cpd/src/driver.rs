use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::{Duration, Instant},
};

use lrcpd_common::{PointSet, Real};
use nalgebra::convert;

use crate::{
    basis::LowRankBasis,
    config::CpdConfig,
    error::{Error, Result, Status},
    estep::{CpuBackend, EStep, EStepInput},
    sigma::update_sigma2,
    workspace::Workspace,
};

bitflags::bitflags! {
    /// Stopping criteria met by the last iteration.
    #[derive(Default)]
    pub struct Criteria: u32 {
        const ITER =          0b0000_0001;
        const TOL =           0b0000_0010;
        const SIGMA =         0b0000_0100;
        const DSIGMA =        0b0000_1000;
        const RTOL =          0b0001_0000;
        const NUMERIC_ERROR = 0b0010_0000;
    }
}

impl Criteria {
    /// Whether a criterion other than the iteration cap is met and no
    /// numeric guard fired.
    pub fn is_success(&self) -> bool {
        self.intersects(Self::TOL | Self::SIGMA | Self::DSIGMA | Self::RTOL)
            && !self.contains(Self::NUMERIC_ERROR)
    }
}

/// The check that stopped a diverging registration.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum Guard {
    InvalidKernelWidth,
    InvalidVariance,
    ObjectiveNotFinite,
    /// The E-step produced a non-finite responsibility mass.
    MassNotFinite,
    SingularSystem,
    VarianceNotFinite,
    MassCollapsed,
}

impl Guard {
    /// Non-zero debug code reported in [`ConvergenceResult::debug_code`].
    pub fn code(self) -> i32 {
        match self {
            Guard::InvalidKernelWidth => 1,
            Guard::InvalidVariance => 2,
            Guard::ObjectiveNotFinite => 3,
            Guard::MassNotFinite => 4,
            Guard::SingularSystem => 5,
            Guard::VarianceNotFinite => 6,
            Guard::MassCollapsed => 7,
        }
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Termination {
    /// A success criterion was met before the iteration cap.
    Converged(Criteria),
    /// The iteration cap was reached.
    Exhausted,
    /// A numeric guard fired; the last committed positions are kept.
    Diverged(Guard),
    Cancelled,
}

impl Termination {
    pub fn status(&self) -> Status {
        match self {
            Termination::Converged(_) => Status::Ok,
            Termination::Exhausted => Status::NonConvergence,
            Termination::Diverged(_) => Status::NumericError,
            Termination::Cancelled => Status::Cancelled,
        }
    }
}

/// Diagnostics of one registration.
#[derive(Debug, Copy, Clone, PartialEq)]
pub struct ConvergenceResult<T> {
    pub termination: Termination,
    pub iterations: usize,
    pub criteria: Criteria,
    pub sigma2: T,
    /// Relative change of the objective in the last completed iteration.
    pub error: T,
    pub objective: T,
    pub elapsed: Duration,
    pub e_step_time: Duration,
}

impl<T> ConvergenceResult<T> {
    #[inline]
    pub fn status(&self) -> Status {
        self.termination.status()
    }

    /// Code of the guard that fired, `0` if none did.
    pub fn debug_code(&self) -> i32 {
        match self.termination {
            Termination::Diverged(guard) => guard.code(),
            _ => 0,
        }
    }
}

/// Transformed model positions, in model order, with their diagnostics.
#[derive(Debug, Clone, PartialEq)]
pub struct Registration<T: Real> {
    pub points: PointSet<T>,
    pub result: ConvergenceResult<T>,
}

impl<T: Real> Registration<T> {
    #[inline]
    pub fn status(&self) -> Status {
        self.result.status()
    }

    #[inline]
    pub fn is_converged(&self) -> bool {
        matches!(self.result.termination, Termination::Converged(_))
    }

    /// The positions of a converged run, or the reason the run stopped.
    pub fn into_converged(self) -> Result<PointSet<T>> {
        match self.result.termination {
            Termination::Converged(_) => Ok(self.points),
            Termination::Exhausted => Err(Error::NotConverged {
                iterations: self.result.iterations,
            }),
            Termination::Diverged(guard) => Err(Error::Numeric(guard)),
            Termination::Cancelled => Err(Error::Cancelled),
        }
    }
}

/// Cooperative cancellation flag, checked once per iteration.
#[derive(Debug, Clone, Default)]
pub struct Cancel(Arc<AtomicBool>);

impl Cancel {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::Relaxed)
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }
}

/// Registers `model` onto `data` with the default CPU backend.
pub fn register<T: Real>(
    config: &CpdConfig<T>,
    data: &PointSet<T>,
    model: &PointSet<T>,
    basis: &LowRankBasis<T>,
) -> Result<Registration<T>> {
    Registrar::new(config).run(data, model, basis)
}

/// Like [`register`], writing the positions to `out`, which must hold one
/// point per model point. Nothing is written if the arguments are rejected.
pub fn register_into<T: Real>(
    config: &CpdConfig<T>,
    data: &PointSet<T>,
    model: &PointSet<T>,
    basis: &LowRankBasis<T>,
    out: &mut PointSet<T>,
) -> Result<ConvergenceResult<T>> {
    Registrar::new(config).run_into(data, model, basis, out)
}

/// A configured registration with a chosen E-step backend.
#[derive(Debug, Clone)]
pub struct Registrar<'c, T: Real, B = CpuBackend> {
    config: &'c CpdConfig<T>,
    backend: B,
    cancel: Option<Cancel>,
}

impl<'c, T: Real> Registrar<'c, T> {
    pub fn new(config: &'c CpdConfig<T>) -> Self {
        Registrar {
            config,
            backend: CpuBackend::new(),
            cancel: None,
        }
    }
}

#[derive(Debug)]
struct Progress<T> {
    iterations: usize,
    criteria: Criteria,
    sigma2: T,
    error: T,
    objective: T,
    e_step_time: Duration,
}

impl<'c, T: Real, B: EStep<T>> Registrar<'c, T, B> {
    pub fn with_backend<B2: EStep<T>>(self, backend: B2) -> Registrar<'c, T, B2> {
        Registrar {
            config: self.config,
            backend,
            cancel: self.cancel,
        }
    }

    pub fn with_cancel(mut self, cancel: Cancel) -> Self {
        self.cancel = Some(cancel);
        self
    }

    #[inline]
    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub fn run(&self, data: &PointSet<T>, model: &PointSet<T>, basis: &LowRankBasis<T>) -> Result<Registration<T>> {
        let start = Instant::now();
        self.check(data, model, basis)?;

        let config = self.config;
        let mut ws = Workspace::new(data, model, basis, config.lambda, config.thresholds.min_mass);
        let mut progress = Progress {
            iterations: 0,
            criteria: Criteria::empty(),
            sigma2: T::zero(),
            error: T::zero(),
            objective: T::zero(),
            e_step_time: Duration::ZERO,
        };
        let termination = self.iterate(&mut ws, &mut progress)?;

        if let Termination::Diverged(_) = termination {
            progress.criteria |= Criteria::NUMERIC_ERROR;
        }
        let result = ConvergenceResult {
            termination,
            iterations: progress.iterations,
            criteria: progress.criteria,
            sigma2: progress.sigma2,
            error: progress.error,
            objective: progress.objective,
            elapsed: start.elapsed(),
            e_step_time: progress.e_step_time,
        };
        match termination {
            Termination::Diverged(guard) => log::warn!(
                "registration diverged after {} iterations: {guard:?}",
                result.iterations
            ),
            _ => log::info!(
                "registration {termination:?} after {} iterations in {:?}, sigma2 {:?}",
                result.iterations,
                result.elapsed,
                result.sigma2
            ),
        }

        Ok(Registration {
            points: ws.current,
            result,
        })
    }

    pub fn run_into(
        &self,
        data: &PointSet<T>,
        model: &PointSet<T>,
        basis: &LowRankBasis<T>,
        out: &mut PointSet<T>,
    ) -> Result<ConvergenceResult<T>> {
        if out.len() != model.len() {
            return Err(Error::InvalidArgument("output holds a different number of points than the model"));
        }
        let registration = self.run(data, model, basis)?;
        out.copy_from(&registration.points);
        Ok(registration.result)
    }

    fn check(&self, data: &PointSet<T>, model: &PointSet<T>, basis: &LowRankBasis<T>) -> Result<()> {
        self.config.validate(model.len(), data.len())?;
        if basis.len() != model.len() {
            return Err(Error::BasisMismatch {
                expected: basis.len(),
                found: model.len(),
            });
        }
        if !(data.is_bounded() && model.is_bounded()) {
            return Err(Error::InvalidArgument("point coordinates must be finite"));
        }
        Ok(())
    }

    fn iterate(&self, ws: &mut Workspace<'_, T>, progress: &mut Progress<T>) -> Result<Termination> {
        let config = self.config;
        let thresholds = &config.thresholds;
        if !(config.beta.is_finite() && config.beta > T::zero()) {
            return Ok(Termination::Diverged(Guard::InvalidKernelWidth));
        }

        progress.sigma2 = match config.initial_sigma2() {
            Some(sigma2) => sigma2,
            None => self.backend.estimate_sigma2(ws.data.points(), &ws.current)?,
        };
        if !(progress.sigma2.is_finite() && progress.sigma2 > T::zero()) {
            return Ok(Termination::Diverged(Guard::InvalidVariance));
        }
        log::debug!(
            "registering {} model points onto {} data points with {}, initial sigma2 {:?}",
            ws.current.len(),
            ws.data.len(),
            self.backend.name(),
            progress.sigma2
        );

        let (m, n): (T, T) = (convert(ws.current.len() as f64), convert(ws.data.len() as f64));
        let outlier_ratio = config.w / (T::one() - config.w) * m / n;
        let mut previous_error = None;
        loop {
            if self.cancel.as_ref().map_or(false, Cancel::is_cancelled) {
                return Ok(Termination::Cancelled);
            }
            progress.iterations += 1;
            let sigma2 = progress.sigma2;

            let outlier = if config.w > T::zero() {
                outlier_ratio * (T::two_pi() * sigma2).powf(convert(1.5))
            } else {
                T::zero()
            };
            let cutoff = thresholds.min_cutoff.max(thresholds.cutoff_sigmas * sigma2.sqrt());
            let input = EStepInput {
                data: &ws.data,
                model: &ws.current,
                sigma2,
                outlier,
                cutoff,
                windowing: config.windowing,
            };
            let started = Instant::now();
            self.backend.e_step(&input, &mut ws.resp)?;
            progress.e_step_time += started.elapsed();
            let mass = { ws.resp.pt1.iter() }.fold(ws.resp.total_mass(), |acc, &p| acc + p);
            if !mass.is_finite() {
                return Ok(Termination::Diverged(Guard::MassNotFinite));
            }

            let energy = match ws.mstep.update(&ws.resp, sigma2, &mut ws.candidate) {
                Ok(energy) => energy,
                Err(guard) => return Ok(Termination::Diverged(guard)),
            };
            let objective = progress.objective + energy;
            let error = relative_change(objective, progress.objective);
            if !(objective.is_finite() && error.is_finite()) {
                return Ok(Termination::Diverged(Guard::ObjectiveNotFinite));
            }
            let sigma2_new = match update_sigma2(ws.data.points(), &ws.candidate, &ws.resp, thresholds.min_mass) {
                Ok(sigma2) => sigma2,
                Err(guard) => return Ok(Termination::Diverged(guard)),
            };

            let mut criteria = Criteria::empty();
            if progress.iterations >= config.max_iterations {
                criteria |= Criteria::ITER;
            }
            if error < config.tolerance {
                criteria |= Criteria::TOL;
            }
            if sigma2_new < thresholds.sigma2_floor {
                criteria |= Criteria::SIGMA;
            }
            let dsigma2 = (sigma2_new - sigma2).abs();
            if dsigma2 < thresholds.dsigma2_abs
                || (sigma2_new > T::zero() && dsigma2 / sigma2_new < thresholds.dsigma2_rel)
            {
                criteria |= Criteria::DSIGMA;
            }
            if let Some(previous) = previous_error {
                if relative_change(error, previous) < thresholds.rtol {
                    criteria |= Criteria::RTOL;
                }
            }

            ws.commit();
            previous_error = Some(error);
            *progress = Progress {
                criteria,
                sigma2: sigma2_new,
                error,
                objective,
                ..*progress
            };
            log::debug!(
                "iteration {}: sigma2 {sigma2_new:?}, objective {objective:?}, error {error:?}, {criteria:?}",
                progress.iterations
            );

            if criteria.contains(Criteria::ITER) {
                return Ok(Termination::Exhausted);
            }
            if criteria.is_success() {
                return Ok(Termination::Converged(criteria));
            }
        }
    }
}

/// `|new - old| / max(|new|, |old|)`, zero when both are zero.
fn relative_change<T: Real>(new: T, old: T) -> T {
    let scale = new.abs().max(old.abs());
    if scale == T::zero() {
        T::zero()
    } else {
        (new - old).abs() / scale
    }
}
