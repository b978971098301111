use lrcpd_common::Real;
use nalgebra::convert;

use crate::error::{Error, Result};

/// Largest rank picked automatically.
pub const MAX_AUTO_RANK: usize = 100;

/// Fewest model points a registration accepts.
pub const MIN_MODEL_POINTS: usize = 4;

/// How the low-rank kernel basis is sampled.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Default)]
pub enum BasisMethod {
    /// Sample kernel columns at k-means cluster representatives.
    #[default]
    Clustered,
}

impl BasisMethod {
    pub fn code(self) -> i32 {
        match self {
            BasisMethod::Clustered => 1,
        }
    }
}

impl TryFrom<i32> for BasisMethod {
    type Error = Error;

    fn try_from(code: i32) -> Result<Self> {
        match code {
            1 => Ok(BasisMethod::Clustered),
            other => Err(Error::UnknownMethod(other)),
        }
    }
}

/// Candidate selection of the E-step.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Default)]
pub enum Windowing {
    /// Index windows over data sorted along its widest axis.
    #[default]
    Sorted,
    /// Every pair is tested against the cutoff.
    Dense,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct BasisConfig {
    pub method: BasisMethod,
    /// Requested rank, `0` for `min(100, ⌈∛m⌉)`.
    pub rank: usize,
    /// Sample `rank + rank / 4` columns and keep the dominant `rank`
    /// directions of the projected kernel.
    pub oversample: bool,
    pub seed: u64,
}

impl Default for BasisConfig {
    fn default() -> Self {
        BasisConfig {
            method: BasisMethod::Clustered,
            rank: 0,
            oversample: false,
            seed: lrcpd_kmeans::DEFAULT_SEED,
        }
    }
}

impl BasisConfig {
    /// Final rank of a basis over `m` model points.
    pub fn resolve_rank(&self, m: usize) -> Result<usize> {
        match self.rank {
            0 => Ok(auto_rank(m)),
            rank if rank > m => Err(Error::InvalidArgument("basis rank exceeds the model size")),
            rank => Ok(rank),
        }
    }

    /// Number of kernel columns sampled for a basis of rank `rank`.
    pub fn sample_count(&self, rank: usize, m: usize) -> usize {
        if self.oversample {
            (rank + rank / 4).min(m)
        } else {
            rank
        }
    }
}

/// `min(100, ⌈∛m⌉)`, computed on integers so perfect cubes stay exact.
pub fn auto_rank(m: usize) -> usize {
    let rank = { 1..MAX_AUTO_RANK }.find(|r| r * r * r >= m).unwrap_or(MAX_AUTO_RANK);
    rank.min(m.max(1))
}

/// Fixed numeric thresholds of the E-step cutoff and the stopping tests.
#[derive(Debug, Copy, Clone, PartialEq)]
pub struct Thresholds<T> {
    /// Floor of the E-step cutoff. Pairs whose squared distance reaches
    /// `max(min_cutoff, cutoff_sigmas * σ)` are skipped.
    pub min_cutoff: T,
    pub cutoff_sigmas: T,
    pub sigma2_floor: T,
    pub dsigma2_abs: T,
    pub dsigma2_rel: T,
    /// Plateau threshold for the relative change of the relative error.
    pub rtol: T,
    /// Responsibility mass below which a model point counts as orphaned.
    pub min_mass: T,
}

impl<T: Real> Default for Thresholds<T> {
    fn default() -> Self {
        Thresholds {
            min_cutoff: convert(1e-4),
            cutoff_sigmas: convert(2.0),
            sigma2_floor: convert(1e-8),
            dsigma2_abs: convert(1e-10),
            dsigma2_rel: convert(1e-6),
            rtol: convert(1e-4),
            min_mass: convert(1e-10),
        }
    }
}

/// Parameters of one non-rigid registration.
#[derive(Debug, Copy, Clone, PartialEq)]
pub struct CpdConfig<T> {
    /// Point dimensionality, must be 3.
    pub dim: usize,
    /// Weight of the motion coherence regularizer.
    pub lambda: T,
    /// Width of the Gaussian smoothing kernel.
    pub beta: T,
    /// Outlier mass ratio in `[0, 1)`.
    pub w: T,
    /// Initial σ²; estimated from the point sets when absent or not positive.
    pub sigma2_init: Option<T>,
    pub max_iterations: usize,
    pub tolerance: T,
    pub basis: BasisConfig,
    pub windowing: Windowing,
    pub thresholds: Thresholds<T>,
}

impl<T: Real> Default for CpdConfig<T> {
    fn default() -> Self {
        CpdConfig {
            dim: 3,
            lambda: convert(2.0),
            beta: convert(2.0),
            w: convert(0.1),
            sigma2_init: None,
            max_iterations: 200,
            tolerance: convert(5e-3),
            basis: BasisConfig::default(),
            windowing: Windowing::default(),
            thresholds: Thresholds::default(),
        }
    }
}

impl<T: Real> CpdConfig<T> {
    pub fn with_lambda(mut self, lambda: T) -> Self {
        self.lambda = lambda;
        self
    }

    pub fn with_beta(mut self, beta: T) -> Self {
        self.beta = beta;
        self
    }

    pub fn with_w(mut self, w: T) -> Self {
        self.w = w;
        self
    }

    pub fn with_sigma2_init(mut self, sigma2: T) -> Self {
        self.sigma2_init = Some(sigma2);
        self
    }

    pub fn with_max_iterations(mut self, max_iterations: usize) -> Self {
        self.max_iterations = max_iterations;
        self
    }

    pub fn with_tolerance(mut self, tolerance: T) -> Self {
        self.tolerance = tolerance;
        self
    }

    pub fn with_rank(mut self, rank: usize) -> Self {
        self.basis.rank = rank;
        self
    }

    pub fn with_oversampling(mut self, oversample: bool) -> Self {
        self.basis.oversample = oversample;
        self
    }

    pub fn with_windowing(mut self, windowing: Windowing) -> Self {
        self.windowing = windowing;
        self
    }

    /// The initial σ² if one was given.
    pub fn initial_sigma2(&self) -> Option<T> {
        self.sigma2_init.filter(|&s| s > T::zero())
    }

    /// Checks the parameters shared by basis construction and registration
    /// against a model of `m` points.
    pub fn validate_model(&self, m: usize) -> Result<()> {
        if self.dim != 3 {
            return Err(Error::InvalidDimension(self.dim));
        }
        if m < MIN_MODEL_POINTS {
            return Err(Error::InvalidArgument("model needs at least 4 points"));
        }
        self.basis.resolve_rank(m).map(|_| ())
    }

    /// Checks the registration parameters for `m` model and `n` data points.
    /// The kernel width is left to [`crate::register`].
    pub fn validate(&self, m: usize, n: usize) -> Result<()> {
        self.validate_model(m)?;
        if n == 0 {
            return Err(Error::InvalidArgument("data point set is empty"));
        }
        if !(self.lambda.is_finite() && self.lambda > T::zero()) {
            return Err(Error::InvalidArgument("lambda must be positive"));
        }
        if !(self.w.is_finite() && self.w >= T::zero() && self.w < T::one()) {
            return Err(Error::InvalidArgument("w must lie in [0, 1)"));
        }
        if self.max_iterations == 0 {
            return Err(Error::InvalidArgument("iteration cap must be positive"));
        }
        if !(self.tolerance.is_finite() && self.tolerance >= T::zero()) {
            return Err(Error::InvalidArgument("tolerance must be non-negative"));
        }
        if self.sigma2_init.map_or(false, |s| !s.is_finite()) {
            return Err(Error::InvalidArgument("initial sigma2 must be finite"));
        }
        Ok(())
    }
}
