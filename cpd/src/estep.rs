mod cpu;

use std::ops::Range;

use lrcpd_common::{PointSet, Real};
use nalgebra::convert;

pub use self::cpu::CpuBackend;
use crate::{
    config::Windowing,
    error::{Error, Result},
};

/// Data points sorted along their widest axis.
#[derive(Debug, Clone)]
pub struct SortedData<T: Real> {
    points: PointSet<T>,
    axis: usize,
}

impl<T: Real> SortedData<T> {
    pub fn new(data: &PointSet<T>) -> Self {
        let axis = data.spread_axis();
        let (points, _) = data.sorted_along(axis);
        SortedData { points, axis }
    }

    #[inline]
    pub fn points(&self) -> &PointSet<T> {
        &self.points
    }

    #[inline]
    pub fn axis(&self) -> usize {
        self.axis
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.points.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    /// Sorted coordinates along [`SortedData::axis`].
    #[inline]
    pub fn keys(&self) -> &[T] {
        self.points.column(self.axis)
    }
}

/// Inputs of one E-step.
#[derive(Debug, Clone, Copy)]
pub struct EStepInput<'a, T: Real> {
    pub data: &'a SortedData<T>,
    /// Current transformed model positions.
    pub model: &'a PointSet<T>,
    pub sigma2: T,
    /// Constant outlier term added to every denominator.
    pub outlier: T,
    /// Pairs with a squared distance at or above this are skipped.
    pub cutoff: T,
    pub windowing: Windowing,
}

impl<'a, T: Real> EStepInput<'a, T> {
    /// Multiplier of the squared distance in the Gaussian exponent.
    #[inline]
    pub fn factor(&self) -> T {
        -(self.sigma2 * convert(2.0)).recip()
    }

    /// Half-width of an axis window that contains every pair inside the
    /// cutoff around `center`.
    #[inline]
    pub fn half_width(&self, center: T) -> T {
        let slack: T = convert(1.001);
        self.cutoff.sqrt() * slack + center.abs() * T::default_epsilon() * convert(4.0)
    }
}

/// Indices of the ascending `keys` within the window around `center`.
pub fn window<T: Real>(keys: &[T], center: T, half_width: T) -> Range<usize> {
    let (low, high) = (center - half_width, center + half_width);
    let start = keys.partition_point(|&v| v < low);
    let end = start + keys[start..].partition_point(|&v| v <= high);
    start..end
}

/// Posterior statistics of one E-step.
///
/// Data-side vectors follow the sorted data order; model-side ones follow the
/// model order.
#[derive(Debug, Clone)]
pub struct Responsibilities<T: Real> {
    /// Reciprocal of the total affinity of every data point.
    pub psum: Vec<T>,
    /// Mass of every data point assigned to the model.
    pub pt1: Vec<T>,
    /// Mass assigned to every model point.
    pub p1: Vec<T>,
    /// Responsibility-weighted sum of data points per model point.
    pub px: PointSet<T>,
    model_order: Vec<usize>,
    model_keys: Vec<T>,
}

impl<T: Real> Responsibilities<T> {
    pub fn new(n: usize, m: usize) -> Self {
        Responsibilities {
            psum: vec![T::zero(); n],
            pt1: vec![T::zero(); n],
            p1: vec![T::zero(); m],
            px: PointSet::zeros(m),
            model_order: Vec::with_capacity(m),
            model_keys: Vec::with_capacity(m),
        }
    }

    #[inline]
    pub fn data_len(&self) -> usize {
        self.psum.len()
    }

    #[inline]
    pub fn model_len(&self) -> usize {
        self.p1.len()
    }

    /// Mass assigned to the model as a whole.
    pub fn total_mass(&self) -> T {
        self.p1.iter().fold(T::zero(), |acc, &p| acc + p)
    }
}

/// Computes soft correspondences between data and transformed model.
///
/// Implementations must write every output of [`Responsibilities`] and give
/// results that do not depend on thread scheduling.
pub trait EStep<T: Real>: Send + Sync {
    fn name(&self) -> &'static str;

    /// `Σᵢⱼ ‖xᵢ - yⱼ‖² / (3mn)`.
    fn estimate_sigma2(&self, data: &PointSet<T>, model: &PointSet<T>) -> Result<T>;

    fn e_step(&self, input: &EStepInput<'_, T>, out: &mut Responsibilities<T>) -> Result<()>;
}

/// A backend that is compiled in but cannot run on this host.
#[derive(Debug, Clone)]
pub struct Unavailable {
    pub name: &'static str,
    pub reason: String,
}

impl Unavailable {
    fn error(&self) -> Error {
        Error::Backend {
            backend: self.name,
            reason: self.reason.clone(),
        }
    }
}

impl<T: Real> EStep<T> for Unavailable {
    fn name(&self) -> &'static str {
        self.name
    }

    fn estimate_sigma2(&self, _: &PointSet<T>, _: &PointSet<T>) -> Result<T> {
        Err(self.error())
    }

    fn e_step(&self, _: &EStepInput<'_, T>, _: &mut Responsibilities<T>) -> Result<()> {
        Err(self.error())
    }
}
