mod packed;

use std::cmp::Ordering;

use lrcpd_common::{distance_squared, PointSet, Real};
use lrcpd_kmeans::KMeans;
use nalgebra::{convert, DMatrix, DVector, SymmetricEigen, QR};
use rayon::prelude::*;

pub use self::packed::{build_packed, packed_len};
use crate::{
    config::{BasisConfig, BasisMethod, CpdConfig, MIN_MODEL_POINTS},
    error::{Error, Result},
};

/// Rank-k approximation `G ≈ Q Λ Qᵀ` of the Gaussian kernel matrix of a model
/// point set, with `G[i][j] = exp(-‖yᵢ - yⱼ‖² / 2β²)`.
///
/// `Q` is `m × k` with orthonormal columns. The basis only depends on the
/// model and the kernel width, so one basis serves any number of
/// registrations of that model.
#[derive(Debug, Clone, PartialEq)]
pub struct LowRankBasis<T: Real> {
    q: DMatrix<T>,
    lambda: DVector<T>,
    lambda_inv: DVector<T>,
}

impl<T: Real> LowRankBasis<T> {
    /// Builds the basis of `model` with the kernel width and basis settings
    /// of `config`.
    pub fn from_config(model: &PointSet<T>, config: &CpdConfig<T>) -> Result<Self> {
        config.validate_model(model.len())?;
        Self::build(model, config.beta, &config.basis)
    }

    pub fn build(model: &PointSet<T>, beta: T, config: &BasisConfig) -> Result<Self> {
        let m = model.len();
        if m < MIN_MODEL_POINTS {
            return Err(Error::InvalidArgument("model needs at least 4 points"));
        }
        if !(beta.is_finite() && beta > T::zero()) {
            return Err(Error::InvalidArgument("kernel width must be positive"));
        }
        if !model.is_bounded() {
            return Err(Error::InvalidArgument("model points must be finite"));
        }
        let rank = config.resolve_rank(m)?;
        let samples = config.sample_count(rank, m);
        let factor = -(beta * beta * convert(2.0)).recip();

        let representatives = match config.method {
            BasisMethod::Clustered => {
                let clustering = KMeans::new(samples)
                    .with_seed(config.seed)
                    .fit(model)
                    .ok_or(Error::InvalidArgument("cannot cluster the model"))?;
                log::trace!(
                    "clustered {m} model points into {samples} groups in {} iterations",
                    clustering.iterations
                );
                clustering.representatives(model)
            }
        };

        let mut sampled = DMatrix::zeros(m, samples);
        { sampled.as_mut_slice().par_chunks_mut(m).zip(&representatives) }
            .for_each(|(column, &rep)| kernel_column(model, rep, factor, column));

        let q = QR::new(sampled).q();
        let gq = kernel_product(model, &q, factor);

        let (q, mut lambda) = if samples == rank {
            let lambda = DVector::from_fn(rank, |l, _| q.column(l).dot(&gq.column(l)));
            (q, lambda)
        } else {
            let mut projected = q.tr_mul(&gq);
            let half: T = convert(0.5);
            projected = (&projected + projected.transpose()) * half;

            let eigen = SymmetricEigen::new(projected);
            let mut order = (0..samples).collect::<Vec<_>>();
            order.sort_by(|&a, &b| {
                let (a, b) = (eigen.eigenvalues[a], eigen.eigenvalues[b]);
                b.partial_cmp(&a).unwrap_or(Ordering::Equal)
            });
            order.truncate(rank);

            let rotation = DMatrix::from_fn(samples, rank, |r, c| eigen.eigenvectors[(r, order[c])]);
            let lambda = DVector::from_fn(rank, |l, _| eigen.eigenvalues[order[l]]);
            (q * rotation, lambda)
        };

        let largest = lambda.iter().fold(T::zero(), |acc, &l| acc.max(l));
        let floor = T::default_epsilon() * largest.max(T::one());
        let clamped = lambda.iter().filter(|&&l| !(l > floor)).count();
        if clamped > 0 {
            log::warn!("clamped {clamped} of {rank} kernel eigenvalues to {floor:?}");
            lambda.iter_mut().filter(|l| !(**l > floor)).for_each(|l| *l = floor);
        }

        let basis = Self::from_parts(q, lambda)?;
        log::debug!(
            "built rank {rank} kernel basis of {m} points, orthonormality error {:?}",
            basis.orthonormality_error()
        );
        Ok(basis)
    }

    /// Assembles a basis from its factors. `lambda` must be positive.
    pub fn from_parts(q: DMatrix<T>, lambda: DVector<T>) -> Result<Self> {
        if q.ncols() != lambda.len() || q.ncols() == 0 || q.ncols() > q.nrows() {
            return Err(Error::InvalidArgument("basis factors disagree in rank"));
        }
        if !lambda.iter().all(|&l| l.is_finite() && l > T::zero()) {
            return Err(Error::InvalidArgument("kernel eigenvalues must be positive"));
        }
        if !q.iter().all(|x| x.is_finite()) {
            return Err(Error::InvalidArgument("basis vectors must be finite"));
        }
        let lambda_inv = lambda.map(|l| l.recip());
        Ok(LowRankBasis {
            q,
            lambda,
            lambda_inv,
        })
    }

    /// Number of model points.
    #[inline]
    pub fn len(&self) -> usize {
        self.q.nrows()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.q.nrows() == 0
    }

    #[inline]
    pub fn rank(&self) -> usize {
        self.q.ncols()
    }

    #[inline]
    pub fn q(&self) -> &DMatrix<T> {
        &self.q
    }

    #[inline]
    pub fn lambda(&self) -> &DVector<T> {
        &self.lambda
    }

    #[inline]
    pub fn lambda_inv(&self) -> &DVector<T> {
        &self.lambda_inv
    }

    /// Largest entry of `|QᵀQ - I|`.
    pub fn orthonormality_error(&self) -> T {
        let gram = self.q.tr_mul(&self.q);
        let identity = DMatrix::<T>::identity(self.rank(), self.rank());
        (gram - identity).amax()
    }

    /// Dense `Q Λ Qᵀ`.
    pub fn approximation(&self) -> DMatrix<T> {
        let scaled = DMatrix::from_fn(self.len(), self.rank(), |r, c| self.q[(r, c)] * self.lambda[c]);
        scaled * self.q.transpose()
    }
}

/// Fills `out` with the kernel column of model point `rep`.
fn kernel_column<T: Real>(model: &PointSet<T>, rep: usize, factor: T, out: &mut [T]) {
    let columns = model.columns();
    for (j, value) in out.iter_mut().enumerate() {
        *value = (factor * distance_squared(columns, j, columns, rep)).exp();
    }
}

/// `G Q` without forming `G`. Every row is produced by one task, so the
/// result does not depend on the pool size.
fn kernel_product<T: Real>(model: &PointSet<T>, q: &DMatrix<T>, factor: T) -> DMatrix<T> {
    let (m, k) = q.shape();
    let columns = model.columns();
    let qt = q.transpose();
    let mut product_t = DMatrix::zeros(k, m);
    { product_t.as_mut_slice().par_chunks_mut(k).enumerate() }.for_each(|(i, row)| {
        for j in 0..m {
            let g = (factor * distance_squared(columns, i, columns, j)).exp();
            for (acc, &v) in row.iter_mut().zip(qt.column(j).iter()) {
                *acc += g * v;
            }
        }
    });
    product_t.transpose()
}
