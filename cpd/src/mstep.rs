use std::mem;

use lrcpd_common::{PointSet, Real};
use nalgebra::{convert, Cholesky, DMatrix, DVector};

use crate::{basis::LowRankBasis, driver::Guard, estep::Responsibilities};

/// Regularized update of the model displacement through the low-rank kernel.
///
/// Solves `(G̃ + λσ² diag(P1)⁻¹) W = diag(P1)⁻¹ PX - Y` with `G̃ = Q Λ Qᵀ`
/// by the Woodbury identity, so only a `k × k` system is factored, and moves
/// the model to `Y + G̃ W`.
#[derive(Debug, Clone)]
pub struct MStep<'a, T: Real> {
    model: &'a PointSet<T>,
    basis: &'a LowRankBasis<T>,
    lambda: T,
    min_mass: T,
    residual: DMatrix<T>,
    weighted: DMatrix<T>,
    scaled_q: DMatrix<T>,
    system: DMatrix<T>,
    projected: DMatrix<T>,
}

impl<'a, T: Real> MStep<'a, T> {
    /// `min_mass` is the responsibility mass below which a model point gets
    /// no pull towards the data.
    pub fn new(model: &'a PointSet<T>, basis: &'a LowRankBasis<T>, lambda: T, min_mass: T) -> Self {
        let (m, k) = (basis.len(), basis.rank());
        MStep {
            model,
            basis,
            lambda,
            min_mass,
            residual: DMatrix::zeros(m, 3),
            weighted: DMatrix::zeros(m, 3),
            scaled_q: DMatrix::zeros(m, k),
            system: DMatrix::zeros(k, k),
            projected: DMatrix::zeros(k, 3),
        }
    }

    /// Writes the updated positions to `out` and returns the regularization
    /// energy `λ/2 tr(Wᵀ G̃ W)` of the update.
    pub fn update(&mut self, resp: &Responsibilities<T>, sigma2: T, out: &mut PointSet<T>) -> Result<T, Guard> {
        let MStep {
            model,
            basis,
            lambda,
            min_mass,
            residual,
            weighted,
            scaled_q,
            system,
            projected,
        } = self;
        let (q, y) = (basis.q(), model.as_matrix());
        let (p1, px) = (&resp.p1, resp.px.as_matrix());

        let tf = (sigma2 * *lambda).recip();
        if !(tf.is_finite() && tf > T::zero()) {
            return Err(Guard::VarianceNotFinite);
        }

        for axis in 0..3 {
            for (j, &mass) in p1.iter().enumerate() {
                let r = if mass > *min_mass {
                    px[(j, axis)] / mass - y[(j, axis)]
                } else {
                    T::zero()
                };
                residual[(j, axis)] = r;
                weighted[(j, axis)] = tf * mass * r;
            }
        }

        scaled_q.copy_from(q);
        for mut column in scaled_q.column_iter_mut() {
            column.iter_mut().zip(p1).for_each(|(v, &mass)| *v *= mass);
        }
        assemble(system, q, scaled_q, basis.lambda_inv(), tf);
        projected.gemm_tr(tf, q, &*weighted, T::zero());

        let factor = mem::replace(system, DMatrix::zeros(0, 0));
        match Cholesky::new(factor) {
            Some(cholesky) => {
                cholesky.solve_mut(&mut *projected);
                *system = cholesky.unpack();
            }
            None => {
                log::warn!("low-rank system is not positive definite, solving by LU");
                *system = DMatrix::zeros(basis.rank(), basis.rank());
                assemble(system, q, scaled_q, basis.lambda_inv(), tf);
                if !system.clone().lu().solve_mut(&mut *projected) {
                    return Err(Guard::SingularSystem);
                }
            }
        }

        // W = tf P1 R - P1 Q z, kept in `weighted`.
        residual.gemm(T::one(), q, &*projected, T::zero());
        for axis in 0..3 {
            for (j, &mass) in p1.iter().enumerate() {
                weighted[(j, axis)] -= mass * residual[(j, axis)];
            }
        }

        projected.gemm_tr(T::one(), q, &*weighted, T::zero());
        let mut energy = T::zero();
        for (a, &l) in basis.lambda().iter().enumerate() {
            let mut row = projected.row_mut(a);
            energy += l * row.norm_squared();
            row *= l;
        }

        let out = out.as_matrix_mut();
        out.copy_from(y);
        out.gemm(T::one(), q, &*projected, T::one());
        Ok(energy * *lambda * convert(0.5))
    }
}

/// `tf Qᵀ P1 Q + Λ⁻¹`.
fn assemble<T: Real>(
    system: &mut DMatrix<T>,
    q: &DMatrix<T>,
    scaled_q: &DMatrix<T>,
    lambda_inv: &DVector<T>,
    tf: T,
) {
    system.gemm_tr(tf, q, scaled_q, T::zero());
    for (a, &inv) in lambda_inv.iter().enumerate() {
        system[(a, a)] += inv;
    }
}
