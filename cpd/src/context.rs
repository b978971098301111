use std::fmt;

use lrcpd_common::{PointSet, Real};

use crate::{
    basis::LowRankBasis,
    config::CpdConfig,
    driver::{Cancel, Registrar, Registration},
    error::{Error, Result},
};

/// A model point set with its kernel basis, registered against any number
/// of data sets.
#[derive(Debug, Clone)]
pub struct CpdContext<T: Real> {
    config: CpdConfig<T>,
    model: PointSet<T>,
    basis: LowRankBasis<T>,
}

impl<T: Real> CpdContext<T> {
    pub fn new(config: CpdConfig<T>, model: PointSet<T>) -> Result<Self> {
        let basis = LowRankBasis::from_config(&model, &config)?;
        Ok(CpdContext { config, model, basis })
    }

    /// Reuses a basis built earlier for `model`, for example one read back
    /// with [`LowRankBasis::read_from`].
    pub fn with_basis(config: CpdConfig<T>, model: PointSet<T>, basis: LowRankBasis<T>) -> Result<Self> {
        config.validate_model(model.len())?;
        if basis.len() != model.len() {
            return Err(Error::BasisMismatch {
                expected: basis.len(),
                found: model.len(),
            });
        }
        Ok(CpdContext { config, model, basis })
    }

    #[inline]
    pub fn config(&self) -> &CpdConfig<T> {
        &self.config
    }

    #[inline]
    pub fn model(&self) -> &PointSet<T> {
        &self.model
    }

    #[inline]
    pub fn basis(&self) -> &LowRankBasis<T> {
        &self.basis
    }

    pub fn register(&self, data: &PointSet<T>) -> Result<Registration<T>> {
        Registrar::new(&self.config).run(data, &self.model, &self.basis)
    }

    pub fn register_cancellable(&self, data: &PointSet<T>, cancel: Cancel) -> Result<Registration<T>> {
        { Registrar::new(&self.config).with_cancel(cancel) }.run(data, &self.model, &self.basis)
    }
}

impl<T: Real> fmt::Display for CpdContext<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let config = &self.config;
        write!(
            f,
            "CPD: {} model points, rank {}, lambda={}, beta={}, w={}, maxit={}, tol={}",
            self.model.len(),
            self.basis.rank(),
            config.lambda,
            config.beta,
            config.w,
            config.max_iterations,
            config.tolerance,
        )?;
        match config.initial_sigma2() {
            Some(sigma2) => write!(f, ", sigma2={sigma2}"),
            None => write!(f, ", sigma2=auto"),
        }
    }
}

#[cfg(test)]
mod tests {
    use nalgebra::Point3;

    use super::*;

    fn helix(len: usize) -> PointSet<f64> {
        { 0..len }
            .map(|i| {
                let t = i as f64 * 0.5;
                Point3::new(t.cos(), t.sin(), 0.1 * t)
            })
            .collect()
    }

    #[test]
    fn test_display() {
        let config = CpdConfig::default().with_lambda(1.).with_rank(4);
        let context = CpdContext::new(config, helix(20)).unwrap();
        assert_eq!(
            context.to_string(),
            "CPD: 20 model points, rank 4, lambda=1, beta=2, w=0.1, maxit=200, tol=0.005, sigma2=auto"
        );
        let config = config.with_sigma2_init(0.5);
        let context = CpdContext::with_basis(config, helix(20), context.basis().clone()).unwrap();
        assert!(context.to_string().ends_with("sigma2=0.5"));
    }

    #[test]
    fn test_basis_mismatch() {
        let config = CpdConfig::default();
        let context = CpdContext::new(config, helix(20)).unwrap();
        let basis = context.basis().clone();
        assert!(matches!(
            CpdContext::with_basis(config, helix(21), basis),
            Err(Error::BasisMismatch { expected: 20, found: 21 })
        ));
    }
}
