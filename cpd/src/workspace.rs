use lrcpd_common::{PointSet, Real};

use crate::{
    basis::LowRankBasis,
    estep::{Responsibilities, SortedData},
    mstep::MStep,
};

/// Every buffer one registration needs, allocated up front and released as a
/// whole when the call returns.
#[derive(Debug, Clone)]
pub struct Workspace<'a, T: Real> {
    pub data: SortedData<T>,
    pub resp: Responsibilities<T>,
    pub mstep: MStep<'a, T>,
    /// Positions proposed by the current iteration.
    pub candidate: PointSet<T>,
    /// Last committed positions.
    pub current: PointSet<T>,
}

impl<'a, T: Real> Workspace<'a, T> {
    pub fn new(
        data: &PointSet<T>,
        model: &'a PointSet<T>,
        basis: &'a LowRankBasis<T>,
        lambda: T,
        min_mass: T,
    ) -> Self {
        let (n, m) = (data.len(), model.len());
        Workspace {
            data: SortedData::new(data),
            resp: Responsibilities::new(n, m),
            mstep: MStep::new(model, basis, lambda, min_mass),
            candidate: PointSet::zeros(m),
            current: model.clone(),
        }
    }

    /// Accepts the candidate positions.
    #[inline]
    pub fn commit(&mut self) {
        std::mem::swap(&mut self.current, &mut self.candidate);
    }
}
